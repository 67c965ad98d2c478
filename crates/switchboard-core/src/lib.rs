/// Core orchestration for the Switchboard bridge.
///
/// - **Bridge**: the per-request agentic loop (LM ↔ tools)
/// - **Permissions**: pure resolution of each user's tool surface
/// - **Rate limiter**: sliding-window admission per role ceiling
/// - **Threads**: bounded in-process conversation context
/// - **LLM**: the Anthropic Messages API adapter with prompt caching
pub mod bridge;
pub mod llm;
pub mod permissions;
pub mod rate_limiter;
pub mod threads;

pub use bridge::{Bridge, BridgeDeps};
