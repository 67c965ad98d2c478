/// LM adapter layer.
///
/// One provider ships today: the Anthropic Messages API. The bridge only
/// sees the [`LmProvider`](switchboard_types::traits::LmProvider) trait, so
/// adding a second vendor is a new module here, not a bridge change.
pub mod anthropic;

pub use anthropic::AnthropicAdapter;
