//! The agentic bridge loop.
//!
//! One request flows: rate-limit admission → permission resolution →
//! iterative LM loop with tool dispatch → thread persistence → audit.
//! Tool-level problems are injected back into the conversation as results
//! so the LM can re-plan; protocol and infrastructure failures terminate
//! the request. Every terminal state — success, warning, error, or
//! rate-limited rejection — writes exactly one audit record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchboard_types::config::{ConfigSnapshot, RateCeiling};
use switchboard_types::errors::SwitchboardError;
use switchboard_types::messages::{
    tags, AllowedToolsView, AuditRecord, ChatRequest, ChatResponse, LmMessage, LmRole,
    MessagePayload, RequestStatus, SystemContext, TokenUsage, ToolOutcome, ToolUseRequest,
    ToolUseResult,
};
use switchboard_types::traits::{AuditSink, LmProvider, McpInvoker};

use crate::permissions::PermissionResolver;
use crate::rate_limiter::RateLimiter;
use crate::threads::ThreadStore;

/// Ceiling applied when a request's role is missing from the role table.
/// Config validation rejects that, so this only guards skew between a
/// cached profile and a freshly reloaded snapshot.
const FALLBACK_CEILING: RateCeiling = RateCeiling::Limited(30);

/// External collaborators the bridge drives.
pub struct BridgeDeps {
    pub llm: Arc<dyn LmProvider>,
    pub mcp: Arc<dyn McpInvoker>,
    pub audit: Arc<dyn AuditSink>,
}

/// The orchestration engine: one instance serves many concurrent requests.
pub struct Bridge {
    llm: Arc<dyn LmProvider>,
    mcp: Arc<dyn McpInvoker>,
    audit: Arc<dyn AuditSink>,
    resolver: PermissionResolver,
    limiter: RateLimiter,
    threads: ThreadStore,
    config: watch::Receiver<ConfigSnapshot>,
}

/// Mutable progress of one request. Lives outside the deadline future so
/// tokens spent before a timeout still reach the audit record.
#[derive(Default)]
struct RunState {
    lm_calls: u32,
    /// Loop rounds that dispatched tools.
    rounds: u32,
    tool_calls: u32,
    tools_used: Vec<String>,
    mcps_accessed: Vec<String>,
    usage: TokenUsage,
    /// Text accompanying the most recent tool-use reply, kept as the
    /// best-effort answer if the iteration ceiling is hit.
    last_text: String,
}

impl RunState {
    /// Reported iteration count: tool rounds, with a plain answer counting
    /// as one round. Always in `[1, max_iterations]`.
    fn iterations(&self) -> u32 {
        self.rounds.max(1)
    }
}

struct LoopExit {
    answer: String,
    status: RequestStatus,
    warning: Option<String>,
}

impl Bridge {
    pub fn new(config: watch::Receiver<ConfigSnapshot>, deps: BridgeDeps) -> Self {
        let limits = config.borrow().limits;
        Self {
            llm: deps.llm,
            mcp: deps.mcp,
            audit: deps.audit,
            resolver: PermissionResolver::new(Duration::from_secs(
                limits.permission_cache_ttl_secs,
            )),
            limiter: RateLimiter::new(),
            threads: ThreadStore::new(
                limits.thread_max_messages,
                Duration::from_secs(limits.thread_ttl_secs),
            ),
            config,
        }
    }

    /// Evict idle conversation threads. Called by the daemon on a timer.
    pub async fn sweep_threads(&self) -> usize {
        self.threads.sweep().await
    }

    /// Drop cached permission views. Called by the daemon on config reload.
    pub async fn invalidate_permissions(&self) {
        self.resolver.invalidate(None).await;
    }

    /// Handle one request end to end. Never panics, never skips the audit
    /// record.
    pub async fn handle_request(&self, request: ChatRequest) -> ChatResponse {
        let started = Instant::now();
        let snapshot = self.config.borrow().clone();

        // Admission first: a rejected request must cost no LM or MCP work.
        let profile_for_limit = crate::permissions::resolve_profile(&snapshot, &request.user_id);
        let ceiling = snapshot
            .role(&profile_for_limit.role)
            .map(|r| r.requests_per_hour)
            .unwrap_or(FALLBACK_CEILING);

        if let Err(denied) = self.limiter.admit(&request.user_id, ceiling).await {
            info!(user = %request.user_id, "request rejected by rate limiter");
            let minutes = denied.retry_after_secs.div_ceil(60);
            let answer = format!(
                "You have used {}/{} requests in the last hour. The limit resets in about {} minute{}.",
                denied.current,
                denied.limit,
                minutes,
                if minutes == 1 { "" } else { "s" }
            );
            let state = RunState::default();
            self.emit_audit(
                &request,
                &state,
                RequestStatus::Error,
                Some(tags::RATE_LIMITED.to_string()),
                0.0,
                started,
            );
            return ChatResponse {
                success: false,
                answer,
                tool_calls: 0,
                tools_used: Vec::new(),
                iterations: 0,
                warning: Some(tags::RATE_LIMITED.to_string()),
                cost_estimate: 0.0,
                usage: TokenUsage::default(),
            };
        }

        // Snapshot the tool surface and the user's view of it. Later config
        // or health changes do not retarget this request.
        let catalogs = self.mcp.catalog_snapshot().await;
        let (profile, view) = self
            .resolver
            .allowed_view(&snapshot, &catalogs, &request.user_id)
            .await;
        if profile.is_default {
            warn!(
                user = %request.user_id,
                role = %profile.role,
                auto_provisioning = snapshot.users.auto_provisioning,
                "unknown user, using default principal"
            );
        }

        let system = self.llm.build_system_context(&view, &profile);

        let mut state = RunState::default();
        let deadline = Duration::from_secs(snapshot.limits.request_timeout_secs);
        let result = tokio::time::timeout(
            deadline,
            self.run_loop(&snapshot, &view, &system, &request, &mut state),
        )
        .await;

        let exit = match result {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => {
                warn!(user = %request.user_id, error = %e, "request failed");
                LoopExit {
                    answer: "The language model could not be reached. Please try again shortly."
                        .to_string(),
                    status: RequestStatus::Error,
                    warning: Some(tags::LM_ERROR.to_string()),
                }
            }
            Err(_) => {
                warn!(
                    user = %request.user_id,
                    timeout_secs = snapshot.limits.request_timeout_secs,
                    "request deadline exceeded"
                );
                LoopExit {
                    answer: "The request took too long and was cancelled. Please try again."
                        .to_string(),
                    status: RequestStatus::Error,
                    warning: Some(tags::TIMEOUT.to_string()),
                }
            }
        };

        // Thread persistence is conversational sugar on normal exits only.
        if exit.status != RequestStatus::Error {
            if let Some(conversation_id) = &request.conversation_id {
                self.threads
                    .append(conversation_id, LmRole::User, request.message.clone())
                    .await;
                self.threads
                    .append(conversation_id, LmRole::Assistant, exit.answer.clone())
                    .await;
            }
        }

        let cost = self.llm.cost(&state.usage);
        self.emit_audit(
            &request,
            &state,
            exit.status,
            exit.warning.clone(),
            cost,
            started,
        );

        ChatResponse {
            success: exit.status != RequestStatus::Error,
            answer: exit.answer,
            tool_calls: state.tool_calls,
            tools_used: state.tools_used.clone(),
            iterations: state.iterations(),
            warning: exit.warning,
            cost_estimate: cost,
            usage: state.usage,
        }
    }

    /// The iteration loop: invoke the LM, dispatch requested tools, feed
    /// results back, until a final answer or the iteration ceiling.
    async fn run_loop(
        &self,
        snapshot: &ConfigSnapshot,
        view: &AllowedToolsView,
        system: &SystemContext,
        request: &ChatRequest,
        state: &mut RunState,
    ) -> Result<LoopExit, SwitchboardError> {
        let max_iterations = snapshot.limits.max_iterations;

        let mut messages = Vec::new();
        if let Some(conversation_id) = &request.conversation_id {
            for (role, text) in self.threads.recent(conversation_id).await {
                messages.push(LmMessage {
                    role,
                    payload: MessagePayload::Text(text),
                });
            }
        }
        messages.push(LmMessage::user_text(request.message.clone()));

        loop {
            if state.lm_calls >= max_iterations {
                info!(
                    user = %request.user_id,
                    rounds = state.rounds,
                    "iteration ceiling reached"
                );
                let answer = if state.last_text.is_empty() {
                    "I reached the iteration limit for this request before finishing. \
                     Try a narrower question."
                        .to_string()
                } else {
                    state.last_text.clone()
                };
                return Ok(LoopExit {
                    answer,
                    status: RequestStatus::Warning,
                    warning: Some(tags::MAX_ITERATIONS_REACHED.to_string()),
                });
            }

            state.lm_calls += 1;
            let reply = self.llm.invoke(system, &messages, view).await?;
            state.usage.accumulate(reply.usage);

            if reply.is_final() {
                debug!(
                    user = %request.user_id,
                    lm_calls = state.lm_calls,
                    tool_calls = state.tool_calls,
                    "final answer produced"
                );
                return Ok(LoopExit {
                    answer: reply.text,
                    status: RequestStatus::Success,
                    warning: None,
                });
            }

            state.rounds += 1;
            state.last_text = reply.text.clone();

            let results = self
                .dispatch_round(view, &reply.tool_requests, state)
                .await;

            messages.push(LmMessage {
                role: LmRole::Assistant,
                payload: MessagePayload::ToolUse {
                    text: reply.text,
                    requests: reply.tool_requests,
                },
            });
            messages.push(LmMessage {
                role: LmRole::User,
                payload: MessagePayload::ToolResults(results),
            });
        }
    }

    /// Dispatch one round of tool requests.
    ///
    /// Permitted requests run concurrently; denied ones become immediate
    /// "not permitted" results. The returned vector pairs 1:1 with the
    /// requests, in the order the LM issued them.
    async fn dispatch_round(
        &self,
        view: &AllowedToolsView,
        requests: &[ToolUseRequest],
        state: &mut RunState,
    ) -> Vec<ToolUseResult> {
        let dispatches = requests.iter().map(|req| async {
            match view.get(&req.name) {
                Some(tool) => {
                    debug!(tool = %tool.display_name(), "dispatching tool call");
                    let outcome = self
                        .mcp
                        .call_tool(&tool.mcp, &tool.name, req.arguments.clone())
                        .await;
                    (
                        ToolUseResult {
                            request_id: req.id.clone(),
                            name: req.name.clone(),
                            outcome,
                        },
                        Some((tool.display_name(), tool.mcp.clone())),
                    )
                }
                None => {
                    // Includes unqualified names: a bare tool name has no
                    // (mcp, tool) identity and is never in the view.
                    info!(tool = %req.name, "tool call denied");
                    (
                        ToolUseResult {
                            request_id: req.id.clone(),
                            name: req.name.clone(),
                            outcome: ToolOutcome::failed(format!(
                                "Tool '{}' is not permitted for this user.",
                                req.name
                            )),
                        },
                        None,
                    )
                }
            }
        });

        let mut results = Vec::with_capacity(requests.len());
        for (result, executed) in futures::future::join_all(dispatches).await {
            if let Some((display_name, mcp_name)) = executed {
                state.tool_calls += 1;
                state.tools_used.push(display_name);
                if !state.mcps_accessed.contains(&mcp_name) {
                    state.mcps_accessed.push(mcp_name);
                }
            }
            results.push(result);
        }
        results
    }

    /// Build and hand off the request's single audit record.
    fn emit_audit(
        &self,
        request: &ChatRequest,
        state: &RunState,
        status: RequestStatus,
        warning: Option<String>,
        cost: f64,
        started: Instant,
    ) {
        let record = AuditRecord {
            id: Uuid::new_v4(),
            user_id: request.user_id.clone(),
            message: request.message.clone(),
            iterations: if status == RequestStatus::Error && state.lm_calls == 0 {
                0
            } else {
                state.iterations()
            },
            tool_calls_count: state.tool_calls,
            tools_used: state.tools_used.clone(),
            mcps_accessed: state.mcps_accessed.clone(),
            tokens_input: state.usage.input_tokens,
            tokens_output: state.usage.output_tokens,
            tokens_cached: state.usage.cached_tokens,
            cost_estimate: cost,
            status,
            warning,
            duration_ms: started.elapsed().as_millis() as u64,
            source_tag: request
                .source
                .as_ref()
                .and_then(|s| s.source_tag.clone()),
            conversation_ref: request.conversation_id.clone(),
            created_at: Utc::now(),
        };
        self.audit.record(record);
    }
}
