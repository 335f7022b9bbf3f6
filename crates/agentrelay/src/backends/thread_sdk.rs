//! Backend B — thread SDK normalizer (spec.md §4.7).
//!
//! Mirrors the shape of [`super::sdk_typed`]: the SDK is a boundary
//! collaborator ([`ThreadClient`]) exposing `start_thread`/`resume_thread`,
//! and this module only owns the item/turn → canonical-event translation
//! and the sandbox/approval/network permission mapping.

use futures::stream::BoxStream;
use futures::StreamExt;

use crate::adapter::{Adapter, AdapterItem, AdapterOptions, Capability};
use crate::cancel::CancelToken;
use crate::error::AgentRelayError;
use crate::event::{
    codes, DoneStatus, DonePayload, ErrorPayload, Event, EventType, ToolResultPayload,
    ToolResultStatus, ToolUsePayload, Usage,
};
use crate::synth::timestamp_ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalPolicy {
    Never,
    Untrusted,
    OnRequest,
}

#[derive(Debug, Clone)]
pub struct ThreadOptions {
    pub sandbox_mode: SandboxMode,
    pub approval_policy: ApprovalPolicy,
    pub network_access_enabled: bool,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone)]
pub enum ThreadContentBlock {
    OutputText(String),
    ToolCall { tool_name: String, tool_use_id: Option<String>, input: serde_json::Value },
    ToolResult { tool_use_id: String, tool_name: String, status: Option<String>, output: serde_json::Value },
    FileChange(serde_json::Value),
}

#[derive(Debug, Clone)]
pub enum ThreadEvent {
    ItemCompleted { top_level_text: Option<String>, content: Vec<ThreadContentBlock> },
    TurnCompleted { status: String, usage: ThreadUsage },
    Error { code: Option<String>, message: String },
}

#[derive(Debug, Clone, Default)]
pub struct ThreadUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub tool_uses: Option<u64>,
    pub total_cost_usd: Option<f64>,
}

/// The boundary a real thread-SDK binding implements.
pub trait ThreadClient: Send + Sync {
    fn start_thread(
        &self,
        prompt: String,
        options: ThreadOptions,
    ) -> BoxStream<'static, Result<ThreadEvent, AgentRelayError>>;

    /// `None` if this client cannot resume threads at all.
    fn resume_thread(
        &self,
        thread_id: &str,
        prompt: String,
        options: ThreadOptions,
    ) -> Option<BoxStream<'static, Result<ThreadEvent, AgentRelayError>>>;

    fn available(&self) -> bool;
}

pub struct ThreadSdkAdapter<C> {
    backend_id: String,
    client: C,
}

impl<C: ThreadClient> ThreadSdkAdapter<C> {
    pub fn new(backend_id: impl Into<String>, client: C) -> Self {
        ThreadSdkAdapter { backend_id: backend_id.into(), client }
    }
}

impl<C: ThreadClient + 'static> Adapter for ThreadSdkAdapter<C> {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn available(&self) -> bool {
        self.client.available()
    }

    fn run(&self, prompt: String, options: AdapterOptions) -> BoxStream<'static, AdapterItem> {
        let backend_id = self.backend_id.clone();
        let session_id = crate::event::new_session_id();
        let thread_options = to_thread_options(&options);

        let raw = match &options.resume_token {
            Some(token) => match self.client.resume_thread(token, prompt, thread_options) {
                Some(stream) => stream,
                None => {
                    let message = format!(
                        "backend {backend_id} does not support resuming thread {token}"
                    );
                    return futures::stream::once(async move {
                        Err(AgentRelayError::Process(message))
                    })
                    .boxed();
                }
            },
            None => self.client.start_thread(prompt, thread_options),
        };

        Box::pin(futures::stream::unfold(
            (raw, backend_id, session_id, Phase::Streaming),
            |(mut raw, backend_id, session_id, mut phase)| async move {
                loop {
                    match phase {
                        Phase::Finished => return None,
                        // Own our protocol violations (spec.md §7's error table lists
                        // backend B, not the driver, as the source of these codes): emit
                        // the specific error, then self-synthesize `done` next turn
                        // instead of leaving the driver's generic MISSING_DONE fallback
                        // to fire on top of it.
                        Phase::EmitDone { status } => {
                            let event = crate::synth::done_event(&backend_id, &session_id, status, 0);
                            return Some((Ok(event), (raw, backend_id, session_id, Phase::Finished)));
                        }
                        Phase::Streaming => match raw.next().await {
                            None => {
                                let error = crate::synth::error_event(
                                    &backend_id,
                                    &session_id,
                                    codes::MISSING_TURN_DONE,
                                    "protocol violation: thread ended without turn.completed",
                                    false,
                                );
                                return Some((
                                    Ok(error),
                                    (raw, backend_id, session_id, Phase::EmitDone { status: DoneStatus::Error }),
                                ));
                            }
                            Some(Err(err)) => {
                                let error = crate::synth::error_event(
                                    &backend_id,
                                    &session_id,
                                    codes::SDK_STREAM_ERROR,
                                    err.to_string(),
                                    false,
                                );
                                return Some((
                                    Ok(error),
                                    (raw, backend_id, session_id, Phase::EmitDone { status: DoneStatus::Error }),
                                ));
                            }
                            Some(Ok(thread_event)) => {
                                let translated = translate_thread_event(&backend_id, &session_id, thread_event);
                                if translated.is_empty() {
                                    phase = Phase::Streaming;
                                    continue;
                                }
                                let mut iter = translated.into_iter();
                                let first = iter.next().unwrap();
                                let next_phase =
                                    if matches!(first.event_type, EventType::Done) { Phase::Finished } else { Phase::Streaming };
                                let rest: Vec<_> = iter.collect();
                                let raw = if rest.is_empty() {
                                    raw
                                } else {
                                    futures::stream::iter(rest.into_iter().map(Ok)).chain(raw).boxed()
                                };
                                return Some((Ok(first), (raw, backend_id, session_id, next_phase)));
                            }
                        },
                    }
                }
            },
        ))
    }
}

/// Drives the terminal-emission state of [`ThreadSdkAdapter::run`]'s unfold,
/// mirroring [`super::sdk_typed::Phase`].
enum Phase {
    Streaming,
    EmitDone { status: DoneStatus },
    Finished,
}

/// spec.md §4.7 permission mapping table.
pub fn to_thread_options(options: &AdapterOptions) -> ThreadOptions {
    let p = &options.permissions;
    let any_deny = p.file_write == Capability::Deny || p.shell_execute == Capability::Deny || p.network_access == Capability::Deny;
    let sandbox_mode = if any_deny {
        SandboxMode::ReadOnly
    } else if p.file_write == Capability::Allow && p.shell_execute == Capability::Allow {
        SandboxMode::DangerFullAccess
    } else {
        SandboxMode::WorkspaceWrite
    };

    let all_allow = p.file_write == Capability::Allow && p.shell_execute == Capability::Allow && p.network_access == Capability::Allow;
    let any_ask = p.file_write == Capability::Ask || p.shell_execute == Capability::Ask || p.network_access == Capability::Ask;
    let approval_policy = if all_allow {
        ApprovalPolicy::Never
    } else if any_ask {
        ApprovalPolicy::Untrusted
    } else {
        ApprovalPolicy::OnRequest
    };

    // Lossy by design (spec.md §9): `ask` collapses to disabled.
    let network_access_enabled = p.network_access == Capability::Allow;

    ThreadOptions { sandbox_mode, approval_policy, network_access_enabled, cancel: options.cancel.clone() }
}

fn translate_thread_event(backend_id: &str, session_id: &str, event: ThreadEvent) -> Vec<Event> {
    let timestamp = timestamp_ms();
    match event {
        ThreadEvent::ItemCompleted { top_level_text, content } => {
            let has_content_text = content.iter().any(|b| matches!(b, ThreadContentBlock::OutputText(_)));
            let mut events: Vec<Event> = Vec::new();
            // Dedup rule (spec.md §4.7): top-level text only if no content-block text.
            if !has_content_text {
                if let Some(text) = top_level_text {
                    events.push(Event::new(
                        EventType::Text,
                        backend_id,
                        session_id,
                        timestamp,
                        crate::event::TextPayload { text },
                    ));
                }
            }
            for block in content {
                events.push(translate_block(backend_id, session_id, block));
            }
            events
        }
        ThreadEvent::TurnCompleted { status, usage } => vec![Event::new(
            EventType::Done,
            backend_id,
            session_id,
            timestamp,
            DonePayload {
                status: map_status(&status),
                final_text: None,
                usage: Usage {
                    input_tokens: usage.input_tokens.unwrap_or(0),
                    output_tokens: usage.output_tokens.unwrap_or(0),
                    tool_uses: usage.tool_uses.unwrap_or(0),
                    total_cost_usd: usage.total_cost_usd,
                },
                duration_ms: 0,
            },
        )],
        ThreadEvent::Error { code, message } => vec![Event::new(
            EventType::Error,
            backend_id,
            session_id,
            timestamp,
            ErrorPayload { code, message, recoverable: false },
        )],
    }
}

fn translate_block(backend_id: &str, session_id: &str, block: ThreadContentBlock) -> Event {
    let timestamp = timestamp_ms();
    match block {
        ThreadContentBlock::OutputText(text) => {
            Event::new(EventType::Text, backend_id, session_id, timestamp, crate::event::TextPayload { text })
        }
        ThreadContentBlock::ToolCall { tool_name, tool_use_id, input } => Event::new(
            EventType::ToolUse,
            backend_id,
            session_id,
            timestamp,
            ToolUsePayload {
                tool_name,
                tool_use_id: tool_use_id.unwrap_or_else(crate::event::new_session_id),
                input,
                description: None,
            },
        ),
        ThreadContentBlock::ToolResult { tool_use_id, tool_name, status, output } => {
            let status = match status.as_deref() {
                Some("denied") => ToolResultStatus::Denied,
                Some("error") => ToolResultStatus::Error,
                _ => ToolResultStatus::Success,
            };
            Event::new(
                EventType::ToolResult,
                backend_id,
                session_id,
                timestamp,
                ToolResultPayload { tool_use_id, tool_name, status, output, duration_ms: None },
            )
        }
        ThreadContentBlock::FileChange(record) => Event::new(
            crate::event::EventType::extension(backend_id, "file_change"),
            backend_id,
            session_id,
            timestamp,
            record,
        ),
    }
}

fn map_status(status: &str) -> DoneStatus {
    match status {
        "success" | "completed" | "ok" => DoneStatus::Success,
        "interrupted" | "cancelled" | "aborted" => DoneStatus::Interrupted,
        "max_turns" | "maxturns" => DoneStatus::MaxTurns,
        "max_budget" | "budget_exceeded" => DoneStatus::MaxBudget,
        "error" | "failed" => DoneStatus::Error,
        _ => DoneStatus::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PermissionPolicy;

    fn options_with(p: PermissionPolicy) -> AdapterOptions {
        AdapterOptions { permissions: p, ..Default::default() }
    }

    #[test]
    fn any_deny_maps_to_read_only_sandbox() {
        let opts = options_with(PermissionPolicy { file_write: Capability::Deny, shell_execute: Capability::Allow, network_access: Capability::Allow });
        let thread = to_thread_options(&opts);
        assert_eq!(thread.sandbox_mode, SandboxMode::ReadOnly);
    }

    #[test]
    fn full_allow_maps_to_danger_full_access() {
        let opts = options_with(PermissionPolicy { file_write: Capability::Allow, shell_execute: Capability::Allow, network_access: Capability::Ask });
        let thread = to_thread_options(&opts);
        assert_eq!(thread.sandbox_mode, SandboxMode::DangerFullAccess);
    }

    #[test]
    fn mixed_otherwise_maps_to_workspace_write() {
        let opts = options_with(PermissionPolicy { file_write: Capability::Allow, shell_execute: Capability::Ask, network_access: Capability::Ask });
        let thread = to_thread_options(&opts);
        assert_eq!(thread.sandbox_mode, SandboxMode::WorkspaceWrite);
    }

    #[test]
    fn approval_policy_table() {
        let all_allow = options_with(PermissionPolicy { file_write: Capability::Allow, shell_execute: Capability::Allow, network_access: Capability::Allow });
        assert_eq!(to_thread_options(&all_allow).approval_policy, ApprovalPolicy::Never);

        let any_ask = options_with(PermissionPolicy { file_write: Capability::Allow, shell_execute: Capability::Ask, network_access: Capability::Allow });
        assert_eq!(to_thread_options(&any_ask).approval_policy, ApprovalPolicy::Untrusted);

        let deny_no_ask = options_with(PermissionPolicy { file_write: Capability::Deny, shell_execute: Capability::Deny, network_access: Capability::Deny });
        assert_eq!(to_thread_options(&deny_no_ask).approval_policy, ApprovalPolicy::OnRequest);
    }

    #[test]
    fn network_access_is_lossy_for_ask() {
        let ask = options_with(PermissionPolicy { file_write: Capability::Ask, shell_execute: Capability::Ask, network_access: Capability::Ask });
        assert!(!to_thread_options(&ask).network_access_enabled);
        let allow = options_with(PermissionPolicy { file_write: Capability::Ask, shell_execute: Capability::Ask, network_access: Capability::Allow });
        assert!(to_thread_options(&allow).network_access_enabled);
    }

    #[test]
    fn top_level_text_is_suppressed_when_content_block_text_exists() {
        let events = translate_thread_event(
            "codex",
            "sess",
            ThreadEvent::ItemCompleted {
                top_level_text: Some("duplicate".into()),
                content: vec![ThreadContentBlock::OutputText("hi".into())],
            },
        );
        assert_eq!(events.len(), 1);
        let payload: crate::event::TextPayload = serde_json::from_value(events[0].payload.clone()).unwrap();
        assert_eq!(payload.text, "hi");
    }

    #[test]
    fn file_change_becomes_extension_event() {
        let events = translate_thread_event(
            "codex",
            "sess",
            ThreadEvent::ItemCompleted {
                top_level_text: None,
                content: vec![ThreadContentBlock::FileChange(serde_json::json!({"path": "a.rs"}))],
            },
        );
        assert_eq!(events[0].event_type.as_str(), "codex:file_change");
    }

    struct StubClient {
        messages: std::sync::Mutex<Option<Vec<Result<ThreadEvent, AgentRelayError>>>>,
    }

    impl ThreadClient for StubClient {
        fn start_thread(&self, _prompt: String, _options: ThreadOptions) -> BoxStream<'static, Result<ThreadEvent, AgentRelayError>> {
            let messages = self.messages.lock().unwrap().take().unwrap_or_default();
            futures::stream::iter(messages).boxed()
        }

        fn resume_thread(&self, _thread_id: &str, _prompt: String, _options: ThreadOptions) -> Option<BoxStream<'static, Result<ThreadEvent, AgentRelayError>>> {
            None
        }

        fn available(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn exhaustion_without_turn_completed_self_synthesizes_one_error_done_pair() {
        let adapter = ThreadSdkAdapter::new("codex", StubClient { messages: std::sync::Mutex::new(Some(vec![])) });
        let events: Vec<Event> = adapter
            .run("hi".into(), AdapterOptions::default())
            .filter_map(|item| async move { item.ok() })
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        let payload: ErrorPayload = serde_json::from_value(events[0].payload.clone()).unwrap();
        assert_eq!(payload.code.as_deref(), Some(codes::MISSING_TURN_DONE));
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn stream_exception_self_synthesizes_sdk_stream_error_and_done() {
        let adapter = ThreadSdkAdapter::new(
            "codex",
            StubClient { messages: std::sync::Mutex::new(Some(vec![Err(AgentRelayError::Process("boom".into()))])) },
        );
        let events: Vec<Event> = adapter
            .run("hi".into(), AdapterOptions::default())
            .filter_map(|item| async move { item.ok() })
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        let payload: ErrorPayload = serde_json::from_value(events[0].payload.clone()).unwrap();
        assert_eq!(payload.code.as_deref(), Some(codes::SDK_STREAM_ERROR));
        assert!(events[1].is_terminal());
    }
}
