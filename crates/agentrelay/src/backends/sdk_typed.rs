//! Backend A — typed SDK normalizer (spec.md §4.6).
//!
//! The SDK itself is an external collaborator (spec.md §1 "the concrete SDK
//! and CLI binaries... described as boundary contracts, not implemented"):
//! this module defines the [`SdkClient`] boundary trait a real SDK binding
//! would implement, and translates its typed messages into canonical
//! events. Grounded in `claude-agent::types::Message`'s tagged-union shape,
//! generalized from JSON deserialization to an in-process trait boundary
//! since the typed SDK is assumed to already hand back native objects
//! rather than JSON text.

use futures::stream::BoxStream;
use futures::StreamExt;

use crate::adapter::{Adapter, AdapterItem, AdapterOptions, Capability};
use crate::cancel::CancelToken;
use crate::error::AgentRelayError;
use crate::event::{
    codes, DoneStatus, DonePayload, ErrorPayload, Event, EventType, InitPayload, TextDeltaPayload,
    TextPayload, ThinkingPayload, ToolResultPayload, ToolResultStatus, ToolUsePayload, Usage,
};
use crate::synth::timestamp_ms;

/// A content block inside an `assistant` message (spec.md §4.6).
#[derive(Debug, Clone)]
pub enum SdkContentBlock {
    Text(String),
    Thinking(String),
    ToolUse {
        tool_name: String,
        tool_use_id: Option<String>,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        status: Option<String>,
        is_error: Option<bool>,
        output: serde_json::Value,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SdkUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub tool_uses: Option<u64>,
    pub total_cost_usd: Option<f64>,
}

/// One typed message from the SDK's native stream.
#[derive(Debug, Clone)]
pub enum SdkMessage {
    System { model: String, working_directory: String, tools: Vec<String> },
    Assistant { content: Vec<SdkContentBlock> },
    StreamDelta { text: String },
    Result { status: String, usage: SdkUsage, final_text: Option<String> },
    Error { code: Option<String>, message: String, recoverable: Option<bool> },
}

/// The permission-mode surface the SDK accepts (spec.md §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkPermissionMode {
    Bypass,
    AcceptEdits,
    /// `Default` mode pairs with a per-tool callback; callers evaluate it
    /// via [`classify_and_decide`].
    Default,
}

/// The boundary a real typed-SDK binding implements. Not implemented here —
/// this crate only defines the contract and the translation that consumes
/// it.
pub trait SdkClient: Send + Sync {
    fn query(
        &self,
        prompt: String,
        permission_mode: SdkPermissionMode,
        cancel: CancelToken,
    ) -> BoxStream<'static, Result<SdkMessage, AgentRelayError>>;

    fn available(&self) -> bool;
}

pub struct SdkTypedAdapter<C> {
    backend_id: String,
    client: C,
}

impl<C: SdkClient> SdkTypedAdapter<C> {
    pub fn new(backend_id: impl Into<String>, client: C) -> Self {
        SdkTypedAdapter { backend_id: backend_id.into(), client }
    }
}

impl<C: SdkClient + 'static> Adapter for SdkTypedAdapter<C> {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn available(&self) -> bool {
        self.client.available()
    }

    fn run(&self, prompt: String, options: AdapterOptions) -> BoxStream<'static, AdapterItem> {
        let backend_id = self.backend_id.clone();
        let session_id = crate::event::new_session_id();
        let permission_mode = permission_mode_for(&options);
        let raw = self.client.query(prompt, permission_mode, options.cancel.clone());

        Box::pin(futures::stream::unfold(
            (raw, backend_id, session_id, Phase::Streaming),
            move |(mut raw, backend_id, session_id, mut phase)| async move {
                loop {
                    match phase {
                        Phase::Finished => return None,
                        // Own our protocol violations (spec.md §7's error table lists
                        // backend A, not the driver, as the source of these codes): emit
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
                                    codes::MISSING_RESULT,
                                    "protocol violation: SDK stream ended without a result message",
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
                            Some(Ok(message)) => {
                                let translated = translate_message(&backend_id, &session_id, message);
                                if translated.is_empty() {
                                    phase = Phase::Streaming;
                                    continue;
                                }
                                // Emit one at a time: stash the rest by re-entrancy isn't
                                // available in `unfold`, so flatten via a nested buffer.
                                let mut iter = translated.into_iter();
                                let first = iter.next().unwrap();
                                let next_phase =
                                    if matches!(first.event_type, EventType::Done) { Phase::Finished } else { Phase::Streaming };
                                // Any remaining events from this one message are pushed
                                // back by recursing with a pre-seeded single-shot queue.
                                let rest: Vec<_> = iter.collect();
                                if rest.is_empty() {
                                    return Some((Ok(first), (raw, backend_id, session_id, next_phase)));
                                }
                                // Re-inject remaining translated events ahead of the raw
                                // stream via a small prepend adapter.
                                let prefixed = futures::stream::iter(rest.into_iter().map(Ok))
                                    .chain(raw)
                                    .boxed();
                                return Some((Ok(first), (prefixed, backend_id, session_id, next_phase)));
                            }
                        },
                    }
                }
            },
        ))
    }
}

/// Drives the terminal-emission state of [`SdkTypedAdapter::run`]'s unfold:
/// `Streaming` until a protocol violation or a `result` message is seen,
/// `EmitDone` to self-synthesize the matching `done{error}` on the next pull,
/// `Finished` once a terminal event of either kind has been produced.
enum Phase {
    Streaming,
    EmitDone { status: DoneStatus },
    Finished,
}

/// spec.md §4.6 permission mapping.
pub fn permission_mode_for(options: &AdapterOptions) -> SdkPermissionMode {
    let p = &options.permissions;
    if p.file_write == Capability::Allow && p.shell_execute == Capability::Allow && p.network_access == Capability::Allow {
        SdkPermissionMode::Bypass
    } else if p.file_write == Capability::Allow && p.shell_execute == Capability::Ask && p.network_access == Capability::Ask {
        SdkPermissionMode::AcceptEdits
    } else {
        SdkPermissionMode::Default
    }
}

/// The per-tool callback `Default` mode pairs with: classifies a tool name
/// into a capability and looks up the caller's decision for it. Returns
/// `None` for "deferred" (ask, or an unrecognized tool).
pub fn classify_and_decide(tool_name: &str, options: &AdapterOptions) -> Option<bool> {
    let capability = match tool_name {
        "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => options.permissions.file_write,
        "Bash" => options.permissions.shell_execute,
        "WebFetch" => options.permissions.network_access,
        _ => return None,
    };
    match capability {
        Capability::Allow => Some(true),
        Capability::Deny => Some(false),
        Capability::Ask => None,
    }
}

fn translate_message(backend_id: &str, session_id: &str, message: SdkMessage) -> Vec<Event> {
    let timestamp = timestamp_ms();
    match message {
        SdkMessage::System { model, working_directory, tools } => vec![Event::new(
            EventType::Init,
            backend_id,
            session_id,
            timestamp,
            InitPayload { model, working_directory, tool_list: tools, capabilities: None },
        )],
        SdkMessage::StreamDelta { text } => vec![Event::new(
            EventType::TextDelta,
            backend_id,
            session_id,
            timestamp,
            TextDeltaPayload { delta: text },
        )],
        SdkMessage::Assistant { content } => content
            .into_iter()
            .map(|block| translate_block(backend_id, session_id, block))
            .collect(),
        SdkMessage::Result { status, usage, final_text } => {
            vec![Event::new(
                EventType::Done,
                backend_id,
                session_id,
                timestamp,
                DonePayload {
                    status: map_status(&status),
                    final_text,
                    usage: Usage {
                        input_tokens: usage.input_tokens.unwrap_or(0),
                        output_tokens: usage.output_tokens.unwrap_or(0),
                        tool_uses: usage.tool_uses.unwrap_or(0),
                        total_cost_usd: usage.total_cost_usd,
                    },
                    duration_ms: 0,
                },
            )]
        }
        SdkMessage::Error { code, message, recoverable } => vec![Event::new(
            EventType::Error,
            backend_id,
            session_id,
            timestamp,
            ErrorPayload { code, message, recoverable: recoverable.unwrap_or(false) },
        )],
    }
}

fn translate_block(backend_id: &str, session_id: &str, block: SdkContentBlock) -> Event {
    let timestamp = timestamp_ms();
    match block {
        SdkContentBlock::Text(text) => {
            Event::new(EventType::Text, backend_id, session_id, timestamp, TextPayload { text })
        }
        SdkContentBlock::Thinking(summary) => {
            Event::new(EventType::Thinking, backend_id, session_id, timestamp, ThinkingPayload { summary })
        }
        SdkContentBlock::ToolUse { tool_name, tool_use_id, input } => Event::new(
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
        SdkContentBlock::ToolResult { tool_use_id, tool_name, status, is_error, output } => {
            let status = match status.as_deref() {
                Some("denied") => ToolResultStatus::Denied,
                Some("error") => ToolResultStatus::Error,
                Some("success") => ToolResultStatus::Success,
                _ => {
                    if is_error.unwrap_or(false) {
                        ToolResultStatus::Error
                    } else {
                        ToolResultStatus::Success
                    }
                }
            };
            Event::new(
                EventType::ToolResult,
                backend_id,
                session_id,
                timestamp,
                ToolResultPayload { tool_use_id, tool_name, status, output, duration_ms: None },
            )
        }
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
