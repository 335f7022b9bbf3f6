//! Backend D — SSE with managed server (spec.md §4.9).
//!
//! The managed-server half (spawn, readiness wait, SIGTERM shutdown) is
//! grounded in `sdlc-server::subprocess::spawn_process`, generalized from a
//! broadcast-fanout job runner to a single owned child whose readiness and
//! exit races against an SSE stream. The event-translation half (dispatch on
//! SSE event name, then on part type) is grounded in the OpenCode daemon
//! adapter's `adapt`/`adapt_part_updated` dispatch structure.

use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::adapter::{Adapter, AdapterItem, AdapterOptions};
use crate::error::AgentRelayError;
use crate::event::{
    codes, DoneStatus, DonePayload, ErrorPayload, Event, EventType, PermissionRequestPayload,
    TextDeltaPayload, TextPayload, ThinkingPayload, ToolResultPayload, ToolResultStatus,
    ToolUsePayload, Usage,
};
use crate::synth::timestamp_ms;

const READINESS_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(1500);

/// One message off the SSE connection, already filtered to this adapter's
/// session by the [`SseSource`] implementation.
#[derive(Debug, Clone)]
pub enum SseMessage {
    PartUpdated { part_type: String, delta: Option<String>, text: Option<String> },
    PermissionUpdated { tool_name: String, tool_use_id: String, input: serde_json::Value },
    PermissionReplied { tool_use_id: String, tool_name: String, decision: String, reason: Option<String> },
    Error { message: String },
    SessionIdle { status: String, usage_input: Option<u64>, usage_output: Option<u64> },
}

/// The boundary a real SDK/SSE client binding implements.
pub trait SseSource: Send + Sync {
    fn connect(&self, base_url: &str, session_id: &str) -> BoxStream<'static, Result<SseMessage, AgentRelayError>>;
    fn sdk_importable(&self) -> bool;
}

pub enum ServerMode {
    Managed { server_binary: std::path::PathBuf, host: String, port: u16 },
    External { base_url: String },
}

pub struct SseManagedAdapter<S> {
    backend_id: String,
    mode: ServerMode,
    source: std::sync::Arc<S>,
}

impl<S: SseSource> SseManagedAdapter<S> {
    pub fn new(backend_id: impl Into<String>, mode: ServerMode, source: S) -> Self {
        SseManagedAdapter { backend_id: backend_id.into(), mode, source: std::sync::Arc::new(source) }
    }

    fn base_url(&self) -> String {
        match &self.mode {
            ServerMode::Managed { host, port, .. } => format!("http://{host}:{port}"),
            ServerMode::External { base_url } => base_url.clone(),
        }
    }
}

impl<S: SseSource + 'static> Adapter for SseManagedAdapter<S> {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn available(&self) -> bool {
        match &self.mode {
            ServerMode::Managed { server_binary, .. } => {
                self.source.sdk_importable() && which::which(server_binary).is_ok()
            }
            ServerMode::External { .. } => self.source.sdk_importable(),
        }
    }

    fn run(&self, _prompt: String, options: AdapterOptions) -> BoxStream<'static, AdapterItem> {
        let backend_id = self.backend_id.clone();
        let session_id = crate::event::new_session_id();
        let base_url = self.base_url();
        let cancel = options.cancel.clone();

        let managed_server = match &self.mode {
            ServerMode::Managed { server_binary, host, port } => {
                Some((server_binary.clone(), host.clone(), *port))
            }
            ServerMode::External { .. } => None,
        };

        Box::pin(futures::stream::unfold(
            RunState::Starting {
                backend_id,
                session_id,
                base_url,
                managed_server,
                cancel,
                source: SourceHandle(self.source.clone()),
            },
            step,
        ))
    }
}

/// Carries the [`SseSource`] binding into the lazily-started stream.
/// `Adapter::run` only hands out `&self`, so the adapter keeps its source
/// behind an `Arc` (see [`SseManagedAdapter`]) and this wrapper holds the
/// cloned handle the background poll loop owns for its `'static` lifetime.
struct SourceHandle<S>(std::sync::Arc<S>);

enum RunState<S> {
    Starting {
        backend_id: String,
        session_id: String,
        base_url: String,
        managed_server: Option<(std::path::PathBuf, String, u16)>,
        cancel: crate::cancel::CancelToken,
        source: SourceHandle<S>,
    },
    Streaming {
        backend_id: String,
        session_id: String,
        start: i64,
        child: Option<Child>,
        sse: BoxStream<'static, Result<SseMessage, AgentRelayError>>,
        cancel: crate::cancel::CancelToken,
        terminal_emitted: bool,
    },
    Draining {
        backend_id: String,
        session_id: String,
        start: i64,
    },
    Done,
}

async fn step<S: SseSource>(state: RunState<S>) -> Option<(AdapterItem, RunState<S>)> {
    match state {
        RunState::Starting { backend_id, session_id, base_url, managed_server, cancel, source } => {
            let start = timestamp_ms();
            let child = if let Some((binary, host, port)) = managed_server {
                match spawn_and_wait_ready(&binary, &host, port).await {
                    Ok(child) => Some(child),
                    Err(e) => return Some((Err(e), RunState::Done)),
                }
            } else {
                None
            };
            let sse = source.0.connect(&base_url, &session_id);
            Box::pin(step(RunState::Streaming {
                backend_id,
                session_id,
                start,
                child,
                sse,
                cancel,
                terminal_emitted: false,
            }))
            .await
        }

        RunState::Streaming { backend_id, session_id, start, mut child, mut sse, cancel, mut terminal_emitted } => {
            let exited = async {
                match &mut child {
                    Some(c) => c.wait().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    shutdown(&mut child).await;
                    if terminal_emitted {
                        None
                    } else {
                        let elapsed = (timestamp_ms() - start).max(0) as u64;
                        let event = crate::synth::done_event(&backend_id, &session_id, DoneStatus::Interrupted, elapsed);
                        Some((Ok(event), RunState::Done))
                    }
                }
                status = exited => {
                    // Server exited before `done` (spec.md §4.9 "Server-crash handling").
                    shutdown(&mut child).await;
                    if terminal_emitted {
                        None
                    } else if cancel.is_cancelled() {
                        let elapsed = (timestamp_ms() - start).max(0) as u64;
                        let event = crate::synth::done_event(&backend_id, &session_id, DoneStatus::Interrupted, elapsed);
                        Some((Ok(event), RunState::Done))
                    } else {
                        let description = match status {
                            Ok(code) => format!("exit status {code}"),
                            Err(e) => format!("wait failed: {e}"),
                        };
                        let error = crate::synth::error_event(
                            &backend_id,
                            &session_id,
                            codes::OPENCODE_SERVER_EXIT,
                            format!("managed server exited unexpectedly: {description}"),
                            false,
                        );
                        Some((Ok(error), RunState::Draining { backend_id, session_id, start }))
                    }
                }
                next = sse.next() => {
                    match next {
                        Some(Ok(message)) => {
                            match translate_sse(&backend_id, &session_id, message) {
                                Some(event) => {
                                    if event.is_terminal() {
                                        terminal_emitted = true;
                                        shutdown(&mut child).await;
                                        Some((Ok(event), RunState::Done))
                                    } else {
                                        Some((Ok(event), RunState::Streaming { backend_id, session_id, start, child, sse, cancel, terminal_emitted }))
                                    }
                                }
                                None => {
                                    Box::pin(step(RunState::Streaming { backend_id, session_id, start, child, sse, cancel, terminal_emitted })).await
                                }
                            }
                        }
                        Some(Err(err)) => {
                            shutdown(&mut child).await;
                            let error = crate::synth::error_event(
                                &backend_id,
                                &session_id,
                                codes::OPENCODE_STREAM_ERROR,
                                err.to_string(),
                                false,
                            );
                            Some((Ok(error), RunState::Draining { backend_id, session_id, start }))
                        }
                        None => {
                            shutdown(&mut child).await;
                            if terminal_emitted {
                                None
                            } else {
                                let error = crate::synth::error_event(
                                    &backend_id,
                                    &session_id,
                                    codes::MISSING_SESSION_IDLE,
                                    "protocol violation: SSE stream ended without session.idle",
                                    false,
                                );
                                Some((Ok(error), RunState::Draining { backend_id, session_id, start }))
                            }
                        }
                    }
                }
            }
        }

        RunState::Draining { backend_id, session_id, start } => {
            let elapsed = (timestamp_ms() - start).max(0) as u64;
            let event = crate::synth::done_event(&backend_id, &session_id, DoneStatus::Error, elapsed);
            Some((Ok(event), RunState::Done))
        }

        RunState::Done => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterOptions;
    use futures::stream;

    struct StubSource {
        messages: std::sync::Mutex<Option<Vec<Result<SseMessage, AgentRelayError>>>>,
        importable: bool,
    }

    impl SseSource for StubSource {
        fn connect(&self, _base_url: &str, _session_id: &str) -> BoxStream<'static, Result<SseMessage, AgentRelayError>> {
            let messages = self.messages.lock().unwrap().take().unwrap_or_default();
            stream::iter(messages).boxed()
        }

        fn sdk_importable(&self) -> bool {
            self.importable
        }
    }

    #[test]
    fn external_mode_availability_depends_only_on_sdk() {
        let adapter = SseManagedAdapter::new(
            "opencode",
            ServerMode::External { base_url: "http://localhost:1234".into() },
            StubSource { messages: std::sync::Mutex::new(Some(vec![])), importable: true },
        );
        assert!(adapter.available());
    }

    #[tokio::test]
    async fn translates_text_delta_and_session_idle() {
        let _options = AdapterOptions::default();
        let part = translate_sse(
            "opencode",
            "sess",
            SseMessage::PartUpdated { part_type: "text".into(), delta: Some("chunk".into()), text: None },
        );
        assert_eq!(part.unwrap().event_type.as_str(), "text_delta");

        let idle = translate_sse(
            "opencode",
            "sess",
            SseMessage::SessionIdle { status: "success".into(), usage_input: Some(1), usage_output: Some(2) },
        );
        let event = idle.unwrap();
        assert!(event.is_terminal());
    }

    #[test]
    fn permission_replied_denied_becomes_tool_result_others_suppressed() {
        let denied = translate_sse(
            "opencode",
            "sess",
            SseMessage::PermissionReplied {
                tool_use_id: "call-1".into(),
                tool_name: "edit".into(),
                decision: "denied".into(),
                reason: Some("no".into()),
            },
        );
        let event = denied.unwrap();
        assert_eq!(event.event_type.as_str(), "tool_result");
        let payload: ToolResultPayload = serde_json::from_value(event.payload).unwrap();
        assert_eq!(payload.tool_use_id, "call-1");
        assert_eq!(payload.tool_name, "edit");

        let approved = translate_sse(
            "opencode",
            "sess",
            SseMessage::PermissionReplied {
                tool_use_id: "call-2".into(),
                tool_name: "edit".into(),
                decision: "approved".into(),
                reason: None,
            },
        );
        assert!(approved.is_none());
    }
}

/// SSE event → canonical event translation (spec.md §4.9). Returns `None`
/// for suppressed cases (an approved `permission.replied`).
fn translate_sse(backend_id: &str, session_id: &str, message: SseMessage) -> Option<Event> {
    let timestamp = timestamp_ms();
    match message {
        SseMessage::PartUpdated { part_type, delta, text } => {
            let event = match part_type.as_str() {
                "text" => match delta {
                    Some(delta) => Event::new(EventType::TextDelta, backend_id, session_id, timestamp, TextDeltaPayload { delta }),
                    None => Event::new(EventType::Text, backend_id, session_id, timestamp, TextPayload { text: text.unwrap_or_default() }),
                },
                "tool" | "tool_call" | "tool_use" => Event::new(
                    EventType::ToolUse,
                    backend_id,
                    session_id,
                    timestamp,
                    ToolUsePayload {
                        tool_name: text.clone().unwrap_or_default(),
                        tool_use_id: crate::event::new_session_id(),
                        input: serde_json::Value::Null,
                        description: None,
                    },
                ),
                "thinking" | "reasoning" => Event::new(
                    EventType::Thinking,
                    backend_id,
                    session_id,
                    timestamp,
                    ThinkingPayload { summary: text.unwrap_or_default() },
                ),
                "file" | "file_part" => Event::new(
                    EventType::extension(backend_id, "file_part"),
                    backend_id,
                    session_id,
                    timestamp,
                    serde_json::json!({ "text": text }),
                ),
                "image" | "image_part" => Event::new(
                    EventType::extension(backend_id, "image_part"),
                    backend_id,
                    session_id,
                    timestamp,
                    serde_json::json!({ "text": text }),
                ),
                _ => return None,
            };
            Some(event)
        }
        SseMessage::PermissionUpdated { tool_name, tool_use_id, input } => Some(Event::new(
            EventType::PermissionRequest,
            backend_id,
            session_id,
            timestamp,
            PermissionRequestPayload { tool_name, tool_use_id, input, reason: None },
        )),
        SseMessage::PermissionReplied { tool_use_id, tool_name, decision, reason } => match decision.as_str() {
            "denied" | "rejected" => Some(Event::new(
                EventType::ToolResult,
                backend_id,
                session_id,
                timestamp,
                ToolResultPayload {
                    tool_use_id,
                    tool_name,
                    status: ToolResultStatus::Denied,
                    output: serde_json::json!({ "reason": reason }),
                    duration_ms: None,
                },
            )),
            _ => None,
        },
        SseMessage::Error { message } => Some(Event::new(
            EventType::Error,
            backend_id,
            session_id,
            timestamp,
            ErrorPayload { code: None, message, recoverable: false },
        )),
        SseMessage::SessionIdle { status, usage_input, usage_output } => Some(Event::new(
            EventType::Done,
            backend_id,
            session_id,
            timestamp,
            DonePayload {
                status: map_status(&status),
                final_text: None,
                usage: Usage {
                    input_tokens: usage_input.unwrap_or(0),
                    output_tokens: usage_output.unwrap_or(0),
                    tool_uses: 0,
                    total_cost_usd: None,
                },
                duration_ms: 0,
            },
        )),
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

/// Spawn the managed server binary and wait for a readiness line on stdout
/// or stderr (spec.md §4.9 "Readiness detection").
async fn spawn_and_wait_ready(
    server_binary: &std::path::Path,
    host: &str,
    port: u16,
) -> Result<Child, AgentRelayError> {
    let mut cmd = Command::new(server_binary);
    cmd.arg("serve").arg("--host").arg(host).arg("--port").arg(port.to_string());
    cmd.stdout(std::process::Stdio::piped()).stderr(std::process::Stdio::piped());

    let mut child = cmd.spawn().map_err(AgentRelayError::Io)?;
    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let ready = async move {
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    if line_indicates_ready(&line) { return true; }
                    if matches!(line, Ok(None)) { return false; }
                }
                line = stderr_lines.next_line() => {
                    if line_indicates_ready(&line) { return true; }
                    if matches!(line, Ok(None)) { return false; }
                }
            }
        }
    };

    match tokio::time::timeout(READINESS_TIMEOUT, ready).await {
        Ok(true) => Ok(child),
        Ok(false) => {
            let _ = child.start_kill();
            Err(AgentRelayError::Process("managed server exited before becoming ready".into()))
        }
        Err(_) => {
            let _ = child.start_kill();
            Err(AgentRelayError::Timeout("managed server did not become ready in time".into()))
        }
    }
}

fn line_indicates_ready(line: &std::io::Result<Option<String>>) -> bool {
    match line {
        Ok(Some(text)) => {
            let lower = text.to_lowercase();
            lower.contains("ready") || lower.contains("listening") || lower.contains("http://")
        }
        _ => false,
    }
}

/// Best-effort shutdown: SIGTERM the managed server (if any) and bound the
/// wait for its exit (spec.md §4.9 "Shutdown discipline").
async fn shutdown(child: &mut Option<Child>) {
    if let Some(child) = child {
        let _ = child.start_kill();
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await;
    }
}
