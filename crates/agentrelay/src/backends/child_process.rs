//! Backend C — child-process NDJSON normalizer (spec.md §4.8).
//!
//! Grounded in `claude-agent::process::ClaudeProcess` (command construction,
//! stdout line reading, kill-on-drop) generalized from a single fixed CLI
//! shape to the spec's translation table, exit-code mapping, and capability
//! → settings-file override.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use tokio::process::{Child, Command};

use crate::adapter::{Adapter, AdapterItem, AdapterOptions, Capability};
use crate::event::{
    codes, DoneStatus, DonePayload, ErrorPayload, Event, EventType, InitPayload, TextPayload,
    ToolResultPayload, ToolResultStatus, ToolUsePayload, Usage,
};
use crate::framer::{FrameResult, LineFramer};
use crate::synth::timestamp_ms;

/// Path to the CLI binary this backend spawns. Overridable for tests.
pub struct ChildProcessAdapter {
    backend_id: String,
    executable: PathBuf,
}

impl ChildProcessAdapter {
    pub fn new(backend_id: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        ChildProcessAdapter {
            backend_id: backend_id.into(),
            executable: executable.into(),
        }
    }
}

impl Adapter for ChildProcessAdapter {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn available(&self) -> bool {
        which::which(&self.executable).is_ok()
    }

    fn run(&self, prompt: String, options: AdapterOptions) -> BoxStream<'static, AdapterItem> {
        let backend_id = self.backend_id.clone();
        let executable = self.executable.clone();
        Box::pin(futures::stream::unfold(
            RunState::Starting { backend_id, executable, prompt, options },
            step,
        ))
    }
}

/// Compute the {allow-set, deny-set} from the capability policy, merged with
/// user-provided allow/deny lists. Deny overrides allow.
fn resolve_tool_sets(options: &AdapterOptions) -> (Vec<String>, Vec<String>) {
    let mut allow: HashSet<String> = options.allowed_tools.iter().cloned().collect();
    let mut deny: HashSet<String> = options.disallowed_tools.iter().cloned().collect();

    let triples: [(Capability, &[&str]); 3] = [
        (options.permissions.file_write, &["edit"]),
        (options.permissions.shell_execute, &["ShellTool"]),
        (options.permissions.network_access, &["webfetch"]),
    ];

    for (capability, names) in triples {
        match capability {
            Capability::Allow => {
                for name in names {
                    allow.insert(name.to_string());
                }
            }
            Capability::Deny => {
                for name in names {
                    deny.insert(name.to_string());
                }
            }
            Capability::Ask => {}
        }
    }

    // Deny overrides allow.
    allow.retain(|name| !deny.contains(name));

    let mut allow: Vec<String> = allow.into_iter().collect();
    let mut deny: Vec<String> = deny.into_iter().collect();
    allow.sort();
    deny.sort();
    (allow, deny)
}

/// Materialize the temporary settings file used to carry the deny-set to the
/// CLI (spec.md §4.8 "Settings override"). The returned [`tempfile::TempDir`]
/// removes the directory on drop, so callers just need to keep it alive for
/// the child process's lifetime.
fn write_settings_override(allow: &[String], deny: &[String]) -> std::io::Result<tempfile::TempDir> {
    let dir = tempfile::Builder::new().prefix("agentrelay-settings-").tempdir()?;
    let path = dir.path().join("settings.json");
    let body = serde_json::json!({
        "tools": { "core": allow, "exclude": deny }
    });
    std::fs::write(&path, serde_json::to_vec_pretty(&body)?)?;
    Ok(dir)
}

fn build_command(executable: &PathBuf, prompt: &str, options: &AdapterOptions, settings_dir: Option<&tempfile::TempDir>, allow: &[String]) -> Command {
    let mut cmd = Command::new(executable);
    cmd.arg("--output-format").arg("stream-json");
    cmd.arg("--prompt").arg(prompt);

    if let Some(model) = &options.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(max_turns) = options.max_turns {
        cmd.arg("--max-session-turns").arg(max_turns.to_string());
    }
    if !allow.is_empty() {
        cmd.arg("--allowed-tools").arg(allow.join(","));
    }
    if let Some(dir) = settings_dir {
        cmd.env("AGENTRELAY_SETTINGS_OVERRIDE", dir.path().join("settings.json"));
    }
    if let Some(cwd) = &options.working_directory {
        cmd.current_dir(cwd);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::null());
    cmd
}

enum RunState {
    Starting {
        backend_id: String,
        executable: PathBuf,
        prompt: String,
        options: AdapterOptions,
    },
    Running {
        backend_id: String,
        session_id: String,
        start: i64,
        child: Child,
        framer: LineFramer<tokio::process::ChildStdout>,
        settings_dir: Option<tempfile::TempDir>,
        cancel: crate::cancel::CancelToken,
        result_seen: bool,
        init_seen: bool,
    },
    Draining {
        backend_id: String,
        session_id: String,
        start: i64,
        status: DoneStatus,
    },
    Done,
}

async fn step(state: RunState) -> Option<(AdapterItem, RunState)> {
    match state {
        RunState::Starting { backend_id, executable, prompt, options } => {
            let (allow, deny) = resolve_tool_sets(&options);
            let settings_dir = if deny.is_empty() {
                None
            } else {
                match write_settings_override(&allow, &deny) {
                    Ok(dir) => Some(dir),
                    Err(e) => {
                        return Some((
                            Err(crate::error::AgentRelayError::Io(e)),
                            RunState::Done,
                        ));
                    }
                }
            };
            let mut cmd = build_command(&executable, &prompt, &options, settings_dir.as_ref(), &allow);
            let cancel = options.cancel.clone();
            let session_id = crate::event::new_session_id();
            let start = timestamp_ms();
            match cmd.spawn() {
                Ok(mut child) => {
                    let stdout = match child.stdout.take() {
                        Some(s) => s,
                        None => {
                            return Some((
                                Err(crate::error::AgentRelayError::Process(
                                    "stdout not captured".into(),
                                )),
                                RunState::Done,
                            ));
                        }
                    };
                    let framer = LineFramer::new(stdout);
                    Box::pin(step(RunState::Running {
                        backend_id,
                        session_id,
                        start,
                        child,
                        framer,
                        settings_dir,
                        cancel,
                        result_seen: false,
                        init_seen: false,
                    }))
                    .await
                }
                Err(e) => {
                    Some((Err(crate::error::AgentRelayError::Io(e)), RunState::Done))
                }
            }
        }

        RunState::Running {
            backend_id,
            session_id,
            start,
            mut child,
            mut framer,
            settings_dir,
            cancel,
            mut result_seen,
            mut init_seen,
        } => {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    drop(settings_dir);
                    Some((
                        Ok(crate::synth::done_event(&backend_id, &session_id, DoneStatus::Interrupted, (timestamp_ms() - start).max(0) as u64)),
                        RunState::Done,
                    ))
                }
                frame = framer.next_frame() => {
                    match frame {
                        Ok(Some(FrameResult::Ok(value))) => {
                            match translate_line(&backend_id, &session_id, &value, &mut init_seen) {
                                Some(Translation::Event(event)) => {
                                    if matches!(event.event_type, EventType::Done) {
                                        result_seen = true;
                                    }
                                    Some((Ok(event), RunState::Running {
                                        backend_id, session_id, start, child, framer, settings_dir, cancel, result_seen, init_seen,
                                    }))
                                }
                                None => {
                                    Box::pin(step(RunState::Running {
                                        backend_id, session_id, start, child, framer, settings_dir, cancel, result_seen, init_seen,
                                    })).await
                                }
                            }
                        }
                        Ok(Some(FrameResult::Fail { error_message, raw_line })) => {
                            let event = Event::new(
                                EventType::Error,
                                &backend_id,
                                &session_id,
                                timestamp_ms(),
                                ErrorPayload {
                                    code: Some(codes::NDJSON_PARSE_ERROR.to_string()),
                                    message: format!("{error_message}: {raw_line}"),
                                    recoverable: true,
                                },
                            );
                            Some((Ok(event), RunState::Running {
                                backend_id, session_id, start, child, framer, settings_dir, cancel, result_seen, init_seen,
                            }))
                        }
                        Ok(None) => {
                            // stdout closed; wait for exit and map the code, unless
                            // cancellation already tripped — that overrides exit-code
                            // mapping unconditionally (spec.md §4.8).
                            let exit = child.wait().await;
                            drop(settings_dir);
                            if result_seen {
                                Box::pin(step(RunState::Done)).await
                            } else if cancel.is_cancelled() {
                                let elapsed = (timestamp_ms() - start).max(0) as u64;
                                Some((
                                    Ok(crate::synth::done_event(&backend_id, &session_id, DoneStatus::Interrupted, elapsed)),
                                    RunState::Done,
                                ))
                            } else {
                                let status = exit_status_to_done(exit.ok());
                                Box::pin(step(RunState::Draining { backend_id, session_id, start, status })).await
                            }
                        }
                        Err(e) => {
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                            drop(settings_dir);
                            // Own this protocol violation (spec.md §7 lists backend C,
                            // not the driver, as GEMINI_STREAM_ERROR's source) instead of
                            // propagating the raw `Err`, which would surface as the
                            // driver's generic ADAPTER_ERROR.
                            let error = crate::synth::error_event(
                                &backend_id,
                                &session_id,
                                codes::GEMINI_STREAM_ERROR,
                                format!("error reading child stdout: {e}"),
                                false,
                            );
                            Some((Ok(error), RunState::Draining { backend_id, session_id, start, status: DoneStatus::Error }))
                        }
                    }
                }
            }
        }

        RunState::Draining { backend_id, session_id, start, status } => {
            let elapsed = (timestamp_ms() - start).max(0) as u64;
            let event = crate::synth::done_event(&backend_id, &session_id, status, elapsed);
            Some((Ok(event), RunState::Done))
        }

        RunState::Done => None,
    }
}

fn exit_status_to_done(status: Option<std::process::ExitStatus>) -> DoneStatus {
    // A `None` code means the process died to a signal; the cancellation
    // path (which sends that signal itself) handles `interrupted` directly,
    // so any signal death reached here is an unexpected crash.
    match status.and_then(|s| s.code()) {
        Some(0) => DoneStatus::Success,
        Some(53) => DoneStatus::MaxTurns,
        _ => DoneStatus::Error,
    }
}

enum Translation {
    Event(Event),
}

/// Map one NDJSON object to a canonical event (spec.md §4.8 "Event
/// translation"). Returns `None` for an unrecognized `type` (ignored per
/// spec.md §6 "unknown types are ignored").
fn translate_line(backend_id: &str, session_id: &str, value: &serde_json::Value, init_seen: &mut bool) -> Option<Translation> {
    let kind = value.get("type")?.as_str()?;
    let timestamp = timestamp_ms();
    match kind {
        "init" => {
            *init_seen = true;
            let model = value.get("model").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let cwd = value
                .get("cwd")
                .or_else(|| value.get("working_directory"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let tools = value
                .get("tools")
                .or_else(|| value.get("tool_list"))
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|t| t.as_str().map(String::from)).collect())
                .unwrap_or_default();
            Some(Translation::Event(Event::new(
                EventType::Init,
                backend_id,
                session_id,
                timestamp,
                InitPayload { model, working_directory: cwd, tool_list: tools, capabilities: None },
            )))
        }
        "message" => {
            let text = value
                .get("content")
                .or_else(|| value.get("text"))
                .or_else(|| value.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            Some(Translation::Event(Event::new(
                EventType::Text,
                backend_id,
                session_id,
                timestamp,
                TextPayload { text },
            )))
        }
        "tool_use" => {
            let tool_name = value.get("tool_name").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let tool_use_id = value
                .get("tool_use_id")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(crate::event::new_session_id);
            let input = value.get("input").cloned().unwrap_or(serde_json::Value::Null);
            Some(Translation::Event(Event::new(
                EventType::ToolUse,
                backend_id,
                session_id,
                timestamp,
                ToolUsePayload { tool_name, tool_use_id, input, description: None },
            )))
        }
        "tool_result" => {
            let tool_use_id = value.get("tool_use_id").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let tool_name = value.get("tool_name").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let status = match value.get("status").and_then(|v| v.as_str()) {
                Some("denied") => ToolResultStatus::Denied,
                Some("error") => ToolResultStatus::Error,
                Some("success") => ToolResultStatus::Success,
                _ => {
                    if value.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false) {
                        ToolResultStatus::Error
                    } else {
                        ToolResultStatus::Success
                    }
                }
            };
            let output = value.get("output").cloned().unwrap_or(serde_json::Value::Null);
            Some(Translation::Event(Event::new(
                EventType::ToolResult,
                backend_id,
                session_id,
                timestamp,
                ToolResultPayload { tool_use_id, tool_name, status, output, duration_ms: None },
            )))
        }
        "error" => {
            let message = value.get("message").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let code = value.get("code").and_then(|v| v.as_str()).map(String::from);
            let recoverable = value.get("recoverable").and_then(|v| v.as_bool()).unwrap_or(false);
            Some(Translation::Event(Event::new(
                EventType::Error,
                backend_id,
                session_id,
                timestamp,
                ErrorPayload { code, message, recoverable },
            )))
        }
        "result" => {
            let (status, usage) = parse_result(value);
            Some(Translation::Event(Event::new(
                EventType::Done,
                backend_id,
                session_id,
                timestamp,
                DonePayload {
                    status,
                    final_text: value.get("result").and_then(|v| v.as_str()).map(String::from),
                    usage,
                    duration_ms: value.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0),
                },
            )))
        }
        _ => None,
    }
}

#[derive(Deserialize)]
struct RawUsage {
    #[serde(alias = "inputTokens")]
    input_tokens: Option<u64>,
    #[serde(alias = "outputTokens")]
    output_tokens: Option<u64>,
    #[serde(alias = "toolUses")]
    tool_uses: Option<u64>,
    #[serde(alias = "totalCostUsd")]
    total_cost_usd: Option<f64>,
}

fn parse_result(value: &serde_json::Value) -> (DoneStatus, Usage) {
    let status = match value.get("status").or_else(|| value.get("subtype")).and_then(|v| v.as_str()) {
        Some("success") | Some("completed") | Some("ok") => DoneStatus::Success,
        Some("interrupted") | Some("cancelled") | Some("aborted") => DoneStatus::Interrupted,
        Some("max_turns") | Some("maxturns") => DoneStatus::MaxTurns,
        Some("max_budget") | Some("budget_exceeded") => DoneStatus::MaxBudget,
        Some("error") | Some("failed") => DoneStatus::Error,
        _ => DoneStatus::Success,
    };
    let usage = value
        .get("usage")
        .and_then(|v| serde_json::from_value::<RawUsage>(v.clone()).ok())
        .map(|raw| Usage {
            input_tokens: raw.input_tokens.unwrap_or(0),
            output_tokens: raw.output_tokens.unwrap_or(0),
            tool_uses: raw.tool_uses.unwrap_or(0),
            total_cost_usd: raw.total_cost_usd,
        })
        .unwrap_or_else(Usage::zeroed);
    (status, usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_write_allow_adds_edit_to_allow_set() {
        let mut options = AdapterOptions::default();
        options.permissions.file_write = Capability::Allow;
        let (allow, deny) = resolve_tool_sets(&options);
        assert_eq!(allow, vec!["edit".to_string()]);
        assert!(deny.is_empty());
    }

    #[test]
    fn deny_overrides_allow_for_same_tool() {
        let mut options = AdapterOptions::default();
        options.permissions.shell_execute = Capability::Allow;
        options.disallowed_tools.push("ShellTool".to_string());
        let (allow, deny) = resolve_tool_sets(&options);
        assert!(!allow.contains(&"ShellTool".to_string()));
        assert!(deny.contains(&"ShellTool".to_string()));
    }

    #[test]
    fn ask_capability_touches_neither_set() {
        let options = AdapterOptions::default();
        let (allow, deny) = resolve_tool_sets(&options);
        assert!(allow.is_empty());
        assert!(deny.is_empty());
    }

    #[test]
    fn translate_init_line() {
        let mut init_seen = false;
        let value = serde_json::json!({"type": "init", "model": "m", "cwd": "/w", "tools": ["edit"]});
        let translation = translate_line("backend-c", "sess", &value, &mut init_seen).unwrap();
        let Translation::Event(event) = translation;
        assert_eq!(event.event_type.as_str(), "init");
        assert!(init_seen);
        let payload: InitPayload = serde_json::from_value(event.payload).unwrap();
        assert_eq!(payload.model, "m");
        assert_eq!(payload.working_directory, "/w");
        assert_eq!(payload.tool_list, vec!["edit".to_string()]);
    }

    #[test]
    fn translate_result_maps_exit_status_synonyms() {
        let value = serde_json::json!({"type": "result", "status": "max_turns", "duration_ms": 5});
        let mut init_seen = false;
        let Translation::Event(event) = translate_line("backend-c", "sess", &value, &mut init_seen).unwrap();
        let payload: DonePayload = serde_json::from_value(event.payload).unwrap();
        assert_eq!(payload.status, DoneStatus::MaxTurns);
    }

    #[test]
    fn unknown_type_is_ignored() {
        let value = serde_json::json!({"type": "heartbeat"});
        let mut init_seen = false;
        assert!(translate_line("backend-c", "sess", &value, &mut init_seen).is_none());
    }

    #[test]
    fn exit_code_mapping_matches_contract() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_status_to_done(Some(std::process::ExitStatus::from_raw(0))), DoneStatus::Success);
        assert_eq!(exit_status_to_done(Some(std::process::ExitStatus::from_raw(53 << 8))), DoneStatus::MaxTurns);
        assert_eq!(exit_status_to_done(Some(std::process::ExitStatus::from_raw(1 << 8))), DoneStatus::Error);
        assert_eq!(exit_status_to_done(Some(std::process::ExitStatus::from_raw(42 << 8))), DoneStatus::Error);
    }
}
