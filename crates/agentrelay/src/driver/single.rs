//! The single-session driver (spec.md §4.4): wraps one adapter's production
//! in the canonical lifecycle — pre-abort short-circuit, cancellation race,
//! post-terminal suppression, and error/exhaustion synthesis.
//!
//! Grounded in `claude-agent`'s `QueryStream` (a background task forwarding
//! parsed messages over an `mpsc` channel until a terminal message or EOF),
//! generalized to also race a [`CancelToken`] and to synthesize the
//! terminal events the adapter itself failed to produce.

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::adapter::AdapterOptions;
use crate::cancel::CancelToken;
use crate::event::{codes, new_session_id, Event};
use crate::registry::AdapterRegistry;
use crate::synth::{done_event, error_event, timestamp_ms};
use crate::error::AgentRelayError;
use crate::event::DoneStatus;

/// Drive one adapter's production, returning a stream that satisfies every
/// invariant of spec.md §3 regardless of the adapter's own behavior.
///
/// Fails synchronously (before any event is produced) if `backend_id` is not
/// registered; this is a programming error and is not represented as an
/// event (spec.md §7 "Exceptions raised by the drivers themselves... escape
/// immediately").
pub fn drive(
    backend_id: &str,
    prompt: String,
    options: AdapterOptions,
    registry: &AdapterRegistry,
) -> Result<BoxStream<'static, Event>, AgentRelayError> {
    let adapter = registry
        .lookup(backend_id)
        .ok_or_else(|| AgentRelayError::UnknownBackend(backend_id.to_string()))?;

    let backend_id = backend_id.to_string();
    let session_seed = new_session_id();
    let start = timestamp_ms();
    let cancel = options.cancel.clone();

    // Pre-abort: the adapter must never be invoked (spec.md §4.4 step 3).
    if cancel.is_cancelled() {
        let event = done_event(&backend_id, &session_seed, DoneStatus::Interrupted, 0);
        return Ok(futures::stream::once(async { event }).boxed());
    }

    let raw = adapter.run(prompt, options);
    let (tx, rx) = mpsc::channel::<Event>(32);

    tokio::spawn(async move {
        run_to_completion(&backend_id, raw, cancel, session_seed, start, tx).await;
    });

    Ok(tokio_stream::wrappers::ReceiverStream::new(rx).boxed())
}

/// The per-event pull loop shared by the single-session and parallel
/// drivers (spec.md §4.4 steps 5-9, reused verbatim per task by §4.5 step 7).
///
/// Pulls `raw` one item at a time, racing each pull against `cancel`, and
/// forwards the result into `tx`: adapter events pass through unchanged
/// (updating the carried session id as they go), an adapter exception
/// synthesizes `error{ADAPTER_ERROR}` + `done{error}`, clean exhaustion
/// without a `done` synthesizes `error{MISSING_DONE}` + `done{error}`, and a
/// cancellation trip synthesizes `done{interrupted}` — all unless a `done`
/// has already been emitted, in which case the loop just stops. `raw` is
/// dropped on every exit path, requesting the adapter's stream close.
pub(crate) async fn run_to_completion(
    backend_id: &str,
    mut raw: BoxStream<'static, crate::adapter::AdapterItem>,
    cancel: CancelToken,
    initial_session_id: String,
    start: i64,
    tx: mpsc::Sender<Event>,
) {
    let mut last_session_id = initial_session_id;
    let mut terminal_emitted = false;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                if !terminal_emitted {
                    let elapsed = (timestamp_ms() - start).max(0) as u64;
                    let event = done_event(backend_id, &last_session_id, DoneStatus::Interrupted, elapsed);
                    let _ = tx.send(event).await;
                }
                break;
            }
            next = raw.next() => {
                match next {
                    Some(Ok(event)) => {
                        last_session_id = event.session_id.clone();
                        let is_done = event.is_terminal();
                        if tx.send(event).await.is_err() {
                            break;
                        }
                        if is_done {
                            terminal_emitted = true;
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        if !terminal_emitted {
                            let elapsed = (timestamp_ms() - start).max(0) as u64;
                            let error = error_event(
                                backend_id,
                                &last_session_id,
                                codes::ADAPTER_ERROR,
                                err.to_string(),
                                false,
                            );
                            let _ = tx.send(error).await;
                            let done = done_event(backend_id, &last_session_id, DoneStatus::Error, elapsed);
                            let _ = tx.send(done).await;
                        }
                        break;
                    }
                    None => {
                        if !terminal_emitted {
                            let elapsed = (timestamp_ms() - start).max(0) as u64;
                            let error = error_event(
                                backend_id,
                                &last_session_id,
                                codes::MISSING_DONE,
                                "protocol violation: adapter completed without terminal event",
                                false,
                            );
                            let _ = tx.send(error).await;
                            let done = done_event(backend_id, &last_session_id, DoneStatus::Error, elapsed);
                            let _ = tx.send(done).await;
                        }
                        break;
                    }
                }
            }
        }
    }
}
