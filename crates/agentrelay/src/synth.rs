//! Synthesized-event helpers shared by the drivers and the backend
//! normalizers: building the `error` + `done` pairs spec.md §7 assigns to
//! protocol violations and driver-level failures.

use crate::event::{DonePayload, DoneStatus, ErrorPayload, Event, EventType, Usage};

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current wall-clock time in milliseconds since the epoch, exposed so
/// callers (drivers, backends) can capture a stable start time `T0` and
/// derive `durationMs` from it later.
pub fn timestamp_ms() -> i64 {
    now_ms()
}

/// Build a `done` event with zeroed usage, as used for every synthesized
/// terminal (interrupted pre-abort, interrupted mid-stream, error-on-
/// exception, error-on-exhaustion).
pub fn done_event(
    backend_id: &str,
    session_id: &str,
    status: DoneStatus,
    duration_ms: u64,
) -> Event {
    Event::new(
        EventType::Done,
        backend_id,
        session_id,
        now_ms(),
        DonePayload {
            status,
            final_text: None,
            usage: Usage::zeroed(),
            duration_ms,
        },
    )
}

/// Build an `error` event carrying a driver/backend-synthesized code.
pub fn error_event(
    backend_id: &str,
    session_id: &str,
    code: &str,
    message: impl Into<String>,
    recoverable: bool,
) -> Event {
    Event::new(
        EventType::Error,
        backend_id,
        session_id,
        now_ms(),
        ErrorPayload {
            code: Some(code.to_string()),
            message: message.into(),
            recoverable,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::codes;

    #[test]
    fn done_event_carries_zeroed_usage() {
        let event = done_event("backend-a", "sess-1", DoneStatus::Interrupted, 42);
        assert!(event.is_terminal());
        let payload: DonePayload = serde_json::from_value(event.payload).unwrap();
        assert_eq!(payload.status, DoneStatus::Interrupted);
        assert_eq!(payload.usage.input_tokens, 0);
        assert_eq!(payload.duration_ms, 42);
    }

    #[test]
    fn error_event_carries_code_and_recoverability() {
        let event = error_event("backend-a", "sess-1", codes::ADAPTER_ERROR, "boom", false);
        let payload: ErrorPayload = serde_json::from_value(event.payload).unwrap();
        assert_eq!(payload.code.as_deref(), Some(codes::ADAPTER_ERROR));
        assert_eq!(payload.message, "boom");
        assert!(!payload.recoverable);
    }
}
