use thiserror::Error;

/// Crate-wide error type for failures the driver cannot represent as a
/// canonical `error`/`done` event — programming errors and I/O failures that
/// happen outside of a session's event stream.
#[derive(Debug, Error)]
pub enum AgentRelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse NDJSON line: {source}\n  line: {line}")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("process error: {0}")]
    Process(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("adapter already registered: {0}")]
    DuplicateAdapter(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, AgentRelayError>;
