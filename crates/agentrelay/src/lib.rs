//! `agentrelay` — a driver-style facade over heterogeneous coding-agent
//! backends.
//!
//! Four backend shapes (a typed in-process SDK, a resumable "thread" SDK, a
//! child process speaking NDJSON, and a managed server speaking SSE) are
//! normalized behind one [`Adapter`] trait and one canonical [`Event`]
//! model, then driven by two lifecycles that both guarantee exactly one
//! terminal event per run.
//!
//! # Architecture
//!
//! ```text
//! AdapterRegistry
//!     │   register() / lookup() / list() / unregister()
//!     ▼
//! Adapter (backend_id, available, run)   ← backends::{sdk_typed, thread_sdk,
//!     │                                      child_process, sse_managed}
//!     │   BoxStream<AdapterItem>            each wraps a boundary trait for
//!     ▼                                      the concrete SDK/CLI/server
//! driver::{single::drive, parallel::drive_all}
//!     │   run_to_completion: synthesize done/error, enforce cancellation
//!     ▼
//! BoxStream<Event>   ← one canonical shape regardless of backend
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use agentrelay::{AdapterOptions, AdapterRegistry};
//! use futures::StreamExt;
//!
//! let mut registry = AdapterRegistry::new();
//! registry.register(Box::new(my_adapter))?;
//!
//! let mut stream = agentrelay::drive("claude-sdk", "say hello".into(), AdapterOptions::default(), &registry)?;
//! while let Some(event) = stream.next().await {
//!     println!("{} {}", event.event_type.as_str(), event.payload);
//! }
//! ```

pub mod adapter;
pub mod backends;
pub mod cancel;
pub mod driver;
pub mod error;
pub mod event;
pub mod framer;
pub mod registry;
pub mod synth;

pub use adapter::{Adapter, AdapterItem, AdapterOptions, Capability, PermissionPolicy};
pub use cancel::CancelToken;
pub use driver::{drive, drive_all, Task};
pub use error::AgentRelayError;
pub use event::{new_session_id, Event, EventType};
pub use registry::AdapterRegistry;

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, AgentRelayError>;
