//! The adapter protocol (spec.md §4.3): the producer contract a backend must
//! satisfy to be driven by [`crate::driver::single::drive`] /
//! [`crate::driver::parallel::drive_all`].

use futures::stream::BoxStream;

use crate::cancel::CancelToken;
use crate::error::AgentRelayError;
use crate::event::Event;

/// The item type of an adapter's raw event stream. An `Err` models the
/// adapter "raising during production" (spec.md §4.3); the driver turns it
/// into a synthesized `error` + `done{error}` pair.
pub type AdapterItem = Result<Event, AgentRelayError>;

/// Permission for a single capability (spec.md §3 "Permission policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capability {
    Allow,
    #[default]
    Ask,
    Deny,
}

/// The {fileWrite, shellExecute, networkAccess} triple controlling what a
/// backend may autonomously do, each defaulting to `Ask` when absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionPolicy {
    pub file_write: Capability,
    pub shell_execute: Capability,
    pub network_access: Capability,
}

/// Options accepted by [`Adapter::run`] (spec.md §3 "Adapter options").
#[derive(Debug, Clone, Default)]
pub struct AdapterOptions {
    pub working_directory: Option<std::path::PathBuf>,
    pub model: Option<String>,
    pub permissions: PermissionPolicy,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub resume_token: Option<String>,
    pub cancel: CancelToken,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
}

/// A conforming event producer for one backend family.
///
/// Implementors must satisfy spec.md §4.3: `available` is cheap and
/// side-effect-free; `run`'s returned stream is finite, SHOULD begin with
/// `init` and end with `done`, and MUST carry a stable session id across all
/// of its events.
pub trait Adapter: Send + Sync {
    /// Stable identifier for this adapter family (e.g. `"claude-sdk"`).
    fn backend_id(&self) -> &str;

    /// Cheap, side-effect-free availability probe. Must not panic or block.
    fn available(&self) -> bool;

    /// Drive one agentic query, returning a finite stream of raw events as
    /// the adapter itself produces them (pre-driver-normalization).
    fn run(&self, prompt: String, options: AdapterOptions) -> BoxStream<'static, AdapterItem>;
}
