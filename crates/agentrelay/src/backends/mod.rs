//! Built-in backend normalizers (spec.md §4.6-4.9), one module per
//! transport shape. Each exposes an `Adapter` impl plus the boundary trait
//! a real SDK/CLI binding plugs into.

pub mod child_process;
pub mod sdk_typed;
pub mod sse_managed;
pub mod thread_sdk;
