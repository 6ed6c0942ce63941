//! Built-in tools: remote execution on fleet workers and fleet inspection.

pub mod fleet;

pub use fleet::{FleetDeps, ListWorkersTool, RemoteTaskTool, TaskHistoryTool};
