//! Worker fleet: registry, task correlation, selection and transport.
//!
//! - `model`: Worker / Task types and the live connection handle
//! - `store`: durable worker directory (`WorkerStore`)
//! - `registry`: worker directory + connectivity state
//! - `correlator`: task submission and reply matching
//! - `selector`: capability- and performance-aware routing
//! - `ws`: worker WebSocket transport and REST inspection

pub mod correlator;
pub mod model;
pub mod registry;
pub mod selector;
pub mod store;
pub mod ws;

pub use correlator::TaskCorrelator;
pub use model::{
    Capabilities, ConnectionHandle, Task, TaskOutcome, TaskRequest, TaskStatus, TaskType, Worker,
    WorkerStatus,
};
pub use registry::{Registration, WorkerRegistry};
pub use selector::WorkerSelector;
pub use store::{JsonFileStore, MemoryStore, WorkerStore};
pub use ws::fleet_routes;
