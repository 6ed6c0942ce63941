//! Tool abstraction and the dispatch table the conversation loop calls into.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::{ToolEntry, ToolRegistry};
pub use tool::{Tool, ToolCategory, ToolOutput};
