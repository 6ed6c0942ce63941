//! Fleet Relay: a conversational relay that drives a fleet of remote workers.

pub mod agent;
pub mod config;
pub mod error;
pub mod fleet;
pub mod llm;
pub mod relay;
pub mod tools;
