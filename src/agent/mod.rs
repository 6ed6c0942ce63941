//! Conversation loop, its history and the chat endpoints.

pub mod agent_loop;
pub mod history;
pub mod routes;

pub use agent_loop::{Agent, AgentDeps, truncate_tool_output};
pub use history::ConversationHistory;
pub use routes::chat_routes;
