//! Stepwise: a budgeted multi-turn agent loop
//!
//! Stepwise runs a language model against a stateful action sandbox until a
//! task is done. Each turn the model reasons, proposes one action script, and
//! sees the observation it produced; the conversation is compacted as it
//! grows, every step is persisted for replay, and raw responses are kept as a
//! training trace.

pub mod agent;
pub mod config;
pub mod history;
pub mod llm;
pub mod tools;
pub mod trajectory;
pub mod workspace;

pub use agent::{Agent, AgentError, SessionReport, SessionState, Task};
pub use config::{AgentConfig, ConfigError, RetryConfig};
pub use history::{History, Message, Role, Tag};
pub use llm::{ModelClient, ModelError, ResponseFormat, ScriptedClient, Stats};
pub use tools::{Completion, FnTool, Tool, ToolDefinition, ToolError, ToolOutput, ToolRegistry};
pub use trajectory::{Trajectory, TrajectoryRecord};
pub use workspace::{RunOutcome, RunStatus, Workspace};
