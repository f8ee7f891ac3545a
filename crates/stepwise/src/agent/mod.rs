//! The agent control loop.
//!
//! An [`Agent`] runs one session per [`Task`]: it seeds the conversation,
//! then repeats turns of reason, propose and execute until the task is
//! completed, the call budget runs out, or something fails.
//!
//! ```text
//! INIT ──► REASON ──► PROPOSE ──► EXECUTE ──┐
//!            ▲                               │ continue
//!            └───────────────────────────────┘
//!                                            │ completion / budget / error
//!                                            ▼
//!                                   DONE-SUCCESS | DONE-FAILURE
//! ```
//!
//! # Turn Structure
//!
//! Each turn appends, in order:
//!
//! 1. a status line ([`Tag::Status`]) with time, calls used and input tokens left
//! 2. a reasoning reminder and the model's free-text reasoning (when enabled)
//! 3. an action reminder and the model's proposal
//! 4. the observation produced by running the proposal ([`Tag::Observation`])
//!
//! Reminders from earlier turns are marked outdated at the start of each
//! turn and disappear from the live context.
//!
//! # Logs
//!
//! With [`AgentConfig::log_dir`] set, the live view of the history is
//! rewritten to `steps/step_NNNN.xml` after every mutation, and raw model
//! responses are appended to `trajectory.jsonl`.

pub mod envelope;
pub mod status;
pub mod step_log;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use envelope::{ProtocolParseError, parse_action, protocol_instructions};
pub use status::StatusLine;
pub use step_log::{StepLog, StepLogError};

use crate::config::{AgentConfig, ConfigError};
use crate::history::{History, Message, Tag};
use crate::llm::{
    CallRecord, Cost, ModelClient, ModelError, ResponseFormat, RetryError, Stats, Usage, retry,
};
use crate::tools::{ToolRegistry, generate_tool_docs};
use crate::trajectory::{RecordKind, Trajectory, TrajectoryError};
use crate::workspace::{RunStatus, Workspace};

/// Name of the variable holding the task arguments.
pub const TASK_VARIABLE: &str = "task";

const REASONING_REMINDER: &str = "Think about what to do next: what you know, what is missing, \
and which single action gets you closer to finishing. Do not write the action yet.";

/// A unit of work for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    /// Identifier used in logs.
    pub id: String,
    /// What the model is asked to do.
    pub briefing: String,
    /// Extra instructions; omitted from the conversation when empty.
    pub guidelines: String,
    /// Arguments bound to the `task` variable in the sandbox.
    pub arguments: Value,
    /// Script run once before the first turn.
    pub setup_script: Option<String>,
}

impl Task {
    /// Create a task with a briefing.
    pub fn new(id: impl Into<String>, briefing: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            briefing: briefing.into(),
            ..Self::default()
        }
    }

    /// Set the guidelines.
    pub fn with_guidelines(mut self, guidelines: impl Into<String>) -> Self {
        self.guidelines = guidelines.into();
        self
    }

    /// Set the task arguments.
    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    /// Set the setup script.
    pub fn with_setup_script(mut self, script: impl Into<String>) -> Self {
        self.setup_script = Some(script.into());
        self
    }
}

/// Final state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The task was completed with a normal result.
    Success,
    /// Anything else.
    Failure,
}

/// Errors that end a session early.
///
/// They never escape [`Agent::run`]; they are kept in [`SessionReport::error`].
#[derive(Debug, Error)]
pub enum AgentError {
    /// A model call failed after all retries.
    #[error("{label} call failed: {source}")]
    Model {
        /// Which call failed (`reasoning` or `proposal`).
        label: &'static str,
        /// The retry wrapper's error.
        source: RetryError<ModelError>,
    },
    /// The setup script failed or tried to complete the task.
    #[error("setup script failed: {0}")]
    Setup(String),
    /// The step log could not be written.
    #[error(transparent)]
    StepLog(#[from] StepLogError),
    /// The trajectory could not be written.
    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),
    /// Something in the loop panicked.
    #[error("session panicked: {0}")]
    Panicked(String),
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionReport {
    /// Task identifier.
    pub task_id: String,
    /// Success or failure.
    pub state: SessionState,
    /// Final report; always present, even on failure.
    pub report: String,
    /// Turns started.
    pub turns: usize,
    /// Model calls made.
    pub calls: usize,
    /// Token usage of the session.
    pub usage: Usage,
    /// Cost of the session.
    pub cost: Cost,
    /// The error that ended the session, if one did.
    pub error: Option<AgentError>,
    /// Complete message log, outdated messages included.
    pub history: History,
}

impl SessionReport {
    /// Whether the session succeeded.
    pub fn is_success(&self) -> bool {
        self.state == SessionState::Success
    }
}

/// Runs sessions against a model client and a tool registry.
pub struct Agent {
    config: AgentConfig,
    client: Arc<dyn ModelClient>,
    tools: ToolRegistry,
    stats: Arc<Stats>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.client.model_id())
            .field("config", &self.config)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create an agent. Fails if the configuration is invalid.
    pub fn new(
        config: AgentConfig,
        client: impl ModelClient + 'static,
        tools: ToolRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Some(configured) = &config.model
            && configured != client.model_id()
        {
            return Err(ConfigError::ModelMismatch {
                configured: configured.clone(),
                client: client.model_id().to_string(),
            });
        }
        Ok(Self {
            config,
            client: Arc::new(client),
            tools,
            stats: Stats::new(),
        })
    }

    /// Account sessions under `stats`. Each session records into its own child node.
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = stats;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Totals across every session run by this agent.
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Run one session to completion.
    ///
    /// Never fails: errors and panics inside the loop end the session in
    /// [`SessionState::Failure`] and are kept in [`SessionReport::error`].
    pub async fn run(&self, task: Task) -> SessionReport {
        let stats = self.stats.child();
        let mut session = Session::new(self, task, Arc::clone(&stats));

        tracing::info!(
            task = %session.task.id,
            model = %self.client.model_id(),
            max_calls = self.config.max_calls,
            "session started"
        );

        let outcome = AssertUnwindSafe(session.drive()).catch_unwind().await;

        let (state, report, error) = match outcome {
            Ok(Ok(end)) => (end.state, end.report, None),
            Ok(Err(error)) => {
                tracing::warn!(task = %session.task.id, error = %error, "session failed");
                (SessionState::Failure, error.to_string(), Some(error))
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::warn!(task = %session.task.id, %message, "session panicked");
                let error = AgentError::Panicked(message);
                (SessionState::Failure, error.to_string(), Some(error))
            }
        };

        let outcome_text = match state {
            SessionState::Success => format!("success: {report}"),
            SessionState::Failure => format!("failure: {report}"),
        };
        if let Err(e) =
            session
                .trajectory
                .record(session.workspace.step(), RecordKind::Outcome, outcome_text)
        {
            tracing::warn!(error = %e, "failed to record session outcome");
        }

        let summary = stats.summary();
        tracing::info!(
            task = %session.task.id,
            state = ?state,
            turns = session.turn,
            calls = summary.calls,
            input_tokens = summary.usage.input,
            output_tokens = summary.usage.output,
            cost = %summary.cost,
            "session finished"
        );

        SessionReport {
            task_id: session.task.id,
            state,
            report,
            turns: session.turn,
            calls: summary.calls,
            usage: summary.usage,
            cost: summary.cost,
            error,
            history: session.history,
        }
    }
}

/// How the loop ended without an error.
#[derive(Debug)]
struct End {
    state: SessionState,
    report: String,
}

/// State of one running session.
struct Session<'a> {
    agent: &'a Agent,
    task: Task,
    history: History,
    workspace: Workspace,
    stats: Arc<Stats>,
    trajectory: Trajectory,
    step_log: Option<StepLog>,
    turn: usize,
    started: Instant,
}

impl<'a> Session<'a> {
    fn new(agent: &'a Agent, task: Task, stats: Arc<Stats>) -> Self {
        let workspace = Workspace::builder()
            .tools(agent.tools.clone())
            .max_output_chars(agent.config.max_output_chars)
            .build();

        Self {
            agent,
            task,
            history: History::new(),
            workspace,
            stats,
            trajectory: Trajectory::new(),
            step_log: None,
            turn: 0,
            started: Instant::now(),
        }
    }

    fn config(&self) -> &'a AgentConfig {
        &self.agent.config
    }

    async fn drive(&mut self) -> Result<End, AgentError> {
        self.open_logs()?;
        self.turn = 1;
        self.seed().await?;

        loop {
            if let Some(end) = self.take_turn().await? {
                return Ok(end);
            }
            self.turn += 1;
        }
    }

    fn open_logs(&mut self) -> Result<(), AgentError> {
        if let Some(dir) = &self.config().log_dir {
            self.step_log = Some(StepLog::create(dir.join("steps"))?);
            self.trajectory = Trajectory::create(dir.join("trajectory.jsonl"))?;
        }
        Ok(())
    }

    /// Append a message and persist the live view for the current turn.
    fn push(&mut self, message: Message) -> Result<(), AgentError> {
        self.history.add_message(message);
        self.persist()
    }

    fn persist(&self) -> Result<(), AgentError> {
        if let Some(log) = &self.step_log {
            log.write(self.turn, &self.history)?;
        }
        Ok(())
    }

    async fn seed(&mut self) -> Result<(), AgentError> {
        let briefing = self.task.briefing.clone();
        self.push(Message::system(briefing).with_tag(Tag::Briefing))?;

        if !self.task.guidelines.is_empty() {
            let guidelines = self.task.guidelines.clone();
            self.push(Message::system(guidelines).with_tag(Tag::Guidelines))?;
        }

        let docs = format!(
            "{}\n# Tools\n\n{}",
            protocol_instructions(&self.config().action_tag),
            generate_tool_docs(&self.agent.tools.definitions())
        );
        self.push(Message::system(docs).with_tag(Tag::ToolDocs))?;

        self.workspace
            .set_variable(TASK_VARIABLE, self.task.arguments.clone());

        if let Some(script) = self.task.setup_script.clone() {
            let outcome = self.workspace.run(&script).await;
            match outcome.status {
                RunStatus::Continue => {}
                RunStatus::Error(message) => return Err(AgentError::Setup(message)),
                RunStatus::Complete { .. } => {
                    return Err(AgentError::Setup(
                        "setup script signalled completion".to_string(),
                    ));
                }
            }
            tracing::debug!(task = %self.task.id, "setup script ran");
        }
        self.workspace.reset_step_counter();
        Ok(())
    }

    async fn take_turn(&mut self) -> Result<Option<End>, AgentError> {
        let config = self.config();
        tracing::debug!(task = %self.task.id, turn = self.turn, "turn started");

        self.push(self.status_message())?;

        if self
            .history
            .mark_messages_outdated(&[Tag::InstructionReminder])
            > 0
        {
            self.persist()?;
        }

        // The last call of the budget always goes to a proposal
        let reason = config.reasoning && self.stats.call_count() + 1 < config.max_calls as usize;
        if reason {
            self.push(
                Message::user(REASONING_REMINDER)
                    .with_tags([Tag::InstructionReminder, Tag::Reasoning]),
            )?;
            let Some(reasoning) = self.call_model("reasoning", ResponseFormat::FreeText).await?
            else {
                return Ok(Some(self.budget_exhausted()));
            };
            self.trajectory
                .record(self.workspace.step(), RecordKind::Reasoning, reasoning.clone())?;
            self.push(Message::assistant(reasoning).with_tag(Tag::Reasoning))?;
        }

        let tag = &config.action_tag;
        self.push(
            Message::user(format!(
                "Write the next action as exactly one <{tag}>...</{tag}> block."
            ))
            .with_tags([Tag::InstructionReminder, Tag::ActionProposal]),
        )?;
        let format = ResponseFormat::ActionEnvelope { tag: tag.clone() };
        let Some(proposal) = self.call_model("proposal", format).await? else {
            return Ok(Some(self.budget_exhausted()));
        };
        // Recorded before parsing, so malformed proposals are kept too
        self.trajectory
            .record(self.workspace.step(), RecordKind::Proposal, proposal.clone())?;
        self.push(
            Message::assistant(proposal.clone())
                .with_tag(Tag::ActionProposal)
                .with_display("code"),
        )?;

        let (observation, end) = match parse_action(&proposal, tag) {
            Ok(script) => {
                let outcome = self.workspace.run(&script).await;
                let end = match outcome.status {
                    RunStatus::Continue => None,
                    RunStatus::Error(message) => {
                        tracing::debug!(turn = self.turn, error = %message, "action failed");
                        None
                    }
                    RunStatus::Complete { report, result } => Some(End {
                        state: if result.is_ok() {
                            SessionState::Success
                        } else {
                            SessionState::Failure
                        },
                        report,
                    }),
                };
                (outcome.observation, end)
            }
            Err(error) => {
                tracing::warn!(turn = self.turn, error = %error, "malformed action envelope");
                (format!("ProtocolParseError: {error}"), None)
            }
        };

        self.trajectory
            .record(self.workspace.step(), RecordKind::Feedback, observation.clone())?;
        self.push(
            Message::user(observation)
                .with_short(format!("[observation from turn {} elided]", self.turn))
                .with_tag(Tag::Observation),
        )?;

        Ok(end)
    }

    fn status_message(&self) -> Message {
        let config = self.config();
        let used = self
            .agent
            .client
            .count_tokens(&self.history.get_messages());
        let status = StatusLine {
            now: chrono::Local::now(),
            elapsed: self.started.elapsed(),
            turn: self.turn,
            calls_used: self.stats.call_count(),
            max_calls: config.max_calls,
            tokens_remaining: StatusLine::tokens_remaining(config.max_input_tokens, used),
        };
        Message::user(status.to_string())
            .with_tag(Tag::Status)
            .with_display("status")
    }

    /// Call the model on the live view. `None` when the call budget is spent.
    async fn call_model(
        &self,
        label: &'static str,
        format: ResponseFormat,
    ) -> Result<Option<String>, AgentError> {
        let config = self.config();
        let calls = self.stats.call_count();
        if calls >= config.max_calls as usize {
            tracing::info!(task = %self.task.id, calls, "call budget exhausted");
            return Ok(None);
        }

        let messages = self.history.get_messages();
        let messages = messages.as_slice();
        let client = self.agent.client.as_ref();
        let stats = self.stats.as_ref();

        let retried = retry::call(&config.retry, label, move || {
            client.call(messages, stats, format.clone())
        })
        .await
        .map_err(|source| AgentError::Model { label, source })?;

        self.stats.record_call(CallRecord {
            elapsed: retried.elapsed,
            retries: retried.retries(),
        });
        tracing::debug!(
            call = label,
            attempts = retried.attempts,
            elapsed_ms = retried.elapsed.as_millis() as u64,
            "model call finished"
        );
        Ok(Some(retried.value))
    }

    fn budget_exhausted(&self) -> End {
        End {
            state: SessionState::Failure,
            report: format!(
                "call budget exhausted: {} of {} model calls used",
                self.stats.call_count(),
                self.config().max_calls
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::llm::ScriptedClient;
    use serde_json::json;

    fn config() -> AgentConfig {
        AgentConfig {
            reasoning: false,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let bad = AgentConfig {
            max_output_chars: 0,
            ..AgentConfig::default()
        };
        let err = Agent::new(bad, ScriptedClient::new(Vec::<String>::new()), ToolRegistry::new())
            .unwrap_err();
        assert_eq!(err, ConfigError::NoOutputBudget);
    }

    #[tokio::test]
    async fn test_configured_model_must_match_client() {
        let pinned = AgentConfig {
            model: Some("claude-3-5-haiku-latest".into()),
            ..config()
        };
        let err = Agent::new(
            pinned.clone(),
            ScriptedClient::new(Vec::<String>::new()),
            ToolRegistry::new(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::ModelMismatch {
                configured: "claude-3-5-haiku-latest".into(),
                client: "scripted".into(),
            }
        );

        let client = ScriptedClient::new(Vec::<String>::new()).with_model("claude-3-5-haiku-latest");
        assert!(Agent::new(pinned, client, ToolRegistry::new()).is_ok());
    }

    #[tokio::test]
    async fn test_seeding_and_task_variable() {
        let client = ScriptedClient::new(["<run_script>finish task.answer</run_script>"]);
        let agent = Agent::new(config(), client, ToolRegistry::new()).unwrap();
        let task = Task::new("t1", "Return the answer")
            .with_guidelines("Be brief")
            .with_arguments(json!({"answer": 42}));

        let report = agent.run(task).await;

        assert!(report.is_success());
        assert_eq!(report.report, "42");
        assert_eq!(report.calls, 1);
        let messages = report.history.messages();
        assert!(messages[0].tags.contains(&Tag::Briefing));
        assert!(messages[1].tags.contains(&Tag::Guidelines));
        assert!(messages[2].tags.contains(&Tag::ToolDocs));
        assert!(messages[3].tags.contains(&Tag::Status));
    }

    #[tokio::test]
    async fn test_reminders_outdated_each_turn() {
        let client = ScriptedClient::new([
            "<run_script>let a = 1</run_script>",
            "<run_script>finish a</run_script>",
        ]);
        let agent = Agent::new(config(), client, ToolRegistry::new()).unwrap();
        let report = agent.run(Task::new("t", "go")).await;

        assert!(report.is_success());
        assert_eq!(report.turns, 2);
        let reminders: Vec<_> = report
            .history
            .messages()
            .iter()
            .filter(|m| m.tags.contains(&Tag::InstructionReminder))
            .collect();
        assert_eq!(reminders.len(), 2);
        assert!(reminders[0].is_outdated());
        assert!(!reminders[1].is_outdated());
        // The outdated reminder is gone from the live view
        let live = report.history.get_messages();
        assert_eq!(
            live.iter()
                .filter(|m| m.tags.contains(&Tag::InstructionReminder))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_reasoning_call_comes_first() {
        let client = Arc::new(ScriptedClient::new([
            "I should finish.",
            "<run_script>finish \"done\"</run_script>",
        ]));
        let agent = Agent::new(
            AgentConfig::default(),
            Arc::clone(&client),
            ToolRegistry::new(),
        )
        .unwrap();
        let report = agent.run(Task::new("t", "go")).await;

        assert!(report.is_success());
        assert_eq!(report.calls, 2);
        let requests = client.requests();
        assert_eq!(requests[0].1, ResponseFormat::FreeText);
        assert_eq!(
            requests[1].1,
            ResponseFormat::ActionEnvelope {
                tag: "run_script".into()
            }
        );
        // The proposal call sees the reasoning
        assert!(requests[1].0.iter().any(|m| m.content == "I should finish."));
    }

    #[tokio::test]
    async fn test_status_line_reports_calls() {
        let client = ScriptedClient::new([
            "<run_script>print 1</run_script>",
            "<run_script>finish 1</run_script>",
        ]);
        let agent = Agent::new(config(), client, ToolRegistry::new()).unwrap();
        let report = agent.run(Task::new("t", "go")).await;

        let statuses: Vec<_> = report
            .history
            .messages()
            .iter()
            .filter(|m| m.tags.contains(&Tag::Status))
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].contains("model calls 0/40"));
        assert!(statuses[1].contains("model calls 1/40"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_mid_session() {
        let client = ScriptedClient::new([
            "<run_script>print 1</run_script>",
            "<run_script>print 2</run_script>",
            "<run_script>finish 3</run_script>",
        ]);
        let config = AgentConfig {
            max_calls: 2,
            ..config()
        };
        let agent = Agent::new(config, client, ToolRegistry::new()).unwrap();
        let report = agent.run(Task::new("t", "go")).await;

        assert_eq!(report.state, SessionState::Failure);
        assert_eq!(report.calls, 2);
        assert!(report.report.contains("budget"));
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn test_last_call_goes_to_the_proposal() {
        let client = Arc::new(ScriptedClient::new([
            "think 1",
            "<run_script>print 1</run_script>",
            "<run_script>finish 1</run_script>",
        ]));
        let config = AgentConfig {
            max_calls: 3,
            reasoning: true,
            ..AgentConfig::default()
        };
        let agent = Agent::new(config, Arc::clone(&client), ToolRegistry::new()).unwrap();
        let report = agent.run(Task::new("t", "go")).await;

        assert!(report.is_success());
        assert_eq!(report.calls, 3);
        let formats: Vec<_> = client.requests().into_iter().map(|(_, f)| f).collect();
        assert_eq!(formats[0], ResponseFormat::FreeText);
        assert!(matches!(formats[2], ResponseFormat::ActionEnvelope { .. }));
        let reasoning_reminders = report
            .history
            .messages()
            .iter()
            .filter(|m| m.tags.contains(&Tag::InstructionReminder) && m.tags.contains(&Tag::Reasoning))
            .count();
        assert_eq!(reasoning_reminders, 1);
    }

    #[tokio::test]
    async fn test_setup_script_runs_and_resets_counter() {
        let client = ScriptedClient::new(["<run_script>print prepared</run_script>", "<run_script>finish prepared</run_script>"]);
        let agent = Agent::new(config(), client, ToolRegistry::new()).unwrap();
        let task = Task::new("t", "go").with_setup_script("let prepared = \"yes\"");
        let report = agent.run(task).await;

        assert!(report.is_success());
        assert_eq!(report.report, "yes");
        let first_observation = report
            .history
            .messages()
            .iter()
            .find(|m| m.tags.contains(&Tag::Observation))
            .map(|m| m.content.clone())
            .unwrap();
        assert!(first_observation.starts_with("<observation step=\"1\">"));
    }

    #[tokio::test]
    async fn test_failing_setup_script_ends_session() {
        let client = ScriptedClient::new(["<run_script>finish 1</run_script>"]);
        let agent = Agent::new(config(), client, ToolRegistry::new()).unwrap();
        let task = Task::new("t", "go").with_setup_script("raise \"no fixtures\"");
        let report = agent.run(task).await;

        assert_eq!(report.state, SessionState::Failure);
        assert!(matches!(report.error, Some(AgentError::Setup(_))));
        assert_eq!(report.calls, 0);
    }

    #[tokio::test]
    async fn test_sessions_roll_up_into_agent_stats() {
        let client = Arc::new(ScriptedClient::new([
            "<run_script>finish 1</run_script>",
            "<run_script>finish 2</run_script>",
        ]));
        let agent = Agent::new(config(), client, ToolRegistry::new()).unwrap();
        agent.run(Task::new("a", "go")).await;
        let second = agent.run(Task::new("b", "go")).await;

        assert_eq!(second.calls, 1);
        assert_eq!(agent.stats().call_count(), 2);
    }
}
