//! The action sandbox.
//!
//! A [`Workspace`] holds a namespace of named JSON values that persists across
//! steps, runs action scripts against it, and turns each run into an
//! observation for the model. Script failures are data: they are reported in
//! [`Execution::error`] and never abort the caller.
//!
//! ```rust,no_run
//! use serde_json::json;
//! use stepwise::workspace::{RunStatus, Workspace};
//!
//! # async fn example() {
//! let mut ws = Workspace::builder()
//!     .variable("task", json!({"quarter": "Q3"}))
//!     .build();
//!
//! let outcome = ws.run("let q = task.quarter\nprint q").await;
//! assert_eq!(outcome.status, RunStatus::Continue);
//! assert!(outcome.observation.contains("Q3"));
//! # }
//! ```

mod observation;
pub mod script;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

pub use observation::{Limited, NO_OUTPUT, limit_text};
pub use script::{Program, ScriptError, ScriptErrorKind, display_value};

use crate::tools::{Completion, ToolRegistry};
use observation::ObservationParts;
use script::{Halt, Interpreter};

/// Default character budget for each observation section.
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 4_000;

/// Variable name to value. Values are shared between forks until rebound.
pub type Namespace = BTreeMap<String, Arc<Value>>;

/// Errors from namespace operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkspaceError {
    /// Requested variables are not bound in the source workspace.
    #[error("variables not found: {}", .0.join(", "))]
    MissingVariables(Vec<String>),
}

/// Why an execution stopped before the end of the script.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Syntax or runtime error.
    Script(ScriptError),
    /// The completion signal was raised.
    Interrupted(Completion),
}

/// Result of [`Workspace::execute`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// What stopped the script early, if anything.
    pub error: Option<Fault>,
}

/// Classification of a [`Workspace::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// The script ran to the end.
    Continue,
    /// The script failed; the message is also in the observation.
    Error(String),
    /// The completion signal was raised.
    Complete {
        /// Final report in string form.
        report: String,
        /// Result value, or the error payload of a failed completion.
        result: Result<Value, String>,
    },
}

/// Result of [`Workspace::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// How the step ended.
    pub status: RunStatus,
    /// Observation envelope for the model.
    pub observation: String,
}

/// Builder for a [`Workspace`].
#[derive(Debug, Default)]
pub struct WorkspaceBuilder {
    tools: ToolRegistry,
    max_output_chars: Option<usize>,
    namespace: Namespace,
}

impl WorkspaceBuilder {
    /// Set the tools callable from scripts.
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Set the per-section character budget of observations.
    pub fn max_output_chars(mut self, chars: usize) -> Self {
        self.max_output_chars = Some(chars);
        self
    }

    /// Bind an initial variable.
    pub fn variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.namespace.insert(name.into(), Arc::new(value));
        self
    }

    /// Bind several initial variables.
    pub fn variables<K: Into<String>>(mut self, vars: impl IntoIterator<Item = (K, Value)>) -> Self {
        self.namespace
            .extend(vars.into_iter().map(|(k, v)| (k.into(), Arc::new(v))));
        self
    }

    /// Build the workspace.
    pub fn build(self) -> Workspace {
        Workspace {
            namespace: self.namespace,
            tools: self.tools,
            max_output_chars: self.max_output_chars.unwrap_or(DEFAULT_MAX_OUTPUT_CHARS),
            step: 0,
            outputs: HashMap::new(),
        }
    }
}

/// The sandbox: a persistent namespace, a step counter and a side channel
/// for oversized outputs.
pub struct Workspace {
    namespace: Namespace,
    tools: ToolRegistry,
    max_output_chars: usize,
    step: u64,
    outputs: HashMap<String, String>,
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("variables", &self.namespace.keys().collect::<Vec<_>>())
            .field("tools", &self.tools)
            .field("step", &self.step)
            .field("max_output_chars", &self.max_output_chars)
            .finish_non_exhaustive()
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Workspace {
    /// Create a builder.
    pub fn builder() -> WorkspaceBuilder {
        WorkspaceBuilder::default()
    }

    /// Execute a script against the namespace.
    ///
    /// Statements before a failing one keep their effects. The step counter
    /// is not touched.
    pub async fn execute(&mut self, code: &str) -> Execution {
        match Program::parse(code) {
            Ok(program) => self.execute_program(&program).await,
            Err(error) => Execution {
                error: Some(Fault::Script(error)),
                ..Execution::default()
            },
        }
    }

    async fn execute_program(&mut self, program: &Program) -> Execution {
        let mut interpreter = Interpreter {
            namespace: &mut self.namespace,
            outputs: &self.outputs,
            tools: &self.tools,
            step: self.step,
            stdout: String::new(),
            stderr: String::new(),
        };

        let error = match interpreter.run(program).await {
            Ok(()) => None,
            Err(Halt::Error(error)) => Some(Fault::Script(error)),
            Err(Halt::Complete(completion)) => Some(Fault::Interrupted(completion)),
        };

        Execution {
            stdout: interpreter.stdout,
            stderr: interpreter.stderr,
            error,
        }
    }

    /// Run one step: advance the counter, execute, and render the observation.
    ///
    /// Scripts that ask for interactive input are rejected before any
    /// statement runs.
    pub async fn run(&mut self, code: &str) -> RunOutcome {
        self.step += 1;
        let step = self.step;

        let execution = match Program::parse(code) {
            Ok(program) => match program.requests_input() {
                Some(line) => Execution {
                    error: Some(Fault::Script(ScriptError {
                        line,
                        kind: ScriptErrorKind::InputUnavailable,
                    })),
                    ..Execution::default()
                },
                None => self.execute_program(&program).await,
            },
            Err(error) => Execution {
                error: Some(Fault::Script(error)),
                ..Execution::default()
            },
        };

        let (status, exception, completion) = match &execution.error {
            None => (RunStatus::Continue, None, None),
            Some(Fault::Script(error)) => {
                let message = error.to_string();
                tracing::debug!(step, error = %message, "script failed");
                (RunStatus::Error(message.clone()), Some(message), None)
            }
            Some(Fault::Interrupted(completion)) => {
                tracing::debug!(step, success = completion.is_success(), "completion signalled");
                (
                    RunStatus::Complete {
                        report: completion.report(),
                        result: completion.result.clone(),
                    },
                    None,
                    Some(completion),
                )
            }
        };

        let observation = observation::render(
            ObservationParts {
                step,
                stdout: &execution.stdout,
                stderr: &execution.stderr,
                exception: exception.as_deref(),
                completion,
            },
            self.max_output_chars,
            &mut self.outputs,
        );

        RunOutcome {
            status,
            observation,
        }
    }

    /// Bind several variables, overwriting existing ones.
    pub fn insert_variables<K: Into<String>>(&mut self, vars: impl IntoIterator<Item = (K, Value)>) {
        self.namespace
            .extend(vars.into_iter().map(|(k, v)| (k.into(), Arc::new(v))));
    }

    /// Bind one variable, overwriting any existing value.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.namespace.insert(name.into(), Arc::new(value));
    }

    /// Read a variable.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.namespace.get(name).map(Arc::as_ref)
    }

    /// Read a variable's shared handle.
    pub fn shared_variable(&self, name: &str) -> Option<&Arc<Value>> {
        self.namespace.get(name)
    }

    /// The whole namespace.
    pub fn variables(&self) -> &Namespace {
        &self.namespace
    }

    /// Copy the named variables from `other`, sharing their values.
    ///
    /// Nothing is copied unless every name is bound in `other`.
    pub fn copy_variables_from(
        &mut self,
        other: &Workspace,
        names: &[&str],
    ) -> Result<(), WorkspaceError> {
        let missing: Vec<String> = names
            .iter()
            .filter(|name| !other.namespace.contains_key(**name))
            .map(|name| (*name).to_string())
            .collect();
        if !missing.is_empty() {
            return Err(WorkspaceError::MissingVariables(missing));
        }

        for name in names {
            if let Some(value) = other.namespace.get(*name) {
                self.namespace.insert((*name).to_string(), Arc::clone(value));
            }
        }
        Ok(())
    }

    /// A new workspace with a shallow copy of the namespace.
    ///
    /// Values are shared until rebound in either workspace. The fork starts
    /// with step 0 and an empty side channel.
    pub fn fork(&self) -> Workspace {
        Workspace {
            namespace: self.namespace.clone(),
            tools: self.tools.clone(),
            max_output_chars: self.max_output_chars,
            step: 0,
            outputs: HashMap::new(),
        }
    }

    /// Number of [`Workspace::run`] calls since creation or the last reset.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Reset the step counter to zero.
    ///
    /// The side channel is cleared too, since its names carry step numbers.
    pub fn reset_step_counter(&mut self) {
        self.step = 0;
        self.outputs.clear();
    }

    /// Full text of a truncated output section, by channel name (e.g. `stdout_3`).
    pub fn output(&self, name: &str) -> Option<&str> {
        self.outputs.get(name).map(String::as_str)
    }

    /// The tools callable from scripts.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }
}
