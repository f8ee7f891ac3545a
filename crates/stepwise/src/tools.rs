//! Tool definitions and registry for the action sandbox.
//!
//! Tools are external capabilities that action scripts call by name, e.g.
//! `let rows = read_sheet(path="q3.csv")`. This module provides:
//!
//! - [`ToolDefinition`] - A tool's schema (name, description, JSON Schema parameters)
//! - [`Tool`] - The capability trait every tool implements
//! - [`ToolRegistry`] - Name to tool mapping, built once at startup
//! - [`SessionHandle`] - The explicit session handle passed to each invocation
//!
//! A tool can end the session by returning [`ToolOutput::Complete`]. A tool
//! returns either a value, an error, or a completion; it cannot do more than
//! one of these in the same call.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::workspace::Namespace;

/// Summary of a tool for index listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSummary {
    /// Tool name (unique identifier).
    pub name: String,
    /// One-line description.
    pub description: String,
}

/// Full definition of a tool including its parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (unique identifier).
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's keyword arguments.
    #[serde(default)]
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    ///
    /// # Example
    ///
    /// ```rust
    /// use stepwise::tools::ToolDefinition;
    /// use serde_json::json;
    ///
    /// let tool = ToolDefinition::new(
    ///     "read_sheet",
    ///     "Read a spreadsheet into a list of rows",
    ///     json!({
    ///         "type": "object",
    ///         "properties": {
    ///             "path": { "type": "string" }
    ///         },
    ///         "required": ["path"]
    ///     }),
    /// );
    /// assert_eq!(tool.name, "read_sheet");
    /// ```
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Create a tool definition with no parameters.
    pub fn no_params(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    /// Get a summary of this tool.
    pub fn summary(&self) -> ToolSummary {
        ToolSummary {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

/// The out-of-band completion signal.
///
/// Completion is not automatically success: a completion carrying an error
/// payload ends the session as a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Final result, or the error that ended the task.
    pub result: Result<Value, String>,
}

impl Completion {
    /// Complete the task with a result.
    pub fn success(value: impl Into<Value>) -> Self {
        Self {
            result: Ok(value.into()),
        }
    }

    /// Give up on the task with an error payload.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: Err(error.into()),
        }
    }

    /// Whether the completion carries a normal result.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The final report: string results verbatim, other values as JSON, errors as their message.
    pub fn report(&self) -> String {
        match &self.result {
            Ok(Value::String(s)) => s.clone(),
            Ok(other) => other.to_string(),
            Err(error) => error.clone(),
        }
    }
}

/// What a tool invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// A value returned to the calling script.
    Value(Value),
    /// The tool ends the session.
    Complete(Completion),
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Completion> for ToolOutput {
    fn from(completion: Completion) -> Self {
        Self::Complete(completion)
    }
}

/// Errors returned by tools. They surface to the model as script errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// The arguments do not match what the tool expects.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// The tool ran and failed.
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// Create a [`ToolError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Explicit handle to the running session, passed to every tool invocation.
///
/// Tools get access to the sandbox namespace and the side channel through
/// this handle instead of holding a reference to the session.
pub struct SessionHandle<'a> {
    step: u64,
    namespace: &'a mut Namespace,
    outputs: &'a HashMap<String, String>,
}

impl fmt::Debug for SessionHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("step", &self.step)
            .field("variables", &self.namespace.len())
            .finish_non_exhaustive()
    }
}

impl<'a> SessionHandle<'a> {
    pub(crate) fn new(
        step: u64,
        namespace: &'a mut Namespace,
        outputs: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            step,
            namespace,
            outputs,
        }
    }

    /// The sandbox step counter at the time of the call.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Read a variable from the sandbox namespace.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.namespace.get(name).map(Arc::as_ref)
    }

    /// Bind or overwrite a variable in the sandbox namespace.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.namespace.insert(name.into(), Arc::new(value));
    }

    /// Read a parked oversized output by channel name.
    pub fn output(&self, name: &str) -> Option<&str> {
        self.outputs.get(name).map(String::as_str)
    }
}

/// A capability callable from action scripts.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::{Map, Value, json};
/// use stepwise::tools::{SessionHandle, Tool, ToolDefinition, ToolError, ToolOutput};
///
/// struct Add;
///
/// #[async_trait]
/// impl Tool for Add {
///     fn definition(&self) -> ToolDefinition {
///         ToolDefinition::no_params("add", "Add a and b")
///     }
///
///     async fn invoke(
///         &self,
///         _session: &mut SessionHandle<'_>,
///         args: Map<String, Value>,
///     ) -> Result<ToolOutput, ToolError> {
///         let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
///         let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
///         Ok(json!(a + b).into())
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's definition, used for registration and documentation.
    fn definition(&self) -> ToolDefinition;

    /// Invoke the tool with keyword arguments.
    async fn invoke(
        &self,
        session: &mut SessionHandle<'_>,
        args: Map<String, Value>,
    ) -> Result<ToolOutput, ToolError>;
}

/// A tool backed by a synchronous closure.
pub struct FnTool<F> {
    definition: ToolDefinition,
    func: F,
}

impl<F> fmt::Debug for FnTool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl<F> FnTool<F>
where
    F: Fn(&mut SessionHandle<'_>, Map<String, Value>) -> Result<ToolOutput, ToolError>
        + Send
        + Sync,
{
    /// Wrap a closure as a tool.
    pub fn new(definition: ToolDefinition, func: F) -> Self {
        Self { definition, func }
    }
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(&mut SessionHandle<'_>, Map<String, Value>) -> Result<ToolOutput, ToolError>
        + Send
        + Sync,
{
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn invoke(
        &self,
        session: &mut SessionHandle<'_>,
        args: Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        (self.func)(session, args)
    }
}

/// Registry mapping tool names to capabilities.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its definition name, replacing any previous one.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        tracing::debug!(tool = %name, "registering tool");
        self.tools.insert(name, tool);
    }

    /// Builder-style [`ToolRegistry::register`].
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Check if a tool exists.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all tools (name and description only), sorted by name.
    pub fn list_tools(&self) -> Vec<ToolSummary> {
        self.definitions().iter().map(ToolDefinition::summary).collect()
    }

    /// Full definitions of all tools, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Generate the tool documentation shown to the model at session start.
///
/// Format: an aligned index (one tool per line), then each tool's parameter
/// schema.
///
/// ```text
/// read_sheet     Read a spreadsheet into a list of rows
/// send_mail      Send an email
/// ```
pub fn generate_tool_docs(tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return String::from("No tools are available.\n");
    }

    // Find max name length for alignment
    let max_name_len = tools.iter().map(|t| t.name.len()).max().unwrap_or(0);
    let padding = max_name_len + 4;

    let mut output = String::new();
    for tool in tools {
        let spaces = " ".repeat(padding - tool.name.len());
        output.push_str(&tool.name);
        output.push_str(&spaces);
        output.push_str(&tool.description);
        output.push('\n');
    }

    for tool in tools {
        let schema =
            serde_json::to_string_pretty(&tool.parameters).unwrap_or_else(|_| "{}".to_string());
        output.push_str(&format!("\n## {}\n{schema}\n", tool.name));
    }
    output
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool() -> impl Tool {
        FnTool::new(
            ToolDefinition::new(
                "echo",
                "Return the text argument",
                json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            ),
            |_session, args| {
                let text = args
                    .get("text")
                    .cloned()
                    .ok_or_else(|| ToolError::InvalidArguments("missing text".into()))?;
                Ok(ToolOutput::Value(text))
            },
        )
    }

    #[test]
    fn test_tool_definition_no_params() {
        let tool = ToolDefinition::no_params("simple", "A simple tool");

        assert_eq!(tool.name, "simple");
        assert!(tool.parameters["properties"].is_object());
    }

    #[test]
    fn test_completion_report() {
        assert_eq!(Completion::success("R").report(), "R");
        assert_eq!(Completion::success(json!({"n": 1})).report(), "{\"n\":1}");
        assert_eq!(Completion::failure("no data").report(), "no data");
        assert!(Completion::success(json!(null)).is_success());
        assert!(!Completion::failure("x").is_success());
    }

    #[test]
    fn test_registry_register_and_get() {
        let registry = ToolRegistry::new().with(echo_tool());

        assert!(registry.has_tool("echo"));
        assert!(!registry.has_tool("nonexistent"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_some());
    }

    #[test]
    fn test_registry_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool());
        registry.register(echo_tool());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_fn_tool_invoke() {
        let tool = echo_tool();
        let mut namespace = Namespace::new();
        let outputs = HashMap::new();
        let mut session = SessionHandle::new(1, &mut namespace, &outputs);

        let mut args = Map::new();
        args.insert("text".into(), json!("hi"));
        let output = tool.invoke(&mut session, args).await.unwrap();
        assert_eq!(output, ToolOutput::Value(json!("hi")));

        let err = tool.invoke(&mut session, Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_session_handle_variables() {
        let mut namespace = Namespace::new();
        let outputs = HashMap::from([("stdout_2".to_string(), "big".to_string())]);
        let mut session = SessionHandle::new(2, &mut namespace, &outputs);

        session.set_variable("x", json!(5));
        assert_eq!(session.variable("x"), Some(&json!(5)));
        assert_eq!(session.output("stdout_2"), Some("big"));
        assert_eq!(session.step(), 2);
        assert!(namespace.contains_key("x"));
    }

    #[test]
    fn test_generate_tool_docs_empty() {
        assert!(generate_tool_docs(&[]).contains("No tools"));
    }

    #[test]
    fn test_generate_tool_docs_alignment() {
        let tools = vec![
            ToolDefinition::no_params("a", "Short"),
            ToolDefinition::no_params("longer_name", "Longer"),
        ];

        let docs = generate_tool_docs(&tools);
        let lines: Vec<_> = docs.lines().collect();

        let a_desc_start = lines[0].find("Short").expect("should find Short");
        let longer_desc_start = lines[1].find("Longer").expect("should find Longer");

        // Both descriptions should start at the same column
        assert_eq!(a_desc_start, longer_desc_start);
        assert!(docs.contains("## longer_name"));
    }
}
