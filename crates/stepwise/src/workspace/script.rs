//! The action-script language run by the [`Workspace`](super::Workspace).
//!
//! Scripts are line oriented; `;` also separates statements, and newlines
//! inside brackets are ignored so JSON literals can span lines.
//!
//! ```text
//! # comment
//! let rows = read_sheet(path="q3.csv")     # tool call with keyword arguments
//! let first = rows[0]
//! print first.name
//! warn str(len(rows))                      # to stderr
//! del rows
//! raise "bad input"                        # runtime error
//! finish {"total": 42}                     # complete with a result
//! fail "no data for Q3"                    # complete with an error payload
//! ```
//!
//! Built-in functions: `len(x)`, `str(x)`, `output(name)`, `vars()`.
//! `input()` exists only to be rejected: no human is attached to a session.
//! Every other function name is looked up in the tool registry.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use thiserror::Error;

use super::Namespace;
use crate::tools::{Completion, SessionHandle, ToolError, ToolOutput, ToolRegistry};

/// Name of the interactive-input builtin rejected before execution.
pub const INPUT_FUNCTION: &str = "input";

/// Deepest expression nesting a script may use.
pub const MAX_NESTING: usize = 64;

/// Deepest list/object nesting a script may build.
pub const MAX_VALUE_DEPTH: usize = 128;

const KEYWORDS: &[&str] = &[
    "let", "print", "warn", "del", "raise", "finish", "fail", "true", "false", "null",
];

/// A runtime or syntax error in an action script, with its 1-based line.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {kind}")]
pub struct ScriptError {
    /// Line the error occurred on.
    pub line: usize,
    /// What went wrong.
    pub kind: ScriptErrorKind,
}

/// Kinds of [`ScriptError`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptErrorKind {
    /// The script does not parse.
    #[error("syntax error: {0}")]
    Syntax(String),
    /// Read of an unbound variable.
    #[error("name '{0}' is not defined")]
    UndefinedVariable(String),
    /// Call of a function that is neither a builtin nor a registered tool.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    /// Operation applied to a value of the wrong type.
    #[error("type error: {0}")]
    Type(String),
    /// Missing list index or object key.
    #[error("lookup error: {0}")]
    Lookup(String),
    /// Error raised by the script itself.
    #[error("raised: {0}")]
    Raised(String),
    /// A tool returned an error.
    #[error("tool '{tool}' failed: {error}")]
    Tool {
        /// Tool name.
        tool: String,
        /// The tool's error.
        error: ToolError,
    },
    /// A tool panicked.
    #[error("tool '{tool}' panicked: {message}")]
    ToolPanicked {
        /// Tool name.
        tool: String,
        /// Panic payload, if it was a string.
        message: String,
    },
    /// Interactive input was requested.
    #[error("input() is unavailable: no human is attached to this session")]
    InputUnavailable,
}

impl ScriptError {
    fn new(line: usize, kind: ScriptErrorKind) -> Self {
        Self { line, kind }
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(serde_json::Number),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Eq,
    Newline,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

fn lex(source: &str) -> Result<Vec<Token>, ScriptError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut depth = 0usize;
    let mut i = 0;

    let syntax = |line: usize, msg: String| ScriptError::new(line, ScriptErrorKind::Syntax(msg));

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' | ';' => {
                if depth == 0 {
                    tokens.push(Token {
                        tok: Tok::Newline,
                        line,
                    });
                }
                if c == '\n' {
                    line += 1;
                }
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' => {
                let start = i;
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '\\' => i += 2,
                        '"' => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        '\n' => break,
                        _ => i += 1,
                    }
                }
                if !closed {
                    return Err(syntax(line, "unterminated string literal".into()));
                }
                let raw: String = chars[start..i].iter().collect();
                let value: String = serde_json::from_str(&raw)
                    .map_err(|e| syntax(line, format!("bad string literal: {e}")))?;
                tokens.push(Token {
                    tok: Tok::Str(value),
                    line,
                });
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) =>
            {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || matches!(chars[i], '.' | 'e' | 'E')
                        || (matches!(chars[i], '+' | '-') && matches!(chars[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let number: serde_json::Number = serde_json::from_str(&raw)
                    .map_err(|_| syntax(line, format!("bad number literal '{raw}'")))?;
                tokens.push(Token {
                    tok: Tok::Num(number),
                    line,
                });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Ident(chars[start..i].iter().collect()),
                    line,
                });
            }
            _ => {
                let tok = match c {
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    '{' => Tok::LBrace,
                    '}' => Tok::RBrace,
                    ',' => Tok::Comma,
                    ':' => Tok::Colon,
                    '.' => Tok::Dot,
                    '=' => Tok::Eq,
                    other => return Err(syntax(line, format!("unexpected character '{other}'"))),
                };
                match tok {
                    Tok::LParen | Tok::LBracket | Tok::LBrace => {
                        depth += 1;
                        if depth > MAX_NESTING {
                            return Err(syntax(line, "nesting too deep".into()));
                        }
                    }
                    Tok::RParen | Tok::RBracket | Tok::RBrace => {
                        depth = depth
                            .checked_sub(1)
                            .ok_or_else(|| syntax(line, format!("unmatched '{c}'")))?;
                    }
                    _ => {}
                }
                tokens.push(Token { tok, line });
                i += 1;
            }
        }
    }

    tokens.push(Token {
        tok: Tok::Eof,
        line,
    });
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Call { name: String, args: Vec<Arg> },
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
struct Arg {
    name: Option<String>,
    value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum StmtKind {
    Let(String, Expr),
    Print(Expr),
    Warn(Expr),
    Del(String),
    Raise(Expr),
    Finish(Expr),
    Fail(Expr),
    Eval(Expr),
}

#[derive(Debug, Clone, PartialEq)]
struct Stmt {
    line: usize,
    kind: StmtKind,
}

/// A parsed action script.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    stmts: Vec<Stmt>,
}

impl Program {
    /// Parse a script. Nothing runs if any line fails to parse.
    pub fn parse(source: &str) -> Result<Program, ScriptError> {
        let tokens = lex(source)?;
        Parser { tokens, pos: 0 }.program()
    }

    /// Line of the first call to the interactive-input builtin, if any.
    pub fn requests_input(&self) -> Option<usize> {
        self.stmts.iter().find_map(|stmt| {
            let found = match &stmt.kind {
                StmtKind::Del(_) => false,
                StmtKind::Let(_, e)
                | StmtKind::Print(e)
                | StmtKind::Warn(e)
                | StmtKind::Raise(e)
                | StmtKind::Finish(e)
                | StmtKind::Fail(e)
                | StmtKind::Eval(e) => calls_input(e),
            };
            found.then_some(stmt.line)
        })
    }

    /// Number of statements.
    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    /// Whether the script has no statements.
    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }
}

fn calls_input(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(_) | Expr::Var(_) => false,
        Expr::List(items) => items.iter().any(calls_input),
        Expr::Object(fields) => fields.iter().any(|(_, e)| calls_input(e)),
        Expr::Call { name, args } => {
            name == INPUT_FUNCTION || args.iter().any(|a| calls_input(&a.value))
        }
        Expr::Field(inner, _) => calls_input(inner),
        Expr::Index(inner, index) => calls_input(inner) || calls_input(index),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::new(self.line(), ScriptErrorKind::Syntax(message.into()))
    }

    /// Reject expressions nested deeper than [`MAX_NESTING`].
    fn nested(&self, expr: Expr) -> Result<Expr, ScriptError> {
        if height(&expr) > MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        Ok(expr)
    }

    fn consume(&mut self, expected: Tok, what: &str) -> Result<(), ScriptError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {}", describe(self.peek()))))
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, ScriptError> {
        match self.peek().clone() {
            Tok::Ident(name) if !KEYWORDS.contains(&name.as_str()) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected {what}, found {}", describe(&other)))),
        }
    }

    fn program(mut self) -> Result<Program, ScriptError> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                _ => {
                    stmts.push(self.statement()?);
                    match self.peek() {
                        Tok::Newline | Tok::Eof => {}
                        other => {
                            return Err(self.error(format!(
                                "expected end of statement, found {}",
                                describe(other)
                            )));
                        }
                    }
                }
            }
        }
        Ok(Program { stmts })
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Ident(word) => word.clone(),
            _ => String::new(),
        };

        let kind = match keyword.as_str() {
            "let" => {
                self.advance();
                let name = self.ident("variable name")?;
                self.consume(Tok::Eq, "'='")?;
                StmtKind::Let(name, self.expr()?)
            }
            "del" => {
                self.advance();
                StmtKind::Del(self.ident("variable name")?)
            }
            "print" => {
                self.advance();
                StmtKind::Print(self.expr()?)
            }
            "warn" => {
                self.advance();
                StmtKind::Warn(self.expr()?)
            }
            "raise" => {
                self.advance();
                StmtKind::Raise(self.expr()?)
            }
            "finish" => {
                self.advance();
                StmtKind::Finish(self.expr()?)
            }
            "fail" => {
                self.advance();
                StmtKind::Fail(self.expr()?)
            }
            _ => StmtKind::Eval(self.expr()?),
        };

        Ok(Stmt { line, kind })
    }

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let field = match self.advance() {
                        Tok::Ident(name) => name,
                        other => {
                            return Err(
                                self.error(format!("expected field name, found {}", describe(&other)))
                            );
                        }
                    };
                    expr = self.nested(Expr::Field(Box::new(expr), field))?;
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.expr()?;
                    self.consume(Tok::RBracket, "']'")?;
                    expr = self.nested(Expr::Index(Box::new(expr), Box::new(index)))?;
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        match self.advance() {
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::Num(n) => Ok(Expr::Literal(Value::Number(n))),
            Tok::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                w if KEYWORDS.contains(&w) => {
                    Err(self.error(format!("unexpected keyword '{w}'")))
                }
                _ if *self.peek() == Tok::LParen => {
                    self.advance();
                    let args = self.args()?;
                    self.nested(Expr::Call { name: word, args })
                }
                _ => Ok(Expr::Var(word)),
            },
            Tok::LParen => {
                let inner = self.expr()?;
                self.consume(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                while *self.peek() != Tok::RBracket {
                    items.push(self.expr()?);
                    if *self.peek() != Tok::Comma {
                        break;
                    }
                    self.advance();
                }
                self.consume(Tok::RBracket, "']'")?;
                self.nested(Expr::List(items))
            }
            Tok::LBrace => {
                let mut fields = Vec::new();
                while *self.peek() != Tok::RBrace {
                    let key = match self.advance() {
                        Tok::Str(key) => key,
                        Tok::Ident(key) => key,
                        other => {
                            return Err(
                                self.error(format!("expected object key, found {}", describe(&other)))
                            );
                        }
                    };
                    self.consume(Tok::Colon, "':'")?;
                    fields.push((key, self.expr()?));
                    if *self.peek() != Tok::Comma {
                        break;
                    }
                    self.advance();
                }
                self.consume(Tok::RBrace, "'}'")?;
                self.nested(Expr::Object(fields))
            }
            other => Err(self.error(format!("expected expression, found {}", describe(&other)))),
        }
    }

    fn args(&mut self) -> Result<Vec<Arg>, ScriptError> {
        let mut args = Vec::new();
        while *self.peek() != Tok::RParen {
            let keyword = match (self.peek(), self.tokens.get(self.pos + 1).map(|t| &t.tok)) {
                (Tok::Ident(name), Some(Tok::Eq)) => Some(name.clone()),
                _ => None,
            };
            if keyword.is_some() {
                self.advance();
                self.advance();
            }
            args.push(Arg {
                name: keyword,
                value: self.expr()?,
            });
            if *self.peek() != Tok::Comma {
                break;
            }
            self.advance();
        }
        self.consume(Tok::RParen, "')'")?;
        Ok(args)
    }
}

/// Height of an expression tree. Children were checked when they were built,
/// so the recursion is bounded by [`MAX_NESTING`].
fn height(expr: &Expr) -> usize {
    let children = match expr {
        Expr::Literal(_) | Expr::Var(_) => 0,
        Expr::List(items) => items.iter().map(height).max().unwrap_or(0),
        Expr::Object(fields) => fields.iter().map(|(_, e)| height(e)).max().unwrap_or(0),
        Expr::Call { args, .. } => args.iter().map(|a| height(&a.value)).max().unwrap_or(0),
        Expr::Field(inner, _) => height(inner),
        Expr::Index(inner, index) => height(inner).max(height(index)),
    };
    children + 1
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Ident(name) => format!("'{name}'"),
        Tok::Str(_) => "string".to_string(),
        Tok::Num(n) => format!("number {n}"),
        Tok::LParen => "'('".to_string(),
        Tok::RParen => "')'".to_string(),
        Tok::LBracket => "'['".to_string(),
        Tok::RBracket => "']'".to_string(),
        Tok::LBrace => "'{'".to_string(),
        Tok::RBrace => "'}'".to_string(),
        Tok::Comma => "','".to_string(),
        Tok::Colon => "':'".to_string(),
        Tok::Dot => "'.'".to_string(),
        Tok::Eq => "'='".to_string(),
        Tok::Newline => "end of line".to_string(),
        Tok::Eof => "end of script".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// Why evaluation stopped early.
#[derive(Debug)]
pub(crate) enum Halt {
    Error(ScriptError),
    Complete(Completion),
}

impl From<ScriptError> for Halt {
    fn from(error: ScriptError) -> Self {
        Halt::Error(error)
    }
}

/// Render a value for stdout/stderr: strings verbatim, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) struct Interpreter<'a> {
    pub(crate) namespace: &'a mut Namespace,
    pub(crate) outputs: &'a HashMap<String, String>,
    pub(crate) tools: &'a ToolRegistry,
    pub(crate) step: u64,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

impl Interpreter<'_> {
    pub(crate) async fn run(&mut self, program: &Program) -> Result<(), Halt> {
        for stmt in &program.stmts {
            self.statement(stmt).await?;
        }
        Ok(())
    }

    async fn statement(&mut self, stmt: &Stmt) -> Result<(), Halt> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Let(name, expr) => {
                let value = self.eval(expr, line).await?;
                self.namespace.insert(name.clone(), value);
            }
            StmtKind::Del(name) => {
                if self.namespace.remove(name).is_none() {
                    return Err(ScriptError::new(
                        line,
                        ScriptErrorKind::UndefinedVariable(name.clone()),
                    )
                    .into());
                }
            }
            StmtKind::Print(expr) => {
                let value = self.eval(expr, line).await?;
                self.stdout.push_str(&display_value(&value));
                self.stdout.push('\n');
            }
            StmtKind::Warn(expr) => {
                let value = self.eval(expr, line).await?;
                self.stderr.push_str(&display_value(&value));
                self.stderr.push('\n');
            }
            StmtKind::Raise(expr) => {
                let value = self.eval(expr, line).await?;
                return Err(
                    ScriptError::new(line, ScriptErrorKind::Raised(display_value(&value))).into(),
                );
            }
            StmtKind::Finish(expr) => {
                let value = self.eval(expr, line).await?;
                return Err(Halt::Complete(Completion::success(value.as_ref().clone())));
            }
            StmtKind::Fail(expr) => {
                let value = self.eval(expr, line).await?;
                return Err(Halt::Complete(Completion::failure(display_value(&value))));
            }
            StmtKind::Eval(expr) => {
                self.eval(expr, line).await?;
            }
        }
        Ok(())
    }

    fn eval<'s>(
        &'s mut self,
        expr: &'s Expr,
        line: usize,
    ) -> BoxFuture<'s, Result<Arc<Value>, Halt>> {
        Box::pin(async move {
            let err = |kind| Halt::Error(ScriptError::new(line, kind));
            match expr {
                Expr::Literal(value) => Ok(Arc::new(value.clone())),
                Expr::Var(name) => self
                    .namespace
                    .get(name)
                    .cloned()
                    .ok_or_else(|| err(ScriptErrorKind::UndefinedVariable(name.clone()))),
                Expr::List(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval(item, line).await?.as_ref().clone());
                    }
                    nest_value(Value::Array(values)).map_err(err)
                }
                Expr::Object(fields) => {
                    let mut map = Map::new();
                    for (key, item) in fields {
                        let value = self.eval(item, line).await?;
                        map.insert(key.clone(), value.as_ref().clone());
                    }
                    nest_value(Value::Object(map)).map_err(err)
                }
                Expr::Field(inner, field) => {
                    let value = self.eval(inner, line).await?;
                    match value.as_ref() {
                        Value::Object(map) => map.get(field).cloned().map(Arc::new).ok_or_else(
                            || err(ScriptErrorKind::Lookup(format!("no field '{field}'"))),
                        ),
                        other => Err(err(ScriptErrorKind::Type(format!(
                            "cannot read field '{field}' of {}",
                            type_name(other)
                        )))),
                    }
                }
                Expr::Index(inner, index) => {
                    let value = self.eval(inner, line).await?;
                    let index = self.eval(index, line).await?;
                    lookup(&value, &index).map(Arc::new).map_err(err)
                }
                Expr::Call { name, args } => self.call(name, args, line).await,
            }
        })
    }

    async fn call(&mut self, name: &str, args: &[Arg], line: usize) -> Result<Arc<Value>, Halt> {
        let err = |kind| Halt::Error(ScriptError::new(line, kind));

        if name == INPUT_FUNCTION {
            return Err(err(ScriptErrorKind::InputUnavailable));
        }

        if let Some(builtin) = Builtin::from_name(name) {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                if arg.name.is_some() {
                    return Err(err(ScriptErrorKind::Type(format!(
                        "{name}() takes positional arguments only"
                    ))));
                }
                values.push(self.eval(&arg.value, line).await?);
            }
            return self.builtin(builtin, &values).map(Arc::new).map_err(err);
        }

        let Some(tool) = self.tools.get(name) else {
            return Err(err(ScriptErrorKind::UnknownFunction(name.to_string())));
        };

        let mut kwargs = Map::new();
        for arg in args {
            let Some(key) = &arg.name else {
                return Err(err(ScriptErrorKind::Type(format!(
                    "tool '{name}' takes keyword arguments only"
                ))));
            };
            let value = self.eval(&arg.value, line).await?;
            kwargs.insert(key.clone(), value.as_ref().clone());
        }

        tracing::debug!(tool = %name, step = self.step, "invoking tool");
        let mut session = SessionHandle::new(self.step, self.namespace, self.outputs);
        let outcome = AssertUnwindSafe(tool.invoke(&mut session, kwargs))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(ToolOutput::Value(value))) => Ok(Arc::new(value)),
            Ok(Ok(ToolOutput::Complete(completion))) => Err(Halt::Complete(completion)),
            Ok(Err(error)) => Err(err(ScriptErrorKind::Tool {
                tool: name.to_string(),
                error,
            })),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::warn!(tool = %name, %message, "tool panicked");
                Err(err(ScriptErrorKind::ToolPanicked {
                    tool: name.to_string(),
                    message,
                }))
            }
        }
    }

    fn builtin(&self, builtin: Builtin, args: &[Arc<Value>]) -> Result<Value, ScriptErrorKind> {
        let arity = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                Err(ScriptErrorKind::Type(format!(
                    "{}() takes {n} argument(s), got {}",
                    builtin.name(),
                    args.len()
                )))
            }
        };

        match builtin {
            Builtin::Len => {
                arity(1)?;
                let len = match args[0].as_ref() {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    other => {
                        return Err(ScriptErrorKind::Type(format!(
                            "len() of {}",
                            type_name(other)
                        )));
                    }
                };
                Ok(Value::from(len))
            }
            Builtin::Str => {
                arity(1)?;
                Ok(Value::String(display_value(&args[0])))
            }
            Builtin::Output => {
                arity(1)?;
                let Value::String(channel) = args[0].as_ref() else {
                    return Err(ScriptErrorKind::Type(
                        "output() takes a channel name".to_string(),
                    ));
                };
                self.outputs
                    .get(channel)
                    .map(|text| Value::String(text.clone()))
                    .ok_or_else(|| ScriptErrorKind::Lookup(format!("no output named '{channel}'")))
            }
            Builtin::Vars => {
                arity(0)?;
                Ok(Value::Array(
                    self.namespace.keys().cloned().map(Value::String).collect(),
                ))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Builtin {
    Len,
    Str,
    Output,
    Vars,
}

impl Builtin {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "len" => Some(Builtin::Len),
            "str" => Some(Builtin::Str),
            "output" => Some(Builtin::Output),
            "vars" => Some(Builtin::Vars),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::Str => "str",
            Builtin::Output => "output",
            Builtin::Vars => "vars",
        }
    }
}

fn nest_value(value: Value) -> Result<Arc<Value>, ScriptErrorKind> {
    if deeper_than(&value, MAX_VALUE_DEPTH) {
        return Err(ScriptErrorKind::Type(format!(
            "values cannot nest more than {MAX_VALUE_DEPTH} levels deep"
        )));
    }
    Ok(Arc::new(value))
}

/// Whether `value` nests more than `limit` containers deep. Stops descending
/// once the limit is reached.
fn deeper_than(value: &Value, limit: usize) -> bool {
    match value {
        Value::Array(items) => limit == 0 || items.iter().any(|v| deeper_than(v, limit - 1)),
        Value::Object(map) => limit == 0 || map.values().any(|v| deeper_than(v, limit - 1)),
        _ => false,
    }
}

fn lookup(value: &Value, index: &Value) -> Result<Value, ScriptErrorKind> {
    match (value, index) {
        (Value::Array(items), Value::Number(n)) => {
            let i = n
                .as_i64()
                .ok_or_else(|| ScriptErrorKind::Type(format!("list index must be an integer, got {n}")))?;
            let len = items.len() as i64;
            let resolved = if i < 0 { len + i } else { i };
            usize::try_from(resolved)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .ok_or_else(|| ScriptErrorKind::Lookup(format!("index {i} out of range for length {len}")))
        }
        (Value::Object(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| ScriptErrorKind::Lookup(format!("no key '{key}'"))),
        (container, index) => Err(ScriptErrorKind::Type(format!(
            "cannot index {} with {}",
            type_name(container),
            type_name(index)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statements() {
        let program = Program::parse(
            "# setup\nlet x = 1\nprint x; warn \"careful\"\n\ndel x\nfinish {\"a\": [1, 2],\n  b: null}\n",
        )
        .unwrap();
        assert_eq!(program.len(), 5);
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = Program::parse("let x = 1\nlet = 2\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(matches!(err.kind, ScriptErrorKind::Syntax(_)));
    }

    #[test]
    fn test_parse_rejects_trailing_tokens() {
        assert!(Program::parse("print 1 2").is_err());
    }

    #[test]
    fn test_parse_unterminated_string() {
        let err = Program::parse("print \"oops\n").unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn test_parse_unmatched_bracket() {
        assert!(Program::parse("print ]").is_err());
        assert!(Program::parse("print [1, 2").is_err());
    }

    #[test]
    fn test_keyword_cannot_be_variable() {
        assert!(Program::parse("let print = 1").is_err());
    }

    #[test]
    fn test_requests_input() {
        assert_eq!(Program::parse("let a = input()").unwrap().requests_input(), Some(1));
        assert_eq!(
            Program::parse("print 1\nprint str(input(\"name?\"))")
                .unwrap()
                .requests_input(),
            Some(2)
        );
        assert_eq!(Program::parse("let input_path = 1").unwrap().requests_input(), None);
    }

    #[test]
    fn test_negative_numbers_and_exponents() {
        let program = Program::parse("let a = [-1, 2.5e3, 1E-2]").unwrap();
        assert_eq!(program.len(), 1);
    }

    #[test]
    fn test_lookup() {
        let list = serde_json::json!([10, 20, 30]);
        assert_eq!(lookup(&list, &serde_json::json!(1)).unwrap(), 20);
        assert_eq!(lookup(&list, &serde_json::json!(-1)).unwrap(), 30);
        assert!(matches!(
            lookup(&list, &serde_json::json!(3)),
            Err(ScriptErrorKind::Lookup(_))
        ));
        let obj = serde_json::json!({"k": "v"});
        assert_eq!(lookup(&obj, &serde_json::json!("k")).unwrap(), "v");
        assert!(matches!(
            lookup(&obj, &serde_json::json!(0)),
            Err(ScriptErrorKind::Type(_))
        ));
    }

    #[test]
    fn test_parse_rejects_deep_nesting() {
        let deep = format!("let a = {}1{}", "[".repeat(10_000), "]".repeat(10_000));
        let err = Program::parse(&deep).unwrap_err();
        assert_eq!(err.kind, ScriptErrorKind::Syntax("nesting too deep".into()));

        let chain = format!("print a{}", ".b".repeat(10_000));
        let err = Program::parse(&chain).unwrap_err();
        assert_eq!(err.kind, ScriptErrorKind::Syntax("nesting too deep".into()));

        let shallow = format!("let a = {}1{}", "[".repeat(32), "]".repeat(32));
        assert!(Program::parse(&shallow).is_ok());
    }

    #[tokio::test]
    async fn test_run_deep_literal_is_an_error() {
        let mut ws = super::super::Workspace::default();
        let depth = 10_000;
        let outcome = ws
            .run(&format!("let a = {}1{}", "[".repeat(depth), "]".repeat(depth)))
            .await;
        let super::super::RunStatus::Error(message) = &outcome.status else {
            panic!("expected an error, got {:?}", outcome.status);
        };
        assert!(message.contains("nesting too deep"));

        // The workspace is still usable afterwards
        let outcome = ws.run("print 1").await;
        assert_eq!(outcome.status, super::super::RunStatus::Continue);
    }

    #[tokio::test]
    async fn test_values_built_across_statements_are_capped() {
        let mut ws = super::super::Workspace::default();
        let script = format!("let a = 1\n{}", "let a = [a]\n".repeat(MAX_VALUE_DEPTH + 1));
        let outcome = ws.run(&script).await;
        let super::super::RunStatus::Error(message) = &outcome.status else {
            panic!("expected an error, got {:?}", outcome.status);
        };
        assert!(message.contains("levels deep"));
    }

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&serde_json::json!("plain")), "plain");
        assert_eq!(display_value(&serde_json::json!([1, "a"])), "[1,\"a\"]");
    }
}
