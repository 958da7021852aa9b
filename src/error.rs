use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use rhai::{EvalAltResult, ParseError, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptErrorKind {
    Parse,
    Runtime,
    Timeout,
}

impl ScriptErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ScriptErrorKind::Parse => "parse error",
            ScriptErrorKind::Runtime => "runtime error",
            ScriptErrorKind::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptError {
    pub kind: ScriptErrorKind,
    pub message: String,
    pub unit: String,
    /// Line within the containing document, offset by the unit's start line.
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub url: Option<String>,
}

impl ScriptError {
    pub(crate) fn parse(unit: &str, start_line: usize, err: &ParseError) -> Self {
        let (line, column) = offset_position(start_line, err.1);
        Self {
            kind: ScriptErrorKind::Parse,
            message: err.0.to_string(),
            unit: unit.to_string(),
            line,
            column,
            url: None,
        }
    }

    pub(crate) fn runtime(unit: &str, start_line: usize, err: &EvalAltResult) -> Self {
        let (line, column) = offset_position(start_line, err.position());
        Self {
            kind: ScriptErrorKind::Runtime,
            message: err.to_string(),
            unit: unit.to_string(),
            line,
            column,
            url: None,
        }
    }

    pub(crate) fn timeout(unit: &str, start_line: usize, position: Position) -> Self {
        let (line, column) = offset_position(start_line, position);
        Self {
            kind: ScriptErrorKind::Timeout,
            message: "evaluation exceeded the configured script deadline".to_string(),
            unit: unit.to_string(),
            line,
            column,
            url: None,
        }
    }

    pub(crate) fn contract(message: impl Into<String>) -> Self {
        Self {
            kind: ScriptErrorKind::Runtime,
            message: message.into(),
            unit: String::new(),
            line: None,
            column: None,
            url: None,
        }
    }
}

fn offset_position(start_line: usize, position: Position) -> (Option<usize>, Option<usize>) {
    let start_line = start_line.max(1);
    (position.line().map(|line| start_line + line - 1), position.position())
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.label())?;
        if !self.unit.is_empty() {
            write!(f, " in '{}'", self.unit)?;
        }
        if let Some(line) = self.line {
            write!(f, " at line {line}")?;
            if let Some(column) = self.column {
                write!(f, ", position {column}")?;
            }
        }
        if let Some(url) = &self.url {
            write!(f, " ({url})")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for ScriptError {}

/// Observes every script failure, synchronous or background, regardless of
/// the throw-on-error setting.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &ScriptError);
}

pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: &ScriptError) {
        eprintln!("[script] {error}");
    }
}

#[derive(Clone, Default)]
pub struct CollectingReporter {
    errors: Arc<Mutex<Vec<ScriptError>>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> Vec<ScriptError> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, error: &ScriptError) {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).push(error.clone());
    }
}
