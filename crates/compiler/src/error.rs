//! Compiler error type
//!
//! Every lexer and parser failure renders as `file:line:col: message`, the
//! shape editors use to jump to the offending site.

use std::sync::Arc;

/// A compilation failure with its source position.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub file: Option<Arc<str>>,
    pub line: u64,
    pub col: u64,
    pub message: String,
}

impl CompileError {
    pub fn new(file: Arc<str>, line: u64, col: u64, message: impl Into<String>) -> Self {
        CompileError {
            file: Some(file),
            line,
            col,
            message: message.into(),
        }
    }

    /// An error with no source position (I/O before lexing starts).
    pub fn no_pos(message: impl Into<String>) -> Self {
        CompileError {
            file: None,
            line: 0,
            col: 0,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}: {}", file, self.line, self.col, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CompileError {}
