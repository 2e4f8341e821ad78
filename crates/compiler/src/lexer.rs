//! Lexer for Buzz source text
//!
//! Byte-accurate tokenizer tracking `(line, col)` from (1, 0). Newlines
//! and `;` yield statement terminators; `#` starts an end-of-line
//! comment. `include "path"` directives are resolved here: the named file
//! is pushed onto the file stack and tokens flow from it until EOF, at
//! which point the including file resumes. Inclusion is once-only per
//! compilation, keyed on the canonicalized path, so diamond and cyclic
//! includes are both harmless.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CompileError;

/// Environment variable holding the colon-separated include search path.
pub const INCLUDE_PATH_VAR: &str = "BUZZ_INCLUDE_PATH";

/// Kinds of token produced by the lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Id,
    Const,
    String,
    Var,
    Nil,
    If,
    Else,
    Fun,
    Return,
    For,
    While,
    AndOr,
    Not,
    AddSub,
    MulDiv,
    Mod,
    Pow,
    BlockOpen,
    BlockClose,
    ParOpen,
    ParClose,
    IdxOpen,
    IdxClose,
    StateEnd,
    ListSep,
    Assign,
    Dot,
    Cmp,
}

impl TokenKind {
    /// Human-readable description for error messages.
    pub fn desc(self) -> &'static str {
        match self {
            TokenKind::Id => "identifier",
            TokenKind::Const => "numeric constant",
            TokenKind::String => "string",
            TokenKind::Var => "var",
            TokenKind::Nil => "nil",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::Fun => "function",
            TokenKind::Return => "return",
            TokenKind::For => "for",
            TokenKind::While => "while",
            TokenKind::AndOr => "and/or",
            TokenKind::Not => "not",
            TokenKind::AddSub => "+ or -",
            TokenKind::MulDiv => "* or /",
            TokenKind::Mod => "%",
            TokenKind::Pow => "^",
            TokenKind::BlockOpen => "{",
            TokenKind::BlockClose => "}",
            TokenKind::ParOpen => "(",
            TokenKind::ParClose => ")",
            TokenKind::IdxOpen => "[",
            TokenKind::IdxClose => "]",
            TokenKind::StateEnd => "; or newline",
            TokenKind::ListSep => ",",
            TokenKind::Assign => "=",
            TokenKind::Dot => ".",
            TokenKind::Cmp => "== != < <= > >=",
        }
    }
}

/// A token with its source position.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub line: u64,
    pub col: u64,
    pub file: Arc<str>,
}

impl Token {
    /// Statement terminators produced by newlines (as opposed to `;`).
    /// The parser skips these freely between clauses.
    pub fn is_newline_end(&self) -> bool {
        self.kind == TokenKind::StateEnd && self.value == "\n"
    }
}

struct LexFile {
    name: Arc<str>,
    buf: Vec<u8>,
    cur: usize,
    line: u64,
    col: u64,
}

impl LexFile {
    fn open(fname: &str) -> Result<(PathBuf, LexFile), std::io::Error> {
        // Try the path as given, then each directory of the include path.
        let mut content = std::fs::read(fname);
        let mut path = PathBuf::from(fname);
        if content.is_err() {
            if let Ok(incpath) = std::env::var(INCLUDE_PATH_VAR) {
                for dir in incpath.split(':').filter(|d| !d.is_empty()) {
                    let candidate = Path::new(dir).join(fname);
                    if let Ok(data) = std::fs::read(&candidate) {
                        content = Ok(data);
                        path = candidate;
                        break;
                    }
                }
            }
        }
        let mut buf = content?;
        // A trailing newline guarantees the last statement terminates.
        buf.push(b'\n');
        let canonical = path.canonicalize()?;
        let file = LexFile {
            name: Arc::from(canonical.to_string_lossy().as_ref()),
            buf,
            cur: 0,
            line: 1,
            col: 0,
        };
        Ok((canonical, file))
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.cur).copied()
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.buf.get(self.cur + off).copied()
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek() {
            self.cur += 1;
            if c == b'\n' {
                self.line += 1;
                self.col = 0;
            } else {
                self.col += 1;
            }
        }
    }
}

/// The lexer: a stack of open files plus the set of files ever included.
pub struct Lexer {
    files: Vec<LexFile>,
    included: HashSet<PathBuf>,
}

fn is_space(c: u8) -> bool {
    c == b' ' || c == b'\t' || c == b'\r'
}

fn is_id_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_id(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

impl Lexer {
    /// Open the main script.
    pub fn new(fname: &str) -> Result<Lexer, CompileError> {
        let (canonical, file) = LexFile::open(fname)
            .map_err(|e| CompileError::no_pos(format!("can't read '{}': {}", fname, e)))?;
        let mut included = HashSet::new();
        included.insert(canonical);
        Ok(Lexer {
            files: vec![file],
            included,
        })
    }

    /// Lex directly from a string (tests and the REPL-less embedder path).
    pub fn from_source(source: &str, name: &str) -> Lexer {
        let mut buf = source.as_bytes().to_vec();
        buf.push(b'\n');
        Lexer {
            files: vec![LexFile {
                name: Arc::from(name),
                buf,
                cur: 0,
                line: 1,
                col: 0,
            }],
            included: HashSet::new(),
        }
    }

    fn file(&mut self) -> &mut LexFile {
        self.files.last_mut().expect("file stack is never empty")
    }

    fn error_here(&mut self, msg: impl Into<String>) -> CompileError {
        let f = self.file();
        CompileError::new(f.name.clone(), f.line, f.col, msg)
    }

    /// Next token, or `None` at the end of all input.
    pub fn next_token(&mut self) -> Result<Option<Token>, CompileError> {
        loop {
            // Pop finished include files; stop when the main file is done.
            while self.file().peek().is_none() {
                if self.files.len() == 1 {
                    return Ok(None);
                }
                self.files.pop();
            }
            let c = self.file().peek().expect("checked above");
            if is_space(c) {
                self.file().advance();
                continue;
            }
            if c == b'#' {
                // Comment to end of line; the newline itself still tokens.
                while matches!(self.file().peek(), Some(b) if b != b'\n') {
                    self.file().advance();
                }
                continue;
            }
            // An include directive yields no token of its own.
            if let Some(tok) = self.lex_one()? {
                return Ok(Some(tok));
            }
        }
    }

    fn token(&mut self, kind: TokenKind, value: impl Into<String>, line: u64, col: u64) -> Token {
        Token {
            kind,
            value: value.into(),
            line,
            col,
            file: self.file().name.clone(),
        }
    }

    /// Lex one token; `Ok(None)` when the text was an include directive.
    fn lex_one(&mut self) -> Result<Option<Token>, CompileError> {
        let (line, col) = {
            let f = self.file();
            (f.line, f.col)
        };
        let c = self.file().peek().expect("caller ensured a byte");
        // Single-character punctuation first.
        let simple = match c {
            b'\n' => Some((TokenKind::StateEnd, "\n")),
            b';' => Some((TokenKind::StateEnd, ";")),
            b'{' => Some((TokenKind::BlockOpen, "{")),
            b'}' => Some((TokenKind::BlockClose, "}")),
            b'(' => Some((TokenKind::ParOpen, "(")),
            b')' => Some((TokenKind::ParClose, ")")),
            b'[' => Some((TokenKind::IdxOpen, "[")),
            b']' => Some((TokenKind::IdxClose, "]")),
            b',' => Some((TokenKind::ListSep, ",")),
            b'+' => Some((TokenKind::AddSub, "+")),
            b'-' => Some((TokenKind::AddSub, "-")),
            b'*' => Some((TokenKind::MulDiv, "*")),
            b'/' => Some((TokenKind::MulDiv, "/")),
            b'%' => Some((TokenKind::Mod, "%")),
            b'^' => Some((TokenKind::Pow, "^")),
            _ => None,
        };
        if let Some((kind, value)) = simple {
            self.file().advance();
            return Ok(Some(self.token(kind, value, line, col)));
        }
        match c {
            b'=' => {
                self.file().advance();
                if self.file().peek() == Some(b'=') {
                    self.file().advance();
                    Ok(Some(self.token(TokenKind::Cmp, "==", line, col)))
                } else {
                    Ok(Some(self.token(TokenKind::Assign, "=", line, col)))
                }
            }
            b'!' => {
                self.file().advance();
                if self.file().peek() == Some(b'=') {
                    self.file().advance();
                    Ok(Some(self.token(TokenKind::Cmp, "!=", line, col)))
                } else {
                    Err(self.error_here("expected '=' after '!'"))
                }
            }
            b'<' | b'>' => {
                self.file().advance();
                let mut op = String::from(c as char);
                if self.file().peek() == Some(b'=') {
                    self.file().advance();
                    op.push('=');
                }
                Ok(Some(self.token(TokenKind::Cmp, op, line, col)))
            }
            b'.' => {
                self.file().advance();
                Ok(Some(self.token(TokenKind::Dot, ".", line, col)))
            }
            b'\'' | b'"' => self.lex_string(c, line, col).map(Some),
            b'0'..=b'9' => {
                let mut text = String::new();
                let mut seen_dot = false;
                while let Some(b) = self.file().peek() {
                    if b.is_ascii_digit() {
                        text.push(b as char);
                    } else if b == b'.' && !seen_dot && matches!(self.file().peek_at(1), Some(d) if d.is_ascii_digit())
                    {
                        seen_dot = true;
                        text.push('.');
                    } else {
                        break;
                    }
                    self.file().advance();
                }
                Ok(Some(self.token(TokenKind::Const, text, line, col)))
            }
            c if is_id_start(c) => {
                let mut text = String::new();
                while let Some(b) = self.file().peek() {
                    if is_id(b) {
                        text.push(b as char);
                        self.file().advance();
                    } else {
                        break;
                    }
                }
                if text == "include" {
                    self.lex_include()?;
                    return Ok(None);
                }
                let kind = match text.as_str() {
                    "var" => TokenKind::Var,
                    "nil" => TokenKind::Nil,
                    "if" => TokenKind::If,
                    "else" => TokenKind::Else,
                    "function" => TokenKind::Fun,
                    "return" => TokenKind::Return,
                    "for" => TokenKind::For,
                    "while" => TokenKind::While,
                    "and" | "or" => TokenKind::AndOr,
                    "not" => TokenKind::Not,
                    _ => TokenKind::Id,
                };
                Ok(Some(self.token(kind, text, line, col)))
            }
            other => Err(self.error_here(format!("unexpected character '{}'", other as char))),
        }
    }

    fn lex_string(&mut self, quote: u8, line: u64, col: u64) -> Result<Token, CompileError> {
        self.file().advance();
        let mut text = Vec::new();
        loop {
            match self.file().peek() {
                None => return Err(self.error_here("missing closing quote")),
                Some(b) if b == quote => {
                    self.file().advance();
                    break;
                }
                Some(b) => {
                    text.push(b);
                    self.file().advance();
                }
            }
        }
        let text = String::from_utf8(text)
            .map_err(|_| self.error_here("string literal is not valid UTF-8"))?;
        Ok(self.token(TokenKind::String, text, line, col))
    }

    /// Resolve an `include "path"` directive.
    fn lex_include(&mut self) -> Result<(), CompileError> {
        while matches!(self.file().peek(), Some(b) if is_space(b)) {
            self.file().advance();
        }
        let quote = match self.file().peek() {
            Some(b @ (b'\'' | b'"')) => b,
            _ => return Err(self.error_here("expected string after include")),
        };
        self.file().advance();
        let mut fname = Vec::new();
        loop {
            match self.file().peek() {
                None | Some(b'\n') => {
                    return Err(self.error_here("expected end of string"));
                }
                Some(b) if b == quote => {
                    self.file().advance();
                    break;
                }
                Some(b) => {
                    fname.push(b);
                    self.file().advance();
                }
            }
        }
        let fname = String::from_utf8(fname)
            .map_err(|_| self.error_here("include path is not valid UTF-8"))?;
        let (canonical, file) = match LexFile::open(&fname) {
            Ok(x) => x,
            Err(e) => return Err(self.error_here(format!("can't read '{}': {}", fname, e))),
        };
        // Once-only: a file already included during this compilation is
        // skipped, which also breaks inclusion cycles.
        if self.included.insert(canonical) {
            self.files.push(file);
        }
        Ok(())
    }
}
