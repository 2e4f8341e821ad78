//! Parser and code generator
//!
//! Recursive descent over the token stream, emitting textual assembly.
//! The output is organized in *chunks*, each labelled `@__label_N`:
//! chunk 0 is the program entry, and every `function` declaration or
//! lambda expression opens a new one. A prologue registers each named
//! chunk (binding a closure to its symbol) and ends with a `nop`;
//! execution then falls through into chunk 0.
//!
//! Symbols live on a stack of scopes. The outermost scope is global;
//! globals are addressed by string id, locals by slot in the activation
//! record (slot 0 is `self`). An identifier that resolves nowhere is
//! promoted to a global in the outermost scope, which is how the language
//! spells assignment-creates-variable; strict mode flags those sites.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::lexer::{Lexer, Token, TokenKind};

const LABEL_REF: &str = "@__label_";

/// Compile-time string table. Ids are assigned in first-use order and
/// become the interned-string ids of the compiled program.
#[derive(Debug, Default)]
pub struct StringTable {
    list: Vec<String>,
    map: HashMap<String, i64>,
}

impl StringTable {
    pub fn add(&mut self, s: &str) -> i64 {
        if let Some(&id) = self.map.get(s) {
            return id;
        }
        let id = self.list.len() as i64;
        self.list.push(s.to_string());
        self.map.insert(s.to_string(), id);
        id
    }

    pub fn strings(&self) -> &[String] {
        &self.list
    }
}

#[derive(Debug, Clone, Copy)]
struct Sym {
    pos: i64,
    global: bool,
}

/// Where an identifier reference landed after parsing its suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefKind {
    /// Local variable at this activation-record slot.
    Local(i64),
    /// Global variable with this string id.
    Global(i64),
    /// Table element: table and key are on the stack.
    Table,
    /// Call result: the call has been (or is about to be) emitted.
    Closure,
}

#[derive(Debug, Clone, Copy)]
struct IdrefInfo {
    kind: RefKind,
    /// The base identifier did not resolve and was promoted to a global.
    fresh: bool,
}

#[derive(Debug, Clone)]
struct Line {
    /// Instruction text without indentation, or a bare `@label`.
    text: String,
    loc: Option<(u64, u64, Arc<str>)>,
}

impl Line {
    fn is_label(&self) -> bool {
        self.text.starts_with('@')
    }
}

#[derive(Debug)]
struct Chunk {
    label: u32,
    /// Symbol to bind in the prologue (named functions only).
    reg: Option<Sym>,
    lines: Vec<Line>,
}

/// The parser state.
pub struct Parser {
    lex: Lexer,
    tok: Option<Token>,
    /// Position of the most recent token, for end-of-input errors.
    last_pos: (Arc<str>, u64, u64),
    strings: StringTable,
    chunks: Vec<Chunk>,
    /// Stack of active chunk indices; emission goes to the top.
    active: Vec<usize>,
    labels: u32,
    symstack: Vec<HashMap<String, Sym>>,
    strict: bool,
}

impl Parser {
    pub fn new(lex: Lexer, config: &CompilerConfig) -> Self {
        Parser {
            lex,
            tok: None,
            last_pos: (Arc::from(""), 0, 0),
            strings: StringTable::default(),
            chunks: Vec::new(),
            active: Vec::new(),
            labels: 0,
            symstack: Vec::new(),
            strict: config.strict,
        }
    }

    /// Seed the string table so the listed strings get ids 0..N.
    pub fn preload_strings(&mut self, list: &[String]) {
        for s in list {
            self.strings.add(s);
        }
    }

    /// Parse the whole script and render the textual assembly.
    pub fn parse(mut self) -> Result<String, CompileError> {
        self.fetch()?;
        self.symstack.push(HashMap::new());
        self.chunk_push(None);
        self.parse_statlist()?;
        self.emit_label("@__exitpoint".to_string());
        self.emit("done");
        self.chunk_pop();
        Ok(self.render())
    }

    // ---- token plumbing ----

    fn fetch(&mut self) -> Result<(), CompileError> {
        self.tok = self.lex.next_token()?;
        if let Some(tok) = &self.tok {
            self.last_pos = (tok.file.clone(), tok.line, tok.col);
        }
        Ok(())
    }

    fn kind(&self) -> Option<TokenKind> {
        self.tok.as_ref().map(|t| t.kind)
    }

    fn tok_is(&self, kind: TokenKind) -> bool {
        self.kind() == Some(kind)
    }

    fn err_here(&self, msg: impl Into<String>) -> CompileError {
        let (file, line, col) = self.last_pos.clone();
        CompileError::new(file, line, col, msg)
    }

    fn tokmatch(&self, kind: TokenKind) -> Result<&Token, CompileError> {
        match &self.tok {
            Some(tok) if tok.kind == kind => Ok(tok),
            Some(tok) => Err(self.err_here(format!(
                "syntax error: expected {}, found {}",
                kind.desc(),
                tok.kind.desc()
            ))),
            None => Err(self.err_here(format!(
                "syntax error: expected {}, found end of file",
                kind.desc()
            ))),
        }
    }

    /// Skip statement terminators coming from newlines (not `;`), which
    /// allows non-cuddled braces and multi-line constructs.
    fn skip_newlines(&mut self) -> Result<(), CompileError> {
        while matches!(&self.tok, Some(t) if t.is_newline_end()) {
            self.fetch()?;
        }
        Ok(())
    }

    fn skip_statends(&mut self) -> Result<(), CompileError> {
        while self.tok_is(TokenKind::StateEnd) {
            self.fetch()?;
        }
        Ok(())
    }

    // ---- emission ----

    fn chunk_push(&mut self, reg: Option<Sym>) {
        let label = self.labels;
        self.labels += 1;
        self.chunks.push(Chunk {
            label,
            reg,
            lines: Vec::new(),
        });
        self.active.push(self.chunks.len() - 1);
    }

    fn chunk_pop(&mut self) {
        self.active.pop();
    }

    fn cur_chunk(&mut self) -> &mut Chunk {
        let idx = *self.active.last().expect("an active chunk");
        &mut self.chunks[idx]
    }

    fn cur_loc(&self) -> Option<(u64, u64, Arc<str>)> {
        self.tok
            .as_ref()
            .map(|t| (t.line, t.col, t.file.clone()))
    }

    fn emit(&mut self, text: impl Into<String>) {
        let loc = self.cur_loc();
        self.cur_chunk().lines.push(Line {
            text: text.into(),
            loc,
        });
    }

    fn emit_label(&mut self, label: String) {
        self.cur_chunk().lines.push(Line {
            text: label,
            loc: None,
        });
    }

    fn code_len(&mut self) -> usize {
        self.cur_chunk().lines.len()
    }

    fn insert_at(&mut self, idx: usize, text: impl Into<String>) {
        let loc = self.cur_loc();
        self.cur_chunk().lines.insert(
            idx,
            Line {
                text: text.into(),
                loc,
            },
        );
    }

    fn next_labels(&mut self, n: u32) -> u32 {
        let first = self.labels;
        self.labels += n;
        first
    }

    // ---- symbols ----

    fn sym_lookup(&self, name: &str) -> Option<Sym> {
        self.symstack
            .iter()
            .rev()
            .find_map(|table| table.get(name).copied())
    }

    /// Add a symbol: global when the only open scope is the outermost
    /// one, local otherwise.
    fn sym_add_auto(&mut self, name: &str) -> Sym {
        if self.symstack.len() == 1 {
            self.sym_add_global(name)
        } else {
            self.sym_add_local(name)
        }
    }

    fn sym_add_global(&mut self, name: &str) -> Sym {
        let sym = Sym {
            pos: self.strings.add(name),
            global: true,
        };
        self.symstack[0].insert(name.to_string(), sym);
        sym
    }

    fn sym_add_local(&mut self, name: &str) -> Sym {
        let table = self.symstack.last_mut().expect("an open scope");
        let sym = Sym {
            pos: table.len() as i64,
            global: false,
        };
        table.insert(name.to_string(), sym);
        sym
    }

    fn symt_push(&mut self) {
        self.symstack.push(HashMap::new());
    }

    /// Clone the innermost scope, so a nested lambda shares its parent's
    /// activation-record layout.
    fn symt_clone(&mut self) {
        let top = self.symstack.last().expect("an open scope").clone();
        self.symstack.push(top);
    }

    fn symt_pop(&mut self) {
        self.symstack.pop();
    }

    // ---- grammar ----

    fn parse_statlist(&mut self) -> Result<(), CompileError> {
        self.parse_stat()?;
        while matches!(&self.tok, Some(t) if t.kind != TokenKind::BlockClose) {
            self.skip_statends()?;
            if self.tok.is_some() {
                self.parse_stat()?;
            }
        }
        Ok(())
    }

    fn parse_stat(&mut self) -> Result<(), CompileError> {
        match self.kind() {
            None | Some(TokenKind::StateEnd) | Some(TokenKind::BlockClose) => Ok(()),
            Some(TokenKind::Var) => self.parse_var(),
            Some(TokenKind::Fun) => self.parse_fun(),
            Some(TokenKind::If) => self.parse_if(),
            Some(TokenKind::For) => self.parse_for(),
            Some(TokenKind::While) => self.parse_while(),
            _ => self.parse_command(),
        }
    }

    fn parse_block(&mut self) -> Result<(), CompileError> {
        self.tokmatch(TokenKind::BlockOpen)?;
        self.fetch()?;
        if self.tok_is(TokenKind::BlockClose) {
            self.fetch()?;
            return Ok(());
        }
        // Variables declared inside the block go out of scope with it.
        let numvars = self.symstack.last().expect("an open scope").len() as i64;
        self.parse_statlist()?;
        self.tokmatch(TokenKind::BlockClose)?;
        self.fetch()?;
        self.symstack
            .last_mut()
            .expect("an open scope")
            .retain(|_, s| s.global || s.pos < numvars);
        Ok(())
    }

    /// A block or a single statement (non-cuddled braces allowed).
    fn parse_blockstat(&mut self) -> Result<(), CompileError> {
        if self.tok_is(TokenKind::BlockOpen) {
            self.parse_block()
        } else {
            self.skip_statends()?;
            self.parse_stat()
        }
    }

    fn parse_var(&mut self) -> Result<(), CompileError> {
        self.tokmatch(TokenKind::Var)?;
        self.fetch()?;
        let name = self.tokmatch(TokenKind::Id)?.value.clone();
        if self.sym_lookup(&name).is_some() {
            return Err(self.err_here(format!("duplicated symbol '{}'", name)));
        }
        let sym = self.sym_add_auto(&name);
        if sym.global {
            self.emit(format!("pushs {}", sym.pos));
        }
        self.fetch()?;
        if self.tok_is(TokenKind::Assign) {
            self.fetch()?;
            self.parse_expression()?;
        } else {
            self.emit("pushnil");
        }
        if sym.global {
            self.emit("gstore");
        } else {
            self.emit(format!("lstore {}", sym.pos));
        }
        Ok(())
    }

    fn parse_fun(&mut self) -> Result<(), CompileError> {
        self.tokmatch(TokenKind::Fun)?;
        self.fetch()?;
        let name = self.tokmatch(TokenKind::Id)?.value.clone();
        self.sym_add_auto(&name);
        let sym = self.sym_lookup(&name).expect("just added");
        self.chunk_push(Some(sym));
        self.fetch()?;
        self.tokmatch(TokenKind::ParOpen)?;
        self.fetch()?;
        self.symt_push();
        if self.sym_lookup("self").map_or(true, |s| s.global) {
            self.sym_add_local("self");
        }
        self.parse_idlist()?;
        self.tokmatch(TokenKind::ParClose)?;
        self.fetch()?;
        self.parse_block()?;
        self.emit("ret0");
        self.symt_pop();
        self.chunk_pop();
        Ok(())
    }

    fn parse_if(&mut self) -> Result<(), CompileError> {
        // Label 1 is the else branch (or the end without one), label 2
        // the end of the whole statement.
        let lab1 = self.next_labels(2);
        let lab2 = lab1 + 1;
        self.tokmatch(TokenKind::If)?;
        self.fetch()?;
        self.tokmatch(TokenKind::ParOpen)?;
        self.fetch()?;
        self.parse_condition()?;
        self.tokmatch(TokenKind::ParClose)?;
        self.fetch()?;
        self.emit(format!("jumpz {}{}", LABEL_REF, lab1));
        self.skip_newlines()?;
        self.parse_blockstat()?;
        self.skip_newlines()?;
        if self.tok_is(TokenKind::Else) {
            self.fetch()?;
            self.emit(format!("jump {}{}", LABEL_REF, lab2));
            self.emit_label(format!("{}{}", LABEL_REF, lab1));
            self.skip_newlines()?;
            self.parse_blockstat()?;
            self.emit_label(format!("{}{}", LABEL_REF, lab2));
        } else {
            self.emit_label(format!("{}{}", LABEL_REF, lab1));
        }
        Ok(())
    }

    /// An assignment (`idref = expr`), emitting the proper store.
    fn parse_assignment(&mut self) -> Result<(), CompileError> {
        let info = self.parse_idref(true)?;
        self.tokmatch(TokenKind::Assign)?;
        if info.kind == RefKind::Closure {
            return Err(self.err_here("syntax error: can't have a function call as lvalue"));
        }
        if let RefKind::Global(sid) = info.kind {
            if self.strict && info.fresh {
                let (file, line, col) = self.last_pos.clone();
                tracing::warn!(
                    "{}:{}:{}: assignment to undeclared identifier creates a global",
                    file,
                    line,
                    col
                );
            }
            self.emit(format!("pushs {}", sid));
        }
        self.fetch()?;
        self.parse_expression()?;
        match info.kind {
            RefKind::Global(_) => self.emit("gstore"),
            RefKind::Local(pos) => self.emit(format!("lstore {}", pos)),
            RefKind::Table => self.emit("tput"),
            RefKind::Closure => unreachable!("rejected above"),
        }
        Ok(())
    }

    fn parse_for(&mut self) -> Result<(), CompileError> {
        self.tokmatch(TokenKind::For)?;
        self.fetch()?;
        self.tokmatch(TokenKind::ParOpen)?;
        self.fetch()?;
        self.parse_assignment()?;
        self.tokmatch(TokenKind::ListSep)?;
        self.fetch()?;
        let start = self.next_labels(2);
        let end = start + 1;
        self.emit_label(format!("{}{}", LABEL_REF, start));
        self.parse_condition()?;
        self.emit(format!("jumpz {}{}", LABEL_REF, end));
        self.tokmatch(TokenKind::ListSep)?;
        self.fetch()?;
        // The update assignment is written before the body but runs after
        // it; park its code aside and splice it back past the block.
        let mark = self.code_len();
        self.parse_assignment()?;
        let update: Vec<Line> = self.cur_chunk().lines.drain(mark..).collect();
        self.tokmatch(TokenKind::ParClose)?;
        self.fetch()?;
        self.skip_newlines()?;
        self.parse_block()?;
        self.cur_chunk().lines.extend(update);
        self.emit(format!("jump {}{}", LABEL_REF, start));
        self.emit_label(format!("{}{}", LABEL_REF, end));
        Ok(())
    }

    fn parse_while(&mut self) -> Result<(), CompileError> {
        let wstart = self.next_labels(2);
        let wend = wstart + 1;
        self.tokmatch(TokenKind::While)?;
        self.fetch()?;
        self.tokmatch(TokenKind::ParOpen)?;
        self.fetch()?;
        self.emit_label(format!("{}{}", LABEL_REF, wstart));
        self.parse_condition()?;
        self.tokmatch(TokenKind::ParClose)?;
        self.fetch()?;
        self.emit(format!("jumpz {}{}", LABEL_REF, wend));
        self.skip_newlines()?;
        self.parse_blockstat()?;
        self.emit(format!("jump {}{}", LABEL_REF, wstart));
        self.emit_label(format!("{}{}", LABEL_REF, wend));
        Ok(())
    }

    fn parse_command(&mut self) -> Result<(), CompileError> {
        if self.tok_is(TokenKind::Return) {
            self.fetch()?;
            if matches!(
                self.kind(),
                None | Some(TokenKind::StateEnd) | Some(TokenKind::BlockClose)
            ) {
                self.emit("ret0");
            } else {
                self.parse_condition()?;
                self.emit("ret1");
            }
            return Ok(());
        }
        // Function call or assignment, both begin with an idref.
        let info = self.parse_idref(true)?;
        if self.tok_is(TokenKind::Assign) {
            if info.kind == RefKind::Closure {
                return Err(self.err_here("syntax error: can't have a function call as lvalue"));
            }
            if let RefKind::Global(sid) = info.kind {
                if self.strict && info.fresh {
                    let (file, line, col) = self.last_pos.clone();
                    tracing::warn!(
                        "{}:{}:{}: assignment to undeclared identifier creates a global",
                        file,
                        line,
                        col
                    );
                }
                self.emit(format!("pushs {}", sid));
            }
            self.fetch()?;
            self.parse_expression()?;
            match info.kind {
                RefKind::Global(_) => self.emit("gstore"),
                RefKind::Local(pos) => self.emit(format!("lstore {}", pos)),
                RefKind::Table => self.emit("tput"),
                RefKind::Closure => unreachable!("rejected above"),
            }
            Ok(())
        } else if info.kind == RefKind::Closure {
            Ok(())
        } else {
            Err(self.err_here("syntax error: expected function call or assignment"))
        }
    }

    fn parse_idlist(&mut self) -> Result<(), CompileError> {
        if self.tok_is(TokenKind::ParClose) {
            return Ok(());
        }
        loop {
            let name = self.tokmatch(TokenKind::Id)?.value.clone();
            // Reuse a parent's slot when a lambda names the same symbol,
            // so nested code shares the cloned activation-record layout.
            if self.sym_lookup(&name).map_or(true, |s| s.global) {
                self.sym_add_local(&name);
            }
            self.fetch()?;
            if !self.tok_is(TokenKind::ListSep) {
                return Ok(());
            }
            self.fetch()?;
        }
    }

    fn parse_conditionlist(&mut self) -> Result<i64, CompileError> {
        self.skip_statends()?;
        let mut numargs = 0;
        if self.tok_is(TokenKind::ParClose) {
            return Ok(numargs);
        }
        self.parse_condition()?;
        numargs += 1;
        self.skip_statends()?;
        while self.tok_is(TokenKind::ListSep) {
            self.fetch()?;
            self.skip_statends()?;
            self.parse_condition()?;
            numargs += 1;
            self.skip_statends()?;
        }
        Ok(numargs)
    }

    fn parse_condition(&mut self) -> Result<(), CompileError> {
        if self.tok_is(TokenKind::Not) {
            self.fetch()?;
            self.parse_condition()?;
            self.emit("not");
            return Ok(());
        }
        self.parse_comparison()?;
        while self.tok_is(TokenKind::AndOr) {
            let op = self.tok.as_ref().expect("checked").value.clone();
            self.fetch()?;
            self.parse_comparison()?;
            self.emit(op);
        }
        Ok(())
    }

    fn parse_comparison(&mut self) -> Result<(), CompileError> {
        self.parse_expression()?;
        if self.tok_is(TokenKind::Cmp) {
            let op = match self.tok.as_ref().expect("checked").value.as_str() {
                "==" => "eq",
                "!=" => "neq",
                "<" => "lt",
                "<=" => "lte",
                ">" => "gt",
                ">=" => "gte",
                other => return Err(self.err_here(format!("unknown comparison '{}'", other))),
            };
            self.fetch()?;
            self.parse_expression()?;
            self.emit(op);
        }
        Ok(())
    }

    /// Emit the push for a table-constructor key (`.id` or `.N`).
    fn emit_table_key(&mut self) -> Result<(), CompileError> {
        match self.kind() {
            Some(TokenKind::Id) => {
                let sid = {
                    let v = self.tok.as_ref().expect("checked").value.clone();
                    self.strings.add(&v)
                };
                self.emit(format!("pushs {}", sid));
                Ok(())
            }
            Some(TokenKind::Const) => {
                let v = self.tok.as_ref().expect("checked").value.clone();
                if v.contains('.') {
                    self.emit(format!("pushf {}", v));
                } else {
                    self.emit(format!("pushi {}", v));
                }
                Ok(())
            }
            _ => Err(self.err_here("syntax error: expected id or numeric constant")),
        }
    }

    fn parse_expression(&mut self) -> Result<(), CompileError> {
        if self.tok_is(TokenKind::BlockOpen) {
            // Table constructor.
            self.fetch()?;
            self.skip_newlines()?;
            if !self.tok_is(TokenKind::Dot) && !self.tok_is(TokenKind::BlockClose) {
                return Err(self.err_here("syntax error: expected .id = expression or }"));
            }
            self.emit("pusht");
            if self.tok_is(TokenKind::Dot) {
                self.emit("dup");
                self.fetch()?;
                self.emit_table_key()?;
                self.fetch()?;
                self.tokmatch(TokenKind::Assign)?;
                self.fetch()?;
                self.parse_expression()?;
                self.emit("tput");
                self.skip_newlines()?;
                while self.tok_is(TokenKind::ListSep) {
                    self.emit("dup");
                    self.fetch()?;
                    self.skip_newlines()?;
                    self.tokmatch(TokenKind::Dot)?;
                    self.fetch()?;
                    self.emit_table_key()?;
                    self.fetch()?;
                    self.tokmatch(TokenKind::Assign)?;
                    self.fetch()?;
                    self.parse_expression()?;
                    self.emit("tput");
                    self.skip_newlines()?;
                }
            }
            self.tokmatch(TokenKind::BlockClose)?;
            self.fetch()?;
            return Ok(());
        }
        self.parse_product()?;
        while self.tok_is(TokenKind::AddSub) {
            let op = self.tok.as_ref().expect("checked").value.clone();
            self.fetch()?;
            self.parse_product()?;
            self.emit(if op == "+" { "add" } else { "sub" });
        }
        Ok(())
    }

    fn parse_product(&mut self) -> Result<(), CompileError> {
        self.parse_modulo()?;
        while self.tok_is(TokenKind::MulDiv) {
            let op = self.tok.as_ref().expect("checked").value.clone();
            self.fetch()?;
            self.parse_modulo()?;
            self.emit(if op == "*" { "mul" } else { "div" });
        }
        Ok(())
    }

    fn parse_modulo(&mut self) -> Result<(), CompileError> {
        self.parse_power()?;
        while self.tok_is(TokenKind::Mod) {
            self.fetch()?;
            self.parse_power()?;
            self.emit("mod");
        }
        Ok(())
    }

    fn parse_power(&mut self) -> Result<(), CompileError> {
        self.parse_operand()?;
        if self.tok_is(TokenKind::Pow) {
            self.fetch()?;
            self.parse_power()?;
            self.emit("pow");
        }
        Ok(())
    }

    fn parse_operand(&mut self) -> Result<(), CompileError> {
        match self.kind() {
            Some(TokenKind::Fun) => {
                self.emit(format!("pushl {}{}", LABEL_REF, self.labels));
                self.parse_lambda()
            }
            Some(TokenKind::Nil) => {
                self.emit("pushnil");
                self.fetch()
            }
            Some(TokenKind::Const) => {
                let v = self.tok.as_ref().expect("checked").value.clone();
                if v.contains('.') {
                    self.emit(format!("pushf {}", v));
                } else {
                    self.emit(format!("pushi {}", v));
                }
                self.fetch()
            }
            Some(TokenKind::String) => {
                let sid = {
                    let v = self.tok.as_ref().expect("checked").value.clone();
                    self.strings.add(&v)
                };
                self.emit(format!("pushs {}", sid));
                self.fetch()
            }
            Some(TokenKind::ParOpen) => {
                self.fetch()?;
                self.parse_condition()?;
                self.tokmatch(TokenKind::ParClose)?;
                self.fetch()
            }
            Some(TokenKind::AddSub) => {
                let op = self.tok.as_ref().expect("checked").value.clone();
                self.fetch()?;
                if self.tok_is(TokenKind::Const) {
                    // Fold the sign into the literal.
                    let v = self.tok.as_ref().expect("checked").value.clone();
                    if v.contains('.') {
                        self.emit(format!("pushf {}{}", op, v));
                    } else {
                        self.emit(format!("pushi {}{}", op, v));
                    }
                    self.fetch()
                } else {
                    self.parse_power()?;
                    if op == "-" {
                        self.emit("unm");
                    }
                    Ok(())
                }
            }
            _ => self.parse_idref(false).map(|_| ()),
        }
    }

    fn parse_lambda(&mut self) -> Result<(), CompileError> {
        self.tokmatch(TokenKind::Fun)?;
        self.fetch()?;
        self.chunk_push(None);
        self.tokmatch(TokenKind::ParOpen)?;
        self.fetch()?;
        // At global scope the lambda needs a fresh frame with `self`;
        // nested lambdas clone the parent's layout instead, so captured
        // variables keep their slots.
        if self.symstack.len() == 1 {
            self.symt_push();
            if self.sym_lookup("self").map_or(true, |s| s.global) {
                self.sym_add_local("self");
            }
        } else {
            self.symt_clone();
        }
        self.parse_idlist()?;
        self.tokmatch(TokenKind::ParClose)?;
        self.fetch()?;
        self.parse_block()?;
        self.emit("ret0");
        self.symt_pop();
        self.chunk_pop();
        Ok(())
    }

    /// Parse an identifier reference with its `.field`, `[index]` and
    /// `(args)` suffixes, emitting the access code.
    ///
    /// Method calls need the receiver duplicated under the closure: when
    /// a call follows a field access, a `dup` is inserted before the key
    /// push so the table doubles as `self`. Plain calls get a `pushnil`
    /// receiver instead, inserted ahead of the whole reference for
    /// chained calls.
    fn parse_idref(&mut self, lvalue: bool) -> Result<IdrefInfo, CompileError> {
        let name = self.tokmatch(TokenKind::Id)?.value.clone();
        let (sym, fresh) = match self.sym_lookup(&name) {
            Some(s) => (s, false),
            None => (self.sym_add_global(&name), true),
        };
        let mut kind = if sym.global {
            RefKind::Global(sym.pos)
        } else {
            RefKind::Local(sym.pos)
        };
        self.fetch()?;
        let start = self.code_len();
        while matches!(
            self.kind(),
            Some(TokenKind::Dot) | Some(TokenKind::IdxOpen) | Some(TokenKind::ParOpen)
        ) {
            // Resolve the value accumulated so far.
            match kind {
                RefKind::Global(sid) => {
                    if self.tok_is(TokenKind::ParOpen) {
                        self.emit("pushnil");
                    }
                    self.emit(format!("pushs {}", sid));
                    self.emit("gload");
                }
                RefKind::Local(pos) => {
                    if self.tok_is(TokenKind::ParOpen) {
                        self.emit("pushnil");
                    }
                    self.emit(format!("lload {}", pos));
                }
                RefKind::Table => self.emit("tget"),
                RefKind::Closure => self.emit("callc"),
            }
            match self.kind() {
                Some(TokenKind::Dot) => {
                    kind = RefKind::Table;
                    self.fetch()?;
                    let sid = {
                        let v = self.tokmatch(TokenKind::Id)?.value.clone();
                        self.strings.add(&v)
                    };
                    self.fetch()?;
                    if self.tok_is(TokenKind::ParOpen) {
                        self.emit("dup");
                    }
                    self.emit(format!("pushs {}", sid));
                }
                Some(TokenKind::IdxOpen) => {
                    kind = RefKind::Table;
                    self.fetch()?;
                    let mark = self.code_len();
                    self.parse_expression()?;
                    self.tokmatch(TokenKind::IdxClose)?;
                    self.fetch()?;
                    if self.tok_is(TokenKind::ParOpen) {
                        self.insert_at(mark, "dup");
                    }
                }
                Some(TokenKind::ParOpen) => {
                    kind = RefKind::Closure;
                    self.fetch()?;
                    let numargs = self.parse_conditionlist()?;
                    self.tokmatch(TokenKind::ParClose)?;
                    self.fetch()?;
                    if self.tok_is(TokenKind::ParOpen) {
                        self.insert_at(start, "pushnil");
                    }
                    self.emit(format!("pushi {}", numargs));
                }
                _ => unreachable!("loop condition"),
            }
        }
        if !lvalue || kind == RefKind::Closure {
            match kind {
                RefKind::Global(sid) => {
                    self.emit(format!("pushs {}", sid));
                    self.emit("gload");
                }
                RefKind::Local(pos) => self.emit(format!("lload {}", pos)),
                RefKind::Table => self.emit("tget"),
                RefKind::Closure => self.emit("callc"),
            }
        }
        Ok(IdrefInfo { kind, fresh })
    }

    // ---- output ----

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("!{}\n", self.strings.list.len()));
        for s in &self.strings.list {
            out.push_str(&format!("'{}\n", s));
        }
        out.push('\n');
        // Prologue: bind every named chunk, then fall through into
        // chunk 0 past the nop.
        for chunk in &self.chunks {
            if let Some(sym) = &chunk.reg {
                if sym.global {
                    out.push_str(&format!("\tpushs {}\n", sym.pos));
                    out.push_str(&format!("\tpushcn {}{}\n", LABEL_REF, chunk.label));
                    out.push_str("\tgstore\n");
                } else {
                    out.push_str(&format!("\tpushcn {}{}\n", LABEL_REF, chunk.label));
                    out.push_str(&format!("\tlstore {}\n", sym.pos));
                }
            }
        }
        out.push_str("\tnop\n");
        for chunk in &self.chunks {
            out.push_str(&format!("\n{}{}\n", LABEL_REF, chunk.label));
            for line in &chunk.lines {
                if line.is_label() {
                    out.push_str(&format!("{}\n", line.text));
                } else {
                    match &line.loc {
                        Some((l, c, f)) => {
                            out.push_str(&format!("\t{}\t|{},{},{}\n", line.text, l, c, f))
                        }
                        None => out.push_str(&format!("\t{}\n", line.text)),
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> String {
        let lex = Lexer::from_source(source, "test.bzz");
        Parser::new(lex, &CompilerConfig::default())
            .parse()
            .expect("compiles")
    }

    fn code_lines(basm: &str) -> Vec<String> {
        basm.lines()
            .map(|l| {
                l.trim()
                    .split("\t|")
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_string()
            })
            .filter(|l| !l.is_empty())
            .collect()
    }

    #[test]
    fn test_global_assignment() {
        let basm = compile("x = 40 + 2");
        let lines = code_lines(&basm);
        // String 0 is "x": pushs 0, pushi 40, pushi 2, add, gstore.
        assert!(lines.contains(&"pushs 0".to_string()));
        assert!(lines.contains(&"pushi 40".to_string()));
        assert!(lines.contains(&"add".to_string()));
        assert!(lines.contains(&"gstore".to_string()));
    }

    #[test]
    fn test_string_table_header() {
        let basm = compile("a = 1\nb = 2");
        assert!(basm.starts_with("!2\n'a\n'b\n"));
    }

    #[test]
    fn test_function_registration_prologue() {
        let basm = compile("function f() { return 1 }");
        let lines = code_lines(&basm);
        let nop = lines.iter().position(|l| l == "nop").expect("prologue nop");
        let pre = &lines[..nop];
        assert!(pre.contains(&"pushs 0".to_string()));
        assert!(pre.iter().any(|l| l.starts_with("pushcn @__label_")));
        assert!(pre.contains(&"gstore".to_string()));
    }

    #[test]
    fn test_chunk_zero_ends_with_done() {
        let basm = compile("x = 1");
        let lines = code_lines(&basm);
        let l0 = lines.iter().position(|l| l == "@__label_0").unwrap();
        let exit = lines.iter().position(|l| l == "@__exitpoint").unwrap();
        assert!(exit > l0);
        assert_eq!(lines[exit + 1], "done");
    }

    #[test]
    fn test_method_call_dups_receiver() {
        let basm = compile("t = {}\nt.m()");
        let lines = code_lines(&basm);
        // t.m(): pushs t, gload, dup, pushs m, tget, pushi 0, callc.
        let gload = lines
            .iter()
            .rposition(|l| l == "gload")
            .expect("receiver load");
        assert_eq!(lines[gload + 1], "dup");
        assert!(lines[gload + 2].starts_with("pushs"));
        assert_eq!(lines[gload + 3], "tget");
        assert_eq!(lines[gload + 4], "pushi 0");
        assert_eq!(lines[gload + 5], "callc");
    }

    #[test]
    fn test_plain_call_gets_nil_self() {
        let basm = compile("f()");
        let lines = code_lines(&basm);
        let callc = lines.iter().position(|l| l == "callc").unwrap();
        assert_eq!(lines[callc - 4], "pushnil");
        assert!(lines[callc - 3].starts_with("pushs"));
        assert_eq!(lines[callc - 2], "gload");
        assert_eq!(lines[callc - 1], "pushi 0");
    }

    #[test]
    fn test_if_else_labels() {
        let basm = compile("if(x > 0) { y = 1 } else { y = 2 }");
        let lines = code_lines(&basm);
        assert!(lines.iter().any(|l| l.starts_with("jumpz @__label_")));
        assert!(lines.iter().any(|l| l.starts_with("jump @__label_")));
    }

    #[test]
    fn test_while_loop_shape() {
        let basm = compile("while(i < 10) { i = i + 1 }");
        let lines = code_lines(&basm);
        let jumpz = lines.iter().position(|l| l.starts_with("jumpz")).unwrap();
        let jump = lines.iter().rposition(|l| l.starts_with("jump @")).unwrap();
        assert!(jump > jumpz);
    }

    #[test]
    fn test_for_loop_update_after_body() {
        let basm = compile("for(i = 0, i < 3, i = i + 1) { x = i }");
        let lines = code_lines(&basm);
        assert!(lines.iter().any(|l| l.starts_with("jumpz")));
        assert!(lines.iter().any(|l| l.starts_with("jump @")));
    }

    #[test]
    fn test_lambda_emits_pushl() {
        let basm = compile("f = function(x) { return x }");
        let lines = code_lines(&basm);
        assert!(lines.iter().any(|l| l.starts_with("pushl @__label_")));
    }

    #[test]
    fn test_table_constructor() {
        let basm = compile("t = { .a = 1, .b = 2 }");
        let lines = code_lines(&basm);
        assert!(lines.contains(&"pusht".to_string()));
        assert_eq!(lines.iter().filter(|l| *l == "dup").count(), 2);
        assert_eq!(lines.iter().filter(|l| *l == "tput").count(), 2);
    }

    #[test]
    fn test_call_as_lvalue_is_error() {
        let lex = Lexer::from_source("f() = 3", "test.bzz");
        let err = Parser::new(lex, &CompilerConfig::default())
            .parse()
            .unwrap_err();
        assert!(err.to_string().contains("lvalue"));
    }

    #[test]
    fn test_duplicate_var_is_error() {
        let lex = Lexer::from_source("var a = 1\nvar a = 2", "test.bzz");
        let err = Parser::new(lex, &CompilerConfig::default())
            .parse()
            .unwrap_err();
        assert!(err.to_string().contains("duplicated symbol"));
    }

    #[test]
    fn test_error_position_prefix() {
        let lex = Lexer::from_source("if(", "test.bzz");
        let err = Parser::new(lex, &CompilerConfig::default())
            .parse()
            .unwrap_err();
        assert!(err.to_string().starts_with("test.bzz:1:"));
    }

    #[test]
    fn test_unary_minus_folds_into_literal() {
        let basm = compile("x = -7 % 3");
        let lines = code_lines(&basm);
        assert!(lines.contains(&"pushi -7".to_string()));
        assert!(lines.contains(&"mod".to_string()));
    }
}
