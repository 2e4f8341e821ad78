//! Buzz compiler library
//!
//! Source text goes through three stages: the lexer turns bytes into
//! tokens (resolving `include` directives), the parser emits textual
//! assembly organized in chunks, and the assembler produces the bytecode
//! buffer plus a debug-symbol table.
//!
//! ```text
//! .bzz ──lexer──► tokens ──parser──► .basm ──assembler──► .bo (+ .bdb)
//! ```
//!
//! Each stage is usable on its own (the CLI exposes all of them); the
//! [`compile_file`] and [`compile_source`] helpers run the whole
//! pipeline.

pub mod asm;
pub mod config;
pub mod error;
pub mod lexer;
pub mod parser;

pub use asm::{assemble, disassemble, Assembled, AsmError};
pub use config::CompilerConfig;
pub use error::CompileError;
pub use lexer::{Lexer, Token, TokenKind};
pub use parser::Parser;

/// Compile a script file to textual assembly.
pub fn compile_file_to_asm(
    path: &str,
    config: &CompilerConfig,
    preload: &[String],
) -> Result<String, CompileError> {
    let lex = Lexer::new(path)?;
    let mut parser = Parser::new(lex, config);
    parser.preload_strings(preload);
    parser.parse()
}

/// Compile a script file all the way to bytecode.
pub fn compile_file(path: &str, config: &CompilerConfig) -> Result<Assembled, CompileError> {
    let basm = compile_file_to_asm(path, config, &[])?;
    assemble(&basm, path).map_err(|e| CompileError::no_pos(format!("assembler: {}", e)))
}

/// Compile in-memory source all the way to bytecode.
pub fn compile_source(
    source: &str,
    name: &str,
    config: &CompilerConfig,
) -> Result<Assembled, CompileError> {
    let lex = Lexer::from_source(source, name);
    let basm = Parser::new(lex, config).parse()?;
    assemble(&basm, name).map_err(|e| CompileError::no_pos(format!("assembler: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use buzz_core::bytecode::Opcode;

    #[test]
    fn test_pipeline_produces_bytecode() {
        let out = compile_source("x = 1 + 2", "test.bzz", &CompilerConfig::default())
            .expect("compiles");
        // Strings: "x". Header: count plus "x\0".
        assert_eq!(out.bcode[0..2], [1, 0]);
        assert_eq!(&out.bcode[2..4], b"x\0");
        // The stream ends in the done from @__exitpoint.
        assert_eq!(*out.bcode.last().unwrap(), Opcode::Done as u8);
    }

    #[test]
    fn test_prologue_ends_with_nop() {
        let out = compile_source(
            "function f() { return 1 }\nx = f()",
            "test.bzz",
            &CompilerConfig::default(),
        )
        .expect("compiles");
        // The VM executes from the header end to the first nop to bind
        // function symbols; make sure that nop survives to the bytecode.
        let dasm = disassemble(&out.bcode).expect("disassembles");
        assert!(dasm.lines().any(|l| l.trim() == "nop"));
        assert!(dasm.lines().any(|l| l.trim().starts_with("pushcn")));
    }

    #[test]
    fn test_debug_info_points_into_script() {
        let out = compile_source("x = 1", "myscript.bzz", &CompilerConfig::default())
            .expect("compiles");
        assert_eq!(out.debug.script, "myscript.bzz");
    }
}
