//! Assembler and disassembler
//!
//! Two-pass translation of textual assembly into bytecode. The input
//! starts with a `!N` header declaring N interned strings, one per
//! following line after a leading `'`. Lines beginning with `@` define
//! labels; anything else is a mnemonic with an optional argument.
//! Pass 1 computes byte offsets for every label, pass 2 emits the
//! instruction stream with label operands resolved.
//!
//! The bytecode layout is `string_count:u16`, the NUL-terminated strings,
//! then the instruction stream. Label offsets are absolute within the
//! whole buffer, which is also what the VM's program counter uses.
//!
//! Lines may carry a trailing `\t|line,col,file` annotation placed by the
//! code generator; it feeds the debug-symbol table and is otherwise
//! ignored.

use std::collections::HashMap;

use buzz_core::bytecode::{ArgKind, Opcode};
use buzz_core::debug::{DebugInfo, SourceLoc};
use buzz_core::msg::{write_f32, write_i32, write_u16, write_u32};

/// Assembly failure, with the 1-based source line of the offending text.
#[derive(Debug)]
pub struct AsmError {
    pub line: usize,
    pub message: String,
}

impl AsmError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        AsmError {
            line,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AsmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for AsmError {}

/// Result of assembling: the bytecode plus its debug-symbol table.
#[derive(Debug)]
pub struct Assembled {
    pub bcode: Vec<u8>,
    pub debug: DebugInfo,
}

struct PInstr {
    op: Opcode,
    arg: Option<String>,
    loc: Option<SourceLoc>,
    offset: u32,
    line_no: usize,
}

/// Split an assembly line into its code part and optional position
/// annotation.
fn split_annotation(line: &str) -> (&str, Option<&str>) {
    match line.rfind("\t|") {
        Some(i) => (&line[..i], Some(&line[i + 2..])),
        None => (line, None),
    }
}

fn parse_loc(s: &str) -> Option<SourceLoc> {
    let mut parts = s.splitn(3, ',');
    let line = parts.next()?.parse().ok()?;
    let col = parts.next()?.parse().ok()?;
    let file = parts.next()?.to_string();
    Some(SourceLoc { file, line, col })
}

/// Assemble textual assembly into bytecode.
pub fn assemble(basm: &str, script_name: &str) -> Result<Assembled, AsmError> {
    let mut lines = basm.lines().enumerate();

    // String table header.
    let (hdr_no, hdr) = lines
        .by_ref()
        .find(|(_, l)| !l.trim().is_empty())
        .ok_or_else(|| AsmError::new(1, "empty assembly file"))?;
    let count: usize = hdr
        .trim()
        .strip_prefix('!')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| AsmError::new(hdr_no + 1, "expected !N string-table header"))?;
    let mut strings = Vec::with_capacity(count);
    for _ in 0..count {
        let (no, line) = lines
            .next()
            .ok_or_else(|| AsmError::new(hdr_no + 1, "string table shorter than declared"))?;
        let s = line
            .strip_prefix('\'')
            .ok_or_else(|| AsmError::new(no + 1, "expected ' at start of string entry"))?;
        strings.push(s.to_string());
    }
    let header_size: u32 = 2 + strings.iter().map(|s| s.len() as u32 + 1).sum::<u32>();

    // Pass 1: record label offsets and collect instructions.
    let mut labels: HashMap<String, u32> = HashMap::new();
    let mut instrs: Vec<PInstr> = Vec::new();
    let mut offset = header_size;
    for (no, raw) in lines {
        let (code, ann) = split_annotation(raw);
        let code = code.trim();
        if code.is_empty() {
            continue;
        }
        if let Some(label) = code.strip_prefix('@') {
            if labels.insert(format!("@{}", label), offset).is_some() {
                return Err(AsmError::new(no + 1, format!("duplicate label @{}", label)));
            }
            continue;
        }
        let mut parts = code.splitn(2, char::is_whitespace);
        let mnemonic = parts.next().expect("non-empty code");
        let arg = parts.next().map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
        let op = Opcode::from_mnemonic(mnemonic)
            .ok_or_else(|| AsmError::new(no + 1, format!("unknown instruction '{}'", mnemonic)))?;
        if op.has_arg() != arg.is_some() {
            return Err(AsmError::new(
                no + 1,
                format!(
                    "instruction '{}' {}",
                    mnemonic,
                    if op.has_arg() {
                        "requires an argument"
                    } else {
                        "takes no argument"
                    }
                ),
            ));
        }
        instrs.push(PInstr {
            op,
            arg,
            loc: ann.and_then(parse_loc),
            offset,
            line_no: no + 1,
        });
        offset += op.size() as u32;
    }

    // Pass 2: emit.
    let mut bcode = Vec::with_capacity(offset as usize);
    write_u16(&mut bcode, strings.len() as u16);
    for s in &strings {
        bcode.extend_from_slice(s.as_bytes());
        bcode.push(0);
    }
    let mut debug = DebugInfo::new(script_name);
    for instr in &instrs {
        bcode.push(instr.op as u8);
        if let Some(arg) = &instr.arg {
            match instr.op.arg_kind() {
                ArgKind::Float => {
                    let v: f32 = arg.parse().map_err(|_| {
                        AsmError::new(instr.line_no, format!("bad float argument '{}'", arg))
                    })?;
                    write_f32(&mut bcode, v);
                }
                ArgKind::Int => {
                    let v: i32 = arg.parse().map_err(|_| {
                        AsmError::new(instr.line_no, format!("bad integer argument '{}'", arg))
                    })?;
                    write_i32(&mut bcode, v);
                }
                ArgKind::U32 => {
                    let v: u32 = arg.parse().map_err(|_| {
                        AsmError::new(instr.line_no, format!("bad argument '{}'", arg))
                    })?;
                    write_u32(&mut bcode, v);
                }
                ArgKind::Label => {
                    let v = if arg.starts_with('@') {
                        *labels.get(arg.as_str()).ok_or_else(|| {
                            AsmError::new(instr.line_no, format!("unknown label '{}'", arg))
                        })?
                    } else {
                        arg.parse().map_err(|_| {
                            AsmError::new(instr.line_no, format!("bad offset argument '{}'", arg))
                        })?
                    };
                    write_u32(&mut bcode, v);
                }
                ArgKind::None => unreachable!("checked in pass 1"),
            }
        }
        if let Some(loc) = &instr.loc {
            debug.insert(instr.offset, loc.clone());
        }
    }
    Ok(Assembled { bcode, debug })
}

/// Translate a bytecode buffer back to textual assembly.
pub fn disassemble(bcode: &[u8]) -> Result<String, AsmError> {
    let err = |msg: &str| AsmError::new(0, msg.to_string());
    if bcode.len() < 2 {
        return Err(err("bytecode shorter than its header"));
    }
    let count = u16::from_le_bytes([bcode[0], bcode[1]]) as usize;
    let mut out = String::new();
    out.push_str(&format!("!{}\n", count));
    let mut pos = 2;
    for _ in 0..count {
        let end = bcode[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| err("unterminated string in header"))?;
        let s = std::str::from_utf8(&bcode[pos..pos + end])
            .map_err(|_| err("string table entry is not valid UTF-8"))?;
        out.push_str(&format!("'{}\n", s));
        pos += end + 1;
    }
    out.push('\n');
    while pos < bcode.len() {
        let op = Opcode::from_byte(bcode[pos])
            .ok_or_else(|| AsmError::new(0, format!("unknown opcode {} at {}", bcode[pos], pos)))?;
        if op.has_arg() {
            if pos + 5 > bcode.len() {
                return Err(err("truncated instruction argument"));
            }
            let raw: [u8; 4] = bcode[pos + 1..pos + 5].try_into().expect("length checked");
            match op.arg_kind() {
                ArgKind::Float => {
                    out.push_str(&format!("\t{} {}\n", op.mnemonic(), f32::from_le_bytes(raw)))
                }
                ArgKind::Int => {
                    out.push_str(&format!("\t{} {}\n", op.mnemonic(), i32::from_le_bytes(raw)))
                }
                _ => out.push_str(&format!("\t{} {}\n", op.mnemonic(), u32::from_le_bytes(raw))),
            }
            pos += 5;
        } else {
            out.push_str(&format!("\t{}\n", op.mnemonic()));
            pos += 1;
        }
    }
    Ok(out)
}
