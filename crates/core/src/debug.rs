//! Debug-symbol file
//!
//! A compiled script can ship with a side file mapping bytecode offsets
//! to source positions. The VM loads it lazily and consults it only when
//! producing an error message, so the format favors simplicity: a 4-byte
//! `BDBG` tag followed by a bincode-encoded table.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

const MAGIC: &[u8; 4] = b"BDBG";

/// A source position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub file: String,
    pub line: u64,
    pub col: u64,
}

impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

/// Map from bytecode offset to source position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    /// Name of the main script this bytecode was compiled from.
    pub script: String,
    offsets: BTreeMap<u32, SourceLoc>,
}

/// Failure to read or write a debug-symbol file.
#[derive(Debug)]
pub enum DebugInfoError {
    Io(std::io::Error),
    /// Missing `BDBG` tag or undecodable body.
    Malformed,
}

impl std::fmt::Display for DebugInfoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebugInfoError::Io(e) => write!(f, "debug info i/o error: {}", e),
            DebugInfoError::Malformed => write!(f, "malformed debug info file"),
        }
    }
}

impl std::error::Error for DebugInfoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DebugInfoError::Io(e) => Some(e),
            DebugInfoError::Malformed => None,
        }
    }
}

impl From<std::io::Error> for DebugInfoError {
    fn from(e: std::io::Error) -> Self {
        DebugInfoError::Io(e)
    }
}

impl DebugInfo {
    pub fn new(script: impl Into<String>) -> Self {
        DebugInfo {
            script: script.into(),
            offsets: BTreeMap::new(),
        }
    }

    /// Record the source position of the instruction at `offset`.
    pub fn insert(&mut self, offset: u32, loc: SourceLoc) {
        self.offsets.insert(offset, loc);
    }

    /// Position of the instruction at exactly `offset`.
    pub fn lookup(&self, offset: u32) -> Option<&SourceLoc> {
        self.offsets.get(&offset)
    }

    /// Position of the instruction at or closest before `offset`; what
    /// error reporting wants when `oldpc` sits mid-instruction.
    pub fn lookup_at_or_before(&self, offset: u32) -> Option<&SourceLoc> {
        self.offsets.range(..=offset).next_back().map(|(_, l)| l)
    }

    pub fn save(&self, path: &Path) -> Result<(), DebugInfoError> {
        let body = bincode::serialize(self).map_err(|_| DebugInfoError::Malformed)?;
        let mut f = std::fs::File::create(path)?;
        f.write_all(MAGIC)?;
        f.write_all(&body)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, DebugInfoError> {
        let mut buf = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut buf)?;
        if buf.len() < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
            return Err(DebugInfoError::Malformed);
        }
        bincode::deserialize(&buf[MAGIC.len()..]).map_err(|_| DebugInfoError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_at_or_before() {
        let mut di = DebugInfo::new("test.bzz");
        di.insert(
            10,
            SourceLoc {
                file: "test.bzz".into(),
                line: 3,
                col: 1,
            },
        );
        di.insert(
            20,
            SourceLoc {
                file: "test.bzz".into(),
                line: 4,
                col: 1,
            },
        );
        assert_eq!(di.lookup_at_or_before(9), None);
        assert_eq!(di.lookup_at_or_before(10).unwrap().line, 3);
        assert_eq!(di.lookup_at_or_before(15).unwrap().line, 3);
        assert_eq!(di.lookup_at_or_before(25).unwrap().line, 4);
    }
}
