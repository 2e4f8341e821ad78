//! Compiler configuration
//!
//! Loaded from a TOML file when given, otherwise defaulted. Strict mode
//! turns on diagnostics for the language's more forgiving habits without
//! changing what compiles.

use std::path::Path;

use serde::Deserialize;

use crate::error::CompileError;

/// Tunable compiler behavior.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Warn when assignment to an undeclared identifier silently creates
    /// a global.
    pub strict: bool,
}

impl CompilerConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, CompileError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CompileError::no_pos(format!("can't read config '{}': {}", path.display(), e))
        })?;
        toml::from_str(&text).map_err(|e| {
            CompileError::no_pos(format!("bad config '{}': {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CompilerConfig::default();
        assert!(!cfg.strict);
    }

    #[test]
    fn test_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bzzc.toml");
        std::fs::write(&path, "strict = true\n").unwrap();
        let cfg = CompilerConfig::from_toml_file(&path).unwrap();
        assert!(cfg.strict);
    }
}
