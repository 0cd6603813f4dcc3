//! Compiler front-end interface.
//!
//! Source compilation happens outside gradebox. The [`UnitCompiler`] trait
//! is the seam; [`JsonUnitCompiler`] accepts units that were compiled ahead
//! of time and serialized as JSON.

use super::CompiledUnit;
use crate::config::types::{GradeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub content: String,
}

impl SourceFile {
    pub fn read(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            content: std::fs::read_to_string(path)?,
        })
    }
}

/// Compiler message attached to a source location
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Diagnostic {
    pub path: PathBuf,
    pub line: Option<usize>,
    pub message: String,
}

pub trait UnitCompiler {
    fn compile(
        &self,
        sources: &[SourceFile],
    ) -> std::result::Result<Vec<CompiledUnit>, Vec<Diagnostic>>;
}

/// Accepts precompiled units serialized as a JSON array
pub struct JsonUnitCompiler;

impl UnitCompiler for JsonUnitCompiler {
    fn compile(
        &self,
        sources: &[SourceFile],
    ) -> std::result::Result<Vec<CompiledUnit>, Vec<Diagnostic>> {
        let mut units = Vec::new();
        let mut diagnostics = Vec::new();
        for source in sources {
            match serde_json::from_str::<Vec<CompiledUnit>>(&source.content) {
                Ok(parsed) => units.extend(parsed),
                Err(e) => diagnostics.push(Diagnostic {
                    path: source.path.clone(),
                    line: Some(e.line()),
                    message: e.to_string(),
                }),
            }
        }
        if diagnostics.is_empty() {
            Ok(units)
        } else {
            Err(diagnostics)
        }
    }
}

/// Read a JSON unit file through [`JsonUnitCompiler`]
pub fn read_units(path: &Path) -> Result<Vec<CompiledUnit>> {
    let source = SourceFile::read(path)?;
    JsonUnitCompiler.compile(&[source]).map_err(|diagnostics| {
        let lines: Vec<String> = diagnostics
            .iter()
            .map(|d| format!("{}: {}", d.path.display(), d.message))
            .collect();
        GradeError::Config(format!("cannot read units: {}", lines.join("; ")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_compiler_collects_diagnostics() {
        let good = SourceFile {
            path: PathBuf::from("good.json"),
            content: r#"[{"name":"A","routines":[]}]"#.to_string(),
        };
        let bad = SourceFile {
            path: PathBuf::from("bad.json"),
            content: "[{\"name\":".to_string(),
        };
        let units = JsonUnitCompiler.compile(&[good.clone()]).unwrap();
        assert_eq!(units.len(), 1);

        let diagnostics = JsonUnitCompiler.compile(&[good, bad]).unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].path, PathBuf::from("bad.json"));
    }
}
