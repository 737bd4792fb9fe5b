//! Code-unit sources.
//!
//! The engine treats unit storage as an external collaborator: anything that
//! can read a unit by name and accept a rewritten one back. The in-memory
//! source backs tests and single-process harnesses; the directory source
//! holds one serialized unit per file and is what a build step pointing the
//! instrumenter at an output directory uses.

use crate::error::{SondaError, SondaResult};
use crate::unit::CodeUnit;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Storage for code units, keyed by unit name
pub trait UnitSource {
    /// Read the unit stored under `name`
    fn read(&self, name: &str) -> SondaResult<CodeUnit>;

    /// Store a unit under `name`, replacing any previous one
    fn write(&mut self, name: &str, unit: &CodeUnit) -> SondaResult<()>;

    /// All stored unit names, in deterministic order
    fn names(&self) -> Vec<String>;
}

/// In-memory unit source
#[derive(Debug, Default)]
pub struct MemoryUnitSource {
    units: BTreeMap<String, CodeUnit>,
}

impl MemoryUnitSource {
    /// Create an empty source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a unit, keyed by its own name
    pub fn add(&mut self, unit: CodeUnit) {
        self.units.insert(unit.name.clone(), unit);
    }
}

impl UnitSource for MemoryUnitSource {
    fn read(&self, name: &str) -> SondaResult<CodeUnit> {
        self.units
            .get(name)
            .cloned()
            .ok_or_else(|| SondaError::UnitNotFound { name: name.to_string() })
    }

    fn write(&mut self, name: &str, unit: &CodeUnit) -> SondaResult<()> {
        self.units.insert(name.to_string(), unit.clone());
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        self.units.keys().cloned().collect()
    }
}

/// Directory-backed unit source, one JSON file per unit
///
/// Unit names may contain `/` separators (`com/example/Target`); they map
/// to subdirectories under the root.
#[derive(Debug)]
pub struct DirUnitSource {
    root: PathBuf,
}

impl DirUnitSource {
    /// Create a source rooted at the given directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    fn collect_names(&self, dir: &PathBuf, prefix: &str, out: &mut Vec<String>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let mut entries: Vec<_> = entries.filter_map(Result::ok).collect();
        entries.sort_by_key(std::fs::DirEntry::file_name);
        for entry in entries {
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                self.collect_names(&path, &format!("{prefix}{file_name}/"), out);
            } else if let Some(stem) = file_name.strip_suffix(".json") {
                out.push(format!("{prefix}{stem}"));
            }
        }
    }
}

impl UnitSource for DirUnitSource {
    fn read(&self, name: &str) -> SondaResult<CodeUnit> {
        let path = self.path_of(name);
        if !path.exists() {
            return Err(SondaError::UnitNotFound { name: name.to_string() });
        }
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write(&mut self, name: &str, unit: &CodeUnit) -> SondaResult<()> {
        let path = self.path_of(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(unit)?)?;
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_names(&self.root, "", &mut names);
        names.sort();
        names
    }
}
