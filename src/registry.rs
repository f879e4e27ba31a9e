use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use crate::error::{FormaError, Result};
use crate::formula::Formula;

/// The set of known formulas, keyed by their unique name.
///
/// The index is an explicit value handed to the interpreter by reference, so
/// several indexes can coexist (e.g. in tests).
#[derive(Debug, Default, Clone)]
pub struct FormulaIndex {
    formulas: BTreeMap<String, Formula>,
}

impl FormulaIndex {
    /// Builds an index from already parsed formulas.
    ///
    /// # Errors
    /// Returns [`FormaError::InvalidFormula`] if two formulas share a name.
    pub fn from_formulas<I: IntoIterator<Item = Formula>>(formulas: I) -> Result<Self> {
        let mut index = FormulaIndex::default();
        for formula in formulas {
            index.insert(formula)?;
        }
        Ok(index)
    }

    /// Loads every `*.toml` descriptor found below the given directories.
    ///
    /// Missing directories are skipped.
    ///
    /// # Errors
    /// Fails on the first descriptor that cannot be parsed or validated, and
    /// on duplicate names.
    pub fn load<P: AsRef<Path>>(dirs: &[P]) -> Result<Self> {
        let mut index = FormulaIndex::default();
        for path in formula_files(dirs)? {
            index.insert(Formula::load(&path)?)?;
        }
        Ok(index)
    }

    pub fn insert(&mut self, formula: Formula) -> Result<()> {
        if self.formulas.contains_key(&formula.name) {
            return Err(FormaError::InvalidFormula {
                reason: format!("a formula named '{}' is already in the index", formula.name),
                name: formula.name,
            });
        }
        self.formulas.insert(formula.name.clone(), formula);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Formula> {
        self.formulas.get(name)
    }

    /// Like [`FormulaIndex::get`], but a missing name is an error.
    pub fn lookup(&self, name: &str) -> Result<&Formula> {
        self.get(name)
            .ok_or_else(|| FormaError::FormulaNotFound(name.to_string()))
    }

    /// Formulas in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Formula> {
        self.formulas.values()
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

/// Lists descriptor files (`*.toml`) below the given directories, sorted.
pub fn formula_files<P: AsRef<Path>>(dirs: &[P]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for dir in dirs {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(dir) {
            let entry = entry.map_err(|e| FormaError::Other(e.into()))?;
            let path = entry.path();
            if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "toml") {
                files.push(path.to_path_buf());
            }
        }
    }
    files.sort();
    Ok(files)
}
