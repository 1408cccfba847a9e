use crate::model::Table;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

pub struct SpecLoader;

impl SpecLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a table specification from a YAML or JSON file
    pub fn load_table(&self, path: &Path) -> Result<Table> {
        Table::from_file(path)
            .with_context(|| format!("Failed to load table specification from {:?}", path))
    }

    /// Load every specification in a directory; these form the scope for name uniqueness
    pub fn load_tables_from_dir(&self, dir: &Path) -> Result<Vec<Table>> {
        let mut tables = Vec::new();

        if !dir.exists() {
            return Ok(tables);
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read specification directory {:?}", dir))?
        {
            let path = entry?.path();
            if matches!(
                path.extension().and_then(|s| s.to_str()),
                Some("yaml" | "yml" | "json")
            ) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            match self.load_table(&path) {
                Ok(table) => tables.push(table),
                Err(e) => {
                    warn!("Skipping specification {:?}: {:#}", path, e);
                }
            }
        }

        Ok(tables)
    }
}

impl Default for SpecLoader {
    fn default() -> Self {
        Self::new()
    }
}
