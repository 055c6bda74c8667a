//! Static puzzle definitions, looked up by zero-based level.

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// One puzzle as stored in the catalog file. Fields the game does not know about
/// are kept so they still reach the engine through the compiled instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuzzleDefinition {
    pub id: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "exitCondition")]
    pub exit_condition: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuzzleCatalog {
    levels: Vec<PuzzleDefinition>,
}

impl PuzzleCatalog {
    /// Builds a catalog whose ids cover exactly `1..=K`.
    pub fn new(mut levels: Vec<PuzzleDefinition>) -> Result<Self> {
        if levels.is_empty() {
            bail!("puzzle catalog has no levels");
        }
        levels.sort_by_key(|level| level.id);
        for (idx, level) in levels.iter().enumerate() {
            let expected = idx as u32 + 1;
            if level.id != expected {
                bail!(
                    "puzzle catalog ids must run 1..={} without gaps or duplicates (expected id {expected}, found {})",
                    levels.len(),
                    level.id
                );
            }
        }
        Ok(Self { levels })
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct CatalogFile {
            levels: Vec<PuzzleDefinition>,
        }
        let file: CatalogFile = serde_json::from_str(raw)?;
        Self::new(file.levels)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| anyhow!("failed to read puzzle catalog {}: {err}", path.display()))?;
        Self::from_json(&raw)
            .map_err(|err| anyhow!("invalid puzzle catalog {}: {err}", path.display()))
    }

    /// Resolves zero-based `level` to the catalog entry with `id == level + 1`.
    pub fn lookup(&self, level: u32) -> Option<&PuzzleDefinition> {
        let id = level.checked_add(1)?;
        self.levels.iter().find(|puzzle| puzzle.id == id)
    }

    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Zero-based index of the final level.
    pub fn last_level(&self) -> u32 {
        self.level_count().saturating_sub(1)
    }

    pub fn levels(&self) -> &[PuzzleDefinition] {
        &self.levels
    }
}
