//! File-based definition store — lightweight persistence.
//! Definitions saved as JSON — human-readable, git-friendly, authored
//! out of band and loaded at startup.

use std::path::{Path, PathBuf};

use cadence_core::error::{CadenceError, Result};

use crate::model::ReminderDefinition;
use crate::schedule::validate_definition;

/// File-based definition store.
pub struct DefinitionStore {
    path: PathBuf,
}

impl DefinitionStore {
    /// Create a new definition store at the given directory.
    pub fn new(dir: &Path) -> Self {
        std::fs::create_dir_all(dir).ok();
        Self {
            path: dir.to_path_buf(),
        }
    }

    /// Default store path (~/.cadence/definitions).
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".cadence").join("definitions")
    }

    fn file(&self) -> PathBuf {
        self.path.join("definitions.json")
    }

    /// Save all definitions to disk.
    pub fn save(&self, definitions: &[ReminderDefinition]) -> Result<()> {
        let json = serde_json::to_string_pretty(definitions)
            .map_err(|e| CadenceError::Store(format!("Serialize error: {e}")))?;
        std::fs::write(self.file(), &json)
            .map_err(|e| CadenceError::Store(format!("Write error: {e}")))?;
        tracing::debug!("💾 Saved {} definitions to {}", definitions.len(), self.file().display());
        Ok(())
    }

    /// Load definitions from disk. Invalid cycles are dropped with a
    /// warning; blank ids get a fresh uuid.
    pub fn load(&self) -> Vec<ReminderDefinition> {
        let file = self.file();
        if !file.exists() {
            return Vec::new();
        }
        let raw: Vec<ReminderDefinition> = match std::fs::read_to_string(&file) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("⚠️ Failed to parse definitions.json: {e}");
                Vec::new()
            }),
            Err(e) => {
                tracing::warn!("⚠️ Failed to read definitions.json: {e}");
                Vec::new()
            }
        };
        raw.into_iter()
            .filter_map(|mut def| {
                if let Err(e) = validate_definition(&def) {
                    tracing::warn!("⚠️ Dropping definition: {e}");
                    return None;
                }
                if def.id.is_empty() {
                    def.id = uuid::Uuid::new_v4().to_string();
                }
                Some(def)
            })
            .collect()
    }
}
