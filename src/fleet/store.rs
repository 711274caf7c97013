//! Persistence for loop records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use super::state::LoopState;

pub const STATE_FILE: &str = "fleet_states.json";

pub type LoopStates = BTreeMap<String, LoopState>;

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<LoopStates>;

    fn save(&self, states: &LoopStates) -> Result<()>;
}

/// All records in one JSON object keyed by app id.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(STATE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<LoopStates> {
        if !self.path.exists() {
            return Ok(LoopStates::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read fleet state file: {}", self.path.display()))?;
        let mut states: LoopStates = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fleet state JSON: {}", self.path.display()))?;
        // Keys are authoritative for the app id
        for (app_id, state) in states.iter_mut() {
            state.app_id = app_id.clone();
        }
        Ok(states)
    }

    fn save(&self, states: &LoopStates) -> Result<()> {
        let content = serde_json::to_string_pretty(states).context("Failed to serialize fleet state")?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write fleet state file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace fleet state file: {}", self.path.display()))?;
        Ok(())
    }
}

/// In-process store; clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    states: Arc<Mutex<LoopStates>>,
}

impl MemoryStore {
    pub fn with_states(states: LoopStates) -> Self {
        Self {
            states: Arc::new(Mutex::new(states)),
        }
    }

    pub fn snapshot(&self) -> LoopStates {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<LoopStates> {
        Ok(self.snapshot())
    }

    fn save(&self, states: &LoopStates) -> Result<()> {
        *self.states.lock().unwrap_or_else(|e| e.into_inner()) = states.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::in_dir(dir.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::in_dir(&dir.path().join("data"));

        let mut state = LoopState::new("app_1");
        state.enabled = true;
        state.record_iteration(true, "polished the header");
        let mut states = LoopStates::new();
        states.insert("app_1".to_string(), state.clone());

        store.save(&states).unwrap();
        assert!(!store.path().with_extension("json.tmp").exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.get("app_1"), Some(&state));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::in_dir(dir.path());
        std::fs::write(store.path(), "{not json").unwrap();
        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("Failed to parse fleet state JSON"));
    }

    #[test]
    fn test_memory_store_shared_between_clones() {
        let store = MemoryStore::default();
        let other = store.clone();
        let mut states = LoopStates::new();
        states.insert("app_1".to_string(), LoopState::new("app_1"));
        store.save(&states).unwrap();
        assert_eq!(other.load().unwrap().len(), 1);
    }
}
