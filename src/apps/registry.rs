//! Identity → application index and application port table.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::metadata::AppMetadata;
use crate::errors::AppError;

/// Shown in listings while the first deployment of an identity is in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApp {
    pub id: String,
    pub name: String,
    pub idea_key: String,
    pub idea_text: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub task_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

pub trait AppRegistry: Send + Sync {
    fn app_for_identity(&self, identity: &str) -> Option<String>;

    fn bind_identity(&self, identity: &str, app_id: &str);

    /// Claim `preferred` if given, else the lowest unclaimed port in range.
    fn allocate_port(&self, preferred: Option<u16>) -> Result<u16, AppError>;

    fn release_port(&self, port: u16);

    fn used_ports(&self) -> BTreeSet<u16>;

    fn mark_pending(&self, identity: &str, text: &str, task_id: &str);

    fn clear_pending(&self, identity: &str);

    fn pending(&self) -> Vec<PendingApp>;

    fn record_failure(&self, identity: &str, task_id: &str, message: &str);

    fn clear_failure(&self, identity: &str);

    fn last_failure(&self, identity: &str) -> Option<FailureRecord>;
}

#[derive(Default)]
struct RegistryInner {
    by_identity: HashMap<String, String>,
    used_ports: BTreeSet<u16>,
    pending: HashMap<String, PendingApp>,
    failures: HashMap<String, FailureRecord>,
}

pub struct MemoryRegistry {
    port_start: u16,
    port_end: u16,
    inner: Mutex<RegistryInner>,
}

impl MemoryRegistry {
    pub fn new(port_start: u16, port_end: u16) -> Self {
        Self {
            port_start,
            port_end,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Rebuild the index from existing application directories.
    pub fn scan(apps_dir: &Path, port_start: u16, port_end: u16) -> Self {
        let registry = Self::new(port_start, port_end);
        let Ok(entries) = std::fs::read_dir(apps_dir) else {
            return registry;
        };
        {
            let mut inner = registry.lock();
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_ignored_dir_name(&name) || !entry.path().is_dir() {
                    continue;
                }
                match AppMetadata::load(&entry.path()) {
                    Ok(Some(meta)) => {
                        if let Some(port) = meta.port {
                            inner.used_ports.insert(port);
                        }
                        if let Some(key) = meta.idea_key.filter(|k| !k.is_empty()) {
                            inner.by_identity.insert(key, name);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(app_id = %name, error = %e, "skipping unreadable metadata"),
                }
            }
            debug!(apps = inner.by_identity.len(), "indexed existing applications");
        }
        registry
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AppRegistry for MemoryRegistry {
    fn app_for_identity(&self, identity: &str) -> Option<String> {
        self.lock().by_identity.get(identity).cloned()
    }

    fn bind_identity(&self, identity: &str, app_id: &str) {
        self.lock()
            .by_identity
            .insert(identity.to_string(), app_id.to_string());
    }

    fn allocate_port(&self, preferred: Option<u16>) -> Result<u16, AppError> {
        let mut inner = self.lock();
        if let Some(port) = preferred {
            inner.used_ports.insert(port);
            return Ok(port);
        }
        let port = (self.port_start..=self.port_end)
            .find(|p| !inner.used_ports.contains(p))
            .ok_or(AppError::NoFreePort {
                start: self.port_start,
                end: self.port_end,
            })?;
        inner.used_ports.insert(port);
        Ok(port)
    }

    fn release_port(&self, port: u16) {
        self.lock().used_ports.remove(&port);
    }

    fn used_ports(&self) -> BTreeSet<u16> {
        self.lock().used_ports.clone()
    }

    fn mark_pending(&self, identity: &str, text: &str, task_id: &str) {
        let mut inner = self.lock();
        if inner.by_identity.contains_key(identity) {
            return;
        }
        let entry = inner
            .pending
            .entry(identity.to_string())
            .or_insert_with(|| PendingApp {
                id: pending_id(identity),
                name: pending_name(text),
                idea_key: identity.to_string(),
                idea_text: String::new(),
                task_id: String::new(),
                created_at: Utc::now(),
            });
        entry.idea_text = text.to_string();
        entry.task_id = task_id.to_string();
    }

    fn clear_pending(&self, identity: &str) {
        self.lock().pending.remove(identity);
    }

    fn pending(&self) -> Vec<PendingApp> {
        let inner = self.lock();
        inner
            .pending
            .values()
            .filter(|p| !inner.by_identity.contains_key(&p.idea_key))
            .cloned()
            .collect()
    }

    fn record_failure(&self, identity: &str, task_id: &str, message: &str) {
        self.lock().failures.insert(
            identity.to_string(),
            FailureRecord {
                task_id: task_id.to_string(),
                message: message.to_string(),
                at: Utc::now(),
            },
        );
    }

    fn clear_failure(&self, identity: &str) {
        self.lock().failures.remove(identity);
    }

    fn last_failure(&self, identity: &str) -> Option<FailureRecord> {
        self.lock().failures.get(identity).cloned()
    }
}

/// Directories under the apps root that are never applications.
pub fn is_ignored_dir_name(name: &str) -> bool {
    name.starts_with('.') || name == "node_modules" || name.ends_with(".bak") || name.contains(".bak_")
}

/// Stable placeholder id for an identity (32-bit FNV-1a).
fn pending_id(identity: &str) -> String {
    let hash = identity.bytes().fold(0x811c9dc5u32, |h, b| {
        (h ^ u32::from(b)).wrapping_mul(0x01000193)
    });
    format!("pending_{:x}", hash)
}

fn pending_name(text: &str) -> String {
    let one_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if one_line.is_empty() {
        return "New app".to_string();
    }
    if one_line.chars().count() > 14 {
        format!("{}…", one_line.chars().take(14).collect::<String>())
    } else {
        one_line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allocate_lowest_free_then_preferred() {
        let registry = MemoryRegistry::new(3001, 3003);
        assert_eq!(registry.allocate_port(None).unwrap(), 3001);
        assert_eq!(registry.allocate_port(None).unwrap(), 3002);
        assert_eq!(registry.allocate_port(Some(3001)).unwrap(), 3001);
        registry.release_port(3002);
        assert_eq!(registry.allocate_port(None).unwrap(), 3002);
        assert_eq!(registry.allocate_port(None).unwrap(), 3003);
        assert!(matches!(
            registry.allocate_port(None),
            Err(AppError::NoFreePort { start: 3001, end: 3003 })
        ));
    }

    #[test]
    fn test_pending_hidden_once_bound() {
        let registry = MemoryRegistry::new(3001, 3999);
        registry.mark_pending("a.txt", "add a counter button to the page", "task_1");
        let pending = registry.pending();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].id.starts_with("pending_"));
        assert_eq!(pending[0].name, "add a counter …");

        registry.bind_identity("a.txt", "app_1");
        assert!(registry.pending().is_empty());
    }

    #[test]
    fn test_pending_id_stable() {
        assert_eq!(pending_id("a.txt"), pending_id("a.txt"));
        assert_ne!(pending_id("a.txt"), pending_id("b.txt"));
    }

    #[test]
    fn test_failures_recorded_and_cleared() {
        let registry = MemoryRegistry::new(3001, 3999);
        registry.record_failure("a.txt", "task_1", "AGENT_IDLE_TIMEOUT: no agent message for 30s");
        let failure = registry.last_failure("a.txt").unwrap();
        assert_eq!(failure.task_id, "task_1");
        assert!(failure.message.starts_with("AGENT_IDLE_TIMEOUT"));
        registry.clear_failure("a.txt");
        assert!(registry.last_failure("a.txt").is_none());
    }

    #[test]
    fn test_scan_indexes_metadata_and_skips_ignored() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("app_1");
        std::fs::create_dir_all(&app).unwrap();
        AppMetadata::new("app_1", "a.txt", 3005).save(&app).unwrap();

        let staged = dir.path().join(".staging").join("app_2");
        std::fs::create_dir_all(&staged).unwrap();
        AppMetadata::new("app_2", "b.txt", 3006).save(&staged).unwrap();

        let backup = dir.path().join("app_1.bak_1700000000000");
        std::fs::create_dir_all(&backup).unwrap();
        AppMetadata::new("app_1", "c.txt", 3007).save(&backup).unwrap();

        let registry = MemoryRegistry::scan(dir.path(), 3001, 3999);
        assert_eq!(registry.app_for_identity("a.txt").as_deref(), Some("app_1"));
        assert!(registry.app_for_identity("b.txt").is_none());
        assert!(registry.app_for_identity("c.txt").is_none());
        assert!(registry.used_ports().contains(&3005));
    }

    #[test]
    fn test_ignored_names() {
        assert!(is_ignored_dir_name(".staging"));
        assert!(is_ignored_dir_name("node_modules"));
        assert!(is_ignored_dir_name("app_1.bak"));
        assert!(is_ignored_dir_name("app_1.bak_123"));
        assert!(!is_ignored_dir_name("app_1"));
    }
}
