//! Per-application `metadata.json`.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const METADATA_FILE: &str = "metadata.json";
pub const MAX_IDEA_HISTORY: usize = 20;
pub const ASSISTANT_PREVIEW_CHARS: usize = 1200;
pub const OUTPUT_PREVIEW_CHARS: usize = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdeaHistoryEntry {
    #[serde(default)]
    pub revision: Option<u32>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_preview: Option<String>,
}

fn default_name() -> String {
    "Untitled app".to_string()
}

fn default_type() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetadata {
    #[serde(alias = "id")]
    pub app_id: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(rename = "type", default = "default_type")]
    pub app_type: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub idea_key: Option<String>,
    #[serde(default)]
    pub idea_history: Vec<IdeaHistoryEntry>,
    #[serde(default)]
    pub last_revision: Option<u32>,
    #[serde(default)]
    pub last_output_preview: String,
    #[serde(default)]
    pub last_output_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Fields written by the agent or older versions, kept on rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppMetadata {
    pub fn new(app_id: impl Into<String>, idea_key: impl Into<String>, port: u16) -> Self {
        Self {
            app_id: app_id.into(),
            name: default_name(),
            app_type: default_type(),
            port: Some(port),
            idea_key: Some(idea_key.into()),
            idea_history: Vec::new(),
            last_revision: None,
            last_output_preview: String::new(),
            last_output_at: None,
            created_at: Utc::now(),
            extra: Map::new(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(METADATA_FILE)
    }

    /// Read `metadata.json` from `dir`. A missing file is `Ok(None)`.
    pub fn load(dir: &Path) -> io::Result<Option<Self>> {
        let content = match std::fs::read_to_string(Self::path(dir)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write through a temp file and rename, so readers never see a torn file.
    pub fn save(&self, dir: &Path) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let path = Self::path(dir);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)
    }

    pub fn next_revision(&self) -> u32 {
        self.last_revision.unwrap_or(0) + 1
    }

    /// Append the idea text for a new revision, keeping the newest entries.
    pub fn record_revision(&mut self, revision: u32, text: &str) {
        self.idea_history.push(IdeaHistoryEntry {
            revision: Some(revision),
            timestamp: Utc::now(),
            text: text.to_string(),
            assistant_preview: None,
        });
        if self.idea_history.len() > MAX_IDEA_HISTORY {
            let excess = self.idea_history.len() - MAX_IDEA_HISTORY;
            self.idea_history.drain(..excess);
        }
        self.last_revision = Some(revision);
    }

    /// Attach turn output to the history entry for `revision` (or the newest).
    pub fn record_output(&mut self, revision: u32, output: &str) {
        let preview = truncate_chars(output, OUTPUT_PREVIEW_CHARS);
        let target = self
            .idea_history
            .iter()
            .rposition(|h| h.revision == Some(revision))
            .or_else(|| self.idea_history.len().checked_sub(1));
        if let Some(idx) = target {
            self.idea_history[idx].assistant_preview =
                Some(truncate_chars(&preview, ASSISTANT_PREVIEW_CHARS));
        }
        self.last_output_preview = preview;
        self.last_output_at = Some(Utc::now());
    }

    /// All idea texts in order, followed by the previous output preview.
    pub fn combined_idea_text(&self) -> String {
        let mut parts: Vec<String> = self
            .idea_history
            .iter()
            .filter(|h| !h.text.trim().is_empty())
            .map(|h| h.text.clone())
            .collect();
        if !self.last_output_preview.trim().is_empty() {
            parts.push(format!(
                "\n[Previous output summary]\n{}",
                self.last_output_preview
            ));
        }
        parts.join("\n")
    }
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(AppMetadata::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_preserves_unknown_fields() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(METADATA_FILE),
            r#"{"id":"app_1","name":"Counter","type":"tool","port":3001,"status":"stopped","ideaKey":"a.txt"}"#,
        )
        .unwrap();

        let meta = AppMetadata::load(dir.path()).unwrap().unwrap();
        assert_eq!(meta.app_id, "app_1");
        assert_eq!(meta.app_type, "tool");
        assert_eq!(meta.port, Some(3001));
        assert_eq!(meta.extra.get("status"), Some(&Value::from("stopped")));

        meta.save(dir.path()).unwrap();
        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(METADATA_FILE)).unwrap()).unwrap();
        assert_eq!(raw["appId"], "app_1");
        assert_eq!(raw["ideaKey"], "a.txt");
        assert_eq!(raw["status"], "stopped");
    }

    #[test]
    fn test_save_replaces_file_without_leftover_temp() {
        let dir = TempDir::new().unwrap();
        let mut meta = AppMetadata::new("app_1", "a.txt", 3001);
        meta.save(dir.path()).unwrap();
        meta.record_output(1, "second write");
        meta.save(dir.path()).unwrap();

        let loaded = AppMetadata::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.last_output_preview, "second write");
        assert!(!AppMetadata::path(dir.path()).with_extension("json.tmp").exists());
    }

    #[test]
    fn test_invalid_json_is_invalid_data() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), "{not json").unwrap();
        let err = AppMetadata::load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_history_bounded_and_revisions_monotonic() {
        let mut meta = AppMetadata::new("app_1", "a.txt", 3001);
        assert_eq!(meta.next_revision(), 1);
        for _ in 0..25 {
            let rev = meta.next_revision();
            meta.record_revision(rev, &format!("idea {}", rev));
        }
        assert_eq!(meta.idea_history.len(), MAX_IDEA_HISTORY);
        assert_eq!(meta.idea_history[0].revision, Some(6));
        assert_eq!(meta.last_revision, Some(25));
        assert_eq!(meta.next_revision(), 26);
    }

    #[test]
    fn test_record_output_truncates_previews() {
        let mut meta = AppMetadata::new("app_1", "a.txt", 3001);
        meta.record_revision(1, "first");
        meta.record_revision(2, "second");
        let output = "é".repeat(6000);
        meta.record_output(1, &output);

        assert_eq!(meta.last_output_preview.chars().count(), OUTPUT_PREVIEW_CHARS);
        assert_eq!(
            meta.idea_history[0].assistant_preview.as_ref().unwrap().chars().count(),
            ASSISTANT_PREVIEW_CHARS
        );
        assert!(meta.idea_history[1].assistant_preview.is_none());
        assert!(meta.last_output_at.is_some());
    }

    #[test]
    fn test_combined_text_includes_previous_output() {
        let mut meta = AppMetadata::new("app_1", "a.txt", 3001);
        meta.record_revision(1, "add a counter");
        meta.record_output(1, "built counter");
        meta.record_revision(2, "style it");
        let combined = meta.combined_idea_text();
        assert!(combined.starts_with("add a counter\nstyle it"));
        assert!(combined.contains("built counter"));
    }

    #[test]
    fn test_truncate_chars_short_string_unchanged() {
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abcdef", 3), "abc");
    }
}
