//! Isolated staging trees and output validation.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

pub const STAGING_DIR: &str = ".staging";

/// Files every generated application must contain.
pub const REQUIRED_FILES: [&str; 5] = [
    "package.json",
    "server.js",
    "public/index.html",
    "public/style.css",
    "public/app.js",
];

/// Files handed to the agent as context when present.
pub const CONTEXT_FILES: [&str; 6] = [
    "package.json",
    "server.js",
    "metadata.json",
    "public/index.html",
    "public/style.css",
    "public/app.js",
];

const EXCLUDED_TOP_LEVEL: [&str; 5] = ["node_modules", ".git", ".staging", "uploads", "output"];

fn is_excluded_top_level(name: &str) -> bool {
    EXCLUDED_TOP_LEVEL.contains(&name) || name.ends_with(".bak") || name.contains(".bak_")
}

pub fn staging_dir(apps_dir: &Path, app_id: &str) -> PathBuf {
    apps_dir.join(STAGING_DIR).join(app_id)
}

/// Create an empty staging tree for `app_id`, replacing any leftover one.
pub fn prepare_staging(apps_dir: &Path, app_id: &str) -> io::Result<PathBuf> {
    let dir = staging_dir(apps_dir, app_id);
    if dir.exists() {
        debug!(path = %dir.display(), "removing leftover staging directory");
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::create_dir_all(dir.join("public"))?;
    Ok(dir)
}

/// Copy the live tree into staging, skipping caches and backups at the top
/// level. Returns the number of files copied.
pub fn copy_live_tree(live: &Path, staging: &Path) -> io::Result<usize> {
    let mut copied = 0;
    let walker = WalkDir::new(live)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || !is_excluded_top_level(&e.file_name().to_string_lossy()));

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(live)
            .map_err(io::Error::other)?;
        let target = staging.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Required files missing from `dir`, in declaration order.
pub fn validate_app_dir(dir: &Path) -> Vec<String> {
    REQUIRED_FILES
        .iter()
        .filter(|f| !dir.join(f).is_file())
        .map(|f| f.to_string())
        .collect()
}

pub fn context_files(dir: &Path) -> Vec<PathBuf> {
    CONTEXT_FILES
        .iter()
        .map(|f| dir.join(f))
        .filter(|p| p.is_file())
        .collect()
}

pub fn remove_staging(dir: &Path) {
    if !dir.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(dir) {
        warn!(path = %dir.display(), error = %e, "failed to remove staging directory");
    }
}

/// Remove everything under `<apps>/.staging`, used at startup.
pub fn clean_staging_root(apps_dir: &Path) -> usize {
    let root = apps_dir.join(STAGING_DIR);
    let Ok(entries) = std::fs::read_dir(&root) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "failed to clean staging entry"),
        }
    }
    removed
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn write_required(dir: &Path) {
        std::fs::create_dir_all(dir.join("public")).unwrap();
        for file in REQUIRED_FILES {
            std::fs::write(dir.join(file), format!("// {}", file)).unwrap();
        }
    }

    #[test]
    fn test_prepare_replaces_leftover() {
        let apps = TempDir::new().unwrap();
        let first = prepare_staging(apps.path(), "app_1").unwrap();
        std::fs::write(first.join("junk.txt"), "x").unwrap();

        let second = prepare_staging(apps.path(), "app_1").unwrap();
        assert_eq!(first, second);
        assert!(!second.join("junk.txt").exists());
        assert!(second.join("public").is_dir());
    }

    #[test]
    fn test_copy_skips_excluded_top_level() {
        let tmp = TempDir::new().unwrap();
        let live = tmp.path().join("live");
        write_required(&live);
        std::fs::create_dir_all(live.join("node_modules/express")).unwrap();
        std::fs::write(live.join("node_modules/express/index.js"), "x").unwrap();
        std::fs::create_dir_all(live.join("output")).unwrap();
        std::fs::write(live.join("output/log.md"), "x").unwrap();
        std::fs::write(live.join("server.js.bak"), "x").unwrap();
        std::fs::create_dir_all(live.join("lib/node_modules")).unwrap();
        std::fs::write(live.join("lib/node_modules/keep.js"), "x").unwrap();

        let staging = tmp.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let copied = copy_live_tree(&live, &staging).unwrap();

        assert_eq!(copied, REQUIRED_FILES.len() + 1);
        assert!(staging.join("public/app.js").is_file());
        assert!(staging.join("lib/node_modules/keep.js").is_file());
        assert!(!staging.join("node_modules").exists());
        assert!(!staging.join("output").exists());
        assert!(!staging.join("server.js.bak").exists());
    }

    #[test]
    fn test_validate_reports_missing_in_order() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("package.json"), "{}").unwrap();
        std::fs::create_dir_all(tmp.path().join("public")).unwrap();
        std::fs::write(tmp.path().join("public/style.css"), "").unwrap();

        assert_eq!(
            validate_app_dir(tmp.path()),
            vec!["server.js", "public/index.html", "public/app.js"]
        );
        write_required(tmp.path());
        assert!(validate_app_dir(tmp.path()).is_empty());
    }

    #[test]
    fn test_context_files_only_existing() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("metadata.json"), "{}").unwrap();
        let files = context_files(tmp.path());
        assert_eq!(files, vec![tmp.path().join("metadata.json")]);
    }

    #[test]
    fn test_clean_staging_root() {
        let apps = TempDir::new().unwrap();
        prepare_staging(apps.path(), "app_1").unwrap();
        prepare_staging(apps.path(), "app_2").unwrap();
        assert_eq!(clean_staging_root(apps.path()), 2);
        assert_eq!(clean_staging_root(apps.path()), 0);
    }
}
