//! Three-phase promotion of a staged tree to the live application path.
//!
//! 1. rename live → `<live>.bak_<millis>`
//! 2. rename staging → live
//! 3. delete the backup
//!
//! Each rename is retried on transient errors. If phase 2 fails the backup
//! is renamed back, so the live path is never left missing.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::errors::PromoteError;

/// Filesystem operations used during promotion.
pub trait FsOps: Send + Sync {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl FsOps for RealFs {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub growth: f64,
    pub max_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            base_delay: Duration::from_millis(80),
            growth: 1.35,
            max_factor: 25.0,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.growth.powi(attempt as i32).min(self.max_factor);
        self.base_delay.mul_f64(factor)
    }
}

/// Busy-class errors worth retrying.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::ResourceBusy
            | io::ErrorKind::DirectoryNotEmpty
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// No live tree existed; staging was renamed into place.
    Created,
    /// An existing live tree was swapped out.
    Replaced,
}

#[async_trait]
pub trait Promoter: Send + Sync {
    async fn promote(&self, staging: &Path, live: &Path) -> Result<PromoteOutcome, PromoteError>;
}

pub struct AtomicSwap {
    fs: Arc<dyn FsOps>,
    retry: RetryPolicy,
}

impl AtomicSwap {
    pub fn new(fs: Arc<dyn FsOps>, retry: RetryPolicy) -> Self {
        Self { fs, retry }
    }

    async fn rename_with_retry(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut attempt = 0;
        loop {
            match self.fs.rename(from, to) {
                Ok(()) => return Ok(()),
                Err(e) if is_transient(&e) && attempt < self.retry.retries => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(from = %from.display(), attempt, ?delay, error = %e, "rename busy, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn swap_error(&self, phase: &'static str, source: io::Error, staging: &Path) -> PromoteError {
        PromoteError::Swap {
            phase,
            source,
            staging_preserved: self.fs.exists(staging),
        }
    }

    /// Put the backup back after a failed phase 2.
    async fn roll_back(&self, backup: &Path, live: &Path) {
        if self.fs.exists(live)
            && let Err(e) = self.fs.remove_dir_all(live)
        {
            warn!(path = %live.display(), error = %e, "failed to clear partial live tree");
        }
        match self.rename_with_retry(backup, live).await {
            Ok(()) => info!(live = %live.display(), "rolled back to previous tree"),
            Err(e) => error!(
                live = %live.display(),
                backup = %backup.display(),
                error = %e,
                "rollback failed; previous tree left at backup path"
            ),
        }
    }
}

impl Default for AtomicSwap {
    fn default() -> Self {
        Self::new(Arc::new(RealFs), RetryPolicy::default())
    }
}

fn backup_path(live: &Path) -> PathBuf {
    let name = live
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    live.with_file_name(format!("{}.bak_{}", name, Utc::now().timestamp_millis()))
}

#[async_trait]
impl Promoter for AtomicSwap {
    async fn promote(&self, staging: &Path, live: &Path) -> Result<PromoteOutcome, PromoteError> {
        if !self.fs.exists(staging) {
            return Err(PromoteError::StagingMissing(staging.to_path_buf()));
        }

        if !self.fs.exists(live) {
            self.rename_with_retry(staging, live)
                .await
                .map_err(|e| self.swap_error("move staging into place", e, staging))?;
            return Ok(PromoteOutcome::Created);
        }

        let backup = backup_path(live);
        info!(live = %live.display(), backup = %backup.display(), "swapping in staged tree");

        self.rename_with_retry(live, &backup)
            .await
            .map_err(|e| self.swap_error("back up live tree", e, staging))?;

        if let Err(e) = self.rename_with_retry(staging, live).await {
            error!(live = %live.display(), error = %e, "promotion failed, rolling back");
            self.roll_back(&backup, live).await;
            return Err(self.swap_error("move staging into place", e, staging));
        }

        if let Err(e) = self.fs.remove_dir_all(&backup) {
            warn!(backup = %backup.display(), error = %e, "failed to delete backup (promotion kept)");
        }
        Ok(PromoteOutcome::Replaced)
    }
}
