use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::error::SpanError;

/// Durable per-(profile, container) checkpoint. Secrets never appear here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Largest change-feed row id fully processed.
    pub last_row: i64,
    /// Largest row id confirmed against the remote on a second pass.
    pub verified_row: i64,
    pub bytes_count: u64,
    pub scan_count: u64,
    pub moved_count: u64,
    /// Provider-specific marker (e.g. the migrator's listing cursor).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<serde_json::Value>,
    #[serde(default)]
    pub all_buckets: bool,
}

impl StatusRecord {
    fn check_invariant(&self) -> Result<()> {
        if self.verified_row > self.last_row {
            return Err(anyhow!(
                "verified_row {} exceeds last_row {}",
                self.verified_row,
                self.last_row
            ));
        }
        Ok(())
    }
}

/// Write-temp-then-rename storage under `status_dir/<account>/<container>`.
/// Exclusive ownership of a key is guaranteed by the process partitioning,
/// not by locks.
#[derive(Debug, Clone)]
pub struct StatusStore {
    dir: PathBuf,
}

impl StatusStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn entry_path(&self, account: &str, container: &str) -> PathBuf {
        self.dir.join(account).join(container)
    }

    pub fn load(&self, account: &str, container: &str) -> Result<Option<StatusRecord>> {
        load_record(&self.entry_path(account, container))
    }

    pub fn save(&self, account: &str, container: &str, record: &StatusRecord) -> Result<()> {
        save_record(&self.entry_path(account, container), record)
    }

    pub fn remove(&self, account: &str, container: &str) -> Result<()> {
        let path = self.entry_path(account, container);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing status entry {}", path.display()))?;
        }
        Ok(())
    }

    /// Drop entries whose profile vanished from the configuration. Runs
    /// once at daemon start. Accounts under a wildcard profile keep all
    /// their entries.
    pub fn purge_stale(
        &self,
        keep: &HashSet<(String, String)>,
        keep_accounts: &HashSet<String>,
    ) -> Result<usize> {
        let mut purged = 0;
        let Ok(accounts) = std::fs::read_dir(&self.dir) else {
            return Ok(0);
        };
        for account_entry in accounts.flatten() {
            let account = account_entry.file_name().to_string_lossy().to_string();
            if keep_accounts.contains(&account) {
                continue;
            }
            let Ok(containers) = std::fs::read_dir(account_entry.path()) else {
                continue;
            };
            for container_entry in containers.flatten() {
                let container = container_entry.file_name().to_string_lossy().to_string();
                if container.contains(".corrupt.") {
                    continue;
                }
                if !keep.contains(&(account.clone(), container.clone())) {
                    std::fs::remove_file(container_entry.path())?;
                    info!(account, container, "purged stale status entry.");
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }
}

/// Single-file variant used by the migrator.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<Option<StatusRecord>> {
        load_record(&self.path)
    }

    pub fn save(&self, record: &StatusRecord) -> Result<()> {
        save_record(&self.path, record)
    }
}

fn load_record(path: &Path) -> Result<Option<StatusRecord>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    match serde_json::from_slice::<StatusRecord>(&raw) {
        Ok(record) => {
            record.check_invariant().map_err(|e| {
                anyhow!(SpanError::StatusCorrupt(format!("{}: {e}", path.display())))
            })?;
            Ok(Some(record))
        }
        Err(e) => {
            // A partial or unparseable file is moved aside; the scan
            // restarts from nothing.
            let quarantined = quarantine_path(path);
            warn!(
                path = %path.display(),
                quarantined = %quarantined.display(),
                "corrupt status entry quarantined: {e}"
            );
            std::fs::rename(path, &quarantined)
                .with_context(|| format!("quarantining {}", path.display()))?;
            Ok(None)
        }
    }
}

fn save_record(path: &Path, record: &StatusRecord) -> Result<()> {
    record.check_invariant()?;
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("status path has no parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating status dir {}", parent.display()))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp status file in {}", parent.display()))?;
    temp.write_all(&serde_json::to_vec(record)?)?;
    temp.flush()?;
    temp.persist(path)
        .with_context(|| format!("persisting status entry {}", path.display()))?;
    debug!(path = %path.display(), "status entry written.");
    Ok(())
}

fn quarantine_path(path: &Path) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    path.with_file_name(format!(
        "{}.corrupt.{now}",
        path.file_name().unwrap_or_default().to_string_lossy()
    ))
}
