use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;
use zeroize_derive::{Zeroize, ZeroizeOnDrop};

use crate::config::conditions::MetadataCondition;
use crate::types::error::SpanError;

pub mod conditions;

pub const WILDCARD_CONTAINER: &str = "/*";

const DEFAULT_ITEMS_CHUNK: usize = 1000;
const DEFAULT_POLL_INTERVAL: u64 = 60;
const DEFAULT_WORKERS: usize = 10;
const DEFAULT_ENUMERATOR_WORKERS: usize = 10;
const DEFAULT_STATSD_PORT: u16 = 8125;
const DEFAULT_GRACEFUL_TIMEOUT: u64 = 15;
const DEFAULT_ROW_RETRY_LIMIT: u32 = 3;
const DEFAULT_REMOTE_DELETE_AFTER_ADDITION: i64 = 86400;
const DEFAULT_RING_NAME: &str = "container";

/// A credential value. Never printed, never serialized into status files.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop, PartialEq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: &str) -> Self {
        Self(value.to_string())
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Swift,
    S3,
}

/// One (local account, container) → (remote endpoint, bucket) binding with
/// its behavior flags. `container = "/*"` maps every container under the
/// account.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncProfile {
    pub account: String,
    pub container: String,
    pub aws_endpoint: String,
    pub aws_identity: String,
    pub aws_secret: Secret,
    pub aws_bucket: String,
    pub protocol: Protocol,

    #[serde(default)]
    pub convert_dlo: bool,
    #[serde(default)]
    pub copy_after: i64,
    #[serde(default)]
    pub exclude_pattern: String,
    #[serde(default = "default_true")]
    pub propagate_delete: bool,
    #[serde(default)]
    pub propagate_expiration: bool,
    #[serde(default)]
    pub propagate_expiration_offset: i64,
    #[serde(default)]
    pub remote_delete_after: i64,
    #[serde(default = "default_remote_delete_after_addition")]
    pub remote_delete_after_addition: i64,
    #[serde(default = "default_true")]
    pub retain_local: bool,
    #[serde(default)]
    pub retain_local_segments: bool,
    #[serde(default)]
    pub storage_policy: Option<String>,
    #[serde(default)]
    pub sync_container_acl: bool,
    #[serde(default)]
    pub sync_container_metadata: bool,
    #[serde(default)]
    pub min_segment_size: Option<u64>,
    #[serde(default)]
    pub merge_namespaces: bool,
    #[serde(default)]
    pub custom_prefix: Option<String>,

    #[serde(skip)]
    pub exclude_regex: Option<Regex>,
    #[serde(flatten)]
    unknown: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

fn default_remote_delete_after_addition() -> i64 {
    DEFAULT_REMOTE_DELETE_AFTER_ADDITION
}

impl SyncProfile {
    pub fn is_wildcard(&self) -> bool {
        self.container == WILDCARD_CONTAINER
    }

    /// Stable identity for status bookkeeping and shunt lookup.
    pub fn profile_id(&self) -> String {
        format!("{}/{}", self.account, self.container)
    }

    fn validate(&mut self, index: usize) -> Result<()> {
        let at = |msg: &str| anyhow!(SpanError::ConfigInvalid(format!("containers[{index}]: {msg}")));

        if self.account.is_empty() || self.container.is_empty() {
            return Err(at("account and container are required"));
        }
        if self.aws_bucket.is_empty() {
            return Err(at("aws_bucket is required"));
        }
        if !self.exclude_pattern.is_empty() {
            self.exclude_regex = Some(
                Regex::new(&self.exclude_pattern)
                    .map_err(|e| at(&format!("bad exclude_pattern: {e}")))?,
            );
        }
        if self.sync_container_acl && !self.sync_container_metadata {
            return Err(at("sync_container_acl requires sync_container_metadata"));
        }
        if self.protocol == Protocol::S3 && self.propagate_expiration {
            return Err(at("propagate_expiration is only supported for swift targets"));
        }
        for key in self.unknown.keys() {
            warn!(profile = self.profile_id(), key, "unknown profile key ignored.");
        }
        Ok(())
    }
}

/// A remote bucket periodically pulled into the local cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationProfile {
    pub account: String,
    pub container: String,
    pub aws_endpoint: String,
    pub aws_identity: String,
    pub aws_secret: Secret,
    pub aws_bucket: String,
    pub protocol: Protocol,

    #[serde(default)]
    pub metadata_conditions: Option<serde_json::Value>,
    #[serde(default)]
    pub storage_policy: Option<String>,
    #[serde(default)]
    pub custom_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub propagate_container_metadata: bool,
    #[serde(default)]
    pub propagate_container_acl: bool,

    #[serde(skip)]
    pub conditions: Option<MetadataCondition>,
    #[serde(flatten)]
    unknown: HashMap<String, serde_json::Value>,
}

impl MigrationProfile {
    pub fn is_wildcard(&self) -> bool {
        self.container == WILDCARD_CONTAINER
    }

    pub fn profile_id(&self) -> String {
        format!("{}/{}", self.account, self.container)
    }

    fn validate(&mut self, index: usize) -> Result<()> {
        let at = |msg: &str| anyhow!(SpanError::ConfigInvalid(format!("migrations[{index}]: {msg}")));

        if self.account.is_empty() || self.container.is_empty() {
            return Err(at("account and container are required"));
        }
        if let Some(raw) = &self.metadata_conditions {
            self.conditions =
                Some(MetadataCondition::parse(raw).map_err(|e| at(&e.to_string()))?);
        }
        for key in self.unknown.keys() {
            warn!(profile = self.profile_id(), key, "unknown profile key ignored.");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigratorSettings {
    #[serde(default)]
    pub status_file: Option<PathBuf>,
    #[serde(default = "default_items_chunk")]
    pub items_chunk: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_ring_name")]
    pub ring_name: String,
}

impl Default for MigratorSettings {
    fn default() -> Self {
        Self {
            status_file: None,
            items_chunk: DEFAULT_ITEMS_CHUNK,
            workers: DEFAULT_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ring_name: DEFAULT_RING_NAME.to_string(),
        }
    }
}

fn default_items_chunk() -> usize {
    DEFAULT_ITEMS_CHUNK
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL
}

fn default_ring_name() -> String {
    DEFAULT_RING_NAME.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub containers: Vec<SyncProfile>,
    #[serde(default)]
    pub migrations: Vec<MigrationProfile>,
    #[serde(default)]
    pub migrator_settings: MigratorSettings,

    /// Internal cluster endpoint the daemons and shunt read/write through.
    #[serde(default)]
    pub local_endpoint: Option<String>,
    #[serde(default)]
    pub devices: Option<PathBuf>,
    #[serde(default = "default_items_chunk")]
    pub items_chunk: usize,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub status_dir: Option<PathBuf>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_enumerator_workers")]
    pub enumerator_workers: usize,
    #[serde(default)]
    pub statsd_host: Option<String>,
    #[serde(default = "default_statsd_port")]
    pub statsd_port: u16,
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout: u64,
    #[serde(default = "default_row_retry_limit")]
    pub row_retry_limit: u32,
    #[serde(default = "default_processes")]
    pub processes: u64,
    #[serde(default)]
    pub process: u64,

    #[serde(flatten)]
    unknown: HashMap<String, serde_json::Value>,
}

fn default_enumerator_workers() -> usize {
    DEFAULT_ENUMERATOR_WORKERS
}

fn default_statsd_port() -> u16 {
    DEFAULT_STATSD_PORT
}

fn default_graceful_timeout() -> u64 {
    DEFAULT_GRACEFUL_TIMEOUT
}

fn default_row_retry_limit() -> u32 {
    DEFAULT_ROW_RETRY_LIMIT
}

fn default_processes() -> u64 {
    1
}

impl Config {
    /// Parse and validate a config document. Required-key type mismatches
    /// fail; unknown keys warn and are dropped.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(raw)
            .map_err(|e| anyhow!(SpanError::ConfigInvalid(e.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::from_json(&raw)
    }

    fn validate(&mut self) -> Result<()> {
        if self.process >= self.processes {
            return Err(anyhow!(SpanError::ConfigInvalid(format!(
                "process {} out of range for {} processes",
                self.process, self.processes
            ))));
        }
        for (i, profile) in self.containers.iter_mut().enumerate() {
            profile.validate(i)?;
        }
        for (i, profile) in self.migrations.iter_mut().enumerate() {
            profile.validate(i)?;
        }
        for key in self.unknown.keys() {
            warn!(key, "unknown config key ignored.");
        }
        Ok(())
    }

    /// Sync profiles applying to an (account, container) pair, wildcard
    /// profiles included.
    pub fn sync_profiles_for(&self, account: &str, container: &str) -> Vec<&SyncProfile> {
        self.containers
            .iter()
            .filter(|p| p.account == account && (p.container == container || p.is_wildcard()))
            .collect()
    }

    pub fn migration_for(&self, account: &str, container: &str) -> Option<&MigrationProfile> {
        self.migrations
            .iter()
            .find(|p| p.account == account && (p.container == container || p.is_wildcard()))
    }
}

/// Re-reads the config when the file mtime changes. Invalid content on
/// reload keeps the prior config.
pub struct ConfigWatcher {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            last_mtime: None,
        }
    }

    /// Returns a freshly-loaded config when the file changed since the last
    /// successful poll, otherwise `None`.
    pub fn poll(&mut self) -> Option<Config> {
        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()?;
        if self.last_mtime == Some(mtime) {
            return None;
        }
        match Config::load(&self.path) {
            Ok(config) => {
                self.last_mtime = Some(mtime);
                Some(config)
            }
            Err(e) => {
                warn!("config reload failed, keeping prior config: {e:#}");
                // Remember the mtime anyway so a broken file is not re-read
                // every poll.
                self.last_mtime = Some(mtime);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_profile_json() -> serde_json::Value {
        serde_json::json!({
            "account": "AUTH_test",
            "container": "c",
            "aws_endpoint": "https://s3.example.com",
            "aws_identity": "identity",
            "aws_secret": "secret",
            "aws_bucket": "bucket",
            "protocol": "s3"
        })
    }

    #[test]
    fn defaults_applied() {
        let doc = serde_json::json!({"containers": [minimal_profile_json()]});
        let config = Config::from_json(&doc.to_string()).unwrap();
        let profile = &config.containers[0];

        assert!(profile.propagate_delete);
        assert!(profile.retain_local);
        assert!(!profile.retain_local_segments);
        assert!(!profile.convert_dlo);
        assert_eq!(profile.copy_after, 0);
        assert_eq!(profile.remote_delete_after_addition, 86400);
        assert_eq!(config.workers, 10);
        assert_eq!(config.poll_interval, 60);
        assert_eq!(config.items_chunk, 1000);
    }

    #[test]
    fn wildcard_container() {
        let mut doc = minimal_profile_json();
        doc["container"] = "/*".into();
        let config =
            Config::from_json(&serde_json::json!({"containers": [doc]}).to_string()).unwrap();
        assert!(config.containers[0].is_wildcard());
        assert_eq!(
            config.sync_profiles_for("AUTH_test", "anything").len(),
            1
        );
    }

    #[test]
    fn bad_exclude_pattern_is_fatal() {
        let mut doc = minimal_profile_json();
        doc["exclude_pattern"] = "[unclosed".into();
        let result = Config::from_json(&serde_json::json!({"containers": [doc]}).to_string());
        assert!(result.is_err());
    }

    #[test]
    fn acl_requires_metadata_sync() {
        let mut doc = minimal_profile_json();
        doc["protocol"] = "swift".into();
        doc["sync_container_acl"] = true.into();
        let result = Config::from_json(&serde_json::json!({"containers": [doc]}).to_string());
        assert!(result.is_err());
    }

    #[test]
    fn expiration_rejected_for_s3() {
        let mut doc = minimal_profile_json();
        doc["propagate_expiration"] = true.into();
        let result = Config::from_json(&serde_json::json!({"containers": [doc]}).to_string());
        assert!(result.is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut doc = minimal_profile_json();
        doc["no_such_key"] = "x".into();
        let config =
            Config::from_json(&serde_json::json!({"containers": [doc], "bogus": 1}).to_string())
                .unwrap();
        assert_eq!(config.containers.len(), 1);
    }

    #[test]
    fn required_key_type_mismatch_is_fatal() {
        let mut doc = minimal_profile_json();
        doc["aws_bucket"] = 42.into();
        let result = Config::from_json(&serde_json::json!({"containers": [doc]}).to_string());
        assert!(result.is_err());
    }

    #[test]
    fn metadata_conditions_parsed_at_validate() {
        let doc = serde_json::json!({
            "migrations": [{
                "account": "AUTH_test",
                "container": "c",
                "aws_endpoint": "https://s3.example.com",
                "aws_identity": "identity",
                "aws_secret": "secret",
                "aws_bucket": "bucket",
                "protocol": "s3",
                "metadata_conditions": {"key": "class", "value": "gold"}
            }]
        });
        let config = Config::from_json(&doc.to_string()).unwrap();
        assert!(config.migrations[0].conditions.is_some());
    }

    #[test]
    fn process_out_of_range_is_fatal() {
        let doc = serde_json::json!({"processes": 2, "process": 2});
        assert!(Config::from_json(&doc.to_string()).is_err());
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(****)");
        assert_eq!(secret.value(), "hunter2");
    }

    #[test]
    fn config_watcher_reloads_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, serde_json::json!({"containers": []}).to_string()).unwrap();

        let mut watcher = ConfigWatcher::new(&path);
        assert!(watcher.poll().is_some());
        assert!(watcher.poll().is_none());

        let later = SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::options().append(true).open(&path).unwrap();
        file.set_modified(later).unwrap();
        assert!(watcher.poll().is_some());
    }

    #[test]
    fn invalid_reload_keeps_prior() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, serde_json::json!({"containers": []}).to_string()).unwrap();

        let mut watcher = ConfigWatcher::new(&path);
        assert!(watcher.poll().is_some());

        std::fs::write(&path, "{ not json").unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::options().append(true).open(&path).unwrap();
        file.set_modified(later).unwrap();
        assert!(watcher.poll().is_none());
    }
}
