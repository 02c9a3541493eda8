use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod timestamp;
pub mod token;

pub use timestamp::Timestamp;

/// User-metadata tag stamped on objects pulled in by the migrator.
pub const MIGRATION_TAG_KEY: &str = "cloud-sync";
/// Records the source timestamp observed when the object was migrated.
pub const MIGRATION_SOURCE_TIMESTAMP_KEY: &str = "source-x-timestamp";

/// S3 namespace where restored SLO manifests are preserved.
pub const MANIFEST_NAMESPACE: &str = ".manifests";

pub const SLO_HEADER: &str = "x-static-large-object";
pub const DLO_HEADER: &str = "x-object-manifest";

/// S3 rejects multipart parts below this, except the final part.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Largest object the local cluster stores without a manifest.
pub const MAX_SINGLE_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Case-preserving user metadata. Comparison is case-insensitive on keys;
/// see `provider::metadata`.
pub type Metadata = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountContainer {
    pub account: String,
    pub container: String,
}

impl AccountContainer {
    pub fn new(account: &str, container: &str) -> Self {
        Self {
            account: account.to_string(),
            container: container.to_string(),
        }
    }
}

/// A fully-qualified object reference plus whatever attributes are known
/// about it at the point of use.
#[derive(Debug, Clone, Default)]
pub struct ObjectRef {
    pub account: String,
    pub container: String,
    pub name: String,
    pub etag: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub size: u64,
    pub content_type: Option<String>,
    pub metadata: Metadata,
}

impl ObjectRef {
    pub fn new(account: &str, container: &str, name: &str) -> Self {
        Self {
            account: account.to_string(),
            container: container.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// `container/name`, the form used in change-feed rows and logs.
    pub fn path(&self) -> String {
        format!("{}/{}", self.container, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOp {
    Put,
    Post,
    Delete,
}

/// One row of the container change-feed, in commit order.
#[derive(Debug, Clone)]
pub struct ChangeRow {
    pub row_id: i64,
    pub object_name: String,
    pub op: ObjectOp,
    /// `X-Timestamp` recorded by the crawler when the row was produced.
    pub prev_timestamp: Option<Timestamp>,
    /// Unix seconds of the row mutation, used by `copy_after`.
    pub updated_at: i64,
}

/// Which large-object convention a HEAD response advertised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestKind {
    /// `X-Static-Large-Object: true`
    Slo,
    /// `X-Object-Manifest: <container>/<prefix>`
    Dlo { container: String, prefix: String },
}

/// Attributes of an object as reported by a HEAD or GET.
#[derive(Debug, Clone, Default)]
pub struct ObjectHead {
    pub etag: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
    pub content_type: Option<String>,
    pub metadata: Metadata,
    pub manifest: Option<ManifestKind>,
    /// `X-Delete-At`, unix seconds.
    pub delete_at: Option<i64>,
}

impl ObjectHead {
    /// Best-available timestamp: the cluster timestamp when present,
    /// otherwise synthesized from `Last-Modified`.
    pub fn effective_timestamp(&self) -> Option<Timestamp> {
        self.timestamp.or_else(|| {
            self.last_modified
                .as_ref()
                .map(Timestamp::from_last_modified)
        })
    }
}

/// One entry of a container listing, local or remote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListEntry {
    pub name: String,
    pub bytes: u64,
    pub hash: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    /// Set on entries only present on the remote side of a merged listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_location: Option<String>,
}

/// Statistics events flowing from workers to the daemon over a channel.
#[derive(Debug, Clone)]
pub enum SyncStatistics {
    Uploaded { key: String, bytes: u64 },
    AlreadyUploaded { key: String },
    Deleted { key: String },
    Scanned { key: String },
    Skipped { key: String, reason: &'static str },
    Migrated { key: String, bytes: u64 },
    Conflict { key: String },
    SyncError { key: String, kind: &'static str },
}

/// Aggregated view of the statistics stream, logged at pass end.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsSummary {
    pub uploaded_objects: u64,
    pub uploaded_bytes: u64,
    pub already_uploaded: u64,
    pub deleted: u64,
    pub scanned_objects: u64,
    pub skipped: u64,
    pub migrated_objects: u64,
    pub migrated_bytes: u64,
    pub conflicts: u64,
    pub errors: HashMap<String, u64>,
}

impl StatsSummary {
    pub fn apply(&mut self, stats: &SyncStatistics) {
        match stats {
            SyncStatistics::Uploaded { bytes, .. } => {
                self.uploaded_objects += 1;
                self.uploaded_bytes += bytes;
            }
            SyncStatistics::AlreadyUploaded { .. } => self.already_uploaded += 1,
            SyncStatistics::Deleted { .. } => self.deleted += 1,
            SyncStatistics::Scanned { .. } => self.scanned_objects += 1,
            SyncStatistics::Skipped { .. } => self.skipped += 1,
            SyncStatistics::Migrated { bytes, .. } => {
                self.migrated_objects += 1;
                self.migrated_bytes += bytes;
            }
            SyncStatistics::Conflict { .. } => self.conflicts += 1,
            SyncStatistics::SyncError { kind, .. } => {
                *self.errors.entry(kind.to_string()).or_default() += 1;
            }
        }
    }
}
