use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::MigrationProfile;
use crate::largeobject::etag::{is_multipart_etag, normalize_etag};
use crate::largeobject::translate;
use crate::provider::metadata::lookup_case_insensitive;
use crate::provider::{Provider, ProviderTrait, PutOptions};
use crate::ring::Ring;
use crate::status::{StatusFile, StatusRecord};
use crate::types::error::{SpanError, classify, is_success_on_delete};
use crate::types::token::DaemonCancellationToken;
use crate::types::{
    ListEntry, MAX_SINGLE_OBJECT_SIZE, MIGRATION_SOURCE_TIMESTAMP_KEY, MIGRATION_TAG_KEY,
    Metadata, ObjectRef, SyncStatistics, Timestamp,
};

/// Per-container migration cursor kept in the status file's `aux` value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct ContainerCursor {
    /// Largest listing marker either of the last two passes reached.
    #[serde(default)]
    marker: Option<String>,
    /// Locally-tagged objects the previous pass did not see remotely.
    /// Deletion needs a second consecutive miss.
    #[serde(default)]
    prune_candidates: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MigratorAux {
    containers: HashMap<String, ContainerCursor>,
}

/// What a pass decided about one remote entry.
#[derive(Debug, Clone, PartialEq)]
enum EntryOutcome {
    Migrated { bytes: u64 },
    UpToDate,
    FilteredOut,
    Conflict,
    Failed,
}

/// Periodically lists the remote and reconciles the local cluster against
/// it: new and changed objects come in, locally-tagged leftovers go out.
pub struct Migrator {
    pub profile: MigrationProfile,
    pub local: Provider,
    pub remote: Provider,
    pub status: StatusFile,
    pub ring: Ring,
    pub stats: Sender<SyncStatistics>,
    pub cancellation_token: DaemonCancellationToken,
    pub items_chunk: usize,
    pub workers: usize,
    /// Objects above this restore as SLOs; below it as single objects.
    pub max_single_object_size: u64,
}

impl Migrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: MigrationProfile,
        local: Provider,
        remote: Provider,
        status: StatusFile,
        ring: Ring,
        stats: Sender<SyncStatistics>,
        cancellation_token: DaemonCancellationToken,
        items_chunk: usize,
        workers: usize,
    ) -> Self {
        Self {
            profile,
            local,
            remote,
            status,
            ring,
            stats,
            cancellation_token,
            items_chunk: items_chunk.max(1),
            workers: workers.max(1),
            max_single_object_size: MAX_SINGLE_OBJECT_SIZE,
        }
    }

    pub async fn run_pass(&self) -> Result<()> {
        let mut record = self.status.load()?.unwrap_or_default();
        record.all_buckets = self.profile.is_wildcard();
        let mut aux: MigratorAux = record
            .aux
            .as_ref()
            .and_then(|raw| serde_json::from_value(raw.clone()).ok())
            .unwrap_or_default();

        let containers = if self.profile.is_wildcard() {
            self.remote
                .list_containers(&self.profile.account, None, 10_000)
                .await?
                .into_iter()
                .map(|c| c.name)
                .filter(|name| self.ring.owns(name))
                .collect()
        } else {
            vec![self.profile.container.clone()]
        };

        for container in containers {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            let cursor = aux.containers.entry(container.clone()).or_default();
            match self.migrate_container(&container, cursor, &mut record).await {
                Ok(()) => {}
                Err(e) => warn!(container, "migration pass failed: {e:#}"),
            }
        }

        record.aux = Some(serde_json::to_value(&aux)?);
        self.status.save(&record)?;
        Ok(())
    }

    async fn migrate_container(
        &self,
        container: &str,
        cursor: &mut ContainerCursor,
        record: &mut StatusRecord,
    ) -> Result<()> {
        trace!(container, "migration of container started.");
        self.ensure_local_container(container).await?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut marker: Option<String> = None;
        loop {
            if self.cancellation_token.is_cancelled() {
                return Ok(());
            }
            let page = self
                .remote
                .list_objects(container, marker.as_deref(), self.items_chunk, None)
                .await?;
            if page.entries.is_empty() {
                break;
            }
            for entry in &page.entries {
                seen.insert(entry.name.clone());
            }
            let outcomes = self.process_entries(container, &page.entries).await;
            for outcome in outcomes {
                record.scan_count += 1;
                if let EntryOutcome::Migrated { bytes } = outcome {
                    record.moved_count += 1;
                    record.bytes_count += bytes;
                }
            }
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        // The source is the source of truth: locally-tagged objects whose
        // remote counterpart stayed invisible for two consecutive passes
        // are removed. The marker bound keeps mis-aligned pagination from
        // deleting anything a shorter listing simply did not reach.
        let prune_bound = match (&cursor.marker, &marker) {
            (Some(previous), Some(current)) => Some(previous.clone().max(current.clone())),
            _ => None,
        };
        let absent = self
            .collect_absent_tagged(container, &seen, prune_bound.as_deref())
            .await?;
        let to_delete: Vec<String> = absent
            .iter()
            .filter(|name| cursor.prune_candidates.contains(*name))
            .cloned()
            .collect();
        for name in &to_delete {
            let object = ObjectRef::new(&self.profile.account, container, name);
            match self.local.delete_object(&object, None).await {
                Ok(()) => {
                    record.scan_count += 1;
                    let _ = self
                        .stats
                        .send(SyncStatistics::Deleted {
                            key: format!("{container}/{name}"),
                        })
                        .await;
                    info!(container, name, "pruned object no longer on the source.");
                }
                Err(e) if is_success_on_delete(&e) => {}
                Err(e) => warn!(container, name, "prune failed: {e:#}"),
            }
        }
        cursor.prune_candidates = absent;
        cursor.marker = marker;
        debug!(container, "migration of container finished.");
        Ok(())
    }

    /// Local objects carrying this migration's tag that the pass did not
    /// see on the remote, bounded by the listing marker when one applies.
    async fn collect_absent_tagged(
        &self,
        container: &str,
        seen: &HashSet<String>,
        bound: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut absent = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = match self
                .local
                .list_objects(container, marker.as_deref(), self.items_chunk, None)
                .await
            {
                Ok(page) => page,
                Err(e) if matches!(classify(&e), Some(SpanError::NotFound)) => break,
                Err(e) => return Err(e),
            };
            if page.entries.is_empty() {
                break;
            }
            for entry in &page.entries {
                if let Some(bound) = bound {
                    if entry.name.as_str() > bound {
                        continue;
                    }
                }
                if seen.contains(&entry.name) {
                    continue;
                }
                let object = ObjectRef::new(&self.profile.account, container, &entry.name);
                let Some(head) = self.local.head_object(&object).await? else {
                    continue;
                };
                let tagged = lookup_case_insensitive(&head.metadata, MIGRATION_TAG_KEY)
                    == Some(self.remote.provider_id().as_str());
                if tagged {
                    absent.push(entry.name.clone());
                }
            }
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(absent)
    }

    async fn ensure_local_container(&self, container: &str) -> Result<()> {
        let metadata = if self.profile.propagate_container_metadata {
            match self.remote.head_container(container).await {
                Ok(Some(metadata)) => {
                    let filtered: Metadata = metadata
                        .into_iter()
                        .filter(|(key, _)| {
                            self.profile.propagate_container_acl
                                || !key.to_ascii_lowercase().starts_with("x-container-")
                        })
                        .collect();
                    Some(filtered)
                }
                _ => None,
            }
        } else {
            None
        };
        self.local
            .put_container(
                container,
                self.profile.storage_policy.as_deref(),
                metadata.as_ref(),
            )
            .await
    }

    async fn process_entries(&self, container: &str, entries: &[ListEntry]) -> Vec<EntryOutcome> {
        let (work_sender, work_receiver) = async_channel::bounded::<ListEntry>(self.workers * 2);
        let (result_sender, result_receiver) = async_channel::unbounded();

        let migrator = Arc::new(EntryMigrator {
            profile: self.profile.clone(),
            local: self.local.clone(),
            remote: self.remote.clone(),
            stats: self.stats.clone(),
            max_single_object_size: self.max_single_object_size,
        });

        let mut handles = Vec::with_capacity(self.workers);
        for worker_index in 0..self.workers {
            let work_receiver = work_receiver.clone();
            let result_sender = result_sender.clone();
            let migrator = migrator.clone();
            let container = container.to_string();
            let cancellation_token = self.cancellation_token.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(entry) = work_receiver.recv().await {
                    if cancellation_token.is_cancelled() {
                        break;
                    }
                    let outcome = migrator.process(&container, &entry).await;
                    let _ = result_sender.send(outcome).await;
                }
                trace!(worker_index, "migration worker finished.");
            }));
        }
        drop(result_sender);

        for entry in entries {
            if work_sender.send(entry.clone()).await.is_err() {
                break;
            }
        }
        work_sender.close();

        let mut outcomes = Vec::with_capacity(entries.len());
        while let Ok(outcome) = result_receiver.recv().await {
            outcomes.push(outcome);
        }
        for handle in handles {
            let _ = handle.await;
        }
        outcomes
    }
}

struct EntryMigrator {
    profile: MigrationProfile,
    local: Provider,
    remote: Provider,
    stats: Sender<SyncStatistics>,
    max_single_object_size: u64,
}

impl EntryMigrator {
    async fn process(&self, container: &str, entry: &ListEntry) -> EntryOutcome {
        let key = format!("{container}/{}", entry.name);
        let _ = self.stats.send(SyncStatistics::Scanned { key: key.clone() }).await;
        match self.decide_and_migrate(container, entry, &key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(key, "migration of entry failed: {e:#}");
                let _ = self
                    .stats
                    .send(SyncStatistics::SyncError {
                        key,
                        kind: classify(&e)
                            .map(|k| match k {
                                SpanError::IntegrityMismatch { .. } => "integrity",
                                SpanError::LargeObjectPolicy(_) => "large_object_policy",
                                _ => "migration",
                            })
                            .unwrap_or("other"),
                    })
                    .await;
                EntryOutcome::Failed
            }
        }
    }

    async fn decide_and_migrate(
        &self,
        container: &str,
        entry: &ListEntry,
        key: &str,
    ) -> Result<EntryOutcome> {
        let object = ObjectRef::new(&self.profile.account, container, &entry.name);

        let Some(remote_head) = self.remote.head_object(&object).await? else {
            // Vanished between list and head; the next pass settles it.
            return Ok(EntryOutcome::UpToDate);
        };

        if let Some(conditions) = &self.profile.conditions {
            if !conditions.matches(&remote_head.metadata) {
                return Ok(EntryOutcome::FilteredOut);
            }
        }

        let remote_timestamp = remote_head
            .effective_timestamp()
            .ok_or_else(|| anyhow!("remote object has no usable timestamp"))?;

        if let Some(local_head) = self.local.head_object(&object).await? {
            let local_timestamp = local_head.effective_timestamp();
            if local_timestamp >= Some(remote_timestamp) {
                return Ok(EntryOutcome::UpToDate);
            }
            let tag = lookup_case_insensitive(&local_head.metadata, MIGRATION_TAG_KEY);
            let tagged_by_us = tag == Some(self.remote.provider_id().as_str());
            let untouched_since_migration = tagged_by_us
                && lookup_case_insensitive(&local_head.metadata, MIGRATION_SOURCE_TIMESTAMP_KEY)
                    .and_then(|raw| raw.parse::<Timestamp>().ok())
                    == local_timestamp;
            if !untouched_since_migration {
                // A user wrote here since we last migrated; the local copy
                // wins and the divergence is surfaced.
                let _ = self
                    .stats
                    .send(SyncStatistics::Conflict {
                        key: key.to_string(),
                    })
                    .await;
                return Ok(EntryOutcome::Conflict);
            }
        }

        let bytes = self
            .migrate_object(&object, &remote_head, remote_timestamp)
            .await?;
        let _ = self
            .stats
            .send(SyncStatistics::Migrated {
                key: key.to_string(),
                bytes,
            })
            .await;
        Ok(EntryOutcome::Migrated { bytes })
    }

    async fn migrate_object(
        &self,
        object: &ObjectRef,
        remote_head: &crate::types::ObjectHead,
        remote_timestamp: Timestamp,
    ) -> Result<u64> {
        let mut target = object.clone();
        target.timestamp = Some(remote_timestamp);
        target.size = remote_head.size;
        target.content_type = remote_head.content_type.clone().or_else(|| {
            Some(
                mime_guess::from_path(&object.name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
            )
        });
        target.metadata = remote_head.metadata.clone();
        target.metadata.insert(
            MIGRATION_TAG_KEY.to_string(),
            self.remote.provider_id(),
        );
        target.metadata.insert(
            MIGRATION_SOURCE_TIMESTAMP_KEY.to_string(),
            remote_timestamp.to_string(),
        );

        let multipart = remote_head
            .etag
            .as_deref()
            .map(is_multipart_etag)
            .unwrap_or(false);

        if multipart && remote_head.size > self.max_single_object_size {
            let manifest = self.remote.get_manifest(object).await?;
            translate::restore_large_object(&self.remote, &self.local, &target, manifest).await?;
            return Ok(remote_head.size);
        }

        let response = self.remote.get_object(object, None).await?;
        let outcome = self
            .local
            .put_object(&target, response.body, Some(remote_head.size), &PutOptions::default())
            .await?;
        if !multipart {
            if let (Some(actual), Some(expected)) = (&outcome.etag, &remote_head.etag) {
                if normalize_etag(actual) != normalize_etag(expected) {
                    self.local.delete_object(&target, None).await.ok();
                    return Err(anyhow!(SpanError::IntegrityMismatch {
                        expected: normalize_etag(expected),
                        actual: actual.clone(),
                    }));
                }
            }
        }
        Ok(remote_head.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::Config;
    use crate::largeobject::Manifest;
    use crate::provider::mock::MockProvider;
    use crate::stats::{create_stats_channel, spawn_stats_collector};
    use crate::types::StatsSummary;
    use crate::types::token::create_daemon_cancellation_token;

    fn test_profile(overrides: serde_json::Value) -> MigrationProfile {
        let mut doc = serde_json::json!({
            "account": "AUTH_test",
            "container": "b",
            "aws_endpoint": "https://remote.example.com",
            "aws_identity": "identity",
            "aws_secret": "secret",
            "aws_bucket": "bucket",
            "protocol": "s3"
        });
        if let (Some(base), Some(extra)) = (doc.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        let config =
            Config::from_json(&serde_json::json!({"migrations": [doc]}).to_string()).unwrap();
        config.migrations.into_iter().next().unwrap()
    }

    struct Harness {
        local: MockProvider,
        remote: MockProvider,
        status_dir: tempfile::TempDir,
        summary: Arc<Mutex<StatsSummary>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                local: MockProvider::swift("swift:local"),
                remote: MockProvider::s3("s3:remote"),
                status_dir: tempfile::tempdir().unwrap(),
                summary: Arc::new(Mutex::new(StatsSummary::default())),
            }
        }

        async fn run_with(&self, profile: MigrationProfile, max_single: u64) {
            let (stats_sender, stats_receiver) = create_stats_channel();
            let collector = spawn_stats_collector(stats_receiver, None, self.summary.clone());
            let mut migrator = Migrator::new(
                profile,
                Box::new(self.local.clone()),
                Box::new(self.remote.clone()),
                StatusFile::new(&self.status_dir.path().join("migrator-status")),
                Ring::new("container", 1, 0),
                stats_sender,
                create_daemon_cancellation_token(),
                100,
                2,
            );
            migrator.max_single_object_size = max_single;
            migrator.run_pass().await.unwrap();
            drop(migrator);
            collector.await.unwrap();
        }

        async fn run(&self, profile: MigrationProfile) {
            self.run_with(profile, MAX_SINGLE_OBJECT_SIZE).await;
        }

        fn summary(&self) -> StatsSummary {
            self.summary.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn migrates_new_object_with_tags_and_source_timestamp() {
        let harness = Harness::new();
        let remote = harness.remote.insert("b", "k", b"payload", Metadata::new());

        harness.run(test_profile(serde_json::json!({}))).await;

        let local = harness.local.get_stored("b", "k").unwrap();
        assert_eq!(local.data, b"payload");
        assert_eq!(local.timestamp, remote.timestamp);
        assert_eq!(local.metadata[MIGRATION_TAG_KEY], "s3:remote");
        assert_eq!(
            local.metadata[MIGRATION_SOURCE_TIMESTAMP_KEY],
            remote.timestamp.to_string()
        );
        assert_eq!(harness.summary().migrated_objects, 1);
    }

    #[tokio::test]
    async fn newer_local_object_is_left_alone() {
        let harness = Harness::new();
        harness.remote.insert("b", "k", b"old", Metadata::new());
        // Inserted later, so the mock clock gives it a newer timestamp.
        harness.local.insert("b", "k", b"newer-local", Metadata::new());

        harness.run(test_profile(serde_json::json!({}))).await;

        assert_eq!(
            harness.local.get_stored("b", "k").unwrap().data,
            b"newer-local"
        );
        assert_eq!(harness.summary().migrated_objects, 0);
        assert_eq!(harness.summary().conflicts, 0);
    }

    #[tokio::test]
    async fn user_mutated_local_object_conflicts() {
        let harness = Harness::new();
        harness.local.insert("b", "k", b"user-data", Metadata::new());
        // Remote write happens later, so it is newer but untagged locally.
        harness.remote.insert("b", "k", b"remote-data", Metadata::new());

        harness.run(test_profile(serde_json::json!({}))).await;

        assert_eq!(harness.local.get_stored("b", "k").unwrap().data, b"user-data");
        assert_eq!(harness.summary().conflicts, 1);
        assert_eq!(harness.summary().migrated_objects, 0);
    }

    #[tokio::test]
    async fn tagged_stale_copy_is_overwritten() {
        let harness = Harness::new();
        harness.remote.insert("b", "k", b"v1", Metadata::new());
        harness.run(test_profile(serde_json::json!({}))).await;
        assert_eq!(harness.local.get_stored("b", "k").unwrap().data, b"v1");

        harness.remote.insert("b", "k", b"v2", Metadata::new());
        harness.run(test_profile(serde_json::json!({}))).await;

        assert_eq!(harness.local.get_stored("b", "k").unwrap().data, b"v2");
        assert_eq!(harness.summary().migrated_objects, 2);
        assert_eq!(harness.summary().conflicts, 0);
    }

    #[tokio::test]
    async fn second_pass_migrates_nothing_new() {
        let harness = Harness::new();
        harness.remote.insert("b", "a", b"1", Metadata::new());
        harness.remote.insert("b", "z", b"2", Metadata::new());

        harness.run(test_profile(serde_json::json!({}))).await;
        assert_eq!(harness.summary().migrated_objects, 2);

        harness.run(test_profile(serde_json::json!({}))).await;
        assert_eq!(harness.summary().migrated_objects, 2);
    }

    #[tokio::test]
    async fn prune_requires_two_consecutive_misses() {
        let harness = Harness::new();
        harness.remote.insert("b", "gone", b"x", Metadata::new());
        harness.remote.insert("b", "stays", b"y", Metadata::new());

        harness.run(test_profile(serde_json::json!({}))).await;
        assert!(harness.local.get_stored("b", "gone").is_some());

        harness.remote.remove("b", "gone");

        // First miss: candidate only, still present locally.
        harness.run(test_profile(serde_json::json!({}))).await;
        assert!(harness.local.get_stored("b", "gone").is_some());

        // Second miss: pruned.
        harness.run(test_profile(serde_json::json!({}))).await;
        assert!(harness.local.get_stored("b", "gone").is_none());
        assert!(harness.local.get_stored("b", "stays").is_some());
    }

    #[tokio::test]
    async fn object_present_in_both_stores_is_never_pruned() {
        let harness = Harness::new();
        harness.remote.insert("b", "k", b"x", Metadata::new());
        for _ in 0..4 {
            harness.run(test_profile(serde_json::json!({}))).await;
            assert!(harness.local.get_stored("b", "k").is_some());
        }
    }

    #[tokio::test]
    async fn untagged_local_objects_are_never_pruned() {
        let harness = Harness::new();
        harness.local.insert("b", "user-owned", b"mine", Metadata::new());
        harness.remote.insert("b", "other", b"x", Metadata::new());

        harness.run(test_profile(serde_json::json!({}))).await;
        harness.run(test_profile(serde_json::json!({}))).await;

        assert!(harness.local.get_stored("b", "user-owned").is_some());
    }

    #[tokio::test]
    async fn metadata_conditions_filter_entries() {
        let harness = Harness::new();
        let mut gold = Metadata::new();
        gold.insert("class".to_string(), "gold".to_string());
        harness.remote.insert("b", "wanted", b"x", gold);
        harness.remote.insert("b", "unwanted", b"y", Metadata::new());

        harness
            .run(test_profile(serde_json::json!({
                "metadata_conditions": {"key": "class", "value": "gold"}
            })))
            .await;

        assert!(harness.local.get_stored("b", "wanted").is_some());
        assert!(harness.local.get_stored("b", "unwanted").is_none());
    }

    #[tokio::test]
    async fn large_multipart_object_restores_as_slo() {
        let harness = Harness::new();
        // Build a multipart object on the remote via the mpu surface.
        let object = ObjectRef::new("AUTH_test", "b", "big");
        let remote: Provider = Box::new(harness.remote.clone());
        let upload_id = remote.create_multipart_upload(&object).await.unwrap();
        let part1 = vec![1u8; 64];
        let part2 = vec![2u8; 64];
        let mut parts = Vec::new();
        for (number, data) in [(1, &part1), (2, &part2)] {
            let etag = remote
                .upload_part(
                    &object,
                    &upload_id,
                    number,
                    crate::provider::body_from_bytes(data.clone()),
                    data.len() as u64,
                )
                .await
                .unwrap();
            parts.push(crate::largeobject::MpuPart {
                part_number: number,
                etag,
                size: data.len() as u64,
            });
        }
        let completed = remote
            .complete_multipart_upload(&object, &upload_id, &parts)
            .await
            .unwrap();
        assert!(completed.etag.unwrap().ends_with("-2"));

        harness.run_with(test_profile(serde_json::json!({})), 100).await;

        let manifest = harness.local.get_stored("b", "big").unwrap();
        let Some(Manifest::Slo(segments)) = manifest.manifest else {
            panic!("expected an SLO manifest locally");
        };
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].size, 64);
        assert_eq!(harness.local.object_count("b_segments"), 2);
        assert_eq!(harness.summary().migrated_objects, 1);
    }

    #[tokio::test]
    async fn slo_roundtrip_preserves_composite_etag_and_segments() {
        use crate::provider::mock::seed_slo;
        use crate::sync::SyncEngine;
        use crate::sync::feed::testing::VecFeed;
        use crate::types::{ChangeRow, ObjectOp};

        // Sync a local SLO out to the s3 side.
        let origin = MockProvider::swift("swift:origin");
        let remote = MockProvider::s3("s3:remote");
        let chunk = vec![5u8; 5 * 1024 * 1024];
        let chunks: Vec<&[u8]> = vec![&chunk, &chunk, &chunk];
        let segments = seed_slo(&origin, "c", "big", "c_segments", &chunks);

        let feed = Arc::new(VecFeed::new());
        let manifest_ts = origin.get_stored("c", "big").unwrap().timestamp;
        feed.push(
            "c",
            ChangeRow {
                row_id: 1,
                object_name: "big".to_string(),
                op: ObjectOp::Put,
                prev_timestamp: Some(manifest_ts),
                updated_at: 0,
            },
        );
        let sync_profile = {
            let doc = serde_json::json!({"containers": [{
                "account": "AUTH_test",
                "container": "c",
                "aws_endpoint": "https://remote.example.com",
                "aws_identity": "identity",
                "aws_secret": "secret",
                "aws_bucket": "bucket",
                "protocol": "s3"
            }]});
            Config::from_json(&doc.to_string())
                .unwrap()
                .containers
                .into_iter()
                .next()
                .unwrap()
        };
        let status_dir = tempfile::tempdir().unwrap();
        let (stats_sender, stats_receiver) = create_stats_channel();
        drop(stats_receiver);
        let engine = SyncEngine::new(
            sync_profile,
            Box::new(origin.clone()),
            Box::new(remote.clone()),
            feed,
            crate::status::StatusStore::new(status_dir.path()),
            Ring::new("container", 1, 0),
            stats_sender,
            create_daemon_cancellation_token(),
            1,
            1,
            100,
            0,
        );
        engine.run_pass().await.unwrap();

        let mpu = remote.get_stored("c", "big").unwrap();
        let expected_composite =
            crate::largeobject::etag::mpu_etag(segments.iter().map(|s| s.etag.as_str())).unwrap();
        assert_eq!(mpu.etag, expected_composite);

        // Migrate into a fresh cluster and compare manifests.
        let harness = Harness {
            local: MockProvider::swift("swift:fresh"),
            remote,
            status_dir: tempfile::tempdir().unwrap(),
            summary: Arc::new(Mutex::new(StatsSummary::default())),
        };
        let mut profile = test_profile(serde_json::json!({}));
        profile.container = "c".to_string();
        harness.run_with(profile, 1).await;

        let restored = harness.local.get_stored("c", "big").unwrap();
        let Some(Manifest::Slo(restored_segments)) = restored.manifest else {
            panic!("expected restored SLO");
        };
        let original: Vec<(String, u64)> =
            segments.iter().map(|s| (s.etag.clone(), s.size)).collect();
        let roundtripped: Vec<(String, u64)> = restored_segments
            .iter()
            .map(|s| (s.etag.clone(), s.size))
            .collect();
        assert_eq!(original, roundtripped);
        assert_eq!(
            restored.etag,
            crate::largeobject::etag::slo_etag(segments.iter().map(|s| s.etag.as_str()))
        );
    }

    #[tokio::test]
    async fn listing_pagination_covers_every_entry() {
        let harness = Harness::new();
        for index in 0..25 {
            harness
                .remote
                .insert("b", &format!("obj-{index:04}"), b"x", Metadata::new());
        }

        let (stats_sender, stats_receiver) = create_stats_channel();
        let collector = spawn_stats_collector(stats_receiver, None, harness.summary.clone());
        let migrator = Migrator::new(
            test_profile(serde_json::json!({})),
            Box::new(harness.local.clone()),
            Box::new(harness.remote.clone()),
            StatusFile::new(&harness.status_dir.path().join("migrator-status")),
            Ring::new("container", 1, 0),
            stats_sender,
            create_daemon_cancellation_token(),
            10,
            2,
        );
        migrator.run_pass().await.unwrap();
        drop(migrator);
        collector.await.unwrap();

        assert_eq!(harness.local.object_count("b"), 25);
        assert_eq!(harness.summary().migrated_objects, 25);
    }

    #[tokio::test]
    async fn small_multipart_object_restores_as_single_object() {
        let harness = Harness::new();
        let object = ObjectRef::new("AUTH_test", "b", "smallish");
        let remote: Provider = Box::new(harness.remote.clone());
        let upload_id = remote.create_multipart_upload(&object).await.unwrap();
        let data = vec![3u8; 32];
        let etag = remote
            .upload_part(
                &object,
                &upload_id,
                1,
                crate::provider::body_from_bytes(data.clone()),
                32,
            )
            .await
            .unwrap();
        remote
            .complete_multipart_upload(
                &object,
                &upload_id,
                &[crate::largeobject::MpuPart {
                    part_number: 1,
                    etag,
                    size: 32,
                }],
            )
            .await
            .unwrap();

        harness.run(test_profile(serde_json::json!({}))).await;

        let local = harness.local.get_stored("b", "smallish").unwrap();
        assert!(local.manifest.is_none());
        assert_eq!(local.data, data);
    }
}
