use anyhow::{Result, anyhow};
use async_channel::Sender;
use tracing::{debug, warn};

use crate::config::{Protocol, SyncProfile};
use crate::largeobject::etag::{is_multipart_etag, mpu_etag, normalize_etag};
use crate::largeobject::{Manifest, SloSegment, translate};
use crate::provider::{Provider, ProviderTrait, PutOptions, metadata::metadata_equal};
use crate::types::error::{SpanError, classify, is_success_on_delete};
use crate::types::token::DaemonCancellationToken;
use crate::types::{ChangeRow, ManifestKind, ObjectOp, ObjectRef, SyncStatistics, Timestamp};

const BACKOFF_BASE_MILLIS: u64 = 1000;
const BACKOFF_CAP_MILLIS: u64 = 30_000;

/// Result of one change-feed row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    /// Processed. `verified` means the remote state was confirmed;
    /// `moved` carries uploaded bytes when an actual transfer happened.
    Done { verified: bool, moved: Option<u64> },
    /// Not processed yet (copy_after gate, object changed underneath);
    /// the cursor must not advance past this row.
    Deferred,
    /// Retries exhausted; the cursor moves on unverified.
    Failed,
}

impl RowOutcome {
    pub fn done(verified: bool) -> Self {
        RowOutcome::Done {
            verified,
            moved: None,
        }
    }
}

/// Per-row upload/delete decisions, shared by every sync worker task.
pub struct RowHandler {
    pub profile: SyncProfile,
    pub local: Provider,
    pub remote: Provider,
    pub stats: Sender<SyncStatistics>,
    pub retry_limit: u32,
    pub cancellation_token: DaemonCancellationToken,
}

impl RowHandler {
    pub async fn handle_row(&self, container: &str, row: &ChangeRow) -> RowOutcome {
        let mut attempt = 0u32;
        loop {
            if self.cancellation_token.is_cancelled() {
                return RowOutcome::Deferred;
            }
            match self.process(container, row).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    let retryable = classify(&e).map(|k| k.is_retryable()).unwrap_or(false);
                    if retryable && attempt < self.retry_limit {
                        let delay = (BACKOFF_BASE_MILLIS << attempt).min(BACKOFF_CAP_MILLIS);
                        debug!(
                            key = row.object_name,
                            attempt, "row failed, backing off {delay}ms: {e:#}"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {}
                            _ = self.cancellation_token.cancelled() => return RowOutcome::Deferred,
                        }
                        attempt += 1;
                        continue;
                    }
                    let kind = classify(&e).map(|k| k.kind()).unwrap_or("other");
                    warn!(key = row.object_name, kind, "row abandoned: {e:#}");
                    let _ = self
                        .stats
                        .send(SyncStatistics::SyncError {
                            key: format!("{container}/{}", row.object_name),
                            kind: classify(&e)
                                .map(|k| match k {
                                    SpanError::IntegrityMismatch { .. } => "integrity",
                                    SpanError::LargeObjectPolicy(_) => "large_object_policy",
                                    _ => "upload",
                                })
                                .unwrap_or("other"),
                        })
                        .await;
                    return RowOutcome::Failed;
                }
            }
        }
    }

    async fn process(&self, container: &str, row: &ChangeRow) -> Result<RowOutcome> {
        let key = format!("{container}/{}", row.object_name);
        let _ = self.stats.send(SyncStatistics::Scanned { key: key.clone() }).await;

        if let Some(regex) = &self.profile.exclude_regex {
            if regex.is_match(&row.object_name) {
                return Ok(RowOutcome::done(true));
            }
        }

        if self.profile.copy_after > 0 {
            let age = chrono::Utc::now().timestamp() - row.updated_at;
            if age < self.profile.copy_after {
                return Ok(RowOutcome::Deferred);
            }
        }

        match row.op {
            ObjectOp::Delete => self.propagate_delete(container, row, &key).await,
            ObjectOp::Put | ObjectOp::Post => self.upload(container, row, &key).await,
        }
    }

    async fn propagate_delete(
        &self,
        container: &str,
        row: &ChangeRow,
        key: &str,
    ) -> Result<RowOutcome> {
        if !self.profile.propagate_delete {
            return Ok(RowOutcome::done(true));
        }
        let object = ObjectRef::new(&self.profile.account, container, &row.object_name);
        match self.remote.delete_object(&object, row.prev_timestamp).await {
            Ok(()) => {
                let _ = self
                    .stats
                    .send(SyncStatistics::Deleted {
                        key: key.to_string(),
                    })
                    .await;
                Ok(RowOutcome::done(true))
            }
            Err(e) if is_success_on_delete(&e) => Ok(RowOutcome::done(true)),
            Err(e) => Err(e),
        }
    }

    async fn upload(&self, container: &str, row: &ChangeRow, key: &str) -> Result<RowOutcome> {
        let object = ObjectRef::new(&self.profile.account, container, &row.object_name);

        let Some(local_head) = self.local.head_object(&object).await? else {
            // Gone underneath us; a delete row follows in the feed.
            return Ok(RowOutcome::done(false));
        };
        if let (Some(prev), Some(current)) = (row.prev_timestamp, local_head.timestamp) {
            if current != prev {
                // The object changed after the row was produced.
                return Ok(RowOutcome::Deferred);
            }
        }
        let read_timestamp = local_head.effective_timestamp();

        let mut source = object.clone();
        source.etag = local_head.etag.clone();
        source.timestamp = local_head.timestamp;
        source.size = local_head.size;
        source.content_type = local_head.content_type.clone();
        source.metadata = local_head.metadata.clone();

        // Idempotence shortcut: identical remote content and metadata is a
        // skip, never counted as moved.
        if let Some(remote_head) = self.remote.head_object(&object).await? {
            if self.remote_matches(&source, &local_head.manifest, &remote_head).await? {
                let _ = self
                    .stats
                    .send(SyncStatistics::AlreadyUploaded {
                        key: key.to_string(),
                    })
                    .await;
                self.cleanup_local(&object, read_timestamp, &local_head.manifest)
                    .await?;
                return Ok(RowOutcome::done(true));
            }
        }

        let opts = self.put_options(local_head.delete_at);
        let mut segments_for_cleanup: Option<Vec<SloSegment>> = None;
        let moved_bytes;

        match &local_head.manifest {
            Some(ManifestKind::Dlo {
                container: dlo_container,
                prefix,
            }) => {
                if local_head.size > 0 {
                    let _ = self
                        .stats
                        .send(SyncStatistics::Skipped {
                            key: key.to_string(),
                            reason: "dlo_with_data",
                        })
                        .await;
                    return Ok(RowOutcome::done(true));
                }
                if self.profile.convert_dlo {
                    let segments = translate::expand_dlo_segments(
                        &self.local,
                        &self.profile.account,
                        &object.path(),
                        dlo_container,
                        prefix,
                    )
                    .await?;
                    moved_bytes = segments.iter().map(|s| s.size).sum();
                    self.upload_slo(&source, &segments, &opts).await?;
                    segments_for_cleanup = Some(segments);
                } else if self.remote.protocol() == Protocol::Swift {
                    // Without conversion the DLO stays a DLO; its segment
                    // containers sync separately and keep their names.
                    self.remote
                        .upload_manifest(
                            &source,
                            &Manifest::Dlo {
                                container: dlo_container.clone(),
                                prefix: prefix.clone(),
                            },
                            &opts,
                        )
                        .await?;
                    moved_bytes = 0;
                } else {
                    let _ = self
                        .stats
                        .send(SyncStatistics::Skipped {
                            key: key.to_string(),
                            reason: "dlo_requires_convert",
                        })
                        .await;
                    return Ok(RowOutcome::done(true));
                }
            }
            Some(ManifestKind::Slo) => {
                let manifest = self.local.get_manifest(&object).await?;
                let Manifest::Slo(segments) = manifest else {
                    return Err(anyhow!(SpanError::LargeObjectPolicy(
                        "slo header without slo manifest".into()
                    )));
                };
                moved_bytes = segments.iter().map(|s| s.size).sum();
                self.upload_slo(&source, &segments, &opts).await?;
                segments_for_cleanup = Some(segments);
            }
            None => {
                let response = self.local.get_object(&object, None).await?;
                let outcome = self
                    .remote
                    .put_object(&source, response.body, Some(local_head.size), &opts)
                    .await?;
                if let (Some(actual), Some(expected)) = (&outcome.etag, &source.etag) {
                    if normalize_etag(actual) != normalize_etag(expected) {
                        return Err(anyhow!(SpanError::IntegrityMismatch {
                            expected: normalize_etag(expected),
                            actual: actual.clone(),
                        }));
                    }
                }
                moved_bytes = local_head.size;
            }
        }

        let _ = self
            .stats
            .send(SyncStatistics::Uploaded {
                key: key.to_string(),
                bytes: moved_bytes,
            })
            .await;

        // The row only verifies if the object did not move underneath the
        // upload; otherwise it re-queues and the local copy stays.
        let after = self.local.head_object(&object).await?;
        let unchanged = match (&after, read_timestamp) {
            (Some(after_head), Some(read_ts)) => {
                after_head.effective_timestamp() == Some(read_ts)
            }
            (None, _) => false,
            (_, None) => true,
        };
        if !unchanged {
            return Ok(RowOutcome::Deferred);
        }

        let manifest_kind = local_head.manifest.clone();
        self.cleanup_local_segments(&object, read_timestamp, &manifest_kind, segments_for_cleanup)
            .await?;

        Ok(RowOutcome::Done {
            verified: true,
            moved: Some(moved_bytes),
        })
    }

    async fn upload_slo(
        &self,
        source: &ObjectRef,
        segments: &[SloSegment],
        opts: &PutOptions,
    ) -> Result<()> {
        match self.remote.protocol() {
            Protocol::S3 => {
                translate::sync_slo_to_mpu(
                    &self.local,
                    &self.remote,
                    source,
                    segments,
                    self.profile.min_segment_size,
                )
                .await?;
                // Preserve the manifest document for faithful restore.
                self.remote
                    .upload_manifest(source, &Manifest::Slo(segments.to_vec()), opts)
                    .await?;
            }
            Protocol::Swift => {
                let segment_opts = self.segment_put_options(opts);
                translate::sync_slo_to_swift(
                    &self.local,
                    &self.remote,
                    source,
                    segments,
                    opts,
                    &segment_opts,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Does the remote already hold exactly this object?
    async fn remote_matches(
        &self,
        source: &ObjectRef,
        manifest: &Option<ManifestKind>,
        remote_head: &crate::types::ObjectHead,
    ) -> Result<bool> {
        let Some(remote_etag) = &remote_head.etag else {
            return Ok(false);
        };
        let Some(local_etag) = &source.etag else {
            return Ok(false);
        };
        if !metadata_equal(&source.metadata, &remote_head.metadata) {
            return Ok(false);
        }
        if normalize_etag(remote_etag) == normalize_etag(local_etag) {
            return Ok(true);
        }
        // SLO against an S3 multipart remote: the composite etag is
        // computable from the segment etags when no coalescing applies.
        if matches!(manifest, Some(ManifestKind::Slo))
            && is_multipart_etag(remote_etag)
            && self.profile.min_segment_size.is_none()
        {
            let Ok(Manifest::Slo(segments)) = self.local.get_manifest(source).await else {
                return Ok(false);
            };
            if segments.iter().any(|s| s.range.is_some()) {
                return Ok(false);
            }
            let expected = mpu_etag(segments.iter().map(|s| s.etag.as_str()))?;
            return Ok(normalize_etag(remote_etag) == expected);
        }
        Ok(false)
    }

    fn put_options(&self, local_delete_at: Option<i64>) -> PutOptions {
        if !self.remote.supports_expiration_headers() {
            return PutOptions::default();
        }
        // remote_delete_after wins over expiration propagation when both
        // are configured.
        if self.profile.remote_delete_after > 0 {
            return PutOptions {
                delete_at: None,
                delete_after: Some(self.profile.remote_delete_after),
            };
        }
        if self.profile.propagate_expiration {
            if let Some(delete_at) = local_delete_at {
                return PutOptions {
                    delete_at: Some(delete_at + self.profile.propagate_expiration_offset),
                    delete_after: None,
                };
            }
        }
        PutOptions::default()
    }

    fn segment_put_options(&self, manifest_opts: &PutOptions) -> PutOptions {
        match manifest_opts.delete_after {
            Some(delete_after) => PutOptions {
                delete_at: None,
                delete_after: Some(delete_after + self.profile.remote_delete_after_addition),
            },
            None => manifest_opts.clone(),
        }
    }

    async fn cleanup_local(
        &self,
        object: &ObjectRef,
        read_timestamp: Option<Timestamp>,
        manifest: &Option<ManifestKind>,
    ) -> Result<()> {
        let segments = match manifest {
            Some(ManifestKind::Slo) if !self.profile.retain_local_segments => {
                match self.local.get_manifest(object).await {
                    Ok(Manifest::Slo(segments)) => Some(segments),
                    _ => None,
                }
            }
            _ => None,
        };
        self.cleanup_local_segments(object, read_timestamp, manifest, segments)
            .await
    }

    /// Namespace archival: drop the local copy once the remote confirmed
    /// durability, conditional on the timestamp observed at read time.
    async fn cleanup_local_segments(
        &self,
        object: &ObjectRef,
        read_timestamp: Option<Timestamp>,
        manifest: &Option<ManifestKind>,
        segments: Option<Vec<SloSegment>>,
    ) -> Result<()> {
        if self.profile.retain_local {
            return Ok(());
        }
        match self.local.delete_object(object, read_timestamp).await {
            Ok(()) => {}
            Err(e) if is_success_on_delete(&e) => return Ok(()),
            Err(e) => return Err(e),
        }
        if manifest.is_some() && !self.profile.retain_local_segments {
            if let Some(segments) = segments {
                // Segments go after the manifest so a concurrent reader
                // never sees a manifest with missing pieces.
                for segment in segments {
                    let (container, name) = segment.split_path()?;
                    let segment_ref = ObjectRef::new(&object.account, container, name);
                    match self.local.delete_object(&segment_ref, None).await {
                        Ok(()) => {}
                        Err(e) if is_success_on_delete(&e) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }
}
