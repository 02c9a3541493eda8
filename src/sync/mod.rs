use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_channel::Sender;
use futures_util::StreamExt;
use tracing::{debug, trace, warn};

use crate::config::SyncProfile;
use crate::provider::{Provider, ProviderTrait};
use crate::ring::Ring;
use crate::status::StatusStore;
use crate::sync::feed::ChangeFeed;
use crate::sync::worker::{RowHandler, RowOutcome};
use crate::types::token::DaemonCancellationToken;
use crate::types::{ChangeRow, SyncStatistics};

pub mod feed;
pub mod worker;

/// Container-crawling pipeline: consumes the change feed, drives per-row
/// upload/delete decisions through a worker pool, and advances the durable
/// `last_row`/`verified_row` cursors.
pub struct SyncEngine {
    profile: SyncProfile,
    local: Provider,
    remote: Provider,
    feed: Arc<dyn ChangeFeed>,
    status: StatusStore,
    ring: Ring,
    stats: Sender<SyncStatistics>,
    cancellation_token: DaemonCancellationToken,
    workers: usize,
    enumerator_workers: usize,
    items_chunk: usize,
    retry_limit: u32,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: SyncProfile,
        local: Provider,
        remote: Provider,
        feed: Arc<dyn ChangeFeed>,
        status: StatusStore,
        ring: Ring,
        stats: Sender<SyncStatistics>,
        cancellation_token: DaemonCancellationToken,
        workers: usize,
        enumerator_workers: usize,
        items_chunk: usize,
        retry_limit: u32,
    ) -> Self {
        Self {
            profile,
            local,
            remote,
            feed,
            status,
            ring,
            stats,
            cancellation_token,
            workers: workers.max(1),
            enumerator_workers: enumerator_workers.max(1),
            items_chunk: items_chunk.max(1),
            retry_limit,
        }
    }

    /// One full pass over the profile's containers. Wildcard profiles walk
    /// their containers with `enumerator_workers` concurrent crawls.
    pub async fn run_pass(&self) -> Result<()> {
        let containers = if self.profile.is_wildcard() {
            self.feed.containers(&self.profile.account).await?
        } else {
            vec![self.profile.container.clone()]
        };

        futures_util::stream::iter(containers)
            .map(|container| async move {
                if self.cancellation_token.is_cancelled() {
                    return;
                }
                if let Err(e) = self.sync_container(&container).await {
                    warn!(container, "container pass failed: {e:#}");
                }
            })
            .buffer_unordered(self.enumerator_workers)
            .collect::<Vec<()>>()
            .await;
        Ok(())
    }

    async fn sync_container(&self, container: &str) -> Result<()> {
        trace!(container, "container sync started.");
        let mut record = self
            .status
            .load(&self.profile.account, container)?
            .unwrap_or_default();
        record.all_buckets = self.profile.is_wildcard();

        self.propagate_container_state(container).await;

        if self.profile.remote_delete_after > 0 && self.remote.supports_bucket_lifecycle() {
            if let Err(e) = self
                .remote
                .set_lifecycle(container, "", self.profile.remote_delete_after)
                .await
            {
                warn!(container, "lifecycle install failed: {e:#}");
            }
        }

        // Rows the previous pass left unverified get a second look before
        // new work starts.
        if record.verified_row < record.last_row {
            let rows: Vec<ChangeRow> = self
                .feed
                .rows_after(
                    &self.profile.account,
                    container,
                    record.verified_row,
                    self.items_chunk,
                )
                .await?
                .into_iter()
                .filter(|r| r.row_id <= record.last_row)
                .collect();
            if !rows.is_empty() {
                let outcomes = self.process_rows(container, &rows).await;
                for row in &rows {
                    match outcomes.get(&row.row_id) {
                        Some(RowOutcome::Done { verified: true, .. }) => {
                            record.verified_row = row.row_id;
                        }
                        _ => break,
                    }
                }
                self.status
                    .save(&self.profile.account, container, &record)?;
            } else {
                // Nothing left to re-check (rows aged out of the feed).
                record.verified_row = record.last_row;
            }
        }

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            let rows = self
                .feed
                .rows_after(
                    &self.profile.account,
                    container,
                    record.last_row,
                    self.items_chunk,
                )
                .await?;
            if rows.is_empty() {
                break;
            }
            let row_count = rows.len();
            let outcomes = self.process_rows(container, &rows).await;

            let mut deferred = false;
            let mut all_verified = record.verified_row == record.last_row;
            for row in &rows {
                match outcomes.get(&row.row_id) {
                    None | Some(RowOutcome::Deferred) => {
                        deferred = true;
                        break;
                    }
                    Some(RowOutcome::Done { verified, moved }) => {
                        record.last_row = row.row_id;
                        record.scan_count += 1;
                        if let Some(bytes) = moved {
                            record.moved_count += 1;
                            record.bytes_count += bytes;
                        }
                        if all_verified && *verified {
                            record.verified_row = row.row_id;
                        } else if !verified {
                            all_verified = false;
                        }
                    }
                    Some(RowOutcome::Failed) => {
                        // Cursor moves on; the verification sub-pass of the
                        // next run retries from verified_row.
                        record.last_row = row.row_id;
                        record.scan_count += 1;
                        all_verified = false;
                    }
                }
            }
            self.status
                .save(&self.profile.account, container, &record)?;
            if deferred || row_count < self.items_chunk {
                break;
            }
        }

        self.status
            .save(&self.profile.account, container, &record)?;
        debug!(
            container,
            last_row = record.last_row,
            verified_row = record.verified_row,
            "container sync finished."
        );
        Ok(())
    }

    /// Mirror the container itself onto a Swift remote: storage policy at
    /// creation, then user metadata (and ACLs when enabled) on every pass.
    async fn propagate_container_state(&self, container: &str) {
        if !self.profile.sync_container_metadata
            || self.remote.protocol() != crate::config::Protocol::Swift
        {
            return;
        }
        let metadata = match self.local.head_container(container).await {
            Ok(Some(metadata)) => metadata
                .into_iter()
                .filter(|(key, _)| {
                    self.profile.sync_container_acl
                        || !key.to_ascii_lowercase().starts_with("x-container-")
                })
                .collect(),
            _ => return,
        };
        if let Err(e) = self
            .remote
            .put_container(
                container,
                self.profile.storage_policy.as_deref(),
                Some(&metadata),
            )
            .await
        {
            warn!(container, "container metadata propagation failed: {e:#}");
        }
    }

    /// Fan a chunk out to the worker pool. Rows group by object key so a
    /// key never has two in-flight operations; keys this process does not
    /// own complete immediately.
    async fn process_rows(
        &self,
        container: &str,
        rows: &[ChangeRow],
    ) -> HashMap<i64, RowOutcome> {
        let mut outcomes: HashMap<i64, RowOutcome> = HashMap::new();
        let mut groups: Vec<(String, Vec<ChangeRow>)> = Vec::new();
        let mut index_by_key: HashMap<String, usize> = HashMap::new();

        for row in rows {
            if !self.ring.owns(&row.object_name) {
                outcomes.insert(row.row_id, RowOutcome::done(true));
                continue;
            }
            match index_by_key.get(&row.object_name) {
                Some(&index) => groups[index].1.push(row.clone()),
                None => {
                    index_by_key.insert(row.object_name.clone(), groups.len());
                    groups.push((row.object_name.clone(), vec![row.clone()]));
                }
            }
        }

        let handler = Arc::new(RowHandler {
            profile: self.profile.clone(),
            local: self.local.clone(),
            remote: self.remote.clone(),
            stats: self.stats.clone(),
            retry_limit: self.retry_limit,
            cancellation_token: self.cancellation_token.clone(),
        });

        let (work_sender, work_receiver) =
            async_channel::bounded::<(String, Vec<ChangeRow>)>(self.workers * 2);
        let (result_sender, result_receiver) = async_channel::unbounded();

        let mut worker_handles = Vec::with_capacity(self.workers);
        for worker_index in 0..self.workers {
            let work_receiver = work_receiver.clone();
            let result_sender = result_sender.clone();
            let handler = handler.clone();
            let container = container.to_string();
            worker_handles.push(tokio::spawn(async move {
                while let Ok((_key, rows)) = work_receiver.recv().await {
                    let mut deferred = false;
                    for row in rows {
                        let outcome = if deferred {
                            // A deferred row blocks everything behind it
                            // on the same key.
                            RowOutcome::Deferred
                        } else {
                            handler.handle_row(&container, &row).await
                        };
                        deferred = matches!(outcome, RowOutcome::Deferred);
                        let _ = result_sender.send((row.row_id, outcome)).await;
                    }
                }
                trace!(worker_index, "sync worker finished.");
            }));
        }
        drop(result_sender);

        for group in groups {
            if work_sender.send(group).await.is_err() {
                break;
            }
        }
        work_sender.close();

        while let Ok((row_id, outcome)) = result_receiver.recv().await {
            outcomes.insert(row_id, outcome);
        }
        for handle in worker_handles {
            let _ = handle.await;
        }
        outcomes
    }
}
