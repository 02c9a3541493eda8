use anyhow::Result;
use async_trait::async_trait;

use crate::provider::{Provider, ProviderTrait};
use crate::types::{ChangeRow, ObjectOp, Timestamp};

/// Source of ordered mutation rows for a container, produced by the
/// cluster's crawler. Row ids are monotonic per container; rows come back
/// in commit order.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Rows with `row_id` strictly greater than `since_row`, oldest first.
    async fn rows_after(
        &self,
        account: &str,
        container: &str,
        since_row: i64,
        limit: usize,
    ) -> Result<Vec<ChangeRow>>;

    /// Container names under an account, for wildcard profiles.
    async fn containers(&self, account: &str) -> Result<Vec<String>>;
}

/// Fallback feed that derives PUT rows from container listings, using the
/// object timestamp (microseconds) as the row id. Deletes are invisible to
/// a listing, so delete propagation needs a crawler-backed feed.
pub struct ListingChangeFeed {
    local: Provider,
}

impl ListingChangeFeed {
    pub fn new(local: Provider) -> Self {
        Self { local }
    }
}

#[async_trait]
impl ChangeFeed for ListingChangeFeed {
    async fn rows_after(
        &self,
        _account: &str,
        container: &str,
        since_row: i64,
        limit: usize,
    ) -> Result<Vec<ChangeRow>> {
        let mut rows = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .local
                .list_objects(container, marker.as_deref(), 1000, None)
                .await?;
            for entry in &page.entries {
                let Some(timestamp) = entry
                    .last_modified
                    .as_deref()
                    .and_then(parse_listing_timestamp)
                else {
                    continue;
                };
                if timestamp.micros() <= since_row {
                    continue;
                }
                rows.push(ChangeRow {
                    row_id: timestamp.micros(),
                    object_name: entry.name.clone(),
                    op: ObjectOp::Put,
                    prev_timestamp: Some(timestamp),
                    updated_at: timestamp.secs(),
                });
            }
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        rows.sort_by_key(|r| r.row_id);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn containers(&self, account: &str) -> Result<Vec<String>> {
        Ok(self
            .local
            .list_containers(account, None, 10_000)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect())
    }
}

/// Swift listings carry `last_modified` as ISO-8601 with microseconds.
fn parse_listing_timestamp(value: &str) -> Option<Timestamp> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(Timestamp::from_micros(dt.timestamp_micros()));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Timestamp::from_micros(naive.and_utc().timestamp_micros()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_timestamp_formats() {
        let iso = parse_listing_timestamp("2021-03-04T05:06:07.123456").unwrap();
        assert_eq!(iso.micros() % 1_000_000, 123_456);
        assert!(parse_listing_timestamp("2021-03-04T05:06:07.123456+00:00").is_some());
        assert!(parse_listing_timestamp("garbage").is_none());
    }
}
