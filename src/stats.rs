use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_channel::{Receiver, Sender};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{StatsSummary, SyncStatistics};

pub fn create_stats_channel() -> (Sender<SyncStatistics>, Receiver<SyncStatistics>) {
    async_channel::unbounded()
}

/// Emits counters to a statsd daemon over UDP. Counters are optional: with
/// no host configured the collector only aggregates.
pub struct StatsdEmitter {
    socket: UdpSocket,
    prefix: String,
}

impl StatsdEmitter {
    pub async fn connect(host: &str, port: u16, prefix: &str) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, port)).await?;
        Ok(Self {
            socket,
            prefix: prefix.to_string(),
        })
    }

    async fn emit(&self, metric: &str, value: u64) {
        let line = format!("{}.{}:{}|c", self.prefix, metric, value);
        // Stats are best-effort; a dropped datagram never fails the pass.
        if let Err(e) = self.socket.send(line.as_bytes()).await {
            debug!("statsd send failed: {e}");
        }
    }

    pub async fn emit_stats(&self, stats: &SyncStatistics) {
        match stats {
            SyncStatistics::Uploaded { bytes, .. } => {
                self.emit("uploaded_objects", 1).await;
                self.emit("uploaded_bytes", *bytes).await;
            }
            SyncStatistics::AlreadyUploaded { .. } => self.emit("already_uploaded", 1).await,
            SyncStatistics::Deleted { .. } => self.emit("deleted", 1).await,
            SyncStatistics::Scanned { .. } => self.emit("scanned_objects", 1).await,
            SyncStatistics::Skipped { .. } => self.emit("skipped", 1).await,
            SyncStatistics::Migrated { bytes, .. } => {
                self.emit("migrated_objects", 1).await;
                self.emit("migrated_bytes", *bytes).await;
            }
            SyncStatistics::Conflict { .. } => self.emit("conflicts", 1).await,
            SyncStatistics::SyncError { kind, .. } => {
                self.emit(&format!("errors.{kind}"), 1).await;
            }
        }
    }
}

/// Drains the statistics channel until every sender is dropped, keeping a
/// running summary and forwarding to statsd when configured.
pub fn spawn_stats_collector(
    receiver: Receiver<SyncStatistics>,
    emitter: Option<StatsdEmitter>,
    summary: Arc<Mutex<StatsSummary>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(stats) = receiver.recv().await {
            summary.lock().unwrap().apply(&stats);
            if let Some(emitter) = &emitter {
                emitter.emit_stats(&stats).await;
            }
        }
        debug!("statistics channel closed.");
    })
}

pub async fn build_emitter(
    statsd_host: Option<&str>,
    statsd_port: u16,
    prefix: &str,
) -> Option<StatsdEmitter> {
    let host = statsd_host?;
    match StatsdEmitter::connect(host, statsd_port, prefix).await {
        Ok(emitter) => Some(emitter),
        Err(e) => {
            warn!("statsd emitter disabled: {e}");
            None
        }
    }
}
