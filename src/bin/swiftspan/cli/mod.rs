use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tracing::{error, info, warn};

use swiftspan::config::{Config, ConfigWatcher};
use swiftspan::provider::{RemoteConfig, create_local_provider, create_remote_provider};
use swiftspan::ring::Ring;
use swiftspan::stats::{build_emitter, create_stats_channel, spawn_stats_collector};
use swiftspan::status::{StatusFile, StatusStore};
use swiftspan::sync::SyncEngine;
use swiftspan::sync::feed::ListingChangeFeed;
use swiftspan::types::StatsSummary;
use swiftspan::types::error::SpanError;
use swiftspan::types::token::{DaemonCancellationToken, create_daemon_cancellation_token};

use crate::{CliArgs, Command};

mod shutdown;

const EXIT_CODE_SUCCESS: i32 = 0;
const EXIT_CODE_INIT_ERROR: i32 = 1;

const STATSD_PREFIX: &str = "swiftspan";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Sync,
    Migrate,
}

pub async fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Sync { config, once } => run_daemon(&config, once, Mode::Sync).await,
        Command::Migrate { config, once } => run_daemon(&config, once, Mode::Migrate).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

async fn run_daemon(config_path: &Path, once: bool, mode: Mode) -> Result<()> {
    if !config_path.exists() {
        // Exiting zero here keeps supervisors from restart-storming a node
        // that simply has no profiles assigned.
        warn!(path = %config_path.display(), "config file missing, nothing to do.");
        std::process::exit(EXIT_CODE_SUCCESS);
    }

    let mut config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            std::process::exit(EXIT_CODE_INIT_ERROR);
        }
    };

    let cancellation_token = create_daemon_cancellation_token();
    shutdown::spawn_shutdown_handler(cancellation_token.clone());

    let mut watcher = ConfigWatcher::new(config_path);
    watcher.poll();

    if mode == Mode::Sync {
        purge_stale_status(&config);
    }

    loop {
        let pass = async {
            let result = match mode {
                Mode::Sync => run_sync_pass(&config, &cancellation_token).await,
                Mode::Migrate => run_migrator_pass(&config, &cancellation_token).await,
            };
            if let Err(e) = result {
                error!("pass failed: {e:#}");
            }
        };

        let graceful = std::time::Duration::from_secs(config.graceful_timeout);
        tokio::select! {
            _ = pass => {}
            _ = async {
                cancellation_token.cancelled().await;
                tokio::time::sleep(graceful).await;
            } => {
                warn!("graceful timeout elapsed, abandoning in-flight work.");
            }
        }

        if once || cancellation_token.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(config.poll_interval)) => {}
            _ = cancellation_token.cancelled() => break,
        }

        if let Some(reloaded) = watcher.poll() {
            info!("configuration reloaded.");
            config = reloaded;
        }
    }

    info!("daemon shut down cleanly.");
    Ok(())
}

fn purge_stale_status(config: &Config) {
    let Some(status_dir) = &config.status_dir else {
        return;
    };
    let mut keep = HashSet::new();
    let mut keep_accounts = HashSet::new();
    for profile in &config.containers {
        if profile.is_wildcard() {
            keep_accounts.insert(profile.account.clone());
        } else {
            keep.insert((profile.account.clone(), profile.container.clone()));
        }
    }
    match StatusStore::new(status_dir).purge_stale(&keep, &keep_accounts) {
        Ok(purged) if purged > 0 => info!(purged, "stale status entries purged at startup."),
        Ok(_) => {}
        Err(e) => warn!("status purge failed: {e:#}"),
    }
}

async fn run_sync_pass(config: &Config, cancellation_token: &DaemonCancellationToken) -> Result<()> {
    if config.containers.is_empty() {
        return Ok(());
    }
    let local_endpoint = config
        .local_endpoint
        .as_deref()
        .ok_or_else(|| anyhow!(SpanError::ConfigInvalid("local_endpoint is required".into())))?;
    let status_dir = config
        .status_dir
        .as_deref()
        .ok_or_else(|| anyhow!(SpanError::ConfigInvalid("status_dir is required".into())))?;

    let local = create_local_provider(local_endpoint)?;
    let status = StatusStore::new(status_dir);
    let feed = Arc::new(ListingChangeFeed::new(local.clone()));
    let ring = Ring::new("object", config.processes, config.process);

    let (stats_sender, stats_receiver) = create_stats_channel();
    let emitter = build_emitter(
        config.statsd_host.as_deref(),
        config.statsd_port,
        STATSD_PREFIX,
    )
    .await;
    let summary = Arc::new(Mutex::new(StatsSummary::default()));
    let collector = spawn_stats_collector(stats_receiver, emitter, summary.clone());

    for profile in &config.containers {
        if cancellation_token.is_cancelled() {
            break;
        }
        let remote = match create_remote_provider(RemoteConfig::from(profile)).await {
            Ok(remote) => remote,
            Err(e) => {
                error!(profile = profile.profile_id(), "provider setup failed: {e:#}");
                continue;
            }
        };
        let engine = SyncEngine::new(
            profile.clone(),
            local.clone(),
            remote,
            feed.clone(),
            status.clone(),
            ring.clone(),
            stats_sender.clone(),
            cancellation_token.clone(),
            config.workers,
            config.enumerator_workers,
            config.items_chunk,
            config.row_retry_limit,
        );
        if let Err(e) = engine.run_pass().await {
            error!(profile = profile.profile_id(), "sync pass failed: {e:#}");
        }
    }

    drop(stats_sender);
    collector.await.ok();
    log_summary("sync", &summary.lock().unwrap());
    Ok(())
}

async fn run_migrator_pass(
    config: &Config,
    cancellation_token: &DaemonCancellationToken,
) -> Result<()> {
    if config.migrations.is_empty() {
        return Ok(());
    }
    let local_endpoint = config
        .local_endpoint
        .as_deref()
        .ok_or_else(|| anyhow!(SpanError::ConfigInvalid("local_endpoint is required".into())))?;
    let status_file = config
        .migrator_settings
        .status_file
        .as_deref()
        .ok_or_else(|| {
            anyhow!(SpanError::ConfigInvalid(
                "migrator_settings.status_file is required".into()
            ))
        })?;

    let ring = Ring::new(
        &config.migrator_settings.ring_name,
        config.processes,
        config.process,
    );

    let (stats_sender, stats_receiver) = create_stats_channel();
    let emitter = build_emitter(
        config.statsd_host.as_deref(),
        config.statsd_port,
        STATSD_PREFIX,
    )
    .await;
    let summary = Arc::new(Mutex::new(StatsSummary::default()));
    let collector = spawn_stats_collector(stats_receiver, emitter, summary.clone());

    for profile in &config.migrations {
        if cancellation_token.is_cancelled() {
            break;
        }
        // Providers are rebuilt every pass; dropping them here closes the
        // pooled connections on low-traffic deployments.
        let local = match create_local_provider(local_endpoint) {
            Ok(local) => local,
            Err(e) => {
                error!("local provider setup failed: {e:#}");
                break;
            }
        };
        let remote = match create_remote_provider(RemoteConfig::from(profile)).await {
            Ok(remote) => remote,
            Err(e) => {
                error!(profile = profile.profile_id(), "provider setup failed: {e:#}");
                continue;
            }
        };
        let migrator = swiftspan::migrator::Migrator::new(
            profile.clone(),
            local,
            remote,
            StatusFile::new(status_file),
            ring.clone(),
            stats_sender.clone(),
            cancellation_token.clone(),
            config.migrator_settings.items_chunk,
            config.migrator_settings.workers,
        );
        if let Err(e) = migrator.run_pass().await {
            error!(profile = profile.profile_id(), "migration pass failed: {e:#}");
        }
    }

    drop(stats_sender);
    collector.await.ok();
    log_summary("migrator", &summary.lock().unwrap());
    Ok(())
}

fn log_summary(daemon: &str, summary: &StatsSummary) {
    info!(
        daemon,
        uploaded_objects = summary.uploaded_objects,
        uploaded_bytes = summary.uploaded_bytes,
        already_uploaded = summary.already_uploaded,
        migrated_objects = summary.migrated_objects,
        migrated_bytes = summary.migrated_bytes,
        deleted = summary.deleted,
        scanned = summary.scanned_objects,
        conflicts = summary.conflicts,
        errors = summary.errors.values().sum::<u64>(),
        "pass summary."
    );
}

fn check_config(config_path: &PathBuf) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("config check failed for {}", config_path.display()))?;
    println!(
        "{}: {} sync profile(s), {} migration(s)",
        config_path.display(),
        config.containers.len(),
        config.migrations.len()
    );
    for profile in &config.containers {
        println!(
            "  sync {} -> {:?}://{}/{}",
            profile.profile_id(),
            profile.protocol,
            profile.aws_endpoint,
            profile.aws_bucket
        );
    }
    for profile in &config.migrations {
        println!(
            "  migrate {} <- {:?}://{}/{}",
            profile.profile_id(),
            profile.protocol,
            profile.aws_endpoint,
            profile.aws_bucket
        );
    }
    Ok(())
}
