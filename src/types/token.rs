pub type DaemonCancellationToken = tokio_util::sync::CancellationToken;

pub fn create_daemon_cancellation_token() -> DaemonCancellationToken {
    tokio_util::sync::CancellationToken::new()
}
