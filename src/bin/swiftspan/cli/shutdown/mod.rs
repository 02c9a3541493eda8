use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use swiftspan::types::token::DaemonCancellationToken;

/// Tie the daemon's cancellation token to process shutdown: SIGINT from an
/// operator and, on unix, SIGTERM from the process supervisor. The task
/// also winds down quietly if something else cancels the token first.
pub fn spawn_shutdown_handler(cancellation_token: DaemonCancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_shutdown_signal(&cancellation_token).await {
            Some(signal) => {
                warn!(signal, "shutdown signal received, stopping daemon.");
                cancellation_token.cancel();
            }
            None => debug!("shutdown handler released."),
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal(
    cancellation_token: &DaemonCancellationToken,
) -> Option<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            return wait_for_interrupt_only(cancellation_token).await;
        }
    };
    tokio::select! {
        _ = cancellation_token.cancelled() => None,
        _ = sigterm.recv() => Some("SIGTERM"),
        result = tokio::signal::ctrl_c() => interrupt_result(result),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(
    cancellation_token: &DaemonCancellationToken,
) -> Option<&'static str> {
    wait_for_interrupt_only(cancellation_token).await
}

async fn wait_for_interrupt_only(
    cancellation_token: &DaemonCancellationToken,
) -> Option<&'static str> {
    tokio::select! {
        _ = cancellation_token.cancelled() => None,
        result = tokio::signal::ctrl_c() => interrupt_result(result),
    }
}

fn interrupt_result(result: std::io::Result<()>) -> Option<&'static str> {
    match result {
        Ok(()) => Some("SIGINT"),
        Err(e) => {
            error!("cannot listen for interrupt: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use once_cell::sync::Lazy;
    use tokio::sync::Semaphore;

    use swiftspan::types::token::create_daemon_cancellation_token;

    use super::*;

    // Signal handlers are process-global; these tests run serially.
    static SEMAPHORE: Lazy<Arc<Semaphore>> = Lazy::new(|| Arc::new(Semaphore::new(1)));

    #[tokio::test]
    async fn released_by_cancellation_token() {
        init_dummy_tracing_subscriber();

        let _permit = SEMAPHORE.clone().acquire_owned().await.unwrap();

        let cancellation_token = create_daemon_cancellation_token();
        let join_handle = spawn_shutdown_handler(cancellation_token.clone());
        cancellation_token.cancel();

        join_handle.await.unwrap();

        assert!(cancellation_token.is_cancelled());
    }

    #[tokio::test]
    #[cfg(target_family = "unix")]
    async fn sigterm_cancels_the_token() {
        const WAITING_TIME_MILLIS_FOR_ASYNC_HANDLER_START: u64 = 100;

        init_dummy_tracing_subscriber();

        let _permit = SEMAPHORE.clone().acquire_owned().await.unwrap();

        let cancellation_token = create_daemon_cancellation_token();
        let join_handle = spawn_shutdown_handler(cancellation_token.clone());
        tokio::time::sleep(std::time::Duration::from_millis(
            WAITING_TIME_MILLIS_FOR_ASYNC_HANDLER_START,
        ))
        .await;

        kill_sigterm_to_self();

        join_handle.await.unwrap();

        assert!(cancellation_token.is_cancelled());
    }

    #[cfg(target_family = "unix")]
    fn kill_sigterm_to_self() {
        nix::sys::signal::kill(nix::unistd::Pid::this(), nix::sys::signal::Signal::SIGTERM)
            .unwrap();
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
