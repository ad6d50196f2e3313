//! Provides a shutdown signal to stop a scan gracefully.
//!
//! See: [`signal`], [`SHUTDOWN`]

use crate::static_lazy_lock;

use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

static_lazy_lock! {
    /// The token cancelled when the process is asked to shut down.
    pub SHUTDOWN: CancellationToken = CancellationToken::new();
}

/// Waits for Ctrl + C, then cancels [`SHUTDOWN`].
///
/// Returns early without cancelling if [`SHUTDOWN`] is cancelled by other means.
pub async fn signal() {
    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => {
                info!("received Ctrl + C, shutting down…");
                SHUTDOWN.cancel();
            }
            Err(err) => error!("failed to install Ctrl + C signal handler: {err}"),
        },
        () = SHUTDOWN.cancelled() => {}
    }
}

/// Creates a token cancelled on [`SHUTDOWN`] or, if given, once `deadline` has elapsed.
///
/// The deadline timer runs on the current runtime until the token is cancelled.
pub fn scan_token(deadline: Option<Duration>) -> CancellationToken {
    let token = SHUTDOWN.child_token();

    if let Some(deadline) = deadline {
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(deadline) => {
                    warn!("scan deadline of {deadline:?} exceeded, cancelling…");
                    timer.cancel();
                }
                () = timer.cancelled() => {}
            }
        });
    }

    token
}
