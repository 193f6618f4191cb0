//! Polling for unix sockets that may not exist yet.
//!
//! Backend runtimes are installed and restarted independently of the proxy,
//! so their sockets can appear long after the proxy starts. This module
//! provides the single readiness primitive the rest of the crate builds on.

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use futures::future::BoxFuture;
use tokio::net::UnixStream;
use tracing::debug;

/// Delay between readiness attempts.
const ATTEMPT_INTERVAL: Duration = Duration::from_millis(500);
/// Bound on the dial performed by a single readiness attempt.
const DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// An additional asynchronous readiness check, run after a successful dial.
pub type SocketCheck = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Waits until the unix socket at `path` exists and accepts connections,
/// then runs `extra_check` if one was supplied. Up to `max_attempts`
/// attempts are made (unlimited when negative) with a fixed sleep in
/// between; the error of the last attempt is returned once the attempts are
/// exhausted.
pub async fn wait_for_socket<P: AsRef<Path>>(
    path: P,
    max_attempts: i32,
    extra_check: Option<SocketCheck>,
) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match check_socket(path, extra_check.as_ref()).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        if max_attempts >= 0 && attempt >= max_attempts {
            return Err(error);
        }
        debug!(path = %path.display(), %error, "socket is not ready yet");
        tokio::time::sleep(ATTEMPT_INTERVAL).await;
    }
}

async fn check_socket(path: &Path, extra_check: Option<&SocketCheck>) -> anyhow::Result<()> {
    tokio::fs::metadata(path)
        .await
        .with_context(|| format!("{} is not here yet", path.display()))?;
    let stream = tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(path))
        .await
        .with_context(|| format!("timed out dialing {}", path.display()))?
        .with_context(|| format!("can't connect to {}", path.display()))?;
    drop(stream);
    match extra_check {
        Some(check) => check().await,
        None => Ok(()),
    }
}
