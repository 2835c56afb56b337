//! Helpers for driving asynchronous tests.

use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// Install a test-friendly tracing subscriber once per process. Output is
/// captured by the test harness and filtered by `RUST_LOG`.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every 10ms until it holds or `timeout` passes. Returns
/// whether it held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now().checked_add(timeout);
    loop {
        if condition() {
            return true;
        }
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn waits_for_condition() {
        let polls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&polls);
        let held = wait_until(Duration::from_secs(1), move || {
            seen.fetch_add(1, Ordering::SeqCst) >= 2
        })
        .await;
        assert!(held);
        assert!(polls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn gives_up_after_timeout() {
        assert!(!wait_until(Duration::from_millis(30), || false).await);
    }
}
