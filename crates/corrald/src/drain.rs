//! In-flight request accounting for graceful shutdown.

use std::sync::Arc;

use tokio::sync::watch;

/// Counts requests that are mid-dispatch. Shutdown waits for the count
/// to reach zero.
#[derive(Debug, Clone)]
pub struct Drain {
    count: Arc<watch::Sender<usize>>,
}

impl Default for Drain {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }
}

impl Drain {
    /// Create an empty drain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more request in flight.
    pub fn incr(&self) {
        self.count.send_modify(|count| *count += 1);
    }

    /// Count one request less in flight.
    pub fn decr(&self) {
        self.count
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Count a request in flight until the returned guard is dropped.
    #[must_use]
    pub fn enter(&self) -> DrainGuard {
        self.incr();
        DrainGuard {
            drain: self.clone(),
        }
    }

    /// Requests currently in flight.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no request is in flight.
    pub async fn wait(&self) {
        let mut count = self.count.subscribe();
        // The sender lives in self, so the channel cannot close.
        let _ = count.wait_for(|count| *count == 0).await;
    }
}

/// Keeps a request counted in its [`Drain`].
#[derive(Debug)]
pub struct DrainGuard {
    drain: Drain,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.drain.decr();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let drain = Drain::new();
        tokio::time::timeout(Duration::from_millis(100), drain.wait())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_count_returns_to_zero() {
        let drain = Drain::new();
        drain.incr();
        let guard = drain.enter();
        assert_eq!(drain.count(), 2);

        let waiter = tokio::spawn({
            let drain = drain.clone();
            async move { drain.wait().await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        drain.decr();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(drain.count(), 0);
    }

    #[test]
    fn decr_never_underflows() {
        let drain = Drain::new();
        drain.decr();
        assert_eq!(drain.count(), 0);
    }
}
