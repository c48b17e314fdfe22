//! Redelivery suppression for inbound requests
//!
//! A broker may hand the same request to a server more than once. Requests
//! are remembered by correlation id for a window; a repeat inside the window
//! is skipped.

use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct RequestDeduplicator {
    /// Correlation id to expiry.
    entries: Arc<DashMap<String, Instant>>,
    window: Duration,
}

impl RequestDeduplicator {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            window,
        }
    }

    /// True the first time `correlation_id` is seen within the window.
    #[must_use]
    pub fn should_process(&self, correlation_id: &str) -> bool {
        let now = Instant::now();
        match self.entries.entry(correlation_id.to_string()) {
            Entry::Occupied(mut seen) => {
                if *seen.get() > now {
                    return false;
                }
                seen.insert(now + self.window);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now + self.window);
                true
            }
        }
    }

    /// Drop expired entries every `interval` until `cancel` fires.
    pub fn spawn_cleanup(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let dedup = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => dedup.cleanup_expired(),
                }
            }
        })
    }

    fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, expires_at| *expires_at > now);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_inside_window_is_skipped() {
        let dedup = RequestDeduplicator::new(Duration::from_secs(60));

        assert!(dedup.should_process("c-1"));
        assert!(!dedup.should_process("c-1"));
        assert!(dedup.should_process("c-2"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_expired_entry_is_processed_again() {
        let dedup = RequestDeduplicator::new(Duration::ZERO);

        assert!(dedup.should_process("c-1"));
        assert!(dedup.should_process("c-1"));

        dedup.cleanup_expired();
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_on_cancel() {
        let dedup = RequestDeduplicator::new(Duration::ZERO);
        let _ = dedup.should_process("c-1");

        let cancel = CancellationToken::new();
        let handle = dedup.spawn_cleanup(Duration::from_millis(5), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(dedup.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
