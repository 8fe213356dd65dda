//! Per-module readiness tracking.
//!
//! Backed by one `watch` channel per module name so any number of waiters
//! can block on the readiness handshake without polling. Readiness is
//! cleared when the peer's connection drops.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Default)]
pub struct ReadyTable {
    channels: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl ReadyTable {
    fn receiver(&self, name: &str) -> watch::Receiver<bool> {
        let mut channels = self.channels.lock().expect("ready table poisoned");
        channels
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    pub fn mark_ready(&self, name: &str) {
        let mut channels = self.channels.lock().expect("ready table poisoned");
        let tx = channels
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(false).0);
        tx.send_replace(true);
    }

    pub fn clear(&self, name: &str) {
        let channels = self.channels.lock().expect("ready table poisoned");
        if let Some(tx) = channels.get(name) {
            tx.send_replace(false);
        }
    }

    pub fn is_ready(&self, name: &str) -> bool {
        let channels = self.channels.lock().expect("ready table poisoned");
        channels.get(name).map(|tx| *tx.borrow()).unwrap_or(false)
    }

    /// Wait until the named module completes its readiness handshake.
    /// Resolves immediately if it already has.
    pub async fn wait(&self, name: &str) -> bool {
        let mut rx = self.receiver(name);
        let ok = rx.wait_for(|ready| *ready).await.is_ok();
        ok
    }

    /// Bounded wait; returns `false` when the deadline passes first.
    pub async fn wait_timeout(&self, name: &str, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait(name))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_resolves_immediately_when_already_ready() {
        let table = ReadyTable::default();
        table.mark_ready("media");
        assert!(table.wait("media").await);
        assert!(table.is_ready("media"));
    }

    #[tokio::test]
    async fn wait_unblocks_on_mark() {
        let table = Arc::new(ReadyTable::default());
        let t = table.clone();
        let waiter = tokio::spawn(async move { t.wait("fs").await });
        tokio::task::yield_now().await;
        table.mark_ready("fs");
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let table = ReadyTable::default();
        assert!(!table.wait_timeout("never", Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn clear_resets_readiness() {
        let table = ReadyTable::default();
        table.mark_ready("media");
        table.clear("media");
        assert!(!table.is_ready("media"));
    }
}
