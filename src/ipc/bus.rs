//! Local event bus.
//!
//! A thin wrapper over [`tokio::sync::broadcast`] shared by both endpoint
//! kinds. Remote fan-out happens in the hub's dispatch loop; this bus only
//! covers listeners registered in the local process.

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const BUS_CAPACITY: usize = 256;

/// One delivered event: its bus name and JSON payload.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub name: String,
    pub payload: Value,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Deliver to all current local subscribers. Lagging or absent
    /// subscribers are not an error.
    pub fn publish(&self, name: &str, payload: Value) {
        let _ = self.tx.send(BusEvent {
            name: name.to_string(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Subscribe a listener to one event name. The returned handle can be
    /// aborted to unsubscribe; dropping it leaves the listener running.
    pub fn on<F>(&self, name: &str, listener: F) -> JoinHandle<()>
    where
        F: Fn(Value) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let name = name.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) if ev.name == name => listener(ev.payload),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(event = %name, skipped, "bus listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Like [`EventBus::on`] but auto-unsubscribes after first delivery.
    pub fn once<F>(&self, name: &str, listener: F) -> JoinHandle<()>
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let name = name.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) if ev.name == name => {
                        listener(ev.payload);
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn on_delivers_matching_events_only() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.on("a", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;

        bus.publish("a", json!(1));
        bus.publish("b", json!(2));
        bus.publish("a", json!(3));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn once_fires_a_single_time() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.once("ready", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;

        bus.publish("ready", json!(true));
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("ready", json!(true));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
