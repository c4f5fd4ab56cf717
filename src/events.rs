//! Normalized events and the subscriber fan-out bus
//!
//! Hardware input and lifecycle notifications are republished one-to-many.
//! Each subscriber owns a bounded queue; the publish path never blocks, so a
//! stalled UI consumer cannot back up hardware input decoding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::device::ConnectionStatus;

/// What a pad or button did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Press,
    Release,
    Aftertouch,
}

/// Normalized hardware input event
///
/// Created by the input decoder, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEvent {
    pub device_id: String,
    pub unit_index: u16,
    pub kind: InputKind,
    /// 0-127; velocity-insensitive devices synthesize 127 on press
    pub value: u8,
    pub timestamp_ms: u64,
}

/// Events the core emits to UI/application modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    Input(InputEvent),
    ConnectionChange {
        device_id: String,
        status: ConnectionStatus,
    },
    /// Diagnostic: one compositor pass finished for a device
    FrameComposited {
        device_id: String,
        unit_count: u16,
    },
}

/// One-to-many event fan-out with per-subscriber bounded queues
///
/// `publish` uses `try_send`: a full subscriber queue drops the event for
/// that subscriber only (counted), and closed subscribers are pruned.
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<CoreEvent>>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber with its own bounded queue.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<CoreEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish an event to every live subscriber without blocking.
    pub fn publish(&self, event: CoreEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Subscriber queue full, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Events dropped because a subscriber queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Current timestamp in milliseconds since epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(device: &str, unit: u16) -> CoreEvent {
        CoreEvent::Input(InputEvent {
            device_id: device.to_string(),
            unit_index: unit,
            kind: InputKind::Press,
            value: 127,
            timestamp_ms: now_ms(),
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(8);
        let mut b = bus.subscribe(8);

        let event = press("pad", 3);
        bus.publish(event.clone());

        assert_eq!(a.recv().await, Some(event.clone()));
        assert_eq!(b.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(1);

        let first = press("pad", 0);
        bus.publish(first.clone());
        bus.publish(press("pad", 1)); // queue full, dropped for this subscriber

        assert_eq!(bus.dropped_events(), 1);
        assert_eq!(rx.recv().await, Some(first));
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(4);
        drop(rx);

        bus.publish(press("pad", 0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_577_836_800_000); // after 2020
    }
}
