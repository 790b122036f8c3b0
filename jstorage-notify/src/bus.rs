//! `NotificationBus`: single-producer-many-consumer mutation fan-out with
//! heartbeat (spec.md §4.7).
//!
//! A bounded dispatch queue the publisher blocks on, unbounded per-listener
//! queues, origin-based self-suppression, and heartbeats that bypass both
//! the subscription filter and the self-check.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use jstorage_core::{MutationEvent, UserRef};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// `database -> set<table>` filter; an empty table set matches every table
/// in that database (spec.md §4.7).
pub type SubscriptionFilter = HashMap<String, HashSet<String>>;

struct ListenerEntry {
    user: UserRef,
    filter: SubscriptionFilter,
    sender: mpsc::UnboundedSender<MutationEvent>,
}

fn filter_matches(filter: &SubscriptionFilter, database: &str, table: &str) -> bool {
    match filter.get(database) {
        Some(tables) if tables.is_empty() => true,
        Some(tables) => tables.contains(table),
        None => false,
    }
}

/// A live subscription returned by [`NotificationBus::subscribe`].
pub struct ListenerHandle {
    id: u64,
    bus: Arc<NotificationBus>,
    receiver: mpsc::UnboundedReceiver<MutationEvent>,
}

impl ListenerHandle {
    /// Awaits the next event delivered to this listener: a mutation this
    /// listener's filter matched, or a heartbeat.
    pub async fn next(&mut self) -> Option<MutationEvent> {
        self.receiver.recv().await
    }

    pub fn close(self) {
        self.bus.unsubscribe(self.id);
    }
}

/// Process-wide mutation dispatcher. `publish` is the only path that can
/// block a caller (spec.md §5: "publishers block when that queue is full").
pub struct NotificationBus {
    listeners: dashmap::DashMap<u64, ListenerEntry>,
    next_listener_id: AtomicU64,
    sequence: AtomicU64,
    dispatch_tx: mpsc::Sender<MutationEvent>,
    dispatch_rx: std::sync::Mutex<Option<mpsc::Receiver<MutationEvent>>>,
}

impl NotificationBus {
    pub fn new(queue_bound: usize) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(queue_bound.max(1));
        Arc::new(Self {
            listeners: dashmap::DashMap::new(),
            next_listener_id: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            dispatch_tx,
            dispatch_rx: std::sync::Mutex::new(Some(dispatch_rx)),
        })
    }

    /// Starts the single dispatch worker. Calling this twice on the same
    /// bus is a programmer error. The receiver has already been handed
    /// to the first worker, and this panics rather than silently dropping
    /// events.
    pub fn start(self: &Arc<Self>) {
        let bus = self.clone();
        let mut rx = bus
            .dispatch_rx
            .lock()
            .expect("dispatch_rx mutex poisoned")
            .take()
            .expect("NotificationBus::start called more than once");
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                bus.fan_out(&event, false);
            }
            debug!("notification dispatch worker stopped; sender side dropped");
        });
    }

    /// Registers a new listener with `filter`; returns a handle whose
    /// `next()` yields matching mutation events and unconditional
    /// heartbeats, in publication order (spec.md §5 ordering guarantee 2).
    pub fn subscribe(self: &Arc<Self>, user: UserRef, filter: SubscriptionFilter) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners.insert(id, ListenerEntry { user, filter, sender });
        ListenerHandle { id, bus: self.clone(), receiver }
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.remove(&id);
    }

    /// Publishes a mutation. Blocks the caller if the dispatch queue is
    /// saturated (backpressure upward, spec.md §5).
    pub async fn publish(&self, mut event: MutationEvent) {
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        if self.dispatch_tx.send(event).await.is_err() {
            warn!("notification dispatch worker is not running; event dropped");
        }
    }

    /// Synthesises a heartbeat and delivers it to every listener
    /// unconditionally, every 2 seconds per spec.md §4.7. Driven by the
    /// `MaintenanceScheduler`, not by this bus's own worker.
    pub fn emit_heartbeat(&self, now_millis: i64) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let event = MutationEvent::heartbeat(now_millis, sequence);
        self.fan_out(&event, true);
    }

    fn fan_out(&self, event: &MutationEvent, unconditional: bool) {
        self.listeners.retain(|_, listener| {
            if !unconditional {
                if let (Some(db), Some(table)) = (event.database.as_deref(), event.table.as_deref()) {
                    if !filter_matches(&listener.filter, db, table) {
                        return true;
                    }
                }
                if let Some(origin) = &event.origin {
                    if origin == &listener.user {
                        return true;
                    }
                }
            }
            listener.sender.send(event.clone()).is_ok()
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutation(db: &str, table: &str, origin: Option<&str>) -> MutationEvent {
        MutationEvent {
            origin: origin.map(|o| UserRef(o.to_string())),
            database: Some(db.to_string()),
            table: Some(table.to_string()),
            dataset: Some("p1".to_string()),
            data_type: Some("meta".to_string()),
            kind: jstorage_core::MutationKind::Updated,
            timestamp_millis: 0,
            sequence: 0,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_matching_mutation() {
        let bus = NotificationBus::new(16);
        bus.start();
        let mut handle = bus.subscribe(UserRef("a".into()), [("blog".into(), HashSet::new())].into_iter().collect());

        bus.publish(mutation("blog", "posts", Some("b"))).await;
        let event = handle.next().await.unwrap();
        assert_eq!(event.database.as_deref(), Some("blog"));
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_non_matching_database() {
        let bus = NotificationBus::new(16);
        bus.start();
        let mut handle = bus.subscribe(UserRef("a".into()), [("blog".into(), HashSet::new())].into_iter().collect());

        bus.publish(mutation("shop", "orders", Some("b"))).await;
        bus.emit_heartbeat(1_000);
        let event = handle.next().await.unwrap();
        assert!(matches!(event.kind, jstorage_core::MutationKind::Heartbeat));
    }

    #[tokio::test]
    async fn self_origin_events_are_suppressed() {
        let bus = NotificationBus::new(16);
        bus.start();
        let mut handle = bus.subscribe(UserRef("a".into()), [("blog".into(), HashSet::new())].into_iter().collect());

        bus.publish(mutation("blog", "posts", Some("a"))).await;
        bus.emit_heartbeat(2_000);
        let event = handle.next().await.unwrap();
        assert!(matches!(event.kind, jstorage_core::MutationKind::Heartbeat));
    }

    #[tokio::test]
    async fn heartbeat_bypasses_filter_and_origin() {
        let bus = NotificationBus::new(16);
        bus.start();
        let mut handle = bus.subscribe(UserRef("a".into()), HashMap::new());

        bus.emit_heartbeat(5_000);
        let event = handle.next().await.unwrap();
        assert!(matches!(event.kind, jstorage_core::MutationKind::Heartbeat));
    }

    #[tokio::test]
    async fn closed_listener_stops_receiving() {
        let bus = NotificationBus::new(16);
        bus.start();
        let handle = bus.subscribe(UserRef("a".into()), [("blog".into(), HashSet::new())].into_iter().collect());
        assert_eq!(bus.listener_count(), 1);
        handle.close();
        assert_eq!(bus.listener_count(), 0);
    }
}
