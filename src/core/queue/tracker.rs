//! Periodic timeout scanner.
//!
//! One tracker per queue. Every tick it asks the queue to expire messages that
//! sat in a store longer than the message timeout, to time out deliveries
//! whose acknowledge deadline has passed, and to release deliveries held by
//! receivers that disconnected.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::core::message::MessageDelivery;
use crate::core::queue::HorseQueue;
use crate::core::subscriber::ClientId;

/// Floor for `tracker_interval`; a zero interval would spin.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct TimeoutTracker {
    deliveries: Mutex<HashMap<u64, Arc<MessageDelivery>>>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TimeoutTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutTracker {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            deliveries: Mutex::new(HashMap::new()),
            stop,
            handle: Mutex::new(None),
        }
    }

    /// Spawns the sweep task. Must be called from within a tokio runtime.
    pub fn start(&self, queue: &Arc<HorseQueue>) {
        let mut handle = self.handle.lock();
        if handle.is_some() || *self.stop.borrow() {
            return;
        }
        let period = queue.options().tracker_interval.max(MIN_INTERVAL);
        let weak = Arc::downgrade(queue);
        let stop = self.stop.subscribe();
        *handle = Some(tokio::spawn(sweep_loop(weak, period, stop)));
    }

    /// Stops the sweep task. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.send_replace(true);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn track(&self, delivery: Arc<MessageDelivery>) {
        trace!(
            target: "horsemq::tracker",
            delivery = delivery.id(),
            message_id = %delivery.message().id(),
            "tracking delivery"
        );
        self.deliveries.lock().insert(delivery.id(), delivery);
    }

    pub fn untrack(&self, delivery_id: u64) -> Option<Arc<MessageDelivery>> {
        self.deliveries.lock().remove(&delivery_id)
    }

    /// Outstanding delivery of `message_id` to `receiver`.
    pub fn find(&self, message_id: &str, receiver: &ClientId) -> Option<Arc<MessageDelivery>> {
        self.deliveries
            .lock()
            .values()
            .find(|d| d.message().id() == message_id && d.receiver_id() == receiver)
            .cloned()
    }

    pub fn for_receiver(&self, receiver: &ClientId) -> Vec<Arc<MessageDelivery>> {
        self.deliveries
            .lock()
            .values()
            .filter(|d| d.receiver_id() == receiver)
            .cloned()
            .collect()
    }

    /// Whether any receiver still owes an acknowledge for `message_id`.
    pub fn has_message(&self, message_id: &str) -> bool {
        self.deliveries
            .lock()
            .values()
            .any(|d| d.message().id() == message_id)
    }

    /// Deliveries whose acknowledge deadline is at or before `now`, oldest first.
    pub fn expired(&self, now: Instant) -> Vec<Arc<MessageDelivery>> {
        let mut expired: Vec<_> = self
            .deliveries
            .lock()
            .values()
            .filter(|d| d.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|d| d.id());
        expired
    }

    /// Deliveries whose receiver's transport has gone away, oldest first.
    pub fn abandoned(&self) -> Vec<Arc<MessageDelivery>> {
        let mut abandoned: Vec<_> = self
            .deliveries
            .lock()
            .values()
            .filter(|d| !d.receiver().is_connected())
            .cloned()
            .collect();
        abandoned.sort_by_key(|d| d.id());
        abandoned
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn drain(&self) -> Vec<Arc<MessageDelivery>> {
        self.deliveries.lock().drain().map(|(_, d)| d).collect()
    }
}

async fn sweep_loop(queue: Weak<HorseQueue>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                queue.sweep_timeouts(Instant::now());
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    debug!(target: "horsemq::tracker", "timeout tracker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{Message, QueueMessage};
    use crate::core::subscriber::ChannelClient;

    fn delivery(receiver: &str, deadline: Option<Instant>) -> Arc<MessageDelivery> {
        let (client, _rx) = ChannelClient::new(receiver);
        let qm = Arc::new(QueueMessage::new(Message::new("q", "x"), None));
        let d = Arc::new(MessageDelivery::new(qm, client));
        if let Some(deadline) = deadline {
            d.set_acknowledge_deadline(deadline);
        }
        d
    }

    #[tokio::test(start_paused = true)]
    async fn expired_only_returns_past_deadlines() {
        let tracker = TimeoutTracker::new();
        let now = Instant::now();
        let late = delivery("a", Some(now + Duration::from_millis(50)));
        let later = delivery("b", Some(now + Duration::from_secs(5)));
        let never = delivery("c", None);
        tracker.track(late.clone());
        tracker.track(later);
        tracker.track(never);

        assert!(tracker.expired(now).is_empty());
        let expired = tracker.expired(now + Duration::from_millis(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), late.id());
    }

    #[test]
    fn find_by_message_and_receiver() {
        let tracker = TimeoutTracker::new();
        let d = delivery("a", None);
        let message_id = d.message().id().to_string();
        tracker.track(d.clone());

        assert!(tracker.find(&message_id, &ClientId::from("a")).is_some());
        assert!(tracker.find(&message_id, &ClientId::from("b")).is_none());
        assert_eq!(tracker.for_receiver(&ClientId::from("a")).len(), 1);

        assert!(tracker.untrack(d.id()).is_some());
        assert!(tracker.is_empty());
    }

    #[test]
    fn abandoned_lists_disconnected_receivers() {
        let tracker = TimeoutTracker::new();
        let (gone, _rx_gone) = ChannelClient::new("gone");
        let (alive, _rx_alive) = ChannelClient::new("alive");
        let message = Arc::new(QueueMessage::new(Message::new("q", "x"), None));
        let lost = Arc::new(MessageDelivery::new(message.clone(), gone.clone()));
        tracker.track(lost.clone());
        tracker.track(Arc::new(MessageDelivery::new(message, alive)));

        assert!(tracker.abandoned().is_empty());
        gone.disconnect();
        let abandoned = tracker.abandoned();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].id(), lost.id());
    }

    #[test]
    fn stop_is_idempotent() {
        let tracker = TimeoutTracker::new();
        tracker.stop();
        tracker.stop();
        assert!(tracker.is_stopped());
    }
}
