//! Queue managers.
//!
//! A manager owns one queue's two stores, its delivery handler, its
//! synchronizer and its timeout tracker. Store mutations go through
//! [`QueueStores`] so moving a message between the priority and regular
//! store is atomic with respect to concurrent pulls.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::delivery::{AckDeliveryHandler, DeliveryHandler};
use crate::core::error::HorseError;
use crate::core::message::{MessageState, QueueMessage};
use crate::core::persistence::PersistenceStore;
use crate::core::queue::options::QueueOptions;
use crate::core::queue::store::{LinkedMessageStore, MessageStore};
use crate::core::queue::sync::{LocalSynchronizer, QueueSynchronizer};
use crate::core::queue::tracker::TimeoutTracker;
use crate::core::queue::HorseQueue;

/// The priority and regular store of one queue.
#[derive(Debug)]
pub struct QueueStores {
    priority: Box<dyn MessageStore>,
    regular: Box<dyn MessageStore>,
    lock: Mutex<()>,
}

impl Default for QueueStores {
    fn default() -> Self {
        Self::new(Box::new(LinkedMessageStore::new()), Box::new(LinkedMessageStore::new()))
    }
}

impl QueueStores {
    pub fn new(priority: Box<dyn MessageStore>, regular: Box<dyn MessageStore>) -> Self {
        Self {
            priority,
            regular,
            lock: Mutex::new(()),
        }
    }

    fn store_for(&self, message: &QueueMessage) -> &dyn MessageStore {
        if message.is_high_priority() {
            self.priority.as_ref()
        } else {
            self.regular.as_ref()
        }
    }

    pub fn priority(&self) -> &dyn MessageStore {
        self.priority.as_ref()
    }

    pub fn regular(&self) -> &dyn MessageStore {
        self.regular.as_ref()
    }

    pub fn add(&self, message: Arc<QueueMessage>, front: bool) {
        let _guard = self.lock.lock();
        message.set_state(MessageState::Stored);
        let store = self.store_for(&message);
        if front {
            store.put_front(message);
        } else {
            store.put(message);
        }
    }

    /// Next stored message, priority store first. The message comes out
    /// `InFlight`.
    pub fn pull_next(&self) -> Option<Arc<QueueMessage>> {
        let _guard = self.lock.lock();
        loop {
            let message = self
                .priority
                .pull_next()
                .or_else(|| self.regular.pull_next())?;
            if message.transition(MessageState::Stored, MessageState::InFlight) {
                return Some(message);
            }
        }
    }

    /// Returns an in-flight message to the head of its store.
    pub fn restore(&self, message: &Arc<QueueMessage>) -> bool {
        let _guard = self.lock.lock();
        if !message.transition(MessageState::InFlight, MessageState::Stored) {
            return false;
        }
        self.store_for(message).put_front(message.clone());
        true
    }

    /// Re-inserts a message whose put-back was pending.
    pub fn reinsert(&self, message: &Arc<QueueMessage>, front: bool) -> bool {
        let _guard = self.lock.lock();
        if !message.transition(MessageState::PutBackPending, MessageState::Stored) {
            return false;
        }
        let store = self.store_for(message);
        if front {
            store.put_front(message.clone());
        } else {
            store.put(message.clone());
        }
        true
    }

    pub fn remove(&self, message: &Arc<QueueMessage>) -> bool {
        let _guard = self.lock.lock();
        self.priority.remove(message) || self.regular.remove(message)
    }

    pub fn remove_by_id(&self, id: &str) -> Option<Arc<QueueMessage>> {
        let _guard = self.lock.lock();
        self.priority
            .remove_by_id(id)
            .or_else(|| self.regular.remove_by_id(id))
    }

    pub fn find(&self, id: &str) -> Option<Arc<QueueMessage>> {
        self.priority.find(id).or_else(|| self.regular.find(id))
    }

    /// Moves a stored message to the other store. False if the message is
    /// not stored or already has the requested priority.
    pub fn change_priority(&self, id: &str, high_priority: bool) -> bool {
        let _guard = self.lock.lock();
        let (from, to) = if high_priority {
            (self.regular.as_ref(), self.priority.as_ref())
        } else {
            (self.priority.as_ref(), self.regular.as_ref())
        };
        let Some(message) = from.remove_by_id(id) else {
            return false;
        };
        message.set_high_priority(high_priority);
        to.put(message);
        true
    }

    pub fn count(&self) -> usize {
        self.priority.count() + self.regular.count()
    }

    pub fn created_before(&self, cutoff: Instant) -> Vec<Arc<QueueMessage>> {
        let mut aged = self.priority.created_before(cutoff);
        aged.extend(self.regular.created_before(cutoff));
        aged
    }

    /// Takes the oldest regular message, or the oldest priority message when
    /// the regular store is empty.
    pub fn evict_oldest(&self) -> Option<Arc<QueueMessage>> {
        let _guard = self.lock.lock();
        self.regular
            .pull_next()
            .or_else(|| self.priority.pull_next())
    }

    pub fn destroy(&self) -> Vec<Arc<QueueMessage>> {
        let _guard = self.lock.lock();
        let mut drained = self.priority.destroy();
        drained.extend(self.regular.destroy());
        drained
    }
}

/// Per-queue façade over stores, delivery handler and synchronizer.
///
/// Implementors provide the four accessors; every operation has a default
/// that forwards to the right store. Override the ones that need extra
/// bookkeeping, as [`PersistentQueueManager`] does.
pub trait QueueManager: Send + Sync + Debug {
    fn stores(&self) -> &QueueStores;

    fn delivery_handler(&self) -> &Arc<dyn DeliveryHandler>;

    fn synchronizer(&self) -> &Arc<dyn QueueSynchronizer>;

    fn tracker(&self) -> &TimeoutTracker;

    fn initialize(&self, queue: &Arc<HorseQueue>) -> Result<(), HorseError> {
        self.tracker().start(queue);
        Ok(())
    }

    /// Stops the tracker, then drains both stores.
    fn destroy(&self) -> Vec<Arc<QueueMessage>> {
        self.tracker().stop();
        self.stores().destroy()
    }

    fn add_message(&self, message: Arc<QueueMessage>) {
        self.synchronizer().message_added(&message);
        self.stores().add(message, false);
    }

    fn put_back(&self, message: &Arc<QueueMessage>, front: bool) -> bool {
        self.stores().reinsert(message, front)
    }

    fn pull_next(&self) -> Option<Arc<QueueMessage>> {
        self.stores().pull_next()
    }

    fn restore(&self, message: &Arc<QueueMessage>) -> bool {
        self.stores().restore(message)
    }

    /// Removes the message from the stores (if it is still there) and tells
    /// the synchronizer it is gone.
    fn delete_message(&self, message: &Arc<QueueMessage>) -> bool {
        let removed = self.stores().remove(message);
        self.synchronizer().message_removed(message);
        removed
    }

    fn remove_message_by_id(&self, id: &str) -> Option<Arc<QueueMessage>> {
        let message = self.stores().remove_by_id(id)?;
        self.synchronizer().message_removed(&message);
        Some(message)
    }

    fn save_message(&self, queue: &HorseQueue, message: &QueueMessage) -> Result<bool, HorseError> {
        self.delivery_handler().save_message(queue, message)
    }

    fn change_message_priority(&self, id: &str, high_priority: bool) -> bool {
        self.stores().change_priority(id, high_priority)
    }

    fn find_message(&self, id: &str) -> Option<Arc<QueueMessage>> {
        self.stores().find(id)
    }

    fn count(&self) -> usize {
        self.stores().count()
    }

    fn evict_oldest(&self) -> Option<Arc<QueueMessage>> {
        let message = self.stores().evict_oldest()?;
        self.synchronizer().message_removed(&message);
        Some(message)
    }
}

/// Purely in-memory manager.
#[derive(Debug)]
pub struct MemoryQueueManager {
    stores: QueueStores,
    handler: Arc<dyn DeliveryHandler>,
    synchronizer: Arc<dyn QueueSynchronizer>,
    tracker: TimeoutTracker,
}

impl MemoryQueueManager {
    /// Manager driven by an [`AckDeliveryHandler`] built from `options`.
    pub fn new(options: &QueueOptions) -> Self {
        Self::with_handler(Arc::new(AckDeliveryHandler::from_options(options)))
    }

    pub fn with_handler(handler: Arc<dyn DeliveryHandler>) -> Self {
        Self {
            stores: QueueStores::default(),
            handler,
            synchronizer: Arc::new(LocalSynchronizer::new()),
            tracker: TimeoutTracker::new(),
        }
    }

    pub fn with_synchronizer(mut self, synchronizer: Arc<dyn QueueSynchronizer>) -> Self {
        self.synchronizer = synchronizer;
        self
    }
}

impl QueueManager for MemoryQueueManager {
    fn stores(&self) -> &QueueStores {
        &self.stores
    }

    fn delivery_handler(&self) -> &Arc<dyn DeliveryHandler> {
        &self.handler
    }

    fn synchronizer(&self) -> &Arc<dyn QueueSynchronizer> {
        &self.synchronizer
    }

    fn tracker(&self) -> &TimeoutTracker {
        &self.tracker
    }
}

pub const DEFAULT_SHRINK_INTERVAL: Duration = Duration::from_secs(30);

/// Manager that mirrors every accepted message into a [`PersistenceStore`].
#[derive(Debug)]
pub struct PersistentQueueManager {
    queue: String,
    stores: QueueStores,
    handler: Arc<dyn DeliveryHandler>,
    synchronizer: Arc<dyn QueueSynchronizer>,
    tracker: TimeoutTracker,
    persistence: Arc<dyn PersistenceStore>,
    shrink_interval: Duration,
    shrink_stop: watch::Sender<bool>,
    shrinker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentQueueManager {
    pub fn new(queue: impl Into<String>, options: &QueueOptions, persistence: Arc<dyn PersistenceStore>) -> Self {
        let handler = AckDeliveryHandler::from_options(options).with_save_on_receive(true);
        let (shrink_stop, _) = watch::channel(false);
        Self {
            queue: queue.into(),
            stores: QueueStores::default(),
            handler: Arc::new(handler),
            synchronizer: Arc::new(LocalSynchronizer::new()),
            tracker: TimeoutTracker::new(),
            persistence,
            shrink_interval: DEFAULT_SHRINK_INTERVAL,
            shrink_stop,
            shrinker: Mutex::new(None),
        }
    }

    pub fn with_shrink_interval(mut self, every: Duration) -> Self {
        self.shrink_interval = every;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn persistence(&self) -> &Arc<dyn PersistenceStore> {
        &self.persistence
    }

    fn forget(&self, message: &QueueMessage) {
        if !message.is_saved() {
            return;
        }
        if let Err(error) = self.persistence.delete(&self.queue, message.id()) {
            warn!(
                target: "horsemq::persistence",
                queue = %self.queue,
                message_id = %message.id(),
                %error,
                "failed to delete persisted message"
            );
        }
    }

    fn start_shrinker(&self) {
        if self.shrink_interval.is_zero() {
            return;
        }
        let mut slot = self.shrinker.lock();
        if slot.is_some() {
            return;
        }
        let persistence = self.persistence.clone();
        let every = self.shrink_interval;
        let queue = self.queue.clone();
        let mut stop = self.shrink_stop.subscribe();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = persistence.shrink() {
                            warn!(target: "horsemq::persistence", queue = %queue, %error, "shrink failed");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(target: "horsemq::persistence", queue = %queue, "shrink ticker stopped");
        }));
    }
}

impl QueueManager for PersistentQueueManager {
    fn stores(&self) -> &QueueStores {
        &self.stores
    }

    fn delivery_handler(&self) -> &Arc<dyn DeliveryHandler> {
        &self.handler
    }

    fn synchronizer(&self) -> &Arc<dyn QueueSynchronizer> {
        &self.synchronizer
    }

    fn tracker(&self) -> &TimeoutTracker {
        &self.tracker
    }

    fn initialize(&self, queue: &Arc<HorseQueue>) -> Result<(), HorseError> {
        self.persistence.open()?;
        let restored = self.persistence.load(&self.queue)?;
        let count = restored.len();
        for message in restored {
            let message = Arc::new(QueueMessage::new(message, None));
            message.mark_saved();
            self.stores.add(message, false);
        }
        if count > 0 {
            info!(target: "horsemq::persistence", queue = %self.queue, count, "restored persisted messages");
        }
        self.tracker.start(queue);
        self.start_shrinker();
        Ok(())
    }

    fn destroy(&self) -> Vec<Arc<QueueMessage>> {
        self.tracker.stop();
        self.shrink_stop.send_replace(true);
        if let Some(handle) = self.shrinker.lock().take() {
            handle.abort();
        }
        let drained = self.stores.destroy();
        if let Err(error) = self.persistence.close() {
            warn!(target: "horsemq::persistence", queue = %self.queue, %error, "failed to close persistence");
        }
        drained
    }

    fn delete_message(&self, message: &Arc<QueueMessage>) -> bool {
        let removed = self.stores.remove(message);
        self.synchronizer.message_removed(message);
        self.forget(message);
        removed
    }

    fn remove_message_by_id(&self, id: &str) -> Option<Arc<QueueMessage>> {
        let message = self.stores.remove_by_id(id)?;
        self.synchronizer.message_removed(&message);
        self.forget(&message);
        Some(message)
    }

    fn save_message(&self, _queue: &HorseQueue, message: &QueueMessage) -> Result<bool, HorseError> {
        self.persistence.save(&self.queue, message.message())
    }

    fn evict_oldest(&self) -> Option<Arc<QueueMessage>> {
        let message = self.stores.evict_oldest()?;
        self.synchronizer.message_removed(&message);
        self.forget(&message);
        Some(message)
    }
}

/// Builds the manager for a newly created queue.
pub trait QueueManagerFactory: Send + Sync {
    fn create(&self, name: &str, options: &QueueOptions) -> Result<Arc<dyn QueueManager>, HorseError>;
}

impl<F> QueueManagerFactory for F
where
    F: Fn(&str, &QueueOptions) -> Result<Arc<dyn QueueManager>, HorseError> + Send + Sync,
{
    fn create(&self, name: &str, options: &QueueOptions) -> Result<Arc<dyn QueueManager>, HorseError> {
        self(name, options)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryManagerFactory;

impl QueueManagerFactory for MemoryManagerFactory {
    fn create(&self, _name: &str, options: &QueueOptions) -> Result<Arc<dyn QueueManager>, HorseError> {
        Ok(Arc::new(MemoryQueueManager::new(options)))
    }
}

#[derive(Debug, Clone)]
pub struct PersistentManagerFactory {
    persistence: Arc<dyn PersistenceStore>,
    shrink_interval: Duration,
}

impl PersistentManagerFactory {
    pub fn new(persistence: Arc<dyn PersistenceStore>) -> Self {
        Self {
            persistence,
            shrink_interval: DEFAULT_SHRINK_INTERVAL,
        }
    }

    pub fn with_shrink_interval(mut self, every: Duration) -> Self {
        self.shrink_interval = every;
        self
    }
}

impl QueueManagerFactory for PersistentManagerFactory {
    fn create(&self, name: &str, options: &QueueOptions) -> Result<Arc<dyn QueueManager>, HorseError> {
        let manager = PersistentQueueManager::new(name, options, self.persistence.clone())
            .with_shrink_interval(self.shrink_interval);
        Ok(Arc::new(manager))
    }
}
