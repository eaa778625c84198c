//! Broker context.
//!
//! A [`Rider`] owns every queue of one broker together with the collaborators
//! they share: manager factories, the authorization gate, the event sink, the
//! status-change handler and the consumer error channel. It is built once by
//! [`RiderBuilder`] and passed to whatever needs it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::core::auth::{AdminListAuthorizer, AllowAll, Authorizer};
use crate::core::error::{ConsumeError, HorseError};
use crate::core::events::{EventSink, NoopEventSink, QueueEventHandler};
use crate::core::message::Message;
use crate::core::queue::{
    AckResult, HorseQueue, MemoryManagerFactory, PullResult, PushResult, QueueContext, QueueManagerFactory,
    QueueOptions, QueueStatus,
};
use crate::core::subscriber::{Client, ClientId, QueueClient};

pub const DEFAULT_MANAGER: &str = "default";
const MAX_QUEUE_NAME: usize = 256;

/// Queue names are 1..=256 characters of ASCII letters, digits and `-_.:@/`.
pub fn validate_queue_name(name: &str) -> Result<(), HorseError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@' | '/'));
    if valid {
        Ok(())
    } else {
        Err(HorseError::InvalidQueueName(name.to_string()))
    }
}

pub struct RiderBuilder {
    defaults: QueueOptions,
    auto_queue_creation: bool,
    managers: HashMap<String, Arc<dyn QueueManagerFactory>>,
    authorizer: Arc<dyn Authorizer>,
    events: Arc<dyn EventSink>,
    status_handler: Option<Arc<dyn QueueEventHandler>>,
    errors: Option<UnboundedSender<ConsumeError>>,
    auto_destroy_interval: Duration,
}

impl Default for RiderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RiderBuilder {
    pub fn new() -> Self {
        Self {
            defaults: QueueOptions::default(),
            auto_queue_creation: true,
            managers: HashMap::new(),
            authorizer: Arc::new(AllowAll),
            events: Arc::new(NoopEventSink),
            status_handler: None,
            errors: None,
            auto_destroy_interval: Duration::from_secs(1),
        }
    }

    /// Builder pre-filled from the `[broker]`, `[auth]` and
    /// `[queue_defaults]` sections.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new()
            .queue_defaults(config.queue_defaults.clone())
            .auto_queue_creation(config.broker.auto_queue_creation)
            .auto_destroy_interval(Duration::from_millis(config.broker.auto_destroy_interval_ms));
        if !config.auth.admins.is_empty() {
            builder = builder.authorizer(AdminListAuthorizer::new(config.auth.admins.iter().cloned()));
        }
        builder
    }

    pub fn queue_defaults(mut self, defaults: QueueOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn auto_queue_creation(mut self, enabled: bool) -> Self {
        self.auto_queue_creation = enabled;
        self
    }

    /// Registers a manager factory that queues select by name through
    /// [`QueueOptions::manager`].
    pub fn register_manager(mut self, name: impl Into<String>, factory: impl QueueManagerFactory + 'static) -> Self {
        self.managers.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    pub fn event_sink(mut self, events: impl EventSink + 'static) -> Self {
        self.events = Arc::new(events);
        self
    }

    pub fn status_handler(mut self, handler: impl QueueEventHandler + 'static) -> Self {
        self.status_handler = Some(Arc::new(handler));
        self
    }

    pub fn error_sink(mut self, errors: UnboundedSender<ConsumeError>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Zero disables the auto-destroy sweeper.
    pub fn auto_destroy_interval(mut self, every: Duration) -> Self {
        self.auto_destroy_interval = every;
        self
    }

    /// Builds the rider. The auto-destroy sweeper only runs when this is
    /// called inside a tokio runtime.
    pub fn build(mut self) -> Arc<Rider> {
        self.managers
            .entry(DEFAULT_MANAGER.to_string())
            .or_insert_with(|| Arc::new(MemoryManagerFactory));

        let (sweeper_stop, _) = watch::channel(false);
        let rider = Arc::new(Rider {
            queues: DashMap::new(),
            defaults: RwLock::new(self.defaults),
            auto_queue_creation: self.auto_queue_creation,
            managers: self.managers,
            authorizer: self.authorizer,
            context: QueueContext {
                events: self.events,
                status_handler: self.status_handler,
                errors: self.errors,
            },
            sweeper_stop,
            sweeper: Mutex::new(None),
        });

        if !self.auto_destroy_interval.is_zero() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let stop = rider.sweeper_stop.subscribe();
                let handle = runtime.spawn(sweep_loop(Arc::downgrade(&rider), self.auto_destroy_interval, stop));
                *rider.sweeper.lock() = Some(handle);
            }
        }
        rider
    }
}

pub struct Rider {
    queues: DashMap<String, Arc<HorseQueue>>,
    defaults: RwLock<QueueOptions>,
    auto_queue_creation: bool,
    managers: HashMap<String, Arc<dyn QueueManagerFactory>>,
    authorizer: Arc<dyn Authorizer>,
    context: QueueContext,
    sweeper_stop: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Rider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rider")
            .field("queues", &self.queues.len())
            .field("auto_queue_creation", &self.auto_queue_creation)
            .field("managers", &self.managers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Rider {
    pub fn builder() -> RiderBuilder {
        RiderBuilder::new()
    }

    pub fn queue_defaults(&self) -> QueueOptions {
        self.defaults.read().clone()
    }

    pub fn set_queue_defaults(&self, defaults: QueueOptions) {
        *self.defaults.write() = defaults;
    }

    /// Creates and initializes a queue. `None` options take the broker
    /// defaults; `None` caller means the broker itself.
    pub fn create_queue(
        &self,
        name: &str,
        options: Option<QueueOptions>,
        caller: Option<&ClientId>,
    ) -> Result<Arc<HorseQueue>, HorseError> {
        validate_queue_name(name)?;
        let options = options.unwrap_or_else(|| self.queue_defaults());
        if !self.authorizer.can_create_queue(caller, name, &options) {
            return Err(HorseError::Unauthorized("create_queue"));
        }
        let factory = self
            .managers
            .get(&options.manager)
            .ok_or_else(|| HorseError::UnknownManager(options.manager.clone()))?;
        if self.queues.contains_key(name) {
            return Err(HorseError::QueueExists(name.to_string()));
        }
        let manager = factory.create(name, &options)?;
        let queue = HorseQueue::new(name, options, manager, self.context.clone());

        match self.queues.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(HorseError::QueueExists(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(queue.clone());
            }
        }

        if let Err(err) = queue.initialize() {
            error!(target: "horsemq::rider", queue = name, error = %err, "queue initialization failed");
            self.queues.remove(name);
            queue.destroy();
            return Err(err);
        }

        self.context.events.queue_created(name);
        info!(target: "horsemq::rider", queue = name, queue_type = ?queue.queue_type(), "queue created");
        Ok(queue)
    }

    pub fn find_queue(&self, name: &str) -> Option<Arc<HorseQueue>> {
        self.queues.get(name).map(|entry| Arc::clone(&*entry))
    }

    pub fn queues(&self) -> Vec<Arc<HorseQueue>> {
        self.queues.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn remove_queue(&self, name: &str, caller: Option<&ClientId>) -> Result<(), HorseError> {
        if !self.authorizer.can_remove_queue(caller, name) {
            return Err(HorseError::Unauthorized("remove_queue"));
        }
        let (_, queue) = self
            .queues
            .remove(name)
            .ok_or_else(|| HorseError::QueueNotFound(name.to_string()))?;
        queue.destroy();
        self.context.events.queue_removed(name);
        Ok(())
    }

    pub fn update_queue_options(
        &self,
        name: &str,
        options: QueueOptions,
        caller: Option<&ClientId>,
    ) -> Result<(), HorseError> {
        let queue = self
            .find_queue(name)
            .ok_or_else(|| HorseError::QueueNotFound(name.to_string()))?;
        if !self.authorizer.can_update_options(caller, name, &options) {
            return Err(HorseError::Unauthorized("update_queue_options"));
        }
        queue.update_options(options)
    }

    fn get_or_create(&self, name: &str, caller: Option<&ClientId>) -> Result<Arc<HorseQueue>, HorseError> {
        if let Some(queue) = self.find_queue(name) {
            return Ok(queue);
        }
        if !self.auto_queue_creation {
            return Err(HorseError::QueueNotFound(name.to_string()));
        }
        match self.create_queue(name, None, caller) {
            Err(HorseError::QueueExists(_)) => self
                .find_queue(name)
                .ok_or_else(|| HorseError::QueueNotFound(name.to_string())),
            other => other,
        }
    }

    /// Pushes a message into the queue named by its target.
    pub fn push(&self, message: Message, producer: Option<Arc<dyn Client>>) -> PushResult {
        let caller = producer.as_ref().map(|p| p.id().clone());
        match self.get_or_create(&message.target, caller.as_ref()) {
            Ok(queue) => queue.push(message, producer),
            Err(err) => PushResult::Error(err),
        }
    }

    pub fn subscribe(&self, queue: &str, client: Arc<dyn Client>) -> Result<Arc<QueueClient>, HorseError> {
        if !self.authorizer.can_subscribe(client.id(), queue) {
            return Err(HorseError::Unauthorized("subscribe"));
        }
        let id = client.id().clone();
        self.get_or_create(queue, Some(&id))?.subscribe(client)
    }

    pub fn unsubscribe(&self, queue: &str, client: &ClientId) -> bool {
        self.find_queue(queue)
            .map(|q| q.unsubscribe(client))
            .unwrap_or(false)
    }

    /// Drops the client from every queue and releases its in-flight
    /// deliveries. Returns the number of subscriptions removed.
    pub fn client_disconnected(&self, client: &ClientId) -> usize {
        let removed = self
            .queues()
            .into_iter()
            .filter(|q| q.unsubscribe(client))
            .count();
        debug!(target: "horsemq::rider", %client, removed, "client disconnected");
        removed
    }

    /// Routes a consumer acknowledge to the queue named by its target.
    pub fn acknowledge(&self, client: &ClientId, ack: &Message) -> Result<AckResult, HorseError> {
        let queue = self
            .find_queue(&ack.target)
            .ok_or_else(|| HorseError::QueueNotFound(ack.target.clone()))?;
        Ok(queue.acknowledge(client, ack))
    }

    pub async fn pull(
        &self,
        queue: &str,
        client: &ClientId,
        count: usize,
        wait: Duration,
    ) -> Result<PullResult, HorseError> {
        let queue = self
            .find_queue(queue)
            .ok_or_else(|| HorseError::QueueNotFound(queue.to_string()))?;
        if !queue.clients().contains(client) {
            return Err(HorseError::ClientNotSubscribed(client.clone()));
        }
        Ok(queue.pull(client, count, wait).await)
    }

    pub fn set_queue_status(&self, queue: &str, status: QueueStatus) -> Result<bool, HorseError> {
        self.find_queue(queue)
            .ok_or_else(|| HorseError::QueueNotFound(queue.to_string()))?
            .set_status(status)
    }

    /// Removes every queue whose auto-destroy policy holds. Returns how many
    /// were removed.
    pub fn sweep_idle_queues(&self) -> usize {
        let idle: Vec<String> = self
            .queues
            .iter()
            .filter(|entry| entry.value().should_auto_destroy())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for name in idle {
            let Some((_, queue)) = self.queues.remove_if(&name, |_, q| q.should_auto_destroy()) else {
                continue;
            };
            queue.destroy();
            self.context.events.queue_removed(&name);
            info!(target: "horsemq::rider", queue = %name, "queue auto-destroyed");
            removed += 1;
        }
        removed
    }

    /// Stops the sweeper and destroys every queue.
    pub fn shutdown(&self) {
        self.sweeper_stop.send_replace(true);
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, queue)) = self.queues.remove(&name) {
                queue.destroy();
                self.context.events.queue_removed(&name);
            }
        }
        info!(target: "horsemq::rider", "rider shut down");
    }
}

async fn sweep_loop(rider: Weak<Rider>, every: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(rider) = rider.upgrade() else {
                    break;
                };
                rider.sweep_idle_queues();
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_rules() {
        assert!(validate_queue_name("orders").is_ok());
        assert!(validate_queue_name("billing/invoices.v2").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("has space").is_err());
        assert!(validate_queue_name(&"x".repeat(257)).is_err());
    }

    #[tokio::test]
    async fn unknown_manager_is_rejected() {
        let rider = Rider::builder().build();
        let options = QueueOptions::default().with_manager("disk");
        assert!(matches!(
            rider.create_queue("q", Some(options), None),
            Err(HorseError::UnknownManager(_))
        ));
        assert!(rider.find_queue("q").is_none());
        rider.shutdown();
    }

    #[tokio::test]
    async fn duplicate_queue_is_rejected() {
        let rider = Rider::builder().build();
        rider.create_queue("q", None, None).unwrap();
        assert!(matches!(
            rider.create_queue("q", None, None),
            Err(HorseError::QueueExists(_))
        ));
        rider.shutdown();
        assert!(rider.queues().is_empty());
    }
}
