//! Named queues and their delivery engine.
//!
//! A [`HorseQueue`] accepts messages from producers, keeps them in its
//! manager's stores and hands them to subscribers according to its
//! [`QueueType`]. Every lifecycle step asks the manager's
//! [`DeliveryHandler`] for a [`Decision`] and then performs it.
//!
//! Lifecycle of a message:
//! - `Created` until the producer path stores it.
//! - `Stored` while it sits in the priority or regular store.
//! - `InFlight` from the moment a send attempt pulls it out.
//! - `PutBackPending` while a put-back waits for its delay.
//! - `Removed` once deleted, expired, evicted or the queue is destroyed.
//!
//! Every move between these states is a compare-and-swap on the message, so
//! concurrent acknowledge, timeout and dispatch paths can never act twice on
//! the same message.

pub mod dispatcher;
pub mod manager;
pub mod options;
pub mod store;
pub mod sync;
pub mod tracker;

pub use dispatcher::Dispatcher;
pub use manager::{
    MemoryManagerFactory, MemoryQueueManager, PersistentManagerFactory, PersistentQueueManager, QueueManager,
    QueueManagerFactory, QueueStores,
};
pub use options::{AckMode, CommitWhen, LimitExceededStrategy, QueueDestroy, QueueOptions, QueueStatus, QueueType};
pub use store::{LinkedMessageStore, MessageStore};
pub use sync::{LocalSynchronizer, QueueSynchronizer, SyncStatus};
pub use tracker::TimeoutTracker;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::core::decision::{Decision, ProducerAck, PutBackDecision};
use crate::core::delivery::DeliveryHandler;
use crate::core::error::{ConsumeError, ConsumeErrorKind, HorseError};
use crate::core::events::{EventSink, NoopEventSink, QueueEventHandler};
use crate::core::message::{Message, MessageDelivery, MessageKind, MessageState, QueueMessage};
use crate::core::subscriber::{Client, ClientId, ClientSubscriptionRegistry, QueueClient};

/// Collaborators shared by every queue of a broker.
#[derive(Clone)]
pub struct QueueContext {
    pub events: Arc<dyn EventSink>,
    pub status_handler: Option<Arc<dyn QueueEventHandler>>,
    pub errors: Option<UnboundedSender<ConsumeError>>,
}

impl Default for QueueContext {
    fn default() -> Self {
        Self {
            events: Arc::new(NoopEventSink),
            status_handler: None,
            errors: None,
        }
    }
}

impl fmt::Debug for QueueContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueContext")
            .field("events", &self.events)
            .field("status_handler", &self.status_handler.is_some())
            .field("errors", &self.errors.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum PushResult {
    Success,
    StatusNotSupported,
    LimitExceeded,
    /// The delivery handler refused the message.
    Denied,
    Error(HorseError),
}

impl PushResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PushResult::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    /// Number of messages handed to the client.
    Sent(usize),
    Empty,
    /// The client still owes an acknowledge.
    Busy,
    /// The client is not subscribed to the queue.
    Denied,
    StatusNotSupported,
    /// Transport refused the message; it stays queued.
    SendFailed,
    /// The queue does not serve pull requests.
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResult {
    Accepted,
    /// No outstanding delivery of that message to that client.
    NotFound,
    /// The delivery already timed out or was acknowledged.
    AlreadyResolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Delivered,
    NotDelivered,
    /// `BeginSend` stopped the message and its decision was applied.
    Rejected,
    /// A handler failed twice; the message was left untouched.
    Faulted,
}

pub struct HorseQueue {
    name: String,
    created_at: Instant,
    me: Weak<HorseQueue>,
    status: RwLock<QueueStatus>,
    options: RwLock<QueueOptions>,
    manager: Arc<dyn QueueManager>,
    clients: ClientSubscriptionRegistry,
    dispatcher: Dispatcher,
    context: QueueContext,
    cached: Mutex<Option<Arc<QueueMessage>>>,
    arrivals: Notify,
    /// Put-backs waiting for their delay; such messages are in no store.
    pending_put_backs: AtomicUsize,
    destroyed: AtomicBool,
}

impl fmt::Debug for HorseQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HorseQueue")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("type", &self.queue_type())
            .field("messages", &self.count())
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl HorseQueue {
    pub fn new(
        name: impl Into<String>,
        options: QueueOptions,
        manager: Arc<dyn QueueManager>,
        context: QueueContext,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            name,
            created_at: Instant::now(),
            me: me.clone(),
            status: RwLock::new(QueueStatus::NotInitialized),
            options: RwLock::new(options),
            manager,
            clients: ClientSubscriptionRegistry::new(),
            dispatcher: Dispatcher::new(),
            context,
            cached: Mutex::new(None),
            arrivals: Notify::new(),
            pending_put_backs: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Queue backed by a [`MemoryQueueManager`], with no event sinks.
    pub fn in_memory(name: impl Into<String>, options: QueueOptions) -> Arc<Self> {
        let manager = Arc::new(MemoryQueueManager::new(&options));
        Self::new(name, options, manager, QueueContext::default())
    }

    /// Starts the manager and the dispatcher, then moves to `Running`.
    pub fn initialize(self: &Arc<Self>) -> Result<(), HorseError> {
        if self.is_destroyed() {
            return Err(HorseError::Destroyed);
        }
        self.manager.initialize(self)?;
        self.dispatcher.start(self);
        self.set_status(QueueStatus::Running)?;
        info!(target: "horsemq::queue", queue = %self.name, "queue initialized");
        Ok(())
    }

    /// Stops the dispatcher and the tracker, then drains the stores.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.stop();
        let drained = self.manager.destroy();
        for delivery in self.manager.tracker().drain() {
            delivery.try_resolve();
        }
        for client in self.clients.drain() {
            client.take_processing();
        }
        let handler = self.handler();
        for message in &drained {
            message.mark_removed();
            handler.message_dequeued(self, message);
        }
        self.cached.lock().take();
        self.arrivals.notify_waiters();
        info!(
            target: "horsemq::queue",
            queue = %self.name,
            dropped = drained.len(),
            "queue destroyed"
        );
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn status(&self) -> QueueStatus {
        *self.status.read()
    }

    pub fn options(&self) -> QueueOptions {
        self.options.read().clone()
    }

    pub fn queue_type(&self) -> QueueType {
        self.options.read().queue_type
    }

    /// Acknowledge mode in effect. Broadcast and cache queues never wait.
    pub fn ack_mode(&self) -> AckMode {
        self.options.read().effective_ack()
    }

    pub fn manager(&self) -> &Arc<dyn QueueManager> {
        &self.manager
    }

    pub fn clients(&self) -> &ClientSubscriptionRegistry {
        &self.clients
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Stored messages, both stores.
    pub fn count(&self) -> usize {
        self.manager.count()
    }

    /// Deliveries still waiting for an acknowledge.
    pub fn in_flight(&self) -> usize {
        self.manager.tracker().len()
    }

    pub fn find_message(&self, id: &str) -> Option<Arc<QueueMessage>> {
        self.manager.find_message(id)
    }

    /// Latest message of a cache queue.
    pub fn cached_message(&self) -> Option<Arc<QueueMessage>> {
        self.cached.lock().clone()
    }

    fn handler(&self) -> Arc<dyn DeliveryHandler> {
        self.manager.delivery_handler().clone()
    }

    /// Moves the queue to `next`.
    ///
    /// Returns `Ok(false)` when the status handler vetoed the change, and an
    /// error when the state machine has no such edge.
    pub fn set_status(&self, next: QueueStatus) -> Result<bool, HorseError> {
        let current = self.status();
        if !current.can_transition_to(next) {
            return Err(HorseError::StatusNotSupported(current));
        }
        if let Some(handler) = &self.context.status_handler {
            if !handler.on_status_changing(self, current, next) {
                debug!(
                    target: "horsemq::queue",
                    queue = %self.name,
                    from = ?current,
                    to = ?next,
                    "status change vetoed"
                );
                return Ok(false);
            }
        }
        {
            let mut status = self.status.write();
            if *status != current {
                return Ok(false);
            }
            *status = next;
        }
        self.context.events.status_changed(&self.name, current, next);
        self.dispatcher.wake();
        self.arrivals.notify_waiters();
        Ok(true)
    }

    /// Replaces the options. The queue type and the manager cannot change.
    pub fn update_options(&self, options: QueueOptions) -> Result<(), HorseError> {
        {
            let mut current = self.options.write();
            if current.queue_type != options.queue_type {
                return Err(HorseError::Config(format!(
                    "queue type of '{}' cannot change from {:?} to {:?}",
                    self.name, current.queue_type, options.queue_type
                )));
            }
            if current.manager != options.manager {
                return Err(HorseError::Config(format!(
                    "manager of '{}' cannot change",
                    self.name
                )));
            }
            *current = options;
        }
        self.dispatcher.wake();
        Ok(())
    }

    /// Accepts a message from a producer.
    pub fn push(&self, message: Message, producer: Option<Arc<dyn Client>>) -> PushResult {
        if self.is_destroyed() {
            return PushResult::Error(HorseError::Destroyed);
        }
        if !self.status().can_push() {
            return PushResult::StatusNotSupported;
        }
        let options = self.options();
        let message = Arc::new(QueueMessage::new(message, producer));

        if options.message_size_limit > 0 && message.message().payload.len() > options.message_size_limit {
            self.send_producer_ack(&message, ProducerAck::Failed);
            return PushResult::LimitExceeded;
        }

        if options.message_limit > 0 && self.manager.count() >= options.message_limit {
            match options.limit_exceeded_strategy {
                LimitExceededStrategy::RejectNewMessage => {
                    debug!(
                        target: "horsemq::queue",
                        queue = %self.name,
                        limit = options.message_limit,
                        "message limit reached, rejecting"
                    );
                    self.send_producer_ack(&message, ProducerAck::Failed);
                    return PushResult::LimitExceeded;
                }
                LimitExceededStrategy::DeleteOldestMessage => {
                    while self.manager.count() >= options.message_limit {
                        let Some(oldest) = self.manager.evict_oldest() else {
                            break;
                        };
                        oldest.mark_removed();
                        self.handler().message_dequeued(self, &oldest);
                        self.send_producer_ack(&oldest, ProducerAck::Failed);
                    }
                }
            }
        }

        let decision = match self.guard(&message, |h| {
            h.received_from_producer(self, &message, message.producer())
        }) {
            Some(decision) => decision,
            None => {
                self.send_producer_ack(&message, ProducerAck::Failed);
                return PushResult::Error(HorseError::handler("received_from_producer failed"));
            }
        };

        if !decision.allow {
            let ack = match decision.transmit {
                ProducerAck::None => ProducerAck::Failed,
                other => other,
            };
            self.send_producer_ack(&message, ack);
            return PushResult::Denied;
        }

        let retains = options.queue_type.retains_messages();
        if decision.save && retains {
            self.save(&message);
        }
        self.send_producer_ack(&message, decision.transmit);
        self.context.events.message_produced(&self.name, message.id());

        if options.queue_type == QueueType::Cache {
            *self.cached.lock() = Some(message.clone());
        }
        if decision.delete {
            message.mark_removed();
            return PushResult::Success;
        }

        self.manager.add_message(message);
        self.arrivals.notify_waiters();
        self.dispatcher.wake();
        PushResult::Success
    }

    /// Subscribes a client. Subscribing twice is a no-op.
    pub fn subscribe(&self, client: Arc<dyn Client>) -> Result<Arc<QueueClient>, HorseError> {
        if self.is_destroyed() {
            return Err(HorseError::Destroyed);
        }
        let known = self.clients.contains(client.id());
        let limit = self.options.read().client_limit;
        let record = self.clients.add(client, limit)?;
        if !known {
            self.context.events.client_subscribed(&self.name, record.id());
            debug!(target: "horsemq::queue", queue = %self.name, client = %record.id(), "client subscribed");
        }
        self.dispatcher.wake();
        Ok(record)
    }

    /// Removes a client and releases every delivery it still owes an
    /// acknowledge for, as if each had timed out.
    pub fn unsubscribe(&self, client: &ClientId) -> bool {
        let Some(record) = self.clients.remove(client) else {
            return false;
        };
        for delivery in self.manager.tracker().for_receiver(client) {
            self.release_delivery(&delivery, ConsumeErrorKind::SendFailed);
        }
        record.take_processing();
        self.context.events.client_unsubscribed(&self.name, client);
        self.dispatcher.wake();
        true
    }

    /// Serves a pull request.
    ///
    /// Sends up to `count` messages (at least one). When the queue is empty,
    /// waits up to `wait` for the first message to arrive.
    pub async fn pull(&self, client: &ClientId, count: usize, wait: Duration) -> PullResult {
        let options = self.options();
        let Some(receiver) = self.clients.get(client) else {
            return PullResult::Denied;
        };
        if !self.status().can_consume() {
            return PullResult::StatusNotSupported;
        }

        match options.queue_type {
            QueueType::Cache => return self.pull_cached(&receiver),
            QueueType::Pull => {}
            _ => return PullResult::Unsupported,
        }

        let serial = options.effective_ack() == AckMode::WaitForAcknowledge;
        if serial && receiver.is_processing() {
            return PullResult::Busy;
        }

        let deadline = Instant::now() + wait;
        let count = count.max(1);
        let candidates = [receiver.clone()];
        let mut sent = 0;

        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            while sent < count && !self.is_destroyed() && self.status().can_consume() {
                if serial && receiver.is_processing() {
                    break;
                }
                let Some(message) = self.manager.pull_next() else {
                    break;
                };
                match self.send_message(&message, &candidates, true, &options) {
                    SendOutcome::Delivered => sent += 1,
                    SendOutcome::Rejected => {}
                    SendOutcome::NotDelivered | SendOutcome::Faulted => {
                        self.manager.restore(&message);
                        return if sent > 0 {
                            PullResult::Sent(sent)
                        } else {
                            PullResult::SendFailed
                        };
                    }
                }
            }

            if sent > 0 || self.is_destroyed() || Instant::now() >= deadline {
                break;
            }
            if !self.status().can_consume() {
                return PullResult::StatusNotSupported;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => {}
            }
        }

        if sent > 0 {
            PullResult::Sent(sent)
        } else {
            PullResult::Empty
        }
    }

    fn pull_cached(&self, receiver: &QueueClient) -> PullResult {
        let Some(message) = self.cached_message() else {
            return PullResult::Empty;
        };
        match receiver.client().send(message.message()) {
            Ok(()) => PullResult::Sent(1),
            Err(error) => {
                debug!(target: "horsemq::queue", queue = %self.name, client = %receiver.id(), %error, "cached send failed");
                self.report_error(&message, Some(receiver.id()), ConsumeErrorKind::SendFailed);
                PullResult::SendFailed
            }
        }
    }

    /// Handles an acknowledge (positive or negative) from a consumer. Only
    /// messages of kind [`MessageKind::Ack`] are considered.
    pub fn acknowledge(&self, client: &ClientId, ack: &Message) -> AckResult {
        if ack.kind != MessageKind::Ack {
            return AckResult::NotFound;
        }
        let tracker = self.manager.tracker();
        let Some(delivery) = tracker.find(&ack.id, client) else {
            return AckResult::NotFound;
        };
        if !delivery.try_resolve() {
            return AckResult::AlreadyResolved;
        }
        tracker.untrack(delivery.id());

        let success = ack.is_positive_ack();
        delivery.mark_acknowledged(success);
        if let Some(receiver) = self.clients.get(client) {
            receiver.end_processing(delivery.id());
        }

        let options = self.options();
        let message = delivery.message().clone();
        match self.guard(&message, |h| h.acknowledge_received(self, ack, &delivery, success)) {
            Some(decision) => self.settle(&message, decision, &options),
            None => {
                self.manager.restore(&message);
            }
        }
        if !success {
            self.report_error(&message, Some(client), ConsumeErrorKind::NegativeAcknowledge);
        }
        self.dispatcher.wake();
        AckResult::Accepted
    }

    /// Moves a stored message between the priority and the regular store.
    pub fn change_message_priority(&self, id: &str, high_priority: bool) -> bool {
        let moved = self.manager.change_message_priority(id, high_priority);
        if moved {
            self.dispatcher.wake();
        }
        moved
    }

    /// Removes a stored message by id.
    pub fn remove_message(&self, id: &str) -> bool {
        let Some(message) = self.manager.remove_message_by_id(id) else {
            return false;
        };
        if message.mark_removed() != MessageState::Removed {
            self.handler().message_dequeued(self, &message);
        }
        true
    }

    /// Messages waiting out a put-back delay.
    pub fn pending_put_backs(&self) -> usize {
        self.pending_put_backs.load(Ordering::Acquire)
    }

    /// Whether the queue's auto-destroy policy says it should go away now.
    pub fn should_auto_destroy(&self) -> bool {
        if self.in_flight() > 0 || self.pending_put_backs() > 0 {
            return false;
        }
        match self.options.read().auto_destroy {
            QueueDestroy::Disabled => false,
            QueueDestroy::NoMessages => self.count() == 0,
            QueueDestroy::NoConsumers => self.clients.is_empty(),
            QueueDestroy::Empty => self.count() == 0 && self.clients.is_empty(),
        }
    }

    /// Expires stored messages and acknowledge deadlines, and releases
    /// deliveries whose receiver disconnected. Called by the tracker on every
    /// tick.
    pub(crate) fn sweep_timeouts(&self, now: Instant) {
        if self.is_destroyed() {
            return;
        }
        let options = self.options();

        if !options.message_timeout.is_zero() {
            if let Some(cutoff) = now.checked_sub(options.message_timeout) {
                for message in self.manager.stores().created_before(cutoff) {
                    self.expire_message(&message, &options);
                }
            }
        }

        for delivery in self.manager.tracker().expired(now) {
            self.acknowledge_timed_out(&delivery);
        }
        for delivery in self.manager.tracker().abandoned() {
            self.release_delivery(&delivery, ConsumeErrorKind::SendFailed);
        }
    }

    fn expire_message(&self, message: &Arc<QueueMessage>, options: &QueueOptions) {
        if message.delivery_count() > 0 {
            return;
        }
        if !message.transition(MessageState::Stored, MessageState::InFlight) {
            return;
        }
        self.manager.stores().remove(message);
        debug!(target: "horsemq::queue", queue = %self.name, message_id = %message.id(), "message timed out");

        match self.guard(message, |h| h.message_timed_out(self, message)) {
            Some(decision) => {
                self.apply_decision(message, decision, options);
                if message.state() == MessageState::InFlight {
                    self.manager.restore(message);
                }
            }
            None => {
                self.manager.restore(message);
            }
        }
    }

    pub(crate) fn acknowledge_timed_out(&self, delivery: &Arc<MessageDelivery>) {
        self.release_delivery(delivery, ConsumeErrorKind::AcknowledgeTimeout);
    }

    fn release_delivery(&self, delivery: &Arc<MessageDelivery>, kind: ConsumeErrorKind) {
        if !delivery.try_resolve() {
            return;
        }
        self.manager.tracker().untrack(delivery.id());
        if let Some(receiver) = self.clients.get(delivery.receiver_id()) {
            receiver.end_processing(delivery.id());
        }
        let message = delivery.message().clone();
        debug!(
            target: "horsemq::queue",
            queue = %self.name,
            message_id = %message.id(),
            client = %delivery.receiver_id(),
            ?kind,
            "delivery released without acknowledge"
        );
        self.report_error(&message, Some(delivery.receiver_id()), kind);

        let options = self.options();
        match self.guard(&message, |h| h.acknowledge_timed_out(self, delivery)) {
            Some(decision) => self.settle(&message, decision, &options),
            None => {
                self.manager.restore(&message);
            }
        }
        self.dispatcher.wake();
    }

    /// Sends the next message according to the queue type. Returns false
    /// when there is nothing more to do right now.
    pub(crate) fn dispatch_next(&self) -> bool {
        if self.is_destroyed() || !self.status().can_consume() {
            return false;
        }
        if self.manager.synchronizer().status() == SyncStatus::Syncing {
            return false;
        }
        let options = self.options();
        let ack = options.effective_ack();

        let (candidates, single) = match options.queue_type {
            QueueType::Pull => return false,
            QueueType::RoundRobin => (self.idle_clients(self.clients.round_robin_order(), ack), true),
            QueueType::Push => (self.idle_clients(self.clients.snapshot(), ack), false),
            QueueType::Broadcast | QueueType::Cache => {
                if self.clients.is_empty() {
                    // Nobody to fan out to; broadcast messages are not kept.
                    let Some(message) = self.manager.pull_next() else {
                        return false;
                    };
                    self.finalize(&message);
                    return true;
                }
                (self.idle_clients(self.clients.snapshot(), ack), false)
            }
        };
        if candidates.is_empty() {
            return false;
        }
        let Some(message) = self.manager.pull_next() else {
            return false;
        };

        match self.send_message(&message, &candidates, single, &options) {
            SendOutcome::Delivered | SendOutcome::Rejected => true,
            SendOutcome::NotDelivered | SendOutcome::Faulted => {
                if options.queue_type.retains_messages() {
                    self.manager.restore(&message);
                } else {
                    self.finalize(&message);
                }
                false
            }
        }
    }

    fn idle_clients(&self, clients: Vec<Arc<QueueClient>>, ack: AckMode) -> Vec<Arc<QueueClient>> {
        clients
            .into_iter()
            .filter(|c| c.client().is_connected())
            .filter(|c| ack != AckMode::WaitForAcknowledge || !c.is_processing())
            .collect()
    }

    /// Runs one in-flight message through the receiver loop.
    ///
    /// `single` stops after the first successful receiver. The caller owns
    /// what happens to the message on `NotDelivered` and `Faulted`.
    fn send_message(
        &self,
        message: &Arc<QueueMessage>,
        candidates: &[Arc<QueueClient>],
        single: bool,
        options: &QueueOptions,
    ) -> SendOutcome {
        let handler = self.handler();
        let ack = options.effective_ack();
        let tracker = self.manager.tracker();
        let mut began = false;
        let mut delivered = 0usize;

        for receiver in candidates {
            if !receiver.client().is_connected() {
                continue;
            }
            let can_receive = match handler.can_consumer_receive(self, message, receiver) {
                Ok(can) => can,
                Err(error) => self.fault(message, &error).is_some_and(|d| d.allow),
            };
            if !can_receive {
                continue;
            }

            if !began {
                began = true;
                match self.guard(message, |h| h.begin_send(self, message)) {
                    None => return SendOutcome::Faulted,
                    Some(decision) if !decision.allow => {
                        if decision.delete || decision.put_back != PutBackDecision::No {
                            self.apply_decision(message, decision, options);
                            return SendOutcome::Rejected;
                        }
                        return SendOutcome::NotDelivered;
                    }
                    Some(decision) => self.apply_side_effects(message, decision, options),
                }
            }

            let delivery = Arc::new(MessageDelivery::new(message.clone(), receiver.client().clone()));
            {
                // Claimed before the send; a consumer may acknowledge from
                // inside `send` and must find the slot unlocked.
                let mut slot = receiver.processing_slot();
                if ack == AckMode::WaitForAcknowledge && slot.is_some() {
                    continue;
                }
                if ack.requires_ack() {
                    if !options.acknowledge_timeout.is_zero() {
                        delivery.set_acknowledge_deadline(Instant::now() + options.acknowledge_timeout);
                    }
                    *slot = Some(delivery.clone());
                    tracker.track(delivery.clone());
                }
            }

            match receiver.client().send(message.message()) {
                Ok(()) => {
                    delivery.mark_sent();
                    delivered += 1;
                    if let Some(decision) =
                        self.guard(message, |h| h.consumer_received(self, &delivery, receiver))
                    {
                        self.apply_side_effects(message, decision, options);
                    }
                    if single {
                        self.clients.advance_past(receiver.id());
                        break;
                    }
                }
                Err(error) => {
                    if ack.requires_ack() {
                        tracker.untrack(delivery.id());
                        receiver.end_processing(delivery.id());
                    }
                    debug!(
                        target: "horsemq::queue",
                        queue = %self.name,
                        client = %receiver.id(),
                        %error,
                        "send failed, trying next receiver"
                    );
                    self.report_error(message, Some(receiver.id()), ConsumeErrorKind::SendFailed);
                    if let Some(decision) =
                        self.guard(message, |h| h.consumer_receive_failed(self, &delivery, receiver))
                    {
                        self.apply_side_effects(message, decision, options);
                    }
                }
            }
        }

        if delivered == 0 {
            return SendOutcome::NotDelivered;
        }

        match self.guard(message, |h| h.end_send(self, message)) {
            Some(decision) => self.apply_decision(message, decision, options),
            None if !ack.requires_ack() => {
                self.manager.restore(message);
                return SendOutcome::Delivered;
            }
            None => {}
        }
        if !ack.requires_ack() && message.state() == MessageState::InFlight {
            self.finalize(message);
        }
        SendOutcome::Delivered
    }

    /// Applies a decision taken on an acknowledge or a timeout. A message
    /// nobody kept and nobody else still owes an acknowledge for is done.
    fn settle(&self, message: &Arc<QueueMessage>, decision: Decision, options: &QueueOptions) {
        self.apply_decision(message, decision, options);
        if message.state() == MessageState::InFlight && !self.manager.tracker().has_message(message.id()) {
            self.finalize(message);
        }
    }

    fn apply_side_effects(&self, message: &Arc<QueueMessage>, decision: Decision, options: &QueueOptions) {
        let decision = if options.queue_type.retains_messages() {
            decision
        } else {
            decision.without_retention()
        };
        if decision.save {
            self.save(message);
        }
        self.send_producer_ack(message, decision.transmit);
    }

    fn apply_decision(&self, message: &Arc<QueueMessage>, decision: Decision, options: &QueueOptions) {
        let decision = if options.queue_type.retains_messages() {
            decision
        } else {
            decision.without_retention()
        };
        self.apply_side_effects(message, decision, options);
        if decision.delete {
            self.finalize(message);
        } else if decision.put_back != PutBackDecision::No {
            self.schedule_put_back(message, decision.put_back, options.put_back_delay);
        }
    }

    fn schedule_put_back(&self, message: &Arc<QueueMessage>, placement: PutBackDecision, delay: Duration) {
        if !message.transition(MessageState::InFlight, MessageState::PutBackPending) {
            return;
        }
        let front = placement == PutBackDecision::Priority;
        let runtime = tokio::runtime::Handle::try_current();
        match runtime {
            Ok(runtime) if !delay.is_zero() => {
                let queue = self.me.clone();
                let message = message.clone();
                self.pending_put_backs.fetch_add(1, Ordering::AcqRel);
                runtime.spawn(async move {
                    sleep(delay).await;
                    if let Some(queue) = queue.upgrade() {
                        queue.reinsert(&message, front);
                        queue.pending_put_backs.fetch_sub(1, Ordering::AcqRel);
                    }
                });
            }
            _ => self.reinsert(message, front),
        }
    }

    fn reinsert(&self, message: &Arc<QueueMessage>, front: bool) {
        if self.is_destroyed() {
            message.mark_removed();
            return;
        }
        if self.manager.put_back(message, front) {
            debug!(
                target: "horsemq::queue",
                queue = %self.name,
                message_id = %message.id(),
                front,
                "message put back"
            );
            self.arrivals.notify_waiters();
            self.dispatcher.wake();
        }
    }

    /// Removes a message for good. Returns false if it was already gone.
    fn finalize(&self, message: &Arc<QueueMessage>) -> bool {
        if message.mark_removed() == MessageState::Removed {
            return false;
        }
        self.manager.delete_message(message);
        self.handler().message_dequeued(self, message);
        true
    }

    fn save(&self, message: &QueueMessage) {
        if message.is_saved() {
            return;
        }
        match self.manager.save_message(self, message) {
            Ok(true) => message.mark_saved(),
            Ok(false) => {}
            Err(error) => {
                warn!(
                    target: "horsemq::queue",
                    queue = %self.name,
                    message_id = %message.id(),
                    %error,
                    "failed to save message"
                );
                self.report_error(message, None, ConsumeErrorKind::HandlerFault(error.to_string()));
            }
        }
    }

    fn send_producer_ack(&self, message: &QueueMessage, ack: ProducerAck) {
        if ack == ProducerAck::None || !message.claim_producer_ack() {
            return;
        }
        let Some(producer) = message.producer() else {
            return;
        };
        let reply = message.message().acknowledge(ack == ProducerAck::Commit);
        if let Err(error) = producer.send(&reply) {
            debug!(
                target: "horsemq::queue",
                queue = %self.name,
                producer = %producer.id(),
                %error,
                "could not deliver producer acknowledge"
            );
        }
    }

    /// Runs a handler callback, routing a failure to `exception_thrown`.
    /// `None` means `exception_thrown` failed too.
    fn guard<F>(&self, message: &QueueMessage, call: F) -> Option<Decision>
    where
        F: FnOnce(&dyn DeliveryHandler) -> Result<Decision, HorseError>,
    {
        let handler = self.handler();
        match call(handler.as_ref()) {
            Ok(decision) => Some(decision),
            Err(error) => self.fault(message, &error),
        }
    }

    fn fault(&self, message: &QueueMessage, error: &HorseError) -> Option<Decision> {
        warn!(
            target: "horsemq::queue",
            queue = %self.name,
            message_id = %message.id(),
            %error,
            "delivery handler failed"
        );
        self.report_error(message, None, ConsumeErrorKind::HandlerFault(error.to_string()));
        match self.handler().exception_thrown(self, Some(message), error) {
            Ok(decision) => Some(decision),
            Err(second) => {
                error!(
                    target: "horsemq::queue",
                    queue = %self.name,
                    error = %second,
                    "exception handler failed, leaving message in place"
                );
                None
            }
        }
    }

    fn report_error(&self, message: &QueueMessage, client: Option<&ClientId>, kind: ConsumeErrorKind) {
        let Some(errors) = &self.context.errors else {
            return;
        };
        let _ = errors.send(ConsumeError {
            queue: self.name.clone(),
            message_id: message.id().to_string(),
            client: client.cloned(),
            kind,
        });
    }
}

impl Drop for HorseQueue {
    fn drop(&mut self) {
        self.dispatcher.stop();
        self.manager.tracker().stop();
    }
}
