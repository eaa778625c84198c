mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{init_logging, recv, stays_silent, text};
use horsemq::core::auth::AdminListAuthorizer;
use horsemq::core::events::{EventSink, QueueEventHandler};
use horsemq::core::queue::{MemoryQueueManager, QueueManager};
use horsemq::{
    AckMode, AckResult, ChannelClient, ClientId, ConsumeErrorKind, Decision, DeliveryHandler, HorseError,
    HorseQueue, Message, MessageDelivery, PullResult, PushResult, PutBackDecision, QueueDestroy, QueueMessage,
    QueueOptions, QueueStatus, QueueType, Rider,
};
use tokio::sync::mpsc::unbounded_channel;

#[derive(Debug, Default, Clone)]
struct RecordingSink {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl EventSink for RecordingSink {
    fn queue_created(&self, queue: &str) {
        self.record(format!("created {queue}"));
    }

    fn queue_removed(&self, queue: &str) {
        self.record(format!("removed {queue}"));
    }

    fn client_subscribed(&self, queue: &str, client: &ClientId) {
        self.record(format!("subscribed {queue} {client}"));
    }

    fn client_unsubscribed(&self, queue: &str, client: &ClientId) {
        self.record(format!("unsubscribed {queue} {client}"));
    }

    fn status_changed(&self, queue: &str, from: QueueStatus, to: QueueStatus) {
        self.record(format!("status {queue} {from:?}->{to:?}"));
    }

    fn message_produced(&self, queue: &str, _message_id: &str) {
        self.record(format!("produced {queue}"));
    }
}

/// Refuses to pause any queue.
#[derive(Debug)]
struct NoPause;

impl QueueEventHandler for NoPause {
    fn on_status_changing(&self, _queue: &HorseQueue, _from: QueueStatus, to: QueueStatus) -> bool {
        to != QueueStatus::Paused
    }
}

/// Accepts messages but fails on every send, and fails again when asked to
/// recover.
#[derive(Debug)]
struct FaultyHandler;

impl DeliveryHandler for FaultyHandler {
    fn received_from_producer(
        &self,
        _queue: &HorseQueue,
        _message: &QueueMessage,
        _sender: Option<&Arc<dyn horsemq::Client>>,
    ) -> Result<Decision, HorseError> {
        Ok(Decision::allow())
    }

    fn begin_send(&self, _queue: &HorseQueue, _message: &QueueMessage) -> Result<Decision, HorseError> {
        Err(HorseError::handler("begin_send exploded"))
    }

    fn end_send(&self, _queue: &HorseQueue, _message: &QueueMessage) -> Result<Decision, HorseError> {
        Ok(Decision::delete())
    }

    fn acknowledge_received(
        &self,
        _queue: &HorseQueue,
        _ack: &Message,
        _delivery: &MessageDelivery,
        _success: bool,
    ) -> Result<Decision, HorseError> {
        Ok(Decision::delete())
    }

    fn acknowledge_timed_out(&self, _queue: &HorseQueue, _delivery: &MessageDelivery) -> Result<Decision, HorseError> {
        Ok(Decision::delete())
    }

    fn message_timed_out(&self, _queue: &HorseQueue, _message: &QueueMessage) -> Result<Decision, HorseError> {
        Ok(Decision::delete())
    }

    fn exception_thrown(
        &self,
        _queue: &HorseQueue,
        _message: Option<&QueueMessage>,
        _error: &HorseError,
    ) -> Result<Decision, HorseError> {
        Err(HorseError::handler("recovery exploded too"))
    }

    fn save_message(&self, _queue: &HorseQueue, _message: &QueueMessage) -> Result<bool, HorseError> {
        Ok(false)
    }
}

#[tokio::test]
async fn push_creates_queue_on_demand() {
    init_logging();
    let rider = Rider::builder().build();
    let (consumer, mut rx) = ChannelClient::new("c1");

    rider.subscribe("invoices", consumer).unwrap();
    assert!(rider.find_queue("invoices").is_some());
    assert!(rider.push(Message::new("invoices", "inv-1"), None).is_success());
    assert_eq!(text(&recv(&mut rx).await), "inv-1");

    assert!(rider.push(Message::new("shipments", "s-1"), None).is_success());
    assert_eq!(rider.queues().len(), 2);
    assert_eq!(rider.find_queue("shipments").unwrap().count(), 1);
    rider.shutdown();
}

#[tokio::test]
async fn disabled_auto_creation_reports_missing_queue() {
    init_logging();
    let rider = Rider::builder().auto_queue_creation(false).build();
    let (consumer, _rx) = ChannelClient::new("c1");

    assert!(matches!(
        rider.push(Message::new("nowhere", "x"), None),
        PushResult::Error(HorseError::QueueNotFound(_))
    ));
    assert!(matches!(
        rider.subscribe("nowhere", consumer),
        Err(HorseError::QueueNotFound(_))
    ));
    assert!(matches!(
        rider.acknowledge(&ClientId::from("c1"), &Message::new("nowhere", "x").acknowledge(true)),
        Err(HorseError::QueueNotFound(_))
    ));
    assert!(rider.queues().is_empty());

    rider.create_queue("somewhere", None, None).unwrap();
    assert!(rider.push(Message::new("somewhere", "x"), None).is_success());
    rider.shutdown();
}

#[tokio::test]
async fn only_admins_manage_queues() {
    init_logging();
    let rider = Rider::builder()
        .authorizer(AdminListAuthorizer::new(["ops"]))
        .build();
    let ops = ClientId::from("ops");
    let app = ClientId::from("app");

    assert!(matches!(
        rider.create_queue("billing", None, Some(&app)),
        Err(HorseError::Unauthorized(_))
    ));
    rider.create_queue("billing", None, Some(&ops)).unwrap();

    // Producers that are not admins cannot auto-create either.
    let (producer, _acks) = ChannelClient::new("app");
    assert!(matches!(
        rider.push(Message::new("reports", "x"), Some(producer.clone())),
        PushResult::Error(HorseError::Unauthorized(_))
    ));
    assert!(rider.push(Message::new("billing", "x"), Some(producer)).is_success());

    let stricter = QueueOptions::default().with_acknowledge(AckMode::WaitForAcknowledge);
    assert!(rider
        .update_queue_options("billing", stricter.clone(), Some(&app))
        .is_err());
    rider.update_queue_options("billing", stricter, Some(&ops)).unwrap();
    assert_eq!(
        rider.find_queue("billing").unwrap().ack_mode(),
        AckMode::WaitForAcknowledge
    );

    assert!(rider.remove_queue("billing", Some(&app)).is_err());
    rider.remove_queue("billing", None).unwrap();
    assert!(rider.find_queue("billing").is_none());
    assert!(matches!(
        rider.remove_queue("billing", None),
        Err(HorseError::QueueNotFound(_))
    ));
    rider.shutdown();
}

#[tokio::test]
async fn events_follow_queue_lifecycle() {
    init_logging();
    let sink = RecordingSink::default();
    let rider = Rider::builder().event_sink(sink.clone()).build();

    rider.create_queue("audit", None, None).unwrap();
    let (consumer, _rx) = ChannelClient::new("c1");
    rider.subscribe("audit", consumer.clone()).unwrap();
    rider.subscribe("audit", consumer).unwrap();
    rider.push(Message::new("audit", "x"), None);
    rider.set_queue_status("audit", QueueStatus::OnlyPush).unwrap();
    assert!(rider.unsubscribe("audit", &ClientId::from("c1")));
    rider.remove_queue("audit", None).unwrap();

    assert_eq!(
        sink.take(),
        vec![
            "status audit NotInitialized->Running",
            "created audit",
            "subscribed audit c1",
            "produced audit",
            "status audit Running->OnlyPush",
            "unsubscribed audit c1",
            "removed audit",
        ]
    );
    rider.shutdown();
}

#[tokio::test]
async fn status_handler_can_veto_a_change() {
    init_logging();
    let rider = Rider::builder().status_handler(NoPause).build();
    let queue = rider.create_queue("steady", None, None).unwrap();
    assert_eq!(queue.status(), QueueStatus::Running);

    assert!(!rider.set_queue_status("steady", QueueStatus::Paused).unwrap());
    assert_eq!(queue.status(), QueueStatus::Running);

    assert!(rider.set_queue_status("steady", QueueStatus::OnlyConsume).unwrap());
    assert!(matches!(
        queue.push(Message::new("steady", "x"), None),
        PushResult::StatusNotSupported
    ));
    assert!(rider.set_queue_status("steady", QueueStatus::NotInitialized).is_err());
    rider.shutdown();
}

#[tokio::test(start_paused = true)]
async fn idle_queues_are_destroyed_by_the_sweeper() {
    init_logging();
    let sink = RecordingSink::default();
    let rider = Rider::builder()
        .event_sink(sink.clone())
        .queue_defaults(QueueOptions::default().with_auto_destroy(QueueDestroy::Empty))
        .auto_destroy_interval(Duration::from_millis(100))
        .build();

    rider.create_queue("temp", None, None).unwrap();
    let busy = rider.create_queue("busy", None, None).unwrap();
    busy.push(Message::new("busy", "pending"), None);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(rider.find_queue("temp").is_none());
    assert!(rider.find_queue("busy").is_some());
    assert!(sink.take().contains(&"removed temp".to_string()));
    rider.shutdown();
}

#[tokio::test]
async fn sweep_respects_each_policy() {
    init_logging();
    let rider = Rider::builder().auto_destroy_interval(Duration::ZERO).build();
    let no_consumers = QueueOptions::default().with_auto_destroy(QueueDestroy::NoConsumers);
    let no_messages = QueueOptions::default().with_auto_destroy(QueueDestroy::NoMessages);

    rider.create_queue("watched", Some(no_consumers), None).unwrap();
    rider.create_queue("drained", Some(no_messages), None).unwrap();
    rider.create_queue("kept", None, None).unwrap();
    let pending = Message::new("drained", "x");
    let pending_id = pending.id.clone();
    rider.push(pending, None);

    let (consumer, _rx) = ChannelClient::new("c1");
    rider.subscribe("watched", consumer).unwrap();
    assert_eq!(rider.sweep_idle_queues(), 0);

    rider.unsubscribe("watched", &ClientId::from("c1"));
    assert_eq!(rider.sweep_idle_queues(), 1);
    assert!(rider.find_queue("watched").is_none());

    let drained = rider.find_queue("drained").unwrap();
    assert!(drained.remove_message(&pending_id));
    assert_eq!(rider.sweep_idle_queues(), 1);
    assert_eq!(rider.queues().len(), 1);
    rider.shutdown();
}

#[tokio::test]
async fn disconnect_releases_every_subscription() {
    init_logging();
    let options = QueueOptions::default().with_acknowledge(AckMode::WaitForAcknowledge);
    let rider = Rider::builder().queue_defaults(options).build();
    let (leaving, mut rx) = ChannelClient::new("leaving");

    rider.subscribe("a", leaving.clone()).unwrap();
    rider.subscribe("b", leaving).unwrap();
    rider.push(Message::new("a", "held"), None);
    recv(&mut rx).await;
    assert_eq!(rider.find_queue("a").unwrap().in_flight(), 1);

    assert_eq!(rider.client_disconnected(&ClientId::from("leaving")), 2);
    let a = rider.find_queue("a").unwrap();
    assert_eq!(a.in_flight(), 0);
    assert!(a.clients().is_empty());
    assert_eq!(rider.client_disconnected(&ClientId::from("leaving")), 0);
    rider.shutdown();
}

#[tokio::test]
async fn acknowledge_is_routed_by_target() {
    init_logging();
    let options = QueueOptions::default().with_acknowledge(AckMode::WaitForAcknowledge);
    let rider = Rider::builder().queue_defaults(options).build();
    let (consumer, mut rx) = ChannelClient::new("c1");
    rider.subscribe("tasks", consumer).unwrap();

    rider.push(Message::new("tasks", "t1"), None);
    rider.push(Message::new("tasks", "t2"), None);
    let t1 = recv(&mut rx).await;
    assert!(stays_silent(&mut rx, Duration::from_millis(50)).await);

    let client = ClientId::from("c1");
    assert_eq!(rider.acknowledge(&client, &t1.acknowledge(true)).unwrap(), AckResult::Accepted);
    assert_eq!(text(&recv(&mut rx).await), "t2");
    rider.shutdown();
}

#[tokio::test]
async fn double_handler_fault_leaves_message_stored() {
    init_logging();
    let (errors_tx, mut errors) = unbounded_channel();
    let rider = Rider::builder()
        .register_manager(
            "faulty",
            |_name: &str, _options: &QueueOptions| -> Result<Arc<dyn QueueManager>, HorseError> {
                Ok(Arc::new(MemoryQueueManager::with_handler(Arc::new(FaultyHandler))))
            },
        )
        .error_sink(errors_tx)
        .build();

    let options = QueueOptions::default().with_manager("faulty");
    let queue = rider.create_queue("fragile", Some(options), None).unwrap();
    let (consumer, mut rx) = ChannelClient::new("c1");
    queue.subscribe(consumer).unwrap();

    let message = Message::new("fragile", "x");
    let id = message.id.clone();
    assert!(queue.push(message, None).is_success());

    let error = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(error.message_id, id);
    assert!(matches!(error.kind, ConsumeErrorKind::HandlerFault(_)));

    assert!(stays_silent(&mut rx, Duration::from_millis(50)).await);
    assert_eq!(queue.count(), 1);
    assert!(queue.find_message(&id).is_some());
    rider.shutdown();
}

#[tokio::test(start_paused = true)]
async fn sweeper_spares_a_queue_waiting_on_a_put_back() {
    init_logging();
    let options = QueueOptions::default()
        .with_auto_destroy(QueueDestroy::NoMessages)
        .with_acknowledge(AckMode::WaitForAcknowledge)
        .with_put_back(PutBackDecision::Regular)
        .with_put_back_delay(Duration::from_millis(500));
    let rider = Rider::builder()
        .queue_defaults(options)
        .auto_destroy_interval(Duration::from_millis(50))
        .build();
    let (consumer, mut rx) = ChannelClient::new("c1");
    rider.subscribe("retries", consumer).unwrap();
    rider.push(Message::new("retries", "again"), None);

    let first = recv(&mut rx).await;
    let client = ClientId::from("c1");
    assert_eq!(
        rider.acknowledge(&client, &first.negative_acknowledge("later")).unwrap(),
        AckResult::Accepted
    );
    let queue = rider.find_queue("retries").unwrap();
    assert_eq!(queue.count(), 0);
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(queue.pending_put_backs(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rider.find_queue("retries").is_some());

    let again = recv(&mut rx).await;
    assert_eq!(again.id, first.id);
    assert_eq!(queue.pending_put_backs(), 0);

    // Once settled, the queue is empty and the sweeper may take it.
    assert_eq!(rider.acknowledge(&client, &again.acknowledge(true)).unwrap(), AckResult::Accepted);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(rider.find_queue("retries").is_none());
    rider.shutdown();
}

#[tokio::test]
async fn pull_requires_a_subscription() {
    init_logging();
    let rider = Rider::builder().build();
    let options = QueueOptions::default().with_type(QueueType::Pull);
    rider.create_queue("work", Some(options), None).unwrap();

    let stranger = ClientId::from("stranger");
    let refused = rider.pull("work", &stranger, 1, Duration::ZERO).await;
    assert!(matches!(refused, Err(HorseError::ClientNotSubscribed(ref id)) if *id == stranger));
    assert!(matches!(
        rider.pull("missing", &stranger, 1, Duration::ZERO).await,
        Err(HorseError::QueueNotFound(_))
    ));

    let (worker, _rx) = ChannelClient::new("worker");
    rider.subscribe("work", worker).unwrap();
    assert_eq!(
        rider.pull("work", &ClientId::from("worker"), 1, Duration::ZERO).await.unwrap(),
        PullResult::Empty
    );
    rider.shutdown();
}
