mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_logging, recv, stays_silent, text, BrokenClient};
use horsemq::core::queue::{MemoryQueueManager, QueueContext};
use horsemq::{
    AckMode, AckResult, ChannelClient, ClientId, CommitWhen, ConsumeError, ConsumeErrorKind, HorseQueue, Message,
    PutBackDecision, QueueOptions, QueueType,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::Instant;

fn queue_with_errors(name: &str, options: QueueOptions) -> (Arc<HorseQueue>, UnboundedReceiver<ConsumeError>) {
    let (tx, rx) = unbounded_channel();
    let manager = Arc::new(MemoryQueueManager::new(&options));
    let context = QueueContext {
        errors: Some(tx),
        ..QueueContext::default()
    };
    let queue = HorseQueue::new(name, options, manager, context);
    queue.initialize().unwrap();
    (queue, rx)
}

#[tokio::test(start_paused = true)]
async fn stored_message_expires_and_fails_the_producer() {
    init_logging();
    let options = QueueOptions::default()
        .with_commit_when(CommitWhen::AfterAcknowledge)
        .with_message_timeout(Duration::from_millis(100))
        .with_tracker_interval(Duration::from_millis(20));
    let queue = HorseQueue::in_memory("expiring", options);
    queue.initialize().unwrap();
    let (producer, mut acks) = ChannelClient::new("p1");

    let message = Message::new("expiring", "stale").with_wait_response(true);
    let id = message.id.clone();
    queue.push(message, Some(producer));
    assert_eq!(queue.count(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(queue.count(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.count(), 0);
    let failed = acks.try_recv().unwrap();
    assert_eq!(failed.id, id);
    assert!(!failed.is_positive_ack());
    queue.destroy();
}

#[tokio::test(start_paused = true)]
async fn put_back_waits_for_its_delay() {
    init_logging();
    let options = QueueOptions::default()
        .with_acknowledge(AckMode::WaitForAcknowledge)
        .with_put_back(PutBackDecision::Regular)
        .with_put_back_delay(Duration::from_millis(300));
    let queue = HorseQueue::in_memory("delayed", options);
    queue.initialize().unwrap();
    let (consumer, mut rx) = ChannelClient::new("c1");
    queue.subscribe(consumer).unwrap();

    queue.push(Message::new("delayed", "retry-me"), None);
    let first = recv(&mut rx).await;
    let nacked_at = Instant::now();
    assert_eq!(
        queue.acknowledge(&ClientId::from("c1"), &first.negative_acknowledge("busy")),
        AckResult::Accepted
    );
    // Pending put-back is neither stored nor tracked.
    assert_eq!(queue.count(), 0);
    assert_eq!(queue.in_flight(), 0);

    assert!(stays_silent(&mut rx, Duration::from_millis(250)).await);
    let again = recv(&mut rx).await;
    assert_eq!(again.id, first.id);
    assert!(nacked_at.elapsed() >= Duration::from_millis(300));
    queue.destroy();
}

#[tokio::test]
async fn unsubscribe_releases_outstanding_delivery_to_another_client() {
    init_logging();
    let options = QueueOptions::default()
        .with_type(QueueType::RoundRobin)
        .with_acknowledge(AckMode::WaitForAcknowledge)
        .with_put_back(PutBackDecision::Priority);
    let queue = HorseQueue::in_memory("handoff", options);
    queue.initialize().unwrap();

    let (a, mut rx_a) = ChannelClient::new("a");
    queue.subscribe(a).unwrap();
    queue.push(Message::new("handoff", "job"), None);
    let taken = recv(&mut rx_a).await;
    assert_eq!(queue.in_flight(), 1);

    let (b, mut rx_b) = ChannelClient::new("b");
    queue.subscribe(b).unwrap();
    assert!(stays_silent(&mut rx_b, Duration::from_millis(50)).await);

    assert!(queue.unsubscribe(&ClientId::from("a")));
    assert!(!queue.unsubscribe(&ClientId::from("a")));

    let handed_over = recv(&mut rx_b).await;
    assert_eq!(handed_over.id, taken.id);
    assert_eq!(text(&handed_over), "job");
    queue.destroy();
}

#[tokio::test]
async fn failed_send_is_reported_and_message_kept() {
    init_logging();
    let (queue, mut errors) = queue_with_errors("fragile", QueueOptions::default());
    queue.subscribe(BrokenClient::new("broken")).unwrap();

    let message = Message::new("fragile", "keep-me");
    let id = message.id.clone();
    queue.push(message, None);

    let error = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(error.queue, "fragile");
    assert_eq!(error.message_id, id);
    assert_eq!(error.client, Some(ClientId::from("broken")));
    assert_eq!(error.kind, ConsumeErrorKind::SendFailed);
    assert!(queue.find_message(&id).is_some());

    let (healthy, mut rx) = ChannelClient::new("healthy");
    queue.subscribe(healthy).unwrap();
    assert_eq!(recv(&mut rx).await.id, id);
    queue.destroy();
}

#[tokio::test(start_paused = true)]
async fn acknowledge_timeout_is_reported() {
    init_logging();
    let options = QueueOptions::default()
        .with_acknowledge(AckMode::JustRequest)
        .with_acknowledge_timeout(Duration::from_millis(100))
        .with_tracker_interval(Duration::from_millis(25));
    let (queue, mut errors) = queue_with_errors("watched", options);
    let (consumer, mut rx) = ChannelClient::new("c1");
    queue.subscribe(consumer).unwrap();

    queue.push(Message::new("watched", "ignored"), None);
    let got = recv(&mut rx).await;

    let error = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(error.message_id, got.id);
    assert_eq!(error.kind, ConsumeErrorKind::AcknowledgeTimeout);
    assert_eq!(queue.in_flight(), 0);
    // Put-back policy is `No`, so the message is gone.
    assert_eq!(queue.count(), 0);
    queue.destroy();
}

#[tokio::test(start_paused = true)]
async fn disconnected_consumer_frees_its_slot_without_ack_timeout() {
    init_logging();
    let options = QueueOptions::default()
        .with_type(QueueType::RoundRobin)
        .with_acknowledge(AckMode::WaitForAcknowledge)
        .with_acknowledge_timeout(Duration::ZERO)
        .with_put_back(PutBackDecision::Regular)
        .with_tracker_interval(Duration::from_millis(20));
    let (queue, mut errors) = queue_with_errors("orphaned", options);

    let (a, mut rx_a) = ChannelClient::new("a");
    queue.subscribe(a.clone()).unwrap();
    queue.push(Message::new("orphaned", "job"), None);
    let taken = recv(&mut rx_a).await;
    assert_eq!(queue.in_flight(), 1);

    // Transport drops without anyone telling the queue.
    a.disconnect();
    let (b, mut rx_b) = ChannelClient::new("b");
    queue.subscribe(b).unwrap();

    let handed_over = recv(&mut rx_b).await;
    assert_eq!(handed_over.id, taken.id);
    let a_record = queue.clients().get(&ClientId::from("a")).unwrap();
    assert!(!a_record.is_processing());

    let error = errors.try_recv().unwrap();
    assert_eq!(error.client, Some(ClientId::from("a")));
    assert_eq!(error.kind, ConsumeErrorKind::SendFailed);
    queue.destroy();
}
