#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use horsemq::{Client, ClientId, HorseError, Message};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = horsemq::logging::init_logging("warn");
    });
}

pub fn text(msg: &Message) -> String {
    String::from_utf8_lossy(&msg.payload).into_owned()
}

/// Next message on `rx`, failing the test after two seconds.
pub async fn recv(rx: &mut UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

/// True if nothing arrives on `rx` within `wait`.
pub async fn stays_silent(rx: &mut UnboundedReceiver<Message>, wait: Duration) -> bool {
    tokio::time::timeout(wait, rx.recv()).await.is_err()
}

/// Client that appends `(client, payload)` to a log shared by several clients,
/// so tests can see the global delivery order.
#[derive(Debug)]
pub struct RecordingClient {
    id: ClientId,
    log: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingClient {
    pub fn new(id: &str, log: Arc<Mutex<Vec<(String, String)>>>) -> Arc<Self> {
        Arc::new(Self {
            id: ClientId::from(id),
            log,
        })
    }
}

impl Client for RecordingClient {
    fn id(&self) -> &ClientId {
        &self.id
    }

    fn send(&self, message: &Message) -> Result<(), HorseError> {
        self.log
            .lock()
            .unwrap()
            .push((self.id.to_string(), text(message)));
        Ok(())
    }
}

/// Client that claims to be connected but whose transport always fails.
#[derive(Debug)]
pub struct BrokenClient {
    id: ClientId,
}

impl BrokenClient {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self { id: ClientId::from(id) })
    }
}

impl Client for BrokenClient {
    fn id(&self) -> &ClientId {
        &self.id
    }

    fn send(&self, _message: &Message) -> Result<(), HorseError> {
        Err(HorseError::Disconnected(self.id.clone()))
    }
}
