use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::core::error::HorseError;
use crate::core::message::Message;

/// Unique identifier for a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_owned())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        ClientId(s)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ClientId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A connected peer as seen by the queue engine.
///
/// The connection layer implements this on top of its socket writer. `send`
/// must not block: it hands the message to the connection's outbound buffer
/// and reports a transport failure as an error.
pub trait Client: Send + Sync + fmt::Debug {
    fn id(&self) -> &ClientId;

    fn is_connected(&self) -> bool {
        true
    }

    fn send(&self, message: &Message) -> Result<(), HorseError>;
}

/// Client whose outbound side is an unbounded tokio channel.
#[derive(Debug)]
pub struct ChannelClient {
    id: ClientId,
    sender: UnboundedSender<Message>,
    connected: AtomicBool,
}

impl ChannelClient {
    /// Creates a client and returns the receiving end of its outbound channel.
    pub fn new(id: impl Into<ClientId>) -> (Arc<Self>, UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        let client = Arc::new(Self {
            id: id.into(),
            sender: tx,
            connected: AtomicBool::new(true),
        });
        (client, rx)
    }

    /// Marks the connection as gone; further sends fail.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::Release);
    }
}

impl Client for ChannelClient {
    #[inline(always)]
    fn id(&self) -> &ClientId {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    fn send(&self, message: &Message) -> Result<(), HorseError> {
        if !self.is_connected() {
            return Err(HorseError::Disconnected(self.id.clone()));
        }
        self.sender
            .send(message.clone())
            .map_err(|_| HorseError::Disconnected(self.id.clone()))
    }
}
