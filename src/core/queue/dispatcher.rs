//! Per-queue send loop.
//!
//! The loop is woken on every push, put-back, acknowledge and subscription
//! change, and also ticks at a low idle rate so a missed wake-up can only
//! delay a message, never strand it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::core::queue::HorseQueue;

const IDLE_TICK: Duration = Duration::from_millis(500);
const YIELD_EVERY: usize = 64;

#[derive(Debug)]
pub struct Dispatcher {
    wake: Arc<Notify>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            wake: Arc::new(Notify::new()),
            stop,
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self, queue: &Arc<HorseQueue>) {
        let mut handle = self.handle.lock();
        if handle.is_some() || *self.stop.borrow() {
            return;
        }
        let weak = Arc::downgrade(queue);
        let wake = self.wake.clone();
        let stop = self.stop.subscribe();
        *handle = Some(tokio::spawn(run(weak, wake, stop)));
    }

    #[inline]
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some() && !*self.stop.borrow()
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

async fn run(queue: Weak<HorseQueue>, wake: Arc<Notify>, mut stop: watch::Receiver<bool>) {
    loop {
        let Some(q) = queue.upgrade() else {
            break;
        };
        let delay = q.options().delay_between_messages;
        let mut sent = 0usize;
        while q.dispatch_next() {
            sent += 1;
            if !delay.is_zero() {
                sleep(delay).await;
            } else if sent % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
            if *stop.borrow() {
                return;
            }
        }
        if sent > 0 {
            trace!(target: "horsemq::dispatcher", queue = %q.name(), sent, "dispatch cycle finished");
        }
        drop(q);

        tokio::select! {
            _ = wake.notified() => {}
            _ = sleep(IDLE_TICK) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    debug!(target: "horsemq::dispatcher", "dispatcher stopped");
}
