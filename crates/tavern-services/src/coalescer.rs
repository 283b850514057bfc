//! Update coalescing for high-frequency state changes (token drags,
//! pointer moves).
//!
//! The coalescer holds one pending command. Each `enqueue` overwrites it; a
//! ticker sends whatever is pending once per interval, and `flush` sends it
//! immediately. Intermediate states may never be sent, but the last state
//! before a flush is sent exactly once.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use tavern_core::{Command, CommandTag};

use crate::dispatch::CommandSink;

pub struct UpdateCoalescer {
    // The lock is held across the send, so the ticker and `flush` can never
    // both send the same slot or reorder two slots.
    slot: Arc<Mutex<Option<Command>>>,
    sink: Arc<dyn CommandSink>,
    interval: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateCoalescer {
    pub fn new(sink: Arc<dyn CommandSink>, interval: Duration) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            sink,
            interval,
            ticker: Mutex::new(None),
        }
    }

    /// Replace the pending command. Sends nothing.
    pub fn enqueue(&self, tag: CommandTag, params: Vec<Value>) {
        *self.slot.lock() = Some(Command::new(tag, params));
    }

    /// Send the pending command now, if any.
    pub fn flush(&self) {
        send_pending(&self.slot, self.sink.as_ref());
    }

    pub fn has_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Start the periodic sender. Must be called inside a tokio runtime.
    /// Calling it again while running does nothing.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let slot = self.slot.clone();
        let sink = self.sink.clone();
        let period = self.interval;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                send_pending(&slot, sink.as_ref());
            }
        }));
        tracing::debug!(interval_ms = period.as_millis() as u64, "coalescer started");
    }

    /// Stop the periodic sender. A pending command stays pending.
    pub fn stop(&self) {
        if let Some(task) = self.ticker.lock().take() {
            task.abort();
            tracing::debug!("coalescer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for UpdateCoalescer {
    fn drop(&mut self) {
        if let Some(task) = self.ticker.get_mut().take() {
            task.abort();
        }
    }
}

fn send_pending(slot: &Mutex<Option<Command>>, sink: &dyn CommandSink) {
    let mut slot = slot.lock();
    if let Some(command) = slot.take() {
        tracing::trace!(tag = %command.tag, "sending coalesced update");
        sink.send(command.tag, command.params);
    }
}
