//! Routes inbound commands to handlers by tag, and sends outbound commands
//! on the active connection.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;

use tavern_core::{Command, CommandTag};

use crate::connection::ConnectionHandle;
use crate::lifecycle::ConnectionState;

/// Handles one kind of inbound command.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: &Command) -> Result<()>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Command) -> Result<()> + Send + Sync,
{
    fn handle(&self, command: &Command) -> Result<()> {
        self(command)
    }
}

/// Anything outbound commands can be handed to.
pub trait CommandSink: Send + Sync {
    fn send(&self, tag: CommandTag, params: Vec<Value>);
}

pub struct CommandDispatcher {
    handlers: RwLock<HashMap<CommandTag, Arc<dyn CommandHandler>>>,
    link: RwLock<Option<ConnectionHandle>>,
    state: watch::Receiver<ConnectionState>,
}

impl CommandDispatcher {
    pub fn new(state: watch::Receiver<ConnectionState>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            link: RwLock::new(None),
            state,
        }
    }

    /// Bind `tag` to `handler`, replacing any previous binding.
    pub fn register_handler(&self, tag: CommandTag, handler: impl CommandHandler + 'static) {
        if self
            .handlers
            .write()
            .insert(tag, Arc::new(handler))
            .is_some()
        {
            tracing::debug!(%tag, "command handler replaced");
        }
    }

    pub fn unregister_handler(&self, tag: CommandTag) {
        self.handlers.write().remove(&tag);
    }

    /// Make `handle` the outbound link. `None` detaches.
    pub fn attach(&self, handle: Option<ConnectionHandle>) {
        *self.link.write() = handle;
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// Send on the active connection. Silently dropped unless Connected;
    /// nothing is kept for later. Returns whether the command was queued.
    pub fn send_command(&self, command: &Command) -> bool {
        if !self.is_connected() {
            tracing::trace!(tag = %command.tag, "not connected, command dropped");
            return false;
        }
        let link = self.link.read();
        let Some(handle) = link.as_ref() else {
            return false;
        };
        match handle.send_command(command) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(tag = %command.tag, error = %e, "command not sent");
                false
            }
        }
    }

    /// Decode one command and run its handler on the calling task.
    ///
    /// Decode failures, unhandled tags, handler errors and handler panics
    /// are logged; none of them propagate.
    pub fn dispatch(&self, raw: &[u8]) {
        let command = match Command::decode(raw) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, len = raw.len(), "dropping undecodable command");
                return;
            }
        };
        self.dispatch_command(&command);
    }

    pub fn dispatch_command(&self, command: &Command) {
        let handler = self.handlers.read().get(&command.tag).cloned();
        let Some(handler) = handler else {
            tracing::warn!(tag = %command.tag, "no handler registered, command dropped");
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| handler.handle(command))) {
            Ok(Ok(())) => {
                tracing::trace!(tag = %command.tag, "command handled");
            }
            Ok(Err(e)) => {
                tracing::warn!(tag = %command.tag, error = %e, "command handler failed");
            }
            Err(_) => {
                tracing::error!(tag = %command.tag, "command handler panicked");
            }
        }
    }
}

impl CommandSink for CommandDispatcher {
    fn send(&self, tag: CommandTag, params: Vec<Value>) {
        self.send_command(&Command::new(tag, params));
    }
}
