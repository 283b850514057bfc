//! `join` mode: connect to a host as a player and follow the session from
//! the terminal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::broadcast;

use tavern_core::config::TavernConfig;
use tavern_core::{Command, CommandTag};
use tavern_services::{CommandDispatcher, ConnectionLifecycle, ReplicaHost, SessionContext, SessionMode};

const HEARTBEAT: Duration = Duration::from_secs(30);

/// Fallback for a terminal client: there is no campaign UI to rebuild, so
/// both steps only log.
pub struct LogReplica;

impl ReplicaHost for LogReplica {
    fn teardown_replica(&self) {
        tracing::info!("replicated campaign discarded");
    }

    fn start_standalone(&self) -> Result<()> {
        tracing::info!("continuing in standalone mode");
        Ok(())
    }
}

/// Log what the session tells us.
pub fn register_log_handlers(dispatcher: &CommandDispatcher) {
    dispatcher.register_handler(CommandTag::PlayerConnected, |cmd: &Command| -> Result<()> {
        let name: String = cmd.param(0)?;
        let role: String = cmd.param(1).unwrap_or_default();
        tracing::info!(%name, %role, "player connected");
        Ok(())
    });
    dispatcher.register_handler(CommandTag::PlayerDisconnected, |cmd: &Command| -> Result<()> {
        let name: String = cmd.param(0)?;
        tracing::info!(%name, "player disconnected");
        Ok(())
    });
    dispatcher.register_handler(CommandTag::Message, |cmd: &Command| -> Result<()> {
        let text = cmd.params.first().cloned().unwrap_or(Value::Null);
        tracing::info!(%text, "message");
        Ok(())
    });
    dispatcher.register_handler(CommandTag::SetCampaign, |_: &Command| -> Result<()> {
        tracing::info!("campaign received");
        Ok(())
    });
}

/// Join `address` and stay connected until `shutdown` fires or the host
/// goes away.
pub async fn run(config: TavernConfig, address: String, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let ctx = SessionContext::new(config).context("failed to build session")?;
    register_log_handlers(ctx.dispatcher());

    let lifecycle = ConnectionLifecycle::new(ctx.clone(), Arc::new(LogReplica));
    let policy = lifecycle
        .connect(&address)
        .await
        .with_context(|| format!("failed to join {address}"))?;
    tracing::info!(host = %address, ?policy, "joined");

    let mut mode = lifecycle.subscribe_mode();
    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                lifecycle.disconnect().await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                ctx.send(CommandTag::Heartbeat, vec![]);
            }
            changed = mode.changed() => {
                if changed.is_err() || matches!(*mode.borrow(), SessionMode::Standalone) {
                    tracing::warn!(host = %address, "lost connection to host");
                    return Ok(());
                }
            }
        }
    }
}
