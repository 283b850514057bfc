//! taverned: host a Tavern session, or join one.
//!
//! ```text
//! taverned host [--port PORT]
//! taverned join [HOST:PORT] [--name NAME] [--role gm|player] [--password PW]
//! taverned init-config
//! ```

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use tavern_core::config::TavernConfig;
use tavern_core::Role;

use taverned::{Host, HostListener};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "host".to_string());
    let rest: Vec<String> = args.collect();

    if mode == "init-config" {
        let path = TavernConfig::write_default_if_missing().context("failed to write default config")?;
        println!("{}", path.display());
        return Ok(());
    }

    let mut config = TavernConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TavernConfig::default()
    });
    let positional = apply_flags(&mut config, &rest)?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    match mode.as_str() {
        "host" => {
            let port = config.server.listen_port;
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("failed to bind port {port}"))?;
            let host = Host::new(config)?;
            tracing::info!(version = tavern_core::wire::PROTOCOL_VERSION, "taverned starting");
            HostListener::new(host, listener, shutdown_tx.subscribe()).run().await
        }
        "join" => {
            let address = positional
                .unwrap_or_else(|| format!("{}:{}", config.network.host, config.network.port));
            taverned::join::run(config, address, shutdown_tx.subscribe()).await
        }
        other => anyhow::bail!("unknown mode {other:?} (expected host, join or init-config)"),
    }
}

/// Apply command-line overrides on top of the loaded config. Returns the
/// first positional argument, if any.
fn apply_flags(config: &mut TavernConfig, args: &[String]) -> Result<Option<String>> {
    let mut positional = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = || {
            iter.next()
                .cloned()
                .with_context(|| format!("{arg} needs a value"))
        };
        match arg.as_str() {
            "--port" => {
                let port: u16 = value()?.parse().context("--port must be a number")?;
                config.server.listen_port = port;
                config.network.port = port;
            }
            "--name" => config.identity.name = value()?,
            "--role" => config.identity.role = value()?.parse::<Role>()?,
            "--password" => config.identity.password = Some(value()?),
            other if other.starts_with("--") => anyhow::bail!("unknown flag {other}"),
            other => {
                if positional.is_none() {
                    positional = Some(other.to_string());
                }
            }
        }
    }
    Ok(positional)
}
