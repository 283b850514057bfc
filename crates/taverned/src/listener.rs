//! TCP accept loop for the host.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use tavern_services::ConnectionError;

use crate::host::Host;

pub struct HostListener {
    host: Arc<Host>,
    listener: TcpListener,
    shutdown: broadcast::Receiver<()>,
}

impl HostListener {
    pub fn new(host: Arc<Host>, listener: TcpListener, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            host,
            listener,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let local = self.listener.local_addr()?;
        tracing::info!(addr = %local, server = %self.host.config().server.name, "host listening");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("host listener shutting down");
                    self.host.close_all();
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(peer = %addr, "connection accepted");

                    let host = self.host.clone();
                    tokio::spawn(async move {
                        match host.accept(stream, addr).await {
                            Ok(()) => {}
                            Err(ConnectionError::Handshake(e)) => {
                                tracing::debug!(peer = %addr, error = %e, "player not admitted");
                            }
                            Err(e) => {
                                tracing::warn!(peer = %addr, error = %e, "handshake failed");
                            }
                        }
                    });
                }
            }
        }
    }
}
