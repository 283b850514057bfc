//! Tavern integration test harness.
//!
//! Every test runs a real host on a loopback TCP port and joins it with
//! in-process clients. No external processes or privileges are needed:
//!
//!   cargo test --test integration
//!
//! Each test binds its own ephemeral port, so tests may run in parallel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use tavern_core::config::TavernConfig;
use tavern_core::{Command, CommandTag, Role};
use tavern_services::{
    AssetStore, ConnectionLifecycle, MemoryStorage, ReplicaHost, SessionContext,
};
use taverned::{Host, HostListener};

mod assets;
mod handshake;
mod lifecycle;
mod relay;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const GM_PASSWORD: &str = "dragon";
pub const PLAYER_PASSWORD: &str = "goblin";

/// Tags the test clients record instead of handling.
const RECORDED: &[CommandTag] = &[
    CommandTag::PlayerConnected,
    CommandTag::PlayerDisconnected,
    CommandTag::SetCampaign,
    CommandTag::PutToken,
    CommandTag::Message,
    CommandTag::UpdateTokenMove,
    CommandTag::Heartbeat,
];

pub fn test_config() -> TavernConfig {
    let mut config = TavernConfig::default();
    config.server.gm_password = Some(GM_PASSWORD.into());
    config.server.player_password = Some(PLAYER_PASSWORD.into());
    config.transfer.spool_to_disk = false;
    config.transfer.persistent_cache = false;
    config.coalescer.interval_ms = 60_000;
    config
}

pub struct TestHost {
    pub host: Arc<Host>,
    pub addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
}

impl TestHost {
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Wait until the host has `name` on its roster.
    pub async fn wait_for_player(&self, name: &str) {
        let ok = wait_until(Duration::from_secs(5), || {
            self.host.players().iter().any(|(n, _)| n == name)
        })
        .await;
        assert!(ok, "{name} never appeared on the host roster");
    }

    /// Stop accepting and close every player connection.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.stop();
    }
}

pub async fn start_host(config: TavernConfig) -> TestHost {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let host = Host::with_storage(config, AssetStore::new(), Arc::new(MemoryStorage));
    let (shutdown, rx) = broadcast::channel(1);
    tokio::spawn(HostListener::new(host.clone(), listener, rx).run());
    TestHost {
        host,
        addr,
        shutdown,
    }
}

#[derive(Default)]
pub struct CountingReplica {
    pub teardowns: AtomicUsize,
    pub standalones: AtomicUsize,
}

impl ReplicaHost for CountingReplica {
    fn teardown_replica(&self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }

    fn start_standalone(&self) -> Result<()> {
        self.standalones.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct TestClient {
    pub lifecycle: ConnectionLifecycle,
    pub replica: Arc<CountingReplica>,
    received: Arc<Mutex<Vec<Command>>>,
}

impl TestClient {
    pub fn new(name: &str, role: Role, password: &str) -> Self {
        Self::with_config(name, role, password, test_config())
    }

    pub fn with_config(name: &str, role: Role, password: &str, mut config: TavernConfig) -> Self {
        config.identity.name = name.into();
        config.identity.role = role;
        config.identity.password = Some(password.into());

        let ctx = SessionContext::with_parts(config, AssetStore::new(), Arc::new(MemoryStorage));
        let received = Arc::new(Mutex::new(Vec::new()));
        for tag in RECORDED {
            let r = received.clone();
            ctx.dispatcher().register_handler(*tag, move |c: &Command| -> Result<()> {
                r.lock().unwrap().push(c.clone());
                Ok(())
            });
        }

        let replica = Arc::new(CountingReplica::default());
        let lifecycle = ConnectionLifecycle::new(ctx, replica.clone());
        Self {
            lifecycle,
            replica,
            received,
        }
    }

    /// Shorthand: a GM named `name` that is already joined.
    pub async fn gm(host: &TestHost, name: &str) -> Self {
        let client = Self::new(name, Role::Gm, GM_PASSWORD);
        client.lifecycle.connect(&host.address()).await.unwrap();
        host.wait_for_player(name).await;
        client
    }

    /// Shorthand: a player named `name` that is already joined.
    pub async fn player(host: &TestHost, name: &str) -> Self {
        let client = Self::new(name, Role::Player, PLAYER_PASSWORD);
        client.lifecycle.connect(&host.address()).await.unwrap();
        host.wait_for_player(name).await;
        client
    }

    pub fn ctx(&self) -> &SessionContext {
        self.lifecycle.context()
    }

    pub fn received(&self) -> Vec<Command> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_tag(&self, tag: CommandTag) -> Vec<Command> {
        self.received()
            .into_iter()
            .filter(|c| c.tag == tag)
            .collect()
    }

    /// Wait until at least `n` commands with `tag` have arrived.
    pub async fn wait_for(&self, tag: CommandTag, n: usize) -> Vec<Command> {
        let ok = wait_until(Duration::from_secs(5), || self.received_tag(tag).len() >= n).await;
        assert!(ok, "timed out waiting for {n} x {tag}, got {:?}", self.received());
        self.received_tag(tag)
    }
}

/// Poll `condition` every 10 ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
