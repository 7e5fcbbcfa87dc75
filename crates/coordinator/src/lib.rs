//! Single-writer coordination for cooperating clients sharing one
//! database name: a named lock elects the leader, a broadcast bus carries
//! RPC envelopes, heartbeats detect leader death, and followers promote
//! themselves when the lock falls to them.

mod client;

pub use client::Client;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skdb_common::{RequestEnvelope, ResponseEnvelope, Result};
use skdb_engine::OpenOptions;
use tokio::sync::broadcast;

/// Everything that travels on one database's bus.
#[derive(Clone, Debug)]
pub enum BusMessage {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    Heartbeat { client_id: u64 },
}

/// Timing knobs. The defaults are the contract: 1 s heartbeats, a leader
/// is presumed dead after 3 s of silence, proxied requests give up after
/// 10 s.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub proxy_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            proxy_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-name shared resources: the leader lock and the message bus. These
/// are process-wide only in the sense that every client connects through
/// the same `Coordinator` value; nothing here is ambient state.
pub(crate) struct DbSlot {
    pub(crate) lock: Arc<tokio::sync::Mutex<()>>,
    pub(crate) bus: broadcast::Sender<BusMessage>,
    pub(crate) next_client: AtomicU64,
}

/// Registry of per-database-name leader locks and buses.
pub struct Coordinator {
    base_dir: PathBuf,
    config: CoordinatorConfig,
    slots: Mutex<HashMap<String, Arc<DbSlot>>>,
}

impl Coordinator {
    pub fn new(base_dir: impl Into<PathBuf>) -> Coordinator {
        Coordinator::with_config(base_dir, CoordinatorConfig::default())
    }

    pub fn with_config(base_dir: impl Into<PathBuf>, config: CoordinatorConfig) -> Coordinator {
        Coordinator { base_dir: base_dir.into(), config, slots: Mutex::new(HashMap::new()) }
    }

    /// Join the group of clients for `name`. The first holder of the
    /// named lock opens the engine and leads; everyone else follows and
    /// proxies operations over the bus.
    pub async fn connect(&self, name: &str) -> Result<Client> {
        self.connect_with(OpenOptions::new(&self.base_dir, name)).await
    }

    /// `connect` with full engine options (compression, encryption key).
    pub async fn connect_with(&self, opts: OpenOptions) -> Result<Client> {
        opts.validate()?;
        let slot = self.slot(&opts.name);
        Client::connect(slot, opts, self.config.clone()).await
    }

    fn slot(&self, name: &str) -> Arc<DbSlot> {
        let mut slots = self.slots.lock().unwrap();
        slots
            .entry(name.to_string())
            .or_insert_with(|| {
                let (bus, _) = broadcast::channel(256);
                Arc::new(DbSlot {
                    lock: Arc::new(tokio::sync::Mutex::new(())),
                    bus,
                    next_client: AtomicU64::new(1),
                })
            })
            .clone()
    }
}
