use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use skdb_common::{
    dispatch, Error, KvApi, Method, Reply, RequestEnvelope, ResponseEnvelope, Result, WriteOp,
};
use skdb_engine::{Db, OpenOptions};
use tokio::sync::broadcast;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{BusMessage, CoordinatorConfig, DbSlot};

enum Role {
    Leader(LeaderState),
    Follower,
}

struct LeaderState {
    db: Arc<Db>,
    /// Held for as long as this client leads; dropping it (crash or
    /// close) lets the next queued follower promote.
    _guard: OwnedMutexGuard<()>,
    /// Cross-process advisory lock on `db.lock`; released on drop.
    _file_lock: std::fs::File,
}

struct ClientShared {
    client_id: u64,
    opts: OpenOptions,
    config: CoordinatorConfig,
    slot: Arc<DbSlot>,
    role: tokio::sync::RwLock<Role>,
    next_req: AtomicU64,
    alive: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One participant in a database's client group. Implements the full
/// facade: the leader executes against its engine, a follower serializes
/// each call into an envelope and awaits the leader's response.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    pub(crate) async fn connect(
        slot: Arc<DbSlot>,
        opts: OpenOptions,
        config: CoordinatorConfig,
    ) -> Result<Client> {
        let client_id = slot.next_client.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(ClientShared {
            client_id,
            opts,
            config,
            slot: slot.clone(),
            role: tokio::sync::RwLock::new(Role::Follower),
            next_req: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        });

        match slot.lock.clone().try_lock_owned() {
            Ok(guard) => promote(&shared, guard).await?,
            Err(_) => {
                let task = tokio::spawn(follower_task(shared.clone()));
                shared.tasks.lock().unwrap().push(task);
            }
        }
        Ok(Client { shared })
    }

    /// Whether this client currently leads its group.
    pub async fn is_leader(&self) -> bool {
        matches!(&*self.shared.role.read().await, Role::Leader(_))
    }

    /// Simulate a crash: drop leadership and stop participating without
    /// flushing or closing the engine.
    pub async fn kill(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        *self.shared.role.write().await = Role::Follower;
        info!(client = self.shared.client_id, "client killed");
    }

    /// Leave the group. A leader flushes and closes its engine first,
    /// releasing the lock for the next follower in line.
    pub async fn close(&self) -> Result<()> {
        if !self.shared.alive.swap(false, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let mut role = self.shared.role.write().await;
        let result = match &*role {
            Role::Leader(state) => state.db.close().await,
            Role::Follower => Ok(()),
        };
        // Leadership is released even if the engine close failed, so the
        // next follower in line can take over and recover.
        *role = Role::Follower;
        result
    }

    async fn call(&self, method: Method) -> Result<Reply> {
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let db = match &*self.shared.role.read().await {
            Role::Leader(state) => Some(state.db.clone()),
            Role::Follower => None,
        };
        match db {
            Some(db) => dispatch(db.as_ref(), method).await.map_err(Error::from),
            None => self.proxy(method).await,
        }
    }

    /// Serialize one operation to the leader and await the matching
    /// response envelope.
    async fn proxy(&self, method: Method) -> Result<Reply> {
        let shared = &self.shared;
        let req_id = shared.next_req.fetch_add(1, Ordering::SeqCst);
        // Subscribe before sending so the response cannot be missed.
        let mut rx = shared.slot.bus.subscribe();
        let envelope = RequestEnvelope { req_id, client_id: shared.client_id, method };
        if shared.slot.bus.send(BusMessage::Request(envelope)).is_err() {
            return Err(Error::NotLeader);
        }

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(BusMessage::Response(resp))
                        if resp.req_id == req_id && resp.client_id == shared.client_id =>
                    {
                        return Some(resp.result);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        match tokio::time::timeout(shared.config.proxy_timeout, wait).await {
            Ok(Some(result)) => result.map_err(Error::from),
            Ok(None) => Err(Error::NotLeader),
            Err(_) => Err(Error::Timeout),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        // Any held leadership is released when the aborted tasks drop
        // their references and the role lock unwinds.
    }
}

/// Take over as leader: advisory file lock, fresh engine handle, then the
/// serve/heartbeat loop.
async fn promote(shared: &Arc<ClientShared>, guard: OwnedMutexGuard<()>) -> Result<()> {
    let file_lock = acquire_file_lock(&shared.opts).await?;
    let db = Arc::new(Db::open(shared.opts.clone())?);
    *shared.role.write().await =
        Role::Leader(LeaderState { db: db.clone(), _guard: guard, _file_lock: file_lock });
    let task = tokio::spawn(leader_task(shared.clone(), db));
    shared.tasks.lock().unwrap().push(task);
    info!(client = shared.client_id, name = %shared.opts.name, "leader elected");
    Ok(())
}

/// The dead leader may not have dropped its file handle yet; retry
/// briefly before giving up.
async fn acquire_file_lock(opts: &OpenOptions) -> Result<std::fs::File> {
    let dir = opts.db_dir();
    std::fs::create_dir_all(&dir)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(dir.join("db.lock"))?;
    for _ in 0..50 {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
        }
    }
    Err(Error::Io(std::io::Error::other("database file lock is held elsewhere")))
}

/// Leader loop: heartbeat on a fixed interval, execute request envelopes
/// in arrival order, reply on the bus.
async fn leader_task(shared: Arc<ClientShared>, db: Arc<Db>) {
    let mut rx = shared.slot.bus.subscribe();
    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    loop {
        if !shared.alive.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = heartbeat.tick() => {
                let _ = shared
                    .slot
                    .bus
                    .send(BusMessage::Heartbeat { client_id: shared.client_id });
            }
            msg = rx.recv() => match msg {
                Ok(BusMessage::Request(req)) => {
                    let result = dispatch(db.as_ref(), req.method).await;
                    let _ = shared.slot.bus.send(BusMessage::Response(ResponseEnvelope {
                        req_id: req.req_id,
                        client_id: req.client_id,
                        result,
                    }));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "leader lagged on the bus");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Follower loop: watch for heartbeats; after the silence threshold,
/// queue on the lock, but abandon the attempt the moment a live leader
/// speaks again.
async fn follower_task(shared: Arc<ClientShared>) {
    let mut rx = shared.slot.bus.subscribe();
    loop {
        if !shared.alive.load(Ordering::SeqCst) {
            return;
        }
        match tokio::time::timeout(shared.config.heartbeat_timeout, next_heartbeat(&mut rx)).await
        {
            Ok(Some(())) => continue,
            Ok(None) => return,
            Err(_) => {
                warn!(client = shared.client_id, "leader silent, requesting the lock");
                tokio::select! {
                    guard = shared.slot.lock.clone().lock_owned() => {
                        if !shared.alive.load(Ordering::SeqCst) {
                            return;
                        }
                        match promote(&shared, guard).await {
                            Ok(()) => return,
                            Err(e) => {
                                warn!(client = shared.client_id, error = %e, "promotion failed");
                                return;
                            }
                        }
                    }
                    outcome = next_heartbeat(&mut rx) => {
                        if outcome.is_none() {
                            return;
                        }
                        // A leader is alive after all; stand down.
                        continue;
                    }
                }
            }
        }
    }
}

async fn next_heartbeat(rx: &mut broadcast::Receiver<BusMessage>) -> Option<()> {
    loop {
        match rx.recv().await {
            Ok(BusMessage::Heartbeat { .. }) => return Some(()),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn expect_unit(reply: Reply) -> Result<()> {
    match reply {
        Reply::Unit => Ok(()),
        other => Err(Error::Corrupt(format!("unexpected reply {other:?}"))),
    }
}

#[async_trait]
impl KvApi for Client {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        expect_unit(
            self.call(Method::Put { key: key.to_vec(), value: value.to_vec() }).await?,
        )
    }

    async fn put_no_sync(&self, key: &[u8], value: &[u8]) -> Result<()> {
        expect_unit(
            self.call(Method::PutNoSync { key: key.to_vec(), value: value.to_vec() }).await?,
        )
    }

    async fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl_ms: u64) -> Result<()> {
        expect_unit(
            self.call(Method::PutWithTtl {
                key: key.to_vec(),
                value: value.to_vec(),
                ttl_ms,
            })
            .await?,
        )
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.call(Method::Get { key: key.to_vec() }).await? {
            Reply::Value(v) => Ok(v),
            other => Err(Error::Corrupt(format!("unexpected reply {other:?}"))),
        }
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        match self.call(Method::Delete { key: key.to_vec() }).await? {
            Reply::Bool(b) => Ok(b),
            other => Err(Error::Corrupt(format!("unexpected reply {other:?}"))),
        }
    }

    async fn put_batch(&self, encoded: &[u8]) -> Result<u64> {
        match self.call(Method::PutBatch { encoded: encoded.to_vec() }).await? {
            Reply::Count(n) => Ok(n),
            other => Err(Error::Corrupt(format!("unexpected reply {other:?}"))),
        }
    }

    async fn commit_transaction(&self, ops: Vec<WriteOp>) -> Result<()> {
        expect_unit(self.call(Method::CommitTransaction { ops }).await?)
    }

    async fn scan_range(
        &self,
        lo: &[u8],
        hi: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let method = Method::ScanRange {
            lo: lo.to_vec(),
            hi: hi.to_vec(),
            limit: limit as u64,
        };
        match self.call(method).await? {
            Reply::Pairs(pairs) => Ok(pairs),
            other => Err(Error::Corrupt(format!("unexpected reply {other:?}"))),
        }
    }

    async fn verify_integrity(&self) -> Result<Vec<skdb_common::PageId>> {
        match self.call(Method::VerifyIntegrity).await? {
            Reply::Pages(pages) => Ok(pages),
            other => Err(Error::Corrupt(format!("unexpected reply {other:?}"))),
        }
    }

    async fn flush(&self) -> Result<()> {
        expect_unit(self.call(Method::Flush).await?)
    }

    async fn close(&self) -> Result<()> {
        Client::close(self).await
    }
}
