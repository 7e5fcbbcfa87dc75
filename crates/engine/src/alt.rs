use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;
use skdb_codec::Codec;
use skdb_common::{Error, KvApi, PageId, Result, WriteOp};
use tracing::warn;

use crate::config::OpenOptions;
use crate::db::{decode_batch, now_ms, validate_key, validate_op, Db};
use crate::txn::dedupe;

/// One mutation inside a host transaction.
#[derive(Clone, Debug)]
pub enum HostOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// The ordered, transactional key/value store the host environment offers
/// when the page-file substrate is unusable. `apply` must be atomic: all
/// ops or none.
pub trait HostStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn apply(&self, ops: Vec<HostOp>) -> Result<()>;
    /// Ascending pairs with `lo <= key < hi`.
    fn range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-process host store; also the crate's reference implementation for
/// the `HostStore` contract.
#[derive(Default)]
pub struct MemHost {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemHost {
    pub fn new() -> MemHost {
        MemHost::default()
    }
}

impl HostStore for MemHost {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn apply(&self, ops: Vec<HostOp>) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        for op in ops {
            match op {
                HostOp::Put { key, value } => {
                    map.insert(key, value);
                }
                HostOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        let map = self.map.lock().unwrap();
        Ok(map
            .range::<[u8], _>((Bound::Included(lo), Bound::Excluded(hi)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

struct AltState {
    closed: bool,
    reap: Vec<Vec<u8>>,
}

/// Semantics-preserving fallback facade over a `HostStore`.
///
/// Host values carry the same stored-value framing as the page engine, so
/// TTL, compression, and encryption round-trip unchanged; multi-op commits
/// map onto a single host transaction. `put_no_sync` degrades to `put` and
/// `verify_integrity` reports nothing.
pub struct AltBackend {
    host: Box<dyn HostStore>,
    codec: Codec,
    state: Mutex<AltState>,
}

impl AltBackend {
    pub fn new(host: Box<dyn HostStore>, opts: &OpenOptions) -> Result<AltBackend> {
        opts.validate()?;
        let codec = Codec::new(opts.compression, opts.encryption_key.as_deref())?;
        Ok(AltBackend { host, codec, state: Mutex::new(AltState { closed: false, reap: Vec::new() }) })
    }

    fn check_open(&self) -> Result<()> {
        if self.state.lock().unwrap().closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        self.check_open()?;
        for op in &ops {
            validate_op(op)?;
        }
        let ops = dedupe(ops);

        let mut host_ops = Vec::new();
        let now = now_ms();
        for key in std::mem::take(&mut self.state.lock().unwrap().reap) {
            if let Some(stored) = self.host.get(&key)? {
                let decoded = self.codec.decode(&stored)?;
                if matches!(decoded.expiry_ms, Some(expiry) if expiry <= now) {
                    host_ops.push(HostOp::Delete { key });
                }
            }
        }
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    host_ops.push(HostOp::Put { key, value: self.codec.encode(&value, None)? });
                }
                WriteOp::PutTtl { key, value, expiry_ms } => {
                    host_ops.push(HostOp::Put {
                        key,
                        value: self.codec.encode(&value, Some(expiry_ms))?,
                    });
                }
                WriteOp::Delete { key } => host_ops.push(HostOp::Delete { key }),
            }
        }
        self.host.apply(host_ops)
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<(Vec<u8>, bool)>> {
        let Some(stored) = self.host.get(key)? else {
            return Ok(None);
        };
        let decoded = self.codec.decode(&stored)?;
        let live = decoded.expiry_ms.map_or(true, |expiry| expiry > now_ms());
        Ok(Some((decoded.value, live)))
    }
}

#[async_trait]
impl KvApi for AltBackend {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.commit(vec![WriteOp::Put { key: key.to_vec(), value: value.to_vec() }])
    }

    /// Deferred durability has no meaning here; same as `put`.
    async fn put_no_sync(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put(key, value).await
    }

    async fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl_ms: u64) -> Result<()> {
        let expiry_ms = now_ms().saturating_add(ttl_ms);
        self.commit(vec![WriteOp::PutTtl {
            key: key.to_vec(),
            value: value.to_vec(),
            expiry_ms,
        }])
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        validate_key(key)?;
        match self.lookup(key)? {
            Some((value, true)) => Ok(Some(value)),
            Some((_, false)) => {
                self.state.lock().unwrap().reap.push(key.to_vec());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        validate_key(key)?;
        match self.lookup(key)? {
            None => Ok(false),
            Some((_, live)) => {
                self.commit(vec![WriteOp::Delete { key: key.to_vec() }])?;
                Ok(live)
            }
        }
    }

    async fn put_batch(&self, encoded: &[u8]) -> Result<u64> {
        let ops = decode_batch(encoded)?;
        let count = ops.len() as u64;
        self.commit(ops)?;
        Ok(count)
    }

    async fn commit_transaction(&self, ops: Vec<WriteOp>) -> Result<()> {
        self.commit(ops)
    }

    async fn scan_range(
        &self,
        lo: &[u8],
        hi: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_open()?;
        let now = now_ms();
        let mut out = Vec::new();
        let mut expired = Vec::new();
        for (key, stored) in self.host.range(lo, hi)? {
            if out.len() >= limit {
                break;
            }
            let decoded = self.codec.decode(&stored)?;
            match decoded.expiry_ms {
                Some(expiry) if expiry <= now => expired.push(key),
                _ => out.push((key, decoded.value)),
            }
        }
        self.state.lock().unwrap().reap.extend(expired);
        Ok(out)
    }

    /// The host owns its own durability story; nothing to report.
    async fn verify_integrity(&self) -> Result<Vec<PageId>> {
        self.check_open()?;
        Ok(Vec::new())
    }

    async fn flush(&self) -> Result<()> {
        self.check_open()
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }
        state.closed = true;
        Ok(())
    }
}

/// The facade route, fixed once at construction: the page engine when its
/// substrate opens, otherwise the host-backed fallback. Every operation
/// switches on the variant exactly once.
pub enum Storage {
    Primary(Db),
    Alt(AltBackend),
}

impl Storage {
    /// Open the primary engine, falling back to `fallback`'s host store
    /// when the file substrate is unavailable.
    pub fn open_auto<F>(opts: OpenOptions, fallback: F) -> Result<Storage>
    where
        F: FnOnce() -> Box<dyn HostStore>,
    {
        match Db::open(opts.clone()) {
            Ok(db) => Ok(Storage::Primary(db)),
            Err(Error::Io(e)) => {
                warn!(error = %e, name = %opts.name, "primary substrate unavailable, using fallback backend");
                Ok(Storage::Alt(AltBackend::new(fallback(), &opts)?))
            }
            Err(e) => Err(e),
        }
    }
}

macro_rules! route {
    ($self:ident, $db:ident => $expr:expr) => {
        match $self {
            Storage::Primary($db) => $expr,
            Storage::Alt($db) => $expr,
        }
    };
}

#[async_trait]
impl KvApi for Storage {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        route!(self, db => db.put(key, value).await)
    }

    async fn put_no_sync(&self, key: &[u8], value: &[u8]) -> Result<()> {
        route!(self, db => db.put_no_sync(key, value).await)
    }

    async fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl_ms: u64) -> Result<()> {
        route!(self, db => db.put_with_ttl(key, value, ttl_ms).await)
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        route!(self, db => db.get(key).await)
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        route!(self, db => db.delete(key).await)
    }

    async fn put_batch(&self, encoded: &[u8]) -> Result<u64> {
        route!(self, db => db.put_batch(encoded).await)
    }

    async fn commit_transaction(&self, ops: Vec<WriteOp>) -> Result<()> {
        route!(self, db => db.commit_transaction(ops).await)
    }

    async fn scan_range(
        &self,
        lo: &[u8],
        hi: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        route!(self, db => db.scan_range(lo, hi, limit).await)
    }

    async fn verify_integrity(&self) -> Result<Vec<PageId>> {
        route!(self, db => db.verify_integrity().await)
    }

    async fn flush(&self) -> Result<()> {
        route!(self, db => db.flush().await)
    }

    async fn close(&self) -> Result<()> {
        route!(self, db => db.close().await)
    }
}
