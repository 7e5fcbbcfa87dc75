use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use skdb_codec::Codec;
use skdb_common::{
    Error, KvApi, Lsn, PageId, Result, TxId, WriteOp, INLINE_VALUE_MAX, MAX_KEY_LEN,
    MAX_VALUE_LEN, META_PAGE_IDS,
};
use skdb_index::{chain, tree, CowSession, RangeIter, ReadPages, Snapshot, ValueRef};
use skdb_pagestore::meta::load_meta;
use skdb_pagestore::{Meta, Page, PageStore};
use skdb_wal::{replay, Wal};
use tracing::{info, warn};

use crate::config::OpenOptions;
use crate::integrity;
use crate::txn::{dedupe, Transaction};

/// Wall-clock milliseconds since the epoch. TTL comparisons are wall-clock
/// and move with it; expiry is a cache hint, never a security boundary.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

enum State {
    Open,
    /// An I/O failure hit after a WAL flush; reads still work, writes fail
    /// until the database is reopened.
    Degraded,
    Closed,
}

/// The storage engine behind one open database.
///
/// All state lives in a single `Inner` under a mutex: callers may be
/// concurrent, but their requests serialize here, and every commit walks
/// the same pipeline — WAL append, WAL flush, copy-on-write apply, page
/// writes, meta flip.
pub struct Db {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

struct Inner {
    store: PageStore,
    wal: Wal,
    codec: Codec,
    /// Current tree root, possibly ahead of the durable meta.
    root: PageId,
    /// Durable meta as last written to its slot.
    durable: Meta,
    active_slot: usize,
    /// Copy-on-write pages applied but not yet checkpointed.
    pending: BTreeMap<PageId, Page>,
    /// Pages unlinked by applied commits; they join the free-list only
    /// after the next meta sync.
    pending_freed: Vec<PageId>,
    /// Keys observed expired by reads; deleted in the next write commit.
    reap: Vec<Vec<u8>>,
    next_tx_id: TxId,
    last_applied_lsn: Lsn,
    need_flush: bool,
    state: State,
}

impl Db {
    /// Open or create the database, running WAL recovery first: pick the
    /// better meta copy, replay newer records, cut the torn tail, then
    /// checkpoint so the alternate meta reflects the recovered state.
    pub fn open(opts: OpenOptions) -> Result<Db> {
        opts.validate()?;
        let codec = Codec::new(opts.compression, opts.encryption_key.as_deref())?;
        let dir = opts.db_dir();
        fs::create_dir_all(&dir)?;
        // Advisory marker only; real exclusion is the coordinator's lock.
        drop(fs::OpenOptions::new().create(true).write(true).open(dir.join("db.lock"))?);

        let pages_path = dir.join("db.pages");
        let wal_dir = dir.join("db.wal");

        let fresh = match fs::metadata(&pages_path) {
            Ok(m) => m.len() == 0,
            Err(_) => true,
        };
        let (durable, active_slot, mut store) = if fresh {
            let mut store = PageStore::create(&pages_path)?;
            let meta =
                Meta::new_empty(codec.compression_default(), codec.encryption_enabled());
            for slot in META_PAGE_IDS {
                let mut page = meta.to_page();
                store.write(slot, &mut page)?;
            }
            store.sync()?;
            info!(name = %opts.name, "created database");
            (meta, 0, store)
        } else {
            let (meta, slot) = load_meta(&pages_path)?;
            if meta.encryption_enabled != codec.encryption_enabled() {
                return Err(Error::bad_input(if meta.encryption_enabled {
                    "database requires its encryption key"
                } else {
                    "database was created without encryption"
                }));
            }
            let store = PageStore::open(&pages_path, &meta)?;
            (meta, slot, store)
        };

        // Replay everything newer than the durable watermark through the
        // normal apply path, without re-appending to the log.
        let mut pending: BTreeMap<PageId, Page> = BTreeMap::new();
        let mut pending_freed: Vec<PageId> = Vec::new();
        let mut root = durable.root;
        let mut max_tx: TxId = 0;
        let last_lsn = replay(&wal_dir, durable.last_durable_lsn, |rec| {
            let mut sess = CowSession::new(&mut store, &pending, rec.lsn);
            let new_root = apply_ops(&mut sess, &codec, root, &rec.ops)?;
            let (dirty, freed) = sess.into_parts();
            for pid in &freed {
                pending.remove(pid);
            }
            pending.extend(dirty);
            pending_freed.extend(freed);
            root = new_root;
            max_tx = max_tx.max(rec.tx_id);
            Ok(())
        })?;

        let wal = Wal::open(&wal_dir, opts.wal_segment_size, last_lsn + 1)?;
        let replayed = last_lsn > durable.last_durable_lsn;
        let mut inner = Inner {
            store,
            wal,
            codec,
            root,
            durable,
            active_slot,
            pending,
            pending_freed,
            reap: Vec::new(),
            next_tx_id: max_tx + 1,
            last_applied_lsn: last_lsn,
            need_flush: replayed,
            state: State::Open,
        };
        if replayed {
            inner.checkpoint()?;
            info!(lsn = inner.durable.last_durable_lsn, "recovery checkpoint complete");
        } else {
            inner.wal.truncate_upto(inner.durable.last_durable_lsn)?;
        }
        Ok(Db { inner: Mutex::new(inner) })
    }

    /// Begin a write set for `commit`.
    pub fn transaction(&self) -> Transaction {
        Transaction::new()
    }

    /// Commit a staged transaction atomically.
    pub async fn commit(&self, tx: Transaction) -> Result<()> {
        self.commit_transaction(tx.into_ops()).await
    }

    /// Read through a transaction: pending ops shadow engine state.
    pub async fn get_in_tx(&self, tx: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match tx.staged(key) {
            Some(WriteOp::Put { value, .. }) => Ok(Some(value.clone())),
            Some(WriteOp::Delete { .. }) => Ok(None),
            Some(WriteOp::PutTtl { value, expiry_ms, .. }) => {
                if *expiry_ms <= now_ms() {
                    Ok(None)
                } else {
                    Ok(Some(value.clone()))
                }
            }
            None => self.get(key).await,
        }
    }

    /// The LSN below which everything is durable; also the change
    /// watermark subscribers can poll.
    pub fn durable_lsn(&self) -> Lsn {
        self.inner.lock().unwrap().durable.last_durable_lsn
    }
}

#[async_trait]
impl KvApi for Db {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .commit(vec![WriteOp::Put { key: key.to_vec(), value: value.to_vec() }], true)
    }

    async fn put_no_sync(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .commit(vec![WriteOp::Put { key: key.to_vec(), value: value.to_vec() }], false)
    }

    async fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl_ms: u64) -> Result<()> {
        let expiry_ms = now_ms().saturating_add(ttl_ms);
        self.inner.lock().unwrap().commit(
            vec![WriteOp::PutTtl { key: key.to_vec(), value: value.to_vec(), expiry_ms }],
            true,
        )
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.lock().unwrap().get(key)
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        self.inner.lock().unwrap().delete(key)
    }

    async fn put_batch(&self, encoded: &[u8]) -> Result<u64> {
        let ops = decode_batch(encoded)?;
        let count = ops.len() as u64;
        self.inner.lock().unwrap().commit(ops, true)?;
        Ok(count)
    }

    async fn commit_transaction(&self, ops: Vec<WriteOp>) -> Result<()> {
        self.inner.lock().unwrap().commit(ops, true)
    }

    async fn scan_range(
        &self,
        lo: &[u8],
        hi: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.lock().unwrap().scan_range(lo, hi, limit)
    }

    async fn verify_integrity(&self) -> Result<Vec<PageId>> {
        let inner = self.inner.lock().unwrap();
        inner.check_readable()?;
        Ok(integrity::scan(&inner.store, &inner.pending, inner.root))
    }

    async fn flush(&self) -> Result<()> {
        self.inner.lock().unwrap().flush()
    }

    async fn close(&self) -> Result<()> {
        self.inner.lock().unwrap().close()
    }
}

impl Inner {
    fn check_writable(&self) -> Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Degraded => Err(Error::Io(std::io::Error::other(
                "engine is read-only after an I/O failure",
            ))),
            State::Closed => Err(Error::Closed),
        }
    }

    fn check_readable(&self) -> Result<()> {
        match self.state {
            State::Closed => Err(Error::Closed),
            _ => Ok(()),
        }
    }

    /// The six-step pipeline. `sync = false` defers the WAL flush and the
    /// checkpoint, trading durability of this one op for latency; the op
    /// is fenced by the next flush, synced commit, or close.
    fn commit(&mut self, ops: Vec<WriteOp>, sync: bool) -> Result<()> {
        self.check_writable()?;
        for op in &ops {
            validate_op(op)?;
        }
        let ops = dedupe(ops);
        if ops.is_empty() && self.reap.is_empty() {
            if sync {
                return self.checkpoint().map_err(|e| self.degrade(e));
            }
            return Ok(());
        }

        let tx_id = self.next_tx_id;
        let lsn = match self.wal.append(tx_id, &ops) {
            Ok(lsn) => lsn,
            Err(e) => return Err(self.degrade(e)),
        };
        self.next_tx_id += 1;

        if sync {
            // Durability point.
            if let Err(e) = self.wal.flush() {
                return Err(self.degrade(e));
            }
        }

        if let Err(e) = self.apply(lsn, &ops) {
            return Err(self.degrade(e));
        }
        self.need_flush = true;

        if sync {
            if let Err(e) = self.checkpoint() {
                return Err(self.degrade(e));
            }
        }
        Ok(())
    }

    fn degrade(&mut self, e: Error) -> Error {
        warn!(error = %e, "write pipeline failed, entering read-only state");
        self.state = State::Degraded;
        e
    }

    /// Copy-on-write application of one record's ops (plus any queued
    /// expired-key reaping) into the pending overlay.
    fn apply(&mut self, lsn: Lsn, ops: &[WriteOp]) -> Result<()> {
        let reap = std::mem::take(&mut self.reap);
        let now = now_ms();
        let mut sess = CowSession::new(&mut self.store, &self.pending, lsn);
        let mut root = self.root;
        for key in &reap {
            root = reap_if_expired(&mut sess, &self.codec, root, key, now)?;
        }
        root = apply_ops(&mut sess, &self.codec, root, ops)?;
        let (dirty, freed) = sess.into_parts();
        for pid in &freed {
            self.pending.remove(pid);
        }
        self.pending.extend(dirty);
        self.pending_freed.extend(freed);
        self.root = root;
        self.last_applied_lsn = lsn;
        Ok(())
    }

    /// Make everything applied so far durable: WAL fsync, pending pages,
    /// data sync, alternate meta, meta sync, then free-list publication
    /// and whole-segment WAL truncation.
    fn checkpoint(&mut self) -> Result<()> {
        if !self.need_flush && self.pending.is_empty() && self.pending_freed.is_empty() {
            return Ok(());
        }
        self.wal.flush()?;
        for (pid, page) in self.pending.iter_mut() {
            self.store.write(*pid, page)?;
        }
        self.store.sync()?;

        let meta = Meta {
            root: self.root,
            free_head: self.store.free_head(),
            next_pid: self.store.next_page_id(),
            last_durable_lsn: self.last_applied_lsn,
            compression_default: self.durable.compression_default,
            encryption_enabled: self.durable.encryption_enabled,
        };
        let slot = 1 - self.active_slot;
        let mut page = meta.to_page();
        self.store.write(META_PAGE_IDS[slot], &mut page)?;
        self.store.sync()?;
        self.active_slot = slot;
        self.durable = meta;

        // Only now may unlinked pages re-enter circulation: the old tree
        // is no longer the durable one.
        for pid in std::mem::take(&mut self.pending_freed) {
            self.store.free(pid, meta.last_durable_lsn)?;
        }
        self.pending.clear();
        self.need_flush = false;
        self.wal.truncate_upto(meta.last_durable_lsn)?;
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_readable()?;
        validate_key(key)?;
        let snap = Snapshot::new(&self.store, &self.pending);
        let Some(vref) = tree::lookup(&snap, self.root, key)? else {
            return Ok(None);
        };
        let stored = load_stored(&snap, &vref)?;
        let decoded = self.codec.decode(&stored)?;
        if let Some(expiry) = decoded.expiry_ms {
            if expiry <= now_ms() {
                // Indistinguishable from absent; physically removed by the
                // next write commit.
                self.reap.push(key.to_vec());
                return Ok(None);
            }
        }
        Ok(Some(decoded.value))
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.check_writable()?;
        validate_key(key)?;
        let (present, live) = {
            let snap = Snapshot::new(&self.store, &self.pending);
            match tree::lookup(&snap, self.root, key)? {
                None => (false, false),
                Some(vref) => {
                    let stored = load_stored(&snap, &vref)?;
                    let decoded = self.codec.decode(&stored)?;
                    let live = decoded.expiry_ms.map_or(true, |e| e > now_ms());
                    (true, live)
                }
            }
        };
        if !present {
            return Ok(false);
        }
        self.commit(vec![WriteOp::Delete { key: key.to_vec() }], true)?;
        Ok(live)
    }

    fn scan_range(
        &mut self,
        lo: &[u8],
        hi: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_readable()?;
        let mut out = Vec::new();
        let mut expired = Vec::new();
        {
            let snap = Snapshot::new(&self.store, &self.pending);
            let iter = RangeIter::new(&snap, self.root, lo, Some(hi))?;
            let now = now_ms();
            for item in iter {
                if out.len() >= limit {
                    break;
                }
                let (key, vref) = item?;
                let stored = load_stored(&snap, &vref)?;
                let decoded = self.codec.decode(&stored)?;
                match decoded.expiry_ms {
                    Some(expiry) if expiry <= now => expired.push(key),
                    _ => out.push((key, decoded.value)),
                }
            }
        }
        self.reap.extend(expired);
        Ok(out)
    }

    fn flush(&mut self) -> Result<()> {
        self.check_writable()?;
        self.checkpoint().map_err(|e| self.degrade(e))
    }

    fn close(&mut self) -> Result<()> {
        match self.state {
            State::Closed => Err(Error::Closed),
            State::Degraded => {
                self.state = State::Closed;
                Ok(())
            }
            State::Open => {
                let result = self.checkpoint();
                self.state = State::Closed;
                result
            }
        }
    }
}

/// Apply decoded ops through the tree, freeing replaced and removed value
/// chains as it goes. Returns the new root.
fn apply_ops(
    sess: &mut CowSession<'_>,
    codec: &Codec,
    mut root: PageId,
    ops: &[WriteOp],
) -> Result<PageId> {
    for op in ops {
        root = match op {
            WriteOp::Put { key, value } => apply_put(sess, codec, root, key, value, None)?,
            WriteOp::PutTtl { key, value, expiry_ms } => {
                apply_put(sess, codec, root, key, value, Some(*expiry_ms))?
            }
            WriteOp::Delete { key } => {
                let (new_root, removed) = tree::remove(sess, root, key)?;
                if let Some(ValueRef::Chain { head, .. }) = removed {
                    chain::free_chain(sess, head)?;
                }
                new_root
            }
        };
    }
    Ok(root)
}

fn apply_put(
    sess: &mut CowSession<'_>,
    codec: &Codec,
    root: PageId,
    key: &[u8],
    value: &[u8],
    expiry_ms: Option<u64>,
) -> Result<PageId> {
    let stored = codec.encode(value, expiry_ms)?;
    let vref = if stored.len() <= INLINE_VALUE_MAX {
        ValueRef::Inline(stored)
    } else {
        let len = stored.len() as u32;
        let head = chain::write_chain(sess, &stored)?;
        ValueRef::Chain { head, len }
    };
    let (new_root, replaced) = tree::insert(sess, root, key, vref)?;
    if let Some(ValueRef::Chain { head, .. }) = replaced {
        chain::free_chain(sess, head)?;
    }
    Ok(new_root)
}

/// Physically remove a key whose expiry a read observed in the past,
/// re-checking under the current clock first.
fn reap_if_expired(
    sess: &mut CowSession<'_>,
    codec: &Codec,
    root: PageId,
    key: &[u8],
    now: u64,
) -> Result<PageId> {
    let Some(vref) = tree::lookup(sess, root, key)? else {
        return Ok(root);
    };
    let stored = load_stored(sess, &vref)?;
    let decoded = codec.decode(&stored)?;
    match decoded.expiry_ms {
        Some(expiry) if expiry <= now => {
            let (new_root, removed) = tree::remove(sess, root, key)?;
            if let Some(ValueRef::Chain { head, .. }) = removed {
                chain::free_chain(sess, head)?;
            }
            Ok(new_root)
        }
        _ => Ok(root),
    }
}

fn load_stored(src: &impl ReadPages, vref: &ValueRef) -> Result<Vec<u8>> {
    match vref {
        ValueRef::Inline(v) => Ok(v.clone()),
        ValueRef::Chain { head, len } => chain::read_chain(src, *head, *len as usize),
    }
}

pub(crate) fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::bad_input("empty key"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::BadInput(format!("key exceeds {MAX_KEY_LEN} bytes")));
    }
    Ok(())
}

pub(crate) fn validate_op(op: &WriteOp) -> Result<()> {
    validate_key(op.key())?;
    let value_len = match op {
        WriteOp::Put { value, .. } | WriteOp::PutTtl { value, .. } => value.len(),
        WriteOp::Delete { .. } => 0,
    };
    if value_len > MAX_VALUE_LEN {
        return Err(Error::bad_input("value too large"));
    }
    Ok(())
}

/// Decode the `{key_len_u32, key, val_len_u32, val}*` batch framing. The
/// buffer must parse exactly; truncated records or trailing bytes reject
/// the whole batch before any state changes.
pub(crate) fn decode_batch(buf: &[u8]) -> Result<Vec<WriteOp>> {
    fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
        let bytes = buf
            .get(*pos..*pos + 4)
            .ok_or_else(|| Error::bad_input("batch buffer truncated"))?;
        *pos += 4;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }
    fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
        let bytes = buf
            .get(*pos..*pos + len)
            .ok_or_else(|| Error::bad_input("batch buffer truncated"))?;
        *pos += len;
        Ok(bytes)
    }

    let mut ops = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let key_len = read_u32(buf, &mut pos)? as usize;
        let key = take(buf, &mut pos, key_len)?.to_vec();
        let val_len = read_u32(buf, &mut pos)? as usize;
        let value = take(buf, &mut pos, val_len)?.to_vec();
        ops.push(WriteOp::Put { key, value });
    }
    Ok(ops)
}
