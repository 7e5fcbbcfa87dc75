use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Monotonically increasing log sequence number (1-based; 0 means "no LSN").
pub type Lsn = u64;

/// Physical page identifier inside `db.pages`.
pub type PageId = u32;

/// Transaction identifier carried in WAL records.
pub type TxId = u64;

/// 4 KiB page — every block in the page file has this size.
pub const PAGE_SIZE: usize = 4096;

/// Fixed page header: `type, pad, payload_len, page_lsn, crc32c`.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Bytes of a page available to the payload.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Page id 0 doubles as the "no page" sentinel; the two meta copies own
/// pages 0 and 1, so no data page can ever carry id 0.
pub const NIL_PAGE: PageId = 0;

/// Page ids of the two alternating meta copies.
pub const META_PAGE_IDS: [PageId; 2] = [0, 1];

/// First page id available to data.
pub const FIRST_DATA_PAGE: PageId = 2;

/// Meta page magic.
pub const MAGIC: [u8; 4] = *b"SKDB";

/// On-disk format version. Opening a newer version fails.
pub const FORMAT_VERSION: u16 = 0x0001;

/// Keys are 1..=MAX_KEY_LEN bytes, compared as unsigned byte strings.
pub const MAX_KEY_LEN: usize = 4096;

/// Values are 0..=MAX_VALUE_LEN bytes. Slightly under 2³² − 1 so a value
/// length plus the TTL prefix always fits the WAL's u32 field without
/// colliding with its no-value sentinel.
pub const MAX_VALUE_LEN: usize = (u32::MAX - 9) as usize;

/// Stored values at or below this many bytes live inline in the leaf;
/// larger ones move to an overflow chain.
pub const INLINE_VALUE_MAX: usize = 256;

/// Keys longer than this are spilled to an overflow chain and referenced
/// from the node entry, which is what lets a 4096-byte key fit a 4 KiB node.
pub const KEY_INLINE_MAX: usize = 512;

/// Compression is only attempted for payloads at least this large.
pub const MIN_COMPRESS_SIZE: usize = 64;

/// Default WAL segment size before rotation.
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;

/// Database name constraints: 1..=128 chars from `[A-Za-z0-9_-]`.
pub const MAX_NAME_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Write operations — the unit of change in a transaction and in the WAL
// ---------------------------------------------------------------------------

/// A single staged mutation. `PutTtl` carries an absolute expiry in
/// milliseconds since the epoch; on the WAL wire the expiry is folded into
/// the leading 8 bytes of the value field.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    PutTtl { key: Vec<u8>, value: Vec<u8>, expiry_ms: u64 },
}

impl WriteOp {
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } => key,
            WriteOp::Delete { key } => key,
            WriteOp::PutTtl { key, .. } => key,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Typed error surface of the engine and coordinator.
///
/// "Not found" is deliberately absent: `get` returns `Ok(None)` and
/// `delete` returns `Ok(false)`, since an absent or expired key is a
/// normal result, not a failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("corrupt database: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format version {found:#06x} is newer than supported {supported:#06x}")]
    VersionMismatch { found: u16, supported: u16 },

    #[error("timed out waiting for the leader")]
    Timeout,

    #[error("no route to a leader from this handle")]
    NotLeader,

    #[error("engine is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Error::BadInput(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }
}

// ---------------------------------------------------------------------------
// KvApi trait — the client ↔ engine boundary
// ---------------------------------------------------------------------------

/// The facade every storage route implements: the engine itself, the
/// fallback backend, and coordinator clients that proxy to a leader.
/// Async marks where suspension is allowed (file I/O, the bus); the engine
/// core behind it is single-threaded.
#[async_trait]
pub trait KvApi: Send + Sync {
    /// Insert or overwrite, durable on return.
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Insert or overwrite with deferred durability; the op is made durable
    /// by the next `flush`, the next synced write, or `close`.
    async fn put_no_sync(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Insert with an absolute expiry of now + `ttl_ms`.
    async fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl_ms: u64) -> Result<()>;

    /// Returns `None` for absent keys and for entries whose expiry passed.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Returns `true` iff a live (non-expired) entry was removed.
    async fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Atomically applies `{key_len_u32, key, val_len_u32, val}*` pairs from
    /// one buffer; returns the pair count. Malformed framing is rejected
    /// with `BadInput` and no state change.
    async fn put_batch(&self, encoded: &[u8]) -> Result<u64>;

    /// Atomically applies an ordered list of ops as one commit.
    async fn commit_transaction(&self, ops: Vec<WriteOp>) -> Result<()>;

    /// Ascending `(key, value)` pairs with `lo <= key < hi`, up to `limit`,
    /// skipping expired entries.
    async fn scan_range(&self, lo: &[u8], hi: &[u8], limit: usize)
        -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Full CRC and structural walk; returns the ids of bad pages.
    async fn verify_integrity(&self) -> Result<Vec<PageId>>;

    /// Durability barrier for deferred writes.
    async fn flush(&self) -> Result<()>;

    /// Implies `flush`; afterwards every operation returns `Closed`.
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Bus envelopes — the RPC shape followers use to reach the leader
// ---------------------------------------------------------------------------

/// One facade operation, serialized for the message bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Method {
    Put { key: Vec<u8>, value: Vec<u8> },
    PutNoSync { key: Vec<u8>, value: Vec<u8> },
    PutWithTtl { key: Vec<u8>, value: Vec<u8>, ttl_ms: u64 },
    Get { key: Vec<u8> },
    Delete { key: Vec<u8> },
    PutBatch { encoded: Vec<u8> },
    CommitTransaction { ops: Vec<WriteOp> },
    ScanRange { lo: Vec<u8>, hi: Vec<u8>, limit: u64 },
    VerifyIntegrity,
    Flush,
}

/// Successful result payload of a proxied operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    Unit,
    Bool(bool),
    Count(u64),
    Value(Option<Vec<u8>>),
    Pairs(Vec<(Vec<u8>, Vec<u8>)>),
    Pages(Vec<PageId>),
}

/// Error kinds as they cross the bus.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    BadInput,
    Corrupt,
    Io,
    VersionMismatch,
    Timeout,
    NotLeader,
    Closed,
}

/// `{ err, kind, message }` — the wire form of `Error`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        let kind = match e {
            Error::BadInput(_) => ErrorKind::BadInput,
            Error::Corrupt(_) => ErrorKind::Corrupt,
            Error::Io(_) => ErrorKind::Io,
            Error::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Error::Timeout => ErrorKind::Timeout,
            Error::NotLeader => ErrorKind::NotLeader,
            Error::Closed => ErrorKind::Closed,
        };
        WireError { kind, message: e.to_string() }
    }
}

impl From<WireError> for Error {
    fn from(w: WireError) -> Self {
        match w.kind {
            ErrorKind::BadInput => Error::BadInput(w.message),
            ErrorKind::Corrupt => Error::Corrupt(w.message),
            ErrorKind::Io => Error::Io(std::io::Error::other(w.message)),
            ErrorKind::VersionMismatch => Error::VersionMismatch {
                found: 0,
                supported: FORMAT_VERSION,
            },
            ErrorKind::Timeout => Error::Timeout,
            ErrorKind::NotLeader => Error::NotLeader,
            ErrorKind::Closed => Error::Closed,
        }
    }
}

/// Request envelope: `{ req_id, client_id, method }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub req_id: u64,
    pub client_id: u64,
    pub method: Method,
}

/// Response envelope: `{ req_id, client_id, ok | err }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub req_id: u64,
    pub client_id: u64,
    pub result: std::result::Result<Reply, WireError>,
}

/// Execute one enveloped method against any facade. Used by the leader to
/// serve proxied requests; the `Reply` mirrors the method's return shape.
pub async fn dispatch(api: &dyn KvApi, method: Method) -> std::result::Result<Reply, WireError> {
    let result: Result<Reply> = match method {
        Method::Put { key, value } => api.put(&key, &value).await.map(|_| Reply::Unit),
        Method::PutNoSync { key, value } => {
            api.put_no_sync(&key, &value).await.map(|_| Reply::Unit)
        }
        Method::PutWithTtl { key, value, ttl_ms } => {
            api.put_with_ttl(&key, &value, ttl_ms).await.map(|_| Reply::Unit)
        }
        Method::Get { key } => api.get(&key).await.map(Reply::Value),
        Method::Delete { key } => api.delete(&key).await.map(Reply::Bool),
        Method::PutBatch { encoded } => api.put_batch(&encoded).await.map(Reply::Count),
        Method::CommitTransaction { ops } => {
            api.commit_transaction(ops).await.map(|_| Reply::Unit)
        }
        Method::ScanRange { lo, hi, limit } => api
            .scan_range(&lo, &hi, limit as usize)
            .await
            .map(Reply::Pairs),
        Method::VerifyIntegrity => api.verify_integrity().await.map(Reply::Pages),
        Method::Flush => api.flush().await.map(|_| Reply::Unit),
    };
    result.map_err(|e| WireError::from(&e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_op_key() {
        let p = WriteOp::Put { key: b"a".to_vec(), value: b"1".to_vec() };
        let d = WriteOp::Delete { key: b"b".to_vec() };
        let t = WriteOp::PutTtl { key: b"c".to_vec(), value: vec![], expiry_ms: 5 };
        assert_eq!(p.key(), b"a");
        assert_eq!(d.key(), b"b");
        assert_eq!(t.key(), b"c");
    }

    #[test]
    fn test_wire_error_round_trip() {
        let e = Error::bad_input("empty key");
        let w = WireError::from(&e);
        assert_eq!(w.kind, ErrorKind::BadInput);
        match Error::from(w) {
            Error::BadInput(msg) => assert_eq!(msg, "bad input: empty key"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_sentinel_is_meta_page() {
        // NIL_PAGE must never be a valid data page id.
        assert!(META_PAGE_IDS.contains(&NIL_PAGE));
        assert!(FIRST_DATA_PAGE > META_PAGE_IDS[1]);
    }
}
