//! SKDB — an embeddable, single-writer, persistent key/value engine:
//! 4 KiB copy-on-write pages with CRC-32C checksums, dual meta pages, a
//! segmented write-ahead log, a B+tree index, per-value TTL, optional LZ4
//! compression and AEAD encryption, a leader coordinator for cooperating
//! clients, and a semantics-preserving fallback backend for hosts where
//! the page-file substrate is unavailable.
//!
//! The ergonomic entry points:
//!
//! * [`Db`] — open one database directly (single client).
//! * [`Coordinator`] — share one database name among several clients with
//!   leader election and request proxying.
//! * [`Storage::open_auto`] — fall back to a [`HostStore`] when the file
//!   substrate cannot be opened.

pub use skdb_common::{
    dispatch, Error, ErrorKind, KvApi, Lsn, Method, PageId, Reply, RequestEnvelope,
    ResponseEnvelope, Result, WireError, WriteOp,
};
pub use skdb_coordinator::{Client, Coordinator, CoordinatorConfig};
pub use skdb_engine::{
    AltBackend, Db, HostOp, HostStore, MemHost, OpenOptions, Storage, Transaction,
};

// The layer crates, for callers that want to reach below the facade.
pub use skdb_codec as codec;
pub use skdb_index as index;
pub use skdb_pagestore as pagestore;
pub use skdb_wal as wal;
