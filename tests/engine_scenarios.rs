use std::io::Write;
use std::path::{Path, PathBuf};

use skdb::{Db, Error, KvApi, OpenOptions, WriteOp};
use skdb_wal::record::encode_record;
use tempfile::TempDir;

fn open(dir: &TempDir, name: &str) -> Db {
    Db::open(OpenOptions::new(dir.path(), name)).unwrap()
}

fn wal_dir(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name).join("db.wal")
}

fn active_segment(wal_dir: &Path) -> PathBuf {
    let mut segments: Vec<_> = std::fs::read_dir(wal_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    segments.sort();
    segments.pop().unwrap()
}

fn append_record(path: &Path, bytes: &[u8]) {
    let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

// =========================================================================
// Basic put/get/delete lifecycle
// =========================================================================
#[tokio::test]
async fn test_basic_put_get_delete() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "t1");

    db.put(b"a", b"1").await.unwrap();
    assert_eq!(db.get(b"a").await.unwrap().unwrap(), b"1");
    assert!(db.delete(b"a").await.unwrap());
    assert_eq!(db.get(b"a").await.unwrap(), None);
    assert!(!db.delete(b"a").await.unwrap());

    db.close().await.unwrap();
}

// =========================================================================
// Atomic multi-op transaction, including a crash injected after the
// WAL flush but before the meta sync
// =========================================================================
#[tokio::test]
async fn test_atomic_transaction() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "t2");

    db.commit_transaction(vec![
        WriteOp::Put { key: b"x".to_vec(), value: b"1".to_vec() },
        WriteOp::Put { key: b"y".to_vec(), value: b"2".to_vec() },
        WriteOp::Delete { key: b"z".to_vec() },
    ])
    .await
    .unwrap();

    assert_eq!(db.get(b"x").await.unwrap().unwrap(), b"1");
    assert_eq!(db.get(b"y").await.unwrap().unwrap(), b"2");
    assert_eq!(db.get(b"z").await.unwrap(), None);
    let durable = db.durable_lsn();
    db.close().await.unwrap();

    // Crash injection: the next transaction reached the log but never got
    // its meta sync. Reopen must replay it in full.
    let record = encode_record(
        durable + 1,
        77,
        &[
            WriteOp::Put { key: b"p".to_vec(), value: b"3".to_vec() },
            WriteOp::Delete { key: b"x".to_vec() },
        ],
    );
    append_record(&active_segment(&wal_dir(&dir, "t2")), &record);

    let db = open(&dir, "t2");
    assert_eq!(db.get(b"p").await.unwrap().unwrap(), b"3");
    assert_eq!(db.get(b"x").await.unwrap(), None);
    assert_eq!(db.get(b"y").await.unwrap().unwrap(), b"2");
    assert!(db.verify_integrity().await.unwrap().is_empty());
}

// =========================================================================
// TTL expiry
// =========================================================================
#[tokio::test]
async fn test_ttl_expiry() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "t3");

    db.put_with_ttl(b"k", b"v", 50).await.unwrap();
    assert_eq!(db.get(b"k").await.unwrap().unwrap(), b"v");

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(db.get(b"k").await.unwrap(), None);
    assert!(db.scan_range(b"k", b"k\0", 10).await.unwrap().is_empty());
}

// =========================================================================
// Ordered scan
// =========================================================================
#[tokio::test]
async fn test_ordered_scan() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "t4");

    for key in [b"b".as_slice(), b"a", b"c"] {
        db.put(key, key).await.unwrap();
    }
    let pairs = db.scan_range(b"a", b"d", 10).await.unwrap();
    let keys: Vec<_> = pairs.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![b"a".as_slice(), b"b", b"c"]);
}

// =========================================================================
// Batch atomicity: all ten thousand entries or none
// =========================================================================
#[tokio::test]
async fn test_batch_atomicity() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "t6");

    let mut buf = Vec::new();
    for i in 0..10_000u32 {
        let key = format!("batch-{i:05}");
        let value = format!("value-{i}");
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    assert_eq!(db.put_batch(&buf).await.unwrap(), 10_000);
    assert_eq!(db.get(b"batch-00000").await.unwrap().unwrap(), b"value-0");
    assert_eq!(db.get(b"batch-09999").await.unwrap().unwrap(), b"value-9999");
    assert_eq!(
        db.scan_range(b"batch-", b"batch-~", usize::MAX).await.unwrap().len(),
        10_000
    );
    let durable = db.durable_lsn();
    db.close().await.unwrap();

    // Crash mid-apply: a second batch reaches the log but is torn. After
    // reopen, none of it is visible and the first batch is intact.
    let ops: Vec<WriteOp> = (0..1000u32)
        .map(|i| WriteOp::Put {
            key: format!("torn-{i:05}").into_bytes(),
            value: b"x".to_vec(),
        })
        .collect();
    let record = encode_record(durable + 1, 78, &ops);
    let cut = record.len() / 2;
    append_record(&active_segment(&wal_dir(&dir, "t6")), &record[..cut]);

    let db = open(&dir, "t6");
    assert!(db.scan_range(b"torn-", b"torn-~", usize::MAX).await.unwrap().is_empty());
    assert_eq!(
        db.scan_range(b"batch-", b"batch-~", usize::MAX).await.unwrap().len(),
        10_000
    );
    assert!(db.verify_integrity().await.unwrap().is_empty());
}

// =========================================================================
// Malformed batch input: BadInput, no state change
// =========================================================================
#[tokio::test]
async fn test_malformed_batch_rejected() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "badbatch");
    db.put(b"keep", b"me").await.unwrap();

    let mut buf = Vec::new();
    buf.extend_from_slice(&(4u32).to_le_bytes());
    buf.extend_from_slice(b"good");
    buf.extend_from_slice(&(1u32).to_le_bytes());
    buf.extend_from_slice(b"v");
    buf.extend_from_slice(&(99u32).to_le_bytes()); // truncated second record
    buf.extend_from_slice(b"oops");

    assert!(matches!(db.put_batch(&buf).await, Err(Error::BadInput(_))));
    assert_eq!(db.get(b"good").await.unwrap(), None);
    assert_eq!(db.get(b"keep").await.unwrap().unwrap(), b"me");
}

// =========================================================================
// Idempotent open: open/close with no writes leaves the files untouched
// =========================================================================
#[tokio::test]
async fn test_idempotent_open() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(&dir, "idem");
        db.put(b"k", b"v").await.unwrap();
        db.close().await.unwrap();
    }
    let pages_path = dir.path().join("idem").join("db.pages");
    let before_pages = std::fs::read(&pages_path).unwrap();
    let before_wal = std::fs::read(active_segment(&wal_dir(&dir, "idem"))).unwrap();

    {
        let db = open(&dir, "idem");
        assert_eq!(db.get(b"k").await.unwrap().unwrap(), b"v");
        db.close().await.unwrap();
    }
    assert_eq!(std::fs::read(&pages_path).unwrap(), before_pages);
    assert_eq!(
        std::fs::read(active_segment(&wal_dir(&dir, "idem"))).unwrap(),
        before_wal
    );
}

// =========================================================================
// Torn WAL tail: the half-written record is discarded, earlier state holds
// =========================================================================
#[tokio::test]
async fn test_torn_tail_discarded() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(&dir, "torn");
        db.put(b"safe", b"1").await.unwrap();
        db.close().await.unwrap();
    }
    let segment = active_segment(&wal_dir(&dir, "torn"));
    append_record(&segment, &[0xDE, 0xAD, 0xBE]);

    let db = open(&dir, "torn");
    assert_eq!(db.get(b"safe").await.unwrap().unwrap(), b"1");
    assert!(db.verify_integrity().await.unwrap().is_empty());
    // The garbage is gone: reopening again sees a clean log.
    db.close().await.unwrap();
    let db = open(&dir, "torn");
    assert_eq!(db.get(b"safe").await.unwrap().unwrap(), b"1");
}

// =========================================================================
// Meta redundancy: one corrupted meta copy is survivable
// =========================================================================
#[tokio::test]
async fn test_surviving_one_bad_meta_copy() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(&dir, "meta");
        db.put(b"k", b"v").await.unwrap();
        db.close().await.unwrap();
    }
    let pages_path = dir.path().join("meta").join("db.pages");
    let mut bytes = std::fs::read(&pages_path).unwrap();
    // Trash the first meta copy (page 0) entirely.
    for b in bytes.iter_mut().take(4096) {
        *b = 0xCC;
    }
    std::fs::write(&pages_path, &bytes).unwrap();

    let db = open(&dir, "meta");
    assert_eq!(db.get(b"k").await.unwrap().unwrap(), b"v");
}

// =========================================================================
// Version gate: a newer format version refuses to open
// =========================================================================
#[tokio::test]
async fn test_newer_version_refused() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(&dir, "vers");
        db.put(b"k", b"v").await.unwrap();
        db.close().await.unwrap();
    }
    let pages_path = dir.path().join("vers").join("db.pages");
    let mut bytes = std::fs::read(&pages_path).unwrap();
    // Bump the version field in both meta payloads and refresh nothing
    // else: both copies now decode as "too new".
    for slot in 0..2usize {
        let payload = slot * 4096 + 16;
        let version = u16::from_le_bytes([bytes[payload + 4], bytes[payload + 5]]);
        bytes[payload + 4..payload + 6].copy_from_slice(&(version + 1).to_le_bytes());
        // Recompute the page CRC so only the version is "wrong".
        let crc = {
            let page = &bytes[slot * 4096..(slot + 1) * 4096];
            let mut full = page.to_vec();
            full[12..16].fill(0);
            crc32c::crc32c(&full)
        };
        bytes[slot * 4096 + 12..slot * 4096 + 16].copy_from_slice(&crc.to_le_bytes());
    }
    std::fs::write(&pages_path, &bytes).unwrap();

    match Db::open(OpenOptions::new(dir.path(), "vers")) {
        Err(Error::VersionMismatch { .. }) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

// =========================================================================
// Large keys and values take the overflow paths and survive reopen
// =========================================================================
#[tokio::test]
async fn test_large_keys_and_values_persist() {
    let dir = TempDir::new().unwrap();
    let big_key = vec![b'K'; 4096];
    let big_value = vec![b'V'; 250_000];
    {
        let db = open(&dir, "large");
        db.put(&big_key, &big_value).await.unwrap();
        db.put(b"small", b"s").await.unwrap();
        db.close().await.unwrap();
    }
    let db = open(&dir, "large");
    assert_eq!(db.get(&big_key).await.unwrap().unwrap(), big_value);
    assert_eq!(db.get(b"small").await.unwrap().unwrap(), b"s");
    assert!(db.verify_integrity().await.unwrap().is_empty());

    assert!(db.delete(&big_key).await.unwrap());
    assert_eq!(db.get(&big_key).await.unwrap(), None);
    assert!(db.verify_integrity().await.unwrap().is_empty());
}
