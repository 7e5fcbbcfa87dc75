use std::fs::{self, OpenOptions};
use std::io::Cursor;
use std::path::Path;

use skdb_common::{Lsn, Result};
use tracing::{info, warn};

use crate::record::{read_record, ReadOutcome, WalRecord};
use crate::wal::{list_segments, segment_path};

/// Replay the log forward, applying every record with `lsn > from_lsn`.
///
/// Each record's CRC is validated; LSNs must be contiguous. At the first
/// invalid record the scan stops, the containing segment is physically
/// truncated at the last valid byte, any later segments are deleted, and
/// everything past that point is treated as never written. Returns the
/// last valid LSN (which is `from_lsn` if the log holds nothing newer).
pub fn replay<F>(dir: &Path, from_lsn: Lsn, mut apply: F) -> Result<Lsn>
where
    F: FnMut(&WalRecord) -> Result<()>,
{
    if !dir.exists() {
        return Ok(from_lsn);
    }

    let segments = list_segments(dir)?;
    let mut last_valid = from_lsn;
    let mut next_expected: Option<Lsn> = None;
    let mut applied = 0u64;

    for (idx, &seg) in segments.iter().enumerate() {
        let path = segment_path(dir, seg);
        let data = fs::read(&path)?;
        let mut cursor = Cursor::new(data.as_slice());

        loop {
            let start = cursor.position();
            let outcome = read_record(&mut cursor)?;
            let record = match outcome {
                ReadOutcome::Record(record) => record,
                ReadOutcome::Eof => break,
                ReadOutcome::Invalid => {
                    truncate_tail(dir, &segments[idx..], &path, start)?;
                    return finish(last_valid, applied);
                }
            };

            // A gap or repeat in the LSN sequence means the tail does not
            // belong to this log's history.
            let in_sequence = match next_expected {
                Some(expected) => record.lsn == expected,
                None => record.lsn <= from_lsn + 1,
            };
            if !in_sequence {
                warn!(lsn = record.lsn, "out-of-sequence wal record");
                truncate_tail(dir, &segments[idx..], &path, start)?;
                return finish(last_valid, applied);
            }
            next_expected = Some(record.lsn + 1);

            if record.lsn > from_lsn {
                apply(&record)?;
                applied += 1;
            }
            last_valid = last_valid.max(record.lsn);
        }
    }

    finish(last_valid, applied)
}

fn finish(last_valid: Lsn, applied: u64) -> Result<Lsn> {
    if applied > 0 {
        info!(applied, last_valid, "wal replay applied records");
    }
    Ok(last_valid)
}

/// Cut the torn tail: truncate the current segment at `valid_end` and
/// remove every later segment.
fn truncate_tail(dir: &Path, tail_segments: &[u64], current: &Path, valid_end: u64) -> Result<()> {
    warn!(segment = ?current, valid_end, "torn wal tail, truncating");
    let file = OpenOptions::new().write(true).open(current)?;
    file.set_len(valid_end)?;
    file.sync_all()?;
    for &seg in &tail_segments[1..] {
        fs::remove_file(segment_path(dir, seg))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::Wal;
    use skdb_common::{TxId, WriteOp};
    use tempfile::TempDir;

    fn put(n: u8) -> Vec<WriteOp> {
        vec![WriteOp::Put { key: vec![n], value: vec![n; 8] }]
    }

    fn fill(dir: &Path, segment_size: u64, count: u64) {
        let mut wal = Wal::open(dir, segment_size, 1).unwrap();
        for i in 1..=count {
            wal.append(i as TxId, &put(i as u8)).unwrap();
        }
        wal.flush().unwrap();
    }

    #[test]
    fn test_replay_applies_everything_after_watermark() {
        let dir = TempDir::new().unwrap();
        fill(dir.path(), 1 << 20, 5);

        let mut seen = Vec::new();
        let last = replay(dir.path(), 2, |rec| {
            seen.push(rec.lsn);
            Ok(())
        })
        .unwrap();

        assert_eq!(last, 5);
        assert_eq!(seen, vec![3, 4, 5]);
    }

    #[test]
    fn test_replay_empty_log() {
        let dir = TempDir::new().unwrap();
        let last = replay(dir.path(), 7, |_| panic!("nothing to apply")).unwrap();
        assert_eq!(last, 7);
    }

    #[test]
    fn test_torn_tail_truncated_and_ignored() {
        let dir = TempDir::new().unwrap();
        fill(dir.path(), 1 << 20, 3);

        // Chop the last record in half.
        let path = segment_path(dir.path(), 1);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 7).unwrap();
        drop(file);

        let mut seen = Vec::new();
        let last = replay(dir.path(), 0, |rec| {
            seen.push(rec.lsn);
            Ok(())
        })
        .unwrap();
        assert_eq!(last, 2);
        assert_eq!(seen, vec![1, 2]);

        // A second replay sees a clean log ending at the same LSN.
        let last = replay(dir.path(), 2, |_| panic!("tail should be gone")).unwrap();
        assert_eq!(last, 2);
    }

    #[test]
    fn test_corrupt_record_drops_later_segments() {
        let dir = TempDir::new().unwrap();
        // Small budget: one record per segment.
        fill(dir.path(), 16, 3);
        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 3);

        // Corrupt the second segment's record body.
        let path = segment_path(dir.path(), segments[1]);
        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let mut seen = Vec::new();
        let last = replay(dir.path(), 0, |rec| {
            seen.push(rec.lsn);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1]);
        assert_eq!(last, 1);
        // Segment 3 was discarded along with the torn one.
        assert_eq!(list_segments(dir.path()).unwrap(), vec![segments[0], segments[1]]);
    }

    #[test]
    fn test_append_resumes_after_replay_truncation() {
        let dir = TempDir::new().unwrap();
        fill(dir.path(), 1 << 20, 2);

        let path = segment_path(dir.path(), 1);
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();

        let last = replay(dir.path(), 0, |_| Ok(())).unwrap();
        assert_eq!(last, 1);

        let mut wal = Wal::open(dir.path(), 1 << 20, last + 1).unwrap();
        wal.append(9, &put(9)).unwrap();
        wal.flush().unwrap();

        let mut seen = Vec::new();
        replay(dir.path(), 0, |rec| {
            seen.push(rec.lsn);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }
}
