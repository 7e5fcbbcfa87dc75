use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use skdb_common::{Lsn, Result, TxId, WriteOp};
use tracing::{debug, info};

use crate::record::{encode_record, read_record, ReadOutcome};

const SEGMENT_PREFIX: &str = "wal-";

/// Append side of the log: buffered writes into the active segment,
/// rotation at the configured byte budget, and whole-segment truncation
/// once a checkpoint has advanced the durable LSN past a segment.
pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    active_id: u64,
    writer: BufWriter<File>,
    active_bytes: u64,
    next_lsn: Lsn,
}

impl Wal {
    /// Open the log directory for appending. Recovery (`replay`) runs
    /// before this and leaves the active segment ending at a valid record,
    /// so appending always continues from a clean tail.
    pub fn open(dir: &Path, segment_size: u64, next_lsn: Lsn) -> Result<Wal> {
        fs::create_dir_all(dir)?;
        let segments = list_segments(dir)?;
        let active_id = segments.last().copied().unwrap_or(1);
        let path = segment_path(dir, active_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let active_bytes = file.metadata()?.len();
        Ok(Wal {
            dir: dir.to_path_buf(),
            segment_size,
            active_id,
            writer: BufWriter::new(file),
            active_bytes,
            next_lsn,
        })
    }

    /// Buffer one record and return its LSN. Durable only after `flush`.
    pub fn append(&mut self, tx_id: TxId, ops: &[WriteOp]) -> Result<Lsn> {
        let lsn = self.next_lsn;
        let bytes = encode_record(lsn, tx_id, ops);

        if self.active_bytes > 0 && self.active_bytes + bytes.len() as u64 > self.segment_size {
            self.rotate()?;
        }

        self.writer.write_all(&bytes)?;
        self.active_bytes += bytes.len() as u64;
        self.next_lsn += 1;
        Ok(lsn)
    }

    /// Force everything appended so far onto stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Highest LSN ever assigned (0 if none).
    pub fn last_lsn(&self) -> Lsn {
        self.next_lsn - 1
    }

    /// Delete whole segments whose records are all at or below `durable`.
    /// The active segment is never deleted.
    pub fn truncate_upto(&mut self, durable: Lsn) -> Result<()> {
        let segments = list_segments(&self.dir)?;
        for window in segments.windows(2) {
            let (seg, next_seg) = (window[0], window[1]);
            if seg == self.active_id {
                break;
            }
            // All of `seg`'s records precede the first record of the next
            // segment; LSNs are contiguous.
            let next_first = segment_first_lsn(&segment_path(&self.dir, next_seg))?
                .unwrap_or(self.next_lsn);
            if next_first <= durable + 1 {
                let path = segment_path(&self.dir, seg);
                fs::remove_file(&path)?;
                info!(segment = seg, durable, "wal segment discarded");
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Seal the active segment and start the next one.
    fn rotate(&mut self) -> Result<()> {
        self.flush()?;
        let new_id = self.active_id + 1;
        let path = segment_path(&self.dir, new_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(segment = new_id, "wal segment rotated");
        self.writer = BufWriter::new(file);
        self.active_id = new_id;
        self.active_bytes = 0;
        Ok(())
    }
}

/// Path of the 1-based, zero-padded segment file.
pub(crate) fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{id:010}"))
}

/// Sorted ids of the segment files present in the log directory.
pub(crate) fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(digits) = name.strip_prefix(SEGMENT_PREFIX) {
            if digits.len() == 10 {
                if let Ok(id) = digits.parse::<u64>() {
                    ids.push(id);
                }
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// LSN of the first record in a segment, or `None` for an empty segment.
pub(crate) fn segment_first_lsn(path: &Path) -> Result<Option<Lsn>> {
    let mut file = File::open(path)?;
    match read_record(&mut file)? {
        ReadOutcome::Record(rec) => Ok(Some(rec.lsn)),
        _ => Ok(None),
    }
}
