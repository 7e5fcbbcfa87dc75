use std::path::PathBuf;

use skdb_common::{Error, Result, DEFAULT_WAL_SEGMENT_SIZE, MAX_NAME_LEN};

/// Options for opening one database under a base directory.
///
/// The database lives in `<base_dir>/<name>/` as `db.pages`, the `db.wal`
/// segment directory, and the advisory `db.lock` marker.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub name: String,
    pub base_dir: PathBuf,
    pub compression: bool,
    pub encryption_key: Option<Vec<u8>>,
    pub wal_segment_size: u64,
}

impl OpenOptions {
    pub fn new(base_dir: impl Into<PathBuf>, name: impl Into<String>) -> OpenOptions {
        OpenOptions {
            name: name.into(),
            base_dir: base_dir.into(),
            compression: false,
            encryption_key: None,
            wal_segment_size: DEFAULT_WAL_SEGMENT_SIZE,
        }
    }

    pub fn compression(mut self, on: bool) -> OpenOptions {
        self.compression = on;
        self
    }

    pub fn encryption_key(mut self, key: Vec<u8>) -> OpenOptions {
        self.encryption_key = Some(key);
        self
    }

    pub fn wal_segment_size(mut self, bytes: u64) -> OpenOptions {
        self.wal_segment_size = bytes;
        self
    }

    /// Directory holding this database's files.
    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join(&self.name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(Error::BadInput(format!(
                "database name must be 1..={MAX_NAME_LEN} characters"
            )));
        }
        if !self
            .name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(Error::bad_input(
                "database name may only contain [A-Za-z0-9_-]",
            ));
        }
        if self.wal_segment_size == 0 {
            return Err(Error::bad_input("wal segment size must be non-zero"));
        }
        Ok(())
    }
}
