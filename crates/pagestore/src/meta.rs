use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use skdb_common::{
    Error, Lsn, PageId, Result, FIRST_DATA_PAGE, FORMAT_VERSION, MAGIC, NIL_PAGE, PAGE_SIZE,
};
use tracing::warn;

use crate::page::{Page, PageType};

const FLAG_COMPRESSION_DEFAULT: u32 = 1 << 0;
const FLAG_ENCRYPTION_ENABLED: u32 = 1 << 1;

// magic(4) + version(2) + root(4) + free_head(4) + next_pid(4) + lsn(8) + flags(4)
const META_BODY_LEN: usize = 30;

/// The durability watermark page: root pointer, free-list head, allocation
/// high-water mark, and the last durable LSN. Two copies alternate at page
/// ids 0 and 1; the valid copy with the higher LSN wins on open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Meta {
    pub root: PageId,
    pub free_head: PageId,
    pub next_pid: PageId,
    pub last_durable_lsn: Lsn,
    pub compression_default: bool,
    pub encryption_enabled: bool,
}

impl Meta {
    pub fn new_empty(compression_default: bool, encryption_enabled: bool) -> Self {
        Meta {
            root: NIL_PAGE,
            free_head: NIL_PAGE,
            next_pid: FIRST_DATA_PAGE,
            last_durable_lsn: 0,
            compression_default,
            encryption_enabled,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(META_BODY_LEN);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.root.to_le_bytes());
        buf.extend_from_slice(&self.free_head.to_le_bytes());
        buf.extend_from_slice(&self.next_pid.to_le_bytes());
        buf.extend_from_slice(&self.last_durable_lsn.to_le_bytes());
        let mut flags = 0u32;
        if self.compression_default {
            flags |= FLAG_COMPRESSION_DEFAULT;
        }
        if self.encryption_enabled {
            flags |= FLAG_ENCRYPTION_ENABLED;
        }
        buf.extend_from_slice(&flags.to_le_bytes());
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Meta> {
        if body.len() < META_BODY_LEN {
            return Err(Error::corrupt("meta body too short"));
        }
        if body[0..4] != MAGIC {
            return Err(Error::corrupt("bad meta magic"));
        }
        let version = u16::from_le_bytes(body[4..6].try_into().unwrap());
        if version > FORMAT_VERSION {
            return Err(Error::VersionMismatch { found: version, supported: FORMAT_VERSION });
        }
        let root = PageId::from_le_bytes(body[6..10].try_into().unwrap());
        let free_head = PageId::from_le_bytes(body[10..14].try_into().unwrap());
        let next_pid = PageId::from_le_bytes(body[14..18].try_into().unwrap());
        let last_durable_lsn = Lsn::from_le_bytes(body[18..26].try_into().unwrap());
        let flags = u32::from_le_bytes(body[26..30].try_into().unwrap());
        Ok(Meta {
            root,
            free_head,
            next_pid,
            last_durable_lsn,
            compression_default: flags & FLAG_COMPRESSION_DEFAULT != 0,
            encryption_enabled: flags & FLAG_ENCRYPTION_ENABLED != 0,
        })
    }

    /// Build the sealed page image for this meta.
    pub fn to_page(&self) -> Page {
        let mut page = Page::new(PageType::Meta);
        page.set_payload(&self.encode());
        page.set_lsn(self.last_durable_lsn);
        page.seal();
        page
    }
}

/// Read both meta slots straight from the page file and pick the winner.
/// Returns the chosen meta and its slot index. A copy with a bad CRC or
/// magic is skipped; a valid copy with a newer format version fails the
/// open outright.
pub fn load_meta(path: &Path) -> Result<(Meta, usize)> {
    let file = File::open(path)?;
    let mut best: Option<(Meta, usize)> = None;

    for slot in 0..2usize {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        if let Err(e) = file.read_exact_at(buf.as_mut(), (slot * PAGE_SIZE) as u64) {
            warn!(slot, error = %e, "meta slot unreadable");
            continue;
        }
        let page = Page::from_bytes(buf);
        if page.page_type() != Some(PageType::Meta) || !page.crc_ok() {
            warn!(slot, "meta slot invalid, skipping");
            continue;
        }
        let meta = match Meta::decode(page.payload()) {
            Ok(meta) => meta,
            Err(e @ Error::VersionMismatch { .. }) => return Err(e),
            Err(e) => {
                warn!(slot, error = %e, "meta slot undecodable, skipping");
                continue;
            }
        };
        let better = match &best {
            None => true,
            Some((b, _)) => meta.last_durable_lsn > b.last_durable_lsn,
        };
        if better {
            best = Some((meta, slot));
        }
    }

    best.ok_or_else(|| Error::corrupt("no valid meta page"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let meta = Meta {
            root: 7,
            free_head: 9,
            next_pid: 20,
            last_durable_lsn: 1234,
            compression_default: true,
            encryption_enabled: false,
        };
        let decoded = Meta::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut body = Meta::new_empty(false, false).encode();
        body[0] = b'X';
        assert!(matches!(Meta::decode(&body), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut body = Meta::new_empty(false, false).encode();
        body[4..6].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
        assert!(matches!(
            Meta::decode(&body),
            Err(Error::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_meta_page_sealed() {
        let meta = Meta::new_empty(false, true);
        let page = meta.to_page();
        assert!(page.crc_ok());
        assert_eq!(page.page_type(), Some(PageType::Meta));
        assert_eq!(Meta::decode(page.payload()).unwrap(), meta);
    }
}
