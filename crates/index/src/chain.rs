use skdb_common::{Error, PageId, Result, NIL_PAGE, PAGE_PAYLOAD_SIZE};
use skdb_pagestore::{Page, PageType};

use crate::session::{CowSession, ReadPages};

/// Overflow page payload: `next_pid_u32 || chunk`.
pub const CHAIN_CHUNK: usize = PAGE_PAYLOAD_SIZE - 4;

/// Store `bytes` as a chain of overflow pages; returns the head id.
pub fn write_chain(sess: &mut CowSession<'_>, bytes: &[u8]) -> Result<PageId> {
    let mut next = NIL_PAGE;
    // Built back to front so every page already knows its successor.
    for chunk in bytes.chunks(CHAIN_CHUNK).rev() {
        let mut payload = Vec::with_capacity(4 + chunk.len());
        payload.extend_from_slice(&next.to_le_bytes());
        payload.extend_from_slice(chunk);
        let mut page = Page::new(PageType::Overflow);
        page.set_payload(&payload);
        next = sess.write_new(page)?;
    }
    Ok(next)
}

/// Read back exactly `len` bytes from the chain at `head`.
pub fn read_chain(src: &impl ReadPages, head: PageId, len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut pid = head;
    while pid != NIL_PAGE {
        if out.len() >= len {
            return Err(Error::corrupt("overflow chain longer than its value"));
        }
        let page = src.load(pid)?;
        if page.page_type() != Some(PageType::Overflow) {
            return Err(Error::Corrupt(format!("page {pid} is not an overflow page")));
        }
        let payload = page.payload();
        if payload.len() < 4 {
            return Err(Error::Corrupt(format!("overflow page {pid} too short")));
        }
        out.extend_from_slice(&payload[4..]);
        pid = PageId::from_le_bytes(payload[0..4].try_into().unwrap());
    }
    if out.len() != len {
        return Err(Error::Corrupt(format!(
            "overflow chain holds {} bytes, expected {len}",
            out.len()
        )));
    }
    Ok(out)
}

/// Unlink every page of the chain at `head`.
pub fn free_chain(sess: &mut CowSession<'_>, head: PageId) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    let mut pid = head;
    while pid != NIL_PAGE {
        if !seen.insert(pid) {
            return Err(Error::Corrupt(format!("overflow chain cycles at page {pid}")));
        }
        let page = sess.load(pid)?;
        if page.page_type() != Some(PageType::Overflow) {
            return Err(Error::Corrupt(format!("page {pid} is not an overflow page")));
        }
        let next = PageId::from_le_bytes(page.payload()[0..4].try_into().unwrap());
        sess.free(pid);
        pid = next;
    }
    Ok(())
}
