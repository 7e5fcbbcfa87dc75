use std::collections::{BTreeMap, HashSet};

use skdb_common::{Lsn, PageId, Result};
use skdb_pagestore::{Page, PageStore};

/// Read access to pages through whatever overlays sit above the file.
pub trait ReadPages {
    fn load(&self, pid: PageId) -> Result<Page>;
}

/// Read-only view for lookups and scans: the engine's not-yet-checkpointed
/// overlay in front of the page file.
pub struct Snapshot<'a> {
    store: &'a PageStore,
    overlay: &'a BTreeMap<PageId, Page>,
}

impl<'a> Snapshot<'a> {
    pub fn new(store: &'a PageStore, overlay: &'a BTreeMap<PageId, Page>) -> Self {
        Snapshot { store, overlay }
    }
}

impl ReadPages for Snapshot<'_> {
    fn load(&self, pid: PageId) -> Result<Page> {
        if let Some(page) = self.overlay.get(&pid) {
            return Ok(page.clone());
        }
        self.store.read(pid)
    }
}

/// One transaction's copy-on-write workspace.
///
/// Every page dirtied by the transaction goes to a newly allocated id and
/// lives here until the engine merges it into its overlay; the page ids the
/// transaction unlinked collect in `freed` and reach the free-list only
/// after the commit's meta is durable. Pages both allocated and unlinked
/// inside the same session never existed on disk, so their ids are simply
/// recycled for the session's later writes. Allocation pops never write,
/// so an abandoned session leaves the file untouched.
pub struct CowSession<'a> {
    store: &'a mut PageStore,
    base: &'a BTreeMap<PageId, Page>,
    lsn: Lsn,
    dirty: BTreeMap<PageId, Page>,
    freed: Vec<PageId>,
    allocated: HashSet<PageId>,
    recycled: Vec<PageId>,
}

impl<'a> CowSession<'a> {
    pub fn new(store: &'a mut PageStore, base: &'a BTreeMap<PageId, Page>, lsn: Lsn) -> Self {
        CowSession {
            store,
            base,
            lsn,
            dirty: BTreeMap::new(),
            freed: Vec::new(),
            allocated: HashSet::new(),
            recycled: Vec::new(),
        }
    }

    /// Write a page under a freshly allocated (or session-recycled) id,
    /// stamped with the transaction's LSN.
    pub fn write_new(&mut self, mut page: Page) -> Result<PageId> {
        let pid = match self.recycled.pop() {
            Some(pid) => pid,
            None => {
                let pid = self.store.allocate()?;
                self.allocated.insert(pid);
                pid
            }
        };
        page.set_lsn(self.lsn);
        page.seal();
        self.dirty.insert(pid, page);
        Ok(pid)
    }

    /// Unlink a page. A page this session itself created is recycled in
    /// place; anything older joins the free set.
    pub fn free(&mut self, pid: PageId) {
        if self.allocated.contains(&pid) {
            self.dirty.remove(&pid);
            self.recycled.push(pid);
        } else {
            self.freed.push(pid);
        }
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// Tear down into (dirty pages, freed ids) for the engine to merge.
    /// Leftover recycled ids were allocated but never written, so they go
    /// through the free set like everything else.
    pub fn into_parts(mut self) -> (BTreeMap<PageId, Page>, Vec<PageId>) {
        self.freed.append(&mut self.recycled);
        (self.dirty, self.freed)
    }
}

impl ReadPages for CowSession<'_> {
    fn load(&self, pid: PageId) -> Result<Page> {
        if let Some(page) = self.dirty.get(&pid) {
            return Ok(page.clone());
        }
        if let Some(page) = self.base.get(&pid) {
            return Ok(page.clone());
        }
        self.store.read(pid)
    }
}
