use std::collections::{BTreeMap, HashSet};

use skdb_common::{PageId, META_PAGE_IDS, NIL_PAGE};
use skdb_index::node::{read_node, Node, MAX_DEPTH};
use skdb_index::{ReadPages, Snapshot, ValueRef};
use skdb_pagestore::{Page, PageStore, PageType};

/// Full CRC and structural walk: both meta slots, the tree from the root,
/// every overflow chain hanging off it, and the free-list. Returns the ids
/// of pages that fail their checksum or violate structure; nothing is
/// repaired.
pub(crate) fn scan(
    store: &PageStore,
    pending: &BTreeMap<PageId, Page>,
    root: PageId,
) -> Vec<PageId> {
    let snap = Snapshot::new(store, pending);
    let mut bad = Vec::new();
    let mut seen = HashSet::new();
    let mut last_key: Option<Vec<u8>> = None;

    for pid in META_PAGE_IDS {
        match store.read_unverified(pid) {
            Ok(page) if page.page_type() == Some(PageType::Meta) && page.crc_ok() => {}
            _ => bad.push(pid),
        }
    }

    walk_node(&snap, root, 0, &mut seen, &mut bad, &mut last_key);

    for pid in store.free_pages() {
        if pending.contains_key(&pid) {
            continue;
        }
        match store.read_unverified(pid) {
            Ok(page) if page.page_type() == Some(PageType::FreeList) && page.crc_ok() => {}
            _ => bad.push(pid),
        }
    }

    bad.sort_unstable();
    bad.dedup();
    bad
}

fn walk_node(
    snap: &Snapshot<'_>,
    pid: PageId,
    depth: usize,
    seen: &mut HashSet<PageId>,
    bad: &mut Vec<PageId>,
    last_key: &mut Option<Vec<u8>>,
) {
    if pid == NIL_PAGE {
        return;
    }
    if depth > MAX_DEPTH || !seen.insert(pid) {
        bad.push(pid);
        return;
    }
    let node = match read_node(snap, pid) {
        Ok(node) => node,
        Err(_) => {
            bad.push(pid);
            return;
        }
    };
    match node {
        Node::Leaf(leaf) => {
            for entry in &leaf.entries {
                // Global ascending order across the whole key space.
                if let Some(prev) = last_key.as_deref() {
                    if entry.key.bytes.as_slice() <= prev {
                        bad.push(pid);
                    }
                }
                *last_key = Some(entry.key.bytes.clone());

                if let Some(spill) = entry.key.spill {
                    walk_chain(snap, spill, Some(entry.key.bytes.len()), seen, bad);
                }
                if let ValueRef::Chain { head, len } = &entry.value {
                    walk_chain(snap, *head, Some(*len as usize), seen, bad);
                }
            }
        }
        Node::Internal(node) => {
            for entry in &node.entries {
                if let Some(spill) = entry.sep.spill {
                    walk_chain(snap, spill, Some(entry.sep.bytes.len()), seen, bad);
                }
            }
            for slot in 0..node.child_count() {
                walk_node(snap, node.child_at(slot), depth + 1, seen, bad, last_key);
            }
        }
    }
}

fn walk_chain(
    snap: &Snapshot<'_>,
    head: PageId,
    expected_len: Option<usize>,
    seen: &mut HashSet<PageId>,
    bad: &mut Vec<PageId>,
) {
    let mut pid = head;
    let mut total = 0usize;
    while pid != NIL_PAGE {
        if !seen.insert(pid) {
            bad.push(pid);
            return;
        }
        let page = match snap.load(pid) {
            Ok(page) => page,
            Err(_) => {
                bad.push(pid);
                return;
            }
        };
        if page.page_type() != Some(PageType::Overflow) || page.payload().len() < 4 {
            bad.push(pid);
            return;
        }
        total += page.payload().len() - 4;
        pid = PageId::from_le_bytes(page.payload()[0..4].try_into().unwrap());
    }
    if let Some(expected) = expected_len {
        if total != expected {
            bad.push(head);
        }
    }
}
