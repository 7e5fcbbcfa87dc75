use skdb_common::{Error, PageId, Result, NIL_PAGE};

use crate::node::{read_node, Internal, Leaf, Node, ValueRef, MAX_DEPTH};
use crate::session::ReadPages;

struct Frame {
    node: Internal,
    child: usize,
}

/// Ascending scan over `lo <= key < hi` (`hi = None` means unbounded).
///
/// The iterator keeps a stack of internal-node positions and moves to the
/// next leaf by climbing and re-descending, so it never depends on leaf
/// sibling pointers, which copy-on-write can leave stale across commits.
/// Positions are reported as `(leaf_pid, slot)` cursors; a cursor stays
/// resumable for as long as the snapshot it came from is current.
pub struct RangeIter<'a, S: ReadPages> {
    src: &'a S,
    hi: Option<Vec<u8>>,
    stack: Vec<Frame>,
    leaf_pid: PageId,
    leaf: Option<Leaf>,
    slot: usize,
    done: bool,
}

impl<'a, S: ReadPages> RangeIter<'a, S> {
    pub fn new(src: &'a S, root: PageId, lo: &[u8], hi: Option<&[u8]>) -> Result<Self> {
        let mut iter = RangeIter {
            src,
            hi: hi.map(|h| h.to_vec()),
            stack: Vec::new(),
            leaf_pid: NIL_PAGE,
            leaf: None,
            slot: 0,
            done: false,
        };
        let empty_range = matches!(hi, Some(h) if lo >= h);
        if root == NIL_PAGE || empty_range {
            iter.done = true;
            return Ok(iter);
        }
        iter.seek(root, lo)?;
        Ok(iter)
    }

    /// Restart a scan from a `(leaf_pid, slot)` cursor taken from the same
    /// snapshot.
    pub fn resume(
        src: &'a S,
        root: PageId,
        cursor: (PageId, usize),
        hi: Option<&[u8]>,
    ) -> Result<Self> {
        let Node::Leaf(leaf) = read_node(src, cursor.0)? else {
            return Err(Error::corrupt("cursor does not point at a leaf"));
        };
        let entry = leaf
            .entries
            .get(cursor.1)
            .ok_or_else(|| Error::bad_input("cursor slot out of range"))?;
        let key = entry.key.bytes.clone();
        Self::new(src, root, &key, hi)
    }

    /// `(leaf_pid, slot)` of the next entry this iterator would yield.
    pub fn cursor(&self) -> Option<(PageId, usize)> {
        if self.done {
            return None;
        }
        let leaf = self.leaf.as_ref()?;
        (self.slot < leaf.entries.len()).then_some((self.leaf_pid, self.slot))
    }

    fn seek(&mut self, root: PageId, lo: &[u8]) -> Result<()> {
        let mut pid = root;
        for _ in 0..MAX_DEPTH {
            match read_node(self.src, pid)? {
                Node::Internal(node) => {
                    let child = node.child_slot(lo);
                    let next = node.child_at(child);
                    self.stack.push(Frame { node, child });
                    pid = next;
                }
                Node::Leaf(leaf) => {
                    self.slot = match leaf.search(lo) {
                        Ok(i) => i,
                        Err(i) => i,
                    };
                    self.leaf_pid = pid;
                    self.leaf = Some(leaf);
                    return Ok(());
                }
            }
        }
        Err(Error::corrupt("tree deeper than the descent bound"))
    }

    /// Climb to the next unvisited subtree and descend to its leftmost
    /// leaf. Returns false when the tree is exhausted.
    fn advance_leaf(&mut self) -> Result<bool> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(false);
            };
            if top.child + 1 >= top.node.child_count() {
                self.stack.pop();
                continue;
            }
            top.child += 1;
            let mut pid = top.node.child_at(top.child);

            for _ in 0..MAX_DEPTH {
                match read_node(self.src, pid)? {
                    Node::Internal(node) => {
                        let next = node.child_at(0);
                        self.stack.push(Frame { node, child: 0 });
                        pid = next;
                    }
                    Node::Leaf(leaf) => {
                        self.leaf_pid = pid;
                        self.leaf = Some(leaf);
                        self.slot = 0;
                        return Ok(true);
                    }
                }
            }
            return Err(Error::corrupt("tree deeper than the descent bound"));
        }
    }
}

impl<S: ReadPages> Iterator for RangeIter<'_, S> {
    type Item = Result<(Vec<u8>, ValueRef)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let Some(leaf) = &self.leaf else {
                self.done = true;
                return None;
            };
            if self.slot < leaf.entries.len() {
                let entry = &leaf.entries[self.slot];
                if let Some(hi) = &self.hi {
                    if entry.key.bytes.as_slice() >= hi.as_slice() {
                        self.done = true;
                        return None;
                    }
                }
                let item = (entry.key.bytes.clone(), entry.value.clone());
                self.slot += 1;
                return Some(Ok(item));
            }
            match self.advance_leaf() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
