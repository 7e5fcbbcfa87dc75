use skdb_common::{Error, PageId, Result, NIL_PAGE};
use tracing::trace;

use crate::chain::free_chain;
use crate::node::{
    read_node, write_node, Internal, InternalEntry, Leaf, LeafEntry, Node, NodeKey, ValueRef,
    MAX_DEPTH, NODE_CAPACITY, NODE_MIN_FILL,
};
use crate::session::{CowSession, ReadPages};

/// Find the descriptor for `key`, if any.
pub fn lookup(src: &impl ReadPages, root: PageId, key: &[u8]) -> Result<Option<ValueRef>> {
    if root == NIL_PAGE {
        return Ok(None);
    }
    let mut pid = root;
    for _ in 0..MAX_DEPTH {
        match read_node(src, pid)? {
            Node::Internal(node) => pid = node.child_at(node.child_slot(key)),
            Node::Leaf(leaf) => {
                return Ok(leaf.search(key).ok().map(|i| leaf.entries[i].value.clone()));
            }
        }
    }
    Err(Error::corrupt("tree deeper than the descent bound"))
}

struct Inserted {
    pid: PageId,
    split: Option<(NodeKey, PageId)>,
    replaced: Option<ValueRef>,
}

/// Insert or replace `key`. Returns the new root and, when the key already
/// existed, the replaced descriptor (the caller owns freeing its chain).
pub fn insert(
    sess: &mut CowSession<'_>,
    root: PageId,
    key: &[u8],
    value: ValueRef,
) -> Result<(PageId, Option<ValueRef>)> {
    if root == NIL_PAGE {
        let leaf = Leaf {
            next: NIL_PAGE,
            entries: vec![LeafEntry { key: NodeKey::detached(key.to_vec()), value }],
        };
        let pid = write_node(sess, Node::Leaf(leaf))?;
        return Ok((pid, None));
    }

    let out = insert_rec(sess, root, key, value, 0)?;
    let new_root = match out.split {
        None => out.pid,
        Some((sep, right)) => write_node(
            sess,
            Node::Internal(Internal {
                first_child: out.pid,
                entries: vec![InternalEntry { sep, child: right }],
            }),
        )?,
    };
    Ok((new_root, out.replaced))
}

fn insert_rec(
    sess: &mut CowSession<'_>,
    pid: PageId,
    key: &[u8],
    value: ValueRef,
    depth: usize,
) -> Result<Inserted> {
    if depth > MAX_DEPTH {
        return Err(Error::corrupt("tree deeper than the descent bound"));
    }
    match read_node(sess, pid)? {
        Node::Leaf(mut leaf) => {
            let replaced = match leaf.search(key) {
                Ok(i) => Some(std::mem::replace(&mut leaf.entries[i].value, value)),
                Err(i) => {
                    let entry =
                        LeafEntry { key: NodeKey::detached(key.to_vec()), value };
                    leaf.entries.insert(i, entry);
                    None
                }
            };
            sess.free(pid);
            if leaf.encoded_size() > NODE_CAPACITY {
                let (left, sep, right_pid) = split_leaf(sess, leaf)?;
                let left_pid = write_node(sess, Node::Leaf(left))?;
                Ok(Inserted { pid: left_pid, split: Some((sep, right_pid)), replaced })
            } else {
                let pid = write_node(sess, Node::Leaf(leaf))?;
                Ok(Inserted { pid, split: None, replaced })
            }
        }
        Node::Internal(mut node) => {
            let slot = node.child_slot(key);
            let sub = insert_rec(sess, node.child_at(slot), key, value, depth + 1)?;
            node.set_child_at(slot, sub.pid);
            if let Some((sep, right)) = sub.split {
                node.entries.insert(slot, InternalEntry { sep, child: right });
            }
            sess.free(pid);
            if node.encoded_size() > NODE_CAPACITY {
                let (left, sep, right_pid) = split_internal(sess, node)?;
                let left_pid = write_node(sess, Node::Internal(left))?;
                Ok(Inserted {
                    pid: left_pid,
                    split: Some((sep, right_pid)),
                    replaced: sub.replaced,
                })
            } else {
                let pid = write_node(sess, Node::Internal(node))?;
                Ok(Inserted { pid, split: None, replaced: sub.replaced })
            }
        }
    }
}

/// Median split. The separator is a fresh copy of the right half's first
/// key; the halves stay linked left → right.
fn split_leaf(sess: &mut CowSession<'_>, mut leaf: Leaf) -> Result<(Leaf, NodeKey, PageId)> {
    let mid = leaf.entries.len() / 2;
    let right_entries = leaf.entries.split_off(mid);
    let sep = NodeKey::detached(right_entries[0].key.bytes.clone());
    let right = Leaf { next: leaf.next, entries: right_entries };
    let right_pid = write_node(sess, Node::Leaf(right))?;
    leaf.next = right_pid;
    trace!(right = right_pid, "leaf split");
    Ok((leaf, sep, right_pid))
}

/// Median split of an internal node; the median separator moves up.
fn split_internal(
    sess: &mut CowSession<'_>,
    mut node: Internal,
) -> Result<(Internal, NodeKey, PageId)> {
    let mid = node.entries.len() / 2;
    let mut right_entries = node.entries.split_off(mid);
    let promoted = right_entries.remove(0);
    let right = Internal { first_child: promoted.child, entries: right_entries };
    let right_pid = write_node(sess, Node::Internal(right))?;
    Ok((node, promoted.sep, right_pid))
}

struct Removed {
    pid: PageId,
    removed: ValueRef,
    underflow: bool,
}

/// Remove `key`. Returns the new root and the removed descriptor (the
/// caller owns freeing its chain); an absent key changes nothing.
pub fn remove(
    sess: &mut CowSession<'_>,
    root: PageId,
    key: &[u8],
) -> Result<(PageId, Option<ValueRef>)> {
    if root == NIL_PAGE || lookup(sess, root, key)?.is_none() {
        return Ok((root, None));
    }

    let out = remove_rec(sess, root, key, 0)?;

    // Root fixups: drop empty leaves, collapse single-child internals.
    let mut root_pid = out.pid;
    loop {
        match read_node(sess, root_pid)? {
            Node::Internal(node) if node.entries.is_empty() => {
                sess.free(root_pid);
                root_pid = node.first_child;
            }
            Node::Leaf(leaf) if leaf.entries.is_empty() => {
                sess.free(root_pid);
                root_pid = NIL_PAGE;
                break;
            }
            _ => break,
        }
    }
    Ok((root_pid, Some(out.removed)))
}

fn remove_rec(
    sess: &mut CowSession<'_>,
    pid: PageId,
    key: &[u8],
    depth: usize,
) -> Result<Removed> {
    if depth > MAX_DEPTH {
        return Err(Error::corrupt("tree deeper than the descent bound"));
    }
    match read_node(sess, pid)? {
        Node::Leaf(mut leaf) => {
            let i = leaf
                .search(key)
                .map_err(|_| Error::corrupt("key vanished mid-removal"))?;
            let entry = leaf.entries.remove(i);
            if let Some(spill) = entry.key.spill {
                free_chain(sess, spill)?;
            }
            sess.free(pid);
            let underflow = leaf.encoded_size() < NODE_MIN_FILL;
            let new_pid = write_node(sess, Node::Leaf(leaf))?;
            Ok(Removed { pid: new_pid, removed: entry.value, underflow })
        }
        Node::Internal(mut node) => {
            let slot = node.child_slot(key);
            let sub = remove_rec(sess, node.child_at(slot), key, depth + 1)?;
            node.set_child_at(slot, sub.pid);
            if sub.underflow {
                rebalance(sess, &mut node, slot)?;
            }
            sess.free(pid);
            let underflow = node.encoded_size() < NODE_MIN_FILL;
            let new_pid = write_node(sess, Node::Internal(node))?;
            Ok(Removed { pid: new_pid, removed: sub.removed, underflow })
        }
    }
}

/// Fix an under-filled child: merge with a sibling when the merged node
/// fits a page, otherwise pull entries over from the larger sibling.
fn rebalance(sess: &mut CowSession<'_>, parent: &mut Internal, slot: usize) -> Result<()> {
    let child_pid = parent.child_at(slot);

    if slot > 0 {
        let left_pid = parent.child_at(slot - 1);
        let left = read_node(sess, left_pid)?;
        let child = read_node(sess, child_pid)?;
        if merged_size(&left, &child, parent, slot - 1) <= NODE_CAPACITY {
            return merge_children(sess, parent, slot - 1, left, child, left_pid, child_pid);
        }
    }
    if slot + 1 < parent.child_count() {
        let right_pid = parent.child_at(slot + 1);
        let child = read_node(sess, child_pid)?;
        let right = read_node(sess, right_pid)?;
        if merged_size(&child, &right, parent, slot) <= NODE_CAPACITY {
            return merge_children(sess, parent, slot, child, right, child_pid, right_pid);
        }
    }

    // Neither merge fits: redistribute with the larger adjacent sibling.
    let left_size = if slot > 0 {
        Some(read_node(sess, parent.child_at(slot - 1))?.encoded_size())
    } else {
        None
    };
    let right_size = if slot + 1 < parent.child_count() {
        Some(read_node(sess, parent.child_at(slot + 1))?.encoded_size())
    } else {
        None
    };
    let from_left = match (left_size, right_size) {
        (Some(l), Some(r)) => l >= r,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => return Ok(()), // single child: root collapse handles it
    };
    redistribute(sess, parent, slot, from_left)
}

fn merged_size(left: &Node, right: &Node, parent: &Internal, sep_idx: usize) -> usize {
    match (left, right) {
        (Node::Leaf(l), Node::Leaf(r)) => l.encoded_size() + r.encoded_size() - 6,
        (Node::Internal(l), Node::Internal(r)) => {
            let sep = &parent.entries[sep_idx].sep;
            l.encoded_size() + r.encoded_size() - 6 + sep.encoded_size() + 4
        }
        _ => usize::MAX,
    }
}

fn merge_children(
    sess: &mut CowSession<'_>,
    parent: &mut Internal,
    sep_idx: usize,
    left: Node,
    right: Node,
    left_pid: PageId,
    right_pid: PageId,
) -> Result<()> {
    let sep_entry = parent.entries.remove(sep_idx);
    let merged = match (left, right) {
        (Node::Leaf(mut l), Node::Leaf(r)) => {
            // The separator is a standalone copy; its spill goes with it.
            if let Some(spill) = sep_entry.sep.spill {
                free_chain(sess, spill)?;
            }
            l.entries.extend(r.entries);
            l.next = r.next;
            Node::Leaf(l)
        }
        (Node::Internal(mut l), Node::Internal(r)) => {
            l.entries.push(InternalEntry { sep: sep_entry.sep, child: r.first_child });
            l.entries.extend(r.entries);
            Node::Internal(l)
        }
        _ => return Err(Error::corrupt("sibling depth mismatch")),
    };
    sess.free(left_pid);
    sess.free(right_pid);
    let merged_pid = write_node(sess, merged)?;
    trace!(left = left_pid, right = right_pid, merged = merged_pid, "siblings merged");
    parent.set_child_at(sep_idx, merged_pid);
    Ok(())
}

fn redistribute(
    sess: &mut CowSession<'_>,
    parent: &mut Internal,
    slot: usize,
    from_left: bool,
) -> Result<()> {
    let sib_slot = if from_left { slot - 1 } else { slot + 1 };
    let child_pid = parent.child_at(slot);
    let sib_pid = parent.child_at(sib_slot);
    let child = read_node(sess, child_pid)?;
    let sib = read_node(sess, sib_pid)?;
    sess.free(child_pid);
    sess.free(sib_pid);

    match (child, sib) {
        (Node::Leaf(mut c), Node::Leaf(mut s)) => {
            if from_left {
                while c.encoded_size() < NODE_MIN_FILL
                    && s.encoded_size() > NODE_MIN_FILL
                    && s.entries.len() > 1
                {
                    let moved = s.entries.pop().expect("sibling has entries");
                    c.entries.insert(0, moved);
                }
                replace_sep(sess, parent, slot - 1, c.entries[0].key.bytes.clone())?;
                // Keep the sibling link pointing at the child's new copy.
                let c_new = write_node(sess, Node::Leaf(c))?;
                s.next = c_new;
                let s_new = write_node(sess, Node::Leaf(s))?;
                parent.set_child_at(slot, c_new);
                parent.set_child_at(sib_slot, s_new);
            } else {
                while c.encoded_size() < NODE_MIN_FILL
                    && s.encoded_size() > NODE_MIN_FILL
                    && s.entries.len() > 1
                {
                    c.entries.push(s.entries.remove(0));
                }
                replace_sep(sess, parent, slot, s.entries[0].key.bytes.clone())?;
                let s_new = write_node(sess, Node::Leaf(s))?;
                c.next = s_new;
                let c_new = write_node(sess, Node::Leaf(c))?;
                parent.set_child_at(slot, c_new);
                parent.set_child_at(sib_slot, s_new);
            }
        }
        (Node::Internal(mut c), Node::Internal(mut s)) => {
            if from_left {
                let sep_idx = slot - 1;
                while c.encoded_size() < NODE_MIN_FILL
                    && s.encoded_size() > NODE_MIN_FILL
                    && s.entries.len() > 1
                {
                    let moved = s.entries.pop().expect("sibling has entries");
                    let down =
                        std::mem::replace(&mut parent.entries[sep_idx].sep, moved.sep);
                    c.entries.insert(0, InternalEntry { sep: down, child: c.first_child });
                    c.first_child = moved.child;
                }
            } else {
                let sep_idx = slot;
                while c.encoded_size() < NODE_MIN_FILL
                    && s.encoded_size() > NODE_MIN_FILL
                    && s.entries.len() > 1
                {
                    let moved = s.entries.remove(0);
                    let down =
                        std::mem::replace(&mut parent.entries[sep_idx].sep, moved.sep);
                    c.entries.push(InternalEntry { sep: down, child: s.first_child });
                    s.first_child = moved.child;
                }
            }
            let c_new = write_node(sess, Node::Internal(c))?;
            let s_new = write_node(sess, Node::Internal(s))?;
            parent.set_child_at(slot, c_new);
            parent.set_child_at(sib_slot, s_new);
        }
        _ => return Err(Error::corrupt("sibling depth mismatch")),
    }
    Ok(())
}

/// Swap in a fresh separator copy, releasing the old copy's spill.
fn replace_sep(
    sess: &mut CowSession<'_>,
    parent: &mut Internal,
    sep_idx: usize,
    bytes: Vec<u8>,
) -> Result<()> {
    let old = std::mem::replace(&mut parent.entries[sep_idx].sep, NodeKey::detached(bytes));
    if let Some(spill) = old.spill {
        free_chain(sess, spill)?;
    }
    Ok(())
}
