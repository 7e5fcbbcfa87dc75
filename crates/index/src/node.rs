use skdb_common::{Error, PageId, Result, KEY_INLINE_MAX, PAGE_PAYLOAD_SIZE};
use skdb_pagestore::{Page, PageType};

use crate::chain::{read_chain, write_chain};
use crate::session::{CowSession, ReadPages};

/// A node image must fit one page payload.
pub const NODE_CAPACITY: usize = PAGE_PAYLOAD_SIZE;

/// Minimum fill before a node is merged or refilled from a sibling.
pub const NODE_MIN_FILL: usize = PAGE_PAYLOAD_SIZE / 4;

/// Bound on descent depth; a walk deeper than this means a cycle.
pub const MAX_DEPTH: usize = 64;

const VALUE_INLINE_TAG: u8 = 0;
const VALUE_CHAIN_TAG: u8 = 1;

/// Where a stored value lives: inside the leaf entry, or in an overflow
/// chain of `len` bytes headed at `head`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueRef {
    Inline(Vec<u8>),
    Chain { head: PageId, len: u32 },
}

impl ValueRef {
    fn encoded_size(&self) -> usize {
        1 + match self {
            ValueRef::Inline(v) => 2 + v.len(),
            ValueRef::Chain { .. } => 8,
        }
    }
}

/// A key as a node stores it. Keys longer than `KEY_INLINE_MAX` keep their
/// bytes in an overflow chain; `spill` is that chain's head once allocated.
/// Deliberately not `Clone`: a copied spill id would be freed twice. Fresh
/// copies are made with `detached`, which re-spills on its own.
#[derive(Debug)]
pub struct NodeKey {
    pub bytes: Vec<u8>,
    pub spill: Option<PageId>,
}

impl NodeKey {
    pub fn detached(bytes: Vec<u8>) -> NodeKey {
        NodeKey { bytes, spill: None }
    }

    fn needs_spill(&self) -> bool {
        self.bytes.len() > KEY_INLINE_MAX
    }

    pub fn encoded_size(&self) -> usize {
        2 + if self.needs_spill() { 4 } else { self.bytes.len() }
    }
}

// Leaf payload:
//   next_u32 | count_u16 | entry*
//   entry = key_len_u16 | key_bytes-or-spill_head_u32 | value
//   value = tag_u8 | (inline: len_u16, bytes) | (chain: head_u32, len_u32)
#[derive(Debug)]
pub struct LeafEntry {
    pub key: NodeKey,
    pub value: ValueRef,
}

impl LeafEntry {
    pub fn encoded_size(&self) -> usize {
        self.key.encoded_size() + self.value.encoded_size()
    }
}

#[derive(Debug)]
pub struct Leaf {
    /// Right-sibling hint. Kept accurate across splits and merges in the
    /// same commit; a later copy-on-write of the successor leaves it stale,
    /// so traversal never trusts it for correctness.
    pub next: PageId,
    pub entries: Vec<LeafEntry>,
}

impl Leaf {
    pub fn encoded_size(&self) -> usize {
        6 + self.entries.iter().map(LeafEntry::encoded_size).sum::<usize>()
    }

    /// Slot of `key`, or the slot it would occupy.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.bytes.as_slice().cmp(key))
    }
}

// Internal payload:
//   first_child_u32 | count_u16 | entry*
//   entry = key_len_u16 | key_bytes-or-spill_head_u32 | child_u32
#[derive(Debug)]
pub struct InternalEntry {
    pub sep: NodeKey,
    pub child: PageId,
}

impl InternalEntry {
    pub fn encoded_size(&self) -> usize {
        self.sep.encoded_size() + 4
    }
}

#[derive(Debug)]
pub struct Internal {
    pub first_child: PageId,
    pub entries: Vec<InternalEntry>,
}

impl Internal {
    pub fn encoded_size(&self) -> usize {
        6 + self.entries.iter().map(InternalEntry::encoded_size).sum::<usize>()
    }

    pub fn child_count(&self) -> usize {
        self.entries.len() + 1
    }

    /// Child slot (0..=entries.len()) to descend for `key`. Keys equal to a
    /// separator belong to the child on its right.
    pub fn child_slot(&self, key: &[u8]) -> usize {
        match self.entries.binary_search_by(|e| e.sep.bytes.as_slice().cmp(key)) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    pub fn child_at(&self, slot: usize) -> PageId {
        if slot == 0 {
            self.first_child
        } else {
            self.entries[slot - 1].child
        }
    }

    pub fn set_child_at(&mut self, slot: usize, pid: PageId) {
        if slot == 0 {
            self.first_child = pid;
        } else {
            self.entries[slot - 1].child = pid;
        }
    }
}

#[derive(Debug)]
pub enum Node {
    Leaf(Leaf),
    Internal(Internal),
}

impl Node {
    pub fn encoded_size(&self) -> usize {
        match self {
            Node::Leaf(l) => l.encoded_size(),
            Node::Internal(i) => i.encoded_size(),
        }
    }
}

/// Spill any oversized keys, encode, and write the node under a new id.
pub fn write_node(sess: &mut CowSession<'_>, mut node: Node) -> Result<PageId> {
    ensure_spills(sess, &mut node)?;
    let (page_type, payload) = match &node {
        Node::Leaf(l) => (PageType::BTreeLeaf, encode_leaf(l)),
        Node::Internal(i) => (PageType::BTreeInternal, encode_internal(i)),
    };
    let mut page = Page::new(page_type);
    page.set_payload(&payload);
    sess.write_new(page)
}

pub fn read_node(src: &impl ReadPages, pid: PageId) -> Result<Node> {
    let page = src.load(pid)?;
    let node = match page.page_type() {
        Some(PageType::BTreeLeaf) => decode_leaf(src, page.payload()).map(Node::Leaf),
        Some(PageType::BTreeInternal) => decode_internal(src, page.payload()).map(Node::Internal),
        _ => return Err(Error::Corrupt(format!("page {pid} is not a tree node"))),
    };
    node.ok_or_else(|| Error::Corrupt(format!("undecodable tree node in page {pid}")))
}

fn ensure_spills(sess: &mut CowSession<'_>, node: &mut Node) -> Result<()> {
    let keys: Vec<&mut NodeKey> = match node {
        Node::Leaf(l) => l.entries.iter_mut().map(|e| &mut e.key).collect(),
        Node::Internal(i) => i.entries.iter_mut().map(|e| &mut e.sep).collect(),
    };
    for key in keys {
        if key.needs_spill() && key.spill.is_none() {
            key.spill = Some(write_chain(sess, &key.bytes)?);
        }
    }
    Ok(())
}

fn encode_key(buf: &mut Vec<u8>, key: &NodeKey) {
    buf.extend_from_slice(&(key.bytes.len() as u16).to_le_bytes());
    if key.needs_spill() {
        let head = key.spill.expect("spill allocated before encode");
        buf.extend_from_slice(&head.to_le_bytes());
    } else {
        buf.extend_from_slice(&key.bytes);
    }
}

fn encode_leaf(leaf: &Leaf) -> Vec<u8> {
    let size = leaf.encoded_size();
    assert!(size <= NODE_CAPACITY, "leaf exceeds page capacity");
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&leaf.next.to_le_bytes());
    buf.extend_from_slice(&(leaf.entries.len() as u16).to_le_bytes());
    for entry in &leaf.entries {
        encode_key(&mut buf, &entry.key);
        match &entry.value {
            ValueRef::Inline(v) => {
                buf.push(VALUE_INLINE_TAG);
                buf.extend_from_slice(&(v.len() as u16).to_le_bytes());
                buf.extend_from_slice(v);
            }
            ValueRef::Chain { head, len } => {
                buf.push(VALUE_CHAIN_TAG);
                buf.extend_from_slice(&head.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
            }
        }
    }
    buf
}

fn encode_internal(node: &Internal) -> Vec<u8> {
    let size = node.encoded_size();
    assert!(size <= NODE_CAPACITY, "internal node exceeds page capacity");
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&node.first_child.to_le_bytes());
    buf.extend_from_slice(&(node.entries.len() as u16).to_le_bytes());
    for entry in &node.entries {
        encode_key(&mut buf, &entry.sep);
        buf.extend_from_slice(&entry.child.to_le_bytes());
    }
    buf
}

fn decode_key(src: &impl ReadPages, buf: &[u8], pos: &mut usize) -> Option<NodeKey> {
    let len = u16::from_le_bytes(buf.get(*pos..*pos + 2)?.try_into().ok()?) as usize;
    *pos += 2;
    if len > KEY_INLINE_MAX {
        let head = PageId::from_le_bytes(buf.get(*pos..*pos + 4)?.try_into().ok()?);
        *pos += 4;
        let bytes = read_chain(src, head, len).ok()?;
        Some(NodeKey { bytes, spill: Some(head) })
    } else {
        let bytes = buf.get(*pos..*pos + len)?.to_vec();
        *pos += len;
        Some(NodeKey { bytes, spill: None })
    }
}

fn decode_leaf(src: &impl ReadPages, buf: &[u8]) -> Option<Leaf> {
    let next = PageId::from_le_bytes(buf.get(0..4)?.try_into().ok()?);
    let count = u16::from_le_bytes(buf.get(4..6)?.try_into().ok()?) as usize;
    let mut pos = 6;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let key = decode_key(src, buf, &mut pos)?;
        let tag = *buf.get(pos)?;
        pos += 1;
        let value = match tag {
            VALUE_INLINE_TAG => {
                let len = u16::from_le_bytes(buf.get(pos..pos + 2)?.try_into().ok()?) as usize;
                pos += 2;
                let v = buf.get(pos..pos + len)?.to_vec();
                pos += len;
                ValueRef::Inline(v)
            }
            VALUE_CHAIN_TAG => {
                let head = PageId::from_le_bytes(buf.get(pos..pos + 4)?.try_into().ok()?);
                pos += 4;
                let len = u32::from_le_bytes(buf.get(pos..pos + 4)?.try_into().ok()?);
                pos += 4;
                ValueRef::Chain { head, len }
            }
            _ => return None,
        };
        entries.push(LeafEntry { key, value });
    }
    if pos != buf.len() {
        return None;
    }
    Some(Leaf { next, entries })
}

fn decode_internal(src: &impl ReadPages, buf: &[u8]) -> Option<Internal> {
    let first_child = PageId::from_le_bytes(buf.get(0..4)?.try_into().ok()?);
    let count = u16::from_le_bytes(buf.get(4..6)?.try_into().ok()?) as usize;
    let mut pos = 6;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let sep = decode_key(src, buf, &mut pos)?;
        let child = PageId::from_le_bytes(buf.get(pos..pos + 4)?.try_into().ok()?);
        pos += 4;
        entries.push(InternalEntry { sep, child });
    }
    if pos != buf.len() {
        return None;
    }
    Some(Internal { first_child, entries })
}
