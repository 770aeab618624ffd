//! Data structures for the allowed-IPs tries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::{V4_WIDTH, V6_WIDTH};
use crate::helpers::mask_address;

/// Arena index of a trie node; always 32 bits.
pub(crate) type NodeIdx = u32;

/// Identity key for a peer handle: the address of the `Arc` allocation.
pub(crate) type PeerKey = usize;

#[inline]
pub(crate) fn peer_key<P>(peer: &Arc<P>) -> PeerKey {
    Arc::as_ptr(peer) as PeerKey
}

/// Address family, selecting the 32-bit or 128-bit trie.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Family {
    V4,
    V6,
}

impl Family {
    #[inline]
    pub(crate) fn width(self) -> usize {
        match self {
            Family::V4 => V4_WIDTH,
            Family::V6 => V6_WIDTH,
        }
    }
}

/// A family-sized address. Node copies are masked to the node's prefix.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RawIp {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl RawIp {
    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            RawIp::V4(b) => b,
            RawIp::V6(b) => b,
        }
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            RawIp::V4(b) => b,
            RawIp::V6(b) => b,
        }
    }
}

/// Back-link from a node to the slot that currently owns it: a family root
/// slot, or one child slot of another node. Lets the writer detach or swap
/// a node without re-walking from the root.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ParentLink {
    Root(Family),
    Child { parent: NodeIdx, slot: u8 },
}

/// One trie node: a masked prefix, optional peer binding, and the intrusive
/// reverse-index links used while the peer is set.
pub(crate) struct Node<P> {
    pub(crate) peer: Option<Arc<P>>,
    pub(crate) child: [Option<NodeIdx>; 2],
    pub(crate) parent: ParentLink,
    pub(crate) cidr: u8,
    /// `cidr / 8`; equals the family width for /32 and /128 nodes, which is
    /// the "no further bits" sentinel checked by lookup.
    pub(crate) bit_at_byte: u8,
    pub(crate) bit_at_shift: u8,
    pub(crate) bits: RawIp,
    pub(crate) peer_prev: Option<NodeIdx>,
    pub(crate) peer_next: Option<NodeIdx>,
}

impl<P> Node<P> {
    pub(crate) fn new(mut bits: RawIp, cidr: u8, parent: ParentLink, peer: Option<Arc<P>>) -> Self {
        mask_address(bits.as_mut_slice(), cidr);
        Node {
            peer,
            child: [None, None],
            parent,
            cidr,
            bit_at_byte: cidr / 8,
            bit_at_shift: 7 - (cidr % 8),
            bits,
            peer_prev: None,
            peer_next: None,
        }
    }

    /// Child slot selected by the first bit of `ip` past this node's prefix.
    /// Callers must not descend below a full-width node.
    #[inline]
    pub(crate) fn choose(&self, ip: &[u8]) -> usize {
        usize::from((ip[usize::from(self.bit_at_byte)] >> self.bit_at_shift) & 1)
    }
}

/// Slab-style node arena: bump allocation plus a free list of recycled
/// slots. Child, parent, and reverse-index links are all indices into it.
pub(crate) struct NodeArena<P> {
    slots: Vec<Option<Node<P>>>,
    free: Vec<NodeIdx>,
}

impl<P> NodeArena<P> {
    pub(crate) fn new() -> Self {
        NodeArena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn alloc(&mut self, node: Node<P>) -> NodeIdx {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                (self.slots.len() - 1) as NodeIdx
            }
        }
    }

    pub(crate) fn free(&mut self, idx: NodeIdx) {
        let slot = &mut self.slots[idx as usize];
        debug_assert!(slot.is_some(), "double free of trie node {idx}");
        *slot = None;
        self.free.push(idx);
    }

    #[inline]
    pub(crate) fn node(&self, idx: NodeIdx) -> &Node<P> {
        self.slots[idx as usize].as_ref().expect("stale trie node index")
    }

    #[inline]
    pub(crate) fn node_mut(&mut self, idx: NodeIdx) -> &mut Node<P> {
        self.slots[idx as usize].as_mut().expect("stale trie node index")
    }

    /// Live node count, free-listed slots excluded.
    pub(crate) fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }
}

/// Reverse-index list state for one peer: head and tail of the intrusive
/// list threaded through its assigned nodes. Present only while non-empty.
pub(crate) struct PeerList {
    pub(crate) head: NodeIdx,
    pub(crate) tail: NodeIdx,
}

/// Everything guarded by the table's reader-writer lock: the arena, both
/// family roots, and the per-peer list heads.
pub(crate) struct State<P> {
    pub(crate) arena: NodeArena<P>,
    pub(crate) root_v4: Option<NodeIdx>,
    pub(crate) root_v6: Option<NodeIdx>,
    pub(crate) peers: HashMap<PeerKey, PeerList>,
}

impl<P> State<P> {
    pub(crate) fn new() -> Self {
        State {
            arena: NodeArena::new(),
            root_v4: None,
            root_v6: None,
            peers: HashMap::new(),
        }
    }
}

/// Per-interface allowed-IPs table: maps packet source/destination
/// addresses to the peer that owns them, by longest-prefix match.
pub struct AllowedIps<P> {
    pub(crate) state: RwLock<State<P>>,
}
