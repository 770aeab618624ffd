//! Allowed-IPs table: concurrent longest-prefix match from addresses to
//! tunnel peers.
//!
//! Two compact binary tries (32-bit and 128-bit keys) sit behind a single
//! reader-writer lock. Each trie node may carry a peer handle; every node
//! that does is also threaded onto that peer's intrusive list, so one peer's
//! prefixes can be enumerated and bulk-removed without walking the whole
//! trie. Packet lookups take the read lock only and never allocate.

pub mod constants;
pub mod errors;
pub mod helpers;
pub mod types;

pub use errors::Error;
pub use types::AllowedIps;

use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, trace};
use metrics::{counter, gauge};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::constants::{V4_WIDTH, V6_WIDTH};
use crate::helpers::{common_bits, mask_address};
use crate::types::{peer_key, Family, Node, NodeIdx, ParentLink, PeerKey, PeerList, RawIp, State};

// ---- logging bootstraper -------------------------------------------------
fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}

impl<P> State<P> {
    #[inline]
    fn root(&self, family: Family) -> Option<NodeIdx> {
        match family {
            Family::V4 => self.root_v4,
            Family::V6 => self.root_v6,
        }
    }

    /// Write `idx` into the slot a parent link names, without touching the
    /// occupant's own back-link.
    fn write_slot(&mut self, link: ParentLink, idx: Option<NodeIdx>) {
        match link {
            ParentLink::Root(Family::V4) => self.root_v4 = idx,
            ParentLink::Root(Family::V6) => self.root_v6 = idx,
            ParentLink::Child { parent, slot } => {
                self.arena.node_mut(parent).child[usize::from(slot)] = idx;
            }
        }
    }

    // ---- per-peer reverse index ------------------------------------------

    /// Append `idx` to the reverse-index list of the peer it carries.
    fn enrol_peer_entry(&mut self, idx: NodeIdx) {
        let key = {
            let node = self.arena.node(idx);
            peer_key(node.peer.as_ref().expect("enrolling a node without a peer"))
        };
        match self.peers.get_mut(&key) {
            Some(list) => {
                let tail = list.tail;
                self.arena.node_mut(tail).peer_next = Some(idx);
                let node = self.arena.node_mut(idx);
                node.peer_prev = Some(tail);
                node.peer_next = None;
                list.tail = idx;
            }
            None => {
                let node = self.arena.node_mut(idx);
                node.peer_prev = None;
                node.peer_next = None;
                self.peers.insert(key, PeerList { head: idx, tail: idx });
            }
        }
    }

    /// Detach `idx` from its peer's reverse-index list in O(1). No-op for
    /// unassigned nodes.
    fn unlink_peer_entry(&mut self, idx: NodeIdx) {
        let (key, prev, next) = {
            let node = self.arena.node(idx);
            match node.peer.as_ref() {
                Some(peer) => (peer_key(peer), node.peer_prev, node.peer_next),
                None => return,
            }
        };
        if let Some(p) = prev {
            self.arena.node_mut(p).peer_next = next;
        }
        if let Some(n) = next {
            self.arena.node_mut(n).peer_prev = prev;
        }
        match (prev, next) {
            (None, None) => {
                self.peers.remove(&key);
            }
            (None, Some(n)) => {
                self.peers.get_mut(&key).expect("peer list missing").head = n;
            }
            (Some(p), None) => {
                self.peers.get_mut(&key).expect("peer list missing").tail = p;
            }
            (Some(_), Some(_)) => {}
        }
        let node = self.arena.node_mut(idx);
        node.peer_prev = None;
        node.peer_next = None;
    }

    /// Visit `(bits, cidr)` for each prefix on `key`'s list, in insertion
    /// order, until the callback declines to continue.
    fn entries_for_peer(&self, key: PeerKey, f: &mut dyn FnMut(&[u8], u8) -> bool) {
        let mut cursor = match self.peers.get(&key) {
            Some(list) => Some(list.head),
            None => return,
        };
        while let Some(idx) = cursor {
            let node = self.arena.node(idx);
            if !f(node.bits.as_slice(), node.cidr) {
                return;
            }
            cursor = node.peer_next;
        }
    }

    // ---- trie algorithms -------------------------------------------------

    /// Walk toward `(ip, cidr)` from the family root: returns the deepest
    /// node on the matching path whose own prefix is no longer than `cidr`,
    /// and whether it is exactly the requested prefix.
    fn node_placement(&self, from: Option<NodeIdx>, ip: &[u8], cidr: u8) -> (Option<NodeIdx>, bool) {
        let mut cursor = from;
        let mut parent = None;
        while let Some(idx) = cursor {
            let node = self.arena.node(idx);
            if node.cidr > cidr || common_bits(node.bits.as_slice(), ip) < node.cidr {
                break;
            }
            parent = Some(idx);
            if node.cidr == cidr {
                return (parent, true);
            }
            cursor = node.child[node.choose(ip)];
        }
        (parent, false)
    }

    /// Hang `idx` off the matching child slot of `parent`, or make it the
    /// family root when there is no parent.
    fn attach(&mut self, idx: NodeIdx, parent: Option<NodeIdx>, family: Family) {
        match parent {
            None => {
                self.arena.node_mut(idx).parent = ParentLink::Root(family);
                self.write_slot(ParentLink::Root(family), Some(idx));
            }
            Some(p) => {
                let slot = self.arena.node(p).choose(self.arena.node(idx).bits.as_slice());
                self.arena.node_mut(idx).parent = ParentLink::Child {
                    parent: p,
                    slot: slot as u8,
                };
                self.arena.node_mut(p).child[slot] = Some(idx);
            }
        }
    }

    fn insert(&mut self, family: Family, mut ip: RawIp, cidr: u8, peer: Arc<P>) {
        mask_address(ip.as_mut_slice(), cidr);

        let root_idx = match self.root(family) {
            Some(idx) => idx,
            None => {
                trace!("[INSERT] empty trie, new /{cidr} root");
                let idx = self
                    .arena
                    .alloc(Node::new(ip, cidr, ParentLink::Root(family), Some(peer)));
                self.enrol_peer_entry(idx);
                self.write_slot(ParentLink::Root(family), Some(idx));
                return;
            }
        };

        let (parent, exact) = self.node_placement(Some(root_idx), ip.as_slice(), cidr);
        if exact {
            trace!("[INSERT] exact /{cidr} hit, rebinding");
            counter!("allowedips_replacements_total").increment(1);
            let idx = parent.expect("exact placement without a node");
            self.unlink_peer_entry(idx);
            self.arena.node_mut(idx).peer = Some(peer);
            self.enrol_peer_entry(idx);
            return;
        }

        let new_idx = self
            .arena
            .alloc(Node::new(ip, cidr, ParentLink::Root(family), Some(peer)));
        self.enrol_peer_entry(new_idx);

        // `down` is the node the path diverges at; absent a parent that is
        // the root itself.
        let down = match parent {
            None => root_idx,
            Some(p) => {
                let slot = self.arena.node(p).choose(ip.as_slice());
                match self.arena.node(p).child[slot] {
                    Some(d) => d,
                    None => {
                        trace!("[INSERT] extending below /{} node", self.arena.node(p).cidr);
                        self.arena.node_mut(new_idx).parent = ParentLink::Child {
                            parent: p,
                            slot: slot as u8,
                        };
                        self.arena.node_mut(p).child[slot] = Some(new_idx);
                        return;
                    }
                }
            }
        };

        let common = common_bits(self.arena.node(down).bits.as_slice(), ip.as_slice());
        let branch_cidr = cidr.min(common);

        if branch_cidr == cidr {
            // The requested prefix is itself the branch point: the new node
            // adopts the diverging subtree as one child.
            trace!("[INSERT] /{cidr} node adopts diverging subtree");
            let slot = self
                .arena
                .node(new_idx)
                .choose(self.arena.node(down).bits.as_slice());
            self.arena.node_mut(down).parent = ParentLink::Child {
                parent: new_idx,
                slot: slot as u8,
            };
            self.arena.node_mut(new_idx).child[slot] = Some(down);
            self.attach(new_idx, parent, family);
            return;
        }

        // The branch point is shallower than the requested prefix: a fresh
        // unassigned split node takes both the old subtree and the new node.
        trace!("[INSERT] split node at /{branch_cidr}");
        let split_idx = self
            .arena
            .alloc(Node::new(ip, branch_cidr, ParentLink::Root(family), None));
        let down_slot = self
            .arena
            .node(split_idx)
            .choose(self.arena.node(down).bits.as_slice());
        self.arena.node_mut(down).parent = ParentLink::Child {
            parent: split_idx,
            slot: down_slot as u8,
        };
        self.arena.node_mut(split_idx).child[down_slot] = Some(down);
        let new_slot = self
            .arena
            .node(split_idx)
            .choose(self.arena.node(new_idx).bits.as_slice());
        self.arena.node_mut(new_idx).parent = ParentLink::Child {
            parent: split_idx,
            slot: new_slot as u8,
        };
        self.arena.node_mut(split_idx).child[new_slot] = Some(new_idx);
        self.attach(split_idx, parent, family);
    }

    fn lookup(&self, family: Family, ip: &[u8]) -> Option<Arc<P>> {
        let width = ip.len() as u8;
        let mut found: Option<&Arc<P>> = None;
        let mut cursor = self.root(family);
        while let Some(idx) = cursor {
            let node = self.arena.node(idx);
            if common_bits(node.bits.as_slice(), ip) < node.cidr {
                break;
            }
            if let Some(peer) = node.peer.as_ref() {
                found = Some(peer);
            }
            if node.bit_at_byte == width {
                break;
            }
            cursor = node.child[node.choose(ip)];
        }
        found.cloned()
    }

    fn remove_by_peer(&mut self, family: Family, peer: &Arc<P>) {
        let root = self.root(family);
        let new_root = self.remove_subtree(root, peer);
        self.write_slot(ParentLink::Root(family), new_root);
        if let Some(idx) = new_root {
            self.arena.node_mut(idx).parent = ParentLink::Root(family);
        }
    }

    /// Post-order removal of every node assigned to `peer` under `node`.
    /// Each child slot is rewritten with the recursion's result and the
    /// occupant's back-link re-seated, since contraction may promote a
    /// deeper node into the slot. Returns the subtree's new root.
    fn remove_subtree(&mut self, node: Option<NodeIdx>, peer: &Arc<P>) -> Option<NodeIdx> {
        let idx = node?;
        for slot in 0..2 {
            let child = self.arena.node(idx).child[slot];
            let new_child = self.remove_subtree(child, peer);
            self.arena.node_mut(idx).child[slot] = new_child;
            if let Some(c) = new_child {
                self.arena.node_mut(c).parent = ParentLink::Child {
                    parent: idx,
                    slot: slot as u8,
                };
            }
        }

        let is_target = self
            .arena
            .node(idx)
            .peer
            .as_ref()
            .map_or(false, |p| Arc::ptr_eq(p, peer));
        if is_target {
            self.unlink_peer_entry(idx);
            self.arena.node_mut(idx).peer = None;
        }
        if self.arena.node(idx).peer.is_some() {
            return Some(idx);
        }

        // Unassigned survivors with fewer than two children are contracted
        // so the trie never keeps a split node that no longer splits.
        let [left, right] = self.arena.node(idx).child;
        match (left, right) {
            (Some(_), Some(_)) => Some(idx),
            (Some(only), None) | (None, Some(only)) => {
                self.arena.free(idx);
                Some(only)
            }
            (None, None) => {
                self.arena.free(idx);
                None
            }
        }
    }

    fn clear(&mut self) {
        self.arena.clear();
        self.root_v4 = None;
        self.root_v6 = None;
        self.peers.clear();
    }
}

impl<P> AllowedIps<P> {
    /// Create an empty table.
    pub fn new() -> Self {
        ensure_logging();
        AllowedIps {
            state: RwLock::new(State::new()),
        }
    }

    /// Bind `(ip, cidr)` to `peer`, replacing any previous binding of the
    /// same prefix. `ip` must be 4 or 16 bytes and is copied; host bits
    /// past `cidr` are cleared before the prefix is stored.
    pub fn insert(&self, ip: &[u8], cidr: u8, peer: Arc<P>) -> Result<(), Error> {
        let (family, bits) = match ip.len() {
            V4_WIDTH => {
                let mut b = [0u8; V4_WIDTH];
                b.copy_from_slice(ip);
                (Family::V4, RawIp::V4(b))
            }
            V6_WIDTH => {
                let mut b = [0u8; V6_WIDTH];
                b.copy_from_slice(ip);
                (Family::V6, RawIp::V6(b))
            }
            _ => return Err(Error::InvalidAddress),
        };
        if usize::from(cidr) > family.width() * 8 {
            return Err(Error::InvalidPrefix);
        }
        counter!("allowedips_inserts_total").increment(1);
        debug!("[INSERT] ip={ip:?}/{cidr}");
        let mut state = self.state.write();
        state.insert(family, bits, cidr, peer);
        gauge!("allowedips_nodes").set(state.arena.live() as f64);
        Ok(())
    }

    /// Longest-prefix match for an IPv4 address.
    pub fn lookup_v4(&self, addr: &[u8; 4]) -> Option<Arc<P>> {
        self.state.read().lookup(Family::V4, addr)
    }

    /// Longest-prefix match for an IPv6 address.
    pub fn lookup_v6(&self, addr: &[u8; 16]) -> Option<Arc<P>> {
        self.state.read().lookup(Family::V6, addr)
    }

    /// Longest-prefix match dispatching on the family of `addr`.
    pub fn lookup(&self, addr: IpAddr) -> Option<Arc<P>> {
        match addr {
            IpAddr::V4(v4) => self.lookup_v4(&v4.octets()),
            IpAddr::V6(v6) => self.lookup_v6(&v6.octets()),
        }
    }

    /// Drop every binding owned by `peer` from both tries and empty its
    /// reverse index.
    pub fn remove_by_peer(&self, peer: &Arc<P>) {
        counter!("allowedips_peer_removals_total").increment(1);
        debug!("[REMOVE] peer={:p}", Arc::as_ptr(peer));
        let mut state = self.state.write();
        state.remove_by_peer(Family::V4, peer);
        state.remove_by_peer(Family::V6, peer);
        gauge!("allowedips_nodes").set(state.arena.live() as f64);
    }

    /// Visit `(address bytes, cidr)` for every prefix bound to `peer`, in
    /// insertion order, until `f` returns `false`.
    ///
    /// `f` runs under the table's read lock and must not call back into the
    /// table.
    pub fn entries_for_peer(&self, peer: &Arc<P>, mut f: impl FnMut(&[u8], u8) -> bool) {
        self.state.read().entries_for_peer(peer_key(peer), &mut f);
    }

    /// Remove every entry from both tries.
    pub fn clear(&self) {
        debug!("[CLEAR] dropping all entries");
        let mut state = self.state.write();
        state.clear();
        gauge!("allowedips_nodes").set(0.0);
    }

    /// Live trie nodes across both families, split nodes included.
    pub fn node_count(&self) -> usize {
        self.state.read().arena.live()
    }

    pub fn is_empty(&self) -> bool {
        self.node_count() == 0
    }
}

impl<P> Default for AllowedIps<P> {
    fn default() -> Self {
        Self::new()
    }
}
