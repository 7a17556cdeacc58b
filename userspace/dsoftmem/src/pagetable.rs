// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Manager- and client-side page tables for dsoftmem
//!
//! One mutex per entry; a handler holds the entry lock for the whole
//! multi-message exchange that settles the page, so a second request for the
//! same page never observes an intermediate state. Manager entries carry the
//! authoritative read-set/writer pair; client entries carry the cached
//! access mode. A client entry additionally tracks an in-flight fetch
//! (`pending`) so the requesting thread never sits on the mutex while
//! blocked on the network.

use parking_lot::{Condvar, Mutex};

use crate::{PeerId, MANAGER_ID, PAGE_SIZE, VA_START};

/// Cached access mode of a client-side entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Invalid,
    ReadOnly,
    ReadWrite,
}

/// Fixed-size page backing storage, zero-filled at creation.
pub(crate) struct PageBuf(Box<[u8]>);

impl PageBuf {
    pub(crate) fn zeroed() -> Self {
        Self(vec![0u8; PAGE_SIZE].into_boxed_slice())
    }

    /// Adopts wire bytes; the codec already enforced the length.
    pub(crate) fn from_wire(bytes: Vec<u8>) -> Self {
        debug_assert_eq!(bytes.len(), PAGE_SIZE);
        Self(bytes.into_boxed_slice())
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub(crate) fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

/// Bitmap over peer slots holding read-only copies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ReadSet(u32);

impl ReadSet {
    pub(crate) fn add(&mut self, peer: PeerId) {
        self.0 |= 1 << peer;
    }

    pub(crate) fn remove(&mut self, peer: PeerId) {
        self.0 &= !(1 << peer);
    }

    pub(crate) fn contains(self, peer: PeerId) -> bool {
        self.0 & (1 << peer) != 0
    }

    pub(crate) fn clear(&mut self) {
        self.0 = 0;
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Peers in the set, ascending, excluding `except`.
    pub(crate) fn peers_except(self, except: &[PeerId]) -> Vec<PeerId> {
        (0..crate::MAX_PEERS as u32)
            .filter(|p| self.contains(*p) && !except.contains(p))
            .collect()
    }
}

/// Authoritative entry; exists only on the manager.
pub(crate) struct ManagerEntry {
    pub in_use: bool,
    pub shared_va: u64,
    pub read_set: ReadSet,
    pub writer: Option<PeerId>,
    pub page: Option<PageBuf>,
}

impl ManagerEntry {
    /// Single-writer-xor-readers; checked at every handler boundary.
    pub(crate) fn check_invariant(&self) {
        debug_assert!(
            self.writer.is_none() || self.read_set.is_empty(),
            "page {:#x}: writer {:?} coexists with read set {:?}",
            self.shared_va,
            self.writer,
            self.read_set
        );
    }

    /// True when the manager itself holds a usable copy.
    pub(crate) fn manager_has_copy(&self) -> bool {
        self.writer == Some(MANAGER_ID) || self.read_set.contains(MANAGER_ID)
    }
}

pub(crate) struct ManagerPageTable {
    entries: Vec<Mutex<ManagerEntry>>,
}

impl ManagerPageTable {
    pub(crate) fn new(max_pages: usize) -> Self {
        let entries = (0..max_pages)
            .map(|idx| {
                Mutex::new(ManagerEntry {
                    in_use: false,
                    shared_va: VA_START + (idx * PAGE_SIZE) as u64,
                    read_set: ReadSet::default(),
                    writer: None,
                    page: None,
                })
            })
            .collect();
        Self { entries }
    }

    pub(crate) fn entry(&self, idx: usize) -> &Mutex<ManagerEntry> {
        &self.entries[idx]
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Cached entry on a non-manager peer.
pub(crate) struct ClientEntry {
    pub in_use: bool,
    pub shared_va: u64,
    pub access: AccessMode,
    pub page: Option<PageBuf>,
    /// A local thread has a fetch outstanding for this page. This is the
    /// "holds the entry for its whole request" exclusion: other local
    /// threads wait on the condvar instead of issuing a second fetch.
    pub pending: bool,
    /// An invalidation landed while `pending` was set; the in-flight read
    /// response is stale and must be discarded and refetched.
    pub dropped_while_pending: bool,
}

impl ClientEntry {
    pub(crate) fn check_invariant(&self) {
        debug_assert_eq!(
            self.page.is_none(),
            self.access == AccessMode::Invalid,
            "page {:#x}: buffer presence disagrees with access {:?}",
            self.shared_va,
            self.access
        );
    }
}

pub(crate) struct ClientSlot {
    pub state: Mutex<ClientEntry>,
    pub cond: Condvar,
}

pub(crate) struct ClientPageTable {
    slots: Vec<ClientSlot>,
}

impl ClientPageTable {
    pub(crate) fn new(max_pages: usize) -> Self {
        let slots = (0..max_pages)
            .map(|idx| ClientSlot {
                state: Mutex::new(ClientEntry {
                    in_use: false,
                    shared_va: VA_START + (idx * PAGE_SIZE) as u64,
                    access: AccessMode::Invalid,
                    page: None,
                    pending: false,
                    dropped_while_pending: false,
                }),
                cond: Condvar::new(),
            })
            .collect();
        Self { slots }
    }

    pub(crate) fn slot(&self, idx: usize) -> &ClientSlot {
        &self.slots[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_set_tracks_membership() {
        let mut set = ReadSet::default();
        assert!(set.is_empty());
        set.add(0);
        set.add(3);
        set.add(31);
        assert!(set.contains(3));
        assert!(!set.contains(4));
        assert_eq!(set.peers_except(&[0]), vec![3, 31]);
        set.remove(3);
        assert!(!set.contains(3));
        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn manager_table_entries_carry_fixed_addresses() {
        let table = ManagerPageTable::new(4);
        assert_eq!(table.len(), 4);
        let entry = table.entry(2).lock();
        assert_eq!(entry.shared_va, VA_START + 2 * PAGE_SIZE as u64);
        assert!(!entry.in_use);
        entry.check_invariant();
    }

    #[test]
    fn fresh_client_entry_is_invalid_without_buffer() {
        let table = ClientPageTable::new(2);
        let entry = table.slot(1).state.lock();
        assert_eq!(entry.access, AccessMode::Invalid);
        assert!(entry.page.is_none());
        entry.check_invariant();
    }
}
