// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Distributed soft memory (DSM) userland library
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! A page-granular software distributed-shared-memory layer. Peers share one
//! fixed virtual address range; the manager (peer 0) owns the authoritative
//! page table and serialises ownership transfers per page. Clients cache
//! pages and reach the manager over blocking TCP with a fixed message
//! catalogue (`nexus-dsm-packet`). Memory access is explicit: `copy_in` /
//! `copy_out` trigger coherence fetches; there is no fault interception.
//!
//! Concurrency model: OS threads throughout. Each peer connection owns a
//! reader thread and a worker thread; requesters block on correlated
//! responses with a deadline. Nothing spins.

#![forbid(unsafe_code)]

use std::time::Duration;

use thiserror::Error;

pub use nexus_dsm_packet::{WireError, PAGE_SIZE};

mod allocator;
mod coherence;
mod host;
mod pagetable;
mod peer;
mod rthread;
mod transport;

pub use host::{Config, Host};
pub use pagetable::AccessMode;
pub use rthread::{Procedure, ThreadHandle};
pub use transport::TransportError;

/// Stable small-integer peer identity; 0 is always the manager.
pub type PeerId = u32;

/// The manager's well-known peer id.
pub const MANAGER_ID: PeerId = 0;

/// Upper bound on machines in a session (fixed topology).
pub const MAX_PEERS: usize = 32;

/// Base of the shared virtual address range; identical on every machine.
pub const VA_START: u64 = 0x6000_0000_0000;

/// Default number of page-table entries when `Config` does not override it.
pub const DEFAULT_MAX_PAGES: usize = 4096;

/// Default deadline for a correlated response.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// An address inside the shared range. Constructed by [`Host::allocate`] or
/// [`SharedAddress::new`]; arithmetic stays in the shared range or fails at
/// the operation that uses it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SharedAddress(pub u64);

impl SharedAddress {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Byte offset within the containing page.
    pub fn page_offset(self) -> usize {
        (self.0 as usize) % PAGE_SIZE
    }

    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// Errors surfaced by memory operations (`allocate`, `copy_in`, `copy_out`).
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The range is not inside `[VA_START, VA_START + max_pages * PAGE_SIZE)`.
    #[error("address range is outside the shared region")]
    OutOfRange,
    /// The manager's page table has no run of free entries large enough.
    #[error("shared page table exhausted")]
    AllocFailed,
    /// The page was never allocated.
    #[error("page is not allocated")]
    NotAllocated,
    /// The remote side did not answer before the deadline.
    #[error("peer {0} did not respond before the deadline")]
    PeerUnresponsive(PeerId),
    /// The remote side disconnected while the request was outstanding.
    #[error("peer {0} disconnected")]
    PeerDisconnected(PeerId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The peer observed a coherence state the protocol forbids.
    #[error("coherence protocol violation: {0}")]
    Protocol(&'static str),
}

/// Errors surfaced by remote thread coordination.
#[derive(Debug, Error)]
pub enum ThreadError {
    /// Every eligible peer already hosts a thread.
    #[error("no idle peer available to host the thread")]
    NoIdlePeer,
    /// The procedure name is absent from the registry.
    #[error("procedure is not registered: {0}")]
    UnknownProcedure(String),
    /// The handle is invalid or does not name a live remote thread.
    #[error("thread handle does not name a live remote thread")]
    InvalidHandle,
    /// The hosting peer reported the procedure panicked.
    #[error("remote procedure terminated abnormally")]
    RemoteAbort,
    #[error("peer {0} did not respond before the deadline")]
    PeerUnresponsive(PeerId),
    #[error("peer {0} disconnected")]
    PeerDisconnected(PeerId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The peer observed a thread-coordination state the protocol forbids.
    #[error("thread protocol violation: {0}")]
    Protocol(&'static str),
}

/// Errors during one-time host construction and topology formation.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("bootstrap io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The manager refused the join (table full, wrong packet, ...).
    #[error("manager rejected the connection")]
    Rejected,
    /// The remote side sent a packet the bootstrap sequence does not allow.
    #[error("unexpected bootstrap packet")]
    Protocol,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
