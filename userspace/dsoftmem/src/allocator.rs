// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Contiguous page allocation over the manager's page table
//!
//! Entries are never freed, so a single monotonically increasing
//! first-unallocated cursor suffices; exhaustion leaves the cursor
//! untouched. Failure reaches the caller as a typed error; on the wire it
//! is an ALLOC_RESP with `n_pages == 0`, never a zero address posing as a
//! success.

use std::sync::Arc;

use log::{debug, warn};
use nexus_dsm_packet::{Message, TYPE_ALLOC_RESP};

use crate::host::HostInner;
use crate::pagetable::PageBuf;
use crate::peer::WaitFailure;
use crate::{MemoryError, PeerId, SharedAddress, MANAGER_ID, PAGE_SIZE};

/// Reserves `n_pages` contiguous entries for `requester`. Runs only on the
/// manager; the cursor mutex serialises local and service-worker callers.
pub(crate) fn manager_allocate(
    host: &Arc<HostInner>,
    requester: PeerId,
    n_pages: usize,
) -> Result<SharedAddress, MemoryError> {
    let table = host
        .manager_table()
        .ok_or(MemoryError::Protocol("allocation on a client"))?;
    if n_pages == 0 {
        return Err(MemoryError::AllocFailed);
    }

    let mut cursor = host.alloc_cursor().lock();
    let first = *cursor;
    if n_pages > table.len() || first > table.len() - n_pages {
        debug!("allocation of {n_pages} pages refused: {first} of {} used", table.len());
        return Err(MemoryError::AllocFailed);
    }
    for idx in first..first + n_pages {
        let mut entry = table.entry(idx).lock();
        entry.in_use = true;
        entry.writer = Some(requester);
        // The manager only materialises backing storage for its own pages;
        // a remote owner starts from its local zero-filled buffers.
        entry.page = if requester == MANAGER_ID {
            Some(PageBuf::zeroed())
        } else {
            None
        };
        entry.check_invariant();
    }
    *cursor = first + n_pages;
    Ok(SharedAddress(host.va_of(first)))
}

/// Serves ALLOC_REQ on the manager's service worker.
pub(crate) fn handle_alloc_req(
    host: &Arc<HostInner>,
    requester: PeerId,
    n_pages: u32,
) -> Result<(), &'static str> {
    let resp = match manager_allocate(host, requester, n_pages as usize) {
        Ok(base) => Message::AllocResp { requester, base_va: base.raw(), n_pages },
        Err(err) => {
            debug!("peer {requester}: allocation of {n_pages} pages failed: {err}");
            Message::AllocResp { requester, base_va: 0, n_pages: 0 }
        }
    };
    if let Err(err) = host.send_to(requester, &resp) {
        warn!("peer {requester}: cannot deliver allocation response: {err}");
    }
    Ok(())
}

/// Client-side allocation: blocking request to the manager, then local
/// entries for the new range (the requester starts as its sole writer with
/// zero-filled buffers).
pub(crate) fn client_allocate(
    host: &Arc<HostInner>,
    n_pages: usize,
) -> Result<SharedAddress, MemoryError> {
    if n_pages == 0 || n_pages > u32::MAX as usize {
        return Err(MemoryError::AllocFailed);
    }
    let _lane = host.call_lane().lock();
    let wait = host
        .waiters()
        .begin((host.self_id(), TYPE_ALLOC_RESP, 0), vec![MANAGER_ID])
        .ok_or(MemoryError::Protocol("duplicate outstanding allocation"))?;
    host.send_to(
        MANAGER_ID,
        &Message::AllocReq { requester: host.self_id(), n_pages: n_pages as u32 },
    )?;
    let (_, msg) = wait.wait(Some(host.reply_timeout())).map_err(|failure| match failure {
        WaitFailure::Timeout => MemoryError::PeerUnresponsive(MANAGER_ID),
        WaitFailure::Disconnected(peer) => MemoryError::PeerDisconnected(peer),
        WaitFailure::Lost => MemoryError::PeerDisconnected(MANAGER_ID),
    })?;
    let (base_va, granted) = match msg {
        Message::AllocResp { base_va, n_pages, .. } => (base_va, n_pages as usize),
        _ => return Err(MemoryError::Protocol("mismatched allocation response")),
    };
    if granted == 0 {
        return Err(MemoryError::AllocFailed);
    }
    if granted != n_pages {
        return Err(MemoryError::Protocol("allocation response page count drifted"));
    }

    let (first, last) = host.range_pages(base_va, granted * PAGE_SIZE)?;
    for idx in first..=last {
        let slot = host.client_table().slot(idx);
        let mut entry = slot.state.lock();
        entry.in_use = true;
        entry.page = Some(PageBuf::zeroed());
        entry.access = crate::pagetable::AccessMode::ReadWrite;
        entry.check_invariant();
    }
    Ok(SharedAddress(base_va))
}
