// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The coherence engine: page fetch, write upgrade, demote, invalidate
//!
//! Jointly observed page states are Unallocated, Exclusive(owner) and
//! Shared(readers); only the manager transitions between them, under the
//! page's entry lock, held across any demote/invalidate sub-protocol. A
//! client requester never blocks on the network while holding its entry
//! mutex: it marks the entry `pending`, releases the mutex, and
//! re-validates when the response arrives. An invalidation that lands
//! mid-fetch marks the in-flight read response stale; the requester
//! discards it and refetches (the race loser's retry always follows
//! another writer's progress, so the loop cannot livelock).
//!
//! Manager-side protocol violations (fetches for unallocated pages,
//! requests from the current writer) drop the offending connection; there
//! is no failure variant in the page-op responses.

use std::sync::Arc;

use log::{debug, error, warn};
use nexus_dsm_packet::{
    Message, TYPE_READ_INVALIDATE_RESP, TYPE_READ_RESP, TYPE_WRITE_DEMOTE_RESP,
    TYPE_WRITE_INVALIDATE_RESP, TYPE_WRITE_RESP,
};

use crate::host::HostInner;
use crate::pagetable::{AccessMode, PageBuf};
use crate::peer::WaitFailure;
use crate::{MemoryError, PeerId, SharedAddress, MANAGER_ID, PAGE_SIZE};

fn wait_to_memory_error(failure: WaitFailure, target: PeerId) -> MemoryError {
    match failure {
        WaitFailure::Timeout => MemoryError::PeerUnresponsive(target),
        WaitFailure::Disconnected(peer) => MemoryError::PeerDisconnected(peer),
        WaitFailure::Lost => MemoryError::PeerDisconnected(target),
    }
}

// ---------------------------------------------------------------------------
// Manager-side handlers (run on the requesting peer's worker thread)
// ---------------------------------------------------------------------------

/// Serves READ_REQ: hand the requester a read-only copy.
pub(crate) fn manager_read(
    host: &Arc<HostInner>,
    requester: PeerId,
    page_va: u64,
) -> Result<(), &'static str> {
    let table = host.manager_table().ok_or("coherence request on a client")?;
    let idx = host
        .page_index_aligned(page_va)
        .ok_or("read request outside the shared range")?;
    let mut entry = table.entry(idx).lock();
    entry.check_invariant();
    if !entry.in_use {
        return Err("read request for an unallocated page");
    }

    let bytes: Vec<u8>;
    if let Some(owner) = entry.writer {
        if owner == requester {
            return Err("read request from the current writer");
        }
        if owner == MANAGER_ID {
            // Demote ourselves in place; nobody else needs to hear about it.
            let page = entry.page.as_ref().ok_or("manager writer without backing page")?;
            bytes = page.to_vec();
            entry.writer = None;
            entry.read_set.add(MANAGER_ID);
            entry.read_set.add(requester);
        } else {
            let wait = host
                .waiters()
                .begin((requester, TYPE_WRITE_DEMOTE_RESP, page_va), vec![owner])
                .ok_or("duplicate outstanding demote for this page")?;
            if let Err(err) = host.send_to(owner, &Message::WriteDemoteReq { page_va, requester }) {
                warn!("page {page_va:#x}: cannot reach owner {owner} for demote: {err}");
                return Ok(());
            }
            match wait.wait(Some(host.reply_timeout())) {
                Ok((_, Message::WriteDemoteResp { page, .. })) => {
                    bytes = page.clone();
                    entry.page = Some(PageBuf::from_wire(page));
                    entry.writer = None;
                    entry.read_set.add(MANAGER_ID);
                    entry.read_set.add(owner);
                    entry.read_set.add(requester);
                }
                Ok((from, other)) => {
                    warn!("peer {from}: unexpected reply to demote: {other:?}");
                    return Ok(());
                }
                Err(failure) => {
                    warn!(
                        "page {page_va:#x}: demote of owner {owner} failed: {}",
                        wait_to_memory_error(failure, owner)
                    );
                    return Ok(());
                }
            }
        }
    } else {
        // Shared: serve from our cached copy without disturbing the readers.
        if !entry.manager_has_copy() || entry.page.is_none() {
            return Err("shared page without a manager copy");
        }
        bytes = match entry.page.as_ref() {
            Some(page) => page.to_vec(),
            None => return Err("shared page without a manager copy"),
        };
        entry.read_set.add(MANAGER_ID);
        entry.read_set.add(requester);
    }

    entry.check_invariant();
    let resp = Message::ReadResp { requester, page_va, page: bytes };
    if let Err(err) = host.send_to(requester, &resp) {
        warn!("page {page_va:#x}: cannot deliver read response to {requester}: {err}");
    }
    Ok(())
}

/// Serves WRITE_REQ: make the requester the sole writer.
pub(crate) fn manager_write(
    host: &Arc<HostInner>,
    requester: PeerId,
    page_va: u64,
) -> Result<(), &'static str> {
    let table = host.manager_table().ok_or("coherence request on a client")?;
    let idx = host
        .page_index_aligned(page_va)
        .ok_or("write request outside the shared range")?;
    let mut entry = table.entry(idx).lock();
    entry.check_invariant();
    if !entry.in_use {
        return Err("write request for an unallocated page");
    }

    let bytes: Vec<u8>;
    if let Some(owner) = entry.writer {
        if owner == requester {
            return Err("write request from the current writer");
        }
        if owner == MANAGER_ID {
            let page = entry.page.take().ok_or("manager writer without backing page")?;
            bytes = page.to_vec();
            entry.writer = Some(requester);
        } else {
            let wait = host
                .waiters()
                .begin((requester, TYPE_WRITE_INVALIDATE_RESP, page_va), vec![owner])
                .ok_or("duplicate outstanding invalidation for this page")?;
            if let Err(err) =
                host.send_to(owner, &Message::WriteInvalidateReq { page_va, requester })
            {
                warn!("page {page_va:#x}: cannot reach owner {owner} for invalidation: {err}");
                return Ok(());
            }
            match wait.wait(Some(host.reply_timeout())) {
                Ok((_, Message::WriteInvalidateResp { page, .. })) => {
                    bytes = page;
                    entry.writer = Some(requester);
                }
                Ok((from, other)) => {
                    warn!("peer {from}: unexpected reply to write invalidation: {other:?}");
                    return Ok(());
                }
                Err(failure) => {
                    warn!(
                        "page {page_va:#x}: invalidation of owner {owner} failed: {}",
                        wait_to_memory_error(failure, owner)
                    );
                    return Ok(());
                }
            }
        }
    } else {
        // Shared: every reader except us and the requester must drop its copy.
        if !entry.read_set.contains(MANAGER_ID) || entry.page.is_none() {
            return Err("shared page without a manager copy");
        }
        let readers = entry.read_set.peers_except(&[MANAGER_ID, requester]);
        if !readers.is_empty() {
            let wait = host
                .waiters()
                .begin((requester, TYPE_READ_INVALIDATE_RESP, page_va), readers.clone())
                .ok_or("duplicate outstanding invalidation for this page")?;
            let mut remaining = Vec::new();
            for reader in &readers {
                match host.send_to(*reader, &Message::ReadInvalidateReq { page_va, requester }) {
                    Ok(()) => remaining.push(*reader),
                    Err(err) => {
                        debug!("page {page_va:#x}: reader {reader} unreachable: {err}");
                        entry.read_set.remove(*reader);
                    }
                }
            }
            while !remaining.is_empty() {
                match wait.wait(Some(host.reply_timeout())) {
                    Ok((from, Message::ReadInvalidateResp { .. })) => {
                        remaining.retain(|r| *r != from);
                        entry.read_set.remove(from);
                    }
                    Ok((from, other)) => {
                        warn!("peer {from}: unexpected reply to read invalidation: {other:?}");
                    }
                    Err(WaitFailure::Disconnected(peer)) => {
                        // A dead reader's copy died with it.
                        remaining.retain(|r| *r != peer);
                        entry.read_set.remove(peer);
                    }
                    Err(failure) => {
                        warn!(
                            "page {page_va:#x}: read invalidation incomplete: {}",
                            wait_to_memory_error(failure, remaining[0])
                        );
                        entry.check_invariant();
                        return Ok(());
                    }
                }
            }
        }
        bytes = match entry.page.take() {
            Some(page) => page.to_vec(),
            None => return Err("shared page without a manager copy"),
        };
        entry.read_set.clear();
        entry.writer = Some(requester);
    }

    entry.check_invariant();
    let resp = Message::WriteResp { requester, page_va, page: bytes };
    if let Err(err) = host.send_to(requester, &resp) {
        warn!("page {page_va:#x}: cannot deliver write response to {requester}: {err}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Manager-local access (the manager's own copy_in/copy_out)
// ---------------------------------------------------------------------------

/// Runs `f` over the page's bytes with the manager holding read access,
/// demoting a remote owner first when necessary.
pub(crate) fn manager_local_read<R>(
    host: &Arc<HostInner>,
    idx: usize,
    f: impl FnOnce(&[u8]) -> R,
) -> Result<R, MemoryError> {
    let table = host
        .manager_table()
        .ok_or(MemoryError::Protocol("manager access on a client"))?;
    let page_va = host.va_of(idx);
    let mut entry = table.entry(idx).lock();
    entry.check_invariant();
    if !entry.in_use {
        return Err(MemoryError::NotAllocated);
    }

    if !entry.manager_has_copy() {
        if let Some(owner) = entry.writer {
            let wait = host
                .waiters()
                .begin((MANAGER_ID, TYPE_WRITE_DEMOTE_RESP, page_va), vec![owner])
                .ok_or(MemoryError::Protocol("duplicate outstanding demote"))?;
            host.send_to(owner, &Message::WriteDemoteReq { page_va, requester: MANAGER_ID })?;
            match wait.wait(Some(host.reply_timeout())) {
                Ok((_, Message::WriteDemoteResp { page, .. })) => {
                    entry.page = Some(PageBuf::from_wire(page));
                    entry.writer = None;
                    entry.read_set.add(MANAGER_ID);
                    entry.read_set.add(owner);
                }
                Ok(_) => return Err(MemoryError::Protocol("mismatched demote response")),
                Err(failure) => return Err(wait_to_memory_error(failure, owner)),
            }
        } else if entry.page.is_some() {
            entry.read_set.add(MANAGER_ID);
        } else {
            return Err(MemoryError::Protocol("shared page without a manager copy"));
        }
    }

    entry.check_invariant();
    match entry.page.as_ref() {
        Some(page) => Ok(f(page.bytes())),
        None => Err(MemoryError::Protocol("reader without backing page")),
    }
}

/// Runs `f` over the page's bytes with the manager holding exclusive write
/// access, invalidating remote holders first when necessary.
pub(crate) fn manager_local_write<R>(
    host: &Arc<HostInner>,
    idx: usize,
    f: impl FnOnce(&mut [u8]) -> R,
) -> Result<R, MemoryError> {
    let table = host
        .manager_table()
        .ok_or(MemoryError::Protocol("manager access on a client"))?;
    let page_va = host.va_of(idx);
    let mut entry = table.entry(idx).lock();
    entry.check_invariant();
    if !entry.in_use {
        return Err(MemoryError::NotAllocated);
    }

    if entry.writer != Some(MANAGER_ID) {
        if let Some(owner) = entry.writer {
            let wait = host
                .waiters()
                .begin((MANAGER_ID, TYPE_WRITE_INVALIDATE_RESP, page_va), vec![owner])
                .ok_or(MemoryError::Protocol("duplicate outstanding invalidation"))?;
            host.send_to(owner, &Message::WriteInvalidateReq { page_va, requester: MANAGER_ID })?;
            match wait.wait(Some(host.reply_timeout())) {
                Ok((_, Message::WriteInvalidateResp { page, .. })) => {
                    entry.page = Some(PageBuf::from_wire(page));
                    entry.writer = Some(MANAGER_ID);
                }
                Ok(_) => return Err(MemoryError::Protocol("mismatched invalidation response")),
                Err(failure) => return Err(wait_to_memory_error(failure, owner)),
            }
        } else {
            if !entry.read_set.contains(MANAGER_ID) || entry.page.is_none() {
                return Err(MemoryError::Protocol("shared page without a manager copy"));
            }
            let readers = entry.read_set.peers_except(&[MANAGER_ID]);
            if !readers.is_empty() {
                let wait = host
                    .waiters()
                    .begin((MANAGER_ID, TYPE_READ_INVALIDATE_RESP, page_va), readers.clone())
                    .ok_or(MemoryError::Protocol("duplicate outstanding invalidation"))?;
                let mut remaining = Vec::new();
                for reader in &readers {
                    match host
                        .send_to(*reader, &Message::ReadInvalidateReq { page_va, requester: MANAGER_ID })
                    {
                        Ok(()) => remaining.push(*reader),
                        Err(err) => {
                            debug!("page {page_va:#x}: reader {reader} unreachable: {err}");
                            entry.read_set.remove(*reader);
                        }
                    }
                }
                while !remaining.is_empty() {
                    match wait.wait(Some(host.reply_timeout())) {
                        Ok((from, Message::ReadInvalidateResp { .. })) => {
                            remaining.retain(|r| *r != from);
                            entry.read_set.remove(from);
                        }
                        Ok((from, other)) => {
                            warn!("peer {from}: unexpected reply to read invalidation: {other:?}");
                        }
                        Err(WaitFailure::Disconnected(peer)) => {
                            remaining.retain(|r| *r != peer);
                            entry.read_set.remove(peer);
                        }
                        Err(failure) => {
                            entry.check_invariant();
                            return Err(wait_to_memory_error(failure, remaining[0]));
                        }
                    }
                }
            }
            entry.read_set.clear();
            entry.writer = Some(MANAGER_ID);
        }
    }

    entry.check_invariant();
    match entry.page.as_mut() {
        Some(page) => Ok(f(page.bytes_mut())),
        None => Err(MemoryError::Protocol("writer without backing page")),
    }
}

// ---------------------------------------------------------------------------
// Client-side access paths
// ---------------------------------------------------------------------------

fn fetch_remote(
    host: &Arc<HostInner>,
    resp_type: u32,
    request: Message,
    page_va: u64,
) -> Result<Vec<u8>, MemoryError> {
    let wait = host
        .waiters()
        .begin((host.self_id(), resp_type, page_va), vec![MANAGER_ID])
        .ok_or(MemoryError::Protocol("duplicate outstanding fetch"))?;
    host.send_to(MANAGER_ID, &request)?;
    match wait.wait(Some(host.reply_timeout())) {
        Ok((_, Message::ReadResp { page, .. })) | Ok((_, Message::WriteResp { page, .. })) => {
            Ok(page)
        }
        Ok(_) => Err(MemoryError::Protocol("mismatched fetch response")),
        Err(failure) => Err(wait_to_memory_error(failure, MANAGER_ID)),
    }
}

/// Runs `f` over a readable copy of the page, fetching one if needed.
pub(crate) fn client_with_page_read<R>(
    host: &Arc<HostInner>,
    idx: usize,
    f: impl FnOnce(&[u8]) -> R,
) -> Result<R, MemoryError> {
    let mut f = Some(f);
    let page_va = host.va_of(idx);
    let slot = host.client_table().slot(idx);
    loop {
        let mut entry = slot.state.lock();
        while entry.pending {
            slot.cond.wait(&mut entry);
        }
        match entry.access {
            AccessMode::ReadOnly | AccessMode::ReadWrite => {
                return match entry.page.as_ref() {
                    Some(page) => Ok((f.take().unwrap())(page.bytes())),
                    None => Err(MemoryError::Protocol("readable page without buffer")),
                };
            }
            AccessMode::Invalid => {
                entry.pending = true;
                entry.dropped_while_pending = false;
                drop(entry);

                let fetched = fetch_remote(
                    host,
                    TYPE_READ_RESP,
                    Message::ReadReq { requester: host.self_id(), page_va },
                    page_va,
                );

                let mut entry = slot.state.lock();
                entry.pending = false;
                let outcome = match fetched {
                    Ok(page) => {
                        if entry.dropped_while_pending {
                            debug!("page {page_va:#x}: copy invalidated mid-fetch; refetching");
                            None
                        } else {
                            let buf = PageBuf::from_wire(page);
                            let result = (f.take().unwrap())(buf.bytes());
                            entry.in_use = true;
                            entry.page = Some(buf);
                            entry.access = AccessMode::ReadOnly;
                            entry.check_invariant();
                            Some(Ok(result))
                        }
                    }
                    Err(err) => Some(Err(err)),
                };
                drop(entry);
                slot.cond.notify_all();
                match outcome {
                    Some(result) => return result,
                    None => continue,
                }
            }
        }
    }
}

/// Runs `f` over a writable copy of the page, upgrading access if needed.
/// The response bytes are authoritative (produced under the manager's page
/// lock after this peer became writer), so no refetch loop is required.
pub(crate) fn client_with_page_write<R>(
    host: &Arc<HostInner>,
    idx: usize,
    f: impl FnOnce(&mut [u8]) -> R,
) -> Result<R, MemoryError> {
    let page_va = host.va_of(idx);
    let slot = host.client_table().slot(idx);
    let mut entry = slot.state.lock();
    while entry.pending {
        slot.cond.wait(&mut entry);
    }
    match entry.access {
        AccessMode::ReadWrite => match entry.page.as_mut() {
            Some(page) => Ok(f(page.bytes_mut())),
            None => Err(MemoryError::Protocol("writable page without buffer")),
        },
        AccessMode::ReadOnly | AccessMode::Invalid => {
            entry.pending = true;
            entry.dropped_while_pending = false;
            drop(entry);

            let fetched = fetch_remote(
                host,
                TYPE_WRITE_RESP,
                Message::WriteReq { requester: host.self_id(), page_va },
                page_va,
            );

            let mut entry = slot.state.lock();
            entry.pending = false;
            let result = match fetched {
                Ok(page) => {
                    let mut buf = PageBuf::from_wire(page);
                    let result = f(buf.bytes_mut());
                    entry.in_use = true;
                    entry.page = Some(buf);
                    entry.access = AccessMode::ReadWrite;
                    entry.check_invariant();
                    Ok(result)
                }
                Err(err) => Err(err),
            };
            drop(entry);
            slot.cond.notify_all();
            result
        }
    }
}

// ---------------------------------------------------------------------------
// Client-side handlers (run on the manager connection's worker thread)
// ---------------------------------------------------------------------------

/// WRITE_DEMOTE_REQ: step down from writer to reader, shipping the page.
/// Waits out an in-flight upgrade first; the manager only demotes a peer it
/// has already made writer, so the entry must settle to ReadWrite.
pub(crate) fn client_write_demote(
    host: &Arc<HostInner>,
    page_va: u64,
    requester: PeerId,
) -> Result<(), &'static str> {
    let idx = host
        .page_index_aligned(page_va)
        .ok_or("demote outside the shared range")?;
    let slot = host.client_table().slot(idx);
    let mut entry = slot.state.lock();
    while entry.pending {
        slot.cond.wait(&mut entry);
    }
    if entry.access != AccessMode::ReadWrite {
        error!("page {page_va:#x}: demote while held {:?}", entry.access);
        debug_assert!(false, "demote for a page not held read-write");
        return Err("demote for a page not held read-write");
    }
    let bytes = match entry.page.as_ref() {
        Some(page) => page.to_vec(),
        None => return Err("writable page without buffer"),
    };
    entry.access = AccessMode::ReadOnly;
    entry.check_invariant();
    drop(entry);

    let resp = Message::WriteDemoteResp { requester, page_va, page: bytes };
    if let Err(err) = host.send_to(MANAGER_ID, &resp) {
        warn!("page {page_va:#x}: cannot deliver demote response: {err}");
    }
    Ok(())
}

/// WRITE_INVALIDATE_REQ: drop write access entirely, shipping the page.
pub(crate) fn client_write_invalidate(
    host: &Arc<HostInner>,
    page_va: u64,
    requester: PeerId,
) -> Result<(), &'static str> {
    let idx = host
        .page_index_aligned(page_va)
        .ok_or("invalidation outside the shared range")?;
    let slot = host.client_table().slot(idx);
    let mut entry = slot.state.lock();
    while entry.pending {
        slot.cond.wait(&mut entry);
    }
    if entry.access != AccessMode::ReadWrite {
        error!("page {page_va:#x}: write invalidation while held {:?}", entry.access);
        debug_assert!(false, "write invalidation for a page not held read-write");
        return Err("write invalidation for a page not held read-write");
    }
    let bytes = match entry.page.take() {
        Some(page) => page.to_vec(),
        None => return Err("writable page without buffer"),
    };
    entry.access = AccessMode::Invalid;
    entry.check_invariant();
    drop(entry);

    let resp = Message::WriteInvalidateResp { requester, page_va, page: bytes };
    if let Err(err) = host.send_to(MANAGER_ID, &resp) {
        warn!("page {page_va:#x}: cannot deliver invalidation response: {err}");
    }
    Ok(())
}

/// READ_INVALIDATE_REQ: drop a read-only copy. Does not wait for an
/// in-flight fetch; it marks it stale instead, so the fetching thread
/// discards the response and refetches.
pub(crate) fn client_read_invalidate(
    host: &Arc<HostInner>,
    page_va: u64,
    requester: PeerId,
) -> Result<(), &'static str> {
    let idx = host
        .page_index_aligned(page_va)
        .ok_or("invalidation outside the shared range")?;
    let slot = host.client_table().slot(idx);
    let mut entry = slot.state.lock();
    if entry.pending {
        entry.dropped_while_pending = true;
        if entry.access == AccessMode::ReadOnly {
            entry.access = AccessMode::Invalid;
            entry.page = None;
        }
    } else {
        match entry.access {
            AccessMode::ReadOnly => {
                entry.access = AccessMode::Invalid;
                entry.page = None;
            }
            AccessMode::Invalid => {
                error!("page {page_va:#x}: read invalidation for a copy we do not hold");
                debug_assert!(false, "read invalidation for a page not held");
            }
            AccessMode::ReadWrite => {
                return Err("read invalidation for a page held read-write");
            }
        }
    }
    entry.check_invariant();
    drop(entry);

    let resp = Message::ReadInvalidateResp { requester, page_va };
    if let Err(err) = host.send_to(MANAGER_ID, &resp) {
        warn!("page {page_va:#x}: cannot deliver invalidation ack: {err}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// The two coherence-triggering primitives
// ---------------------------------------------------------------------------

/// Copies shared memory into a local buffer, faulting pages in read-only as
/// needed. Pages are visited in ascending index order.
pub(crate) fn copy_in(
    host: &Arc<HostInner>,
    dest: &mut [u8],
    src: SharedAddress,
) -> Result<(), MemoryError> {
    if dest.is_empty() {
        return Ok(());
    }
    let (first, last) = host.range_pages(src.raw(), dest.len())?;
    let mut copied = 0usize;
    for idx in first..=last {
        let page_base = host.va_of(idx);
        let start = if idx == first {
            (src.raw() - page_base) as usize
        } else {
            0
        };
        let n = (PAGE_SIZE - start).min(dest.len() - copied);
        let chunk = &mut dest[copied..copied + n];
        if host.is_manager() {
            manager_local_read(host, idx, |bytes| chunk.copy_from_slice(&bytes[start..start + n]))?;
        } else {
            client_with_page_read(host, idx, |bytes| {
                chunk.copy_from_slice(&bytes[start..start + n])
            })?;
        }
        copied += n;
    }
    Ok(())
}

/// Copies a local buffer into shared memory, upgrading pages to read-write
/// as needed. Pages are visited in ascending index order.
pub(crate) fn copy_out(
    host: &Arc<HostInner>,
    dest: SharedAddress,
    src: &[u8],
) -> Result<(), MemoryError> {
    if src.is_empty() {
        return Ok(());
    }
    let (first, last) = host.range_pages(dest.raw(), src.len())?;
    let mut copied = 0usize;
    for idx in first..=last {
        let page_base = host.va_of(idx);
        let start = if idx == first {
            (dest.raw() - page_base) as usize
        } else {
            0
        };
        let n = (PAGE_SIZE - start).min(src.len() - copied);
        let chunk = &src[copied..copied + n];
        if host.is_manager() {
            manager_local_write(host, idx, |bytes| {
                bytes[start..start + n].copy_from_slice(chunk)
            })?;
        } else {
            client_with_page_write(host, idx, |bytes| {
                bytes[start..start + n].copy_from_slice(chunk)
            })?;
        }
        copied += n;
    }
    Ok(())
}
