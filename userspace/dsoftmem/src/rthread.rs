// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Remote thread coordination (create / assign / join)
//!
//! Any peer may ask the manager to start a registered procedure on an idle
//! peer; only the manager originates assignments. A peer hosts at most one
//! assigned thread at a time (one "core" of remote execution per machine).
//! Joining flows requester → hosting peer directly over the mesh; a join
//! for a thread the target is not hosting is refused, never left hanging.
//!
//! The manager's busy marks are advisory: the target's accept/refuse on
//! THREAD_ASSIGN_REQ is authoritative, so the idle scan probes marked
//! peers too before reporting exhaustion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use nexus_dsm_packet::{
    Message, THREAD_STATUS_ABORTED, THREAD_STATUS_NOT_MINE, THREAD_STATUS_OK,
    THREAD_STATUS_REFUSED, THREAD_STATUS_UNKNOWN_PROCEDURE, TYPE_THREAD_ASSIGN_RESP,
    TYPE_THREAD_CREATE_RESP, TYPE_THREAD_JOIN_RESP,
};
use parking_lot::Mutex;

use crate::host::HostInner;
use crate::peer::WaitFailure;
use crate::{Host, PeerId, ThreadError, MANAGER_ID, MAX_PEERS};

/// A procedure runnable on a remote peer. The argument is commonly a
/// shared address produced by `allocate`.
pub type Procedure = fn(&Host, u64) -> u64;

/// Handle to a thread hosted on some peer. Invalid handles come from
/// failed creates and never name a live thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadHandle {
    valid: bool,
    peer_id: PeerId,
    thread_id: u64,
}

impl ThreadHandle {
    pub(crate) fn new(peer_id: PeerId, thread_id: u64) -> Self {
        Self { valid: true, peer_id, thread_id }
    }

    pub fn invalid() -> Self {
        Self { valid: false, peer_id: 0, thread_id: 0 }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn hosting_peer(&self) -> PeerId {
        self.peer_id
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }
}

struct HostedThread {
    thread_id: u64,
    join: Option<thread::JoinHandle<u64>>,
}

/// Per-host thread-coordination state.
#[derive(Default)]
pub(crate) struct ThreadCoord {
    procs: Mutex<Vec<(String, Procedure)>>,
    hosted: Mutex<Option<HostedThread>>,
    next_thread_id: AtomicU64,
    busy: Mutex<[bool; MAX_PEERS]>,
}

impl ThreadCoord {
    /// Registers a procedure; ids are registration order, so every peer
    /// must register the same table before threads are spawned.
    pub(crate) fn register(&self, name: &str, procedure: Procedure) {
        self.procs.lock().push((name.to_string(), procedure));
    }

    fn lookup_id(&self, name: &str) -> Option<u64> {
        self.procs.lock().iter().position(|(n, _)| n == name).map(|i| i as u64)
    }

    fn by_id(&self, id: u64) -> Option<Procedure> {
        self.procs.lock().get(id as usize).map(|(_, p)| *p)
    }

    /// The handle of the thread this peer is currently hosting, if any.
    pub(crate) fn hosted_handle(&self, self_id: PeerId) -> Option<ThreadHandle> {
        self.hosted.lock().as_ref().map(|h| ThreadHandle::new(self_id, h.thread_id))
    }
}

fn wait_to_thread_error(failure: WaitFailure, target: PeerId) -> ThreadError {
    match failure {
        WaitFailure::Timeout => ThreadError::PeerUnresponsive(target),
        WaitFailure::Disconnected(peer) => ThreadError::PeerDisconnected(peer),
        WaitFailure::Lost => ThreadError::PeerDisconnected(target),
    }
}

/// Entry point for [`Host::spawn_remote`].
pub(crate) fn spawn_remote(
    host: &Arc<HostInner>,
    name: &str,
    arg: u64,
) -> Result<ThreadHandle, ThreadError> {
    let procedure = host
        .threads()
        .lookup_id(name)
        .ok_or_else(|| ThreadError::UnknownProcedure(name.to_string()))?;
    let _lane = host.call_lane().lock();
    if host.is_manager() {
        manager_spawn(host, MANAGER_ID, procedure, arg)
    } else {
        let wait = host
            .waiters()
            .begin((host.self_id(), TYPE_THREAD_CREATE_RESP, 0), vec![MANAGER_ID])
            .ok_or(ThreadError::Protocol("duplicate outstanding create"))?;
        host.send_to(
            MANAGER_ID,
            &Message::ThreadCreateReq { requester: host.self_id(), procedure, arg },
        )?;
        match wait.wait(Some(host.reply_timeout())) {
            Ok((_, Message::ThreadCreateResp { valid, peer_id, thread_id, .. })) => {
                if valid {
                    Ok(ThreadHandle::new(peer_id, thread_id))
                } else {
                    Err(ThreadError::NoIdlePeer)
                }
            }
            Ok(_) => Err(ThreadError::Protocol("mismatched create response")),
            Err(failure) => Err(wait_to_thread_error(failure, MANAGER_ID)),
        }
    }
}

/// Manager-side idle scan and assignment; `parent` is the requesting peer
/// (the manager itself for local spawns).
fn manager_spawn(
    host: &Arc<HostInner>,
    parent: PeerId,
    procedure: u64,
    arg: u64,
) -> Result<ThreadHandle, ThreadError> {
    let coord = host.threads();
    let connected: Vec<PeerId> =
        (1..MAX_PEERS as PeerId).filter(|id| host.slot(*id).is_connected()).collect();
    // Unmarked peers first; marks are advisory, so marked ones are probed
    // before giving up.
    let mut candidates: Vec<PeerId> = {
        let busy = coord.busy.lock();
        let (idle, marked): (Vec<PeerId>, Vec<PeerId>) =
            connected.into_iter().partition(|id| !busy[*id as usize]);
        idle.into_iter().chain(marked).collect()
    };
    if candidates.is_empty() {
        return Err(ThreadError::NoIdlePeer);
    }

    for target in candidates.drain(..) {
        let thread_id = coord.next_thread_id.fetch_add(1, Ordering::Relaxed) + 1;
        let wait = match host
            .waiters()
            .begin((parent, TYPE_THREAD_ASSIGN_RESP, 0), vec![target])
        {
            Some(wait) => wait,
            None => return Err(ThreadError::Protocol("duplicate outstanding assignment")),
        };
        if let Err(err) = host.send_to(
            target,
            &Message::ThreadAssignReq { parent, procedure, arg, thread_id },
        ) {
            debug!("peer {target}: unreachable for assignment: {err}");
            continue;
        }
        match wait.wait(Some(host.reply_timeout())) {
            Ok((_, Message::ThreadAssignResp { status, .. })) => match status {
                THREAD_STATUS_OK => {
                    coord.busy.lock()[target as usize] = true;
                    debug!("thread {thread_id} assigned to peer {target} (parent {parent})");
                    return Ok(ThreadHandle::new(target, thread_id));
                }
                THREAD_STATUS_REFUSED => {
                    coord.busy.lock()[target as usize] = true;
                }
                THREAD_STATUS_UNKNOWN_PROCEDURE => {
                    return Err(ThreadError::UnknownProcedure(format!("id {procedure}")))
                }
                other => warn!("peer {target}: unexpected assignment status {other}"),
            },
            Ok((from, other)) => {
                warn!("peer {from}: unexpected reply to assignment: {other:?}");
            }
            Err(failure) => {
                debug!(
                    "peer {target}: assignment probe failed: {}",
                    wait_to_thread_error(failure, target)
                );
            }
        }
    }
    Err(ThreadError::NoIdlePeer)
}

/// Serves THREAD_CREATE_REQ on the manager's service worker.
pub(crate) fn handle_create(
    host: &Arc<HostInner>,
    requester: PeerId,
    procedure: u64,
    arg: u64,
) -> Result<(), &'static str> {
    if host.manager_table().is_none() {
        return Err("thread create sent to a client");
    }
    let resp = match manager_spawn(host, requester, procedure, arg) {
        Ok(handle) => Message::ThreadCreateResp {
            requester,
            valid: true,
            peer_id: handle.hosting_peer(),
            thread_id: handle.thread_id(),
        },
        Err(err) => {
            debug!("peer {requester}: thread create failed: {err}");
            Message::ThreadCreateResp { requester, valid: false, peer_id: 0, thread_id: 0 }
        }
    };
    if let Err(err) = host.send_to(requester, &resp) {
        warn!("peer {requester}: cannot deliver create response: {err}");
    }
    Ok(())
}

/// Serves THREAD_ASSIGN_REQ on a client (dispatch already verified the
/// sender is the manager).
pub(crate) fn handle_assign(
    host: &Arc<HostInner>,
    parent: PeerId,
    procedure: u64,
    arg: u64,
    thread_id: u64,
) -> Result<(), &'static str> {
    if host.is_manager() {
        return Err("thread assignment sent to the manager");
    }
    let coord = host.threads();
    let status = {
        let mut hosted = coord.hosted.lock();
        if hosted.is_some() {
            THREAD_STATUS_REFUSED
        } else {
            match coord.by_id(procedure) {
                None => THREAD_STATUS_UNKNOWN_PROCEDURE,
                Some(proc_fn) => {
                    let for_thread = Host::from_inner(Arc::clone(host));
                    let spawned = thread::Builder::new()
                        .name(format!("dsm-thread-{thread_id}"))
                        .spawn(move || proc_fn(&for_thread, arg));
                    match spawned {
                        Ok(join) => {
                            *hosted = Some(HostedThread { thread_id, join: Some(join) });
                            THREAD_STATUS_OK
                        }
                        Err(err) => {
                            warn!("thread {thread_id}: spawn failed: {err}");
                            THREAD_STATUS_REFUSED
                        }
                    }
                }
            }
        }
    };
    let resp = Message::ThreadAssignResp { requester: parent, status };
    if let Err(err) = host.send_to(MANAGER_ID, &resp) {
        warn!("thread {thread_id}: cannot deliver assignment response: {err}");
    }
    Ok(())
}

/// Serves THREAD_JOIN_REQ. The real join may take arbitrarily long, so it
/// runs on a helper thread instead of wedging the sender's worker; the
/// hosted slot is cleared only once the join completes, keeping the
/// one-thread-per-peer invariant while the procedure still runs.
pub(crate) fn handle_join(
    host: &Arc<HostInner>,
    requester: PeerId,
    peer_id: PeerId,
    thread_id: u64,
) -> Result<(), &'static str> {
    let refuse = |host: &Arc<HostInner>| {
        let resp = Message::ThreadJoinResp {
            requester,
            status: THREAD_STATUS_NOT_MINE,
            return_value: 0,
        };
        if let Err(err) = host.send_to(requester, &resp) {
            warn!("thread {thread_id}: cannot deliver join refusal: {err}");
        }
    };

    if peer_id != host.self_id() {
        refuse(host);
        return Ok(());
    }
    let coord = host.threads();
    let join = {
        let mut hosted = coord.hosted.lock();
        match hosted.as_mut() {
            Some(h) if h.thread_id == thread_id => h.join.take(),
            _ => None,
        }
    };
    let Some(join) = join else {
        refuse(host);
        return Ok(());
    };

    let for_helper = Arc::clone(host);
    let spawned = thread::Builder::new()
        .name(format!("dsm-join-{thread_id}"))
        .spawn(move || {
            let (status, return_value) = match join.join() {
                Ok(value) => (THREAD_STATUS_OK, value),
                Err(_) => (THREAD_STATUS_ABORTED, 0),
            };
            {
                let mut hosted = for_helper.threads().hosted.lock();
                if hosted.as_ref().map(|h| h.thread_id) == Some(thread_id) {
                    *hosted = None;
                }
            }
            let resp = Message::ThreadJoinResp { requester, status, return_value };
            if let Err(err) = for_helper.send_to(requester, &resp) {
                warn!("thread {thread_id}: cannot deliver join response: {err}");
            }
        });
    if let Err(err) = spawned {
        warn!("thread {thread_id}: cannot spawn join helper: {err}");
        refuse(host);
    }
    Ok(())
}

/// Entry point for [`Host::join_remote`].
pub(crate) fn join_remote(host: &Arc<HostInner>, handle: &ThreadHandle) -> Result<u64, ThreadError> {
    if !handle.is_valid() {
        return Err(ThreadError::InvalidHandle);
    }
    if handle.hosting_peer() == host.self_id() {
        // A thread we host ourselves joins locally.
        let coord = host.threads();
        let join = {
            let mut hosted = coord.hosted.lock();
            match hosted.as_mut() {
                Some(h) if h.thread_id == handle.thread_id() => h.join.take(),
                _ => None,
            }
        };
        let join = join.ok_or(ThreadError::InvalidHandle)?;
        let result = join.join();
        {
            let mut hosted = coord.hosted.lock();
            if hosted.as_ref().map(|h| h.thread_id) == Some(handle.thread_id()) {
                *hosted = None;
            }
        }
        return result.map_err(|_| ThreadError::RemoteAbort);
    }

    let _lane = host.join_lane().lock();
    let wait = host
        .waiters()
        .begin((host.self_id(), TYPE_THREAD_JOIN_RESP, 0), vec![handle.hosting_peer()])
        .ok_or(ThreadError::Protocol("duplicate outstanding join"))?;
    host.send_to(
        handle.hosting_peer(),
        &Message::ThreadJoinReq {
            requester: host.self_id(),
            peer_id: handle.hosting_peer(),
            thread_id: handle.thread_id(),
        },
    )?;
    match wait.wait(host.join_timeout()) {
        Ok((_, Message::ThreadJoinResp { status, return_value, .. })) => match status {
            THREAD_STATUS_OK => Ok(return_value),
            THREAD_STATUS_ABORTED => Err(ThreadError::RemoteAbort),
            THREAD_STATUS_NOT_MINE => Err(ThreadError::InvalidHandle),
            _ => Err(ThreadError::Protocol("unexpected join status")),
        },
        Ok(_) => Err(ThreadError::Protocol("mismatched join response")),
        Err(failure) => Err(wait_to_thread_error(failure, handle.hosting_peer())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_handle_never_names_a_thread() {
        let handle = ThreadHandle::invalid();
        assert!(!handle.is_valid());
        assert_eq!(handle, ThreadHandle::invalid());
        assert_ne!(handle, ThreadHandle::new(1, 1));
    }

    #[test]
    fn handles_compare_by_peer_and_thread_id() {
        assert_eq!(ThreadHandle::new(2, 7), ThreadHandle::new(2, 7));
        assert_ne!(ThreadHandle::new(2, 7), ThreadHandle::new(2, 8));
        assert_ne!(ThreadHandle::new(2, 7), ThreadHandle::new(3, 7));
    }
}
