// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Peer slots, inbound dispatch and correlated-response routing
//!
//! Every connected peer owns two threads: a reader that classifies inbound
//! packets and a worker that drains that peer's task queue in arrival
//! order. Responses (odd types) never touch a worker; the reader routes
//! them through the waiter registry to whichever thread is blocked on the
//! matching (requester, type, page) key. A reader exiting marks the peer
//! disconnected and fails every wait registered against it.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use nexus_dsm_packet::Message;
use parking_lot::Mutex;

use crate::host::HostInner;
use crate::transport::{FrameReader, FrameWriter, TransportError};
use crate::{allocator, coherence, rthread};
use crate::{PeerId, MANAGER_ID};

/// Work item for a peer's worker thread.
pub(crate) enum Task {
    Inbound { from: PeerId, msg: Message },
    Shutdown,
}

/// Per-peer connection state. `link` doubles as the liveness flag.
#[derive(Default)]
pub(crate) struct PeerSlot {
    link: Mutex<Option<FrameWriter>>,
    queue_tx: Mutex<Option<mpsc::Sender<Task>>>,
    listen_addr: Mutex<Option<(String, u16)>>,
}

impl PeerSlot {
    pub(crate) fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    pub(crate) fn attach(
        &self,
        writer: FrameWriter,
        queue: mpsc::Sender<Task>,
        listen_addr: Option<(String, u16)>,
    ) {
        *self.link.lock() = Some(writer);
        *self.queue_tx.lock() = Some(queue);
        *self.listen_addr.lock() = listen_addr;
    }

    /// Sends one packet; the mutex serialises concurrent senders so frames
    /// never interleave.
    pub(crate) fn send(&self, peer: PeerId, msg: &Message) -> Result<(), TransportError> {
        let mut link = self.link.lock();
        match link.as_mut() {
            Some(writer) => writer.send(msg),
            None => Err(TransportError::NotConnected(peer)),
        }
    }

    pub(crate) fn enqueue(&self, task: Task) -> bool {
        match self.queue_tx.lock().as_ref() {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }

    pub(crate) fn listen_addr(&self) -> Option<(String, u16)> {
        self.listen_addr.lock().clone()
    }

    /// Drops the send half and stops the worker; the reader exits on the
    /// socket shutdown.
    pub(crate) fn detach(&self) {
        if let Some(writer) = self.link.lock().take() {
            writer.shutdown();
        }
        if let Some(tx) = self.queue_tx.lock().take() {
            let _ = tx.send(Task::Shutdown);
        }
    }
}

/// Key a blocked thread waits on: originating requester, response type,
/// page address (0 for non-page operations).
pub(crate) type WaitKey = (PeerId, u32, u64);

pub(crate) enum WaitEvent {
    Msg { from: PeerId, msg: Message },
    Disconnected(PeerId),
}

pub(crate) enum WaitFailure {
    Timeout,
    Disconnected(PeerId),
    /// Registry dropped the sender (host shutting down).
    Lost,
}

struct WaiterEntry {
    tx: mpsc::Sender<WaitEvent>,
    targets: Vec<PeerId>,
}

/// Routes correlated responses to blocked requesters.
#[derive(Default)]
pub(crate) struct WaiterRegistry {
    map: Mutex<HashMap<WaitKey, WaiterEntry>>,
}

impl WaiterRegistry {
    /// Registers a wait. Returns `None` when the key is already taken,
    /// which means two threads raced a request the protocol serialises;
    /// callers surface that as a protocol violation rather than queueing.
    pub(crate) fn begin<'a>(
        &'a self,
        key: WaitKey,
        targets: Vec<PeerId>,
    ) -> Option<WaitGuard<'a>> {
        let (tx, rx) = mpsc::channel();
        let mut map = self.map.lock();
        if map.contains_key(&key) {
            return None;
        }
        map.insert(key, WaiterEntry { tx, targets });
        Some(WaitGuard { registry: self, key, rx })
    }

    /// Delivers a response to the matching waiter; false when nobody waits
    /// (late reply after a timeout).
    pub(crate) fn route(&self, from: PeerId, msg: Message) -> bool {
        let requester = match msg.requester() {
            Some(r) => r,
            None => return false,
        };
        let key = (requester, msg.wire_type(), msg.page_va().unwrap_or(0));
        let map = self.map.lock();
        match map.get(&key) {
            Some(entry) => entry.tx.send(WaitEvent::Msg { from, msg }).is_ok(),
            None => false,
        }
    }

    /// Unblocks every wait that targets a now-dead peer.
    pub(crate) fn fail_peer(&self, peer: PeerId) {
        let map = self.map.lock();
        for entry in map.values() {
            if entry.targets.contains(&peer) {
                let _ = entry.tx.send(WaitEvent::Disconnected(peer));
            }
        }
    }

    fn end(&self, key: &WaitKey) {
        self.map.lock().remove(key);
    }
}

/// Live wait registration; deregisters on drop on every exit path.
pub(crate) struct WaitGuard<'a> {
    registry: &'a WaiterRegistry,
    key: WaitKey,
    rx: mpsc::Receiver<WaitEvent>,
}

impl WaitGuard<'_> {
    /// Blocks until the correlated response arrives, the deadline expires,
    /// or a targeted peer disconnects. Returns the responder with the
    /// message so multi-target waits can tell acks apart.
    pub(crate) fn wait(&self, deadline: Option<Duration>) -> Result<(PeerId, Message), WaitFailure> {
        let event = match deadline {
            Some(limit) => self.rx.recv_timeout(limit).map_err(|err| match err {
                mpsc::RecvTimeoutError::Timeout => WaitFailure::Timeout,
                mpsc::RecvTimeoutError::Disconnected => WaitFailure::Lost,
            })?,
            None => self.rx.recv().map_err(|_| WaitFailure::Lost)?,
        };
        match event {
            WaitEvent::Msg { from, msg } => Ok((from, msg)),
            WaitEvent::Disconnected(peer) => Err(WaitFailure::Disconnected(peer)),
        }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.registry.end(&self.key);
    }
}

/// Blocking receive loop for one peer connection.
pub(crate) fn reader_loop(host: Arc<HostInner>, peer_id: PeerId, mut reader: FrameReader) {
    loop {
        let msg = match reader.receive_message() {
            Ok(msg) => msg,
            Err(TransportError::Closed) => {
                debug!("peer {peer_id}: connection closed");
                break;
            }
            Err(err) => {
                if !host.is_shutting_down() {
                    warn!("peer {peer_id}: receive failed: {err}");
                }
                break;
            }
        };
        if let Err(reason) = classify(&host, peer_id, msg) {
            warn!("peer {peer_id}: protocol violation: {reason}; dropping connection");
            break;
        }
    }
    host.on_peer_disconnected(peer_id);
}

/// Routes one inbound packet per the dispatch rules: topology packets are
/// handled inline, responses go to the waiter registry, manager-global
/// requests to the service queue, everything else to the sender's worker.
fn classify(host: &Arc<HostInner>, from: PeerId, msg: Message) -> Result<(), &'static str> {
    match msg {
        Message::NewPeer { peer_id, address, port } => {
            if host.is_manager() || from != MANAGER_ID {
                return Err("NEW_PEER from a non-manager connection");
            }
            crate::host::greet_new_peer(host, peer_id, &address, port)
                .map_err(|_| "failed to greet announced peer")
        }
        msg @ (Message::PeerIdAssign { .. }
        | Message::AllocResp { .. }
        | Message::ThreadCreateResp { .. }
        | Message::ThreadAssignResp { .. }
        | Message::ThreadJoinResp { .. }
        | Message::ReadResp { .. }
        | Message::ReadInvalidateResp { .. }
        | Message::WriteResp { .. }
        | Message::WriteDemoteResp { .. }
        | Message::WriteInvalidateResp { .. }) => {
            if !host.waiters().route(from, msg) {
                debug!("peer {from}: dropped uncorrelated response");
            }
            Ok(())
        }
        msg @ (Message::AllocReq { .. } | Message::ThreadCreateReq { .. }) => {
            if !host.is_manager() {
                return Err("manager-global request sent to a client");
            }
            host.service_enqueue(Task::Inbound { from, msg });
            Ok(())
        }
        msg @ (Message::ReadReq { .. } | Message::WriteReq { .. }) => {
            if !host.is_manager() {
                return Err("coherence request sent to a client");
            }
            enqueue_for(host, from, msg)
        }
        msg @ (Message::ReadInvalidateReq { .. }
        | Message::WriteDemoteReq { .. }
        | Message::WriteInvalidateReq { .. }
        | Message::ThreadAssignReq { .. }) => {
            if from != MANAGER_ID {
                return Err("management request from a non-manager peer");
            }
            enqueue_for(host, from, msg)
        }
        msg @ Message::ThreadJoinReq { .. } => enqueue_for(host, from, msg),
        Message::SelfIdentify { .. }
        | Message::PeerIdConfirm
        | Message::ExistingPeer { .. } => Err("bootstrap packet after bootstrap"),
    }
}

fn enqueue_for(host: &Arc<HostInner>, from: PeerId, msg: Message) -> Result<(), &'static str> {
    if host.slot(from).enqueue(Task::Inbound { from, msg }) {
        Ok(())
    } else {
        Err("task queue unavailable")
    }
}

/// Drains one peer's task queue in arrival order.
pub(crate) fn worker_loop(host: Arc<HostInner>, rx: mpsc::Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        match task {
            Task::Shutdown => break,
            Task::Inbound { from, msg } => handle_task(&host, from, msg),
        }
    }
}

fn handle_task(host: &Arc<HostInner>, from: PeerId, msg: Message) {
    let outcome: Result<(), &'static str> = match msg {
        Message::ReadReq { requester, page_va } => {
            if requester != from {
                Err("read request with foreign requester id")
            } else {
                coherence::manager_read(host, requester, page_va)
            }
        }
        Message::WriteReq { requester, page_va } => {
            if requester != from {
                Err("write request with foreign requester id")
            } else {
                coherence::manager_write(host, requester, page_va)
            }
        }
        Message::ReadInvalidateReq { page_va, requester } => {
            coherence::client_read_invalidate(host, page_va, requester)
        }
        Message::WriteDemoteReq { page_va, requester } => {
            coherence::client_write_demote(host, page_va, requester)
        }
        Message::WriteInvalidateReq { page_va, requester } => {
            coherence::client_write_invalidate(host, page_va, requester)
        }
        Message::AllocReq { requester, n_pages } => {
            if requester != from {
                Err("alloc request with foreign requester id")
            } else {
                allocator::handle_alloc_req(host, requester, n_pages)
            }
        }
        Message::ThreadCreateReq { requester, procedure, arg } => {
            if requester != from {
                Err("thread create with foreign requester id")
            } else {
                rthread::handle_create(host, requester, procedure, arg)
            }
        }
        Message::ThreadAssignReq { parent, procedure, arg, thread_id } => {
            rthread::handle_assign(host, parent, procedure, arg, thread_id)
        }
        Message::ThreadJoinReq { requester, peer_id, thread_id } => {
            if requester != from {
                Err("thread join with foreign requester id")
            } else {
                rthread::handle_join(host, requester, peer_id, thread_id)
            }
        }
        other => {
            warn!("peer {from}: unexpected packet on task queue: {other:?}");
            Ok(())
        }
    };
    if let Err(reason) = outcome {
        warn!("peer {from}: {reason}; dropping connection");
        host.drop_peer(from);
    }
}
