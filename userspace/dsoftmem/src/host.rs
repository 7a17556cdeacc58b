// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host aggregate: identity, topology bootstrap, public DSM API
//!
//! One `Host` per process, constructed once at startup and handed to every
//! component that needs it; no ambient globals. The manager accepts
//! joiners, assigns ids and broadcasts NEW_PEER so the full mesh forms;
//! every peer runs an accept loop for EXISTING_PEER greetings from
//! earlier-joined peers. Coherence and allocation traffic always flows
//! peer → manager; only demotes/invalidations flow manager → holder.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nexus_dsm_packet::Message;
use parking_lot::{Condvar, Mutex};

use crate::allocator;
use crate::coherence;
use crate::pagetable::{ClientPageTable, ManagerPageTable};
use crate::peer::{self, PeerSlot, Task, WaiterRegistry};
use crate::rthread::{self, ThreadCoord, ThreadHandle};
use crate::transport::{self, FrameReader, FrameWriter, TransportError};
use crate::{
    BootstrapError, MemoryError, PeerId, Procedure, SharedAddress, ThreadError,
    DEFAULT_MAX_PAGES, DEFAULT_REPLY_TIMEOUT, MANAGER_ID, MAX_PEERS, PAGE_SIZE, VA_START,
};

/// Tunables fixed at host construction.
#[derive(Clone, Debug)]
pub struct Config {
    /// Page-table entries on every peer; all peers must agree.
    pub max_pages: usize,
    /// Deadline for any correlated response.
    pub reply_timeout: Duration,
    /// Deadline for remote joins; `None` waits until the thread finishes
    /// or its host disconnects.
    pub join_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            join_timeout: None,
        }
    }
}

enum Role {
    Manager { expected_peers: usize },
    Client,
}

struct ReadyGate {
    mask: Mutex<u32>,
    cond: Condvar,
}

impl ReadyGate {
    fn mark(&self, id: PeerId) {
        *self.mask.lock() |= 1 << id;
        self.cond.notify_all();
    }

    fn wait(&self, required: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut mask = self.mask.lock();
        while *mask & required != required {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self.cond.wait_for(&mut mask, deadline - now).timed_out() {
                return *mask & required == required;
            }
        }
        true
    }
}

/// Process-wide DSM state shared by every thread of this peer.
pub(crate) struct HostInner {
    role: Role,
    self_id: PeerId,
    config: Config,
    listen_addr: std::net::SocketAddr,
    peers: Vec<PeerSlot>,
    waiters: WaiterRegistry,
    service_tx: Mutex<Option<mpsc::Sender<Task>>>,
    manager_table: Option<ManagerPageTable>,
    client_table: ClientPageTable,
    threads: ThreadCoord,
    alloc_cursor: Mutex<usize>,
    call_lane: Mutex<()>,
    join_lane: Mutex<()>,
    ready: ReadyGate,
    shutting_down: AtomicBool,
    thread_handles: Mutex<Vec<thread::JoinHandle<()>>>,
    assigned_clients: Mutex<usize>,
}

impl HostInner {
    fn new(role: Role, self_id: PeerId, listen_addr: std::net::SocketAddr, config: Config) -> Self {
        let manager_table = match role {
            Role::Manager { .. } => Some(ManagerPageTable::new(config.max_pages)),
            Role::Client => None,
        };
        let client_table = ClientPageTable::new(config.max_pages);
        Self {
            role,
            self_id,
            listen_addr,
            peers: (0..MAX_PEERS).map(|_| PeerSlot::default()).collect(),
            waiters: WaiterRegistry::default(),
            service_tx: Mutex::new(None),
            manager_table,
            client_table,
            threads: ThreadCoord::default(),
            alloc_cursor: Mutex::new(0),
            call_lane: Mutex::new(()),
            join_lane: Mutex::new(()),
            ready: ReadyGate { mask: Mutex::new(0), cond: Condvar::new() },
            shutting_down: AtomicBool::new(false),
            thread_handles: Mutex::new(Vec::new()),
            assigned_clients: Mutex::new(0),
            config,
        }
    }

    pub(crate) fn is_manager(&self) -> bool {
        matches!(self.role, Role::Manager { .. })
    }

    pub(crate) fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub(crate) fn reply_timeout(&self) -> Duration {
        self.config.reply_timeout
    }

    pub(crate) fn join_timeout(&self) -> Option<Duration> {
        self.config.join_timeout
    }

    pub(crate) fn waiters(&self) -> &WaiterRegistry {
        &self.waiters
    }

    pub(crate) fn threads(&self) -> &ThreadCoord {
        &self.threads
    }

    pub(crate) fn call_lane(&self) -> &Mutex<()> {
        &self.call_lane
    }

    pub(crate) fn join_lane(&self) -> &Mutex<()> {
        &self.join_lane
    }

    pub(crate) fn alloc_cursor(&self) -> &Mutex<usize> {
        &self.alloc_cursor
    }

    pub(crate) fn manager_table(&self) -> Option<&ManagerPageTable> {
        self.manager_table.as_ref()
    }

    pub(crate) fn client_table(&self) -> &ClientPageTable {
        &self.client_table
    }

    pub(crate) fn slot(&self, id: PeerId) -> &PeerSlot {
        &self.peers[id as usize]
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn send_to(&self, peer: PeerId, msg: &Message) -> Result<(), TransportError> {
        self.slot(peer).send(peer, msg)
    }

    pub(crate) fn service_enqueue(&self, task: Task) {
        if let Some(tx) = self.service_tx.lock().as_ref() {
            let _ = tx.send(task);
        }
    }

    pub(crate) fn va_of(&self, idx: usize) -> u64 {
        VA_START + (idx * PAGE_SIZE) as u64
    }

    /// Index of a page-aligned shared address, `None` outside the range.
    pub(crate) fn page_index_aligned(&self, va: u64) -> Option<usize> {
        page_index_aligned(va, self.config.max_pages)
    }

    /// First and last page index touched by `[va, va + len)`.
    pub(crate) fn range_pages(&self, va: u64, len: usize) -> Result<(usize, usize), MemoryError> {
        range_pages(va, len, self.config.max_pages)
    }

    /// A peer's reader exited: tear the slot down and unblock every thread
    /// waiting on that peer. No reconnection is attempted.
    pub(crate) fn on_peer_disconnected(&self, id: PeerId) {
        self.slot(id).detach();
        self.waiters.fail_peer(id);
        if !self.is_shutting_down() {
            match self.slot(id).listen_addr() {
                Some((ip, port)) => info!("peer {id} ({ip}:{port}) disconnected"),
                None => info!("peer {id} disconnected"),
            }
        }
    }

    /// Drops a misbehaving peer's connection; the reader notices the socket
    /// shutdown and runs the regular disconnect path.
    pub(crate) fn drop_peer(&self, id: PeerId) {
        self.slot(id).detach();
        self.waiters.fail_peer(id);
    }

    fn connected_count(&self) -> usize {
        (0..MAX_PEERS as PeerId).filter(|id| self.slot(*id).is_connected()).count()
    }
}

fn page_index_aligned(va: u64, max_pages: usize) -> Option<usize> {
    if va < VA_START || (va - VA_START) % PAGE_SIZE as u64 != 0 {
        return None;
    }
    let idx = ((va - VA_START) / PAGE_SIZE as u64) as usize;
    (idx < max_pages).then_some(idx)
}

fn range_pages(va: u64, len: usize, max_pages: usize) -> Result<(usize, usize), MemoryError> {
    if len == 0 {
        return Err(MemoryError::OutOfRange);
    }
    let end = VA_START + (max_pages * PAGE_SIZE) as u64;
    let last_byte = va.checked_add(len as u64 - 1).ok_or(MemoryError::OutOfRange)?;
    if va < VA_START || last_byte >= end {
        return Err(MemoryError::OutOfRange);
    }
    let first = ((va - VA_START) / PAGE_SIZE as u64) as usize;
    let last = ((last_byte - VA_START) / PAGE_SIZE as u64) as usize;
    Ok((first, last))
}

/// Installs a live connection into a slot and starts its reader/worker pair.
fn install_peer(
    host: &Arc<HostInner>,
    id: PeerId,
    reader: FrameReader,
    writer: FrameWriter,
    listen_addr: Option<(String, u16)>,
) {
    let (tx, rx) = mpsc::channel();
    host.slot(id).attach(writer, tx, listen_addr);

    let for_reader = Arc::clone(host);
    let reader_handle = thread::Builder::new()
        .name(format!("dsm-reader-{id}"))
        .spawn(move || peer::reader_loop(for_reader, id, reader));
    let for_worker = Arc::clone(host);
    let worker_handle = thread::Builder::new()
        .name(format!("dsm-worker-{id}"))
        .spawn(move || peer::worker_loop(for_worker, rx));

    let mut handles = host.thread_handles.lock();
    for spawned in [reader_handle, worker_handle] {
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => warn!("peer {id}: cannot spawn connection thread: {err}"),
        }
    }
}

/// NEW_PEER announcement: dial the newcomer and greet it with our id.
pub(crate) fn greet_new_peer(
    host: &Arc<HostInner>,
    id: PeerId,
    address: &str,
    port: u16,
) -> Result<(), BootstrapError> {
    if id as usize >= MAX_PEERS || id == host.self_id() {
        return Err(BootstrapError::Protocol);
    }
    let stream = TcpStream::connect((address, port))?;
    let (reader, mut writer) = transport::split(stream)?;
    writer.send(&Message::ExistingPeer { peer_id: host.self_id() })?;
    install_peer(host, id, reader, writer, Some((address.to_string(), port)));
    host.ready.mark(id);
    info!("greeted new peer {id} at {address}:{port}");
    Ok(())
}

fn manager_handle_incoming(
    host: &Arc<HostInner>,
    stream: TcpStream,
    expected_peers: usize,
) -> Result<(), BootstrapError> {
    let remote = stream.peer_addr()?;
    let (mut reader, mut writer) = transport::split(stream)?;
    let msg = reader.receive_message()?;
    let (address, port) = match msg {
        Message::SelfIdentify { address, port } => (address, port),
        _ => return Err(BootstrapError::Protocol),
    };

    let id = {
        let mut assigned = host.assigned_clients.lock();
        if *assigned >= expected_peers {
            warn!("rejecting join from {remote}: topology is complete");
            return Err(BootstrapError::Rejected);
        }
        *assigned += 1;
        *assigned as PeerId
    };
    writer.send(&Message::PeerIdAssign { requester: id, peer_id: id })?;
    match reader.receive_message()? {
        Message::PeerIdConfirm => {}
        _ => return Err(BootstrapError::Protocol),
    }

    // Everyone already in the mesh dials the newcomer.
    for other in 1..MAX_PEERS as PeerId {
        if other != id && host.slot(other).is_connected() {
            if let Err(err) = host.send_to(
                other,
                &Message::NewPeer { peer_id: id, address: address.clone(), port },
            ) {
                warn!("peer {other}: cannot announce new peer {id}: {err}");
            }
        }
    }

    install_peer(host, id, reader, writer, Some((address, port)));
    host.ready.mark(id);
    info!("peer {id} joined from {remote}");
    Ok(())
}

fn manager_accept_loop(host: Arc<HostInner>, listener: TcpListener, expected_peers: usize) {
    for stream in listener.incoming() {
        if host.is_shutting_down() {
            break;
        }
        match stream {
            Ok(stream) => {
                if let Err(err) = manager_handle_incoming(&host, stream, expected_peers) {
                    warn!("join attempt failed: {err}");
                }
            }
            Err(err) => {
                if host.is_shutting_down() {
                    break;
                }
                warn!("accept failed: {err}");
            }
        }
    }
    debug!("manager accept loop exited");
}

fn client_accept_loop(host: Arc<HostInner>, listener: TcpListener) {
    for stream in listener.incoming() {
        if host.is_shutting_down() {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                if host.is_shutting_down() {
                    break;
                }
                warn!("accept failed: {err}");
                continue;
            }
        };
        let accept = || -> Result<(), BootstrapError> {
            let (mut reader, writer) = transport::split(stream)?;
            let id = match reader.receive_message()? {
                Message::ExistingPeer { peer_id } => peer_id,
                _ => return Err(BootstrapError::Protocol),
            };
            if id as usize >= MAX_PEERS || id == host.self_id() || host.slot(id).is_connected() {
                return Err(BootstrapError::Protocol);
            }
            install_peer(&host, id, reader, writer, None);
            host.ready.mark(id);
            info!("accepted connection from existing peer {id}");
            Ok(())
        };
        if let Err(err) = accept() {
            warn!("peer greeting failed: {err}");
        }
    }
    debug!("client accept loop exited");
}

/// A DSM peer. Cloneable; clones share the same underlying host state.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub(crate) fn from_inner(inner: Arc<HostInner>) -> Self {
        Self { inner }
    }

    /// Starts the manager (peer 0): binds `listen`, serves joins until
    /// `expected_peers` clients identified, and runs the global allocation
    /// and thread services.
    pub fn start_manager(
        listen: &str,
        expected_peers: usize,
        config: Config,
    ) -> Result<Host, BootstrapError> {
        if expected_peers >= MAX_PEERS {
            return Err(BootstrapError::InvalidConfig("expected peer count exceeds MAX_PEERS"));
        }
        if config.max_pages == 0 {
            return Err(BootstrapError::InvalidConfig("max_pages must be nonzero"));
        }
        let listener = TcpListener::bind(listen)?;
        let listen_addr = listener.local_addr()?;
        let host = Arc::new(HostInner::new(
            Role::Manager { expected_peers },
            MANAGER_ID,
            listen_addr,
            config,
        ));

        let (service_tx, service_rx) = mpsc::channel();
        *host.service_tx.lock() = Some(service_tx);
        let for_service = Arc::clone(&host);
        let service = thread::Builder::new()
            .name("dsm-service".into())
            .spawn(move || peer::worker_loop(for_service, service_rx))?;
        let for_accept = Arc::clone(&host);
        let accept = thread::Builder::new()
            .name("dsm-accept".into())
            .spawn(move || manager_accept_loop(for_accept, listener, expected_peers))?;
        host.thread_handles.lock().extend([service, accept]);

        host.ready.mark(MANAGER_ID);
        info!("manager listening on {listen_addr}, expecting {expected_peers} peers");
        Ok(Host { inner: host })
    }

    /// Starts a client: binds `listen` for peer connections, joins via the
    /// manager at `manager_addr`, and participates in the mesh.
    pub fn start_client(
        listen: &str,
        manager_addr: &str,
        config: Config,
    ) -> Result<Host, BootstrapError> {
        if config.max_pages == 0 {
            return Err(BootstrapError::InvalidConfig("max_pages must be nonzero"));
        }
        let listener = TcpListener::bind(listen)?;
        let listen_addr = listener.local_addr()?;

        let stream = TcpStream::connect(manager_addr)?;
        let advertised_ip = stream.local_addr()?.ip().to_string();
        let (mut reader, mut writer) = transport::split(stream)?;
        writer.send(&Message::SelfIdentify {
            address: advertised_ip,
            port: listen_addr.port(),
        })?;
        let self_id = match reader.receive_message()? {
            Message::PeerIdAssign { peer_id, .. } => peer_id,
            _ => return Err(BootstrapError::Protocol),
        };
        if self_id == MANAGER_ID || self_id as usize >= MAX_PEERS {
            return Err(BootstrapError::Rejected);
        }
        writer.send(&Message::PeerIdConfirm)?;

        let host = Arc::new(HostInner::new(Role::Client, self_id, listen_addr, config));
        install_peer(&host, MANAGER_ID, reader, writer, None);
        host.ready.mark(MANAGER_ID);
        host.ready.mark(self_id);

        let for_accept = Arc::clone(&host);
        let accept = thread::Builder::new()
            .name("dsm-accept".into())
            .spawn(move || client_accept_loop(for_accept, listener))?;
        host.thread_handles.lock().push(accept);

        info!("joined as peer {self_id}, listening on {listen_addr}");
        Ok(Host { inner: host })
    }

    pub fn self_id(&self) -> PeerId {
        self.inner.self_id()
    }

    pub fn is_manager(&self) -> bool {
        self.inner.is_manager()
    }

    /// Port of this peer's listener (useful when bound to port 0).
    pub fn local_port(&self) -> u16 {
        self.inner.listen_addr.port()
    }

    /// Machines currently part of the session, this one included. On a
    /// client this grows as the mesh forms.
    pub fn core_count(&self) -> usize {
        self.inner.connected_count() + 1
    }

    /// Blocks until the fixed topology is complete: the manager waits for
    /// every expected client, a client for the manager and every
    /// earlier-joined peer.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let required = match self.inner.role {
            Role::Manager { expected_peers } => {
                let clients = ((1u64 << (expected_peers + 1)) - 2) as u32;
                clients | 1
            }
            Role::Client => ((1u64 << (self.inner.self_id + 1)) - 1) as u32,
        };
        self.inner.ready.wait(required, timeout)
    }

    /// Registers a procedure for remote execution. Ids are assigned in
    /// registration order; every peer must register the same table.
    pub fn register_procedure(&self, name: &str, procedure: Procedure) {
        self.inner.threads().register(name, procedure);
    }

    /// Handle of the remotely-assigned thread this peer is hosting, if any.
    pub fn current_thread(&self) -> Option<ThreadHandle> {
        self.inner.threads().hosted_handle(self.inner.self_id())
    }

    /// Allocates `size` bytes of shared memory (rounded up to whole pages)
    /// owned read-write by this peer.
    pub fn allocate(&self, size: usize) -> Result<SharedAddress, MemoryError> {
        let n_pages = size.div_ceil(PAGE_SIZE);
        if n_pages == 0 {
            return Err(MemoryError::AllocFailed);
        }
        if self.inner.is_manager() {
            allocator::manager_allocate(&self.inner, MANAGER_ID, n_pages)
        } else {
            allocator::client_allocate(&self.inner, n_pages)
        }
    }

    /// Copies shared memory into `dest`, faulting pages in as needed.
    pub fn copy_in(&self, dest: &mut [u8], src: SharedAddress) -> Result<(), MemoryError> {
        coherence::copy_in(&self.inner, dest, src)
    }

    /// Copies `src` into shared memory, upgrading page access as needed.
    pub fn copy_out(&self, dest: SharedAddress, src: &[u8]) -> Result<(), MemoryError> {
        coherence::copy_out(&self.inner, dest, src)
    }

    /// Starts `procedure` on an idle peer chosen by the manager.
    pub fn spawn_remote(&self, procedure: &str, arg: u64) -> Result<ThreadHandle, ThreadError> {
        rthread::spawn_remote(&self.inner, procedure, arg)
    }

    /// Blocks until the remote thread finishes and returns its result.
    pub fn join_remote(&self, handle: &ThreadHandle) -> Result<u64, ThreadError> {
        rthread::join_remote(&self.inner, handle)
    }

    /// Tears the peer down: closes every connection, stops the accept loop
    /// and joins the connection threads. Outstanding requests fail with
    /// disconnect errors.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for id in 0..MAX_PEERS as PeerId {
            self.inner.slot(id).detach();
        }
        *self.inner.service_tx.lock() = None;
        self.inner.waiters.fail_peer(MANAGER_ID);
        // Wake the accept loop so it can observe the flag.
        let _ = TcpStream::connect(self.inner.listen_addr);
        let handles = std::mem::take(&mut *self.inner.thread_handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        info!("peer {} shut down", self.inner.self_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_index_rejects_stray_addresses() {
        assert_eq!(page_index_aligned(VA_START, 8), Some(0));
        assert_eq!(page_index_aligned(VA_START + PAGE_SIZE as u64, 8), Some(1));
        assert_eq!(page_index_aligned(VA_START + 1, 8), None);
        assert_eq!(page_index_aligned(VA_START - PAGE_SIZE as u64, 8), None);
        assert_eq!(page_index_aligned(VA_START + (8 * PAGE_SIZE) as u64, 8), None);
    }

    #[test]
    fn range_pages_spans_partial_pages() {
        let (first, last) =
            range_pages(VA_START + 10, PAGE_SIZE, 8).expect("in-range span");
        assert_eq!((first, last), (0, 1));

        let (first, last) = range_pages(VA_START, PAGE_SIZE, 8).expect("exact page");
        assert_eq!((first, last), (0, 0));
    }

    #[test]
    fn range_pages_rejects_overflow_and_escape() {
        assert!(range_pages(VA_START - 1, 4, 8).is_err());
        assert!(range_pages(VA_START + (7 * PAGE_SIZE) as u64, PAGE_SIZE + 1, 8).is_err());
        assert!(range_pages(u64::MAX - 2, 8, 8).is_err());
    }
}
