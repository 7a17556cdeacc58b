// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: End-to-end DSM scenarios: mesh formation, cross-client
//! coherence, remote threads, disconnect behavior
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! TEST_SCENARIOS:
//!   - three_peer_mesh_forms_and_counts_cores()
//!   - write_on_one_client_read_on_another()
//!   - remote_thread_computes_over_shared_memory()
//!   - client_spawns_remote_thread_via_manager()
//!   - exhausted_peers_refuse_new_threads()
//!   - invalid_handle_join_is_refused()
//!   - disconnected_peer_fails_requests_instead_of_hanging()

use std::time::Duration;

use dsm_e2e::{expected_fill_sum, Mesh};
use dsoftmem::{MemoryError, ThreadError, PAGE_SIZE};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn three_peer_mesh_forms_and_counts_cores() {
    init_logs();
    let mesh = Mesh::start(2);
    assert_eq!(mesh.manager.core_count(), 3);
    for client in &mesh.clients {
        assert_eq!(client.core_count(), 3);
        assert!(!client.is_manager());
    }
    assert!(mesh.manager.is_manager());
    mesh.shutdown();
}

#[test]
fn write_on_one_client_read_on_another() {
    init_logs();
    let mesh = Mesh::start(2);

    let addr = mesh.clients[0].allocate(PAGE_SIZE).expect("allocate");
    mesh.clients[0].copy_out(addr, &[0x41]).expect("copy out");

    let mut byte = [0u8; 1];
    mesh.clients[1].copy_in(&mut byte, addr).expect("copy in");
    assert_eq!(byte[0], 0x41);

    mesh.shutdown();
}

#[test]
fn remote_thread_computes_over_shared_memory() {
    init_logs();
    let mesh = Mesh::start(1);

    let addr = mesh.manager.allocate(PAGE_SIZE).expect("allocate");
    let filled = mesh.manager.spawn_remote("fill_page", addr.raw()).expect("spawn fill");
    assert_eq!(mesh.manager.join_remote(&filled).expect("join fill"), PAGE_SIZE as u64);

    let summed = mesh.manager.spawn_remote("sum_page", addr.raw()).expect("spawn sum");
    assert_eq!(mesh.manager.join_remote(&summed).expect("join sum"), expected_fill_sum());

    // The remote writes are ordinary coherent writes; the manager sees them.
    let mut head = [0u8; 8];
    mesh.manager.copy_in(&mut head, addr).expect("copy in");
    assert_eq!(head, [0, 1, 2, 3, 4, 5, 6, 7]);

    mesh.shutdown();
}

#[test]
fn client_spawns_remote_thread_via_manager() {
    init_logs();
    let mesh = Mesh::start(2);

    let addr = mesh.clients[0].allocate(PAGE_SIZE).expect("allocate");
    mesh.clients[0].copy_out(addr, &vec![1u8; PAGE_SIZE]).expect("seed page");

    // The create request flows through the manager, which assigns some
    // idle peer; the client then joins it directly over the mesh.
    let handle = mesh.clients[0].spawn_remote("sum_page", addr.raw()).expect("spawn");
    let sum = mesh.clients[0].join_remote(&handle).expect("join");
    assert_eq!(sum, PAGE_SIZE as u64);

    mesh.shutdown();
}

#[test]
fn exhausted_peers_refuse_new_threads() {
    init_logs();
    let mesh = Mesh::start(1);

    let napping = mesh.manager.spawn_remote("nap", 1500).expect("first spawn");
    let err = mesh.manager.spawn_remote("nap", 1).expect_err("no second core");
    assert!(matches!(err, ThreadError::NoIdlePeer), "unexpected error {err}");

    assert_eq!(mesh.manager.join_remote(&napping).expect("join"), 1500);
    // Joined threads free their host for new assignments.
    let again = mesh.manager.spawn_remote("nap", 1).expect("respawn after join");
    assert_eq!(mesh.manager.join_remote(&again).expect("join again"), 1);

    mesh.shutdown();
}

#[test]
fn invalid_handle_join_is_refused() {
    init_logs();
    let mesh = Mesh::start(1);
    let err = mesh
        .manager
        .join_remote(&dsoftmem::ThreadHandle::invalid())
        .expect_err("invalid handle");
    assert!(matches!(err, ThreadError::InvalidHandle));
    mesh.shutdown();
}

#[test]
fn unknown_procedure_is_reported() {
    init_logs();
    let mesh = Mesh::start(1);
    let err = mesh.manager.spawn_remote("no_such_proc", 0).expect_err("unknown procedure");
    assert!(matches!(err, ThreadError::UnknownProcedure(_)));
    mesh.shutdown();
}

#[test]
fn disconnected_peer_fails_requests_instead_of_hanging() {
    init_logs();
    let mesh = Mesh::start(2);

    // The first client owns a page, then leaves the session.
    let addr = mesh.clients[0].allocate(PAGE_SIZE).expect("allocate");
    mesh.clients[0].copy_out(addr, &[9]).expect("copy out");
    mesh.clients[0].shutdown();
    std::thread::sleep(Duration::from_millis(100));

    // Fetching the page needs the dead owner; the requester gets a typed
    // failure, never a permanent hang.
    let mut byte = [0u8; 1];
    let err = mesh.manager.copy_in(&mut byte, addr).expect_err("owner is gone");
    assert!(
        matches!(
            err,
            MemoryError::PeerDisconnected(_)
                | MemoryError::PeerUnresponsive(_)
                | MemoryError::Transport(_)
        ),
        "unexpected error {err}"
    );

    mesh.shutdown();
}
