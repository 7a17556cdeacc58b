// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared fixtures for DSM end-to-end tests (multi-peer loopback)
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! Starts a whole session inside one test process: a manager plus N
//! clients, each a full `Host` with its own reader/worker threads, wired
//! over TCP loopback. Every peer registers the same procedure table so
//! remote thread assignment resolves identically everywhere.

use std::thread;
use std::time::Duration;

use dsoftmem::{Config, Host, SharedAddress, PAGE_SIZE};

pub const READY: Duration = Duration::from_secs(5);

pub struct Mesh {
    pub manager: Host,
    pub clients: Vec<Host>,
}

impl Mesh {
    /// Starts a manager and `clients` peers and waits for the full mesh.
    pub fn start(clients: usize) -> Mesh {
        let config = Config { reply_timeout: Duration::from_secs(5), ..Config::default() };
        let manager =
            Host::start_manager("127.0.0.1:0", clients, config.clone()).expect("start manager");
        register_procedures(&manager);
        let manager_addr = format!("127.0.0.1:{}", manager.local_port());
        let clients: Vec<Host> = (0..clients)
            .map(|_| {
                let client = Host::start_client("127.0.0.1:0", &manager_addr, config.clone())
                    .expect("start client");
                register_procedures(&client);
                client
            })
            .collect();
        assert!(manager.wait_ready(READY), "manager topology incomplete");
        for client in &clients {
            assert!(client.wait_ready(READY), "client topology incomplete");
        }
        Mesh { manager, clients }
    }

    pub fn shutdown(self) {
        for client in self.clients {
            client.shutdown();
        }
        self.manager.shutdown();
    }
}

/// The procedure table every peer registers, in identical order.
pub fn register_procedures(host: &Host) {
    host.register_procedure("fill_page", fill_page);
    host.register_procedure("sum_page", sum_page);
    host.register_procedure("nap", nap);
}

/// Writes a counting pattern over the page at `arg`; returns bytes written.
fn fill_page(host: &Host, arg: u64) -> u64 {
    let pattern: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
    match host.copy_out(SharedAddress::new(arg), &pattern) {
        Ok(()) => pattern.len() as u64,
        Err(_) => 0,
    }
}

/// Sums the page at `arg` byte-wise; the remote-thread analogue of the
/// classic dot-product worker.
fn sum_page(host: &Host, arg: u64) -> u64 {
    let mut page = vec![0u8; PAGE_SIZE];
    match host.copy_in(&mut page, SharedAddress::new(arg)) {
        Ok(()) => page.iter().map(|b| *b as u64).sum(),
        Err(_) => u64::MAX,
    }
}

/// Sleeps `arg` milliseconds; keeps its host busy for exhaustion tests.
fn nap(_host: &Host, arg: u64) -> u64 {
    thread::sleep(Duration::from_millis(arg));
    arg
}

/// Expected result of `sum_page` over a page written by `fill_page`.
pub fn expected_fill_sum() -> u64 {
    (0..PAGE_SIZE).map(|i| (i % 251) as u64).sum()
}
