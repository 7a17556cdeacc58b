// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Distributed soft memory daemon domain library (CLI and lifecycle)
//! INTENT: Host one DSM peer (manager or client) for the local machine
//! READINESS: prints "dsoftmemd: ready" once the peer is serving
//! TESTS: CLI parsing and validation in tests/cli.rs
//!
//! The daemon is a pure service: it joins (or forms) the session, reports
//! readiness, and serves coherence traffic until killed. Application code
//! links `dsoftmem` directly instead of talking to the daemon.

use std::thread;
use std::time::Duration;

use clap::Parser;
use log::info;

use dsoftmem::{BootstrapError, Config, Host, DEFAULT_MAX_PAGES};

/// Command line of the daemon. `--connect` absent means run as the manager.
#[derive(Parser, Debug)]
#[command(name = "dsoftmemd", about = "Distributed soft memory peer daemon")]
pub struct Args {
    /// Address to listen on for peer connections.
    #[arg(long, value_name = "IP:PORT")]
    pub host: String,

    /// Manager address to join; omit to run as the manager.
    #[arg(long, value_name = "IP:PORT")]
    pub connect: Option<String>,

    /// Client peers the manager waits for before the session is complete.
    #[arg(long, default_value_t = 1)]
    pub cores: usize,

    /// Shared page-table entries; every peer of a session must agree.
    #[arg(long, default_value_t = DEFAULT_MAX_PAGES)]
    pub pages: usize,
}

/// Rejects argument combinations `clap` cannot express.
pub fn validate(args: &Args) -> Result<(), String> {
    if args.connect.is_none() && args.cores == 0 {
        return Err("a manager needs --cores of at least 1".into());
    }
    if args.pages == 0 {
        return Err("--pages must be at least 1".into());
    }
    Ok(())
}

/// Starts the peer and serves until killed.
pub fn run(args: Args) -> Result<(), BootstrapError> {
    if let Err(msg) = validate(&args) {
        eprintln!("dsoftmemd: {msg}");
        return Err(BootstrapError::InvalidConfig("invalid command line"));
    }
    let config = Config { max_pages: args.pages, ..Config::default() };
    let host = match &args.connect {
        None => Host::start_manager(&args.host, args.cores, config)?,
        Some(manager) => Host::start_client(&args.host, manager, config)?,
    };
    println!("dsoftmemd: ready");
    info!(
        "serving as peer {} on port {} ({} machines expected)",
        host.self_id(),
        host.local_port(),
        if host.is_manager() { args.cores + 1 } else { host.core_count() }
    );
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
