// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Distributed soft memory daemon entrypoint wiring to service logic
//! INTENT: Host one DSM peer (manager or client) for the local machine
//! READINESS: prints "dsoftmemd: ready" once the peer is serving

use clap::Parser;

fn main() {
    env_logger::init();
    let args = dsoftmemd::Args::parse();
    if let Err(err) = dsoftmemd::run(args) {
        eprintln!("dsoftmemd: {err}");
        std::process::exit(1);
    }
}
