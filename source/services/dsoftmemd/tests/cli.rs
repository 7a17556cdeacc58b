// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Distributed soft memory daemon CLI tests

use clap::Parser;

use dsoftmemd::{validate, Args};

#[test]
fn manager_invocation_uses_defaults() {
    let args = Args::try_parse_from(["dsoftmemd", "--host", "127.0.0.1:7400"]).expect("parse");
    assert!(args.connect.is_none());
    assert_eq!(args.cores, 1);
    assert_eq!(args.pages, dsoftmem::DEFAULT_MAX_PAGES);
    assert!(validate(&args).is_ok());
}

#[test]
fn client_invocation_carries_manager_address() {
    let args = Args::try_parse_from([
        "dsoftmemd",
        "--host",
        "127.0.0.1:7401",
        "--connect",
        "10.0.0.1:7400",
    ])
    .expect("parse");
    assert_eq!(args.connect.as_deref(), Some("10.0.0.1:7400"));
    assert!(validate(&args).is_ok());
}

#[test]
fn missing_host_is_rejected() {
    assert!(Args::try_parse_from(["dsoftmemd"]).is_err());
}

#[test]
fn zero_cores_manager_fails_validation() {
    let args =
        Args::try_parse_from(["dsoftmemd", "--host", "127.0.0.1:7400", "--cores", "0"])
            .expect("parse");
    assert!(validate(&args).is_err());
}

#[test]
fn zero_pages_fails_validation() {
    let args =
        Args::try_parse_from(["dsoftmemd", "--host", "127.0.0.1:7400", "--pages", "0"])
            .expect("parse");
    assert!(validate(&args).is_err());
}
