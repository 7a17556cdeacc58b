// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: DSM coherence message catalogue (v1) for the dsoftmem transport (no_std)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable (Phase 1; frozen once dsoftmem leaves bring-up)
//! TEST_COVERAGE: golden vector + per-message round trips + negative decode cases
//!
//! Notes:
//! - Frame body layout: TYPE (4 bytes BE) + payload. The transport prefixes the
//!   body with a 4-byte BE length word; this crate never sees the prefix.
//! - Even types are requests/notifications, odd types are responses. Every
//!   response leads with the originating requester's peer id so a dispatcher
//!   can route it without additional context, and page-carrying responses also
//!   repeat the page address for correlation.
//! - All multi-byte fields are big-endian, including 64-bit addresses
//!   (`to_be_bytes`/`from_be_bytes`; no reliance on a 32-bit-only hton).

#![no_std]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use core::str;

/// Coherence granularity. Fixed for the session; all peers must agree.
pub const PAGE_SIZE: usize = 4096;

/// Upper bound on a frame body's payload (one page plus header fields).
pub const MAX_DATA_BYTES: usize = PAGE_SIZE + 64;

/// Upper bound on an advertised listen address string.
pub const MAX_ADDR_BYTES: usize = 64;

pub const TYPE_SELF_IDENTIFY: u32 = 0;
pub const TYPE_PEER_ID_ASSIGN: u32 = 1;
pub const TYPE_PEER_ID_CONFIRM: u32 = 2;
pub const TYPE_NEW_PEER: u32 = 4;
pub const TYPE_EXISTING_PEER: u32 = 6;
pub const TYPE_ALLOC_REQ: u32 = 8;
pub const TYPE_ALLOC_RESP: u32 = 9;
pub const TYPE_THREAD_CREATE_REQ: u32 = 10;
pub const TYPE_THREAD_CREATE_RESP: u32 = 11;
pub const TYPE_THREAD_ASSIGN_REQ: u32 = 12;
pub const TYPE_THREAD_ASSIGN_RESP: u32 = 13;
pub const TYPE_THREAD_JOIN_REQ: u32 = 14;
pub const TYPE_THREAD_JOIN_RESP: u32 = 15;
pub const TYPE_READ_REQ: u32 = 16;
pub const TYPE_READ_RESP: u32 = 17;
pub const TYPE_READ_INVALIDATE_REQ: u32 = 18;
pub const TYPE_READ_INVALIDATE_RESP: u32 = 19;
pub const TYPE_WRITE_REQ: u32 = 20;
pub const TYPE_WRITE_RESP: u32 = 21;
pub const TYPE_WRITE_DEMOTE_REQ: u32 = 22;
pub const TYPE_WRITE_DEMOTE_RESP: u32 = 23;
pub const TYPE_WRITE_INVALIDATE_REQ: u32 = 24;
pub const TYPE_WRITE_INVALIDATE_RESP: u32 = 25;

/// Status word carried by THREAD_ASSIGN_RESP / THREAD_JOIN_RESP.
pub const THREAD_STATUS_OK: u32 = 0;
/// Target already hosts a thread (assign) or refused the operation.
pub const THREAD_STATUS_REFUSED: u32 = 1;
/// Procedure id not present in the target's registry.
pub const THREAD_STATUS_UNKNOWN_PROCEDURE: u32 = 2;
/// Join named a thread the target is not hosting.
pub const THREAD_STATUS_NOT_MINE: u32 = 3;
/// The hosted procedure terminated abnormally (panicked).
pub const THREAD_STATUS_ABORTED: u32 = 4;

/// Responses are convention-tagged odd.
pub fn is_response_type(wire_type: u32) -> bool {
    wire_type % 2 == 1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    Truncated,
    UnknownType(u32),
    Oversize(usize),
    InvalidInput(&'static str),
    Utf8,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated => write!(f, "truncated frame"),
            WireError::UnknownType(t) => write!(f, "unknown message type {t}"),
            WireError::Oversize(n) => write!(f, "frame payload of {n} bytes exceeds bound"),
            WireError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            WireError::Utf8 => write!(f, "invalid utf-8 in string field"),
        }
    }
}

/// One variant per catalogue entry; encode/decode are exhaustive so a type
/// or size mismatch cannot survive past this boundary.
#[derive(Clone, PartialEq, Eq)]
pub enum Message {
    SelfIdentify { address: String, port: u16 },
    PeerIdAssign { requester: u32, peer_id: u32 },
    PeerIdConfirm,
    NewPeer { peer_id: u32, address: String, port: u16 },
    ExistingPeer { peer_id: u32 },
    AllocReq { requester: u32, n_pages: u32 },
    /// `n_pages == 0` is the typed allocation-failure form; `base_va` is 0 then.
    AllocResp { requester: u32, base_va: u64, n_pages: u32 },
    ThreadCreateReq { requester: u32, procedure: u64, arg: u64 },
    ThreadCreateResp { requester: u32, valid: bool, peer_id: u32, thread_id: u64 },
    ThreadAssignReq { parent: u32, procedure: u64, arg: u64, thread_id: u64 },
    ThreadAssignResp { requester: u32, status: u32 },
    ThreadJoinReq { requester: u32, peer_id: u32, thread_id: u64 },
    ThreadJoinResp { requester: u32, status: u32, return_value: u64 },
    ReadReq { requester: u32, page_va: u64 },
    ReadResp { requester: u32, page_va: u64, page: Vec<u8> },
    ReadInvalidateReq { page_va: u64, requester: u32 },
    ReadInvalidateResp { requester: u32, page_va: u64 },
    WriteReq { requester: u32, page_va: u64 },
    WriteResp { requester: u32, page_va: u64, page: Vec<u8> },
    WriteDemoteReq { page_va: u64, requester: u32 },
    WriteDemoteResp { requester: u32, page_va: u64, page: Vec<u8> },
    WriteInvalidateReq { page_va: u64, requester: u32 },
    WriteInvalidateResp { requester: u32, page_va: u64, page: Vec<u8> },
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Page payloads are elided; a 4 KiB hex dump buries every log line.
        match self {
            Message::ReadResp { requester, page_va, .. } => {
                write!(f, "ReadResp {{ requester: {requester}, page_va: {page_va:#x} }}")
            }
            Message::WriteResp { requester, page_va, .. } => {
                write!(f, "WriteResp {{ requester: {requester}, page_va: {page_va:#x} }}")
            }
            Message::WriteDemoteResp { requester, page_va, .. } => {
                write!(f, "WriteDemoteResp {{ requester: {requester}, page_va: {page_va:#x} }}")
            }
            Message::WriteInvalidateResp { requester, page_va, .. } => write!(
                f,
                "WriteInvalidateResp {{ requester: {requester}, page_va: {page_va:#x} }}"
            ),
            Message::SelfIdentify { address, port } => {
                write!(f, "SelfIdentify {{ address: {address:?}, port: {port} }}")
            }
            Message::PeerIdAssign { requester, peer_id } => {
                write!(f, "PeerIdAssign {{ requester: {requester}, peer_id: {peer_id} }}")
            }
            Message::PeerIdConfirm => write!(f, "PeerIdConfirm"),
            Message::NewPeer { peer_id, address, port } => {
                write!(f, "NewPeer {{ peer_id: {peer_id}, address: {address:?}, port: {port} }}")
            }
            Message::ExistingPeer { peer_id } => {
                write!(f, "ExistingPeer {{ peer_id: {peer_id} }}")
            }
            Message::AllocReq { requester, n_pages } => {
                write!(f, "AllocReq {{ requester: {requester}, n_pages: {n_pages} }}")
            }
            Message::AllocResp { requester, base_va, n_pages } => write!(
                f,
                "AllocResp {{ requester: {requester}, base_va: {base_va:#x}, n_pages: {n_pages} }}"
            ),
            Message::ThreadCreateReq { requester, procedure, arg } => write!(
                f,
                "ThreadCreateReq {{ requester: {requester}, procedure: {procedure}, arg: {arg:#x} }}"
            ),
            Message::ThreadCreateResp { requester, valid, peer_id, thread_id } => write!(
                f,
                "ThreadCreateResp {{ requester: {requester}, valid: {valid}, peer_id: {peer_id}, thread_id: {thread_id} }}"
            ),
            Message::ThreadAssignReq { parent, procedure, arg, thread_id } => write!(
                f,
                "ThreadAssignReq {{ parent: {parent}, procedure: {procedure}, arg: {arg:#x}, thread_id: {thread_id} }}"
            ),
            Message::ThreadAssignResp { requester, status } => {
                write!(f, "ThreadAssignResp {{ requester: {requester}, status: {status} }}")
            }
            Message::ThreadJoinReq { requester, peer_id, thread_id } => write!(
                f,
                "ThreadJoinReq {{ requester: {requester}, peer_id: {peer_id}, thread_id: {thread_id} }}"
            ),
            Message::ThreadJoinResp { requester, status, return_value } => write!(
                f,
                "ThreadJoinResp {{ requester: {requester}, status: {status}, return_value: {return_value:#x} }}"
            ),
            Message::ReadReq { requester, page_va } => {
                write!(f, "ReadReq {{ requester: {requester}, page_va: {page_va:#x} }}")
            }
            Message::ReadInvalidateReq { page_va, requester } => write!(
                f,
                "ReadInvalidateReq {{ page_va: {page_va:#x}, requester: {requester} }}"
            ),
            Message::ReadInvalidateResp { requester, page_va } => write!(
                f,
                "ReadInvalidateResp {{ requester: {requester}, page_va: {page_va:#x} }}"
            ),
            Message::WriteReq { requester, page_va } => {
                write!(f, "WriteReq {{ requester: {requester}, page_va: {page_va:#x} }}")
            }
            Message::WriteDemoteReq { page_va, requester } => write!(
                f,
                "WriteDemoteReq {{ page_va: {page_va:#x}, requester: {requester} }}"
            ),
            Message::WriteInvalidateReq { page_va, requester } => write!(
                f,
                "WriteInvalidateReq {{ page_va: {page_va:#x}, requester: {requester} }}"
            ),
        }
    }
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], WireError> {
    if buf.len() < n {
        return Err(WireError::Truncated);
    }
    let (a, b) = buf.split_at(n);
    *buf = b;
    Ok(a)
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    let b = take(buf, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn take_u64(buf: &mut &[u8]) -> Result<u64, WireError> {
    let b = take(buf, 8)?;
    Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    let b = take(buf, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

fn take_addr(buf: &mut &[u8]) -> Result<String, WireError> {
    let len = take(buf, 1)?[0] as usize;
    if len == 0 || len > MAX_ADDR_BYTES {
        return Err(WireError::InvalidInput("address length"));
    }
    let raw = take(buf, len)?;
    Ok(str::from_utf8(raw).map_err(|_| WireError::Utf8)?.to_string())
}

fn take_page(buf: &mut &[u8]) -> Result<Vec<u8>, WireError> {
    if buf.len() != PAGE_SIZE {
        return Err(WireError::InvalidInput("page payload length"));
    }
    Ok(take(buf, PAGE_SIZE)?.to_vec())
}

fn put_addr(out: &mut Vec<u8>, address: &str) -> Result<(), WireError> {
    let raw = address.as_bytes();
    if raw.is_empty() || raw.len() > MAX_ADDR_BYTES {
        return Err(WireError::InvalidInput("address length"));
    }
    out.push(raw.len() as u8);
    out.extend_from_slice(raw);
    Ok(())
}

fn put_page(out: &mut Vec<u8>, page: &[u8]) -> Result<(), WireError> {
    if page.len() != PAGE_SIZE {
        return Err(WireError::InvalidInput("page payload length"));
    }
    out.extend_from_slice(page);
    Ok(())
}

impl Message {
    pub fn wire_type(&self) -> u32 {
        match self {
            Message::SelfIdentify { .. } => TYPE_SELF_IDENTIFY,
            Message::PeerIdAssign { .. } => TYPE_PEER_ID_ASSIGN,
            Message::PeerIdConfirm => TYPE_PEER_ID_CONFIRM,
            Message::NewPeer { .. } => TYPE_NEW_PEER,
            Message::ExistingPeer { .. } => TYPE_EXISTING_PEER,
            Message::AllocReq { .. } => TYPE_ALLOC_REQ,
            Message::AllocResp { .. } => TYPE_ALLOC_RESP,
            Message::ThreadCreateReq { .. } => TYPE_THREAD_CREATE_REQ,
            Message::ThreadCreateResp { .. } => TYPE_THREAD_CREATE_RESP,
            Message::ThreadAssignReq { .. } => TYPE_THREAD_ASSIGN_REQ,
            Message::ThreadAssignResp { .. } => TYPE_THREAD_ASSIGN_RESP,
            Message::ThreadJoinReq { .. } => TYPE_THREAD_JOIN_REQ,
            Message::ThreadJoinResp { .. } => TYPE_THREAD_JOIN_RESP,
            Message::ReadReq { .. } => TYPE_READ_REQ,
            Message::ReadResp { .. } => TYPE_READ_RESP,
            Message::ReadInvalidateReq { .. } => TYPE_READ_INVALIDATE_REQ,
            Message::ReadInvalidateResp { .. } => TYPE_READ_INVALIDATE_RESP,
            Message::WriteReq { .. } => TYPE_WRITE_REQ,
            Message::WriteResp { .. } => TYPE_WRITE_RESP,
            Message::WriteDemoteReq { .. } => TYPE_WRITE_DEMOTE_REQ,
            Message::WriteDemoteResp { .. } => TYPE_WRITE_DEMOTE_RESP,
            Message::WriteInvalidateReq { .. } => TYPE_WRITE_INVALIDATE_REQ,
            Message::WriteInvalidateResp { .. } => TYPE_WRITE_INVALIDATE_RESP,
        }
    }

    pub fn is_response(&self) -> bool {
        is_response_type(self.wire_type())
    }

    /// Requester id embedded in a response, `None` for requests/notifications.
    pub fn requester(&self) -> Option<u32> {
        match *self {
            Message::PeerIdAssign { requester, .. }
            | Message::AllocResp { requester, .. }
            | Message::ThreadCreateResp { requester, .. }
            | Message::ThreadAssignResp { requester, .. }
            | Message::ThreadJoinResp { requester, .. }
            | Message::ReadResp { requester, .. }
            | Message::ReadInvalidateResp { requester, .. }
            | Message::WriteResp { requester, .. }
            | Message::WriteDemoteResp { requester, .. }
            | Message::WriteInvalidateResp { requester, .. } => Some(requester),
            _ => None,
        }
    }

    /// Page address carried by page-correlated messages, `None` otherwise.
    pub fn page_va(&self) -> Option<u64> {
        match *self {
            Message::ReadReq { page_va, .. }
            | Message::ReadResp { page_va, .. }
            | Message::ReadInvalidateReq { page_va, .. }
            | Message::ReadInvalidateResp { page_va, .. }
            | Message::WriteReq { page_va, .. }
            | Message::WriteResp { page_va, .. }
            | Message::WriteDemoteReq { page_va, .. }
            | Message::WriteDemoteResp { page_va, .. }
            | Message::WriteInvalidateReq { page_va, .. }
            | Message::WriteInvalidateResp { page_va, .. } => Some(page_va),
            _ => None,
        }
    }

    /// Encodes the frame body: TYPE word followed by the payload.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.wire_type().to_be_bytes());
        match self {
            Message::SelfIdentify { address, port } => {
                put_addr(&mut out, address)?;
                out.extend_from_slice(&port.to_be_bytes());
            }
            Message::PeerIdAssign { requester, peer_id } => {
                out.extend_from_slice(&requester.to_be_bytes());
                out.extend_from_slice(&peer_id.to_be_bytes());
            }
            Message::PeerIdConfirm => {}
            Message::NewPeer { peer_id, address, port } => {
                out.extend_from_slice(&peer_id.to_be_bytes());
                put_addr(&mut out, address)?;
                out.extend_from_slice(&port.to_be_bytes());
            }
            Message::ExistingPeer { peer_id } => {
                out.extend_from_slice(&peer_id.to_be_bytes());
            }
            Message::AllocReq { requester, n_pages } => {
                out.extend_from_slice(&requester.to_be_bytes());
                out.extend_from_slice(&n_pages.to_be_bytes());
            }
            Message::AllocResp { requester, base_va, n_pages } => {
                out.extend_from_slice(&requester.to_be_bytes());
                out.extend_from_slice(&base_va.to_be_bytes());
                out.extend_from_slice(&n_pages.to_be_bytes());
            }
            Message::ThreadCreateReq { requester, procedure, arg } => {
                out.extend_from_slice(&requester.to_be_bytes());
                out.extend_from_slice(&procedure.to_be_bytes());
                out.extend_from_slice(&arg.to_be_bytes());
            }
            Message::ThreadCreateResp { requester, valid, peer_id, thread_id } => {
                out.extend_from_slice(&requester.to_be_bytes());
                out.push(u8::from(*valid));
                out.extend_from_slice(&peer_id.to_be_bytes());
                out.extend_from_slice(&thread_id.to_be_bytes());
            }
            Message::ThreadAssignReq { parent, procedure, arg, thread_id } => {
                out.extend_from_slice(&parent.to_be_bytes());
                out.extend_from_slice(&procedure.to_be_bytes());
                out.extend_from_slice(&arg.to_be_bytes());
                out.extend_from_slice(&thread_id.to_be_bytes());
            }
            Message::ThreadAssignResp { requester, status } => {
                out.extend_from_slice(&requester.to_be_bytes());
                out.extend_from_slice(&status.to_be_bytes());
            }
            Message::ThreadJoinReq { requester, peer_id, thread_id } => {
                out.extend_from_slice(&requester.to_be_bytes());
                out.extend_from_slice(&peer_id.to_be_bytes());
                out.extend_from_slice(&thread_id.to_be_bytes());
            }
            Message::ThreadJoinResp { requester, status, return_value } => {
                out.extend_from_slice(&requester.to_be_bytes());
                out.extend_from_slice(&status.to_be_bytes());
                out.extend_from_slice(&return_value.to_be_bytes());
            }
            Message::ReadReq { requester, page_va } | Message::WriteReq { requester, page_va } => {
                out.extend_from_slice(&requester.to_be_bytes());
                out.extend_from_slice(&page_va.to_be_bytes());
            }
            Message::ReadResp { requester, page_va, page }
            | Message::WriteResp { requester, page_va, page }
            | Message::WriteDemoteResp { requester, page_va, page }
            | Message::WriteInvalidateResp { requester, page_va, page } => {
                out.extend_from_slice(&requester.to_be_bytes());
                out.extend_from_slice(&page_va.to_be_bytes());
                put_page(&mut out, page)?;
            }
            Message::ReadInvalidateReq { page_va, requester }
            | Message::WriteDemoteReq { page_va, requester }
            | Message::WriteInvalidateReq { page_va, requester } => {
                out.extend_from_slice(&page_va.to_be_bytes());
                out.extend_from_slice(&requester.to_be_bytes());
            }
            Message::ReadInvalidateResp { requester, page_va } => {
                out.extend_from_slice(&requester.to_be_bytes());
                out.extend_from_slice(&page_va.to_be_bytes());
            }
        }
        if out.len() - 4 > MAX_DATA_BYTES {
            return Err(WireError::Oversize(out.len() - 4));
        }
        Ok(out)
    }

    /// Decodes a frame body produced by [`Message::encode`].
    pub fn decode(body: &[u8]) -> Result<Message, WireError> {
        let mut b = body;
        let wire_type = take_u32(&mut b)?;
        if b.len() > MAX_DATA_BYTES {
            return Err(WireError::Oversize(b.len()));
        }
        let msg = match wire_type {
            TYPE_SELF_IDENTIFY => {
                let address = take_addr(&mut b)?;
                let port = take_u16(&mut b)?;
                Message::SelfIdentify { address, port }
            }
            TYPE_PEER_ID_ASSIGN => Message::PeerIdAssign {
                requester: take_u32(&mut b)?,
                peer_id: take_u32(&mut b)?,
            },
            TYPE_PEER_ID_CONFIRM => Message::PeerIdConfirm,
            TYPE_NEW_PEER => {
                let peer_id = take_u32(&mut b)?;
                let address = take_addr(&mut b)?;
                let port = take_u16(&mut b)?;
                Message::NewPeer { peer_id, address, port }
            }
            TYPE_EXISTING_PEER => Message::ExistingPeer { peer_id: take_u32(&mut b)? },
            TYPE_ALLOC_REQ => Message::AllocReq {
                requester: take_u32(&mut b)?,
                n_pages: take_u32(&mut b)?,
            },
            TYPE_ALLOC_RESP => Message::AllocResp {
                requester: take_u32(&mut b)?,
                base_va: take_u64(&mut b)?,
                n_pages: take_u32(&mut b)?,
            },
            TYPE_THREAD_CREATE_REQ => Message::ThreadCreateReq {
                requester: take_u32(&mut b)?,
                procedure: take_u64(&mut b)?,
                arg: take_u64(&mut b)?,
            },
            TYPE_THREAD_CREATE_RESP => Message::ThreadCreateResp {
                requester: take_u32(&mut b)?,
                valid: take(&mut b, 1)?[0] != 0,
                peer_id: take_u32(&mut b)?,
                thread_id: take_u64(&mut b)?,
            },
            TYPE_THREAD_ASSIGN_REQ => Message::ThreadAssignReq {
                parent: take_u32(&mut b)?,
                procedure: take_u64(&mut b)?,
                arg: take_u64(&mut b)?,
                thread_id: take_u64(&mut b)?,
            },
            TYPE_THREAD_ASSIGN_RESP => Message::ThreadAssignResp {
                requester: take_u32(&mut b)?,
                status: take_u32(&mut b)?,
            },
            TYPE_THREAD_JOIN_REQ => Message::ThreadJoinReq {
                requester: take_u32(&mut b)?,
                peer_id: take_u32(&mut b)?,
                thread_id: take_u64(&mut b)?,
            },
            TYPE_THREAD_JOIN_RESP => Message::ThreadJoinResp {
                requester: take_u32(&mut b)?,
                status: take_u32(&mut b)?,
                return_value: take_u64(&mut b)?,
            },
            TYPE_READ_REQ => Message::ReadReq {
                requester: take_u32(&mut b)?,
                page_va: take_u64(&mut b)?,
            },
            TYPE_READ_RESP => Message::ReadResp {
                requester: take_u32(&mut b)?,
                page_va: take_u64(&mut b)?,
                page: take_page(&mut b)?,
            },
            TYPE_READ_INVALIDATE_REQ => Message::ReadInvalidateReq {
                page_va: take_u64(&mut b)?,
                requester: take_u32(&mut b)?,
            },
            TYPE_READ_INVALIDATE_RESP => Message::ReadInvalidateResp {
                requester: take_u32(&mut b)?,
                page_va: take_u64(&mut b)?,
            },
            TYPE_WRITE_REQ => Message::WriteReq {
                requester: take_u32(&mut b)?,
                page_va: take_u64(&mut b)?,
            },
            TYPE_WRITE_RESP => Message::WriteResp {
                requester: take_u32(&mut b)?,
                page_va: take_u64(&mut b)?,
                page: take_page(&mut b)?,
            },
            TYPE_WRITE_DEMOTE_REQ => Message::WriteDemoteReq {
                page_va: take_u64(&mut b)?,
                requester: take_u32(&mut b)?,
            },
            TYPE_WRITE_DEMOTE_RESP => Message::WriteDemoteResp {
                requester: take_u32(&mut b)?,
                page_va: take_u64(&mut b)?,
                page: take_page(&mut b)?,
            },
            TYPE_WRITE_INVALIDATE_REQ => Message::WriteInvalidateReq {
                page_va: take_u64(&mut b)?,
                requester: take_u32(&mut b)?,
            },
            TYPE_WRITE_INVALIDATE_RESP => Message::WriteInvalidateResp {
                requester: take_u32(&mut b)?,
                page_va: take_u64(&mut b)?,
                page: take_page(&mut b)?,
            },
            other => return Err(WireError::UnknownType(other)),
        };
        if !b.is_empty() {
            return Err(WireError::InvalidInput("trailing bytes"));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn round_trip(msg: Message) {
        let body = msg.encode().expect("encode");
        let decoded = Message::decode(&body).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn read_req_golden_vector_bytes() {
        let msg = Message::ReadReq { requester: 3, page_va: 0x6000_0000_1000 };
        let body = msg.encode().expect("encode");

        // TYPE=16, requester=3, page_va big-endian
        let mut expected = Vec::new();
        expected.extend_from_slice(&16u32.to_be_bytes());
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(&0x6000_0000_1000u64.to_be_bytes());
        assert_eq!(body, expected, "read req bytes drifted");
    }

    #[test]
    fn new_peer_golden_vector_bytes() {
        let msg = Message::NewPeer { peer_id: 2, address: "127.0.0.1".into(), port: 40100 };
        let body = msg.encode().expect("encode");

        let mut expected = Vec::new();
        expected.extend_from_slice(&4u32.to_be_bytes());
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.push(9);
        expected.extend_from_slice(b"127.0.0.1");
        expected.extend_from_slice(&40100u16.to_be_bytes());
        assert_eq!(body, expected, "new peer bytes drifted");
    }

    #[test]
    fn every_message_type_round_trips() {
        let page = vec![0xA5u8; PAGE_SIZE];
        for msg in [
            Message::SelfIdentify { address: "10.0.0.7".into(), port: 9000 },
            Message::PeerIdAssign { requester: 4, peer_id: 4 },
            Message::PeerIdConfirm,
            Message::NewPeer { peer_id: 5, address: "10.0.0.8".into(), port: 9001 },
            Message::ExistingPeer { peer_id: 1 },
            Message::AllocReq { requester: 2, n_pages: 8 },
            Message::AllocResp { requester: 2, base_va: 0x6000_0000_0000, n_pages: 8 },
            Message::AllocResp { requester: 2, base_va: 0, n_pages: 0 },
            Message::ThreadCreateReq { requester: 3, procedure: 1, arg: 0x6000_0000_2000 },
            Message::ThreadCreateResp { requester: 3, valid: true, peer_id: 2, thread_id: 7 },
            Message::ThreadCreateResp { requester: 3, valid: false, peer_id: 0, thread_id: 0 },
            Message::ThreadAssignReq { parent: 3, procedure: 1, arg: 2, thread_id: 7 },
            Message::ThreadAssignResp { requester: 3, status: THREAD_STATUS_OK },
            Message::ThreadJoinReq { requester: 3, peer_id: 2, thread_id: 7 },
            Message::ThreadJoinResp { requester: 3, status: THREAD_STATUS_OK, return_value: 42 },
            Message::ReadReq { requester: 1, page_va: 0x6000_0000_0000 },
            Message::ReadResp { requester: 1, page_va: 0x6000_0000_0000, page: page.clone() },
            Message::ReadInvalidateReq { page_va: 0x6000_0000_0000, requester: 1 },
            Message::ReadInvalidateResp { requester: 1, page_va: 0x6000_0000_0000 },
            Message::WriteReq { requester: 1, page_va: 0x6000_0000_0000 },
            Message::WriteResp { requester: 1, page_va: 0x6000_0000_0000, page: page.clone() },
            Message::WriteDemoteReq { page_va: 0x6000_0000_0000, requester: 1 },
            Message::WriteDemoteResp { requester: 1, page_va: 0x6000_0000_0000, page: page.clone() },
            Message::WriteInvalidateReq { page_va: 0x6000_0000_0000, requester: 1 },
            Message::WriteInvalidateResp { requester: 1, page_va: 0x6000_0000_0000, page },
        ] {
            round_trip(msg);
        }
    }

    #[test]
    fn responses_expose_requester_and_requests_do_not() {
        let resp = Message::ReadResp {
            requester: 6,
            page_va: 0x6000_0000_0000,
            page: vec![0; PAGE_SIZE],
        };
        assert!(resp.is_response());
        assert_eq!(resp.requester(), Some(6));

        let req = Message::ReadReq { requester: 6, page_va: 0x6000_0000_0000 };
        assert!(!req.is_response());
        assert_eq!(req.requester(), None);
    }

    #[test]
    fn rejects_unknown_type() {
        let mut body = Vec::new();
        body.extend_from_slice(&99u32.to_be_bytes());
        assert_eq!(Message::decode(&body), Err(WireError::UnknownType(99)));
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut body = Vec::new();
        body.extend_from_slice(&TYPE_READ_REQ.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes());
        // page_va missing
        assert_eq!(Message::decode(&body), Err(WireError::Truncated));
    }

    #[test]
    fn rejects_short_page_payload() {
        let mut body = Vec::new();
        body.extend_from_slice(&TYPE_READ_RESP.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&0x6000_0000_0000u64.to_be_bytes());
        body.extend_from_slice(&[0u8; 16]);
        assert_eq!(
            Message::decode(&body),
            Err(WireError::InvalidInput("page payload length"))
        );
    }

    #[test]
    fn rejects_trailing_bytes() {
        let msg = Message::ExistingPeer { peer_id: 1 };
        let mut body = msg.encode().expect("encode");
        body.push(0);
        assert_eq!(Message::decode(&body), Err(WireError::InvalidInput("trailing bytes")));
    }

    #[test]
    fn rejects_overlong_address() {
        let msg = Message::SelfIdentify { address: "a".repeat(80), port: 1 };
        assert_eq!(msg.encode(), Err(WireError::InvalidInput("address length")));
    }
}
