// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Whole-packet blocking transport over TCP for dsoftmem
//!
//! Frames are a 4-byte big-endian length word followed by the frame body
//! (`nexus-dsm-packet` encodes the body as TYPE word + payload). Send and
//! receive move whole packets only; a partial read at a frame boundary is a
//! clean close, anywhere else it is an error.

use std::io::{Read, Write};
use std::net::TcpStream;

use nexus_dsm_packet::{Message, WireError, MAX_DATA_BYTES};
use thiserror::Error;

use crate::PeerId;

/// Largest frame body: TYPE word plus the bounded payload.
pub(crate) const MAX_BODY_BYTES: usize = 4 + MAX_DATA_BYTES;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
    /// The remote side closed the connection at a frame boundary.
    #[error("connection closed by peer")]
    Closed,
    /// Advertised frame length is outside the protocol bound.
    #[error("frame of {0} bytes exceeds protocol bound")]
    Oversize(usize),
    /// The frame body failed to encode or decode.
    #[error("malformed frame: {0}")]
    Malformed(WireError),
    /// No live connection for the addressed peer.
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
}

/// Receiving half of a peer connection; owned by that peer's reader thread.
pub(crate) struct FrameReader {
    stream: TcpStream,
}

/// Sending half of a peer connection; shared behind the slot mutex.
pub(crate) struct FrameWriter {
    stream: TcpStream,
}

/// Splits a stream into its two halves via `try_clone`.
pub(crate) fn split(stream: TcpStream) -> std::io::Result<(FrameReader, FrameWriter)> {
    let write_half = stream.try_clone()?;
    Ok((FrameReader { stream }, FrameWriter { stream: write_half }))
}

impl FrameReader {
    /// Blocks for one whole frame body. `Closed` on EOF before the length
    /// word, `Io` on EOF inside a frame.
    pub(crate) fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed)
            }
            Err(err) => return Err(TransportError::Io(err)),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len < 4 || len > MAX_BODY_BYTES {
            return Err(TransportError::Oversize(len));
        }
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body)?;
        Ok(body)
    }

    /// Blocks for one frame and decodes it.
    pub(crate) fn receive_message(&mut self) -> Result<Message, TransportError> {
        let body = self.receive()?;
        Message::decode(&body).map_err(TransportError::Malformed)
    }
}

impl FrameWriter {
    pub(crate) fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let body = msg.encode().map_err(TransportError::Malformed)?;
        let len = body.len() as u32;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(&body)?;
        self.stream.flush()?;
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    use nexus_dsm_packet::Message;

    #[test]
    fn frame_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let (mut reader, _writer) = split(stream).expect("split");
            reader.receive_message().expect("receive")
        });

        let stream = TcpStream::connect(addr).expect("connect");
        let (_reader, mut writer) = split(stream).expect("split");
        let msg = Message::ExistingPeer { peer_id: 3 };
        writer.send(&msg).expect("send");

        assert_eq!(server.join().expect("join"), msg);
    }

    #[test]
    fn eof_at_frame_boundary_reads_as_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let (mut reader, _writer) = split(stream).expect("split");
            reader.receive()
        });

        let stream = TcpStream::connect(addr).expect("connect");
        drop(stream);

        assert!(matches!(server.join().expect("join"), Err(TransportError::Closed)));
    }

    #[test]
    fn oversize_length_word_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let (mut reader, _writer) = split(stream).expect("split");
            reader.receive()
        });

        let mut stream = TcpStream::connect(addr).expect("connect");
        stream
            .write_all(&(u32::MAX).to_be_bytes())
            .expect("write bogus length");

        assert!(matches!(server.join().expect("join"), Err(TransportError::Oversize(_))));
    }
}
