//! Segments: the unit of transfer on the wire.
//!
//! A segment is a [`Header`] followed by up to
//! [`PAYLOAD_SIZE`](crate::protocol::PAYLOAD_SIZE) payload bytes and maps
//! one-to-one onto a UDP datagram.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::TransferError;
use crate::header::{Flag, Header};

/// A header plus its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: Header,
    pub payload: Bytes,
}

impl Segment {
    pub fn new(flag: Flag, seq: u32, payload: Bytes) -> Segment {
        Segment {
            header: Header::new(flag, seq),
            payload,
        }
    }

    pub fn with_header(header: Header, payload: Bytes) -> Segment {
        Segment { header, payload }
    }

    /// Reconstruct a segment from a received datagram.
    ///
    /// The first five bytes are the header, everything after is payload.
    /// Fails on datagrams too short to hold a header.
    pub fn parse(mut wire: Bytes) -> Result<Segment, TransferError> {
        let header = Header::decode(&mut wire)?;
        Ok(Segment {
            header,
            payload: wire,
        })
    }

    /// The wire form: encoded header followed by the payload.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Header::SIZE + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn is_ack(&self) -> bool {
        self.header.flag.is_ack()
    }

    pub fn is_file(&self) -> bool {
        self.header.flag.is_file()
    }

    pub fn is_eof(&self) -> bool {
        self.header.flag.is_eof()
    }

    pub fn is_exit(&self) -> bool {
        self.header.flag.is_exit()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, payload {} byte(s)", self.header, self.payload.len())
    }
}
