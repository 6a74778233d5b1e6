//! Segment headers and red/blue sequence arithmetic.
//!
//! Every datagram starts with a 5-byte header: one flag byte followed by a
//! 32-bit big-endian sequence number. The sequence space does not wrap
//! numerically; instead the header's color bit flips from RED to BLUE (or
//! back) and the sequence restarts at zero, doubling the usable sequence
//! space within a session. Ordering and distance are therefore defined over
//! (color, sequence) pairs rather than over raw integers.

use std::cmp::Ordering;
use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut};

use crate::error::TransferError;

/// An 8-bit flag field with independent, named bits.
///
/// Data-carrying packets set exactly one of [`Flag::RED`] and
/// [`Flag::BLUE`]; acknowledgments echo the original bits with
/// [`Flag::ACK`] added on top. The NACK bit is reserved and never emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flag(u8);

impl Flag {
    /// The packet acknowledges another packet's header.
    pub const ACK: Flag = Flag(1 << 0);
    /// Reserved, never set.
    pub const NACK: Flag = Flag(1 << 1);
    /// The payload is a file name, opening a new file.
    pub const FILE: Flag = Flag(1 << 2);
    /// The current file is complete.
    pub const EOF: Flag = Flag(1 << 3);
    /// The whole session is complete.
    pub const EXIT: Flag = Flag(1 << 4);
    /// Red half of the sequence space.
    pub const RED: Flag = Flag(1 << 5);
    /// Blue half of the sequence space.
    pub const BLUE: Flag = Flag(1 << 6);

    /// Rebuild a flag from its wire byte.
    pub fn from_bits(bits: u8) -> Flag {
        Flag(bits)
    }

    /// The raw wire byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    pub fn contains(self, other: Flag) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_ack(self) -> bool {
        self.contains(Flag::ACK)
    }

    pub fn is_nack(self) -> bool {
        self.contains(Flag::NACK)
    }

    pub fn is_file(self) -> bool {
        self.contains(Flag::FILE)
    }

    pub fn is_eof(self) -> bool {
        self.contains(Flag::EOF)
    }

    pub fn is_exit(self) -> bool {
        self.contains(Flag::EXIT)
    }

    pub fn is_red(self) -> bool {
        self.contains(Flag::RED)
    }

    pub fn is_blue(self) -> bool {
        self.contains(Flag::BLUE)
    }

    /// The color bit of this flag, if it carries exactly one.
    ///
    /// A flag with neither or both color bits is malformed and yields
    /// `None`; callers drop such segments.
    pub fn color(self) -> Option<Flag> {
        match (self.is_red(), self.is_blue()) {
            (true, false) => Some(Flag::RED),
            (false, true) => Some(Flag::BLUE),
            _ => None,
        }
    }

    /// The opposite color. Red for blue, blue for red.
    fn flipped_color(self) -> Flag {
        if self.is_red() {
            Flag::BLUE
        } else {
            Flag::RED
        }
    }
}

impl BitOr for Flag {
    type Output = Flag;

    fn bitor(self, rhs: Flag) -> Flag {
        Flag(self.0 | rhs.0)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_eof() {
            "EOF"
        } else if self.is_exit() {
            "EXIT"
        } else if self.is_file() {
            "FILE"
        } else {
            "-"
        };
        let color = match (self.is_red(), self.is_blue()) {
            (true, false) => "RED",
            (false, true) => "BLUE",
            _ => "-",
        };
        if self.is_ack() {
            write!(f, "{kind}+ACK,{color}")
        } else {
            write!(f, "{kind},{color}")
        }
    }
}

/// A packet header: flag byte plus 32-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    pub flag: Flag,
    pub seq: u32,
}

impl Header {
    /// Serialized size in bytes.
    pub const SIZE: usize = 5;

    pub fn new(flag: Flag, seq: u32) -> Header {
        Header { flag, seq }
    }

    /// Write the wire form: flag byte, then the sequence big-endian.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flag.bits());
        buf.put_u32(self.seq);
    }

    /// Parse a header from the front of `buf`, consuming [`Header::SIZE`]
    /// bytes. Anything left over is the segment payload.
    pub fn decode(buf: &mut impl Buf) -> Result<Header, TransferError> {
        if buf.remaining() < Header::SIZE {
            return Err(TransferError::MalformedSegment {
                len: buf.remaining(),
                min: Header::SIZE,
            });
        }
        let flag = Flag::from_bits(buf.get_u8());
        let seq = buf.get_u32();
        Ok(Header { flag, seq })
    }

    /// The header reduced to its color bit and sequence number.
    ///
    /// This is the identity used for window lookup, the receiver cache and
    /// ordering; ACK, FILE, EOF and EXIT decorations are stripped.
    pub fn pure(self) -> Header {
        let color = if self.flag.is_red() {
            Flag::RED
        } else {
            Flag::BLUE
        };
        Header {
            flag: color,
            seq: self.seq,
        }
    }

    /// The next header in the red/blue sequence.
    ///
    /// Within a color the sequence just increments; at `u32::MAX` the color
    /// flips and the sequence restarts at zero. The result carries only a
    /// color bit, no other decorations.
    pub fn next(self) -> Header {
        if self.seq == u32::MAX {
            Header {
                flag: self.flag.flipped_color(),
                seq: 0,
            }
        } else {
            Header {
                flag: self.pure().flag,
                seq: self.seq + 1,
            }
        }
    }

    /// Return this header with `flag` added to its flag bits.
    pub fn with(self, flag: Flag) -> Header {
        Header {
            flag: self.flag | flag,
            seq: self.seq,
        }
    }

    /// Order two headers in the red/blue sequence.
    ///
    /// Same color compares by sequence number. Across colors the relation
    /// inverts: the larger sequence number is the *older* header, because
    /// it was issued before the wrap that flipped the color.
    pub fn compare(self, other: Header) -> Ordering {
        let (this, that) = (self.pure(), other.pure());
        if this == that {
            return Ordering::Equal;
        }
        if this.flag.is_red() == that.flag.is_red() {
            this.seq.cmp(&that.seq)
        } else if this.seq > that.seq {
            // The larger sequence preceded the color flip, so it is older.
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// Number of forward steps from `self` to `to` in the red/blue
    /// sequence.
    ///
    /// Spans the color flip, so the result can exceed `u32::MAX` and is
    /// returned as `u64`.
    pub fn distance(self, to: Header) -> u64 {
        if self.flag.is_red() == to.flag.is_red() {
            u64::from(to.seq.wrapping_sub(self.seq))
        } else {
            u64::from(u32::MAX - self.seq) + u64::from(to.seq) + 1
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Header({},{})", self.flag, self.seq)
    }
}
