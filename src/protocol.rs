//! Protocol-wide constants shared by the sender and the receivers.
//!
//! Both sides must agree on these in advance; the configuration layer only
//! overrides them for tests and unusual deployments.

use std::time::Duration;

use crate::header::Header;

/// The port every receiver listens on for broadcast datagrams.
pub const BROADCAST_PORT: u16 = 9001;

/// Default port the sender listens on for acknowledgment replies.
pub const SENDER_PORT: u16 = 9000;

/// How long a segment waits for acknowledgment before it is rebroadcast.
pub const SEGMENT_TIMEOUT: Duration = Duration::from_millis(1500);

/// How long the sender advertises a file before it stops accepting
/// new receivers for it.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a peer may stay silent before it is considered gone. The
/// sender evicts receivers after this; a receiver with no inbound
/// datagrams at all exits after it.
pub const UNRESPONSIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// The serialized header size in bytes.
pub const HEADER_SIZE: usize = Header::SIZE;

/// Maximum payload bytes carried by one segment.
pub const PAYLOAD_SIZE: usize = 500;

/// Maximum segment size on the wire: header plus payload.
pub const SEGMENT_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Number of in-flight segments the sending window holds.
pub const WINDOW_SIZE: usize = 10;
