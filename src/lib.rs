//! Filecast - reliable one-to-many file broadcast over UDP.
//!
//! Filecast delivers a sequence of files from one sender to any number of
//! receivers sharing a broadcast segment. Every segment is acknowledged
//! per receiver and retransmitted on a timer until all registered
//! receivers have it; receivers that stop responding are evicted. The
//! 32-bit sequence space is doubled by a red/blue color bit that flips on
//! wrap, so a session never runs out of distinct sequence positions.
//!
//! # Example
//!
//! ```no_run
//! use filecast::{Config, FileReceiver};
//!
//! # async fn run() -> Result<(), filecast::TransferError> {
//! let config = Config::load_or_create("filecast.toml".as_ref())?;
//! let receiver = FileReceiver::new(config.receiver)?;
//! receiver.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod header;
pub mod net;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod window;

pub use config::{Config, ReceiverConfig, SenderConfig};
pub use error::TransferError;
pub use header::{Flag, Header};
pub use receiver::FileReceiver;
pub use segment::Segment;
pub use sender::{DoneHandle, FileSender};
