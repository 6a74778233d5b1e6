//! Configuration for the sender and receiver roles.
//!
//! Configuration is stored in TOML. Values default to the protocol
//! constants; command-line flags override the file where the two overlap.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::protocol;

/// Top-level configuration with one section per role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broadcast-side configuration.
    pub sender: SenderConfig,
    /// Receive-side configuration.
    pub receiver: ReceiverConfig,
}

/// Configuration for the broadcasting side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Address broadcasts are sent to.
    pub broadcast_addr: String,
    /// Port every receiver listens on.
    pub broadcast_port: u16,
    /// Port this sender listens on for acknowledgment replies.
    pub listen_port: u16,
    /// Percentage of inbound acknowledgments to drop artificially.
    pub drop_chance: u8,
    /// Payload bytes per segment.
    pub payload_size: usize,
    /// In-flight segments per window batch.
    pub window_size: usize,
    /// Milliseconds before an unacknowledged segment is rebroadcast.
    pub segment_timeout_ms: u64,
    /// Milliseconds a file is advertised before streaming begins.
    pub setup_timeout_ms: u64,
    /// Milliseconds of silence before a receiver is evicted.
    pub unresponsive_timeout_ms: u64,
    /// Whether to render a per-file progress bar.
    pub progress_bar: bool,
}

/// Configuration for the receiving side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Port to listen on for broadcast datagrams.
    pub broadcast_port: u16,
    /// Port of the sender's listening socket, for acknowledgment replies.
    pub sender_port: u16,
    /// Percentage of inbound datagrams to drop artificially.
    pub drop_chance: u8,
    /// Directory received files are written into.
    pub output_dir: String,
    /// Milliseconds without any datagram before the receiver exits.
    pub unresponsive_timeout_ms: u64,
}

impl Config {
    /// Load the configuration, or create the file with defaults if it
    /// does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Config, TransferError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Write the configuration to `path` in TOML form.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl SenderConfig {
    pub fn segment_timeout(&self) -> Duration {
        Duration::from_millis(self.segment_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn unresponsive_timeout(&self) -> Duration {
        Duration::from_millis(self.unresponsive_timeout_ms)
    }

    /// Reject out-of-range knobs before any socket is opened.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.drop_chance > 100 {
            return Err(TransferError::DropChanceOutOfRange(self.drop_chance));
        }
        Ok(())
    }
}

impl ReceiverConfig {
    pub fn unresponsive_timeout(&self) -> Duration {
        Duration::from_millis(self.unresponsive_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.drop_chance > 100 {
            return Err(TransferError::DropChanceOutOfRange(self.drop_chance));
        }
        Ok(())
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            broadcast_addr: "255.255.255.255".to_string(),
            broadcast_port: protocol::BROADCAST_PORT,
            listen_port: protocol::SENDER_PORT,
            drop_chance: 0,
            payload_size: protocol::PAYLOAD_SIZE,
            window_size: protocol::WINDOW_SIZE,
            segment_timeout_ms: protocol::SEGMENT_TIMEOUT.as_millis() as u64,
            setup_timeout_ms: protocol::SETUP_TIMEOUT.as_millis() as u64,
            unresponsive_timeout_ms: protocol::UNRESPONSIVE_TIMEOUT.as_millis() as u64,
            progress_bar: true,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            broadcast_port: protocol::BROADCAST_PORT,
            sender_port: protocol::SENDER_PORT,
            drop_chance: 0,
            output_dir: "./downloads".to_string(),
            unresponsive_timeout_ms: protocol::UNRESPONSIVE_TIMEOUT.as_millis() as u64,
        }
    }
}
