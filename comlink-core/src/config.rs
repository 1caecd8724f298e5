//! Tunables shared by links, managers and the relay.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Link configuration. Every field has a default, so an empty table is valid.
///
/// Timeouts are in milliseconds; `0` means wait indefinitely.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Capacity of a direct link's outbound queue.
    pub queue_capacity: usize,
    /// Capacity of a shared physical uplink's outbound queue.
    pub uplink_queue_capacity: usize,
    /// Flush the sink after every message.
    pub flush_after_write: bool,
    /// Largest payload sent in one file frame.
    pub file_part_size: usize,
    /// Chunk size used when copying received file bytes to disk.
    pub read_chunk_size: usize,
    pub connect_timeout_ms: u64,
    /// How long a graceful close keeps retrying.
    pub close_timeout_ms: u64,
    /// How long teardown waits for the output pump to drain.
    pub shutdown_timeout_ms: u64,
    /// How long a file sender waits for queue room before each part.
    pub part_wait_timeout_ms: u64,
    /// How long a freshly opened TCP link may take to introduce itself.
    pub hello_timeout_ms: u64,
    /// Directory that file names are resolved against.
    pub file_dir: PathBuf,
    /// Log every frame sent and received at debug level.
    pub log_traffic: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            uplink_queue_capacity: 500,
            flush_after_write: true,
            file_part_size: 4095,
            read_chunk_size: 128,
            connect_timeout_ms: 0,
            close_timeout_ms: 10_000,
            shutdown_timeout_ms: 0,
            part_wait_timeout_ms: 3_000,
            hello_timeout_ms: 5_000,
            file_dir: PathBuf::from("."),
            log_traffic: true,
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn part_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.part_wait_timeout_ms)
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }
}
