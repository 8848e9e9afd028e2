use std::time::Duration;

/// Capacity of the host -> context channel.
pub const INBOX_CAPACITY: usize = 16;
/// Capacity of the context -> host channel.
pub const OUTBOX_CAPACITY: usize = 256;
/// Capacity of the bounded queue between a backend and its context.
pub const CHUNK_QUEUE_CAPACITY: usize = 64;
/// Accepted connections waiting for a session task.
pub const PENDING_CONNECTIONS: usize = 32;

pub const REMOTE_POLL_INTERVAL: Duration = Duration::from_millis(800);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(10);

pub const NETWORK_DISABLED_MSG: &str = "Network access disabled";
pub const CANCELLED_MSG: &str = "Run cancelled";

/// File name every local toolchain plugin must expose inside its language directory.
pub const TOOLCHAIN_ENTRY: &str = "compile-and-run";
