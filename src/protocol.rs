//! Shared protocol constants for the lansync record stream and discovery

/// Reserved subdirectory of the synchronized root for transient manifests.
pub const PEER_DIR: &str = ".peer";

/// Manifest file names are `action*.json` inside `PEER_DIR`.
pub const ACTION_PREFIX: &str = "action";
pub const ACTION_SUFFIX: &str = ".json";

/// Received payloads are staged under this name next to their target.
pub const PARTIAL_PREFIX: &str = ".lansync-part-";

/// Application port; beacons use the same number over UDP.
pub const DEFAULT_PORT: u16 = 4444;

// Record header: path_len u16 | path | mtime i64 | size i64 (big-endian)
pub const PATH_LEN_BYTES: usize = 2;
pub const MAX_PATH_LEN: usize = u16::MAX as usize;
pub const RECORD_FIXED_BYTES: usize = PATH_LEN_BYTES + 8 + 8;

// Copy buffer for payload streaming
pub const CHUNK_SIZE: usize = 64 * 1024;

// Centralized timing constants
pub mod timeouts {
    // Beacon emit period (s)
    pub const BEACON_PERIOD_SECS: u64 = 5;

    // Window over which beacons count towards "find devices" (s)
    pub const DISCOVERY_WINDOW_SECS: u64 = 5;

    // Max wait between two registry scans when no connection has input (ms)
    pub const SCAN_INTERVAL_MS: u64 = 5_000;

    // Outbound connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 3_000;

    // Beacon listener read timeout, bounds how long close() waits (ms)
    pub const BEACON_POLL_MS: u64 = 250;
}
