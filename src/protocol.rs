//! Shared protocol constants for the chunked transfer protocol

// Chunk header layout: chunk_id | chunk_size | total_chunks | type | filename[64]
// All integers big-endian.
pub const FILENAME_LEN: usize = 64;
pub const HEADER_LEN: usize = 4 * 4 + FILENAME_LEN;

// Reserved header type field, always 0 on the wire
pub const CHUNK_TYPE_DATA: u32 = 0;

// Payload bytes per chunk produced by the send path
pub const DEFAULT_CHUNK_SIZE: u32 = 512;

// Largest accepted chunk payload on receipt
pub const CHUNK_MAX: u32 = 8192;

// Largest accepted total chunk count (~1 GB at 512-byte chunks)
pub const TOTAL_CHUNKS_MAX: u32 = 2_000_000;

// Fixed capacity of a connection's command/line buffer
pub const LINE_CAPACITY: usize = 1024;

// Default bound on concurrently registered server connections (0 = unbounded)
pub const MAX_CLIENTS: usize = 10;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";

// Uploaded files land here, relative to the server root
pub const STORAGE_DIR: &str = "saved";

// Text protocol status prefixes and literal lines
pub mod reply {
    pub const SUCCESS: &str = "SUCCESS:";
    pub const ERROR: &str = "ERROR:";
    pub const OK: &str = "OK:";
    pub const END_OF_LIST: &str = "END_OF_LIST";
    // Announces that binary chunks follow on this stream
    pub const BEGIN_TRANSFER: &str = "BEGIN_TRANSFER";

    pub const FILE_UPLOADED: &str = "SUCCESS: File uploaded";
    pub const FILE_NOT_FOUND: &str = "ERROR: File not found";
    pub const FILE_EMPTY: &str = "ERROR: File is empty";
    pub const BUSY: &str = "ERROR: Transfer already in progress";
    pub const UNKNOWN_COMMAND: &str = "ERROR: Unknown command";
    pub const OVERFLOW: &str = "ERROR: Buffer overflow - connection terminated";
}

// Text protocol request verbs
pub mod verb {
    pub const LIST: &str = "ls";
    pub const GET: &str = "get";
    pub const UPLOAD: &str = "upload";
    pub const PWD: &str = "pwd";
    pub const CD: &str = "cd";
    pub const DELETE: &str = "delete";
    pub const RENAME: &str = "rename";
    pub const HEALTH: &str = "health";
}

// Send-side backpressure and pacing
pub mod pacing {
    use std::time::Duration;

    // Immediate retries on would-block before yielding to the reactor
    pub const SEND_RETRIES: u32 = 5;
    pub const RETRY_BASE_MS: u64 = 1;
    pub const RETRY_CAP_MS: u64 = 16;

    // Transfers above this many chunks get enlarged socket buffers
    pub const LARGE_TRANSFER_CHUNKS: u32 = 100_000;
    pub const LARGE_SOCKET_BUFFER: usize = 256 * 1024;

    // Delay before the n-th retry: 1ms, 2ms, 4ms ... capped
    pub fn retry_delay(attempt: u32) -> Duration {
        let ms = RETRY_BASE_MS.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(ms.min(RETRY_CAP_MS))
    }

    // Inter-chunk pause for very large sends
    pub fn chunk_pause(chunk_id: u32, total_chunks: u32) -> Option<Duration> {
        if total_chunks > 500_000 && chunk_id % 100 == 0 {
            Some(Duration::from_micros(900))
        } else if total_chunks > LARGE_TRANSFER_CHUNKS && chunk_id % 500 == 0 {
            Some(Duration::from_micros(600))
        } else {
            None
        }
    }

    // Whether to emit a progress callback after this chunk
    pub fn report_progress(chunk_id: u32, total_chunks: u32) -> bool {
        (total_chunks > 50_000 && chunk_id % 1000 == 0)
            || (total_chunks > 10_000 && chunk_id % 5000 == 0)
    }
}

// Receive-side durability thresholds
pub mod durability {
    pub const FLUSH_ABOVE_CHUNKS: u32 = 10_000;
    pub const FLUSH_EVERY: u32 = 1000;
    pub const SYNC_ABOVE_CHUNKS: u32 = 500_000;
    pub const SYNC_EVERY: u32 = 500;
}

// Centralized timeout constants
pub mod timeouts {
    // Client wait timeout while receiving (ms)
    pub const DOWNLOAD_WAIT_MS: u64 = 10_000;

    // Consecutive empty waits before a download counts as stalled
    pub const STALL_LIMIT: u32 = 5;
    pub const STALL_LIMIT_LARGE: u32 = 10;

    // Stall limit scaled for the expected transfer size
    pub fn stall_limit(base: u32, expected_chunks: u32) -> u32 {
        if expected_chunks > super::pacing::LARGE_TRANSFER_CHUNKS {
            base.max(STALL_LIMIT_LARGE)
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn header_is_eighty_bytes() {
        assert_eq!(HEADER_LEN, 80);
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        assert_eq!(pacing::retry_delay(0), Duration::from_millis(1));
        assert_eq!(pacing::retry_delay(1), Duration::from_millis(2));
        assert_eq!(pacing::retry_delay(2), Duration::from_millis(4));
        assert_eq!(pacing::retry_delay(10), Duration::from_millis(pacing::RETRY_CAP_MS));
    }

    #[test]
    fn pacing_only_applies_to_large_transfers() {
        assert!(pacing::chunk_pause(0, 10).is_none());
        assert_eq!(pacing::chunk_pause(500, 200_000), Some(Duration::from_micros(600)));
        assert_eq!(pacing::chunk_pause(100, 600_000), Some(Duration::from_micros(900)));
        assert!(pacing::chunk_pause(101, 600_000).is_none());
    }

    #[test]
    fn stall_limit_scales_for_large_downloads() {
        assert_eq!(timeouts::stall_limit(5, 10), 5);
        assert_eq!(timeouts::stall_limit(5, 200_000), 10);
        assert_eq!(timeouts::stall_limit(20, 200_000), 20);
    }
}
