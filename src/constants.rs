//! # Pipeline Constants
//!
//! Topic names, unit protocol event names and the default timings that the
//! configuration layer falls back to.

/// Broker topics carrying pipeline events
pub mod topics {
    pub const IMAGE_UPLOADED: &str = "image-uploaded";
    pub const IMAGE_RESIZE: &str = "image-resize";

    /// Suffix appended to a topic to form its dead-letter topic
    pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

    pub fn dead_letter(topic: &str) -> String {
        format!("{topic}{DEAD_LETTER_SUFFIX}")
    }
}

/// Default consumer channels
pub mod channels {
    pub const FAN_OUT: &str = "rszr-fan-out";
    pub const DISPATCHER: &str = "rszr-dispatcher";
}

/// Event names of the unit transport envelope
pub mod unit_events {
    pub const PROCESS: &str = "process";
    pub const COMPLETE: &str = "complete";
}

/// Fallback values used when configuration leaves a field unset
pub mod defaults {
    pub const REQUEUE_DELAY_MS: u64 = 1_000;
    pub const ASSIGNMENT_TIMEOUT_MS: u64 = 5_000;
    pub const FETCH_TIMEOUT_MS: u64 = 30_000;
    pub const UPLOAD_TIMEOUT_MS: u64 = 30_000;

    pub const NSQD_PORT: u16 = 4150;
    pub const LOOKUPD_POLL_INTERVAL_MS: u64 = 15_000;
    pub const MAX_IN_FLIGHT: u32 = 10;
    pub const MSG_TIMEOUT_MS: u64 = 60_000;
    /// Bodies the in-memory broker keeps per topic for inspection
    pub const PUBLISHED_LOG_LIMIT: usize = 1_024;
    pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;
    pub const RECONNECT_DELAY_MS: u64 = 5_000;
    pub const CLIENT_ID: &str = "rszr";

    pub const BIND_ADDRESS: &str = "0.0.0.0:3000";
    pub const CONTENT_TYPE: &str = "application/octet-stream";
}
