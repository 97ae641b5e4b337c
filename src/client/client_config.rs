use std::time::Duration;

pub const DEFAULT_PROTOCOL_VERSION: &str = "0.1";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// sent to the server in the CONNECT handshake
    pub protocol_version: String,

    /// Upper bound for the time a caller waits for a request's response. `None` means waiting
    ///  indefinitely.
    ///
    /// Expiry fails only the caller's handle: the request stays in the response queue so that
    ///  its response is still consumed when (if) it arrives, keeping subsequent responses
    ///  correlated correctly.
    pub request_timeout: Option<Duration>,

    /// Maximum frame body length in both directions. Inbound frames announcing a larger body are
    ///  a protocol violation, outbound requests exceeding it fail with `InvalidArgument`.
    pub max_frame_len: usize,
    pub read_buffer_size: usize,

    /// How long closing a TCP transport waits for submitted data to be written. Whatever is
    ///  still queued after that is discarded.
    pub close_flush_timeout: Duration,

    /// Log a warning when a subscription's delivered-but-unacknowledged bytes exceed this.
    ///  There is no client-side limit: withholding deliveries is up to the server.
    pub unacked_bytes_warn_threshold: Option<u64>,
}

impl ClientConfig {
    pub fn new() -> ClientConfig {
        ClientConfig {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            request_timeout: None,
            max_frame_len: 16 * 1024 * 1024,
            read_buffer_size: 64 * 1024,
            close_flush_timeout: Duration::from_secs(5),
            unacked_bytes_warn_threshold: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::new()
    }
}
