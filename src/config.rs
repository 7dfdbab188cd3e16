use std::time::Duration;

/// Engine configuration shared by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Per-attempt wait before a retransmission.
    pub timeout: Duration,
    /// Retransmissions allowed before a session gives up.
    pub max_retries: u8,
    /// Linger one timeout after the final ACK to answer a repeated final DATA.
    pub dally: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEF_TIMEOUT_SEC),
            max_retries: crate::MAX_RETRY_COUNT,
            dally: false,
        }
    }
}
