//! Reconnecting stream client.
//!
//! [`StreamClient`] attaches to one session over the streaming endpoint and
//! keeps it attached across transport failures. An abnormal disconnect
//! moves the client to [`ClientState::Reconnecting`]: it waits out an
//! exponential backoff, asks a [`SessionDirectory`] whether the session
//! still exists, and connects again. A session that is gone, or too many
//! failed attempts, ends in [`ClientState::Failed`].

mod directory;
mod stream;

use std::time::Duration;

use protocol::{ErrorCode, ServerMessage};
use rand::Rng;
use thiserror::Error;

use crate::config::ClientConfig;

pub use directory::{DirectoryFuture, IpcSessionDirectory, SessionDirectory};
pub use stream::StreamClient;

/// Fraction of the nominal delay added as random jitter, at most.
const JITTER_FRACTION: f64 = 0.1;

/// Connection state of a [`StreamClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// First connection attempt in progress.
    Connecting,
    /// Connected and streaming.
    Attached,
    /// Waiting to retry after an abnormal disconnect.
    Reconnecting,
    /// Gave up; the session is gone or retries are exhausted.
    Failed,
    /// Detached normally.
    Closed,
}

/// Events emitted by a running [`StreamClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The client changed state.
    StateChanged(ClientState),
    /// A retry is scheduled.
    RetryScheduled {
        /// 1-based retry number.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// A message from the server.
    Message(ServerMessage),
}

/// Why a [`StreamClient`] stopped without detaching normally.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("server refused the connection with HTTP {status}")]
    Rejected { status: u16 },

    #[error("{message}")]
    Terminated { code: ErrorCode, message: String },

    #[error("session {0} no longer exists")]
    SessionGone(String),

    #[error("gave up after {attempts} reconnection attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("session lookup failed: {0}")]
    Directory(String),
}

/// Exponential backoff between reconnection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the nominal delay.
    pub max_delay: Duration,
    /// Retries before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ReconnectPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^(attempt-1), max)` for a 1-based attempt.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// The nominal delay plus up to 10% random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
        nominal.mul_f64(1.0 + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    #[test]
    fn test_nominal_delay_doubles() {
        let policy = policy();
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(500));
        assert_eq!(policy.nominal_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(2000));
        assert_eq!(policy.nominal_delay(4), Duration::from_millis(4000));
    }

    #[test]
    fn test_nominal_delay_is_capped() {
        let policy = policy();
        assert_eq!(policy.nominal_delay(7), Duration::from_secs(30));
        assert_eq!(policy.nominal_delay(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = policy();
        for attempt in 1..=8 {
            let nominal = policy.nominal_delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= nominal);
                assert!(delay <= nominal.mul_f64(1.0 + JITTER_FRACTION) + Duration::from_nanos(1));
            }
        }
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_millis(30_000));
        assert_eq!(policy.max_attempts, 5);
    }
}
