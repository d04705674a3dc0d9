#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Backoff;
use bon::Builder;
use secrecy::SecretString;

const DEFAULT_RETRY_DELAY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_STEP_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);

/// Configuration for a [`crate::ws::Connection`].
///
/// ```rust
/// use std::time::Duration;
///
/// use hass_ws_client::ws::config::Config;
///
/// let config = Config::builder()
///     .auth_token("my-password".to_owned())
///     .max_retries(3)
///     .heartbeat_interval(Duration::from_secs(30))
///     .build();
/// assert_eq!(config.max_retries, Some(3));
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Sent as `api_password` when the server asks for authentication
    #[builder(into)]
    pub auth_token: Option<SecretString>,
    /// Transient handshake failures tolerated by [`crate::ws::Connection::connect`].
    /// `None` retries indefinitely.
    pub max_retries: Option<u32>,
    /// Constant pause between handshake retries, also used before a cache
    /// retries a fetch the server refused
    #[builder(default = DEFAULT_RETRY_DELAY_DURATION)]
    pub retry_delay: Duration,
    /// Policy used after an established connection drops
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Interval for sending `ping` commands. `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    /// Maximum time to wait for `pong` before considering the socket dead
    #[builder(default = DEFAULT_HEARTBEAT_TIMEOUT_DURATION)]
    pub heartbeat_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay added per consecutive failed attempt
    #[builder(default = DEFAULT_BACKOFF_STEP_DURATION)]
    pub backoff_step: Duration,
    /// Maximum backoff duration
    #[builder(default = DEFAULT_MAX_BACKOFF_DURATION)]
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None, // Infinite reconnection by default
            backoff_step: DEFAULT_BACKOFF_STEP_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
        }
    }
}

/// Capped linear backoff: the n-th delay after a reset is `step * n`, never
/// more than `max`. The first delay is zero so a dropped socket is retried
/// right away.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    step: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Backoff for ReconnectBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.step.saturating_mul(self.attempt).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}

impl From<&ReconnectConfig> for ReconnectBackoff {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            step: config.backoff_step,
            max: config.max_backoff,
            attempt: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence() {
        let mut backoff = ReconnectBackoff::from(&ReconnectConfig::default());

        // A fresh drop reconnects immediately
        assert_eq!(backoff.next_backoff(), Some(Duration::ZERO));
        // Then one and two seconds after the first two failures
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn backoff_respects_max() {
        let mut backoff = ReconnectBackoff::from(&ReconnectConfig::default());

        let delays: Vec<_> = (0..9).filter_map(|_| backoff.next_backoff()).collect();
        let millis: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
        assert_eq!(
            millis,
            [0, 1000, 2000, 3000, 4000, 5000, 5000, 5000, 5000],
            "delays stay capped at five seconds"
        );
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = ReconnectBackoff::from(&ReconnectConfig::default());
        for _ in 0..4 {
            let _next = backoff.next_backoff();
        }
        assert_eq!(backoff.attempt(), 4);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::ZERO));
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert!(config.auth_token.is_none(), "no token unless configured");
        assert_eq!(config.max_retries, None);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval, None);
        assert_eq!(config.reconnect.max_backoff, Duration::from_secs(5));
    }
}
