//! Backoff between control tunnel connection attempts

use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the delay
    pub max_backoff: Duration,
    /// Growth factor applied after every failed attempt
    pub multiplier: f64,
    /// `None` retries forever
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Gave up after {0} reconnection attempts")]
    MaxAttemptsReached(usize),
}

/// Tracks consecutive failures of the control tunnel
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep for the current delay, then grow it for next time
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;
        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached(max_attempts));
            }
        }

        debug!(
            attempt = self.attempt,
            "Reconnecting in {}ms",
            self.current_backoff.as_millis()
        );
        tokio::time::sleep(self.current_backoff).await;

        let grown = self.current_backoff.mul_f64(self.config.multiplier.max(1.0));
        self.current_backoff = grown.min(self.config.max_backoff);
        Ok(())
    }

    /// Forget past failures once a tunnel has been established
    pub fn reset(&mut self) {
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
