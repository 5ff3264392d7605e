//! Exponential backoff for busy/locked databases

use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::{is_transient, StorageError, StorageResult};

/// Retry settings for transient SQLite failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `op`, retrying busy/locked failures with backoff
    pub(crate) fn run<T, F>(&self, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> rusqlite::Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    if attempt >= self.max_retries {
                        return Err(StorageError::Transient {
                            attempts: attempt + 1,
                            source: e,
                        });
                    }
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    debug!("Database busy, retry {} in {:?}", attempt, delay);
                    thread::sleep(delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
