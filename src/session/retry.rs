//! Bounded retry budget.

use tracing::warn;

use crate::suspend::Suspension;
use crate::{AppError, Result};

/// Counts attempts of one step.
///
/// ```ignore
/// let mut retry = RetryBudget::new("attach target", 10);
/// let client = loop {
///     retry.next(&suspension).await?;
///     match attach().await {
///         Ok(client) => break client,
///         Err(err) => retry.failed(err)?,
///     }
/// };
/// ```
#[derive(Debug)]
pub struct RetryBudget {
    what: &'static str,
    attempts: u32,
    attempt: u32,
    last: Option<AppError>,
}

impl RetryBudget {
    /// A budget of `attempts` tries (at least one).
    #[must_use]
    pub fn new(what: &'static str, attempts: u32) -> Self {
        Self {
            what,
            attempts: attempts.max(1),
            attempt: 0,
            last: None,
        }
    }

    /// Start the next attempt and return its 1-based number.
    ///
    /// # Errors
    ///
    /// - [`AppError::Cancelled`] if the suspension was cancelled (waits out
    ///   a pause first);
    /// - [`AppError::RetryExhausted`] carrying the last failure once every
    ///   attempt is used.
    pub async fn next(&mut self, suspension: &Suspension) -> Result<u32> {
        suspension.checkpoint().await?;
        if self.attempt >= self.attempts {
            let last = self
                .last
                .as_ref()
                .map_or_else(|| "no attempt made".to_owned(), ToString::to_string);
            return Err(AppError::RetryExhausted(format!(
                "{} failed {} times; last error: {last}",
                self.what, self.attempts
            )));
        }
        self.attempt += 1;
        Ok(self.attempt)
    }

    /// Record a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns `err` itself when retrying cannot help.
    pub fn failed(&mut self, err: AppError) -> Result<()> {
        if !err.is_retryable() {
            return Err(err);
        }
        warn!(
            what = self.what,
            attempt = self.attempt,
            attempts = self.attempts,
            %err,
            "attempt failed"
        );
        self.last = Some(err);
        Ok(())
    }

    /// Attempts started so far.
    #[must_use]
    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }
}
