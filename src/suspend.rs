//! Cooperative cancellation and pause primitives.
//!
//! Every long-running wait in the crate is a poll loop driven through
//! [`wait_until`] (or [`wait_until_async`]) with a [`Suspension`] threaded in
//! explicitly. A suspension pairs a [`CancellationToken`] with a
//! [`PauseToken`]:
//!
//! - cancellation is checked before the first tick and after every tick; a
//!   cancelled wait resolves immediately without invoking its condition again.
//! - the pause flag is awaited before each tick starts. A tick already in
//!   progress always finishes; a paused wait simply stalls until resumed (or
//!   cancelled).
//!
//! Time spent paused does not count against a wait's timeout.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{AppError, Result};

// ── Pause flag ────────────────────────────────────────────────────────────────

/// Owner side of a pause flag. Held by whoever may pause a session.
#[derive(Debug)]
pub struct PauseSource {
    tx: watch::Sender<bool>,
}

impl PauseSource {
    /// Create an unpaused source.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Raise the pause flag. Waits stall before their next tick.
    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    /// Clear the pause flag and wake stalled waits.
    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    /// Whether the flag is currently raised.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Hand out an observer for this flag.
    #[must_use]
    pub fn token(&self) -> PauseToken {
        PauseToken {
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl Default for PauseSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a pause flag. The default token is never paused.
#[derive(Debug, Clone, Default)]
pub struct PauseToken {
    rx: Option<watch::Receiver<bool>>,
}

impl PauseToken {
    /// Whether the flag is currently raised.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once the flag is clear. A dropped source counts as clear.
    pub async fn wait_while_paused(&self) {
        let Some(rx) = &self.rx else {
            return;
        };
        let mut rx = rx.clone();
        // Err means the source is gone; nothing can pause us any more.
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

// ── Suspension ────────────────────────────────────────────────────────────────

/// Cancellation plus pause, threaded through every suspension point.
#[derive(Debug, Clone, Default)]
pub struct Suspension {
    cancel: CancellationToken,
    pause: PauseToken,
}

impl Suspension {
    /// Pair a cancellation token with a pause observer.
    #[must_use]
    pub fn new(cancel: CancellationToken, pause: PauseToken) -> Self {
        Self { cancel, pause }
    }

    /// A suspension that is never paused and only cancelled through
    /// [`cancel_token`](Self::cancel_token).
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Derive a suspension whose cancellation also fires when `self` is
    /// cancelled, but which can be cancelled on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            pause: self.pause.clone(),
        }
    }

    /// The underlying cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the pause flag is raised.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Block while paused, then report cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Cancelled`] if cancellation fired before or while
    /// waiting.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(AppError::Cancelled),
            () = self.pause.wait_while_paused() => {}
        }
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        Ok(())
    }

    /// Sleep for `duration` unless cancelled. Pausing stalls the start of the
    /// sleep, not its middle.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Cancelled`] if cancellation fired.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.checkpoint().await?;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AppError::Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

// ── Polling waits ─────────────────────────────────────────────────────────────

/// Timeout and tick interval of a polling wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Total active (unpaused) time before giving up.
    pub timeout: Duration,
    /// Sleep between ticks.
    pub interval: Duration,
}

impl PollSchedule {
    /// Build a schedule.
    #[must_use]
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Convenience constructor from milliseconds.
    #[must_use]
    pub const fn from_millis(timeout_ms: u64, interval_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        )
    }
}

/// How a polling wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition returned `true`.
    Satisfied,
    /// The timeout elapsed first.
    TimedOut,
    /// The suspension was cancelled.
    Cancelled,
}

impl WaitOutcome {
    /// Whether the condition was met.
    #[must_use]
    pub fn is_satisfied(self) -> bool {
        self == Self::Satisfied
    }

    /// Map the outcome onto a `Result`, turning a timeout into `on_timeout()`.
    ///
    /// # Errors
    ///
    /// [`AppError::Cancelled`] when cancelled, `on_timeout()` when timed out.
    pub fn into_result(self, on_timeout: impl FnOnce() -> AppError) -> Result<()> {
        match self {
            Self::Satisfied => Ok(()),
            Self::TimedOut => Err(on_timeout()),
            Self::Cancelled => Err(AppError::Cancelled),
        }
    }
}

/// Poll a synchronous condition until it holds, the schedule's timeout
/// elapses, or the suspension is cancelled.
pub async fn wait_until<F>(suspension: &Suspension, schedule: PollSchedule, mut cond: F) -> WaitOutcome
where
    F: FnMut() -> bool,
{
    wait_until_async(suspension, schedule, || std::future::ready(cond())).await
}

/// Like [`wait_until`], with an asynchronous condition.
pub async fn wait_until_async<F, Fut>(
    suspension: &Suspension,
    schedule: PollSchedule,
    mut cond: F,
) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let cancel = &suspension.cancel;
    if cancel.is_cancelled() {
        return WaitOutcome::Cancelled;
    }

    let mut deadline = Instant::now() + schedule.timeout;
    loop {
        let stalled_at = Instant::now();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return WaitOutcome::Cancelled,
            () = suspension.pause.wait_while_paused() => {}
        }
        deadline += stalled_at.elapsed();

        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        if cond().await {
            return WaitOutcome::Satisfied;
        }
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        if Instant::now() >= deadline {
            return WaitOutcome::TimedOut;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return WaitOutcome::Cancelled,
            () = tokio::time::sleep(schedule.interval) => {}
        }
    }
}
