//! Target process pool.
//!
//! The pool tracks every target process the host may hand to a session.
//! Each one is either free or allocated; the only transitions are
//! [`allocate`](ProcessPool::allocate) / [`allocate_matching`](ProcessPool::allocate_matching)
//! and [`free`](ProcessPool::free). Processes that exit are pruned whenever
//! the pool is touched. Launching new targets goes through the shared
//! [`ResourceLock`] so launches of one executable are serialized and spaced.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{info, info_span, warn, Instrument};

use crate::client::{ClientSettings, Identity, TargetClient};
use crate::platform::{LaunchSpec, Platform};
use crate::resource_lock::ResourceLock;
use crate::suspend::{wait_until_async, PollSchedule, Suspension, WaitOutcome};
use crate::{AppError, Result};

/// Argument that stops the launcher from switching to the 64-bit client.
pub const NO_64BIT_ARG: &str = "-noautolaunch64bit";

/// How targets are launched and awaited.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Target executable.
    pub executable: PathBuf,
    /// Extra launch arguments.
    pub args: Vec<String>,
    /// Wait for a new process's main window.
    pub spawn: PollSchedule,
    /// Pause after the window appears before the process is handed out.
    pub settle: Duration,
    /// Back-off while the launch lock is refused.
    pub lock_retry: Duration,
}

impl PoolSettings {
    /// Settings with the default two-minute window wait polled every 100 ms.
    #[must_use]
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
            spawn: PollSchedule::from_millis(120_000, 100),
            settle: Duration::from_secs(1),
            lock_retry: Duration::from_secs(1),
        }
    }

    /// Launch spec with the fixed no-64-bit policy applied.
    #[must_use]
    pub fn launch_spec(&self) -> LaunchSpec {
        let mut args = self.args.clone();
        if !args.iter().any(|a| a.eq_ignore_ascii_case(NO_64BIT_ARG)) {
            args.push(NO_64BIT_ARG.to_owned());
        }
        LaunchSpec::new(self.executable.clone(), args)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    free: VecDeque<u32>,
    allocated: HashSet<u32>,
    spawned: HashSet<u32>,
}

/// Shared pool of target processes.
pub struct ProcessPool {
    platform: Arc<dyn Platform>,
    lock: ResourceLock,
    settings: PoolSettings,
    state: Mutex<PoolState>,
}

impl ProcessPool {
    /// Empty pool launching through `platform`, arbitrated by `lock`.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, lock: ResourceLock, settings: PoolSettings) -> Self {
        Self {
            platform,
            lock,
            settings,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Add an already-running process as free. Adopted processes are never
    /// killed by [`dispose`](Self::dispose).
    ///
    /// # Errors
    ///
    /// [`AppError::ProcessUnavailable`] if `pid` is not running.
    pub fn adopt(&self, pid: u32) -> Result<()> {
        if !self.platform.is_alive(pid) {
            return Err(AppError::ProcessUnavailable(format!("pid {pid} is not running")));
        }
        let mut state = self.state();
        if state.allocated.contains(&pid) || state.free.contains(&pid) {
            return Ok(());
        }
        state.free.push_back(pid);
        info!(pid, "process adopted into pool");
        Ok(())
    }

    /// Hand out a free process, or launch a new one.
    ///
    /// # Errors
    ///
    /// - [`AppError::SpawnTimeout`] if a launched process never shows a window.
    /// - [`AppError::Cancelled`] when the suspension fires.
    /// - launch failures from the platform.
    pub async fn allocate(&self, owner: &str, suspension: &Suspension) -> Result<u32> {
        if let Some(pid) = self.take_free() {
            info!(pid, owner, "allocated free process");
            return Ok(pid);
        }
        self.spawn(owner, suspension).await
    }

    /// Prefer a free process already logged in as `identity`, then any free
    /// process, then a new one.
    ///
    /// Each candidate is claimed before it is probed, so concurrent callers
    /// never inspect or receive the same process.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate).
    pub async fn allocate_matching(
        &self,
        identity: &Identity,
        owner: &str,
        client: &ClientSettings,
        suspension: &Suspension,
    ) -> Result<u32> {
        let candidates: Vec<u32> = {
            let mut state = self.state();
            self.prune(&mut state);
            state.free.iter().copied().collect()
        };

        for pid in candidates {
            if !self.claim(pid) {
                continue;
            }
            let probe = async {
                let mut target =
                    TargetClient::attach(pid, self.platform.as_ref(), client, suspension).await?;
                target.identity()
            };
            match probe.await {
                Ok(Some(found)) if found.matches(identity) => {
                    info!(pid, owner, %identity, "allocated matching process");
                    return Ok(pid);
                }
                Err(AppError::Cancelled) => {
                    self.unclaim(pid);
                    return Err(AppError::Cancelled);
                }
                Ok(_) => self.unclaim(pid),
                Err(err) => {
                    warn!(pid, %err, "could not probe pooled process");
                    self.unclaim(pid);
                }
            }
        }

        self.allocate(owner, suspension).await
    }

    /// Return an allocated process.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidArgument`] if `pid` is not currently allocated.
    pub fn free(&self, pid: u32) -> Result<()> {
        let mut state = self.state();
        if !state.allocated.remove(&pid) {
            let reason = if state.free.contains(&pid) {
                "process is not in use"
            } else {
                "process does not belong to the pool"
            };
            return Err(AppError::InvalidArgument(format!("cannot free pid {pid}: {reason}")));
        }
        if self.platform.is_alive(pid) {
            state.free.push_back(pid);
            info!(pid, "process returned to pool");
        }
        Ok(())
    }

    /// Forget `pid` entirely (it exited, or its holder gave up on it).
    pub fn discard(&self, pid: u32) {
        let mut state = self.state();
        state.allocated.remove(&pid);
        state.free.retain(|p| *p != pid);
    }

    /// Currently free pids, after pruning.
    #[must_use]
    pub fn free_pids(&self) -> Vec<u32> {
        let mut state = self.state();
        self.prune(&mut state);
        state.free.iter().copied().collect()
    }

    /// Whether `pid` is allocated.
    #[must_use]
    pub fn is_allocated(&self, pid: u32) -> bool {
        self.state().allocated.contains(&pid)
    }

    /// Kill every process this pool launched, whatever its state. Adopted
    /// processes keep running.
    pub fn dispose(&self) {
        let spawned: Vec<u32> = {
            let mut state = self.state();
            let spawned = state.spawned.drain().collect();
            state.free.clear();
            state.allocated.clear();
            spawned
        };
        for pid in spawned {
            if !self.platform.is_alive(pid) {
                continue;
            }
            match self.platform.kill(pid) {
                Ok(()) => info!(pid, "pooled process killed"),
                Err(err) => warn!(pid, %err, "failed to kill pooled process"),
            }
        }
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    async fn spawn(&self, owner: &str, suspension: &Suspension) -> Result<u32> {
        let spec = self.settings.launch_spec();
        let key = spec.program.to_string_lossy().into_owned();
        let span = info_span!("spawn_target", owner, executable = %key);

        async {
            let token = self
                .lock
                .acquire_with_backoff(&key, owner, self.settings.lock_retry, suspension)
                .await?;

            let pid = self.platform.launch(&spec)?;
            {
                let mut state = self.state();
                state.spawned.insert(pid);
                state.allocated.insert(pid);
            }

            let platform = &self.platform;
            let outcome = wait_until_async(suspension, self.settings.spawn, || async move {
                !platform.is_alive(pid) || platform.has_main_window(pid).await
            })
            .await;
            token.release();

            match outcome {
                WaitOutcome::Satisfied if self.platform.is_alive(pid) => {
                    suspension.sleep(self.settings.settle).await.inspect_err(|_| {
                        self.unclaim(pid);
                    })?;
                    info!(pid, "target launched");
                    Ok(pid)
                }
                WaitOutcome::Satisfied => {
                    self.discard(pid);
                    Err(AppError::SpawnTimeout(format!("pid {pid} exited during startup")))
                }
                WaitOutcome::TimedOut => {
                    warn!(pid, "target never showed its window; killing");
                    if let Err(err) = self.platform.kill(pid) {
                        warn!(pid, %err, "failed to kill unresponsive target");
                    }
                    self.discard(pid);
                    Err(AppError::SpawnTimeout(format!(
                        "pid {pid} showed no window within {}s",
                        self.settings.spawn.timeout.as_secs()
                    )))
                }
                WaitOutcome::Cancelled => {
                    self.unclaim(pid);
                    Err(AppError::Cancelled)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn take_free(&self) -> Option<u32> {
        let mut state = self.state();
        self.prune(&mut state);
        let pid = state.free.pop_front()?;
        state.allocated.insert(pid);
        Some(pid)
    }

    fn claim(&self, pid: u32) -> bool {
        let mut state = self.state();
        let Some(pos) = state.free.iter().position(|p| *p == pid) else {
            return false;
        };
        state.free.remove(pos);
        state.allocated.insert(pid);
        true
    }

    fn unclaim(&self, pid: u32) {
        let mut state = self.state();
        if state.allocated.remove(&pid) {
            state.free.push_back(pid);
        }
    }

    fn prune(&self, state: &mut PoolState) {
        let platform = &self.platform;
        state.free.retain(|pid| {
            let alive = platform.is_alive(*pid);
            if !alive {
                info!(pid, "pruned exited process from pool");
            }
            alive
        });
        state.spawned.retain(|pid| platform.is_alive(*pid));
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
