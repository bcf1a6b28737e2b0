//! Session orchestration.
//!
//! A session owns an ordered task list and at most one target binding. Tasks
//! run strictly in order; a failed task is retried after the binding is
//! restored, and a task that runs out of attempts is skipped. Only
//! cancellation ends a session early.

pub mod host;
pub mod retry;
pub mod task;

use std::future::pending;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::client::{ClientSettings, Identity, TargetClient};
use crate::config::RetryConfig;
use crate::credentials::CredentialRepository;
use crate::driver::key_pool::KeyPool;
use crate::driver::{BotDriver, DriverFactory, DriverRequest};
use crate::platform::Platform;
use crate::pool::ProcessPool;
use crate::suspend::Suspension;
use crate::{AppError, Result};

use self::retry::RetryBudget;
use self::task::{GeneralRun, SessionTask, StopTrigger};

pub use self::host::{SessionHost, SessionSummary};

/// Session lifecycle. Pausing is a separate flag on a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, never started.
    Idle,
    /// Running tasks.
    Running,
    /// Every task was attempted.
    Completed,
    /// Stopped early (cancelled or no target could be bound).
    Failed,
}

impl SessionStatus {
    /// `Completed` or `Failed`.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Shared registries every session draws from.
pub struct SessionContext {
    /// Process and memory access.
    pub platform: Arc<dyn Platform>,
    /// Target processes.
    pub pool: Arc<ProcessPool>,
    /// Driver license keys.
    pub keys: KeyPool,
    /// Driver launcher.
    pub drivers: Arc<dyn DriverFactory>,
    /// Accounts.
    pub credentials: Arc<CredentialRepository>,
    /// Attach settings.
    pub client: ClientSettings,
    /// Attempt counts.
    pub retries: RetryConfig,
    /// Combat routine for runs that name none.
    pub default_combat_routine: Option<String>,
}

/// Pid of the target a session currently holds, readable from outside.
pub type BoundPid = Arc<Mutex<Option<u32>>>;

struct Binding {
    pid: u32,
    client: TargetClient,
}

/// One run of a session's task list.
pub(crate) struct SessionRun {
    name: String,
    tasks: Vec<SessionTask>,
    ctx: Arc<SessionContext>,
    suspension: Suspension,
    binding: Option<Binding>,
    bound_pid: BoundPid,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl SessionRun {
    pub(crate) fn new(
        name: String,
        tasks: Vec<SessionTask>,
        ctx: Arc<SessionContext>,
        suspension: Suspension,
        bound_pid: BoundPid,
        status: Arc<watch::Sender<SessionStatus>>,
    ) -> Self {
        Self {
            name,
            tasks,
            ctx,
            suspension,
            binding: None,
            bound_pid,
            status,
        }
    }

    /// Run every task, then release the target.
    pub(crate) async fn run(mut self) -> SessionStatus {
        let span = info_span!("session", session = %self.name);
        let status = async {
            self.status.send_replace(SessionStatus::Running);
            info!(tasks = self.tasks.len(), "session started");
            let status = self.run_tasks().await;
            self.release();
            info!(?status, "session finished");
            status
        }
        .instrument(span)
        .await;
        self.status.send_replace(status);
        status
    }

    async fn run_tasks(&mut self) -> SessionStatus {
        if self.tasks.is_empty() {
            return SessionStatus::Completed;
        }
        match self.restore_binding().await {
            Ok(()) => {}
            Err(AppError::Cancelled) => return SessionStatus::Failed,
            Err(err) => {
                error!(%err, "no target could be bound");
                return SessionStatus::Failed;
            }
        }

        let tasks = self.tasks.clone();
        for (index, task) in tasks.iter().enumerate() {
            let span = info_span!("task", index, kind = task.label());
            match self.run_with_retries(task).instrument(span).await {
                Ok(()) => {}
                Err(AppError::Cancelled) => {
                    info!(index, "session cancelled");
                    return SessionStatus::Failed;
                }
                Err(err) => error!(index, kind = task.label(), %err, "task abandoned"),
            }
        }
        SessionStatus::Completed
    }

    async fn run_with_retries(&mut self, task: &SessionTask) -> Result<()> {
        let mut retry = RetryBudget::new(task.label(), self.ctx.retries.task.saturating_add(1));
        loop {
            let attempt = retry.next(&self.suspension).await?;
            if attempt > 1 {
                match self.restore_binding().await {
                    Ok(()) => {}
                    Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                    Err(err) => {
                        retry.failed(err)?;
                        continue;
                    }
                }
            }
            match self.run_task(task).await {
                Ok(()) => {
                    info!(attempt, "task finished");
                    return Ok(());
                }
                Err(err) => retry.failed(err)?,
            }
        }
    }

    async fn run_task(&mut self, task: &SessionTask) -> Result<()> {
        match task {
            SessionTask::Login { character } => self.login(character).await,
            SessionTask::Logout => self.logout().await,
            SessionTask::GeneralRun(run) => self.general_run(run).await,
        }
    }

    // ── Tasks ───────────────────────────────────────────────────────────────

    async fn login(&mut self, character: &str) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let mut credential = ctx.credentials.for_character(character)?;
        let binding = self.binding.as_mut().ok_or_else(unbound)?;
        let suspension = &self.suspension;

        let mut retry = RetryBudget::new("enter game", ctx.retries.login);
        let outcome = loop {
            if let Err(err) = retry.next(suspension).await {
                break Err(err);
            }
            match binding.client.enter_game(&mut credential, suspension).await {
                Ok(()) => break Ok(()),
                Err(err) => {
                    if let Err(err) = retry.failed(err) {
                        break Err(err);
                    }
                }
            }
        };
        ctx.credentials.record(&credential);
        outcome
    }

    async fn logout(&mut self) -> Result<()> {
        let retries = self.ctx.retries.logout;
        let binding = self.binding.as_mut().ok_or_else(unbound)?;
        let suspension = &self.suspension;
        if !binding.client.is_in_game() {
            debug!(pid = binding.pid, "not in the world; nothing to log out");
            return Ok(());
        }

        let mut retry = RetryBudget::new("logout", retries);
        loop {
            retry.next(suspension).await?;
            match binding.client.logout(None, suspension).await {
                Ok(()) => return Ok(()),
                Err(err) => retry.failed(err)?,
            }
        }
    }

    async fn general_run(&mut self, run: &GeneralRun) -> Result<()> {
        self.login(&run.character).await?;
        let pid = self.binding.as_ref().ok_or_else(unbound)?.pid;
        let ctx = Arc::clone(&self.ctx);
        let suspension = &self.suspension;

        let request = DriverRequest {
            target_pid: pid,
            combat_routine: run
                .combat_routine
                .clone()
                .or_else(|| ctx.default_combat_routine.clone()),
            profile_path: Some(run.profile_path.clone()),
            bot_name: Some(run.bot_name.clone()),
        };

        let mut retry = RetryBudget::new("launch driver", ctx.retries.driver);
        let driver = loop {
            retry.next(suspension).await?;
            let lease = match ctx.keys.allocate() {
                Ok(lease) => lease,
                Err(err) => {
                    retry.failed(err)?;
                    continue;
                }
            };
            match ctx.drivers.connect(lease, request.clone(), suspension).await {
                Ok(driver) => break driver,
                Err(err) => retry.failed(err)?,
            }
        };

        let span = info_span!("driver", driver_pid = driver.pid(), pid);
        let outcome = supervise(driver.as_ref(), run, suspension).instrument(span.clone()).await;
        // cancelled runs too: the exit monitor keeps the connection alive otherwise
        driver.dispose().instrument(span).await;
        outcome
    }

    // ── Binding ─────────────────────────────────────────────────────────────

    /// Make sure the session holds a live, attached target. A dead target
    /// is dropped and a new one allocated; a live one is re-attached.
    async fn restore_binding(&mut self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let previous = self.binding.take().map(|binding| binding.pid);
        let kept = match previous {
            Some(pid) if ctx.platform.is_alive(pid) => Some(pid),
            Some(pid) => {
                warn!(pid, "bound target exited");
                ctx.pool.discard(pid);
                self.set_bound(None);
                None
            }
            None => None,
        };

        let pid = match kept {
            Some(pid) => pid,
            None => {
                let pid = self.allocate().await?;
                self.set_bound(Some(pid));
                pid
            }
        };

        let mut retry = RetryBudget::new("attach target", ctx.retries.attach);
        let attached = loop {
            if let Err(err) = retry.next(&self.suspension).await {
                break Err(err);
            }
            match TargetClient::attach(pid, ctx.platform.as_ref(), &ctx.client, &self.suspension).await {
                Ok(client) => break Ok(client),
                Err(err) => {
                    if let Err(err) = retry.failed(err) {
                        break Err(err);
                    }
                }
            }
        };

        match attached {
            Ok(client) => {
                info!(pid, "target bound");
                self.binding = Some(Binding { pid, client });
                Ok(())
            }
            Err(AppError::Cancelled) => {
                // keep the claim; release() hands it back
                Err(AppError::Cancelled)
            }
            Err(err) => {
                warn!(pid, %err, "giving up on target");
                self.release();
                Err(err)
            }
        }
    }

    async fn allocate(&self) -> Result<u32> {
        let ctx = &self.ctx;
        let preferred = self
            .tasks
            .iter()
            .find_map(SessionTask::character)
            .and_then(Identity::parse);

        let mut retry = RetryBudget::new("allocate target", ctx.retries.allocate);
        loop {
            retry.next(&self.suspension).await?;
            let allocated = match &preferred {
                Some(identity) => {
                    ctx.pool
                        .allocate_matching(identity, &self.name, &ctx.client, &self.suspension)
                        .await
                }
                None => ctx.pool.allocate(&self.name, &self.suspension).await,
            };
            match allocated {
                Ok(pid) => return Ok(pid),
                Err(err) => retry.failed(err)?,
            }
        }
    }

    fn release(&mut self) {
        self.binding = None;
        let Some(pid) = self.set_bound(None) else {
            return;
        };
        if let Err(err) = self.ctx.pool.free(pid) {
            debug!(pid, %err, "bound target not returned to pool");
        }
    }

    fn set_bound(&self, pid: Option<u32>) -> Option<u32> {
        let mut bound = self.bound_pid.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *bound, pid)
    }
}

/// Start the bot once and wait for the run to end.
async fn supervise(driver: &dyn BotDriver, run: &GeneralRun, suspension: &Suspension) -> Result<()> {
    let mut events = driver.subscribe();
    let terminated = driver.terminated();
    if !driver.start_bot(&run.bot_name, &run.profile_path).await {
        return Err(AppError::Channel(format!("driver refused to start {}", run.bot_name)));
    }
    info!(bot = %run.bot_name, profile = %run.profile_path, "bot started");

    let deadline = match run.stop {
        StopTrigger::Timeout => run.timeout_seconds.map(Duration::from_secs),
        StopTrigger::BotStopped => None,
    };
    let timer = async {
        match deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => pending::<()>().await,
        }
    };
    tokio::pin!(timer);

    loop {
        tokio::select! {
            biased;
            () = suspension.cancel_token().cancelled() => return Err(AppError::Cancelled),
            () = terminated.cancelled() => {
                return Err(AppError::Channel("driver connection ended during the run".into()));
            }
            () = &mut timer => {
                info!("run time elapsed; stopping bot");
                if !driver.stop_bot().await {
                    warn!("driver did not acknowledge stopBot");
                }
                return Ok(());
            }
            event = events.recv() => match event {
                None => return Err(AppError::Channel("driver event stream closed".into())),
                Some(event) if event.is_shutdown_requested() => {
                    warn!(data = %event.data, "driver requested shutdown");
                    return Err(AppError::Channel("driver requested shutdown".into()));
                }
                Some(event) if event.is_bot_stopped() && run.stop == StopTrigger::BotStopped => {
                    info!("bot stopped");
                    return Ok(());
                }
                Some(event) => debug!(event = %event.name, data = %event.data, "driver event"),
            },
        }
    }
}

fn unbound() -> AppError {
    AppError::StaleHandle("session has no bound target".into())
}
