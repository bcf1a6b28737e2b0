//! Registry of named sessions sharing one set of resources.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::suspend::{PauseSource, Suspension};
use crate::{AppError, Result};

use super::task::SessionTask;
use super::{BoundPid, SessionContext, SessionRun, SessionStatus};

/// Operator view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Session name.
    pub name: String,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Pause flag.
    pub paused: bool,
    /// Number of queued tasks.
    pub tasks: usize,
    /// Target currently bound, if any.
    pub target_pid: Option<u32>,
    /// Last time the session was started.
    pub started_at: Option<DateTime<Utc>>,
}

struct SessionEntry {
    tasks: Vec<SessionTask>,
    pause: PauseSource,
    cancel: CancellationToken,
    bound_pid: BoundPid,
    status: Arc<watch::Sender<SessionStatus>>,
    handle: Option<JoinHandle<()>>,
    started_at: Option<DateTime<Utc>>,
}

impl SessionEntry {
    fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    fn bound_pid(&self) -> Option<u32> {
        *self.bound_pid.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns every session and the registries they share.
pub struct SessionHost {
    ctx: Arc<SessionContext>,
    sessions: Mutex<BTreeMap<String, SessionEntry>>,
    shutdown: CancellationToken,
}

impl SessionHost {
    /// Host over the given registries.
    #[must_use]
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            sessions: Mutex::new(BTreeMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Shared registries.
    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Register an idle session.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidArgument`] for an empty or duplicate name.
    pub fn create(&self, name: &str, tasks: Vec<SessionTask>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(AppError::InvalidArgument("session name must not be empty".into()));
        }
        let mut sessions = self.lock();
        if sessions.contains_key(name) {
            return Err(AppError::InvalidArgument(format!("session {name} already exists")));
        }
        let (status, _) = watch::channel(SessionStatus::Idle);
        sessions.insert(
            name.to_owned(),
            SessionEntry {
                tasks,
                pause: PauseSource::new(),
                cancel: CancellationToken::new(),
                bound_pid: Arc::new(Mutex::new(None)),
                status: Arc::new(status),
                handle: None,
                started_at: None,
            },
        );
        info!(session = name, "session created");
        Ok(())
    }

    /// Forget a session that is not running.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotFound`] for an unknown name;
    /// - [`AppError::InvalidArgument`] while it is running.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut sessions = self.lock();
        let entry = sessions.get(name).ok_or_else(|| missing(name))?;
        if entry.status() == SessionStatus::Running {
            return Err(AppError::InvalidArgument(format!("session {name} is running")));
        }
        sessions.remove(name);
        info!(session = name, "session removed");
        Ok(())
    }

    /// Start (or restart) a session. Returns `false` if it was already
    /// running.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotFound`] for an unknown name;
    /// - [`AppError::InvalidArgument`] once the host is shutting down.
    pub fn start(&self, name: &str) -> Result<bool> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::InvalidArgument("host is shutting down".into()));
        }
        let mut sessions = self.lock();
        let entry = sessions.get_mut(name).ok_or_else(|| missing(name))?;
        if entry.status() == SessionStatus::Running {
            return Ok(false);
        }

        entry.cancel = self.shutdown.child_token();
        entry.started_at = Some(Utc::now());
        entry.status.send_replace(SessionStatus::Running);
        let run = SessionRun::new(
            name.to_owned(),
            entry.tasks.clone(),
            Arc::clone(&self.ctx),
            Suspension::new(entry.cancel.clone(), entry.pause.token()),
            Arc::clone(&entry.bound_pid),
            Arc::clone(&entry.status),
        );
        entry.handle = Some(tokio::spawn(async move {
            run.run().await;
        }));
        Ok(true)
    }

    /// Raise the session's pause flag.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] for an unknown name.
    pub fn pause(&self, name: &str) -> Result<()> {
        self.with_entry(name, |entry| entry.pause.pause())?;
        info!(session = name, "session paused");
        Ok(())
    }

    /// Clear the session's pause flag.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] for an unknown name.
    pub fn resume(&self, name: &str) -> Result<()> {
        self.with_entry(name, |entry| entry.pause.resume())?;
        info!(session = name, "session resumed");
        Ok(())
    }

    /// Resume and cancel the session; its current wait returns and no
    /// further task starts.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] for an unknown name.
    pub fn stop(&self, name: &str) -> Result<()> {
        self.with_entry(name, |entry| {
            entry.pause.resume();
            entry.cancel.cancel();
        })?;
        info!(session = name, "session stop requested");
        Ok(())
    }

    /// Stop the session and kill the target it holds.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] for an unknown name.
    pub fn kill(&self, name: &str) -> Result<()> {
        self.stop(name)?;
        let pid = self.with_entry(name, |entry| {
            entry.bound_pid.lock().unwrap_or_else(PoisonError::into_inner).take()
        })?;
        if let Some(pid) = pid {
            if let Err(err) = self.ctx.platform.kill(pid) {
                warn!(session = name, pid, %err, "failed to kill bound target");
            }
            self.ctx.pool.discard(pid);
            info!(session = name, pid, "bound target killed");
        }
        Ok(())
    }

    /// Every session, by name.
    #[must_use]
    pub fn list(&self) -> Vec<SessionSummary> {
        self.lock()
            .iter()
            .map(|(name, entry)| SessionSummary {
                name: name.clone(),
                status: entry.status(),
                paused: entry.pause.is_paused(),
                tasks: entry.tasks.len(),
                target_pid: entry.bound_pid(),
                started_at: entry.started_at,
            })
            .collect()
    }

    /// Wait for a started session to finish. An idle session returns at
    /// once.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] for an unknown name.
    pub async fn wait(&self, name: &str) -> Result<SessionStatus> {
        let mut rx = self.with_entry(name, |entry| entry.status.subscribe())?;
        let current = *rx.borrow_and_update();
        if current == SessionStatus::Idle || current.is_finished() {
            return Ok(current);
        }
        rx.wait_for(|status| status.is_finished())
            .await
            .map(|status| *status)
            .map_err(|_| missing(name))
    }

    /// Wait until no session is running. Sessions started while waiting
    /// are waited for too.
    pub async fn wait_all(&self) {
        loop {
            let running: Vec<String> = self
                .list()
                .into_iter()
                .filter(|summary| summary.status == SessionStatus::Running)
                .map(|summary| summary.name)
                .collect();
            if running.is_empty() {
                return;
            }
            for name in running {
                // a session removed meanwhile has nothing left to wait for
                let _ = self.wait(&name).await;
            }
        }
    }

    /// Cancel every session, wait for them to unwind, then kill the
    /// targets the pool launched.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut sessions = self.lock();
            sessions
                .iter_mut()
                .filter_map(|(name, entry)| {
                    entry.pause.resume();
                    entry.handle.take().map(|handle| (name.clone(), handle))
                })
                .collect()
        };
        for (name, handle) in handles {
            if let Err(err) = handle.await {
                warn!(session = %name, %err, "session task ended abnormally");
            }
        }
        self.ctx.pool.dispose();
        info!("session host shut down");
    }

    fn with_entry<T>(&self, name: &str, f: impl FnOnce(&mut SessionEntry) -> T) -> Result<T> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(name).ok_or_else(|| missing(name))?;
        Ok(f(entry))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn missing(name: &str) -> AppError {
    AppError::NotFound(format!("no session named {name}"))
}
