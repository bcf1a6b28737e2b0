//! Bot driver abstraction.
//!
//! A driver is an external control process that runs the bot payload inside
//! an attached target. Sessions only see the [`BotDriver`] and
//! [`DriverFactory`] traits; [`connection::DriverConnection`] is the native
//! implementation (process launch + duplex channel + license lease).

pub mod connection;
pub mod key_pool;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::channel::Subscription;
use crate::suspend::{PollSchedule, Suspension};
use crate::Result;

use self::key_pool::{LeaseToken, LicenseKey};

/// Lifecycle of a driver connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Helper registered; commands may be issued.
    Active,
    /// Torn down on request.
    Disposed,
    /// Torn down after a channel or process failure.
    Faulted,
}

impl ConnectionState {
    /// Whether the connection has been torn down.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// What a session asks a driver to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverRequest {
    /// Target process the driver attaches to.
    pub target_pid: u32,
    /// Combat routine (custom class) to load.
    pub combat_routine: Option<String>,
    /// Profile to load at startup.
    pub profile_path: Option<String>,
    /// Bot to select at startup.
    pub bot_name: Option<String>,
}

/// How drivers are launched and supervised.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Driver executable.
    pub executable: PathBuf,
    /// Extra arguments appended after the generated ones.
    pub args: Vec<String>,
    /// Channel names are `<prefix>-<driver pid>`.
    pub endpoint_prefix: String,
    /// Wait for the helper to register.
    pub registration: PollSchedule,
    /// Per-call response timeout.
    pub call_timeout: Duration,
    /// Grace period between a graceful close and a kill.
    pub exit_grace: Duration,
    /// How often the exit monitor checks the driver process.
    pub exit_poll: Duration,
}

impl DriverSettings {
    /// Settings with default timeouts.
    #[must_use]
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            endpoint_prefix: "fenix-driver".to_owned(),
            registration: PollSchedule::from_millis(60_000, 100),
            call_timeout: Duration::from_secs(30),
            exit_grace: Duration::from_secs(2),
            exit_poll: Duration::from_millis(500),
        }
    }

    /// Command line for one driver launch.
    #[must_use]
    pub fn launch_args(&self, key: Option<&LicenseKey>, request: &DriverRequest) -> Vec<String> {
        let mut args = vec![
            "--no-auto-update".to_owned(),
            format!("--pid={}", request.target_pid),
        ];
        if let Some(key) = key {
            args.push(format!("--key={}", key.expose()));
        }
        let optional = [
            ("--custom-class", &request.combat_routine),
            ("--load-profile", &request.profile_path),
            ("--bot-name", &request.bot_name),
        ];
        for (flag, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                args.push(format!("{flag}={value}"));
            }
        }
        args.extend(self.args.iter().cloned());
        args
    }
}

/// A running driver a session can command.
pub trait BotDriver: Send + Sync {
    /// Driver process id.
    fn pid(&self) -> u32;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Subscribe to helper events. The subscription ends when the driver is
    /// torn down.
    fn subscribe(&self) -> Subscription;

    /// Fires once the driver has been torn down, cleanly or not.
    fn terminated(&self) -> CancellationToken;

    /// Start `bot_name` with `profile_path`. `false` on any failure; a
    /// transport failure also tears the driver down.
    fn start_bot<'a>(
        &'a self,
        bot_name: &'a str,
        profile_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

    /// Stop the running bot. Same failure semantics as `start_bot`.
    fn stop_bot(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Tear down: release the lease, close the process, close the channel.
    /// Idempotent.
    fn dispose(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Creates drivers bound to a license lease and a target process.
pub trait DriverFactory: Send + Sync {
    /// Launch a driver and wait until it can take commands. The lease is
    /// returned to its pool if this fails.
    ///
    /// # Errors
    ///
    /// Launch, registration and cancellation failures.
    fn connect<'a>(
        &'a self,
        lease: LeaseToken,
        request: DriverRequest,
        suspension: &'a Suspension,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BotDriver>>> + Send + 'a>>;
}
