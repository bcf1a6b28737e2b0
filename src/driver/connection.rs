//! Native driver connection: one driver process, its channel, and the
//! license lease it consumed.
//!
//! The connection ends in exactly one terminal state. [`Disposed`] follows
//! an explicit [`dispose`](BotDriver::dispose); [`Faulted`] follows a failed
//! call, a helper disconnect, or the driver process exiting (seen by the exit
//! monitor). Either way the teardown runs once, and each of its steps runs
//! even if an earlier one failed:
//!
//! 1. return the license lease;
//! 2. ask the driver to close;
//! 3. wait up to the exit grace period;
//! 4. kill it if it is still running;
//! 5. close the channel, ending every event subscription.
//!
//! [`Disposed`]: ConnectionState::Disposed
//! [`Faulted`]: ConnectionState::Faulted

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::key_pool::LeaseToken;
use super::{BotDriver, ConnectionState, DriverFactory, DriverRequest, DriverSettings};
use crate::channel::{endpoint_name, DuplexChannel, Subscription};
use crate::platform::{LaunchSpec, Platform};
use crate::suspend::{wait_until, PollSchedule, Suspension};
use crate::Result;

/// A launched, registered driver.
pub struct DriverConnection {
    pid: u32,
    platform: Arc<dyn Platform>,
    channel: DuplexChannel,
    lease: Mutex<Option<LeaseToken>>,
    state: Mutex<ConnectionState>,
    terminated: CancellationToken,
    exit_grace: Duration,
}

impl DriverConnection {
    /// Launch the driver for `request`, host its channel and wait for the
    /// helper to register. On any failure the half-built connection is torn
    /// down (which returns the lease) before the error is reported.
    ///
    /// # Errors
    ///
    /// - launch failures from the platform;
    /// - [`AppError::Channel`](crate::AppError::Channel) if the channel cannot be hosted;
    /// - [`AppError::HelperRegistrationTimeout`](crate::AppError::HelperRegistrationTimeout);
    /// - [`AppError::Cancelled`](crate::AppError::Cancelled).
    pub async fn launch(
        platform: Arc<dyn Platform>,
        settings: &DriverSettings,
        lease: LeaseToken,
        request: DriverRequest,
        suspension: &Suspension,
    ) -> Result<Arc<Self>> {
        let args = settings.launch_args(Some(lease.key()?), &request);
        let spec = LaunchSpec::new(settings.executable.clone(), args);
        let pid = platform.launch(&spec)?;
        info!(pid, target_pid = request.target_pid, "driver launched");

        let name = endpoint_name(&settings.endpoint_prefix, pid);
        let channel = match DuplexChannel::host(&name, settings.call_timeout) {
            Ok(channel) => channel,
            Err(err) => {
                drop(lease);
                stop_process(platform.as_ref(), pid, settings.exit_grace).await;
                return Err(err);
            }
        };

        let connection = Arc::new(Self {
            pid,
            platform,
            channel,
            lease: Mutex::new(Some(lease)),
            state: Mutex::new(ConnectionState::Active),
            terminated: CancellationToken::new(),
            exit_grace: settings.exit_grace,
        });

        if let Err(err) = connection
            .channel
            .wait_for_registration(settings.registration, suspension)
            .await
        {
            connection
                .teardown(ConnectionState::Faulted, "helper did not register")
                .await;
            return Err(err);
        }

        spawn_exit_monitor(Arc::clone(&connection), settings.exit_poll);
        Ok(connection)
    }

    /// The channel to the helper.
    #[must_use]
    pub fn channel(&self) -> &DuplexChannel {
        &self.channel
    }

    async fn teardown(&self, final_state: ConnectionState, reason: &str) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_terminal() {
                return;
            }
            *state = final_state;
        }
        info!(pid = self.pid, state = ?final_state, reason, "tearing down driver connection");

        let lease = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut lease) = lease {
            lease.dispose();
        }

        stop_process(self.platform.as_ref(), self.pid, self.exit_grace).await;
        self.channel.close();
        self.terminated.cancel();
    }
}

impl BotDriver for DriverConnection {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> Subscription {
        self.channel.subscribe()
    }

    fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }

    fn start_bot<'a>(
        &'a self,
        bot_name: &'a str,
        profile_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match self.channel.start_bot(bot_name, profile_path).await {
                Ok(started) => {
                    info!(pid = self.pid, bot_name, profile_path, started, "startBot answered");
                    started
                }
                Err(err) => {
                    warn!(pid = self.pid, %err, "startBot failed");
                    self.teardown(ConnectionState::Faulted, "startBot failed").await;
                    false
                }
            }
        })
    }

    fn stop_bot(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            match self.channel.stop_bot().await {
                Ok(stopped) => stopped,
                Err(err) => {
                    warn!(pid = self.pid, %err, "stopBot failed");
                    self.teardown(ConnectionState::Faulted, "stopBot failed").await;
                    false
                }
            }
        })
    }

    fn dispose(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.teardown(ConnectionState::Disposed, "disposed"))
    }
}

/// Watch the driver process and the channel; either going away faults the
/// connection.
fn spawn_exit_monitor(connection: Arc<DriverConnection>, poll: Duration) -> JoinHandle<()> {
    let span = info_span!("driver_monitor", pid = connection.pid);
    tokio::spawn(
        async move {
            let torn_down = connection.channel.torn_down();
            loop {
                tokio::select! {
                    () = connection.terminated.cancelled() => break,
                    () = torn_down.cancelled() => {
                        connection
                            .teardown(ConnectionState::Faulted, "helper disconnected")
                            .await;
                        break;
                    }
                    () = tokio::time::sleep(poll) => {
                        if !connection.platform.is_alive(connection.pid) {
                            connection
                                .teardown(ConnectionState::Faulted, "driver process exited")
                                .await;
                            break;
                        }
                    }
                }
            }
        }
        .instrument(span),
    )
}

/// Graceful close, bounded wait, then kill.
async fn stop_process(platform: &dyn Platform, pid: u32, grace: Duration) {
    if !platform.is_alive(pid) {
        return;
    }
    if let Err(err) = platform.close_main_window(pid) {
        warn!(pid, %err, "graceful close failed");
    }
    let exited = wait_until(
        &Suspension::none(),
        PollSchedule::new(grace, Duration::from_millis(100)),
        || !platform.is_alive(pid),
    )
    .await;
    if !exited.is_satisfied() {
        warn!(pid, "driver did not exit in time; killing");
        if let Err(err) = platform.kill(pid) {
            warn!(pid, %err, "failed to kill driver");
        }
    }
}

/// Launches [`DriverConnection`]s through a [`Platform`].
pub struct NativeDriverFactory {
    platform: Arc<dyn Platform>,
    settings: DriverSettings,
}

impl NativeDriverFactory {
    /// Factory launching with `settings`.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, settings: DriverSettings) -> Self {
        Self { platform, settings }
    }
}

impl DriverFactory for NativeDriverFactory {
    fn connect<'a>(
        &'a self,
        lease: LeaseToken,
        request: DriverRequest,
        suspension: &'a Suspension,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BotDriver>>> + Send + 'a>> {
        Box::pin(async move {
            let connection = DriverConnection::launch(
                Arc::clone(&self.platform),
                &self.settings,
                lease,
                request,
                suspension,
            )
            .await?;
            Ok(connection as Arc<dyn BotDriver>)
        })
    }
}
