//! Scripted bot drivers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use fenix::channel::events::BOT_STOPPED;
use fenix::channel::{DriverEvent, EventBus, Subscription};
use fenix::driver::key_pool::LeaseToken;
use fenix::driver::{BotDriver, ConnectionState, DriverFactory, DriverRequest};
use fenix::suspend::Suspension;
use fenix::{AppError, Result};

/// Hands out [`FakeDriver`]s and records every request.
pub struct FakeDriverFactory {
    next_pid: AtomicU32,
    auto_stop: bool,
    failures: AtomicUsize,
    requests: Mutex<Vec<DriverRequest>>,
    drivers: Mutex<Vec<Arc<FakeDriver>>>,
}

impl FakeDriverFactory {
    /// With `auto_stop`, every started bot reports `OnBotStopped` at once.
    pub fn new(auto_stop: bool) -> Arc<Self> {
        Self::failing(auto_stop, 0)
    }

    /// The first `failures` connects time out waiting for registration.
    pub fn failing(auto_stop: bool, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(9000),
            auto_stop,
            failures: AtomicUsize::new(failures),
            requests: Mutex::new(Vec::new()),
            drivers: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<DriverRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn drivers(&self) -> Vec<Arc<FakeDriver>> {
        self.drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn starts(&self) -> usize {
        self.drivers().iter().map(|d| d.starts()).sum()
    }
}

impl DriverFactory for FakeDriverFactory {
    fn connect<'a>(
        &'a self,
        lease: LeaseToken,
        request: DriverRequest,
        suspension: &'a Suspension,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BotDriver>>> + Send + 'a>> {
        Box::pin(async move {
            suspension.checkpoint().await?;
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            let scripted_failure = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if scripted_failure {
                drop(lease);
                return Err(AppError::HelperRegistrationTimeout("helper never registered".into()));
            }
            let driver = Arc::new(FakeDriver::new(
                self.next_pid.fetch_add(1, Ordering::SeqCst),
                lease,
                self.auto_stop,
            ));
            self.drivers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(&driver));
            let driver: Arc<dyn BotDriver> = driver;
            Ok(driver)
        })
    }
}

/// A driver whose helper answers every call with `true`.
pub struct FakeDriver {
    pid: u32,
    auto_stop: bool,
    events: Arc<EventBus>,
    terminated: CancellationToken,
    lease: Mutex<Option<LeaseToken>>,
    state: Mutex<ConnectionState>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    disposals: AtomicUsize,
}

impl FakeDriver {
    fn new(pid: u32, lease: LeaseToken, auto_stop: bool) -> Self {
        Self {
            pid,
            auto_stop,
            events: EventBus::new(),
            terminated: CancellationToken::new(),
            lease: Mutex::new(Some(lease)),
            state: Mutex::new(ConnectionState::Active),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            disposals: AtomicUsize::new(0),
        }
    }

    /// Raise a helper event.
    pub fn publish(&self, name: &str) -> usize {
        self.events.publish(&DriverEvent::new(name, "scripted"))
    }

    /// The helper process dies.
    pub fn crash(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Faulted;
        self.terminated.cancel();
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    pub fn holds_lease(&self) -> bool {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|lease| !lease.is_disposed())
    }

    pub fn subscribers(&self) -> usize {
        self.events.subscriber_count()
    }
}

impl BotDriver for FakeDriver {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }

    fn start_bot<'a>(
        &'a self,
        _bot_name: &'a str,
        _profile_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.auto_stop {
                self.publish(BOT_STOPPED);
            }
            true
        })
    }

    fn stop_bot(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            self.stops.fetch_add(1, Ordering::SeqCst);
            true
        })
    }

    fn dispose(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Some(mut lease) = self.lease.lock().unwrap_or_else(PoisonError::into_inner).take() {
                lease.dispose();
            }
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Disposed;
            self.events.close();
            self.terminated.cancel();
            self.disposals.fetch_add(1, Ordering::SeqCst);
        })
    }
}
