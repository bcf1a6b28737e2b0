//! Host side of the duplex channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::FrameCodec;
use super::events::{EventBus, Subscription};
use super::protocol::{parse_line, Envelope, Inbound, StartBotParams, START_BOT, STOP_BOT};
use crate::suspend::{wait_until, PollSchedule, Suspension, WaitOutcome};
use crate::{AppError, Result};

type Pending = HashMap<String, oneshot::Sender<std::result::Result<Value, String>>>;

/// Local-socket name of the channel for driver process `pid`.
#[must_use]
pub fn endpoint_name(prefix: &str, pid: u32) -> String {
    format!("{prefix}-{pid}")
}

struct Shared {
    events: Arc<EventBus>,
    registered: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    torn_down: CancellationToken,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: EventBus::new(),
            registered: AtomicBool::new(false),
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            torn_down: CancellationToken::new(),
        })
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every in-flight call and stop accepting new ones.
    fn tear_down(&self, reason: &str) {
        if self.torn_down.is_cancelled() {
            return;
        }
        info!(reason, "channel torn down");
        self.torn_down.cancel();
        self.outbound().take();
        // Dropping the senders wakes every waiting caller with an error.
        self.pending().clear();
    }
}

/// Bidirectional request/response bridge to one driver-side helper.
///
/// Dropping the channel closes it.
pub struct DuplexChannel {
    name: String,
    shared: Arc<Shared>,
    call_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("name", &self.name)
            .field("registered", &self.is_registered())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl DuplexChannel {
    /// Listen on local socket `name` and serve every helper that connects.
    ///
    /// # Errors
    ///
    /// [`AppError::Channel`] if the name is invalid or cannot be bound.
    pub fn host(name: &str, call_timeout: Duration) -> Result<Self> {
        let listener_name = name
            .to_owned()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::Channel(format!("invalid channel name '{name}': {err}")))?;
        let listener = ListenerOptions::new()
            .name(listener_name)
            .create_tokio()
            .map_err(|err| AppError::Channel(format!("failed to host channel '{name}': {err}")))?;

        info!(channel = name, "channel hosted");
        let channel = Self::unbound(name, call_timeout);
        let shared = Arc::clone(&channel.shared);
        let span = info_span!("channel_accept", channel = name);

        let accept = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = shared.torn_down.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok(stream) => {
                                tokio::spawn(
                                    serve_connection(stream, Arc::clone(&shared))
                                        .instrument(info_span!("channel_conn")),
                                );
                            }
                            Err(err) => warn!(%err, "channel accept failed"),
                        }
                    }
                }
                debug!("channel listener stopped");
            }
            .instrument(span),
        );
        channel.track(accept);
        Ok(channel)
    }

    /// Serve a single already-connected stream (used for in-process pipes).
    #[must_use]
    pub fn over_stream<S>(name: &str, stream: S, call_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel = Self::unbound(name, call_timeout);
        let shared = Arc::clone(&channel.shared);
        let handle = tokio::spawn(
            serve_connection(stream, shared).instrument(info_span!("channel_conn", channel = name)),
        );
        channel.track(handle);
        channel
    }

    /// Socket name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the helper has called `register`.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::SeqCst)
    }

    /// Whether the channel has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.torn_down.is_cancelled()
    }

    /// Token that fires when the channel is torn down (helper disconnect or
    /// [`close`](Self::close)).
    #[must_use]
    pub fn torn_down(&self) -> CancellationToken {
        self.shared.torn_down.clone()
    }

    /// Wait until the helper registers.
    ///
    /// # Errors
    ///
    /// - [`AppError::HelperRegistrationTimeout`] when the schedule runs out.
    /// - [`AppError::Channel`] if the channel closes first.
    /// - [`AppError::Cancelled`] when the suspension fires.
    pub async fn wait_for_registration(
        &self,
        schedule: PollSchedule,
        suspension: &Suspension,
    ) -> Result<()> {
        let outcome = wait_until(suspension, schedule, || {
            self.is_registered() || self.is_closed()
        })
        .await;
        match outcome {
            WaitOutcome::Satisfied if self.is_registered() => Ok(()),
            WaitOutcome::Satisfied => Err(AppError::Channel(format!(
                "channel '{}' closed before the helper registered",
                self.name
            ))),
            WaitOutcome::TimedOut => Err(AppError::HelperRegistrationTimeout(format!(
                "no helper registered on '{}' within {}s",
                self.name,
                schedule.timeout.as_secs()
            ))),
            WaitOutcome::Cancelled => Err(AppError::Cancelled),
        }
    }

    /// Subscribe to helper events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.shared.events.subscribe()
    }

    /// The subscriber list events are published on.
    #[must_use]
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.shared.events)
    }

    /// Ask the helper to start `bot_name` with `profile_path`.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call), plus [`AppError::Channel`] for a non-boolean
    /// reply.
    pub async fn start_bot(&self, bot_name: &str, profile_path: &str) -> Result<bool> {
        let params = serde_json::to_value(StartBotParams {
            bot_name: bot_name.to_owned(),
            profile_path: profile_path.to_owned(),
        })?;
        let reply = self.call(START_BOT, Some(params)).await?;
        expect_bool(START_BOT, &reply)
    }

    /// Ask the helper to stop the running bot.
    ///
    /// # Errors
    ///
    /// As [`start_bot`](Self::start_bot).
    pub async fn stop_bot(&self) -> Result<bool> {
        let reply = self.call(STOP_BOT, None).await?;
        expect_bool(STOP_BOT, &reply)
    }

    /// Issue a request to the registered helper and await its response.
    ///
    /// # Errors
    ///
    /// [`AppError::Channel`] if the helper has not registered, the channel is
    /// torn down (before or during the call), the call times out, or the
    /// helper answers with an error.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(AppError::Channel(format!("{method}: channel is torn down")));
        }
        if !self.is_registered() {
            return Err(AppError::Channel(format!("{method}: helper has not registered")));
        }
        let sender = self
            .shared
            .outbound()
            .clone()
            .ok_or_else(|| AppError::Channel(format!("{method}: no helper connection")))?;

        let id = format!("o-{}", self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id.clone(), tx);

        let line = Envelope::request(id.clone(), method, params).to_line()?;
        if sender.send(line).is_err() {
            self.shared.pending().remove(&id);
            return Err(AppError::Channel(format!("{method}: helper connection closed")));
        }
        debug!(id, method, "request sent");

        let torn_down = self.shared.torn_down.clone();
        tokio::select! {
            biased;
            () = torn_down.cancelled() => {
                Err(AppError::Channel(format!("{method}: channel torn down while waiting")))
            }
            reply = tokio::time::timeout(self.call_timeout, rx) => match reply {
                Err(_) => {
                    self.shared.pending().remove(&id);
                    Err(AppError::Channel(format!(
                        "{method}: no response within {}s",
                        self.call_timeout.as_secs()
                    )))
                }
                Ok(Err(_)) => Err(AppError::Channel(format!("{method}: call abandoned"))),
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(message))) => {
                    Err(AppError::Channel(format!("{method} failed: {message}")))
                }
            }
        }
    }

    /// Tear the channel down: fail in-flight calls, end subscriptions and
    /// stop serving. Idempotent.
    pub fn close(&self) {
        self.shared.tear_down("closed by host");
        self.shared.events.close();
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }

    fn unbound(name: &str, call_timeout: Duration) -> Self {
        Self {
            name: name.to_owned(),
            shared: Shared::new(),
            call_timeout,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn expect_bool(method: &str, reply: &Value) -> Result<bool> {
    reply
        .as_bool()
        .ok_or_else(|| AppError::Channel(format!("{method}: expected boolean reply, got {reply}")))
}

// ── Connection loop ───────────────────────────────────────────────────────────

/// Read and dispatch inbound lines until EOF, an I/O error or teardown.
async fn serve_connection<S>(stream: S, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(run_writer(write, rx, shared.torn_down.clone()));

    let mut framed = FramedRead::new(read, FrameCodec::new());
    let mut registered_here = false;

    loop {
        tokio::select! {
            biased;

            () = shared.torn_down.cancelled() => break,

            item = framed.next() => match item {
                None => {
                    debug!("helper closed the connection");
                    break;
                }
                Some(Err(AppError::Channel(msg))) => {
                    warn!(error = msg.as_str(), "channel framing error, skipping");
                }
                Some(Err(err)) => {
                    warn!(%err, "channel read failed");
                    break;
                }
                Some(Ok(line)) => match parse_line(&line) {
                    Ok(Some(inbound)) => {
                        if matches!(inbound, Inbound::Register { .. }) {
                            registered_here = true;
                        }
                        dispatch(inbound, &shared, &tx);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(%err, raw_line = %line, "channel parse error, skipping line"),
                },
            }
        }
    }

    if registered_here {
        shared.tear_down("helper disconnected");
    }
    drop(tx);
    let _ = writer.await;
}

fn dispatch(inbound: Inbound, shared: &Shared, tx: &mpsc::UnboundedSender<String>) {
    match inbound {
        Inbound::Register { id } => {
            *shared.outbound() = Some(tx.clone());
            shared.registered.store(true, Ordering::SeqCst);
            info!("helper registered");
            if let Some(id) = id {
                reply(tx, &Envelope::response(id, Value::Bool(true)));
            }
        }
        Inbound::Event { id, event } => {
            shared.events.publish(&event);
            if let Some(id) = id {
                reply(tx, &Envelope::response(id, Value::Bool(true)));
            }
        }
        Inbound::Response { id, outcome } => match shared.pending().remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => debug!(id, "response for unknown request"),
        },
        Inbound::Unknown { id, method } => {
            debug!(method, "unknown inbound method");
            if let Some(id) = id {
                reply(tx, &Envelope::error_response(id, format!("unknown method '{method}'")));
            }
        }
    }
}

fn reply(tx: &mpsc::UnboundedSender<String>, envelope: &Envelope) {
    match envelope.to_line() {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(err) => warn!(%err, "failed to encode reply"),
    }
}

/// Write queued lines to the helper until the queue closes or teardown.
async fn run_writer<W>(mut write: W, mut rx: mpsc::UnboundedReceiver<String>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            line = rx.recv() => {
                let Some(mut line) = line else { break };
                line.push('\n');
                if let Err(err) = write.write_all(line.as_bytes()).await {
                    warn!(%err, "channel write failed");
                    break;
                }
                if let Err(err) = write.flush().await {
                    warn!(%err, "channel flush failed");
                    break;
                }
            }
        }
    }
}
