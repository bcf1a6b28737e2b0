//! Local IPC server for `fenix-ctl` commands.
//!
//! One local socket (a named pipe on Windows) carries newline-framed JSON.
//! Every line is a command addressed to the [`SessionHost`]; every command
//! gets exactly one reply line.
//!
//! ## Wire format
//!
//! Commands:
//! ```json
//! {"command": "list"}
//! {"command": "start", "session": "farm"}
//! {"command": "pause", "session": "farm", "auth_token": "..."}
//! ```
//!
//! Replies:
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: no session named farm"}
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::session::SessionHost;
use crate::{AppError, Result};

/// What the server needs to answer commands.
pub struct IpcState {
    /// Sessions being controlled.
    pub host: Arc<SessionHost>,
    /// Shared secret every request must carry, when set.
    pub auth_token: Option<String>,
}

/// Inbound IPC request from `fenix-ctl`.
#[derive(Debug, Deserialize)]
struct IpcRequest {
    /// Command verb.
    command: String,
    /// Session name (for every verb but `list`).
    session: Option<String>,
    /// Must equal [`IpcState::auth_token`] when one is configured.
    auth_token: Option<String>,
}

/// Outbound IPC response to `fenix-ctl`.
#[derive(Debug, Serialize)]
struct IpcResponse {
    /// `false` when `error` is set.
    ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    /// Rendered [`AppError`] or protocol complaint.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    name: &str,
    state: Arc<IpcState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = name.to_owned();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    state: Arc<IpcState>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &state).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route an IPC command to the session host.
async fn dispatch_command(request: &IpcRequest, state: &Arc<IpcState>) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async {
        if let Some(ref expected) = state.auth_token {
            match request.auth_token {
                Some(ref provided) if provided == expected => {}
                _ => {
                    warn!(command = %request.command, "IPC request rejected: invalid auth token");
                    return IpcResponse::error("unauthorized");
                }
            }
        }

        match request.command.as_str() {
            "list" => handle_list(state),
            "start" | "pause" | "resume" | "stop" | "kill" => handle_control(request, state),
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

/// List every session.
fn handle_list(state: &IpcState) -> IpcResponse {
    match serde_json::to_value(state.host.list()) {
        Ok(sessions) => IpcResponse::success(serde_json::json!({ "sessions": sessions })),
        Err(err) => IpcResponse::error(format!("failed to list sessions: {err}")),
    }
}

/// Apply a lifecycle verb to one session.
fn handle_control(request: &IpcRequest, state: &IpcState) -> IpcResponse {
    let Some(ref name) = request.session else {
        return IpcResponse::error("missing required 'session' field");
    };
    let host = &state.host;
    let outcome = match request.command.as_str() {
        "start" => host.start(name).map(|started| serde_json::json!({ "started": started })),
        "pause" => host.pause(name).map(|()| serde_json::json!({ "paused": true })),
        "resume" => host.resume(name).map(|()| serde_json::json!({ "paused": false })),
        "stop" => host.stop(name).map(|()| serde_json::json!({ "stopping": true })),
        "kill" => host.kill(name).map(|()| serde_json::json!({ "killed": true })),
        other => Err(AppError::InvalidArgument(format!("unknown command: {other}"))),
    };
    match outcome {
        Ok(mut data) => {
            info!(session = %name, command = %request.command, "session command applied");
            if let Some(fields) = data.as_object_mut() {
                fields.insert("session".into(), serde_json::Value::String(name.clone()));
            }
            IpcResponse::success(data)
        }
        Err(err) => IpcResponse::error(err.to_string()),
    }
}

/// File the per-run auth token is published to for `fenix-ctl`.
#[must_use]
pub fn token_path(ipc_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{ipc_name}.token"))
}

/// Write the auth token where `fenix-ctl` looks for it, readable by the
/// current user only.
///
/// # Errors
///
/// Returns `AppError::Io` if the file cannot be written.
pub fn publish_token(ipc_name: &str, token: &str) -> Result<PathBuf> {
    let path = token_path(ipc_name);
    std::fs::write(&path, token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(path)
}
