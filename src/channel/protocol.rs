//! Wire envelope and inbound message classification.
//!
//! Every line is one JSON object:
//!
//! ```json
//! {"id": "h-1", "method": "register"}
//! {"id": "h-1", "result": true}
//! {"method": "notifyEvent", "params": {"name": "OnBotStopped", "data": ""}}
//! {"id": "o-3", "method": "startBot", "params": {"botName": "Grind Bot", "profilePath": "p.xml"}}
//! {"id": "o-3", "error": "bot not found"}
//! ```
//!
//! A message with `method` is a request (or a notification when `id` is
//! absent); one with `result` or `error` and no `method` is a response.
//!
//! | Inbound method | Maps to                     |
//! |----------------|-----------------------------|
//! | `register`     | [`Inbound::Register`]       |
//! | `notifyEvent`  | [`Inbound::Event`]          |
//! | *(any other)*  | [`Inbound::Unknown`]        |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::events::DriverEvent;
use crate::{AppError, Result};

/// Helper → host: announce readiness.
pub const REGISTER: &str = "register";
/// Helper → host: raise a named event.
pub const NOTIFY_EVENT: &str = "notifyEvent";
/// Host → helper: start a bot with a profile.
pub const START_BOT: &str = "startBot";
/// Host → helper: stop the running bot.
pub const STOP_BOT: &str = "stopBot";

/// One wire message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id; absent on notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Request method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Successful response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failed response message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// A request expecting a response.
    #[must_use]
    pub fn request(id: impl Into<String>, method: &str, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.to_owned()),
            params,
            ..Self::default()
        }
    }

    /// A successful response.
    #[must_use]
    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            result: Some(result),
            ..Self::default()
        }
    }

    /// A failed response.
    #[must_use]
    pub fn error_response(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Serialise to one line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// [`AppError::Channel`] if serialisation fails.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parameters of `notifyEvent`.
#[derive(Debug, Deserialize)]
struct EventParams {
    name: String,
    #[serde(default)]
    data: Value,
}

/// Parameters of `startBot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBotParams {
    /// Bot to select in the driver.
    pub bot_name: String,
    /// Profile to load.
    pub profile_path: String,
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Helper registration request.
    Register {
        /// Request id to answer.
        id: Option<String>,
    },
    /// Helper event.
    Event {
        /// Request id to acknowledge, if the helper wants an answer.
        id: Option<String>,
        /// The event.
        event: DriverEvent,
    },
    /// Response to one of our requests.
    Response {
        /// Correlation id.
        id: String,
        /// Payload or error message.
        outcome: std::result::Result<Value, String>,
    },
    /// Request with a method we do not serve.
    Unknown {
        /// Request id to reject.
        id: Option<String>,
        /// Method name.
        method: String,
    },
}

/// Classify one line.
///
/// Returns `Ok(None)` for blank lines and for responses without an id.
///
/// # Errors
///
/// - [`AppError::Channel`]`("malformed json: …")` for invalid JSON.
/// - [`AppError::Channel`]`("missing required field: …")` for a
///   `notifyEvent` without a usable `name`.
pub fn parse_line(line: &str) -> Result<Option<Inbound>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let envelope: Envelope = serde_json::from_str(line)?;

    let Some(method) = envelope.method else {
        let Some(id) = envelope.id else {
            debug!("channel: dropping response without id");
            return Ok(None);
        };
        let outcome = match (envelope.result, envelope.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        };
        return Ok(Some(Inbound::Response { id, outcome }));
    };

    Ok(Some(match method.as_str() {
        REGISTER => Inbound::Register { id: envelope.id },
        NOTIFY_EVENT => {
            let params: EventParams =
                serde_json::from_value(envelope.params.unwrap_or(Value::Null)).map_err(|e| {
                    AppError::Channel(format!("missing required field: notifyEvent params: {e}"))
                })?;
            let data = match params.data {
                Value::Null => String::new(),
                Value::String(s) => s,
                other => other.to_string(),
            };
            Inbound::Event {
                id: envelope.id,
                event: DriverEvent::new(params.name, data),
            }
        }
        _ => Inbound::Unknown {
            id: envelope.id,
            method,
        },
    }))
}
