//! Screen and login-outcome enumerations decoded from the target.

use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Value of the client's glue (out-of-game UI) state variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GlueState {
    /// Login form, or connecting.
    Disconnected,
    /// Client patcher is running.
    Updater,
    /// Character list.
    CharacterSelection,
    /// Character creation.
    CharacterCreation,
    /// Realm list.
    ServerSelection,
    /// Credits roll.
    Credits,
    /// Region picker.
    RegionalSelection,
    /// Any other raw value.
    Unknown(i32),
}

impl GlueState {
    /// Decode a raw state value.
    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Disconnected,
            1 => Self::Updater,
            2 => Self::CharacterSelection,
            3 => Self::CharacterCreation,
            6 => Self::ServerSelection,
            7 => Self::Credits,
            8 => Self::RegionalSelection,
            other => Self::Unknown(other),
        }
    }

    /// The raw value.
    #[must_use]
    pub fn raw(self) -> i32 {
        match self {
            Self::Disconnected => 0,
            Self::Updater => 1,
            Self::CharacterSelection => 2,
            Self::CharacterCreation => 3,
            Self::ServerSelection => 6,
            Self::Credits => 7,
            Self::RegionalSelection => 8,
            Self::Unknown(other) => other,
        }
    }
}

/// Outcome of a login attempt, decoded from the glue dialog title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginResult {
    /// No dialog is showing.
    NoResult,
    /// Could not reach the login server.
    ConnectionFail,
    /// Wrong account name or password.
    IncorrectPassword,
    /// Account banned.
    Banned,
    /// Account suspended.
    Suspended,
    /// Account frozen.
    Frozen,
    /// Account locked after suspicious activity.
    SuspiciousLocked,
    /// Licence locked.
    LockedLicense,
    /// Dialog showing an unrecognised code.
    Unknown,
}

impl LoginResult {
    /// Map a numeric dialog code.
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        match code {
            2 => Self::ConnectionFail,
            104 => Self::IncorrectPassword,
            202 => Self::Banned,
            203 => Self::Suspended,
            206 => Self::Frozen,
            141 | 42003 => Self::SuspiciousLocked,
            204 => Self::LockedLicense,
            _ => Self::Unknown,
        }
    }

    /// Decode the first integer in a dialog title. `None` (no visible
    /// dialog) is a success.
    #[must_use]
    pub fn from_dialog_title(title: Option<&str>) -> Self {
        static CODE: OnceLock<Option<Regex>> = OnceLock::new();
        let Some(title) = title else {
            return Self::NoResult;
        };
        let code = CODE
            .get_or_init(|| Regex::new(r"\d+").ok())
            .as_ref()
            .and_then(|re| re.find(title))
            .and_then(|m| m.as_str().parse::<u32>().ok());
        code.map_or(Self::Unknown, Self::from_code)
    }

    /// Whether this is the success path.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::NoResult
    }

    /// Whether the code probably means retrying is pointless. Informational:
    /// the login flow retries every rejection regardless.
    #[must_use]
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::Banned | Self::Suspended | Self::Frozen | Self::LockedLicense
        )
    }
}

impl Display for LoginResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NoResult => "no result",
            Self::ConnectionFail => "connection failed",
            Self::IncorrectPassword => "incorrect password",
            Self::Banned => "banned",
            Self::Suspended => "suspended",
            Self::Frozen => "frozen",
            Self::SuspiciousLocked => "locked for suspicious activity",
            Self::LockedLicense => "license locked",
            Self::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Coarse screen classification used for logging and flow dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Screen {
    /// Account login form.
    Login,
    /// Between screens (connecting, loading).
    Loading,
    /// Character list.
    CharacterSelection,
    /// Character creation.
    CharacterCreation,
    /// Realm list.
    RealmSelection,
    /// Patcher.
    Updater,
    /// In the world.
    InGame,
    /// Anything else.
    Unknown,
}
