//! Session task definitions.

use serde::{Deserialize, Serialize};

use crate::client::Identity;
use crate::{AppError, Result};

/// What ends a [`GeneralRun`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopTrigger {
    /// The helper raises `OnBotStopped`.
    #[default]
    BotStopped,
    /// `timeout_seconds` elapse; the bot is then stopped.
    Timeout,
}

/// Log in, start a bot and supervise it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralRun {
    /// `Character-Realm` to play.
    pub character: String,
    /// Bot to start.
    pub bot_name: String,
    /// Profile to load.
    pub profile_path: String,
    /// Combat routine; the host default when unset.
    #[serde(default)]
    pub combat_routine: Option<String>,
    /// Completion condition.
    #[serde(default)]
    pub stop: StopTrigger,
    /// Run time for [`StopTrigger::Timeout`].
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// One step of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionTask {
    /// Enter the world as `character` (`Character-Realm`).
    Login {
        /// `Character-Realm` to play.
        character: String,
    },
    /// Leave the world, back to the login form.
    Logout,
    /// Login, then drive a bot to completion.
    GeneralRun(GeneralRun),
}

impl SessionTask {
    /// Short name for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::Logout => "logout",
            Self::GeneralRun(_) => "general_run",
        }
    }

    /// Character this task plays, if any.
    #[must_use]
    pub fn character(&self) -> Option<&str> {
        match self {
            Self::Login { character } => Some(character),
            Self::GeneralRun(run) => Some(&run.character),
            Self::Logout => None,
        }
    }

    /// Check the task is well formed.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if let Some(character) = self.character() {
            if Identity::parse(character).is_none() {
                return Err(AppError::Config(format!(
                    "{} task: character '{character}' is not Character-Realm",
                    self.label()
                )));
            }
        }
        if let Self::GeneralRun(run) = self {
            if run.bot_name.trim().is_empty() {
                return Err(AppError::Config("general_run task: bot_name is empty".into()));
            }
            if run.stop == StopTrigger::Timeout && run.timeout_seconds.unwrap_or(0) == 0 {
                return Err(AppError::Config(
                    "general_run task: stop = \"timeout\" needs timeout_seconds > 0".into(),
                ));
            }
        }
        Ok(())
    }
}
