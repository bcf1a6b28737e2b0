//! Global configuration parsing, validation, and secret loading.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::client::patterns::SignatureConfig;
use crate::client::widgets::WidgetLayout;
use crate::client::{ClientSettings, Identity};
use crate::credentials::{Authenticator, Credential};
use crate::driver::key_pool::KeyPool;
use crate::driver::DriverSettings;
use crate::interpreter::TableLayout;
use crate::memory::PointerWidth;
use crate::platform::InputBackend;
use crate::pool::PoolSettings;
use crate::session::task::SessionTask;
use crate::suspend::PollSchedule;
use crate::{AppError, Result};

/// Keychain service every secret is stored under.
pub const KEYRING_SERVICE: &str = "fenix";

/// Game client executable and memory layout.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TargetConfig {
    /// Path to the client executable.
    pub executable: PathBuf,
    /// Extra launch arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Minimum spacing between two launches.
    #[serde(default = "default_launch_throttle_seconds")]
    pub launch_throttle_seconds: u64,
    /// Wait for a launched client's window.
    #[serde(default = "default_spawn_timeout_seconds")]
    pub spawn_timeout_seconds: u64,
    /// Signature scan timeout while attaching.
    #[serde(default = "default_scan_timeout_seconds")]
    pub scan_timeout_seconds: u64,
    /// Target pointer width in bytes (4 or 8).
    #[serde(default)]
    pub pointer_width: PointerWidth,
    /// Signature overrides.
    #[serde(default)]
    pub signatures: SignatureConfig,
    /// Interpreter table layout overrides.
    #[serde(default)]
    pub table_layout: TableLayout,
    /// UI object layout overrides.
    #[serde(default)]
    pub widget_layout: WidgetLayout,
    /// Keyboard injection backend.
    #[serde(default)]
    pub input: InputBackend,
    /// Already-running clients handed to the pool at startup.
    #[serde(default)]
    pub adopt_pids: Vec<u32>,
}

fn default_launch_throttle_seconds() -> u64 {
    5
}

fn default_spawn_timeout_seconds() -> u64 {
    120
}

fn default_scan_timeout_seconds() -> u64 {
    60
}

/// Bot driver executable and channel timeouts.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DriverConfig {
    /// Path to the driver executable.
    pub executable: PathBuf,
    /// Arguments appended after the generated ones.
    #[serde(default)]
    pub args: Vec<String>,
    /// Channel names are `<endpoint_prefix>-<pid>`.
    #[serde(default = "default_endpoint_prefix")]
    pub endpoint_prefix: String,
    /// Wait for the in-driver helper to register.
    #[serde(default = "default_registration_timeout_seconds")]
    pub registration_timeout_seconds: u64,
    /// Per-call response timeout.
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
    /// Combat routine for runs that name none.
    #[serde(default)]
    pub default_combat_routine: Option<String>,
}

fn default_endpoint_prefix() -> String {
    "fenix-driver".into()
}

fn default_registration_timeout_seconds() -> u64 {
    60
}

fn default_call_timeout_seconds() -> u64 {
    30
}

/// Attempt counts for each bounded step.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct RetryConfig {
    /// Allocating a target process.
    pub allocate: u32,
    /// Attaching to it.
    pub attach: u32,
    /// Entering the world.
    pub login: u32,
    /// Logging out.
    pub logout: u32,
    /// Launching and connecting a driver.
    pub driver: u32,
    /// Re-running a failed task after the first try.
    pub task: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            allocate: 10,
            attach: 10,
            login: 10,
            logout: 10,
            driver: 10,
            task: 10,
        }
    }
}

/// One game account. The password is never read from the file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AccountConfig {
    /// Login typed into the account box.
    pub login: String,
    /// Game account name.
    pub account_name: String,
    /// `Character-Realm` keys known to live on this account.
    #[serde(default)]
    pub characters: Vec<String>,
    /// Serial of the authenticator attached to this account, if any.
    #[serde(default)]
    pub authenticator_serial: Option<String>,
    /// Password (populated at runtime).
    #[serde(skip)]
    pub password: String,
    /// Authenticator (populated at runtime from its secret).
    #[serde(skip)]
    pub authenticator: Option<Authenticator>,
}

impl AccountConfig {
    /// Keychain entry holding the password.
    #[must_use]
    pub fn keyring_key(&self) -> String {
        format!("password:{}", self.account_name)
    }

    /// Environment variable holding the password when the keychain has none.
    #[must_use]
    pub fn env_key(&self) -> String {
        format!("FENIX_PASSWORD_{}", self.env_suffix())
    }

    /// Keychain entry holding the hex authenticator secret.
    #[must_use]
    pub fn authenticator_keyring_key(&self) -> String {
        format!("authenticator:{}", self.account_name)
    }

    /// Environment variable holding the authenticator secret.
    #[must_use]
    pub fn authenticator_env_key(&self) -> String {
        format!("FENIX_AUTHENTICATOR_{}", self.env_suffix())
    }

    fn env_suffix(&self) -> String {
        self.account_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect()
    }
}

/// A named task list.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Unique session name.
    pub name: String,
    /// Start as soon as the host is up.
    #[serde(default)]
    pub autostart: bool,
    /// Tasks run in order.
    #[serde(default)]
    pub tasks: Vec<SessionTask>,
}

/// Global configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Game client settings.
    pub target: TargetConfig,
    /// Bot driver settings.
    pub driver: DriverConfig,
    /// Attempt counts.
    #[serde(default)]
    pub retries: RetryConfig,
    /// Local control socket name.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Known accounts.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Session definitions.
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
    /// Driver license keys (populated at runtime).
    #[serde(skip)]
    pub license_keys: Vec<String>,
    /// Control socket token (populated at runtime).
    #[serde(skip)]
    pub ipc_token: Option<String>,
}

fn default_ipc_name() -> String {
    "fenix".into()
}

impl GlobalConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or is invalid.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .map_err(|err| AppError::Config(format!("cannot read {}: {err}", path.as_ref().display())))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill account passwords, license keys and the control token from the
    /// OS keychain, falling back to environment variables.
    ///
    /// Missing license keys or control token only warn; a missing password
    /// is an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an account password cannot be found.
    pub async fn load_secrets(&mut self) -> Result<()> {
        for account in &mut self.accounts {
            account.password = load_secret(&account.keyring_key(), &account.env_key()).await?;
            if let Some(serial) = account.authenticator_serial.clone() {
                let secret = load_secret(
                    &account.authenticator_keyring_key(),
                    &account.authenticator_env_key(),
                )
                .await?;
                account.authenticator = Some(Authenticator::new(serial, &secret)?);
            }
        }

        match load_secret("license_keys", "FENIX_LICENSE_KEYS").await {
            Ok(raw) => self.license_keys = split_keys(&raw),
            Err(err) => warn!(%err, "no driver license keys; bot runs will fail"),
        }
        info!(count = self.license_keys.len(), "license keys loaded");

        match load_secret("ipc_token", "FENIX_IPC_TOKEN").await {
            Ok(token) => self.ipc_token = Some(token),
            Err(_) => warn!("no control token configured; a fresh one is generated per run"),
        }
        Ok(())
    }

    /// Client attach settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a signature override does not parse.
    pub fn client_settings(&self) -> Result<ClientSettings> {
        let mut settings = ClientSettings::new(self.target.signatures.compile()?);
        settings.table_layout = self.target.table_layout;
        settings.widget_layout = self.target.widget_layout;
        settings.pointer_width = self.target.pointer_width;
        settings.scan = PollSchedule::new(
            Duration::from_secs(self.target.scan_timeout_seconds),
            settings.scan.interval,
        );
        Ok(settings)
    }

    /// Target launch settings.
    #[must_use]
    pub fn pool_settings(&self) -> PoolSettings {
        let mut settings = PoolSettings::new(self.target.executable.clone(), self.target.args.clone());
        settings.spawn = PollSchedule::new(
            Duration::from_secs(self.target.spawn_timeout_seconds),
            settings.spawn.interval,
        );
        settings
    }

    /// Spacing between launches of one executable.
    #[must_use]
    pub fn launch_throttle(&self) -> Duration {
        Duration::from_secs(self.target.launch_throttle_seconds)
    }

    /// Driver launch settings.
    #[must_use]
    pub fn driver_settings(&self) -> DriverSettings {
        let mut settings = DriverSettings::new(self.driver.executable.clone());
        settings.args.clone_from(&self.driver.args);
        settings.endpoint_prefix.clone_from(&self.driver.endpoint_prefix);
        settings.registration = PollSchedule::new(
            Duration::from_secs(self.driver.registration_timeout_seconds),
            settings.registration.interval,
        );
        settings.call_timeout = Duration::from_secs(self.driver.call_timeout_seconds);
        settings
    }

    /// Credentials for every account.
    #[must_use]
    pub fn credentials(&self) -> Vec<Credential> {
        self.accounts
            .iter()
            .map(|account| {
                let mut credential =
                    Credential::new(account.login.clone(), &account.password, account.account_name.clone());
                credential.record_characters(account.characters.iter().cloned());
                credential.authenticator.clone_from(&account.authenticator);
                credential
            })
            .collect()
    }

    /// License key pool.
    #[must_use]
    pub fn key_pool(&self) -> KeyPool {
        KeyPool::new(self.license_keys.iter().cloned())
    }

    /// Find a session definition by name.
    #[must_use]
    pub fn session(&self, name: &str) -> Option<&SessionConfig> {
        self.sessions.iter().find(|s| s.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.target.executable.as_os_str().is_empty() {
            return Err(AppError::Config("target.executable must not be empty".into()));
        }
        if self.driver.executable.as_os_str().is_empty() {
            return Err(AppError::Config("driver.executable must not be empty".into()));
        }
        if self.target.spawn_timeout_seconds == 0 || self.target.scan_timeout_seconds == 0 {
            return Err(AppError::Config("target timeouts must be greater than zero".into()));
        }
        if self.driver.registration_timeout_seconds == 0 || self.driver.call_timeout_seconds == 0 {
            return Err(AppError::Config("driver timeouts must be greater than zero".into()));
        }
        if self.ipc_name.trim().is_empty() {
            return Err(AppError::Config("ipc_name must not be empty".into()));
        }
        let retries = self.retries;
        if [retries.allocate, retries.attach, retries.login, retries.logout, retries.driver]
            .contains(&0)
        {
            return Err(AppError::Config("retry counts must be greater than zero".into()));
        }
        self.target.signatures.compile()?;

        let mut known = HashSet::new();
        for account in &self.accounts {
            if account.login.trim().is_empty() || account.account_name.trim().is_empty() {
                return Err(AppError::Config("accounts need login and account_name".into()));
            }
            for key in &account.characters {
                if Identity::parse(key).is_none() {
                    return Err(AppError::Config(format!(
                        "account {}: '{key}' is not Character-Realm",
                        account.account_name
                    )));
                }
                known.insert(key.as_str());
            }
        }

        let mut names = HashSet::new();
        for session in &self.sessions {
            if session.name.trim().is_empty() {
                return Err(AppError::Config("session names must not be empty".into()));
            }
            if !names.insert(session.name.as_str()) {
                return Err(AppError::Config(format!("duplicate session '{}'", session.name)));
            }
            for task in &session.tasks {
                task.validate()
                    .map_err(|err| AppError::Config(format!("session {}: {err}", session.name)))?;
                if let Some(character) = task.character() {
                    if !known.contains(character) {
                        return Err(AppError::Config(format!(
                            "session {}: no account lists character {character}",
                            session.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Load a single secret from OS keychain with env-var fallback.
async fn load_secret(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => warn!(key = keyring_key, "keychain entry is empty, trying env var"),
        Err(err) => warn!(key = keyring_key, ?err, "keychain lookup failed, trying env var"),
    }

    env::var(env_key)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::Config(format!(
                "secret {keyring_key} not found in keychain or {env_key} env var"
            ))
        })
}
