//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use crate::client::state::LoginResult;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Operator control socket failure.
    Ipc(String),
    /// Driver channel framing, protocol or transport failure.
    Channel(String),
    /// Signature did not match anywhere in the scanned memory.
    PatternNotFound(String),
    /// Cross-process read failed (access violation, short read, bad offset).
    ReadFault(String),
    /// Address used after its process exited or with a foreign address space.
    StaleHandle(String),
    /// Process could not be opened for inspection.
    ProcessUnavailable(String),
    /// Spawned process never became minimally alive.
    SpawnTimeout(String),
    /// Attaching to a target did not reach a known screen in time.
    AttachTimeout(String),
    /// Driver-side helper never registered on the channel.
    HelperRegistrationTimeout(String),
    /// Target login dialog reported a failure code.
    LoginRejected(LoginResult),
    /// A bounded retry loop ran out of attempts.
    RetryExhausted(String),
    /// License key pool has no free entries.
    NoFreeKeys,
    /// Caller passed an argument that violates an operation's contract.
    InvalidArgument(String),
    /// Target is on a screen the current step cannot handle.
    Screen(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Operation stopped because its cancellation token fired.
    Cancelled,
}

impl AppError {
    /// Whether the failure came from the memory layer and is recoverable by
    /// re-attaching to the process.
    #[must_use]
    pub fn is_memory_fault(&self) -> bool {
        matches!(
            self,
            Self::PatternNotFound(_) | Self::ReadFault(_) | Self::StaleHandle(_)
        )
    }

    /// Whether re-running the failed step can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::NotFound(_) | Self::InvalidArgument(_) | Self::Config(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Channel(msg) => write!(f, "channel: {msg}"),
            Self::PatternNotFound(msg) => write!(f, "pattern not found: {msg}"),
            Self::ReadFault(msg) => write!(f, "read fault: {msg}"),
            Self::StaleHandle(msg) => write!(f, "stale handle: {msg}"),
            Self::ProcessUnavailable(msg) => write!(f, "process unavailable: {msg}"),
            Self::SpawnTimeout(msg) => write!(f, "spawn timeout: {msg}"),
            Self::AttachTimeout(msg) => write!(f, "attach timeout: {msg}"),
            Self::HelperRegistrationTimeout(msg) => {
                write!(f, "helper registration timeout: {msg}")
            }
            Self::LoginRejected(code) => write!(f, "login rejected: {code}"),
            Self::RetryExhausted(msg) => write!(f, "retry exhausted: {msg}"),
            Self::NoFreeKeys => write!(f, "no free keys: license pool is empty"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Screen(msg) => write!(f, "screen: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Channel(format!("malformed json: {err}"))
    }
}
