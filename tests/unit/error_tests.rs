//! Unit tests for `AppError` display and classification.

use fenix::client::state::LoginResult;
use fenix::AppError;

#[test]
fn display_prefixes_the_failure_kind() {
    assert_eq!(AppError::Config("bad".into()).to_string(), "config: bad");
    assert_eq!(
        AppError::ReadFault("0x10".into()).to_string(),
        "read fault: 0x10"
    );
    assert_eq!(
        AppError::LoginRejected(LoginResult::IncorrectPassword).to_string(),
        "login rejected: incorrect password"
    );
    assert_eq!(
        AppError::NoFreeKeys.to_string(),
        "no free keys: license pool is empty"
    );
    assert_eq!(AppError::Cancelled.to_string(), "cancelled");
}

#[test]
fn memory_faults_are_recognised() {
    assert!(AppError::PatternNotFound("login".into()).is_memory_fault());
    assert!(AppError::ReadFault("x".into()).is_memory_fault());
    assert!(AppError::StaleHandle("x".into()).is_memory_fault());
    assert!(!AppError::ProcessUnavailable("x".into()).is_memory_fault());
    assert!(!AppError::Cancelled.is_memory_fault());
}

#[test]
fn contract_violations_are_not_retried() {
    assert!(!AppError::Cancelled.is_retryable());
    assert!(!AppError::NotFound("s".into()).is_retryable());
    assert!(!AppError::InvalidArgument("s".into()).is_retryable());
    assert!(!AppError::Config("s".into()).is_retryable());

    assert!(AppError::LoginRejected(LoginResult::Banned).is_retryable());
    assert!(AppError::AttachTimeout("s".into()).is_retryable());
    assert!(AppError::NoFreeKeys.is_retryable());
}

#[test]
fn foreign_errors_convert() {
    let io = std::io::Error::other("disk gone");
    assert_eq!(AppError::from(io), AppError::Io("disk gone".into()));

    let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    assert!(matches!(AppError::from(json), AppError::Channel(m) if m.starts_with("malformed json")));

    let toml = toml::from_str::<toml::Table>("= 1").unwrap_err();
    assert!(matches!(AppError::from(toml), AppError::Config(m) if m.starts_with("invalid config")));
}
