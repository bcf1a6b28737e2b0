//! Unit tests for global configuration parsing and validation.

use std::io::Write;
use std::time::Duration;

use fenix::config::{AccountConfig, RetryConfig};
use fenix::memory::PointerWidth;
use fenix::session::task::SessionTask;
use fenix::{AppError, GlobalConfig};

const MINIMAL: &str = r#"
[target]
executable = "/opt/game/Wow.exe"

[driver]
executable = "/opt/driver/Driver.exe"
"#;

fn full_toml() -> String {
    r#"
ipc_name = "fenix-test"

[target]
executable = "/opt/game/Wow.exe"
args = ["-windowed"]
launch_throttle_seconds = 8
spawn_timeout_seconds = 90
scan_timeout_seconds = 30
pointer_width = 4
adopt_pids = [1200, 1300]

[target.signatures]
glue_state = "83 3d ?? ?? ?? ?? ?? 75"

[driver]
executable = "/opt/driver/Driver.exe"
endpoint_prefix = "drv"
registration_timeout_seconds = 45
call_timeout_seconds = 15
default_combat_routine = "Singular"

[retries]
login = 3
task = 0

[[accounts]]
login = "player@example.com"
account_name = "WoW1"
characters = ["Thrall-Stormrage", "Jaina-Stormrage"]

[[sessions]]
name = "grind"
autostart = true

[[sessions.tasks]]
kind = "general_run"
character = "Thrall-Stormrage"
bot_name = "Grind Bot"
profile_path = "profiles/grind.xml"

[[sessions.tasks]]
kind = "logout"
"#
    .to_owned()
}

fn config_error(raw: &str) -> String {
    match GlobalConfig::from_toml_str(raw) {
        Err(AppError::Config(msg)) => msg,
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn minimal_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str(MINIMAL).unwrap();
    assert_eq!(config.ipc_name, "fenix");
    assert_eq!(config.retries, RetryConfig::default());
    assert_eq!(config.target.launch_throttle_seconds, 5);
    assert_eq!(config.target.pointer_width, PointerWidth::Four);
    assert_eq!(config.driver.endpoint_prefix, "fenix-driver");
    assert!(config.accounts.is_empty());
    assert!(config.sessions.is_empty());
    assert!(config.license_keys.is_empty());
    assert!(config.ipc_token.is_none());
}

#[test]
fn full_config_round_trips_every_section() {
    let config = GlobalConfig::from_toml_str(&full_toml()).unwrap();
    assert_eq!(config.ipc_name, "fenix-test");
    assert_eq!(config.target.adopt_pids, vec![1200, 1300]);
    assert_eq!(config.launch_throttle(), Duration::from_secs(8));
    assert_eq!(config.retries.login, 3);
    assert_eq!(config.retries.task, 0);
    assert_eq!(config.retries.attach, 10);
    assert_eq!(config.driver.default_combat_routine.as_deref(), Some("Singular"));

    let session = config.session("grind").unwrap();
    assert!(session.autostart);
    assert_eq!(session.tasks.len(), 2);
    assert_eq!(session.tasks[1], SessionTask::Logout);
    assert!(config.session("missing").is_none());

    let driver = config.driver_settings();
    assert_eq!(driver.endpoint_prefix, "drv");
    assert_eq!(driver.call_timeout, Duration::from_secs(15));
    assert_eq!(driver.registration.timeout, Duration::from_secs(45));

    let pool = config.pool_settings();
    assert_eq!(pool.spawn.timeout, Duration::from_secs(90));

    let client = config.client_settings().unwrap();
    assert_eq!(client.scan.timeout, Duration::from_secs(30));
}

#[test]
fn config_loads_from_a_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(MINIMAL.as_bytes()).unwrap();
    let config = GlobalConfig::load_from_path(file.path()).unwrap();
    assert_eq!(config.target.executable.to_str(), Some("/opt/game/Wow.exe"));
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = GlobalConfig::load_from_path(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(&err, AppError::Config(m) if m.starts_with("cannot read")), "{err}");
}

#[test]
fn malformed_toml_is_rejected() {
    let msg = config_error("[target\nexecutable = 1");
    assert!(msg.starts_with("invalid config"), "{msg}");
}

#[test]
fn zero_timeouts_and_retries_are_rejected() {
    let msg = config_error(&format!("{MINIMAL}\n[retries]\nattach = 0\n"));
    assert_eq!(msg, "retry counts must be greater than zero");

    let raw = MINIMAL.replace(
        "executable = \"/opt/game/Wow.exe\"",
        "executable = \"/opt/game/Wow.exe\"\nscan_timeout_seconds = 0",
    );
    assert_eq!(config_error(&raw), "target timeouts must be greater than zero");
}

#[test]
fn empty_executable_is_rejected() {
    let raw = MINIMAL.replace("/opt/game/Wow.exe", "");
    assert_eq!(config_error(&raw), "target.executable must not be empty");
}

#[test]
fn bad_signature_override_is_rejected() {
    let raw = format!("{MINIMAL}\n[target.signatures]\nglue_state = \"zz 01\"\n");
    let err = GlobalConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, AppError::Config(_)), "{err}");
}

#[test]
fn pointer_width_must_be_four_or_eight() {
    let raw = MINIMAL.replace(
        "executable = \"/opt/game/Wow.exe\"",
        "executable = \"/opt/game/Wow.exe\"\npointer_width = 6",
    );
    assert!(GlobalConfig::from_toml_str(&raw).is_err());
}

#[test]
fn duplicate_session_names_are_rejected() {
    let raw = format!("{MINIMAL}\n[[sessions]]\nname = \"a\"\n\n[[sessions]]\nname = \"a\"\n");
    assert_eq!(config_error(&raw), "duplicate session 'a'");
}

#[test]
fn tasks_must_name_a_known_character() {
    let raw = full_toml().replace(
        "character = \"Thrall-Stormrage\"\nbot_name",
        "character = \"Sylvanas-Stormrage\"\nbot_name",
    );
    assert_eq!(
        config_error(&raw),
        "session grind: no account lists character Sylvanas-Stormrage"
    );
}

#[test]
fn account_characters_need_a_realm() {
    let raw = full_toml().replace("\"Jaina-Stormrage\"]", "\"Jaina\"]");
    assert_eq!(config_error(&raw), "account WoW1: 'Jaina' is not Character-Realm");
}

#[test]
fn secret_keys_derive_from_the_account_name() {
    let account = AccountConfig {
        login: "player@example.com".into(),
        account_name: "WoW1 main".into(),
        characters: Vec::new(),
        authenticator_serial: None,
        password: String::new(),
        authenticator: None,
    };
    assert_eq!(account.keyring_key(), "password:WoW1 main");
    assert_eq!(account.env_key(), "FENIX_PASSWORD_WOW1_MAIN");
    assert_eq!(account.authenticator_keyring_key(), "authenticator:WoW1 main");
    assert_eq!(account.authenticator_env_key(), "FENIX_AUTHENTICATOR_WOW1_MAIN");
}

#[test]
fn credentials_and_key_pool_come_from_the_config() {
    let mut config = GlobalConfig::from_toml_str(&full_toml()).unwrap();
    config.accounts[0].password = "hunter2".into();
    config.license_keys = vec!["K1".into(), "K2".into(), "K1".into()];

    let credentials = config.credentials();
    assert_eq!(credentials.len(), 1);
    assert_eq!(credentials[0].password(), "hunter2");
    assert!(credentials[0].characters.contains("Jaina-Stormrage"));
    assert_eq!(config.key_pool().capacity(), 2);
}
