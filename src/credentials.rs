//! Account credentials and lookup by `Character-Realm`.

use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::sync::{Mutex, PoisonError};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::info;

use crate::client::Identity;
use crate::{AppError, Result};

/// Longest password the client's login form accepts.
pub const MAX_PASSWORD_CHARS: usize = 16;

/// Seconds each authenticator code stays valid.
pub const AUTHENTICATOR_PERIOD_SECONDS: i64 = 30;

/// A Battle.net style authenticator: eight-digit HMAC-SHA1 codes over
/// 30-second windows.
#[derive(Clone, PartialEq, Eq)]
pub struct Authenticator {
    serial: String,
    secret: Vec<u8>,
}

impl Authenticator {
    /// Authenticator `serial` with its hex-encoded shared secret.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] if the secret is empty or not hex.
    pub fn new(serial: impl Into<String>, secret_hex: &str) -> Result<Self> {
        let serial = serial.into();
        let secret = decode_hex(secret_hex.trim())
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| {
                AppError::Config(format!("authenticator {serial}: secret must be non-empty hex"))
            })?;
        Ok(Self { serial, secret })
    }

    /// Serial printed on the authenticator.
    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Code valid at `unix_seconds`.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] if the secret cannot key the MAC.
    pub fn code_at(&self, unix_seconds: i64) -> Result<String> {
        let window = u64::try_from(unix_seconds.div_euclid(AUTHENTICATOR_PERIOD_SECONDS)).unwrap_or(0);
        let mut mac = Hmac::<Sha1>::new_from_slice(&self.secret)
            .map_err(|err| AppError::Config(format!("authenticator {}: {err}", self.serial)))?;
        mac.update(&window.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let offset = usize::from(digest[digest.len() - 1] & 0x0f);
        let value = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        Ok(format!("{:08}", value % 100_000_000))
    }

    /// Code valid now.
    ///
    /// # Errors
    ///
    /// As [`code_at`](Self::code_at).
    pub fn current_code(&self) -> Result<String> {
        self.code_at(chrono::Utc::now().timestamp())
    }
}

impl Debug for Authenticator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("serial", &self.serial)
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).ok().and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// One game account and the character to play on it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Login e-mail / account handle typed into the login form.
    pub login: String,
    password: String,
    /// Game account name (for logins that front several accounts).
    pub account_name: String,
    /// Character to enter the world with.
    pub character_name: String,
    /// Realm of `character_name`.
    pub realm: String,
    /// Every `Character-Realm` seen on this account.
    pub characters: BTreeSet<String>,
    /// Answers the code prompt after the password, when the account has one.
    pub authenticator: Option<Authenticator>,
}

impl Credential {
    /// Build a credential. The password is cut to what the login form
    /// accepts.
    #[must_use]
    pub fn new(
        login: impl Into<String>,
        password: &str,
        account_name: impl Into<String>,
    ) -> Self {
        Self {
            login: login.into(),
            password: password.chars().take(MAX_PASSWORD_CHARS).collect(),
            account_name: account_name.into(),
            character_name: String::new(),
            realm: String::new(),
            characters: BTreeSet::new(),
            authenticator: None,
        }
    }

    /// Password as typed into the login form.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Replace the password (truncated like [`new`](Self::new)).
    pub fn set_password(&mut self, password: &str) {
        self.password = password.chars().take(MAX_PASSWORD_CHARS).collect();
    }

    /// Login, password, account and character are all set.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        [&self.login, &self.password, &self.character_name, &self.account_name]
            .iter()
            .all(|field| !field.trim().is_empty())
    }

    /// Copy targeting the character behind a `Character-Realm` key.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidArgument`] for a malformed key.
    pub fn for_character(&self, key: &str) -> Result<Self> {
        let identity = Identity::parse(key)
            .ok_or_else(|| AppError::InvalidArgument(format!("bad character key '{key}'")))?;
        let mut credential = self.clone();
        credential.character_name = identity.character;
        credential.realm = identity.realm;
        credential.characters.insert(key.to_owned());
        Ok(credential)
    }

    /// Target as an identity.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.character_name.clone(), self.realm.clone())
    }

    /// Merge `Character-Realm` keys seen on the character list. Returns how
    /// many were new.
    pub fn record_characters<I>(&mut self, keys: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        keys.into_iter()
            .filter(|key| self.characters.insert(key.clone()))
            .count()
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("account_name", &self.account_name)
            .field("character_name", &self.character_name)
            .field("realm", &self.realm)
            .field("characters", &self.characters)
            .field("authenticator", &self.authenticator)
            .finish()
    }
}

/// Known accounts. Shared by every session of a host.
#[derive(Debug, Default)]
pub struct CredentialRepository {
    accounts: Mutex<Vec<Credential>>,
}

impl CredentialRepository {
    /// Repository over `accounts`.
    #[must_use]
    pub fn new(accounts: Vec<Credential>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
        }
    }

    /// The account owning `Character-Realm`, aimed at that character.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidArgument`] for a malformed key;
    /// - [`AppError::NotFound`] if no account lists the character.
    pub fn for_character(&self, key: &str) -> Result<Credential> {
        let accounts = self.lock();
        let owner = accounts
            .iter()
            .find(|account| account.characters.contains(key))
            .ok_or_else(|| AppError::NotFound(format!("no account has character {key}")))?;
        owner.for_character(key)
    }

    /// Fold characters seen during a login back into the stored account.
    pub fn record(&self, credential: &Credential) {
        let mut accounts = self.lock();
        let Some(stored) = accounts
            .iter_mut()
            .find(|account| account.login == credential.login && account.account_name == credential.account_name)
        else {
            return;
        };
        let added = stored.record_characters(credential.characters.iter().cloned());
        if added > 0 {
            info!(account = %stored.account_name, added, "recorded new characters");
        }
    }

    /// Snapshot of every account.
    #[must_use]
    pub fn accounts(&self) -> Vec<Credential> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Credential>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
