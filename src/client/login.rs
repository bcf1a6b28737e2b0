//! Login, character selection and logout sequences.
//!
//! Each sequence makes a single pass from whatever screen the client is on
//! and fails with a descriptive error as soon as a step does not go as
//! expected; callers retry the whole pass.

use tracing::{info, warn};

use crate::credentials::{Authenticator, Credential};
use crate::platform::Key;
use crate::suspend::{wait_until, Suspension, WaitOutcome};
use crate::{AppError, Result};

use super::state::{GlueState, LoginResult};
use super::widgets::{
    Widget, ACCOUNT_EDIT, CHANGE_REALM_BUTTON, CHAR_SELECT_NAME, PASSWORD_EDIT, REALM_SCROLL_DOWN,
    TOKEN_EDIT,
};
use super::{TargetClient, REALM_GLOBAL};

/// Escape presses spent clearing stale dialogs before typing.
const MAX_DIALOG_DISMISSALS: usize = 5;

/// Down presses tried before giving up on reaching a character.
const MAX_CURSOR_STEPS: usize = 64;

/// Scroll clicks tried before giving up on finding a realm row.
const MAX_REALM_SCROLLS: usize = 64;

impl TargetClient {
    /// Bring the client into the world as `credential`'s character.
    ///
    /// Starting from any of: in the world (as someone else: logs out first),
    /// the login form, the realm list, character creation, or the character
    /// list. The realm is switched when the list shows another one. Characters
    /// seen on the list are merged into `credential.characters`.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidArgument`] for an incomplete credential;
    /// - [`AppError::LoginRejected`] with the decoded dialog code;
    /// - [`AppError::Screen`] when a step does not reach the expected screen;
    /// - [`AppError::Cancelled`].
    pub async fn enter_game(&mut self, credential: &mut Credential, suspension: &Suspension) -> Result<()> {
        if !credential.is_valid() {
            return Err(AppError::InvalidArgument(format!(
                "incomplete credential for account {}",
                credential.account_name
            )));
        }
        let pid = self.pid();

        if self.is_in_game() {
            let current = self.wait_character_name(suspension).await?;
            let realm = self.realm()?;
            if current != credential.character_name || realm.as_deref() != Some(credential.realm.as_str()) {
                info!(pid, from = %current, to = %credential.character_name, "switching characters");
                self.logout(Some(&*credential), suspension).await?;
            }
        }

        if self.is_login_screen(suspension).await? {
            suspension.checkpoint().await?;
            self.submit_credentials(credential, suspension).await?;
        }

        if self.is_realm_selection()? {
            suspension.checkpoint().await?;
            self.select_realm(&credential.realm, suspension).await?;
        }

        if self.is_character_creation()? {
            suspension.checkpoint().await?;
            self.send_key(Key::Escape).await?;
            let schedule = self.timings.creation_exit;
            wait_until(suspension, schedule, || {
                !self.is_glue_dialog_visible().unwrap_or(true)
            })
            .await
            .into_result(|| AppError::Screen("character creation did not close".into()))?;
        }

        if self.is_character_selection()? {
            suspension.checkpoint().await?;
            self.select_character(credential, suspension).await?;
        }

        if !self.is_in_game() {
            return Err(AppError::Screen(format!(
                "expected to be in the world, client shows {:?}",
                self.screen()
            )));
        }

        suspension.checkpoint().await?;
        let realm = self
            .script_result("GetRealmName()", REALM_GLOBAL, suspension)
            .await?;
        info!(pid, character = %credential.character_name, %realm, "entered the world");
        self.realm = Some(realm);
        suspension.sleep(self.timings.world_settle).await
    }

    /// Log out to the character list with `/logout`. Unless `stay_for`
    /// names an active character on the listed realm, continue back to the
    /// login form.
    ///
    /// # Errors
    ///
    /// - [`AppError::Screen`] when not in the world, or a screen never comes up;
    /// - chat errors and [`AppError::Cancelled`].
    pub async fn logout(&mut self, stay_for: Option<&Credential>, suspension: &Suspension) -> Result<()> {
        if !self.is_in_game() {
            return Err(AppError::Screen("not in the world".into()));
        }
        self.send_chat("/logout", suspension).await?;

        let schedule = self.timings.character_select;
        wait_until(suspension, schedule, || {
            self.view.reset().ok();
            self.is_character_selection().unwrap_or(false)
        })
        .await
        .into_result(|| AppError::Screen("logout did not reach the character list".into()))?;
        self.realm = None;

        // an Escape pressed while the dialog is still fading opens the realm list
        suspension.sleep(self.timings.after_logout).await?;
        self.wait_dialog_clear(suspension).await?;

        let listed_realm = self.realm()?;
        let names = self.active_character_names()?;
        let stays = stay_for.is_some_and(|credential| {
            names.contains(&credential.character_name)
                && listed_realm.as_deref() == Some(credential.realm.as_str())
        });

        if !stays {
            self.send_key(Key::Escape).await?;
            self.wait_login_form(suspension).await?;
            match self.wait_globals_init(suspension).await {
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(err) => warn!(pid = self.pid(), %err, "login screen globals did not settle"),
                Ok(()) => {}
            }
        }
        info!(pid = self.pid(), to_login = !stays, "logged out");
        Ok(())
    }

    /// Whether the login form is up, waiting for the interface to finish
    /// loading first. Timeouts count as `false`.
    ///
    /// # Errors
    ///
    /// [`AppError::Cancelled`].
    pub async fn is_login_screen(&mut self, suspension: &Suspension) -> Result<bool> {
        if self.is_in_game() || self.is_connecting_or_loading() {
            return Ok(false);
        }
        if !matches!(self.glue_state(), Ok(GlueState::Disconnected)) {
            return Ok(false);
        }
        let mut ready = self.wait_globals_init(suspension).await;
        if ready.is_ok() {
            ready = self.wait_login_form(suspension).await;
        }
        match ready {
            Ok(()) => Ok(true),
            Err(AppError::Cancelled) => Err(AppError::Cancelled),
            Err(err) => {
                warn!(pid = self.pid(), %err, "login screen not ready");
                Ok(false)
            }
        }
    }

    async fn submit_credentials(&mut self, credential: &Credential, suspension: &Suspension) -> Result<()> {
        let mut dismissed = 0;
        while dismissed < MAX_DIALOG_DISMISSALS
            && (self.is_glue_dialog_visible().unwrap_or(false) || !self.login_result().is_success())
        {
            dismissed += 1;
            self.send_key(Key::Escape).await?;
            suspension.sleep(self.timings.dialog_dismiss).await?;
        }
        if self.is_glue_dialog_visible()? {
            return Err(AppError::Screen("unhandled dialog prevents login".into()));
        }

        suspension.checkpoint().await?;
        self.type_into(ACCOUNT_EDIT, &credential.login, suspension).await?;
        self.type_into(PASSWORD_EDIT, credential.password(), suspension).await?;
        self.send_key(Key::Enter).await?;

        if let Some(authenticator) = &credential.authenticator {
            self.answer_token_prompt(authenticator, suspension).await?;
        }

        let schedule = self.timings.dialog_clear;
        let outcome = wait_until(suspension, schedule, || self.login_resolved()).await;
        match outcome {
            WaitOutcome::Satisfied => {}
            WaitOutcome::Cancelled => return Err(AppError::Cancelled),
            WaitOutcome::TimedOut => {
                let title = self.dialog_title().unwrap_or_default();
                warn!(pid = self.pid(), account = %credential.account_name, %title, "login timed out");
                return Err(AppError::Screen(format!(
                    "connection timed out; dialog shows '{title}'"
                )));
            }
        }
        let result = self.login_result();
        if !result.is_success() {
            warn!(
                pid = self.pid(),
                account = %credential.account_name,
                code = %result,
                permanent = result.is_permanent(),
                "login rejected"
            );
            return Err(AppError::LoginRejected(result));
        }
        Ok(())
    }

    /// Success leaves the login screen; failure keeps a dialog up with a code.
    fn login_resolved(&mut self) -> bool {
        if self.is_connecting_or_loading() {
            return false;
        }
        if !matches!(self.login_result(), LoginResult::NoResult | LoginResult::Unknown) {
            return true;
        }
        let left_login = !matches!(self.glue_state(), Ok(GlueState::Disconnected));
        left_login && !self.is_glue_dialog_visible().unwrap_or(true)
    }

    /// Enter the current authenticator code if the client asks for one. A
    /// login that resolves without a prompt is left to the caller.
    async fn answer_token_prompt(&mut self, authenticator: &Authenticator, suspension: &Suspension) -> Result<()> {
        let mut prompted = false;
        let schedule = self.timings.token_prompt;
        let outcome = wait_until(suspension, schedule, || {
            prompted = matches!(self.widget_now(TOKEN_EDIT), Ok(Some(w)) if w.is_displayed());
            prompted || self.login_resolved()
        })
        .await;
        if outcome == WaitOutcome::Cancelled {
            return Err(AppError::Cancelled);
        }
        if !prompted {
            return Ok(());
        }

        let code = authenticator.current_code()?;
        info!(pid = self.pid(), serial = authenticator.serial(), "entering authenticator code");
        self.type_into(TOKEN_EDIT, &code, suspension).await?;
        self.send_key(Key::Enter).await
    }

    /// Switch the client to `realm` through the realm list, ending on that
    /// realm's character list. Starts from the character list or the realm
    /// list.
    ///
    /// # Errors
    ///
    /// - [`AppError::Screen`] when the realm list never opens, `realm` is
    ///   not listed, or the character list does not come back for it;
    /// - injection failures and [`AppError::Cancelled`].
    pub async fn select_realm(&mut self, realm: &str, suspension: &Suspension) -> Result<()> {
        let pid = self.pid();
        if !self.is_realm_selection()? {
            if self.realm()?.as_deref() == Some(realm) {
                return Ok(());
            }
            if !self.is_character_selection()? {
                return Err(AppError::Screen(format!(
                    "cannot change realm from {:?}",
                    self.screen()
                )));
            }
            let Some(button) = self.widget(CHANGE_REALM_BUTTON, suspension).await? else {
                return Err(AppError::Screen("character list has no realm button".into()));
            };
            self.click(&button).await?;
        }

        wait_until(suspension, self.timings.realm_list, || {
            self.view.reset().ok();
            self.is_realm_selection().unwrap_or(false)
        })
        .await
        .into_result(|| AppError::Screen("realm list did not open".into()))?;

        let mut scrolls = 0;
        let entry = loop {
            suspension.checkpoint().await?;
            if let Some(entry) = self.widgets()?.into_iter().find(|w| w.is_realm_entry(realm)) {
                break entry;
            }
            if scrolls >= MAX_REALM_SCROLLS {
                return Err(AppError::Screen(format!("realm {realm} is not listed")));
            }
            let Some(down) = self.widget(REALM_SCROLL_DOWN, suspension).await? else {
                return Err(AppError::Screen(format!("realm {realm} is not listed")));
            };
            if !down.is_displayed() || !down.enabled {
                return Err(AppError::Screen(format!("realm {realm} is not listed")));
            }
            self.click(&down).await?;
            suspension.sleep(self.timings.input_settle).await?;
            scrolls += 1;
        };

        // a single click only highlights the row
        self.click(&entry).await?;
        suspension.sleep(self.timings.input_settle).await?;
        self.click(&entry).await?;

        wait_until(suspension, self.timings.character_select, || {
            self.view.reset().ok();
            self.is_character_selection().unwrap_or(false)
        })
        .await
        .into_result(|| AppError::Screen(format!("character list did not return after picking {realm}")))?;

        let listed = self.realm()?;
        if listed.as_deref() != Some(realm) {
            return Err(AppError::Screen(format!(
                "character list is for realm {}, expected {realm}",
                listed.unwrap_or_default()
            )));
        }
        info!(pid, %realm, scrolls, "realm selected");
        Ok(())
    }

    async fn select_character(&mut self, credential: &mut Credential, suspension: &Suspension) -> Result<()> {
        let mut listed_realm = self.realm()?;
        let mut names = self.active_character_names()?;
        if let Some(realm) = &listed_realm {
            credential.record_characters(names.iter().map(|name| format!("{name}-{realm}")));
        }

        if listed_realm.as_deref() != Some(credential.realm.as_str()) {
            info!(
                pid = self.pid(),
                from = listed_realm.as_deref().unwrap_or_default(),
                to = %credential.realm,
                "switching realms"
            );
            self.select_realm(&credential.realm, suspension).await?;
            listed_realm = self.realm()?;
            names = self.active_character_names()?;
            if let Some(realm) = &listed_realm {
                credential.record_characters(names.iter().map(|name| format!("{name}-{realm}")));
            }
        }
        if !names.contains(&credential.character_name) {
            return Err(AppError::Screen(format!(
                "no active character named {} (found: {})",
                credential.character_name,
                names.join(", ")
            )));
        }

        let mut steps = 0;
        loop {
            let Some(selected) = self.widget(CHAR_SELECT_NAME, suspension).await? else {
                return Err(AppError::Screen("character list has no selection".into()));
            };
            if selected.text == credential.character_name {
                break;
            }
            if steps >= MAX_CURSOR_STEPS {
                return Err(AppError::Screen(format!(
                    "cursor never reached {}",
                    credential.character_name
                )));
            }
            suspension.checkpoint().await?;
            self.send_key(Key::Down).await?;
            let (space, layout) = (&self.space, self.widget_layout);
            wait_until(suspension, self.timings.cursor_step, || {
                Widget::read(space, layout, selected.address).is_ok_and(|w| w.text != selected.text)
            })
            .await
            .into_result(|| AppError::Screen("cannot move the character cursor".into()))?;
            steps += 1;
        }

        self.send_key(Key::Enter).await?;
        let schedule = self.timings.enter_world;
        wait_until(suspension, schedule, || self.is_in_game())
            .await
            .into_result(|| AppError::Screen("entering the world timed out".into()))?;
        self.wait_character_name(suspension).await?;
        Ok(())
    }

    async fn wait_character_name(&mut self, suspension: &Suspension) -> Result<String> {
        let mut name = None;
        let schedule = self.timings.player_name;
        let outcome = wait_until(suspension, schedule, || {
            self.view.reset().ok();
            name = self.character_name().ok().flatten();
            name.is_some()
        })
        .await;
        match (outcome, name) {
            (WaitOutcome::Satisfied, Some(name)) => Ok(name),
            (WaitOutcome::Cancelled, _) => Err(AppError::Cancelled),
            _ => Err(AppError::Screen("character name not visible in the world".into())),
        }
    }

    async fn wait_dialog_clear(&mut self, suspension: &Suspension) -> Result<()> {
        let schedule = self.timings.dialog_clear;
        wait_until(suspension, schedule, || {
            !self.is_connecting_or_loading() && !self.is_glue_dialog_visible().unwrap_or(true)
        })
        .await
        .into_result(|| AppError::Screen("connection timed out".into()))
    }
}
