//! Target client binding.
//!
//! [`TargetClient`] attaches to one running client process, locates its
//! static variables by signature, and exposes the handful of facts the
//! orchestrator needs: which screen is up, which widget has focus, what the
//! login dialog says, who is logged in. It also drives the client through
//! an [`InputInjector`]; the multi-step login and logout sequences live in
//! [`login`].

pub mod login;
pub mod patterns;
pub mod state;
pub mod widgets;

use std::fmt::{Display, Formatter};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::interpreter::{InterpreterView, TValue, TableLayout};
use crate::memory::{AbsoluteAddress, AddressSpace, PointerWidth, Signature};
use crate::platform::{InputInjector, Key, Platform};
use crate::suspend::{wait_until, PollSchedule, Suspension, WaitOutcome};
use crate::{AppError, Result};

use self::patterns::{SignatureSet, OPERAND_OFFSET};
use self::state::{GlueState, LoginResult, Screen};
use self::widgets::{
    realm_from_caption, Widget, WidgetLayout, ACCOUNT_EDIT, CHARACTER_CREATE, CHAR_SELECT_REALM,
    GLUE_DIALOG_TEXT, GLUE_DIALOG_TITLE, PLAYER_NAME, REALM_LIST,
};

/// Global the realm name is copied into after entering the world.
pub const REALM_GLOBAL: &str = "realm";

/// Tab presses tried while looking for an edit box.
const MAX_FOCUS_HOPS: usize = 10;

// ── Settings ──────────────────────────────────────────────────────────────────

/// Poll schedules and pauses used while driving the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimings {
    /// Retry a widget lookup that hit a read fault.
    pub widget_lookup: PollSchedule,
    /// Wait for the globals table to stop growing.
    pub globals_settle: PollSchedule,
    /// Wait for the login form to appear.
    pub login_form: PollSchedule,
    /// Wait for a glue dialog to go away.
    pub dialog_clear: PollSchedule,
    /// Wait for character creation to close.
    pub creation_exit: PollSchedule,
    /// Wait for the character cursor to move after one key press.
    pub cursor_step: PollSchedule,
    /// Wait for the world to load.
    pub enter_world: PollSchedule,
    /// Wait for the player name plate.
    pub player_name: PollSchedule,
    /// Wait for the character list after `/logout`.
    pub character_select: PollSchedule,
    /// Wait for an edit box to reflect typed or cleared text.
    pub text_check: PollSchedule,
    /// Wait for focus to move after Tab.
    pub focus_step: PollSchedule,
    /// Wait for the chat input to open or close.
    pub chat_toggle: PollSchedule,
    /// Wait for a `/run` result to land in the globals table.
    pub script_result: PollSchedule,
    /// Wait for the realm list to open.
    pub realm_list: PollSchedule,
    /// Wait for the authenticator prompt after the password is accepted.
    pub token_prompt: PollSchedule,
    /// Pause after each Escape while clearing stale dialogs.
    pub dialog_dismiss: Duration,
    /// Pause after logging out before trusting the glue dialog.
    pub after_logout: Duration,
    /// Pause after a successful edit or chat line.
    pub input_settle: Duration,
    /// Pause once in the world before reporting success.
    pub world_settle: Duration,
}

impl Default for ClientTimings {
    fn default() -> Self {
        Self {
            widget_lookup: PollSchedule::from_millis(1_000, 100),
            globals_settle: PollSchedule::from_millis(60_000, 500),
            login_form: PollSchedule::from_millis(60_000, 500),
            dialog_clear: PollSchedule::from_millis(60_000, 100),
            creation_exit: PollSchedule::from_millis(30_000, 100),
            cursor_step: PollSchedule::from_millis(500, 100),
            enter_world: PollSchedule::from_millis(120_000, 100),
            player_name: PollSchedule::from_millis(60_000, 300),
            character_select: PollSchedule::from_millis(30_000, 100),
            text_check: PollSchedule::from_millis(500, 50),
            focus_step: PollSchedule::from_millis(100, 10),
            chat_toggle: PollSchedule::from_millis(300, 25),
            script_result: PollSchedule::from_millis(1_000, 100),
            realm_list: PollSchedule::from_millis(10_000, 100),
            token_prompt: PollSchedule::from_millis(30_000, 100),
            dialog_dismiss: Duration::from_millis(500),
            after_logout: Duration::from_secs(2),
            input_settle: Duration::from_millis(100),
            world_settle: Duration::from_secs(1),
        }
    }
}

/// Everything needed to attach to a client build.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Static variable signatures.
    pub signatures: SignatureSet,
    /// Interpreter table layout.
    pub table_layout: TableLayout,
    /// Native UI object layout.
    pub widget_layout: WidgetLayout,
    /// Target pointer width.
    pub pointer_width: PointerWidth,
    /// Signature scan retry schedule.
    pub scan: PollSchedule,
    /// Flow timings.
    pub timings: ClientTimings,
}

impl ClientSettings {
    /// Default layouts and timings around `signatures`.
    #[must_use]
    pub fn new(signatures: SignatureSet) -> Self {
        Self {
            signatures,
            table_layout: TableLayout::default(),
            widget_layout: WidgetLayout::default(),
            pointer_width: PointerWidth::default(),
            scan: PollSchedule::from_millis(60_000, 500),
            timings: ClientTimings::default(),
        }
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// Who a client is logged in as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    /// Character name.
    pub character: String,
    /// Realm name.
    pub realm: String,
}

impl Identity {
    /// Build an identity.
    #[must_use]
    pub fn new(character: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            character: character.into(),
            realm: realm.into(),
        }
    }

    /// Parse a `Character-Realm` key. Character names never contain `-`, so
    /// the first one separates the parts.
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        let (character, realm) = key.split_once('-')?;
        let (character, realm) = (character.trim(), realm.trim());
        if character.is_empty() || realm.is_empty() {
            return None;
        }
        Some(Self::new(character, realm))
    }

    /// Same character on the same realm.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.character == other.character && self.realm == other.realm
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.character, self.realm)
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// An attached client process.
pub struct TargetClient {
    space: AddressSpace,
    view: InterpreterView,
    input: Arc<dyn InputInjector>,
    widget_layout: WidgetLayout,
    timings: ClientTimings,
    game_state: AbsoluteAddress,
    focused_slot: AbsoluteAddress,
    loading_count: AbsoluteAddress,
    glue_state: AbsoluteAddress,
    realm: Option<String>,
}

impl std::fmt::Debug for TargetClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetClient")
            .field("pid", &self.space.pid())
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}

impl TargetClient {
    /// Attach to `pid`: open its memory, resolve every signature and, when
    /// the client sits on the login screen, wait until the form is usable.
    ///
    /// # Errors
    ///
    /// - [`AppError::ProcessUnavailable`] if the process cannot be opened;
    /// - [`AppError::PatternNotFound`] if a signature never matches;
    /// - [`AppError::AttachTimeout`] if the login form never settles;
    /// - [`AppError::Screen`] while the client is patching itself;
    /// - [`AppError::Cancelled`].
    pub async fn attach(
        pid: u32,
        platform: &dyn Platform,
        settings: &ClientSettings,
        suspension: &Suspension,
    ) -> Result<Self> {
        let source = platform.open_memory(pid)?;
        let space = AddressSpace::attach(source, settings.pointer_width)?;
        let signatures = &settings.signatures;

        let state_slot =
            locate(&space, &signatures.interpreter_state, settings.scan, suspension).await?;
        let game_state = locate(&space, &signatures.game_state, settings.scan, suspension).await?;
        let focused_slot =
            locate(&space, &signatures.focused_widget, settings.scan, suspension).await?;
        let loading_count =
            locate(&space, &signatures.loading_screen, settings.scan, suspension).await?;
        let glue_state = locate(&space, &signatures.glue_state, settings.scan, suspension).await?;

        let mut client = Self {
            view: InterpreterView::new(space.clone(), settings.table_layout, state_slot),
            space,
            input: platform.input(pid),
            widget_layout: settings.widget_layout,
            timings: settings.timings,
            game_state,
            focused_slot,
            loading_count,
            glue_state,
            realm: None,
        };
        info!(pid, "attached to target client");

        match client.glue_state()? {
            GlueState::Updater => {
                return Err(AppError::Screen(format!("client {pid} is updating")));
            }
            GlueState::Disconnected if !client.is_in_game() && !client.is_connecting_or_loading() => {
                client.wait_globals_init(suspension).await?;
                client.wait_login_form(suspension).await?;
            }
            _ => {}
        }
        Ok(client)
    }

    /// Target process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.space.pid()
    }

    /// The attached address space.
    #[must_use]
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// Realm recorded when the world was last entered.
    #[must_use]
    pub fn cached_realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    // ── State ────────────────────────────────────────────────────────────────

    /// In the world with no loading screen up. Read faults count as `false`.
    #[must_use]
    pub fn is_in_game(&self) -> bool {
        let flag = self.space.read::<u8>(self.game_state, 0);
        let loading = self.space.read::<i32>(self.loading_count, 0);
        matches!((flag, loading), (Ok(1), Ok(0)))
    }

    /// Connecting to a server or showing a loading screen.
    #[must_use]
    pub fn is_connecting_or_loading(&self) -> bool {
        matches!(self.space.read::<u8>(self.game_state, 1), Ok(1))
    }

    /// Current glue screen state.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn glue_state(&self) -> Result<GlueState> {
        Ok(GlueState::from_raw(self.space.read::<i32>(self.glue_state, 0)?))
    }

    /// Coarse screen classification.
    pub fn screen(&mut self) -> Screen {
        if self.is_in_game() {
            return Screen::InGame;
        }
        if self.is_connecting_or_loading() {
            return Screen::Loading;
        }
        match self.glue_state() {
            Ok(GlueState::Disconnected) => Screen::Login,
            Ok(GlueState::Updater) => Screen::Updater,
            Ok(GlueState::CharacterSelection) => Screen::CharacterSelection,
            Ok(GlueState::CharacterCreation) => Screen::CharacterCreation,
            Ok(GlueState::ServerSelection | GlueState::RegionalSelection) => Screen::RealmSelection,
            _ => Screen::Unknown,
        }
    }

    /// Login form up and accepting input.
    pub fn is_login_form_displayed(&mut self) -> bool {
        if self.is_in_game() || self.is_connecting_or_loading() {
            return false;
        }
        if !matches!(self.glue_state(), Ok(GlueState::Disconnected)) {
            return false;
        }
        matches!(self.widget_now(ACCOUNT_EDIT), Ok(Some(w)) if w.is_displayed())
    }

    /// Character list up with no dialog over it.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn is_character_selection(&mut self) -> Result<bool> {
        if self.is_in_game() || self.is_connecting_or_loading() {
            return Ok(false);
        }
        if self.glue_state()? != GlueState::CharacterSelection {
            return Ok(false);
        }
        Ok(self.widget_now(GLUE_DIALOG_TEXT)?.is_some_and(|w| !w.visible))
    }

    /// Character creation up.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn is_character_creation(&mut self) -> Result<bool> {
        if self.is_in_game() || self.is_connecting_or_loading() {
            return Ok(false);
        }
        if self.glue_state()? != GlueState::CharacterCreation {
            return Ok(false);
        }
        Ok(self.widget_now(CHARACTER_CREATE)?.is_some_and(|w| w.visible))
    }

    /// Realm list up.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn is_realm_selection(&mut self) -> Result<bool> {
        if self.is_in_game() || self.is_connecting_or_loading() {
            return Ok(false);
        }
        if self.glue_state()? != GlueState::ServerSelection {
            return Ok(false);
        }
        Ok(self.widget_now(REALM_LIST)?.is_some_and(|w| w.visible))
    }

    /// A glue dialog (connecting, error, queue) is showing.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn is_glue_dialog_visible(&mut self) -> Result<bool> {
        if self.is_in_game() || self.is_connecting_or_loading() {
            return Ok(false);
        }
        Ok(self.widget_now(GLUE_DIALOG_TEXT)?.is_some_and(|w| w.visible))
    }

    /// Text of the glue dialog title while one is showing.
    pub fn dialog_title(&mut self) -> Option<String> {
        match self.widget_now(GLUE_DIALOG_TITLE) {
            Ok(Some(title)) if title.visible => Some(title.text),
            _ => None,
        }
    }

    /// Outcome shown in the glue dialog title.
    pub fn login_result(&mut self) -> LoginResult {
        match self.widget_now(GLUE_DIALOG_TITLE) {
            Ok(Some(title)) if title.visible => LoginResult::from_dialog_title(Some(&title.text)),
            Ok(_) => LoginResult::NoResult,
            Err(err) => {
                debug!(pid = self.pid(), %err, "could not read dialog title");
                LoginResult::Unknown
            }
        }
    }

    // ── Widgets ──────────────────────────────────────────────────────────────

    /// Look a widget up by global name, once.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn widget_now(&mut self, name: &str) -> Result<Option<Widget>> {
        let Some(TValue::Table(table)) = self.view.lookup(name)? else {
            return Ok(None);
        };
        let table = self.view.table(table)?;
        let Some(address) = Widget::address_of(&table)? else {
            return Ok(None);
        };
        Widget::read(&self.space, self.widget_layout, address).map(Some)
    }

    /// Look a widget up by global name, re-resolving the globals table and
    /// retrying while reads fault. A widget that is simply absent is reported
    /// at once.
    ///
    /// # Errors
    ///
    /// [`AppError::Cancelled`].
    pub async fn widget(&mut self, name: &str, suspension: &Suspension) -> Result<Option<Widget>> {
        match self.widget_now(name) {
            Ok(found) => return Ok(found),
            Err(err) => debug!(pid = self.pid(), name, %err, "widget lookup faulted; retrying"),
        }
        let mut found = None;
        let outcome = wait_until(suspension, self.timings.widget_lookup, || {
            self.view.reset().ok();
            match self.widget_now(name) {
                Ok(widget) => {
                    found = widget;
                    true
                }
                Err(_) => false,
            }
        })
        .await;
        if outcome == WaitOutcome::Cancelled {
            return Err(AppError::Cancelled);
        }
        Ok(found)
    }

    /// Every named widget reachable from the globals table.
    ///
    /// # Errors
    ///
    /// Propagates faults resolving the globals table; individual widgets
    /// that fail to decode are skipped.
    pub fn widgets(&mut self) -> Result<Vec<Widget>> {
        let globals = self.view.reset()?.clone();
        let mut found = Vec::new();
        for node in globals.nodes() {
            let Ok(node) = node else { break };
            let Some(table) = node.value.as_table() else {
                continue;
            };
            let Ok(table) = self.view.table(table) else {
                continue;
            };
            if let Ok(Some(address)) = Widget::address_of(&table) {
                if let Ok(widget) = Widget::read(&self.space, self.widget_layout, address) {
                    found.push(widget);
                }
            }
        }
        Ok(found)
    }

    /// The widget holding keyboard focus.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn focused_widget(&self) -> Result<Option<Widget>> {
        let address = self.space.deref_at(self.focused_slot, 0)?;
        if address.is_null() {
            return Ok(None);
        }
        Widget::read(&self.space, self.widget_layout, address).map(Some)
    }

    /// Active characters on the character list, in list order.
    ///
    /// # Errors
    ///
    /// As [`widgets`](Self::widgets).
    pub fn active_character_names(&mut self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .widgets()?
            .iter()
            .filter_map(Widget::active_character_name)
            .map(str::to_owned)
            .collect();
        names.dedup();
        Ok(names)
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    /// Player name plate text while in the world.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn character_name(&mut self) -> Result<Option<String>> {
        if !self.is_in_game() {
            return Ok(None);
        }
        Ok(self
            .widget_now(PLAYER_NAME)?
            .map(|w| w.text)
            .filter(|text| !text.is_empty()))
    }

    /// Realm name: the recorded global while in the world, the list caption
    /// on the character list.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn realm(&mut self) -> Result<Option<String>> {
        if self.is_in_game() {
            return Ok(self
                .view
                .global_string(REALM_GLOBAL)?
                .filter(|realm| !realm.is_empty()));
        }
        if self.is_character_selection()? {
            return Ok(self
                .widget_now(CHAR_SELECT_REALM)?
                .map(|w| realm_from_caption(&w.text)));
        }
        Ok(None)
    }

    /// Who is logged in, if anyone.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn identity(&mut self) -> Result<Option<Identity>> {
        let Some(character) = self.character_name()? else {
            return Ok(None);
        };
        let realm = match self.realm()? {
            Some(realm) => realm,
            None => match &self.realm {
                Some(realm) => realm.clone(),
                None => return Ok(None),
            },
        };
        Ok(Some(Identity { character, realm }))
    }

    // ── Input ────────────────────────────────────────────────────────────────

    /// Press one key.
    ///
    /// # Errors
    ///
    /// Injection failure.
    pub async fn send_key(&self, key: Key) -> Result<()> {
        self.input.send_key(key).await
    }

    /// Click the middle of `widget`.
    ///
    /// # Errors
    ///
    /// [`AppError::Screen`] if the widget has no on-screen area; injection
    /// failure.
    pub async fn click(&self, widget: &Widget) -> Result<()> {
        let Some((x, y)) = widget.rect.center() else {
            return Err(AppError::Screen(format!("{} has no on-screen area", widget.name)));
        };
        debug!(pid = self.pid(), widget = %widget.name, x, y, "click");
        self.input.click_at(x, y).await
    }

    /// Type `text`. Runs of control characters are sent as key presses
    /// (`\t` Tab, `\n`/`\r` Enter, `\x08` Backspace); everything else is
    /// pasted.
    ///
    /// # Errors
    ///
    /// Injection failure.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        for (plain, controls) in split_control_runs(text) {
            if !plain.is_empty() {
                self.input.send_string(plain).await?;
            }
            for ch in controls.chars() {
                let key = match ch {
                    '\t' => Key::Tab,
                    '\x08' => Key::Backspace,
                    _ => Key::Enter,
                };
                self.input.send_key(key).await?;
            }
        }
        Ok(())
    }

    /// Replace the contents of edit box `name` with `text` and verify it.
    ///
    /// # Errors
    ///
    /// - [`AppError::Screen`] if the box is missing, disabled, cannot be
    ///   focused, or does not show the expected text afterwards;
    /// - injection failures and [`AppError::Cancelled`].
    pub async fn type_into(&mut self, name: &str, text: &str, suspension: &Suspension) -> Result<()> {
        let Some(edit) = self.widget(name, suspension).await? else {
            return Err(AppError::Screen(format!("edit box {name} not found")));
        };
        if !edit.visible || !edit.enabled {
            return Err(AppError::Screen(format!("edit box {name} is not usable")));
        }
        if edit.text == text {
            return Ok(());
        }

        let focused = self
            .focused_widget()?
            .is_some_and(|w| w.address == edit.address);
        if !focused && !self.focus_edit_box(name, suspension).await? {
            return Err(AppError::Screen(format!("cannot focus edit box {name}")));
        }

        if !edit.text.is_empty() {
            self.input.send_key_combination(Key::A, &[Key::Control]).await?;
            self.input.send_key(Key::Delete).await?;
        }
        self.wait_text(edit.address, str::is_empty, suspension)
            .await
            .into_result(|| AppError::Screen(format!("cannot clear edit box {name}")))?;

        self.send_text(text).await?;
        self.wait_text(edit.address, |current| current == text, suspension)
            .await
            .into_result(|| AppError::Screen(format!("text verification failed for {name}")))?;

        suspension.sleep(self.timings.input_settle).await
    }

    /// Tab through edit boxes until `name` has focus.
    ///
    /// # Errors
    ///
    /// Injection failures and [`AppError::Cancelled`].
    pub async fn focus_edit_box(&mut self, name: &str, suspension: &Suspension) -> Result<bool> {
        let current = self.focused_widget()?;
        if current.as_ref().is_some_and(|w| w.name == name) {
            return Ok(true);
        }
        let mut seen: Vec<AbsoluteAddress> = current.iter().map(|w| w.address).collect();
        for _ in 0..MAX_FOCUS_HOPS {
            let Some(next) = self.next_edit_box(suspension).await? else {
                break;
            };
            if next.name == name {
                return Ok(true);
            }
            if seen.contains(&next.address) {
                break;
            }
            seen.push(next.address);
        }
        Ok(false)
    }

    async fn next_edit_box(&mut self, suspension: &Suspension) -> Result<Option<Widget>> {
        let before = self.focused_widget()?.map(|w| w.address);
        self.input.send_key(Key::Tab).await?;
        let mut moved = None;
        let outcome = wait_until(suspension, self.timings.focus_step, || {
            match self.focused_widget() {
                Ok(Some(w)) if Some(w.address) != before => {
                    moved = Some(w);
                    true
                }
                _ => false,
            }
        })
        .await;
        if outcome == WaitOutcome::Cancelled {
            return Err(AppError::Cancelled);
        }
        Ok(moved)
    }

    /// Whether a chat input box has focus.
    #[must_use]
    pub fn is_chat_open(&self) -> bool {
        matches!(self.focused_widget(), Ok(Some(w)) if w.is_chat_edit_box())
    }

    /// Send one chat line (slash commands included).
    ///
    /// # Errors
    ///
    /// - [`AppError::Screen`] when not in the world or the chat box does not
    ///   open and close as expected;
    /// - typing errors and [`AppError::Cancelled`].
    pub async fn send_chat(&mut self, line: &str, suspension: &Suspension) -> Result<()> {
        if !self.is_in_game() {
            return Err(AppError::Screen("cannot chat outside the world".into()));
        }
        let toggle = self.timings.chat_toggle;

        if !self.is_chat_open() {
            self.input.send_key(Key::Enter).await?;
            if !wait_until(suspension, toggle, || self.is_chat_open()).await.is_satisfied() {
                suspension.checkpoint().await?;
                // a full-screen frame may be swallowing Enter
                self.input.send_key(Key::Escape).await?;
                self.input.send_key(Key::Enter).await?;
                wait_until(suspension, toggle, || self.is_chat_open())
                    .await
                    .into_result(|| AppError::Screen("cannot open the chat input".into()))?;
            }
        }

        let Some(edit) = self.focused_widget()? else {
            return Err(AppError::Screen("chat input lost focus".into()));
        };
        self.type_into(&edit.name, line, suspension).await?;

        self.input.send_key(Key::Enter).await?;
        wait_until(suspension, toggle, || !self.is_chat_open())
            .await
            .into_result(|| AppError::Screen("chat input did not close".into()))?;
        suspension.sleep(self.timings.input_settle).await
    }

    /// Evaluate `expression` in the client and read its string value back
    /// through global `variable`.
    ///
    /// # Errors
    ///
    /// Chat errors, or [`AppError::Screen`] if the global never appears.
    pub async fn script_result(
        &mut self,
        expression: &str,
        variable: &str,
        suspension: &Suspension,
    ) -> Result<String> {
        let command = format!("/run _G['{variable}'] = tostring({expression})");
        self.send_chat(&command, suspension).await?;

        let mut value = None;
        wait_until(suspension, self.timings.script_result, || {
            self.view.reset().ok();
            match self.view.global_string(variable) {
                Ok(Some(found)) => {
                    value = Some(found);
                    true
                }
                _ => false,
            }
        })
        .await
        .into_result(|| AppError::Screen(format!("global {variable} was never set")))?;
        value.ok_or_else(|| AppError::Screen(format!("global {variable} was never set")))
    }

    // ── Internal waits ───────────────────────────────────────────────────────

    async fn wait_text<F>(&self, address: AbsoluteAddress, accept: F, suspension: &Suspension) -> WaitOutcome
    where
        F: Fn(&str) -> bool,
    {
        wait_until(suspension, self.timings.text_check, || {
            Widget::read(&self.space, self.widget_layout, address).is_ok_and(|w| accept(&w.text))
        })
        .await
    }

    /// Wait until the globals table has a non-zero weight that stays the
    /// same across two consecutive polls.
    pub(crate) async fn wait_globals_init(&mut self, suspension: &Suspension) -> Result<()> {
        let mut previous = 0u64;
        wait_until(suspension, self.timings.globals_settle, || {
            let weight = self.view.weight().unwrap_or(0);
            if weight == 0 {
                return false;
            }
            let settled = weight == previous;
            previous = weight;
            settled
        })
        .await
        .into_result(|| AppError::AttachTimeout("interpreter globals never settled".into()))
    }

    pub(crate) async fn wait_login_form(&mut self, suspension: &Suspension) -> Result<()> {
        wait_until(suspension, self.timings.login_form, || {
            self.view.reset().ok();
            self.is_login_form_displayed()
        })
        .await
        .into_result(|| AppError::AttachTimeout("login form never appeared".into()))
    }
}

async fn locate(
    space: &AddressSpace,
    signature: &Signature,
    scan: PollSchedule,
    suspension: &Suspension,
) -> Result<AbsoluteAddress> {
    let matched = space.find_pattern_until(signature, scan, suspension).await?;
    space.deref_at(matched, OPERAND_OFFSET)
}

/// Split `text` into (plain, control) run pairs.
fn split_control_runs(text: &str) -> Vec<(&str, &str)> {
    static RUNS: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(runs) = RUNS
        .get_or_init(|| Regex::new(r"([^\t\x08\n\r]*)([\t\x08\n\r]*)").ok())
        .as_ref()
    else {
        return vec![(text, "")];
    };
    runs.captures_iter(text)
        .filter_map(|caps| {
            let plain = caps.get(1).map_or("", |m| m.as_str());
            let controls = caps.get(2).map_or("", |m| m.as_str());
            (!plain.is_empty() || !controls.is_empty()).then_some((plain, controls))
        })
        .collect()
}
