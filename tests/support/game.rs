//! A scripted game client living in a synthetic image.
//!
//! [`FakeGame`] renders its screen state into memory the way the real client
//! lays it out (static slots found by signature, an interpreter globals table
//! naming UI frames, native frame objects) and reacts to injected input.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fenix::client::patterns;
use fenix::client::widgets::{
    ACCOUNT_EDIT, CHANGE_REALM_BUTTON, CHARACTER_CREATE, CHAR_SELECT_NAME, CHAR_SELECT_REALM,
    GLUE_DIALOG_TEXT, GLUE_DIALOG_TITLE, PASSWORD_EDIT, PLAYER_NAME, REALM_LIST, REALM_SCROLL_DOWN,
    TOKEN_EDIT,
};
use fenix::credentials::Authenticator;
use fenix::interpreter::TableLayout;
use fenix::memory::{MemorySource, Region};
use fenix::platform::{InputFuture, InputInjector, Key, LaunchSpec, NoInput, Platform};
use fenix::{AppError, Result};

use super::memory::{Heap, Image, TableModel, Value, HEAP_BASE, HEAP_SIZE};

pub const CODE_BASE: u64 = 0x0040_0000;
pub const STATICS_BASE: u64 = 0x0050_0000;
pub const STATE_SLOT: u64 = STATICS_BASE;
pub const GAME_STATE_ADDR: u64 = STATICS_BASE + 0x10;
pub const FOCUSED_SLOT: u64 = STATICS_BASE + 0x20;
pub const LOADING_COUNT_ADDR: u64 = STATICS_BASE + 0x30;
pub const GLUE_STATE_ADDR: u64 = STATICS_BASE + 0x40;
pub const WIDGET_BASE: u64 = 0x0070_0000;

const WIDGET_SLOT: u64 = 0x400;
const WIDGET_NAME: u64 = 0x100;
const WIDGET_TEXT: u64 = 0x200;
const SHOWN: u32 = 7;

pub const CHAT_EDIT: &str = "ChatFrame1EditBox";

const ACCOUNT: usize = 0;
const PASSWORD: usize = 1;
const DIALOG_TEXT: usize = 2;
const DIALOG_TITLE: usize = 3;
const REALM_CAPTION: usize = 4;
const SELECTED: usize = 5;
const CREATE: usize = 6;
const REALMS: usize = 7;
const PLAYER: usize = 8;
const CHAT: usize = 9;
const CHANGE_REALM: usize = 10;
const SCROLL_DOWN: usize = 11;
const TOKEN: usize = 12;
const REALM_ROWS: usize = 13;
/// Realm list rows visible at once.
pub const VISIBLE_REALMS: usize = 2;
const BUTTONS: usize = REALM_ROWS + VISIBLE_REALMS;

const FIXED_WIDGETS: [&str; REALM_ROWS] = [
    ACCOUNT_EDIT,
    PASSWORD_EDIT,
    GLUE_DIALOG_TEXT,
    GLUE_DIALOG_TITLE,
    CHAR_SELECT_REALM,
    CHAR_SELECT_NAME,
    CHARACTER_CREATE,
    REALM_LIST,
    PLAYER_NAME,
    CHAT_EDIT,
    CHANGE_REALM_BUTTON,
    REALM_SCROLL_DOWN,
    TOKEN_EDIT,
];

/// Address of the native object for widget slot `index`.
pub fn widget_address(index: usize) -> u64 {
    WIDGET_BASE + index as u64 * WIDGET_SLOT
}

/// Lay the five static-variable signatures out in a code segment, each
/// operand pointing at its slot in the statics segment.
pub fn write_code(image: &mut Image) {
    let entries = [
        (patterns::INTERPRETER_STATE, STATE_SLOT),
        (patterns::GAME_STATE, GAME_STATE_ADDR),
        (patterns::FOCUSED_WIDGET, FOCUSED_SLOT),
        (patterns::LOADING_SCREEN, LOADING_COUNT_ADDR),
        (patterns::GLUE_STATE, GLUE_STATE_ADDR),
    ];
    let mut code = vec![0x90; 16];
    for (text, target) in entries {
        let start = code.len();
        for token in text.split_whitespace() {
            code.push(if token.starts_with('?') {
                0
            } else {
                u8::from_str_radix(token, 16).expect("hex byte")
            });
        }
        let operand = u32::try_from(target).unwrap().to_le_bytes();
        code[start + 2..start + 6].copy_from_slice(&operand);
        code.extend([0x90; 16]);
    }
    image.map(CODE_BASE, 0x1000);
    image.write(CODE_BASE, &code);
}

/// Screen-space bounds of widget slot `index`: one 18-pixel row each.
pub fn widget_rect(index: usize) -> (f32, f32, f32, f32) {
    let top = f32::from(u16::try_from(index * 20).unwrap());
    (0.0, top, 100.0, top + 18.0)
}

/// What the client knows about its account.
#[derive(Debug, Clone)]
pub struct GameSpec {
    pub login: String,
    pub password: String,
    /// Realm the characters live on.
    pub realm: String,
    pub realm_caption: String,
    pub characters: Vec<String>,
    /// Every realm on the realm list, in list order.
    pub realms: Vec<String>,
    /// Realm the character list shows first; `realm` when `None`.
    pub start_realm: Option<String>,
    /// Hex secret of the account's authenticator.
    pub authenticator: Option<String>,
    /// Dialog left up after a correct password instead of connecting.
    pub stall_dialog: Option<String>,
}

impl Default for GameSpec {
    fn default() -> Self {
        Self {
            login: super::LOGIN.into(),
            password: super::PASSWORD.into(),
            realm: super::REALM.into(),
            realm_caption: format!("{} (PvE)", super::REALM),
            characters: vec!["Thrall".into(), "Jaina".into()],
            realms: vec![
                "Aerie Peak".into(),
                "Argent Dawn".into(),
                "Nordrassil".into(),
                super::REALM.into(),
            ],
            start_realm: None,
            authenticator: None,
            stall_dialog: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeScreen {
    Login,
    TokenPrompt,
    RealmList,
    CharacterSelect,
    InWorld,
}

#[derive(Debug)]
struct GameState {
    screen: FakeScreen,
    account: String,
    password: String,
    chat: String,
    focus: Option<usize>,
    select_all: bool,
    dialog: Option<String>,
    cursor: usize,
    realm: String,
    realm_scroll: usize,
    highlighted: Option<usize>,
    token: String,
    globals: BTreeMap<String, String>,
    chat_log: Vec<String>,
    keys: Vec<Key>,
    clicks: Vec<String>,
}

/// A client process driven through its input and read through its memory.
pub struct FakeGame {
    pid: u32,
    spec: GameSpec,
    alive: AtomicBool,
    state: Mutex<GameState>,
    image: Mutex<Image>,
}

impl FakeGame {
    /// A client sitting on the login form.
    pub fn new(pid: u32, spec: GameSpec) -> Self {
        let mut image = Image::new();
        write_code(&mut image);
        image.map(STATICS_BASE, 0x100);
        image.map(HEAP_BASE, HEAP_SIZE);
        let slots = BUTTONS + spec.characters.len();
        image.map(WIDGET_BASE, slots * usize::try_from(WIDGET_SLOT).unwrap());
        let realm = spec.start_realm.clone().unwrap_or_else(|| spec.realm.clone());

        let game = Self {
            pid,
            spec,
            alive: AtomicBool::new(true),
            state: Mutex::new(GameState {
                screen: FakeScreen::Login,
                account: String::new(),
                password: String::new(),
                chat: String::new(),
                focus: Some(ACCOUNT),
                select_all: false,
                dialog: None,
                cursor: 0,
                realm,
                realm_scroll: 0,
                highlighted: None,
                token: String::new(),
                globals: BTreeMap::new(),
                chat_log: Vec::new(),
                keys: Vec::new(),
                clicks: Vec::new(),
            }),
            image: Mutex::new(image),
        };
        game.render(&game.state());
        game
    }

    /// A client already in the world as character `cursor`.
    pub fn in_world(pid: u32, spec: GameSpec, cursor: usize) -> Self {
        let game = Self::new(pid, spec);
        {
            let mut state = game.state();
            state.screen = FakeScreen::InWorld;
            state.cursor = cursor;
            state.focus = None;
            state.realm.clone_from(&game.spec.realm);
            state
                .globals
                .insert(fenix::client::REALM_GLOBAL.into(), game.spec.realm.clone());
            game.render(&state);
        }
        game
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn screen(&self) -> FakeScreen {
        self.state().screen
    }

    pub fn character(&self) -> Option<String> {
        let state = self.state();
        (state.screen == FakeScreen::InWorld).then(|| self.spec.characters[state.cursor].clone())
    }

    pub fn cursor(&self) -> usize {
        self.state().cursor
    }

    pub fn global(&self, name: &str) -> Option<String> {
        self.state().globals.get(name).cloned()
    }

    pub fn chat_log(&self) -> Vec<String> {
        self.state().chat_log.clone()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.state().keys.clone()
    }

    /// Names of the widgets clicked, in order.
    pub fn clicks(&self) -> Vec<String> {
        self.state().clicks.clone()
    }

    /// Realm the character list is showing.
    pub fn listed_realm(&self) -> String {
        self.state().realm.clone()
    }

    /// Put a glue dialog up with `title`.
    pub fn show_dialog(&self, title: &str) {
        let mut state = self.state();
        state.dialog = Some(title.to_owned());
        self.render(&state);
    }

    fn state(&self) -> MutexGuard<'_, GameState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&Self, &mut GameState)) {
        let mut state = self.state();
        f(self, &mut state);
        self.render(&state);
    }

    // ── Input ─────────────────────────────────────────────────────────────────

    fn press(&self, state: &mut GameState, key: Key) {
        state.keys.push(key);
        match state.screen {
            FakeScreen::Login => self.press_login(state, key),
            FakeScreen::TokenPrompt => self.press_token(state, key),
            FakeScreen::RealmList => {
                if key == Key::Escape {
                    state.screen = FakeScreen::CharacterSelect;
                }
            }
            FakeScreen::CharacterSelect => self.press_character_select(state, key),
            FakeScreen::InWorld => self.press_world(state, key),
        }
    }

    fn press_token(&self, state: &mut GameState, key: Key) {
        match key {
            Key::Enter => {
                let token = std::mem::take(&mut state.token);
                if self.token_accepted(&token) {
                    state.screen = FakeScreen::CharacterSelect;
                    state.focus = None;
                } else {
                    state.screen = FakeScreen::Login;
                    state.dialog = Some("Error 104".into());
                    state.password.clear();
                    state.focus = Some(PASSWORD);
                }
            }
            Key::Escape => {
                state.token.clear();
                state.screen = FakeScreen::Login;
                state.focus = Some(ACCOUNT);
            }
            Key::Delete | Key::Backspace => edit_text(state, key),
            _ => {}
        }
    }

    fn token_accepted(&self, token: &str) -> bool {
        let Some(secret) = &self.spec.authenticator else {
            return false;
        };
        let authenticator = Authenticator::new("fake", secret).unwrap();
        let now = chrono::Utc::now().timestamp();
        [now, now - 30]
            .into_iter()
            .any(|at| authenticator.code_at(at).unwrap() == token)
    }

    fn click(&self, state: &mut GameState, x: i32, y: i32) {
        let names = self.widget_names();
        let hit = (0..names.len()).find(|&index| {
            let (left, top, right, bottom) = widget_rect(index);
            let (x, y) = (f64::from(x), f64::from(y));
            self.widget_view(state, index).0
                && (f64::from(left)..f64::from(right)).contains(&x)
                && (f64::from(top)..f64::from(bottom)).contains(&y)
        });
        let Some(index) = hit else { return };
        state.clicks.push(names[index].clone());
        match (state.screen, index) {
            (FakeScreen::CharacterSelect, CHANGE_REALM) => {
                state.screen = FakeScreen::RealmList;
                state.realm_scroll = 0;
                state.highlighted = None;
            }
            (FakeScreen::RealmList, SCROLL_DOWN) => {
                if state.realm_scroll + VISIBLE_REALMS < self.spec.realms.len() {
                    state.realm_scroll += 1;
                }
            }
            (FakeScreen::RealmList, row) if (REALM_ROWS..BUTTONS).contains(&row) => {
                let picked = state.realm_scroll + row - REALM_ROWS;
                if state.highlighted == Some(picked) {
                    state.realm.clone_from(&self.spec.realms[picked]);
                    state.screen = FakeScreen::CharacterSelect;
                    state.cursor = 0;
                } else {
                    state.highlighted = Some(picked);
                }
            }
            _ => {}
        }
    }

    fn press_login(&self, state: &mut GameState, key: Key) {
        if state.dialog.is_some() {
            if matches!(key, Key::Escape | Key::Enter) {
                state.dialog = None;
            }
            return;
        }
        match key {
            Key::Tab => {
                state.focus = Some(if state.focus == Some(ACCOUNT) { PASSWORD } else { ACCOUNT });
            }
            Key::Enter => {
                if state.account == self.spec.login && state.password == self.spec.password {
                    if let Some(title) = &self.spec.stall_dialog {
                        state.dialog = Some(title.clone());
                    } else if self.spec.authenticator.is_some() {
                        state.screen = FakeScreen::TokenPrompt;
                        state.focus = Some(TOKEN);
                    } else {
                        state.screen = FakeScreen::CharacterSelect;
                        state.focus = None;
                    }
                } else {
                    state.dialog = Some("Error 104".into());
                    state.password.clear();
                    state.focus = Some(PASSWORD);
                }
            }
            Key::Delete | Key::Backspace => edit_text(state, key),
            _ => {}
        }
    }

    fn press_character_select(&self, state: &mut GameState, key: Key) {
        let count = self.spec.characters.len();
        match key {
            Key::Down => state.cursor = (state.cursor + 1) % count,
            Key::Up => state.cursor = (state.cursor + count - 1) % count,
            Key::Enter if self.on_home_realm(state) => {
                state.screen = FakeScreen::InWorld;
                state.focus = None;
            }
            Key::Escape => {
                state.screen = FakeScreen::Login;
                state.password.clear();
                state.focus = Some(ACCOUNT);
            }
            _ => {}
        }
    }

    fn press_world(&self, state: &mut GameState, key: Key) {
        let chat_open = state.focus == Some(CHAT);
        match key {
            Key::Enter if chat_open => {
                let line = std::mem::take(&mut state.chat);
                state.focus = None;
                self.execute(state, &line);
            }
            Key::Enter => state.focus = Some(CHAT),
            Key::Escape if chat_open => {
                state.chat.clear();
                state.focus = None;
            }
            Key::Delete | Key::Backspace => edit_text(state, key),
            _ => {}
        }
    }

    fn execute(&self, state: &mut GameState, line: &str) {
        state.chat_log.push(line.to_owned());
        if line == "/logout" {
            state.screen = FakeScreen::CharacterSelect;
            state.globals.clear();
            return;
        }
        let Some(rest) = line.strip_prefix("/run _G['") else {
            return;
        };
        let Some((name, expression)) = rest.split_once("'] = tostring(") else {
            return;
        };
        let expression = expression.strip_suffix(')').unwrap_or(expression);
        let value = match expression {
            "GetRealmName()" => state.realm.clone(),
            "UnitName('player')" => self.spec.characters[state.cursor].clone(),
            other => other.to_owned(),
        };
        state.globals.insert(name.to_owned(), value);
    }

    // ── Rendering ─────────────────────────────────────────────────────────────

    fn on_home_realm(&self, state: &GameState) -> bool {
        state.realm == self.spec.realm
    }

    fn widget_names(&self) -> Vec<String> {
        let rows = (1..=VISIBLE_REALMS).map(|i| format!("RealmListRealmButton{i}"));
        let buttons = (1..=self.spec.characters.len())
            .map(|i| format!("CharSelectCharacterButton{i}ButtonTextName"));
        FIXED_WIDGETS
            .iter()
            .map(|name| (*name).to_owned())
            .chain(rows)
            .chain(buttons)
            .collect()
    }

    fn widget_view(&self, state: &GameState, index: usize) -> (bool, String) {
        let login = state.screen == FakeScreen::Login;
        let select = state.screen == FakeScreen::CharacterSelect;
        let realm_list = state.screen == FakeScreen::RealmList;
        let world = state.screen == FakeScreen::InWorld;
        let glue = !world;
        let home = self.on_home_realm(state);
        let dialog = state.dialog.as_deref().filter(|_| glue);
        let current = self.spec.characters[state.cursor].clone();
        match index {
            ACCOUNT => (login, state.account.clone()),
            PASSWORD => (login, state.password.clone()),
            DIALOG_TEXT => (dialog.is_some(), dialog.map(|_| "Login failed".to_owned()).unwrap_or_default()),
            DIALOG_TITLE => (dialog.is_some(), dialog.unwrap_or_default().to_owned()),
            REALM_CAPTION => {
                let caption = if home {
                    self.spec.realm_caption.clone()
                } else {
                    format!("{} (PvP)", state.realm)
                };
                (select, caption)
            }
            SELECTED => (select && home, if home { current } else { String::new() }),
            CREATE => (false, String::new()),
            REALMS | SCROLL_DOWN => (realm_list, String::new()),
            PLAYER => (world, if world { current } else { String::new() }),
            CHAT => (world && state.focus == Some(CHAT), state.chat.clone()),
            CHANGE_REALM => (select, "Change Realm".into()),
            TOKEN => (state.screen == FakeScreen::TokenPrompt, state.token.clone()),
            row if row < BUTTONS => {
                let name = self.spec.realms.get(state.realm_scroll + row - REALM_ROWS);
                (realm_list && name.is_some(), name.cloned().unwrap_or_default())
            }
            button => (select && home, self.spec.characters[button - BUTTONS].clone()),
        }
    }

    fn render(&self, state: &GameState) {
        let mut image = self.image.lock().unwrap_or_else(PoisonError::into_inner);
        let world = state.screen == FakeScreen::InWorld;
        image.write(GAME_STATE_ADDR, &[u8::from(world), 0]);
        image.write_i32(LOADING_COUNT_ADDR, 0);
        let glue_state = match state.screen {
            FakeScreen::CharacterSelect => 2,
            FakeScreen::RealmList => 6,
            _ => 0,
        };
        image.write_i32(GLUE_STATE_ADDR, glue_state);
        let focused = state.focus.map_or(0, widget_address);
        image.write_u32(FOCUSED_SLOT, u32::try_from(focused).unwrap());

        let names = self.widget_names();
        for (index, name) in names.iter().enumerate() {
            let (shown, text) = self.widget_view(state, index);
            let address = widget_address(index);
            image.write(address, &[0; WIDGET_SLOT as usize]);
            image.write_u32(address + 0x1c, u32::try_from(address + WIDGET_NAME).unwrap());
            image.write_u32(address + 0x68, if shown { SHOWN } else { 0 });
            let (left, top, right, bottom) = widget_rect(index);
            for (edge, value) in [left, top, right, bottom].into_iter().enumerate() {
                image.write(address + 0x40 + u64::try_from(edge).unwrap() * 4, &value.to_le_bytes());
            }
            image.write_u32(address + 0x9c, u32::try_from(address + WIDGET_TEXT).unwrap());
            image.write(address + WIDGET_NAME, name.as_bytes());
            image.write(address + WIDGET_TEXT, text.as_bytes());
        }

        image.clear(HEAP_BASE);
        let mut heap = Heap::new(&mut image, HEAP_BASE, HEAP_SIZE, TableLayout::default());
        let lua_state = heap.alloc(0x60);
        let mut globals = TableModel::new(8);
        for (index, name) in names.iter().enumerate() {
            let mut frame = TableModel::new(0);
            frame.insert_number(0.0, Value::LightUserData(widget_address(index)));
            let frame = heap.table(&frame);
            assert!(globals.insert(name, Value::Table(frame)));
        }
        globals.insert("GetRealmName", Value::Function(CODE_BASE + 0x800));
        globals.insert("UIParentScale", Value::Number(1.0));
        for (name, value) in &state.globals {
            globals.insert(name, Value::Str(value.clone()));
        }
        let root = heap.table(&globals);
        let image = heap.image();
        image.write_u32(lua_state + 0x50, u32::try_from(root).unwrap());
        image.write_u32(STATE_SLOT, u32::try_from(lua_state).unwrap());
    }
}

fn edit_text(state: &mut GameState, key: Key) {
    let Some(field) = state.focus else { return };
    let text = match field {
        ACCOUNT => &mut state.account,
        PASSWORD => &mut state.password,
        CHAT => &mut state.chat,
        TOKEN => &mut state.token,
        _ => return,
    };
    if state.select_all {
        text.clear();
        state.select_all = false;
    } else if key == Key::Backspace {
        text.pop();
    }
}

impl MemorySource for FakeGame {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn regions(&self) -> io::Result<Vec<Region>> {
        Ok(self.image.lock().unwrap_or_else(PoisonError::into_inner).regions())
    }

    fn read_at(&self, address: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.image
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read(address, buf)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl InputInjector for FakeGame {
    fn send_key(&self, key: Key) -> InputFuture<'_> {
        self.update(|game, state| game.press(state, key));
        Box::pin(std::future::ready(Ok(())))
    }

    fn send_key_combination<'a>(&'a self, key: Key, modifiers: &'a [Key]) -> InputFuture<'a> {
        self.update(|game, state| {
            if key == Key::A && modifiers.contains(&Key::Control) {
                state.keys.push(key);
                state.select_all = true;
            } else {
                game.press(state, key);
            }
        });
        Box::pin(std::future::ready(Ok(())))
    }

    fn send_string<'a>(&'a self, text: &'a str) -> InputFuture<'a> {
        self.update(|_, state| {
            state.select_all = false;
            match state.focus {
                Some(ACCOUNT) if state.screen == FakeScreen::Login => state.account.push_str(text),
                Some(PASSWORD) if state.screen == FakeScreen::Login => state.password.push_str(text),
                Some(CHAT) => state.chat.push_str(text),
                Some(TOKEN) if state.screen == FakeScreen::TokenPrompt => state.token.push_str(text),
                _ => {}
            }
        });
        Box::pin(std::future::ready(Ok(())))
    }

    fn click_at(&self, x: i32, y: i32) -> InputFuture<'_> {
        self.update(|game, state| game.click(state, x, y));
        Box::pin(std::future::ready(Ok(())))
    }
}

// ── Platform ──────────────────────────────────────────────────────────────────

/// Launches [`FakeGame`]s instead of processes.
pub struct FakePlatform {
    spec: GameSpec,
    next_pid: AtomicU32,
    games: Mutex<BTreeMap<u32, Arc<FakeGame>>>,
    launches: Mutex<Vec<LaunchSpec>>,
}

impl FakePlatform {
    pub fn new(spec: GameSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            next_pid: AtomicU32::new(4000),
            games: Mutex::new(BTreeMap::new()),
            launches: Mutex::new(Vec::new()),
        })
    }

    /// Register a client that is already running.
    pub fn insert(&self, make: impl FnOnce(u32, GameSpec) -> FakeGame) -> Arc<FakeGame> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let game = Arc::new(make(pid, self.spec.clone()));
        self.games().insert(pid, Arc::clone(&game));
        game
    }

    pub fn game(&self, pid: u32) -> Option<Arc<FakeGame>> {
        self.games().get(&pid).cloned()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn games(&self) -> MutexGuard<'_, BTreeMap<u32, Arc<FakeGame>>> {
        self.games.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self, pid: u32) -> Option<Arc<FakeGame>> {
        self.game(pid).filter(|game| game.is_alive())
    }
}

impl Platform for FakePlatform {
    fn launch(&self, spec: &LaunchSpec) -> Result<u32> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.clone());
        Ok(self.insert(FakeGame::new).pid())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.live(pid).is_some()
    }

    fn has_main_window(&self, pid: u32) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(std::future::ready(self.is_alive(pid)))
    }

    fn close_main_window(&self, pid: u32) -> Result<()> {
        self.kill(pid)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        if let Some(game) = self.game(pid) {
            game.kill();
        }
        Ok(())
    }

    fn open_memory(&self, pid: u32) -> Result<Arc<dyn MemorySource>> {
        let game = self
            .live(pid)
            .ok_or_else(|| AppError::ProcessUnavailable(format!("pid {pid} is not running")))?;
        let source: Arc<dyn MemorySource> = game;
        Ok(source)
    }

    fn input(&self, pid: u32) -> Arc<dyn InputInjector> {
        match self.game(pid) {
            Some(game) => {
                let input: Arc<dyn InputInjector> = game;
                input
            }
            None => Arc::new(NoInput),
        }
    }
}
