//! Read-only projection of the client's UI objects.
//!
//! Every named frame is exposed to the interpreter as a global table whose
//! first light-userdata entry points at the native object. The native object
//! carries a pointer to its name, a flag word and (for font strings and edit
//! boxes) a pointer to its text.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::interpreter::LuaTable;
use crate::memory::{AbsoluteAddress, AddressSpace};
use crate::Result;

/// Account name edit box on the login form.
pub const ACCOUNT_EDIT: &str = "AccountLoginAccountEdit";
/// Password edit box on the login form.
pub const PASSWORD_EDIT: &str = "AccountLoginPasswordEdit";
/// Body of the glue dialog.
pub const GLUE_DIALOG_TEXT: &str = "GlueDialogText";
/// Title of the glue dialog; carries the login failure code.
pub const GLUE_DIALOG_TITLE: &str = "GlueDialogTitle";
/// Realm caption on the character list, e.g. `"Stormrage (PvE)"`.
pub const CHAR_SELECT_REALM: &str = "CharSelectRealmName";
/// Name of the highlighted character on the character list.
pub const CHAR_SELECT_NAME: &str = "CharSelectCharacterName";
/// Character creation root frame.
pub const CHARACTER_CREATE: &str = "CharacterCreateFrame";
/// Realm list frame.
pub const REALM_LIST: &str = "RealmList";
/// Button on the character list that opens the realm list.
pub const CHANGE_REALM_BUTTON: &str = "CharSelectChangeRealmButton";
/// Scrolls the realm list one row down.
pub const REALM_SCROLL_DOWN: &str = "RealmListScrollFrameScrollBarScrollDownButton";
/// Authenticator code edit box shown after the password is accepted.
pub const TOKEN_EDIT: &str = "TokenEnterDialogBackgroundEdit";
/// In-world player name plate.
pub const PLAYER_NAME: &str = "PlayerName";

/// Native object field offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WidgetLayout {
    /// Pointer to the NUL-terminated object name.
    pub name: u64,
    /// 32-bit flag word.
    pub flags: u64,
    /// Flag bit: the object and all its parents are shown.
    pub visible_mask: u32,
    /// Flag bit: the object itself is shown.
    pub shown_mask: u32,
    /// Flag bit: the object accepts input.
    pub enabled_mask: u32,
    /// Pointer to the NUL-terminated display text.
    pub text: u64,
    /// Screen rectangle: four `f32` window pixels (left, top, right, bottom).
    pub rect: u64,
    /// Longest name or text read.
    pub max_text: usize,
}

impl Default for WidgetLayout {
    fn default() -> Self {
        Self {
            name: 0x1c,
            flags: 0x68,
            visible_mask: 0x1,
            shown_mask: 0x2,
            enabled_mask: 0x4,
            text: 0x9c,
            rect: 0x40,
            max_text: 1024,
        }
    }
}

/// Window-pixel bounds of a UI object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub left: i32,
    /// Top edge.
    pub top: i32,
    /// Right edge.
    pub right: i32,
    /// Bottom edge.
    pub bottom: i32,
}

impl Rect {
    fn read(space: &AddressSpace, address: AbsoluteAddress, offset: u64) -> Result<Self> {
        let edge = |index: u64| -> Result<i32> {
            Ok(to_pixel(space.read::<f32>(address, offset + index * 4)?))
        };
        Ok(Self {
            left: edge(0)?,
            top: edge(1)?,
            right: edge(2)?,
            bottom: edge(3)?,
        })
    }

    /// Middle point, or `None` for an empty rectangle.
    #[must_use]
    pub fn center(self) -> Option<(i32, i32)> {
        (self.right > self.left && self.bottom > self.top).then(|| {
            (
                self.left + (self.right - self.left) / 2,
                self.top + (self.bottom - self.top) / 2,
            )
        })
    }

    /// Whether `(x, y)` lies inside.
    #[must_use]
    pub fn contains(self, x: i32, y: i32) -> bool {
        (self.left..self.right).contains(&x) && (self.top..self.bottom).contains(&y)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_pixel(value: f32) -> i32 {
    if value.is_finite() {
        // `as` saturates at the i32 bounds
        value.round() as i32
    } else {
        0
    }
}

/// Snapshot of one UI object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Widget {
    /// Native object address.
    pub address: AbsoluteAddress,
    /// Global name; empty for anonymous objects.
    pub name: String,
    /// Effectively visible.
    pub visible: bool,
    /// Shown flag of the object itself.
    pub shown: bool,
    /// Accepts input.
    pub enabled: bool,
    /// Display text; empty when the object has none.
    pub text: String,
    /// Where the object is drawn.
    pub rect: Rect,
}

impl Widget {
    /// Decode the object at `address`.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn read(space: &AddressSpace, layout: WidgetLayout, address: AbsoluteAddress) -> Result<Self> {
        let flags: u32 = space.read(address, layout.flags)?;
        let name = read_pointed_string(space, address, layout.name, layout.max_text)?;
        let text = read_pointed_string(space, address, layout.text, layout.max_text)?;
        let rect = Rect::read(space, address, layout.rect)?;
        Ok(Self {
            address,
            name,
            visible: flags & layout.visible_mask != 0,
            shown: flags & layout.shown_mask != 0,
            enabled: flags & layout.enabled_mask != 0,
            text,
            rect,
        })
    }

    /// The native object behind a global frame table, if it is one.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn address_of(table: &LuaTable) -> Result<Option<AbsoluteAddress>> {
        Ok(table
            .light_user_data()?
            .and_then(|node| node.value.as_light_user_data())
            .filter(|address| !address.is_null()))
    }

    /// Shown on screen and shown itself.
    #[must_use]
    pub fn is_displayed(&self) -> bool {
        self.visible && self.shown
    }

    /// Whether this is a chat input box (`ChatFrame<N>EditBox`).
    #[must_use]
    pub fn is_chat_edit_box(&self) -> bool {
        static CHAT: OnceLock<Option<Regex>> = OnceLock::new();
        CHAT.get_or_init(|| Regex::new(r"^ChatFrame\d+EditBox$").ok())
            .as_ref()
            .is_some_and(|re| re.is_match(&self.name))
    }

    /// The character name if this is an active entry of the character list.
    ///
    /// Inactive characters are rendered with colour escapes, so only plain
    /// word text counts.
    #[must_use]
    pub fn active_character_name(&self) -> Option<&str> {
        static BUTTON: OnceLock<Option<Regex>> = OnceLock::new();
        static WORD: OnceLock<Option<Regex>> = OnceLock::new();
        let button = BUTTON
            .get_or_init(|| Regex::new(r"^CharSelectCharacterButton\d+ButtonTextName").ok())
            .as_ref()?;
        let word = WORD.get_or_init(|| Regex::new(r"^\w+$").ok()).as_ref()?;
        if !self.visible || !button.is_match(&self.name) || !word.is_match(&self.text) {
            return None;
        }
        self.text.split(' ').next()
    }

    /// Whether this is the displayed realm list row for `realm`.
    #[must_use]
    pub fn is_realm_entry(&self, realm: &str) -> bool {
        static ROW: OnceLock<Option<Regex>> = OnceLock::new();
        self.is_displayed()
            && self.text == realm
            && ROW
                .get_or_init(|| Regex::new(r"^RealmListRealmButton\d+$").ok())
                .as_ref()
                .is_some_and(|re| re.is_match(&self.name))
    }
}

fn read_pointed_string(
    space: &AddressSpace,
    address: AbsoluteAddress,
    offset: u64,
    max_len: usize,
) -> Result<String> {
    let target = space.deref_at(address, offset)?;
    if target.is_null() {
        return Ok(String::new());
    }
    space.read_c_string(target, max_len)
}

/// `"Stormrage (PvE)"` → `"Stormrage"`.
#[must_use]
pub fn realm_from_caption(caption: &str) -> String {
    caption.split('(').next().unwrap_or_default().trim_end().to_owned()
}
