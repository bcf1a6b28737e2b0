//! Decoded interpreter values.

use crate::memory::AbsoluteAddress;

/// Interpreter type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaType {
    /// `nil`
    Nil,
    /// `true` / `false`
    Boolean,
    /// Raw host pointer; UI objects are marked by one.
    LightUserData,
    /// Double-precision number.
    Number,
    /// Interned string.
    String,
    /// Table.
    Table,
    /// Function (opaque).
    Function,
    /// Full userdata (opaque).
    UserData,
    /// Coroutine (opaque).
    Thread,
    /// Key of a removed entry still linked in a chain.
    DeadKey,
}

impl LuaType {
    /// Map a raw tag; unknown tags yield `None`.
    #[must_use]
    pub fn from_tag(tag: i32) -> Option<Self> {
        Some(match tag {
            0 => Self::Nil,
            1 => Self::Boolean,
            2 => Self::LightUserData,
            3 => Self::Number,
            4 => Self::String,
            5 => Self::Table,
            6 => Self::Function,
            7 => Self::UserData,
            8 => Self::Thread,
            11 => Self::DeadKey,
            _ => return None,
        })
    }

    /// The raw tag.
    #[must_use]
    pub fn tag(self) -> i32 {
        match self {
            Self::Nil => 0,
            Self::Boolean => 1,
            Self::LightUserData => 2,
            Self::Number => 3,
            Self::String => 4,
            Self::Table => 5,
            Self::Function => 6,
            Self::UserData => 7,
            Self::Thread => 8,
            Self::DeadKey => 11,
        }
    }
}

/// A tagged value read out of a table node. Reference types are kept as
/// addresses; strings are decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum TValue {
    /// `nil`
    Nil,
    /// Boolean.
    Boolean(bool),
    /// Light userdata pointer.
    LightUserData(AbsoluteAddress),
    /// Number.
    Number(f64),
    /// Decoded string.
    String(String),
    /// Table header address.
    Table(AbsoluteAddress),
    /// Function object address.
    Function(AbsoluteAddress),
    /// Userdata object address.
    UserData(AbsoluteAddress),
    /// Thread object address.
    Thread(AbsoluteAddress),
    /// Dead key marker.
    DeadKey,
    /// Tag outside the known set.
    Unknown(i32),
}

impl TValue {
    /// Type of this value, if known.
    #[must_use]
    pub fn lua_type(&self) -> Option<LuaType> {
        Some(match self {
            Self::Nil => LuaType::Nil,
            Self::Boolean(_) => LuaType::Boolean,
            Self::LightUserData(_) => LuaType::LightUserData,
            Self::Number(_) => LuaType::Number,
            Self::String(_) => LuaType::String,
            Self::Table(_) => LuaType::Table,
            Self::Function(_) => LuaType::Function,
            Self::UserData(_) => LuaType::UserData,
            Self::Thread(_) => LuaType::Thread,
            Self::DeadKey => LuaType::DeadKey,
            Self::Unknown(_) => return None,
        })
    }

    /// `true` for `nil`.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// String payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Table address, if any.
    #[must_use]
    pub fn as_table(&self) -> Option<AbsoluteAddress> {
        match self {
            Self::Table(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Number payload, if any.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Light userdata pointer, if any.
    #[must_use]
    pub fn as_light_user_data(&self) -> Option<AbsoluteAddress> {
        match self {
            Self::LightUserData(addr) => Some(*addr),
            _ => None,
        }
    }
}
