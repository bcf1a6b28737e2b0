//! Read-only projection of the target's embedded Lua 5.1 interpreter.
//!
//! The interpreter keeps its globals in a hash table with chained collision
//! nodes. [`LuaTable`] decodes one such table straight out of target memory;
//! [`InterpreterView`] resolves the globals table from the interpreter state
//! pointer and re-resolves it on demand, because the target reallocates the
//! table as it grows.

pub mod layout;
pub mod table;
pub mod value;
pub mod view;

pub use layout::TableLayout;
pub use table::{lua_string_hash, LuaTable, TableNode};
pub use value::{LuaType, TValue};
pub use view::InterpreterView;
