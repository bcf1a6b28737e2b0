//! Globals-table resolution for one attached target.

use tracing::debug;

use crate::memory::{AbsoluteAddress, AddressSpace};
use crate::{AppError, Result};

use super::layout::TableLayout;
use super::table::LuaTable;
use super::value::TValue;

/// Cached view of the interpreter's globals table.
///
/// `state_slot` is the static variable holding the interpreter state pointer.
/// The globals table hangs off that state and moves whenever the target
/// rehashes it, so callers [`reset`](Self::reset) after any action that may
/// change interpreter state.
#[derive(Debug, Clone)]
pub struct InterpreterView {
    space: AddressSpace,
    layout: TableLayout,
    state_slot: AbsoluteAddress,
    globals: Option<LuaTable>,
}

impl InterpreterView {
    /// Build a view; nothing is read until first use.
    #[must_use]
    pub fn new(space: AddressSpace, layout: TableLayout, state_slot: AbsoluteAddress) -> Self {
        Self {
            space,
            layout,
            state_slot,
            globals: None,
        }
    }

    /// The address space this view reads through.
    #[must_use]
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// Structure layout in use.
    #[must_use]
    pub fn layout(&self) -> TableLayout {
        self.layout
    }

    /// Current interpreter state pointer.
    ///
    /// # Errors
    ///
    /// [`AppError::ReadFault`] while the interpreter is not yet created.
    pub fn state(&self) -> Result<AbsoluteAddress> {
        let state = self.space.deref_at(self.state_slot, 0)?;
        if state.is_null() {
            return Err(AppError::ReadFault("interpreter state not initialised".into()));
        }
        Ok(state)
    }

    /// Re-resolve the globals table from the state pointer.
    ///
    /// # Errors
    ///
    /// Propagates read faults; the cached table is dropped either way.
    pub fn reset(&mut self) -> Result<&LuaTable> {
        self.globals = None;
        let state = self.state()?;
        let root = self.space.deref_at(state, self.layout.state_globals)?;
        let table = LuaTable::read(&self.space, self.layout, root)?;
        debug!(pid = self.space.pid(), globals = %root, nodes = table.node_count(), "resolved globals");
        let table: &LuaTable = self.globals.insert(table);
        Ok(table)
    }

    /// The cached globals table, resolving it first if needed.
    ///
    /// # Errors
    ///
    /// As [`reset`](Self::reset).
    pub fn globals(&mut self) -> Result<&LuaTable> {
        if self.globals.is_none() {
            return self.reset();
        }
        self.globals
            .as_ref()
            .ok_or_else(|| AppError::ReadFault("globals table unavailable".into()))
    }

    /// Look up a global by name.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn lookup(&mut self, key: &str) -> Result<Option<TValue>> {
        self.globals()?.get(key)
    }

    /// Look up a global and return it only if it is a string.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn global_string(&mut self, key: &str) -> Result<Option<String>> {
        Ok(match self.lookup(key)? {
            Some(TValue::String(s)) => Some(s),
            _ => None,
        })
    }

    /// Decode the table at `address` with this view's layout.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn table(&self, address: AbsoluteAddress) -> Result<LuaTable> {
        LuaTable::read(&self.space, self.layout, address)
    }

    /// Fresh weight of the globals table (see [`LuaTable::weight`]).
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn weight(&mut self) -> Result<u64> {
        self.reset()?.weight()
    }
}
