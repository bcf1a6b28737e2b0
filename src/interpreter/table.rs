//! Decoding of one foreign hash table.

use crate::memory::{AbsoluteAddress, AddressSpace};
use crate::{AppError, Result};

use super::layout::TableLayout;
use super::value::{LuaType, TValue};

/// Largest `log2` node count accepted before a header is considered corrupt.
const MAX_LOG2_SIZE: u8 = 26;

/// Hash a string the way the interpreter does when interning it.
///
/// Long strings are sampled: only every `(len >> 5) + 1`-th byte, walking
/// backwards from the end, contributes.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn lua_string_hash(s: &str) -> u32 {
    let bytes = s.as_bytes();
    let len = bytes.len();
    // The interpreter seeds with the length truncated to its unsigned int.
    let mut h = len as u32;
    let step = (len >> 5) + 1;
    let mut i = len;
    while i >= step {
        h ^= (h << 5)
            .wrapping_add(h >> 2)
            .wrapping_add(u32::from(bytes[i - 1]));
        i -= step;
    }
    h
}

/// One decoded node slot.
#[derive(Debug, Clone, PartialEq)]
pub struct TableNode {
    /// Address of the node itself.
    pub address: AbsoluteAddress,
    /// Decoded key.
    pub key: TValue,
    /// Decoded value.
    pub value: TValue,
    /// Next node in the collision chain, if any.
    pub next: Option<AbsoluteAddress>,
}

impl TableNode {
    /// Whether the slot holds a real entry (neither an empty slot, a dead key,
    /// nor a nil value).
    #[must_use]
    pub fn is_live(&self) -> bool {
        !matches!(self.key, TValue::Nil | TValue::DeadKey) && !self.value.is_nil()
    }
}

/// A table header read from target memory. Nodes are read lazily.
#[derive(Debug, Clone)]
pub struct LuaTable {
    space: AddressSpace,
    layout: TableLayout,
    address: AbsoluteAddress,
    flags: u8,
    log2_size: u8,
    metatable: AbsoluteAddress,
    node: AbsoluteAddress,
    size_array: u32,
}

impl LuaTable {
    /// Read the table header at `address`.
    ///
    /// # Errors
    ///
    /// [`AppError::ReadFault`] for a null pointer, an unreadable header or an
    /// implausible node count; [`AppError::StaleHandle`] if the process exited.
    pub fn read(space: &AddressSpace, layout: TableLayout, address: AbsoluteAddress) -> Result<Self> {
        if address.is_null() {
            return Err(AppError::ReadFault("null table pointer".into()));
        }

        let flags = space.read::<u8>(address, layout.table_flags)?;
        let log2_size = space.read::<u8>(address, layout.table_log2_size)?;
        if log2_size > MAX_LOG2_SIZE {
            return Err(AppError::ReadFault(format!(
                "table at {address} reports 2^{log2_size} nodes"
            )));
        }
        let metatable = space.deref_at(address, layout.table_metatable)?;
        let node = space.deref_at(address, layout.table_node)?;
        let size_array = space.read::<u32>(address, layout.table_size_array)?;

        Ok(Self {
            space: space.clone(),
            layout,
            address,
            flags,
            log2_size,
            metatable,
            node,
            size_array,
        })
    }

    /// Address of the header.
    #[must_use]
    pub fn address(&self) -> AbsoluteAddress {
        self.address
    }

    /// Metamethod-absence flag byte.
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Length of the array part.
    #[must_use]
    pub fn array_size(&self) -> u32 {
        self.size_array
    }

    /// Number of node slots (`1 << log2`), zero when there is no node part.
    #[must_use]
    pub fn node_count(&self) -> u64 {
        if self.node.is_null() {
            0
        } else {
            1u64 << self.log2_size
        }
    }

    /// Decode the node at `index` in the node array.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidArgument`] when `index` is out of range, otherwise
    /// as [`read_node`](Self::read_node).
    pub fn node_at(&self, index: u64) -> Result<TableNode> {
        if index >= self.node_count() {
            return Err(AppError::InvalidArgument(format!(
                "node index {index} outside table of {} nodes",
                self.node_count()
            )));
        }
        self.read_node(self.node.offset(index * self.layout.node_size))
    }

    /// Decode the node stored at `address`.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn read_node(&self, address: AbsoluteAddress) -> Result<TableNode> {
        let key = self.read_value(address, self.layout.node_key, self.layout.node_key_tag)?;
        let value = self.read_value(address, self.layout.node_value, self.layout.node_value_tag)?;
        let next = self.space.deref_at(address, self.layout.node_next)?;
        Ok(TableNode {
            address,
            key,
            value,
            next: (!next.is_null()).then_some(next),
        })
    }

    /// Look up a string key.
    ///
    /// Hashes `key`, starts at its main-position bucket and walks the
    /// collision chain. A key present with a nil value counts as absent.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn get(&self, key: &str) -> Result<Option<TValue>> {
        let count = self.node_count();
        if count == 0 {
            return Ok(None);
        }

        let bucket = u64::from(lua_string_hash(key)) & (count - 1);
        let mut cursor = Some(self.node.offset(bucket * self.layout.node_size));
        let mut steps = 0u64;

        while let Some(address) = cursor {
            if steps >= count {
                return Err(AppError::ReadFault(format!(
                    "collision chain in table {} does not terminate",
                    self.address
                )));
            }
            steps += 1;

            if self.key_equals(address, key)? {
                let value =
                    self.read_value(address, self.layout.node_value, self.layout.node_value_tag)?;
                return Ok((!value.is_nil()).then_some(value));
            }
            let next = self.space.deref_at(address, self.layout.node_next)?;
            cursor = (!next.is_null()).then_some(next);
        }
        Ok(None)
    }

    /// Lazy iterator over live nodes in slot order. Each call starts over.
    #[must_use]
    pub fn nodes(&self) -> Nodes<'_> {
        Nodes {
            table: self,
            index: 0,
        }
    }

    /// The metatable, when one is set.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn metatable(&self) -> Result<Option<Self>> {
        if self.metatable.is_null() {
            return Ok(None);
        }
        Self::read(&self.space, self.layout, self.metatable).map(Some)
    }

    /// First node whose value is a light userdata. UI object tables carry
    /// their native object pointer this way.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn light_user_data(&self) -> Result<Option<TableNode>> {
        for node in self.nodes() {
            let node = node?;
            if matches!(node.value, TValue::LightUserData(_)) {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Nodes holding string or table values, counting chain followers.
    /// Used to detect when a table has stopped growing.
    ///
    /// # Errors
    ///
    /// Propagates read faults.
    pub fn weight(&self) -> Result<u64> {
        let count = self.node_count();
        let mut weight = 0u64;

        for index in 0..count {
            let mut cursor = Some(self.node.offset(index * self.layout.node_size));
            let mut steps = 0u64;
            while let Some(address) = cursor {
                if steps >= count {
                    break;
                }
                steps += 1;
                let tag = self.space.read::<i32>(address, self.layout.node_value_tag)?;
                if matches!(
                    LuaType::from_tag(tag),
                    Some(LuaType::String | LuaType::Table)
                ) {
                    weight += 1;
                }
                let next = self.space.deref_at(address, self.layout.node_next)?;
                cursor = (!next.is_null()).then_some(next);
            }
        }
        Ok(weight)
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    fn key_equals(&self, node: AbsoluteAddress, key: &str) -> Result<bool> {
        let tag = self.space.read::<i32>(node, self.layout.node_key_tag)?;
        if LuaType::from_tag(tag) != Some(LuaType::String) {
            return Ok(false);
        }
        let string = self.space.deref_at(node, self.layout.node_key)?;
        let len = self.space.read::<u32>(string, self.layout.string_len)?;
        if u64::from(len) != key.len() as u64 {
            return Ok(false);
        }
        let bytes = self.space.read_bytes(string, self.layout.string_data, key.len())?;
        Ok(bytes == key.as_bytes())
    }

    fn read_value(&self, node: AbsoluteAddress, payload: u64, tag_offset: u64) -> Result<TValue> {
        let tag = self.space.read::<i32>(node, tag_offset)?;
        let Some(kind) = LuaType::from_tag(tag) else {
            return Ok(TValue::Unknown(tag));
        };

        Ok(match kind {
            LuaType::Nil => TValue::Nil,
            LuaType::DeadKey => TValue::DeadKey,
            LuaType::Boolean => TValue::Boolean(self.space.read::<i32>(node, payload)? != 0),
            LuaType::Number => TValue::Number(self.space.read::<f64>(node, payload)?),
            LuaType::String => {
                let string = self.space.deref_at(node, payload)?;
                TValue::String(self.read_string(string)?)
            }
            LuaType::LightUserData => TValue::LightUserData(self.space.deref_at(node, payload)?),
            LuaType::Table => TValue::Table(self.space.deref_at(node, payload)?),
            LuaType::Function => TValue::Function(self.space.deref_at(node, payload)?),
            LuaType::UserData => TValue::UserData(self.space.deref_at(node, payload)?),
            LuaType::Thread => TValue::Thread(self.space.deref_at(node, payload)?),
        })
    }

    fn read_string(&self, string: AbsoluteAddress) -> Result<String> {
        if string.is_null() {
            return Err(AppError::ReadFault("null string pointer".into()));
        }
        let len = self.space.read::<u32>(string, self.layout.string_len)?;
        if len > self.layout.max_string_len {
            return Err(AppError::ReadFault(format!(
                "string at {string} claims {len} bytes"
            )));
        }
        let len = usize::try_from(len)
            .map_err(|_| AppError::ReadFault(format!("string length {len} too large")))?;
        self.space.read_string(string, self.layout.string_data, len)
    }
}

/// Iterator returned by [`LuaTable::nodes`]. Stops after the first read
/// fault.
#[derive(Debug)]
pub struct Nodes<'a> {
    table: &'a LuaTable,
    index: u64,
}

impl Iterator for Nodes<'_> {
    type Item = Result<TableNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let count = self.table.node_count();
        while self.index < count {
            let index = self.index;
            self.index += 1;
            match self.table.node_at(index) {
                Ok(node) if node.is_live() => return Some(Ok(node)),
                Ok(_) => {}
                Err(err) => {
                    self.index = count;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}
