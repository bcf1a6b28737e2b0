//! Byte offsets of the interpreter's table, node and string structures.

use serde::Deserialize;

/// Structure offsets used to decode tables. Defaults describe the 32-bit
/// Lua 5.1 build embedded in the supported client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TableLayout {
    /// Offset of the globals table pointer inside the interpreter state.
    pub state_globals: u64,

    /// Table header: metamethod-absence flags byte.
    pub table_flags: u64,
    /// Table header: `log2` of the node array length (one byte).
    pub table_log2_size: u64,
    /// Table header: metatable pointer.
    pub table_metatable: u64,
    /// Table header: array-part pointer.
    pub table_array: u64,
    /// Table header: node-part pointer.
    pub table_node: u64,
    /// Table header: array-part length (`u32`).
    pub table_size_array: u64,

    /// Size of one node.
    pub node_size: u64,
    /// Node: value payload (8 bytes).
    pub node_value: u64,
    /// Node: value type tag (`i32`).
    pub node_value_tag: u64,
    /// Node: key payload (8 bytes).
    pub node_key: u64,
    /// Node: key type tag (`i32`).
    pub node_key_tag: u64,
    /// Node: pointer to the next node in the collision chain.
    pub node_next: u64,

    /// String header: byte length (`u32`).
    pub string_len: u64,
    /// String header size; characters follow.
    pub string_data: u64,
    /// Strings longer than this are treated as corrupt.
    pub max_string_len: u32,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            state_globals: 0x50,
            table_flags: 6,
            table_log2_size: 7,
            table_metatable: 8,
            table_array: 12,
            table_node: 16,
            table_size_array: 28,
            node_size: 32,
            node_value: 0,
            node_value_tag: 8,
            node_key: 16,
            node_key_tag: 24,
            node_next: 28,
            string_len: 12,
            string_data: 16,
            max_string_len: 64 * 1024,
        }
    }
}
