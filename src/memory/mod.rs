//! Live-process memory introspection.
//!
//! [`AddressSpace`] wraps a [`MemorySource`] for one external process and
//! offers signature scanning, typed reads and pointer dereferencing. Every
//! [`AbsoluteAddress`] it hands out carries the id of the space that minted
//! it, so addresses cannot leak between processes.

pub mod address;
pub mod signature;
pub mod source;
pub mod space;

pub use address::{AbsoluteAddress, RelativeAddress, SpaceId};
pub use signature::Signature;
pub use source::{MemorySource, Region};
pub use space::{AddressSpace, PointerWidth, Readable};
