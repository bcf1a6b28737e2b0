//! Address newtypes.

use std::fmt::{Display, Formatter};

/// Identity of one [`AddressSpace`](super::AddressSpace) attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceId(pub(crate) u64);

/// An offset relative to the start of a scanned buffer, before it has been
/// anchored to a region base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelativeAddress(pub u64);

/// A resolved pointer value inside a specific target's address space.
///
/// Only an [`AddressSpace`](super::AddressSpace) can mint one; reading
/// through a different space fails with `StaleHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbsoluteAddress {
    space: SpaceId,
    value: u64,
}

impl AbsoluteAddress {
    pub(crate) fn new(space: SpaceId, value: u64) -> Self {
        Self { space, value }
    }

    /// The raw pointer value.
    #[must_use]
    pub fn value(self) -> u64 {
        self.value
    }

    /// The space this address belongs to.
    #[must_use]
    pub fn space(self) -> SpaceId {
        self.space
    }

    /// Whether the pointer is null.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.value == 0
    }

    /// Anchor a relative offset at this address.
    #[must_use]
    pub fn add(self, relative: RelativeAddress) -> Self {
        self.offset(relative.0)
    }

    /// Same space, value advanced by `offset` (wrapping).
    #[must_use]
    pub fn offset(self, offset: u64) -> Self {
        Self {
            space: self.space,
            value: self.value.wrapping_add(offset),
        }
    }
}

impl Display for AbsoluteAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.value)
    }
}
