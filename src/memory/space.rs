//! Typed, fault-safe access to one external process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use super::address::{AbsoluteAddress, SpaceId};
use super::signature::Signature;
use super::source::{MemorySource, Region};
use crate::suspend::{wait_until, PollSchedule, Suspension, WaitOutcome};
use crate::{AppError, Result};

/// Signature scans read regions in chunks of at most this many bytes.
pub const SCAN_CHUNK_BYTES: u64 = 4 * 1024 * 1024;

/// Longest NUL-terminated string [`AddressSpace::read_c_string`] will follow.
pub const MAX_C_STRING: usize = 4096;

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Width of a pointer in the target process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum PointerWidth {
    /// 32-bit target.
    #[default]
    Four,
    /// 64-bit target.
    Eight,
}

impl PointerWidth {
    /// Size in bytes.
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }
}

impl TryFrom<u8> for PointerWidth {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            other => Err(format!("pointer width must be 4 or 8, got {other}")),
        }
    }
}

/// Plain values decodable from little-endian target memory.
pub trait Readable: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decode from exactly [`SIZE`](Self::SIZE) bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;
}

macro_rules! readable_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Readable for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

readable_int!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// A live attachment to one external process's memory.
///
/// Cloning is cheap and keeps the same [`SpaceId`], so addresses minted by
/// one clone are accepted by the others.
#[derive(Clone)]
pub struct AddressSpace {
    id: SpaceId,
    source: Arc<dyn MemorySource>,
    pointer_width: PointerWidth,
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("pid", &self.source.pid())
            .field("pointer_width", &self.pointer_width)
            .finish()
    }
}

impl AddressSpace {
    /// Attach to the process behind `source`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ProcessUnavailable`] if the process is not alive.
    pub fn attach(source: Arc<dyn MemorySource>, pointer_width: PointerWidth) -> Result<Self> {
        if !source.is_alive() {
            return Err(AppError::ProcessUnavailable(format!(
                "pid {} is not running",
                source.pid()
            )));
        }
        let id = SpaceId(NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed));
        debug!(pid = source.pid(), space = id.0, "attached address space");
        Ok(Self {
            id,
            source,
            pointer_width,
        })
    }

    /// This attachment's identity.
    #[must_use]
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Process id of the target.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.source.pid()
    }

    /// Configured pointer width.
    #[must_use]
    pub fn pointer_width(&self) -> PointerWidth {
        self.pointer_width
    }

    /// Whether the target is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.source.is_alive()
    }

    /// Mint an address in this space from a raw pointer value.
    #[must_use]
    pub fn address(&self, value: u64) -> AbsoluteAddress {
        AbsoluteAddress::new(self.id, value)
    }

    // ── Signature scanning ───────────────────────────────────────────────────

    /// Scan every readable region once for `signature`.
    ///
    /// # Errors
    ///
    /// - [`AppError::StaleHandle`] if the process has exited.
    /// - [`AppError::PatternNotFound`] if no region contains a match.
    pub fn find_pattern(&self, signature: &Signature) -> Result<AbsoluteAddress> {
        self.ensure_alive()?;
        let regions = self.source.regions().map_err(|err| {
            AppError::ReadFault(format!("cannot enumerate regions of pid {}: {err}", self.pid()))
        })?;

        for region in regions {
            if let Some(found) = self.scan_region(region, signature) {
                return Ok(found);
            }
        }

        if self.is_alive() {
            Err(AppError::PatternNotFound(signature.to_string()))
        } else {
            Err(self.stale())
        }
    }

    /// Repeat [`find_pattern`](Self::find_pattern) on `schedule` until it
    /// matches.
    ///
    /// # Errors
    ///
    /// - [`AppError::PatternNotFound`] when the schedule times out.
    /// - [`AppError::Cancelled`] when the suspension is cancelled.
    /// - [`AppError::StaleHandle`] as soon as the process exits.
    pub async fn find_pattern_until(
        &self,
        signature: &Signature,
        schedule: PollSchedule,
        suspension: &Suspension,
    ) -> Result<AbsoluteAddress> {
        let mut found: Option<Result<AbsoluteAddress>> = None;
        let outcome = wait_until(suspension, schedule, || match self.find_pattern(signature) {
            Err(AppError::PatternNotFound(_)) => false,
            result => {
                found = Some(result);
                true
            }
        })
        .await;

        match outcome {
            WaitOutcome::Satisfied => {
                found.unwrap_or_else(|| Err(AppError::PatternNotFound(signature.to_string())))
            }
            WaitOutcome::TimedOut => Err(AppError::PatternNotFound(signature.to_string())),
            WaitOutcome::Cancelled => Err(AppError::Cancelled),
        }
    }

    /// Scan one region in overlapping chunks; unreadable chunks are skipped.
    fn scan_region(&self, region: Region, signature: &Signature) -> Option<AbsoluteAddress> {
        let overlap = signature.len().saturating_sub(1) as u64;
        let mut offset = 0u64;
        let mut buf = Vec::new();

        while offset < region.size {
            let chunk = (region.size - offset).min(SCAN_CHUNK_BYTES);
            let chunk_base = region.base + offset;
            buf.resize(usize::try_from(chunk).ok()?, 0);

            match self.source.read_at(chunk_base, &mut buf) {
                Ok(read) => {
                    if let Some(hit) = signature.find_in(&buf[..read]) {
                        let found = self.address(chunk_base).add(hit);
                        info!(pid = self.pid(), address = %found, "signature matched");
                        return Some(found);
                    }
                }
                Err(err) => {
                    debug!(pid = self.pid(), base = chunk_base, %err, "skipping unreadable chunk");
                }
            }

            if chunk < region.size - offset {
                let advance = chunk.saturating_sub(overlap);
                offset += advance.max(1);
            } else {
                offset += chunk;
            }
        }
        None
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Read `len` raw bytes at `address + offset`.
    ///
    /// # Errors
    ///
    /// - [`AppError::StaleHandle`] for a foreign address or an exited process.
    /// - [`AppError::ReadFault`] for an overflowing offset, an unmapped page,
    ///   or a short read.
    pub fn read_bytes(&self, address: AbsoluteAddress, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_owned(address)?;
        let at = address.value().checked_add(offset).ok_or_else(|| {
            AppError::ReadFault(format!("offset {offset:#x} overflows address {address}"))
        })?;

        let mut buf = vec![0u8; len];
        match self.source.read_at(at, &mut buf) {
            Ok(read) if read == len => Ok(buf),
            Ok(read) => {
                self.ensure_alive()?;
                Err(AppError::ReadFault(format!(
                    "short read at {at:#x}: {read} of {len} bytes"
                )))
            }
            Err(err) => {
                self.ensure_alive()?;
                Err(AppError::ReadFault(format!("read at {at:#x} failed: {err}")))
            }
        }
    }

    /// Read a plain value at `address + offset`.
    ///
    /// # Errors
    ///
    /// As [`read_bytes`](Self::read_bytes).
    pub fn read<T: Readable>(&self, address: AbsoluteAddress, offset: u64) -> Result<T> {
        let bytes = self.read_bytes(address, offset, T::SIZE)?;
        Ok(T::from_le_slice(&bytes))
    }

    /// Read a pointer-sized value at `address + offset` and return it as an
    /// address in this space (the operand of a matched instruction, a struct
    /// field holding a pointer, and so on).
    ///
    /// # Errors
    ///
    /// As [`read_bytes`](Self::read_bytes).
    pub fn deref_at(&self, address: AbsoluteAddress, offset: u64) -> Result<AbsoluteAddress> {
        let value = match self.pointer_width {
            PointerWidth::Four => u64::from(self.read::<u32>(address, offset)?),
            PointerWidth::Eight => self.read::<u64>(address, offset)?,
        };
        Ok(self.address(value))
    }

    /// Follow `depth` pointer reads starting at `address`.
    ///
    /// # Errors
    ///
    /// As [`read_bytes`](Self::read_bytes).
    pub fn dereference(&self, address: AbsoluteAddress, depth: usize) -> Result<AbsoluteAddress> {
        let mut current = address;
        for _ in 0..depth {
            current = self.deref_at(current, 0)?;
        }
        Ok(current)
    }

    /// Read exactly `len` bytes and decode them as (lossy) UTF-8.
    ///
    /// # Errors
    ///
    /// As [`read_bytes`](Self::read_bytes).
    pub fn read_string(&self, address: AbsoluteAddress, offset: u64, len: usize) -> Result<String> {
        let bytes = self.read_bytes(address, offset, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read a NUL-terminated string of at most `max_len` bytes.
    ///
    /// # Errors
    ///
    /// As [`read_bytes`](Self::read_bytes); a string without a terminator
    /// within `max_len` bytes is a [`AppError::ReadFault`].
    pub fn read_c_string(&self, address: AbsoluteAddress, max_len: usize) -> Result<String> {
        const STEP: usize = 64;
        let max_len = max_len.min(MAX_C_STRING);
        let mut collected = Vec::new();

        while collected.len() < max_len {
            let want = STEP.min(max_len - collected.len());
            let chunk = self.read_bytes(address, collected.len() as u64, want)?;
            if let Some(end) = chunk.iter().position(|b| *b == 0) {
                collected.extend_from_slice(&chunk[..end]);
                return Ok(String::from_utf8_lossy(&collected).into_owned());
            }
            collected.extend_from_slice(&chunk);
        }
        Err(AppError::ReadFault(format!(
            "unterminated string at {address} (over {max_len} bytes)"
        )))
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    fn check_owned(&self, address: AbsoluteAddress) -> Result<()> {
        if address.space() != self.id {
            return Err(AppError::StaleHandle(format!(
                "address {address} belongs to a different address space"
            )));
        }
        self.ensure_alive()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.source.is_alive() {
            Ok(())
        } else {
            Err(self.stale())
        }
    }

    fn stale(&self) -> AppError {
        AppError::StaleHandle(format!("pid {} has exited", self.pid()))
    }
}
