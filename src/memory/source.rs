//! Raw memory backends.
//!
//! [`MemorySource`] is the seam between [`AddressSpace`](super::AddressSpace)
//! and whatever actually reads foreign memory. The native backend,
//! [`ProcMemory`], reads through procfs; tests substitute synthetic sources.

use std::io;

use crate::Result;

/// Regions larger than this are skipped during signature scans.
pub const MAX_SCANNED_REGION: u64 = 64 * 1024 * 1024;

/// One readable mapping in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First byte of the mapping.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
}

impl Region {
    /// One past the last byte.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

/// Read access to one external process.
pub trait MemorySource: Send + Sync {
    /// Process id this source reads from.
    fn pid(&self) -> u32;

    /// Readable regions worth scanning for signatures.
    ///
    /// # Errors
    ///
    /// Any I/O failure enumerating mappings.
    fn regions(&self) -> io::Result<Vec<Region>>;

    /// Read up to `buf.len()` bytes at `address`, returning how many were read.
    ///
    /// # Errors
    ///
    /// Any I/O failure, including unmapped addresses.
    fn read_at(&self, address: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Whether the process is still running.
    fn is_alive(&self) -> bool;
}

#[cfg(target_os = "linux")]
pub use procfs::ProcMemory;

#[cfg(target_os = "linux")]
mod procfs {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;
    use std::path::PathBuf;

    use super::{MemorySource, Region, MAX_SCANNED_REGION};
    use crate::{AppError, Result};

    /// Reads `/proc/<pid>/mem` using the mappings in `/proc/<pid>/maps`.
    #[derive(Debug)]
    pub struct ProcMemory {
        pid: u32,
        root: PathBuf,
        mem: File,
    }

    impl ProcMemory {
        /// Open the memory file of `pid`.
        ///
        /// # Errors
        ///
        /// Returns [`AppError::ProcessUnavailable`] if the process does not
        /// exist or its memory cannot be opened (usually a ptrace permission
        /// problem).
        pub fn open(pid: u32) -> Result<Self> {
            let root = PathBuf::from(format!("/proc/{pid}"));
            let mem = File::open(root.join("mem")).map_err(|err| {
                AppError::ProcessUnavailable(format!("cannot open memory of pid {pid}: {err}"))
            })?;
            Ok(Self { pid, root, mem })
        }
    }

    impl MemorySource for ProcMemory {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn regions(&self) -> io::Result<Vec<Region>> {
            let maps = std::fs::read_to_string(self.root.join("maps"))?;
            Ok(maps.lines().filter_map(parse_maps_line).collect())
        }

        fn read_at(&self, address: u64, buf: &mut [u8]) -> io::Result<usize> {
            self.mem.read_at(buf, address)
        }

        fn is_alive(&self) -> bool {
            self.root.exists()
        }
    }

    /// Parse one `maps` line (`start-end perms offset dev inode path`) into a
    /// scannable region, dropping unreadable and kernel-special mappings.
    fn parse_maps_line(line: &str) -> Option<Region> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        if !perms.starts_with('r') {
            return None;
        }
        if line.ends_with("[vvar]") || line.ends_with("[vsyscall]") {
            return None;
        }

        let (start, end) = range.split_once('-')?;
        let base = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let size = end.checked_sub(base)?;
        (size > 0 && size <= MAX_SCANNED_REGION).then_some(Region { base, size })
    }

}

/// Open the native memory backend for `pid`.
///
/// # Errors
///
/// Returns [`AppError::ProcessUnavailable`] when the process cannot be opened
/// or the platform has no native backend.
pub fn open_native(pid: u32) -> Result<std::sync::Arc<dyn MemorySource>> {
    #[cfg(target_os = "linux")]
    {
        Ok(std::sync::Arc::new(ProcMemory::open(pid)?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(crate::AppError::ProcessUnavailable(format!(
            "no native memory backend for pid {pid} on this platform"
        )))
    }
}
