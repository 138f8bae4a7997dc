//! `basalt-numa`: page-aligned anonymous mappings pinned to a NUMA node.
//!
//! The cell fabric's backing store must be page-aligned and shared-mappable
//! so a co-processor driver can map the same physical pages. An anonymous
//! `mmap` gives both properties; on Linux the pages are then bound to the
//! requested node with `mbind` before first touch.

use memmap2::MmapMut;
use std::io;

/// Construction failures. Nothing partial is retained on error.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("zero-length allocation")]
    ZeroLen,

    #[error("failed to map {bytes} bytes")]
    Map {
        bytes: usize,
        #[source]
        source: io::Error,
    },

    #[error("NUMA policy is unavailable on this system")]
    NumaUnavailable,

    #[error("node {node} rejected by the kernel")]
    InvalidNode {
        node: u32,
        #[source]
        source: io::Error,
    },

    #[error("node pinning is only supported on Linux")]
    NumaUnsupported,
}

/// An owned, page-aligned, optionally node-pinned memory region.
///
/// The region is zero-initialized by the kernel and unmapped on drop,
/// returning the pages to the originating node's pool.
pub struct NumaRegion {
    map: MmapMut,
    len: usize,
    node: Option<u32>,
}

impl NumaRegion {
    /// Maps `bytes` rounded up to whole pages. `node = None` leaves the
    /// kernel's default placement policy in effect.
    pub fn new(bytes: usize, node: Option<u32>) -> Result<Self, AllocError> {
        if bytes == 0 {
            return Err(AllocError::ZeroLen);
        }
        let ps = page_size();
        let len = bytes.div_ceil(ps) * ps;
        let map = MmapMut::map_anon(len).map_err(|source| AllocError::Map { bytes: len, source })?;
        if let Some(n) = node {
            bind_to_node(map.as_ptr() as *mut u8, len, n)?;
        }
        Ok(Self { map, len, node })
    }

    /// Base address. Page-aligned, so also cache-line aligned.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    /// Mapped length in bytes (whole pages).
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The node this region was pinned to, if any.
    pub fn node(&self) -> Option<u32> {
        self.node
    }
}

/// System page size; 4096 if the sysconf probe fails.
pub fn page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps > 0 { ps as usize } else { 4096 }
}

#[cfg(target_os = "linux")]
fn bind_to_node(addr: *mut u8, len: usize, node: u32) -> Result<(), AllocError> {
    const MPOL_BIND: libc::c_long = 2;
    const MPOL_MF_MOVE: libc::c_long = 1 << 1;

    if node >= 64 {
        return Err(AllocError::InvalidNode {
            node,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        });
    }
    let nodemask: u64 = 1u64 << node;
    // maxnode counts bits in the mask; one u64 word covers nodes 0..=63.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr as libc::c_long,
            len as libc::c_long,
            MPOL_BIND,
            &nodemask as *const u64 as libc::c_long,
            64 as libc::c_long,
            MPOL_MF_MOVE,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOSYS) => Err(AllocError::NumaUnavailable),
        _ => Err(AllocError::InvalidNode { node, source: err }),
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_node(_addr: *mut u8, _len: usize, _node: u32) -> Result<(), AllocError> {
    Err(AllocError::NumaUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_is_rejected() {
        assert!(matches!(NumaRegion::new(0, None), Err(AllocError::ZeroLen)));
    }

    #[test]
    fn region_is_page_aligned_and_rounded() {
        let ps = page_size();
        let r = NumaRegion::new(100, None).expect("map");
        assert_eq!(r.as_ptr() as usize % ps, 0);
        assert_eq!(r.len() % ps, 0);
        assert!(r.len() >= 100);
        assert_eq!(r.node(), None);
    }

    #[test]
    fn region_starts_zeroed() {
        let r = NumaRegion::new(4096, None).expect("map");
        let bytes = unsafe { std::slice::from_raw_parts(r.as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn exact_page_multiple_is_not_grown() {
        let ps = page_size();
        let r = NumaRegion::new(ps * 2, None).expect("map");
        assert_eq!(r.len(), ps * 2);
    }
}
