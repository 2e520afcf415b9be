// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest memory map: a fixed-size table of mmap'd regions translating
//! guest-physical and master-userspace addresses into this process's
//! address space. See spec.md §4.1.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::fd::AsFd;
use std::ptr::NonNull;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{Error, Result};
use crate::message::{MAX_MEM_REGIONS, VHOST_PAGE_SIZE};

/// One mapped guest memory region.
struct Region {
    gpa: u64,
    uva: u64,
    hva: NonNull<u8>,
    size: u64,
    // Kept alive for as long as the mapping is live; dropped (closed) on unmap.
    _fd: OwnedFd,
}

// SAFETY: `Region` only exposes raw address arithmetic; the mapping itself
// is not concurrently mutated by the vhost loop while a request loop reads
// through it (see the single-writer discipline in spec.md §5).
unsafe impl Send for Region {}

/// Fixed-size table of up to `MAX_MEM_REGIONS` mapped guest memory regions.
#[derive(Default)]
pub struct MemoryMap {
    regions: [Option<Region>; MAX_MEM_REGIONS],
}

impl MemoryMap {
    pub fn new() -> Self {
        Self {
            regions: Default::default(),
        }
    }

    /// Maps `fd` at `offset` for `size` bytes, placing it into guest-physical
    /// slot `index`. On an occupied slot with an identical `(gpa, size)`
    /// pair, the incoming `fd` is closed and the existing mapping is kept
    /// (the qemu idempotent `SET_MEM_TABLE` quirk, spec.md §3).
    pub fn map(
        &mut self,
        index: usize,
        gpa: u64,
        uva: u64,
        size: u64,
        offset: u64,
        fd: OwnedFd,
    ) -> Result<()> {
        if index >= MAX_MEM_REGIONS {
            return Err(Error::InvalidMemRegion(index));
        }
        if size == 0 || size % VHOST_PAGE_SIZE != 0 || offset % VHOST_PAGE_SIZE != 0 {
            return Err(Error::BadAddress(gpa));
        }

        if let Some(existing) = &self.regions[index] {
            if existing.gpa == gpa && existing.size == size {
                // fd is dropped here, closing the duplicate descriptor.
                return Ok(());
            }
            return Err(Error::MemRegionBusy(index));
        }

        // SAFETY: fd, offset and size are validated above; the mapping is
        // recorded in `regions` and unmapped exactly once, on `unmap`/`unmap_all`/Drop.
        let hva = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(size as usize).ok_or(Error::BadAddress(gpa))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                offset as i64,
            )
        }
        .map_err(Error::Errno)?;

        let hva = NonNull::new(hva as *mut u8).ok_or(Error::BadAddress(gpa))?;

        self.regions[index] = Some(Region {
            gpa,
            uva,
            hva,
            size,
            _fd: fd,
        });
        Ok(())
    }

    /// Unmaps and clears slot `index`, if live.
    pub fn unmap(&mut self, index: usize) {
        if let Some(region) = self.regions.get_mut(index).and_then(Option::take) {
            // SAFETY: `hva`/`size` are exactly the values passed to `mmap` above.
            unsafe {
                let _ = munmap(region.hva.as_ptr() as *mut _, region.size as usize);
            }
        }
    }

    /// Unmaps every live region.
    pub fn unmap_all(&mut self) {
        for index in 0..MAX_MEM_REGIONS {
            self.unmap(index);
        }
    }

    /// Translates a master-userspace address to a host virtual address.
    pub fn translate_uva(&self, uva: u64) -> Option<*mut u8> {
        self.regions.iter().flatten().find_map(|r| {
            if uva >= r.uva && uva < r.uva + r.size {
                // SAFETY: offset stays within the mapped region checked above.
                Some(unsafe { r.hva.as_ptr().add((uva - r.uva) as usize) })
            } else {
                None
            }
        })
    }

    /// Translates a `[gpa, gpa+len)` guest-physical range into a host
    /// virtual address, requiring the whole range to lie inside one region.
    /// Returns `None` for `len == 0` or if no single region covers the
    /// range (cross-region ranges are unsupported by design, spec.md §9).
    pub fn translate_gpa_len(&self, gpa: u64, len: u64) -> Option<*mut u8> {
        if len == 0 {
            return None;
        }
        let end = gpa.checked_add(len)?.checked_sub(1)?;
        self.regions.iter().flatten().find_map(|r| {
            if gpa >= r.gpa && end < r.gpa + r.size {
                // SAFETY: the bound check above guarantees this stays inside the mapping.
                Some(unsafe { r.hva.as_ptr().add((gpa - r.gpa) as usize) })
            } else {
                None
            }
        })
    }

    pub fn raw_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.regions.iter().flatten().map(|r| r._fd.as_raw_fd())
    }
}

impl Drop for MemoryMap {
    fn drop(&mut self) {
        self.unmap_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
    use nix::unistd::ftruncate;
    use std::os::fd::AsFd;

    fn backing_fd(size: u64) -> OwnedFd {
        let name = std::ffi::CString::new("memtest").unwrap();
        let fd = memfd_create(&name, MemFdCreateFlag::empty()).unwrap();
        ftruncate(fd.as_fd(), size as i64).unwrap();
        fd
    }

    #[test]
    fn translate_gpa_len_requires_full_coverage() {
        let mut map = MemoryMap::new();
        map.map(0, 0x0, 0x7f00_0000_0000, 0x10000, 0, backing_fd(0x10000))
            .unwrap();

        assert!(map.translate_gpa_len(0, 0x10000).is_some());
        assert!(map.translate_gpa_len(0x10000, 1).is_none());
        assert!(map.translate_gpa_len(0, 0).is_none());
        assert!(map.translate_gpa_len(0xff00, 0x200).is_none());
    }

    #[test]
    fn repeated_identical_set_mem_table_is_idempotent() {
        let mut map = MemoryMap::new();
        map.map(0, 0x0, 0x7f00_0000_0000, 0x10000, 0, backing_fd(0x10000))
            .unwrap();
        // Same (gpa, size): the new fd is silently dropped, mapping kept.
        map.map(0, 0x0, 0x7f00_0000_0000, 0x10000, 0, backing_fd(0x10000))
            .unwrap();
        assert_eq!(map.raw_fds().count(), 1);
    }

    #[test]
    fn mismatched_reuse_of_a_slot_is_busy() {
        let mut map = MemoryMap::new();
        map.map(0, 0x0, 0x7f00_0000_0000, 0x10000, 0, backing_fd(0x10000))
            .unwrap();
        let err = map
            .map(0, 0x1000, 0x7f00_0000_0000, 0x10000, 0, backing_fd(0x10000))
            .unwrap_err();
        assert!(matches!(err, Error::MemRegionBusy(0)));
    }

    #[test]
    fn unmap_all_clears_every_slot() {
        let mut map = MemoryMap::new();
        map.map(0, 0x0, 0x7f00_0000_0000, 0x10000, 0, backing_fd(0x10000))
            .unwrap();
        map.map(1, 0x10000, 0x7f00_0001_0000, 0x10000, 0, backing_fd(0x10000))
            .unwrap();
        map.unmap_all();
        assert_eq!(map.raw_fds().count(), 0);
    }
}
