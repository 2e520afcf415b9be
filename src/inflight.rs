// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared-memory inflight-tracking region so a reconnecting master can
//! recover descriptor heads issued but not yet completed. See spec.md §4.5.

use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
#[cfg(test)]
use std::os::unix::io::FromRawFd;
use std::ptr::NonNull;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::ftruncate;

use crate::error::{Error, Result};
use crate::message::{InflightSplitRegion, VHOST_PAGE_SIZE};

pub struct InflightRegion {
    fd: OwnedFd,
    hva: NonNull<u8>,
    size: usize,
    per_queue: usize,
    num_queues: usize,
}

// SAFETY: the mapping is only touched by the vhost loop while mutating
// layout, and read by request loops through the same single-writer
// discipline as `MemoryMap`.
unsafe impl Send for InflightRegion {}

impl InflightRegion {
    fn per_queue_size(queue_size: u16) -> usize {
        InflightSplitRegion::SIZE + queue_size as usize * crate::message::InflightSplitDesc::SIZE
    }

    /// Creates a fresh anonymous, close-on-exec shared region sized for
    /// `num_queues` queues of `queue_size` descriptors each, zeroes it, and
    /// writes a fresh per-queue header. This is the slave-allocates path of
    /// `GET_INFLIGHT_FD`.
    pub fn create(queue_size: u16, num_queues: usize) -> Result<Self> {
        let per_queue = Self::per_queue_size(queue_size);
        let total = per_queue * num_queues;

        let name = std::ffi::CString::new("vhost-inflight").unwrap();
        let fd = memfd_create(&name, MemFdCreateFlag::MFD_CLOEXEC).map_err(Error::Errno)?;
        ftruncate(fd.as_fd(), total as i64).map_err(Error::Errno)?;

        // SAFETY: fd was just sized to `total` bytes above.
        let hva = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(total).ok_or(Error::BadAddress(0))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(Error::Errno)?;
        let hva = NonNull::new(hva as *mut u8).ok_or(Error::BadAddress(0))?;

        // SAFETY: `hva` is a fresh mapping of exactly `total` bytes owned by this struct.
        unsafe {
            std::ptr::write_bytes(hva.as_ptr(), 0, total);
        }

        let mut region = InflightRegion {
            fd,
            hva,
            size: total,
            per_queue,
            num_queues,
        };
        for q in 0..num_queues {
            region.write_header(q, queue_size);
        }
        Ok(region)
    }

    /// Adopts a region the master created and passed via `SET_INFLIGHT_FD`.
    pub fn adopt(fd: OwnedFd, mmap_size: u64, queue_size: u16, num_queues: usize) -> Result<Self> {
        let size = mmap_size as usize;
        // SAFETY: the master asserts this fd is valid and at least `mmap_size` bytes.
        let hva = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(size).ok_or(Error::BadAddress(0))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(Error::Errno)?;
        let hva = NonNull::new(hva as *mut u8).ok_or(Error::BadAddress(0))?;

        Ok(InflightRegion {
            fd,
            hva,
            size,
            per_queue: Self::per_queue_size(queue_size),
            num_queues,
        })
    }

    fn write_header(&mut self, queue_idx: usize, queue_size: u16) {
        let header = InflightSplitRegion {
            features: 0,
            version: 1,
            desc_num: queue_size,
            last_batch_head: 0,
            used_idx: 0,
            _pad: 0,
        };
        let offset = queue_idx * self.per_queue;
        debug_assert!(offset + InflightSplitRegion::SIZE <= self.size);
        // SAFETY: offset/size are bounded by the allocation computed in `create`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &header as *const _ as *const u8,
                self.hva.as_ptr().add(offset),
                InflightSplitRegion::SIZE,
            );
        }
    }

    pub fn mmap_size(&self) -> u64 {
        self.size as u64
    }

    pub fn num_queues(&self) -> usize {
        self.num_queues
    }

    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        self.fd.as_raw_fd()
    }

    /// Byte contents of the whole region, used by tests to assert
    /// round-trip identity across a `GET_INFLIGHT_FD`/`SET_INFLIGHT_FD`
    /// pair.
    #[cfg(test)]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `hva`/`size` describe a live mapping for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.hva.as_ptr(), self.size) }
    }
}

impl Drop for InflightRegion {
    fn drop(&mut self) {
        // SAFETY: `hva`/`size` are exactly the values passed to `mmap`.
        unsafe {
            let _ = munmap(self.hva.as_ptr() as *mut _, self.size);
        }
    }
}
