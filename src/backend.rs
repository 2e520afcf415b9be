// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The caller-supplied device-type vtable and request-queue registration
//! traits (spec.md §4.6, §6, §9). The protocol engine consumes these
//! through trait objects; it never parses descriptor chains or owns a
//! request-servicing event loop itself.

use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::vdev::Vdev;

/// Per-device-type capability set: feature negotiation surface, config
/// space access, and the request dispatch entry point. Grounded on the
/// teacher's `VhostUserBackend` trait, reshaped around this design's
/// synchronous kick -> drain -> enqueue dispatch model instead of an async
/// per-queue task.
pub trait DeviceType: Send {
    /// Virtio feature bits this device type contributes, combined with
    /// `DEFAULT_FEATURES` by the engine on `GET_FEATURES`.
    fn get_features(&self) -> u64 {
        0
    }

    /// Called once features have been masked against the supported set;
    /// the device type may reject a negotiated combination.
    fn set_features(&mut self, _negotiated: u64) -> Result<()> {
        Ok(())
    }

    /// Fills `buf` with this device's configuration space starting at
    /// `offset`.
    fn get_config(&self, offset: u32, buf: &mut [u8]) {
        let _ = (offset, buf);
    }

    /// `SET_CONFIG` is refused with `NOTSUP` by default (spec.md §4.2); a
    /// device type that supports writable config space overrides this.
    fn set_config(&mut self, offset: u32, buf: &[u8]) -> Result<()> {
        let _ = (offset, buf);
        Err(crate::error::Error::Unsupported(crate::message::opcode::SET_CONFIG))
    }

    /// Drains available descriptors from the vring at `vring_id` and
    /// enqueues one request per descriptor chain into `rq`. Called from the
    /// request queue's loop, never from the vhost loop.
    fn dispatch_requests(
        &mut self,
        vdev: &Vdev,
        vring_id: usize,
        rq: &dyn RequestQueue,
    ) -> Result<()>;
}

/// The caller-owned request-servicing event loop, registered with at
/// device init (spec.md §5, §6). The engine calls `attach_event` when a
/// vring becomes enabled and has a kick fd, and `detach_event` when it is
/// disabled or torn down.
pub trait RequestQueue: Send + Sync {
    fn attach_event(&self, fd: RawFd, vring_id: usize) -> Result<()>;
    fn detach_event(&self, fd: RawFd) -> Result<()>;
}
