// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-queue vring record: client-supplied ring geometry, kick/call/err
//! file descriptors, and the enabled/disabled lifecycle. See spec.md §3,
//! §4.3.

use std::os::unix::io::{OwnedFd, RawFd};

use crate::error::{Error, Result};

/// Host addresses and geometry accumulated across `SET_VRING_NUM/BASE/ADDR`,
/// consumed when the vring transitions to enabled.
#[derive(Default, Clone, Copy)]
pub struct ClientInfo {
    pub desc_addr: Option<u64>,
    pub avail_addr: Option<u64>,
    pub used_addr: Option<u64>,
    pub num: Option<u32>,
    pub base: Option<u32>,
    pub inflight_addr: Option<u64>,
}

impl ClientInfo {
    pub fn is_complete(&self) -> bool {
        self.desc_addr.is_some()
            && self.avail_addr.is_some()
            && self.used_addr.is_some()
            && self.num.is_some()
    }
}

pub struct Vring {
    pub id: usize,
    pub is_enabled: bool,
    pub kickfd: Option<OwnedFd>,
    pub callfd: Option<OwnedFd>,
    pub errfd: Option<OwnedFd>,
    pub client_info: ClientInfo,
    /// Set once the kick fd has been registered as an active event source
    /// on the request queue's event loop; cleared on disable. `is_enabled`
    /// is only ever set alongside this flag, never before it (spec.md §8
    /// Testable Property 5).
    pub kick_registered: bool,
}

impl Vring {
    pub fn new(id: usize) -> Self {
        Vring {
            id,
            is_enabled: false,
            kickfd: None,
            callfd: None,
            errfd: None,
            client_info: ClientInfo::default(),
            kick_registered: false,
        }
    }

    pub fn kick_raw_fd(&self) -> Option<RawFd> {
        use std::os::unix::io::AsRawFd;
        self.kickfd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Validates that `desc/avail/used/num` and `kickfd` are all present
    /// (spec.md §4.3) and returns the kick fd to register. Does not mutate
    /// `is_enabled`; the caller (`engine::enable_vring`) must only call
    /// `mark_enabled` after the returned fd has actually been registered as
    /// an event source.
    pub fn kick_fd_for_enable(&self) -> Result<RawFd> {
        if !self.client_info.is_complete() {
            return Err(Error::VringNotReady(self.id));
        }
        self.kick_raw_fd().ok_or(Error::VringNotReady(self.id))
    }

    /// Flips the vring enabled. Callers must only invoke this once the kick
    /// fd is already an active event source.
    pub fn mark_enabled(&mut self) {
        self.is_enabled = true;
    }

    /// Disables the vring: clears the enabled and kick-registration flags.
    /// Does not clear `client_info`, matching real vhost-user masters that
    /// re-enable without resending addresses.
    pub fn mark_disabled(&mut self) {
        self.is_enabled = false;
        self.kick_registered = false;
    }

    /// Full teardown on disconnect/uninit: disables if enabled and drops
    /// every fd and the accumulated client info.
    pub fn reset(&mut self) {
        self.mark_disabled();
        self.kickfd = None;
        self.callfd = None;
        self.errfd = None;
        self.client_info = ClientInfo::default();
    }

    /// `last_avail` as of the last `SET_VRING_BASE`/`GET_VRING_BASE` plain
    /// load. The virtqueue ring-buffer primitive that would track live
    /// consumption progress is external to this crate (spec.md §1
    /// Non-goals); this engine has no seam to observe it, so it reports the
    /// last value the protocol itself recorded rather than the live index.
    pub fn last_avail(&self) -> u32 {
        self.client_info.base.unwrap_or(0)
    }
}
