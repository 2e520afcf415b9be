// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;

/// Errors produced by the vhost-user protocol engine.
///
/// Variants map onto the error kinds of the design: framing errors are
/// fatal to the connection, validation errors are reported to the master
/// via an ack reply, resource errors carry the underlying errno, and
/// `Unsupported` always maps to `NOTSUP`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("short read/write while framing a vhost-user message")]
    Framing,
    #[error("message payload size {0} exceeds the maximum of {1}")]
    PayloadTooLarge(u32, u32),
    #[error("invalid memory region index {0}")]
    InvalidMemRegion(usize),
    #[error("memory region {0} is occupied by a different mapping")]
    MemRegionBusy(usize),
    #[error("address {0:#x} could not be translated")]
    BadAddress(u64),
    #[error("vring index {0} is out of range")]
    InvalidVringIndex(u32),
    #[error("vring {0} is not fully configured")]
    VringNotReady(usize),
    #[error("vring {0} must be disabled for this operation")]
    VringEnabled(usize),
    #[error("operation requires SET_OWNER first")]
    NotOwned,
    #[error("too many memory regions: {0} > {1}")]
    TooManyRegions(usize, usize),
    #[error("too many ancillary file descriptors: {0} > {1}")]
    TooManyFds(usize, usize),
    #[error("opcode {0} is not supported")]
    Unsupported(u32),
    #[error("invalid state transition from {0:?} on event {1}")]
    InvalidTransition(&'static str, &'static str),
    #[error("connection closed by the master")]
    Disconnected,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("errno: {0}")]
    Errno(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno this error should be reported to the master as, when an
    /// ack reply is requested. Framing errors never reach this path: they
    /// drop the connection instead.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Errno(e) => *e as i32,
            Error::Unsupported(_) => libc::ENOTSUP,
            Error::NotOwned
            | Error::InvalidMemRegion(_)
            | Error::MemRegionBusy(_)
            | Error::BadAddress(_)
            | Error::InvalidVringIndex(_)
            | Error::VringNotReady(_)
            | Error::VringEnabled(_)
            | Error::TooManyRegions(_, _)
            | Error::TooManyFds(_, _) => libc::EINVAL,
            Error::Framing | Error::PayloadTooLarge(_, _) => libc::EIO,
            Error::InvalidTransition(_, _) => libc::EINVAL,
            Error::Disconnected => libc::ENOTCONN,
        }
    }
}
