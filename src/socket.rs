// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Message framing over the vhost-user UNIX stream socket: one `recvmsg`
//! for the header plus any ancillary fds, one blocking `read` for the
//! payload, and one `sendmsg` for the reply. See spec.md §4.2, §6.

use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::message::{Header, MAX_FDS};

/// Largest payload this engine will accept. Real vhost-user payloads are at
/// most a few hundred bytes (the inflight/config messages); this bound
/// exists purely to reject obviously malformed framing before allocating.
const MAX_PAYLOAD: u32 = 1 << 20;

pub fn recv_message(fd: RawFd) -> Result<(Header, Vec<u8>, Vec<OwnedFd>)> {
    let mut hdr_buf = [0u8; Header::SIZE];
    let mut iov = libc::iovec {
        iov_base: hdr_buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: Header::SIZE,
    };

    // The control buffer is poisoned (not zeroed) so a short ancillary fd
    // array is detectable: a genuine kernel-filled cmsg always overwrites
    // every byte it uses, so stale poison surviving past `cmsg_len` would
    // only happen if nothing was written there at all.
    let cmsg_cap =
        unsafe { libc::CMSG_SPACE((MAX_FDS * mem::size_of::<RawFd>()) as u32) } as usize;
    let mut cmsg_buf = vec![0xAAu8; cmsg_cap];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    // SAFETY: `msg` describes the buffers above, which outlive the call.
    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    if n != Header::SIZE as isize {
        return Err(Error::Framing);
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(Error::Framing);
    }

    let header = Header::read_from(&hdr_buf[..]).ok_or(Error::Framing)?;

    let mut fds = Vec::new();
    // SAFETY: `msg` was filled in by the kernel above and stays valid for
    // the duration of this scan.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = data_len / mem::size_of::<RawFd>();
                if count > MAX_FDS {
                    return Err(Error::TooManyFds(count, MAX_FDS));
                }
                let data_ptr = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    let raw = std::ptr::read_unaligned(data_ptr.add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if header.size == 0 {
        return Ok((header, Vec::new(), fds));
    }
    if header.size > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge(header.size, MAX_PAYLOAD));
    }

    let mut payload = vec![0u8; header.size as usize];
    // SAFETY: `payload` is sized exactly to `header.size` above.
    let n = unsafe {
        libc::read(
            fd,
            payload.as_mut_ptr() as *mut libc::c_void,
            payload.len(),
        )
    };
    // The header recvmsg above already consumed any SCM_RIGHTS fds for this
    // message; there is no resuming a partial payload read, including
    // EAGAIN/EWOULDBLOCK on the non-blocking connection fd, so every
    // negative or short result here is framing-fatal, never a retry.
    if n < 0 || n != payload.len() as isize {
        return Err(Error::Framing);
    }

    Ok((header, payload, fds))
}

pub fn send_message(fd: RawFd, header: &Header, payload: &[u8], fds: &[RawFd]) -> Result<()> {
    let header_bytes = header.as_bytes();
    let mut iov = [
        libc::iovec {
            iov_base: header_bytes.as_ptr() as *mut libc::c_void,
            iov_len: header_bytes.len(),
        },
        libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        },
    ];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = if payload.is_empty() { 1 } else { 2 };

    let mut cmsg_buf;
    if !fds.is_empty() {
        if fds.len() > MAX_FDS {
            return Err(Error::TooManyFds(fds.len(), MAX_FDS));
        }
        let cmsg_len =
            unsafe { libc::CMSG_SPACE((fds.len() * mem::size_of::<RawFd>()) as u32) } as usize;
        cmsg_buf = vec![0u8; cmsg_len];
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;

        // SAFETY: `cmsg_buf` was sized by `CMSG_SPACE` for exactly `fds.len()` descriptors.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * mem::size_of::<RawFd>()) as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr(),
                libc::CMSG_DATA(cmsg) as *mut RawFd,
                fds.len(),
            );
        }
    }

    // SAFETY: `msg` describes the buffers constructed above, which outlive the call.
    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}
