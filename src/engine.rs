// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The protocol engine: decodes one vhost-user message, mutates the
//! addressed `Vdev`, and sends whatever reply the opcode and negotiated
//! features require. See spec.md §4.2, §6, §7.

use std::os::unix::io::{OwnedFd, RawFd};

use log::{debug, warn};
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::inflight::InflightRegion;
use crate::message::{
    flags, opcode, ConfigHeader, Header, Inflight, MemoryRegionPayload, MemoryTableHeader,
    U64Payload, VringAddr, VringState, CONFIG_MAX_SIZE, VRING_IDX_MASK, VRING_NOFD_MASK,
    MAX_MEM_REGIONS, SUPPORTED_PROTOCOL_FEATURES,
};
use crate::socket;
use crate::vdev::Vdev;

/// Whether the device is currently in modern negotiation mode, i.e. has
/// advertised and kept `VhostUserProtocolFeatures::PROTOCOL_FEATURES` style
/// behavior alive via `SET_PROTOCOL_FEATURES`. The field tracked on `Vdev`
/// is `negotiated_protocol_features`; this helper just names the predicate
/// used throughout the handler table (spec.md §4.2: "if
/// `F_PROTOCOL_FEATURES` not negotiated").
fn protocol_features_negotiated(vdev: &Vdev) -> bool {
    vdev.negotiated_protocol_features != 0
}

/// Reads exactly one message from the connection fd, dispatches it against
/// `vdev`, and writes a reply if the handler table and `REPLY_ACK` gating
/// call for one. Returns `Err(Error::Disconnected)` when the peer closed
/// its end cleanly (a zero-length header read), which the caller treats as
/// a normal `CONNECTED -> LISTENING` transition rather than a logged error.
pub fn handle_one_message(vdev: &mut Vdev) -> Result<()> {
    let fd = vdev.conn_raw_fd().ok_or(Error::Disconnected)?;

    let (header, payload, mut fds) = match socket::recv_message(fd) {
        Ok(m) => m,
        Err(Error::Framing) if is_clean_eof(fd) => return Err(Error::Disconnected),
        Err(e) => return Err(e),
    };

    if header.flags & flags::VERSION_MASK != flags::VERSION {
        return Err(Error::Framing);
    }

    let reply_ack_negotiated = vdev.negotiated_protocol_features
        & crate::message::VhostUserProtocolFeatures::REPLY_ACK.bits()
        != 0;
    let needs_ack = header.needs_reply_ack() && reply_ack_negotiated;

    let outcome = dispatch(vdev, header.request, &payload, &mut fds);

    // Any fd the handler didn't consume is ours to close; `OwnedFd`'s Drop
    // does that when `fds` goes out of scope at the end of this function.

    match outcome {
        Ok(Reply::None) => {
            if needs_ack {
                send_ack(fd, header.request, 0)?;
            }
            Ok(())
        }
        Ok(Reply::Explicit) => {
            // The getter already wrote its own reply inside `dispatch`; an
            // ack is suppressed only because that explicit reply succeeded
            // (spec.md §4.2: "a getter suppresses the ack reply only when
            // its own explicit reply was emitted successfully"). If it had
            // failed, `dispatch` would have returned `Err` instead.
            Ok(())
        }
        Err(e) => {
            warn!("vhost-user request {} failed: {}", header.request, e);
            if needs_ack {
                // Sending the ack is not allowed to fail silently: the
                // master waits indefinitely on an outstanding REPLY_ACK, so
                // a send failure here is promoted over the handler's own
                // error (spec.md §7).
                send_ack(fd, header.request, e.to_errno())?;
            }
            Ok(())
        }
    }
}

fn is_clean_eof(fd: RawFd) -> bool {
    let mut probe = [0u8; 1];
    // SAFETY: reading into a correctly sized stack buffer; MSG_PEEK leaves
    // the stream position untouched.
    let n = unsafe {
        libc::recv(
            fd,
            probe.as_mut_ptr() as *mut libc::c_void,
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    n == 0
}

fn send_ack(fd: RawFd, request: u32, status: i32) -> Result<()> {
    let header = Header::reply_header(request, U64Payload::SIZE as u32);
    let payload = U64Payload {
        value: status as u64,
    };
    socket::send_message(fd, &header, payload.as_bytes(), &[])
}

enum Reply {
    /// No reply was written; an ack reply may still follow if negotiated.
    None,
    /// The handler already wrote its own (typed or `u64`) reply.
    Explicit,
}

fn dispatch(vdev: &mut Vdev, request: u32, payload: &[u8], fds: &mut Vec<OwnedFd>) -> Result<Reply> {
    match request {
        opcode::GET_FEATURES => {
            let value = vdev.supported_master_features;
            reply_u64(vdev, request, value)
        }
        opcode::SET_FEATURES => {
            let requested = read_u64(payload)?;
            let negotiated = requested & vdev.supported_master_features;
            if requested & !vdev.supported_master_features != 0 {
                warn!(
                    "master requested unsupported feature bits {:#x}, dropping",
                    requested & !vdev.supported_master_features
                );
            }
            vdev.negotiated_master_features = negotiated;
            vdev.device_type.set_features(negotiated)?;
            Ok(Reply::None)
        }
        opcode::GET_PROTOCOL_FEATURES => {
            reply_u64(vdev, request, SUPPORTED_PROTOCOL_FEATURES.bits())
        }
        opcode::SET_PROTOCOL_FEATURES => {
            let requested = read_u64(payload)?;
            vdev.negotiated_protocol_features = requested & SUPPORTED_PROTOCOL_FEATURES.bits();
            Ok(Reply::None)
        }
        opcode::SET_OWNER => {
            if vdev.is_owned {
                warn!("SET_OWNER on an already-owned device {}", vdev.id());
            }
            vdev.is_owned = true;
            Ok(Reply::None)
        }
        opcode::RESET_OWNER => Err(Error::Unsupported(request)),
        opcode::GET_CONFIG => handle_get_config(vdev, payload),
        opcode::SET_CONFIG => Err(Error::Unsupported(request)),
        opcode::GET_QUEUE_NUM => reply_u64(vdev, request, vdev.max_queues() as u64),
        opcode::SET_MEM_TABLE => handle_set_mem_table(vdev, payload, fds),
        opcode::SET_VRING_NUM => handle_vring_num(vdev, payload),
        opcode::SET_VRING_BASE => handle_vring_base(vdev, payload),
        opcode::SET_VRING_ADDR => handle_vring_addr(vdev, payload),
        opcode::GET_VRING_BASE => handle_get_vring_base(vdev, payload),
        opcode::SET_VRING_KICK => handle_vring_fd(vdev, payload, fds, VringFdKind::Kick),
        opcode::SET_VRING_CALL => handle_vring_fd(vdev, payload, fds, VringFdKind::Call),
        opcode::SET_VRING_ERR => handle_vring_fd(vdev, payload, fds, VringFdKind::Err),
        opcode::SET_VRING_ENABLE => handle_vring_enable(vdev, payload),
        opcode::GET_INFLIGHT_FD => handle_get_inflight_fd(vdev, payload),
        opcode::SET_INFLIGHT_FD => handle_set_inflight_fd(vdev, payload, fds),
        _ => Err(Error::Unsupported(request)),
    }
}

fn read_u64(payload: &[u8]) -> Result<u64> {
    U64Payload::read_from(payload)
        .map(|p| p.value)
        .ok_or(Error::Framing)
}

fn reply_u64(vdev: &Vdev, request: u32, value: u64) -> Result<Reply> {
    let fd = vdev.conn_raw_fd().ok_or(Error::Disconnected)?;
    let header = Header::reply_header(request, U64Payload::SIZE as u32);
    let payload = U64Payload { value };
    socket::send_message(fd, &header, payload.as_bytes(), &[])?;
    Ok(Reply::Explicit)
}

fn handle_get_config(vdev: &Vdev, payload: &[u8]) -> Result<Reply> {
    let req = ConfigHeader::read_from_prefix(payload).ok_or(Error::Framing)?;
    if req.size > CONFIG_MAX_SIZE {
        return Err(Error::PayloadTooLarge(req.size, CONFIG_MAX_SIZE));
    }
    let mut buf = vec![0u8; req.size as usize];
    vdev.device_type.get_config(req.offset, &mut buf);

    let fd = vdev.conn_raw_fd().ok_or(Error::Disconnected)?;
    let mut reply_payload = Vec::with_capacity(ConfigHeader::SIZE + buf.len());
    reply_payload.extend_from_slice(req.as_bytes());
    reply_payload.extend_from_slice(&buf);

    let header = Header::reply_header(opcode::GET_CONFIG, reply_payload.len() as u32);
    socket::send_message(fd, &header, &reply_payload, &[])?;
    Ok(Reply::Explicit)
}

/// `SET_MEM_TABLE` failure is "start over": any region already mapped by
/// this call (or a prior call) is unmapped, matching spec.md §9 open
/// question (b) — a failed slot is indistinguishable from never-attempted.
fn handle_set_mem_table(vdev: &mut Vdev, payload: &[u8], fds: &mut Vec<OwnedFd>) -> Result<Reply> {
    let table_header = MemoryTableHeader::read_from_prefix(payload).ok_or(Error::Framing)?;
    let nregions = table_header.num_regions as usize;
    if nregions > MAX_MEM_REGIONS {
        return Err(Error::TooManyRegions(nregions, MAX_MEM_REGIONS));
    }

    let entries_start = MemoryTableHeader::SIZE;
    let entry_size = MemoryRegionPayload::SIZE;
    if payload.len() < entries_start + nregions * entry_size {
        return Err(Error::Framing);
    }
    if fds.len() != nregions {
        return Err(Error::Framing);
    }

    vdev.mem.unmap_all();
    // fds are drained in order; each one is consumed into the map or
    // closed when `map` returns (the idempotent-duplicate path) or when an
    // error aborts the loop and the remaining `OwnedFd`s in `fds` drop.
    for (i, fd) in fds.drain(..).enumerate() {
        let offset = entries_start + i * entry_size;
        let region = MemoryRegionPayload::read_from(&payload[offset..offset + entry_size])
            .ok_or(Error::Framing)?;
        if let Err(e) = vdev.mem.map(
            i,
            region.guest_phys_addr,
            region.user_addr,
            region.memory_size,
            region.mmap_offset,
            fd,
        ) {
            vdev.mem.unmap_all();
            return Err(e);
        }
    }
    Ok(Reply::None)
}

fn vring_index(vdev: &Vdev, index: u32) -> Result<usize> {
    let idx = index as usize;
    if idx >= vdev.vrings.len() {
        return Err(Error::InvalidVringIndex(index));
    }
    Ok(idx)
}

fn require_disabled(vdev: &Vdev, idx: usize) -> Result<()> {
    if vdev.vrings[idx].is_enabled {
        return Err(Error::VringEnabled(idx));
    }
    Ok(())
}

fn handle_vring_num(vdev: &mut Vdev, payload: &[u8]) -> Result<Reply> {
    let state = VringState::read_from(payload).ok_or(Error::Framing)?;
    let idx = vring_index(vdev, state.index)?;
    require_disabled(vdev, idx)?;
    vdev.vrings[idx].client_info.num = Some(state.num);
    Ok(Reply::None)
}

fn handle_vring_base(vdev: &mut Vdev, payload: &[u8]) -> Result<Reply> {
    let state = VringState::read_from(payload).ok_or(Error::Framing)?;
    let idx = vring_index(vdev, state.index)?;
    require_disabled(vdev, idx)?;
    vdev.vrings[idx].client_info.base = Some(state.num);
    Ok(Reply::None)
}

fn handle_vring_addr(vdev: &mut Vdev, payload: &[u8]) -> Result<Reply> {
    let addr = VringAddr::read_from(payload).ok_or(Error::Framing)?;
    let idx = vring_index(vdev, addr.index)?;
    require_disabled(vdev, idx)?;

    let desc = vdev
        .mem
        .translate_uva(addr.descriptor)
        .ok_or(Error::BadAddress(addr.descriptor))?;
    let avail = vdev
        .mem
        .translate_uva(addr.available)
        .ok_or(Error::BadAddress(addr.available))?;
    let used = vdev
        .mem
        .translate_uva(addr.used)
        .ok_or(Error::BadAddress(addr.used))?;

    let client_info = &mut vdev.vrings[idx].client_info;
    client_info.desc_addr = Some(desc as u64);
    client_info.avail_addr = Some(avail as u64);
    client_info.used_addr = Some(used as u64);
    Ok(Reply::None)
}

fn handle_get_vring_base(vdev: &mut Vdev, payload: &[u8]) -> Result<Reply> {
    let state = VringState::read_from(payload).ok_or(Error::Framing)?;
    let idx = vring_index(vdev, state.index)?;

    let last_avail = vdev.vrings[idx].last_avail();

    if !protocol_features_negotiated(vdev) && vdev.vrings[idx].is_enabled {
        disable_vring(vdev, idx)?;
    }

    let fd = vdev.conn_raw_fd().ok_or(Error::Disconnected)?;
    let header = Header::reply_header(opcode::GET_VRING_BASE, VringState::SIZE as u32);
    let reply = VringState {
        index: state.index,
        num: last_avail,
    };
    socket::send_message(fd, &header, reply.as_bytes(), &[])?;
    Ok(Reply::Explicit)
}

#[derive(Clone, Copy)]
enum VringFdKind {
    Kick,
    Call,
    Err,
}

fn handle_vring_fd(
    vdev: &mut Vdev,
    payload: &[u8],
    fds: &mut Vec<OwnedFd>,
    kind: VringFdKind,
) -> Result<Reply> {
    let value = read_u64(payload)?;
    let index = (value & VRING_IDX_MASK) as u32;
    let idx = vring_index(vdev, index)?;

    if value & VRING_NOFD_MASK != 0 {
        // Polling mode: explicitly out of scope (spec.md §1 Non-goals).
        return Err(Error::Unsupported(match kind {
            VringFdKind::Kick => opcode::SET_VRING_KICK,
            VringFdKind::Call => opcode::SET_VRING_CALL,
            VringFdKind::Err => opcode::SET_VRING_ERR,
        }));
    }
    let fd = fds.pop().ok_or(Error::Framing)?;

    match kind {
        VringFdKind::Kick => {
            vdev.vrings[idx].kickfd = Some(fd);
            if !protocol_features_negotiated(vdev) {
                enable_vring(vdev, idx)?;
            }
        }
        VringFdKind::Call => {
            vdev.vrings[idx].callfd = Some(fd);
            // A real virtqueue primitive's `set_notify_fd` would be called
            // here when the vring is already enabled; this core only
            // tracks the fd and leaves propagation to the caller's
            // `dispatch_requests`, which reads `callfd` on every drain.
        }
        VringFdKind::Err => {
            vdev.vrings[idx].errfd = Some(fd);
        }
    }
    Ok(Reply::None)
}

fn handle_vring_enable(vdev: &mut Vdev, payload: &[u8]) -> Result<Reply> {
    let state = VringState::read_from(payload).ok_or(Error::Framing)?;
    let idx = vring_index(vdev, state.index)?;
    if state.num != 0 {
        enable_vring(vdev, idx)?;
    } else if vdev.vrings[idx].is_enabled {
        disable_vring(vdev, idx)?;
    }
    Ok(Reply::None)
}

fn enable_vring(vdev: &mut Vdev, idx: usize) -> Result<()> {
    let kick_fd = vdev.vrings[idx].kick_fd_for_enable()?;
    vdev.rq.attach_event(kick_fd, idx)?;
    // Only now, with the kick fd confirmed registered, may `is_enabled`
    // become true (spec.md §8 Testable Property 5): if `attach_event` had
    // errored above, we return without ever marking the vring enabled.
    vdev.vrings[idx].kick_registered = true;
    vdev.vrings[idx].mark_enabled();
    debug!("vring {} enabled on device {}", idx, vdev.id());
    Ok(())
}

fn disable_vring(vdev: &mut Vdev, idx: usize) -> Result<()> {
    if vdev.vrings[idx].kick_registered {
        if let Some(fd) = vdev.vrings[idx].kick_raw_fd() {
            vdev.rq.detach_event(fd)?;
        }
    }
    vdev.vrings[idx].mark_disabled();
    debug!("vring {} disabled on device {}", idx, vdev.id());
    Ok(())
}

fn handle_get_inflight_fd(vdev: &mut Vdev, payload: &[u8]) -> Result<Reply> {
    let req = Inflight::read_from(payload).ok_or(Error::Framing)?;

    vdev.inflight = None;
    let region = InflightRegion::create(req.queue_size, req.num_queues as usize)?;

    let fd = vdev.conn_raw_fd().ok_or(Error::Disconnected)?;
    let reply_payload = Inflight {
        mmap_size: region.mmap_size(),
        mmap_offset: 0,
        num_queues: req.num_queues,
        queue_size: req.queue_size,
    };
    let header = Header::reply_header(opcode::GET_INFLIGHT_FD, Inflight::SIZE as u32);
    let result = socket::send_message(
        fd,
        &header,
        reply_payload.as_bytes(),
        &[region.raw_fd()],
    );
    match result {
        Ok(()) => {
            vdev.inflight = Some(region);
            Ok(Reply::Explicit)
        }
        Err(e) => {
            // A failed reply unmaps and forgets the region (spec.md §4.5);
            // `region` drops here, which unmaps and closes its fd.
            Err(e)
        }
    }
}

fn handle_set_inflight_fd(vdev: &mut Vdev, payload: &[u8], fds: &mut Vec<OwnedFd>) -> Result<Reply> {
    let req = Inflight::read_from(payload).ok_or(Error::Framing)?;
    let fd = fds.pop().ok_or(Error::Framing)?;

    vdev.inflight = None;
    let region = InflightRegion::adopt(fd, req.mmap_size, req.queue_size, req.num_queues as usize)?;
    vdev.inflight = Some(region);
    Ok(Reply::None)
}
