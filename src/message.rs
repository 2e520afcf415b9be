// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire format for the vhost-user protocol: the fixed message header, the
//! opcode space, feature bit layouts and the typed payloads this engine
//! understands. Struct layouts follow the vhost-user specification; the
//! numeric constants for the underlying kernel vhost ioctl interface are
//! carried over from the vhost driver headers (see `VHOST_PAGE_SIZE`).

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Page size assumed for alignment checks on `SET_MEM_TABLE` regions.
pub const VHOST_PAGE_SIZE: u64 = 4096;

pub const MAX_MEM_REGIONS: usize = 8;
pub const MAX_FDS: usize = 8;

/// Opcodes understood by the protocol engine. Unlisted opcodes fall through
/// to `NOTSUP` in the dispatcher; this is a plain set of constants rather
/// than an enum so an unrecognized `u32` on the wire is just "no match"
/// instead of a parse error.
pub mod opcode {
    pub const GET_FEATURES: u32 = 1;
    pub const SET_FEATURES: u32 = 2;
    pub const SET_OWNER: u32 = 3;
    pub const RESET_OWNER: u32 = 4;
    pub const SET_MEM_TABLE: u32 = 5;
    pub const SET_LOG_BASE: u32 = 6;
    pub const SET_LOG_FD: u32 = 7;
    pub const SET_VRING_NUM: u32 = 8;
    pub const SET_VRING_ADDR: u32 = 9;
    pub const SET_VRING_BASE: u32 = 10;
    pub const GET_VRING_BASE: u32 = 11;
    pub const SET_VRING_KICK: u32 = 12;
    pub const SET_VRING_CALL: u32 = 13;
    pub const SET_VRING_ERR: u32 = 14;
    pub const GET_PROTOCOL_FEATURES: u32 = 15;
    pub const SET_PROTOCOL_FEATURES: u32 = 16;
    pub const GET_QUEUE_NUM: u32 = 17;
    pub const SET_VRING_ENABLE: u32 = 18;
    pub const SEND_RARP: u32 = 19;
    pub const NET_SET_MTU: u32 = 20;
    pub const SET_SLAVE_REQ_FD: u32 = 21;
    pub const IOTLB_MSG: u32 = 22;
    pub const SET_VRING_ENDIAN: u32 = 23;
    pub const GET_CONFIG: u32 = 24;
    pub const SET_CONFIG: u32 = 25;
    pub const CREATE_CRYPTO_SESSION: u32 = 26;
    pub const CLOSE_CRYPTO_SESSION: u32 = 27;
    pub const POSTCOPY_ADVISE: u32 = 28;
    pub const POSTCOPY_LISTEN: u32 = 29;
    pub const POSTCOPY_END: u32 = 30;
    pub const GET_INFLIGHT_FD: u32 = 31;
    pub const SET_INFLIGHT_FD: u32 = 32;
}

/// Header flag bits.
pub mod flags {
    /// Low two bits: protocol version, must be 1.
    pub const VERSION_MASK: u32 = 0x3;
    pub const VERSION: u32 = 0x1;
    pub const REPLY: u32 = 0x1 << 2;
    pub const REPLY_ACK: u32 = 0x1 << 3;
}

bitflags::bitflags! {
    /// Master (virtio) feature bits the engine itself is aware of. Device
    /// types contribute additional virtio feature bits via
    /// `DeviceType::get_features`.
    pub struct VhostUserVirtioFeatures: u64 {
        const PROTOCOL_FEATURES = 1 << 30;
    }
}

bitflags::bitflags! {
    pub struct VhostUserProtocolFeatures: u64 {
        const MQ               = 1 << 0;
        const LOG_SHMFD        = 1 << 1;
        const RARP             = 1 << 2;
        const REPLY_ACK        = 1 << 3;
        const MTU              = 1 << 4;
        const SLAVE_REQ        = 1 << 5;
        const CROSS_ENDIAN     = 1 << 6;
        const CRYPTO_SESSION   = 1 << 7;
        const PAGEFAULT        = 1 << 8;
        const CONFIG           = 1 << 9;
        const SLAVE_SEND_FD    = 1 << 10;
        const HOST_NOTIFIER    = 1 << 11;
        const INFLIGHT_SHMFD   = 1 << 12;
    }
}

/// Protocol features this engine implements support for. See DESIGN.md for
/// why `INFLIGHT_SHMFD` is included alongside the four spec.md names
/// explicitly: without it no real master would ever send
/// `GET_INFLIGHT_FD`/`SET_INFLIGHT_FD`, which the handler table otherwise
/// dead-codes.
pub const SUPPORTED_PROTOCOL_FEATURES: VhostUserProtocolFeatures = VhostUserProtocolFeatures::from_bits_truncate(
    VhostUserProtocolFeatures::MQ.bits()
        | VhostUserProtocolFeatures::LOG_SHMFD.bits()
        | VhostUserProtocolFeatures::REPLY_ACK.bits()
        | VhostUserProtocolFeatures::CONFIG.bits()
        | VhostUserProtocolFeatures::INFLIGHT_SHMFD.bits(),
);

/// 12-byte message header, always read first.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromZeroes, FromBytes, AsBytes)]
pub struct Header {
    pub request: u32,
    pub flags: u32,
    pub size: u32,
}

impl Header {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn needs_reply_ack(&self) -> bool {
        self.flags & flags::REPLY_ACK != 0
    }

    pub fn is_reply(&self) -> bool {
        self.flags & flags::REPLY != 0
    }

    pub fn reply_header(request: u32, size: u32) -> Self {
        Header {
            request,
            flags: flags::VERSION | flags::REPLY,
            size,
        }
    }
}

/// A bare `u64` payload, used for most getter/setter/ack messages
/// (`GET_FEATURES`, `SET_FEATURES`, `GET_PROTOCOL_FEATURES`,
/// `SET_PROTOCOL_FEATURES`, `GET_QUEUE_NUM` reply, REPLY_ACK status).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromZeroes, FromBytes, AsBytes)]
pub struct U64Payload {
    pub value: u64,
}

impl U64Payload {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Header of the `SET_MEM_TABLE` payload; followed by `num_regions`
/// `MemoryRegionPayload` entries.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromZeroes, FromBytes, AsBytes)]
pub struct MemoryTableHeader {
    pub num_regions: u32,
    pub padding: u32,
}

impl MemoryTableHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromZeroes, FromBytes, AsBytes)]
pub struct MemoryRegionPayload {
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub user_addr: u64,
    pub mmap_offset: u64,
}

impl MemoryRegionPayload {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// `SET_VRING_NUM`, `SET_VRING_BASE` request and `GET_VRING_BASE` reply,
/// and (reinterpreting `num` as a boolean) `SET_VRING_ENABLE`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromZeroes, FromBytes, AsBytes)]
pub struct VringState {
    pub index: u32,
    pub num: u32,
}

impl VringState {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromZeroes, FromBytes, AsBytes)]
pub struct VringAddr {
    pub index: u32,
    pub flags: u32,
    pub descriptor: u64,
    pub used: u64,
    pub available: u64,
    pub log: u64,
}

impl VringAddr {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Low bits of the `u64` payload carried by `SET_VRING_KICK/CALL/ERR`
/// select the vring index; `NOFD` indicates no file descriptor was
/// attached (polling mode), which this engine does not support.
pub const VRING_IDX_MASK: u64 = 0xff;
pub const VRING_NOFD_MASK: u64 = 1 << 8;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromZeroes, FromBytes, AsBytes)]
pub struct ConfigHeader {
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
}

impl ConfigHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

pub const CONFIG_MAX_SIZE: u32 = 256;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromZeroes, FromBytes, AsBytes)]
pub struct Inflight {
    pub mmap_size: u64,
    pub mmap_offset: u64,
    pub num_queues: u16,
    pub queue_size: u16,
}

impl Inflight {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Per-queue header inside the inflight shared memory region. Field layout
/// is fixed by the vhost-user inflight I/O extension.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromZeroes, FromBytes, AsBytes)]
pub struct InflightSplitRegion {
    pub features: u64,
    pub version: u16,
    pub desc_num: u16,
    pub last_batch_head: u16,
    pub used_idx: u16,
    pub _pad: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromZeroes, FromBytes, AsBytes)]
pub struct InflightSplitDesc {
    pub inflight: u8,
    pub padding: [u8; 5],
    pub next: u16,
    pub counter: u64,
}

impl InflightSplitRegion {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

impl InflightSplitDesc {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}
