// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A vhost-user protocol engine: the per-device connection state machine,
//! guest memory mapping table, virtqueue attachment protocol, and
//! inflight-tracking region needed to serve a para-virtualized device to a
//! vhost-user master over a UNIX stream socket.
//!
//! What this crate does *not* do: parse descriptor chains into block or
//! filesystem requests, walk virtqueue rings, or run a generic event loop
//! for anything other than the vhost connection itself. Those are supplied
//! by the caller through [`DeviceType`] and [`RequestQueue`].

mod backend;
mod engine;
mod error;
mod event_loop;
mod inflight;
mod memory;
mod message;
mod socket;
mod vdev;
mod vring;

pub use backend::{DeviceType, RequestQueue};
pub use error::{Error, Result};
pub use event_loop::{start_vhost_event_loop, DeviceHandle, VhostEventLoop};
pub use inflight::InflightRegion;
pub use memory::MemoryMap;
pub use message::{VhostUserProtocolFeatures, VhostUserVirtioFeatures, SUPPORTED_PROTOCOL_FEATURES};
pub use vdev::{ConnState, Vdev, DEFAULT_FEATURES};
pub use vring::{ClientInfo, Vring};
