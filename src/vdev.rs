// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-connection device state and the `INITIALIZED -> LISTENING ->
//! CONNECTED -> LISTENING ...` state machine. See spec.md §3, §4.4.

use std::collections::HashMap;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use mio::net::{UnixListener, UnixStream};

use crate::backend::{DeviceType, RequestQueue};
use crate::error::{Error, Result};
use crate::inflight::InflightRegion;
use crate::memory::MemoryMap;
use crate::message::SUPPORTED_PROTOCOL_FEATURES;
use crate::vring::Vring;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Initialized,
    Listening,
    Connected,
}

pub struct Vdev {
    pub(crate) id: u64,
    pub(crate) socket_path: PathBuf,
    pub(crate) state: ConnState,
    pub(crate) listener: UnixListener,
    pub(crate) conn: Option<UnixStream>,

    pub(crate) device_type: Box<dyn DeviceType>,
    pub(crate) rq: Arc<dyn RequestQueue>,

    pub(crate) supported_master_features: u64,
    pub(crate) negotiated_master_features: u64,
    pub(crate) negotiated_protocol_features: u64,
    pub(crate) is_owned: bool,

    pub(crate) qmax: usize,
    pub(crate) vrings: Vec<Vring>,

    pub(crate) mem: MemoryMap,
    pub(crate) inflight: Option<InflightRegion>,

    pub(crate) private_data: Option<Box<dyn std::any::Any + Send>>,
}

/// Default virtio feature bits the engine always advertises, independent
/// of the device type (spec.md §6).
pub const DEFAULT_FEATURES: u64 = crate::message::VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits();

impl Vdev {
    fn new(
        id: u64,
        socket_path: &Path,
        device_type: Box<dyn DeviceType>,
        max_queues: usize,
        rq: Arc<dyn RequestQueue>,
    ) -> Result<Self> {
        bind_listen_socket(socket_path)?;
        let listener = UnixListener::bind(socket_path).map_err(Error::Io)?;

        let supported_master_features = DEFAULT_FEATURES | device_type.get_features();
        let vrings = (0..max_queues).map(Vring::new).collect();

        Ok(Vdev {
            id,
            socket_path: socket_path.to_path_buf(),
            state: ConnState::Initialized,
            listener,
            conn: None,
            device_type,
            rq,
            supported_master_features,
            negotiated_master_features: 0,
            negotiated_protocol_features: 0,
            is_owned: false,
            qmax: max_queues,
            vrings,
            mem: MemoryMap::new(),
            inflight: None,
            private_data: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn listen_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn conn_raw_fd(&self) -> Option<RawFd> {
        self.conn.as_ref().map(|c| c.as_raw_fd())
    }

    pub fn set_private_data<T: std::any::Any + Send>(&mut self, data: T) {
        self.private_data = Some(Box::new(data));
    }

    pub fn private_data<T: std::any::Any>(&self) -> Option<&T> {
        self.private_data.as_deref().and_then(|d| d.downcast_ref())
    }

    fn transition(&mut self, to: ConnState, event: &'static str) -> Result<()> {
        let ok = matches!(
            (self.state, to),
            (ConnState::Initialized, ConnState::Listening)
                | (ConnState::Listening, ConnState::Connected)
                | (ConnState::Connected, ConnState::Listening)
        );
        if !ok {
            return Err(Error::InvalidTransition(state_name(self.state), event));
        }
        self.state = to;
        Ok(())
    }

    /// `INITIALIZED -> LISTENING`: the event loop still has to register
    /// `listen_raw_fd()` with its `Poll`; this only advances local state.
    pub fn arm_listening(&mut self) -> Result<()> {
        self.transition(ConnState::Listening, "arm_listening")
    }

    /// `LISTENING -> CONNECTED`: accepts one connection, sets it
    /// non-blocking (mio UnixStream always is) and records it.
    pub fn accept(&mut self) -> Result<()> {
        let (stream, _addr) = self.listener.accept().map_err(Error::Io)?;
        self.transition(ConnState::Connected, "accept")?;
        self.conn = Some(stream);
        Ok(())
    }

    /// `CONNECTED -> LISTENING`: tears down every piece of per-connection
    /// state (memory map, vrings, ownership) and drops the connection fd.
    /// Any vring still enabled has its kick fd detached from the request
    /// queue's event loop first.
    pub fn disconnect(&mut self) -> Result<()> {
        self.transition(ConnState::Listening, "disconnect")?;

        for vring in &mut self.vrings {
            if vring.kick_registered {
                if let Some(fd) = vring.kick_raw_fd() {
                    if let Err(e) = self.rq.detach_event(fd) {
                        log::warn!("failed to detach kick fd on disconnect: {}", e);
                    }
                }
            }
            vring.reset();
        }
        self.mem.unmap_all();
        self.inflight = None;
        self.is_owned = false;
        self.negotiated_master_features = 0;
        self.negotiated_protocol_features = 0;
        self.conn = None;
        Ok(())
    }

    /// Full teardown: as `disconnect` plus closing the listen socket. The
    /// listener's `Drop` closes the fd; callers must also remove this
    /// device from the registry.
    pub fn uninit(&mut self) {
        if self.state == ConnState::Connected {
            let _ = self.disconnect();
        }
        self.mem.unmap_all();
        self.inflight = None;
    }

    pub fn max_queues(&self) -> usize {
        self.qmax
    }

    pub fn supported_protocol_features(&self) -> u64 {
        SUPPORTED_PROTOCOL_FEATURES.bits()
    }

    /// Read-only access to every vring record, for a `DeviceType`'s
    /// `dispatch_requests` to pull ring geometry and kick/call/err fds
    /// from (spec.md §4.6).
    pub fn vrings(&self) -> &[Vring] {
        &self.vrings
    }

    /// Read-only access to the guest memory map, for translating the
    /// addresses found in `vrings()[..].client_info`.
    pub fn memory(&self) -> &MemoryMap {
        &self.mem
    }

    /// The inflight-tracking region, if one has been negotiated.
    pub fn inflight(&self) -> Option<&InflightRegion> {
        self.inflight.as_ref()
    }
}

fn state_name(s: ConnState) -> &'static str {
    match s {
        ConnState::Initialized => "INITIALIZED",
        ConnState::Listening => "LISTENING",
        ConnState::Connected => "CONNECTED",
    }
}

/// Prepares `path` for `bind()`: an existing regular file is an error, an
/// existing socket file is unlinked, a missing path is left for `bind` to
/// create (spec.md §6).
fn bind_listen_socket(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_socket() {
                std::fs::remove_file(path).map_err(Error::Io)?;
                Ok(())
            } else {
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "socket path exists and is not a socket",
                )))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Process-wide registry of live devices, linked on `init_server` and
/// unlinked on `uninit` (spec.md §5). Mutated only from the vhost loop;
/// the intrusive list in the original design has no semantic value here,
/// so this is a plain map keyed by an opaque id (spec.md §9).
pub(crate) struct Registry {
    next_id: AtomicU64,
    devices: Mutex<HashMap<u64, Arc<Mutex<Vdev>>>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        next_id: AtomicU64::new(1),
        devices: Mutex::new(HashMap::new()),
    })
}

pub(crate) fn register_new(
    socket_path: &Path,
    device_type: Box<dyn DeviceType>,
    max_queues: usize,
    rq: Arc<dyn RequestQueue>,
) -> Result<Arc<Mutex<Vdev>>> {
    let id = registry().next_id.fetch_add(1, Ordering::Relaxed);
    let vdev = match Vdev::new(id, socket_path, device_type, max_queues, rq) {
        Ok(vdev) => vdev,
        Err(e) => return Err(e),
    };
    let handle = Arc::new(Mutex::new(vdev));
    registry()
        .devices
        .lock()
        .unwrap()
        .insert(id, Arc::clone(&handle));
    Ok(handle)
}

pub(crate) fn unregister(id: u64) {
    registry().devices.lock().unwrap().remove(&id);
}

pub(crate) fn get(id: u64) -> Option<Arc<Mutex<Vdev>>> {
    registry().devices.lock().unwrap().get(&id).cloned()
}

pub(crate) fn all_ids() -> Vec<u64> {
    registry().devices.lock().unwrap().keys().copied().collect()
}
