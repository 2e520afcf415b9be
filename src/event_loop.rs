// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The vhost event loop: one dedicated thread that watches every device's
//! listen or connection fd and runs the protocol engine on readability.
//! Grounded on `oathgate-vhost`'s `mio::Poll`/`Events`/`Token` loop
//! (spec.md §5, §6).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{error, trace, warn};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::backend::{DeviceType, RequestQueue};
use crate::engine;
use crate::error::{Error, Result};
use crate::vdev::{self, ConnState, Vdev};

const WAKE_TOKEN: Token = Token(0);

/// A device id's listen-fd token is `2 * id`; its connection-fd token is
/// `2 * id + 1`. Device ids start at 1 (see `vdev::Registry`), so neither
/// ever collides with `WAKE_TOKEN`.
fn listen_token(id: u64) -> Token {
    Token((id as usize) * 2)
}

fn conn_token(id: u64) -> Token {
    Token((id as usize) * 2 + 1)
}

fn device_id_of(token: Token) -> u64 {
    (token.0 / 2) as u64
}

fn token_is_listen(token: Token) -> bool {
    token.0 % 2 == 0
}

/// Handle returned by `start_vhost_event_loop`. Dropping it without calling
/// `stop` leaks the thread (it keeps running); callers are expected to stop
/// it explicitly during shutdown.
pub struct VhostEventLoop {
    registry: mio::Registry,
    waker: Arc<Waker>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Handle to one registered device, returned by `init_server`.
pub struct DeviceHandle {
    id: u64,
    registry: mio::Registry,
}

pub fn start_vhost_event_loop() -> Result<VhostEventLoop> {
    let poll = Poll::new().map_err(Error::Io)?;
    let registry = poll.registry().try_clone().map_err(Error::Io)?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).map_err(Error::Io)?);
    let stop_flag = Arc::new(AtomicBool::new(false));

    let thread_stop_flag = Arc::clone(&stop_flag);
    let thread = std::thread::Builder::new()
        .name("vhost-event-loop".into())
        .spawn(move || run(poll, thread_stop_flag))
        .map_err(Error::Io)?;

    Ok(VhostEventLoop {
        registry,
        waker,
        stop_flag,
        thread: Some(thread),
    })
}

impl VhostEventLoop {
    /// Stops the loop and joins its thread. In-flight handlers complete
    /// before the loop observes the stop flag (spec.md §5).
    pub fn stop(mut self) -> Result<()> {
        self.stop_flag.store(true, Ordering::Release);
        self.interrupt()?;
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "vhost event loop thread panicked",
                ))
            })?;
        }
        Ok(())
    }

    /// Wakes the loop exactly once, e.g. after setting the stop flag or to
    /// force it to notice a newly registered device without waiting for
    /// unrelated I/O.
    pub fn interrupt(&self) -> Result<()> {
        self.waker.wake().map_err(Error::Io)
    }

    /// Creates the listen socket, initializes the device, publishes it to
    /// the process-wide registry and arms `INITIALIZED -> LISTENING`,
    /// registering the listen fd with this loop's `Poll`. On failure while
    /// arming, the device is immediately uninitialized (spec.md §6).
    pub fn init_server(
        &self,
        socket_path: impl AsRef<Path>,
        device_type: Box<dyn DeviceType>,
        max_queues: usize,
        rq: Arc<dyn RequestQueue>,
    ) -> Result<DeviceHandle> {
        let handle = vdev::register_new(socket_path.as_ref(), device_type, max_queues, rq)?;

        let id = {
            let mut vdev = handle.lock().unwrap();
            let id = vdev.id();
            if let Err(e) = vdev
                .arm_listening()
                .and_then(|()| self.register_listen(&mut vdev))
            {
                drop(vdev);
                vdev::unregister(id);
                return Err(e);
            }
            id
        };

        Ok(DeviceHandle {
            id,
            registry: self.registry.try_clone().map_err(Error::Io)?,
        })
    }

    fn register_listen(&self, vdev: &mut Vdev) -> Result<()> {
        self.registry
            .register(&mut vdev.listener, listen_token(vdev.id()), Interest::READABLE)
            .map_err(Error::Io)
    }
}

impl DeviceHandle {
    /// Tears the device down. Idempotent: safe to call once; calling it
    /// twice on the same handle is a programmer error since `uninit`
    /// consumes `self`.
    pub fn uninit(self) -> Result<()> {
        if let Some(handle) = vdev::get(self.id) {
            let mut vdev = handle.lock().unwrap();
            if vdev.state() == ConnState::Connected {
                if let Some(conn) = vdev.conn.as_mut() {
                    let _ = self.registry.deregister(conn);
                }
            }
            let _ = self.registry.deregister(&mut vdev.listener);
            vdev.uninit();
        }
        vdev::unregister(self.id);
        Ok(())
    }
}

fn run(poll: Poll, stop_flag: Arc<AtomicBool>) {
    let mut poll = poll;
    let registry = match poll.registry().try_clone() {
        Ok(r) => r,
        Err(e) => {
            error!("vhost event loop could not clone its registry: {}", e);
            return;
        }
    };
    let mut events = Events::with_capacity(128);

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!("vhost event loop poll failed: {}", e);
            break;
        }

        if stop_flag.load(Ordering::Acquire) {
            break;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }

            let id = device_id_of(token);
            let Some(handle) = vdev::get(id) else {
                trace!("event for unknown device id {}, ignoring", id);
                continue;
            };
            let mut vdev = handle.lock().unwrap();

            if token_is_listen(token) {
                handle_listen_readable(&mut vdev, &registry);
            } else {
                handle_conn_event(&mut vdev, &registry);
            }
        }
    }
}

/// `server_sock_ops.read`: accept the one connection this engine supports
/// per device, switch the vring fds over to the connection token, and stop
/// watching the listen fd (spec.md §4.4). `close` on the listen fd is
/// deliberately not modeled: listen-socket EOF carries no meaning.
fn handle_listen_readable(vdev: &mut Vdev, registry: &mio::Registry) {
    match vdev.accept() {
        Ok(()) => {
            if let Err(e) = registry.deregister(&mut vdev.listener) {
                warn!("failed to deregister listen fd: {}", e);
            }
            if let Some(conn) = vdev.conn.as_mut() {
                if let Err(e) = registry.register(conn, conn_token(vdev.id()), Interest::READABLE) {
                    warn!("failed to register connection fd: {}", e);
                }
            }
        }
        Err(e) => warn!("accept failed on device {}: {}", vdev.id(), e),
    }
}

/// `conn_sock_ops`: drains every message currently buffered on the
/// connection fd, since mio's edge-triggered epoll only wakes the loop once
/// per batch of arriving data — a master that pipelines several requests
/// would otherwise leave all but the first unread until unrelated traffic
/// re-triggers the fd. A clean close or a fatal framing error performs
/// `CONNECTED -> LISTENING` and re-arms the listen fd.
fn handle_conn_event(vdev: &mut Vdev, registry: &mio::Registry) {
    loop {
        match engine::handle_one_message(vdev) {
            Ok(()) => continue,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(Error::Disconnected) => {
                reconnect(vdev, registry);
                break;
            }
            Err(e) => {
                warn!("device {} connection dropped: {}", vdev.id(), e);
                reconnect(vdev, registry);
                break;
            }
        }
    }
}

fn reconnect(vdev: &mut Vdev, registry: &mio::Registry) {
    if let Some(conn) = vdev.conn.as_mut() {
        let _ = registry.deregister(conn);
    }
    if let Err(e) = vdev.disconnect() {
        error!(
            "device {} could not complete CONNECTED -> LISTENING: {}",
            vdev.id(),
            e
        );
        return;
    }
    if let Err(e) = registry.register(&mut vdev.listener, listen_token(vdev.id()), Interest::READABLE) {
        error!("failed to re-arm listen fd for device {}: {}", vdev.id(), e);
    }
}
