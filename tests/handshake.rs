// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end tests driving a real `UnixStream` pair through the vhost-user
//! handshake, memory table, and vring-enable scenarios (spec.md §8, S1-S6).
//! Speaks the wire protocol directly rather than importing the crate's
//! internal message types, the way an actual vhost-user master would.

use std::io::Read;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use nix::unistd::pipe;

use vhost_user_slave::{start_vhost_event_loop, DeviceType, RequestQueue, Vdev, DEFAULT_FEATURES};

const GET_FEATURES: u32 = 1;
const SET_FEATURES: u32 = 2;
const SET_OWNER: u32 = 3;
const SET_MEM_TABLE: u32 = 5;
const SET_VRING_NUM: u32 = 8;
const SET_VRING_ADDR: u32 = 9;
const SET_VRING_BASE: u32 = 10;
const SET_VRING_KICK: u32 = 12;
const SET_VRING_CALL: u32 = 13;
const GET_PROTOCOL_FEATURES: u32 = 15;
const SET_PROTOCOL_FEATURES: u32 = 16;
const SET_VRING_ENABLE: u32 = 18;

const VERSION: u32 = 1;
const FLAG_REPLY: u32 = 1 << 2;
const FLAG_REPLY_ACK: u32 = 1 << 3;

const PROTOCOL_F_REPLY_ACK: u64 = 1 << 3;

fn header(request: u32, flags: u32, size: u32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&request.to_le_bytes());
    buf[4..8].copy_from_slice(&flags.to_le_bytes());
    buf[8..12].copy_from_slice(&size.to_le_bytes());
    buf
}

fn send(stream: &UnixStream, request: u32, flags: u32, payload: &[u8]) {
    send_with_fds(stream, request, flags, payload, &[]);
}

fn send_with_fds(stream: &UnixStream, request: u32, flags: u32, payload: &[u8], fds: &[RawFd]) {
    let hdr = header(request, flags, payload.len() as u32);
    let mut buf = Vec::with_capacity(12 + payload.len());
    buf.extend_from_slice(&hdr);
    buf.extend_from_slice(payload);

    let iov = [std::io::IoSlice::new(&buf)];
    let cmsgs: Vec<ControlMessage> = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None).unwrap();
}

fn recv(stream: &mut UnixStream) -> (u32, u32, Vec<u8>) {
    let mut hdr = [0u8; 12];
    stream.read_exact(&mut hdr).unwrap();
    let request = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
    let flags = u32::from_le_bytes(hdr[4..8].try_into().unwrap());
    let size = u32::from_le_bytes(hdr[8..12].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; size];
    if size > 0 {
        stream.read_exact(&mut payload).unwrap();
    }
    (request, flags, payload)
}

fn u64_payload(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

fn read_u64(payload: &[u8]) -> u64 {
    u64::from_le_bytes(payload[0..8].try_into().unwrap())
}

fn vring_state_payload(index: u32, num: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&index.to_le_bytes());
    buf[4..8].copy_from_slice(&num.to_le_bytes());
    buf
}

fn vring_addr_payload(index: u32, descriptor: u64, used: u64, available: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // flags
    buf.extend_from_slice(&descriptor.to_le_bytes());
    buf.extend_from_slice(&used.to_le_bytes());
    buf.extend_from_slice(&available.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes()); // log
    buf
}

struct FakeDevice {
    features: u64,
    negotiated: Arc<AtomicU64>,
}

impl DeviceType for FakeDevice {
    fn get_features(&self) -> u64 {
        self.features
    }
    fn set_features(&mut self, negotiated: u64) -> vhost_user_slave::Result<()> {
        self.negotiated.store(negotiated, Ordering::SeqCst);
        Ok(())
    }
    fn dispatch_requests(
        &mut self,
        _vdev: &Vdev,
        _vring_id: usize,
        _rq: &dyn RequestQueue,
    ) -> vhost_user_slave::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeRq {
    attached: Mutex<Vec<(RawFd, usize)>>,
    detached: Mutex<Vec<RawFd>>,
}

impl RequestQueue for FakeRq {
    fn attach_event(&self, fd: RawFd, vring_id: usize) -> vhost_user_slave::Result<()> {
        self.attached.lock().unwrap().push((fd, vring_id));
        Ok(())
    }
    fn detach_event(&self, fd: RawFd) -> vhost_user_slave::Result<()> {
        self.detached.lock().unwrap().push(fd);
        Ok(())
    }
}

/// Returns a pipe's read end as a standalone kick/call-style fd. Good enough
/// for these tests, which only check that the fd is registered/detached;
/// nothing here expects eventfd semantics.
fn dummy_fd() -> OwnedFd {
    let (read_end, _write_end) = pipe().unwrap();
    read_end
}

fn memfd(size: u64) -> OwnedFd {
    let name = std::ffi::CString::new("handshake-test").unwrap();
    let fd = nix::sys::memfd::memfd_create(&name, nix::sys::memfd::MemFdCreateFlag::empty())
        .unwrap();
    nix::unistd::ftruncate(&fd, size as i64).unwrap();
    fd
}

fn connect(el: &vhost_user_slave::VhostEventLoop, path: &std::path::Path) -> (UnixStream, Arc<AtomicU64>, Arc<FakeRq>, vhost_user_slave::DeviceHandle) {
    let negotiated = Arc::new(AtomicU64::new(0));
    let rq = Arc::new(FakeRq::default());
    let device = Box::new(FakeDevice {
        features: 0x1,
        negotiated: Arc::clone(&negotiated),
    });
    let rq_handle: Arc<dyn RequestQueue> = Arc::clone(&rq);
    let handle = el.init_server(path, device, 4, rq_handle).unwrap();

    let stream = UnixStream::connect(path).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    (stream, negotiated, rq, handle)
}

#[test]
fn s1_handshake_negotiates_features_and_owner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vhost.sock");
    let el = start_vhost_event_loop().unwrap();
    let (mut stream, negotiated, _rq, handle) = connect(&el, &path);

    send(&stream, GET_FEATURES, VERSION, &[]);
    let (req, flags, payload) = recv(&mut stream);
    assert_eq!(req, GET_FEATURES);
    assert_eq!(flags, VERSION | FLAG_REPLY);
    let supported = read_u64(&payload);
    assert_eq!(supported, DEFAULT_FEATURES | 0x1);

    send(&stream, SET_FEATURES, VERSION, &u64_payload(supported));
    send(&stream, SET_OWNER, VERSION, &[]);

    send(&stream, GET_PROTOCOL_FEATURES, VERSION, &[]);
    let (req, _flags, payload) = recv(&mut stream);
    assert_eq!(req, GET_PROTOCOL_FEATURES);
    let proto = read_u64(&payload);
    assert_eq!(proto & PROTOCOL_F_REPLY_ACK, PROTOCOL_F_REPLY_ACK);

    send(
        &stream,
        SET_PROTOCOL_FEATURES,
        VERSION,
        &u64_payload(PROTOCOL_F_REPLY_ACK),
    );

    // Give the engine a moment to run SET_FEATURES before asserting on it;
    // the GET_PROTOCOL_FEATURES round trip above already proves the engine
    // processed everything before it in order, so no sleep is needed.
    assert_eq!(negotiated.load(Ordering::SeqCst), supported);

    handle.uninit().unwrap();
    el.stop().unwrap();
}

#[test]
fn s2_set_mem_table_acks_success() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vhost.sock");
    let el = start_vhost_event_loop().unwrap();
    let (mut stream, _negotiated, _rq, handle) = connect(&el, &path);

    negotiate_reply_ack(&mut stream);

    let mut payload = Vec::new();
    payload.extend_from_slice(&1u32.to_le_bytes()); // num_regions
    payload.extend_from_slice(&0u32.to_le_bytes()); // padding
    payload.extend_from_slice(&0u64.to_le_bytes()); // gpa
    payload.extend_from_slice(&0x10000u64.to_le_bytes()); // size
    payload.extend_from_slice(&0x7f00_0000_0000u64.to_le_bytes()); // uva
    payload.extend_from_slice(&0u64.to_le_bytes()); // mmap offset

    let fd = memfd(0x10000);
    send_with_fds(
        &stream,
        SET_MEM_TABLE,
        VERSION | FLAG_REPLY_ACK,
        &payload,
        &[fd.as_raw_fd()],
    );

    let (req, _flags, ack) = recv(&mut stream);
    assert_eq!(req, SET_MEM_TABLE);
    assert_eq!(read_u64(&ack), 0);

    handle.uninit().unwrap();
    el.stop().unwrap();
}

#[test]
fn s3_vring_enable_legacy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vhost.sock");
    let el = start_vhost_event_loop().unwrap();
    let (stream, _negotiated, rq, handle) = connect(&el, &path);

    set_up_memory(&stream);

    send(&stream, SET_VRING_NUM, VERSION, &vring_state_payload(0, 256));
    send(&stream, SET_VRING_BASE, VERSION, &vring_state_payload(0, 0));
    send(
        &stream,
        SET_VRING_ADDR,
        VERSION,
        &vring_addr_payload(0, 0x7f00_0000_1000, 0x7f00_0000_2000, 0x7f00_0000_3000),
    );
    let callfd = dummy_fd();
    send_with_fds(&stream, SET_VRING_CALL, VERSION, &u64_payload(0), &[callfd.as_raw_fd()]);
    let kickfd = dummy_fd();
    send_with_fds(&stream, SET_VRING_KICK, VERSION, &u64_payload(0), &[kickfd.as_raw_fd()]);

    // No protocol features negotiated: the kick message alone enables the
    // vring, so the fd should already be attached to the request queue.
    wait_for(|| rq.attached.lock().unwrap().len() == 1);
    assert_eq!(rq.attached.lock().unwrap()[0].1, 0);

    handle.uninit().unwrap();
    el.stop().unwrap();
}

#[test]
fn s4_vring_enable_modern_requires_explicit_enable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vhost.sock");
    let el = start_vhost_event_loop().unwrap();
    let (mut stream, _negotiated, rq, handle) = connect(&el, &path);

    negotiate_reply_ack(&mut stream);
    set_up_memory(&stream);
    // `negotiate_reply_ack` already drained the GET_FEATURES reply; nothing
    // further is read from `stream` in this test, so it stays `mut` only for
    // that earlier call.

    send(&stream, SET_VRING_NUM, VERSION, &vring_state_payload(0, 256));
    send(&stream, SET_VRING_BASE, VERSION, &vring_state_payload(0, 0));
    send(
        &stream,
        SET_VRING_ADDR,
        VERSION,
        &vring_addr_payload(0, 0x7f00_0000_1000, 0x7f00_0000_2000, 0x7f00_0000_3000),
    );
    let callfd = dummy_fd();
    send_with_fds(&stream, SET_VRING_CALL, VERSION, &u64_payload(0), &[callfd.as_raw_fd()]);
    let kickfd = dummy_fd();
    send_with_fds(&stream, SET_VRING_KICK, VERSION, &u64_payload(0), &[kickfd.as_raw_fd()]);

    std::thread::sleep(Duration::from_millis(50));
    assert!(rq.attached.lock().unwrap().is_empty());

    send(&stream, SET_VRING_ENABLE, VERSION, &vring_state_payload(0, 1));
    wait_for(|| rq.attached.lock().unwrap().len() == 1);

    handle.uninit().unwrap();
    el.stop().unwrap();
}

#[test]
fn s5_reconnect_detaches_vring_and_resets_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vhost.sock");
    let el = start_vhost_event_loop().unwrap();
    let (stream, _negotiated, rq, handle) = connect(&el, &path);

    set_up_memory(&stream);
    send(&stream, SET_VRING_NUM, VERSION, &vring_state_payload(0, 256));
    send(&stream, SET_VRING_BASE, VERSION, &vring_state_payload(0, 0));
    send(
        &stream,
        SET_VRING_ADDR,
        VERSION,
        &vring_addr_payload(0, 0x7f00_0000_1000, 0x7f00_0000_2000, 0x7f00_0000_3000),
    );
    let kickfd = dummy_fd();
    let kick_raw = kickfd.as_raw_fd();
    send_with_fds(&stream, SET_VRING_KICK, VERSION, &u64_payload(0), &[kick_raw]);
    wait_for(|| !rq.attached.lock().unwrap().is_empty());

    drop(stream);
    wait_for(|| !rq.detached.lock().unwrap().is_empty());

    let mut reconnected = UnixStream::connect(&path).unwrap();
    reconnected
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    send(&reconnected, GET_FEATURES, VERSION, &[]);
    let (req, _flags, payload) = recv(&mut reconnected);
    assert_eq!(req, GET_FEATURES);
    assert_eq!(read_u64(&payload), DEFAULT_FEATURES | 0x1);

    handle.uninit().unwrap();
    el.stop().unwrap();
}

#[test]
fn s6_reply_ack_error_path_reports_einval() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vhost.sock");
    let el = start_vhost_event_loop().unwrap();
    let (mut stream, _negotiated, _rq, handle) = connect(&el, &path);

    negotiate_reply_ack(&mut stream);

    send(
        &stream,
        SET_VRING_NUM,
        VERSION | FLAG_REPLY_ACK,
        &vring_state_payload(99, 256),
    );
    let (req, _flags, ack) = recv(&mut stream);
    assert_eq!(req, SET_VRING_NUM);
    assert_eq!(read_u64(&ack), libc::EINVAL as u64);

    handle.uninit().unwrap();
    el.stop().unwrap();
}

fn negotiate_reply_ack(stream: &mut UnixStream) {
    send(stream, GET_FEATURES, VERSION, &[]);
    let (_, _, payload) = recv(stream);
    let supported = read_u64(&payload);
    send(stream, SET_FEATURES, VERSION, &u64_payload(supported));
    send(stream, SET_OWNER, VERSION, &[]);
    send(
        stream,
        SET_PROTOCOL_FEATURES,
        VERSION,
        &u64_payload(PROTOCOL_F_REPLY_ACK),
    );
}

fn set_up_memory(stream: &UnixStream) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&1u32.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&0u64.to_le_bytes());
    payload.extend_from_slice(&0x10000u64.to_le_bytes());
    payload.extend_from_slice(&0x7f00_0000_0000u64.to_le_bytes());
    payload.extend_from_slice(&0u64.to_le_bytes());
    let fd = memfd(0x10000);
    send_with_fds(stream, SET_MEM_TABLE, VERSION, &payload, &[fd.as_raw_fd()]);
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !cond() {
        if start.elapsed() > Duration::from_secs(5) {
            panic!("condition did not become true within 5s");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
