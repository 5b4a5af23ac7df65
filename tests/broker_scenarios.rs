// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end broker scenarios over a real localhost listener, with the
//! capture hardware replaced by an in-process fake backend.
//!
//! Each test uses its own physical camera ids so the shared-memory object
//! names cannot collide across concurrently running tests.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::net::TcpListener;
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use camera_daemon::backend::BackendError;
use camera_daemon::backend::CaptureBackend;
use camera_daemon::backend::DequeuedFrame;
use camera_daemon::backend::Result as BackendResult;
use camera_daemon::backend::StreamFormat;
use camera_daemon::broker::serve;
use camera_daemon::broker::BrokerHandle;
use camera_daemon::config::PhysicalCamera;
use camera_daemon::protocol::ControlRecord;
use camera_daemon::protocol::RequestKind;
use camera_daemon::protocol::ResponseCode;
use camera_daemon::Broker;
use camera_daemon::Config;

#[derive(Default)]
struct CameraFake {
    queued: VecDeque<usize>,
    queue_calls: u64,
    fail_dequeues: u32,
    gated: bool,
    started: bool,
    stopped: bool,
    sequence: u32,
}

#[derive(Default)]
struct FakeShared {
    cameras: Mutex<BTreeMap<u32, CameraFake>>,
}

impl FakeShared {
    fn queue_calls(&self, id: u32) -> u64 {
        self.cameras
            .lock()
            .unwrap()
            .get(&id)
            .map(|c| c.queue_calls)
            .unwrap_or(0)
    }

    fn stopped(&self, id: u32) -> bool {
        self.cameras
            .lock()
            .unwrap()
            .get(&id)
            .map(|c| c.stopped)
            .unwrap_or(false)
    }

    /// Holds back frame delivery so tests can settle subscriptions first.
    fn set_gate(&self, id: u32, closed: bool) {
        self.cameras.lock().unwrap().entry(id).or_default().gated = closed;
    }

    fn set_fail_dequeues(&self, id: u32, count: u32) {
        self.cameras
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .fail_dequeues = count;
    }
}

struct FakeBackend {
    shared: Arc<FakeShared>,
}

impl CaptureBackend for FakeBackend {
    fn open(&mut self, id: u32) -> BackendResult<()> {
        self.shared.cameras.lock().unwrap().entry(id).or_default();
        Ok(())
    }
    fn close(&mut self, _id: u32) {}
    fn configure_sensor(&mut self, _id: u32) -> BackendResult<()> {
        Ok(())
    }
    fn configure_streams(&mut self, _id: u32, _format: &StreamFormat) -> BackendResult<()> {
        Ok(())
    }
    fn request_buffers(&mut self, _id: u32, _count: u32) -> BackendResult<()> {
        Ok(())
    }
    fn queue(&mut self, id: u32, slot: usize, _addr: usize, _length: u32) -> BackendResult<()> {
        let mut cameras = self.shared.cameras.lock().unwrap();
        let camera = cameras.entry(id).or_default();
        camera.queued.push_back(slot);
        camera.queue_calls += 1;
        Ok(())
    }
    fn dequeue(&mut self, id: u32) -> BackendResult<DequeuedFrame> {
        let mut cameras = self.shared.cameras.lock().unwrap();
        let camera = cameras.entry(id).or_default();
        if camera.fail_dequeues > 0 {
            camera.fail_dequeues -= 1;
            return Err(BackendError::Failed("EIO".to_string()));
        }
        if camera.gated {
            return Err(BackendError::Again);
        }
        match camera.queued.pop_front() {
            Some(slot) => {
                camera.sequence += 1;
                Ok(DequeuedFrame {
                    slot,
                    sequence: camera.sequence,
                    timestamp_us: camera.sequence as i64 * 33_000,
                })
            }
            None => Err(BackendError::Again),
        }
    }
    fn wait(&mut self, ids: &[u32], timeout: Duration) -> BackendResult<Vec<u32>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let cameras = self.shared.cameras.lock().unwrap();
                let ready: Vec<u32> = ids
                    .iter()
                    .copied()
                    .filter(|id| {
                        cameras.get(id).map_or(false, |c| {
                            c.fail_dequeues > 0 || (!c.gated && !c.queued.is_empty())
                        })
                    })
                    .collect();
                if !ready.is_empty() {
                    return Ok(ready);
                }
            }
            if Instant::now() >= deadline {
                return Err(BackendError::Timeout);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
    fn start(&mut self, id: u32) -> BackendResult<()> {
        self.shared.cameras.lock().unwrap().entry(id).or_default().started = true;
        Ok(())
    }
    fn stop(&mut self, id: u32) -> BackendResult<()> {
        self.shared.cameras.lock().unwrap().entry(id).or_default().stopped = true;
        Ok(())
    }
    fn frame_size(&self, _id: u32, pixel_format: u32, width: u32, height: u32) -> (u32, u32) {
        let (size, _stride, bpp) = camera_daemon::backend::frame_geometry(pixel_format, width, height);
        (size, bpp)
    }
}

struct TestBroker {
    handle: BrokerHandle,
    supervisor: thread::JoinHandle<anyhow::Result<()>>,
    acceptor: thread::JoinHandle<()>,
    shutdown_pipe: std::os::fd::OwnedFd,
    port: u16,
    fake: Arc<FakeShared>,
}

fn start_broker(config_json: &str) -> TestBroker {
    start_broker_with(config_json, None)
}

/// `sndbuf` shrinks the listener's send buffer, which accepted sockets
/// inherit, so congestion toward a non-reading client shows up quickly.
fn start_broker_with(config_json: &str, sndbuf: Option<usize>) -> TestBroker {
    let config = Config::from_str(config_json, "test").unwrap();
    let fake = Arc::new(FakeShared::default());
    let factory_fake = fake.clone();
    let factory = Box::new(move |_group: &[PhysicalCamera]| {
        Ok(Box::new(FakeBackend {
            shared: factory_fake.clone(),
        }) as Box<dyn CaptureBackend>)
    });

    let broker = Broker::with_backend_factory(config, factory);
    let handle = broker.handle();
    let supervisor = thread::spawn(move || broker.run());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    if let Some(bytes) = sndbuf {
        nix::sys::socket::setsockopt(&listener, nix::sys::socket::sockopt::SndBuf, &bytes)
            .unwrap();
    }
    let port = listener.local_addr().unwrap().port();
    let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();
    let acceptor_handle = handle.clone();
    let acceptor = thread::spawn(move || {
        serve(&listener, &acceptor_handle, pipe_read.as_fd());
    });

    TestBroker {
        handle,
        supervisor,
        acceptor,
        shutdown_pipe: pipe_write,
        port,
        fake,
    }
}

impl TestBroker {
    fn connect(&self) -> TestClient {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut client = TestClient {
            stream,
            frames: VecDeque::new(),
        };
        let hello = client.read_record();
        assert_eq!(hello.kind, ResponseCode::Ok as u32);
        client
    }

    fn stop(self) {
        nix::unistd::write(&self.shutdown_pipe, &[0]).unwrap();
        self.acceptor.join().unwrap();
        self.handle.shutdown();
        self.supervisor.join().unwrap().unwrap();
    }
}

struct TestClient {
    stream: TcpStream,
    frames: VecDeque<(i32, i32)>,
}

fn request_record(kind: RequestKind, camera: i32) -> ControlRecord {
    let mut record = ControlRecord::default();
    record.kind = kind as u32;
    record.camera_id = camera;
    record
}

impl TestClient {
    fn read_record(&mut self) -> ControlRecord {
        ControlRecord::read_from(&mut self.stream)
            .expect("read failed")
            .expect("connection closed")
    }

    /// Sends a request and returns its response, queueing any frame-ready
    /// records that arrive in between.
    fn request(&mut self, record: ControlRecord) -> ControlRecord {
        record.write_to(&mut self.stream).unwrap();
        loop {
            let reply = self.read_record();
            if reply.kind == RequestKind::DQBuf as u32 {
                self.frames.push_back((reply.camera_id, reply.buffer.index));
                continue;
            }
            return reply;
        }
    }

    fn expect_ok(&mut self, kind: RequestKind, camera: i32) {
        let reply = self.request(request_record(kind, camera));
        assert_eq!(
            reply.kind,
            ResponseCode::Ok as u32,
            "{:?} on camera {} failed with {:#x}",
            kind,
            camera,
            reply.kind
        );
    }

    fn request_code(&mut self, kind: RequestKind, camera: i32) -> u32 {
        self.request(request_record(kind, camera)).kind
    }

    fn set_format(&mut self, camera: i32, pixel_format: u32, width: u32, height: u32) -> u32 {
        let mut record = request_record(RequestKind::SetFormat, camera);
        record.format.pixel_format = pixel_format;
        record.format.size.width = width;
        record.format.size.height = height;
        self.request(record).kind
    }

    /// A release; successful ones are not acknowledged, so this only
    /// writes.
    fn qbuf(&mut self, camera: i32, slot: i32) {
        let mut record = request_record(RequestKind::QBuf, camera);
        record.buffer.index = slot;
        record.write_to(&mut self.stream).unwrap();
    }

    /// One record if any arrives within `timeout`, `None` otherwise.
    fn try_read(&mut self, timeout: Duration) -> Option<ControlRecord> {
        self.stream.set_read_timeout(Some(timeout)).unwrap();
        let result = ControlRecord::read_from(&mut self.stream);
        self.stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        match result {
            Ok(record) => record,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(e) => panic!("read failed: {}", e),
        }
    }

    /// Next frame-ready record, from the queue or the wire.
    fn next_frame(&mut self) -> (i32, i32) {
        if let Some(frame) = self.frames.pop_front() {
            return frame;
        }
        loop {
            let record = self.read_record();
            if record.kind == RequestKind::DQBuf as u32 {
                return (record.camera_id, record.buffer.index);
            }
            panic!("unexpected record {:#x} while waiting for a frame", record.kind);
        }
    }
}

fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

const YUYV: u32 = camera_daemon::backend::fourcc::YUYV;

// One client, one device, full round trip with exact queue accounting.
#[test]
fn single_client_round_trip() {
    let broker = start_broker(
        r#"{
            "phy_camera": [ { "id": 0, "width": 640, "height": 480, "format": "YUYV" } ],
            "VM1": [ { "camera": { "id": 0, "phy_id": 0 } } ]
        }"#,
    );
    let mut client = broker.connect();

    client.expect_ok(RequestKind::Open, 0);
    assert_eq!(client.set_format(0, YUYV, 640, 480), ResponseCode::Ok as u32);
    client.expect_ok(RequestKind::CreateBuffer, 0);

    let shm = Path::new("/dev/shm/camera_daemon_mem_0");
    assert!(shm.exists());
    let page = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .unwrap()
        .unwrap() as u64;
    let frame = 640 * 480 * 2u64;
    let aligned = (frame + page - 1) / page * page;
    assert_eq!(std::fs::metadata(shm).unwrap().len(), 6 * aligned);

    client.expect_ok(RequestKind::StreamOn, 0);
    wait_until("initial queue submissions", || broker.fake.queue_calls(0) == 6);

    // All six slots arrive in some order; release each as it comes.
    let mut seen = BTreeSet::new();
    for _ in 0..6 {
        let (camera, slot) = client.next_frame();
        assert_eq!(camera, 0);
        assert!(seen.insert(slot), "slot {} delivered twice", slot);
        client.qbuf(0, slot);
    }
    assert_eq!(seen, (0..6).collect::<BTreeSet<i32>>());

    // Six initial submissions plus one re-queue per release, and nothing
    // more until the second round of frames is released.
    wait_until("re-queues after release", || broker.fake.queue_calls(0) == 12);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(broker.fake.queue_calls(0), 12);

    broker.stop();
    assert!(!shm.exists(), "shared memory not unlinked at shutdown");
}

// Two clients share a device; a buffer recycles only after both
// release it, and a second client proposing another format is turned away.
#[test]
fn shared_device_waits_for_all_releases() {
    let broker = start_broker(
        r#"{
            "phy_camera": [ { "id": 20, "width": 64, "height": 32, "format": "YUYV" } ],
            "VM1": [ { "camera": { "id": 0, "phy_id": 20, "share": ["VM2"] } } ],
            "VM2": [ { "camera": { "id": 0, "phy_id": 20, "share": ["VM1"] } } ]
        }"#,
    );
    broker.fake.set_gate(20, true);

    let mut client_a = broker.connect();
    let mut client_b = broker.connect();

    client_a.expect_ok(RequestKind::Open, 0);
    client_b.expect_ok(RequestKind::Open, 0);
    assert_eq!(client_a.set_format(0, YUYV, 64, 32), ResponseCode::Ok as u32);
    // First writer won; an incompatible proposal is refused.
    assert_eq!(
        client_b.set_format(0, YUYV, 1280, 720),
        ResponseCode::Busy as u32
    );
    assert_eq!(client_b.set_format(0, YUYV, 64, 32), ResponseCode::Ok as u32);

    client_a.expect_ok(RequestKind::CreateBuffer, 0);
    client_b.expect_ok(RequestKind::CreateBuffer, 0);
    client_a.expect_ok(RequestKind::StreamOn, 0);
    client_b.expect_ok(RequestKind::StreamOn, 0);

    // Both subscriptions are in place; let frames flow.
    wait_until("initial queue submissions", || broker.fake.queue_calls(20) == 6);
    broker.fake.set_gate(20, false);

    let mut slots_a = BTreeSet::new();
    let mut slots_b = BTreeSet::new();
    for _ in 0..6 {
        let (_, slot) = client_a.next_frame();
        slots_a.insert(slot);
        let (_, slot) = client_b.next_frame();
        slots_b.insert(slot);
    }
    // Fan-out fairness: both see exactly the same six slots.
    assert_eq!(slots_a, slots_b);
    assert_eq!(broker.fake.queue_calls(20), 6);

    // One release is not enough to recycle.
    let slot = *slots_a.iter().next().unwrap();
    client_a.qbuf(0, slot);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(broker.fake.queue_calls(20), 6);

    // The second release is.
    client_b.qbuf(0, slot);
    wait_until("re-queue after both released", || {
        broker.fake.queue_calls(20) == 7
    });

    broker.stop();
}

// A slow client whose socket write would block is dropped from the frame
// instead of stalling it: its drop counter climbs one per dropped slot, the
// slot recycles without its release, and the fast client's stream is
// unaffected.
#[test]
fn slow_client_drops_do_not_stall_the_stream() {
    let broker = start_broker_with(
        r#"{
            "phy_camera": [ { "id": 30, "width": 64, "height": 32, "format": "YUYV" } ],
            "VM1": [ { "camera": { "id": 0, "phy_id": 30, "share": ["VM2"] } } ],
            "VM2": [ { "camera": { "id": 0, "phy_id": 30, "share": ["VM1"] } } ]
        }"#,
        Some(4096),
    );
    broker.fake.set_gate(30, true);

    let mut client_a = broker.connect();
    let mut client_b = broker.connect();
    // B never reads; keep its receive side small so the pipe to it fills
    // after a bounded number of frames.
    nix::sys::socket::setsockopt(
        &client_b.stream,
        nix::sys::socket::sockopt::RcvBuf,
        &4096usize,
    )
    .unwrap();

    for client in [&mut client_a, &mut client_b] {
        client.expect_ok(RequestKind::Open, 0);
        client.expect_ok(RequestKind::CreateBuffer, 0);
        client.expect_ok(RequestKind::StreamOn, 0);
    }
    broker.fake.set_gate(30, false);

    // A reads and releases every frame. B releases blindly without ever
    // reading, so frame records pile up toward it until a write would
    // block and the broker starts synthesising its releases.
    let mut frames_a = 0u64;
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let dropped = broker
            .handle
            .session_stats(2, 30)
            .map(|stats| stats.dropped)
            .unwrap_or(0);
        if dropped >= 3 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "no drops after {} frames to the fast client",
            frames_a
        );
        if let Some(record) = client_a.try_read(Duration::from_millis(100)) {
            assert_eq!(record.kind, RequestKind::DQBuf as u32);
            client_a.qbuf(0, record.buffer.index);
            frames_a += 1;
        }
        for slot in 0..6 {
            client_b.qbuf(0, slot);
        }
    }
    assert!(frames_a > 0);

    // The fast client's stream carries on after the drops began.
    for _ in 0..3 {
        let (camera, slot) = client_a.next_frame();
        assert_eq!(camera, 0);
        client_a.qbuf(0, slot);
    }

    broker.stop();
}

// A client vanishes mid-stream; buffers it held alone recycle, buffers
// shared with another subscriber survive with the other subscriber, and a
// device left without subscribers stops.
#[test]
fn mid_stream_disconnect_recycles_buffers() {
    let broker = start_broker(
        r#"{
            "phy_camera": [
                { "id": 40, "width": 64, "height": 32, "format": "YUYV" },
                { "id": 41, "width": 64, "height": 32, "format": "YUYV" }
            ],
            "VM1": [ { "camera": { "id": 0, "phy_id": 40, "share": ["VM2"] } },
                     { "camera": { "id": 1, "phy_id": 41 } } ],
            "VM2": [ { "camera": { "id": 0, "phy_id": 40, "share": ["VM1"] } } ]
        }"#,
    );
    broker.fake.set_gate(40, true);
    broker.fake.set_gate(41, true);

    let mut client_a = broker.connect();
    let mut client_b = broker.connect();

    for camera in [0, 1] {
        client_a.expect_ok(RequestKind::Open, camera);
        client_a.expect_ok(RequestKind::CreateBuffer, camera);
        client_a.expect_ok(RequestKind::StreamOn, camera);
    }
    client_b.expect_ok(RequestKind::Open, 0);
    client_b.expect_ok(RequestKind::CreateBuffer, 0);
    client_b.expect_ok(RequestKind::StreamOn, 0);

    broker.fake.set_gate(40, false);
    broker.fake.set_gate(41, false);

    // Client B keeps up on camera 40; client A sits on every frame of both
    // cameras. Once B has drained its six, every buffer of camera 40 is
    // held by A alone.
    for _ in 0..6 {
        let (_, slot) = client_b.next_frame();
        client_b.qbuf(0, slot);
    }
    // Drop A's socket without a single release.
    drop(client_a);

    // Buffers A held alone on camera 40 recycle to B, which is still
    // subscribed and releasing.
    wait_until("camera 40 re-queues for the surviving client", || {
        broker.fake.queue_calls(40) > 6
    });
    let (_, slot) = client_b.next_frame();
    client_b.qbuf(0, slot);

    // Camera 41 lost its only subscriber and stops.
    wait_until("camera 41 stops", || broker.fake.stopped(41));

    broker.stop();
}

// Persistent dequeue errors fault the device; subscribers see Unspec on
// their next release and cannot stream again.
#[test]
fn dequeue_errors_fault_the_device() {
    let broker = start_broker(
        r#"{
            "phy_camera": [ { "id": 50, "width": 64, "height": 32, "format": "YUYV" } ],
            "VM1": [ { "camera": { "id": 0, "phy_id": 50 } } ]
        }"#,
    );
    let mut client = broker.connect();

    client.expect_ok(RequestKind::Open, 0);
    client.expect_ok(RequestKind::CreateBuffer, 0);
    broker.fake.set_fail_dequeues(50, 5);
    client.expect_ok(RequestKind::StreamOn, 0);

    // Five consecutive failures take the device out of service. A release
    // is only answered once it fails, so poll until the Unspec arrives.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        client.qbuf(0, 0);
        match client.try_read(Duration::from_millis(100)) {
            Some(reply) => {
                assert_eq!(reply.kind, ResponseCode::Unspec as u32);
                break;
            }
            None => assert!(Instant::now() < deadline, "device never faulted"),
        }
    }
    assert_eq!(
        client.request_code(RequestKind::StreamOn, 0),
        ResponseCode::Invalid as u32
    );
    assert_eq!(
        client.request_code(RequestKind::Open, 0),
        ResponseCode::Invalid as u32
    );

    broker.stop();
}

// Shutdown closes sessions and unlinks the shared-memory objects.
#[test]
fn shutdown_drains_and_unlinks() {
    let broker = start_broker(
        r#"{
            "phy_camera": [ { "id": 60, "width": 64, "height": 32, "format": "YUYV" } ],
            "VM1": [ { "camera": { "id": 0, "phy_id": 60 } } ]
        }"#,
    );
    let mut client = broker.connect();
    client.expect_ok(RequestKind::Open, 0);
    client.expect_ok(RequestKind::CreateBuffer, 0);
    client.expect_ok(RequestKind::StreamOn, 0);

    let shm = Path::new("/dev/shm/camera_daemon_mem_60");
    assert!(shm.exists());

    broker.stop();
    assert!(!shm.exists());
    // The session socket was shut down on the broker side.
    let mut buf = [0u8; 1];
    use std::io::Read;
    loop {
        match client.stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) => panic!("expected a clean close, got {}", e),
        }
    }
}

// Protocol breakage: an unknown tag gets one Invalid response, then the
// session is closed.
#[test]
fn unknown_tag_closes_the_session() {
    let broker = start_broker(
        r#"{
            "phy_camera": [ { "id": 70, "width": 64, "height": 32, "format": "YUYV" } ],
            "VM1": [ { "camera": { "id": 0, "phy_id": 70 } } ]
        }"#,
    );
    let mut client = broker.connect();

    let mut record = request_record(RequestKind::Open, 0);
    record.kind = 0x7f;
    record.write_to(&mut client.stream).unwrap();
    let reply = client.read_record();
    assert_eq!(reply.kind, ResponseCode::Invalid as u32);

    use std::io::Read;
    let mut buf = [0u8; 1];
    loop {
        match client.stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) => panic!("expected the broker to close the socket, got {}", e),
        }
    }
    broker.stop();
}

// A request for a camera the VM does not map is rejected without killing
// the session.
#[test]
fn unmapped_camera_is_invalid() {
    let broker = start_broker(
        r#"{
            "phy_camera": [ { "id": 80, "width": 64, "height": 32, "format": "YUYV" } ],
            "VM1": [ { "camera": { "id": 0, "phy_id": 80 } } ]
        }"#,
    );
    let mut client = broker.connect();
    assert_eq!(
        client.request_code(RequestKind::Open, 9),
        ResponseCode::Invalid as u32
    );
    // The session is still usable.
    client.expect_ok(RequestKind::Open, 0);
    broker.stop();
}

// Drop policy building block: a frame-ready record is never allowed to
// block; a full socket reports congestion instead.
#[test]
fn congested_socket_reports_without_blocking() {
    use camera_daemon::config::VirtualCamera;
    use camera_daemon::session::NotifyError;
    use camera_daemon::session::Session;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let (server, _) = listener.accept().unwrap();

    // Shrink the send buffer so the stall shows up quickly; the client
    // never reads.
    nix::sys::socket::setsockopt(&server, nix::sys::socket::sockopt::SndBuf, &8192usize).unwrap();

    let session = Session::new(
        1,
        "VM1".to_string(),
        &server,
        &[VirtualCamera {
            logical_id: 0,
            physical_id: 85,
            shared: false,
        }],
    )
    .unwrap();

    let mut congested = false;
    for _ in 0..1_000_000 {
        match session.send_frame_ready(0, 3) {
            Ok(()) => continue,
            Err(NotifyError::Congested) => {
                congested = true;
                break;
            }
            Err(NotifyError::Io(e)) => panic!("unexpected I/O error: {}", e),
        }
    }
    assert!(congested, "socket never reported congestion");

    session.note_drop(85);
    assert_eq!(session.drop_count(85), 1);
}
