// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The broker supervisor.
//!
//! One thread owns the device table and the session table and consumes a
//! single FIFO command queue, so every lifecycle transition (a connection,
//! a subscription change, a device fault, shutdown) is serialised and the
//! registries cannot race. The supervisor holds no buffer-level locks; it
//! tells device workers what to do over their command channels.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use log::debug;
use log::error;
use log::info;
use log::warn;
use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;

use crate::backend;
use crate::backend::CaptureBackend;
use crate::camera::Camera;
use crate::camera::CameraState;
use crate::config::Config;
use crate::config::PhysicalCamera;
use crate::config::BUFFER_COUNT;
use crate::pool::BufferPool;
use crate::protocol::ControlRecord;
use crate::protocol::ResponseCode;
use crate::session;
use crate::session::Lifecycle;
use crate::session::Session;
use crate::session::SessionCameraStats;
use crate::worker;
use crate::worker::WorkerCmd;
use crate::worker::WorkerHandle;

/// How long disconnecting sessions get to drain at shutdown before they are
/// dropped on the floor.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the capture backend for one deserializer group. Swappable so the
/// broker can be exercised without camera hardware.
pub type BackendFactory =
    Box<dyn Fn(&[PhysicalCamera]) -> backend::Result<Box<dyn CaptureBackend>> + Send>;

pub enum BrokerCmd {
    /// A freshly accepted client connection.
    Connection(TcpStream),
    /// Materialise the pool, backend and worker behind a physical camera.
    EnsureDevice {
        camera: u32,
        reply: Sender<ResponseCode>,
    },
    StreamOn {
        session: Arc<Session>,
        camera: u32,
        reply: Sender<ResponseCode>,
    },
    StreamOff {
        session: u32,
        camera: u32,
        reply: Sender<ResponseCode>,
    },
    /// A client proposed a stream format. The device descriptor belongs to
    /// its worker, so the proposal is forwarded there once one exists.
    ProposeFormat {
        camera: u32,
        pixel_format: u32,
        width: u32,
        height: u32,
        apply: bool,
        reply: Sender<ResponseCode>,
    },
    /// Per-session delivery counters, for diagnostics.
    SessionStats {
        session: u32,
        camera: u32,
        reply: Sender<Option<SessionCameraStats>>,
    },
    /// A device worker reports a permanent backend failure.
    Fault { camera: u32 },
    /// A session reader thread has finished.
    SessionClosed { id: u32 },
    Shutdown,
}

#[derive(Clone)]
pub struct BrokerHandle {
    tx: Sender<BrokerCmd>,
}

impl BrokerHandle {
    pub fn send(&self, cmd: BrokerCmd) -> bool {
        self.tx.send(cmd).is_ok()
    }

    /// Delivery counters of one session camera, or `None` if the session or
    /// mapping is gone.
    pub fn session_stats(&self, session: u32, camera: u32) -> Option<SessionCameraStats> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if !self.send(BrokerCmd::SessionStats {
            session,
            camera,
            reply: tx,
        }) {
            return None;
        }
        rx.recv().ok().flatten()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(BrokerCmd::Shutdown);
    }
}

struct SessionEntry {
    session: Arc<Session>,
    reader: thread::JoinHandle<()>,
}

pub struct Broker {
    config: Config,
    cameras: Arc<BTreeMap<u32, Arc<Camera>>>,
    tx: Sender<BrokerCmd>,
    rx: Receiver<BrokerCmd>,
    sessions: BTreeMap<u32, SessionEntry>,
    workers: BTreeMap<u32, WorkerHandle>,
    next_session: u32,
    factory: BackendFactory,
}

impl Broker {
    pub fn new(config: Config) -> Broker {
        Broker::with_backend_factory(config, Box::new(backend::create_backend))
    }

    pub fn with_backend_factory(config: Config, factory: BackendFactory) -> Broker {
        let cameras = config
            .cameras
            .iter()
            .map(|descriptor| (descriptor.id, Arc::new(Camera::new(descriptor.clone()))))
            .collect();
        let (tx, rx) = crossbeam_channel::unbounded();
        Broker {
            config,
            cameras: Arc::new(cameras),
            tx,
            rx,
            sessions: BTreeMap::new(),
            workers: BTreeMap::new(),
            next_session: 0,
            factory,
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            tx: self.tx.clone(),
        }
    }

    /// The supervisor loop. Returns once a shutdown command has been
    /// processed and the daemon has drained.
    pub fn run(mut self) -> Result<()> {
        info!(
            "Broker supervising {} cameras for {} VMs",
            self.cameras.len(),
            self.config.vms.len()
        );
        loop {
            match self.rx.recv() {
                Ok(BrokerCmd::Connection(stream)) => self.add_session(stream),
                Ok(BrokerCmd::EnsureDevice { camera, reply }) => {
                    let code = self.ensure_device(camera);
                    let _ = reply.send(code);
                }
                Ok(BrokerCmd::StreamOn {
                    session,
                    camera,
                    reply,
                }) => {
                    let code = self.stream_on(session, camera);
                    let _ = reply.send(code);
                }
                Ok(BrokerCmd::StreamOff {
                    session,
                    camera,
                    reply,
                }) => {
                    let code = self.stream_off(session, camera);
                    let _ = reply.send(code);
                }
                Ok(BrokerCmd::ProposeFormat {
                    camera,
                    pixel_format,
                    width,
                    height,
                    apply,
                    reply,
                }) => self.propose_format(camera, pixel_format, width, height, apply, reply),
                Ok(BrokerCmd::SessionStats {
                    session,
                    camera,
                    reply,
                }) => {
                    let stats = self
                        .sessions
                        .get(&session)
                        .and_then(|entry| entry.session.camera_by_physical(camera))
                        .map(|entry| entry.stats());
                    let _ = reply.send(stats);
                }
                Ok(BrokerCmd::Fault { camera }) => {
                    error!("Camera {} is out of service", camera);
                }
                Ok(BrokerCmd::SessionClosed { id }) => self.remove_session(id),
                Ok(BrokerCmd::Shutdown) | Err(_) => break,
            }
        }
        self.shutdown();
        Ok(())
    }

    fn add_session(&mut self, stream: TcpStream) {
        self.next_session += 1;
        let id = self.next_session;
        // The socket does not tell us which VM connected; sessions bind to
        // scenario entries by connection order.
        let vm_name = format!("VM{}", id);
        let mappings = self.config.vm_cameras(&vm_name).to_vec();
        if mappings.is_empty() {
            warn!("No cameras configured for {}", vm_name);
        }

        let session = match Session::new(id, vm_name, &stream, &mappings) {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to set up client {}: {}", id, e);
                return;
            }
        };

        // Tell the client it is connected, mirroring what it will see for
        // every later request.
        let hello = ControlRecord::default().response(ResponseCode::Ok);
        if let Err(e) = session.send(&hello) {
            warn!("Client {} vanished during accept: {}", id, e);
            return;
        }

        let reader_session = session.clone();
        let cameras = self.cameras.clone();
        let broker = self.tx.clone();
        let reader = match thread::Builder::new()
            .name(format!("session-{}", id))
            .spawn(move || session::run(reader_session, stream, cameras, broker))
        {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to start reader for client {}: {}", id, e);
                return;
            }
        };

        info!(
            "Client {} connected from {} as {}",
            id,
            session.peer(),
            session.vm_name()
        );
        self.sessions.insert(id, SessionEntry { session, reader });
    }

    /// Lazily creates the buffer pools, backend and worker for the
    /// deserializer group containing `camera_id`. Idempotent.
    fn ensure_device(&mut self, camera_id: u32) -> ResponseCode {
        let Some(camera) = self.cameras.get(&camera_id) else {
            return ResponseCode::Invalid;
        };
        {
            let shared = camera.shared();
            if shared.materialized {
                return ResponseCode::Ok;
            }
            if !shared.enabled {
                return ResponseCode::Invalid;
            }
        }

        let group_id = camera.descriptor().deserializer;
        let members: Vec<Arc<Camera>> = self
            .cameras
            .values()
            .filter(|c| c.descriptor().deserializer == group_id)
            .cloned()
            .collect();

        let descriptors: Vec<PhysicalCamera> =
            members.iter().map(|m| m.descriptor().clone()).collect();
        let backend = match (self.factory)(&descriptors) {
            Ok(backend) => backend,
            Err(e) => {
                error!("Deserializer {}: backend creation failed: {}", group_id, e);
                return ResponseCode::Invalid;
            }
        };

        for member in &members {
            if member.pool().is_some() {
                continue;
            }
            // The backend has the final say on frame size; a vendor HAL may
            // need more than the packed geometry suggests.
            let format = {
                let mut shared = member.shared();
                let (size, _bpp) = backend.frame_size(
                    member.id(),
                    shared.format.pixel_format,
                    shared.format.width,
                    shared.format.height,
                );
                if size > shared.format.size {
                    shared.format.size = size;
                }
                shared.format
            };
            match BufferPool::create(member.id(), &format, BUFFER_COUNT) {
                Ok(pool) => {
                    info!(
                        "Camera {}: shared memory {} ready ({} slots)",
                        member.id(),
                        pool.mem_name(),
                        pool.slot_count()
                    );
                    *member.pool() = Some(pool);
                }
                Err(e) => {
                    error!("Camera {}: {}", member.id(), e);
                    return ResponseCode::OutOfMemory;
                }
            }
        }

        let handle = match worker::spawn(group_id, members.clone(), backend, self.tx.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Deserializer {}: failed to start worker: {}", group_id, e);
                return ResponseCode::Unspec;
            }
        };
        for member in &members {
            let mut shared = member.shared();
            shared.worker = Some(handle.tx.clone());
            shared.materialized = true;
        }
        self.workers.insert(group_id, handle);
        ResponseCode::Ok
    }

    fn stream_on(&mut self, session: Arc<Session>, camera_id: u32) -> ResponseCode {
        let code = self.ensure_device(camera_id);
        if code != ResponseCode::Ok {
            return code;
        }
        // ensure_device validated the id.
        let Some(camera) = self.cameras.get(&camera_id) else {
            return ResponseCode::Invalid;
        };
        let mut shared = camera.shared();
        if shared.state == CameraState::Faulted || !shared.enabled {
            return ResponseCode::Invalid;
        }
        let was_empty = shared.registry.is_empty();
        shared.registry.insert(session.id(), Arc::downgrade(&session));
        let worker = shared.worker.clone();
        drop(shared);

        debug!(
            "Client {} subscribed to camera {} (first: {})",
            session.id(),
            camera_id,
            was_empty
        );
        if was_empty {
            if let Some(tx) = worker {
                let _ = tx.send(WorkerCmd::Start(camera_id));
            }
        }
        ResponseCode::Ok
    }

    /// Routes a format proposal to whoever owns the descriptor: the device
    /// worker once the device is materialised, this thread before that.
    fn propose_format(
        &mut self,
        camera_id: u32,
        pixel_format: u32,
        width: u32,
        height: u32,
        apply: bool,
        reply: Sender<ResponseCode>,
    ) {
        let Some(camera) = self.cameras.get(&camera_id) else {
            let _ = reply.send(ResponseCode::Invalid);
            return;
        };
        let worker = camera.shared().worker.clone();
        match worker {
            Some(tx) => {
                let cmd = WorkerCmd::ProposeFormat {
                    camera: camera_id,
                    pixel_format,
                    width,
                    height,
                    apply,
                    reply,
                };
                if let Err(err) = tx.send(cmd) {
                    if let WorkerCmd::ProposeFormat { reply, .. } = err.0 {
                        let _ = reply.send(ResponseCode::Unspec);
                    }
                }
            }
            None => {
                let _ = reply.send(camera.propose_format(pixel_format, width, height, apply));
            }
        }
    }

    fn stream_off(&mut self, session_id: u32, camera_id: u32) -> ResponseCode {
        let Some(camera) = self.cameras.get(&camera_id) else {
            return ResponseCode::Invalid;
        };
        let mut shared = camera.shared();
        let removed = shared.registry.remove(&session_id).is_some();
        if !removed {
            warn!(
                "Client {} stream-off for camera {} it is not subscribed to",
                session_id, camera_id
            );
        }
        let now_empty = shared.registry.is_empty();
        let worker = shared.worker.clone();
        // Registry lock is held while the pool drops this client's frames,
        // so a concurrent dispatch cannot hand it new ones.
        let requeues = camera
            .pool()
            .as_mut()
            .map(|p| p.release_client(session_id))
            .unwrap_or(0);
        drop(shared);

        if let Some(tx) = worker {
            if now_empty && removed {
                let _ = tx.send(WorkerCmd::Stop(camera_id));
            } else if requeues > 0 {
                let _ = tx.send(WorkerCmd::Requeue(camera_id));
            }
        }
        debug!(
            "Client {} unsubscribed from camera {} ({} slots freed)",
            session_id, camera_id, requeues
        );
        ResponseCode::Ok
    }

    fn remove_session(&mut self, id: u32) {
        let Some(entry) = self.sessions.remove(&id) else {
            return;
        };
        for camera_entry in entry.session.cameras() {
            if camera_entry
                .streaming
                .swap(false, std::sync::atomic::Ordering::Relaxed)
            {
                self.stream_off(id, camera_entry.physical_id);
            } else if let Some(camera) = self.cameras.get(&camera_entry.physical_id) {
                // Catch frames still held through a race with stream-off.
                let requeues = camera
                    .pool()
                    .as_mut()
                    .map(|p| p.release_client(id))
                    .unwrap_or(0);
                if requeues > 0 {
                    camera.send_worker(WorkerCmd::Requeue(camera_entry.physical_id));
                }
            }
            let dropped = camera_entry
                .dropped
                .load(std::sync::atomic::Ordering::Relaxed);
            if dropped > 0 {
                info!(
                    "Client {} dropped {} frames on camera {}",
                    id, dropped, camera_entry.physical_id
                );
            }
        }
        if let Err(e) = entry.reader.join() {
            warn!("Client {} reader panicked: {:?}", id, e);
        }
        info!("Client {} disconnected", id);
    }

    fn shutdown(&mut self) {
        info!("Shutting down");
        for entry in self.sessions.values() {
            entry.session.set_lifecycle(Lifecycle::Closing);
            entry.session.shutdown();
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.sessions.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.rx.recv_timeout(deadline - now) {
                Ok(BrokerCmd::SessionClosed { id }) => self.remove_session(id),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if !self.sessions.is_empty() {
            warn!(
                "Forcibly disposing {} sessions that did not drain",
                self.sessions.len()
            );
            self.sessions.clear();
        }

        for (group_id, handle) in std::mem::take(&mut self.workers) {
            let _ = handle.tx.send(WorkerCmd::Shutdown);
            if handle.thread.join().is_err() {
                warn!("Worker for deserializer {} panicked", group_id);
            }
        }

        for camera in self.cameras.values() {
            camera.shared().worker = None;
            if let Some(pool) = camera.pool().as_ref() {
                pool.unlink();
            }
        }
        info!("Camera daemon exit");
    }
}

/// The acceptor loop: blocks on the listener and the shutdown pipe, handing
/// accepted connections to the supervisor. Returns when the pipe becomes
/// readable or the supervisor goes away.
pub fn serve(listener: &TcpListener, handle: &BrokerHandle, shutdown: BorrowedFd) {
    loop {
        let mut fds = [
            PollFd::new(listener.as_fd(), PollFlags::POLLIN),
            PollFd::new(shutdown, PollFlags::POLLIN | PollFlags::POLLHUP),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("Acceptor poll failed: {}", e);
                return;
            }
        }
        if fds[1].revents().map_or(false, |r| !r.is_empty()) {
            info!("Stopped accepting connections");
            return;
        }
        if fds[0].revents().map_or(false, |r| !r.is_empty()) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!("Connection opened from {}", addr);
                    if !handle.send(BrokerCmd::Connection(stream)) {
                        return;
                    }
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }
}
