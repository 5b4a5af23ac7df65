// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client sessions.
//!
//! Each connected client gets a dedicated reader thread decoding fixed-size
//! control records. Writes to the socket can come from any thread (the
//! reader answering a request, a device worker announcing a frame) and are
//! serialised by the session's write mutex so records never interleave.

use std::collections::BTreeMap;
use std::io;
use std::io::Write;
use std::net::Shutdown;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crossbeam_channel::Sender;
use log::debug;
use log::info;
use log::warn;
use nix::errno::Errno;
use nix::sys::socket::send;
use nix::sys::socket::MsgFlags;
use zerocopy::IntoBytes;

use crate::broker::BrokerCmd;
use crate::camera::Camera;
use crate::camera::CameraState;
use crate::config::VirtualCamera;
use crate::pool::ReleaseOutcome;
use crate::protocol::ControlRecord;
use crate::protocol::RequestKind;
use crate::protocol::ResponseCode;
use crate::worker::WorkerCmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    Active,
    Closing,
}

/// Why a frame-ready record did not reach the client.
#[derive(Debug)]
pub enum NotifyError {
    /// The socket buffer is full; the client is too slow for this frame.
    Congested,
    Io(io::Error),
}

/// One logical camera binding of a session, from the VM's scenario entry.
pub struct SessionCamera {
    pub logical_id: u32,
    pub physical_id: u32,
    pub shared: bool,
    pub opened: AtomicBool,
    pub streaming: AtomicBool,
    /// Frames announced but not yet released; diagnostics only.
    pub pending: AtomicI64,
    /// Frames dropped because the socket would have blocked.
    pub dropped: AtomicU64,
}

/// Snapshot of one binding's delivery counters.
#[derive(Debug, Clone, Copy)]
pub struct SessionCameraStats {
    pub dropped: u64,
    pub pending: i64,
}

impl SessionCamera {
    pub fn stats(&self) -> SessionCameraStats {
        SessionCameraStats {
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

pub struct Session {
    id: u32,
    vm_name: String,
    peer: String,
    cameras: Vec<SessionCamera>,
    writer: Mutex<TcpStream>,
    lifecycle: Mutex<Lifecycle>,
}

impl Session {
    pub fn new(
        id: u32,
        vm_name: String,
        stream: &TcpStream,
        mappings: &[VirtualCamera],
    ) -> io::Result<Arc<Session>> {
        let writer = stream.try_clone()?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let cameras = mappings
            .iter()
            .map(|m| SessionCamera {
                logical_id: m.logical_id,
                physical_id: m.physical_id,
                shared: m.shared,
                opened: AtomicBool::new(false),
                streaming: AtomicBool::new(false),
                pending: AtomicI64::new(0),
                dropped: AtomicU64::new(0),
            })
            .collect();
        Ok(Arc::new(Session {
            id,
            vm_name,
            peer,
            cameras,
            writer: Mutex::new(writer),
            lifecycle: Mutex::new(Lifecycle::Connecting),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn cameras(&self) -> &[SessionCamera] {
        &self.cameras
    }

    pub fn camera_by_logical(&self, logical_id: i32) -> Option<&SessionCamera> {
        if logical_id < 0 {
            return None;
        }
        self.cameras
            .iter()
            .find(|c| c.logical_id == logical_id as u32)
    }

    pub fn camera_by_physical(&self, physical_id: u32) -> Option<&SessionCamera> {
        self.cameras.iter().find(|c| c.physical_id == physical_id)
    }

    pub fn logical_id_for(&self, physical_id: u32) -> Option<u32> {
        self.camera_by_physical(physical_id).map(|c| c.logical_id)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap()
    }

    pub fn set_lifecycle(&self, state: Lifecycle) {
        *self.lifecycle.lock().unwrap() = state;
    }

    /// Writes a record under the session's write mutex.
    pub fn send(&self, record: &ControlRecord) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        record.write_to(&mut *writer)
    }

    /// Announces a frame without ever blocking on the client. A full socket
    /// buffer means the client is too slow; the caller then synthesises a
    /// release so the buffer recycles without it.
    pub fn send_frame_ready(&self, logical_id: i32, slot: usize) -> Result<(), NotifyError> {
        let record = ControlRecord::frame_ready(logical_id, slot);
        let bytes = record.as_bytes();
        let writer = self.writer.lock().unwrap();
        match send(writer.as_raw_fd(), bytes, MsgFlags::MSG_DONTWAIT) {
            Ok(n) if n == bytes.len() => {}
            Ok(n) => {
                // A partial record would desynchronise the stream; finish it
                // even if that briefly blocks.
                (&*writer)
                    .write_all(&bytes[n..])
                    .map_err(NotifyError::Io)?;
            }
            Err(Errno::EAGAIN) => return Err(NotifyError::Congested),
            Err(e) => return Err(NotifyError::Io(io::Error::from(e))),
        }
        drop(writer);
        if let Some(camera) = self.camera_by_logical(logical_id) {
            camera.pending.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn note_drop(&self, physical_id: u32) {
        if let Some(camera) = self.camera_by_physical(physical_id) {
            camera.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of frames this session dropped on a camera.
    pub fn drop_count(&self, physical_id: u32) -> u64 {
        self.camera_by_physical(physical_id)
            .map(|c| c.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Both halves down; unblocks the reader thread.
    pub fn shutdown(&self) {
        let writer = self.writer.lock().unwrap();
        let _ = writer.shutdown(Shutdown::Both);
    }
}

enum Flow {
    Continue,
    Close,
}

/// The session reader loop. Runs on a dedicated thread until the client
/// goes away, the broker shuts the socket, or the client breaks protocol.
pub fn run(
    session: Arc<Session>,
    mut stream: TcpStream,
    cameras: Arc<BTreeMap<u32, Arc<Camera>>>,
    broker: Sender<BrokerCmd>,
) {
    session.set_lifecycle(Lifecycle::Active);
    loop {
        let record = match ControlRecord::read_from(&mut stream) {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!("Client {} closed its socket", session.id());
                break;
            }
            Err(e) => {
                if session.lifecycle() != Lifecycle::Closing {
                    warn!("Client {}: read failed: {}", session.id(), e);
                }
                break;
            }
        };
        match handle_request(&session, &record, &cameras, &broker) {
            Flow::Continue => {}
            Flow::Close => break,
        }
    }
    session.set_lifecycle(Lifecycle::Closing);
    let _ = broker.send(BrokerCmd::SessionClosed { id: session.id() });
}

fn respond(session: &Session, record: ControlRecord) -> Flow {
    match session.send(&record) {
        Ok(()) => Flow::Continue,
        Err(e) => {
            debug!("Client {}: write failed: {}", session.id(), e);
            Flow::Close
        }
    }
}

/// Sends a lifecycle command to the supervisor and waits for its verdict, so
/// registry changes stay serialised in one place.
fn lifecycle_roundtrip<F>(broker: &Sender<BrokerCmd>, build: F) -> ResponseCode
where
    F: FnOnce(Sender<ResponseCode>) -> BrokerCmd,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    if broker.send(build(tx)).is_err() {
        return ResponseCode::Unspec;
    }
    rx.recv().unwrap_or(ResponseCode::Unspec)
}

fn handle_request(
    session: &Arc<Session>,
    record: &ControlRecord,
    cameras: &BTreeMap<u32, Arc<Camera>>,
    broker: &Sender<BrokerCmd>,
) -> Flow {
    let kind = match record.request_kind() {
        Ok(kind) => kind,
        Err(tag) => {
            // Protocol breakage: answer once, then drop the session.
            warn!("Client {}: unknown request tag {:#x}", session.id(), tag);
            let _ = session.send(&record.response(ResponseCode::Invalid));
            return Flow::Close;
        }
    };

    let Some(entry) = session.camera_by_logical(record.camera_id) else {
        warn!(
            "Client {}: request {:?} for unmapped camera {}",
            session.id(),
            kind,
            record.camera_id
        );
        return respond(session, record.response(ResponseCode::Invalid));
    };
    let Some(camera) = cameras.get(&entry.physical_id) else {
        return respond(session, record.response(ResponseCode::Invalid));
    };

    match kind {
        RequestKind::GetFormat => {
            let format = camera.shared().format;
            let mut response = record.response(ResponseCode::Ok);
            response.format = format.to_wire();
            respond(session, response)
        }
        RequestKind::SetFormat | RequestKind::TryFormat => {
            // The descriptor is mutated only by its owner; route the
            // proposal through the supervisor like every other lifecycle
            // change.
            let code = lifecycle_roundtrip(broker, |reply| BrokerCmd::ProposeFormat {
                camera: entry.physical_id,
                pixel_format: record.format.pixel_format,
                width: record.format.size.width,
                height: record.format.size.height,
                apply: kind == RequestKind::SetFormat,
                reply,
            });
            respond(session, record.response(code))
        }
        RequestKind::EnumFormat => {
            // One shared format per device; enumeration reflects what the
            // broker can actually deliver.
            if record.index == 0 {
                let format = camera.shared().format;
                let mut response = record.response(ResponseCode::Ok);
                response.format = format.to_wire();
                respond(session, response)
            } else {
                respond(session, record.response(ResponseCode::Invalid))
            }
        }
        RequestKind::EnumSize => {
            let format = camera.shared().format;
            let matches_format =
                record.format.pixel_format == 0 || record.format.pixel_format == format.pixel_format;
            if record.index == 0 && matches_format {
                let mut response = record.response(ResponseCode::Ok);
                response.format = format.to_wire();
                respond(session, response)
            } else {
                respond(session, record.response(ResponseCode::Invalid))
            }
        }
        RequestKind::Open => {
            let shared = camera.shared();
            if shared.enabled && shared.state != CameraState::Faulted {
                drop(shared);
                entry.opened.store(true, Ordering::Relaxed);
                debug!(
                    "Client {}: opened camera {} (physical {})",
                    session.id(),
                    entry.logical_id,
                    entry.physical_id
                );
                respond(session, record.response(ResponseCode::Ok))
            } else {
                respond(session, record.response(ResponseCode::Invalid))
            }
        }
        RequestKind::Close => {
            entry.opened.store(false, Ordering::Relaxed);
            if entry.streaming.swap(false, Ordering::Relaxed) {
                let client = session.id();
                lifecycle_roundtrip(broker, |reply| BrokerCmd::StreamOff {
                    session: client,
                    camera: entry.physical_id,
                    reply,
                });
            }
            respond(session, record.response(ResponseCode::Ok))
        }
        RequestKind::CreateBuffer => {
            let code = lifecycle_roundtrip(broker, |reply| BrokerCmd::EnsureDevice {
                camera: entry.physical_id,
                reply,
            });
            respond(session, record.response(code))
        }
        RequestKind::DelBuffer => {
            // The pool is broker-owned and may be shared with other
            // sessions, so it stays mapped; see the scenario's share lists.
            debug!(
                "Client {}: DelBuffer for camera {} ignored (pool is shared)",
                session.id(),
                entry.logical_id
            );
            respond(session, record.response(ResponseCode::Ok))
        }
        RequestKind::StreamOn => {
            let code = lifecycle_roundtrip(broker, |reply| BrokerCmd::StreamOn {
                session: session.clone(),
                camera: entry.physical_id,
                reply,
            });
            if code == ResponseCode::Ok {
                entry.streaming.store(true, Ordering::Relaxed);
            }
            respond(session, record.response(code))
        }
        RequestKind::StreamOff => {
            entry.streaming.store(false, Ordering::Relaxed);
            let code = lifecycle_roundtrip(broker, |reply| BrokerCmd::StreamOff {
                session: session.id(),
                camera: entry.physical_id,
                reply,
            });
            respond(session, record.response(code))
        }
        RequestKind::QBuf => {
            if camera.is_faulted() {
                return respond(session, record.response(ResponseCode::Unspec));
            }
            let slot = record.buffer.index;
            let outcome = {
                let mut guard = camera.pool();
                let Some(pool) = guard.as_mut() else {
                    warn!(
                        "Client {}: QBuf for camera {} before CreateBuffer",
                        session.id(),
                        entry.logical_id
                    );
                    return respond(session, record.response(ResponseCode::Invalid));
                };
                if slot < 0 || slot as usize >= pool.slot_count() {
                    return respond(session, record.response(ResponseCode::Invalid));
                }
                pool.release(slot as usize, session.id())
            };
            match outcome {
                ReleaseOutcome::Requeue => {
                    entry.pending.fetch_sub(1, Ordering::Relaxed);
                    camera.send_worker(WorkerCmd::Requeue(entry.physical_id));
                }
                ReleaseOutcome::StillHeld => {
                    entry.pending.fetch_sub(1, Ordering::Relaxed);
                }
                // Releasing a slot it no longer holds is a stale QBuf that
                // raced a stream-off; already warned by the pool.
                ReleaseOutcome::NotHeld => {}
            }
            // Only a failed release is acknowledged; a client streaming
            // releases must not have acks pushed into its receive path.
            Flow::Continue
        }
        RequestKind::DQBuf => {
            // Frame delivery is push-only; a client-sent DQBuf is a relic.
            debug!("Client {}: ignoring client-sent DQBuf", session.id());
            respond(session, record.response(ResponseCode::Ok))
        }
    }
}
