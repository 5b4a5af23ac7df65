// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-device state: the descriptor, the negotiated format, the fan-out
//! registry of subscribed sessions, and the buffer pool.
//!
//! The registry holds weak session references; the broker supervisor owns
//! sessions and guarantees they outlive any in-flight buffer that names
//! them. Lock order is registry before pool, and neither is ever held
//! across a syscall.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use crossbeam_channel::Sender;

use crate::backend::StreamFormat;
use crate::config::PhysicalCamera;
use crate::pool::BufferPool;
use crate::protocol::ResponseCode;
use crate::session::Session;
use crate::worker::WorkerCmd;

/// Formats beyond this edge length are rejected outright.
const MAX_DIMENSION: u32 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Idle,
    Streaming,
    Faulted,
}

pub struct CameraShared {
    pub format: StreamFormat,
    /// Set once a client has pinned the format; later writers proposing a
    /// different one are turned away.
    pub format_locked: bool,
    pub enabled: bool,
    pub state: CameraState,
    pub registry: BTreeMap<u32, Weak<Session>>,
    pub worker: Option<Sender<WorkerCmd>>,
    pub materialized: bool,
}

impl CameraShared {
    /// Snapshot of the live subscribers, pruning sessions that are gone.
    pub fn snapshot(&mut self) -> Vec<(u32, Arc<Session>)> {
        let mut out = Vec::new();
        self.registry.retain(|id, weak| match weak.upgrade() {
            Some(session) => {
                out.push((*id, session));
                true
            }
            None => false,
        });
        out
    }
}

pub struct Camera {
    descriptor: PhysicalCamera,
    shared: Mutex<CameraShared>,
    pool: Mutex<Option<BufferPool>>,
}

impl Camera {
    pub fn new(descriptor: PhysicalCamera) -> Camera {
        let format = StreamFormat::new(descriptor.pixel_format, descriptor.width, descriptor.height);
        Camera {
            descriptor,
            shared: Mutex::new(CameraShared {
                format,
                format_locked: false,
                enabled: true,
                state: CameraState::Idle,
                registry: BTreeMap::new(),
                worker: None,
                materialized: false,
            }),
            pool: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.descriptor.id
    }

    pub fn descriptor(&self) -> &PhysicalCamera {
        &self.descriptor
    }

    pub fn shared(&self) -> MutexGuard<CameraShared> {
        self.shared.lock().unwrap()
    }

    pub fn pool(&self) -> MutexGuard<Option<BufferPool>> {
        self.pool.lock().unwrap()
    }

    pub fn is_faulted(&self) -> bool {
        self.shared().state == CameraState::Faulted
    }

    /// Takes the device out of service after a permanent backend failure.
    /// Subscribers learn about it from their next request.
    pub fn mark_faulted(&self) {
        let mut shared = self.shared();
        shared.state = CameraState::Faulted;
        shared.enabled = false;
    }

    pub fn send_worker(&self, cmd: WorkerCmd) {
        let worker = self.shared().worker.clone();
        if let Some(tx) = worker {
            let _ = tx.send(cmd);
        }
    }

    /// Validates a client's format proposal. One format is shared by every
    /// consumer of the device: the first writer wins for the device's
    /// lifetime, and anyone proposing something different afterwards is
    /// `Busy`. With `record` unset this is a dry run.
    ///
    /// The descriptor has a single writer: this runs on the supervisor
    /// thread until the device worker exists, and only on the worker after
    /// that.
    pub fn propose_format(
        &self,
        pixel_format: u32,
        width: u32,
        height: u32,
        record: bool,
    ) -> ResponseCode {
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return ResponseCode::Invalid;
        }
        let mut shared = self.shared();
        let current = shared.format;
        if pixel_format == current.pixel_format && width == current.width && height == current.height
        {
            if record {
                shared.format_locked = true;
            }
            return ResponseCode::Ok;
        }
        // A different format can only be taken before anyone pinned the
        // current one and before the pool was sized from it.
        if shared.format_locked || shared.materialized {
            return ResponseCode::Busy;
        }
        if record {
            shared.format = StreamFormat::new(pixel_format, width, height);
            shared.format_locked = true;
        }
        ResponseCode::Ok
    }
}
