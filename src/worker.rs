// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device worker threads.
//!
//! One thread drives each deserializer group: frames from cameras behind
//! one deserializer arrive together, so interleaving them on a single
//! thread avoids fighting over the hardware cursor. The worker owns the
//! backend; nothing else may touch it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use crossbeam_channel::TryRecvError;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::backend::BackendError;
use crate::backend::CaptureBackend;
use crate::backend::DequeuedFrame;
use crate::broker::BrokerCmd;
use crate::camera::Camera;
use crate::camera::CameraState;
use crate::config::BUFFER_COUNT;
use crate::pool::ReleaseOutcome;
use crate::protocol::ResponseCode;
use crate::session::NotifyError;

/// How long one dequeue wait may block before the worker re-checks its
/// command queue.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive non-timeout dequeue failures before a camera is faulted.
const FAULT_THRESHOLD: u32 = 5;

/// How long the worker sleeps on its command queue when no buffer is with
/// the hardware.
const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum WorkerCmd {
    /// First subscriber arrived: queue every free buffer and start capture.
    Start(u32),
    /// Last subscriber left: stop capture and drain the pool back to free.
    Stop(u32),
    /// Released buffers are waiting to be handed back to the hardware.
    Requeue(u32),
    /// A client proposed a stream format. The descriptor is the worker's to
    /// mutate, so the verdict comes from here.
    ProposeFormat {
        camera: u32,
        pixel_format: u32,
        width: u32,
        height: u32,
        apply: bool,
        reply: Sender<ResponseCode>,
    },
    Shutdown,
}

pub struct WorkerHandle {
    pub tx: Sender<WorkerCmd>,
    pub thread: thread::JoinHandle<()>,
}

pub fn spawn(
    group_id: u32,
    cameras: Vec<Arc<Camera>>,
    backend: Box<dyn CaptureBackend>,
    supervisor: Sender<BrokerCmd>,
) -> io::Result<WorkerHandle> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let thread = thread::Builder::new()
        .name(format!("camera-worker-{}", group_id))
        .spawn(move || {
            Worker {
                group_id,
                cameras,
                backend,
                rx,
                supervisor,
                streaming: BTreeSet::new(),
                errors: BTreeMap::new(),
                cursor: 0,
            }
            .run()
        })?;
    Ok(WorkerHandle { tx, thread })
}

struct Worker {
    group_id: u32,
    cameras: Vec<Arc<Camera>>,
    backend: Box<dyn CaptureBackend>,
    rx: Receiver<WorkerCmd>,
    supervisor: Sender<BrokerCmd>,
    streaming: BTreeSet<u32>,
    errors: BTreeMap<u32, u32>,
    cursor: usize,
}

impl Worker {
    fn run(mut self) {
        debug!("Worker for deserializer {} starting", self.group_id);
        for i in 0..self.cameras.len() {
            let camera = self.cameras[i].clone();
            if let Err(e) = self.init_camera(&camera) {
                self.fault(&camera, &e);
            }
        }

        'main: loop {
            loop {
                match self.rx.try_recv() {
                    Ok(cmd) => {
                        if !self.handle_cmd(cmd) {
                            break 'main;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'main,
                }
            }

            // Only cameras with at least one buffer at the hardware can
            // produce a frame; with none, releases are the only wake source.
            let candidates: Vec<u32> = self
                .streaming
                .iter()
                .copied()
                .filter(|id| {
                    self.camera(*id)
                        .map(|c| c.pool().as_ref().map(|p| p.submitted_count()).unwrap_or(0) > 0)
                        .unwrap_or(false)
                })
                .collect();

            if candidates.is_empty() {
                match self.rx.recv_timeout(IDLE_WAIT) {
                    Ok(cmd) => {
                        if !self.handle_cmd(cmd) {
                            break 'main;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break 'main,
                }
                continue;
            }

            match self.backend.wait(&candidates, DEQUEUE_TIMEOUT) {
                Ok(ready) => {
                    // Rotate so one chatty camera cannot starve the rest of
                    // the group.
                    self.cursor = self.cursor.wrapping_add(1);
                    let start = self.cursor % ready.len().max(1);
                    for i in 0..ready.len() {
                        let id = ready[(start + i) % ready.len()];
                        self.service_camera(id);
                    }
                }
                Err(e) if e.is_transient() => {}
                Err(e) => {
                    warn!("Deserializer {}: wait failed: {}", self.group_id, e);
                    for id in candidates {
                        self.count_error(id, &e);
                    }
                }
            }
        }

        self.shutdown_all();
        debug!("Worker for deserializer {} exiting", self.group_id);
    }

    fn camera(&self, id: u32) -> Option<&Arc<Camera>> {
        self.cameras.iter().find(|c| c.id() == id)
    }

    fn init_camera(&mut self, camera: &Arc<Camera>) -> Result<(), BackendError> {
        let id = camera.id();
        self.backend.open(id)?;
        match self.backend.configure_sensor(id) {
            Ok(()) => {}
            Err(BackendError::Unsupported) => {
                debug!("Camera {}: backend has no sensor configuration", id)
            }
            Err(e) => return Err(e),
        }
        let format = camera.shared().format;
        self.backend.configure_streams(id, &format)?;
        let count = camera
            .pool()
            .as_ref()
            .map(|p| p.slot_count())
            .unwrap_or(BUFFER_COUNT);
        self.backend.request_buffers(id, count as u32)?;
        info!(
            "Camera {}: capture ready, {}x{} {} bytes per frame",
            id, format.width, format.height, format.size
        );
        Ok(())
    }

    /// Returns false when the worker should exit.
    fn handle_cmd(&mut self, cmd: WorkerCmd) -> bool {
        match cmd {
            WorkerCmd::Start(id) => {
                let Some(camera) = self.camera(id).cloned() else {
                    return true;
                };
                if camera.is_faulted() || self.streaming.contains(&id) {
                    return true;
                }
                if self.submit_pending(&camera) {
                    match self.backend.start(id) {
                        Ok(()) => {
                            self.streaming.insert(id);
                            camera.shared().state = CameraState::Streaming;
                            info!("Camera {}: capture started", id);
                        }
                        Err(e) => self.fault(&camera, &e),
                    }
                }
            }
            WorkerCmd::Stop(id) => {
                let Some(camera) = self.camera(id).cloned() else {
                    return true;
                };
                if self.streaming.remove(&id) {
                    if let Err(e) = self.backend.stop(id) {
                        warn!("Camera {}: stop failed: {}", id, e);
                    }
                    info!("Camera {}: capture stopped", id);
                }
                if let Some(pool) = camera.pool().as_mut() {
                    pool.reset_to_free();
                }
                let mut shared = camera.shared();
                if shared.state == CameraState::Streaming {
                    shared.state = CameraState::Idle;
                }
            }
            WorkerCmd::Requeue(id) => {
                if self.streaming.contains(&id) {
                    if let Some(camera) = self.camera(id).cloned() {
                        self.submit_pending(&camera);
                    }
                }
            }
            WorkerCmd::ProposeFormat {
                camera,
                pixel_format,
                width,
                height,
                apply,
                reply,
            } => {
                let code = match self.camera(camera) {
                    Some(camera) => camera.propose_format(pixel_format, width, height, apply),
                    None => ResponseCode::Invalid,
                };
                let _ = reply.send(code);
            }
            WorkerCmd::Shutdown => return false,
        }
        true
    }

    /// Hands every due slot back to the hardware. Returns false after a
    /// fault.
    fn submit_pending(&mut self, camera: &Arc<Camera>) -> bool {
        let submissions = camera
            .pool()
            .as_mut()
            .map(|p| p.take_submissions())
            .unwrap_or_default();
        for submission in submissions {
            if let Err(e) =
                self.backend
                    .queue(camera.id(), submission.slot, submission.addr, submission.length)
            {
                self.fault(camera, &e);
                return false;
            }
        }
        true
    }

    fn service_camera(&mut self, id: u32) {
        let Some(camera) = self.camera(id).cloned() else {
            return;
        };
        match self.backend.dequeue(id) {
            Ok(frame) => {
                self.errors.insert(id, 0);
                self.dispatch(&camera, frame);
            }
            Err(e) if e.is_transient() => {}
            Err(e) => {
                warn!("Camera {}: dequeue failed: {}", id, e);
                self.count_error(id, &e);
            }
        }
    }

    /// Fans a captured frame out to the subscriber set captured under the
    /// registry lock. Subscribers whose socket would block are dropped from
    /// this frame so the slot can recycle without them.
    fn dispatch(&mut self, camera: &Arc<Camera>, frame: DequeuedFrame) {
        let subscribers;
        {
            let mut shared = camera.shared();
            subscribers = shared.snapshot();
            let mut pool = camera.pool();
            let Some(pool) = pool.as_mut() else {
                return;
            };
            let ids: BTreeSet<u32> = subscribers.iter().map(|(id, _)| *id).collect();
            pool.mark_in_use(frame.slot, ids, frame.sequence, frame.timestamp_us);
        }

        if subscribers.is_empty() {
            self.submit_pending(camera);
            return;
        }

        let mut synthesized = Vec::new();
        for (client_id, session) in &subscribers {
            let Some(logical) = session.logical_id_for(camera.id()) else {
                synthesized.push(*client_id);
                continue;
            };
            match session.send_frame_ready(logical as i32, frame.slot) {
                Ok(()) => {}
                Err(NotifyError::Congested) => {
                    debug!(
                        "Client {}: socket full, dropping camera {} slot {}",
                        client_id,
                        camera.id(),
                        frame.slot
                    );
                    session.note_drop(camera.id());
                    synthesized.push(*client_id);
                }
                Err(NotifyError::Io(e)) => {
                    // The reader thread will observe the same dead socket
                    // and run the full disconnect path.
                    debug!("Client {}: notify failed: {}", client_id, e);
                    synthesized.push(*client_id);
                }
            }
        }

        if !synthesized.is_empty() {
            let mut requeue = false;
            if let Some(pool) = camera.pool().as_mut() {
                for client_id in synthesized {
                    requeue |= pool.release(frame.slot, client_id) == ReleaseOutcome::Requeue;
                }
            }
            if requeue {
                self.submit_pending(camera);
            }
        }
    }

    fn count_error(&mut self, id: u32, err: &BackendError) {
        let count = {
            let entry = self.errors.entry(id).or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= FAULT_THRESHOLD {
            if let Some(camera) = self.camera(id).cloned() {
                self.fault(&camera, err);
            }
        }
    }

    fn fault(&mut self, camera: &Arc<Camera>, err: &BackendError) {
        let id = camera.id();
        error!("Camera {}: permanent backend failure: {}", id, err);
        if self.streaming.remove(&id) {
            let _ = self.backend.stop(id);
        }
        if let Some(pool) = camera.pool().as_mut() {
            pool.reset_to_free();
        }
        camera.mark_faulted();
        let _ = self.supervisor.send(BrokerCmd::Fault { camera: id });
    }

    fn shutdown_all(&mut self) {
        for camera in self.cameras.clone() {
            let id = camera.id();
            if self.streaming.remove(&id) {
                if let Err(e) = self.backend.stop(id) {
                    warn!("Camera {}: stop failed during shutdown: {}", id, e);
                }
            }
            if let Some(pool) = camera.pool().as_mut() {
                pool.reset_to_free();
            }
            self.backend.close(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    use crate::backend::fourcc;
    use crate::backend::Result as BackendResult;
    use crate::config::BackendKind;
    use crate::config::PhysicalCamera;
    use crate::pool::BufferPool;

    #[derive(Default)]
    struct FakeState {
        queued: VecDeque<usize>,
        queue_calls: u64,
        sequence: u32,
    }

    struct FakeBackend(Arc<Mutex<FakeState>>);

    impl CaptureBackend for FakeBackend {
        fn open(&mut self, _id: u32) -> BackendResult<()> {
            Ok(())
        }
        fn close(&mut self, _id: u32) {}
        fn configure_sensor(&mut self, _id: u32) -> BackendResult<()> {
            Ok(())
        }
        fn configure_streams(
            &mut self,
            _id: u32,
            _format: &crate::backend::StreamFormat,
        ) -> BackendResult<()> {
            Ok(())
        }
        fn request_buffers(&mut self, _id: u32, _count: u32) -> BackendResult<()> {
            Ok(())
        }
        fn queue(&mut self, _id: u32, slot: usize, _addr: usize, _length: u32) -> BackendResult<()> {
            let mut state = self.0.lock().unwrap();
            state.queued.push_back(slot);
            state.queue_calls += 1;
            Ok(())
        }
        fn dequeue(&mut self, _id: u32) -> BackendResult<DequeuedFrame> {
            let mut state = self.0.lock().unwrap();
            match state.queued.pop_front() {
                Some(slot) => {
                    state.sequence += 1;
                    Ok(DequeuedFrame {
                        slot,
                        sequence: state.sequence,
                        timestamp_us: 0,
                    })
                }
                None => Err(BackendError::Again),
            }
        }
        fn wait(&mut self, ids: &[u32], timeout: Duration) -> BackendResult<Vec<u32>> {
            let deadline = Instant::now() + timeout;
            loop {
                if !self.0.lock().unwrap().queued.is_empty() {
                    return Ok(ids.to_vec());
                }
                if Instant::now() >= deadline {
                    return Err(BackendError::Timeout);
                }
                thread::sleep(Duration::from_millis(2));
            }
        }
        fn start(&mut self, _id: u32) -> BackendResult<()> {
            Ok(())
        }
        fn stop(&mut self, _id: u32) -> BackendResult<()> {
            Ok(())
        }
        fn frame_size(&self, _id: u32, pixel_format: u32, width: u32, height: u32) -> (u32, u32) {
            let (size, _stride, bpp) = crate::backend::frame_geometry(pixel_format, width, height);
            (size, bpp)
        }
    }

    fn test_camera(id: u32) -> Arc<Camera> {
        let camera = Arc::new(Camera::new(PhysicalCamera {
            id,
            width: 64,
            height: 32,
            pixel_format: fourcc::YUYV,
            kind: BackendKind::V4l2,
            sensor_name: String::new(),
            devnode: String::new(),
            native_driver: String::new(),
            deserializer: id,
        }));
        let format = camera.shared().format;
        let pool = BufferPool::create(id, &format, BUFFER_COUNT).unwrap();
        pool.unlink();
        *camera.pool() = Some(pool);
        camera.shared().materialized = true;
        camera
    }

    #[test]
    fn frames_without_subscribers_recycle_immediately() {
        let camera = test_camera(97);
        let state = Arc::new(Mutex::new(FakeState::default()));
        let (sup_tx, _sup_rx) = crossbeam_channel::unbounded();
        let handle = spawn(
            97,
            vec![camera.clone()],
            Box::new(FakeBackend(state.clone())),
            sup_tx,
        )
        .unwrap();

        handle.tx.send(WorkerCmd::Start(97)).unwrap();

        // With nobody subscribed every dequeued frame goes straight back to
        // the hardware: 6 initial queue calls, then a steady re-queue churn.
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let calls = state.lock().unwrap().queue_calls;
            if calls >= 18 {
                break;
            }
            assert!(Instant::now() < deadline, "only {} queue calls", calls);
            thread::sleep(Duration::from_millis(5));
        }

        {
            let (free, queued, in_use) = camera.pool().as_ref().unwrap().state_counts();
            assert_eq!(free + queued + in_use, BUFFER_COUNT);
            assert_eq!(in_use, 0);
        }

        handle.tx.send(WorkerCmd::Shutdown).unwrap();
        handle.thread.join().unwrap();
        assert_eq!(
            camera.pool().as_ref().unwrap().state_counts(),
            (BUFFER_COUNT, 0, 0)
        );
    }

    #[test]
    fn stop_drains_the_pool_to_free() {
        let camera = test_camera(98);
        let state = Arc::new(Mutex::new(FakeState::default()));
        let (sup_tx, _sup_rx) = crossbeam_channel::unbounded();
        let handle = spawn(
            98,
            vec![camera.clone()],
            Box::new(FakeBackend(state.clone())),
            sup_tx,
        )
        .unwrap();

        handle.tx.send(WorkerCmd::Start(98)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        while state.lock().unwrap().queue_calls < 6 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        handle.tx.send(WorkerCmd::Stop(98)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if camera.pool().as_ref().unwrap().state_counts().0 == BUFFER_COUNT {
                break;
            }
            assert!(Instant::now() < deadline, "pool did not drain");
            thread::sleep(Duration::from_millis(5));
        }

        handle.tx.send(WorkerCmd::Shutdown).unwrap();
        handle.thread.join().unwrap();
    }
}
