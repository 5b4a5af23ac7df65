// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-camera capture buffer pool.
//!
//! The pool owns one named shared-memory object holding all of a camera's
//! capture buffers at page-aligned slot offsets, and a small state machine
//! per slot tracking who is holding the frame. Clients map the same object
//! by name, so no frame bytes ever cross the control socket.
//!
//! Slot states:
//! - `Free`: not with the driver, not with any client.
//! - `Queued`: earmarked for the hardware; `submitted` records whether the
//!   worker has actually handed it over yet.
//! - `InUse`: dispatched to the subscriber set captured at dequeue time.

use std::collections::BTreeSet;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use log::debug;
use log::error;
use log::warn;
use nix::fcntl::OFlag;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::shm_open;
use nix::sys::mman::shm_unlink;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use nix::unistd::sysconf;
use nix::unistd::SysconfVar;
use thiserror::Error;

use crate::backend::StreamFormat;

/// Prefix of every pool's shared-memory object; the physical camera id is
/// appended. Clients derive the same name on their side.
pub const SHARED_MEM_PREFIX: &str = "camera_daemon_mem_";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create shared memory {name}: {source}")]
    Create { name: String, source: nix::Error },
    #[error("failed to size shared memory {name} to {len} bytes: {source}")]
    Truncate {
        name: String,
        len: usize,
        source: nix::Error,
    },
    #[error("failed to map shared memory {name}: {source}")]
    Map { name: String, source: nix::Error },
    #[error("camera {0} has a zero-sized frame")]
    EmptyFrame(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotState {
    Free,
    Queued { submitted: bool },
    InUse { subscribers: BTreeSet<u32> },
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    sequence: u32,
    timestamp_us: i64,
}

/// What a release did to the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The last subscriber let go; the worker must hand the slot back to
    /// the hardware.
    Requeue,
    /// Other subscribers still hold the frame.
    StillHeld,
    /// The client was not holding this slot; a no-op.
    NotHeld,
}

/// A slot the worker should submit to the hardware.
#[derive(Debug, Clone, Copy)]
pub struct Submission {
    pub slot: usize,
    pub addr: usize,
    pub length: u32,
}

pub struct BufferPool {
    camera_id: u32,
    mem_name: String,
    base: usize,
    total_len: usize,
    slot_size: usize,
    frame_len: u32,
    slots: Vec<Slot>,
}

fn page_size() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as usize)
        .unwrap_or(4096)
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

impl BufferPool {
    /// Creates the shared-memory object for `camera_id` and maps all
    /// `count` slots. The object is world-readable and writable so guest
    /// mappers can reach it, and sized once for the camera's lifetime.
    pub fn create(camera_id: u32, format: &StreamFormat, count: usize) -> Result<BufferPool, PoolError> {
        if format.size == 0 {
            return Err(PoolError::EmptyFrame(camera_id));
        }
        let mem_name = format!("{}{}", SHARED_MEM_PREFIX, camera_id);
        let slot_size = align_up(format.size as usize, page_size());
        let total_len = slot_size * count;

        let fd = shm_open(
            mem_name.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|source| PoolError::Create {
            name: mem_name.clone(),
            source,
        })?;
        ftruncate(&fd, total_len as libc::off_t).map_err(|source| PoolError::Truncate {
            name: mem_name.clone(),
            len: total_len,
            source,
        })?;

        let len = NonZeroUsize::new(total_len).ok_or(PoolError::EmptyFrame(camera_id))?;
        // Safe because we map a fresh region chosen by the kernel and keep
        // it for the lifetime of the pool.
        let base = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|source| PoolError::Map {
            name: mem_name.clone(),
            source,
        })?;

        debug!(
            "Camera {}: created {} ({} slots of {} bytes, frame {} bytes)",
            camera_id, mem_name, count, slot_size, format.size
        );

        let slots = (0..count)
            .map(|_| Slot {
                state: SlotState::Free,
                sequence: 0,
                timestamp_us: 0,
            })
            .collect();

        Ok(BufferPool {
            camera_id,
            mem_name,
            base: base.as_ptr() as usize,
            total_len,
            slot_size,
            frame_len: format.size,
            slots,
        })
    }

    pub fn mem_name(&self) -> &str {
        &self.mem_name
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn frame_len(&self) -> u32 {
        self.frame_len
    }

    pub fn slot_addr(&self, slot: usize) -> usize {
        self.base + slot * self.slot_size
    }

    /// Slots the hardware currently holds. The worker only polls a camera
    /// with at least one submitted slot.
    pub fn submitted_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Queued { submitted: true })
            .count()
    }

    /// Claims every slot that should go to the hardware (fresh `Free` slots
    /// and released `Queued` ones) and marks them submitted. The caller
    /// performs the actual queue calls without the pool lock held.
    pub fn take_submissions(&mut self) -> Vec<Submission> {
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let pending = matches!(
                slot.state,
                SlotState::Free | SlotState::Queued { submitted: false }
            );
            if pending {
                slot.state = SlotState::Queued { submitted: true };
                out.push(Submission {
                    slot: index,
                    addr: self.base + index * self.slot_size,
                    length: self.frame_len,
                });
            }
        }
        out
    }

    /// Records a dequeued frame as held by `subscribers`. With an empty set
    /// the slot simply stays with the hardware conceptually; the caller
    /// re-queues it at once.
    pub fn mark_in_use(
        &mut self,
        slot: usize,
        subscribers: BTreeSet<u32>,
        sequence: u32,
        timestamp_us: i64,
    ) {
        let Some(entry) = self.slots.get_mut(slot) else {
            error!("Camera {}: dequeued out-of-range slot {}", self.camera_id, slot);
            return;
        };
        if entry.state != (SlotState::Queued { submitted: true }) {
            warn!(
                "Camera {}: slot {} dequeued while {:?}",
                self.camera_id, slot, entry.state
            );
        }
        entry.sequence = sequence;
        entry.timestamp_us = timestamp_us;
        if subscribers.is_empty() {
            entry.state = SlotState::Queued { submitted: false };
        } else {
            entry.state = SlotState::InUse { subscribers };
        }
    }

    /// Releases `client`'s hold on `slot`. Idempotent per (slot, client):
    /// releasing a slot the client does not hold is a warned no-op, and the
    /// transition out of `InUse` happens exactly once.
    pub fn release(&mut self, slot: usize, client: u32) -> ReleaseOutcome {
        let Some(entry) = self.slots.get_mut(slot) else {
            warn!("Camera {}: release of out-of-range slot {}", self.camera_id, slot);
            return ReleaseOutcome::NotHeld;
        };
        match &mut entry.state {
            SlotState::InUse { subscribers } => {
                if !subscribers.remove(&client) {
                    warn!(
                        "Camera {}: client {} released slot {} it does not hold",
                        self.camera_id, client, slot
                    );
                    return ReleaseOutcome::NotHeld;
                }
                if subscribers.is_empty() {
                    entry.state = SlotState::Queued { submitted: false };
                    ReleaseOutcome::Requeue
                } else {
                    ReleaseOutcome::StillHeld
                }
            }
            _ => {
                warn!(
                    "Camera {}: client {} released slot {} in state {:?}",
                    self.camera_id, client, slot, entry.state
                );
                ReleaseOutcome::NotHeld
            }
        }
    }

    /// Synthesises releases for every slot still holding `client`, as when
    /// its session disconnects mid-frame. Returns how many slots became due
    /// for re-queueing.
    pub fn release_client(&mut self, client: u32) -> usize {
        let mut requeues = 0;
        for slot in 0..self.slots.len() {
            let held = matches!(
                &self.slots[slot].state,
                SlotState::InUse { subscribers } if subscribers.contains(&client)
            );
            if held && self.release(slot, client) == ReleaseOutcome::Requeue {
                requeues += 1;
            }
        }
        requeues
    }

    /// Drops every slot back to `Free`, as after a stream-off or a device
    /// stop. Outstanding client holds are forgotten.
    pub fn reset_to_free(&mut self) {
        for slot in &mut self.slots {
            slot.state = SlotState::Free;
            slot.sequence = 0;
            slot.timestamp_us = 0;
        }
    }

    /// `(free, queued, in_use)` slot counts. Their sum is always the pool
    /// size.
    pub fn state_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for slot in &self.slots {
            match slot.state {
                SlotState::Free => counts.0 += 1,
                SlotState::Queued { .. } => counts.1 += 1,
                SlotState::InUse { .. } => counts.2 += 1,
            }
        }
        counts
    }

    /// Whether `client` still holds `slot`.
    pub fn is_held_by(&self, slot: usize, client: u32) -> bool {
        matches!(
            self.slots.get(slot).map(|s| &s.state),
            Some(SlotState::InUse { subscribers }) if subscribers.contains(&client)
        )
    }

    /// Removes the shared-memory name. Called once at clean shutdown; the
    /// name stays valid for the camera's whole lifetime otherwise.
    pub fn unlink(&self) {
        if let Err(e) = shm_unlink(self.mem_name.as_str()) {
            warn!("Failed to unlink {}: {}", self.mem_name, e);
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Some(base) = NonNull::new(self.base as *mut c_void) {
            // Safe because the mapping was created with this base and
            // length and nothing else unmaps it.
            if let Err(e) = unsafe { munmap(base, self.total_len) } {
                warn!("Failed to unmap {}: {}", self.mem_name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fourcc;

    fn test_pool(camera_id: u32) -> BufferPool {
        let format = StreamFormat::new(fourcc::YUYV, 64, 32);
        let pool = BufferPool::create(camera_id, &format, 6).unwrap();
        pool.unlink();
        pool
    }

    fn dispatch(pool: &mut BufferPool, slot: usize, clients: &[u32]) {
        pool.mark_in_use(slot, clients.iter().copied().collect(), 1, 0);
    }

    #[test]
    fn slots_are_page_aligned_and_disjoint() {
        let pool = test_pool(90);
        assert_eq!(pool.slot_count(), 6);
        let first = pool.slot_addr(0);
        let second = pool.slot_addr(1);
        assert_eq!((second - first) % page_size(), 0);
        assert!(second - first >= pool.frame_len() as usize);
        assert_eq!(pool.mem_name(), "camera_daemon_mem_90");
    }

    #[test]
    fn submissions_claim_each_slot_once() {
        let mut pool = test_pool(91);
        let first = pool.take_submissions();
        assert_eq!(first.len(), 6);
        assert_eq!(pool.submitted_count(), 6);
        // Already submitted; nothing more to hand over.
        assert!(pool.take_submissions().is_empty());
    }

    #[test]
    fn last_release_requeues_exactly_once() {
        let mut pool = test_pool(92);
        pool.take_submissions();
        dispatch(&mut pool, 2, &[7, 8]);

        assert_eq!(pool.release(2, 7), ReleaseOutcome::StillHeld);
        assert_eq!(pool.release(2, 8), ReleaseOutcome::Requeue);
        // Second release of the same hold is a no-op.
        assert_eq!(pool.release(2, 8), ReleaseOutcome::NotHeld);
        assert_eq!(pool.take_submissions().len(), 1);
    }

    #[test]
    fn releasing_an_unheld_slot_is_a_noop() {
        let mut pool = test_pool(93);
        pool.take_submissions();
        assert_eq!(pool.release(0, 1), ReleaseOutcome::NotHeld);
        dispatch(&mut pool, 0, &[1]);
        assert_eq!(pool.release(0, 2), ReleaseOutcome::NotHeld);
        assert!(pool.is_held_by(0, 1));
    }

    #[test]
    fn conservation_holds_across_transitions() {
        let mut pool = test_pool(94);
        let total = pool.slot_count();
        let check = |pool: &BufferPool| {
            let (free, queued, in_use) = pool.state_counts();
            assert_eq!(free + queued + in_use, total);
        };

        check(&pool);
        pool.take_submissions();
        check(&pool);
        dispatch(&mut pool, 0, &[1, 2]);
        dispatch(&mut pool, 1, &[1]);
        check(&pool);
        pool.release(0, 1);
        pool.release(1, 1);
        check(&pool);
        pool.reset_to_free();
        check(&pool);
        assert_eq!(pool.state_counts(), (total, 0, 0));
    }

    #[test]
    fn client_disconnect_releases_all_holds() {
        let mut pool = test_pool(95);
        pool.take_submissions();
        dispatch(&mut pool, 0, &[1, 2]);
        dispatch(&mut pool, 1, &[1]);
        dispatch(&mut pool, 2, &[2]);

        // Slot 1 was held only by client 1, so one slot becomes due.
        assert_eq!(pool.release_client(1), 1);
        assert!(!pool.is_held_by(0, 1));
        assert!(pool.is_held_by(0, 2));
        assert_eq!(pool.release_client(1), 0);
    }

    #[test]
    fn empty_subscriber_set_keeps_the_slot_queued() {
        let mut pool = test_pool(96);
        pool.take_submissions();
        pool.mark_in_use(0, BTreeSet::new(), 5, 123);
        let (_, queued, in_use) = pool.state_counts();
        assert_eq!(in_use, 0);
        assert_eq!(queued, 6);
        // The slot is due for immediate re-submission.
        assert_eq!(pool.take_submissions().len(), 1);
    }
}
