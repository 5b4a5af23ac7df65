// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Capture backends.
//!
//! A backend owns the descriptors of the physical devices it drives and is
//! called from that device group's worker thread only. Two implementations
//! exist: kernel V4L2 ioctls and a dynamically loaded vendor HAL.

pub mod hal;
pub mod v4l2;

use std::time::Duration;

use thiserror::Error;

use crate::config::BackendKind;
use crate::config::PhysicalCamera;
use crate::protocol::PictureFormat;

/// Fourcc codes for the pixel formats the daemon understands.
pub mod fourcc {
    const fn code(a: u8, b: u8, c: u8, d: u8) -> u32 {
        a as u32 | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24
    }

    pub const YUYV: u32 = code(b'Y', b'U', b'Y', b'V');
    pub const YYUV: u32 = code(b'Y', b'Y', b'U', b'V');
    pub const YVYU: u32 = code(b'Y', b'V', b'Y', b'U');
    pub const UYVY: u32 = code(b'U', b'Y', b'V', b'Y');
    pub const VYUY: u32 = code(b'V', b'Y', b'U', b'Y');
    pub const NV12: u32 = code(b'N', b'V', b'1', b'2');
    pub const NV21: u32 = code(b'N', b'V', b'2', b'1');
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// No frame arrived within the poll window. Retried by the worker.
    #[error("dequeue timed out")]
    Timeout,
    /// The device had nothing ready. Retried by the worker.
    #[error("no frame ready")]
    Again,
    /// The backend cannot perform this operation at all.
    #[error("operation not supported by this backend")]
    Unsupported,
    #[error("unknown camera id {0}")]
    UnknownCamera(u32),
    #[error("{context}: {source}")]
    Os {
        context: &'static str,
        source: nix::Error,
    },
    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    fn os(context: &'static str) -> impl FnOnce(nix::Error) -> BackendError {
        move |source| BackendError::Os { context, source }
    }

    /// Transient errors are swallowed by the capture loop; everything else
    /// counts toward the device fault threshold.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Timeout | BackendError::Again)
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// A negotiated stream format with its derived geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub size: u32,
    pub field: u32,
}

impl StreamFormat {
    pub fn new(pixel_format: u32, width: u32, height: u32) -> StreamFormat {
        let (size, stride, _bpp) = frame_geometry(pixel_format, width, height);
        StreamFormat {
            pixel_format,
            width,
            height,
            stride,
            size,
            field: 0,
        }
    }

    pub fn to_wire(&self) -> PictureFormat {
        let mut wire = PictureFormat::default();
        wire.pixel_format = self.pixel_format;
        wire.size.width = self.width;
        wire.size.max_width = self.width;
        wire.size.height = self.height;
        wire.size.max_height = self.height;
        wire.size.stride = self.stride;
        wire.size.sizeimage = self.size;
        wire
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Returns `(frame bytes, stride, bits per pixel)` for a format. Strides are
/// aligned to 64 bytes for the capture hardware; the semi-planar formats
/// carry a half-height chroma plane below the luma plane.
pub fn frame_geometry(pixel_format: u32, width: u32, height: u32) -> (u32, u32, u32) {
    match pixel_format {
        fourcc::NV12 | fourcc::NV21 => {
            let stride = align_up(width, 64);
            (stride * height * 3 / 2, stride, 12)
        }
        // Packed 4:2:2, and the fallback for anything unrecognised.
        _ => {
            let stride = align_up(width * 2, 64);
            (stride * height, stride, 16)
        }
    }
}

/// A frame handed back by the hardware.
#[derive(Debug, Clone, Copy)]
pub struct DequeuedFrame {
    pub slot: usize,
    pub sequence: u32,
    pub timestamp_us: i64,
}

/// The capability set every capture backend implements.
///
/// All methods take the physical camera id so one backend instance can drive
/// a whole deserializer group. Implementations are only ever called from the
/// group's worker thread.
pub trait CaptureBackend: Send {
    fn open(&mut self, id: u32) -> Result<()>;
    fn close(&mut self, id: u32);
    /// Sensor-level input selection; optional for plain video nodes.
    fn configure_sensor(&mut self, id: u32) -> Result<()>;
    fn configure_streams(&mut self, id: u32, format: &StreamFormat) -> Result<()>;
    fn request_buffers(&mut self, id: u32, count: u32) -> Result<()>;
    /// Hands the slot's memory to the hardware for the next capture.
    fn queue(&mut self, id: u32, slot: usize, addr: usize, length: u32) -> Result<()>;
    /// Takes a filled frame back from the hardware without blocking.
    fn dequeue(&mut self, id: u32) -> Result<DequeuedFrame>;
    /// Blocks until at least one of `ids` has a frame ready, or the timeout
    /// elapses. Backends without a pollable handle return all ids and let
    /// `dequeue` block internally.
    fn wait(&mut self, ids: &[u32], timeout: Duration) -> Result<Vec<u32>>;
    fn start(&mut self, id: u32) -> Result<()>;
    fn stop(&mut self, id: u32) -> Result<()>;
    /// Frame bytes and bits per pixel for a proposed format.
    fn frame_size(&self, id: u32, pixel_format: u32, width: u32, height: u32) -> (u32, u32);
}

/// Builds the backend for a deserializer group from its scenario entries.
/// All members of a group share one interface type.
pub fn create_backend(group: &[PhysicalCamera]) -> Result<Box<dyn CaptureBackend>> {
    let kind = group
        .first()
        .map(|c| c.kind)
        .ok_or_else(|| BackendError::Failed("empty deserializer group".to_string()))?;
    if group.iter().any(|c| c.kind != kind) {
        return Err(BackendError::Failed(format!(
            "deserializer group {} mixes interface types",
            group[0].deserializer
        )));
    }
    match kind {
        BackendKind::V4l2 => Ok(Box::new(v4l2::V4l2Backend::new(group))),
        BackendKind::Hal => Ok(Box::new(hal::HalBackend::load(group)?)),
    }
}
