// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Vendor HAL capture backend.
//!
//! Loads the camera HAL named by the scenario file and resolves its
//! published `vcamera_*` entry points. Every capability is optional at load
//! time; an operation whose symbol is absent fails with `Unsupported`.

use std::collections::BTreeMap;
use std::ffi::c_int;
use std::ffi::c_void;
use std::ptr;
use std::time::Duration;

use libloading::os::unix::Symbol as RawSymbol;
use libloading::Library;
use log::debug;
use log::info;
use log::warn;

use crate::backend::frame_geometry;
use crate::backend::BackendError;
use crate::backend::CaptureBackend;
use crate::backend::DequeuedFrame;
use crate::backend::Result;
use crate::backend::StreamFormat;
use crate::config::PhysicalCamera;

/// Frame descriptor crossing the HAL boundary.
#[repr(C)]
pub struct HalFrame {
    pub index: c_int,
    pub addr: *mut c_void,
    pub length: u32,
    pub sequence: u32,
    pub timestamp_us: i64,
}

/// Stream configuration crossing the HAL boundary.
#[repr(C)]
pub struct HalStreamConfig {
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
    pub field: u32,
    pub stride: u32,
    pub size: u32,
}

type HalInitFn = unsafe extern "C" fn() -> c_int;
type HalDeinitFn = unsafe extern "C" fn() -> c_int;
type HalOpenFn = unsafe extern "C" fn(c_int) -> c_int;
type HalCloseFn = unsafe extern "C" fn(c_int);
type HalConfigSensorFn = unsafe extern "C" fn(c_int, *mut c_void) -> c_int;
type HalConfigStreamsFn = unsafe extern "C" fn(c_int, *mut HalStreamConfig) -> c_int;
type HalStartFn = unsafe extern "C" fn(c_int) -> c_int;
type HalStopFn = unsafe extern "C" fn(c_int) -> c_int;
type HalReqBufsFn = unsafe extern "C" fn(c_int, c_int) -> c_int;
type HalQbufFn = unsafe extern "C" fn(c_int, *mut HalFrame) -> c_int;
type HalDqbufFn = unsafe extern "C" fn(c_int, c_int, *mut HalFrame) -> c_int;
type HalFrameSizeFn =
    unsafe extern "C" fn(c_int, c_int, c_int, c_int, c_int, *mut c_int) -> c_int;

/// The resolved entry points. Mirrors the published symbol table; a `None`
/// entry means the HAL does not implement that capability.
struct HalOps {
    init: Option<RawSymbol<HalInitFn>>,
    deinit: Option<RawSymbol<HalDeinitFn>>,
    open: Option<RawSymbol<HalOpenFn>>,
    close: Option<RawSymbol<HalCloseFn>>,
    config_sensor_input: Option<RawSymbol<HalConfigSensorFn>>,
    config_streams: Option<RawSymbol<HalConfigStreamsFn>>,
    start: Option<RawSymbol<HalStartFn>>,
    stop: Option<RawSymbol<HalStopFn>>,
    req_bufs: Option<RawSymbol<HalReqBufsFn>>,
    qbuf: Option<RawSymbol<HalQbufFn>>,
    dqbuf: Option<RawSymbol<HalDqbufFn>>,
    frame_size: Option<RawSymbol<HalFrameSizeFn>>,
}

pub struct HalBackend {
    ops: HalOps,
    /// Slot lookup for frames the HAL hands back by address.
    queued: BTreeMap<u32, BTreeMap<usize, (usize, u32)>>,
    sequences: BTreeMap<u32, u32>,
    // Dropped last; the resolved symbols must not outlive it.
    _library: Library,
}

fn resolve<T>(library: &Library, name: &'static [u8], missing: &mut Vec<&'static str>) -> Option<RawSymbol<T>> {
    // Safe because the symbol is only used while the library stays loaded
    // (the backend owns it) and the signature is part of the published ABI.
    match unsafe { library.get::<T>(name) } {
        Ok(symbol) => {
            debug!("Resolved {}", String::from_utf8_lossy(&name[..name.len() - 1]));
            Some(unsafe { symbol.into_raw() })
        }
        Err(_) => {
            missing.push(std::str::from_utf8(&name[..name.len() - 1]).unwrap_or("?"));
            None
        }
    }
}

fn check(ret: c_int, what: &str) -> Result<()> {
    match ret {
        0 => Ok(()),
        r if r == -libc::ETIMEDOUT => Err(BackendError::Timeout),
        r if r == -libc::EAGAIN => Err(BackendError::Again),
        r => Err(BackendError::Failed(format!("{} returned {}", what, r))),
    }
}

impl HalBackend {
    pub fn load(group: &[PhysicalCamera]) -> Result<HalBackend> {
        let driver = group
            .iter()
            .map(|c| c.native_driver.as_str())
            .find(|d| !d.is_empty())
            .ok_or_else(|| BackendError::Failed("no native driver configured".to_string()))?;

        // Safe because the HAL is a scenario-designated library whose
        // initialisers are expected to run.
        let library = unsafe { Library::new(driver) }
            .map_err(|e| BackendError::Failed(format!("failed to load {}: {}", driver, e)))?;

        let mut missing = Vec::new();
        let ops = HalOps {
            init: resolve(&library, b"vcamera_hal_init\0", &mut missing),
            deinit: resolve(&library, b"vcamera_hal_deinit\0", &mut missing),
            open: resolve(&library, b"vcamera_device_open\0", &mut missing),
            close: resolve(&library, b"vcamera_device_close\0", &mut missing),
            config_sensor_input: resolve(
                &library,
                b"vcamera_device_config_sensor_input\0",
                &mut missing,
            ),
            config_streams: resolve(&library, b"vcamera_device_config_streams\0", &mut missing),
            start: resolve(&library, b"vcamera_device_start\0", &mut missing),
            stop: resolve(&library, b"vcamera_device_stop\0", &mut missing),
            req_bufs: resolve(&library, b"vcamera_req_bufs\0", &mut missing),
            qbuf: resolve(&library, b"vcamera_stream_qbuf\0", &mut missing),
            dqbuf: resolve(&library, b"vcamera_stream_dqbuf\0", &mut missing),
            frame_size: resolve(&library, b"vcamera_get_frame_size\0", &mut missing),
        };
        if !missing.is_empty() {
            warn!("{}: unresolved HAL symbols: {}", driver, missing.join(", "));
        }

        if let Some(init) = &ops.init {
            // Safe: published ABI, library loaded.
            check(unsafe { init() }, "vcamera_hal_init")?;
        }
        info!("Loaded camera HAL {}", driver);

        Ok(HalBackend {
            ops,
            queued: BTreeMap::new(),
            sequences: BTreeMap::new(),
            _library: library,
        })
    }
}

impl Drop for HalBackend {
    fn drop(&mut self) {
        if let Some(deinit) = &self.ops.deinit {
            // Safe: published ABI, library still loaded.
            let ret = unsafe { deinit() };
            if ret != 0 {
                warn!("vcamera_hal_deinit returned {}", ret);
            }
        }
    }
}

impl CaptureBackend for HalBackend {
    fn open(&mut self, id: u32) -> Result<()> {
        let open = self.ops.open.as_ref().ok_or(BackendError::Unsupported)?;
        // Safe: published ABI.
        check(unsafe { open(id as c_int) }, "vcamera_device_open")
    }

    fn close(&mut self, id: u32) {
        if let Some(close) = &self.ops.close {
            // Safe: published ABI.
            unsafe { close(id as c_int) };
        }
        self.queued.remove(&id);
    }

    fn configure_sensor(&mut self, id: u32) -> Result<()> {
        let config = self
            .ops
            .config_sensor_input
            .as_ref()
            .ok_or(BackendError::Unsupported)?;
        // Safe: published ABI; a null configuration selects the default
        // sensor input.
        check(
            unsafe { config(id as c_int, ptr::null_mut()) },
            "vcamera_device_config_sensor_input",
        )
    }

    fn configure_streams(&mut self, id: u32, format: &StreamFormat) -> Result<()> {
        let config = self
            .ops
            .config_streams
            .as_ref()
            .ok_or(BackendError::Unsupported)?;
        let mut stream = HalStreamConfig {
            pixel_format: format.pixel_format,
            width: format.width,
            height: format.height,
            field: format.field,
            stride: format.stride,
            size: format.size,
        };
        // Safe: published ABI; stream outlives the call.
        check(
            unsafe { config(id as c_int, &mut stream) },
            "vcamera_device_config_streams",
        )
    }

    fn request_buffers(&mut self, id: u32, count: u32) -> Result<()> {
        let req_bufs = self.ops.req_bufs.as_ref().ok_or(BackendError::Unsupported)?;
        // Safe: published ABI.
        check(
            unsafe { req_bufs(id as c_int, count as c_int) },
            "vcamera_req_bufs",
        )
    }

    fn queue(&mut self, id: u32, slot: usize, addr: usize, length: u32) -> Result<()> {
        let qbuf = self.ops.qbuf.as_ref().ok_or(BackendError::Unsupported)?;
        let mut frame = HalFrame {
            index: slot as c_int,
            addr: addr as *mut c_void,
            length,
            sequence: 0,
            timestamp_us: 0,
        };
        // Safe: published ABI; the slot memory outlives the stream.
        check(unsafe { qbuf(id as c_int, &mut frame) }, "vcamera_stream_qbuf")?;
        self.queued.entry(id).or_default().insert(addr, (slot, length));
        Ok(())
    }

    fn dequeue(&mut self, id: u32) -> Result<DequeuedFrame> {
        let dqbuf = self.ops.dqbuf.as_ref().ok_or(BackendError::Unsupported)?;
        let mut frame = HalFrame {
            index: -1,
            addr: ptr::null_mut(),
            length: 0,
            sequence: 0,
            timestamp_us: 0,
        };
        // Safe: published ABI; frame outlives the call. Stream 0 is the only
        // stream the daemon configures.
        check(unsafe { dqbuf(id as c_int, 0, &mut frame) }, "vcamera_stream_dqbuf")?;

        // HALs report the buffer by address; translate back to the slot we
        // queued it under.
        let slot = self
            .queued
            .get_mut(&id)
            .and_then(|slots| slots.remove(&(frame.addr as usize)))
            .map(|(slot, _)| slot)
            .or_else(|| (frame.index >= 0).then_some(frame.index as usize))
            .ok_or_else(|| {
                BackendError::Failed(format!("HAL returned unknown buffer {:p}", frame.addr))
            })?;

        let sequence = if frame.sequence != 0 {
            frame.sequence
        } else {
            let next = self.sequences.entry(id).or_insert(0);
            *next = next.wrapping_add(1);
            *next
        };
        Ok(DequeuedFrame {
            slot,
            sequence,
            timestamp_us: frame.timestamp_us,
        })
    }

    fn wait(&mut self, ids: &[u32], _timeout: Duration) -> Result<Vec<u32>> {
        // The HAL exposes no pollable handle; its dequeue blocks internally.
        Ok(ids.to_vec())
    }

    fn start(&mut self, id: u32) -> Result<()> {
        let start = self.ops.start.as_ref().ok_or(BackendError::Unsupported)?;
        // Safe: published ABI.
        check(unsafe { start(id as c_int) }, "vcamera_device_start")
    }

    fn stop(&mut self, id: u32) -> Result<()> {
        let stop = self.ops.stop.as_ref().ok_or(BackendError::Unsupported)?;
        // Safe: published ABI.
        check(unsafe { stop(id as c_int) }, "vcamera_device_stop")
    }

    fn frame_size(&self, id: u32, pixel_format: u32, width: u32, height: u32) -> (u32, u32) {
        if let Some(frame_size) = &self.ops.frame_size {
            let mut bpp: c_int = 0;
            // Safe: published ABI; bpp outlives the call.
            let size = unsafe {
                frame_size(
                    id as c_int,
                    pixel_format as c_int,
                    width as c_int,
                    height as c_int,
                    0,
                    &mut bpp,
                )
            };
            if size > 0 {
                return (size as u32, bpp as u32);
            }
        }
        let (size, _stride, bpp) = frame_geometry(pixel_format, width, height);
        (size, bpp)
    }
}
