// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! V4L2 capture backend.
//!
//! Talks to `/dev/videoN` nodes with user-pointer streaming I/O: the daemon
//! owns the frame memory (the shared-memory pool) and lends each slot to the
//! driver with `VIDIOC_QBUF`. Device nodes are opened non-blocking; readiness
//! comes from poll(2), so a group worker can watch several nodes at once.

use std::collections::BTreeMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use log::info;
use log::warn;
use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;

use crate::backend::frame_geometry;
use crate::backend::BackendError;
use crate::backend::CaptureBackend;
use crate::backend::DequeuedFrame;
use crate::backend::Result;
use crate::backend::StreamFormat;
use crate::config::PhysicalCamera;

/// Kernel UAPI structures and ioctl numbers for video capture, declared by
/// hand the way the snapshot-device ioctls are. Layouts are pinned to the
/// 64-bit kernel ABI by the tests below.
pub mod sys {
    use std::mem;

    pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
    pub const V4L2_MEMORY_USERPTR: u32 = 2;
    pub const V4L2_FIELD_ANY: u32 = 0;

    pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
    pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
    pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_capability {
        pub driver: [u8; 16],
        pub card: [u8; 32],
        pub bus_info: [u8; 32],
        pub version: u32,
        pub capabilities: u32,
        pub device_caps: u32,
        pub reserved: [u32; 3],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_pix_format {
        pub width: u32,
        pub height: u32,
        pub pixelformat: u32,
        pub field: u32,
        pub bytesperline: u32,
        pub sizeimage: u32,
        pub colorspace: u32,
        pub private: u32,
        pub flags: u32,
        pub ycbcr_enc: u32,
        pub quantization: u32,
        pub xfer_func: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub union v4l2_format_fmt {
        pub pix: v4l2_pix_format,
        pub raw_data: [u8; 200],
        // The kernel union holds pointer-bearing members, forcing 8-byte
        // alignment on 64-bit; mirror that without declaring them all.
        pub alignment: [u64; 25],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_format {
        pub type_: u32,
        pub fmt: v4l2_format_fmt,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_requestbuffers {
        pub count: u32,
        pub type_: u32,
        pub memory: u32,
        pub capabilities: u32,
        pub flags: u8,
        pub reserved: [u8; 3],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_timecode {
        pub type_: u32,
        pub flags: u32,
        pub frames: u8,
        pub seconds: u8,
        pub minutes: u8,
        pub hours: u8,
        pub userbits: [u8; 4],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub union v4l2_buffer_m {
        pub offset: u32,
        pub userptr: libc::c_ulong,
        pub planes: u64,
        pub fd: i32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct v4l2_buffer {
        pub index: u32,
        pub type_: u32,
        pub bytesused: u32,
        pub flags: u32,
        pub field: u32,
        pub padding: u32,
        pub timestamp: libc::timeval,
        pub timecode: v4l2_timecode,
        pub sequence: u32,
        pub memory: u32,
        pub m: v4l2_buffer_m,
        pub length: u32,
        pub reserved2: u32,
        pub request_fd: i32,
    }

    /// All-zero is a valid bit pattern for every structure here; the ioctl
    /// convention is to zero-fill and set only the fields of interest.
    pub fn zeroed<T: Copy>() -> T {
        // Safe because the UAPI structs are plain data with no invalid
        // representations.
        unsafe { mem::zeroed() }
    }

    nix::ioctl_read!(vidioc_querycap, b'V', 0, v4l2_capability);
    nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
    nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
    nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
    nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
    nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
    nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);
}

struct V4l2Device {
    devnode: PathBuf,
    file: Option<File>,
    format: Option<StreamFormat>,
}

pub struct V4l2Backend {
    devices: BTreeMap<u32, V4l2Device>,
}

impl V4l2Backend {
    pub fn new(group: &[PhysicalCamera]) -> V4l2Backend {
        let devices = group
            .iter()
            .map(|camera| {
                (
                    camera.id,
                    V4l2Device {
                        devnode: PathBuf::from(&camera.devnode),
                        file: None,
                        format: None,
                    },
                )
            })
            .collect();
        V4l2Backend { devices }
    }

    fn device(&self, id: u32) -> Result<&V4l2Device> {
        self.devices.get(&id).ok_or(BackendError::UnknownCamera(id))
    }

    fn device_mut(&mut self, id: u32) -> Result<&mut V4l2Device> {
        self.devices
            .get_mut(&id)
            .ok_or(BackendError::UnknownCamera(id))
    }

    fn fd(&self, id: u32) -> Result<i32> {
        self.device(id)?
            .file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| BackendError::Failed(format!("camera {} is not open", id)))
    }
}

impl CaptureBackend for V4l2Backend {
    fn open(&mut self, id: u32) -> Result<()> {
        let device = self.device_mut(id)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&device.devnode)
            .map_err(|e| BackendError::Failed(format!("open {}: {}", device.devnode.display(), e)))?;

        let mut cap: sys::v4l2_capability = sys::zeroed();
        // Safe because the ioctl only writes into the capability struct we
        // pass it and the fd is valid for the lifetime of the call.
        unsafe { sys::vidioc_querycap(file.as_raw_fd(), &mut cap) }
            .map_err(BackendError::os("VIDIOC_QUERYCAP"))?;
        let caps = if cap.capabilities & sys::V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        if caps & sys::V4L2_CAP_VIDEO_CAPTURE == 0 || caps & sys::V4L2_CAP_STREAMING == 0 {
            return Err(BackendError::Failed(format!(
                "{} does not support streaming video capture",
                device.devnode.display()
            )));
        }

        info!("Opened {} for camera {}", device.devnode.display(), id);
        device.file = Some(file);
        Ok(())
    }

    fn close(&mut self, id: u32) {
        if let Some(device) = self.devices.get_mut(&id) {
            if device.file.take().is_some() {
                debug!("Closed {} for camera {}", device.devnode.display(), id);
            }
        }
    }

    fn configure_sensor(&mut self, _id: u32) -> Result<()> {
        // Plain video nodes have no sensor input to select.
        Ok(())
    }

    fn configure_streams(&mut self, id: u32, format: &StreamFormat) -> Result<()> {
        let fd = self.fd(id)?;
        let mut pix: sys::v4l2_pix_format = sys::zeroed();
        pix.width = format.width;
        pix.height = format.height;
        pix.pixelformat = format.pixel_format;
        pix.field = if format.field != 0 {
            format.field
        } else {
            sys::V4L2_FIELD_ANY
        };
        pix.bytesperline = format.stride;
        pix.sizeimage = format.size;

        let mut fmt: sys::v4l2_format = sys::zeroed();
        fmt.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        fmt.fmt.pix = pix;

        // Safe because the format struct lives across the call and the
        // driver only updates it in place.
        unsafe { sys::vidioc_s_fmt(fd, &mut fmt) }.map_err(BackendError::os("VIDIOC_S_FMT"))?;

        // Safe: pix is the member we populated and S_FMT returned it.
        let negotiated = unsafe { fmt.fmt.pix };
        if negotiated.sizeimage > format.size {
            warn!(
                "Camera {}: driver wants {} bytes per frame, pool slots hold {}",
                id, negotiated.sizeimage, format.size
            );
        }
        self.device_mut(id)?.format = Some(*format);
        Ok(())
    }

    fn request_buffers(&mut self, id: u32, count: u32) -> Result<()> {
        let fd = self.fd(id)?;
        let mut req: sys::v4l2_requestbuffers = sys::zeroed();
        req.count = count;
        req.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = sys::V4L2_MEMORY_USERPTR;
        // Safe because req is valid for the duration of the call.
        unsafe { sys::vidioc_reqbufs(fd, &mut req) }
            .map_err(BackendError::os("VIDIOC_REQBUFS"))?;
        debug!("Camera {}: driver granted {} user-pointer buffers", id, req.count);
        Ok(())
    }

    fn queue(&mut self, id: u32, slot: usize, addr: usize, length: u32) -> Result<()> {
        let fd = self.fd(id)?;
        let mut buf: sys::v4l2_buffer = sys::zeroed();
        buf.index = slot as u32;
        buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = sys::V4L2_MEMORY_USERPTR;
        buf.m.userptr = addr as libc::c_ulong;
        buf.length = length;
        // Safe because the slot memory outlives the stream: the driver holds
        // the pointer until the buffer is dequeued or the stream stops.
        unsafe { sys::vidioc_qbuf(fd, &mut buf) }.map_err(BackendError::os("VIDIOC_QBUF"))?;
        Ok(())
    }

    fn dequeue(&mut self, id: u32) -> Result<DequeuedFrame> {
        let fd = self.fd(id)?;
        let mut buf: sys::v4l2_buffer = sys::zeroed();
        buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = sys::V4L2_MEMORY_USERPTR;
        // Safe because buf is valid for the duration of the call.
        match unsafe { sys::vidioc_dqbuf(fd, &mut buf) } {
            Ok(_) => Ok(DequeuedFrame {
                slot: buf.index as usize,
                sequence: buf.sequence,
                timestamp_us: buf.timestamp.tv_sec as i64 * 1_000_000
                    + buf.timestamp.tv_usec as i64,
            }),
            Err(Errno::EAGAIN) => Err(BackendError::Again),
            Err(Errno::EINTR) => Err(BackendError::Again),
            Err(e) => Err(BackendError::Os {
                context: "VIDIOC_DQBUF",
                source: e,
            }),
        }
    }

    fn wait(&mut self, ids: &[u32], timeout: Duration) -> Result<Vec<u32>> {
        let mut fds = Vec::with_capacity(ids.len());
        for id in ids {
            let device = self.device(*id)?;
            let file = device
                .file
                .as_ref()
                .ok_or_else(|| BackendError::Failed(format!("camera {} is not open", id)))?;
            fds.push(PollFd::new(
                file.as_fd(),
                PollFlags::POLLIN | PollFlags::POLLPRI | PollFlags::POLLERR,
            ));
        }

        let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => Err(BackendError::Timeout),
            Ok(_) => {
                let mut ready = Vec::new();
                for (fd, id) in fds.iter().zip(ids) {
                    if fd.revents().map_or(false, |r| !r.is_empty()) {
                        ready.push(*id);
                    }
                }
                Ok(ready)
            }
            Err(Errno::EINTR) => Err(BackendError::Again),
            Err(e) => Err(BackendError::Os {
                context: "poll",
                source: e,
            }),
        }
    }

    fn start(&mut self, id: u32) -> Result<()> {
        let fd = self.fd(id)?;
        let buf_type = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        // Safe because the argument is a plain integer read by the kernel.
        unsafe { sys::vidioc_streamon(fd, &buf_type) }
            .map_err(BackendError::os("VIDIOC_STREAMON"))?;
        Ok(())
    }

    fn stop(&mut self, id: u32) -> Result<()> {
        let fd = self.fd(id)?;
        let buf_type = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        // Safe because the argument is a plain integer read by the kernel.
        unsafe { sys::vidioc_streamoff(fd, &buf_type) }
            .map_err(BackendError::os("VIDIOC_STREAMOFF"))?;
        Ok(())
    }

    fn frame_size(&self, _id: u32, pixel_format: u32, width: u32, height: u32) -> (u32, u32) {
        let (size, _stride, bpp) = frame_geometry(pixel_format, width, height);
        (size, bpp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;
    use std::mem::size_of;

    // The ioctl ABI encodes structure sizes, so a drifted layout turns into
    // ENOTTY at runtime. Pin the 64-bit layouts here instead.
    #[test]
    fn uapi_layouts_match_the_kernel() {
        assert_eq!(size_of::<sys::v4l2_capability>(), 104);
        assert_eq!(size_of::<sys::v4l2_pix_format>(), 48);
        assert_eq!(size_of::<sys::v4l2_format>(), 208);
        assert_eq!(size_of::<sys::v4l2_requestbuffers>(), 20);
        assert_eq!(size_of::<sys::v4l2_buffer>(), 88);

        assert_eq!(offset_of!(sys::v4l2_format, fmt), 8);
        assert_eq!(offset_of!(sys::v4l2_buffer, timestamp), 24);
        assert_eq!(offset_of!(sys::v4l2_buffer, sequence), 56);
        assert_eq!(offset_of!(sys::v4l2_buffer, m), 64);
        assert_eq!(offset_of!(sys::v4l2_buffer, length), 72);
    }

    #[test]
    fn unknown_camera_is_rejected() {
        let mut backend = V4l2Backend::new(&[]);
        assert!(matches!(
            backend.open(3),
            Err(BackendError::UnknownCamera(3))
        ));
    }
}
