// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control-channel wire records.
//!
//! Clients and the daemon exchange a single fixed-size record type over the
//! control socket. The layout is identical on both sides and never changes
//! across restarts; frames themselves travel through shared memory, so the
//! only payload here is a buffer slot index.

use std::io;
use std::io::Read;
use std::io::Write;

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Size in bytes of every record on the control socket.
pub const RECORD_SIZE: usize = 80;

/// Client request tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    GetFormat = 1,
    SetFormat = 2,
    TryFormat = 3,
    EnumFormat = 4,
    EnumSize = 5,
    CreateBuffer = 6,
    DelBuffer = 7,
    QBuf = 8,
    StreamOn = 9,
    StreamOff = 10,
    Open = 11,
    Close = 12,
    /// Daemon to client only: a frame is ready in the named buffer slot.
    DQBuf = 13,
}

impl TryFrom<u32> for RequestKind {
    type Error = u32;

    fn try_from(value: u32) -> Result<RequestKind, u32> {
        use RequestKind::*;
        Ok(match value {
            1 => GetFormat,
            2 => SetFormat,
            3 => TryFormat,
            4 => EnumFormat,
            5 => EnumSize,
            6 => CreateBuffer,
            7 => DelBuffer,
            8 => QBuf,
            9 => StreamOn,
            10 => StreamOff,
            11 => Open,
            12 => Close,
            13 => DQBuf,
            other => return Err(other),
        })
    }
}

/// Result codes carried in the `kind` field of a response record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseCode {
    Ok = 0x100,
    Unspec = 0x200,
    Busy = 0x201,
    OutOfMemory = 0x202,
    Invalid = 0x203,
}

/// Frame geometry block shared by format negotiation requests. The min/max
/// fields double as the plain width/height for non-enumeration requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FormatSize {
    pub width: u32,
    pub max_width: u32,
    pub step_width: u32,
    pub height: u32,
    pub max_height: u32,
    pub step_height: u32,
    pub stride: u32,
    pub sizeimage: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct PictureFormat {
    pub pixel_format: u32,
    pub size: FormatSize,
}

/// Reference to one slot of a device's shared-memory pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BufferRef {
    pub segment: u32,
    pub index: i32,
}

/// The one record type exchanged on the control socket.
///
/// `camera_id` always carries the client's logical camera id; the daemon
/// translates to a physical device internally.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ControlRecord {
    pub index: i32,
    pub camera_id: i32,
    pub kind: u32,
    pub format: PictureFormat,
    pub buffer: BufferRef,
    pub reserve: [u8; 24],
}

impl Default for ControlRecord {
    fn default() -> ControlRecord {
        ControlRecord {
            index: 0,
            camera_id: 0,
            kind: 0,
            format: PictureFormat::default(),
            buffer: BufferRef::default(),
            reserve: [0; 24],
        }
    }
}

impl ControlRecord {
    pub fn request_kind(&self) -> Result<RequestKind, u32> {
        RequestKind::try_from(self.kind)
    }

    /// Builds the response to `self`, echoing the correlation fields.
    pub fn response(&self, code: ResponseCode) -> ControlRecord {
        ControlRecord {
            index: self.index,
            camera_id: self.camera_id,
            kind: code as u32,
            format: PictureFormat::default(),
            buffer: self.buffer,
            reserve: [0; 24],
        }
    }

    /// Builds an unsolicited frame-ready record for a logical camera.
    pub fn frame_ready(logical_id: i32, slot: usize) -> ControlRecord {
        ControlRecord {
            index: 0,
            camera_id: logical_id,
            kind: RequestKind::DQBuf as u32,
            format: PictureFormat::default(),
            buffer: BufferRef {
                segment: 0,
                index: slot as i32,
            },
            reserve: [0; 24],
        }
    }

    /// Reads one record. Returns `None` on a clean end of stream, an error
    /// if the peer vanishes mid-record.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Option<ControlRecord>> {
        let mut buf = [0u8; RECORD_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-record",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let record = ControlRecord::read_from_bytes(&buf[..])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short control record"))?;
        Ok(Some(record))
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.as_bytes())
    }
}
