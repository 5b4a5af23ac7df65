// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scenario file loading.
//!
//! The daemon is configured by a single JSON document, `virtual_camera.json`
//! in the working directory. It names the control endpoint, the physical
//! capture devices, and one camera list per virtual machine.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use log::warn;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::fourcc;

/// Listen address used when the scenario file does not name one.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
/// Control port used when neither the scenario file nor the command line
/// names one.
pub const DEFAULT_PORT: u16 = 8000;
/// Scenario file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "virtual_camera.json";

/// Capture buffers allocated per physical camera.
pub const BUFFER_COUNT: usize = 6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("duplicate physical camera id {0}")]
    DuplicateCamera(u32),
    #[error("{vm} camera {logical} references unknown physical camera {physical}")]
    UnknownPhysicalCamera { vm: String, logical: u32, physical: u32 },
    #[error("physical camera {id} has a zero-sized frame ({width}x{height})")]
    BadGeometry { id: u32, width: u32, height: u32 },
}

/// Which capture interface drives a physical camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    V4l2,
    Hal,
}

/// One physical capture device from the `phy_camera` array.
#[derive(Debug, Clone)]
pub struct PhysicalCamera {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub kind: BackendKind,
    pub sensor_name: String,
    pub devnode: String,
    /// Shared object implementing the vendor HAL, when `kind` is `Hal`.
    pub native_driver: String,
    /// Cameras sharing a deserializer are driven by one capture thread.
    pub deserializer: u32,
}

/// One logical camera exposed to a virtual machine.
#[derive(Debug, Clone)]
pub struct VirtualCamera {
    pub logical_id: u32,
    pub physical_id: u32,
    pub shared: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub cameras: Vec<PhysicalCamera>,
    pub vms: BTreeMap<String, Vec<VirtualCamera>>,
}

#[derive(Deserialize)]
struct RawConfig {
    camera_manager: Option<RawManager>,
    #[serde(default)]
    phy_camera: Vec<RawPhysicalCamera>,
    #[serde(flatten)]
    vms: BTreeMap<String, Vec<RawVmEntry>>,
}

#[derive(Deserialize)]
struct RawManager {
    address: Option<String>,
    port: Option<u16>,
}

#[derive(Deserialize)]
struct RawPhysicalCamera {
    id: u32,
    width: u32,
    height: u32,
    format: Option<String>,
    driver_type: Option<String>,
    sensor_name: Option<String>,
    devnode: Option<String>,
    native_driver: Option<String>,
    deserializer: Option<u32>,
}

#[derive(Deserialize)]
struct RawVmEntry {
    camera: RawVirtualCamera,
}

#[derive(Deserialize)]
struct RawVirtualCamera {
    id: u32,
    phy_id: u32,
    #[serde(default)]
    share: Vec<String>,
}

/// Resolves a pixel format name to its fourcc code. Both the bare fourcc
/// ("YUYV") and the kernel constant name ("V4L2_PIX_FMT_YUYV") are accepted;
/// unknown names fall back to YUYV.
pub fn parse_pixel_format(name: &str) -> u32 {
    match name {
        "YUYV" | "V4L2_PIX_FMT_YUYV" => fourcc::YUYV,
        "UYVY" | "V4L2_PIX_FMT_UYVY" => fourcc::UYVY,
        "NV12" | "V4L2_PIX_FMT_NV12" => fourcc::NV12,
        "NV21" | "V4L2_PIX_FMT_NV21" => fourcc::NV21,
        other => {
            warn!("Unknown pixel format {:?}, using YUYV", other);
            fourcc::YUYV
        }
    }
}

fn parse_driver_type(name: &str) -> BackendKind {
    match name {
        "V4L2_INTERFACE" => BackendKind::V4l2,
        "HAL_INTERFACE" => BackendKind::Hal,
        other => {
            warn!("Unknown driver type {:?}, using V4L2", other);
            BackendKind::V4l2
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Config::from_str(&contents, &path.display().to_string())
    }

    pub fn from_str(contents: &str, origin: &str) -> Result<Config, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
                path: origin.to_string(),
                source,
            })?;

        let mut cameras = Vec::new();
        for phy in &raw.phy_camera {
            if cameras.iter().any(|c: &PhysicalCamera| c.id == phy.id) {
                return Err(ConfigError::DuplicateCamera(phy.id));
            }
            if phy.width == 0 || phy.height == 0 {
                return Err(ConfigError::BadGeometry {
                    id: phy.id,
                    width: phy.width,
                    height: phy.height,
                });
            }
            cameras.push(PhysicalCamera {
                id: phy.id,
                width: phy.width,
                height: phy.height,
                pixel_format: parse_pixel_format(phy.format.as_deref().unwrap_or("YUYV")),
                kind: parse_driver_type(phy.driver_type.as_deref().unwrap_or("V4L2_INTERFACE")),
                sensor_name: phy.sensor_name.clone().unwrap_or_default(),
                devnode: phy
                    .devnode
                    .clone()
                    .unwrap_or_else(|| format!("/dev/video{}", phy.id)),
                native_driver: phy.native_driver.clone().unwrap_or_default(),
                // Each camera is its own deserializer unless the scenario
                // groups it explicitly.
                deserializer: phy.deserializer.unwrap_or(phy.id),
            });
        }

        let mut vms = BTreeMap::new();
        for (vm, entries) in &raw.vms {
            let mut list = Vec::new();
            for entry in entries {
                if !cameras.iter().any(|c| c.id == entry.camera.phy_id) {
                    return Err(ConfigError::UnknownPhysicalCamera {
                        vm: vm.clone(),
                        logical: entry.camera.id,
                        physical: entry.camera.phy_id,
                    });
                }
                list.push(VirtualCamera {
                    logical_id: entry.camera.id,
                    physical_id: entry.camera.phy_id,
                    shared: !entry.camera.share.is_empty(),
                });
            }
            vms.insert(vm.clone(), list);
        }

        let (address, port) = match raw.camera_manager {
            Some(manager) => (
                manager
                    .address
                    .filter(|a| !a.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
                manager.port.filter(|p| *p != 0).unwrap_or(DEFAULT_PORT),
            ),
            None => (DEFAULT_ADDRESS.to_string(), DEFAULT_PORT),
        };

        Ok(Config {
            address,
            port,
            cameras,
            vms,
        })
    }

    pub fn camera(&self, id: u32) -> Option<&PhysicalCamera> {
        self.cameras.iter().find(|c| c.id == id)
    }

    /// The logical cameras visible to a virtual machine, or an empty slice
    /// for a VM the scenario does not know.
    pub fn vm_cameras(&self, vm: &str) -> &[VirtualCamera] {
        self.vms.get(vm).map(|v| v.as_slice()).unwrap_or(&[])
    }
}
