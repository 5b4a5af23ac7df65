// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Camera broker daemon.
//!
//! Multiplexes a handful of physical capture devices (V4L2 nodes or a
//! vendor HAL) to many virtual-machine camera clients. Each client talks a
//! small fixed-record protocol over TCP; frames travel through a named
//! shared-memory object per device, so the broker never copies pixel data.
//! A per-buffer reference count returns each capture buffer to the hardware
//! only after every subscribed client has released it.

pub mod backend;
pub mod broker;
pub mod camera;
pub mod config;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod worker;

pub use broker::Broker;
pub use broker::BrokerHandle;
pub use config::Config;
