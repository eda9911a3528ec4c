//! Secluso HomeKit camera bridge.
//!
//! Exposes one camera to a HomeKit controller: on-demand SRTP live streams,
//! still snapshots and secure-video recordings delivered as fragmented MP4
//! over the encrypted data stream protocol. The accessory framework
//! (pairing, service registry, characteristic routing) lives outside this
//! crate and calls into [`camera::CameraBridge`]; media goes through an
//! external transcoder reached over pipes.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

#[macro_use]
extern crate log;

pub mod camera;
pub mod datastream;
pub mod ffmpeg;
pub mod hds;
pub mod hsv;
pub mod mother_stream;
pub mod mp4;
pub mod rtp;
pub mod stream;
pub mod tlv8;
