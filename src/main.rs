//! Secluso HomeKit camera bridge.
//!
//! Copyright (C) 2024  Ardalan Amiri Sani
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful,
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU General Public License for more details.
//!
//! You should have received a copy of the GNU General Public License
//! along with this program.  If not, see <https://www.gnu.org/licenses/>.

#[macro_use]
extern crate serde_derive;

use std::process::exit;
use std::thread::sleep;
use std::time::Duration;

use docopt::Docopt;

use secluso_homekit_bridge::camera::{
    CameraBridge, EncoderProfile, InputConfiguration, ServiceConfiguration,
};

const USAGE: &str = "
Secluso HomeKit bridge: exposes a camera to HomeKit with live streaming, snapshots and secure-video recordings through an external transcoder.

Usage:
  secluso-homekit-bridge [options]
  secluso-homekit-bridge (--version | -v)
  secluso-homekit-bridge (--help | -h)

Options:
    --source=<url>             Camera source URL or device path [default: /dev/video0]
    --format=<fmt>             Container/demuxer of the source [default: v4l2]
    --audio                    Enable audio from the source
    --aac                      Offer AAC-ELD for live stream audio
    --timestamp-overlay        Overlay the wall-clock time on the video
    --encoder-profile=<name>   Encoder profile, CPU or VAAPI [default: CPU]
    --transcoder=<path>        Transcoder binary [default: ffmpeg]
    --motion                   Advertise a motion recording trigger
    --doorbell                 Advertise a doorbell recording trigger
    --version, -v              Show version
    --help, -h                 Show help
";

#[derive(Debug, Clone, Deserialize)]
struct Args {
    flag_source: String,
    flag_format: String,
    flag_audio: bool,
    flag_aac: bool,
    flag_timestamp_overlay: bool,
    flag_encoder_profile: String,
    flag_transcoder: String,
    flag_motion: bool,
    flag_doorbell: bool,
}

fn main() {
    let version = env!("CARGO_PKG_NAME").to_string() + ", version: " + env!("CARGO_PKG_VERSION");
    env_logger::init();

    let args: Args = Docopt::new(USAGE)
        .map(|d| d.help(true))
        .map(|d| d.version(Some(version)))
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let profile = match args.flag_encoder_profile.as_str() {
        "CPU" => EncoderProfile::Cpu,
        "VAAPI" => EncoderProfile::Vaapi,
        other => {
            eprintln!(
                "Unknown encoder profile {:?}. Supported profiles are CPU and VAAPI.",
                other
            );
            exit(1);
        }
    };

    let input = InputConfiguration {
        source: args.flag_source,
        format: args.flag_format,
        audio: args.flag_audio,
        audio_aac: args.flag_aac,
        timestamp_overlay: args.flag_timestamp_overlay,
        transcoder: args.flag_transcoder,
    };
    let services = ServiceConfiguration {
        motion: args.flag_motion,
        doorbell: args.flag_doorbell,
    };

    let bridge = CameraBridge::new(input, profile, services);
    bridge.start();
    println!("Camera bridge running.");

    // Pairing and characteristic routing belong to the accessory transport,
    // which calls into the bridge handlers from its own threads. Keep the
    // process alive for the mother stream.
    loop {
        sleep(Duration::from_secs(3600));
    }
}
