//! The camera façade: input configuration, the characteristic payloads the
//! accessory framework serves, the snapshot path and the wiring between the
//! mother stream and the session machines.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::process::{Child, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error as ThisError;

use crate::datastream::{DataStreamManagement, SharedSelection};
use crate::ffmpeg;
use crate::hsv::{self, SelectedCameraRecordingConfiguration};
use crate::mother_stream::{self, FragmentCache};
use crate::mp4::Chunk;
use crate::rtp;
use crate::stream::StreamManagement;

/// Which transcoder video encoder to drive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncoderProfile {
    Cpu,
    Vaapi,
}

/// Recording triggers the accessory exposes next to the camera.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceConfiguration {
    pub motion: bool,
    pub doorbell: bool,
}

/// The camera source, immutable once the process is up.
#[derive(Debug, Clone)]
pub struct InputConfiguration {
    pub source: String,
    pub format: String,
    pub audio: bool,
    pub audio_aac: bool,
    pub timestamp_overlay: bool,
    /// Transcoder binary, overridable for odd installs.
    pub transcoder: String,
}

#[derive(Debug, ThisError)]
pub enum SnapshotError {
    #[error("snapshot unavailable before the mother stream has produced data")]
    Unavailable,
    #[error("snapshot transcoder failed: {0}")]
    Transcoder(#[from] io::Error),
    #[error("decoding the snapshot image: {0}")]
    Decode(#[from] image::ImageError),
}

/// One camera per process: owns the fragment cache, the committed recording
/// selection and both session machines. The accessory framework calls into
/// the handlers; everything else runs on background threads.
pub struct CameraBridge {
    input: InputConfiguration,
    profile: EncoderProfile,
    services: ServiceConfiguration,
    cache: Arc<FragmentCache>,
    selection: SharedSelection,
    stream_management: StreamManagement,
    data_stream: DataStreamManagement,
}

impl CameraBridge {
    pub fn new(
        input: InputConfiguration,
        profile: EncoderProfile,
        services: ServiceConfiguration,
    ) -> Self {
        let cache = Arc::new(FragmentCache::new());
        let selection: SharedSelection = Arc::new(Mutex::new(None));

        Self {
            stream_management: StreamManagement::new(input.clone(), profile),
            data_stream: DataStreamManagement::new(
                input.clone(),
                profile,
                Arc::clone(&cache),
                Arc::clone(&selection),
            ),
            input,
            profile,
            services,
            cache,
            selection,
        }
    }

    /// Starts the mother stream; it respawns itself for the life of the
    /// process.
    pub fn start(&self) {
        mother_stream::spawn(self.input.clone(), self.profile, Arc::clone(&self.cache));
    }

    /// Synthesizes a still image from the init chunks and the current
    /// pre-buffer. Height follows the aspect ratio, rounded to even.
    pub fn snapshot(&self, width: u32) -> Result<image::DynamicImage, SnapshotError> {
        let init = self.cache.init_chunks().ok_or(SnapshotError::Unavailable)?;
        let prebuffer = self.cache.prebuffer_snapshot();

        let args = ffmpeg::snapshot_arguments(width);
        let mut child = ffmpeg::spawn(
            &self.input.transcoder,
            &args,
            Stdio::piped(),
            Stdio::piped(),
        )?;

        let stdout_data = match pipe_snapshot(&mut child, &init, &prebuffer) {
            Ok(data) => data,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        // FIXME: bound this wait; a wedged transcoder blocks the snapshot
        // request indefinitely.
        let status = child.wait()?;
        if !status.success() {
            debug!("snapshot transcoder exited with {}", status);
        }

        Ok(image::load_from_memory(&stdout_data)?)
    }

    /// SelectedCameraRecordingConfiguration write: commit the controller's
    /// selection for later data stream opens.
    pub fn handle_selected_recording_configuration(&self, value: &[u8]) -> Result<()> {
        let selection = SelectedCameraRecordingConfiguration::decode(value)
            .context("decoding the selected recording configuration")?;
        info!(
            "recording selection committed: {}x{} profile {} fragment {}ms",
            selection
                .video
                .video_attributes
                .first()
                .map(|a| a.image_width)
                .unwrap_or(0),
            selection
                .video
                .video_attributes
                .first()
                .map(|a| a.image_height)
                .unwrap_or(0),
            selection
                .video
                .video_codec_parameters
                .first()
                .map(|p| p.profile_id)
                .unwrap_or(0),
            selection.fragment_length_ms(),
        );
        *self.selection.lock().unwrap() = Some(selection);
        Ok(())
    }

    /// SetupDataStreamTransport write (base64 TLV8 in, base64 TLV8 out).
    /// `shared_key` is the writing controller's pair-verify shared key.
    pub fn setup_data_stream_transport(
        &self,
        value: &str,
        shared_key: &[u8; 32],
    ) -> Result<String> {
        let raw = BASE64
            .decode(value.trim())
            .context("decoding the transport setup write")?;
        let response = self
            .data_stream
            .handle_setup_transport_write(&raw, shared_key)?;
        Ok(BASE64.encode(response))
    }

    /// SetupEndpoints write; `local_ip` is our side of the accessory
    /// connection the write arrived on.
    pub fn handle_setup_endpoints(&self, value: &[u8], local_ip: IpAddr) -> Result<Vec<u8>> {
        self.stream_management.handle_setup_endpoints(value, local_ip)
    }

    /// SelectedRTPStreamConfiguration write.
    pub fn handle_selected_stream_configuration(&self, value: &[u8]) -> Result<()> {
        self.stream_management.handle_selected_configuration(value)
    }

    pub fn streaming_status(&self) -> Vec<u8> {
        rtp::streaming_status(rtp::STREAMING_STATUS_AVAILABLE)
    }

    pub fn supported_video_stream_configuration(&self) -> Vec<u8> {
        rtp::default_video_stream_configuration()
    }

    pub fn supported_audio_stream_configuration(&self) -> Vec<u8> {
        rtp::audio_stream_configuration(self.input.audio_aac)
    }

    pub fn supported_rtp_configuration(&self) -> Vec<u8> {
        rtp::rtp_configuration(rtp::CRYPTO_SUITE_AES_CM_128_HMAC_SHA1_80)
    }

    pub fn supported_video_recording_configuration(&self) -> Vec<u8> {
        hsv::SupportedVideoRecordingConfiguration {
            codec_configuration: vec![hsv::VideoConfiguration {
                codec: hsv::VIDEO_CODEC_H264,
                video_codec_parameters: vec![
                    hsv::VideoCodecParameters {
                        profile_id: rtp::VIDEO_CODEC_PROFILE_CONSTRAINED_BASELINE,
                        level: rtp::VIDEO_CODEC_LEVEL_3_1,
                    },
                    hsv::VideoCodecParameters {
                        profile_id: rtp::VIDEO_CODEC_PROFILE_MAIN,
                        level: rtp::VIDEO_CODEC_LEVEL_3_1,
                    },
                    hsv::VideoCodecParameters {
                        profile_id: rtp::VIDEO_CODEC_PROFILE_HIGH,
                        level: rtp::VIDEO_CODEC_LEVEL_3_1,
                    },
                ],
                video_attributes: vec![
                    hsv::VideoAttributes {
                        image_width: 1280,
                        image_height: 720,
                        frame_rate: 30,
                    },
                    hsv::VideoAttributes {
                        image_width: 1920,
                        image_height: 1080,
                        frame_rate: 30,
                    },
                ],
            }],
        }
        .encode()
    }

    pub fn supported_audio_recording_configuration(&self) -> Vec<u8> {
        hsv::SupportedAudioRecordingConfiguration {
            codec_configuration: vec![hsv::AudioConfiguration {
                codec: hsv::AUDIO_RECORDING_CODEC_AAC_LC,
                audio_codec_parameters: vec![hsv::AudioCodecParameters {
                    channels: 1,
                    bitrate_modes: vec![rtp::AUDIO_CODEC_BITRATE_CONSTANT],
                    // 32 kHz is what gets incoming data stream requests going.
                    sample_rates: vec![hsv::AUDIO_RECORDING_SAMPLE_RATE_32KHZ],
                }],
            }],
        }
        .encode()
    }

    pub fn supported_recording_configuration(&self) -> Vec<u8> {
        hsv::RecordingConfiguration {
            prebuffer_length_ms: hsv::PREBUFFER_LENGTH.as_millis() as u16,
            event_trigger_options: event_trigger_bitmask(
                self.services.motion,
                self.services.doorbell,
            ),
            media_container_configurations: vec![hsv::MediaContainerConfiguration {
                media_container_type: hsv::MEDIA_CONTAINER_TYPE_FRAGMENTED_MP4,
                media_container_parameters: vec![hsv::MediaContainerParameters {
                    fragment_length_ms: hsv::FRAGMENT_LENGTH.as_millis() as u16,
                }],
            }],
        }
        .encode()
    }

    pub fn supported_data_stream_transport_configuration(&self) -> Vec<u8> {
        hsv::SupportedDataStreamTransportConfiguration {
            transport_types: vec![hsv::TRANSPORT_TYPE_HOMEKIT_DATA_STREAM],
        }
        .encode()
    }
}

/// Writes the cached MP4 past into the snapshot transcoder while a thread
/// drains its output, then hands the collected image data back.
fn pipe_snapshot(child: &mut Child, init: &[Chunk], prebuffer: &[Chunk]) -> io::Result<Vec<u8>> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("snapshot transcoder has no stdin"))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("snapshot transcoder has no stdout"))?;

    let reader = thread::spawn(move || {
        let mut data = Vec::new();
        stdout.read_to_end(&mut data).map(|_| data)
    });

    for chunk in init.iter().chain(prebuffer.iter()) {
        // The transcoder may stop reading once it has its frame.
        if stdin.write_all(&chunk.assemble()).is_err() {
            break;
        }
    }
    drop(stdin);

    reader
        .join()
        .map_err(|_| io::Error::other("snapshot reader thread panicked"))?
}

/// Which events may trigger a recording: motion is bit 0, doorbell bit 1.
fn event_trigger_bitmask(motion: bool, doorbell: bool) -> u8 {
    let mut bits = 0;
    if motion {
        bits |= 0x01;
    }
    if doorbell {
        bits |= 0x02;
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsv::SetupDataStreamSessionResponse;

    fn bridge() -> CameraBridge {
        CameraBridge::new(
            InputConfiguration {
                source: "/dev/video0".to_string(),
                format: "v4l2".to_string(),
                audio: true,
                audio_aac: false,
                timestamp_overlay: false,
                transcoder: "ffmpeg".to_string(),
            },
            EncoderProfile::Cpu,
            ServiceConfiguration {
                motion: true,
                doorbell: false,
            },
        )
    }

    #[test]
    fn event_trigger_bitmask_is_a_bitwise_or() {
        assert_eq!(event_trigger_bitmask(false, false), 0x00);
        assert_eq!(event_trigger_bitmask(true, false), 0x01);
        assert_eq!(event_trigger_bitmask(false, true), 0x02);
        assert_eq!(event_trigger_bitmask(true, true), 0x03);
    }

    #[test]
    fn snapshot_is_unavailable_before_the_mother_stream() {
        let bridge = bridge();
        assert!(matches!(
            bridge.snapshot(640),
            Err(SnapshotError::Unavailable)
        ));
    }

    #[test]
    fn selection_write_commits_the_configuration() {
        let bridge = bridge();
        assert!(bridge.selection.lock().unwrap().is_none());

        let selection = hsv::standard_selection();
        bridge
            .handle_selected_recording_configuration(&selection.encode())
            .unwrap();
        assert_eq!(*bridge.selection.lock().unwrap(), Some(selection));
    }

    #[test]
    fn malformed_selection_write_is_an_error() {
        let bridge = bridge();
        assert!(bridge
            .handle_selected_recording_configuration(&[0x01])
            .is_err());
        assert!(bridge.selection.lock().unwrap().is_none());
    }

    #[test]
    fn transport_setup_answers_with_port_and_salt() {
        let bridge = bridge();
        let request = hsv::SetupDataStreamSessionRequest {
            command: hsv::SETUP_DATA_STREAM_COMMAND_START,
            transport_type: hsv::TRANSPORT_TYPE_HOMEKIT_DATA_STREAM,
            controller_key_salt: vec![0xA1; 32],
        };
        let value = BASE64.encode(request.encode());

        let response_b64 = bridge
            .setup_data_stream_transport(&value, &[0xC3; 32])
            .unwrap();
        let response =
            SetupDataStreamSessionResponse::decode(&BASE64.decode(response_b64).unwrap()).unwrap();

        assert_eq!(response.status, hsv::SETUP_DATA_STREAM_STATUS_SUCCESS);
        assert_ne!(response.port, 0);
        assert_eq!(response.accessory_key_salt.len(), 32);
    }

    #[test]
    fn capability_blobs_decode_as_advertised() {
        let bridge = bridge();

        let video = crate::tlv8::parse(&bridge.supported_video_recording_configuration()).unwrap();
        let config = hsv::VideoConfiguration::decode(&crate::tlv8::require(&video, 1).unwrap().value)
            .unwrap();
        assert_eq!(config.codec, hsv::VIDEO_CODEC_H264);
        assert_eq!(config.video_codec_parameters.len(), 3);
        assert_eq!(config.video_attributes.len(), 2);

        let general =
            hsv::RecordingConfiguration::decode(&bridge.supported_recording_configuration())
                .unwrap();
        assert_eq!(general.prebuffer_length_ms, 4000);
        assert_eq!(general.event_trigger_options, 0x01);
        assert_eq!(
            general.media_container_configurations[0].media_container_parameters[0]
                .fragment_length_ms,
            4000
        );
    }
}
