//! Secure-video characteristic payloads: recording configurations and the
//! data stream transport setup exchange.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use crate::tlv8::{self, Writer};

pub const VIDEO_CODEC_H264: u8 = 0;

pub const AUDIO_RECORDING_CODEC_AAC_LC: u8 = 0;
pub const AUDIO_RECORDING_CODEC_AAC_ELD: u8 = 1;

pub const AUDIO_RECORDING_SAMPLE_RATE_8KHZ: u8 = 0;
pub const AUDIO_RECORDING_SAMPLE_RATE_16KHZ: u8 = 1;
pub const AUDIO_RECORDING_SAMPLE_RATE_24KHZ: u8 = 2;
pub const AUDIO_RECORDING_SAMPLE_RATE_32KHZ: u8 = 3;
pub const AUDIO_RECORDING_SAMPLE_RATE_44KHZ: u8 = 4;
pub const AUDIO_RECORDING_SAMPLE_RATE_48KHZ: u8 = 5;

pub const SETUP_DATA_STREAM_COMMAND_START: u8 = 0;
pub const SETUP_DATA_STREAM_STATUS_SUCCESS: u8 = 0;

pub const TRANSPORT_TYPE_HOMEKIT_DATA_STREAM: u8 = 0;

pub const MEDIA_CONTAINER_TYPE_FRAGMENTED_MP4: u8 = 0;

pub const PREBUFFER_LENGTH: Duration = Duration::from_millis(4000);
pub const FRAGMENT_LENGTH: Duration = Duration::from_millis(4000);

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingConfiguration {
    pub prebuffer_length_ms: u16,
    pub event_trigger_options: u8,
    pub media_container_configurations: Vec<MediaContainerConfiguration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaContainerConfiguration {
    pub media_container_type: u8,
    pub media_container_parameters: Vec<MediaContainerParameters>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaContainerParameters {
    pub fragment_length_ms: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoConfiguration {
    pub codec: u8,
    pub video_codec_parameters: Vec<VideoCodecParameters>,
    pub video_attributes: Vec<VideoAttributes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoCodecParameters {
    pub profile_id: u8,
    pub level: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoAttributes {
    pub image_width: u16,
    pub image_height: u16,
    pub frame_rate: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfiguration {
    pub codec: u8,
    pub audio_codec_parameters: Vec<AudioCodecParameters>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioCodecParameters {
    pub channels: u8,
    pub bitrate_modes: Vec<u8>,
    pub sample_rates: Vec<u8>,
}

/// The recording parameters the controller commits before opening a
/// data-send stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedCameraRecordingConfiguration {
    pub general: RecordingConfiguration,
    pub video: VideoConfiguration,
    pub audio: AudioConfiguration,
}

impl SelectedCameraRecordingConfiguration {
    pub fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        Ok(Self {
            general: RecordingConfiguration::decode(&tlv8::require(&items, 1)?.value)?,
            video: VideoConfiguration::decode(&tlv8::require(&items, 2)?.value)?,
            audio: AudioConfiguration::decode(&tlv8::require(&items, 3)?.value)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(1, &self.general.encode());
        w.bytes(2, &self.video.encode());
        w.bytes(3, &self.audio.encode());
        w.into_inner()
    }

    /// Fragment length committed by the controller, with the standard value
    /// as a fallback for configurations that omit it.
    pub fn fragment_length_ms(&self) -> u16 {
        self.general
            .media_container_configurations
            .first()
            .and_then(|c| c.media_container_parameters.first())
            .map(|p| p.fragment_length_ms)
            .unwrap_or(FRAGMENT_LENGTH.as_millis() as u16)
    }
}

impl RecordingConfiguration {
    pub fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        let mut media_container_configurations = Vec::new();
        for item in tlv8::find_all(&items, 3) {
            media_container_configurations.push(MediaContainerConfiguration::decode(&item.value)?);
        }
        Ok(Self {
            prebuffer_length_ms: tlv8::require(&items, 1)?.u16()?,
            event_trigger_options: tlv8::require(&items, 2)?.u8()?,
            media_container_configurations,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u16(1, self.prebuffer_length_ms);
        w.u8(2, self.event_trigger_options);
        for (i, c) in self.media_container_configurations.iter().enumerate() {
            if i > 0 {
                w.separator();
            }
            w.bytes(3, &c.encode());
        }
        w.into_inner()
    }
}

impl MediaContainerConfiguration {
    fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        let mut media_container_parameters = Vec::new();
        for item in tlv8::find_all(&items, 2) {
            let inner = tlv8::parse(&item.value)?;
            media_container_parameters.push(MediaContainerParameters {
                fragment_length_ms: tlv8::require(&inner, 1)?.u16()?,
            });
        }
        Ok(Self {
            media_container_type: tlv8::require(&items, 1)?.u8()?,
            media_container_parameters,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(1, self.media_container_type);
        for (i, p) in self.media_container_parameters.iter().enumerate() {
            if i > 0 {
                w.separator();
            }
            let mut inner = Writer::new();
            inner.u16(1, p.fragment_length_ms);
            w.bytes(2, &inner.into_inner());
        }
        w.into_inner()
    }
}

impl VideoConfiguration {
    pub fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        let mut video_codec_parameters = Vec::new();
        for item in tlv8::find_all(&items, 2) {
            let inner = tlv8::parse(&item.value)?;
            video_codec_parameters.push(VideoCodecParameters {
                profile_id: tlv8::require(&inner, 1)?.u8()?,
                level: tlv8::require(&inner, 2)?.u8()?,
            });
        }
        let mut video_attributes = Vec::new();
        for item in tlv8::find_all(&items, 3) {
            let inner = tlv8::parse(&item.value)?;
            video_attributes.push(VideoAttributes {
                image_width: tlv8::require(&inner, 1)?.u16()?,
                image_height: tlv8::require(&inner, 2)?.u16()?,
                frame_rate: tlv8::require(&inner, 3)?.u16()?,
            });
        }
        Ok(Self {
            codec: tlv8::require(&items, 1)?.u8()?,
            video_codec_parameters,
            video_attributes,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(1, self.codec);
        for (i, p) in self.video_codec_parameters.iter().enumerate() {
            if i > 0 {
                w.separator();
            }
            let mut inner = Writer::new();
            inner.u8(1, p.profile_id);
            inner.u8(2, p.level);
            w.bytes(2, &inner.into_inner());
        }
        for (i, a) in self.video_attributes.iter().enumerate() {
            if i > 0 {
                w.separator();
            }
            let mut inner = Writer::new();
            inner.u16(1, a.image_width);
            inner.u16(2, a.image_height);
            inner.u16(3, a.frame_rate);
            w.bytes(3, &inner.into_inner());
        }
        w.into_inner()
    }
}

impl AudioConfiguration {
    pub fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        let mut audio_codec_parameters = Vec::new();
        for item in tlv8::find_all(&items, 2) {
            let inner = tlv8::parse(&item.value)?;
            let mut bitrate_modes = Vec::new();
            for mode in tlv8::find_all(&inner, 2) {
                bitrate_modes.extend_from_slice(&mode.value);
            }
            let mut sample_rates = Vec::new();
            for rate in tlv8::find_all(&inner, 3) {
                sample_rates.extend_from_slice(&rate.value);
            }
            audio_codec_parameters.push(AudioCodecParameters {
                channels: tlv8::require(&inner, 1)?.u8()?,
                bitrate_modes,
                sample_rates,
            });
        }
        Ok(Self {
            codec: tlv8::require(&items, 1)?.u8()?,
            audio_codec_parameters,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(1, self.codec);
        for (i, p) in self.audio_codec_parameters.iter().enumerate() {
            if i > 0 {
                w.separator();
            }
            let mut inner = Writer::new();
            inner.u8(1, p.channels);
            for mode in &p.bitrate_modes {
                inner.u8(2, *mode);
            }
            inner.bytes(3, &p.sample_rates);
            w.bytes(2, &inner.into_inner());
        }
        w.into_inner()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupportedVideoRecordingConfiguration {
    pub codec_configuration: Vec<VideoConfiguration>,
}

impl SupportedVideoRecordingConfiguration {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        for (i, c) in self.codec_configuration.iter().enumerate() {
            if i > 0 {
                w.separator();
            }
            w.bytes(1, &c.encode());
        }
        w.into_inner()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupportedAudioRecordingConfiguration {
    pub codec_configuration: Vec<AudioConfiguration>,
}

impl SupportedAudioRecordingConfiguration {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        for (i, c) in self.codec_configuration.iter().enumerate() {
            if i > 0 {
                w.separator();
            }
            w.bytes(1, &c.encode());
        }
        w.into_inner()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupportedDataStreamTransportConfiguration {
    pub transport_types: Vec<u8>,
}

impl SupportedDataStreamTransportConfiguration {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        for (i, t) in self.transport_types.iter().enumerate() {
            if i > 0 {
                w.separator();
            }
            let mut inner = Writer::new();
            inner.u8(1, *t);
            w.bytes(1, &inner.into_inner());
        }
        w.into_inner()
    }
}

/// Controller write on the transport setup characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupDataStreamSessionRequest {
    pub command: u8,
    pub transport_type: u8,
    pub controller_key_salt: Vec<u8>,
}

impl SetupDataStreamSessionRequest {
    pub fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        Ok(Self {
            command: tlv8::require(&items, 1)?.u8()?,
            transport_type: tlv8::require(&items, 2)?.u8()?,
            controller_key_salt: tlv8::require(&items, 3)?.value.clone(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(1, self.command);
        w.u8(2, self.transport_type);
        w.bytes(3, &self.controller_key_salt);
        w.into_inner()
    }
}

/// Accessory response: the ephemeral data stream port and our key salt.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupDataStreamSessionResponse {
    pub status: u8,
    pub port: u16,
    pub accessory_key_salt: Vec<u8>,
}

impl SetupDataStreamSessionResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut session_params = Writer::new();
        session_params.u16(1, self.port);

        let mut w = Writer::new();
        w.u8(1, self.status);
        w.bytes(2, &session_params.into_inner());
        w.bytes(3, &self.accessory_key_salt);
        w.into_inner()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        let session_params = tlv8::parse(&tlv8::require(&items, 2)?.value)?;
        Ok(Self {
            status: tlv8::require(&items, 1)?.u8()?,
            port: tlv8::require(&session_params, 1)?.u16()?,
            accessory_key_salt: tlv8::require(&items, 3)?.value.clone(),
        })
    }
}

/// A selection matching what the bridge advertises, used as a test fixture.
#[cfg(test)]
pub fn standard_selection() -> SelectedCameraRecordingConfiguration {
    SelectedCameraRecordingConfiguration {
        general: RecordingConfiguration {
            prebuffer_length_ms: PREBUFFER_LENGTH.as_millis() as u16,
            event_trigger_options: 0x01,
            media_container_configurations: vec![MediaContainerConfiguration {
                media_container_type: MEDIA_CONTAINER_TYPE_FRAGMENTED_MP4,
                media_container_parameters: vec![MediaContainerParameters {
                    fragment_length_ms: FRAGMENT_LENGTH.as_millis() as u16,
                }],
            }],
        },
        video: VideoConfiguration {
            codec: VIDEO_CODEC_H264,
            video_codec_parameters: vec![VideoCodecParameters {
                profile_id: crate::rtp::VIDEO_CODEC_PROFILE_MAIN,
                level: crate::rtp::VIDEO_CODEC_LEVEL_3_1,
            }],
            video_attributes: vec![VideoAttributes {
                image_width: 1280,
                image_height: 720,
                frame_rate: 30,
            }],
        },
        audio: AudioConfiguration {
            codec: AUDIO_RECORDING_CODEC_AAC_LC,
            audio_codec_parameters: vec![AudioCodecParameters {
                channels: 1,
                bitrate_modes: vec![crate::rtp::AUDIO_CODEC_BITRATE_CONSTANT],
                sample_rates: vec![AUDIO_RECORDING_SAMPLE_RATE_32KHZ],
            }],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_round_trips() {
        let selection = standard_selection();
        let encoded = selection.encode();
        assert_eq!(
            SelectedCameraRecordingConfiguration::decode(&encoded).unwrap(),
            selection
        );
        assert_eq!(selection.fragment_length_ms(), 4000);
    }

    #[test]
    fn setup_request_round_trips() {
        let req = SetupDataStreamSessionRequest {
            command: SETUP_DATA_STREAM_COMMAND_START,
            transport_type: TRANSPORT_TYPE_HOMEKIT_DATA_STREAM,
            controller_key_salt: vec![0xA1; 32],
        };
        assert_eq!(
            SetupDataStreamSessionRequest::decode(&req.encode()).unwrap(),
            req
        );
    }

    #[test]
    fn setup_response_carries_port_and_salt() {
        let resp = SetupDataStreamSessionResponse {
            status: SETUP_DATA_STREAM_STATUS_SUCCESS,
            port: 41234,
            accessory_key_salt: vec![0xB2; 32],
        };
        let decoded = SetupDataStreamSessionResponse::decode(&resp.encode()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn configuration_lists_survive_separators() {
        let video = VideoConfiguration {
            codec: VIDEO_CODEC_H264,
            video_codec_parameters: vec![
                VideoCodecParameters {
                    profile_id: 0,
                    level: 0,
                },
                VideoCodecParameters {
                    profile_id: 1,
                    level: 0,
                },
                VideoCodecParameters {
                    profile_id: 2,
                    level: 0,
                },
            ],
            video_attributes: vec![
                VideoAttributes {
                    image_width: 1280,
                    image_height: 720,
                    frame_rate: 30,
                },
                VideoAttributes {
                    image_width: 1920,
                    image_height: 1080,
                    frame_rate: 30,
                },
            ],
        };
        assert_eq!(VideoConfiguration::decode(&video.encode()).unwrap(), video);
    }
}
