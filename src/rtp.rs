//! Live-stream characteristic payloads: RTP stream configuration, endpoint
//! setup and the advertised capability blobs.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::tlv8::{self, Writer};

pub const SESSION_CONTROL_COMMAND_END: u8 = 0;
pub const SESSION_CONTROL_COMMAND_START: u8 = 1;
pub const SESSION_CONTROL_COMMAND_SUSPEND: u8 = 2;
pub const SESSION_CONTROL_COMMAND_RESUME: u8 = 3;
pub const SESSION_CONTROL_COMMAND_RECONFIGURE: u8 = 4;

pub const SESSION_STATUS_SUCCESS: u8 = 0;
pub const SESSION_STATUS_BUSY: u8 = 1;
pub const SESSION_STATUS_ERROR: u8 = 2;

pub const STREAMING_STATUS_AVAILABLE: u8 = 0;

pub const IP_ADDR_VERSION_V4: u8 = 0;
pub const IP_ADDR_VERSION_V6: u8 = 1;

pub const CRYPTO_SUITE_AES_CM_128_HMAC_SHA1_80: u8 = 0;

pub const VIDEO_CODEC_TYPE_H264: u8 = 0;

pub const VIDEO_CODEC_PROFILE_CONSTRAINED_BASELINE: u8 = 0;
pub const VIDEO_CODEC_PROFILE_MAIN: u8 = 1;
pub const VIDEO_CODEC_PROFILE_HIGH: u8 = 2;

pub const VIDEO_CODEC_LEVEL_3_1: u8 = 0;
pub const VIDEO_CODEC_LEVEL_3_2: u8 = 1;
pub const VIDEO_CODEC_LEVEL_4: u8 = 2;

pub const VIDEO_CODEC_PACKETIZATION_MODE_NON_INTERLEAVED: u8 = 0;

pub const AUDIO_CODEC_TYPE_AAC_ELD: u8 = 2;
pub const AUDIO_CODEC_TYPE_OPUS: u8 = 3;

pub const AUDIO_CODEC_BITRATE_VARIABLE: u8 = 0;
pub const AUDIO_CODEC_BITRATE_CONSTANT: u8 = 1;

pub const AUDIO_CODEC_SAMPLE_RATE_8KHZ: u8 = 0;
pub const AUDIO_CODEC_SAMPLE_RATE_16KHZ: u8 = 1;
pub const AUDIO_CODEC_SAMPLE_RATE_24KHZ: u8 = 2;

/// One side's RTP endpoint: address family, address and the two ports.
#[derive(Debug, Clone, PartialEq)]
pub struct Addr {
    pub ip_version: u8,
    pub ip_addr: String,
    pub video_rtp_port: u16,
    pub audio_rtp_port: u16,
}

impl Addr {
    fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        Ok(Self {
            ip_version: tlv8::require(&items, 1)?.u8()?,
            ip_addr: tlv8::require(&items, 2)?.string()?.to_string(),
            video_rtp_port: tlv8::require(&items, 3)?.u16()?,
            audio_rtp_port: tlv8::require(&items, 4)?.u16()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(1, self.ip_version);
        w.string(2, &self.ip_addr);
        w.u16(3, self.video_rtp_port);
        w.u16(4, self.audio_rtp_port);
        w.into_inner()
    }
}

/// SRTP key material for one media direction.
#[derive(Debug, Clone, PartialEq)]
pub struct SrtpParams {
    pub crypto_suite: u8,
    pub master_key: Vec<u8>,
    pub master_salt: Vec<u8>,
}

impl SrtpParams {
    fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        Ok(Self {
            crypto_suite: tlv8::require(&items, 1)?.u8()?,
            master_key: tlv8::require(&items, 2)?.value.clone(),
            master_salt: tlv8::require(&items, 3)?.value.clone(),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(1, self.crypto_suite);
        w.bytes(2, &self.master_key);
        w.bytes(3, &self.master_salt);
        w.into_inner()
    }

    /// Key material in the form the transcoder's `-srtp_out_params` expects.
    pub fn srtp_key(&self) -> String {
        let mut material = self.master_key.clone();
        material.extend_from_slice(&self.master_salt);
        BASE64.encode(material)
    }
}

/// Controller write on the SetupEndpoints characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupEndpoints {
    pub session_id: Vec<u8>,
    pub controller_addr: Addr,
    pub video: SrtpParams,
    pub audio: SrtpParams,
}

impl SetupEndpoints {
    pub fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        Ok(Self {
            session_id: tlv8::require(&items, 1)?.value.clone(),
            controller_addr: Addr::decode(&tlv8::require(&items, 3)?.value)?,
            video: SrtpParams::decode(&tlv8::require(&items, 4)?.value)?,
            audio: SrtpParams::decode(&tlv8::require(&items, 5)?.value)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(1, &self.session_id);
        w.bytes(3, &self.controller_addr.encode());
        w.bytes(4, &self.video.encode());
        w.bytes(5, &self.audio.encode());
        w.into_inner()
    }
}

/// Accessory response on the SetupEndpoints characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupEndpointsResponse {
    pub session_id: Vec<u8>,
    pub status: u8,
    pub accessory_addr: Addr,
    pub video: SrtpParams,
    pub audio: SrtpParams,
    pub ssrc_video: u32,
    pub ssrc_audio: u32,
}

impl SetupEndpointsResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(1, &self.session_id);
        w.u8(2, self.status);
        w.bytes(3, &self.accessory_addr.encode());
        w.bytes(4, &self.video.encode());
        w.bytes(5, &self.audio.encode());
        w.u32(6, self.ssrc_video);
        w.u32(7, self.ssrc_audio);
        w.into_inner()
    }

    #[cfg(test)]
    pub fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        Ok(Self {
            session_id: tlv8::require(&items, 1)?.value.clone(),
            status: tlv8::require(&items, 2)?.u8()?,
            accessory_addr: Addr::decode(&tlv8::require(&items, 3)?.value)?,
            video: SrtpParams::decode(&tlv8::require(&items, 4)?.value)?,
            audio: SrtpParams::decode(&tlv8::require(&items, 5)?.value)?,
            ssrc_video: tlv8::require(&items, 6)?.u32()?,
            ssrc_audio: tlv8::require(&items, 7)?.u32()?,
        })
    }
}

/// The command half of a SelectedRTPStreamConfiguration write.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCommand {
    pub identifier: Vec<u8>,
    pub command_type: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RtpParams {
    pub payload_type: u8,
    pub ssrc: u32,
    pub bitrate: u16,
    pub mtu: Option<u16>,
}

impl RtpParams {
    fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        Ok(Self {
            payload_type: tlv8::require(&items, 1)?.u8()?,
            ssrc: tlv8::require(&items, 2)?.u32()?,
            bitrate: tlv8::require(&items, 3)?.u16()?,
            mtu: match tlv8::find(&items, 5) {
                Some(item) => Some(item.u16()?),
                None => None,
            },
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(1, self.payload_type);
        w.u32(2, self.ssrc);
        w.u16(3, self.bitrate);
        if let Some(mtu) = self.mtu {
            w.u16(5, mtu);
        }
        w.into_inner()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedVideoParams {
    pub codec: u8,
    pub profile_id: u8,
    pub level: u8,
    pub width: u16,
    pub height: u16,
    pub framerate: u8,
    pub rtp: RtpParams,
}

impl SelectedVideoParams {
    fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        let codec_params = tlv8::parse(&tlv8::require(&items, 2)?.value)?;
        let attributes = tlv8::parse(&tlv8::require(&items, 3)?.value)?;
        Ok(Self {
            codec: tlv8::require(&items, 1)?.u8()?,
            profile_id: tlv8::require(&codec_params, 1)?.u8()?,
            level: tlv8::require(&codec_params, 2)?.u8()?,
            width: tlv8::require(&attributes, 1)?.u16()?,
            height: tlv8::require(&attributes, 2)?.u16()?,
            framerate: tlv8::require(&attributes, 3)?.u8()?,
            rtp: RtpParams::decode(&tlv8::require(&items, 4)?.value)?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut codec_params = Writer::new();
        codec_params.u8(1, self.profile_id);
        codec_params.u8(2, self.level);
        codec_params.u8(3, VIDEO_CODEC_PACKETIZATION_MODE_NON_INTERLEAVED);

        let mut attributes = Writer::new();
        attributes.u16(1, self.width);
        attributes.u16(2, self.height);
        attributes.u8(3, self.framerate);

        let mut w = Writer::new();
        w.u8(1, self.codec);
        w.bytes(2, &codec_params.into_inner());
        w.bytes(3, &attributes.into_inner());
        w.bytes(4, &self.rtp.encode());
        w.into_inner()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedAudioParams {
    pub codec: u8,
    pub channels: u8,
    pub bitrate_mode: u8,
    pub sample_rate: u8,
    pub rtp: RtpParams,
    pub comfort_noise: bool,
}

impl SelectedAudioParams {
    fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        let codec_params = tlv8::parse(&tlv8::require(&items, 2)?.value)?;
        Ok(Self {
            codec: tlv8::require(&items, 1)?.u8()?,
            channels: tlv8::require(&codec_params, 1)?.u8()?,
            bitrate_mode: tlv8::require(&codec_params, 2)?.u8()?,
            sample_rate: tlv8::require(&codec_params, 3)?.u8()?,
            rtp: RtpParams::decode(&tlv8::require(&items, 3)?.value)?,
            comfort_noise: matches!(tlv8::find(&items, 4).map(|i| i.u8()), Some(Ok(1))),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut codec_params = Writer::new();
        codec_params.u8(1, self.channels);
        codec_params.u8(2, self.bitrate_mode);
        codec_params.u8(3, self.sample_rate);

        let mut w = Writer::new();
        w.u8(1, self.codec);
        w.bytes(2, &codec_params.into_inner());
        w.bytes(3, &self.rtp.encode());
        w.u8(4, u8::from(self.comfort_noise));
        w.into_inner()
    }
}

/// Controller write on the SelectedRTPStreamConfiguration characteristic:
/// a session command plus, for start/reconfigure, the negotiated parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfiguration {
    pub command: SessionCommand,
    pub video: Option<SelectedVideoParams>,
    pub audio: Option<SelectedAudioParams>,
}

impl StreamConfiguration {
    pub fn decode(buf: &[u8]) -> Result<Self, tlv8::Error> {
        let items = tlv8::parse(buf)?;
        let control = tlv8::parse(&tlv8::require(&items, 1)?.value)?;
        let video = match tlv8::find(&items, 2) {
            Some(item) => Some(SelectedVideoParams::decode(&item.value)?),
            None => None,
        };
        let audio = match tlv8::find(&items, 3) {
            Some(item) => Some(SelectedAudioParams::decode(&item.value)?),
            None => None,
        };
        Ok(Self {
            command: SessionCommand {
                identifier: tlv8::require(&control, 1)?.value.clone(),
                command_type: tlv8::require(&control, 2)?.u8()?,
            },
            video,
            audio,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut control = Writer::new();
        control.bytes(1, &self.command.identifier);
        control.u8(2, self.command.command_type);

        let mut w = Writer::new();
        w.bytes(1, &control.into_inner());
        if let Some(video) = &self.video {
            w.bytes(2, &video.encode());
        }
        if let Some(audio) = &self.audio {
            w.bytes(3, &audio.encode());
        }
        w.into_inner()
    }
}

/// StreamingStatus characteristic payload.
pub fn streaming_status(status: u8) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(1, status);
    w.into_inner()
}

/// SupportedRTPConfiguration characteristic payload.
pub fn rtp_configuration(crypto_suite: u8) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(2, crypto_suite);
    w.into_inner()
}

/// SupportedVideoStreamConfiguration: H.264 with every profile/level pair we
/// can map onto the transcoder, at the resolutions the encoder keeps up with.
pub fn default_video_stream_configuration() -> Vec<u8> {
    let mut codec_params = Writer::new();
    for profile in [
        VIDEO_CODEC_PROFILE_CONSTRAINED_BASELINE,
        VIDEO_CODEC_PROFILE_MAIN,
        VIDEO_CODEC_PROFILE_HIGH,
    ] {
        codec_params.u8(1, profile);
    }
    for level in [
        VIDEO_CODEC_LEVEL_3_1,
        VIDEO_CODEC_LEVEL_3_2,
        VIDEO_CODEC_LEVEL_4,
    ] {
        codec_params.u8(2, level);
    }
    codec_params.u8(3, VIDEO_CODEC_PACKETIZATION_MODE_NON_INTERLEAVED);

    let mut config = Writer::new();
    config.u8(1, VIDEO_CODEC_TYPE_H264);
    config.bytes(2, &codec_params.into_inner());
    for (i, (width, height, fps)) in [
        (1920u16, 1080u16, 30u8),
        (1280, 720, 30),
        (640, 360, 30),
        (480, 270, 30),
        (320, 180, 30),
    ]
    .iter()
    .enumerate()
    {
        if i > 0 {
            config.separator();
        }
        let mut attributes = Writer::new();
        attributes.u16(1, *width);
        attributes.u16(2, *height);
        attributes.u8(3, *fps);
        config.bytes(3, &attributes.into_inner());
    }

    let mut w = Writer::new();
    w.bytes(1, &config.into_inner());
    w.into_inner()
}

/// SupportedAudioStreamConfiguration: Opus always, AAC-ELD when the
/// transcoder build carries the encoder.
pub fn audio_stream_configuration(audio_aac: bool) -> Vec<u8> {
    let mut codecs = vec![AUDIO_CODEC_TYPE_OPUS];
    if audio_aac {
        codecs.push(AUDIO_CODEC_TYPE_AAC_ELD);
    }

    let mut w = Writer::new();
    for (i, codec) in codecs.iter().enumerate() {
        if i > 0 {
            w.separator();
        }
        let mut codec_params = Writer::new();
        codec_params.u8(1, 1); // channels
        codec_params.u8(2, AUDIO_CODEC_BITRATE_VARIABLE);
        codec_params.u8(3, AUDIO_CODEC_SAMPLE_RATE_16KHZ);

        let mut config = Writer::new();
        config.u8(1, *codec);
        config.bytes(2, &codec_params.into_inner());
        w.bytes(1, &config.into_inner());
    }
    w.u8(2, 0); // comfort noise unsupported
    w.into_inner()
}

/// Endpoint fixture shared by the session-machine tests.
#[cfg(test)]
pub fn test_endpoints(session_id: &[u8]) -> SetupEndpoints {
    SetupEndpoints {
        session_id: session_id.to_vec(),
        controller_addr: Addr {
            ip_version: IP_ADDR_VERSION_V4,
            ip_addr: "192.168.1.20".to_string(),
            video_rtp_port: 50000,
            audio_rtp_port: 50002,
        },
        video: SrtpParams {
            crypto_suite: CRYPTO_SUITE_AES_CM_128_HMAC_SHA1_80,
            master_key: vec![0x11; 16],
            master_salt: vec![0x22; 14],
        },
        audio: SrtpParams {
            crypto_suite: CRYPTO_SUITE_AES_CM_128_HMAC_SHA1_80,
            master_key: vec![0x33; 16],
            master_salt: vec![0x44; 14],
        },
    }
}
