//! Transcoder argument builders and child-process plumbing. The builders are
//! pure functions from the negotiated parameters to an argument vector; the
//! transcoder itself is a black box reached through pipes.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::io;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use url::Url;

use crate::camera::{EncoderProfile, InputConfiguration};
use crate::hsv::{self, SelectedCameraRecordingConfiguration};
use crate::rtp::{self, Addr, SelectedAudioParams, SelectedVideoParams, SetupEndpoints};

pub const PROTOCOL_WHITELIST: &str = "file,udp,tcp,rtp,http,pipe";

/// MP4 fragment duration the transcoder is asked for on every fragmented
/// output, and therefore the granularity of the pre-buffer.
pub const FRAGMENT_DURATION: Duration = Duration::from_millis(100);

const FRAGMENT_DURATION_ARG: &str = "100000"; // microseconds

const DRAWTEXT_FILTER: &str = "drawtext=text='time\\: %{localtime}':fontcolor=white";

fn arg_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn encoder_name(profile: EncoderProfile) -> &'static str {
    match profile {
        EncoderProfile::Cpu => "h264",
        EncoderProfile::Vaapi => "h264_vaapi",
    }
}

fn hwaccel_input_args(profile: EncoderProfile) -> Vec<String> {
    match profile {
        EncoderProfile::Cpu => Vec::new(),
        EncoderProfile::Vaapi => arg_strings(&[
            "-vaapi_device",
            "/dev/dri/renderD128",
            "-hwaccel",
            "vaapi",
        ]),
    }
}

fn encoder_scale_args(profile: EncoderProfile, width: u16) -> Vec<String> {
    match profile {
        EncoderProfile::Cpu => vec![
            "-x264-params".to_string(),
            "intra-refresh=1:bframes=0".to_string(),
            "-vf".to_string(),
            format!("scale={}:-1", width),
            "-preset".to_string(),
            "veryfast".to_string(),
        ],
        EncoderProfile::Vaapi => vec![
            "-vf".to_string(),
            format!("format=nv12|vaapi,hwupload,scale_vaapi=w={}:h=-1", width),
            "-bf".to_string(),
            "0".to_string(),
        ],
    }
}

/// Input options for the configured camera source. RTSP sources are pinned
/// to TCP transport so packet loss does not corrupt the mother stream.
fn source_input_args(input: &InputConfiguration) -> Vec<String> {
    let mut args = Vec::new();
    let is_rtsp = Url::parse(&input.source)
        .map(|u| u.scheme() == "rtsp")
        .unwrap_or(false);
    if is_rtsp {
        args.extend(arg_strings(&["-rtsp_transport", "tcp"]));
    }
    args.extend(vec![
        "-f".to_string(),
        input.format.clone(),
        "-protocol_whitelist".to_string(),
        PROTOCOL_WHITELIST.to_string(),
        "-ss".to_string(),
        "00:00:01.000".to_string(),
        "-i".to_string(),
        input.source.clone(),
    ]);
    args
}

fn fragmented_mp4_output_args() -> Vec<String> {
    arg_strings(&[
        "-f",
        "mp4",
        "-movflags",
        "frag_keyframe+empty_moov+default_base_moof",
        "-frag_duration",
        FRAGMENT_DURATION_ARG,
        "pipe:1",
    ])
}

/// The always-on transcoder feeding the fragment cache: native resolution,
/// keyframes pinned to the recording fragment boundary.
pub fn mother_stream_arguments(
    input: &InputConfiguration,
    profile: EncoderProfile,
) -> Vec<String> {
    let mut args = hwaccel_input_args(profile);
    args.extend(source_input_args(input));
    args.extend(vec!["-c:v".to_string(), encoder_name(profile).to_string()]);
    match profile {
        EncoderProfile::Cpu => args.extend(arg_strings(&[
            "-x264-params",
            "intra-refresh=1:bframes=0",
            "-preset",
            "veryfast",
        ])),
        EncoderProfile::Vaapi => args.extend(arg_strings(&[
            "-vf",
            "format=nv12|vaapi,hwupload",
            "-bf",
            "0",
        ])),
    }
    args.extend(vec![
        "-force_key_frames".to_string(),
        format!("expr:gte(t,n_forced*{})", hsv::FRAGMENT_LENGTH.as_secs()),
    ]);
    if input.timestamp_overlay {
        args.extend(vec![
            "-filter_complex".to_string(),
            DRAWTEXT_FILTER.to_string(),
        ]);
    }
    if input.audio {
        args.extend(arg_strings(&["-c:a", "aac", "-ar", "32000"]));
    } else {
        args.push("-an".to_string());
    }
    args.extend(fragmented_mp4_output_args());
    args
}

/// Per-session recording transcoder: re-encodes the piped mother-stream
/// fragments to the controller's selection.
pub fn recording_arguments(
    input: &InputConfiguration,
    profile: EncoderProfile,
    selection: &SelectedCameraRecordingConfiguration,
) -> Vec<String> {
    let attributes = selection.video.video_attributes.first();
    let width = attributes.map(|a| a.image_width).unwrap_or(1920);
    let frame_rate = attributes.map(|a| a.frame_rate).unwrap_or(30);
    let codec_params = selection.video.video_codec_parameters.first();

    let mut args = hwaccel_input_args(profile);
    args.extend(arg_strings(&["-f", "mp4", "-i", "pipe:0"]));
    args.extend(vec![
        "-c:v".to_string(),
        encoder_name(profile).to_string(),
        "-profile:v".to_string(),
        recording_video_profile(codec_params, profile).to_string(),
        "-level:v".to_string(),
        recording_video_level(codec_params).to_string(),
        "-r".to_string(),
        frame_rate.to_string(),
    ]);
    args.extend(encoder_scale_args(profile, width));
    if input.timestamp_overlay {
        args.extend(vec![
            "-filter_complex".to_string(),
            DRAWTEXT_FILTER.to_string(),
        ]);
    }
    if input.audio {
        let audio_params = selection.audio.audio_codec_parameters.first();
        args.extend(vec![
            "-c:a".to_string(),
            recording_audio_codec(selection.audio.codec).to_string(),
            "-ar".to_string(),
            recording_audio_sample_rate(audio_params).to_string(),
        ]);
        args.extend(recording_audio_codec_options(selection.audio.codec));
    } else {
        args.push("-an".to_string());
    }
    args.extend(fragmented_mp4_output_args());
    args
}

/// On-demand live stream transcoder: SRTP out to the controller's endpoints.
pub fn stream_arguments(
    input: &InputConfiguration,
    video: &SelectedVideoParams,
    audio: Option<&SelectedAudioParams>,
    se: &SetupEndpoints,
    profile: EncoderProfile,
) -> Vec<String> {
    let mut args = hwaccel_input_args(profile);
    args.extend(source_input_args(input));
    args.extend(vec![
        "-c:v".to_string(),
        encoder_name(profile).to_string(),
        "-profile:v".to_string(),
        stream_video_profile(video).to_string(),
        "-level:v".to_string(),
        stream_video_level(video).to_string(),
        "-r".to_string(),
        video.framerate.to_string(),
    ]);
    args.extend(encoder_scale_args(profile, video.width));
    if input.timestamp_overlay {
        args.extend(vec![
            "-filter_complex".to_string(),
            DRAWTEXT_FILTER.to_string(),
        ]);
    }

    let addr = &se.controller_addr;
    args.extend(vec![
        "-payload_type".to_string(),
        video.rtp.payload_type.to_string(),
        "-ssrc".to_string(),
        "1".to_string(),
        "-map".to_string(),
        "0:0".to_string(),
        "-f".to_string(),
        "rtp".to_string(),
        "-srtp_out_suite".to_string(),
        "AES_CM_128_HMAC_SHA1_80".to_string(),
        "-b:v".to_string(),
        format!("{}k", video.rtp.bitrate),
        "-srtp_out_params".to_string(),
        se.video.srtp_key(),
        srtp_url(addr, addr.video_rtp_port, stream_video_mtu(se)),
    ]);

    if input.audio {
        if let Some(audio) = audio {
            let codec = if input.audio_aac {
                stream_audio_codec(audio)
            } else {
                "libopus"
            };
            args.extend(vec![
                "-payload_type".to_string(),
                audio.rtp.payload_type.to_string(),
                "-ssrc".to_string(),
                "2".to_string(),
                "-c:a".to_string(),
                codec.to_string(),
                "-map".to_string(),
                "0:1".to_string(),
                "-f".to_string(),
                "rtp".to_string(),
                "-ar".to_string(),
                stream_audio_sample_rate(audio).to_string(),
            ]);
            args.extend(stream_audio_codec_options(audio));
            args.extend(vec![
                "-srtp_out_suite".to_string(),
                "AES_CM_128_HMAC_SHA1_80".to_string(),
                "-b:a".to_string(),
                format!("{}k", audio.rtp.bitrate),
                "-frame_duration".to_string(),
                "20".to_string(),
                "-srtp_out_params".to_string(),
                se.audio.srtp_key(),
                srtp_url(addr, addr.audio_rtp_port, 3768),
            ]);
        }
    }

    args
}

/// Still-image transcoder: piped fMP4 in, one PNG out.
pub fn snapshot_arguments(width: u32) -> Vec<String> {
    vec![
        "-f".to_string(),
        "mp4".to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-c:v".to_string(),
        "png".to_string(),
        "-vframes".to_string(),
        "1".to_string(),
        "-vsync".to_string(),
        "vfr".to_string(),
        "-compression_level".to_string(),
        "50".to_string(),
        "-vf".to_string(),
        format!("scale={}:-2", width),
        "-f".to_string(),
        "image2pipe".to_string(),
        "pipe:1".to_string(),
    ]
}

fn srtp_url(addr: &Addr, port: u16, pkt_size: u16) -> String {
    format!(
        "srtp://{}:{}?rtcpport={}&localrtcpport={}&pkt_size={}&timeout=60",
        addr.ip_addr, port, port, port, pkt_size
    )
}

fn stream_video_profile(video: &SelectedVideoParams) -> &'static str {
    match video.profile_id {
        rtp::VIDEO_CODEC_PROFILE_CONSTRAINED_BASELINE => "baseline",
        rtp::VIDEO_CODEC_PROFILE_MAIN => "main",
        _ => "high",
    }
}

fn stream_video_level(video: &SelectedVideoParams) -> &'static str {
    match video.level {
        rtp::VIDEO_CODEC_LEVEL_3_1 => "3.1",
        rtp::VIDEO_CODEC_LEVEL_3_2 => "3.2",
        _ => "4",
    }
}

fn stream_video_mtu(se: &SetupEndpoints) -> u16 {
    match se.controller_addr.ip_version {
        rtp::IP_ADDR_VERSION_V4 => 1378,
        _ => 1228,
    }
}

fn stream_audio_sample_rate(audio: &SelectedAudioParams) -> u32 {
    match audio.sample_rate {
        rtp::AUDIO_CODEC_SAMPLE_RATE_16KHZ => 16000,
        rtp::AUDIO_CODEC_SAMPLE_RATE_24KHZ => 24000,
        _ => 8000,
    }
}

fn stream_audio_codec(audio: &SelectedAudioParams) -> &'static str {
    match audio.codec {
        rtp::AUDIO_CODEC_TYPE_AAC_ELD => "aac",
        rtp::AUDIO_CODEC_TYPE_OPUS => "libopus",
        _ => "libopus",
    }
}

fn stream_audio_codec_options(audio: &SelectedAudioParams) -> Vec<String> {
    match audio.codec {
        rtp::AUDIO_CODEC_TYPE_OPUS => {
            arg_strings(&["-vbr", "on", "-application", "voip"])
        }
        rtp::AUDIO_CODEC_TYPE_AAC_ELD => {
            arg_strings(&["-profile:a", "aac_eld", "-flags", "+global_header"])
        }
        _ => Vec::new(),
    }
}

fn recording_video_profile(
    params: Option<&hsv::VideoCodecParameters>,
    profile: EncoderProfile,
) -> &'static str {
    match params.map(|p| p.profile_id) {
        Some(rtp::VIDEO_CODEC_PROFILE_CONSTRAINED_BASELINE) => match profile {
            // The hardware encoder rejects the short name.
            EncoderProfile::Vaapi => "constrained_baseline",
            EncoderProfile::Cpu => "baseline",
        },
        Some(rtp::VIDEO_CODEC_PROFILE_MAIN) => "main",
        _ => "high",
    }
}

fn recording_video_level(params: Option<&hsv::VideoCodecParameters>) -> &'static str {
    match params.map(|p| p.level) {
        Some(rtp::VIDEO_CODEC_LEVEL_3_1) => "3.1",
        Some(rtp::VIDEO_CODEC_LEVEL_3_2) => "3.2",
        _ => "4",
    }
}

fn recording_audio_codec(codec: u8) -> &'static str {
    match codec {
        hsv::AUDIO_RECORDING_CODEC_AAC_ELD => "aac",
        _ => "aac",
    }
}

fn recording_audio_sample_rate(params: Option<&hsv::AudioCodecParameters>) -> u32 {
    match params.and_then(|p| p.sample_rates.first().copied()) {
        Some(hsv::AUDIO_RECORDING_SAMPLE_RATE_16KHZ) => 16000,
        Some(hsv::AUDIO_RECORDING_SAMPLE_RATE_24KHZ) => 24000,
        Some(hsv::AUDIO_RECORDING_SAMPLE_RATE_32KHZ) => 32000,
        Some(hsv::AUDIO_RECORDING_SAMPLE_RATE_44KHZ) => 44100,
        Some(hsv::AUDIO_RECORDING_SAMPLE_RATE_48KHZ) => 48000,
        _ => 8000,
    }
}

fn recording_audio_codec_options(codec: u8) -> Vec<String> {
    match codec {
        hsv::AUDIO_RECORDING_CODEC_AAC_ELD => {
            arg_strings(&["-profile:a", "aac_eld", "-flags", "+global_header"])
        }
        _ => Vec::new(),
    }
}

/// Spawns the transcoder with the given stdio wiring. stderr is passed
/// through when debug logging is on, discarded otherwise.
pub fn spawn(program: &str, args: &[String], stdin: Stdio, stdout: Stdio) -> io::Result<Child> {
    let debug = log::log_enabled!(log::Level::Debug);
    if debug {
        debug!("{} {}", program, args.join(" "));
    }

    Command::new(program)
        .args(args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(if debug {
            Stdio::inherit()
        } else {
            Stdio::null()
        })
        .spawn()
}

/// Release handler for a transcoder child. Dropping the guard kills and
/// reaps the process, so every exit path cleans up.
pub struct KillOnDrop(pub Child);

impl KillOnDrop {
    pub fn id(&self) -> u32 {
        self.0.id()
    }

    /// Delivers a process signal (stop/continue for suspend and resume).
    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        kill(Pid::from_raw(self.0.id() as i32), signal).map_err(io::Error::other)
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::InputConfiguration;

    fn input(source: &str, format: &str) -> InputConfiguration {
        InputConfiguration {
            source: source.to_string(),
            format: format.to_string(),
            audio: true,
            audio_aac: false,
            timestamp_overlay: false,
            transcoder: "ffmpeg".to_string(),
        }
    }

    #[test]
    fn rtsp_sources_pin_tcp_transport() {
        let args =
            mother_stream_arguments(&input("rtsp://cam.local/stream", "rtsp"), EncoderProfile::Cpu);
        assert_eq!(args[0], "-rtsp_transport");
        assert_eq!(args[1], "tcp");

        let args = mother_stream_arguments(&input("/dev/video0", "v4l2"), EncoderProfile::Cpu);
        assert!(!args.contains(&"-rtsp_transport".to_string()));
    }

    #[test]
    fn mother_stream_output_is_fragmented_mp4() {
        let args = mother_stream_arguments(&input("/dev/video0", "v4l2"), EncoderProfile::Cpu);
        assert!(args.contains(&"frag_keyframe+empty_moov+default_base_moof".to_string()));
        assert!(args.contains(&FRAGMENT_DURATION_ARG.to_string()));
        assert_eq!(args.last().unwrap(), "pipe:1");
    }

    #[test]
    fn recording_reads_the_pipe_and_maps_the_selection() {
        let selection = crate::hsv::standard_selection();
        let args = recording_arguments(
            &input("/dev/video0", "v4l2"),
            EncoderProfile::Cpu,
            &selection,
        );
        let pipe_pos = args.iter().position(|a| a == "pipe:0").unwrap();
        assert_eq!(args[pipe_pos - 1], "-i");
        let profile_pos = args.iter().position(|a| a == "-profile:v").unwrap();
        assert_eq!(args[profile_pos + 1], "main");
        let level_pos = args.iter().position(|a| a == "-level:v").unwrap();
        assert_eq!(args[level_pos + 1], "3.1");
        assert!(args.contains(&"scale=1280:-1".to_string()));
    }

    #[test]
    fn vaapi_uses_the_long_profile_name() {
        let mut selection = crate::hsv::standard_selection();
        selection.video.video_codec_parameters[0].profile_id =
            rtp::VIDEO_CODEC_PROFILE_CONSTRAINED_BASELINE;
        let args = recording_arguments(
            &input("/dev/video0", "v4l2"),
            EncoderProfile::Vaapi,
            &selection,
        );
        let profile_pos = args.iter().position(|a| a == "-profile:v").unwrap();
        assert_eq!(args[profile_pos + 1], "constrained_baseline");
        assert!(args.contains(&"-vaapi_device".to_string()));
    }

    #[test]
    fn stream_targets_the_controller_endpoints() {
        use crate::rtp::*;

        let se = SetupEndpoints {
            session_id: vec![1; 16],
            controller_addr: Addr {
                ip_version: IP_ADDR_VERSION_V4,
                ip_addr: "10.0.0.9".to_string(),
                video_rtp_port: 50000,
                audio_rtp_port: 50002,
            },
            video: SrtpParams {
                crypto_suite: CRYPTO_SUITE_AES_CM_128_HMAC_SHA1_80,
                master_key: vec![0; 16],
                master_salt: vec![0; 14],
            },
            audio: SrtpParams {
                crypto_suite: CRYPTO_SUITE_AES_CM_128_HMAC_SHA1_80,
                master_key: vec![0; 16],
                master_salt: vec![0; 14],
            },
        };
        let video = SelectedVideoParams {
            codec: VIDEO_CODEC_TYPE_H264,
            profile_id: VIDEO_CODEC_PROFILE_CONSTRAINED_BASELINE,
            level: VIDEO_CODEC_LEVEL_3_2,
            width: 1280,
            height: 720,
            framerate: 30,
            rtp: RtpParams {
                payload_type: 99,
                ssrc: 1,
                bitrate: 299,
                mtu: None,
            },
        };

        let args = stream_arguments(
            &input("/dev/video0", "v4l2"),
            &video,
            None,
            &se,
            EncoderProfile::Cpu,
        );
        assert!(args.contains(
            &"srtp://10.0.0.9:50000?rtcpport=50000&localrtcpport=50000&pkt_size=1378&timeout=60"
                .to_string()
        ));
        let profile_pos = args.iter().position(|a| a == "-profile:v").unwrap();
        assert_eq!(args[profile_pos + 1], "baseline");
        assert!(args.contains(&"-b:v".to_string()));
        assert!(args.contains(&"299k".to_string()));
    }

    #[test]
    fn ipv6_controllers_get_the_smaller_mtu() {
        let mut se = crate::rtp::test_endpoints(&[1; 16]);
        se.controller_addr.ip_version = rtp::IP_ADDR_VERSION_V6;
        assert_eq!(stream_video_mtu(&se), 1228);
        se.controller_addr.ip_version = rtp::IP_ADDR_VERSION_V4;
        assert_eq!(stream_video_mtu(&se), 1378);
    }

    #[test]
    fn snapshot_scales_to_an_even_height() {
        let args = snapshot_arguments(640);
        assert!(args.contains(&"scale=640:-2".to_string()));
        assert!(args.contains(&"image2pipe".to_string()));
        assert_eq!(args[3], "pipe:0");
    }
}
