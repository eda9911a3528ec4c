//! Live RTP stream sessions: endpoint setup and the
//! start/suspend/resume/reconfigure/end lifecycle.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::Signal;

use crate::camera::{EncoderProfile, InputConfiguration};
use crate::ffmpeg::{self, KillOnDrop};
use crate::rtp::{
    self, SelectedVideoParams, SetupEndpoints, SetupEndpointsResponse, StreamConfiguration,
};

const SSRC_VIDEO: u32 = 1;
const SSRC_AUDIO: u32 = 2;

struct RtpSession {
    endpoints: SetupEndpoints,
    child: Option<KillOnDrop>,
    initial_configuration: Option<StreamConfiguration>,
}

/// Sessions keyed by the controller's opaque session identifier. Each one
/// owns at most one transcoder at a time.
pub struct StreamManagement {
    input: InputConfiguration,
    profile: EncoderProfile,
    sessions: Mutex<HashMap<Vec<u8>, RtpSession>>,
}

impl StreamManagement {
    pub fn new(input: InputConfiguration, profile: EncoderProfile) -> Self {
        Self {
            input,
            profile,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Handles a SetupEndpoints write and returns the response value.
    /// `local_ip` is the accessory's side of the controller connection; the
    /// controller's ports are echoed back.
    pub fn handle_setup_endpoints(&self, value: &[u8], local_ip: IpAddr) -> Result<Vec<u8>> {
        let request =
            SetupEndpoints::decode(value).context("decoding the endpoint setup request")?;
        debug!(
            "setup endpoints for session {}: {}:{}/{}",
            hex::encode(&request.session_id),
            request.controller_addr.ip_addr,
            request.controller_addr.video_rtp_port,
            request.controller_addr.audio_rtp_port,
        );

        let response = SetupEndpointsResponse {
            session_id: request.session_id.clone(),
            status: rtp::SESSION_STATUS_SUCCESS,
            accessory_addr: rtp::Addr {
                ip_version: request.controller_addr.ip_version,
                ip_addr: local_ip.to_string(),
                video_rtp_port: request.controller_addr.video_rtp_port,
                audio_rtp_port: request.controller_addr.audio_rtp_port,
            },
            video: request.video.clone(),
            audio: request.audio.clone(),
            ssrc_video: SSRC_VIDEO,
            ssrc_audio: SSRC_AUDIO,
        };

        self.sessions.lock().unwrap().insert(
            request.session_id.clone(),
            RtpSession {
                endpoints: request,
                child: None,
                initial_configuration: None,
            },
        );

        Ok(response.encode())
    }

    /// Dispatches a SelectedRTPStreamConfiguration write.
    pub fn handle_selected_configuration(&self, value: &[u8]) -> Result<()> {
        let cfg =
            StreamConfiguration::decode(value).context("decoding the stream configuration")?;

        match cfg.command.command_type {
            rtp::SESSION_CONTROL_COMMAND_START => self.start(cfg),
            rtp::SESSION_CONTROL_COMMAND_SUSPEND => self.suspend(&cfg.command.identifier),
            rtp::SESSION_CONTROL_COMMAND_RESUME => self.resume(&cfg.command.identifier),
            rtp::SESSION_CONTROL_COMMAND_RECONFIGURE => self.reconfigure(cfg),
            rtp::SESSION_CONTROL_COMMAND_END => self.end(&cfg.command.identifier),
            other => Err(anyhow!("unknown session command {}", other)),
        }
    }

    fn start(&self, cfg: StreamConfiguration) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let id = cfg.command.identifier.clone();
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("start for unknown session {}", hex::encode(&id)))?;
        let video = cfg
            .video
            .as_ref()
            .ok_or_else(|| anyhow!("start without video parameters"))?;

        let args = ffmpeg::stream_arguments(
            &self.input,
            video,
            cfg.audio.as_ref(),
            &session.endpoints,
            self.profile,
        );
        let child = ffmpeg::spawn(&self.input.transcoder, &args, Stdio::null(), Stdio::null())
            .context("spawning the stream transcoder")?;
        info!(
            "stream session {} started, pid {}",
            hex::encode(&id),
            child.id()
        );

        session.child = Some(KillOnDrop(child));
        session.initial_configuration = Some(cfg);
        Ok(())
    }

    fn suspend(&self, id: &[u8]) -> Result<()> {
        info!("suspending stream session {}", hex::encode(id));
        self.signal(id, Signal::SIGSTOP)
    }

    fn resume(&self, id: &[u8]) -> Result<()> {
        info!("resuming stream session {}", hex::encode(id));
        self.signal(id, Signal::SIGCONT)
    }

    fn signal(&self, id: &[u8], signal: Signal) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(id)
            .ok_or_else(|| anyhow!("signal for unknown session {}", hex::encode(id)))?;
        let child = session
            .child
            .as_ref()
            .ok_or_else(|| anyhow!("session {} has no transcoder", hex::encode(id)))?;
        child.signal(signal)?;
        Ok(())
    }

    /// The controller re-sends its parameters mid-stream. Log what moved and
    /// keep the transcoder running; nothing it re-negotiates requires a
    /// restart today.
    fn reconfigure(&self, cfg: StreamConfiguration) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let id = &cfg.command.identifier;
        let session = sessions
            .get(id)
            .ok_or_else(|| anyhow!("reconfigure for unknown session {}", hex::encode(id)))?;

        let initial_video = session
            .initial_configuration
            .as_ref()
            .and_then(|c| c.video.as_ref());
        if let (Some(initial), Some(new)) = (initial_video, cfg.video.as_ref()) {
            for change in diff_summary(initial, new) {
                info!("reconfigure session {}: {}", hex::encode(id), change);
            }
        }
        Ok(())
    }

    fn end(&self, id: &[u8]) -> Result<()> {
        let removed = self.sessions.lock().unwrap().remove(id);
        match removed {
            // Dropping the session kills its transcoder.
            Some(_) => {
                info!("ended stream session {}", hex::encode(id));
                Ok(())
            }
            None => Err(anyhow!("end for unknown session {}", hex::encode(id))),
        }
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    #[cfg(test)]
    fn child_pid(&self, id: &[u8]) -> Option<u32> {
        self.sessions
            .lock()
            .unwrap()
            .get(id)
            .and_then(|s| s.child.as_ref().map(|c| c.id()))
    }
}

fn diff_summary(old: &SelectedVideoParams, new: &SelectedVideoParams) -> Vec<String> {
    let mut changes = Vec::new();
    if old.rtp.bitrate != new.rtp.bitrate {
        changes.push(format!("bitrate {}k -> {}k", old.rtp.bitrate, new.rtp.bitrate));
    }
    if (old.width, old.height) != (new.width, new.height) {
        changes.push(format!(
            "resolution {}x{} -> {}x{}",
            old.width, old.height, new.width, new.height
        ));
    }
    if old.framerate != new.framerate {
        changes.push(format!("framerate {} -> {}", old.framerate, new.framerate));
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{RtpParams, SessionCommand};

    fn input(transcoder: &str) -> InputConfiguration {
        InputConfiguration {
            source: "/dev/video0".to_string(),
            format: "v4l2".to_string(),
            audio: false,
            audio_aac: false,
            timestamp_overlay: false,
            transcoder: transcoder.to_string(),
        }
    }

    fn video_params() -> SelectedVideoParams {
        SelectedVideoParams {
            codec: rtp::VIDEO_CODEC_TYPE_H264,
            profile_id: rtp::VIDEO_CODEC_PROFILE_MAIN,
            level: rtp::VIDEO_CODEC_LEVEL_3_1,
            width: 1280,
            height: 720,
            framerate: 30,
            rtp: RtpParams {
                payload_type: 99,
                ssrc: 1,
                bitrate: 299,
                mtu: None,
            },
        }
    }

    fn command(id: &[u8], command_type: u8) -> StreamConfiguration {
        StreamConfiguration {
            command: SessionCommand {
                identifier: id.to_vec(),
                command_type,
            },
            video: None,
            audio: None,
        }
    }

    #[test]
    fn setup_endpoints_echoes_ports_and_fixed_ssrcs() {
        let mgmt = StreamManagement::new(input("cat"), EncoderProfile::Cpu);
        let se = rtp::test_endpoints(&[0xAB; 16]);

        let response_value = mgmt
            .handle_setup_endpoints(&se.encode(), "192.168.1.5".parse().unwrap())
            .unwrap();
        let response = SetupEndpointsResponse::decode(&response_value).unwrap();

        assert_eq!(response.session_id, vec![0xAB; 16]);
        assert_eq!(response.status, rtp::SESSION_STATUS_SUCCESS);
        assert_eq!(response.accessory_addr.ip_addr, "192.168.1.5");
        assert_eq!(response.accessory_addr.video_rtp_port, 50000);
        assert_eq!(response.accessory_addr.audio_rtp_port, 50002);
        assert_eq!(response.ssrc_video, 1);
        assert_eq!(response.ssrc_audio, 2);
        assert_eq!(response.video, se.video);
        assert_eq!(mgmt.session_count(), 1);
    }

    #[test]
    fn lifecycle_spawns_signals_and_removes() {
        // `cat` stands in for the transcoder: spawnable and signalable.
        let mgmt = StreamManagement::new(input("cat"), EncoderProfile::Cpu);
        let id = [0xAB; 16];
        let se = rtp::test_endpoints(&id);
        mgmt.handle_setup_endpoints(&se.encode(), "192.168.1.5".parse().unwrap())
            .unwrap();

        let mut start = command(&id, rtp::SESSION_CONTROL_COMMAND_START);
        start.video = Some(video_params());
        mgmt.handle_selected_configuration(&start.encode()).unwrap();
        let pid = mgmt.child_pid(&id).expect("start spawned a transcoder");

        mgmt.handle_selected_configuration(
            &command(&id, rtp::SESSION_CONTROL_COMMAND_SUSPEND).encode(),
        )
        .unwrap();
        mgmt.handle_selected_configuration(
            &command(&id, rtp::SESSION_CONTROL_COMMAND_RESUME).encode(),
        )
        .unwrap();

        // Exactly one transcoder across the whole lifecycle.
        assert_eq!(mgmt.child_pid(&id), Some(pid));

        mgmt.handle_selected_configuration(&command(&id, rtp::SESSION_CONTROL_COMMAND_END).encode())
            .unwrap();
        assert_eq!(mgmt.session_count(), 0);
    }

    #[test]
    fn commands_for_unknown_sessions_fail() {
        let mgmt = StreamManagement::new(input("cat"), EncoderProfile::Cpu);
        let result = mgmt.handle_selected_configuration(
            &command(&[9; 16], rtp::SESSION_CONTROL_COMMAND_END).encode(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn reconfigure_logs_without_touching_the_transcoder() {
        let mgmt = StreamManagement::new(input("cat"), EncoderProfile::Cpu);
        let id = [0xCD; 16];
        let se = rtp::test_endpoints(&id);
        mgmt.handle_setup_endpoints(&se.encode(), "192.168.1.5".parse().unwrap())
            .unwrap();

        let mut start = command(&id, rtp::SESSION_CONTROL_COMMAND_START);
        start.video = Some(video_params());
        mgmt.handle_selected_configuration(&start.encode()).unwrap();
        let pid = mgmt.child_pid(&id).unwrap();

        let mut reconfigure = command(&id, rtp::SESSION_CONTROL_COMMAND_RECONFIGURE);
        let mut video = video_params();
        video.rtp.bitrate = 600;
        reconfigure.video = Some(video);
        mgmt.handle_selected_configuration(&reconfigure.encode())
            .unwrap();

        assert_eq!(mgmt.child_pid(&id), Some(pid));
    }

    #[test]
    fn diff_summary_names_the_moved_fields() {
        let old = video_params();
        let mut new = video_params();
        new.rtp.bitrate = 600;
        new.width = 1920;
        new.height = 1080;

        let changes = diff_summary(&old, &new);
        assert_eq!(changes.len(), 2);
        assert!(changes[0].contains("299k -> 600k"));
        assert!(changes[1].contains("1280x720 -> 1920x1080"));
    }
}
