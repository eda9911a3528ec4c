//! Secure-video recording sessions: the per-session data stream server and
//! its control/dataSend state machine.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::process::{ChildStdin, ChildStdout, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::Receiver;
use rand::RngCore;

use crate::camera::{EncoderProfile, InputConfiguration};
use crate::ffmpeg::{self, KillOnDrop, FRAGMENT_DURATION};
use crate::hds::{self, HdsSession, Payload, Value};
use crate::hsv::{
    self, SelectedCameraRecordingConfiguration, SetupDataStreamSessionRequest,
    SetupDataStreamSessionResponse,
};
use crate::mother_stream::{ChannelWriter, FragmentCache};
use crate::mp4::{Chunk, ChunkReader};

const DATA_TYPE_MEDIA_INITIALIZATION: &str = "mediaInitialization";
const DATA_TYPE_MEDIA_FRAGMENT: &str = "mediaFragment";

const RECORDING_OPEN_TYPE: &str = "ipcamera.recording";

/// Selection committed by the controller, shared with the camera façade.
pub type SharedSelection = Arc<Mutex<Option<SelectedCameraRecordingConfiguration>>>;

/// Outcome of a transport setup write: where to connect and our half of the
/// key salt.
pub struct SetupDataStreamSession {
    pub port: u16,
    pub accessory_key_salt: [u8; 32],
}

/// Owns everything a recording transport needs besides the accessory
/// framework itself: the fragment cache handle, the committed selection and
/// the transcoder configuration.
pub struct DataStreamManagement {
    input: InputConfiguration,
    profile: EncoderProfile,
    cache: Arc<FragmentCache>,
    selection: SharedSelection,
}

impl DataStreamManagement {
    pub fn new(
        input: InputConfiguration,
        profile: EncoderProfile,
        cache: Arc<FragmentCache>,
        selection: SharedSelection,
    ) -> Self {
        Self {
            input,
            profile,
            cache,
            selection,
        }
    }

    /// Handles a SetupDataStreamTransport write and returns the TLV8
    /// response value. `shared_key` is the pair-verify shared key of the
    /// writing controller, resolved by the accessory framework.
    pub fn handle_setup_transport_write(
        &self,
        value: &[u8],
        shared_key: &[u8; 32],
    ) -> Result<Vec<u8>> {
        let request = SetupDataStreamSessionRequest::decode(value)
            .context("decoding the transport setup request")?;
        if request.command != hsv::SETUP_DATA_STREAM_COMMAND_START
            || request.transport_type != hsv::TRANSPORT_TYPE_HOMEKIT_DATA_STREAM
        {
            bail!(
                "unsupported transport setup: command {} transport {}",
                request.command,
                request.transport_type
            );
        }

        let setup = self.setup_session(&request.controller_key_salt, shared_key)?;

        Ok(SetupDataStreamSessionResponse {
            status: hsv::SETUP_DATA_STREAM_STATUS_SUCCESS,
            port: setup.port,
            accessory_key_salt: setup.accessory_key_salt.to_vec(),
        }
        .encode())
    }

    /// Opens a fresh listener on an ephemeral port, derives the HDS session
    /// and hands the single expected connection to its own thread.
    pub fn setup_session(
        &self,
        controller_key_salt: &[u8],
        shared_key: &[u8; 32],
    ) -> Result<SetupDataStreamSession> {
        let listener =
            TcpListener::bind(("0.0.0.0", 0)).context("binding the data stream listener")?;
        let port = listener.local_addr()?.port();

        let mut accessory_key_salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut accessory_key_salt);

        let session = HdsSession::new(controller_key_salt, &accessory_key_salt, shared_key)?;
        let ctx = SessionContext {
            input: self.input.clone(),
            profile: self.profile,
            cache: Arc::clone(&self.cache),
            selection: Arc::clone(&self.selection),
        };

        thread::spawn(move || match listener.accept() {
            Ok((stream, peer)) => {
                info!("data stream connection from {}", peer);
                if let Err(e) = run_connection(ctx, session, stream, peer) {
                    warn!("data stream session {} ended: {:#}", peer, e);
                }
            }
            Err(e) => error!("data stream accept failed: {}", e),
        });

        info!("data stream listening on port {}", port);
        Ok(SetupDataStreamSession {
            port,
            accessory_key_salt,
        })
    }
}

struct SessionContext {
    input: InputConfiguration,
    profile: EncoderProfile,
    cache: Arc<FragmentCache>,
    selection: SharedSelection,
}

/// The write half of a session. Encryption and the TCP write happen under
/// one lock so the counter order matches the byte order on the wire.
struct HdsConnection {
    session: HdsSession,
    stream: TcpStream,
}

impl HdsConnection {
    fn send(&mut self, payload: &Payload) -> Result<(), hds::Error> {
        let plaintext = payload.encode()?;
        hds::write_frame(&mut self.stream, &mut self.session, &plaintext)
    }

    fn open(&mut self, frame: &hds::Frame) -> Result<Vec<u8>, hds::Error> {
        frame.open(&mut self.session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    AwaitingHello,
    AwaitingOpen,
    Streaming,
}

fn run_connection(
    ctx: SessionContext,
    session: HdsSession,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let reader_stream = stream.try_clone().context("cloning the session socket")?;
    let conn = Arc::new(Mutex::new(HdsConnection { session, stream }));
    let mut reader = BufReader::new(reader_stream);
    let mut state = SessionState::AwaitingHello;
    let mut recorder: Option<RecordingStream> = None;

    loop {
        let frame = match hds::read_frame(&mut reader) {
            Ok(frame) => frame,
            Err(hds::Error::Io(e)) => {
                debug!("[{}] connection closed: {}", peer, e);
                break;
            }
            Err(e) => {
                warn!("[{}] framing error: {}", peer, e);
                break;
            }
        };

        let plaintext = match conn.lock().unwrap().open(&frame) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("[{}] {}", peer, e);
                break;
            }
        };

        let payload = match Payload::parse(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("[{}] bad payload: {}", peer, e);
                break;
            }
        };

        match payload.protocol() {
            Some(hds::PROTOCOL_CONTROL) => match payload.request() {
                Some("hello") if state == SessionState::AwaitingHello => {
                    let id = payload.header_int("id").unwrap_or(0);
                    if conn
                        .lock()
                        .unwrap()
                        .send(&response_payload(
                            hds::PROTOCOL_CONTROL,
                            "hello",
                            id,
                            hds::STATUS_SUCCESS,
                        ))
                        .is_err()
                    {
                        break;
                    }
                    state = SessionState::AwaitingOpen;
                }
                Some(request) => info!("[{}] ignoring control request {:?}", peer, request),
                None => info!("[{}] ignoring control frame without a request", peer),
            },
            Some(hds::PROTOCOL_DATA_SEND) if state != SessionState::AwaitingHello => {
                if payload.request() == Some("open") {
                    match handle_open(&ctx, &conn, &payload, peer, state) {
                        Ok(Some(rec)) => {
                            recorder = Some(rec);
                            state = SessionState::Streaming;
                        }
                        Ok(None) => {}
                        Err(_) => break,
                    }
                } else if payload.event() == Some("close") {
                    info!("[{}] controller closed the stream", peer);
                    break;
                } else {
                    info!("[{}] ignoring dataSend frame", peer);
                }
            }
            other => {
                warn!("[{}] unexpected protocol {:?}", peer, other);
                break;
            }
        }
    }

    if let Some(rec) = recorder.take() {
        rec.shutdown(&ctx.cache);
    }
    let _ = conn.lock().unwrap().stream.shutdown(Shutdown::Both);
    Ok(())
}

/// Handles a dataSend open request. A missing selection or a recording that
/// cannot start answers with a protocol-specific error and leaves the
/// session in awaiting-open; only a transport failure tears it down.
fn handle_open(
    ctx: &SessionContext,
    conn: &Arc<Mutex<HdsConnection>>,
    payload: &Payload,
    peer: SocketAddr,
    state: SessionState,
) -> Result<Option<RecordingStream>> {
    let id = payload.header_int("id").unwrap_or(0);
    let open_type = payload.message.get("type").and_then(Value::as_str);
    let stream_id = payload
        .message
        .get("streamId")
        .and_then(Value::as_int)
        .unwrap_or(1);

    let reject = |reason: &str| {
        info!("[{}] rejecting open: {}", peer, reason);
        conn.lock()
            .unwrap()
            .send(&response_payload(
                hds::PROTOCOL_DATA_SEND,
                "open",
                id,
                hds::STATUS_PROTOCOL_SPECIFIC_ERROR,
            ))
            .map(|_| None)
            .map_err(anyhow::Error::from)
    };

    if state == SessionState::Streaming {
        return reject("a stream is already open");
    }
    if open_type != Some(RECORDING_OPEN_TYPE) {
        return reject("unsupported stream type");
    }

    let selection = ctx.selection.lock().unwrap().clone();
    let Some(selection) = selection else {
        return reject("no recording configuration selected");
    };

    match start_recording(ctx, Arc::clone(conn), stream_id, &selection, peer) {
        Ok(mut rec) => {
            conn.lock().unwrap().send(&response_payload(
                hds::PROTOCOL_DATA_SEND,
                "open",
                id,
                hds::STATUS_SUCCESS,
            ))?;
            // Events must only start flowing after the open response.
            rec.start_events();
            Ok(Some(rec))
        }
        Err(e) => {
            error!("[{}] could not start recording: {:#}", peer, e);
            reject("recording unavailable")
        }
    }
}

/// A live recording: the per-session transcoder plus its consumer
/// registration. Dropping it kills the transcoder.
struct RecordingStream {
    child: KillOnDrop,
    consumer_key: String,
    events: Option<EventStream>,
}

impl RecordingStream {
    fn start_events(&mut self) {
        if let Some(events) = self.events.take() {
            thread::spawn(move || events.run());
        }
    }

    fn shutdown(self, cache: &FragmentCache) {
        cache.detach(&self.consumer_key);
        debug!("killing recording transcoder pid {}", self.child.id());
        // child dies on drop
    }
}

fn start_recording(
    ctx: &SessionContext,
    conn: Arc<Mutex<HdsConnection>>,
    stream_id: i64,
    selection: &SelectedCameraRecordingConfiguration,
    peer: SocketAddr,
) -> Result<RecordingStream> {
    let args = ffmpeg::recording_arguments(&ctx.input, ctx.profile, selection);
    let mut child = KillOnDrop(
        ffmpeg::spawn(&ctx.input.transcoder, &args, Stdio::piped(), Stdio::piped())
            .context("spawning the recording transcoder")?,
    );
    let stdin = child
        .0
        .stdin
        .take()
        .ok_or_else(|| anyhow!("recording transcoder has no stdin"))?;
    let stdout = child
        .0
        .stdout
        .take()
        .ok_or_else(|| anyhow!("recording transcoder has no stdout"))?;

    // FIXME: the live bridge channel is unbounded; a transcoder that stops
    // reading its stdin lets it grow until the session is closed.
    let (tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let consumer_key = peer.to_string();
    let (init, prebuffer) = ctx
        .cache
        .attach(consumer_key.clone(), Box::new(ChannelWriter(tx)))
        .ok_or_else(|| anyhow!("mother stream has not produced init chunks yet"))?;

    let cache = Arc::clone(&ctx.cache);
    let feeder_key = consumer_key.clone();
    thread::spawn(move || {
        if let Err(e) = feed_recording(stdin, &init, &prebuffer, rx) {
            debug!("recording feed ended: {}", e);
        }
        cache.detach(&feeder_key);
    });

    let fragment_total =
        (i64::from(selection.fragment_length_ms()) / FRAGMENT_DURATION.as_millis() as i64 / 2)
            .max(1);

    Ok(RecordingStream {
        child,
        consumer_key,
        events: Some(EventStream {
            stdout,
            conn,
            stream_id,
            fragment_total,
        }),
    })
}

/// Writes the recording's past (init + pre-buffer snapshot) and then the
/// live feed into the transcoder.
fn feed_recording(
    mut stdin: ChildStdin,
    init: &[Chunk],
    prebuffer: &[Chunk],
    rx: Receiver<Vec<u8>>,
) -> io::Result<()> {
    for chunk in init.iter().chain(prebuffer.iter()) {
        stdin.write_all(&chunk.assemble())?;
    }
    for data in rx.iter() {
        stdin.write_all(&data)?;
    }
    Ok(())
}

/// Reads the recording transcoder's output and turns each moof+mdat pair
/// into a dataSend event frame.
struct EventStream {
    stdout: ChildStdout,
    conn: Arc<Mutex<HdsConnection>>,
    stream_id: i64,
    fragment_total: i64,
}

impl EventStream {
    fn run(self) {
        let mut reader = ChunkReader::new(BufReader::new(self.stdout));
        let mut sequencer = ChunkSequencer::new(self.fragment_total);
        let mut pending: Vec<Chunk> = Vec::new();

        let result: Result<()> = loop {
            match reader.next_chunk() {
                Ok(Some(chunk)) => {
                    pending.push(chunk);
                    if pending.len() == 2 {
                        let pair = std::mem::take(&mut pending);
                        let meta = sequencer.next_pair();
                        let event = data_event(self.stream_id, &pair, &meta);
                        if let Err(e) = self.conn.lock().unwrap().send(&event) {
                            break Err(e.into());
                        }
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };

        match result {
            Ok(()) => info!("recording transcoder finished"),
            Err(e) => warn!("recording stream ended: {:#}", e),
        }

        // Unblock the control loop; the transcoder going away ends the
        // session either way.
        let _ = self.conn.lock().unwrap().stream.shutdown(Shutdown::Both);
    }
}

/// Sequencing metadata for one emitted chunk pair.
#[derive(Debug, Clone, PartialEq)]
struct PacketMetadata {
    data_type: &'static str,
    data_sequence_number: i64,
    data_chunk_sequence_number: i64,
    is_last_data_chunk: bool,
}

/// Tracks data sequence and chunk numbering across emitted pairs. The first
/// pair is the initialization pair; every fragment thereafter spans
/// `fragment_total` pairs.
struct ChunkSequencer {
    data_sequence: i64,
    chunk_sequence: i64,
    fragment_total: i64,
    sent_init: bool,
}

impl ChunkSequencer {
    fn new(fragment_total: i64) -> Self {
        Self {
            data_sequence: 1,
            chunk_sequence: 1,
            fragment_total,
            sent_init: false,
        }
    }

    fn next_pair(&mut self) -> PacketMetadata {
        if !self.sent_init {
            self.sent_init = true;
            self.data_sequence = 2;
            self.chunk_sequence = 1;
            return PacketMetadata {
                data_type: DATA_TYPE_MEDIA_INITIALIZATION,
                data_sequence_number: 1,
                data_chunk_sequence_number: 1,
                is_last_data_chunk: true,
            };
        }

        let meta = PacketMetadata {
            data_type: DATA_TYPE_MEDIA_FRAGMENT,
            data_sequence_number: self.data_sequence,
            data_chunk_sequence_number: self.chunk_sequence,
            is_last_data_chunk: self.chunk_sequence == self.fragment_total,
        };
        if meta.is_last_data_chunk {
            self.data_sequence += 1;
            self.chunk_sequence = 1;
        } else {
            self.chunk_sequence += 1;
        }
        meta
    }
}

fn response_payload(protocol: &str, response: &str, id: i64, status: i64) -> Payload {
    Payload::new(
        vec![
            ("protocol", Value::from(protocol)),
            ("response", Value::from(response)),
            ("id", Value::Int(id)),
            ("status", Value::Int(status)),
        ],
        Value::dict(vec![]),
    )
}

fn data_event(stream_id: i64, pair: &[Chunk], meta: &PacketMetadata) -> Payload {
    let mut data = Vec::new();
    for chunk in pair {
        data.extend_from_slice(&chunk.assemble());
    }

    Payload::new(
        vec![
            ("protocol", Value::from(hds::PROTOCOL_DATA_SEND)),
            ("event", Value::from("data")),
        ],
        Value::dict(vec![
            ("streamId", Value::Int(stream_id)),
            ("status", Value::Int(hds::STATUS_SUCCESS)),
            (
                "packets",
                Value::Array(vec![Value::dict(vec![
                    ("data", Value::Bytes(data)),
                    (
                        "metadata",
                        Value::dict(vec![
                            ("dataType", Value::from(meta.data_type)),
                            ("dataSequenceNumber", Value::Int(meta.data_sequence_number)),
                            (
                                "dataChunkSequenceNumber",
                                Value::Int(meta.data_chunk_sequence_number),
                            ),
                            ("isLastDataChunk", Value::Bool(meta.is_last_data_chunk)),
                        ]),
                    ),
                ])]),
            ),
        ]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const CONTROLLER_SALT: [u8; 32] = [0xA1; 32];
    const SHARED_KEY: [u8; 32] = [0xC3; 32];

    fn management(cache: Arc<FragmentCache>, selection: SharedSelection) -> DataStreamManagement {
        DataStreamManagement::new(
            InputConfiguration {
                source: "/dev/video0".to_string(),
                format: "v4l2".to_string(),
                audio: false,
                audio_aac: false,
                timestamp_overlay: false,
                transcoder: "ffmpeg".to_string(),
            },
            EncoderProfile::Cpu,
            cache,
            selection,
        )
    }

    struct Controller {
        stream: TcpStream,
        session: HdsSession,
    }

    impl Controller {
        fn connect(setup: &SetupDataStreamSession) -> Self {
            let stream = TcpStream::connect(("127.0.0.1", setup.port)).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let session =
                HdsSession::new(&CONTROLLER_SALT, &setup.accessory_key_salt, &SHARED_KEY)
                    .unwrap()
                    .swapped();
            Self { stream, session }
        }

        fn send(&mut self, payload: &Payload) {
            let plaintext = payload.encode().unwrap();
            hds::write_frame(&mut self.stream, &mut self.session, &plaintext).unwrap();
        }

        fn recv(&mut self) -> Payload {
            let frame = hds::read_frame(&mut self.stream).unwrap();
            Payload::parse(&frame.open(&mut self.session).unwrap()).unwrap()
        }

        fn hello(&mut self) {
            self.send(&Payload::new(
                vec![
                    ("protocol", Value::from(hds::PROTOCOL_CONTROL)),
                    ("request", Value::from("hello")),
                    ("id", Value::Int(1)),
                ],
                Value::dict(vec![]),
            ));
            let response = self.recv();
            assert_eq!(response.protocol(), Some("control"));
            assert_eq!(response.response(), Some("hello"));
            assert_eq!(response.header_int("id"), Some(1));
            assert_eq!(response.header_int("status"), Some(hds::STATUS_SUCCESS));
        }

        fn open(&mut self, id: i64) -> Payload {
            self.send(&Payload::new(
                vec![
                    ("protocol", Value::from(hds::PROTOCOL_DATA_SEND)),
                    ("request", Value::from("open")),
                    ("id", Value::Int(id)),
                ],
                Value::dict(vec![
                    ("type", Value::from(RECORDING_OPEN_TYPE)),
                    ("target", Value::from("controller")),
                    ("streamId", Value::Int(1)),
                ]),
            ));
            self.recv()
        }
    }

    #[test]
    fn hello_exchange_succeeds() {
        let cache = Arc::new(FragmentCache::with_capacity(8));
        let selection = Arc::new(Mutex::new(None));
        let mgmt = management(cache, selection);

        let setup = mgmt.setup_session(&CONTROLLER_SALT, &SHARED_KEY).unwrap();
        let mut controller = Controller::connect(&setup);
        controller.hello();
    }

    #[test]
    fn open_without_selection_is_rejected_and_session_survives() {
        let cache = Arc::new(FragmentCache::with_capacity(8));
        let selection: SharedSelection = Arc::new(Mutex::new(None));
        let mgmt = management(cache, Arc::clone(&selection));

        let setup = mgmt.setup_session(&CONTROLLER_SALT, &SHARED_KEY).unwrap();
        let mut controller = Controller::connect(&setup);
        controller.hello();

        let response = controller.open(2);
        assert_eq!(response.response(), Some("open"));
        assert_eq!(
            response.header_int("status"),
            Some(hds::STATUS_PROTOCOL_SPECIFIC_ERROR)
        );

        // The session stays in awaiting-open: a later open still gets a
        // response. (With no mother-stream data the recording cannot start,
        // so the status stays non-success even after a selection write.)
        *selection.lock().unwrap() = Some(hsv::standard_selection());
        let response = controller.open(3);
        assert_eq!(response.response(), Some("open"));
        assert_eq!(response.header_int("id"), Some(3));
        assert_eq!(
            response.header_int("status"),
            Some(hds::STATUS_PROTOCOL_SPECIFIC_ERROR)
        );
    }

    #[test]
    fn non_hello_first_frame_closes_the_session() {
        let cache = Arc::new(FragmentCache::with_capacity(8));
        let selection = Arc::new(Mutex::new(None));
        let mgmt = management(cache, selection);

        let setup = mgmt.setup_session(&CONTROLLER_SALT, &SHARED_KEY).unwrap();
        let mut controller = Controller::connect(&setup);

        controller.send(&Payload::new(
            vec![
                ("protocol", Value::from(hds::PROTOCOL_DATA_SEND)),
                ("request", Value::from("open")),
                ("id", Value::Int(1)),
            ],
            Value::dict(vec![("type", Value::from(RECORDING_OPEN_TYPE))]),
        ));

        // The accessory closes the connection without responding.
        assert!(hds::read_frame(&mut controller.stream).is_err());
    }

    #[test]
    fn close_event_ends_the_session() {
        let cache = Arc::new(FragmentCache::with_capacity(8));
        let selection = Arc::new(Mutex::new(None));
        let mgmt = management(cache, selection);

        let setup = mgmt.setup_session(&CONTROLLER_SALT, &SHARED_KEY).unwrap();
        let mut controller = Controller::connect(&setup);
        controller.hello();

        controller.send(&Payload::new(
            vec![
                ("protocol", Value::from(hds::PROTOCOL_DATA_SEND)),
                ("event", Value::from("close")),
            ],
            Value::dict(vec![]),
        ));
        assert!(hds::read_frame(&mut controller.stream).is_err());
    }

    #[test]
    fn sequencer_emits_init_then_numbered_fragments() {
        let mut seq = ChunkSequencer::new(3);

        let init = seq.next_pair();
        assert_eq!(init.data_type, DATA_TYPE_MEDIA_INITIALIZATION);
        assert_eq!(init.data_sequence_number, 1);
        assert_eq!(init.data_chunk_sequence_number, 1);
        assert!(init.is_last_data_chunk);

        let expectations = [
            (2, 1, false),
            (2, 2, false),
            (2, 3, true),
            (3, 1, false),
            (3, 2, false),
            (3, 3, true),
            (4, 1, false),
        ];
        for (data_seq, chunk_seq, last) in expectations {
            let meta = seq.next_pair();
            assert_eq!(meta.data_type, DATA_TYPE_MEDIA_FRAGMENT);
            assert_eq!(meta.data_sequence_number, data_seq);
            assert_eq!(meta.data_chunk_sequence_number, chunk_seq);
            assert_eq!(meta.is_last_data_chunk, last);
        }
    }

    #[test]
    fn standard_selection_spans_twenty_pairs_per_fragment() {
        let selection = hsv::standard_selection();
        let fragment_total =
            (i64::from(selection.fragment_length_ms()) / FRAGMENT_DURATION.as_millis() as i64 / 2)
                .max(1);
        assert_eq!(fragment_total, 20);
    }

    #[test]
    fn data_event_concatenates_the_pair() {
        let moof = Chunk {
            size: 16,
            main_type: "moof".to_string(),
            sub_type: String::new(),
            data: vec![1; 8],
        };
        let mdat = Chunk {
            size: 12,
            main_type: "mdat".to_string(),
            sub_type: String::new(),
            data: vec![2; 4],
        };
        let meta = PacketMetadata {
            data_type: DATA_TYPE_MEDIA_FRAGMENT,
            data_sequence_number: 2,
            data_chunk_sequence_number: 5,
            is_last_data_chunk: false,
        };

        let event = data_event(7, &[moof.clone(), mdat.clone()], &meta);
        assert_eq!(event.protocol(), Some("dataSend"));
        assert_eq!(event.event(), Some("data"));

        let message = &event.message;
        assert_eq!(message.get("streamId").and_then(Value::as_int), Some(7));
        let packets = match message.get("packets") {
            Some(Value::Array(p)) => p,
            other => panic!("unexpected packets value {:?}", other),
        };
        assert_eq!(packets.len(), 1);

        let mut expected = moof.assemble();
        expected.extend_from_slice(&mdat.assemble());
        assert_eq!(
            packets[0].get("data").and_then(Value::as_bytes),
            Some(expected.as_slice())
        );
        let metadata = packets[0].get("metadata").unwrap();
        assert_eq!(
            metadata.get("dataSequenceNumber").and_then(Value::as_int),
            Some(2)
        );
        assert_eq!(
            metadata.get("isLastDataChunk"),
            Some(&Value::Bool(false))
        );
    }

    #[test]
    fn round_trips_the_exchange_payloads() {
        // The canonical hello exchange bodies survive a frame round trip.
        let mut accessory = HdsSession::new(&[0xA1; 32], &[0xB2; 32], &[0xC3; 32]).unwrap();
        let mut controller = HdsSession::new(&[0xA1; 32], &[0xB2; 32], &[0xC3; 32])
            .unwrap()
            .swapped();

        let response = response_payload(hds::PROTOCOL_CONTROL, "hello", 1, hds::STATUS_SUCCESS);
        let mut wire = Vec::new();
        hds::write_frame(&mut wire, &mut accessory, &response.encode().unwrap()).unwrap();

        let frame = hds::read_frame(&mut &wire[..]).unwrap();
        let parsed = Payload::parse(&frame.open(&mut controller).unwrap()).unwrap();
        assert_eq!(parsed.response(), Some("hello"));
        assert_eq!(parsed.header_int("status"), Some(0));
        assert_eq!(parsed.message, Value::dict(vec![]));
    }
}
