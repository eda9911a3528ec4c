//! The mother stream: one always-on transcoder whose fragmented MP4 output
//! feeds the fragment cache and fans out to live consumers.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufReader, Write};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;

use crate::camera::{EncoderProfile, InputConfiguration};
use crate::ffmpeg::{self, KillOnDrop, FRAGMENT_DURATION};
use crate::hsv::PREBUFFER_LENGTH;
use crate::mp4::{Chunk, ChunkReader, FTYP};

const RESPAWN_DELAY: Duration = Duration::from_secs(5);

/// A sink receiving every serialized mother-stream chunk.
pub type ConsumerSink = Box<dyn Write + Send>;

/// Write half of a channel. Recording sessions register one of these as a
/// consumer and drain the receive half into their transcoder's stdin.
pub struct ChannelWriter(pub Sender<Vec<u8>>);

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct CacheState {
    init_chunks: Option<Vec<Chunk>>,
    prebuffer: VecDeque<Chunk>,
    consumers: HashMap<String, ConsumerSink>,
}

/// Per-camera cache of the current mother-stream run: the one-shot init
/// pair, the bounded pre-buffer and the live consumer set. All state sits
/// behind one mutex so readers always observe a consistent snapshot.
pub struct FragmentCache {
    state: Mutex<CacheState>,
    capacity: usize,
}

impl FragmentCache {
    pub fn new() -> Self {
        Self::with_capacity(default_capacity())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity,
        }
    }

    /// The ftyp+moov pair, once the current run has produced it.
    pub fn init_chunks(&self) -> Option<Vec<Chunk>> {
        self.state.lock().unwrap().init_chunks.clone()
    }

    pub fn prebuffer_snapshot(&self) -> Vec<Chunk> {
        self.state
            .lock()
            .unwrap()
            .prebuffer
            .iter()
            .cloned()
            .collect()
    }

    /// Registers a consumer and snapshots the cache in one step, so the
    /// caller sees every chunk exactly once: the snapshot first, then the
    /// live feed. Fails while the init pair is still missing.
    pub fn attach(&self, key: String, sink: ConsumerSink) -> Option<(Vec<Chunk>, Vec<Chunk>)> {
        let mut state = self.state.lock().unwrap();
        let init = state.init_chunks.clone()?;
        let prebuffer = state.prebuffer.iter().cloned().collect();
        state.consumers.insert(key, sink);
        Some((init, prebuffer))
    }

    pub fn detach(&self, key: &str) {
        self.state.lock().unwrap().consumers.remove(key);
    }

    #[cfg(test)]
    fn consumer_count(&self) -> usize {
        self.state.lock().unwrap().consumers.len()
    }

    /// Feeds one parsed chunk in. Chunks are committed in pairs: the first
    /// ftyp-led pair becomes the init chunks, every later pair goes to the
    /// pre-buffer with FIFO eviction. Each chunk is fanned out to the
    /// consumers as it arrives; a failed write evicts that consumer.
    fn ingest(&self, chunk: Chunk, pending: &mut Vec<Chunk>) {
        let mut state = self.state.lock().unwrap();
        let assembled = chunk.assemble();
        pending.push(chunk);

        if pending.len() == 2 {
            let pair = std::mem::take(pending);
            if pair[0].main_type == FTYP {
                if state.init_chunks.is_none() {
                    debug!("captured init chunks");
                    state.init_chunks = Some(pair);
                }
            } else {
                for c in pair {
                    if state.prebuffer.len() >= self.capacity {
                        state.prebuffer.pop_front();
                    }
                    state.prebuffer.push_back(c);
                }
            }
        }

        let mut dead = Vec::new();
        for (key, sink) in state.consumers.iter_mut() {
            if sink.write_all(&assembled).is_err() {
                dead.push(key.clone());
            }
        }
        for key in dead {
            warn!("dropping live consumer {}", key);
            state.consumers.remove(&key);
        }
    }

    /// Forgets the finished run. Consumers stay registered; they pick up
    /// again from the next run's output.
    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.init_chunks = None;
        state.prebuffer.clear();
    }
}

impl Default for FragmentCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `ceil(prebuffer / fragment duration)`, tripled to absorb jitter.
fn default_capacity() -> usize {
    (PREBUFFER_LENGTH
        .as_millis()
        .div_ceil(FRAGMENT_DURATION.as_millis())
        * 3) as usize
}

/// Runs the mother stream forever, respawning the transcoder after every
/// exit with a fixed back-off.
pub fn spawn(
    input: InputConfiguration,
    profile: EncoderProfile,
    cache: Arc<FragmentCache>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        if let Err(e) = run_once(&input, profile, &cache) {
            error!("mother stream failed: {:#}", e);
        }
        cache.reset();
        info!(
            "mother stream terminated, restarting in {}s",
            RESPAWN_DELAY.as_secs()
        );
        thread::sleep(RESPAWN_DELAY);
    })
}

fn run_once(
    input: &InputConfiguration,
    profile: EncoderProfile,
    cache: &FragmentCache,
) -> Result<()> {
    let args = ffmpeg::mother_stream_arguments(input, profile);
    let mut child = KillOnDrop(
        ffmpeg::spawn(&input.transcoder, &args, Stdio::null(), Stdio::piped())
            .context("spawning the mother stream transcoder")?,
    );
    let stdout = child
        .0
        .stdout
        .take()
        .ok_or_else(|| anyhow!("mother stream transcoder has no stdout"))?;
    info!("mother stream transcoder running, pid {}", child.id());

    let mut reader = ChunkReader::new(BufReader::with_capacity(1_000_000, stdout));
    let mut pending = Vec::new();
    while let Some(chunk) = reader.next_chunk()? {
        cache.ingest(chunk, &mut pending);
    }
    Ok(())
}
