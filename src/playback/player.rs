//! Jitter-buffered player
//!
//! A single actor task owns the playback queue. Chunks are appended by
//! [`Player::enqueue`]; the first chunk to land in an idle player arms a
//! drain check `jitter_window` later, so a burst of chunks is coalesced
//! into one unit. A drain takes the whole queue, splices it into one
//! buffer, fades its edges and plays it. At most one unit plays at a time;
//! chunks arriving meanwhile are drained as soon as it finishes.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::envelope;
use super::level::{self, LevelMode, LEVEL_INTERVAL};
use crate::audio::pcm::{self, PLAYBACK_SAMPLE_RATE};
use crate::audio::{AudioOutput, PlaybackUnit};
use crate::error::DecodeError;

/// Output gain applied to received speech
pub const PLAYBACK_GAIN: f32 = 1.5;

/// Raw PCM received from the backend, waiting to be played
#[derive(Debug, Clone)]
pub struct PlaybackChunk {
    bytes: Vec<u8>,
    arrived_at: Instant,
}

impl PlaybackChunk {
    /// Wrap raw int16 LE bytes. Odd-length buffers are rejected.
    pub fn new(bytes: Vec<u8>) -> Result<Self, DecodeError> {
        if bytes.len() % 2 != 0 {
            return Err(DecodeError::OddLength(bytes.len()));
        }
        Ok(Self {
            bytes,
            arrived_at: Instant::now(),
        })
    }

    /// Decode a base64 `audio` payload from the wire.
    pub fn from_base64(payload: &str) -> Result<Self, DecodeError> {
        Self::new(pcm::from_base64(payload)?)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Player tuning
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// How long the first chunk of a burst waits for the rest of it
    pub jitter_window: Duration,
    pub sample_rate: u32,
    pub level_mode: LevelMode,
    pub level_interval: Duration,
    /// Applied after the edge fades, clipped at full scale
    pub gain: f32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            jitter_window: Duration::from_millis(150),
            sample_rate: PLAYBACK_SAMPLE_RATE,
            level_mode: LevelMode::default(),
            level_interval: LEVEL_INTERVAL,
            gain: PLAYBACK_GAIN,
        }
    }
}

/// Lifecycle notifications, mainly for instrumentation and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    UnitStarted { id: u64, byte_len: usize, chunk_count: usize },
    UnitFinished { id: u64 },
    UnitFailed { id: u64 },
    Interrupted { discarded_chunks: usize, halted_unit: Option<u64> },
}

/// Snapshot of player counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlayerStats {
    pub queued_chunks: usize,
    pub queued_bytes: usize,
    pub draining: bool,
    pub units_played: u64,
    pub bytes_played: u64,
    pub interrupts: u64,
}

enum Command {
    Enqueue(PlaybackChunk),
    Interrupt(oneshot::Sender<()>),
    Stats(oneshot::Sender<PlayerStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the player actor. Cheap to clone.
#[derive(Clone)]
pub struct Player {
    tx: mpsc::UnboundedSender<Command>,
    level_rx: watch::Receiver<f32>,
    events: broadcast::Sender<PlayerEvent>,
}

impl Player {
    /// Spawn the player actor on the current runtime.
    pub fn spawn(output: Arc<dyn AudioOutput>, config: PlayerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (level_tx, level_rx) = watch::channel(0.0);
        let (events, _) = broadcast::channel(64);

        info!(
            "Player started on {} output (jitter window {:?}, level {:?})",
            output.name(),
            config.jitter_window,
            config.level_mode
        );

        let actor = PlayerActor {
            output,
            config,
            queue: VecDeque::new(),
            drain_deadline: None,
            current: None,
            next_unit_id: 1,
            level_tx,
            events: events.clone(),
            stats: PlayerStats::default(),
        };
        tokio::spawn(actor.run(rx));

        Self { tx, level_rx, events }
    }

    /// Append a chunk to the queue. Never blocks.
    pub fn enqueue(&self, chunk: PlaybackChunk) {
        if self.tx.send(Command::Enqueue(chunk)).is_err() {
            warn!("Player has shut down, dropping audio chunk");
        }
    }

    /// Stop the playing unit, discard everything queued and zero the level.
    ///
    /// Resolves once the player has released the unit.
    pub async fn interrupt(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Interrupt(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub async fn stats(&self) -> PlayerStats {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Stats(reply_tx)).is_err() {
            return PlayerStats::default();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Halt playback and stop the actor.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Observable playback level in [0, 100], 0 while idle
    pub fn level(&self) -> watch::Receiver<f32> {
        self.level_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }
}

struct InFlight {
    unit: Arc<PlaybackUnit>,
    task: JoinHandle<anyhow::Result<()>>,
    started_at: Instant,
}

struct PlayerActor {
    output: Arc<dyn AudioOutput>,
    config: PlayerConfig,
    queue: VecDeque<PlaybackChunk>,
    drain_deadline: Option<Instant>,
    current: Option<InFlight>,
    next_unit_id: u64,
    level_tx: watch::Sender<f32>,
    events: broadcast::Sender<PlayerEvent>,
    stats: PlayerStats,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_in_flight(current: &mut Option<InFlight>) -> Result<anyhow::Result<()>, JoinError> {
    match current {
        Some(in_flight) => (&mut in_flight.task).await,
        None => std::future::pending().await,
    }
}

fn level_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

impl PlayerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = level_ticker(self.config.level_interval);

        loop {
            let drain_at = if self.current.is_none() {
                self.drain_deadline
            } else {
                None
            };
            let playing = self.current.is_some();

            tokio::select! {
                biased;

                cmd = rx.recv() => match cmd {
                    Some(Command::Enqueue(chunk)) => self.enqueue(chunk),
                    Some(Command::Interrupt(ack)) => {
                        self.interrupt().await;
                        let _ = ack.send(());
                    }
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.interrupt().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.interrupt().await;
                        break;
                    }
                },

                result = wait_in_flight(&mut self.current) => {
                    self.finish_unit(result);
                    if !self.queue.is_empty() {
                        self.drain();
                        ticker = level_ticker(self.config.level_interval);
                    }
                }

                _ = sleep_until_opt(drain_at) => {
                    self.drain_deadline = None;
                    self.drain();
                    ticker = level_ticker(self.config.level_interval);
                }

                _ = ticker.tick(), if playing => self.update_level(),
            }
        }

        debug!("Player actor stopped");
    }

    fn enqueue(&mut self, chunk: PlaybackChunk) {
        if chunk.is_empty() {
            return;
        }
        self.queue.push_back(chunk);
        if self.current.is_none() && self.drain_deadline.is_none() {
            self.drain_deadline = Some(Instant::now() + self.config.jitter_window);
        }
    }

    /// Take every queued chunk and start playing them as one unit.
    fn drain(&mut self) {
        if self.current.is_some() || self.queue.is_empty() {
            return;
        }

        let chunks: Vec<PlaybackChunk> = self.queue.drain(..).collect();
        let byte_len: usize = chunks.iter().map(PlaybackChunk::len).sum();
        let waited = chunks[0].arrived_at.elapsed();

        let mut bytes = Vec::with_capacity(byte_len);
        for chunk in &chunks {
            bytes.extend_from_slice(&chunk.bytes);
        }

        // Every chunk was length-checked on the way in.
        let mut samples = match pcm::decode_frame(&bytes) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Dropping {} undecodable chunks: {}", chunks.len(), e);
                return;
            }
        };
        envelope::apply_edge_fades(&mut samples);
        envelope::apply_gain(&mut samples, self.config.gain);

        let id = self.next_unit_id;
        self.next_unit_id += 1;
        let unit = Arc::new(PlaybackUnit {
            id,
            samples,
            sample_rate: self.config.sample_rate,
            byte_len,
            chunk_count: chunks.len(),
        });

        debug!(
            "Playing unit {}: {} chunks, {} bytes, {:?} of audio, first chunk waited {:?}",
            id,
            unit.chunk_count,
            byte_len,
            unit.duration(),
            waited
        );

        let output = Arc::clone(&self.output);
        let playing = Arc::clone(&unit);
        let task = tokio::spawn(async move { output.play(&playing).await });

        self.current = Some(InFlight {
            unit,
            task,
            started_at: Instant::now(),
        });
        let _ = self.events.send(PlayerEvent::UnitStarted {
            id,
            byte_len,
            chunk_count: chunks.len(),
        });
    }

    fn finish_unit(&mut self, result: Result<anyhow::Result<()>, JoinError>) {
        let Some(in_flight) = self.current.take() else {
            return;
        };
        let id = in_flight.unit.id;
        self.level_tx.send_replace(0.0);

        match result {
            Ok(Ok(())) => {
                self.stats.units_played += 1;
                self.stats.bytes_played += in_flight.unit.byte_len as u64;
                let _ = self.events.send(PlayerEvent::UnitFinished { id });
            }
            Ok(Err(e)) => {
                warn!("Output {} failed to play unit {}: {:#}", self.output.name(), id, e);
                let _ = self.events.send(PlayerEvent::UnitFailed { id });
            }
            Err(e) => {
                warn!("Playback task for unit {} ended abnormally: {}", id, e);
                let _ = self.events.send(PlayerEvent::UnitFailed { id });
            }
        }
    }

    async fn interrupt(&mut self) {
        let halted_unit = match self.current.take() {
            Some(in_flight) => {
                in_flight.task.abort();
                self.output.halt();
                let _ = in_flight.task.await;
                Some(in_flight.unit.id)
            }
            None => None,
        };
        let discarded_chunks = self.queue.len();
        self.queue.clear();
        self.drain_deadline = None;
        self.level_tx.send_replace(0.0);
        self.stats.interrupts += 1;

        if halted_unit.is_some() || discarded_chunks > 0 {
            info!(
                "Playback interrupted (unit {:?} halted, {} queued chunks discarded)",
                halted_unit, discarded_chunks
            );
        }
        let _ = self.events.send(PlayerEvent::Interrupted {
            discarded_chunks,
            halted_unit,
        });
    }

    fn update_level(&mut self) {
        if let Some(in_flight) = &self.current {
            let level = level::playback_level(
                self.config.level_mode,
                &in_flight.unit,
                in_flight.started_at.elapsed(),
                self.config.level_interval,
            );
            self.level_tx.send_replace(level);
        }
    }

    fn snapshot(&self) -> PlayerStats {
        PlayerStats {
            queued_chunks: self.queue.len(),
            queued_bytes: self.queue.iter().map(PlaybackChunk::len).sum(),
            draining: self.current.is_some(),
            ..self.stats.clone()
        }
    }
}
