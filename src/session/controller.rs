//! Session controller
//!
//! One actor task owns the session: its state, the backend connection, the
//! reconnect schedule, the capture pipeline and the player handle. The
//! [`SessionController`] handle sends it commands; observers follow it
//! through watch and broadcast channels.
//!
//! Every connection gets a new generation number and tags its events with
//! it, so events from a connection that has already been replaced (a late
//! close, a stale reader) are ignored.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::location::{LanguageCode, LocationSummary};
use super::state::{SessionState, SessionStatus, StateTransition};
use super::transcript::{SpeakingFlags, TranscriptLog, TranscriptUpdate, Utterance};
use crate::audio::{AudioInput, AudioOutput, CapturePipeline, CapturedFrame};
use crate::error::{CaptureError, SessionError, TransportError};
use crate::playback::{PlaybackChunk, Player, PlayerStats};
use crate::transport::{
    ClientMessage, CloseReason, Connection, ConnectionEvent, Generation, ReconnectState,
    ServerMessage, Speaker, TranscriptionEvent, TransportEvent,
};

/// Observables for the presentation layer
#[derive(Clone)]
pub struct SessionObservers {
    pub state: watch::Receiver<SessionState>,
    pub status: watch::Receiver<SessionStatus>,
    pub capture_level: watch::Receiver<f32>,
    pub playback_level: watch::Receiver<f32>,
    pub speaking: watch::Receiver<SpeakingFlags>,
    transcript: broadcast::Sender<TranscriptUpdate>,
    transitions: broadcast::Sender<StateTransition>,
}

impl SessionObservers {
    pub fn connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Transcript changes from now on
    pub fn transcript(&self) -> broadcast::Receiver<TranscriptUpdate> {
        self.transcript.subscribe()
    }

    /// Every state change from now on, unlike `state` which only keeps the latest
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }
}

/// Counters for status endpoints and tests
#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    pub generation: Generation,
    pub frames_sent: u64,
    /// Frames lost before reaching the connection (slow consumer)
    pub frames_dropped: u64,
    /// Frames refused because the socket writer was behind
    pub media_dropped: u64,
    pub audio_chunks_received: u64,
    pub malformed_frames: u64,
    pub player: PlayerStats,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect(Reply<()>),
    StartInteraction {
        location: Option<LocationSummary>,
        language: Option<LanguageCode>,
        reply: Reply<Result<(), SessionError>>,
    },
    StopInteraction(Reply<Result<(), SessionError>>),
    Interrupt(Reply<()>),
    Retry(Reply<()>),
    SendText {
        text: String,
        reply: Reply<Result<(), SessionError>>,
    },
    RequestSessionStatus(Reply<Result<(), SessionError>>),
    Transcript(Reply<Vec<Utterance>>),
    Diagnostics(Reply<SessionDiagnostics>),
    Shutdown(Reply<()>),
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionController {
    tx: mpsc::UnboundedSender<Command>,
    observers: SessionObservers,
}

impl SessionController {
    /// Validate `config` and spawn the controller actor.
    ///
    /// The controller starts `Disconnected`; call [`connect`](Self::connect).
    pub fn spawn(
        config: SessionConfig,
        input: Box<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let (tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(config.capture.max_pending_frames.max(1));
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (status_tx, status_rx) = watch::channel(SessionStatus::initial());
        let (speaking_tx, speaking_rx) = watch::channel(SpeakingFlags::default());
        let (transcript_tx, _) = broadcast::channel(256);
        let (transitions_tx, _) = broadcast::channel(64);

        let capture = CapturePipeline::new(config.capture.clone());
        let player = Player::spawn(output, config.player.clone());

        let observers = SessionObservers {
            state: state_rx,
            status: status_rx,
            capture_level: capture.level(),
            playback_level: player.level(),
            speaking: speaking_rx,
            transcript: transcript_tx.clone(),
            transitions: transitions_tx.clone(),
        };

        info!(
            "Session controller for {} (input {}, language {})",
            config.backend_url,
            input.name(),
            config.language
        );

        let actor = ControllerActor {
            reconnect: ReconnectState::new(config.reconnect.clone()),
            config,
            state: SessionState::Disconnected,
            connection: None,
            generation: 0,
            events_tx,
            handshake_deadline: None,
            reconnect_at: None,
            capture,
            input: Some(input),
            frames_tx,
            handoff_dropped: Arc::new(AtomicU64::new(0)),
            interaction_epoch: 0,
            player,
            transcript: TranscriptLog::new(),
            state_tx,
            status_tx,
            speaking_tx,
            transcript_tx,
            transitions_tx,
            frames_sent: 0,
            media_dropped: 0,
            audio_chunks_received: 0,
            malformed_frames: 0,
        };
        tokio::spawn(actor.run(commands, events_rx, frames_rx));

        Ok(Self { tx, observers })
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| SessionError::ControllerGone)?;
        reply_rx.await.map_err(|_| SessionError::ControllerGone)
    }

    /// Open the backend connection. Returns once the attempt has started.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(Command::Connect).await
    }

    /// Start capturing and streaming microphone audio.
    ///
    /// Only valid while connected and idle.
    pub async fn start_interaction(
        &self,
        location: Option<LocationSummary>,
        language: Option<LanguageCode>,
    ) -> Result<(), SessionError> {
        self.request(|reply| Command::StartInteraction {
            location,
            language,
            reply,
        })
        .await?
    }

    pub async fn stop_interaction(&self) -> Result<(), SessionError> {
        self.request(Command::StopInteraction).await?
    }

    /// Silence the agent locally. Valid in any state.
    pub async fn interrupt(&self) -> Result<(), SessionError> {
        self.request(Command::Interrupt).await
    }

    /// Reset the attempt counter and connect again.
    pub async fn retry(&self) -> Result<(), SessionError> {
        self.request(Command::Retry).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply }).await?
    }

    /// Ask the backend for a `session_status` report.
    pub async fn request_session_status(&self) -> Result<(), SessionError> {
        self.request(Command::RequestSessionStatus).await?
    }

    pub async fn transcript(&self) -> Result<Vec<Utterance>, SessionError> {
        self.request(Command::Transcript).await
    }

    pub async fn diagnostics(&self) -> Result<SessionDiagnostics, SessionError> {
        self.request(Command::Diagnostics).await
    }

    /// Stop capture and playback, close the connection and end the actor.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(Command::Shutdown).await
    }

    /// Wait up to `timeout` for the session to reach `target`.
    ///
    /// Returns false on timeout or when the controller has gone away.
    pub async fn wait_for_state(&self, target: SessionState, timeout: Duration) -> bool {
        let mut state = self.observers.state.clone();
        // Release the watch guard before returning so the actor can publish again
        tokio::time::timeout(timeout, state.wait_for(|s| *s == target))
            .await
            .map(|reached| reached.is_ok())
            .unwrap_or(false)
    }

    pub fn observe(&self) -> SessionObservers {
        self.observers.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.observers.state.borrow()
    }

    pub fn status(&self) -> SessionStatus {
        self.observers.status.borrow().clone()
    }
}

struct ControllerActor {
    config: SessionConfig,
    state: SessionState,
    reconnect: ReconnectState,

    connection: Option<Connection>,
    generation: Generation,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    handshake_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,

    capture: CapturePipeline,
    /// Parked here whenever capture is not running
    input: Option<Box<dyn AudioInput>>,
    frames_tx: mpsc::Sender<(u64, CapturedFrame)>,
    handoff_dropped: Arc<AtomicU64>,
    interaction_epoch: u64,

    player: Player,
    transcript: TranscriptLog,

    state_tx: watch::Sender<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
    speaking_tx: watch::Sender<SpeakingFlags>,
    transcript_tx: broadcast::Sender<TranscriptUpdate>,
    transitions_tx: broadcast::Sender<StateTransition>,

    frames_sent: u64,
    media_dropped: u64,
    audio_chunks_received: u64,
    malformed_frames: u64,
}

impl ControllerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut frames: mpsc::Receiver<(u64, CapturedFrame)>,
    ) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_connection_event(event).await,
                Some((epoch, frame)) = frames.recv() => self.forward_frame(epoch, frame),
                _ = sleep_until_opt(self.handshake_deadline) => {
                    self.handshake_deadline = None;
                    warn!("No setup_complete within {:?}", self.config.connect_timeout);
                    self.connection_lost("handshake timed out".to_string()).await;
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    info!("Reconnecting (attempt {})", self.reconnect.attempts());
                    self.open_connection();
                }
            }
        }
        debug!("Session controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                self.connect();
                let _ = reply.send(());
            }
            Command::StartInteraction {
                location,
                language,
                reply,
            } => {
                let result = self.start_interaction(location, language).await;
                let _ = reply.send(result);
            }
            Command::StopInteraction(reply) => {
                let result = self.stop_interaction().await;
                let _ = reply.send(result);
            }
            Command::Interrupt(reply) => {
                info!("Interrupt requested");
                self.player.interrupt().await;
                let _ = reply.send(());
            }
            Command::Retry(reply) => {
                info!("Manual retry requested");
                self.reconnect.reset();
                self.reconnect_at = None;
                if !self.state.is_connected() {
                    self.open_connection();
                }
                let _ = reply.send(());
            }
            Command::SendText { text, reply } => {
                let result = self.send_if_connected(ClientMessage::Text { text });
                let _ = reply.send(result);
            }
            Command::RequestSessionStatus(reply) => {
                let result = self.send_if_connected(ClientMessage::GetSessionStatus {});
                let _ = reply.send(result);
            }
            Command::Transcript(reply) => {
                let _ = reply.send(self.transcript.utterances().to_vec());
            }
            Command::Diagnostics(reply) => {
                let diagnostics = SessionDiagnostics {
                    generation: self.generation,
                    frames_sent: self.frames_sent,
                    frames_dropped: self.capture.dropped_frames()
                        + self.handoff_dropped.load(Ordering::Relaxed),
                    media_dropped: self.media_dropped,
                    audio_chunks_received: self.audio_chunks_received,
                    malformed_frames: self.malformed_frames,
                    player: self.player.stats().await,
                };
                let _ = reply.send(diagnostics);
            }
            Command::Shutdown(reply) => {
                // Handled in the run loop
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self) {
        match self.state {
            SessionState::Disconnected => self.open_connection(),
            SessionState::Connecting if self.connection.is_none() => {
                // Waiting out a backoff delay: go now
                self.reconnect_at = None;
                self.open_connection();
            }
            state => debug!("connect() ignored while {}", state),
        }
    }

    fn open_connection(&mut self) {
        if let Some(old) = self.connection.take() {
            old.close();
        }
        self.generation += 1;
        self.connection = Some(Connection::open(
            self.config.backend_url.clone(),
            self.generation,
            self.config.connect_timeout,
            self.events_tx.clone(),
        ));
        self.handshake_deadline = Some(Instant::now() + self.config.connect_timeout);
        self.set_state(SessionState::Connecting);
        let message = match self.reconnect.attempts() {
            0 => "Connecting...".to_string(),
            n => format!("Reconnecting (attempt {})...", n),
        };
        self.set_status(Some(message));
    }

    async fn start_interaction(
        &mut self,
        location: Option<LocationSummary>,
        language: Option<LanguageCode>,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::ConnectedIdle {
            info!("start_interaction ignored while {}", self.state);
            return Err(SessionError::NotReady(self.state));
        }

        let input = match self.input.take() {
            Some(input) => input,
            None => {
                return Err(CaptureError::DeviceUnavailable("no input device".to_string()).into())
            }
        };

        self.interaction_epoch += 1;
        let epoch = self.interaction_epoch;
        let frames_tx = self.frames_tx.clone();
        let dropped = Arc::clone(&self.handoff_dropped);
        let on_frame = Box::new(move |frame: CapturedFrame| {
            if let Err(mpsc::error::TrySendError::Full(_)) = frames_tx.try_send((epoch, frame)) {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
        });

        if let Err((e, input)) = self.capture.start(input, on_frame).await {
            self.input = Some(input);
            warn!("Could not start capture: {}", e);
            self.set_status(Some(format!("Microphone unavailable: {}", e)));
            return Err(e.into());
        }

        let language = language.unwrap_or_else(|| self.config.language.clone());
        info!(
            "Starting interaction (language {}, location {})",
            language,
            location
                .as_ref()
                .map(|l| l.formatted_for_ai.as_str())
                .unwrap_or("unknown")
        );
        self.send(ClientMessage::StartInteraction {
            location,
            language: language.to_string(),
        });
        self.set_state(SessionState::Interacting);
        self.set_status(Some("Listening".to_string()));
        Ok(())
    }

    async fn stop_interaction(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Interacting {
            debug!("stop_interaction ignored while {}", self.state);
            return Err(SessionError::NotReady(self.state));
        }
        self.send(ClientMessage::StopInteraction {});
        self.stop_capture().await;
        self.set_state(SessionState::ConnectedIdle);
        self.set_status(Some("Connected".to_string()));
        Ok(())
    }

    async fn stop_capture(&mut self) {
        if let Some(input) = self.capture.stop().await {
            self.input = Some(input);
        }
    }

    fn forward_frame(&mut self, epoch: u64, frame: CapturedFrame) {
        if epoch != self.interaction_epoch || self.state != SessionState::Interacting {
            return;
        }
        let Some(connection) = &self.connection else {
            return;
        };
        match connection.send_media(frame.chunk) {
            Ok(()) => {
                self.frames_sent += 1;
                if self.frames_sent % 50 == 0 {
                    debug!("Sent {} audio frames (level {:.1})", self.frames_sent, frame.level);
                }
            }
            Err(TransportError::QueueFull) => {
                self.media_dropped += 1;
                if self.media_dropped % 10 == 1 {
                    warn!("Backend not keeping up, {} audio frames dropped", self.media_dropped);
                }
            }
            Err(e) => debug!("Audio frame not sent: {}", e),
        }
    }

    fn send(&mut self, message: ClientMessage) {
        match &self.connection {
            Some(connection) => {
                if let Err(e) = connection.send(message) {
                    warn!("Failed to queue message: {}", e);
                }
            }
            None => debug!("No connection, dropping '{}'", message.name()),
        }
    }

    fn send_if_connected(&mut self, message: ClientMessage) -> Result<(), SessionError> {
        if !self.state.is_connected() {
            return Err(SessionError::NotReady(self.state));
        }
        self.send(message);
        Ok(())
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        if event.generation != self.generation || self.connection.is_none() {
            debug!(
                "Ignoring event from stale connection {} (current {})",
                event.generation, self.generation
            );
            return;
        }

        match event.event {
            TransportEvent::Opened => {
                self.send(ClientMessage::setup(self.config.user_id.clone()));
            }
            TransportEvent::Message(message) => self.handle_server_message(message).await,
            TransportEvent::Malformed(_) => {
                self.malformed_frames += 1;
            }
            TransportEvent::Failed(e) => self.connection_lost(e.to_string()).await,
            TransportEvent::Closed(CloseReason::Lost(reason)) => self.connection_lost(reason).await,
            TransportEvent::Closed(CloseReason::ServerInitiated) => self.server_disconnected().await,
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::SetupComplete(_) => {
                if self.state != SessionState::Connecting {
                    debug!("Duplicate setup_complete while {}", self.state);
                    return;
                }
                self.handshake_deadline = None;
                self.reconnect.reset();
                info!("Session established");
                self.set_state(SessionState::ConnectedIdle);
                self.set_status(Some("Connected".to_string()));
            }
            ServerMessage::Audio { audio } => match PlaybackChunk::from_base64(&audio) {
                Ok(chunk) => {
                    self.audio_chunks_received += 1;
                    self.player.enqueue(chunk);
                }
                Err(e) => warn!("Dropping undecodable audio chunk: {}", e),
            },
            ServerMessage::Interrupted => {
                info!("Backend interrupted the agent");
                self.player.interrupt().await;
            }
            ServerMessage::Transcription(event) => self.record_transcription(event),
            ServerMessage::Text { text } => self.record_transcription(TranscriptionEvent {
                text,
                sender: Speaker::Agent,
                finished: Some(true),
            }),
            ServerMessage::InteractionStarted(data) => info!("Interaction started: {}", data),
            ServerMessage::InteractionStopped(data) => info!("Interaction stopped: {}", data),
            ServerMessage::SessionCreated(data) => info!("Session created: {}", data),
            ServerMessage::SessionStatus(report) => {
                if report.counter_accurate {
                    info!("Session status: {:?}", report.details);
                    return;
                }
                warn!("Backend reports inaccurate session counter: {:?}", report.details);
                self.status_tx.send_modify(|status| {
                    status.warning = Some("Session counter is out of sync on the server".to_string());
                    status.updated_at = Utc::now();
                });
            }
        }
    }

    fn record_transcription(&mut self, event: TranscriptionEvent) {
        let update = self.transcript.apply(&event);
        self.speaking_tx.send_replace(SpeakingFlags::after(&event));
        let _ = self.transcript_tx.send(update);
    }

    /// Unexpected loss or failed open: back off and try again, or give up.
    async fn connection_lost(&mut self, reason: String) {
        if self.state == SessionState::Disconnected {
            return;
        }
        warn!("Connection lost while {}: {}", self.state, reason);
        self.drop_connection().await;

        match self.reconnect.next_delay() {
            Some(delay) => {
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_state(SessionState::Connecting);
                self.set_status(Some(format!(
                    "Connection lost. Reconnecting in {}s...",
                    delay.as_secs_f64().ceil()
                )));
            }
            None => {
                error!(
                    "Giving up after {} reconnect attempts",
                    self.reconnect.attempts()
                );
                self.set_state(SessionState::Disconnected);
                self.set_status(Some(
                    "Unable to connect to the server. Please try again later.".to_string(),
                ));
            }
        }
    }

    async fn server_disconnected(&mut self) {
        info!("Server closed the session");
        self.drop_connection().await;
        self.reconnect_at = None;
        self.set_state(SessionState::Disconnected);
        self.set_status(Some("Server disconnected".to_string()));
    }

    /// Release the connection and everything tied to it. The interaction is
    /// not resumed on reconnect.
    async fn drop_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.handshake_deadline = None;
        self.stop_capture().await;
        self.player.interrupt().await;
        self.speaking_tx.send_replace(SpeakingFlags::default());
    }

    async fn shutdown(&mut self) {
        info!("Shutting down session controller");
        self.reconnect_at = None;
        self.drop_connection().await;
        self.player.shutdown().await;
        if self.state != SessionState::Disconnected {
            self.set_state(SessionState::Disconnected);
        }
        self.set_status(Some("Session closed".to_string()));
    }

    fn set_state(&mut self, next: SessionState) {
        let from = self.state;
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            error!("Illegal session transition {} -> {}", from, next);
            return;
        }
        self.state = next;
        self.state_tx.send_replace(next);
        let _ = self.transitions_tx.send(StateTransition { from, to: next });
        debug!("Session state {} -> {}", from, next);
    }

    fn set_status(&mut self, message: Option<String>) {
        let state = self.state;
        let attempts = self.reconnect.attempts();
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.connected = state.is_connected();
            status.message = message;
            status.reconnect_attempts = attempts;
            status.updated_at = Utc::now();
        });
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
