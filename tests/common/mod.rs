// Shared helpers for integration tests: a scriptable WebSocket backend and an
// output device that records what the player hands it.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use loqa_voice::audio::{AudioFrame, AudioOutput, ChannelInput, ChannelInputSender, PlaybackUnit};
use loqa_voice::session::{SessionConfig, SessionController, SessionState, StateTransition};
use loqa_voice::transport::{ClientMessage, ReconnectPolicy, ServerMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(5);

/// What the test tells a connection to do
pub enum Outbound {
    Message(ServerMessage),
    Raw(String),
    Close(CloseCode),
    /// Drop the socket without a close handshake
    Drop,
}

/// Message received by the mock backend
#[derive(Debug)]
pub struct Inbound {
    pub connection: usize,
    pub message: ClientMessage,
}

/// Control handle for one accepted connection
pub struct ServerConnection {
    pub index: usize,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ServerConnection {
    pub fn send(&self, message: ServerMessage) {
        let _ = self.tx.send(Outbound::Message(message));
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.tx.send(Outbound::Raw(text.into()));
    }

    pub fn close(&self, code: CloseCode) {
        let _ = self.tx.send(Outbound::Close(code));
    }

    pub fn drop_connection(&self) {
        let _ = self.tx.send(Outbound::Drop);
    }
}

/// Local WebSocket server speaking the backend side of the protocol
pub struct MockBackend {
    pub url: String,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockBackend {
    /// Backend that answers `setup` with `setup_complete`.
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    pub async fn start_with(ack_setup: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/voice", listener.local_addr().unwrap());
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (connections_tx, connections) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = connections_tx.send(ServerConnection { index, tx });
                tokio::spawn(serve_connection(stream, index, ack_setup, rx, inbound_tx.clone()));
            }
        });

        Self {
            url,
            inbound,
            connections,
            accepted,
            task,
        }
    }

    /// Wait for the next accepted connection.
    pub async fn next_connection(&mut self) -> ServerConnection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("backend stopped")
    }

    /// Wait for the first client message matching `pred`, skipping others.
    pub async fn expect(&mut self, pred: impl Fn(&ClientMessage) -> bool) -> Inbound {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let inbound = tokio::time::timeout_at(deadline, self.inbound.recv())
                .await
                .expect("timed out waiting for client message")
                .expect("backend stopped");
            if pred(&inbound.message) {
                return inbound;
            }
        }
    }

    /// Everything received so far, without waiting.
    pub fn drain_received(&mut self) -> Vec<Inbound> {
        let mut received = Vec::new();
        while let Ok(inbound) = self.inbound.try_recv() {
            received.push(inbound);
        }
        received
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    index: usize,
    ack_setup: bool,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Outbound::Message(message)) => {
                    if sink.send(Message::Text(message.to_json())).await.is_err() {
                        return;
                    }
                }
                Some(Outbound::Raw(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Some(Outbound::Close(code)) => {
                    let frame = CloseFrame { code, reason: "".into() };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    // Wait for the client's close reply
                    while let Some(Ok(_)) = source.next().await {}
                    return;
                }
                Some(Outbound::Drop) | None => return,
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(message) = serde_json::from_str::<ClientMessage>(&text) else {
                        continue;
                    };
                    if ack_setup && matches!(message, ClientMessage::Setup { .. }) {
                        let ack = ServerMessage::SetupComplete(serde_json::json!({}));
                        if sink.send(Message::Text(ack.to_json())).await.is_err() {
                            return;
                        }
                    }
                    let _ = inbound.send(Inbound { connection: index, message });
                }
                Some(Ok(_)) => {}
                _ => return,
            }
        }
    }
}

/// Unit handed to [`RecordingOutput`]
#[derive(Debug, Clone)]
pub struct PlayedUnit {
    pub id: u64,
    pub byte_len: usize,
    pub chunk_count: usize,
    pub samples: usize,
}

/// Output device that reports every unit and takes real time to "play" it
pub struct RecordingOutput {
    played: mpsc::UnboundedSender<PlayedUnit>,
    halts: AtomicUsize,
}

impl RecordingOutput {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PlayedUnit>) {
        let (played, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                played,
                halts: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AudioOutput for RecordingOutput {
    async fn play(&self, unit: &PlaybackUnit) -> anyhow::Result<()> {
        let _ = self.played.send(PlayedUnit {
            id: unit.id,
            byte_len: unit.byte_len,
            chunk_count: unit.chunk_count,
            samples: unit.samples.len(),
        });
        tokio::time::sleep(unit.duration()).await;
        Ok(())
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Session config with fast reconnects for tests
pub fn test_config(url: &str) -> SessionConfig {
    let mut config = SessionConfig::new(url);
    config.user_id = Some("test-user".to_string());
    config.connect_timeout = Duration::from_secs(2);
    config.reconnect = ReconnectPolicy {
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts: Some(3),
    };
    config
}

pub struct Harness {
    pub controller: SessionController,
    pub mic: ChannelInputSender,
    pub output: Arc<RecordingOutput>,
    pub played: mpsc::UnboundedReceiver<PlayedUnit>,
    pub transitions: broadcast::Receiver<StateTransition>,
}

pub fn spawn_session(config: SessionConfig) -> Harness {
    let (input, mic) = ChannelInput::new();
    let (output, played) = RecordingOutput::new();
    let controller = SessionController::spawn(config, Box::new(input), output.clone()).unwrap();
    let transitions = controller.observe().transitions();
    Harness {
        controller,
        mic,
        output,
        played,
        transitions,
    }
}

/// Wait until the controller reports `target`.
pub async fn wait_for_state(controller: &SessionController, target: SessionState) {
    let mut state = controller.observe().state;
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}, still {:?}", target, controller.state()))
        .unwrap();
}

/// One 4096-sample frame of a 440Hz tone at 16kHz mono.
pub fn tone_frame(timestamp_ms: u64) -> AudioFrame {
    let samples = (0..4096)
        .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 16_000.0).sin() * 0.5)
        .collect();
    AudioFrame {
        samples,
        sample_rate: 16_000,
        channels: 1,
        timestamp_ms,
    }
}

/// Base64 PCM payload of `bytes` bytes (all samples at a small constant value).
pub fn speech_payload(bytes: usize) -> String {
    let samples = vec![0.25f32; bytes / 2];
    loqa_voice::audio::pcm::to_base64(&loqa_voice::audio::pcm::samples_to_bytes(&samples))
}
