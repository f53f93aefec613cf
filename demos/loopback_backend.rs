//! Loopback voice backend for local testing.
//!
//! Accepts the client protocol, acknowledges the handshake, and after each
//! second of streamed microphone audio sends it straight back as 24kHz
//! "agent speech", with a transcription line describing what it did. No AI
//! is involved.
//!
//! Run with `cargo run --example loopback_backend -- --port 8765`, then point
//! `loqa-voice --backend-url ws://127.0.0.1:8765/voice` at it.

use anyhow::Result;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use loqa_voice::audio::pcm;
use loqa_voice::transport::{
    ClientMessage, ServerMessage, SessionStatusReport, Speaker, TranscriptionEvent,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    #[arg(short, long, default_value_t = 8765)]
    port: u16,

    /// Captured audio collected before it is echoed back
    #[arg(long, default_value_t = 1000)]
    echo_after_ms: u64,

    /// Chunks each echoed turn is split into
    #[arg(long, default_value_t = 3)]
    chunks: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Arc::new(Args::parse());

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🔁 Loopback backend listening on ws://{}", addr);

    let active = Arc::new(AtomicUsize::new(0));
    loop {
        let (stream, peer) = listener.accept().await?;
        let args = Arc::clone(&args);
        let active = Arc::clone(&active);
        tokio::spawn(async move {
            active.fetch_add(1, Ordering::SeqCst);
            info!("🔌 Client connected: {}", peer);
            if let Err(e) = serve(stream, &args, &active).await {
                warn!("Client {} failed: {}", peer, e);
            }
            active.fetch_sub(1, Ordering::SeqCst);
            info!("👋 Client disconnected: {}", peer);
        });
    }
}

async fn serve(stream: TcpStream, args: &Args, active: &AtomicUsize) -> Result<()> {
    let socket = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = socket.split();

    let echo_after = (pcm::CAPTURE_SAMPLE_RATE as u64 * args.echo_after_ms / 1000) as usize;
    let mut pending: Vec<f32> = Vec::new();
    let mut turns = 0usize;

    while let Some(frame) = source.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let message: ClientMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unparseable client frame: {}", e);
                continue;
            }
        };

        let mut replies = Vec::new();
        match message {
            ClientMessage::Setup { setup } => {
                let session_id = uuid::Uuid::new_v4().to_string();
                info!("🤝 Setup from {:?}", setup.user_id);
                replies.push(ServerMessage::SessionCreated(json!({ "sessionId": session_id })));
                replies.push(ServerMessage::SetupComplete(json!({ "sessionId": session_id })));
            }
            ClientMessage::StartInteraction { location, language } => {
                info!(
                    "🎙️  Interaction started ({}, {})",
                    language,
                    location.map(|l| l.formatted_for_ai).unwrap_or_default()
                );
                pending.clear();
                replies.push(ServerMessage::InteractionStarted(json!({})));
            }
            ClientMessage::StopInteraction {} => {
                info!("⏹️  Interaction stopped");
                pending.clear();
                replies.push(ServerMessage::InteractionStopped(json!({})));
            }
            ClientMessage::RealtimeInput { realtime_input } => {
                for chunk in realtime_input.media_chunks {
                    match pcm::from_base64(&chunk.data).and_then(|b| pcm::decode_frame(&b)) {
                        Ok(samples) => pending.extend(samples),
                        Err(e) => warn!("Bad media chunk: {}", e),
                    }
                }
                if pending.len() >= echo_after {
                    turns += 1;
                    let captured: Vec<f32> = pending.drain(..).collect();
                    replies.extend(echo_turn(&captured, args.chunks, turns));
                }
            }
            ClientMessage::Text { text } => {
                replies.push(ServerMessage::Transcription(TranscriptionEvent {
                    text: format!("You typed: {}", text),
                    sender: Speaker::Agent,
                    finished: Some(true),
                }));
            }
            ClientMessage::GetSessionStatus {} => {
                let mut details = serde_json::Map::new();
                details.insert("activeSessions".into(), json!(active.load(Ordering::SeqCst)));
                replies.push(ServerMessage::SessionStatus(SessionStatusReport {
                    counter_accurate: true,
                    details,
                }));
            }
        }

        for reply in replies {
            sink.send(Message::Text(reply.to_json())).await?;
        }
    }
    Ok(())
}

/// Captured 16kHz audio played back as 24kHz agent speech.
fn echo_turn(captured: &[f32], chunks: usize, turn: usize) -> Vec<ServerMessage> {
    let level = pcm::rms_level(captured);
    let speech = pcm::resample(captured, pcm::CAPTURE_SAMPLE_RATE, pcm::PLAYBACK_SAMPLE_RATE);
    let bytes = pcm::samples_to_bytes(&speech);

    let mut messages = vec![ServerMessage::Transcription(TranscriptionEvent {
        text: format!("(turn {}, level {:.0})", turn, level),
        sender: Speaker::User,
        finished: Some(true),
    })];

    // Keep chunk boundaries on whole samples
    let per_chunk = (bytes.len() / chunks.max(1) / 2 * 2).max(2);
    for chunk in bytes.chunks(per_chunk) {
        messages.push(ServerMessage::Audio {
            audio: pcm::to_base64(chunk),
        });
    }

    messages.push(ServerMessage::Transcription(TranscriptionEvent {
        text: "Here is what I heard.".to_string(),
        sender: Speaker::Agent,
        finished: Some(true),
    }));
    messages
}
