use futures::{Sink, SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::messages::{ClientMessage, MediaChunk, ServerMessage};
use crate::error::TransportError;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Audio chunks allowed to wait for the writer before new ones are refused.
pub const MEDIA_QUEUE_FRAMES: usize = 4;

/// Monotonic id distinguishing successive connections of one controller.
pub type Generation = u64;

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Backend closed with a normal close code; not retried
    ServerInitiated,
    /// Anything else: transport error, abnormal close, stream end
    Lost(String),
}

#[derive(Debug)]
pub enum TransportEvent {
    Opened,
    Message(ServerMessage),
    /// Frame that could not be parsed; the connection stays up
    Malformed(TransportError),
    Closed(CloseReason),
    /// Connecting failed or timed out
    Failed(TransportError),
}

/// Event tagged with the connection that produced it
#[derive(Debug)]
pub struct ConnectionEvent {
    pub generation: Generation,
    pub event: TransportEvent,
}

/// Handle to one WebSocket connection to the backend.
///
/// A background task owns the socket. The reader runs on that task and a
/// separate writer task drains the outbound queues, so a stalled write never
/// holds up inbound frames. Control messages are queued without limit; media
/// goes through a queue of [`MEDIA_QUEUE_FRAMES`] and is refused when full.
pub struct Connection {
    generation: Generation,
    control: mpsc::UnboundedSender<ClientMessage>,
    media: mpsc::Sender<MediaChunk>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Start connecting to `url`. Progress is reported on `events`.
    pub fn open(
        url: String,
        generation: Generation,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (media, media_rx) = mpsc::channel(MEDIA_QUEUE_FRAMES);
        let task = tokio::spawn(run_connection(
            url,
            generation,
            connect_timeout,
            Outbound {
                control: control_rx,
                media: media_rx,
            },
            events,
        ));
        Self {
            generation,
            control,
            media,
            task,
        }
    }

    /// Queue a control message for the writer.
    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.control.send(message).map_err(|_| TransportError::Closed)
    }

    /// Queue one audio chunk as `realtime_input`.
    ///
    /// Fails with [`TransportError::QueueFull`] when the writer is behind; the
    /// chunk is dropped.
    pub fn send_media(&self, chunk: MediaChunk) -> Result<(), TransportError> {
        self.media.try_send(chunk).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Close the socket. No further events are reported for this connection.
    pub fn close(self) {
        let Self {
            generation,
            control,
            media,
            mut task,
        } = self;
        // The writer sends a close frame once the control queue drains
        drop(control);
        drop(media);
        tokio::spawn(async move {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                debug!("Aborting connection task (generation {})", generation);
                task.abort();
            }
        });
    }
}

struct Outbound {
    control: mpsc::UnboundedReceiver<ClientMessage>,
    media: mpsc::Receiver<MediaChunk>,
}

async fn run_connection(
    url: String,
    generation: Generation,
    connect_timeout: Duration,
    outbound: Outbound,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send(ConnectionEvent { generation, event });
    };

    info!("Connecting to backend at {} (generation {})", url, generation);

    let socket = match tokio::time::timeout(
        connect_timeout,
        tokio_tungstenite::connect_async(url.as_str()),
    )
    .await
    {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(source)) => {
            warn!("Connection to {} failed: {}", url, source);
            emit(TransportEvent::Failed(TransportError::Connect { url, source }));
            return;
        }
        Err(_) => {
            warn!("Connection to {} timed out after {:?}", url, connect_timeout);
            emit(TransportEvent::Failed(TransportError::Timeout(connect_timeout)));
            return;
        }
    };

    info!("Connected to backend (generation {})", generation);
    emit(TransportEvent::Opened);

    let (sink, mut stream) = socket.split();

    // Dropping the set aborts the writer along with this task
    let mut writer = JoinSet::new();
    writer.spawn(write_loop(sink, outbound, generation));

    loop {
        tokio::select! {
            Some(written) = writer.join_next() => {
                match written {
                    Ok(Ok(())) => debug!("Writer closed (generation {})", generation),
                    Ok(Err(e)) => {
                        warn!("Send failed: {}", e);
                        emit(TransportEvent::Closed(CloseReason::Lost(e)));
                    }
                    Err(e) => emit(TransportEvent::Closed(CloseReason::Lost(e.to_string()))),
                }
                return;
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text) {
                    Ok(message) => {
                        debug!("<- {}", message.name());
                        emit(TransportEvent::Message(message));
                    }
                    Err(e) => {
                        warn!("Ignoring malformed frame: {}", e);
                        emit(TransportEvent::Malformed(e));
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = match &frame {
                        Some(frame) if frame.code == CloseCode::Normal => CloseReason::ServerInitiated,
                        Some(frame) => CloseReason::Lost(format!("closed with {} {}", frame.code, frame.reason)),
                        None => CloseReason::Lost("closed without status".to_string()),
                    };
                    info!("Backend closed connection: {:?}", reason);
                    emit(TransportEvent::Closed(reason));
                    return;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    warn!("Ignoring {} byte binary frame", bytes.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Connection lost: {}", e);
                    emit(TransportEvent::Closed(CloseReason::Lost(e.to_string())));
                    return;
                }
                None => {
                    emit(TransportEvent::Closed(CloseReason::Lost("stream ended".to_string())));
                    return;
                }
            }
        }
    }
}

/// Writes queued messages in order, control before media.
///
/// Returns once the control queue is closed, after sending a close frame.
async fn write_loop<S>(mut sink: S, mut outbound: Outbound, generation: Generation) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let message = tokio::select! {
            biased;

            control = outbound.control.recv() => match control {
                Some(message) => message,
                None => {
                    debug!("Closing connection (generation {})", generation);
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return Ok(());
                }
            },
            Some(chunk) = outbound.media.recv() => ClientMessage::media(chunk),
        };

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping unencodable '{}' message: {}", message.name(), e);
                continue;
            }
        };
        debug!("-> {}", message.name());
        sink.send(Message::Text(text)).await.map_err(|e| e.to_string())?;
    }
}

/// Open a connection, send `setup` and wait for `setup_complete`.
///
/// Used to verify a backend before starting a session. The connection is
/// closed again either way.
pub async fn check_backend(
    url: &str,
    user_id: Option<String>,
    timeout: Duration,
) -> Result<(), TransportError> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let connection = Connection::open(url.to_string(), 0, timeout, events_tx);
    let deadline = tokio::time::Instant::now() + timeout;

    let result = loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event.event,
            Ok(None) => break Err(TransportError::Closed),
            Err(_) => break Err(TransportError::Timeout(timeout)),
        };
        match event {
            TransportEvent::Opened => {
                if let Err(e) = connection.send(ClientMessage::setup(user_id.clone())) {
                    break Err(e);
                }
            }
            TransportEvent::Message(ServerMessage::SetupComplete(_)) => break Ok(()),
            TransportEvent::Message(message) => debug!("Check ignoring '{}'", message.name()),
            TransportEvent::Malformed(e) => debug!("Check ignoring malformed frame: {}", e),
            TransportEvent::Failed(e) => break Err(e),
            TransportEvent::Closed(reason) => {
                debug!("Backend closed during check: {:?}", reason);
                break Err(TransportError::Closed);
            }
        }
    };

    connection.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn chunk() -> MediaChunk {
        MediaChunk {
            mime_type: "audio/pcm".to_string(),
            data: "AAAA".to_string(),
        }
    }

    #[tokio::test]
    async fn test_media_queue_is_bounded() {
        // Accepts TCP but never answers the upgrade, so nothing is written
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/voice", listener.local_addr().unwrap());
        let (events, _events_rx) = mpsc::unbounded_channel();
        let connection = Connection::open(url, 1, Duration::from_secs(5), events);

        for _ in 0..MEDIA_QUEUE_FRAMES {
            connection.send_media(chunk()).unwrap();
        }
        assert!(matches!(
            connection.send_media(chunk()),
            Err(TransportError::QueueFull)
        ));
        // Control messages are never refused for backpressure
        connection
            .send(ClientMessage::Text {
                text: "still here".to_string(),
            })
            .unwrap();

        connection.close();
    }

    #[tokio::test]
    async fn test_check_backend_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = check_backend(&format!("ws://{}/voice", addr), None, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_check_backend_times_out_without_upgrade() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/voice", listener.local_addr().unwrap());

        let result = check_backend(&url, None, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }
}
