use anyhow::{Context, Result};
use clap::Parser;
use loqa_voice::audio::{AudioBackendFactory, AudioSource};
use loqa_voice::transport::check_backend;
use loqa_voice::{
    create_router, AppState, AudioOutput, Config, LanguageCode, LocationSummary, NullOutput,
    SessionController, SessionState, WavOutput,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long `--check` waits for the handshake
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "loqa-voice", version, about = "Realtime voice session client")]
struct Args {
    /// Config file (extension optional)
    #[arg(short, long, default_value = "config/loqa-voice")]
    config: String,

    /// Backend WebSocket URL, overrides the config file
    #[arg(long)]
    backend_url: Option<String>,

    /// Audio file replayed as the microphone
    #[arg(short, long)]
    input: Option<String>,

    /// Capture from the system microphone
    #[cfg(feature = "device")]
    #[arg(long, conflicts_with = "input")]
    microphone: bool,

    /// Input device name for --microphone, default device otherwise
    #[cfg(feature = "device")]
    #[arg(long, requires = "microphone")]
    input_device: Option<String>,

    /// Play received speech on the default output device
    #[cfg(feature = "device")]
    #[arg(long, conflicts_with = "output")]
    speaker: bool,

    /// Replay the input file forever
    #[arg(long = "loop")]
    looped: bool,

    /// Write received speech to this WAV file instead of discarding it
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Free-form location forwarded to the agent
    #[arg(long)]
    location: Option<String>,

    /// BCP-47 language code, e.g. en-US
    #[arg(long)]
    language: Option<String>,

    #[arg(long)]
    user_id: Option<String>,

    /// Start an interaction as soon as the session is established
    #[arg(long)]
    auto_start: bool,

    /// Do not serve the HTTP control API
    #[arg(long)]
    no_http: bool,

    /// Only verify that the backend completes the handshake, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut cfg = Config::load(&args.config).context("Failed to load config")?;
    if let Some(url) = args.backend_url.clone() {
        cfg.backend.url = url;
    }
    if let Some(user_id) = args.user_id.clone() {
        cfg.backend.user_id = Some(user_id);
    }
    if let Some(language) = args.language.clone() {
        cfg.backend.language = language;
    }

    info!("Loqa Voice v{}", env!("CARGO_PKG_VERSION"));
    let session_config = cfg.session_config().context("Invalid session config")?;
    info!("Backend: {}", session_config.backend_url);

    if args.check {
        return match check_backend(
            &session_config.backend_url,
            session_config.user_id.clone(),
            CHECK_TIMEOUT,
        )
        .await
        {
            Ok(()) => {
                info!("✅ Backend handshake completed");
                Ok(())
            }
            Err(e) => {
                error!("❌ Backend check failed: {}", e);
                Err(e.into())
            }
        };
    }

    let source = select_source(&args);
    let (input, _sender) = AudioBackendFactory::create(source, &session_config.capture);

    let wav = match &args.output {
        Some(path) => Some(Arc::new(
            WavOutput::create(path, session_config.player.sample_rate, true)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => None,
    };
    let output: Arc<dyn AudioOutput> = match &wav {
        Some(wav) => wav.clone() as Arc<dyn AudioOutput>,
        None => default_output(&args)?,
    };

    let controller = SessionController::spawn(session_config, input, output)?;
    spawn_transcript_logger(&controller);
    controller.connect().await?;

    if args.auto_start {
        let location = args.location.clone().map(LocationSummary::from_text);
        let language = args
            .language
            .as_deref()
            .map(str::parse::<LanguageCode>)
            .transpose()?;
        let controller = controller.clone();
        tokio::spawn(async move {
            if !controller
                .wait_for_state(SessionState::ConnectedIdle, Duration::from_secs(60))
                .await
            {
                warn!("Session not ready, interaction not started");
                return;
            }
            if let Err(e) = controller.start_interaction(location, language).await {
                warn!("Could not start interaction: {}", e);
            }
        });
    }

    if cfg.service.http.enabled && !args.no_http {
        let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("HTTP control API listening on {}", addr);

        let app = create_router(AppState::new(controller.clone()));
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("Shutting down");
    controller.shutdown().await?;
    if let Some(wav) = wav {
        wav.finalize()?;
    }

    Ok(())
}

fn select_source(args: &Args) -> AudioSource {
    #[cfg(feature = "device")]
    if args.microphone {
        return AudioSource::Microphone {
            device: args.input_device.clone(),
        };
    }
    match &args.input {
        Some(path) => AudioSource::File {
            path: path.clone(),
            looped: args.looped,
        },
        None => {
            warn!("No audio input selected, interactions will not capture any audio");
            AudioSource::Channel
        }
    }
}

#[cfg(feature = "device")]
fn default_output(args: &Args) -> Result<Arc<dyn AudioOutput>> {
    if args.speaker {
        let speaker = loqa_voice::audio::SpeakerOutput::open().context("Failed to open speaker")?;
        return Ok(Arc::new(speaker));
    }
    Ok(Arc::new(NullOutput))
}

#[cfg(not(feature = "device"))]
fn default_output(_args: &Args) -> Result<Arc<dyn AudioOutput>> {
    Ok(Arc::new(NullOutput))
}

fn spawn_transcript_logger(controller: &SessionController) {
    let observers = controller.observe();
    let mut transcript = observers.transcript();
    let mut status = observers.status;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                update = transcript.recv() => match update {
                    Ok(update) if update.utterance.complete => {
                        info!("[{:?}] {}", update.utterance.sender, update.utterance.text);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Transcript logger skipped {} updates", n);
                    }
                    Err(_) => break,
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    if let Some(message) = current.message {
                        info!("Status [{}]: {}", current.state, message);
                    }
                    if let Some(warning) = current.warning {
                        warn!("Backend warning: {}", warning);
                    }
                }
            }
        }
    });
}
