use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use voice_session::audio::FileCaptureDevice;
use voice_session::http::SessionTemplate;
use voice_session::{
    create_router, AppState, AudioOutput, Backend, Config, EnvAuthProvider, Session,
    SessionEvent, WavFileOutput, WebSocketBackend,
};

#[derive(Parser, Debug)]
#[command(name = "voice-session", version, about = "Real-time voice conversation with a model backend")]
struct Args {
    /// Config file (without extension)
    #[arg(short, long, default_value = "config/voice-session")]
    config: String,

    /// Connect to this endpoint instead of the configured chain
    #[arg(long)]
    endpoint: Option<String>,

    /// WAV file replayed as the microphone
    #[arg(long)]
    mic_file: Option<PathBuf>,

    /// Directory for assembled replies
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Run the HTTP control API instead of an interactive session
    #[arg(long)]
    serve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    info!("Voice Session v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    let backends = build_backends(&cfg, args.endpoint.as_deref());
    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&cfg.audio.output_dir));

    if args.serve {
        serve(&cfg, backends, output_dir, args.mic_file).await
    } else {
        converse(&cfg, backends, output_dir, args.mic_file).await
    }
}

fn build_backends(cfg: &Config, endpoint: Option<&str>) -> Vec<Arc<dyn Backend>> {
    let endpoints = match endpoint {
        Some(url) => vec![voice_session::config::EndpointConfig {
            name: "cli".to_string(),
            url: url.to_string(),
        }],
        None => cfg.endpoints(),
    };

    let connect_timeout = cfg.session_config().connect_timeout();
    endpoints
        .into_iter()
        .map(|e| {
            info!("Backend {}: {}", e.name, e.url);
            Arc::new(
                WebSocketBackend::new(e.name)
                    .with_endpoint(e.url)
                    .with_connect_timeout(connect_timeout),
            ) as Arc<dyn Backend>
        })
        .collect()
}

async fn serve(
    cfg: &Config,
    backends: Vec<Arc<dyn Backend>>,
    output_dir: PathBuf,
    mic_file: Option<PathBuf>,
) -> Result<()> {
    let mut template = SessionTemplate::new(cfg.session_config(), output_dir);
    template.backends = backends;
    template.auth = Arc::new(EnvAuthProvider::new(cfg.transport.api_key_env.clone()));
    template.retain_output = cfg.audio.retain_output;
    template.require_user_gesture = cfg.audio.require_user_gesture;
    template.capture_file = mic_file;
    template.capture = cfg.audio.capture_config();
    template.queue_capacity = cfg.audio.queue_capacity;
    template.recognition = cfg.recognition.recognition_config(&cfg.session.language);

    let state = AppState::new(template);
    let app = create_router(state.clone());

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    let sessions: Vec<_> = state.sessions.write().await.drain().collect();
    for (id, session) in sessions {
        info!("Closing session {}", id);
        session.end_session("server shutdown").await;
    }
    Ok(())
}

async fn converse(
    cfg: &Config,
    backends: Vec<Arc<dyn Backend>>,
    output_dir: PathBuf,
    mic_file: Option<PathBuf>,
) -> Result<()> {
    let output = WavFileOutput::new(&output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?
        .with_retain(cfg.audio.retain_output);
    let output: Arc<dyn AudioOutput> = Arc::new(output);

    let events = voice_session::EventBus::new();
    tokio::spawn(log_events(events.subscribe()));
    let mut closed = events.subscribe();

    let mut builder = Session::builder(cfg.session_config(), output)
        .backends(backends)
        .auth(Arc::new(EnvAuthProvider::new(cfg.transport.api_key_env.clone())))
        .queue_capacity(cfg.audio.queue_capacity)
        .require_user_gesture(cfg.audio.require_user_gesture)
        .events(events);
    if let Some(path) = mic_file {
        builder = builder.capture_device(
            Box::new(FileCaptureDevice::new(path)),
            cfg.audio.capture_config(),
        );
    }

    let session = builder.start().await.context("Failed to start session")?;
    info!("Type a message and press enter. /mic toggles capture, /audio enables playback, /quit ends.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/audio" => session.enable_audio(),
                    "/mic" => {
                        let toggled = if session.is_capturing() {
                            session.stop_capture().await
                        } else {
                            session.start_capture().await
                        };
                        if let Err(e) = toggled {
                            warn!("{}", e.user_message());
                        }
                    }
                    text => {
                        if let Err(e) = session.send_text(text).await {
                            error!("Failed to send: {}", e);
                        }
                    }
                }
            }
            _ = wait_closed(&mut closed) => {
                warn!("Session closed by the transport");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let stats = session.end_session("user ended session").await;
    info!(
        "Turns: {} completed, {} interrupted; fragments: {} sent, {} dropped",
        stats.turns_completed, stats.turns_interrupted, stats.fragments_sent, stats.fragments_dropped
    );
    Ok(())
}

async fn wait_closed(rx: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::Close { .. }) | Err(broadcast::error::RecvError::Closed) => return,
            _ => {}
        }
    }
}

async fn log_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event log lagged, {} events skipped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            SessionEvent::Message {
                content,
                is_complete: true,
                ..
            } => info!("Model: {}", content),
            SessionEvent::Message { .. } => {}
            SessionEvent::SttFinal { transcript } => info!("You said: {}", transcript),
            SessionEvent::AudioQueued { message } => info!("{} (type /audio)", message),
            SessionEvent::Close { reason } => {
                info!("Closed: {}", reason);
                break;
            }
            other => info!("[{}]", other.topic()),
        }
    }
}
