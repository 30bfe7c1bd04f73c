// pipecast - pipe media from stdin into a supervised encoder push session
//
// Operator/diagnostic frontend for pipecast-transcode: starts one session
// against a target URL, feeds stdin chunks into it, prints periodic status,
// and exits when the terminal notification arrives. In production the
// library sits behind a signaling layer instead; this binary exercises the
// same surface end to end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use pipecast_transcode::{
    EncoderProcessManager, SessionNotifier, SessionRegistry, TranscoderConfig,
};

const SESSION_ID: &str = "stdin";

#[derive(Parser, Debug)]
#[command(name = "pipecast", about = "Push stdin media through a supervised FFmpeg session")]
struct Cli {
    /// Output target URL (e.g. rtmp://ingest.example.com/live/key)
    target: String,

    /// Explicit encoder executable; defaults to probing `ffmpeg` on PATH
    /// with a bundled-binary fallback.
    #[arg(long, env = "PIPECAST_FFMPEG")]
    encoder: Option<PathBuf>,

    /// Seconds a fresh session may wait for its first chunk before being
    /// force-stopped.
    #[arg(long, default_value_t = 30)]
    watchdog_secs: u64,

    /// Seconds between stdin half-close and hard kill on stop.
    #[arg(long, default_value_t = 5)]
    kill_deadline_secs: u64,

    /// Read size for stdin chunks.
    #[arg(long, default_value_t = 64 * 1024)]
    chunk_size: usize,

    /// Seconds between status log lines.
    #[arg(long, default_value_t = 10)]
    status_interval_secs: u64,
}

struct EndedEvent {
    code: Option<i32>,
    signal: Option<i32>,
    reason: String,
}

struct CliNotifier {
    ended_tx: mpsc::UnboundedSender<EndedEvent>,
}

#[async_trait]
impl SessionNotifier for CliNotifier {
    async fn connected(&self, session_id: &str) {
        info!("Session {session_id} connected to ingestion endpoint");
    }

    async fn ended(&self, session_id: &str, code: Option<i32>, signal: Option<i32>, reason: &str) {
        info!("Session {session_id} ended: {reason}");
        self.ended_tx
            .send(EndedEvent {
                code,
                signal,
                reason: reason.to_string(),
            })
            .ok();
    }

    async fn error(&self, session_id: &str, message: &str) {
        warn!("Session {session_id} encoder error: {message}");
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = TranscoderConfig {
        encoder_path: cli.encoder.clone(),
        watchdog_window: Duration::from_secs(cli.watchdog_secs),
        forced_kill_deadline: Duration::from_secs(cli.kill_deadline_secs),
        ..TranscoderConfig::default()
    };

    let encoder = Arc::new(EncoderProcessManager::resolve(&config)?);
    info!("Encoder resolved: {}", encoder.program().display());

    let registry = Arc::new(SessionRegistry::new(encoder, config));
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    let notifier = Arc::new(CliNotifier { ended_tx });

    if !registry.start(SESSION_ID, &cli.target, notifier).await {
        anyhow::bail!("failed to start session for target {}", cli.target);
    }

    let status_registry = Arc::clone(&registry);
    let status_interval = Duration::from_secs(cli.status_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(status_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Some(snap) = status_registry.status(SESSION_ID) {
                info!(
                    "Status: {} | chunks {} | bytes {} | errors {} | up {}s",
                    snap.state,
                    snap.chunk_count,
                    snap.bytes_received,
                    snap.error_count,
                    snap.elapsed_ms / 1000
                );
            }
        }
    });

    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; cli.chunk_size.max(1)];
    let mut ended: Option<EndedEvent> = None;
    let mut stopping = false;

    loop {
        tokio::select! {
            event = ended_rx.recv() => {
                ended = event;
                break;
            }
            _ = tokio::signal::ctrl_c(), if !stopping => {
                info!("Interrupted, stopping session");
                registry.stop(SESSION_ID);
                stopping = true;
            }
            read = stdin.read(&mut buf), if !stopping => match read {
                Ok(0) => {
                    info!("stdin closed, stopping session");
                    registry.stop(SESSION_ID);
                    stopping = true;
                }
                Ok(n) => {
                    if !registry.feed(SESSION_ID, Bytes::copy_from_slice(&buf[..n])) {
                        warn!("Feed rejected, stopping session");
                        registry.stop(SESSION_ID);
                        stopping = true;
                    }
                }
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    registry.stop(SESSION_ID);
                    stopping = true;
                }
            },
        }
    }

    match ended {
        Some(event) => {
            info!(
                "Done: {} (code {:?}, signal {:?})",
                event.reason, event.code, event.signal
            );
            Ok(())
        }
        None => anyhow::bail!("notifier channel closed before session ended"),
    }
}
