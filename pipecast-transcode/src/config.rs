// Transcoder configuration
//
// All timing constants and the encoder lookup chain are fixed at process
// startup; sessions never reconfigure them. The embedding layer (CLI or
// signaling server) fills this from flags/env and hands it to
// `SessionRegistry::new`.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    /// Explicit encoder executable. When set, it must pass the version
    /// probe or startup fails; the lookup chain is skipped.
    pub encoder_path: Option<PathBuf>,
    /// Fallback static binary used when no system encoder is runnable.
    pub bundled_encoder_path: PathBuf,
    /// How long a freshly started session may go without a single input
    /// chunk before it is force-stopped.
    pub watchdog_window: Duration,
    /// Grace period between a stop request (stdin half-close) and the hard
    /// kill of an encoder that refuses to exit.
    pub forced_kill_deadline: Duration,
    /// Capacity of the per-session input chunk queue. A full queue rejects
    /// `feed` synchronously; the caller decides whether to retry or drop.
    pub feed_depth: usize,
    /// Upper bound on concurrently active sessions.
    pub max_sessions: usize,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            encoder_path: None,
            bundled_encoder_path: PathBuf::from("bin/ffmpeg"),
            watchdog_window: Duration::from_secs(30),
            forced_kill_deadline: Duration::from_secs(5),
            feed_depth: 64,
            max_sessions: 32,
        }
    }
}
