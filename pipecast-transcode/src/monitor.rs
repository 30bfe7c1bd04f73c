//! Diagnostic log monitor
//!
//! FFmpeg writes all diagnostics to stderr. One monitor task per session
//! reads that stream line-by-line and classifies each line by substring:
//!
//! - connection markers (`Output #0`, `Stream mapping:`, progress lines)
//!   drive the one-time `Starting -> Connected` transition,
//! - error vocabulary bumps `error_count` and surfaces a notifier `error`
//!   event, but never terminates the session by itself,
//! - everything else is logged for diagnostics and otherwise ignored.
//!
//! Nothing escapes this module: malformed or unexpected text is noise, EOF
//! ends the task quietly.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tracing::{debug, info, trace, warn};

use crate::session::Session;

/// Lines FFmpeg emits once the output muxer is open, i.e. the remote
/// ingestion endpoint accepted the stream.
const CONNECTION_MARKERS: &[&str] = &["Output #0", "Stream mapping:", "frame="];

/// Case-insensitive error vocabulary. Substring containment, deliberately
/// broad: a false positive costs one counter bump and a warn log.
const ERROR_MARKERS: &[&str] = &[
    "error",
    "failed",
    "failure",
    "unable to",
    "permission denied",
    "connection refused",
    "connection reset",
    "broken pipe",
    "no such file",
    "invalid argument",
];

pub(crate) fn is_connection_marker(line: &str) -> bool {
    CONNECTION_MARKERS.iter().any(|m| line.contains(m))
}

pub(crate) fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    ERROR_MARKERS.iter().any(|m| lower.contains(m))
}

/// Recurring `frame=... time=... bitrate=...` progress lines. High volume,
/// so they only get trace-level logging.
fn is_progress_line(line: &str) -> bool {
    line.contains("time=") && line.contains("bitrate=")
}

pub(crate) async fn run(session: Arc<Session>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        classify(&session, line.trim()).await;
    }
    debug!("Diagnostic monitor finished for session {}", session.id());
}

async fn classify(session: &Arc<Session>, line: &str) {
    if line.is_empty() {
        return;
    }

    if is_error_line(line) {
        session.stats().record_error();
        warn!("Encoder [{}]: {}", session.id(), line);
        session.notifier().error(session.id(), line).await;
        return;
    }

    if is_connection_marker(line) {
        if session.mark_connected() {
            info!("Session {} connected to ingestion endpoint", session.id());
            session.notifier().connected(session.id()).await;
        } else if is_progress_line(line) {
            trace!("Encoder [{}]: {}", session.id(), line);
        } else {
            debug!("Encoder [{}]: {}", session.id(), line);
        }
        return;
    }

    debug!("Encoder [{}]: {}", session.id(), line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_header_is_connection_marker() {
        assert!(is_connection_marker(
            "Output #0, flv, to 'rtmp://ingest.example.com/live/key':"
        ));
        assert!(is_connection_marker("Stream mapping:"));
    }

    #[test]
    fn progress_line_is_connection_marker() {
        let line = "frame=  123 fps= 30 q=28.0 size=    1024kB time=00:00:04.10 bitrate=2046.3kbits/s speed=1.01x";
        assert!(is_connection_marker(line));
        assert!(is_progress_line(line));
    }

    #[test]
    fn input_banner_is_noise() {
        assert!(!is_connection_marker(
            "Input #0, matroska,webm, from 'pipe:0':"
        ));
        assert!(!is_error_line("Stream #0:0: Video: vp8, yuv420p, 1280x720"));
    }

    #[test]
    fn error_vocabulary_is_case_insensitive() {
        assert!(is_error_line(
            "rtmp://ingest.example.com/live/key: Connection refused"
        ));
        assert!(is_error_line("Error writing trailer: Broken pipe"));
        assert!(is_error_line(
            "[flv @ 0x55] Failed to update header with correct duration."
        ));
        assert!(!is_error_line("Press [q] to stop, [?] for help"));
    }
}
