//! Encoder process management
//!
//! Resolves the runnable FFmpeg executable once at startup (configured path,
//! then a system install verified by a version probe, then the bundled static
//! binary) and spawns one encoding subprocess per session. The argument
//! template is fixed: input is a WebM/Matroska container on stdin, output is
//! H.264/AAC in FLV pushed to the session's target URL. Only the target
//! varies between sessions.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::config::TranscoderConfig;
use crate::error::{TranscodeError, TranscodeResult};

/// Name probed on `PATH` when no explicit encoder is configured.
const SYSTEM_ENCODER: &str = "ffmpeg";

// Fixed output settings. These are constants of the component, not
// caller-configurable: every ingestion endpoint we push to expects the same
// H.264/AAC FLV profile.
const INPUT_ARGS: &[&str] = &["-hide_banner", "-loglevel", "info", "-f", "webm", "-i", "pipe:0"];
const VIDEO_ARGS: &[&str] = &[
    "-c:v",
    "libx264",
    "-preset",
    "veryfast",
    "-tune",
    "zerolatency",
    "-pix_fmt",
    "yuv420p",
    "-b:v",
    "2500k",
    "-maxrate",
    "2500k",
    "-bufsize",
    "5000k",
    "-g",
    "60",
    "-r",
    "30",
];
const AUDIO_ARGS: &[&str] = &["-c:a", "aac", "-b:a", "128k", "-ar", "44100"];
const MUX_ARGS: &[&str] = &["-f", "flv"];

/// Handle to one freshly spawned encoder subprocess.
///
/// Owned exclusively by the session that requested it: stdin goes to the
/// feed writer, stderr to the diagnostic monitor, and the `Child` itself to
/// the exit-watch task, which is the only place the process is reaped.
pub struct EncoderProcess {
    pub(crate) pid: u32,
    pub(crate) child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) stderr: ChildStderr,
}

/// How the resolved program is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgMode {
    /// The fixed FFmpeg transcode template.
    Transcode,
    /// No arguments at all. Used to supervise a stdin-draining stand-in
    /// (e.g. `cat`) in tests and loopback diagnostics.
    Passthrough,
}

/// Spawns and configures encoder subprocesses.
///
/// Created once at startup and shared read-only across all sessions; the
/// resolved executable path never changes for the process lifetime.
pub struct EncoderProcessManager {
    program: PathBuf,
    mode: ArgMode,
}

impl EncoderProcessManager {
    /// Resolve a runnable encoder, preferring an explicitly configured path,
    /// then a system `ffmpeg` on `PATH`, then the bundled static binary.
    pub fn resolve(config: &TranscoderConfig) -> TranscodeResult<Self> {
        if let Some(path) = &config.encoder_path {
            if probe(path) {
                info!("Using configured encoder at {}", path.display());
                return Ok(Self::with_program(path.clone()));
            }
            return Err(TranscodeError::EncoderNotFound(path.display().to_string()));
        }

        if probe(Path::new(SYSTEM_ENCODER)) {
            info!("Using system encoder '{SYSTEM_ENCODER}'");
            return Ok(Self::with_program(SYSTEM_ENCODER));
        }

        if probe(&config.bundled_encoder_path) {
            info!(
                "System encoder unavailable, using bundled binary at {}",
                config.bundled_encoder_path.display()
            );
            return Ok(Self::with_program(config.bundled_encoder_path.clone()));
        }

        Err(TranscodeError::EncoderNotFound(format!(
            "no runnable encoder: '{SYSTEM_ENCODER}' not on PATH and no bundled binary at {}",
            config.bundled_encoder_path.display()
        )))
    }

    /// Use `program` with the fixed transcode template, skipping the probe.
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            mode: ArgMode::Transcode,
        }
    }

    /// Use `program` with no arguments. The program only has to drain stdin
    /// and exit on EOF; tests run the full session lifecycle over `cat`.
    #[must_use]
    pub fn passthrough(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            mode: ArgMode::Passthrough,
        }
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn build_args(&self, output_target: &str) -> Vec<String> {
        match self.mode {
            ArgMode::Passthrough => Vec::new(),
            ArgMode::Transcode => INPUT_ARGS
                .iter()
                .chain(VIDEO_ARGS)
                .chain(AUDIO_ARGS)
                .chain(MUX_ARGS)
                .map(|s| (*s).to_string())
                .chain(std::iter::once(output_target.to_string()))
                .collect(),
        }
    }

    /// Spawn one encoder pushing to `output_target`.
    ///
    /// Fails with `SpawnFailed` whenever no process id is obtained; nothing
    /// is registered or leaked in that case.
    pub fn spawn(&self, output_target: &str) -> TranscodeResult<EncoderProcess> {
        let args = self.build_args(output_target);
        debug!(
            "Spawning encoder {} {}",
            self.program.display(),
            args.join(" ")
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // Last-resort guard: if the supervising task is ever dropped
            // without reaping, the runtime kills the child for us.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeError::SpawnFailed(e.to_string()))?;

        let Some(pid) = child.id() else {
            warn!("Encoder spawned but no pid obtained, discarding");
            child.start_kill().ok();
            return Err(TranscodeError::SpawnFailed(
                "no process id obtained".to_string(),
            ));
        };

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TranscodeError::SpawnFailed("failed to capture stdin".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscodeError::SpawnFailed("failed to capture stderr".to_string()))?;

        Ok(EncoderProcess {
            pid,
            child,
            stdin,
            stderr,
        })
    }
}

/// Version probe: a usable encoder must run `<program> -version` and exit 0.
fn probe(program: &Path) -> bool {
    std::process::Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcode_args_end_with_target() {
        let manager = EncoderProcessManager::with_program("ffmpeg");
        let args = manager.build_args("rtmp://ingest.example.com/live/key");

        assert_eq!(
            args.last().map(String::as_str),
            Some("rtmp://ingest.example.com/live/key")
        );
        // Input is always stdin; mux format is always FLV.
        assert!(args.iter().any(|a| a == "pipe:0"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "flv"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
    }

    #[test]
    fn passthrough_spawns_bare_program() {
        let manager = EncoderProcessManager::passthrough("cat");
        assert!(manager.build_args("rtmp://ignored").is_empty());
    }

    #[test]
    fn probe_rejects_missing_program() {
        assert!(!probe(Path::new("/nonexistent/definitely-not-an-encoder")));
    }

    #[test]
    fn resolve_fails_for_bad_configured_path() {
        let config = TranscoderConfig {
            encoder_path: Some(PathBuf::from("/nonexistent/definitely-not-an-encoder")),
            ..TranscoderConfig::default()
        };
        assert!(matches!(
            EncoderProcessManager::resolve(&config),
            Err(TranscodeError::EncoderNotFound(_))
        ));
    }
}
