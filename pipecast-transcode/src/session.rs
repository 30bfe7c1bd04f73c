//! Session state
//!
//! One `Session` per active stream id. The session exclusively owns its
//! encoder subprocess: stdin is fed through a bounded channel drained by a
//! dedicated writer task, stderr is consumed by the diagnostic monitor, and
//! the `Child` itself lives inside the registry's exit-watch task, which is
//! the single place the process is reaped and the single source of the
//! terminal `ended` notification.
//!
//! State machine: `Starting -> Connected -> Stopping -> Terminated`, with an
//! `Errored` branch out of `Starting`/`Connected` on crash or watchdog
//! expiry. Terminal states are absorbing; a new `start` under the same id
//! always builds a fresh `Session`.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::notify::SessionNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Starting,
    Connected,
    Stopping,
    Terminated,
    Errored,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "Starting",
            Self::Connected => "Connected",
            Self::Stopping => "Stopping",
            Self::Terminated => "Terminated",
            Self::Errored => "Errored",
        };
        f.write_str(s)
    }
}

/// Why a stop was initiated. Decides the terminal state when the subprocess
/// finally exits: deliberate stops end `Terminated` even if the kill made
/// the exit status nonzero, watchdog expiry always ends `Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopKind {
    Operator,
    Watchdog,
    Replaced,
}

pub(crate) const REASON_STOPPED: &str = "stopped by caller";
pub(crate) const REASON_NO_INPUT: &str = "no input received";
pub(crate) const REASON_REPLACED: &str = "replaced by newer start";

/// Monotonically non-decreasing per-session counters. Never reset.
pub struct SessionStats {
    bytes_received: AtomicU64,
    chunk_count: AtomicU64,
    error_count: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
    last_data: Mutex<Option<Instant>>,
}

impl SessionStats {
    fn new() -> Self {
        Self {
            bytes_received: AtomicU64::new(0),
            chunk_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            started_at: Utc::now(),
            started: Instant::now(),
            last_data: Mutex::new(None),
        }
    }

    pub(crate) fn record_chunk(&self, len: u64) {
        self.bytes_received.fetch_add(len, Ordering::SeqCst);
        self.chunk_count.fetch_add(1, Ordering::SeqCst);
        *self.last_data.lock() = Some(Instant::now());
    }

    pub(crate) fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn last_data_age(&self) -> Option<Duration> {
        self.last_data.lock().map(|t| t.elapsed())
    }
}

/// Immutable point-in-time view of a session, safe to hand to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub output_target: String,
    pub pid: u32,
    pub state: ConnectionState,
    pub bytes_received: u64,
    pub chunk_count: u64,
    pub error_count: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub last_data_age_ms: Option<u64>,
}

/// Terminal facts gathered when the subprocess exits, used for the single
/// `ended` notification.
pub(crate) struct TerminalOutcome {
    pub state: ConnectionState,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub reason: String,
}

pub struct Session {
    id: String,
    instance: Uuid,
    output_target: String,
    pid: u32,
    notifier: Arc<dyn SessionNotifier>,
    state: Mutex<ConnectionState>,
    stats: SessionStats,
    /// Taken (dropped) on stop: the writer task drains what is queued, then
    /// closes the child's stdin, signalling end-of-stream.
    feed_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    kill_timer: Mutex<Option<JoinHandle<()>>>,
    kill_token: CancellationToken,
    /// Fires once the exit-watch task has reaped the subprocess and finished
    /// teardown. The replace path waits on this so the old encoder is gone
    /// before its successor spawns.
    exited: CancellationToken,
    stop_kind: Mutex<Option<StopKind>>,
    reason: Mutex<Option<String>>,
    first_chunk: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        id: String,
        output_target: String,
        pid: u32,
        notifier: Arc<dyn SessionNotifier>,
        feed_tx: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            id,
            instance: Uuid::new_v4(),
            output_target,
            pid,
            notifier,
            state: Mutex::new(ConnectionState::Starting),
            stats: SessionStats::new(),
            feed_tx: Mutex::new(Some(feed_tx)),
            watchdog: Mutex::new(None),
            kill_timer: Mutex::new(None),
            kill_token: CancellationToken::new(),
            exited: CancellationToken::new(),
            stop_kind: Mutex::new(None),
            reason: Mutex::new(None),
            first_chunk: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Distinguishes this session object from a replacement under the same
    /// id, so cleanup removes exactly the entry it belongs to.
    pub(crate) fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn SessionNotifier> {
        &self.notifier
    }

    pub(crate) fn kill_token(&self) -> CancellationToken {
        self.kill_token.clone()
    }

    /// Called by the exit-watch task once the subprocess is reaped, the
    /// terminal notification delivered, and the registry entry gone.
    pub(crate) fn mark_exited(&self) {
        self.exited.cancel();
    }

    /// Resolves once teardown is complete (immediately if it already is).
    pub(crate) async fn wait_exited(&self) {
        self.exited.clone().cancelled_owned().await;
    }

    pub(crate) fn set_watchdog(&self, handle: JoinHandle<()>) {
        *self.watchdog.lock() = Some(handle);
    }

    /// Queue one chunk for the encoder's stdin.
    ///
    /// Returns `false` without mutating anything when the session is no
    /// longer accepting input or the queue is closed/full. On the very first
    /// accepted chunk the watchdog is cancelled permanently.
    pub(crate) fn feed(&self, chunk: Bytes) -> bool {
        match *self.state.lock() {
            ConnectionState::Starting | ConnectionState::Connected => {}
            _ => return false,
        }

        let Some(tx) = self.feed_tx.lock().clone() else {
            return false;
        };

        let len = chunk.len() as u64;
        match tx.try_send(chunk) {
            Ok(()) => {
                self.stats.record_chunk(len);
                if !self.first_chunk.swap(true, Ordering::SeqCst) {
                    self.cancel_watchdog();
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!("Feed queue full for session {}, rejecting chunk", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                // Writer task is gone (stdin broke); stop handing out sends.
                self.feed_tx.lock().take();
                debug!("Input pipe closed for session {}, rejecting chunk", self.id);
                false
            }
        }
    }

    /// One-time `Starting -> Connected` transition driven by the diagnostic
    /// monitor. Returns `true` only for the transition that actually won.
    pub(crate) fn mark_connected(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Starting {
            *state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// Begin teardown: transition to `Stopping`, half-close stdin, and
    /// schedule the hard kill after `kill_after` (immediately when zero).
    ///
    /// Idempotent: returns `false` if the session was already stopping or
    /// terminal. The actual terminal notification is produced later by the
    /// exit-watch task, never here.
    pub(crate) fn initiate_stop(&self, kind: StopKind, reason: &str, kill_after: Duration) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Starting | ConnectionState::Connected => {
                    *state = ConnectionState::Stopping;
                }
                _ => return false,
            }
        }

        *self.stop_kind.lock() = Some(kind);
        {
            let mut reason_slot = self.reason.lock();
            if reason_slot.is_none() {
                *reason_slot = Some(reason.to_string());
            }
        }

        self.cancel_watchdog();
        self.feed_tx.lock().take();

        if kill_after.is_zero() {
            self.kill_token.cancel();
        } else {
            let token = self.kill_token.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(kill_after).await;
                token.cancel();
            });
            *self.kill_timer.lock() = Some(handle);
        }
        true
    }

    /// Record the subprocess's exit and cancel any timers still pending.
    /// Called exactly once, by the exit-watch task. `None` means the wait
    /// itself failed and no status is available.
    pub(crate) fn finish(&self, status: Option<ExitStatus>) -> TerminalOutcome {
        let code = status.and_then(|s| s.code());
        let signal = status.and_then(signal_of);
        let success = status.is_some_and(|s| s.success());

        let state = match *self.stop_kind.lock() {
            Some(StopKind::Watchdog) => ConnectionState::Errored,
            Some(StopKind::Operator | StopKind::Replaced) => ConnectionState::Terminated,
            None if success => ConnectionState::Terminated,
            None => ConnectionState::Errored,
        };
        *self.state.lock() = state;

        self.cancel_watchdog();
        if let Some(handle) = self.kill_timer.lock().take() {
            handle.abort();
        }
        self.feed_tx.lock().take();

        let reason = self.reason.lock().clone().unwrap_or_else(|| match (code, signal) {
            (Some(0), _) => "encoder exited".to_string(),
            (Some(c), _) => format!("encoder exited with code {c}"),
            (None, Some(sig)) => format!("encoder terminated by signal {sig}"),
            _ => "encoder exited abnormally".to_string(),
        });

        TerminalOutcome {
            state,
            code,
            signal,
            reason,
        }
    }

    pub(crate) fn cancel_watchdog(&self) {
        if let Some(handle) = self.watchdog.lock().take() {
            handle.abort();
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            output_target: self.output_target.clone(),
            pid: self.pid,
            state: self.state(),
            bytes_received: self.stats.bytes_received(),
            chunk_count: self.stats.chunk_count(),
            error_count: self.stats.error_count(),
            started_at: self.stats.started_at,
            elapsed_ms: self.stats.elapsed().as_millis() as u64,
            last_data_age_ms: self.stats.last_data_age().map(|d| d.as_millis() as u64),
        }
    }
}

/// Drain queued chunks into the child's stdin, in submission order.
///
/// Exits when the sender side is dropped (stop path) or a write fails
/// (pipe broke under us); either way stdin is closed afterwards, which is
/// the end-of-stream signal to the encoder.
pub(crate) async fn run_feed_writer(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            warn!("Encoder stdin write failed: {e}");
            break;
        }
    }
    rx.close();
    stdin.shutdown().await.ok();
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}
