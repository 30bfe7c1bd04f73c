//! Session registry
//!
//! Keyed arena of active sessions and the composition point for the whole
//! subsystem: `start` validates, spawns, wires the feed writer, diagnostic
//! monitor, watchdog, and exit-watch task; `feed`/`stop`/`status` operate on
//! registry entries by id. One live subprocess per id at any instant:
//! starting over an existing id force-terminates the old session first
//! (last start wins).
//!
//! The exit-watch task is the single authoritative termination path.
//! Explicit stop, watchdog expiry, and replacement all merely close stdin
//! and/or cancel the kill token; the exit-watch task reaps the child,
//! classifies the exit, fires the one terminal `ended` notification, and
//! removes the registry entry exactly once.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::config::TranscoderConfig;
use crate::encoder::EncoderProcessManager;
use crate::monitor;
use crate::notify::SessionNotifier;
use crate::session::{
    self, Session, SessionSnapshot, StopKind, REASON_REPLACED, REASON_STOPPED,
};
use crate::watchdog;

/// Upper bound on how long a replacing `start` waits for the old session's
/// teardown. The old kill token is cancelled up front, so a SIGKILL-ed
/// encoder normally reaps in milliseconds; the bound only guards against a
/// wedged exit-watch task.
const REPLACE_TEARDOWN_WAIT: Duration = Duration::from_secs(5);

pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    encoder: Arc<EncoderProcessManager>,
    config: TranscoderConfig,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(encoder: Arc<EncoderProcessManager>, config: TranscoderConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            encoder,
            config,
        }
    }

    /// Start a session pushing to `output_target`.
    ///
    /// Returns `false` synchronously for an invalid target, a full registry,
    /// or a spawn failure; nothing is registered in those cases. An id that
    /// is already active is force-stopped first and replaced.
    pub async fn start(
        &self,
        id: &str,
        output_target: &str,
        notifier: Arc<dyn SessionNotifier>,
    ) -> bool {
        if !valid_output_target(output_target) {
            warn!("Rejecting session {id}: invalid output target {output_target:?}");
            return false;
        }

        let existing = self.sessions.get(id).map(|e| Arc::clone(e.value()));
        if let Some(old) = existing {
            info!("Session {id} already active, replacing (last start wins)");
            old.initiate_stop(StopKind::Replaced, REASON_REPLACED, Duration::ZERO);
            // The old encoder must be killed, reaped, and reported before
            // its replacement spawns; `mark_exited` fires at the end of the
            // old exit-watch task.
            if tokio::time::timeout(REPLACE_TEARDOWN_WAIT, old.wait_exited())
                .await
                .is_err()
            {
                warn!("Timed out waiting for replaced session {id} to exit");
            }
        } else if self.sessions.len() >= self.config.max_sessions {
            warn!(
                "Rejecting session {id}: registry full ({}/{})",
                self.sessions.len(),
                self.config.max_sessions
            );
            return false;
        }

        let process = match self.encoder.spawn(output_target) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to start session {id}: {e}");
                return false;
            }
        };

        let (feed_tx, feed_rx) = tokio::sync::mpsc::channel::<Bytes>(self.config.feed_depth);
        let session = Arc::new(Session::new(
            id.to_string(),
            output_target.to_string(),
            process.pid,
            notifier,
            feed_tx,
        ));

        tokio::spawn(session::run_feed_writer(process.stdin, feed_rx));
        tokio::spawn(monitor::run(Arc::clone(&session), process.stderr));
        session.set_watchdog(watchdog::arm(
            Arc::clone(&session),
            self.config.watchdog_window,
            self.config.forced_kill_deadline,
        ));

        self.sessions
            .insert(id.to_string(), Arc::clone(&session));
        tokio::spawn(supervise_exit(
            Arc::clone(&self.sessions),
            session,
            process.child,
        ));

        info!("Session {id} started, pushing to {output_target} (pid {})", process.pid);
        true
    }

    /// Forward one chunk to the session's encoder. `false` for an unknown id
    /// or when the input pipe is not currently writable.
    pub fn feed(&self, id: &str, chunk: Bytes) -> bool {
        match self.sessions.get(id) {
            Some(session) => session.feed(chunk),
            None => {
                debug!("Feed for unknown session {id}");
                false
            }
        }
    }

    /// Graceful stop: half-close stdin, then hard-kill after the configured
    /// deadline if the encoder has not exited. Idempotent; unknown ids are a
    /// no-op.
    pub fn stop(&self, id: &str) {
        let Some(session) = self.sessions.get(id).map(|e| Arc::clone(e.value())) else {
            debug!("Stop for unknown session {id}");
            return;
        };
        if session.initiate_stop(
            StopKind::Operator,
            REASON_STOPPED,
            self.config.forced_kill_deadline,
        ) {
            info!("Stopping session {id}");
        }
    }

    #[must_use]
    pub fn status(&self, id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(id).map(|e| e.value().snapshot())
    }

    #[must_use]
    pub fn status_all(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|e| e.value().snapshot()).collect()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Force-terminate every active session. Entries disappear as their
    /// exit-watch tasks reap the subprocesses.
    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry
                .value()
                .initiate_stop(StopKind::Operator, "registry shutdown", Duration::ZERO);
        }
    }
}

/// The single authoritative termination path.
///
/// Owns the `Child`. Waits for natural exit or the session's kill token
/// (forced-kill deadline, watchdog, replacement), reaps, classifies, fires
/// exactly one `ended`, and removes the registry entry belonging to this
/// session instance.
async fn supervise_exit(
    sessions: Arc<DashMap<String, Arc<Session>>>,
    session: Arc<Session>,
    mut child: Child,
) {
    let token = session.kill_token();
    let status = tokio::select! {
        status = child.wait() => status,
        () = token.cancelled() => {
            debug!("Hard-killing encoder for session {}", session.id());
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill encoder for session {}: {e}", session.id());
            }
            child.wait().await
        }
    };

    let outcome = match status {
        Ok(exit) => session.finish(Some(exit)),
        Err(e) => {
            warn!("Failed to reap encoder for session {}: {e}", session.id());
            session.finish(None)
        }
    };

    info!(
        "Session {} ended ({}, code {:?}, signal {:?}): {}",
        session.id(),
        outcome.state,
        outcome.code,
        outcome.signal,
        outcome.reason
    );
    session
        .notifier()
        .ended(session.id(), outcome.code, outcome.signal, &outcome.reason)
        .await;

    // Cleanup runs exactly once per lifecycle. The instance guard keeps a
    // replacement session registered under the same id untouched.
    sessions.remove_if(session.id(), |_, current| {
        current.instance() == session.instance()
    });
    session.mark_exited();
}

/// A target must be a non-empty URI with no unresolved `{placeholder}`
/// tokens left over from templating.
fn valid_output_target(target: &str) -> bool {
    let target = target.trim();
    !target.is_empty() && !target.contains('{') && !target.contains('}')
}
