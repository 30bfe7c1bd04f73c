//! No-input watchdog
//!
//! Single-shot timer armed once per session at `start`. If no chunk has been
//! fed when the window elapses, the session is force-stopped with reason
//! "no input received", which propagates to the `ended` notification. The
//! first accepted chunk aborts the timer permanently; it is never re-armed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::session::{Session, StopKind, REASON_NO_INPUT};

pub(crate) fn arm(
    session: Arc<Session>,
    window: Duration,
    kill_deadline: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(window).await;

        // The feed path aborts this task on the first chunk, so reaching
        // this point normally means the session never received input. The
        // recheck covers the abort racing the timer expiry.
        if session.stats().chunk_count() > 0 {
            return;
        }

        warn!(
            "Session {} received no input within {:?}, forcing stop",
            session.id(),
            window
        );
        session.initiate_stop(StopKind::Watchdog, REASON_NO_INPUT, kill_deadline);
    })
}
