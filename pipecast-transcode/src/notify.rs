// Notifier contract
//
// The only outward signals a session ever produces. The registry holds the
// caller-supplied sink behind `Arc<dyn SessionNotifier>`; subprocess handles
// never cross this boundary.

use async_trait::async_trait;

/// Event sink supplied by the caller at `start`.
///
/// Every session produces exactly one `ended` regardless of how it
/// terminated (explicit stop, crash, or watchdog). `connected` fires at
/// most once, when the encoder's diagnostics first indicate that the remote
/// ingestion endpoint accepted the stream.
#[async_trait]
pub trait SessionNotifier: Send + Sync + 'static {
    async fn connected(&self, session_id: &str);

    /// `code`/`signal` come from the encoder's exit status; `reason` is a
    /// human-readable summary ("stopped by caller", "no input received",
    /// "encoder exited with code 1", ...).
    async fn ended(&self, session_id: &str, code: Option<i32>, signal: Option<i32>, reason: &str);

    /// An error-classified diagnostic line. Informational only; the session
    /// keeps running until its subprocess actually exits.
    async fn error(&self, session_id: &str, message: &str);
}
