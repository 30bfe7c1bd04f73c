// End-to-end lifecycle tests over a passthrough encoder.
//
// `cat` stands in for FFmpeg: it drains stdin, exits 0 on EOF, and dies to
// SIGKILL like any subprocess, which is everything the supervision layer
// cares about. Timing constants are shortened so watchdog and kill paths
// run in milliseconds.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use pipecast_transcode::{
    EncoderProcessManager, SessionNotifier, SessionRegistry, TranscoderConfig,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connected(String),
    Ended {
        id: String,
        code: Option<i32>,
        signal: Option<i32>,
        reason: String,
    },
    Error {
        id: String,
        message: String,
    },
}

struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
    ended_tx: mpsc::UnboundedSender<Event>,
}

impl RecordingNotifier {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                ended_tx,
            }),
            ended_rx,
        )
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events lock").clone()
    }

    fn ended_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Ended { .. }))
            .count()
    }

    fn connected_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Connected(_)))
            .count()
    }
}

#[async_trait]
impl SessionNotifier for RecordingNotifier {
    async fn connected(&self, session_id: &str) {
        self.events
            .lock()
            .expect("events lock")
            .push(Event::Connected(session_id.to_string()));
    }

    async fn ended(&self, session_id: &str, code: Option<i32>, signal: Option<i32>, reason: &str) {
        let event = Event::Ended {
            id: session_id.to_string(),
            code,
            signal,
            reason: reason.to_string(),
        };
        self.events.lock().expect("events lock").push(event.clone());
        self.ended_tx.send(event).ok();
    }

    async fn error(&self, session_id: &str, message: &str) {
        self.events.lock().expect("events lock").push(Event::Error {
            id: session_id.to_string(),
            message: message.to_string(),
        });
    }
}

fn cat_registry(config: TranscoderConfig) -> SessionRegistry {
    SessionRegistry::new(Arc::new(EncoderProcessManager::passthrough("cat")), config)
}

fn fast_config() -> TranscoderConfig {
    TranscoderConfig {
        watchdog_window: Duration::from_secs(5),
        forced_kill_deadline: Duration::from_millis(200),
        ..TranscoderConfig::default()
    }
}

async fn recv_ended(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for ended")
        .expect("notifier channel closed")
}

/// The entry is removed after the terminal notification, so poll briefly.
async fn wait_absent(registry: &SessionRegistry, id: &str) {
    for _ in 0..200 {
        if registry.status(id).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {id} still present after termination");
}

/// Stderr classification happens on the monitor task, so poll for effects.
async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn feed_updates_status_counters() {
    let registry = cat_registry(fast_config());
    let (notifier, mut ended_rx) = RecordingNotifier::new();

    assert!(
        registry
            .start("s1", "rtmp://ingest.example.com/app/key1", notifier.clone())
            .await
    );

    let chunk = Bytes::from(vec![0u8; 64 * 1024]);
    for _ in 0..10 {
        assert!(registry.feed("s1", chunk.clone()));
    }

    let snap = registry.status("s1").expect("active session");
    assert_eq!(snap.chunk_count, 10);
    assert_eq!(snap.bytes_received, 655_360);
    // No diagnostic output from cat, so no connection marker was seen.
    assert_eq!(snap.state, pipecast_transcode::ConnectionState::Starting);

    registry.stop("s1");
    let ended = recv_ended(&mut ended_rx).await;
    assert!(
        matches!(ended, Event::Ended { ref reason, .. } if reason == "stopped by caller"),
        "unexpected event: {ended:?}"
    );
    wait_absent(&registry, "s1").await;
}

#[tokio::test]
async fn counters_never_decrease() {
    let registry = cat_registry(fast_config());
    let (notifier, mut ended_rx) = RecordingNotifier::new();

    assert!(
        registry
            .start("mono", "rtmp://ingest.example.com/app/key", notifier)
            .await
    );

    let mut last_bytes = 0;
    let mut last_chunks = 0;
    for i in 1..=5 {
        assert!(registry.feed("mono", Bytes::from(vec![0u8; 100 * i])));
        let snap = registry.status("mono").expect("active session");
        assert!(snap.bytes_received >= last_bytes);
        assert!(snap.chunk_count >= last_chunks);
        last_bytes = snap.bytes_received;
        last_chunks = snap.chunk_count;
    }

    registry.stop("mono");
    recv_ended(&mut ended_rx).await;
}

#[tokio::test]
async fn second_start_replaces_first() {
    let registry = cat_registry(fast_config());
    let (first, mut first_ended) = RecordingNotifier::new();
    let (second, mut second_ended) = RecordingNotifier::new();

    assert!(
        registry
            .start("s1", "rtmp://ingest.example.com/app/t1", first.clone())
            .await
    );
    assert!(
        registry
            .start("s1", "rtmp://ingest.example.com/app/t2", second)
            .await
    );

    assert_eq!(registry.active_count(), 1);
    let snap = registry.status("s1").expect("replacement session");
    assert_eq!(snap.output_target, "rtmp://ingest.example.com/app/t2");

    // The first subprocess was force-terminated, reaped, and reported
    // before the replacing `start` returned.
    assert_eq!(first.ended_count(), 1);
    let ended = recv_ended(&mut first_ended).await;
    assert!(
        matches!(ended, Event::Ended { ref reason, .. } if reason == "replaced by newer start"),
        "unexpected event: {ended:?}"
    );

    // The replacement is still live and accepts input.
    assert!(registry.feed("s1", Bytes::from_static(b"data")));

    registry.stop("s1");
    recv_ended(&mut second_ended).await;
    wait_absent(&registry, "s1").await;
}

#[tokio::test]
async fn invalid_targets_are_rejected_without_side_effects() {
    let registry = cat_registry(fast_config());
    let (notifier, _ended_rx) = RecordingNotifier::new();

    assert!(!registry.start("s2", "", notifier.clone()).await);
    assert!(
        !registry
            .start("s2", "rtmp://ingest.example.com/app/{stream_key}", notifier.clone())
            .await
    );

    assert_eq!(registry.active_count(), 0);
    assert!(registry.status("s2").is_none());
    assert!(notifier.events().is_empty());
}

#[tokio::test]
async fn spawn_failure_registers_nothing() {
    let registry = SessionRegistry::new(
        Arc::new(EncoderProcessManager::passthrough(
            "/nonexistent/definitely-not-an-encoder",
        )),
        fast_config(),
    );
    let (notifier, _ended_rx) = RecordingNotifier::new();

    assert!(
        !registry
            .start("s1", "rtmp://ingest.example.com/app/key", notifier.clone())
            .await
    );
    assert_eq!(registry.active_count(), 0);
    assert!(notifier.events().is_empty());
}

#[tokio::test]
async fn watchdog_stops_session_with_no_input() {
    let config = TranscoderConfig {
        watchdog_window: Duration::from_millis(100),
        forced_kill_deadline: Duration::from_millis(200),
        ..TranscoderConfig::default()
    };
    let registry = cat_registry(config);
    let (notifier, mut ended_rx) = RecordingNotifier::new();

    assert!(
        registry
            .start("s3", "rtmp://ingest.example.com/app/key", notifier)
            .await
    );

    let ended = recv_ended(&mut ended_rx).await;
    assert!(
        matches!(ended, Event::Ended { ref reason, .. } if reason == "no input received"),
        "unexpected event: {ended:?}"
    );
    wait_absent(&registry, "s3").await;
    assert!(!registry.feed("s3", Bytes::from_static(b"late")));
}

#[tokio::test]
async fn fed_session_outlives_the_watchdog_window() {
    let config = TranscoderConfig {
        watchdog_window: Duration::from_millis(100),
        forced_kill_deadline: Duration::from_millis(200),
        ..TranscoderConfig::default()
    };
    let registry = cat_registry(config);
    let (notifier, mut ended_rx) = RecordingNotifier::new();

    assert!(
        registry
            .start("s4", "rtmp://ingest.example.com/app/key", notifier)
            .await
    );
    assert!(registry.feed("s4", Bytes::from_static(b"first chunk")));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(registry.status("s4").is_some(), "watchdog fired despite input");

    registry.stop("s4");
    recv_ended(&mut ended_rx).await;
}

#[tokio::test]
async fn stop_is_idempotent_and_ends_once() {
    let registry = cat_registry(fast_config());
    let (notifier, mut ended_rx) = RecordingNotifier::new();

    assert!(
        registry
            .start("s5", "rtmp://ingest.example.com/app/key", notifier.clone())
            .await
    );
    assert!(registry.feed("s5", Bytes::from_static(b"data")));

    registry.stop("s5");
    registry.stop("s5");
    recv_ended(&mut ended_rx).await;
    wait_absent(&registry, "s5").await;

    // Stopping an already-removed id is a no-op too.
    registry.stop("s5");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(notifier.ended_count(), 1);
}

#[tokio::test]
async fn registry_cap_rejects_new_ids_but_allows_replacement() {
    let config = TranscoderConfig {
        max_sessions: 2,
        ..fast_config()
    };
    let registry = cat_registry(config);
    let (notifier, _ended_rx) = RecordingNotifier::new();

    assert!(
        registry
            .start("a", "rtmp://ingest.example.com/app/a", notifier.clone())
            .await
    );
    assert!(
        registry
            .start("b", "rtmp://ingest.example.com/app/b", notifier.clone())
            .await
    );

    // A third distinct id exceeds the cap and registers nothing.
    assert!(
        !registry
            .start("c", "rtmp://ingest.example.com/app/c", notifier.clone())
            .await
    );
    assert_eq!(registry.active_count(), 2);
    assert!(registry.status("c").is_none());

    // Replacing an active id never counts against the cap.
    assert!(
        registry
            .start("a", "rtmp://ingest.example.com/app/a2", notifier.clone())
            .await
    );
    assert_eq!(registry.active_count(), 2);
    let snap = registry.status("a").expect("replacement session");
    assert_eq!(snap.output_target, "rtmp://ingest.example.com/app/a2");

    registry.shutdown();
}

#[tokio::test]
async fn diagnostics_drive_connection_state_and_error_counters() {
    // `sh` reads commands from stdin, so fed chunks can emit arbitrary
    // stderr lines and exercise the monitor against a live pipe.
    let registry = SessionRegistry::new(
        Arc::new(EncoderProcessManager::passthrough("/bin/sh")),
        fast_config(),
    );
    let (notifier, mut ended_rx) = RecordingNotifier::new();

    assert!(
        registry
            .start("diag", "rtmp://ingest.example.com/app/key", notifier.clone())
            .await
    );

    // A connection marker flips Starting -> Connected exactly once.
    assert!(registry.feed("diag", Bytes::from_static(b"echo 'Stream mapping:' >&2\n")));
    wait_until("Connected state", || {
        registry
            .status("diag")
            .is_some_and(|s| s.state == pipecast_transcode::ConnectionState::Connected)
    })
    .await;

    // A second marker must not fire another connected event.
    assert!(registry.feed(
        "diag",
        Bytes::from_static(b"echo 'frame=  1 fps=30 time=00:00:01.00 bitrate=2000.0kbits/s' >&2\n")
    ));

    // An error-vocabulary line bumps the counter and surfaces an error
    // event, but the session keeps running.
    assert!(registry.feed(
        "diag",
        Bytes::from_static(b"echo 'Error writing trailer: Broken pipe' >&2\n")
    ));
    wait_until("error counter", || {
        registry.status("diag").is_some_and(|s| s.error_count == 1)
    })
    .await;

    let snap = registry.status("diag").expect("session still active");
    assert_eq!(snap.state, pipecast_transcode::ConnectionState::Connected);
    assert_eq!(snap.error_count, 1);
    assert_eq!(notifier.connected_count(), 1);
    assert!(
        notifier.events().iter().any(|e| matches!(
            e,
            Event::Error { id, message } if id == "diag" && message.contains("Broken pipe")
        )),
        "missing error event: {:?}",
        notifier.events()
    );

    registry.stop("diag");
    recv_ended(&mut ended_rx).await;
    wait_absent(&registry, "diag").await;
}

#[tokio::test]
async fn feed_unknown_session_is_rejected() {
    let registry = cat_registry(fast_config());
    assert!(!registry.feed("never-started", Bytes::from_static(b"data")));
    assert!(registry.status("never-started").is_none());
    assert!(registry.status_all().is_empty());
}
