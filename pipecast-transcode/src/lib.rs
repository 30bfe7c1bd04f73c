// pipecast-transcode - live-stream transcoding session supervision
//
// Architecture:
// - encoder/   - FFmpeg resolution and subprocess spawning
// - session/   - per-session state machine, stats, stdin feed
// - monitor/   - stderr diagnostic classification
// - watchdog/  - no-input timer
// - registry/  - keyed session arena, start/feed/stop/status
// - notify/    - outward event contract
//
// One encoder subprocess per active session id; the registry composes the
// pieces and guarantees exactly one terminal notification and exactly one
// cleanup per session, whatever ends it.

pub mod config;
pub mod encoder;
pub mod error;
mod monitor;
pub mod notify;
pub mod registry;
pub mod session;
mod watchdog;

// Re-exports for convenience
pub use config::TranscoderConfig;
pub use encoder::EncoderProcessManager;
pub use error::{TranscodeError, TranscodeResult};
pub use notify::SessionNotifier;
pub use registry::SessionRegistry;
pub use session::{ConnectionState, SessionSnapshot};
