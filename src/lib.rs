pub mod audio_io;
pub mod cancel;
pub mod config;
pub mod decode;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod graph;
pub mod mixdown;
pub mod models;
pub mod phases;
pub mod ramp;
pub mod session;
pub mod source;
pub mod timeline;
pub mod transport;

pub use config::{EngineConfig, OutputMode, CONFIG};
pub use engine::{Engine, PlayerGroup, SharedEngine};
pub use error::EngineError;
pub use models::{ChannelId, ChannelSettings, SessionDescriptor, SourceDescriptor, TimerPreset};
pub use session::{SessionOptions, SessionProgress, SessionSequencer, SessionStage};
pub use transport::{PlayerProfile, TransportController, TransportEvent, TransportState};
