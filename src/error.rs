//! Engine error types (thiserror-based).

use thiserror::Error;

use crate::models::ChannelId;

/// Every failure the engine surfaces to callers.
///
/// Stale operations (a finalize or sleep whose token no longer matches) are
/// expected control flow and never show up here.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A streamed source failed its reachability pre-flight or could not be fetched.
    #[error("{channel} source unreachable at {url}: {reason}")]
    Unreachable {
        channel: ChannelId,
        url: String,
        reason: String,
    },

    /// The fetched bytes could not be decoded as audio.
    #[error("failed to decode {channel} audio from {url}: {reason}")]
    Decode {
        channel: ChannelId,
        url: String,
        reason: String,
    },

    /// The output device refused to open or start; playback stays stopped.
    #[error("playback blocked: {reason}")]
    PlaybackBlocked { reason: String },

    /// The graph was disposed and cannot be used again.
    #[error("audio graph has been disposed")]
    Disposed,

    /// A descriptor or option outside what the engine accepts.
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

impl EngineError {
    /// Channel the error is attributed to, if any.
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            EngineError::Unreachable { channel, .. } | EngineError::Decode { channel, .. } => {
                Some(*channel)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_names_channel_and_url() {
        let err = EngineError::Unreachable {
            channel: ChannelId::Music,
            url: "http://localhost:8000/assets/music/a.wav".to_string(),
            reason: "HTTP 404".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "music source unreachable at http://localhost:8000/assets/music/a.wav: HTTP 404"
        );
        assert_eq!(err.channel(), Some(ChannelId::Music));
    }

    #[test]
    fn io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
        assert_eq!(err.channel(), None);
    }
}
