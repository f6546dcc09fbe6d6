//! Timed session playback: ambience prelude, voice, closing fade.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::models::{ChannelId, PreludePreset, SessionDescriptor, SourceDescriptor};
use crate::phases::PhaseKind;
use crate::transport::{prepare_all, TransportController, TransportState};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStage {
    Idle,
    /// Beds are playing, the voice waits.
    Prelude,
    Voice,
    /// Voice ended; the remaining layers fade out.
    Finishing,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOptions {
    pub prelude: PreludePreset,
    /// Play the pre-mixed track alone when the descriptor has one.
    pub prefer_mixdown: bool,
    /// Optional generated bed on the noise channel.
    pub noise: Option<SourceDescriptor>,
    /// Requested session length; defaults to the voice length plus the
    /// ambience margins.
    pub total_seconds: Option<f64>,
}

/// Snapshot for a UI polling the session.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionProgress {
    pub stage: SessionStage,
    pub phase: Option<PhaseKind>,
    pub phase_index: usize,
    pub phase_fraction: f64,
    pub phase_text: Option<String>,
    pub elapsed_seconds: f64,
    pub total_seconds: f64,
}

impl SessionProgress {
    pub fn idle() -> Self {
        Self {
            stage: SessionStage::Idle,
            phase: None,
            phase_index: 0,
            phase_fraction: 0.0,
            phase_text: None,
            elapsed_seconds: 0.0,
            total_seconds: 0.0,
        }
    }
}

/// Drives one session on top of a [`TransportController`].
pub struct SessionSequencer {
    transport: TransportController,
}

impl SessionSequencer {
    pub fn new(transport: TransportController) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &TransportController {
        &self.transport
    }

    /// Silence sibling players, prepare every layer, start the beds and
    /// schedule the voice after the prelude.
    pub fn start(&self, descriptor: &SessionDescriptor, options: &SessionOptions) -> Result<(), EngineError> {
        let engine = self.transport.engine();
        if let Some(group) = self.transport.group() {
            group.silence_others(engine);
        }
        let plan = engine.lock().begin_session(descriptor, options)?;
        if let Err(e) = self.transport.ensure_output() {
            warn!(error = %e, "output unavailable; session not started");
            engine.lock().abort_start(plan.token);
            return Err(e);
        }
        let prepared = prepare_all(&plan.requests, self.transport.source_context());
        engine
            .lock()
            .finish_session(plan.token, prepared, descriptor, options)?;
        info!(prelude = options.prelude.seconds(), "session started");
        Ok(())
    }

    pub fn stop(&self) {
        self.transport.engine().lock().stop_session();
    }

    pub fn stage(&self) -> SessionStage {
        self.transport.engine().lock().session_stage()
    }

    pub fn progress(&self) -> SessionProgress {
        self.transport.engine().lock().session_progress()
    }

    pub fn is_mixdown(&self) -> bool {
        self.transport.engine().lock().in_mixdown_mode()
    }

    /// Returns `false` when per-layer volumes do not apply (mixdown mode).
    pub fn set_layer_volume(&self, channel: ChannelId, volume: f32) -> bool {
        self.transport.engine().lock().set_layer_volume(channel, volume)
    }

    pub fn is_active(&self) -> bool {
        self.transport.state() != TransportState::Idle
    }
}
