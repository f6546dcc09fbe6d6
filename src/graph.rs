//! Output context, per-channel gains, master gain and the block renderer.

use crate::dsp::PeakLimiter;
use crate::error::EngineError;
use crate::models::ChannelId;
use crate::ramp::{set_immediate, GainParam};
use crate::source::{self, ChannelSource, MediaElement};

const OUTPUT_CEILING: f32 = 0.95;
const LIMITER_RELEASE_MS: f32 = 50.0;

/// Lifecycle of the output context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Suspended,
    Running,
    Closed,
}

/// One of the four mixer inputs.
#[derive(Debug)]
pub struct Channel {
    pub id: ChannelId,
    pub gain: GainParam,
    /// Volume the channel ramps to when it plays (0..1).
    pub target: f32,
    pub enabled: bool,
    pub muted: bool,
    pub source: ChannelSource,
    /// Created on the first streamed attach and kept for the graph's lifetime.
    pub element: Option<MediaElement>,
    /// Live connections into the channel gain.
    pub connections: usize,
}

impl Channel {
    fn new(id: ChannelId) -> Self {
        Self {
            id,
            gain: GainParam::new(0.0),
            target: 1.0,
            enabled: true,
            muted: false,
            source: ChannelSource::Empty,
            element: None,
            connections: 0,
        }
    }

    /// Volume the channel should sit at given its enabled flag.
    pub fn effective_target(&self) -> f32 {
        if self.enabled {
            self.target
        } else {
            0.0
        }
    }

    pub fn has_source(&self) -> bool {
        !self.source.is_empty()
    }

    /// True while a non-looping streamed source has run out.
    pub fn streamed_ended(&self) -> bool {
        matches!(self.source, ChannelSource::Streamed)
            && self.element.as_ref().map(|e| e.has_ended()).unwrap_or(false)
    }

    #[inline]
    fn next_frame(&mut self) -> Option<(f32, f32)> {
        match &mut self.source {
            ChannelSource::Empty => None,
            ChannelSource::Generated(unit) => unit.next_frame(),
            ChannelSource::Streamed => self.element.as_mut().and_then(|e| e.next_frame()),
        }
    }
}

pub struct AudioGraph {
    state: ContextState,
    sample_rate: u32,
    clock: u64,
    channels: [Channel; 4],
    master: GainParam,
    limiter: PeakLimiter,
}

impl AudioGraph {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            state: ContextState::Uninitialized,
            sample_rate,
            clock: 0,
            channels: ChannelId::ALL.map(Channel::new),
            master: GainParam::new(1.0),
            limiter: PeakLimiter::new(OUTPUT_CEILING, LIMITER_RELEASE_MS, sample_rate),
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Audio clock in frames. Only advances while running.
    pub fn now(&self) -> u64 {
        self.clock
    }

    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }

    pub fn frames_to_seconds(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate.max(1) as f64
    }

    pub fn is_running(&self) -> bool {
        self.state == ContextState::Running
    }

    /// Create the context if needed. Repeated calls are no-ops.
    pub fn ensure(&mut self) -> Result<(), EngineError> {
        match self.state {
            ContextState::Closed => Err(EngineError::Disposed),
            ContextState::Uninitialized => {
                self.state = ContextState::Suspended;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn resume(&mut self) -> Result<(), EngineError> {
        self.ensure()?;
        self.state = ContextState::Running;
        Ok(())
    }

    pub fn suspend(&mut self) {
        if self.state == ContextState::Running {
            self.state = ContextState::Suspended;
        }
    }

    /// Close the context and drop every source and connection.
    pub fn dispose(&mut self) {
        if self.state == ContextState::Closed {
            return;
        }
        for ch in self.channels.iter_mut() {
            source::detach(ch);
            ch.element = None;
            ch.connections = 0;
            set_immediate(&mut ch.gain, 0.0);
        }
        self.state = ContextState::Closed;
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[id.index()]
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> &mut Channel {
        &mut self.channels[id.index()]
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.iter_mut()
    }

    pub fn master_mut(&mut self) -> &mut GainParam {
        &mut self.master
    }

    /// Current value of a channel's gain.
    pub fn gain_of(&self, id: ChannelId) -> f32 {
        self.channel(id).gain.value_at(self.clock)
    }

    /// Mix one block of interleaved stereo into `out`.
    ///
    /// Returns the channels whose non-looping streamed source ended during
    /// the block. Outside the running state the block is silent and the clock
    /// holds.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<ChannelId> {
        out.fill(0.0);
        if self.state != ContextState::Running {
            return Vec::new();
        }
        let ended_before = self.channels.each_ref().map(|c| c.streamed_ended());

        for frame in out.chunks_mut(2) {
            let now = self.clock;
            let mut l = 0.0f32;
            let mut r = 0.0f32;
            for ch in self.channels.iter_mut() {
                let Some((sl, sr)) = ch.next_frame() else {
                    continue;
                };
                if ch.muted {
                    continue;
                }
                let g = ch.gain.value_at(now);
                l += sl * g;
                r += sr * g;
            }
            let m = self.master.value_at(now);
            let (l, r) = self.limiter.process(l * m, r * m);
            frame[0] = l;
            if frame.len() > 1 {
                frame[1] = r;
            }
            self.clock += 1;
        }

        let now = self.clock;
        self.master.settle(now);
        let mut ended = Vec::new();
        for (i, ch) in self.channels.iter_mut().enumerate() {
            ch.gain.settle(now);
            if !ended_before[i] && ch.streamed_ended() {
                ended.push(ch.id);
            }
        }
        ended
    }
}
