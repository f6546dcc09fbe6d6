//! Binaural tone beds: left ear at the carrier, right ear at carrier + beat.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

use super::noise::{buffer_len, MAX_GENERATED_SECONDS};
use super::PcmBuffer;

pub const DEFAULT_CARRIER_HZ: f32 = 180.0;
const ENVELOPE_HZ: f32 = 0.1;
const BED_GAIN: f32 = 0.12;

pub fn default_carrier_hz() -> f32 {
    DEFAULT_CARRIER_HZ
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BinauralBand {
    Auto,
    Delta,
    Theta,
    Alpha,
    Beta,
    Gamma,
}

impl BinauralBand {
    /// Typical beat frequency, roughly the middle of each band.
    pub fn beat_hz(self) -> Option<f32> {
        match self {
            BinauralBand::Auto => None,
            BinauralBand::Delta => Some(2.0),
            BinauralBand::Theta => Some(6.0),
            BinauralBand::Alpha => Some(10.0),
            BinauralBand::Beta => Some(18.0),
            BinauralBand::Gamma => Some(40.0),
        }
    }
}

/// What the listener asked the session to help with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    #[serde(alias = "sommeil")]
    Sleep,
    Stress,
    #[serde(alias = "confiance")]
    Confidence,
    Performance,
    #[serde(alias = "douleur")]
    Pain,
    #[serde(other)]
    Other,
}

/// Pick the band and beat for a session. An explicit positive beat wins,
/// then an explicit band, then the goal.
pub fn pick_band_and_beat(
    band: BinauralBand,
    goal: Goal,
    beat_override_hz: Option<f32>,
) -> (BinauralBand, f32) {
    if let Some(beat) = beat_override_hz.filter(|b| *b > 0.0) {
        return (band, beat);
    }
    if let Some(beat) = band.beat_hz() {
        return (band, beat);
    }
    let chosen = match goal {
        Goal::Sleep | Goal::Pain => BinauralBand::Delta,
        Goal::Stress | Goal::Confidence => BinauralBand::Alpha,
        Goal::Performance => BinauralBand::Gamma,
        Goal::Other => BinauralBand::Theta,
    };
    (chosen, chosen.beat_hz().unwrap_or(6.0))
}

/// Snap `freq` to a whole number of cycles over `period` seconds so the
/// buffer loops without a phase jump.
fn loop_aligned(freq: f32, period: f32) -> f32 {
    if period <= 0.0 {
        return freq;
    }
    let cycles = (freq * period).round().max(1.0);
    cycles / period
}

/// Stereo bed of `duration_seconds`, loop-aligned, scaled to 0.12.
pub fn synthesize(carrier_hz: f32, beat_hz: f32, duration_seconds: f32, sample_rate: u32) -> PcmBuffer {
    let duration = duration_seconds.min(MAX_GENERATED_SECONDS);
    let n = buffer_len(duration, sample_rate);
    let period = n as f32 / sample_rate.max(1) as f32;
    let left_hz = loop_aligned(carrier_hz, period);
    let right_hz = loop_aligned(carrier_hz + beat_hz, period);
    let env_hz = loop_aligned(ENVELOPE_HZ, period);
    let sr = sample_rate.max(1) as f32;

    let mut out = Vec::with_capacity(n * 2);
    for i in 0..n {
        let t = i as f32 / sr;
        let env = 0.6 + 0.4 * (2.0 * PI * env_hz * t).sin();
        out.push((2.0 * PI * left_hz * t).sin() * env * BED_GAIN);
        out.push((2.0 * PI * right_hz * t).sin() * env * BED_GAIN);
    }
    PcmBuffer::stereo(out, sample_rate)
}
