//! Loopable ambience beds synthesized from white noise.
//!
//! Every call draws fresh randomness, so two buffers of the same kind are
//! interchangeable but never bit-identical. Buffers are held in memory for
//! the life of the channel; callers keep durations short and loop them.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

use super::{limit_peak, PcmBuffer};

/// Longest bed the engine will synthesize.
pub const MAX_GENERATED_SECONDS: f32 = 60.0;

const PINK_PEAK_LIMIT: f32 = 0.95;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NoiseKind {
    Pink,
    Wind,
    Rain,
}

impl NoiseKind {
    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_ascii_lowercase().as_str() {
            "pink" | "pink_noise" => Some(NoiseKind::Pink),
            "wind" => Some(NoiseKind::Wind),
            "rain" => Some(NoiseKind::Rain),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            NoiseKind::Pink => "pink",
            NoiseKind::Wind => "wind",
            NoiseKind::Rain => "rain",
        }
    }
}

/// Number of samples a bed of `duration_seconds` holds at `sample_rate`.
pub fn buffer_len(duration_seconds: f32, sample_rate: u32) -> usize {
    if !(duration_seconds > 0.0) {
        return 0;
    }
    (sample_rate as f64 * duration_seconds as f64).floor() as usize
}

pub fn synthesize(kind: NoiseKind, duration_seconds: f32, sample_rate: u32) -> PcmBuffer {
    synthesize_with_rng(kind, duration_seconds, sample_rate, &mut rand::thread_rng())
}

pub fn synthesize_with_rng<R: Rng + ?Sized>(
    kind: NoiseKind,
    duration_seconds: f32,
    sample_rate: u32,
    rng: &mut R,
) -> PcmBuffer {
    let duration = duration_seconds.min(MAX_GENERATED_SECONDS);
    let n = buffer_len(duration, sample_rate);
    let samples = match kind {
        NoiseKind::Pink => pink(n, rng),
        NoiseKind::Wind => wind(n, sample_rate, rng),
        NoiseKind::Rain => rain(n, duration, sample_rate, rng),
    };
    PcmBuffer::mono(samples, sample_rate)
}

#[inline]
fn white<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    rng.gen::<f32>() * 2.0 - 1.0
}

fn pink<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<f32> {
    let (mut b0, mut b1, mut b2, mut b3, mut b4, mut b5, mut b6) =
        (0.0f32, 0.0f32, 0.0f32, 0.0f32, 0.0f32, 0.0f32, 0.0f32);
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let w = white(rng);
        b0 = 0.99886 * b0 + w * 0.0555179;
        b1 = 0.99332 * b1 + w * 0.0750759;
        b2 = 0.96900 * b2 + w * 0.1538520;
        b3 = 0.86650 * b3 + w * 0.3104856;
        b4 = 0.55000 * b4 + w * 0.5329522;
        b5 = -0.7616 * b5 - w * 0.0168980;
        out.push((b0 + b1 + b2 + b3 + b4 + b5 + b6 + w * 0.5362) * 0.11);
        b6 = w * 0.115926;
    }
    // rare excursions of the filter bank would otherwise clip
    limit_peak(&mut out, PINK_PEAK_LIMIT);
    out
}

fn wind<R: Rng + ?Sized>(n: usize, sample_rate: u32, rng: &mut R) -> Vec<f32> {
    let lfo_hz = rng.gen_range(0.08f32..0.13);
    let phase = rng.gen_range(0.0f32..2.0 * PI);
    let sr = sample_rate.max(1) as f32;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let t = i as f32 / sr;
        let env = 0.6 + 0.4 * (2.0 * PI * lfo_hz * t + phase).sin();
        out.push(white(rng) * env * 0.12);
    }
    out
}

fn rain<R: Rng + ?Sized>(n: usize, duration: f32, sample_rate: u32, rng: &mut R) -> Vec<f32> {
    let mut out: Vec<f32> = (0..n).map(|_| white(rng) * 0.05).collect();
    if n == 0 {
        return out;
    }
    let sr = sample_rate.max(1) as f32;
    let drops = (35.0 * duration).floor() as usize;
    for _ in 0..drops {
        let start = rng.gen_range(0..n);
        let tau = rng.gen_range(0.005f32..=0.025) * sr;
        let amp = rng.gen_range(0.08f32..=0.20);
        // five time constants puts the tail below 1% of the attack
        let len = ((tau * 5.0) as usize).max(1);
        let end = (start + len).min(n);
        for (k, sample) in out[start..end].iter_mut().enumerate() {
            *sample += amp * white(rng) * (-(k as f32) / tau.max(1e-3)).exp();
        }
    }
    for s in out.iter_mut() {
        *s = s.tanh();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn pink_buffer_shape() {
        let buf = synthesize(NoiseKind::Pink, 12.0, 44100);
        assert_eq!(buf.frames(), 44100 * 12);
        assert_eq!(buf.channels(), 1);
        assert!(buf.peak() < 1.0);
        let first = buf.samples()[0];
        assert!(buf.samples().iter().any(|&s| s != first));
        assert!(buf.peak() > 0.0);
    }

    #[test]
    fn every_kind_stays_below_full_scale() {
        let mut rng = StdRng::seed_from_u64(7);
        for kind in [NoiseKind::Pink, NoiseKind::Wind, NoiseKind::Rain] {
            let buf = synthesize_with_rng(kind, 3.0, 8000, &mut rng);
            assert_eq!(buf.frames(), 24000, "{kind:?}");
            assert!(buf.peak() < 1.0, "{kind:?} clipped");
            assert!(buf.peak() > 0.0, "{kind:?} silent");
        }
    }

    #[test]
    fn wind_is_bounded_by_envelope() {
        let mut rng = StdRng::seed_from_u64(11);
        let buf = synthesize_with_rng(NoiseKind::Wind, 2.0, 8000, &mut rng);
        assert!(buf.peak() <= 0.12 + 1e-6);
    }

    #[test]
    fn length_is_floored() {
        assert_eq!(buffer_len(0.5, 44101), 22050);
        assert_eq!(buffer_len(0.0, 44100), 0);
        assert_eq!(buffer_len(-1.0, 44100), 0);
        let buf = synthesize(NoiseKind::Rain, 0.0, 44100);
        assert_eq!(buf.frames(), 0);
    }

    #[test]
    fn duration_is_capped() {
        let buf = synthesize(NoiseKind::Wind, 600.0, 100);
        assert_eq!(buf.frames(), buffer_len(MAX_GENERATED_SECONDS, 100));
    }

    #[test]
    fn consecutive_calls_differ() {
        let a = synthesize(NoiseKind::Pink, 0.1, 8000);
        let b = synthesize(NoiseKind::Pink, 0.1, 8000);
        assert_eq!(a.frames(), b.frames());
        assert_ne!(a.samples(), b.samples());
    }

    #[test]
    fn noise_ids() {
        assert_eq!(NoiseKind::from_id("Rain"), Some(NoiseKind::Rain));
        assert_eq!(NoiseKind::from_id("ocean"), None);
    }
}
