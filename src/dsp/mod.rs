pub mod binaural;
pub mod noise;

use std::sync::Arc;

/// Immutable interleaved PCM shared between a source unit and whoever built it.
#[derive(Clone, Debug)]
pub struct PcmBuffer {
    samples: Arc<[f32]>,
    channels: u16,
    sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            channels: channels.max(1),
            sample_rate,
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, 1, sample_rate)
    }

    pub fn stereo(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, 2, sample_rate)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Stereo pair for `frame`; mono buffers are duplicated to both sides.
    #[inline]
    pub fn frame(&self, frame: usize) -> (f32, f32) {
        match self.channels {
            1 => {
                let s = self.samples[frame];
                (s, s)
            }
            n => {
                let idx = frame * n as usize;
                (self.samples[idx], self.samples[idx + 1])
            }
        }
    }

    pub fn peak(&self) -> f32 {
        peak(&self.samples)
    }
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |a, b| a.max(b.abs()))
}

/// Scale the whole buffer down when its peak exceeds `threshold`.
pub fn limit_peak(samples: &mut [f32], threshold: f32) {
    let max_val = peak(samples);
    if max_val > threshold {
        let norm = threshold / max_val;
        for v in samples.iter_mut() {
            *v *= norm;
        }
    }
}

/// Output limiter whose gain is carried from frame to frame, so cutting a
/// stream into blocks of any size never changes the result.
///
/// Attack is immediate (no frame leaves above `threshold`); release moves the
/// gain back toward 1 with a one-pole curve.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakLimiter {
    threshold: f32,
    release: f32,
    gain: f32,
}

impl PeakLimiter {
    pub fn new(threshold: f32, release_ms: f32, sample_rate: u32) -> Self {
        let frames = (release_ms.max(0.1) * 0.001 * sample_rate.max(1) as f32).max(1.0);
        Self {
            threshold,
            release: (-1.0 / frames).exp(),
            gain: 1.0,
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn reset(&mut self) {
        self.gain = 1.0;
    }

    #[inline]
    pub fn process(&mut self, l: f32, r: f32) -> (f32, f32) {
        let released = 1.0 - (1.0 - self.gain) * self.release;
        let level = l.abs().max(r.abs());
        let needed = if level * released > self.threshold {
            self.threshold / level
        } else {
            released
        };
        self.gain = needed.min(released);
        (l * self.gain, r * self.gain)
    }
}

/// Linear fade-in over the first and fade-out over the last `fade_seconds`
/// of a single-channel signal. Signals shorter than two fades are untouched.
pub fn fade_in_out(signal: &mut [f32], fade_seconds: f32, sample_rate: u32) {
    let n = (fade_seconds * sample_rate as f32) as usize;
    if n == 0 || n * 2 > signal.len() {
        return;
    }
    let len = signal.len();
    let denom = (n - 1).max(1) as f32;
    for i in 0..n {
        let w = i as f32 / denom;
        signal[i] *= w;
        signal[len - 1 - i] *= w;
    }
}

/// Same as [`fade_in_out`] for interleaved stereo.
pub fn fade_in_out_stereo(signal: &mut [f32], fade_seconds: f32, sample_rate: u32) {
    let frames = signal.len() / 2;
    let n = (fade_seconds * sample_rate as f32) as usize;
    if n == 0 || n * 2 > frames {
        return;
    }
    let denom = (n - 1).max(1) as f32;
    for i in 0..n {
        let w = i as f32 / denom;
        let head = i * 2;
        let tail = (frames - 1 - i) * 2;
        signal[head] *= w;
        signal[head + 1] *= w;
        signal[tail] *= w;
        signal[tail + 1] *= w;
    }
}

/// Scale so the RMS of `signal` lands on `target_db` dBFS.
pub fn normalize_rms(signal: &mut [f32], target_db: f32) {
    if signal.is_empty() {
        return;
    }
    let sum_sq: f64 = signal.iter().map(|&s| s as f64 * s as f64).sum();
    let rms = ((sum_sq / signal.len() as f64) + 1e-9).sqrt();
    let target = 10f64.powf(target_db as f64 / 20.0);
    let gain = (target / rms) as f32;
    for v in signal.iter_mut() {
        *v *= gain;
    }
}

pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Linear-interpolation resampler for interleaved stereo.
pub fn resample_linear_stereo(input: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || input.is_empty() || src_rate == 0 {
        return input.to_vec();
    }
    let frames = input.len() / 2;
    let duration = frames as f64 / src_rate as f64;
    let out_frames = (duration * dst_rate as f64).round() as usize;
    let mut out = vec![0.0f32; out_frames * 2];
    for i in 0..out_frames {
        let pos = i as f64 * src_rate as f64 / dst_rate as f64;
        let idx = (pos.floor() as usize).min(frames - 1);
        let frac = pos - idx as f64;
        let idx2 = if idx + 1 < frames { idx + 1 } else { idx };
        for ch in 0..2 {
            let x0 = input[idx * 2 + ch];
            let x1 = input[idx2 * 2 + ch];
            out[i * 2 + ch] = ((1.0 - frac) * x0 as f64 + frac * x1 as f64) as f32;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_peak_only_scales_loud_buffers() {
        let mut quiet = vec![0.1, -0.2, 0.3];
        limit_peak(&mut quiet, 0.95);
        assert_eq!(quiet, vec![0.1, -0.2, 0.3]);

        let mut loud = vec![0.5, -1.9, 1.0];
        limit_peak(&mut loud, 0.95);
        assert!((peak(&loud) - 0.95).abs() < 1e-6);
    }

    #[test]
    fn limiter_holds_the_ceiling_and_recovers() {
        let mut lim = PeakLimiter::new(0.95, 10.0, 1000);
        let (l, r) = lim.process(1.9, -0.5);
        assert!((l - 0.95).abs() < 1e-6);
        assert!(r.abs() < 0.95);
        for _ in 0..200 {
            let (l, _) = lim.process(1.9, 0.0);
            assert!(l <= 0.95 + 1e-6);
        }
        for _ in 0..200 {
            lim.process(0.1, 0.1);
        }
        assert!(lim.gain() > 0.99);
    }

    #[test]
    fn limiter_output_does_not_depend_on_block_size() {
        let input: Vec<f32> = (0..400).map(|i| 1.6 * ((i as f32) * 0.07).sin()).collect();
        let mut whole = PeakLimiter::new(0.95, 20.0, 1000);
        let a: Vec<_> = input.iter().map(|s| whole.process(*s, *s).0).collect();
        let mut split = PeakLimiter::new(0.95, 20.0, 1000);
        let mut b = Vec::new();
        for chunk in input.chunks(37) {
            b.extend(chunk.iter().map(|s| split.process(*s, *s).0));
        }
        assert_eq!(a, b);
    }

    #[test]
    fn fade_reaches_zero_at_both_ends() {
        let mut sig = vec![1.0f32; 100];
        fade_in_out(&mut sig, 0.1, 100);
        assert_eq!(sig[0], 0.0);
        assert_eq!(sig[99], 0.0);
        assert_eq!(sig[50], 1.0);
    }

    #[test]
    fn normalize_hits_target_rms() {
        let mut sig: Vec<f32> = (0..1000).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        normalize_rms(&mut sig, -20.0);
        let rms = (sig.iter().map(|s| s * s).sum::<f32>() / sig.len() as f32).sqrt();
        assert!((rms - db_to_linear(-20.0)).abs() < 1e-4);
    }

    #[test]
    fn resample_doubles_frame_count() {
        let input = vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0];
        let out = resample_linear_stereo(&input, 4, 8);
        assert_eq!(out.len(), 16);
        assert_eq!(out[0], 0.0);
        assert!((out[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn mono_frames_are_duplicated() {
        let buf = PcmBuffer::mono(vec![0.25, -0.5], 10);
        assert_eq!(buf.frame(1), (-0.5, -0.5));
        let st = PcmBuffer::stereo(vec![0.1, 0.2, 0.3, 0.4], 10);
        assert_eq!(st.frames(), 2);
        assert_eq!(st.frame(1), (0.3, 0.4));
    }
}
