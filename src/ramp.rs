//! Linear gain automation evaluated against the audio clock.
//!
//! Scheduling a ramp never blocks: the parameter only stores start/end points
//! and [`GainParam::value_at`] is evaluated per frame while the graph renders.

/// Clamp a requested volume into the gain range. NaN becomes silence.
#[inline]
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        return 0.0;
    }
    volume.clamp(0.0, 1.0)
}

/// Convert milliseconds to frames at `sample_rate`.
#[inline]
pub fn ms_to_frames(ms: u64, sample_rate: u32) -> u64 {
    ms * sample_rate as u64 / 1000
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LinearRamp {
    from: f32,
    to: f32,
    start: u64,
    end: u64,
}

/// A controllable gain with at most one scheduled ramp.
#[derive(Debug, Clone, PartialEq)]
pub struct GainParam {
    value: f32,
    ramp: Option<LinearRamp>,
}

impl Default for GainParam {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl GainParam {
    pub fn new(initial: f32) -> Self {
        Self {
            value: clamp_volume(initial),
            ramp: None,
        }
    }

    /// Gain at absolute frame `now`.
    #[inline]
    pub fn value_at(&self, now: u64) -> f32 {
        match self.ramp {
            None => self.value,
            Some(r) => {
                if now >= r.end {
                    r.to
                } else if now <= r.start {
                    r.from
                } else {
                    let p = (now - r.start) as f32 / (r.end - r.start) as f32;
                    r.from + (r.to - r.from) * p
                }
            }
        }
    }

    /// Value the parameter settles on once any ramp completes.
    pub fn target(&self) -> f32 {
        self.ramp.map(|r| r.to).unwrap_or(self.value)
    }

    pub fn is_ramping(&self, now: u64) -> bool {
        matches!(self.ramp, Some(r) if now < r.end)
    }

    /// Fold a finished ramp into the resting value.
    pub fn settle(&mut self, now: u64) {
        if let Some(r) = self.ramp {
            if now >= r.end {
                self.value = r.to;
                self.ramp = None;
            }
        }
    }

    /// Cancel any scheduled ramp and hold the value reached at `now`.
    pub fn cancel_and_hold(&mut self, now: u64) {
        self.value = self.value_at(now);
        self.ramp = None;
    }
}

/// Ramp `param` linearly from its current value to `target` over `duration_ms`.
pub fn ramp_to(param: &mut GainParam, target: f32, duration_ms: u64, now: u64, sample_rate: u32) {
    let to = clamp_volume(target);
    param.cancel_and_hold(now);
    let frames = ms_to_frames(duration_ms, sample_rate);
    if frames == 0 {
        param.value = to;
        return;
    }
    param.ramp = Some(LinearRamp {
        from: param.value,
        to,
        start: now,
        end: now + frames,
    });
}

/// Jump straight to `volume`, dropping any scheduled ramp.
pub fn set_immediate(param: &mut GainParam, volume: f32) {
    param.ramp = None;
    param.value = clamp_volume(volume);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_interpolates_linearly() {
        let mut g = GainParam::new(0.0);
        ramp_to(&mut g, 1.0, 1000, 0, 1000);
        assert_eq!(g.value_at(0), 0.0);
        assert!((g.value_at(250) - 0.25).abs() < 1e-6);
        assert!((g.value_at(500) - 0.5).abs() < 1e-6);
        assert_eq!(g.value_at(1000), 1.0);
        assert_eq!(g.value_at(5000), 1.0);
    }

    #[test]
    fn new_ramp_starts_from_current_value() {
        let mut g = GainParam::new(0.0);
        ramp_to(&mut g, 1.0, 1000, 0, 1000);
        ramp_to(&mut g, 0.0, 500, 500, 1000);
        assert!((g.value_at(500) - 0.5).abs() < 1e-6);
        assert!((g.value_at(750) - 0.25).abs() < 1e-6);
        assert_eq!(g.value_at(1000), 0.0);
    }

    #[test]
    fn out_of_range_targets_clamp() {
        let mut g = GainParam::new(0.5);
        ramp_to(&mut g, 1.7, 100, 0, 1000);
        assert_eq!(g.target(), 1.0);
        assert_eq!(g.value_at(100), 1.0);
        ramp_to(&mut g, -0.5, 100, 100, 1000);
        assert_eq!(g.value_at(200), 0.0);
        set_immediate(&mut g, -0.5);
        assert_eq!(g.value_at(200), 0.0);
        set_immediate(&mut g, 1.7);
        assert_eq!(g.value_at(200), 1.0);
        set_immediate(&mut g, f32::NAN);
        assert_eq!(g.value_at(200), 0.0);
        for t in 0..300 {
            let v = g.value_at(t);
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn zero_duration_is_immediate() {
        let mut g = GainParam::new(0.2);
        ramp_to(&mut g, 0.8, 0, 10, 44100);
        assert_eq!(g.value_at(10), 0.8);
        assert!(!g.is_ramping(10));
    }

    #[test]
    fn set_immediate_cancels_ramp() {
        let mut g = GainParam::new(0.0);
        ramp_to(&mut g, 1.0, 1000, 0, 1000);
        set_immediate(&mut g, 0.3);
        assert_eq!(g.value_at(900), 0.3);
    }

    #[test]
    fn settle_folds_finished_ramp() {
        let mut g = GainParam::new(0.0);
        ramp_to(&mut g, 0.6, 10, 0, 1000);
        g.settle(5);
        assert!(g.is_ramping(5));
        g.settle(10);
        assert!(!g.is_ramping(10));
        assert_eq!(g.value_at(0), 0.6);
    }
}
