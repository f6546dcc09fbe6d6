//! Offline rendering to WAV: the three-stem mixdown and whole-player renders.

use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::decode::decode_file;
use crate::dsp::{fade_in_out_stereo, normalize_rms};
use crate::error::EngineError;
use crate::transport::{TransportController, TransportState};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MixSettings {
    pub voice_volume: f32,
    pub music_volume: f32,
    pub binaural_volume: f32,
    pub voice_offset_s: f32,
    pub music_offset_s: f32,
    pub binaural_offset_s: f32,
    pub sample_rate: u32,
    pub ducking_enabled: bool,
    /// 0..1, where 1 mutes the bed completely under the voice.
    pub ducking_strength_music: f32,
    pub ducking_strength_binaural: f32,
    /// Voice envelope level where ducking starts.
    pub ducking_threshold: f32,
    pub ducking_release_s: f32,
}

impl Default for MixSettings {
    fn default() -> Self {
        Self {
            voice_volume: 1.0,
            music_volume: 0.35,
            binaural_volume: 0.25,
            voice_offset_s: 0.0,
            music_offset_s: 0.0,
            binaural_offset_s: 0.0,
            sample_rate: 8000,
            ducking_enabled: true,
            ducking_strength_music: 0.65,
            ducking_strength_binaural: 0.35,
            ducking_threshold: 0.015,
            ducking_release_s: 0.08,
        }
    }
}

const VOICE_STEM_DB: f32 = -16.0;
const MUSIC_STEM_DB: f32 = -24.0;
const BINAURAL_STEM_DB: f32 = -28.0;
const MIX_DB: f32 = -14.0;
const MIX_FADE_SECONDS: f32 = 2.0;

/// Write interleaved stereo as 16-bit PCM.
pub fn save_wave(samples: &[f32], sample_rate: u32, path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Prepend `offset_s` of silence to interleaved stereo.
fn place_with_offset(signal: Vec<f32>, offset_s: f32, sample_rate: u32) -> Vec<f32> {
    let n0 = (offset_s.max(0.0) * sample_rate as f32).round() as usize;
    if n0 == 0 {
        return signal;
    }
    let mut out = vec![0.0; n0 * 2];
    out.extend(signal);
    out
}

/// One-pole low-pass over |x|.
fn envelope(abs_signal: impl Iterator<Item = f32>, sample_rate: u32, tau_s: f32) -> Vec<f32> {
    let tau = tau_s.max(0.001);
    let alpha = (-1.0 / (sample_rate as f32 * tau)).exp();
    let mut y = 0.0f32;
    abs_signal
        .map(|x| {
            y = alpha * y + (1.0 - alpha) * x;
            y
        })
        .collect()
}

fn duck(bed: &mut [f32], mask: &[f32], strength: f32) {
    for (frame, m) in bed.chunks_mut(2).zip(mask) {
        let g = 1.0 - strength * m;
        for s in frame {
            *s *= g;
        }
    }
}

/// Mix voice, music and binaural stems into one ducked, faded and
/// normalised stereo track.
pub fn mix_stems(voice: Vec<f32>, music: Vec<f32>, binaural: Vec<f32>, settings: &MixSettings) -> Vec<f32> {
    let sr = settings.sample_rate;
    let mut v = voice;
    let mut m = music;
    let mut b = binaural;
    normalize_rms(&mut v, VOICE_STEM_DB);
    normalize_rms(&mut m, MUSIC_STEM_DB);
    normalize_rms(&mut b, BINAURAL_STEM_DB);

    let mut v = place_with_offset(v, settings.voice_offset_s, sr);
    let mut m = place_with_offset(m, settings.music_offset_s, sr);
    let mut b = place_with_offset(b, settings.binaural_offset_s, sr);
    v.iter_mut().for_each(|s| *s *= settings.voice_volume);
    m.iter_mut().for_each(|s| *s *= settings.music_volume);
    b.iter_mut().for_each(|s| *s *= settings.binaural_volume);

    if settings.ducking_enabled && !v.is_empty() && (!m.is_empty() || !b.is_empty()) {
        let env = envelope(v.iter().step_by(2).map(|s| s.abs()), sr, settings.ducking_release_s);
        let thr = settings.ducking_threshold;
        let mask: Vec<f32> = env
            .iter()
            .map(|e| ((e - thr) / thr.max(1e-6)).clamp(0.0, 1.0))
            .collect();
        duck(&mut m, &mask, settings.ducking_strength_music);
        duck(&mut b, &mask, settings.ducking_strength_binaural);
    }

    let len = v.len().max(m.len()).max(b.len());
    let mut mix = vec![0.0f32; len];
    for stem in [&v, &m, &b] {
        for (out, s) in mix.iter_mut().zip(stem.iter()) {
            *out += s;
        }
    }
    fade_in_out_stereo(&mut mix, MIX_FADE_SECONDS, sr);
    mix.iter_mut().for_each(|s| *s = s.clamp(-1.0, 1.0));
    normalize_rms(&mut mix, MIX_DB);
    mix
}

/// Decode three stems, mix them and write the result to `out`.
pub fn mixdown_to_wav(
    voice: &Path,
    music: &Path,
    binaural: &Path,
    out: &Path,
    settings: &MixSettings,
) -> Result<(), EngineError> {
    let load = |path: &Path| {
        decode_file(path, settings.sample_rate).map_err(|reason| {
            EngineError::InvalidSource(format!("cannot read stem {}: {reason}", path.display()))
        })
    };
    let v = load(voice)?;
    let m = load(music)?;
    let b = load(binaural)?;
    let mix = mix_stems(
        v.samples().to_vec(),
        m.samples().to_vec(),
        b.samples().to_vec(),
        settings,
    );
    save_wave(&mix, settings.sample_rate, out)?;
    info!(out = %out.display(), seconds = mix.len() as f32 / 2.0 / settings.sample_rate as f32, "mixdown written");
    Ok(())
}

/// Render an offline player to `out` until it returns to idle or
/// `max_seconds` of audio were produced. Returns the rendered length in
/// seconds.
pub fn render_to_wav(
    transport: &TransportController,
    out: &Path,
    max_seconds: f64,
) -> Result<f64, EngineError> {
    const BLOCK_FRAMES: usize = 512;
    let sample_rate = transport.engine().lock().sample_rate();
    let target_frames = (max_seconds.max(0.0) * sample_rate as f64) as usize;
    let mut rendered = Vec::with_capacity(target_frames.min(sample_rate as usize * 600) * 2);
    let mut buffer = vec![0.0f32; BLOCK_FRAMES * 2];
    let mut remaining = target_frames;
    while remaining > 0 && transport.state() != TransportState::Idle {
        let frames = BLOCK_FRAMES.min(remaining);
        buffer.resize(frames * 2, 0.0);
        transport.render(&mut buffer);
        rendered.extend_from_slice(&buffer[..frames * 2]);
        remaining -= frames;
    }
    save_wave(&rendered, sample_rate, out)?;
    let seconds = rendered.len() as f64 / 2.0 / sample_rate as f64;
    info!(out = %out.display(), seconds, "render written");
    Ok(seconds)
}
