#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;

use session_engine::config::EngineConfig;
use session_engine::fetch::StaticFetcher;
use session_engine::transport::{PlayerProfile, TransportController};

pub const API: &str = "http://api.local";

/// 16-bit WAV holding a constant value.
pub fn wav_bytes(value: f32, frames: usize, channels: u16, sample_rate: u32) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(Cursor::new(&mut out), spec).unwrap();
        let s = (value * i16::MAX as f32) as i16;
        for _ in 0..frames * channels as usize {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    out
}

pub fn offline_config(sample_rate: u32) -> EngineConfig {
    let mut config = EngineConfig::offline(sample_rate);
    config.api_base = Some(API.to_string());
    config
}

pub fn controller(
    sample_rate: u32,
    profile: PlayerProfile,
    fetcher: Arc<StaticFetcher>,
) -> TransportController {
    TransportController::with_fetcher(offline_config(sample_rate), profile, fetcher)
}

/// Render `seconds` of audio in blocks of `block_frames`.
pub fn advance(t: &TransportController, sample_rate: u32, seconds: f64, block_frames: usize) {
    let frames = (seconds * sample_rate as f64).round() as usize;
    let mut block = vec![0.0f32; block_frames * 2];
    let mut done = 0;
    while done < frames {
        let n = block_frames.min(frames - done);
        t.render(&mut block[..n * 2]);
        done += n;
    }
}
