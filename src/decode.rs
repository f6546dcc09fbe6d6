use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};

use crate::dsp::{resample_linear_stereo, PcmBuffer};

/// File extension symphonia should try first for `url` / `content_type`.
pub fn extension_hint(url: &str, content_type: Option<&str>) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    if let Some((_, ext)) = last.rsplit_once('.') {
        if !ext.is_empty() && ext.len() <= 5 {
            return Some(ext.to_ascii_lowercase());
        }
    }
    let ct = content_type?.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match ct.as_str() {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => "wav",
        "audio/ogg" | "application/ogg" => "ogg",
        "audio/flac" | "audio/x-flac" => "flac",
        _ => return None,
    };
    Some(ext.to_string())
}

/// Decode a complete in-memory asset to interleaved stereo at `sample_rate`.
pub fn decode_bytes(bytes: Vec<u8>, ext: Option<&str>, sample_rate: u32) -> Result<PcmBuffer, String> {
    decode_reader(Cursor::new(bytes), ext, sample_rate)
}

pub fn decode_file(path: &std::path::Path, sample_rate: u32) -> Result<PcmBuffer, String> {
    let file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    decode_reader(file, ext.as_deref(), sample_rate)
}

fn decode_reader<R: MediaSource + 'static>(
    reader: R,
    ext: Option<&str>,
    sample_rate: u32,
) -> Result<PcmBuffer, String> {
    let mss = MediaSourceStream::new(Box::new(reader), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = ext {
        hint.with_extension(ext);
    }
    let probed = get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| e.to_string())?;
    let mut format = probed.format;
    let track = format.default_track().ok_or("no default track")?;
    let track_id = track.id;
    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| e.to_string())?;

    let mut src_rate = track.codec_params.sample_rate;
    let mut sample_buf: Option<(SampleBuffer<f32>, u64)> = None;
    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(_)) => break,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(e.to_string()),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            // a corrupt packet is skipped, like a player would
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(e.to_string()),
        };
        let spec = *decoded.spec();
        src_rate.get_or_insert(spec.rate);
        let channels = spec.channels.count().max(1);
        let capacity = decoded.capacity() as u64;
        let needs_alloc = match &sample_buf {
            Some((_, cap)) => *cap < capacity,
            None => true,
        };
        if needs_alloc {
            sample_buf = Some((SampleBuffer::<f32>::new(capacity, spec), capacity));
        }
        let Some((sbuf, _)) = sample_buf.as_mut() else {
            continue;
        };
        sbuf.copy_interleaved_ref(decoded);
        for frame in sbuf.samples().chunks(channels) {
            let l = frame[0];
            let r = if channels > 1 { frame[1] } else { frame[0] };
            samples.push(l);
            samples.push(r);
        }
    }
    let src_rate = src_rate.ok_or("unknown sample rate")?;
    if src_rate != sample_rate {
        samples = resample_linear_stereo(&samples, src_rate, sample_rate);
    }
    Ok(PcmBuffer::stereo(samples, sample_rate))
}
