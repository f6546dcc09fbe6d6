//! Binding sources to channels.
//!
//! Building a source happens in two steps. [`prepare`] does the slow part
//! (URL resolution, pre-flight, download, decode, or synthesis) without
//! touching the graph. [`attach`] then swaps the prepared audio into a channel
//! and is cheap enough to run while the audio callback waits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::decode::{decode_bytes, extension_hint};
use crate::dsp::{binaural, noise, PcmBuffer};
use crate::error::EngineError;
use crate::fetch::{is_audio_content_type, origin_of, FetchError, MediaFetcher};
use crate::graph::Channel;
use crate::models::{ChannelId, SourceDescriptor};

/// Everything [`prepare`] needs to turn a descriptor into audio.
#[derive(Clone)]
pub struct SourceContext {
    pub sample_rate: u32,
    pub api_base: Option<String>,
    pub library_dir: PathBuf,
    pub soft_preflight: bool,
    pub fetcher: Arc<dyn MediaFetcher>,
}

/// Where a streamed URL actually points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedUrl {
    Http(String),
    Data(String),
    File(PathBuf),
}

impl ResolvedUrl {
    pub fn display(&self) -> String {
        match self {
            ResolvedUrl::Http(u) => u.clone(),
            ResolvedUrl::Data(u) => {
                let head: String = u.chars().take(40).collect();
                format!("{head}...")
            }
            ResolvedUrl::File(p) => p.display().to_string(),
        }
    }
}

/// Resolve direct URLs as-is and library paths against the API base (or the
/// local library directory when no API base is configured).
pub fn resolve_url(raw: &str, api_base: Option<&str>, library_dir: &Path) -> ResolvedUrl {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return ResolvedUrl::Http(raw.to_string());
    }
    if lower.starts_with("data:") {
        return ResolvedUrl::Data(raw.to_string());
    }
    if let Some(path) = raw.strip_prefix("file://") {
        return ResolvedUrl::File(PathBuf::from(path));
    }
    let as_path = Path::new(raw);
    if as_path.is_absolute() && as_path.exists() {
        return ResolvedUrl::File(as_path.to_path_buf());
    }
    match api_base.filter(|b| !b.trim().is_empty()) {
        Some(base) => {
            let rel = raw.replace('\\', "/");
            ResolvedUrl::Http(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                rel.trim_start_matches('/')
            ))
        }
        None => ResolvedUrl::File(library_dir.join(raw.trim_start_matches(['/', '\\']))),
    }
}

/// Audio ready to be swapped into a channel.
#[derive(Debug, Clone)]
pub enum PreparedSource {
    /// Single-use buffer unit (noise or tone bed).
    Buffer(PcmBuffer),
    /// Data for the channel's media element.
    Media {
        url: String,
        buffer: PcmBuffer,
        looping: bool,
    },
}

pub fn prepare(
    channel: ChannelId,
    descriptor: &SourceDescriptor,
    ctx: &SourceContext,
) -> Result<PreparedSource, EngineError> {
    match descriptor {
        SourceDescriptor::Generated {
            kind,
            duration_seconds,
        } => {
            if !(*duration_seconds > 0.0) {
                return Err(EngineError::InvalidSource(format!(
                    "{channel}: {} bed needs a positive duration",
                    kind.label()
                )));
            }
            Ok(PreparedSource::Buffer(noise::synthesize(
                *kind,
                *duration_seconds,
                ctx.sample_rate,
            )))
        }
        SourceDescriptor::Binaural {
            carrier_hz,
            beat_hz,
            duration_seconds,
        } => {
            if !(*duration_seconds > 0.0) || !(*carrier_hz > 0.0) {
                return Err(EngineError::InvalidSource(format!(
                    "{channel}: binaural bed needs a positive carrier and duration"
                )));
            }
            Ok(PreparedSource::Buffer(binaural::synthesize(
                *carrier_hz,
                *beat_hz,
                *duration_seconds,
                ctx.sample_rate,
            )))
        }
        SourceDescriptor::Streamed { url, looping } => {
            let resolved = resolve_url(url, ctx.api_base.as_deref(), &ctx.library_dir);
            let buffer = load_streamed(channel, &resolved, ctx)?;
            debug!(%channel, url = %resolved.display(), frames = buffer.frames(), "prepared streamed source");
            Ok(PreparedSource::Media {
                url: resolved.display(),
                buffer,
                looping: *looping,
            })
        }
    }
}

fn unreachable(channel: ChannelId, url: &ResolvedUrl, reason: impl Into<String>) -> EngineError {
    EngineError::Unreachable {
        channel,
        url: url.display(),
        reason: reason.into(),
    }
}

fn load_streamed(
    channel: ChannelId,
    resolved: &ResolvedUrl,
    ctx: &SourceContext,
) -> Result<PcmBuffer, EngineError> {
    let (bytes, ext) = match resolved {
        ResolvedUrl::File(path) => {
            if !path.is_file() {
                return Err(unreachable(channel, resolved, "file not found"));
            }
            let bytes = std::fs::read(path).map_err(|e| unreachable(channel, resolved, e.to_string()))?;
            let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
            (bytes, ext)
        }
        ResolvedUrl::Data(data) => {
            let (mime, bytes) = parse_data_url(data).map_err(|r| unreachable(channel, resolved, r))?;
            (bytes, extension_hint("", Some(&mime)))
        }
        ResolvedUrl::Http(url) => {
            preflight(channel, url, ctx)?;
            let (info, bytes) = ctx
                .fetcher
                .get(url)
                .map_err(|e| unreachable(channel, resolved, e.to_string()))?;
            if !info.is_success() {
                return Err(unreachable(channel, resolved, format!("HTTP {}", info.status)));
            }
            (bytes, extension_hint(url, info.content_type.as_deref()))
        }
    };
    decode_bytes(bytes, ext.as_deref(), ctx.sample_rate).map_err(|reason| EngineError::Decode {
        channel,
        url: resolved.display(),
        reason,
    })
}

/// HEAD the asset before fetching it so misconfigured URLs fail with a clear
/// message instead of a decode error.
pub fn preflight(channel: ChannelId, url: &str, ctx: &SourceContext) -> Result<(), EngineError> {
    let resolved = ResolvedUrl::Http(url.to_string());
    let origin = origin_of(url);

    let (head, probe) = if ctx.soft_preflight {
        std::thread::scope(|s| {
            let probe = origin
                .as_deref()
                .map(|o| s.spawn(move || ctx.fetcher.probe(o)));
            let head = ctx.fetcher.head(url);
            let probe = probe.map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(FetchError::Network("probe panicked".to_string())))
            });
            (head, probe)
        })
    } else {
        (ctx.fetcher.head(url), None)
    };

    match head {
        Ok(info) => {
            if !info.is_success() {
                return Err(unreachable(channel, &resolved, format!("HTTP {}", info.status)));
            }
            match info.content_type.as_deref() {
                Some(ct) if !is_audio_content_type(ct) => Err(unreachable(
                    channel,
                    &resolved,
                    format!("unexpected content-type {ct}"),
                )),
                _ => Ok(()),
            }
        }
        Err(head_err) => match probe {
            Some(Ok(status)) if status < 500 => {
                warn!(%channel, %url, error = %head_err, "HEAD pre-flight failed but origin is live; continuing");
                Ok(())
            }
            Some(Ok(status)) => Err(unreachable(
                channel,
                &resolved,
                format!("HEAD failed ({head_err}); origin answered HTTP {status}"),
            )),
            Some(Err(probe_err)) => Err(unreachable(
                channel,
                &resolved,
                format!("HEAD failed ({head_err}); origin unreachable ({probe_err})"),
            )),
            None => Err(unreachable(channel, &resolved, format!("HEAD failed ({head_err})"))),
        },
    }
}

/// Split `data:<mime>;base64,<payload>` into its mime type and bytes.
pub fn parse_data_url(data: &str) -> Result<(String, Vec<u8>), String> {
    let rest = data.get(5..).ok_or("invalid data url")?;
    let (meta, payload) = rest.split_once(',').ok_or("invalid data url")?;
    let mut parts = meta.split(';');
    let mime = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    if !parts.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err("data url is not base64 encoded".to_string());
    }
    if !is_audio_content_type(&mime) {
        return Err(format!("unexpected content-type {mime}"));
    }
    let bytes = BASE64.decode(payload.trim()).map_err(|e| e.to_string())?;
    Ok((mime, bytes))
}

/// Lifecycle of a buffer-backed unit. Units are single-use: once stopped
/// they never play again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Ready,
    Playing,
    Paused,
    Stopped,
}

/// Looping playback of an in-memory buffer.
#[derive(Debug)]
pub struct BufferUnit {
    buffer: PcmBuffer,
    position: usize,
    state: UnitState,
}

impl BufferUnit {
    pub fn new(buffer: PcmBuffer) -> Self {
        Self {
            buffer,
            position: 0,
            state: UnitState::Ready,
        }
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        match self.state {
            UnitState::Ready => {
                self.state = UnitState::Playing;
                Ok(())
            }
            other => Err(EngineError::InvalidSource(format!(
                "buffer unit cannot start from {other:?}"
            ))),
        }
    }

    pub fn pause(&mut self) {
        if self.state == UnitState::Playing {
            self.state = UnitState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == UnitState::Paused {
            self.state = UnitState::Playing;
        }
    }

    pub fn stop(&mut self) {
        self.state = UnitState::Stopped;
    }

    #[inline]
    pub fn next_frame(&mut self) -> Option<(f32, f32)> {
        let frames = self.buffer.frames();
        if self.state != UnitState::Playing || frames == 0 {
            return None;
        }
        let out = self.buffer.frame(self.position);
        self.position += 1;
        if self.position >= frames {
            self.position = 0;
        }
        Some(out)
    }
}

/// The channel's reusable player for decoded files, like an `<audio>` element:
/// it keeps its graph connection while its data is swapped.
#[derive(Debug, Default)]
pub struct MediaElement {
    url: Option<String>,
    buffer: Option<PcmBuffer>,
    position: usize,
    looping: bool,
    paused: bool,
    ended: bool,
}

impl MediaElement {
    pub fn new() -> Self {
        Self {
            paused: true,
            ..Default::default()
        }
    }

    pub fn set_source(&mut self, url: String, buffer: PcmBuffer, looping: bool) {
        self.url = Some(url);
        self.buffer = Some(buffer);
        self.looping = looping;
        self.paused = true;
        self.rewind();
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn play(&mut self) -> Result<(), EngineError> {
        if self.buffer.is_none() {
            return Err(EngineError::InvalidSource("media element has no source".to_string()));
        }
        if self.ended {
            self.rewind();
        }
        self.paused = false;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn rewind(&mut self) {
        self.position = 0;
        self.ended = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    /// Playback position in seconds.
    pub fn current_time(&self) -> f64 {
        match &self.buffer {
            Some(b) if b.sample_rate() > 0 => self.position as f64 / b.sample_rate() as f64,
            _ => 0.0,
        }
    }

    pub fn duration(&self) -> f64 {
        self.buffer.as_ref().map(|b| b.duration_seconds()).unwrap_or(0.0)
    }

    /// Next frame, or `None` while paused or once a non-looping source ended.
    #[inline]
    pub fn next_frame(&mut self) -> Option<(f32, f32)> {
        if self.paused || self.ended {
            return None;
        }
        let buffer = self.buffer.as_ref()?;
        let frames = buffer.frames();
        if self.position >= frames {
            if self.looping && frames > 0 {
                self.position = 0;
            } else {
                self.ended = true;
                self.paused = true;
                return None;
            }
        }
        let out = buffer.frame(self.position);
        self.position += 1;
        if self.position >= frames && !self.looping {
            self.ended = true;
            self.paused = true;
        }
        Some(out)
    }
}

/// What a channel is currently bound to.
#[derive(Debug, Default)]
pub enum ChannelSource {
    #[default]
    Empty,
    Generated(BufferUnit),
    /// The channel's media element is the active source.
    Streamed,
}

impl ChannelSource {
    pub fn is_empty(&self) -> bool {
        matches!(self, ChannelSource::Empty)
    }
}

/// Bind `prepared` to `channel`, tearing down whatever it played before.
/// The new source is wired in but not started.
pub fn attach(channel: &mut Channel, prepared: PreparedSource) {
    detach(channel);
    match prepared {
        PreparedSource::Buffer(buffer) => {
            channel.connections += 1;
            channel.source = ChannelSource::Generated(BufferUnit::new(buffer));
        }
        PreparedSource::Media {
            url,
            buffer,
            looping,
        } => {
            let element = channel.element.get_or_insert_with(|| {
                channel.connections += 1;
                MediaElement::new()
            });
            element.set_source(url, buffer, looping);
            channel.source = ChannelSource::Streamed;
        }
    }
}

/// Start the channel's bound source.
pub fn start(channel: &mut Channel) -> Result<(), EngineError> {
    match &mut channel.source {
        ChannelSource::Empty => Err(EngineError::InvalidSource(format!(
            "{} has no source to start",
            channel.id
        ))),
        ChannelSource::Generated(unit) => unit.start(),
        ChannelSource::Streamed => match channel.element.as_mut() {
            Some(el) => el.play(),
            None => Err(EngineError::InvalidSource(format!(
                "{} lost its media element",
                channel.id
            ))),
        },
    }
}

/// Generated units are stopped and disconnected; the media element is only
/// paused and rewound so its connection can be reused.
pub fn detach(channel: &mut Channel) {
    match std::mem::take(&mut channel.source) {
        ChannelSource::Empty => {}
        ChannelSource::Generated(mut unit) => {
            unit.stop();
            channel.connections = channel.connections.saturating_sub(1);
        }
        ChannelSource::Streamed => {
            if let Some(el) = channel.element.as_mut() {
                el.pause();
                el.rewind();
            }
        }
    }
}

pub fn pause(channel: &mut Channel) {
    match &mut channel.source {
        ChannelSource::Empty => {}
        ChannelSource::Generated(unit) => unit.pause(),
        ChannelSource::Streamed => {
            if let Some(el) = channel.element.as_mut() {
                el.pause();
            }
        }
    }
}

pub fn resume(channel: &mut Channel) -> Result<(), EngineError> {
    match &mut channel.source {
        ChannelSource::Empty => Ok(()),
        ChannelSource::Generated(unit) => {
            unit.resume();
            Ok(())
        }
        ChannelSource::Streamed => match channel.element.as_mut() {
            Some(el) => el.play(),
            None => Ok(()),
        },
    }
}
