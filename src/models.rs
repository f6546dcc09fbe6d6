use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::dsp::noise::NoiseKind;

fn default_true() -> bool {
    true
}

fn default_volume() -> f32 {
    100.0
}

fn default_loop_seconds() -> f32 {
    12.0
}

/// The four independently-volumed roles mixed by a player.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelId {
    Voice,
    Music,
    #[serde(alias = "ambience", alias = "ambiance")]
    Noise,
    Binaural,
}

impl ChannelId {
    pub const ALL: [ChannelId; 4] = [
        ChannelId::Voice,
        ChannelId::Music,
        ChannelId::Noise,
        ChannelId::Binaural,
    ];

    pub fn index(self) -> usize {
        match self {
            ChannelId::Voice => 0,
            ChannelId::Music => 1,
            ChannelId::Noise => 2,
            ChannelId::Binaural => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChannelId::Voice => "voice",
            ChannelId::Music => "music",
            ChannelId::Noise => "noise",
            ChannelId::Binaural => "binaural",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a channel should play.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// Procedurally synthesized, looping noise bed.
    Generated {
        kind: NoiseKind,
        #[serde(default = "default_loop_seconds", alias = "durationSeconds")]
        duration_seconds: f32,
    },
    /// Looping stereo binaural tone bed.
    Binaural {
        #[serde(default = "crate::dsp::binaural::default_carrier_hz", alias = "carrierHz")]
        carrier_hz: f32,
        #[serde(alias = "beatHz")]
        beat_hz: f32,
        #[serde(default = "default_loop_seconds", alias = "durationSeconds")]
        duration_seconds: f32,
    },
    /// A file or network resource decoded into the channel's media element.
    Streamed {
        url: String,
        #[serde(default, alias = "loop")]
        looping: bool,
    },
}

impl SourceDescriptor {
    pub fn generated(kind: NoiseKind, duration_seconds: f32) -> Self {
        SourceDescriptor::Generated {
            kind,
            duration_seconds,
        }
    }

    pub fn streamed(url: impl Into<String>, looping: bool) -> Self {
        SourceDescriptor::Streamed {
            url: url.into(),
            looping,
        }
    }

    /// Streamed sources reuse the channel's media element; everything else
    /// builds a fresh buffer unit.
    pub fn is_streamed(&self) -> bool {
        matches!(self, SourceDescriptor::Streamed { .. })
    }
}

/// Per-channel settings as the UI exposes them (volume on a 0-100 scale).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true", alias = "loop")]
    pub looping: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            enabled: true,
            looping: true,
        }
    }
}

impl ChannelSettings {
    pub fn new(volume: f32, enabled: bool) -> Self {
        Self {
            volume,
            enabled,
            looping: true,
        }
    }

    /// Volume mapped from the 0-100 UI scale to a 0..1 gain.
    pub fn normalized_volume(&self) -> f32 {
        normalize_volume(self.volume)
    }
}

/// Map a 0-100 UI volume to 0..1. NaN maps to silence.
pub fn normalize_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        return 0.0;
    }
    (volume / 100.0).clamp(0.0, 1.0)
}

/// Countdown presets offered by the ambience player.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "u32", into = "u32")]
pub enum TimerPreset {
    Minutes15,
    Minutes30,
    Minutes60,
}

impl TimerPreset {
    pub fn minutes(self) -> u32 {
        match self {
            TimerPreset::Minutes15 => 15,
            TimerPreset::Minutes30 => 30,
            TimerPreset::Minutes60 => 60,
        }
    }

    pub fn seconds(self) -> u64 {
        self.minutes() as u64 * 60
    }
}

impl TryFrom<u32> for TimerPreset {
    type Error = String;

    fn try_from(minutes: u32) -> Result<Self, Self::Error> {
        match minutes {
            15 => Ok(TimerPreset::Minutes15),
            30 => Ok(TimerPreset::Minutes30),
            60 => Ok(TimerPreset::Minutes60),
            other => Err(format!("unsupported timer preset: {other} min")),
        }
    }
}

impl From<TimerPreset> for u32 {
    fn from(p: TimerPreset) -> u32 {
        p.minutes()
    }
}

/// Ambience-only lead-in before the voice starts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "u32", into = "u32")]
pub enum PreludePreset {
    Off,
    #[default]
    Seconds10,
    Seconds30,
    Seconds60,
}

impl PreludePreset {
    pub fn seconds(self) -> u32 {
        match self {
            PreludePreset::Off => 0,
            PreludePreset::Seconds10 => 10,
            PreludePreset::Seconds30 => 30,
            PreludePreset::Seconds60 => 60,
        }
    }
}

impl TryFrom<u32> for PreludePreset {
    type Error = String;

    fn try_from(seconds: u32) -> Result<Self, Self::Error> {
        match seconds {
            0 => Ok(PreludePreset::Off),
            10 => Ok(PreludePreset::Seconds10),
            30 => Ok(PreludePreset::Seconds30),
            60 => Ok(PreludePreset::Seconds60),
            other => Err(format!("unsupported prelude preset: {other} s")),
        }
    }
}

impl From<PreludePreset> for u32 {
    fn from(p: PreludePreset) -> u32 {
        p.seconds()
    }
}

/// Script text of a generated session, one block per voice phase.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SessionScript {
    #[serde(default)]
    pub induction: String,
    #[serde(default, alias = "approfondissement")]
    pub deepening: String,
    #[serde(default, alias = "travail")]
    pub suggestions: String,
    #[serde(default)]
    pub integration: String,
    #[serde(default, alias = "reveil")]
    pub awakening: String,
}

/// What the generation backend hands over for one session.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SessionDescriptor {
    #[serde(default, alias = "tts_audio_path", alias = "voiceUrl")]
    pub voice_url: Option<String>,
    #[serde(default, alias = "music_path", alias = "musicUrl")]
    pub music_url: Option<String>,
    #[serde(default, alias = "binaural_path", alias = "binauralUrl")]
    pub binaural_url: Option<String>,
    #[serde(default, alias = "mix_path", alias = "mixUrl")]
    pub mix_url: Option<String>,
    #[serde(default, alias = "texte")]
    pub script: Option<SessionScript>,
    /// Provider names, cache-hit flags and the like; passed through untouched.
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, Value>,
}

impl SessionDescriptor {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[default]
    Music,
    Ambience,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: String,
    #[serde(alias = "path", alias = "file")]
    pub url: String,
    #[serde(default)]
    pub kind: TrackKind,
    #[serde(default)]
    pub title: Option<String>,
}

/// Symbolic music/ambience identifiers → playable sources.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TrackCatalog {
    #[serde(default, alias = "items")]
    pub tracks: Vec<CatalogEntry>,
}

impl TrackCatalog {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Noise identifiers (`pink`, `wind`, `rain`) resolve to generated beds;
    /// anything else must be a catalog entry and loops.
    pub fn resolve(&self, id: &str, loop_seconds: f32) -> Option<SourceDescriptor> {
        if let Some(kind) = NoiseKind::from_id(id) {
            return Some(SourceDescriptor::generated(kind, loop_seconds));
        }
        self.get(id)
            .map(|entry| SourceDescriptor::streamed(entry.url.clone(), true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_accepts_backend_field_names() {
        let json = r#"{
            "texte": {"induction": "a", "approfondissement": "b", "travail": "c", "integration": "d", "reveil": "e"},
            "tts_audio_path": "assets/audio/session.wav",
            "music_path": "assets/music/ambient.wav",
            "binaural_path": "assets/audio/binaural.wav",
            "mix_path": null,
            "tts_provider_used": "local",
            "tts_cache_hit": true
        }"#;
        let d = SessionDescriptor::from_json(json).unwrap();
        assert_eq!(d.voice_url.as_deref(), Some("assets/audio/session.wav"));
        assert_eq!(d.music_url.as_deref(), Some("assets/music/ambient.wav"));
        assert_eq!(d.mix_url, None);
        let script = d.script.unwrap();
        assert_eq!(script.deepening, "b");
        assert_eq!(script.awakening, "e");
        assert_eq!(d.metadata.get("tts_cache_hit"), Some(&Value::Bool(true)));
        assert_eq!(
            d.metadata.get("tts_provider_used"),
            Some(&Value::String("local".into()))
        );
    }

    #[test]
    fn volume_normalization_clamps() {
        assert_eq!(normalize_volume(50.0), 0.5);
        assert_eq!(normalize_volume(-20.0), 0.0);
        assert_eq!(normalize_volume(170.0), 1.0);
        assert_eq!(normalize_volume(f32::NAN), 0.0);
    }

    #[test]
    fn presets_reject_unknown_values() {
        assert_eq!(TimerPreset::try_from(15), Ok(TimerPreset::Minutes15));
        assert!(TimerPreset::try_from(20).is_err());
        assert_eq!(PreludePreset::try_from(0), Ok(PreludePreset::Off));
        assert!(PreludePreset::try_from(45).is_err());
        let p: PreludePreset = serde_json::from_str("30").unwrap();
        assert_eq!(p.seconds(), 30);
    }

    #[test]
    fn catalog_resolves_noise_and_tracks() {
        let catalog = TrackCatalog::from_json(
            r#"{"tracks": [{"id": "ocean", "path": "assets/music/ocean.mp3", "kind": "ambience"}]}"#,
        )
        .unwrap();
        assert_eq!(
            catalog.resolve("rain", 12.0),
            Some(SourceDescriptor::generated(NoiseKind::Rain, 12.0))
        );
        assert_eq!(
            catalog.resolve("ocean", 12.0),
            Some(SourceDescriptor::streamed("assets/music/ocean.mp3", true))
        );
        assert_eq!(catalog.resolve("missing", 12.0), None);
    }

    #[test]
    fn source_descriptor_json_shape() {
        let d: SourceDescriptor =
            serde_json::from_str(r#"{"type": "streamed", "url": "a.wav", "loop": true}"#).unwrap();
        assert_eq!(d, SourceDescriptor::streamed("a.wav", true));
        let g: SourceDescriptor =
            serde_json::from_str(r#"{"type": "generated", "kind": "wind"}"#).unwrap();
        assert_eq!(g, SourceDescriptor::generated(NoiseKind::Wind, 12.0));
    }
}
