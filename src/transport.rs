//! Play / Pause / Stop / Swap for one player.
//!
//! [`TransportController`] is the control-side handle. Slow work (fetching,
//! decoding, synthesis) happens between two short critical sections on the
//! shared [`Engine`]; the audio callback never waits for it.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::audio_io::{self, OutputHandle};
use crate::config::{clamp_fade_out, EngineConfig, OutputMode};
use crate::engine::{Engine, PlayerGroup, Prepared, RebuildPlan, SharedEngine};
use crate::error::EngineError;
use crate::fetch::{HttpFetcher, MediaFetcher};
use crate::models::{ChannelId, ChannelSettings, SourceDescriptor, TimerPreset};
use crate::source::{self, SourceContext};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Idle,
    Starting,
    Playing,
    Paused,
    Stopping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// A decorative channel could not start; playback went on without it.
    ChannelFailed { channel: ChannelId, message: String },
    TimerExpired,
    StageChanged(crate::session::SessionStage),
    SessionCompleted,
}

/// What kind of player an engine drives.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerProfile {
    pub channels: Vec<ChannelId>,
    /// Channel whose failure aborts Play. `None` means the only enabled
    /// channel, if there is exactly one.
    pub primary: Option<ChannelId>,
    pub fade_out_seconds: f32,
    pub timer_enabled: bool,
}

impl PlayerProfile {
    /// Music, binaural and generated noise with a countdown timer.
    pub fn ambience() -> Self {
        Self {
            channels: vec![ChannelId::Music, ChannelId::Binaural, ChannelId::Noise],
            primary: None,
            fade_out_seconds: 10.0,
            timer_enabled: true,
        }
    }

    /// Voice-led session with every layer available.
    pub fn session() -> Self {
        Self {
            channels: ChannelId::ALL.to_vec(),
            primary: Some(ChannelId::Voice),
            fade_out_seconds: 10.0,
            timer_enabled: false,
        }
    }

    /// A single file player.
    pub fn single(channel: ChannelId) -> Self {
        Self {
            channels: vec![channel],
            primary: Some(channel),
            fade_out_seconds: 5.0,
            timer_enabled: false,
        }
    }

    pub fn with_fade_out(mut self, seconds: f32) -> Self {
        self.fade_out_seconds = clamp_fade_out(seconds);
        self
    }
}

/// Build every requested source, in parallel, outside the engine lock.
pub(crate) fn prepare_all(requests: &[(ChannelId, SourceDescriptor)], ctx: &SourceContext) -> Prepared {
    std::thread::scope(|s| {
        let handles: Vec<_> = requests
            .iter()
            .map(|(ch, d)| (*ch, s.spawn(move || source::prepare(*ch, d, ctx))))
            .collect();
        handles
            .into_iter()
            .map(|(ch, h)| {
                let result = h.join().unwrap_or_else(|_| {
                    Err(EngineError::InvalidSource(format!("{ch} preparation panicked")))
                });
                (ch, result)
            })
            .collect()
    })
}

pub struct TransportController {
    engine: SharedEngine,
    sources: SourceContext,
    output_mode: OutputMode,
    output: Mutex<Option<OutputHandle>>,
    group: Option<PlayerGroup>,
}

impl TransportController {
    /// Controller fetching over HTTP with the configured timeout.
    pub fn new(config: EngineConfig, profile: PlayerProfile) -> Result<Self, EngineError> {
        let fetcher = HttpFetcher::new(Duration::from_secs(config.http_timeout_seconds))
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(Self::with_fetcher(config, profile, Arc::new(fetcher)))
    }

    pub fn with_fetcher(config: EngineConfig, profile: PlayerProfile, fetcher: Arc<dyn MediaFetcher>) -> Self {
        let sources = SourceContext {
            sample_rate: config.sample_rate,
            api_base: config.api_base.clone(),
            library_dir: config.library_dir.clone(),
            soft_preflight: config.soft_preflight,
            fetcher,
        };
        let output_mode = config.output;
        Self {
            engine: Engine::new(config, profile).shared(),
            sources,
            output_mode,
            output: Mutex::new(None),
            group: None,
        }
    }

    /// Join a group of players that silence each other on session start.
    pub fn join_group(&mut self, group: &PlayerGroup) {
        group.register(&self.engine);
        self.group = Some(group.clone());
    }

    pub(crate) fn group(&self) -> Option<&PlayerGroup> {
        self.group.as_ref()
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    pub(crate) fn source_context(&self) -> &SourceContext {
        &self.sources
    }

    pub fn state(&self) -> TransportState {
        self.engine.lock().state()
    }

    pub fn subscribe(&self) -> Receiver<TransportEvent> {
        self.engine.lock().subscribe()
    }

    /// Open the output device on first use.
    pub(crate) fn ensure_output(&self) -> Result<(), EngineError> {
        if self.output_mode == OutputMode::Offline {
            return Ok(());
        }
        let mut output = self.output.lock();
        if output.is_none() {
            *output = Some(audio_io::start_output(self.engine.clone())?);
        }
        Ok(())
    }

    pub fn set_source(&self, channel: ChannelId, descriptor: Option<SourceDescriptor>) {
        self.engine.lock().set_source(channel, descriptor);
    }

    /// Apply UI settings to a channel: volume, enabled flag and looping.
    pub fn configure(&self, channel: ChannelId, settings: &ChannelSettings) -> Result<(), EngineError> {
        self.set_volume(channel, settings.volume);
        let swapped = {
            let engine = self.engine.lock();
            match engine.descriptor(channel) {
                Some(SourceDescriptor::Streamed { url, looping }) if *looping != settings.looping => {
                    Some(SourceDescriptor::streamed(url.clone(), settings.looping))
                }
                _ => None,
            }
        };
        if let Some(descriptor) = swapped {
            self.select_source(channel, descriptor)?;
        }
        self.set_enabled(channel, settings.enabled)
    }

    pub fn play(&self) -> Result<(), EngineError> {
        let plan = match self.engine.lock().begin_start()? {
            Some(plan) => plan,
            None => return Ok(()),
        };
        if let Err(e) = self.ensure_output() {
            warn!(error = %e, "output unavailable; playback stays stopped");
            self.engine.lock().abort_start(plan.token);
            return Err(e);
        }
        let prepared = prepare_all(&plan.requests, &self.sources);
        self.engine.lock().finish_start(plan.token, prepared)
    }

    pub fn pause(&self) {
        self.engine.lock().pause();
    }

    /// Fade out over `fade` (the profile's fade-out when `None`), then stop.
    pub fn stop(&self, fade: Option<Duration>) {
        let mut engine = self.engine.lock();
        let seconds = fade
            .map(|d| d.as_secs_f32())
            .unwrap_or(engine.profile().fade_out_seconds);
        engine.stop_with_fade(seconds);
    }

    pub fn stop_now(&self) {
        self.engine.lock().stop_immediate();
    }

    /// Volume on the 0-100 UI scale.
    pub fn set_volume(&self, channel: ChannelId, volume: f32) {
        self.engine.lock().set_volume(channel, volume);
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.engine.lock().set_master_volume(volume);
    }

    pub fn set_muted(&self, channel: ChannelId, muted: bool) {
        self.engine.lock().set_muted(channel, muted);
    }

    pub fn set_enabled(&self, channel: ChannelId, enabled: bool) -> Result<(), EngineError> {
        let plan = self.engine.lock().set_enabled(channel, enabled);
        self.run_rebuild(plan)
    }

    pub fn select_source(&self, channel: ChannelId, descriptor: SourceDescriptor) -> Result<(), EngineError> {
        let plan = self.engine.lock().select_source(channel, descriptor);
        self.run_rebuild(plan)
    }

    fn run_rebuild(&self, plan: Option<RebuildPlan>) -> Result<(), EngineError> {
        let Some(plan) = plan else {
            return Ok(());
        };
        let prepared = source::prepare(plan.channel, &plan.descriptor, &self.sources);
        if let Err(e) = &prepared {
            warn!(channel = %plan.channel, error = %e, "rebuild failed; keeping previous source");
        }
        self.engine.lock().finish_rebuild(plan, prepared)
    }

    pub fn set_timer(&self, preset: Option<TimerPreset>) -> Result<(), EngineError> {
        self.engine.lock().set_timer(preset)
    }

    pub fn timer_remaining_secs(&self) -> Option<u64> {
        self.engine.lock().timer_remaining_secs()
    }

    /// Pull one block in offline mode. Device mode renders from the output
    /// callback instead.
    pub fn render(&self, out: &mut [f32]) {
        self.engine.lock().process_block(out);
    }

    /// Cancel everything, stop without a fade and close the graph.
    pub fn dispose(&self) {
        self.engine.lock().dispose();
        if let Some(output) = self.output.lock().take() {
            output.stop();
        }
        info!("player disposed");
    }
}

impl Drop for TransportController {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::wav_bytes;
    use crate::dsp::noise::NoiseKind;
    use crate::fetch::StaticFetcher;

    const RATE: u32 = 1000;

    fn controller(profile: PlayerProfile) -> (TransportController, Arc<StaticFetcher>) {
        let fetcher = Arc::new(StaticFetcher::new());
        let mut config = EngineConfig::offline(RATE);
        config.api_base = Some("http://api.local".into());
        let t = TransportController::with_fetcher(config, profile, fetcher.clone());
        (t, fetcher)
    }

    fn advance(t: &TransportController, seconds: f64) {
        let mut block = vec![0.0; 20];
        for _ in 0..(seconds * RATE as f64 / 10.0) as usize {
            t.render(&mut block);
        }
    }

    #[test]
    fn ambience_plays_generated_noise() {
        let (t, _) = controller(PlayerProfile::ambience());
        t.set_source(ChannelId::Noise, Some(SourceDescriptor::generated(NoiseKind::Rain, 2.0)));
        t.set_enabled(ChannelId::Music, false).unwrap();
        t.play().unwrap();
        assert_eq!(t.state(), TransportState::Playing);
        advance(&t, 2.0);
        let mut block = vec![0.0; 200];
        t.render(&mut block);
        assert!(block.iter().any(|s| *s != 0.0));
        t.play().unwrap();
        assert_eq!(t.state(), TransportState::Playing);
    }

    #[test]
    fn ambience_plays_a_binaural_bed() {
        let (t, fetcher) = controller(PlayerProfile::ambience());
        fetcher.serve("http://api.local/assets/music/a.wav", "audio/wav", wav_bytes(0.2, 2000, 2, RATE));
        t.set_source(ChannelId::Music, Some(SourceDescriptor::streamed("assets/music/a.wav", true)));
        t.set_source(
            ChannelId::Binaural,
            Some(SourceDescriptor::Binaural {
                carrier_hz: 200.0,
                beat_hz: 6.0,
                duration_seconds: 2.0,
            }),
        );
        t.set_volume(ChannelId::Binaural, 30.0);
        t.play().unwrap();
        advance(&t, 2.0);
        let engine = t.engine().lock();
        assert!(engine.graph().channel(ChannelId::Binaural).has_source());
        assert!((engine.graph().gain_of(ChannelId::Binaural) - 0.3).abs() < 1e-3);
    }

    #[test]
    fn music_failure_without_noise_is_reported() {
        let (t, _) = controller(PlayerProfile::ambience());
        t.set_source(ChannelId::Music, Some(SourceDescriptor::streamed("assets/music/missing.wav", true)));
        let err = t.play().unwrap_err();
        assert_eq!(err.channel(), Some(ChannelId::Music));
        assert!(err.to_string().contains("http://api.local/assets/music/missing.wav"));
        assert_eq!(t.state(), TransportState::Idle);
    }

    #[test]
    fn decorative_failure_keeps_playing() {
        let (t, fetcher) = controller(PlayerProfile::ambience());
        fetcher.serve("http://api.local/assets/music/a.wav", "text/html", Vec::new());
        t.set_source(ChannelId::Music, Some(SourceDescriptor::streamed("assets/music/a.wav", true)));
        t.set_source(ChannelId::Noise, Some(SourceDescriptor::generated(NoiseKind::Pink, 1.0)));
        let events = t.subscribe();
        t.play().unwrap();
        assert_eq!(t.state(), TransportState::Playing);
        let failed: Vec<_> = events
            .try_iter()
            .filter(|e| matches!(e, TransportEvent::ChannelFailed { .. }))
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn stop_fades_then_finalizes() {
        let (t, fetcher) = controller(PlayerProfile::single(ChannelId::Music));
        fetcher.serve("http://api.local/a.wav", "audio/wav", wav_bytes(0.3, 4000, 2, RATE));
        t.set_source(ChannelId::Music, Some(SourceDescriptor::streamed("a.wav", true)));
        t.play().unwrap();
        advance(&t, 2.0);
        t.stop(Some(Duration::from_secs(1)));
        assert_eq!(t.state(), TransportState::Stopping);
        advance(&t, 1.0);
        assert_eq!(t.state(), TransportState::Stopping);
        advance(&t, 0.1);
        assert_eq!(t.state(), TransportState::Idle);
        let engine = t.engine().lock();
        let music = engine.graph().channel(ChannelId::Music);
        let el = music.element.as_ref().unwrap();
        assert!(el.is_paused());
        assert_eq!(el.current_time(), 0.0);
        assert_eq!(music.connections, 1);
    }

    #[test]
    fn zero_fade_stops_synchronously() {
        let (t, _) = controller(PlayerProfile::ambience());
        t.set_source(ChannelId::Noise, Some(SourceDescriptor::generated(NoiseKind::Wind, 1.0)));
        t.play().unwrap();
        t.stop(Some(Duration::ZERO));
        assert_eq!(t.state(), TransportState::Idle);
    }

    #[test]
    fn repeated_play_stop_keeps_one_connection() {
        let (t, fetcher) = controller(PlayerProfile::single(ChannelId::Music));
        fetcher.serve("http://api.local/a.wav", "audio/wav", wav_bytes(0.3, 500, 2, RATE));
        t.set_source(ChannelId::Music, Some(SourceDescriptor::streamed("a.wav", true)));
        for _ in 0..4 {
            t.play().unwrap();
            advance(&t, 0.2);
            t.stop(Some(Duration::ZERO));
        }
        assert_eq!(t.engine().lock().graph().channel(ChannelId::Music).connections, 1);
    }

    #[test]
    fn disposed_player_refuses_play() {
        let (t, _) = controller(PlayerProfile::ambience());
        t.set_source(ChannelId::Noise, Some(SourceDescriptor::generated(NoiseKind::Pink, 1.0)));
        t.dispose();
        assert!(matches!(t.play(), Err(EngineError::Disposed)));
        t.dispose();
    }
}
