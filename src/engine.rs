//! Per-player engine state shared between control calls and the audio callback.
//!
//! Everything that must happen at a point in audio time (end of a fade, timer
//! expiry, end of the prelude) is a [`Job`] on the engine's [`Timeline`].
//! [`Engine::process_block`] splits each block at job due times so jobs fire
//! on the exact frame they were scheduled for.

use std::sync::{Arc, Weak};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cancel::{CancellationToken, StopToken};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::graph::AudioGraph;
use crate::models::{normalize_volume, ChannelId, SessionDescriptor, SourceDescriptor, TimerPreset};
use crate::phases::{PhaseTable, POST_AMBIANCE_SECONDS, PRE_AMBIANCE_SECONDS};
use crate::ramp::{ms_to_frames, ramp_to, set_immediate};
use crate::session::{SessionOptions, SessionProgress, SessionStage};
use crate::source::{self, PreparedSource};
use crate::timeline::{Job, Timeline};
use crate::transport::{PlayerProfile, TransportEvent, TransportState};

pub type SharedEngine = Arc<Mutex<Engine>>;

/// Fade applied when the countdown timer runs out.
pub const TIMER_FADE_SECONDS: f32 = 10.0;

/// Sources to build outside the lock before a start can complete.
#[derive(Debug)]
pub struct StartPlan {
    pub token: u64,
    pub requests: Vec<(ChannelId, SourceDescriptor)>,
}

/// A single-channel rebuild waiting for its source.
#[derive(Debug)]
pub struct RebuildPlan {
    pub channel: ChannelId,
    pub descriptor: SourceDescriptor,
    pub fade_in: bool,
    token: u64,
    generation: u64,
}

pub type Prepared = Vec<(ChannelId, Result<PreparedSource, EngineError>)>;

#[derive(Debug)]
struct ArmedTimer {
    due: u64,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct SessionRun {
    stage: SessionStage,
    cancel: CancellationToken,
    stage_started: u64,
    prelude_frames: u64,
    finish_frames: u64,
    table: PhaseTable,
}

pub struct Engine {
    config: EngineConfig,
    profile: PlayerProfile,
    graph: AudioGraph,
    timeline: Timeline,
    stop_token: StopToken,
    rebuilds: [u64; 4],
    state: TransportState,
    descriptors: [Option<SourceDescriptor>; 4],
    timer_preset: Option<TimerPreset>,
    timer: Option<ArmedTimer>,
    session: Option<SessionRun>,
    mixdown_mode: bool,
    subscribers: Vec<Sender<TransportEvent>>,
}

impl Engine {
    pub fn new(config: EngineConfig, profile: PlayerProfile) -> Self {
        let mut graph = AudioGraph::new(config.sample_rate);
        for ch in ChannelId::ALL {
            graph.channel_mut(ch).enabled = profile.channels.contains(&ch);
        }
        Self {
            config,
            profile,
            graph,
            timeline: Timeline::new(),
            stop_token: StopToken::new(),
            rebuilds: [0; 4],
            state: TransportState::Idle,
            descriptors: Default::default(),
            timer_preset: None,
            timer: None,
            session: None,
            mixdown_mode: false,
            subscribers: Vec::new(),
        }
    }

    pub fn shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn profile(&self) -> &PlayerProfile {
        &self.profile
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &AudioGraph {
        &self.graph
    }

    pub fn sample_rate(&self) -> u32 {
        self.graph.sample_rate()
    }

    /// Audio clock in seconds.
    pub fn clock_seconds(&self) -> f64 {
        self.graph.frames_to_seconds(self.graph.now())
    }

    pub fn descriptor(&self, channel: ChannelId) -> Option<&SourceDescriptor> {
        self.descriptors[channel.index()].as_ref()
    }

    pub fn subscribe(&mut self) -> Receiver<TransportEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: TransportEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "transport state");
            self.state = state;
            self.emit(TransportEvent::StateChanged(state));
        }
    }

    fn set_stage(&mut self, stage: SessionStage) {
        if let Some(run) = self.session.as_mut() {
            run.stage = stage;
            run.stage_started = self.graph.now();
        }
        info!(?stage, "session stage");
        self.emit(TransportEvent::StageChanged(stage));
    }

    fn ms(&self, ms: u64) -> u64 {
        ms_to_frames(ms, self.graph.sample_rate())
    }

    /// Render one block of interleaved stereo and run every job that falls
    /// due inside it.
    pub fn process_block(&mut self, out: &mut [f32]) {
        let total = out.len() / 2;
        let mut offset = 0;
        while offset < total {
            self.run_due_jobs();
            let remaining = total - offset;
            let step = match self.timeline.next_due() {
                Some(due) if self.graph.is_running() => {
                    (due.saturating_sub(self.graph.now()) as usize).clamp(1, remaining)
                }
                _ => remaining,
            };
            let ended = self.graph.render(&mut out[offset * 2..(offset + step) * 2]);
            for ch in ended {
                self.on_source_ended(ch);
            }
            offset += step;
        }
        self.run_due_jobs();
    }

    fn run_due_jobs(&mut self) {
        if !self.graph.is_running() {
            return;
        }
        loop {
            let jobs = self.timeline.pop_due(self.graph.now());
            if jobs.is_empty() {
                break;
            }
            for job in jobs {
                self.run_job(job);
            }
        }
    }

    fn run_job(&mut self, job: Job) {
        match job {
            Job::FinalizeStop { token } => {
                if self.stop_token.is_current(token) {
                    self.finalize();
                } else {
                    debug!(token, "stale finalize ignored");
                }
            }
            Job::TimerExpired { cancel } => {
                let armed = self.timer.as_ref().map(|t| t.cancel.same_as(&cancel)).unwrap_or(false);
                if cancel.is_cancelled() || !armed {
                    debug!("cancelled timer ignored");
                    return;
                }
                self.timer = None;
                self.timer_preset = None;
                info!("timer expired; fading out");
                self.emit(TransportEvent::TimerExpired);
                self.stop_with_fade(TIMER_FADE_SECONDS);
            }
            Job::PreludeElapsed { cancel } => {
                if cancel.is_cancelled() {
                    debug!("cancelled prelude ignored");
                    return;
                }
                self.start_voice();
            }
            Job::SessionFinished { cancel } => {
                if cancel.is_cancelled() {
                    debug!("cancelled session finish ignored");
                    return;
                }
                self.complete_session();
            }
        }
    }

    fn on_source_ended(&mut self, channel: ChannelId) {
        let in_voice = matches!(&self.session, Some(run) if run.stage == SessionStage::Voice);
        if channel != ChannelId::Voice || !in_voice {
            debug!(%channel, "source ended");
            return;
        }
        let Some(run) = self.session.as_ref() else {
            return;
        };
        let due = self.graph.now() + run.finish_frames;
        let cancel = run.cancel.clone();
        let fade_ms = (POST_AMBIANCE_SECONDS * 1000.0) as u64;
        let (now, sr) = (self.graph.now(), self.graph.sample_rate());
        for ch in self.graph.channels_mut() {
            if ch.id != ChannelId::Voice {
                ramp_to(&mut ch.gain, 0.0, fade_ms, now, sr);
            }
        }
        self.timeline.schedule(due, Job::SessionFinished { cancel });
        self.set_stage(SessionStage::Finishing);
    }

    /// Tear every source down and return to idle.
    fn finalize(&mut self) {
        for ch in self.graph.channels_mut() {
            source::detach(ch);
            set_immediate(&mut ch.gain, 0.0);
        }
        self.end_session();
        self.set_state(TransportState::Idle);
    }

    fn end_session(&mut self) {
        if let Some(run) = self.session.take() {
            run.cancel.cancel();
            info!(stage = ?SessionStage::Idle, "session stage");
            self.emit(TransportEvent::StageChanged(SessionStage::Idle));
        }
    }

    fn primary_channel(&self) -> Option<ChannelId> {
        if self.profile.primary.is_some() {
            return self.profile.primary;
        }
        let mut enabled = ChannelId::ALL
            .into_iter()
            .filter(|ch| self.graph.channel(*ch).enabled && self.descriptors[ch.index()].is_some());
        match (enabled.next(), enabled.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }

    // Transport

    pub fn set_source(&mut self, channel: ChannelId, descriptor: Option<SourceDescriptor>) {
        self.descriptors[channel.index()] = descriptor;
    }

    /// First half of Play. Returns `None` when nothing needs preparing.
    pub fn begin_start(&mut self) -> Result<Option<StartPlan>, EngineError> {
        match self.state {
            TransportState::Playing | TransportState::Starting => {
                debug!(state = ?self.state, "play ignored");
                return Ok(None);
            }
            TransportState::Paused => {
                self.resume_from_pause()?;
                return Ok(None);
            }
            TransportState::Idle | TransportState::Stopping => {}
        }
        let token = self.stop_token.bump();
        self.end_session();
        self.graph.resume()?;
        let requests: Vec<_> = ChannelId::ALL
            .into_iter()
            .filter(|ch| self.graph.channel(*ch).enabled)
            .filter_map(|ch| self.descriptors[ch.index()].clone().map(|d| (ch, d)))
            .collect();
        if requests.is_empty() {
            return Err(EngineError::InvalidSource(
                "no enabled channel has a source".to_string(),
            ));
        }
        self.set_state(TransportState::Starting);
        Ok(Some(StartPlan { token, requests }))
    }

    /// Give up on a start whose preparation could not proceed.
    pub fn abort_start(&mut self, token: u64) {
        if self.stop_token.is_current(token) {
            self.stop_token.bump();
            self.set_state(TransportState::Idle);
        }
    }

    /// Split prepared results into successes, failing the whole start when the
    /// primary (or every) channel failed.
    fn sort_prepared(
        &mut self,
        prepared: Prepared,
        primary: Option<ChannelId>,
    ) -> Result<Vec<(ChannelId, PreparedSource)>, EngineError> {
        let mut ok = Vec::new();
        let mut failed = Vec::new();
        for (ch, result) in prepared {
            match result {
                Ok(p) => ok.push((ch, p)),
                Err(e) if Some(ch) == primary => {
                    self.stop_token.bump();
                    self.set_state(TransportState::Idle);
                    return Err(e);
                }
                Err(e) => failed.push((ch, e)),
            }
        }
        let mut first_err = None;
        for (ch, e) in failed {
            warn!(channel = %ch, error = %e, "channel failed to start; continuing without it");
            self.emit(TransportEvent::ChannelFailed {
                channel: ch,
                message: e.to_string(),
            });
            first_err.get_or_insert(e);
        }
        if ok.is_empty() {
            self.stop_token.bump();
            self.set_state(TransportState::Idle);
            return Err(first_err.unwrap_or_else(|| {
                EngineError::InvalidSource("nothing could be prepared".to_string())
            }));
        }
        Ok(ok)
    }

    /// Second half of Play: bind and fade in what was prepared.
    pub fn finish_start(&mut self, token: u64, prepared: Prepared) -> Result<(), EngineError> {
        if !self.stop_token.is_current(token) {
            debug!(token, "stale play ignored");
            return Ok(());
        }
        let primary = self.primary_channel();
        let ready = self.sort_prepared(prepared, primary)?;
        let (now, sr) = (self.graph.now(), self.graph.sample_rate());
        let fade_in = self.config.fade_in_ms;
        let disable_ramp = self.config.disable_ramp_ms;
        for (id, prepared) in ready {
            let ch = self.graph.channel_mut(id);
            source::attach(ch, prepared);
            source::start(ch)?;
            set_immediate(&mut ch.gain, 0.0);
            let target = ch.effective_target();
            ramp_to(&mut ch.gain, target, fade_in, now, sr);
        }
        for ch in self.graph.channels_mut().filter(|c| !c.enabled) {
            ramp_to(&mut ch.gain, 0.0, disable_ramp, now, sr);
        }
        self.arm_timer();
        self.set_state(TransportState::Playing);
        Ok(())
    }

    /// Resume sources where they stopped. The voice stays parked during the
    /// prelude and after it ended; while finishing, the closing fade (frozen
    /// with the clock) simply carries on.
    fn resume_from_pause(&mut self) -> Result<(), EngineError> {
        self.graph.resume()?;
        let (now, sr) = (self.graph.now(), self.graph.sample_rate());
        let ramp = self.config.volume_ramp_ms;
        let stage = self.session_stage();
        for ch in self.graph.channels_mut() {
            if !ch.has_source() {
                continue;
            }
            let parked_voice = ch.id == ChannelId::Voice
                && matches!(stage, SessionStage::Prelude | SessionStage::Finishing);
            if parked_voice {
                continue;
            }
            source::resume(ch)?;
            if stage != SessionStage::Finishing {
                let target = ch.effective_target();
                ramp_to(&mut ch.gain, target, ramp, now, sr);
            }
        }
        self.arm_timer();
        self.set_state(TransportState::Playing);
        Ok(())
    }

    /// Pause every source in place and freeze the clock.
    pub fn pause(&mut self) {
        if self.state != TransportState::Playing {
            debug!(state = ?self.state, "pause ignored");
            return;
        }
        for ch in self.graph.channels_mut() {
            source::pause(ch);
        }
        self.cancel_timer();
        self.timer_preset = None;
        self.graph.suspend();
        self.set_state(TransportState::Paused);
    }

    /// Fade everything out over `fade_seconds`, then finalize.
    pub fn stop_with_fade(&mut self, fade_seconds: f32) {
        let token = self.stop_token.bump();
        self.cancel_timer();
        self.end_session();
        let has_sources = self.graph.channels().any(|c| c.has_source());
        if self.state == TransportState::Idle && !has_sources {
            debug!("stop ignored; already idle");
            return;
        }
        let fade_ms = (fade_seconds.max(0.0) * 1000.0) as u64;
        if fade_ms == 0 || !self.graph.is_running() {
            self.finalize();
            return;
        }
        let (now, sr) = (self.graph.now(), self.graph.sample_rate());
        for ch in self.graph.channels_mut() {
            ramp_to(&mut ch.gain, 0.0, fade_ms, now, sr);
        }
        let due = now + self.ms(fade_ms + self.config.finalize_slack_ms);
        self.timeline.schedule(due, Job::FinalizeStop { token });
        self.set_state(TransportState::Stopping);
    }

    /// Stop without a fade and drop every pending job.
    pub fn stop_immediate(&mut self) {
        self.stop_token.bump();
        self.cancel_timer();
        self.timeline.clear();
        self.mixdown_mode = false;
        self.finalize();
    }

    pub fn set_volume(&mut self, channel: ChannelId, volume: f32) {
        let target = normalize_volume(volume);
        let playing = self.state == TransportState::Playing;
        let (now, sr) = (self.graph.now(), self.graph.sample_rate());
        let ramp = self.config.volume_ramp_ms;
        let ch = self.graph.channel_mut(channel);
        ch.target = target;
        if playing && ch.enabled && ch.has_source() {
            ramp_to(&mut ch.gain, target, ramp, now, sr);
        }
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        let (now, sr) = (self.graph.now(), self.graph.sample_rate());
        let ramp = self.config.volume_ramp_ms;
        ramp_to(self.graph.master_mut(), normalize_volume(volume), ramp, now, sr);
    }

    pub fn set_muted(&mut self, channel: ChannelId, muted: bool) {
        self.graph.channel_mut(channel).muted = muted;
    }

    /// Flip a channel on or off. Enabling while playing needs a rebuild.
    pub fn set_enabled(&mut self, channel: ChannelId, enabled: bool) -> Option<RebuildPlan> {
        let playing = self.state == TransportState::Playing;
        let ch = self.graph.channel_mut(channel);
        let was_enabled = ch.enabled;
        ch.enabled = enabled;
        if !playing || was_enabled == enabled {
            return None;
        }
        if !enabled {
            set_immediate(&mut ch.gain, 0.0);
            source::detach(ch);
            // an in-flight rebuild must not bring it back
            self.rebuilds[channel.index()] += 1;
            return None;
        }
        self.begin_rebuild(channel, true)
    }

    /// Store a new source; while playing, rebuild only that channel.
    pub fn select_source(&mut self, channel: ChannelId, descriptor: SourceDescriptor) -> Option<RebuildPlan> {
        self.descriptors[channel.index()] = Some(descriptor);
        let enabled = self.graph.channel(channel).enabled;
        if self.state != TransportState::Playing || !enabled {
            return None;
        }
        self.begin_rebuild(channel, false)
    }

    fn begin_rebuild(&mut self, channel: ChannelId, fade_in: bool) -> Option<RebuildPlan> {
        let descriptor = self.descriptors[channel.index()].clone()?;
        self.rebuilds[channel.index()] += 1;
        Some(RebuildPlan {
            channel,
            descriptor,
            fade_in,
            token: self.stop_token.current(),
            generation: self.rebuilds[channel.index()],
        })
    }

    pub fn finish_rebuild(
        &mut self,
        plan: RebuildPlan,
        prepared: Result<PreparedSource, EngineError>,
    ) -> Result<(), EngineError> {
        let idx = plan.channel.index();
        let stale = !self.stop_token.is_current(plan.token)
            || self.rebuilds[idx] != plan.generation
            || self.state != TransportState::Playing
            || !self.graph.channel(plan.channel).enabled;
        if stale {
            debug!(channel = %plan.channel, "stale rebuild ignored");
            return Ok(());
        }
        let prepared = prepared?;
        let (now, sr) = (self.graph.now(), self.graph.sample_rate());
        let fade_in = self.config.fade_in_ms;
        let ch = self.graph.channel_mut(plan.channel);
        source::attach(ch, prepared);
        source::start(ch)?;
        if plan.fade_in {
            set_immediate(&mut ch.gain, 0.0);
            let target = ch.effective_target();
            ramp_to(&mut ch.gain, target, fade_in, now, sr);
        }
        debug!(channel = %plan.channel, "channel rebuilt");
        Ok(())
    }

    // Timer

    pub fn set_timer(&mut self, preset: Option<TimerPreset>) -> Result<(), EngineError> {
        if !self.profile.timer_enabled {
            return Err(EngineError::InvalidSource(
                "this player has no countdown timer".to_string(),
            ));
        }
        self.cancel_timer();
        self.timer_preset = preset;
        if self.state == TransportState::Playing {
            self.arm_timer();
        }
        Ok(())
    }

    pub fn timer_preset(&self) -> Option<TimerPreset> {
        self.timer_preset
    }

    fn arm_timer(&mut self) {
        self.cancel_timer();
        let Some(preset) = self.timer_preset else {
            return;
        };
        let cancel = CancellationToken::new();
        let due = self.graph.now() + preset.seconds() * self.graph.sample_rate() as u64;
        self.timeline.schedule(
            due,
            Job::TimerExpired {
                cancel: cancel.clone(),
            },
        );
        info!(minutes = preset.minutes(), "timer armed");
        self.timer = Some(ArmedTimer { due, cancel });
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel.cancel();
        }
    }

    /// Whole seconds left on the countdown, rounded up.
    pub fn timer_remaining_secs(&self) -> Option<u64> {
        let timer = self.timer.as_ref()?;
        let left = timer.due.saturating_sub(self.graph.now());
        let sr = self.graph.sample_rate().max(1) as u64;
        Some(left.div_ceil(sr))
    }

    pub fn dispose(&mut self) {
        self.stop_immediate();
        self.graph.dispose();
    }

    // Session

    pub fn begin_session(
        &mut self,
        descriptor: &SessionDescriptor,
        options: &SessionOptions,
    ) -> Result<StartPlan, EngineError> {
        self.stop_immediate();
        let token = self.stop_token.bump();
        self.graph.resume()?;

        let mixdown = options.prefer_mixdown && descriptor.mix_url.is_some();
        let mut sources: [Option<SourceDescriptor>; 4] = Default::default();
        if mixdown {
            sources[ChannelId::Voice.index()] =
                descriptor.mix_url.clone().map(|u| SourceDescriptor::streamed(u, false));
        } else {
            let voice = descriptor.voice_url.clone().ok_or_else(|| {
                EngineError::InvalidSource("session has no voice track".to_string())
            })?;
            sources[ChannelId::Voice.index()] = Some(SourceDescriptor::streamed(voice, false));
            sources[ChannelId::Music.index()] =
                descriptor.music_url.clone().map(|u| SourceDescriptor::streamed(u, true));
            sources[ChannelId::Binaural.index()] =
                descriptor.binaural_url.clone().map(|u| SourceDescriptor::streamed(u, true));
            sources[ChannelId::Noise.index()] = options.noise.clone();
        }

        let mut requests = Vec::new();
        for ch in ChannelId::ALL {
            let d = sources[ch.index()].take();
            if let Some(d) = &d {
                if ch == ChannelId::Voice || self.graph.channel(ch).enabled {
                    requests.push((ch, d.clone()));
                }
            }
            self.descriptors[ch.index()] = d;
        }
        self.mixdown_mode = mixdown;
        self.set_state(TransportState::Starting);
        Ok(StartPlan { token, requests })
    }

    pub fn finish_session(
        &mut self,
        token: u64,
        prepared: Prepared,
        descriptor: &SessionDescriptor,
        options: &SessionOptions,
    ) -> Result<(), EngineError> {
        if !self.stop_token.is_current(token) {
            debug!(token, "stale session start ignored");
            return Ok(());
        }
        let ready = self.sort_prepared(prepared, Some(ChannelId::Voice))?;
        let (now, sr) = (self.graph.now(), self.graph.sample_rate());
        let fade_in = self.config.fade_in_ms;
        for (id, prepared) in ready {
            let ch = self.graph.channel_mut(id);
            source::attach(ch, prepared);
            set_immediate(&mut ch.gain, 0.0);
            if id != ChannelId::Voice {
                source::start(ch)?;
                let target = ch.effective_target();
                ramp_to(&mut ch.gain, target, fade_in, now, sr);
            }
        }

        let voice_seconds = self
            .graph
            .channel(ChannelId::Voice)
            .element
            .as_ref()
            .map(|e| e.duration())
            .unwrap_or(0.0);
        let total = options
            .total_seconds
            .unwrap_or(PRE_AMBIANCE_SECONDS + voice_seconds + POST_AMBIANCE_SECONDS);
        let table = PhaseTable::build(total, descriptor.script.as_ref());
        let prelude_frames = self.graph.seconds_to_frames(options.prelude.seconds() as f64);
        let cancel = CancellationToken::new();
        self.session = Some(SessionRun {
            stage: SessionStage::Prelude,
            cancel: cancel.clone(),
            stage_started: now,
            prelude_frames,
            finish_frames: self.graph.seconds_to_frames(POST_AMBIANCE_SECONDS),
            table,
        });
        self.set_state(TransportState::Playing);
        self.set_stage(SessionStage::Prelude);
        if prelude_frames == 0 {
            self.start_voice();
        } else {
            self.timeline
                .schedule(now + prelude_frames, Job::PreludeElapsed { cancel });
        }
        Ok(())
    }

    fn start_voice(&mut self) {
        if !matches!(&self.session, Some(run) if run.stage == SessionStage::Prelude) {
            return;
        }
        let ch = self.graph.channel_mut(ChannelId::Voice);
        if let Some(el) = ch.element.as_mut() {
            el.rewind();
        }
        let target = ch.effective_target();
        set_immediate(&mut ch.gain, target);
        if let Err(e) = source::start(ch) {
            warn!(error = %e, "voice could not start");
        }
        self.set_stage(SessionStage::Voice);
    }

    fn complete_session(&mut self) {
        self.stop_token.bump();
        self.cancel_timer();
        for ch in self.graph.channels_mut() {
            source::detach(ch);
            set_immediate(&mut ch.gain, 0.0);
        }
        if let Some(run) = self.session.take() {
            run.cancel.cancel();
        }
        self.mixdown_mode = false;
        info!("session completed");
        self.emit(TransportEvent::SessionCompleted);
        self.emit(TransportEvent::StageChanged(SessionStage::Idle));
        self.set_state(TransportState::Idle);
    }

    pub fn stop_session(&mut self) {
        self.stop_immediate();
    }

    pub fn session_stage(&self) -> SessionStage {
        self.session.as_ref().map(|r| r.stage).unwrap_or(SessionStage::Idle)
    }

    pub fn in_mixdown_mode(&self) -> bool {
        self.mixdown_mode
    }

    /// Set one layer's volume. Inert in mixdown mode.
    pub fn set_layer_volume(&mut self, channel: ChannelId, volume: f32) -> bool {
        if self.mixdown_mode {
            return false;
        }
        self.set_volume(channel, volume);
        true
    }

    pub fn session_progress(&self) -> SessionProgress {
        let Some(run) = self.session.as_ref() else {
            return SessionProgress::idle();
        };
        let now = self.graph.now();
        let in_stage = now.saturating_sub(run.stage_started);
        let fraction_of = |frames: u64| {
            if frames == 0 {
                1.0
            } else {
                (in_stage as f64 / frames as f64).min(1.0)
            }
        };
        let table = &run.table;
        let position = match run.stage {
            SessionStage::Idle => 0.0,
            SessionStage::Prelude => fraction_of(run.prelude_frames) * PRE_AMBIANCE_SECONDS,
            SessionStage::Voice => {
                let voice_pos = self
                    .graph
                    .channel(ChannelId::Voice)
                    .element
                    .as_ref()
                    .map(|e| e.current_time())
                    .unwrap_or(0.0);
                (table.voice_start() + voice_pos).min(table.voice_end())
            }
            SessionStage::Finishing => {
                table.voice_end() + fraction_of(run.finish_frames) * POST_AMBIANCE_SECONDS
            }
        };
        let at = table.locate(position);
        let phase = &table.phases()[at.index];
        SessionProgress {
            stage: run.stage,
            phase: Some(at.kind),
            phase_index: at.index,
            phase_fraction: at.fraction,
            phase_text: phase.text.clone(),
            elapsed_seconds: position,
            total_seconds: table.total_seconds(),
        }
    }

    pub fn phase_table(&self) -> Option<&PhaseTable> {
        self.session.as_ref().map(|r| &r.table)
    }
}

/// Players that must not sound at the same time.
///
/// Starting a session silences every other live member immediately.
#[derive(Clone, Default)]
pub struct PlayerGroup {
    members: Arc<Mutex<Vec<Weak<Mutex<Engine>>>>>,
}

impl PlayerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, engine: &SharedEngine) {
        let mut members = self.members.lock();
        members.retain(|w| w.strong_count() > 0);
        if !members.iter().any(|w| w.as_ptr() == Arc::as_ptr(engine)) {
            members.push(Arc::downgrade(engine));
        }
    }

    pub fn len(&self) -> usize {
        self.members.lock().iter().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every member except `keep`, without fades.
    pub fn silence_others(&self, keep: &SharedEngine) {
        let others: Vec<SharedEngine> = {
            let mut members = self.members.lock();
            members.retain(|w| w.strong_count() > 0);
            members
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|e| !Arc::ptr_eq(e, keep))
                .collect()
        };
        for other in others {
            let mut engine = other.lock();
            if engine.state() != TransportState::Idle {
                debug!("silencing sibling player");
                engine.stop_immediate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::PcmBuffer;

    fn engine(profile: PlayerProfile) -> Engine {
        Engine::new(EngineConfig::offline(1000), profile)
    }

    fn tone(frames: usize, looping: bool) -> PreparedSource {
        PreparedSource::Media {
            url: "fixture".into(),
            buffer: PcmBuffer::stereo(vec![0.2; frames * 2], 1000),
            looping,
        }
    }

    fn run(engine: &mut Engine, seconds: f64) {
        let frames = (seconds * engine.sample_rate() as f64) as usize;
        let mut block = vec![0.0; 20];
        for _ in 0..frames / 10 {
            engine.process_block(&mut block);
        }
    }

    fn start(engine: &mut Engine) {
        engine.set_source(ChannelId::Music, Some(SourceDescriptor::streamed("m", true)));
        let plan = engine.begin_start().unwrap().unwrap();
        let prepared = plan
            .requests
            .iter()
            .map(|(ch, _)| (*ch, Ok(tone(500, true))))
            .collect();
        engine.finish_start(plan.token, prepared).unwrap();
    }

    #[test]
    fn play_fades_in_to_target() {
        let mut e = engine(PlayerProfile::ambience());
        e.set_volume(ChannelId::Music, 50.0);
        start(&mut e);
        assert_eq!(e.state(), TransportState::Playing);
        assert_eq!(e.graph().gain_of(ChannelId::Music), 0.0);
        run(&mut e, 0.75);
        assert!((e.graph().gain_of(ChannelId::Music) - 0.25).abs() < 0.01);
        run(&mut e, 1.0);
        assert_eq!(e.graph().gain_of(ChannelId::Music), 0.5);
    }

    #[test]
    fn stale_finalize_is_ignored() {
        let mut e = engine(PlayerProfile::ambience());
        start(&mut e);
        run(&mut e, 2.0);
        e.stop_with_fade(5.0);
        assert_eq!(e.state(), TransportState::Stopping);
        run(&mut e, 1.0);
        start(&mut e);
        run(&mut e, 6.0);
        assert_eq!(e.state(), TransportState::Playing);
        assert!(e.graph().channel(ChannelId::Music).has_source());
        assert_eq!(e.graph().gain_of(ChannelId::Music), 1.0);
    }

    #[test]
    fn stale_play_is_a_no_op() {
        let mut e = engine(PlayerProfile::ambience());
        e.set_source(ChannelId::Music, Some(SourceDescriptor::streamed("m", true)));
        let plan = e.begin_start().unwrap().unwrap();
        e.stop_immediate();
        let prepared = vec![(ChannelId::Music, Ok(tone(10, true)))];
        e.finish_start(plan.token, prepared).unwrap();
        assert_eq!(e.state(), TransportState::Idle);
        assert!(!e.graph().channel(ChannelId::Music).has_source());
    }

    #[test]
    fn primary_failure_aborts_decorative_does_not() {
        let mut e = engine(PlayerProfile::session());
        e.set_source(ChannelId::Voice, Some(SourceDescriptor::streamed("v", false)));
        e.set_source(ChannelId::Music, Some(SourceDescriptor::streamed("m", true)));
        let events = e.subscribe();

        let plan = e.begin_start().unwrap().unwrap();
        let err = EngineError::Unreachable {
            channel: ChannelId::Music,
            url: "m".into(),
            reason: "HTTP 404".into(),
        };
        e.finish_start(plan.token, vec![(ChannelId::Voice, Ok(tone(100, false))), (ChannelId::Music, Err(err))])
            .unwrap();
        assert_eq!(e.state(), TransportState::Playing);
        assert!(events
            .try_iter()
            .any(|ev| matches!(ev, TransportEvent::ChannelFailed { channel: ChannelId::Music, .. })));

        e.stop_immediate();
        let plan = e.begin_start().unwrap().unwrap();
        let err = EngineError::Decode {
            channel: ChannelId::Voice,
            url: "v".into(),
            reason: "garbage".into(),
        };
        let result = e.finish_start(plan.token, vec![(ChannelId::Voice, Err(err)), (ChannelId::Music, Ok(tone(10, true)))]);
        assert!(matches!(result, Err(EngineError::Decode { .. })));
        assert_eq!(e.state(), TransportState::Idle);
    }

    #[test]
    fn pause_freezes_and_resume_continues() {
        let mut e = engine(PlayerProfile::ambience());
        e.set_timer(Some(TimerPreset::Minutes15)).unwrap();
        start(&mut e);
        assert_eq!(e.timer_remaining_secs(), Some(900));
        run(&mut e, 1.0);
        e.pause();
        assert_eq!(e.state(), TransportState::Paused);
        assert_eq!(e.timer_remaining_secs(), None);
        assert_eq!(e.timer_preset(), None);
        let before = e.graph().now();
        run(&mut e, 1.0);
        assert_eq!(e.graph().now(), before);
        assert!(e.begin_start().unwrap().is_none());
        assert_eq!(e.state(), TransportState::Playing);
    }

    #[test]
    fn disabling_detaches_immediately() {
        let mut e = engine(PlayerProfile::ambience());
        start(&mut e);
        run(&mut e, 2.0);
        assert!(e.set_enabled(ChannelId::Music, false).is_none());
        assert_eq!(e.graph().gain_of(ChannelId::Music), 0.0);
        assert!(!e.graph().channel(ChannelId::Music).has_source());
        let plan = e.set_enabled(ChannelId::Music, true).unwrap();
        assert!(plan.fade_in);
        e.finish_rebuild(plan, Ok(tone(10, true))).unwrap();
        assert!(e.graph().channel(ChannelId::Music).has_source());
    }

    #[test]
    fn swap_keeps_gain() {
        let mut e = engine(PlayerProfile::ambience());
        e.set_volume(ChannelId::Music, 80.0);
        start(&mut e);
        run(&mut e, 2.0);
        let plan = e
            .select_source(ChannelId::Music, SourceDescriptor::streamed("other", true))
            .unwrap();
        let older = e
            .select_source(ChannelId::Music, SourceDescriptor::streamed("newest", true))
            .unwrap();
        e.finish_rebuild(plan, Ok(tone(10, true))).unwrap();
        e.finish_rebuild(older, Ok(tone(20, true))).unwrap();
        assert!((e.graph().gain_of(ChannelId::Music) - 0.8).abs() < 1e-6);
        assert_eq!(e.graph().channel(ChannelId::Music).connections, 1);
    }

    #[test]
    fn timer_requires_profile_support() {
        let mut e = engine(PlayerProfile::session());
        assert!(e.set_timer(Some(TimerPreset::Minutes30)).is_err());
    }

    #[test]
    fn group_silences_siblings() {
        let group = PlayerGroup::new();
        let a = engine(PlayerProfile::ambience()).shared();
        let b = engine(PlayerProfile::ambience()).shared();
        group.register(&a);
        group.register(&b);
        group.register(&b);
        assert_eq!(group.len(), 2);
        start(&mut a.lock());
        start(&mut b.lock());
        group.silence_others(&b);
        assert_eq!(a.lock().state(), TransportState::Idle);
        assert_eq!(b.lock().state(), TransportState::Playing);
        drop(a);
        assert_eq!(group.len(), 1);
    }
}
