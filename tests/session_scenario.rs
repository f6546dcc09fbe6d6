mod common;

use std::sync::Arc;

use common::{advance, controller, wav_bytes, API};
use session_engine::fetch::StaticFetcher;
use session_engine::models::{ChannelId, SessionDescriptor, SessionScript};
use session_engine::phases::PhaseKind;
use session_engine::session::{SessionOptions, SessionSequencer, SessionStage};
use session_engine::transport::{PlayerProfile, TransportEvent, TransportState};

const RATE: u32 = 200;
const BLOCK: usize = 20;
const VOICE_SECONDS: usize = 1180;

fn twenty_minute_session() -> (SessionSequencer, SessionDescriptor) {
    let f = Arc::new(StaticFetcher::new());
    f.serve(
        &format!("{API}/assets/audio/session.wav"),
        "audio/wav",
        wav_bytes(0.3, VOICE_SECONDS * RATE as usize, 1, RATE),
    );
    f.serve(
        &format!("{API}/assets/music/ambient.wav"),
        "audio/wav",
        wav_bytes(0.1, 3 * RATE as usize, 2, RATE),
    );
    f.serve(
        &format!("{API}/assets/audio/binaural.wav"),
        "audio/x-wav",
        wav_bytes(0.05, 4 * RATE as usize, 2, RATE),
    );
    let json = r#"{
        "texte": {"induction": "settle in", "approfondissement": "deeper", "travail": "calm", "integration": "keep it", "reveil": "return"},
        "tts_audio_path": "assets/audio/session.wav",
        "music_path": "assets/music/ambient.wav",
        "binaural_path": "assets/audio/binaural.wav",
        "tts_provider_used": "local"
    }"#;
    let descriptor = SessionDescriptor::from_json(json).unwrap();
    let transport = controller(RATE, PlayerProfile::session(), f);
    (SessionSequencer::new(transport), descriptor)
}

#[test]
fn twenty_minute_session_runs_to_completion() {
    let (s, descriptor) = twenty_minute_session();
    let events = s.transport().subscribe();
    let options = SessionOptions {
        total_seconds: Some(1200.0),
        ..SessionOptions::default()
    };
    s.start(&descriptor, &options).unwrap();
    assert_eq!(s.stage(), SessionStage::Prelude);
    assert_eq!(s.progress().phase, Some(PhaseKind::PreAmbiance));
    assert!((s.progress().total_seconds - 1200.0).abs() < 1e-6);

    advance(s.transport(), RATE, 5.0, BLOCK);
    {
        let engine = s.transport().engine().lock();
        assert!((engine.graph().gain_of(ChannelId::Music) - 1.0).abs() < 1e-3);
        assert_eq!(engine.graph().gain_of(ChannelId::Voice), 0.0);
    }

    advance(s.transport(), RATE, 5.0, BLOCK);
    assert_eq!(s.stage(), SessionStage::Voice);
    {
        let engine = s.transport().engine().lock();
        assert_eq!(engine.graph().gain_of(ChannelId::Voice), 1.0);
        let voice = engine.graph().channel(ChannelId::Voice).element.as_ref().unwrap();
        assert_eq!(voice.current_time(), 0.0);
        assert!(!voice.is_paused());
    }
    let p = s.progress();
    assert_eq!(p.phase, Some(PhaseKind::Induction));
    assert_eq!(p.phase_text.as_deref(), Some("settle in"));

    let mut seen = Vec::new();
    let mut last_index = 1;
    for second in 11..=1189 {
        advance(s.transport(), RATE, 1.0, BLOCK);
        let p = s.progress();
        assert!(p.phase_index >= last_index, "phase went backwards at {second}s");
        last_index = p.phase_index;
        seen.push((second, p.phase));
    }
    let phase_at = |t: usize| seen.iter().find(|(s, _)| *s == t).and_then(|(_, p)| *p);
    assert_eq!(phase_at(269), Some(PhaseKind::Induction));
    assert_eq!(phase_at(270), Some(PhaseKind::Deepening));
    assert_eq!(phase_at(540), Some(PhaseKind::Deepening));
    assert_eq!(phase_at(542), Some(PhaseKind::Suggestions));
    assert_eq!(phase_at(1012), Some(PhaseKind::Suggestions));
    assert_eq!(phase_at(1014), Some(PhaseKind::Awakening));
    assert_eq!(phase_at(1189), Some(PhaseKind::Awakening));
    assert_eq!(s.stage(), SessionStage::Voice);

    advance(s.transport(), RATE, 1.0, BLOCK);
    assert_eq!(s.stage(), SessionStage::Finishing);
    advance(s.transport(), RATE, 5.0, BLOCK);
    let p = s.progress();
    assert_eq!(p.phase, Some(PhaseKind::PostAmbiance));
    assert!((p.phase_fraction - 0.5).abs() < 0.02);
    {
        let engine = s.transport().engine().lock();
        assert!((engine.graph().gain_of(ChannelId::Music) - 0.5).abs() < 0.02);
    }

    advance(s.transport(), RATE, 5.1, BLOCK);
    assert_eq!(s.stage(), SessionStage::Idle);
    assert_eq!(s.transport().state(), TransportState::Idle);
    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == TransportEvent::SessionCompleted)
            .count(),
        1
    );
    let stages: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TransportEvent::StageChanged(stage) => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            SessionStage::Prelude,
            SessionStage::Voice,
            SessionStage::Finishing,
            SessionStage::Idle
        ]
    );
}

#[test]
fn stopping_mid_prelude_never_starts_the_voice() {
    let (s, descriptor) = twenty_minute_session();
    s.start(&descriptor, &SessionOptions::default()).unwrap();
    advance(s.transport(), RATE, 4.0, BLOCK);
    s.stop();
    advance(s.transport(), RATE, 20.0, BLOCK);
    assert_eq!(s.stage(), SessionStage::Idle);
    let engine = s.transport().engine().lock();
    assert_eq!(engine.graph().gain_of(ChannelId::Voice), 0.0);
    assert!(!engine.graph().channel(ChannelId::Voice).has_source());
}

#[test]
fn restarting_a_session_discards_the_old_prelude() {
    let (s, descriptor) = twenty_minute_session();
    s.start(&descriptor, &SessionOptions::default()).unwrap();
    advance(s.transport(), RATE, 8.0, BLOCK);
    s.start(&descriptor, &SessionOptions::default()).unwrap();
    advance(s.transport(), RATE, 3.0, BLOCK);
    // the first prelude would have ended at 10 s
    assert_eq!(s.stage(), SessionStage::Prelude);
    advance(s.transport(), RATE, 7.0, BLOCK);
    assert_eq!(s.stage(), SessionStage::Voice);
}

#[test]
fn script_mapping_merges_integration_into_suggestions() {
    let script = SessionScript {
        suggestions: "calm".into(),
        integration: "keep it".into(),
        ..SessionScript::default()
    };
    let table = session_engine::phases::PhaseTable::build(1200.0, Some(&script));
    assert_eq!(table.phases()[3].text.as_deref(), Some("calm\n\nkeep it"));
}
