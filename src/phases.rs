//! Session phase table and position lookup.

use serde::Serialize;

use crate::models::SessionScript;

pub const PRE_AMBIANCE_SECONDS: f64 = 10.0;
pub const POST_AMBIANCE_SECONDS: f64 = 10.0;
/// Shortest a voice phase is ever allotted.
pub const MIN_VOICE_PHASE_SECONDS: f64 = 30.0;

const INDUCTION_SHARE: f64 = 0.22;
const DEEPENING_SHARE: f64 = 0.23;
const SUGGESTIONS_SHARE: f64 = 0.40;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    PreAmbiance,
    Induction,
    Deepening,
    Suggestions,
    Awakening,
    PostAmbiance,
}

impl PhaseKind {
    pub fn label(self) -> &'static str {
        match self {
            PhaseKind::PreAmbiance => "pre-ambiance",
            PhaseKind::Induction => "induction",
            PhaseKind::Deepening => "deepening",
            PhaseKind::Suggestions => "suggestions",
            PhaseKind::Awakening => "awakening",
            PhaseKind::PostAmbiance => "post-ambiance",
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionPhase {
    pub kind: PhaseKind,
    pub duration_seconds: f64,
    pub text: Option<String>,
}

/// Where a position falls in the table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhasePosition {
    pub index: usize,
    pub kind: PhaseKind,
    /// Progress through the phase, 0..=1.
    pub fraction: f64,
}

#[derive(Debug, Clone)]
pub struct PhaseTable {
    phases: Vec<SessionPhase>,
    starts: Vec<f64>,
}

fn non_empty(text: &str) -> Option<String> {
    let t = text.trim();
    (!t.is_empty()).then(|| t.to_string())
}

impl PhaseTable {
    /// Split `total_seconds` into the six phases. Durations are not rounded;
    /// the sum equals the total unless a voice phase hit its floor.
    pub fn build(total_seconds: f64, script: Option<&SessionScript>) -> Self {
        let total = if total_seconds.is_finite() { total_seconds.max(0.0) } else { 0.0 };
        let core = (total - PRE_AMBIANCE_SECONDS - POST_AMBIANCE_SECONDS).max(0.0);
        let induction = core * INDUCTION_SHARE;
        let deepening = core * DEEPENING_SHARE;
        let suggestions = core * SUGGESTIONS_SHARE;
        let awakening = core - induction - deepening - suggestions;
        let floor = |d: f64| d.max(MIN_VOICE_PHASE_SECONDS);

        let text = |f: fn(&SessionScript) -> Option<String>| script.and_then(f);
        let phases = vec![
            SessionPhase {
                kind: PhaseKind::PreAmbiance,
                duration_seconds: PRE_AMBIANCE_SECONDS,
                text: None,
            },
            SessionPhase {
                kind: PhaseKind::Induction,
                duration_seconds: floor(induction),
                text: text(|s| non_empty(&s.induction)),
            },
            SessionPhase {
                kind: PhaseKind::Deepening,
                duration_seconds: floor(deepening),
                text: text(|s| non_empty(&s.deepening)),
            },
            SessionPhase {
                kind: PhaseKind::Suggestions,
                duration_seconds: floor(suggestions),
                text: text(|s| {
                    let joined = [s.suggestions.trim(), s.integration.trim()]
                        .iter()
                        .filter(|t| !t.is_empty())
                        .copied()
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    non_empty(&joined)
                }),
            },
            SessionPhase {
                kind: PhaseKind::Awakening,
                duration_seconds: floor(awakening),
                text: text(|s| non_empty(&s.awakening)),
            },
            SessionPhase {
                kind: PhaseKind::PostAmbiance,
                duration_seconds: POST_AMBIANCE_SECONDS,
                text: None,
            },
        ];

        let mut starts = Vec::with_capacity(phases.len());
        let mut acc = 0.0;
        for p in &phases {
            starts.push(acc);
            acc += p.duration_seconds;
        }
        Self { phases, starts }
    }

    pub fn phases(&self) -> &[SessionPhase] {
        &self.phases
    }

    /// Cumulative start offset of each phase.
    pub fn starts(&self) -> &[f64] {
        &self.starts
    }

    pub fn total_seconds(&self) -> f64 {
        self.phases.iter().map(|p| p.duration_seconds).sum()
    }

    /// Offset at which the voice phases begin.
    pub fn voice_start(&self) -> f64 {
        PRE_AMBIANCE_SECONDS
    }

    pub fn voice_end(&self) -> f64 {
        self.total_seconds() - POST_AMBIANCE_SECONDS
    }

    pub fn locate(&self, position_seconds: f64) -> PhasePosition {
        let pos = if position_seconds.is_nan() { 0.0 } else { position_seconds.max(0.0) };
        let index = self
            .starts
            .partition_point(|s| *s <= pos)
            .saturating_sub(1)
            .min(self.phases.len() - 1);
        let phase = &self.phases[index];
        let fraction = if phase.duration_seconds > 0.0 {
            ((pos - self.starts[index]) / phase.duration_seconds).clamp(0.0, 1.0)
        } else {
            1.0
        };
        PhasePosition {
            index,
            kind: phase.kind,
            fraction,
        }
    }
}
