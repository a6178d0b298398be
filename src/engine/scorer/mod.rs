mod evidence;
mod rules;

pub use evidence::{EvidenceSnapshot, TimingDeltas, SNAPSHOT_VERSION};

use crate::engine::config::ScoringConfig;
use crate::engine::domain::{
    AttributionSession, CheckoutContext, EngagementSummary, FlagKind, SessionRecord,
};

/// Everything the scorer is allowed to look at. Assembled by the
/// evaluation service; the scorer itself never touches storage, caches,
/// or the clock.
#[derive(Debug, Clone, Copy)]
pub struct ScorerInput<'a> {
    pub attribution: &'a AttributionSession,
    pub session: Option<&'a SessionRecord>,
    pub engagement: Option<&'a EngagementSummary>,
    pub checkout: Option<&'a CheckoutContext>,
    pub extra_flags: &'a [FlagKind],
}

/// Deterministic scoring result plus the evidence justifying it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub score: u8,
    pub flags: Vec<FlagKind>,
    pub triggered: bool,
    pub evidence: EvidenceSnapshot,
}

/// Stateless evaluator applying the configured rule set to a checkout
/// context. Safe for arbitrary parallel invocation.
pub struct Scorer<'a> {
    config: &'a ScoringConfig,
}

impl<'a> Scorer<'a> {
    pub fn new(config: &'a ScoringConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, input: &ScorerInput<'_>) -> ScoreOutcome {
        let flags = rules::collect_flags(self.config, input);

        let raw: u32 = flags
            .iter()
            .map(|flag| u32::from(self.config.weight(*flag)))
            .sum();
        let score = raw.min(100) as u8;

        let triggered = score >= self.config.threshold
            || flags.iter().any(|flag| self.config.is_hard_trigger(*flag));

        ScoreOutcome {
            score,
            flags,
            triggered,
            evidence: evidence::build_snapshot(input),
        }
    }
}
