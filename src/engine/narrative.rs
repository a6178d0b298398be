use serde::{Deserialize, Serialize};

use super::domain::{FlagKind, Narrative};
use super::scorer::EvidenceSnapshot;

/// Maximum flag reasons quoted in a summary.
const MAX_REASONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBand {
    Low,
    Medium,
    High,
}

impl RiskBand {
    pub fn label(&self) -> &'static str {
        match self {
            RiskBand::Low => "Low",
            RiskBand::Medium => "Medium",
            RiskBand::High => "High",
        }
    }

    pub fn from_score(score: u8, threshold: u8) -> Self {
        if score >= threshold {
            RiskBand::High
        } else if u16::from(score) * 2 >= u16::from(threshold) {
            RiskBand::Medium
        } else {
            RiskBand::Low
        }
    }

    fn recommended_action(&self) -> &'static str {
        match self {
            RiskBand::High => "Hold any affiliate commission and review this order manually.",
            RiskBand::Medium => "Queue for review; do not pay affiliate commission until cleared.",
            RiskBand::Low => "No action required.",
        }
    }
}

/// Structured output every narrative path produces, whether it came
/// from the deterministic builder or an external provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeAnalysis {
    pub summary: String,
    pub risk: RiskBand,
    pub reasons: Vec<String>,
    pub recommended_action: String,
}

/// What an external provider is allowed to see: score, flags, and the
/// privacy-safe evidence snapshot. Never raw PII.
#[derive(Debug, Clone, Serialize)]
pub struct NarrativeRequest {
    pub score: u8,
    pub threshold: u8,
    pub flags: Vec<FlagKind>,
    pub evidence: EvidenceSnapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum NarrativeError {
    #[error("narrative augmentation disabled")]
    Disabled,
    #[error("narrative provider misconfigured: {0}")]
    Misconfigured(String),
    #[error("narrative provider returned malformed output: {0}")]
    Malformed(String),
    #[error("narrative provider unavailable: {0}")]
    Unavailable(String),
}

/// External text-generation seam. Implementations must honor the
/// structured-output contract of [`NarrativeAnalysis`]; any failure is
/// absorbed by the caller's deterministic fallback.
pub trait NarrativeProvider: Send + Sync {
    fn generate(&self, request: &NarrativeRequest) -> Result<NarrativeAnalysis, NarrativeError>;
    fn model(&self) -> Option<String> {
        None
    }
}

/// Always-computable fallback summary derived purely from the scoring
/// result.
pub fn deterministic_analysis(score: u8, flags: &[FlagKind], threshold: u8) -> NarrativeAnalysis {
    let risk = RiskBand::from_score(score, threshold);
    let reasons: Vec<String> = flags
        .iter()
        .take(MAX_REASONS)
        .map(|flag| flag.reason().to_string())
        .collect();

    let summary = if reasons.is_empty() {
        format!(
            "{} risk (score {score}/100). No fraud signals were raised for this checkout.",
            risk.label()
        )
    } else {
        format!(
            "{} risk (score {score}/100): {}.",
            risk.label(),
            reasons.join("; ")
        )
    };

    NarrativeAnalysis {
        summary,
        risk,
        reasons,
        recommended_action: risk.recommended_action().to_string(),
    }
}

/// Render an analysis into the persisted narrative form.
pub fn to_narrative(analysis: &NarrativeAnalysis, model: Option<String>) -> Narrative {
    Narrative {
        text: format!(
            "{} Recommended action: {}",
            analysis.summary, analysis.recommended_action
        ),
        model,
        version: Some("v1".to_string()),
    }
}

/// Ask the provider, falling back to the deterministic analysis on any
/// failure. Never errors.
pub fn augment(
    provider: Option<&dyn NarrativeProvider>,
    request: &NarrativeRequest,
) -> Narrative {
    if let Some(provider) = provider {
        match provider.generate(request) {
            Ok(analysis) => return to_narrative(&analysis, provider.model()),
            Err(err) => {
                tracing::debug!(error = %err, "narrative provider failed; using deterministic summary");
            }
        }
    }
    let analysis = deterministic_analysis(request.score, &request.flags, request.threshold);
    to_narrative(&analysis, None)
}

/// Canned provider for tests and demos.
pub struct StaticNarrativeProvider {
    pub analysis: Option<NarrativeAnalysis>,
    pub model_tag: Option<String>,
}

impl NarrativeProvider for StaticNarrativeProvider {
    fn generate(&self, _request: &NarrativeRequest) -> Result<NarrativeAnalysis, NarrativeError> {
        self.analysis
            .clone()
            .ok_or_else(|| NarrativeError::Unavailable("no canned analysis".to_string()))
    }

    fn model(&self) -> Option<String> {
        self.model_tag.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_bands_follow_the_threshold() {
        assert_eq!(RiskBand::from_score(80, 60), RiskBand::High);
        assert_eq!(RiskBand::from_score(35, 60), RiskBand::Medium);
        assert_eq!(RiskBand::from_score(10, 60), RiskBand::Low);
        assert_eq!(RiskBand::from_score(0, 0), RiskBand::High);
    }

    #[test]
    fn deterministic_summary_quotes_top_flags() {
        let analysis = deterministic_analysis(
            85,
            &[
                FlagKind::GoogleAdsConflict,
                FlagKind::LateInjection,
                FlagKind::LowEngagement,
                FlagKind::SuspiciousReferrer,
            ],
            60,
        );

        assert_eq!(analysis.risk, RiskBand::High);
        assert_eq!(analysis.reasons.len(), MAX_REASONS);
        assert!(analysis.summary.contains("score 85/100"));
        assert!(analysis.summary.contains("paid and affiliate attribution"));
        assert!(!analysis.summary.contains("suspicious domain"), "fourth flag is dropped");
    }

    #[test]
    fn provider_failure_falls_back_to_deterministic_text() {
        let provider = StaticNarrativeProvider {
            analysis: None,
            model_tag: Some("llm-x".to_string()),
        };
        let request = NarrativeRequest {
            score: 70,
            threshold: 60,
            flags: vec![FlagKind::NoAffiliateEvidence],
            evidence: EvidenceSnapshot::default(),
        };

        let narrative = augment(Some(&provider), &request);
        assert!(narrative.text.contains("High risk"));
        assert_eq!(narrative.model, None, "fallback carries no model tag");
    }

    #[test]
    fn provider_success_carries_its_model_tag() {
        let provider = StaticNarrativeProvider {
            analysis: Some(NarrativeAnalysis {
                summary: "Looks coordinated.".to_string(),
                risk: RiskBand::High,
                reasons: vec!["shared network address".to_string()],
                recommended_action: "Review.".to_string(),
            }),
            model_tag: Some("llm-x".to_string()),
        };
        let request = NarrativeRequest {
            score: 90,
            threshold: 60,
            flags: vec![FlagKind::DuplicateIpPattern],
            evidence: EvidenceSnapshot::default(),
        };

        let narrative = augment(Some(&provider), &request);
        assert!(narrative.text.starts_with("Looks coordinated."));
        assert_eq!(narrative.model.as_deref(), Some("llm-x"));
    }
}
