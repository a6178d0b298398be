//! Affiliate-fraud attribution and scoring engine.
//!
//! Evidence capture freezes each session's acquisition signals at first
//! touch; checkout completion runs the deterministic scorer over that
//! evidence and persists one evaluation row per linked entity. Every
//! ingest-path operation fails open: a storage or configuration problem
//! downgrades to a skipped evaluation, never to a checkout error.

pub mod backfill;
pub mod capture;
pub mod config;
pub mod config_store;
pub mod domain;
pub mod narrative;
pub mod repository;
pub mod router;
pub mod scorer;
pub mod service;
pub mod signals;

pub use backfill::{BackfillJob, BackfillReport, BackfillSettings};
pub use capture::{CaptureOutcome, CaptureRequest, EvidenceCapture};
pub use config::{ScoringConfig, CONFIG_VERSION};
pub use config_store::{ConfigStore, ConfigWriteError};
pub use domain::{
    AttributionSession, CheckoutContext, EngagementSummary, EntityKind, EntityLinks, FirstTouch,
    FlagKind, FraudEvaluation, LastSeen, Narrative, Resolution, ResolutionStatus, SessionId,
    SessionRecord, SourceKind, UtmFields,
};
pub use narrative::{NarrativeAnalysis, NarrativeProvider, RiskBand, StaticNarrativeProvider};
pub use repository::{
    AttributionRepository, CheckoutCompletion, ConfigRepository, EvaluationRepository,
    InMemoryAttributionRepository, InMemoryConfigRepository, InMemoryEvaluationRepository,
    InMemorySessionDirectory, RepositoryError, ResolutionTarget, SessionDirectory,
};
pub use router::{engine_router, EngineState};
pub use scorer::{ScoreOutcome, Scorer, ScorerInput};
pub use service::{
    AdminError, CheckoutEvaluation, CheckoutPayload, EvaluationDetail, EvaluationMarker,
    EvaluationService, ResolutionUpdate,
};
