use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::ScoringConfig;
use super::config_store::{ConfigStore, ConfigWriteError};
use super::domain::{
    AttributionSession, CheckoutContext, EntityKind, EntityLinks, FirstTouch, FlagKind,
    FraudEvaluation, Resolution, ResolutionStatus, SessionId, SessionRecord, SourceKind,
    UnknownResolutionStatus,
};
use super::narrative::{
    self, deterministic_analysis, NarrativeAnalysis, NarrativeProvider, NarrativeRequest,
};
use super::repository::{
    AttributionRepository, ConfigRepository, EvaluationRepository, RepositoryError,
    ResolutionTarget, SessionDirectory,
};
use super::scorer::{ScoreOutcome, Scorer, ScorerInput};
use super::signals;

const NEGATIVE_PROBE_TTL: Duration = Duration::from_secs(30);
const MAX_NOTE_LEN: usize = 2000;

/// Checkout-completion payload as delivered by the ingest pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutPayload {
    pub occurred_at: Option<DateTime<Utc>>,
    pub checkout_token: Option<String>,
    pub order_id: Option<String>,
    pub currency: Option<String>,
    /// Order total in minor units.
    pub total: Option<i64>,
}

/// Synchronous response handed back to the ingest pipeline. Fail-open:
/// `ok=false, skipped=true` covers every degraded path, and the call
/// never raises.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutEvaluation {
    pub ok: bool,
    pub skipped: bool,
    pub score: u8,
    pub triggered: bool,
    pub flags: Vec<FlagKind>,
}

impl CheckoutEvaluation {
    fn skipped() -> Self {
        Self {
            ok: false,
            skipped: true,
            score: 0,
            triggered: false,
            flags: Vec::new(),
        }
    }
}

/// Per-id marker for dashboard lists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationMarker {
    pub entity_id: String,
    pub available: bool,
    pub has_eval: bool,
    pub triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    pub flags: Vec<FlagKind>,
}

impl EvaluationMarker {
    fn unavailable(entity_id: String) -> Self {
        Self {
            entity_id,
            available: false,
            has_eval: false,
            triggered: false,
            score: None,
            flags: Vec::new(),
        }
    }
}

/// Full evaluation view for the review screen: the stored row plus a
/// deterministic analysis recomputed against the current threshold.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationDetail {
    pub evaluation: FraudEvaluation,
    pub analysis: NarrativeAnalysis,
}

/// Admin resolution-workflow update, addressed by evaluation id or by
/// (entity kind, entity id).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolutionUpdate {
    pub evaluation_id: Option<u64>,
    pub entity_kind: Option<EntityKind>,
    pub entity_id: Option<String>,
    pub status: String,
    pub note: Option<String>,
    pub resolver: Option<String>,
}

/// Errors surfaced only on admin-facing paths; the ingest path never
/// sees any of these.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("evaluation not found")]
    NotFound,
    #[error(transparent)]
    InvalidStatus(#[from] UnknownResolutionStatus),
    #[error("note exceeds {MAX_NOTE_LEN} characters")]
    NoteTooLong,
    #[error("an evaluation id or (entity kind, entity id) pair is required")]
    MissingIdentifier,
    #[error(transparent)]
    Storage(#[from] RepositoryError),
    #[error(transparent)]
    Config(#[from] ConfigWriteError),
}

struct ProbeState {
    available: bool,
    negative_until: Option<Instant>,
}

/// Orchestrates lookups, duplicate-pattern detection, scoring,
/// evaluation persistence, and narrative launch. Sits behind the
/// ingest pipeline and must never block or fail it.
pub struct EvaluationService<A, S, E, C> {
    attribution: Arc<A>,
    directory: Arc<S>,
    evaluations: Arc<E>,
    config_store: Arc<ConfigStore<C>>,
    narrative_provider: Option<Arc<dyn NarrativeProvider>>,
    in_flight_narratives: Arc<Mutex<HashSet<String>>>,
    probe_state: Mutex<ProbeState>,
}

impl<A, S, E, C> EvaluationService<A, S, E, C>
where
    A: AttributionRepository,
    S: SessionDirectory,
    E: EvaluationRepository + 'static,
    C: ConfigRepository,
{
    pub fn new(
        attribution: Arc<A>,
        directory: Arc<S>,
        evaluations: Arc<E>,
        config_store: Arc<ConfigStore<C>>,
        narrative_provider: Option<Arc<dyn NarrativeProvider>>,
    ) -> Self {
        Self {
            attribution,
            directory,
            evaluations,
            config_store,
            narrative_provider,
            in_flight_narratives: Arc::new(Mutex::new(HashSet::new())),
            probe_state: Mutex::new(ProbeState {
                available: false,
                negative_until: None,
            }),
        }
    }

    pub fn config_store(&self) -> &ConfigStore<C> {
        &self.config_store
    }

    /// Score a completed checkout and persist the evaluation rows.
    pub fn evaluate_checkout_completed(
        &self,
        session_id: &str,
        payload: CheckoutPayload,
        received_at: DateTime<Utc>,
    ) -> CheckoutEvaluation {
        let Some(session_id) = signals::bounded(session_id) else {
            return CheckoutEvaluation::skipped();
        };
        if !self.tables_ok() {
            return CheckoutEvaluation::skipped();
        }

        let config = self.config_store.read(true);
        let sid = SessionId(session_id.clone());

        let session = match self.directory.fetch(&sid) {
            Ok(session) => session,
            Err(err) => {
                warn!(session = %sid, error = %err, "session lookup failed during evaluation");
                None
            }
        };
        let attribution = match self.attribution.fetch(&sid) {
            Ok(Some(row)) => row,
            Ok(None) => synthesize_attribution(&sid, session.as_ref(), &config, received_at),
            Err(err) => {
                warn!(session = %sid, error = %err, "attribution lookup failed; synthesizing");
                synthesize_attribution(&sid, session.as_ref(), &config, received_at)
            }
        };
        let engagement = match self.directory.engagement(&sid) {
            Ok(engagement) => engagement,
            Err(err) => {
                warn!(session = %sid, error = %err, "engagement lookup failed during evaluation");
                None
            }
        };

        let mut extra_flags = Vec::new();
        if let Some(ip_hash) = attribution.first_touch.ip_hash.as_deref() {
            let since =
                received_at - TimeDelta::minutes(i64::from(config.duplicate_ip_window_minutes));
            match self.evaluations.count_triggered_by_ip_hash(ip_hash, since) {
                Ok(count) if count >= config.duplicate_ip_min_count => {
                    extra_flags.push(FlagKind::DuplicateIpPattern);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(session = %sid, error = %err, "duplicate-ip count failed; flag omitted");
                }
            }
        }

        let checkout = CheckoutContext {
            occurred_at: payload.occurred_at.unwrap_or(received_at),
            checkout_token: payload.checkout_token.as_deref().and_then(signals::bounded),
            order_id: payload.order_id.as_deref().and_then(signals::bounded),
            currency: payload
                .currency
                .as_deref()
                .and_then(signals::bounded)
                .map(|c| c.to_ascii_uppercase()),
            total: payload.total,
        };

        let outcome = Scorer::new(&config).evaluate(&ScorerInput {
            attribution: &attribution,
            session: session.as_ref(),
            engagement: engagement.as_ref(),
            checkout: Some(&checkout),
            extra_flags: &extra_flags,
        });

        let links = EntityLinks {
            session_id: Some(session_id.clone()),
            visitor_id: attribution
                .visitor_id
                .clone()
                .or_else(|| session.as_ref().and_then(|s| s.visitor_id.clone())),
            order_id: checkout.order_id.clone(),
            checkout_token: checkout.checkout_token.clone(),
            ip_hash: attribution.first_touch.ip_hash.clone(),
        };

        let purchase_id = checkout
            .checkout_token
            .clone()
            .or_else(|| checkout.order_id.clone())
            .unwrap_or_else(|| {
                signals::purchase_fallback_key(
                    checkout.currency.as_deref(),
                    checkout.total,
                    checkout.occurred_at,
                    &session_id,
                )
            });

        let mut entities = vec![
            (EntityKind::Session, session_id.clone()),
            (EntityKind::Purchase, purchase_id),
        ];
        if let Some(order_id) = checkout.order_id.clone() {
            entities.push((EntityKind::Order, order_id));
        }

        for (kind, entity_id) in &entities {
            if let Err(err) = self.upsert_entity(*kind, entity_id, &outcome, &links, received_at) {
                warn!(
                    session = %sid,
                    entity = ?kind,
                    error = %err,
                    "evaluation upsert failed; continuing"
                );
            }
        }

        if outcome.triggered {
            info!(
                session = %sid,
                score = outcome.score,
                flags = ?outcome.flags,
                "checkout evaluation triggered"
            );
            if config.narrative.enabled {
                self.launch_narrative(&session_id, &config, &outcome, entities);
            }
        }

        CheckoutEvaluation {
            ok: true,
            skipped: false,
            score: outcome.score,
            triggered: outcome.triggered,
            flags: outcome.flags,
        }
    }

    /// Existence probe for the evaluation storage: a positive result is
    /// cached for the process lifetime, a negative one for ~30 seconds
    /// so an absent table does not get hammered.
    pub fn tables_ok(&self) -> bool {
        let Ok(mut state) = self.probe_state.lock() else {
            return false;
        };
        if state.available {
            return true;
        }
        if let Some(until) = state.negative_until {
            if Instant::now() < until {
                return false;
            }
        }
        match self.evaluations.probe() {
            Ok(()) => {
                state.available = true;
                true
            }
            Err(err) => {
                debug!(error = %err, "evaluation storage probe failed");
                state.negative_until = Some(Instant::now() + NEGATIVE_PROBE_TTL);
                false
            }
        }
    }

    /// Batched marker lookup for dashboard lists. Infallible: storage
    /// trouble is reported per-id through `available=false`.
    pub fn markers(&self, kind: EntityKind, entity_ids: &[String]) -> Vec<EvaluationMarker> {
        if !self.tables_ok() {
            return entity_ids
                .iter()
                .cloned()
                .map(EvaluationMarker::unavailable)
                .collect();
        }
        let found = match self.evaluations.fetch_batch(kind, entity_ids) {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, "marker batch lookup failed");
                return entity_ids
                    .iter()
                    .cloned()
                    .map(EvaluationMarker::unavailable)
                    .collect();
            }
        };

        entity_ids
            .iter()
            .map(|entity_id| {
                match found.iter().find(|row| &row.entity_id == entity_id) {
                    Some(row) => EvaluationMarker {
                        entity_id: entity_id.clone(),
                        available: true,
                        has_eval: true,
                        triggered: row.triggered,
                        score: Some(row.score),
                        flags: row.flags.clone(),
                    },
                    None => EvaluationMarker {
                        entity_id: entity_id.clone(),
                        available: true,
                        has_eval: false,
                        triggered: false,
                        score: None,
                        flags: Vec::new(),
                    },
                }
            })
            .collect()
    }

    /// Single-entity detail for the review screen.
    pub fn detail(&self, kind: EntityKind, entity_id: &str) -> Result<EvaluationDetail, AdminError> {
        let row = self
            .evaluations
            .fetch(kind, entity_id)?
            .ok_or(AdminError::NotFound)?;
        let config = self.config_store.read(true);
        let analysis = deterministic_analysis(row.score, &row.flags, config.threshold);
        Ok(EvaluationDetail {
            evaluation: row,
            analysis,
        })
    }

    /// Admin resolution-workflow update; validates and may error.
    pub fn update_resolution(
        &self,
        update: ResolutionUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), AdminError> {
        let status: ResolutionStatus = update.status.parse()?;
        if let Some(note) = &update.note {
            if note.chars().count() > MAX_NOTE_LEN {
                return Err(AdminError::NoteTooLong);
            }
        }

        let target = if let Some(id) = update.evaluation_id {
            ResolutionTarget::ById(id)
        } else {
            match (update.entity_kind, update.entity_id) {
                (Some(kind), Some(entity_id)) if !entity_id.trim().is_empty() => {
                    ResolutionTarget::ByEntity(kind, entity_id.trim().to_string())
                }
                _ => return Err(AdminError::MissingIdentifier),
            }
        };

        let resolution = Resolution {
            status,
            resolver: update.resolver.as_deref().and_then(signals::bounded),
            note: update.note.as_deref().and_then(signals::bounded),
        };

        self.evaluations
            .update_resolution(&target, resolution, now)
            .map_err(|err| match err {
                RepositoryError::NotFound => AdminError::NotFound,
                other => AdminError::Storage(other),
            })
    }

    pub fn read_config(&self) -> ScoringConfig {
        self.config_store.read(true)
    }

    pub fn write_config(&self, next: serde_json::Value) -> Result<ScoringConfig, AdminError> {
        Ok(self.config_store.write(next)?)
    }

    fn upsert_entity(
        &self,
        kind: EntityKind,
        entity_id: &str,
        outcome: &ScoreOutcome,
        links: &EntityLinks,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let existing = self.evaluations.fetch(kind, entity_id)?;
        let (id, created_at, resolution, narrative, merged_links) = match &existing {
            Some(row) => (
                row.id,
                row.created_at,
                row.resolution.clone(),
                row.narrative.clone(),
                row.links.merged_with(links),
            ),
            None => (None, now, Resolution::default(), None, links.clone()),
        };

        self.evaluations.upsert(FraudEvaluation {
            id,
            entity_kind: kind,
            entity_id: entity_id.to_string(),
            score: outcome.score,
            flags: outcome.flags.clone(),
            triggered: outcome.triggered,
            evidence: outcome.evidence.clone(),
            resolution,
            narrative,
            links: merged_links,
            created_at,
            updated_at: now,
        })
    }

    /// Detached narrative generation, de-duplicated per session. The
    /// task's result is discarded when another path stored a narrative
    /// first.
    fn launch_narrative(
        &self,
        session_id: &str,
        config: &ScoringConfig,
        outcome: &ScoreOutcome,
        entities: Vec<(EntityKind, String)>,
    ) {
        // Narrative work is best-effort; without an async runtime it is
        // skipped rather than letting the spawn panic reach the caller.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(session = session_id, "no async runtime available; narrative skipped");
            return;
        };

        {
            let Ok(mut in_flight) = self.in_flight_narratives.lock() else {
                return;
            };
            if !in_flight.insert(session_id.to_string()) {
                debug!(session = session_id, "narrative already in flight; not relaunching");
                return;
            }
        }

        let request = NarrativeRequest {
            score: outcome.score,
            threshold: config.threshold,
            flags: outcome.flags.clone(),
            evidence: outcome.evidence.clone(),
        };
        let provider = self.narrative_provider.clone();
        let evaluations = Arc::clone(&self.evaluations);
        let in_flight = Arc::clone(&self.in_flight_narratives);
        let session_id = session_id.to_string();

        handle.spawn(async move {
            let narrative = narrative::augment(provider.as_deref(), &request);
            for (kind, entity_id) in entities {
                match evaluations.set_narrative_if_absent(kind, &entity_id, narrative.clone()) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(entity = %entity_id, "narrative already present; result discarded");
                    }
                    Err(err) => {
                        debug!(entity = %entity_id, error = %err, "narrative attach failed");
                    }
                }
            }
            if let Ok(mut set) = in_flight.lock() {
                set.remove(&session_id);
            }
        });
    }
}

/// Minimal attribution rebuilt from the session's own stored URL fields
/// when evidence capture never saw the session. Tagged `unknown` so the
/// synthesized origin is distinguishable from captured first touch.
fn synthesize_attribution(
    session_id: &SessionId,
    session: Option<&SessionRecord>,
    config: &ScoringConfig,
    received_at: DateTime<Utc>,
) -> AttributionSession {
    let entry_url = session.and_then(|s| s.entry_url.as_deref());
    let params = entry_url.map(signals::query_params).unwrap_or_default();
    let extracted = signals::extract_signals(&params, config);

    let mut utm = extracted.utm;
    if let Some(session) = session {
        utm.source = utm.source.or_else(|| session.utm.source.clone());
        utm.medium = utm.medium.or_else(|| session.utm.medium.clone());
        utm.campaign = utm.campaign.or_else(|| session.utm.campaign.clone());
        utm.term = utm.term.or_else(|| session.utm.term.clone());
        utm.content = utm.content.or_else(|| session.utm.content.clone());
    }

    AttributionSession {
        session_id: session_id.clone(),
        visitor_id: session.and_then(|s| s.visitor_id.clone()),
        first_touch: FirstTouch {
            source_kind: SourceKind::Unknown,
            utm,
            paid_click_ids: extracted.paid_click_ids,
            affiliate_click_ids: extracted.affiliate_click_ids,
            affiliate_id_hint: extracted.affiliate_id_hint,
            network_hint: extracted.network_hint,
            landing_url: entry_url.and_then(|u| signals::sanitize_url(u, config)),
            referrer: session
                .and_then(|s| s.referrer.as_deref())
                .and_then(signals::bounded),
            ip_hash: None,
            ua_hash: None,
            first_seen: session.and_then(|s| s.started_at).unwrap_or(received_at),
        },
        last_seen: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::domain::{EngagementSummary, LastSeen, UtmFields};
    use crate::engine::narrative::StaticNarrativeProvider;
    use crate::engine::repository::{
        InMemoryAttributionRepository, InMemoryConfigRepository, InMemoryEvaluationRepository,
        InMemorySessionDirectory,
    };
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    type TestService = EvaluationService<
        InMemoryAttributionRepository,
        InMemorySessionDirectory,
        InMemoryEvaluationRepository,
        InMemoryConfigRepository,
    >;

    struct Fixture {
        attribution: Arc<InMemoryAttributionRepository>,
        directory: Arc<InMemorySessionDirectory>,
        evaluations: Arc<InMemoryEvaluationRepository>,
        service: TestService,
    }

    fn fixture_with(provider: Option<Arc<dyn NarrativeProvider>>) -> Fixture {
        let attribution = Arc::new(InMemoryAttributionRepository::default());
        let directory = Arc::new(InMemorySessionDirectory::default());
        let evaluations = Arc::new(InMemoryEvaluationRepository::default());
        let config_store = Arc::new(ConfigStore::new(Arc::new(
            InMemoryConfigRepository::default(),
        )));
        let service = EvaluationService::new(
            attribution.clone(),
            directory.clone(),
            evaluations.clone(),
            config_store,
            provider,
        );
        Fixture {
            attribution,
            directory,
            evaluations,
            service,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0).unwrap()
    }

    fn attribution_row(session_id: &str, ip_hash: Option<&str>) -> AttributionSession {
        AttributionSession {
            session_id: SessionId(session_id.to_string()),
            visitor_id: Some("vis-1".to_string()),
            first_touch: FirstTouch {
                source_kind: SourceKind::Direct,
                utm: UtmFields::default(),
                paid_click_ids: BTreeMap::new(),
                affiliate_click_ids: BTreeMap::new(),
                affiliate_id_hint: None,
                network_hint: None,
                landing_url: Some("https://shop.example/".to_string()),
                referrer: None,
                ip_hash: ip_hash.map(str::to_string),
                ua_hash: None,
                first_seen: at(0),
            },
            last_seen: None,
        }
    }

    fn healthy_engagement() -> EngagementSummary {
        EngagementSummary {
            total_events: 30,
            page_views: 12,
            product_views: 5,
            add_to_carts: 1,
            first_event_at: Some(at(0)),
            last_event_at: Some(at(29)),
            checkout_started_at: Some(at(28)),
        }
    }

    fn payload(token: Option<&str>, order: Option<&str>) -> CheckoutPayload {
        CheckoutPayload {
            occurred_at: Some(at(30)),
            checkout_token: token.map(str::to_string),
            order_id: order.map(str::to_string),
            currency: Some("usd".to_string()),
            total: Some(4999),
        }
    }

    #[test]
    fn empty_session_id_is_fail_open() {
        let fx = fixture();
        let result = fx.service.evaluate_checkout_completed("  ", payload(None, None), at(30));
        assert!(!result.ok);
        assert!(result.skipped);
    }

    #[test]
    fn evaluation_writes_session_purchase_and_order_rows() {
        let fx = fixture();
        fx.attribution
            .insert(attribution_row("sess-1", None))
            .expect("seed attribution");
        fx.directory.put_engagement("sess-1", healthy_engagement());

        let result = fx.service.evaluate_checkout_completed(
            "sess-1",
            payload(Some("tok-1"), Some("order-9")),
            at(30),
        );
        assert!(result.ok);
        assert!(!result.skipped);

        let session_row = fx
            .evaluations
            .fetch(EntityKind::Session, "sess-1")
            .expect("fetch works")
            .expect("session row written");
        let purchase_row = fx
            .evaluations
            .fetch(EntityKind::Purchase, "tok-1")
            .expect("fetch works")
            .expect("purchase keyed by checkout token");
        let order_row = fx
            .evaluations
            .fetch(EntityKind::Order, "order-9")
            .expect("fetch works")
            .expect("order row written");

        assert_eq!(session_row.score, purchase_row.score);
        assert_eq!(purchase_row.flags, order_row.flags);
        assert_eq!(session_row.links.order_id.as_deref(), Some("order-9"));
        assert_eq!(purchase_row.links.checkout_token.as_deref(), Some("tok-1"));
    }

    #[test]
    fn missing_attribution_synthesizes_from_session_record() {
        let fx = fixture();
        fx.directory.put_session(SessionRecord {
            session_id: "sess-2".to_string(),
            visitor_id: Some("vis-2".to_string()),
            entry_url: Some("https://shop.example/?utm_medium=affiliate&aff_id=acme".to_string()),
            started_at: Some(at(0)),
            ..SessionRecord::default()
        });
        fx.directory.put_engagement("sess-2", healthy_engagement());

        let result =
            fx.service
                .evaluate_checkout_completed("sess-2", payload(Some("tok-2"), None), at(30));
        assert!(result.ok);
        assert!(result.flags.contains(&FlagKind::NoAffiliateEvidence));

        let row = fx
            .evaluations
            .fetch(EntityKind::Session, "sess-2")
            .expect("fetch works")
            .expect("row written");
        assert_eq!(row.evidence.source_kind.as_deref(), Some("unknown"));
        assert_eq!(row.links.visitor_id.as_deref(), Some("vis-2"));
    }

    #[test]
    fn fallback_purchase_key_is_idempotent_across_resubmission() {
        let fx = fixture();
        fx.attribution
            .insert(attribution_row("sess-3", None))
            .expect("seed attribution");
        fx.directory.put_engagement("sess-3", healthy_engagement());

        let first = fx
            .service
            .evaluate_checkout_completed("sess-3", payload(None, None), at(30));
        let second = fx
            .service
            .evaluate_checkout_completed("sess-3", payload(None, None), at(31));
        assert_eq!(first.score, second.score);
        assert_eq!(first.flags, second.flags);

        let fallback = crate::engine::signals::purchase_fallback_key(
            Some("USD"),
            Some(4999),
            at(30),
            "sess-3",
        );
        let row = fx
            .evaluations
            .fetch(EntityKind::Purchase, &fallback)
            .expect("fetch works")
            .expect("one purchase row under the fallback key");
        assert_eq!(row.entity_id, fallback);
    }

    #[test]
    fn reevaluation_preserves_resolution_and_links() {
        let fx = fixture();
        fx.attribution
            .insert(attribution_row("sess-4", None))
            .expect("seed attribution");
        fx.directory.put_engagement("sess-4", healthy_engagement());

        fx.service
            .evaluate_checkout_completed("sess-4", payload(Some("tok-4"), Some("order-4")), at(30));
        fx.service
            .update_resolution(
                ResolutionUpdate {
                    entity_kind: Some(EntityKind::Session),
                    entity_id: Some("sess-4".to_string()),
                    status: "reviewed".to_string(),
                    note: Some("checked by hand".to_string()),
                    resolver: Some("analyst@shop".to_string()),
                    evaluation_id: None,
                },
                at(40),
            )
            .expect("resolution update");

        // Second submission without the order id: links must survive.
        fx.service
            .evaluate_checkout_completed("sess-4", payload(Some("tok-4"), None), at(45));

        let row = fx
            .evaluations
            .fetch(EntityKind::Session, "sess-4")
            .expect("fetch works")
            .expect("row exists");
        assert_eq!(row.resolution.status, ResolutionStatus::Reviewed);
        assert_eq!(row.resolution.note.as_deref(), Some("checked by hand"));
        assert_eq!(row.links.order_id.as_deref(), Some("order-4"));
        assert_eq!(row.created_at, at(30));
        assert_eq!(row.updated_at, at(45));
    }

    #[test]
    fn duplicate_ip_pattern_requires_an_ip_hash() {
        let fx = fixture();
        let shared_hash = "c".repeat(64);

        // Three earlier triggered session evaluations share the hash.
        for n in 0..3 {
            let sid = format!("prior-{n}");
            fx.attribution
                .insert(attribution_row(&sid, Some(&shared_hash)))
                .expect("seed attribution");
            fx.evaluations
                .upsert(FraudEvaluation {
                    id: None,
                    entity_kind: EntityKind::Session,
                    entity_id: sid.clone(),
                    score: 80,
                    flags: vec![FlagKind::NoAffiliateEvidence],
                    triggered: true,
                    evidence: Default::default(),
                    resolution: Resolution::default(),
                    narrative: None,
                    links: EntityLinks {
                        session_id: Some(sid),
                        ip_hash: Some(shared_hash.clone()),
                        ..EntityLinks::default()
                    },
                    created_at: at(10),
                    updated_at: at(10),
                })
                .expect("seed evaluation");
        }

        fx.attribution
            .insert(attribution_row("sess-5", Some(&shared_hash)))
            .expect("seed attribution");
        fx.directory.put_engagement("sess-5", healthy_engagement());
        let flagged =
            fx.service
                .evaluate_checkout_completed("sess-5", payload(Some("tok-5"), None), at(30));
        assert!(flagged.flags.contains(&FlagKind::DuplicateIpPattern));

        // No hash on the attribution row: the flag can never appear.
        fx.attribution
            .insert(attribution_row("sess-6", None))
            .expect("seed attribution");
        fx.directory.put_engagement("sess-6", healthy_engagement());
        let unflagged =
            fx.service
                .evaluate_checkout_completed("sess-6", payload(Some("tok-6"), None), at(30));
        assert!(!unflagged.flags.contains(&FlagKind::DuplicateIpPattern));
    }

    #[test]
    fn markers_distinguish_missing_rows_from_missing_storage() {
        let fx = fixture();
        fx.attribution
            .insert(attribution_row("sess-7", None))
            .expect("seed attribution");
        fx.directory.put_engagement("sess-7", healthy_engagement());
        fx.service
            .evaluate_checkout_completed("sess-7", payload(Some("tok-7"), None), at(30));

        let markers = fx.service.markers(
            EntityKind::Session,
            &["sess-7".to_string(), "sess-unknown".to_string()],
        );
        assert_eq!(markers.len(), 2);
        assert!(markers[0].available && markers[0].has_eval);
        assert_eq!(markers[0].score, Some(0));
        assert!(markers[1].available && !markers[1].has_eval);
    }

    #[test]
    fn resolution_update_validates_status_and_identifier() {
        let fx = fixture();
        let err = fx
            .service
            .update_resolution(
                ResolutionUpdate {
                    status: "escalated".to_string(),
                    ..ResolutionUpdate::default()
                },
                at(0),
            )
            .expect_err("unknown status");
        assert!(matches!(err, AdminError::InvalidStatus(_)));

        let err = fx
            .service
            .update_resolution(
                ResolutionUpdate {
                    status: "reviewed".to_string(),
                    ..ResolutionUpdate::default()
                },
                at(0),
            )
            .expect_err("missing identifier");
        assert!(matches!(err, AdminError::MissingIdentifier));
    }

    #[test]
    fn resolution_update_by_numeric_id() {
        let fx = fixture();
        fx.attribution
            .insert(attribution_row("sess-8", None))
            .expect("seed attribution");
        fx.directory.put_engagement("sess-8", healthy_engagement());
        fx.service
            .evaluate_checkout_completed("sess-8", payload(Some("tok-8"), None), at(30));

        let row = fx
            .evaluations
            .fetch(EntityKind::Session, "sess-8")
            .expect("fetch works")
            .expect("row exists");
        let numeric_id = row.id.expect("identity assigned");

        fx.service
            .update_resolution(
                ResolutionUpdate {
                    evaluation_id: Some(numeric_id),
                    status: "approved".to_string(),
                    ..ResolutionUpdate::default()
                },
                at(40),
            )
            .expect("update by id");

        let row = fx
            .evaluations
            .fetch(EntityKind::Session, "sess-8")
            .expect("fetch works")
            .expect("row exists");
        assert_eq!(row.resolution.status, ResolutionStatus::Approved);
    }

    #[tokio::test]
    async fn triggered_evaluation_attaches_a_narrative_once() {
        let provider: Arc<dyn NarrativeProvider> = Arc::new(StaticNarrativeProvider {
            analysis: None,
            model_tag: None,
        });
        let fx = fixture_with(Some(provider));

        // Enable narratives and make everything trigger.
        let mut config = serde_json::to_value(ScoringConfig::default()).expect("serializes");
        config["threshold"] = json!(1);
        config["narrative"] = json!({ "enabled": true, "model": "canned" });
        fx.service.write_config(config).expect("config write");

        // Late-injected affiliate click to guarantee flags.
        let mut row = attribution_row("sess-9", None);
        row.last_seen = Some(LastSeen {
            at: at(29),
            new_paid_click_ids: BTreeMap::new(),
            new_affiliate_click_ids: BTreeMap::from([("irclickid".to_string(), "x".to_string())]),
            affiliate_id_hint: None,
            network_hint: None,
            current_url: None,
        });
        fx.attribution.insert(row).expect("seed attribution");
        fx.directory.put_engagement("sess-9", healthy_engagement());

        let result =
            fx.service
                .evaluate_checkout_completed("sess-9", payload(Some("tok-9"), None), at(30));
        assert!(result.triggered);

        // Let the detached task run.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let row = fx
            .evaluations
            .fetch(EntityKind::Session, "sess-9")
            .expect("fetch works")
            .expect("row exists");
        let narrative = row.narrative.expect("narrative attached");
        assert!(narrative.text.contains("risk"));
        assert_eq!(narrative.model, None, "failed provider falls back without a model tag");

        // First write wins: a re-evaluation must not replace it.
        fx.service
            .evaluate_checkout_completed("sess-9", payload(Some("tok-9"), None), at(35));
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        let row = fx
            .evaluations
            .fetch(EntityKind::Session, "sess-9")
            .expect("fetch works")
            .expect("row exists");
        assert_eq!(row.narrative.expect("still present").text, narrative.text);
    }

    // Plain #[test] on purpose: evaluation must stay usable without a runtime,
    // silently skipping the narrative instead of panicking in spawn.
    #[test]
    fn narrative_launch_without_runtime_fails_open() {
        let provider: Arc<dyn NarrativeProvider> = Arc::new(StaticNarrativeProvider {
            analysis: None,
            model_tag: None,
        });
        let fx = fixture_with(Some(provider));

        let mut config = serde_json::to_value(ScoringConfig::default()).expect("serializes");
        config["threshold"] = json!(1);
        config["narrative"] = json!({ "enabled": true, "model": "canned" });
        fx.service.write_config(config).expect("config write");

        let mut row = attribution_row("sess-sync", None);
        row.last_seen = Some(LastSeen {
            at: at(29),
            new_paid_click_ids: BTreeMap::new(),
            new_affiliate_click_ids: BTreeMap::from([("irclickid".to_string(), "x".to_string())]),
            affiliate_id_hint: None,
            network_hint: None,
            current_url: None,
        });
        fx.attribution.insert(row).expect("seed attribution");
        fx.directory.put_engagement("sess-sync", healthy_engagement());

        let result = fx.service.evaluate_checkout_completed(
            "sess-sync",
            payload(Some("tok-sync"), None),
            at(30),
        );
        assert!(result.triggered);

        let row = fx
            .evaluations
            .fetch(EntityKind::Session, "sess-sync")
            .expect("fetch works")
            .expect("row exists");
        assert!(row.narrative.is_none(), "no runtime means no narrative");
    }
}
