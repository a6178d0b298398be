use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::domain::{
    AttributionSession, EngagementSummary, EntityKind, FraudEvaluation, LastSeen, Narrative,
    Resolution, SessionId, SessionRecord,
};

/// Error enumeration for storage failures. The evaluation and capture
/// paths downgrade these to fail-open outcomes; only admin paths
/// surface them.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Attribution rows are owned exclusively by evidence capture.
pub trait AttributionRepository: Send + Sync {
    fn fetch(&self, session_id: &SessionId) -> Result<Option<AttributionSession>, RepositoryError>;
    fn insert(&self, session: AttributionSession) -> Result<(), RepositoryError>;
    fn update_last_seen(
        &self,
        session_id: &SessionId,
        last_seen: LastSeen,
    ) -> Result<(), RepositoryError>;
}

/// Read-only view of the external event store: session rows, the
/// aggregated per-session event summary, and the checkout-completion
/// history the backfill job scans.
pub trait SessionDirectory: Send + Sync {
    fn fetch(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, RepositoryError>;
    fn engagement(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<EngagementSummary>, RepositoryError>;
    /// Checkout completions observed at or after `cutoff`, oldest first.
    fn checkout_completions_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CheckoutCompletion>, RepositoryError>;
}

/// Historical checkout-completed evidence row used by the backfill job.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutCompletion {
    pub session_id: SessionId,
    pub occurred_at: DateTime<Utc>,
    pub checkout_token: Option<String>,
    pub order_id: Option<String>,
    pub currency: Option<String>,
    pub total: Option<i64>,
}

/// Evaluation rows; score/flags/evidence are owned by the evaluation
/// service, resolution fields by the admin surface.
pub trait EvaluationRepository: Send + Sync {
    fn fetch(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<Option<FraudEvaluation>, RepositoryError>;
    fn fetch_batch(
        &self,
        kind: EntityKind,
        entity_ids: &[String],
    ) -> Result<Vec<FraudEvaluation>, RepositoryError>;
    /// Upsert preserving resolution state and known links (the merge is
    /// prepared by the caller; implementations replace the row).
    fn upsert(&self, evaluation: FraudEvaluation) -> Result<(), RepositoryError>;
    /// Indexed count of triggered session-kind evaluations sharing an
    /// IP hash since `since`. Scoped to session rows so one checkout's
    /// purchase/order copies are not counted twice.
    fn count_triggered_by_ip_hash(
        &self,
        ip_hash: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, RepositoryError>;
    /// First-write-wins narrative attach; returns false when a
    /// narrative was already present.
    fn set_narrative_if_absent(
        &self,
        kind: EntityKind,
        entity_id: &str,
        narrative: Narrative,
    ) -> Result<bool, RepositoryError>;
    fn update_resolution(
        &self,
        target: &ResolutionTarget,
        resolution: Resolution,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
    /// Cheap existence probe backing `tables_ok`.
    fn probe(&self) -> Result<(), RepositoryError>;
}

/// Address for a resolution update: either the numeric identity column
/// or the (entity kind, entity id) unique pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionTarget {
    ById(u64),
    ByEntity(EntityKind, String),
}

/// Key-value store backing the scoring config blob and small job
/// markers, keyed by a config-key string.
pub trait ConfigRepository: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, RepositoryError>;
    fn store(&self, key: &str, value: serde_json::Value) -> Result<(), RepositoryError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations, used by tests, the demo server, and the
// backfill job's unit coverage.

#[derive(Default)]
pub struct InMemoryAttributionRepository {
    rows: Mutex<HashMap<String, AttributionSession>>,
}

impl AttributionRepository for InMemoryAttributionRepository {
    fn fetch(&self, session_id: &SessionId) -> Result<Option<AttributionSession>, RepositoryError> {
        let rows = self.rows.lock().map_err(poisoned)?;
        Ok(rows.get(&session_id.0).cloned())
    }

    fn insert(&self, session: AttributionSession) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().map_err(poisoned)?;
        if rows.contains_key(&session.session_id.0) {
            return Err(RepositoryError::Conflict);
        }
        rows.insert(session.session_id.0.clone(), session);
        Ok(())
    }

    fn update_last_seen(
        &self,
        session_id: &SessionId,
        last_seen: LastSeen,
    ) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().map_err(poisoned)?;
        let row = rows.get_mut(&session_id.0).ok_or(RepositoryError::NotFound)?;
        row.last_seen = Some(last_seen);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySessionDirectory {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    engagement: Mutex<HashMap<String, EngagementSummary>>,
    completions: Mutex<Vec<CheckoutCompletion>>,
}

impl InMemorySessionDirectory {
    pub fn put_session(&self, record: SessionRecord) {
        let mut sessions = self.sessions.lock().expect("directory lock");
        sessions.insert(record.session_id.clone(), record);
    }

    pub fn put_engagement(&self, session_id: &str, summary: EngagementSummary) {
        let mut engagement = self.engagement.lock().expect("directory lock");
        engagement.insert(session_id.to_string(), summary);
    }

    pub fn push_completion(&self, completion: CheckoutCompletion) {
        let mut completions = self.completions.lock().expect("directory lock");
        completions.push(completion);
    }
}

impl SessionDirectory for InMemorySessionDirectory {
    fn fetch(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, RepositoryError> {
        let sessions = self.sessions.lock().map_err(poisoned)?;
        Ok(sessions.get(&session_id.0).cloned())
    }

    fn engagement(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<EngagementSummary>, RepositoryError> {
        let engagement = self.engagement.lock().map_err(poisoned)?;
        Ok(engagement.get(&session_id.0).cloned())
    }

    fn checkout_completions_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CheckoutCompletion>, RepositoryError> {
        let completions = self.completions.lock().map_err(poisoned)?;
        let mut matching: Vec<CheckoutCompletion> = completions
            .iter()
            .filter(|completion| completion.occurred_at >= cutoff)
            .cloned()
            .collect();
        matching.sort_by_key(|completion| completion.occurred_at);
        Ok(matching)
    }
}

#[derive(Default)]
pub struct InMemoryEvaluationRepository {
    rows: Mutex<HashMap<(EntityKind, String), FraudEvaluation>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl EvaluationRepository for InMemoryEvaluationRepository {
    fn fetch(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> Result<Option<FraudEvaluation>, RepositoryError> {
        let rows = self.rows.lock().map_err(poisoned)?;
        Ok(rows.get(&(kind, entity_id.to_string())).cloned())
    }

    fn fetch_batch(
        &self,
        kind: EntityKind,
        entity_ids: &[String],
    ) -> Result<Vec<FraudEvaluation>, RepositoryError> {
        let rows = self.rows.lock().map_err(poisoned)?;
        Ok(entity_ids
            .iter()
            .filter_map(|id| rows.get(&(kind, id.clone())).cloned())
            .collect())
    }

    fn upsert(&self, mut evaluation: FraudEvaluation) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().map_err(poisoned)?;
        let key = (evaluation.entity_kind, evaluation.entity_id.clone());
        evaluation.id = match rows.get(&key).and_then(|existing| existing.id) {
            Some(id) => Some(id),
            None => Some(
                self.next_id
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    + 1,
            ),
        };
        rows.insert(key, evaluation);
        Ok(())
    }

    fn count_triggered_by_ip_hash(
        &self,
        ip_hash: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, RepositoryError> {
        let rows = self.rows.lock().map_err(poisoned)?;
        Ok(rows
            .values()
            .filter(|row| {
                row.entity_kind == EntityKind::Session
                    && row.triggered
                    && row.updated_at >= since
                    && row.links.ip_hash.as_deref() == Some(ip_hash)
            })
            .count() as u32)
    }

    fn set_narrative_if_absent(
        &self,
        kind: EntityKind,
        entity_id: &str,
        narrative: Narrative,
    ) -> Result<bool, RepositoryError> {
        let mut rows = self.rows.lock().map_err(poisoned)?;
        let row = rows
            .get_mut(&(kind, entity_id.to_string()))
            .ok_or(RepositoryError::NotFound)?;
        if row.narrative.is_some() {
            return Ok(false);
        }
        row.narrative = Some(narrative);
        Ok(true)
    }

    fn update_resolution(
        &self,
        target: &ResolutionTarget,
        resolution: Resolution,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().map_err(poisoned)?;
        let row = match target {
            ResolutionTarget::ById(id) => rows
                .values_mut()
                .find(|row| row.id == Some(*id))
                .ok_or(RepositoryError::NotFound)?,
            ResolutionTarget::ByEntity(kind, entity_id) => rows
                .get_mut(&(*kind, entity_id.clone()))
                .ok_or(RepositoryError::NotFound)?,
        };
        row.resolution = resolution;
        row.updated_at = updated_at;
        Ok(())
    }

    fn probe(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryConfigRepository {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl ConfigRepository for InMemoryConfigRepository {
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        let values = self.values.lock().map_err(poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn store(&self, key: &str, value: serde_json::Value) -> Result<(), RepositoryError> {
        let mut values = self.values.lock().map_err(poisoned)?;
        values.insert(key.to_string(), value);
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> RepositoryError {
    RepositoryError::Unavailable("lock poisoned".to_string())
}
