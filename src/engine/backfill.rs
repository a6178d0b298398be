use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::domain::EntityKind;
use super::repository::{
    AttributionRepository, CheckoutCompletion, ConfigRepository, EvaluationRepository,
    SessionDirectory,
};
use super::service::{CheckoutPayload, EvaluationService};
use super::signals;

/// Key of the persisted completion marker in the config kv table.
pub const BACKFILL_DONE_KEY: &str = "fraud_backfill_done";

#[derive(Debug, Clone)]
pub struct BackfillSettings {
    pub lookback_days: u32,
    pub chunk_size: usize,
    pub max_records_per_run: usize,
    pub pause_between_chunks: Duration,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            chunk_size: 100,
            max_records_per_run: 1000,
            pause_between_chunks: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub done: bool,
    pub processed: u32,
    pub created: u32,
    pub skipped: u32,
}

/// Idempotent catch-up pass producing evaluations for historical
/// checkout completions that lack one. Insert-only; per-record
/// failures are skipped, never fatal.
pub struct BackfillJob<A, S, E, C> {
    directory: Arc<S>,
    evaluations: Arc<E>,
    markers: Arc<C>,
    service: Arc<EvaluationService<A, S, E, C>>,
    settings: BackfillSettings,
}

impl<A, S, E, C> BackfillJob<A, S, E, C>
where
    A: AttributionRepository,
    S: SessionDirectory,
    E: EvaluationRepository + 'static,
    C: ConfigRepository,
{
    pub fn new(
        directory: Arc<S>,
        evaluations: Arc<E>,
        markers: Arc<C>,
        service: Arc<EvaluationService<A, S, E, C>>,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            directory,
            evaluations,
            markers,
            service,
            settings,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> BackfillReport {
        if self.completed() {
            return BackfillReport {
                done: true,
                ..BackfillReport::default()
            };
        }

        let cutoff = now - TimeDelta::days(i64::from(self.settings.lookback_days));
        let missing = match self.missing_since(cutoff) {
            Ok(missing) => missing,
            Err(report) => return report,
        };

        if missing.is_empty() {
            self.mark_complete();
            return BackfillReport {
                done: true,
                ..BackfillReport::default()
            };
        }

        let mut report = BackfillReport::default();
        'outer: for chunk in missing.chunks(self.settings.chunk_size) {
            for completion in chunk {
                if report.processed as usize >= self.settings.max_records_per_run {
                    break 'outer;
                }
                report.processed += 1;

                let payload = CheckoutPayload {
                    occurred_at: Some(completion.occurred_at),
                    checkout_token: completion.checkout_token.clone(),
                    order_id: completion.order_id.clone(),
                    currency: completion.currency.clone(),
                    total: completion.total,
                };
                let result = self.service.evaluate_checkout_completed(
                    &completion.session_id.0,
                    payload,
                    completion.occurred_at,
                );
                if result.ok {
                    report.created += 1;
                } else {
                    warn!(session = %completion.session_id, "backfill record skipped");
                    report.skipped += 1;
                }
            }
            tokio::time::sleep(self.settings.pause_between_chunks).await;
        }

        // Complete only once nothing is missing anymore.
        match self.missing_since(cutoff) {
            Ok(remaining) if remaining.is_empty() => {
                self.mark_complete();
                report.done = true;
            }
            _ => {}
        }

        info!(
            processed = report.processed,
            created = report.created,
            skipped = report.skipped,
            done = report.done,
            "fraud evaluation backfill pass finished"
        );
        report
    }

    /// Anti-join: completions in the lookback window whose purchase
    /// entity has no evaluation row yet.
    fn missing_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CheckoutCompletion>, BackfillReport> {
        let completions = match self.directory.checkout_completions_since(cutoff) {
            Ok(completions) => completions,
            Err(err) => {
                warn!(error = %err, "backfill scan failed; aborting pass");
                return Err(BackfillReport::default());
            }
        };

        Ok(completions
            .into_iter()
            .filter(|completion| {
                let purchase_id = purchase_entity_id(completion);
                match self.evaluations.fetch(EntityKind::Purchase, &purchase_id) {
                    Ok(existing) => existing.is_none(),
                    // Unreadable rows are left alone rather than re-created.
                    Err(_) => false,
                }
            })
            .collect())
    }

    fn completed(&self) -> bool {
        matches!(
            self.markers.load(BACKFILL_DONE_KEY),
            Ok(Some(value)) if value.get("done").and_then(|d| d.as_bool()) == Some(true)
        )
    }

    fn mark_complete(&self) {
        if let Err(err) = self.markers.store(BACKFILL_DONE_KEY, json!({ "done": true })) {
            warn!(error = %err, "could not persist backfill completion marker");
        }
    }
}

/// Same resolution order the evaluation service uses: checkout token,
/// then order id, then the stable fallback key.
fn purchase_entity_id(completion: &CheckoutCompletion) -> String {
    completion
        .checkout_token
        .clone()
        .or_else(|| completion.order_id.clone())
        .unwrap_or_else(|| {
            signals::purchase_fallback_key(
                completion.currency.as_deref(),
                completion.total,
                completion.occurred_at,
                &completion.session_id.0,
            )
        })
}
