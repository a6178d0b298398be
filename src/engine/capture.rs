use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::config::ScoringConfig;
use super::config_store::ConfigStore;
use super::domain::{AttributionSession, FirstTouch, LastSeen, SessionId};
use super::repository::{AttributionRepository, ConfigRepository, RepositoryError};
use super::signals;

/// Minimum spacing between last-seen updates for one session.
const UPDATE_INTERVAL_SECONDS: i64 = 60;

/// Raw acquisition evidence delivered by the ingest pipeline for one
/// request; nothing here is fetched by the engine itself.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct CaptureRequest {
    pub session_id: String,
    pub visitor_id: Option<String>,
    /// Entry URL from the ingest payload; first-touch signals come from
    /// here.
    pub entry_url: Option<String>,
    pub referrer: Option<String>,
    /// URL of the request currently being served; late signals come
    /// from here.
    pub current_url: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// What a capture call did. Persistence failures downgrade to
/// `Skipped`; capture never raises past its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Inserted,
    Updated,
    RateLimited,
    Skipped,
}

/// Session-level acquisition-evidence recorder with immutable
/// first-touch semantics.
pub struct EvidenceCapture<R, C> {
    repository: Arc<R>,
    config_store: Arc<ConfigStore<C>>,
    hash_salt: String,
}

impl<R, C> EvidenceCapture<R, C>
where
    R: AttributionRepository,
    C: ConfigRepository,
{
    pub fn new(repository: Arc<R>, config_store: Arc<ConfigStore<C>>, hash_salt: String) -> Self {
        Self {
            repository,
            config_store,
            hash_salt,
        }
    }

    pub fn capture(&self, request: CaptureRequest, now: DateTime<Utc>) -> CaptureOutcome {
        let Some(session_id) = signals::bounded(&request.session_id) else {
            return CaptureOutcome::Skipped;
        };
        let session_id = SessionId(session_id);
        let config = self.config_store.read(true);

        let existing = match self.repository.fetch(&session_id) {
            Ok(existing) => existing,
            Err(err) => {
                warn!(session = %session_id, error = %err, "attribution fetch failed; skipping capture");
                return CaptureOutcome::Skipped;
            }
        };

        match existing {
            None => self.insert_first_touch(session_id, &request, &config, now),
            Some(session) => self.record_late_signals(session, &request, &config, now),
        }
    }

    fn insert_first_touch(
        &self,
        session_id: SessionId,
        request: &CaptureRequest,
        config: &ScoringConfig,
        now: DateTime<Utc>,
    ) -> CaptureOutcome {
        let entry_url = request.entry_url.as_deref().and_then(signals::bounded);
        let current_url = request.current_url.as_deref().and_then(signals::bounded);
        // First touch draws from the entry URL, falling back to the
        // current request when the payload carried none.
        let first_url = entry_url.clone().or_else(|| current_url.clone());

        let params = first_url
            .as_deref()
            .map(signals::query_params)
            .unwrap_or_default();
        let extracted = signals::extract_signals(&params, config);
        let source_kind = signals::classify_source(&extracted);

        let session = AttributionSession {
            session_id: session_id.clone(),
            visitor_id: request.visitor_id.as_deref().and_then(signals::bounded),
            first_touch: FirstTouch {
                source_kind,
                utm: extracted.utm,
                paid_click_ids: extracted.paid_click_ids,
                affiliate_click_ids: extracted.affiliate_click_ids,
                affiliate_id_hint: extracted.affiliate_id_hint,
                network_hint: extracted.network_hint,
                landing_url: first_url.as_deref().and_then(|u| signals::sanitize_url(u, config)),
                referrer: request
                    .referrer
                    .as_deref()
                    .and_then(signals::bounded)
                    .and_then(|r| signals::sanitize_referrer(&r, config)),
                ip_hash: request
                    .client_ip
                    .as_deref()
                    .and_then(|ip| signals::salted_hash(&self.hash_salt, ip)),
                ua_hash: request
                    .user_agent
                    .as_deref()
                    .and_then(|ua| signals::salted_hash(&self.hash_salt, ua)),
                first_seen: now,
            },
            last_seen: None,
        };

        match self.repository.insert(session) {
            Ok(()) => CaptureOutcome::Inserted,
            // A concurrent capture won the insert race; its row stands.
            Err(RepositoryError::Conflict) => CaptureOutcome::Skipped,
            Err(err) => {
                warn!(session = %session_id, error = %err, "attribution insert failed; skipping capture");
                CaptureOutcome::Skipped
            }
        }
    }

    fn record_late_signals(
        &self,
        session: AttributionSession,
        request: &CaptureRequest,
        config: &ScoringConfig,
        now: DateTime<Utc>,
    ) -> CaptureOutcome {
        let last_update = session
            .last_seen
            .as_ref()
            .map(|late| late.at)
            .unwrap_or(session.first_touch.first_seen);
        if now - last_update < Duration::seconds(UPDATE_INTERVAL_SECONDS) {
            return CaptureOutcome::RateLimited;
        }

        let Some(current_url) = request.current_url.as_deref().and_then(signals::bounded) else {
            return CaptureOutcome::Skipped;
        };
        let params = signals::query_params(&current_url);
        let extracted = signals::extract_signals(&params, config);

        // Only click identifiers absent from first touch count as new.
        let new_paid = diff_click_ids(&extracted.paid_click_ids, &session.first_touch.paid_click_ids);
        let new_affiliate = diff_click_ids(
            &extracted.affiliate_click_ids,
            &session.first_touch.affiliate_click_ids,
        );
        if new_paid.is_empty() && new_affiliate.is_empty() {
            return CaptureOutcome::Skipped;
        }

        let last_seen = LastSeen {
            at: now,
            new_paid_click_ids: new_paid,
            new_affiliate_click_ids: new_affiliate,
            affiliate_id_hint: extracted
                .affiliate_id_hint
                .filter(|hint| session.first_touch.affiliate_id_hint.as_deref() != Some(hint)),
            network_hint: extracted
                .network_hint
                .filter(|hint| session.first_touch.network_hint.as_deref() != Some(hint)),
            current_url: signals::sanitize_url(&current_url, config),
        };

        match self.repository.update_last_seen(&session.session_id, last_seen) {
            Ok(()) => {
                debug!(session = %session.session_id, "recorded late attribution signals");
                CaptureOutcome::Updated
            }
            Err(err) => {
                warn!(session = %session.session_id, error = %err, "last-seen update failed; skipping");
                CaptureOutcome::Skipped
            }
        }
    }
}

fn diff_click_ids(
    current: &BTreeMap<String, String>,
    first_touch: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    current
        .iter()
        .filter(|(key, _)| !first_touch.contains_key(*key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
