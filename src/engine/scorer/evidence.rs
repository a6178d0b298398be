use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ScorerInput;
use crate::engine::signals;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Privacy-safe structured record justifying a score, suitable for
/// human review. Network identifiers appear only as short digest
/// prefixes; raw IPs and user agents never enter this structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSnapshot {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landing_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub late_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub paid_click_ids: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub affiliate_click_ids: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub late_paid_click_ids: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub late_affiliate_click_ids: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affiliate_id_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(default)]
    pub timing: TimingDeltas,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_hash_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ua_hash_prefix: Option<String>,
}

/// Engagement timing deltas in seconds; `None` when the ordering is
/// undeterminable, never negative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingDeltas {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_to_checkout_start_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_start_to_complete_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_to_complete_secs: Option<i64>,
}

pub(super) fn build_snapshot(input: &ScorerInput<'_>) -> EvidenceSnapshot {
    let first_touch = &input.attribution.first_touch;
    let late = input.attribution.last_seen.as_ref();

    let session_start = first_touch
        .first_seen
        .min(input.engagement.and_then(|e| e.first_event_at).unwrap_or(first_touch.first_seen));
    let checkout_started = input.engagement.and_then(|e| e.checkout_started_at);
    let completed = input.checkout.map(|c| c.occurred_at);

    let timing = TimingDeltas {
        session_to_checkout_start_secs: checkout_started
            .map(|at| (at - session_start).num_seconds())
            .filter(|delta| *delta >= 0),
        checkout_start_to_complete_secs: match (checkout_started, completed) {
            (Some(started), Some(done)) => {
                Some((done - started).num_seconds()).filter(|delta| *delta >= 0)
            }
            _ => None,
        },
        session_to_complete_secs: completed
            .map(|at| (at - session_start).num_seconds())
            .filter(|delta| *delta >= 0),
    };

    EvidenceSnapshot {
        version: SNAPSHOT_VERSION,
        session_id: Some(input.attribution.session_id.0.clone()),
        visitor_id: input.attribution.visitor_id.clone(),
        checkout_token: input.checkout.and_then(|c| c.checkout_token.clone()),
        order_id: input.checkout.and_then(|c| c.order_id.clone()),
        source_kind: Some(first_touch.source_kind.label().to_string()),
        landing_url: first_touch.landing_url.clone(),
        referrer: first_touch.referrer.clone(),
        late_url: late.and_then(|l| l.current_url.clone()),
        paid_click_ids: first_touch.paid_click_ids.clone(),
        affiliate_click_ids: first_touch.affiliate_click_ids.clone(),
        late_paid_click_ids: late
            .map(|l| l.new_paid_click_ids.clone())
            .unwrap_or_default(),
        late_affiliate_click_ids: late
            .map(|l| l.new_affiliate_click_ids.clone())
            .unwrap_or_default(),
        affiliate_id_hint: input.attribution.affiliate_id_hint().map(str::to_string),
        network_hint: input.attribution.network_hint().map(str::to_string),
        utm_medium: first_touch.utm.medium.clone(),
        timing,
        ip_hash_prefix: first_touch.ip_hash.as_deref().map(signals::hash_prefix),
        ua_hash_prefix: first_touch.ua_hash.as_deref().map(signals::hash_prefix),
    }
}
