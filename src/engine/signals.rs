//! Pure helpers for turning raw URLs and request metadata into
//! attribution signals. Nothing in this module does I/O; unparseable
//! input degrades to empty signals rather than erroring.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use super::config::ScoringConfig;
use super::domain::{SourceKind, UtmFields};

/// Bound applied to every captured string before storage.
pub const MAX_INPUT_LEN: usize = 512;
/// Bound applied to individual query-parameter values.
pub const MAX_PARAM_LEN: usize = 200;
/// Length of the digest prefix exposed in evidence snapshots.
pub const HASH_PREFIX_LEN: usize = 12;

const PURCHASE_BUCKET_SECONDS: i64 = 15 * 60;

/// Trim and length-cap a raw input string; empty becomes `None`.
pub fn bounded(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_INPUT_LEN).collect())
}

/// Query parameters of `raw`, keys lower-cased, first occurrence wins.
/// Unparseable URLs yield an empty map.
pub fn query_params(raw: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let Ok(url) = Url::parse(raw.trim()) else {
        return params;
    };
    for (key, value) in url.query_pairs() {
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() || params.contains_key(&key) {
            continue;
        }
        let value: String = value.trim().chars().take(MAX_PARAM_LEN).collect();
        params.insert(key, value);
    }
    params
}

/// Attribution material extracted from one URL's query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedSignals {
    pub paid_click_ids: BTreeMap<String, String>,
    pub affiliate_click_ids: BTreeMap<String, String>,
    pub affiliate_id_hint: Option<String>,
    pub network_hint: Option<String>,
    pub utm: UtmFields,
}

impl ExtractedSignals {
    pub fn is_empty(&self) -> bool {
        self.paid_click_ids.is_empty()
            && self.affiliate_click_ids.is_empty()
            && self.affiliate_id_hint.is_none()
            && self.utm.is_empty()
    }
}

/// Pull paid/affiliate click identifiers, affiliate-id hints, and UTM
/// fields out of a parsed query map using the configured parameter lists.
pub fn extract_signals(params: &BTreeMap<String, String>, config: &ScoringConfig) -> ExtractedSignals {
    let mut signals = ExtractedSignals::default();

    for (key, value) in params {
        if value.is_empty() {
            continue;
        }
        if config.paid_click_params.iter().any(|p| p == key) {
            signals.paid_click_ids.insert(key.clone(), value.clone());
        }
        if config.affiliate_click_params.iter().any(|p| p == key) {
            signals.affiliate_click_ids.insert(key.clone(), value.clone());
        }
        if signals.affiliate_id_hint.is_none()
            && config.affiliate_id_params.iter().any(|p| p == key)
        {
            signals.affiliate_id_hint = Some(value.to_ascii_lowercase());
        }
    }

    signals.network_hint = signals
        .affiliate_click_ids
        .keys()
        .find_map(|param| config.network_hints.get(param).cloned());

    signals.utm = UtmFields {
        source: params.get("utm_source").filter(|v| !v.is_empty()).cloned(),
        medium: params
            .get("utm_medium")
            .filter(|v| !v.is_empty())
            .map(|v| v.to_ascii_lowercase()),
        campaign: params.get("utm_campaign").filter(|v| !v.is_empty()).cloned(),
        term: params.get("utm_term").filter(|v| !v.is_empty()).cloned(),
        content: params.get("utm_content").filter(|v| !v.is_empty()).cloned(),
    };

    signals
}

/// Source classification precedence: affiliate > paid > utm-medium
/// present (organic) > direct.
pub fn classify_source(signals: &ExtractedSignals) -> SourceKind {
    if !signals.affiliate_click_ids.is_empty()
        || signals.affiliate_id_hint.is_some()
        || signals
            .utm
            .medium
            .as_deref()
            .map(is_affiliate_medium)
            .unwrap_or(false)
    {
        return SourceKind::Affiliate;
    }
    if !signals.paid_click_ids.is_empty()
        || signals
            .utm
            .medium
            .as_deref()
            .map(is_paid_medium)
            .unwrap_or(false)
    {
        return SourceKind::Paid;
    }
    if signals.utm.medium.is_some() {
        return SourceKind::Organic;
    }
    SourceKind::Direct
}

pub fn is_paid_medium(medium: &str) -> bool {
    matches!(
        medium.trim().to_ascii_lowercase().as_str(),
        "cpc" | "ppc" | "paid" | "paid_search" | "paid_social" | "sem" | "display"
    )
}

pub fn is_affiliate_medium(medium: &str) -> bool {
    matches!(
        medium.trim().to_ascii_lowercase().as_str(),
        "affiliate" | "affiliates" | "partner" | "partnership"
    )
}

/// Storage-safe rendition of a URL. Only allow-listed parameters (the
/// configured click-identifier lists plus `utm_*`) survive, each value
/// length-capped; when none apply the URL truncates to origin+path.
/// Fragments are always dropped.
pub fn sanitize_url(raw: &str, config: &ScoringConfig) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    url.set_fragment(None);

    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(key, value)| {
            let key = key.trim().to_ascii_lowercase();
            let allowed = key.starts_with("utm_")
                || config.paid_click_params.iter().any(|p| *p == key)
                || config.affiliate_click_params.iter().any(|p| *p == key)
                || config.affiliate_id_params.iter().any(|p| *p == key);
            if !allowed || value.is_empty() {
                return None;
            }
            let value: String = value.chars().take(MAX_PARAM_LEN).collect();
            Some((key, value))
        })
        .collect();

    if retained.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &retained {
            serializer.append_pair(key, value);
        }
        url.set_query(Some(&serializer.finish()));
    }

    Some(url.to_string().chars().take(MAX_INPUT_LEN).collect())
}

/// Storage-safe rendition of a referrer. Referrers arrive both as full
/// URLs and as scheme-less values like `deals.example/p?x=1`; either way
/// query and fragment material never reaches storage.
pub fn sanitize_referrer(raw: &str, config: &ScoringConfig) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(sanitized) = sanitize_url(trimmed, config) {
        return Some(sanitized);
    }
    let cut = trimmed.find(['?', '#']).unwrap_or(trimmed.len());
    let bare: String = trimmed[..cut].chars().take(MAX_INPUT_LEN).collect();
    if bare.is_empty() {
        None
    } else {
        Some(bare)
    }
}

/// Host of a URL or bare domain string, lower-cased, `www.` stripped.
pub fn referrer_host(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let host = match Url::parse(trimmed) {
        Ok(url) => url.host_str()?.to_string(),
        // Bare domains arrive without a scheme from some clients.
        Err(_) => trimmed
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Salted keyed digest of a network identifier. Raw values never
/// leave this function's callers; only the hex digest is stored.
pub fn salted_hash(salt: &str, value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"|");
    hasher.update(value.as_bytes());
    Some(hex_digest(hasher))
}

/// Short display prefix of a digest for evidence snapshots.
pub fn hash_prefix(digest: &str) -> String {
    digest.chars().take(HASH_PREFIX_LEN).collect()
}

/// Stable purchase entity id used when a checkout carries neither a
/// checkout token nor an order id. Keyed on (currency, total, 15-minute
/// bucket, session id); identical carts from the same session in the
/// same bucket deliberately collapse to one row.
pub fn purchase_fallback_key(
    currency: Option<&str>,
    total: Option<i64>,
    occurred_at: DateTime<Utc>,
    session_id: &str,
) -> String {
    let bucket = occurred_at.timestamp().div_euclid(PURCHASE_BUCKET_SECONDS);
    let mut hasher = Sha256::new();
    hasher.update(currency.unwrap_or("").to_ascii_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(total.unwrap_or(0).to_le_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_le_bytes());
    hasher.update(b"|");
    hasher.update(session_id.as_bytes());
    format!("fb-{}", hash_prefix(&hex_digest(hasher)))
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
