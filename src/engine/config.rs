use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::domain::FlagKind;

pub const CONFIG_VERSION: u32 = 1;

const MAX_LIST_ENTRIES: usize = 64;
const MAX_ENTRY_LEN: usize = 64;
const MAX_WINDOW_MINUTES: u32 = 7 * 24 * 60;

/// Narrative augmentation dials; the provider itself is injected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeSettings {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for NarrativeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            model: None,
        }
    }
}

/// Versioned scoring configuration. A value of this type is always
/// complete and internally consistent: every constructor path runs
/// through [`ScoringConfig::normalized`], and anything structurally
/// invalid falls back to [`ScoringConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub version: u32,
    pub threshold: u8,
    pub weights: BTreeMap<FlagKind, u8>,
    pub hard_triggers: BTreeSet<FlagKind>,
    pub paid_click_params: Vec<String>,
    pub affiliate_click_params: Vec<String>,
    pub affiliate_id_params: Vec<String>,
    pub network_hints: BTreeMap<String, String>,
    pub suspicious_referrer_domains: Vec<String>,
    pub suspicious_referrer_substrings: Vec<String>,
    pub allowlist_referrer_domains: Vec<String>,
    pub denylist_referrer_domains: Vec<String>,
    pub denylist_affiliate_ids: Vec<String>,
    pub datacenter_asns: BTreeSet<u32>,
    pub duplicate_ip_window_minutes: u32,
    pub duplicate_ip_min_count: u32,
    pub low_engagement_max_page_views: u32,
    pub low_engagement_max_events: u32,
    pub late_injection_window_minutes: u32,
    pub narrative: NarrativeSettings,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(FlagKind::Denylisted, 100);
        weights.insert(FlagKind::BotSignal, 35);
        weights.insert(FlagKind::DatacenterAsn, 25);
        weights.insert(FlagKind::GoogleAdsConflict, 40);
        weights.insert(FlagKind::NoAffiliateEvidence, 45);
        weights.insert(FlagKind::LateInjection, 50);
        weights.insert(FlagKind::LowEngagement, 30);
        weights.insert(FlagKind::SuspiciousReferrer, 25);
        weights.insert(FlagKind::DuplicateIpPattern, 35);

        let mut hard_triggers = BTreeSet::new();
        hard_triggers.insert(FlagKind::Denylisted);

        let mut network_hints = BTreeMap::new();
        network_hints.insert("irclickid".to_string(), "impact".to_string());
        network_hints.insert("clickid".to_string(), "generic".to_string());
        network_hints.insert("sscid".to_string(), "shareasale".to_string());
        network_hints.insert("cjevent".to_string(), "cj".to_string());
        network_hints.insert("awc".to_string(), "awin".to_string());
        network_hints.insert("ranmid".to_string(), "rakuten".to_string());

        Self {
            version: CONFIG_VERSION,
            threshold: 60,
            weights,
            hard_triggers,
            paid_click_params: vec![
                "gclid".to_string(),
                "gbraid".to_string(),
                "wbraid".to_string(),
                "fbclid".to_string(),
                "msclkid".to_string(),
                "ttclid".to_string(),
            ],
            affiliate_click_params: vec![
                "irclickid".to_string(),
                "clickid".to_string(),
                "sscid".to_string(),
                "cjevent".to_string(),
                "awc".to_string(),
                "ranmid".to_string(),
            ],
            affiliate_id_params: vec![
                "aff_id".to_string(),
                "affiliate_id".to_string(),
                "aff".to_string(),
                "partner".to_string(),
            ],
            network_hints,
            suspicious_referrer_domains: vec![
                "coupon-codes.example".to_string(),
            ],
            suspicious_referrer_substrings: vec![
                "coupon".to_string(),
                "cashback".to_string(),
                "promo-code".to_string(),
            ],
            allowlist_referrer_domains: Vec::new(),
            denylist_referrer_domains: Vec::new(),
            denylist_affiliate_ids: Vec::new(),
            datacenter_asns: BTreeSet::new(),
            duplicate_ip_window_minutes: 24 * 60,
            duplicate_ip_min_count: 3,
            low_engagement_max_page_views: 1,
            low_engagement_max_events: 2,
            late_injection_window_minutes: 10,
            narrative: NarrativeSettings::default(),
        }
    }
}

/// Rejections surfaced to admin config writes; reads never see these,
/// they fall back to defaults instead.
#[derive(Debug, thiserror::Error)]
pub enum ConfigRejection {
    #[error("config version {found} does not match supported version {expected}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("config payload is not structurally valid: {0}")]
    Malformed(String),
    #[error(transparent)]
    UnknownFlag(#[from] super::domain::UnknownFlag),
}

impl ScoringConfig {
    /// Strict parse for admin writes: structural problems, a missing or
    /// mismatched version tag, and unknown flag names are all rejected.
    pub fn from_value_strict(value: serde_json::Value) -> Result<Self, ConfigRejection> {
        if let Some(map) = value.as_object() {
            if let Some(weights) = map.get("weights").and_then(|w| w.as_object()) {
                for name in weights.keys() {
                    name.parse::<FlagKind>()?;
                }
            }
            if let Some(triggers) = map.get("hard_triggers").and_then(|t| t.as_array()) {
                for name in triggers {
                    if let Some(name) = name.as_str() {
                        name.parse::<FlagKind>()?;
                    }
                }
            }
            match map.get("version").and_then(|v| v.as_u64()) {
                Some(found) if found == u64::from(CONFIG_VERSION) => {}
                Some(found) => {
                    return Err(ConfigRejection::VersionMismatch {
                        expected: CONFIG_VERSION,
                        found: found.min(u64::from(u32::MAX)) as u32,
                    })
                }
                None => {
                    return Err(ConfigRejection::VersionMismatch {
                        expected: CONFIG_VERSION,
                        found: 0,
                    })
                }
            }
        }

        let parsed: ScoringConfig = serde_json::from_value(value)
            .map_err(|err| ConfigRejection::Malformed(err.to_string()))?;
        Ok(parsed.normalized())
    }

    /// Lenient parse for the read path: anything invalid or unversioned
    /// becomes the complete default configuration.
    pub fn from_value_or_default(value: serde_json::Value) -> Self {
        match Self::from_value_strict(value) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "persisted fraud config invalid; using defaults");
                Self::default()
            }
        }
    }

    /// The single normalization boundary. Clamps all numerics, bounds
    /// every string list, and lower-cases lookup material so matching
    /// is case-insensitive everywhere downstream.
    pub fn normalized(mut self) -> Self {
        self.version = CONFIG_VERSION;
        self.threshold = self.threshold.min(100);
        for weight in self.weights.values_mut() {
            *weight = (*weight).min(100);
        }
        // Flags missing a weight score zero; make that explicit.
        for flag in FlagKind::ALL {
            self.weights.entry(flag).or_insert(0);
        }

        for list in [
            &mut self.paid_click_params,
            &mut self.affiliate_click_params,
            &mut self.affiliate_id_params,
            &mut self.suspicious_referrer_domains,
            &mut self.suspicious_referrer_substrings,
            &mut self.allowlist_referrer_domains,
            &mut self.denylist_referrer_domains,
            &mut self.denylist_affiliate_ids,
        ] {
            normalize_list(list);
        }

        self.network_hints = self
            .network_hints
            .iter()
            .take(MAX_LIST_ENTRIES)
            .filter(|(param, network)| !param.trim().is_empty() && !network.trim().is_empty())
            .map(|(param, network)| {
                (
                    bounded_lower(param),
                    bounded_lower(network),
                )
            })
            .collect();

        self.duplicate_ip_window_minutes =
            self.duplicate_ip_window_minutes.clamp(1, MAX_WINDOW_MINUTES);
        self.duplicate_ip_min_count = self.duplicate_ip_min_count.clamp(1, 1000);
        self.low_engagement_max_page_views = self.low_engagement_max_page_views.min(100);
        self.low_engagement_max_events = self.low_engagement_max_events.min(1000);
        self.late_injection_window_minutes =
            self.late_injection_window_minutes.clamp(1, MAX_WINDOW_MINUTES);

        if let Some(model) = &self.narrative.model {
            if model.trim().is_empty() {
                self.narrative.model = None;
            }
        }

        self
    }

    pub fn weight(&self, flag: FlagKind) -> u8 {
        self.weights.get(&flag).copied().unwrap_or(0)
    }

    pub fn is_hard_trigger(&self, flag: FlagKind) -> bool {
        self.hard_triggers.contains(&flag)
    }
}

fn bounded_lower(value: &str) -> String {
    let trimmed = value.trim().to_ascii_lowercase();
    trimmed.chars().take(MAX_ENTRY_LEN).collect()
}

fn normalize_list(list: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for raw in list.iter() {
        let entry = bounded_lower(raw);
        if entry.is_empty() || !seen.insert(entry.clone()) {
            continue;
        }
        out.push(entry);
        if out.len() >= MAX_LIST_ENTRIES {
            break;
        }
    }
    *list = out;
}
