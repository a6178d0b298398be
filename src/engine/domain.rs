use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier wrapper for browsing sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the session first arrived, classified from its landing signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Affiliate,
    Paid,
    Organic,
    Direct,
    Unknown,
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Affiliate => "affiliate",
            SourceKind::Paid => "paid",
            SourceKind::Organic => "organic",
            SourceKind::Direct => "direct",
            SourceKind::Unknown => "unknown",
        }
    }
}

/// UTM campaign fields lifted from a landing URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl UtmFields {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.medium.is_none()
            && self.campaign.is_none()
            && self.term.is_none()
            && self.content.is_none()
    }
}

/// Acquisition ground truth frozen at the session's first observed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstTouch {
    pub source_kind: SourceKind,
    pub utm: UtmFields,
    pub paid_click_ids: BTreeMap<String, String>,
    pub affiliate_click_ids: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affiliate_id_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landing_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ua_hash: Option<String>,
    pub first_seen: DateTime<Utc>,
}

/// Signals observed after first touch; carries only what was *new*
/// relative to the frozen first-touch click identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSeen {
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub new_paid_click_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub new_affiliate_click_ids: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affiliate_id_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
}

/// One row per session; owned exclusively by evidence capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionSession {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    pub first_touch: FirstTouch,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<LastSeen>,
}

impl AttributionSession {
    /// True when any affiliate click identifier was seen at any point.
    pub fn has_affiliate_click_evidence(&self) -> bool {
        !self.first_touch.affiliate_click_ids.is_empty()
            || self
                .last_seen
                .as_ref()
                .map(|late| !late.new_affiliate_click_ids.is_empty())
                .unwrap_or(false)
    }

    pub fn affiliate_id_hint(&self) -> Option<&str> {
        self.first_touch
            .affiliate_id_hint
            .as_deref()
            .or_else(|| self.last_seen.as_ref().and_then(|l| l.affiliate_id_hint.as_deref()))
    }

    pub fn network_hint(&self) -> Option<&str> {
        self.first_touch
            .network_hint
            .as_deref()
            .or_else(|| self.last_seen.as_ref().and_then(|l| l.network_hint.as_deref()))
    }
}

/// Closed enumeration of fraud flags; configuration referencing any
/// other name is rejected at normalization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    Denylisted,
    BotSignal,
    DatacenterAsn,
    GoogleAdsConflict,
    NoAffiliateEvidence,
    LateInjection,
    LowEngagement,
    SuspiciousReferrer,
    DuplicateIpPattern,
}

impl FlagKind {
    pub const ALL: [FlagKind; 9] = [
        FlagKind::Denylisted,
        FlagKind::BotSignal,
        FlagKind::DatacenterAsn,
        FlagKind::GoogleAdsConflict,
        FlagKind::NoAffiliateEvidence,
        FlagKind::LateInjection,
        FlagKind::LowEngagement,
        FlagKind::SuspiciousReferrer,
        FlagKind::DuplicateIpPattern,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FlagKind::Denylisted => "denylisted",
            FlagKind::BotSignal => "bot_signal",
            FlagKind::DatacenterAsn => "datacenter_asn",
            FlagKind::GoogleAdsConflict => "google_ads_conflict",
            FlagKind::NoAffiliateEvidence => "no_affiliate_evidence",
            FlagKind::LateInjection => "late_injection",
            FlagKind::LowEngagement => "low_engagement",
            FlagKind::SuspiciousReferrer => "suspicious_referrer",
            FlagKind::DuplicateIpPattern => "duplicate_ip_pattern",
        }
    }

    /// Human-readable reason used by narrative summaries.
    pub fn reason(&self) -> &'static str {
        match self {
            FlagKind::Denylisted => "affiliate or referrer is on the deny list",
            FlagKind::BotSignal => "session carried known-bot indicators",
            FlagKind::DatacenterAsn => "traffic originated from a hosting-provider network",
            FlagKind::GoogleAdsConflict => "paid and affiliate attribution claimed simultaneously",
            FlagKind::NoAffiliateEvidence => "affiliate credit claimed without click evidence",
            FlagKind::LateInjection => "affiliate click id appeared only moments before checkout",
            FlagKind::LowEngagement => "checkout completed with almost no browsing activity",
            FlagKind::SuspiciousReferrer => "referrer matches a suspicious domain pattern",
            FlagKind::DuplicateIpPattern => "multiple flagged checkouts share this network address",
        }
    }
}

impl FromStr for FlagKind {
    type Err = UnknownFlag;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        FlagKind::ALL
            .iter()
            .copied()
            .find(|flag| flag.name() == value.trim().to_ascii_lowercase())
            .ok_or_else(|| UnknownFlag(value.to_string()))
    }
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raised when configuration names a flag outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown fraud flag '{0}'")]
pub struct UnknownFlag(pub String);

/// Entity an evaluation row is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    Purchase,
    Order,
}

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(EntityKind::Session),
            "purchase" => Ok(EntityKind::Purchase),
            "order" => Ok(EntityKind::Order),
            other => Err(UnknownEntityKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity kind '{0}'")]
pub struct UnknownEntityKind(pub String);

/// Review workflow state owned by the admin surface, never by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    #[default]
    Open,
    Reviewed,
    Ignored,
    Denied,
    Approved,
}

impl FromStr for ResolutionStatus {
    type Err = UnknownResolutionStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(ResolutionStatus::Open),
            "reviewed" => Ok(ResolutionStatus::Reviewed),
            "ignored" => Ok(ResolutionStatus::Ignored),
            "denied" => Ok(ResolutionStatus::Denied),
            "approved" => Ok(ResolutionStatus::Approved),
            other => Err(UnknownResolutionStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resolution status '{0}'")]
pub struct UnknownResolutionStatus(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub status: ResolutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Identifiers tying an evaluation back to its session/checkout; writes
/// merge field-by-field so a later evaluation never erases a known value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityLinks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_hash: Option<String>,
}

impl EntityLinks {
    /// Missing-value-preserving merge: `newer` wins only where it is `Some`.
    pub fn merged_with(&self, newer: &EntityLinks) -> EntityLinks {
        EntityLinks {
            session_id: newer.session_id.clone().or_else(|| self.session_id.clone()),
            visitor_id: newer.visitor_id.clone().or_else(|| self.visitor_id.clone()),
            order_id: newer.order_id.clone().or_else(|| self.order_id.clone()),
            checkout_token: newer
                .checkout_token
                .clone()
                .or_else(|| self.checkout_token.clone()),
            ip_hash: newer.ip_hash.clone().or_else(|| self.ip_hash.clone()),
        }
    }
}

/// Stored narrative, first write wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Narrative {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Persisted scoring outcome for one (entity kind, entity id) pair.
/// `id` is the storage identity column, assigned on first insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudEvaluation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub score: u8,
    pub flags: Vec<FlagKind>,
    pub triggered: bool,
    pub evidence: crate::engine::scorer::EvidenceSnapshot,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative: Option<Narrative>,
    #[serde(default)]
    pub links: EntityLinks,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Session row from the external event store, consumed read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
    #[serde(default)]
    pub known_bot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_bot_category: Option<String>,
    #[serde(default)]
    pub utm: UtmFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Aggregated event counts for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementSummary {
    pub total_events: u32,
    pub page_views: u32,
    pub product_views: u32,
    pub add_to_carts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_event_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_started_at: Option<DateTime<Utc>>,
}

/// Normalized checkout-completion context handed to the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutContext {
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}
