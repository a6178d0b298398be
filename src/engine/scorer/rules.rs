use chrono::Duration;

use super::ScorerInput;
use crate::engine::config::ScoringConfig;
use crate::engine::domain::FlagKind;
use crate::engine::signals;

/// Evaluate the fixed, ordered rule list and return the flag set.
/// Pure: consumes only the supplied config and context.
pub(super) fn collect_flags(config: &ScoringConfig, input: &ScorerInput<'_>) -> Vec<FlagKind> {
    let mut flags = Vec::new();
    let first_touch = &input.attribution.first_touch;
    let late = input.attribution.last_seen.as_ref();

    let referrer_host = first_touch
        .referrer
        .as_deref()
        .or_else(|| input.session.and_then(|s| s.referrer.as_deref()))
        .and_then(signals::referrer_host);
    let utm_medium = first_touch
        .utm
        .medium
        .as_deref()
        .or_else(|| input.session.and_then(|s| s.utm.medium.as_deref()));

    // 1. Deny list: affiliate id hint or referrer host.
    let denied_affiliate = input
        .attribution
        .affiliate_id_hint()
        .map(|hint| config.denylist_affiliate_ids.iter().any(|d| d == hint))
        .unwrap_or(false);
    let denied_referrer = referrer_host
        .as_deref()
        .map(|host| {
            config
                .denylist_referrer_domains
                .iter()
                .any(|domain| domain_matches(host, domain))
        })
        .unwrap_or(false);
    if denied_affiliate || denied_referrer {
        flags.push(FlagKind::Denylisted);
    }

    // 2. Bot signals from the session record.
    if input
        .session
        .map(|s| s.known_bot || s.verified_bot_category.is_some())
        .unwrap_or(false)
    {
        flags.push(FlagKind::BotSignal);
    }

    // 3. Hosting-provider ASN.
    if input
        .session
        .and_then(|s| s.asn)
        .map(|asn| config.datacenter_asns.contains(&asn))
        .unwrap_or(false)
    {
        flags.push(FlagKind::DatacenterAsn);
    }

    let has_paid_click = !first_touch.paid_click_ids.is_empty()
        || late.map(|l| !l.new_paid_click_ids.is_empty()).unwrap_or(false);
    let has_affiliate_click = input.attribution.has_affiliate_click_evidence();
    let paid_medium = utm_medium.map(signals::is_paid_medium).unwrap_or(false);
    let affiliate_medium = utm_medium.map(signals::is_affiliate_medium).unwrap_or(false);

    // 4. Paid and affiliate attribution claimed at once.
    if (has_paid_click || paid_medium) && (has_affiliate_click || affiliate_medium) {
        flags.push(FlagKind::GoogleAdsConflict);
    }

    // 5. Affiliate credit claimed without any click evidence.
    let claims_affiliate = input.attribution.network_hint().is_some()
        || input.attribution.affiliate_id_hint().is_some()
        || affiliate_medium;
    if claims_affiliate && !has_affiliate_click {
        flags.push(FlagKind::NoAffiliateEvidence);
    }

    // 6. Affiliate click id appearing only in the late blob, inside the
    // configured window before checkout completion.
    if first_touch.affiliate_click_ids.is_empty() {
        if let (Some(late), Some(checkout)) = (late, input.checkout) {
            if !late.new_affiliate_click_ids.is_empty() {
                let lead = checkout.occurred_at - late.at;
                if lead >= Duration::zero()
                    && lead <= Duration::minutes(i64::from(config.late_injection_window_minutes))
                {
                    flags.push(FlagKind::LateInjection);
                }
            }
        }
    }

    // 7. Low engagement, only meaningful once a checkout exists.
    if let (Some(engagement), Some(_)) = (input.engagement, input.checkout) {
        if engagement.page_views <= config.low_engagement_max_page_views
            || engagement.total_events <= config.low_engagement_max_events
        {
            flags.push(FlagKind::LowEngagement);
        }
    }

    // 8. Suspicious referrer, unless allow-listed.
    if let Some(host) = referrer_host.as_deref() {
        let allowed = config
            .allowlist_referrer_domains
            .iter()
            .any(|domain| domain_matches(host, domain));
        let suspicious = config
            .suspicious_referrer_domains
            .iter()
            .any(|domain| domain_matches(host, domain))
            || config
                .suspicious_referrer_substrings
                .iter()
                .any(|needle| host.contains(needle.as_str()));
        if suspicious && !allowed {
            flags.push(FlagKind::SuspiciousReferrer);
        }
    }

    // 9. Caller-supplied extras, de-duplicated against the rule output.
    for extra in input.extra_flags {
        if !flags.contains(extra) {
            flags.push(*extra);
        }
    }

    flags
}

/// Exact host match or subdomain of the configured domain.
fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}
