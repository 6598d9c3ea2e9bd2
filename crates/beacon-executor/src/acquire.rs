// SPDX-License-Identifier: MIT OR Apache-2.0

//! Region acquisition: offer classification and the strict / relax windows.
//!
//! Offers are classified by how confidently their metadata places them in a
//! region:
//!
//! - `P0` — explicit `beacon.region` exact match
//! - `P1` — generic `region` / `geo.region` match
//! - `P2` — region tag match
//! - `P3` — no placement metadata; only a preflight probe can place it
//!
//! The strict window accepts the best P0/P1/P2 offer. The relax window runs
//! probe-verified acquisition over P3 offers: fetch the provider's egress
//! IP, resolve its GeoIP bucket, and accept only on an exact bucket match.

use crate::probe::GeoIpResolver;
use beacon_provider::{Acquisition, ProviderClient, ProviderError, ProviderOffer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Classification of one offer against one target region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OfferClass {
    /// Explicit `beacon.region` exact match.
    P0,
    /// Generic `region` / `geo.region` match.
    P1,
    /// Region tag match.
    P2,
    /// No region metadata; needs a probe.
    P3,
}

/// Per-region candidate filters applied at discovery.
#[derive(Debug, Clone)]
pub struct RegionFilter {
    /// Minimum acceptable provider score.
    pub min_score: f64,
    /// Maximum acceptable price per hour.
    pub max_price: f64,
    /// Provider whitelist; empty admits all.
    pub whitelist: Vec<String>,
    /// Provider blacklist.
    pub blacklist: Vec<String>,
}

impl Default for RegionFilter {
    fn default() -> Self {
        Self {
            min_score: 0.0,
            max_price: f64::MAX,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

impl RegionFilter {
    /// Whether an offer passes this filter.
    pub fn admits(&self, offer: &ProviderOffer) -> bool {
        if offer.score < self.min_score || offer.price_per_hour > self.max_price {
            return false;
        }
        if !self.whitelist.is_empty() && !self.whitelist.contains(&offer.provider_id) {
            return false;
        }
        !self.blacklist.contains(&offer.provider_id)
    }
}

fn property_str<'a>(offer: &'a ProviderOffer, key: &str) -> Option<&'a str> {
    offer.properties.get(key).and_then(|v| v.as_str())
}

/// Classify an offer against a target region bucket.
pub fn classify(offer: &ProviderOffer, region: &str) -> Option<OfferClass> {
    if let Some(explicit) = property_str(offer, "beacon.region") {
        return (explicit == region).then_some(OfferClass::P0);
    }
    for key in ["region", "geo.region"] {
        if let Some(generic) = property_str(offer, key) {
            return (generic == region).then_some(OfferClass::P1);
        }
    }
    let region_tag = format!("region:{region}");
    let has_region_tags = offer.tags.iter().any(|t| t.starts_with("region:"));
    if has_region_tags {
        return offer.tags.contains(&region_tag).then_some(OfferClass::P2);
    }
    Some(OfferClass::P3)
}

/// Candidates for one region, split by acquisition window.
#[derive(Debug, Default, Clone)]
pub struct RegionCandidates {
    /// P0/P1/P2 offers, best class first, score descending within a class.
    pub placed: Vec<(OfferClass, ProviderOffer)>,
    /// P3 offers, score descending.
    pub probeable: Vec<ProviderOffer>,
}

impl RegionCandidates {
    /// Whether any candidate exists for the region.
    pub fn is_empty(&self) -> bool {
        self.placed.is_empty() && self.probeable.is_empty()
    }
}

/// Group discovered offers into per-region candidate sets.
///
/// Ordering within each group is deterministic: class, then score
/// descending, then provider id.
pub fn candidates_for_region(
    offers: &[ProviderOffer],
    region: &str,
    filter: &RegionFilter,
) -> RegionCandidates {
    let mut out = RegionCandidates::default();
    for offer in offers {
        if !filter.admits(offer) {
            continue;
        }
        match classify(offer, region) {
            Some(OfferClass::P3) => out.probeable.push(offer.clone()),
            Some(class) => out.placed.push((class, offer.clone())),
            None => {}
        }
    }
    out.placed.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| b.1.score.total_cmp(&a.1.score))
            .then_with(|| a.1.provider_id.cmp(&b.1.provider_id))
    });
    out.probeable.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.provider_id.cmp(&b.provider_id))
    });
    out
}

/// How a region acquisition concluded.
#[derive(Debug)]
pub enum AcquisitionOutcome {
    /// An agreement was reached.
    Acquired {
        /// The negotiated agreement.
        acquisition: Acquisition,
        /// The offer it was negotiated from.
        offer: ProviderOffer,
        /// Which window produced it.
        window: AcquisitionWindow,
    },
    /// No candidate could be acquired before both windows elapsed.
    Exhausted {
        /// Per-provider failure detail.
        errors: Vec<String>,
    },
}

/// The acquisition window that produced an agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionWindow {
    /// Metadata-placed offer accepted in the strict window.
    Strict,
    /// Probe-verified offer accepted in the relax window.
    Relax,
}

/// Run the strict window over placed candidates.
async fn strict_window(
    provider: &Arc<dyn ProviderClient>,
    candidates: &RegionCandidates,
    errors: &mut Vec<String>,
) -> Option<(Acquisition, ProviderOffer)> {
    for (class, offer) in &candidates.placed {
        match provider.acquire(offer).await {
            Ok(acquisition) => {
                debug!(
                    provider_id = %offer.provider_id,
                    class = ?class,
                    "offer accepted in strict window"
                );
                return Some((acquisition, offer.clone()));
            }
            Err(err) => errors.push(err.to_string()),
        }
    }
    None
}

/// Run the relax window: probe-verified acquisition over P3 candidates.
async fn relax_window(
    provider: &Arc<dyn ProviderClient>,
    geoip: &Arc<dyn GeoIpResolver>,
    candidates: &RegionCandidates,
    region: &str,
    errors: &mut Vec<String>,
) -> Option<(Acquisition, ProviderOffer)> {
    for offer in &candidates.probeable {
        let acquisition = match provider.acquire(offer).await {
            Ok(a) => a,
            Err(err) => {
                errors.push(err.to_string());
                continue;
            }
        };
        let observed = match provider.probe_egress_ip(&acquisition).await {
            Ok(ip) => geoip.resolve(ip).await,
            Err(err) => {
                errors.push(err.to_string());
                release(provider, &acquisition).await;
                continue;
            }
        };
        match observed {
            Ok(bucket) if bucket == region => {
                debug!(
                    provider_id = %offer.provider_id,
                    region,
                    "probe-verified offer accepted in relax window"
                );
                return Some((acquisition, offer.clone()));
            }
            Ok(bucket) => {
                errors.push(format!(
                    "provider {} probed into {bucket}, wanted {region}",
                    offer.provider_id
                ));
                release(provider, &acquisition).await;
            }
            Err(err) => {
                errors.push(err.to_string());
                release(provider, &acquisition).await;
            }
        }
    }
    None
}

/// Release an agreement, logging instead of propagating failures.
pub(crate) async fn release(provider: &Arc<dyn ProviderClient>, acquisition: &Acquisition) {
    if let Err(err) = provider.release(acquisition).await {
        warn!(agreement_id = %acquisition.agreement_id, error = %err, "release failed");
    }
}

/// Acquire a provider for `region`: strict window first, then the relax
/// window, each bounded by its own timeout.
pub async fn acquire_region(
    provider: &Arc<dyn ProviderClient>,
    geoip: &Arc<dyn GeoIpResolver>,
    candidates: &RegionCandidates,
    region: &str,
    strict_timeout: Duration,
    relax_timeout: Duration,
) -> Result<AcquisitionOutcome, ProviderError> {
    let mut errors = Vec::new();

    if !candidates.placed.is_empty() {
        match tokio::time::timeout(
            strict_timeout,
            strict_window(provider, candidates, &mut errors),
        )
        .await
        {
            Ok(Some((acquisition, offer))) => {
                return Ok(AcquisitionOutcome::Acquired {
                    acquisition,
                    offer,
                    window: AcquisitionWindow::Strict,
                });
            }
            Ok(None) => {}
            Err(_) => errors.push(format!("strict window timed out for region {region}")),
        }
    }

    if !candidates.probeable.is_empty() {
        match tokio::time::timeout(
            relax_timeout,
            relax_window(provider, geoip, candidates, region, &mut errors),
        )
        .await
        {
            Ok(Some((acquisition, offer))) => {
                return Ok(AcquisitionOutcome::Acquired {
                    acquisition,
                    offer,
                    window: AcquisitionWindow::Relax,
                });
            }
            Ok(None) => {}
            Err(_) => errors.push(format!("relax window timed out for region {region}")),
        }
    }

    Ok(AcquisitionOutcome::Exhausted { errors })
}
