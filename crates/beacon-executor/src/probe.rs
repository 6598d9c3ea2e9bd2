// SPDX-License-Identifier: MIT OR Apache-2.0

//! Preflight probe: map a provider's egress IP to a canonical region bucket.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Canonical region buckets.
pub const REGION_BUCKETS: &[&str] = &["US", "EU", "ASIA"];

/// Errors from GeoIP resolution.
#[derive(Debug, Clone, Error)]
pub enum GeoIpError {
    /// The resolver service could not be reached.
    #[error("geoip lookup failed: {0}")]
    Lookup(String),
    /// The IP resolved to a country outside the canonical buckets.
    #[error("ip {ip} maps to no canonical region bucket")]
    NoBucket {
        /// The probed address.
        ip: IpAddr,
    },
}

/// Resolves an observed egress IP to a region bucket.
#[async_trait]
pub trait GeoIpResolver: Send + Sync {
    /// Region bucket for the address.
    async fn resolve(&self, ip: IpAddr) -> Result<String, GeoIpError>;
}

/// Table-driven resolver for tests and the mock backend.
///
/// Unmapped addresses fall into no bucket.
#[derive(Debug, Default)]
pub struct StaticGeoIpResolver {
    table: HashMap<IpAddr, String>,
}

impl StaticGeoIpResolver {
    /// Resolver over explicit `(ip, bucket)` pairs.
    pub fn new(entries: impl IntoIterator<Item = (IpAddr, String)>) -> Self {
        Self {
            table: entries.into_iter().collect(),
        }
    }

    /// The resolver matching the mock provider fleet's fixed egress
    /// addresses: `.10` is US, `.20` is EU, `.30` is ASIA.
    pub fn mock_fleet() -> Self {
        Self::new([
            ("198.51.100.10".parse().expect("literal ip"), "US".into()),
            ("198.51.100.20".parse().expect("literal ip"), "EU".into()),
            ("198.51.100.30".parse().expect("literal ip"), "ASIA".into()),
        ])
    }
}

#[async_trait]
impl GeoIpResolver for StaticGeoIpResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<String, GeoIpError> {
        self.table
            .get(&ip)
            .cloned()
            .ok_or(GeoIpError::NoBucket { ip })
    }
}

#[derive(Debug, Deserialize)]
struct GeoIpResponse {
    #[serde(default)]
    continent_code: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
}

/// HTTP resolver against a GeoIP JSON endpoint.
pub struct HttpGeoIpResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGeoIpResolver {
    /// Resolver querying `GET {base_url}/{ip}`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

/// Map a continent / country pair onto the canonical buckets.
fn bucket_for(continent: Option<&str>, country: Option<&str>) -> Option<&'static str> {
    match continent {
        Some("NA") | Some("SA") => Some("US"),
        Some("EU") | Some("AF") => Some("EU"),
        Some("AS") | Some("OC") => Some("ASIA"),
        _ => match country {
            Some("US") | Some("CA") | Some("MX") | Some("BR") => Some("US"),
            Some("DE") | Some("FR") | Some("GB") | Some("NL") | Some("PL") => Some("EU"),
            Some("JP") | Some("SG") | Some("IN") | Some("KR") | Some("AU") => Some("ASIA"),
            _ => None,
        },
    }
}

#[async_trait]
impl GeoIpResolver for HttpGeoIpResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<String, GeoIpError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), ip);
        let response: GeoIpResponse = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GeoIpError::Lookup(e.to_string()))?
            .json()
            .await
            .map_err(|e| GeoIpError::Lookup(e.to_string()))?;
        let bucket = bucket_for(
            response.continent_code.as_deref(),
            response.country_code.as_deref(),
        )
        .ok_or(GeoIpError::NoBucket { ip })?;
        debug!(%ip, bucket, "geoip probe resolved");
        Ok(bucket.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_maps_known_addresses() {
        let resolver = StaticGeoIpResolver::mock_fleet();
        let bucket = resolver
            .resolve("198.51.100.20".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(bucket, "EU");
    }

    #[tokio::test]
    async fn unmapped_address_has_no_bucket() {
        let resolver = StaticGeoIpResolver::default();
        let err = resolver
            .resolve("192.0.2.1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, GeoIpError::NoBucket { .. }));
    }

    #[test]
    fn continent_takes_precedence_over_country() {
        assert_eq!(bucket_for(Some("EU"), Some("JP")), Some("EU"));
        assert_eq!(bucket_for(None, Some("JP")), Some("ASIA"));
        assert_eq!(bucket_for(None, None), None);
    }
}
