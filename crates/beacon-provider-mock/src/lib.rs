// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Deterministic mock provider backend."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! A scriptable [`ProviderClient`] for tests and local development.
//!
//! Each simulated provider declares its region, how its offer advertises
//! that region (explicit metadata, tag, or probe-only), and what execution
//! does (succeed, fail, refuse).

use async_trait::async_trait;
use beacon_core::Constraints;
use beacon_provider::{
    Acquisition, ProviderClient, ProviderError, ProviderOffer, TaskOutput, TaskSpec,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// How a simulated offer advertises its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionAdvertisement {
    /// `beacon.region` property with the exact bucket.
    Explicit,
    /// Generic `region` property.
    Generic,
    /// `geo.region` property.
    Geo,
    /// A region tag such as `region:US`.
    Tag,
    /// No region metadata at all; only the probe can place it.
    ProbeOnly,
}

/// What execution on a simulated provider does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Complete with deterministic output.
    Succeed,
    /// Fail with an infrastructure error.
    Fail,
    /// Fail with a content refusal.
    Refuse,
    /// Fail agreement negotiation.
    RejectAcquisition,
}

/// One simulated provider.
#[derive(Debug, Clone)]
pub struct MockProvider {
    /// Provider identity.
    pub provider_id: String,
    /// Region bucket the provider actually lives in.
    pub region: String,
    /// Offer score.
    pub score: f64,
    /// Offer price per hour.
    pub price_per_hour: f64,
    /// How the offer advertises its region.
    pub advertisement: RegionAdvertisement,
    /// Execution behaviour.
    pub behavior: MockBehavior,
}

impl MockProvider {
    /// A succeeding provider with explicit region metadata.
    pub fn healthy(provider_id: &str, region: &str) -> Self {
        Self {
            provider_id: provider_id.into(),
            region: region.into(),
            score: 0.9,
            price_per_hour: 0.05,
            advertisement: RegionAdvertisement::Explicit,
            behavior: MockBehavior::Succeed,
        }
    }

    fn offer(&self) -> ProviderOffer {
        let mut properties = BTreeMap::new();
        let mut tags = Vec::new();
        match self.advertisement {
            RegionAdvertisement::Explicit => {
                properties.insert("beacon.region".into(), json!(self.region));
            }
            RegionAdvertisement::Generic => {
                properties.insert("region".into(), json!(self.region));
            }
            RegionAdvertisement::Geo => {
                properties.insert("geo.region".into(), json!(self.region));
            }
            RegionAdvertisement::Tag => {
                tags.push(format!("region:{}", self.region));
            }
            RegionAdvertisement::ProbeOnly => {}
        }
        ProviderOffer {
            provider_id: self.provider_id.clone(),
            score: self.score,
            price_per_hour: self.price_per_hour,
            properties,
            tags,
        }
    }

    /// The egress IP the probe observes for this provider's region.
    fn egress_ip(&self) -> IpAddr {
        // One stable documentation-range address per bucket.
        match self.region.as_str() {
            "US" => "198.51.100.10".parse().expect("literal ip"),
            "EU" => "198.51.100.20".parse().expect("literal ip"),
            "ASIA" => "198.51.100.30".parse().expect("literal ip"),
            _ => "198.51.100.250".parse().expect("literal ip"),
        }
    }
}

/// The mock marketplace.
pub struct MockProviderClient {
    providers: Vec<MockProvider>,
    /// Artificial latency applied to execute calls.
    execute_delay: Duration,
    released: Mutex<Vec<String>>,
}

impl MockProviderClient {
    /// Client over the given simulated fleet.
    pub fn new(providers: Vec<MockProvider>) -> Self {
        Self {
            providers,
            execute_delay: Duration::ZERO,
            released: Mutex::new(Vec::new()),
        }
    }

    /// Apply an artificial delay to every execution.
    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = delay;
        self
    }

    /// Agreements released so far. Test helper.
    pub fn released(&self) -> Vec<String> {
        self.released.lock().expect("mock lock poisoned").clone()
    }

    fn find(&self, provider_id: &str) -> Option<&MockProvider> {
        self.providers.iter().find(|p| p.provider_id == provider_id)
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn discover(
        &self,
        constraints: &Constraints,
    ) -> Result<Vec<ProviderOffer>, ProviderError> {
        let offers: Vec<ProviderOffer> = self
            .providers
            .iter()
            .filter(|p| {
                constraints.providers.is_empty()
                    || constraints.providers.contains(&p.provider_id)
            })
            .map(MockProvider::offer)
            .collect();
        if offers.is_empty() {
            return Err(ProviderError::NoOffers);
        }
        Ok(offers)
    }

    async fn acquire(&self, offer: &ProviderOffer) -> Result<Acquisition, ProviderError> {
        let provider = self.find(&offer.provider_id).ok_or_else(|| {
            ProviderError::AcquisitionFailed {
                provider_id: offer.provider_id.clone(),
                reason: "unknown provider".into(),
            }
        })?;
        if provider.behavior == MockBehavior::RejectAcquisition {
            return Err(ProviderError::AcquisitionFailed {
                provider_id: offer.provider_id.clone(),
                reason: "provider rejected the agreement".into(),
            });
        }
        Ok(Acquisition {
            provider_id: offer.provider_id.clone(),
            agreement_id: Uuid::new_v4().to_string(),
        })
    }

    async fn execute(
        &self,
        acquisition: &Acquisition,
        task: &TaskSpec,
        timeout: Duration,
    ) -> Result<TaskOutput, ProviderError> {
        let provider =
            self.find(&acquisition.provider_id)
                .ok_or_else(|| ProviderError::ExecutionFailed {
                    provider_id: acquisition.provider_id.clone(),
                    reason: "unknown provider".into(),
                    refusal: false,
                })?;

        if self.execute_delay > Duration::ZERO {
            if self.execute_delay >= timeout {
                return Err(ProviderError::Timeout {
                    provider_id: acquisition.provider_id.clone(),
                });
            }
            tokio::time::sleep(self.execute_delay).await;
        }

        match provider.behavior {
            MockBehavior::Succeed => Ok(TaskOutput {
                stdout: format!("benchmark {} ok", task.job_id),
                stderr: String::new(),
                exit_code: 0,
                data: json!({
                    "job_id": task.job_id,
                    "provider_id": provider.provider_id,
                    "region": provider.region,
                    "answers": task.questions.iter()
                        .map(|q| json!({"question": q, "answer": format!("mock answer to '{q}'")}))
                        .collect::<Vec<_>>(),
                }),
            }),
            MockBehavior::Fail => Err(ProviderError::ExecutionFailed {
                provider_id: acquisition.provider_id.clone(),
                reason: "container exited non-zero".into(),
                refusal: false,
            }),
            MockBehavior::Refuse => Err(ProviderError::ExecutionFailed {
                provider_id: acquisition.provider_id.clone(),
                reason: "model refused the prompt".into(),
                refusal: true,
            }),
            MockBehavior::RejectAcquisition => Err(ProviderError::ExecutionFailed {
                provider_id: acquisition.provider_id.clone(),
                reason: "agreement was never valid".into(),
                refusal: false,
            }),
        }
    }

    async fn estimate_cost(
        &self,
        offer: &ProviderOffer,
        _task: &TaskSpec,
    ) -> Result<f64, ProviderError> {
        // Flat estimate: one hour at the advertised rate.
        Ok(offer.price_per_hour)
    }

    async fn probe_egress_ip(&self, acquisition: &Acquisition) -> Result<IpAddr, ProviderError> {
        let provider = self
            .find(&acquisition.provider_id)
            .ok_or_else(|| ProviderError::Unavailable("unknown provider".into()))?;
        Ok(provider.egress_ip())
    }

    async fn release(&self, acquisition: &Acquisition) -> Result<(), ProviderError> {
        self.released
            .lock()
            .expect("mock lock poisoned")
            .push(acquisition.agreement_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::Constraints;

    fn constraints(regions: &[&str]) -> Constraints {
        Constraints {
            regions: regions.iter().map(|r| r.to_string()).collect(),
            min_regions: 1,
            min_success_rate: 0.0,
            timeout: 60,
            provider_timeout: 30,
            max_cost: None,
            providers: vec![],
        }
    }

    fn task() -> TaskSpec {
        TaskSpec {
            job_id: "j1".into(),
            image: "beacon/bench:latest".into(),
            command: vec!["run".into()],
            env: BTreeMap::new(),
            input: json!({}),
            input_hash: "in-hash".into(),
            questions: vec!["q1".into()],
        }
    }

    #[tokio::test]
    async fn discover_respects_whitelist() {
        let client = MockProviderClient::new(vec![
            MockProvider::healthy("p1", "US"),
            MockProvider::healthy("p2", "EU"),
        ]);
        let mut c = constraints(&["US"]);
        c.providers = vec!["p2".into()];
        let offers = client.discover(&c).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].provider_id, "p2");
    }

    #[tokio::test]
    async fn execute_succeeds_with_answers() {
        let client = MockProviderClient::new(vec![MockProvider::healthy("p1", "US")]);
        let offers = client.discover(&constraints(&["US"])).await.unwrap();
        let acq = client.acquire(&offers[0]).await.unwrap();
        let out = client
            .execute(&acq, &task(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.data["answers"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refusal_is_flagged() {
        let mut provider = MockProvider::healthy("p1", "US");
        provider.behavior = MockBehavior::Refuse;
        let client = MockProviderClient::new(vec![provider]);
        let offers = client.discover(&constraints(&["US"])).await.unwrap();
        let acq = client.acquire(&offers[0]).await.unwrap();
        let err = client
            .execute(&acq, &task(), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(err.is_content_refusal());
    }

    #[tokio::test]
    async fn probe_ip_maps_to_region() {
        let client = MockProviderClient::new(vec![MockProvider::healthy("p1", "EU")]);
        let offers = client.discover(&constraints(&["EU"])).await.unwrap();
        let acq = client.acquire(&offers[0]).await.unwrap();
        let ip = client.probe_egress_ip(&acq).await.unwrap();
        assert_eq!(ip.to_string(), "198.51.100.20");
    }

    #[tokio::test]
    async fn probe_only_offer_has_no_region_metadata() {
        let mut provider = MockProvider::healthy("p1", "US");
        provider.advertisement = RegionAdvertisement::ProbeOnly;
        let client = MockProviderClient::new(vec![provider]);
        let offers = client.discover(&constraints(&["US"])).await.unwrap();
        assert!(offers[0].properties.is_empty());
        assert!(offers[0].tags.is_empty());
    }
}
