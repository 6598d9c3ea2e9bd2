// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "ProviderClient capability trait and offer types."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The single seam between the executor and remote compute providers.
//!
//! The mock backend implements this trait deterministically for tests and
//! DSN-less development; the real marketplace client is an external
//! collaborator that plugs in through the same interface.

use async_trait::async_trait;
use beacon_core::Constraints;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Errors from provider operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The provider service could not be reached.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// No offers matched the constraints.
    #[error("no offers for constraints")]
    NoOffers,
    /// Agreement negotiation failed for this offer.
    #[error("acquisition failed for provider {provider_id}: {reason}")]
    AcquisitionFailed {
        /// Offer that failed to negotiate.
        provider_id: String,
        /// Failure detail.
        reason: String,
    },
    /// The task ran and failed.
    #[error("execution failed on provider {provider_id}: {reason}")]
    ExecutionFailed {
        /// Provider that ran the task.
        provider_id: String,
        /// Failure detail.
        reason: String,
        /// Whether the failure is a model content refusal rather than an
        /// infrastructure fault.
        refusal: bool,
    },
    /// The task exceeded its timeout.
    #[error("execution timed out on provider {provider_id}")]
    Timeout {
        /// Provider that ran the task.
        provider_id: String,
    },
}

impl ProviderError {
    /// Whether this error represents a content refusal.
    pub fn is_content_refusal(&self) -> bool {
        matches!(self, ProviderError::ExecutionFailed { refusal: true, .. })
    }
}

/// A market offer from one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderOffer {
    /// Provider identity.
    pub provider_id: String,
    /// Reputation score; higher is better.
    pub score: f64,
    /// Advertised price per hour in platform units.
    pub price_per_hour: f64,
    /// Raw offer properties, e.g. `beacon.region`, `geo.region`.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Free-form offer tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A negotiated agreement with a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Acquisition {
    /// Provider the agreement is with.
    pub provider_id: String,
    /// Agreement handle used for execution and release.
    pub agreement_id: String,
}

/// The task handed to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Owning job.
    pub job_id: String,
    /// Fully qualified container image reference.
    pub image: String,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Benchmark input payload.
    pub input: serde_json::Value,
    /// Declared content hash of the input, carried into receipt provenance.
    pub input_hash: String,
    /// Question set for interrogative benchmarks.
    pub questions: Vec<String>,
}

/// Output of a completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Container exit code.
    pub exit_code: i32,
    /// Structured output payload.
    pub data: serde_json::Value,
}

/// Capability interface to a compute marketplace.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Backend name, e.g. `"mock"`.
    fn name(&self) -> &str;

    /// Discover candidate offers for the given constraints.
    async fn discover(&self, constraints: &Constraints)
    -> Result<Vec<ProviderOffer>, ProviderError>;

    /// Negotiate an agreement with the offered provider.
    async fn acquire(&self, offer: &ProviderOffer) -> Result<Acquisition, ProviderError>;

    /// Run the task under the agreement.
    async fn execute(
        &self,
        acquisition: &Acquisition,
        task: &TaskSpec,
        timeout: Duration,
    ) -> Result<TaskOutput, ProviderError>;

    /// Estimate the cost of running the task on this offer.
    async fn estimate_cost(&self, offer: &ProviderOffer, task: &TaskSpec)
    -> Result<f64, ProviderError>;

    /// Fetch the provider's egress IP for the preflight probe.
    async fn probe_egress_ip(&self, acquisition: &Acquisition) -> Result<IpAddr, ProviderError>;

    /// Tear down the agreement.
    async fn release(&self, acquisition: &Acquisition) -> Result<(), ProviderError>;
}

/// Named registry of provider clients.
///
/// The daemon registers the configured backend at startup; tests register
/// purpose-built mocks.
#[derive(Default)]
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under its own name. Later registrations replace
    /// earlier ones.
    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.name().to_string(), client);
    }

    /// Look up a client by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(name).cloned()
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }
}
