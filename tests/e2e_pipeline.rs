// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end pipeline scenarios over in-memory infrastructure:
//! admission → outbox → queue → consumer → executor → receipts →
//! transparency log.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use beacon_admission::{AdmissionConfig, AdmissionPipeline};
use beacon_breaker::BreakerConfig;
use beacon_canonical::canonicalize_jobspec_v1;
use beacon_core::{Clock, JobSpec, KeyStatus, SystemClock, TrustedKey};
use beacon_daemon::consumer::Consumer;
use beacon_executor::{ExecutorConfig, MultiRegionExecutor, StaticGeoIpResolver};
use beacon_kv::MemoryKv;
use beacon_provider_mock::{MockBehavior, MockProvider, MockProviderClient};
use beacon_queue::{QueueConfig, WorkQueue};
use beacon_store::{JobStatus, JobStore, MemoryStore, OutboxPublisher};
use beacon_telemetry::Metrics;
use beacon_translog::TransparencyLog;
use beacon_trust::{ReceiptSigner, TrustRegistry};
use ed25519_dalek::{Signer as _, SigningKey};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    pipeline: AdmissionPipeline,
    publisher: OutboxPublisher,
    consumer: Consumer,
    store: Arc<MemoryStore>,
    translog: Arc<TransparencyLog>,
    key: SigningKey,
    pub_b64: String,
}

fn harness(providers: Vec<MockProvider>) -> Harness {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let key = SigningKey::from_bytes(&[5u8; 32]);
    let pub_b64 = B64.encode(key.verifying_key().to_bytes());

    let registry = Arc::new(TrustRegistry::with_keys(
        vec![TrustedKey {
            kid: "e2e-key".into(),
            public_key: pub_b64.clone(),
            status: KeyStatus::Active,
            not_before: None,
            not_after: None,
        }],
        clock.clone(),
    ));
    let kv = Arc::new(MemoryKv::new(clock.clone()));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let metrics = Metrics::new();
    let translog = Arc::new(TransparencyLog::default());

    let queue = Arc::new(WorkQueue::new(
        kv.clone(),
        clock.clone(),
        QueueConfig::named("jobs"),
        BreakerConfig::default(),
    ));

    let signer = ReceiptSigner::from_b64(&B64.encode([9u8; 32])).unwrap();
    let executor = Arc::new(MultiRegionExecutor::new(
        Arc::new(MockProviderClient::new(providers)),
        Arc::new(StaticGeoIpResolver::mock_fleet()),
        store.clone(),
        translog.clone(),
        kv.clone(),
        Some(signer),
        metrics.clone(),
        clock.clone(),
        ExecutorConfig::default(),
    ));

    let pipeline = AdmissionPipeline::new(
        registry,
        store.clone(),
        kv,
        metrics,
        clock,
        AdmissionConfig {
            trust_enforce: true,
            ..Default::default()
        },
        "jobs",
    );

    let publisher = OutboxPublisher::new(store.clone(), queue.clone(), Duration::from_millis(10));
    let consumer = Consumer::new(
        "e2e-worker",
        queue,
        store.clone(),
        executor,
        Duration::from_millis(10),
    );

    Harness {
        pipeline,
        publisher,
        consumer,
        store,
        translog,
        key,
        pub_b64,
    }
}

fn spec_json(id: &str, nonce: &str, regions: &[&str]) -> Value {
    json!({
        "id": id,
        "version": "v1",
        "benchmark": {
            "name": "llm-bench",
            "container": {
                "image": "beacon/bench",
                "tag": "latest",
                "command": ["run"],
                "resources": {"cpu": 1.0, "mem": "512mb"}
            },
            "input": {"type": "inline", "data": {"prompt": "hello"}, "hash": "in-hash"}
        },
        "constraints": {
            "regions": regions,
            "min_regions": regions.len(),
            "min_success_rate": 0.67,
            "timeout": 30,
            "provider_timeout": 10
        },
        "questions": ["q1"],
        "metadata": {"timestamp": chrono::Utc::now().to_rfc3339(), "nonce": nonce}
    })
}

fn sign(body: &Value, key: &SigningKey, pub_b64: &str) -> Vec<u8> {
    let spec: JobSpec = serde_json::from_value(body.clone()).unwrap();
    let canon = canonicalize_jobspec_v1(&spec).unwrap();
    let sig = B64.encode(key.sign(&canon).to_bytes());
    let mut out = body.clone();
    out["signature"] = json!(sig);
    out["public_key"] = json!(pub_b64);
    serde_json::to_vec(&out).unwrap()
}

#[tokio::test]
async fn signed_job_flows_to_a_verified_receipt() {
    let h = harness(vec![MockProvider::healthy("p-us", "US")]);
    let raw = sign(&spec_json("e2e-1", "n-1", &["US"]), &h.key, &h.pub_b64);

    // Admission persists exactly one of each row.
    let ticket = h
        .pipeline
        .submit(&raw, "203.0.113.9", Some("idem-1"))
        .await
        .unwrap();
    assert_eq!(ticket.job_id, "e2e-1");
    assert_eq!(h.store.job_count(), 1);
    assert_eq!(h.store.outbox_count(), 1);
    assert_eq!(h.store.idempotency_count(), 1);

    // Outbox → queue → consumer → executor.
    assert_eq!(h.publisher.publish_batch().await, 1);
    assert!(h.consumer.tick().await);

    let job = h.store.job("e2e-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    // The receipt on the attempt is signed and verifies.
    let executions = h.store.executions_for_job("e2e-1").await.unwrap();
    assert_eq!(executions.len(), 1);
    let receipt: beacon_core::Receipt =
        serde_json::from_value(executions[0].receipt_data.clone().unwrap()).unwrap();
    assert!(receipt.signature.is_some());
    assert!(beacon_receipt::verify_receipt(&receipt));
    assert_eq!(receipt.provenance.benchmark_hash, "in-hash");

    // One transparency entry whose proof verifies against the root.
    assert_eq!(h.translog.len(), 1);
    let root = h.translog.root().unwrap();
    let proof = h.translog.proof(0).unwrap();
    let leaf = h.translog.leaf(0).unwrap();
    assert!(TransparencyLog::verify_proof(&leaf, &proof, &root));
}

#[tokio::test]
async fn replayed_nonce_is_rejected_after_a_successful_admission() {
    let h = harness(vec![MockProvider::healthy("p-us", "US")]);
    let raw = sign(&spec_json("e2e-1", "n-1", &["US"]), &h.key, &h.pub_b64);

    h.pipeline.submit(&raw, "203.0.113.9", None).await.unwrap();
    let err = h
        .pipeline
        .submit(&raw, "203.0.113.9", None)
        .await
        .unwrap_err();
    assert_eq!(err.code.code(), "replay_detected");
    // The store is untouched by the replay.
    assert_eq!(h.store.job_count(), 1);
    assert_eq!(h.store.outbox_count(), 1);
}

#[tokio::test]
async fn three_region_fanout_with_one_failure_still_completes() {
    let mut asia = MockProvider::healthy("p-asia", "ASIA");
    asia.behavior = MockBehavior::Fail;
    let h = harness(vec![
        MockProvider::healthy("p-us", "US"),
        MockProvider::healthy("p-eu", "EU"),
        asia,
    ]);
    let raw = sign(
        &spec_json("e2e-multi", "n-multi", &["US", "EU", "ASIA"]),
        &h.key,
        &h.pub_b64,
    );

    h.pipeline.submit(&raw, "203.0.113.9", None).await.unwrap();
    h.publisher.publish_batch().await;
    assert!(h.consumer.tick().await);

    let job = h.store.job("e2e-multi").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let executions = h.store.executions_for_job("e2e-multi").await.unwrap();
    assert_eq!(executions.len(), 3);
    let receipts = executions
        .iter()
        .filter(|e| e.receipt_data.is_some())
        .count();
    assert_eq!(receipts, 2);
    assert_eq!(h.translog.len(), 3);
}

#[tokio::test]
async fn duplicate_queue_delivery_of_a_terminal_job_is_acked_away() {
    let h = harness(vec![MockProvider::healthy("p-us", "US")]);
    let raw = sign(&spec_json("e2e-dup", "n-dup", &["US"]), &h.key, &h.pub_b64);
    h.pipeline.submit(&raw, "203.0.113.9", None).await.unwrap();
    h.publisher.publish_batch().await;
    assert!(h.consumer.tick().await);
    assert_eq!(h.translog.len(), 1);

    // Republish the same job (duplicate delivery) and consume again: the
    // terminal job is not re-executed.
    h.store
        .append_outbox("jobs", &json!({"job_id": "e2e-dup"}).to_string())
        .await
        .unwrap();
    h.publisher.publish_batch().await;
    assert!(h.consumer.tick().await);
    assert_eq!(h.translog.len(), 1);
    assert_eq!(
        h.store.executions_for_job("e2e-dup").await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn revoked_key_is_rejected_after_registry_reload() {
    use std::io::Write as _;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let key = SigningKey::from_bytes(&[5u8; 32]);
    let pub_b64 = B64.encode(key.verifying_key().to_bytes());

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"[{{"kid": "e2e-key", "public_key": "{pub_b64}", "status": "active"}}]"#
    )
    .unwrap();
    let registry = Arc::new(TrustRegistry::from_file(file.path(), clock.clone()).unwrap());

    let kv = Arc::new(MemoryKv::new(clock.clone()));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let pipeline = AdmissionPipeline::new(
        registry.clone(),
        store,
        kv,
        Metrics::new(),
        clock,
        AdmissionConfig {
            trust_enforce: true,
            ..Default::default()
        },
        "jobs",
    );

    let raw = sign(&spec_json("e2e-rev", "n-1", &["US"]), &key, &pub_b64);
    pipeline.submit(&raw, "203.0.113.9", None).await.unwrap();

    // Revoke on disk and reload, as the background reloader would.
    let mut rewrite = std::fs::File::create(file.path()).unwrap();
    writeln!(
        rewrite,
        r#"[{{"kid": "e2e-key", "public_key": "{pub_b64}", "status": "revoked"}}]"#
    )
    .unwrap();
    registry.reload().unwrap();

    let raw = sign(&spec_json("e2e-rev-2", "n-2", &["US"]), &key, &pub_b64);
    let err = pipeline.submit(&raw, "203.0.113.9", None).await.unwrap_err();
    assert_eq!(err.code.code(), "trust_violation:revoked");
}
