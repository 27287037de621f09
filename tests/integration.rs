//! Integration tests for the MQTT authorization engine

use sentinel_mqtt_authz::cache::DecisionCache;
use sentinel_mqtt_authz::config::*;
use sentinel_mqtt_authz::engine::DecisionSource;
use sentinel_mqtt_authz::error::PolicyLoadError;
use sentinel_mqtt_authz::mqtt::TopicMatcher;
use sentinel_mqtt_authz::policy::{FilePolicySource, PolicyStore};
use sentinel_mqtt_authz::refresh::RefreshCoordinator;
use sentinel_mqtt_authz::{Decision, DecisionEngine, MqttAuthzAgent, RawContext};

use std::io::{Read, Seek, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const DEVICE_POLICY: &str = r#"{
    "rules": [
        {
            "name": "devices-publish",
            "topics": ["sensors/#"],
            "operations": ["publish"],
            "effect": "allow",
            "match": "role:\"device\""
        }
    ]
}"#;

fn write_policy(file: &mut NamedTempFile, json: &str) {
    let f = file.as_file_mut();
    f.set_len(0).unwrap();
    f.rewind().unwrap();
    f.write_all(json.as_bytes()).unwrap();
    f.sync_all().unwrap();
}

fn policy_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write_policy(&mut file, json);
    file
}

struct Harness {
    engine: DecisionEngine,
    coordinator: RefreshCoordinator,
}

fn harness(file: &NamedTempFile, config: AuthzConfig) -> Harness {
    let store = Arc::new(PolicyStore::new());
    let cache = Arc::new(DecisionCache::new(&config.cache));
    let engine = DecisionEngine::new(&config, store.clone(), cache.clone()).unwrap();
    let coordinator = RefreshCoordinator::new(
        store,
        cache,
        Arc::new(FilePolicySource::new(file.path())),
        &config.refresh,
    );
    Harness { engine, coordinator }
}

fn device() -> RawContext {
    RawContext::new("sensor-001")
        .with_username("sensor-001")
        .with_password(b"secret".to_vec())
        .with_role("device")
}

/// Test MQTT topic matching
#[test]
fn test_topic_matching() {
    let matcher = TopicMatcher::new();

    // Exact match
    assert!(matcher.matches("sensors/temp", "sensors/temp"));
    assert!(!matcher.matches("sensors/temp", "sensors/humidity"));

    // Single-level wildcard
    assert!(matcher.matches("sensors/temp", "sensors/+"));
    assert!(matcher.matches("sensors/temp/living", "+/temp/living"));
    assert!(!matcher.matches("sensors/temp/living", "sensors/+"));

    // Multi-level wildcard
    assert!(matcher.matches("sensors/temp/living/zone1", "sensors/#"));
    assert!(matcher.matches("sensors", "sensors/#"));
    assert!(matcher.matches("anything", "#"));

    // System topics are not covered by leading wildcards
    assert!(!matcher.matches("$SYS/broker/load", "#"));
    assert!(matcher.matches("$SYS/broker/load", "$SYS/#"));
}

/// Device publishes to its own namespace but nothing else
#[tokio::test]
async fn test_device_scenario() {
    let file = policy_file(DEVICE_POLICY);
    let h = harness(&file, AuthzConfig::default());
    h.coordinator.refresh().await.unwrap();

    assert_eq!(h.engine.decide(&device(), Operation::Publish, "sensors/temp1"), Decision::Allow);
    assert_eq!(h.engine.decide(&device(), Operation::Publish, "admin/config"), Decision::Deny);

    // Same topic, identity without the role
    let other = RawContext::new("laptop").with_username("alice").with_password(b"pw".to_vec());
    assert_eq!(h.engine.decide(&other, Operation::Publish, "sensors/temp1"), Decision::Deny);
}

/// Cached ALLOW keeps being served after a failed reload
#[tokio::test]
async fn test_failed_reload_keeps_cached_allow() {
    let mut file = policy_file(DEVICE_POLICY);
    let h = harness(&file, AuthzConfig::default());
    h.coordinator.refresh().await.unwrap();

    let first = h.engine.authorize(&device(), Operation::Publish, "sensors/temp1");
    assert_eq!(first.decision, Decision::Allow);

    write_policy(&mut file, "{ this is not json");
    assert!(matches!(h.coordinator.refresh().await, Err(PolicyLoadError::Parse(_))));

    let second = h.engine.authorize(&device(), Operation::Publish, "sensors/temp1");
    assert_eq!(second.decision, Decision::Allow);
    assert!(second.cached);
    assert_eq!(second.snapshot_version, 1);
}

/// Stale decisions are never served after a successful reload
#[tokio::test]
async fn test_reload_invalidates_cached_decisions() {
    let mut file = policy_file(DEVICE_POLICY);
    let h = harness(&file, AuthzConfig::default());
    h.coordinator.refresh().await.unwrap();

    assert_eq!(h.engine.decide(&device(), Operation::Publish, "sensors/temp1"), Decision::Allow);

    write_policy(
        &mut file,
        r##"{"rules": [{"name": "lockdown", "topics": ["#"], "effect": "deny"}]}"##,
    );
    assert_eq!(h.coordinator.refresh().await.unwrap(), 2);

    let verdict = h.engine.authorize(&device(), Operation::Publish, "sensors/temp1");
    assert_eq!(verdict.decision, Decision::Deny);
    assert!(!verdict.cached);
    assert_eq!(verdict.rule.as_deref(), Some("lockdown"));
    assert_eq!(verdict.snapshot_version, 2);
}

/// Equal specificity and priority: DENY wins
#[tokio::test]
async fn test_tie_break_denies() {
    let file = policy_file(
        r#"{"rules": [
            {"name": "allow", "topics": ["plant/+/status"], "operations": ["subscribe"], "effect": "allow"},
            {"name": "deny", "topics": ["plant/+/status"], "operations": ["subscribe"], "effect": "deny"}
        ]}"#,
    );
    let h = harness(&file, AuthzConfig::default());
    h.coordinator.refresh().await.unwrap();

    assert_eq!(
        h.engine.decide(&device(), Operation::Subscribe, "plant/line1/status"),
        Decision::Deny
    );
}

/// A more specific ALLOW overrides a broad DENY
#[tokio::test]
async fn test_specific_rule_wins() {
    let file = policy_file(
        r##"{"rules": [
            {"name": "deny-all", "topics": ["#"], "effect": "deny", "priority": 100},
            {"name": "own-inbox", "topics": ["inbox/sensor-001/#"], "effect": "allow", "match": "client-id:\"sensor-001\""}
        ]}"##,
    );
    let h = harness(&file, AuthzConfig::default());
    h.coordinator.refresh().await.unwrap();

    assert_eq!(
        h.engine.decide(&device(), Operation::Subscribe, "inbox/sensor-001/#"),
        Decision::Allow
    );
    assert_eq!(
        h.engine.decide(&device(), Operation::Subscribe, "inbox/sensor-002/#"),
        Decision::Deny
    );
}

/// Fail-closed default before any policy has been loaded
#[test]
fn test_default_deny_without_policy() {
    let file = policy_file(DEVICE_POLICY);
    let h = harness(&file, AuthzConfig::default());

    let verdict = h.engine.authorize(&device(), Operation::Publish, "sensors/temp1");
    assert_eq!(verdict.decision, Decision::Deny);
    assert_eq!(verdict.source, DecisionSource::Default);
    assert_eq!(verdict.snapshot_version, 0);
}

/// Clients outside the allowlist lose their credentials
#[tokio::test]
async fn test_ip_allowlist_strips_credentials() {
    let file = policy_file(
        r#"{"rules": [
            {"name": "devices", "topics": ["sensors/#"], "effect": "allow", "match": "role:\"device\""},
            {"name": "anonymous-public", "topics": ["public/#"], "effect": "allow", "match": "anonymous"}
        ]}"#,
    );
    let mut config = AuthzConfig::default();
    config.identity.ip_allowlist = vec!["10.0.0.0/8".to_string()];
    let h = harness(&file, config);
    h.coordinator.refresh().await.unwrap();

    let inside = device().with_client_ip("10.1.2.3");
    let outside = device().with_client_ip("192.168.1.10");

    assert_eq!(h.engine.decide(&inside, Operation::Publish, "sensors/t"), Decision::Allow);
    assert_eq!(h.engine.decide(&outside, Operation::Publish, "sensors/t"), Decision::Deny);
    assert_eq!(h.engine.decide(&outside, Operation::Publish, "public/t"), Decision::Allow);
    let stats = h.engine.stats();
    assert_eq!(stats.credentials_stripped, 2);
    assert_eq!(stats.allowlist_allowed, 1);
}

/// Role bindings in the policy document grant roles by principal
#[tokio::test]
async fn test_role_bindings_follow_reload() {
    let mut file = policy_file(
        r#"{
            "rules": [{"name": "ops", "topics": ["ops/#"], "effect": "allow", "match": "role:\"operator\""}],
            "role-bindings": {"alice": ["operator"]}
        }"#,
    );
    let h = harness(&file, AuthzConfig::default());
    h.coordinator.refresh().await.unwrap();

    let alice = RawContext::new("alice-laptop").with_username("alice").with_password(b"pw".to_vec());
    assert_eq!(h.engine.decide(&alice, Operation::Publish, "ops/restart"), Decision::Allow);

    write_policy(
        &mut file,
        r#"{"rules": [{"name": "ops", "topics": ["ops/#"], "effect": "allow", "match": "role:\"operator\""}]}"#,
    );
    h.coordinator.refresh().await.unwrap();
    assert_eq!(h.engine.decide(&alice, Operation::Publish, "ops/restart"), Decision::Deny);
}

/// Many threads deciding concurrently while the policy reloads
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_decisions_during_reload() {
    let file = policy_file(DEVICE_POLICY);
    let h = Arc::new(harness(&file, AuthzConfig::default()));
    h.coordinator.refresh().await.unwrap();

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let h = h.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let topic = format!("sensors/{}/{}", t, i % 20);
                    let decision = h.engine.decide(&device(), Operation::Publish, &topic);
                    assert_eq!(decision, Decision::Allow);
                }
            })
        })
        .collect();

    for _ in 0..5 {
        h.coordinator.refresh().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(h.engine.stats().fail_safe, 0);
}

/// Agent loads its policy from a configured file
#[tokio::test]
async fn test_agent_with_policy_file() {
    let file = policy_file(
        r#"{"rules": [
            {"name": "telemetry", "topics": ["sensors/#"], "effect": "allow", "match": "role:\"device\"", "max-qos": 1}
        ]}"#,
    );
    let mut config = AuthzConfig::default();
    config.refresh.interval_seconds = 0;
    config.policy.file = Some(file.path().to_path_buf());

    let agent = MqttAuthzAgent::with_config(config).unwrap();
    assert_eq!(agent.start().await.unwrap(), 1);

    let grant = agent.on_subscribe(&device(), "sensors/#", 2);
    assert!(grant.is_allowed());
    assert_eq!(grant.qos, Some(1));

    let stats = agent.stats();
    assert_eq!(stats.policy_version, 1);
    assert_eq!(stats.engine.allowed, 1);

    agent.shutdown().await;
}

/// Serve one canned JSON response, holding the connection open for `delay` first
fn serve_policy(body: &'static str, delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request);
            std::thread::sleep(delay);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    format!("http://{}/policy.json", addr)
}

/// Agent fetches its policy from a policy service
#[tokio::test]
async fn test_agent_with_policy_url() {
    let url = serve_policy(DEVICE_POLICY, Duration::ZERO);
    let mut config = AuthzConfig::default();
    config.refresh.interval_seconds = 0;
    config.policy.url = Some(url);

    let agent = MqttAuthzAgent::with_config(config).unwrap();
    assert_eq!(agent.start().await.unwrap(), 1);
    assert!(agent.on_publish(&device(), "sensors/temp", 0).is_allowed());
    assert!(!agent.on_publish(&device(), "admin/config", 0).is_allowed());

    agent.shutdown().await;
}

/// A policy service slower than the refresh timeout leaves the snapshot alone
#[tokio::test]
async fn test_slow_policy_service_times_out() {
    let url = serve_policy(DEVICE_POLICY, Duration::from_millis(500));
    let mut config = AuthzConfig::default();
    config.refresh.interval_seconds = 0;
    config.refresh.timeout_ms = 50;
    config.policy.url = Some(url);

    let agent = MqttAuthzAgent::with_config(config).unwrap();
    // The request shares the refresh timeout, so either side may give up first
    assert!(matches!(
        agent.refresh().await,
        Err(PolicyLoadError::Timeout(_)) | Err(PolicyLoadError::Source(_))
    ));
    assert_eq!(agent.policy_version(), 0);
    assert_eq!(
        agent.engine().decide(&device(), Operation::Publish, "sensors/temp"),
        Decision::Deny
    );

    let stats = agent.stats();
    assert_eq!(stats.refresh.failures, 1);
    agent.shutdown().await;
}

/// Configuration file round trip
#[test]
fn test_config_from_file() {
    let file = policy_file(
        r#"{
            "default-effect": "allow",
            "cache": {"max-entries": 500, "ttl-ms": 1000},
            "refresh": {"interval-seconds": 0},
            "policy": {"file": "/etc/mqtt/policy.json"}
        }"#,
    );
    let config = AuthzConfig::from_file(file.path()).unwrap();

    assert_eq!(config.default_effect, Effect::Allow);
    assert_eq!(config.cache.max_entries, 500);
    assert_eq!(config.cache.ttl(), Duration::from_secs(1));
    assert!(config.cache.enabled);
    assert_eq!(config.refresh.interval(), None);
    assert_eq!(config.refresh.timeout(), Duration::from_millis(5000));
}
