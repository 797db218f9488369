//! Crate-level integration tests exercising the public API across
//! module boundaries: CA bootstrap, custom CA adoption, certificate
//! rotation, shadow idempotence, offline authentication, and policy
//! variable substitution end to end.

use cda_core::ca::{self, KeyAlgorithm, LeafKind};
use cda_core::certmanager::{CertificateManager, IssuedMaterial, SubscribeRequest};
use cda_core::certregistry::CertificateRegistry;
use cda_core::certstore::CertificateStore;
use cda_core::cloud::MockCloudIdentityClient;
use cda_core::config::CertificateAuthorityConfig;
use cda_core::connectivity::{ConnectivityTracker, StaticConnectivityInfoProvider};
use cda_core::error::CloudError;
use cda_core::events::DomainEventBus;
use cda_core::policy::{Permission, Policy, PolicyEvaluator};
use cda_core::session::{
    AttributeNamespace, Credentials, MqttSessionFactory, SessionManager,
};
use cda_core::thing::ThingRegistry;
use cda_core::transport::MockMqttTransport;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tempfile::tempdir;

#[tokio::test]
async fn fresh_start_generates_a_managed_ca() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CertificateStore::new(dir.path().join("ca.keystore"), dir.path().join("certs")));

    let passphrase = store.generate_random_passphrase();
    assert_eq!(passphrase.chars().count(), 16);
    assert!(passphrase.bytes().all(|b| (0x20..=0x7E).contains(&b)));

    store.init(&passphrase).await.unwrap();

    let manager = CertificateManager::new(store, Arc::new(DomainEventBus::new()), CertificateAuthorityConfig::default());
    let certs = manager.get_ca_certificates().await.unwrap();
    assert_eq!(certs.len(), 1);
    assert!(certs[0].contains("BEGIN CERTIFICATE"));
}

#[tokio::test]
async fn custom_ca_is_loaded_without_generating_a_new_keypair() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CertificateStore::new(dir.path().join("ca.keystore"), dir.path().join("certs")));
    store.init("a sixteen char passphrase").await.unwrap();

    let provided = ca::generate_self_signed_ca(KeyAlgorithm::EcdsaP256, "provided-ca").unwrap();
    let provided_cert_pem = provided.certificate_pem.clone();
    let provided_key_pem = provided.key_pair_pem();

    let manager = CertificateManager::new(store, Arc::new(DomainEventBus::new()), CertificateAuthorityConfig::default());
    manager
        .configure_custom_ca("a sixteen char passphrase", KeyAlgorithm::EcdsaP256, &provided_cert_pem, &provided_key_pem)
        .await
        .unwrap();

    let certs = manager.get_ca_certificates().await.unwrap();
    assert_eq!(certs, vec![provided_cert_pem]);
}

#[tokio::test]
async fn server_certificate_rotates_on_connectivity_change_with_updated_san() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CertificateStore::new(dir.path().join("ca.keystore"), dir.path().join("certs")));
    store.init("a sixteen char passphrase").await.unwrap();
    let manager = CertificateManager::new(
        store,
        Arc::new(DomainEventBus::new()),
        CertificateAuthorityConfig::default(),
    );

    let issued: Arc<StdMutex<Vec<IssuedMaterial>>> = Arc::new(StdMutex::new(Vec::new()));
    let issued2 = issued.clone();

    manager
        .subscribe(SubscribeRequest {
            service_id: "mqtt-broker".into(),
            kind: LeafKind::Server,
            common_name: "core".into(),
            callback: Arc::new(move |material| issued2.lock().unwrap().push(material)),
        })
        .await
        .unwrap();

    manager.on_connectivity_changed(vec!["1.2.3.4".into()]).await;
    manager
        .on_connectivity_changed(vec!["1.2.3.4".into(), "gw.example".into()])
        .await;

    let leaves = issued.lock().unwrap().clone();
    assert_eq!(leaves.len(), 3); // initial subscribe issuance + 2 rotations

    use x509_parser::extensions::{GeneralName, ParsedExtension};

    let (_, pem) = x509_parser::pem::parse_x509_pem(leaves[2].leaf_pem.as_bytes()).unwrap();
    let cert = pem.parse_x509().unwrap();
    let general_names = cert
        .extensions()
        .iter()
        .find_map(|ext| match ext.parsed_extension() {
            ParsedExtension::SubjectAlternativeName(san) => Some(&san.general_names),
            _ => None,
        })
        .expect("server leaf must carry a SAN extension");
    let has_ip = general_names.iter().any(|name| match name {
        GeneralName::IPAddress(bytes) => *bytes == [1, 2, 3, 4],
        _ => false,
    });
    let has_dns = general_names.iter().any(|name| match name {
        GeneralName::DNSName(name) => *name == "gw.example",
        _ => false,
    });
    assert!(has_ip, "expected SAN to contain IP 1.2.3.4");
    assert!(has_dns, "expected SAN to contain DNS gw.example");

    let (_, ca_pem) = x509_parser::pem::parse_x509_pem(leaves[2].ca_chain_pem[0].as_bytes()).unwrap();
    let ca_cert = ca_pem.parse_x509().unwrap();
    assert_eq!(cert.issuer(), ca_cert.subject());
}

#[tokio::test]
async fn shadow_delta_idempotence_with_duplicate_delivery() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CertificateStore::new(dir.path().join("ca.keystore"), dir.path().join("certs")));
    store.init("a sixteen char passphrase").await.unwrap();
    let events = Arc::new(DomainEventBus::new());
    let cert_manager = CertificateManager::new(store, events.clone(), CertificateAuthorityConfig::default());

    let rotations = Arc::new(AtomicUsize::new(0));
    let rotations2 = rotations.clone();
    cert_manager
        .subscribe(SubscribeRequest {
            service_id: "mqtt-broker".into(),
            kind: LeafKind::Server,
            common_name: "core".into(),
            callback: Arc::new(move |_material| {
                rotations2.fetch_add(1, Ordering::SeqCst);
            }),
        })
        .await
        .unwrap();
    rotations.store(0, Ordering::SeqCst); // ignore the immediate subscribe issuance

    let transport = Arc::new(MockMqttTransport::new());
    let provider = Arc::new(StaticConnectivityInfoProvider::new());
    provider.set("7", vec!["203.0.113.9".into()]).await;

    let tracker = ConnectivityTracker::new(transport.clone(), cert_manager, provider, events, "gateway-1");
    tracker.start().await;

    let payload = serde_json::to_vec(&serde_json::json!({"state": {"version": "7"}})).unwrap();
    transport.deliver("$aws/things/gateway-1/shadow/update/delta", &payload, false).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    // Redelivery with DUP=1, same version.
    transport.deliver("$aws/things/gateway-1/shadow/update/delta", &payload, true).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let published = transport.published_messages().await;
    let report_count = published
        .iter()
        .filter(|(topic, _, _)| topic == "$aws/things/gateway-1/shadow/update")
        .count();
    assert_eq!(report_count, 1);
    assert_eq!(rotations.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.last_processed_version().await.as_deref(), Some("7"));
}

#[tokio::test]
async fn offline_authentication_via_local_trust_then_expiry() {
    let cloud = Arc::new(MockCloudIdentityClient::new());
    cloud.attach("t1", "PEM-C1", "iot-cert-1").await;
    let certificate_registry = Arc::new(CertificateRegistry::new(cloud.clone(), 10));
    let thing_registry = Arc::new(ThingRegistry::new(cloud.clone(), 60));
    let factory = MqttSessionFactory::new(certificate_registry, thing_registry, HashSet::new());

    // Online: attaches t1 to c1 and records the local trust window.
    let session = factory
        .create(&Credentials {
            client_id: "client-1".into(),
            certificate_pem: Some("PEM-C1".into()),
            thing_name: Some("t1".into()),
        })
        .await
        .unwrap();
    assert_eq!(session.get_attribute(AttributeNamespace::Thing, "ThingName"), Some("t1"));
    assert_eq!(
        session.get_attribute(AttributeNamespace::Certificate, "CertificateId"),
        Some("iot-cert-1")
    );

    // Offline: within the trust window, the cloud call fails indefinitely
    // and the local decision still authenticates the same presentation.
    cloud.set_force_error(Some(CloudError::Unavailable("network down".into()))).await;
    let session = factory
        .create(&Credentials {
            client_id: "client-1".into(),
            certificate_pem: Some("PEM-C1".into()),
            thing_name: Some("t1".into()),
        })
        .await
        .unwrap();
    assert_eq!(session.get_attribute(AttributeNamespace::Thing, "ThingName"), Some("t1"));

    // With the trust window elapsed (modeled here as a zero-minute
    // window, per the §8 "trust cache expiry" invariant), the same
    // offline presentation is rejected.
    let expired_cloud = Arc::new(MockCloudIdentityClient::new());
    expired_cloud.attach("t1", "PEM-C1", "iot-cert-1").await;
    let expired_registry = Arc::new(ThingRegistry::new(expired_cloud.clone(), 0));
    let now = Utc::now();
    expired_registry.verify_attached("t1", "PEM-C1", true, now).await.unwrap();
    expired_cloud.set_force_error(Some(CloudError::Unavailable("network down".into()))).await;
    let decision = expired_registry
        .verify_attached("t1", "PEM-C1", true, now + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert!(!decision.attached);
}

#[tokio::test]
async fn policy_evaluation_with_variables() {
    let policy = Policy::new("sensor")
        .with_principal_rule("thingName:*")
        .unwrap()
        .with_permission(
            Permission::new("mqtt:*", "mqtt:topic:${Thing:ThingName}").with_variable("Thing", "ThingName"),
        )
        .with_permission(
            Permission::new("shadow:*", "shadow:topic:${iot:Connection.Thing.ThingName}")
                .with_variable("iot", "Connection.Thing.ThingName"),
        );
    let evaluator = PolicyEvaluator::new(vec![policy]);

    let cloud = Arc::new(MockCloudIdentityClient::new());
    cloud.attach("b", "PEM-B", "iot-cert-b").await;
    let certificate_registry = Arc::new(CertificateRegistry::new(cloud.clone(), 10));
    let thing_registry = Arc::new(ThingRegistry::new(cloud, 60));
    let factory = Arc::new(MqttSessionFactory::new(certificate_registry, thing_registry, HashSet::new()));

    let events = Arc::new(DomainEventBus::new());
    let mgr = SessionManager::new(10, events);
    mgr.register_factory("mqtt", factory).await;
    let id = mgr
        .create_session(
            "mqtt",
            Credentials {
                client_id: "client-1".into(),
                certificate_pem: Some("PEM-B".into()),
                thing_name: Some("b".into()),
            },
        )
        .await
        .unwrap();
    let session = mgr.find_session(&id).await.unwrap();

    let (allowed, err) = evaluator.evaluate(&session, "mqtt:publish", "mqtt:topic:b");
    assert!(allowed);
    assert!(err.is_none());

    let (allowed, _) = evaluator.evaluate(&session, "mqtt:publish", "mqtt:topic:a");
    assert!(!allowed);

    // Requesting a resource shaped like the raw variable token is still
    // denied: the permission only ever resolves to "mqtt:topic:b".
    let (allowed, err) = evaluator.evaluate(&session, "mqtt:publish", "mqtt:topic:${Thing:FakeThingName}");
    assert!(!allowed);
    assert!(err.is_none());

    // The spec's literal `${iot:Connection.<Namespace>.<Attribute>}` wire
    // form resolves through the same session attribute.
    let (allowed, err) = evaluator.evaluate(&session, "shadow:get", "shadow:topic:b");
    assert!(allowed);
    assert!(err.is_none());
}
