//! Fixtures and end-to-end scenarios driven through the watch interface
//! against the in-memory cloud.

use crate::{
    events::RecordingEventSink, Cache, Features, Index, Metrics, NegNamer, SharedIndex,
    SyncerManager,
};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use neg_controller_core::{
    cloud::fake::{FakeNegCloud, Op},
    Backoff, CloudError, Endpoint, ServiceKey, SyncerKey, TargetPort,
};
use neg_controller_k8s_api as k8s;
use std::{num::NonZeroU16, sync::Arc, time::Duration};

pub(crate) const CLUSTER_UID: &str = "0123456789abcdef";

pub(crate) fn mk_service(
    namespace: &str,
    name: &str,
    ports: Vec<(u16, Option<&str>)>,
) -> k8s::Service {
    k8s::Service {
        metadata: k8s::ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::ServiceSpec {
            ports: Some(
                ports
                    .into_iter()
                    .map(|(port, target)| k8s::ServicePort {
                        port: i32::from(port),
                        name: target.map(ToString::to_string),
                        target_port: target.map(|t| k8s::IntOrString::String(t.to_string())),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn mk_endpoints(
    namespace: &str,
    name: &str,
    ready: &[(&str, &str)],
    not_ready: &[(&str, &str)],
    ports: &[(Option<&str>, u16)],
) -> k8s::Endpoints {
    let address = |&(ip, node): &(&str, &str)| k8s::EndpointAddress {
        ip: ip.to_string(),
        node_name: Some(node.to_string()),
        ..Default::default()
    };
    k8s::Endpoints {
        metadata: k8s::ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![k8s::EndpointSubset {
            addresses: Some(ready.iter().map(address).collect()),
            not_ready_addresses: Some(not_ready.iter().map(address).collect()),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| k8s::EndpointPort {
                        name: name.map(ToString::to_string),
                        port: i32::from(*port),
                        ..Default::default()
                    })
                    .collect(),
            ),
        }]),
    }
}

pub(crate) fn mk_node(name: &str, zone: Option<&str>, ready: bool) -> k8s::Node {
    k8s::Node {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            labels: zone.map(|zone| {
                [("topology.kubernetes.io/zone".to_string(), zone.to_string())]
                    .into_iter()
                    .collect()
            }),
            ..Default::default()
        },
        status: Some(k8s::api::core::v1::NodeStatus {
            conditions: Some(vec![k8s::NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn mk_ingress(namespace: &str, name: &str, service: &str, port: u16) -> k8s::Ingress {
    k8s::Ingress {
        metadata: k8s::ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::api::networking::v1::IngressSpec {
            default_backend: Some(k8s::IngressBackend {
                service: Some(k8s::IngressServiceBackend {
                    name: service.to_string(),
                    port: Some(k8s::ServiceBackendPort {
                        number: Some(i32::from(port)),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn endpoint(ip: &str, port: u16, node: &str) -> Endpoint {
    Endpoint {
        ip: ip.parse().unwrap(),
        port: NonZeroU16::new(port).unwrap(),
        node: node.to_string(),
    }
}

pub(crate) async fn eventually(what: &str, f: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

/// Runs GC passes, the way the periodic task would, until `done` holds.
async fn gc_until(harness: &Harness, done: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            harness.manager.gc().await.expect("gc");
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for garbage collection");
}

/// Wires a full controller against the fake cloud and drives it through the
/// same interface the watches use.
pub(crate) struct Harness {
    pub cloud: Arc<FakeNegCloud>,
    pub manager: Arc<SyncerManager>,
    pub events: Arc<RecordingEventSink>,
    pub metrics: Metrics,
    pub namer: NegNamer,
    index: SharedIndex,
}

// === impl Harness ===

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_features(Features::default())
    }

    pub(crate) fn with_features(features: Features) -> Self {
        let cloud = Arc::new(FakeNegCloud::default());
        let cache = Cache::new();
        let events = Arc::new(RecordingEventSink::default());
        let metrics = Metrics::default();
        let namer = NegNamer::new(CLUSTER_UID);
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100), 3);
        let manager = Arc::new(SyncerManager::new(
            namer.clone(),
            cloud.clone(),
            cache.clone(),
            events.clone(),
            metrics.clone(),
            backoff,
        ));
        let index = Index::shared(cache, manager.clone(), features, events.clone());
        Self {
            cloud,
            manager,
            events,
            metrics,
            namer,
            index,
        }
    }

    pub(crate) fn apply_service(&self, svc: k8s::Service) {
        IndexNamespacedResource::<k8s::Service>::apply(&mut *self.index.write(), svc);
    }

    pub(crate) fn delete_service(&self, namespace: &str, name: &str) {
        IndexNamespacedResource::<k8s::Service>::delete(
            &mut *self.index.write(),
            namespace.to_string(),
            name.to_string(),
        );
    }

    pub(crate) fn apply_endpoints(&self, eps: k8s::Endpoints) {
        IndexNamespacedResource::<k8s::Endpoints>::apply(&mut *self.index.write(), eps);
    }

    pub(crate) fn delete_endpoints(&self, namespace: &str, name: &str) {
        IndexNamespacedResource::<k8s::Endpoints>::delete(
            &mut *self.index.write(),
            namespace.to_string(),
            name.to_string(),
        );
    }

    pub(crate) fn apply_node(&self, node: k8s::Node) {
        IndexClusterResource::<k8s::Node>::apply(&mut *self.index.write(), node);
    }

    pub(crate) fn apply_ingress(&self, ingress: k8s::Ingress) {
        IndexNamespacedResource::<k8s::Ingress>::apply(&mut *self.index.write(), ingress);
    }

    pub(crate) fn neg_name(&self, namespace: &str, name: &str, port: u16) -> String {
        self.namer
            .neg(namespace, name, NonZeroU16::new(port).unwrap())
    }

    /// Seeds two ready nodes in `us-a`/`us-b`, the annotated service, and an
    /// endpoints object with one pod per node.
    fn seed_two_zone_service(&self, annotation: &str) {
        self.apply_node(mk_node("node-a", Some("us-a"), true));
        self.apply_node(mk_node("node-b", Some("us-b"), true));

        let mut svc = mk_service("default", "foo", vec![(80, Some("http")), (443, Some("https"))]);
        svc.metadata.annotations = Some(
            [(crate::annotations::NEG_ANNOTATION_KEY.to_string(), annotation.to_string())]
                .into_iter()
                .collect(),
        );
        self.apply_service(svc);

        self.apply_endpoints(mk_endpoints(
            "default",
            "foo",
            &[("10.0.0.1", "node-a"), ("10.0.0.2", "node-b")],
            &[],
            &[(Some("http"), 8080), (Some("https"), 8443)],
        ));
    }
}

fn syncer_key(port: u16, target: &str) -> SyncerKey {
    SyncerKey {
        namespace: "default".to_string(),
        name: "foo".to_string(),
        port: NonZeroU16::new(port).unwrap(),
        target_port: TargetPort::Name(target.to_string()),
    }
}

#[tokio::test(start_paused = true)]
async fn exposed_service_converges_per_zone() {
    let harness = Harness::new();
    harness.seed_two_zone_service(r#"{"exposed_ports":{"80":{},"443":{}}}"#);

    eventually("two syncers", || harness.manager.running().len() == 2).await;
    assert_eq!(
        {
            let mut keys = harness.manager.running();
            keys.sort_by_key(|k| k.port);
            keys
        },
        vec![syncer_key(80, "http"), syncer_key(443, "https")]
    );

    let neg80 = harness.neg_name("default", "foo", 80);
    let neg443 = harness.neg_name("default", "foo", 443);
    eventually("NEGs in both zones", || {
        [&neg80, &neg443]
            .iter()
            .all(|neg| ["us-a", "us-b"].iter().all(|z| harness.cloud.neg(neg, z).is_some()))
    })
    .await;

    eventually("endpoints placed by zone", || {
        harness.cloud.endpoints(&neg80, "us-a")
            == [endpoint("10.0.0.1", 8080, "node-a")].into_iter().collect()
            && harness.cloud.endpoints(&neg80, "us-b")
                == [endpoint("10.0.0.2", 8080, "node-b")].into_iter().collect()
            && harness.cloud.endpoints(&neg443, "us-a")
                == [endpoint("10.0.0.1", 8443, "node-a")].into_iter().collect()
            && harness.cloud.endpoints(&neg443, "us-b")
                == [endpoint("10.0.0.2", 8443, "node-b")].into_iter().collect()
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn narrowing_the_annotation_stops_and_collects() {
    let harness = Harness::new();
    harness.seed_two_zone_service(r#"{"exposed_ports":{"80":{},"443":{}}}"#);

    let neg80 = harness.neg_name("default", "foo", 80);
    let neg443 = harness.neg_name("default", "foo", 443);
    eventually("NEGs exist", || {
        harness.cloud.neg(&neg443, "us-a").is_some() && harness.cloud.neg(&neg80, "us-a").is_some()
    })
    .await;

    // Drop 443 from the annotation: its syncer stops, and the next GC pass
    // removes its NEGs in both zones while leaving 80 alone.
    let mut svc = mk_service("default", "foo", vec![(80, Some("http")), (443, Some("https"))]);
    svc.metadata.annotations = Some(
        [(
            crate::annotations::NEG_ANNOTATION_KEY.to_string(),
            r#"{"exposed_ports":{"80":{}}}"#.to_string(),
        )]
        .into_iter()
        .collect(),
    );
    harness.apply_service(svc);

    eventually("443 syncer stopped", || {
        harness.manager.running() == vec![syncer_key(80, "http")]
    })
    .await;

    // The stopped worker is collected once it has fully exited; keep
    // collecting the way the periodic pass would.
    gc_until(&harness, || {
        harness.manager.registered() == vec![syncer_key(80, "http")]
    })
    .await;

    for zone in ["us-a", "us-b"] {
        assert!(harness.cloud.neg(&neg443, zone).is_none(), "{} in {}", neg443, zone);
        assert!(harness.cloud.neg(&neg80, zone).is_some());
    }
}

#[tokio::test(start_paused = true)]
async fn deleting_the_service_collects_everything_and_recreation_is_fresh() {
    let harness = Harness::new();
    harness.seed_two_zone_service(r#"{"exposed_ports":{"80":{}}}"#);

    let neg80 = harness.neg_name("default", "foo", 80);
    eventually("NEG exists", || harness.cloud.neg(&neg80, "us-a").is_some()).await;

    harness.delete_service("default", "foo");
    eventually("syncers stopped", || harness.manager.running().is_empty()).await;

    gc_until(&harness, || harness.manager.registered().is_empty()).await;
    for zone in ["us-a", "us-b"] {
        assert!(harness.cloud.neg(&neg80, zone).is_none());
    }

    // Recreating the service produces a fresh syncer and recreates the NEGs.
    harness.seed_two_zone_service(r#"{"exposed_ports":{"80":{}}}"#);
    eventually("NEG recreated", || {
        ["us-a", "us-b"].iter().all(|z| harness.cloud.neg(&neg80, z).is_some())
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn transient_attach_failures_back_off_and_converge() {
    let harness = Harness::new();
    for _ in 0..3 {
        harness
            .cloud
            .fail_next(Op::Attach, CloudError::Transient("503 backend error".into()));
    }

    harness.apply_node(mk_node("node-a", Some("us-a"), true));
    let mut svc = mk_service("default", "foo", vec![(80, Some("http"))]);
    svc.metadata.annotations = Some(
        [(
            crate::annotations::NEG_ANNOTATION_KEY.to_string(),
            r#"{"exposed_ports":{"80":{}}}"#.to_string(),
        )]
        .into_iter()
        .collect(),
    );
    harness.apply_endpoints(mk_endpoints(
        "default",
        "foo",
        &[("10.0.0.1", "node-a")],
        &[],
        &[(Some("http"), 8080)],
    ));
    harness.apply_service(svc);

    let neg80 = harness.neg_name("default", "foo", 80);
    eventually("endpoints attached after retries", || {
        harness.cloud.endpoints(&neg80, "us-a")
            == [endpoint("10.0.0.1", 8080, "node-a")].into_iter().collect()
    })
    .await;

    // Three failed attaches plus the one that landed.
    assert_eq!(harness.cloud.calls(Op::Attach), 4);
    assert!(harness.metrics.syncs_total() >= 4);
}

#[tokio::test(start_paused = true)]
async fn ingress_intent_without_a_referencing_ingress_is_inert() {
    let harness = Harness::new();
    harness.apply_node(mk_node("node-a", Some("us-a"), true));

    let mut svc = mk_service("default", "foo", vec![(80, Some("http"))]);
    svc.metadata.annotations = Some(
        [(
            crate::annotations::NEG_ANNOTATION_KEY.to_string(),
            r#"{"ingress":true}"#.to_string(),
        )]
        .into_iter()
        .collect(),
    );
    harness.apply_service(svc);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(harness.manager.running().is_empty());
    assert!(harness.cloud.all_neg_names().is_empty());

    // Once an Ingress routes to the service, its port gets a syncer.
    harness.apply_ingress(mk_ingress("default", "web", "foo", 80));
    eventually("ingress-driven syncer", || {
        harness.manager.running() == vec![syncer_key(80, "http")]
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn http2_without_the_feature_gate_warns_but_serves() {
    let harness = Harness::new();
    harness.apply_node(mk_node("node-a", Some("us-a"), true));

    let mut svc = mk_service("default", "foo", vec![(443, Some("https"))]);
    svc.metadata.annotations = Some(
        [
            (
                crate::annotations::NEG_ANNOTATION_KEY.to_string(),
                r#"{"exposed_ports":{"443":{}}}"#.to_string(),
            ),
            (
                crate::annotations::APP_PROTOCOLS_KEY.to_string(),
                r#"{"443": "HTTP2"}"#.to_string(),
            ),
        ]
        .into_iter()
        .collect(),
    );
    harness.apply_service(svc);

    eventually("annotation warning", || {
        harness.events.reasons().contains(&"InvalidAnnotation")
    })
    .await;
    eventually("service still gets its syncer", || {
        harness.manager.running() == vec![syncer_key(443, "https")]
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn missing_endpoints_object_empties_but_keeps_the_neg() {
    let harness = Harness::new();
    harness.seed_two_zone_service(r#"{"exposed_ports":{"80":{}}}"#);

    let neg80 = harness.neg_name("default", "foo", 80);
    eventually("endpoints attached", || {
        !harness.cloud.endpoints(&neg80, "us-a").is_empty()
    })
    .await;

    harness.delete_endpoints("default", "foo");
    eventually("all endpoints detached", || {
        harness.cloud.endpoints(&neg80, "us-a").is_empty()
            && harness.cloud.endpoints(&neg80, "us-b").is_empty()
    })
    .await;
    // The NEGs themselves survive until the syncer is stopped and GC runs.
    assert!(harness.cloud.neg(&neg80, "us-a").is_some());
    assert!(harness.cloud.neg(&neg80, "us-b").is_some());
}

mod calculator {
    use super::*;
    use crate::endpoints::desired_state;

    fn cache_with(
        svc: Option<k8s::Service>,
        eps: Option<k8s::Endpoints>,
        nodes: &[(&str, Option<&str>, bool)],
    ) -> Cache {
        let cache = Cache::new();
        if let Some(svc) = svc {
            cache.apply_service(ServiceKey::new("default", "foo"), svc);
        }
        if let Some(eps) = eps {
            cache.apply_endpoints(ServiceKey::new("default", "foo"), eps);
        }
        for (name, zone, ready) in nodes {
            cache.apply_node(&mk_node(name, *zone, *ready));
        }
        cache
    }

    fn annotated_service() -> k8s::Service {
        let mut svc = mk_service("default", "foo", vec![(80, Some("http"))]);
        svc.metadata.annotations = Some(
            [(
                crate::annotations::NEG_ANNOTATION_KEY.to_string(),
                r#"{"exposed_ports":{"80":{}}}"#.to_string(),
            )]
            .into_iter()
            .collect(),
        );
        svc
    }

    #[test]
    fn groups_ready_addresses_by_zone() {
        let cache = cache_with(
            Some(annotated_service()),
            Some(mk_endpoints(
                "default",
                "foo",
                &[
                    ("10.0.0.1", "node-a"),
                    ("10.0.0.2", "node-b"),
                    ("10.0.0.3", "node-a"),
                ],
                &[("10.0.9.9", "node-a")],
                &[(Some("http"), 8080)],
            )),
            &[
                ("node-a", Some("us-a"), true),
                ("node-b", Some("us-b"), true),
            ],
        );
        let metrics = Metrics::default();
        let key = syncer_key(80, "http");

        let desired = cache.with_state(|state| desired_state(state, &key, &metrics));
        assert_eq!(desired.len(), 2);
        assert_eq!(
            desired["us-a"],
            [
                endpoint("10.0.0.1", 8080, "node-a"),
                endpoint("10.0.0.3", 8080, "node-a"),
            ]
            .into_iter()
            .collect()
        );
        assert_eq!(
            desired["us-b"],
            [endpoint("10.0.0.2", 8080, "node-b")].into_iter().collect()
        );

        // Identical snapshots produce identical maps.
        let again = cache.with_state(|state| desired_state(state, &key, &metrics));
        assert_eq!(desired, again);
    }

    #[test]
    fn numeric_target_matches_by_port_number() {
        let mut svc = mk_service("default", "foo", vec![(80, None)]);
        svc.metadata.annotations = Some(
            [(
                crate::annotations::NEG_ANNOTATION_KEY.to_string(),
                r#"{"exposed_ports":{"80":{}}}"#.to_string(),
            )]
            .into_iter()
            .collect(),
        );
        let cache = cache_with(
            Some(svc),
            Some(mk_endpoints(
                "default",
                "foo",
                &[("10.0.0.1", "node-a")],
                &[],
                &[(None, 80)],
            )),
            &[("node-a", Some("us-a"), true)],
        );
        let metrics = Metrics::default();
        let key = SyncerKey {
            namespace: "default".into(),
            name: "foo".into(),
            port: NonZeroU16::new(80).unwrap(),
            target_port: TargetPort::Number(NonZeroU16::new(80).unwrap()),
        };

        let desired = cache.with_state(|state| desired_state(state, &key, &metrics));
        assert_eq!(
            desired["us-a"],
            [endpoint("10.0.0.1", 80, "node-a")].into_iter().collect()
        );
    }

    #[test]
    fn unresolvable_nodes_are_skipped_and_counted() {
        let cache = cache_with(
            Some(annotated_service()),
            Some(mk_endpoints(
                "default",
                "foo",
                &[("10.0.0.1", "node-a"), ("10.0.0.2", "node-gone")],
                &[],
                &[(Some("http"), 8080)],
            )),
            &[("node-a", Some("us-a"), true)],
        );
        let metrics = Metrics::default();
        let key = syncer_key(80, "http");

        let desired = cache.with_state(|state| desired_state(state, &key, &metrics));
        assert_eq!(desired.len(), 1);
        assert_eq!(desired["us-a"].len(), 1);
    }

    #[test]
    fn missing_pieces_empty_the_map() {
        let metrics = Metrics::default();
        let key = syncer_key(80, "http");

        // No service.
        let cache = cache_with(None, None, &[("node-a", Some("us-a"), true)]);
        assert!(cache
            .with_state(|state| desired_state(state, &key, &metrics))
            .is_empty());

        // Service present but NEG-disabled.
        let cache = cache_with(
            Some(mk_service("default", "foo", vec![(80, Some("http"))])),
            None,
            &[],
        );
        assert!(cache
            .with_state(|state| desired_state(state, &key, &metrics))
            .is_empty());

        // Annotated service, no endpoints object.
        let cache = cache_with(Some(annotated_service()), None, &[]);
        assert!(cache
            .with_state(|state| desired_state(state, &key, &metrics))
            .is_empty());

        // Port no longer declared by the service.
        let mut svc = annotated_service();
        svc.spec.as_mut().unwrap().ports = Some(vec![]);
        let cache = cache_with(Some(svc), None, &[]);
        assert!(cache
            .with_state(|state| desired_state(state, &key, &metrics))
            .is_empty());
    }
}
