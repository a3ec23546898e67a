use super::*;
use envoy_types::pb::{
    envoy::config::core::v3::Node,
    google::{protobuf::Any, rpc::Status},
};
use knative_xds_controller_core::{
    Cluster, Listener, Route, SnapshotStore, VirtualHost, WeightedClusterRef,
};
use pretty_assertions::assert_eq;
use prometheus_client::registry::Registry;
use tokio::{sync::mpsc, time};
use tokio_stream::wrappers::UnboundedReceiverStream;

const NODE: &str = "knative";

type Requests = mpsc::UnboundedSender<Result<DiscoveryRequest, tonic::Status>>;

struct Fixture {
    store: SharedSnapshotStore,
    server: AdsServer,
    prom: Registry,
}

fn fixture() -> (Fixture, drain::Signal) {
    let (signal, drain) = drain::channel();
    let store = SnapshotStore::shared();
    let mut prom = Registry::default();
    let metrics = DiscoveryMetrics::register(&mut prom);
    let server = AdsServer::new(store.clone(), metrics, drain);
    (
        Fixture {
            store,
            server,
            prom,
        },
        signal,
    )
}

fn open(server: &AdsServer) -> (Requests, BoxResponseStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let rsps = server.response_stream(UnboundedReceiverStream::new(rx));
    (tx, rsps)
}

fn mk_request(kind: ResourceKind, version: &str, nonce: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        version_info: version.to_string(),
        node: Some(Node {
            id: NODE.to_string(),
            ..Default::default()
        }),
        type_url: kind.type_url().to_string(),
        response_nonce: nonce.to_string(),
        ..Default::default()
    }
}

fn mk_nack(kind: ResourceKind, version: &str, nonce: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        error_detail: Some(Status {
            code: tonic::Code::InvalidArgument as i32,
            message: "rejected".to_string(),
            ..Default::default()
        }),
        ..mk_request(kind, version, nonce)
    }
}

/// Builds a snapshot with one route per service, each split to its own cluster.
fn mk_snapshot(version: &str, services: &[&str]) -> Snapshot {
    let routes = services
        .iter()
        .map(|svc| Route {
            name: format!("knative_{svc}"),
            path_prefix: "/".to_string(),
            weighted_clusters: vec![WeightedClusterRef {
                cluster_name: format!("knative_{svc}-00001"),
                weight: 100,
                request_headers_to_add: vec![],
            }],
        })
        .collect::<Vec<_>>();
    let clusters = services
        .iter()
        .map(|svc| Cluster {
            name: format!("knative_{svc}-00001"),
            endpoints: vec![],
            connect_timeout: time::Duration::from_secs(5),
        })
        .collect();
    let listener = Listener {
        name: "knative_http".to_string(),
        address: [0, 0, 0, 0].into(),
        port: 80,
        virtual_hosts: routes
            .iter()
            .map(|r| VirtualHost {
                name: r.name.clone(),
                domains: vec![format!("{}.example.com", r.name)],
                routes: vec![r.clone()],
            })
            .collect(),
    };
    Snapshot::new(version, clusters, routes, vec![listener])
}

async fn next(rsps: &mut BoxResponseStream) -> DiscoveryResponse {
    time::timeout(time::Duration::from_secs(1), rsps.next())
        .await
        .expect("response must be sent")
        .expect("stream must not end")
        .expect("response must not fail")
}

async fn next_err(rsps: &mut BoxResponseStream) -> tonic::Status {
    time::timeout(time::Duration::from_secs(1), rsps.next())
        .await
        .expect("response must be sent")
        .expect("stream must not end")
        .expect_err("response must fail")
}

/// Returns true if no response is sent for a while.
async fn quiet(rsps: &mut BoxResponseStream) -> bool {
    time::timeout(time::Duration::from_secs(1), rsps.next())
        .await
        .is_err()
}

fn names(rsp: &DiscoveryResponse) -> Vec<String> {
    let decode = |any: &Any| -> String {
        use envoy_types::pb::envoy::config::{
            cluster::v3::Cluster, listener::v3::Listener, route::v3::RouteConfiguration,
        };
        use prost::Message;
        match ResourceKind::from_type_url(&any.type_url) {
            Some(ResourceKind::Cluster) => Cluster::decode(any.value.as_slice()).unwrap().name,
            Some(ResourceKind::Route) => {
                RouteConfiguration::decode(any.value.as_slice()).unwrap().name
            }
            Some(ResourceKind::Listener) => Listener::decode(any.value.as_slice()).unwrap().name,
            kind => panic!("unexpected resource kind: {kind:?}"),
        }
    };
    rsp.resources.iter().map(decode).collect()
}

#[tokio::test(start_paused = true)]
async fn first_request_must_identify_node() {
    let (fx, _signal) = fixture();
    let (tx, mut rsps) = open(&fx.server);

    tx.send(Ok(DiscoveryRequest {
        type_url: ResourceKind::Cluster.type_url().to_string(),
        ..Default::default()
    }))
    .unwrap();

    assert_eq!(next_err(&mut rsps).await.code(), tonic::Code::InvalidArgument);
    assert!(rsps.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn unknown_type_url_is_rejected() {
    let (fx, _signal) = fixture();
    fx.store.set(NODE, mk_snapshot("1", &["hello"])).unwrap();
    let (tx, mut rsps) = open(&fx.server);

    tx.send(Ok(DiscoveryRequest {
        type_url: "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment"
            .to_string(),
        ..mk_request(ResourceKind::Cluster, "", "")
    }))
    .unwrap();

    assert_eq!(next_err(&mut rsps).await.code(), tonic::Code::InvalidArgument);
}

#[tokio::test(start_paused = true)]
async fn sends_snapshot_then_pushes_changes() {
    let (fx, _signal) = fixture();
    fx.store.set(NODE, mk_snapshot("1", &["a", "b"])).unwrap();
    let (tx, mut rsps) = open(&fx.server);

    tx.send(Ok(mk_request(ResourceKind::Cluster, "", ""))).unwrap();
    let rsp = next(&mut rsps).await;
    assert_eq!(rsp.version_info, "1");
    assert_eq!(rsp.type_url, ResourceKind::Cluster.type_url());
    assert_eq!(names(&rsp), vec!["knative_a-00001", "knative_b-00001"]);

    // ACK
    tx.send(Ok(mk_request(ResourceKind::Cluster, "1", &rsp.nonce)))
        .unwrap();
    assert!(quiet(&mut rsps).await);

    fx.store.set(NODE, mk_snapshot("2", &["a"])).unwrap();
    let pushed = next(&mut rsps).await;
    assert_eq!(pushed.version_info, "2");
    assert_ne!(pushed.nonce, rsp.nonce);
    assert_eq!(names(&pushed), vec!["knative_a-00001"]);
}

#[tokio::test(start_paused = true)]
async fn waits_for_first_snapshot() {
    let (fx, _signal) = fixture();
    let (tx, mut rsps) = open(&fx.server);

    tx.send(Ok(mk_request(ResourceKind::Listener, "", ""))).unwrap();
    assert!(quiet(&mut rsps).await);

    fx.store.set(NODE, mk_snapshot("1", &["hello"])).unwrap();
    let rsp = next(&mut rsps).await;
    assert_eq!(rsp.version_info, "1");
    assert_eq!(names(&rsp), vec!["knative_http"]);
}

#[tokio::test(start_paused = true)]
async fn current_version_is_not_resent() {
    let (fx, _signal) = fixture();
    fx.store.set(NODE, mk_snapshot("4", &["hello"])).unwrap();
    let (tx, mut rsps) = open(&fx.server);

    // A proxy reconnecting with the current version has nothing to catch up on.
    tx.send(Ok(mk_request(ResourceKind::Cluster, "4", ""))).unwrap();
    assert!(quiet(&mut rsps).await);
}

#[tokio::test(start_paused = true)]
async fn nacks_wait_for_next_version() {
    let (fx, _signal) = fixture();
    fx.store.set(NODE, mk_snapshot("1", &["hello"])).unwrap();
    let (tx, mut rsps) = open(&fx.server);

    tx.send(Ok(mk_request(ResourceKind::Route, "", ""))).unwrap();
    let rsp = next(&mut rsps).await;

    tx.send(Ok(mk_nack(ResourceKind::Route, "", &rsp.nonce)))
        .unwrap();
    assert!(quiet(&mut rsps).await);

    fx.store.set(NODE, mk_snapshot("2", &["hello"])).unwrap();
    assert_eq!(next(&mut rsps).await.version_info, "2");
}

#[tokio::test(start_paused = true)]
async fn stale_nonces_are_ignored() {
    let (fx, _signal) = fixture();
    fx.store.set(NODE, mk_snapshot("1", &["hello"])).unwrap();
    let (tx, mut rsps) = open(&fx.server);

    tx.send(Ok(mk_request(ResourceKind::Cluster, "", ""))).unwrap();
    let first = next(&mut rsps).await;
    fx.store.set(NODE, mk_snapshot("2", &["hello", "bye"])).unwrap();
    let second = next(&mut rsps).await;

    // A NACK of the superseded response must not affect the stream.
    tx.send(Ok(mk_nack(ResourceKind::Cluster, "", &first.nonce)))
        .unwrap();
    assert!(quiet(&mut rsps).await);

    tx.send(Ok(mk_request(ResourceKind::Cluster, "2", &second.nonce)))
        .unwrap();
    assert!(quiet(&mut rsps).await);
}

#[tokio::test(start_paused = true)]
async fn named_subscriptions_filter_resources() {
    let (fx, _signal) = fixture();
    fx.store
        .set(NODE, mk_snapshot("1", &["hello", "bye"]))
        .unwrap();
    let (tx, mut rsps) = open(&fx.server);

    tx.send(Ok(DiscoveryRequest {
        resource_names: vec!["knative_bye".to_string()],
        ..mk_request(ResourceKind::Route, "", "")
    }))
    .unwrap();
    let rsp = next(&mut rsps).await;
    assert_eq!(names(&rsp), vec!["knative_bye"]);

    // Widening the subscription at the same version resends.
    tx.send(Ok(DiscoveryRequest {
        resource_names: vec!["knative_bye".to_string(), "knative_hello".to_string()],
        ..mk_request(ResourceKind::Route, "1", &rsp.nonce)
    }))
    .unwrap();
    let rsp = next(&mut rsps).await;
    assert_eq!(rsp.version_info, "1");
    assert_eq!(names(&rsp), vec!["knative_hello", "knative_bye"]);
}

#[tokio::test(start_paused = true)]
async fn pushes_every_subscribed_type() {
    let (fx, _signal) = fixture();
    fx.store.set(NODE, mk_snapshot("1", &["hello"])).unwrap();
    let (tx, mut rsps) = open(&fx.server);

    for kind in [ResourceKind::Listener, ResourceKind::Cluster] {
        tx.send(Ok(mk_request(kind, "", ""))).unwrap();
        let rsp = next(&mut rsps).await;
        tx.send(Ok(mk_request(kind, "1", &rsp.nonce))).unwrap();
    }
    assert!(quiet(&mut rsps).await);

    fx.store.set(NODE, mk_snapshot("2", &["hello"])).unwrap();
    let kinds = [next(&mut rsps).await, next(&mut rsps).await]
        .iter()
        .map(|rsp| {
            assert_eq!(rsp.version_info, "2");
            ResourceKind::from_type_url(&rsp.type_url).unwrap()
        })
        .collect::<Vec<_>>();
    assert_eq!(kinds, vec![ResourceKind::Cluster, ResourceKind::Listener]);
}

#[tokio::test(start_paused = true)]
async fn closes_when_client_closes() {
    let (fx, _signal) = fixture();
    let (tx, mut rsps) = open(&fx.server);

    tx.send(Ok(mk_request(ResourceKind::Cluster, "", ""))).unwrap();
    assert!(quiet(&mut rsps).await);
    drop(tx);
    assert!(rsps.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn closes_on_shutdown() {
    let (fx, signal) = fixture();
    let (tx, mut rsps) = open(&fx.server);

    tx.send(Ok(mk_request(ResourceKind::Cluster, "", ""))).unwrap();
    assert!(quiet(&mut rsps).await);

    tokio::spawn(signal.drain());
    let end = time::timeout(time::Duration::from_secs(1), rsps.next())
        .await
        .expect("stream must close");
    assert!(end.is_none());
}

#[tokio::test(start_paused = true)]
async fn request_errors_end_the_stream_with_their_status() {
    let (fx, _signal) = fixture();
    fx.store.set(NODE, mk_snapshot("1", &["hello"])).unwrap();
    let (tx, mut rsps) = open(&fx.server);

    tx.send(Ok(mk_request(ResourceKind::Cluster, "", ""))).unwrap();
    assert_eq!(next(&mut rsps).await.version_info, "1");

    tx.send(Err(tonic::Status::data_loss("connection reset")))
        .unwrap();
    assert_eq!(next_err(&mut rsps).await.code(), tonic::Code::DataLoss);
    assert!(rsps.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn records_stream_metrics() {
    let (fx, _signal) = fixture();
    fx.store.set(NODE, mk_snapshot("1", &["hello"])).unwrap();
    let (tx, mut rsps) = open(&fx.server);

    tx.send(Ok(mk_request(ResourceKind::Cluster, "", ""))).unwrap();
    let rsp = next(&mut rsps).await;
    tx.send(Ok(mk_nack(ResourceKind::Cluster, "1", &rsp.nonce)))
        .unwrap();
    assert!(quiet(&mut rsps).await);
    drop(tx);
    assert!(rsps.next().await.is_none());
    drop(rsps);

    let mut out = String::new();
    prometheus_client::encoding::text::encode(&mut out, &fx.prom).unwrap();
    let cluster = format!(r#"{{type_url="{}"}}"#, ResourceKind::Cluster.type_url());
    for line in [
        "streams_opened_total 1".to_string(),
        "streams 0".to_string(),
        r#"streams_closed_total{grpc_code="OK"} 1"#.to_string(),
        format!("requests_total{cluster} 2"),
        format!("nacks_total{cluster} 1"),
        format!("responses_total{cluster} 1"),
        format!("resources_sent_total{cluster} 1"),
    ] {
        assert!(out.contains(&line), "missing {line:?} in:\n{out}");
    }
}
