use super::*;
use crate::routes::Index;
use knative_xds_controller_core::{RoutableService, TrafficSplit};
use kubert::index::IndexNamespacedResource;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn route_status_becomes_routable_service() {
    let changes = Changes::new();
    let index = Index::shared(changes.clone());

    index.write().apply(mk_route(
        "default",
        "hello",
        Some("http://hello.default.example.com"),
        vec![mk_target("hello-00002", 90), mk_target("hello-00001", 10)],
    ));
    assert!(signaled(&changes).await);

    assert_eq!(
        index.read().services(None),
        vec![RoutableService {
            name: "hello".to_string(),
            namespace: "default".to_string(),
            external_host: Some("hello.default.example.com".to_string()),
            traffic: vec![
                TrafficSplit {
                    revision: "hello-00002".to_string(),
                    percent: 90,
                },
                TrafficSplit {
                    revision: "hello-00001".to_string(),
                    percent: 10,
                },
            ],
        }]
    );
}

#[tokio::test]
async fn route_without_url_is_unroutable() {
    let index = Index::shared(Changes::new());

    index
        .write()
        .apply(mk_route("default", "pending", None, vec![mk_target("pending-1", 100)]));
    index.write().apply(mk_route(
        "default",
        "bogus",
        Some("not a url"),
        vec![mk_target("bogus-1", 100)],
    ));

    let services = index.read().services(None);
    assert_eq!(services.len(), 2);
    assert!(services.iter().all(|s| s.external_host.is_none()));
}

#[tokio::test]
async fn unresolved_targets_are_dropped() {
    let index = Index::shared(Changes::new());
    let unresolved = k8s::TrafficTarget {
        configuration_name: Some("hello".to_string()),
        percent: Some(50),
        ..Default::default()
    };

    index.write().apply(mk_route(
        "default",
        "hello",
        Some("http://hello.default.example.com"),
        vec![unresolved, mk_target("hello-00001", 50)],
    ));

    let services = index.read().services(None);
    assert_eq!(
        services[0].traffic,
        vec![TrafficSplit {
            revision: "hello-00001".to_string(),
            percent: 50,
        }]
    );
}

#[tokio::test]
async fn lists_in_namespace_then_name_order() {
    let index = Index::shared(Changes::new());
    for (ns, name) in [("ns-b", "a"), ("ns-a", "z"), ("ns-a", "b")] {
        index.write().apply(mk_route(
            ns,
            name,
            Some(format!("http://{name}.{ns}.example.com").as_str()),
            vec![mk_target("rev", 100)],
        ));
    }

    let names = |ns| {
        index
            .read()
            .services(ns)
            .into_iter()
            .map(|s| format!("{}/{}", s.namespace, s.name))
            .collect::<Vec<_>>()
    };
    assert_eq!(names(None), vec!["ns-a/b", "ns-a/z", "ns-b/a"]);
    assert_eq!(names(Some("ns-b")), vec!["ns-b/a"]);
    assert!(names(Some("ns-c")).is_empty());
}

#[tokio::test]
async fn only_changes_are_signaled() {
    let changes = Changes::new();
    let index = Index::shared(changes.clone());
    let route = mk_route(
        "default",
        "hello",
        Some("http://hello.default.example.com"),
        vec![mk_target("hello-00001", 100)],
    );

    index.write().apply(route.clone());
    assert!(signaled(&changes).await);

    // Resyncs of an unchanged route do not trigger a rebuild.
    index.write().apply(route);
    assert!(!signaled(&changes).await);

    index
        .write()
        .delete("default".to_string(), "hello".to_string());
    assert!(signaled(&changes).await);
    assert!(index.read().services(None).is_empty());

    // Deleting an unknown route is a no-op.
    index
        .write()
        .delete("default".to_string(), "hello".to_string());
    assert!(!signaled(&changes).await);
}

#[tokio::test]
async fn initial_listing_marks_index_synced() {
    let changes = Changes::new();
    let index = Index::shared(changes.clone());
    let synced = index.read().synced();
    assert!(!synced.is_synced());

    index.write().apply(mk_route(
        "default",
        "stale",
        Some("http://stale.default.example.com"),
        vec![mk_target("stale-00001", 100)],
    ));
    assert!(signaled(&changes).await);
    assert!(!synced.is_synced(), "watch events before the initial list do not sync");

    let mut removed = kubert::index::NamespacedRemoved::default();
    removed.insert(
        "default".to_string(),
        std::iter::once("stale".to_string()).collect(),
    );
    index.write().reset(
        vec![mk_route(
            "default",
            "hello",
            Some("http://hello.default.example.com"),
            vec![mk_target("hello-00001", 100)],
        )],
        removed,
    );

    assert!(synced.is_synced());
    assert!(signaled(&changes).await);
    let names = index
        .read()
        .services(None)
        .into_iter()
        .map(|s| s.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["hello".to_string()]);
}
