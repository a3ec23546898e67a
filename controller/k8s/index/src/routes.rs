use knative_xds_controller_core::{Changes, RoutableService, Synced, TrafficSplit};
use knative_xds_controller_k8s_api::{self as k8s, ResourceExt};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

/// Indexes Knative routes as routable services, keyed by namespace and name.
#[derive(Debug)]
pub struct Index {
    services: BTreeMap<(String, String), RoutableService>,
    changes: Changes,
    synced: Synced,
}

pub type SharedIndex = Arc<RwLock<Index>>;

// === impl Index ===

impl Index {
    pub fn shared(changes: Changes) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            services: BTreeMap::new(),
            changes,
            synced: Synced::new(),
        }))
    }

    /// Marked once the initial list of routes has been indexed.
    pub fn synced(&self) -> Synced {
        self.synced.clone()
    }

    /// Lists services in the given namespace, or in all namespaces, ordered by namespace and
    /// name.
    pub fn services(&self, namespace: Option<&str>) -> Vec<RoutableService> {
        self.services
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |n| n == ns))
            .map(|(_, svc)| svc.clone())
            .collect()
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Route> for Index {
    fn apply(&mut self, route: k8s::Route) {
        let namespace = route.namespace().expect("Route must have a namespace");
        let name = route.name_unchecked();
        let svc = routable_service(namespace.clone(), name.clone(), route.status.as_ref());

        let key = (namespace, name);
        if self.services.get(&key) == Some(&svc) {
            return;
        }
        tracing::debug!(namespace = %key.0, name = %key.1, host = ?svc.external_host, splits = svc.traffic.len(), "Indexed route");
        self.services.insert(key, svc);
        self.changes.notify();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.services.remove(&(namespace, name)).is_some() {
            self.changes.notify();
        }
    }

    fn reset(
        &mut self,
        routes: Vec<k8s::Route>,
        removed: kubert::index::NamespacedRemoved,
    ) {
        for route in routes {
            self.apply(route);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete(namespace.clone(), name);
            }
        }
        self.synced.mark();
    }
}

fn routable_service(
    namespace: String,
    name: String,
    status: Option<&k8s::RouteStatus>,
) -> RoutableService {
    let external_host = status
        .and_then(|s| s.url.as_deref())
        .and_then(url_host);

    // Only the status carries traffic targets that have been resolved to revisions.
    let traffic = status
        .and_then(|s| s.traffic.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|target| {
            let Some(revision) = target.revision_name.clone().filter(|r| !r.is_empty()) else {
                tracing::debug!(%namespace, %name, ?target, "Ignoring unresolved traffic target");
                return None;
            };
            let percent = target.percent.unwrap_or(0).clamp(0, u32::MAX as i64) as u32;
            Some(TrafficSplit { revision, percent })
        })
        .collect();

    RoutableService {
        name,
        namespace,
        external_host,
        traffic,
    }
}

fn url_host(url: &str) -> Option<String> {
    let uri = url.parse::<http::Uri>().ok()?;
    uri.host()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_string())
}
