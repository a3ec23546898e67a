//! Translates routable services and revision endpoints into proxy configuration.
//!
//! Translation is a pure function of its inputs: given the same services (in the same order) and
//! the same resolver responses it always produces the same output. Versioning happens elsewhere.

use crate::{
    cluster_name, route_name, Cluster, Endpoint, HeaderAppend, Listener, ResolveEndpoints,
    ResolveError, RoutableService, Route, VirtualHost, WeightedClusterRef, NAMESPACE_HEADER,
    REVISION_HEADER,
};
use ahash::AHashMap as HashMap;
use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt,
    net::{IpAddr, Ipv4Addr},
    time,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslateConfig {
    pub listener_name: String,
    pub listener_address: IpAddr,
    pub listener_port: u16,
    pub connect_timeout: time::Duration,
}

/// The output of a single translation pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Translation {
    /// Clusters, ordered by name.
    pub clusters: Vec<Cluster>,

    /// Routes, in service listing order.
    pub routes: Vec<Route>,

    pub listeners: Vec<Listener>,

    /// Non-fatal problems encountered while translating.
    pub warnings: Vec<TranslateWarning>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TranslateWarning {
    /// A split's revision could not be resolved, so the split was left out of its route.
    Unresolved {
        namespace: String,
        service: String,
        revision: String,
        error: ResolveError,
    },

    /// None of a routable service's splits could be used, so it was not routed.
    NoBackends { namespace: String, service: String },
}

// === impl TranslateConfig ===

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            listener_name: "knative_http".to_string(),
            listener_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listener_port: 80,
            connect_timeout: time::Duration::from_secs(5),
        }
    }
}

// === impl TranslateWarning ===

impl fmt::Display for TranslateWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved {
                namespace,
                service,
                revision,
                error,
            } => write!(
                f,
                "service {namespace}/{service}: dropping split to revision {revision}: {error}"
            ),
            Self::NoBackends { namespace, service } => {
                write!(f, "service {namespace}/{service} has no usable traffic splits")
            }
        }
    }
}

/// Builds clusters, routes, and a listener from the given services.
///
/// Services without an external host are skipped. A split whose revision fails to resolve is
/// omitted from its route and reported as a warning; its cluster is still emitted, without
/// endpoints, unless another split resolved the same cluster in this pass.
pub fn translate<R>(
    config: &TranslateConfig,
    services: &[RoutableService],
    resolver: &R,
) -> Translation
where
    R: ResolveEndpoints + ?Sized,
{
    let mut resolved = HashMap::<(&str, &str), Result<Vec<Endpoint>, ResolveError>>::new();
    let mut clusters = BTreeMap::<String, Cluster>::new();
    let mut routes = Vec::new();
    let mut virtual_hosts = Vec::new();
    let mut warnings = Vec::new();

    for svc in services {
        let Some(host) = svc.external_host.as_deref().filter(|h| !h.is_empty()) else {
            tracing::debug!(namespace = %svc.namespace, service = %svc.name, "Skipping service without an external host");
            continue;
        };

        let mut weighted_clusters = Vec::with_capacity(svc.traffic.len());
        for split in &svc.traffic {
            let name = cluster_name(&split.revision);
            let endpoints = resolved
                .entry((svc.namespace.as_str(), split.revision.as_str()))
                .or_insert_with(|| resolver.resolve_endpoints(&svc.namespace, &split.revision));

            match endpoints {
                Ok(endpoints) => {
                    clusters.insert(
                        name.clone(),
                        Cluster {
                            name: name.clone(),
                            endpoints: endpoints.clone(),
                            connect_timeout: config.connect_timeout,
                        },
                    );
                }
                Err(error) => {
                    if let Entry::Vacant(entry) = clusters.entry(name.clone()) {
                        entry.insert(Cluster {
                            name,
                            endpoints: Vec::new(),
                            connect_timeout: config.connect_timeout,
                        });
                    }
                    warnings.push(TranslateWarning::Unresolved {
                        namespace: svc.namespace.clone(),
                        service: svc.name.clone(),
                        revision: split.revision.clone(),
                        error: error.clone(),
                    });
                    continue;
                }
            }

            weighted_clusters.push(WeightedClusterRef {
                cluster_name: name,
                weight: split.percent,
                request_headers_to_add: vec![
                    HeaderAppend {
                        name: NAMESPACE_HEADER.to_string(),
                        value: svc.namespace.clone(),
                    },
                    HeaderAppend {
                        name: REVISION_HEADER.to_string(),
                        value: split.revision.clone(),
                    },
                ],
            });
        }

        if weighted_clusters.is_empty() {
            warnings.push(TranslateWarning::NoBackends {
                namespace: svc.namespace.clone(),
                service: svc.name.clone(),
            });
            continue;
        }

        let route = Route {
            name: route_name(&svc.name),
            path_prefix: "/".to_string(),
            weighted_clusters,
        };
        virtual_hosts.push(VirtualHost {
            name: svc.name.clone(),
            domains: vec![host.to_string()],
            routes: vec![route.clone()],
        });
        routes.push(route);
    }

    let listener = Listener {
        name: config.listener_name.clone(),
        address: config.listener_address,
        port: config.listener_port,
        virtual_hosts,
    };

    Translation {
        clusters: clusters.into_values().collect(),
        routes,
        listeners: vec![listener],
        warnings,
    }
}
