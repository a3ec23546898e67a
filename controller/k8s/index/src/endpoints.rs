use ahash::AHashMap as HashMap;
use knative_xds_controller_core::{Changes, Endpoint, ResolveError, Synced};
use knative_xds_controller_k8s_api::{self as k8s, labels, EndpointPort, ResourceExt};
use parking_lot::RwLock;
use std::{collections::BTreeMap, net::IpAddr, sync::Arc};

/// Port names that identify a revision's HTTP port, in order of preference.
const HTTP_PORT_NAMES: [&str; 3] = ["http", "http2", "h2c"];

/// Indexes the endpoint slices of each revision's service.
#[derive(Debug)]
pub struct Index {
    /// Slices by revision, then by slice name.
    revisions: HashMap<RevisionRef, BTreeMap<String, Slice>>,

    /// The revision each slice was last indexed under.
    slices: HashMap<(String, String), RevisionRef>,

    changes: Changes,
    synced: Synced,
}

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RevisionRef {
    namespace: String,
    name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Slice {
    port: Result<u16, ResolveError>,
    addresses: Vec<IpAddr>,
}

// === impl Index ===

impl Index {
    pub fn shared(changes: Changes) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            revisions: HashMap::new(),
            slices: HashMap::new(),
            changes,
            synced: Synced::new(),
        }))
    }

    /// Marked once the initial list of endpoint slices has been indexed.
    pub fn synced(&self) -> Synced {
        self.synced.clone()
    }

    /// Returns the ready endpoints of a revision on its HTTP port, sorted by address.
    ///
    /// Slices whose ports cannot be resolved are skipped. The revision fails to resolve only when
    /// every slice that has addresses fails.
    pub fn endpoints(&self, namespace: &str, revision: &str) -> Result<Vec<Endpoint>, ResolveError> {
        let slices = self
            .revisions
            .get(&RevisionRef {
                namespace: namespace.to_string(),
                name: revision.to_string(),
            })
            .filter(|slices| !slices.is_empty())
            .ok_or_else(|| ResolveError::NotFound {
                namespace: namespace.to_string(),
                revision: revision.to_string(),
            })?;

        // Slices without addresses contribute nothing, so their ports are never consulted. A
        // port error only fails the revision when no slice with addresses has a usable port.
        let mut endpoints = Vec::new();
        let mut resolved = false;
        let mut failure = None;
        for (name, slice) in slices.iter().filter(|(_, s)| !s.addresses.is_empty()) {
            match &slice.port {
                Ok(port) => {
                    resolved = true;
                    endpoints.extend(slice.addresses.iter().map(|&ip| Endpoint { ip, port: *port }));
                }
                Err(error) => {
                    tracing::warn!(%namespace, %revision, slice = %name, %error, "Skipping endpoint slice");
                    failure.get_or_insert_with(|| error.clone());
                }
            }
        }
        if let (false, Some(error)) = (resolved, failure) {
            return Err(error);
        }
        endpoints.sort();
        endpoints.dedup();
        Ok(endpoints)
    }

    fn remove_slice(&mut self, namespace: &str, name: &str) -> bool {
        let Some(revision) = self.slices.remove(&(namespace.to_string(), name.to_string())) else {
            return false;
        };
        if let Some(slices) = self.revisions.get_mut(&revision) {
            slices.remove(name);
            if slices.is_empty() {
                self.revisions.remove(&revision);
            }
        }
        true
    }
}

impl kubert::index::IndexNamespacedResource<k8s::EndpointSlice> for Index {
    fn apply(&mut self, slice: k8s::EndpointSlice) {
        let namespace = slice.namespace().expect("EndpointSlice must have a namespace");
        let name = slice.name_unchecked();

        let Some(revision) = slice.labels().get(labels::SERVICE_NAME).cloned() else {
            tracing::debug!(%namespace, %name, "Ignoring endpoint slice without a service");
            if self.remove_slice(&namespace, &name) {
                self.changes.notify();
            }
            return;
        };
        let revision = RevisionRef {
            namespace: namespace.clone(),
            name: revision,
        };

        let indexed = Slice {
            port: http_port(&name, slice.ports.as_deref().unwrap_or_default()),
            addresses: ready_addresses(&namespace, &name, &slice),
        };

        let key = (namespace, name);
        if self.slices.get(&key) == Some(&revision)
            && self
                .revisions
                .get(&revision)
                .and_then(|slices| slices.get(&key.1))
                == Some(&indexed)
        {
            return;
        }

        self.remove_slice(&key.0, &key.1);
        tracing::debug!(namespace = %key.0, slice = %key.1, revision = %revision.name, port = ?indexed.port, addresses = indexed.addresses.len(), "Indexed endpoint slice");
        self.revisions
            .entry(revision.clone())
            .or_default()
            .insert(key.1.clone(), indexed);
        self.slices.insert(key, revision);
        self.changes.notify();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.remove_slice(&namespace, &name) {
            self.changes.notify();
        }
    }

    fn reset(
        &mut self,
        slices: Vec<k8s::EndpointSlice>,
        removed: kubert::index::NamespacedRemoved,
    ) {
        for slice in slices {
            self.apply(slice);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete(namespace.clone(), name);
            }
        }
        self.synced.mark();
    }
}

/// Selects the port that serves HTTP traffic for a slice.
///
/// A port named `http` is preferred, then `http2` and `h2c`. A slice that exposes a single port
/// uses it regardless of its name.
pub fn http_port(slice: &str, ports: &[EndpointPort]) -> Result<u16, ResolveError> {
    let named = HTTP_PORT_NAMES
        .iter()
        .find_map(|n| ports.iter().find(|p| p.name.as_deref() == Some(*n)));
    let port = match (named, ports) {
        (Some(port), _) => port,
        (None, []) => {
            return Err(ResolveError::NoHttpPort {
                slice: slice.to_string(),
            })
        }
        (None, [port]) => port,
        (None, _) => {
            return Err(ResolveError::AmbiguousPorts {
                slice: slice.to_string(),
            })
        }
    };

    let number = port.port.unwrap_or(0);
    u16::try_from(number)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ResolveError::InvalidPort {
            slice: slice.to_string(),
            port: number,
        })
}

fn ready_addresses(namespace: &str, name: &str, slice: &k8s::EndpointSlice) -> Vec<IpAddr> {
    if slice.address_type == "FQDN" {
        tracing::warn!(%namespace, slice = %name, "FQDN endpoint slices are not supported");
        return Vec::new();
    }

    let mut addrs = Vec::new();
    for endpoint in &slice.endpoints {
        let ready = endpoint
            .conditions
            .as_ref()
            .and_then(|c| c.ready)
            .unwrap_or(true);
        if !ready {
            continue;
        }
        for addr in &endpoint.addresses {
            match addr.parse::<IpAddr>() {
                Ok(ip) => addrs.push(ip),
                Err(error) => {
                    tracing::warn!(%error, %namespace, slice = %name, %addr, "Invalid endpoint address")
                }
            }
        }
    }
    addrs.sort();
    addrs.dedup();
    addrs
}
