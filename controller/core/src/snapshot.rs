use crate::{Cluster, Listener, ResourceKind, ResourceRef, Route};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// A consistent, versioned bundle of clusters, routes, and listeners.
///
/// Snapshots are immutable: a new configuration is always published as a new snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    version: String,
    clusters: Vec<Cluster>,
    routes: Vec<Route>,
    listeners: Vec<Listener>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot version must not be empty")]
    EmptyVersion,

    #[error("snapshot {version}: route {route} references unknown cluster {cluster}")]
    DanglingCluster {
        version: String,
        route: String,
        cluster: String,
    },

    #[error("snapshot {version}: route {route} is not served by any listener")]
    UnservedRoute { version: String, route: String },
}

pub type SnapshotRx = watch::Receiver<Option<Arc<Snapshot>>>;
type SnapshotTx = watch::Sender<Option<Arc<Snapshot>>>;

/// Holds the latest snapshot for each node identity.
///
/// Written by the reconciler and read by the discovery servers. Readers always observe either the
/// prior snapshot or the new one in its entirety.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    nodes: RwLock<HashMap<String, SnapshotTx>>,
}

pub type SharedSnapshotStore = Arc<SnapshotStore>;

// === impl Snapshot ===

impl Snapshot {
    pub fn new(
        version: impl Into<String>,
        clusters: Vec<Cluster>,
        routes: Vec<Route>,
        listeners: Vec<Listener>,
    ) -> Self {
        Self {
            version: version.into(),
            clusters,
            routes,
            listeners,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// Returns all resources of the given kind, in snapshot order.
    pub fn resources(&self, kind: ResourceKind) -> Vec<ResourceRef<'_>> {
        match kind {
            ResourceKind::Cluster => self.clusters.iter().map(Into::into).collect(),
            ResourceKind::Route => self.routes.iter().map(Into::into).collect(),
            ResourceKind::VirtualHost => self
                .listeners
                .iter()
                .flat_map(|l| l.virtual_hosts.iter())
                .map(Into::into)
                .collect(),
            ResourceKind::Listener => self.listeners.iter().map(Into::into).collect(),
        }
    }

    /// Checks that every route is served by a listener and that every cluster a route references
    /// is part of this snapshot.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.version.is_empty() {
            return Err(SnapshotError::EmptyVersion);
        }

        let clusters = self
            .clusters
            .iter()
            .map(|c| c.name.as_str())
            .collect::<HashSet<_>>();
        let served = self
            .listeners
            .iter()
            .flat_map(|l| l.virtual_hosts.iter())
            .flat_map(|vh| vh.routes.iter())
            .collect::<Vec<_>>();

        for route in self.routes.iter().chain(served.iter().copied()) {
            for wc in &route.weighted_clusters {
                if !clusters.contains(wc.cluster_name.as_str()) {
                    return Err(SnapshotError::DanglingCluster {
                        version: self.version.clone(),
                        route: route.name.clone(),
                        cluster: wc.cluster_name.clone(),
                    });
                }
            }
        }

        for route in &self.routes {
            if !served.iter().any(|r| r.name == route.name) {
                return Err(SnapshotError::UnservedRoute {
                    version: self.version.clone(),
                    route: route.name.clone(),
                });
            }
        }

        Ok(())
    }
}

// === impl SnapshotStore ===

impl SnapshotStore {
    pub fn shared() -> SharedSnapshotStore {
        Arc::new(Self::default())
    }

    /// Replaces the node's snapshot.
    ///
    /// Invalid snapshots are rejected, leaving the prior snapshot in place.
    pub fn set(&self, node: &str, snapshot: Snapshot) -> Result<Arc<Snapshot>, SnapshotError> {
        snapshot.validate()?;
        let snapshot = Arc::new(snapshot);

        let mut nodes = self.nodes.write();
        nodes
            .entry(node.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(snapshot.clone()));
        Ok(snapshot)
    }

    /// Returns the node's latest snapshot, if one has been published.
    pub fn current(&self, node: &str) -> Option<Arc<Snapshot>> {
        self.nodes
            .read()
            .get(node)
            .and_then(|tx| tx.borrow().clone())
    }

    /// Watches the node's snapshot, including snapshots published before a snapshot exists.
    pub fn watch(&self, node: &str) -> SnapshotRx {
        if let Some(tx) = self.nodes.read().get(node) {
            return tx.subscribe();
        }

        self.nodes
            .write()
            .entry(node.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }
}
