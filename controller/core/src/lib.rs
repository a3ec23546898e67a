#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Knative xDS controller core.
//!
//! Derives a proxy fleet's dynamic configuration from Knative routing intents and the live
//! endpoints of the revisions they split traffic across:
//!
//! ```text
//! [ RoutableService ] -> [ TrafficSplit ] -> [ Cluster ]
//!          |                    |                 ^
//!          v                    v                 |
//!   [ VirtualHost ] <- [ Route / WeightedClusterRef ]
//!          |
//!          v
//!     [ Listener ]  ==>  [ Snapshot { version } ]  ==>  discovery server
//! ```
//!
//! Every pass is a full rebuild: nothing is carried over from one translation to the next, and
//! only the resulting `Snapshot` outlives the pass.

pub mod notify;
pub mod reconcile;
mod resource;
pub mod snapshot;
pub mod translate;
mod version;

pub use self::{
    notify::{Changes, Synced},
    reconcile::{ReconcileConfig, ReconcileMetrics, Reconciler},
    resource::{Resource, ResourceKind, ResourceRef},
    snapshot::{SharedSnapshotStore, Snapshot, SnapshotError, SnapshotRx, SnapshotStore},
    translate::{translate, TranslateConfig, TranslateWarning, Translation},
    version::VersionSequencer,
};
use serde::Serialize;
use std::{net::IpAddr, time};

/// Request header added on every weighted cluster naming the namespace that owns the split.
pub const NAMESPACE_HEADER: &str = "Knative-Serving-Namespace";

/// Request header added on every weighted cluster naming the revision that served the request.
pub const REVISION_HEADER: &str = "Knative-Serving-Revision";

const NAME_PREFIX: &str = "knative_";

/// Lists the current set of routable services.
#[async_trait::async_trait]
pub trait ListServices {
    /// Lists services in `namespace`, or in all namespaces when `None`.
    async fn list_services(&self, namespace: Option<&str>) -> anyhow::Result<Vec<RoutableService>>;
}

/// Resolves the network endpoints currently backing a revision.
pub trait ResolveEndpoints {
    fn resolve_endpoints(&self, namespace: &str, revision: &str)
        -> Result<Vec<Endpoint>, ResolveError>;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no endpoints found for revision {namespace}/{revision}")]
    NotFound { namespace: String, revision: String },

    #[error("endpoint slice {slice} does not declare any ports")]
    NoHttpPort { slice: String },

    #[error("endpoint slice {slice} declares several ports and none of them is named http")]
    AmbiguousPorts { slice: String },

    #[error("endpoint slice {slice} declares invalid port {port}")]
    InvalidPort { slice: String, port: i32 },
}

/// A user-facing service owning one or more weighted revisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutableService {
    pub name: String,
    pub namespace: String,

    /// The hostname the service is reachable on. Services without one are not routable.
    pub external_host: Option<String>,

    pub traffic: Vec<TrafficSplit>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrafficSplit {
    pub revision: String,
    pub percent: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    pub endpoints: Vec<Endpoint>,
    #[serde(serialize_with = "serialize_duration")]
    pub connect_timeout: time::Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedClusterRef {
    pub cluster_name: String,
    pub weight: u32,

    /// Headers appended to requests sent to this cluster. Existing values are preserved.
    pub request_headers_to_add: Vec<HeaderAppend>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HeaderAppend {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub name: String,
    pub path_prefix: String,
    pub weighted_clusters: Vec<WeightedClusterRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub virtual_hosts: Vec<VirtualHost>,
}

/// Names the cluster that serves a revision.
pub fn cluster_name(revision: &str) -> String {
    format!("{NAME_PREFIX}{revision}")
}

/// Names the route that serves a service.
pub fn route_name(service: &str) -> String {
    format!("{NAME_PREFIX}{service}")
}

// Durations are rendered the way protobuf JSON renders them, e.g. `5s` or `0.250s`.
fn serialize_duration<S: serde::Serializer>(d: &time::Duration, s: S) -> Result<S::Ok, S::Error> {
    let nanos = d.subsec_nanos();
    let frac = if nanos == 0 {
        String::new()
    } else if nanos % 1_000_000 == 0 {
        format!(".{:03}", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 {
        format!(".{:06}", nanos / 1_000)
    } else {
        format!(".{nanos:09}")
    };
    s.serialize_str(&format!("{}{frac}s", d.as_secs()))
}
