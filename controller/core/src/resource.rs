use crate::{Cluster, Listener, Route, VirtualHost};
use serde::Serialize;
use std::fmt;

/// The kinds of configuration resources served to proxies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Cluster,
    Route,
    VirtualHost,
    Listener,
}

/// Capabilities shared by every configuration resource so that snapshots and servers can treat
/// them uniformly.
pub trait Resource: Serialize {
    const KIND: ResourceKind;

    fn name(&self) -> &str;
}

/// A borrowed configuration resource of any kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResourceRef<'a> {
    Cluster(&'a Cluster),
    Route(&'a Route),
    VirtualHost(&'a VirtualHost),
    Listener(&'a Listener),
}

// === impl ResourceKind ===

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cluster,
        ResourceKind::Route,
        ResourceKind::VirtualHost,
        ResourceKind::Listener,
    ];

    pub const fn type_url(self) -> &'static str {
        match self {
            Self::Cluster => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            Self::Route => "type.googleapis.com/envoy.config.route.v3.RouteConfiguration",
            Self::VirtualHost => "type.googleapis.com/envoy.config.route.v3.VirtualHost",
            Self::Listener => "type.googleapis.com/envoy.config.listener.v3.Listener",
        }
    }

    pub fn from_type_url(type_url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.type_url() == type_url)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster => f.write_str("cluster"),
            Self::Route => f.write_str("route"),
            Self::VirtualHost => f.write_str("virtual host"),
            Self::Listener => f.write_str("listener"),
        }
    }
}

// === impl ResourceRef ===

impl ResourceRef<'_> {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Cluster(_) => ResourceKind::Cluster,
            Self::Route(_) => ResourceKind::Route,
            Self::VirtualHost(_) => ResourceKind::VirtualHost,
            Self::Listener(_) => ResourceKind::Listener,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Cluster(c) => c.name(),
            Self::Route(r) => r.name(),
            Self::VirtualHost(v) => v.name(),
            Self::Listener(l) => l.name(),
        }
    }
}

impl<'a> From<&'a Cluster> for ResourceRef<'a> {
    fn from(c: &'a Cluster) -> Self {
        Self::Cluster(c)
    }
}

impl<'a> From<&'a Route> for ResourceRef<'a> {
    fn from(r: &'a Route) -> Self {
        Self::Route(r)
    }
}

impl<'a> From<&'a VirtualHost> for ResourceRef<'a> {
    fn from(v: &'a VirtualHost) -> Self {
        Self::VirtualHost(v)
    }
}

impl<'a> From<&'a Listener> for ResourceRef<'a> {
    fn from(l: &'a Listener) -> Self {
        Self::Listener(l)
    }
}

// === impl Resource ===

impl Resource for Cluster {
    const KIND: ResourceKind = ResourceKind::Cluster;

    fn name(&self) -> &str {
        &self.name
    }
}

impl Resource for Route {
    const KIND: ResourceKind = ResourceKind::Route;

    fn name(&self) -> &str {
        &self.name
    }
}

impl Resource for VirtualHost {
    const KIND: ResourceKind = ResourceKind::VirtualHost;

    fn name(&self) -> &str {
        &self.name
    }
}

impl Resource for Listener {
    const KIND: ResourceKind = ResourceKind::Listener;

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_urls_round_trip() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_type_url(kind.type_url()), Some(kind));
        }
        assert_eq!(
            ResourceKind::from_type_url("type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment"),
            None
        );
    }
}
