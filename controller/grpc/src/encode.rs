//! Encodes configuration resources as Envoy v3 protobufs.

use envoy_types::pb::{
    envoy::{
        config::{
            cluster::v3::{cluster, Cluster},
            core::v3::{
                address, header_value_option::HeaderAppendAction, socket_address, Address,
                HeaderValue, HeaderValueOption, SocketAddress,
            },
            endpoint::v3::{
                lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
            },
            listener::v3::{filter, Filter, FilterChain, Listener},
            route::v3::{
                route, route_action, route_match, weighted_cluster, Route, RouteAction,
                RouteConfiguration, RouteMatch, VirtualHost, WeightedCluster,
            },
        },
        extensions::filters::{
            http::router::v3::Router,
            network::http_connection_manager::v3::{
                http_connection_manager, http_filter, HttpConnectionManager, HttpFilter,
            },
        },
    },
    google::protobuf::{Any, Duration, UInt32Value},
};
use knative_xds_controller_core::{self as core, ResourceRef, Snapshot};
use std::net::IpAddr;

const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
const HTTP_CONNECTION_MANAGER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER: &str = "envoy.filters.http.router";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

/// Encodes a snapshot resource as an `Any` tagged with its Envoy type URL.
///
/// Routes are served as route configurations holding the virtual hosts that own them, so the
/// snapshot is needed to find those hosts.
pub fn encode(snapshot: &Snapshot, resource: ResourceRef<'_>) -> Any {
    let type_url = resource.kind().type_url();
    match resource {
        ResourceRef::Cluster(c) => to_any(type_url, &cluster_proto(c)),
        ResourceRef::Route(r) => to_any(type_url, &route_configuration(snapshot, r)),
        ResourceRef::VirtualHost(vh) => to_any(type_url, &virtual_host(vh)),
        ResourceRef::Listener(l) => to_any(type_url, &listener_proto(l)),
    }
}

fn to_any(type_url: &str, msg: &impl prost::Message) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

fn cluster_proto(c: &core::Cluster) -> Cluster {
    let lb_endpoints = c
        .endpoints
        .iter()
        .map(|ep| LbEndpoint {
            host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                address: Some(socket_address(ep.ip, ep.port)),
                ..Default::default()
            })),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    Cluster {
        name: c.name.clone(),
        connect_timeout: Some(Duration {
            seconds: c.connect_timeout.as_secs() as i64,
            nanos: c.connect_timeout.subsec_nanos() as i32,
        }),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::Static as i32,
        )),
        lb_policy: cluster::LbPolicy::RoundRobin as i32,
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: c.name.clone(),
            endpoints: if lb_endpoints.is_empty() {
                vec![]
            } else {
                vec![LocalityLbEndpoints {
                    lb_endpoints,
                    ..Default::default()
                }]
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn route_configuration(snapshot: &Snapshot, r: &core::Route) -> RouteConfiguration {
    let virtual_hosts = snapshot
        .listeners()
        .iter()
        .flat_map(|l| l.virtual_hosts.iter())
        .filter(|vh| vh.routes.iter().any(|route| route.name == r.name))
        .map(virtual_host)
        .collect();
    RouteConfiguration {
        name: r.name.clone(),
        virtual_hosts,
        ..Default::default()
    }
}

fn virtual_host(vh: &core::VirtualHost) -> VirtualHost {
    VirtualHost {
        name: vh.name.clone(),
        domains: vh.domains.clone(),
        routes: vh.routes.iter().map(route_proto).collect(),
        ..Default::default()
    }
}

fn route_proto(r: &core::Route) -> Route {
    let clusters = r
        .weighted_clusters
        .iter()
        .map(|wc| weighted_cluster::ClusterWeight {
            name: wc.cluster_name.clone(),
            weight: Some(UInt32Value { value: wc.weight }),
            request_headers_to_add: wc
                .request_headers_to_add
                .iter()
                .map(|h| HeaderValueOption {
                    header: Some(HeaderValue {
                        key: h.name.clone(),
                        value: h.value.clone(),
                        ..Default::default()
                    }),
                    append_action: HeaderAppendAction::AppendIfExistsOrAdd as i32,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();

    Route {
        name: r.name.clone(),
        r#match: Some(RouteMatch {
            path_specifier: Some(route_match::PathSpecifier::Prefix(r.path_prefix.clone())),
            ..Default::default()
        }),
        action: Some(route::Action::Route(RouteAction {
            cluster_specifier: Some(route_action::ClusterSpecifier::WeightedClusters(
                WeightedCluster {
                    clusters,
                    ..Default::default()
                },
            )),
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn listener_proto(l: &core::Listener) -> Listener {
    let hcm = HttpConnectionManager {
        stat_prefix: l.name.clone(),
        route_specifier: Some(http_connection_manager::RouteSpecifier::RouteConfig(
            RouteConfiguration {
                name: l.name.clone(),
                virtual_hosts: l.virtual_hosts.iter().map(virtual_host).collect(),
                ..Default::default()
            },
        )),
        http_filters: vec![HttpFilter {
            name: ROUTER.to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(to_any(
                ROUTER_TYPE_URL,
                &Router::default(),
            ))),
            ..Default::default()
        }],
        ..Default::default()
    };

    Listener {
        name: l.name.clone(),
        address: Some(socket_address(l.address, l.port)),
        filter_chains: vec![FilterChain {
            filters: vec![Filter {
                name: HTTP_CONNECTION_MANAGER.to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(to_any(
                    HTTP_CONNECTION_MANAGER_TYPE_URL,
                    &hcm,
                ))),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn socket_address(ip: IpAddr, port: u16) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: ip.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port.into())),
            ..Default::default()
        })),
        ..Default::default()
    }
}
