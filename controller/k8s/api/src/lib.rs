#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod serving;

pub use self::serving::{Route, RouteSpec, RouteStatus, TrafficTarget};
pub use k8s_openapi::api::{
    self,
    discovery::v1::{
        Endpoint as SliceEndpoint, EndpointConditions, EndpointPort, EndpointSlice,
    },
};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    Client, Error, Resource,
};
