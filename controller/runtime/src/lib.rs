pub use knative_xds_controller_core as core;
pub use knative_xds_controller_grpc as grpc;
pub use knative_xds_controller_k8s_api as k8s;
pub use knative_xds_controller_k8s_index as index;

mod args;

pub use self::args::Args;

/// Lists routable services from the Knative route index.
#[derive(Clone, Debug)]
struct ServiceLister(index::routes::SharedIndex);

/// Resolves revision endpoints from the endpoint slice index.
#[derive(Clone, Debug)]
struct EndpointResolver(index::endpoints::SharedIndex);

impl ServiceLister {
    pub fn new(index: index::routes::SharedIndex) -> Self {
        Self(index)
    }
}

impl EndpointResolver {
    pub fn new(index: index::endpoints::SharedIndex) -> Self {
        Self(index)
    }
}

#[async_trait::async_trait]
impl core::ListServices for ServiceLister {
    async fn list_services(
        &self,
        namespace: Option<&str>,
    ) -> anyhow::Result<Vec<core::RoutableService>> {
        let services = self.0.read().services(namespace);
        Ok(services)
    }
}

impl core::ResolveEndpoints for EndpointResolver {
    fn resolve_endpoints(
        &self,
        namespace: &str,
        revision: &str,
    ) -> Result<Vec<core::Endpoint>, core::ResolveError> {
        self.0.read().endpoints(namespace, revision)
    }
}
