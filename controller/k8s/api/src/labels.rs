//! Well-known labels set on Kubernetes resources by Knative Serving and the EndpointSlice
//! controller.

/// Set by Knative on the services (and, by mirroring, the endpoint slices) of a revision.
pub const REVISION: &str = "serving.knative.dev/revision";

/// Set by the EndpointSlice controller to the name of the service a slice belongs to.
pub const SERVICE_NAME: &str = "kubernetes.io/service-name";
