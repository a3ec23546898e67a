use crate::{
    encode::encode,
    metrics::{DiscoveryMetrics, StreamMetrics},
};
use ahash::AHashMap as HashMap;
use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::{
        AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
    },
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use futures::prelude::*;
use knative_xds_controller_core::{ResourceKind, SharedSnapshotStore, Snapshot};
use std::pin::Pin;
use tracing::{debug, warn};

/// Serves snapshots over the state-of-the-world Aggregated Discovery Service.
#[derive(Clone, Debug)]
pub struct AdsServer {
    store: SharedSnapshotStore,
    metrics: DiscoveryMetrics,
    drain: drain::Watch,
}

pub type BoxResponseStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, tonic::Status>> + Send>>;

type BoxDeltaStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, tonic::Status>> + Send>>;

/// Per-stream subscription state.
#[derive(Debug, Default)]
struct Subscriptions {
    types: HashMap<ResourceKind, Subscription>,
    nonces: u64,
}

#[derive(Debug, Default)]
struct Subscription {
    /// Requested resource names. Empty means every resource of the type.
    names: Vec<String>,
    sent_version: Option<String>,
    nonce: Option<String>,
}

// === impl AdsServer ===

impl AdsServer {
    pub fn new(
        store: SharedSnapshotStore,
        metrics: DiscoveryMetrics,
        drain: drain::Watch,
    ) -> Self {
        Self {
            store,
            metrics,
            drain,
        }
    }

    pub fn svc(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }

    /// Answers a stream of discovery requests.
    ///
    /// The first request identifies the node whose snapshots are served for the rest of the
    /// stream. The stream ends when the client closes it, on the first error, or when the server
    /// starts shutting down.
    pub fn response_stream<S>(&self, requests: S) -> BoxResponseStream
    where
        S: Stream<Item = Result<DiscoveryRequest, tonic::Status>> + Send + 'static,
    {
        let store = self.store.clone();
        let drain = self.drain.clone();
        let mut metrics = self.metrics.open_stream();

        Box::pin(async_stream::stream! {
            tokio::pin! {
                let requests = requests;
                let shutdown = drain.signaled();
            }

            let first = tokio::select! {
                res = requests.next() => match res {
                    Some(Ok(req)) => req,
                    Some(Err(status)) => {
                        metrics.fail(status.code());
                        yield Err(status);
                        return;
                    }
                    None => return,
                },
                _ = &mut shutdown => return,
            };

            let node = match first.node.as_ref().map(|n| n.id.clone()) {
                Some(id) if !id.is_empty() => id,
                _ => {
                    let status = tonic::Status::invalid_argument("the first request must identify its node");
                    metrics.fail(status.code());
                    yield Err(status);
                    return;
                }
            };
            debug!(%node, "Discovery stream opened");

            let mut snapshots = store.watch(&node);
            let mut subs = Subscriptions::default();

            let mut next = Some(first);
            loop {
                if let Some(req) = next.take() {
                    let snapshot = snapshots.borrow_and_update().clone();
                    match subs.request(req, snapshot.as_deref(), &metrics) {
                        Ok(Some(rsp)) => yield Ok(rsp),
                        Ok(None) => {}
                        Err(status) => {
                            metrics.fail(status.code());
                            yield Err(status);
                            return;
                        }
                    }
                }

                tokio::select! {
                    res = requests.next() => match res {
                        Some(Ok(req)) => next = Some(req),
                        Some(Err(status)) => {
                            debug!(%node, %status, "Discovery stream failed");
                            metrics.fail(status.code());
                            yield Err(status);
                            return;
                        }
                        None => {
                            debug!(%node, "Discovery stream closed");
                            return;
                        }
                    },

                    res = snapshots.changed() => {
                        if res.is_err() {
                            return;
                        }
                        let snapshot = snapshots.borrow_and_update().clone();
                        if let Some(snapshot) = snapshot {
                            for rsp in subs.push(&snapshot, &metrics) {
                                yield Ok(rsp);
                            }
                        }
                    },

                    // If the server starts shutting down, close the stream so that it doesn't
                    // hold the server open.
                    _ = &mut shutdown => {
                        debug!(%node, "Discovery stream closed by shutdown");
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl AggregatedDiscoveryService for AdsServer {
    type StreamAggregatedResourcesStream = BoxResponseStream;

    async fn stream_aggregated_resources(
        &self,
        req: tonic::Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxResponseStream>, tonic::Status> {
        Ok(tonic::Response::new(self.response_stream(req.into_inner())))
    }

    type DeltaAggregatedResourcesStream = BoxDeltaStream;

    async fn delta_aggregated_resources(
        &self,
        _req: tonic::Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxDeltaStream>, tonic::Status> {
        Err(tonic::Status::unimplemented(
            "incremental discovery is not supported",
        ))
    }
}

// === impl Subscriptions ===

impl Subscriptions {
    /// Handles a request from the proxy, returning a response if one is due.
    fn request(
        &mut self,
        req: DiscoveryRequest,
        snapshot: Option<&Snapshot>,
        metrics: &StreamMetrics,
    ) -> Result<Option<DiscoveryResponse>, tonic::Status> {
        let kind = ResourceKind::from_type_url(&req.type_url).ok_or_else(|| {
            tonic::Status::invalid_argument(format!("unsupported type URL: {}", req.type_url))
        })?;
        metrics.request(kind);
        let sub = self.types.entry(kind).or_default();

        if let Some(nonce) = &sub.nonce {
            if !req.response_nonce.is_empty() && req.response_nonce != *nonce {
                debug!(%kind, nonce = %req.response_nonce, "Ignoring stale request");
                return Ok(None);
            }
        }

        if let Some(error) = &req.error_detail {
            metrics.nack(kind);
            warn!(
                %kind,
                version = %req.version_info,
                code = error.code,
                message = %error.message,
                "Proxy rejected configuration",
            );
            return Ok(None);
        }

        let names_changed = sub.names != req.resource_names;
        sub.names = req.resource_names;

        let Some(snapshot) = snapshot else {
            return Ok(None);
        };
        let version = snapshot.version();
        let current = version == req.version_info || sub.sent_version.as_deref() == Some(version);
        if current && !names_changed {
            return Ok(None);
        }
        Ok(Some(self.respond(kind, snapshot, metrics)))
    }

    /// Builds responses for every subscribed type that has not yet been sent this snapshot.
    fn push(&mut self, snapshot: &Snapshot, metrics: &StreamMetrics) -> Vec<DiscoveryResponse> {
        let mut kinds = self
            .types
            .iter()
            .filter(|(_, sub)| sub.sent_version.as_deref() != Some(snapshot.version()))
            .map(|(kind, _)| *kind)
            .collect::<Vec<_>>();
        kinds.sort();
        kinds
            .into_iter()
            .map(|kind| self.respond(kind, snapshot, metrics))
            .collect()
    }

    fn respond(
        &mut self,
        kind: ResourceKind,
        snapshot: &Snapshot,
        metrics: &StreamMetrics,
    ) -> DiscoveryResponse {
        self.nonces += 1;
        let nonce = self.nonces.to_string();

        let sub = self.types.entry(kind).or_default();
        let resources = snapshot
            .resources(kind)
            .into_iter()
            .filter(|r| sub.names.is_empty() || sub.names.iter().any(|n| n == r.name()))
            .map(|r| encode(snapshot, r))
            .collect::<Vec<_>>();
        debug!(
            %kind,
            version = %snapshot.version(),
            resources = resources.len(),
            "Sending configuration",
        );
        metrics.response(kind, resources.len());

        sub.sent_version = Some(snapshot.version().to_string());
        sub.nonce = Some(nonce.clone());
        DiscoveryResponse {
            version_info: snapshot.version().to_string(),
            resources,
            type_url: kind.type_url().to_string(),
            nonce,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests;
