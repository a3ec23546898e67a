//! A JSON/HTTP rendition of the discovery API for clients that cannot speak gRPC.
//!
//! `POST /v3/discovery:{clusters,routes,listeners}` accepts a discovery request such as
//! `{"versionInfo": "3", "node": {"id": "knative"}, "resourceNames": []}` and answers with the
//! node's current resources, or `304 Not Modified` when the client already holds that version.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{body::Body as HttpBody, http, Request, Response};
use knative_xds_controller_core::{ResourceKind, ResourceRef, SharedSnapshotStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub type Body = http_body_util::Full<Bytes>;

#[derive(Clone, Debug)]
pub struct Gateway {
    store: SharedSnapshotStore,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DiscoveryRequest {
    version_info: String,
    node: Option<Node>,
    resource_names: Vec<String>,
    type_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Node {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DiscoveryResponse<'a> {
    version_info: &'a str,
    resources: Vec<TypedResource<'a>>,
    type_url: &'static str,
}

#[derive(Debug, Serialize)]
struct TypedResource<'a> {
    #[serde(rename = "@type")]
    type_url: &'static str,

    #[serde(flatten)]
    resource: ResourceRef<'a>,
}

// === impl Gateway ===

impl Gateway {
    pub fn new(store: SharedSnapshotStore) -> Self {
        Self { store }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Body>
    where
        B: HttpBody,
        B::Error: std::fmt::Display,
    {
        let kind = match req.uri().path() {
            "/v3/discovery:clusters" => ResourceKind::Cluster,
            "/v3/discovery:routes" => ResourceKind::Route,
            "/v3/discovery:listeners" => ResourceKind::Listener,
            path => {
                debug!(%path, "Unknown discovery path");
                return status(http::StatusCode::NOT_FOUND);
            }
        };
        if req.method() != http::Method::POST {
            let mut rsp = status(http::StatusCode::METHOD_NOT_ALLOWED);
            rsp.headers_mut().insert(
                http::header::ALLOW,
                http::HeaderValue::from_static("POST"),
            );
            return rsp;
        }

        let body = match req.into_body().collect().await {
            Ok(body) => body.to_bytes(),
            Err(error) => {
                warn!(%error, "Failed to read request body");
                return bad_request(format!("failed to read request body: {error}"));
            }
        };
        let request = match serde_json::from_slice::<DiscoveryRequest>(&body) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "Invalid discovery request");
                return bad_request(format!("invalid discovery request: {error}"));
            }
        };

        if let Some(type_url) = request.type_url.as_deref() {
            if type_url != kind.type_url() {
                return bad_request(format!("type URL {type_url} does not match {kind}s"));
            }
        }
        let node = request.node.map(|n| n.id).unwrap_or_default();
        if node.is_empty() {
            return bad_request("the request must identify its node".to_string());
        }

        let Some(snapshot) = self.store.current(&node) else {
            debug!(%node, "No configuration published");
            return status(http::StatusCode::SERVICE_UNAVAILABLE);
        };
        if request.version_info == snapshot.version() {
            return status(http::StatusCode::NOT_MODIFIED);
        }

        let resources = snapshot
            .resources(kind)
            .into_iter()
            .filter(|r| {
                request.resource_names.is_empty()
                    || request.resource_names.iter().any(|n| n == r.name())
            })
            .map(|resource| TypedResource {
                type_url: kind.type_url(),
                resource,
            })
            .collect();
        json_response(&DiscoveryResponse {
            version_info: snapshot.version(),
            resources,
            type_url: kind.type_url(),
        })
    }
}

fn status(code: http::StatusCode) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::default())
        .expect("status response must be valid")
}

fn bad_request(msg: String) -> Response<Body> {
    Response::builder()
        .status(http::StatusCode::BAD_REQUEST)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::new(Bytes::from(msg)))
        .expect("bad request response must be valid")
}

fn json_response(rsp: &DiscoveryResponse<'_>) -> Response<Body> {
    match serde_json::to_vec(rsp) {
        Ok(bytes) => Response::builder()
            .status(http::StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::new(Bytes::from(bytes)))
            .expect("discovery response must be valid"),
        Err(error) => {
            warn!(%error, "Failed to encode discovery response");
            status(http::StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
