use crate::{core, grpc, index, k8s, EndpointResolver, ServiceLister};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use hyper_util::{rt::TokioIo, server::graceful::GracefulShutdown};
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
};
use tokio::time::Duration;
use tonic::transport::Server;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "knative-xds",
    about = "Serves Knative routing as Envoy dynamic configuration"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "knative_xds=info,warn",
        env = "KNATIVE_XDS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Address of the Aggregated Discovery Service.
    #[clap(long, default_value = "0.0.0.0:18000")]
    grpc_addr: SocketAddr,

    /// Address of the JSON discovery gateway.
    #[clap(long, default_value = "0.0.0.0:18001")]
    gateway_addr: SocketAddr,

    /// The node identity that configuration is published for.
    #[clap(long, default_value = "knative")]
    node_id: String,

    /// Only routes in this namespace are served. All namespaces are served when unset.
    #[clap(long)]
    namespace: Option<String>,

    #[clap(long, default_value = "0.0.0.0")]
    listener_address: IpAddr,

    #[clap(long, default_value = "80")]
    listener_port: u16,

    #[clap(long, default_value = "5000")]
    cluster_connect_timeout_ms: u64,

    /// Consecutive failures to list routes before the controller gives up.
    #[clap(long, default_value = "5")]
    list_retry_limit: u32,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            grpc_addr,
            gateway_addr,
            node_id,
            namespace,
            listener_address,
            listener_port,
            cluster_connect_timeout_ms,
            list_retry_limit,
        } = self;

        if list_retry_limit == 0 {
            bail!("--list-retry-limit must be at least 1");
        }

        // Both indexes share a change signal that wakes the reconciler.
        let changes = core::Changes::new();
        let routes_index = index::routes::Index::shared(changes.clone());
        let endpoints_index = index::endpoints::Index::shared(changes.clone());
        let store = core::SnapshotStore::shared();

        let mut prom = <Registry>::default();
        let reconcile_metrics =
            core::ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let discovery_metrics =
            grpc::metrics::DiscoveryMetrics::register(prom.sub_registry_with_prefix("discovery"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn resource watches.

        let routes = runtime.watch_all::<k8s::Route>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(routes_index.clone(), routes)
                .instrument(info_span!("routes.serving.knative.dev")),
        );

        let slices = runtime.watch_all::<k8s::EndpointSlice>(
            watcher::Config::default().labels(k8s::labels::REVISION),
        );
        tokio::spawn(
            kubert::index::namespaced(endpoints_index.clone(), slices)
                .instrument(info_span!("endpointslices")),
        );

        // Rebuild the node's snapshot whenever either index changes.
        let config = core::ReconcileConfig {
            node_id,
            namespace,
            translate: core::TranslateConfig {
                listener_address,
                listener_port,
                connect_timeout: Duration::from_millis(cluster_connect_timeout_ms),
                ..Default::default()
            },
            list_retry_limit,
            ..Default::default()
        };
        // The first pass waits for both watches to index their initial lists, so that a restart
        // never publishes a snapshot built from empty indexes.
        let synced = vec![routes_index.read().synced(), endpoints_index.read().synced()];
        let reconciler = core::Reconciler::new(
            config,
            ServiceLister::new(routes_index),
            EndpointResolver::new(endpoints_index),
            store.clone(),
            reconcile_metrics,
        );
        let reconcile = tokio::spawn(
            reconciler
                .run(changes, synced)
                .instrument(info_span!("reconcile")),
        );

        // Serve published snapshots to proxies.
        tokio::spawn(grpc(
            grpc_addr,
            store.clone(),
            discovery_metrics,
            runtime.shutdown_handle(),
        ));
        tokio::spawn(gateway(gateway_addr, store, runtime.shutdown_handle()));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting. A reconciler that gives up takes the process down.
        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            res = reconcile => {
                res.context("reconciler panicked")??;
                bail!("reconciler exited unexpectedly");
            }
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(
    addr: SocketAddr,
    store: core::SharedSnapshotStore,
    metrics: grpc::metrics::DiscoveryMetrics,
    drain: drain::Watch,
) -> Result<()> {
    let svc = grpc::AdsServer::new(store, metrics, drain.clone()).svc();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder().add_service(svc).serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "xDS gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn gateway(
    addr: SocketAddr,
    store: core::SharedSnapshotStore,
    drain: drain::Watch,
) -> Result<()> {
    let gateway = grpc::Gateway::new(store);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let graceful = GracefulShutdown::new();

    info!(%addr, "Discovery gateway listening");
    tokio::pin! {
        let shutdown = drain.signaled();
    }
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (io, client) = match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Failed to accept connection");
                        continue;
                    }
                };

                let gateway = gateway.clone();
                let svc = hyper::service::service_fn(move |req| {
                    let gateway = gateway.clone();
                    async move { Ok::<_, Infallible>(gateway.handle(req).await) }
                });
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(io), svc);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(error) = conn.await {
                        debug!(%error, %client, "Connection failed");
                    }
                });
            }

            handle = &mut shutdown => {
                handle.release_after(graceful.shutdown()).await;
                return Ok(());
            }
        }
    }
}
