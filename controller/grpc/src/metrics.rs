use knative_xds_controller_core::ResourceKind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

/// Metrics for discovery streams, shared by every stream the server accepts.
#[derive(Clone, Debug)]
pub struct DiscoveryMetrics {
    opened: Counter,
    open: Gauge,
    closed: Family<CodeLabels, Counter>,
    duration: Histogram,
    requests: Family<TypeLabels, Counter>,
    nacks: Family<TypeLabels, Counter>,
    responses: Family<TypeLabels, Counter>,
    resources_sent: Family<TypeLabels, Counter>,
}

/// Records a single stream. The stream is counted as closed when this is dropped.
#[derive(Debug)]
pub(crate) struct StreamMetrics {
    metrics: DiscoveryMetrics,
    opened_at: time::Instant,
    code: tonic::Code,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CodeLabels {
    grpc_code: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TypeLabels {
    type_url: &'static str,
}

// === impl DiscoveryMetrics ===

impl DiscoveryMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let opened = Counter::default();
        reg.register(
            "streams_opened",
            "Total number of discovery streams opened by proxies",
            opened.clone(),
        );

        let open = Gauge::default();
        reg.register("streams", "Number of open discovery streams", open.clone());

        let closed = Family::<CodeLabels, Counter>::default();
        reg.register(
            "streams_closed",
            "Total number of discovery streams closed, by gRPC status code",
            closed.clone(),
        );

        // Proxies keep their stream for as long as they run, so the buckets span seconds to a day.
        let duration = Histogram::new([1.0, 10.0, 60.0, 600.0, 3600.0, 21600.0, 86400.0]);
        reg.register_with_unit(
            "stream_duration",
            "Lifetime of closed discovery streams",
            Unit::Seconds,
            duration.clone(),
        );

        let requests = Family::<TypeLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of discovery requests received, by resource type",
            requests.clone(),
        );

        let nacks = Family::<TypeLabels, Counter>::default();
        reg.register(
            "nacks",
            "Total number of discovery responses rejected by proxies, by resource type",
            nacks.clone(),
        );

        let responses = Family::<TypeLabels, Counter>::default();
        reg.register(
            "responses",
            "Total number of discovery responses sent, by resource type",
            responses.clone(),
        );

        let resources_sent = Family::<TypeLabels, Counter>::default();
        reg.register(
            "resources_sent",
            "Total number of resources sent in discovery responses, by resource type",
            resources_sent.clone(),
        );

        Self {
            opened,
            open,
            closed,
            duration,
            requests,
            nacks,
            responses,
            resources_sent,
        }
    }

    pub(crate) fn open_stream(&self) -> StreamMetrics {
        self.opened.inc();
        self.open.inc();
        StreamMetrics {
            metrics: self.clone(),
            opened_at: time::Instant::now(),
            code: tonic::Code::Ok,
        }
    }
}

// === impl StreamMetrics ===

impl StreamMetrics {
    pub(crate) fn request(&self, kind: ResourceKind) {
        self.metrics.requests.get_or_create(&kind.into()).inc();
    }

    pub(crate) fn nack(&self, kind: ResourceKind) {
        self.metrics.nacks.get_or_create(&kind.into()).inc();
    }

    pub(crate) fn response(&self, kind: ResourceKind, resources: usize) {
        let labels = TypeLabels::from(kind);
        self.metrics.responses.get_or_create(&labels).inc();
        self.metrics
            .resources_sent
            .get_or_create(&labels)
            .inc_by(resources as u64);
    }

    /// Records the status the stream ends with.
    pub(crate) fn fail(&mut self, code: tonic::Code) {
        self.code = code;
    }
}

impl Drop for StreamMetrics {
    fn drop(&mut self) {
        self.metrics.open.dec();
        self.metrics
            .duration
            .observe(self.opened_at.elapsed().as_secs_f64());
        self.metrics
            .closed
            .get_or_create(&CodeLabels {
                grpc_code: code_str(self.code),
            })
            .inc();
    }
}

impl From<ResourceKind> for TypeLabels {
    fn from(kind: ResourceKind) -> Self {
        Self {
            type_url: kind.type_url(),
        }
    }
}

fn code_str(code: tonic::Code) -> &'static str {
    use tonic::Code::*;
    match code {
        Ok => "OK",
        Cancelled => "CANCELLED",
        Unknown => "UNKNOWN",
        InvalidArgument => "INVALID_ARGUMENT",
        DeadlineExceeded => "DEADLINE_EXCEEDED",
        NotFound => "NOT_FOUND",
        AlreadyExists => "ALREADY_EXISTS",
        PermissionDenied => "PERMISSION_DENIED",
        ResourceExhausted => "RESOURCE_EXHAUSTED",
        FailedPrecondition => "FAILED_PRECONDITION",
        Aborted => "ABORTED",
        OutOfRange => "OUT_OF_RANGE",
        Unimplemented => "UNIMPLEMENTED",
        Internal => "INTERNAL",
        Unavailable => "UNAVAILABLE",
        DataLoss => "DATA_LOSS",
        Unauthenticated => "UNAUTHENTICATED",
    }
}
