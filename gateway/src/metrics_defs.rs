//! Metrics definitions for the gateway.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "cache.hit",
    metric_type: MetricType::Counter,
    description: "Lookups answered from a fresh cache entry. Tagged with domain.",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "cache.miss",
    metric_type: MetricType::Counter,
    description: "Lookups with no entry or only a stale one. Tagged with domain.",
};

pub const CACHE_READ_ERROR: MetricDef = MetricDef {
    name: "cache.read_error",
    metric_type: MetricType::Counter,
    description: "Cache reads that failed and were treated as a miss",
};

pub const CACHE_WRITE_ERROR: MetricDef = MetricDef {
    name: "cache.write_error",
    metric_type: MetricType::Counter,
    description: "Cache writes that failed after a successful upstream fetch",
};

pub const COALESCE_STARTED: MetricDef = MetricDef {
    name: "coalesce.started",
    metric_type: MetricType::Counter,
    description: "Lookups that started a new shared fetch",
};

pub const COALESCE_JOINED: MetricDef = MetricDef {
    name: "coalesce.joined",
    metric_type: MetricType::Counter,
    description: "Lookups that joined a fetch already in flight",
};

pub const COALESCE_INFLIGHT: MetricDef = MetricDef {
    name: "coalesce.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of shared fetches currently in flight",
};

pub const UPSTREAM_ATTEMPT: MetricDef = MetricDef {
    name: "upstream.attempt",
    metric_type: MetricType::Counter,
    description: "Upstream HTTP attempts, including retries. Tagged with domain.",
};

pub const UPSTREAM_FAILURE: MetricDef = MetricDef {
    name: "upstream.failure",
    metric_type: MetricType::Counter,
    description: "Failed upstream attempts. Tagged with domain and reason.",
};

pub const GATEWAY_DEGRADED: MetricDef = MetricDef {
    name: "gateway.degraded",
    metric_type: MetricType::Counter,
    description: "Fetches that exhausted their retries and returned a degraded result",
};

pub const GATEWAY_DURATION: MetricDef = MetricDef {
    name: "gateway.duration",
    metric_type: MetricType::Histogram,
    description: "Lookup duration in seconds. Tagged with domain and outcome.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CACHE_HIT,
    CACHE_MISS,
    CACHE_READ_ERROR,
    CACHE_WRITE_ERROR,
    COALESCE_STARTED,
    COALESCE_JOINED,
    COALESCE_INFLIGHT,
    UPSTREAM_ATTEMPT,
    UPSTREAM_FAILURE,
    GATEWAY_DEGRADED,
    GATEWAY_DURATION,
];
