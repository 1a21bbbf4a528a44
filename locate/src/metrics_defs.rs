//! Metrics definitions for the query path.

use shared::metrics_defs::{MetricDef, MetricType};

pub const QUERIES: MetricDef = MetricDef {
    name: "locate.queries",
    metric_type: MetricType::Counter,
    description: "Number of queries, tagged by priority class",
};

pub const QUERIES_THROTTLED: MetricDef = MetricDef {
    name: "locate.queries.throttled",
    metric_type: MetricType::Counter,
    description: "Number of queries answered without targets due to load, tagged by reason",
};

pub const QUERY_ERRORS: MetricDef = MetricDef {
    name: "locate.queries.errors",
    metric_type: MetricType::Counter,
    description: "Number of queries answered with an error, tagged by status",
};

pub const QUERY_DURATION: MetricDef = MetricDef {
    name: "locate.queries.duration",
    metric_type: MetricType::Histogram,
    description: "Time to assemble a query result in seconds",
};

pub const QUERIES_IN_FLIGHT: MetricDef = MetricDef {
    name: "locate.queries.in_flight",
    metric_type: MetricType::Gauge,
    description: "Number of queries being processed",
};

pub const ALL_METRICS: &[MetricDef] = &[
    QUERIES,
    QUERIES_THROTTLED,
    QUERY_ERRORS,
    QUERY_DURATION,
    QUERIES_IN_FLIGHT,
];
