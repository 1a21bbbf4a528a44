//! Metrics definitions for the rate table.

use shared::metrics_defs::{MetricDef, MetricType};

pub const SYNC_DURATION: MetricDef = MetricDef {
    name: "rate_table.sync.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a synchronization cycle in seconds",
};

pub const SYNC_ENTRIES: MetricDef = MetricDef {
    name: "rate_table.sync.entries",
    metric_type: MetricType::Gauge,
    description: "Number of entries in the last published snapshot",
};

pub const SYNC_EVICTIONS: MetricDef = MetricDef {
    name: "rate_table.sync.evictions",
    metric_type: MetricType::Counter,
    description: "Number of entries evicted from the store and cache",
};

pub const SYNC_REJECTED_ROWS: MetricDef = MetricDef {
    name: "rate_table.sync.rejected_rows",
    metric_type: MetricType::Counter,
    description: "Number of malformed analytics rows rejected",
};

pub const SYNC_FAILURES: MetricDef = MetricDef {
    name: "rate_table.sync.failures",
    metric_type: MetricType::Counter,
    description: "Number of failed synchronization cycles, tagged by reason",
};

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "rate_table.cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of reads served by the fast cache",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "rate_table.cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of reads that missed the fast cache",
};

pub const CACHE_FALLBACK: MetricDef = MetricDef {
    name: "rate_table.cache.fallback",
    metric_type: MetricType::Counter,
    description: "Number of reads that fell back to the store after a cache error or timeout",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SYNC_DURATION,
    SYNC_ENTRIES,
    SYNC_EVICTIONS,
    SYNC_REJECTED_ROWS,
    SYNC_FAILURES,
    CACHE_HIT,
    CACHE_MISS,
    CACHE_FALLBACK,
];
