//! Metrics definitions for the aggregator.

use shared::metrics_defs::{MetricDef, MetricType};

pub const AGGREGATION_RUNS: MetricDef = MetricDef {
    name: "aggregation.runs",
    metric_type: MetricType::Counter,
    description: "Completed aggregation runs, tagged by domain and outcome",
};

pub const AGGREGATION_RECORDS: MetricDef = MetricDef {
    name: "aggregation.records",
    metric_type: MetricType::Histogram,
    description: "Records stored by a successful aggregation run",
};

pub const AGGREGATION_DURATION: MetricDef = MetricDef {
    name: "aggregation.duration",
    metric_type: MetricType::Histogram,
    description: "Time to fetch and store one domain in seconds",
};

pub const AGGREGATION_CONFLICTS: MetricDef = MetricDef {
    name: "aggregation.conflicts",
    metric_type: MetricType::Counter,
    description: "Aggregation or purge requests rejected because one was already running",
};

pub const PURGE_ROWS: MetricDef = MetricDef {
    name: "purge.rows",
    metric_type: MetricType::Histogram,
    description: "Rows removed by a purge",
};

pub const JOB_FAILURES: MetricDef = MetricDef {
    name: "jobs.failures",
    metric_type: MetricType::Counter,
    description: "Scheduled job runs that ended in an error other than a conflict",
};

pub const LINK_REQUESTS: MetricDef = MetricDef {
    name: "linking.requests",
    metric_type: MetricType::Counter,
    description: "Identity cloud link and unlink calls, tagged by operation and outcome",
};

pub const ALL_METRICS: &[MetricDef] = &[
    AGGREGATION_RUNS,
    AGGREGATION_RECORDS,
    AGGREGATION_DURATION,
    AGGREGATION_CONFLICTS,
    PURGE_ROWS,
    JOB_FAILURES,
    LINK_REQUESTS,
];
