//! Metrics definitions for the upstream core.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

pub const CHAPTER_CACHE_HIT: MetricDef = MetricDef {
    name: "chapter_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of chapter lookups served from cache",
};

pub const CHAPTER_CACHE_MISS: MetricDef = MetricDef {
    name: "chapter_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of chapter lookups that missed the cache",
};

pub const DIRECTORY_CACHE_HIT: MetricDef = MetricDef {
    name: "directory_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of directory lookups served from cache",
};

pub const DIRECTORY_CACHE_MISS: MetricDef = MetricDef {
    name: "directory_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of directory lookups that missed the cache",
};

pub const UPSTREAM_CALLS: MetricDef = MetricDef {
    name: "upstream.calls",
    metric_type: MetricType::Counter,
    description: "Number of signed requests sent upstream",
};

pub const DEVICE_ROTATIONS: MetricDef = MetricDef {
    name: "device.rotations",
    metric_type: MetricType::Counter,
    description: "Number of device rotations performed",
};

pub const RESTART_TRIPS: MetricDef = MetricDef {
    name: "restart.trips",
    metric_type: MetricType::Counter,
    description: "Number of times the failure threshold tripped a restart",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro in the future.
pub const ALL_METRICS: &[MetricDef] = &[
    CHAPTER_CACHE_HIT,
    CHAPTER_CACHE_MISS,
    DIRECTORY_CACHE_HIT,
    DIRECTORY_CACHE_MISS,
    UPSTREAM_CALLS,
    DEVICE_ROTATIONS,
    RESTART_TRIPS,
];

/// Registers the description of every metric this crate emits with the
/// installed recorder. Called once at startup.
pub fn describe_metrics() {
    for def in ALL_METRICS {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_unique() {
        let mut names: Vec<_> = ALL_METRICS.iter().map(|def| def.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ALL_METRICS.len());
    }

    #[test]
    fn test_describe_metrics_without_recorder() {
        // a no-op without an installed recorder
        describe_metrics();
    }
}
