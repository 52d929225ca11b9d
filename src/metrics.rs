use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

lazy_static::lazy_static! {
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cirrus_http_requests_total", "Total HTTP requests", &["method", "path", "status"]
    ).unwrap();
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "cirrus_query_duration_seconds", "Query duration", &["database"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();
    pub static ref QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cirrus_queries_total", "Total queries", &["database"]
    ).unwrap();
    pub static ref CHANGES_APPENDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cirrus_changes_appended_total", "Changes appended to the change log", &["database"]
    ).unwrap();
    pub static ref FLUSHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cirrus_flushes_total", "Flushes", &["database", "status"]
    ).unwrap();
    pub static ref FLUSH_DURATION: HistogramVec = register_histogram_vec!(
        "cirrus_flush_duration_seconds", "Flush duration",
        &["database"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    pub static ref STORE_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "cirrus_store_operation_duration_seconds", "Object store operation latency",
        &["operation"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();
    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cirrus_store_errors_total", "Object store operation errors", &["operation"]
    ).unwrap();
    pub static ref ACTIVE_QUERIES: IntGauge = register_int_gauge!(
        "cirrus_active_queries", "Number of in-flight queries"
    ).unwrap();

    // Partition workers
    pub static ref WORKER_INVOCATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cirrus_worker_invocations_total", "Worker invocations by lambda type and outcome",
        &["kind", "outcome"]
    ).unwrap();
    pub static ref WORKER_INVOCATION_DURATION: HistogramVec = register_histogram_vec!(
        "cirrus_worker_invocation_duration_seconds", "Worker invocation latency",
        &["kind"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();
    pub static ref LAMBDA_FALLBACKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cirrus_lambda_fallbacks_total", "Times a partition raced the next candidate lambda",
        &["database"]
    ).unwrap();
    pub static ref WORKER_INSTANCES_CREATED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cirrus_worker_instances_created_total", "Cold-started worker instances",
        &["lambda"]
    ).unwrap();
    pub static ref SNAPSHOTS_SAVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cirrus_snapshots_saved_total", "Index snapshots uploaded", &["database"]
    ).unwrap();
}

/// RAII guard that decrements an IntGauge on drop.
pub struct GaugeGuard<'a>(pub &'a IntGauge);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

pub fn init() {
    lazy_static::initialize(&HTTP_REQUESTS_TOTAL);
    lazy_static::initialize(&QUERY_DURATION);
    lazy_static::initialize(&QUERIES_TOTAL);
    lazy_static::initialize(&CHANGES_APPENDED_TOTAL);
    lazy_static::initialize(&FLUSHES_TOTAL);
    lazy_static::initialize(&FLUSH_DURATION);
    lazy_static::initialize(&STORE_OPERATION_DURATION);
    lazy_static::initialize(&STORE_ERRORS_TOTAL);
    lazy_static::initialize(&ACTIVE_QUERIES);
    lazy_static::initialize(&WORKER_INVOCATIONS_TOTAL);
    lazy_static::initialize(&WORKER_INVOCATION_DURATION);
    lazy_static::initialize(&LAMBDA_FALLBACKS_TOTAL);
    lazy_static::initialize(&WORKER_INSTANCES_CREATED_TOTAL);
    lazy_static::initialize(&SNAPSHOTS_SAVED_TOTAL);
}
