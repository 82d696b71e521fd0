use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, HistogramVec,
    IntCounter,
};

lazy_static! {
    pub static ref ACCESS_RECORDS_TOTAL: CounterVec = register_counter_vec!(
        "alarm_access_records_total",
        "Records seen by the access stage, by outcome",
        &["group", "stage"]
    ).unwrap();

    pub static ref ACCESS_PROCESS_SECONDS: HistogramVec = register_histogram_vec!(
        "alarm_access_process_seconds",
        "Time spent processing one strategy group",
        &["mode"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    pub static ref ACCESS_QUEUE_FULL_TOTAL: IntCounter = register_int_counter!(
        "alarm_access_queue_full_total",
        "Detect queues trimmed because they exceeded the maximum length"
    ).unwrap();
}

pub fn record_count(group: &str, stage: &str, count: usize) {
    if count > 0 {
        ACCESS_RECORDS_TOTAL
            .with_label_values(&[group, stage])
            .inc_by(count as f64);
    }
}

pub fn observe_process(mode: &str, seconds: f64) {
    ACCESS_PROCESS_SECONDS.with_label_values(&[mode]).observe(seconds);
}

pub use alarm_strategy::metrics::metrics_text;
