use crate::models::InvalidType;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    // Refresh cycle timings; failed cycles carry the stage that aborted them
    pub static ref CACHE_TASK_SECONDS: HistogramVec = register_histogram_vec!(
        "alarm_cache_task_seconds",
        "Duration of strategy cache refresh cycles in seconds",
        &["task", "status", "stage"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    pub static ref STRATEGY_INVALID_TOTAL: CounterVec = register_counter_vec!(
        "alarm_strategy_invalid_total",
        "Strategies tagged invalid during compilation",
        &["invalid_type"]
    ).unwrap();
}

pub fn record_task(task: &str, status: &str, stage: &str, seconds: f64) {
    CACHE_TASK_SECONDS
        .with_label_values(&[task, status, stage])
        .observe(seconds);
}

pub fn record_invalid(counts: &[(InvalidType, usize)]) {
    for (reason, count) in counts.iter().filter(|(_, count)| *count > 0) {
        STRATEGY_INVALID_TOTAL
            .with_label_values(&[reason.as_str()])
            .inc_by(*count as f64);
    }
}

/// Current registry contents in the text exposition format.
pub fn metrics_text() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
