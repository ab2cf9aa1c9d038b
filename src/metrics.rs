use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};
use tracing::trace;

pub fn describe() {
    describe_counter!(
        "fixedprice_requests_total",
        Unit::Count,
        "HTTP requests by route"
    );
    describe_counter!(
        "fixedprice_classifications_total",
        Unit::Count,
        "Classifier outcomes by status and whether the safe default was used"
    );
    describe_counter!(
        "fixedprice_classifier_retries_total",
        Unit::Count,
        "Backend retries by failure class"
    );
    describe_histogram!(
        "fixedprice_stage_duration_seconds",
        Unit::Seconds,
        "Service stage latency"
    );
}

pub fn inc_requests(route: &'static str) {
    counter!("fixedprice_requests_total", "route" => route).increment(1);
    trace!(target = "fixedprice.metrics", route, "requests_total_inc");
}

pub fn classification(status: &'static str, fallback: bool) {
    counter!(
        "fixedprice_classifications_total",
        "status" => status,
        "fallback" => if fallback { "true" } else { "false" }
    )
    .increment(1);
}

pub fn classifier_retry(class: &'static str) {
    counter!("fixedprice_classifier_retries_total", "class" => class).increment(1);
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    histogram!("fixedprice_stage_duration_seconds", "stage" => stage)
        .record(elapsed_ms as f64 / 1000.0);
    trace!(
        target = "fixedprice.metrics",
        stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
