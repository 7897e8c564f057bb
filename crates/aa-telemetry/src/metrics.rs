//! Prometheus metrics for the AA engine.
//!
//! All metrics follow the naming convention: `aa_<metric>_<unit>`

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, linear_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // TRIGGER HANDLER (Subsystem 2)
    // =========================================================================

    /// Primary triggers handled
    pub static ref TRIGGERS_TOTAL: IntCounter = IntCounter::new(
        "aa_triggers_total",
        "Total number of primary triggers handled"
    ).expect("metric creation failed");

    /// Primary triggers that bounced
    pub static ref BOUNCES_TOTAL: IntCounter = IntCounter::new(
        "aa_bounces_total",
        "Total number of primary triggers that bounced"
    ).expect("metric creation failed");

    /// Responses recorded, primary and secondary
    pub static ref RESPONSES_TOTAL: IntCounter = IntCounter::new(
        "aa_responses_total",
        "Total number of AA responses recorded"
    ).expect("metric creation failed");

    /// Response units composed
    pub static ref RESPONSE_UNITS_TOTAL: IntCounter = IntCounter::new(
        "aa_response_units_total",
        "Total number of response units composed"
    ).expect("metric creation failed");

    /// Time spent on one primary trigger and its cascade
    pub static ref TRIGGER_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "aa_trigger_duration_seconds",
            "Time spent handling a primary trigger"
        ).buckets(exponential_buckets(0.0001, 2.0, 14).expect("metric creation failed"))
    ).expect("metric creation failed");

    /// Failed consistency scans
    pub static ref INVARIANT_VIOLATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("aa_invariant_violations_total", "Consistency scan failures"),
        &["check"]  // check: balances/storage_sizes
    ).expect("metric creation failed");

    // =========================================================================
    // FORMULA ENGINE (Subsystem 1)
    // =========================================================================

    /// Complexity of accepted definitions
    pub static ref FORMULA_COMPLEXITY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "aa_formula_complexity",
            "Validated complexity of accepted AA definitions"
        ).buckets(linear_buckets(0.0, 10.0, 11).expect("metric creation failed"))
    ).expect("metric creation failed");

    /// Definitions rejected by the validator
    pub static ref DEFINITIONS_REJECTED: IntCounter = IntCounter::new(
        "aa_definitions_rejected_total",
        "Total number of AA definitions rejected by validation"
    ).expect("metric creation failed");
}

/// Registers every metric with [`REGISTRY`]. Calling it twice is harmless.
///
/// # Errors
///
/// Returns `TelemetryError::MetricsInit` if a metric cannot be registered.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TRIGGERS_TOTAL.clone()),
        Box::new(BOUNCES_TOTAL.clone()),
        Box::new(RESPONSES_TOTAL.clone()),
        Box::new(RESPONSE_UNITS_TOTAL.clone()),
        Box::new(TRIGGER_DURATION.clone()),
        Box::new(INVARIANT_VIOLATIONS.clone()),
        Box::new(FORMULA_COMPLEXITY.clone()),
        Box::new(DEFINITIONS_REJECTED.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Encodes all registered metrics in Prometheus text format.
///
/// # Errors
///
/// Returns `TelemetryError::MetricsInit` if encoding fails.
pub fn gather_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Records one handled primary trigger.
pub fn record_trigger(bounced: bool, responses: usize, units: usize, seconds: f64) {
    TRIGGERS_TOTAL.inc();
    if bounced {
        BOUNCES_TOTAL.inc();
    }
    RESPONSES_TOTAL.inc_by(responses as u64);
    RESPONSE_UNITS_TOTAL.inc_by(units as u64);
    TRIGGER_DURATION.observe(seconds);
}

/// Records the complexity of an accepted definition.
pub fn observe_complexity(complexity: u32) {
    FORMULA_COMPLEXITY.observe(f64::from(complexity));
}

/// Records a rejected definition.
pub fn record_rejected_definition() {
    DEFINITIONS_REJECTED.inc();
}

/// Records a failed consistency scan.
pub fn record_invariant_violation(check: &str) {
    INVARIANT_VIOLATIONS.with_label_values(&[check]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice() {
        register_metrics().unwrap();
        register_metrics().unwrap();
    }

    #[test]
    fn test_record_trigger() {
        let before = BOUNCES_TOTAL.get();
        record_trigger(true, 1, 1, 0.002);
        assert!(BOUNCES_TOTAL.get() > before);
        assert!(TRIGGERS_TOTAL.get() >= 1);
    }

    #[test]
    fn test_gather_includes_counters() {
        register_metrics().unwrap();
        record_invariant_violation("balances");
        let text = gather_metrics().unwrap();
        assert!(text.contains("aa_triggers_total"));
        assert!(text.contains("aa_invariant_violations_total"));
    }
}
