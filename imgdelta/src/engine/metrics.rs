use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};

use crate::selector::AlgorithmChoice;

pub struct EngineMetrics {
    pub lease_expired: Counter<u64>,
    pub compute_duration: Histogram<f64>,
    pub compute_failures: Counter<u64>,
}

impl EngineMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            lease_expired: meter
                .u64_counter("delta_lease_expired_total")
                .with_description("Leases found expired and replaced")
                .init(),
            compute_duration: meter
                .f64_histogram("delta_compute_seconds")
                .with_description("Time to compute and push a delta")
                .with_unit(Unit::new("s"))
                .init(),
            compute_failures: meter
                .u64_counter("delta_compute_failures_total")
                .with_description("Delta computations that failed")
                .init(),
        }
    }

    pub fn algorithm_attributes(choice: &AlgorithmChoice) -> [KeyValue; 2] {
        [
            KeyValue::new("differ", choice.differ.name()),
            KeyValue::new("compressor", choice.compressor.to_string()),
        ]
    }
}
