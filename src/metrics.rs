use crate::migration::Operation;
use once_cell::sync::Lazy;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider as _},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Registry, TextEncoder};

pub static METRICS: Lazy<TidelineMetrics> = Lazy::new(TidelineMetrics::init);

pub struct TidelineMetrics {
    registry: Registry,
    _provider: Option<SdkMeterProvider>,
    pub steps_total: Counter<u64>,
    pub steps_failed: Counter<u64>,
    pub step_duration: Histogram<f64>,
}

impl TidelineMetrics {
    pub fn init() -> Self {
        let registry = Registry::new();
        let (meter, provider) = match opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
        {
            Ok(exporter) => {
                let provider = SdkMeterProvider::builder().with_reader(exporter).build();
                (provider.meter("tideline"), Some(provider))
            }
            Err(e) => {
                log::warn!(
                    "Prometheus exporter unavailable, metrics go to the global meter: {}",
                    e
                );
                (global::meter("tideline"), None)
            }
        };

        let steps_total = meter
            .u64_counter("tideline_migration_steps")
            .with_description("Migration steps executed")
            .build();

        let steps_failed = meter
            .u64_counter("tideline_migration_steps_failed")
            .with_description("Migration steps that failed")
            .build();

        let step_duration = meter
            .f64_histogram("tideline_migration_step_duration_seconds")
            .with_description("Duration of migration steps")
            .build();

        Self {
            registry,
            _provider: provider,
            steps_total,
            steps_failed,
            step_duration,
        }
    }

    pub fn record_step(&self, operation: Operation, elapsed: std::time::Duration, succeeded: bool) {
        let attributes = [KeyValue::new("operation", operation.as_str())];
        self.steps_total.add(1, &attributes);
        if !succeeded {
            self.steps_failed.add(1, &attributes);
        }
        self.step_duration.record(elapsed.as_secs_f64(), &attributes);
    }

    /// Prometheus text exposition of everything recorded so far
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut out = String::new();
        TextEncoder::new().encode_utf8(&self.registry.gather(), &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_recorded_steps_are_exported() {
        METRICS.record_step(Operation::Apply, Duration::from_millis(3), true);
        METRICS.record_step(Operation::Rollback, Duration::from_millis(1), false);
        let text = METRICS.render().expect("render");
        assert!(text.contains("tideline_migration_steps"));
    }
}
