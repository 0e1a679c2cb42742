use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Failed to build prometheus exporter: {0}")]
    Exporter(String),
}

pub struct Metrics {
    request_counter: Counter<u64>,
    detection_duration: Histogram<u64>,
    detection_errors: Counter<u64>,
    detection_fps: Gauge<f64>,
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| MetricsError::Exporter(e.to_string()))?;

        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("live_overlay");
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("control_requests_total")
            .with_description("Total number of control surface requests")
            .build();

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));

        let detection_duration = meter
            .u64_histogram("detection_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Round trip of detection requests in milliseconds")
            .build();

        let detection_errors = meter
            .u64_counter("detection_errors_total")
            .with_description("Failed detection requests by error kind")
            .build();

        let detection_fps = meter
            .f64_gauge("detection_fps")
            .with_description("Frames per second processed by the detection loop")
            .build();

        Ok(Metrics {
            request_counter,
            detection_duration,
            detection_errors,
            detection_fps,
            _provider: provider,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_detection_duration(&self, duration_ms: u64) {
        self.detection_duration.record(duration_ms, &[]);
    }

    pub fn record_detection_error(&self, kind: &'static str) {
        let attributes = vec![KeyValue::new("kind", kind)];
        self.detection_errors.add(1, &attributes);
    }

    pub fn record_detection_fps(&self, fps: f64) {
        self.detection_fps.record(fps, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (2, 22, 26, 46, 146);
        let get = generate_boundaries(parts);
        let expected = vec![2.0, 12.0, 22.0, 24.0, 26.0, 46.0, 146.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_detection_boundaries_are_increasing() {
        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));
        assert!(boundaries.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(boundaries.first(), Some(&15.0));
        assert_eq!(boundaries.last(), Some(&1000.0));
    }
}
