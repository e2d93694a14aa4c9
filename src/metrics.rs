// dpau: Prometheus metrics

use crate::error::{EngineError, EngineResult};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Request-level metrics exposed on /metrics.
pub struct HttpMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    requests_5xx_total: IntCounterVec,
    request_latency: HistogramVec,
}

impl HttpMetrics {
    pub fn new() -> EngineResult<Self> {
        let registry = Registry::new();
        let requests_total = IntCounterVec::new(
            Opts::new("app_requests_total", "Total HTTP requests"),
            &["handler", "method", "status"],
        )
        .map_err(|e| EngineError::Fatal(format!("metrics setup: {}", e)))?;
        let requests_5xx_total = IntCounterVec::new(
            Opts::new("app_requests_5xx_total", "HTTP requests answered 5xx"),
            &["handler", "method"],
        )
        .map_err(|e| EngineError::Fatal(format!("metrics setup: {}", e)))?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "app_request_latency_seconds",
                "HTTP request latency in seconds",
            ),
            &["handler", "method"],
        )
        .map_err(|e| EngineError::Fatal(format!("metrics setup: {}", e)))?;

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(requests_5xx_total.clone()),
            Box::new(request_latency.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| EngineError::Fatal(format!("metrics setup: {}", e)))?;
        }

        Ok(Self {
            registry,
            requests_total,
            requests_5xx_total,
            request_latency,
        })
    }

    pub fn observe(&self, handler: &str, method: &str, status: u16, latency_secs: f64) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[handler, method, &status])
            .inc();
        if status.starts_with('5') {
            self.requests_5xx_total
                .with_label_values(&[handler, method])
                .inc();
        }
        self.request_latency
            .with_label_values(&[handler, method])
            .observe(latency_secs);
    }

    /// Text exposition of the registry.
    pub fn render(&self) -> EngineResult<String> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| EngineError::Fatal(format!("metrics encode: {}", e)))?;
        String::from_utf8(buf).map_err(|e| EngineError::Fatal(format!("metrics encode: {}", e)))
    }
}
