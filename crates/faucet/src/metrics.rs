//! Prometheus metrics of request processing

use drip_core::ExecutionResult;
use prometheus::{histogram_opts, opts, Encoder, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::time::Duration;

/// Request processing metrics
#[derive(Debug, Clone)]
pub struct FaucetMetrics {
    registry: Registry,

    /// Processed requests by network and result code
    pub requests_total: IntCounterVec,
    pub request_duration: HistogramVec,
    pub requests_in_flight: IntGauge,
}

impl FaucetMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            opts!("drip_requests_total", "Total number of processed faucet requests"),
            &["network", "result"],
        )?;

        let request_duration = HistogramVec::new(
            histogram_opts!(
                "drip_request_duration_seconds",
                "Time spent processing a faucet request",
                vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
            ),
            &["network"],
        )?;

        let requests_in_flight = IntGauge::with_opts(opts!(
            "drip_requests_in_flight",
            "Number of faucet requests currently being processed"
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            requests_in_flight,
        })
    }

    pub fn record_result(&self, network: &str, result: ExecutionResult, elapsed: Duration) {
        self.requests_total
            .with_label_values(&[network, result.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[network])
            .observe(elapsed.as_secs_f64());
    }

    /// Text exposition format
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
