//! RPC event tracing: call counts, errors and latency per service method.
//!
//! Counts and latencies are Prometheus vectors labelled by service and
//! method, so they show up in `/metrics` next to the process metrics.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};
use serde::Serialize;

use crate::metrics::MetricsRegistry;

const LABELS: &[&str] = &["service", "method"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcMethodSummary {
    pub service: String,
    pub method: String,
    pub calls: u64,
    pub errors: u64,
    pub mean_micros: u64,
}

pub struct RpcTracer {
    calls: IntCounterVec,
    errors: IntCounterVec,
    latency: HistogramVec,
    // Label pairs seen since the last reset, for the `/rpcz` summary.
    seen: Mutex<BTreeSet<(String, String)>>,
}

impl RpcTracer {
    pub fn new(metrics: &MetricsRegistry) -> Result<Self> {
        let calls = IntCounterVec::new(
            Opts::new("recordservice_rpc_calls_total", "RPCs handled by method"),
            LABELS,
        )
        .context("Invalid RPC call counter")?;
        let errors = IntCounterVec::new(
            Opts::new("recordservice_rpc_errors_total", "Failed RPCs by method"),
            LABELS,
        )
        .context("Invalid RPC error counter")?;
        let latency = HistogramVec::new(
            HistogramOpts::new("recordservice_rpc_duration_seconds", "RPC latency by method")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            LABELS,
        )
        .context("Invalid RPC latency histogram")?;

        metrics.register("recordservice.rpc.calls", &calls)?;
        metrics.register("recordservice.rpc.errors", &errors)?;
        metrics.register("recordservice.rpc.duration", &latency)?;

        Ok(Self {
            calls,
            errors,
            latency,
            seen: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn record(&self, service: &str, method: &str, elapsed: Duration, ok: bool) {
        let labels = [service, method];
        self.calls.with_label_values(&labels).inc();
        if !ok {
            self.errors.with_label_values(&labels).inc();
        }
        self.latency
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());

        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((service.to_string(), method.to_string()));
    }

    pub fn summary(&self) -> Vec<RpcMethodSummary> {
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.iter()
            .map(|(service, method)| {
                let labels = [service.as_str(), method.as_str()];
                let latency = self.latency.with_label_values(&labels);
                let mean_secs = match latency.get_sample_count() {
                    0 => 0.0,
                    n => latency.get_sample_sum() / n as f64,
                };
                RpcMethodSummary {
                    service: service.clone(),
                    method: method.clone(),
                    calls: self.calls.with_label_values(&labels).get(),
                    errors: self.errors.with_label_values(&labels).get(),
                    mean_micros: (mean_secs * 1_000_000.0).round() as u64,
                }
            })
            .collect()
    }

    pub fn reset(&self) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        self.calls.reset();
        self.errors.reset();
        self.latency.reset();
        seen.clear();
    }
}
