//! Process-wide metrics registry.
//!
//! Metrics live in a `prometheus::Registry` and are exported from
//! `/metrics` in the text exposition format. Each metric is also kept by its
//! dotted daemon name (`recordservice.running-planner`) so `/varz` and the
//! readiness checks can look it up without parsing the export.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use anyhow::{Context, Result};
use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Name used in the Prometheus export, e.g. `recordservice_running_planner`.
pub fn export_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// A gauge that can only move from 0 to 1.
#[derive(Clone)]
pub struct FlagGauge {
    gauge: IntGauge,
    first_set: Arc<OnceLock<()>>,
}

impl FlagGauge {
    /// Set the flag. Returns `true` if this call was the one that set it.
    pub fn set(&self) -> bool {
        let first = self.first_set.set(()).is_ok();
        self.gauge.set(1);
        first
    }

    pub fn get(&self) -> bool {
        self.gauge.get() != 0
    }
}

impl fmt::Debug for FlagGauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagGauge").field("set", &self.get()).finish()
    }
}

/// A string value written once, e.g. the service id or start time.
///
/// Exported as an info-style gauge: `name{value="..."} 1`.
#[derive(Clone)]
pub struct Property {
    value: Arc<OnceLock<String>>,
    info: IntGaugeVec,
}

impl Property {
    /// Set the value. Later calls are ignored and return `false`.
    pub fn set(&self, value: impl Into<String>) -> bool {
        let value = value.into();
        if self.value.set(value.clone()).is_err() {
            return false;
        }
        self.info.with_label_values(&[value.as_str()]).set(1);
        true
    }

    pub fn get(&self) -> Option<&str> {
        self.value.get().map(String::as_str)
    }
}

#[derive(Default)]
struct Handles {
    flags: BTreeMap<String, FlagGauge>,
    counters: BTreeMap<String, IntCounter>,
    properties: BTreeMap<String, Property>,
}

/// Point-in-time copy of every registered metric, keyed by daemon name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub flags: BTreeMap<String, bool>,
    pub counters: BTreeMap<String, u64>,
    pub properties: BTreeMap<String, String>,
}

/// Registry of named metrics shared by the whole process.
pub struct MetricsRegistry {
    registry: Registry,
    handles: RwLock<Handles>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            handles: RwLock::new(Handles::default()),
        }
    }

    /// Register a flag, or return the existing one with the same name.
    pub fn flag(&self, name: &str, help: &str) -> Result<FlagGauge> {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(flag) = handles.flags.get(name) {
            return Ok(flag.clone());
        }

        let gauge = IntGauge::with_opts(Opts::new(export_name(name), help))
            .with_context(|| format!("Invalid flag metric {}", name))?;
        self.register(name, &gauge)?;

        let flag = FlagGauge {
            gauge,
            first_set: Arc::new(OnceLock::new()),
        };
        handles.flags.insert(name.to_string(), flag.clone());
        Ok(flag)
    }

    /// Register a counter, or return the existing one with the same name.
    pub fn counter(&self, name: &str, help: &str) -> Result<IntCounter> {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(counter) = handles.counters.get(name) {
            return Ok(counter.clone());
        }

        let counter = IntCounter::with_opts(Opts::new(export_name(name), help))
            .with_context(|| format!("Invalid counter metric {}", name))?;
        self.register(name, &counter)?;

        handles.counters.insert(name.to_string(), counter.clone());
        Ok(counter)
    }

    /// Register a property, or return the existing one with the same name.
    pub fn property(&self, name: &str, help: &str) -> Result<Property> {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(property) = handles.properties.get(name) {
            return Ok(property.clone());
        }

        let info = IntGaugeVec::new(Opts::new(export_name(name), help), &["value"])
            .with_context(|| format!("Invalid property metric {}", name))?;
        self.register(name, &info)?;

        let property = Property {
            value: Arc::new(OnceLock::new()),
            info,
        };
        handles.properties.insert(name.to_string(), property.clone());
        Ok(property)
    }

    /// Add a collector owned elsewhere, e.g. the RPC trace vectors.
    pub fn register<C>(&self, name: &str, collector: &C) -> Result<()>
    where
        C: Collector + Clone + 'static,
    {
        self.registry
            .register(Box::new(collector.clone()))
            .with_context(|| format!("Failed to register metric {}", name))
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Every registered metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics export is not valid UTF-8")
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        MetricsSnapshot {
            flags: handles
                .flags
                .iter()
                .map(|(name, flag)| (name.clone(), flag.get()))
                .collect(),
            counters: handles
                .counters
                .iter()
                .map(|(name, counter)| (name.clone(), counter.get()))
                .collect(),
            properties: handles
                .properties
                .iter()
                .filter_map(|(name, prop)| prop.get().map(|v| (name.clone(), v.to_string())))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_sets_once() {
        let registry = MetricsRegistry::new();
        let flag = registry.flag("test.flag", "a flag").unwrap();
        assert!(!flag.get());
        assert!(flag.set());
        assert!(!flag.set());
        assert!(flag.get());
    }

    #[test]
    fn test_same_name_returns_same_metric() {
        let registry = MetricsRegistry::new();
        let a = registry.counter("rpc.calls", "calls").unwrap();
        let b = registry.counter("rpc.calls", "ignored").unwrap();
        a.inc_by(2);
        b.inc_by(3);
        assert_eq!(a.get(), 5);
    }

    #[test]
    fn test_property_is_write_once() {
        let registry = MetricsRegistry::new();
        let prop = registry
            .property("process.service-id", "service id")
            .unwrap();
        assert!(prop.get().is_none());
        assert!(prop.set("first"));
        assert!(!prop.set("second"));
        assert_eq!(prop.get(), Some("first"));
    }

    #[test]
    fn test_snapshot_skips_unset_properties() {
        let registry = MetricsRegistry::new();
        registry.flag("ready", "ready").unwrap().set();
        registry.counter("calls", "calls").unwrap().inc();
        registry.property("unset", "never set").unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.flags.get("ready"), Some(&true));
        assert_eq!(snapshot.counters.get("calls"), Some(&1));
        assert!(snapshot.properties.is_empty());
    }

    #[test]
    fn test_export_uses_prometheus_names() {
        let registry = MetricsRegistry::new();
        registry
            .flag("recordservice.running-planner", "planner up")
            .unwrap()
            .set();
        registry
            .counter("thread-manager.total-threads-created", "threads")
            .unwrap()
            .inc_by(3);
        registry
            .property("recordserviced.version", "version")
            .unwrap()
            .set("1.2.3");

        let text = registry.encode_text().unwrap();
        assert!(text.contains("# HELP recordservice_running_planner planner up"));
        assert!(text.contains("recordservice_running_planner 1"));
        assert!(text.contains("thread_manager_total_threads_created 3"));
        assert!(text.contains(r#"recordserviced_version{value="1.2.3"} 1"#));
    }

    #[test]
    fn test_names_colliding_after_export_are_rejected() {
        let registry = MetricsRegistry::new();
        registry.counter("rpc.calls", "calls").unwrap();
        assert!(registry.counter("rpc-calls", "calls").is_err());
    }
}
