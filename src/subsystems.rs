//! Native integration bootstrap.
//!
//! The integrations hold process-global, non-reentrant state, so the steps
//! run in order, stop at the first failure, and are never retried. `run`
//! consumes the bootstrapper to keep it at-most-once.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::config::SubsystemConfig;
use crate::error::{BootstrapError, BootstrapResult};

/// File the HBase bindings read from the storage configuration directory.
pub const HBASE_SITE_FILE: &str = "hbase-site.xml";

/// Property the table factory needs to reach the HBase cluster.
pub const HBASE_QUORUM_PROPERTY: &str = "hbase.zookeeper.quorum";

/// Largest client-side write buffer the table writer accepts.
pub const MAX_HBASE_WRITE_BUFFER: u64 = 1 << 30;

/// One named initialization step.
pub trait SubsystemStep: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self, config: &SubsystemConfig) -> Result<()>;
}

type StepFn = Box<dyn Fn(&SubsystemConfig) -> Result<()> + Send + Sync>;

/// A step backed by a closure.
pub struct FnStep {
    name: String,
    init: StepFn,
}

impl FnStep {
    pub fn new<F>(name: impl Into<String>, init: F) -> Self
    where
        F: Fn(&SubsystemConfig) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            init: Box::new(init),
        }
    }
}

impl SubsystemStep for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, config: &SubsystemConfig) -> Result<()> {
        (self.init)(config)
    }
}

/// Ordered list of subsystem steps.
#[derive(Default)]
pub struct SubsystemBootstrapper {
    steps: Vec<Box<dyn SubsystemStep>>,
}

impl SubsystemBootstrapper {
    /// An empty bootstrapper.
    pub fn new() -> Self {
        Self::default()
    }

    /// The daemon's native integrations, in initialization order.
    pub fn with_default_steps() -> Self {
        Self::new()
            .register(FnStep::new("codegen-backend", init_codegen))
            .register(FnStep::new("storage-client", init_storage_client))
            .register(FnStep::new("hbase-table-scanner", init_hbase_scanner))
            .register(FnStep::new("hbase-table-factory", init_hbase_factory))
            .register(FnStep::new("hbase-table-writer", init_hbase_writer))
            .register(FnStep::new("frontend-support", init_frontend_support))
    }

    /// Append a step to the end of the list.
    pub fn register(mut self, step: impl SubsystemStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, stopping at the first failure.
    ///
    /// Returns the names of the steps that completed.
    pub fn run(self, config: &SubsystemConfig) -> BootstrapResult<Vec<String>> {
        let mut completed = Vec::with_capacity(self.steps.len());

        for step in self.steps {
            debug!(step = step.name(), "Initializing subsystem");
            step.init(config).map_err(|cause| BootstrapError::Subsystem {
                step: step.name().to_string(),
                cause,
            })?;
            info!(step = step.name(), "Subsystem initialized");
            completed.push(step.name().to_string());
        }

        Ok(completed)
    }
}

fn init_codegen(config: &SubsystemConfig) -> Result<()> {
    if config.codegen_opt_level > 3 {
        bail!(
            "unsupported code generation optimization level {} (expected 0..=3)",
            config.codegen_opt_level
        );
    }
    Ok(())
}

fn init_storage_client(config: &SubsystemConfig) -> Result<()> {
    let Some(dir) = config.storage_conf_dir.as_deref() else {
        debug!("No storage configuration directory set, using client defaults");
        return Ok(());
    };

    let metadata = std::fs::metadata(dir)
        .with_context(|| format!("storage configuration directory {}", dir.display()))?;
    if !metadata.is_dir() {
        bail!("storage configuration path {} is not a directory", dir.display());
    }
    Ok(())
}

fn init_hbase_scanner(config: &SubsystemConfig) -> Result<()> {
    if !config.hbase_enabled {
        return Ok(());
    }
    let site = hbase_site(config.storage_conf_dir.as_deref())?;
    if !site.is_file() {
        bail!("HBase configuration {} not found", site.display());
    }
    Ok(())
}

fn init_hbase_factory(config: &SubsystemConfig) -> Result<()> {
    if !config.hbase_enabled {
        return Ok(());
    }
    let site = hbase_site(config.storage_conf_dir.as_deref())?;
    let contents = std::fs::read_to_string(&site)
        .with_context(|| format!("Failed to read HBase configuration {}", site.display()))?;
    if !contents.contains(HBASE_QUORUM_PROPERTY) {
        bail!(
            "HBase configuration {} does not set {}",
            site.display(),
            HBASE_QUORUM_PROPERTY
        );
    }
    Ok(())
}

fn init_hbase_writer(config: &SubsystemConfig) -> Result<()> {
    if !config.hbase_enabled {
        return Ok(());
    }
    let buffer = config.hbase_write_buffer_bytes;
    if buffer == 0 || buffer > MAX_HBASE_WRITE_BUFFER {
        bail!(
            "HBase write buffer of {} bytes is outside 1..={}",
            buffer,
            MAX_HBASE_WRITE_BUFFER
        );
    }
    Ok(())
}

fn init_frontend_support(config: &SubsystemConfig) -> Result<()> {
    for entry in &config.frontend_classpath {
        // `dir/*` names every jar in `dir`.
        let path = match entry.file_name() {
            Some(name) if name == "*" => entry
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new(".")),
            _ => entry.as_path(),
        };
        if !path.exists() {
            bail!("frontend classpath entry {} does not exist", entry.display());
        }
    }
    debug!(
        entries = config.frontend_classpath.len(),
        "Frontend classpath verified"
    );
    Ok(())
}

fn hbase_site(conf_dir: Option<&Path>) -> Result<PathBuf> {
    conf_dir
        .map(|dir| dir.join(HBASE_SITE_FILE))
        .context("HBase bindings require a storage configuration directory")
}
