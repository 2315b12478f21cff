use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use recordserviced::error::EXIT_FATAL;
use recordserviced::{ConfigOverrides, DaemonConfig};

#[derive(Parser)]
#[command(name = "recordserviced")]
#[command(about = "Record service daemon running the planner and/or worker services")]
struct Cli {
    /// JSON config file; flags below override its values
    #[arg(long, env = "RECORDSERVICE_CONFIG")]
    config: Option<PathBuf>,
    /// Planner service port (0 disables the planner)
    #[arg(long, env = "RECORDSERVICE_PLANNER_PORT")]
    planner_port: Option<u16>,
    /// Worker service port (0 disables the worker)
    #[arg(long, env = "RECORDSERVICE_WORKER_PORT")]
    worker_port: Option<u16>,
    /// Hostname advertised to the cluster
    #[arg(long, env = "RECORDSERVICE_HOSTNAME")]
    hostname: Option<String>,
    /// Interface the planner and worker listeners bind to
    #[arg(long, env = "RECORDSERVICE_RPC_INTERFACE")]
    rpc_interface: Option<IpAddr>,
    /// Diagnostic webserver port
    #[arg(long, env = "RECORDSERVICE_WEBSERVER_PORT")]
    webserver_port: Option<u16>,
    /// Diagnostic webserver interface
    #[arg(long, env = "RECORDSERVICE_WEBSERVER_INTERFACE")]
    webserver_interface: Option<IpAddr>,
    /// Do not start the diagnostic webserver
    #[arg(long, env = "RECORDSERVICE_DISABLE_WEBSERVER", default_value_t = false)]
    disable_webserver: bool,
    /// Storage client configuration directory
    #[arg(long, env = "RECORDSERVICE_STORAGE_CONF_DIR")]
    storage_conf_dir: Option<PathBuf>,
    /// Load the HBase bindings
    #[arg(long = "hbase", env = "RECORDSERVICE_HBASE", default_value_t = false)]
    hbase_enabled: bool,
    /// Code generation optimization level (0-3)
    #[arg(long, env = "RECORDSERVICE_CODEGEN_OPT_LEVEL")]
    codegen_opt_level: Option<u8>,
    /// Frontend classpath, `:`-separated
    #[arg(long, env = "RECORDSERVICE_FRONTEND_CLASSPATH", value_delimiter = ':')]
    frontend_classpath: Vec<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            planner_port: self.planner_port,
            worker_port: self.worker_port,
            hostname: self.hostname.clone(),
            rpc_interface: self.rpc_interface,
            webserver_port: self.webserver_port,
            webserver_interface: self.webserver_interface,
            disable_webserver: self.disable_webserver,
            storage_conf_dir: self.storage_conf_dir.clone(),
            hbase_enabled: self.hbase_enabled,
            codegen_opt_level: self.codegen_opt_level,
            frontend_classpath: (!self.frontend_classpath.is_empty())
                .then(|| self.frontend_classpath.clone()),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("recordserviced=info,tower_http=warn,warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match DaemonConfig::load(cli.config.as_deref(), cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };
    info!(
        planner_port = config.planner_port,
        worker_port = config.worker_port,
        hostname = %config.hostname,
        "Starting recordserviced"
    );

    match recordserviced::run(config).await {
        Ok(()) => {
            info!("recordserviced shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => ExitCode::from(e.exit_code()),
    }
}
