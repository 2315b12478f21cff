use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::{env, fs, path::Path, path::PathBuf};

use anyhow::Context;
use sysinfo::System;

use crate::error::{BootstrapError, BootstrapResult};
use crate::roles::EnabledRoles;

pub const DEFAULT_PLANNER_PORT: u16 = 12050;
pub const DEFAULT_WORKER_PORT: u16 = 13050;
pub const DEFAULT_WEBSERVER_PORT: u16 = 11050;

/// Process-wide configuration, fixed once the daemon starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Planner RPC port, `0` disables the planner role.
    pub planner_port: u16,
    /// Worker RPC port, `0` disables the worker role.
    pub worker_port: u16,
    /// Hostname this daemon advertises to the cluster.
    pub hostname: String,
    /// Interface the role listeners bind to.
    pub rpc_interface: IpAddr,
    pub webserver: WebserverConfig,
    pub subsystems: SubsystemConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            planner_port: DEFAULT_PLANNER_PORT,
            worker_port: DEFAULT_WORKER_PORT,
            hostname: default_hostname(),
            rpc_interface: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            webserver: WebserverConfig::default(),
            subsystems: SubsystemConfig::default(),
        }
    }
}

/// Diagnostic web endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebserverConfig {
    pub enabled: bool,
    pub interface: IpAddr,
    pub port: u16,
}

impl Default for WebserverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_WEBSERVER_PORT,
        }
    }
}

/// Settings consumed by the native integration steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsystemConfig {
    /// Optimization level handed to the code generation backend (0..=3).
    pub codegen_opt_level: u8,
    /// Directory holding the storage client configuration.
    pub storage_conf_dir: Option<PathBuf>,
    /// Load the HBase scanner, table factory and writer bindings.
    pub hbase_enabled: bool,
    /// Client-side write buffer of the HBase table writer.
    pub hbase_write_buffer_bytes: u64,
    /// Jars and directories the frontend bridge loads; `dir/*` for all jars
    /// in `dir`.
    pub frontend_classpath: Vec<PathBuf>,
}

impl Default for SubsystemConfig {
    fn default() -> Self {
        Self {
            codegen_opt_level: 2,
            storage_conf_dir: None,
            hbase_enabled: false,
            hbase_write_buffer_bytes: 2 * 1024 * 1024,
            frontend_classpath: Vec::new(),
        }
    }
}

/// Values given on the command line or through `RECORDSERVICE_*` variables.
/// Anything set here wins over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub planner_port: Option<u16>,
    pub worker_port: Option<u16>,
    pub hostname: Option<String>,
    pub rpc_interface: Option<IpAddr>,
    pub webserver_port: Option<u16>,
    pub webserver_interface: Option<IpAddr>,
    pub disable_webserver: bool,
    pub storage_conf_dir: Option<PathBuf>,
    pub hbase_enabled: bool,
    pub codegen_opt_level: Option<u8>,
    pub frontend_classpath: Option<Vec<PathBuf>>,
}

impl DaemonConfig {
    /// Load defaults, then the optional JSON file, then the overrides.
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: DaemonConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(expand_config(config))
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(port) = overrides.planner_port {
            self.planner_port = port;
        }
        if let Some(port) = overrides.worker_port {
            self.worker_port = port;
        }
        if let Some(hostname) = overrides.hostname {
            self.hostname = hostname;
        }
        if let Some(interface) = overrides.rpc_interface {
            self.rpc_interface = interface;
        }
        if let Some(port) = overrides.webserver_port {
            self.webserver.port = port;
        }
        if let Some(interface) = overrides.webserver_interface {
            self.webserver.interface = interface;
        }
        if overrides.disable_webserver {
            self.webserver.enabled = false;
        }
        if let Some(dir) = overrides.storage_conf_dir {
            self.subsystems.storage_conf_dir = Some(dir);
        }
        if overrides.hbase_enabled {
            self.subsystems.hbase_enabled = true;
        }
        if let Some(level) = overrides.codegen_opt_level {
            self.subsystems.codegen_opt_level = level;
        }
        if let Some(classpath) = overrides.frontend_classpath {
            self.subsystems.frontend_classpath = classpath;
        }
    }

    /// Check startup preconditions and return the enabled roles.
    ///
    /// Runs before any side effect so a misconfigured daemon never touches
    /// native state or binds a port.
    pub fn validate(&self) -> BootstrapResult<EnabledRoles> {
        let roles = EnabledRoles::from_ports(self.planner_port, self.worker_port)
            .ok_or(BootstrapError::NoRoleEnabled)?;

        validate_hostname(&self.hostname).map_err(BootstrapError::InvalidConfig)?;

        Ok(roles)
    }
}

fn default_hostname() -> String {
    resolve_hostname(env::var("HOSTNAME").ok(), System::host_name())
}

/// Prefers an exported `HOSTNAME` over the kernel's host name.
fn resolve_hostname(from_env: Option<String>, from_os: Option<String>) -> String {
    [from_env, from_os]
        .into_iter()
        .flatten()
        .map(|h| h.trim().to_string())
        .find(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Accepts IP literals and RFC 1123 host names.
pub fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    if hostname.is_empty() {
        return Err("hostname must not be empty".to_string());
    }
    if hostname.len() > 253 {
        return Err(format!("hostname `{}` is longer than 253 characters", hostname));
    }

    for label in hostname.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(format!("hostname `{}` is malformed", hostname));
        }
    }

    Ok(())
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_config(mut cfg: DaemonConfig) -> DaemonConfig {
    cfg.hostname = expand_env_vars(&cfg.hostname);
    if let Some(dir) = cfg.subsystems.storage_conf_dir.as_mut() {
        *dir = PathBuf::from(expand_env_vars(&dir.to_string_lossy()));
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::Role;
    use std::io::Write;

    #[test]
    fn test_defaults_enable_both_roles() {
        let config = DaemonConfig {
            hostname: "node-1".to_string(),
            ..Default::default()
        };
        let roles = config.validate().unwrap();
        assert!(roles.contains(Role::Planner));
        assert!(roles.contains(Role::Worker));
        assert!(config.webserver.enabled);
    }

    #[test]
    fn test_both_ports_zero_is_rejected() {
        let config = DaemonConfig {
            planner_port: 0,
            worker_port: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BootstrapError::NoRoleEnabled)
        ));
    }

    #[test]
    fn test_malformed_hostname_is_rejected() {
        let config = DaemonConfig {
            hostname: "bad host!".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BootstrapError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("node-1.cluster.local").is_ok());
        assert!(validate_hostname("10.0.0.7").is_ok());
        assert!(validate_hostname("::1").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("-node").is_err());
        assert!(validate_hostname("a..b").is_err());
        assert!(validate_hostname(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_default_hostname_uses_os_name_without_env() {
        let os_name = System::host_name().filter(|h| !h.trim().is_empty());
        let resolved = resolve_hostname(None, os_name.clone());

        match os_name {
            Some(name) => assert_eq!(resolved, name.trim()),
            None => assert_eq!(resolved, "localhost"),
        }
        assert_eq!(
            resolve_hostname(None, Some("worker-07.cluster".to_string())),
            "worker-07.cluster"
        );
    }

    #[test]
    fn test_hostname_resolution_order() {
        assert_eq!(
            resolve_hostname(Some("from-env".into()), Some("from-os".into())),
            "from-env"
        );
        assert_eq!(
            resolve_hostname(Some("  ".into()), Some("from-os".into())),
            "from-os"
        );
        assert_eq!(resolve_hostname(None, None), "localhost");
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"planner_port": 26000, "worker_port": 26001, "hostname": "from-file",
                "webserver": {{"port": 26002}}}}"#
        )
        .unwrap();

        let overrides = ConfigOverrides {
            worker_port: Some(0),
            disable_webserver: true,
            ..Default::default()
        };
        let config = DaemonConfig::load(Some(file.path()), overrides).unwrap();

        assert_eq!(config.planner_port, 26000);
        assert_eq!(config.worker_port, 0);
        assert_eq!(config.hostname, "from-file");
        assert_eq!(config.webserver.port, 26002);
        assert!(!config.webserver.enabled);
        // Unset sections keep their defaults.
        assert_eq!(config.subsystems.codegen_opt_level, 2);
    }

    #[test]
    fn test_file_values_expand_env_vars() {
        // SAFETY: test-local variable name, not read by other tests.
        unsafe { env::set_var("RECORDSERVICED_TEST_HOST", "expanded-host") };

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"hostname": "${{RECORDSERVICED_TEST_HOST}}",
                "subsystems": {{"storage_conf_dir": "${{RECORDSERVICED_TEST_UNSET}}/conf"}}}}"#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.hostname, "expanded-host");
        assert_eq!(
            config.subsystems.storage_conf_dir,
            Some(PathBuf::from("${RECORDSERVICED_TEST_UNSET}/conf"))
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = DaemonConfig::from_file(Path::new("/nonexistent/recordserviced.json"))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
