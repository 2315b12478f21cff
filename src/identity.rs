//! Cluster-unique identity for a daemon instance.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// Service name used as the identity prefix.
pub const SERVICE_NAME: &str = "recordserviced";

/// `"recordserviced@<host>:<port>"`, unique as long as no two live daemons
/// share a host and primary port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ServiceIdentity(String);

impl ServiceIdentity {
    /// Derive the identity from the advertised hostname and primary port.
    ///
    /// The hostname is expected to have passed config validation already.
    pub fn generate(hostname: &str, primary_port: u16) -> Self {
        Self(format!("{}@{}", SERVICE_NAME, network_address(hostname, primary_port)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `host:port`, bracketing IPv6 literals.
fn network_address(hostname: &str, port: u16) -> String {
    match hostname.parse::<IpAddr>() {
        Ok(IpAddr::V6(addr)) => format!("[{}]:{}", addr, port),
        _ => format!("{}:{}", hostname, port),
    }
}
