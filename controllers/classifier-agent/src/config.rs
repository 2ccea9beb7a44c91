//! Agent configuration from environment variables.

use crate::error::ControllerError;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 10;
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";

/// How the cluster this agent runs in is managed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterType {
    /// Control plane managed through Cluster API
    #[default]
    Capi,
    /// Attached to the management cluster via an agent
    Sveltos,
}

impl FromStr for ClusterType {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "capi" => Ok(Self::Capi),
            "sveltos" => Ok(Self::Sveltos),
            other => Err(ControllerError::InvalidConfig(format!(
                "CLUSTER_TYPE must be capi or sveltos, got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capi => f.write_str("Capi"),
            Self::Sveltos => f.write_str("Sveltos"),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name of the cluster this agent classifies
    pub cluster_name: String,
    /// Namespace of the cluster object in the management cluster
    pub cluster_namespace: String,
    /// Cluster type
    pub cluster_type: ClusterType,
    /// Discovery and reconciliation interval
    pub discovery_interval: Duration,
    /// Compute watch sets without opening watches
    pub dry_run: bool,
    /// Address of the metrics and probes endpoint
    pub metrics_addr: SocketAddr,
}

impl AgentConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let cluster_name = lookup("CLUSTER_NAME")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ControllerError::InvalidConfig("CLUSTER_NAME environment variable is required".to_string()))?;
        let cluster_namespace = lookup("CLUSTER_NAMESPACE").unwrap_or_else(|| "default".to_string());
        let cluster_type = match lookup("CLUSTER_TYPE") {
            Some(value) => value.parse()?,
            None => ClusterType::default(),
        };

        let discovery_interval = match lookup("DISCOVERY_INTERVAL_SECS") {
            Some(value) => {
                let secs: u64 = value.parse().map_err(|_| {
                    ControllerError::InvalidConfig(format!("DISCOVERY_INTERVAL_SECS must be an integer, got {value:?}"))
                })?;
                if secs == 0 {
                    return Err(ControllerError::InvalidConfig(
                        "DISCOVERY_INTERVAL_SECS must be greater than zero".to_string(),
                    ));
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_DISCOVERY_INTERVAL_SECS),
        };

        let dry_run = match lookup("DRY_RUN") {
            Some(value) => value.parse::<bool>().map_err(|_| {
                ControllerError::InvalidConfig(format!("DRY_RUN must be true or false, got {value:?}"))
            })?,
            None => false,
        };

        let metrics_addr = lookup("METRICS_ADDR")
            .unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string());
        let metrics_addr = metrics_addr
            .parse()
            .map_err(|_| ControllerError::InvalidConfig(format!("METRICS_ADDR is not a socket address: {metrics_addr:?}")))?;

        Ok(Self {
            cluster_name,
            cluster_namespace,
            cluster_type,
            discovery_interval,
            dry_run,
            metrics_addr,
        })
    }
}
