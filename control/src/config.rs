//! Configuration for the sidelink control plane
//!
//! Values come from environment variables; every field has a default except
//! the router's Gateway name.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which half of the control plane this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Gateway, EndpointSlice and pod network controllers
    ControllerManager,
    /// BGP bridge for a single Gateway
    Router,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "controller-manager" => Ok(Mode::ControllerManager),
            "router" => Ok(Mode::Router),
            other => Err(Error::Config(format!(
                "unknown mode '{}', expected controller-manager or router",
                other
            ))),
        }
    }
}

/// Controller-manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// GatewayClass handled by this instance
    #[serde(default = "default_gateway_class_name")]
    pub gateway_class_name: String,

    /// Lowest policy-routing table id (inclusive)
    #[serde(default = "default_table_id_min")]
    pub table_id_min: u32,

    /// Highest policy-routing table id (exclusive)
    #[serde(default = "default_table_id_max")]
    pub table_id_max: u32,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Reconcile timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Deadline for a single reconcile (default: 30s)
    #[serde(default = "default_reconcile_timeout")]
    pub reconcile_timeout_secs: u64,

    /// Periodic resync of converged objects (default: 300s)
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Delay before re-checking a pending network attachment (default: 5s)
    #[serde(default = "default_attachment_requeue")]
    pub attachment_requeue_secs: u64,
}

fn default_gateway_class_name() -> String {
    "sidelink".to_string()
}

fn default_table_id_min() -> u32 {
    common::DEFAULT_TABLE_ID_MIN
}

fn default_table_id_max() -> u32 {
    common::DEFAULT_TABLE_ID_MAX
}

fn default_reconcile_timeout() -> u64 {
    30
}

fn default_resync_interval() -> u64 {
    300
}

fn default_attachment_requeue() -> u64 {
    5
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout_secs: default_reconcile_timeout(),
            resync_interval_secs: default_resync_interval(),
            attachment_requeue_secs: default_attachment_requeue(),
        }
    }
}

impl TimeoutConfig {
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn attachment_requeue(&self) -> Duration {
        Duration::from_secs(self.attachment_requeue_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            gateway_class_name: default_gateway_class_name(),
            table_id_min: default_table_id_min(),
            table_id_max: default_table_id_max(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(val) = env::var("SIDELINK_GATEWAY_CLASS") {
            config.gateway_class_name = val;
        }
        if let Some(val) = parse_env("SIDELINK_TABLE_ID_MIN")? {
            config.table_id_min = val;
        }
        if let Some(val) = parse_env("SIDELINK_TABLE_ID_MAX")? {
            config.table_id_max = val;
        }
        config.timeouts = TimeoutConfig::from_env()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway_class_name.is_empty() {
            return Err(Error::Config("gateway class name must not be empty".into()));
        }
        if self.table_id_max < self.table_id_min {
            return Err(Error::Config(format!(
                "table id range [{}, {}) is inverted",
                self.table_id_min, self.table_id_max
            )));
        }
        Ok(())
    }
}

impl TimeoutConfig {
    fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(val) = parse_env("SIDELINK_RECONCILE_TIMEOUT_SECS")? {
            config.reconcile_timeout_secs = val;
        }
        if let Some(val) = parse_env("SIDELINK_RESYNC_INTERVAL_SECS")? {
            config.resync_interval_secs = val;
        }
        if let Some(val) = parse_env("SIDELINK_ATTACHMENT_REQUEUE_SECS")? {
            config.attachment_requeue_secs = val;
        }
        Ok(config)
    }
}

/// Router configuration (one process per Gateway)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Gateway this router serves
    pub gateway_name: String,

    #[serde(default = "default_namespace")]
    pub gateway_namespace: String,

    #[serde(default)]
    pub bird: BirdConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// BIRD process and control socket settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BirdConfig {
    #[serde(default = "default_bird_binary")]
    pub binary: PathBuf,

    #[serde(default = "default_birdc_binary")]
    pub birdc_binary: PathBuf,

    #[serde(default = "default_bird_config_path")]
    pub config_path: PathBuf,

    #[serde(default = "default_bird_socket")]
    pub socket_path: PathBuf,

    /// Delay before restarting a crashed daemon (default: 2s)
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,

    /// Health probe interval (default: 5s)
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_bird_binary() -> PathBuf {
    PathBuf::from("bird")
}

fn default_birdc_binary() -> PathBuf {
    PathBuf::from("birdc")
}

fn default_bird_config_path() -> PathBuf {
    PathBuf::from("/etc/bird/bird.conf")
}

fn default_bird_socket() -> PathBuf {
    PathBuf::from("/var/run/bird/bird.ctl")
}

fn default_restart_delay() -> u64 {
    2
}

fn default_health_interval() -> u64 {
    5
}

impl Default for BirdConfig {
    fn default() -> Self {
        Self {
            binary: default_bird_binary(),
            birdc_binary: default_birdc_binary(),
            config_path: default_bird_config_path(),
            socket_path: default_bird_socket(),
            restart_delay_secs: default_restart_delay(),
            health_interval_secs: default_health_interval(),
        }
    }
}

impl RouterConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let gateway_name = env::var("SIDELINK_GATEWAY_NAME")
            .map_err(|_| Error::Config("SIDELINK_GATEWAY_NAME is required in router mode".into()))?;

        let mut bird = BirdConfig::default();
        if let Ok(val) = env::var("SIDELINK_BIRD_BINARY") {
            bird.binary = PathBuf::from(val);
        }
        if let Ok(val) = env::var("SIDELINK_BIRDC_BINARY") {
            bird.birdc_binary = PathBuf::from(val);
        }
        if let Ok(val) = env::var("SIDELINK_BIRD_CONFIG") {
            bird.config_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("SIDELINK_BIRD_SOCKET") {
            bird.socket_path = PathBuf::from(val);
        }
        if let Some(val) = parse_env("SIDELINK_BIRD_RESTART_DELAY_SECS")? {
            bird.restart_delay_secs = val;
        }
        if let Some(val) = parse_env("SIDELINK_BIRD_HEALTH_INTERVAL_SECS")? {
            bird.health_interval_secs = val;
        }

        Ok(Self {
            gateway_name,
            gateway_namespace: env::var("SIDELINK_GATEWAY_NAMESPACE")
                .unwrap_or_else(|_| default_namespace()),
            bird,
            timeouts: TimeoutConfig::from_env()?,
        })
    }
}

/// Read and parse an optional environment variable
fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}
