//! Driver configuration.
//!
//! [`BackendConfig`] carries the fixed paths and defaults used to build
//! volume descriptors and to drive the mount helper.  [`DriverOptions`] is the
//! validated set of startup options that decides which services a process
//! exposes.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;

/// Directory holding the per-volume client configuration files.
pub const DEFAULT_CLIENT_CONF_DIR: &str = "/cfs/conf/";
/// Root under which each volume gets its client log directory.
pub const DEFAULT_CLIENT_LOG_DIR: &str = "/cfs/logs/";
/// Mount helper executable.
pub const DEFAULT_CLIENT_BIN: &str = "/cfs/bin/cfs-client";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_VOL_TYPE: &str = "0";
/// Control-API address used when a storage class does not name one.
pub const DEFAULT_CONSUL_ADDR: &str = "http://consul-service.cubefs.svc.cluster.local:8500";
pub const DEFAULT_DRIVER_NAME: &str = "csi.cubefs.com";

/// Paths and defaults for the CubeFS backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Identifier of the node this process runs on.
    pub node_id: String,
    /// Plugin name reported by `GetPluginInfo`.
    pub driver_name: String,
    /// Plugin version reported by `GetPluginInfo`.
    pub version: String,
    pub client_conf_dir: PathBuf,
    pub client_log_dir: PathBuf,
    pub client_bin: PathBuf,
    pub default_log_level: String,
    pub default_vol_type: String,
    pub default_consul_addr: String,
    /// Per-request timeout for control-plane HTTP calls.
    pub master_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            client_conf_dir: PathBuf::from(DEFAULT_CLIENT_CONF_DIR),
            client_log_dir: PathBuf::from(DEFAULT_CLIENT_LOG_DIR),
            client_bin: PathBuf::from(DEFAULT_CLIENT_BIN),
            default_log_level: DEFAULT_LOG_LEVEL.to_owned(),
            default_vol_type: DEFAULT_VOL_TYPE.to_owned(),
            default_consul_addr: DEFAULT_CONSUL_ADDR.to_owned(),
            master_timeout: Duration::from_secs(30),
        }
    }
}

/// Which CSI services a process exposes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ServiceMode {
    /// Controller service only (create/delete volume).
    Controller,
    /// Node service only (stage/publish).
    Node,
    /// Both services.
    #[default]
    All,
}

impl ServiceMode {
    pub fn serves_controller(self) -> bool {
        matches!(self, Self::Controller | Self::All)
    }

    pub fn serves_node(self) -> bool {
        matches!(self, Self::Node | Self::All)
    }
}

impl fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Controller => "controller",
            Self::Node => "node",
            Self::All => "all",
        })
    }
}

impl FromStr for ServiceMode {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Self::Controller),
            "node" => Ok(Self::Node),
            "all" => Ok(Self::All),
            other => Err(CsiError::InvalidArgument(format!(
                "mode is not supported (actual: {other}, supported: [all controller node])"
            ))),
        }
    }
}

/// Startup options shared by every service of the driver.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub driver_name: String,
    pub node_id: String,
    pub version: String,
    pub mode: ServiceMode,
}

impl DriverOptions {
    /// Reject options the driver cannot start with.
    pub fn validate(&self) -> Result<(), CsiError> {
        if self.driver_name.is_empty() {
            return Err(CsiError::InvalidArgument("driver name missing".into()));
        }
        if self.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node id missing".into()));
        }
        if self.version.is_empty() {
            return Err(CsiError::InvalidArgument("version argument missing".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> DriverOptions {
        DriverOptions {
            driver_name: DEFAULT_DRIVER_NAME.into(),
            node_id: "node-01".into(),
            version: "0.1.0".into(),
            mode: ServiceMode::All,
        }
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("node".parse::<ServiceMode>().unwrap(), ServiceMode::Node);
        assert_eq!(
            "controller".parse::<ServiceMode>().unwrap(),
            ServiceMode::Controller
        );
        assert!(matches!(
            "both".parse::<ServiceMode>(),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn mode_services() {
        assert!(ServiceMode::All.serves_controller() && ServiceMode::All.serves_node());
        assert!(!ServiceMode::Node.serves_controller());
        assert!(!ServiceMode::Controller.serves_node());
    }

    #[test]
    fn options_validation() {
        assert!(options().validate().is_ok());

        let mut opts = options();
        opts.node_id.clear();
        assert!(opts.validate().is_err());

        let mut opts = options();
        opts.version.clear();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn backend_defaults() {
        let cfg = BackendConfig::default();
        assert_eq!(cfg.client_conf_dir, PathBuf::from("/cfs/conf/"));
        assert_eq!(cfg.client_bin, PathBuf::from("/cfs/bin/cfs-client"));
        assert_eq!(cfg.default_vol_type, "0");
    }
}
