//! Canonical description of one CubeFS volume.
//!
//! A [`VolumeDescriptor`] is built from the free-form parameter map that
//! arrives with a request: storage-class parameters on `CreateVolume`, or the
//! volume context returned by `CreateVolume` and replayed on later calls.
//! [`VolumeDescriptor::to_context`] produces exactly that replayable map, so
//! the descriptor survives the round trip through the container orchestrator.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use md5::{Digest, Md5};
use rand::Rng;
use rand::distr::Alphanumeric;

use crate::config::BackendConfig;
use crate::error::CsiError;

pub const KEY_VOL_NAME: &str = "volName";
pub const KEY_MASTER_ADDR: &str = "masterAddr";
pub const KEY_OWNER: &str = "owner";
pub const KEY_LOG_LEVEL: &str = "logLevel";
pub const KEY_LOG_DIR: &str = "logDir";
pub const KEY_CONSUL_ADDR: &str = "consulAddr";
pub const KEY_VOL_TYPE: &str = "volType";
pub const KEY_CAPACITY: &str = "capacity";
pub const KEY_MOUNT_POINT: &str = "mountPoint";

const KNOWN_KEYS: [&str; 9] = [
    KEY_VOL_NAME,
    KEY_MASTER_ADDR,
    KEY_OWNER,
    KEY_LOG_LEVEL,
    KEY_LOG_DIR,
    KEY_CONSUL_ADDR,
    KEY_VOL_TYPE,
    KEY_CAPACITY,
    KEY_MOUNT_POINT,
];

const OWNER_PREFIX: &str = "csi_";
const OWNER_RANDOM_LEN: usize = 16;

/// Immutable descriptor of a CubeFS volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub name: String,
    /// Control-plane endpoints in failover order; never empty.
    pub master_addrs: Vec<String>,
    /// Per-volume secret authorising destructive control-plane calls.
    pub owner: String,
    /// Size in GiB, known once the volume has been created.
    pub capacity_gib: Option<u64>,
    pub vol_type: String,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub consul_addr: String,
    /// Where the mount-helper configuration for this volume lives.
    pub config_file_path: PathBuf,
    /// Parameters this driver does not interpret, passed through verbatim.
    pub extra: BTreeMap<String, String>,
}

impl VolumeDescriptor {
    /// Build a descriptor for `volume_name` from request parameters.
    ///
    /// A non-empty `volName` parameter takes precedence over `volume_name`.
    /// Fails with [`CsiError::InvalidArgument`] when no name or no control
    /// endpoint is available, or when the name is not a single path
    /// component.  Apart from a freshly generated owner, the
    /// result is a pure function of its inputs.
    pub fn build(
        volume_name: &str,
        params: &HashMap<String, String>,
        cfg: &BackendConfig,
    ) -> Result<Self, CsiError> {
        let lookup = |key: &str| params.get(key).map(String::as_str).filter(|v| !v.is_empty());

        let master_addrs: Vec<String> = lookup(KEY_MASTER_ADDR)
            .map(|addrs| {
                addrs
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        if volume_name.is_empty() || master_addrs.is_empty() {
            return Err(CsiError::InvalidArgument(format!(
                "volume name and {KEY_MASTER_ADDR} are required (name={volume_name:?})"
            )));
        }

        let name = lookup(KEY_VOL_NAME).unwrap_or(volume_name).to_owned();
        validate_name(&name)?;

        let capacity_gib = match lookup(KEY_CAPACITY) {
            None => None,
            Some(raw) => match raw.parse::<u64>() {
                Ok(gib) if gib >= 1 => Some(gib),
                _ => {
                    return Err(CsiError::InvalidArgument(format!(
                        "{KEY_CAPACITY} must be a whole number of GiB >= 1, got {raw:?}"
                    )));
                }
            },
        };

        let extra = params
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            master_addrs,
            owner: lookup(KEY_OWNER).map_or_else(generate_owner, str::to_owned),
            capacity_gib,
            vol_type: lookup(KEY_VOL_TYPE).unwrap_or(cfg.default_vol_type.as_str()).to_owned(),
            log_dir: cfg.client_log_dir.join(&name),
            log_level: lookup(KEY_LOG_LEVEL).unwrap_or(cfg.default_log_level.as_str()).to_owned(),
            consul_addr: lookup(KEY_CONSUL_ADDR)
                .unwrap_or(cfg.default_consul_addr.as_str())
                .to_owned(),
            config_file_path: cfg.client_conf_dir.join(format!("{name}.json")),
            extra,
            name,
        })
    }

    /// The string map handed back from `CreateVolume` and replayed later.
    pub fn to_context(&self) -> HashMap<String, String> {
        let mut ctx: HashMap<String, String> = self
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ctx.insert(KEY_VOL_NAME.to_owned(), self.name.clone());
        ctx.insert(KEY_MASTER_ADDR.to_owned(), self.master_addrs.join(","));
        ctx.insert(KEY_OWNER.to_owned(), self.owner.clone());
        ctx.insert(KEY_LOG_LEVEL.to_owned(), self.log_level.clone());
        ctx.insert(
            KEY_LOG_DIR.to_owned(),
            self.log_dir.to_string_lossy().into_owned(),
        );
        ctx.insert(KEY_CONSUL_ADDR.to_owned(), self.consul_addr.clone());
        ctx.insert(KEY_VOL_TYPE.to_owned(), self.vol_type.clone());
        if let Some(gib) = self.capacity_gib {
            ctx.insert(KEY_CAPACITY.to_owned(), gib.to_string());
        }
        ctx
    }

    /// Contents of the mount-helper configuration file: the context plus the
    /// resolved mount point.
    pub fn client_conf(&self, mount_point: &str) -> BTreeMap<String, String> {
        let mut conf: BTreeMap<String, String> = self.to_context().into_iter().collect();
        conf.insert(KEY_MOUNT_POINT.to_owned(), mount_point.to_owned());
        conf
    }

    /// Hex MD5 of the owner, the `authKey` expected by the control plane.
    pub fn auth_key(&self) -> String {
        hex::encode(Md5::digest(self.owner.as_bytes()))
    }
}

/// The name becomes a file name under the config and log directories.
fn validate_name(name: &str) -> Result<(), CsiError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(CsiError::InvalidArgument(format!(
            "volume name {name:?} is not a valid file name"
        )));
    }
    Ok(())
}

/// Pseudo-random owner secret.  Uniqueness is probabilistic only.
fn generate_owner() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(OWNER_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{OWNER_PREFIX}{suffix}")
}
