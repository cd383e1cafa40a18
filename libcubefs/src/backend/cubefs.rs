//! CubeFS storage backend for CSI.
//!
//! [`CubeFsBackend`] implements [`CsiIdentity`], [`CsiController`], and
//! [`CsiNode`] on top of a CubeFS cluster:
//!
//! * the controller translates create/delete into master API calls through
//!   the [`MasterClient`];
//! * the node service stages a volume by writing its client configuration
//!   and running the FUSE client, then bind-mounts the staging path into each
//!   workload.
//!
//! The backend keeps no volume table.  Controller calls carry the volume
//! context they need, and node calls re-derive the mount state of their paths
//! on every call, so a restarted process has nothing to recover.
//!
//! # Node layout
//!
//! ```text
//! <staging path>              # FUSE mount of the volume, one per node
//! <target path>               # bind mount of the staging path, one per pod
//! <conf dir>/<volName>.json   # client configuration read by cfs-client
//! <log dir>/<volName>/        # cfs-client logs
//! ```

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::client_conf;
use crate::config::BackendConfig;
use crate::controller::CsiController;
use crate::descriptor::{KEY_CAPACITY, VolumeDescriptor};
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::locks::VolumeLocks;
use crate::master::{FailoverPolicy, HttpTransport, MasterClient, MasterOutcome, MasterTransport};
use crate::mount_helper::{CfsClient, MountHelper};
use crate::mounter::{self, HostMounter, Mounter, PathState};
use crate::node::CsiNode;
use crate::types::*;

const GIB_SHIFT: u32 = 30;

/// Concrete CSI backend backed by CubeFS.
///
/// # Thread safety
///
/// Node operations on the same volume are serialised through
/// [`VolumeLocks`]; different volumes are staged and published concurrently.
/// Volume ids sharing a `volName` share one client config file, so writing
/// that file and running the helper on it is serialised per `volName` too.
pub struct CubeFsBackend {
    config: BackendConfig,
    master: MasterClient,
    mounter: Arc<dyn Mounter>,
    helper: Arc<dyn MountHelper>,
    locks: VolumeLocks,
    conf_locks: VolumeLocks,
}

impl CubeFsBackend {
    pub fn new(
        config: BackendConfig,
        transport: Arc<dyn MasterTransport>,
        mounter: Arc<dyn Mounter>,
        helper: Arc<dyn MountHelper>,
    ) -> Self {
        Self {
            config,
            master: MasterClient::new(transport, FailoverPolicy::default()),
            mounter,
            helper,
            locks: VolumeLocks::new(),
            conf_locks: VolumeLocks::new(),
        }
    }

    /// Backend acting on the host: HTTP to the masters, real mounts, and the
    /// configured `cfs-client` binary.
    pub fn with_host(config: BackendConfig) -> Result<Self, CsiError> {
        let transport = HttpTransport::new(config.master_timeout)?;
        let helper = CfsClient::new(config.client_bin.clone());
        Ok(Self::new(
            config,
            Arc::new(transport),
            Arc::new(HostMounter),
            Arc::new(helper),
        ))
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Persist the client configuration and run the mount helper for an
    /// unmounted staging path.
    async fn mount_staging(&self, desc: &VolumeDescriptor, staging: &Path) -> Result<(), CsiError> {
        let _conf_guard = self.conf_locks.lock(&VolumeId::from(desc.name.as_str())).await;
        let conf = client_conf::persist(desc, &staging.to_string_lossy()).await?;
        self.helper.mount(&conf).await?;
        info!(
            volume = %desc.name,
            staging = %staging.display(),
            conf = %conf.display(),
            "volume staged",
        );
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{field} missing in request")));
    }
    Ok(())
}

fn corrupted(path: &Path, reason: String) -> CsiError {
    CsiError::CorruptedMount {
        path: path.display().to_string(),
        reason,
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for CubeFsBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.driver_name.clone(),
            vendor_version: self.config.version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for CubeFsBackend {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        require("name", &req.name)?;
        let range = req
            .capacity_range
            .ok_or_else(|| CsiError::InvalidArgument("capacity range missing in request".into()))?;
        let capacity_gib = range.required_bytes >> GIB_SHIFT;
        if capacity_gib == 0 {
            return Err(CsiError::InvalidArgument(format!(
                "required capacity {} bytes is below 1 GiB",
                range.required_bytes
            )));
        }

        let mut params = req.parameters;
        params.insert(KEY_CAPACITY.to_owned(), capacity_gib.to_string());
        let desc = VolumeDescriptor::build(&req.name, &params, &self.config)?;

        match self.master.create_volume(&desc, capacity_gib).await {
            Ok(MasterOutcome::Success) => {
                info!(volume = %desc.name, capacity_gib, "volume created");
            }
            Ok(MasterOutcome::IdempotentNoOp(msg)) => {
                info!(volume = %desc.name, %msg, "volume already exists");
            }
            Err(e) => return Err(CsiError::Internal(e.to_string())),
        }

        Ok(Volume {
            volume_id: VolumeId(req.name),
            capacity_bytes: range.required_bytes,
            volume_context: desc.to_context(),
        })
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError> {
        require("volume id", req.volume_id.as_str())?;
        let desc = VolumeDescriptor::build(req.volume_id.as_str(), &req.volume_context, &self.config)?;

        match self.master.delete_volume(&desc).await {
            Ok(MasterOutcome::Success) => info!(volume = %desc.name, "volume deleted"),
            Ok(MasterOutcome::IdempotentNoOp(msg)) => {
                info!(volume = %desc.name, %msg, "volume already gone");
            }
            Err(e) => return Err(CsiError::Unknown(e.to_string())),
        }
        Ok(())
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![ControllerCapability::CreateDeleteVolume])
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for CubeFsBackend {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require("volume id", req.volume_id.as_str())?;
        require("staging target path", &req.staging_target_path)?;
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| CsiError::InvalidArgument("volume capability missing in request".into()))?;
        if capability.access_mode != AccessMode::SingleNodeWriter {
            return Err(CsiError::InvalidArgument(format!(
                "access mode {:?} is not supported, only SingleNodeWriter",
                capability.access_mode
            )));
        }

        let desc = VolumeDescriptor::build(req.volume_id.as_str(), &req.volume_context, &self.config)?;

        let _guard = self.locks.lock(&req.volume_id).await;
        let staging = Path::new(&req.staging_target_path);

        let created = match mounter::probe(self.mounter.as_ref(), staging).await? {
            PathState::Mounted => {
                debug!(staging = %staging.display(), "volume already staged");
                return Ok(());
            }
            PathState::Corrupted(reason) => {
                warn!(staging = %staging.display(), %reason, "staging path is a corrupted mount");
                return Err(corrupted(staging, reason));
            }
            PathState::Unmounted => false,
            PathState::Absent => {
                self.mounter.make_dir(staging).await?;
                true
            }
        };

        let res = self.mount_staging(&desc, staging).await;
        if res.is_err()
            && created
            && let Err(e) = self.mounter.remove_dir(staging).await
        {
            warn!(staging = %staging.display(), error = %e, "failed to remove staging dir after failed stage");
        }
        res
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require("volume id", volume_id.as_str())?;
        require("staging target path", staging_target_path)?;

        let _guard = self.locks.lock(volume_id).await;
        mounter::cleanup_mount_point(self.mounter.as_ref(), Path::new(staging_target_path)).await?;
        info!(%volume_id, staging = staging_target_path, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require("volume id", req.volume_id.as_str())?;
        require("staging target path", &req.staging_target_path)?;
        require("target path", &req.target_path)?;

        let _guard = self.locks.lock(&req.volume_id).await;
        let staging = Path::new(&req.staging_target_path);
        let target = Path::new(&req.target_path);

        match self.mounter.path_exists(staging).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(CsiError::NotFound(format!(
                    "staging path {} does not exist, volume is not staged",
                    staging.display()
                )));
            }
            Err(e) => {
                return Err(CsiError::Internal(format!("stat {}: {e}", staging.display())));
            }
        }

        match mounter::probe(self.mounter.as_ref(), target).await? {
            PathState::Mounted => {
                debug!(target = %target.display(), "volume already published");
                return Ok(());
            }
            PathState::Corrupted(reason) => return Err(corrupted(target, reason)),
            PathState::Unmounted => {}
            PathState::Absent => self.mounter.make_dir(target).await?,
        }

        self.mounter
            .bind_mount(staging, target, req.read_only)
            .await?;
        info!(
            staging = %staging.display(),
            target = %target.display(),
            read_only = req.read_only,
            "volume published",
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        require("volume id", volume_id.as_str())?;
        require("target path", target_path)?;

        let _guard = self.locks.lock(volume_id).await;
        mounter::cleanup_mount_point(self.mounter.as_ref(), Path::new(target_path)).await?;
        info!(%volume_id, target = target_path, "volume unpublished");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.config.node_id.clone(),
            max_volumes: 0,
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }
}
