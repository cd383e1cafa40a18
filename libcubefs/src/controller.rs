//! CSI Controller service trait.
//!
//! The Controller service manages the cluster-wide volume lifecycle.  For
//! CubeFS it is a thin translation onto the control-plane API: the only
//! persistent state is the volume context handed back to the orchestrator.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, CreateVolumeRequest, DeleteVolumeRequest, Volume, VolumeCapability,
    VolumeId,
};

/// Controller service — centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume.
    ///
    /// The returned [`Volume`] carries the `volume_context` that must be
    /// replayed to `delete_volume` and the node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.  Deleting a volume that no
    /// longer exists succeeds.
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError>;

    /// RPCs this controller provides.
    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    async fn validate_volume_capabilities(
        &self,
        _volume_id: &VolumeId,
        _capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        Err(CsiError::unimplemented("ValidateVolumeCapabilities"))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        Err(CsiError::unimplemented("ListVolumes"))
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Err(CsiError::unimplemented("GetCapacity"))
    }
}
