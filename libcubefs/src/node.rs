//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local filesystem
//! operations required to make a volume available to Pod containers:
//!
//! 1. **Stage** — mount the CubeFS volume through the FUSE client at a
//!    node-global staging path.
//! 2. **Publish** — bind-mount the staging path into the Pod's container.
//! 3. **Unpublish** — remove the bind-mount.
//! 4. **Unstage** — unmount the FUSE mount.
//!
//! Every operation is idempotent: the current state is re-derived from the
//! filesystem on each call.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
};

/// Node service — local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at its staging path.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unmount and remove the staging path.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Bind-mount a staged volume into a workload's target path.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unmount and remove the target path.  The staging mount is untouched.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// RPCs this node service provides.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;
}
