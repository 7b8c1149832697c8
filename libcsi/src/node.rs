//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes image-backed volumes
//! available to Pod containers:
//!
//! 1. **Stage** — validate the request; this driver stages nothing.
//! 2. **Publish** — pull the image, materialize a snapshot, bind-mount it at
//!    the target path.
//! 3. **Unpublish** — unmount the target and release the snapshot.
//! 4. **Unstage** — no-op, mirroring Stage.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
};

/// Node service — local publish / unpublish operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Validate a stage request.  The driver performs its real work in
    /// [`CsiNode::publish_volume`]; staging is accepted and ignored.
    ///
    /// Idempotent — repeated calls for the same volume succeed.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Counterpart of [`CsiNode::stage_volume`]; also a validated no-op.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume: ensure the image is present, prepare a snapshot,
    /// and bind-mount it at `req.target_path`.  The caller's deadline rides
    /// in `req.timeout_millis`.
    ///
    /// Idempotent for identical parameters; a repeat with a different
    /// `(image, read_only)` pair fails with [`CsiError::AlreadyExists`].
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the target path and release the backing
    /// snapshot.  Work past a supplied `deadline` is abandoned to the next
    /// reconcile rather than blocking the caller.
    ///
    /// Idempotent — unpublishing an unknown target succeeds.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
        deadline: Option<Duration>,
    ) -> Result<(), CsiError>;

    /// Advertise node-service capabilities.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
