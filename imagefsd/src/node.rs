//! The CSI node backend.
//!
//! [`ImageFsNode`] implements the Identity and Node services and sequences
//! the publish pipeline: resolve credentials, ensure the image is present,
//! materialize a snapshot, and bind-mount it at the target.  Unpublish runs
//! the pipeline backwards.  Publish and unpublish for the same target path
//! are serialized; different targets proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use libcsi::{
    CsiError, CsiIdentity, CsiNode, NodeCapability, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, PluginCapability, PluginInfo, VolumeId,
};

use crate::cred::CredentialResolver;
use crate::image::ImageRef;
use crate::metrics::Metrics;
use crate::mount::{MountError, Mounter};
use crate::pull::{ImageAcquirer, PullError};
use crate::runtime::ImageService;
use crate::snapshot::{
    sidecar_path, PublishedVolume, Snapshot, SnapshotError, SnapshotManager,
};

/// Plugin name reported by the Identity service.
pub const PLUGIN_NAME: &str = "csi.imagefs.dev";

/// Volume attribute naming the image to mount.  Required.
pub const ATTR_IMAGE: &str = "image";
/// Volume attribute forcing a pull even when the image is present.
pub const ATTR_PULL_ALWAYS: &str = "pullAlways";
/// Reserved volume attributes consumed by external sugar; the core reads
/// credentials from the request's secret data instead.
pub const ATTR_SECRET: &str = "secret";
pub const ATTR_SECRET_NAMESPACE: &str = "secretNamespace";

/// Image whose status probe doubles as the runtime liveness check.
const PROBE_IMAGE: &str = "registry.k8s.io/pause:3.9";

#[derive(Debug, Clone)]
struct MountRecord {
    volume_id: String,
    image: ImageRef,
    snapshot_key: String,
    read_only: bool,
}

/// The mount orchestrator (C4).
pub struct ImageFsNode {
    node_id: String,
    images: Arc<dyn ImageService>,
    resolver: CredentialResolver,
    acquirer: ImageAcquirer,
    snapshots: Arc<SnapshotManager>,
    mounter: Arc<dyn Mounter>,
    metrics: Arc<Metrics>,
    /// Mount records keyed by target path.
    mounts: DashMap<String, MountRecord>,
    /// Per-target serialization of publish/unpublish.
    target_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    probe_image: ImageRef,
}

impl ImageFsNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        images: Arc<dyn ImageService>,
        resolver: CredentialResolver,
        acquirer: ImageAcquirer,
        snapshots: Arc<SnapshotManager>,
        mounter: Arc<dyn Mounter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            images,
            resolver,
            acquirer,
            snapshots,
            mounter,
            metrics,
            mounts: DashMap::new(),
            target_locks: DashMap::new(),
            probe_image: ImageRef::parse(PROBE_IMAGE).expect("probe image parses"),
        }
    }

    fn target_lock(&self, target: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.target_locks
            .entry(target.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Parse and validate the publish parameters.
    fn parse_publish(req: &NodePublishVolumeRequest) -> Result<(ImageRef, bool), CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is empty".into()));
        }
        if !Path::new(&req.target_path).is_absolute() {
            return Err(CsiError::InvalidArgument(format!(
                "target path {:?} is not absolute",
                req.target_path,
            )));
        }

        let image = parse_image_attr(&req.volume_attributes)?;
        let pull_always = match req.volume_attributes.get(ATTR_PULL_ALWAYS).map(String::as_str) {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(CsiError::InvalidArgument(format!(
                    "{ATTR_PULL_ALWAYS} must be \"true\" or \"false\", got {other:?}",
                )))
            }
        };
        Ok((image, pull_always))
    }

    /// Persist the sidecar record that ties the target to its snapshot;
    /// reconcile depends on it after a crash.
    fn write_sidecar(record: &PublishedVolume) -> Result<(), CsiError> {
        let path = sidecar_path(&record.target_path).ok_or_else(|| {
            CsiError::InvalidArgument(format!(
                "target path {:?} has no parent directory",
                record.target_path,
            ))
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CsiError::internal)?;
        }
        let bytes = serde_json::to_vec(record).map_err(CsiError::internal)?;
        std::fs::write(&path, bytes).map_err(CsiError::internal)?;
        Ok(())
    }

    fn remove_sidecar(target: &Path) {
        if let Some(path) = sidecar_path(target) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove volume record");
                }
            }
        }
    }

    fn read_sidecar(target: &Path) -> Option<PublishedVolume> {
        let path = sidecar_path(target)?;
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Acquire the snapshot appropriate for the mount mode.
    async fn acquire_snapshot(
        &self,
        volume_id: &str,
        image: &ImageRef,
        read_only: bool,
    ) -> Result<Snapshot, CsiError> {
        let result = if read_only {
            self.snapshots.acquire_ro(image).await
        } else {
            self.snapshots.acquire_rw(volume_id, image).await
        };
        result.map_err(|e| {
            self.metrics.count_error("snapshot-error");
            map_snapshot_error(e)
        })
    }
}

/// Time left before a caller-supplied deadline, measured from `started`.
/// An already-expired deadline is an error so callers stop before starting
/// the next pipeline step.
fn remaining(deadline: Option<Duration>, started: Instant) -> Result<Option<Duration>, CsiError> {
    match deadline {
        None => Ok(None),
        Some(total) => match total.checked_sub(started.elapsed()) {
            Some(left) if !left.is_zero() => Ok(Some(left)),
            _ => Err(CsiError::DeadlineExceeded(
                "operation deadline expired".into(),
            )),
        },
    }
}

fn parse_image_attr(attributes: &HashMap<String, String>) -> Result<ImageRef, CsiError> {
    let raw = attributes
        .get(ATTR_IMAGE)
        .ok_or_else(|| CsiError::InvalidArgument(format!("missing volume attribute {ATTR_IMAGE:?}")))?;
    ImageRef::parse(raw).map_err(CsiError::invalid)
}

fn map_pull_error(e: PullError) -> CsiError {
    match e {
        PullError::Timeout(m) => CsiError::DeadlineExceeded(m),
        PullError::RuntimeUnavailable(m) => CsiError::Unavailable(m),
        PullError::NotFound(m) => CsiError::NotFound(m),
        PullError::Transport(m) => CsiError::Unavailable(m),
        e @ PullError::CredentialsExhausted { .. } => CsiError::Internal(e.to_string()),
        PullError::Unknown(m) => CsiError::Internal(m),
    }
}

fn map_snapshot_error(e: SnapshotError) -> CsiError {
    match &e {
        SnapshotError::Runtime { source, .. } => match source {
            crate::runtime::RuntimeError::Unavailable(_) => CsiError::Unavailable(e.to_string()),
            crate::runtime::RuntimeError::NotFound(_) => CsiError::NotFound(e.to_string()),
            crate::runtime::RuntimeError::DeadlineExceeded(_) => {
                CsiError::DeadlineExceeded(e.to_string())
            }
            crate::runtime::RuntimeError::Transport(_) => CsiError::Unavailable(e.to_string()),
            crate::runtime::RuntimeError::Call(_) => CsiError::Internal(e.to_string()),
        },
        SnapshotError::NoMounts { .. } => CsiError::Internal(e.to_string()),
    }
}

fn map_mount_error(e: MountError) -> CsiError {
    CsiError::Internal(e.to_string())
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for ImageFsNode {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Any well-formed answer from the image service, including "not
        // present", means the runtime is alive.
        Ok(self.images.image_status(&self.probe_image).await.is_ok())
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        // Node-only plugin; provisioning is a pass-through handled upstream.
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for ImageFsNode {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is empty".into()));
        }
        if req.staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument("staging target path is empty".into()));
        }
        // The image attribute is validated here when present so staging
        // surfaces bad parameters early, but nothing is mounted.
        if req.volume_attributes.contains_key(ATTR_IMAGE) {
            parse_image_attr(&req.volume_attributes)?;
        }
        debug!(%req.volume_id, "stage accepted (no-op)");
        Ok(())
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        _staging_target_path: &str,
    ) -> Result<(), CsiError> {
        debug!(%volume_id, "unstage accepted (no-op)");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        let (image, pull_always) = Self::parse_publish(&req)?;
        let deadline = req.timeout_millis.map(Duration::from_millis);
        let started = Instant::now();
        let lock = self.target_lock(&req.target_path);
        let _guard = lock.lock().await;

        // Idempotency: a repeat publish with identical parameters succeeds
        // without touching refcounts; a conflicting one is rejected.
        if let Some(existing) = self.mounts.get(&req.target_path) {
            if existing.volume_id == req.volume_id.0
                && existing.image == image
                && existing.read_only == req.read_only
            {
                debug!("target already published with identical parameters");
                return Ok(());
            }
            return Err(CsiError::AlreadyExists(format!(
                "target {} already serves volume {} ({}, read_only={})",
                req.target_path, existing.volume_id, existing.image, existing.read_only,
            )));
        }

        let resolve = self.resolver.resolve(&image, &req.secret_data);
        let candidates = match remaining(deadline, started)? {
            Some(limit) => tokio::time::timeout(limit, resolve).await.map_err(|_| {
                CsiError::DeadlineExceeded("credential resolution ran past the deadline".into())
            })?,
            None => resolve.await,
        };

        let handle = self
            .acquirer
            .acquire(&image, candidates, pull_always)
            .map_err(map_pull_error)?;
        // The tighter of the caller's remaining budget and the session
        // deadline bounds the wait; the session itself keeps running if the
        // caller's budget runs out first.
        let wait_limit = match (remaining(deadline, started)?, self.acquirer.async_timeout()) {
            (Some(left), Some(session)) => Some(left.min(session)),
            (Some(left), None) => Some(left),
            (None, session) => session,
        };
        handle.wait(wait_limit).await.map_err(map_pull_error)?;

        let acquire = self.acquire_snapshot(&req.volume_id.0, &image, req.read_only);
        let snapshot = match remaining(deadline, started)? {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| {
                    // Nothing was committed to the graph; any half-prepared
                    // runtime snapshot falls to the next reconcile.
                    CsiError::DeadlineExceeded(
                        "snapshot preparation ran past the deadline".into(),
                    )
                })??,
            None => acquire.await?,
        };

        // Last deadline check: past this point the mount becomes visible to
        // the kubelet and the operation runs to completion.
        if let Err(e) = remaining(deadline, started) {
            self.snapshots.release(&snapshot.key).await;
            return Err(e);
        }

        // Everything below must either complete or roll the snapshot back.
        let record = PublishedVolume {
            volume_id: req.volume_id.0.clone(),
            image: image.clone(),
            snapshot_key: snapshot.key.clone(),
            snapshot_root: snapshot.root.clone(),
            target_path: PathBuf::from(&req.target_path),
            read_only: req.read_only,
        };
        if let Err(e) = Self::write_sidecar(&record) {
            self.snapshots.release(&snapshot.key).await;
            return Err(e);
        }

        if let Err(e) = self
            .mounter
            .bind(&snapshot.root, Path::new(&req.target_path), req.read_only)
        {
            self.metrics.count_error("mount-error");
            Self::remove_sidecar(Path::new(&req.target_path));
            self.snapshots.release(&snapshot.key).await;
            return Err(map_mount_error(e));
        }

        self.mounts.insert(
            req.target_path.clone(),
            MountRecord {
                volume_id: req.volume_id.0.clone(),
                image,
                snapshot_key: snapshot.key,
                read_only: req.read_only,
            },
        );
        info!(read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self), fields(volume_id = %volume_id, target = %target_path))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
        deadline: Option<Duration>,
    ) -> Result<(), CsiError> {
        let lock = self.target_lock(target_path);
        let _guard = lock.lock().await;

        let target = Path::new(target_path);
        let snapshot_key = match self.mounts.get(target_path) {
            Some(record) => Some(record.snapshot_key.clone()),
            None => match Self::read_sidecar(target) {
                // Crash recovery: the in-memory record is gone but the
                // sidecar still ties the target to its snapshot.
                Some(record) => Some(record.snapshot_key),
                None if self.mounter.is_mount_point(target) => {
                    warn!("unmounting stale bind with no record");
                    None
                }
                None => {
                    debug!("nothing published at target");
                    return Ok(());
                }
            },
        };

        if let Err(e) = self.mounter.unmount(target) {
            self.metrics.count_error("unmount-error");
            return Err(map_mount_error(e));
        }

        if let Some(key) = snapshot_key {
            // Release failures are logged inside the manager; the mount is
            // already gone, so unpublish still succeeds.  A release running
            // past the caller's deadline is abandoned the same way — the
            // next reconcile sweeps whatever it left behind.
            let release = self.snapshots.release(&key);
            match deadline {
                Some(limit) => {
                    if tokio::time::timeout(limit, release).await.is_err() {
                        warn!(%key, "snapshot release ran past the deadline, leaving residue for reconcile");
                    }
                }
                None => release.await,
            }
        }

        Self::remove_sidecar(target);
        self.mounts.remove(target_path);
        info!("volume unpublished");
        Ok(())
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: 256,
        })
    }
}
