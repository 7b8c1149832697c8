//! Snapshot lifecycle management.
//!
//! The snapshot manager owns the reference-count graph tying mount targets
//! to runtime snapshots.  Read-only mounts of the same image share one
//! snapshot under a deterministic `ro:<sha256(image)>` key; every
//! read-write mount gets its own `rw:<volumeId>` snapshot.  A snapshot is
//! removed from the runtime exactly when its last mount is released.
//!
//! The manager persists nothing itself.  Each published volume leaves a
//! small sidecar record next to its target path, and [`SnapshotManager::reconcile`]
//! rebuilds the graph at startup from those records plus the runtime's
//! snapshot list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::image::ImageRef;
use crate::mount::Mounter;
use crate::runtime::{RuntimeError, SnapshotService};

/// Key prefix of shared read-only snapshots.
pub const RO_PREFIX: &str = "ro:";
/// Key prefix of per-volume read-write snapshots.
pub const RW_PREFIX: &str = "rw:";

/// Suffix of the per-volume sidecar records written next to mount targets.
pub const SIDECAR_SUFFIX: &str = ".imagefs.json";

/// Deterministic shared key for read-only snapshots of `image`.
pub fn shared_ro_key(image: &ImageRef) -> String {
    let digest = Sha256::digest(image.as_str().as_bytes());
    format!("{RO_PREFIX}{}", hex::encode(digest))
}

/// Deterministic key for the read-write snapshot of a volume.
pub fn rw_key(volume_id: &str) -> String {
    format!("{RW_PREFIX}{volume_id}")
}

/// Access mode of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotMode {
    ReadOnly,
    ReadWrite,
}

/// A materialized snapshot, as handed to the mount orchestrator.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Runtime-scoped snapshot key.
    pub key: String,
    /// Root of the merged view, ready to bind-mount.
    pub root: PathBuf,
}

/// Persistent record of one published volume, stored beside its target.
///
/// This is the only on-disk state the driver keeps; reconcile reads these
/// records back to re-attribute live mounts to snapshots after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedVolume {
    pub volume_id: String,
    pub image: ImageRef,
    pub snapshot_key: String,
    pub snapshot_root: PathBuf,
    pub target_path: PathBuf,
    pub read_only: bool,
}

/// Where the sidecar for `target` lives: a dotfile next to the target.
pub fn sidecar_path(target: &Path) -> Option<PathBuf> {
    let parent = target.parent()?;
    let name = target.file_name()?.to_string_lossy();
    Some(parent.join(format!(".{name}{SIDECAR_SUFFIX}")))
}

/// Snapshot-manager failures.  Acquire failures are terminal for the
/// caller; no partial state is left behind.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {key}: {source}")]
    Runtime {
        key: String,
        #[source]
        source: RuntimeError,
    },

    #[error("snapshot {key} returned no mounts")]
    NoMounts { key: String },
}

struct SnapshotEntry {
    image: ImageRef,
    refcount: usize,
    mode: SnapshotMode,
    root: PathBuf,
    created_at: SystemTime,
    /// Set when reconcile found live mounts whose snapshot is gone from
    /// the runtime; release must not attempt another runtime remove.
    broken: bool,
}

#[derive(Default)]
struct Graph {
    entries: HashMap<String, SnapshotEntry>,
    /// Reverse index: image → shared read-only key.
    ro_index: HashMap<ImageRef, String>,
}

/// Outcome of a startup reconcile.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Live mounts re-attributed to snapshots.
    pub restored: usize,
    /// Unowned `ro:`/`rw:` snapshots removed from the runtime.
    pub orphans_removed: usize,
    /// Live mounts whose snapshot is missing from the runtime.
    pub broken: usize,
}

/// The snapshot manager (C3).
pub struct SnapshotManager {
    runtime: Arc<dyn SnapshotService>,
    graph: Mutex<Graph>,
    /// Per-key serialization of acquire/release; the graph mutex itself is
    /// only ever held for short map operations.
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SnapshotManager {
    pub fn new(runtime: Arc<dyn SnapshotService>) -> Self {
        Self {
            runtime,
            graph: Mutex::new(Graph::default()),
            key_locks: DashMap::new(),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn lock_graph(&self) -> std::sync::MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire the shared read-only snapshot for `image`, preparing it on
    /// first use and bumping its refcount otherwise.
    #[instrument(skip(self), fields(image = %image))]
    pub async fn acquire_ro(&self, image: &ImageRef) -> Result<Snapshot, SnapshotError> {
        let key = shared_ro_key(image);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        {
            let mut graph = self.lock_graph();
            if let Some(entry) = graph.entries.get_mut(&key) {
                if !entry.broken {
                    entry.refcount += 1;
                    debug!(%key, refcount = entry.refcount, "shared snapshot refcount bumped");
                    return Ok(Snapshot {
                        key,
                        root: entry.root.clone(),
                    });
                }
            }
        }

        // First use (or self-heal of a broken entry): prepare through the
        // runtime, then commit to the graph only on success.
        let root = self.prepare(&key, image).await?;
        let mut graph = self.lock_graph();
        match graph.entries.get_mut(&key) {
            Some(entry) => {
                // Broken entry healed by the fresh prepare; pre-crash
                // refcounts stay attributed to it.
                entry.refcount += 1;
                entry.root = root.clone();
                entry.broken = false;
            }
            None => {
                graph.entries.insert(
                    key.clone(),
                    SnapshotEntry {
                        image: image.clone(),
                        refcount: 1,
                        mode: SnapshotMode::ReadOnly,
                        root: root.clone(),
                        created_at: SystemTime::now(),
                        broken: false,
                    },
                );
            }
        }
        graph.ro_index.insert(image.clone(), key.clone());
        info!(%key, %image, "read-only snapshot prepared");
        Ok(Snapshot { key, root })
    }

    /// Prepare a fresh read-write snapshot owned by `volume_id`.
    #[instrument(skip(self), fields(image = %image, volume_id))]
    pub async fn acquire_rw(
        &self,
        volume_id: &str,
        image: &ImageRef,
    ) -> Result<Snapshot, SnapshotError> {
        let key = rw_key(volume_id);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let root = self.prepare(&key, image).await?;
        let mut graph = self.lock_graph();
        graph.entries.insert(
            key.clone(),
            SnapshotEntry {
                image: image.clone(),
                refcount: 1,
                mode: SnapshotMode::ReadWrite,
                root: root.clone(),
                created_at: SystemTime::now(),
                broken: false,
            },
        );
        info!(%key, %image, "read-write snapshot prepared");
        Ok(Snapshot { key, root })
    }

    async fn prepare(&self, key: &str, image: &ImageRef) -> Result<PathBuf, SnapshotError> {
        let mounts = self
            .runtime
            .prepare(key, image)
            .await
            .map_err(|source| SnapshotError::Runtime {
                key: key.to_owned(),
                source,
            })?;
        let root = mounts
            .first()
            .map(|m| PathBuf::from(&m.source))
            .ok_or_else(|| SnapshotError::NoMounts {
                key: key.to_owned(),
            })?;
        Ok(root)
    }

    /// Drop one reference to `key`, removing the snapshot from the runtime
    /// when the count reaches zero.
    ///
    /// Runtime removal failures are logged and swallowed; the graph entry
    /// is dropped regardless and the next reconcile clears any residue.
    #[instrument(skip(self))]
    pub async fn release(&self, key: &str) {
        let lock = self.key_lock(key);
        // Held through the runtime remove so a racing acquire for the same
        // image either finds the key alive or waits and re-prepares.
        let _guard = lock.lock().await;

        let removal = {
            let mut graph = self.lock_graph();
            match graph.entries.get_mut(key) {
                Some(entry) => {
                    entry.refcount = entry.refcount.saturating_sub(1);
                    debug!(%key, refcount = entry.refcount, "snapshot released");
                    if entry.refcount == 0 {
                        let entry = graph.entries.remove(key).unwrap();
                        graph.ro_index.retain(|_, k| k != key);
                        Some(entry)
                    } else {
                        None
                    }
                }
                None => {
                    debug!(%key, "release of untracked snapshot ignored");
                    None
                }
            }
        };

        if let Some(entry) = removal {
            if entry.broken {
                debug!(%key, "skipping runtime remove of broken snapshot");
                return;
            }
            match self.runtime.remove(key).await {
                Ok(()) => info!(%key, image = %entry.image, "snapshot removed"),
                Err(e) => warn!(%key, error = %e, "snapshot remove failed, leaving for reconcile"),
            }
        }
    }

    /// Rebuild the graph from ground truth at startup.
    ///
    /// 1. Walk the kubelet pod-volume tree for this driver's sidecar
    ///    records whose targets are still live mounts.
    /// 2. Re-attribute each live mount to its snapshot, restoring
    ///    refcounts; mark mounts whose snapshot vanished as broken.
    /// 3. Remove every `ro:`/`rw:` snapshot with no live mount.
    pub async fn reconcile(
        &self,
        kubelet_root: &Path,
        mounter: &dyn Mounter,
    ) -> Result<ReconcileReport, SnapshotError> {
        let snapshots = self
            .runtime
            .list()
            .await
            .map_err(|source| SnapshotError::Runtime {
                key: "<list>".to_owned(),
                source,
            })?;
        let mut ours: std::collections::HashSet<String> = snapshots
            .into_iter()
            .filter(|s| s.key.starts_with(RO_PREFIX) || s.key.starts_with(RW_PREFIX))
            .map(|s| s.key)
            .collect();

        let live = collect_live_volumes(kubelet_root, mounter);

        let mut report = ReconcileReport::default();
        {
            let mut graph = self.lock_graph();
            for record in &live {
                let broken = !ours.contains(&record.snapshot_key);
                let mode = if record.read_only {
                    SnapshotMode::ReadOnly
                } else {
                    SnapshotMode::ReadWrite
                };
                let entry = graph
                    .entries
                    .entry(record.snapshot_key.clone())
                    .or_insert_with(|| SnapshotEntry {
                        image: record.image.clone(),
                        refcount: 0,
                        mode,
                        root: record.snapshot_root.clone(),
                        created_at: SystemTime::now(),
                        broken,
                    });
                entry.refcount += 1;
                report.restored += 1;
                if broken {
                    report.broken += 1;
                    warn!(
                        key = %record.snapshot_key,
                        target = %record.target_path.display(),
                        "live mount references a snapshot missing from the runtime",
                    );
                }
                if record.read_only {
                    graph
                        .ro_index
                        .insert(record.image.clone(), record.snapshot_key.clone());
                }
            }
            ours.retain(|key| !graph.entries.contains_key(key));
        }

        for key in &ours {
            match self.runtime.remove(key).await {
                Ok(()) => {
                    report.orphans_removed += 1;
                    info!(%key, "orphan snapshot removed");
                }
                Err(e) => warn!(%key, error = %e, "orphan snapshot remove failed"),
            }
        }

        info!(
            restored = report.restored,
            orphans_removed = report.orphans_removed,
            broken = report.broken,
            "snapshot reconcile complete",
        );
        Ok(report)
    }

    /// Refcount of `key`, if tracked.  Exposed for diagnostics and tests.
    pub fn refcount(&self, key: &str) -> Option<usize> {
        self.lock_graph().entries.get(key).map(|e| e.refcount)
    }

    /// Whether `key` is tracked but known broken.
    pub fn is_broken(&self, key: &str) -> bool {
        self.lock_graph()
            .entries
            .get(key)
            .map(|e| e.broken)
            .unwrap_or(false)
    }

    /// Number of tracked snapshots.
    pub fn tracked(&self) -> usize {
        self.lock_graph().entries.len()
    }

    /// Age of the tracked snapshot under `key`.
    pub fn created_at(&self, key: &str) -> Option<SystemTime> {
        self.lock_graph().entries.get(key).map(|e| e.created_at)
    }

    /// Access mode of the tracked snapshot under `key`.
    pub fn mode(&self, key: &str) -> Option<SnapshotMode> {
        self.lock_graph().entries.get(key).map(|e| e.mode)
    }
}

/// Walk `<root>/pods/*/volumes/kubernetes.io~csi/*` for sidecar records
/// whose target is still a live mount.  Stale sidecars (target no longer
/// mounted) are deleted on the way.
fn collect_live_volumes(kubelet_root: &Path, mounter: &dyn Mounter) -> Vec<PublishedVolume> {
    let mut live = Vec::new();
    let pods = kubelet_root.join("pods");
    let Ok(pod_dirs) = std::fs::read_dir(&pods) else {
        debug!(root = %pods.display(), "no pod directory tree to reconcile");
        return live;
    };

    for pod in pod_dirs.flatten() {
        let csi_dir = pod.path().join("volumes/kubernetes.io~csi");
        let Ok(vol_dirs) = std::fs::read_dir(&csi_dir) else {
            continue;
        };
        for vol in vol_dirs.flatten() {
            let Ok(files) = std::fs::read_dir(vol.path()) else {
                continue;
            };
            for file in files.flatten() {
                let name = file.file_name();
                if !name.to_string_lossy().ends_with(SIDECAR_SUFFIX) {
                    continue;
                }
                let path = file.path();
                let record: PublishedVolume = match std::fs::read(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| {
                        serde_json::from_slice(&bytes).map_err(|e| e.to_string())
                    }) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unreadable volume record, skipping");
                        continue;
                    }
                };
                if mounter.is_mount_point(&record.target_path) {
                    live.push(record);
                } else {
                    debug!(path = %path.display(), "dropping stale volume record");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }
    live
}
