//! End-to-end lifecycle tests over in-memory runtime fakes.
//!
//! These drive the node backend through the same publish/unpublish surface
//! the QUIC transport uses, with the runtime and mount layers replaced by
//! recording fakes, and check the refcount invariants the driver promises:
//! shared read-only snapshots, isolated read-write snapshots, idempotency,
//! clean rollback on timeout, and crash reconcile.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use libcsi::{CsiError, CsiNode, NodePublishVolumeRequest, VolumeId};

use imagefsd::cred::{AuthCandidate, CredentialResolver, NodeSecretStore};
use imagefsd::image::ImageRef;
use imagefsd::metrics::Metrics;
use imagefsd::mount::{MountError, Mounter};
use imagefsd::node::ImageFsNode;
use imagefsd::pull::{ImageAcquirer, Puller, SessionConfig};
use imagefsd::runtime::{
    ImageInfo, ImageService, RuntimeError, SnapshotInfo, SnapshotKind, SnapshotMount,
    SnapshotService,
};
use imagefsd::snapshot::{rw_key, shared_ro_key, SnapshotManager};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeImages {
    present: Mutex<HashSet<String>>,
    pulls: AtomicUsize,
    pull_delay: Mutex<Duration>,
}

impl FakeImages {
    fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn set_delay(&self, delay: Duration) {
        *self.pull_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl ImageService for FakeImages {
    async fn pull_image(
        &self,
        image: &ImageRef,
        _auth: Option<&AuthCandidate>,
    ) -> Result<String, RuntimeError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.pull_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.present.lock().unwrap().insert(image.to_string());
        Ok(image.to_string())
    }

    async fn image_status(&self, image: &ImageRef) -> Result<Option<ImageInfo>, RuntimeError> {
        if self.present.lock().unwrap().contains(image.as_str()) {
            Ok(Some(ImageInfo {
                id: image.to_string(),
                size: 1024,
                ..Default::default()
            }))
        } else {
            Ok(None)
        }
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>, RuntimeError> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct FakeSnapshots {
    keys: Mutex<HashSet<String>>,
}

impl FakeSnapshots {
    fn keys(&self) -> HashSet<String> {
        self.keys.lock().unwrap().clone()
    }

    fn insert(&self, key: &str) {
        self.keys.lock().unwrap().insert(key.to_owned());
    }
}

#[async_trait]
impl SnapshotService for FakeSnapshots {
    async fn prepare(
        &self,
        key: &str,
        _parent: &ImageRef,
    ) -> Result<Vec<SnapshotMount>, RuntimeError> {
        let mut keys = self.keys.lock().unwrap();
        if !keys.insert(key.to_owned()) {
            return Err(RuntimeError::Call(format!("snapshot {key} already exists")));
        }
        Ok(vec![SnapshotMount {
            kind: "bind".into(),
            source: format!("/run/imagefs/{key}/merged"),
            options: vec!["rbind".into()],
        }])
    }

    async fn remove(&self, key: &str) -> Result<(), RuntimeError> {
        if self.keys.lock().unwrap().remove(key) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(key.to_owned()))
        }
    }

    async fn list(&self) -> Result<Vec<SnapshotInfo>, RuntimeError> {
        Ok(self
            .keys
            .lock()
            .unwrap()
            .iter()
            .map(|key| SnapshotInfo {
                key: key.clone(),
                parent: String::new(),
                kind: SnapshotKind::Active,
            })
            .collect())
    }
}

#[derive(Default)]
struct FakeMounter {
    mounted: Mutex<HashSet<PathBuf>>,
    binds: AtomicUsize,
}

impl FakeMounter {
    fn mounted(&self) -> HashSet<PathBuf> {
        self.mounted.lock().unwrap().clone()
    }

    fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }
}

impl Mounter for FakeMounter {
    fn bind(&self, _source: &Path, target: &Path, _read_only: bool) -> Result<(), MountError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        self.mounted.lock().unwrap().insert(target.to_owned());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        self.mounted.lock().unwrap().remove(target);
        Ok(())
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        self.mounted.lock().unwrap().contains(path)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    node: ImageFsNode,
    images: Arc<FakeImages>,
    runtime_snapshots: Arc<FakeSnapshots>,
    snapshots: Arc<SnapshotManager>,
    mounter: Arc<FakeMounter>,
    kubelet_root: tempfile::TempDir,
}

impl Harness {
    async fn new(async_timeout: Option<Duration>) -> Self {
        let kubelet_root = tempfile::tempdir().unwrap();
        let images = Arc::new(FakeImages::default());
        let runtime_snapshots = Arc::new(FakeSnapshots::default());
        let mounter = Arc::new(FakeMounter::default());
        let metrics = Arc::new(Metrics::new());

        let store = NodeSecretStore::new(
            kubelet_root.path().join("secrets"),
            "imagefsd",
            true,
        )
        .await;
        let resolver = CredentialResolver::new(store, None);

        let puller = Arc::new(Puller::new(images.clone(), metrics.clone()));
        let config = SessionConfig {
            async_timeout,
            result_grace: Duration::from_millis(200),
            ..Default::default()
        };
        let acquirer = ImageAcquirer::new(puller, config);

        let snapshots = Arc::new(SnapshotManager::new(runtime_snapshots.clone()));
        let node = ImageFsNode::new(
            "node-1",
            images.clone(),
            resolver,
            acquirer,
            snapshots.clone(),
            mounter.clone(),
            metrics,
        );

        Self {
            node,
            images,
            runtime_snapshots,
            snapshots,
            mounter,
            kubelet_root,
        }
    }

    /// A kubelet-shaped target path for `volume_id`.
    fn target(&self, volume_id: &str) -> String {
        self.kubelet_root
            .path()
            .join("pods/pod-1/volumes/kubernetes.io~csi")
            .join(volume_id)
            .join("mount")
            .display()
            .to_string()
    }

    async fn publish(
        &self,
        volume_id: &str,
        target: &str,
        read_only: bool,
        image: &str,
    ) -> Result<(), CsiError> {
        self.publish_with_timeout(volume_id, target, read_only, image, None)
            .await
    }

    async fn publish_with_timeout(
        &self,
        volume_id: &str,
        target: &str,
        read_only: bool,
        image: &str,
        timeout_millis: Option<u64>,
    ) -> Result<(), CsiError> {
        self.node
            .publish_volume(NodePublishVolumeRequest {
                volume_id: VolumeId(volume_id.into()),
                target_path: target.into(),
                read_only,
                volume_attributes: HashMap::from([("image".to_owned(), image.to_owned())]),
                secret_data: HashMap::new(),
                timeout_millis,
            })
            .await
    }

    async fn unpublish(&self, volume_id: &str, target: &str) -> Result<(), CsiError> {
        self.node
            .unpublish_volume(&VolumeId(volume_id.into()), target, None)
            .await
    }
}

fn nginx() -> ImageRef {
    ImageRef::parse("docker.io/library/nginx:1.25").unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shared_read_only_mounts() {
    let h = Harness::new(None).await;
    let (ta, tb) = (h.target("vol-a"), h.target("vol-b"));

    h.publish("vol-a", &ta, true, "docker.io/library/nginx:1.25")
        .await
        .unwrap();
    h.publish("vol-b", &tb, true, "docker.io/library/nginx:1.25")
        .await
        .unwrap();

    let key = shared_ro_key(&nginx());
    assert_eq!(h.images.pull_count(), 1, "second publish reuses the pulled image");
    assert_eq!(h.runtime_snapshots.keys(), HashSet::from([key.clone()]));
    assert_eq!(h.snapshots.refcount(&key), Some(2));

    h.unpublish("vol-a", &ta).await.unwrap();
    assert_eq!(h.snapshots.refcount(&key), Some(1));
    assert!(h.runtime_snapshots.keys().contains(&key));

    h.unpublish("vol-b", &tb).await.unwrap();
    assert_eq!(h.snapshots.refcount(&key), None);
    assert!(h.runtime_snapshots.keys().is_empty());
    assert!(h.mounter.mounted().is_empty());
}

#[tokio::test]
async fn read_write_mounts_are_isolated() {
    let h = Harness::new(None).await;
    let (ta, tb) = (h.target("vol-a"), h.target("vol-b"));

    h.publish("vol-a", &ta, false, "docker.io/library/app:1")
        .await
        .unwrap();
    h.publish("vol-b", &tb, false, "docker.io/library/app:1")
        .await
        .unwrap();

    assert_eq!(h.images.pull_count(), 1, "pulls dedupe to one");
    let keys = h.runtime_snapshots.keys();
    assert_eq!(
        keys,
        HashSet::from([rw_key("vol-a"), rw_key("vol-b")]),
        "each read-write mount owns a distinct snapshot",
    );
    assert_eq!(h.snapshots.refcount(&rw_key("vol-a")), Some(1));
    assert_eq!(h.snapshots.refcount(&rw_key("vol-b")), Some(1));
}

#[tokio::test]
async fn publish_is_idempotent() {
    let h = Harness::new(None).await;
    let target = h.target("vol-a");

    for _ in 0..3 {
        h.publish("vol-a", &target, true, "docker.io/library/nginx:1.25")
            .await
            .unwrap();
    }

    let key = shared_ro_key(&nginx());
    assert_eq!(h.snapshots.refcount(&key), Some(1), "refcount unchanged by repeats");
    assert_eq!(h.mounter.bind_count(), 1, "bound exactly once");
    assert_eq!(h.runtime_snapshots.keys().len(), 1);

    h.unpublish("vol-a", &target).await.unwrap();
    assert!(h.runtime_snapshots.keys().is_empty(), "no snapshot survives");
    assert!(h.mounter.mounted().is_empty(), "no mount survives");
}

#[tokio::test]
async fn conflicting_publish_is_rejected() {
    let h = Harness::new(None).await;
    let target = h.target("vol-a");

    h.publish("vol-a", &target, true, "docker.io/library/nginx:1.25")
        .await
        .unwrap();

    // Same target, different read-only flag.
    let err = h
        .publish("vol-a", &target, false, "docker.io/library/nginx:1.25")
        .await
        .unwrap_err();
    assert!(matches!(err, CsiError::AlreadyExists(_)));

    // Same target, different image.
    let err = h
        .publish("vol-a", &target, true, "docker.io/library/redis:7")
        .await
        .unwrap_err();
    assert!(matches!(err, CsiError::AlreadyExists(_)));
}

#[tokio::test]
async fn unpublish_unknown_target_succeeds() {
    let h = Harness::new(None).await;
    h.unpublish("vol-x", &h.target("vol-x")).await.unwrap();
}

#[tokio::test]
async fn publish_and_unpublish_restore_initial_state() {
    let h = Harness::new(None).await;

    for round in 0..2 {
        for (vol, ro) in [("vol-a", true), ("vol-b", false), ("vol-c", true)] {
            let target = h.target(&format!("{vol}-{round}"));
            h.publish(vol, &target, ro, "docker.io/library/nginx:1.25")
                .await
                .unwrap();
            h.unpublish(vol, &target).await.unwrap();
        }
    }

    assert!(h.runtime_snapshots.keys().is_empty());
    assert!(h.mounter.mounted().is_empty());
    assert_eq!(h.snapshots.tracked(), 0);
}

#[tokio::test]
async fn pull_timeout_leaves_no_snapshot() {
    let h = Harness::new(Some(Duration::from_millis(50))).await;
    h.images.set_delay(Duration::from_millis(200));
    let target = h.target("vol-big");

    let err = h
        .publish("vol-big", &target, true, "docker.io/library/big:1")
        .await
        .unwrap_err();
    assert!(matches!(err, CsiError::DeadlineExceeded(_)));
    assert!(h.runtime_snapshots.keys().is_empty(), "timeout must not leak a snapshot");
    assert!(h.mounter.mounted().is_empty());

    // Once the stuck session has expired, a retry against a now-responsive
    // runtime succeeds and binds the mount.
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.images.set_delay(Duration::ZERO);
    h.publish("vol-big", &target, true, "docker.io/library/big:1")
        .await
        .unwrap();
    assert_eq!(h.runtime_snapshots.keys().len(), 1);
    assert_eq!(h.mounter.mounted().len(), 1);
}

#[tokio::test]
async fn caller_deadline_bounds_publish() {
    // No async session path; the caller's own deadline does the bounding.
    let h = Harness::new(None).await;
    h.images.set_delay(Duration::from_millis(200));
    let target = h.target("vol-slow");

    let err = h
        .publish_with_timeout("vol-slow", &target, true, "docker.io/library/slow:1", Some(50))
        .await
        .unwrap_err();
    assert!(matches!(err, CsiError::DeadlineExceeded(_)));
    assert!(h.runtime_snapshots.keys().is_empty(), "deadline must not leak a snapshot");
    assert!(h.mounter.mounted().is_empty());
}

#[tokio::test]
async fn concurrent_ro_publishes_share_one_pull_and_snapshot() {
    let h = Arc::new(Harness::new(None).await);
    h.images.set_delay(Duration::from_millis(50));

    let target_a = h.target("vol-a");
    let target_b = h.target("vol-b");
    let (a, b) = tokio::join!(
        h.publish("vol-a", &target_a, true, "docker.io/library/nginx:1.25"),
        h.publish("vol-b", &target_b, true, "docker.io/library/nginx:1.25"),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(h.images.pull_count(), 1, "one deduped pull");
    assert_eq!(h.runtime_snapshots.keys().len(), 1, "one shared snapshot");
    assert_eq!(h.snapshots.refcount(&shared_ro_key(&nginx())), Some(2));
}

// ---------------------------------------------------------------------------
// Crash / reconcile
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconcile_after_crash_restores_graph_and_prunes_orphans() {
    let h = Harness::new(None).await;
    let target = h.target("vol-a");

    h.publish("vol-a", &target, true, "docker.io/library/nginx:1.25")
        .await
        .unwrap();
    let key = shared_ro_key(&nginx());

    // Simulate a crash: in-memory state is rebuilt from scratch while the
    // runtime store and the bound mounts survive.  An extra snapshot with
    // no live mount is left behind to be pruned.
    h.runtime_snapshots.insert("ro:feedfacefeedface");
    let recovered = SnapshotManager::new(h.runtime_snapshots.clone());
    let report = recovered
        .reconcile(h.kubelet_root.path(), h.mounter.as_ref())
        .await
        .unwrap();

    assert_eq!(report.restored, 1);
    assert_eq!(report.orphans_removed, 1);
    assert_eq!(report.broken, 0);
    assert_eq!(recovered.refcount(&key), Some(1));
    assert!(!h.runtime_snapshots.keys().contains("ro:feedfacefeedface"));

    // The surviving mount releases cleanly through the recovered graph.
    recovered.release(&key).await;
    assert!(h.runtime_snapshots.keys().is_empty());
}

#[tokio::test]
async fn unpublish_after_crash_uses_the_sidecar_record() {
    let h = Harness::new(None).await;
    let target = h.target("vol-a");

    h.publish("vol-a", &target, true, "docker.io/library/nginx:1.25")
        .await
        .unwrap();

    // Fresh node over the same runtime and mount state, empty record table.
    let store = NodeSecretStore::new(h.kubelet_root.path().join("secrets"), "imagefsd", true).await;
    let resolver = CredentialResolver::new(store, None);
    let metrics = Arc::new(Metrics::new());
    let puller = Arc::new(Puller::new(h.images.clone(), metrics.clone()));
    let acquirer = ImageAcquirer::new(puller, SessionConfig::default());
    let recovered_snapshots = Arc::new(SnapshotManager::new(h.runtime_snapshots.clone()));
    recovered_snapshots
        .reconcile(h.kubelet_root.path(), h.mounter.as_ref())
        .await
        .unwrap();
    let node = ImageFsNode::new(
        "node-1",
        h.images.clone(),
        resolver,
        acquirer,
        recovered_snapshots,
        h.mounter.clone(),
        metrics,
    );

    node.unpublish_volume(&VolumeId("vol-a".into()), &target, None)
        .await
        .unwrap();
    assert!(h.runtime_snapshots.keys().is_empty());
    assert!(h.mounter.mounted().is_empty());
}
