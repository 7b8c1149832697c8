//! Interfaces to the container runtime.
//!
//! The runtime's image service and snapshot service are external
//! collaborators; the driver consumes them through the two small traits
//! below and never looks inside.  The production implementation speaks gRPC
//! over the runtime's unix socket (see [`cri`]); tests substitute in-memory
//! fakes.

pub mod cri;

use async_trait::async_trait;
use thiserror::Error;

use crate::cred::AuthCandidate;
use crate::image::ImageRef;

/// Failure surface of the runtime services.
#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    /// The runtime endpoint is unreachable or refused the call.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// The named image or snapshot does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call ran past its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The wire broke down mid-call: the connection was established but the
    /// stream failed before a proper status came back.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call reached the runtime and failed there.
    #[error("runtime call failed: {0}")]
    Call(String),
}

/// Image metadata reported by the runtime.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    /// Runtime-assigned image id.
    pub id: String,
    /// Tags under which the image is known.
    pub repo_tags: Vec<String>,
    /// Digests under which the image is known.
    pub repo_digests: Vec<String>,
    /// Compressed size in bytes.
    pub size: u64,
}

/// Kind of a runtime snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    View,
    Active,
    Committed,
    Unknown,
}

/// One mount entry describing how a prepared snapshot is materialized.
#[derive(Debug, Clone)]
pub struct SnapshotMount {
    /// Mount type, e.g. `bind` or `overlay`.
    pub kind: String,
    /// Mount source; for the driver this is the merged-view root to bind.
    pub source: String,
    /// Mount options.
    pub options: Vec<String>,
}

/// Summary of a snapshot in the runtime's store.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    /// Runtime-scoped snapshot key.
    pub key: String,
    /// Parent reference the snapshot was prepared from.
    pub parent: String,
    /// Snapshot kind.
    pub kind: SnapshotKind,
}

/// The runtime's image service, as consumed by the image acquirer.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Pull `image`, optionally authenticating with `auth`.  Returns the
    /// runtime's canonical reference for the pulled image.
    async fn pull_image(
        &self,
        image: &ImageRef,
        auth: Option<&AuthCandidate>,
    ) -> Result<String, RuntimeError>;

    /// Report metadata for `image`, or `None` when the runtime does not
    /// have it.
    async fn image_status(&self, image: &ImageRef) -> Result<Option<ImageInfo>, RuntimeError>;

    /// Enumerate all images in the runtime store.
    async fn list_images(&self) -> Result<Vec<ImageInfo>, RuntimeError>;
}

/// The runtime's snapshot service, as consumed by the snapshot manager.
#[async_trait]
pub trait SnapshotService: Send + Sync {
    /// Materialize a writable snapshot under `key`, rooted at the committed
    /// layers of `parent`.
    async fn prepare(
        &self,
        key: &str,
        parent: &ImageRef,
    ) -> Result<Vec<SnapshotMount>, RuntimeError>;

    /// Remove the snapshot under `key`.
    async fn remove(&self, key: &str) -> Result<(), RuntimeError>;

    /// Enumerate all snapshots in the runtime's store.
    async fn list(&self) -> Result<Vec<SnapshotInfo>, RuntimeError>;
}
