//! # imagefsd — container images as CSI volumes
//!
//! The node-local driver behind the `csi.imagefs.dev` plugin.  A publish
//! request names a container image; the driver resolves registry
//! credentials, ensures the image is present in the node's container
//! runtime, materializes a snapshot of its merged filesystem, and
//! bind-mounts that snapshot at the path the kubelet requests.  Unpublish
//! tears the mount down and releases the snapshot.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`image`] | Canonical image references and registry-domain derivation. |
//! | [`cred`] | Credential resolution: secrets, pull secrets, provider binaries. |
//! | [`pull`] | Image acquisition: candidate walk, single-flight sessions. |
//! | [`snapshot`] | Snapshot lifecycle: refcount graph, keys, reconcile. |
//! | [`runtime`] | The runtime's image and snapshot services (gRPC). |
//! | [`mount`] | Bind-mount plumbing behind the [`mount::Mounter`] trait. |
//! | [`node`] | The CSI node backend tying it all together. |
//! | [`metrics`] | Prometheus metrics for pulls and operation errors. |

pub mod cred;
pub mod image;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod pull;
pub mod runtime;
pub mod snapshot;

pub use image::ImageRef;
pub use node::ImageFsNode;
