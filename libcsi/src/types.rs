//! Core CSI types: volume identity, node requests, and plugin metadata.
//!
//! These types form the data model shared by the CSI traits, the transport
//! layer, and the driver.  They are all [`Serialize`]/[`Deserialize`] so
//! they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque identifier for a volume, stable for the lifetime of the mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl Default for VolumeId {
    fn default() -> Self {
        Self(String::new())
    }
}

// ---------------------------------------------------------------------------
// Node requests
// ---------------------------------------------------------------------------

/// Request to stage a volume on a node.
///
/// For this driver staging is a validation-only no-op; the real work happens
/// at publish time.  The request is still carried in full so the surface
/// stays wire-compatible with orchestrators that stage before publishing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging path assigned by the orchestrator.
    pub staging_target_path: String,
    /// Opaque driver attributes (`image`, `pullAlways`, ...).
    #[serde(default)]
    pub volume_attributes: HashMap<String, String>,
}

/// Request to publish (bind-mount) an image-backed volume at a target path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// Absolute path on the node at which the volume must appear.
    pub target_path: String,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Opaque driver attributes.  Recognized keys: `image` (required),
    /// `pullAlways`, `secret`, `secretNamespace`.
    #[serde(default)]
    pub volume_attributes: HashMap<String, String>,
    /// Optional per-mount credential blob (docker-config shaped).
    #[serde(default)]
    pub secret_data: HashMap<String, String>,
    /// Caller-supplied deadline for the whole operation, in milliseconds.
    /// Absent means only the server's own limits apply.
    #[serde(default)]
    pub timeout_millis: Option<u64>,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"csi.imagefs.dev"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// Capabilities advertised by the Node service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    /// The node supports the stage/unstage round trip (as no-ops here).
    StageUnstageVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier, echoed from the daemon's `--node` flag.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("vol-abc".into());
        assert_eq!(id.to_string(), "vol-abc");
    }

    #[test]
    fn publish_request_serde_roundtrip() {
        let req = NodePublishVolumeRequest {
            volume_id: VolumeId("v1".into()),
            target_path: "/var/lib/kubelet/pods/u/volumes/kubernetes.io~csi/v1/mount".into(),
            read_only: true,
            volume_attributes: HashMap::from([(
                "image".into(),
                "docker.io/library/nginx:1.25".into(),
            )]),
            secret_data: HashMap::new(),
            timeout_millis: Some(30_000),
        };
        let json = serde_json::to_string(&req).expect("serialize");
        let de: NodePublishVolumeRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de.volume_id, req.volume_id);
        assert!(de.read_only);
        assert_eq!(de.volume_attributes["image"], "docker.io/library/nginx:1.25");
        assert_eq!(de.timeout_millis, Some(30_000));
    }

    #[test]
    fn publish_request_defaults() {
        let de: NodePublishVolumeRequest =
            serde_json::from_str(r#"{"volume_id":"v","target_path":"/t"}"#).expect("deserialize");
        assert!(!de.read_only);
        assert!(de.volume_attributes.is_empty());
        assert!(de.secret_data.is_empty());
        assert!(de.timeout_millis.is_none());
    }
}
