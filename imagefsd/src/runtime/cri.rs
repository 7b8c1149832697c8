//! gRPC clients for the runtime's image and snapshot services.
//!
//! The driver needs five RPCs in total, so the protobuf surface is written
//! out by hand as `prost` messages with pinned field tags instead of going
//! through a codegen step.  Calls are issued through [`tonic::client::Grpc`]
//! directly with a [`ProstCodec`] per method.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Code, Request, Status};
use tower::service_fn;
use tracing::{debug, instrument};

use super::{
    ImageInfo, ImageService, RuntimeError, SnapshotInfo, SnapshotKind, SnapshotMount,
    SnapshotService,
};
use crate::cred::AuthCandidate;
use crate::image::ImageRef;

/// Snapshotter used when the operator does not name one.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

const IMAGE_PULL: &str = "/runtime.v1.ImageService/PullImage";
const IMAGE_STATUS: &str = "/runtime.v1.ImageService/ImageStatus";
const IMAGE_LIST: &str = "/runtime.v1.ImageService/ListImages";
const SNAPSHOT_PREPARE: &str = "/containerd.services.snapshots.v1.Snapshots/Prepare";
const SNAPSHOT_REMOVE: &str = "/containerd.services.snapshots.v1.Snapshots/Remove";
const SNAPSHOT_LIST: &str = "/containerd.services.snapshots.v1.Snapshots/List";

/// Wire messages, transcribed from the CRI and containerd protos.  Only the
/// fields the driver reads or writes are declared; unknown fields are
/// skipped by prost on decode and absent on encode.
mod proto {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ImageSpec {
        #[prost(string, tag = "1")]
        pub image: String,
        #[prost(map = "string, string", tag = "2")]
        pub annotations: HashMap<String, String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AuthConfig {
        #[prost(string, tag = "1")]
        pub username: String,
        #[prost(string, tag = "2")]
        pub password: String,
        #[prost(string, tag = "3")]
        pub auth: String,
        #[prost(string, tag = "4")]
        pub server_address: String,
        #[prost(string, tag = "5")]
        pub identity_token: String,
        #[prost(string, tag = "6")]
        pub registry_token: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PullImageRequest {
        #[prost(message, optional, tag = "1")]
        pub image: Option<ImageSpec>,
        #[prost(message, optional, tag = "2")]
        pub auth: Option<AuthConfig>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PullImageResponse {
        #[prost(string, tag = "1")]
        pub image_ref: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ImageStatusRequest {
        #[prost(message, optional, tag = "1")]
        pub image: Option<ImageSpec>,
        #[prost(bool, tag = "2")]
        pub verbose: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Image {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(string, repeated, tag = "2")]
        pub repo_tags: Vec<String>,
        #[prost(string, repeated, tag = "3")]
        pub repo_digests: Vec<String>,
        #[prost(uint64, tag = "4")]
        pub size: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ImageStatusResponse {
        #[prost(message, optional, tag = "1")]
        pub image: Option<Image>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ListImagesRequest {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ListImagesResponse {
        #[prost(message, repeated, tag = "1")]
        pub images: Vec<Image>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PrepareSnapshotRequest {
        #[prost(string, tag = "1")]
        pub snapshotter: String,
        #[prost(string, tag = "2")]
        pub key: String,
        #[prost(string, tag = "3")]
        pub parent: String,
        #[prost(map = "string, string", tag = "4")]
        pub labels: HashMap<String, String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Mount {
        #[prost(string, tag = "1")]
        pub r#type: String,
        #[prost(string, tag = "2")]
        pub source: String,
        #[prost(string, tag = "3")]
        pub target: String,
        #[prost(string, repeated, tag = "4")]
        pub options: Vec<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PrepareSnapshotResponse {
        #[prost(message, repeated, tag = "1")]
        pub mounts: Vec<Mount>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RemoveSnapshotRequest {
        #[prost(string, tag = "1")]
        pub snapshotter: String,
        #[prost(string, tag = "2")]
        pub key: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Empty {}

    #[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
    #[repr(i32)]
    pub enum Kind {
        Unknown = 0,
        View = 1,
        Active = 2,
        Committed = 3,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Info {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub parent: String,
        #[prost(enumeration = "Kind", tag = "3")]
        pub kind: i32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ListSnapshotsRequest {
        #[prost(string, tag = "1")]
        pub snapshotter: String,
        #[prost(string, repeated, tag = "2")]
        pub filters: Vec<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ListSnapshotsResponse {
        #[prost(message, repeated, tag = "1")]
        pub info: Vec<Info>,
    }
}

/// Connect a gRPC channel to the runtime endpoint.
///
/// `unix://` addresses dial a unix-domain socket through a custom connector;
/// anything else is treated as a plain HTTP/2 endpoint.
pub async fn connect(addr: &str) -> Result<Channel, RuntimeError> {
    if let Some(path) = addr.strip_prefix("unix://") {
        let path = PathBuf::from(path);
        // The authority is never used; the connector supplies the stream.
        Endpoint::try_from("http://localhost")
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?
            .connect_timeout(Duration::from_secs(10))
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
                }
            }))
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("dial {addr}: {e}")))
    } else {
        Endpoint::try_from(addr.to_owned())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?
            .connect_timeout(Duration::from_secs(10))
            .connect()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("dial {addr}: {e}")))
    }
}

fn map_status(status: Status) -> RuntimeError {
    match status.code() {
        Code::Unavailable => RuntimeError::Unavailable(status.message().to_owned()),
        Code::NotFound => RuntimeError::NotFound(status.message().to_owned()),
        Code::DeadlineExceeded => RuntimeError::DeadlineExceeded(status.message().to_owned()),
        // tonic reports h2-level stream failures as Internal.
        Code::Internal => RuntimeError::Transport(status.message().to_owned()),
        code => RuntimeError::Call(format!("{code:?}: {}", status.message())),
    }
}

async fn ready(channel: &Channel) -> Result<Grpc<Channel>, RuntimeError> {
    let mut grpc = Grpc::new(channel.clone());
    grpc.ready()
        .await
        .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
    Ok(grpc)
}

impl From<&AuthCandidate> for proto::AuthConfig {
    fn from(c: &AuthCandidate) -> Self {
        Self {
            username: c.username.clone(),
            password: c.password.clone(),
            auth: c.auth.clone(),
            server_address: c.server_address.clone(),
            identity_token: c.identity_token.clone(),
            registry_token: c.registry_token.clone(),
        }
    }
}

impl From<proto::Image> for ImageInfo {
    fn from(img: proto::Image) -> Self {
        Self {
            id: img.id,
            repo_tags: img.repo_tags,
            repo_digests: img.repo_digests,
            size: img.size,
        }
    }
}

// ---------------------------------------------------------------------------
// Image service client
// ---------------------------------------------------------------------------

/// [`ImageService`] implementation over the runtime's CRI image service.
#[derive(Clone)]
pub struct CriImageClient {
    channel: Channel,
}

impl CriImageClient {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    fn spec(image: &ImageRef) -> proto::ImageSpec {
        proto::ImageSpec {
            image: image.as_str().to_owned(),
            annotations: Default::default(),
        }
    }
}

#[async_trait]
impl ImageService for CriImageClient {
    #[instrument(skip(self, auth), fields(image = %image))]
    async fn pull_image(
        &self,
        image: &ImageRef,
        auth: Option<&AuthCandidate>,
    ) -> Result<String, RuntimeError> {
        let mut grpc = ready(&self.channel).await?;
        let req = proto::PullImageRequest {
            image: Some(Self::spec(image)),
            auth: auth.map(Into::into),
        };
        let codec: ProstCodec<proto::PullImageRequest, proto::PullImageResponse> =
            ProstCodec::default();
        let resp = grpc
            .unary(
                Request::new(req),
                PathAndQuery::from_static(IMAGE_PULL),
                codec,
            )
            .await
            .map_err(map_status)?;
        let image_ref = resp.into_inner().image_ref;
        debug!(%image_ref, "image pulled");
        Ok(image_ref)
    }

    async fn image_status(&self, image: &ImageRef) -> Result<Option<ImageInfo>, RuntimeError> {
        let mut grpc = ready(&self.channel).await?;
        let req = proto::ImageStatusRequest {
            image: Some(Self::spec(image)),
            verbose: false,
        };
        let codec: ProstCodec<proto::ImageStatusRequest, proto::ImageStatusResponse> =
            ProstCodec::default();
        let resp = grpc
            .unary(
                Request::new(req),
                PathAndQuery::from_static(IMAGE_STATUS),
                codec,
            )
            .await;
        match resp {
            Ok(resp) => Ok(resp.into_inner().image.map(Into::into)),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(map_status(status)),
        }
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>, RuntimeError> {
        let mut grpc = ready(&self.channel).await?;
        let codec: ProstCodec<proto::ListImagesRequest, proto::ListImagesResponse> =
            ProstCodec::default();
        let resp = grpc
            .unary(
                Request::new(proto::ListImagesRequest {}),
                PathAndQuery::from_static(IMAGE_LIST),
                codec,
            )
            .await
            .map_err(map_status)?;
        Ok(resp.into_inner().images.into_iter().map(Into::into).collect())
    }
}

// ---------------------------------------------------------------------------
// Snapshot service client
// ---------------------------------------------------------------------------

/// [`SnapshotService`] implementation over the containerd snapshots service.
#[derive(Clone)]
pub struct CriSnapshotClient {
    channel: Channel,
    snapshotter: String,
}

impl CriSnapshotClient {
    pub fn new(channel: Channel, snapshotter: impl Into<String>) -> Self {
        Self {
            channel,
            snapshotter: snapshotter.into(),
        }
    }
}

#[async_trait]
impl SnapshotService for CriSnapshotClient {
    #[instrument(skip(self))]
    async fn prepare(
        &self,
        key: &str,
        parent: &ImageRef,
    ) -> Result<Vec<SnapshotMount>, RuntimeError> {
        let mut grpc = ready(&self.channel).await?;
        let req = proto::PrepareSnapshotRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_owned(),
            parent: parent.as_str().to_owned(),
            labels: Default::default(),
        };
        let codec: ProstCodec<proto::PrepareSnapshotRequest, proto::PrepareSnapshotResponse> =
            ProstCodec::default();
        let resp = grpc
            .unary(
                Request::new(req),
                PathAndQuery::from_static(SNAPSHOT_PREPARE),
                codec,
            )
            .await
            .map_err(map_status)?;
        Ok(resp
            .into_inner()
            .mounts
            .into_iter()
            .map(|m| SnapshotMount {
                kind: m.r#type,
                source: m.source,
                options: m.options,
            })
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<(), RuntimeError> {
        let mut grpc = ready(&self.channel).await?;
        let req = proto::RemoveSnapshotRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_owned(),
        };
        let codec: ProstCodec<proto::RemoveSnapshotRequest, proto::Empty> = ProstCodec::default();
        grpc.unary(
            Request::new(req),
            PathAndQuery::from_static(SNAPSHOT_REMOVE),
            codec,
        )
        .await
        .map_err(map_status)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SnapshotInfo>, RuntimeError> {
        let mut grpc = ready(&self.channel).await?;
        let req = proto::ListSnapshotsRequest {
            snapshotter: self.snapshotter.clone(),
            filters: Vec::new(),
        };
        let codec: ProstCodec<proto::ListSnapshotsRequest, proto::ListSnapshotsResponse> =
            ProstCodec::default();
        let resp = grpc
            .server_streaming(
                Request::new(req),
                PathAndQuery::from_static(SNAPSHOT_LIST),
                codec,
            )
            .await
            .map_err(map_status)?;

        let mut stream = resp.into_inner();
        let mut snapshots = Vec::new();
        while let Some(batch) = stream.message().await.map_err(map_status)? {
            for info in batch.info {
                let kind = match proto::Kind::try_from(info.kind) {
                    Ok(proto::Kind::View) => SnapshotKind::View,
                    Ok(proto::Kind::Active) => SnapshotKind::Active,
                    Ok(proto::Kind::Committed) => SnapshotKind::Committed,
                    _ => SnapshotKind::Unknown,
                };
                snapshots.push(SnapshotInfo {
                    key: info.name,
                    parent: info.parent,
                    kind,
                });
            }
        }
        Ok(snapshots)
    }
}
