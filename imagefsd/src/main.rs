//! Daemon entry point.
//!
//! Startup order: parse flags, initialize logging, connect the runtime
//! (fatal when unreachable), register credential providers (fatal when the
//! config is present but unusable), rebuild the snapshot graph from ground
//! truth, then serve the CSI endpoint until SIGTERM/SIGINT.
//!
//! Exit codes: `0` on graceful shutdown, `2` on startup misconfiguration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use libcsi::transport::CsiServer;

use imagefsd::cred::provider::ProviderRegistry;
use imagefsd::cred::{CredentialResolver, NodeSecretStore};
use imagefsd::metrics::Metrics;
use imagefsd::mount::LinuxMounter;
use imagefsd::node::ImageFsNode;
use imagefsd::pull::{ImageAcquirer, Puller, SessionConfig};
use imagefsd::runtime::cri::{self, CriImageClient, CriSnapshotClient};
use imagefsd::snapshot::SnapshotManager;

#[derive(Parser, Debug)]
#[command(
    name = "imagefsd",
    version,
    about = "CSI node driver that mounts container images as volumes"
)]
struct Args {
    /// Listen address for the CSI endpoint (host:port, QUIC)
    #[arg(long, default_value = "0.0.0.0:10750")]
    endpoint: String,

    /// Node identity echoed in NodeGetInfo
    #[arg(long)]
    node: String,

    /// Runtime endpoint for the image and snapshot services
    #[arg(long, default_value = "unix:///run/containerd/containerd.sock")]
    runtime_addr: String,

    /// Snapshotter backing image mounts
    #[arg(long, default_value = cri::DEFAULT_SNAPSHOTTER)]
    snapshotter: String,

    /// Enable async pulls with this per-session deadline (minimum 30s)
    #[arg(long, value_parser = humantime::parse_duration)]
    async_image_pull_timeout: Option<Duration>,

    /// Credential-provider config file; enables the external-provider source
    #[arg(long)]
    image_credential_provider_config: Option<PathBuf>,

    /// Directory containing the provider executables
    #[arg(long)]
    image_credential_provider_bin_dir: Option<PathBuf>,

    /// Identity whose attached pull secrets seed credential resolution
    #[arg(long, default_value = "imagefsd")]
    node_plugin_sa: String,

    /// Parse node pull secrets once at startup instead of per resolve
    #[arg(long)]
    enable_cache: bool,

    /// Directory holding the materialized pull-secret files
    #[arg(long, default_value = "/var/lib/imagefsd/secrets")]
    secrets_dir: PathBuf,

    /// Kubelet root; its pod-volume tree drives the startup reconcile
    #[arg(long, default_value = "/var/lib/kubelet")]
    kubelet_root: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %format!("{e:#}"), "startup failed");
        std::process::exit(2);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if args.node.is_empty() {
        bail!("--node must not be empty");
    }
    if args.node_plugin_sa.is_empty() {
        bail!("--node-plugin-sa must not be empty");
    }
    let listen_addr: SocketAddr = args
        .endpoint
        .trim_start_matches("quic://")
        .parse()
        .with_context(|| format!("invalid --endpoint {:?}", args.endpoint))?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    // Runtime connectivity is the first fatal gate.
    let channel = cri::connect(&args.runtime_addr)
        .await
        .with_context(|| format!("runtime at {} is unreachable", args.runtime_addr))?;
    info!(addr = %args.runtime_addr, "runtime connected");

    let providers = match (
        &args.image_credential_provider_config,
        &args.image_credential_provider_bin_dir,
    ) {
        (Some(config), Some(bin_dir)) => Some(
            ProviderRegistry::load(config, bin_dir)
                .context("credential provider config is unusable")?,
        ),
        (Some(_), None) => {
            bail!("--image-credential-provider-config requires --image-credential-provider-bin-dir")
        }
        _ => None,
    };

    let node_store =
        NodeSecretStore::new(args.secrets_dir.clone(), &args.node_plugin_sa, args.enable_cache)
            .await;
    let resolver = CredentialResolver::new(node_store, providers);

    let metrics = Arc::new(Metrics::new());
    let images = Arc::new(CriImageClient::new(channel.clone()));
    let snapshots_client = Arc::new(CriSnapshotClient::new(channel, args.snapshotter.clone()));

    let puller = Arc::new(Puller::new(images.clone(), metrics.clone()));
    let session_config =
        SessionConfig::default().with_async_timeout(args.async_image_pull_timeout);
    let acquirer = ImageAcquirer::new(puller, session_config);

    let snapshots = Arc::new(SnapshotManager::new(snapshots_client));
    let mounter = Arc::new(LinuxMounter::new());

    match snapshots.reconcile(&args.kubelet_root, mounter.as_ref()).await {
        Ok(report) => info!(
            restored = report.restored,
            orphans_removed = report.orphans_removed,
            broken = report.broken,
            "reconcile finished",
        ),
        Err(e) => warn!(error = %e, "reconcile failed; continuing with an empty graph"),
    }

    let node = Arc::new(ImageFsNode::new(
        args.node.clone(),
        images,
        resolver,
        acquirer,
        snapshots,
        mounter,
        metrics,
    ));

    let tls_config = self_signed_tls(&args.node)?;
    let server = CsiServer::new(listen_addr, tls_config, node)?;
    info!(%listen_addr, node = %args.node, "imagefsd serving");

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = server.serve() => {
            result.context("CSI server terminated")?;
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    server
        .endpoint()
        .close(quinn::VarInt::from_u32(0), b"shutdown");
    Ok(())
}

/// Mint the daemon's self-signed server certificate.
///
/// Co-located clients pin the certificate rather than walking a CA chain,
/// so a fresh key pair per process is sufficient.
fn self_signed_tls(node: &str) -> anyhow::Result<rustls::ServerConfig> {
    let mut names = vec!["localhost".to_owned()];
    if !node.is_empty() {
        names.push(node.to_owned());
    }
    let certified = rcgen::generate_simple_self_signed(names)
        .context("generating the server certificate")?;
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
        certified.key_pair.serialize_der().into(),
    );
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key)
        .context("assembling the TLS config")?;
    Ok(config)
}
