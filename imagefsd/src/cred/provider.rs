//! External credential-provider binaries.
//!
//! Two invocation dialects are supported and auto-detected from the
//! executable's basename:
//!
//! - **docker credential helpers** (`docker-credential-*`): invoked with
//!   `get`, the bare registry host on stdin, JSON
//!   `{ServerURL, Username, Secret}` on stdout;
//! - **kubelet credential-provider plugins** (anything else): invoked with
//!   their configured argv, a JSON `CredentialProviderRequest` on stdin,
//!   and a JSON response with an `auth` map on stdout.
//!
//! Provider failures are never fatal to a resolve — a provider that exits
//! non-zero or prints malformed JSON is logged and skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::cache::{CredentialCache, DEFAULT_TTL};
use super::AuthCandidate;
use crate::image::ImageRef;

/// Basename prefix that marks a docker credential helper.
const DOCKER_HELPER_PREFIX: &str = "docker-credential-";

/// API version offered to kubelet-dialect plugins when the config names none.
const DEFAULT_PLUGIN_API_VERSION: &str = "credentialprovider.kubelet.k8s.io/v1";

// ---------------------------------------------------------------------------
// Config file format
// ---------------------------------------------------------------------------

/// On-disk provider configuration
/// (`kind: CredentialProviderConfig`).
#[derive(Debug, Deserialize)]
pub struct CredentialProviderConfig {
    #[serde(default, rename = "apiVersion")]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub providers: Vec<CredentialProvider>,
}

/// Configuration of a single provider.  `name` doubles as the executable's
/// basename within the provider bin directory.
#[derive(Debug, Deserialize)]
pub struct CredentialProvider {
    pub name: String,
    #[serde(default, rename = "matchImages")]
    pub match_images: Vec<String>,
    #[serde(default, rename = "defaultCacheDuration")]
    pub default_cache_duration: Option<String>,
    #[serde(default, rename = "apiVersion")]
    pub api_version: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// An environment variable passed to the provider process.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Fatal configuration error: the config file exists but cannot be used.
#[derive(Debug, Error)]
pub enum ProviderConfigError {
    #[error("unreadable provider config {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unparseable provider config {path}: {reason}")]
    Unparseable { path: PathBuf, reason: String },
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    DockerHelper,
    KubeletPlugin,
}

struct Provider {
    name: String,
    executable: PathBuf,
    dialect: Dialect,
    args: Vec<String>,
    env: Vec<EnvVar>,
    api_version: String,
    match_images: Vec<String>,
    cache_ttl: Duration,
}

/// The set of registered provider binaries plus the shared result cache.
///
/// Constructed once at daemon startup and threaded through the resolver;
/// never a process-global.
pub struct ProviderRegistry {
    providers: Vec<Provider>,
    cache: CredentialCache,
}

impl ProviderRegistry {
    /// Load the provider config and register every provider whose
    /// executable exists under `bin_dir`.
    ///
    /// An unreadable or unparseable config file is fatal; individual
    /// missing executables are logged and skipped.
    pub fn load(config_path: &Path, bin_dir: &Path) -> Result<Self, ProviderConfigError> {
        let bytes = std::fs::read(config_path).map_err(|source| ProviderConfigError::Unreadable {
            path: config_path.to_owned(),
            source,
        })?;
        let config: CredentialProviderConfig =
            serde_json::from_slice(&bytes).map_err(|e| ProviderConfigError::Unparseable {
                path: config_path.to_owned(),
                reason: e.to_string(),
            })?;

        let mut providers = Vec::new();
        for entry in config.providers {
            let executable = bin_dir.join(&entry.name);
            match std::fs::metadata(&executable) {
                Ok(meta) if meta.is_dir() => {
                    warn!(path = %executable.display(), "provider path is a directory, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(
                        provider = %entry.name,
                        path = %executable.display(),
                        error = %e,
                        "provider executable not found, skipping",
                    );
                    continue;
                }
                Ok(_) => {}
            }

            let dialect = if entry.name.starts_with(DOCKER_HELPER_PREFIX) {
                Dialect::DockerHelper
            } else {
                Dialect::KubeletPlugin
            };

            let cache_ttl = entry
                .default_cache_duration
                .as_deref()
                .and_then(|raw| match humantime::parse_duration(raw) {
                    Ok(d) => Some(d),
                    Err(e) => {
                        warn!(provider = %entry.name, %raw, error = %e, "bad defaultCacheDuration");
                        None
                    }
                })
                .unwrap_or(DEFAULT_TTL);

            info!(provider = %entry.name, path = %executable.display(), "registered credential provider");
            providers.push(Provider {
                name: entry.name,
                executable,
                dialect,
                args: entry.args,
                env: entry.env,
                api_version: entry
                    .api_version
                    .unwrap_or_else(|| DEFAULT_PLUGIN_API_VERSION.to_owned()),
                match_images: entry.match_images,
                cache_ttl,
            });
        }

        Ok(Self {
            providers,
            cache: CredentialCache::new(),
        })
    }

    /// Ask every matching provider for credentials for `image`.
    pub async fn resolve(&self, image: &ImageRef) -> Vec<AuthCandidate> {
        let domain = image.registry_domain();

        if let Some(hit) = self.cache.get(domain) {
            debug!(%domain, "provider credentials served from cache");
            return hit;
        }

        let mut candidates = Vec::new();
        let mut ttl = None;
        for provider in &self.providers {
            if !matches_image(&provider.match_images, domain) {
                continue;
            }

            let outcome = match provider.dialect {
                Dialect::DockerHelper => invoke_docker_helper(provider, domain).await,
                Dialect::KubeletPlugin => invoke_kubelet_plugin(provider, image).await,
            };

            match outcome {
                Ok(Invocation {
                    candidates: found,
                    cache_duration,
                }) if !found.is_empty() => {
                    ttl.get_or_insert(cache_duration.unwrap_or(provider.cache_ttl));
                    for candidate in found {
                        candidates.extend(expand_ecr_encodings(candidate));
                    }
                }
                Ok(_) => debug!(provider = %provider.name, %domain, "provider had no credentials"),
                Err(e) => warn!(provider = %provider.name, error = %e, "provider failed, skipping"),
            }
        }

        if !candidates.is_empty() {
            self.cache
                .put(domain, candidates.clone(), ttl.unwrap_or(DEFAULT_TTL));
        }
        candidates
    }
}

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

/// Whether any of `patterns` matches the registry `domain`.
/// An empty pattern list matches everything.
pub fn matches_image(patterns: &[String], domain: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|p| wildcard_match(domain, p))
}

/// Wildcard matching where `*` stands for zero or more of any character.
pub fn wildcard_match(s: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return s == pattern;
    }

    let mut rest = match s.strip_prefix(parts[0]) {
        Some(rest) => rest,
        None => return false,
    };

    let last = parts[parts.len() - 1];
    if !last.is_empty() {
        rest = match rest.strip_suffix(last) {
            Some(rest) => rest,
            None => return false,
        };
    }

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
enum InvokeError {
    #[error("failed to run {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("{0} exited with {1}: {2}")]
    NonZero(String, String, String),
    #[error("{0} returned malformed output: {1}")]
    Malformed(String, String),
}

struct Invocation {
    candidates: Vec<AuthCandidate>,
    cache_duration: Option<Duration>,
}

impl Invocation {
    fn none() -> Self {
        Self {
            candidates: Vec::new(),
            cache_duration: None,
        }
    }
}

/// stdout of a docker credential helper.
#[derive(Debug, Deserialize)]
struct DockerHelperOutput {
    #[serde(default, rename = "ServerURL")]
    server_url: String,
    #[serde(default, rename = "Username")]
    username: String,
    #[serde(default, rename = "Secret")]
    secret: String,
}

/// stdout of a kubelet credential-provider plugin.
#[derive(Debug, Deserialize)]
struct PluginResponse {
    #[serde(default)]
    auth: HashMap<String, PluginAuthEntry>,
    #[serde(default, rename = "cacheDuration")]
    cache_duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PluginAuthEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn run(
    provider: &Provider,
    args: &[String],
    extra_env: &[EnvVar],
    stdin_payload: &[u8],
) -> Result<std::process::Output, InvokeError> {
    let mut cmd = Command::new(&provider.executable);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for env in provider.env.iter().chain(extra_env) {
        cmd.env(&env.name, &env.value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| InvokeError::Spawn(provider.name.clone(), e))?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(stdin_payload).await {
            // The child is reaped below regardless.
            warn!(provider = %provider.name, error = %e, "failed writing provider stdin");
        }
    }

    child
        .wait_with_output()
        .await
        .map_err(|e| InvokeError::Spawn(provider.name.clone(), e))
}

async fn invoke_docker_helper(
    provider: &Provider,
    domain: &str,
) -> Result<Invocation, InvokeError> {
    // Docker hub credentials are stored under the index host.
    let host = if domain == "docker.io" {
        "index.docker.io"
    } else {
        domain
    };

    let extra_env = ecr_region_env(provider, domain);
    let output = run(
        provider,
        &["get".to_owned()],
        &extra_env,
        format!("{host}\n").as_bytes(),
    )
    .await?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        // Helpers report a cache miss on stderr; that is not an error.
        if stderr.contains("credentials not found") || stderr.contains("not found") {
            return Ok(Invocation::none());
        }
        return Err(InvokeError::NonZero(
            provider.name.clone(),
            output.status.to_string(),
            stderr.into_owned(),
        ));
    }

    if output.stdout.is_empty() {
        return Ok(Invocation::none());
    }

    let parsed: DockerHelperOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| InvokeError::Malformed(provider.name.clone(), e.to_string()))?;

    if parsed.username.is_empty() && parsed.secret.is_empty() {
        return Ok(Invocation::none());
    }

    let mut candidate = AuthCandidate {
        server_address: if parsed.server_url.is_empty() {
            format!("https://{host}")
        } else {
            parsed.server_url
        },
        username: parsed.username,
        password: parsed.secret,
        ..Default::default()
    };
    candidate.normalize();

    Ok(Invocation {
        candidates: vec![candidate],
        cache_duration: None,
    })
}

async fn invoke_kubelet_plugin(
    provider: &Provider,
    image: &ImageRef,
) -> Result<Invocation, InvokeError> {
    let request = serde_json::json!({
        "apiVersion": provider.api_version,
        "kind": "CredentialProviderRequest",
        "image": image.as_str(),
    });
    let payload =
        serde_json::to_vec(&request).map_err(|e| InvokeError::Malformed(provider.name.clone(), e.to_string()))?;

    let extra_env = ecr_region_env(provider, image.registry_domain());
    let output = run(provider, &provider.args, &extra_env, &payload).await?;

    if !output.status.success() {
        return Err(InvokeError::NonZero(
            provider.name.clone(),
            output.status.to_string(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let response: PluginResponse = serde_json::from_str(text.trim())
        .map_err(|e| InvokeError::Malformed(provider.name.clone(), e.to_string()))?;

    let cache_duration = response
        .cache_duration
        .as_deref()
        .and_then(|raw| humantime::parse_duration(raw).ok());

    let candidates = response
        .auth
        .into_values()
        .filter(|entry| !entry.username.is_empty() || !entry.password.is_empty())
        .map(|entry| {
            let mut candidate = AuthCandidate {
                // server_address stays empty: the runtime infers the
                // registry from the image reference.
                username: entry.username,
                password: entry.password,
                ..Default::default()
            };
            candidate.normalize();
            candidate
        })
        .collect();

    Ok(Invocation {
        candidates,
        cache_duration,
    })
}

// ---------------------------------------------------------------------------
// AWS ECR specifics
// ---------------------------------------------------------------------------

fn is_ecr_helper(executable: &Path) -> bool {
    let base = executable
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.ends_with("ecr-login") || base.contains("ecr-credential-helper")
}

/// Derive an `AWS_REGION` env var from an ECR registry domain when neither
/// the provider config nor the process environment sets one.
fn ecr_region_env(provider: &Provider, domain: &str) -> Vec<EnvVar> {
    if !is_ecr_helper(&provider.executable) {
        return Vec::new();
    }
    if provider.env.iter().any(|e| e.name == "AWS_REGION")
        || std::env::var("AWS_REGION").is_ok()
    {
        return Vec::new();
    }
    match parse_ecr_region(domain) {
        Some(region) => {
            debug!(%domain, %region, "derived AWS_REGION from ECR registry");
            vec![EnvVar {
                name: "AWS_REGION".to_owned(),
                value: region,
            }]
        }
        None => Vec::new(),
    }
}

/// Extract the region segment of `acct.dkr.ecr.REGION.amazonaws.com`.
fn parse_ecr_region(domain: &str) -> Option<String> {
    if !domain.contains(".dkr.ecr.") || !domain.contains(".amazonaws.com") {
        return None;
    }
    let parts: Vec<&str> = domain.split('.').collect();
    if parts.len() >= 4 && parts[1] == "dkr" && parts[2] == "ecr" {
        Some(parts[3].to_owned())
    } else {
        None
    }
}

/// ECR authorization tokens arrive as username `AWS` plus a large base64
/// blob.  Runtimes disagree about whether they want the decoded text or the
/// raw form, so a decodable token yields both encodings, decoded first.
fn expand_ecr_encodings(mut candidate: AuthCandidate) -> Vec<AuthCandidate> {
    if candidate.username != "AWS" || candidate.password.len() <= 8 {
        return vec![candidate];
    }
    let decoded = match BASE64
        .decode(&candidate.password)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    {
        Some(text) => text,
        None => return vec![candidate],
    };

    let mut decoded_form = candidate.clone();
    decoded_form.password = decoded.clone();
    decoded_form.auth = BASE64.encode(format!("AWS:{decoded}"));

    candidate.auth = BASE64.encode(format!("AWS:{}", candidate.password));
    vec![decoded_form, candidate]
}
