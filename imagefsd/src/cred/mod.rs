//! Credential resolution for image pulls.
//!
//! [`CredentialResolver::resolve`] produces an ordered list of
//! [`AuthCandidate`]s for an image reference, drawing from three sources in
//! fixed priority order:
//!
//! 1. the per-mount secret blob handed in with the publish request,
//! 2. the node-scoped pull secrets attached to the driver's own identity,
//! 3. external credential-provider binaries.
//!
//! Resolution never fails hard: an empty list is a valid result meaning
//! "attempt an anonymous pull".  Candidates are ephemeral — constructed per
//! request, consumed by the puller in order, never persisted.

pub mod cache;
pub mod docker_config;
pub mod provider;

use std::collections::HashMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::image::ImageRef;
use docker_config::DockerConfig;
use provider::ProviderRegistry;

/// A single registry-auth record tried during a pull attempt.
///
/// This is the one credential shape in the driver; every source normalizes
/// into it.  `auth` is the base64 of `username:password` whenever both are
/// present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCandidate {
    pub server_address: String,
    pub username: String,
    pub password: String,
    pub auth: String,
    pub identity_token: String,
    pub registry_token: String,
}

impl AuthCandidate {
    /// Ensure both the `auth` field and the username/password pair are
    /// populated.  Some runtimes prefer one form, some the other.
    ///
    /// A non-decodable `auth` field is left untouched; the candidate stays
    /// usable in its raw form.
    pub fn normalize(&mut self) {
        if !self.auth.is_empty() && self.username.is_empty() && self.password.is_empty() {
            match BASE64.decode(&self.auth) {
                Ok(decoded) => {
                    if let Ok(text) = String::from_utf8(decoded) {
                        if let Some((user, pass)) = text.split_once(':') {
                            self.username = user.to_owned();
                            self.password = pass.to_owned();
                        }
                    }
                }
                Err(e) => debug!(error = %e, "auth field is not valid base64, keeping raw"),
            }
        }

        if !self.username.is_empty() && !self.password.is_empty() && self.auth.is_empty() {
            self.auth = BASE64.encode(format!("{}:{}", self.username, self.password));
        }
    }

    /// Whether the candidate carries any usable credential material.
    pub fn is_empty(&self) -> bool {
        self.username.is_empty()
            && self.password.is_empty()
            && self.auth.is_empty()
            && self.identity_token.is_empty()
            && self.registry_token.is_empty()
    }
}

/// Node-scoped pull-secret store.
///
/// Pull secrets attached to the driver's identity are materialized as
/// docker-config JSON files under `<secrets_dir>/<identity>/`.  With caching
/// enabled the files are parsed once at startup; otherwise every resolve
/// re-reads them so secret rotation is picked up without a restart.
pub struct NodeSecretStore {
    dir: PathBuf,
    cached: Option<Vec<DockerConfig>>,
}

impl NodeSecretStore {
    /// Build the store for the given identity.
    ///
    /// With `enable_cache` the secret files are read eagerly, once.
    pub async fn new(secrets_dir: PathBuf, identity: &str, enable_cache: bool) -> Self {
        let dir = secrets_dir.join(identity);
        let cached = if enable_cache {
            Some(Self::load(&dir).await)
        } else {
            None
        };
        Self { dir, cached }
    }

    async fn load(dir: &PathBuf) -> Vec<DockerConfig> {
        let mut configs = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "no node pull secrets");
                return configs;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable pull secret, skipping");
                    continue;
                }
            };
            match docker_config::parse(&bytes) {
                Ok(config) => configs.push(config),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unparseable pull secret, skipping")
                }
            }
        }
        configs
    }

    /// All candidates the node pull secrets hold for `image`.
    pub async fn lookup(&self, image: &ImageRef) -> Vec<AuthCandidate> {
        let configs = match &self.cached {
            Some(configs) => configs.clone(),
            None => Self::load(&self.dir).await,
        };
        let domain = image.registry_domain();
        configs
            .iter()
            .filter_map(|config| docker_config::match_registry(config, domain))
            .collect()
    }
}

/// The credential resolver (C1).
pub struct CredentialResolver {
    node_store: NodeSecretStore,
    providers: Option<ProviderRegistry>,
}

impl CredentialResolver {
    pub fn new(node_store: NodeSecretStore, providers: Option<ProviderRegistry>) -> Self {
        Self {
            node_store,
            providers,
        }
    }

    /// Produce the ordered candidate list for `image`.
    ///
    /// Never returns an error; sources that fail are logged and skipped.
    pub async fn resolve(
        &self,
        image: &ImageRef,
        secret_data: &HashMap<String, String>,
    ) -> Vec<AuthCandidate> {
        let mut candidates = Vec::new();
        let domain = image.registry_domain();

        if !secret_data.is_empty() {
            match docker_config::parse_secret_data(secret_data) {
                Some(config) => {
                    candidates.extend(docker_config::match_registry(&config, domain));
                }
                None => warn!(%image, "per-mount secret data carried no docker config"),
            }
        }

        candidates.extend(self.node_store.lookup(image).await);

        if let Some(providers) = &self.providers {
            candidates.extend(providers.resolve(image).await);
        }

        debug!(%image, count = candidates.len(), "credential candidates resolved");
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_fills_auth_from_pair() {
        let mut c = AuthCandidate {
            username: "user".into(),
            password: "pass".into(),
            ..Default::default()
        };
        c.normalize();
        assert_eq!(c.auth, BASE64.encode("user:pass"));
    }

    #[test]
    fn normalize_fills_pair_from_auth() {
        let mut c = AuthCandidate {
            auth: BASE64.encode("alice:s3cret"),
            ..Default::default()
        };
        c.normalize();
        assert_eq!(c.username, "alice");
        assert_eq!(c.password, "s3cret");
    }

    #[test]
    fn normalize_auth_decodes_back_to_pair() {
        // Round-trip law: after normalization, base64-decoding `auth`
        // yields exactly `username:password`.
        let mut c = AuthCandidate {
            username: "u".into(),
            password: "p:with:colons".into(),
            ..Default::default()
        };
        c.normalize();
        let decoded = BASE64.decode(&c.auth).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "u:p:with:colons");
    }

    #[test]
    fn normalize_keeps_undecodable_auth() {
        let mut c = AuthCandidate {
            auth: "!!! not base64 !!!".into(),
            ..Default::default()
        };
        c.normalize();
        assert_eq!(c.auth, "!!! not base64 !!!");
        assert!(c.username.is_empty());
    }

    #[tokio::test]
    async fn missing_secrets_dir_is_empty_not_fatal() {
        let store =
            NodeSecretStore::new(PathBuf::from("/nonexistent/secrets"), "imagefsd", true).await;
        let image = ImageRef::parse("registry.example.com/app:1").unwrap();
        assert!(store.lookup(&image).await.is_empty());
    }

    #[tokio::test]
    async fn node_store_reads_secret_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("imagefsd");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("pull-secret.json"),
            r#"{"auths":{"registry.example.com":{"username":"u","password":"p"}}}"#,
        )
        .unwrap();

        let store = NodeSecretStore::new(tmp.path().to_path_buf(), "imagefsd", false).await;
        let image = ImageRef::parse("registry.example.com/app:1").unwrap();
        let candidates = store.lookup(&image).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].username, "u");
        assert_eq!(candidates[0].server_address, "registry.example.com");
    }
}
