//! Docker-config parsing and registry matching.
//!
//! A docker config maps registry keys to auth entries.  Keys in the wild
//! come in several shapes — bare hosts, `https://`/`http://`-prefixed
//! hosts, and host+path prefixes — so matching proceeds from exact to
//! increasingly loose forms.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::AuthCandidate;

/// Conventional secret key for the modern `{"auths": ...}` config format.
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
/// Conventional secret key for the legacy bare-map config format.
pub const DOCKER_CONFIG_KEY: &str = ".dockercfg";

/// One entry of a docker config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfigEntry {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth: String,
    #[serde(default, alias = "identitytoken")]
    pub identity_token: String,
    #[serde(default, alias = "registrytoken")]
    pub registry_token: String,
}

/// A parsed docker config: registry key → auth entry.
pub type DockerConfig = HashMap<String, DockerConfigEntry>;

#[derive(Debug, Error)]
#[error("docker config did not parse: {0}")]
pub struct DockerConfigError(String);

#[derive(Deserialize)]
struct DockerConfigJson {
    auths: DockerConfig,
}

/// Parse raw bytes as a docker config, accepting both the `{"auths": ...}`
/// wrapper and the legacy bare map.
pub fn parse(bytes: &[u8]) -> Result<DockerConfig, DockerConfigError> {
    if let Ok(wrapped) = serde_json::from_slice::<DockerConfigJson>(bytes) {
        return Ok(wrapped.auths);
    }
    serde_json::from_slice::<DockerConfig>(bytes).map_err(|e| DockerConfigError(e.to_string()))
}

/// Extract a docker config from a per-mount secret blob.
///
/// The config is looked for under the conventional secret keys first; as a
/// last resort each value that parses as a config on its own is merged in.
pub fn parse_secret_data(data: &HashMap<String, String>) -> Option<DockerConfig> {
    for key in [DOCKER_CONFIG_JSON_KEY, DOCKER_CONFIG_KEY] {
        if let Some(raw) = data.get(key) {
            match parse(raw.as_bytes()) {
                Ok(config) => return Some(config),
                Err(e) => {
                    debug!(%key, error = %e, "secret key held no parseable docker config");
                    return None;
                }
            }
        }
    }

    let mut merged = DockerConfig::new();
    for raw in data.values() {
        if let Ok(config) = parse(raw.as_bytes()) {
            merged.extend(config);
        }
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

/// Find the entry matching `domain` and turn it into a normalized candidate.
///
/// Match order: exact key, key with its `https://` or `http://` prefix
/// stripped, then substring containment in either direction as a last
/// resort.
pub fn match_registry(config: &DockerConfig, domain: &str) -> Option<AuthCandidate> {
    if let Some(entry) = config.get(domain) {
        return Some(candidate_from(entry, domain));
    }

    for (key, entry) in config {
        let stripped = key
            .strip_prefix("https://")
            .or_else(|| key.strip_prefix("http://"));
        if stripped == Some(domain) {
            return Some(candidate_from(entry, domain));
        }
    }

    for (key, entry) in config {
        if domain.contains(key.as_str()) || key.contains(domain) {
            debug!(%key, %domain, "registry matched by substring");
            return Some(candidate_from(entry, domain));
        }
    }

    None
}

fn candidate_from(entry: &DockerConfigEntry, domain: &str) -> AuthCandidate {
    let mut candidate = AuthCandidate {
        server_address: domain.to_owned(),
        username: entry.username.clone(),
        password: entry.password.clone(),
        auth: entry.auth.clone(),
        identity_token: entry.identity_token.clone(),
        registry_token: entry.registry_token.clone(),
    };
    candidate.normalize();
    candidate
}
