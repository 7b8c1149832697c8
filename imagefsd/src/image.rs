//! Canonical image references.
//!
//! An [`ImageRef`] is the fully-qualified string identity of a container
//! image: registry, repository, and a tag or digest.  Normalization happens
//! exactly once, on entry: `nginx` becomes `docker.io/library/nginx:latest`,
//! `nginx:1.25` becomes `docker.io/library/nginx:1.25`, and digest
//! references keep their digest.  Two equal `ImageRef`s denote the same
//! image for all purposes — snapshot sharing, pull deduplication, and
//! credential lookup all key on it.

use oci_spec::distribution::Reference;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Registry assumed when a reference carries no explicit registry host.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Error raised for references that do not parse.
#[derive(Debug, Error)]
#[error("invalid image reference {reference:?}: {reason}")]
pub struct ImageRefError {
    /// The offending input.
    pub reference: String,
    /// Parser diagnostic.
    pub reason: String,
}

/// A normalized, fully-qualified image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    /// Parse and normalize a raw reference string.
    pub fn parse(raw: &str) -> Result<Self, ImageRefError> {
        if raw.trim().is_empty() {
            return Err(ImageRefError {
                reference: raw.to_owned(),
                reason: "empty reference".into(),
            });
        }

        let reference: Reference = raw.parse().map_err(|e| ImageRefError {
            reference: raw.to_owned(),
            reason: format!("{e}"),
        })?;

        let registry = match reference.registry() {
            r if r.is_empty() => DEFAULT_REGISTRY,
            r => r,
        };

        let canonical = if let Some(digest) = reference.digest() {
            format!("{}/{}@{}", registry, reference.repository(), digest)
        } else {
            let tag = reference.tag().unwrap_or("latest");
            format!("{}/{}:{}", registry, reference.repository(), tag)
        };

        Ok(Self(canonical))
    }

    /// The canonical reference string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The registry host (with optional port) of this reference.
    ///
    /// The first `/`-delimited segment when it contains a `.` or `:`,
    /// otherwise the implicit `docker.io`.
    pub fn registry_domain(&self) -> &str {
        let first = match self.0.split_once('/') {
            Some((first, _)) => first,
            None => return DEFAULT_REGISTRY,
        };
        if first.contains('.') || first.contains(':') {
            first
        } else {
            DEFAULT_REGISTRY
        }
    }

    /// The reference without its tag or digest suffix.
    pub fn repo_path(&self) -> &str {
        let end = self
            .0
            .find('@')
            .or_else(|| {
                // A ':' after the last '/' separates the tag; earlier colons
                // belong to a registry port.
                let slash = self.0.rfind('/').map_or(0, |i| i + 1);
                self.0[slash..].find(':').map(|i| slash + i)
            })
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ImageRef {
    type Err = ImageRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_names_to_docker_hub() {
        let r = ImageRef::parse("nginx").unwrap();
        assert_eq!(r.as_str(), "docker.io/library/nginx:latest");
        assert_eq!(r.registry_domain(), "docker.io");
    }

    #[test]
    fn keeps_explicit_registry_and_tag() {
        let r = ImageRef::parse("registry.example.com/app:1.0").unwrap();
        assert_eq!(r.as_str(), "registry.example.com/app:1.0");
        assert_eq!(r.registry_domain(), "registry.example.com");
        assert_eq!(r.repo_path(), "registry.example.com/app");
    }

    #[test]
    fn keeps_registry_port() {
        let r = ImageRef::parse("localhost:5000/ns/app:v1").unwrap();
        assert_eq!(r.registry_domain(), "localhost:5000");
        assert_eq!(r.repo_path(), "localhost:5000/ns/app");
    }

    #[test]
    fn digest_reference() {
        let digest = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let r = ImageRef::parse(&format!("quay.io/ns/app@{digest}")).unwrap();
        assert_eq!(r.repo_path(), "quay.io/ns/app");
        assert!(r.as_str().ends_with(digest));
    }

    #[test]
    fn namespaced_hub_image() {
        let r = ImageRef::parse("user/repo:v2").unwrap();
        assert_eq!(r.as_str(), "docker.io/user/repo:v2");
        assert_eq!(r.registry_domain(), "docker.io");
    }

    #[test]
    fn registry_domain_stable_under_normalization() {
        for raw in ["nginx", "user/repo", "registry.io/a/b:1", "localhost:5000/x"] {
            let once = ImageRef::parse(raw).unwrap();
            let twice = ImageRef::parse(once.as_str()).unwrap();
            assert_eq!(once, twice);
            assert_eq!(once.registry_domain(), twice.registry_domain());
        }
    }

    #[test]
    fn rejects_empty() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("   ").is_err());
    }
}
