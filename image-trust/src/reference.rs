// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Canonical container image references.
//!
//! A reference is parsed with the grammar used by the docker distribution
//! project: `[domain[:port]/]path[/path...][:tag][@algorithm:hex]`. The
//! registry is only taken from the first path segment when that segment looks
//! like a host, otherwise the image lives on Docker Hub.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

use crate::{Error, Result};

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_REPOSITORY: &str = "library";
pub const DEFAULT_TAG: &str = "latest";
pub const SHA256: &str = "sha256";

/// Longest accepted name (everything before tag and digest).
const NAME_TOTAL_LENGTH_MAX: usize = 255;

/// Hex length of a sha256 digest.
const SHA256_HEX_LENGTH: usize = 64;

lazy_static! {
    static ref REFERENCE_REGEX: Regex = {
        let domain_component = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";
        let domain = format!(r"{domain_component}(?:\.{domain_component})*(?::[0-9]+)?");
        let path_component = r"[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*";
        let name = format!(r"(?:{domain}/)?{path_component}(?:/{path_component})*");
        let tag = r"[\w][\w.-]{0,127}";
        let digest = r"([A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*):([0-9a-fA-F]{32,})";
        Regex::new(&format!(r"^({name})(?::({tag}))?(?:@{digest})?$"))
            .expect("reference grammar is a valid regex")
    };
}

/// A parsed and canonicalised image reference.
///
/// Two references are equal when their canonical string forms are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    name: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self> {
        let captures = REFERENCE_REGEX
            .captures(image)
            .ok_or_else(|| Error::InvalidImageFormat(image.to_string()))?;

        let full_name = &captures[1];
        if full_name.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(Error::InvalidImageFormat(image.to_string()));
        }

        let tag = captures.get(2).map(|m| m.as_str().to_string());
        let digest = match (captures.get(3), captures.get(4)) {
            (Some(algo), Some(hex)) => {
                if algo.as_str() != SHA256 || !is_sha256_hex(hex.as_str()) {
                    return Err(Error::InvalidImageFormat(image.to_string()));
                }
                Some(hex.as_str().to_string())
            }
            _ => None,
        };

        let mut segments: Vec<&str> = full_name.split('/').collect();
        let registry = match segments.first() {
            Some(first) if segments.len() > 1 && is_registry_host(first) => {
                let registry = first.to_string();
                segments.remove(0);
                registry
            }
            _ => DEFAULT_REGISTRY.to_string(),
        };

        // the regex guarantees at least one path component
        let name = segments.pop().unwrap_or_default().to_string();
        let mut repository = segments.join("/");
        if repository.is_empty() && registry == DEFAULT_REGISTRY {
            repository = DEFAULT_REPOSITORY.to_string();
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            name,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Path between registry and name, possibly empty.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Hex encoded digest without the algorithm prefix.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Pin the reference to a resolved sha256 digest. An existing tag is kept
    /// so the patched reference still shows what was requested.
    pub fn set_digest(&mut self, digest: &str) {
        let digest = digest
            .strip_prefix(&format!("{SHA256}:"))
            .unwrap_or(digest)
            .to_lowercase();
        self.digest = Some(digest);
    }

    /// `registry/repository/name` without any tag or digest.
    pub fn repository_path(&self) -> String {
        match self.repository.is_empty() {
            true => format!("{}/{}", self.registry, self.name),
            false => format!("{}/{}/{}", self.registry, self.repository, self.name),
        }
    }
}

fn is_sha256_hex(hex: &str) -> bool {
    hex.len() == SHA256_HEX_LENGTH
        && hex
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// A first path segment names a registry host if it contains a dot or a port
/// separator, is `localhost`, or carries an uppercase letter (namespaces on
/// Docker Hub are lowercase only).
fn is_registry_host(segment: &str) -> bool {
    segment.contains('.')
        || segment.contains(':')
        || segment == "localhost"
        || segment.chars().any(|c| c.is_ascii_uppercase())
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for ImageReference {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository_path())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{SHA256}:{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const DIGEST: &str = "859b5aada817b3eb53410222e8fc232cf126c9e598390ae61895eb96f52ae46d";

    #[rstest]
    #[case("registry.io/path/to/repo/image:tag", "registry.io", "path/to/repo", "image", Some("tag"), None)]
    #[case("registry.io/path/to/repo/image", "registry.io", "path/to/repo", "image", Some("latest"), None)]
    #[case(
        "registry.io/path/to/repo/image@sha256:859b5aada817b3eb53410222e8fc232cf126c9e598390ae61895eb96f52ae46d",
        "registry.io",
        "path/to/repo",
        "image",
        None,
        Some(DIGEST)
    )]
    #[case("registry.io/image:tag", "registry.io", "", "image", Some("tag"), None)]
    #[case("path/to/repo/image:tag", "docker.io", "path/to/repo", "image", Some("tag"), None)]
    #[case("reg.com:12345/path/to/repo/image:tag", "reg.com:12345", "path/to/repo", "image", Some("tag"), None)]
    #[case("image:tag", "docker.io", "library", "image", Some("tag"), None)]
    #[case("sub.registry.io/path/image:tag", "sub.registry.io", "path", "image", Some("tag"), None)]
    #[case("registry:1234/repo/image:tag", "registry:1234", "repo", "image", Some("tag"), None)]
    #[case(
        "master-node:5000/k8s.gcr.io/library/kube-apiserver:v1.18.6",
        "master-node:5000",
        "k8s.gcr.io/library",
        "kube-apiserver",
        Some("v1.18.6"),
        None
    )]
    #[case("Test/test:v1", "Test", "", "test", Some("v1"), None)]
    #[case("localhost/test:v1", "localhost", "", "test", Some("v1"), None)]
    #[case("docker.io/library/image:Tag", "docker.io", "library", "image", Some("Tag"), None)]
    #[case(
        "ghcr.io/repo/test/image-with-tag-and-digest:v1.2.3@sha256:859b5aada817b3eb53410222e8fc232cf126c9e598390ae61895eb96f52ae46d",
        "ghcr.io",
        "repo/test",
        "image-with-tag-and-digest",
        Some("v1.2.3"),
        Some(DIGEST)
    )]
    fn parse_components(
        #[case] image: &str,
        #[case] registry: &str,
        #[case] repository: &str,
        #[case] name: &str,
        #[case] tag: Option<&str>,
        #[case] digest: Option<&str>,
    ) {
        let reference = ImageReference::parse(image).expect("valid reference");
        assert_eq!(reference.registry(), registry);
        assert_eq!(reference.repository(), repository);
        assert_eq!(reference.name(), name);
        assert_eq!(reference.tag(), tag);
        assert_eq!(reference.digest(), digest);
    }

    #[rstest]
    #[case("image/")]
    #[case("registry:")]
    #[case("")]
    #[case("docker.io/Library/image:tag")]
    #[case("image:-tag")]
    fn parse_rejects_malformed(#[case] image: &str) {
        assert!(matches!(
            ImageReference::parse(image),
            Err(Error::InvalidImageFormat(_))
        ));
    }

    #[rstest]
    #[case::short_sha256(format!("nginx@sha256:{}", "a".repeat(32)))]
    #[case::long_sha256(format!("nginx@sha256:{DIGEST}00"))]
    #[case::uppercase_hex(format!("nginx@sha256:{}", DIGEST.to_uppercase()))]
    #[case::sha512(format!("nginx@sha512:{}", "a".repeat(128)))]
    #[case::sha384_tagged(format!("nginx:1.25@sha384:{}", "b".repeat(96)))]
    fn parse_rejects_unsupported_digests(#[case] image: String) {
        assert!(matches!(
            ImageReference::parse(&image),
            Err(Error::InvalidImageFormat(i)) if i == image
        ));
    }

    #[test]
    fn parse_rejects_overlong_name() {
        let path = vec!["segment"; 40].join("/");
        let image = format!("registry.io/{path}/image:tag");
        assert!(image.len() > NAME_TOTAL_LENGTH_MAX);
        assert!(matches!(
            ImageReference::parse(&image),
            Err(Error::InvalidImageFormat(_))
        ));
    }

    #[rstest]
    #[case("image:tag", "docker.io/library/image:tag")]
    #[case("registry.io/image:tag", "registry.io/image:tag")]
    #[case("reg.io/path/image:tag", "reg.io/path/image:tag")]
    #[case("image", "docker.io/library/image:latest")]
    #[case("registry.io:42358/path/image:1", "registry.io:42358/path/image:1")]
    #[case("registry:12", "docker.io/library/registry:12")]
    #[case("registry.io:8080/image", "registry.io:8080/image:latest")]
    #[case(
        "image@sha256:859b5aada817b3eb53410222e8fc232cf126c9e598390ae61895eb96f52ae46d",
        "docker.io/library/image@sha256:859b5aada817b3eb53410222e8fc232cf126c9e598390ae61895eb96f52ae46d"
    )]
    #[case("path/image", "docker.io/path/image:latest")]
    fn canonical_string(#[case] image: &str, #[case] expected: &str) {
        let reference = ImageReference::parse(image).expect("valid reference");
        assert_eq!(reference.to_string(), expected);
    }

    #[rstest]
    #[case("image")]
    #[case("Test/test:v1")]
    #[case("registry.io/image:tag")]
    #[case("master-node:5000/k8s.gcr.io/library/kube-apiserver:v1.18.6")]
    #[case("ghcr.io/repo/image:v1@sha256:859b5aada817b3eb53410222e8fc232cf126c9e598390ae61895eb96f52ae46d")]
    fn canonicalization_is_idempotent(#[case] image: &str) {
        let once = ImageReference::parse(image).expect("valid reference");
        let twice = ImageReference::parse(&once.to_string()).expect("canonical form parses");
        assert_eq!(once, twice);
        assert_eq!(once.to_string(), twice.to_string());
    }

    #[test]
    fn set_digest_keeps_tag() {
        let mut reference = ImageReference::parse("image:v1").expect("valid reference");
        reference.set_digest(&format!("sha256:{DIGEST}"));
        assert_eq!(
            reference.to_string(),
            format!("docker.io/library/image:v1@sha256:{DIGEST}")
        );
        assert_eq!(reference.digest(), Some(DIGEST));
    }
}
