use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, Error, Result};
use regex::Regex;

use crate::blob::digest::DescriptorDigest;

pub const DOCKER_IO_HOST: &str = "docker.io";
pub const DEFAULT_IMAGE_HOST: &str = "registry-1.docker.io";
pub const DEFAULT_TAG: &str = "latest";
const LIBRARY_NAMESPACE: &str = "library";
const SCRATCH: &str = "scratch";

const REPOSITORY_COMPONENT: &str = "[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*";
const TAG_PATTERN: &str = r"^[\w][\w.-]{0,127}$";

/// A parsed `registry/repository[:tag][@digest]` string.
///
/// Docker Hub short names are expanded: `busybox` becomes
/// `registry-1.docker.io/library/busybox:latest`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<DescriptorDigest>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<ImageReference> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(anyhow!("image reference is empty"));
        }
        if reference == SCRATCH {
            return Ok(ImageReference::scratch());
        }

        let (name_and_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => (
                name,
                Some(DescriptorDigest::from_digest(digest).map_err(|err| anyhow!("invalid image reference '{}': {}", reference, err))?),
            ),
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; a colon before it is a registry port.
        let last_slash = name_and_tag.rfind('/').map(|index| index + 1).unwrap_or(0);
        let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&name_and_tag[..colon], Some(name_and_tag[colon + 1..].to_string()))
            }
            None => (name_and_tag, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_IO_HOST.to_string(), name.to_string()),
        };

        ImageReference::of(&registry, &repository, tag.as_deref(), digest)
            .map_err(|err| anyhow!("invalid image reference '{}': {}", reference, err))
    }

    /// Builds a reference from its parts, applying Docker Hub defaults.
    pub fn of(registry: &str, repository: &str, tag: Option<&str>, digest: Option<DescriptorDigest>) -> Result<ImageReference> {
        let registry = match registry {
            "" | DOCKER_IO_HOST | "index.docker.io" => DEFAULT_IMAGE_HOST.to_string(),
            registry => registry.to_string(),
        };
        let repository = if registry == DEFAULT_IMAGE_HOST && !repository.contains('/') {
            format!("{}/{}", LIBRARY_NAMESPACE, repository)
        } else {
            repository.to_string()
        };

        let component = Regex::new(&format!("^{}$", REPOSITORY_COMPONENT))?;
        if repository.is_empty() || !repository.split('/').all(|part| component.is_match(part)) {
            return Err(anyhow!("'{}' is not a valid repository name", repository));
        }
        if let Some(tag) = tag {
            if !Regex::new(TAG_PATTERN)?.is_match(tag) {
                return Err(anyhow!("'{}' is not a valid tag", tag));
            }
        }
        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_TAG.to_string()),
        };
        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn scratch() -> ImageReference {
        ImageReference {
            registry: String::new(),
            repository: SCRATCH.to_string(),
            tag: None,
            digest: None,
        }
    }

    pub fn is_scratch(&self) -> bool {
        self.registry.is_empty() && self.repository == SCRATCH
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&DescriptorDigest> {
        self.digest.as_ref()
    }

    pub fn is_docker_hub(&self) -> bool {
        self.registry == DEFAULT_IMAGE_HOST
    }

    /// What goes after `/manifests/`: the digest when pinned, otherwise the tag.
    pub fn qualifier(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    pub fn with_tag(&self, tag: &str) -> Result<ImageReference> {
        ImageReference::of(&self.registry, &self.repository, Some(tag), None)
    }

    /// `registry/repository:tag` with the qualifier always present.
    pub fn to_string_with_qualified_tag(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => format!("{}/{}@{}", self.registry, self.repository, digest),
            (None, tag) => format!("{}/{}:{}", self.registry, self.repository, tag.as_deref().unwrap_or(DEFAULT_TAG)),
        }
    }
}

impl Display for ImageReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_scratch() {
            return f.write_str(SCRATCH);
        }
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(reference: &str) -> Result<Self, Self::Err> {
        ImageReference::parse(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_hub_defaults() {
        let reference = ImageReference::parse("busybox").unwrap();
        assert_eq!(reference.registry(), DEFAULT_IMAGE_HOST);
        assert_eq!(reference.repository(), "library/busybox");
        assert_eq!(reference.tag(), Some("latest"));
        assert_eq!(reference.to_string(), "registry-1.docker.io/library/busybox:latest");

        let reference = ImageReference::parse("docker.io/someone/app:1.0").unwrap();
        assert_eq!(reference.repository(), "someone/app");
        assert_eq!(reference.qualifier(), "1.0");
    }

    #[test]
    fn registry_with_port_and_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let reference = ImageReference::parse(&format!("localhost:5000/team/app@{}", digest)).unwrap();
        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.repository(), "team/app");
        assert_eq!(reference.tag(), None);
        assert_eq!(reference.qualifier(), digest);

        let reference = ImageReference::parse("registry.example/repo:tag").unwrap();
        assert_eq!(reference.registry(), "registry.example");
        assert_eq!(reference.tag(), Some("tag"));
        assert!(!reference.is_docker_hub());
    }

    #[test]
    fn with_tag_returns_a_modified_copy() {
        let reference = ImageReference::parse("registry.example/repo:one").unwrap();
        let retagged = reference.with_tag("two").unwrap();
        assert_eq!(reference.tag(), Some("one"));
        assert_eq!(retagged.to_string(), "registry.example/repo:two");
        assert!(reference.with_tag("bad tag").is_err());
    }

    #[test]
    fn rejects_malformed_references() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("Upper/Case").is_err());
        assert!(ImageReference::parse("repo@sha256:short").is_err());
        assert!(ImageReference::parse("scratch").unwrap().is_scratch());
    }
}
