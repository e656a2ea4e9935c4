use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};

use crate::blob::digest::{BlobDescriptor, DescriptorDigest};

pub mod config;
pub mod json;
pub mod manifest;
pub mod reference;

#[derive(Debug)]
pub struct RegContentType(pub &'static str);

impl RegContentType {
    /// Docker content-type
    pub const DOCKER_MANIFEST_V1: Self = Self("application/vnd.docker.distribution.manifest.v1+json");
    pub const DOCKER_MANIFEST_V1_SIGNED: Self = Self("application/vnd.docker.distribution.manifest.v1+prettyjws");
    pub const DOCKER_MANIFEST: Self = Self("application/vnd.docker.distribution.manifest.v2+json");
    pub const DOCKER_MANIFEST_LIST: Self = Self("application/vnd.docker.distribution.manifest.list.v2+json");
    pub const DOCKER_LAYER_TGZ: Self = Self("application/vnd.docker.image.rootfs.diff.tar.gzip");
    pub const DOCKER_CONTAINER_IMAGE: Self = Self("application/vnd.docker.container.image.v1+json");

    /// OCI content-type
    pub const OCI_INDEX: Self = Self("application/vnd.oci.image.index.v1+json");
    pub const OCI_MANIFEST: Self = Self("application/vnd.oci.image.manifest.v1+json");
    pub const OCI_LAYER_TGZ: Self = Self("application/vnd.oci.image.layer.v1.tar+gzip");
    pub const OCI_IMAGE_CONFIG: Self = Self("application/vnd.oci.image.config.v1+json");

    pub fn val(&self) -> &'static str {
        self.0
    }
}

/// Manifest flavour written for the target image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageFormat {
    #[default]
    Docker,
    #[serde(rename = "OCI", alias = "Oci")]
    Oci,
}

impl ImageFormat {
    pub fn manifest_media_type(&self) -> &'static str {
        match self {
            ImageFormat::Docker => RegContentType::DOCKER_MANIFEST.val(),
            ImageFormat::Oci => RegContentType::OCI_MANIFEST.val(),
        }
    }

    pub fn config_media_type(&self) -> &'static str {
        match self {
            ImageFormat::Docker => RegContentType::DOCKER_CONTAINER_IMAGE.val(),
            ImageFormat::Oci => RegContentType::OCI_IMAGE_CONFIG.val(),
        }
    }

    pub fn layer_media_type(&self) -> &'static str {
        match self {
            ImageFormat::Docker => RegContentType::DOCKER_LAYER_TGZ.val(),
            ImageFormat::Oci => RegContentType::OCI_LAYER_TGZ.val(),
        }
    }
}

impl Display for ImageFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ImageFormat::Docker => "Docker",
            ImageFormat::Oci => "OCI",
        })
    }
}

impl FromStr for ImageFormat {
    type Err = Error;

    fn from_str(format: &str) -> Result<Self, Self::Err> {
        match format.to_ascii_lowercase().as_str() {
            "docker" => Ok(ImageFormat::Docker),
            "oci" => Ok(ImageFormat::Oci),
            _ => Err(anyhow!("unknown image format: {}", format)),
        }
    }
}

/// A layer as referenced by an image: the compressed blob plus its diff id.
#[derive(Debug, Clone)]
pub struct ImageLayer {
    pub blob_descriptor: BlobDescriptor,
    pub diff_id: DescriptorDigest,
}

impl ImageLayer {
    pub fn digest(&self) -> &DescriptorDigest {
        self.blob_descriptor.digest()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(rename = "created_by", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(rename = "empty_layer", skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

impl HistoryEntry {
    pub fn has_corresponding_layer(&self) -> bool {
        !self.empty_layer.unwrap_or(false)
    }
}

/// In-memory image, independent of the manifest format it came from or goes to.
#[derive(Debug, Clone)]
pub struct Image {
    pub format: ImageFormat,
    pub created: Option<String>,
    pub architecture: String,
    pub os: String,
    pub layers: Vec<ImageLayer>,
    pub history: Vec<HistoryEntry>,
    pub environment: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub exposed_ports: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
    pub volumes: BTreeSet<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
}

impl Default for Image {
    fn default() -> Self {
        Image {
            format: ImageFormat::default(),
            created: None,
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            layers: vec![],
            history: vec![],
            environment: BTreeMap::new(),
            entrypoint: None,
            cmd: None,
            exposed_ports: BTreeSet::new(),
            labels: BTreeMap::new(),
            volumes: BTreeSet::new(),
            working_dir: None,
            user: None,
        }
    }
}

impl Image {
    /// Adds the variables in `KEY=value` form; a later value replaces an earlier one.
    pub fn add_environment_entries<'a>(&mut self, entries: impl IntoIterator<Item = &'a String>) -> anyhow::Result<()> {
        for entry in entries {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("environment entry '{}' is not in KEY=value form", entry))?;
            self.environment.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    pub fn environment_entries(&self) -> Vec<String> {
        self.environment.iter().map(|(key, value)| format!("{}={}", key, value)).collect()
    }
}
