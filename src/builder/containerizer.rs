use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use home::home_dir;

use crate::blob::digest::DescriptorDigest;
use crate::credential::Credential;
use crate::docker::DockerClient;
use crate::event::EventHandlers;
use crate::image::reference::ImageReference;

pub const DEFAULT_TOOL_NAME: &str = "fibpack";
pub const DEFAULT_CONNECTION_TIMEOUT_SECONDS: u64 = 20;

/// Where the built image goes.
#[derive(Debug, Clone)]
pub enum ImageTarget {
    Registry { credential: Option<Credential> },
    DockerDaemon { client: DockerClient },
    Tar { path: PathBuf },
}

impl Display for ImageTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageTarget::Registry { .. } => write!(f, "registry"),
            ImageTarget::DockerDaemon { .. } => write!(f, "Docker daemon"),
            ImageTarget::Tar { path } => write!(f, "tar file {}", path.display()),
        }
    }
}

/// The result of a build.
#[derive(Debug, Clone, PartialEq)]
pub struct FibContainer {
    /// Digest of the image manifest.
    pub image_digest: DescriptorDigest,
    /// Digest of the container configuration.
    pub image_id: DescriptorDigest,
    pub target_image: ImageReference,
    pub tags: BTreeSet<String>,
}

/// Picks the sink for an image together with the options of the build.
#[derive(Debug, Clone)]
pub struct Containerizer {
    pub(crate) target_image: ImageReference,
    pub(crate) target: ImageTarget,
    pub(crate) additional_tags: BTreeSet<String>,
    pub(crate) base_image_layers_cache: Option<PathBuf>,
    pub(crate) application_layers_cache: Option<PathBuf>,
    pub(crate) offline: bool,
    pub(crate) allow_insecure_registries: bool,
    pub(crate) tool_name: String,
    pub(crate) connection_timeout_seconds: Option<u64>,
    pub(crate) event_handlers: EventHandlers,
    pub(crate) credential_helper_directory: Option<PathBuf>,
    pub(crate) credential_helper: Option<PathBuf>,
}

impl Containerizer {
    pub fn to_registry(target_image: ImageReference, credential: Option<Credential>) -> Containerizer {
        Containerizer::new(target_image, ImageTarget::Registry { credential })
    }

    pub fn to_docker_daemon(target_image: ImageReference, client: DockerClient) -> Containerizer {
        Containerizer::new(target_image, ImageTarget::DockerDaemon { client })
    }

    pub fn to_tar(target_image: ImageReference, path: impl Into<PathBuf>) -> Containerizer {
        Containerizer::new(target_image, ImageTarget::Tar { path: path.into() })
    }

    fn new(target_image: ImageReference, target: ImageTarget) -> Containerizer {
        Containerizer {
            target_image,
            target,
            additional_tags: BTreeSet::new(),
            base_image_layers_cache: None,
            application_layers_cache: None,
            offline: false,
            allow_insecure_registries: false,
            tool_name: DEFAULT_TOOL_NAME.to_string(),
            connection_timeout_seconds: Some(DEFAULT_CONNECTION_TIMEOUT_SECONDS),
            event_handlers: EventHandlers::none(),
            credential_helper_directory: None,
            credential_helper: None,
        }
    }

    pub fn target_image(&self) -> &ImageReference {
        &self.target_image
    }

    pub fn target(&self) -> &ImageTarget {
        &self.target
    }

    pub fn with_additional_tag(mut self, tag: impl Into<String>) -> Result<Containerizer> {
        let tag = tag.into();
        // Validated the same way as a tag inside a reference.
        self.target_image.with_tag(&tag)?;
        self.additional_tags.insert(tag);
        Ok(self)
    }

    pub fn set_base_image_layers_cache(mut self, directory: impl Into<PathBuf>) -> Containerizer {
        self.base_image_layers_cache = Some(directory.into());
        self
    }

    /// Without one, application layers are cached in a temporary directory
    /// that lives as long as the build.
    pub fn set_application_layers_cache(mut self, directory: impl Into<PathBuf>) -> Containerizer {
        self.application_layers_cache = Some(directory.into());
        self
    }

    pub fn set_offline_mode(mut self, offline: bool) -> Result<Containerizer> {
        if offline && matches!(self.target, ImageTarget::Registry { .. }) {
            return Err(anyhow!("cannot build to a container registry in offline mode"));
        }
        self.offline = offline;
        Ok(self)
    }

    pub fn set_allow_insecure_registries(mut self, allow_insecure_registries: bool) -> Containerizer {
        self.allow_insecure_registries = allow_insecure_registries;
        self
    }

    pub fn set_tool_name(mut self, tool_name: impl Into<String>) -> Containerizer {
        self.tool_name = tool_name.into();
        self
    }

    pub fn set_connection_timeout_seconds(mut self, seconds: Option<u64>) -> Containerizer {
        self.connection_timeout_seconds = seconds;
        self
    }

    pub fn set_event_handlers(mut self, event_handlers: EventHandlers) -> Containerizer {
        self.event_handlers = event_handlers;
        self
    }

    /// Directory searched for `docker-credential-*` helpers instead of `PATH`.
    pub fn set_credential_helper_directory(mut self, directory: impl Into<PathBuf>) -> Containerizer {
        self.credential_helper_directory = Some(directory.into());
        self
    }

    /// A `docker-credential-*` executable asked for both the base and the
    /// target image before any inferred helper. A bare name is looked up on `PATH`.
    pub fn set_credential_helper(mut self, helper: impl Into<PathBuf>) -> Containerizer {
        self.credential_helper = Some(helper.into());
        self
    }

    /// The target tag followed by the additional tags.
    pub fn all_tags(&self) -> BTreeSet<String> {
        let mut tags = self.additional_tags.clone();
        tags.insert(self.target_image.tag().unwrap_or(crate::image::reference::DEFAULT_TAG).to_string());
        tags
    }

    pub(crate) fn base_image_layers_cache_directory(&self) -> Result<PathBuf> {
        match &self.base_image_layers_cache {
            Some(directory) => Ok(directory.clone()),
            None => default_cache_directory(),
        }
    }

    pub(crate) fn application_layers_cache_directory(&self) -> Option<&Path> {
        self.application_layers_cache.as_deref()
    }
}

/// `~/.fibpack/cache`
pub fn default_cache_directory() -> Result<PathBuf> {
    home_dir()
        .map(|home| home.join(".fibpack").join("cache"))
        .ok_or_else(|| anyhow!("can not find the home directory, set a cache directory explicitly"))
}
