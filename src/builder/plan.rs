use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::builder::containerizer::{Containerizer, FibContainer};
use crate::builder::steps;
use crate::credential::Credential;
use crate::image::reference::ImageReference;
use crate::image::ImageFormat;
use crate::layer::entry::LayerEntry;

/// A named application layer made of files copied from the local disk.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntriesLayer {
    name: String,
    entries: Vec<LayerEntry>,
}

impl FileEntriesLayer {
    pub fn new(name: impl Into<String>, entries: Vec<LayerEntry>) -> FileEntriesLayer {
        FileEntriesLayer { name: name.into(), entries }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> &[LayerEntry] {
        &self.entries
    }
}

/// Everything about the image to build: its base, the application layers on
/// top and the container configuration to apply.
#[derive(Debug, Clone)]
pub struct FibContainerBuilder {
    pub(crate) base_image: ImageReference,
    pub(crate) base_image_credential: Option<Credential>,
    pub(crate) layers: Vec<FileEntriesLayer>,
    pub(crate) format: ImageFormat,
    pub(crate) creation_time: DateTime<Utc>,
    pub(crate) entrypoint: Option<Vec<String>>,
    pub(crate) program_arguments: Option<Vec<String>>,
    pub(crate) environment: BTreeMap<String, String>,
    pub(crate) exposed_ports: BTreeSet<String>,
    pub(crate) labels: BTreeMap<String, String>,
    pub(crate) volumes: BTreeSet<String>,
    pub(crate) working_directory: Option<String>,
    pub(crate) user: Option<String>,
}

impl FibContainerBuilder {
    pub fn from(base_image: ImageReference) -> FibContainerBuilder {
        FibContainerBuilder {
            base_image,
            base_image_credential: None,
            layers: vec![],
            format: ImageFormat::default(),
            creation_time: DateTime::<Utc>::UNIX_EPOCH,
            entrypoint: None,
            program_arguments: None,
            environment: BTreeMap::new(),
            exposed_ports: BTreeSet::new(),
            labels: BTreeMap::new(),
            volumes: BTreeSet::new(),
            working_directory: None,
            user: None,
        }
    }

    pub fn from_scratch() -> FibContainerBuilder {
        FibContainerBuilder::from(ImageReference::scratch())
    }

    pub fn base_image(&self) -> &ImageReference {
        &self.base_image
    }

    pub fn layers(&self) -> &[FileEntriesLayer] {
        &self.layers
    }

    pub fn set_base_image_credential(mut self, credential: Option<Credential>) -> FibContainerBuilder {
        self.base_image_credential = credential;
        self
    }

    pub fn add_layer(mut self, layer: FileEntriesLayer) -> FibContainerBuilder {
        self.layers.push(layer);
        self
    }

    pub fn set_format(mut self, format: ImageFormat) -> FibContainerBuilder {
        self.format = format;
        self
    }

    /// Defaults to the unix epoch so that identical inputs give identical images.
    pub fn set_creation_time(mut self, creation_time: DateTime<Utc>) -> FibContainerBuilder {
        self.creation_time = creation_time;
        self
    }

    /// Replaces the entrypoint of the base image. The base image's command is
    /// dropped with it unless program arguments are set too.
    pub fn set_entrypoint(mut self, entrypoint: Option<Vec<String>>) -> FibContainerBuilder {
        self.entrypoint = entrypoint;
        self
    }

    pub fn set_program_arguments(mut self, program_arguments: Option<Vec<String>>) -> FibContainerBuilder {
        self.program_arguments = program_arguments;
        self
    }

    pub fn add_environment_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> FibContainerBuilder {
        self.environment.insert(name.into(), value.into());
        self
    }

    /// Accepts `8080`, `8080/tcp` or `53/udp`.
    pub fn add_exposed_port(mut self, port: &str) -> Result<FibContainerBuilder> {
        self.exposed_ports.insert(parse_port(port)?);
        Ok(self)
    }

    pub fn add_label(mut self, key: impl Into<String>, value: impl Into<String>) -> FibContainerBuilder {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn add_volume(mut self, volume: impl Into<String>) -> FibContainerBuilder {
        self.volumes.insert(volume.into());
        self
    }

    pub fn set_working_directory(mut self, working_directory: Option<String>) -> FibContainerBuilder {
        self.working_directory = working_directory;
        self
    }

    pub fn set_user(mut self, user: Option<String>) -> FibContainerBuilder {
        self.user = user;
        self
    }

    /// Builds the image and hands it to the sink picked by `containerizer`.
    pub fn containerize(&self, containerizer: &Containerizer) -> Result<FibContainer> {
        steps::containerize(self, containerizer)
    }

    pub(crate) fn creation_time_rfc3339(&self) -> String {
        self.creation_time.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

fn parse_port(port: &str) -> Result<String> {
    let (number, protocol) = port.split_once('/').unwrap_or((port, "tcp"));
    let protocol = protocol.to_lowercase();
    if protocol != "tcp" && protocol != "udp" {
        return Err(anyhow!("invalid port '{}': protocol must be tcp or udp", port));
    }
    match number.parse::<u16>() {
        Ok(number) if number > 0 => Ok(format!("{}/{}", number, protocol)),
        _ => Err(anyhow!("invalid port '{}': must be a number between 1 and 65535", port)),
    }
}
