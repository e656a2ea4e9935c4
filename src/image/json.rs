use std::collections::BTreeMap;
use std::io;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};

use crate::blob::digest::BlobDescriptor;
use crate::blob::Blob;
use crate::image::config::{ConfigurationObjectTemplate, ContainerConfigurationTemplate, RootFilesystemObjectTemplate};
use crate::image::manifest::{ContentDescriptorTemplate, ManifestTemplate, OciManifestTemplate, V22ManifestTemplate};
use crate::image::{Image, ImageFormat, ImageLayer};

/// Turns an [`Image`] into its container configuration and manifest.
pub struct ImageToJsonTranslator<'a> {
    image: &'a Image,
}

impl<'a> ImageToJsonTranslator<'a> {
    pub fn new(image: &'a Image) -> ImageToJsonTranslator<'a> {
        ImageToJsonTranslator { image }
    }

    pub fn container_configuration(&self) -> ContainerConfigurationTemplate {
        let image = self.image;
        let as_set = |items: &std::collections::BTreeSet<String>| {
            (!items.is_empty()).then(|| items.iter().map(|item| (item.clone(), json!({}))).collect::<BTreeMap<String, Value>>())
        };
        ContainerConfigurationTemplate {
            created: image.created.clone(),
            architecture: image.architecture.clone(),
            os: image.os.clone(),
            config: ConfigurationObjectTemplate {
                env: (!image.environment.is_empty()).then(|| image.environment_entries()),
                entrypoint: image.entrypoint.clone(),
                cmd: image.cmd.clone(),
                exposed_ports: as_set(&image.exposed_ports),
                labels: (!image.labels.is_empty()).then(|| image.labels.clone()),
                working_dir: image.working_dir.clone(),
                user: image.user.clone(),
                volumes: as_set(&image.volumes),
            },
            history: image.history.clone(),
            rootfs: RootFilesystemObjectTemplate {
                diff_ids: image.layers.iter().map(|layer| layer.diff_id.clone()).collect(),
                ..Default::default()
            },
        }
    }

    pub fn container_configuration_blob(&self) -> io::Result<Blob> {
        Blob::from_json(&self.container_configuration())
    }

    /// Builds the manifest for the image's format, pointing at an already
    /// written container configuration.
    pub fn manifest_template(&self, config_descriptor: &BlobDescriptor) -> ManifestTemplate {
        let format = self.image.format;
        let config = ContentDescriptorTemplate::new(format.config_media_type(), config_descriptor);
        let layers = self
            .image
            .layers
            .iter()
            .map(|layer| ContentDescriptorTemplate::new(format.layer_media_type(), &layer.blob_descriptor))
            .collect::<Vec<ContentDescriptorTemplate>>();
        match format {
            ImageFormat::Docker => ManifestTemplate::V22(V22ManifestTemplate::new(config, layers)),
            ImageFormat::Oci => ManifestTemplate::Oci(OciManifestTemplate::new(config, layers)),
        }
    }
}

/// Rebuilds an [`Image`] from a pulled manifest and its container configuration.
pub struct JsonToImageTranslator;

impl JsonToImageTranslator {
    /// Schema 2 and OCI manifests need the configuration; its `diff_ids` pair up
    /// with the manifest layers. Schema 1 carries its configuration inline and no
    /// diff ids, so layers are left for the caller to fill in after pulling.
    pub fn to_image(manifest: &ManifestTemplate, config: Option<&ContainerConfigurationTemplate>) -> Result<Image> {
        let mut image = Image {
            format: match manifest {
                ManifestTemplate::Oci(_) => ImageFormat::Oci,
                _ => ImageFormat::Docker,
            },
            ..Default::default()
        };
        match manifest {
            ManifestTemplate::V21(v21) => {
                if let Some(compatibility) = v21.container_configuration()? {
                    apply_v1_compatibility(&mut image, &compatibility)?;
                }
            }
            ManifestTemplate::V22(_) | ManifestTemplate::Oci(_) => {
                let config = config.ok_or_else(|| anyhow!("container configuration is required for a {} manifest", manifest.manifest_type()))?;
                let layers = manifest.layers();
                if layers.len() != config.rootfs.diff_ids.len() {
                    return Err(anyhow!(
                        "layer count mismatch: manifest has {} layers but the configuration lists {} diff ids",
                        layers.len(),
                        config.rootfs.diff_ids.len()
                    ));
                }
                image.layers = layers
                    .into_iter()
                    .zip(config.rootfs.diff_ids.iter().cloned())
                    .map(|(blob_descriptor, diff_id)| ImageLayer { blob_descriptor, diff_id })
                    .collect();
                apply_configuration(&mut image, config)?;
            }
        }
        Ok(image)
    }
}

fn apply_configuration(image: &mut Image, template: &ContainerConfigurationTemplate) -> Result<()> {
    image.created = template.created.clone();
    if !template.architecture.is_empty() {
        image.architecture = template.architecture.clone();
    }
    if !template.os.is_empty() {
        image.os = template.os.clone();
    }
    image.history = template.history.clone();
    apply_configuration_object(image, &template.config)
}

fn apply_configuration_object(image: &mut Image, config: &ConfigurationObjectTemplate) -> Result<()> {
    if let Some(env) = &config.env {
        image.add_environment_entries(env)?;
    }
    image.entrypoint = config.entrypoint.clone();
    image.cmd = config.cmd.clone();
    if let Some(ports) = &config.exposed_ports {
        image.exposed_ports.extend(ports.keys().cloned());
    }
    if let Some(labels) = &config.labels {
        image.labels.extend(labels.clone());
    }
    if let Some(volumes) = &config.volumes {
        image.volumes.extend(volumes.keys().cloned());
    }
    image.working_dir = config.working_dir.clone();
    image.user = config.user.clone();
    Ok(())
}

fn apply_v1_compatibility(image: &mut Image, compatibility: &Value) -> Result<()> {
    if let Some(architecture) = compatibility.get("architecture").and_then(Value::as_str) {
        image.architecture = architecture.to_string();
    }
    if let Some(os) = compatibility.get("os").and_then(Value::as_str) {
        image.os = os.to_string();
    }
    image.created = compatibility.get("created").and_then(Value::as_str).map(str::to_string);
    if let Some(config) = compatibility.get("config").filter(|config| !config.is_null()) {
        let config = serde_json::from_value::<ConfigurationObjectTemplate>(config.clone())?;
        apply_configuration_object(image, &config)?;
    }
    Ok(())
}
