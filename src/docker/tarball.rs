use std::io;
use std::io::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::blob::digest::DescriptorDigest;
use crate::blob::Blob;
use crate::image::json::ImageToJsonTranslator;
use crate::image::reference::ImageReference;
use crate::image::Image;
use crate::layer::tar_stream::TarStreamBuilder;

pub const CONFIG_JSON: &str = "config.json";
pub const MANIFEST_JSON: &str = "manifest.json";
const LAYER_SUFFIX: &str = ".tar.gz";

/// One entry of the `manifest.json` read by `docker load`.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TarManifestJson {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

/// A compressed layer as it goes into the tarball.
#[derive(Debug, Clone)]
pub struct TarballLayer {
    pub diff_id: DescriptorDigest,
    pub blob: Arc<Blob>,
}

/// A tarball `docker load` understands: `<diffId>.tar.gz` per layer,
/// `config.json` and `manifest.json`.
pub struct ImageTarball {
    image: Image,
    layers: Vec<TarballLayer>,
    image_reference: ImageReference,
    tags: Vec<String>,
}

impl ImageTarball {
    /// `layers` pair up with `image.layers`. `tags` are written in addition to
    /// the tag of `image_reference`.
    pub fn new(image: Image, layers: Vec<TarballLayer>, image_reference: ImageReference, tags: Vec<String>) -> ImageTarball {
        ImageTarball {
            image,
            layers,
            image_reference,
            tags,
        }
    }

    pub fn repo_tags(&self) -> Vec<String> {
        let name = docker_name(&self.image_reference);
        let mut repo_tags = vec![format!("{}:{}", name, self.image_reference.tag().unwrap_or("latest"))];
        for tag in &self.tags {
            let repo_tag = format!("{}:{}", name, tag);
            if !repo_tags.contains(&repo_tag) {
                repo_tags.push(repo_tag);
            }
        }
        repo_tags
    }

    pub fn tar_manifest(&self) -> TarManifestJson {
        TarManifestJson {
            config: CONFIG_JSON.to_string(),
            repo_tags: self.repo_tags(),
            layers: self.layers.iter().map(|layer| layer_file_name(&layer.diff_id)).collect(),
        }
    }

    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        let mut builder = TarStreamBuilder::new();
        for layer in &self.layers {
            let name = layer_file_name(&layer.diff_id);
            match layer.blob.as_ref() {
                Blob::File(path) => builder.add_file(path.clone(), name),
                blob => {
                    let mut bytes = Vec::new();
                    blob.write_to(&mut bytes)?;
                    builder.add_bytes(bytes, name);
                }
            }
        }

        let mut config = Vec::new();
        ImageToJsonTranslator::new(&self.image).container_configuration_blob()?.write_to(&mut config)?;
        builder.add_bytes(config, CONFIG_JSON);
        builder.add_bytes(serde_json::to_vec(&vec![self.tar_manifest()])?, MANIFEST_JSON);
        builder.write_as_tar(out)
    }
}

fn layer_file_name(diff_id: &DescriptorDigest) -> String {
    format!("{}{}", diff_id.hash(), LAYER_SUFFIX)
}

/// The name docker itself would show: Docker Hub images without the
/// registry and `library/` prefix.
pub fn docker_name(image_reference: &ImageReference) -> String {
    if image_reference.is_docker_hub() {
        let repository = image_reference.repository();
        repository.strip_prefix("library/").unwrap_or(repository).to_string()
    } else {
        format!("{}/{}", image_reference.registry(), image_reference.repository())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Read;

    use super::*;
    use crate::blob::digests::compute_digest_of_bytes;
    use crate::image::ImageLayer;

    fn read_entries(tarball: &[u8]) -> BTreeMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(tarball);
        let mut entries = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).unwrap();
            entries.insert(name, contents);
        }
        entries
    }

    #[test]
    fn writes_layers_config_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let layer_path = dir.path().join("layer");
        std::fs::write(&layer_path, b"compressed").unwrap();
        let diff_id = compute_digest_of_bytes(b"uncompressed").digest().clone();

        let mut image = Image::default();
        image.layers.push(ImageLayer {
            blob_descriptor: compute_digest_of_bytes(b"compressed"),
            diff_id: diff_id.clone(),
        });
        let reference = ImageReference::parse("busybox:1.0").unwrap();
        let tarball = ImageTarball::new(
            image,
            vec![TarballLayer {
                diff_id: diff_id.clone(),
                blob: Arc::new(Blob::from_file(&layer_path)),
            }],
            reference,
            vec!["extra".to_string(), "1.0".to_string()],
        );

        let mut out = Vec::new();
        tarball.write_to(&mut out).unwrap();
        let entries = read_entries(&out);
        let layer_name = format!("{}.tar.gz", diff_id.hash());
        assert_eq!(entries.len(), 3);
        assert!(entries.contains_key(CONFIG_JSON));
        assert_eq!(entries[&layer_name], b"compressed");

        let manifest = serde_json::from_slice::<Vec<TarManifestJson>>(&entries[MANIFEST_JSON]).unwrap();
        assert_eq!(
            manifest,
            vec![TarManifestJson {
                config: "config.json".to_string(),
                repo_tags: vec!["busybox:1.0".to_string(), "busybox:extra".to_string()],
                layers: vec![layer_name],
            }]
        );
        let config = serde_json::from_slice::<serde_json::Value>(&entries[CONFIG_JSON]).unwrap();
        assert_eq!(config["rootfs"]["diff_ids"][0], diff_id.to_string());
    }

    #[test]
    fn private_registries_keep_their_host() {
        let reference = ImageReference::parse("registry.example:5000/team/app").unwrap();
        assert_eq!(docker_name(&reference), "registry.example:5000/team/app");
    }
}
