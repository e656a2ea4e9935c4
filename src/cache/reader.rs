use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::blob::digest::DescriptorDigest;
use crate::blob::Blob;
use crate::cache::storage::{CacheStorageFiles, CONFIG_FILE_NAME, MANIFEST_FILE_NAME};
use crate::cache::{CacheCorruptedError, CachedLayer, ImageMetadata};
use crate::image::config::ContainerConfigurationTemplate;
use crate::image::manifest::ManifestTemplate;
use crate::image::reference::ImageReference;

pub struct CacheStorageReader<'a> {
    files: &'a CacheStorageFiles,
}

impl<'a> CacheStorageReader<'a> {
    pub fn new(files: &'a CacheStorageFiles) -> CacheStorageReader<'a> {
        CacheStorageReader { files }
    }

    /// A layer directory must hold exactly one file, named by the diff id. An
    /// empty one is what an interrupted writer leaves behind and counts as a miss.
    pub fn retrieve(&self, layer_digest: &DescriptorDigest) -> Result<Option<CachedLayer>> {
        let layer_directory = self.files.layer_directory(layer_digest);
        let layer_files = match list_directory(&layer_directory)? {
            None => return Ok(None),
            Some(layer_files) if layer_files.is_empty() => return Ok(None),
            Some(layer_files) => layer_files,
        };
        if layer_files.len() != 1 {
            return Err(CacheCorruptedError::new(
                self.files.root(),
                format!(
                    "expected exactly one layer file for layer {} but found {}",
                    layer_digest,
                    layer_files.len()
                ),
            )
            .into());
        }
        let layer_file = &layer_files[0];
        let diff_id = CacheStorageFiles::digest_from_filename(layer_file).map_err(|err| {
            CacheCorruptedError::new(self.files.root(), format!("unexpected layer file {}: {}", layer_file.display(), err))
        })?;
        let size = layer_file.metadata()?.len() as i64;
        Ok(Some(
            CachedLayer::builder()
                .digest(layer_digest.clone())
                .diff_id(diff_id)
                .size(size)
                .blob(Blob::from_file(layer_file))
                .build()?,
        ))
    }

    pub fn retrieve_by_diff_id(&self, diff_id: &DescriptorDigest) -> Result<Option<CachedLayer>> {
        let layer_directories = match list_directory(&self.files.layers_directory())? {
            None => return Ok(None),
            Some(layer_directories) => layer_directories,
        };
        for layer_directory in layer_directories {
            if layer_directory.join(diff_id.hash()).is_file() {
                let layer_digest = CacheStorageFiles::digest_from_filename(&layer_directory)?;
                return self.retrieve(&layer_digest);
            }
        }
        Ok(None)
    }

    /// The layer digest a selector points at.
    pub fn select(&self, selector: &DescriptorDigest) -> Result<Option<DescriptorDigest>> {
        let selector_file = self.files.selector_file(selector);
        let contents = match fs::read_to_string(&selector_file) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("failed to read {}", selector_file.display())),
        };
        let layer_digest = DescriptorDigest::from_hash(contents.trim()).map_err(|err| {
            CacheCorruptedError::new(self.files.root(), format!("selector file {} is invalid: {}", selector_file.display(), err))
        })?;
        Ok(Some(layer_digest))
    }

    /// Schema 2 and OCI manifests are only served together with their
    /// container configuration.
    pub fn retrieve_metadata(&self, image_reference: &ImageReference) -> Result<Option<ImageMetadata>> {
        let image_directory = self.files.image_directory(image_reference);
        let manifest_bytes = match fs::read(image_directory.join(MANIFEST_FILE_NAME)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("failed to read cached manifest of {}", image_reference)),
        };
        let manifest = ManifestTemplate::from_json(None, &manifest_bytes)
            .map_err(|err| CacheCorruptedError::new(self.files.root(), format!("cached manifest of {} is invalid: {}", image_reference, err)))?;
        if let ManifestTemplate::V21(_) = manifest {
            return Ok(Some(ImageMetadata { manifest, config: None }));
        }

        let config_bytes = match fs::read(image_directory.join(CONFIG_FILE_NAME)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CacheCorruptedError::new(
                    self.files.root(),
                    format!("cached manifest of {} has no container configuration", image_reference),
                )
                .into())
            }
            Err(err) => return Err(err).with_context(|| format!("failed to read cached configuration of {}", image_reference)),
        };
        let config = serde_json::from_slice::<ContainerConfigurationTemplate>(&config_bytes).map_err(|err| {
            CacheCorruptedError::new(self.files.root(), format!("cached configuration of {} is invalid: {}", image_reference, err))
        })?;
        Ok(Some(ImageMetadata {
            manifest,
            config: Some(config),
        }))
    }
}

fn list_directory(directory: &Path) -> Result<Option<Vec<PathBuf>>> {
    let read_dir = match fs::read_dir(directory) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to list {}", directory.display())),
    };
    let mut paths = read_dir.map(|entry| entry.map(|entry| entry.path())).collect::<Result<Vec<PathBuf>, _>>()?;
    paths.sort();
    Ok(Some(paths))
}
