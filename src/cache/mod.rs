use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use derive_builder::Builder;
use serde::Serialize;
use thiserror::Error;

use crate::blob::digest::DescriptorDigest;
use crate::blob::digests::compute_json_digest;
use crate::blob::Blob;
use crate::image::config::ContainerConfigurationTemplate;
use crate::image::manifest::ManifestTemplate;
use crate::image::reference::ImageReference;
use crate::layer::entry::LayerEntry;

use reader::CacheStorageReader;
use storage::CacheStorageFiles;
use writer::CacheStorageWriter;

pub mod lock;
pub mod reader;
pub mod storage;
pub mod writer;

/// A layer as stored in the cache: the compressed blob, its digest and the
/// digest of its uncompressed contents.
#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct CachedLayer {
    digest: DescriptorDigest,
    diff_id: DescriptorDigest,
    #[builder(default = "-1")]
    size: i64,
    #[builder(setter(into))]
    blob: Arc<Blob>,
}

impl CachedLayer {
    pub fn builder() -> CachedLayerBuilder {
        CachedLayerBuilder::default()
    }

    pub fn digest(&self) -> &DescriptorDigest {
        &self.digest
    }

    pub fn diff_id(&self) -> &DescriptorDigest {
        &self.diff_id
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn blob(&self) -> &Arc<Blob> {
        &self.blob
    }
}

/// The cache holds something that can not have been written by this program:
/// it is never served.
#[derive(Debug, Error)]
#[error("{message}; you may need to clear the cache directory at {}", .cache_directory.display())]
pub struct CacheCorruptedError {
    pub cache_directory: PathBuf,
    pub message: String,
}

impl CacheCorruptedError {
    pub fn new(cache_directory: &Path, message: impl Into<String>) -> CacheCorruptedError {
        CacheCorruptedError {
            cache_directory: cache_directory.to_path_buf(),
            message: message.into(),
        }
    }
}

/// Manifest and container configuration cached for an image reference.
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    pub manifest: ManifestTemplate,
    pub config: Option<ContainerConfigurationTemplate>,
}

/// On-disk, content addressed store for layers and image metadata.
#[derive(Debug, Clone)]
pub struct Cache {
    files: CacheStorageFiles,
}

impl Cache {
    pub fn with_directory(root: &Path) -> Result<Cache> {
        std::fs::create_dir_all(root).with_context(|| format!("failed to create cache directory {}", root.display()))?;
        Ok(Cache {
            files: CacheStorageFiles::new(root),
        })
    }

    pub fn files(&self) -> &CacheStorageFiles {
        &self.files
    }

    pub fn write_compressed_layer(&self, compressed_layer: &Blob) -> Result<CachedLayer> {
        CacheStorageWriter::new(&self.files).write_compressed_layer(compressed_layer)
    }

    /// Like [`Cache::write_compressed_layer`], but refuses to keep a layer whose
    /// digest differs from the one the manifest announced.
    pub fn write_compressed_layer_checked(&self, compressed_layer: &Blob, expected_digest: &DescriptorDigest) -> Result<CachedLayer> {
        CacheStorageWriter::new(&self.files).write_compressed_layer_checked(compressed_layer, expected_digest)
    }

    pub fn write_uncompressed_layer(&self, uncompressed_layer: &Blob, selector: Option<&DescriptorDigest>) -> Result<CachedLayer> {
        CacheStorageWriter::new(&self.files).write_uncompressed_layer(uncompressed_layer, selector)
    }

    pub fn write_metadata(
        &self,
        image_reference: &ImageReference,
        manifest: &ManifestTemplate,
        config: Option<&ContainerConfigurationTemplate>,
    ) -> Result<()> {
        CacheStorageWriter::new(&self.files).write_metadata(image_reference, manifest, config)
    }

    pub fn retrieve(&self, layer_digest: &DescriptorDigest) -> Result<Option<CachedLayer>> {
        CacheStorageReader::new(&self.files).retrieve(layer_digest)
    }

    pub fn retrieve_by_diff_id(&self, diff_id: &DescriptorDigest) -> Result<Option<CachedLayer>> {
        CacheStorageReader::new(&self.files).retrieve_by_diff_id(diff_id)
    }

    pub fn select(&self, selector: &DescriptorDigest) -> Result<Option<DescriptorDigest>> {
        CacheStorageReader::new(&self.files).select(selector)
    }

    /// The cached layer a selector points at, if both are present.
    pub fn retrieve_by_selector(&self, selector: &DescriptorDigest) -> Result<Option<CachedLayer>> {
        match self.select(selector)? {
            None => Ok(None),
            Some(layer_digest) => self.retrieve(&layer_digest),
        }
    }

    pub fn retrieve_metadata(&self, image_reference: &ImageReference) -> Result<Option<ImageMetadata>> {
        CacheStorageReader::new(&self.files).retrieve_metadata(image_reference)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LayerEntrySelector<'a> {
    source_file: &'a Path,
    extraction_path: &'a str,
    permissions: u32,
    modification_time: i64,
    source_modified_millis: u128,
    source_size: u64,
}

/// Derives the selector of a set of layer entries. The selector changes when an
/// entry or the modification time or size of a source file changes, which
/// is enough to skip rebuilding layers whose inputs are untouched.
pub fn generate_selector(layer_entries: &[LayerEntry]) -> Result<DescriptorDigest> {
    let mut selectors = Vec::with_capacity(layer_entries.len());
    for entry in layer_entries {
        let metadata = entry
            .source_file()
            .metadata()
            .with_context(|| format!("can not read layer source file '{}'", entry.source_file().display()))?;
        let source_modified_millis = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|since_epoch| since_epoch.as_millis())
            .unwrap_or_default();
        selectors.push(LayerEntrySelector {
            source_file: entry.source_file(),
            extraction_path: entry.extraction_path().as_str(),
            permissions: entry.permissions(),
            modification_time: entry.modification_time(),
            source_modified_millis,
            source_size: if metadata.is_dir() { 0 } else { metadata.len() },
        });
    }
    selectors.sort_by(|left, right| {
        (left.extraction_path, left.source_file).cmp(&(right.extraction_path, right.source_file))
    });
    Ok(compute_json_digest(&selectors)?)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::blob::digests::compute_digest_of_bytes;
    use crate::layer::entry::AbsoluteUnixPath;

    #[test]
    fn cached_layer_builder_reports_missing_fields() {
        let digest = compute_digest_of_bytes(b"layer").digest().clone();
        let err = CachedLayer::builder()
            .digest(digest.clone())
            .blob(Blob::from_bytes(b"layer".to_vec()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("diff_id"));

        let layer = CachedLayer::builder()
            .digest(digest.clone())
            .diff_id(digest.clone())
            .blob(Blob::from_bytes(b"layer".to_vec()))
            .build()
            .unwrap();
        assert_eq!(layer.size(), -1);
        assert_eq!(layer.digest(), &digest);
    }

    #[test]
    fn selector_follows_inputs_not_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        fs::write(&first, "1").unwrap();
        fs::write(&second, "2").unwrap();
        let entries = vec![
            LayerEntry::new(&first, AbsoluteUnixPath::parse("/a").unwrap(), None, None).unwrap(),
            LayerEntry::new(&second, AbsoluteUnixPath::parse("/b").unwrap(), None, None).unwrap(),
        ];
        let mut reversed = entries.clone();
        reversed.reverse();
        let before = generate_selector(&entries).unwrap();
        assert_eq!(before, generate_selector(&reversed).unwrap());

        fs::write(&second, "changed size").unwrap();
        assert_ne!(before, generate_selector(&entries).unwrap());
        let changed = vec![LayerEntry::new(&first, AbsoluteUnixPath::parse("/c").unwrap(), None, None).unwrap()];
        assert_ne!(generate_selector(&entries[..1]).unwrap(), generate_selector(&changed).unwrap());
    }
}
