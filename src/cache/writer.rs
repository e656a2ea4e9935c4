use std::fs;
use std::fs::File;
use std::io;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::blob::digest::{BlobDescriptor, DescriptorDigest};
use crate::blob::digests::{compute_digest_of_reader, CountingDigestOutputStream};
use crate::blob::Blob;
use crate::cache::lock::LockFile;
use crate::cache::storage::{CacheStorageFiles, CONFIG_FILE_NAME, MANIFEST_FILE_NAME};
use crate::cache::{CacheCorruptedError, CachedLayer};
use crate::image::config::ContainerConfigurationTemplate;
use crate::image::manifest::ManifestTemplate;
use crate::image::reference::ImageReference;
use crate::util::compress::decompressing_reader;

/// Every write goes to a temporary file under `tmp/` first and is renamed into
/// place once complete, so readers never see a partial file.
pub struct CacheStorageWriter<'a> {
    files: &'a CacheStorageFiles,
}

impl<'a> CacheStorageWriter<'a> {
    pub fn new(files: &'a CacheStorageFiles) -> CacheStorageWriter<'a> {
        CacheStorageWriter { files }
    }

    /// Stores an already compressed layer, e.g. one pulled from a registry.
    pub fn write_compressed_layer(&self, compressed_layer: &Blob) -> Result<CachedLayer> {
        self.write_compressed(compressed_layer, None)
    }

    pub fn write_compressed_layer_checked(&self, compressed_layer: &Blob, expected_digest: &DescriptorDigest) -> Result<CachedLayer> {
        self.write_compressed(compressed_layer, Some(expected_digest))
    }

    fn write_compressed(&self, compressed_layer: &Blob, expected_digest: Option<&DescriptorDigest>) -> Result<CachedLayer> {
        let temp_file = self.new_temp_file()?;
        let descriptor = {
            let mut writer = BufWriter::new(temp_file.as_file());
            let descriptor = compressed_layer.write_to(&mut writer)?;
            writer.flush()?;
            descriptor
        };
        if let Some(expected_digest) = expected_digest {
            if descriptor.digest() != expected_digest {
                return Err(CacheCorruptedError::new(
                    self.files.root(),
                    format!(
                        "layer digest mismatch: expected {} but the written layer has digest {}",
                        expected_digest,
                        descriptor.digest()
                    ),
                )
                .into());
            }
        }

        let diff_id = {
            let mut reader = decompressing_reader(File::open(temp_file.path())?)?;
            compute_digest_of_reader(&mut reader, &mut io::sink())
                .with_context(|| format!("failed to decompress layer {}", descriptor.digest()))?
                .digest()
                .clone()
        };
        self.move_into_place(temp_file, descriptor, diff_id)
    }

    /// Gzips an uncompressed layer while writing, computing the diff id and the
    /// compressed digest in the same pass, and records the selector when given.
    pub fn write_uncompressed_layer(&self, uncompressed_layer: &Blob, selector: Option<&DescriptorDigest>) -> Result<CachedLayer> {
        let temp_file = self.new_temp_file()?;
        let (descriptor, diff_id) = {
            let compressed_stream = CountingDigestOutputStream::new(BufWriter::new(temp_file.as_file()));
            let mut encoder = GzEncoder::new(compressed_stream, Compression::default());
            let diff_id = uncompressed_layer.write_to(&mut encoder)?.digest().clone();
            let mut compressed_stream = encoder.finish()?;
            (compressed_stream.compute_digest()?, diff_id)
        };
        let cached_layer = self.move_into_place(temp_file, descriptor, diff_id)?;
        if let Some(selector) = selector {
            self.write_selector(selector, cached_layer.digest())?;
        }
        Ok(cached_layer)
    }

    pub fn write_metadata(
        &self,
        image_reference: &ImageReference,
        manifest: &ManifestTemplate,
        config: Option<&ContainerConfigurationTemplate>,
    ) -> Result<()> {
        let _lock = LockFile::lock(&self.files.lock_file())?;
        let image_directory = self.files.image_directory(image_reference);
        fs::create_dir_all(&image_directory).with_context(|| format!("failed to create {}", image_directory.display()))?;

        self.write_json(&manifest.to_json_value()?, &image_directory.join(MANIFEST_FILE_NAME))?;
        if let Some(config) = config {
            self.write_json(config, &image_directory.join(CONFIG_FILE_NAME))?;
        }
        debug!("Cached metadata of {}", image_reference);
        Ok(())
    }

    fn write_selector(&self, selector: &DescriptorDigest, layer_digest: &DescriptorDigest) -> Result<()> {
        let temp_file = self.new_temp_file()?;
        fs::write(temp_file.path(), layer_digest.hash())?;
        let selectors_directory = self.files.selectors_directory();
        fs::create_dir_all(&selectors_directory)?;
        // Selectors may be re-pointed, so this one replaces an existing file.
        temp_file
            .persist(self.files.selector_file(selector))
            .map_err(|err| anyhow!("failed to write selector {}: {}", selector, err))?;
        Ok(())
    }

    fn write_json<T: Serialize + ?Sized>(&self, value: &T, destination: &Path) -> Result<()> {
        let temp_file = self.new_temp_file()?;
        {
            let mut writer = BufWriter::new(temp_file.as_file());
            serde_json::to_writer(&mut writer, value)?;
            writer.flush()?;
        }
        temp_file
            .persist(destination)
            .map_err(|err| anyhow!("failed to write {}: {}", destination.display(), err))?;
        Ok(())
    }

    fn move_into_place(&self, temp_file: NamedTempFile, descriptor: BlobDescriptor, diff_id: DescriptorDigest) -> Result<CachedLayer> {
        let layer_file = self.files.layer_file(descriptor.digest(), &diff_id);
        if layer_file.exists() {
            debug!("Layer {} already cached", descriptor.digest().short_hash());
        } else {
            self.place_layer_directory(temp_file, descriptor.digest(), &diff_id)?;
        }
        Ok(CachedLayer::builder()
            .digest(descriptor.digest().clone())
            .diff_id(diff_id)
            .size(descriptor.size())
            .blob(Blob::from_file(layer_file))
            .build()?)
    }

    /// The whole `<digest>/<diffId>` directory is assembled under `tmp/` and
    /// renamed into `layers/` in one step. Losing a race to another writer of
    /// the same layer is not an error.
    fn place_layer_directory(&self, temp_file: NamedTempFile, layer_digest: &DescriptorDigest, diff_id: &DescriptorDigest) -> Result<()> {
        let layers_directory = self.files.layers_directory();
        fs::create_dir_all(&layers_directory).with_context(|| format!("failed to create {}", layers_directory.display()))?;
        let staging_directory = tempfile::Builder::new()
            .prefix("layer-")
            .tempdir_in(self.files.temporary_directory())
            .context("failed to create a staging directory for a layer")?;
        temp_file
            .persist(staging_directory.path().join(diff_id.hash()))
            .map_err(|err| anyhow!("failed to stage layer {}: {}", layer_digest, err))?;

        let layer_directory = self.files.layer_directory(layer_digest);
        let mut renamed = fs::rename(staging_directory.path(), &layer_directory);
        // Left behind by an interrupted writer.
        if renamed.is_err() && is_empty_directory(&layer_directory) {
            fs::remove_dir(&layer_directory).with_context(|| format!("failed to remove {}", layer_directory.display()))?;
            renamed = fs::rename(staging_directory.path(), &layer_directory);
        }
        match renamed {
            Ok(()) => Ok(()),
            Err(_) if self.files.layer_file(layer_digest, diff_id).is_file() => {
                debug!("Layer {} was cached by another writer", layer_digest.short_hash());
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("failed to move layer into {}", layer_directory.display())),
        }
    }

    fn new_temp_file(&self) -> Result<NamedTempFile> {
        let temporary_directory = self.files.temporary_directory();
        fs::create_dir_all(&temporary_directory).with_context(|| format!("failed to create {}", temporary_directory.display()))?;
        NamedTempFile::new_in(&temporary_directory).with_context(|| format!("failed to create a file in {}", temporary_directory.display()))
    }
}

fn is_empty_directory(directory: &Path) -> bool {
    fs::read_dir(directory).map(|mut entries| entries.next().is_none()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::blob::digests::compute_digest_of_bytes;
    use crate::cache::Cache;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn racing_writers_never_expose_a_partial_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::with_directory(dir.path()).unwrap();
        let compressed = gzip(b"a layer written twice at once");
        let descriptor = compute_digest_of_bytes(&compressed);
        let blob = Blob::from_bytes(compressed);
        let finished_writers = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    let layer = cache.write_compressed_layer(&blob).unwrap();
                    assert_eq!(layer.digest(), descriptor.digest());
                    finished_writers.fetch_add(1, Ordering::SeqCst);
                });
            }
            scope.spawn(|| {
                while finished_writers.load(Ordering::SeqCst) < 2 {
                    if let Some(layer) = cache.retrieve(descriptor.digest()).unwrap() {
                        assert_eq!(layer.size(), descriptor.size());
                    }
                }
            });
        });

        let layer = cache.retrieve(descriptor.digest()).unwrap().unwrap();
        assert_eq!(layer.size(), descriptor.size());
        assert_eq!(fs::read_dir(cache.files().temporary_directory()).unwrap().count(), 0);
    }

    #[test]
    fn empty_layer_directory_from_an_interrupted_write_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::with_directory(dir.path()).unwrap();
        let compressed = gzip(b"layer");
        let digest = compute_digest_of_bytes(&compressed).digest().clone();
        fs::create_dir_all(cache.files().layer_directory(&digest)).unwrap();

        let layer = cache.write_compressed_layer(&Blob::from_bytes(compressed)).unwrap();
        assert!(cache.files().layer_file(&digest, layer.diff_id()).is_file());
        assert_eq!(cache.retrieve(&digest).unwrap().unwrap().diff_id(), layer.diff_id());
    }
}
