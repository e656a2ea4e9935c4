use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::blob::digest::DescriptorDigest;
use crate::image::reference::ImageReference;

const LAYERS_DIRECTORY: &str = "layers";
const SELECTORS_DIRECTORY: &str = "selectors";
const IMAGES_DIRECTORY: &str = "images";
const TEMPORARY_DIRECTORY: &str = "tmp";
const LOCK_FILE: &str = "lock";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Resolves every path of the cache layout below one root:
///
/// ```text
/// layers/<digest hex>/<diff id hex>
/// selectors/<selector hex>
/// images/<registry>/<repository>!<tag>/{manifest.json,config.json}
/// tmp/
/// ```
#[derive(Debug, Clone)]
pub struct CacheStorageFiles {
    root: PathBuf,
}

impl CacheStorageFiles {
    pub fn new(root: impl Into<PathBuf>) -> CacheStorageFiles {
        CacheStorageFiles { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layers_directory(&self) -> PathBuf {
        self.root.join(LAYERS_DIRECTORY)
    }

    pub fn layer_directory(&self, layer_digest: &DescriptorDigest) -> PathBuf {
        self.layers_directory().join(layer_digest.hash())
    }

    pub fn layer_file(&self, layer_digest: &DescriptorDigest, diff_id: &DescriptorDigest) -> PathBuf {
        self.layer_directory(layer_digest).join(diff_id.hash())
    }

    pub fn selectors_directory(&self) -> PathBuf {
        self.root.join(SELECTORS_DIRECTORY)
    }

    pub fn selector_file(&self, selector: &DescriptorDigest) -> PathBuf {
        self.selectors_directory().join(selector.hash())
    }

    pub fn images_directory(&self) -> PathBuf {
        self.root.join(IMAGES_DIRECTORY)
    }

    /// `:` is not file system safe, so both the registry port separator and the
    /// tag separator become `!`.
    pub fn image_directory(&self, image_reference: &ImageReference) -> PathBuf {
        let qualified = image_reference.to_string_with_qualified_tag().replace(':', "!");
        self.images_directory().join(qualified)
    }

    pub fn temporary_directory(&self) -> PathBuf {
        self.root.join(TEMPORARY_DIRECTORY)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Parses a file name of the layout back into a digest.
    pub fn digest_from_filename(path: &Path) -> Result<DescriptorDigest> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("cache file name is not valid: {}", path.display()))?;
        DescriptorDigest::from_hash(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::digests::compute_digest_of_bytes;

    #[test]
    fn layout_matches_the_documented_paths() {
        let files = CacheStorageFiles::new("/cache");
        let digest = compute_digest_of_bytes(b"a").digest().clone();
        let diff_id = compute_digest_of_bytes(b"b").digest().clone();

        assert_eq!(
            files.layer_file(&digest, &diff_id),
            PathBuf::from(format!("/cache/layers/{}/{}", digest.hash(), diff_id.hash()))
        );
        assert_eq!(files.selector_file(&digest), PathBuf::from(format!("/cache/selectors/{}", digest.hash())));
        assert_eq!(CacheStorageFiles::digest_from_filename(&files.layer_file(&digest, &diff_id)).unwrap(), diff_id);
    }

    #[test]
    fn image_directory_escapes_colons() {
        let files = CacheStorageFiles::new("/cache");
        let reference = ImageReference::parse("localhost:5000/team/app:1.0").unwrap();
        assert_eq!(files.image_directory(&reference), PathBuf::from("/cache/images/localhost!5000/team/app!1.0"));
    }
}
