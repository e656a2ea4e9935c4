use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use log::debug;

use crate::blob::Blob;
use crate::layer::entry::{AbsoluteUnixPath, LayerEntry, DEFAULT_FOLDER_PERMISSIONS, DEFAULT_MODIFICATION_TIME};
use crate::layer::tar_stream::{TarContents, TarStreamBuilder, TarStreamEntry};

struct PendingEntry {
    entry: TarStreamEntry,
    synthesized: bool,
}

/// Builds a layer tar whose bytes depend only on the logical entries: paths are
/// sorted, parent directories are synthesized with fixed metadata and ownership
/// is zeroed.
pub struct ReproducibleLayerBuilder {
    layer_entries: Vec<LayerEntry>,
}

impl ReproducibleLayerBuilder {
    pub fn new(layer_entries: Vec<LayerEntry>) -> ReproducibleLayerBuilder {
        ReproducibleLayerBuilder { layer_entries }
    }

    /// Returns the uncompressed layer as a blob of unknown size.
    pub fn build(&self) -> Result<Blob> {
        Ok(self.tar_stream_builder()?.into_blob())
    }

    pub fn tar_stream_builder(&self) -> Result<TarStreamBuilder> {
        let mut pending = BTreeMap::<AbsoluteUnixPath, PendingEntry>::new();
        for layer_entry in &self.layer_entries {
            let path = layer_entry.extraction_path();
            if path.is_root() {
                debug!("Skipping layer entry for '/' from {}", layer_entry.source_file().display());
                continue;
            }
            add_parent_directories(&mut pending, path);

            let metadata = layer_entry.source_file().metadata().map_err(|err| {
                anyhow!("can not read layer source file '{}': {}", layer_entry.source_file().display(), err)
            })?;
            let contents = if metadata.is_dir() {
                TarContents::Directory
            } else {
                TarContents::File(layer_entry.source_file().to_path_buf())
            };
            let explicit = PendingEntry {
                entry: TarStreamEntry {
                    name: path.tar_name().to_string(),
                    contents,
                    mode: layer_entry.permissions(),
                    modification_time: layer_entry.modification_time(),
                },
                synthesized: false,
            };
            match pending.get(path) {
                Some(existing) if !existing.synthesized => {
                    debug!("Duplicate layer entry for {}, keeping the first one", path);
                }
                _ => {
                    pending.insert(path.clone(), explicit);
                }
            }
        }

        let mut builder = TarStreamBuilder::new();
        // BTreeMap iteration is the lexicographic order of extraction paths.
        for (_, pending_entry) in pending {
            builder.add_entry(pending_entry.entry);
        }
        Ok(builder)
    }
}

fn add_parent_directories(pending: &mut BTreeMap<AbsoluteUnixPath, PendingEntry>, path: &AbsoluteUnixPath) {
    let mut parent = path.parent();
    while let Some(directory) = parent {
        if directory.is_root() {
            break;
        }
        parent = directory.parent();
        if pending.contains_key(&directory) {
            continue;
        }
        let entry = TarStreamEntry {
            name: directory.tar_name().to_string(),
            contents: TarContents::Directory,
            mode: DEFAULT_FOLDER_PERMISSIONS,
            modification_time: DEFAULT_MODIFICATION_TIME,
        };
        pending.insert(directory, PendingEntry { entry, synthesized: true });
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Read;
    use std::path::Path;

    use tar::Archive;

    use super::*;
    use crate::blob::digest::BlobDescriptor;

    fn entry(source: &Path, extraction: &str, mtime: Option<i64>) -> LayerEntry {
        LayerEntry::new(source, AbsoluteUnixPath::parse(extraction).unwrap(), None, mtime).unwrap()
    }

    fn build(entries: Vec<LayerEntry>) -> (Vec<u8>, BlobDescriptor) {
        let blob = ReproducibleLayerBuilder::new(entries).build().unwrap();
        let mut out = Vec::new();
        let descriptor = blob.write_to(&mut out).unwrap();
        (out, descriptor)
    }

    struct ArchivedEntry {
        name: String,
        mode: u32,
        mtime: u64,
        is_dir: bool,
        contents: String,
    }

    fn read_archive(tar: &[u8]) -> Vec<ArchivedEntry> {
        let mut archive = Archive::new(tar);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let header = entry.header().clone();
                let mut contents = String::new();
                entry.read_to_string(&mut contents).unwrap();
                ArchivedEntry {
                    name: entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string(),
                    mode: header.mode().unwrap(),
                    mtime: header.mtime().unwrap(),
                    is_dir: header.entry_type().is_dir(),
                    contents,
                }
            })
            .collect()
    }

    #[test]
    fn sorts_entries_and_synthesizes_parents() {
        let dir = tempfile::tempdir().unwrap();
        let file_a = dir.path().join("a");
        let file_b = dir.path().join("b");
        fs::write(&file_a, "A").unwrap();
        fs::write(&file_b, "B").unwrap();

        let (tar, _) = build(vec![entry(&file_b, "/app/z/b", Some(100)), entry(&file_a, "/app/a", None)]);
        let entries = read_archive(&tar);
        let names = entries.iter().map(|entry| entry.name.as_str()).collect::<Vec<&str>>();
        assert_eq!(names, vec!["app", "app/a", "app/z", "app/z/b"]);

        let app = &entries[0];
        assert!(app.is_dir);
        assert_eq!(app.mode, DEFAULT_FOLDER_PERMISSIONS);
        assert_eq!(app.mtime, DEFAULT_MODIFICATION_TIME as u64);
        assert_eq!(entries[1].contents, "A");
        assert_eq!(entries[3].mtime, 100);
    }

    #[test]
    fn same_entries_in_any_order_build_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for name in ["one", "two", "three"] {
            let path = dir.path().join(name);
            fs::write(&path, name).unwrap();
            files.push(path);
        }
        let forward = vec![
            entry(&files[0], "/x/one", None),
            entry(&files[1], "/x/y/two", None),
            entry(&files[2], "/three", None),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        let (tar_forward, digest_forward) = build(forward);
        let (tar_backward, digest_backward) = build(backward);
        assert_eq!(tar_forward, tar_backward);
        assert_eq!(digest_forward, digest_backward);
    }

    #[test]
    fn file_system_mtime_does_not_matter_but_content_does() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, "v1").unwrap();
        let (_, first) = build(vec![entry(&path, "/f", None)]);

        // Rewriting the same bytes bumps the file system mtime only.
        fs::write(&path, "v1").unwrap();
        let (_, second) = build(vec![entry(&path, "/f", None)]);
        assert_eq!(first, second);

        fs::write(&path, "v2").unwrap();
        let (_, third) = build(vec![entry(&path, "/f", None)]);
        assert_ne!(first, third);
    }

    #[test]
    fn explicit_entry_overrides_synthesized_parent_in_any_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, "f").unwrap();
        let folder = dir.path().join("folder");
        fs::create_dir(&folder).unwrap();

        let explicit_dir = LayerEntry::new(&folder, AbsoluteUnixPath::parse("/app").unwrap(), Some(0o700), Some(5)).unwrap();
        for entries in [
            vec![entry(&file, "/app/file", None), explicit_dir.clone()],
            vec![explicit_dir.clone(), entry(&file, "/app/file", None)],
        ] {
            let (tar, _) = build(entries);
            let archived = read_archive(&tar);
            assert_eq!(archived[0].name, "app");
            assert_eq!(archived[0].mode, 0o700);
            assert_eq!(archived[0].mtime, 5);
        }
    }

    #[test]
    fn first_explicit_duplicate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        fs::write(&first, "first").unwrap();
        fs::write(&second, "second").unwrap();

        let (tar, _) = build(vec![entry(&first, "/dup", None), entry(&second, "/dup", None)]);
        let archived = read_archive(&tar);
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].contents, "first");
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = entry(&dir.path().join("missing"), "/missing", None);
        assert!(ReproducibleLayerBuilder::new(vec![missing]).build().is_err());
    }
}
