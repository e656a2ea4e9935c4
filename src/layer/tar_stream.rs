use std::fs::File;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tar::{Builder, EntryType, Header};

use crate::blob::Blob;
use crate::layer::entry::{DEFAULT_FILE_PERMISSIONS, DEFAULT_MODIFICATION_TIME};

#[derive(Clone, Debug)]
pub enum TarContents {
    Directory,
    File(PathBuf),
    Bytes(Bytes),
}

#[derive(Clone, Debug)]
pub struct TarStreamEntry {
    pub name: String,
    pub contents: TarContents,
    pub mode: u32,
    pub modification_time: i64,
}

/// Writes entries, in the order they were added, as a GNU tar stream.
/// Ownership is always zeroed.
#[derive(Default, Clone)]
pub struct TarStreamBuilder {
    entries: Vec<TarStreamEntry>,
}

impl TarStreamBuilder {
    pub fn new() -> TarStreamBuilder {
        TarStreamBuilder::default()
    }

    pub fn add_entry(&mut self, entry: TarStreamEntry) {
        self.entries.push(entry);
    }

    pub fn add_file(&mut self, file: impl Into<PathBuf>, name: impl Into<String>) {
        self.add_entry(TarStreamEntry {
            name: name.into(),
            contents: TarContents::File(file.into()),
            mode: DEFAULT_FILE_PERMISSIONS,
            modification_time: DEFAULT_MODIFICATION_TIME,
        });
    }

    pub fn add_bytes(&mut self, bytes: impl Into<Bytes>, name: impl Into<String>) {
        self.add_entry(TarStreamEntry {
            name: name.into(),
            contents: TarContents::Bytes(bytes.into()),
            mode: DEFAULT_FILE_PERMISSIONS,
            modification_time: DEFAULT_MODIFICATION_TIME,
        });
    }

    pub fn entries(&self) -> &[TarStreamEntry] {
        &self.entries
    }

    pub fn write_as_tar(&self, out: &mut dyn Write) -> io::Result<()> {
        write_entries(&self.entries, out)
    }

    /// A reusable blob of unknown size that streams the archive on each write.
    pub fn into_blob(self) -> Blob {
        let entries = Arc::new(self.entries);
        Blob::from_writable(move |out| write_entries(&entries, out), -1)
    }
}

fn write_entries(entries: &[TarStreamEntry], out: &mut dyn Write) -> io::Result<()> {
    let mut builder = Builder::new(out);
    for entry in entries {
        let mut header = Header::new_gnu();
        header.set_mode(entry.mode);
        header.set_mtime(entry.modification_time.max(0) as u64);
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("")?;
        header.set_groupname("")?;
        match &entry.contents {
            TarContents::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, format!("{}/", entry.name), io::empty())?;
            }
            TarContents::File(path) => {
                let file = File::open(path)?;
                header.set_entry_type(EntryType::Regular);
                header.set_size(file.metadata()?.len());
                builder.append_data(&mut header, &entry.name, file)?;
            }
            TarContents::Bytes(bytes) => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(bytes.len() as u64);
                builder.append_data(&mut header, &entry.name, bytes.as_ref())?;
            }
        }
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use tar::Archive;

    use super::*;

    #[test]
    fn writes_entries_in_insertion_order() {
        let mut builder = TarStreamBuilder::new();
        builder.add_bytes(b"{}".to_vec(), "config.json");
        builder.add_bytes(b"[]".to_vec(), "manifest.json");
        let mut out = Vec::new();
        builder.write_as_tar(&mut out).unwrap();

        let mut archive = Archive::new(&out[..]);
        let names = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect::<Vec<String>>();
        assert_eq!(names, vec!["config.json", "manifest.json"]);
    }

    #[test]
    fn long_names_survive() {
        let long_name = format!("{}/file", "d".repeat(150));
        let mut builder = TarStreamBuilder::new();
        builder.add_bytes(b"x".to_vec(), long_name.clone());
        let mut out = Vec::new();
        builder.write_as_tar(&mut out).unwrap();

        let mut archive = Archive::new(&out[..]);
        let mut entries = archive.entries().unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), long_name);
        assert_eq!(entry.header().uid().unwrap(), 0);
    }
}
