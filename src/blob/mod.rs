use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::io;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::Bytes;

use crate::blob::digest::BlobDescriptor;
use crate::blob::digests::{compute_digest, compute_digest_of_reader};

pub mod digest;
pub mod digests;

type WriteContents = dyn Fn(&mut dyn Write) -> io::Result<()> + Send + Sync;

/// A source of bytes with a known or unknown (`-1`) length.
///
/// Writing a blob always yields the descriptor of what was written.
pub enum Blob {
    Bytes(Bytes),
    File(PathBuf),
    /// Can be written exactly once.
    Stream {
        reader: Mutex<Option<Box<dyn Read + Send>>>,
        size: i64,
    },
    Json(serde_json::Value),
    Writable {
        contents: Box<WriteContents>,
        size: i64,
    },
}

impl Blob {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Blob {
        Blob::Bytes(bytes.into())
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Blob {
        Blob::File(path.into())
    }

    pub fn from_stream(reader: impl Read + Send + 'static, size: i64) -> Blob {
        Blob::Stream {
            reader: Mutex::new(Some(Box::new(reader))),
            size,
        }
    }

    pub fn from_json<T: serde::Serialize>(value: &T) -> io::Result<Blob> {
        Ok(Blob::Json(serde_json::to_value(value)?))
    }

    pub fn from_writable<F>(contents: F, size: i64) -> Blob
    where
        F: Fn(&mut dyn Write) -> io::Result<()> + Send + Sync + 'static,
    {
        Blob::Writable {
            contents: Box::new(contents),
            size,
        }
    }

    /// Declared length in bytes, `-1` when unknown up front.
    pub fn size(&self) -> i64 {
        match self {
            Blob::Bytes(bytes) => bytes.len() as i64,
            Blob::File(path) => path.metadata().map(|meta| meta.len() as i64).unwrap_or(-1),
            Blob::Stream { size, .. } => *size,
            Blob::Json(_) => -1,
            Blob::Writable { size, .. } => *size,
        }
    }

    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<BlobDescriptor> {
        match self {
            Blob::Bytes(bytes) => compute_digest_of_reader(&mut bytes.as_ref(), out),
            Blob::File(path) => compute_digest_of_reader(&mut File::open(path)?, out),
            Blob::Stream { reader, .. } => {
                let mut reader = take_stream(reader)?;
                compute_digest_of_reader(&mut reader, out)
            }
            Blob::Json(value) => compute_digest(|sink| serde_json::to_writer(sink, value).map_err(io::Error::from), out),
            Blob::Writable { contents, .. } => compute_digest(|sink| contents(sink), out),
        }
    }

    /// Opens the blob for reading, streaming straight from disk for files.
    /// Other variants are materialized in memory first.
    pub fn open_reader(&self) -> io::Result<(Box<dyn Read + Send>, u64)> {
        match self {
            Blob::Bytes(bytes) => Ok((Box::new(Cursor::new(bytes.clone())), bytes.len() as u64)),
            Blob::File(path) => {
                let file = File::open(path)?;
                let len = file.metadata()?.len();
                Ok((Box::new(file), len))
            }
            Blob::Stream { reader, size } if *size >= 0 => Ok((take_stream(reader)?, *size as u64)),
            _ => {
                let mut buffer = Vec::new();
                self.write_to(&mut buffer)?;
                let len = buffer.len() as u64;
                Ok((Box::new(Cursor::new(buffer)), len))
            }
        }
    }
}

fn take_stream(reader: &Mutex<Option<Box<dyn Read + Send>>>) -> io::Result<Box<dyn Read + Send>> {
    reader
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "stream blob lock poisoned"))?
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream blob has already been written"))
}

impl Debug for Blob {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Blob::Bytes(bytes) => write!(f, "Blob::Bytes({} bytes)", bytes.len()),
            Blob::File(path) => write!(f, "Blob::File({})", path.display()),
            Blob::Stream { size, .. } => write!(f, "Blob::Stream(size: {})", size),
            Blob::Json(_) => write!(f, "Blob::Json"),
            Blob::Writable { size, .. } => write!(f, "Blob::Writable(size: {})", size),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::sink;

    use serde_json::json;

    use super::*;
    use crate::blob::digests::compute_digest_of_bytes;

    #[test]
    fn every_variant_reports_the_written_digest() {
        let content = b"layer contents".to_vec();
        let expected = compute_digest_of_bytes(&content);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, &content).unwrap();

        let owned = content.clone();
        let blobs = vec![
            Blob::from_bytes(content.clone()),
            Blob::from_file(&path),
            Blob::from_stream(Cursor::new(content.clone()), content.len() as i64),
            Blob::from_writable(move |out| out.write_all(&owned), content.len() as i64),
        ];
        for blob in blobs {
            let mut written = Vec::new();
            assert_eq!(blob.write_to(&mut written).unwrap(), expected, "{:?}", blob);
            assert_eq!(written, content);
            assert_eq!(blob.size(), content.len() as i64);
        }
    }

    #[test]
    fn stream_blob_is_single_use() {
        let blob = Blob::from_stream(Cursor::new(b"once".to_vec()), 4);
        blob.write_to(&mut sink()).unwrap();
        let err = blob.write_to(&mut sink()).unwrap_err();
        assert!(err.to_string().contains("already been written"));
    }

    #[test]
    fn file_and_json_blobs_are_rewritable() {
        let json_blob = Blob::from_json(&json!({"k": "v"})).unwrap();
        let first = json_blob.write_to(&mut sink()).unwrap();
        let second = json_blob.write_to(&mut sink()).unwrap();
        assert_eq!(first, second);
        assert_eq!(json_blob.size(), -1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let file_blob = Blob::from_file(&path);
        assert_eq!(file_blob.write_to(&mut sink()).unwrap(), file_blob.write_to(&mut sink()).unwrap());
    }

    #[test]
    fn open_reader_materializes_unknown_sizes() {
        let blob = Blob::from_writable(|out| out.write_all(b"12345"), -1);
        let (mut reader, len) = blob.open_reader().unwrap();
        let mut read = Vec::new();
        reader.read_to_end(&mut read).unwrap();
        assert_eq!(len, 5);
        assert_eq!(read, b"12345");
    }
}
