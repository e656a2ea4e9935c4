use std::io;
use std::io::{Read, Write};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::blob::digest::{BlobDescriptor, DescriptorDigest};

/// Passes bytes through to `inner` while hashing and counting them.
pub struct CountingDigestOutputStream<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes_so_far: u64,
}

impl<W: Write> CountingDigestOutputStream<W> {
    pub fn new(inner: W) -> CountingDigestOutputStream<W> {
        CountingDigestOutputStream {
            inner,
            hasher: Sha256::new(),
            bytes_so_far: 0,
        }
    }

    /// Flushes, returns the descriptor of everything written so far and
    /// resets the hash and the counter so the stream can be reused.
    pub fn compute_digest(&mut self) -> io::Result<BlobDescriptor> {
        self.inner.flush()?;
        let digest = DescriptorDigest::from_raw_hash(&self.hasher.finalize_reset());
        let size = std::mem::take(&mut self.bytes_so_far);
        Ok(BlobDescriptor::new(size as i64, digest))
    }

    pub fn bytes_so_far(&self) -> u64 {
        self.bytes_so_far
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingDigestOutputStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes_so_far += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Read-side counterpart: hashes and counts everything read through it.
pub struct CountingDigestReader<R: Read> {
    inner: R,
    hasher: Sha256,
    bytes_so_far: u64,
}

impl<R: Read> CountingDigestReader<R> {
    pub fn new(inner: R) -> CountingDigestReader<R> {
        CountingDigestReader {
            inner,
            hasher: Sha256::new(),
            bytes_so_far: 0,
        }
    }

    pub fn compute_digest(&mut self) -> BlobDescriptor {
        let digest = DescriptorDigest::from_raw_hash(&self.hasher.finalize_reset());
        let size = std::mem::take(&mut self.bytes_so_far);
        BlobDescriptor::new(size as i64, digest)
    }
}

impl<R: Read> Read for CountingDigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.bytes_so_far += read as u64;
        Ok(read)
    }
}

/// Copies `reader` into `out`, returning the descriptor of the copied bytes.
pub fn compute_digest_of_reader<R: Read + ?Sized, W: Write + ?Sized>(reader: &mut R, out: &mut W) -> io::Result<BlobDescriptor> {
    let mut digest_stream = CountingDigestOutputStream::new(out);
    io::copy(reader, &mut digest_stream)?;
    digest_stream.compute_digest()
}

/// Runs `contents` against a digesting sink that forwards to `out`.
pub fn compute_digest<W, F>(contents: F, out: &mut W) -> io::Result<BlobDescriptor>
where
    W: Write + ?Sized,
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let mut digest_stream = CountingDigestOutputStream::new(out);
    contents(&mut digest_stream)?;
    digest_stream.compute_digest()
}

/// Serializes `value` as JSON into `out` and returns its descriptor.
pub fn compute_json_descriptor<T: Serialize + ?Sized, W: Write + ?Sized>(value: &T, out: &mut W) -> io::Result<BlobDescriptor> {
    compute_digest(|sink| serde_json::to_writer(sink, value).map_err(io::Error::from), out)
}

pub fn compute_json_digest<T: Serialize + ?Sized>(value: &T) -> io::Result<DescriptorDigest> {
    Ok(compute_json_descriptor(value, &mut io::sink())?.digest().clone())
}

pub fn compute_digest_of_bytes(bytes: &[u8]) -> BlobDescriptor {
    let digest = DescriptorDigest::from_raw_hash(&Sha256::digest(bytes));
    BlobDescriptor::new(bytes.len() as i64, digest)
}
