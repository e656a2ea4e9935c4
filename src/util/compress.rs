use std::io;
use std::io::{BufRead, BufReader, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressType {
    Tar,
    Tgz,
    Zstd,
}

/// Gzips everything read from `input_reader` into `output_writer`.
pub fn gz_stream<R: Read + ?Sized, W: Write + ?Sized>(input_reader: &mut R, output_writer: &mut W) -> io::Result<()> {
    let mut encoder = GzEncoder::new(output_writer, Compression::default());
    io::copy(input_reader, &mut encoder)?;
    encoder.finish()?.flush()
}

/// Sniffs the magic bytes of a layer stream.
pub fn detect<R: BufRead>(reader: &mut R) -> io::Result<CompressType> {
    let head = reader.fill_buf()?;
    Ok(if head.starts_with(&GZIP_MAGIC) {
        CompressType::Tgz
    } else if head.starts_with(&ZSTD_MAGIC) {
        CompressType::Zstd
    } else {
        CompressType::Tar
    })
}

/// Wraps `reader` so that reading yields the uncompressed tar, whatever the
/// layer compression is.
pub fn decompressing_reader<'a, R: Read + 'a>(reader: R) -> io::Result<Box<dyn Read + 'a>> {
    let mut buffered = BufReader::new(reader);
    Ok(match detect(&mut buffered)? {
        CompressType::Tgz => Box::new(GzDecoder::new(buffered)),
        CompressType::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(buffered)?),
        CompressType::Tar => Box::new(buffered),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_and_zstd_are_detected_and_undone() {
        let plain = b"tar bytes, more or less".to_vec();

        let mut gzipped = Vec::new();
        gz_stream(&mut &plain[..], &mut gzipped).unwrap();
        let mut zstded = Vec::new();
        zstd::stream::copy_encode(&plain[..], &mut zstded, 0).unwrap();

        for (compressed, expected) in [(&gzipped, CompressType::Tgz), (&zstded, CompressType::Zstd), (&plain, CompressType::Tar)] {
            assert_eq!(detect(&mut BufReader::new(&compressed[..])).unwrap(), expected);
            let mut out = Vec::new();
            decompressing_reader(&compressed[..]).unwrap().read_to_end(&mut out).unwrap();
            assert_eq!(out, plain);
        }
    }
}
