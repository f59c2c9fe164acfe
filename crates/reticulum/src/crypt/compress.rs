use std::io::{Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;

use crate::error::RnsError;

/// Decompressed size guard. Resource payloads and message bodies are bounded,
/// so anything expanding past this is treated as hostile input.
const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

pub fn bz2_compress(data: &[u8]) -> Result<Vec<u8>, RnsError> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).map_err(|_| RnsError::InvalidArgument)?;
    encoder.finish().map_err(|_| RnsError::InvalidArgument)
}

pub fn bz2_decompress(data: &[u8]) -> Result<Vec<u8>, RnsError> {
    let mut decoder = BzDecoder::new(data).take(MAX_DECOMPRESSED_SIZE as u64 + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|_| RnsError::InvalidArgument)?;
    if out.len() > MAX_DECOMPRESSED_SIZE {
        return Err(RnsError::OutOfMemory);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{bz2_compress, bz2_decompress};

    #[test]
    fn compress_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(32);
        let compressed = bz2_compress(&data).expect("compressed");
        assert!(compressed.len() < data.len());
        let restored = bz2_decompress(&compressed).expect("decompressed");
        assert_eq!(restored, data);
    }

    #[test]
    fn garbage_input_fails() {
        assert!(bz2_decompress(b"not a bz2 stream").is_err());
    }
}
