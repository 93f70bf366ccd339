//! SHA-256 checksum utilities for file-level delta detection

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the SHA-256 hex digest of any readable source, streaming in 8 KiB
/// chunks so arbitrarily large files use constant memory.
pub fn compute_sha256<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA-256 hex digest of a file
pub fn compute_file_sha256(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_sha256(&mut file)
}

/// Compute the SHA-256 hex digest of an in-memory byte slice
pub fn compute_bytes_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_compute_sha256() {
        let data = b"hello world";
        let mut cursor = Cursor::new(data);
        let checksum = compute_sha256(&mut cursor).unwrap();
        assert_eq!(
            checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_bytes_matches_stream() {
        let data = b"ICSR batch content";
        let mut cursor = Cursor::new(data);
        assert_eq!(
            compute_sha256(&mut cursor).unwrap(),
            compute_bytes_sha256(data)
        );
    }

    #[test]
    fn test_compute_file_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.xml");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            compute_file_sha256(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
