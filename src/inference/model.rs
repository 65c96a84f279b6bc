//! Model file validation
//!
//! Cheap header checks run before handing a file to the native loader.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use thiserror::Error;

/// "GGUF" read as a little-endian u32
pub const GGUF_MAGIC: u32 = 0x4655_4747;

const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 1..=3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Model file not found: {0}")]
    NotFound(String),

    #[error("Failed to read model file: {0}")]
    Io(String),

    #[error("Not a GGUF file (magic {0:#010x})")]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("GGUF header truncated")]
    Truncated,
}

/// Header fields of a GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
    pub file_size: u64,
}

/// Check that `path` is a readable GGUF file of a supported version
pub fn validate_gguf(path: &Path) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ModelError::NotFound(path.display().to_string()),
        _ => ModelError::Io(e.to_string()),
    })?;
    let file_size = file
        .metadata()
        .map_err(|e| ModelError::Io(e.to_string()))?
        .len();

    let magic = read_u32(&mut file)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = read_u32(&mut file)?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    // v1 stored counts as u32
    let (tensor_count, metadata_kv_count) = if version == 1 {
        (read_u32(&mut file)? as u64, read_u32(&mut file)? as u64)
    } else {
        (read_u64(&mut file)?, read_u64(&mut file)?)
    };

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
        file_size,
    })
}

fn read_u32(reader: &mut impl Read) -> Result<u32, ModelError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, ModelError> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), ModelError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ModelError::Truncated,
        _ => ModelError::Io(e.to_string()),
    })
}

/// Minimal valid GGUF header, for tests that need a loadable-looking file
#[cfg(test)]
pub(crate) fn write_test_gguf(path: &Path) {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&3u32.to_le_bytes());
    bytes.extend_from_slice(&2u64.to_le_bytes());
    bytes.extend_from_slice(&5u64.to_le_bytes());
    std::fs::write(path, bytes).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        write_test_gguf(&path);

        let meta = validate_gguf(&path).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.tensor_count, 2);
        assert_eq!(meta.metadata_kv_count, 5);
        assert_eq!(meta.file_size, 24);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_gguf(&dir.path().join("absent.gguf")).unwrap_err();
        assert!(matches!(err, ModelError::NotFound(_)));
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, b"<html>not a model</html>").unwrap();
        assert!(matches!(validate_gguf(&path), Err(ModelError::InvalidMagic(_))));
    }

    #[test]
    fn test_truncated_and_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");

        std::fs::write(&path, GGUF_MAGIC.to_le_bytes()).unwrap();
        assert_eq!(validate_gguf(&path), Err(ModelError::Truncated));

        let mut bytes = GGUF_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&99u32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert_eq!(validate_gguf(&path), Err(ModelError::UnsupportedVersion(99)));
    }
}
