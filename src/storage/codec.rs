//! Binary codec for store files.
//!
//! Every file starts with a header (magic + version) followed by one framed
//! entry:
//!
//! ```text
//! [magic: 4 bytes][version: 1 byte]
//! [length: 4 bytes LE][payload: N bytes][crc32: 4 bytes LE]
//! ```
//!
//! Metadata payloads are JSON; chunk payloads are raw little-endian array
//! elements. Files are replaced atomically (temp file, optional fsync,
//! rename), so a reader never observes a half-written file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Error as IoError, ErrorKind, Read, Result as IoResult, Write};
use std::path::Path;

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Current codec version.
const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying store files.
pub const MAGIC: [u8; 4] = *b"RSIM";

/// Largest accepted payload (1 GiB).
const MAX_ENTRY_SIZE: usize = 1024 * 1024 * 1024;

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Frames raw bytes with length and checksum.
pub fn encode_bytes(data: &[u8]) -> IoResult<Vec<u8>> {
    let len = u32::try_from(data.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidInput, format!("entry of {} bytes is too large", data.len())))?;
    let mut out = Vec::with_capacity(4 + data.len() + 4);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&checksum(data).to_le_bytes());
    Ok(out)
}

/// Reads one framed entry, verifying its checksum.
///
/// # Errors
/// - Returns error if the checksum fails (corruption detected)
/// - Returns error if the declared length is unreasonably large
pub fn decode_bytes(reader: &mut impl Read) -> IoResult<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_ENTRY_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("entry size {len} exceeds maximum {MAX_ENTRY_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);
    let computed_crc = checksum(&data);

    if stored_crc != computed_crc {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x} (data corrupted)"),
        ));
    }
    Ok(data)
}

/// Serializes a value as a JSON entry.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    encode_bytes(&data)
}

/// Deserializes a JSON entry, verifying its checksum.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let data = decode_bytes(reader)?;
    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Write the file header (magic + version).
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])?;
    Ok(())
}

/// Read and validate the file header.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;

    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }
    Ok(version[0])
}

/// Atomically replaces `path` with header + `entry`.
///
/// Writes to a uniquely named temp file next to `path` and renames it into
/// place. With `sync`, the temp file is fsynced before the rename.
pub fn write_file_atomic(path: &Path, entry: &[u8], sync: bool) -> IoResult<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, format!("{} has no file name", path.display())))?;
    let temp_path = path.with_file_name(format!(".{}.tmp.{}", file_name.to_string_lossy(), Uuid::new_v4()));

    let result = (|| {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        writer.write_all(entry)?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        // Best-effort cleanup of the temp file
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Reads a file written by [`write_file_atomic`] and returns its entry bytes.
pub fn read_file(path: &Path) -> IoResult<Vec<u8>> {
    let mut reader = std::io::BufReader::new(File::open(path)?);
    read_header(&mut reader)?;
    decode_bytes(&mut reader)
}

/// Reads a JSON entry file written by [`write_file_atomic`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> IoResult<T> {
    let mut reader = std::io::BufReader::new(File::open(path)?);
    read_header(&mut reader)?;
    decode(&mut reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_json() {
        let value = vec!["chunk".to_string(), "size".to_string()];
        let encoded = encode(&value).unwrap();

        let mut cursor = Cursor::new(encoded);
        let decoded: Vec<String> = decode(&mut cursor).unwrap();

        assert_eq!(value, decoded);
    }

    #[test]
    fn test_detects_corruption() {
        let mut encoded = encode_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        encoded[6] ^= 0xFF;

        let mut cursor = Cursor::new(encoded);
        let err = decode_bytes(&mut cursor).unwrap_err();
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn test_rejects_oversized_entry() {
        let mut bad_data = Vec::new();
        bad_data.extend_from_slice(&u32::MAX.to_le_bytes());

        let mut cursor = Cursor::new(bad_data);
        let err = decode_bytes(&mut cursor).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        let version = read_header(&mut cursor).unwrap();
        assert_eq!(version, CODEC_VERSION);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let mut cursor = Cursor::new(b"NOPE\x01".to_vec());
        assert!(read_header(&mut cursor).is_err());
    }

    #[test]
    fn test_atomic_write_replaces_and_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.chunk");

        write_file_atomic(&path, &encode_bytes(b"first").unwrap(), false).unwrap();
        write_file_atomic(&path, &encode_bytes(b"second").unwrap(), true).unwrap();

        assert_eq!(read_file(&path).unwrap(), b"second");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_json_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".attrs");
        write_file_atomic(&path, &encode(&42usize).unwrap(), false).unwrap();
        let n: usize = read_json(&path).unwrap();
        assert_eq!(n, 42);
    }
}
