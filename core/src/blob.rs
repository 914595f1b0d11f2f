// ==============================================================================
// blob.rs - Content-Addressed Blob Store
// ==============================================================================
// Description: Filesystem store for uploaded and generated files, keyed by
//              the SHA-256 digest of the decompressed payload
// Author: Matt Barham
// Created: 2025-12-05
// Modified: 2026-01-12
// Version: 1.1.0
// ==============================================================================

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Gzip magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Blob store errors
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob {0} not found")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Description of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// SHA-256 of the decompressed content, hex-encoded. Doubles as the
    /// file name under the primary data directory.
    pub digest: String,
    /// Whether the bytes on disk are gzip-compressed.
    pub gzipped: bool,
    /// Decompressed size in bytes.
    pub byte_size: u64,
    /// Number of lines in the decompressed content, headers included.
    pub record_count: u64,
}

/// Content-addressed blob store rooted at the primary data directory, with
/// an optional read-only secondary root. Blobs are immutable: writers
/// stage under a random name and rename once the digest is known.
#[derive(Clone)]
pub struct BlobStore {
    data_dir: PathBuf,
    secondary_dir: Option<PathBuf>,
    secondary_by_user: bool,
}

impl BlobStore {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        secondary_dir: Option<PathBuf>,
        secondary_by_user: bool,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            secondary_dir,
            secondary_by_user,
        }
    }

    /// Store a payload as received. Compression is detected from the
    /// magic bytes; the digest is always computed over the decompressed
    /// content. Returns the blob description; storing identical content
    /// twice is a no-op that observes the existing blob.
    pub fn store(&self, data: &[u8]) -> Result<StoredBlob, BlobError> {
        let gzipped = data.starts_with(&GZIP_MAGIC);

        let (digest, byte_size, record_count) = if gzipped {
            digest_stream(MultiGzDecoder::new(data))?
        } else {
            digest_stream(data)?
        };

        let path = self.data_dir.join(&digest);
        if !path.exists() {
            fs::create_dir_all(&self.data_dir)?;
            let staging = self.data_dir.join(format!(".staging-{}", Uuid::new_v4()));
            fs::write(&staging, data)?;
            fs::rename(&staging, &path)?;
        }

        Ok(StoredBlob {
            digest,
            gzipped,
            byte_size,
            record_count,
        })
    }

    /// Open a writer for a generated blob. Content is gzip-compressed on
    /// disk; the digest is computed over the uncompressed bytes written.
    pub fn writer(&self) -> Result<BlobWriter, BlobError> {
        fs::create_dir_all(&self.data_dir)?;
        let staging = self.data_dir.join(format!(".staging-{}", Uuid::new_v4()));
        let file = File::create(&staging)?;
        Ok(BlobWriter {
            data_dir: self.data_dir.clone(),
            staging,
            encoder: Some(GzEncoder::new(file, Compression::default())),
            hasher: Sha256::new(),
            byte_size: 0,
            record_count: 0,
        })
    }

    /// Open a blob as a decompressed byte stream.
    pub fn open(&self, digest: &str, owner_login: &str) -> Result<Box<dyn BufRead + Send>, BlobError> {
        let path = self.locate(digest, owner_login)?;
        let mut file = File::open(&path)?;

        let mut magic = [0u8; 2];
        let n = file.read(&mut magic)?;
        // Re-open to restart from the beginning after sniffing.
        let file = File::open(&path)?;

        if n == 2 && magic == GZIP_MAGIC {
            Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
        } else {
            Ok(Box::new(BufReader::new(file)))
        }
    }

    /// Open a blob and fast-forward the decompressed stream to `offset`
    /// bytes. The stream itself need not be seekable; skipped bytes are
    /// read and discarded.
    pub fn open_at(
        &self,
        digest: &str,
        owner_login: &str,
        offset: u64,
    ) -> Result<Box<dyn BufRead + Send>, BlobError> {
        let mut reader = self.open(digest, owner_login)?;
        skip_bytes(&mut reader, offset)?;
        Ok(reader)
    }

    fn locate(&self, digest: &str, owner_login: &str) -> Result<PathBuf, BlobError> {
        let primary = self.data_dir.join(digest);
        if primary.exists() {
            return Ok(primary);
        }
        if let Some(secondary) = &self.secondary_dir {
            let candidate = if self.secondary_by_user {
                secondary.join(owner_login).join(digest)
            } else {
                secondary.join(digest)
            };
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(BlobError::NotFound(digest.to_string()))
    }
}

/// Incremental writer for a generated blob.
pub struct BlobWriter {
    data_dir: PathBuf,
    staging: PathBuf,
    encoder: Option<GzEncoder<File>>,
    hasher: Sha256,
    byte_size: u64,
    record_count: u64,
}

impl BlobWriter {
    /// Finish the blob: flush, compute the digest, and move the staged
    /// file to its content-addressed name.
    pub fn finish(mut self) -> Result<StoredBlob, BlobError> {
        let encoder = self.encoder.take().expect("finish called once");
        encoder.finish()?.sync_all()?;

        let digest = hex::encode(self.hasher.clone().finalize());
        let path = self.data_dir.join(&digest);
        if path.exists() {
            fs::remove_file(&self.staging)?;
        } else {
            fs::rename(&self.staging, &path)?;
        }

        Ok(StoredBlob {
            digest,
            gzipped: true,
            byte_size: self.byte_size,
            record_count: self.record_count,
        })
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let encoder = self.encoder.as_mut().expect("writer not finished");
        let n = encoder.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.byte_size += n as u64;
        self.record_count += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.as_mut().expect("writer not finished").flush()
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.encoder.is_some() {
            let _ = fs::remove_file(&self.staging);
        }
    }
}

/// First line of a payload, decompressing when the magic bytes say so.
/// Used to sniff file types before accepting an upload.
pub fn peek_first_line(data: &[u8]) -> Option<String> {
    let mut line = String::new();
    if data.starts_with(&GZIP_MAGIC) {
        let mut reader = BufReader::new(MultiGzDecoder::new(data));
        reader.read_line(&mut line).ok()?;
    } else {
        let mut reader = BufReader::new(data);
        reader.read_line(&mut line).ok()?;
    }
    Some(line.trim_end().to_string())
}

/// Digest a decompressed stream: SHA-256, byte count, and line count.
fn digest_stream(mut reader: impl Read) -> Result<(String, u64, u64), BlobError> {
    let mut hasher = Sha256::new();
    let mut bytes: u64 = 0;
    let mut lines: u64 = 0;
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        bytes += n as u64;
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
    }

    Ok((hex::encode(hasher.finalize()), bytes, lines))
}

/// Read and discard exactly `count` bytes.
fn skip_bytes(reader: &mut impl Read, count: u64) -> Result<(), io::Error> {
    let mut remaining = count;
    let mut buf = [0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "blob shorter than requested offset",
            ));
        }
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_store_plain_and_open() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path(), None, false);

        let blob = store.store(b"line one\nline two\n").unwrap();
        assert!(!blob.gzipped);
        assert_eq!(blob.byte_size, 18);
        assert_eq!(blob.record_count, 2);

        let mut content = String::new();
        store
            .open(&blob.digest, "alice")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "line one\nline two\n");
    }

    #[test]
    fn test_gzip_digest_matches_plain() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path(), None, false);

        let plain = store.store(b"payload\n").unwrap();

        let dir2 = TempDir::new().unwrap();
        let store2 = BlobStore::new(dir2.path(), None, false);
        let zipped = store2.store(&gzip(b"payload\n")).unwrap();

        // Same decompressed content, same identity.
        assert_eq!(plain.digest, zipped.digest);
        assert_eq!(plain.byte_size, zipped.byte_size);
        assert!(zipped.gzipped);

        let mut content = String::new();
        store2
            .open(&zipped.digest, "alice")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "payload\n");
    }

    #[test]
    fn test_store_twice_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path(), None, false);
        let first = store.store(b"same bytes").unwrap();
        let second = store.store(b"same bytes").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_open_at_skips_decompressed_bytes() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path(), None, false);
        let blob = store.store(&gzip(b"0123456789")).unwrap();

        let mut rest = String::new();
        store
            .open_at(&blob.digest, "alice", 4)
            .unwrap()
            .read_to_string(&mut rest)
            .unwrap();
        assert_eq!(rest, "456789");
    }

    #[test]
    fn test_missing_blob() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path(), None, false);
        assert!(matches!(
            store.open("deadbeef", "alice"),
            Err(BlobError::NotFound(_))
        ));
    }

    #[test]
    fn test_secondary_root_by_user() {
        let primary = TempDir::new().unwrap();
        let secondary = TempDir::new().unwrap();

        // A file placed out of band under the user subdirectory.
        let user_dir = secondary.path().join("alice");
        fs::create_dir_all(&user_dir).unwrap();
        fs::write(user_dir.join("cafebabe"), b"external data\n").unwrap();

        let store = BlobStore::new(
            primary.path(),
            Some(secondary.path().to_path_buf()),
            true,
        );

        let mut content = String::new();
        store
            .open("cafebabe", "alice")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "external data\n");

        assert!(matches!(
            store.open("cafebabe", "bob"),
            Err(BlobError::NotFound(_))
        ));
    }

    #[test]
    fn test_writer_produces_addressable_blob() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path(), None, false);

        let mut writer = store.writer().unwrap();
        writer.write_all(b"generated line\n").unwrap();
        let blob = writer.finish().unwrap();

        assert!(blob.gzipped);
        assert_eq!(blob.byte_size, 15);
        assert_eq!(blob.record_count, 1);

        let mut content = String::new();
        store
            .open(&blob.digest, "alice")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "generated line\n");
    }
}
