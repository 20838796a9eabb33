//! Streaming content hashing.
//!
//! Computes the MD5, SHA-1 and SHA-256 digests of an artifact in a single pass
//! over a byte stream. The stream is consumed in bounded chunks, and the result
//! depends only on the bytes, never on how the stream happens to be segmented.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{IoFailure, Mal2Result, ValidationError};
use crate::DigestSet;

/// Block size used when no other chunk size is configured (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Incremental hasher producing the full digest triple.
#[derive(Clone, Default)]
pub struct ContentHasher {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    bytes: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next segment of the stream.
    pub fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        self.sha1.update(chunk);
        self.sha256.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> DigestSet {
        DigestSet {
            md5: hex::encode(self.md5.finalize()),
            sha1: hex::encode(self.sha1.finalize()),
            sha256: hex::encode(self.sha256.finalize()),
        }
    }
}

/// Outcome of hashing a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedContent {
    pub digests: DigestSet,
    pub size_bytes: u64,
}

/// Hash everything `reader` yields, reading at most `chunk_size` bytes at a time.
///
/// Interrupted reads are retried; any other read error aborts hashing.
pub fn hash_reader<R: Read>(mut reader: R, chunk_size: usize) -> io::Result<HashedContent> {
    if chunk_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "chunk size must be at least one byte",
        ));
    }

    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }

    let size_bytes = hasher.bytes_hashed();
    Ok(HashedContent {
        digests: hasher.finalize(),
        size_bytes,
    })
}

/// Hash a file on disk.
pub fn hash_file(path: &Path, chunk_size: usize) -> Mal2Result<HashedContent> {
    if chunk_size == 0 {
        return Err(ValidationError::InvalidValue {
            field: "chunk_size".to_string(),
            reason: "must be at least one byte".to_string(),
        }
        .into());
    }
    let file = File::open(path).map_err(|e| IoFailure::new("open for hashing", path, &e))?;
    hash_reader(file, chunk_size).map_err(|e| IoFailure::new("hash", path, &e).into())
}

/// Hash an in-memory buffer.
pub fn hash_bytes(content: &[u8]) -> DigestSet {
    let mut hasher = ContentHasher::new();
    hasher.update(content);
    hasher.finalize()
}

// =============================================================================
// TESTS
// =============================================================================
