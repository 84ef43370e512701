//! # Checksum Primitives
//!
//! MD5 is the content address of this repository format: every blob is named
//! by the lowercase 32-hex digest of its bytes, and the same digest seals
//! snapshot metadata and recipe reconstruction. The format predates faster
//! hashes and the digest is part of the on-disk contract, so MD5 it stays.
//!
//! All file hashing streams through a fixed buffer so arbitrarily large blobs
//! never need to fit in memory.

use crate::error::{Result, UserError, WriterError};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Size of the read buffer for streaming hash computation (64 KiB).
const BUF_SIZE: usize = 64 * 1024;

/// Number of hex characters in an MD5 digest.
pub const MD5_HEX_LEN: usize = 32;

/// Returns true iff `s` is a lowercase 32-character hex string.
pub fn is_md5sum(s: &str) -> bool {
    s.len() == MD5_HEX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Validates a digest string, returning it as an owned `String`.
pub fn require_md5sum(s: &str) -> Result<String> {
    if !is_md5sum(s) {
        return Err(UserError::InvalidHash(s.to_string()).into());
    }
    Ok(s.to_string())
}

/// Computes the MD5 hex digest of in-memory data.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Computes the MD5 hex digest of a file's entire contents.
pub fn md5_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    md5_file_range(&mut file, 0, len)
}

/// Computes the MD5 hex digest of the byte range `[start, end)` of an open
/// file. The range must lie within the file.
pub fn md5_file_range(file: &mut File, start: u64, end: u64) -> Result<String> {
    let mut summer = Md5Summer::new();
    read_range(file, start, end, |block| {
        summer.update(block);
        Ok(())
    })?;
    Ok(summer.hexdigest())
}

/// Copies the byte range `[start, end)` of `source` to a new file at
/// `destination`, checksumming while copying. The destination must not exist.
/// Returns `CorruptedCopy` if the copied bytes do not hash to `expected`.
pub fn copy_file_range_verified(
    source: &Path,
    destination: &Path,
    start: u64,
    end: u64,
    expected: &str,
) -> Result<()> {
    let mut src = File::open(source)?;
    let mut dst = File::options()
        .write(true)
        .create_new(true)
        .open(destination)?;
    let mut summer = Md5Summer::new();
    read_range(&mut src, start, end, |block| {
        summer.update(block);
        dst.write_all(block)?;
        Ok(())
    })?;
    let actual = summer.hexdigest();
    if actual != expected {
        return Err(WriterError::CorruptedCopy {
            hash: expected.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}

/// Streams the byte range `[start, end)` of `file` through `sink` in blocks
/// of at most [`BUF_SIZE`] bytes.
fn read_range<F>(file: &mut File, start: u64, end: u64, mut sink: F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    file.seek(SeekFrom::Start(start))?;
    let mut remaining = end.saturating_sub(start);
    let mut buf = vec![0u8; BUF_SIZE];
    while remaining > 0 {
        let want = remaining.min(BUF_SIZE as u64) as usize;
        let read = file.read(&mut buf[..want])?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of file while reading range",
            )
            .into());
        }
        sink(&buf[..read])?;
        remaining -= read as u64;
    }
    Ok(())
}

/// An incremental MD5 digest that can be queried without being consumed.
///
/// The writer keeps one summer per staged blob and compares the final digest
/// against the blob's declared name at commit time.
#[derive(Clone, Default, Debug)]
pub struct Md5Summer(Md5);

impl Md5Summer {
    pub fn new() -> Self {
        Self(Md5::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Hex digest of everything fed so far. Does not consume the summer.
    pub fn hexdigest(&self) -> String {
        hex::encode(self.0.clone().finalize())
    }
}
