//! # File Entries and Bloblists
//!
//! A snapshot's `bloblist.json` is an ordered list of [`FileEntry`] records,
//! each mapping a repository-relative filename to the blob holding its
//! content. Entries carry a fixed contract (`filename`, `md5sum`, optional
//! `action`) plus arbitrary client fields (`ctime`, `mtime`, `size`, user
//! keys) that must round-trip verbatim — the typed head + flattened map
//! below preserves unknown keys exactly.
//!
//! The module also computes the tree fingerprint: an MD5 over a canonical
//! serialization of the effective filename→checksum mapping. Two snapshots
//! with identical effective trees have identical fingerprints regardless of
//! how the trees were assembled.

use crate::checksum::{is_md5sum, Md5Summer};
use crate::error::{Result, UserError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Separator fed between fingerprint fields. ASCII, 11 bytes; part of the
/// on-disk contract.
const FINGERPRINT_SEPARATOR: &[u8] = b"!SEPARATOR!";

/// How an entry affects the inherited base tree. Absence implies `Add`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Replace,
    Remove,
}

/// Metadata record for a single file within a snapshot.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FileEntry {
    /// Forward-slash relative path. See [`validate_filename`] for the rules.
    pub filename: String,

    /// Content checksum, the key into the blob store. Absent only on
    /// removal entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    /// Override action; absent means `add`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,

    /// Client fields preserved verbatim (`ctime`, `mtime`, `size`, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl FileEntry {
    /// A plain `add` entry with no client fields.
    pub fn new(filename: impl Into<String>, md5sum: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            md5sum: Some(md5sum.into()),
            action: None,
            extra: BTreeMap::new(),
        }
    }

    /// A removal entry, hiding `filename` from the inherited base tree.
    pub fn removal(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            md5sum: None,
            action: Some(Action::Remove),
            extra: BTreeMap::new(),
        }
    }

    /// Attaches a client field, preserving the builder style.
    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn is_removal(&self) -> bool {
        self.action == Some(Action::Remove)
    }
}

/// Checks the filename normalization rules: forward slashes only, relative,
/// no empty components.
pub fn validate_filename(filename: &str) -> Result<()> {
    let fail = |reason| {
        Err(UserError::InvalidFilename {
            filename: filename.to_string(),
            reason,
        }
        .into())
    };
    if filename.is_empty() {
        return fail("must not be empty");
    }
    if filename.contains('\\') {
        return fail("must be in unix format");
    }
    if filename.contains("//") {
        return fail("must be normalized");
    }
    if filename.starts_with('/') {
        return fail("must not be absolute");
    }
    if filename.ends_with('/') {
        return fail("must not end with a path separator");
    }
    Ok(())
}

/// Returns the hex fingerprint that is unique for a set of files.
///
/// Filenames are sorted lexicographically as UTF-8 bytes; for each, the
/// digest is fed `utf8(filename) || "!SEPARATOR!" || md5sum || "!SEPARATOR!"`.
/// The input must be an effective list: removal entries carry no checksum
/// and have no place here, so they are skipped.
pub fn bloblist_fingerprint<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = &'a FileEntry>,
{
    let tree: BTreeMap<&str, &str> = entries
        .into_iter()
        .filter_map(|e| Some((e.filename.as_str(), e.md5sum.as_deref()?)))
        .collect();
    let mut summer = Md5Summer::new();
    for (filename, md5sum) in tree {
        summer.update(filename.as_bytes());
        summer.update(FINGERPRINT_SEPARATOR);
        summer.update(md5sum.as_bytes());
        summer.update(FINGERPRINT_SEPARATOR);
    }
    summer.hexdigest()
}

/// Checks an entry that introduces content: checksum present and valid.
pub fn validate_content_entry(entry: &FileEntry) -> Result<String> {
    validate_filename(&entry.filename)?;
    match entry.md5sum.as_deref() {
        Some(h) if is_md5sum(h) => Ok(h.to_string()),
        Some(h) => Err(UserError::InvalidHash(h.to_string()).into()),
        None => Err(crate::error::WriterError::MissingChecksum(entry.filename.clone()).into()),
    }
}
