//! # Snapshot Reader & Effective-Tree Resolver
//!
//! A [`SessionReader`] parses one installed snapshot directory. The snapshot
//! stores only the entries it introduced; the full logical tree of a revision
//! is resolved by walking the `base_session` chain and overlaying each
//! snapshot's own entries on what it inherited.
//!
//! `session.json` is parsed eagerly (it is small and names the session);
//! `bloblist.json` loads lazily on first tree access.

use crate::bloblist::FileEntry;
use crate::checksum::md5_file;
use crate::error::{RepoError, Result};
use crate::jsonio;
use crate::repo::Repository;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

pub const BLOBLIST_FILE: &str = "bloblist.json";
pub const SESSION_FILE: &str = "session.json";
pub const SESSION_MD5_FILE: &str = "session.md5";

/// Client-supplied snapshot metadata. `name` is required — it is the session
/// the snapshot belongs to — and everything else rides along verbatim.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClientData {
    pub name: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ClientData {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: BTreeMap::new(),
        }
    }
}

/// Parsed contents of `session.json`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionProperties {
    /// Id of the snapshot this one derives from, or None for a
    /// non-incremental revision.
    pub base_session: Option<u32>,

    /// MD5 over the canonical serialization of the effective tree.
    pub fingerprint: String,

    pub client_data: ClientData,
}

/// Reader over one installed snapshot.
pub struct SessionReader {
    repo: Repository,
    path: PathBuf,
    properties: SessionProperties,
    bloblist: Option<Vec<FileEntry>>,
}

impl SessionReader {
    pub(crate) fn open(repo: Repository, path: PathBuf) -> Result<Self> {
        let properties: SessionProperties = jsonio::read_json(&path.join(SESSION_FILE))?;
        Ok(Self {
            repo,
            path,
            properties,
            bloblist: None,
        })
    }

    /// A copy of the parsed `session.json`.
    pub fn properties(&self) -> SessionProperties {
        self.properties.clone()
    }

    pub fn fingerprint(&self) -> &str {
        &self.properties.fingerprint
    }

    pub fn base_session(&self) -> Option<u32> {
        self.properties.base_session
    }

    pub fn client_data(&self) -> &ClientData {
        &self.properties.client_data
    }

    /// Value of the client property `key`, if any.
    pub fn client_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.client_data.extra.get(key)
    }

    pub(crate) fn repo(&self) -> &Repository {
        &self.repo
    }

    /// This snapshot's own entries, unmerged, in on-disk order.
    pub fn raw_bloblist(&mut self) -> Result<&[FileEntry]> {
        if self.bloblist.is_none() {
            let list: Vec<FileEntry> = jsonio::read_json(&self.path.join(BLOBLIST_FILE))?;
            self.bloblist = Some(list);
        }
        Ok(self.bloblist.as_deref().unwrap_or_default())
    }

    /// Iterator over the merged tree: this snapshot's entries in on-disk
    /// order, then inherited entries in their effective order, skipping
    /// filenames already emitted. Each filename appears at most once.
    pub fn effective_bloblist(&mut self) -> Result<EffectiveEntries> {
        let own = self.raw_bloblist()?.to_vec();
        Ok(EffectiveEntries {
            repo: self.repo.clone(),
            current: own.into_iter(),
            next_base: self.properties.base_session,
            seen: HashSet::new(),
            local_seen: HashSet::new(),
            failed: false,
        })
    }

    /// Collects the effective tree into a filename-keyed map.
    pub fn effective_map(&mut self) -> Result<BTreeMap<String, FileEntry>> {
        let mut map = BTreeMap::new();
        for entry in self.effective_bloblist()? {
            let entry = entry?;
            map.insert(entry.filename.clone(), entry);
        }
        Ok(map)
    }

    /// Checks `session.md5` against the on-disk metadata files.
    pub fn verify_integrity(&self) -> Result<()> {
        let text = std::fs::read_to_string(self.path.join(SESSION_MD5_FILE))?;
        for line in text.lines() {
            let (checksum, filename) = line.split_once(" *").ok_or_else(|| {
                RepoError::Corrupted {
                    message: format!("malformed session.md5 line: {line:?}"),
                }
            })?;
            let actual = md5_file(&self.path.join(filename))?;
            if actual != checksum {
                return Err(RepoError::Corrupted {
                    message: format!(
                        "{filename} in {} hashes to {actual}, session.md5 says {checksum}",
                        self.path.display()
                    ),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Explicit iterator over the effective tree of a snapshot.
///
/// Walks the base chain iteratively, one snapshot at a time; within each
/// snapshot, a duplicated filename is corruption (a conforming writer cannot
/// produce it) and is reported as an error item, after which the iterator is
/// exhausted.
pub struct EffectiveEntries {
    repo: Repository,
    current: std::vec::IntoIter<FileEntry>,
    next_base: Option<u32>,
    /// Filenames claimed by any snapshot visited so far, including removals.
    seen: HashSet<String>,
    /// Filenames seen within the snapshot currently being drained.
    local_seen: HashSet<String>,
    failed: bool,
}

impl Iterator for EffectiveEntries {
    type Item = Result<FileEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            for entry in self.current.by_ref() {
                if !self.local_seen.insert(entry.filename.clone()) {
                    self.failed = true;
                    return Some(Err(RepoError::Corrupted {
                        message: format!(
                            "duplicate file entry '{}' in a single snapshot",
                            entry.filename
                        ),
                    }
                    .into()));
                }
                let newly_claimed = self.seen.insert(entry.filename.clone());
                if entry.is_removal() {
                    continue;
                }
                if newly_claimed {
                    return Some(Ok(entry));
                }
            }
            match self.next_base.take() {
                None => return None,
                Some(id) => {
                    let mut reader = match self.repo.get_session(id) {
                        Ok(reader) => reader,
                        Err(e) => {
                            self.failed = true;
                            return Some(Err(e));
                        }
                    };
                    let list = match reader.raw_bloblist() {
                        Ok(list) => list.to_vec(),
                        Err(e) => {
                            self.failed = true;
                            return Some(Err(e));
                        }
                    };
                    self.next_base = reader.base_session();
                    self.current = list.into_iter();
                    self.local_seen.clear();
                }
            }
        }
    }
}
