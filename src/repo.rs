//! # Repository Store
//!
//! On-disk layout of a snapshot repository:
//!
//! ```text
//! <repo>/
//! ├── blobs/<hex32>                  raw blobs, named by content md5
//! ├── recipes/<hex32>.recipe         JSON concat-recipes
//! ├── snapshots/<id>/
//! │   ├── bloblist.json              entries introduced by this snapshot
//! │   ├── session.json               {base_session, fingerprint, client_data}
//! │   ├── session.md5                checksums of the two files above
//! │   └── <fingerprint>.fingerprint  empty marker
//! └── tmp/
//!     ├── mutex-<md5(name)>/         session lock dirs
//!     └── tmp_XXXXXX/                writer staging areas
//! ```
//!
//! Installed blobs and snapshots are immutable; the store never mutates them
//! and never silently repairs inconsistencies it detects. The only mutation
//! path is [`Repository::consolidate_snapshot`], which atomically promotes a
//! sealed staging directory into the snapshot area.

use crate::checksum::{self, is_md5sum};
use crate::error::{RepoError, Result};
use crate::jsonio;
use crate::mutex::FileMutex;
use crate::reader::SessionReader;
use crate::recipe::Recipe;
use crate::writer::SessionWriter;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const BLOBS_DIR: &str = "blobs";
pub const RECIPES_DIR: &str = "recipes";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const TMP_DIR: &str = "tmp";

/// Reserved mutex name guarding id assignment and install renames.
const REPO_MUTEX_NAME: &str = "__repository";

/// How long a consolidation will wait for a competing consolidation.
const CONSOLIDATE_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Handle to a snapshot repository rooted at a directory.
///
/// The handle is cheap to clone; writers and readers each hold their own
/// clone instead of back-references, so there is no shared mutable state
/// beyond the filesystem itself.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    /// Initializes a new repository directory structure.
    pub fn create(root: &Path) -> Result<Self> {
        if root.join(BLOBS_DIR).exists() {
            return Err(RepoError::AlreadyExists(root.to_path_buf()).into());
        }
        for dir in [BLOBS_DIR, RECIPES_DIR, SNAPSHOTS_DIR, TMP_DIR] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Opens an existing repository, verifying the layout is present.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [BLOBS_DIR, RECIPES_DIR, SNAPSHOTS_DIR, TMP_DIR] {
            if !root.join(dir).is_dir() {
                return Err(RepoError::NotInitialized(root.to_path_buf()).into());
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn tmp_path(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    pub(crate) fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join(BLOBS_DIR).join(hash)
    }

    fn recipe_path(&self, hash: &str) -> PathBuf {
        self.root.join(RECIPES_DIR).join(format!("{hash}.recipe"))
    }

    fn snapshot_path(&self, id: u32) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(id.to_string())
    }

    // ─── Blobs & recipes ────────────────────────────────────────────────────

    /// True iff the literal blob file exists (as opposed to being
    /// reconstructable from a recipe).
    pub fn has_raw_blob(&self, hash: &str) -> bool {
        self.blob_path(hash).is_file()
    }

    /// True iff the blob exists, stored raw or recipe-reconstructed.
    pub fn has_blob(&self, hash: &str) -> bool {
        self.has_raw_blob(hash) || self.recipe_path(hash).is_file()
    }

    /// Loads and validates the recipe for `hash`, if one exists.
    pub fn get_recipe(&self, hash: &str) -> Result<Option<Recipe>> {
        let path = self.recipe_path(hash);
        if !path.is_file() {
            return Ok(None);
        }
        let recipe: Recipe = jsonio::read_json(&path)?;
        if recipe.md5sum != hash {
            return Err(RepoError::RecipeInvalid {
                hash: hash.to_string(),
                message: format!("descriptor names {}", recipe.md5sum),
            }
            .into());
        }
        recipe.validate()?;
        Ok(Some(recipe))
    }

    /// Size of the blob in bytes. For recipe-backed blobs this comes from
    /// the descriptor; the blob is never materialised.
    pub fn get_blob_size(&self, hash: &str) -> Result<u64> {
        let raw = self.blob_path(hash);
        if raw.is_file() {
            return Ok(raw.metadata()?.len());
        }
        match self.get_recipe(hash)? {
            Some(recipe) => Ok(recipe.size),
            None => Err(RepoError::BlobMissing(hash.to_string()).into()),
        }
    }

    /// Returns a lazy byte source over `[offset, offset + size)` of the
    /// reconstructed blob content. `size == None` means "to end". For
    /// recipe-backed blobs the read is stitched across piece boundaries
    /// without loading the whole blob.
    pub fn get_blob_reader(&self, hash: &str, offset: u64, size: Option<u64>) -> Result<BlobReader> {
        let total = self.get_blob_size(hash)?;
        let end = match size {
            None => total,
            Some(len) => offset
                .checked_add(len)
                .filter(|&e| e <= total)
                .ok_or_else(|| RepoError::RangeOutOfBounds {
                    hash: hash.to_string(),
                    size: total,
                    offset,
                })?,
        };
        if offset > total {
            return Err(RepoError::RangeOutOfBounds {
                hash: hash.to_string(),
                size: total,
                offset,
            }
            .into());
        }

        let mut segments = Vec::new();
        if self.has_raw_blob(hash) {
            if end > offset {
                segments.push(Segment {
                    path: self.blob_path(hash),
                    start: offset,
                    length: end - offset,
                });
            }
        } else if let Some(recipe) = self.get_recipe(hash)? {
            for piece in &recipe.pieces {
                let piece_end = piece.offset + piece.length;
                let lo = offset.max(piece.offset);
                let hi = end.min(piece_end);
                if lo >= hi {
                    continue;
                }
                // Only first-level recipes: the source must be a raw blob.
                if !self.has_raw_blob(&piece.source) {
                    if self.has_blob(&piece.source) {
                        return Err(RepoError::RecipeDepth {
                            recipe: hash.to_string(),
                            source_hash: piece.source.clone(),
                        }
                        .into());
                    }
                    return Err(RepoError::BlobMissing(piece.source.clone()).into());
                }
                segments.push(Segment {
                    path: self.blob_path(&piece.source),
                    start: lo - piece.offset,
                    length: hi - lo,
                });
            }
        } else {
            return Err(RepoError::BlobMissing(hash.to_string()).into());
        }

        Ok(BlobReader {
            segments: segments.into_iter(),
            current: None,
        })
    }

    /// Recomputes the MD5 of the reconstructed content and compares it with
    /// the blob's name.
    pub fn verify_blob(&self, hash: &str) -> Result<bool> {
        let mut reader = self.get_blob_reader(hash, 0, None)?;
        let mut summer = checksum::Md5Summer::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            summer.update(&buf[..n]);
        }
        Ok(summer.hexdigest() == hash)
    }

    /// All blob names present in the repository, raw and recipe-backed,
    /// sorted and deduplicated.
    pub fn get_blob_names(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for entry in std::fs::read_dir(self.root.join(BLOBS_DIR))? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if is_md5sum(&name) {
                names.insert(name);
            }
        }
        for entry in std::fs::read_dir(self.root.join(RECIPES_DIR))? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".recipe") {
                if is_md5sum(stem) {
                    names.insert(stem.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    // ─── Snapshots & sessions ───────────────────────────────────────────────

    /// All snapshot ids in the repository, ascending.
    pub fn get_all_sessions(&self) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(self.root.join(SNAPSHOTS_DIR))? {
            let name = entry?.file_name();
            if let Ok(id) = name.to_string_lossy().parse::<u32>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn has_snapshot(&self, id: u32) -> bool {
        self.snapshot_path(id).is_dir()
    }

    /// Opens a reader for the given snapshot.
    pub fn get_session(&self, id: u32) -> Result<SessionReader> {
        let path = self.snapshot_path(id);
        if !path.is_dir() {
            return Err(RepoError::SnapshotNotFound(id).into());
        }
        SessionReader::open(self.clone(), path)
    }

    /// Greatest-id snapshot committed under `name`, or None if the session
    /// does not exist.
    pub fn find_last_revision(&self, name: &str) -> Result<Option<u32>> {
        for id in self.get_all_sessions()?.into_iter().rev() {
            if self.get_session(id)?.client_data().name == name {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Starts a staged snapshot for `name`. The returned writer holds the
    /// session mutex for its entire lifetime.
    pub fn create_session(
        &self,
        name: &str,
        base_session: Option<u32>,
        forced_id: Option<u32>,
    ) -> Result<SessionWriter> {
        SessionWriter::new(self.clone(), name, base_session, forced_id)
    }

    // ─── Consolidation ──────────────────────────────────────────────────────

    /// Atomically installs a sealed staging directory as the next snapshot.
    ///
    /// Staged blobs move to `blobs/`, staged recipes to `recipes/`, then the
    /// staging directory itself is renamed to `snapshots/<id>`. All moves
    /// are same-filesystem renames; no partially installed snapshot is ever
    /// visible. On failure the staging directory is left in place for
    /// diagnosis — blobs already moved stay where they are, a harmless
    /// orphan until a sweep collects them.
    pub fn consolidate_snapshot(&self, staging_path: &Path, forced_id: Option<u32>) -> Result<u32> {
        if !staging_path.is_dir() {
            return Err(RepoError::StagingMissing(staging_path.to_path_buf()).into());
        }
        let mut mutex = FileMutex::new(&self.tmp_path(), REPO_MUTEX_NAME);
        mutex.lock_with_timeout(CONSOLIDATE_LOCK_TIMEOUT)?;
        let result = self.consolidate_locked(staging_path, forced_id);
        mutex.release();
        result
    }

    fn consolidate_locked(&self, staging_path: &Path, forced_id: Option<u32>) -> Result<u32> {
        let id = match forced_id {
            Some(0) => return Err(RepoError::InvalidSnapshotId(0).into()),
            Some(id) if self.has_snapshot(id) => {
                return Err(RepoError::SnapshotExists(id).into());
            }
            Some(id) => id,
            None => self.get_all_sessions()?.last().copied().unwrap_or(0) + 1,
        };

        for entry in std::fs::read_dir(staging_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_md5sum(&name) {
                let dest = self.blob_path(&name);
                if dest.exists() {
                    return Err(RepoError::BlobExists(name).into());
                }
                std::fs::rename(entry.path(), dest)?;
            } else if let Some(stem) = name.strip_suffix(".recipe") {
                if is_md5sum(stem) {
                    let dest = self.recipe_path(stem);
                    if dest.exists() {
                        return Err(RepoError::RecipeExists(stem.to_string()).into());
                    }
                    std::fs::rename(entry.path(), dest)?;
                }
            }
        }

        let snapshot_dir = self.snapshot_path(id);
        std::fs::rename(staging_path, &snapshot_dir)?;
        tracing::debug!(id, path = %snapshot_dir.display(), "snapshot installed");
        Ok(id)
    }
}

/// One contiguous byte range of a file on disk.
#[derive(Debug)]
struct Segment {
    path: PathBuf,
    start: u64,
    length: u64,
}

/// Lazy byte source over reconstructed blob content.
///
/// Segments are opened one at a time as reading progresses, so a read
/// stitched across many recipe pieces holds at most one file handle.
#[derive(Debug)]
pub struct BlobReader {
    segments: std::vec::IntoIter<Segment>,
    current: Option<std::io::Take<File>>,
}

impl BlobReader {
    /// Reads the remaining content into a vector. Test and small-file
    /// convenience; streaming callers use the `Read` impl directly.
    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.current.is_none() {
                match self.segments.next() {
                    None => return Ok(0),
                    Some(seg) => {
                        let mut file = File::open(&seg.path)?;
                        file.seek(SeekFrom::Start(seg.start))?;
                        self.current = Some(file.take(seg.length));
                    }
                }
            }
            if let Some(reader) = self.current.as_mut() {
                let n = reader.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
        }
    }
}
