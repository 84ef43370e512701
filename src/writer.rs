//! # Snapshot Writer
//!
//! A [`SessionWriter`] is a staged, crash-safe transaction that produces one
//! new snapshot. Construction acquires the session's file mutex and creates
//! a scratch directory under `tmp/`; staging operations accumulate blobs and
//! metadata there; `commit` seals the directory and hands it to the
//! repository for atomic install.
//!
//! A writer is single-use. `commit` consumes it, and every exit path —
//! success, failure, abandonment — releases the session mutex. An abandoned
//! staging directory is harmless: it lives under `tmp/` and never becomes
//! visible as a snapshot.

use crate::bloblist::{bloblist_fingerprint, validate_content_entry, FileEntry};
use crate::checksum::{
    copy_file_range_verified, md5_file, md5_file_range, require_md5sum, Md5Summer,
};
use crate::error::{RepoError, Result, UserError, WriterError};
use crate::jsonio;
use crate::mutex::FileMutex;
use crate::reader::{
    ClientData, SessionProperties, SessionReader, BLOBLIST_FILE, SESSION_FILE, SESSION_MD5_FILE,
};
use crate::recipe::{Recipe, RecipeMethod, RecipePiece};
use crate::repo::Repository;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

/// Chunk size used when streaming blobs during a clone.
const CLONE_CHUNK: usize = 1024 * 1024;

/// Staged construction of one new snapshot in a session.
#[derive(Debug)]
pub struct SessionWriter {
    repo: Repository,
    session_name: String,
    base_session: Option<u32>,
    forced_session_id: Option<u32>,
    session_path: PathBuf,
    mutex: FileMutex,

    /// Head of the session at construction time; re-checked at commit to
    /// detect concurrent writers that slipped past the mutex.
    latest_snapshot: Option<u32>,

    /// Entries introduced by this snapshot, keyed by filename.
    metadatas: BTreeMap<String, FileEntry>,

    /// The prospective effective tree: base tree plus this snapshot's
    /// overrides. Source of the commit fingerprint.
    resulting: BTreeMap<String, FileEntry>,

    /// The base snapshot's effective tree, untouched by overrides.
    base_tree: BTreeMap<String, FileEntry>,

    /// Running checksums, one per blob staged via `add_blob_data`.
    summers: HashMap<String, Md5Summer>,
}

impl SessionWriter {
    /// Acquires the session mutex and prepares a staging area.
    ///
    /// The mutex is held for the writer's entire lifetime. If it is already
    /// held, this fails with `MutexLocked` before any staging state exists.
    pub(crate) fn new(
        repo: Repository,
        session_name: &str,
        base_session: Option<u32>,
        forced_session_id: Option<u32>,
    ) -> Result<Self> {
        if session_name.is_empty() {
            return Err(UserError::EmptySessionName.into());
        }
        if forced_session_id == Some(0) {
            return Err(RepoError::InvalidSnapshotId(0).into());
        }

        let mut mutex = FileMutex::new(&repo.tmp_path(), session_name);
        mutex.lock()?;

        let mut writer = Self {
            repo,
            session_name: session_name.to_string(),
            base_session,
            forced_session_id,
            session_path: PathBuf::new(),
            mutex,
            latest_snapshot: None,
            metadatas: BTreeMap::new(),
            resulting: BTreeMap::new(),
            base_tree: BTreeMap::new(),
            summers: HashMap::new(),
        };
        if let Err(e) = writer.init() {
            writer.mutex.release();
            return Err(e);
        }
        Ok(writer)
    }

    fn init(&mut self) -> Result<()> {
        self.session_path = tempfile::Builder::new()
            .prefix("tmp_")
            .tempdir_in(self.repo.tmp_path())?
            .keep();
        self.latest_snapshot = self.repo.find_last_revision(&self.session_name)?;
        if let Some(base) = self.base_session {
            let mut reader = self.repo.get_session(base)?;
            self.base_tree = reader.effective_map()?;
            self.resulting = self.base_tree.clone();
        }
        Ok(())
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    // ─── Staging operations ─────────────────────────────────────────────────

    /// Appends `fragment` to the staged blob named `hash`, maintaining a
    /// running checksum. Callers must skip blobs the repository already
    /// contains. An empty fragment creates a zero-length staged file.
    pub fn add_blob_data(&mut self, hash: &str, fragment: &[u8]) -> Result<()> {
        let hash = require_md5sum(hash)?;
        if self.repo.has_blob(&hash) {
            return Err(WriterError::BlobAlreadyStored(hash).into());
        }
        self.summers.entry(hash.clone()).or_default().update(fragment);
        let mut file = File::options()
            .append(true)
            .create(true)
            .open(self.session_path.join(&hash))?;
        file.write_all(fragment)?;
        Ok(())
    }

    /// True iff `hash` has been staged in this writer.
    pub fn has_blob(&self, hash: &str) -> bool {
        self.session_path.join(hash).is_file()
    }

    /// Records a file entry. The referenced blob must already be in the
    /// repository or staged here, and the filename must be new to this
    /// snapshot.
    pub fn add(&mut self, meta: FileEntry) -> Result<()> {
        let hash = validate_content_entry(&meta)?;
        if !self.repo.has_blob(&hash) && !self.has_blob(&hash) {
            return Err(WriterError::UnknownBlob(hash).into());
        }
        if self.metadatas.contains_key(&meta.filename) {
            return Err(WriterError::DuplicateFilename(meta.filename).into());
        }
        self.resulting.insert(meta.filename.clone(), meta.clone());
        self.metadatas.insert(meta.filename.clone(), meta);
        Ok(())
    }

    /// Records the removal of `filename` from the inherited base tree.
    pub fn remove(&mut self, filename: &str) -> Result<()> {
        if self.base_session.is_none() {
            return Err(WriterError::NoBaseSession.into());
        }
        if !self.base_tree.contains_key(filename) {
            return Err(WriterError::NotInBase(filename.to_string()).into());
        }
        self.metadatas
            .insert(filename.to_string(), FileEntry::removal(filename));
        self.resulting.remove(filename);
        Ok(())
    }

    // ─── Blob splitting (recipe builder) ────────────────────────────────────

    /// Cuts a stored raw blob at the given positions and stages a concat
    /// recipe reassembling it from the pieces. Pieces the repository already
    /// stores (or that an earlier cut in this call produced) are not staged
    /// again. Returns the piece checksums in concatenation order.
    ///
    /// The original blob is left in place; removing redundant originals is a
    /// sweep's job, not the writer's.
    pub fn split_blob(&mut self, hash: &str, cut_positions: &[u64]) -> Result<Vec<String>> {
        let hash = require_md5sum(hash)?;
        if !self.repo.has_raw_blob(&hash) {
            if self.repo.has_blob(&hash) {
                return Err(WriterError::SplitRecipeBacked(hash).into());
            }
            return Err(RepoError::BlobMissing(hash).into());
        }
        let recipe_path = self.session_path.join(format!("{hash}.recipe"));
        if recipe_path.exists() {
            return Err(RepoError::RecipeExists(hash).into());
        }

        let source_path = self.repo.blob_path(&hash);
        let size = source_path.metadata()?.len();
        if cut_positions.is_empty() {
            return Err(WriterError::EmptyCuts.into());
        }
        let mut cuts = vec![0u64];
        for &cut in cut_positions {
            if cut == 0 || cut >= size {
                return Err(WriterError::CutOutOfRange { cut, size }.into());
            }
            if cuts.contains(&cut) {
                return Err(WriterError::DuplicateCut(cut).into());
            }
            cuts.push(cut);
        }
        cuts.push(size);
        cuts.sort_unstable();

        let mut source = File::open(&source_path)?;
        let mut pieces = Vec::new();
        let mut recipe_pieces = Vec::new();
        let mut offset = 0u64;
        for window in cuts.windows(2) {
            let (start, end) = (window[0], window[1]);
            let piece_md5 = md5_file_range(&mut source, start, end)?;
            if !self.repo.has_blob(&piece_md5) && !self.has_blob(&piece_md5) {
                copy_file_range_verified(
                    &source_path,
                    &self.session_path.join(&piece_md5),
                    start,
                    end,
                    &piece_md5,
                )?;
            }
            recipe_pieces.push(RecipePiece {
                source: piece_md5.clone(),
                offset,
                length: end - start,
            });
            offset += end - start;
            pieces.push(piece_md5);
        }

        let recipe = Recipe {
            method: RecipeMethod::Concat,
            md5sum: hash,
            size,
            pieces: recipe_pieces,
        };
        jsonio::write_json(&recipe_path, &recipe)?;
        Ok(pieces)
    }

    // ─── Commit ─────────────────────────────────────────────────────────────

    /// Seals the staging directory and atomically installs it as the next
    /// snapshot of the session. Returns the assigned id.
    ///
    /// `sessioninfo` defaults to `{name: <session>}`; if given, its name
    /// must match the session this writer was created for. The writer is
    /// consumed and the session mutex released whether or not the commit
    /// succeeds.
    pub fn commit(mut self, sessioninfo: Option<ClientData>) -> Result<u32> {
        let result = self.commit_inner(sessioninfo);
        self.mutex.release();
        result
    }

    fn commit_inner(&mut self, sessioninfo: Option<ClientData>) -> Result<u32> {
        for (hash, summer) in &self.summers {
            let actual = summer.hexdigest();
            if actual != *hash {
                return Err(WriterError::CorruptedStaging {
                    hash: hash.clone(),
                    actual,
                }
                .into());
            }
        }

        let info = sessioninfo.unwrap_or_else(|| ClientData::named(&self.session_name));
        if info.name != self.session_name {
            return Err(WriterError::NameMismatch {
                expected: self.session_name.clone(),
                actual: info.name,
            }
            .into());
        }

        let fingerprint = bloblist_fingerprint(self.resulting.values());

        let entries: Vec<&FileEntry> = self.metadatas.values().collect();
        let bloblist_path = self.session_path.join(BLOBLIST_FILE);
        jsonio::write_json(&bloblist_path, &entries)?;

        let session_path = self.session_path.join(SESSION_FILE);
        let properties = SessionProperties {
            base_session: self.base_session,
            fingerprint: fingerprint.clone(),
            client_data: info,
        };
        jsonio::write_json(&session_path, &properties)?;

        let mut md5_file_out = File::options()
            .write(true)
            .create_new(true)
            .open(self.session_path.join(SESSION_MD5_FILE))?;
        writeln!(md5_file_out, "{} *{BLOBLIST_FILE}", md5_file(&bloblist_path)?)?;
        writeln!(md5_file_out, "{} *{SESSION_FILE}", md5_file(&session_path)?)?;

        File::options()
            .write(true)
            .create_new(true)
            .open(self.session_path.join(format!("{fingerprint}.fingerprint")))?;

        // Fail-safe against lockfile problems going undetected. The mutex is
        // the primary guard; this check only makes a violation loud.
        if self.repo.find_last_revision(&self.session_name)? != self.latest_snapshot {
            return Err(WriterError::ConcurrentModification(self.session_name.clone()).into());
        }

        self.repo
            .consolidate_snapshot(&self.session_path, self.forced_session_id)
    }

    /// Bulk-copies an entire foreign snapshot: the effective tree, the raw
    /// per-snapshot bloblist (add/remove entries preserved), and the base
    /// pointer all become the other snapshot's. Missing blobs are streamed
    /// in chunks of at most 1 MiB. Sources whose blobs exist only as
    /// recipes are not supported.
    pub fn commit_clone(mut self, other: &mut SessionReader) -> Result<u32> {
        let result = self.clone_into_staging(other);
        match result {
            Ok(info) => self.commit(Some(info)),
            Err(e) => {
                self.mutex.release();
                Err(e)
            }
        }
    }

    fn clone_into_staging(&mut self, other: &mut SessionReader) -> Result<ClientData> {
        self.resulting = other.effective_map()?;
        let raw = other.raw_bloblist()?.to_vec();
        self.metadatas = raw
            .iter()
            .map(|e| (e.filename.clone(), e.clone()))
            .collect();
        self.base_session = other.base_session();
        let info = other.client_data().clone();

        let source_repo = other.repo().clone();
        for hash in raw.iter().filter_map(|e| e.md5sum.clone()) {
            if !source_repo.has_raw_blob(&hash) {
                return Err(WriterError::CloneUnsupported(hash).into());
            }
            if self.repo.has_blob(&hash) || self.has_blob(&hash) {
                continue;
            }
            // Initial zero-length append so empty blobs get staged too.
            self.add_blob_data(&hash, b"")?;
            let mut reader = source_repo.get_blob_reader(&hash, 0, None)?;
            let mut buf = vec![0u8; CLONE_CHUNK];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                self.add_blob_data(&hash, &buf[..n])?;
            }
        }
        Ok(info)
    }
}
