//! # Front Facade
//!
//! [`Front`] is the public API of the repository. All interaction goes
//! through this interface, and its arguments and return values are primitive
//! and serializable, which is what lets the RPC layer expose it without any
//! per-method marshalling cleverness.
//!
//! A front holds at most one snapshot under construction at a time. It also
//! owns the repository's hidden per-session metadata: ignore/include lists
//! are stored as ordinary files inside a `__meta_<name>` session, which is
//! why session names beginning with `__` are reserved and rejected at
//! [`Front::mksession`].

use crate::bloblist::FileEntry;
use crate::checksum::md5_hex;
use crate::error::{RepoError, Result, UserError, VaultError};
use crate::reader::ClientData;
use crate::repo::{BlobReader, Repository};
use crate::writer::SessionWriter;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use std::io::Read;
use std::path::Path;

/// Session properties that may be persisted in a meta session.
const VALID_SESSION_PROPS: &[&str] = &["ignore", "include"];

/// Prefix of the hidden metadata session belonging to a named session.
const META_PREFIX: &str = "__meta_";

/// How many blobs one `verify_some_blobs` call checks at most.
const VERIFY_BATCH: usize = 100;

/// The public API surface over a repository.
pub struct Front {
    repo: Repository,
    new_session: Option<SessionWriter>,
    blobs_to_verify: Vec<String>,
}

impl Front {
    pub fn new(repo: Repository) -> Self {
        Self {
            repo,
            new_session: None,
            blobs_to_verify: Vec::new(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        self.repo.root()
    }

    // ─── Session queries ────────────────────────────────────────────────────

    /// All snapshot ids, optionally filtered to one session name.
    pub fn get_session_ids(&self, session_name: Option<&str>) -> Result<Vec<u32>> {
        let ids = self.repo.get_all_sessions()?;
        match session_name {
            None => Ok(ids),
            Some(name) => {
                let mut result = Vec::new();
                for id in ids {
                    if self.repo.get_session(id)?.client_data().name == name {
                        result.push(id);
                    }
                }
                Ok(result)
            }
        }
    }

    /// Client data of a snapshot, or None if there is no such snapshot.
    pub fn get_session_info(&self, id: u32) -> Result<Option<ClientData>> {
        if !self.repo.has_snapshot(id) {
            return Ok(None);
        }
        Ok(Some(self.repo.get_session(id)?.client_data().clone()))
    }

    pub fn get_session_fingerprint(&self, id: u32) -> Result<String> {
        Ok(self.repo.get_session(id)?.fingerprint().to_string())
    }

    /// The effective bloblist of a snapshot.
    pub fn get_session_bloblist(&self, id: u32) -> Result<Vec<FileEntry>> {
        self.repo
            .get_session(id)?
            .effective_bloblist()?
            .collect::<Result<Vec<_>>>()
    }

    /// True iff snapshot `id` exists and belongs to session `session_name`.
    pub fn has_snapshot(&self, session_name: &str, id: u32) -> Result<bool> {
        if !self.repo.has_snapshot(id) {
            return Ok(false);
        }
        Ok(self.repo.get_session(id)?.client_data().name == session_name)
    }

    /// Id of the latest snapshot in the session, or None if the session
    /// does not exist.
    pub fn find_last_revision(&self, session_name: &str) -> Result<Option<u32>> {
        self.repo.find_last_revision(session_name)
    }

    // ─── Snapshot construction ──────────────────────────────────────────────

    /// Starts a new snapshot for the given session.
    pub fn create_session(&mut self, session_name: &str, base_session: Option<u32>) -> Result<()> {
        if self.new_session.is_some() {
            return Err(UserError::SnapshotInProgress.into());
        }
        self.new_session = Some(self.repo.create_session(session_name, base_session, None)?);
        Ok(())
    }

    fn active_session(&mut self) -> Result<&mut SessionWriter> {
        self.new_session
            .as_mut()
            .ok_or_else(|| UserError::NoSnapshotInProgress.into())
    }

    /// Appends raw data to a staged blob. Must follow `create_session`.
    pub fn add_blob_data(&mut self, hash: &str, data: &[u8]) -> Result<()> {
        self.active_session()?.add_blob_data(hash, data)
    }

    /// Base64 variant of [`Front::add_blob_data`], the RPC upload path.
    pub fn add_blob_data_b64(&mut self, hash: &str, b64data: &str) -> Result<()> {
        let data = BASE64
            .decode(b64data)
            .map_err(|e| UserError::InvalidBase64(e.to_string()))?;
        self.add_blob_data(hash, &data)
    }

    /// Records a link to an existing blob in the snapshot under construction.
    pub fn add(&mut self, metadata: FileEntry) -> Result<()> {
        self.active_session()?.add(metadata)
    }

    /// Removes a file inherited from the base snapshot.
    pub fn remove(&mut self, filename: &str) -> Result<()> {
        self.active_session()?.remove(filename)
    }

    /// Commits the snapshot under construction, returning its id.
    pub fn commit(&mut self, sessioninfo: Option<ClientData>) -> Result<u32> {
        let writer = self
            .new_session
            .take()
            .ok_or(UserError::NoSnapshotInProgress)?;
        writer.commit(sessioninfo)
    }

    /// Creates a new named session with an empty initial snapshot. This is
    /// the public entry point, and the only place reserved names are minted:
    /// anything beginning with `__` is refused here.
    pub fn mksession(&mut self, session_name: &str) -> Result<u32> {
        if session_name.starts_with("__") {
            return Err(UserError::ReservedName(session_name.to_string()).into());
        }
        self.mksession_inner(session_name)
    }

    fn mksession_inner(&mut self, session_name: &str) -> Result<u32> {
        if self.find_last_revision(session_name)?.is_some() {
            return Err(UserError::SessionExists(session_name.to_string()).into());
        }
        self.create_session(session_name, None)?;
        let now = chrono::Local::now();
        let mut info = ClientData::named(session_name);
        info.extra.insert("timestamp".to_string(), json!(now.timestamp()));
        info.extra.insert(
            "date".to_string(),
            json!(now.format("%a %b %e %H:%M:%S %Y").to_string()),
        );
        self.commit(Some(info))
    }

    // ─── Blob access ────────────────────────────────────────────────────────

    /// True iff the blob exists in the repository or in the snapshot
    /// currently under construction.
    pub fn has_blob(&self, hash: &str) -> bool {
        if self.repo.has_blob(hash) {
            return true;
        }
        self.new_session
            .as_ref()
            .is_some_and(|writer| writer.has_blob(hash))
    }

    pub fn get_blob_size(&self, hash: &str) -> Result<u64> {
        self.repo.get_blob_size(hash)
    }

    /// Lazy reader over `[offset, offset + size)` of a blob; `size == None`
    /// means "to end".
    pub fn get_blob(&self, hash: &str, offset: u64, size: Option<u64>) -> Result<BlobReader> {
        self.repo.get_blob_reader(hash, offset, size)
    }

    // ─── Verification sweep ─────────────────────────────────────────────────

    /// Collects the set of blobs to verify. Returns how many there are.
    pub fn init_verify_blobs(&mut self) -> Result<usize> {
        self.blobs_to_verify = self.repo.get_blob_names()?;
        Ok(self.blobs_to_verify.len())
    }

    /// Verifies up to 100 pending blobs, returning the ones that passed.
    /// A verification failure is fatal and never suppressed.
    pub fn verify_some_blobs(&mut self) -> Result<Vec<String>> {
        let mut succeeded = Vec::new();
        let count = VERIFY_BATCH.min(self.blobs_to_verify.len());
        for _ in 0..count {
            let hash = match self.blobs_to_verify.pop() {
                Some(hash) => hash,
                None => break,
            };
            if !self.repo.verify_blob(&hash)? {
                return Err(RepoError::Corrupted {
                    message: format!("blob failed verification: {hash}"),
                }
                .into());
            }
            succeeded.push(hash);
        }
        Ok(succeeded)
    }

    // ─── Convenience file I/O ───────────────────────────────────────────────

    /// Full contents of a named file from the latest revision of a session.
    /// Only for files known to be of reasonable size. Errors if the session
    /// does not exist; None if it has no such file.
    pub fn get_file_contents(
        &self,
        session_name: &str,
        file_name: &str,
    ) -> Result<Option<Vec<u8>>> {
        let rev = self
            .find_last_revision(session_name)?
            .ok_or_else(|| UserError::SessionNotFound(session_name.to_string()))?;
        for entry in self.get_session_bloblist(rev)? {
            if entry.filename == file_name {
                let hash = entry
                    .md5sum
                    .as_deref()
                    .ok_or_else(|| RepoError::Corrupted {
                        message: format!("effective entry without checksum: {file_name}"),
                    })?;
                let mut data = Vec::new();
                self.get_blob(hash, 0, None)?.read_to_end(&mut data)?;
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    /// Creates a new snapshot replacing (or creating) one file in the
    /// session. Does nothing when the contents are already current.
    pub fn set_file_contents(
        &mut self,
        session_name: &str,
        filename: &str,
        contents: &[u8],
    ) -> Result<()> {
        if self.get_file_contents(session_name, filename)?.as_deref() == Some(contents) {
            return Ok(());
        }
        let rev = self.find_last_revision(session_name)?;
        self.create_session(session_name, rev)?;
        self.add_file_simple(filename, contents)?;
        let now = chrono::Local::now();
        let mut info = ClientData::named(session_name);
        info.extra.insert(
            "date".to_string(),
            json!(now.format("%a %b %e %H:%M:%S %Y").to_string()),
        );
        self.commit(Some(info))?;
        Ok(())
    }

    /// Adds one file with the given contents to the snapshot under
    /// construction, stamping ctime/mtime/size.
    pub fn add_file_simple(&mut self, filename: &str, contents: &[u8]) -> Result<()> {
        let hash = md5_hex(contents);
        if !self.has_blob(&hash) {
            self.add_blob_data(&hash, contents)?;
        }
        let now = chrono::Local::now().timestamp();
        self.add(
            FileEntry::new(filename, hash)
                .with_field("ctime", now)
                .with_field("mtime", now)
                .with_field("size", contents.len() as u64),
        )
    }

    // ─── Per-session properties (ignore/include lists) ──────────────────────

    fn set_session_property(
        &mut self,
        session_name: &str,
        property_name: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        if !VALID_SESSION_PROPS.contains(&property_name) {
            return Err(UserError::InvalidSessionProperty(property_name.to_string()).into());
        }
        let meta_session = format!("{META_PREFIX}{session_name}");
        if self.find_last_revision(&meta_session)?.is_none() {
            self.mksession_inner(&meta_session)?;
        }
        let value_string = crate::jsonio::to_json_string(value)?;
        self.set_file_contents(
            &meta_session,
            &format!("{property_name}.json"),
            value_string.as_bytes(),
        )
    }

    fn get_session_property(
        &self,
        session_name: &str,
        property_name: &str,
    ) -> Result<Option<serde_json::Value>> {
        if !VALID_SESSION_PROPS.contains(&property_name) {
            return Err(UserError::InvalidSessionProperty(property_name.to_string()).into());
        }
        let meta_session = format!("{META_PREFIX}{session_name}");
        let contents = match self.get_file_contents(&meta_session, &format!("{property_name}.json"))
        {
            Ok(contents) => contents,
            Err(VaultError::User(UserError::SessionNotFound(_))) => return Ok(None),
            Err(e) => return Err(e),
        };
        match contents {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                anyhow::anyhow!("malformed session property {property_name}: {e}")
            })?)),
        }
    }

    pub fn set_session_ignore_list(&mut self, session_name: &str, list: &[String]) -> Result<()> {
        self.set_session_property(session_name, "ignore", &json!(list))
    }

    pub fn get_session_ignore_list(&self, session_name: &str) -> Result<Vec<String>> {
        self.get_string_list_property(session_name, "ignore")
    }

    pub fn set_session_include_list(&mut self, session_name: &str, list: &[String]) -> Result<()> {
        self.set_session_property(session_name, "include", &json!(list))
    }

    pub fn get_session_include_list(&self, session_name: &str) -> Result<Vec<String>> {
        self.get_string_list_property(session_name, "include")
    }

    fn get_string_list_property(&self, session_name: &str, prop: &str) -> Result<Vec<String>> {
        match self.get_session_property(session_name, prop)? {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| anyhow::anyhow!("malformed {prop} list: {e}").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_front(dir: &Path) -> Front {
        Front::new(Repository::create(&dir.join("repo")).unwrap())
    }

    #[test]
    fn mksession_creates_an_empty_initial_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut front = new_front(dir.path());

        let id = front.mksession("docs").unwrap();
        assert_eq!(id, 1);
        assert_eq!(front.find_last_revision("docs").unwrap(), Some(1));

        let info = front.get_session_info(1).unwrap().unwrap();
        assert_eq!(info.name, "docs");
        assert!(info.extra.contains_key("timestamp"));
        assert!(info.extra.contains_key("date"));
        assert!(front.get_session_bloblist(1).unwrap().is_empty());
    }

    #[test]
    fn mksession_rejects_reserved_and_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut front = new_front(dir.path());

        assert!(matches!(
            front.mksession("__internal").unwrap_err(),
            VaultError::User(UserError::ReservedName(_))
        ));
        front.mksession("docs").unwrap();
        assert!(matches!(
            front.mksession("docs").unwrap_err(),
            VaultError::User(UserError::SessionExists(_))
        ));
    }

    #[test]
    fn snapshot_lifecycle_through_the_front() {
        let dir = tempfile::tempdir().unwrap();
        let mut front = new_front(dir.path());

        front.create_session("work", None).unwrap();
        assert!(matches!(
            front.create_session("other", None).unwrap_err(),
            VaultError::User(UserError::SnapshotInProgress)
        ));

        let data = b"payload bytes";
        let hash = md5_hex(data);
        let encoded = BASE64.encode(data);
        front.add_blob_data_b64(&hash, &encoded).unwrap();
        assert!(front.has_blob(&hash), "staged blob visible before commit");

        front.add(FileEntry::new("file.bin", hash.clone())).unwrap();
        let id = front.commit(Some(ClientData::named("work"))).unwrap();

        assert!(front.has_snapshot("work", id).unwrap());
        assert!(!front.has_snapshot("other", id).unwrap());
        assert_eq!(front.get_session_ids(Some("work")).unwrap(), vec![id]);
        assert_eq!(front.get_blob_size(&hash).unwrap(), data.len() as u64);

        let mut out = Vec::new();
        front.get_blob(&hash, 0, None).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        assert!(matches!(
            front.commit(None).unwrap_err(),
            VaultError::User(UserError::NoSnapshotInProgress)
        ));
    }

    #[test]
    fn bad_base64_is_a_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut front = new_front(dir.path());
        front.create_session("work", None).unwrap();
        assert!(matches!(
            front
                .add_blob_data_b64("d41d8cd98f00b204e9800998ecf8427e", "!!!")
                .unwrap_err(),
            VaultError::User(UserError::InvalidBase64(_))
        ));
    }

    #[test]
    fn file_contents_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut front = new_front(dir.path());
        front.mksession("notes").unwrap();

        front.set_file_contents("notes", "todo.txt", b"ship it").unwrap();
        assert_eq!(
            front.get_file_contents("notes", "todo.txt").unwrap().unwrap(),
            b"ship it"
        );
        assert_eq!(front.get_file_contents("notes", "other.txt").unwrap(), None);
        assert!(matches!(
            front.get_file_contents("missing", "x").unwrap_err(),
            VaultError::User(UserError::SessionNotFound(_))
        ));

        // Unchanged contents commit nothing new.
        let before = front.get_session_ids(Some("notes")).unwrap().len();
        front.set_file_contents("notes", "todo.txt", b"ship it").unwrap();
        assert_eq!(front.get_session_ids(Some("notes")).unwrap().len(), before);

        // Changed contents do.
        front.set_file_contents("notes", "todo.txt", b"shipped").unwrap();
        assert_eq!(
            front.get_file_contents("notes", "todo.txt").unwrap().unwrap(),
            b"shipped"
        );
        assert_eq!(front.get_session_ids(Some("notes")).unwrap().len(), before + 1);
    }

    #[test]
    fn ignore_and_include_lists_persist_in_meta_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut front = new_front(dir.path());
        front.mksession("photos").unwrap();

        assert!(front.get_session_ignore_list("photos").unwrap().is_empty());
        front
            .set_session_ignore_list("photos", &["*.tmp".to_string(), "cache/".to_string()])
            .unwrap();
        assert_eq!(
            front.get_session_ignore_list("photos").unwrap(),
            vec!["*.tmp".to_string(), "cache/".to_string()]
        );

        front
            .set_session_include_list("photos", &["raw/".to_string()])
            .unwrap();
        assert_eq!(
            front.get_session_include_list("photos").unwrap(),
            vec!["raw/".to_string()]
        );

        // The lists live in a hidden session.
        assert!(front.find_last_revision("__meta_photos").unwrap().is_some());

        // Updating replaces, not appends.
        front.set_session_ignore_list("photos", &[]).unwrap();
        assert!(front.get_session_ignore_list("photos").unwrap().is_empty());
    }

    #[test]
    fn verification_sweep_walks_all_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut front = new_front(dir.path());
        front.mksession("data").unwrap();
        front.set_file_contents("data", "a.txt", b"alpha").unwrap();
        front.set_file_contents("data", "b.txt", b"beta").unwrap();

        let total = front.init_verify_blobs().unwrap();
        assert!(total >= 2);
        let mut verified = 0;
        loop {
            let batch = front.verify_some_blobs().unwrap();
            if batch.is_empty() {
                break;
            }
            verified += batch.len();
        }
        assert_eq!(verified, total);
    }

    #[test]
    fn verification_fails_loudly_on_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut front = new_front(dir.path());
        front.mksession("data").unwrap();
        front.set_file_contents("data", "a.txt", b"alpha").unwrap();

        let hash = md5_hex(b"alpha");
        let repo = Repository::open(&dir.path().join("repo")).unwrap();
        std::fs::write(repo.blob_path(&hash), b"tampered").unwrap();

        front.init_verify_blobs().unwrap();
        let mut saw_error = false;
        loop {
            match front.verify_some_blobs() {
                Ok(batch) if batch.is_empty() => break,
                Ok(_) => continue,
                Err(e) => {
                    assert!(matches!(e, VaultError::Repo(RepoError::Corrupted { .. })));
                    saw_error = true;
                    break;
                }
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn missing_snapshot_info_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let front = new_front(dir.path());
        assert_eq!(front.get_session_info(42).unwrap(), None);
    }
}
