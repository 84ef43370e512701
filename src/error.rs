//! # Error Types
//!
//! Defines a structured error hierarchy for the snapshot repository using
//! `thiserror`. Each error variant carries enough context for meaningful
//! diagnostics without exposing internal implementation details to the caller.
//!
//! The hierarchy follows the semantic taxonomy of the system: caller-caused
//! conditions (`UserError`), concurrency conflicts that are safe to retry
//! after release (`LockError`, parts of `WriterError`), storage and integrity
//! failures (`RepoError`), staging/commit failures (`WriterError`), and
//! wire-protocol violations that terminate the connection (`ProtocolError`).

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type encompassing all failure modes in the repository.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("user error: {0}")]
    User(#[from] UserError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("snapshot writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Caller-caused conditions that surface to the UI rather than indicating a
/// malfunction in the repository itself.
#[derive(Error, Debug)]
pub enum UserError {
    #[error("no such session: {0}")]
    SessionNotFound(String),

    #[error("there already exists a session named '{0}'")]
    SessionExists(String),

    #[error("session names must not begin with double underscores: {0}")]
    ReservedName(String),

    #[error("session name must not be empty")]
    EmptySessionName,

    #[error("invalid filename '{filename}': {reason}")]
    InvalidFilename {
        filename: String,
        reason: &'static str,
    },

    #[error("not a valid lowercase md5 hex digest: {0:?}")]
    InvalidHash(String),

    #[error("there already exists an active new snapshot")]
    SnapshotInProgress,

    #[error("there is no active snapshot")]
    NoSnapshotInProgress,

    #[error("invalid session property name: {0}")]
    InvalidSessionProperty(String),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
}

/// Failure to acquire a named session mutex. Retrying after the holder
/// releases is safe.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("mutex '{name}' was already locked (lock dir: {path})")]
    Locked { name: String, path: PathBuf },

    #[error("timed out after {seconds}s waiting for mutex '{name}'")]
    Timeout { name: String, seconds: u64 },
}

/// Repository structure, storage, and integrity errors.
#[derive(Error, Debug)]
pub enum RepoError {
    #[error("repository not initialized at {0}")]
    NotInitialized(PathBuf),

    #[error("repository already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("blob already exists in the repository: {0}")]
    BlobExists(String),

    #[error("no such blob: {0}")]
    BlobMissing(String),

    #[error("recipe already exists: {0}")]
    RecipeExists(String),

    #[error("snapshot id {0} is already taken")]
    SnapshotExists(u32),

    #[error("no such snapshot: {0}")]
    SnapshotNotFound(u32),

    #[error("snapshot ids must be positive, got {0}")]
    InvalidSnapshotId(u32),

    #[error("staging directory missing: {0}")]
    StagingMissing(PathBuf),

    #[error(
        "recipe {recipe} references recipe-backed blob {source_hash}: only raw blobs may be sources"
    )]
    RecipeDepth { recipe: String, source_hash: String },

    #[error("recipe for {hash} is inconsistent: {message}")]
    RecipeInvalid { hash: String, message: String },

    #[error("blob {hash} failed verification: content hashes to {actual}")]
    ChecksumMismatch { hash: String, actual: String },

    #[error("read past end of blob {hash} (size {size}, wanted offset {offset})")]
    RangeOutOfBounds { hash: String, size: u64, offset: u64 },

    #[error("corrupted repository: {message}")]
    Corrupted { message: String },
}

/// Errors raised while staging or committing a snapshot. All of these are
/// non-recovering for the writer instance.
#[derive(Error, Debug)]
pub enum WriterError {
    #[error("corrupted blob in staging: {hash} hashes to {actual}, commit aborted")]
    CorruptedStaging { hash: String, actual: String },

    #[error("committed session name '{actual}' did not match expected name '{expected}'")]
    NameMismatch { expected: String, actual: String },

    #[error("session '{0}' has been updated concurrently, commit aborted")]
    ConcurrentModification(String),

    #[error("blob already exists in the repository: {0}")]
    BlobAlreadyStored(String),

    #[error("file '{0}' has already been added to this snapshot")]
    DuplicateFilename(String),

    #[error("no such blob in the repository or staging area: {0}")]
    UnknownBlob(String),

    #[error("entry for '{0}' carries no checksum")]
    MissingChecksum(String),

    #[error("cannot remove without a base session")]
    NoBaseSession,

    #[error("cannot remove '{0}': not present in the base session")]
    NotInBase(String),

    #[error("cut list must not be empty")]
    EmptyCuts,

    #[error("duplicate entry in cut list: {0}")]
    DuplicateCut(u64),

    #[error("cut {cut} out of range for blob of size {size}")]
    CutOutOfRange { cut: u64, size: u64 },

    #[error("copied piece {hash} did not have the expected checksum (got {actual})")]
    CorruptedCopy { hash: String, actual: String },

    #[error("cannot split blob {0}: it is recipe-backed and splitting needs the raw file")]
    SplitRecipeBacked(String),

    #[error("cloning of recipe-backed blobs is not supported: {0}")]
    CloneUnsupported(String),
}

/// RPC framing or JSON-RPC malformedness. Terminates the connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("bad frame magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported frame version: {0}")]
    BadVersion(u32),

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("binary payload flag must be 0 or 1, got {0}")]
    BadBinaryFlag(u8),

    #[error("request declared a binary payload; uploads are not accepted")]
    UnexpectedUpload,

    #[error("notifications are not accepted: every request must carry an id")]
    NotificationRejected,

    #[error("malformed json-rpc payload: {0}")]
    MalformedPayload(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;
