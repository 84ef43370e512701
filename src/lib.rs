//! # snapvault
//!
//! A content-addressed snapshot repository: immutable versions ("snapshots")
//! of a directory-like logical tree, stored as deduplicated binary blobs plus
//! metadata. Snapshots form named, linearly-extending histories ("sessions");
//! each snapshot may reference an earlier one as its base, inheriting its
//! tree and overriding entries by addition, replacement, or removal.
//!
//! ## Architecture
//!
//! ```text
//!        ┌───────────────┐      ┌────────────────┐
//!        │  CLI (clap)   │      │  RPC server    │
//!        └──────┬────────┘      └──────┬─────────┘
//!               │                      │ framed JSON-RPC
//!               ▼                      ▼
//!            ┌─────────────────────────────┐
//!            │           Front             │  public facade
//!            └─────┬────────────────┬──────┘
//!                  ▼                ▼
//!         ┌───────────────┐  ┌──────────────┐
//!         │ SessionWriter │  │ SessionReader│
//!         │ (staging +    │  │ (effective-  │
//!         │  commit)      │  │  tree walk)  │
//!         └──────┬────────┘  └──────┬───────┘
//!                │                  │
//!                ▼                  ▼
//!            ┌─────────────────────────┐
//!            │       Repository        │  blobs / recipes /
//!            │  (atomic consolidation) │  snapshots / tmp
//!            └─────────────────────────┘
//! ```
//!
//! ## On-disk contract
//!
//! Blobs are named by the lowercase MD5 hex of their content and are stored
//! once. A blob may instead be described by a *recipe* concatenating byte
//! ranges of other blobs. Each snapshot directory carries its own bloblist,
//! its session properties, a checksum seal over both, and a fingerprint
//! marker summarizing the effective tree. Everything installed is immutable.

pub mod bloblist;
pub mod checksum;
pub mod config;
pub mod error;
pub mod front;
pub mod jsonio;
pub mod mutex;
pub mod reader;
pub mod recipe;
pub mod repo;
pub mod server;
pub mod transport;
pub mod writer;

pub use error::{Result, VaultError};
pub use front::Front;
pub use repo::Repository;
