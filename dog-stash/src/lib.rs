//! # dog-stash: quota-enforced per-account file storage
//!
//! `dog-stash` stores files for many accounts, keeps each account under a
//! per-file and a total size ceiling, and hands back short share links.
//!
//! ## Key Features
//!
//! - **One ingest path**: buffered, chunked-stream, persistent-socket and
//!   resumable uploads all drive the same admit/write/record/commit sequence
//! - **Exact accounting**: `bytes_used` is recomputed from the file catalog on
//!   every upload and delete, so it always equals the sum of stored sizes
//! - **No half-written files**: failed or rejected uploads leave no blob, no
//!   record and no charge
//! - **Per-account serialization**: concurrent uploads to one account cannot
//!   jointly overrun its quota; different accounts never wait on each other
//! - **Batch expiry**: delete everything, or everything older than a window,
//!   with one usage reconciliation per batch
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_stash::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> StashResult<()> {
//! let stash = StashAdapter::in_memory(StashConfig::default());
//! let alice = AccountId::from("alice");
//!
//! let file = stash
//!     .upload_one(&alice, "hello.txt", bytes::Bytes::from_static(b"Hello, world!"))
//!     .await?;
//!
//! let (data, record) = stash.get_file(&FileLookup::Public, &file.file_id).await?;
//! assert_eq!(&data[..], b"Hello, world!");
//! assert_eq!(record.download_count, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │         StashAdapter         │  ← what services embed
//! ├──────────────────────────────┤
//! │ IngestSession · ExpiryReaper │  ← per-account locked mutations
//! ├──────────────┬───────────────┤
//! │  UsageLedger │ RecordCatalog │  ← counters / metadata
//! ├──────────────┴───────────────┤
//! │          BlobStore           │  ← bytes
//! └──────────────────────────────┘
//! ```
//!
//! Persistence sits behind traits ([`BlobStore`], [`RecordCatalog`],
//! [`AccountStore`]); in-memory and filesystem implementations ship with the
//! crate.

mod account;
pub mod adapter;
mod cache;
mod catalog;
mod config;
mod error;
mod fs_store;
mod ingest;
mod ledger;
mod locks;
mod memory_store;
mod reaper;
mod resumable;
mod shared;
mod socket;
pub mod source;
pub mod store;
mod types;

#[cfg(feature = "tracing-basic")]
pub mod observability;

pub use account::{AccountStore, MemoryAccountStore};
pub use adapter::StashAdapter;
pub use cache::{CacheKey, Cached, TtlCache};
pub use catalog::{MemoryCatalog, RecordCatalog};
pub use config::StashConfig;
pub use error::{StashError, StashResult};
pub use fs_store::FsBlobStore;
pub use ledger::{Admission, RejectReason, UsageKind, UsageLedger};
pub use locks::{AccountGuard, AccountLocks};
pub use memory_store::MemoryBlobStore;
pub use reaper::{ExpiryReaper, ReapFailure, ReapReport};
pub use resumable::{ChunkAck, ChunkOutcome, ChunkRequest};
pub use socket::{SocketChannel, SocketFrame};
pub use source::{BufferedSource, ByteSource, StreamSource};
pub use store::{BlobKey, BlobRead, BlobStore};
pub use types::{
    Account, AccountId, AccountSummary, BoxStream, ByteStream, FileId, FileLookup, FileRecord,
    FileRef, UploadId, ID_POOL,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        AccountId, ByteStream, ChunkOutcome, ChunkRequest, FileId, FileLookup, FileRef,
        StashAdapter, StashConfig, StashError, StashResult, UploadId,
    };
}
