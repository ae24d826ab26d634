//! Item cache for a cloud-drive-backed virtual filesystem.
//!
//! This crate mirrors a remote drive (Microsoft Graph / OneDrive) as a tree
//! of in-memory items that a filesystem host can read, write and stat.
//!
//! # Components
//!
//! - [`Item`] - one file or directory, with its own reader/writer lock,
//!   cached metadata and an in-memory content buffer
//! - [`ItemTree`] - arena owning every item, addressed by [`ItemHandle`];
//!   identity resolution, directory listings, content fetch and flush
//! - [`RemoteTransport`] - the boundary to the remote API (GET/PUT/POST plus
//!   path lookups and listings decoded from [`DriveItemRecord`]s)
//! - [`UploadDispatcher`] - background upload lanes fed at flush time
//! - [`CacheStats`] - lock-free activity counters
//! - [`testing`] - in-memory transport and recording uploader
//!
//! Reads, writes and truncates only touch the buffer. Network traffic
//! happens when a directory is first listed, when a file is first read,
//! when an identifier is needed, and (asynchronously) on flush.
//!
//! # Example
//!
//! ```
//! use nimbus_core::testing::{MemoryTransport, RecordingUploader};
//! use nimbus_core::{Auth, CacheStats, ItemTree, UploadDispatcher, ROOT_HANDLE};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MemoryTransport::new());
//! transport.add_dir("/", "Documents");
//!
//! let uploads = UploadDispatcher::new(
//!     Arc::new(RecordingUploader::new()),
//!     2,
//!     Arc::new(CacheStats::new()),
//! )?;
//! let auth = Arc::new(Auth::new("access-token"));
//! let tree = ItemTree::mount(transport, uploads, Arc::clone(&auth))?;
//!
//! let docs = tree.lookup(ROOT_HANDLE, "documents", &auth)?;
//! let report = tree.new_item(docs.handle(), "report.txt", 0o644)?;
//! tree.insert_child(docs.handle(), report.handle(), &auth)?;
//!
//! report.write(b"ABC", 0)?;
//! assert_eq!(report.size(), 3);
//! assert!(tree.flush(report.handle())?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod auth;
pub mod error;
pub mod item;
pub mod remote;
pub mod stats;
pub mod testing;
pub mod tree;
pub mod upload;

pub use auth::Auth;
pub use error::{ItemError, ItemResult, TransportError, TransportResult, classify_response};
pub use item::{
    DIRECTORY_SIZE, Item, ItemAttr, ItemHandle, ItemKind, MAX_FILE_SIZE, Owner, ParentRef, S_IFDIR, S_IFMT, S_IFREG,
};
pub use remote::{DriveItemRecord, RemoteTransport};
pub use stats::{CacheStats, CacheStatsSnapshot};
pub use tree::{ItemTree, ROOT_HANDLE};
pub use upload::{DEFAULT_UPLOAD_WORKERS, TransportUploader, UploadDispatcher, UploadJob, Uploader};
