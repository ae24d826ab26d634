//! Virtual-filesystem host adapter for the nimbus item cache.
//!
//! [`DriveFs`] exposes the operations a filesystem host calls (lookup,
//! readdir, create, open, read, write, flush, release, getattr, chmod,
//! utimens, truncate) over an [`ItemTree`](nimbus_core::ItemTree), returning
//! POSIX errno values on failure.
//!
//! The kernel-facing session loop belongs to the host; this crate only
//! turns host calls into item-cache operations.
//!
//! # Components
//!
//! - [`DriveFs`] - host operations over a mounted tree
//! - [`MountConfig`] - upload lanes, TTLs and log level
//! - [`logging`] - leveled `tracing` output with thread and source location
//! - [`ToErrno`] - errno mapping for every error type
//! - [`HandleTable`] - open file handles

pub mod config;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod logging;

pub use config::MountConfig;
pub use error::{MountError, MountResult, ToErrno};
pub use filesystem::{DirEntry, DriveFs, Entry};
pub use handles::{HandleTable, OpenFile};
pub use logging::LogLevel;
