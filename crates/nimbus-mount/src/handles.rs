//! Open-file handle table.
//!
//! Maps the `u64` file handles given to the host onto items. Handles are
//! auto-incrementing and start at 1; 0 is reserved as the invalid handle.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nimbus_core::ItemHandle;
use std::sync::atomic::{AtomicU64, Ordering};

/// State of one open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    /// The item the handle refers to.
    pub item: ItemHandle,
    /// Flags passed to open/create.
    pub flags: i32,
}

impl OpenFile {
    /// Returns true if the file was opened with `O_TRUNC`.
    pub fn truncates(&self) -> bool {
        self.flags & libc::O_TRUNC != 0
    }
}

/// Thread-safe table of open files.
#[derive(Debug)]
pub struct HandleTable {
    handles: DashMap<u64, OpenFile>,
    next_id: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers an open file and returns its handle.
    pub fn insert(&self, file: OpenFile) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.handles.entry(id) {
                entry.insert(file);
                return id;
            }
        }
    }

    /// Looks up an open file.
    pub fn get(&self, fh: u64) -> Option<OpenFile> {
        self.handles.get(&fh).map(|entry| *entry.value())
    }

    /// Removes and returns an open file.
    pub fn remove(&self, fh: u64) -> Option<OpenFile> {
        self.handles.remove(&fh).map(|(_, file)| file)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
