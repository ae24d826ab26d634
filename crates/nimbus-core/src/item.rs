//! The item entity: a local proxy for one remote file or directory.
//!
//! Every item carries its own reader/writer lock, so operations on sibling
//! items never contend. All mutations happen under the exclusive lock and
//! all reads under the shared lock; no method leaves an item half-updated.
//!
//! Items only know their parent through a [`ParentRef`] holding the parent's
//! identifier, its path, and a non-owning [`ItemHandle`] into the
//! [`ItemTree`](crate::ItemTree) arena. Ownership runs strictly from a
//! directory to its children.
//!
//! Buffer-level operations (read, write, truncate) and attribute accessors
//! never touch the network; the tree layers remote I/O on top of them.

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::auth::Auth;
use crate::error::{ItemError, ItemResult};
use crate::remote::{join_path, DriveItemRecord};

/// File type mask.
pub const S_IFMT: u32 = 0o170_000;
/// Directory type bit.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file type bit.
pub const S_IFREG: u32 = 0o100_000;

/// Permission bits given to directories that were never chmod-ed.
pub const DEFAULT_DIR_PERMS: u32 = 0o755;
/// Permission bits given to files that were never chmod-ed.
pub const DEFAULT_FILE_PERMS: u32 = 0o644;

/// Size reported for every directory.
///
/// Folders have no size on the remote side; tools that stat directories
/// expect the conventional block size.
pub const DIRECTORY_SIZE: u64 = 4096;

/// Largest file the cache buffers, which is the limit of the single-request
/// upload endpoint (250 MiB).
///
/// Writes and truncates that would grow a buffer past it fail with
/// [`ItemError::FileTooLarge`].
pub const MAX_FILE_SIZE: u64 = 250 * 1024 * 1024;

/// Stable handle of an item in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemHandle(u64);

impl ItemHandle {
    /// Wraps a raw handle value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw handle value (usable as an inode number).
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// A regular file.
    File,
    /// A folder.
    Directory,
    /// Marker for an item deleted on the server.
    Deleted,
}

/// An item's view of its parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentRef {
    /// Parent's remote identifier (empty if not known yet).
    pub id: String,
    /// Parent's path; empty only for the root item.
    pub path: String,
    /// Non-owning link to the parent item, `None` for the root.
    pub handle: Option<ItemHandle>,
}

/// Process owner reported in attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    /// The user and group of the current process.
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// Stat-like attribute record handed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemAttr {
    pub size: u64,
    pub nlink: u32,
    pub mode: u32,
    /// Access, modification and change times all report the mtime.
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub uid: u32,
    pub gid: u32,
}

impl ItemAttr {
    /// Returns true if the mode describes a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// Fields copied out of an item before making a network call.
#[derive(Debug, Clone)]
pub(crate) struct ItemSnapshot {
    pub id: String,
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub parent: ParentRef,
}

/// Content handed to the upload subsystem at flush time.
#[derive(Debug, Clone)]
pub(crate) struct FlushSnapshot {
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub content: Bytes,
}

#[derive(Debug)]
struct ItemState {
    id: String,
    name: String,
    size: u64,
    mod_time: SystemTime,
    /// Zero until classified; see [`Item::mode`].
    mode: u32,
    kind: ItemKind,
    parent: ParentRef,
    /// `None` until the content has been fetched or written locally.
    content: Option<Vec<u8>>,
    dirty: bool,
    /// `None` means "not fetched yet", which is distinct from empty.
    children: Option<HashMap<String, ItemHandle>>,
    subdirs: u32,
    /// Only set on the root item.
    auth: Option<Arc<Auth>>,
}

impl ItemState {
    /// Mode as it would be classified, without memoizing.
    fn effective_mode(&self) -> u32 {
        if self.mode != 0 {
            return self.mode;
        }
        match self.kind {
            ItemKind::Directory => S_IFDIR | DEFAULT_DIR_PERMS,
            ItemKind::File | ItemKind::Deleted => S_IFREG | DEFAULT_FILE_PERMS,
        }
    }

    fn is_dir(&self) -> bool {
        self.effective_mode() & S_IFMT == S_IFDIR
    }

    fn path(&self) -> String {
        if self.parent.path.is_empty() {
            return "/".to_string();
        }
        join_path(&self.parent.path, &self.name)
    }

    fn size(&self) -> u64 {
        if self.is_dir() {
            DIRECTORY_SIZE
        } else {
            self.size
        }
    }

    fn nlink(&self) -> u32 {
        if self.is_dir() {
            2 + self.subdirs
        } else {
            1
        }
    }
}

/// A file or directory in the local mirror of the remote drive.
pub struct Item {
    handle: ItemHandle,
    state: RwLock<ItemState>,
    /// Serializes identity resolution so one placeholder upload serves all callers.
    id_gate: Mutex<()>,
    /// Serializes listing and content fetches.
    fetch_gate: Mutex<()>,
}

impl Item {
    /// Creates a brand-new local item with no remote identifier.
    ///
    /// A mode without a type bit is treated as a regular file. New
    /// directories start with an empty (populated) child set, new files with
    /// an empty (populated) buffer.
    pub(crate) fn new_local(handle: ItemHandle, name: &str, mode: u32, parent: ParentRef) -> Self {
        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
        let kind = if mode & S_IFMT == S_IFDIR {
            ItemKind::Directory
        } else {
            ItemKind::File
        };
        Self::with_state(
            handle,
            ItemState {
                id: String::new(),
                name: name.to_string(),
                size: 0,
                mod_time: SystemTime::now(),
                mode,
                kind,
                parent,
                content: Some(Vec::new()),
                dirty: false,
                children: (kind == ItemKind::Directory).then(HashMap::new),
                subdirs: 0,
                auth: None,
            },
        )
    }

    /// Creates an item from a decoded remote record.
    ///
    /// The record's own `parentReference` wins over `parent` where present.
    /// Content and children start out unpopulated.
    pub(crate) fn from_record(handle: ItemHandle, record: DriveItemRecord, parent: ParentRef) -> Self {
        let kind = record.kind();
        let mod_time = record.modified();
        let parent = match record.parent {
            Some(reported) => ParentRef {
                id: if reported.id.is_empty() { parent.id } else { reported.id },
                path: if reported.path.is_empty() { parent.path } else { reported.path },
                handle: parent.handle,
            },
            None => parent,
        };
        Self::with_state(
            handle,
            ItemState {
                id: record.id,
                name: record.name,
                size: record.size,
                mod_time,
                mode: 0,
                kind,
                parent,
                content: None,
                dirty: false,
                children: None,
                subdirs: 0,
                auth: None,
            },
        )
    }

    /// Creates the root item. Its parent path is empty, which is how root
    /// discovery recognises it.
    pub(crate) fn new_root(handle: ItemHandle, record: DriveItemRecord, auth: Arc<Auth>) -> Self {
        let item = Self::from_record(handle, record, ParentRef::default());
        {
            let mut state = item.state.write();
            state.parent = ParentRef::default();
            state.kind = ItemKind::Directory;
            state.auth = Some(auth);
        }
        item
    }

    fn with_state(handle: ItemHandle, state: ItemState) -> Self {
        Self {
            handle,
            state: RwLock::new(state),
            id_gate: Mutex::new(()),
            fetch_gate: Mutex::new(()),
        }
    }

    /// This item's handle in the tree.
    pub fn handle(&self) -> ItemHandle {
        self.handle
    }

    /// The item's name.
    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    /// Renames the item locally.
    pub fn set_name(&self, name: &str) {
        self.state.write().name = name.to_string();
    }

    /// Cached remote identifier; empty if none has been assigned yet.
    pub fn id(&self) -> String {
        self.state.read().id.clone()
    }

    /// What the item represents.
    pub fn kind(&self) -> ItemKind {
        self.state.read().kind
    }

    /// A copy of the parent reference.
    pub fn parent(&self) -> ParentRef {
        self.state.read().parent.clone()
    }

    /// Replaces the parent reference in one step.
    pub(crate) fn set_parent(&self, parent: ParentRef) {
        self.state.write().parent = parent;
    }

    /// Renames and reparents under a single exclusive lock.
    pub(crate) fn reparent(&self, name: &str, parent: ParentRef) {
        let mut state = self.state.write();
        state.name = name.to_string();
        state.parent = parent;
    }

    /// Absolute path, recomputed from the stored parent path on every call.
    pub fn path(&self) -> String {
        self.state.read().path()
    }

    /// Mode word (type and permission bits).
    ///
    /// Items decoded from the server have no mode until first queried; the
    /// classification and its write-back happen under the exclusive lock.
    pub fn mode(&self) -> u32 {
        {
            let state = self.state.read();
            if state.mode != 0 {
                return state.mode;
            }
        }
        let mut state = self.state.write();
        if state.mode == 0 {
            state.mode = state.effective_mode();
        }
        state.mode
    }

    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.mode() & S_IFMT == S_IFDIR
    }

    /// Changes permission bits, keeping the type bits.
    pub fn chmod(&self, perms: u32) {
        let mut state = self.state.write();
        let kind_bits = if state.is_dir() { S_IFDIR } else { S_IFREG };
        state.mode = kind_bits | (perms & !S_IFMT);
        tracing::trace!(path = %state.path(), mode = format_args!("{:o}", state.mode), "chmod");
    }

    /// Sets the modification time. Access times are not tracked.
    pub fn utimens(&self, _atime: Option<SystemTime>, mtime: Option<SystemTime>) {
        let mut state = self.state.write();
        tracing::trace!(path = %state.path(), "utimens");
        if let Some(mtime) = mtime {
            state.mod_time = mtime;
        }
    }

    /// Size in bytes; [`DIRECTORY_SIZE`] for directories.
    pub fn size(&self) -> u64 {
        self.state.read().size()
    }

    /// Hard link count: `2 + subdirectories` for directories, 1 for files.
    pub fn nlink(&self) -> u32 {
        self.state.read().nlink()
    }

    /// Modification time as seconds since the Unix epoch.
    pub fn mod_time(&self) -> u64 {
        self.state
            .read()
            .mod_time
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }

    /// Full stat-like record, computed under a single shared lock.
    pub fn attr(&self, owner: Owner) -> ItemAttr {
        let state = self.state.read();
        ItemAttr {
            size: state.size(),
            nlink: state.nlink(),
            mode: state.effective_mode(),
            atime: state.mod_time,
            mtime: state.mod_time,
            ctime: state.mod_time,
            uid: owner.uid,
            gid: owner.gid,
        }
    }

    /// Returns true if the buffer holds local changes not yet handed to the uploader.
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    /// Returns true once content has been fetched or written locally.
    pub fn has_content(&self) -> bool {
        self.state.read().content.is_some()
    }

    /// Returns true once the child set has been fetched.
    pub fn children_populated(&self) -> bool {
        self.state.read().children.is_some()
    }

    /// Copies buffered content at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied, which is zero at or past the end
    /// of the content and for items whose content was never fetched.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> ItemResult<usize> {
        let state = self.state.read();
        let Some(content) = state.content.as_deref() else {
            return Ok(0);
        };
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= content.len() {
            return Ok(0);
        }
        let end = start.saturating_add(buf.len()).min(content.len());
        let n = end - start;
        buf[..n].copy_from_slice(&content[start..end]);
        tracing::trace!(path = %state.path(), bytes = n, offset, "read");
        Ok(n)
    }

    /// Writes `data` into the buffer at `offset`.
    ///
    /// Writes inside the current content overwrite in place; writes that run
    /// past the end grow the buffer (any gap is zero-filled). The declared
    /// size follows the buffer and the item is marked dirty. Nothing is sent
    /// to the server until flush.
    ///
    /// An item whose content was never fetched is treated as empty; callers
    /// fetch first when the remote copy matters.
    pub fn write(&self, data: &[u8], offset: u64) -> ItemResult<usize> {
        let out_of_bounds = || ItemError::OutOfBounds {
            offset,
            len: data.len() as u64,
        };
        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(data.len()).ok_or_else(out_of_bounds)?;
        check_size(end as u64)?;

        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.is_dir() {
            return Err(ItemError::IsADirectory(state.path()));
        }
        let content = state.content.get_or_insert_with(Vec::new);
        if end > content.len() {
            grow(content, end)?;
        }
        content[start..end].copy_from_slice(data);
        state.size = content.len() as u64;
        state.dirty = true;
        tracing::trace!(path = %state.path(), bytes = data.len(), offset, "write");
        Ok(data.len())
    }

    /// Cuts (or zero-extends) the buffer to `size` bytes and marks the item dirty.
    pub fn truncate(&self, size: u64) -> ItemResult<()> {
        check_size(size)?;
        let new_len = usize::try_from(size).map_err(|_| ItemError::OutOfBounds {
            offset: size,
            len: 0,
        })?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.is_dir() {
            return Err(ItemError::IsADirectory(state.path()));
        }
        let content = state.content.get_or_insert_with(Vec::new);
        if new_len > content.len() {
            grow(content, new_len)?;
        } else {
            content.truncate(new_len);
        }
        state.size = size;
        state.dirty = true;
        tracing::trace!(path = %state.path(), size, "truncate");
        Ok(())
    }

    /// Installs freshly downloaded content, replacing the buffer.
    pub(crate) fn set_content(&self, body: Vec<u8>) {
        let mut state = self.state.write();
        state.size = body.len() as u64;
        state.content = Some(body);
        state.dirty = false;
    }

    /// Records a server-assigned identifier unless one is already present.
    ///
    /// Returns the identifier the item ends up with.
    pub(crate) fn adopt_id(&self, id: &str) -> String {
        let mut state = self.state.write();
        if state.id.is_empty() {
            state.id = id.to_string();
            tracing::debug!(path = %state.path(), id, "adopted remote id");
        }
        state.id.clone()
    }

    /// Copies out what a network call needs, so the lock is not held across it.
    pub(crate) fn snapshot(&self) -> ItemSnapshot {
        let state = self.state.read();
        ItemSnapshot {
            id: state.id.clone(),
            name: state.name.clone(),
            path: state.path(),
            is_dir: state.is_dir(),
            parent: state.parent.clone(),
        }
    }

    /// Under the exclusive lock: if dirty, clears the flag and hands a copy of
    /// the content to `dispatch`. Returns whether anything was dispatched.
    ///
    /// The flag is cleared before dispatch, so a write racing the upload
    /// marks the item dirty again rather than being lost.
    pub(crate) fn flush_with(&self, dispatch: impl FnOnce(FlushSnapshot)) -> bool {
        let mut state = self.state.write();
        if !state.dirty {
            return false;
        }
        state.dirty = false;
        let snapshot = FlushSnapshot {
            id: state.id.clone(),
            name: state.name.clone(),
            parent_id: state.parent.id.clone(),
            content: Bytes::copy_from_slice(state.content.as_deref().unwrap_or_default()),
        };
        dispatch(snapshot);
        true
    }

    /// The auth context, if this is the root item.
    pub(crate) fn auth(&self) -> Option<Arc<Auth>> {
        self.state.read().auth.clone()
    }

    pub(crate) fn children(&self) -> Option<HashMap<String, ItemHandle>> {
        self.state.read().children.clone()
    }

    pub(crate) fn child(&self, key: &str) -> Option<ItemHandle> {
        self.state
            .read()
            .children
            .as_ref()
            .and_then(|children| children.get(key).copied())
    }

    /// Inserts children under the exclusive lock, counting subdirectories as
    /// they go in. Returns the handles that were displaced by a same-named
    /// entry. Populates the child set if it was not yet.
    pub(crate) fn insert_children(
        &self,
        entries: impl IntoIterator<Item = (String, ItemHandle, bool)>,
        is_dir: impl Fn(ItemHandle) -> bool,
    ) -> Vec<ItemHandle> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let children = state.children.get_or_insert_with(HashMap::new);
        let mut displaced = Vec::new();
        for (key, handle, child_is_dir) in entries {
            if child_is_dir {
                state.subdirs += 1;
            }
            if let Some(old) = children.insert(key, handle)
                && old != handle
            {
                if is_dir(old) {
                    state.subdirs = state.subdirs.saturating_sub(1);
                }
                displaced.push(old);
            }
        }
        displaced
    }

    /// Removes a child entry, keeping the subdirectory count in step.
    pub(crate) fn remove_child(&self, key: &str, child_is_dir: impl FnOnce(ItemHandle) -> bool) -> Option<ItemHandle> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let handle = state.children.as_mut()?.remove(key)?;
        if child_is_dir(handle) {
            state.subdirs = state.subdirs.saturating_sub(1);
        }
        Some(handle)
    }

    pub(crate) fn lock_id_gate(&self) -> MutexGuard<'_, ()> {
        self.id_gate.lock()
    }

    pub(crate) fn lock_fetch_gate(&self) -> MutexGuard<'_, ()> {
        self.fetch_gate.lock()
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        let preview = state
            .content
            .as_deref()
            .map(|c| &c[..c.len().min(10)])
            .unwrap_or_default();
        f.debug_struct("Item")
            .field("handle", &self.handle)
            .field("id", &state.id)
            .field("path", &state.path())
            .field("kind", &state.kind)
            .field("dirty", &state.dirty)
            .field("head", &format_args!("{preview:x?}"))
            .finish_non_exhaustive()
    }
}

fn check_size(size: u64) -> ItemResult<()> {
    if size > MAX_FILE_SIZE {
        return Err(ItemError::FileTooLarge {
            size,
            max: MAX_FILE_SIZE,
        });
    }
    Ok(())
}

/// Zero-extends `content` to `len` bytes; allocation failure is an error.
fn grow(content: &mut Vec<u8>, len: usize) -> ItemResult<()> {
    content
        .try_reserve_exact(len - content.len())
        .map_err(|_| ItemError::FileTooLarge {
            size: len as u64,
            max: MAX_FILE_SIZE,
        })?;
    content.resize(len, 0);
    Ok(())
}

/// Case-folded key used in a directory's child map.
pub fn child_key(name: &str) -> String {
    name.to_lowercase()
}
