//! The operations a virtual-filesystem host invokes on the drive.
//!
//! Inode numbers are raw [`ItemHandle`] values; the root is inode 1. Every
//! public operation returns `Result<T, i32>` where the error is a libc errno,
//! so no error type crosses the host boundary.
//!
//! Content is fetched lazily: the first read of a file downloads it, and a
//! write or truncate on a file whose remote copy was never downloaded
//! fetches it first so the local buffer starts from the remote bytes.

use nimbus_core::{
    Auth, CacheStats, Item, ItemAttr, ItemError, ItemHandle, ItemTree, Owner, RemoteTransport,
    ROOT_HANDLE, S_IFMT, S_IFREG, TransportError, TransportUploader, UploadDispatcher,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};

use crate::config::MountConfig;
use crate::error::{MountError, MountResult, ToErrno};
use crate::handles::{HandleTable, OpenFile};

/// Reply to a lookup or create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub ino: u64,
    pub attr: ItemAttr,
    /// How long the host may cache this entry.
    pub ttl: Duration,
}

/// One directory listing entry. `.` and `..` are left to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub is_dir: bool,
}

/// A mounted drive.
pub struct DriveFs {
    tree: Arc<ItemTree>,
    handles: HandleTable,
    config: MountConfig,
    owner: Owner,
}

impl DriveFs {
    /// Wraps an existing tree.
    pub fn new(tree: Arc<ItemTree>, config: MountConfig) -> Self {
        Self {
            tree,
            handles: HandleTable::new(),
            config,
            owner: Owner::current(),
        }
    }

    /// Fetches the drive root and starts the upload lanes.
    pub fn mount(transport: Arc<dyn RemoteTransport>, auth: Arc<Auth>, config: MountConfig) -> MountResult<Self> {
        let stats = Arc::new(CacheStats::new());
        let uploader = Arc::new(TransportUploader::new(Arc::clone(&transport)));
        let uploads = UploadDispatcher::new(uploader, config.upload_workers, stats)?;
        let tree = ItemTree::mount(transport, uploads, auth)?;
        debug!(workers = config.upload_workers, "Drive mounted");
        Ok(Self::new(Arc::new(tree), config))
    }

    /// Reports processes as owned by a fixed user instead of the current one.
    #[must_use]
    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    pub fn tree(&self) -> &Arc<ItemTree> {
        &self.tree
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn attr_ttl(&self) -> Duration {
        self.config.attr_ttl
    }

    pub fn entry_ttl(&self) -> Duration {
        self.config.entry_ttl
    }

    /// Number of open file handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        self.tree.stats()
    }

    fn item(&self, ino: u64) -> MountResult<Arc<Item>> {
        Ok(self.tree.get(ItemHandle::from_raw(ino))?)
    }

    /// The mount's credentials. A token past its known expiry is refused
    /// here rather than sent.
    fn auth(&self) -> MountResult<Arc<Auth>> {
        let auth = self.tree.root_auth(ROOT_HANDLE)?;
        if auth.is_expired() {
            warn!("Access token expired");
            return Err(TransportError::Unauthorized.into());
        }
        Ok(auth)
    }

    fn open_file(&self, ino: u64, fh: u64) -> MountResult<OpenFile> {
        self.handles
            .get(fh)
            .filter(|file| file.item.as_raw() == ino)
            .ok_or(MountError::InvalidHandle(fh))
    }

    fn entry(&self, item: &Item) -> Entry {
        Entry {
            ino: item.handle().as_raw(),
            attr: item.attr(self.owner),
            ttl: self.config.entry_ttl,
        }
    }

    fn reply_error(op: &str, ino: u64, e: &MountError) -> i32 {
        let errno = e.to_errno();
        debug!(op, ino, errno, error = %e, "Operation failed");
        errno
    }

    /// Loads remote content before a local modification unless the buffer
    /// is already populated or the remote copy is empty.
    fn prepare_buffer(&self, item: &Item, auth: &Auth) -> MountResult<()> {
        if item.has_content() || item.size() == 0 {
            return Ok(());
        }
        self.tree.ensure_content(item.handle(), auth)?;
        Ok(())
    }

    /// Looks up `name` in directory `parent`.
    pub fn lookup(&self, parent: u64, name: &str) -> Result<Entry, i32> {
        self.try_lookup(parent, name)
            .map_err(|e| Self::reply_error("lookup", parent, &e))
    }

    fn try_lookup(&self, parent: u64, name: &str) -> MountResult<Entry> {
        let auth = self.auth()?;
        let item = self.tree.lookup(ItemHandle::from_raw(parent), name, &auth)?;
        trace!(parent, name, ino = item.handle().as_raw(), "lookup");
        Ok(self.entry(&item))
    }

    /// Returns an item's attributes.
    pub fn getattr(&self, ino: u64) -> Result<ItemAttr, i32> {
        self.item(ino)
            .map(|item| item.attr(self.owner))
            .map_err(|e| Self::reply_error("getattr", ino, &e))
    }

    /// Lists a directory, sorted by name.
    pub fn readdir(&self, ino: u64) -> Result<Vec<DirEntry>, i32> {
        self.try_readdir(ino)
            .map_err(|e| Self::reply_error("readdir", ino, &e))
    }

    fn try_readdir(&self, ino: u64) -> MountResult<Vec<DirEntry>> {
        let auth = self.auth()?;
        let children = self.tree.children(ItemHandle::from_raw(ino), &auth)?;
        let mut entries: Vec<DirEntry> = children
            .into_values()
            .filter_map(|handle| self.tree.get(handle).ok())
            .map(|child| DirEntry {
                ino: child.handle().as_raw(),
                name: child.name(),
                is_dir: child.is_dir(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        trace!(ino, count = entries.len(), "readdir");
        Ok(entries)
    }

    /// Creates (or, without `O_EXCL`, opens) a regular file and returns an
    /// open handle to it.
    pub fn create(&self, parent: u64, name: &str, mode: u32, flags: i32) -> Result<(Entry, u64), i32> {
        self.try_create(parent, name, mode, flags)
            .map_err(|e| Self::reply_error("create", parent, &e))
    }

    fn try_create(&self, parent: u64, name: &str, mode: u32, flags: i32) -> MountResult<(Entry, u64)> {
        let auth = self.auth()?;
        let parent_handle = ItemHandle::from_raw(parent);
        match self.tree.lookup(parent_handle, name, &auth) {
            Ok(existing) => {
                if flags & libc::O_EXCL != 0 {
                    return Err(MountError::AlreadyExists(existing.path()));
                }
                let fh = self.try_open(existing.handle().as_raw(), flags)?;
                return Ok((self.entry(&existing), fh));
            }
            Err(ItemError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let item = self
            .tree
            .new_item(parent_handle, name, S_IFREG | (mode & !S_IFMT))?;
        self.tree.insert_child(parent_handle, item.handle(), &auth)?;
        let fh = self.handles.insert(OpenFile {
            item: item.handle(),
            flags,
        });
        debug!(path = %item.path(), fh, "create");
        Ok((self.entry(&item), fh))
    }

    /// Creates a directory, on the server first so it has an identifier
    /// before anything is created inside it.
    pub fn mkdir(&self, parent: u64, name: &str, mode: u32) -> Result<Entry, i32> {
        self.try_mkdir(parent, name, mode)
            .map_err(|e| Self::reply_error("mkdir", parent, &e))
    }

    fn try_mkdir(&self, parent: u64, name: &str, mode: u32) -> MountResult<Entry> {
        let auth = self.auth()?;
        let parent_handle = ItemHandle::from_raw(parent);
        match self.tree.lookup(parent_handle, name, &auth) {
            Ok(existing) => return Err(MountError::AlreadyExists(existing.path())),
            Err(ItemError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let item = self.tree.create_dir(parent_handle, name, mode, &auth)?;
        debug!(path = %item.path(), id = %item.id(), "mkdir");
        Ok(self.entry(&item))
    }

    /// Opens a file. `O_TRUNC` empties it.
    pub fn open(&self, ino: u64, flags: i32) -> Result<u64, i32> {
        self.try_open(ino, flags)
            .map_err(|e| Self::reply_error("open", ino, &e))
    }

    fn try_open(&self, ino: u64, flags: i32) -> MountResult<u64> {
        let item = self.item(ino)?;
        if item.is_dir() {
            return Err(ItemError::IsADirectory(item.path()).into());
        }
        let file = OpenFile {
            item: item.handle(),
            flags,
        };
        if file.truncates() {
            item.truncate(0)?;
        }
        let fh = self.handles.insert(file);
        trace!(ino, fh, flags, "open");
        Ok(fh)
    }

    /// Reads up to `size` bytes at `offset`.
    pub fn read(&self, ino: u64, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        self.try_read(ino, fh, offset, size)
            .map_err(|e| Self::reply_error("read", ino, &e))
    }

    fn try_read(&self, ino: u64, fh: u64, offset: i64, size: u32) -> MountResult<Vec<u8>> {
        let offset = u64::try_from(offset).map_err(|_| MountError::InvalidOffset(offset))?;
        self.open_file(ino, fh)?;
        let item = self.item(ino)?;
        if !item.has_content() {
            let auth = self.auth()?;
            self.tree.ensure_content(item.handle(), &auth)?;
        }
        let mut buf = vec![0u8; size as usize];
        let n = item.read(&mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Writes `data` at `offset` into the local buffer.
    pub fn write(&self, ino: u64, fh: u64, offset: i64, data: &[u8]) -> Result<u32, i32> {
        self.try_write(ino, fh, offset, data)
            .map_err(|e| Self::reply_error("write", ino, &e))
    }

    fn try_write(&self, ino: u64, fh: u64, offset: i64, data: &[u8]) -> MountResult<u32> {
        let offset = u64::try_from(offset).map_err(|_| MountError::InvalidOffset(offset))?;
        let len = u32::try_from(data.len()).map_err(|_| ItemError::OutOfBounds {
            offset,
            len: data.len() as u64,
        })?;
        self.open_file(ino, fh)?;
        let item = self.item(ino)?;
        let auth = self.auth()?;
        self.prepare_buffer(&item, &auth)?;
        item.write(data, offset)?;
        Ok(len)
    }

    /// Hands pending changes to the upload lanes without waiting for them.
    pub fn flush(&self, ino: u64, fh: u64) -> Result<(), i32> {
        self.try_flush(ino, fh)
            .map_err(|e| Self::reply_error("flush", ino, &e))
    }

    fn try_flush(&self, ino: u64, fh: u64) -> MountResult<()> {
        self.open_file(ino, fh)?;
        self.tree.flush(ItemHandle::from_raw(ino))?;
        Ok(())
    }

    /// Flushes and closes a handle.
    pub fn release(&self, ino: u64, fh: u64) -> Result<(), i32> {
        self.try_release(ino, fh)
            .map_err(|e| Self::reply_error("release", ino, &e))
    }

    fn try_release(&self, ino: u64, fh: u64) -> MountResult<()> {
        self.open_file(ino, fh)?;
        let flushed = self.tree.flush(ItemHandle::from_raw(ino));
        self.handles.remove(fh);
        trace!(ino, fh, "release");
        flushed?;
        Ok(())
    }

    /// Changes permission bits.
    pub fn chmod(&self, ino: u64, mode: u32) -> Result<ItemAttr, i32> {
        self.item(ino)
            .map(|item| {
                item.chmod(mode);
                item.attr(self.owner)
            })
            .map_err(|e| Self::reply_error("chmod", ino, &e))
    }

    /// Sets timestamps; only the modification time is kept.
    pub fn utimens(&self, ino: u64, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Result<ItemAttr, i32> {
        self.item(ino)
            .map(|item| {
                item.utimens(atime, mtime);
                item.attr(self.owner)
            })
            .map_err(|e| Self::reply_error("utimens", ino, &e))
    }

    /// Cuts or extends a file to `size` bytes.
    pub fn truncate(&self, ino: u64, size: i64) -> Result<ItemAttr, i32> {
        self.try_truncate(ino, size)
            .map_err(|e| Self::reply_error("truncate", ino, &e))
    }

    fn try_truncate(&self, ino: u64, size: i64) -> MountResult<ItemAttr> {
        let size = u64::try_from(size).map_err(|_| MountError::InvalidOffset(size))?;
        let item = self.item(ino)?;
        if size > 0 {
            let auth = self.auth()?;
            self.prepare_buffer(&item, &auth)?;
        }
        item.truncate(size)?;
        Ok(item.attr(self.owner))
    }

    pub fn is_directory(&self, ino: u64) -> Result<bool, i32> {
        self.item(ino)
            .map(|item| item.is_dir())
            .map_err(|e| Self::reply_error("is_directory", ino, &e))
    }

    /// Absolute path of an item.
    pub fn path(&self, ino: u64) -> Result<String, i32> {
        self.item(ino)
            .map(|item| item.path())
            .map_err(|e| Self::reply_error("path", ino, &e))
    }

    /// Remote identifier of an item, creating the remote item if needed.
    pub fn resolve_id(&self, ino: u64) -> Result<String, i32> {
        self.try_resolve_id(ino)
            .map_err(|e| Self::reply_error("resolve_id", ino, &e))
    }

    fn try_resolve_id(&self, ino: u64) -> MountResult<String> {
        let auth = self.auth()?;
        Ok(self.tree.resolve_id(ItemHandle::from_raw(ino), &auth)?)
    }
}

impl std::fmt::Debug for DriveFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveFs")
            .field("tree", &self.tree)
            .field("open_handles", &self.handles.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
