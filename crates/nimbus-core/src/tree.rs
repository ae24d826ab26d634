//! The item tree: an arena of items addressed by stable handles.
//!
//! Directories own their children through handle maps; a child's link to
//! its parent is a plain [`ItemHandle`], so back-references can never keep an
//! evicted item alive or form an ownership cycle.
//!
//! Every operation that talks to the server follows the same discipline:
//! copy what the call needs out of the item, release its lock, make the
//! call, then re-acquire the lock only to commit the result. Identity
//! resolution and listing/content fetches are additionally single-flighted
//! per item by gate mutexes that are separate from the item's data lock, so
//! a caller waiting on a fetch never blocks reads, writes or attribute calls
//! on the same item.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

use crate::auth::Auth;
use crate::error::{ItemError, ItemResult};
use crate::item::{child_key, Item, ItemHandle, ItemKind, ParentRef, S_IFDIR, S_IFMT};
use crate::remote::{content_path, join_path, placeholder_path, DriveItemRecord, RemoteTransport};
use crate::stats::CacheStats;
use crate::upload::{UploadDispatcher, UploadJob};

/// Handle of the root item.
pub const ROOT_HANDLE: ItemHandle = ItemHandle::from_raw(1);

/// Local mirror of a remote drive.
pub struct ItemTree {
    items: DashMap<ItemHandle, Arc<Item>>,
    next_handle: AtomicU64,
    transport: Arc<dyn RemoteTransport>,
    uploads: UploadDispatcher,
    stats: Arc<CacheStats>,
}

impl ItemTree {
    /// Builds a tree around an already-fetched root record.
    ///
    /// The root item is the only holder of `auth`.
    pub fn new(
        root: DriveItemRecord,
        auth: Arc<Auth>,
        transport: Arc<dyn RemoteTransport>,
        uploads: UploadDispatcher,
    ) -> Self {
        let stats = Arc::clone(uploads.stats());
        let items = DashMap::new();
        items.insert(ROOT_HANDLE, Arc::new(Item::new_root(ROOT_HANDLE, root, auth)));
        stats.record_insert();
        Self {
            items,
            next_handle: AtomicU64::new(ROOT_HANDLE.as_raw() + 1),
            transport,
            uploads,
            stats,
        }
    }

    /// Fetches the drive root and builds a tree around it.
    pub fn mount(
        transport: Arc<dyn RemoteTransport>,
        uploads: UploadDispatcher,
        auth: Arc<Auth>,
    ) -> ItemResult<Self> {
        let root = transport.item_by_path("/", &auth)?;
        debug!(id = %root.id, "Mounted drive root");
        Ok(Self::new(root, auth, transport, uploads))
    }

    /// Looks up a live item.
    pub fn get(&self, handle: ItemHandle) -> ItemResult<Arc<Item>> {
        self.items
            .get(&handle)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ItemError::StaleHandle(handle))
    }

    /// The root item.
    pub fn root(&self) -> ItemResult<Arc<Item>> {
        self.get(ROOT_HANDLE)
    }

    /// Number of live items, root included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub fn transport(&self) -> &Arc<dyn RemoteTransport> {
        &self.transport
    }

    fn register(&self, build: impl FnOnce(ItemHandle) -> Item) -> Arc<Item> {
        let handle = ItemHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let item = Arc::new(build(handle));
        self.items.insert(handle, Arc::clone(&item));
        self.stats.record_insert();
        item
    }

    /// Drops an item and all of its descendants from the arena.
    fn retire(&self, handle: ItemHandle) {
        if handle == ROOT_HANDLE {
            return;
        }
        let Some((_, item)) = self.items.remove(&handle) else {
            return;
        };
        self.stats.record_remove();
        trace!(%handle, path = %item.path(), "Retired item");
        if let Some(children) = item.children() {
            for child in children.into_values() {
                self.retire(child);
            }
        }
    }

    fn is_dir_handle(&self, handle: ItemHandle) -> bool {
        self.get(handle).is_ok_and(|item| item.is_dir())
    }

    /// Constructs a brand-new local item under `parent`.
    ///
    /// The item has no identifier and is not yet part of the parent's child
    /// set; see [`insert_child`](Self::insert_child).
    pub fn new_item(&self, parent: ItemHandle, name: &str, mode: u32) -> ItemResult<Arc<Item>> {
        let parent_item = self.get(parent)?;
        if !parent_item.is_dir() {
            return Err(ItemError::NotADirectory(parent_item.path()));
        }
        let parent_ref = ParentRef {
            id: parent_item.id(),
            path: parent_item.path(),
            handle: Some(parent),
        };
        let item = self.register(|handle| Item::new_local(handle, name, mode, parent_ref));
        trace!(handle = %item.handle(), path = %item.path(), "New local item");
        Ok(item)
    }

    /// The parent's identifier, falling back to the live parent item when the
    /// stored reference predates the parent getting one.
    fn parent_id(&self, parent: &ParentRef) -> ItemResult<String> {
        if !parent.id.is_empty() {
            return Ok(parent.id.clone());
        }
        match parent.handle {
            Some(handle) => Ok(self.get(handle)?.id()),
            None => Ok(String::new()),
        }
    }

    /// Creates a directory on the server and adds it to `parent`.
    ///
    /// Unlike files, directories get their identifier at creation time, so
    /// anything later created inside them can be uploaded by name. A name
    /// that is taken on the server fails with the transport's "already
    /// exists" error and nothing is added locally.
    pub fn create_dir(&self, parent: ItemHandle, name: &str, mode: u32, auth: &Auth) -> ItemResult<Arc<Item>> {
        let parent_item = self.get(parent)?;
        if !parent_item.is_dir() {
            return Err(ItemError::NotADirectory(parent_item.path()));
        }
        let parent_path = parent_item.path();
        let parent_id = parent_item.id();
        if parent_id.is_empty() {
            return Err(ItemError::UnresolvedParent(join_path(&parent_path, name)));
        }

        let record = self.transport.create_folder(&parent_id, name, auth)?;
        if record.id.is_empty() {
            return Err(ItemError::Inconsistent(format!(
                "folder creation for {} returned no id",
                join_path(&parent_path, name)
            )));
        }
        let parent_ref = ParentRef {
            id: parent_id,
            path: parent_path,
            handle: Some(parent),
        };
        let item = self.register(|handle| {
            Item::new_local(handle, name, S_IFDIR | (mode & !S_IFMT), parent_ref)
        });
        item.adopt_id(&record.id);
        self.insert_child(parent, item.handle(), auth)?;
        debug!(path = %item.path(), id = %record.id, "Created directory");
        Ok(item)
    }

    /// Walks up to the root and returns its auth context.
    pub fn root_auth(&self, handle: ItemHandle) -> ItemResult<Arc<Auth>> {
        let mut current = self.get(handle)?;
        loop {
            let parent = current.parent();
            if parent.path.is_empty() {
                return current.auth().ok_or_else(|| {
                    ItemError::Inconsistent(format!("root item {} carries no auth", current.handle()))
                });
            }
            let next = parent.handle.ok_or_else(|| {
                ItemError::Inconsistent(format!("{} has no parent link", current.path()))
            })?;
            current = self.get(next)?;
        }
    }

    /// Returns the item's remote identifier, creating the remote item with a
    /// zero-length upload if it has none yet.
    ///
    /// Directories and items with a cached identifier return it without any
    /// network traffic, as does any call with an empty `auth`. Concurrent
    /// callers on the same item share a single placeholder upload. If the
    /// upload collides with an existing name, the identifier of the existing
    /// remote item is adopted instead of creating a second one.
    pub fn resolve_id(&self, handle: ItemHandle, auth: &Auth) -> ItemResult<String> {
        let item = self.get(handle)?;
        let snap = item.snapshot();
        if snap.is_dir || !snap.id.is_empty() || auth.is_empty() {
            return Ok(snap.id);
        }

        let _gate = item.lock_id_gate();
        let snap = item.snapshot();
        if !snap.id.is_empty() {
            return Ok(snap.id);
        }

        let parent_id = self.parent_id(&snap.parent)?;
        if parent_id.is_empty() {
            return Err(ItemError::UnresolvedParent(snap.path));
        }

        let path = placeholder_path(&parent_id, &snap.name);
        self.stats.record_placeholder_upload();
        debug!(path = %snap.path, resource = %path, "Uploading placeholder to obtain id");
        match self.transport.put(&path, auth, &[]) {
            Ok(body) => {
                let record: DriveItemRecord = serde_json::from_slice(&body)?;
                if record.id.is_empty() {
                    return Err(ItemError::Inconsistent(format!(
                        "placeholder upload for {} returned no id",
                        snap.path
                    )));
                }
                Ok(item.adopt_id(&record.id))
            }
            Err(e) if e.is_already_exists() => {
                let live = item.id();
                if !live.is_empty() {
                    return Ok(live);
                }
                warn!(path = %snap.path, "Placeholder upload hit an existing name, adopting remote item");
                match self.transport.item_by_path(&snap.path, auth) {
                    Ok(existing) if !existing.id.is_empty() => Ok(item.adopt_id(&existing.id)),
                    Ok(_) => Err(e.into()),
                    Err(lookup) if lookup.is_not_found() => Err(ItemError::Inconsistent(format!(
                        "{} is reported taken but nothing exists at that path",
                        snap.path
                    ))),
                    Err(lookup) => {
                        debug!(path = %snap.path, error = %lookup, "Lookup after name conflict failed");
                        Err(e.into())
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns a directory's children keyed by case-folded name.
    ///
    /// The listing is fetched from the server once per item; an empty
    /// directory stays populated-and-empty afterwards. On a failed fetch the
    /// child set stays unpopulated so a later call retries. Deleted markers
    /// are skipped.
    pub fn children(&self, handle: ItemHandle, auth: &Auth) -> ItemResult<HashMap<String, ItemHandle>> {
        let item = self.get(handle)?;
        if !item.is_dir() {
            return Err(ItemError::NotADirectory(item.path()));
        }
        if let Some(children) = item.children() {
            return Ok(children);
        }

        let _gate = item.lock_fetch_gate();
        if let Some(children) = item.children() {
            return Ok(children);
        }

        let snap = item.snapshot();
        self.stats.record_listing();
        let records = self.transport.children_of(&snap.path, auth)?;
        let parent_ref = ParentRef {
            id: snap.id,
            path: snap.path.clone(),
            handle: Some(handle),
        };

        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            if record.kind() == ItemKind::Deleted {
                trace!(parent = %snap.path, name = %record.name, "Skipping deleted marker");
                continue;
            }
            let key = child_key(&record.name);
            let child = self.register(|h| Item::from_record(h, record, parent_ref.clone()));
            entries.push((key, child.handle(), child.is_dir()));
        }
        let count = entries.len();
        for displaced in item.insert_children(entries, |h| self.is_dir_handle(h)) {
            self.retire(displaced);
        }
        debug!(path = %snap.path, count, "Fetched children");
        Ok(item.children().unwrap_or_default())
    }

    /// Case-insensitive lookup of a child by name.
    pub fn lookup(&self, parent: ItemHandle, name: &str, auth: &Auth) -> ItemResult<Arc<Item>> {
        let children = self.children(parent, auth)?;
        match children.get(&child_key(name)) {
            Some(&handle) => self.get(handle),
            None => {
                let parent_path = self.get(parent)?.path();
                Err(ItemError::NotFound(join_path(&parent_path, name)))
            }
        }
    }

    /// Adds `child` to a directory's child set, replacing (and retiring) any
    /// existing child with the same case-folded name.
    pub fn insert_child(&self, parent: ItemHandle, child: ItemHandle, auth: &Auth) -> ItemResult<()> {
        self.children(parent, auth)?;
        let parent_item = self.get(parent)?;
        let child_item = self.get(child)?;
        let entry = (child_key(&child_item.name()), child, child_item.is_dir());
        for displaced in parent_item.insert_children([entry], |h| self.is_dir_handle(h)) {
            self.retire(displaced);
        }
        Ok(())
    }

    /// Evicts the named child and everything below it.
    pub fn remove_child(&self, parent: ItemHandle, name: &str) -> ItemResult<ItemHandle> {
        let parent_item = self.get(parent)?;
        let removed = parent_item
            .remove_child(&child_key(name), |h| self.is_dir_handle(h))
            .ok_or_else(|| ItemError::NotFound(join_path(&parent_item.path(), name)))?;
        self.retire(removed);
        debug!(parent = %parent_item.path(), name, "Removed child");
        Ok(removed)
    }

    /// Applies a deletion reported by the server. Returns whether a cached
    /// child was evicted.
    pub fn apply_remote_deletion(&self, parent: ItemHandle, record: &DriveItemRecord) -> ItemResult<bool> {
        if record.kind() != ItemKind::Deleted {
            return Ok(false);
        }
        match self.remove_child(parent, &record.name) {
            Ok(_) => Ok(true),
            Err(ItemError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Moves an item under `new_parent` with a new name.
    ///
    /// This only updates the local tree; paths of the item and its
    /// descendants follow from the new parent reference. No move is sent to
    /// the server, so a renamed directory whose children were never listed
    /// fails its first listing with a not-found transport error. Moving a
    /// directory into itself or one of its descendants is refused.
    pub fn rename(&self, handle: ItemHandle, new_parent: ItemHandle, new_name: &str, auth: &Auth) -> ItemResult<()> {
        if handle == ROOT_HANDLE {
            return Err(ItemError::Inconsistent("the root cannot be renamed".to_string()));
        }
        let item = self.get(handle)?;
        let dest = self.get(new_parent)?;
        if !dest.is_dir() {
            return Err(ItemError::NotADirectory(dest.path()));
        }
        let mut ancestor = Some(new_parent);
        while let Some(current) = ancestor {
            if current == handle {
                return Err(ItemError::InvalidMove(item.path()));
            }
            ancestor = self.get(current)?.parent().handle;
        }
        self.children(new_parent, auth)?;

        if let Some(old_parent) = item.parent().handle {
            let old = self.get(old_parent)?;
            let key = child_key(&item.name());
            if old.child(&key) == Some(handle) {
                old.remove_child(&key, |h| self.is_dir_handle(h));
            }
        }

        let old_path = item.path();
        item.reparent(
            new_name,
            ParentRef {
                id: dest.id(),
                path: dest.path(),
                handle: Some(new_parent),
            },
        );
        let entry = (child_key(new_name), handle, item.is_dir());
        for displaced in dest.insert_children([entry], |h| self.is_dir_handle(h)) {
            self.retire(displaced);
        }
        self.refresh_descendant_paths(&item);
        debug!(from = %old_path, to = %item.path(), "Renamed");
        Ok(())
    }

    /// Rewrites the parent references below a moved directory.
    fn refresh_descendant_paths(&self, item: &Item) {
        let Some(children) = item.children() else {
            return;
        };
        let parent = ParentRef {
            id: item.id(),
            path: item.path(),
            handle: Some(item.handle()),
        };
        for child in children.into_values() {
            if let Ok(child) = self.get(child) {
                child.set_parent(parent.clone());
                self.refresh_descendant_paths(&child);
            }
        }
    }

    /// Downloads an item's full content, replacing its buffer.
    pub fn fetch_content(&self, handle: ItemHandle, auth: &Auth) -> ItemResult<()> {
        let item = self.get(handle)?;
        if item.is_dir() {
            return Err(ItemError::IsADirectory(item.path()));
        }
        let id = self.resolve_id(handle, auth)?;
        if id.is_empty() {
            return Err(ItemError::Inconsistent(format!(
                "{} has no remote identifier to fetch",
                item.path()
            )));
        }
        self.stats.record_content_fetch();
        let body = self.transport.get(&content_path(&id), auth)?;
        debug!(path = %item.path(), bytes = body.len(), "Fetched content");
        item.set_content(body);
        Ok(())
    }

    /// Fetches content unless the buffer is already populated. Concurrent
    /// callers share one download.
    pub fn ensure_content(&self, handle: ItemHandle, auth: &Auth) -> ItemResult<()> {
        let item = self.get(handle)?;
        if item.has_content() {
            return Ok(());
        }
        let _gate = item.lock_fetch_gate();
        if item.has_content() {
            return Ok(());
        }
        self.fetch_content(handle, auth)
    }

    /// Hands dirty content to the upload lanes. Returns whether an upload
    /// was dispatched; never waits for it.
    ///
    /// A never-uploaded item whose parent has no identifier cannot be
    /// addressed on the server; it stays dirty and the flush fails.
    pub fn flush(&self, handle: ItemHandle) -> ItemResult<bool> {
        let item = self.get(handle)?;
        if !item.is_dirty() {
            return Ok(false);
        }
        let snap = item.snapshot();
        let parent_id = self.parent_id(&snap.parent)?;
        if snap.id.is_empty() && parent_id.is_empty() {
            return Err(ItemError::UnresolvedParent(snap.path));
        }
        let auth = self.root_auth(handle)?;
        let dispatched = item.flush_with(|snap| {
            self.uploads.dispatch(UploadJob {
                handle,
                item: Arc::clone(&item),
                name: snap.name,
                parent_id: if snap.parent_id.is_empty() { parent_id } else { snap.parent_id },
                id: snap.id,
                content: snap.content,
                auth,
            });
        });
        if dispatched {
            trace!(path = %item.path(), "Flush dispatched upload");
        }
        Ok(dispatched)
    }
}

impl std::fmt::Debug for ItemTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemTree")
            .field("items", &self.items.len())
            .field("upload_workers", &self.uploads.workers())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::item::DIRECTORY_SIZE;
    use crate::testing::{MemoryTransport, RecordingUploader, MEMORY_ROOT_ID};
    use std::time::Duration;

    struct Fixture {
        tree: ItemTree,
        transport: Arc<MemoryTransport>,
        uploader: Arc<RecordingUploader>,
        auth: Arc<Auth>,
    }

    fn fixture_with(transport: MemoryTransport) -> Fixture {
        let transport = Arc::new(transport);
        let uploader = Arc::new(RecordingUploader::new());
        let stats = Arc::new(CacheStats::new());
        let uploads = UploadDispatcher::new(uploader.clone(), 2, stats).unwrap();
        let auth = Arc::new(Auth::new("token"));
        let tree = ItemTree::mount(transport.clone(), uploads, Arc::clone(&auth)).unwrap();
        Fixture {
            tree,
            transport,
            uploader,
            auth,
        }
    }

    fn fixture() -> Fixture {
        let transport = MemoryTransport::new();
        transport.add_dir("/", "Documents");
        transport.add_dir("/", "Music");
        transport.add_file("/", "notes.txt", b"remember");
        transport.add_file("/Documents", "a.txt", b"alpha");
        transport.add_dir("/Documents", "Drafts");
        fixture_with(transport)
    }

    #[test]
    fn test_mount_loads_root() {
        let f = fixture();
        let root = f.tree.root().unwrap();
        assert_eq!(root.id(), MEMORY_ROOT_ID);
        assert_eq!(root.path(), "/");
        assert!(root.is_dir());
        assert_eq!(f.tree.len(), 1);
    }

    #[test]
    fn test_children_fetched_once() {
        let f = fixture();
        let first = f.tree.children(ROOT_HANDLE, &f.auth).unwrap();
        let second = f.tree.children(ROOT_HANDLE, &f.auth).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert_eq!(f.transport.listings.load(Ordering::SeqCst), 1);
        assert_eq!(f.tree.stats().snapshot().listings, 1);
    }

    #[test]
    fn test_empty_listing_is_populated() {
        let f = fixture();
        let music = f.tree.lookup(ROOT_HANDLE, "Music", &f.auth).unwrap();
        assert!(!music.children_populated());

        assert!(f.tree.children(music.handle(), &f.auth).unwrap().is_empty());
        assert!(music.children_populated());
        assert!(f.tree.children(music.handle(), &f.auth).unwrap().is_empty());
        // one listing for root, one for Music
        assert_eq!(f.transport.listings.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_listing_is_retried() {
        let f = fixture();
        f.transport.fail_listings.store(true, Ordering::SeqCst);
        let err = f.tree.children(ROOT_HANDLE, &f.auth).unwrap_err();
        assert!(matches!(err, ItemError::Transport(TransportError::Network(_))));
        assert!(!f.tree.root().unwrap().children_populated());

        f.transport.fail_listings.store(false, Ordering::SeqCst);
        assert_eq!(f.tree.children(ROOT_HANDLE, &f.auth).unwrap().len(), 3);
    }

    #[test]
    fn test_children_of_file_is_not_a_directory() {
        let f = fixture();
        let notes = f.tree.lookup(ROOT_HANDLE, "notes.txt", &f.auth).unwrap();
        assert!(matches!(
            f.tree.children(notes.handle(), &f.auth),
            Err(ItemError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "DOCUMENTS", &f.auth).unwrap();
        assert_eq!(docs.name(), "Documents");
        assert_eq!(docs.path(), "/Documents");

        let err = f.tree.lookup(ROOT_HANDLE, "missing", &f.auth).unwrap_err();
        assert!(matches!(err, ItemError::NotFound(p) if p == "/missing"));
    }

    #[test]
    fn test_deleted_markers_skipped() {
        let transport = MemoryTransport::new();
        transport.add_file("/", "kept.txt", b"k");
        transport.add_deleted("/", "gone.txt");
        let f = fixture_with(transport);
        let children = f.tree.children(ROOT_HANDLE, &f.auth).unwrap();
        assert_eq!(children.len(), 1);
        assert!(children.contains_key("kept.txt"));
    }

    #[test]
    fn test_nlink_counts_listed_subdirectories() {
        let f = fixture();
        let root = f.tree.root().unwrap();
        assert_eq!(root.nlink(), 2);
        f.tree.children(ROOT_HANDLE, &f.auth).unwrap();
        assert_eq!(root.nlink(), 4);
        assert_eq!(root.size(), DIRECTORY_SIZE);

        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        f.tree.children(docs.handle(), &f.auth).unwrap();
        assert_eq!(docs.nlink(), 3);
        assert_eq!(docs.size(), DIRECTORY_SIZE);
    }

    #[test]
    fn test_child_paths_follow_parent() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        let a = f.tree.lookup(docs.handle(), "a.txt", &f.auth).unwrap();
        assert_eq!(a.path(), "/Documents/a.txt");
        assert_eq!(a.path(), a.path());
        assert_eq!(a.parent().handle, Some(docs.handle()));
    }

    #[test]
    fn test_new_item_inherits_parent_path() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        let item = f.tree.new_item(docs.handle(), "report.txt", 0o644).unwrap();
        assert!(item.id().is_empty());
        assert_eq!(item.path(), "/Documents/report.txt");
        assert_eq!(item.parent().id, docs.id());
        assert!(!item.is_dirty());
    }

    #[test]
    fn test_new_item_under_file_rejected() {
        let f = fixture();
        let notes = f.tree.lookup(ROOT_HANDLE, "notes.txt", &f.auth).unwrap();
        assert!(matches!(
            f.tree.new_item(notes.handle(), "x", 0o644),
            Err(ItemError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_insert_child_counts_subdirs_and_replaces() {
        let f = fixture();
        let music = f.tree.lookup(ROOT_HANDLE, "Music", &f.auth).unwrap();
        let album = f.tree.new_item(music.handle(), "Album", S_IFDIR | 0o755).unwrap();
        f.tree.insert_child(music.handle(), album.handle(), &f.auth).unwrap();
        assert_eq!(music.nlink(), 3);

        let replacement = f.tree.new_item(music.handle(), "ALBUM", 0o644).unwrap();
        f.tree
            .insert_child(music.handle(), replacement.handle(), &f.auth)
            .unwrap();
        assert_eq!(music.nlink(), 2);
        assert!(matches!(
            f.tree.get(album.handle()),
            Err(ItemError::StaleHandle(_))
        ));
    }

    #[test]
    fn test_remove_child_retires_descendants() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        let drafts = f.tree.lookup(docs.handle(), "Drafts", &f.auth).unwrap();
        let before = f.tree.len();

        f.tree.remove_child(ROOT_HANDLE, "documents").unwrap();
        assert!(f.tree.get(docs.handle()).is_err());
        assert!(f.tree.get(drafts.handle()).is_err());
        assert_eq!(f.tree.len(), before - 3);
        assert_eq!(f.tree.root().unwrap().nlink(), 3);
        assert!(matches!(
            f.tree.remove_child(ROOT_HANDLE, "Documents"),
            Err(ItemError::NotFound(_))
        ));
    }

    #[test]
    fn test_apply_remote_deletion() {
        let f = fixture();
        f.tree.children(ROOT_HANDLE, &f.auth).unwrap();
        let live = DriveItemRecord {
            name: "notes.txt".into(),
            ..Default::default()
        };
        assert!(!f.tree.apply_remote_deletion(ROOT_HANDLE, &live).unwrap());

        let deleted = DriveItemRecord {
            name: "notes.txt".into(),
            deleted: Some(crate::remote::DeletedFacet::default()),
            ..Default::default()
        };
        assert!(f.tree.apply_remote_deletion(ROOT_HANDLE, &deleted).unwrap());
        assert!(!f.tree.apply_remote_deletion(ROOT_HANDLE, &deleted).unwrap());
    }

    #[test]
    fn test_rename_moves_item_and_descendants() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        let drafts = f.tree.lookup(docs.handle(), "Drafts", &f.auth).unwrap();
        let music = f.tree.lookup(ROOT_HANDLE, "Music", &f.auth).unwrap();

        f.tree
            .rename(docs.handle(), music.handle(), "Papers", &f.auth)
            .unwrap();
        assert_eq!(docs.path(), "/Music/Papers");
        assert_eq!(drafts.path(), "/Music/Papers/Drafts");
        assert_eq!(docs.parent().id, music.id());
        assert!(f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).is_err());
        assert_eq!(
            f.tree.lookup(music.handle(), "papers", &f.auth).unwrap().handle(),
            docs.handle()
        );
        assert_eq!(music.nlink(), 3);
        assert_eq!(f.tree.root().unwrap().nlink(), 3);
    }

    #[test]
    fn test_rename_into_own_subtree_rejected() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        let drafts = f.tree.lookup(docs.handle(), "Drafts", &f.auth).unwrap();

        let err = f
            .tree
            .rename(docs.handle(), drafts.handle(), "Loop", &f.auth)
            .unwrap_err();
        assert!(matches!(err, ItemError::InvalidMove(_)));
        assert!(matches!(
            f.tree.rename(docs.handle(), docs.handle(), "Self", &f.auth),
            Err(ItemError::InvalidMove(_))
        ));

        assert_eq!(docs.path(), "/Documents");
        assert_eq!(drafts.path(), "/Documents/Drafts");
        assert_eq!(
            f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap().handle(),
            docs.handle()
        );
        assert!(f.tree.root_auth(drafts.handle()).is_ok());
    }

    #[test]
    fn test_renamed_unlisted_directory_is_not_found_remotely() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        assert!(!docs.children_populated());

        f.tree
            .rename(docs.handle(), ROOT_HANDLE, "Papers", &f.auth)
            .unwrap();
        assert_eq!(docs.path(), "/Papers");

        let err = f.tree.children(docs.handle(), &f.auth).unwrap_err();
        assert!(matches!(
            err,
            ItemError::Transport(TransportError::NotFound { ref path }) if path.contains("/Papers")
        ));
        assert!(!docs.children_populated());
        assert!(matches!(
            f.tree.lookup(docs.handle(), "a.txt", &f.auth),
            Err(ItemError::Transport(TransportError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_create_dir_gets_remote_id() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        let dir = f
            .tree
            .create_dir(docs.handle(), "Reports", 0o700, &f.auth)
            .unwrap();

        assert!(!dir.id().is_empty());
        assert_eq!(f.transport.id_at("/Documents/Reports"), Some(dir.id()));
        assert_eq!(dir.mode(), S_IFDIR | 0o700);
        assert!(dir.children_populated());
        assert_eq!(
            f.tree.lookup(docs.handle(), "reports", &f.auth).unwrap().handle(),
            dir.handle()
        );

        let file = f.tree.new_item(dir.handle(), "inner.txt", 0o644).unwrap();
        assert_eq!(file.parent().id, dir.id());
        let id = f.tree.resolve_id(file.handle(), &f.auth).unwrap();
        assert_eq!(f.transport.id_at("/Documents/Reports/inner.txt"), Some(id));
    }

    #[test]
    fn test_create_dir_on_taken_name_fails() {
        let f = fixture();
        let music = f.tree.lookup(ROOT_HANDLE, "Music", &f.auth).unwrap();
        let err = f
            .tree
            .create_dir(ROOT_HANDLE, "music", 0o755, &f.auth)
            .unwrap_err();
        assert!(matches!(
            err,
            ItemError::Transport(TransportError::AlreadyExists { .. })
        ));
        assert_eq!(
            f.tree.lookup(ROOT_HANDLE, "Music", &f.auth).unwrap().handle(),
            music.handle()
        );
        assert_eq!(f.tree.children(ROOT_HANDLE, &f.auth).unwrap().len(), 3);
    }

    #[test]
    fn test_resolve_id_cached_and_directory_fast_paths() {
        let f = fixture();
        let notes = f.tree.lookup(ROOT_HANDLE, "notes.txt", &f.auth).unwrap();
        let id = f.tree.resolve_id(notes.handle(), &f.auth).unwrap();
        assert_eq!(id, notes.id());

        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        let local_dir = f.tree.new_item(docs.handle(), "New", S_IFDIR | 0o755).unwrap();
        assert_eq!(f.tree.resolve_id(local_dir.handle(), &f.auth).unwrap(), "");
        assert_eq!(f.transport.puts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resolve_id_with_empty_auth_stays_local() {
        let f = fixture();
        let item = f.tree.new_item(ROOT_HANDLE, "local.txt", 0o644).unwrap();
        assert_eq!(f.tree.resolve_id(item.handle(), &Auth::empty()).unwrap(), "");
        assert_eq!(f.transport.puts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resolve_id_uploads_placeholder() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        let item = f.tree.new_item(docs.handle(), "report.txt", 0o644).unwrap();
        item.write(b"ABC", 0).unwrap();

        let id = f.tree.resolve_id(item.handle(), &f.auth).unwrap();
        assert!(!id.is_empty());
        assert_eq!(item.id(), id);
        assert_eq!(f.transport.id_at("/Documents/report.txt"), Some(id.clone()));
        // the throwaway decode leaves the live buffer alone
        assert_eq!(item.size(), 3);
        assert!(item.is_dirty());

        assert_eq!(f.tree.resolve_id(item.handle(), &f.auth).unwrap(), id);
        assert_eq!(f.transport.puts.load(Ordering::SeqCst), 1);
        assert_eq!(f.tree.stats().snapshot().placeholder_uploads, 1);
    }

    #[test]
    fn test_resolve_id_adopts_existing_on_conflict() {
        let f = fixture();
        let item = f.tree.new_item(ROOT_HANDLE, "clash.txt", 0o644).unwrap();
        let existing = f.transport.add_file("/", "clash.txt", b"theirs");
        f.transport.fail_on_conflict.store(true, Ordering::SeqCst);

        assert_eq!(f.tree.resolve_id(item.handle(), &f.auth).unwrap(), existing);
        assert_eq!(item.id(), existing);
    }

    #[test]
    fn test_resolve_id_conflict_prefers_id_stored_meanwhile() {
        let f = fixture();
        let item = f.tree.new_item(ROOT_HANDLE, "raced.txt", 0o644).unwrap();
        f.transport.add_file("/", "raced.txt", b"");
        f.transport.fail_on_conflict.store(true, Ordering::SeqCst);
        // an upload finishing while the placeholder request is in flight
        let racer = Arc::clone(&item);
        f.transport.set_put_hook(move |_| {
            racer.adopt_id("stored-by-upload");
        });
        let lookups = f.transport.lookups.load(Ordering::SeqCst);

        assert_eq!(
            f.tree.resolve_id(item.handle(), &f.auth).unwrap(),
            "stored-by-upload"
        );
        assert_eq!(item.id(), "stored-by-upload");
        assert_eq!(f.transport.lookups.load(Ordering::SeqCst), lookups);
        assert_eq!(f.transport.puts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolve_id_conflict_with_nothing_at_path_is_inconsistent() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        let item = f.tree.new_item(docs.handle(), "a.txt", 0o644).unwrap();
        f.tree.insert_child(docs.handle(), item.handle(), &f.auth).unwrap();
        f.tree
            .rename(docs.handle(), ROOT_HANDLE, "Papers", &f.auth)
            .unwrap();
        assert_eq!(item.path(), "/Papers/a.txt");
        f.transport.fail_on_conflict.store(true, Ordering::SeqCst);

        // taken under the parent's id, absent under the local path
        assert!(matches!(
            f.tree.resolve_id(item.handle(), &f.auth),
            Err(ItemError::Inconsistent(_))
        ));
        assert!(item.id().is_empty());
    }

    #[test]
    fn test_resolve_id_propagates_other_errors() {
        let f = fixture();
        let item = f.tree.new_item(ROOT_HANDLE, "x.txt", 0o644).unwrap();
        f.transport.fail_puts.store(true, Ordering::SeqCst);
        assert!(matches!(
            f.tree.resolve_id(item.handle(), &f.auth),
            Err(ItemError::Transport(TransportError::Network(_)))
        ));
        assert!(item.id().is_empty());
    }

    #[test]
    fn test_resolve_id_needs_parent_id() {
        let f = fixture();
        let dir = f.tree.new_item(ROOT_HANDLE, "Local", S_IFDIR | 0o755).unwrap();
        let file = f.tree.new_item(dir.handle(), "inner.txt", 0o644).unwrap();
        assert!(matches!(
            f.tree.resolve_id(file.handle(), &f.auth),
            Err(ItemError::UnresolvedParent(_))
        ));
    }

    #[test]
    fn test_ensure_content_fetches_once() {
        let f = fixture();
        let notes = f.tree.lookup(ROOT_HANDLE, "notes.txt", &f.auth).unwrap();
        assert!(!notes.has_content());
        assert_eq!(notes.size(), 8);

        f.tree.ensure_content(notes.handle(), &f.auth).unwrap();
        f.tree.ensure_content(notes.handle(), &f.auth).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(notes.read(&mut buf, 0).unwrap(), 8);
        assert_eq!(&buf, b"remember");
        assert!(!notes.is_dirty());
        assert_eq!(f.tree.stats().snapshot().content_fetches, 1);
    }

    #[test]
    fn test_flush_without_writes_uploads_nothing() {
        let f = fixture();
        let notes = f.tree.lookup(ROOT_HANDLE, "notes.txt", &f.auth).unwrap();
        f.tree.ensure_content(notes.handle(), &f.auth).unwrap();
        assert!(!f.tree.flush(notes.handle()).unwrap());

        let fresh = f.tree.new_item(ROOT_HANDLE, "fresh.txt", 0o644).unwrap();
        assert!(!f.tree.flush(fresh.handle()).unwrap());
        assert_eq!(f.tree.stats().snapshot().uploads_dispatched, 0);
        assert!(f.uploader.jobs().is_empty());
    }

    #[test]
    fn test_flush_dispatches_dirty_content_with_root_auth() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        let item = f.tree.new_item(docs.handle(), "report.txt", 0o644).unwrap();
        item.write(&[0x41, 0x42, 0x43], 0).unwrap();

        assert!(f.tree.flush(item.handle()).unwrap());
        assert!(!item.is_dirty());
        assert!(!f.tree.flush(item.handle()).unwrap());

        assert!(f.uploader.wait_for(1, Duration::from_secs(5)));
        let job = &f.uploader.jobs()[0];
        assert_eq!(&job.content[..], b"ABC");
        assert_eq!(job.parent_id, docs.id());
        assert_eq!(job.name, "report.txt");
        assert!(Arc::ptr_eq(&job.auth, &f.auth));
    }

    #[test]
    fn test_flush_refuses_item_without_addressable_parent() {
        let f = fixture();
        let dir = f.tree.new_item(ROOT_HANDLE, "Local", S_IFDIR | 0o755).unwrap();
        let file = f.tree.new_item(dir.handle(), "inner.txt", 0o644).unwrap();
        file.write(b"keep", 0).unwrap();

        assert!(matches!(
            f.tree.flush(file.handle()),
            Err(ItemError::UnresolvedParent(_))
        ));
        assert!(file.is_dirty());
        assert_eq!(f.tree.stats().snapshot().uploads_dispatched, 0);
    }

    #[test]
    fn test_flush_uses_parent_id_assigned_later() {
        let f = fixture();
        let dir = f.tree.new_item(ROOT_HANDLE, "Later", S_IFDIR | 0o755).unwrap();
        let file = f.tree.new_item(dir.handle(), "inner.txt", 0o644).unwrap();
        file.write(b"data", 0).unwrap();
        dir.adopt_id("dir-id");

        assert!(f.tree.flush(file.handle()).unwrap());
        assert!(f.uploader.wait_for(1, Duration::from_secs(5)));
        assert_eq!(f.uploader.jobs()[0].parent_id, "dir-id");
    }

    #[test]
    fn test_root_auth_found_from_deep_item() {
        let f = fixture();
        let docs = f.tree.lookup(ROOT_HANDLE, "Documents", &f.auth).unwrap();
        let drafts = f.tree.lookup(docs.handle(), "Drafts", &f.auth).unwrap();
        let auth = f.tree.root_auth(drafts.handle()).unwrap();
        assert!(Arc::ptr_eq(&auth, &f.auth));
    }
}
