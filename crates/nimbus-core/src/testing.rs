//! In-memory test doubles for the remote drive.
//!
//! [`MemoryTransport`] answers the same resource paths the real API does,
//! backed by a small in-memory drive. [`RecordingUploader`] captures upload
//! jobs instead of sending them.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::auth::Auth;
use crate::error::{ItemResult, TransportError, TransportResult};
use crate::remote::{
    DeletedFacet, DriveChildren, DriveItemRecord, FileFacet, FolderFacet, ParentRecord,
    RemoteTransport, ROOT_MARKER,
};
use crate::upload::{UploadJob, Uploader};

/// Identifier of the in-memory drive's root folder.
pub const MEMORY_ROOT_ID: &str = "root-id";

/// Callback run at the start of every PUT, with the requested path.
pub type PutHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    parent_id: Option<String>,
    is_dir: bool,
    deleted: bool,
    content: Vec<u8>,
}

#[derive(Debug)]
struct Drive {
    nodes: HashMap<String, Node>,
    next_id: u64,
}

impl Drive {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("item-{}", self.next_id)
    }

    fn path_of(&self, id: &str) -> String {
        let mut segments = Vec::new();
        let mut current = self.nodes.get(id);
        while let Some(node) = current {
            let Some(parent_id) = &node.parent_id else {
                break;
            };
            segments.push(node.name.clone());
            current = self.nodes.get(parent_id);
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    fn child_named(&self, parent_id: &str, name: &str) -> Option<String> {
        let wanted = name.to_lowercase();
        self.nodes
            .iter()
            .find(|(_, n)| {
                !n.deleted && n.parent_id.as_deref() == Some(parent_id) && n.name.to_lowercase() == wanted
            })
            .map(|(id, _)| id.clone())
    }

    fn resolve(&self, path: &str) -> Option<String> {
        let mut current = MEMORY_ROOT_ID.to_string();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = self.child_named(&current, segment)?;
        }
        Some(current)
    }

    fn record(&self, id: &str) -> Option<DriveItemRecord> {
        let node = self.nodes.get(id)?;
        let parent = node.parent_id.as_ref().map(|parent_id| {
            let parent_path = self.path_of(parent_id);
            ParentRecord {
                id: parent_id.clone(),
                path: if parent_path == "/" {
                    ROOT_MARKER.to_string()
                } else {
                    format!("{ROOT_MARKER}{parent_path}")
                },
            }
        });
        Some(DriveItemRecord {
            id: id.to_string(),
            name: node.name.clone(),
            size: node.content.len() as u64,
            last_modified: None,
            parent,
            folder: node.is_dir.then(FolderFacet::default),
            file: (!node.is_dir).then(FileFacet::default),
            deleted: node.deleted.then(DeletedFacet::default),
            conflict_behavior: None,
        })
    }

    fn listing(&self, parent_id: &str) -> DriveChildren {
        let mut ids: Vec<&String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.parent_id.as_deref() == Some(parent_id))
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        DriveChildren {
            value: ids.into_iter().filter_map(|id| self.record(id)).collect(),
            next_link: None,
        }
    }
}

/// An in-memory drive speaking the remote API's resource paths.
pub struct MemoryTransport {
    drive: Mutex<Drive>,
    put_paths: Mutex<Vec<String>>,
    put_hook: Mutex<Option<PutHook>>,
    pub gets: AtomicU64,
    pub puts: AtomicU64,
    pub posts: AtomicU64,
    pub listings: AtomicU64,
    pub lookups: AtomicU64,
    /// When set, a PUT by name onto an existing name fails with "already exists".
    pub fail_on_conflict: AtomicBool,
    /// When set, every PUT and POST fails with a network error.
    pub fail_puts: AtomicBool,
    /// When set, every listing fails with a network error.
    pub fail_listings: AtomicBool,
    /// Artificial latency added to each PUT.
    put_delay: Mutex<Duration>,
}

impl MemoryTransport {
    /// Creates a drive containing only the root folder.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            MEMORY_ROOT_ID.to_string(),
            Node {
                name: "root".to_string(),
                parent_id: None,
                is_dir: true,
                deleted: false,
                content: Vec::new(),
            },
        );
        Self {
            drive: Mutex::new(Drive { nodes, next_id: 0 }),
            put_paths: Mutex::new(Vec::new()),
            put_hook: Mutex::new(None),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            posts: AtomicU64::new(0),
            listings: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            fail_on_conflict: AtomicBool::new(false),
            fail_puts: AtomicBool::new(false),
            fail_listings: AtomicBool::new(false),
            put_delay: Mutex::new(Duration::ZERO),
        }
    }

    fn add_node(&self, parent_path: &str, name: &str, is_dir: bool, deleted: bool, content: &[u8]) -> String {
        let mut drive = self.drive.lock();
        let parent_id = drive
            .resolve(parent_path)
            .unwrap_or_else(|| panic!("no folder at {parent_path}"));
        let id = drive.allocate_id();
        drive.nodes.insert(
            id.clone(),
            Node {
                name: name.to_string(),
                parent_id: Some(parent_id),
                is_dir,
                deleted,
                content: content.to_vec(),
            },
        );
        id
    }

    /// Adds a folder and returns its identifier.
    pub fn add_dir(&self, parent_path: &str, name: &str) -> String {
        self.add_node(parent_path, name, true, false, &[])
    }

    /// Adds a file and returns its identifier.
    pub fn add_file(&self, parent_path: &str, name: &str, content: &[u8]) -> String {
        self.add_node(parent_path, name, false, false, content)
    }

    /// Adds a server-side deletion marker to a folder's listing.
    pub fn add_deleted(&self, parent_path: &str, name: &str) -> String {
        self.add_node(parent_path, name, false, true, &[])
    }

    /// Content stored for an identifier.
    pub fn content_of(&self, id: &str) -> Option<Vec<u8>> {
        self.drive.lock().nodes.get(id).map(|n| n.content.clone())
    }

    /// Identifier of the live item at a path.
    pub fn id_at(&self, path: &str) -> Option<String> {
        self.drive.lock().resolve(path)
    }

    /// Every path PUT so far, in order.
    pub fn put_paths(&self) -> Vec<String> {
        self.put_paths.lock().clone()
    }

    /// Runs `hook` at the start of every PUT, before the drive is touched.
    pub fn set_put_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.put_hook.lock() = Some(Arc::new(hook));
    }

    /// Makes every PUT sleep before answering.
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock() = delay;
    }

    fn not_found(path: &str) -> TransportError {
        TransportError::NotFound {
            path: path.to_string(),
        }
    }

    fn encode(record: &DriveItemRecord) -> TransportResult<Vec<u8>> {
        Ok(serde_json::to_vec(record)?)
    }

    fn put_by_name(&self, parent_id: &str, name: &str, body: &[u8], path: &str) -> TransportResult<Vec<u8>> {
        let mut drive = self.drive.lock();
        if !drive.nodes.get(parent_id).is_some_and(|n| n.is_dir && !n.deleted) {
            return Err(Self::not_found(path));
        }
        let id = match drive.child_named(parent_id, name) {
            Some(_) if self.fail_on_conflict.load(Ordering::SeqCst) => {
                return Err(TransportError::AlreadyExists {
                    message: format!("{name} already exists"),
                });
            }
            Some(existing) => existing,
            None => {
                let id = drive.allocate_id();
                drive.nodes.insert(
                    id.clone(),
                    Node {
                        name: name.to_string(),
                        parent_id: Some(parent_id.to_string()),
                        is_dir: false,
                        deleted: false,
                        content: Vec::new(),
                    },
                );
                id
            }
        };
        if let Some(node) = drive.nodes.get_mut(&id) {
            node.content = body.to_vec();
        }
        let record = drive.record(&id).ok_or_else(|| Self::not_found(path))?;
        Self::encode(&record)
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("items", &self.drive.lock().nodes.len())
            .field("gets", &self.gets)
            .field("puts", &self.puts)
            .field("posts", &self.posts)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteTransport for MemoryTransport {
    fn get(&self, path: &str, auth: &Auth) -> TransportResult<Vec<u8>> {
        if auth.is_empty() {
            return Err(TransportError::Unauthorized);
        }
        self.gets.fetch_add(1, Ordering::SeqCst);

        if let Some(id) = path
            .strip_prefix("/me/drive/items/")
            .and_then(|rest| rest.strip_suffix("/content"))
        {
            return self.content_of(id).ok_or_else(|| Self::not_found(path));
        }

        let listing_of = if path == "/me/drive/root/children" {
            Some("/")
        } else {
            path.strip_prefix("/me/drive/root:")
                .and_then(|rest| rest.strip_suffix(":/children"))
        };
        if let Some(folder) = listing_of {
            self.listings.fetch_add(1, Ordering::SeqCst);
            if self.fail_listings.load(Ordering::SeqCst) {
                return Err(TransportError::Network("connection reset".to_string()));
            }
            let drive = self.drive.lock();
            let id = drive.resolve(folder).ok_or_else(|| Self::not_found(path))?;
            return Ok(serde_json::to_vec(&drive.listing(&id))?);
        }

        let item_path = if path == "/me/drive/root" {
            Some("/")
        } else {
            path.strip_prefix("/me/drive/root:")
        };
        if let Some(item_path) = item_path {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let drive = self.drive.lock();
            let record = drive
                .resolve(item_path)
                .and_then(|id| drive.record(&id))
                .ok_or_else(|| Self::not_found(path))?;
            return Self::encode(&record);
        }

        Err(Self::not_found(path))
    }

    fn put(&self, path: &str, auth: &Auth, body: &[u8]) -> TransportResult<Vec<u8>> {
        if auth.is_empty() {
            return Err(TransportError::Unauthorized);
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.put_paths.lock().push(path.to_string());
        let hook = self.put_hook.lock().clone();
        if let Some(hook) = hook {
            hook(path);
        }

        let delay = *self.put_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(TransportError::Network("connection reset".to_string()));
        }

        let target = path
            .strip_prefix("/me/drive/items/")
            .and_then(|rest| rest.strip_suffix("/content"))
            .ok_or_else(|| Self::not_found(path))?;

        if let Some((parent_id, name)) = target
            .strip_suffix(':')
            .and_then(|t| t.split_once(":/"))
        {
            return self.put_by_name(parent_id, name, body, path);
        }

        let mut drive = self.drive.lock();
        let node = drive.nodes.get_mut(target).ok_or_else(|| Self::not_found(path))?;
        node.content = body.to_vec();
        let record = drive.record(target).ok_or_else(|| Self::not_found(path))?;
        Self::encode(&record)
    }

    fn post(&self, path: &str, auth: &Auth, body: &[u8]) -> TransportResult<Vec<u8>> {
        if auth.is_empty() {
            return Err(TransportError::Unauthorized);
        }
        self.posts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(TransportError::Network("connection reset".to_string()));
        }
        let parent_id = path
            .strip_prefix("/me/drive/items/")
            .and_then(|rest| rest.strip_suffix("/children"))
            .ok_or_else(|| Self::not_found(path))?;
        self.create_folder_node(parent_id, body, path)
    }
}

impl MemoryTransport {
    fn create_folder_node(&self, parent_id: &str, body: &[u8], path: &str) -> TransportResult<Vec<u8>> {
        let request: DriveItemRecord = serde_json::from_slice(body)?;
        let mut drive = self.drive.lock();
        if !drive.nodes.get(parent_id).is_some_and(|n| n.is_dir && !n.deleted) {
            return Err(Self::not_found(path));
        }
        if drive.child_named(parent_id, &request.name).is_some() {
            return Err(TransportError::AlreadyExists {
                message: format!("{} already exists", request.name),
            });
        }
        let id = drive.allocate_id();
        drive.nodes.insert(
            id.clone(),
            Node {
                name: request.name,
                parent_id: Some(parent_id.to_string()),
                is_dir: true,
                deleted: false,
                content: Vec::new(),
            },
        );
        let record = drive.record(&id).ok_or_else(|| Self::not_found(path))?;
        Self::encode(&record)
    }
}

/// An [`Uploader`] that records jobs instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingUploader {
    jobs: Mutex<Vec<UploadJob>>,
    arrived: Condvar,
    failing: AtomicBool,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent uploads fail with a network error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Jobs received so far.
    pub fn jobs(&self) -> Vec<UploadJob> {
        self.jobs.lock().clone()
    }

    /// Blocks until at least `count` jobs arrived or `timeout` elapses.
    ///
    /// Returns true if the count was reached.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut jobs = self.jobs.lock();
        while jobs.len() < count {
            if self.arrived.wait_until(&mut jobs, deadline).timed_out() {
                return jobs.len() >= count;
            }
        }
        true
    }
}

impl Uploader for RecordingUploader {
    fn upload(&self, job: &UploadJob) -> ItemResult<Option<String>> {
        self.jobs.lock().push(job.clone());
        self.arrived.notify_all();
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Network("upload refused".to_string()).into());
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_drive_paths() {
        let transport = MemoryTransport::new();
        let docs = transport.add_dir("/", "Documents");
        let file = transport.add_file("/Documents", "a.txt", b"abc");
        let auth = Auth::new("t");

        let record = transport.item_by_path("/documents/A.TXT", &auth).unwrap();
        assert_eq!(record.id, file);
        assert_eq!(record.parent.unwrap().path, "/drive/root:/Documents");

        let root_children = transport.children_of("/", &auth).unwrap();
        assert_eq!(root_children.len(), 1);
        assert_eq!(root_children[0].id, docs);
        assert_eq!(root_children[0].parent.as_ref().unwrap().path, "/drive/root:");
    }

    #[test]
    fn test_memory_drive_rejects_empty_auth() {
        let transport = MemoryTransport::new();
        assert!(matches!(
            transport.get("/me/drive/root", &Auth::empty()),
            Err(TransportError::Unauthorized)
        ));
    }

    #[test]
    fn test_create_folder_then_conflict() {
        let transport = MemoryTransport::new();
        let auth = Auth::new("t");
        let record = transport.create_folder(MEMORY_ROOT_ID, "Reports", &auth).unwrap();
        assert_eq!(transport.id_at("/Reports"), Some(record.id.clone()));
        assert_eq!(record.kind(), crate::item::ItemKind::Directory);

        let err = transport
            .create_folder(MEMORY_ROOT_ID, "reports", &auth)
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(transport.posts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_put_by_name_creates_then_conflicts() {
        let transport = MemoryTransport::new();
        let auth = Auth::new("t");
        let path = "/me/drive/items/root-id:/new.txt:/content";

        let body = transport.put(path, &auth, b"").unwrap();
        let record: DriveItemRecord = serde_json::from_slice(&body).unwrap();
        assert!(!record.id.is_empty());

        transport.fail_on_conflict.store(true, Ordering::SeqCst);
        assert!(transport.put(path, &auth, b"").unwrap_err().is_already_exists());
    }
}
