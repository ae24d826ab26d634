//! Background upload of flushed content.
//!
//! Flushing an item hands an [`UploadJob`] to the [`UploadDispatcher`] and
//! returns immediately. The dispatcher runs a fixed number of worker lanes;
//! jobs are routed by item handle, so uploads of one item happen in the
//! order they were flushed while different items upload in parallel.
//!
//! Failures are logged and counted in [`CacheStats`]; they are never
//! reported back to whoever flushed.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace};

use crate::auth::Auth;
use crate::error::{ItemError, ItemResult};
use crate::item::{Item, ItemHandle};
use crate::remote::{content_path, placeholder_path, DriveItemRecord, RemoteTransport};
use crate::stats::CacheStats;

/// Default number of upload lanes.
pub const DEFAULT_UPLOAD_WORKERS: usize = 4;

/// A snapshot of one item's content to upload.
#[derive(Clone)]
pub struct UploadJob {
    pub handle: ItemHandle,
    /// The live item, so a server-assigned id can be recorded on it.
    pub item: Arc<Item>,
    pub name: String,
    /// Parent's remote identifier.
    pub parent_id: String,
    /// Item's remote identifier, empty if not assigned yet.
    pub id: String,
    pub content: Bytes,
    pub auth: Arc<Auth>,
}

impl std::fmt::Debug for UploadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadJob")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("parent_id", &self.parent_id)
            .field("id", &self.id)
            .field("len", &self.content.len())
            .finish_non_exhaustive()
    }
}

/// Performs the actual upload of a job.
///
/// Returns the identifier the server assigned, if the response carried one.
pub trait Uploader: Send + Sync {
    fn upload(&self, job: &UploadJob) -> ItemResult<Option<String>>;
}

/// Uploads through a [`RemoteTransport`] with a single PUT.
///
/// Items with an identifier are written by id; items without one are written
/// by name under their parent, which also creates them. A job with neither
/// identifier has no address on the server and is refused.
pub struct TransportUploader {
    transport: Arc<dyn RemoteTransport>,
}

impl TransportUploader {
    pub fn new(transport: Arc<dyn RemoteTransport>) -> Self {
        Self { transport }
    }
}

impl Uploader for TransportUploader {
    fn upload(&self, job: &UploadJob) -> ItemResult<Option<String>> {
        let path = match (job.id.is_empty(), job.parent_id.is_empty()) {
            (false, _) => content_path(&job.id),
            (true, false) => placeholder_path(&job.parent_id, &job.name),
            (true, true) => return Err(ItemError::UnresolvedParent(job.name.clone())),
        };
        let body = self.transport.put(&path, &job.auth, &job.content)?;
        if body.is_empty() {
            return Ok(None);
        }
        let record: DriveItemRecord = serde_json::from_slice(&body)?;
        Ok((!record.id.is_empty()).then_some(record.id))
    }
}

/// Fixed pool of upload lanes.
pub struct UploadDispatcher {
    lanes: Vec<Sender<UploadJob>>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<CacheStats>,
}

impl UploadDispatcher {
    /// Starts `workers` lanes (at least one).
    pub fn new(uploader: Arc<dyn Uploader>, workers: usize, stats: Arc<CacheStats>) -> io::Result<Self> {
        let workers = workers.max(1);
        let mut lanes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for lane in 0..workers {
            let (tx, rx) = unbounded();
            let uploader = Arc::clone(&uploader);
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("upload-{lane}"))
                .spawn(move || lane_loop(lane, &rx, uploader.as_ref(), &stats))?;
            lanes.push(tx);
            handles.push(handle);
        }

        info!(workers, "Upload dispatcher started");
        Ok(Self {
            lanes,
            workers: handles,
            stats,
        })
    }

    /// Queues a job. Never blocks on the upload itself.
    pub fn dispatch(&self, job: UploadJob) {
        let lane = usize::try_from(job.handle.as_raw() % self.lanes.len() as u64).unwrap_or(0);
        trace!(?job, lane, "Dispatching upload");
        self.stats.record_upload_dispatched();
        if let Err(rejected) = self.lanes[lane].send(job) {
            error!(job = ?rejected.0, "Upload lane closed, dropping job");
            self.stats.record_upload_failure();
        }
    }

    /// Number of lanes.
    pub fn workers(&self) -> usize {
        self.lanes.len()
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }
}

impl Drop for UploadDispatcher {
    fn drop(&mut self) {
        // Closing the senders lets every lane drain its queue and exit.
        self.lanes.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("Upload dispatcher stopped");
    }
}

fn lane_loop(lane: usize, rx: &Receiver<UploadJob>, uploader: &dyn Uploader, stats: &CacheStats) {
    debug!(lane, "Upload lane started");
    for job in rx {
        match uploader.upload(&job) {
            Ok(assigned) => {
                if let Some(id) = assigned {
                    job.item.adopt_id(&id);
                }
                stats.record_upload_completed();
                debug!(lane, name = %job.name, bytes = job.content.len(), "Upload complete");
            }
            Err(e) => {
                stats.record_upload_failure();
                error!(lane, name = %job.name, parent_id = %job.parent_id, error = %e, "Upload failed");
            }
        }
    }
    debug!(lane, "Upload lane exiting");
}
