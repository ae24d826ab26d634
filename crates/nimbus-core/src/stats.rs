//! Activity counters for an item tree.
//!
//! Lock-free atomic counters recording how often the cache went to the
//! server and what the upload lanes did. Upload failures are only ever
//! surfaced here and in the log, never to the caller that flushed.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one mounted tree.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Children listings fetched from the server.
    pub listings: AtomicU64,
    /// Empty-body uploads issued to obtain an identifier.
    pub placeholder_uploads: AtomicU64,
    /// File bodies downloaded.
    pub content_fetches: AtomicU64,
    /// Upload jobs handed to the dispatcher.
    pub uploads_dispatched: AtomicU64,
    /// Upload jobs the uploader completed successfully.
    pub uploads_completed: AtomicU64,
    /// Upload jobs that failed.
    pub upload_failures: AtomicU64,
    /// Items currently live in the tree.
    pub items: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_listing(&self) {
        self.listings.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_placeholder_upload(&self) {
        self.placeholder_uploads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_content_fetch(&self) {
        self.content_fetches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_upload_dispatched(&self) {
        self.uploads_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_upload_completed(&self) {
        self.uploads_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_upload_failure(&self) {
        self.upload_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_insert(&self) {
        self.items.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_remove(&self) {
        // Saturate rather than wrap if removal is ever double counted.
        let _ = self
            .items
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    /// Uploads dispatched but not yet finished (successfully or not).
    pub fn uploads_in_flight(&self) -> u64 {
        let dispatched = self.uploads_dispatched.load(Ordering::Relaxed);
        let done = self.uploads_completed.load(Ordering::Relaxed)
            + self.upload_failures.load(Ordering::Relaxed);
        dispatched.saturating_sub(done)
    }

    /// Create a snapshot of current values.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            listings: self.listings.load(Ordering::Relaxed),
            placeholder_uploads: self.placeholder_uploads.load(Ordering::Relaxed),
            content_fetches: self.content_fetches.load(Ordering::Relaxed),
            uploads_dispatched: self.uploads_dispatched.load(Ordering::Relaxed),
            uploads_completed: self.uploads_completed.load(Ordering::Relaxed),
            upload_failures: self.upload_failures.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub listings: u64,
    pub placeholder_uploads: u64,
    pub content_fetches: u64,
    pub uploads_dispatched: u64,
    pub uploads_completed: u64,
    pub upload_failures: u64,
    pub items: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let stats = CacheStats::new();
        stats.record_listing();
        stats.record_listing();
        stats.record_placeholder_upload();
        stats.record_upload_dispatched();
        stats.record_upload_dispatched();
        stats.record_upload_completed();

        let snap = stats.snapshot();
        assert_eq!(snap.listings, 2);
        assert_eq!(snap.placeholder_uploads, 1);
        assert_eq!(snap.uploads_dispatched, 2);
        assert_eq!(stats.uploads_in_flight(), 1);

        stats.record_upload_failure();
        assert_eq!(stats.uploads_in_flight(), 0);
    }

    #[test]
    fn test_item_count_saturates() {
        let stats = CacheStats::new();
        stats.record_remove();
        assert_eq!(stats.snapshot().items, 0);
        stats.record_insert();
        stats.record_insert();
        stats.record_remove();
        assert_eq!(stats.snapshot().items, 1);
    }
}
