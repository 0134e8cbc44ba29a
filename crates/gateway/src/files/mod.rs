//! File command protocol and chunked uploads.
//!
//! - [`requests`]: request/response correlation for list, read, write,
//!   rename, delete and download, with one request in flight per class
//! - [`upload`]: the lock-step chunked upload state machine
//!
//! Remote paths are POSIX strings and are never interpreted with the local
//! platform's path rules.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub mod requests;
pub mod upload;

pub use requests::{FileOp, RequestClass};
pub use upload::{Transfer, UploadOutcome, UploadState};

/// Directories a caller should re-list after a mutation.
///
/// Mutations never update any cached listing; refreshing is an explicit
/// caller action (see `Session::refresh`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Refresh {
    pub directories: Vec<String>,
}

impl Refresh {
    /// The containing directories of `paths`, deduplicated in order.
    pub fn parents_of(paths: &[&str]) -> Self {
        let mut directories: Vec<String> = Vec::with_capacity(paths.len());
        for path in paths {
            let parent = parent_dir(path);
            if !directories.contains(&parent) {
                directories.push(parent);
            }
        }
        Self { directories }
    }

    pub fn is_empty(&self) -> bool {
        self.directories.is_empty()
    }
}

/// Correlation ids for file requests and upload transfers.
///
/// One counter is shared by every session on a transport, so an id is never
/// reused even when a session is closed and reopened under the same name.
#[derive(Debug, Clone)]
pub(crate) struct CorrelationIds(Arc<AtomicU64>);

impl Default for CorrelationIds {
    fn default() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }
}

impl CorrelationIds {
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Parent directory of a remote POSIX path.
///
/// `"/root/x.txt"` → `"/root"`, `"/x"` → `"/"`, `"notes.md"` → `"."`.
pub fn parent_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        None => ".".to_string(),
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}
