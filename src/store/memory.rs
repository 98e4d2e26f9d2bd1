//! In-memory object store with fault injection, for tests and dry runs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ObjectStore, UploadError};

/// Keeps uploaded objects in a map keyed by object key.
///
/// Faults:
/// - [`MemoryStore::set_unreachable`] fails every put, like a dead endpoint
/// - [`MemoryStore::fail_keys_containing`] fails puts whose key contains a
///   fragment, like a per-object permission error
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Keys of successful puts, in call order
    put_log: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    failing_fragments: Mutex<Vec<String>>,
    attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent put fail (or succeed again).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail puts whose key contains `fragment`.
    pub fn fail_keys_containing(&self, fragment: impl Into<String>) {
        self.failing_fragments
            .lock()
            .expect("failing_fragments lock poisoned")
            .push(fragment.into());
    }

    /// Keys of successful puts in the order they happened, repeats included
    pub fn put_log(&self) -> Vec<String> {
        self.put_log.lock().expect("put_log lock poisoned").clone()
    }

    /// Stored keys, ordered
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .expect("objects lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().expect("objects lock poisoned").get(key).cloned()
    }

    /// Number of put attempts, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn injected_fault(&self, key: &str) -> Option<UploadError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Some(UploadError::Request {
                operation: "PutObject",
                key: key.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let rejected = self
            .failing_fragments
            .lock()
            .expect("failing_fragments lock poisoned")
            .iter()
            .any(|f| key.contains(f.as_str()));
        rejected.then(|| UploadError::Rejected {
            key: key.to_string(),
            reason: "AccessDenied".to_string(),
        })
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), UploadError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.injected_fault(key) {
            return Err(err);
        }
        let bytes = tokio::fs::read(path).await.map_err(|source| UploadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.objects
            .lock()
            .expect("objects lock poisoned")
            .insert(key.to_string(), bytes);
        self.put_log
            .lock()
            .expect("put_log lock poisoned")
            .push(key.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
