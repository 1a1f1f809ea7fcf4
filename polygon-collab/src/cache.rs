//! Derived-geometry cache invalidation.
//!
//! Tessellated geometry is derived from the operation log and cached per
//! document. Any change to a document's operations makes its cache stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use log::debug;
use polygon_core::DocumentId;

pub trait GeometryCache: Send + Sync {
    /// Mark the document's derived geometry stale.
    fn invalidate(&self, document_id: DocumentId);
}

/// In-memory validity flags per document.
#[derive(Debug, Default)]
pub struct GeometryCacheRegistry {
    valid: RwLock<HashMap<DocumentId, bool>>,
    invalidations: AtomicU64,
}

impl GeometryCacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that geometry was rebuilt for the document.
    pub fn mark_valid(&self, document_id: DocumentId) {
        if let Ok(mut valid) = self.valid.write() {
            valid.insert(document_id, true);
        }
    }

    pub fn is_valid(&self, document_id: DocumentId) -> bool {
        self.valid
            .read()
            .map(|valid| valid.get(&document_id).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    /// Total invalidations across all documents.
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl GeometryCache for GeometryCacheRegistry {
    fn invalidate(&self, document_id: DocumentId) {
        if let Ok(mut valid) = self.valid.write() {
            valid.insert(document_id, false);
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!("Geometry cache invalidated for document {document_id}");
    }
}
