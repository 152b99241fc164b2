//! Registry of open documents

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::types::{DocumentHandle, DocumentId};
use crate::error::{AccelError, Result};

/// Thread-safe map of open document handles
#[derive(Clone, Default)]
pub struct DocumentRegistry {
    documents: Arc<RwLock<HashMap<DocumentId, Arc<DocumentHandle>>>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an opened document
    pub fn insert(&self, handle: DocumentHandle) -> Arc<DocumentHandle> {
        let handle = Arc::new(handle);
        self.documents.write().insert(handle.id(), handle.clone());
        handle
    }

    /// Look up an open document
    pub fn get(&self, id: DocumentId) -> Result<Arc<DocumentHandle>> {
        self.documents
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| AccelError::DocumentNotOpen(id.to_string()))
    }

    /// Remove a document, returning its handle if it was open
    pub fn remove(&self, id: DocumentId) -> Option<Arc<DocumentHandle>> {
        self.documents.write().remove(&id)
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.documents.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    pub fn ids(&self) -> Vec<DocumentId> {
        self.documents.read().keys().copied().collect()
    }
}
