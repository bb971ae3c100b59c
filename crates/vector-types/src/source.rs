//! Vector source collaborator.
//!
//! The index never owns canonical vectors. Whenever it needs one it does not
//! hold (repair during cleanup, training samples, commit-log replay) it asks
//! the vector source.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::SourceError;
use crate::VectorId;

/// Supplies the canonical vector for an id. Must be safe to call concurrently.
pub trait VectorSource: Send + Sync {
    fn fetch_vector(&self, id: VectorId) -> Result<Vec<f32>, SourceError>;
}

impl<F> VectorSource for F
where
    F: Fn(VectorId) -> Option<Vec<f32>> + Send + Sync,
{
    fn fetch_vector(&self, id: VectorId) -> Result<Vec<f32>, SourceError> {
        self(id).ok_or(SourceError::NotFound(id))
    }
}

/// Map-backed vector source, used by harnesses and tests.
#[derive(Debug, Default)]
pub struct InMemoryVectorSource {
    vectors: RwLock<HashMap<VectorId, Vec<f32>>>,
}

impl InMemoryVectorSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source where vector `i` has id `i`.
    pub fn from_vectors(vectors: &[Vec<f32>]) -> Self {
        let source = Self::new();
        {
            let mut map = source.vectors.write();
            for (i, v) in vectors.iter().enumerate() {
                map.insert(i as VectorId, v.clone());
            }
        }
        source
    }

    pub fn put(&self, id: VectorId, vector: Vec<f32>) {
        self.vectors.write().insert(id, vector);
    }

    pub fn remove(&self, id: VectorId) -> Option<Vec<f32>> {
        self.vectors.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.vectors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VectorSource for InMemoryVectorSource {
    fn fetch_vector(&self, id: VectorId) -> Result<Vec<f32>, SourceError> {
        self.vectors
            .read()
            .get(&id)
            .cloned()
            .ok_or(SourceError::NotFound(id))
    }
}
