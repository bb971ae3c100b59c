//! One-way switch to product-quantized distances.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vector_pq::{PqConfig, ProductQuantizer};
use vector_types::CommitOp;

use crate::error::GraphError;
use crate::graph::Graph;

impl Graph {
    /// Train a quantizer on the graph's vectors and switch to compressed mode.
    ///
    /// Every node is re-encoded and the raw vector cache is dropped. Later
    /// inserts are encoded on arrival. Calling this on a compressed graph is
    /// a configuration error.
    pub fn compress(&self, config: &PqConfig, cancel: &CancellationToken) -> Result<(), GraphError> {
        let _pass = self.maintenance.lock();
        if self.is_compressed() {
            return Err(GraphError::Configuration(format!(
                "graph '{}' is already compressed",
                self.name
            )));
        }

        let started = Instant::now();
        let live: Vec<_> = self
            .all_nodes()
            .into_iter()
            .filter(|n| !n.is_tombstoned())
            .map(|n| n.id)
            .collect();
        config.validate(self.config.dimensions, live.len())?;

        let stride = live.len().div_ceil(config.training_limit).max(1);
        let mut samples = Vec::with_capacity(live.len() / stride + 1);
        for id in live.iter().step_by(stride) {
            if cancel.is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            samples.push(self.vector(*id)?);
        }
        let slices: Vec<&[f32]> = samples.iter().map(|v| v.as_ref()).collect();

        let pq = ProductQuantizer::train(
            &slices,
            self.config.dimensions,
            config,
            Arc::clone(&self.distance),
            cancel,
        )?;
        drop(samples);

        self.install_quantizer(Arc::new(pq), true)?;
        info!(
            graph = %self.name,
            nodes = live.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Graph compressed"
        );
        Ok(())
    }

    /// Encode every node with `pq` and swap it in.
    pub(crate) fn install_quantizer(&self, pq: Arc<ProductQuantizer>, log: bool) -> Result<(), GraphError> {
        if pq.dimensions() != self.config.dimensions {
            return Err(GraphError::CorruptState(format!(
                "codebook has {} dimensions, graph has {}",
                pq.dimensions(),
                self.config.dimensions
            )));
        }
        if pq.distance_kind() != self.config.distance {
            return Err(GraphError::CorruptState(format!(
                "codebook built for {}, graph uses {}",
                pq.distance_kind(),
                self.config.distance
            )));
        }

        let _structure = self.structure.write();
        for node in self.all_nodes() {
            let vector = match self.vector(node.id) {
                Ok(v) => v,
                Err(GraphError::NotFound(id)) if node.is_tombstoned() => {
                    warn!(graph = %self.name, id, "No vector for tombstoned node, left unencoded");
                    continue;
                }
                Err(e) => {
                    self.codes.clear();
                    return Err(e);
                }
            };
            match pq.encode(&vector) {
                Ok(code) => {
                    self.codes.insert(node.id, code.into());
                }
                Err(e) => {
                    self.codes.clear();
                    return Err(e.into());
                }
            }
        }

        if log {
            self.store.store(&self.pq_key(), &pq.to_bytes())?;
            self.log_op(CommitOp::Compress {
                segments: pq.segments(),
                centroids: pq.centroids(),
            })?;
        }

        self.quantizer.store(Some(Arc::clone(&pq)));
        self.cache.clear();
        self.cache.shrink_to_fit();
        Ok(())
    }
}
