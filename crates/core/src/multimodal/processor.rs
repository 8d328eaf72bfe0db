//! Bounded pool for multimodal request preparation.
//!
//! Vision encoding, token selection and projection are CPU/GPU heavy and
//! synchronous, so each request is prepared on a blocking thread. A semaphore
//! caps how many preparations run at once; every job receives the shared
//! context explicitly through an `Arc`.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::error::{FusionError, Result};
use super::fusion::MultimodalFusion;
use super::inputs::{MultimodalRequest, PreparedRequest};
use super::vision::{VisionEncoder, VisionTower};

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent preparations.
    pub max_concurrent: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// Shared state handed to every preparation job.
pub struct PreparationContext<V> {
    pub fusion: MultimodalFusion,
    pub tower: VisionTower<V>,
}

/// Runs [`MultimodalFusion::prepare_request`] on blocking threads.
pub struct MultimodalWorkerPool<V> {
    ctx: Arc<PreparationContext<V>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl<V> Clone for MultimodalWorkerPool<V> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            permits: self.permits.clone(),
            max_concurrent: self.max_concurrent,
        }
    }
}

impl<V: VisionEncoder + 'static> MultimodalWorkerPool<V> {
    pub fn new(ctx: PreparationContext<V>, cfg: WorkerPoolConfig) -> Result<Self> {
        Self::from_shared(Arc::new(ctx), cfg)
    }

    /// Pool over a context that is also used elsewhere (e.g. by the model).
    pub fn from_shared(ctx: Arc<PreparationContext<V>>, cfg: WorkerPoolConfig) -> Result<Self> {
        if cfg.max_concurrent == 0 {
            return Err(FusionError::InvalidConfig(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        Ok(Self {
            ctx,
            permits: Arc::new(Semaphore::new(cfg.max_concurrent)),
            max_concurrent: cfg.max_concurrent,
        })
    }

    pub fn context(&self) -> &Arc<PreparationContext<V>> {
        &self.ctx
    }

    /// Preparations currently holding a permit.
    pub fn active(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Expand and encode one request on a blocking thread.
    pub async fn prepare(&self, request: MultimodalRequest) -> Result<PreparedRequest> {
        if !request.has_images() {
            let expanded = self.ctx.fusion.expand_placeholders(&request.token_ids, 0)?;
            return Ok(PreparedRequest {
                expanded,
                image_features: Vec::new(),
            });
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| FusionError::WorkerFailed(format!("worker pool closed: {e}")))?;
        let ctx = self.ctx.clone();
        debug!(num_images = request.images.len(), "Dispatching multimodal preparation");

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            ctx.fusion.prepare_request(&ctx.tower, &request)
        })
        .await
        .map_err(|e| {
            warn!(error = %e, "Multimodal preparation task failed");
            FusionError::WorkerFailed(format!("preparation task panicked: {e}"))
        })?
    }

    /// Prepare a batch concurrently; results keep the input order and the
    /// first failure fails the batch.
    pub async fn prepare_batch(
        &self,
        requests: Vec<MultimodalRequest>,
    ) -> Result<Vec<PreparedRequest>> {
        let jobs = requests.into_iter().map(|req| self.prepare(req));
        join_all(jobs).await.into_iter().collect()
    }
}
