use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::RwLock;

use lmgate_model::{Context, Modality, ResponseBody, WorkerError};

use crate::worker::Worker;

const MODELS_TTL: Duration = Duration::from_secs(300);

struct ModelsCache {
    fetched_at: Instant,
    models: Vec<String>,
}

/// Ordered multi-worker fallback. Workers are tried highest-priority first;
/// `WorkerUnsupported`/`WorkerOverload`/`WorkerError` are warnings that
/// advance to the next worker, anything else escalates.
pub struct WorkerManager {
    workers: Vec<Arc<dyn Worker>>,
    models_cache: RwLock<Option<ModelsCache>>,
}

impl WorkerManager {
    pub fn new(mut workers: Vec<Arc<dyn Worker>>) -> Self {
        workers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self {
            workers,
            models_cache: RwLock::new(None),
        }
    }

    pub async fn generate_text(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        let model = ctx.model().to_string();
        for worker in &self.workers {
            if !worker.supports_model(&model, Modality::Text) {
                continue;
            }

            match worker.generate_text(ctx).await {
                Ok(ResponseBody::Stream(mut stream)) => match stream.next().await {
                    Some(Ok(first)) => {
                        ctx.metadata.worker = Some(worker.name().to_string());
                        let prefixed = futures_util::stream::once(async move { Ok(first) });
                        let combined = prefixed.chain(stream);
                        return Ok(ResponseBody::Stream(Box::pin(combined)));
                    }
                    Some(Err(e)) if e.is_worker_local() => {
                        tracing::warn!(worker = worker.name(), error = %e, "worker failed before first chunk");
                        continue;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        ctx.metadata.worker = Some(worker.name().to_string());
                        return Ok(ResponseBody::Stream(Box::pin(futures_util::stream::empty())));
                    }
                },
                Ok(other) => {
                    ctx.metadata.worker = Some(worker.name().to_string());
                    return Ok(other);
                }
                Err(e) if e.is_worker_local() => {
                    tracing::warn!(worker = worker.name(), error = %e, "worker advanced");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(WorkerError::Upstream(format!(
            "no available workers for {model}"
        )))
    }

    pub async fn generate_image(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        let model = ctx.model().to_string();
        for worker in &self.workers {
            if !worker.supports_model(&model, Modality::Image) {
                continue;
            }
            match worker.generate_image(ctx).await {
                Ok(body) => {
                    ctx.metadata.worker = Some(worker.name().to_string());
                    return Ok(body);
                }
                Err(e) if e.is_worker_local() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(WorkerError::Upstream(format!(
            "no available workers for {model}"
        )))
    }

    pub async fn generate_audio(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        let model = ctx.model().to_string();
        for worker in &self.workers {
            if !worker.supports_model(&model, Modality::Audio) {
                continue;
            }
            match worker.generate_audio(ctx).await {
                Ok(body) => {
                    ctx.metadata.worker = Some(worker.name().to_string());
                    return Ok(body);
                }
                Err(e) if e.is_worker_local() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(WorkerError::Upstream(format!(
            "no available workers for {model}"
        )))
    }

    pub async fn generate_embedding(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        let model = ctx.model().to_string();
        for worker in &self.workers {
            if !worker.supports_model(&model, Modality::Embedding) {
                continue;
            }
            match worker.generate_embedding(ctx).await {
                Ok(body) => {
                    ctx.metadata.worker = Some(worker.name().to_string());
                    return Ok(body);
                }
                Err(e) if e.is_worker_local() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(WorkerError::Upstream(format!(
            "no available workers for {model}"
        )))
    }

    pub async fn generate_video(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        let model = ctx.model().to_string();
        for worker in &self.workers {
            if !worker.supports_model(&model, Modality::Video) {
                continue;
            }
            match worker.generate_video(ctx).await {
                Ok(body) => {
                    ctx.metadata.worker = Some(worker.name().to_string());
                    return Ok(body);
                }
                Err(e) if e.is_worker_local() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(WorkerError::Upstream(format!(
            "no available workers for {model}"
        )))
    }

    /// Best-effort token count: returns -1 if no worker supports it.
    pub async fn count_tokens(&self, ctx: &Context) -> i64 {
        let model = ctx.model();
        for worker in &self.workers {
            if !worker.supports_model(model, Modality::CountTokens) {
                continue;
            }
            if let Ok(count) = worker.count_tokens(ctx).await {
                return count;
            }
        }
        -1
    }

    /// Sorted, case-insensitive union of every worker's model list, cached
    /// for 300 seconds.
    pub async fn models(&self) -> Vec<String> {
        {
            let cache = self.models_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < MODELS_TTL {
                    return cached.models.clone();
                }
            }
        }

        let results = futures_util::future::join_all(self.workers.iter().map(|w| w.models())).await;
        let mut union = std::collections::BTreeSet::new();
        for (worker, result) in self.workers.iter().zip(results.into_iter()) {
            let Ok(models) = result else { continue };
            worker.set_available_models(&models);
            for model in models {
                union.insert(model);
            }
        }
        let mut models: Vec<String> = union.into_iter().collect();
        models.sort_by_key(|m| m.to_lowercase());

        let mut cache = self.models_cache.write().await;
        *cache = Some(ModelsCache {
            fetched_at: Instant::now(),
            models: models.clone(),
        });
        models
    }
}
