use lmgate_model::{Context, Modality, ResponseBody, WorkerError};

/// Speaks one upstream's wire protocol for a given modality. Default method
/// bodies return `WorkerUnsupported` so a concrete adapter only needs to
/// implement the modalities it actually serves.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;

    /// Canonical, client-visible model names (reverse-aliased).
    async fn models(&self) -> Result<Vec<String>, WorkerError>;

    /// Whether this worker should be tried at all for (model, modality).
    fn supports_model(&self, model: &str, modality: Modality) -> bool;

    /// Replaces this worker's dynamically-discovered model list with a fresh
    /// one (the result of its own `models()` call). Adapters with no notion
    /// of discovery keep the default no-op; `supports_model` then only ever
    /// consults the statically-configured set.
    fn set_available_models(&self, models: &[String]) {
        let _ = models;
    }

    async fn generate_text(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        let _ = ctx;
        Err(WorkerError::Unsupported(format!(
            "{} does not support text generation",
            self.name()
        )))
    }

    async fn generate_image(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        let _ = ctx;
        Err(WorkerError::Unsupported(format!(
            "{} does not support image generation",
            self.name()
        )))
    }

    async fn generate_audio(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        let _ = ctx;
        Err(WorkerError::Unsupported(format!(
            "{} does not support audio generation",
            self.name()
        )))
    }

    async fn generate_embedding(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        let _ = ctx;
        Err(WorkerError::Unsupported(format!(
            "{} does not support embeddings",
            self.name()
        )))
    }

    async fn generate_video(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        let _ = ctx;
        Err(WorkerError::Unsupported(format!(
            "{} does not support video generation",
            self.name()
        )))
    }

    /// Best-effort; the manager returns -1 rather than fail the request if
    /// no worker implements this.
    async fn count_tokens(&self, ctx: &Context) -> Result<i64, WorkerError> {
        let _ = ctx;
        Err(WorkerError::Unsupported(format!(
            "{} does not support token counting",
            self.name()
        )))
    }
}
