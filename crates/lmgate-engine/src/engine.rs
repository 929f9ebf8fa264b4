use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use lmgate_middleware::{Flow, GenerateHook, MiddlewareManager};
use lmgate_model::{Context, EngineError, Modality, Response, ResponseBody, WorkerError};
use lmgate_worker::WorkerManager;
use serde_json::Value;
use uuid::Uuid;

use crate::retry::{self, RetryConfig, Verdict};
use crate::stream_adaptor;

/// Ties the middleware chain, the worker fallback layer, and the retry
/// policy together behind one entry point per modality. Grounded on
/// `engine.py::Engine`; owns the Context for the full lifetime of a
/// request, including (for streaming) the lifetime of the response body.
pub struct Engine {
    middleware: Arc<MiddlewareManager>,
    workers: Arc<WorkerManager>,
    retry_config: RetryConfig,
}

impl Engine {
    pub fn new(
        middleware: Arc<MiddlewareManager>,
        workers: Arc<WorkerManager>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            middleware,
            workers,
            retry_config,
        }
    }

    pub async fn generate_text(&self, body: Value, headers: HeaderMap) -> Result<Response, EngineError> {
        self.process_generate(Context::new(headers, body, Modality::Text)).await
    }

    pub async fn generate_image(&self, body: Value, headers: HeaderMap) -> Result<Response, EngineError> {
        self.process_generate(Context::new(headers, body, Modality::Image)).await
    }

    pub async fn generate_audio(&self, body: Value, headers: HeaderMap) -> Result<Response, EngineError> {
        self.process_generate(Context::new(headers, body, Modality::Audio)).await
    }

    pub async fn generate_embedding(&self, body: Value, headers: HeaderMap) -> Result<Response, EngineError> {
        self.process_generate(Context::new(headers, body, Modality::Embedding)).await
    }

    pub async fn generate_video(&self, body: Value, headers: HeaderMap) -> Result<Response, EngineError> {
        self.process_generate(Context::new(headers, body, Modality::Video)).await
    }

    /// Bypasses middleware and retry entirely, matching
    /// `engine.py::Engine.count_tokens`.
    pub async fn count_tokens(&self, body: Value, headers: HeaderMap) -> i64 {
        let ctx = Context::new(headers, body, Modality::CountTokens);
        self.workers.count_tokens(&ctx).await
    }

    pub async fn models(&self) -> Vec<String> {
        self.workers.models().await
    }

    async fn process_generate(&self, mut ctx: Context) -> Result<Response, EngineError> {
        ctx.metadata.task_id = Some(Uuid::new_v4().simple().to_string());

        match self.middleware.pre_request(&mut ctx).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => return Ok(Self::take_response(ctx)),
            Err(termination) => return Ok(termination.response),
        }

        let mut attempt_number = 0u32;
        loop {
            attempt_number += 1;
            match self.run_attempt(&mut ctx).await {
                Ok(response) => return Ok(response),
                Err(EngineError::Termination(t)) => return Ok(t.response),
                Err(EngineError::Worker(e)) => {
                    let error = EngineError::Worker(e);
                    match retry::judge(&self.middleware, &mut ctx, &error, attempt_number, &self.retry_config).await
                    {
                        Verdict::Retry => continue,
                        Verdict::GiveUp => return Err(error),
                    }
                }
            }
        }
    }

    /// Dispatches to the matching `WorkerManager` method, wraps a streaming
    /// result with the StreamAdaptor, and (for a non-streaming result) runs
    /// `post_response` before handing the Response back. Matches
    /// `engine.py::Engine.process_generate`'s `async with attempt:` body.
    async fn run_attempt(&self, ctx: &mut Context) -> Result<Response, EngineError> {
        let body = dispatch(ctx, &self.workers).await.map_err(EngineError::Worker)?;

        match body {
            ResponseBody::Stream(upstream) => {
                // `post_response` is skipped for streaming responses: the
                // only concrete middleware that implements it (Tools) bails
                // out immediately whenever `ctx.stream()` is true, so the
                // call is observably a no-op here. The real interception
                // for streams happens in `per_chunk`, inside the adaptor.
                let owned_ctx = placeholder_swap(ctx);
                let wrapped = stream_adaptor::passthrough(owned_ctx, self.middleware.clone(), upstream);
                Ok(Response::ok(ResponseBody::Stream(wrapped)))
            }
            other => {
                ctx.response = Some(other);
                self.middleware
                    .post_response(ctx)
                    .await
                    .map_err(EngineError::Termination)?;

                Ok(Self::take_response_mut(ctx))
            }
        }
    }

    fn take_response(mut ctx: Context) -> Response {
        Response {
            status_code: ctx.status_code,
            headers: ctx.response_headers,
            body: ctx.response.take().unwrap_or(ResponseBody::Empty),
            metadata: ctx.metadata.usage.take().unwrap_or(Value::Null),
        }
    }

    fn take_response_mut(ctx: &mut Context) -> Response {
        Response {
            status_code: ctx.status_code,
            headers: std::mem::take(&mut ctx.response_headers),
            body: ctx.response.take().unwrap_or(ResponseBody::Empty),
            metadata: ctx.metadata.usage.take().unwrap_or(Value::Null),
        }
    }
}

#[async_trait]
impl GenerateHook for Engine {
    /// Re-invokes the full pipeline (fresh task id, `pre_request`, retry,
    /// `post_response`) for a tool-call follow-up. The caller (Tools
    /// middleware) only reads the returned Response afterward, so leaving a
    /// placeholder Context behind in `*ctx` is harmless.
    async fn regenerate(&self, ctx: &mut Context) -> Result<Response, EngineError> {
        let owned = placeholder_swap(ctx);
        self.process_generate(owned).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use http::HeaderMap;
    use lmgate_middleware::AuthorizationMiddleware;
    use lmgate_model::Delta;
    use lmgate_worker::Worker;
    use serde_json::json;

    use super::*;

    /// Scripted worker: pops one canned result per `generate_text` call and
    /// counts how many times it was actually invoked.
    struct FakeWorker {
        name: String,
        priority: i32,
        calls: AtomicUsize,
        script: Mutex<VecDeque<Result<ResponseBody, WorkerError>>>,
    }

    impl FakeWorker {
        fn new(name: &str, priority: i32, script: Vec<Result<ResponseBody, WorkerError>>) -> Self {
            Self {
                name: name.to_string(),
                priority,
                calls: AtomicUsize::new(0),
                script: Mutex::new(script.into_iter().collect()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Worker for FakeWorker {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn models(&self) -> Result<Vec<String>, WorkerError> {
            Ok(vec!["m1".to_string()])
        }

        fn supports_model(&self, _model: &str, modality: Modality) -> bool {
            modality == Modality::Text
        }

        async fn generate_text(&self, _ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(WorkerError::Fatal("script exhausted".to_string())))
        }
    }

    fn single_text(content: &str) -> ResponseBody {
        ResponseBody::Single(Delta::text(content))
    }

    fn response_text(response: &Response) -> Option<String> {
        match &response.body {
            ResponseBody::Single(Delta::Text { content, .. }) => content.clone(),
            _ => None,
        }
    }

    fn engine_with(
        middlewares: Vec<Arc<dyn lmgate_middleware::Middleware>>,
        workers: Vec<Arc<dyn Worker>>,
        retry_config: RetryConfig,
    ) -> Engine {
        Engine::new(
            Arc::new(MiddlewareManager::new(middlewares)),
            Arc::new(WorkerManager::new(workers)),
            retry_config,
        )
    }

    /// E1: a request with the wrong bearer token never reaches a worker and
    /// gets back a bare 401.
    #[tokio::test]
    async fn auth_rejection_short_circuits_before_any_worker() {
        let worker = Arc::new(FakeWorker::new("a", 100, vec![Ok(single_text("ok"))]));
        let engine = engine_with(
            vec![Arc::new(AuthorizationMiddleware::new(100, "S".to_string()))],
            vec![worker.clone()],
            RetryConfig::default(),
        );

        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer X".parse().unwrap());
        let response = engine
            .generate_text(json!({"model": "m1", "messages": []}), headers)
            .await
            .unwrap();

        assert_eq!(response.status_code, 401);
        assert_eq!(worker.call_count(), 0);
    }

    /// E2: the higher-priority worker's failure is worker-local, so the
    /// manager falls through to the next one.
    #[tokio::test]
    async fn two_worker_fallback_tries_lower_priority_on_unsupported() {
        let worker_a = Arc::new(FakeWorker::new(
            "a",
            200,
            vec![Err(WorkerError::Unsupported("a: not serving m1".to_string()))],
        ));
        let worker_b = Arc::new(FakeWorker::new("b", 100, vec![Ok(single_text("ok"))]));
        let engine = engine_with(
            vec![],
            vec![worker_a.clone(), worker_b.clone()],
            RetryConfig::default(),
        );

        let response = engine
            .generate_text(json!({"model": "m1", "messages": [], "stream": false}), HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(response_text(&response).as_deref(), Some("ok"));
        assert_eq!(worker_a.call_count(), 1);
        assert_eq!(worker_b.call_count(), 1);
    }

    /// E3: a worker-local failure on attempt 1 triggers exactly one retry,
    /// which then succeeds.
    #[tokio::test]
    async fn retry_then_succeed_invokes_worker_twice() {
        let worker = Arc::new(FakeWorker::new(
            "a",
            100,
            vec![
                Err(WorkerError::Upstream("transient".to_string())),
                Ok(single_text("ok")),
            ],
        ));
        let engine = engine_with(
            vec![],
            vec![worker.clone()],
            RetryConfig {
                max_attempts: 3,
                wait_time: Duration::from_millis(0),
            },
        );

        let response = engine
            .generate_text(json!({"model": "m1", "messages": [], "stream": false}), HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(response_text(&response).as_deref(), Some("ok"));
        assert_eq!(worker.call_count(), 2);
    }

    /// A worker-local failure that never succeeds gives up once
    /// `max_attempts` is exhausted rather than retrying forever.
    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let worker = Arc::new(FakeWorker::new(
            "a",
            100,
            vec![
                Err(WorkerError::Upstream("down".to_string())),
                Err(WorkerError::Upstream("down".to_string())),
            ],
        ));
        let engine = engine_with(
            vec![],
            vec![worker.clone()],
            RetryConfig {
                max_attempts: 2,
                wait_time: Duration::from_millis(0),
            },
        );

        let err = engine
            .generate_text(json!({"model": "m1", "messages": [], "stream": false}), HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Worker(_)));
        assert_eq!(worker.call_count(), 2);
    }
}

fn placeholder_swap(ctx: &mut Context) -> Context {
    std::mem::replace(ctx, Context::new(HeaderMap::new(), Value::Null, Modality::Text))
}

async fn dispatch(ctx: &mut Context, workers: &WorkerManager) -> Result<ResponseBody, WorkerError> {
    match ctx.modality {
        Modality::Text => workers.generate_text(ctx).await,
        Modality::Image => workers.generate_image(ctx).await,
        Modality::Audio => workers.generate_audio(ctx).await,
        Modality::Embedding => workers.generate_embedding(ctx).await,
        Modality::Video => workers.generate_video(ctx).await,
        Modality::CountTokens => Err(WorkerError::Fatal(
            "count_tokens bypasses the retry-driven generate path".to_string(),
        )),
    }
}
