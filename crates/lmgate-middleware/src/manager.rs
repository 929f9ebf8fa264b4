use std::sync::Arc;

use lmgate_model::{Context, Delta, EngineError, Termination};
use tracing::debug;

use crate::middleware::{ErrorDecision, Flow, Middleware};

/// Ordered chain of middlewares, sorted by descending priority at
/// construction (ties keep registration order). Each hook runs every
/// middleware in turn, short-circuiting the first time one signals stop
/// (or, for `on_error`, suppress-retry) — matching the original's
/// `MiddlewareManager.process_*` loops.
pub struct MiddlewareManager {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareManager {
    pub fn new(mut middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        middlewares.sort_by(|a, b| b.priority().cmp(&a.priority()));
        debug!(
            chain = ?middlewares.iter().map(|m| m.name()).collect::<Vec<_>>(),
            "middleware chain assembled"
        );
        Self { middlewares }
    }

    pub async fn pre_request(&self, ctx: &mut Context) -> Result<Flow, Termination> {
        for mw in &self.middlewares {
            if mw.pre_request(ctx).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    pub async fn post_response(&self, ctx: &mut Context) -> Result<Flow, Termination> {
        for mw in &self.middlewares {
            if mw.post_response(ctx).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    pub async fn per_chunk(&self, ctx: &mut Context, delta: &mut Delta) -> Result<Flow, Termination> {
        for mw in &self.middlewares {
            if mw.per_chunk(ctx, delta).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// True if any middleware, in priority order, wants the retry loop to
    /// give up rather than attempt again.
    pub async fn on_error(&self, ctx: &mut Context, error: &EngineError, attempt: u32) -> bool {
        for mw in &self.middlewares {
            if mw.on_error(ctx, error, attempt).await == ErrorDecision::SuppressRetry {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http::HeaderMap;
    use lmgate_model::{Modality, Response, WorkerError};
    use serde_json::Value;

    use super::*;

    /// Records its own name every time any hook runs, and can be configured
    /// to stop the chain or terminate it outright.
    struct RecordingMiddleware {
        name: &'static str,
        priority: i32,
        calls: Arc<Mutex<Vec<&'static str>>>,
        stop: bool,
        terminate: bool,
    }

    impl RecordingMiddleware {
        fn new(name: &'static str, priority: i32, calls: Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                name,
                priority,
                calls,
                stop: false,
                terminate: false,
            }
        }

        fn stopping(mut self) -> Self {
            self.stop = true;
            self
        }

        fn terminating(mut self) -> Self {
            self.terminate = true;
            self
        }
    }

    #[async_trait]
    impl Middleware for RecordingMiddleware {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn pre_request(&self, _ctx: &mut Context) -> Result<Flow, Termination> {
            self.calls.lock().unwrap().push(self.name);
            if self.terminate {
                return Err(Termination::new(Response::error(500, "stop")));
            }
            Ok(if self.stop { Flow::Stop } else { Flow::Continue })
        }
    }

    fn ctx() -> Context {
        Context::new(HeaderMap::new(), Value::Null, Modality::Text)
    }

    #[tokio::test]
    async fn runs_in_descending_priority_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = MiddlewareManager::new(vec![
            Arc::new(RecordingMiddleware::new("low", 10, calls.clone())),
            Arc::new(RecordingMiddleware::new("high", 200, calls.clone())),
            Arc::new(RecordingMiddleware::new("mid", 100, calls.clone())),
        ]);

        manager.pre_request(&mut ctx()).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn stop_short_circuits_remaining_middlewares() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = MiddlewareManager::new(vec![
            Arc::new(RecordingMiddleware::new("first", 200, calls.clone()).stopping()),
            Arc::new(RecordingMiddleware::new("second", 100, calls.clone())),
        ]);

        let flow = manager.pre_request(&mut ctx()).await.unwrap();

        assert_eq!(flow, Flow::Stop);
        assert_eq!(*calls.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn termination_short_circuits_and_propagates() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = MiddlewareManager::new(vec![
            Arc::new(RecordingMiddleware::new("first", 200, calls.clone()).terminating()),
            Arc::new(RecordingMiddleware::new("second", 100, calls.clone())),
        ]);

        let err = manager.pre_request(&mut ctx()).await.unwrap_err();

        assert_eq!(err.response.status_code, 500);
        assert_eq!(*calls.lock().unwrap(), vec!["first"]);
    }

    struct AlwaysSuppress;

    #[async_trait]
    impl Middleware for AlwaysSuppress {
        fn name(&self) -> &str {
            "suppress"
        }

        async fn on_error(
            &self,
            _ctx: &mut Context,
            _error: &EngineError,
            _attempt: u32,
        ) -> ErrorDecision {
            ErrorDecision::SuppressRetry
        }
    }

    #[tokio::test]
    async fn on_error_suppress_wins_over_default_continue() {
        let manager = MiddlewareManager::new(vec![Arc::new(AlwaysSuppress)]);
        let error = EngineError::Worker(WorkerError::Upstream("down".to_string()));

        let give_up = manager.on_error(&mut ctx(), &error, 1).await;

        assert!(give_up);
    }
}
