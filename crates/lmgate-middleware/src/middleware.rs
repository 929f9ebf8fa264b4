use async_trait::async_trait;
use lmgate_model::{Context, Delta, EngineError, Termination};

/// Result of a chain hook: advance to the next middleware, or stop — for
/// `pre_request`/`post_response` this treats the current Context as the
/// final result; for `per_chunk` it drops the chunk instead of forwarding
/// it downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Result of `on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    SuppressRetry,
    ContinueRetry,
}

/// A pipeline stage that can inspect or rewrite a request, a response, a
/// streamed chunk, or a retry failure. Every hook defaults to a no-op, so a
/// middleware only implements the ones its role needs. `Err(Termination)`
/// from any hook short-circuits the whole request with the carried
/// Response, bypassing the rest of the chain and any retry in flight.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Higher runs first; the manager sorts by this at construction.
    fn priority(&self) -> i32 {
        100
    }

    async fn pre_request(&self, _ctx: &mut Context) -> Result<Flow, Termination> {
        Ok(Flow::Continue)
    }

    async fn post_response(&self, _ctx: &mut Context) -> Result<Flow, Termination> {
        Ok(Flow::Continue)
    }

    async fn per_chunk(&self, _ctx: &mut Context, _delta: &mut Delta) -> Result<Flow, Termination> {
        Ok(Flow::Continue)
    }

    async fn on_error(
        &self,
        _ctx: &mut Context,
        _error: &EngineError,
        _attempt: u32,
    ) -> ErrorDecision {
        ErrorDecision::ContinueRetry
    }
}
