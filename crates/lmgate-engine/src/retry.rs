use std::time::Duration;

use lmgate_middleware::MiddlewareManager;
use lmgate_model::{Context, EngineError};

/// Retry tunables. Grounded on `retry.py::RetryFactory`'s
/// `settings.get("max_attempts", 3)` / `settings.get("wait_time", 0)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub wait_time: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait_time: Duration::ZERO,
        }
    }
}

/// What the retry loop should do after a failed attempt.
pub enum Verdict {
    Retry,
    GiveUp,
}

/// Decides whether `Engine::process_generate`'s loop should try again.
/// Grounded on `retry.py::AttemptManager.__aexit__`: consult
/// `middleware.on_error` first (any middleware can force a give-up), then
/// fall back to the attempt counter. `Termination` never reaches here — it
/// short-circuits at the point it's raised (pre_request/post_response/
/// per_chunk), before the attempt loop ever calls `judge`.
pub async fn judge(
    middleware: &MiddlewareManager,
    ctx: &mut Context,
    error: &EngineError,
    attempt_number: u32,
    config: &RetryConfig,
) -> Verdict {
    if middleware.on_error(ctx, error, attempt_number).await {
        return Verdict::GiveUp;
    }
    if attempt_number >= config.max_attempts {
        return Verdict::GiveUp;
    }
    if !config.wait_time.is_zero() {
        tokio::time::sleep(config.wait_time).await;
    }
    Verdict::Retry
}
