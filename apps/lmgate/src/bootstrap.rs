use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use serde_json::Value;

use lmgate_common::GatewayConfig;
use lmgate_engine::{Engine, RetryConfig};
use lmgate_middleware::{
    AuthorizationMiddleware, GenerateHook, GenerateHookCell, InjectMiddleware, InsertionConfig,
    MacroMiddleware, MacroRegistry, Middleware, MiddlewareManager, RegexMiddleware,
    RegexRuleConfig, ToolCallMiddleware, ToolRegistry,
};
use lmgate_resources::ProxyFactory;
use lmgate_worker::{OpenAiWorker, OpenAiWorkerConfig, Worker, WorkerManager};

/// Shared state handed to the HTTP router.
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Wires a `GatewayConfig` into a runnable `Engine`, matching
/// `engine.py::Engine.__init__`'s construction order: proxies, then
/// workers, then middleware, then retry. Grounded on
/// `examples/dfft546-gproxy/crates/gproxy-core/src/bootstrap/mod.rs`'s
/// config-to-live-objects shape; the `class` string match below replaces
/// Python's `loader.get_object` dynamic reflection (§9's "dynamic dispatch
/// by string name" redesign note).
pub async fn bootstrap(config: GatewayConfig) -> Result<AppState> {
    let proxy_factory = ProxyFactory::new(&config.proxy);

    let mut workers: Vec<Arc<dyn Worker>> = Vec::new();
    for entry in &config.worker.workers {
        match entry.class.as_str() {
            "openai" => {
                let worker_cfg: OpenAiWorkerConfig = serde_json::from_value(entry.settings.clone())
                    .with_context(|| format!("invalid settings for worker {}", entry.name))?;
                workers.push(Arc::new(OpenAiWorker::new(
                    entry.name.clone(),
                    entry.priority,
                    worker_cfg,
                    &proxy_factory,
                )));
            }
            other => bail!("unknown worker class `{other}` for worker `{}`", entry.name),
        }
    }
    let worker_manager = Arc::new(WorkerManager::new(workers));

    // Write-once at startup; no config-driven tool or macro plugins are
    // defined here, matching the framework/plugin split in the source
    // material (tools and macros are native functions, not config entries).
    let tool_registry = Arc::new(ToolRegistry::new());
    let macro_registry = Arc::new(MacroRegistry::new());
    let hook_cell = GenerateHookCell::new();

    let mut middlewares: Vec<Arc<dyn Middleware>> = Vec::new();
    for entry in &config.middleware.middlewares {
        match entry.class.as_str() {
            "authorization" => {
                let token = entry
                    .settings
                    .get("token")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                middlewares.push(Arc::new(AuthorizationMiddleware::new(entry.priority, token)));
            }
            "macro" => {
                let max_iterations = entry
                    .settings
                    .get("max_iterations")
                    .and_then(Value::as_u64)
                    .unwrap_or(9) as u32;
                middlewares.push(Arc::new(MacroMiddleware::new(
                    entry.priority,
                    macro_registry.clone(),
                    max_iterations,
                )));
            }
            "regex" => {
                let rules: Vec<RegexRuleConfig> = serde_json::from_value(
                    entry.settings.get("rules").cloned().unwrap_or(Value::Array(Vec::new())),
                )
                .context("invalid regex middleware rules")?;
                middlewares.push(Arc::new(
                    RegexMiddleware::new(entry.priority, rules).context("invalid regex pattern")?,
                ));
            }
            "inject" => {
                let insertions: Vec<InsertionConfig> = serde_json::from_value(
                    entry
                        .settings
                        .get("insertions")
                        .cloned()
                        .unwrap_or(Value::Array(Vec::new())),
                )
                .context("invalid inject middleware insertions")?;
                let debug = entry
                    .settings
                    .get("debug")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                middlewares.push(Arc::new(InjectMiddleware::new(entry.priority, insertions, debug)));
            }
            "tools" => {
                middlewares.push(Arc::new(ToolCallMiddleware::new(
                    entry.priority,
                    tool_registry.clone(),
                    hook_cell.clone(),
                )));
            }
            other => bail!("unknown middleware class `{other}`"),
        }
    }
    let middleware_manager = Arc::new(MiddlewareManager::new(middlewares));

    let retry_config = RetryConfig {
        max_attempts: config.retry.max_attempts,
        wait_time: Duration::from_secs_f64(config.retry.wait_time),
    };

    let engine = Arc::new(Engine::new(middleware_manager, worker_manager, retry_config));
    hook_cell.set(engine.clone() as Arc<dyn GenerateHook>);

    Ok(AppState { engine })
}
