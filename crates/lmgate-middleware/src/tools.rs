use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use futures_util::future::join_all;
use lmgate_model::{Context, Delta, EngineError, Modality, Response, ResponseBody, Termination, ToolCallDelta};
use regex::Regex;
use serde_json::Value;

use crate::middleware::{Flow, Middleware};

/// One callable tool implementation: takes its JSON arguments object,
/// returns either a JSON result (serialized into the tool message) or an
/// error string. Grounded on `tool.py::execute_tool_calls`'s
/// `available_functions` dict.
pub type ToolFn = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync,
>;

/// OpenAI-shaped tool definition: name, description, JSON-schema
/// parameters. Grounded on `tool.py::tooldef`'s generated `function_def`,
/// built explicitly here rather than through Python's signature
/// introspection (no stable Rust equivalent without a proc macro).
#[derive(Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Write-once registry of tool definitions and implementations, built at
/// bootstrap and shared as an `Arc` with the Tools middleware. Never
/// mutated once wrapped.
#[derive(Default)]
pub struct ToolRegistry {
    defs: Vec<ToolDef>,
    functions: HashMap<String, ToolFn>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: ToolDef, func: ToolFn) {
        self.functions.insert(def.name.clone(), func);
        self.defs.push(def);
    }

    pub fn tool_definitions(&self) -> Vec<Value> {
        self.defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": d.name,
                        "description": d.description,
                        "parameters": d.parameters,
                    },
                })
            })
            .collect()
    }

    fn get(&self, name: &str) -> Option<ToolFn> {
        self.functions.get(name).cloned()
    }
}

/// Concurrently executes a batch of tool calls, producing one `role:tool`
/// message per call. An unknown tool name or a call that errors produces
/// an isolated `"Error: ..."` message rather than aborting the batch — the
/// batch always returns one message per input call.
pub async fn execute_tool_calls(calls: &[ToolCallDelta], registry: &ToolRegistry) -> Vec<Value> {
    let futures = calls.iter().map(|call| async move {
        let name = call
            .function
            .as_ref()
            .and_then(|f| f.name.clone())
            .unwrap_or_default();

        let content = match registry.get(&name) {
            None => format!("Error: Function '{name}' not found."),
            Some(func) => {
                let args: Value = call
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.as_deref())
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or_else(|| Value::Object(Default::default()));

                match func(args).await {
                    Ok(result) => serde_json::to_string(&result).unwrap_or_default(),
                    Err(err) => format!("Error: {err}"),
                }
            }
        };

        serde_json::json!({
            "tool_call_id": call.id,
            "role": "tool",
            "name": name,
            "content": content,
        })
    });

    join_all(futures).await
}

/// Re-enters the Engine's full request pipeline (fresh task id,
/// `pre_request`, retry, `post_response`) to obtain a follow-up completion
/// after tool execution. Implemented by the Engine crate.
#[async_trait]
pub trait GenerateHook: Send + Sync {
    async fn regenerate(&self, ctx: &mut Context) -> Result<Response, EngineError>;
}

/// Two-phase init cell: the Tools middleware needs a handle back to the
/// Engine that owns it, but the Engine can't exist until its middleware
/// chain — including this middleware — is built. Bootstrap constructs this
/// cell empty, assembles the chain, constructs the Engine, then fills it.
pub struct GenerateHookCell(OnceLock<Arc<dyn GenerateHook>>);

impl GenerateHookCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(OnceLock::new()))
    }

    pub fn set(&self, hook: Arc<dyn GenerateHook>) {
        let _ = self.0.set(hook);
    }

    fn get(&self) -> Arc<dyn GenerateHook> {
        self.0
            .get()
            .cloned()
            .expect("GenerateHookCell used before bootstrap wired the engine")
    }
}

fn tool_name(def: &Value) -> Option<String> {
    def.get("function")?.get("name")?.as_str().map(str::to_string)
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)<tool_calls>(.*?)</tool_calls>").expect("static pattern"))
}

/// Pre: appends this registry's tool definitions to `body.tools` (deduped
/// by name). Post/chunk: detects tool calls in the response, executes
/// them, appends `role:tool` messages, and re-invokes the Engine for a
/// follow-up completion. Grounded on
/// `middlewares/tools.py::ToolCallMiddleware`.
///
/// Native `tool_calls` detection only happens at `post_response`, where
/// `ctx.response` holds the finished completion. During streaming
/// `ctx.response` isn't populated yet, so `per_chunk` instead watches the
/// StreamAdaptor's running `ctx.metadata.stream_content` accumulator for a
/// closed `<tool_calls>...</tool_calls>` block — the only detection path
/// that is actually reachable mid-stream in the original implementation.
pub struct ToolCallMiddleware {
    priority: i32,
    registry: Arc<ToolRegistry>,
    hook: Arc<GenerateHookCell>,
}

impl ToolCallMiddleware {
    pub fn new(priority: i32, registry: Arc<ToolRegistry>, hook: Arc<GenerateHookCell>) -> Self {
        Self {
            priority,
            registry,
            hook,
        }
    }

    fn tagged_tool_calls(text: &str) -> Vec<ToolCallDelta> {
        let Some(captures) = tag_pattern().captures(text) else {
            return Vec::new();
        };
        let Some(json) = captures.get(1) else {
            return Vec::new();
        };
        serde_json::from_str(json.as_str()).unwrap_or_default()
    }

    fn native_tool_calls(ctx: &Context) -> Vec<ToolCallDelta> {
        match &ctx.response {
            Some(ResponseBody::Single(Delta::Text {
                tool_calls: Some(calls),
                ..
            })) if !calls.is_empty() => calls.clone(),
            _ => Vec::new(),
        }
    }

    fn response_text(ctx: &Context) -> Option<String> {
        match &ctx.response {
            Some(ResponseBody::Single(Delta::Text {
                content: Some(content),
                ..
            })) => Some(content.clone()),
            _ => None,
        }
    }

    async fn follow_up(&self, ctx: &mut Context, calls: Vec<ToolCallDelta>) -> Result<Response, Termination> {
        let results = execute_tool_calls(&calls, &self.registry).await;

        if let Value::Object(map) = ctx.body_mut() {
            let messages = map
                .entry("messages")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(arr) = messages {
                arr.extend(results);
            }
        }

        self.hook.get().regenerate(ctx).await.map_err(|err| match err {
            EngineError::Termination(t) => t,
            EngineError::Worker(e) => Termination::new(Response::error(502, e.to_string())),
        })
    }
}

#[async_trait]
impl Middleware for ToolCallMiddleware {
    fn name(&self) -> &str {
        "tools"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn pre_request(&self, ctx: &mut Context) -> Result<Flow, Termination> {
        if ctx.modality != Modality::Text {
            return Ok(Flow::Continue);
        }

        let defs = self.registry.tool_definitions();
        if defs.is_empty() {
            return Ok(Flow::Continue);
        }

        if let Value::Object(map) = ctx.body_mut() {
            let existing = map
                .entry("tools")
                .or_insert_with(|| Value::Array(Vec::new()));
            let existing_names: HashSet<String> = existing
                .as_array()
                .map(|arr| arr.iter().filter_map(tool_name).collect())
                .unwrap_or_default();

            if let Value::Array(arr) = existing {
                arr.extend(
                    defs.into_iter()
                        .filter(|d| tool_name(d).map(|n| !existing_names.contains(&n)).unwrap_or(true)),
                );
            }
        }

        Ok(Flow::Continue)
    }

    async fn post_response(&self, ctx: &mut Context) -> Result<Flow, Termination> {
        if ctx.modality != Modality::Text || ctx.stream() {
            return Ok(Flow::Continue);
        }

        let mut calls = Self::native_tool_calls(ctx);
        if calls.is_empty() {
            if let Some(text) = Self::response_text(ctx) {
                calls = Self::tagged_tool_calls(&text);
            }
        }
        if calls.is_empty() {
            return Ok(Flow::Continue);
        }

        let response = self.follow_up(ctx, calls).await?;
        ctx.status_code = response.status_code;
        ctx.response_headers = response.headers;
        ctx.response = Some(response.body);
        Ok(Flow::Stop)
    }

    async fn per_chunk(&self, ctx: &mut Context, _delta: &mut Delta) -> Result<Flow, Termination> {
        if ctx.modality != Modality::Text || !ctx.stream() {
            return Ok(Flow::Continue);
        }

        let accumulated = match &ctx.metadata.stream_content {
            Some(Delta::Text {
                content: Some(content),
                ..
            }) => content.clone(),
            _ => return Ok(Flow::Continue),
        };

        let calls = Self::tagged_tool_calls(&accumulated);
        if calls.is_empty() {
            if accumulated.contains("<tool_calls>") {
                return Ok(Flow::Stop);
            }
            return Ok(Flow::Continue);
        }

        let response = self.follow_up(ctx, calls).await?;
        Err(Termination::new(response))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::HeaderMap;

    use super::*;

    fn echo_tool() -> (ToolDef, ToolFn) {
        let def = ToolDef {
            name: "echo".to_string(),
            description: "echoes its argument".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        };
        let func: ToolFn = Arc::new(|args: Value| {
            Box::pin(async move { Ok(serde_json::json!({"heard": args})) })
        });
        (def, func)
    }

    fn call(id: &str, name: &str, arguments: &str) -> ToolCallDelta {
        ToolCallDelta {
            index: 0,
            id: Some(id.to_string()),
            kind: Some("function".to_string()),
            function: Some(lmgate_model::FunctionCallDelta {
                name: Some(name.to_string()),
                arguments: Some(arguments.to_string()),
            }),
        }
    }

    #[tokio::test]
    async fn execute_tool_calls_runs_known_tool() {
        let mut registry = ToolRegistry::new();
        let (def, func) = echo_tool();
        registry.register(def, func);

        let calls = vec![call("call_1", "echo", r#"{"x":1}"#)];
        let results = execute_tool_calls(&calls, &registry).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["role"], "tool");
        assert_eq!(results[0]["tool_call_id"], "call_1");
        assert!(results[0]["content"].as_str().unwrap().contains("heard"));
    }

    #[tokio::test]
    async fn execute_tool_calls_reports_unknown_tool_without_failing_batch() {
        let registry = ToolRegistry::new();
        let calls = vec![call("call_1", "missing", "{}")];
        let results = execute_tool_calls(&calls, &registry).await;

        assert_eq!(results.len(), 1);
        assert!(results[0]["content"]
            .as_str()
            .unwrap()
            .starts_with("Error: Function 'missing' not found."));
    }

    #[tokio::test]
    async fn execute_tool_calls_isolates_a_failing_tool() {
        let mut registry = ToolRegistry::new();
        let def = ToolDef {
            name: "boom".to_string(),
            description: String::new(),
            parameters: Value::Null,
        };
        let func: ToolFn = Arc::new(|_| Box::pin(async move { Err("kaboom".to_string()) }));
        registry.register(def, func);

        let calls = vec![
            call("call_1", "boom", "{}"),
            {
                let (def, func) = echo_tool();
                registry.register(def, func);
                call("call_2", "echo", "{}")
            },
        ];
        let results = execute_tool_calls(&calls, &registry).await;

        assert_eq!(results.len(), 2);
        assert!(results[0]["content"].as_str().unwrap().contains("kaboom"));
        assert_eq!(results[1]["tool_call_id"], "call_2");
    }

    /// Fake `GenerateHook`: returns one canned Response, recording the
    /// Context it was handed so the test can inspect the injected tool
    /// message.
    struct FakeHook {
        response: Mutex<Option<Response>>,
        seen_body: Mutex<Option<Value>>,
    }

    impl FakeHook {
        fn new(response: Response) -> Self {
            Self {
                response: Mutex::new(Some(response)),
                seen_body: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl GenerateHook for FakeHook {
        async fn regenerate(&self, ctx: &mut Context) -> Result<Response, EngineError> {
            *self.seen_body.lock().unwrap() = Some(ctx.body().clone());
            Ok(self.response.lock().unwrap().take().expect("called once"))
        }
    }

    fn text_response(content: &str) -> Response {
        Response::ok(ResponseBody::Single(Delta::text(content)))
    }

    /// E6: a tagged `<tool_calls>` block in the finished completion runs the
    /// tool, appends its result as a `role:tool` message, and re-invokes the
    /// Engine through the hook for the follow-up completion.
    #[tokio::test]
    async fn post_response_restarts_generation_after_tagged_tool_call() {
        let mut registry = ToolRegistry::new();
        let (def, func) = echo_tool();
        registry.register(def, func);
        let registry = Arc::new(registry);

        let hook_cell = GenerateHookCell::new();
        let hook = Arc::new(FakeHook::new(text_response("final")));
        hook_cell.set(hook.clone());

        let middleware = ToolCallMiddleware::new(100, registry, hook_cell);

        let mut ctx = Context::new(
            HeaderMap::new(),
            serde_json::json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}], "stream": false}),
            Modality::Text,
        );
        ctx.response = Some(ResponseBody::Single(Delta::Text {
            content: Some(
                r#"<tool_calls>[{"index":0,"id":"call_1","type":"function","function":{"name":"echo","arguments":"{}"}}]</tool_calls>"#
                    .to_string(),
            ),
            reasoning_content: None,
            tool_calls: None,
        }));

        let flow = middleware.post_response(&mut ctx).await.unwrap();

        assert_eq!(flow, Flow::Stop);
        match &ctx.response {
            Some(ResponseBody::Single(Delta::Text { content, .. })) => {
                assert_eq!(content.as_deref(), Some("final"));
            }
            other => panic!("expected a text delta, got {other:?}"),
        }

        let seen = hook.seen_body.lock().unwrap().clone().unwrap();
        let messages = seen["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "call_1");
    }

    #[tokio::test]
    async fn post_response_is_noop_without_tool_calls() {
        let registry = Arc::new(ToolRegistry::new());
        let hook_cell = GenerateHookCell::new();
        hook_cell.set(Arc::new(FakeHook::new(text_response("unused"))));
        let middleware = ToolCallMiddleware::new(100, registry, hook_cell);

        let mut ctx = Context::new(
            HeaderMap::new(),
            serde_json::json!({"model": "m1", "messages": [], "stream": false}),
            Modality::Text,
        );
        ctx.response = Some(ResponseBody::Single(Delta::text("plain answer")));

        let flow = middleware.post_response(&mut ctx).await.unwrap();
        assert_eq!(flow, Flow::Continue);
    }
}
