use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use lmgate_model::{Context, Modality, Termination};
use regex::Regex;
use serde_json::Value;

use crate::middleware::{Flow, Middleware};

/// One registered macro implementation: takes the pipe-separated, already
/// unescaped argument list and returns the replacement text.
pub type MacroFn =
    Arc<dyn Fn(Vec<String>) -> Pin<Box<dyn Future<Output = String> + Send>> + Send + Sync>;

/// Registry of named macro implementations, grounded on `macro.py`'s
/// `MACRO_REGISTRY`. Built once at bootstrap and handed to
/// `MacroMiddleware` as an `Arc`; never mutated afterward.
#[derive(Default, Clone)]
pub struct MacroRegistry {
    macros: HashMap<String, MacroFn>,
}

impl MacroRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, func: MacroFn) {
        self.macros.insert(name.into(), func);
    }

    /// Renders `template` by repeatedly replacing the innermost `{{...}}`
    /// block until none remain or `max_iterations` is reached. Grounded on
    /// `macro.py::render`/`_execute_macro`: pipe-separated args, `\|`/`\\`
    /// unescaping, and an unknown-or-failing macro call leaves the block
    /// untouched rather than aborting the whole template.
    pub async fn render(&self, template: &str, max_iterations: u32) -> String {
        static INNERMOST: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
        let pattern = INNERMOST.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").unwrap());

        let mut current = template.to_string();
        for _ in 0..max_iterations {
            let Some(captures) = pattern.captures(&current) else {
                break;
            };
            let whole = captures.get(0).unwrap();
            let inner = captures.get(1).unwrap().as_str().trim();

            let replacement = self.execute(inner).await;
            current = format!(
                "{}{}{}",
                &current[..whole.start()],
                replacement,
                &current[whole.end()..]
            );
        }
        current
    }

    async fn execute(&self, raw: &str) -> String {
        let mut parts = split_unescaped_pipe(raw);
        if parts.is_empty() {
            return format!("{{{{{raw}}}}}");
        }
        let name = parts.remove(0).trim().to_string();

        let Some(func) = self.macros.get(&name) else {
            return format!("{{{{{raw}}}}}");
        };

        func(parts).await
    }
}

/// Splits on `|` that isn't preceded by `\`, then unescapes `\|` and `\\` in
/// each resulting piece.
fn split_unescaped_pipe(raw: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('|') => {
                    current.push('|');
                    chars.next();
                }
                Some('\\') => {
                    current.push('\\');
                    chars.next();
                }
                _ => current.push(c),
            }
        } else if c == '|' {
            pieces.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    pieces.push(current);
    pieces.into_iter().map(|p| p.trim().to_string()).collect()
}

/// Walks `body.messages` and renders any string content containing `{{`
/// through the macro registry. Grounded on
/// `middlewares/macros.py::MacroMiddleware`.
pub struct MacroMiddleware {
    priority: i32,
    registry: Arc<MacroRegistry>,
    max_iterations: u32,
}

impl MacroMiddleware {
    pub fn new(priority: i32, registry: Arc<MacroRegistry>, max_iterations: u32) -> Self {
        Self {
            priority,
            registry,
            max_iterations,
        }
    }

    async fn render_content(&self, content: &mut Value) {
        match content {
            Value::String(text) => {
                if text.contains("{{") {
                    *text = self.registry.render(text, self.max_iterations).await;
                }
            }
            Value::Array(parts) => {
                for part in parts {
                    if part.get("type").and_then(Value::as_str) == Some("text") {
                        if let Some(Value::String(text)) = part.get_mut("text") {
                            if text.contains("{{") {
                                let rendered =
                                    self.registry.render(text, self.max_iterations).await;
                                *text = rendered;
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Middleware for MacroMiddleware {
    fn name(&self) -> &str {
        "macro"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn pre_request(&self, ctx: &mut Context) -> Result<Flow, Termination> {
        if ctx.modality != Modality::Text {
            return Ok(Flow::Continue);
        }

        if let Some(messages) = ctx.body_mut().get_mut("messages").and_then(Value::as_array_mut) {
            for message in messages {
                if let Some(content) = message.get_mut("content") {
                    let mut owned = std::mem::take(content);
                    self.render_content(&mut owned).await;
                    *content = owned;
                }
            }
        }

        Ok(Flow::Continue)
    }
}
