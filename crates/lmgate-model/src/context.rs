use std::collections::HashMap;

use http::HeaderMap;
use serde_json::Value;

use crate::delta::Delta;
use crate::response::ResponseBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Text,
    Image,
    Audio,
    Embedding,
    Video,
    CountTokens,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Audio => "audio",
            Modality::Embedding => "embedding",
            Modality::Video => "video",
            Modality::CountTokens => "count_tokens",
        }
    }
}

/// Cross-middleware scratch space. `extra` carries ad-hoc keys such as
/// `last_length_<phase>` de-duplication counters that don't warrant a
/// dedicated field.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub task_id: Option<String>,
    pub usage: Option<Value>,
    pub worker: Option<String>,
    pub stream_content: Option<Delta>,
    pub last_length: HashMap<String, usize>,
    pub extra: HashMap<String, Value>,
}

/// Optional rewrites applied by `Context::payload`.
#[derive(Debug, Clone, Default)]
pub struct PayloadSettings {
    pub aliases: HashMap<String, String>,
    /// `None` means "delete this key"; `Some(v)` means "set to v".
    pub overrides: HashMap<String, Option<Value>>,
}

/// The per-request envelope that flows through every layer. `body` is never
/// mutated in place by the core; only the deep copy returned by `payload`
/// may be mutated before handing it to an upstream.
pub struct Context {
    pub headers: HeaderMap,
    body: Value,
    pub modality: Modality,
    pub response: Option<ResponseBody>,
    pub status_code: u16,
    pub response_headers: HeaderMap,
    pub metadata: Metadata,
}

impl Context {
    pub fn new(headers: HeaderMap, body: Value, modality: Modality) -> Self {
        Self {
            headers,
            body,
            modality,
            response: None,
            status_code: 200,
            response_headers: HeaderMap::new(),
            metadata: Metadata::default(),
        }
    }

    /// Read-only view of the original request body. Workers must never
    /// mutate through this reference; use `payload` to obtain a mutable
    /// copy. Middleware rewriting the conversation in place (Regex, Inject,
    /// Macro, Tools) uses `body_mut` instead.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Mutable access to the request body, for middleware that rewrites the
    /// conversation in place before it reaches a Worker (message injection,
    /// regex rewrites, macro expansion, tool-call follow-up messages).
    pub fn body_mut(&mut self) -> &mut Value {
        &mut self.body
    }

    pub fn model(&self) -> &str {
        self.body.get("model").and_then(Value::as_str).unwrap_or("")
    }

    pub fn stream(&self) -> bool {
        self.body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Deep copy of `body` with `settings.aliases`/`settings.overrides`
    /// applied. The original `body` is left untouched.
    pub fn payload(&self, settings: &PayloadSettings) -> Value {
        let mut payload = self.body.clone();

        if let Some(model) = payload.get("model").and_then(Value::as_str) {
            if let Some(aliased) = settings.aliases.get(model) {
                payload["model"] = Value::String(aliased.clone());
            }
        }

        if let Value::Object(map) = &mut payload {
            for (key, value) in &settings.overrides {
                match value {
                    Some(v) => {
                        map.insert(key.clone(), v.clone());
                    }
                    None => {
                        map.remove(key);
                    }
                }
            }
        }

        payload
    }
}
