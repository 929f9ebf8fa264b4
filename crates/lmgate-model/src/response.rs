use std::pin::Pin;

use futures_util::StreamExt;
use http::HeaderMap;
use serde_json::Value;

use crate::delta::{merge_tool_calls, Delta};
use crate::error::WorkerError;

pub type DeltaStream = Pin<Box<dyn futures_core::Stream<Item = Result<Delta, WorkerError>> + Send>>;

/// Consumes a text Delta stream into one Delta per §4.7: `content` and
/// `reasoning_content` concatenate, `tool_calls` merge by index, and any
/// field that stayed empty collapses back to `None`.
pub async fn fold_text_stream(mut stream: DeltaStream) -> Result<Delta, WorkerError> {
    let mut content = String::new();
    let mut reasoning_content = String::new();
    let mut tool_calls: Vec<crate::delta::ToolCallDelta> = Vec::new();
    let mut saw_content = false;
    let mut saw_reasoning = false;

    while let Some(item) = stream.next().await {
        match item? {
            Delta::Text {
                content: c,
                reasoning_content: r,
                tool_calls: t,
            } => {
                if let Some(c) = c {
                    saw_content = true;
                    content.push_str(&c);
                }
                if let Some(r) = r {
                    saw_reasoning = true;
                    reasoning_content.push_str(&r);
                }
                if let Some(t) = t {
                    merge_tool_calls(&mut tool_calls, t);
                }
            }
            other => {
                return Err(WorkerError::Fatal(format!(
                    "expected a text delta, got {}",
                    other.kind()
                )))
            }
        }
    }

    Ok(Delta::Text {
        content: saw_content.then_some(content),
        reasoning_content: saw_reasoning.then_some(reasoning_content),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
    })
}

/// Holds whatever a Worker or the Engine produced for a Context: a single
/// Delta, a live stream of Deltas, or a free-form mapping (model lists,
/// error payloads).
pub enum ResponseBody {
    Empty,
    Single(Delta),
    Stream(DeltaStream),
    Map(Value),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("ResponseBody::Empty"),
            ResponseBody::Single(d) => f.debug_tuple("ResponseBody::Single").field(d).finish(),
            ResponseBody::Stream(_) => f.write_str("ResponseBody::Stream(..)"),
            ResponseBody::Map(v) => f.debug_tuple("ResponseBody::Map").field(v).finish(),
        }
    }
}

/// The outer envelope the Engine returns to the HTTP layer.
#[derive(Debug)]
pub struct Response {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub metadata: Value,
}

impl Response {
    pub fn ok(body: ResponseBody) -> Self {
        Self {
            status_code: 200,
            headers: HeaderMap::new(),
            body,
            metadata: Value::Null,
        }
    }

    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        let mut map = serde_json::Map::new();
        map.insert("error".to_string(), Value::String(message.into()));
        Self {
            status_code,
            headers: HeaderMap::new(),
            body: ResponseBody::Map(Value::Object(map)),
            metadata: Value::Null,
        }
    }

    pub fn with_header(mut self, name: http::HeaderName, value: &str) -> Self {
        if let Ok(value) = http::HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }
}
