use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One unit of generated content. The `type` tag is the discriminator; a
/// streaming response is a non-restartable sequence of Deltas all sharing
/// one tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning_content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCallDelta>>,
    },
    Image {
        content: Bytes,
        mime_type: String,
    },
    Audio {
        content: Bytes,
        mime_type: String,
    },
    Video {
        content: Bytes,
        mime_type: String,
    },
    Embedding {
        content: Vec<f32>,
    },
    CountTokens {
        content: i64,
    },
}

impl Delta {
    pub fn text(content: impl Into<String>) -> Self {
        Delta::Text {
            content: Some(content.into()),
            reasoning_content: None,
            tool_calls: None,
        }
    }

    /// All-null placeholder Delta used by StreamAdaptor heartbeats.
    pub fn empty_text() -> Self {
        Delta::Text {
            content: None,
            reasoning_content: None,
            tool_calls: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Delta::Text { .. } => "text",
            Delta::Image { .. } => "image",
            Delta::Audio { .. } => "audio",
            Delta::Video { .. } => "video",
            Delta::Embedding { .. } => "embedding",
            Delta::CountTokens { .. } => "count_tokens",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCallDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Streamed tool-call fragment, merged by `index` as chunks arrive (only
/// `function.arguments` ever accumulates across chunks for the same index).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCallDelta>,
}

/// Merges `new` into `calls` by index, per §4.7: new indices append, existing
/// indices accumulate `function.arguments`.
pub fn merge_tool_calls(calls: &mut Vec<ToolCallDelta>, new: Vec<ToolCallDelta>) {
    for incoming in new {
        if let Some(existing) = calls.iter_mut().find(|c| c.index == incoming.index) {
            if existing.id.is_none() {
                existing.id = incoming.id;
            }
            if existing.kind.is_none() {
                existing.kind = incoming.kind;
            }
            match (&mut existing.function, incoming.function) {
                (Some(existing_fn), Some(incoming_fn)) => {
                    if existing_fn.name.is_none() {
                        existing_fn.name = incoming_fn.name;
                    }
                    match (&mut existing_fn.arguments, incoming_fn.arguments) {
                        (Some(acc), Some(suffix)) => acc.push_str(&suffix),
                        (acc @ None, Some(suffix)) => *acc = Some(suffix),
                        _ => {}
                    }
                }
                (existing_fn @ None, Some(incoming_fn)) => *existing_fn = Some(incoming_fn),
                _ => {}
            }
        } else {
            calls.push(incoming);
        }
    }
}
