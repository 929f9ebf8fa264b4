use async_trait::async_trait;
use lmgate_model::{Context, Modality, Termination};
use serde::Deserialize;
use serde_json::Value;

use crate::middleware::{Flow, Middleware};

fn default_role() -> String {
    "any".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Keywords {
    One(String),
    Many(Vec<String>),
}

impl Default for Keywords {
    fn default() -> Self {
        Keywords::Many(Vec::new())
    }
}

/// One configured message insertion. Grounded on `middlewares/inject.py`'s
/// `Insertion` TypedDict.
#[derive(Debug, Clone, Deserialize)]
pub struct InsertionConfig {
    pub order: i64,
    #[serde(default = "default_role")]
    pub role: String,
    pub content: Value,
    #[serde(default)]
    pub before: bool,
    #[serde(default)]
    pub keywords: Keywords,
}

/// Inserts (or merges) extra messages at configured positions, filtered by
/// keyword match against the conversation's existing string content.
/// Grounded on `middlewares/inject.py::InjectMiddleware`.
pub struct InjectMiddleware {
    priority: i32,
    insertions: Vec<InsertionConfig>,
    debug: bool,
}

impl InjectMiddleware {
    pub fn new(priority: i32, insertions: Vec<InsertionConfig>, debug: bool) -> Self {
        Self {
            priority,
            insertions,
            debug,
        }
    }

    fn matches_keywords(keywords: &Keywords, haystack: &str) -> bool {
        match keywords {
            Keywords::One(k) if k.is_empty() => true,
            Keywords::One(k) => haystack.contains(k.as_str()),
            Keywords::Many(ks) if ks.is_empty() => true,
            Keywords::Many(ks) => ks.iter().any(|k| haystack.contains(k.as_str())),
        }
    }

    fn to_content_list(content: &Value) -> Vec<Value> {
        match content {
            Value::String(text) => {
                vec![serde_json::json!({"type": "text", "text": text})]
            }
            Value::Array(parts) => parts.clone(),
            other => vec![other.clone()],
        }
    }

    fn merge_content(existing: &Value, incoming: &Value, before: bool) -> Value {
        if let (Value::String(existing), Value::String(incoming)) = (existing, incoming) {
            return if before {
                Value::String(format!("{incoming}{existing}"))
            } else {
                Value::String(format!("{existing}{incoming}"))
            };
        }

        let mut existing_list = Self::to_content_list(existing);
        let mut incoming_list = Self::to_content_list(incoming);
        if before {
            incoming_list.append(&mut existing_list);
            Value::Array(incoming_list)
        } else {
            existing_list.append(&mut incoming_list);
            Value::Array(existing_list)
        }
    }

    /// Converts a (possibly negative, possibly out-of-range) configured
    /// `order` into a strict array index for reading `messages[order]`.
    /// `None` mirrors Python's `IndexError`.
    fn strict_index(order: i64, len: usize) -> Option<usize> {
        let len = len as i64;
        let real = if order < 0 { len + order } else { order };
        if real < 0 || real >= len {
            None
        } else {
            Some(real as usize)
        }
    }

    /// Converts `order` into a clamped insertion point, mirroring Python
    /// `list.insert`'s lenient out-of-range handling.
    fn insert_index(order: i64, len: usize) -> usize {
        let len_i = len as i64;
        let real = if order < 0 { (len_i + order).max(0) } else { order.min(len_i) };
        real as usize
    }

    fn insert(&self, messages: &mut Vec<Value>) {
        let contents: Vec<&str> = messages
            .iter()
            .filter_map(|m| m.get("content").and_then(Value::as_str))
            .collect();
        let haystack = contents.join("\n\n");

        let mut applicable: Vec<&InsertionConfig> = self
            .insertions
            .iter()
            .filter(|ins| Self::matches_keywords(&ins.keywords, &haystack))
            .collect();
        if applicable.is_empty() {
            return;
        }

        // Descending order, matching the original's stable-indexing sort.
        applicable.sort_by(|a, b| b.order.cmp(&a.order));

        for insertion in applicable {
            if insertion.content.is_null() {
                continue;
            }
            if let Value::String(s) = &insertion.content {
                if s.is_empty() {
                    continue;
                }
            }

            match Self::strict_index(insertion.order, messages.len()) {
                Some(idx) => {
                    let same_role = insertion.role == "any"
                        || messages[idx].get("role").and_then(Value::as_str) == Some(insertion.role.as_str());

                    if same_role {
                        let merged = Self::merge_content(
                            &messages[idx]["content"],
                            &insertion.content,
                            insertion.before,
                        );
                        messages[idx]["content"] = merged;
                    } else {
                        let new_message = serde_json::json!({
                            "role": insertion.role,
                            "content": insertion.content,
                        });
                        if insertion.before {
                            messages.insert(idx, new_message);
                        } else if insertion.order == -1 {
                            messages.push(new_message);
                        } else {
                            messages.insert(idx + 1, new_message);
                        }
                    }
                }
                None => {
                    let new_message = serde_json::json!({
                        "role": insertion.role,
                        "content": insertion.content,
                    });
                    let idx = Self::insert_index(insertion.order, messages.len());
                    messages.insert(idx, new_message);
                }
            }
        }

        if self.debug {
            tracing::info!(?messages, "inject middleware result");
        }
    }
}

#[async_trait]
impl Middleware for InjectMiddleware {
    fn name(&self) -> &str {
        "inject"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn pre_request(&self, ctx: &mut Context) -> Result<Flow, Termination> {
        if ctx.modality != Modality::Text {
            return Ok(Flow::Continue);
        }

        if let Some(Value::Array(messages)) = ctx.body_mut().get_mut("messages") {
            self.insert(messages);
        }

        Ok(Flow::Continue)
    }
}
