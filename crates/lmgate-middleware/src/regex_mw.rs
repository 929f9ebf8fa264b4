use async_trait::async_trait;
use lmgate_model::{Context, Modality, Termination};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::Value;

use crate::middleware::{Flow, Middleware};

fn default_role() -> String {
    "any".to_string()
}

/// One `(pattern, replacement, role filter, depth window, flags, count)`
/// rewrite, deserialized from config then compiled once at construction.
/// Grounded on `middlewares/regex.py`'s `regexp` list entries. Replacement
/// uses the `regex` crate's `$1`/`$name` capture syntax, not Python's `\1`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegexRuleConfig {
    pub pattern: String,
    pub replacement: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub min_depth: Option<i64>,
    #[serde(default)]
    pub max_depth: Option<i64>,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub multiline: bool,
    #[serde(default)]
    pub dot_all: bool,
    #[serde(default = "default_true")]
    pub unicode: bool,
    #[serde(default)]
    pub verbose: bool,
}

fn default_true() -> bool {
    true
}

struct RegexRule {
    pattern: Regex,
    replacement: String,
    role: String,
    min_depth: Option<i64>,
    max_depth: Option<i64>,
    count: usize,
}

/// Applies an ordered list of regex rewrites to every message's text
/// content, scoped by role and a "depth" window counted back from the end
/// of the conversation (depth 0 = the last message). Grounded on
/// `middlewares/regex.py::RegexMiddleware`.
pub struct RegexMiddleware {
    priority: i32,
    rules: Vec<RegexRule>,
}

impl RegexMiddleware {
    pub fn new(priority: i32, configs: Vec<RegexRuleConfig>) -> Result<Self, regex::Error> {
        let rules = configs
            .into_iter()
            .map(|c| {
                let pattern = RegexBuilder::new(&c.pattern)
                    .case_insensitive(c.case_insensitive)
                    .multi_line(c.multiline)
                    .dot_matches_new_line(c.dot_all)
                    .unicode(c.unicode)
                    .ignore_whitespace(c.verbose)
                    .build()?;
                Ok(RegexRule {
                    pattern,
                    replacement: c.replacement,
                    role: c.role,
                    min_depth: c.min_depth,
                    max_depth: c.max_depth,
                    count: c.count,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { priority, rules })
    }

    /// Applies every rule whose role/depth window matches, in order.
    fn apply(&self, content: &str, role: &str, depth: i64) -> String {
        let mut content = content.to_string();
        for rule in &self.rules {
            if rule.role != "any" && rule.role != role {
                continue;
            }
            if let Some(min_depth) = rule.min_depth {
                if depth > min_depth {
                    continue;
                }
            }
            if let Some(max_depth) = rule.max_depth {
                if depth < max_depth {
                    continue;
                }
            }
            content = rule
                .pattern
                .replacen(&content, rule.count, rule.replacement.as_str())
                .into_owned();
        }
        content
    }
}

#[async_trait]
impl Middleware for RegexMiddleware {
    fn name(&self) -> &str {
        "regex"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn pre_request(&self, ctx: &mut Context) -> Result<Flow, Termination> {
        if ctx.modality != Modality::Text {
            return Ok(Flow::Continue);
        }

        let Some(messages) = ctx.body_mut().get_mut("messages").and_then(Value::as_array_mut)
        else {
            return Ok(Flow::Continue);
        };

        let size = messages.len();
        for (i, message) in messages.iter_mut().enumerate() {
            let depth = (size - i - 1) as i64;
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();

            match message.get_mut("content") {
                Some(Value::String(text)) => {
                    let rewritten = self.apply(text, &role, depth);
                    *text = rewritten;
                }
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if part.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(Value::String(text)) = part.get_mut("text") {
                                let rewritten = self.apply(text, &role, depth);
                                *text = rewritten;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(Flow::Continue)
    }
}
