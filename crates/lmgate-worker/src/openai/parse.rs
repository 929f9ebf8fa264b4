use serde_json::Value;

use lmgate_model::{Delta, FunctionCallDelta, ToolCallDelta};

/// Extracts a text Delta from one decoded chunk (streaming) or full body
/// (non-streaming) choices[0] object, reading `delta` first then `message`.
pub fn parse_choice(data: &Value) -> Delta {
    let choice = data
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first());

    let delta = choice.and_then(|c| c.get("delta"));
    let message = choice.and_then(|c| c.get("message"));

    let content = string_field(delta, "content").or_else(|| string_field(message, "content"));
    let reasoning_content = string_field(delta, "reasoning_content")
        .or_else(|| string_field(message, "reasoning_content"));
    let tool_calls = tool_calls_field(delta).or_else(|| tool_calls_field(message));

    Delta::Text {
        content,
        reasoning_content,
        tool_calls,
    }
}

/// Extracts the top-level `usage` object of a chat-completions response, if
/// present and non-null. Sibling of `choices`, so this reads straight off
/// the decoded body rather than off a choice.
pub fn parse_usage(data: &Value) -> Option<Value> {
    data.get("usage").filter(|v| !v.is_null()).cloned()
}

fn string_field(obj: Option<&Value>, key: &str) -> Option<String> {
    obj?.get(key)?.as_str().map(str::to_string)
}

fn tool_calls_field(obj: Option<&Value>) -> Option<Vec<ToolCallDelta>> {
    let calls = obj?.get("tool_calls")?.as_array()?;
    if calls.is_empty() {
        return None;
    }

    Some(
        calls
            .iter()
            .enumerate()
            .map(|(i, call)| ToolCallDelta {
                index: call
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(i),
                id: call.get("id").and_then(Value::as_str).map(str::to_string),
                kind: call
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                function: call.get("function").map(|f| FunctionCallDelta {
                    name: f.get("name").and_then(Value::as_str).map(str::to_string),
                    arguments: f
                        .get("arguments")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }),
            })
            .collect(),
    )
}
