use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};

use lmgate_model::{Delta, DeltaStream, EngineError, Response as EngineResponse, ResponseBody};

use crate::bootstrap::AppState;

/// One POST route per modality plus `/v1/models`, matching §4.9's minimal
/// route layer: decode `(body, headers)` into a Context, call the matching
/// `Engine` method, re-encode the `Response`. No business logic lives here
/// beyond that boundary crossing and the OpenAI-shaped envelopes the rest
/// of this file builds.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/images/generations", post(image_generations))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/videos/generations", post(video_generations))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(models))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    let model = model_of(&body);
    match state.engine.generate_text(body, headers).await {
        Ok(response) => chat_response(response, model),
        Err(err) => engine_error_response(err),
    }
}

async fn image_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    render_generic(state.engine.generate_image(body, headers).await)
}

async fn audio_speech(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    render_generic(state.engine.generate_audio(body, headers).await)
}

async fn video_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    render_generic(state.engine.generate_video(body, headers).await)
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    let model = model_of(&body);
    match state.engine.generate_embedding(body, headers).await {
        Ok(response) => embedding_response(response, model),
        Err(err) => engine_error_response(err),
    }
}

async fn models(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let models = state.engine.models().await;
    let data: Vec<Value> = models
        .into_iter()
        .map(|id| json!({"id": id, "object": "model"}))
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

fn model_of(body: &Value) -> String {
    body.get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn engine_error_response(err: EngineError) -> axum::response::Response {
    match err {
        EngineError::Termination(t) => generic_response(t.response),
        EngineError::Worker(e) => {
            (StatusCode::BAD_GATEWAY, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

/// Renders any modality's Response without an OpenAI-shaped envelope:
/// binary Deltas (image/audio/video) pass through as raw bytes with their
/// own mime type, everything else as JSON.
fn render_generic(result: Result<EngineResponse, EngineError>) -> axum::response::Response {
    match result {
        Ok(response) => generic_response(response),
        Err(err) => engine_error_response(err),
    }
}

fn generic_response(response: EngineResponse) -> axum::response::Response {
    let status = status(response.status_code);
    let headers = response.headers;
    match response.body {
        ResponseBody::Empty => (status, headers).into_response(),
        ResponseBody::Map(value) => (status, headers, Json(value)).into_response(),
        ResponseBody::Single(delta) => match delta {
            Delta::Image { content, mime_type } | Delta::Audio { content, mime_type } | Delta::Video { content, mime_type } => {
                let mut headers = headers;
                if let Ok(value) = axum::http::HeaderValue::from_str(&mime_type) {
                    headers.insert(axum::http::header::CONTENT_TYPE, value);
                }
                (status, headers, content).into_response()
            }
            other => (status, headers, Json(delta_json(&other))).into_response(),
        },
        ResponseBody::Stream(stream) => sse_response(String::new(), stream),
    }
}

fn chat_response(response: EngineResponse, model: String) -> axum::response::Response {
    let status = status(response.status_code);
    let headers = response.headers;
    match response.body {
        ResponseBody::Stream(stream) => sse_response(model, stream),
        ResponseBody::Single(delta) => {
            let created = unix_now();
            let (content, reasoning_content, tool_calls) = match &delta {
                Delta::Text {
                    content,
                    reasoning_content,
                    tool_calls,
                } => (content.clone(), reasoning_content.clone(), tool_calls.clone()),
                _ => (None, None, None),
            };
            let mut message = json!({"role": "assistant"});
            message["content"] = content.map(Value::String).unwrap_or(Value::Null);
            if let Some(r) = reasoning_content {
                message["reasoning_content"] = Value::String(r);
            }
            if let Some(calls) = tool_calls {
                message["tool_calls"] = serde_json::to_value(calls).unwrap_or(Value::Null);
            }
            let body = json!({
                "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
                "object": "chat.completion",
                "created": created,
                "model": model,
                "choices": [{"index": 0, "message": message, "finish_reason": "stop"}],
            });
            (status, headers, Json(body)).into_response()
        }
        ResponseBody::Map(value) => (status, headers, Json(value)).into_response(),
        ResponseBody::Empty => (status, headers).into_response(),
    }
}

fn embedding_response(response: EngineResponse, model: String) -> axum::response::Response {
    let status = status(response.status_code);
    let headers = response.headers;
    match response.body {
        ResponseBody::Single(Delta::Embedding { content }) => {
            let body = json!({
                "object": "list",
                "data": [{"object": "embedding", "embedding": content, "index": 0}],
                "model": model,
            });
            (status, headers, Json(body)).into_response()
        }
        ResponseBody::Map(value) => (status, headers, Json(value)).into_response(),
        other => generic_response(EngineResponse {
            status_code: status.as_u16(),
            headers,
            body: other,
            metadata: Value::Null,
        }),
    }
}

fn delta_json(delta: &Delta) -> Value {
    serde_json::to_value(delta).unwrap_or(Value::Null)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Per §6's `Delta → SSE framing`: one `data: <json>` line per Delta, the
/// chunk preceding stream end carries `finish_reason:"stop"`, and a final
/// `data: [DONE]` line closes the stream. Detecting "the chunk preceding
/// stream end" needs a one-item lookahead, since a stream only announces
/// its own end by simply stopping.
///
/// `ctx.metadata.usage` isn't threaded out here: the Context is consumed
/// entirely within `lmgate_engine::stream_adaptor::passthrough` and never
/// escapes past the `Response` boundary, so a streamed chat completion
/// never carries a trailing `usage` object. Non-streaming completions read
/// `ctx.metadata.usage` back out through `Response.metadata`
/// (`Engine::take_response_mut`), since that Context is never discarded.
fn sse_response(model: String, stream: DeltaStream) -> axum::response::Response {
    let framed = async_stream::stream! {
        let mut stream = stream;
        let mut pending: Option<Delta> = None;

        loop {
            match stream.next().await {
                Some(Ok(delta)) => {
                    if let Some(prev) = pending.take() {
                        yield Ok::<_, std::convert::Infallible>(Event::default().data(chat_chunk(&model, prev, false)));
                    }
                    pending = Some(delta);
                }
                Some(Err(e)) => {
                    yield Ok(Event::default().data(json!({"error": e.to_string()}).to_string()));
                    return;
                }
                None => break,
            }
        }

        if let Some(last) = pending {
            yield Ok(Event::default().data(chat_chunk(&model, last, true)));
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(framed).into_response()
}

fn chat_chunk(model: &str, delta: Delta, is_last: bool) -> String {
    let delta_fields = match &delta {
        Delta::Text {
            content,
            reasoning_content,
            tool_calls,
        } => {
            let mut obj = serde_json::Map::new();
            if let Some(c) = content {
                obj.insert("content".to_string(), Value::String(c.clone()));
            }
            if let Some(r) = reasoning_content {
                obj.insert("reasoning_content".to_string(), Value::String(r.clone()));
            }
            if let Some(t) = tool_calls {
                obj.insert(
                    "tool_calls".to_string(),
                    serde_json::to_value(t).unwrap_or(Value::Null),
                );
            }
            Value::Object(obj)
        }
        other => delta_json(other),
    };

    let mut choice = json!({"index": 0, "delta": delta_fields});
    if is_last {
        choice["finish_reason"] = Value::String("stop".to_string());
    }

    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion.chunk",
        "created": unix_now(),
        "model": model,
        "choices": [choice],
    })
    .to_string()
}
