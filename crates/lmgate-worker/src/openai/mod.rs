mod config;
mod parse;

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use regex::Regex;
use serde_json::Value;

use lmgate_model::{
    fold_text_stream, Context, Delta, DeltaStream, Modality, PayloadSettings, ResponseBody,
    WorkerError,
};
use lmgate_resources::{HttpClientScope, ProxyFactory, ResourcePool};

use crate::sse::{SseLine, SseLineDecoder};
use crate::worker::Worker;

pub use config::{KeyManagerConfig, OpenAiWorkerConfig};

/// Reference OpenAI-compatible adapter: one upstream speaking the OpenAI
/// chat-completions wire format, behind a pool of API keys and an optional
/// egress proxy.
#[derive(Clone)]
pub struct OpenAiWorker {
    name: String,
    priority: i32,
    config: Arc<OpenAiWorkerConfig>,
    keys: Arc<ResourcePool>,
    proxy: Arc<ResourcePool>,
    filters: Arc<Vec<Regex>>,
    /// Statically configured at construction time; always allowed regardless
    /// of what discovery later reports, mirroring the original's
    /// `_initial_available_models`.
    available_models: Arc<HashSet<String>>,
    /// Overwritten wholesale by `set_available_models` after each
    /// `WorkerManager::models()` refresh.
    discovered_models: Arc<RwLock<HashSet<String>>>,
}

impl OpenAiWorker {
    pub fn new(
        name: String,
        priority: i32,
        config: OpenAiWorkerConfig,
        proxy_factory: &ProxyFactory,
    ) -> Self {
        let keys = ResourcePool::new(
            config.all_keys(),
            Duration::from_secs(config.key_manager.cooldown_time),
            1,
        );
        let proxy = proxy_factory.get(&config.proxy);
        let filters = config
            .filters
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect();

        let mut available_models: HashSet<String> = config.models.iter().cloned().collect();
        available_models.extend(config.aliases.keys().cloned());

        Self {
            name,
            priority,
            config: Arc::new(config),
            keys,
            proxy,
            filters: Arc::new(filters),
            available_models: Arc::new(available_models),
            discovered_models: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    fn payload_settings(&self) -> PayloadSettings {
        PayloadSettings {
            aliases: self.config.aliases.clone(),
            overrides: self.config.overrides.clone(),
        }
    }

    fn key_timeout(&self) -> Duration {
        Duration::from_secs(self.config.key_manager.default_timeout.max(1))
    }

    async fn call_single(&self, ctx: &mut Context) -> Result<Delta, WorkerError> {
        let payload = ctx.payload(&self.payload_settings());
        let (delta, usage) = fetch_single(
            self.config.clone(),
            self.keys.clone(),
            self.proxy.clone(),
            self.name.clone(),
            payload,
        )
        .await?;
        if usage.is_some() {
            ctx.metadata.usage = usage;
        }
        Ok(delta)
    }

    async fn call_streaming(&self, ctx: &Context) -> Result<DeltaStream, WorkerError> {
        let payload = ctx.payload(&self.payload_settings());
        fetch_streaming(
            self.config.clone(),
            self.keys.clone(),
            self.proxy.clone(),
            self.name.clone(),
            payload,
        )
        .await
    }

    /// Non-streaming upstream call disguised as a stream: a heartbeat Delta
    /// every `fake_streaming_interval` seconds, then the final Delta.
    fn fake_stream(&self, ctx: &Context) -> DeltaStream {
        let payload = ctx.payload(&self.payload_settings());
        let config = self.config.clone();
        let keys = self.keys.clone();
        let proxy = self.proxy.clone();
        let name = self.name.clone();
        let interval = Duration::from_secs_f64(config.fake_streaming_interval.max(0.1));

        let stream = async_stream::stream! {
            let handle = tokio::spawn(fetch_single(config, keys, proxy, name, payload));
            tokio::pin!(handle);
            loop {
                tokio::select! {
                    joined = &mut handle => {
                        match joined {
                            // Fake streaming has no Context to attach `usage`
                            // to once the background call completes; the
                            // caller only ever sees the Delta stream.
                            Ok(Ok((delta, _usage))) => yield Ok(delta),
                            Ok(Err(err)) => yield Err(err),
                            Err(_) => yield Err(WorkerError::Fatal(
                                "background generation task panicked".to_string(),
                            )),
                        }
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        yield Ok(Delta::empty_text());
                    }
                }
            }
        };

        Box::pin(stream)
    }
}

#[async_trait::async_trait]
impl Worker for OpenAiWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn supports_model(&self, model: &str, modality: Modality) -> bool {
        let known = |model: &str| {
            self.available_models.contains(model)
                || self
                    .discovered_models
                    .read()
                    .map(|set| set.contains(model))
                    .unwrap_or(false)
        };
        match modality {
            Modality::Text | Modality::CountTokens => known(model),
            Modality::Embedding => self.config.embedding_url.is_some() && known(model),
            Modality::Image | Modality::Audio | Modality::Video => false,
        }
    }

    fn set_available_models(&self, models: &[String]) {
        if let Ok(mut set) = self.discovered_models.write() {
            set.clear();
            set.extend(models.iter().cloned());
        }
    }

    async fn models(&self) -> Result<Vec<String>, WorkerError> {
        let Some(models_url) = &self.config.models_url else {
            let mut models: Vec<String> = self.available_models.iter().cloned().collect();
            models.sort();
            return Ok(models);
        };

        let slot = self
            .keys
            .acquire(self.key_timeout())
            .await
            .map_err(|_| WorkerError::Overload(format!("{}: no API keys available", self.name)))?;
        let scope = HttpClientScope::acquire(&self.name, self.proxy.clone(), self.key_timeout())
            .await
            .map_err(|_| {
                WorkerError::Overload(format!("{}: no egress proxy available", self.name))
            })?;

        let mut request = scope.client.get(models_url.as_str());
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if !slot.value.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", slot.value));
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(err) => {
                slot.release();
                return Err(WorkerError::Upstream(format!("{}: {err}", self.name)));
            }
        };

        let status_code = response.status().as_u16();
        if !(200..300).contains(&status_code) {
            let retry_after = retry_after_duration(&response);
            settle_key_on_status(slot, status_code, retry_after);
            return Err(classify_status_error(&self.name, status_code));
        }
        slot.release();

        let data: Value = response
            .json()
            .await
            .map_err(|err| WorkerError::Upstream(format!("{}: {err}", self.name)))?;

        let reverse_aliases: std::collections::HashMap<&str, &str> = self
            .config
            .aliases
            .iter()
            .map(|(alias, native)| (native.as_str(), alias.as_str()))
            .collect();

        let ids = data
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = Vec::new();
        for item in ids {
            let Some(id) = item.get("id").and_then(Value::as_str) else {
                continue;
            };
            if !self.filters.is_empty() && !self.filters.iter().any(|f| f.is_match(id)) {
                continue;
            }
            result.push(
                reverse_aliases
                    .get(id)
                    .map(|alias| alias.to_string())
                    .unwrap_or_else(|| id.to_string()),
            );
        }
        Ok(result)
    }

    async fn generate_text(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        if !self.supports_model(ctx.model(), Modality::Text) {
            return Err(WorkerError::Unsupported(format!(
                "{}: model {} not available",
                self.name,
                ctx.model()
            )));
        }

        let client_wants_stream = ctx.stream();

        match (self.config.streaming, client_wants_stream) {
            (None, true) | (Some(true), true) => {
                Ok(ResponseBody::Stream(self.call_streaming(ctx).await?))
            }
            (None, false) => Ok(ResponseBody::Single(self.call_single(ctx).await?)),
            (Some(true), false) => {
                let stream = self.call_streaming(ctx).await?;
                Ok(ResponseBody::Single(fold_text_stream(stream).await?))
            }
            (Some(false), true) => Ok(ResponseBody::Stream(self.fake_stream(ctx))),
            (Some(false), false) => Ok(ResponseBody::Single(self.call_single(ctx).await?)),
        }
    }

    async fn generate_embedding(&self, ctx: &mut Context) -> Result<ResponseBody, WorkerError> {
        let Some(embedding_url) = self.config.embedding_url.clone() else {
            return Err(WorkerError::Unsupported(format!(
                "{} does not support embeddings",
                self.name
            )));
        };

        let slot = self
            .keys
            .acquire(self.key_timeout())
            .await
            .map_err(|_| WorkerError::Overload(format!("{}: no API keys available", self.name)))?;
        let scope = HttpClientScope::acquire(&self.name, self.proxy.clone(), self.key_timeout())
            .await
            .map_err(|_| {
                WorkerError::Overload(format!("{}: no egress proxy available", self.name))
            })?;

        let payload = ctx.payload(&self.payload_settings());
        let mut request = scope.client.post(embedding_url.as_str()).json(&payload);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if !slot.value.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", slot.value));
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(err) => {
                slot.release();
                return Err(WorkerError::Upstream(format!("{}: {err}", self.name)));
            }
        };

        let status_code = response.status().as_u16();
        if !(200..300).contains(&status_code) {
            let retry_after = retry_after_duration(&response);
            settle_key_on_status(slot, status_code, retry_after);
            return Err(classify_status_error(&self.name, status_code));
        }
        slot.release();

        let data: Value = response
            .json()
            .await
            .map_err(|err| WorkerError::Upstream(format!("{}: {err}", self.name)))?;

        let embedding = data
            .get("data")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("embedding"))
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|v| v as f32)
                    .collect::<Vec<_>>()
            })
            .ok_or_else(|| {
                WorkerError::Upstream(format!("{}: response had no embedding", self.name))
            })?;

        if let Some(usage) = parse::parse_usage(&data) {
            ctx.metadata.usage = Some(usage);
        }

        Ok(ResponseBody::Single(Delta::Embedding { content: embedding }))
    }

    /// Best-effort local estimate: whitespace word count scaled by a
    /// constant, never an exact tokenizer. No `completions_url`-sibling
    /// tokenizer endpoint is wired up for this adapter.
    async fn count_tokens(&self, ctx: &Context) -> Result<i64, WorkerError> {
        let words: usize = ctx
            .body()
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m.get("content").and_then(Value::as_str))
                    .map(|content| content.split_whitespace().count())
                    .sum()
            })
            .unwrap_or(0);

        Ok(((words as f64) * 1.3).round() as i64)
    }
}

async fn fetch_single(
    config: Arc<OpenAiWorkerConfig>,
    keys: Arc<ResourcePool>,
    proxy: Arc<ResourcePool>,
    name: String,
    payload: Value,
) -> Result<(Delta, Option<Value>), WorkerError> {
    let timeout = Duration::from_secs(config.key_manager.default_timeout.max(1));
    let slot = keys
        .acquire(timeout)
        .await
        .map_err(|_| WorkerError::Overload(format!("{name}: no API keys available")))?;
    let scope = HttpClientScope::acquire(&name, proxy, timeout)
        .await
        .map_err(|_| WorkerError::Overload(format!("{name}: no egress proxy available")))?;

    let mut body = payload;
    if let Value::Object(map) = &mut body {
        map.insert("stream".to_string(), Value::Bool(false));
    }

    let mut request = scope.client.post(config.completions_url.as_str()).json(&body);
    for (key, value) in &config.headers {
        request = request.header(key, value);
    }
    if !slot.value.is_empty() {
        request = request.header("Authorization", format!("Bearer {}", slot.value));
    }

    let response = match request.send().await {
        Ok(resp) => resp,
        Err(err) => {
            slot.release();
            return Err(WorkerError::Upstream(format!("{name}: {err}")));
        }
    };

    let status_code = response.status().as_u16();
    if !(200..300).contains(&status_code) {
        let retry_after = retry_after_duration(&response);
        settle_key_on_status(slot, status_code, retry_after);
        return Err(classify_status_error(&name, status_code));
    }
    slot.release();

    let data: Value = response
        .json()
        .await
        .map_err(|err| WorkerError::Upstream(format!("{name}: {err}")))?;

    let usage = parse::parse_usage(&data);
    Ok((parse::parse_choice(&data), usage))
}

async fn fetch_streaming(
    config: Arc<OpenAiWorkerConfig>,
    keys: Arc<ResourcePool>,
    proxy: Arc<ResourcePool>,
    name: String,
    payload: Value,
) -> Result<DeltaStream, WorkerError> {
    let timeout = Duration::from_secs(config.key_manager.default_timeout.max(1));
    let slot = keys
        .acquire(timeout)
        .await
        .map_err(|_| WorkerError::Overload(format!("{name}: no API keys available")))?;
    let scope = HttpClientScope::acquire(&name, proxy, timeout)
        .await
        .map_err(|_| WorkerError::Overload(format!("{name}: no egress proxy available")))?;

    let mut body = payload;
    if let Value::Object(map) = &mut body {
        map.insert("stream".to_string(), Value::Bool(true));
    }

    let mut request = scope.client.post(config.completions_url.as_str()).json(&body);
    for (key, value) in &config.headers {
        request = request.header(key, value);
    }
    if !slot.value.is_empty() {
        request = request.header("Authorization", format!("Bearer {}", slot.value));
    }

    let response = match request.send().await {
        Ok(resp) => resp,
        Err(err) => {
            slot.release();
            return Err(WorkerError::Upstream(format!("{name}: {err}")));
        }
    };

    let status_code = response.status().as_u16();
    if !(200..300).contains(&status_code) {
        let retry_after = retry_after_duration(&response);
        let message = response.text().await.unwrap_or_default();
        settle_key_on_status(slot, status_code, retry_after);
        return Err(classify_status_error_with_body(&name, status_code, &message));
    }
    slot.release();

    let stream = async_stream::try_stream! {
        let mut decoder = SseLineDecoder::new();
        let mut bytes = response.bytes_stream();
        'outer: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|err| WorkerError::Upstream(format!("{name}: {err}")))?;
            for line in decoder.push(&chunk) {
                match line {
                    SseLine::Done => break 'outer,
                    SseLine::Data(data) => {
                        let json: Value = serde_json::from_str(&data).map_err(|err| {
                            WorkerError::Upstream(format!("{name}: invalid SSE payload: {err}"))
                        })?;
                        yield parse::parse_choice(&json);
                    }
                }
            }
        }
    };

    Ok(Box::pin(stream))
}

const RATE_LIMIT_FALLBACK_SECS: u64 = 30;
const AUTH_INVALID_YEARS: u64 = 9_999;

/// Classifies a failed-call key slot per §7's status-to-cooldown table,
/// mirroring `default_decide_unavailable`: a 429 cools for its
/// `Retry-After` duration (or a short fixed fallback without the header);
/// a 401/403 marks the key unavailable for a very long duration rather
/// than discarding it outright; anything else (5xx, unclassified 4xx)
/// falls back to the pool's own configured `cooldown_time`.
fn settle_key_on_status(
    slot: lmgate_resources::pool::ResourceSlot,
    status: u16,
    retry_after: Option<Duration>,
) {
    match status {
        429 => {
            let cooldown = retry_after.unwrap_or(Duration::from_secs(RATE_LIMIT_FALLBACK_SECS));
            slot.release_with(cooldown);
        }
        401 | 403 => slot.release_with(auth_invalid_duration()),
        _ => slot.release(),
    }
}

fn auth_invalid_duration() -> Duration {
    Duration::from_secs(AUTH_INVALID_YEARS * 365 * 24 * 60 * 60)
}

/// Parses a `Retry-After: <seconds>` response header, per §7's "429 with
/// `Retry-After` cools for that many seconds" rule.
fn retry_after_duration(response: &wreq::Response) -> Option<Duration> {
    let value = response.headers().get("retry-after")?;
    let text = value.to_str().ok()?.trim();
    let secs: u64 = text.parse().ok()?;
    Some(Duration::from_secs(secs))
}

fn classify_status_error(name: &str, status: u16) -> WorkerError {
    classify_status_error_with_body(name, status, "")
}

fn classify_status_error_with_body(name: &str, status: u16, body: &str) -> WorkerError {
    match status {
        401 | 403 => WorkerError::NoAvailable(format!("{name}: upstream rejected ({status})")),
        429 => WorkerError::Overload(format!("{name}: rate limited")),
        500..=599 => WorkerError::Upstream(format!("{name}: upstream error {status}: {body}")),
        _ => WorkerError::Upstream(format!("{name}: unexpected status {status}: {body}")),
    }
}
