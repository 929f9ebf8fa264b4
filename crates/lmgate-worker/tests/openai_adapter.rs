use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures_util::StreamExt;
use http::HeaderMap;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lmgate_model::{Context, Delta, Modality, ResponseBody};
use lmgate_resources::ProxyFactory;
use lmgate_worker::openai::{KeyManagerConfig, OpenAiWorkerConfig};
use lmgate_worker::{OpenAiWorker, Worker};

fn chat_ctx(model: &str, stream: bool) -> Context {
    let body = json!({
        "model": model,
        "stream": stream,
        "messages": [{"role": "user", "content": "hi"}],
    });
    Context::new(HeaderMap::new(), body, Modality::Text)
}

fn null_proxy_factory() -> ProxyFactory {
    ProxyFactory::new(&HashMap::new())
}

/// Four concurrent completions across a two-key pool with no cooldown: each
/// key should come back into rotation immediately after release, so across
/// four calls each key is used exactly twice.
#[tokio::test]
async fn key_pool_round_robins_under_concurrency() {
    let server = MockServer::start().await;
    for key in ["k1", "k2"] {
        let bearer = format!("Bearer {key}");
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", bearer.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "ok"}}],
            })))
            .expect(2)
            .mount(&server)
            .await;
    }

    let worker = OpenAiWorker::new(
        "round-robin".to_string(),
        100,
        OpenAiWorkerConfig {
            models: vec!["m1".to_string()],
            api_keys: vec!["k1".to_string(), "k2".to_string()],
            completions_url: format!("{}/chat/completions", server.uri()),
            key_manager: KeyManagerConfig {
                cooldown_time: 0,
                default_timeout: 5,
            },
            ..Default::default()
        },
        &null_proxy_factory(),
    );

    let calls = (0..4).map(|_| {
        let worker = worker.clone();
        tokio::spawn(async move {
            let mut ctx = chat_ctx("m1", false);
            worker.generate_text(&mut ctx).await
        })
    });
    for call in calls {
        call.await.unwrap().unwrap();
    }
}

/// A 429 with `Retry-After` cools its key for that exact duration rather
/// than the pool's default `cooldown_time`: with only one key configured, a
/// second call issued before the header's window elapses must see the pool
/// still starved and time out instead of reusing the cooling key.
#[tokio::test]
async fn rate_limited_key_cools_for_retry_after_duration() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "2")
                .set_body_json(json!({"error": "slow down"})),
        )
        .mount(&server)
        .await;

    let worker = OpenAiWorker::new(
        "rate-limited".to_string(),
        100,
        OpenAiWorkerConfig {
            models: vec!["m1".to_string()],
            api_keys: vec!["only-key".to_string()],
            completions_url: format!("{}/chat/completions", server.uri()),
            key_manager: KeyManagerConfig {
                cooldown_time: 0,
                default_timeout: 1,
            },
            ..Default::default()
        },
        &null_proxy_factory(),
    );

    let mut first = chat_ctx("m1", false);
    assert!(worker.generate_text(&mut first).await.is_err());

    let mut second = chat_ctx("m1", false);
    let result = worker.generate_text(&mut second).await;
    assert!(result.is_err(), "key should still be cooling down from retry-after");
}

/// A non-streaming worker wrapped in fake streaming emits heartbeat Deltas
/// (empty text) at `fake_streaming_interval` while the real call is still
/// in flight, then a single final Delta carrying the accumulated content.
#[tokio::test]
async fn fake_streaming_emits_heartbeats_before_final_delta() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "choices": [{"message": {"content": "final answer"}}],
                }))
                .set_delay(Duration::from_millis(2500)),
        )
        .mount(&server)
        .await;

    let worker = OpenAiWorker::new(
        "fake-stream".to_string(),
        100,
        OpenAiWorkerConfig {
            models: vec!["m1".to_string()],
            api_keys: vec!["k1".to_string()],
            completions_url: format!("{}/chat/completions", server.uri()),
            streaming: Some(false),
            fake_streaming_interval: 1.0,
            key_manager: KeyManagerConfig {
                cooldown_time: 0,
                default_timeout: 5,
            },
            ..Default::default()
        },
        &null_proxy_factory(),
    );

    let mut ctx = chat_ctx("m1", true);
    let body = worker.generate_text(&mut ctx).await.unwrap();
    let ResponseBody::Stream(mut stream) = body else {
        panic!("expected a stream response from fake streaming");
    };

    let mut heartbeats = 0;
    let mut final_content = None;
    while let Some(item) = stream.next().await {
        match item.unwrap() {
            Delta::Text {
                content: None,
                reasoning_content: None,
                tool_calls: None,
            } => heartbeats += 1,
            Delta::Text { content, .. } => final_content = content,
            other => panic!("unexpected delta kind: {}", other.kind()),
        }
    }

    assert!(heartbeats >= 2, "expected at least 2 heartbeats, got {heartbeats}");
    assert_eq!(final_content.as_deref(), Some("final answer"));
}

/// A 401 response marks its key unavailable for a duration long enough that
/// it never cycles back into rotation within this test, even with no other
/// key to fall back on.
#[tokio::test]
async fn auth_rejected_key_does_not_return_to_rotation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer bad-key"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "invalid key"})))
        .mount(&server)
        .await;

    let worker = OpenAiWorker::new(
        "auth-rejected".to_string(),
        100,
        OpenAiWorkerConfig {
            models: vec!["m1".to_string()],
            api_keys: vec!["bad-key".to_string()],
            completions_url: format!("{}/chat/completions", server.uri()),
            key_manager: KeyManagerConfig {
                cooldown_time: 0,
                default_timeout: 1,
            },
            ..Default::default()
        },
        &null_proxy_factory(),
    );

    let mut first = chat_ctx("m1", false);
    assert!(worker.generate_text(&mut first).await.is_err());

    let mut second = chat_ctx("m1", false);
    assert!(worker.generate_text(&mut second).await.is_err());
}

/// `supports_model` consults both the statically configured model set and
/// whatever `set_available_models` last wrote, mirroring the original's
/// always-allowed initial list plus a refreshed discovery set.
#[test]
fn discovered_models_extend_the_static_set() {
    let worker = OpenAiWorker::new(
        "discovery".to_string(),
        100,
        OpenAiWorkerConfig {
            models: vec!["static-model".to_string()],
            ..Default::default()
        },
        &null_proxy_factory(),
    );

    assert!(worker.supports_model("static-model", Modality::Text));
    assert!(!worker.supports_model("discovered-model", Modality::Text));

    worker.set_available_models(&["discovered-model".to_string()]);

    assert!(worker.supports_model("static-model", Modality::Text));
    assert!(worker.supports_model("discovered-model", Modality::Text));

    let mut refreshed = HashSet::new();
    refreshed.insert("only-this-one".to_string());
    worker.set_available_models(&refreshed.into_iter().collect::<Vec<_>>());

    assert!(!worker.supports_model("discovered-model", Modality::Text));
    assert!(worker.supports_model("only-this-one", Modality::Text));
}
