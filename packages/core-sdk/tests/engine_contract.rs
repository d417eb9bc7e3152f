/*!
 * \brief Provider 契约测试：在本地 mock 服务上校验请求线格式、响应规整与可达性分类。
 */

use std::time::Duration;

use futures_util::StreamExt;
use sailor_core_sdk::models::{AliasConfig, Availability, ConversationMessage};
use sailor_core_sdk::{
    EngineConfig, GenerationEvent, GenerationRequest, GenerationSink, LlmEngine, LlmError,
};
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn engine() -> LlmEngine {
    let config = EngineConfig {
        auto_refresh_models: false,
        ..EngineConfig::default()
    };
    LlmEngine::new(config).expect("engine")
}

fn add_alias(engine: &LlmEngine, id: &str, provider: &str, base_url: String, api_key: &str) {
    add_alias_with_timeout(engine, id, provider, base_url, api_key, None);
}

fn add_alias_with_timeout(
    engine: &LlmEngine,
    id: &str,
    provider: &str,
    base_url: String,
    api_key: &str,
    timeout_ms: Option<u64>,
) {
    let config = AliasConfig {
        base_url: Some(base_url),
        api_key: Some(api_key.to_string()),
        timeout_ms,
        ..AliasConfig::default()
    };
    assert!(engine.store().write().add_alias(id, provider, config));
}

async fn collect(engine: &LlmEngine, request: GenerationRequest) -> Vec<GenerationEvent> {
    engine.generate(request).collect().await
}

fn deltas(events: &[GenerationEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            GenerationEvent::Delta(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[derive(Default)]
struct RecordingSink {
    deltas: Vec<String>,
    completed: Vec<String>,
    errors: Vec<String>,
}

impl GenerationSink for RecordingSink {
    fn on_delta(&mut self, text: &str) {
        self.deltas.push(text.to_string());
    }

    fn on_complete(&mut self, text: &str) {
        self.completed.push(text.to_string());
    }

    fn on_error(&mut self, error: &LlmError) {
        self.errors.push(error.to_string());
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Generation: OpenAI-compatible
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_openai_request_body_and_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}],
            "temperature": 0.7,
            "max_tokens": 2048
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"choices": [{"message": {"content": "Hi!"}}]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "a1", "openai", format!("{}/v1", server.uri()), "sk-test");

    let mut sink = RecordingSink::default();
    engine
        .generate_with(GenerationRequest::new("a1", "Hello"), &mut sink)
        .await;

    assert!(sink.deltas.is_empty());
    assert_eq!(sink.completed, vec!["Hi!".to_string()]);
    assert!(sink.errors.is_empty());
}

#[tokio::test]
async fn test_history_roles_collapsed_on_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "user", "content": "b"},
                {"role": "assistant", "content": "c"},
                {"role": "user", "content": "next"}
            ]
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"choices": [{"message": {"content": "ok"}}]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "a1", "openai", format!("{}/v1", server.uri()), "sk");
    let history = vec![
        ConversationMessage::user("a"),
        ConversationMessage::user("b"),
        ConversationMessage::bot("c"),
    ];
    let text = engine
        .generate_text(GenerationRequest::new("a1", "next").with_history(history))
        .await
        .expect("generation");
    assert_eq!(text, "ok");
}

#[tokio::test]
async fn test_openai_sse_stream_delivers_deltas_in_order() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: not-json\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "a1", "openai", format!("{}/v1", server.uri()), "sk");
    let events = collect(&engine, GenerationRequest::new("a1", "Hello").streaming(true)).await;

    assert_eq!(deltas(&events), vec!["Hel", "lo"]);
    assert!(matches!(events.last(), Some(GenerationEvent::Done(text)) if text.is_empty()));
}

#[tokio::test]
async fn test_non_success_status_uses_provider_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "Rate limit reached", "type": "requests"}
        })))
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "a1", "openai", format!("{}/v1", server.uri()), "sk");
    let err = engine
        .generate_text(GenerationRequest::new("a1", "Hello"))
        .await
        .expect_err("should fail");
    match err {
        LlmError::Api { status, message } => {
            assert_eq!(status, 429);
            assert_eq!(message, "Rate limit reached");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_non_json_error_body_falls_back_to_status_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "a1", "ollama", format!("{}/v1", server.uri()), "");
    let err = engine
        .generate_text(GenerationRequest::new("a1", "Hello"))
        .await
        .expect_err("should fail");
    assert_eq!(err.to_string(), "HTTP 503: Service Unavailable");
}

#[tokio::test]
async fn test_generation_timeout_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"choices": [{"message": {"content": "late"}}]}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let engine = engine();
    add_alias_with_timeout(
        &engine,
        "a1",
        "openai",
        format!("{}/v1", server.uri()),
        "sk",
        Some(50),
    );
    let events = collect(&engine, GenerationRequest::new("a1", "Hello")).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], GenerationEvent::Failed(LlmError::Timeout)));
}

#[tokio::test]
async fn test_missing_key_fails_without_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "a1", "openai", format!("{}/v1", server.uri()), "");
    let events = collect(&engine, GenerationRequest::new("a1", "Hello")).await;
    assert!(matches!(
        events.as_slice(),
        [GenerationEvent::Failed(LlmError::MissingApiKey(_))]
    ));
}

// ────────────────────────────────────────────────────────────────────────────
// Generation: Anthropic
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_anthropic_stream_sends_version_header_and_parses_events() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"m1\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Bonjour\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" !\"}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(header("authorization", "Bearer sk-ant"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "claude", "anthropic", format!("{}/v1", server.uri()), "sk-ant");
    let events = collect(
        &engine,
        GenerationRequest::new("claude", "Salut")
            .with_model("claude-3-5-sonnet")
            .streaming(true),
    )
    .await;

    assert_eq!(deltas(&events), vec!["Bonjour", " !"]);
    assert!(matches!(events.last(), Some(GenerationEvent::Done(_))));
}

#[tokio::test]
async fn test_anthropic_in_stream_error_ends_generation() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Par\"}}\n\n",
        "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"tial\"}}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "claude", "anthropic", format!("{}/v1", server.uri()), "sk");
    let mut sink = RecordingSink::default();
    engine
        .generate_with(GenerationRequest::new("claude", "Hi").streaming(true), &mut sink)
        .await;

    assert_eq!(sink.deltas, vec!["Par".to_string()]);
    assert!(sink.completed.is_empty());
    assert_eq!(sink.errors, vec!["Unexpected response: Overloaded".to_string()]);
}

// ────────────────────────────────────────────────────────────────────────────
// Generation: Gemini
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_gemini_pseudo_stream_emits_each_object() {
    let server = MockServer::start().await;
    let body = r#"[{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello {"}]}}]}
,{"candidates":[{"content":{"role":"model","parts":[{"text":"} world"}]}}]}
]"#;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-pro:streamGenerateContent"))
        .and(header("x-goog-api-key", "g-key"))
        .and(body_partial_json(json!({
            "contents": [{"role": "user", "parts": [{"text": "Hi"}]}],
            "generationConfig": {"temperature": 0.7, "maxOutputTokens": 2048}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(
        &engine,
        "g",
        "gemini",
        format!("{}/v1beta/models", server.uri()),
        "g-key",
    );
    let events = collect(
        &engine,
        GenerationRequest::new("g", "Hi")
            .with_model("models/gemini-pro")
            .streaming(true),
    )
    .await;

    assert_eq!(deltas(&events), vec!["Hello {", "} world"]);
    assert!(matches!(events.last(), Some(GenerationEvent::Done(text)) if text.is_empty()));
}

#[tokio::test]
async fn test_gemini_stream_without_objects_falls_back_to_full_parse() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-pro:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("[]", "application/json"))
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "g", "gemini", format!("{}/v1beta/models", server.uri()), "k");
    let events = collect(
        &engine,
        GenerationRequest::new("g", "Hi")
            .with_model("gemini-pro")
            .streaming(true),
    )
    .await;

    assert!(matches!(
        events.as_slice(),
        [GenerationEvent::Failed(LlmError::EmptyResponse)]
    ));
}

#[tokio::test]
async fn test_gemini_complete_response_with_thinking_mode() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-pro:generateContent"))
        .and(body_partial_json(json!({"generationConfig": {"candidateCount": 1}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "candidates": [{"content": {"parts": [{"text": "Step 1..."}]}}]
        }])))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "g", "gemini", format!("{}/v1beta/models", server.uri()), "k");
    assert!(engine.store().write().set_thinking_mode("g", true));

    let text = engine
        .generate_text(GenerationRequest::new("g", "Why?").with_model("gemini-pro"))
        .await
        .expect("generation");
    assert_eq!(text, "Step 1...");
}

#[tokio::test]
async fn test_gemini_stream_without_text_fails_like_complete_path() {
    let server = MockServer::start().await;
    let refusal = json!([{"candidates": [{"finishReason": "SAFETY"}]}]);
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-pro:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(refusal.clone()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-pro:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(refusal))
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "g", "gemini", format!("{}/v1beta/models", server.uri()), "k");
    let request = GenerationRequest::new("g", "Hi").with_model("gemini-pro");

    let streamed = collect(&engine, request.clone().streaming(true)).await;
    assert!(matches!(
        streamed.as_slice(),
        [GenerationEvent::Failed(LlmError::EmptyResponse)]
    ));
    let complete = engine.generate_text(request).await;
    assert!(matches!(complete, Err(LlmError::EmptyResponse)));
}

// ────────────────────────────────────────────────────────────────────────────
// Availability probes and model refresh
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_probe_without_key_issues_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "a1", "openai", format!("{}/v1", server.uri()), "");
    let outcome = engine.check_availability("a1").await;

    assert!(!outcome.available);
    assert_eq!(outcome.availability, Availability::NoKey);
    assert_eq!(engine.store().read().availability("a1"), Availability::NoKey);
}

#[tokio::test]
async fn test_probe_classifies_status_codes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/models"))
        .and(header("authorization", "Bearer sk"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken/models"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "auth", "openai", format!("{}/auth", server.uri()), "sk");
    add_alias(&engine, "broken", "openai", format!("{}/broken", server.uri()), "sk");
    add_alias(&engine, "down", "openai", "http://127.0.0.1:1/v1".to_string(), "sk");

    let auth = engine.check_availability("auth").await;
    assert!(auth.available);
    assert_eq!(auth.availability, Availability::Available);
    assert_eq!(auth.message, "Available");

    let broken = engine.check_availability("broken").await;
    assert!(!broken.available);
    assert_eq!(broken.availability, Availability::Error);
    assert_eq!(broken.message, "HTTP 500");

    let down = engine.check_availability("down").await;
    assert!(!down.available);
    assert_eq!(down.availability, Availability::Timeout);
    assert_eq!(engine.store().read().availability("down"), Availability::Timeout);
}

#[tokio::test]
async fn test_probe_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let engine = engine();
    add_alias_with_timeout(
        &engine,
        "slow",
        "openai",
        format!("{}/v1", server.uri()),
        "sk",
        Some(100),
    );
    let outcome = engine.check_availability("slow").await;
    assert_eq!(outcome.availability, Availability::Timeout);
    assert_eq!(outcome.message, "Timeout");
}

#[tokio::test]
async fn test_dropped_probe_does_not_leave_alias_checking() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "a1", "openai", format!("{}/v1", server.uri()), "sk");

    let dropped =
        tokio::time::timeout(Duration::from_millis(50), engine.check_availability("a1")).await;
    assert!(dropped.is_err());
    assert_eq!(engine.store().read().availability("a1"), Availability::Unchecked);

    let outcome = engine.check_availability("a1").await;
    assert!(outcome.available);
    assert_eq!(engine.store().read().availability("a1"), Availability::Available);
    let received = server.received_requests().await.expect("recording enabled");
    assert_eq!(received.len(), 2);
}

#[tokio::test]
async fn test_probe_setup_failure_reports_error_text() {
    let engine = engine();
    add_alias(&engine, "bad", "openai", "not a url".to_string(), "sk");

    let outcome = engine.check_availability("bad").await;
    assert!(!outcome.available);
    assert_eq!(outcome.availability, Availability::Error);
    assert_ne!(outcome.message, "Network error");
    assert!(outcome.message.contains("builder error"), "{}", outcome.message);
    assert_eq!(engine.store().read().availability("bad"), Availability::Error);
}

#[tokio::test]
async fn test_check_all_waits_for_every_alias() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "ok", "openai", format!("{}/v1", server.uri()), "sk");
    add_alias(&engine, "nokey", "anthropic", format!("{}/v1", server.uri()), "");
    add_alias(&engine, "local", "ollama", format!("{}/v1", server.uri()), "");

    let results = engine.check_all().await;
    assert_eq!(results.len(), 3);
    assert!(results["ok"].available);
    assert!(results["local"].available);
    assert_eq!(results["nokey"].availability, Availability::NoKey);
}

#[tokio::test]
async fn test_refresh_models_replaces_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1beta/models"))
        .and(header("x-goog-api-key", "k"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                {"name": "models/gemini-1.5-pro"},
                "models/gemini-1.5-flash",
                {"displayName": "broken"}
            ]
        })))
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "g", "gemini", format!("{}/v1beta/models", server.uri()), "k");
    engine
        .store()
        .write()
        .set_models("g", vec!["stale".to_string()]);

    let models = engine.refresh_models("g").await.expect("refresh");
    assert_eq!(models, vec!["gemini-1.5-pro", "gemini-1.5-flash"]);
    assert_eq!(engine.store().read().models("g"), models);
}

#[tokio::test]
async fn test_refresh_with_empty_listing_keeps_previous_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;

    let engine = engine();
    add_alias(&engine, "a1", "openai", format!("{}/v1", server.uri()), "sk");
    engine
        .store()
        .write()
        .set_models("a1", vec!["gpt-4o".to_string()]);

    let models = engine.refresh_models("a1").await.expect("refresh");
    assert!(models.is_empty());
    assert_eq!(engine.store().read().models("a1"), vec!["gpt-4o".to_string()]);
}

#[tokio::test]
async fn test_successful_probe_refreshes_models_in_background() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "gpt-4o"}, {"id": "gpt-4o-mini"}]
        })))
        .mount(&server)
        .await;

    let engine = LlmEngine::new(EngineConfig::default()).expect("engine");
    add_alias(&engine, "a1", "openai", format!("{}/v1", server.uri()), "sk");
    assert!(engine.check_availability("a1").await.available);

    let mut models = Vec::new();
    for _ in 0..50 {
        models = engine.store().read().models("a1");
        if !models.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(models, vec!["gpt-4o", "gpt-4o-mini"]);
}
