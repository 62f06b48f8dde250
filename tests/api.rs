mod common;

use axum::http::{Method, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use lodestar_core::config::RagConfig;
use lodestar_core::integrations::VectorStore as _;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

use common::test_app;

fn chat(model: &str, content: &str, max_tokens: usize) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": content}],
        "max_tokens": max_tokens,
        "temperature": 0
    })
}

#[tokio::test]
async fn test_load_list_and_chat() {
    let app = test_app(|b| b);

    let load = app.load("tiny-test").await;
    assert_eq!(load.status, StatusCode::OK, "{}", load.text);
    assert_eq!(load.json()["status"], "success");

    let models = app.get("/v1/models").await.json();
    assert_eq!(models["object"], "list");
    let ids: Vec<&str> = models["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert!(ids.contains(&"tiny-test"), "{ids:?}");

    let response = app
        .post("/v1/chat/completions", chat("tiny-test", "Hello", 10))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);
    let body = response.json();
    assert_eq!(body["object"], "chat.completion");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert!(!body["choices"][0]["message"]["content"].as_str().unwrap().is_empty());
    assert_eq!(body["choices"][0]["finish_reason"], "length");
    assert!(body["usage"]["completion_tokens"].as_u64().unwrap() <= 10);
    assert_eq!(
        body["usage"]["total_tokens"].as_u64().unwrap(),
        body["usage"]["prompt_tokens"].as_u64().unwrap()
            + body["usage"]["completion_tokens"].as_u64().unwrap()
    );
}

#[tokio::test]
async fn test_second_load_reports_already_loaded() {
    let app = test_app(|b| b);
    assert_eq!(app.load("tiny-test").await.json()["status"], "success");

    let again = app.load("tiny-test").await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.json()["status"], "already_loaded");
    assert_eq!(app.loader.native_loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_load_validation_and_unknown_model() {
    let app = test_app(|b| b);

    let missing = app.post("/api/models/load", json!({})).await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert_eq!(missing.json()["error"]["code"], "missing_field");

    let unknown = app.load("nowhere").await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    assert_eq!(unknown.json()["error"]["code"], "model_not_found");
}

#[tokio::test]
async fn test_unload_unknown_model_is_404() {
    let app = test_app(|b| b);
    let response = app
        .post("/api/models/unload", json!({"model_id": "ghost"}))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    let message = response.json()["error"]["message"].as_str().unwrap().to_owned();
    assert!(message.contains("not currently loaded"), "{message}");
    assert!(app.engine.registry().is_empty());
}

#[tokio::test]
async fn test_unload_then_list() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;

    let response = app
        .post("/api/models/unload", json!({"model_id": "tiny-test"}))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(!app.engine.registry().contains("tiny-test"));

    // Still discoverable on disk, just no longer loaded
    let list = app.get("/api/models/list").await.json();
    let tiny = list["models"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["id"] == "tiny-test")
        .cloned()
        .unwrap();
    assert_eq!(tiny["loaded"], false);
}

#[tokio::test]
async fn test_sync_warmup() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;

    let response = app
        .post(
            "/api/models/warmup/tiny-test",
            json!({"num_prompts": 2, "async": false}),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);
    let body = response.json();
    assert_eq!(body["status"], "warmed");
    assert_eq!(body["is_warmed"], true);
    assert_eq!(body["warmup_prompts_used"], 2);
    assert!(body["warmup_time_ms"].as_f64().unwrap() > 0.0);

    let statuses = app.get("/api/models/warmup/status").await.json();
    assert_eq!(statuses["tiny-test"]["is_warmed"], true);
}

#[tokio::test]
async fn test_warmup_requires_loaded_model() {
    let app = test_app(|b| b);
    let response = app
        .post("/api/models/warmup/tiny-test", json!({"num_prompts": 1}))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_async_warmup_completes_in_background() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;

    let response = app
        .post("/api/models/warmup/tiny-test", json!({"async": true}))
        .await;
    assert_eq!(response.json()["status"], "warming");

    app.engine.warmup().wait("tiny-test").await;
    assert!(app.engine.warmup().is_warm("tiny-test"));
}

#[tokio::test]
async fn test_streaming_chat() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;

    let mut request = chat("tiny-test", "Write a haiku", 30);
    request["stream"] = json!(true);
    let response = app.post("/v1/chat/completions", request).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response
        .content_type
        .as_deref()
        .unwrap()
        .starts_with("text/event-stream"));

    let payloads = response.sse_payloads();
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));

    let frames: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    assert_eq!(frames[0]["choices"][0]["delta"], json!({"role": "assistant"}));
    assert_eq!(frames.last().unwrap()["choices"][0]["finish_reason"], "length");

    let content: String = frames
        .iter()
        .filter_map(|f| f["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert!(!content.is_empty());
}

#[tokio::test]
async fn test_streaming_matches_buffered() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;

    let buffered = app
        .post("/v1/chat/completions", chat("tiny-test", "Tell me a story", 12))
        .await
        .json();
    let expected = buffered["choices"][0]["message"]["content"]
        .as_str()
        .unwrap()
        .to_owned();

    let mut request = chat("tiny-test", "Tell me a story", 12);
    request["stream"] = json!(true);
    let streamed: String = app
        .post("/v1/chat/completions", request)
        .await
        .sse_payloads()
        .iter()
        .filter(|p| p.as_str() != "[DONE]")
        .filter_map(|p| serde_json::from_str::<Value>(p).ok())
        .filter_map(|f| f["choices"][0]["delta"]["content"].as_str().map(str::to_owned))
        .collect();

    assert_eq!(streamed, expected);
}

#[tokio::test]
async fn test_deterministic_at_zero_temperature() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;

    let first = app
        .post("/v1/chat/completions", chat("tiny-test", "Same question", 8))
        .await
        .json();
    let second = app
        .post("/v1/chat/completions", chat("tiny-test", "Same question", 8))
        .await
        .json();
    assert_eq!(
        first["choices"][0]["message"]["content"],
        second["choices"][0]["message"]["content"]
    );
}

#[tokio::test]
async fn test_text_completion_with_stop_sequence() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;

    let plain = app
        .post(
            "/v1/completions",
            json!({"model": "tiny-test", "prompt": "one two", "max_tokens": 6, "temperature": 0}),
        )
        .await
        .json();
    assert_eq!(plain["object"], "text_completion");
    let text = plain["choices"][0]["text"].as_str().unwrap().to_owned();
    let third_word = text.split_whitespace().nth(2).unwrap().to_owned();

    let stopped = app
        .post(
            "/v1/completions",
            json!({
                "model": "tiny-test",
                "prompt": "one two",
                "max_tokens": 6,
                "temperature": 0,
                "stop": third_word
            }),
        )
        .await
        .json();
    let truncated = stopped["choices"][0]["text"].as_str().unwrap();
    assert!(!truncated.contains(&third_word), "{truncated}");
    assert!(text.starts_with(truncated));
    assert_eq!(stopped["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_server_token_limit_caps_max_tokens() {
    let app = test_app(|b| b.max_tokens_limit(5));
    app.load("tiny-test").await;

    let body = app
        .post("/v1/chat/completions", chat("tiny-test", "Hello", 500))
        .await
        .json();
    assert!(body["usage"]["completion_tokens"].as_u64().unwrap() <= 5);
}

#[tokio::test]
async fn test_context_overflow_is_rejected() {
    let app = test_app(|b| b);
    let long_prompt = vec!["word"; 40].join(" ");

    let response = app
        .post("/v1/chat/completions", chat("small-ctx", &long_prompt, 4))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"]["code"], "context_length_exceeded");
    // Auto-loaded for the request, but nothing was generated
    assert!(app.engine.registry().contains("small-ctx"));
    assert_eq!(app.engine.kv_cache().len(), 0);
}

#[tokio::test]
async fn test_unknown_model_without_auto_load() {
    let app = test_app(|b| b.auto_load_on_request(false));
    let response = app
        .post("/v1/chat/completions", chat("tiny-test", "Hello", 4))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.json()["error"]["code"], "model_not_found");
    assert!(app.engine.registry().is_empty());
}

#[tokio::test]
async fn test_invalid_requests() {
    let app = test_app(|b| b);

    let no_messages = app
        .post("/v1/chat/completions", json!({"model": "tiny-test", "messages": []}))
        .await;
    assert_eq!(no_messages.status, StatusCode::BAD_REQUEST);
    assert_eq!(no_messages.json()["error"]["type"], "invalid_request_error");

    let no_prompt = app
        .post("/v1/completions", json!({"model": "tiny-test"}))
        .await;
    assert_eq!(no_prompt.status, StatusCode::BAD_REQUEST);

    let malformed = app
        .request(Method::POST, "/v1/chat/completions", Some(json!([1, 2])), None)
        .await;
    assert!(malformed.status.is_client_error());
    assert!(malformed.json()["error"]["message"].is_string());
}

#[tokio::test]
async fn test_auth_rejects_without_side_effects() {
    let app = test_app(|b| b.api_key("secret").warm_on_first_use(true));

    let wrong = app
        .request(
            Method::POST,
            "/v1/chat/completions",
            Some(chat("tiny-test", "Hello", 4)),
            Some("wrong-key"),
        )
        .await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    let body = wrong.json();
    assert!(body.get("choices").is_none());
    assert_eq!(body["error"]["code"], "invalid_api_key");

    let missing = app
        .request(Method::POST, "/api/models/load", Some(json!({"model_id": "tiny-test"})), None)
        .await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);
    assert_eq!(missing.json()["error"]["code"], "missing_api_key");

    assert!(app.engine.registry().is_empty());
    assert!(app.engine.warmup().all_statuses().is_empty());
    assert_eq!(app.loader.native_loads.load(Ordering::SeqCst), 0);

    let ok = app
        .request(
            Method::POST,
            "/v1/chat/completions",
            Some(chat("tiny-test", "Hello", 4)),
            Some("secret"),
        )
        .await;
    assert_eq!(ok.status, StatusCode::OK, "{}", ok.text);
}

#[tokio::test]
async fn test_health_is_public() {
    let app = test_app(|b| b.api_key("secret"));
    let health = app.get("/health").await;
    assert_eq!(health.status, StatusCode::OK);
    let body = health.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "lodestar");
    assert!(body["metrics"]["total_requests"].is_number());
}

#[tokio::test]
async fn test_conversation_cache_lifecycle() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;

    let mut request = chat("tiny-test", "Remember this", 4);
    request["conversation_id"] = json!("c1");
    let first = app.post("/v1/chat/completions", request.clone()).await.json();
    assert_eq!(first["usage"]["prompt_tokens_details"]["cached_tokens"], 0);

    let status = app.get("/api/models/cache/status").await.json();
    assert_eq!(status["num_caches"], 1);
    assert_eq!(status["caches"][0]["conversation_id"], "c1");

    let second = app.post("/v1/chat/completions", request).await.json();
    assert!(second["usage"]["prompt_tokens_details"]["cached_tokens"].as_u64().unwrap() > 0);

    let missing = app
        .post(
            "/api/models/cache/clear",
            json!({"model_id": "tiny-test", "conversation_id": "nope"}),
        )
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.json()["error"]["code"], "cache_not_found");

    let cleared = app
        .post(
            "/api/models/cache/clear",
            json!({"model_id": "tiny-test", "conversation_id": "c1"}),
        )
        .await
        .json();
    assert_eq!(cleared["cleared"], 1);
    assert_eq!(app.engine.kv_cache().len(), 0);
}

#[tokio::test]
async fn test_edited_conversation_reports_no_cached_tokens() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;

    let turn = |prompt: &str| {
        json!({
            "model": "tiny-test",
            "prompt": prompt,
            "max_tokens": 3,
            "temperature": 0,
            "conversation_id": "c1"
        })
    };
    let cached = |body: Value| body["usage"]["prompt_tokens_details"]["cached_tokens"].clone();

    let first = app.post("/v1/completions", turn("Remember this")).await.json();
    assert_eq!(cached(first), 0);

    let repeated = app.post("/v1/completions", turn("Remember this")).await.json();
    assert_eq!(cached(repeated), 2);

    let edited = app.post("/v1/completions", turn("Forgotten this")).await.json();
    assert_eq!(cached(edited), 0);
    assert_eq!(app.engine.kv_cache().len(), 1);
}

#[tokio::test]
async fn test_rag_prepends_retrieved_context() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;
    let store = app.state.vector_store.clone().expect("retrieval enabled by default");
    store.ingest("The lighthouse keeper is named Ada.").await.unwrap();
    store.ingest("Sourdough needs a starter.").await.unwrap();

    let plain = chat("tiny-test", "Who keeps the lighthouse?", 2);
    let mut augmented = plain.clone();
    augmented["use_rag"] = json!(true);
    augmented["rag_top_k"] = json!(1);

    let plain = app.post("/v1/chat/completions", plain).await.json();
    // "User: Who keeps the lighthouse?\nAssistant:"
    assert_eq!(plain["usage"]["prompt_tokens"], 6);

    let augmented = app.post("/v1/chat/completions", augmented).await;
    assert_eq!(augmented.status, StatusCode::OK);
    // a leading "System: Use the following context to answer.\n[1] The
    // lighthouse keeper is named Ada." turn adds 14 words
    assert_eq!(augmented.json()["usage"]["prompt_tokens"], 20);
}

#[tokio::test]
async fn test_rag_disabled_leaves_prompt_alone() {
    let app = test_app(|b| {
        b.rag(RagConfig {
            enabled: false,
            ..Default::default()
        })
    });
    assert!(app.state.vector_store.is_none());
    app.load("tiny-test").await;

    let mut request = chat("tiny-test", "Who keeps the lighthouse?", 2);
    request["use_rag"] = json!(true);
    let response = app.post("/v1/chat/completions", request).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json()["usage"]["prompt_tokens"], 6);
}

#[tokio::test]
async fn test_cache_clear_accepts_query_parameters() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;
    for conversation in ["c1", "c2"] {
        let mut request = chat("tiny-test", "Hi", 2);
        request["conversation_id"] = json!(conversation);
        app.post("/v1/chat/completions", request).await;
    }

    let one = app
        .get("/api/models/cache/clear?model_id=tiny-test&conversation_id=c1")
        .await;
    assert_eq!(one.status, StatusCode::OK);
    assert_eq!(one.json()["cleared"], 1);
    assert!(app.engine.kv_cache().has("tiny-test", "c2"));

    let missing = app
        .get("/api/models/cache/clear?model_id=tiny-test&conversation_id=c1")
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let orphan = app.get("/api/models/cache/clear?conversation_id=c2").await;
    assert_eq!(orphan.status, StatusCode::BAD_REQUEST);

    let all = app.get("/api/models/cache/clear").await.json();
    assert_eq!(all["cleared"], 1);
    assert!(app.engine.kv_cache().is_empty());
}

#[tokio::test]
async fn test_cache_settings_update_evicts() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;

    for conversation in ["c1", "c2", "c3"] {
        let mut request = chat("tiny-test", "Hi", 2);
        request["conversation_id"] = json!(conversation);
        app.post("/v1/chat/completions", request).await;
    }
    assert_eq!(app.engine.kv_cache().len(), 3);

    let updated = app
        .post("/api/models/cache/settings", json!({"max_conversations": 2}))
        .await;
    assert_eq!(updated.status, StatusCode::OK);
    assert_eq!(updated.json()["max_conversations"], 2);
    assert_eq!(app.engine.kv_cache().len(), 2);
    assert!(!app.engine.kv_cache().has("tiny-test", "c1"));

    let rejected = app
        .post("/api/models/cache/settings", json!({"max_memory_mb": 0}))
        .await;
    assert_eq!(rejected.status, StatusCode::BAD_REQUEST);

    let settings = app.get("/api/models/cache/settings").await.json();
    assert_eq!(settings["max_conversations"], 2);
}

#[tokio::test]
async fn test_embeddings() {
    let app = test_app(|b| b);
    app.load("tiny-test").await;

    let floats = app
        .post(
            "/v1/embeddings",
            json!({"model": "tiny-test", "input": ["alpha", "beta"], "dimensions": 4}),
        )
        .await;
    assert_eq!(floats.status, StatusCode::OK, "{}", floats.text);
    let body = floats.json();
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"][1]["index"], 1);
    assert_eq!(body["data"][0]["embedding"].as_array().unwrap().len(), 4);
    assert_eq!(body["usage"]["prompt_tokens"], 2);

    let encoded = app
        .post(
            "/v1/embeddings",
            json!({"model": "tiny-test", "input": "alpha", "encoding_format": "base64"}),
        )
        .await
        .json();
    let bytes = STANDARD
        .decode(encoded["data"][0]["embedding"].as_str().unwrap())
        .unwrap();
    assert_eq!(bytes.len(), 8 * 4);
}
