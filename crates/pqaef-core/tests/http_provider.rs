//! Integration tests for the `openai` and `http` provider kinds.
//!
//! Uses wiremock for HTTP mocking. Covers request body shape, auth headers,
//! status-to-code mapping, timeouts and grouping by per-item overrides.

use std::time::Duration;

use pqaef_core::model::payload;
use pqaef_core::{
    ItemErrorKind, ParamMap, ProviderDescriptor, ProviderEnv, ProviderHandle, ProviderRegistry,
};
use serde_json::{json, Value};
use serial_test::serial;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion(text: &str) -> Value {
    json!({
        "id": "cmpl-1",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": text}}]
    })
}

fn openai(server: &MockServer) -> ProviderDescriptor {
    ProviderDescriptor::new("openai")
        .with_config("model_identifier", json!("gpt-test"))
        .with_config("api_key", json!("sk-test"))
        .with_config("base_url", json!(format!("{}/v1", server.uri())))
}

fn init(name: &str, desc: &ProviderDescriptor) -> ProviderHandle {
    ProviderHandle::initialize(
        name,
        desc,
        &ProviderRegistry::with_builtins(),
        &ProviderEnv::default(),
    )
    .expect("provider init failed")
}

fn prompts(items: &[&str]) -> Vec<ParamMap> {
    items.iter().map(|p| payload(*p, &ParamMap::new())).collect()
}

#[tokio::test]
async fn test_openai_sends_chat_body_with_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("pong")))
        .expect(1)
        .mount(&server)
        .await;

    let desc = openai(&server).with_generation("temperature", json!(0.25));
    let handle = init("judge", &desc);
    let results = handle.invoke(prompts(&["ping"])).await.unwrap();

    let done = results[0].as_ref().expect("call should succeed");
    assert_eq!(done.text, "pong");
    assert_eq!(done.provider, "judge");

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(
        body,
        json!({
            "model": "gpt-test",
            "messages": [{"role": "user", "content": "ping"}],
            "temperature": 0.25
        })
    );
    handle.release().unwrap();
}

#[tokio::test]
async fn test_status_codes_become_tagged_item_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rate"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({"error": {"message": "slow down", "type": "rate_limit"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream gone"))
        .mount(&server)
        .await;

    let rate = init(
        "rate",
        &ProviderDescriptor::new("http").with_config("url", json!(format!("{}/rate", server.uri()))),
    );
    let down = init(
        "down",
        &ProviderDescriptor::new("http").with_config("url", json!(format!("{}/down", server.uri()))),
    );

    let err = rate.invoke(prompts(&["x"])).await.unwrap()[0].clone().unwrap_err();
    assert_eq!(err.kind, ItemErrorKind::Transport);
    assert_eq!(err.code, "rate_limited");
    assert!(err.message.contains("slow down"));

    let err = down.invoke(prompts(&["x"])).await.unwrap()[0].clone().unwrap_err();
    assert_eq!(err.code, "server_error");
    assert!(err.message.contains("upstream gone"));
    assert_eq!(down.stats().failures, 1);
}

#[tokio::test]
async fn test_missing_content_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let handle = init(
        "gen",
        &ProviderDescriptor::new("http").with_config("url", json!(server.uri())),
    );
    let err = handle.invoke(prompts(&["x"])).await.unwrap()[0]
        .clone()
        .unwrap_err();
    assert_eq!(err.code, "invalid_response");
}

#[tokio::test]
async fn test_slow_call_times_out_at_its_position() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("late"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let mut desc = ProviderDescriptor::new("http").with_config("url", json!(server.uri()));
    desc.timeout_secs = Some(1);
    let handle = init("slow", &desc);

    let results = handle.invoke(prompts(&["a"])).await.unwrap();
    let err = results[0].clone().unwrap_err();
    assert_eq!(err.kind, ItemErrorKind::Transport);
    assert_eq!(err.code, "timeout");
}

#[tokio::test]
async fn test_overrides_split_requests_but_keep_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(|req: &wiremock::Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
            let tokens = body["max_tokens"].as_i64().unwrap_or_default();
            ResponseTemplate::new(200).set_body_json(completion(&format!("{}@{}", prompt, tokens)))
        })
        .mount(&server)
        .await;

    let desc = ProviderDescriptor::new("http")
        .with_config("url", json!(server.uri()))
        .with_generation("max_tokens", json!(16));
    let handle = init("gen", &desc);

    let long = json!({"max_tokens": 256}).as_object().cloned().unwrap();
    let payloads = vec![
        payload("a", &ParamMap::new()),
        payload("b", &long),
        payload("c", &ParamMap::new()),
    ];
    let texts: Vec<String> = handle
        .invoke(payloads)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.unwrap().text)
        .collect();
    assert_eq!(texts, vec!["a@16", "b@256", "c@16"]);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
#[serial]
async fn test_api_key_from_environment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-api-key", "Token env-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
        .expect(1)
        .mount(&server)
        .await;

    std::env::set_var("PQAEF_TEST_API_KEY", "env-secret");
    let desc = ProviderDescriptor::new("http")
        .with_config("url", json!(server.uri()))
        .with_config("api_key_env", json!("PQAEF_TEST_API_KEY"))
        .with_config("auth_header_name", json!("X-Api-Key"))
        .with_config("auth_scheme", json!("Token"));
    let handle = init("gen", &desc);
    std::env::remove_var("PQAEF_TEST_API_KEY");

    let results = handle.invoke(prompts(&["hi"])).await.unwrap();
    assert_eq!(results[0].as_ref().unwrap().text, "ok");
}

#[test]
#[serial]
fn test_unset_api_key_env_is_a_configuration_error() {
    std::env::remove_var("PQAEF_TEST_MISSING_KEY");
    let desc = ProviderDescriptor::new("openai")
        .with_config("model_identifier", json!("m"))
        .with_config("api_key_env", json!("PQAEF_TEST_MISSING_KEY"));
    let err = ProviderHandle::initialize(
        "judge",
        &desc,
        &ProviderRegistry::with_builtins(),
        &ProviderEnv::default(),
    )
    .unwrap_err();
    assert_eq!(err.category(), pqaef_core::ErrorCategory::Configuration);
    assert!(err.to_string().contains("PQAEF_TEST_MISSING_KEY"));
}
