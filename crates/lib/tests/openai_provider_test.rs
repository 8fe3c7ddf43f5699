//! Contract tests for the OpenAI-compatible extractor against a mock
//! HTTP endpoint.

mod common;

use common::{init_tracing, oab_doc};
use extrato::{AiConstraints, AiExtractor, ExtractError, OpenAiExtractor, Schema};
use httpmock::{Method::POST, MockServer};
use serde_json::json;

fn schema() -> Schema {
    Schema::from_pairs([("nome", "Nome completo"), ("cpf", "CPF do titular")]).unwrap()
}

fn constraints() -> AiConstraints {
    AiConstraints {
        label: "oab".to_string(),
        language_hint: "português brasileiro (pt-BR)".to_string(),
    }
}

#[tokio::test]
async fn extracts_fields_from_a_json_object_reply() {
    init_tracing();
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_contains("Nome completo")
            .body_contains("DOCUMENTO:");
        then.status(200).json_body(json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": "{\"nome\": \"João Silva\", \"cpf\": \"123.456.789-00\"}"
            }}]
        }));
    });

    let extractor = OpenAiExtractor::new(
        server.url("/v1/chat/completions"),
        None,
        Some("test-model".to_string()),
    )
    .unwrap();

    let map = extractor
        .extract_fields(&oab_doc("João Silva", "123456"), &schema(), &constraints())
        .await
        .unwrap();

    mock.assert();
    assert_eq!(map["nome"], Some("João Silva".to_string()));
    assert_eq!(map["cpf"], Some("123.456.789-00".to_string()));
}

#[tokio::test]
async fn null_fields_come_back_as_none() {
    init_tracing();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": "{\"nome\": \"João Silva\", \"cpf\": null}"
            }}]
        }));
    });

    let extractor =
        OpenAiExtractor::new(server.url("/v1/chat/completions"), None, None).unwrap();
    let map = extractor
        .extract_fields(&oab_doc("João Silva", "123456"), &schema(), &constraints())
        .await
        .unwrap();
    assert_eq!(map["nome"], Some("João Silva".to_string()));
    assert_eq!(map["cpf"], None);
}

#[tokio::test]
async fn provider_error_status_maps_to_ai_api() {
    init_tracing();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(500).body("upstream exploded");
    });

    let extractor =
        OpenAiExtractor::new(server.url("/v1/chat/completions"), None, None).unwrap();
    let err = extractor
        .extract_fields(&oab_doc("João Silva", "123456"), &schema(), &constraints())
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::AiApi(_)));
}

#[tokio::test]
async fn non_json_reply_is_a_retryable_decode_error() {
    init_tracing();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": "desculpe, não consegui extrair os campos"
            }}]
        }));
    });

    let extractor =
        OpenAiExtractor::new(server.url("/v1/chat/completions"), None, None).unwrap();
    let err = extractor
        .extract_fields(&oab_doc("João Silva", "123456"), &schema(), &constraints())
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::AiResponse(_)));
}

#[tokio::test]
async fn bearer_auth_is_sent_when_a_key_is_configured() {
    init_tracing();
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer secret-key");
        then.status(200).json_body(json!({
            "choices": [{"message": {"role": "assistant", "content": "{}"}}]
        }));
    });

    let extractor = OpenAiExtractor::new(
        server.url("/v1/chat/completions"),
        Some("secret-key".to_string()),
        None,
    )
    .unwrap();
    let map = extractor
        .extract_fields(&oab_doc("João Silva", "123456"), &schema(), &constraints())
        .await
        .unwrap();
    mock.assert();
    assert_eq!(map["nome"], None);
}
