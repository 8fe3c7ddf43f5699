//! OpenAI-compatible chat-completions extractor.
//!
//! Works against any endpoint speaking the `/v1/chat/completions` shape.
//! The request pins temperature to zero and asks for a JSON-object
//! response; the reply must be a JSON object keyed by the requested
//! fields, with `null` for fields absent from the document.

use crate::errors::ExtractError;
use crate::providers::ai::{AiConstraints, AiExtractor, FieldMap};
use crate::types::{ParsedDocument, Schema};
use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use tracing::debug;

// --- OpenAI-compatible request and response structures ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    temperature: f32,
    response_format: ResponseFormat,
    stream: bool,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChatMessage,
}

// --- Provider implementation ---

/// A provider for OpenAI-compatible chat-completion APIs.
#[derive(Clone, Debug)]
pub struct OpenAiExtractor {
    client: ReqwestClient,
    api_url: String,
    api_key: Option<String>,
    model: Option<String>,
}

impl OpenAiExtractor {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: Option<String>,
    ) -> Result<Self, ExtractError> {
        let client = ReqwestClient::builder()
            .build()
            .map_err(ExtractError::ReqwestClientBuild)?;
        Ok(Self {
            client,
            api_url,
            api_key,
            model,
        })
    }

    fn build_prompt(schema: &Schema, constraints: &AiConstraints) -> String {
        let fields_list = schema
            .iter()
            .map(|f| format!("\"{}\": {}", f.name, f.description))
            .collect::<Vec<_>>()
            .join("\n");
        let json_template = schema
            .field_names()
            .iter()
            .map(|name| format!("\"{name}\": \"...\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Extraia em JSON os campos do documento \"{label}\" (idioma: {language}):\n\n\
             {fields_list}\n\n\
             Use null quando o campo não estiver presente. Retorne apenas JSON:\n\
             {{{json_template}}}",
            label = constraints.label,
            language = constraints.language_hint,
        )
    }

    /// Pulls the JSON object out of the reply, tolerating a markdown
    /// fence around it.
    fn parse_reply(content: &str, schema: &Schema) -> Result<FieldMap, ExtractError> {
        let trimmed = content.trim();
        let body = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .and_then(|s| s.strip_suffix("```"))
            .unwrap_or(trimmed)
            .trim();

        let object: serde_json::Map<String, Value> = serde_json::from_str(body)
            .map_err(|e| ExtractError::AiResponse(format!("reply is not a JSON object: {e}")))?;

        let mut out = FieldMap::new();
        for field in schema.iter() {
            let value = match object.get(&field.name) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => {
                    let s = s.trim();
                    (!s.is_empty() && s != "null").then(|| s.to_string())
                }
                Some(other) => Some(other.to_string()),
            };
            out.insert(field.name.clone(), value);
        }
        Ok(out)
    }
}

#[async_trait]
impl AiExtractor for OpenAiExtractor {
    async fn extract_fields(
        &self,
        document: &ParsedDocument,
        schema: &Schema,
        constraints: &AiConstraints,
    ) -> Result<FieldMap, ExtractError> {
        let prompt = Self::build_prompt(schema, constraints);
        let user_content = format!("{prompt}\n\nDOCUMENTO:\n{}", document.annotated_text());

        let request_body = ChatRequest {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: user_content,
            }],
            model: self.model.as_deref(),
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
            stream: false,
        };

        debug!(label = %constraints.label, fields = schema.len(), "--> Sending extraction request");

        let mut request_builder = self.client.post(&self.api_url);
        if let Some(key) = &self.api_key {
            request_builder = request_builder.bearer_auth(key);
        }

        let response = request_builder
            .json(&request_body)
            .send()
            .await
            .map_err(ExtractError::AiRequest)?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ExtractError::AiApi(error_text));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::AiResponse(e.to_string()))?;

        let content = chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        debug!("<-- Raw extraction reply: {content}");

        Self::parse_reply(&content, schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::from_pairs([("nome", "Nome completo"), ("cpf", "CPF do titular")]).unwrap()
    }

    fn constraints() -> AiConstraints {
        AiConstraints {
            label: "oab".to_string(),
            language_hint: "português brasileiro (pt-BR)".to_string(),
        }
    }

    #[test]
    fn prompt_lists_fields_and_template() {
        let prompt = OpenAiExtractor::build_prompt(&schema(), &constraints());
        assert!(prompt.contains("\"nome\": Nome completo"));
        assert!(prompt.contains("\"cpf\": \"...\""));
        assert!(prompt.contains("oab"));
    }

    #[test]
    fn reply_parsing_keeps_schema_keys_and_nulls() {
        let map = OpenAiExtractor::parse_reply(
            r#"{"nome": "João Silva", "cpf": null, "extra": "ignored"}"#,
            &schema(),
        )
        .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["nome"], Some("João Silva".to_string()));
        assert_eq!(map["cpf"], None);
    }

    #[test]
    fn reply_parsing_strips_markdown_fences() {
        let map = OpenAiExtractor::parse_reply(
            "```json\n{\"nome\": \"João\", \"cpf\": \"123.456.789-00\"}\n```",
            &schema(),
        )
        .unwrap();
        assert_eq!(map["cpf"], Some("123.456.789-00".to_string()));
    }

    #[test]
    fn malformed_reply_is_an_ai_response_error() {
        let err = OpenAiExtractor::parse_reply("not json at all", &schema()).unwrap_err();
        assert!(matches!(err, ExtractError::AiResponse(_)));
    }
}
