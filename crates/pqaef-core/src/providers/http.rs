//! Network providers speaking the chat-completions wire format.
//!
//! - `openai`: any OpenAI-compatible endpoint (`{base_url}/chat/completions`), bearer auth,
//!   API key required.
//! - `http`: a bare URL with configurable headers and an optional auth header.
//!
//! Both send `{"model", "messages": [{"role": "user", "content": prompt}], ...params}`
//! and read `choices[0].message.content`. Every failure becomes a `transport` item error.

use super::{Backend, ProviderContext, Transport};
use crate::errors::{ItemError, PipelineError, PipelineResult};
use crate::model::{Completion, ItemResult, ParamMap};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const OPENAI_KIND: &str = "openai";
pub const HTTP_KIND: &str = "http";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_AUTH_HEADER: &str = "Authorization";
pub const DEFAULT_AUTH_SCHEME: &str = "Bearer";

pub struct HttpTransport {
    provider: String,
    url: String,
    model: Option<String>,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Header values may carry credentials.
        f.debug_struct("HttpTransport")
            .field("provider", &self.provider)
            .field("url", &self.url)
            .field("model", &self.model)
            .field(
                "headers",
                &self.headers.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl HttpTransport {
    /// OpenAI-compatible endpoint. Needs `model_identifier` and an API key
    /// (`api_key` or `api_key_env`).
    pub fn openai(ctx: &ProviderContext<'_>) -> PipelineResult<Self> {
        let d = ctx.descriptor;
        let model = d.config_str("model_identifier").ok_or_else(|| {
            PipelineError::config(format!("provider '{}': missing 'model_identifier'", ctx.name))
        })?;
        let key = api_key(ctx)?.ok_or_else(|| {
            PipelineError::config(format!(
                "provider '{}': API key not found (set 'api_key' or 'api_key_env')",
                ctx.name
            ))
        })?;
        let base = d
            .config_str("base_url")
            .unwrap_or(DEFAULT_OPENAI_BASE_URL)
            .trim_end_matches('/');

        Ok(Self {
            provider: ctx.name.to_string(),
            url: format!("{}/chat/completions", base),
            model: Some(model.to_string()),
            headers: vec![(
                DEFAULT_AUTH_HEADER.to_string(),
                format!("{} {}", DEFAULT_AUTH_SCHEME, key),
            )],
            client: reqwest::Client::new(),
        })
    }

    /// Generic endpoint at `url` (or `base_url`). Optional `headers` map, optional API key
    /// sent as `{auth_header_name}: {auth_scheme} {key}`.
    pub fn http(ctx: &ProviderContext<'_>) -> PipelineResult<Self> {
        let d = ctx.descriptor;
        let url = d
            .config_str("url")
            .or_else(|| d.config_str("base_url"))
            .ok_or_else(|| {
                PipelineError::config(format!("provider '{}': missing 'url'", ctx.name))
            })?;

        let mut headers = Vec::new();
        if let Some(extra) = d.config.get("headers") {
            let map = extra.as_object().ok_or_else(|| {
                PipelineError::config(format!("provider '{}': 'headers' must be a map", ctx.name))
            })?;
            for (k, v) in map {
                let v = v.as_str().ok_or_else(|| {
                    PipelineError::config(format!(
                        "provider '{}': header '{}' must be a string",
                        ctx.name, k
                    ))
                })?;
                headers.push((k.clone(), v.to_string()));
            }
        }
        if let Some(key) = api_key(ctx)? {
            let name = d.config_str("auth_header_name").unwrap_or(DEFAULT_AUTH_HEADER);
            let scheme = d.config_str("auth_scheme").unwrap_or(DEFAULT_AUTH_SCHEME);
            // The generated auth header replaces any hand-written one.
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            headers.push((name.to_string(), format!("{} {}", scheme, key).trim().to_string()));
        }

        Ok(Self {
            provider: ctx.name.to_string(),
            url: url.to_string(),
            model: d.config_str("model_identifier").map(str::to_string),
            headers,
            client: reqwest::Client::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body(&self, prompt: &str, params: &ParamMap) -> Value {
        let mut body = serde_json::Map::new();
        if let Some(model) = &self.model {
            body.insert("model".into(), json!(model));
        }
        body.insert(
            "messages".into(),
            json!([{ "role": "user", "content": prompt }]),
        );
        for (k, v) in params {
            body.insert(k.clone(), v.clone());
        }
        Value::Object(body)
    }
}

fn api_key(ctx: &ProviderContext<'_>) -> PipelineResult<Option<String>> {
    let d = ctx.descriptor;
    if let Some(k) = d.config_str("api_key").filter(|k| !k.is_empty()) {
        return Ok(Some(k.to_string()));
    }
    match d.config_str("api_key_env") {
        Some(var) => match std::env::var(var) {
            Ok(k) if !k.is_empty() => Ok(Some(k)),
            _ => Err(PipelineError::config(format!(
                "provider '{}': environment variable '{}' is not set",
                ctx.name, var
            ))),
        },
        None => Ok(None),
    }
}

fn status_code(status: reqwest::StatusCode) -> String {
    match status.as_u16() {
        429 => "rate_limited".to_string(),
        500..=599 => "server_error".to_string(),
        other => format!("http_{}", other),
    }
}

/// `error.message` from an OpenAI-style error body, else the raw text (shortened).
fn error_message(text: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(text).ok();
    if let Some(msg) = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/message"))
        .and_then(Value::as_str)
    {
        return msg.to_string();
    }
    text.chars().take(512).collect()
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, prompt: String, params: ParamMap) -> ItemResult {
        let body = self.body(&prompt, &params);
        let mut req = self.client.post(&self.url).json(&body);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req.send().await.map_err(|e| {
            let code = if e.is_timeout() {
                "timeout"
            } else if e.is_connect() {
                "connect"
            } else {
                "request"
            };
            warn!(provider = %self.provider, code, error = %e, "request failed");
            ItemError::transport(code, e.to_string())
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            debug!(provider = %self.provider, status = status.as_u16(), "non-success response");
            return Err(ItemError::transport(
                status_code(status),
                format!("status {}: {}", status.as_u16(), error_message(&text)),
            ));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| ItemError::transport("invalid_response", e.to_string()))?;
        let text = json
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ItemError::transport("invalid_response", "response missing choices[0].message.content")
            })?
            .to_string();

        Ok(Completion::new(&self.provider, text).with_raw(json))
    }
}

pub fn build_openai(ctx: &ProviderContext<'_>) -> PipelineResult<Backend> {
    Ok(Backend::Network(Arc::new(HttpTransport::openai(ctx)?)))
}

pub fn build_http(ctx: &ProviderContext<'_>) -> PipelineResult<Backend> {
    Ok(Backend::Network(Arc::new(HttpTransport::http(ctx)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderDescriptor;

    fn ctx<'a>(name: &'a str, d: &'a ProviderDescriptor) -> ProviderContext<'a> {
        ProviderContext {
            name,
            descriptor: d,
            devices: &[],
        }
    }

    #[test]
    fn openai_requires_a_key() {
        let d = ProviderDescriptor::new(OPENAI_KIND).with_config("model_identifier", json!("m"));
        let err = HttpTransport::openai(&ctx("judge", &d)).unwrap_err();
        assert!(err.to_string().contains("API key not found"));
    }

    #[test]
    fn openai_builds_chat_completions_url() {
        let d = ProviderDescriptor::new(OPENAI_KIND)
            .with_config("model_identifier", json!("gpt-4o-mini"))
            .with_config("api_key", json!("sk-test"))
            .with_config("base_url", json!("http://localhost:9000/v1/"));
        let t = HttpTransport::openai(&ctx("judge", &d)).unwrap();
        assert_eq!(t.url(), "http://localhost:9000/v1/chat/completions");
        assert!(!format!("{:?}", t).contains("sk-test"));
    }

    #[test]
    fn body_merges_params_over_messages() {
        let d = ProviderDescriptor::new(HTTP_KIND)
            .with_config("url", json!("http://x/gen"))
            .with_config("model_identifier", json!("m1"));
        let t = HttpTransport::http(&ctx("gen", &d)).unwrap();
        let mut params = ParamMap::new();
        params.insert("temperature".into(), json!(0.3));
        let body = t.body("hi", &params);
        assert_eq!(
            body,
            json!({
                "model": "m1",
                "messages": [{"role": "user", "content": "hi"}],
                "temperature": 0.3
            })
        );
    }

    #[test]
    fn http_auth_header_replaces_manual_one() {
        let d = ProviderDescriptor::new(HTTP_KIND)
            .with_config("url", json!("http://x"))
            .with_config("headers", json!({"authorization": "old", "X-Team": "eval"}))
            .with_config("api_key", json!("k"))
            .with_config("auth_header_name", json!("Authorization"))
            .with_config("auth_scheme", json!(""));
        let t = HttpTransport::http(&ctx("gen", &d)).unwrap();
        assert!(t.headers.contains(&("Authorization".to_string(), "k".to_string())));
        assert!(t.headers.contains(&("X-Team".to_string(), "eval".to_string())));
        assert_eq!(t.headers.len(), 2);
    }

    #[test]
    fn error_body_message_is_extracted() {
        let msg = error_message(r#"{"error": {"message": "quota exceeded", "type": "x"}}"#);
        assert_eq!(msg, "quota exceeded");
        assert_eq!(error_message("plain"), "plain");
        assert_eq!(status_code(reqwest::StatusCode::TOO_MANY_REQUESTS), "rate_limited");
        assert_eq!(status_code(reqwest::StatusCode::BAD_GATEWAY), "server_error");
        assert_eq!(status_code(reqwest::StatusCode::NOT_FOUND), "http_404");
    }
}
