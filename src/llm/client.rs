// src/llm/client.rs

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Provider, TestGenConfig};
use crate::error::GatewayError;
use crate::llm::backend::ModelGateway;
use crate::llm::prompt::LlmPrompt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

/// Blocking HTTP gateway for the hosted model APIs.
pub struct HttpGateway {
    cfg: ProviderConfig,
    http: reqwest::blocking::Client,
}

impl HttpGateway {
    pub fn new(cfg: ProviderConfig, timeout: Duration) -> Result<Self, GatewayError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Fatal(e.to_string()))?;

        Ok(Self { cfg, http })
    }

    /// Provider settings from the run configuration. The key comes from the
    /// configured environment variable, else from the user config file.
    pub fn from_config(cfg: &TestGenConfig) -> Result<Self, GatewayError> {
        let api_key = env::var(&cfg.llm_api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| load_user_config().map(|c| c.api_key))
            .ok_or_else(|| {
                GatewayError::Fatal(format!(
                    "{} is not set and no key in {}",
                    cfg.llm_api_key_env,
                    user_config_path().display()
                ))
            })?;

        Self::new(
            ProviderConfig {
                provider: cfg.llm_provider,
                model: cfg.llm_model.clone(),
                api_key,
                base_url: cfg.llm_base_url.clone(),
                temperature: cfg.llm_temperature,
                top_p: cfg.llm_top_p,
            },
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }
}

impl ModelGateway for HttpGateway {
    fn complete(&self, prompt: &LlmPrompt) -> Result<String, GatewayError> {
        let (url, headers, body) = build_request(&self.cfg, prompt);

        let mut req = self.http.post(url).json(&body);
        for (k, v) in headers {
            req = req.header(k, v);
        }

        let resp = req.send().map_err(|e| {
            if e.is_builder() {
                GatewayError::Fatal(e.to_string())
            } else {
                GatewayError::Transient(e.to_string())
            }
        })?;

        let status = resp.status();
        let raw = resp
            .text()
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, &raw));
        }

        let json: Value = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Transient(format!("unparseable model reply: {e}")))?;

        extract_text(&self.cfg.provider, &json)
    }
}

/// 408/429/5xx are worth resending; every other non-success is final.
pub fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let msg = format!("LLM error {}: {}", status, body.chars().take(500).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        GatewayError::Transient(msg)
    } else {
        GatewayError::Fatal(msg)
    }
}

fn build_request(
    cfg: &ProviderConfig,
    prompt: &LlmPrompt,
) -> (String, Vec<(&'static str, String)>, Value) {
    match cfg.provider {
        Provider::Chat => {
            let url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://models.github.ai/inference/chat/completions".into());

            let body = serde_json::json!({
                "model": cfg.model,
                "temperature": cfg.temperature,
                "top_p": cfg.top_p,
                "messages": [
                    { "role": "system", "content": prompt.system },
                    { "role": "user", "content": prompt.user }
                ]
            });

            (
                url,
                vec![("Authorization", format!("Bearer {}", cfg.api_key))],
                body,
            )
        }

        Provider::OpenAI => {
            let url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/responses".into());

            let body = serde_json::json!({
                "model": cfg.model,
                "instructions": prompt.system,
                "input": prompt.user,
                "temperature": cfg.temperature,
                "top_p": cfg.top_p,
            });

            (
                url,
                vec![("Authorization", format!("Bearer {}", cfg.api_key))],
                body,
            )
        }

        Provider::Anthropic => {
            let url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".into());

            let body = serde_json::json!({
                "model": cfg.model,
                "max_tokens": 4096,
                "temperature": cfg.temperature,
                "system": prompt.system,
                "messages": [
                    { "role": "user", "content": prompt.user }
                ]
            });

            (
                url,
                vec![
                    ("x-api-key", cfg.api_key.clone()),
                    ("anthropic-version", "2023-06-01".into()),
                ],
                body,
            )
        }
    }
}

fn extract_text(provider: &Provider, v: &Value) -> Result<String, GatewayError> {
    let text = match provider {
        Provider::Chat => v
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(str::to_owned),

        Provider::OpenAI => v
            .get("output")
            .and_then(|o| o.as_array())
            .and_then(|arr| {
                arr.iter().find_map(|item| {
                    item.get("content")?
                        .as_array()?
                        .iter()
                        .find_map(|c| c.get("text")?.as_str())
                })
            })
            .map(str::to_owned),

        Provider::Anthropic => v
            .pointer("/content/0/text")
            .and_then(|v| v.as_str())
            .map(str::to_owned),
    };

    text.ok_or_else(|| GatewayError::Transient(format!("{:?} response parse failure", provider)))
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.95
}

fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("testsmith/llm.json")
}

fn load_user_config() -> Option<ProviderConfig> {
    fs::read_to_string(user_config_path())
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider: Provider) -> ProviderConfig {
        ProviderConfig {
            provider,
            model: "m".into(),
            api_key: "k".into(),
            base_url: None,
            temperature: 0.2,
            top_p: 0.9,
        }
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn chat_request_carries_sampling_settings() {
        let prompt = LlmPrompt {
            system: "sys".into(),
            user: "usr".into(),
        };
        let (url, headers, body) = build_request(&cfg(Provider::Chat), &prompt);
        assert!(url.ends_with("/chat/completions"));
        assert_eq!(headers[0].1, "Bearer k");
        assert_eq!(body["messages"][1]["content"], "usr");
        assert!((body["top_p"].as_f64().unwrap() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn reply_text_extraction_per_provider() {
        let chat = serde_json::json!({"choices": [{"message": {"content": "a"}}]});
        let anth = serde_json::json!({"content": [{"text": "b"}]});
        let oai = serde_json::json!({"output": [{"content": [{"text": "c"}]}]});

        assert_eq!(extract_text(&Provider::Chat, &chat).unwrap(), "a");
        assert_eq!(extract_text(&Provider::Anthropic, &anth).unwrap(), "b");
        assert_eq!(extract_text(&Provider::OpenAI, &oai).unwrap(), "c");
        assert!(extract_text(&Provider::Chat, &anth).unwrap_err().is_transient());
    }
}
