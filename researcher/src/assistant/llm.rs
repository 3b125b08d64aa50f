use async_trait::async_trait;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::Ollama;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use url::Url;

use super::configuration::{Configuration, ResearchMode};
use super::error::LlmError;

/// The language-model capability every pipeline stage delegates to.
///
/// `instructions` plays the system role; `context` is the user turn.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, instructions: &str, context: &str) -> Result<String, LlmError>;
}

/// OpenAI-compatible chat completions endpoint (Groq by default).
pub struct ChatCompletionsClient {
    api_key: String,
    endpoint: Url,
    model: String,
    client: Client,
}

impl ChatCompletionsClient {
    pub fn new(client: Client, base_url: &Url, api_key: String, model: String) -> Result<Self, url::ParseError> {
        Ok(Self {
            api_key,
            endpoint: base_url.join("chat/completions")?,
            model,
            client,
        })
    }
}

#[async_trait]
impl Generator for ChatCompletionsClient {
    async fn generate(&self, instructions: &str, context: &str) -> Result<String, LlmError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {
                        "role": "system",
                        "content": instructions
                    },
                    {
                        "role": "user",
                        "content": context
                    }
                ],
                "temperature": 0.7
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let data = response.json::<serde_json::Value>().await?;

        data["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or(LlmError::EmptyResponse)
    }
}

pub struct OllamaGenerator {
    ollama: Ollama,
    model: String,
}

impl OllamaGenerator {
    pub fn new(host: String, port: u16, model: String) -> Self {
        Self {
            ollama: Ollama::new(host, port),
            model,
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, instructions: &str, context: &str) -> Result<String, LlmError> {
        let request = GenerationRequest::new(self.model.clone(), format!("{}\n\n{}", instructions, context));
        let response = self
            .ollama
            .generate(request)
            .await
            .map_err(|e| LlmError::Ollama(e.to_string()))?;
        Ok(response.response)
    }
}

/// Generators for the pipeline: `fast` for the short stages, `writer` for the report.
#[derive(Clone)]
pub struct Generators {
    pub fast: Arc<dyn Generator>,
    pub writer: Arc<dyn Generator>,
}

impl Generators {
    pub fn from_config(config: &Configuration, client: Client) -> anyhow::Result<Self> {
        match config.research_mode {
            ResearchMode::Local => {
                tracing::info!("Using Ollama with model: {}", config.local_llm);
                let ollama: Arc<dyn Generator> = Arc::new(OllamaGenerator::new(
                    config.ollama_host.clone(),
                    config.ollama_port,
                    config.local_llm.clone(),
                ));
                Ok(Self {
                    fast: ollama.clone(),
                    writer: ollama,
                })
            }
            ResearchMode::Remote => {
                let api_key = config
                    .llm_api_key
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("LLM API key not found"))?;
                tracing::info!(
                    "Using {} with model: {} (writer: {})",
                    config.llm_base_url,
                    config.llm_model,
                    config.writer_model
                );
                let fast = ChatCompletionsClient::new(
                    client.clone(),
                    &config.llm_base_url,
                    api_key.clone(),
                    config.llm_model.clone(),
                )?;
                let writer = ChatCompletionsClient::new(
                    client,
                    &config.llm_base_url,
                    api_key,
                    config.writer_model.clone(),
                )?;
                Ok(Self {
                    fast: Arc::new(fast),
                    writer: Arc::new(writer),
                })
            }
        }
    }
}
