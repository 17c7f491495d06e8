//! Classification and embedding service client
//!
//! Defines the external-capability contract consumed by the enrichment
//! engine, the reasoning router and the thread summarizer, plus the
//! Gemini HTTP implementation. Uses a long-lived reqwest::Client for
//! connection pooling.

use crate::error::AgentError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Contract for the classification + embedding services.
///
/// Components receive an `Arc<dyn LlmClient>` at construction time so
/// tests can substitute scripted fakes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a prompt, return the raw text answer.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Generate a cosine-comparable embedding of fixed dimensionality.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Ask for a JSON answer and strip markdown fences from the reply.
    async fn generate_json(&self, prompt: &str) -> Result<String> {
        let json_prompt = format!(
            "{}\n\nReturn valid JSON only. Do not use markdown code blocks.",
            prompt
        );
        let raw = self.generate(&json_prompt).await?;
        Ok(strip_code_fences(&raw).to_string())
    }
}

/// Remove a leading/trailing ```json fence if the model added one anyway.
pub fn strip_code_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    generate_url: String,
    embed_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            generate_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".to_string(),
            embed_url: "https://generativelanguage.googleapis.com/v1beta/models/text-embedding-004:embedContent".to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(AgentError::Llm("GEMINI_API_KEY not configured".to_string()));
        }

        let url = format!("{}?key={}", self.generate_url, self.api_key);

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.3,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 1024,
            },
        };

        info!("Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                AgentError::Llm(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(AgentError::Llm(format!("Gemini API error: {}", error_text)));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            AgentError::Llm(format!("Gemini parse error: {}", e))
        })?;

        let answer = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| AgentError::Llm("Empty response from Gemini".to_string()))?;

        Ok(answer)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.api_key.is_empty() {
            return Err(AgentError::Embedding(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.embed_url, self.api_key);

        let request = EmbedRequest {
            model: "models/text-embedding-004".to_string(),
            content: Content {
                parts: vec![Part {
                    text: text.to_string(),
                }],
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::Embedding(format!("Embedding request failed: {}", e)))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AgentError::Embedding(format!(
                "Embedding API error: {}",
                error_text
            )));
        }

        let embed_response: EmbedResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Embedding(format!("Embedding parse error: {}", e)))?;

        Ok(embed_response.embedding.values)
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: Content,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted LLM fake used across engine tests.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    pub struct FakeLlm {
        replies: Mutex<VecDeque<String>>,
        embeddings: Mutex<HashMap<String, Vec<f32>>>,
        default_embedding: Vec<f32>,
        pub fail_embeddings: bool,
    }

    impl FakeLlm {
        pub fn new() -> Self {
            Self {
                replies: Mutex::new(VecDeque::new()),
                embeddings: Mutex::new(HashMap::new()),
                default_embedding: vec![1.0, 0.0, 0.0],
                fail_embeddings: false,
            }
        }

        pub fn with_failing_embeddings(mut self) -> Self {
            self.fail_embeddings = true;
            self
        }

        pub fn push_reply(&self, reply: &str) {
            self.replies.lock().unwrap().push_back(reply.to_string());
        }

        pub fn set_embedding(&self, text: &str, vector: Vec<f32>) {
            self.embeddings
                .lock()
                .unwrap()
                .insert(text.to_string(), vector);
        }
    }

    #[async_trait]
    impl LlmClient for FakeLlm {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AgentError::Llm("no scripted reply".to_string()))
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.fail_embeddings {
                return Err(AgentError::Embedding("scripted outage".to_string()));
            }
            Ok(self
                .embeddings
                .lock()
                .unwrap()
                .get(text)
                .cloned()
                .unwrap_or_else(|| self.default_embedding.clone()))
        }
    }
}
