// ABOUTME: LLM gateway seam: one prompt (plus optional image) in, raw text out
// ABOUTME: ProviderGateway adapts an LLMProvider and classifies failures as fatal or retryable

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::llm_provider::{
    GenerationConfig, JsonSchema, LLMProvider, Message, ProviderHttpError, ResponseFormat,
};
use crate::prompts::StageId;

/// One invocation of the gateway.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub stage: StageId,
    /// Fully interpolated prompt
    pub prompt: String,
    /// Ask the model for JSON-only output
    pub json_mode: bool,
    /// Expected output schema, for providers with structured output support
    pub response_schema: Option<serde_json::Value>,
    /// Image data URL for vision stages
    pub image: Option<String>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network hiccups, rate limits, 5xx: worth another attempt
    #[error("transient gateway failure: {0}")]
    Retryable(String),

    /// Authentication, bad request: retrying cannot help
    #[error("fatal gateway failure: {0}")]
    Fatal(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Retryable(_))
    }
}

/// `callLLM`: sends a prompt (optionally with an image) and returns raw text.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn call(&self, request: LlmRequest) -> Result<String, GatewayError>;
}

/// Gateway backed by an [`LLMProvider`].
pub struct ProviderGateway {
    provider: Arc<dyn LLMProvider>,
    generation: GenerationConfig,
}

impl ProviderGateway {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            generation: GenerationConfig::default(),
        }
    }

    pub fn with_generation_config(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    fn generation_for(&self, request: &LlmRequest) -> GenerationConfig {
        let mut config = self.generation.clone();
        config.response_format = match (request.json_mode, &request.response_schema) {
            (false, _) => None,
            (true, Some(schema)) => Some(ResponseFormat::JsonSchema {
                json_schema: JsonSchema {
                    name: request.stage.as_str().to_string(),
                    schema: schema.clone(),
                    // Optional fields in the stage schemas rule out strict mode
                    strict: false,
                },
            }),
            (true, None) => Some(ResponseFormat::JsonObject),
        };
        config
    }

    fn classify(error: anyhow::Error) -> GatewayError {
        match error.downcast_ref::<ProviderHttpError>() {
            Some(http) if http.is_fatal() => GatewayError::Fatal(http.to_string()),
            _ => GatewayError::Retryable(format!("{:#}", error)),
        }
    }
}

#[async_trait]
impl LlmGateway for ProviderGateway {
    async fn call(&self, request: LlmRequest) -> Result<String, GatewayError> {
        let mut message = Message::user(request.prompt.clone());
        if let Some(image) = &request.image {
            message = message.with_image(image.clone());
        }
        let config = self.generation_for(&request);

        debug!(
            stage = request.stage.as_str(),
            provider = self.provider.provider_name(),
            model = self.provider.model_name(),
            has_image = request.image.is_some(),
            "Calling LLM provider"
        );

        let response = self
            .provider
            .generate_chat(&[message], &config)
            .await
            .map_err(Self::classify)?;

        Ok(response.content)
    }
}
