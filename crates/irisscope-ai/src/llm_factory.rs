use crate::llm_provider::*;
use anyhow::{anyhow, Result};
use irisscope_core::config_manager::LLMConfig;
use std::sync::Arc;

#[cfg(feature = "openai-compatible")]
use crate::openai_compatible_provider::{OpenAICompatibleConfig, OpenAICompatibleProvider};

/// Factory for creating LLM providers based on configuration
pub struct LLMProviderFactory;

impl LLMProviderFactory {
    /// Create an LLM provider from configuration
    pub fn create_from_config(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let provider_name = config.provider.to_lowercase();

        match provider_name.as_str() {
            #[cfg(feature = "openai-compatible")]
            "openai" => Self::create_openai_provider(config),
            #[cfg(feature = "openai-compatible")]
            "lmstudio" => Self::create_lmstudio_provider(config),
            #[cfg(feature = "openai-compatible")]
            "ollama" => Self::create_ollama_provider(config),
            #[cfg(feature = "openai-compatible")]
            "openai-compatible" => Self::create_openai_compatible_provider(config),
            _ => Err(anyhow!(
                "Unsupported LLM provider: {}. Available providers: {}",
                provider_name,
                Self::supported_providers().join(", ")
            )),
        }
    }

    /// Create an OpenAI provider
    #[cfg(feature = "openai-compatible")]
    fn create_openai_provider(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let api_key = config
            .openai_api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                anyhow!(
                    "OpenAI API key not found. Set 'openai_api_key' in config \
                     or OPENAI_API_KEY environment variable"
                )
            })?;

        let openai_config = OpenAICompatibleConfig {
            base_url: config.openai_url.trim_end_matches('/').to_string(),
            model: config.model.clone().unwrap_or_else(|| "gpt-4o".to_string()),
            timeout_secs: config.timeout_secs,
            api_key: Some(api_key),
            provider_name: "openai".to_string(),
            image_detail: config.image_detail.clone(),
            supports_json_schema: true,
            ..Default::default()
        };

        Ok(Arc::new(OpenAICompatibleProvider::new(openai_config)?))
    }

    /// Create a provider using LM Studio's OpenAI-compatible endpoint
    #[cfg(feature = "openai-compatible")]
    fn create_lmstudio_provider(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let base_url = format!("{}/v1", config.lmstudio_url.trim_end_matches('/'));
        let compat_config = OpenAICompatibleConfig {
            base_url,
            timeout_secs: config.timeout_secs,
            image_detail: config.image_detail.clone(),
            ..OpenAICompatibleConfig::lm_studio(
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| "local-model".to_string()),
            )
        };

        Ok(Arc::new(OpenAICompatibleProvider::new(compat_config)?))
    }

    /// Create a provider using Ollama's OpenAI-compatible endpoint
    #[cfg(feature = "openai-compatible")]
    fn create_ollama_provider(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let base_url = format!("{}/v1", config.ollama_url.trim_end_matches('/'));
        let compat_config = OpenAICompatibleConfig {
            base_url,
            timeout_secs: config.timeout_secs,
            image_detail: config.image_detail.clone(),
            ..OpenAICompatibleConfig::ollama(
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| "llava:13b".to_string()),
            )
        };

        Ok(Arc::new(OpenAICompatibleProvider::new(compat_config)?))
    }

    /// Create an OpenAI-compatible provider
    #[cfg(feature = "openai-compatible")]
    fn create_openai_compatible_provider(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        let base_url = config.openai_compatible_url.clone().ok_or_else(|| {
            anyhow!("OpenAI-compatible base URL not found. Set 'openai_compatible_url' in config")
        })?;

        let compat_config = OpenAICompatibleConfig {
            api_key: config.openai_api_key.clone(),
            timeout_secs: config.timeout_secs,
            image_detail: config.image_detail.clone(),
            ..OpenAICompatibleConfig::custom(
                base_url.trim_end_matches('/').to_string(),
                config.model.clone().ok_or_else(|| {
                    anyhow!("Model name is required for OpenAI-compatible provider")
                })?,
                "openai-compatible".to_string(),
            )
        };

        Ok(Arc::new(OpenAICompatibleProvider::new(compat_config)?))
    }

    /// Check if the configured provider is reachable
    pub async fn check_availability(provider: &Arc<dyn LLMProvider>) -> bool {
        provider.is_available().await
    }

    /// Get a list of supported providers (based on enabled features)
    pub fn supported_providers() -> Vec<&'static str> {
        #[allow(unused_mut)]
        let mut providers = Vec::new();

        #[cfg(feature = "openai-compatible")]
        providers.extend(["openai", "openai-compatible", "lmstudio", "ollama"]);

        providers
    }
}
