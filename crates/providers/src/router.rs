//! Inference selection from configuration.

use std::sync::Arc;

use switchboard_config::InferenceConfig;
use switchboard_core::error::InferenceError;
use switchboard_core::inference::Inference;
use tracing::info;

use crate::openai_compat::OpenAiCompatInference;

/// Build the configured inference collaborator.
///
/// Hosted providers need an API key; local runtimes and custom `api_url`s
/// do not.
pub fn build_from_config(config: &InferenceConfig) -> Result<Arc<dyn Inference>, InferenceError> {
    let api_key = config.api_key.clone().unwrap_or_default();
    if api_key.is_empty() && config.api_url.is_none() && requires_api_key(&config.provider) {
        return Err(InferenceError::NotConfigured(format!(
            "provider '{}' needs an API key (set SWITCHBOARD_API_KEY or inference.api_key)",
            config.provider
        )));
    }

    let base_url = config
        .api_url
        .clone()
        .unwrap_or_else(|| default_base_url(&config.provider));

    let mut inference =
        OpenAiCompatInference::new(&config.provider, &base_url, api_key, &config.model)?
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens)
            .with_max_tool_rounds(config.max_tool_rounds);
    if let Some(prompt) = &config.system_prompt {
        inference = inference.with_system_prompt(prompt);
    }

    info!(provider = %config.provider, model = %config.model, base_url = %base_url, "Inference configured");
    Ok(Arc::new(inference))
}

fn requires_api_key(provider: &str) -> bool {
    !matches!(provider, "ollama" | "vllm" | "llamacpp" | "llama.cpp")
}

/// Get the default base URL for well-known providers.
pub fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "anthropic" => "https://api.anthropic.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "fireworks" => "https://api.fireworks.ai/inference/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}
