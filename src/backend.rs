//! Extraction backend: turn page images into structured JSON.
//!
//! The pipeline only sees the [`ExtractionBackend`] trait. The shipped
//! implementation, [`VisionBackend`], drives a vision LLM through
//! `edgequake-llm`, so any provider the factory knows (OpenAI, Anthropic,
//! Gemini, Ollama, …) works without code changes.
//!
//! ## Message layout
//!
//! 1. **System message**: profile prompt + schema instruction + JSON schema
//! 2. **User message**: the page image(s) as base64 attachments, empty text
//!
//! In `aggregate` mode every unit goes into one user message and one result
//! comes back; in `per_file` mode each unit gets its own call.

use crate::config::PipelineConfig;
use crate::error::{BackendError, PipelineError};
use crate::output::ExtractionResult;
use crate::pipeline::encode::image_data;
use crate::profile::Profile;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Default model when a provider is named without one.
const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// One renderable page handed to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionUnit {
    /// Display name, e.g. `statement_page_2.png`.
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// How many results a call produces for its units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiMode {
    /// One result per unit.
    PerFile,
    /// One result for all units together.
    Aggregate,
}

impl MultiMode {
    /// Aggregate iff the document rendered to more than one page.
    pub fn for_unit_count(n: usize) -> Self {
        if n > 1 {
            MultiMode::Aggregate
        } else {
            MultiMode::PerFile
        }
    }
}

/// Per-request backend options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractOptions {
    /// Overrides the configured model.
    pub model: Option<String>,
}

#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    async fn extract(
        &self,
        units: &[ExtractionUnit],
        profile: &Profile,
        options: &ExtractOptions,
        mode: MultiMode,
    ) -> Result<Vec<ExtractionResult>, BackendError>;
}

// ── Vision LLM backend ───────────────────────────────────────────────────

/// [`ExtractionBackend`] over an `edgequake-llm` vision provider.
pub struct VisionBackend {
    provider: Arc<dyn LLMProvider>,
    provider_name: Option<String>,
    model: Option<String>,
    temperature: f32,
    max_tokens: usize,
}

impl VisionBackend {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            provider_name: None,
            model: None,
            temperature: 0.0,
            max_tokens: 4096,
        }
    }

    /// Resolve the provider from the config and environment.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let provider = resolve_provider(config)?;
        Ok(Self {
            provider,
            provider_name: config.provider_name.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }

    /// The provider to use for this call; a model override builds a fresh one.
    fn provider_for(&self, options: &ExtractOptions) -> Result<(Arc<dyn LLMProvider>, Option<String>), BackendError> {
        match options.model.as_deref() {
            Some(model) if Some(model) != self.model.as_deref() => {
                let name = self
                    .provider_name
                    .clone()
                    .or_else(|| std::env::var("EDGEQUAKE_LLM_PROVIDER").ok())
                    .unwrap_or_else(|| "openai".to_string());
                let provider = ProviderFactory::create_llm_provider(&name, model)
                    .map_err(|e| BackendError::new(format!("Provider '{name}' unavailable: {e}")))?;
                Ok((provider, Some(model.to_string())))
            }
            _ => Ok((Arc::clone(&self.provider), self.model.clone())),
        }
    }

    async fn call(
        &self,
        provider: &Arc<dyn LLMProvider>,
        model: Option<&str>,
        profile: &Profile,
        images: Vec<ImageData>,
    ) -> Result<ExtractionResult, BackendError> {
        let start = Instant::now();
        let pages = images.len();
        let messages = vec![
            ChatMessage::system(profile.system_prompt()),
            ChatMessage::user_with_images("", images),
        ];
        let response = provider
            .chat(&messages, Some(&self.options()))
            .await
            .map_err(|e| BackendError::new(e.to_string()))?;
        debug!(
            "Profile {}: {} input tokens, {} output tokens, {:?}",
            profile.name,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        let data = parse_json_reply(&response.content)?;
        Ok(ExtractionResult {
            data,
            meta: json!({
                "profile": profile.name,
                "model": model,
                "pages": pages,
                "inputTokens": response.prompt_tokens,
                "outputTokens": response.completion_tokens,
                "durationMs": start.elapsed().as_millis() as u64,
            }),
        })
    }
}

#[async_trait]
impl ExtractionBackend for VisionBackend {
    async fn extract(
        &self,
        units: &[ExtractionUnit],
        profile: &Profile,
        options: &ExtractOptions,
        mode: MultiMode,
    ) -> Result<Vec<ExtractionResult>, BackendError> {
        if units.is_empty() {
            return Err(BackendError::new("No units to extract"));
        }
        let (provider, model) = self.provider_for(options)?;
        match mode {
            MultiMode::Aggregate => {
                let images = units.iter().map(|u| image_data(&u.bytes, &u.mime)).collect();
                let result = self.call(&provider, model.as_deref(), profile, images).await?;
                Ok(vec![result])
            }
            MultiMode::PerFile => {
                let mut results = Vec::with_capacity(units.len());
                for unit in units {
                    let images = vec![image_data(&unit.bytes, &unit.mime)];
                    results.push(self.call(&provider, model.as_deref(), profile, images).await?);
                }
                Ok(results)
            }
        }
    }
}

// ── Reply parsing ────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```(?:json)?\s*\n(.*)\n```\s*$").expect("static regex"));

/// Parse a model reply as JSON, tolerating outer code fences.
pub fn parse_json_reply(reply: &str) -> Result<Value, BackendError> {
    let body = match RE_OUTER_FENCES.captures(reply) {
        Some(caps) => caps.get(1).map_or(reply, |m| m.as_str()),
        None => reply,
    };
    serde_json::from_str(body.trim())
        .map_err(|e| BackendError::new(format!("Backend reply is not valid JSON: {e}")))
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(name, model)
        .map_err(|e| PipelineError::InvalidConfig(format!("Provider '{name}' not configured: {e}")))
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Named provider** (`config.provider_name`) with `config.model` or the
///    default model.
/// 2. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 3. **OpenAI** when `OPENAI_API_KEY` is set.
/// 4. **Auto-detect** via [`ProviderFactory::from_env`].
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider("openai", model);
    }

    let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
        PipelineError::InvalidConfig(format!(
            "No LLM provider could be auto-detected from environment. \
             Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider. Error: {e}"
        ))
    })?;
    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_follows_page_count() {
        assert_eq!(MultiMode::for_unit_count(1), MultiMode::PerFile);
        assert_eq!(MultiMode::for_unit_count(0), MultiMode::PerFile);
        assert_eq!(MultiMode::for_unit_count(3), MultiMode::Aggregate);
        assert_eq!(serde_json::to_value(MultiMode::PerFile).unwrap(), "per_file");
    }

    #[test]
    fn parses_fenced_and_bare_json() {
        let fenced = "```json\n{\"total\": 1200}\n```";
        assert_eq!(parse_json_reply(fenced).unwrap(), json!({"total": 1200}));
        let bare = "  [1, 2]  ";
        assert_eq!(parse_json_reply(bare).unwrap(), json!([1, 2]));
        let no_lang = "```\n{\"a\": true}\n```\n";
        assert_eq!(parse_json_reply(no_lang).unwrap(), json!({"a": true}));
    }

    #[test]
    fn invalid_reply_is_not_retryable() {
        let err = parse_json_reply("Sorry, I cannot read this receipt.").unwrap_err();
        assert!(!crate::pipeline::retry::is_retryable(&err));
    }
}
