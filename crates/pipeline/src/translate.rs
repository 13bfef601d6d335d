//! Prompt translation.
//!
//! Prompts written in other languages are translated to English before
//! they are substituted into the workflow. Backends implement
//! [`Translator`]; [`PromptTranslator`] chains them, skips text that is
//! already ASCII, and never fails a batch item: when every backend fails
//! the original prompt is used.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::settings::OllamaSettings;

const TRANSLATE_INSTRUCTION: &str =
    "Translate the following text to English, preserving the original meaning and context:";

const TRANSLATE_SYSTEM_PROMPT: &str =
    "You are a professional translator. Translate the given text accurately and fluently. \
     Reply with the English translation only.";

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("Translation request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid translation response: {0}")]
    InvalidResponse(String),

    #[error("Translation backend returned an empty answer")]
    Empty,
}

/// A translation backend.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Translate `text` to English.
    async fn translate(&self, text: &str) -> Result<String, TranslateError>;
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

/// Translator backed by a locally hosted model served by Ollama.
#[derive(Clone)]
pub struct OllamaTranslator {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    system: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

impl OllamaTranslator {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, TranslateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TranslateError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    pub fn from_settings(settings: &OllamaSettings) -> Result<Self, TranslateError> {
        Self::new(&settings.url, &settings.model, settings.timeout)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Models installed on the Ollama server (`GET /api/tags`).
    pub async fn list_models(&self) -> Result<Vec<OllamaModel>, TranslateError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| TranslateError::RequestFailed(e.to_string()))?;
        let response = ensure_success(response).await?;
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::InvalidResponse(e.to_string()))?;
        Ok(tags.models)
    }
}

#[async_trait]
impl Translator for OllamaTranslator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: format!("{TRANSLATE_INSTRUCTION}\n\n{text}"),
            system: TRANSLATE_SYSTEM_PROMPT,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| TranslateError::RequestFailed(e.to_string()))?;
        let response = ensure_success(response).await?;

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::InvalidResponse(e.to_string()))?;

        let answer = body.response.trim();
        if answer.is_empty() {
            return Err(TranslateError::Empty);
        }
        Ok(answer.to_string())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, TranslateError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TranslateError::RequestFailed(format!("{status}: {body}")));
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// PromptTranslator
// ---------------------------------------------------------------------------

/// Whether `text` contains letters outside ASCII (CJK, Cyrillic, ...).
pub fn needs_translation(text: &str) -> bool {
    text.chars().any(|c| c.is_alphabetic() && !c.is_ascii())
}

/// Fallback chain of translators with a per-run cache.
pub struct PromptTranslator {
    backends: Vec<Box<dyn Translator>>,
    cache: Mutex<HashMap<String, String>>,
}

impl PromptTranslator {
    pub fn new(backends: Vec<Box<dyn Translator>>) -> Self {
        Self {
            backends,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A translator that passes every prompt through unchanged.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Build from settings: Ollama when enabled, otherwise disabled.
    pub fn from_settings(settings: &OllamaSettings) -> Result<Self, TranslateError> {
        if !settings.enable {
            return Ok(Self::disabled());
        }
        let ollama = OllamaTranslator::from_settings(settings)?;
        tracing::info!(url = %settings.url, model = %settings.model, "Prompt translation enabled");
        Ok(Self::new(vec![Box::new(ollama)]))
    }

    pub fn is_enabled(&self) -> bool {
        !self.backends.is_empty()
    }

    /// Translate `text`, falling back to the original on any failure.
    pub async fn translate(&self, text: &str) -> String {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return String::new();
        }
        if !self.is_enabled() || !needs_translation(trimmed) {
            return text.to_string();
        }
        if let Some(hit) = self.cached(trimmed) {
            return hit;
        }

        for backend in &self.backends {
            match backend.translate(trimmed).await {
                Ok(translated) => {
                    tracing::debug!(
                        backend = backend.name(),
                        original = %trimmed,
                        translated = %translated,
                        "Prompt translated",
                    );
                    self.remember(trimmed, &translated);
                    return translated;
                }
                Err(e) => {
                    tracing::warn!(
                        backend = backend.name(),
                        error = %e,
                        "Translation backend failed",
                    );
                }
            }
        }

        tracing::warn!("All translation backends failed; using the original prompt");
        text.to_string()
    }

    fn cached(&self, text: &str) -> Option<String> {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(text).cloned())
    }

    fn remember(&self, text: &str, translated: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(text.to_string(), translated.to_string());
        }
    }
}
