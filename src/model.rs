//! Model provider seam.
//!
//! The transcriber talks to vision/text models through [`ModelClient`], a
//! single request/response call whose errors separate rate limiting from
//! every other transient failure. [`LlmProviderClient`] adapts any
//! `edgequake_llm` provider; tests plug in scripted fakes.
//!
//! [`ClientPool`] spreads calls over several clients (different models, or
//! different API keys for the same model) in strict rotation.

use crate::config::IngestionConfig;
use crate::error::IngestError;
use crate::pipeline::encode;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Model used when neither the config nor the environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// One model call.
#[derive(Clone, PartialEq)]
pub struct ModelRequest {
    /// System instruction.
    pub instruction: String,
    /// User text (may be empty when the image carries the content).
    pub text: String,
    /// PNG bytes attached to the user turn.
    pub image_png: Option<Vec<u8>>,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl fmt::Debug for ModelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRequest")
            .field("instruction_len", &self.instruction.len())
            .field("text_len", &self.text.len())
            .field("image_png", &self.image_png.as_ref().map(|b| b.len()))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Provider failure classes the transcriber retries differently.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    /// HTTP 429 or provider quota exhaustion.
    #[error("rate limited{}", .retry_after_ms.map(|ms| format!(" (retry after {ms}ms)")).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    /// Anything else: 5xx, timeouts, malformed responses.
    #[error("model call failed: {0}")]
    Transient(String),
}

/// A vision- and text-capable model endpoint.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run one completion and return the generated text.
    async fn complete(&self, request: ModelRequest) -> Result<String, ModelError>;

    /// Identifier for logs.
    fn name(&self) -> &str;
}

// ── Rotating pool ────────────────────────────────────────────────────────

/// A fixed, ordered set of clients handed out round-robin.
#[derive(Clone)]
pub struct ClientPool {
    clients: Arc<[Arc<dyn ModelClient>]>,
    cursor: Arc<AtomicUsize>,
}

impl ClientPool {
    pub fn new(clients: Vec<Arc<dyn ModelClient>>) -> Result<Self, IngestError> {
        if clients.is_empty() {
            return Err(IngestError::InvalidConfig(
                "a client pool needs at least one model client".into(),
            ));
        }
        Ok(Self {
            clients: clients.into(),
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn single(client: Arc<dyn ModelClient>) -> Self {
        Self {
            clients: vec![client].into(),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Next client in rotation; the cursor advances modulo the pool size.
    pub fn next_client(&self) -> Arc<dyn ModelClient> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        Arc::clone(&self.clients[idx])
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.clients.iter().map(|c| c.name()).collect();
        f.debug_struct("ClientPool").field("clients", &names).finish()
    }
}

// ── edgequake-llm adapter ────────────────────────────────────────────────

/// [`ModelClient`] backed by an `edgequake_llm` provider.
pub struct LlmProviderClient {
    provider: Arc<dyn LLMProvider>,
    label: String,
}

impl LlmProviderClient {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            provider,
            label: label.into(),
        }
    }
}

#[async_trait]
impl ModelClient for LlmProviderClient {
    async fn complete(&self, request: ModelRequest) -> Result<String, ModelError> {
        let mut messages = vec![ChatMessage::system(request.instruction.as_str())];
        match request.image_png {
            Some(ref png) => messages.push(ChatMessage::user_with_images(
                request.text.as_str(),
                vec![encode::image_data(png)],
            )),
            None => messages.push(ChatMessage::user(request.text.as_str())),
        }

        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        match self.provider.chat(&messages, Some(&options)).await {
            Ok(response) => {
                debug!(
                    model = %self.label,
                    prompt_tokens = response.prompt_tokens,
                    completion_tokens = response.completion_tokens,
                    "model call complete"
                );
                Ok(response.content)
            }
            Err(e) => Err(classify_provider_error(&e.to_string())),
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Map a provider error message onto [`ModelError`].
///
/// Providers surface rate limits with different wording and error types;
/// the status code or the phrase is the common denominator.
pub fn classify_provider_error(message: &str) -> ModelError {
    let lower = message.to_ascii_lowercase();
    let rate_limited = lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("ratelimit")
        || lower.contains("too many requests")
        || lower.contains("quota");
    if rate_limited {
        ModelError::RateLimited {
            retry_after_ms: None,
        }
    } else {
        ModelError::Transient(message.to_string())
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, IngestError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        IngestError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the provider name, from most- to least-specific:
/// config → `EDGEQUAKE_LLM_PROVIDER` → "openai" when `OPENAI_API_KEY` is set.
fn resolve_provider_name(config: &IngestionConfig) -> Option<String> {
    if let Some(ref name) = config.provider_name {
        return Some(name.clone());
    }
    if let Ok(name) = std::env::var("EDGEQUAKE_LLM_PROVIDER") {
        if !name.is_empty() {
            return Some(name);
        }
    }
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) if !key.is_empty() => Some("openai".to_string()),
        _ => None,
    }
}

fn client_for(config: &IngestionConfig, model: Option<&str>) -> Result<Arc<dyn ModelClient>, IngestError> {
    match resolve_provider_name(config) {
        Some(name) => {
            let model = model
                .map(str::to_string)
                .or_else(|| std::env::var("EDGEQUAKE_MODEL").ok().filter(|m| !m.is_empty()))
                .unwrap_or_else(|| DEFAULT_MODEL.to_string());
            let provider = create_provider(&name, &model)?;
            Ok(Arc::new(LlmProviderClient::new(provider, format!("{name}/{model}"))))
        }
        None => {
            let (provider, _embedding) =
                ProviderFactory::from_env().map_err(|e| IngestError::ProviderNotConfigured {
                    provider: "auto".to_string(),
                    hint: format!(
                        "No LLM provider could be auto-detected from environment.\n\
                         Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                         Error: {e}"
                    ),
                })?;
            Ok(Arc::new(LlmProviderClient::new(provider, "auto")))
        }
    }
}

/// Build the extraction and verification pools described by `config`.
///
/// Pre-built clients win over model names; verification falls back to the
/// first extraction client.
pub fn resolve_pools(config: &IngestionConfig) -> Result<(ClientPool, ClientPool), IngestError> {
    let extraction: Vec<Arc<dyn ModelClient>> = if !config.extraction_clients.is_empty() {
        config.extraction_clients.clone()
    } else if config.extraction_models.is_empty() {
        vec![client_for(config, None)?]
    } else {
        config
            .extraction_models
            .iter()
            .map(|m| client_for(config, Some(m)))
            .collect::<Result<_, _>>()?
    };

    let verification = match (&config.verification_client, &config.verification_model) {
        (Some(client), _) => Arc::clone(client),
        (None, Some(model)) => client_for(config, Some(model))?,
        (None, None) => Arc::clone(&extraction[0]),
    };

    Ok((ClientPool::new(extraction)?, ClientPool::single(verification)))
}
