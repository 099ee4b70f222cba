//! Completion provider clients and the provider registry.
//!
//! The provider set is closed: Claude, OpenAI and Gemini. Each provider is
//! available when a credential was configured at startup; availability never
//! changes afterwards. A registry call is a single outbound request with no
//! caching and no retry; falling back to another provider is the router's job.

pub mod claude;
pub mod gemini;
pub mod openai;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, instrument};

pub use claude::ClaudeClient;
pub use gemini::GeminiClient;
pub use openai::OpenAiClient;

/// Default assistant prompt when neither the caller nor the task category sets one
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant for YouTube creators. Answer precisely and concisely.";

/// Identity of a completion provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Claude,
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
}

impl ProviderId {
    /// Every provider, in the global fallback order
    pub const ALL: [ProviderId; 3] = [ProviderId::Claude, ProviderId::OpenAi, ProviderId::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }

    /// Model used when the caller does not name one
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Claude => "claude-3-5-sonnet-latest",
            Self::OpenAi => "gpt-4o",
            Self::Gemini => "gemini-1.5-flash",
        }
    }

    /// Environment variable holding this provider's API key
    pub fn credential_env(&self) -> &'static str {
        match self {
            Self::Claude => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Ok(Self::Claude),
            "openai" | "gpt" => Ok(Self::OpenAi),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(format!("Unknown provider: {}", other)),
        }
    }
}

/// Options recognised by every provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Overrides the role-appropriate default prompt
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Overrides the provider's default model
    #[serde(default)]
    pub model: Option<String>,
}

fn default_max_tokens() -> u32 {
    2000
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            system_prompt: None,
            model: None,
        }
    }
}

impl CompletionOptions {
    /// Model to request from `provider`
    pub fn model_for(&self, provider: ProviderId) -> &str {
        self.model.as_deref().unwrap_or(provider.default_model())
    }

    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}

/// Errors from a single provider call
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No credential configured; never retried against the same provider
    #[error("Provider {0} is not configured (no API key)")]
    Unconfigured(ProviderId),

    #[error("Request to {provider} failed: {source}")]
    Http {
        provider: ProviderId,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} API error (HTTP {status}): {message}")]
    Api {
        provider: ProviderId,
        status: u16,
        message: String,
    },

    #[error("{0} returned an empty completion")]
    EmptyResponse(ProviderId),

    #[error("{provider} call timed out after {after:?}")]
    Timeout { provider: ProviderId, after: Duration },

    #[error("{provider} call failed: {message}")]
    Other { provider: ProviderId, message: String },
}

impl ProviderError {
    /// Whether this is a configuration error rather than an execution failure
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Unconfigured(_))
    }
}

/// Credential and endpoint for one provider
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Model used when the caller does not pick one
    pub model: Option<String>,
}

/// A configured provider client
pub enum ProviderClient {
    Claude(ClaudeClient),
    OpenAi(OpenAiClient),
    Gemini(GeminiClient),
}

impl ProviderClient {
    fn build(id: ProviderId, api_key: String, base_url: Option<String>, http: reqwest::Client) -> Self {
        match id {
            ProviderId::Claude => Self::Claude(ClaudeClient::new(api_key, base_url, http)),
            ProviderId::OpenAi => Self::OpenAi(OpenAiClient::new(api_key, base_url, http)),
            ProviderId::Gemini => Self::Gemini(GeminiClient::new(api_key, base_url, http)),
        }
    }

    pub fn id(&self) -> ProviderId {
        match self {
            Self::Claude(_) => ProviderId::Claude,
            Self::OpenAi(_) => ProviderId::OpenAi,
            Self::Gemini(_) => ProviderId::Gemini,
        }
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, ProviderError> {
        match self {
            Self::Claude(client) => client.complete(prompt, options).await,
            Self::OpenAi(client) => client.complete(prompt, options).await,
            Self::Gemini(client) => client.complete(prompt, options).await,
        }
    }
}

/// The set of providers configured at startup
pub struct ProviderRegistry {
    clients: HashMap<ProviderId, ProviderClient>,
    models: HashMap<ProviderId, String>,
    call_timeout: Duration,
}

impl ProviderRegistry {
    /// Build clients for every provider that has an API key
    pub fn new(settings: &HashMap<ProviderId, ProviderSettings>, call_timeout: Duration) -> Self {
        let http = reqwest::Client::new();
        let clients = ProviderId::ALL
            .into_iter()
            .filter_map(|id| {
                let entry = settings.get(&id)?;
                let key = entry.api_key.clone().filter(|k| !k.trim().is_empty())?;
                Some((id, ProviderClient::build(id, key, entry.base_url.clone(), http.clone())))
            })
            .collect();
        let models = settings
            .iter()
            .filter_map(|(id, entry)| Some((*id, entry.model.clone().filter(|m| !m.trim().is_empty())?)))
            .collect();

        Self {
            clients,
            models,
            call_timeout,
        }
    }

    /// A registry with no configured provider
    pub fn empty() -> Self {
        Self {
            clients: HashMap::new(),
            models: HashMap::new(),
            call_timeout: Duration::from_secs(60),
        }
    }

    pub fn is_available(&self, provider: ProviderId) -> bool {
        self.clients.contains_key(&provider)
    }

    /// Configured providers, in global order
    pub fn available(&self) -> Vec<ProviderId> {
        ProviderId::ALL
            .into_iter()
            .filter(|p| self.is_available(*p))
            .collect()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Run one completion against `provider`
    #[instrument(skip(self, prompt, options), fields(provider = %provider))]
    pub async fn complete(
        &self,
        provider: ProviderId,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let client = self
            .clients
            .get(&provider)
            .ok_or(ProviderError::Unconfigured(provider))?;

        let with_model;
        let options = match (&options.model, self.models.get(&provider)) {
            (None, Some(model)) => {
                with_model = CompletionOptions {
                    model: Some(model.clone()),
                    ..options.clone()
                };
                &with_model
            }
            _ => options,
        };

        debug!(model = options.model_for(provider), "Sending completion request");

        let text = timeout(self.call_timeout, client.complete(prompt, options))
            .await
            .map_err(|_| ProviderError::Timeout {
                provider,
                after: self.call_timeout,
            })??;

        if text.trim().is_empty() {
            return Err(ProviderError::EmptyResponse(provider));
        }

        Ok(text)
    }
}

/// Trim an error body so it stays readable in logs
pub(crate) fn truncate_error_body(body: &str) -> String {
    const MAX: usize = 512;
    let body = body.trim();
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
