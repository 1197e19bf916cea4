use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

// --- Errors ---

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limit exceeded for {provider}: {message}")]
    RateLimited { provider: String, message: String },

    #[error("API error ({provider}): status {status}, {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{0} environment variable not set")]
    MissingCredentials(&'static str),

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to parse response from {provider}: {message}")]
    Parse { provider: String, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("all {models} model(s) exhausted, last error: {last}")]
    ModelsExhausted { models: usize, last: Box<LlmError> },
}

impl LlmError {
    /// Quota or overload signals that are worth retrying after a pause.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::ModelsExhausted { .. } => false,
            LlmError::Api { status, message, .. } => {
                *status == 429 || *status == 529 || mentions_quota(message)
            }
            _ => false,
        }
    }

    fn from_status(provider: &str, status: reqwest::StatusCode, body: String) -> Self {
        let code = status.as_u16();
        if code == 429 || mentions_quota(&body) {
            LlmError::RateLimited {
                provider: provider.to_string(),
                message: body,
            }
        } else {
            LlmError::Api {
                provider: provider.to_string(),
                status: code,
                message: body,
            }
        }
    }
}

fn mentions_quota(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("resource_exhausted")
        || lower.contains("rate_limit")
        || lower.contains("rate limit")
        || lower.contains("quota")
}

// --- Model trait ---

#[derive(Debug, Clone)]
pub struct GenerateRequest<'a> {
    pub prompt: &'a str,
    pub model_id: &'a str,
    pub max_tokens: u32,
}

/// A generative text capability: prompt in, text out.
#[async_trait]
pub trait TextModel: Send + Sync {
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<String, LlmError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
}

impl ProviderKind {
    pub fn default_models(&self) -> Vec<String> {
        let ids: &[&str] = match self {
            ProviderKind::Anthropic => &["api-sonnet", "api-haiku"],
            ProviderKind::OpenAI => &["gpt-4o", "gpt-4o-mini"],
        };
        ids.iter().map(|s| s.to_string()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

pub fn resolve_model(name: &str) -> Result<ModelSpec, LlmError> {
    let spec = |provider, model_id: &str| ModelSpec {
        provider,
        model_id: model_id.to_string(),
        short_name: name.to_string(),
    };

    match name {
        "api-sonnet" | "sonnet" => Ok(spec(ProviderKind::Anthropic, "claude-sonnet-4-5-20250929")),
        "api-opus" | "opus" => Ok(spec(ProviderKind::Anthropic, "claude-opus-4-6")),
        "api-haiku" | "haiku" => Ok(spec(ProviderKind::Anthropic, "claude-haiku-4-5-20251001")),
        "gpt-4o" => Ok(spec(ProviderKind::OpenAI, "gpt-4o")),
        "gpt-4o-mini" => Ok(spec(ProviderKind::OpenAI, "gpt-4o-mini")),
        "gpt-5.2" | "gpt5" => Ok(spec(ProviderKind::OpenAI, "gpt-5.2")),
        "o3" => Ok(spec(ProviderKind::OpenAI, "o3")),
        // Raw provider model ids pass straight through
        id if id.starts_with("claude-") => Ok(spec(ProviderKind::Anthropic, id)),
        id if id.starts_with("gpt-") || id.starts_with("o1") || id.starts_with("o3") => {
            Ok(spec(ProviderKind::OpenAI, id))
        }
        _ => Err(LlmError::UnknownModel(name.to_string())),
    }
}

fn http_client() -> Result<reqwest::Client, LlmError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(90))
        .build()?)
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new() -> Result<Self, LlmError> {
        let api_key =
            env::var("ANTHROPIC_API_KEY").map_err(|_| LlmError::MissingCredentials("ANTHROPIC_API_KEY"))?;
        Ok(Self {
            api_key,
            client: http_client()?,
        })
    }
}

#[async_trait]
impl TextModel for AnthropicProvider {
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<String, LlmError> {
        let body = AnthropicRequest {
            model: request.model_id,
            max_tokens: request.max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: request.prompt,
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status("anthropic", status, error_text));
        }

        let api_response: AnthropicResponse = response.json().await.map_err(|e| LlmError::Parse {
            provider: "anthropic".to_string(),
            message: e.to_string(),
        })?;

        api_response
            .content
            .into_iter()
            .map(|block| block.text)
            .find(|text| !text.trim().is_empty())
            .ok_or_else(|| LlmError::Parse {
                provider: "anthropic".to_string(),
                message: "no text content in response".to_string(),
            })
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug)]
pub struct OpenAIProvider {
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new() -> Result<Self, LlmError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| LlmError::MissingCredentials("OPENAI_API_KEY"))?;
        Ok(Self {
            api_key,
            client: http_client()?,
        })
    }
}

#[async_trait]
impl TextModel for OpenAIProvider {
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<String, LlmError> {
        let body = OpenAIRequest {
            model: request.model_id,
            max_tokens: request.max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: request.prompt,
            }],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status("openai", status, error_text));
        }

        let api_response: OpenAIResponse = response.json().await.map_err(|e| LlmError::Parse {
            provider: "openai".to_string(),
            message: e.to_string(),
        })?;

        api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Parse {
                provider: "openai".to_string(),
                message: "no choices in response".to_string(),
            })
    }
}

// --- Router ---

/// Dispatches each call to the provider that owns the requested model, so a
/// fallback chain can span providers.
pub struct ModelRouter {
    providers: HashMap<ProviderKind, Arc<dyn TextModel>>,
}

impl ModelRouter {
    /// Builds providers for every model in `models`. Models whose provider has
    /// no credentials are dropped with a warning; the surviving chain is
    /// returned alongside the router.
    pub fn for_models(models: &[String]) -> Result<(Self, Vec<String>), LlmError> {
        let mut providers: HashMap<ProviderKind, Arc<dyn TextModel>> = HashMap::new();
        let mut usable = Vec::new();

        for name in models {
            let spec = resolve_model(name)?;
            if !providers.contains_key(&spec.provider) {
                let built: Result<Arc<dyn TextModel>, LlmError> = match spec.provider {
                    ProviderKind::Anthropic => AnthropicProvider::new().map(|p| Arc::new(p) as Arc<dyn TextModel>),
                    ProviderKind::OpenAI => OpenAIProvider::new().map(|p| Arc::new(p) as Arc<dyn TextModel>),
                };
                match built {
                    Ok(provider) => {
                        providers.insert(spec.provider, provider);
                    }
                    Err(e) => {
                        warn!(model = %name, error = %e, "Skipping model without provider");
                        continue;
                    }
                }
            }
            usable.push(name.clone());
        }

        if usable.is_empty() {
            return Err(LlmError::InvalidRequest(
                "no usable model: set ANTHROPIC_API_KEY or OPENAI_API_KEY".to_string(),
            ));
        }

        Ok((Self { providers }, usable))
    }
}

#[cfg(test)]
impl ModelRouter {
    pub fn with_provider(mut self, kind: ProviderKind, provider: Arc<dyn TextModel>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }
}

#[async_trait]
impl TextModel for ModelRouter {
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<String, LlmError> {
        let spec = resolve_model(request.model_id)?;
        let provider = self
            .providers
            .get(&spec.provider)
            .ok_or_else(|| LlmError::InvalidRequest(format!("no provider for model '{}'", spec.short_name)))?;

        debug!(model = %spec.model_id, prompt_chars = request.prompt.len(), "Generating");
        provider
            .generate(GenerateRequest {
                model_id: &spec.model_id,
                ..request
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    #[test]
    fn test_resolve_model_aliases() {
        let spec = resolve_model("api-sonnet").unwrap();
        assert_eq!(spec.model_id, "claude-sonnet-4-5-20250929");
        assert!(matches!(spec.provider, ProviderKind::Anthropic));

        let spec = resolve_model("haiku").unwrap();
        assert_eq!(spec.model_id, "claude-haiku-4-5-20251001");

        let spec = resolve_model("gpt5").unwrap();
        assert_eq!(spec.model_id, "gpt-5.2");
        assert!(matches!(spec.provider, ProviderKind::OpenAI));
    }

    #[test]
    fn test_resolve_model_raw_ids() {
        let spec = resolve_model("claude-3-5-haiku-latest").unwrap();
        assert!(matches!(spec.provider, ProviderKind::Anthropic));
        assert_eq!(spec.model_id, "claude-3-5-haiku-latest");

        let spec = resolve_model("gpt-4.1-mini").unwrap();
        assert!(matches!(spec.provider, ProviderKind::OpenAI));
    }

    #[test]
    fn test_resolve_model_unknown() {
        assert!(matches!(resolve_model("gemini-pro"), Err(LlmError::UnknownModel(_))));
    }

    #[test]
    fn test_rate_limit_detection() {
        let err = LlmError::from_status("openai", reqwest::StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(err.is_rate_limited());

        let err = LlmError::from_status(
            "gateway",
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error": {"status": "RESOURCE_EXHAUSTED"}}"#.to_string(),
        );
        assert!(err.is_rate_limited());

        let overloaded = LlmError::Api {
            provider: "anthropic".to_string(),
            status: 529,
            message: "overloaded".to_string(),
        };
        assert!(overloaded.is_rate_limited());

        let err = LlmError::from_status("openai", reqwest::StatusCode::UNAUTHORIZED, "bad key".to_string());
        assert!(!err.is_rate_limited());
        assert!(matches!(err, LlmError::Api { status: 401, .. }));
    }

    #[test]
    fn test_exhausted_is_not_retryable() {
        let err = LlmError::ModelsExhausted {
            models: 1,
            last: Box::new(LlmError::RateLimited {
                provider: "x".to_string(),
                message: "quota".to_string(),
            }),
        };
        assert!(!err.is_rate_limited());
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn test_anthropic_provider_requires_api_key() {
        let original = env::var("ANTHROPIC_API_KEY").ok();
        unsafe { env::remove_var("ANTHROPIC_API_KEY"); }

        let result = AnthropicProvider::new();

        if let Some(val) = original {
            unsafe { env::set_var("ANTHROPIC_API_KEY", val); }
        }

        let err = result.unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[tokio::test]
    async fn test_router_dispatches_by_provider() {
        let anthropic = Arc::new(ScriptedModel::new().respond_with("from anthropic"));
        let openai = Arc::new(ScriptedModel::new().respond_with("from openai"));
        let router = ModelRouter::empty()
            .with_provider(ProviderKind::Anthropic, anthropic.clone())
            .with_provider(ProviderKind::OpenAI, openai.clone());

        let out = router
            .generate(GenerateRequest {
                prompt: "hi",
                model_id: "api-haiku",
                max_tokens: 16,
            })
            .await
            .unwrap();
        assert_eq!(out, "from anthropic");
        assert_eq!(anthropic.models_called(), vec!["claude-haiku-4-5-20251001".to_string()]);

        let out = router
            .generate(GenerateRequest {
                prompt: "hi",
                model_id: "gpt-4o",
                max_tokens: 16,
            })
            .await
            .unwrap();
        assert_eq!(out, "from openai");
    }

    #[tokio::test]
    async fn test_router_without_provider_errors() {
        let router = ModelRouter::empty();
        let err = router
            .generate(GenerateRequest {
                prompt: "hi",
                model_id: "gpt-4o",
                max_tokens: 16,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }
}
