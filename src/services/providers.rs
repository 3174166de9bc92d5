// AI Provider Service
// Capability traits for emotion classification, rewriting and embeddings,
// plus OpenAI-compatible HTTP adapters implementing them

pub mod mock;

use crate::models::{EmotionLabel, ProviderUsage};
use crate::services::config_store::{AppConfig, ConfigStore};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
pub const DEEPSEEK_CHAT_URL: &str = "https://api.deepseek.com/chat/completions";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEEPSEEK_DEFAULT_MODEL: &str = "deepseek-chat";
pub const EMBEDDING_DEFAULT_MODEL: &str = "text-embedding-ada-002";

const CLASSIFY_MAX_TOKENS: i32 = 256;
const REWRITE_MAX_TOKENS: i32 = 4096;

/// Emotion analysis prompt. The label vocabulary matches `EmotionLabel`.
const EMOTION_SYSTEM_PROMPT: &str = r#"你是一个情感分析专家。你需要分析给定文本的情感强度，并给出0-5的评分。评分标准如下：
0: 完全中性或无情感
1: 轻微情感波动
2: 明显但温和的情感
3: 强烈的情感
4: 非常强烈的情感
5: 极其强烈的情感

同时，你需要给出主要情感类型，只能从以下列表中选择一个：
喜悦、愤怒、悲伤、惊讶、忧虑、恐惧、期待、满意、焦虑

请以JSON格式返回，包含以下字段：
- score: 情感强度评分（0-5的整数）
- emotion: 主要情感类型
- explanation: 简短解释（不超过50字）
只返回JSON，不要有其他文字。"#;

const REWRITE_SYSTEM_PROMPT: &str = r#"你是中文写作专家。请优化下面文本，使其更通顺流畅并消除语病，但需保持全部原意，并保持给定的情感基调。
如果发现经文引用或圣经章节，请严格按照《和合本》的格式和内容处理，不要修改这些部分。
请以JSON格式返回，包含以下字段：
- improved_text: 优化后的文本
- changes_made: 修改说明（如果没有修改则返回"无需修改"）
只返回JSON，不要有其他文字。"#;

// ============================================================================
// Errors
// ============================================================================

/// A provider response that breaks the caller's contract.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractViolation {
    #[error("classifier returned sentinel label {0:?}")]
    UnknownLabel(String),
    #[error("classifier label {0:?} is outside the accepted set")]
    LabelOutsideSet(String),
    #[error("emotion score {0} outside [0, 5]")]
    ScoreOutOfRange(f64),
    #[error("emotion score {0} is not an integer")]
    NonIntegerScore(f64),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("rewritten text dropped scripture reference {0:?}")]
    ReferenceDropped(String),
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Missing content in response")]
    MissingContent { usage: Option<ProviderUsage> },
    #[error("JSON parse error: {message}")]
    JsonError {
        message: String,
        usage: Option<ProviderUsage>,
    },
    #[error("API key not configured for {0}")]
    MissingApiKey(String),
    #[error("contract violation: {violation}")]
    Contract {
        violation: ContractViolation,
        usage: Option<ProviderUsage>,
    },
}

impl ProviderError {
    /// Whether another attempt against the same provider may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpError(_)
            | Self::RateLimited(_)
            | Self::Timeout(_)
            | Self::MissingContent { .. }
            | Self::JsonError { .. } => true,
            Self::ApiError { status, .. } => *status >= 500 || *status == 408,
            Self::MissingApiKey(_) | Self::Contract { .. } => false,
        }
    }

    /// Tokens the provider billed even though the call failed.
    pub fn charged_usage(&self) -> Option<&ProviderUsage> {
        match self {
            Self::MissingContent { usage }
            | Self::JsonError { usage, .. }
            | Self::Contract { usage, .. } => usage.as_ref(),
            _ => None,
        }
    }

    pub fn contract(violation: ContractViolation, usage: Option<ProviderUsage>) -> Self {
        Self::Contract { violation, usage }
    }
}

// ============================================================================
// Capability traits
// ============================================================================

/// Unvalidated classifier verdict. The label is checked against the
/// accepted set by the caller.
#[derive(Debug, Clone)]
pub struct ClassifierResponse {
    pub label: String,
    pub score: f64,
    pub explanation: Option<String>,
    pub usage: ProviderUsage,
}

#[derive(Debug, Clone)]
pub struct RewriteResponse {
    pub improved_text: String,
    pub changes_description: String,
    pub usage: ProviderUsage,
}

#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub vector: Vec<f32>,
    pub usage: ProviderUsage,
}

#[async_trait]
pub trait EmotionClassifier: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<ClassifierResponse, ProviderError>;

    /// Provider name for logs
    fn name(&self) -> &str;
}

#[async_trait]
pub trait TextRewriter: Send + Sync {
    async fn improve(
        &self,
        text: &str,
        emotion: EmotionLabel,
        score: f64,
    ) -> Result<RewriteResponse, ProviderError>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<EmbeddingResponse, ProviderError>;

    fn name(&self) -> &str;
}

/// Every external capability one pipeline needs.
#[derive(Clone)]
pub struct ProviderSet {
    pub primary: Arc<dyn EmotionClassifier>,
    pub secondary: Option<Arc<dyn EmotionClassifier>>,
    pub rewriter: Arc<dyn TextRewriter>,
    pub embedder: Arc<dyn EmbeddingProvider>,
}

// ============================================================================
// Provider specs and endpoints
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSpec {
    pub name: String,
    pub model: String,
}

/// Parse `name[:model]`.
pub fn parse_provider(spec: &str) -> ProviderSpec {
    let parts: Vec<&str> = spec.splitn(2, ':').collect();
    if parts.len() == 2 {
        ProviderSpec {
            name: parts[0].trim().to_string(),
            model: parts[1].trim().to_string(),
        }
    } else {
        ProviderSpec {
            name: spec.trim().to_string(),
            model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Chat,
    Embeddings,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub provider: String,
    pub url: String,
    pub model: String,
    pub api_key: String,
}

fn default_model(provider: &str, kind: EndpointKind) -> String {
    match (provider, kind) {
        (_, EndpointKind::Embeddings) => EMBEDDING_DEFAULT_MODEL.to_string(),
        ("deepseek", EndpointKind::Chat) => DEEPSEEK_DEFAULT_MODEL.to_string(),
        _ => OPENAI_DEFAULT_MODEL.to_string(),
    }
}

fn default_url(provider: &str, kind: EndpointKind) -> String {
    match (provider, kind) {
        ("deepseek", EndpointKind::Chat) => DEEPSEEK_CHAT_URL.to_string(),
        (_, EndpointKind::Embeddings) => OPENAI_EMBEDDINGS_URL.to_string(),
        _ => OPENAI_CHAT_URL.to_string(),
    }
}

/// Resolve a `name[:model]` spec into a callable endpoint. URL precedence:
/// config file, `<NAME>_API_URL` env var, built-in default. Key precedence:
/// environment, `config.api_keys`, then the stored config file.
pub fn resolve_endpoint(
    config: &AppConfig,
    spec: &str,
    kind: EndpointKind,
) -> Result<Endpoint, ProviderError> {
    resolve_endpoint_with(config, spec, kind, |key| env::var(key).ok())
}

/// `resolve_endpoint` with an explicit environment lookup.
pub fn resolve_endpoint_with(
    config: &AppConfig,
    spec: &str,
    kind: EndpointKind,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Endpoint, ProviderError> {
    let spec = parse_provider(spec);
    let provider_cfg = config.providers.get(&spec.name);

    let model = if !spec.model.is_empty() {
        spec.model.clone()
    } else {
        provider_cfg
            .and_then(|p| p.model.clone())
            .unwrap_or_else(|| default_model(&spec.name, kind))
    };

    let url = match kind {
        EndpointKind::Chat => provider_cfg.and_then(|p| p.base_url.clone()),
        EndpointKind::Embeddings => provider_cfg.and_then(|p| p.embeddings_url.clone()),
    }
    .or_else(|| {
        let var = match kind {
            EndpointKind::Chat => format!("{}_API_URL", spec.name.to_uppercase()),
            EndpointKind::Embeddings => format!("{}_EMBEDDINGS_URL", spec.name.to_uppercase()),
        };
        non_blank(env_lookup(&var))
    })
    .unwrap_or_else(|| default_url(&spec.name, kind));

    let api_key = env_api_key(&spec.name, &env_lookup)
        .or_else(|| non_blank(config.api_keys.get(&spec.name).cloned()))
        .or_else(|| stored_api_key(&spec.name))
        .ok_or_else(|| ProviderError::MissingApiKey(spec.name.clone()))?;

    Ok(Endpoint {
        provider: spec.name,
        url,
        model,
        api_key,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_api_key(provider: &str, env_lookup: &impl Fn(&str) -> Option<String>) -> Option<String> {
    let env_keys: &[&str] = match provider {
        "openai" => &["OPENAI_API_KEY", "SPEECHPROC_OPENAI_API_KEY"],
        "deepseek" => &["DEEPSEEK_API_KEY", "SPEECHPROC_DEEPSEEK_API_KEY"],
        _ => &[],
    };
    env_keys.iter().find_map(|key| non_blank(env_lookup(key)))
}

fn stored_api_key(provider: &str) -> Option<String> {
    let store = ConfigStore::new(ConfigStore::default_config_dir()?);
    non_blank(store.get_api_key(provider).ok().flatten())
}

/// Get API key from environment or config file
pub fn get_api_key(provider: &str) -> Option<String> {
    env_api_key(provider, &|key: &str| env::var(key).ok()).or_else(|| stored_api_key(provider))
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: i32,
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingDatum>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ChatResult {
    pub content: String,
    pub usage: ProviderUsage,
}

fn to_usage(model: &str, usage: Option<ApiUsage>) -> ProviderUsage {
    usage
        .map(|u| ProviderUsage::new(model, u.prompt_tokens, u.completion_tokens))
        .unwrap_or_else(|| ProviderUsage::new(model, 0, 0))
}

/// Shared reqwest client. Per-attempt timeouts are enforced by the retry
/// layer; this timeout only guards against hung sockets.
pub struct ProviderClient {
    client: Client,
}

impl Default for ProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_proxy(proxy_url: &str) -> Result<Self, ProviderError> {
        let proxy = reqwest::Proxy::all(proxy_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .proxy(proxy)
            .build()?;
        Ok(Self { client })
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited(body));
        }
        Err(ProviderError::ApiError {
            status: status.as_u16(),
            message: body,
        })
    }

    /// Chat completion forced into JSON-object output.
    pub async fn call_chat_json(
        &self,
        endpoint: &Endpoint,
        system: &str,
        user: &str,
        max_tokens: i32,
    ) -> Result<ChatResult, ProviderError> {
        let request = ChatRequest {
            model: endpoint.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens,
            temperature: 0.0,
            response_format: ResponseFormat {
                r#type: "json_object".to_string(),
            },
        };

        let start = Instant::now();
        let response = self
            .client
            .post(&endpoint.url)
            .header("Authorization", format!("Bearer {}", endpoint.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;
        let latency_ms = start.elapsed().as_millis() as i64;
        let response = Self::check_status(response).await?;

        let data: ChatResponse = response.json().await.map_err(|e| ProviderError::JsonError {
            message: e.to_string(),
            usage: None,
        })?;

        let usage = to_usage(&endpoint.model, data.usage);
        let content = data
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|c| !c.trim().is_empty());

        let Some(content) = content else {
            return Err(ProviderError::MissingContent { usage: Some(usage) });
        };

        debug!(
            provider = %endpoint.provider,
            model = %endpoint.model,
            latency_ms,
            total_tokens = usage.total_tokens,
            "provider.chat.ok"
        );

        Ok(ChatResult { content, usage })
    }

    pub async fn call_embeddings(
        &self,
        endpoint: &Endpoint,
        input: &str,
    ) -> Result<EmbeddingResponse, ProviderError> {
        let request = EmbeddingRequest {
            model: &endpoint.model,
            input,
        };

        let response = self
            .client
            .post(&endpoint.url)
            .header("Authorization", format!("Bearer {}", endpoint.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let data: EmbeddingApiResponse =
            response.json().await.map_err(|e| ProviderError::JsonError {
                message: e.to_string(),
                usage: None,
            })?;

        let usage = to_usage(&endpoint.model, data.usage);
        let vector = data
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or(ProviderError::MissingContent {
                usage: Some(usage.clone()),
            })?;

        Ok(EmbeddingResponse { vector, usage })
    }
}

/// Extract the outermost JSON object from model output.
pub fn extract_json(content: &str) -> String {
    let trimmed = content.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return trimmed[start..=end].to_string();
            }
        }
    }
    trimmed.to_string()
}

// ============================================================================
// Adapters
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmotionPayload {
    emotion: String,
    score: f64,
    #[serde(default)]
    explanation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RewritePayload {
    improved_text: String,
    #[serde(default)]
    changes_made: Option<String>,
}

pub struct ChatEmotionClassifier {
    client: Arc<ProviderClient>,
    endpoint: Endpoint,
}

impl ChatEmotionClassifier {
    pub fn new(client: Arc<ProviderClient>, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl EmotionClassifier for ChatEmotionClassifier {
    async fn analyze(&self, text: &str) -> Result<ClassifierResponse, ProviderError> {
        let chat = self
            .client
            .call_chat_json(&self.endpoint, EMOTION_SYSTEM_PROMPT, text, CLASSIFY_MAX_TOKENS)
            .await?;

        let json = extract_json(&chat.content);
        let payload: EmotionPayload =
            serde_json::from_str(&json).map_err(|e| ProviderError::JsonError {
                message: format!("{} content={}", e, json),
                usage: Some(chat.usage.clone()),
            })?;

        Ok(ClassifierResponse {
            label: payload.emotion,
            score: payload.score,
            explanation: payload.explanation,
            usage: chat.usage,
        })
    }

    fn name(&self) -> &str {
        &self.endpoint.provider
    }
}

pub struct ChatTextRewriter {
    client: Arc<ProviderClient>,
    endpoint: Endpoint,
}

impl ChatTextRewriter {
    pub fn new(client: Arc<ProviderClient>, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl TextRewriter for ChatTextRewriter {
    async fn improve(
        &self,
        text: &str,
        emotion: EmotionLabel,
        score: f64,
    ) -> Result<RewriteResponse, ProviderError> {
        let user_prompt = format!(
            "情感基调：{}（强度 {}）\n\n请优化以下文本，并以JSON格式返回结果：\n\n{}",
            emotion, score, text
        );
        let chat = self
            .client
            .call_chat_json(&self.endpoint, REWRITE_SYSTEM_PROMPT, &user_prompt, REWRITE_MAX_TOKENS)
            .await?;

        let json = extract_json(&chat.content);
        let payload: RewritePayload =
            serde_json::from_str(&json).map_err(|e| ProviderError::JsonError {
                message: format!("{} content={}", e, json),
                usage: Some(chat.usage.clone()),
            })?;

        Ok(RewriteResponse {
            improved_text: payload.improved_text,
            changes_description: payload.changes_made.unwrap_or_default(),
            usage: chat.usage,
        })
    }

    fn name(&self) -> &str {
        &self.endpoint.provider
    }
}

pub struct HttpEmbeddingProvider {
    client: Arc<ProviderClient>,
    endpoint: Endpoint,
}

impl HttpEmbeddingProvider {
    pub fn new(client: Arc<ProviderClient>, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<EmbeddingResponse, ProviderError> {
        self.client.call_embeddings(&self.endpoint, text).await
    }

    fn name(&self) -> &str {
        &self.endpoint.provider
    }
}

impl ProviderSet {
    /// Build HTTP-backed providers from the configured role specs.
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let proxy_url = config
            .proxy
            .as_ref()
            .filter(|p| p.enabled)
            .and_then(|p| p.https.as_deref().or(p.http.as_deref()))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty());

        let client = Arc::new(match proxy_url {
            Some(p) => ProviderClient::with_proxy(p)?,
            None => ProviderClient::new(),
        });

        let roles = &config.roles;
        let primary = resolve_endpoint(config, &roles.classifier, EndpointKind::Chat)?;
        let secondary = match roles.fallback_classifier.as_deref() {
            Some(spec) if !spec.trim().is_empty() => {
                Some(resolve_endpoint(config, spec, EndpointKind::Chat)?)
            }
            _ => None,
        };
        let rewriter = resolve_endpoint(config, &roles.rewriter, EndpointKind::Chat)?;
        let embedder = resolve_endpoint(config, &roles.embedding, EndpointKind::Embeddings)?;

        Ok(Self {
            primary: Arc::new(ChatEmotionClassifier::new(client.clone(), primary)),
            secondary: secondary.map(|e| {
                Arc::new(ChatEmotionClassifier::new(client.clone(), e)) as Arc<dyn EmotionClassifier>
            }),
            rewriter: Arc::new(ChatTextRewriter::new(client.clone(), rewriter)),
            embedder: Arc::new(HttpEmbeddingProvider::new(client, embedder)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider() {
        let spec = parse_provider("deepseek:deepseek-chat");
        assert_eq!(spec.name, "deepseek");
        assert_eq!(spec.model, "deepseek-chat");

        let spec2 = parse_provider("openai");
        assert_eq!(spec2.name, "openai");
        assert_eq!(spec2.model, "");
    }

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::RateLimited("slow down".into()).is_transient());
        assert!(ProviderError::ApiError { status: 503, message: String::new() }.is_transient());
        assert!(!ProviderError::ApiError { status: 401, message: String::new() }.is_transient());
        assert!(!ProviderError::MissingApiKey("openai".into()).is_transient());

        let violation = ProviderError::contract(
            ContractViolation::UnknownLabel("unknown".into()),
            Some(ProviderUsage::new("gpt-3.5-turbo", 10, 5)),
        );
        assert!(!violation.is_transient());
        assert_eq!(violation.charged_usage().map(|u| u.total_tokens), Some(15));
    }

    #[test]
    fn test_extract_json_strips_fences() {
        let content = "```json\n{\"emotion\": \"喜悦\", \"score\": 3}\n```";
        assert_eq!(extract_json(content), "{\"emotion\": \"喜悦\", \"score\": 3}");
    }

    #[test]
    fn test_emotion_payload_is_strict() {
        let ok: Result<EmotionPayload, _> =
            serde_json::from_str(r#"{"emotion":"喜悦","score":3,"explanation":"开心"}"#);
        assert!(ok.is_ok());
        let missing: Result<EmotionPayload, _> = serde_json::from_str(r#"{"emotion":"喜悦"}"#);
        assert!(missing.is_err());
        let string_score: Result<EmotionPayload, _> =
            serde_json::from_str(r#"{"emotion":"喜悦","score":"3"}"#);
        assert!(string_score.is_err());
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_resolve_endpoint_uses_config_key_and_defaults() {
        let mut config = AppConfig::default();
        config
            .api_keys
            .insert("deepseek".to_string(), "sk-test".to_string());
        let endpoint =
            resolve_endpoint_with(&config, "deepseek", EndpointKind::Chat, env(&[])).unwrap();
        assert_eq!(endpoint.model, DEEPSEEK_DEFAULT_MODEL);
        assert_eq!(endpoint.api_key, "sk-test");
        assert_eq!(endpoint.url, DEEPSEEK_CHAT_URL);
    }

    #[test]
    fn test_env_key_wins_over_config_key() {
        let mut config = AppConfig::default();
        config
            .api_keys
            .insert("openai".to_string(), "sk-from-file".to_string());
        let endpoint = resolve_endpoint_with(
            &config,
            "openai",
            EndpointKind::Chat,
            env(&[("OPENAI_API_KEY", " sk-from-env ")]),
        )
        .unwrap();
        assert_eq!(endpoint.api_key, "sk-from-env");

        // Blank env values fall through to the file key
        let endpoint = resolve_endpoint_with(
            &config,
            "openai",
            EndpointKind::Chat,
            env(&[("OPENAI_API_KEY", "  ")]),
        )
        .unwrap();
        assert_eq!(endpoint.api_key, "sk-from-file");
    }

    #[test]
    fn test_blank_config_key_is_missing() {
        let mut config = AppConfig::default();
        config
            .api_keys
            .insert("speechproc-test-local".to_string(), "   ".to_string());
        let err = resolve_endpoint_with(
            &config,
            "speechproc-test-local:local-model",
            EndpointKind::Chat,
            env(&[]),
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::MissingApiKey(ref name) if name == "speechproc-test-local"));
    }

    #[test]
    fn test_url_env_override() {
        let mut config = AppConfig::default();
        config
            .api_keys
            .insert("deepseek".to_string(), "sk-test".to_string());
        let endpoint = resolve_endpoint_with(
            &config,
            "deepseek",
            EndpointKind::Chat,
            env(&[("DEEPSEEK_API_URL", "http://localhost:9000/chat")]),
        )
        .unwrap();
        assert_eq!(endpoint.url, "http://localhost:9000/chat");
    }
}
