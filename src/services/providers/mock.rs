// Scripted providers for tests and offline runs

use super::{
    ClassifierResponse, ContractViolation, EmbeddingProvider, EmbeddingResponse,
    EmotionClassifier, ProviderError, RewriteResponse, TextRewriter,
};
use crate::models::{EmotionLabel, ProviderUsage};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub const MOCK_CHAT_MODEL: &str = "gpt-3.5-turbo";
pub const MOCK_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
const MOCK_EMBEDDING_DIM: usize = 256;

/// Failure a scripted provider should produce.
#[derive(Debug, Clone)]
pub enum MockFailure {
    RateLimited,
    ServerError,
    Unauthorized,
    /// Malformed body that still billed `charged` prompt tokens.
    Malformed { charged: u64 },
    /// Sleep before answering, long enough to trip a timeout.
    Hang(Duration),
}

impl MockFailure {
    fn into_error(self, model: &str) -> ProviderError {
        match self {
            Self::RateLimited => ProviderError::RateLimited("scripted 429".to_string()),
            Self::ServerError => ProviderError::ApiError {
                status: 503,
                message: "scripted outage".to_string(),
            },
            Self::Unauthorized => ProviderError::ApiError {
                status: 401,
                message: "scripted auth failure".to_string(),
            },
            Self::Malformed { charged } => ProviderError::JsonError {
                message: "scripted malformed body".to_string(),
                usage: Some(ProviderUsage::new(model, charged, 0)),
            },
            Self::Hang(_) => ProviderError::Timeout(Duration::ZERO),
        }
    }
}

/// One scripted classifier answer.
#[derive(Debug, Clone)]
pub enum ClassifierStep {
    Reply { label: String, score: f64 },
    Fail(MockFailure),
}

impl ClassifierStep {
    pub fn reply(label: &str, score: f64) -> Self {
        Self::Reply {
            label: label.to_string(),
            score,
        }
    }
}

type Responder = Box<dyn Fn(&str) -> ClassifierStep + Send + Sync>;
type Delay = Box<dyn Fn(&str) -> Duration + Send + Sync>;

async fn pause(delay: &Option<Delay>, text: &str) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay(text)).await;
    }
}

/// Classifier that plays back queued steps, then falls back to a responder.
pub struct ScriptedClassifier {
    name: String,
    model: String,
    script: Mutex<VecDeque<ClassifierStep>>,
    responder: Responder,
    delay: Option<Delay>,
    calls: AtomicU32,
}

impl ScriptedClassifier {
    pub fn new(name: &str, responder: impl Fn(&str) -> ClassifierStep + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            model: MOCK_CHAT_MODEL.to_string(),
            script: Mutex::new(VecDeque::new()),
            responder: Box::new(responder),
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Always answer with the same label and score.
    pub fn constant(name: &str, label: &str, score: f64) -> Self {
        let step = ClassifierStep::reply(label, score);
        Self::new(name, move |_| step.clone())
    }

    /// Always fail the same way.
    pub fn failing(name: &str, failure: MockFailure) -> Self {
        Self::new(name, move |_| ClassifierStep::Fail(failure.clone()))
    }

    /// First matching keyword decides the label; otherwise `default`.
    pub fn keywords(name: &str, rules: &[(&str, EmotionLabel, f64)], default: (EmotionLabel, f64)) -> Self {
        let rules: Vec<(String, EmotionLabel, f64)> = rules
            .iter()
            .map(|(k, l, s)| (k.to_string(), *l, *s))
            .collect();
        Self::new(name, move |text| {
            let (label, score) = rules
                .iter()
                .find(|(k, _, _)| text.contains(k.as_str()))
                .map(|(_, l, s)| (*l, *s))
                .unwrap_or(default);
            ClassifierStep::reply(label.as_zh(), score)
        })
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Wait before every answer, per input text.
    pub fn with_delay(mut self, delay: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    /// Queue steps that take precedence over the responder.
    pub fn then(self, step: ClassifierStep) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmotionClassifier for ScriptedClassifier {
    async fn analyze(&self, text: &str) -> Result<ClassifierResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let queued = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let step = queued.unwrap_or_else(|| (self.responder)(text));
        pause(&self.delay, text).await;

        match step {
            ClassifierStep::Reply { label, score } => Ok(ClassifierResponse {
                label,
                score,
                explanation: None,
                usage: ProviderUsage::new(&self.model, text.chars().count() as u64, 5),
            }),
            ClassifierStep::Fail(MockFailure::Hang(d)) => {
                tokio::time::sleep(d).await;
                Err(MockFailure::Hang(d).into_error(&self.model))
            }
            ClassifierStep::Fail(failure) => Err(failure.into_error(&self.model)),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

type Transform = Box<dyn Fn(&str) -> String + Send + Sync>;

enum RewriteMode {
    Echo,
    Transform(Transform),
    Fail(MockFailure),
}

pub struct ScriptedRewriter {
    mode: RewriteMode,
    delay: Option<Delay>,
    calls: AtomicU32,
}

impl ScriptedRewriter {
    /// Returns the input unchanged with "无需修改".
    pub fn echo() -> Self {
        Self {
            mode: RewriteMode::Echo,
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn transform(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            mode: RewriteMode::Transform(Box::new(f)),
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(failure: MockFailure) -> Self {
        Self {
            mode: RewriteMode::Fail(failure),
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Wait before every answer, per input text.
    pub fn with_delay(mut self, delay: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextRewriter for ScriptedRewriter {
    async fn improve(
        &self,
        text: &str,
        _emotion: EmotionLabel,
        _score: f64,
    ) -> Result<RewriteResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pause(&self.delay, text).await;
        let usage = ProviderUsage::new(MOCK_CHAT_MODEL, text.chars().count() as u64, 8);
        match &self.mode {
            RewriteMode::Echo => Ok(RewriteResponse {
                improved_text: text.to_string(),
                changes_description: "无需修改".to_string(),
                usage,
            }),
            RewriteMode::Transform(f) => {
                let improved = f(text);
                let changes = if improved == text {
                    "无需修改".to_string()
                } else {
                    "调整了措辞".to_string()
                };
                Ok(RewriteResponse {
                    improved_text: improved,
                    changes_description: changes,
                    usage,
                })
            }
            RewriteMode::Fail(MockFailure::Hang(d)) => {
                tokio::time::sleep(*d).await;
                Err(MockFailure::Hang(*d).into_error(MOCK_CHAT_MODEL))
            }
            RewriteMode::Fail(failure) => Err(failure.clone().into_error(MOCK_CHAT_MODEL)),
        }
    }

    fn name(&self) -> &str {
        "mock-rewriter"
    }
}

/// Embedder with fixed vectors for chosen texts. Any other distinct text
/// gets its own one-hot vector, so unrelated texts never look similar.
pub struct MapEmbedder {
    fixed: HashMap<String, Vec<f32>>,
    assigned: Mutex<HashMap<String, usize>>,
    failure: Option<MockFailure>,
    calls: AtomicU32,
}

impl Default for MapEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl MapEmbedder {
    pub fn new() -> Self {
        Self {
            fixed: HashMap::new(),
            assigned: Mutex::new(HashMap::new()),
            failure: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(failure: MockFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new()
        }
    }

    pub fn with_vector(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.fixed.insert(text.to_string(), vector);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn one_hot(&self, text: &str) -> Vec<f32> {
        let mut assigned = self.assigned.lock().unwrap_or_else(PoisonError::into_inner);
        let next = assigned.len();
        let slot = *assigned.entry(text.to_string()).or_insert(next) % MOCK_EMBEDDING_DIM;
        let mut v = vec![0.0; MOCK_EMBEDDING_DIM];
        v[slot] = 1.0;
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MapEmbedder {
    async fn embed(&self, text: &str) -> Result<EmbeddingResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = &self.failure {
            return Err(failure.clone().into_error(MOCK_EMBEDDING_MODEL));
        }
        let vector = match self.fixed.get(text) {
            Some(v) => v.clone(),
            None => self.one_hot(text),
        };
        Ok(EmbeddingResponse {
            vector,
            usage: ProviderUsage::new(MOCK_EMBEDDING_MODEL, text.chars().count() as u64, 0),
        })
    }

    fn name(&self) -> &str {
        "mock-embedder"
    }
}

/// Convenience for asserting on violations in tests.
pub fn violation_of(err: &ProviderError) -> Option<&ContractViolation> {
    match err {
        ProviderError::Contract { violation, .. } => Some(violation),
        _ => None,
    }
}
