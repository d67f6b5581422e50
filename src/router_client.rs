//! Router Client Module
//!
//! The recommendation oracle scores candidate models for a prompt. Modelrelay never
//! embeds that policy in the request path; it asks a `RouterClient` and then applies
//! its own deterministic resolution (see `routing`).
//!
//! ## Architecture
//!
//! - `RouterClient` trait: thin recommendation interface
//! - `HttpRouterClient`: remote oracle over HTTP (`POST {url}/recommend`)
//! - `LocalPolicyRouter`: embedded catalog ranking for single-binary deployments

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::models::TokenUsage;

/// A model proposed by the oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCandidate {
    /// Model identifier sent to the vendor
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Vendor identifier (e.g. "openai", "anthropic")
    pub vendor: String,

    /// Oracle score in [0, 1]
    #[serde(default)]
    pub score: f64,

    /// Short rationale for the score
    #[serde(default, alias = "reasoning_summary")]
    pub reasoning: String,
}

/// Returned instead of a usable ranking when the oracle declines the task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsupportedTask {
    pub category: String,
    pub message: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
}

/// Oracle response.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub primary: ModelCandidate,

    #[serde(default)]
    pub backups: Vec<ModelCandidate>,

    #[serde(default)]
    pub analysis: String,

    #[serde(default)]
    pub confidence: f64,

    /// Hint shown to the client when a better model exists on a higher tier
    pub upgrade_hint: Option<String>,

    /// Present when the oracle declines the request
    pub unsupported: Option<UnsupportedTask>,
}

impl Recommendation {
    /// Primary followed by backups, in oracle order.
    pub fn candidates(&self) -> impl Iterator<Item = &ModelCandidate> {
        std::iter::once(&self.primary).chain(self.backups.iter())
    }
}

/// Request sent to the oracle.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendRequest {
    /// Unique request identifier for traceability
    pub request_id: String,

    /// The user's prompt
    pub prompt: String,

    /// Requested modality ("text", "image", "code", ...)
    #[serde(default = "default_modality")]
    pub modality: String,

    /// Caller tier ("free", "pro", "enterprise")
    #[serde(default = "default_tier")]
    pub tier: String,

    /// Vendors that currently have credentials configured
    #[serde(default)]
    pub available_providers: Vec<String>,

    /// Model that answered the previous turn, for conversational coherence
    pub previous_model: Option<String>,

    /// Rough prompt size estimate
    pub estimated_prompt_tokens: Option<u32>,
}

fn default_modality() -> String {
    "text".to_string()
}

fn default_tier() -> String {
    "free".to_string()
}

impl RecommendRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        let uuid_str = uuid::Uuid::new_v4().simple().to_string();
        Self {
            request_id: format!("req_{}", &uuid_str[..16]),
            estimated_prompt_tokens: Some(estimate_tokens(&prompt)),
            prompt,
            modality: default_modality(),
            tier: default_tier(),
            available_providers: Vec::new(),
            previous_model: None,
        }
    }
}

/// Feedback sent to the oracle after a request completes.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteFeedback {
    pub request_id: String,
    pub model_id: String,
    pub vendor: String,
    pub success: bool,
    pub duration_ms: Option<u64>,
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Router error types
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Router timeout: {0}")]
    Timeout(String),

    #[error("Router unavailable: {0}")]
    Unavailable(String),

    #[error("No route found: {0}")]
    NoRoute(String),

    #[error("Router error: {0}")]
    RouterError(String),

    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Main RouterClient trait - thin recommendation interface
#[async_trait]
pub trait RouterClient: Send + Sync {
    /// Rank candidate models for a prompt
    async fn recommend(&self, req: &RecommendRequest) -> Result<Recommendation, RouteError>;

    /// Send feedback after request (optional, async)
    fn feedback(&self, fb: &RouteFeedback) -> Result<(), RouteError> {
        let _ = fb;
        Ok(())
    }
}

/// HTTP Router client configuration
#[derive(Debug, Clone)]
pub struct HttpRouterConfig {
    /// Router base URL
    pub url: String,

    /// Request timeout in milliseconds
    pub timeout_ms: u64,

    /// HTTP client (shared)
    pub client: Option<reqwest::Client>,
}

impl Default for HttpRouterConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090".to_string(),
            timeout_ms: 2_000,
            client: None,
        }
    }
}

/// HTTP-based Router client (remote)
pub struct HttpRouterClient {
    config: HttpRouterConfig,
    client: reqwest::Client,
}

impl HttpRouterClient {
    /// Create new HTTP router client
    pub fn new(mut config: HttpRouterConfig) -> Result<Self> {
        let client = if let Some(c) = config.client.take() {
            c
        } else {
            reqwest::Client::builder()
                .timeout(Duration::from_millis(config.timeout_ms))
                .pool_idle_timeout(Duration::from_secs(60))
                .pool_max_idle_per_host(10)
                .build()?
        };

        Ok(Self { config, client })
    }

    async fn recommend_async(&self, req: &RecommendRequest) -> Result<Recommendation, RouteError> {
        let url = format!("{}/recommend", self.config.url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RouteError::Timeout(e.to_string())
                } else {
                    RouteError::NetworkError(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(RouteError::RouterError(format!(
                "Router returned {}: {}",
                status, body
            )));
        }

        response
            .json::<Recommendation>()
            .await
            .map_err(|e| RouteError::RouterError(format!("Failed to parse recommendation: {}", e)))
    }
}

#[async_trait]
impl RouterClient for HttpRouterClient {
    async fn recommend(&self, req: &RecommendRequest) -> Result<Recommendation, RouteError> {
        self.recommend_async(req).await.map_err(|e| match e {
            RouteError::NetworkError(_) => RouteError::Unavailable(e.to_string()),
            other => other,
        })
    }

    fn feedback(&self, fb: &RouteFeedback) -> Result<(), RouteError> {
        let runtime = Handle::try_current().ok();
        if let Some(rt) = runtime {
            // Spawn non-blocking
            let client = self.client.clone();
            let url = format!("{}/feedback", self.config.url.trim_end_matches('/'));
            let fb = fb.clone();
            rt.spawn(async move {
                if let Err(e) = client.post(&url).json(&fb).send().await {
                    tracing::debug!("Router feedback not delivered: {}", e);
                }
            });
        }
        Ok(())
    }
}

/// Caller tier, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl UserTier {
    /// Lenient parse; unknown values fall back to `Free`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pro" | "plus" | "premium" => UserTier::Pro,
            "enterprise" | "team" => UserTier::Enterprise,
            _ => UserTier::Free,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserTier::Free => "free",
            UserTier::Pro => "pro",
            UserTier::Enterprise => "enterprise",
        }
    }
}

/// Model catalog entry for the embedded router
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogModel {
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub vendor: String,

    /// Baseline quality score in [0, 1]
    pub quality: f64,

    /// Supported modalities (e.g., ["text", "code"])
    #[serde(default = "default_modalities")]
    pub modalities: Vec<String>,

    /// Lowest tier allowed to use this model
    #[serde(default)]
    pub min_tier: UserTier,

    /// Usage notes, surfaced as the candidate's reasoning
    #[serde(default)]
    pub notes: String,
}

fn default_modalities() -> Vec<String> {
    vec!["text".to_string()]
}


/// id, display name, vendor, quality, modalities, minimum tier, notes
type BuiltinEntry = (
    &'static str,
    &'static str,
    &'static str,
    f64,
    &'static [&'static str],
    UserTier,
    &'static str,
);

const MULTIMODAL: &[&str] = &["text", "code", "image"];
const TEXT_CODE: &[&str] = &["text", "code"];

const BUILTIN_CATALOG: &[BuiltinEntry] = &[
    (
        "claude-opus-4",
        "Claude Opus 4",
        "anthropic",
        0.95,
        MULTIMODAL,
        UserTier::Enterprise,
        "Deepest reasoning, highest cost",
    ),
    (
        "gpt-4.1",
        "GPT-4.1",
        "openai",
        0.9,
        MULTIMODAL,
        UserTier::Pro,
        "Strong general model with long context",
    ),
    (
        "claude-sonnet-4",
        "Claude Sonnet 4",
        "anthropic",
        0.9,
        MULTIMODAL,
        UserTier::Pro,
        "Careful writing and coding",
    ),
    (
        "gemini-2.5-pro",
        "Gemini 2.5 Pro",
        "google",
        0.88,
        MULTIMODAL,
        UserTier::Pro,
        "Large context, grounded search",
    ),
    (
        "o4-mini",
        "o4-mini",
        "openai",
        0.84,
        TEXT_CODE,
        UserTier::Free,
        "Fast reasoning",
    ),
    (
        "gemini-2.5-flash",
        "Gemini 2.5 Flash",
        "google",
        0.8,
        MULTIMODAL,
        UserTier::Free,
        "Fast and inexpensive",
    ),
    (
        "gpt-4.1-mini",
        "GPT-4.1 mini",
        "openai",
        0.78,
        MULTIMODAL,
        UserTier::Free,
        "Inexpensive general model",
    ),
    (
        "claude-3-5-haiku",
        "Claude 3.5 Haiku",
        "anthropic",
        0.74,
        TEXT_CODE,
        UserTier::Free,
        "Low latency",
    ),
    (
        "anthropic.claude-3-5-sonnet-20240620-v1:0",
        "Claude 3.5 Sonnet (Bedrock)",
        "bedrock",
        0.82,
        TEXT_CODE,
        UserTier::Pro,
        "Served through AWS Bedrock",
    ),
];

/// Model catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCatalog {
    pub models: Vec<CatalogModel>,
}

impl ModelCatalog {
    /// Load a catalog from JSON or YAML (chosen by file extension).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let catalog = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        Ok(catalog)
    }

    /// Built-in catalog covering every supported vendor.
    pub fn builtin() -> Self {
        let models = BUILTIN_CATALOG
            .iter()
            .map(|&(id, name, vendor, quality, modalities, min_tier, notes)| CatalogModel {
                id: id.to_string(),
                name: name.to_string(),
                vendor: vendor.to_string(),
                quality,
                modalities: modalities.iter().map(|m| m.to_string()).collect(),
                min_tier,
                notes: notes.to_string(),
            })
            .collect();
        Self { models }
    }
}

const COHERENCE_BONUS: f64 = 0.05;
const MAX_BACKUPS: usize = 3;

/// Simple local policy router for embedded deployments
pub struct LocalPolicyRouter {
    catalog: ModelCatalog,
}

impl LocalPolicyRouter {
    pub fn new(catalog: ModelCatalog) -> Self {
        Self { catalog }
    }

    /// Load from a JSON or YAML catalog file
    pub fn from_file(path: &str) -> Result<Self> {
        Ok(Self::new(ModelCatalog::from_file(path)?))
    }

    pub fn builtin() -> Self {
        Self::new(ModelCatalog::builtin())
    }

    fn plan_local(&self, req: &RecommendRequest) -> Result<Recommendation, RouteError> {
        if self.catalog.models.is_empty() {
            return Err(RouteError::NoRoute("model catalog is empty".to_string()));
        }

        let modality = req.modality.trim().to_ascii_lowercase();
        let tier = UserTier::parse(&req.tier);

        let supporting: Vec<&CatalogModel> = self
            .catalog
            .models
            .iter()
            .filter(|m| m.modalities.iter().any(|x| x.eq_ignore_ascii_case(&modality)))
            .collect();

        if supporting.is_empty() {
            let mut alternatives: Vec<String> = Vec::new();
            for m in &self.catalog.models {
                for x in &m.modalities {
                    if !alternatives.contains(x) {
                        alternatives.push(x.clone());
                    }
                }
            }
            return Ok(Recommendation {
                primary: to_candidate(&self.catalog.models[0], self.catalog.models[0].quality),
                backups: Vec::new(),
                analysis: format!("No catalog model supports '{}'", modality),
                confidence: 0.0,
                upgrade_hint: None,
                unsupported: Some(UnsupportedTask {
                    category: modality.clone(),
                    message: format!("The '{}' modality is not supported", modality),
                    alternatives,
                }),
            });
        }

        let (allowed, locked): (Vec<&CatalogModel>, Vec<&CatalogModel>) =
            supporting.into_iter().partition(|m| m.min_tier <= tier);

        if allowed.is_empty() {
            return Err(RouteError::NoRoute(format!(
                "no '{}' model is available on the {} tier",
                modality,
                tier.as_str()
            )));
        }

        let available: HashSet<&str> = req.available_providers.iter().map(String::as_str).collect();

        let mut ranked: Vec<(f64, bool, &CatalogModel)> = allowed
            .into_iter()
            .map(|m| {
                let mut score = m.quality;
                if req.previous_model.as_deref() == Some(m.id.as_str()) {
                    score = (score + COHERENCE_BONUS).min(1.0);
                }
                let usable = available.is_empty() || available.contains(m.vendor.as_str());
                (score, usable, m)
            })
            .collect();

        // Stable: ties keep catalog order.
        ranked.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then(b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal))
        });

        let (primary_score, _, primary_model) = ranked[0];
        let primary = to_candidate(primary_model, primary_score);
        let backups: Vec<ModelCandidate> = ranked
            .iter()
            .skip(1)
            .take(MAX_BACKUPS)
            .map(|(score, _, m)| to_candidate(m, *score))
            .collect();

        let upgrade_hint = locked
            .iter()
            .filter(|m| m.quality > primary_model.quality)
            .max_by(|a, b| a.quality.partial_cmp(&b.quality).unwrap_or(std::cmp::Ordering::Equal))
            .map(|m| format!("{} is available on the {} tier", m.id, m.min_tier.as_str()));

        let runner_up = backups.first().map(|b| b.score).unwrap_or(0.0);
        Ok(Recommendation {
            analysis: format!(
                "{} ranked first of {} '{}' candidates for the {} tier",
                primary.id,
                ranked.len(),
                modality,
                tier.as_str()
            ),
            confidence: ((primary.score + (primary.score - runner_up)) / 2.0).clamp(0.0, 1.0),
            primary,
            backups,
            upgrade_hint,
            unsupported: None,
        })
    }
}

#[async_trait]
impl RouterClient for LocalPolicyRouter {
    async fn recommend(&self, req: &RecommendRequest) -> Result<Recommendation, RouteError> {
        self.plan_local(req)
    }
}

fn to_candidate(model: &CatalogModel, score: f64) -> ModelCandidate {
    ModelCandidate {
        id: model.id.clone(),
        name: if model.name.is_empty() {
            model.id.clone()
        } else {
            model.name.clone()
        },
        vendor: model.vendor.clone(),
        score,
        reasoning: model.notes.clone(),
    }
}

/// SHA-256 fingerprint of a prompt, used in routing logs instead of raw content.
pub fn prompt_fingerprint(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

/// Rough token estimation (4 chars per token)
fn estimate_tokens(prompt: &str) -> u32 {
    ((prompt.len() / 4) as u32).max(1)
}
