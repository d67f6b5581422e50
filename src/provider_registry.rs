//! Backend registry
//!
//! Decides which vendors are usable (a credential is configured) and hands out one
//! adapter per vendor. Construction happens at most once per vendor: each vendor has
//! its own `OnceCell`, and a construction that fails is not cached, so a credential
//! configured later is picked up on the next call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::provider::{ProviderAdapter, ProviderError, Vendor};
use crate::provider_anthropic::{AnthropicAdapter, DEFAULT_ANTHROPIC_BASE_URL};
use crate::provider_bedrock::BedrockAdapter;
use crate::provider_gemini::{GeminiAdapter, DEFAULT_GEMINI_BASE_URL};
use crate::provider_openai::{OpenAiAdapter, DEFAULT_OPENAI_BASE_URL};

/// What the orchestrator and chat service need from a registry. Tests implement this
/// with scripted adapters.
pub trait ProviderSource: Send + Sync {
    /// Vendors with a configured credential, evaluated at call time.
    fn usable_vendors(&self) -> HashSet<Vendor>;

    fn adapter(&self, vendor_id: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError>;

    /// Per-vendor usability, as reported by `/v1/providers`.
    fn status(&self) -> Vec<ProviderStatus> {
        let usable = self.usable_vendors();
        Vendor::ALL
            .iter()
            .map(|&vendor| ProviderStatus {
                vendor,
                usable: usable.contains(&vendor),
                constructed: false,
            })
            .collect()
    }
}

/// Source of per-vendor credentials.
pub trait CredentialSource: Send + Sync {
    /// Credential for the vendor, if any. Bedrock credentials are resolved by the AWS
    /// SDK; the returned value only signals that a chain is configured.
    fn credential(&self, vendor: Vendor) -> Option<String>;
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Reads credentials from the process environment on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn credential(&self, vendor: Vendor) -> Option<String> {
        match vendor {
            Vendor::OpenAi => non_empty_var("OPENAI_API_KEY"),
            Vendor::Anthropic => non_empty_var("ANTHROPIC_API_KEY"),
            Vendor::Google => {
                non_empty_var("GEMINI_API_KEY").or_else(|| non_empty_var("GOOGLE_API_KEY"))
            }
            Vendor::Bedrock => non_empty_var("AWS_ACCESS_KEY_ID")
                .or_else(|| non_empty_var("AWS_PROFILE").map(|p| format!("profile:{}", p))),
        }
    }
}

/// Mutable in-memory credentials, for embedding and tests.
#[derive(Debug, Default)]
pub struct FixedCredentials {
    keys: RwLock<HashMap<Vendor, String>>,
}

impl FixedCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, vendor: Vendor, key: impl Into<String>) -> Self {
        self.set(vendor, key);
        self
    }

    pub fn set(&self, vendor: Vendor, key: impl Into<String>) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(vendor, key.into());
        }
    }

    pub fn revoke(&self, vendor: Vendor) {
        if let Ok(mut keys) = self.keys.write() {
            keys.remove(&vendor);
        }
    }
}

impl CredentialSource for FixedCredentials {
    fn credential(&self, vendor: Vendor) -> Option<String> {
        self.keys
            .read()
            .ok()
            .and_then(|keys| keys.get(&vendor).cloned())
            .filter(|k| !k.trim().is_empty())
    }
}

/// Vendor endpoints. Base URLs are overridable for proxies and mock upstreams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub openai_base_url: String,
    pub anthropic_base_url: String,
    pub gemini_base_url: String,
    pub bedrock_region: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            anthropic_base_url: DEFAULT_ANTHROPIC_BASE_URL.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            bedrock_region: "us-east-1".to_string(),
        }
    }
}

impl ProviderEndpoints {
    /// Load from `OPENAI_BASE_URL`, `ANTHROPIC_BASE_URL`, `GEMINI_BASE_URL` and `AWS_REGION`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            openai_base_url: non_empty_var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            anthropic_base_url: non_empty_var("ANTHROPIC_BASE_URL")
                .unwrap_or(defaults.anthropic_base_url),
            gemini_base_url: non_empty_var("GEMINI_BASE_URL").unwrap_or(defaults.gemini_base_url),
            bedrock_region: BedrockAdapter::region_from_env(),
        }
    }
}

/// Usability and construction state of one vendor.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProviderStatus {
    pub vendor: Vendor,
    pub usable: bool,
    pub constructed: bool,
}

/// Lazily constructed, process-wide adapter cache.
pub struct ProviderRegistry {
    credentials: Arc<dyn CredentialSource>,
    http: reqwest::Client,
    endpoints: ProviderEndpoints,
    cache: [OnceCell<Arc<dyn ProviderAdapter>>; 4],
}

impl ProviderRegistry {
    pub fn new(
        credentials: Arc<dyn CredentialSource>,
        http: reqwest::Client,
        endpoints: ProviderEndpoints,
    ) -> Self {
        Self {
            credentials,
            http,
            endpoints,
            cache: Default::default(),
        }
    }

    /// Environment credentials and endpoints.
    pub fn from_env(http: reqwest::Client) -> Self {
        Self::new(Arc::new(EnvCredentials), http, ProviderEndpoints::from_env())
    }

    fn slot(vendor: Vendor) -> usize {
        match vendor {
            Vendor::OpenAi => 0,
            Vendor::Anthropic => 1,
            Vendor::Google => 2,
            Vendor::Bedrock => 3,
        }
    }

    fn construct(&self, vendor: Vendor) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        let key = self
            .credentials
            .credential(vendor)
            .ok_or_else(|| ProviderError::MissingCredential(vendor.to_string()))?;
        tracing::info!("Constructing {} adapter", vendor);
        let adapter: Arc<dyn ProviderAdapter> = match vendor {
            Vendor::OpenAi => Arc::new(OpenAiAdapter::new(
                self.http.clone(),
                self.endpoints.openai_base_url.clone(),
                key,
            )),
            Vendor::Anthropic => Arc::new(AnthropicAdapter::new(
                self.http.clone(),
                self.endpoints.anthropic_base_url.clone(),
                key,
            )),
            Vendor::Google => Arc::new(GeminiAdapter::new(
                self.http.clone(),
                self.endpoints.gemini_base_url.clone(),
                key,
            )),
            Vendor::Bedrock => Arc::new(BedrockAdapter::new(self.endpoints.bedrock_region.clone())),
        };
        Ok(adapter)
    }
}

impl ProviderSource for ProviderRegistry {
    fn usable_vendors(&self) -> HashSet<Vendor> {
        Vendor::ALL
            .iter()
            .copied()
            .filter(|v| self.credentials.credential(*v).is_some())
            .collect()
    }

    fn adapter(&self, vendor_id: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        let vendor: Vendor = vendor_id.parse()?;
        self.cache[Self::slot(vendor)]
            .get_or_try_init(|| self.construct(vendor))
            .map(Arc::clone)
    }

    fn status(&self) -> Vec<ProviderStatus> {
        let usable = self.usable_vendors();
        Vendor::ALL
            .iter()
            .map(|&vendor| ProviderStatus {
                vendor,
                usable: usable.contains(&vendor),
                constructed: self.cache[Self::slot(vendor)].get().is_some(),
            })
            .collect()
    }
}
