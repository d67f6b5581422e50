//! Model pricing and cost accounting.
//!
//! Rates are USD per million tokens. Lookup order for a model id: exact match, then
//! the longest known id that prefixes or is contained in the id (after stripping a
//! trailing date snapshot), then the vendor default, then the global default.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::TokenUsage;

static DATE_SUFFIX: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"-(\d{8}|\d{4}-\d{2}-\d{2})$").ok());

/// Per-million-token rates for one model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelRates {
    pub input_per_million: f64,
    pub output_per_million: f64,
    /// Rate for cached prompt tokens; when absent they are billed as input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_per_million: Option<f64>,
}

impl ModelRates {
    pub const fn new(input: f64, output: f64) -> Self {
        Self {
            input_per_million: input,
            output_per_million: output,
            cached_input_per_million: None,
        }
    }
}

/// Pricing table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricingConfig {
    #[serde(default)]
    pub models: HashMap<String, ModelRates>,

    #[serde(default)]
    pub vendor_defaults: HashMap<String, ModelRates>,

    /// Flat fee per web search request, keyed by vendor
    #[serde(default)]
    pub search_fee_per_request: HashMap<String, f64>,

    #[serde(default = "default_rates")]
    pub default: ModelRates,
}

fn default_rates() -> ModelRates {
    ModelRates::new(3.0, 15.0)
}

impl Default for PricingConfig {
    fn default() -> Self {
        let models = [
            ("gpt-4.1", 2.0, 8.0),
            ("gpt-4.1-mini", 0.4, 1.6),
            ("gpt-4.1-nano", 0.1, 0.4),
            ("gpt-4o", 2.5, 10.0),
            ("gpt-4o-mini", 0.15, 0.6),
            ("o4-mini", 1.1, 4.4),
            ("o3", 2.0, 8.0),
            ("o3-mini", 1.1, 4.4),
            ("o1", 15.0, 60.0),
            ("claude-sonnet-4", 3.0, 15.0),
            ("claude-opus-4", 15.0, 75.0),
            ("claude-3-7-sonnet", 3.0, 15.0),
            ("claude-3-5-sonnet", 3.0, 15.0),
            ("claude-3-5-haiku", 0.8, 4.0),
            ("gemini-2.5-pro", 1.25, 10.0),
            ("gemini-2.5-flash", 0.3, 2.5),
            ("gemini-2.0-flash", 0.1, 0.4),
            ("anthropic.claude-3-5-sonnet", 3.0, 15.0),
            ("anthropic.claude-3-5-haiku", 0.8, 4.0),
            ("meta.llama3-1-70b", 0.72, 0.72),
            ("mistral.mistral-large", 2.0, 6.0),
        ]
        .into_iter()
        .map(|(id, i, o)| (id.to_string(), ModelRates::new(i, o)))
        .collect();

        let vendor_defaults = [
            ("openai", 2.5, 10.0),
            ("anthropic", 3.0, 15.0),
            ("google", 1.25, 5.0),
            ("bedrock", 3.0, 15.0),
        ]
        .into_iter()
        .map(|(v, i, o)| (v.to_string(), ModelRates::new(i, o)))
        .collect();

        let search_fee_per_request = [
            ("openai", 0.01),
            ("anthropic", 0.01),
            ("google", 0.035),
            ("bedrock", 0.0),
        ]
        .into_iter()
        .map(|(v, fee)| (v.to_string(), fee))
        .collect();

        Self {
            models,
            vendor_defaults,
            search_fee_per_request,
            default: default_rates(),
        }
    }
}

impl PricingConfig {
    /// Load overrides from a JSON or YAML file (chosen by extension) on top of the
    /// built-in table.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let overrides: PricingConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        let mut config = Self::default();
        config.merge(overrides);
        Ok(config)
    }

    /// Built-in table, plus `MODELRELAY_PRICING_PATH` overrides when set.
    pub fn from_env() -> Self {
        match std::env::var("MODELRELAY_PRICING_PATH") {
            Ok(path) if !path.trim().is_empty() => match Self::load_from_file(path.trim()) {
                Ok(config) => {
                    tracing::info!("Loaded pricing overrides from {}", path.trim());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to load pricing from {}: {}; using defaults", path.trim(), e);
                    Self::default()
                }
            },
            _ => Self::default(),
        }
    }

    fn merge(&mut self, other: PricingConfig) {
        self.models.extend(
            other
                .models
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v)),
        );
        self.vendor_defaults.extend(other.vendor_defaults);
        self.search_fee_per_request.extend(other.search_fee_per_request);
        self.default = other.default;
    }

    /// Resolve rates for a model. Never fails.
    pub fn rates_for(&self, vendor: &str, model_id: &str) -> ModelRates {
        let id = model_id.trim().to_ascii_lowercase();
        if let Some(rates) = self.models.get(&id) {
            return *rates;
        }

        let stripped = match DATE_SUFFIX.as_ref() {
            Some(re) => re.replace(&id, "").into_owned(),
            None => id.clone(),
        };
        if let Some(rates) = self.models.get(&stripped) {
            return *rates;
        }

        let best = self
            .models
            .iter()
            .filter(|(known, _)| stripped.starts_with(known.as_str()) || stripped.contains(known.as_str()))
            // Longest wins; ties broken by name so the choice does not depend on map order.
            .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)));
        if let Some((_, rates)) = best {
            return *rates;
        }

        self.vendor_defaults
            .get(&vendor.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default)
    }

    /// Cost in USD, rounded to 6 decimals. Reasoning tokens are billed at the output
    /// rate; each web search request adds the vendor's flat fee.
    pub fn cost(&self, vendor: &str, model_id: &str, usage: &TokenUsage) -> f64 {
        let rates = self.rates_for(vendor, model_id);
        let per_token = |rate: f64| rate / 1_000_000.0;

        let (billed_input, cached_cost) = match rates.cached_input_per_million {
            Some(cached_rate) => {
                let cached = usage.cached_tokens.min(usage.input_tokens);
                (
                    usage.input_tokens - cached,
                    cached as f64 * per_token(cached_rate),
                )
            }
            None => (usage.input_tokens, 0.0),
        };

        let mut total = billed_input as f64 * per_token(rates.input_per_million)
            + cached_cost
            + (usage.output_tokens + usage.reasoning_tokens) as f64
                * per_token(rates.output_per_million);

        let searches = usage.search_count();
        if searches > 0 {
            let fee = self
                .search_fee_per_request
                .get(&vendor.to_ascii_lowercase())
                .copied()
                .unwrap_or(0.0);
            total += fee * searches as f64;
        }

        round6(total)
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
