//! Routing resolution
//!
//! Turns an oracle recommendation, the set of usable vendors and an optional manual
//! model id into a primary candidate plus an ordered backup chain. Pure and
//! deterministic: the same inputs always give the same decision.

use std::collections::HashSet;

use crate::provider::Vendor;
use crate::router_client::{ModelCandidate, Recommendation};

/// Model id prefixes mapped to vendors, checked in order.
const VENDOR_PREFIXES: &[(&str, Vendor)] = &[
    ("gpt-", Vendor::OpenAi),
    ("chatgpt-", Vendor::OpenAi),
    ("o1", Vendor::OpenAi),
    ("o3", Vendor::OpenAi),
    ("o4", Vendor::OpenAi),
    ("claude", Vendor::Anthropic),
    ("gemini", Vendor::Google),
    ("anthropic.", Vendor::Bedrock),
    ("amazon.", Vendor::Bedrock),
    ("meta.", Vendor::Bedrock),
    ("mistral.", Vendor::Bedrock),
    ("cohere.", Vendor::Bedrock),
    ("ai21.", Vendor::Bedrock),
];

/// Guess a vendor from a model id.
pub fn guess_vendor(model_id: &str) -> Option<Vendor> {
    let id = model_id.trim().to_ascii_lowercase();
    VENDOR_PREFIXES
        .iter()
        .find(|(prefix, _)| id.starts_with(prefix))
        .map(|(_, vendor)| *vendor)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("No usable provider among the recommended models")]
    NoUsableProvider,
}

/// Outcome of routing resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub primary: ModelCandidate,
    pub backups: Vec<ModelCandidate>,
    pub is_manual_override: bool,
    /// Oracle first choice that was skipped because its vendor had no credential.
    pub skipped_primary: Option<ModelCandidate>,
}

impl RoutingDecision {
    /// Note shown to the client when the oracle's first choice was skipped.
    pub fn provider_hint(&self) -> Option<String> {
        self.skipped_primary.as_ref().map(|c| {
            format!(
                "{} was recommended but {} is not configured; using {}",
                c.id, c.vendor, self.primary.id
            )
        })
    }
}

/// Primary/backup selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteResolver {
    default_vendor: Vendor,
}

impl Default for RouteResolver {
    fn default() -> Self {
        Self::new(Vendor::OpenAi)
    }
}

impl RouteResolver {
    pub fn new(default_vendor: Vendor) -> Self {
        Self { default_vendor }
    }

    pub fn default_vendor(&self) -> Vendor {
        self.default_vendor
    }

    /// Resolve a decision. `manual_model_id` that is empty or whitespace is ignored.
    pub fn resolve(
        &self,
        recommendation: &Recommendation,
        usable: &HashSet<Vendor>,
        manual_model_id: Option<&str>,
    ) -> Result<RoutingDecision, RoutingError> {
        match manual_model_id.map(str::trim).filter(|m| !m.is_empty()) {
            Some(manual) => Ok(self.resolve_manual(recommendation, manual)),
            None => resolve_recommended(recommendation, usable),
        }
    }

    fn resolve_manual(&self, recommendation: &Recommendation, manual: &str) -> RoutingDecision {
        let candidates: Vec<&ModelCandidate> = recommendation.candidates().collect();
        match candidates.iter().position(|c| c.id == manual) {
            Some(index) => {
                let primary = candidates[index].clone();
                let backups = candidates
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != index)
                    .map(|(_, c)| (*c).clone())
                    .collect();
                RoutingDecision {
                    primary,
                    backups,
                    is_manual_override: true,
                    skipped_primary: None,
                }
            }
            None => {
                let vendor = guess_vendor(manual).unwrap_or(self.default_vendor);
                RoutingDecision {
                    primary: ModelCandidate {
                        id: manual.to_string(),
                        name: manual.to_string(),
                        vendor: vendor.as_str().to_string(),
                        score: 0.0,
                        reasoning: "Manually selected".to_string(),
                    },
                    backups: candidates.into_iter().cloned().collect(),
                    is_manual_override: true,
                    skipped_primary: None,
                }
            }
        }
    }
}

/// Whether a candidate's vendor string names a usable vendor.
pub fn is_usable(candidate: &ModelCandidate, usable: &HashSet<Vendor>) -> bool {
    candidate
        .vendor
        .parse::<Vendor>()
        .map(|v| usable.contains(&v))
        .unwrap_or(false)
}

fn resolve_recommended(
    recommendation: &Recommendation,
    usable: &HashSet<Vendor>,
) -> Result<RoutingDecision, RoutingError> {
    if is_usable(&recommendation.primary, usable) {
        return Ok(RoutingDecision {
            primary: recommendation.primary.clone(),
            backups: recommendation
                .backups
                .iter()
                .filter(|c| is_usable(c, usable))
                .cloned()
                .collect(),
            is_manual_override: false,
            skipped_primary: None,
        });
    }

    let promoted = recommendation
        .backups
        .iter()
        .position(|c| is_usable(c, usable))
        .ok_or(RoutingError::NoUsableProvider)?;

    // Remaining candidates keep their original relative order and are not filtered;
    // the orchestrator skips unusable ones at attempt time.
    let backups = recommendation
        .candidates()
        .enumerate()
        .filter(|(i, _)| *i != promoted + 1)
        .map(|(_, c)| c.clone())
        .collect();

    Ok(RoutingDecision {
        primary: recommendation.backups[promoted].clone(),
        backups,
        is_manual_override: false,
        skipped_primary: Some(recommendation.primary.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, vendor: &str, score: f64) -> ModelCandidate {
        ModelCandidate {
            id: id.to_string(),
            name: id.to_string(),
            vendor: vendor.to_string(),
            score,
            reasoning: String::new(),
        }
    }

    fn recommendation() -> Recommendation {
        Recommendation {
            primary: candidate("claude-sonnet-4", "anthropic", 0.9),
            backups: vec![
                candidate("gpt-4.1", "openai", 0.85),
                candidate("gemini-2.5-pro", "google", 0.8),
                candidate("gpt-4.1-mini", "openai", 0.7),
            ],
            analysis: "coding question".to_string(),
            confidence: 0.8,
            upgrade_hint: None,
            unsupported: None,
        }
    }

    fn ids(list: &[ModelCandidate]) -> Vec<&str> {
        list.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_usable_primary_filters_backups() {
        let usable = HashSet::from([Vendor::Anthropic, Vendor::OpenAi]);
        let d = RouteResolver::default()
            .resolve(&recommendation(), &usable, None)
            .unwrap();
        assert_eq!(d.primary.id, "claude-sonnet-4");
        assert_eq!(ids(&d.backups), vec!["gpt-4.1", "gpt-4.1-mini"]);
        assert!(!d.is_manual_override);
        assert!(d.provider_hint().is_none());
    }

    #[test]
    fn test_unusable_primary_promotes_first_usable_backup() {
        let usable = HashSet::from([Vendor::Google]);
        let d = RouteResolver::default()
            .resolve(&recommendation(), &usable, None)
            .unwrap();
        assert_eq!(d.primary.id, "gemini-2.5-pro");
        assert_eq!(
            ids(&d.backups),
            vec!["claude-sonnet-4", "gpt-4.1", "gpt-4.1-mini"]
        );
        assert!(!d.is_manual_override);
        assert!(d.provider_hint().unwrap().contains("claude-sonnet-4"));
    }

    #[test]
    fn test_nothing_usable() {
        let usable = HashSet::from([Vendor::Bedrock]);
        assert_eq!(
            RouteResolver::default().resolve(&recommendation(), &usable, None),
            Err(RoutingError::NoUsableProvider)
        );
    }

    #[test]
    fn test_manual_id_matching_backup_is_promoted() {
        let d = RouteResolver::default()
            .resolve(&recommendation(), &HashSet::new(), Some("gpt-4.1"))
            .unwrap();
        assert_eq!(d.primary.id, "gpt-4.1");
        assert_eq!(
            ids(&d.backups),
            vec!["claude-sonnet-4", "gemini-2.5-pro", "gpt-4.1-mini"]
        );
        assert!(d.is_manual_override);
    }

    #[test]
    fn test_unknown_manual_id_is_synthesized() {
        let resolver = RouteResolver::new(Vendor::Google);
        let d = resolver
            .resolve(&recommendation(), &HashSet::new(), Some("not-a-real-model"))
            .unwrap();
        assert_eq!(d.primary.id, "not-a-real-model");
        assert_eq!(d.primary.name, "not-a-real-model");
        assert_eq!(d.primary.vendor, "google");
        assert_eq!(d.primary.score, 0.0);
        assert_eq!(d.backups.len(), 4);
        assert!(d.is_manual_override);

        let d = resolver
            .resolve(&recommendation(), &HashSet::new(), Some("o3-pro"))
            .unwrap();
        assert_eq!(d.primary.vendor, "openai");
    }

    #[test]
    fn test_blank_manual_id_is_ignored() {
        let usable = HashSet::from([Vendor::Anthropic]);
        let d = RouteResolver::default()
            .resolve(&recommendation(), &usable, Some("   "))
            .unwrap();
        assert!(!d.is_manual_override);
        assert_eq!(d.primary.id, "claude-sonnet-4");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let usable = HashSet::from([Vendor::OpenAi, Vendor::Google]);
        let resolver = RouteResolver::default();
        let first = resolver.resolve(&recommendation(), &usable, None);
        for _ in 0..10 {
            assert_eq!(resolver.resolve(&recommendation(), &usable, None), first);
        }
    }

    #[test]
    fn test_guess_vendor() {
        assert_eq!(guess_vendor("gpt-4o"), Some(Vendor::OpenAi));
        assert_eq!(guess_vendor("o4-mini"), Some(Vendor::OpenAi));
        assert_eq!(guess_vendor("Claude-3-5-haiku"), Some(Vendor::Anthropic));
        assert_eq!(guess_vendor("gemini-2.5-flash"), Some(Vendor::Google));
        assert_eq!(guess_vendor("meta.llama3-1-70b-instruct-v1:0"), Some(Vendor::Bedrock));
        assert_eq!(guess_vendor("llama-3"), None);
    }
}
