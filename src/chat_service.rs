//! Per-request chat flow.
//!
//! `prepare` validates an inbound request before any response is opened, so failures
//! there become plain HTTP errors. `execute` then runs inside the spawned request
//! task: conversation bookkeeping, oracle, routing, orchestration and finalize. After
//! `prepare` every failure is reported as an outward `error` record.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::chat_history::{
    new_log_id, ApiCallLog, AttemptKind, ChatHistoryError, ExtendedContent, Message, MessageRole,
    RoutingInfo, RoutingLog,
};
use crate::chat_history_manager::ChatHistoryManager;
use crate::error::RelayError;
use crate::models::{ChatTurn, GenerationRequest};
use crate::orchestrator::{EventSink, OrchestrationReport, StreamOrchestrator};
use crate::pricing::PricingConfig;
use crate::protocol::{BackupSummary, DonePayload, LatencyBreakdown, OutboundEvent, RoutingPayload};
use crate::provider::Vendor;
use crate::provider_registry::ProviderSource;
use crate::router_client::{
    prompt_fingerprint, RecommendRequest, Recommendation, RouteFeedback, RouterClient,
};
use crate::routing::{RouteResolver, RoutingDecision};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer accurately and concisely.";

/// Relay behavior settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub system_prompt: String,
    /// Vendor assumed for manual model ids with no known prefix
    pub default_vendor: Vendor,
    /// Prior turns handed to the provider
    pub max_history_turns: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            default_vendor: Vendor::OpenAi,
            max_history_turns: 20,
        }
    }
}

impl RelayConfig {
    /// Load from `MODELRELAY_SYSTEM_PROMPT`, `MODELRELAY_DEFAULT_VENDOR` and
    /// `MODELRELAY_MAX_HISTORY_TURNS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let system_prompt = std::env::var("MODELRELAY_SYSTEM_PROMPT")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.system_prompt);
        let default_vendor = match std::env::var("MODELRELAY_DEFAULT_VENDOR") {
            Ok(v) if !v.trim().is_empty() => v.parse().unwrap_or_else(|e| {
                tracing::warn!("Ignoring MODELRELAY_DEFAULT_VENDOR: {}", e);
                defaults.default_vendor
            }),
            _ => defaults.default_vendor,
        };
        let max_history_turns = std::env::var("MODELRELAY_MAX_HISTORY_TURNS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.max_history_turns);
        Self {
            system_prompt,
            default_vendor,
            max_history_turns,
        }
    }
}

/// Inbound chat request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub sub_conversation_id: Option<String>,
    #[serde(default)]
    pub user_tier: Option<String>,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub manual_model_id: Option<String>,
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(default)]
    pub enable_web_search: bool,
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct PreparedChat {
    pub request: ChatRequest,
    pub conversation_id: String,
    started: Instant,
}

pub struct ChatService {
    config: RelayConfig,
    providers: Arc<dyn ProviderSource>,
    router: Arc<dyn RouterClient>,
    history: Arc<ChatHistoryManager>,
    pricing: Arc<PricingConfig>,
    resolver: RouteResolver,
    orchestrator: StreamOrchestrator,
}

fn vendor_names(usable: &HashSet<Vendor>) -> Vec<String> {
    let mut names: Vec<String> = usable.iter().map(|v| v.as_str().to_string()).collect();
    names.sort();
    names
}

impl ChatService {
    pub fn new(
        config: RelayConfig,
        providers: Arc<dyn ProviderSource>,
        router: Arc<dyn RouterClient>,
        history: Arc<ChatHistoryManager>,
        pricing: Arc<PricingConfig>,
    ) -> Self {
        Self {
            resolver: RouteResolver::new(config.default_vendor),
            orchestrator: StreamOrchestrator::new(providers.clone()),
            config,
            providers,
            router,
            history,
            pricing,
        }
    }

    pub fn history(&self) -> &Arc<ChatHistoryManager> {
        &self.history
    }

    pub fn providers(&self) -> &Arc<dyn ProviderSource> {
        &self.providers
    }

    /// Validate a request. Nothing is written.
    pub async fn prepare(&self, request: ChatRequest) -> Result<PreparedChat, RelayError> {
        let started = Instant::now();
        if request.message.trim().is_empty() {
            return Err(RelayError::Validation("message must not be empty".to_string()));
        }

        let conversation_id = match request
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            Some(id) => {
                if self.history.is_enabled() {
                    self.history
                        .get_conversation(id)
                        .await
                        .map_err(|e| not_found_or(e, format!("conversation {}", id)))?;
                }
                id.to_string()
            }
            None => {
                if request.sub_conversation_id.is_some() {
                    return Err(RelayError::Validation(
                        "sub_conversation_id requires conversation_id".to_string(),
                    ));
                }
                format!("conv_{}", uuid::Uuid::new_v4().simple())
            }
        };

        if let Some(sub_id) = request
            .sub_conversation_id
            .as_deref()
            .filter(|_| self.history.is_enabled())
        {
            let sub = self
                .history
                .get_sub_conversation(sub_id)
                .await
                .map_err(|e| not_found_or(e, format!("sub-conversation {}", sub_id)))?;
            if sub.conversation_id != conversation_id {
                return Err(RelayError::Validation(format!(
                    "sub-conversation {} does not belong to conversation {}",
                    sub_id, conversation_id
                )));
            }
        }

        Ok(PreparedChat {
            request,
            conversation_id,
            started,
        })
    }

    /// Run a prepared request to completion, writing outward records to `sink`.
    /// The sink is dropped on return, which closes the response.
    pub async fn execute(&self, prepared: PreparedChat, sink: EventSink) {
        let conversation_id = prepared.conversation_id.clone();
        if let Err(err) = self.run(prepared, &sink).await {
            tracing::warn!("Chat in {} failed: {}", conversation_id, err);
            sink.send(OutboundEvent::Error(err.to_payload())).await;
        }
    }

    async fn run(&self, prepared: PreparedChat, sink: &EventSink) -> Result<(), RelayError> {
        let PreparedChat {
            request,
            conversation_id,
            started,
        } = prepared;
        let sub_id = request.sub_conversation_id.clone();

        self.history.open_conversation(&conversation_id).await?;
        let prior = if self.history.is_enabled() {
            self.history.thread(&conversation_id, sub_id.as_deref()).await?
        } else {
            Vec::new()
        };
        let previous_model = prior
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .and_then(|m| m.routing.model.clone());

        let user_message = self
            .history
            .new_message(&conversation_id, MessageRole::User, &request.message)
            .with_sub_conversation(sub_id.clone());
        self.history.record_message(&user_message).await?;

        let usable = self.providers.usable_vendors();
        let mut oracle_request = RecommendRequest::new(request.message.clone());
        if let Some(modality) = request.modality.as_deref().filter(|m| !m.trim().is_empty()) {
            oracle_request.modality = modality.trim().to_string();
        }
        if let Some(tier) = request.user_tier.as_deref().filter(|t| !t.trim().is_empty()) {
            oracle_request.tier = tier.trim().to_string();
        }
        oracle_request.available_providers = vendor_names(&usable);
        oracle_request.previous_model = previous_model;

        let recommendation = self.router.recommend(&oracle_request).await?;
        if let Some(unsupported) = recommendation.unsupported.clone() {
            return Err(RelayError::UnsupportedTask {
                category: unsupported.category,
                message: unsupported.message,
                alternatives: unsupported.alternatives,
            });
        }

        let decision = self.resolver.resolve(
            &recommendation,
            &usable,
            request.manual_model_id.as_deref(),
        )?;
        let routing_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Routing {} to {} ({}), {} backups, manual={}",
            oracle_request.request_id,
            decision.primary.id,
            decision.primary.vendor,
            decision.backups.len(),
            decision.is_manual_override
        );

        sink.send(OutboundEvent::Routing(routing_payload(
            &recommendation,
            &decision,
        )))
        .await;
        self.write_routing_log(
            &conversation_id,
            &user_message.message_id,
            &request.message,
            &recommendation,
            &decision,
        )
        .await;

        let generation = self.generation_request(&prior, &request);
        let report = self.orchestrator.run(&generation, &decision, sink).await;

        let api_calls = self.api_call_logs(&conversation_id, &report);
        let Some(winner) = report.succeeded() else {
            if let Err(e) = self.history.record_api_calls(&api_calls).await {
                tracing::warn!("Failed to record api calls for {}: {}", conversation_id, e);
            }
            self.send_feedback(&oracle_request, &report, None);
            return Ok(());
        };

        let usage = winner.result.usage;
        let cost_usd = self
            .pricing
            .cost(&winner.candidate.vendor, &winner.candidate.id, &usage);
        let latency = LatencyBreakdown {
            routing_ms,
            attempt_ms: winner.result.latency_ms,
            total_ms: started.elapsed().as_millis() as u64,
        };
        let fallback_used = report.fallback_used();

        let extended = ExtendedContent {
            thinking: Some(winner.result.thinking.clone()).filter(|t| !t.is_empty()),
            citations: winner.result.citations.clone(),
        };
        let assistant = self
            .history
            .new_message(&conversation_id, MessageRole::Assistant, &winner.result.content)
            .with_sub_conversation(sub_id)
            .with_routing(RoutingInfo {
                model: Some(winner.candidate.id.clone()),
                vendor: Some(winner.candidate.vendor.clone()),
                backups: decision.backups.iter().map(|c| c.id.clone()).collect(),
                is_manual_override: decision.is_manual_override,
                fallback_used,
            })
            .with_usage(usage)
            .with_cost(cost_usd)
            .with_latency(latency)
            .with_extended(extended);

        self.history.record_exchange(&assistant, &api_calls).await?;
        self.send_feedback(&oracle_request, &report, Some(cost_usd));

        sink.send(OutboundEvent::Done(DonePayload {
            message_id: assistant.message_id.clone(),
            model: winner.candidate.id.clone(),
            vendor: winner.candidate.vendor.clone(),
            usage,
            cost_usd,
            latency,
            fallback_used,
        }))
        .await;
        tracing::info!(
            "Completed {} with {} in {}ms (${:.6})",
            assistant.message_id,
            winner.candidate.id,
            latency.total_ms,
            cost_usd
        );
        Ok(())
    }

    fn generation_request(&self, prior: &[Message], request: &ChatRequest) -> GenerationRequest {
        let skip = prior.len().saturating_sub(self.config.max_history_turns);
        let mut turns: Vec<ChatTurn> = prior
            .iter()
            .skip(skip)
            .filter(|m| !m.content.is_empty())
            .map(|m| match m.role {
                MessageRole::User => ChatTurn::user(m.content.clone()),
                MessageRole::Assistant => ChatTurn::assistant(m.content.clone()),
                MessageRole::System => ChatTurn::system(m.content.clone()),
            })
            .collect();
        turns.push(ChatTurn::user(request.message.clone()));

        GenerationRequest {
            model_id: String::new(),
            system_prompt: self.config.system_prompt.clone(),
            turns,
            enable_thinking: request.enable_thinking,
            enable_web_search: request.enable_web_search,
        }
    }

    async fn write_routing_log(
        &self,
        conversation_id: &str,
        message_id: &str,
        prompt: &str,
        recommendation: &Recommendation,
        decision: &RoutingDecision,
    ) {
        let log = RoutingLog {
            log_id: new_log_id(),
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            primary_model: decision.primary.id.clone(),
            primary_vendor: decision.primary.vendor.clone(),
            backups: decision.backups.iter().map(|c| c.id.clone()).collect(),
            is_manual_override: decision.is_manual_override,
            confidence: recommendation.confidence,
            analysis: recommendation.analysis.clone(),
            prompt_fingerprint: prompt_fingerprint(prompt),
            created_at: crate::chat_history::current_timestamp(),
        };
        if let Err(e) = self.history.record_routing_log(&log).await {
            tracing::warn!("Failed to record routing log for {}: {}", conversation_id, e);
        }
    }

    fn api_call_logs(&self, conversation_id: &str, report: &OrchestrationReport) -> Vec<ApiCallLog> {
        report
            .attempts
            .iter()
            .map(|attempt| {
                let result = &attempt.result;
                let usage = result.success.then_some(result.usage);
                ApiCallLog {
                    log_id: new_log_id(),
                    conversation_id: conversation_id.to_string(),
                    model: attempt.candidate.id.clone(),
                    vendor: attempt.candidate.vendor.clone(),
                    attempt: attempt.kind,
                    success: result.success,
                    latency_ms: result.latency_ms,
                    usage,
                    cost_usd: usage.map(|u| {
                        self.pricing
                            .cost(&attempt.candidate.vendor, &attempt.candidate.id, &u)
                    }),
                    error: result.error.clone(),
                    created_at: crate::chat_history::current_timestamp(),
                }
            })
            .collect()
    }

    fn send_feedback(
        &self,
        oracle_request: &RecommendRequest,
        report: &OrchestrationReport,
        cost_usd: Option<f64>,
    ) {
        let Some(last) = report.attempts.last() else {
            return;
        };
        let feedback = RouteFeedback {
            request_id: oracle_request.request_id.clone(),
            model_id: last.candidate.id.clone(),
            vendor: last.candidate.vendor.clone(),
            success: last.result.success,
            duration_ms: Some(
                report
                    .attempts
                    .iter()
                    .map(|a| a.result.latency_ms)
                    .sum(),
            ),
            usage: last.result.success.then_some(last.result.usage),
            cost_usd,
            errors: report
                .attempts
                .iter()
                .filter_map(|a| a.result.error.clone())
                .collect(),
        };
        if let Err(e) = self.router.feedback(&feedback) {
            tracing::debug!("Router feedback failed: {}", e);
        }
    }
}

fn not_found_or(err: ChatHistoryError, what: String) -> RelayError {
    match err {
        ChatHistoryError::NotFound(_) => RelayError::NotFound(what),
        other => RelayError::Persistence(other),
    }
}

fn routing_payload(recommendation: &Recommendation, decision: &RoutingDecision) -> RoutingPayload {
    RoutingPayload {
        model: decision.primary.id.clone(),
        model_name: decision.primary.name.clone(),
        vendor: decision.primary.vendor.clone(),
        backups: decision.backups.iter().map(BackupSummary::from).collect(),
        analysis: recommendation.analysis.clone(),
        confidence: recommendation.confidence,
        reasoning: decision.primary.reasoning.clone(),
        is_manual_override: decision.is_manual_override,
        provider_hint: decision.provider_hint(),
        upgrade_hint: recommendation.upgrade_hint.clone(),
    }
}
