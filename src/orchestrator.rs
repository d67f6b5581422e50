//! Stream orchestrator
//!
//! Drives one adapter stream at a time, forwards uniform events to the client as
//! outward records, and swaps to a single backup when the primary attempt fails.
//!
//! ```text
//! Idle -> Attempting(primary) -> Succeeded
//!                             -> AttemptFailed -> Attempting(backup) -> Succeeded
//!                                                                    -> AttemptFailed
//! ```
//!
//! Finalization (cost, persistence, `done`) is left to the caller; the orchestrator
//! only reports what each attempt produced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::chat_history::AttemptKind;
use crate::error::RelayError;
use crate::models::{Citation, GenerationRequest, StreamEvent, TokenUsage};
use crate::protocol::{ErrorCode, ErrorPayload, OutboundEvent};
use crate::provider_registry::ProviderSource;
use crate::router_client::ModelCandidate;
use crate::routing::{is_usable, RoutingDecision};

/// Default capacity of the outward channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Best-effort writer for outward records.
///
/// Sends never fail from the caller's point of view. Once the client is gone the
/// sink stops sending but the request keeps running so accounting still happens.
/// Dropping the sink closes the response.
pub struct EventSink {
    tx: mpsc::Sender<OutboundEvent>,
    disconnected: AtomicBool,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                disconnected: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub async fn send(&self, event: OutboundEvent) {
        if self.disconnected.load(Ordering::Relaxed) {
            return;
        }
        let kind = event.kind();
        if self.tx.send(event).await.is_err() {
            self.disconnected.store(true, Ordering::Relaxed);
            tracing::warn!("Client disconnected; dropping {} event and continuing", kind);
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed) || self.tx.is_closed()
    }
}

/// What one attempt produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptResult {
    pub success: bool,
    pub content: String,
    pub thinking: String,
    pub citations: Vec<Citation>,
    pub usage: TokenUsage,
    pub web_search_used: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl AttemptResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub candidate: ModelCandidate,
    pub kind: AttemptKind,
    pub result: AttemptResult,
}

/// Every attempt made for one request, in order. At most two entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrchestrationReport {
    pub attempts: Vec<AttemptRecord>,
}

impl OrchestrationReport {
    /// The attempt that produced the final answer, if any.
    pub fn succeeded(&self) -> Option<&AttemptRecord> {
        self.attempts.last().filter(|a| a.result.success)
    }

    pub fn fallback_used(&self) -> bool {
        self.succeeded()
            .map(|a| a.kind == AttemptKind::Backup)
            .unwrap_or(false)
    }
}

pub struct StreamOrchestrator {
    providers: Arc<dyn ProviderSource>,
}

impl StreamOrchestrator {
    pub fn new(providers: Arc<dyn ProviderSource>) -> Self {
        Self { providers }
    }

    /// Run the primary, then at most one backup. Terminal errors for total failure
    /// are emitted here; success is left for the caller to finalize.
    pub async fn run(
        &self,
        request: &GenerationRequest,
        decision: &RoutingDecision,
        sink: &EventSink,
    ) -> OrchestrationReport {
        let mut report = OrchestrationReport::default();

        let primary = decision.primary.clone();
        let result = self.attempt(&primary, request, sink).await;
        let primary_error = result.error.clone().unwrap_or_default();
        report.attempts.push(AttemptRecord {
            candidate: primary.clone(),
            kind: AttemptKind::Primary,
            result,
        });
        if report.succeeded().is_some() {
            return report;
        }

        // Credentials may have changed while the primary was streaming.
        let usable = self.providers.usable_vendors();
        let Some(backup) = decision.backups.iter().find(|c| is_usable(c, &usable)) else {
            tracing::warn!("{} failed and no usable backup remains", primary.id);
            let mut payload =
                RelayError::Stream(format!("{} failed: {}", primary.id, primary_error))
                    .to_payload();
            payload.failed_model = Some(primary.id.clone());
            sink.send(OutboundEvent::Error(payload)).await;
            return report;
        };

        tracing::warn!("{} failed, retrying with {}", primary.id, backup.id);
        let mut notice = ErrorPayload::new(
            ErrorCode::ProviderRetry,
            format!(
                "{} failed: {}. Retrying with {}",
                primary.id, primary_error, backup.id
            ),
        );
        notice.failed_model = Some(primary.id.clone());
        notice.next_model = Some(backup.id.clone());
        sink.send(OutboundEvent::Error(notice)).await;

        let result = self.attempt(backup, request, sink).await;
        if !result.success {
            let mut payload = RelayError::AllAttemptsFailed(format!(
                "{} and {} both failed: {}",
                primary.id,
                backup.id,
                result.error.as_deref().unwrap_or_default()
            ))
            .to_payload();
            payload.failed_model = Some(backup.id.clone());
            sink.send(OutboundEvent::Error(payload)).await;
        }
        report.attempts.push(AttemptRecord {
            candidate: backup.clone(),
            kind: AttemptKind::Backup,
            result,
        });
        report
    }

    async fn attempt(
        &self,
        candidate: &ModelCandidate,
        request: &GenerationRequest,
        sink: &EventSink,
    ) -> AttemptResult {
        let started = Instant::now();
        let adapter = match self.providers.adapter(&candidate.vendor) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!("Cannot construct adapter for {}: {}", candidate.vendor, e);
                let mut result = AttemptResult::failed(RelayError::from(e).to_string());
                result.latency_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        tracing::info!("Attempting {} via {}", candidate.id, candidate.vendor);
        let mut stream = adapter.stream(request.for_model(&candidate.id));
        let mut result = AttemptResult::default();
        let mut terminated = false;

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Delta(text) => {
                    result.content.push_str(&text);
                    sink.send(OutboundEvent::Delta(text)).await;
                }
                StreamEvent::Thinking(text) => {
                    result.thinking.push_str(&text);
                    sink.send(OutboundEvent::Thinking(text)).await;
                }
                StreamEvent::Citations(citations) => {
                    result.citations.extend(citations.iter().cloned());
                    sink.send(OutboundEvent::Citations(citations)).await;
                }
                StreamEvent::ToolUse(activity) => {
                    tracing::debug!("{} tool {} {}", candidate.id, activity.tool, activity.status);
                    sink.send(OutboundEvent::ToolUse(activity)).await;
                }
                StreamEvent::Done {
                    usage,
                    web_search_used,
                } => {
                    result.usage = usage;
                    result.web_search_used = web_search_used;
                    result.success = true;
                    terminated = true;
                    break;
                }
                StreamEvent::Error(message) => {
                    result.error = Some(message);
                    terminated = true;
                    break;
                }
            }
        }

        if !terminated {
            result.error = Some(format!("{} stream ended without completing", candidate.id));
        }
        result.latency_ms = started.elapsed().as_millis() as u64;
        if let Some(ref error) = result.error {
            tracing::warn!("Attempt with {} failed: {}", candidate.id, error);
        } else {
            tracing::info!(
                "Attempt with {} completed in {}ms ({} output tokens)",
                candidate.id,
                result.latency_ms,
                result.usage.output_tokens
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatTurn, ToolActivity};
    use crate::provider::{EventStream, ProviderAdapter, ProviderError, Vendor};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    struct Scripted {
        vendor: Vendor,
        events: Vec<StreamEvent>,
    }

    impl ProviderAdapter for Scripted {
        fn vendor(&self) -> Vendor {
            self.vendor
        }

        fn stream(&self, _request: GenerationRequest) -> EventStream {
            Box::pin(futures_util::stream::iter(self.events.clone()))
        }
    }

    /// Fails, and revokes `revoke` from the usable set while streaming.
    struct Revoking {
        usable: Arc<Mutex<HashSet<Vendor>>>,
        revoke: Vendor,
    }

    impl ProviderAdapter for Revoking {
        fn vendor(&self) -> Vendor {
            Vendor::OpenAi
        }

        fn stream(&self, _request: GenerationRequest) -> EventStream {
            let usable = self.usable.clone();
            let revoke = self.revoke;
            Box::pin(async_stream::stream! {
                usable.lock().unwrap().remove(&revoke);
                yield StreamEvent::Error("key rotated".into());
            })
        }
    }

    #[derive(Default)]
    struct ScriptedSource {
        adapters: HashMap<Vendor, Arc<dyn ProviderAdapter>>,
        usable: Arc<Mutex<HashSet<Vendor>>>,
    }

    impl ScriptedSource {
        fn with(mut self, vendor: Vendor, events: Vec<StreamEvent>) -> Self {
            self.adapters
                .insert(vendor, Arc::new(Scripted { vendor, events }));
            self.usable.lock().unwrap().insert(vendor);
            self
        }
    }

    impl ProviderSource for ScriptedSource {
        fn usable_vendors(&self) -> HashSet<Vendor> {
            self.usable.lock().unwrap().clone()
        }

        fn adapter(&self, vendor_id: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
            let vendor: Vendor = vendor_id.parse()?;
            self.adapters
                .get(&vendor)
                .cloned()
                .ok_or_else(|| ProviderError::MissingCredential(vendor_id.to_string()))
        }
    }

    fn candidate(id: &str, vendor: &str) -> ModelCandidate {
        ModelCandidate {
            id: id.into(),
            name: id.into(),
            vendor: vendor.into(),
            score: 0.5,
            reasoning: String::new(),
        }
    }

    fn decision() -> RoutingDecision {
        RoutingDecision {
            primary: candidate("gpt-4.1", "openai"),
            backups: vec![candidate("claude-sonnet-4", "anthropic")],
            is_manual_override: false,
            skipped_primary: None,
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            model_id: String::new(),
            system_prompt: String::new(),
            turns: vec![ChatTurn::user("hi")],
            enable_thinking: false,
            enable_web_search: false,
        }
    }

    fn done(input: u64, output: u64) -> StreamEvent {
        StreamEvent::Done {
            usage: TokenUsage {
                input_tokens: input,
                output_tokens: output,
                ..Default::default()
            },
            web_search_used: false,
        }
    }

    async fn run(source: ScriptedSource) -> (OrchestrationReport, Vec<OutboundEvent>) {
        run_with(source, decision()).await
    }

    async fn run_with(
        source: ScriptedSource,
        decision: RoutingDecision,
    ) -> (OrchestrationReport, Vec<OutboundEvent>) {
        let (sink, mut rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
        let orchestrator = StreamOrchestrator::new(Arc::new(source));
        let report = orchestrator.run(&request(), &decision, &sink).await;
        drop(sink);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (report, events)
    }

    #[tokio::test]
    async fn test_primary_success_accumulates() {
        let source = ScriptedSource::default().with(
            Vendor::OpenAi,
            vec![
                StreamEvent::Thinking("plan".into()),
                StreamEvent::Delta("Hi".into()),
                StreamEvent::ToolUse(ToolActivity::new("web_search", "started")),
                StreamEvent::Delta(" there".into()),
                done(10, 2),
            ],
        );
        let (report, events) = run(source).await;
        let winner = report.succeeded().unwrap();
        assert_eq!(winner.result.content, "Hi there");
        assert_eq!(winner.result.thinking, "plan");
        assert_eq!(winner.result.usage.input_tokens, 10);
        assert!(!report.fallback_used());
        assert_eq!(
            events.iter().map(|e| e.kind()).collect::<Vec<_>>(),
            vec!["thinking", "delta", "tool_use", "delta"]
        );
    }

    #[tokio::test]
    async fn test_primary_failure_retries_backup_once() {
        let source = ScriptedSource::default()
            .with(
                Vendor::OpenAi,
                vec![
                    StreamEvent::Delta("partial".into()),
                    StreamEvent::Error("rate limited".into()),
                ],
            )
            .with(
                Vendor::Anthropic,
                vec![StreamEvent::Delta("fresh".into()), done(5, 1)],
            );
        let (report, events) = run(source).await;
        assert_eq!(report.attempts.len(), 2);
        assert!(report.fallback_used());
        assert_eq!(report.succeeded().unwrap().result.content, "fresh");

        match &events[1] {
            OutboundEvent::Error(p) => {
                assert_eq!(p.code, ErrorCode::ProviderRetry);
                assert_eq!(p.failed_model.as_deref(), Some("gpt-4.1"));
                assert_eq!(p.next_model.as_deref(), Some("claude-sonnet-4"));
            }
            other => panic!("expected retry notice, got {:?}", other),
        }
        assert!(events.iter().all(|e| !e.is_terminal()));
    }

    #[tokio::test]
    async fn test_backup_failure_is_all_providers_failed() {
        let source = ScriptedSource::default()
            .with(Vendor::OpenAi, vec![StreamEvent::Error("boom".into())])
            .with(Vendor::Anthropic, vec![StreamEvent::Delta("x".into())]);
        let (report, events) = run(source).await;
        assert!(report.succeeded().is_none());
        assert_eq!(report.attempts.len(), 2);
        assert!(report.attempts[1]
            .result
            .error
            .as_deref()
            .unwrap()
            .contains("without completing"));
        match events.last().unwrap() {
            OutboundEvent::Error(p) => {
                assert_eq!(p.code, ErrorCode::AllProvidersFailed);
                assert_eq!(p.code, RelayError::AllAttemptsFailed(String::new()).code());
                assert!(p.message.starts_with("All providers failed"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_usable_backup_is_provider_error() {
        let source =
            ScriptedSource::default().with(Vendor::OpenAi, vec![StreamEvent::Error("boom".into())]);
        let (report, events) = run(source).await;
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(events.len(), 1);
        match &events[0] {
            OutboundEvent::Error(p) => {
                assert_eq!(p.code, ErrorCode::ProviderError);
                assert!(p.message.starts_with("Provider stream failed"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_adapter_construction_failure_falls_back() {
        // openai is reported usable but has no adapter
        let source = ScriptedSource::default().with(Vendor::Anthropic, vec![done(1, 1)]);
        source.usable.lock().unwrap().insert(Vendor::OpenAi);
        let (report, _) = run(source).await;
        assert_eq!(report.attempts.len(), 2);
        assert!(report.attempts[0]
            .result
            .error
            .as_deref()
            .unwrap()
            .starts_with("Adapter construction failed"));
        assert!(report.fallback_used());
    }

    fn revoking_primary(source: &mut ScriptedSource, revoke: Vendor) {
        let adapter = Revoking {
            usable: source.usable.clone(),
            revoke,
        };
        source.adapters.insert(Vendor::OpenAi, Arc::new(adapter));
        source.usable.lock().unwrap().insert(Vendor::OpenAi);
    }

    #[tokio::test]
    async fn test_backup_revoked_mid_request_is_provider_error() {
        let mut source = ScriptedSource::default().with(Vendor::Anthropic, vec![done(1, 1)]);
        revoking_primary(&mut source, Vendor::Anthropic);
        assert!(source.usable_vendors().contains(&Vendor::Anthropic));

        let (report, events) = run(source).await;
        assert_eq!(report.attempts.len(), 1);
        assert!(report
            .attempts
            .iter()
            .all(|a| a.candidate.vendor != "anthropic"));
        assert_eq!(events.len(), 1);
        match &events[0] {
            OutboundEvent::Error(p) => {
                assert_eq!(p.code, ErrorCode::ProviderError);
                assert_eq!(p.failed_model.as_deref(), Some("gpt-4.1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backup_revoked_mid_request_skips_to_next_usable() {
        let mut source = ScriptedSource::default()
            .with(Vendor::Anthropic, vec![done(1, 1)])
            .with(Vendor::Google, vec![StreamEvent::Delta("g".into()), done(2, 1)]);
        revoking_primary(&mut source, Vendor::Anthropic);

        let mut routed = decision();
        routed.backups.push(candidate("gemini-2.5-flash", "google"));
        let (report, events) = run_with(source, routed).await;

        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.attempts[1].candidate.id, "gemini-2.5-flash");
        assert_eq!(report.succeeded().unwrap().result.content, "g");
        match &events[0] {
            OutboundEvent::Error(p) => {
                assert_eq!(p.code, ErrorCode::ProviderRetry);
                assert_eq!(p.next_model.as_deref(), Some("gemini-2.5-flash"));
            }
            other => panic!("expected retry notice, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_client_does_not_stop_accumulation() {
        let source = ScriptedSource::default().with(
            Vendor::OpenAi,
            vec![
                StreamEvent::Delta("a".into()),
                StreamEvent::Delta("b".into()),
                done(1, 2),
            ],
        );
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        let report = StreamOrchestrator::new(Arc::new(source))
            .run(&request(), &decision(), &sink)
            .await;
        assert!(sink.is_disconnected());
        assert_eq!(report.succeeded().unwrap().result.content, "ab");
    }
}
