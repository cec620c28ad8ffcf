//! Ordered fallback over a role's backends.
//!
//! Per failure code:
//! - `RATE_LIMIT`, `TIMEOUT`, `API_ERROR`, `ADAPTER_UNAVAILABLE`: move to the next backend
//! - `CONTEXT_EXCEEDED`: compact and retry the same backend while the shared
//!   compaction budget lasts and compaction still shrinks the prompt, then move on
//!
//! Every call that reaches a backend appends exactly one [`ModelUsage`].

use super::{
    Backend, BackendFailure, BackendRequest, BackendResponse, ChainReport, FallbackEvent, Pricing,
};
use crate::compaction::{
    DEFAULT_MAX_COMPACTION_RETRIES, DEFAULT_TARGET_REDUCTION, ErrorClassifier, compact_prompt,
    estimate_tokens, would_exceed_context,
};
use crate::errors::{ChainError, ErrorCode};
use crate::events::{Event, EventBus};
use crate::state::{AgentRole, ModelUsage};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub max_compaction_retries: u32,
    pub call_timeout: Duration,
    pub target_reduction: f64,
    /// Window assumed for backends that do not advertise one.
    pub context_window_tokens: Option<usize>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_compaction_retries: DEFAULT_MAX_COMPACTION_RETRIES,
            call_timeout: Duration::from_secs(300),
            target_reduction: DEFAULT_TARGET_REDUCTION,
            context_window_tokens: None,
        }
    }
}

/// A successful call and the attempts it took.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub response: BackendResponse,
    pub backend: String,
    pub report: ChainReport,
}

pub struct FallbackChain {
    role: AgentRole,
    backends: Vec<Arc<dyn Backend>>,
    classifier: Arc<dyn ErrorClassifier>,
    config: ChainConfig,
    pricing: Arc<Pricing>,
    events: Option<EventBus>,
}

enum Attempt {
    Success(BackendResponse),
    Failure(ErrorCode, String),
}

impl FallbackChain {
    pub fn new(
        role: AgentRole,
        backends: Vec<Arc<dyn Backend>>,
        classifier: Arc<dyn ErrorClassifier>,
        config: ChainConfig,
    ) -> Self {
        Self {
            role,
            backends,
            classifier,
            config,
            pricing: Arc::new(Pricing::default()),
            events: None,
        }
    }

    pub fn with_pricing(mut self, pricing: Arc<Pricing>) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Run one logical call through the chain.
    pub async fn execute(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<ChainOutcome, ChainError> {
        if self.backends.is_empty() {
            return Err(ChainError::NoBackends { role: self.role });
        }

        let mut report = ChainReport::default();
        let mut failures: Vec<BackendFailure> = Vec::new();
        let mut prompt = prompt.to_string();
        let mut compactions_used = 0u32;

        for (idx, backend) in self.backends.iter().enumerate() {
            let name = backend.name().to_string();

            let failure = if !backend.is_available().await {
                tracing::warn!(role = %self.role, backend = %name, "Backend unavailable, skipping");
                BackendFailure {
                    backend: name.clone(),
                    code: ErrorCode::AdapterUnavailable,
                    message: "backend reported unavailable".to_string(),
                }
            } else {
                if let Some(window) = backend
                    .context_window_tokens()
                    .or(self.config.context_window_tokens)
                    && would_exceed_context(&prompt, window)
                {
                    let result = compact_prompt(&prompt, self.config.target_reduction);
                    tracing::info!(
                        role = %self.role,
                        backend = %name,
                        before = result.original_length,
                        after = result.compacted_length,
                        "Proactively compacted prompt"
                    );
                    prompt = result.compacted_prompt;
                }

                match self
                    .try_backend(backend.as_ref(), &mut prompt, &mut compactions_used, &mut report, cancel)
                    .await?
                {
                    Ok(response) => {
                        report.compactions = compactions_used;
                        return Ok(ChainOutcome {
                            response,
                            backend: name,
                            report,
                        });
                    }
                    Err(failure) => failure,
                }
            };

            let reason = failure.code;
            failures.push(failure);

            if let Some(next) = self.backends.get(idx + 1) {
                let event = FallbackEvent {
                    role: self.role,
                    from: name.clone(),
                    to: next.name().to_string(),
                    reason,
                    timestamp: Utc::now(),
                };
                tracing::warn!(
                    role = %self.role,
                    from = %event.from,
                    to = %event.to,
                    reason = %reason,
                    "Falling back to next backend"
                );
                if let Some(events) = &self.events {
                    events.emit(Event::AdapterFallback {
                        role: self.role,
                        from: event.from.clone(),
                        to: event.to.clone(),
                        reason,
                    });
                }
                report.fallbacks.push(event);
            }
        }

        report.compactions = compactions_used;
        tracing::error!(role = %self.role, attempts = report.usages.len(), "Fallback chain exhausted");
        Err(ChainError::Exhausted {
            role: self.role,
            failures,
            report,
        })
    }

    /// Attempts against one backend, including compaction retries.
    ///
    /// Outer `Err` is cancellation; inner `Err` is this backend giving up.
    async fn try_backend(
        &self,
        backend: &dyn Backend,
        prompt: &mut String,
        compactions_used: &mut u32,
        report: &mut ChainReport,
        cancel: &CancellationToken,
    ) -> Result<Result<BackendResponse, BackendFailure>, ChainError> {
        let name = backend.name().to_string();
        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled(report));
            }

            let attempt = self.attempt(backend, prompt, report).await;

            // In-flight calls are never aborted; a result that lands after
            // cancellation is recorded but discarded.
            if cancel.is_cancelled() {
                return Err(self.cancelled(report));
            }

            match attempt {
                Attempt::Success(response) => return Ok(Ok(response)),
                Attempt::Failure(ErrorCode::ContextExceeded, message)
                    if *compactions_used < self.config.max_compaction_retries =>
                {
                    *compactions_used += 1;
                    let result = compact_prompt(prompt, self.config.target_reduction);
                    if result.reduced() {
                        tracing::info!(
                            role = %self.role,
                            backend = %name,
                            retry = *compactions_used,
                            reduction = %format!("{:.1}%", result.reduction_percent),
                            "Context exceeded, retrying with compacted prompt"
                        );
                        *prompt = result.compacted_prompt;
                        continue;
                    }
                    tracing::warn!(role = %self.role, backend = %name, "Compaction made no progress");
                    return Ok(Err(BackendFailure {
                        backend: name,
                        code: ErrorCode::ContextExceeded,
                        message,
                    }));
                }
                Attempt::Failure(code, message) => {
                    return Ok(Err(BackendFailure {
                        backend: name,
                        code,
                        message,
                    }));
                }
            }
        }
    }

    async fn attempt(&self, backend: &dyn Backend, prompt: &str, report: &mut ChainReport) -> Attempt {
        let name = backend.name();
        let request = BackendRequest {
            prompt: prompt.to_string(),
            model: None,
            timeout: self.config.call_timeout,
        };
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.call_timeout, backend.execute(&request)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let attempt = match result {
            Err(_) => Attempt::Failure(
                ErrorCode::Timeout,
                format!("no response within {}s", self.config.call_timeout.as_secs_f64()),
            ),
            Ok(Err(e)) => {
                let message = format!("{:#}", e);
                Attempt::Failure(self.classifier.classify(&message), message)
            }
            Ok(Ok(response)) if response.success => Attempt::Success(response),
            Ok(Ok(response)) => {
                let message = response
                    .error
                    .clone()
                    .unwrap_or_else(|| "backend returned failure without detail".to_string());
                Attempt::Failure(self.classifier.classify(&message), message)
            }
        };

        let (success, error_code, tokens_used) = match &attempt {
            Attempt::Success(response) => (
                true,
                None,
                response.metadata.tokens.unwrap_or_else(|| {
                    (estimate_tokens(prompt) + estimate_tokens(&response.content)) as u64
                }),
            ),
            Attempt::Failure(code, message) => {
                tracing::warn!(role = %self.role, backend = %name, code = %code, error = %message, "Backend attempt failed");
                (false, Some(*code), 0)
            }
        };

        report.prompt_lengths.push(prompt.chars().count());
        report.usages.push(ModelUsage {
            backend_id: name.to_string(),
            provider: backend.provider().to_string(),
            tokens_used,
            latency_ms,
            success,
            error_code,
            timestamp: Utc::now(),
            estimated_cost: self.pricing.estimate(name, tokens_used),
            prompt_chars: prompt.chars().count(),
        });
        attempt
    }

    fn cancelled(&self, report: &mut ChainReport) -> ChainError {
        tracing::info!(role = %self.role, "Call cancelled");
        ChainError::Cancelled {
            role: self.role,
            report: std::mem::take(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{Reply, ScriptedBackend};
    use crate::compaction::PatternClassifier;
    use crate::events::EventKind;

    fn chain(backends: Vec<Arc<ScriptedBackend>>) -> FallbackChain {
        FallbackChain::new(
            AgentRole::Executor,
            backends.into_iter().map(|b| b as Arc<dyn Backend>).collect(),
            Arc::new(PatternClassifier::new()),
            ChainConfig {
                call_timeout: Duration::from_millis(200),
                ..ChainConfig::default()
            },
        )
    }

    fn long_prompt() -> String {
        (0..40)
            .map(|i| format!("Background sentence number {} describes nothing in particular.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[tokio::test]
    async fn test_first_backend_succeeds() {
        let alpha = Arc::new(ScriptedBackend::new("alpha").with_script([Reply::Ok("done".into())]));
        let outcome = chain(vec![alpha.clone()])
            .execute("hi", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.response.content, "done");
        assert_eq!(outcome.backend, "alpha");
        assert_eq!(outcome.report.usages.len(), 1);
        assert!(outcome.report.usages[0].success);
        assert!(outcome.report.fallbacks.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_advances_and_records_fallback() {
        let alpha = Arc::new(
            ScriptedBackend::new("alpha").with_script([Reply::Fail("429 too many requests".into())]),
        );
        let beta = Arc::new(ScriptedBackend::new("beta").with_script([Reply::Ok("ok".into())]));
        let bus = EventBus::new();
        let mut stream = bus.subscribe().only(&[EventKind::AdapterFallback]);

        let outcome = chain(vec![alpha, beta])
            .with_events(bus)
            .execute("hi", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.backend, "beta");
        assert_eq!(outcome.report.usages.len(), 2);
        assert_eq!(outcome.report.usages[0].error_code, Some(ErrorCode::RateLimit));
        assert_eq!(outcome.report.fallbacks.len(), 1);
        assert_eq!(outcome.report.fallbacks[0].reason, ErrorCode::RateLimit);
        assert_eq!(stream.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_context_exceeded_compacts_same_backend() {
        let alpha = Arc::new(ScriptedBackend::new("alpha").with_script([
            Reply::Fail("maximum context length exceeded".into()),
            Reply::Fail("maximum context length exceeded".into()),
            Reply::Ok("fits now".into()),
        ]));
        let outcome = chain(vec![alpha.clone()])
            .execute(&long_prompt(), &CancellationToken::new())
            .await
            .unwrap();

        let usages = &outcome.report.usages;
        assert_eq!(usages.len(), 3);
        assert!(usages[2].success);
        assert_eq!(outcome.report.compactions, 2);
        let lengths = &outcome.report.prompt_lengths;
        assert!(lengths.windows(2).all(|w| w[1] <= w[0]), "{:?}", lengths);
        assert!(lengths[2] < lengths[0]);
        assert_eq!(alpha.calls(), 3);
    }

    #[tokio::test]
    async fn test_compaction_budget_is_shared_across_backends() {
        let ctx = || Reply::Fail("prompt is too long".into());
        let alpha = Arc::new(ScriptedBackend::new("alpha").with_script([ctx(), ctx(), ctx()]));
        let beta = Arc::new(ScriptedBackend::new("beta").with_script([ctx(), ctx()]));
        let err = chain(vec![alpha.clone(), beta.clone()])
            .execute(&long_prompt(), &CancellationToken::new())
            .await
            .unwrap_err();

        // Two compactions on alpha, then beta gets one attempt with no budget left.
        assert_eq!(alpha.calls(), 3);
        assert_eq!(beta.calls(), 1);
        assert_eq!(err.code(), ErrorCode::FatalChainExhausted);
        assert_eq!(err.report().unwrap().compactions, 2);
    }

    #[tokio::test]
    async fn test_all_rate_limited_exhausts() {
        let rl = |name: &str| {
            Arc::new(ScriptedBackend::new(name).with_script([Reply::Fail("rate limit".into())]))
        };
        let err = chain(vec![rl("a"), rl("b"), rl("c")])
            .execute("hi", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ChainError::Exhausted { failures, report, .. } => {
                assert_eq!(failures.len(), 3);
                assert_eq!(report.usages.len(), 3);
                assert!(report.usages.iter().all(|u| !u.success));
                assert_eq!(report.fallbacks.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_advances() {
        let slow = Arc::new(ScriptedBackend::new("slow").with_script([Reply::Hang]));
        let fast = Arc::new(ScriptedBackend::new("fast").with_script([Reply::Ok("ok".into())]));
        let outcome = chain(vec![slow, fast])
            .execute("hi", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.report.usages[0].error_code, Some(ErrorCode::Timeout));
        assert_eq!(outcome.backend, "fast");
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_skipped_without_usage() {
        let down = Arc::new(ScriptedBackend::new("down").unavailable());
        let up = Arc::new(ScriptedBackend::new("up").with_script([Reply::Ok("ok".into())]));
        let outcome = chain(vec![down.clone(), up])
            .execute("hi", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(down.calls(), 0);
        assert_eq!(outcome.report.usages.len(), 1);
        assert_eq!(outcome.report.fallbacks[0].reason, ErrorCode::AdapterUnavailable);
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let alpha = Arc::new(ScriptedBackend::new("alpha").with_script([Reply::Ok("x".into())]));
        let token = CancellationToken::new();
        token.cancel();
        let err = chain(vec![alpha.clone()]).execute("hi", &token).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert_eq!(alpha.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_backends() {
        let err = chain(vec![])
            .execute("hi", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::NoBackends { .. }));
    }

    #[tokio::test]
    async fn test_proactive_compaction_does_not_use_budget() {
        let alpha = Arc::new(
            ScriptedBackend::new("alpha")
                .with_context_window(100)
                .with_script([Reply::Ok("ok".into())]),
        );
        let prompt = long_prompt();
        let outcome = chain(vec![alpha.clone()])
            .execute(&prompt, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.report.compactions, 0);
        assert!(alpha.prompts()[0].len() < prompt.len());
    }

    #[tokio::test]
    async fn test_eventual_success_for_any_short_failure_sequence() {
        let failures = [
            "rate limit",
            "service unavailable",
            "internal error",
            "请求过于频繁",
        ];
        for n in 0..failures.len() {
            let mut backends: Vec<Arc<ScriptedBackend>> = failures[..n]
                .iter()
                .enumerate()
                .map(|(i, msg)| {
                    Arc::new(
                        ScriptedBackend::new(&format!("f{}", i))
                            .with_script([Reply::Fail(msg.to_string())]),
                    )
                })
                .collect();
            backends.push(Arc::new(
                ScriptedBackend::new("good").with_script([Reply::Ok("ok".into())]),
            ));
            let outcome = chain(backends)
                .execute("hi", &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome.backend, "good");
            assert_eq!(outcome.report.fallbacks.len(), n);
        }
    }
}
