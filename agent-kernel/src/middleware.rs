//! Composition root wrapping each invocation with policy checks, resilience,
//! tracing, metrics, and decision logging.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use agent_config::{AgentwatchConfig, DecisionSinkConfig, ResilienceConfig, SpanExporterConfig};
use agent_policy::{
    DecisionInput, DecisionLog, DecisionLogConfig, DecisionLogReport, DecisionResult,
    DecisionSink, DecisionType, Evaluation, FileDecisionSink, MemoryDecisionSink, PolicyDecision,
    PolicyEngine, RuleBasedEngine, RuleSet, ToolCall, TracingDecisionSink,
};
use agent_resilience::{RetryError, retry_with_backoff, with_timeout};
use agent_telemetry::{
    CostTracker, GoldenSignals, GoldenSignalsSnapshot, MetricsCollector, MetricsConfig,
    SignalSources, SignalThresholds, render_prometheus,
};
use agent_trace::{
    BatchConfig, BatchSpanProcessor, ExportReport, InMemorySpanExporter, LogSpanExporter,
    OtlpHttpExporter, SpanExporter, SpanStatus, TraceContext, Tracer,
};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::{Invocation, InvocationOutput, InvocationRequest};
use crate::approval::{ApprovalHandler, ApprovalVerdict};
use crate::error::{AttemptError, BuildError, InvocationError, InvocationResult, PolicyStage};
use crate::lifecycle::{InvocationEvent, Lifecycle};

/// Counter of invocations started.
pub const RUNS_METRIC: &str = "workflow.runs";
/// Counter of invocations that completed successfully.
pub const SUCCESS_METRIC: &str = "workflow.success";
/// Counter of invocations that ended in an error.
pub const FAILURES_METRIC: &str = "workflow.failures";
/// Histogram of execution latency in milliseconds, retries included.
pub const LATENCY_METRIC: &str = "workflow.latency_ms";
/// Counter of invocations blocked by policy.
pub const VIOLATIONS_METRIC: &str = "policy.violations";
/// Counter of evaluations that required human approval.
pub const APPROVALS_METRIC: &str = "policy.approvals_required";
/// Counter of policy evaluations.
pub const EVALUATIONS_METRIC: &str = "policy.evaluations";

const STATE_METRIC_PREFIX: &str = "invocation.state";
/// Timeouts are counted in `invocation.timeouts`.
const TIMEOUT_OPERATION: &str = "invocation";
const ROOT_SPAN: &str = "agent.invocation";
const ATTEMPT_SPAN: &str = "agent.attempt";

/// Totals reported by [`Middleware::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Span processor totals.
    pub spans: ExportReport,
    /// Decision log totals.
    pub decisions: DecisionLogReport,
}

/// Observability and policy middleware.
///
/// One instance is created at process start and shared by reference (or
/// `Arc`) across all concurrent invocations; no lock is held across them.
pub struct Middleware {
    metrics: Arc<MetricsCollector>,
    spans: BatchSpanProcessor,
    tracer: Tracer,
    decisions: DecisionLog,
    policy: Arc<dyn PolicyEngine>,
    approvals: Option<Arc<dyn ApprovalHandler>>,
    resilience: ResilienceConfig,
    pricing: CostTracker,
    signals: GoldenSignals,
    namespace: Option<String>,
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("resilience", &self.resilience)
            .field("approvals_configured", &self.approvals.is_some())
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Middleware {
    /// Starts a builder with every setting at its default.
    #[must_use]
    pub fn builder() -> MiddlewareBuilder {
        MiddlewareBuilder::default()
    }

    /// Builds a middleware from loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Config`] when `config` fails
    /// [`agent_config::validate`], and another [`BuildError`] when the OTLP
    /// endpoint is invalid or the decision log file cannot be opened.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub async fn from_config(config: &AgentwatchConfig) -> Result<Self, BuildError> {
        agent_config::validate(config).map_err(BuildError::Config)?;

        let exporter: Arc<dyn SpanExporter> = match &config.tracing.exporter {
            SpanExporterConfig::Log => Arc::new(LogSpanExporter),
            SpanExporterConfig::Memory => Arc::new(InMemorySpanExporter::new()),
            SpanExporterConfig::Otlp {
                endpoint,
                timeout_ms,
            } => Arc::new(
                OtlpHttpExporter::new(endpoint, Duration::from_millis(*timeout_ms))?
                    .with_service_name(config.service_name.clone()),
            ),
        };

        let sink: Arc<dyn DecisionSink> = match &config.decision_log.sink {
            DecisionSinkConfig::Tracing => Arc::new(TracingDecisionSink),
            DecisionSinkConfig::Memory => Arc::new(MemoryDecisionSink::new()),
            DecisionSinkConfig::File { path } => Arc::new(FileDecisionSink::open(path).await?),
        };

        let mut builder = Self::builder();
        if let Some(namespace) = &config.metrics_namespace {
            builder = builder.namespace(namespace.clone());
        }
        Ok(builder
            .metrics_config(config.metrics)
            .span_exporter(exporter)
            .batch_config(config.tracing.batch)
            .decision_sink(sink)
            .decision_log_config(config.decision_log.queue)
            .rules(config.policy.clone())?
            .resilience(config.resilience)
            .pricing(config.pricing.clone())
            .thresholds(config.signals)
            .build())
    }

    /// Shared metrics collector.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Tracer for spans opened outside [`invoke`](Self::invoke).
    #[must_use]
    pub fn tracer(&self) -> Tracer {
        self.tracer.clone()
    }

    /// Current golden signals, computed from live metrics.
    #[must_use]
    pub fn signals(&self) -> GoldenSignalsSnapshot {
        self.signals.read(&self.metrics)
    }

    /// OpenMetrics exposition text of every metric.
    ///
    /// # Errors
    ///
    /// Propagates a formatting error raised by the encoder.
    pub fn metrics_text(&self) -> Result<String, fmt::Error> {
        render_prometheus(&self.metrics.snapshot(), self.namespace.as_deref())
    }

    /// Runs `invocation` through the full pipeline: input policy, timed and
    /// retried execution, output and tool-call policy, cost accounting.
    ///
    /// The invocation span is parented to the current span of `ctx`, so
    /// invocations made from inside another invocation nest correctly.
    /// Dropping the returned future cancels the in-flight attempt and ends
    /// the open spans as cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::PolicyDenied`] when a policy check fails,
    /// [`InvocationError::TimedOut`] or [`InvocationError::Execution`] when a
    /// single attempt fails without retry, and
    /// [`InvocationError::RetryExhausted`] when every attempt failed.
    pub async fn invoke(
        &self,
        ctx: &TraceContext,
        invocation: &dyn Invocation,
    ) -> InvocationResult<InvocationOutput> {
        let request = invocation.request();
        let (mut span, span_ctx) = self.tracer.start_span(ROOT_SPAN, ctx);
        span.set_tag("request_id", request.request_id());
        span.set_tag("agent", request.agent_name());
        if let Some(tool) = request.tool_name() {
            span.set_tag("tool", tool);
        }
        let _ = self.metrics.increment(RUNS_METRIC);

        let mut lifecycle = Lifecycle::new(request.request_id());
        let outcome = self.run(&mut lifecycle, &span_ctx, invocation).await;

        match &outcome {
            Ok(_) => {
                self.advance(&mut lifecycle, InvocationEvent::Complete);
                let _ = self.metrics.increment(SUCCESS_METRIC);
                debug!(
                    request_id = %request.request_id(),
                    agent = %request.agent_name(),
                    "invocation completed"
                );
            }
            Err(err) => {
                self.advance(&mut lifecycle, InvocationEvent::Fail);
                let _ = self.metrics.increment(FAILURES_METRIC);
                if matches!(err, InvocationError::PolicyDenied { .. }) {
                    let _ = self.metrics.increment(VIOLATIONS_METRIC);
                }
                span.set_status(SpanStatus::Error);
                span.set_tag("error.kind", err.kind());
                span.set_tag("error.message", err.to_string());
                warn!(
                    request_id = %request.request_id(),
                    agent = %request.agent_name(),
                    kind = err.kind(),
                    error = %err,
                    "invocation failed"
                );
            }
        }

        span.set_tag("state", lifecycle.state().as_str());
        span.end();
        outcome
    }

    async fn run(
        &self,
        lifecycle: &mut Lifecycle,
        ctx: &TraceContext,
        invocation: &dyn Invocation,
    ) -> InvocationResult<InvocationOutput> {
        let request = invocation.request();

        let mut input = base_input(DecisionType::InputValidation, request)
            .with_input_text(request.input_text());
        if let Some(tool) = request.tool_name() {
            input = input.with_tool(tool);
        }
        self.enforce(input)
            .await
            .map_err(|reasons| InvocationError::PolicyDenied {
                stage: PolicyStage::Input,
                reasons,
            })?;
        self.advance(lifecycle, InvocationEvent::InputAllowed);

        self.advance(lifecycle, InvocationEvent::ExecutionStarted);
        let started = Instant::now();
        let executed = self.execute(ctx, invocation).await;
        let _ = self
            .metrics
            .record_histogram(LATENCY_METRIC, started.elapsed().as_secs_f64() * 1000.0);
        let output = executed?;

        if let Err(err) =
            self.pricing
                .record(&self.metrics, output.usage.as_ref(), output.cost_usd)
        {
            warn!(error = %err, "failed to record invocation cost");
        }

        self.validate_output(request, &output).await?;
        self.advance(lifecycle, InvocationEvent::OutputAllowed);
        Ok(output)
    }

    async fn execute(
        &self,
        ctx: &TraceContext,
        invocation: &dyn Invocation,
    ) -> InvocationResult<InvocationOutput> {
        let retry_on_timeout = self.resilience.retry_on_timeout;
        let outcome = retry_with_backoff(
            &self.resilience.retry,
            &self.metrics,
            |err: &AttemptError| err.is_retryable(retry_on_timeout),
            |attempt| self.attempt(ctx, invocation, attempt),
        )
        .await;

        match outcome {
            Ok(output) => Ok(output),
            Err(RetryError::Exhausted { attempts, source }) if attempts > 1 => {
                Err(InvocationError::RetryExhausted { attempts, source })
            }
            Err(err) => Err(err.into_inner().into()),
        }
    }

    async fn attempt(
        &self,
        ctx: &TraceContext,
        invocation: &dyn Invocation,
        attempt: u32,
    ) -> Result<InvocationOutput, AttemptError> {
        let (mut span, attempt_ctx) = self.tracer.start_span(ATTEMPT_SPAN, ctx);
        span.set_tag("attempt", attempt.to_string());

        let result = match with_timeout(
            TIMEOUT_OPERATION,
            self.resilience.timeout(),
            &self.metrics,
            invocation.execute(&attempt_ctx),
        )
        .await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(AttemptError::Adapter(err)),
            Err(timed_out) => Err(AttemptError::TimedOut(timed_out)),
        };

        if let Err(err) = &result {
            span.set_status(SpanStatus::Error);
            span.set_tag("error.message", err.to_string());
        }
        span.end();
        result
    }

    /// Checks the output text, then every tool call. All checks run and are
    /// logged even after a denial; the first denying stage is reported.
    async fn validate_output(
        &self,
        request: &InvocationRequest,
        output: &InvocationOutput,
    ) -> InvocationResult<()> {
        let mut denial: Option<(PolicyStage, Vec<String>)> = None;

        let mut input = base_input(DecisionType::OutputValidation, request)
            .with_input_text(request.input_text())
            .with_output_text(output.output_text.clone());
        if let Some(tool) = request.tool_name() {
            input = input.with_tool(tool);
        }
        if let Err(reasons) = self.enforce(input).await {
            denial = Some((PolicyStage::Output, reasons));
        }

        for call in &output.tool_calls {
            if let Err(reasons) = self.enforce(tool_call_input(request, call)).await {
                match &mut denial {
                    Some((_, all)) => all.extend(reasons),
                    None => denial = Some((PolicyStage::ToolCall, reasons)),
                }
            }
        }

        match denial {
            Some((stage, reasons)) => Err(InvocationError::PolicyDenied { stage, reasons }),
            None => Ok(()),
        }
    }

    /// Evaluates `input`, logs the decision, and resolves approval requests.
    /// Returns the deny reasons on any outcome other than allow.
    async fn enforce(&self, input: DecisionInput) -> Result<(), Vec<String>> {
        let started = Instant::now();
        let evaluated = self.policy.evaluate(&input);
        let latency = started.elapsed();
        let _ = self.metrics.increment(EVALUATIONS_METRIC);

        let evaluation = match evaluated {
            Ok(evaluation) => evaluation,
            Err(err) => {
                let reason = format!("policy evaluation failed: {err}");
                warn!(decision_type = %input.decision_type(), error = %err, "policy evaluation failed; denying");
                self.decisions
                    .append(decision_for(&input, DecisionResult::Deny, &reason).with_latency(latency))
                    .await;
                return Err(vec![reason]);
            }
        };

        self.decisions
            .append(PolicyDecision::from_evaluation(&input, &evaluation, latency))
            .await;

        match evaluation.verdict() {
            DecisionResult::Allow => Ok(()),
            DecisionResult::Deny => {
                warn!(
                    decision_type = %input.decision_type(),
                    tool = ?input.tool_name(),
                    reasons = ?evaluation.deny_reasons(),
                    "policy denied"
                );
                Err(evaluation.deny_reasons().to_vec())
            }
            DecisionResult::RequireApproval => {
                let _ = self.metrics.increment(APPROVALS_METRIC);
                self.review(&input, &evaluation).await
            }
        }
    }

    async fn review(&self, input: &DecisionInput, evaluation: &Evaluation) -> Result<(), Vec<String>> {
        let Some(approvals) = &self.approvals else {
            warn!(
                decision_type = %input.decision_type(),
                reason = %evaluation.reason(),
                "approval required but no approval handler configured; denying"
            );
            return Err(vec![format!("approval required: {}", evaluation.reason())]);
        };

        let started = Instant::now();
        let verdict = approvals.review(input, evaluation).await;
        let (result, reason) = match &verdict {
            ApprovalVerdict::Approved { note } => (DecisionResult::Allow, note.as_str()),
            ApprovalVerdict::Rejected { reason } => (DecisionResult::Deny, reason.as_str()),
        };
        info!(decision_type = %input.decision_type(), %result, reason, "human review completed");

        let decision = copy_subject(
            PolicyDecision::new(DecisionType::HumanReview, result, reason),
            input,
        )
        .with_latency(started.elapsed())
        .with_context("reviewed", Value::from(input.decision_type().to_string()));
        self.decisions.append(decision).await;

        match verdict {
            ApprovalVerdict::Approved { .. } => Ok(()),
            ApprovalVerdict::Rejected { reason } => Err(vec![reason]),
        }
    }

    fn advance(&self, lifecycle: &mut Lifecycle, event: InvocationEvent) {
        match lifecycle.transition(event) {
            Ok(state) => {
                let _ = self
                    .metrics
                    .increment(&format!("{STATE_METRIC_PREFIX}.{state}"));
            }
            Err(err) => warn!(error = %err, "lifecycle transition rejected"),
        }
    }

    /// Exports queued spans and writes queued decisions.
    pub async fn flush(&self) {
        tokio::join!(self.spans.force_flush(), self.decisions.flush());
    }

    /// Stops both background workers: nothing new is accepted, queued items
    /// are written, and after `grace` the remainder is discarded.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let (decisions, spans) =
            tokio::join!(self.decisions.shutdown(grace), self.spans.shutdown(grace));
        info!(
            spans_exported = spans.exported,
            spans_dropped = spans.dropped,
            decisions_persisted = decisions.persisted,
            decisions_dropped = decisions.dropped,
            "agentwatch middleware stopped"
        );
        ShutdownReport { spans, decisions }
    }
}

fn base_input(decision_type: DecisionType, request: &InvocationRequest) -> DecisionInput {
    request.context().iter().fold(
        DecisionInput::new(decision_type)
            .with_agent(request.agent_name())
            .with_request_id(request.request_id()),
        |input, (key, value)| input.with_context(key.clone(), value.clone()),
    )
}

fn tool_call_input(request: &InvocationRequest, call: &ToolCall) -> DecisionInput {
    base_input(DecisionType::ToolCall, request)
        .with_tool(call.name())
        .with_tool_call(call.clone())
}

/// Record for an outcome that did not come from an [`Evaluation`].
fn decision_for(input: &DecisionInput, result: DecisionResult, reason: &str) -> PolicyDecision {
    copy_subject(PolicyDecision::new(input.decision_type(), result, reason), input)
}

fn copy_subject(mut decision: PolicyDecision, input: &DecisionInput) -> PolicyDecision {
    if let Some(tool) = input.tool_name() {
        decision = decision.with_tool(tool);
    }
    if let Some(agent) = input.agent_id() {
        decision = decision.with_agent(agent);
    }
    if let Some(request_id) = input.request_id() {
        decision = decision.with_context("request_id", Value::from(request_id));
    }
    decision
}

/// Assembles a [`Middleware`]. Unset parts fall back to zero-configuration
/// defaults: log exporter, tracing decision sink, allow-all rules.
#[derive(Default)]
pub struct MiddlewareBuilder {
    metrics: Option<Arc<MetricsCollector>>,
    metrics_config: MetricsConfig,
    exporter: Option<Arc<dyn SpanExporter>>,
    batch: BatchConfig,
    sink: Option<Arc<dyn DecisionSink>>,
    decision_log: DecisionLogConfig,
    policy: Option<Arc<dyn PolicyEngine>>,
    approvals: Option<Arc<dyn ApprovalHandler>>,
    resilience: ResilienceConfig,
    pricing: CostTracker,
    thresholds: SignalThresholds,
    namespace: Option<String>,
}

impl fmt::Debug for MiddlewareBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareBuilder")
            .field("batch", &self.batch)
            .field("decision_log", &self.decision_log)
            .field("resilience", &self.resilience)
            .field("exporter", &self.exporter.as_ref().map(|exporter| exporter.name()))
            .field("sink", &self.sink.as_ref().map(|sink| sink.name()))
            .finish_non_exhaustive()
    }
}

impl MiddlewareBuilder {
    /// Shares an existing collector instead of creating one.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Settings for the collector created by [`build`](Self::build).
    #[must_use]
    pub fn metrics_config(mut self, config: MetricsConfig) -> Self {
        self.metrics_config = config;
        self
    }

    /// Destination of finished spans.
    #[must_use]
    pub fn span_exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Span batching, retry, and breaker settings.
    #[must_use]
    pub fn batch_config(mut self, config: BatchConfig) -> Self {
        self.batch = config;
        self
    }

    /// Destination of policy decisions.
    #[must_use]
    pub fn decision_sink(mut self, sink: Arc<dyn DecisionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Decision queue and flush settings.
    #[must_use]
    pub fn decision_log_config(mut self, config: DecisionLogConfig) -> Self {
        self.decision_log = config;
        self
    }

    /// Custom policy engine.
    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn PolicyEngine>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Uses a [`RuleBasedEngine`] over `rules`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Policy`] for malformed rules.
    pub fn rules(self, rules: RuleSet) -> Result<Self, BuildError> {
        Ok(self.policy(Arc::new(RuleBasedEngine::new(rules)?)))
    }

    /// Handler consulted for decisions that require approval.
    #[must_use]
    pub fn approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approvals = Some(handler);
        self
    }

    /// Timeout and retry applied to each invocation.
    #[must_use]
    pub fn resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    /// Token pricing table.
    #[must_use]
    pub fn pricing(mut self, pricing: CostTracker) -> Self {
        self.pricing = pricing;
        self
    }

    /// Golden-signal thresholds.
    #[must_use]
    pub fn thresholds(mut self, thresholds: SignalThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Prefix added to every name in [`Middleware::metrics_text`].
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Starts the background workers and returns the middleware.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> Middleware {
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsCollector::new(self.metrics_config)));
        let exporter = self.exporter.unwrap_or_else(|| Arc::new(LogSpanExporter));
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingDecisionSink));

        info!(
            exporter = exporter.name(),
            sink = sink.name(),
            timeout_ms = self.resilience.timeout_ms,
            max_attempts = self.resilience.retry.max_attempts().get(),
            "agentwatch middleware starting"
        );

        let spans = BatchSpanProcessor::start(exporter, self.batch, Arc::clone(&metrics));
        let decisions = DecisionLog::start(sink, self.decision_log, Arc::clone(&metrics));

        Middleware {
            tracer: spans.tracer(),
            spans,
            decisions,
            policy: self
                .policy
                .unwrap_or_else(|| Arc::new(RuleBasedEngine::default())),
            approvals: self.approvals,
            resilience: self.resilience,
            pricing: self.pricing,
            signals: GoldenSignals::new(SignalSources::default(), self.thresholds),
            namespace: self.namespace,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;
    use std::sync::atomic::{AtomicU32, Ordering};

    use agent_policy::{Condition, PolicyRule, TextField};
    use agent_resilience::RetryPolicy;
    use agent_telemetry::{ModelPricing, SignalReading, TokenUsage};
    use agent_trace::SpanRecord;
    use serde_json::json;

    use crate::adapter::{AdapterError, FnInvocation};
    use crate::approval::AutoApprove;

    struct Harness {
        middleware: Arc<Middleware>,
        spans: InMemorySpanExporter,
        decisions: MemoryDecisionSink,
    }

    fn rules() -> RuleSet {
        RuleSet::default()
            .with_rule(
                PolicyRule::deny(
                    "no-shell",
                    "shell access is forbidden",
                    Condition::tool_in(["shell"]),
                )
                .unwrap(),
            )
            .with_rule(
                PolicyRule::deny(
                    "no-secrets",
                    "input mentions a secret",
                    Condition::text_contains(TextField::Input, "password"),
                )
                .unwrap(),
            )
            .with_rule(
                PolicyRule::require_approval(
                    "payments",
                    "payments need review",
                    Condition::All {
                        conditions: vec![
                            Condition::tool_in(["payments"]),
                            Condition::decision_type(DecisionType::InputValidation),
                        ],
                    },
                )
                .unwrap(),
            )
    }

    fn resilience(max_attempts: u32, timeout_ms: u64) -> ResilienceConfig {
        ResilienceConfig {
            timeout_ms,
            retry: RetryPolicy::new(
                NonZeroU32::new(max_attempts).unwrap(),
                Duration::from_millis(100),
                2.0,
            ),
            retry_on_timeout: true,
        }
    }

    fn builder() -> MiddlewareBuilder {
        Middleware::builder()
            .rules(rules())
            .unwrap()
            .resilience(resilience(3, 1_000))
    }

    fn harness(builder: MiddlewareBuilder) -> Harness {
        let spans = InMemorySpanExporter::new();
        let decisions = MemoryDecisionSink::new();
        let middleware = builder
            .span_exporter(Arc::new(spans.clone()))
            .decision_sink(Arc::new(decisions.clone()))
            .batch_config(BatchConfig {
                max_wait_ms: 600_000,
                ..BatchConfig::default()
            })
            .decision_log_config(DecisionLogConfig {
                flush_interval_ms: 600_000,
                ..DecisionLogConfig::default()
            })
            .build();
        Harness {
            middleware: Arc::new(middleware),
            spans,
            decisions,
        }
    }

    fn request(id: &str, input: &str) -> InvocationRequest {
        InvocationRequest::new(id, "planner", input)
    }

    fn span<'a>(spans: &'a [SpanRecord], name: &str) -> &'a SpanRecord {
        spans
            .iter()
            .find(|span| span.name == name)
            .unwrap_or_else(|| panic!("no span named {name}"))
    }

    /// Fails with a retryable error until the `succeed_on`-th call.
    fn flaky(id: &str, calls: &Arc<AtomicU32>, succeed_on: u32) -> impl Invocation {
        let calls = Arc::clone(calls);
        FnInvocation::new(request(id, "flaky work"), move |_ctx| {
            let calls = Arc::clone(&calls);
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call < succeed_on {
                    Err(AdapterError::retryable(format!("transient #{call}")))
                } else {
                    Ok(InvocationOutput::text("done"))
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn allowed_invocation_records_metrics_decisions_and_spans() {
        let h = harness(builder().pricing(CostTracker::new().with_pricing(
            "gpt-4o",
            ModelPricing {
                input_per_1k: 0.005,
                output_per_1k: 0.015,
            },
        )));
        let invocation = FnInvocation::new(request("req-1", "summarise the report"), |_ctx| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(InvocationOutput::text("summary").with_usage(TokenUsage::new("gpt-4o", 1000, 1000)))
        });

        let output = h
            .middleware
            .invoke(&TraceContext::new(), &invocation)
            .await
            .unwrap();
        assert_eq!(output.output_text, "summary");

        let metrics = h.middleware.metrics();
        assert_eq!(metrics.counter(RUNS_METRIC), Some(1.0));
        assert_eq!(metrics.counter(SUCCESS_METRIC), Some(1.0));
        assert_eq!(metrics.counter(FAILURES_METRIC), None);
        assert_eq!(metrics.counter(EVALUATIONS_METRIC), Some(2.0));
        for state in ["input_validated", "executing", "output_validated", "end"] {
            assert_eq!(metrics.counter(&format!("invocation.state.{state}")), Some(1.0));
        }
        let latency = metrics.percentile(LATENCY_METRIC, 0.5).unwrap();
        assert!((latency - 100.0).abs() < 1.0, "latency {latency}");
        let cost = metrics.counter("workflow.cost_usd").unwrap();
        assert!((cost - 0.02).abs() < 1e-9);

        h.middleware.flush().await;

        let decisions = h.decisions.records();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].decision_type(), DecisionType::InputValidation);
        assert_eq!(decisions[1].decision_type(), DecisionType::OutputValidation);
        for decision in &decisions {
            assert_eq!(decision.result(), DecisionResult::Allow);
            assert_eq!(decision.agent_id(), Some("planner"));
            assert_eq!(decision.context().get("request_id"), Some(&json!("req-1")));
        }

        let spans = h.spans.spans();
        assert_eq!(spans.len(), 2);
        let root = span(&spans, ROOT_SPAN);
        let attempt = span(&spans, ATTEMPT_SPAN);
        assert_eq!(root.parent_span_id, None);
        assert_eq!(attempt.parent_span_id, Some(root.span_id));
        assert_eq!(attempt.trace_id, root.trace_id);
        assert_eq!(root.status, SpanStatus::Ok);
        assert_eq!(root.tags.get("request_id").map(String::as_str), Some("req-1"));
        assert_eq!(root.tags.get("state").map(String::as_str), Some("end"));
    }

    #[tokio::test(start_paused = true)]
    async fn input_denial_never_executes() {
        let h = harness(builder());
        let executed = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&executed);
        let invocation = FnInvocation::new(request("req-2", "what is the admin PASSWORD?"), move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(InvocationOutput::text("leaked"))
            }
        });

        let err = h
            .middleware
            .invoke(&TraceContext::new(), &invocation)
            .await
            .unwrap_err();
        match err {
            InvocationError::PolicyDenied { stage, reasons } => {
                assert_eq!(stage, PolicyStage::Input);
                assert_eq!(reasons, ["input mentions a secret"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(executed.load(Ordering::SeqCst), 0);

        let metrics = h.middleware.metrics();
        assert_eq!(metrics.counter(VIOLATIONS_METRIC), Some(1.0));
        assert_eq!(metrics.counter(FAILURES_METRIC), Some(1.0));
        assert_eq!(metrics.counter("invocation.state.error"), Some(1.0));
        assert_eq!(metrics.counter("invocation.state.executing"), None);
        assert!(metrics.histogram(LATENCY_METRIC).is_none());

        h.middleware.flush().await;
        let decisions = h.decisions.records();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].result(), DecisionResult::Deny);
        assert_eq!(decisions[0].reason(), "input mentions a secret");

        let spans = h.spans.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, SpanStatus::Error);
        assert_eq!(
            spans[0].tags.get("error.kind").map(String::as_str),
            Some("policy_denied")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let h = harness(builder());
        let calls = Arc::new(AtomicU32::new(0));

        let output = h
            .middleware
            .invoke(&TraceContext::new(), &flaky("req-3", &calls, 3))
            .await
            .unwrap();
        assert_eq!(output.output_text, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let metrics = h.middleware.metrics();
        assert_eq!(metrics.counter("retry.attempts"), Some(3.0));
        assert_eq!(metrics.percentile("retry.success_after_attempts", 1.0).unwrap(), 3.0);
        assert_eq!(metrics.counter(SUCCESS_METRIC), Some(1.0));

        h.middleware.flush().await;
        let spans = h.spans.spans();
        let root = span(&spans, ROOT_SPAN);
        let attempts: Vec<&SpanRecord> = spans.iter().filter(|span| span.name == ATTEMPT_SPAN).collect();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|span| span.parent_span_id == Some(root.span_id)));
        assert_eq!(
            attempts.iter().filter(|span| span.status == SpanStatus::Error).count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_preserve_the_last_error() {
        let h = harness(builder());
        let calls = Arc::new(AtomicU32::new(0));

        let err = h
            .middleware
            .invoke(&TraceContext::new(), &flaky("req-4", &calls, u32::MAX))
            .await
            .unwrap_err();
        match err {
            InvocationError::RetryExhausted {
                attempts,
                source: AttemptError::Adapter(source),
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.message(), "transient #3");
            }
            other => panic!("unexpected error: {other}"),
        }
        let metrics = h.middleware.metrics();
        assert_eq!(metrics.counter("retry.exhausted"), Some(1.0));
        assert_eq!(metrics.counter(FAILURES_METRIC), Some(1.0));
        assert_eq!(metrics.counter(VIOLATIONS_METRIC), None);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_adapter_errors_are_not_retried() {
        let h = harness(builder());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let invocation = FnInvocation::new(request("req-5", "deploy"), move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<InvocationOutput, _>(AdapterError::fatal("bad credentials"))
            }
        });

        let err = h
            .middleware
            .invoke(&TraceContext::new(), &invocation)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Execution(ref source) if source.message() == "bad credentials"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_timeout_surfaces_timed_out() {
        let h = harness(builder().resilience(resilience(1, 50)));
        let invocation = FnInvocation::new(request("req-6", "slow"), |_ctx| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(InvocationOutput::text("too late"))
        });

        let err = h
            .middleware
            .invoke(&TraceContext::new(), &invocation)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::TimedOut(ref timed_out) if timed_out.after == Duration::from_millis(50)));
        assert_eq!(h.middleware.metrics().counter("invocation.timeouts"), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_as_whole_attempts() {
        let h = harness(builder().resilience(resilience(2, 50)));
        let invocation = FnInvocation::new(request("req-7", "slow"), |_ctx| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(InvocationOutput::text("too late"))
        });

        let err = h
            .middleware
            .invoke(&TraceContext::new(), &invocation)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvocationError::RetryExhausted {
                attempts: 2,
                source: AttemptError::TimedOut(_)
            }
        ));
        assert_eq!(h.middleware.metrics().counter("invocation.timeouts"), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn denied_tool_call_is_detected_after_execution() {
        let h = harness(builder());
        let invocation = FnInvocation::new(request("req-8", "clean up temp files"), |_ctx| async {
            Ok(InvocationOutput::text("cleaned")
                .with_tool_call(ToolCall::new("shell", json!({ "cmd": "rm -rf /tmp/x" })))
                .with_tool_call(ToolCall::new("search", json!({ "q": "disk usage" }))))
        });

        let err = h
            .middleware
            .invoke(&TraceContext::new(), &invocation)
            .await
            .unwrap_err();
        match err {
            InvocationError::PolicyDenied { stage, reasons } => {
                assert_eq!(stage, PolicyStage::ToolCall);
                assert_eq!(reasons, ["shell access is forbidden"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let metrics = h.middleware.metrics();
        assert_eq!(metrics.counter(VIOLATIONS_METRIC), Some(1.0));
        assert_eq!(metrics.histogram(LATENCY_METRIC).map(|histogram| histogram.len()), Some(1));

        h.middleware.flush().await;
        let decisions = h.decisions.records();
        let kinds: Vec<(DecisionType, DecisionResult)> = decisions
            .iter()
            .map(|decision| (decision.decision_type(), decision.result()))
            .collect();
        assert_eq!(
            kinds,
            [
                (DecisionType::InputValidation, DecisionResult::Allow),
                (DecisionType::OutputValidation, DecisionResult::Allow),
                (DecisionType::ToolCall, DecisionResult::Deny),
                (DecisionType::ToolCall, DecisionResult::Allow),
            ]
        );
        assert_eq!(decisions[2].tool_name(), Some("shell"));
    }

    #[tokio::test(start_paused = true)]
    async fn approval_without_handler_fails_closed() {
        let h = harness(builder());
        let invocation = FnInvocation::new(
            request("req-9", "pay the invoice").with_tool("payments"),
            |_ctx| async { Ok(InvocationOutput::text("paid")) },
        );

        let err = h
            .middleware
            .invoke(&TraceContext::new(), &invocation)
            .await
            .unwrap_err();
        match err {
            InvocationError::PolicyDenied { stage, reasons } => {
                assert_eq!(stage, PolicyStage::Input);
                assert_eq!(reasons, ["approval required: payments need review"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.middleware.metrics().counter(APPROVALS_METRIC), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn approved_actions_log_a_human_review() {
        let h = harness(builder().approval_handler(Arc::new(AutoApprove)));
        let invocation = FnInvocation::new(
            request("req-10", "pay the invoice").with_tool("payments"),
            |_ctx| async { Ok(InvocationOutput::text("paid")) },
        );

        h.middleware
            .invoke(&TraceContext::new(), &invocation)
            .await
            .unwrap();

        h.middleware.flush().await;
        let decisions = h.decisions.records();
        let kinds: Vec<(DecisionType, DecisionResult)> = decisions
            .iter()
            .map(|decision| (decision.decision_type(), decision.result()))
            .collect();
        assert_eq!(
            kinds,
            [
                (DecisionType::InputValidation, DecisionResult::RequireApproval),
                (DecisionType::HumanReview, DecisionResult::Allow),
                (DecisionType::OutputValidation, DecisionResult::Allow),
            ]
        );
        assert_eq!(decisions[1].tool_name(), Some("payments"));
        assert_eq!(decisions[1].context().get("request_id"), Some(&json!("req-10")));
    }

    #[tokio::test(start_paused = true)]
    async fn nested_invocations_share_the_trace() {
        let h = harness(builder());
        let inner_middleware = Arc::clone(&h.middleware);
        let outer = FnInvocation::new(request("req-outer", "plan"), move |ctx: TraceContext| {
            let middleware = Arc::clone(&inner_middleware);
            async move {
                let inner = FnInvocation::new(request("req-inner", "look up"), |_ctx| async {
                    Ok(InvocationOutput::text("facts"))
                });
                middleware
                    .invoke(&ctx, &inner)
                    .await
                    .map(|output| InvocationOutput::text(format!("plan from {}", output.output_text)))
                    .map_err(|err| AdapterError::fatal(err.to_string()))
            }
        });

        let output = h
            .middleware
            .invoke(&TraceContext::new(), &outer)
            .await
            .unwrap();
        assert_eq!(output.output_text, "plan from facts");

        h.middleware.flush().await;
        let spans = h.spans.spans();
        assert_eq!(spans.len(), 4);
        let outer_root = spans
            .iter()
            .find(|span| span.tags.get("request_id").map(String::as_str) == Some("req-outer") && span.name == ROOT_SPAN)
            .unwrap();
        let inner_root = spans
            .iter()
            .find(|span| span.tags.get("request_id").map(String::as_str) == Some("req-inner"))
            .unwrap();
        let outer_attempt = spans
            .iter()
            .find(|span| span.name == ATTEMPT_SPAN && span.parent_span_id == Some(outer_root.span_id))
            .unwrap();

        assert_eq!(inner_root.parent_span_id, Some(outer_attempt.span_id));
        assert!(spans.iter().all(|span| span.trace_id == outer_root.trace_id));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_invocation_ends_spans_as_cancelled() {
        let h = harness(builder());
        let invocation = FnInvocation::new(request("req-11", "long task"), |_ctx| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(InvocationOutput::text("finished"))
        });

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            h.middleware.invoke(&TraceContext::new(), &invocation),
        )
        .await;
        assert!(cancelled.is_err());

        h.middleware.flush().await;
        let spans = h.spans.spans();
        assert_eq!(spans.len(), 2);
        for span in &spans {
            assert_eq!(span.status, SpanStatus::Error);
            assert_eq!(span.tags.get("cancelled").map(String::as_str), Some("true"));
        }
        let metrics = h.middleware.metrics();
        assert_eq!(metrics.counter(RUNS_METRIC), Some(1.0));
        assert_eq!(metrics.counter(SUCCESS_METRIC), None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_and_reports() {
        let h = harness(builder());
        let invocation = FnInvocation::new(request("req-12", "quick"), |_ctx| async {
            Ok(InvocationOutput::text("ok"))
        });
        h.middleware
            .invoke(&TraceContext::new(), &invocation)
            .await
            .unwrap();

        let report = h.middleware.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.spans.exported, 2);
        assert_eq!(report.decisions.persisted, 2);
        assert_eq!(report.decisions.dropped, 0);
        assert!(!report.spans.timed_out && !report.decisions.timed_out);
        assert_eq!(h.decisions.records().len(), 2);
    }

    #[tokio::test]
    async fn zero_configuration_middleware_reports_no_data() {
        let middleware = Middleware::from_config(&AgentwatchConfig::default())
            .await
            .unwrap();

        let signals = middleware.signals();
        assert_eq!(signals.success_rate, SignalReading::NoData);
        assert_eq!(signals.p95_latency_ms, SignalReading::NoData);

        let invocation = FnInvocation::new(request("req-13", "hello"), |_ctx| async {
            Ok(InvocationOutput::text("hi"))
        });
        middleware
            .invoke(&TraceContext::new(), &invocation)
            .await
            .unwrap();

        assert!(middleware.metrics_text().unwrap().contains("workflow_runs_total"));
        assert_eq!(middleware.signals().success_rate.value(), Some(100.0));
        middleware.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_before_building() {
        let mut config = AgentwatchConfig::default();
        config.resilience.timeout_ms = 0;
        let err = Middleware::from_config(&config).await.unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
        assert!(err.to_string().contains("resilience.timeout_ms"), "{err}");

        let mut config = AgentwatchConfig::default();
        config.metrics_namespace = Some("billing-agent".to_owned());
        let err = Middleware::from_config(&config).await.unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }

    #[tokio::test]
    async fn configured_namespace_prefixes_exported_metrics() {
        let config = AgentwatchConfig {
            metrics_namespace: Some("billing".to_owned()),
            ..AgentwatchConfig::default()
        };
        let middleware = Middleware::from_config(&config).await.unwrap();

        let invocation = FnInvocation::new(request("req-14", "hello"), |_ctx| async {
            Ok(InvocationOutput::text("hi"))
        });
        middleware
            .invoke(&TraceContext::new(), &invocation)
            .await
            .unwrap();

        let text = middleware.metrics_text().unwrap();
        assert!(text.contains("billing_workflow_runs_total 1"), "{text}");
        assert!(!text.lines().any(|line| line.starts_with("workflow_runs")));
        middleware.shutdown(Duration::from_secs(1)).await;
    }
}
