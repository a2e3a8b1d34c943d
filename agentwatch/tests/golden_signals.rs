//! Golden signals derived from a mixed workload driven through the middleware.

use std::sync::Arc;
use std::time::Duration;

use agentwatch::Middleware;
use agentwatch::kernel::{FnInvocation, InvocationError, InvocationOutput, InvocationRequest};
use agentwatch::policy::{
    Condition, DecisionLogConfig, DecisionResult, DecisionType, MemoryDecisionSink, PolicyRule,
    RuleSet, TextField,
};
use agentwatch::telemetry::{SignalReading, SignalStatus};
use agentwatch::trace::{BatchConfig, InMemorySpanExporter, TraceContext};

fn rules() -> RuleSet {
    RuleSet::default().with_rule(
        PolicyRule::deny(
            "no-secrets",
            "input mentions a secret",
            Condition::text_contains(TextField::Input, "password"),
        )
        .unwrap(),
    )
}

fn reading(reading: SignalReading) -> (f64, SignalStatus) {
    match reading {
        SignalReading::Value { value, status } => (value, status),
        SignalReading::NoData => panic!("expected a value"),
    }
}

#[tokio::test(start_paused = true)]
async fn mixed_workload_yields_expected_signals() {
    let spans = InMemorySpanExporter::new();
    let decisions = MemoryDecisionSink::new();
    let middleware = Middleware::builder()
        .rules(rules())
        .unwrap()
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

    let mut denied = 0;
    for index in 0..100_u32 {
        let (input, latency_ms) = match index {
            0..=4 => ("what is the admin password", 0),
            5..=9 => ("summarise the long report", 120),
            _ => ("summarise the report", 100),
        };
        let invocation = FnInvocation::new(
            InvocationRequest::new(format!("req-{index}"), "summariser", input),
            move |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(latency_ms)).await;
                Ok(InvocationOutput::text("summary").with_cost(0.01))
            },
        );

        match middleware.invoke(&TraceContext::new(), &invocation).await {
            Ok(output) => assert_eq!(output.output_text, "summary"),
            Err(InvocationError::PolicyDenied { reasons, .. }) => {
                assert_eq!(reasons, vec!["input mentions a secret".to_owned()]);
                denied += 1;
            }
            Err(other) => panic!("unexpected failure: {other}"),
        }
    }
    assert_eq!(denied, 5);

    let signals = middleware.signals();
    let (success_rate, success_status) = reading(signals.success_rate);
    assert!((success_rate - 95.0).abs() < 1e-9);
    assert_eq!(success_status, SignalStatus::Healthy);

    let (p95, p95_status) = reading(signals.p95_latency_ms);
    assert!((p95 - 120.0).abs() < 1e-6, "p95 was {p95}");
    assert_eq!(p95_status, SignalStatus::Healthy);

    let (cost, _) = reading(signals.cost_per_successful_task_usd);
    assert!((cost - 0.01).abs() < 1e-9);

    let (violation_rate, _) = reading(signals.policy_violation_rate_percent);
    assert!((violation_rate - 5.0).abs() < 1e-9);

    middleware.flush().await;

    // Every successful run logs an input and an output decision.
    let records = decisions.records();
    assert_eq!(records.len(), 5 + 95 * 2);
    let denials: Vec<_> = records
        .iter()
        .filter(|record| record.result() == DecisionResult::Deny)
        .collect();
    assert_eq!(denials.len(), 5);
    assert!(
        denials
            .iter()
            .all(|record| record.decision_type() == DecisionType::InputValidation)
    );

    // One root span and one attempt span per executed invocation, a root only
    // for the denied ones.
    assert_eq!(spans.spans().len(), 95 * 2 + 5);
}

#[tokio::test]
async fn signals_report_no_data_before_any_run() {
    let middleware = Middleware::builder().build();
    let signals = middleware.signals();

    assert_eq!(signals.success_rate, SignalReading::NoData);
    assert_eq!(signals.p95_latency_ms, SignalReading::NoData);
    assert_eq!(signals.cost_per_successful_task_usd, SignalReading::NoData);
    assert_eq!(signals.policy_violation_rate_percent, SignalReading::NoData);
    assert_eq!(signals.overall(), None);
}
