//! 통합 테스트 -- 예제 규칙 번들로 트랜잭션 검사부터 스팬 상관까지
//!
//! 내장 SecLang 엔진과 `engine/rules`의 번들을 사용하여 실제 탐지 흐름을 검증합니다.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};

use ocinspect_core::error::{CorrelationError, ViolationKind};
use ocinspect_core::finding::{Finding, InspectionStatus};
use ocinspect_core::pipeline::Pipeline;
use ocinspect_core::record::{ATTR_FINDINGS, ATTR_STATUS, ATTR_TRUNCATED, CorrelatedRecord, SpanRecord};
use ocinspect_core::transaction::RawTransaction;
use ocinspect_core::types::{Phase, Severity};
use ocinspect_engine::{RuleBundle, SecLangEngine};
use ocinspect_pipeline::{
    ActivationError, EngineSupervisor, InspectionStage, InspectionStageBuilder, PipelineConfig,
};

const SQLI_PAYLOAD: &str = "1' OR '1'='1";
const SQLI_FORM: &str = "param1=1%27%20OR%20%271%27%3D%271";

async fn sample_supervisor() -> Arc<EngineSupervisor<SecLangEngine>> {
    let base = RuleBundle::from_path(common::sample_rules("base")).await.unwrap();
    let overrides = RuleBundle::from_path(common::sample_rules("overrides"))
        .await
        .unwrap();
    let supervisor = EngineSupervisor::new(SecLangEngine::new().unwrap());
    supervisor.load_and_activate(&base, &overrides).unwrap();
    Arc::new(supervisor)
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        timeout_ms: 2_000,
        span_hold_ms: 5_000,
        ..PipelineConfig::default()
    }
}

async fn stage_with(
    config: PipelineConfig,
) -> (
    InspectionStage<SecLangEngine>,
    mpsc::Receiver<CorrelatedRecord>,
) {
    let (stage, rx) = InspectionStageBuilder::new()
        .config(config)
        .supervisor(sample_supervisor().await)
        .build()
        .unwrap();
    (stage, rx.unwrap())
}

fn form_post(correlation_id: &str, body: &str) -> RawTransaction {
    RawTransaction::new(correlation_id, "POST", "/login")
        .with_request_header("Host", "shop.example.com")
        .with_request_header("User-Agent", "Mozilla/5.0")
        .with_request_header("Content-Type", "application/x-www-form-urlencoded")
        .with_request_body(body)
        .with_response_status(200)
}

async fn next_record(rx: &mut mpsc::Receiver<CorrelatedRecord>) -> CorrelatedRecord {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("record within 5s")
        .expect("channel open")
}

#[tokio::test]
async fn sqli_in_body_is_attached_to_span() {
    let (mut stage, mut rx) = stage_with(test_config()).await;
    stage.start().await.unwrap();

    let mut span = SpanRecord::new("span-1");
    span.trace_id = "4bf92f3577b34da6a3ce929d0e0e4736".to_owned();
    span.name = "POST /login".to_owned();
    stage.correlator().register_span(span).await.unwrap();
    stage
        .transaction_sender()
        .send(form_post("span-1", SQLI_FORM))
        .await
        .unwrap();

    let CorrelatedRecord::EnrichedSpan(span) = next_record(&mut rx).await else {
        panic!("expected enriched span");
    };
    assert_eq!(span.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
    assert_eq!(span.attributes[ATTR_STATUS], "completed");
    assert_eq!(span.attributes[ATTR_TRUNCATED], "false");

    let findings: Vec<Finding> = serde_json::from_str(&span.attributes[ATTR_FINDINGS]).unwrap();
    let sqli = findings
        .iter()
        .find(|f| f.rule_id == 942100)
        .expect("SQLi finding");
    assert_eq!(sqli.phase, Phase::RequestBody);
    assert_eq!(sqli.severity, Severity::Critical);
    assert!(sqli.anomaly_score > 0);
    assert_eq!(sqli.matched_field.as_deref(), Some("ARGS:param1"));
    assert!(!sqli.match_message.contains(SQLI_PAYLOAD));
    assert!(sqli.match_message.contains("***"));

    stage.stop().await.unwrap();
}

#[tokio::test]
async fn benign_request_completes_without_findings() {
    let (stage, _rx) = stage_with(test_config()).await;
    let outcome = stage
        .inspector()
        .inspect(form_post("span-2", "param1=hello&search=shoes"))
        .await
        .unwrap();

    assert_eq!(outcome.status, InspectionStatus::Completed);
    assert!(!outcome.partial);
    assert!(outcome.findings.is_empty());
    assert_eq!(outcome.phases_completed, Phase::ALL.to_vec());
    assert!(outcome.rule_set_version.unwrap().ends_with("#1"));
}

#[tokio::test]
async fn truncated_body_prefix_still_produces_tagged_findings() {
    let config = PipelineConfig {
        max_body_bytes: 64,
        ..test_config()
    };
    let (stage, _rx) = stage_with(config).await;
    let body = format!("{SQLI_FORM}&pad={}", "a".repeat(512));

    let outcome = stage
        .inspector()
        .inspect(form_post("span-3", &body))
        .await
        .unwrap();

    assert_eq!(outcome.status, InspectionStatus::Completed);
    assert!(outcome.truncated);
    let sqli = outcome
        .findings
        .iter()
        .find(|f| f.rule_id == 942100)
        .expect("finding from retained prefix");
    assert!(sqli.truncated);
}

#[tokio::test]
async fn response_leak_and_scanner_are_reported_in_their_phases() {
    let (stage, _rx) = stage_with(test_config()).await;
    let raw = RawTransaction::new("span-4", "GET", "/products?id=7")
        .with_request_header("Host", "shop.example.com")
        .with_request_header("User-Agent", "sqlmap/1.7.2#stable")
        .with_response_status(500)
        .with_response_header("Content-Type", "text/html")
        .with_response_body("You have an error in your SQL syntax; check the manual that corresponds to your MySQL server");

    let outcome = stage.inspector().inspect(raw).await.unwrap();
    let phases: Vec<(u64, Phase)> = outcome.findings.iter().map(|f| (f.rule_id, f.phase)).collect();
    assert!(phases.contains(&(913100, Phase::RequestHeaders)));
    assert!(phases.contains(&(951100, Phase::ResponseBody)));
}

#[tokio::test]
async fn override_excluded_parameter_is_not_reported() {
    let (stage, _rx) = stage_with(test_config()).await;
    let outcome = stage
        .inspector()
        .inspect(form_post("span-5", "search=1%27%20OR%20%271%27%3D%271"))
        .await
        .unwrap();
    assert!(outcome.findings.iter().all(|f| f.rule_id != 942100));
}

#[tokio::test]
async fn rejected_reload_keeps_previous_rule_set_serving() {
    let supervisor = sample_supervisor().await;
    let mut base = RuleBundle::from_path(common::sample_rules("base")).await.unwrap();
    base.push_source(
        "dup.conf",
        "SecRule ARGS \"@contains x\" \"id:942100,phase:2,msg:'duplicate'\"",
    );

    let err = supervisor
        .load_and_activate(&base, &RuleBundle::empty())
        .unwrap_err();
    let ActivationError::Config(config_error) = err else {
        panic!("expected rule bundle rejection");
    };
    let duplicate = config_error
        .violations()
        .iter()
        .find(|v| v.kind == ViolationKind::DuplicateRuleId)
        .expect("duplicate id violation");
    assert!(duplicate.detail.contains("942100"));

    let (stage, _rx) = InspectionStageBuilder::new()
        .config(test_config())
        .supervisor(supervisor)
        .build()
        .unwrap();
    let outcome = stage
        .inspector()
        .inspect(form_post("span-6", SQLI_FORM))
        .await
        .unwrap();
    assert!(outcome.rule_set_version.unwrap().ends_with("#1"));
    assert!(outcome.findings.iter().any(|f| f.rule_id == 942100));
}

#[tokio::test]
async fn findings_after_span_forwarded_become_standalone() {
    let (stage, mut rx) = stage_with(test_config()).await;
    stage
        .correlator()
        .register_span(SpanRecord::new("span-7"))
        .await
        .unwrap();

    let forwarded = stage
        .correlator()
        .sweep(Instant::now() + Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(forwarded, 1);
    assert!(matches!(next_record(&mut rx).await, CorrelatedRecord::Span(_)));

    stage
        .inspector()
        .process(form_post("span-7", SQLI_FORM))
        .await
        .unwrap();
    let CorrelatedRecord::Standalone(standalone) = next_record(&mut rx).await else {
        panic!("expected standalone findings");
    };
    assert_eq!(standalone.correlation_id, "span-7");
    assert!(standalone.outcome.findings.iter().any(|f| f.rule_id == 942100));
}

#[tokio::test]
async fn second_attach_for_same_transaction_is_rejected() {
    let (stage, mut rx) = stage_with(test_config()).await;
    let inspector = stage.inspector();

    inspector.process(form_post("span-8", "a=1")).await.unwrap();
    let err = inspector
        .process(form_post("span-8", "a=1"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CorrelationError::AlreadyAttached {
            correlation_id: "span-8".to_owned()
        }
    );

    assert!(matches!(
        next_record(&mut rx).await,
        CorrelatedRecord::Standalone(_)
    ));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn stop_drains_queued_transactions_and_flushes_spans() {
    let (mut stage, mut rx) = stage_with(test_config()).await;
    stage
        .correlator()
        .register_span(SpanRecord::new("orphan"))
        .await
        .unwrap();
    stage.start().await.unwrap();

    let sender = stage.transaction_sender();
    for i in 0..20 {
        sender
            .send(form_post(&format!("queued-{i}"), "q=1"))
            .await
            .unwrap();
    }
    stage.stop().await.unwrap();

    let mut standalone = 0;
    let mut spans = 0;
    while let Ok(record) = rx.try_recv() {
        match record {
            CorrelatedRecord::Standalone(_) => standalone += 1,
            CorrelatedRecord::Span(_) => spans += 1,
            CorrelatedRecord::EnrichedSpan(_) => panic!("no span was registered for queued transactions"),
        }
    }
    assert_eq!(standalone, 20);
    assert_eq!(spans, 1);
    assert!(stage.supervisor().current_rule_set().is_none());
}
