//! 장애 주입 테스트 -- 컨텍스트 해제, 단계 순서, 규칙 집합 교체, 엔진 재초기화
//!
//! 스크립트 바인딩으로 에러, 시간 초과, panic, 치명적 에러를 주입하고
//! 컨텍스트 생성과 해제가 정확히 짝을 이루는지 확인합니다.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ocinspect_core::error::EngineError;
use ocinspect_core::finding::InspectionStatus;
use ocinspect_core::pipeline::{HealthStatus, Pipeline};
use ocinspect_core::types::{HeaderCase, Phase};
use ocinspect_engine::RuleBundle;
use ocinspect_pipeline::{
    EngineSupervisor, InspectionStageBuilder, Inspector, Normalizer, PipelineConfig,
};

use common::{Counters, Fault, ScriptedBinding, get};

const V1: &str = "SecRule REQUEST_METHOD \"@streq GET\" \"id:1,phase:1,msg:'v1'\"";
const V2: &str = "SecRule REQUEST_METHOD \"@streq GET\" \"id:2,phase:1,msg:'v2'\"";

fn activate(supervisor: &EngineSupervisor<ScriptedBinding>, rules: &str) -> String {
    supervisor
        .load_and_activate(&RuleBundle::inline(rules), &RuleBundle::empty())
        .unwrap()
        .label()
        .to_owned()
}

fn inspector(
    supervisor: Arc<EngineSupervisor<ScriptedBinding>>,
    timeout_ms: u64,
) -> Inspector<ScriptedBinding> {
    let config = PipelineConfig {
        timeout_ms,
        span_hold_ms: timeout_ms.max(2_000),
        ..PipelineConfig::default()
    };
    let (stage, _rx) = InspectionStageBuilder::new()
        .config(config)
        .supervisor(supervisor)
        .build()
        .unwrap();
    stage.inspector().clone()
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn timeout_in_response_body_keeps_three_phases() {
    let supervisor = Arc::new(EngineSupervisor::new(ScriptedBinding::new()));
    activate(&supervisor, V1);
    let binding = supervisor.binding();
    let counters = binding.counters();
    binding.inject("slow", Phase::ResponseBody, Fault::Hang(Duration::from_millis(400)));

    let outcome = inspector(Arc::clone(&supervisor), 150)
        .inspect(get("slow"))
        .await
        .unwrap();

    assert_eq!(outcome.status, InspectionStatus::TimedOut);
    assert!(outcome.partial);
    assert_eq!(
        outcome.phases_completed,
        vec![Phase::RequestHeaders, Phase::RequestBody, Phase::ResponseHeaders]
    );
    let rule_ids: Vec<u64> = outcome.findings.iter().map(|f| f.rule_id).collect();
    assert_eq!(rule_ids, vec![1001, 1002, 1003]);

    // 버려진 호출이 돌아오면 컨텍스트가 해제됨
    assert_eq!(counters.created(), 1);
    wait_for(|| counters.released() == 1).await;
}

#[tokio::test]
async fn context_released_exactly_once_on_every_path() {
    let supervisor = Arc::new(EngineSupervisor::new(ScriptedBinding::new()));
    activate(&supervisor, V1);
    let binding = supervisor.binding();
    let counters = binding.counters();
    binding.inject("err-2", Phase::RequestBody, Fault::Error);
    binding.inject("err-4", Phase::ResponseBody, Fault::Error);
    binding.inject("hang-3", Phase::ResponseHeaders, Fault::Hang(Duration::from_millis(300)));

    let inspector = inspector(Arc::clone(&supervisor), 100);
    let ids = ["ok-1", "err-2", "hang-3", "err-4", "ok-5"];
    let mut tasks = Vec::new();
    for id in ids {
        let inspector = inspector.clone();
        tasks.push(tokio::spawn(async move {
            inspector.inspect(get(id)).await.unwrap()
        }));
    }
    let mut statuses = BTreeMap::new();
    for task in tasks {
        let outcome = task.await.unwrap();
        statuses.insert(outcome.correlation_id.clone(), outcome);
    }

    assert_eq!(statuses["ok-1"].status, InspectionStatus::Completed);
    assert_eq!(statuses["ok-5"].status, InspectionStatus::Completed);
    assert!(matches!(statuses["err-2"].status, InspectionStatus::Failed { .. }));
    assert_eq!(statuses["err-2"].phases_completed, vec![Phase::RequestHeaders]);
    assert!(matches!(statuses["err-4"].status, InspectionStatus::Failed { .. }));
    assert_eq!(statuses["err-4"].findings.len(), 3);
    assert_eq!(statuses["hang-3"].status, InspectionStatus::TimedOut);

    wait_for(|| counters.released() == ids.len()).await;
    assert_eq!(counters.created(), ids.len());
    assert_eq!(supervisor.in_flight(), 0);
}

#[tokio::test]
async fn phases_are_evaluated_in_order_per_context() {
    let supervisor = Arc::new(EngineSupervisor::new(ScriptedBinding::new()));
    activate(&supervisor, V1);
    let binding = supervisor.binding();

    let inspector = inspector(Arc::clone(&supervisor), 2_000);
    let mut tasks = Vec::new();
    for i in 0..32 {
        let inspector = inspector.clone();
        tasks.push(tokio::spawn(async move {
            inspector.inspect(get(&format!("tx-{i}"))).await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().status, InspectionStatus::Completed);
    }

    let mut per_context: BTreeMap<u64, Vec<Phase>> = BTreeMap::new();
    for (context, phase) in binding.evaluated() {
        per_context.entry(context).or_default().push(phase);
    }
    assert_eq!(per_context.len(), 32);
    for phases in per_context.values() {
        assert_eq!(phases, &Phase::ALL.to_vec());
    }
    assert_eq!(binding.counters().order_violations(), 0);
}

#[test]
fn context_guard_rejects_out_of_order_phases_for_lax_binding() {
    let supervisor = EngineSupervisor::new(ScriptedBinding::without_order_check());
    activate(&supervisor, V1);
    let tx = Normalizer::new(HeaderCase::Lower, 1024)
        .normalize(&get("lax"))
        .unwrap();
    let mut guard = supervisor.acquire().unwrap();

    let err = guard.evaluate_phase(Phase::ResponseBody, &tx).unwrap_err();
    assert!(matches!(
        err,
        EngineError::PhaseOrder {
            expected: Some(Phase::RequestHeaders),
            got: Phase::ResponseBody
        }
    ));
    assert!(supervisor.binding().evaluated().is_empty());

    guard.evaluate_phase(Phase::RequestHeaders, &tx).unwrap();
    let repeated = guard.evaluate_phase(Phase::RequestHeaders, &tx).unwrap_err();
    assert!(matches!(
        repeated,
        EngineError::PhaseOrder {
            expected: Some(Phase::RequestBody),
            got: Phase::RequestHeaders
        }
    ));
    assert_eq!(guard.next_phase(), Some(Phase::RequestBody));
    assert_eq!(supervisor.binding().evaluated().len(), 1);
}

#[tokio::test]
async fn in_flight_transaction_completes_under_its_rule_set() {
    let supervisor = Arc::new(EngineSupervisor::new(ScriptedBinding::new()));
    let v1 = activate(&supervisor, V1);
    let binding = supervisor.binding();
    let counters = binding.counters();
    binding.inject("slow", Phase::RequestBody, Fault::Hang(Duration::from_millis(300)));

    let inspector = inspector(Arc::clone(&supervisor), 5_000);
    let slow = {
        let inspector = inspector.clone();
        tokio::spawn(async move { inspector.inspect(get("slow")).await.unwrap() })
    };
    wait_for(|| counters.created() == 1).await;

    let v2 = activate(&supervisor, V2);
    assert_ne!(v1, v2);
    let fast = inspector.inspect(get("fast")).await.unwrap();
    assert!(fast.rule_set_version.as_deref().unwrap().ends_with("#2"));
    assert!(fast.findings.iter().all(|f| f.message == v2));

    // v1은 느린 트랜잭션의 컨텍스트가 해제될 때까지 유지됨
    assert_eq!(counters.unloaded(), 0);

    let slow = slow.await.unwrap();
    assert_eq!(slow.status, InspectionStatus::Completed);
    assert!(slow.rule_set_version.as_deref().unwrap().ends_with("#1"));
    assert!(slow.findings.iter().all(|f| f.message == v1));
    assert_eq!(counters.unloaded(), 1);
}

#[tokio::test]
async fn fatal_error_reinitializes_engine_once() {
    let counters = Arc::new(Counters::default());
    let factory_counters = Arc::clone(&counters);
    let supervisor = Arc::new(
        EngineSupervisor::with_factory(move || {
            Ok(ScriptedBinding::with_counters(Arc::clone(&factory_counters)))
        })
        .unwrap(),
    );
    activate(&supervisor, V1);
    supervisor
        .binding()
        .inject("boom", Phase::RequestHeaders, Fault::Fatal);
    assert_eq!(supervisor.handle().epoch(), 0);

    let inspector = inspector(Arc::clone(&supervisor), 2_000);
    let failed = inspector.inspect(get("boom")).await.unwrap();
    assert!(matches!(failed.status, InspectionStatus::Failed { .. }));

    assert_eq!(supervisor.handle().epoch(), 1);
    assert_eq!(supervisor.health(), HealthStatus::Healthy);
    // 활성 규칙 소스가 새 바인딩으로 다시 컴파일됨
    assert_eq!(counters.loaded(), 2);

    let ok = inspector.inspect(get("boom")).await.unwrap();
    assert_eq!(ok.status, InspectionStatus::Completed);
    assert_eq!(counters.created(), counters.released());
}

#[tokio::test]
async fn engine_panic_is_isolated_as_fatal() {
    let counters = Arc::new(Counters::default());
    let factory_counters = Arc::clone(&counters);
    let supervisor = Arc::new(
        EngineSupervisor::with_factory(move || {
            Ok(ScriptedBinding::with_counters(Arc::clone(&factory_counters)))
        })
        .unwrap(),
    );
    activate(&supervisor, V1);
    supervisor
        .binding()
        .inject("panic", Phase::RequestBody, Fault::Panic);

    let inspector = inspector(Arc::clone(&supervisor), 2_000);
    let outcome = inspector.inspect(get("panic")).await.unwrap();
    let InspectionStatus::Failed { reason } = &outcome.status else {
        panic!("expected failure, got {:?}", outcome.status);
    };
    assert!(reason.contains("panicked"));
    assert_eq!(outcome.phases_completed, vec![Phase::RequestHeaders]);

    assert_eq!(supervisor.handle().epoch(), 1);
    assert_eq!(counters.created(), counters.released());
    let next = inspector.inspect(get("after")).await.unwrap();
    assert_eq!(next.status, InspectionStatus::Completed);
}

#[tokio::test]
async fn failed_reinitialization_escalates_to_unhealthy() {
    let calls = Arc::new(AtomicUsize::new(0));
    let factory_calls = Arc::clone(&calls);
    let supervisor = Arc::new(
        EngineSupervisor::with_factory(move || {
            if factory_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ScriptedBinding::new())
            } else {
                Err(EngineError::Unavailable("engine library unavailable".to_owned()))
            }
        })
        .unwrap(),
    );
    activate(&supervisor, V1);
    supervisor
        .binding()
        .inject("boom", Phase::RequestHeaders, Fault::Fatal);
    let mut health = supervisor.subscribe_health();

    let inspector = inspector(Arc::clone(&supervisor), 2_000);
    inspector.inspect(get("boom")).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(health.has_changed().unwrap());
    assert!(health.borrow_and_update().is_unhealthy());

    let after = inspector.inspect(get("after")).await.unwrap();
    assert!(matches!(after.status, InspectionStatus::Failed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fatal_without_factory_is_unhealthy() {
    let supervisor = Arc::new(EngineSupervisor::new(ScriptedBinding::new()));
    activate(&supervisor, V1);
    supervisor
        .binding()
        .inject("boom", Phase::RequestHeaders, Fault::Fatal);

    let inspector = inspector(Arc::clone(&supervisor), 2_000);
    inspector.inspect(get("boom")).await.unwrap();
    assert!(supervisor.health().is_unhealthy());
}

#[tokio::test]
async fn context_creation_failure_fails_transaction_without_release() {
    let supervisor = Arc::new(EngineSupervisor::new(ScriptedBinding::new()));
    activate(&supervisor, V1);
    let binding = supervisor.binding();
    binding.fail_context_creation(true);

    let outcome = inspector(Arc::clone(&supervisor), 2_000)
        .inspect(get("no-ctx"))
        .await
        .unwrap();
    assert!(matches!(outcome.status, InspectionStatus::Failed { .. }));
    assert!(outcome.findings.is_empty());
    assert_eq!(binding.counters().created(), 0);
    assert_eq!(binding.counters().released(), 0);
    assert_eq!(supervisor.in_flight(), 0);
}

#[tokio::test]
async fn shutdown_drains_then_unloads() {
    let supervisor = Arc::new(EngineSupervisor::new(ScriptedBinding::new()));
    activate(&supervisor, V1);
    let binding = supervisor.binding();
    let counters = binding.counters();
    binding.inject("slow", Phase::RequestHeaders, Fault::Hang(Duration::from_millis(200)));

    let config = PipelineConfig {
        timeout_ms: 2_000,
        span_hold_ms: 2_000,
        drain_grace_secs: 5,
        ..PipelineConfig::default()
    };
    let (mut stage, rx) = InspectionStageBuilder::new()
        .config(config)
        .supervisor(Arc::clone(&supervisor))
        .build()
        .unwrap();
    let mut rx = rx.unwrap();
    stage.start().await.unwrap();
    stage.transaction_sender().send(get("slow")).await.unwrap();
    wait_for(|| counters.created() == 1).await;

    stage.stop().await.unwrap();
    assert_eq!(counters.released(), 1);
    assert_eq!(counters.unloaded(), 1);
    assert!(rx.recv().await.is_some());
    assert!(stage.health_check().await.is_unhealthy());
}
