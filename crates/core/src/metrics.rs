//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 구성 요소는 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `ocinspect_`
//! - 구성 요소명: `engine_`, `rules_`, `inspection_`, `correlator_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 평가 단계 레이블 키 (request-headers, request-body, ...)
pub const LABEL_PHASE: &str = "phase";

/// 심각도 레이블 키 (info, low, medium, high, critical)
pub const LABEL_SEVERITY: &str = "severity";

/// 종료 상태 레이블 키 (completed, failed, timed_out)
pub const LABEL_STATUS: &str = "status";

/// 결과 레이블 키 (success, failure)
pub const LABEL_RESULT: &str = "result";

/// 레코드 종류 레이블 키 (enriched_span, span, standalone)
pub const LABEL_KIND: &str = "kind";

// ─── Rule Engine / Rule Set 메트릭 ─────────────────────────────────

/// 규칙 집합 적재 시도 수 (counter, label: result)
pub const RULES_LOAD_TOTAL: &str = "ocinspect_rules_load_total";

/// 활성 규칙 수 (gauge)
pub const RULES_ACTIVE: &str = "ocinspect_rules_active";

/// 규칙 집합 활성화 횟수 (counter)
pub const RULES_ACTIVATIONS_TOTAL: &str = "ocinspect_rules_activations_total";

/// 살아 있는 평가 컨텍스트 수 (gauge)
pub const ENGINE_CONTEXTS_ACTIVE: &str = "ocinspect_engine_contexts_active";

/// 엔진 치명적 에러 수 (counter)
pub const ENGINE_FATAL_TOTAL: &str = "ocinspect_engine_fatal_total";

/// 엔진 재초기화 시도 수 (counter, label: result)
pub const ENGINE_REINIT_TOTAL: &str = "ocinspect_engine_reinit_total";

/// 단계 평가 지연 시간 (histogram, 초, label: phase)
pub const ENGINE_PHASE_DURATION_SECONDS: &str = "ocinspect_engine_phase_duration_seconds";

// ─── Inspection Stage 메트릭 ───────────────────────────────────────

/// 검사한 트랜잭션 수 (counter, label: status)
pub const INSPECTION_TRANSACTIONS_TOTAL: &str = "ocinspect_inspection_transactions_total";

/// 정규화 실패 수 (counter)
pub const INSPECTION_NORMALIZATION_ERRORS_TOTAL: &str =
    "ocinspect_inspection_normalization_errors_total";

/// 생성된 탐지 결과 수 (counter, label: severity)
pub const INSPECTION_FINDINGS_TOTAL: &str = "ocinspect_inspection_findings_total";

/// 잘린 본문 수 (counter)
pub const INSPECTION_TRUNCATED_BODIES_TOTAL: &str = "ocinspect_inspection_truncated_bodies_total";

/// 트랜잭션 검사 지연 시간 (histogram, 초)
pub const INSPECTION_DURATION_SECONDS: &str = "ocinspect_inspection_duration_seconds";

/// 진행 중 트랜잭션 수 (gauge)
pub const INSPECTION_IN_FLIGHT: &str = "ocinspect_inspection_in_flight";

// ─── Correlator 메트릭 ─────────────────────────────────────────────

/// 내보낸 레코드 수 (counter, label: kind)
pub const CORRELATOR_RECORDS_TOTAL: &str = "ocinspect_correlator_records_total";

/// 거부된 중복 attach 수 (counter)
pub const CORRELATOR_DUPLICATE_ATTACH_TOTAL: &str = "ocinspect_correlator_duplicate_attach_total";

/// 보류 중 스팬 수 (gauge)
pub const CORRELATOR_PENDING_SPANS: &str = "ocinspect_correlator_pending_spans";

// ─── Daemon 메트릭 ─────────────────────────────────────────────────

/// 데몬 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "ocinspect_daemon_uptime_seconds";

/// 빌드 정보 (gauge, 항상 1)
pub const DAEMON_BUILD_INFO: &str = "ocinspect_daemon_build_info";

/// 처리 지연 히스토그램 버킷 (초)
pub const PROCESSING_DURATION_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// 모든 메트릭 설명을 등록합니다.
///
/// 전역 recorder 설치 후 한 번 호출합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Rule Engine / Rule Set
    describe_counter!(
        RULES_LOAD_TOTAL,
        "Rule bundle load attempts by result (success, failure)"
    );
    describe_gauge!(RULES_ACTIVE, "Number of rules in the active rule set");
    describe_counter!(
        RULES_ACTIVATIONS_TOTAL,
        "Number of rule set activations (atomic swaps)"
    );
    describe_gauge!(
        ENGINE_CONTEXTS_ACTIVE,
        "Evaluation contexts currently alive"
    );
    describe_counter!(
        ENGINE_FATAL_TOTAL,
        "Handle-scoped fatal engine failures"
    );
    describe_counter!(
        ENGINE_REINIT_TOTAL,
        "Engine re-initialization attempts by result"
    );
    describe_histogram!(
        ENGINE_PHASE_DURATION_SECONDS,
        "Per-phase rule evaluation latency in seconds"
    );

    // Inspection Stage
    describe_counter!(
        INSPECTION_TRANSACTIONS_TOTAL,
        "Inspected transactions by terminal status"
    );
    describe_counter!(
        INSPECTION_NORMALIZATION_ERRORS_TOTAL,
        "Transactions rejected by the normalizer"
    );
    describe_counter!(
        INSPECTION_FINDINGS_TOTAL,
        "Findings produced by severity"
    );
    describe_counter!(
        INSPECTION_TRUNCATED_BODIES_TOTAL,
        "Bodies truncated to the inspection size limit"
    );
    describe_histogram!(
        INSPECTION_DURATION_SECONDS,
        "End-to-end transaction inspection latency in seconds"
    );
    describe_gauge!(INSPECTION_IN_FLIGHT, "Transactions currently being inspected");

    // Correlator
    describe_counter!(
        CORRELATOR_RECORDS_TOTAL,
        "Records emitted downstream by kind"
    );
    describe_counter!(
        CORRELATOR_DUPLICATE_ATTACH_TOTAL,
        "Rejected second attach calls for the same correlation id"
    );
    describe_gauge!(
        CORRELATOR_PENDING_SPANS,
        "Spans held while waiting for findings"
    );

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Daemon uptime in seconds");
    describe_gauge!(DAEMON_BUILD_INFO, "Build information (always 1)");
}
