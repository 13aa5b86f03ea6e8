//! 하류 레코드 -- 검사 결과가 붙은 스팬과 독립(standalone) 결과 레코드
//!
//! 결과 상관기(correlator)는 스팬이 아직 주소 지정 가능하면 결과를 스팬 속성으로
//! 붙이고, 이미 전달된 뒤라면 상관 ID를 참조하는 독립 레코드를 만듭니다.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::finding::InspectionOutcome;

// --- 모듈명 상수 ---

/// 규칙 엔진 모듈명
pub const MODULE_ENGINE: &str = "rule-engine";
/// 검사 스테이지 모듈명
pub const MODULE_INSPECTION_STAGE: &str = "inspection-stage";
/// 결과 상관기 모듈명
pub const MODULE_CORRELATOR: &str = "finding-correlator";
/// 규칙 재적재기 모듈명
pub const MODULE_RULE_RELOADER: &str = "rule-reloader";

// --- 스팬 속성 키 ---

/// 검사 상태 속성
pub const ATTR_STATUS: &str = "inspection.status";
/// 부분 결과 여부 속성
pub const ATTR_PARTIAL: &str = "inspection.partial";
/// 잘린 본문 검사 여부 속성
pub const ATTR_TRUNCATED: &str = "inspection.truncated";
/// 규칙 집합 버전 속성
pub const ATTR_RULE_SET: &str = "inspection.rule_set";
/// 이상 점수 합계 속성
pub const ATTR_ANOMALY_SCORE: &str = "inspection.anomaly_score";
/// 탐지 결과 수 속성
pub const ATTR_FINDING_COUNT: &str = "inspection.finding_count";
/// 탐지 결과 JSON 속성
pub const ATTR_FINDINGS: &str = "inspection.findings";

/// 수집기 파이프라인의 스팬
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRecord {
    /// 트레이스 ID
    #[serde(default)]
    pub trace_id: String,
    /// 스팬 ID
    #[serde(default)]
    pub span_id: String,
    /// 검사 트랜잭션과 연결되는 상관 ID
    pub correlation_id: String,
    /// 스팬 이름
    #[serde(default)]
    pub name: String,
    /// 스팬 속성
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl SpanRecord {
    /// 상관 ID만 가진 스팬을 생성합니다.
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            trace_id: String::new(),
            span_id: String::new(),
            correlation_id: correlation_id.into(),
            name: String::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// 검사 결과를 스팬 속성으로 붙입니다.
    pub fn attach_outcome(&mut self, outcome: &InspectionOutcome) {
        self.attributes
            .insert(ATTR_STATUS.to_owned(), outcome.status.as_str().to_owned());
        self.attributes
            .insert(ATTR_PARTIAL.to_owned(), outcome.partial.to_string());
        self.attributes
            .insert(ATTR_TRUNCATED.to_owned(), outcome.truncated.to_string());
        if let Some(version) = &outcome.rule_set_version {
            self.attributes
                .insert(ATTR_RULE_SET.to_owned(), version.clone());
        }
        self.attributes.insert(
            ATTR_ANOMALY_SCORE.to_owned(),
            outcome.total_anomaly_score().to_string(),
        );
        self.attributes.insert(
            ATTR_FINDING_COUNT.to_owned(),
            outcome.findings.len().to_string(),
        );
        match serde_json::to_string(&outcome.findings) {
            Ok(json) => {
                self.attributes.insert(ATTR_FINDINGS.to_owned(), json);
            }
            Err(e) => warn!(
                correlation_id = %outcome.correlation_id,
                error = %e,
                "failed to serialize findings for span attribute"
            ),
        }
    }
}

/// 스팬에 붙이지 못한 검사 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandaloneFindings {
    /// 레코드 고유 ID (UUID v4)
    pub record_id: String,
    /// 참조하는 상관 ID
    pub correlation_id: String,
    /// 검사 결과
    pub outcome: InspectionOutcome,
}

impl StandaloneFindings {
    /// 새 UUID로 독립 레코드를 생성합니다.
    pub fn new(outcome: InspectionOutcome) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: outcome.correlation_id.clone(),
            outcome,
        }
    }
}

/// 상관기가 하류로 내보내는 레코드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrelatedRecord {
    /// 검사 결과가 붙은 스팬
    EnrichedSpan(SpanRecord),
    /// 보류 시간 안에 결과가 오지 않아 그대로 전달된 스팬
    Span(SpanRecord),
    /// 스팬에 붙이지 못한 독립 결과
    Standalone(StandaloneFindings),
}

impl CorrelatedRecord {
    /// 레코드가 참조하는 상관 ID
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::EnrichedSpan(span) | Self::Span(span) => &span.correlation_id,
            Self::Standalone(s) => &s.correlation_id,
        }
    }
}

impl fmt::Display for CorrelatedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnrichedSpan(span) => write!(f, "enriched span {}", span.correlation_id),
            Self::Span(span) => write!(f, "span {}", span.correlation_id),
            Self::Standalone(s) => write!(
                f,
                "standalone findings {} ({})",
                s.correlation_id, s.outcome.status
            ),
        }
    }
}
