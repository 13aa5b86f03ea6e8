//! 탐지 결과 -- 규칙 매칭(Finding)과 트랜잭션 검사 결과(InspectionOutcome)

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Phase, Severity};

/// 규칙 하나의 매칭 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// 규칙 ID
    pub rule_id: u64,
    /// 규칙 메시지 (`msg`)
    pub message: String,
    /// 매칭 메시지 (`logdata`), 설정에 따라 민감 값이 가려짐
    #[serde(default)]
    pub match_message: String,
    /// 심각도
    pub severity: Severity,
    /// 이상 점수
    pub anomaly_score: u32,
    /// 편집증 수준 (`paranoia-level/N` 태그, 기본 1)
    pub paranoia_level: u8,
    /// 매칭된 단계
    pub phase: Phase,
    /// 매칭된 필드 (`ARGS:id` 등)
    #[serde(default)]
    pub matched_field: Option<String>,
    /// 트랜잭션 상관 ID
    pub correlation_id: String,
    /// 규칙 태그
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// 잘린 본문 앞부분에서 매칭되었는지 여부
    #[serde(default)]
    pub truncated: bool,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] rule {} ({}) score={} field={}: {}",
            self.severity,
            self.rule_id,
            self.phase,
            self.anomaly_score,
            self.matched_field.as_deref().unwrap_or("-"),
            self.message,
        )
    }
}

/// 트랜잭션 검사 종료 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InspectionStatus {
    /// 모든 단계 평가 완료
    Completed,
    /// 평가 실패 (정규화, 엔진 에러)
    Failed { reason: String },
    /// 트랜잭션 시간 예산 초과
    TimedOut,
}

impl InspectionStatus {
    /// 상태 이름
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for InspectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// 한 트랜잭션의 최종 검사 결과
///
/// 하류는 항상 완전한 결과, 상태가 붙은 부분 결과,
/// 또는 상태가 붙은 빈 결과 중 하나를 받습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionOutcome {
    /// 트랜잭션 상관 ID
    pub correlation_id: String,
    /// 종료 상태
    pub status: InspectionStatus,
    /// 수집된 탐지 결과
    pub findings: Vec<Finding>,
    /// 일부 단계만 평가된 결과인지 여부
    pub partial: bool,
    /// 잘린 본문을 검사했는지 여부
    pub truncated: bool,
    /// 평가에 사용된 규칙 집합 버전
    #[serde(default)]
    pub rule_set_version: Option<String>,
    /// 평가를 마친 단계
    #[serde(default)]
    pub phases_completed: Vec<Phase>,
}

impl InspectionOutcome {
    /// 빈 결과를 생성합니다.
    pub fn new(correlation_id: impl Into<String>, status: InspectionStatus) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status,
            findings: Vec::new(),
            partial: false,
            truncated: false,
            rule_set_version: None,
            phases_completed: Vec::new(),
        }
    }

    /// 이상 점수 합계
    pub fn total_anomaly_score(&self) -> u32 {
        self.findings.iter().map(|f| f.anomaly_score).sum()
    }

    /// 가장 높은 심각도. 결과가 없으면 `None`.
    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}
