//! 에러 타입 -- 도메인별 에러 정의
//!
//! 트랜잭션 범위 에러(`NormalizationError`, 복구 가능한 `EngineError`,
//! `TimeoutError`)는 검사 스테이지 밖으로 전파되지 않고 결과 상태로 변환됩니다.
//! 핸들 범위 에러(`EngineError::Fatal`)는 엔진 수명 관리자(supervisor)가 처리합니다.

use std::fmt;

use crate::types::Phase;

/// ocinspect 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    /// 설정 관련 에러 (규칙 번들 포함)
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 트랜잭션 정규화 에러
    #[error("normalization error: {0}")]
    Normalization(#[from] NormalizationError),

    /// 규칙 엔진 에러
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// 트랜잭션 평가 시간 초과
    #[error("timeout: {0}")]
    Timeout(#[from] TimeoutError),

    /// 결과 상관 관계 에러
    #[error("correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    /// 파이프라인 처리 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// 규칙 번들 검증 실패. 발견된 모든 위반 사항을 포함합니다.
    #[error("rule bundle rejected with {} violation(s): {}", violations.len(), join_violations(violations))]
    RuleBundle { violations: Vec<RuleViolation> },
}

impl ConfigError {
    /// 규칙 번들 위반 목록. 다른 변형이면 빈 슬라이스.
    pub fn violations(&self) -> &[RuleViolation] {
        match self {
            Self::RuleBundle { violations } => violations,
            _ => &[],
        }
    }
}

fn join_violations(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// 규칙 번들 위반 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// 알 수 없는 지시어
    UnknownDirective,
    /// 지시어 문법 오류 (변수, 연산자, 액션)
    Syntax,
    /// 병합된 규칙 집합 내 중복 규칙 ID
    DuplicateRuleId,
    /// 존재하지 않는 규칙을 참조하는 오버라이드
    UnresolvedReference,
    /// 크기/개수 제한 초과
    Limit,
    /// 번들 파일 읽기 실패
    Io,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnknownDirective => "unknown directive",
            Self::Syntax => "syntax error",
            Self::DuplicateRuleId => "duplicate rule id",
            Self::UnresolvedReference => "unresolved rule reference",
            Self::Limit => "limit exceeded",
            Self::Io => "io error",
        };
        f.write_str(s)
    }
}

/// 규칙 번들의 개별 위반 사항
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolation {
    /// 위반이 발견된 소스 (파일 경로 또는 `<inline>`)
    pub source: String,
    /// 1부터 시작하는 줄 번호 (알 수 없으면 0)
    pub line: usize,
    /// 위반 종류
    pub kind: ViolationKind,
    /// 상세 설명
    pub detail: String,
}

impl RuleViolation {
    /// 새 위반 사항을 생성합니다.
    pub fn new(
        source: impl Into<String>,
        line: usize,
        kind: ViolationKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            line,
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {}: {}",
            self.source, self.line, self.kind, self.detail
        )
    }
}

/// 트랜잭션 정규화 에러
///
/// 구조적으로 불가능한 입력에서만 발생합니다.
/// 잘못되었지만 크기가 제한된 입력은 최선의 노력으로 정규화됩니다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizationError {
    /// 상관 ID 누락 (스팬에 연결할 수 없음)
    #[error("transaction has no correlation id")]
    MissingCorrelationId,

    /// 음수 본문 길이 선언
    #[error("negative {field} length: {length}")]
    NegativeBodyLength { field: String, length: i64 },
}

/// 규칙 엔진 에러
///
/// # 복구 가능 여부
/// - `ContextCreation`, `Evaluation`, `PhaseOrder`, `ResourceExhausted`:
///   해당 트랜잭션만 `Failed`로 종료됩니다.
/// - `ShuttingDown`, `Unavailable`: 새 컨텍스트를 받을 수 없는 상태입니다.
/// - `Fatal`: 엔진 핸들 전체가 오염되었다고 간주합니다. 바인딩 호출 중 발생한
///   panic이 여기에 해당하며, supervisor가 핸들을 격리하고 한 번 재초기화합니다.
///
/// 외부 네이티브 라이브러리의 abort/segfault는 프로세스 내에서 잡을 수 없으므로
/// 프로세스 치명적(process-fatal)입니다. 격리가 필요하면 엔진별로 데몬을 분리합니다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// 평가 컨텍스트 생성 실패
    #[error("failed to create evaluation context: {0}")]
    ContextCreation(String),

    /// 단계 평가 실패
    #[error("evaluation failed in phase {phase}: {reason}")]
    Evaluation { phase: Phase, reason: String },

    /// 단계 순서 위반
    #[error("phase {got} evaluated out of order (expected {})", expected.map_or("none".to_owned(), |p| p.to_string()))]
    PhaseOrder { expected: Option<Phase>, got: Phase },

    /// 엔진 자원 고갈 (컨텍스트 한도 등)
    #[error("engine resources exhausted: {0}")]
    ResourceExhausted(String),

    /// 종료 중이라 새 컨텍스트를 받지 않음
    #[error("engine is shutting down")]
    ShuttingDown,

    /// 엔진 사용 불가 (활성 규칙 집합 없음, 재초기화 실패 등)
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// 핸들 범위 치명적 에러
    #[error("fatal engine failure: {0}")]
    Fatal(String),
}

impl EngineError {
    /// 핸들 범위 치명적 에러 여부
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// 트랜잭션 평가 시간 초과
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("inspection exceeded {budget_ms}ms{}", phase.map(|p| format!(" during {p}")).unwrap_or_default())]
pub struct TimeoutError {
    /// 시간 초과 시 평가 중이던 단계
    pub phase: Option<Phase>,
    /// 트랜잭션 시간 예산 (ms)
    pub budget_ms: u64,
}

/// 결과 상관 관계 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    /// 같은 상관 ID에 대해 이미 결과가 연결됨
    #[error("findings already attached for correlation id '{correlation_id}'")]
    AlreadyAttached { correlation_id: String },

    /// 출력 채널이 닫힘
    #[error("correlator output closed")]
    OutputClosed,
}

/// 파이프라인 처리 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 채널 전송 실패
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// 파이프라인 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),

    /// 이미 실행 중
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// 실행 중이 아님
    #[error("pipeline is not running")]
    NotRunning,
}
