//! 규칙 엔진 바인딩 trait
//!
//! [`EngineBinding`]은 규칙 엔진과의 경계입니다. 엔진 계층은 신뢰하지 않는
//! 코드로 취급합니다. 호출은 실패하거나, 멈추거나, panic할 수 있습니다.
//!
//! # 실패 분류
//! - 복구 가능: `EngineError::ContextCreation`, `Evaluation`, `PhaseOrder`,
//!   `ResourceExhausted` -- 해당 트랜잭션만 실패합니다.
//! - 핸들 범위 치명적: `EngineError::Fatal` -- 바인딩 호출 중 panic 포함.
//!   supervisor가 핸들을 격리하고 [`BindingFactory`]로 한 번 재초기화합니다.
//! - 프로세스 치명적: 외부 네이티브 라이브러리의 abort/segfault.
//!   프로세스 안에서 잡을 수 없으므로 엔진별 데몬 분리로 격리합니다.
//!
//! # 컨텍스트 규칙
//! - `create_context` 한 번에 `release_context`가 정확히 한 번 대응합니다.
//! - 한 컨텍스트의 단계는 `RequestHeaders → RequestBody → ResponseHeaders →
//!   ResponseBody` 순서로만 평가됩니다.

use std::sync::Arc;

use semver::{Version, VersionReq};

use ocinspect_core::error::{ConfigError, EngineError};
use ocinspect_core::transaction::NormalizedTransaction;
use ocinspect_core::types::{HeaderCase, Phase, Severity};

use crate::loader::MergedRules;

/// 바인딩 식별 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    /// 바인딩 이름 (`seclang` 등)
    pub name: String,
    /// 바인딩 버전
    pub version: Version,
    /// 엔진이 기대하는 헤더 이름 규칙
    pub header_case: HeaderCase,
}

/// 엔진이 보고한 규칙 일치
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule_id: u64,
    /// 규칙 메시지 (`msg`)
    pub message: String,
    /// 일치 메시지 (`logdata` 확장 결과)
    pub match_message: String,
    pub severity: Severity,
    pub anomaly_score: u32,
    pub paranoia_level: u8,
    /// 일치한 변수 이름 (`ARGS:param1`)
    pub matched_field: Option<String>,
    /// 일치한 원래 값 (민감 정보 가리기용)
    pub matched_value: Option<String>,
    pub tags: Vec<String>,
    pub phase: Phase,
}

/// 규칙 엔진 바인딩
pub trait EngineBinding: Send + Sync + 'static {
    /// 컴파일된 규칙 집합
    type Compiled: Send + Sync + 'static;
    /// 트랜잭션 하나의 평가 컨텍스트
    type Context: Send + 'static;

    /// 바인딩 정보
    fn info(&self) -> BindingInfo;

    /// 병합된 규칙을 컴파일합니다. 활성 규칙 집합에는 영향을 주지 않습니다.
    ///
    /// # Errors
    /// 엔진이 규칙을 받아들이지 못하면 위반 목록을 담은 `ConfigError`를 반환합니다.
    fn load_rule_set(&self, rules: &MergedRules) -> Result<Self::Compiled, ConfigError>;

    /// 컴파일된 규칙 집합을 해제합니다.
    fn unload_rule_set(&self, compiled: Self::Compiled);

    /// 평가 컨텍스트를 생성합니다.
    ///
    /// # Errors
    /// 자원이 부족하거나 엔진이 컨텍스트를 만들 수 없으면 에러를 반환합니다.
    fn create_context(&self, compiled: &Arc<Self::Compiled>) -> Result<Self::Context, EngineError>;

    /// 한 단계를 평가합니다.
    ///
    /// # Errors
    /// 단계 순서 위반, 평가 실패, 핸들 손상 시 에러를 반환합니다.
    fn evaluate_phase(
        &self,
        context: &mut Self::Context,
        phase: Phase,
        tx: &NormalizedTransaction,
    ) -> Result<Vec<RuleMatch>, EngineError>;

    /// 평가 컨텍스트를 해제합니다.
    fn release_context(&self, context: Self::Context);
}

/// 바인딩 생성기 (치명적 에러 후 재초기화용)
pub trait BindingFactory<B: EngineBinding>: Send + Sync + 'static {
    /// 새 바인딩 인스턴스를 생성합니다.
    ///
    /// # Errors
    /// 엔진 초기화에 실패하면 에러를 반환합니다.
    fn create(&self) -> Result<B, EngineError>;
}

impl<B, F> BindingFactory<B> for F
where
    B: EngineBinding,
    F: Fn() -> Result<B, EngineError> + Send + Sync + 'static,
{
    fn create(&self) -> Result<B, EngineError> {
        self()
    }
}

/// 바인딩 버전이 설정된 요구 사항을 만족하는지 확인합니다.
///
/// # Errors
/// 버전이 맞지 않으면 `ConfigError::InvalidValue`를 반환합니다.
pub fn check_version(info: &BindingInfo, requirement: &VersionReq) -> Result<(), ConfigError> {
    if requirement.matches(&info.version) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: "engine.version_req".to_owned(),
            reason: format!(
                "binding '{}' version {} does not satisfy '{requirement}'",
                info.name, info.version
            ),
        })
    }
}
