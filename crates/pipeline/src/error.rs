//! 검사 파이프라인 에러 타입
//!
//! [`InspectionPipelineError`]는 파이프라인 구성, 규칙 활성화, 채널 통신 중
//! 발생하는 에러를 표현합니다. 트랜잭션 범위 에러는 여기로 올라오지 않고
//! 검사 결과 상태로 변환됩니다.
//! `From<InspectionPipelineError> for InspectError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 전파할 수 있습니다.

use ocinspect_core::error::{ConfigError, CorrelationError, EngineError, InspectError, PipelineError};

/// 검사 파이프라인 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum InspectionPipelineError {
    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 규칙 번들 거부 (이전 규칙 집합은 계속 사용됨)
    #[error("rule set rejected: {0}")]
    RuleSet(#[from] ConfigError),

    /// 엔진 에러 (활성화, 종료 중 등)
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// 결과 상관 에러
    #[error("correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),
}

impl From<InspectionPipelineError> for InspectError {
    fn from(err: InspectionPipelineError) -> Self {
        match err {
            InspectionPipelineError::Config { field, reason } => {
                InspectError::Config(ConfigError::InvalidValue { field, reason })
            }
            InspectionPipelineError::RuleSet(e) => InspectError::Config(e),
            InspectionPipelineError::Engine(e) => InspectError::Engine(e),
            InspectionPipelineError::Correlation(e) => InspectError::Correlation(e),
            InspectionPipelineError::Channel(reason) => {
                InspectError::Pipeline(PipelineError::ChannelSend(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = InspectionPipelineError::Config {
            field: "timeout_ms".to_owned(),
            reason: "must be greater than 0".to_owned(),
        };
        assert_eq!(err.to_string(), "config error: timeout_ms: must be greater than 0");
    }

    #[test]
    fn converts_to_inspect_error_preserving_domain() {
        let err: InspectError = InspectionPipelineError::Engine(EngineError::ShuttingDown).into();
        assert!(matches!(err, InspectError::Engine(EngineError::ShuttingDown)));

        let err: InspectError = InspectionPipelineError::Config {
            field: "max_concurrency".to_owned(),
            reason: "must be 1-1024".to_owned(),
        }
        .into();
        assert!(err.to_string().contains("max_concurrency"));

        let err: InspectError = InspectionPipelineError::Channel("closed".to_owned()).into();
        assert!(matches!(err, InspectError::Pipeline(PipelineError::ChannelSend(_))));
    }
}
