//! 검사 파이프라인 설정
//!
//! [`PipelineConfig`]는 core의 [`OcInspectConfig`]에서 검사 스테이지, 결과 상관기,
//! 규칙 재적재기가 쓰는 값을 모아 `Duration` 등 사용하기 쉬운 형태로 제공합니다.
//!
//! # 사용 예시
//! ```ignore
//! use ocinspect_core::config::OcInspectConfig;
//! use ocinspect_pipeline::config::PipelineConfig;
//!
//! let core_config = OcInspectConfig::default();
//! let config = PipelineConfig::from_core(&core_config);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use ocinspect_core::config::{
    InspectionConfig, MAX_BODY_BYTES_LIMIT, MAX_CONCURRENCY_LIMIT, OcInspectConfig, RulesConfig,
};

use crate::error::InspectionPipelineError;

/// 최대 트랜잭션 시간 예산 (1분)
const MAX_TIMEOUT_MS: u64 = 60_000;

/// 검사 파이프라인 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// 트랜잭션당 평가 시간 예산 (ms)
    pub timeout_ms: u64,
    /// 본문 검사 크기 상한 (바이트)
    pub max_body_bytes: usize,
    /// 동시 검사 작업자 수
    pub max_concurrency: usize,
    /// 입력 큐 용량
    pub queue_capacity: usize,
    /// 매칭 메시지에서 민감 값 가리기
    pub redact_sensitive: bool,
    /// 종료 시 진행 중 컨텍스트 대기 시간 (초)
    pub drain_grace_secs: u64,
    /// 파라미터 이상 검사 사용 여부
    pub param_inspection: bool,
    /// 스팬 보류 시간 (ms)
    pub span_hold_ms: u64,
    /// 연결 완료 ID 보존 시간 (초)
    pub attached_retention_secs: u64,
    /// 상관기 출력 채널 용량
    pub output_capacity: usize,
    /// 규칙 번들 위치
    pub rules: RulesConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_core(&OcInspectConfig::default())
    }
}

impl PipelineConfig {
    /// core 설정에서 파이프라인 설정을 생성합니다.
    pub fn from_core(core: &OcInspectConfig) -> Self {
        let InspectionConfig {
            timeout_ms,
            max_body_bytes,
            max_concurrency,
            queue_capacity,
            redact_sensitive,
            drain_grace_secs,
            param_inspection,
        } = core.inspection.clone();

        Self {
            timeout_ms,
            max_body_bytes,
            max_concurrency,
            queue_capacity,
            redact_sensitive,
            drain_grace_secs,
            param_inspection,
            span_hold_ms: core.correlator.span_hold_ms,
            attached_retention_secs: core.correlator.attached_retention_secs,
            output_capacity: core.correlator.output_capacity,
            rules: core.rules.clone(),
        }
    }

    /// 트랜잭션 시간 예산
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// 종료 대기 시간
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    /// 스팬 보류 시간
    pub fn span_hold(&self) -> Duration {
        Duration::from_millis(self.span_hold_ms)
    }

    /// 연결 완료 ID 보존 시간
    pub fn attached_retention(&self) -> Duration {
        Duration::from_secs(self.attached_retention_secs)
    }

    /// 규칙 재적재 주기. 0이면 재적재하지 않습니다.
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.rules.reload_interval_secs > 0)
            .then(|| Duration::from_secs(self.rules.reload_interval_secs))
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), InspectionPipelineError> {
        if self.timeout_ms == 0 || self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(config_error("timeout_ms", format!("must be 1-{MAX_TIMEOUT_MS}")));
        }

        if self.max_body_bytes == 0 || self.max_body_bytes > MAX_BODY_BYTES_LIMIT {
            return Err(config_error(
                "max_body_bytes",
                format!("must be 1-{MAX_BODY_BYTES_LIMIT}"),
            ));
        }

        if self.max_concurrency == 0 || self.max_concurrency > MAX_CONCURRENCY_LIMIT {
            return Err(config_error(
                "max_concurrency",
                format!("must be 1-{MAX_CONCURRENCY_LIMIT}"),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(config_error("queue_capacity", "must be greater than 0".to_owned()));
        }

        if self.drain_grace_secs.saturating_mul(1_000) < self.timeout_ms {
            return Err(config_error(
                "drain_grace_secs",
                format!("must cover timeout_ms ({} ms)", self.timeout_ms),
            ));
        }

        if self.span_hold_ms == 0 {
            return Err(config_error("span_hold_ms", "must be greater than 0".to_owned()));
        }

        // 보류 중인 스팬이 결과보다 먼저 만료되면 항상 독립 레코드가 됨
        if self.span_hold_ms < self.timeout_ms {
            return Err(config_error(
                "span_hold_ms",
                format!("must be at least timeout_ms ({})", self.timeout_ms),
            ));
        }

        if self.output_capacity == 0 {
            return Err(config_error("output_capacity", "must be greater than 0".to_owned()));
        }

        Ok(())
    }
}

fn config_error(field: &str, reason: String) -> InspectionPipelineError {
    InspectionPipelineError::Config {
        field: field.to_owned(),
        reason,
    }
}
