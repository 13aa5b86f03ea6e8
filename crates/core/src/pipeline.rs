//! 파이프라인 trait -- 구성 요소 생명주기와 건강 상태
//!
//! 검사 스테이지, 결과 상관기, 규칙 재적재기는 모두 [`Pipeline`]을 구현하여
//! 데몬에서 동일한 생명주기(start/stop/health_check)로 관리됩니다.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::InspectError;

/// 구성 요소 건강 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// 정상
    Healthy,
    /// 동작하지만 성능/기능이 저하됨
    Degraded(String),
    /// 동작 불가
    Unhealthy(String),
}

impl HealthStatus {
    /// 정상 여부
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// 동작 불가 여부
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// 생명주기를 가진 구성 요소
///
/// ```text
/// Initialized → start() → Running → stop() → Stopped
/// ```
pub trait Pipeline: Send + Sync {
    /// 구성 요소를 시작합니다. 이미 실행 중이면 에러입니다.
    fn start(&mut self) -> impl Future<Output = Result<(), InspectError>> + Send;

    /// 구성 요소를 정지합니다. 실행 중이 아니면 에러입니다.
    fn stop(&mut self) -> impl Future<Output = Result<(), InspectError>> + Send;

    /// 건강 상태를 확인합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}
