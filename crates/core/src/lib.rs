#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod finding;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod transaction;
pub mod types;

// --- 주요 타입 re-export ---
// 각 모듈의 핵심 타입을 크레이트 루트에서 바로 사용할 수 있도록 합니다.

// 에러
pub use error::{
    ConfigError, CorrelationError, EngineError, InspectError, NormalizationError, PipelineError,
    RuleViolation, TimeoutError, ViolationKind,
};

// 설정
pub use config::OcInspectConfig;

// 탐지 결과
pub use finding::{Finding, InspectionOutcome, InspectionStatus};

// 파이프라인 trait
pub use pipeline::{HealthStatus, Pipeline};

// 하류 레코드
pub use record::{CorrelatedRecord, SpanRecord, StandaloneFindings};

// 트랜잭션
pub use transaction::{
    BodyChunk, BodyEncoding, Endpoint, Header, InspectedBody, NormalizedTransaction,
    RawTransaction,
};

// 도메인 타입
pub use types::{HeaderCase, Phase, Severity};
