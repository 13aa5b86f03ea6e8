#![doc = include_str!("../README.md")]
//!
//! # 모듈 구성
//!
//! - [`normalizer`]: 수집기 트랜잭션을 엔진 입력 형식으로 정규화
//! - [`param_inspector`]: 규칙 엔진과 별개의 인자 값 이상 검사 (XXE, NoSQL 연산자)
//! - [`supervisor`]: 엔진 핸들과 활성 규칙 집합 관리, 컨텍스트 가드, 장애 격리
//! - [`stage`]: 트랜잭션 상태 기계와 작업자 풀 (Pipeline trait 구현)
//! - [`correlator`]: 검사 결과를 스팬에 붙이거나 독립 레코드로 전달
//! - [`reloader`]: 규칙 번들 주기 재적재
//! - [`config`]: 파이프라인 설정 (core 설정 확장)
//! - [`error`]: 도메인 에러 타입
//!
//! # 아키텍처
//!
//! ```text
//! RawTransaction -> Normalizer -> ContextGuard(phase 1..4) -> FindingCorrelator -> downstream
//!                                      |                           |
//!                               EngineSupervisor             SpanRecord 보류
//!                                      |
//!                                 RuleReloader
//! ```

pub mod config;
pub mod correlator;
pub mod error;
pub mod normalizer;
pub mod param_inspector;
pub mod reloader;
pub mod stage;
pub mod supervisor;

// --- 주요 타입 re-export ---

// 스테이지
pub use stage::{InspectionStage, InspectionStageBuilder, Inspector, TxState};

// 엔진 관리
pub use supervisor::{ActivationError, ContextGuard, EngineSupervisor, ShutdownReport};

// 상관기
pub use correlator::FindingCorrelator;

// 재적재
pub use reloader::{ReloadOutcome, RuleReloader};

// 정규화
pub use normalizer::Normalizer;

// 파라미터 검사
pub use param_inspector::{ParamInspection, ParamInspector};

// 설정
pub use config::PipelineConfig;

// 에러
pub use error::InspectionPipelineError;
