#![doc = include_str!("../README.md")]
//!
//! # 모듈 구성
//! - [`binding`]: 규칙 엔진 바인딩 trait과 버전 확인
//! - [`bundle`]: 디스크/인라인 규칙 번들 읽기
//! - [`loader`]: 기본 + 오버라이드 번들 병합과 검증
//! - [`rule_set`]: 컴파일된 불변 규칙 집합
//! - [`seclang`]: 내장 SecLang 엔진

pub mod binding;
pub mod bundle;
pub mod loader;
pub mod rule_set;
pub mod seclang;

pub use binding::{BindingFactory, BindingInfo, EngineBinding, RuleMatch, check_version};
pub use bundle::RuleBundle;
pub use loader::{MergedItem, MergedRules, RuleSetLoader};
pub use rule_set::RuleSet;
pub use seclang::SecLangEngine;
