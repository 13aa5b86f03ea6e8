//! 내장 SecLang 규칙 엔진
//!
//! ModSecurity 규칙 언어(SecLang)의 부분 집합을 파싱하고 평가합니다.
//! 지원 범위는 각 하위 모듈 문서를 참고하세요.

pub mod actions;
pub mod detect;
pub mod engine;
pub mod lexer;
pub mod macros;
pub mod operators;
pub mod parser;
pub mod transformations;
pub mod variables;

pub use engine::{CompiledRules, SecLangContext, SecLangEngine};
pub use parser::EngineMode;
