//! 규칙 집합 -- 컴파일된 불변 규칙과 그것을 만든 설정 버전
//!
//! [`RuleSet`]은 `Arc`로 공유됩니다. 평가 컨텍스트가 규칙 집합의 `Arc`를 붙잡고
//! 있으므로, 교체된 이전 규칙 집합은 마지막 컨텍스트가 해제될 때 `Drop`에서
//! 바인딩의 `unload_rule_set`으로 해제됩니다.

use std::fmt;
use std::sync::Arc;

use ocinspect_core::error::{ConfigError, EngineError};

use crate::binding::EngineBinding;
use crate::loader::MergedRules;

/// 컴파일된 규칙 집합
pub struct RuleSet<B: EngineBinding> {
    label: String,
    generation: u64,
    source: Arc<MergedRules>,
    compiled: Option<Arc<B::Compiled>>,
    binding: Arc<B>,
}

impl<B: EngineBinding> RuleSet<B> {
    /// 병합된 규칙을 바인딩으로 컴파일합니다.
    ///
    /// # Errors
    /// 엔진이 규칙을 받아들이지 못하면 `ConfigError`를 반환합니다.
    pub fn compile(binding: Arc<B>, source: Arc<MergedRules>) -> Result<Self, ConfigError> {
        let compiled = binding.load_rule_set(&source)?;
        Ok(Self {
            label: source.version_label(),
            generation: 0,
            source,
            compiled: Some(Arc::new(compiled)),
            binding,
        })
    }

    /// 활성화 세대를 지정합니다.
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// 같은 규칙 소스를 다른 바인딩으로 다시 컴파일합니다. (재초기화용)
    ///
    /// # Errors
    /// 새 바인딩이 규칙을 받아들이지 못하면 `ConfigError`를 반환합니다.
    pub fn recompile(&self, binding: Arc<B>) -> Result<Self, ConfigError> {
        Ok(Self::compile(binding, Arc::clone(&self.source))?.with_generation(self.generation))
    }

    /// 이 규칙 집합에 묶인 평가 컨텍스트를 생성합니다.
    ///
    /// # Errors
    /// 바인딩이 컨텍스트를 만들지 못하면 에러를 반환합니다.
    pub fn create_context(&self) -> Result<B::Context, EngineError> {
        let compiled = self
            .compiled
            .as_ref()
            .ok_or_else(|| EngineError::Unavailable("rule set already unloaded".to_owned()))?;
        self.binding.create_context(compiled)
    }

    /// 버전 레이블 (`서명@다이제스트`)
    pub fn label(&self) -> &str {
        &self.label
    }

    /// 활성화 세대
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 전체 버전 (`서명@다이제스트#세대`)
    pub fn version(&self) -> String {
        format!("{}#{}", self.label, self.generation)
    }

    /// 규칙 수
    pub fn rule_count(&self) -> usize {
        self.source.rule_count()
    }

    /// 규칙 소스 다이제스트
    pub fn digest(&self) -> &str {
        &self.source.digest
    }

    /// 병합된 규칙 소스
    pub fn source(&self) -> &Arc<MergedRules> {
        &self.source
    }

    /// 컴파일에 사용한 바인딩
    pub fn binding(&self) -> &Arc<B> {
        &self.binding
    }
}

impl<B: EngineBinding> fmt::Debug for RuleSet<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSet")
            .field("version", &self.version())
            .field("rules", &self.rule_count())
            .finish()
    }
}

impl<B: EngineBinding> Drop for RuleSet<B> {
    fn drop(&mut self) {
        let Some(compiled) = self.compiled.take() else {
            return;
        };
        match Arc::try_unwrap(compiled) {
            Ok(compiled) => {
                self.binding.unload_rule_set(compiled);
                tracing::debug!(version = %self.version(), "rule set unloaded");
            }
            Err(_) => tracing::warn!(
                version = %self.version(),
                "compiled rules still referenced by a live context; skipping unload"
            ),
        }
    }
}
