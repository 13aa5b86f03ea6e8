//! 규칙 집합 로더 -- 기본 번들과 오버라이드 번들을 병합하고 검증합니다.
//!
//! # 병합 규칙
//! - 기본 번들의 지시어가 먼저, 오버라이드 번들의 지시어가 나중에 순서대로 적용됩니다.
//! - 오버라이드는 규칙을 비활성화(`SecRuleRemoveBy*`), 재설정
//!   (`SecRuleUpdateActionById`, `SecRuleUpdateTargetById`), 추가(`SecRule`,
//!   `SecAction`)할 수 있습니다.
//! - 기본 규칙의 순서는 `SecRuleMoveById`로만 바뀝니다.
//!
//! # 검증
//! 알 수 없는 지시어, 문법 오류, 존재하지 않는 규칙 참조, 중복 규칙 ID를
//! 모두 모아 하나의 `ConfigError::RuleBundle`로 반환합니다.
//! 로딩은 활성 규칙 집합에 어떤 영향도 주지 않습니다.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use sha2::{Digest, Sha256};

use ocinspect_core::error::{ConfigError, RuleViolation, ViolationKind};

use crate::binding::EngineBinding;
use crate::bundle::RuleBundle;
use crate::rule_set::RuleSet;
use crate::seclang::actions::Action;
use crate::seclang::parser::{self, Directive, EngineMode, IdRange, Located, MovePosition, RuleDef};
use crate::seclang::transformations::Transformation;

/// 병합된 규칙 집합의 최대 규칙 수
pub const MAX_RULES_COUNT: usize = 20_000;

/// 서명 지시어가 없을 때의 컴포넌트 서명
pub const DEFAULT_SIGNATURE: &str = "custom";

/// 병합 결과의 한 항목
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergedItem {
    Rule(RuleDef),
    /// `SecMarker` (skipAfter 대상)
    Marker(String),
}

/// 병합되고 검증된 규칙
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRules {
    /// 평가 순서대로 나열한 규칙과 마커
    pub items: Vec<MergedItem>,
    pub engine_mode: EngineMode,
    /// `SecComponentSignature` (없으면 `custom`)
    pub component_signature: String,
    /// 기본/오버라이드 번들의 SHA-256 다이제스트 (hex)
    pub digest: String,
    /// `@pmFromFile` 데이터 파일
    pub data_files: BTreeMap<String, String>,
}

impl MergedRules {
    /// 규칙 수 (체인은 하나로 셈)
    pub fn rule_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i, MergedItem::Rule(_)))
            .count()
    }

    /// 규칙 정의 목록
    pub fn rules(&self) -> impl Iterator<Item = &RuleDef> {
        self.items.iter().filter_map(|i| match i {
            MergedItem::Rule(r) => Some(r),
            MergedItem::Marker(_) => None,
        })
    }

    /// 규칙 ID 목록 (평가 순서)
    pub fn rule_ids(&self) -> Vec<u64> {
        self.rules().filter_map(|r| r.id).collect()
    }

    /// 버전 레이블 `서명@다이제스트앞12자리`
    pub fn version_label(&self) -> String {
        let short = self.digest.get(..12).unwrap_or(&self.digest);
        format!("{}@{short}", self.component_signature)
    }
}

/// 규칙 집합 로더
pub struct RuleSetLoader;

impl RuleSetLoader {
    /// 두 번들의 결합 다이제스트
    pub fn digest(base: &RuleBundle, overrides: &RuleBundle) -> String {
        let mut hasher = Sha256::new();
        hasher.update(base.digest().as_bytes());
        hasher.update(b":");
        hasher.update(overrides.digest().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// 번들을 병합하고 검증합니다.
    ///
    /// # Errors
    /// 위반 사항이 하나라도 있으면 모든 위반을 담은 `ConfigError::RuleBundle`을 반환합니다.
    pub fn merge(base: &RuleBundle, overrides: &RuleBundle) -> Result<MergedRules, ConfigError> {
        let mut merger = Merger::default();

        for bundle in [base, overrides] {
            for source in bundle.sources() {
                let parsed = parser::parse(&source.text, &source.name);
                merger.violations.extend(parsed.violations);
                for directive in parsed.directives {
                    merger.apply(directive);
                }
            }
        }

        let rule_count = merger
            .items
            .iter()
            .filter(|i| matches!(i, MergedItem::Rule(_)))
            .count();
        if rule_count > MAX_RULES_COUNT {
            merger.violations.push(RuleViolation::new(
                "<merged>",
                0,
                ViolationKind::Limit,
                format!("too many rules: {rule_count} (max: {MAX_RULES_COUNT})"),
            ));
        }

        if !merger.violations.is_empty() {
            return Err(ConfigError::RuleBundle {
                violations: merger.violations,
            });
        }

        let mut data_files = base.data_files().clone();
        data_files.extend(
            overrides
                .data_files()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        Ok(MergedRules {
            items: merger.items,
            engine_mode: merger.engine_mode,
            component_signature: merger
                .signature
                .unwrap_or_else(|| DEFAULT_SIGNATURE.to_owned()),
            digest: Self::digest(base, overrides),
            data_files,
        })
    }

    /// 번들을 병합하고 바인딩으로 컴파일하여 규칙 집합을 만듭니다.
    ///
    /// 반환된 규칙 집합의 세대(generation)는 0이며, supervisor가 활성화할 때 부여합니다.
    ///
    /// # Errors
    /// 병합 검증 또는 엔진 컴파일에 실패하면 `ConfigError`를 반환합니다.
    pub fn load<B: EngineBinding>(
        binding: &Arc<B>,
        base: &RuleBundle,
        overrides: &RuleBundle,
    ) -> Result<RuleSet<B>, ConfigError> {
        let merged = match Self::merge(base, overrides) {
            Ok(merged) => merged,
            Err(e) => {
                metrics::counter!(
                    ocinspect_core::metrics::RULES_LOAD_TOTAL,
                    ocinspect_core::metrics::LABEL_RESULT => "failure"
                )
                .increment(1);
                return Err(e);
            }
        };

        let result = RuleSet::compile(Arc::clone(binding), Arc::new(merged));
        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!(
            ocinspect_core::metrics::RULES_LOAD_TOTAL,
            ocinspect_core::metrics::LABEL_RESULT => outcome
        )
        .increment(1);

        if let Ok(rule_set) = &result {
            tracing::info!(
                version = %rule_set.label(),
                rules = rule_set.rule_count(),
                "rule set loaded"
            );
        }
        result
    }
}

#[derive(Default)]
struct Merger {
    items: Vec<MergedItem>,
    violations: Vec<RuleViolation>,
    engine_mode: EngineMode,
    signature: Option<String>,
}

impl Merger {
    fn violation(&mut self, at: &Located<Directive>, kind: ViolationKind, detail: String) {
        self.violations
            .push(RuleViolation::new(&at.source, at.line, kind, detail));
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.items
            .iter()
            .position(|i| matches!(i, MergedItem::Rule(r) if r.id == Some(id)))
    }

    fn rule_mut(&mut self, id: u64) -> Option<&mut RuleDef> {
        self.items.iter_mut().find_map(|i| match i {
            MergedItem::Rule(r) if r.id == Some(id) => Some(r),
            _ => None,
        })
    }

    /// 조건에 맞는 규칙을 제거하고 제거한 수를 반환합니다.
    fn remove_where(&mut self, predicate: impl Fn(&RuleDef) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|i| match i {
            MergedItem::Rule(r) => !predicate(r),
            MergedItem::Marker(_) => true,
        });
        before - self.items.len()
    }

    fn apply(&mut self, located: Located<Directive>) {
        match &located.value {
            Directive::Rule(rule) => {
                // id 없는 규칙은 파서가 이미 위반으로 기록함
                let Some(id) = rule.id else {
                    return;
                };
                let duplicate = self.items.iter().find_map(|i| match i {
                    MergedItem::Rule(r) if r.id == Some(id) => Some(format!(
                        "rule id {id} already defined at {}:{}",
                        r.source, r.line
                    )),
                    _ => None,
                });
                if let Some(detail) = duplicate {
                    self.violation(&located, ViolationKind::DuplicateRuleId, detail);
                    return;
                }
                let rule = rule.clone();
                self.items.push(MergedItem::Rule(rule));
            }
            Directive::Marker(name) => {
                let name = name.clone();
                self.items.push(MergedItem::Marker(name));
            }
            Directive::EngineMode(mode) => self.engine_mode = *mode,
            Directive::ComponentSignature(sig) => self.signature = Some(sig.clone()),
            Directive::Config(_) => {}
            Directive::RemoveById(ranges) => {
                for &range in ranges {
                    let removed = self.remove_where(|r| r.id.is_some_and(|id| range.contains(id)));
                    if removed == 0 {
                        self.unresolved_range(&located, range);
                    }
                }
            }
            Directive::RemoveByTag(pattern) => {
                let pattern = pattern.clone();
                match Regex::new(&pattern) {
                    Ok(re) => {
                        let removed = self.remove_where(|r| r.tags().any(|t| re.is_match(t)));
                        if removed == 0 {
                            tracing::warn!(
                                source = %located.source,
                                line = located.line,
                                tag = %pattern,
                                "SecRuleRemoveByTag matched no rules"
                            );
                        }
                    }
                    Err(e) => self.violation(
                        &located,
                        ViolationKind::Syntax,
                        format!("invalid tag pattern '{pattern}': {e}"),
                    ),
                }
            }
            Directive::RemoveByMsg(pattern) => {
                let pattern = pattern.clone();
                match Regex::new(&pattern) {
                    Ok(re) => {
                        let removed = self.remove_where(|r| r.msg().is_some_and(|m| re.is_match(m)));
                        if removed == 0 {
                            tracing::warn!(
                                source = %located.source,
                                line = located.line,
                                msg = %pattern,
                                "SecRuleRemoveByMsg matched no rules"
                            );
                        }
                    }
                    Err(e) => self.violation(
                        &located,
                        ViolationKind::Syntax,
                        format!("invalid msg pattern '{pattern}': {e}"),
                    ),
                }
            }
            Directive::UpdateActionById { id, actions } => {
                let (id, actions) = (*id, actions.clone());
                self.update_actions(&located, id, actions);
            }
            Directive::UpdateTargetById { id, targets } => {
                let id = *id;
                match self.rule_mut(id) {
                    Some(rule) => rule.targets.extend(targets.iter().cloned()),
                    None => self.violation(
                        &located,
                        ViolationKind::UnresolvedReference,
                        format!("SecRuleUpdateTargetById references unknown rule {id}"),
                    ),
                }
            }
            Directive::MoveById {
                id,
                position,
                anchor,
            } => {
                let (id, position, anchor) = (*id, *position, *anchor);
                self.move_rule(&located, id, position, anchor);
            }
        }
    }

    fn unresolved_range(&mut self, at: &Located<Directive>, range: IdRange) {
        if range.start == range.end {
            self.violation(
                at,
                ViolationKind::UnresolvedReference,
                format!("SecRuleRemoveById references unknown rule {}", range.start),
            );
        } else {
            tracing::warn!(
                source = %at.source,
                line = at.line,
                start = range.start,
                end = range.end,
                "SecRuleRemoveById range matched no rules"
            );
        }
    }

    fn update_actions(&mut self, at: &Located<Directive>, id: u64, updates: Vec<Action>) {
        let Some(rule) = self.rule_mut(id) else {
            self.violation(
                at,
                ViolationKind::UnresolvedReference,
                format!("SecRuleUpdateActionById references unknown rule {id}"),
            );
            return;
        };
        let phase = rule.phase;

        let mut problems = Vec::new();
        for action in &updates {
            match action {
                Action::Id(new_id) if *new_id != id => {
                    problems.push(format!("cannot change id of rule {id} to {new_id}"));
                }
                Action::Phase(new_phase) if *new_phase != phase => {
                    problems.push(format!("cannot change phase of rule {id} to {new_phase}"));
                }
                Action::Chain => problems.push(format!("cannot add chain to rule {id}")),
                _ => {}
            }
        }

        if problems.is_empty() {
            let mut actions = rule.actions.clone();
            for action in updates {
                match action {
                    Action::Id(_) | Action::Phase(_) => {}
                    Action::Transform(Transformation::None) => {
                        actions.retain(|a| !matches!(a, Action::Transform(_)));
                        actions.push(action);
                    }
                    a if a.is_cumulative() => actions.push(a),
                    a => {
                        actions.retain(|existing| !existing.same_kind(&a));
                        actions.push(a);
                    }
                }
            }
            rule.set_actions(actions);
        } else {
            for detail in problems {
                self.violation(at, ViolationKind::Syntax, detail);
            }
        }
    }

    fn move_rule(&mut self, at: &Located<Directive>, id: u64, position: MovePosition, anchor: u64) {
        let (Some(from), Some(_)) = (self.position(id), self.position(anchor)) else {
            for missing in [id, anchor] {
                if self.position(missing).is_none() {
                    self.violation(
                        at,
                        ViolationKind::UnresolvedReference,
                        format!("SecRuleMoveById references unknown rule {missing}"),
                    );
                }
            }
            return;
        };

        let item = self.items.remove(from);
        // 제거 후 위치가 바뀌므로 다시 찾음
        let Some(anchor_at) = self.position(anchor) else {
            self.items.insert(from, item);
            return;
        };
        let insert_at = match position {
            MovePosition::Before => anchor_at,
            MovePosition::After => anchor_at + 1,
        };
        self.items.insert(insert_at, item);
    }
}
