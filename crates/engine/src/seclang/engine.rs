//! 내장 SecLang 엔진 -- [`EngineBinding`] 구현
//!
//! 병합된 규칙을 단계별 실행 목록으로 컴파일하고, 트랜잭션 하나의 상태(TX 변수,
//! 마지막 평가 단계)를 [`SecLangContext`]에 보관합니다.
//!
//! # 평가 규칙
//! - 규칙은 병합 순서대로 평가됩니다. `SecMarker`는 모든 단계 목록에 들어가며
//!   `skipAfter`의 도착 지점이 됩니다.
//! - 체인 규칙은 모든 고리가 일치할 때만 발동합니다. `setvar`는 발동 시점에 적용됩니다.
//! - `nolog` 규칙은 발동하지만 탐지 결과를 만들지 않습니다.
//! - `SecRuleEngine Off`이면 어떤 결과도 만들지 않습니다.
//! - logging 단계(5) 규칙은 검사 대상이 아니므로 컴파일에서 제외됩니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use semver::Version;

use ocinspect_core::error::{ConfigError, EngineError, RuleViolation, ViolationKind};
use ocinspect_core::metrics as m;
use ocinspect_core::transaction::NormalizedTransaction;
use ocinspect_core::types::{HeaderCase, Phase, Severity};

use crate::binding::{BindingInfo, EngineBinding, RuleMatch};
use crate::loader::{MergedItem, MergedRules};

use super::actions::{Action, SetVar, SetVarOp};
use super::detect::Detectors;
use super::macros::{self, MacroScope};
use super::operators::CompiledOperator;
use super::parser::{EngineMode, RuleDef};
use super::transformations::{Transformation, apply_all};
use super::variables::{CompiledTargets, EvalView, VarValue};

/// 바인딩 이름
pub const BINDING_NAME: &str = "seclang";

/// 바인딩 버전
pub const BINDING_VERSION: Version = Version::new(1, 2, 0);

/// 동시에 살아 있을 수 있는 컨텍스트 기본 상한
pub const DEFAULT_MAX_CONTEXTS: usize = 4096;

/// 심각도가 없는 규칙의 기본 심각도 (SecLang WARNING)
const DEFAULT_SEVERITY: Severity = Severity::Medium;

/// 내장 SecLang 엔진
#[derive(Debug)]
pub struct SecLangEngine {
    detectors: Detectors,
    max_contexts: usize,
    live_contexts: AtomicUsize,
}

impl SecLangEngine {
    /// 엔진을 생성합니다.
    ///
    /// # Errors
    /// 내장 탐지기 패턴을 컴파일하지 못하면 `EngineError::Fatal`을 반환합니다.
    pub fn new() -> Result<Self, EngineError> {
        let detectors = Detectors::new()
            .map_err(|e| EngineError::Fatal(format!("failed to build detectors: {e}")))?;
        Ok(Self {
            detectors,
            max_contexts: DEFAULT_MAX_CONTEXTS,
            live_contexts: AtomicUsize::new(0),
        })
    }

    /// 컨텍스트 상한을 지정합니다.
    pub fn with_max_contexts(mut self, max_contexts: usize) -> Self {
        self.max_contexts = max_contexts.max(1);
        self
    }

    /// 현재 살아 있는 컨텍스트 수
    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::Acquire)
    }
}

/// 체인의 한 고리
#[derive(Debug)]
struct CompiledLink {
    targets: CompiledTargets,
    /// `SecAction`처럼 대상이 없는 고리
    unconditional: bool,
    operator: CompiledOperator,
    transforms: Vec<Transformation>,
    setvars: Vec<SetVar>,
    capture: bool,
}

/// 컴파일된 규칙 (체인 전체)
#[derive(Debug)]
struct CompiledRule {
    id: u64,
    phase: Phase,
    links: Vec<CompiledLink>,
    message: String,
    logdata: Option<String>,
    severity: Severity,
    paranoia_level: u8,
    tags: Vec<String>,
    nolog: bool,
    skip: u32,
    skip_after: Option<String>,
}

#[derive(Debug)]
enum Step {
    Rule(usize),
    Marker(String),
}

/// 컴파일된 규칙 집합
#[derive(Debug)]
pub struct CompiledRules {
    mode: EngineMode,
    rules: Vec<CompiledRule>,
    /// 단계별 실행 목록 (인덱스 = 단계 번호 - 1)
    phases: [Vec<Step>; 4],
}

impl CompiledRules {
    /// 엔진 동작 모드
    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// 평가 대상 규칙 수
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn compile(merged: &MergedRules) -> Result<Self, ConfigError> {
        let data_files: HashMap<String, String> = merged
            .data_files
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut rules = Vec::new();
        let mut phases: [Vec<Step>; 4] = Default::default();
        let mut violations = Vec::new();

        for item in &merged.items {
            match item {
                MergedItem::Marker(name) => {
                    for steps in &mut phases {
                        steps.push(Step::Marker(name.clone()));
                    }
                }
                MergedItem::Rule(def) => {
                    let Some(phase) = Phase::from_number(def.phase) else {
                        tracing::debug!(rule_id = ?def.id, phase = def.phase, "skipping logging-phase rule");
                        continue;
                    };
                    match compile_rule(def, phase, &data_files) {
                        Ok(rule) => {
                            phases[usize::from(phase.number() - 1)].push(Step::Rule(rules.len()));
                            rules.push(rule);
                        }
                        Err(v) => violations.push(v),
                    }
                }
            }
        }

        if !violations.is_empty() {
            return Err(ConfigError::RuleBundle { violations });
        }

        Ok(Self {
            mode: merged.engine_mode,
            rules,
            phases,
        })
    }
}

fn compile_rule(
    def: &RuleDef,
    phase: Phase,
    data_files: &HashMap<String, String>,
) -> Result<CompiledRule, RuleViolation> {
    let violation = |line: usize, detail: String| {
        RuleViolation::new(&def.source, line, ViolationKind::Syntax, detail)
    };

    let mut links = Vec::new();
    let mut logdata = def.logdata().map(str::to_owned);
    let mut link = Some(def);
    while let Some(current) = link {
        let targets = CompiledTargets::compile(&current.targets)
            .map_err(|e| violation(current.line, e.to_string()))?;
        let operator = CompiledOperator::compile(&current.operator, data_files)
            .map_err(|e| violation(current.line, e))?;
        let setvars = current
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::SetVar(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        if logdata.is_none() {
            logdata = current.logdata().map(str::to_owned);
        }
        links.push(CompiledLink {
            targets,
            unconditional: current.targets.is_empty(),
            operator,
            transforms: current.transforms(),
            setvars,
            capture: current.actions.contains(&Action::Capture),
        });
        link = current.chain.as_deref();
    }

    let nolog = def
        .actions
        .iter()
        .rev()
        .find_map(|a| match a {
            Action::NoLog => Some(true),
            Action::Log => Some(false),
            _ => None,
        })
        .unwrap_or(false);

    Ok(CompiledRule {
        id: def.id.unwrap_or_default(),
        phase,
        links,
        message: def.msg().unwrap_or_default().to_owned(),
        logdata,
        severity: def.severity().unwrap_or(DEFAULT_SEVERITY),
        paranoia_level: def.paranoia_level(),
        tags: def.tags().map(str::to_owned).collect(),
        nolog,
        skip: def
            .actions
            .iter()
            .find_map(|a| match a {
                Action::Skip(n) => Some(*n),
                _ => None,
            })
            .unwrap_or(0),
        skip_after: def.actions.iter().find_map(|a| match a {
            Action::SkipAfter(marker) => Some(marker.clone()),
            _ => None,
        }),
    })
}

/// 트랜잭션 하나의 평가 상태
#[derive(Debug)]
pub struct SecLangContext {
    rules: Arc<CompiledRules>,
    tx_vars: HashMap<String, String>,
    last_phase: Option<Phase>,
}

impl SecLangContext {
    /// 마지막으로 평가한 단계
    pub fn last_phase(&self) -> Option<Phase> {
        self.last_phase
    }

    /// TX 변수 값
    pub fn tx_var(&self, name: &str) -> Option<&str> {
        self.tx_vars
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

impl EngineBinding for SecLangEngine {
    type Compiled = CompiledRules;
    type Context = SecLangContext;

    fn info(&self) -> BindingInfo {
        BindingInfo {
            name: BINDING_NAME.to_owned(),
            version: BINDING_VERSION,
            header_case: HeaderCase::Lower,
        }
    }

    fn load_rule_set(&self, rules: &MergedRules) -> Result<CompiledRules, ConfigError> {
        let compiled = CompiledRules::compile(rules)?;
        tracing::debug!(
            rules = compiled.rule_count(),
            mode = ?compiled.mode(),
            "compiled seclang rule set"
        );
        Ok(compiled)
    }

    fn unload_rule_set(&self, compiled: CompiledRules) {
        drop(compiled);
    }

    fn create_context(&self, compiled: &Arc<CompiledRules>) -> Result<SecLangContext, EngineError> {
        let previous = self.live_contexts.fetch_add(1, Ordering::AcqRel);
        if previous >= self.max_contexts {
            self.live_contexts.fetch_sub(1, Ordering::AcqRel);
            return Err(EngineError::ResourceExhausted(format!(
                "context limit {} reached",
                self.max_contexts
            )));
        }
        metrics::gauge!(m::ENGINE_CONTEXTS_ACTIVE).set((previous + 1) as f64);

        Ok(SecLangContext {
            rules: Arc::clone(compiled),
            tx_vars: HashMap::new(),
            last_phase: None,
        })
    }

    fn evaluate_phase(
        &self,
        context: &mut SecLangContext,
        phase: Phase,
        tx: &NormalizedTransaction,
    ) -> Result<Vec<RuleMatch>, EngineError> {
        let expected = match context.last_phase {
            None => Some(Phase::RequestHeaders),
            Some(last) => last.next(),
        };
        if expected != Some(phase) {
            return Err(EngineError::PhaseOrder {
                expected,
                got: phase,
            });
        }
        context.last_phase = Some(phase);

        let rules = Arc::clone(&context.rules);
        if rules.mode == EngineMode::Off {
            return Ok(Vec::new());
        }

        let mut matches = Vec::new();
        let mut skip_remaining = 0u32;
        let mut skip_to_marker: Option<&str> = None;

        for step in &rules.phases[usize::from(phase.number() - 1)] {
            let index = match step {
                Step::Marker(name) => {
                    if skip_to_marker == Some(name.as_str()) {
                        skip_to_marker = None;
                    }
                    continue;
                }
                Step::Rule(index) => *index,
            };
            if skip_to_marker.is_some() {
                continue;
            }
            if skip_remaining > 0 {
                skip_remaining -= 1;
                continue;
            }

            let rule = &rules.rules[index];
            let Some(found) = self.evaluate_rule(rule, context, tx) else {
                continue;
            };
            if rule.skip > 0 {
                skip_remaining = rule.skip;
            }
            if let Some(marker) = &rule.skip_after {
                skip_to_marker = Some(marker.as_str());
            }
            if !rule.nolog {
                matches.push(found);
            }
        }

        Ok(matches)
    }

    fn release_context(&self, context: SecLangContext) {
        drop(context);
        let previous = self.live_contexts.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!(m::ENGINE_CONTEXTS_ACTIVE).set(previous.saturating_sub(1) as f64);
    }
}

impl SecLangEngine {
    /// 규칙 하나(체인 전체)를 평가합니다. 발동하면 일치 정보를 반환합니다.
    fn evaluate_rule(
        &self,
        rule: &CompiledRule,
        context: &mut SecLangContext,
        tx: &NormalizedTransaction,
    ) -> Option<RuleMatch> {
        let mut matched: Vec<VarValue> = Vec::new();

        for link in &rule.links {
            let hits = self.evaluate_link(rule, link, context, tx, &matched)?;
            matched.extend(hits);
        }

        let last = matched.last();
        let matched_name = last.map(|v| v.name.clone()).unwrap_or_default();
        let matched_value = last.map(|v| v.value.clone()).unwrap_or_default();

        for link in &rule.links {
            for setvar in &link.setvars {
                apply_setvar(setvar, &mut context.tx_vars, &matched_value, &matched_name, rule.id);
            }
        }

        let scope = MacroScope {
            tx_vars: &context.tx_vars,
            matched_var: &matched_value,
            matched_var_name: &matched_name,
            rule_id: rule.id,
        };
        let message = macros::expand(&rule.message, &scope);
        let match_message = rule
            .logdata
            .as_deref()
            .map(|template| macros::expand(template, &scope))
            .unwrap_or_default();

        let has_target = last.is_some();
        Some(RuleMatch {
            rule_id: rule.id,
            message,
            match_message,
            severity: rule.severity,
            anomaly_score: rule.severity.anomaly_score(),
            paranoia_level: rule.paranoia_level,
            matched_field: has_target.then(|| matched_name.clone()),
            matched_value: has_target.then_some(matched_value),
            tags: rule.tags.clone(),
            phase: rule.phase,
        })
    }

    /// 체인 고리 하나를 평가합니다.
    ///
    /// 고리가 일치하지 않으면 `None`, 일치하면 일치한 변수 값을 반환합니다.
    /// 대상 없는 고리는 값 없이 일치할 수 있습니다.
    fn evaluate_link(
        &self,
        rule: &CompiledRule,
        link: &CompiledLink,
        context: &mut SecLangContext,
        tx: &NormalizedTransaction,
        matched: &[VarValue],
    ) -> Option<Vec<VarValue>> {
        let (prev_value, prev_name) = matched
            .last()
            .map(|v| (v.value.as_str(), v.name.as_str()))
            .unwrap_or_default();

        let mut hits = Vec::new();
        let mut captures = None;
        let fired = {
            let scope = MacroScope {
                tx_vars: &context.tx_vars,
                matched_var: prev_value,
                matched_var_name: prev_name,
                rule_id: rule.id,
            };

            if link.unconditional {
                link.operator.evaluate("", &self.detectors, &scope).matched
            } else {
                let view = EvalView {
                    tx,
                    tx_vars: &context.tx_vars,
                    phase: rule.phase,
                    matched,
                };
                for value in link.targets.collect(&view) {
                    let input = apply_all(&link.transforms, &value.value);
                    let result = link.operator.evaluate(&input, &self.detectors, &scope);
                    if result.matched {
                        if link.capture && captures.is_none() && !result.captures.is_empty() {
                            captures = Some(result.captures);
                        }
                        hits.push(value);
                    }
                }
                !hits.is_empty()
            }
        };

        if let Some(captures) = captures {
            for i in 0..10 {
                context.tx_vars.remove(&i.to_string());
            }
            for (i, capture) in captures.into_iter().enumerate() {
                context.tx_vars.insert(i.to_string(), capture);
            }
        }

        fired.then_some(hits)
    }
}

fn apply_setvar(
    setvar: &SetVar,
    tx_vars: &mut HashMap<String, String>,
    matched_value: &str,
    matched_name: &str,
    rule_id: u64,
) {
    let scope = MacroScope {
        tx_vars: &*tx_vars,
        matched_var: matched_value,
        matched_var_name: matched_name,
        rule_id,
    };
    let update = match &setvar.op {
        SetVarOp::Set(v) => Some(macros::expand(v, &scope)),
        SetVarOp::Add(v) => {
            let delta = parse_number(&macros::expand(v, &scope));
            let current = tx_vars.get(&setvar.name).map_or(0, |c| parse_number(c));
            Some(current.saturating_add(delta).to_string())
        }
        SetVarOp::Sub(v) => {
            let delta = parse_number(&macros::expand(v, &scope));
            let current = tx_vars.get(&setvar.name).map_or(0, |c| parse_number(c));
            Some(current.saturating_sub(delta).to_string())
        }
        SetVarOp::Delete => None,
    };
    match update {
        Some(value) => {
            tx_vars.insert(setvar.name.clone(), value);
        }
        None => {
            tx_vars.remove(&setvar.name);
        }
    }
}

fn parse_number(value: &str) -> i64 {
    value.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::RuleBundle;
    use crate::loader::RuleSetLoader;
    use ocinspect_core::transaction::InspectedBody;

    fn compile(rules: &str) -> (SecLangEngine, Arc<CompiledRules>) {
        let engine = SecLangEngine::new().unwrap();
        let merged = RuleSetLoader::merge(&RuleBundle::inline(rules), &RuleBundle::empty()).unwrap();
        let compiled = engine.load_rule_set(&merged).unwrap();
        (engine, Arc::new(compiled))
    }

    fn tx_with_body(body_args: &[(&str, &str)]) -> NormalizedTransaction {
        let body = body_args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        NormalizedTransaction {
            correlation_id: "c1".to_owned(),
            method: "POST".to_owned(),
            uri: "/login".to_owned(),
            path: "/login".to_owned(),
            protocol: "HTTP/1.1".to_owned(),
            body_args: body_args
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            request_body: InspectedBody {
                original_len: body.len(),
                data: body.into_bytes().into(),
                ..InspectedBody::default()
            },
            ..NormalizedTransaction::default()
        }
    }

    fn run_all(
        engine: &SecLangEngine,
        compiled: &Arc<CompiledRules>,
        tx: &NormalizedTransaction,
    ) -> Vec<RuleMatch> {
        let mut ctx = engine.create_context(compiled).unwrap();
        let mut out = Vec::new();
        for phase in Phase::ALL {
            out.extend(engine.evaluate_phase(&mut ctx, phase, tx).unwrap());
        }
        engine.release_context(ctx);
        out
    }

    #[test]
    fn body_rule_reports_matched_variable_name() {
        let (engine, compiled) = compile(
            "SecRule ARGS \"@detectSQLi\" \"id:942100,phase:2,deny,\
             msg:'SQL Injection Attack Detected',logdata:'Matched Data: %{MATCHED_VAR} found within %{MATCHED_VAR_NAME}',\
             severity:'CRITICAL',tag:'paranoia-level/1'\"",
        );
        let tx = tx_with_body(&[("param1", "1' OR '1'='1")]);
        let matches = run_all(&engine, &compiled, &tx);

        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.rule_id, 942100);
        assert_eq!(m.phase, Phase::RequestBody);
        assert_eq!(m.severity, Severity::Critical);
        assert_eq!(m.anomaly_score, 5);
        assert_eq!(m.paranoia_level, 1);
        assert_eq!(m.matched_field.as_deref(), Some("ARGS:param1"));
        assert!(m.match_message.contains("ARGS:param1"));
        assert!(m.match_message.contains("1' OR '1'='1"));
    }

    #[test]
    fn rule_without_severity_defaults_to_warning() {
        let (engine, compiled) = compile("SecRule REQUEST_METHOD \"@streq POST\" \"id:10,phase:1\"");
        let matches = run_all(&engine, &compiled, &tx_with_body(&[]));
        assert_eq!(matches[0].severity, Severity::Medium);
        assert_eq!(matches[0].anomaly_score, 3);
    }

    #[test]
    fn chain_fires_only_when_all_links_match() {
        let rules = "SecRule REQUEST_METHOD \"@streq POST\" \"id:20,phase:2,chain\"\n\
                     SecRule ARGS:user \"@rx ^admin$\"";
        let (engine, compiled) = compile(rules);

        let hit = run_all(&engine, &compiled, &tx_with_body(&[("user", "admin")]));
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].matched_field.as_deref(), Some("ARGS:user"));

        let miss = run_all(&engine, &compiled, &tx_with_body(&[("user", "bob")]));
        assert!(miss.is_empty());
    }

    #[test]
    fn setvar_accumulates_across_rules() {
        let rules = "SecAction \"id:1,phase:1,nolog,setvar:tx.score=0\"\n\
                     SecRule ARGS \"@contains evil\" \"id:2,phase:2,nolog,setvar:tx.score=+5\"\n\
                     SecRule TX:score \"@ge 5\" \"id:3,phase:2,msg:'score %{tx.score}'\"";
        let (engine, compiled) = compile(rules);
        let tx = tx_with_body(&[("q", "evil")]);
        let matches = run_all(&engine, &compiled, &tx);

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule_id, 3);
        assert_eq!(matches[0].message, "score 5");
    }

    #[test]
    fn skip_after_jumps_to_marker() {
        let rules = "SecRule REQUEST_METHOD \"@streq POST\" \"id:1,phase:1,nolog,skipAfter:END\"\n\
                     SecRule REQUEST_METHOD \"@rx .\" \"id:2,phase:1\"\n\
                     SecMarker END\n\
                     SecRule REQUEST_METHOD \"@rx .\" \"id:3,phase:1\"";
        let (engine, compiled) = compile(rules);
        let ids: Vec<u64> = run_all(&engine, &compiled, &tx_with_body(&[]))
            .iter()
            .map(|m| m.rule_id)
            .collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn engine_off_produces_nothing() {
        let (engine, compiled) =
            compile("SecRuleEngine Off\nSecRule REQUEST_METHOD \"@rx .\" \"id:1,phase:1\"");
        assert!(run_all(&engine, &compiled, &tx_with_body(&[])).is_empty());
    }

    #[test]
    fn phases_must_advance_in_order() {
        let (engine, compiled) = compile("SecRule REQUEST_METHOD \"@rx .\" \"id:1,phase:1\"");
        let tx = tx_with_body(&[]);
        let mut ctx = engine.create_context(&compiled).unwrap();

        let err = engine
            .evaluate_phase(&mut ctx, Phase::RequestBody, &tx)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::PhaseOrder {
                expected: Some(Phase::RequestHeaders),
                got: Phase::RequestBody
            }
        ));

        engine
            .evaluate_phase(&mut ctx, Phase::RequestHeaders, &tx)
            .unwrap();
        let err = engine
            .evaluate_phase(&mut ctx, Phase::RequestHeaders, &tx)
            .unwrap_err();
        assert!(matches!(err, EngineError::PhaseOrder { .. }));
        engine.release_context(ctx);
    }

    #[test]
    fn context_limit_is_enforced() {
        let engine = SecLangEngine::new().unwrap().with_max_contexts(1);
        let merged = RuleSetLoader::merge(&RuleBundle::empty(), &RuleBundle::empty()).unwrap();
        let compiled = Arc::new(engine.load_rule_set(&merged).unwrap());

        let first = engine.create_context(&compiled).unwrap();
        assert!(matches!(
            engine.create_context(&compiled),
            Err(EngineError::ResourceExhausted(_))
        ));
        engine.release_context(first);
        assert_eq!(engine.live_contexts(), 0);
        let second = engine.create_context(&compiled).unwrap();
        engine.release_context(second);
    }

    #[test]
    fn invalid_operator_argument_is_a_violation() {
        let engine = SecLangEngine::new().unwrap();
        let merged = RuleSetLoader::merge(
            &RuleBundle::inline("SecRule ARGS \"@pmFromFile missing.data\" \"id:1\""),
            &RuleBundle::empty(),
        )
        .unwrap();
        let err = engine.load_rule_set(&merged).unwrap_err();
        assert_eq!(err.violations()[0].line, 1);
    }
}
