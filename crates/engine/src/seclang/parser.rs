//! SecLang 지시어 파서
//!
//! 규칙 텍스트를 지시어 목록으로 변환합니다. 체인 규칙은 하나의 [`RuleDef`]로
//! 조립됩니다. 문법 오류는 첫 번째에서 멈추지 않고 모두 수집되어
//! [`ParsedBundle::violations`]로 반환됩니다.

use ocinspect_core::error::{RuleViolation, ViolationKind};
use ocinspect_core::types::Severity;

use super::actions::{Action, parse_actions};
use super::lexer::{logical_lines, split_args};
use super::operators::{OperatorKind, OperatorSpec, parse_operator};
use super::transformations::Transformation;
use super::variables::{VariableSpec, parse_targets};

/// 규칙의 기본 단계 (SecDefaultAction 기본값과 동일)
pub const DEFAULT_PHASE: u8 = 2;

/// 엔진 동작 모드
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineMode {
    #[default]
    On,
    Off,
    DetectionOnly,
}

/// 규칙 ID 범위 (양끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub start: u64,
    pub end: u64,
}

impl IdRange {
    /// 범위에 포함되는지 여부
    pub fn contains(&self, id: u64) -> bool {
        (self.start..=self.end).contains(&id)
    }
}

/// `SecRuleMoveById` 위치
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovePosition {
    Before,
    After,
}

/// 규칙 정의 (체인 포함)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDef {
    /// 규칙 ID (체인 하위 규칙은 없음)
    pub id: Option<u64>,
    /// SecLang 단계 (1-5)
    pub phase: u8,
    pub targets: Vec<VariableSpec>,
    pub operator: OperatorSpec,
    pub actions: Vec<Action>,
    /// 체인으로 연결된 다음 규칙
    pub chain: Option<Box<RuleDef>>,
    /// 정의된 소스
    pub source: String,
    /// 정의된 줄
    pub line: usize,
}

impl RuleDef {
    fn from_parts(
        targets: Vec<VariableSpec>,
        operator: OperatorSpec,
        actions: Vec<Action>,
        source: &str,
        line: usize,
    ) -> Self {
        let mut rule = Self {
            id: None,
            phase: DEFAULT_PHASE,
            targets,
            operator,
            actions: Vec::new(),
            chain: None,
            source: source.to_owned(),
            line,
        };
        rule.set_actions(actions);
        rule
    }

    /// 액션 목록을 교체하고 id/phase를 다시 계산합니다.
    pub fn set_actions(&mut self, actions: Vec<Action>) {
        self.id = None;
        for action in &actions {
            match action {
                Action::Id(id) => self.id = Some(*id),
                Action::Phase(phase) => self.phase = *phase,
                _ => {}
            }
        }
        self.actions = actions;
    }

    /// 체인을 시작하는 규칙인지 여부
    pub fn starts_chain(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, Action::Chain))
    }

    /// `phase` 액션이 명시되었는지 여부
    pub fn has_explicit_phase(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, Action::Phase(_)))
    }

    /// 메시지
    pub fn msg(&self) -> Option<&str> {
        self.actions.iter().rev().find_map(|a| match a {
            Action::Msg(m) => Some(m.as_str()),
            _ => None,
        })
    }

    /// 로그 데이터 템플릿
    pub fn logdata(&self) -> Option<&str> {
        self.actions.iter().rev().find_map(|a| match a {
            Action::LogData(m) => Some(m.as_str()),
            _ => None,
        })
    }

    /// 심각도
    pub fn severity(&self) -> Option<Severity> {
        self.actions.iter().rev().find_map(|a| match a {
            Action::Severity(s) => Some(*s),
            _ => None,
        })
    }

    /// 태그 목록
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(|a| match a {
            Action::Tag(t) => Some(t.as_str()),
            _ => None,
        })
    }

    /// 유효 변환 목록 (`t:none` 이후)
    pub fn transforms(&self) -> Vec<Transformation> {
        let mut out = Vec::new();
        for action in &self.actions {
            if let Action::Transform(t) = action {
                if *t == Transformation::None {
                    out.clear();
                } else {
                    out.push(*t);
                }
            }
        }
        out
    }

    /// `paranoia-level/N` 태그의 값. 없으면 1.
    pub fn paranoia_level(&self) -> u8 {
        self.tags()
            .find_map(|t| t.strip_prefix("paranoia-level/"))
            .and_then(|n| n.parse().ok())
            .unwrap_or(1)
    }

    /// 체인 전체의 규칙 수
    pub fn chain_len(&self) -> usize {
        1 + self.chain.as_ref().map_or(0, |c| c.chain_len())
    }
}

/// 파싱된 지시어
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `SecRule` / `SecAction`
    Rule(RuleDef),
    /// `SecRuleEngine`
    EngineMode(EngineMode),
    /// `SecComponentSignature`
    ComponentSignature(String),
    /// `SecMarker`
    Marker(String),
    /// `SecRuleRemoveById`
    RemoveById(Vec<IdRange>),
    /// `SecRuleRemoveByTag`
    RemoveByTag(String),
    /// `SecRuleRemoveByMsg`
    RemoveByMsg(String),
    /// `SecRuleUpdateActionById`
    UpdateActionById { id: u64, actions: Vec<Action> },
    /// `SecRuleUpdateTargetById`
    UpdateTargetById { id: u64, targets: Vec<VariableSpec> },
    /// `SecRuleMoveById <id> before|after <anchor>`
    MoveById {
        id: u64,
        position: MovePosition,
        anchor: u64,
    },
    /// 검사에 영향이 없는 설정 지시어
    Config(String),
}

/// 위치 정보가 붙은 값
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located<T> {
    pub source: String,
    pub line: usize,
    pub value: T,
}

/// 파싱 결과
#[derive(Debug, Default)]
pub struct ParsedBundle {
    pub directives: Vec<Located<Directive>>,
    pub violations: Vec<RuleViolation>,
}

/// 받아들이지만 무시하는 설정 지시어
const CONFIG_DIRECTIVES: &[&str] = &[
    "secrequestbodyaccess",
    "secresponsebodyaccess",
    "secrequestbodylimit",
    "secrequestbodynofileslimit",
    "secrequestbodyinmemorylimit",
    "secrequestbodylimitaction",
    "secresponsebodylimit",
    "secresponsebodylimitaction",
    "secresponsebodymimetype",
    "secresponsebodymimetypesclear",
    "secrequestbodyjsondepthlimit",
    "secargumentslimit",
    "secargumentseparator",
    "seccookieformat",
    "secunicodemapfile",
    "secpcrematchlimit",
    "secpcrematchlimitrecursion",
    "secdefaultaction",
    "seccollectiontimeout",
    "secauditengine",
    "secauditlog",
    "secauditlog2",
    "secauditlogparts",
    "secauditlogtype",
    "secauditlogformat",
    "secauditlogstoragedir",
    "secauditlogdirmode",
    "secauditlogfilemode",
    "secauditlogrelevantstatus",
    "secdebuglog",
    "secdebugloglevel",
    "sectmpdir",
    "secdatadir",
    "secuploaddir",
    "secuploadkeepfiles",
    "secuploadfilemode",
    "secuploadfilelimit",
    "secstatusengine",
    "secgeolookupdb",
    "sechttpblkey",
    "secxmlexternalentity",
    "secserversignature",
    "secwebappid",
    "secsensorid",
    "secconnengine",
];

/// 규칙 텍스트를 파싱합니다.
pub fn parse(text: &str, source: &str) -> ParsedBundle {
    let mut parser = Parser {
        source,
        bundle: ParsedBundle::default(),
        chain: Vec::new(),
    };
    for line in logical_lines(text) {
        parser.line(line.line, &line.text);
    }
    parser.finish()
}

struct Parser<'a> {
    source: &'a str,
    bundle: ParsedBundle,
    /// 조립 중인 체인 (바깥 규칙부터)
    chain: Vec<RuleDef>,
}

impl Parser<'_> {
    fn violation(&mut self, line: usize, kind: ViolationKind, detail: impl Into<String>) {
        self.bundle
            .violations
            .push(RuleViolation::new(self.source, line, kind, detail));
    }

    fn emit(&mut self, line: usize, directive: Directive) {
        self.bundle.directives.push(Located {
            source: self.source.to_owned(),
            line,
            value: directive,
        });
    }

    fn line(&mut self, line: usize, text: &str) {
        let args = match split_args(text) {
            Ok(args) => args,
            Err(e) => {
                self.interrupt_chain(line);
                self.violation(line, ViolationKind::Syntax, e);
                return;
            }
        };
        let Some((name, params)) = args.split_first() else {
            return;
        };
        let lower = name.to_ascii_lowercase();

        if lower != "secrule" {
            self.interrupt_chain(line);
        }

        match self.directive(&lower, name, params, line) {
            Ok(Some(directive)) => self.emit(line, directive),
            Ok(None) => {}
            Err((kind, detail)) => self.violation(line, kind, detail),
        }
    }

    fn directive(
        &mut self,
        lower: &str,
        name: &str,
        params: &[String],
        line: usize,
    ) -> Result<Option<Directive>, (ViolationKind, String)> {
        let syntax = |detail: String| (ViolationKind::Syntax, detail);

        let directive = match lower {
            "secrule" => {
                let rule = self.parse_rule(params, line).map_err(syntax)?;
                return Ok(self.push_rule(rule, line));
            }
            "secaction" => {
                expect_args(name, params, 1, 1).map_err(syntax)?;
                let actions = parse_actions(&params[0]).map_err(syntax)?;
                let operator = OperatorSpec {
                    kind: OperatorKind::UnconditionalMatch,
                    negated: false,
                    argument: String::new(),
                };
                let rule = RuleDef::from_parts(Vec::new(), operator, actions, self.source, line);
                if rule.starts_chain() {
                    return Err(syntax("SecAction cannot start a chain".to_owned()));
                }
                return Ok(self.push_rule(rule, line));
            }
            "secruleengine" => {
                expect_args(name, params, 1, 1).map_err(syntax)?;
                let mode = match params[0].to_ascii_lowercase().as_str() {
                    "on" => EngineMode::On,
                    "off" => EngineMode::Off,
                    "detectiononly" => EngineMode::DetectionOnly,
                    other => return Err(syntax(format!("invalid SecRuleEngine mode '{other}'"))),
                };
                Directive::EngineMode(mode)
            }
            "seccomponentsignature" => {
                expect_args(name, params, 1, 1).map_err(syntax)?;
                Directive::ComponentSignature(params[0].clone())
            }
            "secmarker" => {
                expect_args(name, params, 1, 1).map_err(syntax)?;
                Directive::Marker(params[0].clone())
            }
            "secruleremovebyid" => {
                if params.is_empty() {
                    return Err(syntax("SecRuleRemoveById requires at least one id".to_owned()));
                }
                let ranges = params
                    .iter()
                    .flat_map(|p| p.split(','))
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(parse_id_range)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(syntax)?;
                Directive::RemoveById(ranges)
            }
            "secruleremovebytag" => {
                expect_args(name, params, 1, 1).map_err(syntax)?;
                regex::Regex::new(&params[0])
                    .map_err(|e| syntax(format!("invalid tag pattern '{}': {e}", params[0])))?;
                Directive::RemoveByTag(params[0].clone())
            }
            "secruleremovebymsg" => {
                expect_args(name, params, 1, 1).map_err(syntax)?;
                regex::Regex::new(&params[0])
                    .map_err(|e| syntax(format!("invalid msg pattern '{}': {e}", params[0])))?;
                Directive::RemoveByMsg(params[0].clone())
            }
            "secruleupdateactionbyid" => {
                expect_args(name, params, 2, 2).map_err(syntax)?;
                let id = parse_id(&params[0]).map_err(syntax)?;
                let actions = parse_actions(&params[1]).map_err(syntax)?;
                Directive::UpdateActionById { id, actions }
            }
            "secruleupdatetargetbyid" => {
                expect_args(name, params, 2, 3).map_err(syntax)?;
                let id = parse_id(&params[0]).map_err(syntax)?;
                let targets = parse_targets(&params[1]).map_err(syntax)?;
                Directive::UpdateTargetById { id, targets }
            }
            "secrulemovebyid" => {
                expect_args(name, params, 3, 3).map_err(syntax)?;
                let id = parse_id(&params[0]).map_err(syntax)?;
                let position = match params[1].to_ascii_lowercase().as_str() {
                    "before" => MovePosition::Before,
                    "after" => MovePosition::After,
                    other => {
                        return Err(syntax(format!(
                            "SecRuleMoveById position must be 'before' or 'after', got '{other}'"
                        )));
                    }
                };
                let anchor = parse_id(&params[2]).map_err(syntax)?;
                if anchor == id {
                    return Err(syntax(format!("rule {id} cannot be moved relative to itself")));
                }
                Directive::MoveById {
                    id,
                    position,
                    anchor,
                }
            }
            "include" => {
                return Err((
                    ViolationKind::UnknownDirective,
                    "Include is not supported; list bundle files in the rules directory instead"
                        .to_owned(),
                ));
            }
            other if CONFIG_DIRECTIVES.contains(&other) => Directive::Config(name.to_owned()),
            _ => {
                return Err((
                    ViolationKind::UnknownDirective,
                    format!("unknown directive '{name}'"),
                ));
            }
        };
        Ok(Some(directive))
    }

    fn parse_rule(&self, params: &[String], line: usize) -> Result<RuleDef, String> {
        expect_args("SecRule", params, 2, 3)?;
        let targets = parse_targets(&params[0])?;
        let operator = parse_operator(&params[1])?;
        let actions = match params.get(2) {
            Some(raw) => parse_actions(raw)?,
            None => Vec::new(),
        };
        Ok(RuleDef::from_parts(targets, operator, actions, self.source, line))
    }

    /// 규칙을 체인 스택에 넣고, 체인이 끝나면 지시어를 반환합니다.
    fn push_rule(&mut self, rule: RuleDef, line: usize) -> Option<Directive> {
        if let Some(head) = self.chain.first() {
            let head_phase = head.phase;
            let mut rule = rule;
            if rule.id.is_some() {
                self.violation(line, ViolationKind::Syntax, "chained rule must not have an id");
            }
            if rule.has_explicit_phase() {
                self.violation(line, ViolationKind::Syntax, "chained rule must not set a phase");
            }
            rule.phase = head_phase;
            self.chain.push(rule);
        } else {
            if rule.id.is_none() {
                self.violation(line, ViolationKind::Syntax, "rule is missing an id");
            }
            self.chain.push(rule);
        }

        if self.chain.last().is_some_and(RuleDef::starts_chain) {
            return None;
        }

        // 안쪽부터 접어 하나의 규칙으로 조립
        let mut folded = self.chain.pop()?;
        while let Some(mut parent) = self.chain.pop() {
            parent.chain = Some(Box::new(folded));
            folded = parent;
        }
        Some(Directive::Rule(folded))
    }

    fn interrupt_chain(&mut self, line: usize) {
        if let Some(head) = self.chain.first() {
            let start = head.line;
            self.chain.clear();
            self.violation(
                start,
                ViolationKind::Syntax,
                format!("chain started here is interrupted by another directive at line {line}"),
            );
        }
    }

    fn finish(mut self) -> ParsedBundle {
        if let Some(head) = self.chain.first() {
            let start = head.line;
            self.chain.clear();
            self.violation(
                start,
                ViolationKind::Syntax,
                "chain started here is not terminated before end of file",
            );
        }
        self.bundle
    }
}

fn expect_args(name: &str, params: &[String], min: usize, max: usize) -> Result<(), String> {
    if params.len() < min || params.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{min}-{max}")
        };
        return Err(format!(
            "{name} expects {expected} argument(s), got {}",
            params.len()
        ));
    }
    Ok(())
}

fn parse_id(raw: &str) -> Result<u64, String> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|&id| id > 0)
        .ok_or_else(|| format!("invalid rule id '{raw}'"))
}

fn parse_id_range(raw: &str) -> Result<IdRange, String> {
    match raw.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (parse_id(start)?, parse_id(end)?);
            if start > end {
                return Err(format!("invalid rule id range '{raw}'"));
            }
            Ok(IdRange { start, end })
        }
        None => {
            let id = parse_id(raw)?;
            Ok(IdRange { start: id, end: id })
        }
    }
}
