//! 파라미터 이상 검사기 -- 규칙 엔진과 별개로 개별 인자 값을 검사
//!
//! 쿼리 인자, 쿠키, 본문 인자, 원시 요청 본문을 하나씩 [`ParamInspector`]에 넘기고
//! 이상이 보이면 엔진 결과와 같은 형태의 [`Finding`]을 만듭니다.
//!
//! 기본 검사기:
//! - [`XxeInspector`]: 값에 `<!ENTITY` 선언이 있음 (XML 외부 엔티티)
//! - [`NoSqlOperatorInspector`]: `$`로 시작하는 키 (`{"$ne": null}`, `user[$gt]`, `json.a.$where`)
//!
//! 결과의 매칭 메시지에는 값이 들어가지 않습니다.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use ocinspect_core::finding::Finding;
use ocinspect_core::transaction::NormalizedTransaction;
use ocinspect_core::types::{Phase, Severity};

/// XXE 검사기 규칙 ID
pub const XXE_RULE_ID: u64 = 9_900_001;
/// NoSQL 연산자 검사기 규칙 ID
pub const NOSQL_OPERATOR_RULE_ID: u64 = 9_900_002;
/// 파라미터 검사 결과 공통 태그
pub const PARAM_INSPECTION_TAG: &str = "ocinspect/param-inspection";

const XXE_MARKER: &str = "<!ENTITY";

/// 검사 대상 값의 출처
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    /// 쿼리 인자
    QueryArg,
    /// 요청 쿠키
    Cookie,
    /// 본문 인자 (폼, JSON)
    BodyArg,
    /// 인자로 해석되지 않은 원시 요청 본문
    Body,
}

impl ParamSource {
    /// 값이 처음 사용 가능한 단계
    pub fn phase(self) -> Phase {
        match self {
            Self::QueryArg | Self::Cookie => Phase::RequestHeaders,
            Self::BodyArg | Self::Body => Phase::RequestBody,
        }
    }

    /// SecLang 변수 이름 형식의 필드 (`ARGS_GET:id`)
    pub fn field(self, name: &str) -> String {
        match self {
            Self::QueryArg => format!("ARGS_GET:{name}"),
            Self::Cookie => format!("REQUEST_COOKIES:{name}"),
            Self::BodyArg => format!("ARGS_POST:{name}"),
            Self::Body => "REQUEST_BODY".to_owned(),
        }
    }
}

/// 검사할 값 하나
#[derive(Debug, Clone, Copy)]
pub struct Param<'a> {
    pub source: ParamSource,
    pub name: &'a str,
    pub value: &'a str,
}

/// 검사기가 보고한 이상
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamAnomaly {
    pub rule_id: u64,
    pub message: &'static str,
    pub severity: Severity,
    /// 분류 태그 (`attack-xxe` 등)
    pub tag: &'static str,
}

/// 개별 값 검사기
pub trait ParamInspector: Send + Sync + 'static {
    /// 검사기 이름
    fn name(&self) -> &'static str;

    /// 값 하나를 검사합니다. 이상이 없으면 `None`.
    fn inspect(&self, param: &Param<'_>) -> Option<ParamAnomaly>;
}

/// XML 외부 엔티티 선언 검사기
#[derive(Debug, Default)]
pub struct XxeInspector;

impl ParamInspector for XxeInspector {
    fn name(&self) -> &'static str {
        "xxe"
    }

    fn inspect(&self, param: &Param<'_>) -> Option<ParamAnomaly> {
        param.value.contains(XXE_MARKER).then_some(ParamAnomaly {
            rule_id: XXE_RULE_ID,
            message: "XML external entity declaration",
            severity: Severity::Critical,
            tag: "attack-xxe",
        })
    }
}

/// NoSQL 쿼리 연산자 검사기
#[derive(Debug, Default)]
pub struct NoSqlOperatorInspector;

impl NoSqlOperatorInspector {
    /// `json.user.$ne`, `user[$ne]` 같은 인자 이름
    fn operator_in_name(name: &str) -> bool {
        name.split(['.', '[', ']'])
            .any(|segment| segment.len() > 1 && segment.starts_with('$'))
    }

    /// JSON 문서인 값 안의 `$` 키
    fn operator_in_value(value: &str) -> bool {
        if !value.contains('$') {
            return false;
        }
        match serde_json::from_str::<Value>(value) {
            Ok(parsed) => has_operator_key(&parsed),
            Err(_) => false,
        }
    }
}

fn has_operator_key(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(key, nested)| key.starts_with('$') || has_operator_key(nested)),
        Value::Array(items) => items.iter().any(has_operator_key),
        _ => false,
    }
}

impl ParamInspector for NoSqlOperatorInspector {
    fn name(&self) -> &'static str {
        "nosql-operator"
    }

    fn inspect(&self, param: &Param<'_>) -> Option<ParamAnomaly> {
        let found = (param.source != ParamSource::Body && Self::operator_in_name(param.name))
            || Self::operator_in_value(param.value);
        found.then_some(ParamAnomaly {
            rule_id: NOSQL_OPERATOR_RULE_ID,
            message: "NoSQL query operator in parameter",
            severity: Severity::Critical,
            tag: "attack-nosql-injection",
        })
    }
}

/// 트랜잭션 단위로 검사기 묶음을 실행
///
/// 복제 비용은 `Arc` 하나입니다. 검사기가 없으면 아무것도 하지 않습니다.
#[derive(Clone)]
pub struct ParamInspection {
    inspectors: Arc<[Box<dyn ParamInspector>]>,
}

impl ParamInspection {
    /// 기본 검사기 (XXE, NoSQL 연산자)
    pub fn standard() -> Self {
        Self::with_inspectors(vec![
            Box::new(XxeInspector),
            Box::new(NoSqlOperatorInspector),
        ])
    }

    /// 검사하지 않음
    pub fn disabled() -> Self {
        Self::with_inspectors(Vec::new())
    }

    pub fn with_inspectors(inspectors: Vec<Box<dyn ParamInspector>>) -> Self {
        Self {
            inspectors: inspectors.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.inspectors.is_empty()
    }

    /// 모든 값을 검사해 결과를 돌려줍니다. 같은 필드의 같은 이상은 한 번만 보고합니다.
    pub fn inspect(&self, tx: &NormalizedTransaction) -> Vec<Finding> {
        if !self.is_enabled() {
            return Vec::new();
        }

        let body_text;
        let mut params: Vec<Param<'_>> = Vec::new();
        params.extend(tx.query_args.iter().map(|(name, value)| Param {
            source: ParamSource::QueryArg,
            name,
            value,
        }));
        params.extend(tx.request_cookies.iter().map(|(name, value)| Param {
            source: ParamSource::Cookie,
            name,
            value,
        }));
        params.extend(tx.body_args.iter().map(|(name, value)| Param {
            source: ParamSource::BodyArg,
            name,
            value,
        }));
        // 인자로 풀리지 않은 본문(XML 등)만 통째로 검사
        if tx.body_args.is_empty() && !tx.request_body.is_empty() {
            body_text = tx.request_body.as_text();
            params.push(Param {
                source: ParamSource::Body,
                name: "",
                value: &body_text,
            });
        }

        let mut seen = BTreeSet::new();
        let mut findings = Vec::new();
        for param in &params {
            for inspector in self.inspectors.iter() {
                let Some(anomaly) = inspector.inspect(param) else {
                    continue;
                };
                let field = param.source.field(param.name);
                if !seen.insert((anomaly.rule_id, field.clone())) {
                    continue;
                }
                tracing::debug!(
                    inspector = inspector.name(),
                    field = %field,
                    "parameter anomaly"
                );
                findings.push(to_finding(anomaly, param.source.phase(), field, tx));
            }
        }
        findings
    }
}

impl std::fmt::Debug for ParamInspection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.inspectors.iter().map(|i| i.name()).collect();
        f.debug_struct("ParamInspection")
            .field("inspectors", &names)
            .finish()
    }
}

fn to_finding(
    anomaly: ParamAnomaly,
    phase: Phase,
    field: String,
    tx: &NormalizedTransaction,
) -> Finding {
    Finding {
        rule_id: anomaly.rule_id,
        message: anomaly.message.to_owned(),
        match_message: format!("{} found in {field}", anomaly.message),
        severity: anomaly.severity,
        anomaly_score: anomaly.severity.anomaly_score(),
        paranoia_level: 1,
        phase,
        matched_field: Some(field),
        correlation_id: tx.correlation_id.clone(),
        tags: vec![anomaly.tag.to_owned(), PARAM_INSPECTION_TAG.to_owned()],
        truncated: tx.truncated_in(phase),
    }
}
