//! SecLang 액션 파싱
//!
//! 규칙의 메타데이터(id, phase, msg, severity, tag)와 흐름 제어(chain, skip,
//! skipAfter), 트랜잭션 변수 조작(setvar)을 해석합니다.
//! 차단/감사 로그 계열 액션은 검사 전용 엔진에서 의미가 없으므로
//! 문법만 확인하고 [`Action::Meta`]로 보존합니다.

use ocinspect_core::types::Severity;

use super::lexer::{split_quoted_list, unquote};
use super::transformations::Transformation;

/// 단일 액션
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// 규칙 ID
    Id(u64),
    /// 평가 단계 (1-5)
    Phase(u8),
    /// 메시지
    Msg(String),
    /// 로그 데이터 (매크로 포함 가능)
    LogData(String),
    /// 심각도
    Severity(Severity),
    /// 태그
    Tag(String),
    /// 변환 함수
    Transform(Transformation),
    /// 다음 규칙과 체인
    Chain,
    /// 트랜잭션 변수 조작
    SetVar(SetVar),
    /// rx 캡처 그룹을 TX:0-9에 저장
    Capture,
    /// 탐지 결과를 만들지 않음
    NoLog,
    /// 탐지 결과를 만듦 (기본값)
    Log,
    /// 일치 시 다음 N개 규칙 건너뛰기
    Skip(u32),
    /// 일치 시 해당 마커까지 건너뛰기
    SkipAfter(String),
    /// 검사에 영향을 주지 않는 액션 (이름만 보존)
    Meta(String),
}

impl Action {
    /// 같은 종류의 액션인지 비교합니다. (SecRuleUpdateActionById 교체용)
    pub fn same_kind(&self, other: &Action) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// 여러 번 나타날 수 있는 누적형 액션인지 여부
    pub fn is_cumulative(&self) -> bool {
        matches!(
            self,
            Self::Tag(_) | Self::Transform(_) | Self::SetVar(_) | Self::Meta(_)
        )
    }
}

/// `setvar` 연산
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetVarOp {
    /// 값 설정 (매크로 확장 대상)
    Set(String),
    /// 정수 더하기 (매크로 확장 대상)
    Add(String),
    /// 정수 빼기 (매크로 확장 대상)
    Sub(String),
    /// 삭제
    Delete,
}

/// `setvar:tx.name=value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetVar {
    /// 변수 이름 (소문자, `tx.` 제외)
    pub name: String,
    /// 연산
    pub op: SetVarOp,
}

/// 검사에 영향이 없어 무시하는 액션 이름
const META_ACTIONS: &[&str] = &[
    "deny",
    "block",
    "pass",
    "allow",
    "drop",
    "redirect",
    "proxy",
    "status",
    "auditlog",
    "noauditlog",
    "ctl",
    "ver",
    "rev",
    "maturity",
    "accuracy",
    "multimatch",
    "expirevar",
    "initcol",
    "setuid",
    "setsid",
    "sanitisearg",
    "sanitisematched",
    "sanitisematchedbytes",
    "sanitiserequestheader",
    "sanitiseresponseheader",
    "append",
    "prepend",
    "exec",
    "deprecatevar",
    "xmlns",
    "setenv",
];

/// 액션 목록 문자열을 파싱합니다.
///
/// # Errors
/// 알 수 없는 액션이나 잘못된 값이 있으면 설명 문자열을 반환합니다.
pub fn parse_actions(input: &str) -> Result<Vec<Action>, String> {
    let items = split_quoted_list(input)?;
    items.iter().map(|item| parse_action(item)).collect()
}

fn parse_action(item: &str) -> Result<Action, String> {
    let (name, value) = match item.split_once(':') {
        Some((name, value)) => (name.trim(), Some(value.trim())),
        None => (item.trim(), None),
    };
    let lower = name.to_ascii_lowercase();

    let required = |value: Option<&str>| -> Result<String, String> {
        value
            .map(unquote)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| format!("action '{name}' requires a value"))
    };

    let action = match lower.as_str() {
        "id" => {
            let raw = required(value)?;
            let id = raw
                .parse::<u64>()
                .map_err(|_| format!("invalid rule id '{raw}'"))?;
            if id == 0 {
                return Err("rule id must be greater than 0".to_owned());
            }
            Action::Id(id)
        }
        "phase" => Action::Phase(parse_phase(&required(value)?)?),
        "msg" => Action::Msg(value.map(unquote).unwrap_or_default()),
        "logdata" => Action::LogData(value.map(unquote).unwrap_or_default()),
        "severity" => {
            let raw = required(value)?;
            Action::Severity(
                Severity::from_seclang(&raw).ok_or_else(|| format!("invalid severity '{raw}'"))?,
            )
        }
        "tag" => Action::Tag(required(value)?),
        "t" => Action::Transform(Transformation::parse(&required(value)?)?),
        "chain" => Action::Chain,
        "capture" => Action::Capture,
        "nolog" => Action::NoLog,
        "log" => Action::Log,
        "skip" => {
            let raw = required(value)?;
            let n = raw
                .parse::<u32>()
                .map_err(|_| format!("invalid skip count '{raw}'"))?;
            Action::Skip(n)
        }
        "skipafter" => Action::SkipAfter(required(value)?),
        "setvar" => match parse_setvar(&required(value)?)? {
            Some(setvar) => Action::SetVar(setvar),
            None => Action::Meta(lower),
        },
        other if META_ACTIONS.contains(&other) => Action::Meta(lower),
        _ => return Err(format!("unknown action '{name}'")),
    };
    Ok(action)
}

fn parse_phase(raw: &str) -> Result<u8, String> {
    match raw.to_ascii_lowercase().as_str() {
        "request" => Ok(2),
        "response" => Ok(4),
        "logging" => Ok(5),
        other => match other.parse::<u8>() {
            Ok(n @ 1..=5) => Ok(n),
            _ => Err(format!("invalid phase '{raw}'")),
        },
    }
}

/// `setvar` 값을 해석합니다. `tx` 이외 컬렉션은 `None`입니다.
fn parse_setvar(raw: &str) -> Result<Option<SetVar>, String> {
    let (delete, body) = match raw.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };

    let (target, value) = match body.split_once('=') {
        Some((target, value)) => (target.trim(), Some(value)),
        None => (body.trim(), None),
    };

    let Some((collection, name)) = target.split_once('.') else {
        return Err(format!("invalid setvar target '{target}'"));
    };
    if !collection.eq_ignore_ascii_case("tx") {
        return Ok(None);
    }
    if name.is_empty() {
        return Err(format!("invalid setvar target '{target}'"));
    }
    let name = name.to_ascii_lowercase();

    let op = if delete {
        SetVarOp::Delete
    } else {
        match value {
            None => SetVarOp::Set("1".to_owned()),
            Some(v) => {
                if let Some(n) = v.strip_prefix('+') {
                    SetVarOp::Add(n.to_owned())
                } else if let Some(n) = v.strip_prefix('-') {
                    SetVarOp::Sub(n.to_owned())
                } else {
                    SetVarOp::Set(v.to_owned())
                }
            }
        }
    };
    Ok(Some(SetVar { name, op }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_crs_style_action_list() {
        let actions = parse_actions(
            "id:942100,phase:2,block,capture,t:none,t:urlDecodeUni,\
             msg:'SQL Injection Attack Detected via libinjection',\
             logdata:'Matched Data: %{TX.0} found within %{MATCHED_VAR_NAME}',\
             tag:'paranoia-level/1',severity:'CRITICAL',\
             setvar:'tx.sql_injection_score=+%{tx.critical_anomaly_score}'",
        )
        .unwrap();

        assert_eq!(actions[0], Action::Id(942100));
        assert_eq!(actions[1], Action::Phase(2));
        assert_eq!(actions[2], Action::Meta("block".to_owned()));
        assert_eq!(actions[3], Action::Capture);
        assert_eq!(actions[4], Action::Transform(Transformation::None));
        assert!(actions.contains(&Action::Msg(
            "SQL Injection Attack Detected via libinjection".to_owned()
        )));
        assert!(actions.contains(&Action::Tag("paranoia-level/1".to_owned())));
        assert!(actions.contains(&Action::Severity(Severity::Critical)));
        assert!(actions.contains(&Action::SetVar(SetVar {
            name: "sql_injection_score".to_owned(),
            op: SetVarOp::Add("%{tx.critical_anomaly_score}".to_owned()),
        })));
    }

    #[test]
    fn phase_names_map_to_numbers() {
        assert_eq!(parse_actions("phase:request").unwrap(), vec![Action::Phase(2)]);
        assert_eq!(parse_actions("phase:response").unwrap(), vec![Action::Phase(4)]);
        assert!(parse_actions("phase:9").is_err());
    }

    #[test]
    fn setvar_variants() {
        assert_eq!(
            parse_setvar("!tx.foo").unwrap(),
            Some(SetVar {
                name: "foo".to_owned(),
                op: SetVarOp::Delete
            })
        );
        assert_eq!(
            parse_setvar("tx.Flag").unwrap(),
            Some(SetVar {
                name: "flag".to_owned(),
                op: SetVarOp::Set("1".to_owned())
            })
        );
        assert_eq!(parse_setvar("ip.reput_block_flag=1").unwrap(), None);
        assert!(parse_setvar("novalue").is_err());
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = parse_actions("id:1,frobnicate").unwrap_err();
        assert!(err.contains("frobnicate"));
    }

    #[test]
    fn zero_id_is_rejected() {
        assert!(parse_actions("id:0").is_err());
    }

    #[test]
    fn same_kind_compares_discriminants() {
        assert!(Action::Msg("a".to_owned()).same_kind(&Action::Msg("b".to_owned())));
        assert!(!Action::Msg("a".to_owned()).same_kind(&Action::LogData("a".to_owned())));
        assert!(Action::Tag("x".to_owned()).is_cumulative());
        assert!(!Action::Severity(Severity::High).is_cumulative());
    }
}
