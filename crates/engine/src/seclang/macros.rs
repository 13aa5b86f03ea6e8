//! `%{...}` 매크로 확장
//!
//! 지원 매크로:
//! - `%{tx.name}` / `%{TX.name}`: 트랜잭션 변수
//! - `%{MATCHED_VAR}`: 마지막으로 일치한 값
//! - `%{MATCHED_VAR_NAME}`: 마지막으로 일치한 변수 이름 (예: `ARGS:param1`)
//! - `%{rule.id}`: 현재 규칙 ID
//!
//! 알 수 없는 매크로는 원문 그대로 남깁니다.

use std::collections::HashMap;

/// 매크로 확장에 필요한 값
pub struct MacroScope<'a> {
    /// 트랜잭션 변수 (이름은 소문자)
    pub tx_vars: &'a HashMap<String, String>,
    /// 마지막 일치 값
    pub matched_var: &'a str,
    /// 마지막 일치 변수 이름
    pub matched_var_name: &'a str,
    /// 현재 규칙 ID
    pub rule_id: u64,
}

/// 문자열에 매크로가 포함되어 있는지 확인합니다.
pub fn has_macro(input: &str) -> bool {
    input.contains("%{")
}

/// 매크로를 확장합니다.
pub fn expand(input: &str, scope: &MacroScope<'_>) -> String {
    if !has_macro(input) {
        return input.to_owned();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("%{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = &after[..end];
        match resolve(key, scope) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str("%{");
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn resolve(key: &str, scope: &MacroScope<'_>) -> Option<String> {
    let upper = key.to_ascii_uppercase();
    match upper.as_str() {
        "MATCHED_VAR" => return Some(scope.matched_var.to_owned()),
        "MATCHED_VAR_NAME" => return Some(scope.matched_var_name.to_owned()),
        "RULE.ID" => return Some(scope.rule_id.to_string()),
        _ => {}
    }

    let (collection, name) = key.split_once(['.', ':'])?;
    if collection.eq_ignore_ascii_case("tx") {
        // 정의되지 않은 tx 변수는 빈 문자열
        Some(
            scope
                .tx_vars
                .get(&name.to_ascii_lowercase())
                .cloned()
                .unwrap_or_default(),
        )
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(vars: &HashMap<String, String>) -> MacroScope<'_> {
        MacroScope {
            tx_vars: vars,
            matched_var: "1' OR '1'='1",
            matched_var_name: "ARGS:param1",
            rule_id: 942100,
        }
    }

    #[test]
    fn expands_known_macros() {
        let mut vars = HashMap::new();
        vars.insert("critical_anomaly_score".to_owned(), "5".to_owned());
        let s = scope(&vars);

        assert_eq!(
            expand("Matched %{MATCHED_VAR} in %{MATCHED_VAR_NAME}", &s),
            "Matched 1' OR '1'='1 in ARGS:param1"
        );
        assert_eq!(expand("%{tx.critical_anomaly_score}", &s), "5");
        assert_eq!(expand("%{TX.CRITICAL_ANOMALY_SCORE}", &s), "5");
        assert_eq!(expand("rule %{rule.id}", &s), "rule 942100");
    }

    #[test]
    fn missing_tx_var_expands_to_empty() {
        let vars = HashMap::new();
        assert_eq!(expand("[%{tx.nope}]", &scope(&vars)), "[]");
    }

    #[test]
    fn unknown_macro_is_left_as_is() {
        let vars = HashMap::new();
        assert_eq!(expand("%{GEO.country}", &scope(&vars)), "%{GEO.country}");
        assert_eq!(expand("open %{tx.x", &scope(&vars)), "open %{tx.x");
    }
}
