//! SecLang 어휘 분석 -- 논리 줄 결합과 지시어 인자 분리
//!
//! - 줄 끝 `\`는 다음 줄과 이어집니다.
//! - `#`으로 시작하는 줄은 주석입니다.
//! - 인자는 공백으로 구분되며, 큰따옴표로 묶으면 공백을 포함할 수 있습니다.
//!   따옴표 안의 `\"`는 따옴표 문자로, 그 밖의 역슬래시는 그대로 유지됩니다.

/// 연속 줄이 결합된 하나의 지시어 줄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    /// 시작 줄 번호 (1부터)
    pub line: usize,
    /// 결합된 텍스트
    pub text: String,
}

/// 텍스트를 논리 줄로 나눕니다. 주석과 빈 줄은 제외됩니다.
pub fn logical_lines(text: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut start_line = 0;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim_end();

        if current.is_empty() {
            let lead = trimmed.trim_start();
            if lead.is_empty() || lead.starts_with('#') {
                continue;
            }
            start_line = line_no;
        }

        match trimmed.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim());
                current.push(' ');
            }
            None => {
                current.push_str(trimmed.trim_start());
                lines.push(LogicalLine {
                    line: start_line,
                    text: std::mem::take(&mut current).trim().to_owned(),
                });
            }
        }
    }

    // 파일 끝의 역슬래시
    if !current.trim().is_empty() {
        lines.push(LogicalLine {
            line: start_line,
            text: current.trim().to_owned(),
        });
    }

    lines
}

/// 지시어 줄을 인자 목록으로 나눕니다.
///
/// # Errors
/// 닫히지 않은 큰따옴표가 있으면 에러 메시지를 반환합니다.
pub fn split_args(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut arg = String::new();
        if first == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' if chars.peek() == Some(&'"') => {
                        arg.push('"');
                        chars.next();
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => arg.push(other),
                }
            }
            if !closed {
                return Err("unterminated double quote".to_owned());
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                arg.push(c);
                chars.next();
            }
        }
        args.push(arg);
    }

    Ok(args)
}

/// 쉼표로 구분된 목록을 작은따옴표를 존중하며 나눕니다. (액션 목록용)
///
/// 작은따옴표 안의 `\'`는 따옴표 문자로 취급합니다.
pub fn split_quoted_list(input: &str) -> Result<Vec<String>, String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quote && chars.peek() == Some(&'\'') => {
                current.push('\\');
                current.push('\'');
                chars.next();
            }
            '\'' => {
                in_quote = !in_quote;
                current.push(c);
            }
            ',' if !in_quote => {
                let item = current.trim();
                if !item.is_empty() {
                    items.push(item.to_owned());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    if in_quote {
        return Err("unterminated single quote in action list".to_owned());
    }
    let item = current.trim();
    if !item.is_empty() {
        items.push(item.to_owned());
    }
    Ok(items)
}

/// 값 양끝의 작은따옴표를 제거하고 `\'`를 복원합니다.
pub fn unquote(value: &str) -> String {
    let value = value.trim();
    let inner = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value);
    inner.replace("\\'", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_lines_join_continuations_and_skip_comments() {
        let text = "# comment\n\nSecRule ARGS \"@rx a\" \\\n    \"id:1,\\\n    phase:2\"\nSecRuleEngine On\n";
        let lines = logical_lines(text);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line, 3);
        assert_eq!(lines[0].text, "SecRule ARGS \"@rx a\" \"id:1, phase:2\"");
        assert_eq!(lines[1].line, 6);
        assert_eq!(lines[1].text, "SecRuleEngine On");
    }

    #[test]
    fn logical_lines_keep_trailing_continuation_at_eof() {
        let lines = logical_lines("SecMarker END \\");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "SecMarker END");
    }

    #[test]
    fn split_args_handles_quotes_and_escapes() {
        let args = split_args(r#"SecRule ARGS "@rx \"(a|b)\\d" "id:1,msg:'x y'""#).unwrap();
        assert_eq!(
            args,
            vec![
                "SecRule".to_owned(),
                "ARGS".to_owned(),
                r#"@rx "(a|b)\\d"#.to_owned(),
                "id:1,msg:'x y'".to_owned(),
            ]
        );
    }

    #[test]
    fn split_args_rejects_unterminated_quote() {
        assert!(split_args(r#"SecRule ARGS "@rx abc"#).is_err());
    }

    #[test]
    fn split_quoted_list_respects_single_quotes() {
        let items = split_quoted_list("id:1, msg:'a, b', t:none ,tag:'x'").unwrap();
        assert_eq!(items, vec!["id:1", "msg:'a, b'", "t:none", "tag:'x'"]);
    }

    #[test]
    fn unquote_strips_single_quotes() {
        assert_eq!(unquote("'paranoia-level/2'"), "paranoia-level/2");
        assert_eq!(unquote("plain"), "plain");
        assert_eq!(unquote(r"'it\'s'"), "it's");
    }
}
