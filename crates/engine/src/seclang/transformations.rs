//! 변환 함수 (`t:` 액션)
//!
//! 변수 값은 연산자에 전달되기 전 규칙에 지정된 순서대로 변환됩니다.
//! `t:none`은 그때까지 누적된 변환 목록을 비웁니다.

/// 변환 함수
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transformation {
    /// 누적된 변환 초기화
    None,
    Lowercase,
    Uppercase,
    /// `%XX`와 `+` 디코딩
    UrlDecode,
    /// `UrlDecode` + `%uXXXX` 디코딩
    UrlDecodeUni,
    /// HTML 엔티티 디코딩
    HtmlEntityDecode,
    /// 연속 공백을 하나의 공백으로
    CompressWhitespace,
    RemoveWhitespace,
    RemoveNulls,
    Trim,
    TrimLeft,
    TrimRight,
    /// 값의 바이트 길이
    Length,
    /// `/./`, `/../`, 연속 `/` 정리
    NormalizePath,
    /// `/* */`, `--`, `#` 주석 제거
    ReplaceComments,
    /// 주석 문자 (`/*`, `*/`, `--`, `#`) 제거
    RemoveCommentsChar,
    /// 쉘 명령 정규화 (역슬래시, 따옴표, 캐럿 제거 등)
    CmdLine,
    /// 변환하지 않음 (`utf8toUnicode` 등 입력이 이미 UTF-8인 경우)
    Identity,
}

impl Transformation {
    /// 변환 이름을 해석합니다. (대소문자 구분 없음)
    ///
    /// # Errors
    /// 알 수 없는 이름이면 설명 문자열을 반환합니다.
    pub fn parse(name: &str) -> Result<Self, String> {
        let t = match name.to_ascii_lowercase().as_str() {
            "none" => Self::None,
            "lowercase" => Self::Lowercase,
            "uppercase" => Self::Uppercase,
            "urldecode" => Self::UrlDecode,
            "urldecodeuni" => Self::UrlDecodeUni,
            "htmlentitydecode" => Self::HtmlEntityDecode,
            "compresswhitespace" => Self::CompressWhitespace,
            "removewhitespace" => Self::RemoveWhitespace,
            "removenulls" => Self::RemoveNulls,
            "trim" => Self::Trim,
            "trimleft" => Self::TrimLeft,
            "trimright" => Self::TrimRight,
            "length" => Self::Length,
            "normalizepath" | "normalisepath" => Self::NormalizePath,
            "replacecomments" => Self::ReplaceComments,
            "removecommentschar" => Self::RemoveCommentsChar,
            "cmdline" => Self::CmdLine,
            "utf8tounicode" => Self::Identity,
            _ => return Err(format!("unknown transformation '{name}'")),
        };
        Ok(t)
    }

    /// 값에 변환을 적용합니다.
    pub fn apply(self, input: &str) -> String {
        match self {
            Self::None | Self::Identity => input.to_owned(),
            Self::Lowercase => input.to_lowercase(),
            Self::Uppercase => input.to_uppercase(),
            Self::UrlDecode => url_decode(input, false),
            Self::UrlDecodeUni => url_decode(input, true),
            Self::HtmlEntityDecode => html_entity_decode(input),
            Self::CompressWhitespace => compress_whitespace(input),
            Self::RemoveWhitespace => input.chars().filter(|c| !c.is_whitespace()).collect(),
            Self::RemoveNulls => input.chars().filter(|&c| c != '\0').collect(),
            Self::Trim => input.trim().to_owned(),
            Self::TrimLeft => input.trim_start().to_owned(),
            Self::TrimRight => input.trim_end().to_owned(),
            Self::Length => input.len().to_string(),
            Self::NormalizePath => normalize_path(input),
            Self::ReplaceComments => replace_comments(input),
            Self::RemoveCommentsChar => input
                .replace("/*", "")
                .replace("*/", "")
                .replace("--", "")
                .replace('#', ""),
            Self::CmdLine => cmd_line(input),
        }
    }
}

/// 변환 목록을 순서대로 적용합니다.
pub fn apply_all(transforms: &[Transformation], input: &str) -> String {
    transforms
        .iter()
        .fold(input.to_owned(), |acc, t| t.apply(&acc))
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn url_decode(input: &str, unicode: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if unicode
                    && i + 5 < bytes.len()
                    && (bytes[i + 1] == b'u' || bytes[i + 1] == b'U')
                {
                    let code = bytes[i + 2..i + 6]
                        .iter()
                        .try_fold(0u32, |acc, &b| hex_val(b).map(|v| (acc << 4) | u32::from(v)));
                    if let Some(ch) = code.and_then(char::from_u32) {
                        let mut buf = [0u8; 4];
                        out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                        i += 6;
                        continue;
                    }
                }
                match (
                    bytes.get(i + 1).copied().and_then(hex_val),
                    bytes.get(i + 2).copied().and_then(hex_val),
                ) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn html_entity_decode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let candidate = &rest[pos + 1..];
        let end = candidate
            .char_indices()
            .take(10)
            .find(|&(_, c)| c == ';')
            .map(|(i, _)| i);

        let decoded = end.and_then(|end| decode_entity(&candidate[..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &candidate[end + 1..];
            }
            None => {
                out.push('&');
                rest = candidate;
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    if let Some(num) = entity.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        return char::from_u32(code);
    }
    match entity.to_ascii_lowercase().as_str() {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => None,
    }
}

fn compress_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_space = false;
    for c in input.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

fn normalize_path(input: &str) -> String {
    let absolute = input.starts_with('/');
    let trailing = input.ends_with('/') && input.len() > 1;
    let mut segments: Vec<&str> = Vec::new();

    for segment in input.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(input.len());
    if absolute {
        out.push('/');
    }
    out.push_str(&segments.join("/"));
    if trailing && !out.ends_with('/') {
        out.push('/');
    }
    out
}

fn replace_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        out.push(' ');
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn cmd_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_space = false;

    for c in input.chars() {
        match c {
            '\\' | '"' | '\'' | '^' => {}
            ',' | ';' => {
                if !in_space {
                    out.push(' ');
                    in_space = true;
                }
            }
            c if c.is_whitespace() => {
                if !in_space {
                    out.push(' ');
                    in_space = true;
                }
            }
            '/' | '(' => {
                // 연산자 앞 공백 제거
                if in_space {
                    out.pop();
                }
                out.push(c);
                in_space = false;
            }
            c => {
                out.extend(c.to_lowercase());
                in_space = false;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Transformation::parse("urlDecodeUni").unwrap(), Transformation::UrlDecodeUni);
        assert_eq!(Transformation::parse("NORMALISEPATH").unwrap(), Transformation::NormalizePath);
        assert!(Transformation::parse("base64DecodeExt2").is_err());
    }

    #[test]
    fn url_decode_handles_plus_percent_and_invalid_sequences() {
        assert_eq!(Transformation::UrlDecode.apply("a+b%20c%27"), "a b c'");
        assert_eq!(Transformation::UrlDecode.apply("100%"), "100%");
        assert_eq!(Transformation::UrlDecode.apply("%zz"), "%zz");
        assert_eq!(Transformation::UrlDecodeUni.apply("%u003cscript"), "<script");
    }

    #[test]
    fn html_entities_are_decoded() {
        assert_eq!(
            Transformation::HtmlEntityDecode.apply("&lt;script&gt;&#x61;&#98;&amp;&unknown;"),
            "<script>ab&&unknown;"
        );
    }

    #[test]
    fn whitespace_helpers() {
        assert_eq!(Transformation::CompressWhitespace.apply("a \t\n b"), "a b");
        assert_eq!(Transformation::RemoveWhitespace.apply(" a b "), "ab");
        assert_eq!(Transformation::Trim.apply("  x "), "x");
        assert_eq!(Transformation::Length.apply("abcd"), "4");
    }

    #[test]
    fn normalize_path_resolves_dot_segments() {
        assert_eq!(Transformation::NormalizePath.apply("/a/./b/../c//d"), "/a/c/d");
        assert_eq!(Transformation::NormalizePath.apply("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(Transformation::NormalizePath.apply("/a/b/"), "/a/b/");
    }

    #[test]
    fn replace_comments_strips_c_comments() {
        assert_eq!(Transformation::ReplaceComments.apply("UNION/**/SELECT"), "UNION SELECT");
        assert_eq!(Transformation::ReplaceComments.apply("a /* open"), "a  ");
    }

    #[test]
    fn cmd_line_normalizes_shell_evasion() {
        assert_eq!(Transformation::CmdLine.apply("C^at  \"/etc/passwd\""), "cat/etc/passwd");
        assert_eq!(Transformation::CmdLine.apply("w'h'o;ami"), "who ami");
    }

    #[test]
    fn apply_all_runs_in_order() {
        let out = apply_all(
            &[Transformation::UrlDecode, Transformation::Lowercase],
            "%3CSCRIPT%3E",
        );
        assert_eq!(out, "<script>");
    }
}
