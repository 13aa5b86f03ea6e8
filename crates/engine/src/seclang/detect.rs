//! `@detectSQLi` / `@detectXSS` 휴리스틱 탐지기
//!
//! 토큰화 기반 라이브러리 대신 대표적인 공격 구문을 `RegexSet`으로 묶어
//! 한 번의 스캔으로 판정합니다. 입력은 연산자 호출 전에 이미 변환된 값입니다.

use regex::RegexSet;

const SQLI_PATTERNS: &[&str] = &[
    r"(?i)\bunion\b[\s/*]+(all[\s/*]+)?select\b",
    r#"(?i)['"`]\s*\)*\s*(or|and|xor|\|\||&&)\s+['"`(]?\s*[\w'"]+\s*(=|<>|!=|<|>|like\b|is\b)"#,
    r#"(?i)['"`]\s*\)*\s*(or|and)\s+\d+\s*(=|<|>)"#,
    r#"(?i)['"`]\s*\)*\s*(or|and)\s+(true|false)\b"#,
    r"(?i);\s*(drop|delete|insert|update|alter|create|truncate|exec|shutdown)\b",
    r"(?i)\b(sleep|benchmark|pg_sleep|waitfor\s+delay)\s*\(",
    r#"(?i)['"`]\s*\)*\s*(--|#|/\*)"#,
    r"(?i)\bselect\b.{1,100}?\bfrom\b",
    r"(?i)\binformation_schema\b",
    r"(?i)\b(load_file|into\s+(out|dump)file)\b",
];

const XSS_PATTERNS: &[&str] = &[
    r"(?i)<\s*script\b",
    r"(?i)javascript\s*:",
    r"(?i)vbscript\s*:",
    r#"(?i)[\s"'/;]on[a-z]{3,20}\s*="#,
    r"(?i)<\s*(iframe|frame|object|embed|svg|img|body|meta|link|style|base)\b[^>]*\b(src|href|on[a-z]+|data)\s*=",
    r"(?i)document\s*\.\s*(cookie|location|write)",
    r"(?i)\b(alert|prompt|confirm|eval)\s*\(",
    r"(?i)expression\s*\(",
];

/// SQLi/XSS 탐지기
#[derive(Debug, Clone)]
pub struct Detectors {
    sqli: RegexSet,
    xss: RegexSet,
}

impl Detectors {
    /// 내장 패턴으로 탐지기를 생성합니다.
    ///
    /// # Errors
    /// 내장 패턴 컴파일에 실패하면 에러를 반환합니다.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            sqli: RegexSet::new(SQLI_PATTERNS)?,
            xss: RegexSet::new(XSS_PATTERNS)?,
        })
    }

    /// SQL 인젝션 여부
    pub fn is_sqli(&self, input: &str) -> bool {
        self.sqli.is_match(input)
    }

    /// XSS 여부
    pub fn is_xss(&self, input: &str) -> bool {
        self.xss.is_match(input)
    }
}
