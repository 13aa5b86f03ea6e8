//! SecLang 연산자
//!
//! 연산자 문자열(`@rx ^abc`, `!@pm foo bar`, 접두 없는 정규식)을 파싱하고
//! 변환된 변수 값에 대해 일치 여부를 판정합니다.
//! 인자에 `%{...}` 매크로가 있으면 평가 시점에 확장합니다.

use std::collections::HashMap;

use aho_corasick::AhoCorasick;
use regex::Regex;

use super::detect::Detectors;
use super::macros::{self, MacroScope};

/// 연산자 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Rx,
    Pm,
    PmFromFile,
    Contains,
    ContainsWord,
    Streq,
    BeginsWith,
    EndsWith,
    Within,
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    DetectSqli,
    DetectXss,
    ValidateByteRange,
    ValidateUrlEncoding,
    ValidateUtf8Encoding,
    UnconditionalMatch,
    NoMatch,
}

impl OperatorKind {
    fn from_name(name: &str) -> Option<Self> {
        let kind = match name.to_ascii_lowercase().as_str() {
            "rx" => Self::Rx,
            "pm" => Self::Pm,
            "pmfromfile" | "pmf" => Self::PmFromFile,
            "contains" => Self::Contains,
            "containsword" => Self::ContainsWord,
            "streq" => Self::Streq,
            "beginswith" => Self::BeginsWith,
            "endswith" => Self::EndsWith,
            "within" => Self::Within,
            "eq" => Self::Eq,
            "ge" => Self::Ge,
            "gt" => Self::Gt,
            "le" => Self::Le,
            "lt" => Self::Lt,
            "detectsqli" => Self::DetectSqli,
            "detectxss" => Self::DetectXss,
            "validatebyterange" => Self::ValidateByteRange,
            "validateurlencoding" => Self::ValidateUrlEncoding,
            "validateutf8encoding" => Self::ValidateUtf8Encoding,
            "unconditionalmatch" => Self::UnconditionalMatch,
            "nomatch" => Self::NoMatch,
            _ => return None,
        };
        Some(kind)
    }

    fn requires_argument(self) -> bool {
        !matches!(
            self,
            Self::DetectSqli
                | Self::DetectXss
                | Self::ValidateUrlEncoding
                | Self::ValidateUtf8Encoding
                | Self::UnconditionalMatch
                | Self::NoMatch
                | Self::Within
                | Self::Streq
        )
    }
}

/// 파싱된 연산자
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSpec {
    pub kind: OperatorKind,
    pub negated: bool,
    pub argument: String,
}

/// 연산자 문자열을 파싱합니다.
///
/// # Errors
/// 알 수 없는 연산자, 누락된 인자, 잘못된 정규식/숫자/범위이면 설명 문자열을 반환합니다.
pub fn parse_operator(raw: &str) -> Result<OperatorSpec, String> {
    let raw = raw.trim();
    let (negated, rest) = match raw.strip_prefix('!') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, raw),
    };

    let (kind, argument) = match rest.strip_prefix('@') {
        Some(body) => {
            let (name, arg) = match body.split_once(char::is_whitespace) {
                Some((name, arg)) => (name, arg.trim_start()),
                None => (body, ""),
            };
            let kind = OperatorKind::from_name(name)
                .ok_or_else(|| format!("unknown operator '@{name}'"))?;
            (kind, arg.to_owned())
        }
        None => (OperatorKind::Rx, rest.to_owned()),
    };

    if kind.requires_argument() && argument.trim().is_empty() {
        return Err(format!("operator {kind:?} requires an argument"));
    }

    if !macros::has_macro(&argument) {
        validate_argument(kind, &argument)?;
    }

    Ok(OperatorSpec {
        kind,
        negated,
        argument,
    })
}

fn validate_argument(kind: OperatorKind, argument: &str) -> Result<(), String> {
    match kind {
        OperatorKind::Rx => {
            Regex::new(argument).map_err(|e| format!("invalid regex '{argument}': {e}"))?;
        }
        OperatorKind::Eq
        | OperatorKind::Ge
        | OperatorKind::Gt
        | OperatorKind::Le
        | OperatorKind::Lt => {
            argument
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("invalid numeric argument '{argument}'"))?;
        }
        OperatorKind::ValidateByteRange => {
            parse_byte_ranges(argument)?;
        }
        _ => {}
    }
    Ok(())
}

fn parse_byte_ranges(argument: &str) -> Result<Vec<(u8, u8)>, String> {
    argument
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let parse = |s: &str| {
                s.trim()
                    .parse::<u8>()
                    .map_err(|_| format!("invalid byte range '{part}'"))
            };
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let (lo, hi) = (parse(lo)?, parse(hi)?);
                    if lo > hi {
                        return Err(format!("invalid byte range '{part}'"));
                    }
                    Ok((lo, hi))
                }
                None => {
                    let b = parse(part)?;
                    Ok((b, b))
                }
            }
        })
        .collect()
}

/// 연산자 판정 결과
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OpResult {
    pub matched: bool,
    /// rx 캡처 그룹 0-9
    pub captures: Vec<String>,
}

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    Phrases(AhoCorasick),
    ByteRanges(Vec<(u8, u8)>),
    /// 인자를 문자열 그대로 사용
    Literal,
    /// 평가 시점에 매크로 확장 후 판정
    Dynamic,
}

/// 컴파일된 연산자
#[derive(Debug, Clone)]
pub struct CompiledOperator {
    spec: OperatorSpec,
    matcher: Matcher,
}

impl CompiledOperator {
    /// 연산자를 컴파일합니다.
    ///
    /// `data_files`는 `@pmFromFile`이 참조하는 데이터 파일 (파일 이름 → 내용)입니다.
    ///
    /// # Errors
    /// 정규식/구문 사전 구성에 실패하거나 데이터 파일이 없으면 설명 문자열을 반환합니다.
    pub fn compile(
        spec: &OperatorSpec,
        data_files: &HashMap<String, String>,
    ) -> Result<Self, String> {
        let matcher = if macros::has_macro(&spec.argument) {
            Matcher::Dynamic
        } else {
            match spec.kind {
                OperatorKind::Rx => Matcher::Regex(
                    Regex::new(&spec.argument)
                        .map_err(|e| format!("invalid regex '{}': {e}", spec.argument))?,
                ),
                OperatorKind::Pm => Matcher::Phrases(build_phrases(
                    spec.argument.split_whitespace(),
                )?),
                OperatorKind::PmFromFile => {
                    let mut phrases = Vec::new();
                    for file in spec.argument.split_whitespace() {
                        let name = file.rsplit('/').next().unwrap_or(file);
                        let content = data_files
                            .get(name)
                            .ok_or_else(|| format!("data file '{file}' not found in bundle"))?;
                        phrases.extend(
                            content
                                .lines()
                                .map(str::trim)
                                .filter(|l| !l.is_empty() && !l.starts_with('#')),
                        );
                    }
                    Matcher::Phrases(build_phrases(phrases.into_iter())?)
                }
                OperatorKind::ValidateByteRange => {
                    Matcher::ByteRanges(parse_byte_ranges(&spec.argument)?)
                }
                _ => Matcher::Literal,
            }
        };
        Ok(Self {
            spec: spec.clone(),
            matcher,
        })
    }

    /// 연산자 종류
    pub fn kind(&self) -> OperatorKind {
        self.spec.kind
    }

    /// 입력 값을 판정합니다. 부정(`!`)이 적용된 결과를 반환합니다.
    pub fn evaluate(
        &self,
        input: &str,
        detectors: &Detectors,
        scope: &MacroScope<'_>,
    ) -> OpResult {
        let mut result = match &self.matcher {
            Matcher::Dynamic => {
                let argument = macros::expand(&self.spec.argument, scope);
                evaluate_dynamic(self.spec.kind, &argument, input, detectors)
            }
            Matcher::Regex(re) => regex_match(re, input),
            Matcher::Phrases(ac) => OpResult {
                matched: ac.is_match(input),
                captures: Vec::new(),
            },
            Matcher::ByteRanges(ranges) => OpResult {
                matched: input
                    .bytes()
                    .any(|b| !ranges.iter().any(|&(lo, hi)| (lo..=hi).contains(&b))),
                captures: Vec::new(),
            },
            Matcher::Literal => OpResult {
                matched: literal_match(self.spec.kind, &self.spec.argument, input, detectors),
                captures: Vec::new(),
            },
        };

        if self.spec.negated {
            result.matched = !result.matched;
            result.captures.clear();
        }
        result
    }
}

fn build_phrases<'a>(phrases: impl Iterator<Item = &'a str>) -> Result<AhoCorasick, String> {
    let phrases: Vec<&str> = phrases.collect();
    if phrases.is_empty() {
        return Err("phrase list is empty".to_owned());
    }
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(phrases)
        .map_err(|e| format!("failed to build phrase matcher: {e}"))
}

fn regex_match(re: &Regex, input: &str) -> OpResult {
    match re.captures(input) {
        Some(caps) => OpResult {
            matched: true,
            captures: caps
                .iter()
                .take(10)
                .map(|m| m.map(|m| m.as_str().to_owned()).unwrap_or_default())
                .collect(),
        },
        None => OpResult::default(),
    }
}

fn evaluate_dynamic(
    kind: OperatorKind,
    argument: &str,
    input: &str,
    detectors: &Detectors,
) -> OpResult {
    match kind {
        // 확장된 정규식이 잘못되면 일치하지 않음으로 처리
        OperatorKind::Rx => Regex::new(argument)
            .map(|re| regex_match(&re, input))
            .unwrap_or_default(),
        OperatorKind::Pm => OpResult {
            matched: build_phrases(argument.split_whitespace())
                .map(|ac| ac.is_match(input))
                .unwrap_or(false),
            captures: Vec::new(),
        },
        _ => OpResult {
            matched: literal_match(kind, argument, input, detectors),
            captures: Vec::new(),
        },
    }
}

fn literal_match(kind: OperatorKind, argument: &str, input: &str, detectors: &Detectors) -> bool {
    match kind {
        OperatorKind::Contains => input.contains(argument),
        OperatorKind::ContainsWord => contains_word(input, argument),
        OperatorKind::Streq => input == argument,
        OperatorKind::BeginsWith => input.starts_with(argument),
        OperatorKind::EndsWith => input.ends_with(argument),
        OperatorKind::Within => argument.contains(input),
        OperatorKind::Eq => to_number(input) == to_number(argument),
        OperatorKind::Ge => to_number(input) >= to_number(argument),
        OperatorKind::Gt => to_number(input) > to_number(argument),
        OperatorKind::Le => to_number(input) <= to_number(argument),
        OperatorKind::Lt => to_number(input) < to_number(argument),
        OperatorKind::DetectSqli => detectors.is_sqli(input),
        OperatorKind::DetectXss => detectors.is_xss(input),
        OperatorKind::ValidateUrlEncoding => !valid_url_encoding(input),
        OperatorKind::ValidateUtf8Encoding => input.contains('\u{FFFD}'),
        OperatorKind::UnconditionalMatch => true,
        OperatorKind::NoMatch => false,
        OperatorKind::ValidateByteRange => parse_byte_ranges(argument)
            .map(|ranges| {
                input
                    .bytes()
                    .any(|b| !ranges.iter().any(|&(lo, hi)| (lo..=hi).contains(&b)))
            })
            .unwrap_or(false),
        // 컴파일 단계에서 처리됨
        OperatorKind::Rx | OperatorKind::Pm | OperatorKind::PmFromFile => false,
    }
}

/// 숫자로 해석할 수 없는 값은 0
fn to_number(s: &str) -> i64 {
    s.trim().parse::<i64>().unwrap_or(0)
}

fn contains_word(input: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    input.match_indices(word).any(|(start, m)| {
        let before = input[..start].chars().next_back();
        let after = input[start + m.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

fn valid_url_encoding(input: &str) -> bool {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|pair| pair.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}
