//! SecLang 변수(대상) 파싱과 평가
//!
//! `ARGS|REQUEST_HEADERS:User-Agent|!ARGS:password|&ARGS` 같은 대상 목록을
//! 해석하고, 정규화 트랜잭션에서 값을 꺼냅니다.
//!
//! 값의 이름은 `ARGS:param1`, `REQUEST_HEADERS:host`처럼 `컬렉션:키` 형식이며
//! `MATCHED_VAR_NAME`과 탐지 결과의 `matched_field`에 그대로 쓰입니다.

use std::collections::HashMap;

use regex::Regex;

use ocinspect_core::transaction::{Header, NormalizedTransaction};
use ocinspect_core::types::Phase;

use super::lexer::unquote;

/// 항상 빈 값으로 평가되는 알려진 변수
///
/// 파일 업로드, XML, 영속 컬렉션처럼 이 엔진이 채우지 않는 변수입니다.
const UNPOPULATED: &[&str] = &[
    "FILES",
    "FILES_NAMES",
    "FILES_SIZES",
    "FILES_TMPNAMES",
    "FILES_TMP_CONTENT",
    "FILES_COMBINED_SIZE",
    "XML",
    "MULTIPART_STRICT_ERROR",
    "MULTIPART_UNMATCHED_BOUNDARY",
    "MULTIPART_PART_HEADERS",
    "MULTIPART_FILENAME",
    "MULTIPART_NAME",
    "REQBODY_ERROR",
    "REQBODY_ERROR_MSG",
    "GEO",
    "IP",
    "SESSION",
    "USER",
    "GLOBAL",
    "RESOURCE",
    "ENV",
    "DURATION",
    "TIME",
    "TIME_EPOCH",
    "UNIQUE_ID",
    "AUTH_TYPE",
    "FULL_REQUEST",
    "FULL_REQUEST_LENGTH",
    "INBOUND_DATA_ERROR",
    "OUTBOUND_DATA_ERROR",
    "STATUS_LINE",
    "HIGHEST_SEVERITY",
    "WEBSERVER_ERROR_LOG",
];

/// 변수 컬렉션
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Args,
    ArgsNames,
    ArgsGet,
    ArgsGetNames,
    ArgsPost,
    ArgsPostNames,
    ArgsCombinedSize,
    QueryString,
    RequestUri,
    RequestUriRaw,
    RequestFilename,
    RequestBasename,
    RequestMethod,
    RequestProtocol,
    RequestLine,
    RequestHeaders,
    RequestHeadersNames,
    RequestCookies,
    RequestCookiesNames,
    RequestBody,
    RequestBodyLength,
    ReqbodyProcessor,
    ResponseStatus,
    ResponseProtocol,
    ResponseHeaders,
    ResponseHeadersNames,
    ResponseContentType,
    ResponseBody,
    RemoteAddr,
    RemotePort,
    ServerAddr,
    ServerPort,
    Tx,
    MatchedVar,
    MatchedVarName,
    MatchedVars,
    MatchedVarsNames,
    /// 알려졌지만 채우지 않는 변수
    Unpopulated(&'static str),
}

impl Collection {
    /// 변수 이름을 해석합니다. (대소문자 구분 없음)
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        let c = match upper.as_str() {
            "ARGS" => Self::Args,
            "ARGS_NAMES" => Self::ArgsNames,
            "ARGS_GET" => Self::ArgsGet,
            "ARGS_GET_NAMES" => Self::ArgsGetNames,
            "ARGS_POST" => Self::ArgsPost,
            "ARGS_POST_NAMES" => Self::ArgsPostNames,
            "ARGS_COMBINED_SIZE" => Self::ArgsCombinedSize,
            "QUERY_STRING" => Self::QueryString,
            "REQUEST_URI" => Self::RequestUri,
            "REQUEST_URI_RAW" => Self::RequestUriRaw,
            "REQUEST_FILENAME" => Self::RequestFilename,
            "REQUEST_BASENAME" => Self::RequestBasename,
            "REQUEST_METHOD" => Self::RequestMethod,
            "REQUEST_PROTOCOL" => Self::RequestProtocol,
            "REQUEST_LINE" => Self::RequestLine,
            "REQUEST_HEADERS" => Self::RequestHeaders,
            "REQUEST_HEADERS_NAMES" => Self::RequestHeadersNames,
            "REQUEST_COOKIES" => Self::RequestCookies,
            "REQUEST_COOKIES_NAMES" => Self::RequestCookiesNames,
            "REQUEST_BODY" => Self::RequestBody,
            "REQUEST_BODY_LENGTH" => Self::RequestBodyLength,
            "REQBODY_PROCESSOR" => Self::ReqbodyProcessor,
            "RESPONSE_STATUS" => Self::ResponseStatus,
            "RESPONSE_PROTOCOL" => Self::ResponseProtocol,
            "RESPONSE_HEADERS" => Self::ResponseHeaders,
            "RESPONSE_HEADERS_NAMES" => Self::ResponseHeadersNames,
            "RESPONSE_CONTENT_TYPE" => Self::ResponseContentType,
            "RESPONSE_BODY" => Self::ResponseBody,
            "REMOTE_ADDR" => Self::RemoteAddr,
            "REMOTE_PORT" => Self::RemotePort,
            "SERVER_ADDR" => Self::ServerAddr,
            "SERVER_PORT" => Self::ServerPort,
            "TX" => Self::Tx,
            "MATCHED_VAR" => Self::MatchedVar,
            "MATCHED_VAR_NAME" => Self::MatchedVarName,
            "MATCHED_VARS" => Self::MatchedVars,
            "MATCHED_VARS_NAMES" => Self::MatchedVarsNames,
            other => {
                return UNPOPULATED
                    .iter()
                    .find(|&&known| known == other)
                    .map(|&known| Self::Unpopulated(known));
            }
        };
        Some(c)
    }

    /// SecLang 표기 이름
    pub fn name(self) -> &'static str {
        match self {
            Self::Args => "ARGS",
            Self::ArgsNames => "ARGS_NAMES",
            Self::ArgsGet => "ARGS_GET",
            Self::ArgsGetNames => "ARGS_GET_NAMES",
            Self::ArgsPost => "ARGS_POST",
            Self::ArgsPostNames => "ARGS_POST_NAMES",
            Self::ArgsCombinedSize => "ARGS_COMBINED_SIZE",
            Self::QueryString => "QUERY_STRING",
            Self::RequestUri => "REQUEST_URI",
            Self::RequestUriRaw => "REQUEST_URI_RAW",
            Self::RequestFilename => "REQUEST_FILENAME",
            Self::RequestBasename => "REQUEST_BASENAME",
            Self::RequestMethod => "REQUEST_METHOD",
            Self::RequestProtocol => "REQUEST_PROTOCOL",
            Self::RequestLine => "REQUEST_LINE",
            Self::RequestHeaders => "REQUEST_HEADERS",
            Self::RequestHeadersNames => "REQUEST_HEADERS_NAMES",
            Self::RequestCookies => "REQUEST_COOKIES",
            Self::RequestCookiesNames => "REQUEST_COOKIES_NAMES",
            Self::RequestBody => "REQUEST_BODY",
            Self::RequestBodyLength => "REQUEST_BODY_LENGTH",
            Self::ReqbodyProcessor => "REQBODY_PROCESSOR",
            Self::ResponseStatus => "RESPONSE_STATUS",
            Self::ResponseProtocol => "RESPONSE_PROTOCOL",
            Self::ResponseHeaders => "RESPONSE_HEADERS",
            Self::ResponseHeadersNames => "RESPONSE_HEADERS_NAMES",
            Self::ResponseContentType => "RESPONSE_CONTENT_TYPE",
            Self::ResponseBody => "RESPONSE_BODY",
            Self::RemoteAddr => "REMOTE_ADDR",
            Self::RemotePort => "REMOTE_PORT",
            Self::ServerAddr => "SERVER_ADDR",
            Self::ServerPort => "SERVER_PORT",
            Self::Tx => "TX",
            Self::MatchedVar => "MATCHED_VAR",
            Self::MatchedVarName => "MATCHED_VAR_NAME",
            Self::MatchedVars => "MATCHED_VARS",
            Self::MatchedVarsNames => "MATCHED_VARS_NAMES",
            Self::Unpopulated(name) => name,
        }
    }

    /// `컬렉션:키` 선택자를 받는지 여부
    pub fn is_keyed(self) -> bool {
        matches!(
            self,
            Self::Args
                | Self::ArgsNames
                | Self::ArgsGet
                | Self::ArgsGetNames
                | Self::ArgsPost
                | Self::ArgsPostNames
                | Self::RequestHeaders
                | Self::RequestHeadersNames
                | Self::RequestCookies
                | Self::RequestCookiesNames
                | Self::ResponseHeaders
                | Self::ResponseHeadersNames
                | Self::Tx
                | Self::MatchedVars
                | Self::MatchedVarsNames
                | Self::Unpopulated(_)
        )
    }

    /// 값이 처음으로 채워지는 단계
    pub fn min_phase(self) -> Phase {
        match self {
            Self::ArgsPost
            | Self::ArgsPostNames
            | Self::RequestBody
            | Self::RequestBodyLength
            | Self::ReqbodyProcessor => Phase::RequestBody,
            Self::ResponseStatus
            | Self::ResponseProtocol
            | Self::ResponseHeaders
            | Self::ResponseHeadersNames
            | Self::ResponseContentType => Phase::ResponseHeaders,
            Self::ResponseBody => Phase::ResponseBody,
            _ => Phase::RequestHeaders,
        }
    }
}

/// 키 선택자
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// 정확한 이름 (소문자)
    Name(String),
    /// `/pattern/` 정규식 (대소문자 무시)
    Regex(String),
}

/// 파싱된 단일 대상
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSpec {
    pub collection: Collection,
    pub selector: Option<Selector>,
    /// `!` 접두: 결과에서 제외
    pub exclude: bool,
    /// `&` 접두: 값 대신 개수
    pub count: bool,
}

/// 대상 목록을 파싱합니다.
///
/// # Errors
/// 알 수 없는 변수, 잘못된 선택자, 잘못된 정규식이면 설명 문자열을 반환합니다.
pub fn parse_targets(input: &str) -> Result<Vec<VariableSpec>, String> {
    let parts = split_targets(input);
    if parts.is_empty() {
        return Err("empty variable list".to_owned());
    }
    parts.iter().map(|p| parse_target(p)).collect()
}

fn split_targets(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_regex = false;
    let mut prev = None;

    for c in input.chars() {
        match c {
            '/' if in_regex && prev != Some('\\') => {
                in_regex = false;
                current.push(c);
            }
            '/' if !in_regex && prev == Some(':') => {
                in_regex = true;
                current.push(c);
            }
            '|' if !in_regex => {
                let part = current.trim();
                if !part.is_empty() {
                    parts.push(part.to_owned());
                }
                current.clear();
            }
            _ => current.push(c),
        }
        prev = Some(c);
    }

    let part = current.trim();
    if !part.is_empty() {
        parts.push(part.to_owned());
    }
    parts
}

fn parse_target(raw: &str) -> Result<VariableSpec, String> {
    let (exclude, rest) = match raw.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (count, rest) = match rest.strip_prefix('&') {
        Some(rest) => (true, rest),
        None => (false, rest),
    };

    let (name, selector) = match rest.split_once(':') {
        Some((name, sel)) => (name, Some(sel)),
        None => (rest, None),
    };

    let collection =
        Collection::from_name(name.trim()).ok_or_else(|| format!("unknown variable '{name}'"))?;

    let selector = match selector.map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(_) if !collection.is_keyed() => {
            return Err(format!(
                "variable '{}' does not accept a selector",
                collection.name()
            ));
        }
        Some(sel) => Some(parse_selector(sel)?),
    };

    if exclude && selector.is_none() {
        return Err(format!(
            "exclusion of '{}' requires a selector",
            collection.name()
        ));
    }

    Ok(VariableSpec {
        collection,
        selector,
        exclude,
        count,
    })
}

fn parse_selector(sel: &str) -> Result<Selector, String> {
    if sel.len() >= 2 && sel.starts_with('/') && sel.ends_with('/') {
        let pattern = &sel[1..sel.len() - 1];
        compile_selector(pattern).map_err(|e| format!("invalid selector regex '{pattern}': {e}"))?;
        Ok(Selector::Regex(pattern.to_owned()))
    } else {
        Ok(Selector::Name(unquote(sel).to_ascii_lowercase()))
    }
}

fn compile_selector(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("(?i){pattern}"))
}

/// 평가 중 꺼낸 변수 값
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarValue {
    pub collection: Collection,
    /// 컬렉션 내 키 (없으면 빈 문자열)
    pub key: String,
    /// 표시 이름 (`ARGS:param1`)
    pub name: String,
    pub value: String,
}

impl VarValue {
    fn keyed(collection: Collection, key: &str, value: impl Into<String>) -> Self {
        Self {
            collection,
            key: key.to_owned(),
            name: format!("{}:{}", collection.name(), key),
            value: value.into(),
        }
    }

    fn scalar(collection: Collection, value: impl Into<String>) -> Self {
        Self {
            collection,
            key: String::new(),
            name: collection.name().to_owned(),
            value: value.into(),
        }
    }
}

/// 값을 꺼낼 때 필요한 평가 상태
pub struct EvalView<'a> {
    pub tx: &'a NormalizedTransaction,
    pub tx_vars: &'a HashMap<String, String>,
    pub phase: Phase,
    /// 현재 규칙(체인)에서 지금까지 일치한 값
    pub matched: &'a [VarValue],
}

#[derive(Debug, Clone)]
struct CompiledTarget {
    spec: VariableSpec,
    regex: Option<Regex>,
}

impl CompiledTarget {
    fn key_matches(&self, key: &str) -> bool {
        match (&self.spec.selector, &self.regex) {
            (None, _) => true,
            (Some(_), Some(re)) => re.is_match(key),
            (Some(Selector::Name(name)), None) => key.eq_ignore_ascii_case(name),
            (Some(Selector::Regex(_)), None) => false,
        }
    }
}

/// 컴파일된 대상 목록
#[derive(Debug, Clone)]
pub struct CompiledTargets {
    include: Vec<CompiledTarget>,
    exclude: Vec<CompiledTarget>,
}

impl CompiledTargets {
    /// 대상 목록을 컴파일합니다.
    ///
    /// # Errors
    /// 선택자 정규식이 잘못되었으면 에러를 반환합니다.
    pub fn compile(specs: &[VariableSpec]) -> Result<Self, regex::Error> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for spec in specs {
            let regex = match &spec.selector {
                Some(Selector::Regex(pattern)) => Some(compile_selector(pattern)?),
                _ => None,
            };
            let target = CompiledTarget {
                spec: spec.clone(),
                regex,
            };
            if spec.exclude {
                exclude.push(target);
            } else {
                include.push(target);
            }
        }
        Ok(Self { include, exclude })
    }

    /// 대상 값들을 꺼냅니다. 제외 대상은 결과에서 빠집니다.
    pub fn collect(&self, view: &EvalView<'_>) -> Vec<VarValue> {
        let mut out = Vec::new();
        for target in &self.include {
            let values: Vec<VarValue> = collection_values(target.spec.collection, view)
                .into_iter()
                .filter(|v| target.key_matches(&v.key))
                .filter(|v| !self.is_excluded(v))
                .collect();

            if target.spec.count {
                out.push(VarValue::scalar(target.spec.collection, values.len().to_string()));
                if let Some(last) = out.last_mut() {
                    last.name = format!("&{}", last.name);
                }
            } else {
                out.extend(values);
            }
        }
        out
    }

    fn is_excluded(&self, value: &VarValue) -> bool {
        self.exclude
            .iter()
            .any(|t| t.spec.collection == value.collection && t.key_matches(&value.key))
    }
}

fn pairs(collection: Collection, items: &[(String, String)]) -> Vec<VarValue> {
    items
        .iter()
        .map(|(k, v)| VarValue::keyed(collection, k, v.as_str()))
        .collect()
}

fn names(collection: Collection, items: &[(String, String)]) -> Vec<VarValue> {
    items
        .iter()
        .map(|(k, _)| VarValue::keyed(collection, k, k.as_str()))
        .collect()
}

fn headers(collection: Collection, items: &[Header], names_only: bool) -> Vec<VarValue> {
    items
        .iter()
        .map(|h| {
            let value = if names_only { &h.name } else { &h.value };
            VarValue::keyed(collection, &h.name, value.as_str())
        })
        .collect()
}

fn args<'a>(view: &'a EvalView<'_>) -> impl Iterator<Item = &'a (String, String)> {
    let body: &[(String, String)] = if view.phase >= Phase::RequestBody {
        &view.tx.body_args
    } else {
        &[]
    };
    view.tx.query_args.iter().chain(body.iter())
}

fn body_processor(tx: &NormalizedTransaction) -> Option<&'static str> {
    let content_type = tx.request_header("content-type")?.to_ascii_lowercase();
    if content_type.starts_with("application/x-www-form-urlencoded") {
        Some("URLENCODED")
    } else if content_type.starts_with("multipart/") {
        Some("MULTIPART")
    } else if content_type.contains("json") {
        Some("JSON")
    } else if content_type.contains("xml") {
        Some("XML")
    } else {
        None
    }
}

fn collection_values(collection: Collection, view: &EvalView<'_>) -> Vec<VarValue> {
    if view.phase < collection.min_phase() {
        return Vec::new();
    }
    let tx = view.tx;

    match collection {
        Collection::Args => args(view)
            .map(|(k, v)| VarValue::keyed(collection, k, v.as_str()))
            .collect(),
        Collection::ArgsNames => args(view)
            .map(|(k, _)| VarValue::keyed(collection, k, k.as_str()))
            .collect(),
        Collection::ArgsGet => pairs(collection, &tx.query_args),
        Collection::ArgsGetNames => names(collection, &tx.query_args),
        Collection::ArgsPost => pairs(collection, &tx.body_args),
        Collection::ArgsPostNames => names(collection, &tx.body_args),
        Collection::ArgsCombinedSize => {
            let size: usize = args(view).map(|(k, v)| k.len() + v.len()).sum();
            vec![VarValue::scalar(collection, size.to_string())]
        }
        Collection::QueryString => vec![VarValue::scalar(collection, tx.query_string.as_str())],
        Collection::RequestUri | Collection::RequestUriRaw => {
            vec![VarValue::scalar(collection, tx.uri.as_str())]
        }
        Collection::RequestFilename => vec![VarValue::scalar(collection, tx.path.as_str())],
        Collection::RequestBasename => {
            let base = tx.path.rsplit('/').next().unwrap_or_default();
            vec![VarValue::scalar(collection, base)]
        }
        Collection::RequestMethod => vec![VarValue::scalar(collection, tx.method.as_str())],
        Collection::RequestProtocol | Collection::ResponseProtocol => {
            vec![VarValue::scalar(collection, tx.protocol.as_str())]
        }
        Collection::RequestLine => vec![VarValue::scalar(
            collection,
            format!("{} {} {}", tx.method, tx.uri, tx.protocol),
        )],
        Collection::RequestHeaders => headers(collection, &tx.request_headers, false),
        Collection::RequestHeadersNames => headers(collection, &tx.request_headers, true),
        Collection::RequestCookies => pairs(collection, &tx.request_cookies),
        Collection::RequestCookiesNames => names(collection, &tx.request_cookies),
        Collection::RequestBody => {
            if tx.request_body.is_empty() {
                Vec::new()
            } else {
                vec![VarValue::scalar(collection, tx.request_body.as_text())]
            }
        }
        Collection::RequestBodyLength => vec![VarValue::scalar(
            collection,
            tx.request_body.original_len.to_string(),
        )],
        Collection::ReqbodyProcessor => body_processor(tx)
            .map(|p| vec![VarValue::scalar(collection, p)])
            .unwrap_or_default(),
        Collection::ResponseStatus => tx
            .response_status
            .map(|s| vec![VarValue::scalar(collection, s.to_string())])
            .unwrap_or_default(),
        Collection::ResponseHeaders => headers(collection, &tx.response_headers, false),
        Collection::ResponseHeadersNames => headers(collection, &tx.response_headers, true),
        Collection::ResponseContentType => tx
            .response_header("content-type")
            .map(|ct| vec![VarValue::scalar(collection, ct)])
            .unwrap_or_default(),
        Collection::ResponseBody => {
            if tx.response_body.is_empty() {
                Vec::new()
            } else {
                vec![VarValue::scalar(collection, tx.response_body.as_text())]
            }
        }
        Collection::RemoteAddr => tx
            .client
            .address
            .as_deref()
            .map(|a| vec![VarValue::scalar(collection, a)])
            .unwrap_or_default(),
        Collection::RemotePort => tx
            .client
            .port
            .map(|p| vec![VarValue::scalar(collection, p.to_string())])
            .unwrap_or_default(),
        Collection::ServerAddr => tx
            .server
            .address
            .as_deref()
            .map(|a| vec![VarValue::scalar(collection, a)])
            .unwrap_or_default(),
        Collection::ServerPort => tx
            .server
            .port
            .map(|p| vec![VarValue::scalar(collection, p.to_string())])
            .unwrap_or_default(),
        Collection::Tx => {
            let mut vars: Vec<VarValue> = view
                .tx_vars
                .iter()
                .map(|(k, v)| VarValue::keyed(collection, k, v.as_str()))
                .collect();
            // HashMap 순서에 의존하지 않도록 정렬
            vars.sort_by(|a, b| a.key.cmp(&b.key));
            vars
        }
        Collection::MatchedVar => view
            .matched
            .last()
            .map(|m| vec![VarValue::scalar(collection, m.value.as_str())])
            .unwrap_or_default(),
        Collection::MatchedVarName => view
            .matched
            .last()
            .map(|m| vec![VarValue::scalar(collection, m.name.as_str())])
            .unwrap_or_default(),
        Collection::MatchedVars => view
            .matched
            .iter()
            .map(|m| VarValue::keyed(collection, &m.name, m.value.as_str()))
            .collect(),
        Collection::MatchedVarsNames => view
            .matched
            .iter()
            .map(|m| VarValue::keyed(collection, &m.name, m.name.as_str()))
            .collect(),
        Collection::Unpopulated(_) => Vec::new(),
    }
}
