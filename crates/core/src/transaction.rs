//! 트랜잭션 모델 -- 캡처된 HTTP 교환과 엔진용 정규화 모델
//!
//! [`RawTransaction`]은 수집기 파이프라인이 캡처한 그대로의 요청/응답이고,
//! [`NormalizedTransaction`]은 정규화기를 거쳐 엔진이 기대하는 형태로 바뀐 모델입니다.
//!
//! # 수명
//! ```text
//! 캡처 → RawTransaction → (정규화) → NormalizedTransaction → 평가 → 폐기
//! ```
//! 한 트랜잭션은 검사 스테이지에서 정확히 한 번 소비됩니다.

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::Phase;

/// HTTP 헤더 한 줄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// 헤더 이름
    pub name: String,
    /// 헤더 값
    pub value: String,
}

impl Header {
    /// 새 헤더를 생성합니다.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// 스트리밍으로 캡처된 본문 조각
///
/// JSON 입력에서는 문자열(텍스트) 또는 바이트 배열(원시 바이트)을 모두 받습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BodyChunk {
    /// 텍스트 조각
    Text(String),
    /// 원시 바이트 조각
    Raw(Vec<u8>),
}

impl BodyChunk {
    /// 조각의 바이트 표현
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Raw(b) => b,
        }
    }
}

/// 통신 종단점 (클라이언트/서버)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// 주소 (IP 또는 호스트명)
    #[serde(default)]
    pub address: Option<String>,
    /// 포트
    #[serde(default)]
    pub port: Option<u16>,
}

/// 캡처된 HTTP 트랜잭션
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    /// 원본 스팬과 연결하는 상관 ID
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// HTTP 메서드
    #[serde(default)]
    pub method: String,
    /// 요청 URI (경로 + 쿼리 또는 절대 URL)
    #[serde(default)]
    pub uri: String,
    /// 프로토콜 (`HTTP/1.1` 등)
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// 요청 헤더 (캡처 순서 유지)
    #[serde(default)]
    pub request_headers: Vec<Header>,
    /// 요청 본문 조각
    #[serde(default)]
    pub request_body: Vec<BodyChunk>,
    /// 선언된 요청 본문 길이 (`Content-Length` 등)
    #[serde(default)]
    pub request_body_length: Option<i64>,
    /// 응답 상태 코드
    #[serde(default)]
    pub response_status: Option<u16>,
    /// 응답 헤더
    #[serde(default)]
    pub response_headers: Vec<Header>,
    /// 응답 본문 조각
    #[serde(default)]
    pub response_body: Vec<BodyChunk>,
    /// 선언된 응답 본문 길이
    #[serde(default)]
    pub response_body_length: Option<i64>,
    /// 클라이언트 정보
    #[serde(default)]
    pub client: Endpoint,
    /// 서버 정보
    #[serde(default)]
    pub server: Endpoint,
    /// 시작 시각 (Unix epoch 나노초)
    #[serde(default)]
    pub start_time_unix_nano: u64,
    /// 종료 시각 (Unix epoch 나노초)
    #[serde(default)]
    pub end_time_unix_nano: u64,
}

fn default_protocol() -> String {
    "HTTP/1.1".to_owned()
}

impl RawTransaction {
    /// 최소 필드로 트랜잭션을 생성합니다.
    pub fn new(
        correlation_id: impl Into<String>,
        method: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            method: method.into(),
            uri: uri.into(),
            protocol: default_protocol(),
            request_headers: Vec::new(),
            request_body: Vec::new(),
            request_body_length: None,
            response_status: None,
            response_headers: Vec::new(),
            response_body: Vec::new(),
            response_body_length: None,
            client: Endpoint::default(),
            server: Endpoint::default(),
            start_time_unix_nano: 0,
            end_time_unix_nano: 0,
        }
    }

    /// 요청 헤더를 추가합니다.
    pub fn with_request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push(Header::new(name, value));
        self
    }

    /// 요청 본문 조각을 추가합니다.
    pub fn with_request_body(mut self, chunk: impl Into<String>) -> Self {
        self.request_body.push(BodyChunk::Text(chunk.into()));
        self
    }

    /// 응답 상태 코드를 설정합니다.
    pub fn with_response_status(mut self, status: u16) -> Self {
        self.response_status = Some(status);
        self
    }

    /// 응답 헤더를 추가합니다.
    pub fn with_response_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response_headers.push(Header::new(name, value));
        self
    }

    /// 응답 본문 조각을 추가합니다.
    pub fn with_response_body(mut self, chunk: impl Into<String>) -> Self {
        self.response_body.push(BodyChunk::Text(chunk.into()));
        self
    }

    /// 상관 ID (비어 있으면 `None`)
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// 스팬 속성에서 트랜잭션을 구성합니다.
    ///
    /// 수집기의 속성 이름 규칙을 따릅니다.
    /// - `http.method`, `http.url`, `http.status_code` / `http.response.status_code`
    /// - `http.request.header.<name>`, `http.response.header.<name>`
    /// - `http.request.body`, `http.response.body`
    /// - `http.request.body.<param>`: 폼 본문으로 재구성
    /// - `http.request.query.param.<name>`: URI 쿼리에 추가
    /// - `http.request.cookie.<name>`, `http.response.cookie.<name>`
    ///
    /// 알 수 없는 속성은 무시합니다. 속성 순서와 무관하게 결과가 같도록
    /// 키 순서로 처리합니다.
    pub fn from_span_attributes<I, K, V>(correlation_id: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut attributes: Vec<(String, String)> = attributes
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        attributes.sort_by(|a, b| a.0.cmp(&b.0));

        let mut tx = Self::new(correlation_id, "", "");
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        let mut has_form = false;
        let mut query_params = Vec::new();
        let mut request_cookies = Vec::new();
        let mut response_cookies = Vec::new();

        for (key, value) in attributes {
            match key.as_str() {
                attr::METHOD => tx.method = value,
                attr::URL => tx.uri = value,
                attr::STATUS_CODE | attr::RESPONSE_STATUS_CODE => {
                    tx.response_status = value.trim().parse().ok();
                }
                attr::REQUEST_BODY => tx.request_body.push(BodyChunk::Text(value)),
                attr::RESPONSE_BODY => tx.response_body.push(BodyChunk::Text(value)),
                _ => {
                    if let Some(name) = key.strip_prefix(attr::QUERY_PARAM_PREFIX) {
                        query_params.push((name.to_owned(), value));
                    } else if let Some(name) = key.strip_prefix(attr::REQUEST_BODY_PREFIX) {
                        form.append_pair(name, &value);
                        has_form = true;
                    } else if let Some(name) = key.strip_prefix(attr::REQUEST_HEADER_PREFIX) {
                        tx.request_headers.push(Header::new(name, value));
                    } else if let Some(name) = key.strip_prefix(attr::RESPONSE_HEADER_PREFIX) {
                        tx.response_headers.push(Header::new(name, value));
                    } else if let Some(name) = key.strip_prefix(attr::REQUEST_COOKIE_PREFIX) {
                        request_cookies.push(format!("{name}={value}"));
                    } else if let Some(name) = key.strip_prefix(attr::RESPONSE_COOKIE_PREFIX) {
                        response_cookies.push(format!("{name}={value}"));
                    }
                }
            }
        }

        if !query_params.is_empty() {
            tx.uri = append_query(&tx.uri, &query_params);
        }
        if has_form && tx.request_body.is_empty() {
            tx.request_body.push(BodyChunk::Text(form.finish()));
            if !tx
                .request_headers
                .iter()
                .any(|h| h.name.eq_ignore_ascii_case("content-type"))
            {
                tx.request_headers.push(Header::new(
                    "content-type",
                    "application/x-www-form-urlencoded",
                ));
            }
        }
        if !request_cookies.is_empty() {
            tx.request_headers
                .push(Header::new("cookie", request_cookies.join("; ")));
        }
        for cookie in response_cookies {
            tx.response_headers.push(Header::new("set-cookie", cookie));
        }
        tx
    }
}

/// 스팬 속성 이름
pub mod attr {
    pub const METHOD: &str = "http.method";
    pub const URL: &str = "http.url";
    pub const STATUS_CODE: &str = "http.status_code";
    pub const RESPONSE_STATUS_CODE: &str = "http.response.status_code";
    pub const REQUEST_BODY: &str = "http.request.body";
    pub const RESPONSE_BODY: &str = "http.response.body";
    pub const QUERY_PARAM_PREFIX: &str = "http.request.query.param.";
    pub const REQUEST_BODY_PREFIX: &str = "http.request.body.";
    pub const REQUEST_HEADER_PREFIX: &str = "http.request.header.";
    pub const RESPONSE_HEADER_PREFIX: &str = "http.response.header.";
    pub const REQUEST_COOKIE_PREFIX: &str = "http.request.cookie.";
    pub const RESPONSE_COOKIE_PREFIX: &str = "http.response.cookie.";
}

/// URI에 쿼리 파라미터를 덧붙입니다. 절대 URL이면 `url`로, 아니면 문자열로 처리합니다.
fn append_query(uri: &str, params: &[(String, String)]) -> String {
    if let Ok(mut parsed) = url::Url::parse(uri) {
        parsed.query_pairs_mut().extend_pairs(params);
        return parsed.to_string();
    }

    let encoded = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();
    let base = if uri.is_empty() { "/" } else { uri };
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{encoded}")
}

impl fmt::Display for RawTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}",
            self.correlation_id().unwrap_or("-"),
            self.method,
            self.uri
        )
    }
}

/// 정규화된 본문의 인코딩 처리 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BodyEncoding {
    /// 본문 없음
    #[default]
    Empty,
    /// 유효한 UTF-8
    Utf8,
    /// ISO-8859-1에서 UTF-8로 변환됨
    Latin1,
    /// 인코딩을 알 수 없거나 잘못됨. 원시 바이트 그대로 전달
    Raw,
}

/// 엔진에 전달되는 본문
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectedBody {
    /// 검사 대상 바이트 (최대 `max_body_bytes`)
    pub data: Bytes,
    /// 잘리기 전 원래 길이
    pub original_len: usize,
    /// 크기 제한으로 잘렸는지 여부
    pub truncated: bool,
    /// 인코딩 처리 결과
    pub encoding: BodyEncoding,
}

impl InspectedBody {
    /// 본문을 텍스트로 봅니다. 잘못된 UTF-8은 대체 문자로 바뀝니다.
    pub fn as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// 본문이 비어 있는지 여부
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 엔진용 정규화 트랜잭션
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedTransaction {
    /// 상관 ID (항상 비어 있지 않음)
    pub correlation_id: String,
    /// HTTP 메서드 (대문자)
    pub method: String,
    /// 요청 URI (경로 + 쿼리)
    pub uri: String,
    /// 경로 부분
    pub path: String,
    /// 쿼리 문자열 (`?` 제외)
    pub query_string: String,
    /// 프로토콜
    pub protocol: String,
    /// 요청 헤더 (엔진 규칙으로 이름 변환)
    pub request_headers: Vec<Header>,
    /// 요청 쿠키
    pub request_cookies: Vec<(String, String)>,
    /// 쿼리 인자
    pub query_args: Vec<(String, String)>,
    /// 본문 인자 (폼, JSON)
    pub body_args: Vec<(String, String)>,
    /// 요청 본문
    pub request_body: InspectedBody,
    /// 응답 상태 코드
    pub response_status: Option<u16>,
    /// 응답 헤더
    pub response_headers: Vec<Header>,
    /// 응답 본문
    pub response_body: InspectedBody,
    /// 클라이언트
    pub client: Endpoint,
    /// 서버
    pub server: Endpoint,
}

impl NormalizedTransaction {
    /// 요청 헤더 값을 대소문자 구분 없이 조회합니다.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        find_header(&self.request_headers, name)
    }

    /// 응답 헤더 값을 대소문자 구분 없이 조회합니다.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        find_header(&self.response_headers, name)
    }

    /// 해당 단계의 본문이 잘린 상태로 검사되었는지 여부
    pub fn truncated_in(&self, phase: Phase) -> bool {
        match phase {
            Phase::RequestBody => self.request_body.truncated,
            Phase::ResponseBody => self.response_body.truncated,
            _ => false,
        }
    }

    /// 요청 또는 응답 본문 중 하나라도 잘렸는지 여부
    pub fn any_truncated(&self) -> bool {
        self.request_body.truncated || self.response_body.truncated
    }

    /// 민감 정보 가리기에 사용할 인자/쿠키 값
    pub fn parameter_values(&self) -> impl Iterator<Item = &str> {
        self.query_args
            .iter()
            .chain(self.body_args.iter())
            .chain(self.request_cookies.iter())
            .map(|(_, v)| v.as_str())
    }
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}
