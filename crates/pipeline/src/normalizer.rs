//! 트랜잭션 정규화기 -- 캡처된 HTTP 교환을 엔진 모델로 변환
//!
//! [`Normalizer`]는 [`RawTransaction`]을 [`NormalizedTransaction`]으로 바꿉니다.
//!
//! # 처리 내용
//! - 헤더 이름을 엔진 규칙([`HeaderCase`])에 맞게 변환
//! - 스트리밍 본문 조각을 순서대로 이어 붙이고 `max_body_bytes`에서 자름 (`truncated`)
//! - UTF-8 BOM 제거, `ISO-8859-1`/`latin1` 본문을 UTF-8로 변환 (변환 결과도 상한 이내),
//!   잘못된 인코딩은 원시 바이트 그대로 전달
//! - 경로, 쿼리 문자열, 쿼리 인자, 쿠키, 본문 인자(폼, JSON `json.a.b`) 추출
//!
//! 정규화는 잘못되었지만 크기가 제한된 입력에서 실패하지 않습니다.
//! 상관 ID가 없거나 본문 길이가 음수일 때만 [`NormalizationError`]를 반환합니다.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use ocinspect_core::error::NormalizationError;
use ocinspect_core::transaction::{
    BodyChunk, BodyEncoding, Endpoint, Header, InspectedBody, NormalizedTransaction,
    RawTransaction,
};
use ocinspect_core::types::HeaderCase;

/// UTF-8 BOM
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// JSON 본문 인자 이름 접두사
const JSON_ARG_PREFIX: &str = "json";

/// JSON 평탄화 최대 깊이
const MAX_JSON_DEPTH: usize = 32;

/// 트랜잭션 정규화기
#[derive(Debug, Clone)]
pub struct Normalizer {
    header_case: HeaderCase,
    max_body_bytes: usize,
}

impl Normalizer {
    /// 새 정규화기를 생성합니다.
    pub fn new(header_case: HeaderCase, max_body_bytes: usize) -> Self {
        Self {
            header_case,
            max_body_bytes,
        }
    }

    /// 본문 크기 상한
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// 트랜잭션을 정규화합니다.
    ///
    /// # Errors
    /// - 상관 ID가 없으면 `NormalizationError::MissingCorrelationId`
    /// - 선언된 본문 길이가 음수이면 `NormalizationError::NegativeBodyLength`
    pub fn normalize(
        &self,
        raw: &RawTransaction,
    ) -> Result<NormalizedTransaction, NormalizationError> {
        let correlation_id = raw
            .correlation_id()
            .ok_or(NormalizationError::MissingCorrelationId)?
            .to_owned();
        check_length("request_body", raw.request_body_length)?;
        check_length("response_body", raw.response_body_length)?;

        let target = RequestTarget::parse(&raw.uri);
        let request_headers = self.fold_headers(&raw.request_headers);
        let response_headers = self.fold_headers(&raw.response_headers);

        let request_content_type = find_header(&request_headers, "content-type");
        let response_content_type = find_header(&response_headers, "content-type");

        let request_body = self.assemble_body(&raw.request_body, request_content_type);
        let response_body = self.assemble_body(&raw.response_body, response_content_type);

        let body_args = request_content_type
            .map(|ct| body_args(&request_body, ct))
            .unwrap_or_default();

        let mut server = raw.server.clone();
        if server.address.is_none() {
            server = Endpoint {
                address: target.host.clone(),
                port: server.port.or(target.port),
            };
        }

        Ok(NormalizedTransaction {
            correlation_id,
            method: raw.method.trim().to_ascii_uppercase(),
            query_args: parse_pairs(&target.query),
            uri: target.uri(),
            path: target.path,
            query_string: target.query,
            protocol: raw.protocol.trim().to_owned(),
            request_cookies: parse_cookies(&request_headers),
            request_headers,
            body_args,
            request_body,
            response_status: raw.response_status,
            response_headers,
            response_body,
            client: raw.client.clone(),
            server,
        })
    }

    fn fold_headers(&self, headers: &[Header]) -> Vec<Header> {
        headers
            .iter()
            .map(|h| Header::new(self.header_case.apply(h.name.trim()), h.value.trim()))
            .collect()
    }

    /// 조각을 이어 붙이고 크기 상한에서 자른 뒤 문자 집합을 정리합니다.
    fn assemble_body(&self, chunks: &[BodyChunk], content_type: Option<&str>) -> InspectedBody {
        let original_len: usize = chunks.iter().map(|c| c.as_bytes().len()).sum();
        if original_len == 0 {
            return InspectedBody::default();
        }

        let mut buf = BytesMut::with_capacity(original_len.min(self.max_body_bytes));
        for chunk in chunks {
            let remaining = self.max_body_bytes - buf.len();
            if remaining == 0 {
                break;
            }
            let bytes = chunk.as_bytes();
            buf.extend_from_slice(&bytes[..bytes.len().min(remaining)]);
        }
        let truncated = original_len > self.max_body_bytes;

        let mut data = buf.freeze();
        if data.starts_with(UTF8_BOM) {
            data = data.slice(UTF8_BOM.len()..);
        }

        let (data, encoding, truncated) = decode_charset(
            data,
            content_type.and_then(charset),
            truncated,
            self.max_body_bytes,
        );
        InspectedBody {
            data,
            original_len,
            truncated,
            encoding,
        }
    }
}

fn check_length(field: &str, length: Option<i64>) -> Result<(), NormalizationError> {
    match length {
        Some(length) if length < 0 => Err(NormalizationError::NegativeBodyLength {
            field: field.to_owned(),
            length,
        }),
        _ => Ok(()),
    }
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// 요청 대상(URI)의 구성 요소
#[derive(Debug, Default)]
struct RequestTarget {
    path: String,
    query: String,
    host: Option<String>,
    port: Option<u16>,
}

impl RequestTarget {
    /// 절대 URL과 원점 형식(`/path?query`)을 모두 받습니다. 조각(`#...`)은 버립니다.
    fn parse(uri: &str) -> Self {
        let uri = uri.trim();
        if let Ok(url) = url::Url::parse(uri) {
            if url.has_host() {
                return Self {
                    path: url.path().to_owned(),
                    query: url.query().unwrap_or_default().to_owned(),
                    host: url.host_str().map(str::to_owned),
                    port: url.port_or_known_default(),
                };
            }
        }

        let without_fragment = uri.split_once('#').map_or(uri, |(head, _)| head);
        let (path, query) = without_fragment
            .split_once('?')
            .unwrap_or((without_fragment, ""));
        Self {
            path: if path.is_empty() { "/".to_owned() } else { path.to_owned() },
            query: query.to_owned(),
            ..Self::default()
        }
    }

    fn uri(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

fn parse_pairs(encoded: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(encoded.as_bytes())
        .into_owned()
        .collect()
}

fn parse_cookies(headers: &[Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("cookie"))
        .flat_map(|h| h.value.split(';'))
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some((name.trim().to_owned(), value.trim().to_owned()))
        })
        .collect()
}

/// `Content-Type`의 `charset` 파라미터 (소문자)
fn charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
    })
}

/// 문자 집합을 정리합니다. 반환하는 `truncated`는 변환 후 다시 자른 경우도 포함합니다.
fn decode_charset(
    data: Bytes,
    charset: Option<String>,
    truncated: bool,
    max_bytes: usize,
) -> (Bytes, BodyEncoding, bool) {
    if data.is_empty() {
        return (data, BodyEncoding::Empty, truncated);
    }

    if matches!(
        charset.as_deref(),
        Some("iso-8859-1" | "latin1" | "latin-1" | "iso8859-1")
    ) {
        // ISO-8859-1의 각 바이트는 같은 코드 포인트의 문자. 0x80 이상은 2바이트가 됨
        let mut text = String::with_capacity(data.len().min(max_bytes));
        let mut clipped = false;
        for ch in data.iter().map(|&b| char::from(b)) {
            if text.len() + ch.len_utf8() > max_bytes {
                clipped = true;
                break;
            }
            text.push(ch);
        }
        return (Bytes::from(text), BodyEncoding::Latin1, truncated || clipped);
    }

    match std::str::from_utf8(&data) {
        Ok(_) => (data, BodyEncoding::Utf8, truncated),
        // 자르기로 끝에서 끊긴 멀티바이트 문자는 버림
        Err(e) if truncated && e.error_len().is_none() => {
            let valid = e.valid_up_to();
            (data.slice(..valid), BodyEncoding::Utf8, truncated)
        }
        Err(_) => (data, BodyEncoding::Raw, truncated),
    }
}

/// 요청 본문에서 인자를 추출합니다. 지원하지 않는 형식이면 빈 목록입니다.
fn body_args(body: &InspectedBody, content_type: &str) -> Vec<(String, String)> {
    if body.is_empty() {
        return Vec::new();
    }
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if media_type == "application/x-www-form-urlencoded" {
        return url::form_urlencoded::parse(&body.data).into_owned().collect();
    }

    if media_type == "application/json" || media_type.ends_with("+json") {
        return match serde_json::from_slice::<Value>(&body.data) {
            Ok(value) => {
                let mut out = Vec::new();
                flatten_json(JSON_ARG_PREFIX, &value, 0, &mut out);
                out
            }
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    truncated = body.truncated,
                    "request body is not valid json, skipping body args"
                );
                Vec::new()
            }
        };
    }

    Vec::new()
}

/// JSON 값을 `json.a.b` 형식의 잎(leaf) 인자로 평탄화합니다.
fn flatten_json(prefix: &str, value: &Value, depth: usize, out: &mut Vec<(String, String)>) {
    if depth > MAX_JSON_DEPTH {
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_json(&format!("{prefix}.{key}"), child, depth + 1, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_json(&format!("{prefix}.{i}"), child, depth + 1, out);
            }
        }
        Value::String(s) => out.push((prefix.to_owned(), s.clone())),
        Value::Null => out.push((prefix.to_owned(), String::new())),
        other => out.push((prefix.to_owned(), other.to_string())),
    }
}
