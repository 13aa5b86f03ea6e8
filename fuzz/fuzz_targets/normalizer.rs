#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use ocinspect_core::transaction::{BodyChunk, Header, RawTransaction};
use ocinspect_core::types::HeaderCase;
use ocinspect_pipeline::Normalizer;

/// 퍼저용 구조적 입력
#[derive(Arbitrary, Debug)]
struct FuzzInput {
    method: String,
    uri: String,
    /// (이름, 값) 쌍, 최대 16개 사용
    request_headers: Vec<(String, String)>,
    request_body: Vec<FuzzChunk>,
    request_body_length: Option<i64>,
    response_status: Option<u16>,
    response_headers: Vec<(String, String)>,
    response_body: Vec<FuzzChunk>,
    preserve_case: bool,
    /// 본문 상한 (1..=4096)
    max_body_bytes: u16,
}

#[derive(Arbitrary, Debug)]
enum FuzzChunk {
    Text(String),
    Raw(Vec<u8>),
}

impl From<FuzzChunk> for BodyChunk {
    fn from(chunk: FuzzChunk) -> Self {
        match chunk {
            FuzzChunk::Text(s) => BodyChunk::Text(s),
            FuzzChunk::Raw(b) => BodyChunk::Raw(b),
        }
    }
}

fn headers(pairs: Vec<(String, String)>) -> Vec<Header> {
    pairs
        .into_iter()
        .take(16)
        .map(|(name, value)| Header::new(name, value))
        .collect()
}

fuzz_target!(|input: FuzzInput| {
    let mut raw = RawTransaction::new("fuzz", input.method, input.uri);
    raw.request_headers = headers(input.request_headers);
    raw.request_body = input.request_body.into_iter().map(Into::into).collect();
    raw.request_body_length = input.request_body_length;
    raw.response_status = input.response_status;
    raw.response_headers = headers(input.response_headers);
    raw.response_body = input.response_body.into_iter().map(Into::into).collect();
    let request_len: usize = raw.request_body.iter().map(|c| c.as_bytes().len()).sum();

    let case = if input.preserve_case {
        HeaderCase::Preserve
    } else {
        HeaderCase::Lower
    };
    let limit = usize::from(input.max_body_bytes % 4096) + 1;
    let normalizer = Normalizer::new(case, limit);

    if let Ok(tx) = normalizer.normalize(&raw) {
        assert_eq!(tx.request_body.original_len, request_len);
        assert!(tx.request_body.data.len() <= limit);
        if request_len > limit {
            assert!(tx.request_body.truncated);
        }
    }
});
