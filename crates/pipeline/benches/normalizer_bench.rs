//! 트랜잭션 정규화 벤치마크
//!
//! 헤더 정리, 쿼리/폼/JSON 인자 추출, 본문 크기 상한 적용 비용을 측정합니다.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ocinspect_core::transaction::RawTransaction;
use ocinspect_core::types::HeaderCase;
use ocinspect_pipeline::Normalizer;

fn get_request() -> RawTransaction {
    RawTransaction::new("bench-get", "GET", "/api/v1/products?category=shoes&page=2&sort=price")
        .with_request_header("Host", "shop.example.com")
        .with_request_header("User-Agent", "Mozilla/5.0 (X11; Linux x86_64)")
        .with_request_header("Accept", "application/json")
        .with_request_header("Cookie", "session=abc123; theme=dark; __utma=1.2.3")
        .with_response_status(200)
        .with_response_header("Content-Type", "application/json")
}

fn json_post(fields: usize) -> RawTransaction {
    let items = (0..fields)
        .map(|i| format!(r#"{{"id":{i},"name":"item-{i}","tags":["a","b"]}}"#))
        .collect::<Vec<_>>()
        .join(",");
    RawTransaction::new("bench-json", "POST", "/api/v1/orders")
        .with_request_header("Host", "shop.example.com")
        .with_request_header("Content-Type", "application/json")
        .with_request_body(format!(r#"{{"customer":{{"id":7}},"items":[{items}]}}"#))
        .with_response_status(201)
}

fn bench_normalize(c: &mut Criterion) {
    let normalizer = Normalizer::new(HeaderCase::Lower, 128 * 1024);

    let mut group = c.benchmark_group("normalize");
    group.throughput(Throughput::Elements(1));

    let get = get_request();
    group.bench_function("get_with_query_and_cookies", |b| {
        b.iter(|| normalizer.normalize(black_box(&get)).unwrap())
    });

    let form = RawTransaction::new("bench-form", "POST", "/login")
        .with_request_header("Content-Type", "application/x-www-form-urlencoded")
        .with_request_body("username=alice&password=s3cr3t%21&remember=on");
    group.bench_function("form_post", |b| {
        b.iter(|| normalizer.normalize(black_box(&form)).unwrap())
    });

    for fields in [1usize, 16, 128] {
        let tx = json_post(fields);
        group.bench_with_input(BenchmarkId::new("json_post", fields), &tx, |b, tx| {
            b.iter(|| normalizer.normalize(black_box(tx)).unwrap())
        });
    }

    group.finish();
}

fn bench_body_limit(c: &mut Criterion) {
    let body = "x".repeat(1024 * 1024);
    let raw = RawTransaction::new("bench-large", "POST", "/upload")
        .with_request_header("Content-Type", "text/plain")
        .with_request_body(body.clone());

    let mut group = c.benchmark_group("body_limit");
    group.throughput(Throughput::Bytes(body.len() as u64));
    for limit in [4 * 1024usize, 128 * 1024, 1024 * 1024] {
        let normalizer = Normalizer::new(HeaderCase::Lower, limit);
        group.bench_with_input(BenchmarkId::from_parameter(limit), &raw, |b, raw| {
            b.iter(|| normalizer.normalize(black_box(raw)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_normalize, bench_body_limit);
criterion_main!(benches);
