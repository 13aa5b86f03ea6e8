//! 트랜잭션/레코드 직렬화 벤치마크
//!
//! 수신 NDJSON 역직렬화와 스팬 속성 부착 비용을 측정합니다.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use ocinspect_core::finding::{Finding, InspectionOutcome, InspectionStatus};
use ocinspect_core::record::SpanRecord;
use ocinspect_core::transaction::RawTransaction;
use ocinspect_core::types::{Phase, Severity};

const RAW_TRANSACTION_JSON: &str = r#"{
    "correlation_id": "6f1c2a7be01d44c1",
    "method": "POST",
    "uri": "/api/v1/login?next=%2Fhome",
    "request_headers": [
        {"name": "Host", "value": "shop.example.com"},
        {"name": "Content-Type", "value": "application/x-www-form-urlencoded"},
        {"name": "Cookie", "value": "session=abc123; theme=dark"}
    ],
    "request_body": ["user=alice&password=hunter2"],
    "response_status": 200,
    "response_headers": [{"name": "Content-Type", "value": "application/json"}],
    "response_body": ["{\"ok\":true}"]
}"#;

fn create_outcome(findings: usize) -> InspectionOutcome {
    let mut outcome = InspectionOutcome::new("6f1c2a7be01d44c1", InspectionStatus::Completed);
    for i in 0..findings {
        outcome.findings.push(Finding {
            rule_id: 942_100 + i as u64,
            message: "SQL Injection Attack Detected via libinjection".to_owned(),
            match_message: "Matched Data: *** found within ARGS:user".to_owned(),
            severity: Severity::Critical,
            anomaly_score: 5,
            paranoia_level: 1,
            phase: Phase::RequestBody,
            matched_field: Some("ARGS:user".to_owned()),
            correlation_id: "6f1c2a7be01d44c1".to_owned(),
            tags: vec!["attack-sqli".to_owned(), "paranoia-level/1".to_owned()],
            truncated: false,
        });
    }
    outcome
}

fn bench_deserialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("raw_transaction");
    group.throughput(Throughput::Bytes(RAW_TRANSACTION_JSON.len() as u64));
    group.bench_function("deserialize", |b| {
        b.iter(|| {
            let tx: RawTransaction = serde_json::from_str(black_box(RAW_TRANSACTION_JSON))
                .expect("valid transaction");
            black_box(tx)
        })
    });
    group.finish();
}

fn bench_attach_outcome(c: &mut Criterion) {
    let mut group = c.benchmark_group("span_attach");
    for count in [0usize, 1, 10] {
        let outcome = create_outcome(count);
        group.bench_function(format!("findings_{count}"), |b| {
            b.iter(|| {
                let mut span = SpanRecord::new("6f1c2a7be01d44c1");
                span.attach_outcome(black_box(&outcome));
                black_box(span)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_deserialize, bench_attach_outcome);
criterion_main!(benches);
