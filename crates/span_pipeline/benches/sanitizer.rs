//! Sanitizer throughput: attribute writes under the default policy, with
//! exclusions, and with oversized values that need truncation.
//!
//! Also measures SQL obfuscation, which runs on every database span.
//!
//! Run with: cargo bench -p span_pipeline --bench sanitizer

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use span_pipeline::sanitizer;
use span_pipeline::{obfuscate_sql, AttributeValue, SanitizationPolicy};

const ATTRIBUTE_COUNT: u64 = 1_000;

fn bench_prepare(c: &mut Criterion) {
    let mut group = c.benchmark_group("prepare");
    group.throughput(Throughput::Elements(ATTRIBUTE_COUNT));

    let plain = SanitizationPolicy::default();
    let excluding = SanitizationPolicy::default().with_excluded_keys([
        "http.request.headers.authorization",
        "http.request.headers.cookie",
        "db.password",
    ]);
    let small = SanitizationPolicy::new(64).unwrap_or_default();

    group.bench_function("short_strings", |b| {
        b.iter(|| {
            for i in 0..ATTRIBUTE_COUNT {
                black_box(sanitizer::prepare(
                    "http.request.path",
                    AttributeValue::from(format!("/users/{i}")),
                    &plain,
                ));
            }
        });
    });

    group.bench_function("nested_headers_with_exclusions", |b| {
        b.iter(|| {
            for i in 0..ATTRIBUTE_COUNT {
                let headers = json!({
                    "authorization": "Bearer secret",
                    "cookie": "session=abc",
                    "x-request-id": i,
                });
                black_box(sanitizer::prepare(
                    "http.request.headers",
                    AttributeValue::from(headers),
                    &excluding,
                ));
            }
        });
    });

    let long = "x".repeat(8 * 1024);
    let list: Vec<AttributeValue> = (0..256).map(|i| format!("item-{i:05}").into()).collect();

    group.bench_function("truncate_long_string", |b| {
        b.iter(|| {
            for _ in 0..ATTRIBUTE_COUNT {
                black_box(sanitizer::prepare("body", AttributeValue::from(long.as_str()), &small));
            }
        });
    });

    group.bench_function("truncate_sequence", |b| {
        b.iter(|| {
            for _ in 0..ATTRIBUTE_COUNT {
                black_box(sanitizer::prepare("ids", AttributeValue::Array(list.clone()), &small));
            }
        });
    });

    group.finish();
}

fn bench_obfuscate_sql(c: &mut Criterion) {
    let mut group = c.benchmark_group("obfuscate_sql");
    group.throughput(Throughput::Elements(1));

    let query = "SELECT u.id, u.name FROM users u WHERE u.email = 'amir@example.com' \
                 AND u.created_at > 1700000000 AND u.active = true -- recent";

    group.bench_function("select_with_literals", |b| {
        b.iter(|| black_box(obfuscate_sql(black_box(query))));
    });

    group.finish();
}

criterion_group!(benches, bench_prepare, bench_obfuscate_sql);
criterion_main!(benches);
