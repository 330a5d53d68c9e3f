//! Benchmarks for bulk-reindex
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn records(n: usize) -> Vec<bulk_reindex::doc::SourceRecord> {
    use bulk_reindex::doc::SourceRecord;

    (0..n)
        .map(|i| {
            SourceRecord::new(
                "source",
                "test",
                i.to_string(),
                json!({ "user": "kimchy", "n": i, "tags": ["a", "b"] }).to_string(),
            )
            .with_version(1)
            .with_field("_routing", json!("r1"))
            .with_field("_timestamp", json!(1_400_000_000_000i64))
        })
        .collect()
}

fn benchmark_transform(c: &mut Criterion) {
    use bulk_reindex::config::{Destination, ScriptSpec};
    use bulk_reindex::script::ScriptRegistry;
    use bulk_reindex::transform::RecordTransformer;

    let batch = records(100);
    let destination = Destination {
        index: "dest".into(),
        ..Default::default()
    };

    c.bench_function("transform_copy_100", |b| {
        let transformer = RecordTransformer::new(destination.clone(), None);
        b.iter(|| black_box(transformer.transform_batch(&batch).unwrap()))
    });

    c.bench_function("transform_set_field_100", |b| {
        let script = ScriptRegistry::builtin()
            .resolve(
                &ScriptSpec::new("set-field")
                    .param("field", json!("flag"))
                    .param("value", json!(true)),
            )
            .unwrap();
        let transformer = RecordTransformer::new(destination.clone(), Some(script));
        b.iter(|| black_box(transformer.transform_batch(&batch).unwrap()))
    });
}

fn benchmark_rate_controller(c: &mut Criterion) {
    use bulk_reindex::rate::RateController;
    use bulk_reindex::RequestsPerSecond;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    c.bench_function("rate_schedule_and_wait_unlimited", |b| {
        let rate = RateController::new(RequestsPerSecond::Unlimited);
        let cancel = AtomicBool::new(false);
        b.iter(|| {
            rate.schedule(Instant::now(), black_box(100));
            black_box(rate.wait_until_ready(&cancel))
        })
    });

    c.bench_function("rate_set_rate", |b| {
        let rate = RateController::new(RequestsPerSecond::Limited(1000.0));
        rate.schedule(Instant::now(), 100);
        b.iter(|| black_box(rate.set_rate(RequestsPerSecond::Limited(black_box(500.0)))))
    });
}

fn benchmark_slicing(c: &mut Criterion) {
    use bulk_reindex::slice::slice_for_id;

    c.bench_function("slice_for_id", |b| {
        b.iter(|| black_box(slice_for_id(black_box("AVx3kQ9r2cWq8b1ZpL0m"), 8)))
    });
}

criterion_group!(benches, benchmark_transform, benchmark_rate_controller, benchmark_slicing);
criterion_main!(benches);
