//! Throughput of the Rule Index apply path (spec §4.A), the same
//! operations the state machine drives on every committed log entry.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use policy_dispatcher_core::rule::{BucketKey, Rule};
use policy_dispatcher_core::store::PolicyDatabase;

fn bench_add_rules(c: &mut Criterion) {
    let key = BucketKey::new("p", "p");
    let rules: Vec<Rule> = (0..1000)
        .map(|i| Rule::new([format!("user{i}"), "data1".to_string(), "read".to_string()]))
        .collect();

    c.bench_function("add_rules_1000_fresh", |b| {
        b.iter_batched(
            || tempfile::tempdir().unwrap(),
            |dir| {
                let db = PolicyDatabase::open(dir.path()).unwrap();
                db.add_rules(black_box(&key), black_box(&rules), 1).unwrap();
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_remove_filtered(c: &mut Criterion) {
    let key = BucketKey::new("p", "p");
    let rules: Vec<Rule> = (0..1000)
        .map(|i| Rule::new([format!("user{}", i % 50), "data1".to_string(), "read".to_string()]))
        .collect();

    c.bench_function("remove_filtered_by_field0", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let db = PolicyDatabase::open(dir.path()).unwrap();
                db.add_rules(&key, &rules, 1).unwrap();
                (dir, db)
            },
            |(_dir, db)| {
                db.remove_filtered(black_box(&key), 0, black_box(&["user7".to_string()]), 2)
                    .unwrap();
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_add_rules, bench_remove_filtered);
criterion_main!(benches);
