use criterion::{Criterion, criterion_group, criterion_main};
use pw_core::{Frame, InferConfig, Ordinal, Site, Trace, Value};
use pw_estimator::{CostTable, DiceOperator};
use std::collections::BTreeMap;

fn plated_fixture() -> (Trace, BTreeMap<String, Ordinal>, CostTable) {
    let outer = Frame::vectorized("outer", -2, 8);
    let inner = Frame::vectorized("inner", -1, 16);
    let at_outer = Ordinal::from_frames([outer.clone()]);
    let at_both = at_outer.with(inner);

    let mut trace = Trace::new();
    trace.push(Site::sample("top", Value::scalar(-0.25), []));
    trace.push(
        Site::sample("choice", Value::scalar(0.5_f64.ln()), [])
            .with_infer(InferConfig::sequential(2)),
    );
    trace.push(Site::sample(
        "row",
        Value::tensor(&[8, 1], vec![-0.5; 8]).expect("row scores should build"),
        [outer.clone()],
    ));
    trace.push(Site::sample(
        "cell",
        Value::tensor(&[8, 16], vec![-0.125; 128]).expect("cell scores should build"),
        [outer, inner],
    ));

    let mut ordering = BTreeMap::new();
    ordering.insert("top".to_owned(), Ordinal::empty());
    ordering.insert("choice".to_owned(), Ordinal::empty());
    ordering.insert("row".to_owned(), at_outer.clone());
    ordering.insert("cell".to_owned(), at_both.clone());

    let mut costs = CostTable::new();
    costs.insert(Ordinal::empty(), vec![Value::scalar(3.0)]);
    costs.insert(
        at_outer,
        vec![Value::tensor(&[8, 1], vec![1.5; 8]).expect("row costs should build")],
    );
    costs.insert(
        at_both,
        vec![Value::tensor(&[8, 16], vec![0.25; 128]).expect("cell costs should build")],
    );

    (trace, ordering, costs)
}

fn benchmark_expectation(c: &mut Criterion) {
    let (trace, ordering, costs) = plated_fixture();

    c.bench_function("expectation/direct", |b| {
        b.iter(|| {
            let mut dice = DiceOperator::new(&trace, &ordering)
                .expect("operator benchmark fixture should build");
            let expected = dice
                .compute_expectation(&costs, false)
                .expect("direct expectation should succeed");
            assert!(expected.item().expect("scalar expected").is_finite());
        });
    });

    c.bench_function("expectation/shared", |b| {
        b.iter(|| {
            let mut dice = DiceOperator::new(&trace, &ordering)
                .expect("operator benchmark fixture should build");
            let expected = dice
                .compute_expectation(&costs, true)
                .expect("shared expectation should succeed");
            assert!(expected.item().expect("scalar expected").is_finite());
        });
    });
}

criterion_group!(expectation_benches, benchmark_expectation);
criterion_main!(expectation_benches);
