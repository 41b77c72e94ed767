#![forbid(unsafe_code)]

//! Conformance fixtures shared by the integration suites.
//!
//! Each fixture is a complete estimation problem: a trace, its ordinal
//! assignment, and a cost table. Fixtures cover the structures the
//! estimator must keep straight (nested plates, mixed sampling and
//! enumeration, zero-probability branches) so suites can drive both
//! evaluation strategies over identical inputs.

use pw_core::{Frame, InferConfig, Ordinal, Site, Trace, Value};
use pw_estimator::CostTable;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct EstimatorFixture {
    pub fixture_id: &'static str,
    pub trace: Trace,
    pub ordering: BTreeMap<String, Ordinal>,
    pub costs: CostTable,
}

/// Deterministic fill for score tensors: a splitmix-style stream mapped
/// into small negative log-probabilities.
#[must_use]
pub fn score_stream(seed: u64, len: usize) -> Vec<f64> {
    let mut state = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        let unit = (z >> 11) as f64 / (1_u64 << 53) as f64;
        out.push(-2.0 * unit - 0.05);
    }
    out
}

/// Two nested plates under a root-level Monte-Carlo site and a root-level
/// sequentially enumerated choice.
#[must_use]
pub fn nested_plates_fixture() -> EstimatorFixture {
    let outer = Frame::vectorized("outer", -2, 3);
    let inner = Frame::vectorized("inner", -1, 4);
    let at_outer = Ordinal::from_frames([outer.clone()]);
    let at_both = at_outer.with(inner.clone());

    let mut trace = Trace::new();
    trace.push(Site::sample("global", Value::scalar(-0.3), []));
    trace.push(
        Site::sample("choice", Value::scalar(0.4_f64.ln()), [])
            .with_infer(InferConfig::sequential(3)),
    );
    trace.push(Site::sample(
        "row",
        Value::tensor(&[3, 1], score_stream(11, 3)).expect("row scores should build"),
        [outer.clone()],
    ));
    trace.push(Site::sample(
        "cell",
        Value::tensor(&[3, 4], score_stream(12, 12)).expect("cell scores should build"),
        [outer, inner],
    ));

    let mut ordering = BTreeMap::new();
    ordering.insert("global".to_owned(), Ordinal::empty());
    ordering.insert("choice".to_owned(), Ordinal::empty());
    ordering.insert("row".to_owned(), at_outer.clone());
    ordering.insert("cell".to_owned(), at_both.clone());

    let mut costs = CostTable::new();
    costs.insert(Ordinal::empty(), vec![Value::scalar(5.0)]);
    costs.insert(
        at_outer,
        vec![Value::tensor(&[3, 1], vec![1.5, 2.5, 3.5]).expect("row costs should build")],
    );
    costs.insert(
        at_both,
        vec![
            Value::tensor(&[3, 4], (0..12).map(|i| 0.25 * f64::from(i)).collect())
                .expect("cell costs should build"),
        ],
    );

    EstimatorFixture {
        fixture_id: "nested_plates",
        trace,
        ordering,
        costs,
    }
}

/// A sequentially enumerated choice inside a plate, with costs at the root
/// ordinal that are NOT downstream of it: the enumeration total must show
/// up as a normalizing correction there.
#[must_use]
pub fn enumeration_in_plate_fixture() -> EstimatorFixture {
    let plate = Frame::vectorized("plate", -1, 2);
    let inside = Ordinal::from_frames([plate.clone()]);

    let mut trace = Trace::new();
    trace.push(Site::sample(
        "loc",
        Value::vector(&[-0.4, -0.6]).expect("loc scores should build"),
        [plate.clone()],
    ));
    trace.push(
        Site::sample(
            "assign",
            Value::vector(&[0.5_f64.ln(), 0.25_f64.ln()]).expect("assign scores should build"),
            [plate],
        )
        .with_infer(InferConfig::sequential(4)),
    );

    let mut ordering = BTreeMap::new();
    ordering.insert("loc".to_owned(), inside.clone());
    ordering.insert("assign".to_owned(), inside.clone());

    let mut costs = CostTable::new();
    costs.insert(Ordinal::empty(), vec![Value::scalar(8.0)]);
    costs.insert(
        inside,
        vec![Value::vector(&[2.0, 6.0]).expect("plate costs should build")],
    );

    EstimatorFixture {
        fixture_id: "enumeration_in_plate",
        trace,
        ordering,
        costs,
    }
}

/// A parallel-enumerated choice with an impossible branch and an infinite
/// cost sitting in it. Masking must keep the total finite.
#[must_use]
pub fn zero_probability_fixture() -> EstimatorFixture {
    let mut trace = Trace::new();
    trace.push(
        Site::sample(
            "choice",
            Value::vector(&[f64::NEG_INFINITY, 0.6_f64.ln(), 0.4_f64.ln()])
                .expect("choice scores should build"),
            [],
        )
        .with_infer(InferConfig::parallel()),
    );
    trace.push(Site::sample("context", Value::scalar(-0.2), []));

    let mut ordering = BTreeMap::new();
    ordering.insert("choice".to_owned(), Ordinal::empty());
    ordering.insert("context".to_owned(), Ordinal::empty());

    let mut costs = CostTable::new();
    costs.insert(
        Ordinal::empty(),
        vec![
            Value::vector(&[f64::INFINITY, 1.0, 2.0]).expect("branch costs should build"),
            Value::scalar(3.0),
        ],
    );

    EstimatorFixture {
        fixture_id: "zero_probability",
        trace,
        ordering,
        costs,
    }
}

#[must_use]
pub fn all_fixtures() -> Vec<EstimatorFixture> {
    vec![
        nested_plates_fixture(),
        enumeration_in_plate_fixture(),
        zero_probability_fixture(),
    ]
}

/// Relative-tolerance comparison for scalar expectations.
#[must_use]
pub fn approx_eq(a: f64, b: f64, rtol: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= rtol * scale
}

#[cfg(test)]
mod tests {
    use super::{all_fixtures, approx_eq, score_stream};

    #[test]
    fn fixtures_validate_as_traces() {
        for fixture in all_fixtures() {
            fixture
                .trace
                .validate()
                .expect("fixture traces must be well formed");
            for site in fixture.trace.sites() {
                assert!(
                    fixture.ordering.contains_key(&site.name),
                    "fixture {} is missing an ordinal for {}",
                    fixture.fixture_id,
                    site.name
                );
            }
        }
    }

    #[test]
    fn score_stream_is_deterministic_and_negative() {
        let a = score_stream(42, 16);
        let b = score_stream(42, 16);
        assert_eq!(a, b);
        assert!(a.iter().all(|&x| x < 0.0));
        assert_ne!(score_stream(43, 16), a);
    }

    #[test]
    fn approx_eq_uses_relative_scale() {
        assert!(approx_eq(1.0e6, 1.0e6 + 0.5, 1e-6));
        assert!(!approx_eq(1.0, 1.1, 1e-6));
    }
}
