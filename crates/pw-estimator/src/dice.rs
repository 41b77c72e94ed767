//! The DiCE correction operator.
//!
//! Built once per trace, `DiceOperator` turns the trace's score-function
//! terms and enumeration bookkeeping into per-ordinal log-domain correction
//! factors, realizes them as multiplicative weights at any requested shape,
//! and folds weights and downstream costs into one differentiable scalar.
//! Correction factors at an ordinal cover exactly the random choices
//! upstream of it; plate boundaries keep unrelated batch elements from
//! crediting or blaming each other.

use crate::EstimatorError;
use pw_core::{Enumerate, Ordinal, Shape, SiteKind, Trace, Value};
use pw_tensor::{
    Factor, FactorId, NaiveSumProduct, SumProduct, add, all_nonzero, broadcast_all, exp,
    gt_scalar, masked_select, mul, neg, sub, sum_all,
};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Per-ordinal cost tensors, as produced by `ContextSum` callers. Ordinals
/// must come from the same universe the operator was built against.
pub type CostTable = BTreeMap<Ordinal, Vec<Value>>;

/// One log-domain correction factor with a stable identity.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFactor {
    pub id: FactorId,
    pub term: Value,
}

#[derive(Debug)]
pub struct DiceOperator<E: SumProduct = NaiveSumProduct> {
    /// Log-denominator corrections per ordinal, accumulated across the
    /// sequentially enumerated sites living there.
    log_denom: BTreeMap<Ordinal, Value>,
    /// Log-weight factors per ordinal, in trace order.
    log_weights: BTreeMap<Ordinal, Vec<Rc<LogFactor>>>,
    factor_cache: FxHashMap<Ordinal, Vec<Rc<LogFactor>>>,
    realized_cache: FxHashMap<(Shape, Ordinal), Value>,
    next_factor: u32,
    engine: E,
}

impl DiceOperator<NaiveSumProduct> {
    pub fn new(
        trace: &Trace,
        ordering: &BTreeMap<String, Ordinal>,
    ) -> Result<Self, EstimatorError> {
        Self::with_engine(trace, ordering, NaiveSumProduct)
    }
}

impl<E: SumProduct> DiceOperator<E> {
    /// Classify every contributing site of `trace`. Non-sample sites,
    /// subsample bookkeeping sites, and sites with an identically-zero
    /// score term contribute nothing and are skipped.
    pub fn with_engine(
        trace: &Trace,
        ordering: &BTreeMap<String, Ordinal>,
        engine: E,
    ) -> Result<Self, EstimatorError> {
        let mut log_denom: BTreeMap<Ordinal, Value> = BTreeMap::new();
        let mut log_weights: BTreeMap<Ordinal, Vec<Rc<LogFactor>>> = BTreeMap::new();
        let mut next_factor = 0_u32;

        for site in trace.sites() {
            if site.kind != SiteKind::Sample || site.subsample {
                continue;
            }
            let score = &site.score_function;
            if score.is_identically_zero() {
                continue;
            }
            let ordinal = ordering
                .get(&site.name)
                .cloned()
                .ok_or_else(|| EstimatorError::MissingOrdinal {
                    site: site.name.clone(),
                })?;

            let term = match site.infer.enumerate {
                Some(Enumerate::Sequential) => {
                    // Each sequential branch recounts this ordinal's whole
                    // probability mass; ln(total) is taken back out exactly
                    // once downstream. The raw score term still carries the
                    // branch probability.
                    let total =
                        site.infer
                            .enum_total
                            .ok_or_else(|| EstimatorError::MissingEnumTotal {
                                site: site.name.clone(),
                            })?;
                    let denom = log_denom
                        .entry(ordinal.clone())
                        .or_insert_with(|| Value::scalar(0.0));
                    *denom = add(denom, &Value::scalar((total as f64).ln()))?;
                    score.clone()
                }
                Some(Enumerate::Parallel) => score.clone(),
                // Monte-Carlo sampled: the score-function surrogate, with
                // value exactly zero and the gradient of the log-probability.
                None => sub(score, &score.detach())?,
            };

            let id = FactorId(next_factor);
            next_factor += 1;
            log_weights
                .entry(ordinal)
                .or_default()
                .push(Rc::new(LogFactor { id, term }));
        }

        Ok(Self {
            log_denom,
            log_weights,
            factor_cache: FxHashMap::default(),
            realized_cache: FxHashMap::default(),
            next_factor,
            engine,
        })
    }

    /// The log-domain correction factors for `target`: one negated
    /// denominator folding in every enumeration bucket NOT upstream of
    /// `target` (omitted when identically zero), followed by every
    /// log-weight factor of every ordinal upstream of (or at) `target`.
    /// Memoized per ordinal; repeated calls return the same shared factors.
    pub fn log_factors(&mut self, target: &Ordinal) -> Result<Vec<Rc<LogFactor>>, EstimatorError> {
        if let Some(hit) = self.factor_cache.get(target) {
            return Ok(hit.clone());
        }

        let mut denom = Value::scalar(0.0);
        for (ordinal, term) in &self.log_denom {
            if !ordinal.upstream_or_equal(target) {
                denom = add(&denom, term)?;
            }
        }

        let mut factors = Vec::new();
        if !denom.is_identically_zero() {
            let id = FactorId(self.next_factor);
            self.next_factor += 1;
            factors.push(Rc::new(LogFactor {
                id,
                term: neg(&denom),
            }));
        }
        for (ordinal, terms) in &self.log_weights {
            if ordinal.upstream_or_equal(target) {
                factors.extend(terms.iter().cloned());
            }
        }

        self.factor_cache.insert(target.clone(), factors.clone());
        Ok(factors)
    }

    /// Realize the correction weight for `ordinal`, reduced down to (at
    /// most) `shape` and broadcastable back up to it. Memoized by
    /// `(shape, ordinal)` with leading unit dims of `shape` stripped first,
    /// since they are broadcast-irrelevant.
    pub fn realize(&mut self, shape: &Shape, ordinal: &Ordinal) -> Result<Value, EstimatorError> {
        let shape = shape.strip_leading_units();
        let key = (shape.clone(), ordinal.clone());
        if let Some(hit) = self.realized_cache.get(&key) {
            return Ok(hit.clone());
        }

        let factors = self.log_factors(ordinal)?;
        let exponentials: Vec<Value> = factors.iter().map(|f| exp(&f.term)).collect();
        let factor_refs: Vec<Factor<'_>> = factors
            .iter()
            .zip(exponentials.iter())
            .map(|(f, value)| Factor { id: f.id, value })
            .collect();
        let weight = self.engine.sumproduct(&factor_refs, &shape)?;

        self.realized_cache.insert(key, weight.clone());
        Ok(weight)
    }

    /// Fold every `(ordinal, cost)` pair of `costs` into one differentiable
    /// scalar expected cost. The two strategies are numerically equivalent;
    /// the shared strategy exponentiates each distinct factor once and
    /// reuses partial products across the batch.
    ///
    /// A failure aborts the whole batch; the operator's caches may be
    /// partially populated afterwards and the instance should be discarded.
    pub fn compute_expectation(
        &mut self,
        costs: &CostTable,
        shared_computation: bool,
    ) -> Result<Value, EstimatorError> {
        if shared_computation {
            self.compute_expectation_shared(costs)
        } else {
            self.compute_expectation_direct(costs)
        }
    }

    fn compute_expectation_direct(&mut self, costs: &CostTable) -> Result<Value, EstimatorError> {
        let mut expected = Value::scalar(0.0);
        for (ordinal, cost_terms) in costs {
            for cost in cost_terms {
                let weight = self.realize(&cost.shape(), ordinal)?;
                expected = add(&expected, &weighted_total(&weight, cost)?)?;
            }
        }
        Ok(expected)
    }

    fn compute_expectation_shared(&mut self, costs: &CostTable) -> Result<Value, EstimatorError> {
        // Exponentiate each distinct log factor exactly once, keyed by
        // identity. Every ordinal's row references the shared exponentials.
        let mut exp_table: FxHashMap<FactorId, Rc<Value>> = FxHashMap::default();
        let mut factor_table: BTreeMap<Ordinal, Vec<(FactorId, Rc<Value>)>> = BTreeMap::new();
        for ordinal in costs.keys() {
            let factors = self.log_factors(ordinal)?;
            let mut row = Vec::with_capacity(factors.len());
            for factor in &factors {
                let shared = exp_table
                    .entry(factor.id)
                    .or_insert_with(|| Rc::new(exp(&factor.term)))
                    .clone();
                row.push((factor.id, shared));
            }
            factor_table.insert(ordinal.clone(), row);
        }

        // One session spans the whole batch. Its memo is dropped with the
        // session on every exit path, including mid-batch failure.
        let mut session = self.engine.shared();
        let mut expected = Value::scalar(0.0);
        for (ordinal, cost_terms) in costs {
            let row = factor_table.get(ordinal).map(Vec::as_slice).unwrap_or(&[]);
            let factor_refs: Vec<Factor<'_>> = row
                .iter()
                .map(|(id, value)| Factor {
                    id: *id,
                    value: value.as_ref(),
                })
                .collect();
            for cost in cost_terms {
                let weight = session.sumproduct(&factor_refs, &cost.shape())?;
                expected = add(&expected, &weighted_total(&weight, cost)?)?;
            }
        }
        Ok(expected)
    }
}

/// Weight one cost term and sum it into a scalar. Entries whose weight is
/// not strictly positive are structurally excluded before the cost and
/// weight are broadcast together, so exact-zero-probability branches cannot
/// leak non-finite products into the surviving entries.
fn weighted_total(weight: &Value, cost: &Value) -> Result<Value, EstimatorError> {
    let mask = gt_scalar(weight, 0.0);
    if matches!(mask, Value::Tensor(_)) && !all_nonzero(&mask) {
        let joined = broadcast_all(&[cost, weight, &mask])?;
        let kept_cost = masked_select(&joined[0], &joined[2])?;
        let kept_weight = masked_select(&joined[1], &joined[2])?;
        return Ok(sum_all(&mul(&kept_weight, &kept_cost)?));
    }
    Ok(sum_all(&mul(weight, cost)?))
}
