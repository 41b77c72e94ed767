//! Multi-factor sum-product reduction behind an engine seam.
//!
//! An engine multiplies a set of weight factors with broadcasting and
//! reduces the product down to a caller-chosen shape. Batched callers open
//! a `SharedSession`, whose memo lets the engine reuse partial products
//! across reductions that share factors; the memo lives exactly as long as
//! the session and is released when it drops, on success and on unwind
//! alike.

use crate::{TensorError, mul, reduce_to_shape};
use pw_core::{Shape, Value};
use rustc_hash::FxHashMap;

/// Identity of one weight factor. Memoization keys on identity, not value:
/// two factors holding equal tensors are still distinct contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FactorId(pub u32);

#[derive(Debug, Clone, Copy)]
pub struct Factor<'a> {
    pub id: FactorId,
    pub value: &'a Value,
}

pub trait SumProduct {
    /// Multiply `factors` together with broadcasting and reduce the product
    /// down to `target`. An empty factor list is the neutral weight one.
    /// The result is broadcastable back up to `target`.
    fn sumproduct(&self, factors: &[Factor<'_>], target: &Shape) -> Result<Value, TensorError>;

    /// Memo-assisted variant driven through a `SharedSession`. Engines
    /// without shareable intermediates may ignore the memo.
    fn sumproduct_with_memo(
        &self,
        memo: &mut SharedMemo,
        factors: &[Factor<'_>],
        target: &Shape,
    ) -> Result<Value, TensorError> {
        let _ = memo;
        self.sumproduct(factors, target)
    }

    /// Open a shared-computation session for one batch of reductions.
    /// Sessions must not be nested or kept alive across unrelated batches:
    /// the cached sub-products are only valid against one set of factor
    /// identities.
    fn shared(&self) -> SharedSession<'_, Self>
    where
        Self: Sized,
    {
        SharedSession {
            engine: self,
            memo: SharedMemo::default(),
        }
    }
}

/// Partial products and finished reductions keyed by canonicalized factor
/// identity.
#[derive(Debug, Default)]
pub struct SharedMemo {
    products: FxHashMap<Vec<u32>, Value>,
    reductions: FxHashMap<(Vec<u32>, Shape), Value>,
}

impl SharedMemo {
    #[must_use]
    pub fn cached_products(&self) -> usize {
        self.products.len()
    }

    #[must_use]
    pub fn cached_reductions(&self) -> usize {
        self.reductions.len()
    }
}

/// Scope guard for one batch of shared reductions; owns the memo.
#[derive(Debug)]
pub struct SharedSession<'e, E: SumProduct> {
    engine: &'e E,
    memo: SharedMemo,
}

impl<E: SumProduct> SharedSession<'_, E> {
    pub fn sumproduct(
        &mut self,
        factors: &[Factor<'_>],
        target: &Shape,
    ) -> Result<Value, TensorError> {
        self.engine.sumproduct_with_memo(&mut self.memo, factors, target)
    }

    #[must_use]
    pub fn memo(&self) -> &SharedMemo {
        &self.memo
    }
}

// ── Naive host engine ──────────────────────────────────────────────

/// Reference engine: broadcast-multiply every factor, then reduce to the
/// target shape. Shared sessions memoize id-ordered prefix products, so
/// reductions whose factor sets extend one another redo only the tail
/// multiplications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveSumProduct;

fn id_ordered<'a, 'v>(factors: &'a [Factor<'v>]) -> Vec<Factor<'v>> {
    let mut ordered = factors.to_vec();
    ordered.sort_by_key(|f| f.id);
    ordered
}

impl SumProduct for NaiveSumProduct {
    fn sumproduct(&self, factors: &[Factor<'_>], target: &Shape) -> Result<Value, TensorError> {
        let mut product = Value::scalar(1.0);
        for factor in id_ordered(factors) {
            product = mul(&product, factor.value)?;
        }
        reduce_to_shape(&product, target)
    }

    fn sumproduct_with_memo(
        &self,
        memo: &mut SharedMemo,
        factors: &[Factor<'_>],
        target: &Shape,
    ) -> Result<Value, TensorError> {
        let ordered = id_ordered(factors);
        let ids: Vec<u32> = ordered.iter().map(|f| f.id.0).collect();

        let reduction_key = (ids.clone(), target.clone());
        if let Some(hit) = memo.reductions.get(&reduction_key) {
            return Ok(hit.clone());
        }

        // Resume from the longest already-computed prefix product.
        let mut product = Value::scalar(1.0);
        let mut resume = 0;
        for len in (1..=ids.len()).rev() {
            if let Some(prefix) = memo.products.get(&ids[..len]) {
                product = prefix.clone();
                resume = len;
                break;
            }
        }
        for i in resume..ordered.len() {
            product = mul(&product, ordered[i].value)?;
            memo.products.insert(ids[..=i].to_vec(), product.clone());
        }

        let reduced = reduce_to_shape(&product, target)?;
        memo.reductions.insert(reduction_key, reduced.clone());
        Ok(reduced)
    }
}

#[cfg(test)]
mod tests {
    use super::{Factor, FactorId, NaiveSumProduct, SumProduct};
    use pw_core::{Shape, Value};

    fn factors<'a>(values: &'a [Value]) -> Vec<Factor<'a>> {
        values
            .iter()
            .enumerate()
            .map(|(i, value)| Factor {
                id: FactorId(i as u32),
                value,
            })
            .collect()
    }

    #[test]
    fn empty_factor_list_is_weight_one() {
        let engine = NaiveSumProduct;
        let one = engine
            .sumproduct(&[], &Shape::of(&[3]))
            .expect("empty sumproduct should succeed");
        assert_eq!(one, Value::scalar(1.0));
    }

    #[test]
    fn product_reduces_to_target_shape() {
        let engine = NaiveSumProduct;
        let values = vec![
            Value::tensor(&[2, 1], vec![1.0, 2.0]).expect("column should build"),
            Value::vector(&[1.0, 10.0, 100.0]).expect("row should build"),
        ];
        let fs = factors(&values);

        let full = engine
            .sumproduct(&fs, &Shape::of(&[2, 3]))
            .expect("full-shape sumproduct should succeed");
        assert_eq!(full.shape(), Shape::of(&[2, 3]));

        let per_row = engine
            .sumproduct(&fs, &Shape::of(&[2, 1]))
            .expect("row-reduced sumproduct should succeed");
        let row_totals = match per_row {
            Value::Tensor(t) => t.elements,
            Value::Scalar(_) => panic!("expected tensor"),
        };
        assert_eq!(row_totals, vec![111.0, 222.0]);
    }

    #[test]
    fn factor_order_does_not_matter() {
        let engine = NaiveSumProduct;
        let values = vec![
            Value::vector(&[2.0, 3.0]).expect("vector should build"),
            Value::scalar(0.5),
        ];
        let forward = factors(&values);
        let mut reversed = forward.clone();
        reversed.reverse();

        let a = engine
            .sumproduct(&forward, &Shape::scalar())
            .expect("sumproduct should succeed");
        let b = engine
            .sumproduct(&reversed, &Shape::scalar())
            .expect("sumproduct should succeed");
        assert_eq!(a, b);
    }

    #[test]
    fn shared_session_reuses_prefix_products() {
        let engine = NaiveSumProduct;
        let values = vec![
            Value::scalar(2.0),
            Value::vector(&[1.0, 2.0]).expect("vector should build"),
            Value::vector(&[3.0, 4.0]).expect("vector should build"),
        ];
        let all = factors(&values);
        let upstream_only = all[..2].to_vec();

        let mut session = engine.shared();
        let narrow = session
            .sumproduct(&upstream_only, &Shape::scalar())
            .expect("narrow sumproduct should succeed");
        let products_after_first = session.memo().cached_products();

        let wide = session
            .sumproduct(&all, &Shape::scalar())
            .expect("wide sumproduct should succeed");
        // The two-factor prefix was reused, so only the third factor's
        // product entry is new.
        assert_eq!(session.memo().cached_products(), products_after_first + 1);

        assert_eq!(narrow.item(), Some(2.0 * 3.0));
        assert_eq!(wide.item(), Some(2.0 * 1.0 * 3.0 + 2.0 * 2.0 * 4.0));

        // Identical query hits the finished-reduction memo.
        let again = session
            .sumproduct(&all, &Shape::scalar())
            .expect("repeat sumproduct should succeed");
        assert_eq!(again, wide);
    }

    #[test]
    fn shared_and_direct_paths_agree() {
        let engine = NaiveSumProduct;
        let values = vec![
            Value::tensor(&[2, 1], vec![0.5, 2.0]).expect("column should build"),
            Value::vector(&[1.0, 2.0, 3.0]).expect("row should build"),
        ];
        let fs = factors(&values);
        let target = Shape::of(&[2, 1]);

        let direct = engine
            .sumproduct(&fs, &target)
            .expect("direct sumproduct should succeed");
        let mut session = engine.shared();
        let shared = session
            .sumproduct(&fs, &target)
            .expect("shared sumproduct should succeed");
        assert_eq!(direct, shared);
    }
}
