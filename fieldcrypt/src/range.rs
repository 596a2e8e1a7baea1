//! Binary-trie decomposition behind range-queryable fields.
//!
//! Values of a range field are mapped to offsets in `[0, max - min]` and
//! viewed as leaves of a binary trie of depth `bits`. A stored value
//! carries one edge per indexed trie level (its ancestors); a query
//! `[lo, hi]` becomes the minimal set of disjoint trie nodes covering the
//! interval, pushed down to indexed levels. A value lies in the interval
//! exactly when one of its edges is one of the query's nodes.
//!
//! Sparsity `s` indexes only the levels `d` with `d % s == 0` plus the leaf
//! level, trading fewer stored edges for larger queries.
//!
//! Edge tags are deterministic per data key. Equal values carry identical
//! tag sets, and two values sharing an ancestor share that tag, so the
//! store learns equality and the length of the common prefix of two
//! values (a coarse closeness), though never their order directly. Higher
//! sparsity stores fewer ancestors and so reveals less prefix structure.

use crate::error::Error;
use crate::schema::{PlaintextType, RangeSpec, MAX_SPARSITY};

/// A trie node: the top `depth` bits of an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    /// Trie level, 0 is the root
    pub depth: u32,
    /// Offset bits above the level
    pub prefix: u128,
}

/// The normalized domain of one range field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeDomain {
    min: i64,
    max: i64,
    bits: u32,
    sparsity: u32,
}

impl RangeDomain {
    /// Validates a range declaration and normalizes its bounds.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` for non-numeric types, `min > max`,
    /// sparsity outside `1..=4`, or bounds that overflow the type.
    pub fn new(path: &str, plaintext_type: PlaintextType, spec: &RangeSpec) -> Result<Self, Error> {
        if !plaintext_type.is_numeric() {
            return Err(Error::InvalidSchema(format!(
                "range queries on '{path}' need a numeric type, found {plaintext_type}"
            )));
        }
        if spec.sparsity() == 0 || spec.sparsity() > MAX_SPARSITY {
            return Err(Error::InvalidSchema(format!(
                "sparsity {} on '{path}' must be between 1 and {MAX_SPARSITY}",
                spec.sparsity()
            )));
        }
        if spec.min() > spec.max() {
            return Err(Error::InvalidSchema(format!(
                "range min {} exceeds max {} on '{path}'",
                spec.min(),
                spec.max()
            )));
        }

        let factor = plaintext_type.scale_factor();
        let overflow =
            || Error::InvalidSchema(format!("range bounds on '{path}' overflow {plaintext_type}"));
        let min = spec.min().checked_mul(factor).ok_or_else(overflow)?;
        let max = spec.max().checked_mul(factor).ok_or_else(overflow)?;
        let (type_min, type_max) = plaintext_type.normalized_bounds();
        if min < type_min || max > type_max {
            return Err(overflow());
        }

        #[allow(clippy::cast_sign_loss)]
        let span = (i128::from(max) - i128::from(min)) as u128;
        let bits = u128::BITS - span.leading_zeros();

        Ok(Self { min, max, bits, sparsity: u32::from(spec.sparsity()) })
    }

    /// Normalized inclusive lower bound.
    #[must_use]
    pub const fn min(&self) -> i64 {
        self.min
    }

    /// Normalized inclusive upper bound.
    #[must_use]
    pub const fn max(&self) -> i64 {
        self.max
    }

    /// Depth of the trie (bits needed for `max - min`).
    #[must_use]
    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// Returns `true` if the normalized value lies within the declared bounds.
    #[must_use]
    pub const fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }

    const fn is_indexed(&self, depth: u32) -> bool {
        depth % self.sparsity == 0 || depth == self.bits
    }

    #[allow(clippy::cast_sign_loss)]
    fn offset(&self, value: i64) -> u128 {
        (i128::from(value) - i128::from(self.min)) as u128
    }

    /// Edges stored for a value: its ancestor at every indexed level.
    ///
    /// The caller must have checked [`contains`](Self::contains).
    #[must_use]
    pub fn edges(&self, value: i64) -> Vec<Edge> {
        let offset = self.offset(value);
        (0..=self.bits)
            .filter(|depth| self.is_indexed(*depth))
            .map(|depth| Edge { depth, prefix: offset >> (self.bits - depth) })
            .collect()
    }

    /// Minimal set of indexed trie nodes covering `[lo, hi]` exactly.
    ///
    /// Both bounds must lie inside the domain with `lo <= hi`.
    #[must_use]
    pub fn cover(&self, lo: i64, hi: i64) -> Vec<Edge> {
        // Nothing is stored above `max`, so a query reaching it may claim the
        // rest of the trie and use fewer, higher nodes.
        let hi = if hi == self.max { (1u128 << self.bits) - 1 } else { self.offset(hi) };
        let mut out = Vec::new();
        self.cover_node(0, 0, self.offset(lo), hi, &mut out);
        out
    }

    fn cover_node(&self, depth: u32, prefix: u128, lo: u128, hi: u128, out: &mut Vec<Edge>) {
        let shift = self.bits - depth;
        let start = prefix << shift;
        let end = start + ((1u128 << shift) - 1);
        if end < lo || start > hi {
            return;
        }
        if lo <= start && end <= hi && self.is_indexed(depth) {
            out.push(Edge { depth, prefix });
            return;
        }
        // Leaves are always indexed, so a leaf never reaches this point.
        self.cover_node(depth + 1, prefix << 1, lo, hi, out);
        self.cover_node(depth + 1, (prefix << 1) | 1, lo, hi, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn domain(min: i64, max: i64, sparsity: u8) -> RangeDomain {
        RangeDomain::new("f", PlaintextType::Long, &RangeSpec::new(min, max, sparsity)).unwrap()
    }

    fn matches(d: &RangeDomain, value: i64, lo: i64, hi: i64) -> usize {
        let query: HashSet<Edge> = d.cover(lo, hi).into_iter().collect();
        d.edges(value).iter().filter(|e| query.contains(e)).count()
    }

    #[test]
    fn test_bits_for_salary_domain() {
        let d = domain(0, 10_000_000, 1);
        assert_eq!(d.bits(), 24);
        assert_eq!(d.edges(50_000).len(), 25);
    }

    #[test]
    fn test_sparsity_reduces_edges() {
        let d = domain(0, 255, 2);
        // depths 0, 2, 4, 6, 8
        assert_eq!(d.edges(17).len(), 5);
        let d = domain(0, 127, 3);
        // depths 0, 3, 6 plus leaf 7
        assert_eq!(d.edges(17).len(), 4);
    }

    #[test]
    fn test_full_domain_is_root() {
        let d = domain(-50, 50, 1);
        assert_eq!(d.cover(-50, 50), vec![Edge { depth: 0, prefix: 0 }]);
    }

    #[test]
    fn test_single_value_domain() {
        let d = domain(7, 7, 1);
        assert_eq!(d.bits(), 0);
        assert_eq!(d.edges(7), vec![Edge { depth: 0, prefix: 0 }]);
        assert_eq!(matches(&d, 7, 7, 7), 1);
    }

    #[test]
    fn test_boundaries_inclusive() {
        let d = domain(0, 10_000_000, 1);
        for (value, expected) in [(50, 0), (100, 1), (150, 1), (200, 1), (250, 0)] {
            assert_eq!(matches(&d, value, 100, 200), expected, "value {value}");
        }
    }

    #[test]
    fn test_extreme_domain() {
        let d = domain(i64::MIN, i64::MAX, 4);
        assert_eq!(d.bits(), 64);
        assert_eq!(matches(&d, 0, -1, 1), 1);
        assert_eq!(matches(&d, i64::MAX, i64::MAX, i64::MAX), 1);
        assert_eq!(matches(&d, i64::MIN, i64::MIN + 1, 0), 0);
    }

    #[test]
    fn test_money_bounds_normalized() {
        let spec = RangeSpec::new(0, 1_000, 1);
        let d = RangeDomain::new("f", PlaintextType::Money { scale: 2 }, &spec).unwrap();
        assert_eq!(d.max(), 100_000);
    }

    #[test]
    fn test_int_bounds_must_fit() {
        let spec = RangeSpec::new(0, i64::from(i32::MAX) + 1, 1);
        let result = RangeDomain::new("f", PlaintextType::Int, &spec);
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_money_overflow_rejected() {
        let spec = RangeSpec::new(0, i64::MAX / 10, 1);
        let result = RangeDomain::new("f", PlaintextType::Money { scale: 2 }, &spec);
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    proptest! {
        #[test]
        fn prop_cover_matches_exactly_once_inside(
            min in -1_000i64..1_000,
            width in 0i64..5_000,
            sparsity in 1u8..=4,
            a in 0i64..5_000,
            b in 0i64..5_000,
            v in 0i64..5_000,
        ) {
            let max = min + width;
            let d = domain(min, max, sparsity);
            let (lo, hi) = {
                let x = min + a % (width + 1);
                let y = min + b % (width + 1);
                (x.min(y), x.max(y))
            };
            let value = min + v % (width + 1);

            let expected = usize::from(lo <= value && value <= hi);
            prop_assert_eq!(matches(&d, value, lo, hi), expected);
        }
    }
}
