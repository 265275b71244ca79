//! Affine Maps
//!
//! `(d0, ..., dn)[s0, ..., sm] -> (e0, ..., ek)`: a list of affine
//! expressions sharing one dimension/symbol space.

use super::expr::{AffineExpr, Flattener, LinearForm, NotAffine};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffineMap {
    pub num_dims: u32,
    pub num_symbols: u32,
    pub results: Vec<AffineExpr>,
}

impl AffineMap {
    pub fn new(num_dims: u32, num_symbols: u32, results: Vec<AffineExpr>) -> Self {
        Self {
            num_dims,
            num_symbols,
            results,
        }
    }

    /// `(d0, ..., d{n-1}) -> (d0, ..., d{n-1})`
    pub fn identity(num_dims: u32) -> Self {
        Self::new(num_dims, 0, (0..num_dims).map(AffineExpr::Dim).collect())
    }

    /// `() -> (value)`
    pub fn constant(value: i64) -> Self {
        Self::new(0, 0, vec![AffineExpr::Constant(value)])
    }

    /// A map with no inputs and no results.
    pub fn empty() -> Self {
        Self::new(0, 0, Vec::new())
    }

    pub fn num_inputs(&self) -> usize {
        (self.num_dims + self.num_symbols) as usize
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    pub fn is_identity(&self) -> bool {
        self.num_symbols == 0
            && self.results.len() == self.num_dims as usize
            && self
                .results
                .iter()
                .enumerate()
                .all(|(i, e)| *e == AffineExpr::Dim(i as u32))
    }

    /// Constant value of a single-result constant map.
    pub fn single_constant_result(&self) -> Option<i64> {
        match self.constant_results()?.as_slice() {
            [c] => Some(*c),
            _ => None,
        }
    }

    /// Values of every result when all of them are constant.
    pub fn constant_results(&self) -> Option<Vec<i64>> {
        self.results.iter().map(AffineExpr::as_constant).collect()
    }

    pub fn is_pure_affine(&self) -> bool {
        self.results.iter().all(AffineExpr::is_pure_affine)
    }

    /// `self ∘ other`: feed the results of `other` into the dimensions of
    /// `self`. The composed map takes `other`'s dimensions, and its symbols
    /// are `other`'s symbols followed by `self`'s.
    pub fn compose(&self, other: &AffineMap) -> AffineMap {
        debug_assert_eq!(self.num_dims as usize, other.results.len());
        let symbols: Vec<AffineExpr> = (0..self.num_symbols)
            .map(|s| AffineExpr::Symbol(other.num_symbols + s))
            .collect();
        let results = self
            .results
            .iter()
            .map(|e| e.replace_dims_and_symbols(&other.results, &symbols).simplify())
            .collect();
        AffineMap::new(other.num_dims, other.num_symbols + self.num_symbols, results)
    }

    /// Substitute dimensions and symbols, producing a map with the given
    /// input counts.
    pub fn replace_dims_and_symbols(
        &self,
        dims: &[AffineExpr],
        symbols: &[AffineExpr],
        num_dims: u32,
        num_symbols: u32,
    ) -> AffineMap {
        let results = self
            .results
            .iter()
            .map(|e| e.replace_dims_and_symbols(dims, symbols))
            .collect();
        AffineMap::new(num_dims, num_symbols, results)
    }

    pub fn simplify(&self) -> AffineMap {
        AffineMap::new(
            self.num_dims,
            self.num_symbols,
            self.results.iter().map(AffineExpr::simplify).collect(),
        )
    }

    pub fn eval(&self, dims: &[i64], symbols: &[i64]) -> Option<Vec<i64>> {
        self.results.iter().map(|e| e.eval(dims, symbols)).collect()
    }

    /// Keep only the result at `index`.
    pub fn sub_map(&self, index: usize) -> AffineMap {
        AffineMap::new(self.num_dims, self.num_symbols, vec![self.results[index].clone()])
    }

    /// Flatten every result with a shared set of local divisions.
    pub fn flatten(&self) -> Result<(Vec<LinearForm>, Flattener), NotAffine> {
        let mut flattener = Flattener::new(self.num_dims as usize, self.num_symbols as usize);
        let forms = self
            .results
            .iter()
            .map(|e| flattener.flatten(e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((forms, flattener))
    }
}

impl fmt::Display for AffineMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for d in 0..self.num_dims {
            if d > 0 {
                write!(f, ", ")?;
            }
            write!(f, "d{}", d)?;
        }
        write!(f, ")")?;
        if self.num_symbols > 0 {
            write!(f, "[")?;
            for s in 0..self.num_symbols {
                if s > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "s{}", s)?;
            }
            write!(f, "]")?;
        }
        write!(f, " -> (")?;
        for (i, e) in self.results.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(i: u32) -> AffineExpr {
        AffineExpr::dim(i)
    }

    fn s(i: u32) -> AffineExpr {
        AffineExpr::symbol(i)
    }

    #[test]
    fn test_identity_and_display() {
        let map = AffineMap::identity(2);
        assert!(map.is_identity());
        assert_eq!(map.to_string(), "(d0, d1) -> (d0, d1)");
        let shifted = AffineMap::new(1, 1, vec![d(0) + s(0)]);
        assert!(!shifted.is_identity());
        assert_eq!(shifted.to_string(), "(d0)[s0] -> (d0 + s0)");
    }

    #[test]
    fn test_compose() {
        // (d0)[s0] -> (d0 + s0) composed with (d0, d1) -> (d0 * 2 + d1)
        let outer = AffineMap::new(1, 1, vec![d(0) + s(0)]);
        let inner = AffineMap::new(2, 0, vec![d(0) * 2 + d(1)]);
        let composed = outer.compose(&inner);
        assert_eq!(composed.num_dims, 2);
        assert_eq!(composed.num_symbols, 1);
        assert_eq!(composed.results[0], d(0) * 2 + d(1) + s(0));
        assert_eq!(composed.eval(&[3, 4], &[5]), Some(vec![15]));
    }

    #[test]
    fn test_constant_map() {
        let map = AffineMap::constant(42);
        assert_eq!(map.single_constant_result(), Some(42));
        assert_eq!(map.eval(&[], &[]), Some(vec![42]));
        let pair = AffineMap::new(0, 0, vec![AffineExpr::constant(3), AffineExpr::constant(7)]);
        assert_eq!(pair.constant_results(), Some(vec![3, 7]));
        assert_eq!(AffineMap::identity(1).constant_results(), None);
    }
}
