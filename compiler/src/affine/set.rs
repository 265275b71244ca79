//! Integer Sets
//!
//! `(d0, ...)[s0, ...] : (e0 >= 0, e1 == 0, ...)`

use super::expr::{gcd, AffineExpr, Flattener};
use super::flat::FlatAffineConstraints;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntegerSet {
    pub num_dims: u32,
    pub num_symbols: u32,
    pub constraints: Vec<AffineExpr>,
    /// `true` marks `constraints[i] == 0`, `false` marks `constraints[i] >= 0`.
    pub eq_flags: Vec<bool>,
}

impl IntegerSet {
    pub fn new(num_dims: u32, num_symbols: u32, constraints: Vec<AffineExpr>, eq_flags: Vec<bool>) -> Self {
        debug_assert_eq!(constraints.len(), eq_flags.len());
        Self {
            num_dims,
            num_symbols,
            constraints,
            eq_flags,
        }
    }

    /// The canonical empty set `1 == 0`.
    pub fn empty(num_dims: u32, num_symbols: u32) -> Self {
        Self::new(num_dims, num_symbols, vec![AffineExpr::Constant(1)], vec![true])
    }

    /// The set with no constraints.
    pub fn universe(num_dims: u32, num_symbols: u32) -> Self {
        Self::new(num_dims, num_symbols, Vec::new(), Vec::new())
    }

    pub fn is_universe(&self) -> bool {
        self.constraints.is_empty()
    }

    /// True for a set containing a constant-false constraint.
    pub fn is_trivially_empty(&self) -> bool {
        self.constraints
            .iter()
            .zip(&self.eq_flags)
            .any(|(e, &is_eq)| match e.as_constant() {
                Some(c) if is_eq => c != 0,
                Some(c) => c < 0,
                None => false,
            })
    }

    pub fn contains(&self, dims: &[i64], symbols: &[i64]) -> Option<bool> {
        for (e, &is_eq) in self.constraints.iter().zip(&self.eq_flags) {
            let v = e.eval(dims, symbols)?;
            if (is_eq && v != 0) || (!is_eq && v < 0) {
                return Some(false);
            }
        }
        Some(true)
    }

    /// Simplify every constraint, drop trivially-true ones, tighten and
    /// deduplicate the rest. A set that is provably empty collapses to the
    /// canonical empty set. When no constraint needs division locals,
    /// inequalities implied by the others are removed as well.
    pub fn simplify(&self) -> IntegerSet {
        let mut constraints = Vec::new();
        let mut eq_flags = Vec::new();
        for (e, &is_eq) in self.constraints.iter().zip(&self.eq_flags) {
            let simplified = e.simplify();
            match simplified.as_constant() {
                Some(c) if (is_eq && c == 0) || (!is_eq && c >= 0) => continue,
                Some(_) => return IntegerSet::empty(self.num_dims, self.num_symbols),
                None => {}
            }
            let normalized = normalize_constraint(simplified, is_eq, self.num_dims, self.num_symbols);
            if !constraints.iter().zip(&eq_flags).any(|(c, &f)| *c == normalized && f == is_eq) {
                constraints.push(normalized);
                eq_flags.push(is_eq);
            }
        }
        let set = IntegerSet::new(self.num_dims, self.num_symbols, constraints, eq_flags);
        if set.is_trivially_empty() {
            return IntegerSet::empty(self.num_dims, self.num_symbols);
        }

        let Some(cst) = FlatAffineConstraints::from_set(&set) else {
            return set;
        };
        if cst.is_empty() {
            return IntegerSet::empty(self.num_dims, self.num_symbols);
        }
        if cst.num_locals() > 0 || set.eq_flags.iter().any(|&f| f) {
            return set;
        }
        // Every constraint maps to one inequality row, in order.
        let mut kept = Vec::new();
        let mut trial_base = cst.clone();
        let n = cst.num_vars();
        for i in (0..set.constraints.len()).rev() {
            let row = cst.inequalities()[i].clone();
            let mut trial = trial_base.clone();
            trial.remove_inequality(&row);
            let mut negated: Vec<i64> = row.iter().map(|c| -c).collect();
            negated[n] -= 1;
            trial.add_inequality(negated);
            if trial.is_empty() {
                trial_base.remove_inequality(&row);
            } else {
                kept.push(i);
            }
        }
        kept.reverse();
        IntegerSet::new(
            self.num_dims,
            self.num_symbols,
            kept.iter().map(|&i| set.constraints[i].clone()).collect(),
            vec![false; kept.len()],
        )
    }
}

/// Divide a constraint by the GCD of its variable coefficients. For an
/// inequality the constant is floored, which tightens it over the integers.
fn normalize_constraint(expr: AffineExpr, is_eq: bool, num_dims: u32, num_symbols: u32) -> AffineExpr {
    let mut flattener = Flattener::new(num_dims as usize, num_symbols as usize);
    let Ok(form) = flattener.flatten(&expr) else {
        return expr;
    };
    let g = form
        .dims
        .iter()
        .chain(&form.symbols)
        .chain(&form.locals)
        .fold(0, |g, &c| gcd(g, c));
    if g <= 1 || (is_eq && form.constant % g != 0) {
        return flattener.rebuild(&form);
    }
    let mut scaled = form.clone();
    for c in scaled.dims.iter_mut().chain(scaled.symbols.iter_mut()).chain(scaled.locals.iter_mut()) {
        *c /= g;
    }
    scaled.constant = super::expr::floor_div(form.constant, g);
    flattener.rebuild(&scaled)
}

impl fmt::Display for IntegerSet {
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
        write!(f, " : (")?;
        for (i, (e, &is_eq)) in self.constraints.iter().zip(&self.eq_flags).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {} 0", e, if is_eq { "==" } else { ">=" })?;
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

    #[test]
    fn test_constant_constraints() {
        let set = IntegerSet::new(1, 0, vec![AffineExpr::Constant(3), d(0)], vec![false, false]);
        assert_eq!(set.simplify().constraints, vec![d(0)]);
        let empty = IntegerSet::new(1, 0, vec![AffineExpr::Constant(-1), d(0)], vec![false, false]);
        assert_eq!(empty.simplify(), IntegerSet::empty(1, 0));
    }

    #[test]
    fn test_contradiction_collapses_to_empty() {
        // d0 - 10 >= 0 and 5 - d0 >= 0
        let set = IntegerSet::new(1, 0, vec![d(0) - 10, -d(0) + 5], vec![false, false]);
        assert_eq!(set.simplify(), IntegerSet::empty(1, 0));
    }

    #[test]
    fn test_redundant_constraint_removed() {
        // d0 >= 0, d0 - 3 >= 0, 10 - d0 >= 0  =>  d0 - 3 >= 0, 10 - d0 >= 0
        let set = IntegerSet::new(1, 0, vec![d(0), d(0) - 3, -d(0) + 10], vec![false, false, false]);
        let simplified = set.simplify();
        assert_eq!(simplified.constraints.len(), 2);
        assert_eq!(simplified.contains(&[3], &[]), Some(true));
        assert_eq!(simplified.contains(&[2], &[]), Some(false));
        assert_eq!(simplified.simplify(), simplified);
    }

    #[test]
    fn test_gcd_normalization() {
        // 2 * d0 - 3 >= 0  =>  d0 - 2 >= 0
        let set = IntegerSet::new(1, 0, vec![d(0) * 2 - 3], vec![false]);
        assert_eq!(set.simplify().constraints, vec![d(0) - 2]);
        assert_eq!(set.simplify().to_string(), "(d0) : (d0 - 2 >= 0)");
    }
}
