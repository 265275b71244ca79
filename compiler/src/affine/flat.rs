//! Flat Affine Constraints
//!
//! A conjunction of linear equalities (`row · [vars, 1] == 0`) and
//! inequalities (`row · [vars, 1] >= 0`) over integer variables. Variables
//! are tagged as dimensions, symbols or locals (division results), and can
//! optionally be attached to an IR value so that independent systems can be
//! merged by value identity.
//!
//! Projection uses Gaussian elimination when an equality mentions the
//! variable and Fourier-Motzkin elimination otherwise. Fourier-Motzkin works
//! over the rationals, so emptiness is proven only when the rational shadow
//! (after GCD tightening) is empty; "not provably empty" is the conservative
//! answer everywhere this is used.

use super::expr::{floor_div, gcd, Flattener, LinearForm};
use super::set::IntegerSet;
use crate::ir::ValueId;
use log::trace;

/// Cap on inequalities produced by one Fourier-Motzkin step. Past the cap
/// rows are dropped, which only relaxes the system.
const MAX_FM_ROWS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKind {
    Dim,
    Symbol,
    Local,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatAffineConstraints {
    kinds: Vec<VarKind>,
    ids: Vec<Option<ValueId>>,
    equalities: Vec<Vec<i64>>,
    inequalities: Vec<Vec<i64>>,
}

impl FlatAffineConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// A system with `num_dims` dimensions followed by `num_symbols` symbols.
    pub fn with_vars(num_dims: usize, num_symbols: usize) -> Self {
        let mut cst = Self::new();
        for _ in 0..num_dims {
            cst.append_var(VarKind::Dim, None);
        }
        for _ in 0..num_symbols {
            cst.append_var(VarKind::Symbol, None);
        }
        cst
    }

    /// Build the system of an integer set. Division locals introduced by
    /// the set's constraints become local variables.
    pub fn from_set(set: &IntegerSet) -> Option<Self> {
        let mut cst = Self::with_vars(set.num_dims as usize, set.num_symbols as usize);
        let dim_vars: Vec<usize> = (0..set.num_dims as usize).collect();
        let sym_vars: Vec<usize> = (set.num_dims as usize..cst.num_vars()).collect();
        let mut flattener = Flattener::new(set.num_dims as usize, set.num_symbols as usize);
        let forms = set
            .constraints
            .iter()
            .map(|e| flattener.flatten(e))
            .collect::<Result<Vec<_>, _>>()
            .ok()?;
        let local_vars = cst.add_local_divs(&flattener, &dim_vars, &sym_vars);
        for (form, &is_eq) in forms.iter().zip(&set.eq_flags) {
            let row = cst.form_to_row(form, &dim_vars, &sym_vars, &local_vars);
            if is_eq {
                cst.add_equality(row);
            } else {
                cst.add_inequality(row);
            }
        }
        Some(cst)
    }

    pub fn num_vars(&self) -> usize {
        self.kinds.len()
    }

    pub fn num_dims(&self) -> usize {
        self.count(VarKind::Dim)
    }

    pub fn num_symbols(&self) -> usize {
        self.count(VarKind::Symbol)
    }

    pub fn num_locals(&self) -> usize {
        self.count(VarKind::Local)
    }

    fn count(&self, kind: VarKind) -> usize {
        self.kinds.iter().filter(|&&k| k == kind).count()
    }

    pub fn kind(&self, pos: usize) -> VarKind {
        self.kinds[pos]
    }

    pub fn id(&self, pos: usize) -> Option<ValueId> {
        self.ids[pos]
    }

    pub fn set_id(&mut self, pos: usize, id: Option<ValueId>) {
        self.ids[pos] = id;
    }

    pub fn equalities(&self) -> &[Vec<i64>] {
        &self.equalities
    }

    pub fn inequalities(&self) -> &[Vec<i64>] {
        &self.inequalities
    }

    /// Position of the variable attached to `id`.
    pub fn find_var(&self, id: ValueId) -> Option<usize> {
        self.ids.iter().position(|&v| v == Some(id))
    }

    /// Append a variable and return its position.
    pub fn append_var(&mut self, kind: VarKind, id: Option<ValueId>) -> usize {
        let pos = self.num_vars();
        self.insert_var(pos, kind, id);
        pos
    }

    /// Insert a variable column at `pos`, shifting later variables.
    pub fn insert_var(&mut self, pos: usize, kind: VarKind, id: Option<ValueId>) {
        self.kinds.insert(pos, kind);
        self.ids.insert(pos, id);
        for row in self.equalities.iter_mut().chain(self.inequalities.iter_mut()) {
            row.insert(pos, 0);
        }
    }

    /// Drop a variable column without eliminating it. Only valid when no
    /// constraint mentions the variable, or when the caller wants the
    /// variable treated as zero.
    pub fn remove_var(&mut self, pos: usize) {
        self.kinds.remove(pos);
        self.ids.remove(pos);
        for row in self.equalities.iter_mut().chain(self.inequalities.iter_mut()) {
            row.remove(pos);
        }
    }

    pub fn add_equality(&mut self, row: Vec<i64>) {
        debug_assert_eq!(row.len(), self.num_vars() + 1);
        self.equalities.push(row);
    }

    pub fn add_inequality(&mut self, row: Vec<i64>) {
        debug_assert_eq!(row.len(), self.num_vars() + 1);
        self.inequalities.push(row);
    }

    /// Remove the first inequality equal to `row`.
    pub fn remove_inequality(&mut self, row: &[i64]) -> bool {
        match self.inequalities.iter().position(|r| r.as_slice() == row) {
            Some(index) => {
                self.inequalities.remove(index);
                true
            }
            None => false,
        }
    }

    /// Widen a row built when the system had `width` variables to the
    /// current variable count. Variables are only ever appended, so the new
    /// columns are zero.
    pub fn pad_row(&self, mut row: Vec<i64>, width: usize) -> Vec<i64> {
        let n = self.num_vars();
        if width < n {
            let constant = row[width];
            row.truncate(width);
            row.resize(n, 0);
            row.push(constant);
        }
        row
    }

    /// `var >= value`
    pub fn add_lower_bound(&mut self, pos: usize, value: i64) {
        let mut row = vec![0; self.num_vars() + 1];
        row[pos] = 1;
        row[self.num_vars()] = -value;
        self.add_inequality(row);
    }

    /// `var <= value`
    pub fn add_upper_bound(&mut self, pos: usize, value: i64) {
        let mut row = vec![0; self.num_vars() + 1];
        row[pos] = -1;
        row[self.num_vars()] = value;
        self.add_inequality(row);
    }

    /// Append one local variable per division of `flattener`, constrained by
    /// `divisor * q <= numerator <= divisor * q + divisor - 1`. Returns the
    /// positions of the new locals in flattener order.
    pub fn add_local_divs(&mut self, flattener: &Flattener, dim_vars: &[usize], sym_vars: &[usize]) -> Vec<usize> {
        let mut local_vars = Vec::with_capacity(flattener.locals.len());
        for local in &flattener.locals {
            let q = self.append_var(VarKind::Local, None);
            let numerator = self.form_to_row(&local.numerator, dim_vars, sym_vars, &local_vars);
            let mut lower = numerator.clone();
            lower[q] -= local.divisor;
            self.add_inequality(lower);
            let mut upper: Vec<i64> = numerator.iter().map(|c| -c).collect();
            upper[q] += local.divisor;
            let last = upper.len() - 1;
            upper[last] += local.divisor - 1;
            self.add_inequality(upper);
            local_vars.push(q);
        }
        local_vars
    }

    /// Translate a linear form into a row of this system, mapping dimension,
    /// symbol and local positions through the given tables.
    pub fn form_to_row(&self, form: &LinearForm, dim_vars: &[usize], sym_vars: &[usize], local_vars: &[usize]) -> Vec<i64> {
        let mut row = vec![0; self.num_vars() + 1];
        for (d, &c) in form.dims.iter().enumerate() {
            if c != 0 {
                row[dim_vars[d]] += c;
            }
        }
        for (s, &c) in form.symbols.iter().enumerate() {
            if c != 0 {
                row[sym_vars[s]] += c;
            }
        }
        for (l, &c) in form.locals.iter().enumerate() {
            if c != 0 {
                row[local_vars[l]] += c;
            }
        }
        row[self.num_vars()] += form.constant;
        row
    }

    /// Append all variables and constraints of `other`, unifying variables
    /// that carry the same value id. Returns the position of each of
    /// `other`'s variables in `self`.
    pub fn merge(&mut self, other: &FlatAffineConstraints) -> Vec<usize> {
        let mut positions = Vec::with_capacity(other.num_vars());
        for pos in 0..other.num_vars() {
            let existing = other.ids[pos].and_then(|id| self.find_var(id));
            positions.push(match existing {
                Some(p) => p,
                None => self.append_var(other.kinds[pos], other.ids[pos]),
            });
        }
        let remap = |row: &Vec<i64>, n: usize| {
            let mut out = vec![0; n + 1];
            for (i, &c) in row[..row.len() - 1].iter().enumerate() {
                out[positions[i]] += c;
            }
            out[n] = row[row.len() - 1];
            out
        };
        let n = self.num_vars();
        let eqs: Vec<_> = other.equalities.iter().map(|r| remap(r, n)).collect();
        let ineqs: Vec<_> = other.inequalities.iter().map(|r| remap(r, n)).collect();
        self.equalities.extend(eqs);
        self.inequalities.extend(ineqs);
        positions
    }

    // ------------------------------------------------------------------------
    // Normalization
    // ------------------------------------------------------------------------

    /// Divide rows by the GCD of their variable coefficients, tightening the
    /// constant of inequalities. Constant-true rows are dropped; a
    /// constant-false row is replaced by the canonical `-1 >= 0`.
    pub fn normalize(&mut self) {
        let n = self.num_vars();
        let mut infeasible = false;
        self.equalities.retain_mut(|row| {
            let g = row[..n].iter().fold(0, |g, &c| gcd(g, c));
            if g == 0 {
                infeasible |= row[n] != 0;
                return false;
            }
            if row[n] % g != 0 {
                infeasible = true;
                return false;
            }
            row.iter_mut().for_each(|c| *c /= g);
            // Canonical sign: first nonzero coefficient positive.
            if row[..n].iter().find(|&&c| c != 0).is_some_and(|&c| c < 0) {
                row.iter_mut().for_each(|c| *c = -*c);
            }
            true
        });
        self.inequalities.retain_mut(|row| {
            let g = row[..n].iter().fold(0, |g, &c| gcd(g, c));
            if g == 0 {
                infeasible |= row[n] < 0;
                return false;
            }
            if g > 1 {
                for c in row[..n].iter_mut() {
                    *c /= g;
                }
                row[n] = floor_div(row[n], g);
            }
            true
        });
        if infeasible {
            let mut row = vec![0; n + 1];
            row[n] = -1;
            self.inequalities.push(row);
        }
    }

    /// Normalize and remove duplicate rows. Pairs of opposite inequalities
    /// `e >= 0` and `-e >= 0` are merged into the equality `e == 0`.
    pub fn remove_duplicates(&mut self) {
        self.normalize();
        let n = self.num_vars();
        let mut seen = fxhash::FxHashSet::default();
        self.equalities.retain(|row| seen.insert(row.clone()));
        let mut seen = fxhash::FxHashSet::default();
        self.inequalities.retain(|row| seen.insert(row.clone()));

        let mut promoted = Vec::new();
        let mut i = 0;
        while i < self.inequalities.len() {
            let negated: Vec<i64> = self.inequalities[i].iter().map(|c| -c).collect();
            if let Some(j) = self.inequalities.iter().position(|r| *r == negated) {
                if j > i {
                    promoted.push(self.inequalities[i].clone());
                    self.inequalities.remove(j);
                    self.inequalities.remove(i);
                    continue;
                }
            }
            i += 1;
        }
        if !promoted.is_empty() {
            self.equalities.extend(promoted);
            self.normalize();
            let mut seen = fxhash::FxHashSet::default();
            self.equalities.retain(|row| seen.insert(row.clone()));
        }
        debug_assert!(self.inequalities.iter().all(|r| r.len() == n + 1));
    }

    /// True if some constraint is constant and false.
    pub fn has_invalid_constraint(&self) -> bool {
        let n = self.num_vars();
        self.equalities
            .iter()
            .any(|r| r[..n].iter().all(|&c| c == 0) && r[n] != 0)
            || self
                .inequalities
                .iter()
                .any(|r| r[..n].iter().all(|&c| c == 0) && r[n] < 0)
    }

    // ------------------------------------------------------------------------
    // Elimination
    // ------------------------------------------------------------------------

    /// Eliminate the variable at `pos` and remove its column.
    pub fn eliminate(&mut self, pos: usize) {
        let n = self.num_vars();
        if let Some(eq_index) = self.equalities.iter().position(|r| r[pos] != 0) {
            let pivot = self.equalities.remove(eq_index);
            let a = pivot[pos];
            let substitute = |row: Vec<i64>| -> Option<Vec<i64>> {
                let b = row[pos];
                if b == 0 {
                    return Some(row);
                }
                let combined = (0..=n).map(|k| {
                    let scaled = row[k].checked_mul(a.abs())?;
                    let offset = pivot[k].checked_mul(b)?.checked_mul(a.signum())?;
                    scaled.checked_sub(offset)
                });
                let combined: Option<Vec<i64>> = combined.collect();
                if combined.is_none() {
                    trace!("coefficient overflow during substitution, dropping row");
                }
                combined
            };
            self.equalities = std::mem::take(&mut self.equalities)
                .into_iter()
                .filter_map(substitute)
                .collect();
            self.inequalities = std::mem::take(&mut self.inequalities)
                .into_iter()
                .filter_map(substitute)
                .collect();
        } else {
            let mut lowers = Vec::new();
            let mut uppers = Vec::new();
            let mut rest = Vec::new();
            for row in self.inequalities.drain(..) {
                match row[pos].signum() {
                    1 => lowers.push(row),
                    -1 => uppers.push(row),
                    _ => rest.push(row),
                }
            }
            'combine: for l in &lowers {
                for u in &uppers {
                    if rest.len() >= MAX_FM_ROWS {
                        trace!("Fourier-Motzkin row cap reached, relaxing system");
                        break 'combine;
                    }
                    let (a, b) = (l[pos], -u[pos]);
                    let row: Option<Vec<i64>> = (0..=n)
                        .map(|k| l[k].checked_mul(b)?.checked_add(u[k].checked_mul(a)?))
                        .collect();
                    match row {
                        Some(row) => rest.push(row),
                        None => trace!("coefficient overflow in Fourier-Motzkin, dropping row"),
                    }
                }
            }
            self.inequalities = rest;
        }
        self.remove_var(pos);
        self.remove_duplicates();
    }

    /// Eliminate every variable whose position satisfies `pred`.
    pub fn project_out_where(&mut self, mut pred: impl FnMut(usize, VarKind, Option<ValueId>) -> bool) {
        let positions: Vec<usize> = (0..self.num_vars())
            .filter(|&p| pred(p, self.kinds[p], self.ids[p]))
            .collect();
        for &pos in positions.iter().rev() {
            self.eliminate(pos);
        }
    }

    /// Eliminate the variables at the given positions.
    pub fn project_out(&mut self, positions: &[usize]) {
        let mut sorted = positions.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        for &pos in sorted.iter().rev() {
            self.eliminate(pos);
        }
    }

    /// Whether the system is provably free of integer solutions.
    pub fn is_empty(&self) -> bool {
        let mut cst = self.clone();
        cst.remove_duplicates();
        if cst.has_invalid_constraint() {
            return true;
        }
        while cst.num_vars() > 0 {
            let pos = cst.best_elimination_candidate();
            cst.eliminate(pos);
            if cst.has_invalid_constraint() {
                return true;
            }
        }
        false
    }

    /// Prefer variables with an equality, then the one producing the fewest
    /// Fourier-Motzkin combinations.
    fn best_elimination_candidate(&self) -> usize {
        if let Some(pos) = (0..self.num_vars()).find(|&p| self.equalities.iter().any(|r| r[p] != 0)) {
            return pos;
        }
        (0..self.num_vars())
            .min_by_key(|&p| {
                let lowers = self.inequalities.iter().filter(|r| r[p] > 0).count();
                let uppers = self.inequalities.iter().filter(|r| r[p] < 0).count();
                lowers * uppers
            })
            .unwrap_or(0)
    }

    fn project_onto(&self, pos: usize) -> FlatAffineConstraints {
        let mut cst = self.clone();
        let others: Vec<usize> = (0..cst.num_vars()).filter(|&p| p != pos).collect();
        cst.project_out(&others);
        cst
    }

    /// Smallest value the variable can take, if bounded below.
    pub fn constant_lower_bound(&self, pos: usize) -> Option<i64> {
        let cst = self.project_onto(pos);
        if let Some(row) = cst.equalities.iter().find(|r| r[0] != 0) {
            return (row[1] % row[0] == 0).then(|| -row[1] / row[0]);
        }
        cst.inequalities
            .iter()
            .filter(|r| r[0] > 0)
            .map(|r| -floor_div(r[1], r[0]))
            .max()
    }

    /// Largest value the variable can take, if bounded above.
    pub fn constant_upper_bound(&self, pos: usize) -> Option<i64> {
        let cst = self.project_onto(pos);
        if let Some(row) = cst.equalities.iter().find(|r| r[0] != 0) {
            return (row[1] % row[0] == 0).then(|| -row[1] / row[0]);
        }
        cst.inequalities
            .iter()
            .filter(|r| r[0] < 0)
            .map(|r| floor_div(r[1], -r[0]))
            .min()
    }

    /// Remove every inequality implied by the remaining constraints.
    pub fn remove_redundant_inequalities(&mut self) {
        let n = self.num_vars();
        let mut i = self.inequalities.len();
        while i > 0 {
            i -= 1;
            let mut trial = self.clone();
            let row = trial.inequalities.remove(i);
            let mut negated: Vec<i64> = row.iter().map(|c| -c).collect();
            negated[n] -= 1;
            trial.inequalities.push(negated);
            if trial.is_empty() {
                self.inequalities.remove(i);
            }
        }
    }

    /// Rows of inequalities (and equalities, as two opposite bounds) that
    /// bound the variable at `pos` from below and above.
    pub fn bound_rows(&self, pos: usize) -> (Vec<Vec<i64>>, Vec<Vec<i64>>) {
        let mut lowers = Vec::new();
        let mut uppers = Vec::new();
        for row in &self.inequalities {
            match row[pos].signum() {
                1 => lowers.push(row.clone()),
                -1 => uppers.push(row.clone()),
                _ => {}
            }
        }
        for row in &self.equalities {
            if row[pos] != 0 {
                let negated: Vec<i64> = row.iter().map(|c| -c).collect();
                if row[pos] > 0 {
                    lowers.push(row.clone());
                    uppers.push(negated);
                } else {
                    uppers.push(row.clone());
                    lowers.push(negated);
                }
            }
        }
        (lowers, uppers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_by_bounds() {
        let mut cst = FlatAffineConstraints::with_vars(1, 0);
        cst.add_lower_bound(0, 5);
        cst.add_upper_bound(0, 4);
        assert!(cst.is_empty());
    }

    #[test]
    fn test_empty_by_gcd() {
        // 2 * x == 1
        let mut cst = FlatAffineConstraints::with_vars(1, 0);
        cst.add_equality(vec![2, -1]);
        assert!(cst.is_empty());
    }

    #[test]
    fn test_gcd_tightening_proves_emptiness() {
        // 1 <= 2x <= 1 has no integer solution
        let mut cst = FlatAffineConstraints::with_vars(1, 0);
        cst.add_inequality(vec![2, -1]);
        cst.add_inequality(vec![-2, 1]);
        assert!(cst.is_empty());
    }

    #[test]
    fn test_projection_bounds() {
        // 0 <= i < 10, j == i + 3  =>  3 <= j <= 12
        let mut cst = FlatAffineConstraints::with_vars(2, 0);
        cst.add_lower_bound(0, 0);
        cst.add_upper_bound(0, 9);
        cst.add_equality(vec![1, -1, 3]);
        assert_eq!(cst.constant_lower_bound(1), Some(3));
        assert_eq!(cst.constant_upper_bound(1), Some(12));
        assert!(!cst.is_empty());
    }

    #[test]
    fn test_fourier_motzkin() {
        // 0 <= i <= 7, 0 <= j <= i  =>  0 <= j <= 7
        let mut cst = FlatAffineConstraints::with_vars(2, 0);
        cst.add_lower_bound(0, 0);
        cst.add_upper_bound(0, 7);
        cst.add_lower_bound(1, 0);
        cst.add_inequality(vec![1, -1, 0]);
        cst.project_out(&[0]);
        assert_eq!(cst.num_vars(), 1);
        assert_eq!(cst.constant_lower_bound(0), Some(0));
        assert_eq!(cst.constant_upper_bound(0), Some(7));
    }

    #[test]
    fn test_coefficient_overflow_relaxes_system() {
        let big = (1i64 << 40) + 1;

        // big * x >= y, big * x <= y - 1: combining the two overflows i64.
        let mut cst = FlatAffineConstraints::with_vars(2, 0);
        cst.add_inequality(vec![big, -1, 0]);
        cst.add_inequality(vec![-big, 1, -1]);
        cst.project_out(&[0]);
        assert_eq!(cst.num_vars(), 1);
        assert!(cst.inequalities().is_empty());
        assert_eq!(cst.constant_upper_bound(0), None);

        // big * x == y with big * x <= y - 1: the substitution overflows too.
        let mut cst = FlatAffineConstraints::with_vars(2, 0);
        cst.add_equality(vec![big, -1, 0]);
        cst.add_inequality(vec![-big, 1, -1]);
        cst.project_out(&[0]);
        assert_eq!(cst.num_vars(), 1);
        assert!(cst.inequalities().is_empty());
    }

    #[test]
    fn test_redundant_inequalities() {
        let mut cst = FlatAffineConstraints::with_vars(1, 0);
        cst.add_lower_bound(0, 0);
        cst.add_lower_bound(0, -5);
        cst.add_upper_bound(0, 10);
        cst.remove_redundant_inequalities();
        assert_eq!(cst.inequalities().len(), 2);
        assert_eq!(cst.constant_lower_bound(0), Some(0));
    }

    #[test]
    fn test_merge_by_value_id() {
        let mut a = FlatAffineConstraints::new();
        let x = a.append_var(VarKind::Dim, Some(ValueId(7)));
        a.add_lower_bound(x, 2);
        let mut b = FlatAffineConstraints::new();
        let y = b.append_var(VarKind::Dim, Some(ValueId(7)));
        b.add_upper_bound(y, 1);
        let positions = a.merge(&b);
        assert_eq!(positions, vec![x]);
        assert_eq!(a.num_vars(), 1);
        assert!(a.is_empty());
    }
}
