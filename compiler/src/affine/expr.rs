//! Affine Expressions
//!
//! An affine expression is a function of loop dimensions (`d0, d1, ...`) and
//! outer-scope symbols (`s0, s1, ...`) built from integer constants, addition,
//! multiplication by a constant, and floor/ceil division or modulo by a
//! positive constant.
//!
//! Expressions are stored as a small tree. The binary constructors perform
//! local folding (constants to the right, `x + 0`, `x * 1`, constant
//! arithmetic), and [`AffineExpr::simplify`] produces the canonical form by
//! flattening into a linear combination and rebuilding it in a fixed order:
//! dimensions, symbols, division terms, constant.
//!
//! A product of two non-constant terms (or a division by a non-constant) can
//! still be represented; it is *semi-affine* and every analysis treats it as
//! "not affine".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;

/// Affine expression tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AffineExpr {
    /// Loop dimension (`d<N>`)
    Dim(u32),
    /// Outer-scope symbol (`s<N>`)
    Symbol(u32),
    /// Integer constant
    Constant(i64),
    Add(Box<AffineExpr>, Box<AffineExpr>),
    Mul(Box<AffineExpr>, Box<AffineExpr>),
    FloorDiv(Box<AffineExpr>, Box<AffineExpr>),
    CeilDiv(Box<AffineExpr>, Box<AffineExpr>),
    Mod(Box<AffineExpr>, Box<AffineExpr>),
}

/// Returned when an expression cannot be represented as a linear form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotAffine;

impl fmt::Display for NotAffine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expression is not affine")
    }
}

impl std::error::Error for NotAffine {}

/// Floor division for a positive divisor.
pub fn floor_div(lhs: i64, rhs: i64) -> i64 {
    debug_assert!(rhs > 0);
    lhs.div_euclid(rhs)
}

/// Ceil division for a positive divisor.
pub fn ceil_div(lhs: i64, rhs: i64) -> i64 {
    debug_assert!(rhs > 0);
    -((-lhs).div_euclid(rhs))
}

/// Greatest common divisor of absolute values (`gcd(0, 0) == 0`).
pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl AffineExpr {
    pub fn dim(position: u32) -> Self {
        AffineExpr::Dim(position)
    }

    pub fn symbol(position: u32) -> Self {
        AffineExpr::Symbol(position)
    }

    pub fn constant(value: i64) -> Self {
        AffineExpr::Constant(value)
    }

    /// Return the constant value if this is a constant expression.
    pub fn as_constant(&self) -> Option<i64> {
        match self {
            AffineExpr::Constant(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.as_constant().is_some()
    }

    /// `self + rhs` with local folding.
    pub fn add(self, rhs: AffineExpr) -> AffineExpr {
        use AffineExpr::*;
        match (self, rhs) {
            (Constant(a), Constant(b)) => Constant(a + b),
            // Keep constants on the right.
            (Constant(a), other) => other.add(Constant(a)),
            (lhs, Constant(0)) => lhs,
            (Add(x, c1), Constant(c2)) if c1.is_constant() => {
                let folded = c1.as_constant().unwrap_or(0) + c2;
                x.add(Constant(folded))
            }
            (lhs, rhs) => Add(Box::new(lhs), Box::new(rhs)),
        }
    }

    /// `self - rhs`.
    pub fn sub(self, rhs: AffineExpr) -> AffineExpr {
        self.add(rhs.mul(AffineExpr::Constant(-1)))
    }

    /// `self * rhs` with local folding. Building a product of two
    /// non-constant expressions yields a semi-affine expression.
    pub fn mul(self, rhs: AffineExpr) -> AffineExpr {
        use AffineExpr::*;
        match (self, rhs) {
            (Constant(a), Constant(b)) => Constant(a * b),
            (Constant(a), other) => other.mul(Constant(a)),
            (_, Constant(0)) => Constant(0),
            (lhs, Constant(1)) => lhs,
            (Mul(x, c1), Constant(c2)) if c1.is_constant() => {
                let folded = c1.as_constant().unwrap_or(1) * c2;
                x.mul(Constant(folded))
            }
            (lhs, rhs) => Mul(Box::new(lhs), Box::new(rhs)),
        }
    }

    pub fn floor_div(self, rhs: AffineExpr) -> AffineExpr {
        use AffineExpr::*;
        match (self, rhs) {
            (lhs, Constant(1)) => lhs,
            (Constant(a), Constant(b)) if b > 0 => Constant(floor_div(a, b)),
            (lhs, rhs) => FloorDiv(Box::new(lhs), Box::new(rhs)),
        }
    }

    pub fn ceil_div(self, rhs: AffineExpr) -> AffineExpr {
        use AffineExpr::*;
        match (self, rhs) {
            (lhs, Constant(1)) => lhs,
            (Constant(a), Constant(b)) if b > 0 => Constant(ceil_div(a, b)),
            (lhs, rhs) => CeilDiv(Box::new(lhs), Box::new(rhs)),
        }
    }

    pub fn modulo(self, rhs: AffineExpr) -> AffineExpr {
        use AffineExpr::*;
        match (self, rhs) {
            (_, Constant(1)) => Constant(0),
            (Constant(a), Constant(b)) if b > 0 => Constant(a.rem_euclid(b)),
            (lhs, rhs) => Mod(Box::new(lhs), Box::new(rhs)),
        }
    }

    /// True if no sub-expression multiplies two non-constants or divides by
    /// a non-constant (or non-positive) value.
    pub fn is_pure_affine(&self) -> bool {
        use AffineExpr::*;
        match self {
            Dim(_) | Symbol(_) | Constant(_) => true,
            Add(a, b) => a.is_pure_affine() && b.is_pure_affine(),
            Mul(a, b) => {
                a.is_pure_affine() && b.is_pure_affine() && (a.is_constant() || b.is_constant())
            }
            FloorDiv(a, b) | CeilDiv(a, b) | Mod(a, b) => {
                a.is_pure_affine() && matches!(b.as_constant(), Some(c) if c > 0)
            }
        }
    }

    /// Number of dimensions and symbols referenced (max position + 1).
    pub fn arity(&self) -> (u32, u32) {
        let mut dims = 0;
        let mut symbols = 0;
        self.walk(&mut |e| match e {
            AffineExpr::Dim(d) => dims = dims.max(d + 1),
            AffineExpr::Symbol(s) => symbols = symbols.max(s + 1),
            _ => {}
        });
        (dims, symbols)
    }

    /// Pre-order visit of every sub-expression.
    pub fn walk(&self, f: &mut impl FnMut(&AffineExpr)) {
        f(self);
        match self {
            AffineExpr::Add(a, b)
            | AffineExpr::Mul(a, b)
            | AffineExpr::FloorDiv(a, b)
            | AffineExpr::CeilDiv(a, b)
            | AffineExpr::Mod(a, b) => {
                a.walk(f);
                b.walk(f);
            }
            _ => {}
        }
    }

    pub fn uses_dim(&self, position: u32) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if *e == AffineExpr::Dim(position) {
                found = true;
            }
        });
        found
    }

    pub fn uses_symbol(&self, position: u32) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if *e == AffineExpr::Symbol(position) {
                found = true;
            }
        });
        found
    }

    /// Substitute every `d<i>` with `dims[i]` and every `s<j>` with
    /// `symbols[j]`. Positions past the end of a list are kept unchanged.
    pub fn replace_dims_and_symbols(&self, dims: &[AffineExpr], symbols: &[AffineExpr]) -> AffineExpr {
        use AffineExpr::*;
        match self {
            Dim(d) => dims.get(*d as usize).cloned().unwrap_or(Dim(*d)),
            Symbol(s) => symbols.get(*s as usize).cloned().unwrap_or(Symbol(*s)),
            Constant(c) => Constant(*c),
            Add(a, b) => a
                .replace_dims_and_symbols(dims, symbols)
                .add(b.replace_dims_and_symbols(dims, symbols)),
            Mul(a, b) => a
                .replace_dims_and_symbols(dims, symbols)
                .mul(b.replace_dims_and_symbols(dims, symbols)),
            FloorDiv(a, b) => a
                .replace_dims_and_symbols(dims, symbols)
                .floor_div(b.replace_dims_and_symbols(dims, symbols)),
            CeilDiv(a, b) => a
                .replace_dims_and_symbols(dims, symbols)
                .ceil_div(b.replace_dims_and_symbols(dims, symbols)),
            Mod(a, b) => a
                .replace_dims_and_symbols(dims, symbols)
                .modulo(b.replace_dims_and_symbols(dims, symbols)),
        }
    }

    /// Shift dimension positions by `offset` (e.g. `d0 -> d2`).
    pub fn shift_dims(&self, offset: u32) -> AffineExpr {
        self.map_leaves(&|e| match e {
            AffineExpr::Dim(d) => AffineExpr::Dim(d + offset),
            other => other.clone(),
        })
    }

    /// Shift symbol positions by `offset`.
    pub fn shift_symbols(&self, offset: u32) -> AffineExpr {
        self.map_leaves(&|e| match e {
            AffineExpr::Symbol(s) => AffineExpr::Symbol(s + offset),
            other => other.clone(),
        })
    }

    /// Turn symbol `s<j>` into dimension `d<num_dims + j>`.
    pub fn symbols_to_dims(&self, num_dims: u32) -> AffineExpr {
        self.map_leaves(&|e| match e {
            AffineExpr::Symbol(s) => AffineExpr::Dim(num_dims + s),
            other => other.clone(),
        })
    }

    fn map_leaves(&self, f: &dyn Fn(&AffineExpr) -> AffineExpr) -> AffineExpr {
        use AffineExpr::*;
        match self {
            Dim(_) | Symbol(_) | Constant(_) => f(self),
            Add(a, b) => Add(Box::new(a.map_leaves(f)), Box::new(b.map_leaves(f))),
            Mul(a, b) => Mul(Box::new(a.map_leaves(f)), Box::new(b.map_leaves(f))),
            FloorDiv(a, b) => FloorDiv(Box::new(a.map_leaves(f)), Box::new(b.map_leaves(f))),
            CeilDiv(a, b) => CeilDiv(Box::new(a.map_leaves(f)), Box::new(b.map_leaves(f))),
            Mod(a, b) => Mod(Box::new(a.map_leaves(f)), Box::new(b.map_leaves(f))),
        }
    }

    /// Evaluate with concrete dimension and symbol values. Returns `None` on
    /// out-of-range positions or a non-positive divisor.
    pub fn eval(&self, dims: &[i64], symbols: &[i64]) -> Option<i64> {
        use AffineExpr::*;
        match self {
            Dim(d) => dims.get(*d as usize).copied(),
            Symbol(s) => symbols.get(*s as usize).copied(),
            Constant(c) => Some(*c),
            Add(a, b) => Some(a.eval(dims, symbols)? + b.eval(dims, symbols)?),
            Mul(a, b) => Some(a.eval(dims, symbols)? * b.eval(dims, symbols)?),
            FloorDiv(a, b) => {
                let rhs = b.eval(dims, symbols)?;
                (rhs > 0).then_some(())?;
                Some(floor_div(a.eval(dims, symbols)?, rhs))
            }
            CeilDiv(a, b) => {
                let rhs = b.eval(dims, symbols)?;
                (rhs > 0).then_some(())?;
                Some(ceil_div(a.eval(dims, symbols)?, rhs))
            }
            Mod(a, b) => {
                let rhs = b.eval(dims, symbols)?;
                (rhs > 0).then_some(())?;
                Some(a.eval(dims, symbols)?.rem_euclid(rhs))
            }
        }
    }

    /// Canonical simplified form.
    ///
    /// Pure affine expressions are flattened and rebuilt; semi-affine ones
    /// only get their children simplified and re-folded.
    pub fn simplify(&self) -> AffineExpr {
        let (num_dims, num_symbols) = self.arity();
        let mut flattener = Flattener::new(num_dims as usize, num_symbols as usize);
        match flattener.flatten(self) {
            Ok(form) => flattener.rebuild(&form),
            Err(NotAffine) => self.simplify_structurally(),
        }
    }

    fn simplify_structurally(&self) -> AffineExpr {
        use AffineExpr::*;
        match self {
            Dim(_) | Symbol(_) | Constant(_) => self.clone(),
            Add(a, b) => a.simplify().add(b.simplify()),
            Mul(a, b) => a.simplify().mul(b.simplify()),
            FloorDiv(a, b) => a.simplify().floor_div(b.simplify()),
            CeilDiv(a, b) => a.simplify().ceil_div(b.simplify()),
            Mod(a, b) => a.simplify().modulo(b.simplify()),
        }
    }
}

impl ops::Add for AffineExpr {
    type Output = AffineExpr;
    fn add(self, rhs: AffineExpr) -> AffineExpr {
        AffineExpr::add(self, rhs)
    }
}

impl ops::Add<i64> for AffineExpr {
    type Output = AffineExpr;
    fn add(self, rhs: i64) -> AffineExpr {
        AffineExpr::add(self, AffineExpr::Constant(rhs))
    }
}

impl ops::Sub for AffineExpr {
    type Output = AffineExpr;
    fn sub(self, rhs: AffineExpr) -> AffineExpr {
        AffineExpr::sub(self, rhs)
    }
}

impl ops::Sub<i64> for AffineExpr {
    type Output = AffineExpr;
    fn sub(self, rhs: i64) -> AffineExpr {
        AffineExpr::add(self, AffineExpr::Constant(-rhs))
    }
}

impl ops::Mul<i64> for AffineExpr {
    type Output = AffineExpr;
    fn mul(self, rhs: i64) -> AffineExpr {
        AffineExpr::mul(self, AffineExpr::Constant(rhs))
    }
}

impl ops::Neg for AffineExpr {
    type Output = AffineExpr;
    fn neg(self) -> AffineExpr {
        AffineExpr::mul(self, AffineExpr::Constant(-1))
    }
}

impl fmt::Display for AffineExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use AffineExpr::*;
        match self {
            Dim(d) => write!(f, "d{}", d),
            Symbol(s) => write!(f, "s{}", s),
            Constant(c) => write!(f, "{}", c),
            Add(a, b) => match b.as_ref() {
                Constant(c) if *c < 0 => write!(f, "{} - {}", a, -c),
                Mul(x, c) if matches!(c.as_constant(), Some(-1)) => write!(f, "{} - {}", a, wrap(x)),
                _ => write!(f, "{} + {}", a, b),
            },
            Mul(a, b) => write!(f, "{} * {}", wrap(a), wrap(b)),
            FloorDiv(a, b) => write!(f, "{} floordiv {}", wrap(a), wrap(b)),
            CeilDiv(a, b) => write!(f, "{} ceildiv {}", wrap(a), wrap(b)),
            Mod(a, b) => write!(f, "{} mod {}", wrap(a), wrap(b)),
        }
    }
}

fn wrap(e: &AffineExpr) -> String {
    match e {
        AffineExpr::Dim(_) | AffineExpr::Symbol(_) | AffineExpr::Constant(_) => e.to_string(),
        _ => format!("({})", e),
    }
}

// ============================================================================
// Flattening
// ============================================================================

/// Linear combination over dimensions, symbols and local division variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearForm {
    pub dims: Vec<i64>,
    pub symbols: Vec<i64>,
    /// Coefficients of local variables; missing trailing entries are zero.
    pub locals: Vec<i64>,
    pub constant: i64,
}

impl LinearForm {
    pub fn zero(num_dims: usize, num_symbols: usize) -> Self {
        Self {
            dims: vec![0; num_dims],
            symbols: vec![0; num_symbols],
            locals: Vec::new(),
            constant: 0,
        }
    }

    pub fn local_coeff(&self, index: usize) -> i64 {
        self.locals.get(index).copied().unwrap_or(0)
    }

    fn set_local(&mut self, index: usize, value: i64) {
        if self.locals.len() <= index {
            self.locals.resize(index + 1, 0);
        }
        self.locals[index] = value;
    }

    /// True if every variable coefficient is zero.
    pub fn is_constant(&self) -> bool {
        self.dims.iter().chain(&self.symbols).chain(&self.locals).all(|&c| c == 0)
    }

    pub fn has_locals(&self) -> bool {
        self.locals.iter().any(|&c| c != 0)
    }

    /// `self += other * factor`
    pub fn add_scaled(&mut self, other: &LinearForm, factor: i64) {
        for (a, b) in self.dims.iter_mut().zip(&other.dims) {
            *a += b * factor;
        }
        for (a, b) in self.symbols.iter_mut().zip(&other.symbols) {
            *a += b * factor;
        }
        for (i, &b) in other.locals.iter().enumerate() {
            let current = self.local_coeff(i);
            self.set_local(i, current + b * factor);
        }
        self.constant += other.constant * factor;
    }

    pub fn scaled(&self, factor: i64) -> LinearForm {
        let mut result = LinearForm::zero(self.dims.len(), self.symbols.len());
        result.add_scaled(self, factor);
        result
    }

    /// Whether every variable coefficient is divisible by `divisor`.
    fn vars_divisible_by(&self, divisor: i64) -> bool {
        self.dims
            .iter()
            .chain(&self.symbols)
            .chain(&self.locals)
            .all(|&c| c % divisor == 0)
    }

    fn trimmed_locals(&self) -> &[i64] {
        let end = self.locals.iter().rposition(|&c| c != 0).map_or(0, |p| p + 1);
        &self.locals[..end]
    }

    fn same_as(&self, other: &LinearForm) -> bool {
        self.dims == other.dims
            && self.symbols == other.symbols
            && self.constant == other.constant
            && self.trimmed_locals() == other.trimmed_locals()
    }
}

/// A local variable `q = floor(numerator / divisor)` introduced while
/// flattening a division or modulo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDiv {
    pub numerator: LinearForm,
    pub divisor: i64,
}

/// Flattens expressions that share one dimension/symbol space; locals are
/// shared (and deduplicated) across every expression flattened with the same
/// instance.
#[derive(Debug, Clone)]
pub struct Flattener {
    pub num_dims: usize,
    pub num_symbols: usize,
    pub locals: Vec<LocalDiv>,
}

impl Flattener {
    pub fn new(num_dims: usize, num_symbols: usize) -> Self {
        Self {
            num_dims,
            num_symbols,
            locals: Vec::new(),
        }
    }

    pub fn flatten(&mut self, expr: &AffineExpr) -> Result<LinearForm, NotAffine> {
        use AffineExpr::*;
        match expr {
            Dim(d) => {
                let mut form = LinearForm::zero(self.num_dims, self.num_symbols);
                *form.dims.get_mut(*d as usize).ok_or(NotAffine)? = 1;
                Ok(form)
            }
            Symbol(s) => {
                let mut form = LinearForm::zero(self.num_dims, self.num_symbols);
                *form.symbols.get_mut(*s as usize).ok_or(NotAffine)? = 1;
                Ok(form)
            }
            Constant(c) => {
                let mut form = LinearForm::zero(self.num_dims, self.num_symbols);
                form.constant = *c;
                Ok(form)
            }
            Add(a, b) => {
                let mut lhs = self.flatten(a)?;
                let rhs = self.flatten(b)?;
                lhs.add_scaled(&rhs, 1);
                Ok(lhs)
            }
            Mul(a, b) => {
                let lhs = self.flatten(a)?;
                let rhs = self.flatten(b)?;
                if rhs.is_constant() {
                    Ok(lhs.scaled(rhs.constant))
                } else if lhs.is_constant() {
                    Ok(rhs.scaled(lhs.constant))
                } else {
                    Err(NotAffine)
                }
            }
            FloorDiv(a, b) => {
                let divisor = self.positive_constant(b)?;
                let numerator = self.flatten(a)?;
                Ok(self.floor_div(numerator, divisor))
            }
            CeilDiv(a, b) => {
                let divisor = self.positive_constant(b)?;
                let mut numerator = self.flatten(a)?;
                numerator.constant += divisor - 1;
                Ok(self.floor_div(numerator, divisor))
            }
            Mod(a, b) => {
                let divisor = self.positive_constant(b)?;
                let numerator = self.flatten(a)?;
                if numerator.vars_divisible_by(divisor) {
                    let mut form = LinearForm::zero(self.num_dims, self.num_symbols);
                    form.constant = numerator.constant.rem_euclid(divisor);
                    return Ok(form);
                }
                let quotient = self.floor_div(numerator.clone(), divisor);
                let mut form = numerator;
                form.add_scaled(&quotient, -divisor);
                Ok(form)
            }
        }
    }

    fn positive_constant(&mut self, expr: &AffineExpr) -> Result<i64, NotAffine> {
        let form = self.flatten(expr)?;
        if form.is_constant() && form.constant > 0 {
            Ok(form.constant)
        } else {
            Err(NotAffine)
        }
    }

    fn floor_div(&mut self, numerator: LinearForm, divisor: i64) -> LinearForm {
        if divisor == 1 {
            return numerator;
        }
        if numerator.vars_divisible_by(divisor) {
            let mut form = LinearForm::zero(self.num_dims, self.num_symbols);
            for (dst, src) in form.dims.iter_mut().zip(&numerator.dims) {
                *dst = src / divisor;
            }
            for (dst, src) in form.symbols.iter_mut().zip(&numerator.symbols) {
                *dst = src / divisor;
            }
            for (i, &c) in numerator.locals.iter().enumerate() {
                if c != 0 {
                    form.set_local(i, c / divisor);
                }
            }
            form.constant = floor_div(numerator.constant, divisor);
            return form;
        }
        let index = match self
            .locals
            .iter()
            .position(|l| l.divisor == divisor && l.numerator.same_as(&numerator))
        {
            Some(index) => index,
            None => {
                self.locals.push(LocalDiv { numerator, divisor });
                self.locals.len() - 1
            }
        };
        let mut form = LinearForm::zero(self.num_dims, self.num_symbols);
        form.set_local(index, 1);
        form
    }

    /// Rebuild a canonical expression from a linear form whose locals refer
    /// to this flattener.
    ///
    /// A local `q = floor(n / c)` whose coefficient is exactly `-c` is
    /// printed back as `n mod c` plus the remainder of the form. Locals are
    /// examined from the highest index down, since a local's numerator only
    /// refers to lower locals.
    pub fn rebuild(&self, form: &LinearForm) -> AffineExpr {
        let mut rest = form.clone();
        let mut as_mod = vec![false; self.locals.len()];
        for index in (0..self.locals.len()).rev() {
            let local = &self.locals[index];
            if rest.local_coeff(index) == -local.divisor {
                rest.add_scaled(&local.numerator, -1);
                rest.set_local(index, 0);
                as_mod[index] = true;
            }
        }

        let mut terms: Vec<AffineExpr> = Vec::new();
        for (d, &c) in rest.dims.iter().enumerate() {
            if c != 0 {
                terms.push(scale_term(AffineExpr::Dim(d as u32), c));
            }
        }
        for (s, &c) in rest.symbols.iter().enumerate() {
            if c != 0 {
                terms.push(scale_term(AffineExpr::Symbol(s as u32), c));
            }
        }
        for (index, local) in self.locals.iter().enumerate() {
            let numerator = || self.rebuild(&local.numerator);
            if as_mod[index] {
                terms.push(AffineExpr::Mod(
                    Box::new(numerator()),
                    Box::new(AffineExpr::Constant(local.divisor)),
                ));
            }
            let c = rest.local_coeff(index);
            if c != 0 {
                let quotient = AffineExpr::FloorDiv(
                    Box::new(numerator()),
                    Box::new(AffineExpr::Constant(local.divisor)),
                );
                terms.push(scale_term(quotient, c));
            }
        }

        let mut result: Option<AffineExpr> = None;
        for term in terms {
            result = Some(match result {
                None => term,
                Some(acc) => AffineExpr::Add(Box::new(acc), Box::new(term)),
            });
        }
        match result {
            None => AffineExpr::Constant(rest.constant),
            Some(expr) if rest.constant == 0 => expr,
            Some(expr) => AffineExpr::Add(Box::new(expr), Box::new(AffineExpr::Constant(rest.constant))),
        }
    }
}

fn scale_term(expr: AffineExpr, coeff: i64) -> AffineExpr {
    if coeff == 1 {
        expr
    } else {
        AffineExpr::Mul(Box::new(expr), Box::new(AffineExpr::Constant(coeff)))
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

    fn c(v: i64) -> AffineExpr {
        AffineExpr::constant(v)
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(c(2) + c(3), c(5));
        assert_eq!((d(0) + 1) + 2, d(0) + 3);
        assert_eq!(d(0) * 1, d(0));
        assert_eq!(d(0) * 0, c(0));
        assert_eq!(c(7).floor_div(c(2)), c(3));
        assert_eq!(c(-7).floor_div(c(2)), c(-4));
        assert_eq!(c(-7).ceil_div(c(2)), c(-3));
        assert_eq!(c(-7).modulo(c(3)), c(2));
        assert_eq!(d(3).modulo(c(1)), c(0));
    }

    #[test]
    fn test_simplify_collects_terms() {
        let e = d(0) * 2 + s(0) + d(0) + 4 - c(1);
        assert_eq!(e.simplify(), d(0) * 3 + s(0) + 3);
        assert_eq!(e.simplify().to_string(), "d0 * 3 + s0 + 3");
    }

    #[test]
    fn test_simplify_divisions() {
        assert_eq!((d(0) * 4).floor_div(c(2)).simplify(), d(0) * 2);
        assert_eq!((d(0) * 4 + 3).modulo(c(2)).simplify(), c(1));
        assert_eq!((d(0) * 4 + 3).floor_div(c(4)).simplify(), d(0));
        assert_eq!(d(0).modulo(c(4)).simplify(), d(0).modulo(c(4)));
        let e = (d(0) + d(1)).ceil_div(c(8));
        assert_eq!(e.simplify().to_string(), "(d0 + d1 + 7) floordiv 8");
    }

    #[test]
    fn test_simplify_is_idempotent() {
        let exprs = vec![
            d(0).modulo(c(4)) + d(1) * 3 + 2,
            (d(0) + s(1)).floor_div(c(3)) * 5 - s(0),
            (d(0).floor_div(c(2)) + d(1)).modulo(c(7)),
            d(0) - d(0).floor_div(c(4)) * 4,
            d(0) * 2 + d(0) * -2,
        ];
        for e in exprs {
            let once = e.simplify();
            assert_eq!(once.simplify(), once, "simplify not idempotent for {}", e);
        }
    }

    #[test]
    fn test_simplify_preserves_values() {
        let e = (d(0) * 3 + s(0)).modulo(c(5)) + (d(1) - 2).floor_div(c(3)) + d(0).ceil_div(c(4));
        let simplified = e.simplify();
        for x in -6..6 {
            for y in -6..6 {
                for sym in 0..3 {
                    assert_eq!(e.eval(&[x, y], &[sym]), simplified.eval(&[x, y], &[sym]));
                }
            }
        }
    }

    #[test]
    fn test_semi_affine_detection() {
        let product = AffineExpr::Mul(Box::new(d(0)), Box::new(d(1)));
        assert!(!product.is_pure_affine());
        let mut flattener = Flattener::new(2, 0);
        assert_eq!(flattener.flatten(&product), Err(NotAffine));
        assert!((d(0) * 3).is_pure_affine());
        assert!(!d(0).floor_div(s(0)).is_pure_affine());
    }

    #[test]
    fn test_replace_and_shift() {
        let e = d(0) + s(0) * 2;
        let replaced = e.replace_dims_and_symbols(&[d(1) + 1], &[c(3)]);
        assert_eq!(replaced.simplify(), d(1) + 7);
        assert_eq!(e.shift_dims(2), d(2) + s(0) * 2);
        assert_eq!(e.symbols_to_dims(1), d(0) + d(1) * 2);
        assert!(e.uses_dim(0));
        assert!(!e.uses_dim(1));
        assert_eq!(e.arity(), (1, 1));
    }
}
