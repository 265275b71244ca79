//! Affine Value Maps
//!
//! An [`AffineValueMap`] is an affine map bound to concrete SSA operands.
//! Composition walks the operands' definitions and folds `apply` chains,
//! integer constants and index arithmetic (`add`, `sub`, `mul` by a
//! constant) into the map, so that what remains are induction variables
//! (dimensions) and top-level values (symbols).

use crate::affine::{AffineExpr, AffineMap, FlatAffineConstraints, NotAffine, VarKind};
use crate::ir::{BinaryOp, Function, Literal, OpKind, ValueDef, ValueId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffineValueMap {
    pub map: AffineMap,
    /// Dimension operands followed by symbol operands.
    pub operands: Vec<ValueId>,
}

impl AffineValueMap {
    pub fn new(map: AffineMap, operands: Vec<ValueId>) -> Self {
        debug_assert_eq!(map.num_inputs(), operands.len());
        Self { map, operands }
    }

    /// Compose `map(operands)` with the definitions of its operands.
    pub fn compose(func: &Function, map: &AffineMap, operands: &[ValueId]) -> Result<Self, NotAffine> {
        if !map.is_pure_affine() {
            return Err(NotAffine);
        }
        let mut composer = Composer {
            func,
            dims: Vec::new(),
            symbols: Vec::new(),
        };
        let inputs = operands
            .iter()
            .map(|&v| composer.resolve(v))
            .collect::<Result<Vec<_>, _>>()?;
        let (dim_inputs, symbol_inputs) = inputs.split_at(map.num_dims as usize);
        let num_dims = composer.dims.len() as u32;
        let results = map
            .results
            .iter()
            .map(|e| e.replace_dims_and_symbols(dim_inputs, symbol_inputs).simplify())
            .collect();
        let mut all = composer.dims;
        all.extend(composer.symbols);
        Ok(Self {
            map: AffineMap::new(num_dims, all.len() as u32 - num_dims, results),
            operands: all,
        })
    }

    pub fn num_dims(&self) -> usize {
        self.map.num_dims as usize
    }

    pub fn dim_values(&self) -> &[ValueId] {
        &self.operands[..self.num_dims()]
    }

    pub fn symbol_values(&self) -> &[ValueId] {
        &self.operands[self.num_dims()..]
    }

    /// Flatten the results into rows of `cst`, creating variables for
    /// operands on demand through `resolve` (which receives the operand and
    /// whether it is a dimension). Returns one row per result, sized for
    /// the system after all variables were added.
    pub fn add_to_constraints(
        &self,
        cst: &mut FlatAffineConstraints,
        resolve: &mut dyn FnMut(&mut FlatAffineConstraints, ValueId, bool) -> usize,
    ) -> Result<Vec<Vec<i64>>, NotAffine> {
        let (forms, flattener) = self.map.flatten()?;
        let dim_vars: Vec<usize> = self.dim_values().iter().map(|&v| resolve(cst, v, true)).collect();
        let sym_vars: Vec<usize> = self.symbol_values().iter().map(|&v| resolve(cst, v, false)).collect();
        let local_vars = cst.add_local_divs(&flattener, &dim_vars, &sym_vars);
        Ok(forms
            .iter()
            .map(|form| cst.form_to_row(form, &dim_vars, &sym_vars, &local_vars))
            .collect())
    }
}

/// Default variable resolution: reuse the variable carrying the value, or
/// append one (a dimension for induction variables, a symbol otherwise).
pub fn resolve_by_id(cst: &mut FlatAffineConstraints, value: ValueId, is_dim: bool) -> usize {
    cst.find_var(value).unwrap_or_else(|| {
        let kind = if is_dim { VarKind::Dim } else { VarKind::Symbol };
        cst.append_var(kind, Some(value))
    })
}

struct Composer<'f> {
    func: &'f Function,
    dims: Vec<ValueId>,
    symbols: Vec<ValueId>,
}

impl Composer<'_> {
    /// Expression for `value` over the composer's dims and symbols.
    fn resolve(&mut self, value: ValueId) -> Result<AffineExpr, NotAffine> {
        let func = self.func;
        match func.value(value).def {
            ValueDef::InductionVar(_) => Ok(AffineExpr::Dim(position(&mut self.dims, value))),
            ValueDef::Argument(_) => Ok(AffineExpr::Symbol(position(&mut self.symbols, value))),
            ValueDef::Result { op, .. } => {
                if !func.value_type(value).is_index() && !func.value_type(value).element().is_integer() {
                    return Err(NotAffine);
                }
                match &func.op(op).kind {
                    OpKind::Constant(Literal::Int(c)) => Ok(AffineExpr::Constant(*c)),
                    OpKind::Apply { map, operands } => {
                        let inputs = operands
                            .iter()
                            .map(|&v| self.resolve(v))
                            .collect::<Result<Vec<_>, _>>()?;
                        let (d, s) = inputs.split_at(map.num_dims as usize);
                        if !map.is_pure_affine() {
                            return Err(NotAffine);
                        }
                        Ok(map.results[0].replace_dims_and_symbols(d, s))
                    }
                    OpKind::Binary { op: bin, lhs, rhs } => {
                        let (lhs, rhs) = (*lhs, *rhs);
                        match bin {
                            BinaryOp::Add => Ok(self.resolve(lhs)? + self.resolve(rhs)?),
                            BinaryOp::Sub => Ok(self.resolve(lhs)? - self.resolve(rhs)?),
                            BinaryOp::Mul => {
                                let (a, b) = (self.resolve(lhs)?, self.resolve(rhs)?);
                                match (a.as_constant(), b.as_constant()) {
                                    (_, Some(c)) => Ok(a * c),
                                    (Some(c), _) => Ok(b * c),
                                    _ => Err(NotAffine),
                                }
                            }
                            BinaryOp::Div | BinaryOp::Rem => self.leaf(value),
                        }
                    }
                    _ => self.leaf(value),
                }
            }
        }
    }

    /// Opaque value: a symbol if defined at the top level of the function.
    fn leaf(&mut self, value: ValueId) -> Result<AffineExpr, NotAffine> {
        if self.func.is_top_level_value(value) {
            Ok(AffineExpr::Symbol(position(&mut self.symbols, value)))
        } else {
            Err(NotAffine)
        }
    }
}

fn position(list: &mut Vec<ValueId>, value: ValueId) -> u32 {
    match list.iter().position(|&v| v == value) {
        Some(p) => p as u32,
        None => {
            list.push(value);
            (list.len() - 1) as u32
        }
    }
}

/// Rewrite every input (dims, then symbols) of each `(map, operands)` pair
/// as a dimension over one shared operand list. Returns the rewritten
/// result lists and the shared operands.
pub fn unify_operands(maps: &[(&AffineMap, &[ValueId])]) -> (Vec<Vec<AffineExpr>>, Vec<ValueId>) {
    let mut shared: Vec<ValueId> = Vec::new();
    let mut out = Vec::with_capacity(maps.len());
    for (map, operands) in maps {
        let positions: Vec<AffineExpr> = operands
            .iter()
            .map(|&v| AffineExpr::Dim(position(&mut shared, v)))
            .collect();
        let (d, s) = positions.split_at(map.num_dims as usize);
        out.push(map.results.iter().map(|e| e.replace_dims_and_symbols(d, s)).collect());
    }
    (out, shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ElementType, IrType, MemRefType, OpBuilder};

    #[test]
    fn test_compose_apply_chain() {
        let mut func = Function::new("f", vec![IrType::index()]);
        let n = func.arguments[0];
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(0, 16, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, l.body);
        let two = b.constant_index(2);
        let scaled = b.mul(l.iv, two);
        let shifted = b.apply(
            AffineMap::new(1, 1, vec![AffineExpr::dim(0) + AffineExpr::symbol(0) + 1]),
            vec![scaled, n],
        );

        let vmap = AffineValueMap::compose(&func, &AffineMap::identity(1), &[shifted]).unwrap();
        assert_eq!(vmap.operands, vec![l.iv, n]);
        assert_eq!(vmap.map.num_dims, 1);
        assert_eq!(vmap.map.num_symbols, 1);
        assert_eq!(vmap.map.results[0], AffineExpr::dim(0) * 2 + AffineExpr::symbol(0) + 1);
    }

    #[test]
    fn test_product_of_values_is_not_affine() {
        let mut func = Function::new("f", vec![]);
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(0, 4, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let mut b = OpBuilder::at_end(&mut func, l.body);
        let sq = b.mul(l.iv, l.iv);
        assert_eq!(
            AffineValueMap::compose(&func, &AffineMap::identity(1), &[sq]),
            Err(NotAffine)
        );
    }

    #[test]
    fn test_loaded_value_inside_loop_is_not_affine() {
        let mut func = Function::new(
            "f",
            vec![IrType::MemRef(MemRefType::new(vec![4], ElementType::Index))],
        );
        let a = func.arguments[0];
        let body = func.body;
        let lp = OpBuilder::at_end(&mut func, body).constant_for(0, 4, 1);
        let l = func.loop_op(lp).unwrap().clone();
        let idx = OpBuilder::at_end(&mut func, l.body).load(a, AffineMap::identity(1), vec![l.iv]);
        assert!(AffineValueMap::compose(&func, &AffineMap::identity(1), &[idx]).is_err());
    }
}
