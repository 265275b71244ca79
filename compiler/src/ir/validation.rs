//! IR Validation
//!
//! Structural checks run before every pass: map arity against supplied
//! operands, access rank against memref rank, positive loop steps, single
//! result `apply` maps, and operands that are live values.

use super::function::Function;
use super::ops::OpKind;
use super::{OpId, ValueId};
use std::fmt;

/// Validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub function: String,
    pub op: Option<OpId>,
}

/// Types of validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Map expects a different number of dims + symbols than supplied
    MapArityMismatch { expected: usize, found: usize },

    /// Access map result count differs from the memref rank
    RankMismatch { rank: usize, results: usize },

    /// Access through a value that is not a memref
    NotAMemRef { value: ValueId },

    /// Loop step must be positive
    NonPositiveStep { step: i64 },

    /// `apply` maps produce exactly one result
    InvalidApply { results: usize },

    /// Operand refers to a value whose definition was erased
    DanglingOperand { value: ValueId },
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationErrorKind::MapArityMismatch { expected, found } => {
                write!(f, "map expects {} operands, found {}", expected, found)
            }
            ValidationErrorKind::RankMismatch { rank, results } => {
                write!(f, "access map has {} results for a rank {} memref", results, rank)
            }
            ValidationErrorKind::NotAMemRef { value } => write!(f, "{} is not a memref", value),
            ValidationErrorKind::NonPositiveStep { step } => write!(f, "loop step {} is not positive", step),
            ValidationErrorKind::InvalidApply { results } => {
                write!(f, "apply map has {} results, expected 1", results)
            }
            ValidationErrorKind::DanglingOperand { value } => {
                write!(f, "operand {} has no live definition", value)
            }
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Some(op) => write!(f, "{} ({}): {}", self.function, op, self.kind),
            None => write!(f, "{}: {}", self.function, self.kind),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate every live operation of `func`.
pub fn validate_function(func: &Function) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut report = |op: OpId, kind: ValidationErrorKind| {
        errors.push(ValidationError {
            kind,
            function: func.name.clone(),
            op: Some(op),
        });
    };

    for op_id in func.walk() {
        let op = func.op(op_id);

        for (map, supplied) in op.kind.maps() {
            if map.num_inputs() != supplied {
                report(
                    op_id,
                    ValidationErrorKind::MapArityMismatch {
                        expected: map.num_inputs(),
                        found: supplied,
                    },
                );
            }
        }

        op.kind.for_each_operand(|v| {
            if (v.0 as usize) >= func.num_values() {
                report(op_id, ValidationErrorKind::DanglingOperand { value: v });
            } else if let Some(def) = func.defining_op(v) {
                if !func.is_live(def) {
                    report(op_id, ValidationErrorKind::DanglingOperand { value: v });
                }
            }
        });

        let mut accesses = Vec::new();
        match &op.kind {
            OpKind::For(l) if l.step <= 0 => {
                report(op_id, ValidationErrorKind::NonPositiveStep { step: l.step });
            }
            OpKind::Apply { map, .. } if map.num_results() != 1 => {
                report(
                    op_id,
                    ValidationErrorKind::InvalidApply {
                        results: map.num_results(),
                    },
                );
            }
            OpKind::DmaStart { src, dst, tag, .. } => accesses.extend([src, dst, tag]),
            OpKind::DmaWait { tag, .. } => accesses.push(tag),
            kind => accesses.extend(kind.access()),
        }
        for access in accesses {
            if (access.memref.0 as usize) >= func.num_values() {
                continue;
            }
            match func.value_type(access.memref).as_memref() {
                Some(ty) if ty.rank() != access.map.num_results() => report(
                    op_id,
                    ValidationErrorKind::RankMismatch {
                        rank: ty.rank(),
                        results: access.map.num_results(),
                    },
                ),
                Some(_) => {}
                None => report(op_id, ValidationErrorKind::NotAMemRef { value: access.memref }),
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::{AffineExpr, AffineMap};
    use crate::ir::{ElementType, IrType, MemRefType, OpBuilder};

    #[test]
    fn test_valid_function() {
        let mut func = Function::new("f", vec![IrType::MemRef(MemRefType::new(vec![4], ElementType::I32))]);
        let a = func.arguments[0];
        let body = func.body;
        let mut b = OpBuilder::at_end(&mut func, body);
        let c = b.constant_index(2);
        b.load(a, AffineMap::identity(1), vec![c]);
        assert!(validate_function(&func).is_ok());
    }

    #[test]
    fn test_arity_mismatch() {
        let mut func = Function::new("f", vec![IrType::MemRef(MemRefType::new(vec![4], ElementType::I32))]);
        let a = func.arguments[0];
        let body = func.body;
        let mut b = OpBuilder::at_end(&mut func, body);
        let c = b.constant_index(2);
        // Map takes two dims but only one operand is supplied.
        let map = AffineMap::new(2, 0, vec![AffineExpr::dim(0) + AffineExpr::dim(1)]);
        b.load(a, map, vec![c]);
        let errors = validate_function(&func).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].kind,
            ValidationErrorKind::MapArityMismatch { expected: 2, found: 1 }
        );
    }

    #[test]
    fn test_rank_mismatch_and_step() {
        let mut func = Function::new("f", vec![IrType::MemRef(MemRefType::new(vec![4, 4], ElementType::I32))]);
        let a = func.arguments[0];
        let body = func.body;
        let mut b = OpBuilder::at_end(&mut func, body);
        let c = b.constant_index(0);
        b.load(a, AffineMap::identity(1), vec![c]);
        b.constant_for(0, 4, 0);
        let errors = validate_function(&func).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, ValidationErrorKind::RankMismatch { rank: 2, results: 1 })));
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, ValidationErrorKind::NonPositiveStep { step: 0 })));
    }
}
