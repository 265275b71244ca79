//! Affine Loop Transformations
//!
//! Each transformation is an [`AffinePass`]: an immutable configuration
//! captured at construction and a `run_on_function` entry point that
//! rewrites one function in place. Passes verify the function before
//! touching it; regions that cannot be analyzed or transformed legally are
//! skipped and the pass still succeeds.

pub mod data_copy;
pub mod licm;
pub mod normalize;
pub mod parallelize;
pub mod registry;
pub mod scalar_replacement;
pub mod simplify;
pub mod tiling;
pub mod unroll;
pub mod unroll_jam;
pub mod vectorize;

pub use data_copy::{AffineDataCopyGeneration, DataCopyOptions};
pub use licm::LoopInvariantCodeMotion;
pub use normalize::LoopNormalize;
pub use parallelize::AffineParallelize;
pub use registry::{PassFactory, PassRegistry};
pub use scalar_replacement::AffineScalarReplacement;
pub use simplify::SimplifyAffineStructures;
pub use tiling::{LoopTiling, TilingOptions};
pub use unroll::{LoopUnroll, UnrollFactorFn, UnrollOptions, DEFAULT_UNROLL_FACTOR};
pub use unroll_jam::{LoopUnrollAndJam, UnrollJamOptions, DEFAULT_UNROLL_JAM_FACTOR};
pub use vectorize::{SuperVectorize, VectorizeOptions, DEFAULT_VECTOR_WIDTH};

use crate::ir::validation::{validate_function, ValidationError};
use crate::ir::{Function, IrModule};
use indexmap::IndexMap;
use rayon::prelude::*;
use std::fmt;
use tracing::{debug, info_span};

/// Errors raised while constructing a pass from its options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A factor or size option must be positive
    NonPositiveFactor { option: &'static str, value: i64 },

    /// The virtual vector shape has no dimensions
    EmptyVectorShape,

    /// A virtual vector dimension is zero or negative
    NonPositiveVectorDim { index: usize, value: i64 },

    /// No pass registered under this name
    UnknownPass(String),

    /// Options could not be decoded
    InvalidOptions { pass: String, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveFactor { option, value } => {
                write!(f, "option '{}' must be positive, got {}", option, value)
            }
            Self::EmptyVectorShape => write!(f, "virtual vector size must not be empty"),
            Self::NonPositiveVectorDim { index, value } => {
                write!(f, "virtual vector dimension {} must be positive, got {}", index, value)
            }
            Self::UnknownPass(name) => write!(f, "unknown pass '{}'", name),
            Self::InvalidOptions { pass, message } => {
                write!(f, "invalid options for '{}': {}", pass, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors that abort a pass on a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassError {
    /// The function failed structural verification before the pass ran
    Verification { function: String, errors: Vec<ValidationError> },
}

impl fmt::Display for PassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verification { function, errors } => {
                write!(f, "function '{}' failed verification", function)?;
                for e in errors {
                    write!(f, "\n  {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for PassError {}

/// Verify `func` before a pass rewrites it.
pub fn verify(func: &Function) -> Result<(), PassError> {
    validate_function(func).map_err(|errors| PassError::Verification {
        function: func.name.clone(),
        errors,
    })
}

/// Common interface of the loop transformations.
pub trait AffinePass: Send + Sync {
    /// Registry name of this pass
    fn name(&self) -> &'static str;

    /// Rewrite one function in place
    fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError>;

    /// Run on every function of a module, in order
    fn run_on_module(&self, module: &mut IrModule) -> Result<OptimizationResult, PassError> {
        let mut total = OptimizationResult::unchanged();
        for func in module.functions.values_mut() {
            total = total.combine(self.run_on_function(func)?);
        }
        Ok(total)
    }
}

/// Result of a pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizationResult {
    /// Whether the IR was modified
    pub modified: bool,

    /// Per-pass counters (loops tiled, loads forwarded, ...)
    pub stats: IndexMap<String, usize>,
}

impl OptimizationResult {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn changed() -> Self {
        Self {
            modified: true,
            stats: IndexMap::new(),
        }
    }

    /// Bump a counter; a non-zero count marks the result modified.
    pub fn record(&mut self, key: &str, count: usize) {
        if count > 0 {
            self.modified = true;
            *self.stats.entry(key.to_string()).or_insert(0) += count;
        }
    }

    pub fn stat(&self, key: &str) -> usize {
        self.stats.get(key).copied().unwrap_or(0)
    }

    pub fn combine(mut self, other: OptimizationResult) -> Self {
        self.modified |= other.modified;
        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }
        self
    }
}

/// Ordered pipeline of passes
#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn AffinePass>>,
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pass<P: AffinePass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    pub fn add_boxed(&mut self, pass: Box<dyn AffinePass>) {
        self.passes.push(pass);
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Run the pipeline over one function.
    pub fn run_on_function(&self, func: &mut Function) -> Result<OptimizationResult, PassError> {
        let mut total = OptimizationResult::unchanged();
        for pass in &self.passes {
            let _span = info_span!("affine_pass", pass = pass.name(), function = %func.name).entered();
            let result = pass.run_on_function(func)?;
            if result.modified {
                debug!("{} modified {}: {:?}", pass.name(), func.name, result.stats);
            }
            total = total.combine(result);
        }
        Ok(total)
    }

    /// Run the pipeline over every function, one after another.
    pub fn run(&self, module: &mut IrModule) -> Result<OptimizationResult, PassError> {
        let mut total = OptimizationResult::unchanged();
        for func in module.functions.values_mut() {
            total = total.combine(self.run_on_function(func)?);
        }
        Ok(total)
    }

    /// Run the pipeline over the functions of `module` in parallel. Each
    /// function is owned by exactly one task.
    pub fn run_parallel(&self, module: &mut IrModule) -> Result<OptimizationResult, PassError> {
        let funcs: Vec<&mut Function> = module.functions.values_mut().collect();
        let results: Vec<Result<OptimizationResult, PassError>> = funcs
            .into_par_iter()
            .map(|func| self.run_on_function(func))
            .collect();
        results
            .into_iter()
            .try_fold(OptimizationResult::unchanged(), |acc, r| Ok(acc.combine(r?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::{AffineExpr, AffineMap};
    use crate::ir::{ElementType, IrType, MemRefType, OpBuilder};

    #[test]
    fn test_result_combine() {
        let mut a = OptimizationResult::unchanged();
        a.record("loops", 0);
        assert!(!a.modified);
        a.record("loops", 2);
        let mut b = OptimizationResult::unchanged();
        b.record("loops", 1);
        let c = a.combine(b);
        assert!(c.modified);
        assert_eq!(c.stat("loops"), 3);
    }

    #[test]
    fn test_verification_failure_leaves_function_untouched() {
        let mut func = Function::new("f", vec![IrType::MemRef(MemRefType::new(vec![4], ElementType::I32))]);
        let a = func.arguments[0];
        let body = func.body;
        let mut b = OpBuilder::at_end(&mut func, body);
        let c = b.constant_index(1);
        b.load(a, AffineMap::new(2, 0, vec![AffineExpr::dim(0)]), vec![c]);
        let before = format!("{}", func);

        let mut pm = PassManager::new();
        pm.add_pass(SimplifyAffineStructures::default());
        let err = pm.run_on_function(&mut func).unwrap_err();
        assert!(matches!(err, PassError::Verification { .. }));
        assert_eq!(format!("{}", func), before);
    }

    #[test]
    fn test_run_parallel() {
        let mut module = IrModule::new();
        for name in ["a", "b", "c"] {
            let mut func = Function::new(name, vec![]);
            let body = func.body;
            OpBuilder::at_end(&mut func, body).constant_for(0, 1, 1);
            module.add_function(func);
        }
        let mut pm = PassManager::new();
        pm.add_pass(LoopNormalize::default());
        let result = pm.run_parallel(&mut module).unwrap();
        assert!(result.modified);
        assert!(module.functions.values().all(|f| f.loops().is_empty()));
    }
}
