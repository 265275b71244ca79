//! Pass Registry
//!
//! Maps pass names to factories that decode JSON options into a configured
//! pass. Pipelines are described as JSON arrays whose entries are either a
//! bare pass name or `{"pass": name, "options": {...}}`.

use super::{
    AffineDataCopyGeneration, AffineParallelize, AffinePass, AffineScalarReplacement, ConfigError, DataCopyOptions,
    LoopInvariantCodeMotion, LoopNormalize, LoopTiling, LoopUnroll, LoopUnrollAndJam, PassManager,
    SimplifyAffineStructures, SuperVectorize, TilingOptions, UnrollJamOptions, UnrollOptions, VectorizeOptions,
};
use indexmap::IndexMap;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Builds a pass from its (possibly null) options.
pub type PassFactory = fn(Value) -> Result<Box<dyn AffinePass>, ConfigError>;

/// Options of passes that take none; only `null` or `{}` decode.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoOptions {}

/// One pipeline entry.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PipelineEntry {
    Name(String),
    Configured {
        pass: String,
        #[serde(default)]
        options: Value,
    },
}

pub struct PassRegistry {
    factories: IndexMap<&'static str, PassFactory>,
}

impl Default for PassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PassRegistry {
    /// Registry holding every built-in pass.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: IndexMap::new(),
        };
        registry.register_builtin_passes();
        registry
    }

    fn register_builtin_passes(&mut self) {
        self.register("affine-data-copy-generate", |v| {
            let options: DataCopyOptions = decode("affine-data-copy-generate", v)?;
            Ok(Box::new(AffineDataCopyGeneration::new(options)?))
        });
        self.register("affine-loop-tile", |v| {
            let options: TilingOptions = decode("affine-loop-tile", v)?;
            Ok(Box::new(LoopTiling::new(options)?))
        });
        self.register("affine-loop-unroll", |v| {
            let options: UnrollOptions = decode("affine-loop-unroll", v)?;
            Ok(Box::new(LoopUnroll::new(options)?))
        });
        self.register("affine-loop-unroll-jam", |v| {
            let options: UnrollJamOptions = decode("affine-loop-unroll-jam", v)?;
            Ok(Box::new(LoopUnrollAndJam::new(options)?))
        });
        self.register("affine-super-vectorize", |v| {
            let options: VectorizeOptions = decode("affine-super-vectorize", v)?;
            Ok(Box::new(SuperVectorize::new(options)?))
        });
        self.register("simplify-affine-structures", |v| {
            decode::<NoOptions>("simplify-affine-structures", v)?;
            Ok(Box::new(SimplifyAffineStructures::new()))
        });
        self.register("affine-loop-invariant-code-motion", |v| {
            decode::<NoOptions>("affine-loop-invariant-code-motion", v)?;
            Ok(Box::new(LoopInvariantCodeMotion::new()))
        });
        self.register("affine-parallelize", |v| {
            decode::<NoOptions>("affine-parallelize", v)?;
            Ok(Box::new(AffineParallelize::new()))
        });
        self.register("affine-loop-normalize", |v| {
            decode::<NoOptions>("affine-loop-normalize", v)?;
            Ok(Box::new(LoopNormalize::new()))
        });
        self.register("affine-scalrep", |v| {
            decode::<NoOptions>("affine-scalrep", v)?;
            Ok(Box::new(AffineScalarReplacement::new()))
        });
    }

    /// Register (or replace) a factory under `name`.
    pub fn register(&mut self, name: &'static str, factory: PassFactory) {
        if self.factories.insert(name, factory).is_some() {
            debug!("replaced factory for pass '{}'", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Construct the pass registered under `name`.
    pub fn create(&self, name: &str, options: Value) -> Result<Box<dyn AffinePass>, ConfigError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPass(name.to_string()))?;
        factory(options)
    }

    /// Build a pipeline from `(name, options)` pairs.
    pub fn build_pipeline<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<PassManager, ConfigError> {
        let mut pm = PassManager::new();
        for (name, options) in entries {
            pm.add_boxed(self.create(name, options)?);
        }
        Ok(pm)
    }

    /// Build a pipeline from its JSON description.
    pub fn parse_pipeline(&self, text: &str) -> Result<PassManager, ConfigError> {
        let entries: Vec<PipelineEntry> = serde_json::from_str(text).map_err(|e| ConfigError::InvalidOptions {
            pass: "<pipeline>".to_string(),
            message: e.to_string(),
        })?;
        let mut pm = PassManager::new();
        for entry in entries {
            let pass = match entry {
                PipelineEntry::Name(name) => self.create(&name, Value::Null)?,
                PipelineEntry::Configured { pass, options } => self.create(&pass, options)?,
            };
            pm.add_boxed(pass);
        }
        Ok(pm)
    }
}

/// Decode pass options; `null` selects the defaults.
fn decode<T: DeserializeOwned + Default>(pass: &str, options: Value) -> Result<T, ConfigError> {
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options).map_err(|e| ConfigError::InvalidOptions {
        pass: pass.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_builtin_pass_has_defaults() {
        let registry = PassRegistry::new();
        assert_eq!(registry.names().count(), 10);
        for name in registry.names() {
            let pass = registry.create(name, Value::Null).unwrap();
            assert_eq!(pass.name(), name);
        }
    }

    #[test]
    fn test_camel_case_options() {
        let registry = PassRegistry::new();
        let pass = registry
            .create("affine-loop-unroll", json!({"unrollFactor": 2, "unrollUpToFactor": true}))
            .unwrap();
        assert_eq!(pass.name(), "affine-loop-unroll");
        assert!(registry
            .create("affine-data-copy-generate", json!({"fastMemCapacityBytes": 1024, "generateDma": false}))
            .is_ok());
    }

    #[test]
    fn test_rejections() {
        let registry = PassRegistry::new();
        assert!(matches!(
            registry.create("affine-loop-fusion", Value::Null),
            Err(ConfigError::UnknownPass(_))
        ));
        assert!(matches!(
            registry.create("affine-loop-tile", json!({"tileSizze": 4})),
            Err(ConfigError::InvalidOptions { .. })
        ));
        assert!(matches!(
            registry.create("affine-scalrep", json!({"anything": 1})),
            Err(ConfigError::InvalidOptions { .. })
        ));
        assert_eq!(
            registry
                .create("affine-loop-unroll-jam", json!({"unrollJamFactor": 0}))
                .err(),
            Some(ConfigError::NonPositiveFactor {
                option: "unrollJamFactor",
                value: 0
            })
        );
        assert_eq!(
            registry
                .create("affine-super-vectorize", json!({"virtualVectorSize": []}))
                .err(),
            Some(ConfigError::EmptyVectorShape)
        );
    }

    #[test]
    fn test_parse_pipeline() {
        let registry = PassRegistry::new();
        let pm = registry
            .parse_pipeline(
                r#"["simplify-affine-structures",
                    {"pass": "affine-loop-tile", "options": {"tileSize": 32}},
                    {"pass": "affine-parallelize"}]"#,
            )
            .unwrap();
        assert_eq!(pm.len(), 3);
        assert!(registry.parse_pipeline(r#"["no-such-pass"]"#).is_err());
    }
}
