//! Logging setup for the affine passes
//!
//! The passes log through the `log` facade; this module installs an
//! `env_logger` backend.
//!
//! ```rust,ignore
//! use affine_passes::logging;
//!
//! logging::init();                                  // warnings only
//! logging::init_from_env();                         // honour RUST_LOG
//! logging::init_with_level(log::LevelFilter::Debug);
//! ```
//!
//! Levels used by the passes:
//!
//! - `info!` - one summary line per pass and function that changed
//! - `debug!` - why a loop or buffer was skipped (not affine, illegal,
//!   over capacity)
//! - `trace!` - individual rewrites (loop tiled, load forwarded, op hoisted)
//!
//! Filtering by pass works through the module path:
//!
//! ```bash
//! RUST_LOG=affine_passes::transforms::tiling=debug cargo test
//! RUST_LOG=affine_passes::transforms=trace,affine_passes::analysis=debug cargo bench
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Warn-level logging. Only the first initialization takes effect.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Log at `level` with a compact `[LEVEL] module - message` format.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                let target = record.target().strip_prefix("affine_passes::").unwrap_or(record.target());
                writeln!(buf, "[{:5}] {} - {}", record.level(), target, record.args())
            })
            .init();
    });
}

/// Use `RUST_LOG`, falling back to warnings.
pub fn init_from_env() {
    INIT.call_once(|| {
        Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Test logging: captured by the test harness, silent below warnings
/// unless `RUST_LOG` says otherwise.
pub fn init_test() {
    let _ = Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

/// Whether [`init`], [`init_with_level`] or [`init_from_env`] has run.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        log::debug!("skipping loop: not affine");
        log::trace!("tiled band");
    }
}
