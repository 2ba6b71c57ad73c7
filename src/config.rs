//! Process-wide, flag-style configuration.
//!
//! Two knobs are read once from the environment on first use:
//!
//! - `SPINDLE_NO_READY_SET_OPT`: disables the reusable readiness-set
//!   optimization, forcing the per-iteration fallback path.
//! - `SPINDLE_AUTO_REBUILD_THRESHOLD`: number of consecutive premature
//!   multiplexer returns that trigger an automatic rebuild. Values below 3
//!   disable the workaround entirely.
//!
//! Both can also be overridden per reactor through
//! [`ReactorBuilder`](crate::ReactorBuilder).

use std::env;
use std::sync::OnceLock;

use log::debug;

/// Consecutive premature returns needed before an automatic rebuild.
pub(crate) const DEFAULT_AUTO_REBUILD_THRESHOLD: u32 = 512;

/// Thresholds below this cannot distinguish a genuine premature streak from
/// ordinary wakeups, so they disable the workaround.
pub(crate) const MIN_PREMATURE_RETURNS: u32 = 3;

struct Config {
    no_ready_set_optimization: bool,
    auto_rebuild_threshold: u32,
}

fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| {
        let no_ready_set_optimization = env::var("SPINDLE_NO_READY_SET_OPT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let mut auto_rebuild_threshold = env::var("SPINDLE_AUTO_REBUILD_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_AUTO_REBUILD_THRESHOLD);
        if auto_rebuild_threshold < MIN_PREMATURE_RETURNS {
            auto_rebuild_threshold = 0;
        }

        debug!("SPINDLE_NO_READY_SET_OPT: {no_ready_set_optimization}");
        debug!("SPINDLE_AUTO_REBUILD_THRESHOLD: {auto_rebuild_threshold}");

        Config {
            no_ready_set_optimization,
            auto_rebuild_threshold,
        }
    })
}

/// Whether the readiness-set optimization is disabled process-wide.
pub(crate) fn no_ready_set_optimization() -> bool {
    config().no_ready_set_optimization
}

/// The process-wide auto-rebuild threshold; 0 means disabled.
pub(crate) fn auto_rebuild_threshold() -> u32 {
    config().auto_rebuild_threshold
}

/// Normalizes a caller-supplied threshold the same way the environment
/// variable is normalized: anything below the minimum disables the
/// workaround.
pub(crate) fn normalize_rebuild_threshold(threshold: u32) -> u32 {
    if threshold < MIN_PREMATURE_RETURNS {
        0
    } else {
        threshold
    }
}
