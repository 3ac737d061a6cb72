//! Tracker configuration.

use serde::{Deserialize, Serialize};

/// Knobs for a [`ChangeTracker`](crate::dispatch::ChangeTracker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Run per-chunk stages on the rayon pool. When `false` every stage runs
    /// on the calling thread; results are identical.
    pub parallel: bool,
    /// An `update()` that needs more internal passes than this logs a
    /// warning. Subscribers that keep mutating the world they observe are the
    /// usual cause.
    pub pass_warning_threshold: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            pass_warning_threshold: 8,
        }
    }
}

impl TrackerConfig {
    /// Parse from JSON. Missing fields take their default.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// A configuration that never touches the thread pool.
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }
}
