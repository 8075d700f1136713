//! Runtime configuration (component C8, `SPEC_FULL.md` section 4.7 supplement).
//!
//! Carries only the tunables the core itself consumes: the in-flight batch
//! bound, the cooperative scheduler's worker-thread count, and whether the
//! deployment permits explicit location overrides. Loading this from a
//! TOML file, environment variables or a CLI is out of scope (`spec.md`
//! section 1 Non-goals) -- collaborators build or deserialize the struct
//! and hand it to the executor.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Default in-flight batch bound between any two adjacent execution nodes
/// (`spec.md` section 4.5).
pub const DEFAULT_MAX_INFLIGHT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// `N` from `spec.md` section 4.5/8: the maximum number of non-empty
    /// batches outstanding between any two adjacent execution nodes. A
    /// per-edge quantity (`SPEC_FULL.md` Open Question 2).
    pub max_inflight: NonZeroUsize,
    /// Number of OS threads backing the cooperative scheduler. Detached
    /// operators get their own thread on top of this pool.
    pub worker_threads: NonZeroUsize,
    /// Whether this deployment permits an operator to request an explicit
    /// location override (`spec.md` section 4.7, `allow_unsafe_pipelines`).
    pub allow_unsafe_pipelines: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_inflight: NonZeroUsize::new(DEFAULT_MAX_INFLIGHT).unwrap(),
            worker_threads: NonZeroUsize::new(
                std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            )
            .unwrap(),
            allow_unsafe_pipelines: false,
        }
    }
}

impl RuntimeConfig {
    pub fn with_max_inflight(mut self, n: NonZeroUsize) -> Self {
        self.max_inflight = n;
        self
    }

    pub fn with_worker_threads(mut self, n: NonZeroUsize) -> Self {
        self.worker_threads = n;
        self
    }

    pub fn with_allow_unsafe_pipelines(mut self, allow: bool) -> Self {
        self.allow_unsafe_pipelines = allow;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_inflight_matches_spec() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_inflight.get(), DEFAULT_MAX_INFLIGHT);
        assert!(!config.allow_unsafe_pipelines);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let config = RuntimeConfig::default()
            .with_max_inflight(NonZeroUsize::new(5).unwrap())
            .with_allow_unsafe_pipelines(true);
        assert_eq!(config.max_inflight.get(), 5);
        assert!(config.allow_unsafe_pipelines);
    }
}
