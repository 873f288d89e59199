use std::time::Duration;

use strata_error::{strata_bail, StrataResult};

/// Which eviction order the cache uses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PolicyKind {
    /// Evict in insertion order.
    Fifo,
    /// Evict the least recently used buffer first.
    #[default]
    Lru,
}

/// Cache sizing and behavior, fixed at construction.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Smallest allocatable block. Power of two, at least 8.
    pub min_alloc: usize,
    /// Largest allocatable block. Power of two, at most `arena_size`.
    pub max_alloc: usize,
    /// Bytes per arena. Power of two, divides `total_size`, at most 2 GiB.
    pub arena_size: usize,
    /// Upper bound on outstanding allocated bytes across all arenas.
    pub total_size: u64,
    /// Eviction order.
    pub policy_kind: PolicyKind,
    /// How often the background sweeper drops stale index entries. `None`
    /// disables the sweeper.
    pub cleanup_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_alloc: 128 * 1024,
            max_alloc: 16 * 1024 * 1024,
            arena_size: 128 * 1024 * 1024,
            total_size: 1024 * 1024 * 1024,
            policy_kind: PolicyKind::default(),
            cleanup_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl CacheConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Check every construction-time constraint. Violations prevent startup.
    pub fn validate(&self) -> StrataResult<()> {
        if self.min_alloc < 8 || !self.min_alloc.is_power_of_two() {
            strata_bail!(
                InvalidArgument: "min_alloc must be a power of two >= 8, got {}",
                self.min_alloc
            );
        }
        if !self.max_alloc.is_power_of_two() || self.max_alloc < self.min_alloc {
            strata_bail!(
                InvalidArgument: "max_alloc must be a power of two >= min_alloc, got {}",
                self.max_alloc
            );
        }
        if !self.arena_size.is_power_of_two() || self.arena_size < self.max_alloc {
            strata_bail!(
                InvalidArgument: "arena_size must be a power of two >= max_alloc, got {}",
                self.arena_size
            );
        }
        if self.arena_size > (1usize << 31) {
            strata_bail!(
                InvalidArgument: "arena_size must be at most 2 GiB, got {}",
                self.arena_size
            );
        }
        if self.total_size < self.arena_size as u64
            || self.total_size % self.arena_size as u64 != 0
        {
            strata_bail!(
                InvalidArgument: "total_size {} must be a positive multiple of arena_size {}",
                self.total_size,
                self.arena_size
            );
        }
        Ok(())
    }
}

/// Builder for [`CacheConfig`].
#[derive(Clone, Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Smallest allocatable block.
    pub fn min_alloc(mut self, bytes: usize) -> Self {
        self.config.min_alloc = bytes;
        self
    }

    /// Largest allocatable block.
    pub fn max_alloc(mut self, bytes: usize) -> Self {
        self.config.max_alloc = bytes;
        self
    }

    /// Bytes per arena.
    pub fn arena_size(mut self, bytes: usize) -> Self {
        self.config.arena_size = bytes;
        self
    }

    /// Total cache capacity in bytes.
    pub fn total_size(mut self, bytes: u64) -> Self {
        self.config.total_size = bytes;
        self
    }

    /// Eviction order.
    pub fn policy_kind(mut self, kind: PolicyKind) -> Self {
        self.config.policy_kind = kind;
        self
    }

    /// Stale-entry sweep interval, or `None` to disable the sweeper.
    pub fn cleanup_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    /// Finish building. Constraints are checked when the cache (or the
    /// allocator) is constructed, not here.
    pub fn build(self) -> CacheConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn default_is_valid() {
        CacheConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::min_too_small(4, 64, 64, 64)]
    #[case::min_not_pow2(24, 64, 64, 64)]
    #[case::max_not_pow2(8, 48, 64, 64)]
    #[case::max_below_min(64, 8, 64, 64)]
    #[case::arena_below_max(8, 128, 64, 64)]
    #[case::total_not_multiple(8, 64, 64, 96)]
    #[case::total_below_arena(8, 64, 64, 32)]
    fn invalid_configs_rejected(
        #[case] min_alloc: usize,
        #[case] max_alloc: usize,
        #[case] arena_size: usize,
        #[case] total_size: u64,
    ) {
        let config = CacheConfig::builder()
            .min_alloc(min_alloc)
            .max_alloc(max_alloc)
            .arena_size(arena_size)
            .total_size(total_size)
            .build();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, strata_error::StrataError::InvalidArgument(_)));
    }
}
