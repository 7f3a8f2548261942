//! Admission control.
//!
//! Decides whether a new key may be built: admit outright, admit after
//! evicting an idle entry, or reject with a busy signal. Bounded memory and
//! VRAM take priority over admitting work, so nothing ever queues here.

use std::sync::Arc;

use crate::types::ModelConfig;

use super::entry::CacheEntry;

/// Outcome of an admission check.
pub(crate) enum Admission<H: Send + Sync + 'static> {
    /// A slot is free.
    Admit,
    /// At capacity; this idle entry must go first.
    Evict(Arc<CacheEntry<H>>),
    /// At capacity and every resident entry is streaming or still building.
    Busy,
}

/// Capacity and per-instance occupancy policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Maximum distinct keys resident or building at once.
    pub max_models: usize,
    /// Sequence slots held back by instances in incremental cache mode.
    pub reserved_slots: usize,
}

impl AdmissionPolicy {
    pub fn new(max_models: usize, reserved_slots: usize) -> Self {
        Self {
            max_models: max_models.max(1),
            reserved_slots,
        }
    }

    /// Maximum concurrent streams for an instance built with `config`.
    ///
    /// `None` when the config does not declare a sequence count. Incremental
    /// cache mode consumes `reserved_slots` of the declared sequences, but an
    /// instance always admits at least one stream.
    pub fn stream_limit(&self, config: &ModelConfig) -> Option<usize> {
        let sequences = config.parallel_sequences? as usize;
        let reserved = if config.uses_incremental_cache() {
            self.reserved_slots
        } else {
            0
        };
        Some(sequences.saturating_sub(reserved).max(1))
    }

    /// Check whether one more key fits next to `live` keys.
    ///
    /// `ready` are the Ready entries eligible for eviction. The victim is the
    /// idle one with the oldest `last_used_at`; ties go to the oldest
    /// instance, so the choice is deterministic.
    pub(crate) fn admit<'a, H, I>(&self, live: usize, ready: I) -> Admission<H>
    where
        H: Send + Sync + 'static,
        I: IntoIterator<Item = &'a Arc<CacheEntry<H>>>,
    {
        if live < self.max_models {
            return Admission::Admit;
        }

        ready
            .into_iter()
            .filter(|entry| entry.active_streams() == 0)
            .min_by_key(|entry| (entry.last_used_at(), entry.id()))
            .map(|entry| Admission::Evict(Arc::clone(entry)))
            .unwrap_or(Admission::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_models_is_at_least_one() {
        assert_eq!(AdmissionPolicy::new(0, 1).max_models, 1);
        assert_eq!(AdmissionPolicy::new(3, 1).max_models, 3);
    }

    #[test]
    fn stream_limit_without_sequences_is_unbounded() {
        let policy = AdmissionPolicy::new(3, 1);
        assert_eq!(policy.stream_limit(&ModelConfig::new()), None);
    }

    #[test]
    fn stream_limit_reserves_for_incremental_cache() {
        let policy = AdmissionPolicy::new(3, 1);
        let plain = ModelConfig::new().parallel_sequences(4);
        let incremental = ModelConfig::new()
            .parallel_sequences(4)
            .incremental_cache(true);

        assert_eq!(policy.stream_limit(&plain), Some(4));
        assert_eq!(policy.stream_limit(&incremental), Some(3));
    }

    #[test]
    fn stream_limit_never_below_one() {
        let policy = AdmissionPolicy::new(3, 2);
        let config = ModelConfig::new()
            .parallel_sequences(1)
            .incremental_cache(true);
        assert_eq!(policy.stream_limit(&config), Some(1));
    }

    #[test]
    fn admits_below_capacity() {
        let policy = AdmissionPolicy::new(2, 0);
        let none: Vec<Arc<CacheEntry<u32>>> = Vec::new();
        assert!(matches!(policy.admit(1, &none), Admission::Admit));
        assert!(matches!(policy.admit(2, &none), Admission::Busy));
    }
}
