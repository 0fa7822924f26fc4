//! Request Correlation
//!
//! The service answers every outbound request with callbacks that carry only
//! the numeric request id. The registry maps an outstanding id back to the
//! instrument it concerns.
//!
//! # Correlation modes
//!
//! - **Single-use**: the record is removed by the first `resolve`
//!   (head timestamp requests).
//! - **Persistent**: the record survives any number of `resolve` calls and is
//!   removed by an explicit `untrack`, normally on the end-of-stream callback
//!   (bar requests, detail requests, tick subscriptions).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::instrument::InstrumentKey;

// =============================================================================
// Types
// =============================================================================

/// Outbound request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u32);

impl RequestId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw id.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an outstanding request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Contract detail lookup.
    InstrumentDetails,
    /// Earliest-data timestamp.
    HeadTimestamp,
    /// One page of historical bars.
    HistoricalBars,
    /// Live price tick subscription.
    PriceTicks,
}

impl RequestKind {
    /// Metric/log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InstrumentDetails => "instrument_details",
            Self::HeadTimestamp => "head_timestamp",
            Self::HistoricalBars => "historical_bars",
            Self::PriceTicks => "price_ticks",
        }
    }
}

/// One outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    /// Request id.
    pub id: RequestId,
    /// Instrument the request concerns.
    pub subject: InstrumentKey,
    /// Whether the record survives `resolve`.
    pub persistent: bool,
    /// What was requested.
    pub kind: RequestKind,
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Id is already outstanding.
    #[error("request id {0} is already tracked")]
    DuplicateRequestId(RequestId),

    /// Id is not (or no longer) tracked.
    #[error("request id {0} is not tracked")]
    UnknownRequestId(RequestId),
}

// =============================================================================
// Registry
// =============================================================================

/// Outstanding request id to instrument mapping.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    records: HashMap<RequestId, RequestRecord>,
}

impl CorrelationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateRequestId`] if `id` is outstanding.
    pub fn track(
        &mut self,
        id: RequestId,
        subject: InstrumentKey,
        persistent: bool,
        kind: RequestKind,
    ) -> Result<(), RegistryError> {
        if self.records.contains_key(&id) {
            return Err(RegistryError::DuplicateRequestId(id));
        }
        self.records.insert(
            id,
            RequestRecord {
                id,
                subject,
                persistent,
                kind,
            },
        );
        Ok(())
    }

    /// Look up the record for `id`, removing it if it is single-use.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownRequestId`] if `id` is not tracked.
    pub fn resolve(&mut self, id: RequestId) -> Result<RequestRecord, RegistryError> {
        let persistent = self
            .records
            .get(&id)
            .map(|record| record.persistent)
            .ok_or(RegistryError::UnknownRequestId(id))?;

        if persistent {
            self.records
                .get(&id)
                .cloned()
                .ok_or(RegistryError::UnknownRequestId(id))
        } else {
            self.records
                .remove(&id)
                .ok_or(RegistryError::UnknownRequestId(id))
        }
    }

    /// Stop tracking `id`. Returns the removed record, if any.
    pub fn untrack(&mut self, id: RequestId) -> Option<RequestRecord> {
        self.records.remove(&id)
    }

    /// Record for `id` without side effects.
    #[must_use]
    pub fn peek(&self, id: RequestId) -> Option<&RequestRecord> {
        self.records.get(&id)
    }

    /// Whether `id` is outstanding.
    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.records.contains_key(&id)
    }

    /// Outstanding records for one instrument.
    pub fn outstanding_for<'a>(
        &'a self,
        subject: &'a InstrumentKey,
    ) -> impl Iterator<Item = &'a RequestRecord> + 'a {
        self.records.values().filter(move |r| &r.subject == subject)
    }

    /// Drop every record. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.records.len();
        self.records.clear();
        count
    }

    /// Number of outstanding records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// =============================================================================
// Id Allocation
// =============================================================================

/// Monotonic request id source.
#[derive(Debug)]
pub struct RequestIdAllocator {
    next: u32,
}

impl Default for RequestIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl RequestIdAllocator {
    /// Allocator starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Never hand out ids below `floor` from now on.
    pub fn advance_to(&mut self, floor: u32) {
        self.next = self.next.max(floor.max(1));
    }

    /// Next id that is not outstanding in `registry`.
    ///
    /// Wraps back to 1 after `u32::MAX`.
    pub fn allocate(&mut self, registry: &CorrelationRegistry) -> RequestId {
        loop {
            let id = RequestId(self.next);
            self.next = self.next.checked_add(1).unwrap_or(1);
            if !registry.contains(id) {
                return id;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn es() -> InstrumentKey {
        InstrumentKey::new("ES_FUT_GLOBEX")
    }

    #[test]
    fn single_use_round_trip() {
        let mut registry = CorrelationRegistry::new();
        registry
            .track(RequestId::new(7), es(), false, RequestKind::HeadTimestamp)
            .unwrap();

        let record = registry.resolve(RequestId::new(7)).unwrap();
        assert_eq!(record.subject, es());
        assert_eq!(
            registry.resolve(RequestId::new(7)),
            Err(RegistryError::UnknownRequestId(RequestId::new(7)))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn persistent_survives_until_untracked() {
        let mut registry = CorrelationRegistry::new();
        registry
            .track(RequestId::new(9), es(), true, RequestKind::HistoricalBars)
            .unwrap();

        for _ in 0..5 {
            assert_eq!(registry.resolve(RequestId::new(9)).unwrap().subject, es());
        }

        assert!(registry.untrack(RequestId::new(9)).is_some());
        assert!(registry.untrack(RequestId::new(9)).is_none());
        assert!(registry.resolve(RequestId::new(9)).is_err());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut registry = CorrelationRegistry::new();
        registry
            .track(RequestId::new(1), es(), true, RequestKind::InstrumentDetails)
            .unwrap();

        let err = registry
            .track(
                RequestId::new(1),
                InstrumentKey::new("NQ_FUT_GLOBEX"),
                false,
                RequestKind::HeadTimestamp,
            )
            .unwrap_err();

        assert_eq!(err, RegistryError::DuplicateRequestId(RequestId::new(1)));
        assert_eq!(registry.peek(RequestId::new(1)).unwrap().subject, es());
    }

    #[test]
    fn untrack_is_idempotent_for_unknown_ids() {
        let mut registry = CorrelationRegistry::new();
        assert!(registry.untrack(RequestId::new(42)).is_none());
        assert!(registry.untrack(RequestId::new(42)).is_none());
    }

    #[test]
    fn outstanding_for_filters_by_subject() {
        let mut registry = CorrelationRegistry::new();
        let nq = InstrumentKey::new("NQ_FUT_GLOBEX");
        registry
            .track(RequestId::new(1), es(), true, RequestKind::PriceTicks)
            .unwrap();
        registry
            .track(RequestId::new(2), es(), true, RequestKind::PriceTicks)
            .unwrap();
        registry
            .track(RequestId::new(3), nq.clone(), true, RequestKind::PriceTicks)
            .unwrap();

        let es_key = es();
        assert_eq!(registry.outstanding_for(&es_key).count(), 2);
        assert_eq!(registry.outstanding_for(&nq).count(), 1);
        assert_eq!(registry.clear(), 3);
    }

    #[test]
    fn allocator_is_monotonic_and_skips_outstanding() {
        let mut registry = CorrelationRegistry::new();
        let mut ids = RequestIdAllocator::new();

        let first = ids.allocate(&registry);
        let second = ids.allocate(&registry);
        assert_eq!(first, RequestId::new(1));
        assert_eq!(second, RequestId::new(2));

        registry
            .track(RequestId::new(3), es(), true, RequestKind::HistoricalBars)
            .unwrap();
        assert_eq!(ids.allocate(&registry), RequestId::new(4));

        ids.advance_to(100);
        assert_eq!(ids.allocate(&registry), RequestId::new(100));
        ids.advance_to(50);
        assert_eq!(ids.allocate(&registry), RequestId::new(101));
    }

    #[test]
    fn allocator_wraps_past_max() {
        let registry = CorrelationRegistry::new();
        let mut ids = RequestIdAllocator { next: u32::MAX };
        assert_eq!(ids.allocate(&registry), RequestId::new(u32::MAX));
        assert_eq!(ids.allocate(&registry), RequestId::new(1));
    }
}
