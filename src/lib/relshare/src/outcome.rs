//! Outcome recording. One sharing sample per consumer process per library,
//! keyed by a fixed metric name. Telemetry must not be able to destabilize
//! the loading path, so recording never reports failure to its caller.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::reservation::ReservationSource;

/// Metric name for consumer sharing outcomes.
pub const SHARING_METRIC: &str = "relshare.relro_sharing_status";
/// Metric name for reservation-source samples.
pub const RESERVATION_METRIC: &str = "relshare.reservation_source";

/// How RELRO adoption went for this process. Exactly one outcome other than
/// `NotAttempted` is recorded per consumer process per library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharingOutcome {
    NotAttempted,
    Success,
    NoSharedRegionProvided,
    AddressOrSizeMismatch,
    RegionMapFailed,
}

impl SharingOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            SharingOutcome::NotAttempted => "not_attempted",
            SharingOutcome::Success => "success",
            SharingOutcome::NoSharedRegionProvided => "no_shared_region_provided",
            SharingOutcome::AddressOrSizeMismatch => "address_or_size_mismatch",
            SharingOutcome::RegionMapFailed => "region_map_failed",
        }
    }

    fn index(&self) -> usize {
        match self {
            SharingOutcome::NotAttempted => 0,
            SharingOutcome::Success => 1,
            SharingOutcome::NoSharedRegionProvided => 2,
            SharingOutcome::AddressOrSizeMismatch => 3,
            SharingOutcome::RegionMapFailed => 4,
        }
    }
}

/// Sink for outcome samples.
pub trait OutcomeRecorder {
    fn record_sharing(&self, outcome: SharingOutcome);
    fn record_reservation(&self, source: ReservationSource);
}

fn source_index(source: ReservationSource) -> usize {
    match source {
        ReservationSource::HintHonored => 0,
        ReservationSource::HintZeroFallback => 1,
        ReservationSource::HintRejectedFallback => 2,
        ReservationSource::Random => 3,
        ReservationSource::Precursor => 4,
        ReservationSource::PrecursorMissFallback => 5,
    }
}

/// In-process histogram of outcome samples, logged through `tracing` for
/// whatever collector the embedder has installed.
#[derive(Debug, Default)]
pub struct HistogramRecorder {
    sharing: [AtomicU64; 5],
    reservation: [AtomicU64; 6],
}

impl HistogramRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sharing_count(&self, outcome: SharingOutcome) -> u64 {
        self.sharing[outcome.index()].load(Ordering::Relaxed)
    }

    pub fn reservation_count(&self, source: ReservationSource) -> u64 {
        self.reservation[source_index(source)].load(Ordering::Relaxed)
    }
}

impl OutcomeRecorder for HistogramRecorder {
    fn record_sharing(&self, outcome: SharingOutcome) {
        self.sharing[outcome.index()].fetch_add(1, Ordering::Relaxed);
        debug!(metric = SHARING_METRIC, sample = outcome.name(), "recorded sharing outcome");
    }

    fn record_reservation(&self, source: ReservationSource) {
        self.reservation[source_index(source)].fetch_add(1, Ordering::Relaxed);
        debug!(metric = RESERVATION_METRIC, sample = source.name(), "recorded reservation source");
    }
}
