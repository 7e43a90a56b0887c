//! Address-space reservation, done before the library is loaded so that
//! relocated addresses can match bit-for-bit across processes.

use std::fmt::Display;

use tracing::{debug, warn};

use crate::{
    engines::{PrecursorRegistry, VmProvider},
    library::UnloadedLibrary,
    RelshareError, RelshareErrorKind,
};

/// How the caller asked us to obtain an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationPolicy {
    /// Use the caller-supplied address if non-zero, else behave as `Random`.
    Hint,
    /// Let the OS pick an unused region of the required size.
    Random,
    /// Adopt a region pre-reserved by a privileged precursor process,
    /// falling back to `Random` on a lookup miss.
    FindReserved,
}

/// Which concrete path actually produced a reservation. A policy can resolve
/// through more than one path (hint misses fall back to random, and so on),
/// and the paths are counted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationSource {
    /// A non-zero hint that the OS granted as-is.
    HintHonored,
    /// A zero hint, carrying no information; random reservation was used.
    HintZeroFallback,
    /// A non-zero hint the OS refused; random reservation was used.
    HintRejectedFallback,
    /// Plain random reservation, as requested.
    Random,
    /// Adopted from the precursor registry, no OS reservation call at all.
    Precursor,
    /// Precursor lookup missed; random reservation was used.
    PrecursorMissFallback,
}

impl ReservationSource {
    pub fn name(&self) -> &'static str {
        match self {
            ReservationSource::HintHonored => "hint_honored",
            ReservationSource::HintZeroFallback => "hint_zero_fallback",
            ReservationSource::HintRejectedFallback => "hint_rejected_fallback",
            ReservationSource::Random => "random",
            ReservationSource::Precursor => "precursor",
            ReservationSource::PrecursorMissFallback => "precursor_miss_fallback",
        }
    }
}

/// A granted address reservation. Created once per process during
/// initialization, immutable afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressReservation {
    pub base_address: usize,
    pub length: usize,
    pub policy: ReservationPolicy,
    pub source: ReservationSource,
}

impl Display for AddressReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:#x}..{:#x}] ({})",
            self.base_address,
            self.base_address + self.length,
            self.source.name()
        )
    }
}

/// Obtain an address reservation for `library` under the requested policy.
///
/// Policy misses are recoverable: a refused hint or a precursor lookup miss
/// falls back to a random reservation, since the worst outcome of a miss is
/// loss of the sharing optimization, never loss of correctness. Only a
/// refusal to grant any region at all is an error.
pub(crate) fn reserve<E>(
    engine: &mut E,
    library: &UnloadedLibrary,
    policy: ReservationPolicy,
    hint_address: usize,
    required_length: usize,
) -> Result<AddressReservation, RelshareError>
where
    E: VmProvider + PrecursorRegistry,
{
    let (base, source) = match policy {
        ReservationPolicy::Hint if hint_address != 0 => {
            match engine.reserve(hint_address, required_length) {
                Ok(base) => (base, ReservationSource::HintHonored),
                Err(err) => {
                    warn!(
                        "{}: hint {:#x} refused ({}), falling back to random reservation",
                        library.name, hint_address, err
                    );
                    (
                        reserve_random(engine, library, required_length)?,
                        ReservationSource::HintRejectedFallback,
                    )
                }
            }
        }
        // A zero hint carries no information.
        ReservationPolicy::Hint => (
            reserve_random(engine, library, required_length)?,
            ReservationSource::HintZeroFallback,
        ),
        ReservationPolicy::Random => (
            reserve_random(engine, library, required_length)?,
            ReservationSource::Random,
        ),
        ReservationPolicy::FindReserved => match engine.find_reserved_region(library) {
            Some(base) if base != 0 => {
                // The precursor already holds the reservation; adopting it
                // costs zero extra syscalls.
                debug!(
                    "{}: adopting precursor reservation at {:#x}",
                    library.name, base
                );
                (base, ReservationSource::Precursor)
            }
            _ => {
                debug!(
                    "{}: no precursor reservation, falling back to random",
                    library.name
                );
                (
                    reserve_random(engine, library, required_length)?,
                    ReservationSource::PrecursorMissFallback,
                )
            }
        },
    };

    let reservation = AddressReservation {
        base_address: base,
        length: required_length,
        policy,
        source,
    };
    debug!("{}: reserved {}", library.name, reservation);
    Ok(reservation)
}

fn reserve_random<E: VmProvider>(
    engine: &mut E,
    library: &UnloadedLibrary,
    required_length: usize,
) -> Result<usize, RelshareError> {
    engine.reserve(0, required_length).map_err(|err| {
        RelshareError::new_collect(
            RelshareErrorKind::ReservationFail {
                library: library.name.clone(),
                length: required_length,
            },
            vec![err],
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::fake::FakeEngine;

    fn lib() -> UnloadedLibrary {
        UnloadedLibrary::new("libmono.so")
    }

    #[test]
    fn honored_hint_lands_exactly_there() {
        let mut eng = FakeEngine::new();
        let res = reserve(&mut eng, &lib(), ReservationPolicy::Hint, 0x7000_0000, 0x4000).unwrap();
        assert_eq!(res.base_address, 0x7000_0000);
        assert_eq!(res.source, ReservationSource::HintHonored);
        assert_eq!(eng.reserve_calls(), 1);
    }

    #[test]
    fn zero_hint_behaves_as_random() {
        let mut eng = FakeEngine::new();
        let res = reserve(&mut eng, &lib(), ReservationPolicy::Hint, 0, 0x4000).unwrap();
        assert_eq!(res.source, ReservationSource::HintZeroFallback);
        // The same underlying call sequence as Random: one anywhere-reserve.
        assert_eq!(res.base_address, FakeEngine::FIRST_RANDOM_BASE);
        assert_eq!(eng.reserve_calls(), 1);
        assert_eq!(eng.anywhere_reserve_calls(), 1);
    }

    #[test]
    fn rejected_hint_falls_back_to_random() {
        let mut eng = FakeEngine::new();
        eng.occupy(0x7000_0000, 0x4000);
        let res = reserve(&mut eng, &lib(), ReservationPolicy::Hint, 0x7000_0000, 0x4000).unwrap();
        assert_eq!(res.source, ReservationSource::HintRejectedFallback);
        assert_ne!(res.base_address, 0x7000_0000);
        assert_ne!(res.base_address, 0);
        assert_eq!(eng.reserve_calls(), 2);
    }

    #[test]
    fn precursor_hit_skips_os_reservation() {
        let mut eng = FakeEngine::new();
        eng.publish_precursor_region("libmono.so", 0x6000_0000);
        let res =
            reserve(&mut eng, &lib(), ReservationPolicy::FindReserved, 0, 0x4000).unwrap();
        assert_eq!(res.base_address, 0x6000_0000);
        assert_eq!(res.source, ReservationSource::Precursor);
        assert_eq!(eng.reserve_calls(), 0);
    }

    #[test]
    fn precursor_miss_makes_exactly_one_random_call() {
        let mut eng = FakeEngine::new();
        let res =
            reserve(&mut eng, &lib(), ReservationPolicy::FindReserved, 0, 0x4000).unwrap();
        assert_eq!(res.source, ReservationSource::PrecursorMissFallback);
        assert_ne!(res.base_address, 0);
        assert_eq!(eng.reserve_calls(), 1);
        assert_eq!(eng.anywhere_reserve_calls(), 1);
    }

    #[test]
    fn total_reservation_refusal_is_an_error() {
        let mut eng = FakeEngine::new();
        eng.refuse_all_reservations();
        let err =
            reserve(&mut eng, &lib(), ReservationPolicy::Random, 0, 0x4000).unwrap_err();
        assert!(matches!(
            err.kind,
            crate::RelshareErrorKind::ReservationFail { .. }
        ));
    }
}
