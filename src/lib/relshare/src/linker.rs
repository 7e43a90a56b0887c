//! The per-process linker context. The embedder's bootstrap sequence owns
//! exactly one `Linker` per shared library and drives it through
//! [`Linker::ensure_initialized`] before any code from that library runs.

use humansize::{make_format, BINARY};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    descriptor::TransferDescriptor,
    engines::{LinkerEngine, VmProvider},
    library::{LibraryImage, UnloadedLibrary},
    outcome::{HistogramRecorder, OutcomeRecorder, SharingOutcome},
    relro::RelroSharer,
    reservation::{self, AddressReservation, ReservationPolicy, ReservationSource},
    RelshareError, RelshareErrorKind,
};

/// Fixed for the lifetime of a process once initialization runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkerRole {
    /// Creates and publishes the shared RELRO region.
    Producer,
    /// Receives an already-published region and maps it over its own pages.
    Consumer,
}

enum State<H> {
    Uninitialized,
    Ready {
        role: LinkerRole,
        reservation: AddressReservation,
        image: LibraryImage,
        /// Present for producers; handed to the embedder's transport.
        descriptor: Option<TransferDescriptor<H>>,
    },
    Failed,
}

struct Inner<E: VmProvider> {
    engine: E,
    sharer: RelroSharer,
    state: State<E::Handle>,
}

/// One linker instance per process per library. All public operations are
/// safe to call from any thread; initialization runs under an exclusive
/// lock, so concurrent first-callers race to a single winner and everyone
/// else observes the established state.
pub struct Linker<E: LinkerEngine, R: OutcomeRecorder = HistogramRecorder> {
    library: UnloadedLibrary,
    recorder: R,
    inner: Mutex<Inner<E>>,
}

impl<E: LinkerEngine> Linker<E, HistogramRecorder> {
    pub fn new(engine: E, library: UnloadedLibrary) -> Self {
        Self::with_recorder(engine, library, HistogramRecorder::new())
    }
}

impl<E: LinkerEngine, R: OutcomeRecorder> Linker<E, R> {
    pub fn with_recorder(engine: E, library: UnloadedLibrary, recorder: R) -> Self {
        Self {
            library,
            recorder,
            inner: Mutex::new(Inner {
                engine,
                sharer: RelroSharer::new(),
                state: State::Uninitialized,
            }),
        }
    }

    /// Reserve address space, load the library there, and (for producers)
    /// publish the shared RELRO descriptor.
    ///
    /// First-call-wins: the first call establishes role, reservation, and
    /// image for the process; later calls are no-ops whose arguments are
    /// ignored. A failed first call leaves the linker failed for good, and
    /// later calls keep reporting that failure without retrying.
    pub fn ensure_initialized(
        &self,
        as_producer: bool,
        policy: ReservationPolicy,
        hint_address: usize,
    ) -> Result<(), RelshareError> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Ready { role, .. } => {
                debug!(
                    "{}: already initialized as {:?}, ignoring arguments",
                    self.library.name, role
                );
                return Ok(());
            }
            State::Failed => {
                return Err(RelshareErrorKind::InitializationFailed {
                    library: self.library.name.clone(),
                }
                .into());
            }
            State::Uninitialized => {}
        }

        match self.initialize(&mut inner, as_producer, policy, hint_address) {
            Ok(state) => {
                inner.state = state;
                Ok(())
            }
            Err(err) => {
                warn!("{}: initialization failed: {}", self.library.name, err);
                inner.state = State::Failed;
                Err(err)
            }
        }
    }

    fn initialize(
        &self,
        inner: &mut Inner<E>,
        as_producer: bool,
        policy: ReservationPolicy,
        hint_address: usize,
    ) -> Result<State<E::Handle>, RelshareError> {
        let required_length = inner.engine.image_extent(&self.library)?;
        let reservation = reservation::reserve(
            &mut inner.engine,
            &self.library,
            policy,
            hint_address,
            required_length,
        )?;
        self.recorder.record_reservation(reservation.source);

        let image = match inner.engine.load_at(&self.library, &reservation) {
            Ok(image) => image,
            Err(err) => {
                // A precursor-owned reservation is not ours to give back.
                if reservation.source != ReservationSource::Precursor {
                    inner
                        .engine
                        .release(reservation.base_address, reservation.length);
                }
                return Err(RelshareError::new_collect(
                    RelshareErrorKind::LibraryLoadFail {
                        library: self.library.clone(),
                    },
                    vec![err],
                ));
            }
        };

        let formatter = make_format(BINARY);
        debug!(
            "{}: loaded to {:#x} ({} image, {} relro)",
            self.library.name,
            image.load_address,
            formatter(image.load_size as u64),
            formatter(image.relro_size as u64),
        );

        let (role, descriptor) = if as_producer {
            let descriptor = RelroSharer::publish(&mut inner.engine, &image);
            (LinkerRole::Producer, Some(descriptor))
        } else {
            (LinkerRole::Consumer, None)
        };

        Ok(State::Ready {
            role,
            reservation,
            image,
            descriptor,
        })
    }

    /// Consumer side: apply a descriptor received from the producer. May be
    /// called at any time after this process's own initialization,
    /// independent of whether the producer has finished anything else.
    ///
    /// On a producer or an uninitialized/failed linker this is a no-op
    /// reporting [`SharingOutcome::NotAttempted`]; nothing is recorded.
    pub fn adopt_descriptor(
        &self,
        incoming: &TransferDescriptor<E::Handle>,
    ) -> SharingOutcome {
        let inner = &mut *self.inner.lock();
        match &inner.state {
            State::Ready {
                role: LinkerRole::Consumer,
                image,
                ..
            } => inner
                .sharer
                .adopt(&mut inner.engine, &self.recorder, image, incoming),
            State::Ready { role, .. } => {
                debug!(
                    "{}: descriptor delivered to {:?}, ignoring",
                    self.library.name, role
                );
                inner.sharer.outcome()
            }
            _ => {
                debug!(
                    "{}: descriptor delivered before initialization, ignoring",
                    self.library.name
                );
                inner.sharer.outcome()
            }
        }
    }

    /// Parse descriptor bytes (plus the handle that traveled with them) and
    /// adopt the result. Parse failures fail closed, like a mismatch.
    pub fn adopt_serialized(
        &self,
        bytes: &[u8],
        handle: Option<E::Handle>,
    ) -> SharingOutcome {
        match TransferDescriptor::deserialize(bytes, handle) {
            Ok(desc) => self.adopt_descriptor(&desc),
            Err(err) => {
                warn!(
                    "{}: rejecting malformed incoming descriptor: {}",
                    self.library.name, err
                );
                self.sharing_outcome()
            }
        }
    }

    /// The descriptor to hand to the cross-process transport. Producers
    /// have one after successful initialization; consumers never do.
    pub fn descriptor_for_transport(&self) -> Option<TransferDescriptor<E::Handle>> {
        match &self.inner.lock().state {
            State::Ready { descriptor, .. } => descriptor.clone(),
            _ => None,
        }
    }

    pub fn library(&self) -> &UnloadedLibrary {
        &self.library
    }

    pub fn role(&self) -> Option<LinkerRole> {
        match &self.inner.lock().state {
            State::Ready { role, .. } => Some(*role),
            _ => None,
        }
    }

    pub fn reservation(&self) -> Option<AddressReservation> {
        match &self.inner.lock().state {
            State::Ready { reservation, .. } => Some(*reservation),
            _ => None,
        }
    }

    pub fn image(&self) -> Option<LibraryImage> {
        match &self.inner.lock().state {
            State::Ready { image, .. } => Some(image.clone()),
            _ => None,
        }
    }

    /// The recorded sharing outcome for this process.
    pub fn sharing_outcome(&self) -> SharingOutcome {
        self.inner.lock().sharer.outcome()
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }
}
