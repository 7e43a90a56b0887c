//! Welcome to the shared-RELRO linker.
//!
//! The job of this crate (relshare) is:
//!   1. Reserve address space for a shared library before it is loaded, so
//!      that independently started processes can end up with bit-identical
//!      relocated images.
//!   2. Load (pin) the library at that reservation and find its RELRO
//!      segment, the data that is read-only once relocation has run.
//!   3. Let one process (the producer) publish its RELRO bytes in a sealed
//!      shared-memory region, and let every other process (the consumers)
//!      map that region over their own private copies, so the system pays
//!      for those pages once instead of once per process.
//!
//! # Why this is delicate
//! RELRO pages can only be shared if their contents match bit-for-bit, and
//! the contents embed absolute addresses produced by relocation. So all
//! participating processes have to agree on a load address *before* any of
//! them loads the library; that is what the reservation policies in
//! [`reservation`] are for. A hint that misses, or a precursor process that
//! never existed, only costs the optimization: every fallback lands on a
//! private reservation and a private copy, never on an error.
//!
//! The other hazard is that a consumer accepts a descriptor produced by a
//! different process, and that input is unverified. The sharing protocol
//! therefore refuses to map anything unless the incoming geometry matches
//! the local image exactly, and reports what happened through [`outcome`]
//! rather than through errors; a consumer that cannot share simply keeps
//! its own pages.
//!
//! # Basic Concepts for this crate
//!
//! ## Linker
//! All of the work happens through a [`linker::Linker`], one instance per
//! process per library, owned by the embedder's bootstrap sequence. Its
//! single entry point, `ensure_initialized`, is first-call-wins: the first
//! caller establishes the role (producer or consumer), the reservation, and
//! the loaded image; everyone after that observes the established state.
//!
//! ## Engines
//! The OS and platform dependencies sit behind the traits in [`engines`]:
//! address-space reservation, shared-region management, the precursor
//! registry, and the native loader that actually maps the image. There is a
//! real Linux implementation and a scripted test double.
//!
//! ## Error Handling
//! This crate reports errors with the [`RelshareError`] type, which
//! implements std::error::Error and miette's Diagnostic. Only fatal
//! conditions (no address space at all, or a library that will not load)
//! surface as errors; every sharing failure degrades and is recorded
//! instead.

pub mod descriptor;
pub mod engines;
mod error;
pub mod library;
pub mod linker;
pub mod outcome;
mod relro;
pub mod reservation;

pub use descriptor::TransferDescriptor;
pub use error::*;
pub use library::{LibraryImage, UnloadedLibrary};
pub use linker::{Linker, LinkerRole};
pub use outcome::{HistogramRecorder, OutcomeRecorder, SharingOutcome};
pub use reservation::{AddressReservation, ReservationPolicy, ReservationSource};
