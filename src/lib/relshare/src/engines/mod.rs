//! System-specific implementation seams for the linker: address-space
//! reservation, shared-region management, precursor lookup, and the native
//! loader that actually maps the library.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod linux;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt::Debug;

use crate::{
    library::{LibraryImage, UnloadedLibrary},
    reservation::AddressReservation,
    RelshareError,
};

/// A transferable reference to a sealed, read-only shared memory region.
/// Cheap to clone; the underlying region lives until every handle and every
/// mapping of it is gone.
pub trait RegionHandle: Clone + Debug {
    /// Size of the region this handle refers to, or `None` if the handle
    /// cannot be interrogated (a present-but-unusable handle).
    fn byte_len(&self) -> Option<u64>;
}

/// Virtual-memory primitives the linker builds on. One implementation talks
/// to the real OS; tests substitute a scripted double.
pub trait VmProvider {
    /// An unsealed shared region being filled by the producer.
    type Region;
    /// The transferable form of a sealed region.
    type Handle: RegionHandle;

    /// Reserve `length` bytes of address space. `at == 0` lets the OS pick
    /// the address; a non-zero `at` must be granted exactly or refused.
    fn reserve(&mut self, at: usize, length: usize) -> Result<usize, RelshareError>;

    /// Give back a reservation obtained from [`Self::reserve`].
    fn release(&mut self, base: usize, length: usize);

    /// Create a new shared-memory region of `length` bytes, writable by this
    /// process until sealed.
    fn create_region(&mut self, length: usize) -> Result<Self::Region, RelshareError>;

    /// Copy `length` bytes starting at local address `src` into the region.
    fn populate_region(
        &mut self,
        region: &mut Self::Region,
        src: usize,
        length: usize,
    ) -> Result<(), RelshareError>;

    /// Seal the region read-only and return its transferable handle. After
    /// this, no process may write to the region.
    fn seal_region(&mut self, region: Self::Region) -> Result<Self::Handle, RelshareError>;

    /// Map the sealed region read-only over `[at, at + length)`, replacing
    /// whatever private pages are there.
    fn map_region(
        &mut self,
        handle: &Self::Handle,
        at: usize,
        length: usize,
    ) -> Result<(), RelshareError>;
}

/// Lookup of regions pre-reserved by a privileged precursor process. The
/// only reservation path that depends on a third party outside this process.
pub trait PrecursorRegistry {
    fn find_reserved_region(&mut self, library: &UnloadedLibrary) -> Option<usize>;
}

/// The native loader seam. Maps and pins the library at a previously
/// reserved range and reports the RELRO sub-range; relocation arithmetic
/// belongs to the underlying loader, not to this crate.
pub trait ImageLoader {
    /// The reservation length needed for `library`, known before reserving.
    fn image_extent(&mut self, library: &UnloadedLibrary) -> Result<usize, RelshareError>;

    /// Load `library` pinned to `reservation`.
    fn load_at(
        &mut self,
        library: &UnloadedLibrary,
        reservation: &AddressReservation,
    ) -> Result<LibraryImage, RelshareError>;
}

/// Everything a [`crate::Linker`] needs from the platform.
pub trait LinkerEngine: VmProvider + PrecursorRegistry + ImageLoader {}

impl<T: VmProvider + PrecursorRegistry + ImageLoader> LinkerEngine for T {}
