//! A scripted engine for tests: byte-granular fake process memory, counted
//! reservation calls, and switchable refusals for every OS interaction.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use super::{ImageLoader, PrecursorRegistry, RegionHandle, VmProvider};
use crate::{
    library::{LibraryImage, UnloadedLibrary},
    reservation::AddressReservation,
    RelshareError, RelshareErrorKind,
};

#[derive(Debug, Clone)]
pub(crate) struct FakeHandle {
    bytes: Arc<Vec<u8>>,
    reported: Option<u64>,
}

impl FakeHandle {
    /// A handle claiming to back `len` zeroed bytes.
    pub(crate) fn with_len(len: usize) -> Self {
        Self {
            bytes: Arc::new(vec![0; len]),
            reported: Some(len as u64),
        }
    }

    /// A handle that cannot be interrogated at all.
    pub(crate) fn unusable() -> Self {
        Self {
            bytes: Arc::new(Vec::new()),
            reported: None,
        }
    }
}

impl RegionHandle for FakeHandle {
    fn byte_len(&self) -> Option<u64> {
        self.reported
    }
}

pub(crate) struct FakeEngine {
    memory: BTreeMap<usize, u8>,
    reservations: Vec<(usize, usize)>,
    occupied: Vec<(usize, usize)>,
    precursor: HashMap<String, usize>,

    refuse_reservations: bool,
    refuse_create: bool,
    refuse_map: bool,
    refuse_load: bool,

    next_base: usize,
    reserve_calls: usize,
    anywhere_calls: usize,
    map_calls: usize,
    release_calls: usize,

    extent: usize,
    relro_offset: usize,
    relro_size: usize,
    relro_fill: u8,
}

impl FakeEngine {
    pub(crate) const FIRST_RANDOM_BASE: usize = 0x5500_0000;

    pub(crate) fn new() -> Self {
        Self {
            memory: BTreeMap::new(),
            reservations: Vec::new(),
            occupied: Vec::new(),
            precursor: HashMap::new(),
            refuse_reservations: false,
            refuse_create: false,
            refuse_map: false,
            refuse_load: false,
            next_base: Self::FIRST_RANDOM_BASE,
            reserve_calls: 0,
            anywhere_calls: 0,
            map_calls: 0,
            release_calls: 0,
            extent: 0x8000,
            relro_offset: 0x4000,
            relro_size: 0x1000,
            relro_fill: 0xc3,
        }
    }

    pub(crate) fn with_relro_fill(mut self, fill: u8) -> Self {
        self.relro_fill = fill;
        self
    }

    pub(crate) fn with_relro_geometry(mut self, offset: usize, size: usize) -> Self {
        self.relro_offset = offset;
        self.relro_size = size;
        self
    }

    /// Mark a range as taken, so exact-address requests against it fail.
    pub(crate) fn occupy(&mut self, base: usize, length: usize) {
        self.occupied.push((base, length));
    }

    pub(crate) fn publish_precursor_region(&mut self, name: &str, base: usize) {
        self.precursor.insert(name.to_string(), base);
    }

    pub(crate) fn refuse_all_reservations(&mut self) {
        self.refuse_reservations = true;
    }

    pub(crate) fn refuse_region_creation(&mut self) {
        self.refuse_create = true;
    }

    pub(crate) fn refuse_region_maps(&mut self) {
        self.refuse_map = true;
    }

    pub(crate) fn refuse_loads(&mut self) {
        self.refuse_load = true;
    }

    pub(crate) fn reserve_calls(&self) -> usize {
        self.reserve_calls
    }

    pub(crate) fn anywhere_reserve_calls(&self) -> usize {
        self.anywhere_calls
    }

    pub(crate) fn map_calls(&self) -> usize {
        self.map_calls
    }

    pub(crate) fn release_calls(&self) -> usize {
        self.release_calls
    }

    pub(crate) fn read_memory(&self, addr: usize, len: usize) -> Vec<u8> {
        (addr..addr + len)
            .map(|a| self.memory.get(&a).copied().unwrap_or(0))
            .collect()
    }

    fn write_memory(&mut self, addr: usize, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(addr + i, *b);
        }
    }

    fn overlaps_taken(&self, base: usize, length: usize) -> bool {
        self.occupied
            .iter()
            .chain(self.reservations.iter())
            .any(|(b, l)| base < b + l && *b < base + length)
    }

    fn refused(what: &str) -> RelshareError {
        RelshareErrorKind::os(what, std::io::Error::other("refused by fake engine")).into()
    }
}

impl VmProvider for FakeEngine {
    type Region = Vec<u8>;
    type Handle = FakeHandle;

    fn reserve(&mut self, at: usize, length: usize) -> Result<usize, RelshareError> {
        self.reserve_calls += 1;
        if self.refuse_reservations {
            return Err(Self::refused("reserve"));
        }
        if at != 0 {
            if self.overlaps_taken(at, length) {
                return Err(Self::refused("exact-address reserve"));
            }
            self.reservations.push((at, length));
            return Ok(at);
        }
        self.anywhere_calls += 1;
        let base = self.next_base;
        self.next_base += length.next_multiple_of(0x1000) + 0x1000;
        self.reservations.push((base, length));
        Ok(base)
    }

    fn release(&mut self, base: usize, length: usize) {
        self.release_calls += 1;
        self.reservations.retain(|r| *r != (base, length));
    }

    fn create_region(&mut self, length: usize) -> Result<Self::Region, RelshareError> {
        if self.refuse_create {
            return Err(Self::refused("create_region"));
        }
        Ok(vec![0; length])
    }

    fn populate_region(
        &mut self,
        region: &mut Self::Region,
        src: usize,
        length: usize,
    ) -> Result<(), RelshareError> {
        if region.len() < length {
            return Err(RelshareErrorKind::RegionPopulateFail { src }.into());
        }
        let bytes = self.read_memory(src, length);
        region[..length].copy_from_slice(&bytes);
        Ok(())
    }

    fn seal_region(&mut self, region: Self::Region) -> Result<Self::Handle, RelshareError> {
        let len = region.len() as u64;
        Ok(FakeHandle {
            bytes: Arc::new(region),
            reported: Some(len),
        })
    }

    fn map_region(
        &mut self,
        handle: &Self::Handle,
        at: usize,
        length: usize,
    ) -> Result<(), RelshareError> {
        self.map_calls += 1;
        if self.refuse_map {
            return Err(RelshareErrorKind::RegionMapFail { addr: at }.into());
        }
        let n = length.min(handle.bytes.len());
        let bytes = handle.bytes[..n].to_vec();
        self.write_memory(at, &bytes);
        Ok(())
    }
}

impl PrecursorRegistry for FakeEngine {
    fn find_reserved_region(&mut self, library: &UnloadedLibrary) -> Option<usize> {
        self.precursor.get(&library.name).copied()
    }
}

impl ImageLoader for FakeEngine {
    fn image_extent(&mut self, _library: &UnloadedLibrary) -> Result<usize, RelshareError> {
        Ok(self.extent)
    }

    fn load_at(
        &mut self,
        library: &UnloadedLibrary,
        reservation: &AddressReservation,
    ) -> Result<LibraryImage, RelshareError> {
        if self.refuse_load {
            return Err(RelshareErrorKind::LibraryLoadFail {
                library: library.clone(),
            }
            .into());
        }
        if reservation.length < self.extent {
            return Err(RelshareErrorKind::ReservationTooSmall {
                library: library.name.clone(),
                needed: self.extent,
                reserved: reservation.length,
            }
            .into());
        }
        let relro_start = reservation.base_address + self.relro_offset;
        let fill = vec![self.relro_fill; self.relro_size];
        self.write_memory(relro_start, &fill);
        LibraryImage::new(
            &library.name,
            reservation.base_address,
            self.extent,
            relro_start,
            self.relro_size,
        )
    }
}
