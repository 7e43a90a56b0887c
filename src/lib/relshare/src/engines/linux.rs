//! The real engine: anonymous `PROT_NONE` reservations, memfd-backed sealed
//! regions, and an ELF segment mapper that pins the image to the reserved
//! range and reports the `PT_GNU_RELRO` sub-range.
//!
//! Relocation arithmetic is not performed here; images are expected to be
//! position-independent, with any outstanding fixups owned by the embedding
//! loader.

use std::{
    ffi::CString,
    fs,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    path::{Path, PathBuf},
    sync::Arc,
};

use elf::{abi, endian::NativeEndian, ElfBytes};
use tracing::{debug, trace, warn};

use super::{ImageLoader, PrecursorRegistry, RegionHandle, VmProvider};
use crate::{
    library::{LibraryImage, UnloadedLibrary},
    reservation::AddressReservation,
    RelshareError, RelshareErrorKind,
};

/// Environment variable a precursor process sets before forking, so its
/// descendants can adopt the reservation without a lookup channel of their
/// own. Value format: comma-separated `<library name>:<hex base>` entries.
pub const PRECURSOR_REGION_VAR: &str = "RELSHARE_RESERVED_REGION";

bitflags::bitflags! {
    /// Access protection for a mapped segment.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

impl Protection {
    fn from_phdr_flags(p_flags: u32) -> Self {
        let mut prot = Protection::empty();
        if p_flags & abi::PF_R != 0 {
            prot |= Protection::READ;
        }
        if p_flags & abi::PF_W != 0 {
            prot |= Protection::WRITE;
        }
        if p_flags & abi::PF_X != 0 {
            prot |= Protection::EXEC;
        }
        prot
    }

    fn as_prot(&self) -> libc::c_int {
        let mut prot = 0;
        if self.contains(Protection::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Protection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Protection::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// A sealed memfd region. Cloning shares the descriptor; the kernel keeps
/// the region alive until every descriptor and mapping is gone.
#[derive(Debug, Clone)]
pub struct MemfdHandle {
    fd: Arc<OwnedFd>,
}

impl MemfdHandle {
    /// The raw descriptor, for handing to a transport (e.g. SCM_RIGHTS).
    pub fn as_raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    /// Adopt a descriptor received from a transport.
    ///
    /// # Safety
    /// `fd` must be an open file descriptor owned by the caller, not used
    /// again after this call.
    pub unsafe fn from_raw_fd(fd: i32) -> Self {
        Self {
            fd: Arc::new(OwnedFd::from_raw_fd(fd)),
        }
    }
}

impl RegionHandle for MemfdHandle {
    fn byte_len(&self) -> Option<u64> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(self.fd.as_raw_fd(), &mut st) };
        if rc != 0 {
            return None;
        }
        u64::try_from(st.st_size).ok()
    }
}

/// An unsealed region being filled by the producer.
pub struct MemfdRegion {
    fd: OwnedFd,
    length: usize,
}

/// The mmap/memfd-backed engine.
pub struct LinuxEngine {
    search_paths: Vec<PathBuf>,
    page_size: usize,
}

impl Default for LinuxEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxEngine {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        Self {
            search_paths: Vec::new(),
            page_size,
        }
    }

    /// Add a directory to search for libraries named without a path.
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    fn resolve(&self, library: &UnloadedLibrary) -> Result<PathBuf, RelshareError> {
        let name = Path::new(&library.name);
        if name.is_absolute() || library.name.contains('/') {
            return Ok(name.to_path_buf());
        }
        for dir in &self.search_paths {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(RelshareErrorKind::LibraryLoadFail {
            library: library.clone(),
        }
        .into())
    }

    fn page_down(&self, v: usize) -> usize {
        v & !(self.page_size - 1)
    }

    fn page_up(&self, v: usize) -> usize {
        (v + self.page_size - 1) & !(self.page_size - 1)
    }

    /// The page-rounded extent of all PT_LOAD segments.
    fn extent_of(&self, elf: &ElfBytes<'_, NativeEndian>) -> Result<(usize, usize), RelshareError> {
        let segments = elf
            .segments()
            .ok_or_else(|| RelshareErrorKind::MissingSegment {
                name: "program headers".to_string(),
            })?;
        let mut lo = usize::MAX;
        let mut hi = 0usize;
        for phdr in segments.iter().filter(|p| p.p_type == abi::PT_LOAD) {
            lo = lo.min(self.page_down(phdr.p_vaddr as usize));
            hi = hi.max(self.page_up((phdr.p_vaddr + phdr.p_memsz) as usize));
        }
        if lo > hi {
            return Err(RelshareErrorKind::MissingSegment {
                name: "PT_LOAD".to_string(),
            }
            .into());
        }
        Ok((lo, hi))
    }

    fn map_segment(
        &self,
        file: &fs::File,
        base: usize,
        phdr: &elf::segment::ProgramHeader,
    ) -> Result<(), RelshareError> {
        let prot = Protection::from_phdr_flags(phdr.p_flags);
        let vaddr = phdr.p_vaddr as usize;
        let filesz = phdr.p_filesz as usize;
        let memsz = phdr.p_memsz as usize;
        let seg_start = base + self.page_down(vaddr);
        let lead = vaddr - self.page_down(vaddr);
        let file_off = self.page_down(phdr.p_offset as usize);

        trace!(
            "mapping segment vaddr {:#x} filesz {:#x} memsz {:#x} prot {:?}",
            vaddr,
            filesz,
            memsz,
            prot
        );

        // File-backed part, private so relocation fixups stay local.
        let file_len = self.page_up(lead + filesz);
        if file_len != 0 {
            let ptr = unsafe {
                libc::mmap(
                    seg_start as *mut libc::c_void,
                    file_len,
                    prot.union(Protection::WRITE).as_prot(),
                    libc::MAP_PRIVATE | libc::MAP_FIXED,
                    file.as_raw_fd(),
                    file_off as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(RelshareErrorKind::MapFail {
                    addr: seg_start,
                    len: file_len,
                }
                .into());
            }
            // Zero the slack between the end of file data and the end of the
            // last file-backed page.
            let data_end = seg_start + lead + filesz;
            let page_end = seg_start + file_len;
            if page_end > data_end {
                unsafe {
                    std::ptr::write_bytes(data_end as *mut u8, 0, page_end - data_end);
                }
            }
        }

        // Anonymous tail for memsz beyond filesz (bss).
        let mem_end = self.page_up(lead + memsz);
        if mem_end > file_len {
            let tail_start = seg_start + file_len;
            let tail_len = mem_end - file_len;
            let ptr = unsafe {
                libc::mmap(
                    tail_start as *mut libc::c_void,
                    tail_len,
                    prot.as_prot(),
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(RelshareErrorKind::MapFail {
                    addr: tail_start,
                    len: tail_len,
                }
                .into());
            }
        }

        // Drop the write access we only needed for the slack zeroing.
        if file_len != 0 && !prot.contains(Protection::WRITE) {
            let rc = unsafe {
                libc::mprotect(seg_start as *mut libc::c_void, file_len, prot.as_prot())
            };
            if rc != 0 {
                return Err(
                    RelshareErrorKind::os("mprotect", std::io::Error::last_os_error()).into(),
                );
            }
        }
        Ok(())
    }
}

impl VmProvider for LinuxEngine {
    type Region = MemfdRegion;
    type Handle = MemfdHandle;

    fn reserve(&mut self, at: usize, length: usize) -> Result<usize, RelshareError> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        if at != 0 {
            // A clean refusal when the range is taken, never a clobber.
            flags |= libc::MAP_FIXED_NOREPLACE;
        }
        let ptr = unsafe {
            libc::mmap(
                at as *mut libc::c_void,
                length,
                libc::PROT_NONE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RelshareErrorKind::os("mmap", std::io::Error::last_os_error()).into());
        }
        let base = ptr as usize;
        if at != 0 && base != at {
            // Old kernels ignore MAP_FIXED_NOREPLACE and fall back to a hint.
            unsafe { libc::munmap(ptr, length) };
            return Err(RelshareErrorKind::MapFail { addr: at, len: length }.into());
        }
        Ok(base)
    }

    fn release(&mut self, base: usize, length: usize) {
        let rc = unsafe { libc::munmap(base as *mut libc::c_void, length) };
        if rc != 0 {
            warn!(
                "munmap of reservation {:#x}+{:#x} failed: {}",
                base,
                length,
                std::io::Error::last_os_error()
            );
        }
    }

    fn create_region(&mut self, length: usize) -> Result<Self::Region, RelshareError> {
        let name = CString::new("relshare-relro").unwrap();
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING) };
        if fd < 0 {
            return Err(
                RelshareErrorKind::os("memfd_create", std::io::Error::last_os_error()).into(),
            );
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), length as libc::off_t) };
        if rc != 0 {
            return Err(
                RelshareErrorKind::os("ftruncate", std::io::Error::last_os_error()).into(),
            );
        }
        Ok(MemfdRegion { fd, length })
    }

    fn populate_region(
        &mut self,
        region: &mut Self::Region,
        src: usize,
        length: usize,
    ) -> Result<(), RelshareError> {
        if length > region.length {
            return Err(RelshareErrorKind::RegionPopulateFail { src }.into());
        }
        let mut written = 0usize;
        while written < length {
            let rc = unsafe {
                libc::pwrite(
                    region.fd.as_raw_fd(),
                    (src + written) as *const libc::c_void,
                    length - written,
                    written as libc::off_t,
                )
            };
            if rc <= 0 {
                return Err(RelshareError::new_collect(
                    RelshareErrorKind::RegionPopulateFail { src },
                    vec![RelshareErrorKind::os("pwrite", std::io::Error::last_os_error()).into()],
                ));
            }
            written += rc as usize;
        }
        Ok(())
    }

    fn seal_region(&mut self, region: Self::Region) -> Result<Self::Handle, RelshareError> {
        let seals =
            libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE | libc::F_SEAL_SEAL;
        let rc = unsafe { libc::fcntl(region.fd.as_raw_fd(), libc::F_ADD_SEALS, seals) };
        if rc != 0 {
            return Err(RelshareError::new_collect(
                RelshareErrorKind::RegionSealFail,
                vec![RelshareErrorKind::os("fcntl", std::io::Error::last_os_error()).into()],
            ));
        }
        Ok(MemfdHandle {
            fd: Arc::new(region.fd),
        })
    }

    fn map_region(
        &mut self,
        handle: &Self::Handle,
        at: usize,
        length: usize,
    ) -> Result<(), RelshareError> {
        let ptr = unsafe {
            libc::mmap(
                at as *mut libc::c_void,
                length,
                libc::PROT_READ,
                libc::MAP_SHARED | libc::MAP_FIXED,
                handle.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED || ptr as usize != at {
            return Err(RelshareError::new_collect(
                RelshareErrorKind::RegionMapFail { addr: at },
                vec![RelshareErrorKind::os("mmap", std::io::Error::last_os_error()).into()],
            ));
        }
        Ok(())
    }
}

impl PrecursorRegistry for LinuxEngine {
    fn find_reserved_region(&mut self, library: &UnloadedLibrary) -> Option<usize> {
        let value = std::env::var(PRECURSOR_REGION_VAR).ok()?;
        for entry in value.split(',') {
            let Some((name, addr)) = entry.split_once(':') else {
                continue;
            };
            if name == library.name {
                return usize::from_str_radix(addr.trim_start_matches("0x"), 16).ok();
            }
        }
        None
    }
}

impl ImageLoader for LinuxEngine {
    fn image_extent(&mut self, library: &UnloadedLibrary) -> Result<usize, RelshareError> {
        let path = self.resolve(library)?;
        let data = fs::read(&path)
            .map_err(|err| RelshareErrorKind::os(path.display().to_string(), err))?;
        let elf = ElfBytes::<NativeEndian>::minimal_parse(&data)?;
        let (lo, hi) = self.extent_of(&elf)?;
        Ok(hi - lo)
    }

    fn load_at(
        &mut self,
        library: &UnloadedLibrary,
        reservation: &AddressReservation,
    ) -> Result<LibraryImage, RelshareError> {
        let path = self.resolve(library)?;
        let data = fs::read(&path)
            .map_err(|err| RelshareErrorKind::os(path.display().to_string(), err))?;
        let elf = ElfBytes::<NativeEndian>::minimal_parse(&data)?;
        let (lo, hi) = self.extent_of(&elf)?;
        let extent = hi - lo;
        if extent > reservation.length {
            return Err(RelshareErrorKind::ReservationTooSmall {
                library: library.name.clone(),
                needed: extent,
                reserved: reservation.length,
            }
            .into());
        }
        // Pin the image so vaddr `lo` lands at the reservation base.
        let base = reservation.base_address - lo;

        let file = fs::File::open(&path)
            .map_err(|err| RelshareErrorKind::os(path.display().to_string(), err))?;
        let segments = elf
            .segments()
            .ok_or_else(|| RelshareErrorKind::MissingSegment {
                name: "program headers".to_string(),
            })?;

        RelshareError::collect(
            RelshareErrorKind::LibraryLoadFail {
                library: library.clone(),
            },
            segments
                .iter()
                .filter(|p| p.p_type == abi::PT_LOAD)
                .map(|phdr| self.map_segment(&file, base, &phdr)),
        )?;

        let relro = segments.iter().find(|p| p.p_type == abi::PT_GNU_RELRO);
        let (relro_start, relro_size) = match relro {
            Some(phdr) => {
                let start = base + self.page_down(phdr.p_vaddr as usize);
                // Rounding the end up assumes the linker page-aligned the
                // relro end (lld/Android layout). An unaligned end would put
                // writable data such as .got.plt on the frozen tail page.
                let exact_end = (phdr.p_vaddr + phdr.p_memsz) as usize;
                if exact_end != self.page_up(exact_end) {
                    warn!(
                        "{}: PT_GNU_RELRO end {:#x} is not page aligned, freezing the full tail page",
                        library.name, exact_end
                    );
                }
                let end = base + self.page_up(exact_end);
                // The range must already be immutable before it can be shared.
                let rc = unsafe {
                    libc::mprotect(start as *mut libc::c_void, end - start, libc::PROT_READ)
                };
                if rc != 0 {
                    return Err(RelshareErrorKind::os(
                        "mprotect relro",
                        std::io::Error::last_os_error(),
                    )
                    .into());
                }
                (start, end - start)
            }
            None => {
                debug!("{}: no PT_GNU_RELRO segment", library.name);
                (0, 0)
            }
        };

        LibraryImage::new(
            &library.name,
            reservation.base_address,
            extent,
            relro_start,
            relro_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anywhere_reservation_grants_nonzero_base() {
        let mut eng = LinuxEngine::new();
        let base = eng.reserve(0, 0x4000).unwrap();
        assert_ne!(base, 0);
        eng.release(base, 0x4000);
    }

    #[test]
    fn exact_reservation_over_taken_range_is_refused() {
        let mut eng = LinuxEngine::new();
        let base = eng.reserve(0, 0x4000).unwrap();
        // The range is held by the first reservation, so an exact request
        // for it must be a clean refusal.
        assert!(eng.reserve(base, 0x4000).is_err());
        eng.release(base, 0x4000);
    }

    #[test]
    fn region_round_trip_through_seal_and_map() {
        let mut eng = LinuxEngine::new();
        let page = eng.page_size;

        let payload = vec![0x5au8; page];
        let mut region = eng.create_region(page).unwrap();
        eng.populate_region(&mut region, payload.as_ptr() as usize, page)
            .unwrap();
        let handle = eng.seal_region(region).unwrap();
        assert_eq!(handle.byte_len(), Some(page as u64));

        // Sealed means sealed: no more writes through any descriptor.
        let rc = unsafe {
            libc::pwrite(
                handle.as_raw_fd(),
                payload.as_ptr() as *const libc::c_void,
                1,
                0,
            )
        };
        assert_eq!(rc, -1);

        let scratch = eng.reserve(0, page).unwrap();
        eng.map_region(&handle, scratch, page).unwrap();
        let mapped = unsafe { std::slice::from_raw_parts(scratch as *const u8, page) };
        assert_eq!(mapped, &payload[..]);
        eng.release(scratch, page);
    }

    // Tests touching the process environment serialize on this lock; the
    // default harness runs tests in parallel threads.
    fn env_guard() -> std::sync::MutexGuard<'static, ()> {
        static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn precursor_lookup_reads_inherited_environment() {
        let _env = env_guard();
        let mut eng = LinuxEngine::new();
        let lib = UnloadedLibrary::new("libenvtest.so");
        std::env::set_var(PRECURSOR_REGION_VAR, "libother.so:0x1000,libenvtest.so:0x7f00000000");
        assert_eq!(eng.find_reserved_region(&lib), Some(0x7f00000000));
        std::env::remove_var(PRECURSOR_REGION_VAR);
    }

    #[test]
    fn precursor_lookup_skips_malformed_entries() {
        let _env = env_guard();
        let mut eng = LinuxEngine::new();
        let lib = UnloadedLibrary::new("libenvtest.so");
        std::env::set_var(PRECURSOR_REGION_VAR, "garbage,libenvtest.so:0x2000");
        assert_eq!(eng.find_reserved_region(&lib), Some(0x2000));
        std::env::remove_var(PRECURSOR_REGION_VAR);
    }
}
