//! Management of individual libraries and their loaded images.

use std::fmt::{Debug, Display};

use crate::{RelshareError, RelshareErrorKind};

#[repr(C)]
/// An unloaded library. It's just a name, really.
#[derive(Debug, Clone, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct UnloadedLibrary {
    pub name: String,
}

impl UnloadedLibrary {
    /// Construct a new unloaded library.
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Display for UnloadedLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(unloaded)", &self.name)
    }
}

/// One successfully loaded and relocated copy of a library in this process's
/// address space. Created once by the loading step, never mutated; the
/// mapping it describes persists for the life of the process.
#[derive(Clone, PartialEq, Eq)]
pub struct LibraryImage {
    /// Name of this library.
    pub name: String,
    /// Base of the mapped image.
    pub load_address: usize,
    /// Total extent of the mapped image.
    pub load_size: usize,
    /// Start of the post-relocation read-only data segment.
    pub relro_start: usize,
    /// Length of the post-relocation read-only data segment. Zero means the
    /// library carries no RELRO segment at all.
    pub relro_size: usize,
}

impl LibraryImage {
    /// Construct an image record, checking that the RELRO range is a
    /// sub-range of the loaded image.
    pub fn new(
        name: impl ToString,
        load_address: usize,
        load_size: usize,
        relro_start: usize,
        relro_size: usize,
    ) -> Result<Self, RelshareError> {
        let relro_end = relro_start
            .checked_add(relro_size)
            .ok_or_else(|| RelshareErrorKind::RelroOutOfBounds {
                start: relro_start,
                size: relro_size,
                base: load_address,
                len: load_size,
            })?;
        let load_end = load_address
            .checked_add(load_size)
            .ok_or_else(|| RelshareErrorKind::RelroOutOfBounds {
                start: relro_start,
                size: relro_size,
                base: load_address,
                len: load_size,
            })?;
        let in_bounds =
            relro_size == 0 || (relro_start >= load_address && relro_end <= load_end);
        if !in_bounds {
            return Err(RelshareErrorKind::RelroOutOfBounds {
                start: relro_start,
                size: relro_size,
                base: load_address,
                len: load_size,
            }
            .into());
        }
        Ok(Self {
            name: name.to_string(),
            load_address,
            load_size,
            relro_start,
            relro_size,
        })
    }

    /// Does this image carry a RELRO segment worth sharing?
    pub fn has_relro(&self) -> bool {
        self.relro_size != 0
    }
}

impl Debug for LibraryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryImage")
            .field("name", &self.name)
            .field("load_address", &format_args!("{:#x}", self.load_address))
            .field("load_size", &format_args!("{:#x}", self.load_size))
            .field("relro_start", &format_args!("{:#x}", self.relro_start))
            .field("relro_size", &format_args!("{:#x}", self.relro_size))
            .finish()
    }
}

impl Display for LibraryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:#x}", &self.name, self.load_address)
    }
}
