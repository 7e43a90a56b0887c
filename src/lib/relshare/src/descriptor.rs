//! The transfer descriptor is the only thing that crosses a process
//! boundary: the load and RELRO geometry of one library, plus an optional
//! handle to the shared region backing the RELRO bytes.
//!
//! The descriptor serializes to a fixed wire layout. The handle itself is
//! not part of the byte stream; it travels next to it, through whatever
//! handle-transfer mechanism the embedding transport provides.

use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    engines::RegionHandle, library::LibraryImage, RelshareError, RelshareErrorKind,
};

const DESCRIPTOR_MAGIC: u32 = 0x524c_5344; // "RLSD"
const DESCRIPTOR_VERSION: u16 = 1;

/// Size of a serialized descriptor on the wire.
pub const WIRE_SIZE: usize = core::mem::size_of::<RawTransferDescriptor>();

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct DescriptorFlags: u16 {
        /// A shared-region handle accompanies the byte stream.
        const HAS_HANDLE = 1;
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawTransferDescriptor {
    magic: u32,
    version: u16,
    flags: u16,
    load_address: u64,
    load_size: u64,
    relro_start: u64,
    relro_size: u64,
}

const_assert_eq!(WIRE_SIZE, 40);

/// The structured payload exchanged between producer and consumer.
#[derive(Debug, Clone)]
pub struct TransferDescriptor<H> {
    pub load_address: usize,
    pub load_size: usize,
    pub relro_start: usize,
    pub relro_size: usize,
    /// Absent is a legal value meaning "no RELRO to share".
    pub handle: Option<H>,
}

impl<H: RegionHandle> TransferDescriptor<H> {
    pub(crate) fn from_image(image: &LibraryImage, handle: Option<H>) -> Self {
        Self {
            load_address: image.load_address,
            load_size: image.load_size,
            relro_start: image.relro_start,
            relro_size: image.relro_size,
            handle,
        }
    }

    /// Serialize to the fixed wire layout. The returned handle reference, if
    /// any, must be transferred alongside the bytes.
    pub fn serialize(&self) -> ([u8; WIRE_SIZE], Option<&H>) {
        let flags = if self.handle.is_some() {
            DescriptorFlags::HAS_HANDLE
        } else {
            DescriptorFlags::empty()
        };
        let raw = RawTransferDescriptor {
            magic: DESCRIPTOR_MAGIC,
            version: DESCRIPTOR_VERSION,
            flags: flags.bits(),
            load_address: self.load_address as u64,
            load_size: self.load_size as u64,
            relro_start: self.relro_start as u64,
            relro_size: self.relro_size as u64,
        };
        let mut buf = [0u8; WIRE_SIZE];
        buf.copy_from_slice(raw.as_bytes());
        (buf, self.handle.as_ref())
    }

    /// Rebuild a descriptor from its wire bytes and the handle that arrived
    /// with them (if any). Structural inconsistencies fail closed: a
    /// descriptor that does not parse is never a candidate for mapping.
    pub fn deserialize(bytes: &[u8], handle: Option<H>) -> Result<Self, RelshareError> {
        let raw = RawTransferDescriptor::read_from_bytes(
            bytes
                .get(..WIRE_SIZE)
                .ok_or_else(|| bad(format!("short buffer: {} bytes", bytes.len())))?,
        )
        .map_err(|_| bad("unreadable descriptor bytes"))?;

        if raw.magic != DESCRIPTOR_MAGIC {
            return Err(bad(format!("bad magic {:#x}", raw.magic)));
        }
        if raw.version != DESCRIPTOR_VERSION {
            return Err(bad(format!("unsupported version {}", raw.version)));
        }
        let flags = DescriptorFlags::from_bits(raw.flags)
            .ok_or_else(|| bad(format!("unknown flag bits {:#x}", raw.flags)))?;

        let load_address = to_usize(raw.load_address)?;
        let load_size = to_usize(raw.load_size)?;
        let relro_start = to_usize(raw.relro_start)?;
        let relro_size = to_usize(raw.relro_size)?;

        // The geometry must at least be self-consistent before we compare it
        // against anything local.
        let _ = LibraryImage::new("incoming", load_address, load_size, relro_start, relro_size)
            .map_err(|err| RelshareError::new_collect(
                RelshareErrorKind::BadDescriptor {
                    reason: "inconsistent geometry".to_string(),
                },
                vec![err],
            ))?;

        Ok(Self {
            load_address,
            load_size,
            relro_start,
            relro_size,
            handle: if flags.contains(DescriptorFlags::HAS_HANDLE) {
                handle
            } else {
                None
            },
        })
    }
}

fn bad(reason: impl ToString) -> RelshareError {
    RelshareErrorKind::BadDescriptor {
        reason: reason.to_string(),
    }
    .into()
}

fn to_usize(v: u64) -> Result<usize, RelshareError> {
    v.try_into()
        .map_err(|_| bad(format!("value {:#x} does not fit this address space", v)))
}
