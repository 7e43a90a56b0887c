//! The RELRO producer/consumer protocol. The producer copies its RELRO
//! bytes into a sealed shared region and advertises it through a transfer
//! descriptor; a consumer validates an incoming descriptor against its own
//! loaded image and, only on an exact match, remaps its private RELRO pages
//! onto the shared ones.

use tracing::{debug, warn};

use crate::{
    descriptor::TransferDescriptor,
    engines::{RegionHandle, VmProvider},
    library::LibraryImage,
    outcome::{OutcomeRecorder, SharingOutcome},
    RelshareError, RelshareErrorKind,
};

/// Per-process sharing state. Owned by the linker; a process holds exactly
/// one per library.
#[derive(Debug)]
pub(crate) struct RelroSharer {
    outcome: SharingOutcome,
}

impl RelroSharer {
    pub(crate) fn new() -> Self {
        Self {
            outcome: SharingOutcome::NotAttempted,
        }
    }

    pub(crate) fn outcome(&self) -> SharingOutcome {
        self.outcome
    }

    /// Producer path: package `image`'s RELRO range into a sealed shared
    /// region. Failure to build the region is a degradation, not an error:
    /// the descriptor is still produced, just with no handle, and consumers
    /// keep their private pages.
    pub(crate) fn publish<V: VmProvider>(
        vm: &mut V,
        image: &LibraryImage,
    ) -> TransferDescriptor<V::Handle> {
        if !image.has_relro() {
            debug!("{}: no RELRO segment, publishing handleless descriptor", image.name);
            return TransferDescriptor::from_image(image, None);
        }
        match build_region(vm, image) {
            Ok(handle) => TransferDescriptor::from_image(image, Some(handle)),
            Err(err) => {
                warn!(
                    "{}: failed to build shared RELRO region ({}), consumers will keep private pages",
                    image.name, err
                );
                TransferDescriptor::from_image(image, None)
            }
        }
    }

    /// Consumer path: validate `incoming` against the locally loaded image
    /// and remap the RELRO range onto the shared region. Idempotent per
    /// process: after the first attempt, repeated delivery reports the
    /// recorded outcome without touching the mapping again.
    pub(crate) fn adopt<V: VmProvider, R: OutcomeRecorder>(
        &mut self,
        vm: &mut V,
        recorder: &R,
        local: &LibraryImage,
        incoming: &TransferDescriptor<V::Handle>,
    ) -> SharingOutcome {
        if self.outcome != SharingOutcome::NotAttempted {
            debug!(
                "{}: repeated descriptor delivery, keeping outcome {}",
                local.name,
                self.outcome.name()
            );
            return self.outcome;
        }
        let outcome = evaluate(vm, local, incoming);
        self.outcome = outcome;
        recorder.record_sharing(outcome);
        outcome
    }
}

fn build_region<V: VmProvider>(
    vm: &mut V,
    image: &LibraryImage,
) -> Result<V::Handle, RelshareError> {
    let mut region = vm.create_region(image.relro_size).map_err(|err| {
        RelshareError::new_collect(
            RelshareErrorKind::RegionCreateFail {
                size: image.relro_size,
            },
            vec![err],
        )
    })?;
    vm.populate_region(&mut region, image.relro_start, image.relro_size)?;
    // Seal before anyone else can see it; the region is immutable from here.
    vm.seal_region(region)
}

fn evaluate<V: VmProvider>(
    vm: &mut V,
    local: &LibraryImage,
    incoming: &TransferDescriptor<V::Handle>,
) -> SharingOutcome {
    let Some(handle) = &incoming.handle else {
        debug!("{}: descriptor carries no shared region", local.name);
        return SharingOutcome::NoSharedRegionProvided;
    };

    // A handle that is present but cannot back relro_size bytes is its own
    // failure mode, reported separately from "absent" in the logs.
    match handle.byte_len() {
        None => {
            warn!("{}: shared region handle cannot be interrogated", local.name);
            return SharingOutcome::NoSharedRegionProvided;
        }
        Some(len) if len == 0 || len < incoming.relro_size as u64 => {
            warn!(
                "{}: shared region holds {} bytes, need {:#x}",
                local.name, len, incoming.relro_size
            );
            return SharingOutcome::NoSharedRegionProvided;
        }
        Some(_) => {}
    }

    // Unverified input from another process: every field must match the
    // locally loaded image exactly before we let it near the address space.
    if incoming.load_address != local.load_address
        || incoming.load_size != local.load_size
        || incoming.relro_start != local.relro_start
        || incoming.relro_size != local.relro_size
    {
        warn!(
            "{}: descriptor geometry {:#x}+{:#x}/{:#x}+{:#x} does not match local image {:#x}+{:#x}/{:#x}+{:#x}",
            local.name,
            incoming.load_address,
            incoming.load_size,
            incoming.relro_start,
            incoming.relro_size,
            local.load_address,
            local.load_size,
            local.relro_start,
            local.relro_size,
        );
        return SharingOutcome::AddressOrSizeMismatch;
    }

    match vm.map_region(handle, local.relro_start, local.relro_size) {
        Ok(()) => {
            debug!(
                "{}: RELRO {:#x}+{:#x} now backed by shared region",
                local.name, local.relro_start, local.relro_size
            );
            SharingOutcome::Success
        }
        Err(err) => {
            warn!("{}: shared region mapping failed: {}", local.name, err);
            SharingOutcome::RegionMapFailed
        }
    }
}
