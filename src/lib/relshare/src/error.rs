//! Definitions for errors for the shared-RELRO linker.

use itertools::{Either, Itertools};
use miette::Diagnostic;
use thiserror::Error;

use crate::library::UnloadedLibrary;

#[derive(Debug, Error, Diagnostic)]
#[error("{kind}")]
pub struct RelshareError {
    pub kind: RelshareErrorKind,
    #[related]
    pub related: Vec<RelshareError>,
}

impl RelshareError {
    pub fn new_collect(kind: RelshareErrorKind, related: Vec<RelshareError>) -> Self {
        Self { kind, related }
    }

    pub fn new(kind: RelshareErrorKind) -> Self {
        Self {
            kind,
            related: vec![],
        }
    }

    pub fn collect<I, T>(parent_kind: RelshareErrorKind, it: I) -> Result<Vec<T>, RelshareError>
    where
        I: IntoIterator<Item = Result<T, RelshareError>>,
    {
        let (vals, errs): (Vec<T>, Vec<RelshareError>) =
            it.into_iter().partition_map(|item| match item {
                Ok(o) => Either::Left(o),
                Err(e) => Either::Right(e),
            });

        if errs.is_empty() {
            Ok(vals)
        } else {
            Err(RelshareError {
                kind: parent_kind,
                related: errs,
            })
        }
    }
}

impl From<RelshareErrorKind> for RelshareError {
    fn from(value: RelshareErrorKind) -> Self {
        Self {
            kind: value,
            related: vec![],
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum RelshareErrorKind {
    #[error("failed to reserve {length:#x} bytes of address space for {library}")]
    ReservationFail { library: String, length: usize },
    #[error("failed to load library {library}")]
    LibraryLoadFail { library: UnloadedLibrary },
    #[error("parse failed: {err}")]
    ParseError {
        #[from]
        err: elf::ParseError,
    },
    #[error("dynamic object is missing a required segment '{name}'")]
    MissingSegment { name: String },
    #[error("image for {library} needs {needed:#x} bytes, reservation holds {reserved:#x}")]
    ReservationTooSmall {
        library: String,
        needed: usize,
        reserved: usize,
    },
    #[error("RELRO range {start:#x}+{size:#x} escapes image {base:#x}+{len:#x}")]
    RelroOutOfBounds {
        start: usize,
        size: usize,
        base: usize,
        len: usize,
    },
    #[error("failed to create shared region of {size:#x} bytes")]
    RegionCreateFail { size: usize },
    #[error("failed to populate shared region from {src:#x}")]
    RegionPopulateFail { src: usize },
    #[error("failed to seal shared region")]
    RegionSealFail,
    #[error("failed to map shared region at {addr:#x}")]
    RegionMapFail { addr: usize },
    #[error("failed to satisfy mapping at {addr:#x} ({len:#x} bytes)")]
    MapFail { addr: usize, len: usize },
    #[error("transfer descriptor is malformed: {reason}")]
    BadDescriptor { reason: String },
    #[error("linker initialization previously failed for {library}")]
    InitializationFailed { library: String },
    #[error("{what}: {err}")]
    Os {
        what: String,
        #[source]
        err: std::io::Error,
    },
}

impl RelshareErrorKind {
    pub(crate) fn os(what: impl ToString, err: std::io::Error) -> Self {
        Self::Os {
            what: what.to_string(),
            err,
        }
    }
}

impl From<elf::ParseError> for RelshareError {
    fn from(value: elf::ParseError) -> Self {
        Self {
            kind: RelshareErrorKind::ParseError { err: value },
            related: vec![],
        }
    }
}
