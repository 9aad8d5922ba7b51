//! Common error types shared across the loader.
//!
//! Every fallible subsystem defines its own error enum here, all of which
//! implement [`BaseError`]. Functions that can fail but have nothing to
//! return use the [`CanFail`] alias.

use core::fmt::{self, Debug, Display, Formatter};

use alloc::string::String;

/// `BaseError` is a common trait implemented by every error type defined in
/// the loader.
///
/// It is dependent on the [`Debug`] trait, which makes sense as we are
/// dealing with errors.
pub trait BaseError: Debug {}

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// `DiskError` covers failures of the block-level read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// The firmware read routine reported a failure.
    ReadFailure,

    /// The requested range lies past the end of the device.
    OutOfBounds,

    /// No disk is registered under the given handle.
    NoSuchDisk,
}

impl BaseError for DiskError {}

impl Display for DiskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::ReadFailure => f.write_str("disk read failure"),
            DiskError::OutOfBounds => f.write_str("read past the end of the device"),
            DiskError::NoSuchDisk => f.write_str("no such disk"),
        }
    }
}

/// `MountError` covers failures while probing a partition for a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountError {
    IoError,

    /// The on-disk metadata does not describe a filesystem we support.
    NotSupported,

    /// The on-disk metadata is self-contradictory.
    Corrupted,
}

impl BaseError for MountError {}

/// `FsError` covers failures on an already-mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    IoError,

    /// Read past the end of a file.
    OutOfBounds,

    /// Directory or file metadata failed validation.
    Corrupted,
}

impl BaseError for FsError {}

impl From<DiskError> for FsError {
    fn from(_: DiskError) -> Self {
        FsError::IoError
    }
}

/// `MemoryError` covers physical memory manager failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No free range satisfies the allocation request.
    OutOfMemory,

    /// The given address/size pair does not describe a valid allocation.
    InvalidRange,
}

impl BaseError for MemoryError {}

/// `ElfError` covers failures while loading a kernel executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    InvalidMagic,
    InvalidClass,
    NotLittleEndian,
    NotAnExecutable,
    UnexpectedMachineType,
    InvalidProgramHeaders,
    InvalidLoadAddress,
    InvalidEntrypoint,
    InvalidLoadOptions,
    ReadFailure,
    OutOfMemory,
}

impl BaseError for ElfError {}

impl Display for ElfError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ElfError::InvalidMagic => "invalid magic",
            ElfError::InvalidClass => "invalid ELF class",
            ElfError::NotLittleEndian => "not a little-endian file",
            ElfError::NotAnExecutable => "not an executable",
            ElfError::UnexpectedMachineType => "unexpected machine type",
            ElfError::InvalidProgramHeaders => "invalid program headers",
            ElfError::InvalidLoadAddress => "invalid load address",
            ElfError::InvalidEntrypoint => "invalid entrypoint",
            ElfError::InvalidLoadOptions => "invalid load options",
            ElfError::ReadFailure => "failed to read the binary",
            ElfError::OutOfMemory => "out of memory",
        };

        f.write_str(reason)
    }
}

/// `VideoError` covers video mode negotiation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoError {
    /// No firmware mode satisfies the requested constraints.
    NoSatisfyingMode,

    /// The firmware refused to switch to the picked mode.
    ModeSetFailure,
}

impl BaseError for VideoError {}

/// `BootError` is the terminal error of the boot path.
///
/// Anything that would make the original loader `oops()` ends up here with a
/// formatted, user-facing message. The embedder is expected to print it and
/// abort.
#[derive(Debug)]
pub struct BootError {
    message: String,
}

impl BootError {
    pub fn new(message: String) -> Self {
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl BaseError for BootError {}

impl Display for BootError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<DiskError> for BootError {
    fn from(err: DiskError) -> Self {
        BootError::new(alloc::format!("{err}"))
    }
}

impl From<ElfError> for BootError {
    fn from(err: ElfError) -> Self {
        BootError::new(alloc::format!("failed to load kernel binary: {err}"))
    }
}

/// Builds a [`BootError`] from a format string, `oops()`-style.
#[macro_export]
macro_rules! oops {
    ($($arg:tt)*) => {
        return Err($crate::errors::BootError::new(alloc::format!($($arg)*)).into())
    };
}
