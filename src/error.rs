use crate::address::TargetAddress;

/// The error type for reads and writes that cross into the inferior.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TargetAccessError {
    #[error("Could not read {1} bytes of target memory at {0}")]
    MemoryRead(TargetAddress, usize),

    #[error("Could not write {1} bytes of target memory at {0}")]
    MemoryWrite(TargetAddress, usize),

    #[error("Could not access the registers of the suspended thread")]
    Registers,

    #[error("The target has exited or the connection to it is gone")]
    TargetGone,
}

/// The error type for prologue scanning.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PrologueScanError {
    /// The scanner hit a byte sequence the decoder could not assign a length
    /// to. Everything derived from the scan so far has to be discarded.
    #[error("Undecodable instruction at {0}")]
    Undecodable(TargetAddress),

    #[error(transparent)]
    Target(#[from] TargetAccessError),
}

/// The error type for architecture lookup and register translation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ArchError {
    #[error("No architecture support for target \"{0}\"")]
    UnsupportedTarget(String),

    #[error("No canonical register for external register number {0}")]
    UnknownRegister(u16),
}
