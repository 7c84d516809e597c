//! Stack unwinding and instruction decoding for an out-of-process debugger.
//!
//! Given register-level access to a stopped thread, this crate rebuilds the
//! thread's call chain: per-architecture instruction decoders classify the
//! code around each pc, a prologue scanner recovers where each function
//! saved its caller's registers, and a [`Backtrace`] walks frame by frame
//! with layered fallbacks (unwind tables, prologue analysis, frame pointer
//! chains, signal contexts, runtime frame records). Everything the crate
//! knows about the inferior comes through the [`TargetMemoryAccess`] trait
//! and the collaborator traits ([`SymbolResolver`], [`ManagedRuntime`] and
//! friends).

mod address;
mod arch;
mod arm;
mod backtrace;
mod display_utils;
mod error;
mod frame;
mod host;
mod instruction;
mod method;
mod prologue;
mod registers;
mod target;
#[cfg(any(test, feature = "test_util"))]
#[doc(hidden)]
pub mod test_support;
mod x86;

pub use address::{AddressSpace, TargetAddress};
pub use arch::Architecture;
pub use backtrace::{Backtrace, BacktraceStats, Mode, CALLBACK_SYMBOL_NAME};
pub use error::{ArchError, PrologueScanError, TargetAccessError};
pub use frame::{FrameKind, StackFrame};
pub use host::{
    CallbackFrameInfo, ManagedRuntime, ModuleUnwind, NativeTrampolines, SymbolResolver,
    UnwindServices,
};
pub use instruction::{
    Emulation, Instruction, InstructionKind, MemoryWrite, TrampolineType, MAX_INSTRUCTION_LEN,
};
pub use method::{LineTable, Method, Symbol, WrapperType};
pub use prologue::{RegisterLocation, UnwindContext};
pub use registers::{Register, RegisterLayout, Registers};
pub use target::TargetMemoryAccess;
