//! Traits the embedding debugger implements to feed the unwinder.
//!
//! The unwinder itself never parses symbol tables or talks to a runtime;
//! everything it needs beyond raw memory comes through this module. All of
//! the services except symbol lookup are optional, and a missing service
//! simply disables the unwind layers that would have used it.

use std::sync::Arc;

use crate::address::TargetAddress;
use crate::error::TargetAccessError;
use crate::frame::StackFrame;
use crate::method::{Method, Symbol};
use crate::registers::Registers;
use crate::target::TargetMemoryAccess;

/// Address-to-name resolution, both the detailed kind (methods with line
/// tables) and the plain symbol table kind.
pub trait SymbolResolver {
    /// The method containing `address`, if the symbol layer has one.
    fn lookup_method(&self, address: TargetAddress) -> Option<Arc<Method>>;

    /// Plain symbol table lookup. With `exact_match` the symbol must start
    /// at `address`; otherwise the closest symbol at or below it wins.
    fn simple_lookup(&self, address: TargetAddress, exact_match: bool) -> Option<Symbol>;
}

/// Unwind tables owned by a loaded module (DWARF CFI and friends). When the
/// embedder provides this, it is consulted before any prologue analysis.
pub trait ModuleUnwind {
    /// The caller's registers according to the module's unwind tables, or
    /// `None` when the tables do not cover the frame's pc.
    fn unwind_frame(
        &self,
        frame: &StackFrame,
        target: &mut dyn TargetMemoryAccess,
    ) -> Result<Option<Registers>, TargetAccessError>;
}

/// Knowledge about the platform linker's lazy-binding stubs.
pub trait NativeTrampolines {
    /// Whether `address` is the entry of a stub whose destination has not
    /// been resolved yet.
    fn is_trampoline_start(&self, address: TargetAddress) -> bool;

    /// If `address` is a resolved stub, where it forwards to.
    fn trampoline_destination(
        &self,
        target: &mut dyn TargetMemoryAccess,
        address: TargetAddress,
    ) -> Result<Option<TargetAddress>, TargetAccessError>;
}

/// A frame the managed runtime recorded when the debugger called into the
/// inferior.
pub struct CallbackFrameInfo {
    /// Register file saved on entry to the callback.
    pub registers: Registers,
    /// True when the record belongs to the runtime's own invocation helper
    /// rather than a direct debugger call.
    pub is_runtime_invoke: bool,
}

/// The managed runtime inside the inferior, when there is one.
pub trait ManagedRuntime {
    /// Whether `address` lies in one of the runtime's trampolines.
    fn is_trampoline_address(&self, address: TargetAddress) -> bool;

    /// Whether `address` is the runtime's delegate invoke thunk.
    fn is_delegate_invoke(&self, address: TargetAddress) -> bool;

    /// Looks for a debugger-callback record at the given stack pointer.
    /// With `exact_match` the record's stack pointer must equal it; without,
    /// the first record above it is taken.
    fn callback_frame(
        &self,
        target: &mut dyn TargetMemoryAccess,
        stack_pointer: TargetAddress,
        exact_match: bool,
    ) -> Result<Option<CallbackFrameInfo>, TargetAccessError>;

    /// Head of the thread's last-managed-frame chain, if the runtime keeps
    /// one for this thread.
    fn lmf_address(
        &self,
        target: &mut dyn TargetMemoryAccess,
    ) -> Result<Option<TargetAddress>, TargetAccessError>;
}

/// Everything the unwinder may consult while walking a stack, bundled so
/// the walking code does not grow a parameter per service.
#[derive(Clone, Copy)]
pub struct UnwindServices<'a> {
    pub symbols: &'a dyn SymbolResolver,
    pub module_unwind: Option<&'a dyn ModuleUnwind>,
    pub native_trampolines: Option<&'a dyn NativeTrampolines>,
    pub runtime: Option<&'a dyn ManagedRuntime>,
}

impl<'a> UnwindServices<'a> {
    pub fn new(symbols: &'a dyn SymbolResolver) -> Self {
        Self {
            symbols,
            module_unwind: None,
            native_trampolines: None,
            runtime: None,
        }
    }

    pub fn with_module_unwind(mut self, module_unwind: &'a dyn ModuleUnwind) -> Self {
        self.module_unwind = Some(module_unwind);
        self
    }

    pub fn with_native_trampolines(mut self, trampolines: &'a dyn NativeTrampolines) -> Self {
        self.native_trampolines = Some(trampolines);
        self
    }

    pub fn with_runtime(mut self, runtime: &'a dyn ManagedRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Whether the inferior hosts a managed runtime at all.
    #[inline]
    pub fn is_managed(&self) -> bool {
        self.runtime.is_some()
    }
}
