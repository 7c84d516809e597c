use std::fmt;
use std::sync::Arc;

use crate::address::TargetAddress;
use crate::arch::Architecture;
use crate::error::TargetAccessError;
use crate::host::UnwindServices;
use crate::method::{Method, Symbol};
use crate::registers::Registers;
use crate::target::TargetMemoryAccess;

/// How a frame entered the backtrace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Recovered by ordinary unwinding.
    Normal,
    /// Reconstructed from a signal handler's saved context.
    Signal,
    /// Reconstructed from the runtime's last-managed-frame record.
    Lmf,
    /// Synthesized for a function the debugger asked the runtime to call.
    Callback,
    /// Synthesized for the runtime's own invocation helper.
    RuntimeInvoke,
    /// Anything else the runtime marks as special.
    Special,
}

/// One stack frame.
///
/// A frame's unwind data (pc, stack pointer, registers) never changes after
/// it has been appended to a backtrace; only the parent index is filled in
/// when the next outer frame arrives.
pub struct StackFrame {
    kind: FrameKind,
    address: TargetAddress,
    stack_pointer: TargetAddress,
    frame_address: Option<TargetAddress>,
    registers: Registers,
    method: Option<Arc<Method>>,
    symbol: Option<Symbol>,
    level: usize,
    parent: Option<usize>,
}

impl StackFrame {
    pub(crate) fn new(
        kind: FrameKind,
        address: TargetAddress,
        stack_pointer: TargetAddress,
        frame_address: Option<TargetAddress>,
        registers: Registers,
        method: Option<Arc<Method>>,
        symbol: Option<Symbol>,
    ) -> Self {
        Self {
            kind,
            address,
            stack_pointer,
            frame_address,
            registers,
            method,
            symbol,
            level: 0,
            parent: None,
        }
    }

    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// The program counter of this frame. For frames below the top this is
    /// the return address, pointing just past the call.
    #[inline]
    pub fn address(&self) -> TargetAddress {
        self.address
    }

    #[inline]
    pub fn stack_pointer(&self) -> TargetAddress {
        self.stack_pointer
    }

    #[inline]
    pub fn frame_address(&self) -> Option<TargetAddress> {
        self.frame_address
    }

    #[inline]
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Mutable access for register write-back. The unwind data the frame
    /// was built from is unaffected by value edits.
    #[inline]
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    #[inline]
    pub fn method(&self) -> Option<&Arc<Method>> {
        self.method.as_ref()
    }

    #[inline]
    pub fn symbol(&self) -> Option<&Symbol> {
        self.symbol.as_ref()
    }

    /// Position of this frame in its backtrace, 0 being the innermost.
    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }

    /// Index of the next outer frame, once it is known.
    #[inline]
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn is_managed(&self) -> bool {
        self.method.as_ref().is_some_and(|m| m.is_managed())
    }

    pub fn source_location(&self) -> Option<(&str, u32)> {
        self.method.as_ref()?.lookup_line(self.address)
    }

    pub(crate) fn set_level(&mut self, level: usize) {
        self.level = level;
    }

    pub(crate) fn set_parent(&mut self, parent: Option<usize>) {
        self.parent = parent;
    }

    /// First unwind layer: asks the frame's method (symbol-layer unwind
    /// tables, then prologue analysis), and falls back to a plain frame
    /// pointer walk when there is no method to ask.
    pub fn unwind_stack(
        &self,
        arch: &Architecture,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
    ) -> Result<Option<StackFrame>, TargetAccessError> {
        if let Some(method) = &self.method {
            if let Some(frame) = method.unwind_stack(self, arch, services, target)? {
                return Ok(Some(frame));
            }
        }
        arch.unwind_stack(self, services, target, &[], 0)
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}: {} in ", self.level, self.address)?;
        match (&self.method, &self.symbol) {
            (Some(method), _) => {
                f.write_str(method.name())?;
                if let Some((file, line)) = self.source_location() {
                    write!(f, " at {file}:{line}")?;
                }
            }
            (None, Some(symbol)) => {
                f.write_str(&symbol.name)?;
                match self.address.checked_offset_from(symbol.address) {
                    Some(offset) if offset > 0 => write!(f, "+{offset:#x}")?,
                    _ => {}
                }
            }
            (None, None) => f.write_str("<unknown>")?,
        }
        if self.kind == FrameKind::Signal {
            f.write_str(" [signal handler]")?;
        }
        Ok(())
    }
}
