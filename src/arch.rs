use tracing::trace;

use crate::address::{AddressSpace, TargetAddress};
use crate::arm::ArmArch;
use crate::error::{ArchError, PrologueScanError, TargetAccessError};
use crate::frame::{FrameKind, StackFrame};
use crate::host::{ManagedRuntime, UnwindServices};
use crate::instruction::Instruction;
use crate::prologue::{RegisterLocation, UnwindContext};
use crate::registers::{RegisterLayout, Registers};
use crate::target::TargetMemoryAccess;
use crate::x86::X86Arch;

/// Result of one step along the frame pointer chain.
pub(crate) struct FramePointerUnwind {
    pub ra: u64,
    pub ra_slot: TargetAddress,
    pub caller_sp: u64,
    pub caller_fp: u64,
    pub fp_slot: TargetAddress,
}

/// What each CPU family provides. Everything above this trait is shared.
pub(crate) trait ArchOps {
    fn name(&self) -> &'static str;
    fn layout(&self) -> &'static RegisterLayout;
    /// Largest window worth fetching for one instruction.
    fn instruction_window(&self) -> usize;
    fn decode_instruction(&self, bytes: &[u8], address: TargetAddress) -> Instruction;
    fn nop_encoding(&self) -> &'static [u8];
    /// Hardware/JIT register numbering to canonical index.
    fn register_map(&self, external: u16) -> Option<usize>;
    fn dwarf_register_map(&self, register: gimli::Register) -> Option<usize>;
    /// One step along the frame pointer chain starting at `fp`.
    fn unwind_frame_pointer(
        &self,
        target: &mut dyn TargetMemoryAccess,
        fp: TargetAddress,
    ) -> Result<Option<FramePointerUnwind>, TargetAccessError>;
    /// If the frame's pc sits on the signal return stub, the register file
    /// saved in the signal context on its stack.
    fn sigreturn_context(
        &self,
        target: &mut dyn TargetMemoryAccess,
        frame: &StackFrame,
    ) -> Result<Option<Registers>, TargetAccessError>;
    /// If `address` holds a lazy-compilation stub that hands a method token
    /// to one of the runtime's trampoline entry points, the token.
    fn runtime_trampoline(
        &self,
        target: &mut dyn TargetMemoryAccess,
        runtime: &dyn ManagedRuntime,
        address: TargetAddress,
    ) -> Result<Option<TargetAddress>, TargetAccessError>;
    /// Massaging applied to recovered return addresses (interworking bits
    /// and the like).
    fn normalize_return_address(&self, ra: u64) -> u64 {
        ra
    }
}

enum ArchKind {
    X86(X86Arch),
    Arm(ArmArch),
}

/// One supported target architecture. The set is closed; everything the
/// unwinder needs from the CPU family is reachable through this type.
pub struct Architecture {
    kind: ArchKind,
}

impl Architecture {
    pub fn x86_64() -> Self {
        Self { kind: ArchKind::X86(X86Arch::long_mode()) }
    }

    pub fn i386() -> Self {
        Self { kind: ArchKind::X86(X86Arch::protected_mode()) }
    }

    pub fn arm() -> Self {
        Self { kind: ArchKind::Arm(ArmArch) }
    }

    /// Picks the architecture from a target triple such as
    /// `x86_64-unknown-linux-gnu`.
    pub fn from_target_triple(triple: &str) -> Result<Self, ArchError> {
        let cpu = triple.split('-').next().unwrap_or(triple);
        match cpu {
            "x86_64" | "amd64" => Ok(Self::x86_64()),
            "i386" | "i486" | "i586" | "i686" | "x86" => Ok(Self::i386()),
            "arm64" | "aarch64" => Err(ArchError::UnsupportedTarget(triple.into())),
            _ if cpu.starts_with("arm") => Ok(Self::arm()),
            _ => Err(ArchError::UnsupportedTarget(triple.into())),
        }
    }

    /// The architecture this build of the debugger runs on.
    pub fn native() -> Result<Self, ArchError> {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                Ok(Self::x86_64())
            } else if #[cfg(target_arch = "x86")] {
                Ok(Self::i386())
            } else if #[cfg(target_arch = "arm")] {
                Ok(Self::arm())
            } else {
                Err(ArchError::UnsupportedTarget(std::env::consts::ARCH.into()))
            }
        }
    }

    fn ops(&self) -> &dyn ArchOps {
        match &self.kind {
            ArchKind::X86(arch) => arch,
            ArchKind::Arm(arch) => arch,
        }
    }

    pub fn name(&self) -> &'static str {
        self.ops().name()
    }

    pub fn layout(&self) -> &'static RegisterLayout {
        self.ops().layout()
    }

    pub fn register_names(&self) -> &'static [&'static str] {
        self.layout().register_names
    }

    pub fn register_sizes(&self) -> &'static [Option<u8>] {
        self.layout().register_sizes
    }

    /// The registers a plain register dump shows, in display order.
    pub fn register_indices(&self) -> &'static [usize] {
        self.layout().important_registers
    }

    /// Every register slot present on this target.
    pub fn all_register_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.layout().all_registers()
    }

    /// Translates the register numbering used in the inferior's JIT and
    /// breakpoint data into the canonical index.
    pub fn register_map(&self, external: u16) -> Result<usize, ArchError> {
        self.ops()
            .register_map(external)
            .ok_or(ArchError::UnknownRegister(external))
    }

    /// Translates a DWARF register number into the canonical index.
    pub fn dwarf_register_map(&self, register: gimli::Register) -> Result<usize, ArchError> {
        self.ops()
            .dwarf_register_map(register)
            .ok_or(ArchError::UnknownRegister(register.0))
    }

    /// The canonical nop for this target, used when patching out code.
    pub fn nop_encoding(&self) -> &'static [u8] {
        self.ops().nop_encoding()
    }

    /// Decodes one instruction from a byte buffer. Pure: the same bytes at
    /// the same address always give the same result.
    pub fn decode_instruction(&self, bytes: &[u8], address: TargetAddress) -> Instruction {
        self.ops().decode_instruction(bytes, address)
    }

    /// Reads and decodes the instruction at `address`, shrinking the fetch
    /// window if the full one crosses into unreadable memory.
    pub fn read_instruction(
        &self,
        target: &mut dyn TargetMemoryAccess,
        address: TargetAddress,
    ) -> Result<Instruction, TargetAccessError> {
        let window = self.ops().instruction_window();
        for len in (1..=window).rev() {
            if let Ok(bytes) = target.read_buffer(address, len) {
                return Ok(self.decode_instruction(&bytes, address));
            }
        }
        Err(TargetAccessError::MemoryRead(address, window))
    }

    /// Builds a frame from a register file. `None` when the registers do
    /// not name a usable pc and stack pointer (a zero pc is never usable).
    pub fn create_frame(
        &self,
        kind: FrameKind,
        services: &UnwindServices<'_>,
        space: AddressSpace,
        registers: Registers,
    ) -> Option<StackFrame> {
        let pc = registers.pc()?;
        if pc == 0 {
            return None;
        }
        let sp = registers.sp()?;
        let address = TargetAddress::new(space, pc);
        let stack_pointer = TargetAddress::new(space, sp);
        let frame_address = registers.fp().map(|fp| TargetAddress::new(space, fp));
        let method = services.symbols.lookup_method(address);
        let symbol = match &method {
            Some(_) => None,
            None => services.symbols.simple_lookup(address, false),
        };
        Some(StackFrame::new(
            kind,
            address,
            stack_pointer,
            frame_address,
            registers,
            method,
            symbol,
        ))
    }

    /// Unwinds one frame. When prologue bytes are available they drive
    /// register recovery; otherwise, or when the scan cannot be applied,
    /// the frame pointer chain is the fallback.
    pub fn unwind_stack(
        &self,
        frame: &StackFrame,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
        prologue: &[u8],
        offset: usize,
    ) -> Result<Option<StackFrame>, TargetAccessError> {
        if !prologue.is_empty() {
            match self.unwind_with_prologue(frame, services, target, prologue, offset) {
                Ok(Some(new_frame)) => return Ok(Some(new_frame)),
                Ok(None) => {}
                Err(err) => {
                    trace!(pc = %frame.address(), %err, "prologue unwind failed");
                }
            }
        }
        self.unwind_frame_pointer_walk(frame, services, target)
    }

    fn unwind_with_prologue(
        &self,
        frame: &StackFrame,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
        prologue: &[u8],
        offset: usize,
    ) -> Result<Option<StackFrame>, PrologueScanError> {
        let layout = self.layout();
        let space = target.address_space();
        let asize = layout.address_size as u64;
        let start = frame.address() - offset as u64;

        let mut ctx = UnwindContext::new(self, start, prologue.to_vec(), offset);
        ctx.scan(self)?;

        let entry_sp = match ctx.sp_offset() {
            Some(delta) => frame.stack_pointer().value().wrapping_add_signed(delta.wrapping_neg()),
            None => match (ctx.fp_offset(), frame.frame_address()) {
                // The prologue lost track of sp (stack realignment), but
                // the frame pointer still pins down the entry sp.
                (Some(fp_offset), Some(fp)) => {
                    fp.value().wrapping_add_signed(fp_offset.wrapping_neg())
                }
                _ => return Ok(None),
            },
        };

        let old = frame.registers();
        let mut registers = Registers::new(layout, false);
        for reg in layout.all_registers() {
            if reg == layout.pc || reg == layout.sp {
                continue;
            }
            match ctx.location(reg) {
                RegisterLocation::Preserved => {
                    if let Some(value) = old.value(reg) {
                        registers.set_value(reg, value);
                    }
                }
                RegisterLocation::Memory { base, offset } => {
                    let slot = if base == layout.sp {
                        TargetAddress::new(space, entry_sp.wrapping_add_signed(offset))
                    } else if let Some(fp) = frame.frame_address() {
                        TargetAddress::new(space, fp.value().wrapping_add_signed(offset))
                    } else {
                        continue;
                    };
                    let size = layout.register_sizes[reg].unwrap_or(asize as u8);
                    let value = read_sized(target, slot, size)?;
                    registers.set_value_on_stack(reg, value, slot);
                }
                RegisterLocation::InRegister(_) | RegisterLocation::Unknown => {}
            }
        }

        match layout.link_register {
            None => {
                // The call pushed the return address; at entry sp points
                // right at it.
                let ra_slot = TargetAddress::new(space, entry_sp);
                let ra = read_sized(target, ra_slot, asize as u8)?;
                registers.set_value_on_stack(layout.pc, ra, ra_slot);
                registers.set_value(layout.sp, entry_sp.wrapping_add(asize));
            }
            Some(lr) => {
                let ra = match registers.value(lr) {
                    Some(ra) => self.ops().normalize_return_address(ra),
                    None => return Ok(None),
                };
                registers.set_value(layout.pc, ra);
                registers.set_value(layout.sp, entry_sp);
            }
        }

        Ok(self.create_frame(FrameKind::Normal, services, space, registers))
    }

    fn unwind_frame_pointer_walk(
        &self,
        frame: &StackFrame,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
    ) -> Result<Option<StackFrame>, TargetAccessError> {
        let fp = match frame.frame_address() {
            Some(fp) if fp.value() != 0 => fp,
            _ => return Ok(None),
        };
        let step = match self.ops().unwind_frame_pointer(target, fp) {
            Ok(Some(step)) => step,
            Ok(None) | Err(_) => return Ok(None),
        };
        // A frame chain that does not move towards older frames is corrupt.
        if step.caller_fp != 0 && step.caller_fp <= fp.value() {
            return Ok(None);
        }
        let layout = self.layout();
        let space = target.address_space();
        let mut registers = Registers::new(layout, false);
        registers.set_value_on_stack(
            layout.pc,
            self.ops().normalize_return_address(step.ra),
            step.ra_slot,
        );
        registers.set_value(layout.sp, step.caller_sp);
        registers.set_value_on_stack(layout.fp, step.caller_fp, step.fp_slot);
        Ok(self.create_frame(FrameKind::Normal, services, space, registers))
    }

    /// Recognizes frames that need something other than call-stack rules:
    /// currently signal handler returns.
    pub fn try_special_unwind(
        &self,
        frame: &StackFrame,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
    ) -> Result<Option<StackFrame>, TargetAccessError> {
        let registers = match self.ops().sigreturn_context(target, frame) {
            Ok(Some(registers)) => registers,
            Ok(None) | Err(_) => return Ok(None),
        };
        trace!(pc = %frame.address(), "signal frame recovered");
        Ok(self.create_frame(FrameKind::Signal, services, target.address_space(), registers))
    }

    /// Recognizes a managed lazy-compilation stub at `address`: a small
    /// fixed code sequence that passes a method token to one of the
    /// runtime's trampoline entry points. Returns the embedded token, which
    /// names the method the stub will compile when first called.
    pub fn get_runtime_trampoline(
        &self,
        target: &mut dyn TargetMemoryAccess,
        runtime: &dyn ManagedRuntime,
        address: TargetAddress,
    ) -> Result<Option<TargetAddress>, TargetAccessError> {
        self.ops().runtime_trampoline(target, runtime, address)
    }

    /// Reads one record of the runtime's last-managed-frame chain.
    ///
    /// A record is five pointer-sized words: the previous record (tagged in
    /// its low two bits), the method slot, then pc, sp and fp of the frame
    /// the runtime saved. Returns the frame plus the link to the previous
    /// record, or `None` when the record is unreadable or empty.
    pub fn get_lmf(
        &self,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
        lmf_address: TargetAddress,
    ) -> Result<Option<(StackFrame, Option<TargetAddress>)>, TargetAccessError> {
        let layout = self.layout();
        let asize = layout.address_size as u64;
        let mut word = |i: u64| target.read_address(lmf_address + i * asize);
        let (previous, pc, sp, fp) = match (word(0), word(2), word(3), word(4)) {
            (Ok(previous), Ok(pc), Ok(sp), Ok(fp)) => (previous, pc, sp, fp),
            _ => return Ok(None),
        };
        if pc.value() == 0 {
            return Ok(None);
        }
        let mut registers = Registers::new(layout, false);
        registers.set_value(layout.pc, pc.value());
        registers.set_value(layout.sp, sp.value());
        registers.set_value(layout.fp, fp.value());
        let frame = match self.create_frame(FrameKind::Lmf, services, target.address_space(), registers) {
            Some(frame) => frame,
            None => return Ok(None),
        };
        let link = previous.value() & !3;
        let link = (link != 0).then(|| TargetAddress::new(lmf_address.space(), link));
        Ok(Some((frame, link)))
    }
}

pub(crate) fn read_sized(
    target: &mut dyn TargetMemoryAccess,
    address: TargetAddress,
    size: u8,
) -> Result<u64, TargetAccessError> {
    match size {
        4 => target.read_integer(address).map(u64::from),
        _ => target.read_long_integer(address),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::SymbolResolver;
    use crate::method::{Method, Symbol};
    use crate::test_support::MockTarget;
    use std::sync::Arc;

    const SPACE: AddressSpace = AddressSpace(1);

    fn addr(value: u64) -> TargetAddress {
        TargetAddress::new(SPACE, value)
    }

    struct NoSymbols;

    impl SymbolResolver for NoSymbols {
        fn lookup_method(&self, _address: TargetAddress) -> Option<Arc<Method>> {
            None
        }

        fn simple_lookup(&self, _address: TargetAddress, _exact_match: bool) -> Option<Symbol> {
            None
        }
    }

    #[test]
    fn triple_parsing() {
        assert_eq!(
            Architecture::from_target_triple("x86_64-unknown-linux-gnu").unwrap().name(),
            "x86_64"
        );
        assert_eq!(Architecture::from_target_triple("i686-pc-linux-gnu").unwrap().name(), "i386");
        assert_eq!(
            Architecture::from_target_triple("arm-unknown-linux-gnueabihf").unwrap().name(),
            "arm"
        );
        assert_eq!(
            Architecture::from_target_triple("armv7-unknown-linux-gnueabihf").unwrap().name(),
            "arm"
        );
        assert!(matches!(
            Architecture::from_target_triple("aarch64-apple-darwin"),
            Err(ArchError::UnsupportedTarget(_))
        ));
        assert!(matches!(
            Architecture::from_target_triple("riscv64gc-unknown-linux-gnu"),
            Err(ArchError::UnsupportedTarget(_))
        ));
    }

    #[test]
    fn create_frame_rejects_zero_pc() {
        let arch = Architecture::x86_64();
        let resolver = NoSymbols;
        let services = UnwindServices::new(&resolver);
        let layout = arch.layout();

        let mut registers = Registers::new(layout, true);
        registers.set_value(layout.pc, 0);
        registers.set_value(layout.sp, 0x7fff_0000);
        assert!(arch.create_frame(FrameKind::Normal, &services, SPACE, registers).is_none());

        let mut registers = Registers::new(layout, true);
        registers.set_value(layout.pc, 0x40_1000);
        registers.set_value(layout.sp, 0x7fff_0000);
        let frame = arch
            .create_frame(FrameKind::Normal, &services, SPACE, registers)
            .unwrap();
        assert_eq!(frame.address(), addr(0x40_1000));
        assert_eq!(frame.stack_pointer(), addr(0x7fff_0000));
        assert!(frame.frame_address().is_none());
    }

    #[test]
    fn lmf_record_walk() {
        let arch = Architecture::x86_64();
        let resolver = NoSymbols;
        let services = UnwindServices::new(&resolver);
        let mut target = MockTarget::new(SPACE, 8);

        let record = addr(0x9000);
        target.put_long(record, 0x8002); // previous, tag bits set
        target.put_long(record + 8, 0xdead); // method slot
        target.put_long(record + 16, 0x40_2000); // pc
        target.put_long(record + 24, 0x7fff_1000); // sp
        target.put_long(record + 32, 0x7fff_1040); // fp

        let (frame, link) = arch.get_lmf(&services, &mut target, record).unwrap().unwrap();
        assert_eq!(frame.kind(), FrameKind::Lmf);
        assert_eq!(frame.address(), addr(0x40_2000));
        assert_eq!(frame.stack_pointer(), addr(0x7fff_1000));
        assert_eq!(frame.frame_address(), Some(addr(0x7fff_1040)));
        assert_eq!(link, Some(addr(0x8000)));
    }

    #[test]
    fn lmf_with_zero_pc_is_empty() {
        let arch = Architecture::x86_64();
        let resolver = NoSymbols;
        let services = UnwindServices::new(&resolver);
        let mut target = MockTarget::new(SPACE, 8);

        let record = addr(0x9000);
        for i in 0..5u64 {
            target.put_long(record + i * 8, 0);
        }
        assert!(arch.get_lmf(&services, &mut target, record).unwrap().is_none());
    }

    #[test]
    fn read_instruction_shrinks_the_window() {
        let arch = Architecture::x86_64();
        let mut target = MockTarget::new(SPACE, 8);
        // A ret as the very last mapped byte.
        target.put_bytes(addr(0x5000), &[0xc3]);
        let instruction = arch.read_instruction(&mut target, addr(0x5000)).unwrap();
        assert_eq!(instruction.kind(), crate::instruction::InstructionKind::Ret);
        assert_eq!(instruction.byte_len(), Some(1));
    }
}
