//! ARM (AArch32) support.

mod decode;

use crate::address::TargetAddress;
use crate::arch::{read_sized, ArchOps, FramePointerUnwind};
use crate::error::TargetAccessError;
use crate::frame::StackFrame;
use crate::host::ManagedRuntime;
use crate::instruction::Instruction;
use crate::registers::{RegisterLayout, Registers};
use crate::target::TargetMemoryAccess;

/// Canonical register indices, following the ptrace register dump order:
/// r0..r12, then sp, lr, pc, cpsr.
pub(crate) mod reg {
    pub const R0: usize = 0;
    pub const R4: usize = 4;
    pub const R7: usize = 7;
    pub const FP: usize = 11;
    pub const IP: usize = 12;
    pub const SP: usize = 13;
    pub const LR: usize = 14;
    pub const PC: usize = 15;
    pub const CPSR: usize = 16;
}

static ARM_LAYOUT: RegisterLayout = RegisterLayout {
    register_names: &[
        "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "fp", "ip", "sp",
        "lr", "pc", "cpsr", "orig_r0",
    ],
    register_sizes: &[
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        None,
    ],
    important_registers: &[
        reg::PC,
        reg::SP,
        reg::LR,
        reg::FP,
        0,
        1,
        2,
        3,
        4,
        5,
        6,
        7,
        8,
        9,
        10,
        reg::IP,
        reg::CPSR,
    ],
    pc: reg::PC,
    sp: reg::SP,
    fp: reg::FP,
    link_register: Some(reg::LR),
    address_size: 4,
};

// mov r7, #0x77 / mov r7, #0xad, followed by swi 0. The vdso sigreturn
// stubs on arm-linux.
const SIGRETURN_WORD: u32 = 0xe3a0_7077;
const RT_SIGRETURN_WORD: u32 = 0xe3a0_70ad;
const SWI_WORD: u32 = 0xef00_0000;

/// Byte offset from the signal frame (where sp points in the stub) to the
/// saved r0 slot; the remaining registers follow at word steps, ending with
/// cpsr.
const SIGFRAME_R0_OFFSET: u64 = 32;

/// The rt variant carries a 128-byte siginfo block between sp and the
/// machine context.
const RT_SIGFRAME_R0_OFFSET: u64 = SIGFRAME_R0_OFFSET + 128;

// ldr ip, [pc] / ldr pc, [pc]: a lazy-compilation stub loads the method
// token and the trampoline entry from the two literal words that follow.
const TRAMPOLINE_LOAD_TOKEN: u32 = 0xe59f_c000;
const TRAMPOLINE_LOAD_ENTRY: u32 = 0xe59f_f000;

pub(crate) struct ArmArch;

impl ArchOps for ArmArch {
    fn name(&self) -> &'static str {
        "arm"
    }

    fn layout(&self) -> &'static RegisterLayout {
        &ARM_LAYOUT
    }

    fn instruction_window(&self) -> usize {
        4
    }

    fn decode_instruction(&self, bytes: &[u8], address: TargetAddress) -> Instruction {
        decode::decode(self.layout(), bytes, address)
    }

    /// mov r0, r0
    fn nop_encoding(&self) -> &'static [u8] {
        &[0x00, 0x00, 0xa0, 0xe1]
    }

    fn register_map(&self, external: u16) -> Option<usize> {
        // Hardware numbering is the canonical numbering.
        (external <= reg::CPSR as u16).then_some(usize::from(external))
    }

    fn dwarf_register_map(&self, register: gimli::Register) -> Option<usize> {
        (register.0 <= 15).then_some(usize::from(register.0))
    }

    /// The frame pointer points at the saved return address, with the
    /// caller's frame pointer in the word below it.
    fn unwind_frame_pointer(
        &self,
        target: &mut dyn TargetMemoryAccess,
        fp: TargetAddress,
    ) -> Result<Option<FramePointerUnwind>, TargetAccessError> {
        let ra_slot = fp;
        let fp_slot = fp - 4u64;
        let ra = match read_sized(target, ra_slot, 4) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };
        let caller_fp = match read_sized(target, fp_slot, 4) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };
        Ok(Some(FramePointerUnwind {
            ra,
            ra_slot,
            caller_sp: fp.value().wrapping_add(4),
            caller_fp,
            fp_slot,
        }))
    }

    fn sigreturn_context(
        &self,
        target: &mut dyn TargetMemoryAccess,
        frame: &StackFrame,
    ) -> Result<Option<Registers>, TargetAccessError> {
        let pc = frame.address();
        let words = match (target.read_integer(pc), target.read_integer(pc + 4u64)) {
            (Ok(first), Ok(second)) => (first, second),
            _ => return Ok(None),
        };
        if words.1 != SWI_WORD || (words.0 != SIGRETURN_WORD && words.0 != RT_SIGRETURN_WORD) {
            return Ok(None);
        }
        let mut registers = Registers::new(self.layout(), false);
        let offset = if words.0 == RT_SIGRETURN_WORD {
            RT_SIGFRAME_R0_OFFSET
        } else {
            SIGFRAME_R0_OFFSET
        };
        let base = frame.stack_pointer() + offset;
        for index in reg::R0..=reg::CPSR {
            let slot = base + (index - reg::R0) as u64 * 4;
            let value = match read_sized(target, slot, 4) {
                Ok(value) => value,
                Err(_) => return Ok(None),
            };
            registers.set_value_on_stack(index, value, slot);
        }
        Ok(Some(registers))
    }

    /// Lazy-compilation stubs the JIT parks at not-yet-compiled call sites:
    ///
    /// ```text
    /// e59fc000        ldr    ip, [pc]     ; method token
    /// e59ff000        ldr    pc, [pc]     ; trampoline entry
    ///                 .word  method
    ///                 .word  trampoline
    /// ```
    ///
    /// The loads skip one word because the pc reads as the instruction
    /// address plus 8.
    fn runtime_trampoline(
        &self,
        target: &mut dyn TargetMemoryAccess,
        runtime: &dyn ManagedRuntime,
        address: TargetAddress,
    ) -> Result<Option<TargetAddress>, TargetAccessError> {
        let words = match (
            target.read_integer(address),
            target.read_integer(address + 4u64),
            target.read_integer(address + 8u64),
            target.read_integer(address + 12u64),
        ) {
            (Ok(first), Ok(second), Ok(method), Ok(entry)) => (first, second, method, entry),
            _ => return Ok(None),
        };
        if words.0 != TRAMPOLINE_LOAD_TOKEN || words.1 != TRAMPOLINE_LOAD_ENTRY {
            return Ok(None);
        }
        let space = address.space();
        if !runtime.is_trampoline_address(TargetAddress::new(space, u64::from(words.3))) {
            return Ok(None);
        }
        Ok(Some(TargetAddress::new(space, u64::from(words.2))))
    }

    /// Bit 0 flags a Thumb-mode return target and is not part of the
    /// address.
    fn normalize_return_address(&self, ra: u64) -> u64 {
        ra & !1
    }
}
