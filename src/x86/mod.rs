//! x86 family support: x86-64 (long mode) and i386 (protected mode) share
//! the decoder and differ in register file, pointer width and the handful
//! of encodings that exist in only one mode.

mod decode;

use crate::address::TargetAddress;
use crate::arch::{read_sized, ArchOps, FramePointerUnwind};
use crate::error::TargetAccessError;
use crate::frame::StackFrame;
use crate::host::ManagedRuntime;
use crate::instruction::{Instruction, MAX_INSTRUCTION_LEN};
use crate::registers::{RegisterLayout, Registers};
use crate::target::TargetMemoryAccess;

/// Canonical register indices for x86-64, following the ptrace register
/// dump order.
pub(crate) mod reg64 {
    pub const R15: usize = 0;
    pub const R14: usize = 1;
    pub const R13: usize = 2;
    pub const R12: usize = 3;
    pub const RBP: usize = 4;
    pub const RBX: usize = 5;
    pub const R11: usize = 6;
    pub const R10: usize = 7;
    pub const R9: usize = 8;
    pub const R8: usize = 9;
    pub const RAX: usize = 10;
    pub const RCX: usize = 11;
    pub const RDX: usize = 12;
    pub const RSI: usize = 13;
    pub const RDI: usize = 14;
    pub const RIP: usize = 16;
    pub const EFLAGS: usize = 18;
    pub const RSP: usize = 19;
}

/// Canonical register indices for i386, following the ptrace register dump
/// order.
pub(crate) mod reg32 {
    pub const EBX: usize = 0;
    pub const ECX: usize = 1;
    pub const EDX: usize = 2;
    pub const ESI: usize = 3;
    pub const EDI: usize = 4;
    pub const EBP: usize = 5;
    pub const EAX: usize = 6;
    pub const EIP: usize = 12;
    pub const EFLAGS: usize = 14;
    pub const ESP: usize = 15;
}

static X86_64_LAYOUT: RegisterLayout = RegisterLayout {
    register_names: &[
        "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8", "rax", "rcx", "rdx",
        "rsi", "rdi", "orig_rax", "rip", "cs", "eflags", "rsp", "ss", "fs_base", "gs_base", "ds",
        "es", "fs", "gs",
    ],
    register_sizes: &[
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        None,
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
        Some(8),
    ],
    important_registers: &[
        reg64::RIP,
        reg64::RSP,
        reg64::RBP,
        reg64::RAX,
        reg64::RBX,
        reg64::RCX,
        reg64::RDX,
        reg64::RSI,
        reg64::RDI,
        reg64::R8,
        reg64::R9,
        reg64::R10,
        reg64::R11,
        reg64::R12,
        reg64::R13,
        reg64::R14,
        reg64::R15,
        reg64::EFLAGS,
    ],
    pc: reg64::RIP,
    sp: reg64::RSP,
    fp: reg64::RBP,
    link_register: None,
    address_size: 8,
};

static I386_LAYOUT: RegisterLayout = RegisterLayout {
    register_names: &[
        "ebx", "ecx", "edx", "esi", "edi", "ebp", "eax", "ds", "es", "fs", "gs", "orig_eax",
        "eip", "cs", "eflags", "esp", "ss",
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
        None,
        Some(4),
        Some(4),
        Some(4),
        Some(4),
        Some(4),
    ],
    important_registers: &[
        reg32::EIP,
        reg32::ESP,
        reg32::EBP,
        reg32::EAX,
        reg32::EBX,
        reg32::ECX,
        reg32::EDX,
        reg32::ESI,
        reg32::EDI,
        reg32::EFLAGS,
    ],
    pc: reg32::EIP,
    sp: reg32::ESP,
    fp: reg32::EBP,
    link_register: None,
    address_size: 4,
};

/// Hardware register number (modrm encoding, REX-extended) to canonical
/// index.
static ENCODING_TO_CANONICAL_64: [usize; 16] = [
    reg64::RAX,
    reg64::RCX,
    reg64::RDX,
    reg64::RBX,
    reg64::RSP,
    reg64::RBP,
    reg64::RSI,
    reg64::RDI,
    reg64::R8,
    reg64::R9,
    reg64::R10,
    reg64::R11,
    reg64::R12,
    reg64::R13,
    reg64::R14,
    reg64::R15,
];

static ENCODING_TO_CANONICAL_32: [usize; 8] = [
    reg32::EAX,
    reg32::ECX,
    reg32::EDX,
    reg32::EBX,
    reg32::ESP,
    reg32::EBP,
    reg32::ESI,
    reg32::EDI,
];

// The vdso's __restore_rt on x86-64: mov $0xf, %rax; syscall.
static SIGRETURN_SEQUENCE_64: &[u8] = &[0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];
// i386 __restore: pop %eax; mov $0x77, %eax; int $0x80.
static SIGRETURN_SEQUENCE_32: &[u8] = &[0x58, 0xb8, 0x77, 0x00, 0x00, 0x00, 0xcd, 0x80];
// i386 __restore_rt: mov $0xad, %eax; int $0x80.
static RT_SIGRETURN_SEQUENCE_32: &[u8] = &[0xb8, 0xad, 0x00, 0x00, 0x00, 0xcd, 0x80];

/// Saved register slots inside the x86-64 sigcontext, relative to its
/// start (which sits 0x28 bytes into the ucontext on the signal stack).
static SIGCONTEXT_OFFSETS_64: &[(usize, u64)] = &[
    (reg64::R8, 0x00),
    (reg64::R9, 0x08),
    (reg64::R10, 0x10),
    (reg64::R11, 0x18),
    (reg64::R12, 0x20),
    (reg64::R13, 0x28),
    (reg64::R14, 0x30),
    (reg64::R15, 0x38),
    (reg64::RDI, 0x40),
    (reg64::RSI, 0x48),
    (reg64::RBP, 0x50),
    (reg64::RBX, 0x58),
    (reg64::RDX, 0x60),
    (reg64::RAX, 0x68),
    (reg64::RCX, 0x70),
    (reg64::RSP, 0x78),
    (reg64::RIP, 0x80),
    (reg64::EFLAGS, 0x88),
];

/// Saved register slots inside the i386 sigcontext.
static SIGCONTEXT_OFFSETS_32: &[(usize, u64)] = &[
    (reg32::EDI, 16),
    (reg32::ESI, 20),
    (reg32::EBP, 24),
    (reg32::ESP, 28),
    (reg32::EBX, 32),
    (reg32::EDX, 36),
    (reg32::ECX, 40),
    (reg32::EAX, 44),
    (reg32::EIP, 56),
    (reg32::EFLAGS, 64),
];

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum X86Mode {
    Long,
    Protected,
}

pub(crate) struct X86Arch {
    mode: X86Mode,
}

impl X86Arch {
    pub(crate) fn long_mode() -> Self {
        Self { mode: X86Mode::Long }
    }

    pub(crate) fn protected_mode() -> Self {
        Self { mode: X86Mode::Protected }
    }

    fn read_sigcontext(
        &self,
        target: &mut dyn TargetMemoryAccess,
        base: TargetAddress,
        table: &[(usize, u64)],
    ) -> Result<Option<Registers>, TargetAccessError> {
        let layout = self.layout();
        let size = layout.address_size as u8;
        let mut registers = Registers::new(layout, false);
        for &(reg, offset) in table {
            let slot = base + offset;
            let value = match read_sized(target, slot, size) {
                Ok(value) => value,
                Err(_) => return Ok(None),
            };
            registers.set_value_on_stack(reg, value, slot);
        }
        Ok(Some(registers))
    }
}

impl ArchOps for X86Arch {
    fn name(&self) -> &'static str {
        match self.mode {
            X86Mode::Long => "x86_64",
            X86Mode::Protected => "i386",
        }
    }

    fn layout(&self) -> &'static RegisterLayout {
        match self.mode {
            X86Mode::Long => &X86_64_LAYOUT,
            X86Mode::Protected => &I386_LAYOUT,
        }
    }

    fn instruction_window(&self) -> usize {
        MAX_INSTRUCTION_LEN
    }

    fn decode_instruction(&self, bytes: &[u8], address: TargetAddress) -> Instruction {
        decode::decode(self.mode, self.layout(), bytes, address)
    }

    fn nop_encoding(&self) -> &'static [u8] {
        &[0x90]
    }

    fn register_map(&self, external: u16) -> Option<usize> {
        match self.mode {
            X86Mode::Long => ENCODING_TO_CANONICAL_64.get(usize::from(external)).copied(),
            X86Mode::Protected => ENCODING_TO_CANONICAL_32.get(usize::from(external)).copied(),
        }
    }

    fn dwarf_register_map(&self, register: gimli::Register) -> Option<usize> {
        match self.mode {
            X86Mode::Long => {
                use gimli::X86_64;
                match register {
                    X86_64::RAX => Some(reg64::RAX),
                    X86_64::RDX => Some(reg64::RDX),
                    X86_64::RCX => Some(reg64::RCX),
                    X86_64::RBX => Some(reg64::RBX),
                    X86_64::RSI => Some(reg64::RSI),
                    X86_64::RDI => Some(reg64::RDI),
                    X86_64::RBP => Some(reg64::RBP),
                    X86_64::RSP => Some(reg64::RSP),
                    X86_64::R8 => Some(reg64::R8),
                    X86_64::R9 => Some(reg64::R9),
                    X86_64::R10 => Some(reg64::R10),
                    X86_64::R11 => Some(reg64::R11),
                    X86_64::R12 => Some(reg64::R12),
                    X86_64::R13 => Some(reg64::R13),
                    X86_64::R14 => Some(reg64::R14),
                    X86_64::R15 => Some(reg64::R15),
                    X86_64::RA => Some(reg64::RIP),
                    _ => None,
                }
            }
            X86Mode::Protected => {
                use gimli::X86;
                match register {
                    X86::EAX => Some(reg32::EAX),
                    X86::ECX => Some(reg32::ECX),
                    X86::EDX => Some(reg32::EDX),
                    X86::EBX => Some(reg32::EBX),
                    X86::ESP => Some(reg32::ESP),
                    X86::EBP => Some(reg32::EBP),
                    X86::ESI => Some(reg32::ESI),
                    X86::EDI => Some(reg32::EDI),
                    X86::RA => Some(reg32::EIP),
                    _ => None,
                }
            }
        }
    }

    /// Classic `push %rbp; mov %rsp, %rbp` frames: the saved frame pointer
    /// sits at `[fp]`, the return address right above it.
    fn unwind_frame_pointer(
        &self,
        target: &mut dyn TargetMemoryAccess,
        fp: TargetAddress,
    ) -> Result<Option<FramePointerUnwind>, TargetAccessError> {
        let layout = self.layout();
        let asize = layout.address_size as u64;
        let size = layout.address_size as u8;
        let fp_slot = fp;
        let ra_slot = fp + asize;
        let caller_fp = match read_sized(target, fp_slot, size) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };
        let ra = match read_sized(target, ra_slot, size) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };
        Ok(Some(FramePointerUnwind {
            ra,
            ra_slot,
            caller_sp: fp.value().wrapping_add(2 * asize),
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
        let sp = frame.stack_pointer();
        match self.mode {
            X86Mode::Long => {
                match target.read_buffer(pc, SIGRETURN_SEQUENCE_64.len()) {
                    Ok(bytes) if bytes == SIGRETURN_SEQUENCE_64 => {}
                    _ => return Ok(None),
                }
                // sp points at the ucontext; the sigcontext is 0x28 bytes
                // into it.
                self.read_sigcontext(target, sp + 0x28, SIGCONTEXT_OFFSETS_64)
            }
            X86Mode::Protected => {
                let base = match target.read_buffer(pc, SIGRETURN_SEQUENCE_32.len()) {
                    Ok(bytes) if bytes == SIGRETURN_SEQUENCE_32 => sp + 4,
                    _ => match target.read_buffer(pc, RT_SIGRETURN_SEQUENCE_32.len()) {
                        // rt frame: siginfo and the ucontext head sit
                        // between sp and the sigcontext.
                        Ok(bytes) if bytes == RT_SIGRETURN_SEQUENCE_32 => sp + 160,
                        _ => return Ok(None),
                    },
                };
                self.read_sigcontext(target, base, SIGCONTEXT_OFFSETS_32)
            }
        }
    }

    /// Lazy-compilation stubs the JIT parks at not-yet-compiled call sites.
    ///
    /// Protected mode:
    /// ```text
    /// 68 xx xx xx xx      push   $method
    /// e9 xx xx xx xx      jmp    trampoline
    /// ```
    ///
    /// Long mode:
    /// ```text
    /// 49 ba xx*8          movabs $method, %r10
    /// 49 bb xx*8          movabs $trampoline, %r11
    /// 41 ff e3            jmp    *%r11
    /// ```
    fn runtime_trampoline(
        &self,
        target: &mut dyn TargetMemoryAccess,
        runtime: &dyn ManagedRuntime,
        address: TargetAddress,
    ) -> Result<Option<TargetAddress>, TargetAccessError> {
        let space = address.space();
        match self.mode {
            X86Mode::Protected => {
                let b = match target.read_buffer(address, 10) {
                    Ok(bytes) => bytes,
                    Err(_) => return Ok(None),
                };
                if b[0] != 0x68 || b[5] != 0xe9 {
                    return Ok(None);
                }
                let method = u32::from_le_bytes([b[1], b[2], b[3], b[4]]);
                let disp = i32::from_le_bytes([b[6], b[7], b[8], b[9]]);
                let destination = address.value().wrapping_add_signed(10 + i64::from(disp))
                    & 0xffff_ffff;
                if !runtime.is_trampoline_address(TargetAddress::new(space, destination)) {
                    return Ok(None);
                }
                Ok(Some(TargetAddress::new(space, u64::from(method))))
            }
            X86Mode::Long => {
                let b = match target.read_buffer(address, 23) {
                    Ok(bytes) => bytes,
                    Err(_) => return Ok(None),
                };
                if b[0..2] != [0x49, 0xba] || b[10..12] != [0x49, 0xbb] || b[20..23] != [0x41, 0xff, 0xe3] {
                    return Ok(None);
                }
                let method =
                    u64::from_le_bytes([b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9]]);
                let destination =
                    u64::from_le_bytes([b[12], b[13], b[14], b[15], b[16], b[17], b[18], b[19]]);
                if !runtime.is_trampoline_address(TargetAddress::new(space, destination)) {
                    return Ok(None);
                }
                Ok(Some(TargetAddress::new(space, method)))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::AddressSpace;
    use crate::arch::Architecture;
    use crate::frame::FrameKind;
    use crate::host::{CallbackFrameInfo, SymbolResolver, UnwindServices};
    use crate::instruction::MemoryWrite;
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

    struct KnownTrampoline(TargetAddress);

    impl ManagedRuntime for KnownTrampoline {
        fn is_trampoline_address(&self, address: TargetAddress) -> bool {
            address == self.0
        }

        fn is_delegate_invoke(&self, _address: TargetAddress) -> bool {
            false
        }

        fn callback_frame(
            &self,
            _target: &mut dyn TargetMemoryAccess,
            _stack_pointer: TargetAddress,
            _exact_match: bool,
        ) -> Result<Option<CallbackFrameInfo>, TargetAccessError> {
            Ok(None)
        }

        fn lmf_address(
            &self,
            _target: &mut dyn TargetMemoryAccess,
        ) -> Result<Option<TargetAddress>, TargetAccessError> {
            Ok(None)
        }
    }

    #[test]
    fn register_maps_agree_on_the_frame_registers() {
        let arch = Architecture::x86_64();
        assert_eq!(arch.register_map(5).unwrap(), reg64::RBP);
        assert_eq!(arch.register_map(4).unwrap(), reg64::RSP);
        assert_eq!(arch.register_map(0).unwrap(), reg64::RAX);
        assert_eq!(arch.dwarf_register_map(gimli::X86_64::RBP).unwrap(), reg64::RBP);
        assert_eq!(arch.dwarf_register_map(gimli::X86_64::RA).unwrap(), reg64::RIP);
        assert!(arch.register_map(16).is_err());

        let arch = Architecture::i386();
        assert_eq!(arch.register_map(5).unwrap(), reg32::EBP);
        assert_eq!(arch.dwarf_register_map(gimli::X86::RA).unwrap(), reg32::EIP);
        assert!(arch.register_map(8).is_err());
    }

    #[test]
    fn layouts_mark_the_bookkeeping_slot_absent() {
        let arch = Architecture::x86_64();
        assert_eq!(arch.register_sizes()[15], None); // orig_rax
        assert!(!arch.all_register_indices().any(|i| i == 15));

        let arch = Architecture::i386();
        assert_eq!(arch.register_sizes()[11], None); // orig_eax
    }

    #[test]
    fn sigreturn_recovers_the_interrupted_context() {
        let arch = Architecture::x86_64();
        let resolver = NoSymbols;
        let services = UnwindServices::new(&resolver);
        let mut target = MockTarget::new(SPACE, 8);

        let restorer = addr(0x7fff_f000);
        target.put_bytes(restorer, SIGRETURN_SEQUENCE_64);
        let sp = addr(0x7ffe_0000);
        let sigcontext = sp + 0x28;
        for &(_, offset) in SIGCONTEXT_OFFSETS_64 {
            target.put_long(sigcontext + offset, 0);
        }
        target.put_long(sigcontext + 0x80, 0x40_1234); // rip
        target.put_long(sigcontext + 0x78, 0x7fff_2000); // rsp
        target.put_long(sigcontext + 0x50, 0x7fff_2040); // rbp
        target.put_long(sigcontext + 0x58, 0xbeef); // rbx

        let mut registers = Registers::new(arch.layout(), true);
        registers.set_value(reg64::RIP, restorer.value());
        registers.set_value(reg64::RSP, sp.value());
        let frame = arch
            .create_frame(FrameKind::Normal, &services, SPACE, registers)
            .unwrap();

        let signal_frame = arch.try_special_unwind(&frame, &services, &mut target).unwrap().unwrap();
        assert_eq!(signal_frame.kind(), FrameKind::Signal);
        assert_eq!(signal_frame.address(), addr(0x40_1234));
        assert_eq!(signal_frame.stack_pointer(), addr(0x7fff_2000));
        assert_eq!(signal_frame.registers().value(reg64::RBX), Some(0xbeef));
        // The recovered values live in the sigcontext, so they are
        // writable in place.
        assert_eq!(
            signal_frame.registers().get(reg64::RBX).unwrap().address_on_stack(),
            Some(sigcontext + 0x58)
        );
    }

    #[test]
    fn sigreturn_needs_the_exact_stub() {
        let arch = Architecture::x86_64();
        let resolver = NoSymbols;
        let services = UnwindServices::new(&resolver);
        let mut target = MockTarget::new(SPACE, 8);

        let pc = addr(0x40_0000);
        target.put_bytes(pc, &[0x48, 0xc7, 0xc0, 0x10, 0x00, 0x00, 0x00, 0x0f, 0x05]);
        let mut registers = Registers::new(arch.layout(), true);
        registers.set_value(reg64::RIP, pc.value());
        registers.set_value(reg64::RSP, 0x7ffe_0000);
        let frame = arch
            .create_frame(FrameKind::Normal, &services, SPACE, registers)
            .unwrap();
        assert!(arch.try_special_unwind(&frame, &services, &mut target).unwrap().is_none());
    }

    #[test]
    fn frame_pointer_step_reads_both_slots() {
        let arch = Architecture::x86_64();
        let resolver = NoSymbols;
        let services = UnwindServices::new(&resolver);
        let mut target = MockTarget::new(SPACE, 8);

        let fp = addr(0x7fff_0000);
        target.put_long(fp, 0x7fff_0100); // caller rbp
        target.put_long(fp + 8, 0x40_1111); // return address

        let mut registers = Registers::new(arch.layout(), true);
        registers.set_value(reg64::RIP, 0x40_0500);
        registers.set_value(reg64::RSP, 0x7ffe_ff00);
        registers.set_value(reg64::RBP, fp.value());
        let frame = arch
            .create_frame(FrameKind::Normal, &services, SPACE, registers)
            .unwrap();

        let caller = arch.unwind_stack(&frame, &services, &mut target, &[], 0).unwrap().unwrap();
        assert_eq!(caller.address(), addr(0x40_1111));
        assert_eq!(caller.stack_pointer(), addr(0x7fff_0010));
        assert_eq!(caller.frame_address(), Some(addr(0x7fff_0100)));
    }

    #[test]
    fn frame_pointer_step_rejects_a_backwards_chain() {
        let arch = Architecture::x86_64();
        let resolver = NoSymbols;
        let services = UnwindServices::new(&resolver);
        let mut target = MockTarget::new(SPACE, 8);

        let fp = addr(0x7fff_0000);
        target.put_long(fp, 0x7ffe_0000); // "caller" below us
        target.put_long(fp + 8, 0x40_1111);

        let mut registers = Registers::new(arch.layout(), true);
        registers.set_value(reg64::RIP, 0x40_0500);
        registers.set_value(reg64::RSP, 0x7ffe_ff00);
        registers.set_value(reg64::RBP, fp.value());
        let frame = arch
            .create_frame(FrameKind::Normal, &services, SPACE, registers)
            .unwrap();
        assert!(arch.unwind_stack(&frame, &services, &mut target, &[], 0).unwrap().is_none());
    }

    #[test]
    fn lazy_stub_yields_its_method_token() {
        let arch = Architecture::x86_64();
        let mut target = MockTarget::new(SPACE, 8);
        let stub = addr(0x90_0000);
        let entry = addr(0x7f00_4000);
        let runtime = KnownTrampoline(entry);

        target.put_bytes(stub, &[0x49, 0xba]); // movabs $method, %r10
        target.put_long(stub + 2, 0x7f12_3400);
        target.put_bytes(stub + 10, &[0x49, 0xbb]); // movabs $entry, %r11
        target.put_long(stub + 12, entry.value());
        target.put_bytes(stub + 20, &[0x41, 0xff, 0xe3]); // jmp *%r11

        assert_eq!(
            arch.get_runtime_trampoline(&mut target, &runtime, stub).unwrap(),
            Some(addr(0x7f12_3400))
        );

        // Same shape, but the jump lands outside the runtime's trampolines.
        target.put_long(stub + 12, entry.value() + 0x100);
        assert_eq!(arch.get_runtime_trampoline(&mut target, &runtime, stub).unwrap(), None);
    }

    #[test]
    fn protected_mode_stub_pushes_the_token() {
        let arch = Architecture::i386();
        let mut target = MockTarget::new(SPACE, 4);
        let stub = addr(0x90_0000);
        let entry = addr(0x91_2340);
        let runtime = KnownTrampoline(entry);

        target.put_bytes(stub, &[0x68, 0x00, 0x55, 0x00, 0x00]); // push $0x5500
        target.put_bytes(stub + 5, &[0xe9]); // jmp entry
        target.put_word(stub + 6, (entry.value() - (stub.value() + 10)) as u32);

        assert_eq!(
            arch.get_runtime_trampoline(&mut target, &runtime, stub).unwrap(),
            Some(addr(0x5500))
        );
    }

    #[test]
    fn ordinary_code_is_not_a_lazy_stub() {
        let arch = Architecture::x86_64();
        let mut target = MockTarget::new(SPACE, 8);
        let runtime = KnownTrampoline(addr(0x7f00_4000));

        let code = addr(0x40_0000);
        target.put_bytes(code, &[0x55; 23]);
        assert_eq!(arch.get_runtime_trampoline(&mut target, &runtime, code).unwrap(), None);

        // Unreadable memory means "not a stub", not an error.
        let unmapped = addr(0x10);
        assert_eq!(arch.get_runtime_trampoline(&mut target, &runtime, unmapped).unwrap(), None);
    }

    #[test]
    fn interpret_steps_over_decoded_branches() {
        let arch = Architecture::x86_64();
        let mut target = MockTarget::new(SPACE, 8);
        let mut registers = Registers::new(arch.layout(), true);
        registers.set_value(reg64::RIP, 0x1000);
        registers.set_value(reg64::RSP, 0x7000);
        target.set_live_registers(registers);
        target.put_long(addr(0x7000), 0x4242);

        // c3  retq
        let ret = arch.decode_instruction(&[0xc3], addr(0x1000));
        let emulation = ret.interpret(&mut target).unwrap().unwrap();
        assert_eq!(emulation.registers.pc(), Some(0x4242));
        assert_eq!(emulation.registers.sp(), Some(0x7008));

        // e8 fc 00 00 00  callq 0x1101
        let call = arch.decode_instruction(&[0xe8, 0xfc, 0x00, 0x00, 0x00], addr(0x1000));
        let emulation = call.interpret(&mut target).unwrap().unwrap();
        assert_eq!(emulation.registers.pc(), Some(0x1101));
        assert_eq!(emulation.registers.sp(), Some(0x6ff8));
        assert_eq!(
            emulation.writes,
            vec![MemoryWrite { address: addr(0x6ff8), value: 0x1005, size: 8 }]
        );

        // e9 fb 00 00 00  jmp 0x1100
        let jump = arch.decode_instruction(&[0xe9, 0xfb, 0x00, 0x00, 0x00], addr(0x1000));
        let emulation = jump.interpret(&mut target).unwrap().unwrap();
        assert_eq!(emulation.registers.pc(), Some(0x1100));
        assert_eq!(emulation.registers.sp(), Some(0x7000));
        assert!(emulation.writes.is_empty());
    }
}
