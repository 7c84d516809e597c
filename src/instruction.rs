use std::fmt::{self, Debug};

use arrayvec::ArrayVec;

use crate::address::TargetAddress;
use crate::arch::{read_sized, Architecture};
use crate::display_utils::HexNum;
use crate::error::TargetAccessError;
use crate::host::UnwindServices;
use crate::registers::{RegisterLayout, Registers};
use crate::target::TargetMemoryAccess;

/// Longest instruction any supported architecture can produce (the x86
/// hard limit).
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Coarse classification of a decoded instruction. The decoder only tells
/// apart what unwinding and stepping need to know.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    /// Not classified. On variable-length targets the byte length may be
    /// unknown as well.
    Unknown,
    /// Safe for in-debugger interpretation (push/pop/mov/stack adjust/nop).
    Interpretable,
    ConditionalJump,
    IndirectCall,
    Call,
    IndirectJump,
    Jump,
    Ret,
}

impl InstructionKind {
    #[inline]
    pub fn is_call(self) -> bool {
        matches!(self, InstructionKind::Call | InstructionKind::IndirectCall)
    }

    #[inline]
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            InstructionKind::Jump | InstructionKind::IndirectJump | InstructionKind::ConditionalJump
        )
    }

    /// True for everything that redirects execution rather than falling
    /// through.
    #[inline]
    pub fn transfers_control(self) -> bool {
        self.is_call() || self.is_jump() || self == InstructionKind::Ret
    }
}

/// What a call instruction turned out to point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrampolineType {
    None,
    /// First instruction of a native linker stub (nothing resolved yet).
    NativeTrampolineStart,
    /// A native linker stub whose destination slot is already filled in.
    NativeTrampoline,
    /// A trampoline belonging to the managed runtime.
    ManagedTrampoline,
    /// The runtime's delegate invoke thunk.
    DelegateInvoke,
}

/// Branch destination as far as the decoder could pin it down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BranchTarget {
    /// No destination; the instruction is not a branch, or its destination
    /// cannot be computed from registers and memory.
    None,
    Direct(TargetAddress),
    /// Destination sits in a register (canonical index).
    Register(usize),
    /// Destination is loaded from `[base + displacement]`; a `base` of
    /// `None` means an absolute slot address (ip-relative displacements are
    /// folded at decode time).
    Indirect { base: Option<usize>, displacement: i64 },
}

/// Register-level effect of an interpretable instruction, in canonical
/// register indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum InsnEffect {
    PushReg(usize),
    /// Multi-register push, lowest-numbered register at the lowest address.
    PushMany(ArrayVec<u8, 16>),
    PopReg(usize),
    /// Multi-register pop, lowest-numbered register from the lowest
    /// address. Travels with return instructions that restore registers on
    /// the way out.
    PopMany(ArrayVec<u8, 16>),
    MoveReg { dst: usize, src: usize },
    MoveImm { dst: usize, imm: u64 },
    StoreReg { reg: usize, base: usize, offset: i32 },
    LoadReg { reg: usize, base: usize, offset: i32 },
    /// Immediate stack pointer adjustment, negative grows the stack.
    AdjustSp { delta: i32 },
    /// Stack pointer change by an amount only known at run time (alignment
    /// masks, register-sized adjustments).
    AdjustSpUnknown,
    /// Destination register is overwritten with a value the decoder does
    /// not model.
    Clobber(usize),
    /// Several registers overwritten at once (load multiple, long
    /// multiply).
    ClobberMany(ArrayVec<u8, 16>),
    Nop,
}

/// One pending memory write produced by interpreting an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryWrite {
    pub address: TargetAddress,
    pub value: u64,
    pub size: u8,
}

/// Outcome of interpreting one instruction: the register file afterwards
/// plus the memory writes that would have happened. Nothing has been
/// applied to the target.
pub struct Emulation {
    pub registers: Registers,
    pub writes: Vec<MemoryWrite>,
}

/// One decoded instruction of the inferior.
pub struct Instruction {
    pub(crate) layout: &'static RegisterLayout,
    pub(crate) address: TargetAddress,
    pub(crate) kind: InstructionKind,
    /// The instruction reads its own address: a relative branch, or an
    /// instruction-pointer-relative operand.
    pub(crate) ip_relative: bool,
    /// Byte length, when the decoder could determine it.
    pub(crate) len: Option<u8>,
    /// The instruction bytes when the length is known, otherwise the bytes
    /// examined before giving up.
    pub(crate) bytes: ArrayVec<u8, MAX_INSTRUCTION_LEN>,
    pub(crate) target: BranchTarget,
    pub(crate) effect: Option<InsnEffect>,
}

impl Instruction {
    #[inline]
    pub fn address(&self) -> TargetAddress {
        self.address
    }

    #[inline]
    pub fn kind(&self) -> InstructionKind {
        self.kind
    }

    #[inline]
    pub fn byte_len(&self) -> Option<usize> {
        self.len.map(usize::from)
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn is_call(&self) -> bool {
        self.kind.is_call()
    }

    /// Whether the instruction's behavior depends on where it sits. Such an
    /// instruction cannot be executed from a copy at another address, only
    /// interpreted in place.
    #[inline]
    pub fn is_ip_relative(&self) -> bool {
        self.ip_relative
    }

    /// Address of the following instruction, when the length is known.
    pub fn next_address(&self) -> Option<TargetAddress> {
        self.len.map(|len| self.address + u64::from(len))
    }

    /// Computes where this instruction transfers control to, consulting the
    /// thread's registers and memory for indirect forms. Reading from the
    /// target does not change it, so this can be called repeatedly.
    ///
    /// `Ok(None)` means the instruction has no destination or the
    /// destination cannot be resolved right now (an unreadable indirect
    /// slot, an invalid register).
    pub fn effective_address(
        &self,
        target: &mut dyn TargetMemoryAccess,
    ) -> Result<Option<TargetAddress>, TargetAccessError> {
        match self.target {
            BranchTarget::None => Ok(None),
            BranchTarget::Direct(address) => Ok(Some(address)),
            BranchTarget::Register(reg) => {
                let regs = target.get_registers()?;
                Ok(regs
                    .value(reg)
                    .map(|value| TargetAddress::new(target.address_space(), value)))
            }
            BranchTarget::Indirect { base, displacement } => {
                let base_value = match base {
                    None => 0,
                    Some(reg) => {
                        let regs = target.get_registers()?;
                        match regs.value(reg) {
                            Some(value) => value,
                            None => return Ok(None),
                        }
                    }
                };
                let slot = TargetAddress::new(
                    target.address_space(),
                    base_value.wrapping_add_signed(displacement),
                );
                // An unreadable slot just means we cannot name the
                // destination.
                Ok(target.read_address(slot).ok())
            }
        }
    }

    /// Classifies the destination of a call instruction. Native stubs are
    /// checked before anything the managed runtime owns, so a PLT entry
    /// that happens to point into runtime code still reports as native.
    ///
    /// A call into a lazy-compilation stub reports the method token the
    /// stub carries rather than the stub's own address.
    pub fn check_trampoline(
        &self,
        arch: &Architecture,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
    ) -> Result<(TrampolineType, Option<TargetAddress>), TargetAccessError> {
        if !self.kind.is_call() {
            return Ok((TrampolineType::None, None));
        }
        let call_target = match self.effective_address(target)? {
            Some(address) => address,
            None => return Ok((TrampolineType::None, None)),
        };
        if let Some(trampolines) = services.native_trampolines {
            if trampolines.is_trampoline_start(call_target) {
                return Ok((TrampolineType::NativeTrampolineStart, Some(call_target)));
            }
            if let Some(destination) = trampolines.trampoline_destination(target, call_target)? {
                return Ok((TrampolineType::NativeTrampoline, Some(destination)));
            }
        }
        if let Some(runtime) = services.runtime {
            if runtime.is_delegate_invoke(call_target) {
                return Ok((TrampolineType::DelegateInvoke, Some(call_target)));
            }
            if let Some(method) = arch.get_runtime_trampoline(target, runtime, call_target)? {
                return Ok((TrampolineType::ManagedTrampoline, Some(method)));
            }
            if runtime.is_trampoline_address(call_target) {
                return Ok((TrampolineType::ManagedTrampoline, Some(call_target)));
            }
        }
        Ok((TrampolineType::None, Some(call_target)))
    }

    /// Interprets this instruction against the thread's current register
    /// file, without touching the target. Used to step over a breakpoint
    /// without executing the patched-out instruction in place.
    ///
    /// Control transfers are followed: jumps and calls land on their
    /// resolved destination, returns recover the saved pc. `Ok(None)` when
    /// the instruction cannot be interpreted, an operand register has no
    /// known value, or a destination does not resolve.
    pub fn interpret(
        &self,
        target: &mut dyn TargetMemoryAccess,
    ) -> Result<Option<Emulation>, TargetAccessError> {
        let len = match self.len {
            Some(len) => len,
            None => return Ok(None),
        };
        let mut registers = target.get_registers()?;
        let mut writes = Vec::new();
        let asize = self.layout.address_size as u64;
        let sp_index = self.layout.sp;
        let pc_index = self.layout.pc;
        let space = target.address_space();

        macro_rules! reg {
            ($index:expr) => {
                match registers.value($index) {
                    Some(value) => value,
                    None => return Ok(None),
                }
            };
        }

        let pc = match self.kind {
            // A conditional branch would need the flags evaluated.
            InstructionKind::Unknown | InstructionKind::ConditionalJump => return Ok(None),
            InstructionKind::Interpretable => {
                let effect = match &self.effect {
                    Some(effect) => effect,
                    None => return Ok(None),
                };
                match effect {
                    InsnEffect::PushReg(reg) => {
                        let value = reg!(*reg);
                        let sp = reg!(sp_index).wrapping_sub(asize);
                        writes.push(MemoryWrite {
                            address: TargetAddress::new(space, sp),
                            value,
                            size: asize as u8,
                        });
                        registers.set_value(sp_index, sp);
                    }
                    InsnEffect::PushMany(list) => {
                        let mut sp = reg!(sp_index).wrapping_sub(asize * list.len() as u64);
                        registers.set_value(sp_index, sp);
                        for reg in list {
                            let value = reg!(usize::from(*reg));
                            writes.push(MemoryWrite {
                                address: TargetAddress::new(space, sp),
                                value,
                                size: asize as u8,
                            });
                            sp = sp.wrapping_add(asize);
                        }
                    }
                    InsnEffect::PopReg(reg) => {
                        let sp = reg!(sp_index);
                        let slot = TargetAddress::new(space, sp);
                        let value = read_sized(target, slot, asize as u8)?;
                        registers.set_value(*reg, value);
                        registers.set_value(sp_index, sp.wrapping_add(asize));
                    }
                    InsnEffect::MoveReg { dst, src } => {
                        let value = reg!(*src);
                        registers.set_value(*dst, value);
                    }
                    InsnEffect::MoveImm { dst, imm } => {
                        registers.set_value(*dst, *imm);
                    }
                    InsnEffect::StoreReg { reg, base, offset } => {
                        let value = reg!(*reg);
                        let address = reg!(*base).wrapping_add_signed(i64::from(*offset));
                        writes.push(MemoryWrite {
                            address: TargetAddress::new(space, address),
                            value,
                            size: asize as u8,
                        });
                    }
                    InsnEffect::LoadReg { reg, base, offset } => {
                        let address = reg!(*base).wrapping_add_signed(i64::from(*offset));
                        let slot = TargetAddress::new(space, address);
                        let value = read_sized(target, slot, asize as u8)?;
                        registers.set_value(*reg, value);
                    }
                    InsnEffect::AdjustSp { delta } => {
                        let sp = reg!(sp_index).wrapping_add_signed(i64::from(*delta));
                        registers.set_value(sp_index, sp);
                    }
                    InsnEffect::Nop => {}
                    InsnEffect::PopMany(_)
                    | InsnEffect::Clobber(_)
                    | InsnEffect::ClobberMany(_)
                    | InsnEffect::AdjustSpUnknown => return Ok(None),
                }
                reg!(pc_index).wrapping_add(u64::from(len))
            }
            InstructionKind::Jump | InstructionKind::IndirectJump => {
                match self.effective_address(target)? {
                    Some(destination) => destination.value(),
                    None => return Ok(None),
                }
            }
            InstructionKind::Call | InstructionKind::IndirectCall => {
                let destination = match self.effective_address(target)? {
                    Some(destination) => destination.value(),
                    None => return Ok(None),
                };
                let return_address = self.address.value().wrapping_add(u64::from(len));
                match self.layout.link_register {
                    Some(link) => registers.set_value(link, return_address),
                    None => {
                        let sp = reg!(sp_index).wrapping_sub(asize);
                        writes.push(MemoryWrite {
                            address: TargetAddress::new(space, sp),
                            value: return_address,
                            size: asize as u8,
                        });
                        registers.set_value(sp_index, sp);
                    }
                }
                destination
            }
            InstructionKind::Ret => match (self.target, &self.effect) {
                // Return through a register, `bx lr` style. Sp is untouched.
                (BranchTarget::Register(register), _) => reg!(register),
                // Epilogue pop: every listed register reloads from the
                // stack, the pc from the highest slot.
                (_, Some(InsnEffect::PopMany(list))) => {
                    let mut sp = reg!(sp_index);
                    for register in list {
                        let slot = TargetAddress::new(space, sp);
                        let value = read_sized(target, slot, asize as u8)?;
                        registers.set_value(usize::from(*register), value);
                        sp = sp.wrapping_add(asize);
                    }
                    registers.set_value(sp_index, sp);
                    reg!(pc_index)
                }
                // Plain pop of the return address. An `AdjustSp` effect
                // carries the full release for the immediate forms.
                (_, effect) => {
                    let release = match effect {
                        None => asize as i64,
                        Some(InsnEffect::AdjustSp { delta }) => i64::from(*delta),
                        Some(_) => return Ok(None),
                    };
                    let sp = reg!(sp_index);
                    let slot = TargetAddress::new(space, sp);
                    let value = read_sized(target, slot, asize as u8)?;
                    registers.set_value(sp_index, sp.wrapping_add_signed(release));
                    value
                }
            },
        };

        registers.set_value(pc_index, pc);
        Ok(Some(Emulation { registers, writes }))
    }
}

impl Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instruction")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("bytes", &HexBytes(&self.bytes))
            .finish()
    }
}

struct HexBytes<'a>(&'a [u8]);

impl Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|b| HexNum(*b)))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::AddressSpace;
    use crate::host::{CallbackFrameInfo, ManagedRuntime, SymbolResolver};
    use crate::method::{Method, Symbol};
    use crate::test_support::MockTarget;
    use std::sync::Arc;

    static LAYOUT: RegisterLayout = RegisterLayout {
        register_names: &["a", "b", "sp", "pc"],
        register_sizes: &[Some(8), Some(8), Some(8), Some(8)],
        important_registers: &[0, 1, 2, 3],
        pc: 3,
        sp: 2,
        fp: 1,
        link_register: None,
        address_size: 8,
    };

    const SPACE: AddressSpace = AddressSpace(1);

    fn addr(value: u64) -> TargetAddress {
        TargetAddress::new(SPACE, value)
    }

    fn insn(kind: InstructionKind, target: BranchTarget, effect: Option<InsnEffect>) -> Instruction {
        let mut bytes = ArrayVec::new();
        bytes.push(0x90);
        Instruction {
            layout: &LAYOUT,
            address: addr(0x1000),
            kind,
            ip_relative: false,
            len: Some(1),
            bytes,
            target,
            effect,
        }
    }

    fn live_registers(target: &mut MockTarget, values: &[(usize, u64)]) {
        let mut regs = Registers::new(&LAYOUT, true);
        for &(index, value) in values {
            regs.set_value(index, value);
        }
        target.set_live_registers(regs);
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
    fn is_call_only_for_call_kinds() {
        assert!(InstructionKind::Call.is_call());
        assert!(InstructionKind::IndirectCall.is_call());
        for kind in [
            InstructionKind::Unknown,
            InstructionKind::Interpretable,
            InstructionKind::ConditionalJump,
            InstructionKind::IndirectJump,
            InstructionKind::Jump,
            InstructionKind::Ret,
        ] {
            assert!(!kind.is_call(), "{kind:?}");
        }
    }

    #[test]
    fn effective_address_direct() {
        let mut target = MockTarget::new(SPACE, 8);
        let i = insn(InstructionKind::Jump, BranchTarget::Direct(addr(0x2000)), None);
        assert_eq!(i.effective_address(&mut target).unwrap(), Some(addr(0x2000)));
    }

    #[test]
    fn effective_address_register_indirect() {
        let mut target = MockTarget::new(SPACE, 8);
        live_registers(&mut target, &[(0, 0x3000)]);
        let i = insn(InstructionKind::IndirectCall, BranchTarget::Register(0), None);
        assert_eq!(i.effective_address(&mut target).unwrap(), Some(addr(0x3000)));
    }

    #[test]
    fn effective_address_memory_indirect_reads_the_slot() {
        let mut target = MockTarget::new(SPACE, 8);
        live_registers(&mut target, &[(1, 0x5000)]);
        target.put_long(addr(0x5010), 0x7777);
        let i = insn(
            InstructionKind::IndirectCall,
            BranchTarget::Indirect { base: Some(1), displacement: 0x10 },
            None,
        );
        assert_eq!(i.effective_address(&mut target).unwrap(), Some(addr(0x7777)));
    }

    #[test]
    fn effective_address_unreadable_slot_resolves_to_none() {
        let mut target = MockTarget::new(SPACE, 8);
        live_registers(&mut target, &[(1, 0x5000)]);
        let i = insn(
            InstructionKind::IndirectCall,
            BranchTarget::Indirect { base: Some(1), displacement: 0 },
            None,
        );
        assert_eq!(i.effective_address(&mut target).unwrap(), None);
    }

    #[test]
    fn interpret_push_moves_sp_and_records_the_write() {
        let mut target = MockTarget::new(SPACE, 8);
        live_registers(&mut target, &[(0, 0xabcd), (2, 0x8000), (3, 0x1000)]);
        let i = insn(InstructionKind::Interpretable, BranchTarget::None, Some(InsnEffect::PushReg(0)));
        let emulation = i.interpret(&mut target).unwrap().unwrap();
        assert_eq!(emulation.registers.sp(), Some(0x7ff8));
        assert_eq!(emulation.registers.pc(), Some(0x1001));
        assert_eq!(
            emulation.writes,
            vec![MemoryWrite { address: addr(0x7ff8), value: 0xabcd, size: 8 }]
        );
    }

    #[test]
    fn interpret_refuses_conditional_and_unknown_kinds() {
        let mut target = MockTarget::new(SPACE, 8);
        live_registers(&mut target, &[(2, 0x8000), (3, 0x1000)]);
        let jump =
            insn(InstructionKind::ConditionalJump, BranchTarget::Direct(addr(0x2000)), None);
        assert!(jump.interpret(&mut target).unwrap().is_none());
        let unknown = insn(InstructionKind::Unknown, BranchTarget::None, None);
        assert!(unknown.interpret(&mut target).unwrap().is_none());
    }

    #[test]
    fn interpret_pop_reads_target_memory_without_writing() {
        let mut target = MockTarget::new(SPACE, 8);
        live_registers(&mut target, &[(2, 0x8000), (3, 0x1000)]);
        target.put_long(addr(0x8000), 0x5555);
        let i = insn(InstructionKind::Interpretable, BranchTarget::None, Some(InsnEffect::PopReg(1)));
        let emulation = i.interpret(&mut target).unwrap().unwrap();
        assert_eq!(emulation.registers.value(1), Some(0x5555));
        assert_eq!(emulation.registers.sp(), Some(0x8008));
        assert!(emulation.writes.is_empty());
    }

    #[test]
    fn interpret_ret_pops_the_return_address() {
        let mut target = MockTarget::new(SPACE, 8);
        live_registers(&mut target, &[(2, 0x7000), (3, 0x1000)]);
        target.put_long(addr(0x7000), 0x4242);
        let ret = insn(InstructionKind::Ret, BranchTarget::None, None);
        let emulation = ret.interpret(&mut target).unwrap().unwrap();
        assert_eq!(emulation.registers.pc(), Some(0x4242));
        assert_eq!(emulation.registers.sp(), Some(0x7008));
        assert!(emulation.writes.is_empty());
    }

    #[test]
    fn interpret_ret_with_immediate_releases_the_arguments() {
        let mut target = MockTarget::new(SPACE, 8);
        live_registers(&mut target, &[(2, 0x7000), (3, 0x1000)]);
        target.put_long(addr(0x7000), 0x4242);
        // ret $16: the popped slot plus sixteen bytes of arguments.
        let ret = insn(
            InstructionKind::Ret,
            BranchTarget::None,
            Some(InsnEffect::AdjustSp { delta: 24 }),
        );
        let emulation = ret.interpret(&mut target).unwrap().unwrap();
        assert_eq!(emulation.registers.pc(), Some(0x4242));
        assert_eq!(emulation.registers.sp(), Some(0x7018));
    }

    #[test]
    fn interpret_call_pushes_the_return_address() {
        let mut target = MockTarget::new(SPACE, 8);
        live_registers(&mut target, &[(2, 0x7000), (3, 0x1000)]);
        let call = insn(InstructionKind::Call, BranchTarget::Direct(addr(0x2000)), None);
        let emulation = call.interpret(&mut target).unwrap().unwrap();
        assert_eq!(emulation.registers.pc(), Some(0x2000));
        assert_eq!(emulation.registers.sp(), Some(0x6ff8));
        assert_eq!(
            emulation.writes,
            vec![MemoryWrite { address: addr(0x6ff8), value: 0x1001, size: 8 }]
        );
    }

    #[test]
    fn interpret_jump_lands_on_the_destination() {
        let mut target = MockTarget::new(SPACE, 8);
        live_registers(&mut target, &[(0, 0x3000), (2, 0x7000), (3, 0x1000)]);
        let jump = insn(InstructionKind::Jump, BranchTarget::Direct(addr(0x2000)), None);
        let emulation = jump.interpret(&mut target).unwrap().unwrap();
        assert_eq!(emulation.registers.pc(), Some(0x2000));
        assert_eq!(emulation.registers.sp(), Some(0x7000));
        assert!(emulation.writes.is_empty());

        let indirect = insn(InstructionKind::IndirectJump, BranchTarget::Register(0), None);
        let emulation = indirect.interpret(&mut target).unwrap().unwrap();
        assert_eq!(emulation.registers.pc(), Some(0x3000));
    }

    #[test]
    fn interpret_unresolved_destination_is_refused() {
        let mut target = MockTarget::new(SPACE, 8);
        live_registers(&mut target, &[(0, 0x5000), (2, 0x7000), (3, 0x1000)]);
        // Nothing is mapped at the jump table slot.
        let jump = insn(
            InstructionKind::IndirectJump,
            BranchTarget::Indirect { base: Some(0), displacement: 0 },
            None,
        );
        assert!(jump.interpret(&mut target).unwrap().is_none());
    }

    #[test]
    fn check_trampoline_resolves_a_lazy_stub_to_its_method() {
        let arch = Architecture::x86_64();
        let resolver = NoSymbols;
        let entry = addr(0x7f00_4000);
        let runtime = KnownTrampoline(entry);
        let services = UnwindServices::new(&resolver).with_runtime(&runtime);
        let mut target = MockTarget::new(SPACE, 8);

        let stub = addr(0x90_0000);
        target.put_bytes(stub, &[0x49, 0xba]);
        target.put_long(stub + 2, 0x7f12_3400);
        target.put_bytes(stub + 10, &[0x49, 0xbb]);
        target.put_long(stub + 12, entry.value());
        target.put_bytes(stub + 20, &[0x41, 0xff, 0xe3]);

        let call = insn(InstructionKind::Call, BranchTarget::Direct(stub), None);
        assert_eq!(
            call.check_trampoline(&arch, &services, &mut target).unwrap(),
            (TrampolineType::ManagedTrampoline, Some(addr(0x7f12_3400)))
        );
    }

    #[test]
    fn check_trampoline_classifies_a_direct_trampoline_call() {
        let arch = Architecture::x86_64();
        let resolver = NoSymbols;
        let entry = addr(0x7f00_4000);
        let runtime = KnownTrampoline(entry);
        let services = UnwindServices::new(&resolver).with_runtime(&runtime);
        let mut target = MockTarget::new(SPACE, 8);

        let call = insn(InstructionKind::Call, BranchTarget::Direct(entry), None);
        assert_eq!(
            call.check_trampoline(&arch, &services, &mut target).unwrap(),
            (TrampolineType::ManagedTrampoline, Some(entry))
        );

        // An ordinary call still names its destination.
        let plain = insn(InstructionKind::Call, BranchTarget::Direct(addr(0x40_0000)), None);
        assert_eq!(
            plain.check_trampoline(&arch, &services, &mut target).unwrap(),
            (TrampolineType::None, Some(addr(0x40_0000)))
        );
    }
}
