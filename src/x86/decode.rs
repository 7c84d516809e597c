//! Byte decoder for the x86 family.
//!
//! This is not a disassembler. It classifies each instruction and extracts
//! exactly what unwinding, stepping and trampoline chasing need: branch
//! kind and destination, and the register-level effect of the instructions
//! the stepper may interpret. Instructions whose register effects are not
//! fully modeled either carry a known length and a conservative
//! [`InsnEffect::Clobber`], or no length at all, which makes prologue scans
//! stop rather than continue on wrong assumptions.

use arrayvec::ArrayVec;

use crate::address::TargetAddress;
use crate::instruction::{
    BranchTarget, InsnEffect, Instruction, InstructionKind, MAX_INSTRUCTION_LEN,
};
use crate::registers::RegisterLayout;

use super::{X86Mode, ENCODING_TO_CANONICAL_32, ENCODING_TO_CANONICAL_64};

type Decoded = (InstructionKind, BranchTarget, Option<InsnEffect>);

fn interpretable(effect: InsnEffect) -> Option<Decoded> {
    Some((InstructionKind::Interpretable, BranchTarget::None, Some(effect)))
}

/// Known length, but the stepper must not interpret it. The effect, if any,
/// is only for register tracking.
fn opaque(effect: Option<InsnEffect>) -> Option<Decoded> {
    Some((InstructionKind::Unknown, BranchTarget::None, effect))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn next(&mut self) -> Option<u8> {
        let b = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn i8(&mut self) -> Option<i8> {
        self.next().map(|b| b as i8)
    }

    fn u16(&mut self) -> Option<u16> {
        let lo = self.next()?;
        let hi = self.next()?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    fn i16(&mut self) -> Option<i16> {
        self.u16().map(|v| v as i16)
    }

    fn u32(&mut self) -> Option<u32> {
        let mut raw = [0; 4];
        for slot in &mut raw {
            *slot = self.next()?;
        }
        Some(u32::from_le_bytes(raw))
    }

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    fn u64(&mut self) -> Option<u64> {
        let mut raw = [0; 8];
        for slot in &mut raw {
            *slot = self.next()?;
        }
        Some(u64::from_le_bytes(raw))
    }
}

/// The r/m operand of a modrm byte.
enum RmOperand {
    /// Canonical register index.
    Reg(usize),
    Mem {
        /// Canonical base register; `None` for an absolute slot.
        base: Option<usize>,
        disp: i64,
        /// A scaled index register is involved, so the address cannot be
        /// reduced to base + displacement.
        indexed: bool,
        ip_relative: bool,
    },
}

struct ModRm {
    /// Raw reg field, the /digit of group opcodes.
    digit: u8,
    /// reg field as canonical register (REX.R applied).
    reg: usize,
    /// reg field as hardware number (REX.R applied), for byte-width forms.
    reg_raw: u8,
    /// r/m field as hardware number (REX.B applied); only meaningful for
    /// the register form.
    rm_raw: u8,
    rm: RmOperand,
}

struct Decoder<'a> {
    mode: X86Mode,
    layout: &'static RegisterLayout,
    cur: Cursor<'a>,
    rex: u8,
    operand_size_override: bool,
    segment_override: bool,
    /// Set once any consumed encoding reads the instruction pointer.
    ip_relative: bool,
}

impl Decoder<'_> {
    fn rex_w(&self) -> bool {
        self.rex & 0x08 != 0
    }

    fn rex_r(&self) -> u8 {
        (self.rex >> 2) & 1
    }

    fn rex_x(&self) -> bool {
        self.rex & 0x02 != 0
    }

    fn rex_b(&self) -> u8 {
        self.rex & 1
    }

    fn sp(&self) -> usize {
        self.layout.sp
    }

    fn asize(&self) -> i32 {
        self.layout.address_size as i32
    }

    /// Hardware register number to canonical index.
    fn gp(&self, raw: u8) -> Option<usize> {
        let table: &[usize] = match self.mode {
            X86Mode::Long => &ENCODING_TO_CANONICAL_64,
            X86Mode::Protected => &ENCODING_TO_CANONICAL_32,
        };
        table.get(usize::from(raw)).copied()
    }

    /// Byte-width register number to the canonical index of the full
    /// register it aliases. Without REX, numbers 4..8 are the high bytes of
    /// the first four registers.
    fn gp8(&self, raw: u8) -> Option<usize> {
        if self.rex == 0 && (4..8).contains(&raw) {
            self.gp(raw - 4)
        } else {
            self.gp(raw)
        }
    }

    fn prefixes(&mut self) {
        loop {
            match self.cur.bytes.get(self.cur.pos) {
                Some(0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65) => {
                    self.segment_override = true;
                    self.cur.pos += 1;
                }
                Some(0x66) => {
                    self.operand_size_override = true;
                    self.cur.pos += 1;
                }
                Some(0x67 | 0xf0 | 0xf2 | 0xf3) => self.cur.pos += 1,
                _ => break,
            }
        }
        if self.mode == X86Mode::Long {
            if let Some(b @ 0x40..=0x4f) = self.cur.bytes.get(self.cur.pos) {
                self.rex = *b;
                self.cur.pos += 1;
            }
        }
    }

    fn modrm(&mut self) -> Option<ModRm> {
        let modrm = self.cur.next()?;
        let mod_ = modrm >> 6;
        let digit = (modrm >> 3) & 7;
        let reg_raw = digit + 8 * self.rex_r();
        let rm_field = modrm & 7;
        let reg = self.gp(reg_raw)?;

        if mod_ == 3 {
            let rm_raw = rm_field + 8 * self.rex_b();
            let rm = RmOperand::Reg(self.gp(rm_raw)?);
            return Some(ModRm { digit, reg, reg_raw, rm_raw, rm });
        }

        let mut base = None;
        let mut indexed = false;
        let mut ip_relative = false;
        let mut disp32 = mod_ == 2;
        if rm_field == 4 {
            let sib = self.cur.next()?;
            indexed = (sib >> 3) & 7 != 4 || self.rex_x();
            if sib & 7 == 5 && mod_ == 0 {
                disp32 = true;
            } else {
                base = Some(self.gp((sib & 7) + 8 * self.rex_b())?);
            }
        } else if rm_field == 5 && mod_ == 0 {
            ip_relative = self.mode == X86Mode::Long;
            self.ip_relative |= ip_relative;
            disp32 = true;
        } else {
            base = Some(self.gp(rm_field + 8 * self.rex_b())?);
        }

        let disp = if mod_ == 1 {
            i64::from(self.cur.i8()?)
        } else if disp32 {
            i64::from(self.cur.i32()?)
        } else {
            0
        };
        Some(ModRm {
            digit,
            reg,
            reg_raw,
            rm_raw: 0,
            rm: RmOperand::Mem { base, disp, indexed, ip_relative },
        })
    }

    /// Destination of a relative branch. Call after all immediate bytes are
    /// consumed; the cursor position is the instruction length then.
    fn branch_destination(&self, address: TargetAddress, rel: i64) -> TargetAddress {
        let next = address + self.cur.pos as u64;
        let mut value = next.value().wrapping_add_signed(rel);
        if self.mode == X86Mode::Protected {
            value &= 0xffff_ffff;
        }
        TargetAddress::new(address.space(), value)
    }

    fn rel8_branch(&mut self, kind: InstructionKind, address: TargetAddress) -> Option<Decoded> {
        let rel = i64::from(self.cur.i8()?);
        self.ip_relative = true;
        Some((kind, BranchTarget::Direct(self.branch_destination(address, rel)), None))
    }

    fn rel32_branch(&mut self, kind: InstructionKind, address: TargetAddress) -> Option<Decoded> {
        let rel = if self.operand_size_override {
            i64::from(self.cur.i16()?)
        } else {
            i64::from(self.cur.i32()?)
        };
        self.ip_relative = true;
        Some((kind, BranchTarget::Direct(self.branch_destination(address, rel)), None))
    }

    /// Register write the decoder does not model any further. Writes to the
    /// stack pointer additionally break sp tracking.
    fn clobber(&self, reg: usize) -> Option<Decoded> {
        if reg == self.sp() {
            opaque(Some(InsnEffect::AdjustSpUnknown))
        } else {
            opaque(Some(InsnEffect::Clobber(reg)))
        }
    }

    /// add/or/adc/sbb/and/sub/xor/cmp with an immediate (0x81/0x83).
    fn group1(&mut self, opcode: u8) -> Option<Decoded> {
        let m = self.modrm()?;
        let imm: i64 = if opcode == 0x83 {
            i64::from(self.cur.i8()?)
        } else if self.operand_size_override {
            i64::from(self.cur.i16()?)
        } else {
            i64::from(self.cur.i32()?)
        };
        match m.rm {
            RmOperand::Reg(rm) if rm == self.sp() => match m.digit {
                // add
                0 => interpretable(InsnEffect::AdjustSp { delta: imm as i32 }),
                // sub
                5 => interpretable(InsnEffect::AdjustSp { delta: (imm as i32).wrapping_neg() }),
                // cmp leaves the register alone
                7 => opaque(None),
                // and (alignment masks) and the rest
                _ => opaque(Some(InsnEffect::AdjustSpUnknown)),
            },
            RmOperand::Reg(rm) if m.digit != 7 => self.clobber(rm),
            _ => opaque(None),
        }
    }

    /// The plain arithmetic block 0x00..=0x3d (add/or/.../cmp in register
    /// and accumulator forms).
    fn arith(&mut self, opcode: u8) -> Option<Decoded> {
        let digit = opcode >> 3;
        let form = opcode & 7;
        let wide = form == 1 || form == 3;
        let (written, len_ok) = match form {
            0 | 1 => {
                let m = self.modrm()?;
                match m.rm {
                    RmOperand::Reg(rm) if wide => (Some(rm), true),
                    RmOperand::Reg(_) => (self.gp8(m.rm_raw), true),
                    RmOperand::Mem { .. } => (None, true),
                }
            }
            2 | 3 => {
                let m = self.modrm()?;
                if wide {
                    (Some(m.reg), true)
                } else {
                    (self.gp8(m.reg_raw), true)
                }
            }
            4 => {
                self.cur.i8()?;
                (self.gp(0), true)
            }
            5 => {
                if self.operand_size_override {
                    self.cur.i16()?;
                } else {
                    self.cur.i32()?;
                }
                (self.gp(0), true)
            }
            _ => (None, false),
        };
        if !len_ok {
            return None;
        }
        match written {
            // cmp writes nothing
            _ if digit == 7 => opaque(None),
            Some(reg) => self.clobber(reg),
            None => opaque(None),
        }
    }

    fn mov_rm(&mut self, store: bool) -> Option<Decoded> {
        let m = self.modrm()?;
        match m.rm {
            RmOperand::Reg(rm) => {
                let (dst, src) = if store { (rm, m.reg) } else { (m.reg, rm) };
                interpretable(InsnEffect::MoveReg { dst, src })
            }
            RmOperand::Mem { base: Some(base), disp, indexed: false, ip_relative: false }
                if !self.segment_override =>
            {
                if store {
                    interpretable(InsnEffect::StoreReg { reg: m.reg, base, offset: disp as i32 })
                } else if m.reg == self.sp() {
                    opaque(Some(InsnEffect::AdjustSpUnknown))
                } else {
                    interpretable(InsnEffect::LoadReg { reg: m.reg, base, offset: disp as i32 })
                }
            }
            RmOperand::Mem { .. } => {
                if store {
                    opaque(None)
                } else {
                    self.clobber(m.reg)
                }
            }
        }
    }

    /// inc/dec/call/jmp/push group (0xff).
    fn group5(&mut self, address: TargetAddress) -> Option<Decoded> {
        let m = self.modrm()?;
        match m.digit {
            0 | 1 => match m.rm {
                RmOperand::Reg(rm) => self.clobber(rm),
                RmOperand::Mem { .. } => opaque(None),
            },
            2 | 4 => {
                let kind = if m.digit == 2 {
                    InstructionKind::IndirectCall
                } else {
                    InstructionKind::IndirectJump
                };
                let target = match m.rm {
                    RmOperand::Reg(rm) => BranchTarget::Register(rm),
                    RmOperand::Mem { indexed: true, .. } => BranchTarget::None,
                    _ if self.segment_override => BranchTarget::None,
                    RmOperand::Mem { base, disp, ip_relative, .. } => {
                        let displacement = if ip_relative {
                            let next = address + self.cur.pos as u64;
                            next.value().wrapping_add_signed(disp) as i64
                        } else {
                            disp
                        };
                        BranchTarget::Indirect { base, displacement }
                    }
                };
                Some((kind, target, None))
            }
            // Far forms only take memory operands.
            3 => matches!(m.rm, RmOperand::Mem { .. })
                .then_some((InstructionKind::IndirectCall, BranchTarget::None, None)),
            5 => matches!(m.rm, RmOperand::Mem { .. })
                .then_some((InstructionKind::IndirectJump, BranchTarget::None, None)),
            6 => match m.rm {
                RmOperand::Reg(rm) => interpretable(InsnEffect::PushReg(rm)),
                RmOperand::Mem { .. } => {
                    opaque(Some(InsnEffect::AdjustSp { delta: -self.asize() }))
                }
            },
            _ => None,
        }
    }

    fn two_byte(&mut self, address: TargetAddress) -> Option<Decoded> {
        let op = self.cur.next()?;
        match op {
            // Long nop.
            0x1f => {
                self.modrm()?;
                interpretable(InsnEffect::Nop)
            }
            // jcc rel32
            0x80..=0x8f => self.rel32_branch(InstructionKind::ConditionalJump, address),
            // SSE moves and logic that never touch general registers.
            0x10 | 0x11 | 0x28 | 0x29 | 0x54 | 0x57 | 0x6f | 0x7f | 0xd6 | 0xef => {
                self.modrm()?;
                opaque(None)
            }
            // movzx/movsx
            0xb6 | 0xb7 | 0xbe | 0xbf => {
                let m = self.modrm()?;
                self.clobber(m.reg)
            }
            // imul r, r/m
            0xaf => {
                let m = self.modrm()?;
                self.clobber(m.reg)
            }
            _ => None,
        }
    }

    fn run(&mut self, address: TargetAddress) -> Option<Decoded> {
        self.prefixes();
        let opcode = self.cur.next()?;
        match opcode {
            0x0f => self.two_byte(address),

            // Segment pushes/pops and the BCD leftovers only exist in
            // protected mode.
            0x06 | 0x0e | 0x16 | 0x1e if self.mode == X86Mode::Protected => {
                opaque(Some(InsnEffect::AdjustSp { delta: -4 }))
            }
            0x07 | 0x17 | 0x1f if self.mode == X86Mode::Protected => {
                opaque(Some(InsnEffect::AdjustSp { delta: 4 }))
            }
            0x27 | 0x2f | 0x37 | 0x3f if self.mode == X86Mode::Protected => {
                let eax = self.gp(0)?;
                opaque(Some(InsnEffect::Clobber(eax)))
            }
            0x06 | 0x07 | 0x0e | 0x16 | 0x17 | 0x1e | 0x27 | 0x2f | 0x37 | 0x3f => None,

            0x00..=0x3d if opcode & 7 <= 5 => self.arith(opcode),

            // inc/dec in protected mode; taken as REX before we get here in
            // long mode.
            0x40..=0x4f if self.mode == X86Mode::Protected => {
                let reg = self.gp(opcode & 7)?;
                self.clobber(reg)
            }

            0x50..=0x57 => {
                let reg = self.gp((opcode & 7) + 8 * self.rex_b())?;
                interpretable(InsnEffect::PushReg(reg))
            }
            0x58..=0x5f => {
                let reg = self.gp((opcode & 7) + 8 * self.rex_b())?;
                if reg == self.sp() {
                    // pop into the stack pointer itself
                    opaque(Some(InsnEffect::AdjustSpUnknown))
                } else {
                    interpretable(InsnEffect::PopReg(reg))
                }
            }

            // push imm: the store is not modeled, only the sp change.
            0x68 => {
                if self.operand_size_override {
                    self.cur.i16()?;
                } else {
                    self.cur.i32()?;
                }
                opaque(Some(InsnEffect::AdjustSp { delta: -self.asize() }))
            }
            0x6a => {
                self.cur.i8()?;
                opaque(Some(InsnEffect::AdjustSp { delta: -self.asize() }))
            }

            0x70..=0x7f => self.rel8_branch(InstructionKind::ConditionalJump, address),

            0x81 | 0x83 => self.group1(opcode),

            // test writes no register
            0x84 | 0x85 => {
                self.modrm()?;
                opaque(None)
            }

            0x88 => {
                self.modrm()?;
                opaque(None)
            }
            0x89 => self.mov_rm(true),
            0x8a => {
                let m = self.modrm()?;
                let reg = self.gp8(m.reg_raw)?;
                self.clobber(reg)
            }
            0x8b => self.mov_rm(false),
            0x8d => {
                let m = self.modrm()?;
                match m.rm {
                    RmOperand::Mem { .. } => self.clobber(m.reg),
                    RmOperand::Reg(_) => None,
                }
            }
            0x8f => {
                let m = self.modrm()?;
                match (m.digit, m.rm) {
                    (0, RmOperand::Reg(rm)) if rm == self.sp() => {
                        opaque(Some(InsnEffect::AdjustSpUnknown))
                    }
                    (0, RmOperand::Reg(rm)) => interpretable(InsnEffect::PopReg(rm)),
                    (0, RmOperand::Mem { .. }) => {
                        opaque(Some(InsnEffect::AdjustSp { delta: self.asize() }))
                    }
                    _ => None,
                }
            }

            0x90 => interpretable(InsnEffect::Nop),

            // cwtl/cltq and cltd/cqto clobber the accumulator pair.
            0x98 => {
                let eax = self.gp(0)?;
                opaque(Some(InsnEffect::Clobber(eax)))
            }
            0x99 => {
                let edx = self.gp(2)?;
                opaque(Some(InsnEffect::Clobber(edx)))
            }

            // Far call with an immediate pointer.
            0x9a if self.mode == X86Mode::Protected => {
                if self.operand_size_override {
                    self.cur.u16()?;
                } else {
                    self.cur.u32()?;
                }
                self.cur.u16()?;
                Some((InstructionKind::Call, BranchTarget::None, None))
            }

            0xa8 => {
                self.cur.i8()?;
                opaque(None)
            }
            0xa9 => {
                if self.operand_size_override {
                    self.cur.i16()?;
                } else {
                    self.cur.i32()?;
                }
                opaque(None)
            }

            0xb8..=0xbf => {
                let dst = self.gp((opcode & 7) + 8 * self.rex_b())?;
                let imm = if self.rex_w() {
                    self.cur.u64()?
                } else if self.operand_size_override {
                    u64::from(self.cur.u16()?)
                } else {
                    u64::from(self.cur.u32()?)
                };
                if dst == self.sp() {
                    opaque(Some(InsnEffect::AdjustSpUnknown))
                } else {
                    interpretable(InsnEffect::MoveImm { dst, imm })
                }
            }

            0xc2 => {
                // The immediate releases argument space on top of the popped
                // return address.
                let imm = self.cur.u16()?;
                let effect = InsnEffect::AdjustSp { delta: self.asize() + i32::from(imm) };
                Some((InstructionKind::Ret, BranchTarget::None, Some(effect)))
            }
            0xc3 => Some((InstructionKind::Ret, BranchTarget::None, None)),
            // Far returns pop a code segment too; their stack effect is not
            // modeled.
            0xca => {
                self.cur.u16()?;
                Some((InstructionKind::Ret, BranchTarget::None, Some(InsnEffect::AdjustSpUnknown)))
            }
            0xcb => {
                Some((InstructionKind::Ret, BranchTarget::None, Some(InsnEffect::AdjustSpUnknown)))
            }

            0xc6 => {
                let m = self.modrm()?;
                self.cur.i8()?;
                match (m.digit, m.rm) {
                    (0, RmOperand::Reg(_)) => self.clobber(self.gp8(m.rm_raw)?),
                    (0, RmOperand::Mem { .. }) => opaque(None),
                    _ => None,
                }
            }
            0xc7 => {
                let m = self.modrm()?;
                let imm = if self.rex_w() {
                    self.cur.i32()? as i64 as u64
                } else if self.operand_size_override {
                    u64::from(self.cur.u16()?)
                } else {
                    u64::from(self.cur.u32()?)
                };
                match (m.digit, m.rm) {
                    (0, RmOperand::Reg(rm)) if rm == self.sp() => {
                        opaque(Some(InsnEffect::AdjustSpUnknown))
                    }
                    (0, RmOperand::Reg(rm)) => interpretable(InsnEffect::MoveImm { dst: rm, imm }),
                    (0, RmOperand::Mem { .. }) => opaque(None),
                    _ => None,
                }
            }

            // int3 and friends; the debugger sees its own breakpoints as
            // plain bytes here.
            0xcc => opaque(None),
            0xcd => {
                self.cur.i8()?;
                let eax = self.gp(0)?;
                opaque(Some(InsnEffect::Clobber(eax)))
            }

            0xe0..=0xe3 => self.rel8_branch(InstructionKind::ConditionalJump, address),

            0xe8 => self.rel32_branch(InstructionKind::Call, address),
            0xe9 => self.rel32_branch(InstructionKind::Jump, address),
            0xea if self.mode == X86Mode::Protected => {
                if self.operand_size_override {
                    self.cur.u16()?;
                } else {
                    self.cur.u32()?;
                }
                self.cur.u16()?;
                Some((InstructionKind::Jump, BranchTarget::None, None))
            }
            0xeb => self.rel8_branch(InstructionKind::Jump, address),

            0xf4 => opaque(None),

            0xff => self.group5(address),

            _ => None,
        }
    }
}

pub(super) fn decode(
    mode: X86Mode,
    layout: &'static RegisterLayout,
    bytes: &[u8],
    address: TargetAddress,
) -> Instruction {
    let mut decoder = Decoder {
        mode,
        layout,
        cur: Cursor { bytes, pos: 0 },
        rex: 0,
        operand_size_override: false,
        segment_override: false,
        ip_relative: false,
    };
    let decoded = decoder.run(address);
    let len = decoder.cur.pos;
    let mut out = ArrayVec::new();
    match decoded {
        Some((kind, target, effect)) if len <= MAX_INSTRUCTION_LEN => {
            out.extend(bytes[..len].iter().copied());
            Instruction {
                layout,
                address,
                kind,
                ip_relative: decoder.ip_relative,
                len: Some(len as u8),
                bytes: out,
                target,
                effect,
            }
        }
        _ => {
            out.extend(bytes.iter().take(MAX_INSTRUCTION_LEN).copied());
            Instruction {
                layout,
                address,
                kind: InstructionKind::Unknown,
                ip_relative: false,
                len: None,
                bytes: out,
                target: BranchTarget::None,
                effect: None,
            }
        }
    }
}
