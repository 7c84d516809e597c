//! Prologue analysis.
//!
//! [`UnwindContext`] decodes a function's prologue up to (at most) the
//! frame's pc and tracks, per register, where the caller's value ended up.
//! The result feeds register recovery during unwinding.

use fallible_iterator::FallibleIterator;

use crate::address::TargetAddress;
use crate::arch::Architecture;
use crate::error::PrologueScanError;
use crate::instruction::{InsnEffect, Instruction};

/// Where a register's value from function entry lives at the scanned pc.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterLocation {
    /// The prologue did something to this register we cannot model.
    Unknown,
    /// Still sitting in the register itself.
    Preserved,
    /// Copied into another register (canonical index).
    InRegister(usize),
    /// Spilled to `[base + offset]`. When `base` is the stack pointer the
    /// offset is relative to its value at function entry; when it is the
    /// frame pointer the offset is relative to the established frame.
    Memory { base: usize, offset: i64 },
}

/// Decodes instructions out of a byte buffer, stopping at the scan limit
/// and failing on the first instruction without a known length.
struct InstructionIter<'a> {
    arch: &'a Architecture,
    bytes: &'a [u8],
    address: TargetAddress,
    pos: usize,
    limit: usize,
}

impl FallibleIterator for InstructionIter<'_> {
    type Item = Instruction;
    type Error = PrologueScanError;

    fn next(&mut self) -> Result<Option<Instruction>, PrologueScanError> {
        if self.pos >= self.limit {
            return Ok(None);
        }
        let instruction = self.arch.decode_instruction(&self.bytes[self.pos..], self.address);
        let len = match instruction.byte_len() {
            Some(len) => len,
            None => return Err(PrologueScanError::Undecodable(self.address)),
        };
        if self.pos + len > self.limit {
            // Straddles the pc; it has not executed yet.
            self.pos = self.limit;
            return Ok(None);
        }
        self.pos += len;
        self.address = self.address + len as u64;
        Ok(Some(instruction))
    }
}

/// Per-register location state derived from scanning one prologue.
pub struct UnwindContext {
    start: TargetAddress,
    bytes: Vec<u8>,
    scan_limit: usize,
    locations: Vec<RegisterLocation>,
    /// Net stack pointer displacement from function entry to the scan
    /// limit. Negative means the stack has grown.
    sp_offset: i64,
    /// Only meaningful while `sp_known` holds.
    sp_known: bool,
    /// Displacement of the established frame pointer from the entry stack
    /// pointer, once the prologue sets one up.
    fp_offset: Option<i64>,
}

impl UnwindContext {
    /// `bytes` are the prologue bytes starting at `start`; `scan_limit` is
    /// how far into them the frame's pc sits (instructions at or past it
    /// have not executed).
    pub fn new(
        arch: &Architecture,
        start: TargetAddress,
        bytes: Vec<u8>,
        scan_limit: usize,
    ) -> Self {
        let scan_limit = scan_limit.min(bytes.len());
        Self {
            start,
            bytes,
            scan_limit,
            locations: vec![RegisterLocation::Preserved; arch.layout().count()],
            sp_offset: 0,
            sp_known: true,
            fp_offset: None,
        }
    }

    #[inline]
    pub fn start(&self) -> TargetAddress {
        self.start
    }

    pub fn location(&self, register: usize) -> RegisterLocation {
        self.locations
            .get(register)
            .copied()
            .unwrap_or(RegisterLocation::Unknown)
    }

    /// Net sp displacement entry -> pc, when the scan could track it.
    pub fn sp_offset(&self) -> Option<i64> {
        self.sp_known.then_some(self.sp_offset)
    }

    pub fn fp_offset(&self) -> Option<i64> {
        self.fp_offset
    }

    /// Runs the scan. Always recomputes from scratch, so scanning the same
    /// range twice yields the same result.
    pub fn scan(&mut self, arch: &Architecture) -> Result<(), PrologueScanError> {
        self.locations.fill(RegisterLocation::Preserved);
        self.sp_offset = 0;
        self.sp_known = true;
        self.fp_offset = None;

        let layout = arch.layout();
        let asize = layout.address_size as i64;
        let mut iter = InstructionIter {
            arch,
            bytes: &self.bytes,
            address: self.start,
            pos: 0,
            limit: self.scan_limit,
        };
        let mut effects = Vec::new();
        while let Some(instruction) = iter.next()? {
            if let Some(effect) = instruction.effect.clone() {
                effects.push(effect);
            }
        }
        for effect in effects {
            self.apply_effect(&effect, layout.sp, layout.fp, asize);
        }
        Ok(())
    }

    fn apply_effect(&mut self, effect: &InsnEffect, sp: usize, fp: usize, asize: i64) {
        match effect {
            InsnEffect::PushReg(reg) => {
                self.sp_offset -= asize;
                if self.sp_known {
                    let offset = self.sp_offset;
                    self.record_spill(*reg, RegisterLocation::Memory { base: sp, offset });
                }
            }
            InsnEffect::PushMany(regs) => {
                self.sp_offset -= asize * regs.len() as i64;
                let base_offset = self.sp_offset;
                if self.sp_known {
                    for (slot, reg) in regs.iter().enumerate() {
                        let offset = base_offset + slot as i64 * asize;
                        self.record_spill(
                            usize::from(*reg),
                            RegisterLocation::Memory { base: sp, offset },
                        );
                    }
                }
            }
            InsnEffect::StoreReg { reg, base, offset } => {
                if *base == sp && self.sp_known {
                    let offset = self.sp_offset + i64::from(*offset);
                    self.record_spill(*reg, RegisterLocation::Memory { base: sp, offset });
                } else if *base == fp {
                    // Normalize to entry-sp terms when the frame pointer's
                    // displacement is known.
                    let location = match self.fp_offset {
                        Some(fp_offset) => RegisterLocation::Memory {
                            base: sp,
                            offset: fp_offset + i64::from(*offset),
                        },
                        None => RegisterLocation::Memory { base: fp, offset: i64::from(*offset) },
                    };
                    self.record_spill(*reg, location);
                }
            }
            InsnEffect::PopReg(reg) => {
                self.sp_offset += asize;
                self.clobber(*reg);
            }
            InsnEffect::PopMany(regs) => {
                self.sp_offset += asize * regs.len() as i64;
                for reg in regs {
                    self.clobber(usize::from(*reg));
                }
            }
            InsnEffect::LoadReg { reg, .. } => self.clobber(*reg),
            InsnEffect::MoveReg { dst, src } => {
                if *dst == sp {
                    if *src == fp {
                        match self.fp_offset {
                            Some(fp_offset) => {
                                self.sp_offset = fp_offset;
                                self.sp_known = true;
                            }
                            None => self.sp_known = false,
                        }
                    } else {
                        self.sp_known = false;
                    }
                } else if *src == sp {
                    if *dst == fp && self.sp_known {
                        self.fp_offset = Some(self.sp_offset);
                    }
                    if self.sp_known && self.sp_offset == 0 {
                        self.record_overwrite(*dst, RegisterLocation::InRegister(sp));
                    } else {
                        self.clobber(*dst);
                    }
                } else if self.location(*src) == RegisterLocation::Preserved {
                    self.record_overwrite(*dst, RegisterLocation::InRegister(*src));
                } else {
                    self.clobber(*dst);
                }
            }
            InsnEffect::MoveImm { dst, .. } => self.clobber(*dst),
            InsnEffect::AdjustSp { delta } => self.sp_offset += i64::from(*delta),
            InsnEffect::AdjustSpUnknown => self.sp_known = false,
            InsnEffect::Clobber(reg) => self.clobber(*reg),
            InsnEffect::ClobberMany(regs) => {
                for reg in regs {
                    self.clobber(usize::from(*reg));
                }
            }
            InsnEffect::Nop => {}
        }
    }

    /// Records that the value sitting in a register was stored somewhere.
    /// A register in `InRegister` state carries another register's entry
    /// value, so the store spills that one. A location already in memory is
    /// final.
    fn record_spill(&mut self, register: usize, location: RegisterLocation) {
        let register = match self.location(register) {
            RegisterLocation::InRegister(source) => source,
            _ => register,
        };
        if let Some(slot) = self.locations.get_mut(register) {
            if *slot == RegisterLocation::Preserved {
                *slot = location;
            }
        }
    }

    /// Records that a register's content was replaced. An existing memory
    /// location survives; the spilled copy is not affected by overwriting
    /// the register.
    fn record_overwrite(&mut self, register: usize, location: RegisterLocation) {
        if let Some(slot) = self.locations.get_mut(register) {
            if !matches!(slot, RegisterLocation::Memory { .. }) {
                *slot = location;
            }
        }
    }

    fn clobber(&mut self, register: usize) {
        self.record_overwrite(register, RegisterLocation::Unknown);
    }
}
