use std::fmt::{self, Debug};

use crate::address::TargetAddress;
use crate::display_utils::HexNum;
use crate::error::TargetAccessError;
use crate::target::TargetMemoryAccess;

/// Static description of an architecture's register file.
///
/// Canonical register numbering follows the kernel's ptrace layout for the
/// architecture. A slot whose size is `None` does not exist on this
/// particular target (the numbering is shared within a CPU family, so the
/// 32-bit variant leaves the 64-bit-only slots absent).
pub struct RegisterLayout {
    pub register_names: &'static [&'static str],
    pub register_sizes: &'static [Option<u8>],
    /// The subset worth showing in a register dump, in display order.
    pub important_registers: &'static [usize],
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
    /// Register that carries the return address on function entry. `None`
    /// means the call instruction pushes the return address instead.
    pub link_register: Option<usize>,
    /// Pointer size in bytes.
    pub address_size: usize,
}

impl RegisterLayout {
    #[inline]
    pub fn count(&self) -> usize {
        self.register_names.len()
    }

    #[inline]
    pub fn is_present(&self, index: usize) -> bool {
        matches!(self.register_sizes.get(index), Some(Some(_)))
    }

    /// All slots that exist on this target.
    pub fn all_registers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count()).filter(|&i| self.is_present(i))
    }
}

/// One register slot in a [`Registers`] snapshot.
#[derive(Clone, Copy)]
pub struct Register {
    valid: bool,
    value: u64,
    address_on_stack: Option<TargetAddress>,
}

impl Register {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Where this register's value was found on the stack, for registers
    /// recovered by unwinding. Writing such a register means writing to
    /// this stack slot.
    #[inline]
    pub fn address_on_stack(&self) -> Option<TargetAddress> {
        self.address_on_stack
    }
}

/// A register snapshot for one frame.
///
/// The snapshot for the topmost frame comes straight from the thread
/// (`from_current_frame` is true); snapshots for older frames are
/// reconstructed by the unwinder, and individual slots may be invalid when
/// the unwind could not recover them.
#[derive(Clone)]
pub struct Registers {
    layout: &'static RegisterLayout,
    regs: Vec<Register>,
    from_current_frame: bool,
}

impl Registers {
    pub fn new(layout: &'static RegisterLayout, from_current_frame: bool) -> Self {
        let regs = vec![
            Register { valid: false, value: 0, address_on_stack: None };
            layout.count()
        ];
        Self { layout, regs, from_current_frame }
    }

    #[inline]
    pub fn layout(&self) -> &'static RegisterLayout {
        self.layout
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.regs.len()
    }

    #[inline]
    pub fn from_current_frame(&self) -> bool {
        self.from_current_frame
    }

    pub fn get(&self, index: usize) -> Option<&Register> {
        if !self.layout.is_present(index) {
            return None;
        }
        self.regs.get(index)
    }

    /// The register's value, or `None` when the slot is absent or was not
    /// recovered.
    pub fn value(&self, index: usize) -> Option<u64> {
        let reg = self.get(index)?;
        reg.valid.then_some(reg.value)
    }

    pub fn set_value(&mut self, index: usize, value: u64) {
        if !self.layout.is_present(index) {
            return;
        }
        if let Some(reg) = self.regs.get_mut(index) {
            reg.value = value;
            reg.valid = true;
        }
    }

    /// Records a value recovered from the given stack slot.
    pub fn set_value_on_stack(&mut self, index: usize, value: u64, address: TargetAddress) {
        if !self.layout.is_present(index) {
            return;
        }
        if let Some(reg) = self.regs.get_mut(index) {
            reg.value = value;
            reg.valid = true;
            reg.address_on_stack = Some(address);
        }
    }

    pub fn invalidate(&mut self, index: usize) {
        if let Some(reg) = self.regs.get_mut(index) {
            reg.valid = false;
            reg.address_on_stack = None;
        }
    }

    #[inline]
    pub fn pc(&self) -> Option<u64> {
        self.value(self.layout.pc)
    }

    #[inline]
    pub fn sp(&self) -> Option<u64> {
        self.value(self.layout.sp)
    }

    #[inline]
    pub fn fp(&self) -> Option<u64> {
        self.value(self.layout.fp)
    }

    /// Changes a register of the frame this snapshot belongs to, pushing the
    /// change into the inferior.
    ///
    /// For the topmost frame the whole register file is written back through
    /// [`TargetMemoryAccess::set_registers`]. For an older frame the value
    /// only exists in the stack slot the unwinder recovered it from, so that
    /// slot is patched in target memory; a register with no known stack slot
    /// cannot be written.
    pub fn write_value(
        &mut self,
        target: &mut dyn TargetMemoryAccess,
        index: usize,
        value: u64,
    ) -> Result<(), TargetAccessError> {
        let size = self
            .layout
            .register_sizes
            .get(index)
            .copied()
            .flatten()
            .ok_or(TargetAccessError::Registers)?;
        let reg = self.regs.get_mut(index).ok_or(TargetAccessError::Registers)?;
        if let Some(address) = reg.address_on_stack {
            match size {
                4 => target.write_integer(address, value as u32)?,
                _ => target.write_long_integer(address, value)?,
            }
            reg.value = value;
            reg.valid = true;
            Ok(())
        } else if self.from_current_frame {
            reg.value = value;
            reg.valid = true;
            target.set_registers(self)
        } else {
            Err(TargetAccessError::Registers)
        }
    }
}

impl Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for &i in self.layout.important_registers {
            if let Some(value) = self.value(i) {
                map.entry(&self.layout.register_names[i], &HexNum(value));
            }
        }
        map.finish()
    }
}
