use std::collections::BTreeMap;

use crate::address::{AddressSpace, TargetAddress};
use crate::error::TargetAccessError;
use crate::registers::Registers;
use crate::target::TargetMemoryAccess;

/// In-memory stand-in for a suspended thread, byte-addressed so tests can
/// lay out stacks and code at arbitrary sparse addresses.
pub struct MockTarget {
    space: AddressSpace,
    address_size: usize,
    mem: BTreeMap<u64, u8>,
    live_registers: Option<Registers>,
    set_registers_calls: usize,
}

impl MockTarget {
    pub fn new(space: AddressSpace, address_size: usize) -> Self {
        Self {
            space,
            address_size,
            mem: BTreeMap::new(),
            live_registers: None,
            set_registers_calls: 0,
        }
    }

    pub fn put_bytes(&mut self, address: TargetAddress, bytes: &[u8]) {
        assert_eq!(address.space(), self.space);
        for (i, b) in bytes.iter().enumerate() {
            self.mem.insert(address.value() + i as u64, *b);
        }
    }

    pub fn put_word(&mut self, address: TargetAddress, value: u32) {
        self.put_bytes(address, &value.to_le_bytes());
    }

    pub fn put_long(&mut self, address: TargetAddress, value: u64) {
        self.put_bytes(address, &value.to_le_bytes());
    }

    /// Stores one pointer-sized value.
    pub fn put_ptr(&mut self, address: TargetAddress, value: u64) {
        match self.address_size {
            4 => self.put_word(address, value as u32),
            _ => self.put_long(address, value),
        }
    }

    pub fn set_live_registers(&mut self, registers: Registers) {
        self.live_registers = Some(registers);
    }

    pub fn set_registers_calls(&self) -> usize {
        self.set_registers_calls
    }
}

impl TargetMemoryAccess for MockTarget {
    fn address_space(&self) -> AddressSpace {
        self.space
    }

    fn address_size(&self) -> usize {
        self.address_size
    }

    fn read_buffer(
        &mut self,
        address: TargetAddress,
        len: usize,
    ) -> Result<Vec<u8>, TargetAccessError> {
        if address.space() != self.space {
            return Err(TargetAccessError::MemoryRead(address, len));
        }
        let mut bytes = Vec::with_capacity(len);
        for i in 0..len {
            match self.mem.get(&(address.value() + i as u64)) {
                Some(b) => bytes.push(*b),
                None => return Err(TargetAccessError::MemoryRead(address, len)),
            }
        }
        Ok(bytes)
    }

    fn write_buffer(
        &mut self,
        address: TargetAddress,
        bytes: &[u8],
    ) -> Result<(), TargetAccessError> {
        if address.space() != self.space {
            return Err(TargetAccessError::MemoryWrite(address, bytes.len()));
        }
        self.put_bytes(address, bytes);
        Ok(())
    }

    fn get_registers(&mut self) -> Result<Registers, TargetAccessError> {
        self.live_registers.clone().ok_or(TargetAccessError::Registers)
    }

    fn set_registers(&mut self, registers: &Registers) -> Result<(), TargetAccessError> {
        self.set_registers_calls += 1;
        self.live_registers = Some(registers.clone());
        Ok(())
    }
}
