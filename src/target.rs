use crate::address::{AddressSpace, TargetAddress};
use crate::error::TargetAccessError;
use crate::registers::Registers;

/// Access to the memory and registers of one suspended thread.
///
/// The unwinder is transport-agnostic: the embedder implements this trait
/// on top of whatever reaches the inferior (ptrace, a remote stub, a core
/// file). Methods take `&mut self` since transports are usually stateful.
///
/// Multi-byte reads and writes are little-endian; all supported targets
/// run little-endian.
pub trait TargetMemoryAccess {
    /// The address space this accessor reads from. Addresses handed to the
    /// other methods must carry this space.
    fn address_space(&self) -> AddressSpace;

    /// Pointer size of the target in bytes (4 or 8).
    fn address_size(&self) -> usize;

    /// Reads exactly `len` bytes, or fails.
    fn read_buffer(&mut self, address: TargetAddress, len: usize)
        -> Result<Vec<u8>, TargetAccessError>;

    fn write_buffer(&mut self, address: TargetAddress, bytes: &[u8])
        -> Result<(), TargetAccessError>;

    /// Register file of the suspended thread, as last read from the kernel.
    fn get_registers(&mut self) -> Result<Registers, TargetAccessError>;

    /// Pushes modified register values back into the thread.
    fn set_registers(&mut self, registers: &Registers) -> Result<(), TargetAccessError>;

    fn read_integer(&mut self, address: TargetAddress) -> Result<u32, TargetAccessError> {
        self.read_buffer(address, 4)?
            .try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| TargetAccessError::MemoryRead(address, 4))
    }

    fn read_long_integer(&mut self, address: TargetAddress) -> Result<u64, TargetAccessError> {
        self.read_buffer(address, 8)?
            .try_into()
            .map(u64::from_le_bytes)
            .map_err(|_| TargetAccessError::MemoryRead(address, 8))
    }

    /// Reads one pointer-sized value and tags it with this accessor's
    /// address space.
    fn read_address(&mut self, address: TargetAddress) -> Result<TargetAddress, TargetAccessError> {
        let raw = match self.address_size() {
            4 => self.read_integer(address)? as u64,
            _ => self.read_long_integer(address)?,
        };
        Ok(TargetAddress::new(self.address_space(), raw))
    }

    fn write_integer(&mut self, address: TargetAddress, value: u32)
        -> Result<(), TargetAccessError>
    {
        self.write_buffer(address, &value.to_le_bytes())
    }

    fn write_long_integer(&mut self, address: TargetAddress, value: u64)
        -> Result<(), TargetAccessError>
    {
        self.write_buffer(address, &value.to_le_bytes())
    }

    /// Writes one pointer-sized value, truncating to the target's pointer
    /// width.
    fn write_address(&mut self, address: TargetAddress, value: u64)
        -> Result<(), TargetAccessError>
    {
        match self.address_size() {
            4 => self.write_integer(address, value as u32),
            _ => self.write_long_integer(address, value),
        }
    }
}
