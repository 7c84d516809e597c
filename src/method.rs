use crate::address::TargetAddress;
use crate::arch::Architecture;
use crate::error::TargetAccessError;
use crate::frame::{FrameKind, StackFrame};
use crate::host::UnwindServices;
use crate::target::TargetMemoryAccess;

/// A name from the plain symbol table, for code no [`Method`] covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: TargetAddress,
}

impl Symbol {
    pub fn new(name: impl Into<String>, address: TargetAddress) -> Self {
        Self { name: name.into(), address }
    }
}

/// Wrapper classification for runtime-generated methods. Anything other
/// than `None` is glue the runtime emitted rather than user code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrapperType {
    None,
    DelegateInvoke,
    RuntimeInvoke,
    NativeToManaged,
    ManagedToNative,
    Synchronized,
    DynamicMethod,
    Alloc,
    Unknown,
}

/// Address-to-source mapping for one method. Rows are kept sorted by
/// address.
pub struct LineTable {
    file: String,
    rows: Vec<(TargetAddress, u32)>,
}

impl LineTable {
    pub fn new(file: impl Into<String>, mut rows: Vec<(TargetAddress, u32)>) -> Self {
        rows.sort_by_key(|(address, _)| address.value());
        Self { file: file.into(), rows }
    }

    /// The row covering `address`: the last row at or below it.
    pub fn lookup(&self, address: TargetAddress) -> Option<(&str, u32)> {
        let pos = self
            .rows
            .partition_point(|(row_address, _)| *row_address <= address);
        let (_, line) = self.rows.get(pos.checked_sub(1)?)?;
        Some((&self.file, *line))
    }
}

/// A function the symbol layer knows in detail: JIT output or a native
/// function with debug info.
///
/// Methods are immutable once loaded, with one exception: the prologue and
/// epilogue bounds can arrive later than the method itself (the JIT reports
/// them at the end of compilation).
pub struct Method {
    name: String,
    start: TargetAddress,
    end: TargetAddress,
    /// First address past the prologue, when known.
    body_start: Option<TargetAddress>,
    /// First address of the epilogue, when known.
    body_end: Option<TargetAddress>,
    is_loaded: bool,
    is_managed: bool,
    wrapper_type: WrapperType,
    line_table: Option<LineTable>,
}

impl Method {
    pub fn new(name: impl Into<String>, start: TargetAddress, end: TargetAddress) -> Self {
        Self {
            name: name.into(),
            start,
            end,
            body_start: None,
            body_end: None,
            is_loaded: true,
            is_managed: false,
            wrapper_type: WrapperType::None,
            line_table: None,
        }
    }

    /// A method the runtime has announced but not finished compiling.
    /// Unwinding through it falls back to the frame pointer chain.
    pub fn unloaded(name: impl Into<String>, start: TargetAddress, end: TargetAddress) -> Self {
        Self { is_loaded: false, ..Self::new(name, start, end) }
    }

    pub fn managed(mut self) -> Self {
        self.is_managed = true;
        self
    }

    pub fn with_wrapper(mut self, wrapper_type: WrapperType) -> Self {
        self.wrapper_type = wrapper_type;
        self
    }

    pub fn with_line_table(mut self, line_table: LineTable) -> Self {
        self.line_table = Some(line_table);
        self
    }

    /// Records where the prologue ends and the epilogue begins.
    pub fn set_method_bounds(&mut self, body_start: TargetAddress, body_end: TargetAddress) {
        self.body_start = Some(body_start);
        self.body_end = Some(body_end);
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn start_address(&self) -> TargetAddress {
        self.start
    }

    #[inline]
    pub fn end_address(&self) -> TargetAddress {
        self.end
    }

    #[inline]
    pub fn body_start_address(&self) -> Option<TargetAddress> {
        self.body_start
    }

    #[inline]
    pub fn body_end_address(&self) -> Option<TargetAddress> {
        self.body_end
    }

    #[inline]
    pub fn has_method_bounds(&self) -> bool {
        self.body_start.is_some()
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.is_loaded
    }

    #[inline]
    pub fn is_managed(&self) -> bool {
        self.is_managed
    }

    #[inline]
    pub fn wrapper_type(&self) -> WrapperType {
        self.wrapper_type
    }

    #[inline]
    pub fn is_wrapper(&self) -> bool {
        self.wrapper_type != WrapperType::None
    }

    #[inline]
    pub fn has_source(&self) -> bool {
        self.line_table.is_some()
    }

    pub fn lookup_line(&self, address: TargetAddress) -> Option<(&str, u32)> {
        self.line_table.as_ref()?.lookup(address)
    }

    /// Unwinds one frame of this method: the owning module's unwind tables
    /// first, then prologue analysis, then the architecture's frame pointer
    /// fallback.
    pub fn unwind_stack(
        &self,
        frame: &StackFrame,
        arch: &Architecture,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
    ) -> Result<Option<StackFrame>, TargetAccessError> {
        if !self.is_loaded {
            return Ok(None);
        }
        if let Some(module) = services.module_unwind {
            if let Some(registers) = module.unwind_frame(frame, target)? {
                if let Some(new_frame) =
                    arch.create_frame(FrameKind::Normal, services, target.address_space(), registers)
                {
                    return Ok(Some(new_frame));
                }
            }
        }
        let (prologue, offset) = self.prologue_slice(frame.address(), target)?;
        arch.unwind_stack(frame, services, target, &prologue, offset)
    }

    /// The prologue bytes to scan for `pc`, plus the pc's byte distance
    /// from the method start (it may point past the prologue). Empty when
    /// the method bounds are not known yet or the pc is below the method.
    fn prologue_slice(
        &self,
        pc: TargetAddress,
        target: &mut dyn TargetMemoryAccess,
    ) -> Result<(Vec<u8>, usize), TargetAccessError> {
        let len = match self.body_start.and_then(|b| b.checked_offset_from(self.start)) {
            Some(len) if len > 0 => len as usize,
            _ => return Ok((Vec::new(), 0)),
        };
        let pc_offset = match pc.checked_offset_from(self.start) {
            Some(offset) if offset >= 0 => offset as usize,
            _ => return Ok((Vec::new(), 0)),
        };
        let bytes = target.read_buffer(self.start, len)?;
        Ok((bytes, pc_offset))
    }
}
