//! Shared mock world for the integration tests: an in-memory inferior plus
//! canned symbol and runtime services.

use std::sync::Arc;

use backwalk::{
    AddressSpace, Architecture, CallbackFrameInfo, FrameKind, ManagedRuntime, Method, Registers,
    StackFrame, Symbol, SymbolResolver, TargetAccessError, TargetAddress, TargetMemoryAccess,
    UnwindServices,
};

pub use backwalk::test_support::MockTarget;

pub const SPACE: AddressSpace = AddressSpace(7);

pub fn addr(value: u64) -> TargetAddress {
    TargetAddress::new(SPACE, value)
}

/// Fake inferior memory in the integration tests' address space. Sparse,
/// so stacks and code can live at arbitrary addresses and everything
/// unmapped reads as an error.
pub fn sim_target(address_size: usize) -> MockTarget {
    MockTarget::new(SPACE, address_size)
}

/// Method and symbol tables fed to the unwinder.
#[derive(Default)]
pub struct SymbolTable {
    methods: Vec<Arc<Method>>,
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn add_method(&mut self, method: Method) -> Arc<Method> {
        let method = Arc::new(method);
        self.methods.push(Arc::clone(&method));
        method
    }

    pub fn add_symbol(&mut self, name: &str, address: TargetAddress) {
        self.symbols.push(Symbol::new(name, address));
    }
}

impl SymbolResolver for SymbolTable {
    fn lookup_method(&self, address: TargetAddress) -> Option<Arc<Method>> {
        self.methods
            .iter()
            .find(|m| m.start_address() <= address && address < m.end_address())
            .cloned()
    }

    fn simple_lookup(&self, address: TargetAddress, exact_match: bool) -> Option<Symbol> {
        if exact_match {
            return self.symbols.iter().find(|s| s.address == address).cloned();
        }
        self.symbols
            .iter()
            .filter(|s| s.address <= address)
            .max_by_key(|s| s.address.value())
            .cloned()
    }
}

/// A managed runtime with one optional pending debugger-callback record and
/// an optional last-managed-frame chain root.
#[derive(Default)]
pub struct FakeRuntime {
    pub lmf_root: Option<TargetAddress>,
    pub callback: Option<(Registers, bool)>,
}

impl ManagedRuntime for FakeRuntime {
    fn is_trampoline_address(&self, _address: TargetAddress) -> bool {
        false
    }

    fn is_delegate_invoke(&self, _address: TargetAddress) -> bool {
        false
    }

    fn callback_frame(
        &self,
        _target: &mut dyn TargetMemoryAccess,
        stack_pointer: TargetAddress,
        exact_match: bool,
    ) -> Result<Option<CallbackFrameInfo>, TargetAccessError> {
        let (registers, is_runtime_invoke) = match &self.callback {
            Some(record) => record,
            None => return Ok(None),
        };
        let record_sp = match registers.sp() {
            Some(sp) => addr(sp),
            None => return Ok(None),
        };
        let hit = if exact_match {
            record_sp == stack_pointer
        } else {
            record_sp > stack_pointer
        };
        Ok(hit.then(|| CallbackFrameInfo {
            registers: registers.clone(),
            is_runtime_invoke: *is_runtime_invoke,
        }))
    }

    fn lmf_address(
        &self,
        _target: &mut dyn TargetMemoryAccess,
    ) -> Result<Option<TargetAddress>, TargetAccessError> {
        Ok(self.lmf_root)
    }
}

/// Builds the innermost frame the way a debugger would: from the thread's
/// live register values.
pub fn initial_frame(
    arch: &Architecture,
    services: &UnwindServices<'_>,
    pc: u64,
    sp: u64,
    fp: Option<u64>,
) -> StackFrame {
    let layout = arch.layout();
    let mut registers = Registers::new(layout, true);
    registers.set_value(layout.pc, pc);
    registers.set_value(layout.sp, sp);
    if let Some(fp) = fp {
        registers.set_value(layout.fp, fp);
    }
    arch.create_frame(FrameKind::Normal, services, SPACE, registers)
        .expect("initial registers name a usable frame")
}
