//! Call-chain reconstruction for one stopped thread.
//!
//! A [`Backtrace`] starts from the innermost frame and grows outward one
//! frame at a time. Every step tries a sequence of strategies: the frame's
//! own method-level unwinding (unwind tables, then prologue analysis, then
//! the frame pointer chain), signal-frame recovery, a probe for frames the
//! debugger itself injected, and finally the runtime's last-managed-frame
//! records. Whatever a strategy produces must still move strictly up the
//! stack before it is accepted; a candidate that does not progress ends the
//! backtrace instead of looping on corrupted state.

use std::cmp::Ordering;
use std::fmt;

use tracing::{debug, trace};

use crate::address::TargetAddress;
use crate::arch::Architecture;
use crate::frame::{FrameKind, StackFrame};
use crate::host::UnwindServices;
use crate::method::Symbol;
use crate::target::TargetMemoryAccess;

/// Name attached to frames synthesized for debugger-injected calls.
pub const CALLBACK_SYMBOL_NAME: &str = "<function called from the debugger>";

/// Which frames a backtrace keeps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Managed frames, plus everything when the process has no runtime.
    #[default]
    Default,
    /// Only managed frames that carry source information.
    Managed,
    /// Every frame.
    Native,
}

/// How many frames each strategy contributed, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BacktraceStats {
    /// Frames from method or frame-pointer unwinding.
    pub unwound: usize,
    /// Frames rebuilt from a signal handler's saved context.
    pub signal: usize,
    /// Frames synthesized for debugger-injected calls.
    pub callback: usize,
    /// Frames taken from the last-managed-frame chain.
    pub lmf: usize,
}

enum Strategy {
    Unwound,
    Signal,
    Callback,
    Lmf,
}

/// The ordered frame chain of one thread, innermost first.
pub struct Backtrace {
    frames: Vec<StackFrame>,
    /// Cursor for user navigation, an index into `frames`.
    current: usize,
    mode: Mode,
    max_frames: usize,
    until: Option<TargetAddress>,
    /// The last-managed-frame root is resolved at most once per backtrace.
    tried_lmf: bool,
    /// Next unread record of the last-managed-frame chain.
    lmf_cursor: Option<TargetAddress>,
    stats: BacktraceStats,
}

impl Backtrace {
    /// Starts a backtrace at the thread's innermost frame.
    pub fn new(first: StackFrame) -> Self {
        Self {
            frames: vec![first],
            current: 0,
            mode: Mode::Default,
            max_frames: usize::MAX,
            until: None,
            tried_lmf: false,
            lmf_cursor: None,
            stats: BacktraceStats::default(),
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_limit(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Stops the walk once a frame's stack pointer reaches `boundary`.
    pub fn with_boundary(mut self, boundary: TargetAddress) -> Self {
        self.until = Some(boundary);
        self
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, StackFrame> {
        self.frames.iter()
    }

    pub fn frame(&self, level: usize) -> Option<&StackFrame> {
        self.frames.get(level)
    }

    pub fn current_frame(&self) -> Option<&StackFrame> {
        self.frames.get(self.current)
    }

    /// Mutable access to a frame for register write-back.
    pub fn frame_mut(&mut self, level: usize) -> Option<&mut StackFrame> {
        self.frames.get_mut(level)
    }

    /// Moves the cursor to `level` if such a frame exists.
    pub fn move_to(&mut self, level: usize) -> bool {
        if level < self.frames.len() {
            self.current = level;
            true
        } else {
            false
        }
    }

    /// Moves the cursor one frame outward.
    pub fn up(&mut self) -> Option<&StackFrame> {
        if self.current + 1 < self.frames.len() {
            self.current += 1;
            Some(&self.frames[self.current])
        } else {
            None
        }
    }

    /// Moves the cursor one frame inward.
    pub fn down(&mut self) -> Option<&StackFrame> {
        if self.current > 0 {
            self.current -= 1;
            Some(&self.frames[self.current])
        } else {
            None
        }
    }

    #[inline]
    pub fn stats(&self) -> BacktraceStats {
        self.stats
    }

    pub fn print(&self) -> String {
        self.to_string()
    }

    /// Walks the stack until no strategy produces an acceptable frame or
    /// the frame limit is reached, then applies the terminal-frame rule.
    pub fn unwind(
        &mut self,
        arch: &Architecture,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
    ) {
        while self.frames.len() < self.max_frames && self.try_unwind(arch, services, target) {}
        self.trim_terminal_frame();
    }

    /// Attempts to recover one more frame. `false` means the backtrace is
    /// complete: every strategy came up empty, or the best candidate failed
    /// the progress check.
    pub fn try_unwind(
        &mut self,
        arch: &Architecture,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
    ) -> bool {
        if self.frames.len() >= self.max_frames {
            return false;
        }
        let last = match self.frames.last() {
            Some(last) => last,
            None => return false,
        };
        let last_sp = last.stack_pointer();

        let mut strategy = Strategy::Unwound;
        let mut candidate = match last.unwind_stack(arch, services, target) {
            Ok(candidate) => candidate,
            Err(err) => {
                debug!(pc = %last.address(), %err, "frame unwind failed");
                None
            }
        };
        if candidate.is_none() {
            if let Ok(Some(frame)) = arch.try_special_unwind(last, services, target) {
                strategy = Strategy::Signal;
                candidate = Some(frame);
            }
        }
        if let Some(frame) = &candidate {
            if !self.frame_ok_for_mode(frame, services) {
                trace!(pc = %frame.address(), mode = ?self.mode, "frame rejected by mode");
                candidate = None;
            }
        }
        if candidate.is_none() {
            if let Some(frame) = self.try_callback(last_sp, services, target) {
                strategy = Strategy::Callback;
                candidate = Some(frame);
            }
        }
        if candidate.is_none() {
            if let Some(frame) = self.try_lmf(arch, services, target) {
                strategy = Strategy::Lmf;
                candidate = Some(frame);
            }
        }
        let candidate = match candidate {
            Some(candidate) => candidate,
            None => return false,
        };

        // The stack must move strictly towards older frames.
        match last_sp.partial_cmp(&candidate.stack_pointer()) {
            Some(Ordering::Less) => {}
            _ => {
                trace!(
                    last = %last_sp,
                    candidate = %candidate.stack_pointer(),
                    "stack pointer not progressing"
                );
                return false;
            }
        }
        if let Some(until) = self.until {
            if candidate.stack_pointer() >= until {
                trace!(boundary = %until, "reached the caller-supplied boundary");
                return false;
            }
        }

        match strategy {
            Strategy::Unwound => self.stats.unwound += 1,
            Strategy::Signal => self.stats.signal += 1,
            Strategy::Callback => self.stats.callback += 1,
            Strategy::Lmf => self.stats.lmf += 1,
        }
        self.append(candidate);
        true
    }

    fn frame_ok_for_mode(&self, frame: &StackFrame, services: &UnwindServices<'_>) -> bool {
        match self.mode {
            Mode::Native => true,
            Mode::Managed => frame
                .method()
                .is_some_and(|m| m.is_managed() && m.has_source() && !m.is_wrapper()),
            Mode::Default => {
                if !services.is_managed() {
                    return true;
                }
                frame.is_managed()
            }
        }
    }

    /// Looks for a frame the debugger itself pushed onto this stack.
    fn try_callback(
        &self,
        stack_pointer: TargetAddress,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
    ) -> Option<StackFrame> {
        let runtime = services.runtime?;
        let info = match runtime.callback_frame(target, stack_pointer, false) {
            Ok(info) => info?,
            Err(err) => {
                debug!(%err, "callback probe failed");
                return None;
            }
        };
        let registers = info.registers;
        let pc = registers.pc()?;
        if pc == 0 {
            return None;
        }
        let sp = registers.sp()?;
        let space = target.address_space();
        let address = TargetAddress::new(space, pc);
        let kind = if info.is_runtime_invoke {
            FrameKind::RuntimeInvoke
        } else {
            FrameKind::Callback
        };
        trace!(%address, ?kind, "debugger callback frame");
        Some(StackFrame::new(
            kind,
            address,
            TargetAddress::new(space, sp),
            registers.fp().map(|fp| TargetAddress::new(space, fp)),
            registers,
            None,
            Some(Symbol::new(CALLBACK_SYMBOL_NAME, address)),
        ))
    }

    /// Consumes one record of the runtime's last-managed-frame chain. The
    /// chain root is resolved on the first call and the cursor advances one
    /// link per recovered frame.
    fn try_lmf(
        &mut self,
        arch: &Architecture,
        services: &UnwindServices<'_>,
        target: &mut dyn TargetMemoryAccess,
    ) -> Option<StackFrame> {
        if !self.tried_lmf {
            self.tried_lmf = true;
            let runtime = services.runtime?;
            self.lmf_cursor = match runtime.lmf_address(target) {
                Ok(root) => root,
                Err(err) => {
                    debug!(%err, "last-managed-frame root unavailable");
                    None
                }
            };
        }
        let record = self.lmf_cursor?;
        match arch.get_lmf(services, target, record) {
            Ok(Some((frame, link))) => {
                trace!(%record, pc = %frame.address(), "frame from the lmf chain");
                self.lmf_cursor = link;
                Some(frame)
            }
            Ok(None) => {
                self.lmf_cursor = None;
                None
            }
            Err(err) => {
                debug!(%record, %err, "lmf record unreadable");
                self.lmf_cursor = None;
                None
            }
        }
    }

    fn append(&mut self, mut frame: StackFrame) {
        let index = self.frames.len();
        frame.set_level(index);
        if let Some(previous) = self.frames.last_mut() {
            previous.set_parent(Some(index));
        }
        self.frames.push(frame);
    }

    /// In the default mode a backtrace should not end on an uninteresting
    /// native frame (a transition stub below main, say); drop it.
    fn trim_terminal_frame(&mut self) {
        if self.mode != Mode::Default || self.frames.len() <= 1 {
            return;
        }
        let drop_last = match self.frames.last() {
            Some(last) => {
                let is_wrapper = last.method().is_some_and(|m| m.is_wrapper());
                !last.is_managed() && !is_wrapper
            }
            None => false,
        };
        if drop_last {
            self.frames.pop();
            if let Some(new_last) = self.frames.last_mut() {
                new_last.set_parent(None);
            }
            if self.current >= self.frames.len() {
                self.current = self.frames.len() - 1;
            }
        }
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Backtrace {
    type Item = &'a StackFrame;
    type IntoIter = std::slice::Iter<'a, StackFrame>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::AddressSpace;
    use crate::error::TargetAccessError;
    use crate::host::{CallbackFrameInfo, ManagedRuntime, SymbolResolver};
    use crate::method::{LineTable, Method, WrapperType};
    use crate::registers::Registers;
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

    struct IdleRuntime;

    impl ManagedRuntime for IdleRuntime {
        fn is_trampoline_address(&self, _address: TargetAddress) -> bool {
            false
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

    fn frame_at(pc: u64, sp: u64, method: Option<Arc<Method>>) -> StackFrame {
        let arch = Architecture::x86_64();
        let layout = arch.layout();
        let mut registers = Registers::new(layout, false);
        registers.set_value(layout.pc, pc);
        registers.set_value(layout.sp, sp);
        StackFrame::new(
            FrameKind::Normal,
            addr(pc),
            addr(sp),
            None,
            registers,
            method,
            None,
        )
    }

    fn managed_method(name: &str, start: u64) -> Arc<Method> {
        let method = Method::new(name, addr(start), addr(start + 0x100))
            .managed()
            .with_line_table(LineTable::new("main.cs", vec![(addr(start), 10)]));
        Arc::new(method)
    }

    #[test]
    fn levels_and_parents_follow_appends() {
        let mut bt = Backtrace::new(frame_at(0x1000, 0x7000, None));
        bt.append(frame_at(0x2000, 0x7100, None));
        bt.append(frame_at(0x3000, 0x7200, None));

        let frames = bt.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].level(), 0);
        assert_eq!(frames[1].level(), 1);
        assert_eq!(frames[2].level(), 2);
        assert_eq!(frames[0].parent(), Some(1));
        assert_eq!(frames[1].parent(), Some(2));
        assert_eq!(frames[2].parent(), None);
    }

    #[test]
    fn navigation_moves_the_cursor() {
        let mut bt = Backtrace::new(frame_at(0x1000, 0x7000, None));
        bt.append(frame_at(0x2000, 0x7100, None));
        bt.append(frame_at(0x3000, 0x7200, None));

        assert_eq!(bt.current_frame().map(StackFrame::level), Some(0));
        assert_eq!(bt.up().map(StackFrame::level), Some(1));
        assert_eq!(bt.up().map(StackFrame::level), Some(2));
        assert!(bt.up().is_none());
        assert_eq!(bt.down().map(StackFrame::level), Some(1));
        assert!(bt.move_to(0));
        assert!(!bt.move_to(3));
        assert_eq!(bt.current_frame().map(StackFrame::level), Some(0));
    }

    #[test]
    fn mode_policy() {
        let resolver = NoSymbols;
        let native_services = UnwindServices::new(&resolver);
        let runtime = IdleRuntime;
        let managed_services = UnwindServices::new(&resolver).with_runtime(&runtime);

        let native = frame_at(0x1000, 0x7000, None);
        let managed = frame_at(0x2000, 0x7100, Some(managed_method("Main", 0x2000)));
        let wrapper = frame_at(
            0x3000,
            0x7200,
            Some(Arc::new(
                Method::new("invoke", addr(0x3000), addr(0x3100))
                    .managed()
                    .with_wrapper(WrapperType::RuntimeInvoke),
            )),
        );

        let default_bt = Backtrace::new(frame_at(0, 1, None));
        assert!(default_bt.frame_ok_for_mode(&native, &native_services));
        assert!(!default_bt.frame_ok_for_mode(&native, &managed_services));
        assert!(default_bt.frame_ok_for_mode(&managed, &managed_services));
        assert!(default_bt.frame_ok_for_mode(&wrapper, &managed_services));

        let managed_bt = Backtrace::new(frame_at(0, 1, None)).with_mode(Mode::Managed);
        assert!(!managed_bt.frame_ok_for_mode(&native, &managed_services));
        assert!(managed_bt.frame_ok_for_mode(&managed, &managed_services));
        // Wrappers have no source a user cares about.
        assert!(!managed_bt.frame_ok_for_mode(&wrapper, &managed_services));

        let native_bt = Backtrace::new(frame_at(0, 1, None)).with_mode(Mode::Native);
        assert!(native_bt.frame_ok_for_mode(&native, &managed_services));
        assert!(native_bt.frame_ok_for_mode(&wrapper, &managed_services));
    }

    #[test]
    fn terminal_native_frame_is_dropped_in_default_mode() {
        let mut bt = Backtrace::new(frame_at(0x1000, 0x7000, Some(managed_method("Main", 0x1000))));
        bt.append(frame_at(0x2000, 0x7100, None));
        bt.trim_terminal_frame();
        assert_eq!(bt.len(), 1);
        assert_eq!(bt.frames()[0].parent(), None);

        // A lone frame survives even when it is native.
        let mut bt = Backtrace::new(frame_at(0x2000, 0x7100, None));
        bt.trim_terminal_frame();
        assert_eq!(bt.len(), 1);

        // Native mode keeps the tail.
        let mut bt = Backtrace::new(frame_at(0x1000, 0x7000, None)).with_mode(Mode::Native);
        bt.append(frame_at(0x2000, 0x7100, None));
        bt.trim_terminal_frame();
        assert_eq!(bt.len(), 2);
    }

    #[test]
    fn print_renders_one_line_per_frame() {
        let mut bt = Backtrace::new(frame_at(0x1000, 0x7000, Some(managed_method("Main", 0x1000))));
        bt.append(frame_at(0x2000, 0x7100, None));
        let printed = bt.print();
        let lines: Vec<&str> = printed.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("#0"));
        assert!(lines[0].contains("Main"));
        assert!(lines[0].contains("main.cs:10"));
        assert!(lines[1].starts_with("#1"));
        assert!(lines[1].contains("<unknown>"));
    }
}
