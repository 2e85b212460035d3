//! The per-instance VM context: fiber list, wake loop, and the global
//! error latch.

use std::io::{self, Write};

use tracing::debug;

use crate::config::RuntimeConfig;

use super::host::{
    Clock, EventGate, Interpreter, NoEvents, NullTrace, SystemClock, TraceEvent, TraceSink,
};
use super::{Activation, Fiber, FiberId, FiberState, Image, NO_ROLE, StartMode, StartResult, Value};

/// Explicit request to restart the device; no backtrace is logged.
pub const PANIC_REBOOT: u32 = 60000;
/// A fiber exhausted its per-run step budget without yielding.
pub const PANIC_TIMEOUT: u32 = 60001;
/// Base of the reserved runtime-failure code range; failed built-ins report
/// `RUNTIME_FAILURE_BASE + code` with `code >= 100`.
pub const RUNTIME_FAILURE_BASE: u32 = 60000;

/// The sticky first-failure record of a halted VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub code: u32,
    /// pc of the activation that was current when the fault latched, or 0.
    pub pc: u32,
}

/// One VM instance: the live fiber list, the currently executing fiber, the
/// error latch, and a cached time snapshot.
///
/// Strictly single-threaded and cooperative. All shared state is touched
/// only between suspension points, while the scheduler holds control.
pub struct Vm {
    img: Image,
    config: RuntimeConfig,
    /// Live fibers; new fibers are inserted at the front, so scans see the
    /// most recently started fiber first.
    fibers: Vec<Fiber>,
    current: Option<FiberId>,
    fault: Option<Fault>,
    /// Cached monotonic milliseconds, refreshed via `sync_now`.
    now: u64,
    next_fiber_id: u32,
    clock: Box<dyn Clock>,
    gate: Box<dyn EventGate>,
    trace: Box<dyn TraceSink>,
    /// Always-on diagnostic sink for panic reports and backtraces.
    diag: Box<dyn Write>,
}

impl Vm {
    pub fn new(img: Image) -> Self {
        Self::with_config(img, RuntimeConfig::default())
    }

    pub fn with_config(img: Image, config: RuntimeConfig) -> Self {
        Self::with_host(
            img,
            config,
            Box::new(SystemClock::new()),
            Box::new(NoEvents),
            Box::new(NullTrace),
            Box::new(io::stderr()),
        )
    }

    /// Create a VM with every collaborator injected.
    pub fn with_host(
        img: Image,
        config: RuntimeConfig,
        clock: Box<dyn Clock>,
        gate: Box<dyn EventGate>,
        trace: Box<dyn TraceSink>,
        diag: Box<dyn Write>,
    ) -> Self {
        Self {
            img,
            config,
            fibers: Vec::new(),
            current: None,
            fault: None,
            now: 0,
            next_fiber_id: 0,
            clock,
            gate,
            trace,
            diag,
        }
    }

    pub fn image(&self) -> &Image {
        &self.img
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The first-failure record, or `None` while healthy.
    pub fn fault(&self) -> Option<Fault> {
        self.fault
    }

    /// Durable error code for host inspection; 0 = healthy.
    pub fn error_code(&self) -> u32 {
        self.fault.map(|f| f.code).unwrap_or(0)
    }

    /// Location of the first failure; 0 if healthy or no activation was
    /// current.
    pub fn error_pc(&self) -> u32 {
        self.fault.map(|f| f.pc).unwrap_or(0)
    }

    /// The cached time snapshot (milliseconds).
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn fiber_count(&self) -> usize {
        self.fibers.len()
    }

    /// Live fibers in scan order (most recently started first).
    pub fn fibers(&self) -> &[Fiber] {
        &self.fibers
    }

    pub fn fiber(&self, id: FiberId) -> Option<&Fiber> {
        self.fibers.iter().find(|f| f.id == id)
    }

    pub fn fiber_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        self.fibers.iter_mut().find(|f| f.id == id)
    }

    /// The fiber whose root function is `fidx`, if one is live.
    pub fn find_fiber(&self, fidx: u16) -> Option<&Fiber> {
        self.fibers.iter().find(|f| f.bottom_function_idx == fidx)
    }

    pub fn current_fiber_id(&self) -> Option<FiberId> {
        self.current
    }

    pub fn current_fiber(&self) -> Option<&Fiber> {
        self.current.and_then(|id| self.fiber(id))
    }

    pub fn current_activation(&self) -> Option<&Activation> {
        self.current_fiber().and_then(|f| f.frames.last())
    }

    pub fn current_activation_mut(&mut self) -> Option<&mut Activation> {
        let id = self.current?;
        self.fibers
            .iter_mut()
            .find(|f| f.id == id)
            .and_then(|f| f.frames.last_mut())
    }

    /// Locate a fiber by id. A missing id is a bookkeeping violation, not a
    /// runtime error, and fails fast.
    fn index_of(&self, id: FiberId) -> usize {
        self.fibers
            .iter()
            .position(|f| f.id == id)
            .unwrap_or_else(|| panic!("fiber F{} not in context", id.0))
    }

    /// Refresh the cached time snapshot from the clock.
    pub fn sync_now(&mut self) {
        self.now = self.clock.refresh_now_ms();
    }

    /// Start (or coalesce) a background invocation of function `fidx`.
    ///
    /// With `StartMode::Bg` a new fiber is always created. The other modes
    /// first look for a live fiber rooted at `fidx` and coalesce into it;
    /// the result code is returned and also stored in that fiber's
    /// `ret_val` for the bytecode caller.
    pub fn fiber_start(&mut self, fidx: u16, params: Vec<Value>, mode: StartMode) -> StartResult {
        if mode != StartMode::Bg {
            if let Some(fiber) = self.fibers.iter_mut().find(|f| f.bottom_function_idx == fidx) {
                let res = if mode == StartMode::BgMax1Pend1 {
                    if fiber.pending {
                        StartResult::AlreadyPending
                    } else {
                        fiber.pending = true;
                        StartResult::Pended
                    }
                } else {
                    StartResult::Ignored
                };
                fiber.ret_val = Value::from_int(res.code());
                return res;
            }
        }

        let id = FiberId(self.next_fiber_id);
        self.next_fiber_id += 1;

        debug!("start fiber {}_F{}", self.img.function_name(fidx), fidx);

        let mut fiber = Fiber::new(id, fidx);
        fiber.push_activation(&self.img, fidx, params);
        fiber.state = FiberState::Runnable { at: self.now };
        fiber.ret_val = Value::from_int(StartResult::Started.code());
        self.fibers.insert(0, fiber);

        StartResult::Started
    }

    /// Push a new activation for `fidx` onto the current fiber: a nested
    /// call from the interpreter.
    pub fn call_function(&mut self, fidx: u16, params: Vec<Value>) {
        let id = self.current.expect("call_function with no current fiber");
        let idx = self.index_of(id);
        self.fibers[idx].push_activation(&self.img, fidx, params);
    }

    /// Return from the current activation.
    ///
    /// With a caller frame this is an ordinary call return. When the bottom
    /// frame returns, a pending re-run restarts the root invocation in
    /// place (same quantum); otherwise the fiber is complete and removed.
    pub fn return_from_call(&mut self) {
        let id = self.current.expect("return_from_call with no current fiber");
        let idx = self.index_of(id);

        if self.fibers[idx].frames.len() > 1 {
            self.fibers[idx].frames.pop();
            return;
        }

        let fidx = self.fibers[idx].bottom_function_idx;
        if self.fibers[idx].pending {
            debug!("re-run fiber {}_F{}", self.img.function_name(fidx), fidx);
            let start = self.img.function(fidx).start;
            let fiber = &mut self.fibers[idx];
            fiber.pending = false;
            fiber.frames[0].pc = start;
        } else {
            debug!("free fiber {}_F{}", self.img.function_name(fidx), fidx);
            self.fiber_yield();
            let fiber = self.fibers.remove(idx);
            self.gate.clear_matched(&fiber);
        }
    }

    /// Clear the current fiber and activation, handing control back to the
    /// scheduler.
    ///
    /// The single point where "a fiber is executing" transitions to "the
    /// scheduler decides what runs next"; reached on sleep, on completion,
    /// and on every panic.
    pub fn fiber_yield(&mut self) {
        if self.config.trace_enabled {
            if let Some(pc) = self.current_activation().map(|a| a.pc) {
                self.trace.emit(TraceEvent::FiberYield { pc });
            }
        }

        if let Some(id) = self.current.take() {
            if let Some(fiber) = self.fibers.iter_mut().find(|f| f.id == id) {
                // sleep has already re-armed the fiber; only an un-armed
                // fiber parks
                if fiber.state == FiberState::Running {
                    fiber.state = FiberState::Parked;
                }
            }
        }
    }

    /// Suspend the current fiber for `ms` milliseconds, then yield.
    pub fn sleep(&mut self, ms: u64) {
        let id = self.current.expect("sleep with no current fiber");
        let at = self.now + ms;
        let idx = self.index_of(id);
        self.fibers[idx].state = FiberState::Runnable { at };
        self.fiber_yield();
    }

    /// Re-arm (`Some(at)`) or park (`None`) a fiber's wake condition.
    pub fn set_wake_time(&mut self, id: FiberId, at: Option<u64>) {
        let idx = self.index_of(id);
        self.fibers[idx].state = match at {
            Some(at) => FiberState::Runnable { at },
            None => FiberState::Parked,
        };
    }

    /// Run one fiber for at most one bounded quantum.
    ///
    /// No-op while halted or while the event gate holds the fiber back. On
    /// eligibility the fiber must re-arm its own wake condition before its
    /// next run.
    pub fn fiber_run(&mut self, id: FiberId, interp: &mut dyn Interpreter) {
        if self.fault.is_some() {
            return;
        }

        self.sync_now();

        let idx = self.index_of(id);
        if !self.gate.may_run(&self.fibers[idx]) {
            return;
        }
        self.gate.clear_matched(&self.fibers[idx]);

        let fiber = &mut self.fibers[idx];
        fiber.role_idx = NO_ROLE;
        fiber.state = FiberState::Running;
        self.current = Some(id);

        if self.config.trace_enabled {
            let pc = fiber.frames.last().unwrap().pc;
            self.trace.emit(TraceEvent::FiberRun { pc });
        }

        let mut steps = self.config.max_steps.max(1);
        while self.current.is_some() {
            steps -= 1;
            if steps == 0 {
                break;
            }
            interp.exec_stmt(self);
        }

        if steps == 0 {
            self.panic(PANIC_TIMEOUT);
        }
    }

    /// Wake-loop entry point: run due fibers one at a time until none is
    /// ready or the latch is set.
    pub fn poke(&mut self, interp: &mut dyn Interpreter) {
        self.sync_now();
        while self.wake_some(interp) {}
    }

    fn wake_some(&mut self, interp: &mut dyn Interpreter) -> bool {
        if self.fault.is_some() {
            return false;
        }
        let now = self.now;
        let due = self
            .fibers
            .iter()
            .find(|f| matches!(f.state, FiberState::Runnable { at } if at <= now))
            .map(|f| f.id);
        match due {
            Some(id) => {
                self.gate.reset_packet();
                self.fiber_run(id, interp);
                // the run may have mutated or shrunk the fiber list, so the
                // caller rescans from the front
                true
            }
            None => false,
        }
    }

    /// Raise the global error latch.
    ///
    /// Code 0 is promoted to `PANIC_REBOOT`. Only the first failure is
    /// recorded; later panics keep the original code and pc. Always yields.
    pub fn panic(&mut self, code: u32) {
        let code = if code == 0 { PANIC_REBOOT } else { code };

        if self.fault.is_none() {
            let pc = self.current_activation().map(|a| a.pc).unwrap_or(0);
            // the diagnostic sink stays active even with tracing disabled
            if code == PANIC_REBOOT {
                let _ = writeln!(self.diag, "RESTART requested");
            } else {
                let _ = writeln!(self.diag, "PANIC {} at pc={}", code, pc);
            }
            self.fault = Some(Fault { code, pc });

            if code != PANIC_REBOOT {
                if let Some(id) = self.current {
                    let idx = self.index_of(id);
                    for act in self.fibers[idx].backtrace() {
                        let fidx = act.func_idx;
                        let start = self.img.function(fidx).start;
                        let _ = writeln!(
                            self.diag,
                            "  pc={} @ {}_F{}",
                            act.pc - start,
                            self.img.function_name(fidx),
                            fidx
                        );
                    }
                }
            }
        }

        self.fiber_yield();
    }

    /// Report a failed runtime built-in.
    ///
    /// Floors `code` at 100, latches `RUNTIME_FAILURE_BASE + code`, and
    /// returns a NaN so expression evaluation can produce a value until the
    /// unwind completes at the next yield.
    pub fn runtime_failure(&mut self, code: u32) -> Value {
        let code = code.max(100);
        self.panic(RUNTIME_FAILURE_BASE + code);
        Value::nan()
    }

    /// Tear down every fiber, leaving an empty list (process-wide reset).
    pub fn free_all_fibers(&mut self) {
        self.current = None;
        for fiber in self.fibers.drain(..) {
            self.gate.clear_matched(&fiber);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::FunctionDesc;

    fn test_image() -> Image {
        Image::new(vec![
            FunctionDesc {
                name: "main".to_string(),
                start: 0,
                length: 10,
                num_locals: 0,
            },
            FunctionDesc {
                name: "blink".to_string(),
                start: 10,
                length: 8,
                num_locals: 2,
            },
        ])
    }

    #[test]
    fn test_bg_always_starts_new() {
        let mut vm = Vm::new(test_image());
        for _ in 0..3 {
            assert_eq!(
                vm.fiber_start(1, vec![], StartMode::Bg),
                StartResult::Started
            );
        }
        assert_eq!(vm.fiber_count(), 3);
    }

    #[test]
    fn test_bg_max1_coalesces() {
        let mut vm = Vm::new(test_image());
        assert_eq!(
            vm.fiber_start(1, vec![], StartMode::BgMax1),
            StartResult::Started
        );
        assert_eq!(
            vm.fiber_start(1, vec![], StartMode::BgMax1),
            StartResult::Ignored
        );
        assert_eq!(vm.fiber_count(), 1);
        assert_eq!(vm.find_fiber(1).unwrap().ret_val(), Value::Int(0));
    }

    #[test]
    fn test_bg_max1_pend1_sequence() {
        let mut vm = Vm::new(test_image());
        assert_eq!(
            vm.fiber_start(1, vec![], StartMode::BgMax1Pend1),
            StartResult::Started
        );
        assert!(!vm.find_fiber(1).unwrap().pending());

        assert_eq!(
            vm.fiber_start(1, vec![], StartMode::BgMax1Pend1),
            StartResult::Pended
        );
        assert!(vm.find_fiber(1).unwrap().pending());
        assert_eq!(vm.find_fiber(1).unwrap().ret_val(), Value::Int(2));

        assert_eq!(
            vm.fiber_start(1, vec![], StartMode::BgMax1Pend1),
            StartResult::AlreadyPending
        );
        assert!(vm.find_fiber(1).unwrap().pending());
        assert_eq!(vm.find_fiber(1).unwrap().ret_val(), Value::Int(3));

        assert_eq!(vm.fiber_count(), 1);
    }

    #[test]
    fn test_new_fiber_is_runnable_now() {
        let mut vm = Vm::new(test_image());
        vm.fiber_start(0, vec![], StartMode::Bg);
        let fiber = vm.find_fiber(0).unwrap();
        assert_eq!(fiber.wake_time(), Some(vm.now()));
        assert_eq!(fiber.depth(), 1);
        assert_eq!(fiber.current_frame().unwrap().pc, 0);
        assert_eq!(fiber.ret_val(), Value::Int(1));
    }

    #[test]
    fn test_free_all_fibers() {
        let mut vm = Vm::new(test_image());
        vm.fiber_start(0, vec![], StartMode::Bg);
        vm.fiber_start(1, vec![], StartMode::Bg);
        vm.free_all_fibers();
        assert_eq!(vm.fiber_count(), 0);
        assert!(vm.current_fiber_id().is_none());
    }

    #[test]
    fn test_panic_zero_means_reboot() {
        let mut vm = Vm::new(test_image());
        vm.panic(0);
        assert_eq!(vm.error_code(), PANIC_REBOOT);
    }

    #[test]
    fn test_runtime_failure_floors_code() {
        let mut vm = Vm::new(test_image());
        let val = vm.runtime_failure(7);
        assert!(val.is_nan());
        assert_eq!(vm.error_code(), RUNTIME_FAILURE_BASE + 100);
    }

    #[test]
    fn test_first_fault_wins() {
        let mut vm = Vm::new(test_image());
        vm.runtime_failure(200);
        vm.runtime_failure(300);
        assert_eq!(vm.error_code(), RUNTIME_FAILURE_BASE + 200);
    }
}
