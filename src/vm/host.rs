//! External collaborator interfaces.
//!
//! The scheduler core delegates statement execution, timekeeping, event
//! matching, and tracing to its host. Each collaborator has a no-op (or
//! wall-clock) default so the core is usable stand-alone in tests.

use std::time::Instant;

use super::{Fiber, Vm};

/// Executes bytecode statements on behalf of the scheduler.
///
/// The interpreter is trusted to advance the current activation's pc, and
/// to call, return, or yield through the `Vm` primitives; the execution
/// harness only bounds how many statements one quantum may take.
pub trait Interpreter {
    /// Execute one statement of the current activation.
    fn exec_stmt(&mut self, vm: &mut Vm);
}

/// Monotonic millisecond clock.
pub trait Clock {
    fn refresh_now_ms(&mut self) -> u64;
}

/// Wall clock measured from construction.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn refresh_now_ms(&mut self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Decides whether an externally signalled event satisfies a fiber's wait
/// condition, keyed by the fiber's role binding.
pub trait EventGate {
    /// May this fiber run now? A gate that denies a runnable fiber must
    /// also park or re-arm it, or the wake loop cannot drain the list.
    fn may_run(&mut self, fiber: &Fiber) -> bool;

    /// Acknowledge and drop the fiber's matched-event marker.
    fn clear_matched(&mut self, fiber: &Fiber);

    /// Forget any partially dispatched packet before a scheduling pass.
    fn reset_packet(&mut self);
}

/// Gate that admits every fiber (no external event layer).
#[derive(Debug, Default)]
pub struct NoEvents;

impl EventGate for NoEvents {
    fn may_run(&mut self, _fiber: &Fiber) -> bool {
        true
    }

    fn clear_matched(&mut self, _fiber: &Fiber) {}

    fn reset_packet(&mut self) {}
}

/// Scheduling trace events, gated by `RuntimeConfig::trace_enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    FiberRun { pc: u32 },
    FiberYield { pc: u32 },
}

/// Sink for scheduling trace events.
pub trait TraceSink {
    fn emit(&mut self, ev: TraceEvent);
}

/// Sink that discards all events.
#[derive(Debug, Default)]
pub struct NullTrace;

impl TraceSink for NullTrace {
    fn emit(&mut self, _ev: TraceEvent) {}
}
