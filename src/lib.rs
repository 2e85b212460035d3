//! Ember - the cooperative fiber scheduler core of an embedded bytecode VM.
//!
//! This library multiplexes logical threads of bytecode execution (fibers)
//! onto a single execution context with no preemption. It manages each
//! fiber's stack of call frames, coalesces repeated background starts of
//! the same entry function, and drives the time-based wake loop. Fatal
//! conditions latch into a sticky per-instance error record. Statement
//! execution, the compiled image, event matching, and the clock are
//! external collaborators (see `vm::host`).

pub mod config;
pub mod vm;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use vm::{Fiber, FiberId, FiberState, Image, StartMode, StartResult, Value, Vm};
