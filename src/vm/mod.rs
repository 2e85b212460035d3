mod fiber;
mod value;
mod vm;
pub mod host;

pub use fiber::{Activation, Fiber, FiberId, FiberState, NO_ROLE, StartMode, StartResult};
pub use value::Value;
pub use vm::{Fault, PANIC_REBOOT, PANIC_TIMEOUT, RUNTIME_FAILURE_BASE, Vm};

/// A function descriptor from the compiled image.
#[derive(Debug, Clone)]
pub struct FunctionDesc {
    pub name: String,
    /// First valid pc of the function body.
    pub start: u32,
    /// Length of the body; valid pcs are `start .. start + length`.
    pub length: u32,
    pub num_locals: u16,
}

impl FunctionDesc {
    /// One past the last valid pc of this function.
    pub fn maxpc(&self) -> u32 {
        self.start + self.length
    }
}

/// The function-descriptor table of a compiled image.
///
/// Produced outside this core and immutable for the lifetime of a `Vm`
/// instance.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub functions: Vec<FunctionDesc>,
}

impl Image {
    pub fn new(functions: Vec<FunctionDesc>) -> Self {
        Self { functions }
    }

    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    /// Look up a function descriptor. Indices come from linked bytecode and
    /// are trusted; an out-of-range index is a fail-fast bookkeeping error.
    pub fn function(&self, fidx: u16) -> &FunctionDesc {
        &self.functions[fidx as usize]
    }

    /// Function name for diagnostics; out-of-range indices yield `"???"`.
    pub fn function_name(&self, fidx: u16) -> &str {
        self.functions
            .get(fidx as usize)
            .map(|f| f.name.as_str())
            .unwrap_or("???")
    }
}
