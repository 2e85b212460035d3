//! Fiber and activation records.

use super::{FunctionDesc, Image, Value};

/// Sentinel for "no external role bound".
pub const NO_ROLE: u16 = 0xffff;

/// Stable fiber identity. Handles stay valid across fiber-list mutation and
/// are never reused within one `Vm` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub u32);

/// How `fiber_start` treats an existing fiber for the same function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Always start a new fiber.
    Bg,
    /// Keep at most one fiber per function; duplicate starts are dropped.
    BgMax1,
    /// At most one fiber, plus at most one queued re-run while it is busy.
    BgMax1Pend1,
}

/// Outcome of `fiber_start`, also stored in the fiber's `ret_val` for the
/// bytecode caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    /// A fiber for this function already exists; the request was dropped.
    Ignored = 0,
    /// A new fiber was created and scheduled.
    Started = 1,
    /// The existing fiber was marked for one re-run after it completes.
    Pended = 2,
    /// A re-run was already queued; nothing changed.
    AlreadyPending = 3,
}

impl StartResult {
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// Scheduling state of a fiber.
///
/// A parked fiber is never selected by the wake loop; it runs again only
/// after an explicit re-arm or a direct external `fiber_run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Eligible to run once the VM clock reaches `at` (milliseconds).
    Runnable { at: u64 },
    /// Executing right now. At most one fiber per context.
    Running,
    /// Not scheduled; waiting for an external event or an explicit re-arm.
    Parked,
}

/// One call frame on a fiber's stack.
#[derive(Debug)]
pub struct Activation {
    pub func_idx: u16,
    /// Program counter; always within `start .. maxpc` of the function.
    pub pc: u32,
    pub maxpc: u32,
    /// Local storage, sized from the function descriptor, nil-initialized.
    pub locals: Box<[Value]>,
    /// Call parameters. Owned by the frame, so they outlive the caller.
    pub params: Box<[Value]>,
}

impl Activation {
    pub(crate) fn new(func_idx: u16, func: &FunctionDesc, params: Box<[Value]>) -> Self {
        Self {
            func_idx,
            pc: func.start,
            maxpc: func.maxpc(),
            locals: vec![Value::Nil; func.num_locals as usize].into_boxed_slice(),
            params,
        }
    }
}

/// A cooperatively scheduled logical thread of bytecode execution,
/// identified by the function it was started with.
#[derive(Debug)]
pub struct Fiber {
    pub(crate) id: FiberId,
    /// Coalescing identity key: the root function this fiber was started with.
    pub(crate) bottom_function_idx: u16,
    /// Call stack, bottom frame first; the last entry is the current frame.
    pub(crate) frames: Vec<Activation>,
    pub(crate) state: FiberState,
    /// A coalesced re-run was requested while the root invocation was in
    /// flight.
    pub(crate) pending: bool,
    pub(crate) role_idx: u16,
    /// Last start-result control value for the bytecode caller.
    pub(crate) ret_val: Value,
}

impl Fiber {
    pub(crate) fn new(id: FiberId, fidx: u16) -> Self {
        Self {
            id,
            bottom_function_idx: fidx,
            frames: Vec::new(),
            state: FiberState::Parked,
            pending: false,
            role_idx: NO_ROLE,
            ret_val: Value::Nil,
        }
    }

    /// Push a new activation for `fidx` on top of the call stack.
    pub(crate) fn push_activation(&mut self, img: &Image, fidx: u16, params: Vec<Value>) {
        let func = img.function(fidx);
        self.frames.push(Activation::new(fidx, func, params.into_boxed_slice()));
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn bottom_function_idx(&self) -> u16 {
        self.bottom_function_idx
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    /// Wake-time view of the scheduling state: `Some(at)` when runnable.
    pub fn wake_time(&self) -> Option<u64> {
        match self.state {
            FiberState::Runnable { at } => Some(at),
            _ => None,
        }
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn role_idx(&self) -> u16 {
        self.role_idx
    }

    /// Associate this fiber with an external addressable role. The binding
    /// is consumed by the event-eligibility layer and reset at the start of
    /// each run.
    pub fn bind_role(&mut self, role_idx: u16) {
        self.role_idx = role_idx;
    }

    pub fn ret_val(&self) -> Value {
        self.ret_val
    }

    /// Call-stack depth in frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame(&self) -> Option<&Activation> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut Activation> {
        self.frames.last_mut()
    }

    /// Frames from the current activation upward through its callers.
    pub fn backtrace(&self) -> impl Iterator<Item = &Activation> {
        self.frames.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image() -> Image {
        Image::new(vec![FunctionDesc {
            name: "main".to_string(),
            start: 10,
            length: 5,
            num_locals: 3,
        }])
    }

    #[test]
    fn test_activation_bounds() {
        let img = test_image();
        let act = Activation::new(0, img.function(0), Box::new([]));
        assert_eq!(act.pc, 10);
        assert_eq!(act.maxpc, 15);
        assert_eq!(act.locals.len(), 3);
        assert!(act.locals.iter().all(|v| v.is_nil()));
    }

    #[test]
    fn test_fresh_fiber_is_parked() {
        let fiber = Fiber::new(FiberId(0), 0);
        assert_eq!(fiber.state(), FiberState::Parked);
        assert_eq!(fiber.wake_time(), None);
        assert!(!fiber.pending());
        assert_eq!(fiber.role_idx(), NO_ROLE);
        assert_eq!(fiber.depth(), 0);
    }

    #[test]
    fn test_start_result_codes() {
        assert_eq!(StartResult::Ignored.code(), 0);
        assert_eq!(StartResult::Started.code(), 1);
        assert_eq!(StartResult::Pended.code(), 2);
        assert_eq!(StartResult::AlreadyPending.code(), 3);
    }
}
