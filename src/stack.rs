use std::fmt;

/// Maximum number of return addresses kept per allocation.
pub const MAX_CALLSTACK: usize = 16;

/// Return addresses captured at allocation time, innermost first.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CallStack {
    frames: [usize; MAX_CALLSTACK],
    depth: u8,
}

impl CallStack {
    pub const EMPTY: CallStack = CallStack {
        frames: [0; MAX_CALLSTACK],
        depth: 0,
    };

    /// Walk the current thread's stack.
    ///
    /// The unwinder may allocate, so callers must have bookkeeping
    /// suppressed before calling this from inside a primitive.
    ///
    /// Never takes `backtrace`'s global lock: the report thread allocates
    /// while holding it, and waiting for it with the tracer lock held would
    /// deadlock.
    #[inline(never)]
    pub fn capture() -> Self {
        let mut stack = CallStack::EMPTY;
        let mut depth = 0;
        // SAFETY: on Linux the walk goes through `_Unwind_Backtrace`, which
        // is safe to run from several threads at once.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                stack.frames[depth] = frame.ip() as usize;
                depth += 1;
                depth < MAX_CALLSTACK
            })
        };
        stack.depth = depth as u8;
        stack
    }

    pub fn from_frames(frames: &[usize]) -> Self {
        let mut stack = CallStack::EMPTY;
        let depth = frames.len().min(MAX_CALLSTACK);
        stack.frames[..depth].copy_from_slice(&frames[..depth]);
        stack.depth = depth as u8;
        stack
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..usize::from(self.depth)]
    }

    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }
}

impl fmt::Debug for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|ip| format!("{ip:#x}")))
            .finish()
    }
}
