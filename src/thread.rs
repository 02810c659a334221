//! Owner-thread identity recorded with every tracked allocation.

use std::fmt;

/// Linux caps thread names at 15 bytes plus the terminating NUL.
const NAME_LEN: usize = 16;

/// Kernel thread id plus the thread's name, captured without allocating.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadIdentity {
    id: u32,
    name: [u8; NAME_LEN],
}

impl ThreadIdentity {
    pub const UNKNOWN: ThreadIdentity = ThreadIdentity {
        id: 0,
        name: [0; NAME_LEN],
    };

    /// Identity of the calling thread.
    pub fn current() -> Self {
        let id = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
        let mut name = [0_u8; NAME_LEN];
        // For the calling thread glibc answers through prctl(PR_GET_NAME),
        // which does not touch the heap.
        let rc = unsafe {
            libc::pthread_getname_np(libc::pthread_self(), name.as_mut_ptr().cast(), NAME_LEN)
        };
        if rc != 0 {
            name = [0; NAME_LEN];
        }
        ThreadIdentity { id, name }
    }

    #[cfg(test)]
    pub(crate) fn with_name(id: u32, name: &str) -> Self {
        let mut bytes = [0_u8; NAME_LEN];
        let len = name.len().min(NAME_LEN - 1);
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        ThreadIdentity { id, name: bytes }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The thread name, empty when the thread never set one or it is not
    /// valid UTF-8.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        std::str::from_utf8(&self.name[..len]).unwrap_or_default()
    }
}

impl fmt::Debug for ThreadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadIdentity")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}
