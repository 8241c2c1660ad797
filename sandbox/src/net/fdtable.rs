use super::{NetError, NetResult, Provider};
use std::os::fd::RawFd;
use tracing::{debug, warn};

/// Standard file descriptor constants
const STDIN_FILENO: i32 = 0;
const STDERR_FILENO: i32 = 2;
pub const FIRST_USER_FD: i32 = 3;

/// Maximum number of descriptors a single session may track
pub const MAX_TRACKED_FDS: usize = 64;

fn is_standard_stream(fd: i32) -> bool {
    (STDIN_FILENO..=STDERR_FILENO).contains(&fd)
}

/// Per-session table that virtualizes socket descriptors
///
/// Entry `i` is exposed to the script as virtual descriptor `i + 3`. The
/// standard streams (0, 1, 2) map to themselves and are never tracked or
/// closed by the table.
///
/// Removing an entry compacts the table, so every later entry moves down one
/// virtual number. A virtual number freed this way is handed out again by the
/// next admission.
pub struct FdTable {
    entries: Vec<RawFd>,
}

impl FdTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_TRACKED_FDS),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_TRACKED_FDS
    }

    /// Start tracking a real descriptor and return its virtual number
    ///
    /// On failure the caller still owns `fd` and must close it.
    pub fn admit(&mut self, fd: RawFd) -> NetResult<i32> {
        if is_standard_stream(fd) {
            warn!(fd, "refusing to track a standard stream");
            return Err(NetError::Reserved(fd));
        }
        if fd < 0 {
            return Err(NetError::BadDescriptor(fd));
        }

        debug_assert!(
            !self.entries.contains(&fd),
            "descriptor {} is already tracked",
            fd
        );

        if self.is_full() {
            warn!(fd, "descriptor table is full");
            return Err(NetError::TableFull(MAX_TRACKED_FDS));
        }

        self.entries.push(fd);
        let vfd = FIRST_USER_FD + (self.entries.len() - 1) as i32;
        debug!(fd, vfd, "admitted descriptor");
        Ok(vfd)
    }

    /// Admit `fd`, closing it through `provider` if it cannot be tracked
    pub fn admit_or_close<P: Provider + ?Sized>(
        &mut self,
        fd: RawFd,
        provider: &P,
    ) -> NetResult<i32> {
        self.admit(fd).map_err(|err| {
            provider.close(fd);
            err
        })
    }

    /// Translate a virtual descriptor to the real one
    pub fn resolve(&self, vfd: i32) -> Option<RawFd> {
        if is_standard_stream(vfd) {
            return Some(vfd);
        }
        let idx = usize::try_from(vfd.checked_sub(FIRST_USER_FD)?).ok()?;
        self.entries.get(idx).copied()
    }

    /// Find the virtual descriptor currently mapped to a real one
    pub fn reverse_resolve(&self, fd: RawFd) -> Option<i32> {
        if is_standard_stream(fd) {
            return Some(fd);
        }
        self.entries
            .iter()
            .position(|&tracked| tracked == fd)
            .map(|idx| FIRST_USER_FD + idx as i32)
    }

    /// Stop tracking a virtual descriptor without closing it
    ///
    /// Returns the real descriptor that is no longer tracked. The caller is
    /// responsible for closing it, usually through a batch close.
    pub fn evict(&mut self, vfd: i32) -> Option<RawFd> {
        if is_standard_stream(vfd) {
            return None;
        }
        let idx = usize::try_from(vfd.checked_sub(FIRST_USER_FD)?).ok()?;
        if idx >= self.entries.len() {
            return None;
        }

        let fd = self.entries.remove(idx);
        debug_assert!(!self.entries.contains(&fd));
        debug!(fd, vfd, "evicted descriptor");
        Some(fd)
    }

    /// Stop tracking a virtual descriptor and close the real one
    ///
    /// Returns whether a descriptor was closed. Standard streams are left
    /// untouched.
    pub fn evict_and_close<P: Provider + ?Sized>(&mut self, vfd: i32, provider: &P) -> bool {
        match self.evict(vfd) {
            Some(fd) => {
                provider.close(fd);
                true
            }
            None => false,
        }
    }

    /// Iterate over `(virtual, real)` pairs in virtual order
    pub fn iter(&self) -> impl Iterator<Item = (i32, RawFd)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, &fd)| (FIRST_USER_FD + idx as i32, fd))
    }

    /// Close every tracked descriptor and discard the table
    pub fn teardown<P: Provider + ?Sized>(mut self, provider: &P) -> usize {
        let count = self.entries.len();
        for fd in self.entries.drain(..) {
            provider.close(fd);
        }
        if count > 0 {
            debug!(count, "closed leaked descriptors");
        }
        count
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FdTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdTable")
            .field("entry_count", &self.entries.len())
            .field("capacity", &MAX_TRACKED_FDS)
            .finish()
    }
}
