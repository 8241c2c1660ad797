//! Multiplexed wait over session descriptors, raced against a host wakeup channel.

use bitflags::bitflags;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

bitflags! {
    /// Interest and result masks for [`crate::Session::poll`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollFlags: libc::c_short {
        const IN = libc::POLLIN;
        const PRI = libc::POLLPRI;
        const OUT = libc::POLLOUT;
        const ERR = libc::POLLERR;
        const HUP = libc::POLLHUP;
        const NVAL = libc::POLLNVAL;
    }
}

impl PollFlags {
    /// Bits a script may ask to wait for. The rest are result-only.
    pub const INTEREST: PollFlags = PollFlags::IN.union(PollFlags::PRI).union(PollFlags::OUT);
}

/// Cross-thread handle that aborts a session's pending and future waits
#[derive(Debug, Clone)]
pub struct Interrupter {
    tx: Arc<UnixStream>,
}

impl Interrupter {
    /// Signal the session. Never blocks.
    pub fn interrupt(&self) -> io::Result<()> {
        match (&*self.tx).write(&[0]) {
            Ok(_) => Ok(()),
            // A wakeup byte is already pending
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Receiving end of the wakeup channel, owned by the session
#[derive(Debug)]
pub struct Wakeup {
    rx: UnixStream,
}

impl AsRawFd for Wakeup {
    fn as_raw_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}

/// Create a connected wakeup pair.
///
/// The receiving side is never drained, so once signalled every later wait
/// reports interruption.
pub fn wakeup_channel() -> io::Result<(Wakeup, Interrupter)> {
    let (rx, tx) = UnixStream::pair()?;
    tx.set_nonblocking(true)?;
    Ok((Wakeup { rx }, Interrupter { tx: Arc::new(tx) }))
}

/// Outcome of a single [`wait`]
#[derive(Debug)]
pub struct WaitReport {
    /// Number of watched entries with a non-empty result mask
    pub ready: usize,
    /// Result masks, in the order of the watched slice
    pub revents: Vec<PollFlags>,
    /// The wakeup channel fired
    pub interrupted: bool,
}

/// Block until a watched descriptor is ready or the wakeup channel fires.
///
/// Negative descriptors in `watched` are ignored by the OS and come back with
/// an empty mask.
pub fn wait(wakeup: &Wakeup, watched: &[(RawFd, PollFlags)]) -> io::Result<WaitReport> {
    let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(watched.len() + 1);
    pfds.push(libc::pollfd {
        fd: wakeup.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    });
    pfds.extend(watched.iter().map(|&(fd, events)| libc::pollfd {
        fd,
        events: events.bits(),
        revents: 0,
    }));

    loop {
        let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
        if ret >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let revents: Vec<PollFlags> = pfds[1..]
        .iter()
        .map(|pfd| PollFlags::from_bits_retain(pfd.revents))
        .collect();
    Ok(WaitReport {
        ready: revents.iter().filter(|r| !r.is_empty()).count(),
        revents,
        interrupted: pfds[0].revents != 0,
    })
}
