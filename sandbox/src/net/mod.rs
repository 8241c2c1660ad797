pub mod fdtable;
pub mod host;
pub mod poll;
#[cfg(test)]
pub(crate) mod testing;

use std::io;
use std::os::fd::RawFd;
use std::result::Result as StdResult;
use thiserror::Error;

/// Handle to a listen group opened by a session.
///
/// Listen groups are not descriptors themselves; their members are admitted
/// into the session's descriptor table individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenId(pub(crate) u64);

impl std::fmt::Display for ListenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listen#{}", self.0)
    }
}

/// Errors surfaced to the script caller
#[derive(Debug, Error)]
pub enum NetError {
    #[error("descriptor table is full ({0} entries)")]
    TableFull(usize),
    #[error("descriptor {0} is a standard stream and cannot be tracked")]
    Reserved(RawFd),
    #[error("bad descriptor {0}")]
    BadDescriptor(i32),
    #[error("unknown listen group {0}")]
    UnknownListenGroup(ListenId),
    #[error("descriptor {0} belongs to a listen group")]
    ListenMember(i32),
    #[error("Cannot listen on {host}:{port}")]
    Listen {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("Cannot connect to {host}:{port}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("read length {0} is out of range")]
    ReadLength(usize),
    #[error("Interrupted.")]
    Interrupted,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type NetResult<T> = StdResult<T, NetError>;

/// Transport used for outbound connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Stream socket (`SOCK_STREAM`)
    Tcp,
    /// Connected datagram socket (`SOCK_DGRAM`)
    Udp,
}

/// Host routines that create and destroy real descriptors.
///
/// A provider owns the OS-level existence of every descriptor it hands out
/// until the descriptor table asks it to close one. It must never hand out a
/// descriptor value that a table still tracks.
pub trait Provider {
    /// Open an outbound connection.
    fn connect(&self, host: &str, port: u16, protocol: Protocol) -> io::Result<RawFd>;

    /// Open a group of listening sockets (for instance one per address family).
    ///
    /// The returned group is never empty.
    fn listen_group(&self, host: &str, port: u16) -> io::Result<Vec<RawFd>>;

    /// Block until one member of `group` has a pending connection and accept it.
    ///
    /// Returns `None` without accepting once `wakeup` becomes readable.
    fn accept(&self, group: &[RawFd], wakeup: RawFd) -> io::Result<Option<RawFd>>;

    /// Close every member of a listen group.
    fn close_group(&self, group: Vec<RawFd>);

    /// Close a single descriptor.
    fn close(&self, fd: RawFd);
}
