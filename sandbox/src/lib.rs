//! Sandboxed socket descriptors for embedded scripts.
//!
//! A [`Session`] hands scripts small virtual descriptor numbers instead of
//! raw OS descriptors. Every descriptor a script can name was opened or
//! accepted by its own session, and all of them are closed when the session
//! is dropped.

#[cfg(unix)]
pub mod net;
#[cfg(unix)]
pub mod session;

#[cfg(unix)]
pub use net::{
    fdtable::{FdTable, FIRST_USER_FD, MAX_TRACKED_FDS},
    host::HostProvider,
    poll::{Interrupter, PollFlags},
    ListenId, NetError, NetResult, Protocol, Provider,
};
#[cfg(unix)]
pub use session::{PollOutcome, Session, SessionOptions, MAX_READ_LEN};
