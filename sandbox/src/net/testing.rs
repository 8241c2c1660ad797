//! In-memory provider that records every close it is asked to perform.

use super::{Protocol, Provider};
use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

#[derive(Debug, Default)]
pub(crate) struct CallLog {
    pub closed: Vec<RawFd>,
    pub groups_closed: Vec<Vec<RawFd>>,
}

/// Hands out fake descriptor numbers and logs close calls.
///
/// Clones share the same log, so a test can keep one clone while a session
/// owns another.
#[derive(Clone)]
pub(crate) struct RecordingProvider {
    log: Rc<RefCell<CallLog>>,
    next_fd: Rc<Cell<RawFd>>,
    listen: Rc<RefCell<Option<Vec<RawFd>>>>,
    refuse_connect: Rc<Cell<bool>>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self {
            log: Rc::new(RefCell::new(CallLog::default())),
            next_fd: Rc::new(Cell::new(100)),
            listen: Rc::new(RefCell::new(None)),
            refuse_connect: Rc::new(Cell::new(false)),
        }
    }

    /// Make the next `listen_group` call return `fds`.
    pub fn set_listen_group(&self, fds: Vec<RawFd>) {
        *self.listen.borrow_mut() = Some(fds);
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.set(refuse);
    }

    pub fn closed(&self) -> Vec<RawFd> {
        self.log.borrow().closed.clone()
    }

    pub fn groups_closed(&self) -> Vec<Vec<RawFd>> {
        self.log.borrow().groups_closed.clone()
    }

    fn fresh_fd(&self) -> RawFd {
        let fd = self.next_fd.get();
        self.next_fd.set(fd + 1);
        fd
    }
}

impl Provider for RecordingProvider {
    fn connect(&self, _host: &str, _port: u16, _protocol: Protocol) -> io::Result<RawFd> {
        if self.refuse_connect.get() {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        Ok(self.fresh_fd())
    }

    fn listen_group(&self, _host: &str, _port: u16) -> io::Result<Vec<RawFd>> {
        self.listen
            .borrow_mut()
            .take()
            .ok_or_else(|| io::Error::from(io::ErrorKind::AddrInUse))
    }

    fn accept(&self, _group: &[RawFd], _wakeup: RawFd) -> io::Result<Option<RawFd>> {
        Ok(Some(self.fresh_fd()))
    }

    fn close_group(&self, group: Vec<RawFd>) {
        self.log.borrow_mut().groups_closed.push(group);
    }

    fn close(&self, fd: RawFd) {
        self.log.borrow_mut().closed.push(fd);
    }
}
