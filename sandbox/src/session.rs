//! Script-facing session: every operation takes and returns virtual descriptors.

use crate::net::fdtable::{FdTable, FIRST_USER_FD};
use crate::net::host::{HostProvider, DEFAULT_BACKLOG};
use crate::net::poll::{self, Interrupter, PollFlags, Wakeup};
use crate::net::{ListenId, NetError, NetResult, Protocol, Provider};
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use tracing::{debug, debug_span, warn};

/// Largest byte count a single `recv`/`read` call may ask for
pub const MAX_READ_LEN: usize = 64 * 1024;

/// Configuration options for a script session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Name used for the session's tracing span
    pub label: String,
    /// Byte count for `recv`/`read` calls that do not pass a length.
    /// Must lie in `1..=MAX_READ_LEN`.
    pub default_read_len: usize,
    /// Backlog for listening sockets opened by the host provider
    pub listen_backlog: i32,
}

impl SessionOptions {
    pub fn with_label(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            label: "script".to_string(),
            default_read_len: 1,
            listen_backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Result of a [`Session::poll`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Number of descriptors with a non-empty result mask
    pub ready: usize,
    /// `(virtual descriptor, result mask)` pairs in request order
    pub events: Vec<(i32, PollFlags)>,
}

impl PollOutcome {
    /// Result mask reported for `vfd`, empty if it was not watched
    pub fn readiness(&self, vfd: i32) -> PollFlags {
        self.events
            .iter()
            .filter(|(fd, _)| *fd == vfd)
            .fold(PollFlags::empty(), |acc, (_, flags)| acc | *flags)
    }
}

/// Per-script networking context
///
/// Owns the descriptor table, the open listen groups and the wakeup channel.
/// Dropping the session closes every descriptor it still tracks.
pub struct Session<P: Provider = HostProvider> {
    provider: P,
    table: FdTable,
    groups: BTreeMap<ListenId, Vec<RawFd>>,
    next_group: u64,
    wakeup: Wakeup,
    interrupter: Interrupter,
    options: SessionOptions,
}

impl Session<HostProvider> {
    /// Create a session backed by the operating system
    pub fn new(options: SessionOptions) -> NetResult<Self> {
        let provider = HostProvider::with_backlog(options.listen_backlog);
        Self::with_provider(provider, options)
    }
}

impl<P: Provider> Session<P> {
    pub fn with_provider(provider: P, options: SessionOptions) -> NetResult<Self> {
        let (wakeup, interrupter) = poll::wakeup_channel()?;
        debug!(label = %options.label, "session created");
        Ok(Self {
            provider,
            table: FdTable::new(),
            groups: BTreeMap::new(),
            next_group: 0,
            wakeup,
            interrupter,
            options,
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn table(&self) -> &FdTable {
        &self.table
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Handle the host uses to abort waits in this session
    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    fn resolve(&self, vfd: i32) -> NetResult<RawFd> {
        self.table.resolve(vfd).ok_or(NetError::BadDescriptor(vfd))
    }

    /// Length for a read, rejected before anything is allocated
    fn read_len(&self, len: Option<usize>) -> NetResult<usize> {
        let len = len.unwrap_or(self.options.default_read_len);
        if len == 0 || len > MAX_READ_LEN {
            return Err(NetError::ReadLength(len));
        }
        Ok(len)
    }

    fn is_listen_member(&self, fd: RawFd) -> bool {
        self.groups.values().any(|group| group.contains(&fd))
    }

    /// Open a listen group and admit all of its members
    ///
    /// Admission is all-or-nothing: if any member cannot be tracked, the
    /// members admitted so far are evicted and the whole group is closed.
    pub fn listen_tcp(&mut self, host: &str, port: u16) -> NetResult<ListenId> {
        let _span = debug_span!("listen_tcp", label = %self.options.label).entered();
        let listen_err = |source: io::Error| NetError::Listen {
            host: host.to_string(),
            port,
            source,
        };

        let fds = self.provider.listen_group(host, port).map_err(listen_err)?;

        let mut rejected = None;
        for &fd in &fds {
            if let Err(err) = self.table.admit(fd) {
                rejected = Some(err);
                break;
            }
        }
        if let Some(err) = rejected {
            for &fd in fds.iter().rev() {
                if let Some(vfd) = self.table.reverse_resolve(fd) {
                    self.table.evict(vfd);
                }
            }
            warn!(host, port, error = %err, "rejecting listen group");
            self.provider.close_group(fds);
            return Err(listen_err(io::Error::other(err)));
        }

        let id = ListenId(self.next_group);
        self.next_group += 1;
        debug!(%id, members = fds.len(), "listen group opened");
        self.groups.insert(id, fds);
        Ok(id)
    }

    /// Virtual descriptors of a listen group's members
    pub fn listen_fds(&self, id: ListenId) -> NetResult<Vec<i32>> {
        let group = self.groups.get(&id).ok_or(NetError::UnknownListenGroup(id))?;
        Ok(group
            .iter()
            .filter_map(|&fd| self.table.reverse_resolve(fd))
            .collect())
    }

    /// Accept one connection from a listen group
    ///
    /// Blocks until a member has a pending connection. Fails with
    /// [`NetError::Interrupted`] once the session is interrupted.
    pub fn accept(&mut self, id: ListenId) -> NetResult<i32> {
        let group = self.groups.get(&id).ok_or(NetError::UnknownListenGroup(id))?;
        let Some(fd) = self.provider.accept(group, self.wakeup.as_raw_fd())? else {
            debug!(label = %self.options.label, %id, "accept interrupted");
            return Err(NetError::Interrupted);
        };
        self.table.admit_or_close(fd, &self.provider)
    }

    /// Close a listen group
    ///
    /// Members are evicted without closing; the group is then closed with a
    /// single batch close.
    pub fn close_listen(&mut self, id: ListenId) -> NetResult<()> {
        let fds = self
            .groups
            .remove(&id)
            .ok_or(NetError::UnknownListenGroup(id))?;
        for &fd in &fds {
            if let Some(vfd) = self.table.reverse_resolve(fd) {
                self.table.evict(vfd);
            }
        }
        debug!(%id, "listen group closed");
        self.provider.close_group(fds);
        Ok(())
    }

    /// Open an outbound connection
    pub fn connect(&mut self, host: &str, port: u16, protocol: Protocol) -> NetResult<i32> {
        let fd = self
            .provider
            .connect(host, port, protocol)
            .map_err(|source| NetError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;
        self.table.admit_or_close(fd, &self.provider)
    }

    pub fn connect_tcp(&mut self, host: &str, port: u16) -> NetResult<i32> {
        self.connect(host, port, Protocol::Tcp)
    }

    /// Close a virtual descriptor
    ///
    /// Standard streams are never closed. Listen group members must be closed
    /// through [`Session::close_listen`].
    pub fn close(&mut self, vfd: i32) -> NetResult<()> {
        if (0..FIRST_USER_FD).contains(&vfd) {
            return Ok(());
        }
        let fd = self.resolve(vfd)?;
        if self.is_listen_member(fd) {
            return Err(NetError::ListenMember(vfd));
        }
        self.table.evict_and_close(vfd, &self.provider);
        Ok(())
    }

    /// Send up to `len` bytes of `data` (all of it by default)
    pub fn send(&self, vfd: i32, data: &[u8], len: Option<usize>) -> NetResult<usize> {
        let fd = self.resolve(vfd)?;
        let len = len.map_or(data.len(), |len| len.min(data.len()));
        let ret = unsafe { libc::send(fd, data.as_ptr().cast(), len, SEND_FLAGS) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(ret as usize)
    }

    /// Receive up to `len` bytes; `None` only at end of stream
    ///
    /// `len` must lie in `1..=MAX_READ_LEN`.
    pub fn recv(&self, vfd: i32, len: Option<usize>) -> NetResult<Option<Vec<u8>>> {
        let fd = self.resolve(vfd)?;
        let mut buf = vec![0u8; self.read_len(len)?];
        let ret = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        finish_read(buf, ret)
    }

    /// Write up to `len` bytes of `data` (all of it by default)
    pub fn write(&self, vfd: i32, data: &[u8], len: Option<usize>) -> NetResult<usize> {
        let fd = self.resolve(vfd)?;
        let len = len.map_or(data.len(), |len| len.min(data.len()));
        let ret = unsafe { libc::write(fd, data.as_ptr().cast(), len) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(ret as usize)
    }

    /// Read up to `len` bytes; `None` only at end of file
    pub fn read(&self, vfd: i32, len: Option<usize>) -> NetResult<Option<Vec<u8>>> {
        let fd = self.resolve(vfd)?;
        let mut buf = vec![0u8; self.read_len(len)?];
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        finish_read(buf, ret)
    }

    /// Local address of a socket descriptor
    pub fn local_addr(&self, vfd: i32) -> NetResult<SocketAddr> {
        let fd = self.resolve(vfd)?;
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        SockRef::from(&borrowed)
            .local_addr()?
            .as_socket()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket").into()
            })
    }

    /// Wait until one of `interests` is ready or the session is interrupted
    ///
    /// Only `IN`, `PRI` and `OUT` are honoured as interests. Descriptors that
    /// do not resolve are skipped by the OS and report an empty mask.
    pub fn poll(&mut self, interests: &[(i32, PollFlags)]) -> NetResult<PollOutcome> {
        let watched: Vec<(RawFd, PollFlags)> = interests
            .iter()
            .map(|&(vfd, events)| {
                (
                    self.table.resolve(vfd).unwrap_or(-1),
                    events & PollFlags::INTEREST,
                )
            })
            .collect();

        let report = poll::wait(&self.wakeup, &watched)?;
        if report.interrupted {
            debug!(label = %self.options.label, "wait interrupted");
            return Err(NetError::Interrupted);
        }

        Ok(PollOutcome {
            ready: report.ready,
            events: interests
                .iter()
                .map(|&(vfd, _)| vfd)
                .zip(report.revents)
                .collect(),
        })
    }
}

impl<P: Provider> Drop for Session<P> {
    fn drop(&mut self) {
        let groups = std::mem::take(&mut self.groups);
        for (id, fds) in groups {
            for &fd in &fds {
                if let Some(vfd) = self.table.reverse_resolve(fd) {
                    self.table.evict(vfd);
                }
            }
            debug!(%id, "closing listen group at teardown");
            self.provider.close_group(fds);
        }

        let closed = std::mem::take(&mut self.table).teardown(&self.provider);
        debug!(label = %self.options.label, closed, "session torn down");
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

fn finish_read(mut buf: Vec<u8>, ret: isize) -> NetResult<Option<Vec<u8>>> {
    if ret < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if ret == 0 {
        return Ok(None);
    }
    buf.truncate(ret as usize);
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::RecordingProvider;

    fn session(provider: &RecordingProvider) -> Session<RecordingProvider> {
        Session::with_provider(provider.clone(), SessionOptions::with_label("test")).unwrap()
    }

    #[test]
    fn test_options_default() {
        let options = SessionOptions::default();
        assert_eq!(options.default_read_len, 1);
        assert_eq!(options.listen_backlog, DEFAULT_BACKLOG);
        assert_eq!(options.label, "script");
    }

    #[test]
    fn test_options_from_json() {
        let options: SessionOptions =
            serde_json::from_str(r#"{ "label": "web", "default_read_len": 512 }"#).unwrap();
        assert_eq!(options.label, "web");
        assert_eq!(options.default_read_len, 512);
        assert_eq!(options.listen_backlog, DEFAULT_BACKLOG);
    }

    #[test]
    fn test_connect_and_close() {
        let provider = RecordingProvider::new();
        let mut session = session(&provider);

        let vfd = session.connect_tcp("example.invalid", 80).unwrap();
        assert_eq!(vfd, 3);
        assert_eq!(session.table().resolve(vfd), Some(100));

        session.close(vfd).unwrap();
        assert_eq!(provider.closed(), vec![100]);
        assert_eq!(session.table().resolve(vfd), None);
        assert!(matches!(session.close(vfd), Err(NetError::BadDescriptor(3))));
    }

    #[test]
    fn test_close_standard_stream_is_noop() {
        let provider = RecordingProvider::new();
        let mut session = session(&provider);
        session.close(0).unwrap();
        session.close(2).unwrap();
        drop(session);
        assert!(provider.closed().is_empty());
    }

    #[test]
    fn test_connect_failure() {
        let provider = RecordingProvider::new();
        provider.refuse_connect(true);
        let mut session = session(&provider);

        let err = session.connect_tcp("localhost", 1).unwrap_err();
        assert_eq!(err.to_string(), "Cannot connect to localhost:1");
        assert!(session.table().is_empty());
    }

    #[test]
    fn test_listen_group_scenario() {
        let provider = RecordingProvider::new();
        provider.set_listen_group(vec![20, 21]);
        let mut session = session(&provider);

        let id = session.listen_tcp("*", 8080).unwrap();
        assert_eq!(session.listen_fds(id).unwrap(), vec![3, 4]);

        session.close_listen(id).unwrap();
        assert_eq!(provider.groups_closed(), vec![vec![20, 21]]);
        assert!(provider.closed().is_empty());
        assert!(session.table().is_empty());
        assert!(matches!(
            session.listen_fds(id),
            Err(NetError::UnknownListenGroup(_))
        ));
    }

    #[test]
    fn test_listen_group_all_or_nothing() {
        let provider = RecordingProvider::new();
        let mut session = session(&provider);
        for _ in 0..63 {
            session.connect_tcp("peer", 1).unwrap();
        }

        provider.set_listen_group(vec![20, 21]);
        let err = session.listen_tcp("*", 8080).unwrap_err();
        assert!(matches!(err, NetError::Listen { port: 8080, .. }));
        assert_eq!(provider.groups_closed(), vec![vec![20, 21]]);
        assert_eq!(session.table().len(), 63);
        assert_eq!(session.table().reverse_resolve(20), None);
    }

    #[test]
    fn test_listen_failure() {
        let provider = RecordingProvider::new();
        let mut session = session(&provider);
        let err = session.listen_tcp("localhost", 80).unwrap_err();
        assert_eq!(err.to_string(), "Cannot listen on localhost:80");
    }

    #[test]
    fn test_accept_admits() {
        let provider = RecordingProvider::new();
        provider.set_listen_group(vec![20]);
        let mut session = session(&provider);

        let id = session.listen_tcp("127.0.0.1", 9000).unwrap();
        let conn = session.accept(id).unwrap();
        assert_eq!(conn, 4);
        assert_eq!(session.table().resolve(conn), Some(100));
    }

    #[test]
    fn test_accept_when_full_closes() {
        let provider = RecordingProvider::new();
        provider.set_listen_group(vec![20]);
        let mut session = session(&provider);
        let id = session.listen_tcp("127.0.0.1", 9000).unwrap();
        for _ in 0..63 {
            session.connect_tcp("peer", 1).unwrap();
        }

        assert!(matches!(session.accept(id), Err(NetError::TableFull(_))));
        // connects took 100..=162, the rejected accept got 163
        assert_eq!(provider.closed(), vec![163]);
    }

    #[test]
    fn test_close_listen_member_rejected() {
        let provider = RecordingProvider::new();
        provider.set_listen_group(vec![20]);
        let mut session = session(&provider);
        let id = session.listen_tcp("127.0.0.1", 9000).unwrap();
        let vfd = session.listen_fds(id).unwrap()[0];

        assert!(matches!(session.close(vfd), Err(NetError::ListenMember(3))));
        assert!(provider.closed().is_empty());
    }

    #[test]
    fn test_bad_descriptor_io() {
        let provider = RecordingProvider::new();
        let session = session(&provider);
        assert!(matches!(
            session.send(7, b"x", None),
            Err(NetError::BadDescriptor(7))
        ));
        assert!(matches!(session.recv(-4, None), Err(NetError::BadDescriptor(-4))));
    }

    #[test]
    fn test_read_length_bounds() {
        let provider = RecordingProvider::new();
        let mut session = session(&provider);
        let vfd = session.connect_tcp("peer", 1).unwrap();

        for len in [0, MAX_READ_LEN + 1, usize::MAX] {
            assert!(matches!(
                session.recv(vfd, Some(len)),
                Err(NetError::ReadLength(l)) if l == len
            ));
            assert!(matches!(
                session.read(vfd, Some(len)),
                Err(NetError::ReadLength(l)) if l == len
            ));
        }
        // Bad descriptors are still reported first.
        assert!(matches!(
            session.recv(9, Some(usize::MAX)),
            Err(NetError::BadDescriptor(9))
        ));
    }

    #[test]
    fn test_zero_default_read_len_rejected() {
        let provider = RecordingProvider::new();
        let options = SessionOptions {
            default_read_len: 0,
            ..SessionOptions::default()
        };
        let mut session = Session::with_provider(provider.clone(), options).unwrap();
        let vfd = session.connect_tcp("peer", 1).unwrap();

        let err = session.recv(vfd, None).unwrap_err();
        assert!(matches!(err, NetError::ReadLength(0)));
        assert_eq!(err.to_string(), "read length 0 is out of range");
    }

    #[test]
    fn test_teardown_closes_everything() {
        let provider = RecordingProvider::new();
        provider.set_listen_group(vec![20, 21]);
        let mut session = session(&provider);
        session.listen_tcp("*", 8080).unwrap();
        session.connect_tcp("a", 1).unwrap();
        session.connect_tcp("b", 1).unwrap();
        session.connect_tcp("c", 1).unwrap();

        drop(session);
        assert_eq!(provider.groups_closed(), vec![vec![20, 21]]);
        assert_eq!(provider.closed(), vec![100, 101, 102]);
    }

    #[test]
    fn test_poll_interrupted() {
        let provider = RecordingProvider::new();
        let mut session = session(&provider);
        session.interrupter().interrupt().unwrap();

        let err = session.poll(&[(9, PollFlags::IN)]).unwrap_err();
        assert!(matches!(err, NetError::Interrupted));
        assert_eq!(err.to_string(), "Interrupted.");
    }

    #[test]
    fn test_readiness_merges_duplicates() {
        let outcome = PollOutcome {
            ready: 2,
            events: vec![(3, PollFlags::IN), (4, PollFlags::OUT), (3, PollFlags::HUP)],
        };
        assert_eq!(outcome.readiness(3), PollFlags::IN | PollFlags::HUP);
        assert_eq!(outcome.readiness(9), PollFlags::empty());
    }
}
