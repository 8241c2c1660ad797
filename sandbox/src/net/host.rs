use super::poll::PollFlags;
use super::{Protocol, Provider};
use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use std::io;
use std::mem::ManuallyDrop;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use tracing::{debug, warn};

pub const DEFAULT_BACKLOG: i32 = 128;

/// Provider backed by the operating system's socket calls
#[derive(Debug, Clone)]
pub struct HostProvider {
    backlog: i32,
}

impl HostProvider {
    pub fn new() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
        }
    }

    pub fn with_backlog(backlog: i32) -> Self {
        Self { backlog }
    }

    fn listen_addrs(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        if host.is_empty() || host == "*" {
            return Ok(vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            ]);
        }
        let mut addrs: Vec<SocketAddr> = Vec::new();
        for addr in (host, port).to_socket_addrs()? {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }

    fn bind_listener(&self, addr: &SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(
            Domain::for_address(*addr),
            Type::STREAM,
            Some(SockProtocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.bind(&SockAddr::from(*addr))?;
        socket.listen(self.backlog)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn connect_udp(addr: &SocketAddr) -> io::Result<UdpSocket> {
        let local = match addr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(addr)?;
        Ok(socket)
    }
}

impl Default for HostProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for HostProvider {
    fn connect(&self, host: &str, port: u16, protocol: Protocol) -> io::Result<RawFd> {
        match protocol {
            Protocol::Tcp => {
                let stream = TcpStream::connect((host, port))?;
                Ok(stream.into_raw_fd())
            }
            Protocol::Udp => {
                let mut last_err = None;
                for addr in (host, port).to_socket_addrs()? {
                    match Self::connect_udp(&addr) {
                        Ok(socket) => return Ok(socket.into_raw_fd()),
                        Err(err) => last_err = Some(err),
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to")
                }))
            }
        }
    }

    fn listen_group(&self, host: &str, port: u16) -> io::Result<Vec<RawFd>> {
        let mut group = Vec::new();
        let mut last_err = None;

        for addr in Self::listen_addrs(host, port)? {
            match self.bind_listener(&addr) {
                Ok(socket) => {
                    debug!(%addr, "listening");
                    group.push(socket.into_raw_fd());
                }
                Err(err) => {
                    warn!(%addr, error = %err, "skipping listen address");
                    last_err = Some(err);
                }
            }
        }

        if group.is_empty() {
            return Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses to listen on")
            }));
        }
        Ok(group)
    }

    fn accept(&self, group: &[RawFd], wakeup: RawFd) -> io::Result<Option<RawFd>> {
        if group.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty listen group",
            ));
        }

        // The wakeup descriptor goes first, ahead of the listeners.
        let mut pfds: Vec<libc::pollfd> = std::iter::once(wakeup)
            .chain(group.iter().copied())
            .map(|fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        loop {
            let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            if pfds[0].revents != 0 {
                debug!("accept interrupted");
                return Ok(None);
            }

            for pfd in pfds[1..].iter_mut() {
                let revents = PollFlags::from_bits_retain(pfd.revents);
                pfd.revents = 0;
                if revents.is_empty() {
                    continue;
                }
                if revents.contains(PollFlags::NVAL) {
                    return Err(io::Error::from_raw_os_error(libc::EBADF));
                }

                // The listener stays owned by the group.
                let listener = ManuallyDrop::new(unsafe { Socket::from_raw_fd(pfd.fd) });
                match listener.accept() {
                    Ok((conn, peer)) => {
                        conn.set_nonblocking(false)?;
                        debug!(peer = ?peer.as_socket(), "accepted connection");
                        return Ok(Some(conn.into_raw_fd()));
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::Interrupted
                            || err.kind() == io::ErrorKind::ConnectionAborted => {}
                    Err(err) => return Err(err),
                }
            }
        }
    }

    fn close_group(&self, group: Vec<RawFd>) {
        for fd in group {
            self.close(fd);
        }
    }

    fn close(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}
