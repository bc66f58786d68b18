//! Listening endpoints: binding, socket-option application, and the
//! accept loop.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::backend::ReadinessBackend;
use crate::error::{ConfigError, ReactorError};
use crate::reactor::Reactor;

/// Per-listener socket tuning: `SO_REUSEADDR` (always applied), optional
/// `SO_REUSEPORT`, `IPV6_V6ONLY`, receive/send buffer sizes, TCP
/// keepalive idle/interval/count, deferred-accept, TCP fastopen, and
/// `setfib`.
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    pub backlog: i32,
    pub reuseport: bool,
    pub ipv6_only: Option<bool>,
    pub recv_buf: Option<i32>,
    pub send_buf: Option<i32>,
    pub keepalive: Option<KeepaliveOptions>,
    pub deferred_accept: bool,
    pub fastopen: Option<i32>,
    /// FreeBSD-only `SO_SETFIB`; a documented no-op on this Linux-only
    /// backend rather than a silently dropped field.
    pub setfib: Option<i32>,
}

impl ListenerOptions {
    pub fn with_backlog(backlog: i32) -> ListenerOptions {
        ListenerOptions {
            backlog,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeepaliveOptions {
    pub idle: Duration,
    pub interval: Duration,
    pub count: i32,
}

/// A bound, listening endpoint. `fd == -1` until
/// [`ListenerSet::open_listening_sockets`] materializes it.
pub struct Listener<B: ReadinessBackend> {
    pub addr: SocketAddr,
    pub options: ListenerOptions,
    pub fd: RawFd,
    pub open: bool,
    pub accept_handler: Option<Box<dyn FnMut(&mut Reactor<B>, usize)>>,
}

/// The set of listeners a worker accepts on. Not part of the connection
/// pool: on accept, a listener allocates from the pool, it does not live
/// in it.
pub struct ListenerSet<B: ReadinessBackend> {
    listeners: Vec<Listener<B>>,
}

impl<B: ReadinessBackend> ListenerSet<B> {
    pub fn new() -> ListenerSet<B> {
        ListenerSet { listeners: Vec::new() }
    }

    /// `create_listening(addr)`: record an intent to listen; returns the
    /// index used to address this listener afterward.
    pub fn create_listening(&mut self, addr: SocketAddr, options: ListenerOptions) -> usize {
        let idx = self.listeners.len();
        self.listeners.push(Listener {
            addr,
            options,
            fd: -1,
            open: false,
            accept_handler: None,
        });
        idx
    }

    /// As `create_listening`, but parses a textual address the way a
    /// `listen` configuration directive supplies one. A malformed address
    /// is a startup-time configuration error (§7), reported as
    /// [`crate::error::ConfigError::BadListenAddress`] rather than a bare
    /// `AddrParseError`.
    pub fn create_listening_str(&mut self, addr: &str, options: ListenerOptions) -> Result<usize, ConfigError> {
        let parsed: SocketAddr = addr
            .parse()
            .map_err(|err| ConfigError::BadListenAddress(addr.to_string(), err))?;
        Ok(self.create_listening(parsed, options))
    }

    pub fn set_accept_handler<F>(&mut self, idx: usize, handler: F)
    where
        F: FnMut(&mut Reactor<B>, usize) + 'static,
    {
        self.listeners[idx].accept_handler = Some(Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn get(&self, idx: usize) -> &Listener<B> {
        &self.listeners[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Listener<B> {
        &mut self.listeners[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Listener<B>)> {
        self.listeners.iter().enumerate()
    }

    /// `open_listening_sockets`: create, configure, bind, and listen on
    /// every registered-but-unopened listener. A failure is wrapped with
    /// the offending listener's address into
    /// [`ReactorError::ListenSetup`], the startup-time configuration-error
    /// path §7 specifies for a bad listen address.
    pub fn open_listening_sockets(&mut self) -> Result<(), ReactorError> {
        for listener in &mut self.listeners {
            if listener.open {
                continue;
            }
            let fd = open_one(listener.addr, &listener.options).map_err(|source| ReactorError::ListenSetup {
                addr: listener.addr,
                source,
            })?;
            listener.fd = fd;
            listener.open = true;
        }
        Ok(())
    }
}

impl<B: ReadinessBackend> Default for ListenerSet<B> {
    fn default() -> Self {
        ListenerSet::new()
    }
}

fn open_one(addr: SocketAddr, opts: &ListenerOptions) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0
    ))?;
    // SAFETY: `socket(2)` just returned a valid owned fd.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    set_bool_opt(owned.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, true)?;
    if opts.reuseport {
        set_bool_opt(owned.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, true)?;
    }
    if let SocketAddr::V6(_) = addr {
        if let Some(only) = opts.ipv6_only {
            set_bool_opt(owned.as_raw_fd(), libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, only)?;
        }
    }
    if let Some(size) = opts.recv_buf {
        set_int_opt(owned.as_raw_fd(), libc::SOL_SOCKET, libc::SO_RCVBUF, size)?;
    }
    if let Some(size) = opts.send_buf {
        set_int_opt(owned.as_raw_fd(), libc::SOL_SOCKET, libc::SO_SNDBUF, size)?;
    }
    if let Some(ka) = &opts.keepalive {
        set_bool_opt(owned.as_raw_fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, true)?;
        set_int_opt(
            owned.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_KEEPIDLE,
            ka.idle.as_secs() as i32,
        )?;
        set_int_opt(
            owned.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_KEEPINTVL,
            ka.interval.as_secs() as i32,
        )?;
        set_int_opt(owned.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_KEEPCNT, ka.count)?;
    }
    if opts.deferred_accept {
        // `TCP_DEFER_ACCEPT` takes the number of seconds to defer; 1 is
        // the conventional "just wait for actual data" value nginx uses.
        let _ = set_int_opt(owned.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, 1);
    }
    if let Some(queue_len) = opts.fastopen {
        let _ = set_int_opt(owned.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_FASTOPEN, queue_len);
    }
    // `setfib` is FreeBSD-only; this backend targets Linux only, so it's a
    // documented no-op rather than a silently ignored option.
    let _ = opts.setfib;

    let (storage, len) = encode_sockaddr(addr);
    syscall!(bind(
        owned.as_raw_fd(),
        &storage as *const _ as *const libc::sockaddr,
        len
    ))?;
    let backlog = if opts.backlog > 0 { opts.backlog } else { 1024 };
    syscall!(listen(owned.as_raw_fd(), backlog))?;

    // The fd now belongs to the `Listener` record; release it from the
    // `OwnedFd` so it isn't closed when this function returns.
    Ok(owned.into_raw_fd())
}

fn set_bool_opt(fd: RawFd, level: i32, name: i32, on: bool) -> io::Result<()> {
    let val: libc::c_int = if on { 1 } else { 0 };
    syscall!(setsockopt(
        fd,
        level,
        name,
        &val as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t
    ))
    .map(|_| ())
}

fn set_int_opt(fd: RawFd, level: i32, name: i32, value: i32) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t
    ))
    .map(|_| ())
}

/// Encode a `std::net::SocketAddr` into a `libc::sockaddr_storage`,
/// avoiding any reliance on `std`'s internal memory layout (unlike some
/// historical approaches that transmute `SocketAddrV4` directly).
pub(crate) fn encode_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// The inverse of [`encode_sockaddr`], used to decode a peer address
/// filled in by `accept4(2)`.
pub(crate) fn decode_sockaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

/// Raw, non-blocking `accept4(2)` with `SOCK_NONBLOCK | SOCK_CLOEXEC`, used
/// by the reactor's accept loop (kept free-standing so it has no
/// dependency on `Reactor`'s generic parameter).
pub(crate) fn accept_one(listener_fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = syscall!(accept4(
        listener_fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
    ))?;
    let addr = decode_sockaddr(&storage)?;
    Ok((fd, addr))
}

/// `getsockname(2)` on an already-connected fd, used to lazily fill a
/// connection's local address on first access (spec.md §3: "local address
/// (lazily filled)" — nothing populates it at accept time, matching
/// `ngx_connection_local_sockaddr`'s own on-demand fill).
pub(crate) fn get_local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len))?;
    decode_sockaddr(&storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::epoll::Epoll;

    #[test]
    fn create_listening_str_rejects_a_malformed_address() {
        let mut listeners: ListenerSet<Epoll> = ListenerSet::new();
        let err = listeners
            .create_listening_str("not-an-address", ListenerOptions::default())
            .expect_err("a malformed address must be rejected, not panic on .parse().unwrap()");
        assert!(matches!(err, ConfigError::BadListenAddress(addr, _) if addr == "not-an-address"));
    }

    #[test]
    fn create_listening_str_accepts_a_well_formed_address() {
        let mut listeners: ListenerSet<Epoll> = ListenerSet::new();
        let idx = listeners
            .create_listening_str("127.0.0.1:0", ListenerOptions::default())
            .expect("a well-formed address should parse");
        assert_eq!(idx, 0);
    }

    #[test]
    fn open_listening_sockets_wraps_bind_failure_with_the_offending_address() {
        // Binding the same fixed port twice without SO_REUSEPORT makes the
        // second bind fail deterministically, exercising the
        // ReactorError::ListenSetup wrapping path without needing a
        // privileged or already-in-use external port.
        let addr: SocketAddr = "127.0.0.1:18999".parse().unwrap();

        let mut first: ListenerSet<Epoll> = ListenerSet::new();
        first.create_listening(addr, ListenerOptions::with_backlog(16));
        first.open_listening_sockets().expect("first bind should succeed");

        let mut second: ListenerSet<Epoll> = ListenerSet::new();
        second.create_listening(addr, ListenerOptions::with_backlog(16));
        let err = second
            .open_listening_sockets()
            .expect_err("binding the same address twice without SO_REUSEPORT must fail");
        match err {
            ReactorError::ListenSetup { addr: failed_addr, .. } => assert_eq!(failed_addr, addr),
            other => panic!("expected ReactorError::ListenSetup, got {other:?}"),
        }

        unsafe { libc::close(first.get(0).fd) };
    }
}
