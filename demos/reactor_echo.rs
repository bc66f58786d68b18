//! A minimal echo server built directly on `reactor_core`, in the style of
//! `tcp_server.rs`: one listener, one read/write handler pair installed
//! per accepted connection, no protocol framing.

use std::io::{self, Write};
use std::net::SocketAddr;

use reactor_core::{ListenerOptions, ReactorConfig};

fn main() -> io::Result<()> {
    env_logger::init();

    let addr: SocketAddr = "127.0.0.1:13265".parse().unwrap();
    let mut reactor: reactor_core::Reactor = reactor_core::Reactor::new(ReactorConfig::default())
        .expect("failed to construct reactor");

    let listener_idx = reactor.create_listening(addr, ListenerOptions::with_backlog(1024));
    reactor.open_listening_sockets()?;

    reactor
        .listeners_mut()
        .set_accept_handler(listener_idx, |reactor, idx| {
            println!("accepted connection #{}", reactor.pool().connection(idx).number);
            reactor.set_read_handler(idx, read_handler);
        });

    println!("listening on {addr}, connect with `nc 127.0.0.1 13265`");
    reactor.run()
}

fn read_handler(reactor: &mut reactor_core::Reactor, idx: usize) {
    let fd = reactor.pool().connection(idx).fd;
    if fd == -1 {
        return;
    }

    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        match n {
            0 => {
                reactor.close_connection(idx);
                return;
            }
            n if n > 0 => {
                let echoed = echo_back(fd, &buf[..n as usize]);
                if echoed.is_err() {
                    reactor.close_connection(idx);
                    return;
                }
                // No protocol layer owns a "request complete" boundary at
                // this level, so the echo handler bumps the counter itself.
                reactor.pool_mut().connection_mut(idx).requests += 1;
                reactor.reusable(idx, true);
            }
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                reactor.close_connection(idx);
                return;
            }
        }
    }

    if let Err(err) = reactor.handle_read(idx) {
        eprintln!("failed to re-arm read interest: {err}");
        reactor.close_connection(idx);
    }
}

fn echo_back(fd: i32, data: &[u8]) -> io::Result<()> {
    // SAFETY: `fd` is a valid, open, non-blocking socket for the duration
    // of this call (the caller holds the connection's slot).
    let mut stream = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fd) };
    let result = stream.write_all(data);
    // The fd is owned by the connection pool, not this temporary `File`;
    // leak it back out so `Drop` doesn't close it underneath the reactor.
    std::mem::forget(stream);
    result
}
