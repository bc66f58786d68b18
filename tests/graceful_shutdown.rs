//! `SIGQUIT` drives the reactor's graceful-shutdown path: idle reusable
//! connections are reclaimed immediately, a connection with a pending,
//! non-cancelable timer is left alone until that timer actually fires, and
//! only then does the worker loop exit.

use std::io;
use std::thread;
use std::time::Duration;

use reactor_core::{ConnFlags, Direction, Reactor, ReactorConfig};

mod util;
use util::{init, make_pipe};

#[test]
fn graceful_shutdown_closes_idle_connections_and_waits_out_pending_timers() {
    init();

    let reactor_thread = thread::spawn(|| -> io::Result<(bool, bool)> {
        let mut config = ReactorConfig::default();
        config.worker_connections = 4;
        let mut reactor: Reactor = Reactor::new(config).expect("failed to construct reactor");

        let (idle_r, idle_w) = make_pipe();
        let (busy_r, busy_w) = make_pipe();

        let idle_idx = reactor.get_connection(idle_r).expect("pool has room for the idle connection");
        reactor.reusable(idle_idx, true);

        let busy_idx = reactor.get_connection(busy_r).expect("pool has room for the busy connection");
        reactor.add_timer(busy_idx, Direction::Read, Duration::from_millis(80));

        reactor.run()?;

        let idle_closed = reactor.pool().connection(idle_idx).fd == -1;
        let busy_timed_out = reactor.pool().connection(busy_idx).flags.contains(ConnFlags::TIMEDOUT);

        unsafe {
            libc::close(idle_w);
            libc::close(busy_r);
            libc::close(busy_w);
        }

        Ok((idle_closed, busy_timed_out))
    });

    // Give the reactor thread time to install its signal handlers and block
    // in its first wait before the signal arrives. Whichever thread the
    // kernel picks to run the handler on, the flag it sets is global — the
    // reactor thread observes it either by being interrupted directly or,
    // at the latest, when its own wait times out against the busy
    // connection's timer.
    thread::sleep(Duration::from_millis(60));
    let raised = unsafe { libc::kill(libc::getpid(), libc::SIGQUIT) };
    assert_eq!(raised, 0, "kill(SIGQUIT) failed: {}", io::Error::last_os_error());

    let (idle_closed, busy_timed_out) = reactor_thread
        .join()
        .expect("reactor thread panicked")
        .expect("reactor iteration failed");

    assert!(
        idle_closed,
        "an idle, reusable connection should be reclaimed as soon as graceful shutdown begins"
    );
    assert!(
        busy_timed_out,
        "a connection with a pending non-cancelable timer should still fire before the worker terminates"
    );
}
