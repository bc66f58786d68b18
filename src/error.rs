use std::io;

/// Errors surfaced by the reactor's own logic, as opposed to raw syscall
/// failures (those stay as `io::Error`, consistent with how `mio` threads
/// `io::Result` through its backend).
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// The connection pool's freelist is empty and the reusable LRU had
    /// nothing left to reclaim.
    #[error("no free connections available")]
    NoFreeConnections,

    /// `wait` on the readiness backend failed with something other than
    /// `EINTR`. Logged at `alert` and absorbed by the reactor loop; exposed
    /// here so callers embedding the reactor can observe it too.
    #[error("readiness backend wait failed: {0}")]
    BackendWait(#[source] io::Error),

    /// A listening socket could not be materialized (bind/listen/setsockopt
    /// failure). Startup-time configuration errors are fatal.
    #[error("failed to open listening socket on {addr}: {source}")]
    ListenSetup {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The process-shared accept mutex could not be created.
    #[error("failed to initialize accept mutex: {0}")]
    AcceptMutexInit(#[source] io::Error),

    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Lets callers that thread a bare `io::Result` through their own `main`
/// (as `demos/reactor_echo.rs` does) still use `?` against a
/// `ReactorError`-returning call without matching on the enum themselves.
impl From<ReactorError> for io::Error {
    fn from(err: ReactorError) -> io::Error {
        io::Error::new(io::ErrorKind::Other, err)
    }
}

/// Startup-time configuration errors. Kept distinct from [`ReactorError`]
/// because these are always fatal (§7: "Configuration error at startup ->
/// Abort process with a diagnostic"), never absorbed by the loop.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("worker_connections must be greater than zero")]
    ZeroWorkerConnections,

    #[error("invalid listen address {0:?}: {1}")]
    BadListenAddress(String, #[source] std::net::AddrParseError),

    #[error("events (batch size) must be greater than zero")]
    ZeroBatchSize,
}
