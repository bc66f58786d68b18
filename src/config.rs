use std::time::Duration;

use crate::error::ConfigError;

/// The single core configuration record consumed by the reactor, mirroring
/// the recognised directives of `ngx_event.h`'s `ngx_event_conf_t`
/// (`original_source/src/event/ngx_event.h`): `worker_connections`, `use`,
/// `multi_accept`, `accept_mutex`, `accept_mutex_delay`, `events`,
/// `worker_aio_requests`, `timer_resolution`, `debug_connection`.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Size of the connection pool.
    pub worker_connections: usize,

    /// Number of ready entries the readiness backend's batch buffer holds.
    pub events: usize,

    /// Accept as many connections per listener wakeup as `multi_accept`
    /// allows before yielding back to `backend.wait`.
    pub multi_accept: usize,

    /// Whether this worker contends for the cross-worker accept lock.
    pub accept_mutex: bool,

    /// Retry interval used as the wait timeout while the accept lock is
    /// held by another worker.
    pub accept_mutex_delay: Duration,

    /// How many outstanding AIO-style deferred completions a worker may
    /// have in flight. The core here has no AIO backend; the field is
    /// carried for configuration-surface completeness and otherwise
    /// unused, exactly as most deployments leave it at its default.
    pub worker_aio_requests: usize,

    /// If set, `SIGALRM`-driven clock refresh cadence rather than
    /// refreshing after every `wait` return. `None` means "refresh every
    /// wait return", which is what this crate implements by default.
    pub timer_resolution: Option<Duration>,

    /// CIDR ranges for which per-connection debug logging is forced on
    /// regardless of the configured log level. Stored as raw strings; this
    /// crate does not implement CIDR matching (no protocol layer consumes
    /// it), but the field rounds out the configuration surface the core
    /// is specified to expose.
    pub debug_connection: Vec<String>,

    /// Hysteresis window for `TimerIndex::add_timer`'s re-insert
    /// suppression: exposed as a tunable rather than a hardcoded 300ms.
    pub timer_reinsert_hysteresis: Duration,
}

impl Default for ReactorConfig {
    fn default() -> ReactorConfig {
        ReactorConfig {
            worker_connections: 512,
            events: 128,
            multi_accept: 64,
            accept_mutex: true,
            accept_mutex_delay: Duration::from_millis(500),
            worker_aio_requests: 32,
            timer_resolution: None,
            debug_connection: Vec::new(),
            timer_reinsert_hysteresis: Duration::from_millis(300),
        }
    }
}

impl ReactorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_connections == 0 {
            return Err(ConfigError::ZeroWorkerConnections);
        }
        if self.events == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}
