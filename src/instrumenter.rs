//! Pluggable observation hooks for connection and request lifecycle events.
//!
//! The server never requires an [`Instrumenter`] to function: the default
//! implementation ([`LogInstrumenter`]) forwards every event to the [`log`]
//! crate at debug level, and [`NoopInstrumenter`] is available for callers
//! who want neither counting nor logging overhead.

use std::net::SocketAddr;

/// An observer for connection and request lifecycle events.
///
/// Implementations must be safe to call concurrently: every worker owns its
/// own connection, but a single `Instrumenter` is shared across all of them.
/// None of the methods return a value or can fail; instrumentation must never
/// affect request handling.
///
/// # Examples
///
/// A counting instrumenter using atomics:
/// ```
/// use httpcore::Instrumenter;
/// use std::{net::SocketAddr, sync::atomic::{AtomicUsize, Ordering}};
///
/// #[derive(Default)]
/// struct Counters {
///     accepted: AtomicUsize,
///     bad_requests: AtomicUsize,
/// }
///
/// impl Instrumenter for Counters {
///     fn accepted_connection(&self, _client_addr: SocketAddr) {
///         self.accepted.fetch_add(1, Ordering::Relaxed);
///     }
///
///     fn bad_request(&self) {
///         self.bad_requests.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait Instrumenter: Sync + Send + 'static {
    /// Called once a TCP connection has passed [`ConnectionFilter`
    /// ](crate::ConnectionFilter) checks and entered the connection loop.
    #[allow(unused_variables)]
    fn accepted_connection(&self, client_addr: SocketAddr) {}

    /// Called when the preamble parser rejects a request (malformed method,
    /// URL, headers, framing, and so on). The connection may continue if
    /// resynchronization succeeds.
    fn bad_request(&self) {}

    /// Called once, when [`Server::launch`](crate::Server::launch) begins
    /// accepting connections.
    #[allow(unused_variables)]
    fn server_started(&self, local_addr: SocketAddr) {}

    /// Called after a response has been fully written to the socket.
    fn wrote_response(&self) {}

    /// Called when a request body uses chunked transfer-encoding.
    fn chunked_request(&self) {}

    /// Called when a response body is written using chunked transfer-encoding.
    fn chunked_response(&self) {}
}

/// The default [`Instrumenter`]: forwards every event to the [`log`] crate at
/// debug level. The server never initializes a logger itself; pair this with
/// `env_logger` or another `log`-compatible backend in the embedding binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogInstrumenter;

impl Instrumenter for LogInstrumenter {
    #[inline]
    fn accepted_connection(&self, client_addr: SocketAddr) {
        log::debug!("accepted connection from {client_addr}");
    }

    #[inline]
    fn bad_request(&self) {
        log::debug!("rejected malformed request");
    }

    #[inline]
    fn server_started(&self, local_addr: SocketAddr) {
        log::debug!("server started on {local_addr}");
    }

    #[inline]
    fn wrote_response(&self) {
        log::debug!("wrote response");
    }

    #[inline]
    fn chunked_request(&self) {
        log::debug!("received chunked request body");
    }

    #[inline]
    fn chunked_response(&self) {
        log::debug!("wrote chunked response body");
    }
}

/// An [`Instrumenter`] that discards every event. Use this when neither
/// counting nor logging overhead is wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumenter;

impl Instrumenter for NoopInstrumenter {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        bad_requests: AtomicUsize,
        responses: AtomicUsize,
    }

    impl Instrumenter for Counting {
        fn bad_request(&self) {
            self.bad_requests.fetch_add(1, Ordering::Relaxed);
        }

        fn wrote_response(&self) {
            self.responses.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn counts_events() {
        let counters = Counting::default();
        counters.bad_request();
        counters.bad_request();
        counters.wrote_response();

        assert_eq!(counters.bad_requests.load(Ordering::Relaxed), 2);
        assert_eq!(counters.responses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn noop_is_inert() {
        let noop = NoopInstrumenter;
        noop.accepted_connection("127.0.0.1:0".parse().unwrap());
        noop.bad_request();
        noop.wrote_response();
    }
}
