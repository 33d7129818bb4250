use crate::{
    errors::ErrorKind,
    http::{
        request::Request,
        response::{Handled, Response},
    },
    instrumenter::{Instrumenter, LogInstrumenter},
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits, WaitStrategy},
    server::{
        connection::{ConnectionData, HttpConnection},
        transport::{Stream, TlsAcceptor},
    },
    ConnectionFilter, Scheme, Version,
};
use crossbeam::queue::SegQueue;
use futures::future::{self, BoxFuture};
use std::{
    future::Future,
    io,
    marker::{PhantomData, Send, Sync},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::{yield_now, AbortHandle},
    time::sleep as tokio_sleep,
};

/// A trait for handling HTTP requests and generating responses.
///
/// You can use:
/// - `&self` for shared immutable data (e.g. database connection pool, router configuration)
/// - `&mut S` for connection-specific mutable state (e.g. authentication tokens, session data)
///
/// # Examples
///
/// Basic Request Handler
/// ```
/// use httpcore::{Handler, Request, Response, Handled, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), req: &Request, resp: &mut Response) -> Handled {
///         // Simple echo handler
///         if req.url().target() == b"/echo" {
///             resp.status(StatusCode::Ok).body("Echo response")
///         } else {
///             resp.status(StatusCode::NotFound).body("Not found :(")
///         }
///     }
/// }
/// ```
/// Handler with [`ConnectionData`]
/// ```
/// use httpcore::{Handler, ConnectionData, Request, Response, Handled, StatusCode};
///
/// struct CountingHandler;
///
/// impl Handler<State> for CountingHandler {
///     async fn handle(&self, data: &mut State, req: &Request, resp: &mut Response) -> Handled {
///         data.request_count += 1;
///
///         resp.status(StatusCode::Ok)
///             .body(format!("Request #{}", data.request_count))
///     }
/// }
///
/// struct State {
///     request_count: usize,
/// }
///
/// impl ConnectionData for State {
///     fn new() -> Self {
///         Self { request_count: 0 }
///     }
///     
///     fn reset(&mut self) {
///         self.request_count = 0;
///     }
/// }
/// ```
pub trait Handler<S = ()>
where
    Self: Sync + Send + 'static,
    S: ConnectionData,
{
    /// Processes an HTTP request and generates a response.
    ///
    /// # Parameters
    ///
    /// - `connection_data`: Mutable reference to connection-specific state
    /// - `req`: Immutable reference to the parsed HTTP request
    /// - `resp`: Mutable response builder for constructing the response
    ///
    /// # Returns
    ///
    /// `Handled` indicating whether the request was fully processed or
    /// requires further handling by other middleware.
    ///
    /// # Errors
    ///
    /// Implementations should handle errors internally and set appropriate
    /// HTTP status codes on the response. Panics will terminate the connection.
    fn handle(
        &self,
        connection_data: &mut S,
        request: &Request,
        response: &mut Response,
    ) -> impl Future<Output = Handled> + Send;
}

/// An HTTP server that processes incoming connections and requests.
///
/// The server uses a pre-allocated connection pool for maximum performance
/// and implements graceful connection handling with configurable limits.
///
/// # Examples
///
/// ```no_run
/// use httpcore::{Server, Handler, Request, Response, Handled, StatusCode};
/// use tokio::net::TcpListener;
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::Ok).body("Hello world!")
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listeners: Vec<ListenerEntry>,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
    instrumenter: Arc<dyn Instrumenter>,
    stopping: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    worker_handles: Vec<AbortHandle>,
}

/// A bound socket together with the optional TLS acceptor that should
/// wrap every connection accepted on it.
pub(crate) struct ListenerEntry {
    listener: TcpListener,
    tls: Option<Arc<dyn TlsAcceptor>>,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # httpcore::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use httpcore::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    /// # }
    /// ```
    #[inline]
    pub fn builder<H, S>() -> ServerBuilder<H, S, ()>
    where
        H: Handler<S>,
        S: ConnectionData,
    {
        ServerBuilder {
            listeners: Vec::new(),
            handler: None,
            connection_filter: Arc::new(()),
            instrumenter: Arc::new(LogInstrumenter),
            _marker: PhantomData,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
        }
    }

    /// Starts the server and begins accepting incoming connections.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # httpcore::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use httpcore::Server;
    /// use tokio::net::TcpListener;
    ///
    /// Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build()
    ///     .launch()
    ///     .await
    /// # }
    /// ```
    #[inline]
    pub async fn launch(&self) {
        if self.listeners.is_empty() {
            return;
        }

        for entry in &self.listeners {
            if let Ok(local_addr) = entry.listener.local_addr() {
                self.instrumenter.server_started(local_addr);
            }
        }

        let mut accepts: Vec<BoxFuture<'_, io::Result<(TcpStream, SocketAddr)>>> = self
            .listeners
            .iter()
            .map(Self::accept_on)
            .collect();

        loop {
            tokio::select! {
                biased;

                () = self.shutdown_notify.notified() => break,
                (accepted, index, remaining) = future::select_all(accepts) => {
                    accepts = remaining;

                    if let Ok((stream, addr)) = accepted {
                        let item = (stream, addr, self.listeners[index].tls.clone());

                        match self.stream_queue.len() < self.server_limits.max_pending_connections {
                            true => self.stream_queue.push(item),
                            false => self.error_queue.push(item),
                        }
                    }

                    accepts.push(Self::accept_on(&self.listeners[index]));
                }
            }
        }
    }

    #[inline]
    fn accept_on(entry: &ListenerEntry) -> BoxFuture<'_, io::Result<(TcpStream, SocketAddr)>> {
        Box::pin(async move { entry.listener.accept().await })
    }

    /// Stops accepting new connections and marks idle workers for shutdown.
    ///
    /// Workers waiting for a connection (queue-idle) and connections parked
    /// between keep-alive requests both close immediately. Workers actively
    /// running a handler keep running; call
    /// [`shutdown_gracefully`](Self::shutdown_gracefully) to additionally wait
    /// out [`shutdown_grace`](crate::limits::ServerLimits::shutdown_grace)
    /// and force-close any stragglers.
    #[inline]
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();
    }

    /// Stops accepting new connections, waits up to
    /// [`shutdown_grace`](crate::limits::ServerLimits::shutdown_grace) for
    /// in-flight requests to finish, then aborts any worker still running.
    ///
    /// Idle connections do not consume this grace period — they are closed
    /// as soon as [`shutdown`](Self::shutdown) fires. The sleep only bounds
    /// workers that are actively inside a handler call, which cannot be
    /// interrupted short of `abort`.
    #[inline]
    pub async fn shutdown_gracefully(&self) {
        self.shutdown();
        tokio_sleep(self.server_limits.shutdown_grace).await;

        for handle in &self.worker_handles {
            handle.abort();
        }
    }

    #[inline]
    async fn get_stream(
        queue: &TcpQueue,
        wait: &WaitStrategy,
        stopping: &AtomicBool,
    ) -> Option<(TcpStream, SocketAddr, Option<Arc<dyn TlsAcceptor>>)> {
        loop {
            if let Some(value) = queue.pop() {
                return Some(value);
            }
            if stopping.load(Ordering::Relaxed) {
                return None;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// # Protocol Support
///
/// - `HTTP/1.X` (HTTP/1.0 or HTTP/1.1): Always enabled
pub struct ServerBuilder<H, S = (), F = ()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    listeners: Vec<ListenerEntry>,
    handler: Option<Arc<H>>,
    connection_filter: Arc<F>,
    instrumenter: Arc<dyn Instrumenter>,
    _marker: PhantomData<S>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
}

impl<H, S, F> ServerBuilder<H, S, F>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    /// Adds a plain-TCP listener that the server will use to accept
    /// connections.
    ///
    /// May be called more than once; every port added (via this method or
    /// [`tls_listener`](Self::tls_listener)) gets its own accept loop, and
    /// all of them feed the same worker pool.
    ///
    /// **At least one listener is required.**
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # httpcore::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use httpcore::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listeners.push(ListenerEntry { listener, tls: None });
        self
    }

    /// Adds a TLS-terminated listener. Every connection accepted on `listener`
    /// is handed to `acceptor` for the handshake before the core reads a
    /// single byte of the request; the resulting [`Request::scheme`
    /// ](crate::Request::scheme) reports `https` for these connections.
    ///
    /// The core never constructs the certificate store itself — `acceptor`
    /// is an opaque adapter the embedder builds (e.g. `tokio_rustls::TlsAcceptor`,
    /// which implements [`TlsAcceptor`] directly).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # httpcore::impt_default_handler!{ MyStruct }
    /// # fn rustls_config() -> std::sync::Arc<tokio_rustls::rustls::ServerConfig> {
    /// #     unimplemented!()
    /// # }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use httpcore::Server;
    ///
    /// let acceptor = tokio_rustls::TlsAcceptor::from(rustls_config());
    ///
    /// let server = Server::builder()
    ///     .tls_listener(TcpListener::bind("127.0.0.1:8443").await.unwrap(), acceptor)
    ///     .handler(MyStruct)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn tls_listener<A: TlsAcceptor>(mut self, listener: TcpListener, acceptor: A) -> Self {
        self.listeners.push(ListenerEntry {
            listener,
            tls: Some(Arc::new(acceptor)),
        });
        self
    }

    /// Sets the request handler that will process incoming requests.
    ///
    /// **This is a required component.**
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use httpcore::{Server, Handler, Request, Response, Handled, StatusCode};
    /// use tokio::net::TcpListener;
    ///
    /// struct MyStruct;
    ///
    /// impl Handler for MyStruct {
    ///     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
    ///         resp.status(StatusCode::Ok).body("Hello World!")
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Installs a connection filter to check incoming TCP connections
    /// before using it.
    ///
    /// Allows early rejection of unwanted IP addresses (before the
    /// first read). Can be used for DDoS protection, geobanning, etc.
    ///
    /// For more information, see [ConnectionFilter](crate::ConnectionFilter)
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # httpcore::impt_default_handler!{ MyStruct }
    /// use tokio::net::TcpListener;
    /// use std::net::SocketAddr;
    /// use httpcore::{ConnectionFilter, Server};
    ///
    /// struct MyConnFilter {
    ///     blacklist: Vec<SocketAddr>
    /// }
    ///
    /// impl ConnectionFilter for MyConnFilter {
    ///     fn filter(
    ///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
    ///     ) -> Result<(), Handled> {
    ///         if self.blacklist.contains(&client_addr) {
    ///             Err(err_resp
    ///                 .status(StatusCode::Forbidden)
    ///                 .body(b"Your IP is permanently banned"))
    ///         } else {
    ///             Ok(())
    ///         }
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let filter = MyConnFilter {
    ///     blacklist: vec![
    ///         "192.0.2.1".parse().unwrap(),
    ///         "198.51.100.1".parse().unwrap(),
    ///         "203.0.113.1".parse().unwrap(),
    ///         "10.0.0.1".parse().unwrap(),
    ///     ]
    /// };
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .conn_filter(filter)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn conn_filter<NewF>(self, filter: NewF) -> ServerBuilder<H, S, NewF>
    where
        NewF: ConnectionFilter,
    {
        ServerBuilder {
            listeners: self.listeners,
            handler: self.handler,
            connection_filter: Arc::new(filter),
            instrumenter: self.instrumenter,
            _marker: self._marker,
            server_limits: self.server_limits,
            request_limits: self.request_limits,
            response_limits: self.response_limits,
            connection_limits: self.connection_limits,
        }
    }

    /// Installs an [`Instrumenter`] observer for connection and request
    /// lifecycle events.
    ///
    /// Defaults to [`LogInstrumenter`](crate::instrumenter::LogInstrumenter),
    /// which forwards every event to the `log` crate at debug level. Use
    /// [`NoopInstrumenter`](crate::instrumenter::NoopInstrumenter) to disable
    /// instrumentation entirely, or provide a custom counting implementation.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # httpcore::impt_default_handler!{ MyStruct }
    /// use tokio::net::TcpListener;
    /// use httpcore::{Server, instrumenter::NoopInstrumenter};
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .instrumenter(NoopInstrumenter)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn instrumenter<I: Instrumenter>(mut self, instrumenter: I) -> Self {
        self.instrumenter = Arc::new(instrumenter);
        self
    }

    /// Configures request parsing and processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # httpcore::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use httpcore::{Server, limits::ServerLimits};
    /// use tokio::net::TcpListener;
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .server_limits(ServerLimits {
    ///         // Your changes
    ///         max_connections: 2500,
    ///         max_pending_connections: 10000,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures request parsing and processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # httpcore::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use httpcore::{Server, limits::ConnLimits};
    /// use tokio::net::TcpListener;
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .connection_limits(ConnLimits {
    ///         // Your changes
    ///         socket_read_timeout: Duration::from_secs(5),
    ///         socket_write_timeout: Duration::from_secs(2),
    ///         connection_lifetime: Duration::from_secs(200),
    ///         ..ConnLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing and processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # httpcore::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use httpcore::{Server, limits::ReqLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .request_limits(ReqLimits {
    ///         // Your changes
    ///         url_size: 1024,
    ///         url_query_parts: 32,
    ///         url_parts: 20,
    ///         ..ReqLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response processing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # httpcore::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use httpcore::{Server, limits::RespLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .response_limits(RespLimits {
    ///         // Your changes
    ///         default_capacity: 1024,
    ///         max_capacity: 4096,
    ///         ..RespLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Panics
    ///
    /// Panics when:
    /// - Neither `listener` nor `tls_listener` was called.
    /// - The `handler` method was not called.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # httpcore::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use httpcore::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    ///
    /// // Yes, 3 identical examples, for you, in case you suddenly get lost :)
    /// #
    /// # // No, really. Documentation can be difficult for beginners.
    /// # }
    /// ```
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        let instrumenter = self.instrumenter.clone();
        let stopping = Arc::new(AtomicBool::new(false));
        let shutdown_notify = Arc::new(Notify::new());
        let (listeners, handler, filter, limits) = self.get_all_parts();

        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());
        let mut worker_handles = Vec::with_capacity(limits.0.max_connections);

        for _ in 0..limits.0.max_connections {
            worker_handles.push(Self::spawn_worker(
                &stream_queue,
                &limits,
                &filter,
                &handler,
                &instrumenter,
                &stopping,
                &shutdown_notify,
            ));
        }
        if limits.0.count_503_handlers != 0 {
            for _ in 0..limits.0.count_503_handlers {
                worker_handles.push(Self::spawn_alarmist(&error_queue, &limits, &stopping));
            }
        } else {
            worker_handles.push(Self::spawn_quiet_alarmist(&error_queue, &limits, &stopping));
        }

        Server {
            listeners,
            stream_queue,
            error_queue,
            server_limits: limits.0,
            instrumenter,
            stopping,
            shutdown_notify,
            worker_handles,
        }
    }

    #[inline]
    fn spawn_worker(
        queue: &TcpQueue,
        limits: &AllLimits,
        filter: &Arc<F>,
        handler: &Arc<H>,
        instrumenter: &Arc<dyn Instrumenter>,
        stopping: &Arc<AtomicBool>,
        shutdown_notify: &Arc<Notify>,
    ) -> AbortHandle {
        let queue = queue.clone();
        let filter = filter.clone();
        let instrumenter = instrumenter.clone();
        let stopping = stopping.clone();
        let mut conn = HttpConnection::new(
            handler.clone(),
            limits.clone(),
            instrumenter.clone(),
            stopping.clone(),
            shutdown_notify.clone(),
        );

        tokio::spawn(async move {
            loop {
                let Some((raw_stream, addr, tls)) =
                    Server::get_stream(&queue, &conn.server_limits.wait_strategy, &stopping).await
                else {
                    break;
                };

                let Ok(local_addr) = raw_stream.local_addr() else {
                    continue;
                };

                if filter.filter(addr, local_addr, &mut conn.response).is_err()
                    || filter
                        .filter_async(addr, local_addr, &mut conn.response)
                        .await
                        .is_err()
                {
                    // A TLS listener hasn't handshaked yet at this point;
                    // writing a plaintext response would corrupt the
                    // handshake, so rejected TLS connections are just
                    // dropped instead of answered.
                    if tls.is_none() {
                        let mut stream = Stream::Plain(raw_stream);
                        let _ = conn
                            .conn_limits
                            .write_bytes(&mut stream, conn.response.buffer())
                            .await;
                        let _ = stream.shutdown().await;
                    }

                    conn.response.reset(&conn.resp_limits);
                    continue;
                }

                let (mut stream, scheme) = match tls {
                    Some(acceptor) => match acceptor.accept(raw_stream).await {
                        Ok(secure) => (Stream::Secure(secure), Scheme::Https),
                        Err(_) => continue,
                    },
                    None => (Stream::Plain(raw_stream), Scheme::Http),
                };

                instrumenter.accepted_connection(addr);
                let _ = conn.run(&mut stream, addr, local_addr, scheme).await;
                // Sends the explicit FIN/close_notify so naive pooling
                // clients evict the socket instead of reusing a half-dead one.
                let _ = stream.shutdown().await;
            }
        })
        .abort_handle()
    }

    #[inline]
    fn spawn_alarmist(queue: &TcpQueue, limits: &AllLimits, stopping: &Arc<AtomicBool>) -> AbortHandle {
        let queue = queue.clone();
        let stopping = stopping.clone();
        let (server_limits, conn_limits, ..) = limits.clone();

        tokio::spawn(async move {
            loop {
                let Some((raw_stream, _, tls)) =
                    Server::get_stream(&queue, &server_limits.wait_strategy, &stopping).await
                else {
                    break;
                };

                // Same handshake-corruption concern as in `spawn_worker`:
                // a rejected TLS connection is dropped silently.
                if tls.is_some() {
                    continue;
                }

                let mut stream = Stream::Plain(raw_stream);
                let _ = conn_limits
                    .send_error(
                        &mut stream,
                        ErrorKind::ServiceUnavailable,
                        Version::Http11,
                        server_limits.json_errors,
                    )
                    .await;
                let _ = stream.shutdown().await;
            }
        })
        .abort_handle()
    }

    #[inline]
    fn spawn_quiet_alarmist(queue: &TcpQueue, limits: &AllLimits, stopping: &Arc<AtomicBool>) -> AbortHandle {
        let queue = queue.clone();
        let stopping = stopping.clone();
        let (server_limits, ..) = limits.clone();

        tokio::spawn(async move {
            loop {
                let Some((stream, ..)) =
                    Server::get_stream(&queue, &server_limits.wait_strategy, &stopping).await
                else {
                    break;
                };

                drop(stream);
            }
        })
        .abort_handle()
    }

    #[inline]
    #[track_caller]
    fn get_all_parts(self) -> (Vec<ListenerEntry>, Arc<H>, Arc<F>, AllLimits) {
        assert!(
            !self.listeners.is_empty(),
            "At least one `listener`/`tls_listener` call is required to create"
        );

        (
            self.listeners,
            self.handler
                .expect("The `handler` method must be called to create"),
            self.connection_filter,
            (
                self.server_limits.clone().unwrap_or_default(),
                self.connection_limits.clone().unwrap_or_default(),
                self.request_limits
                    .clone()
                    .unwrap_or_default()
                    .precalculate(),
                self.response_limits.clone().unwrap_or_default(),
            ),
        )
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr, Option<Arc<dyn TlsAcceptor>>)>>;
pub(crate) type AllLimits = (ServerLimits, ConnLimits, ReqLimits, RespLimits);
