use crate::{
    errors::ErrorKind,
    http::{request::ConnectionInfo, types::Protocol},
    limits::{ConnLimits, ConnectorOptions, ReqLimits, RespLimits, ServerLimits, WaitStrategy},
    server::{
        connection::{stopped, Handler, HttpConnection},
        writer,
    },
    Version,
};
use crossbeam::queue::SegQueue;
use socket2::{Domain, Protocol as IpProtocol, Socket, Type};
use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::{yield_now, JoinHandle},
    time::sleep as tokio_sleep,
};

/// An HTTP/1.x connector bound to one listening address.
///
/// Accepted connections wait in a queue until one of
/// [`max_connections`](ServerLimits::max_connections) workers picks them up
/// and runs their connection pump. Connections that find the queue full are
/// answered with `503` by dedicated tasks.
///
/// # Examples
///
/// ```no_run
/// use conduit_http::{Context, HandlerError, Request, Response, Server, StatusCode};
///
/// fn hello(_: &mut Context, _: &mut Request) -> Result<Response, HandlerError> {
///     Ok(Response::new(StatusCode::Ok).body("Hello world!"))
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let running = Server::builder()
///         .bind("127.0.0.1:8080")
///         .unwrap()
///         .handler(hello)
///         .build()
///         .start();
///
///     tokio::signal::ctrl_c().await.unwrap();
///     running.stop().await;
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
    protocol: Protocol,

    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder<H: Handler>() -> ServerBuilder<H> {
        ServerBuilder {
            listener: None,
            handler: None,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
            options: None,
        }
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts accepting connections in the background.
    ///
    /// The returned handle stops the server; dropping it leaves the server
    /// running for the life of the runtime.
    pub fn start(self) -> RunningServer {
        let local_addr = self
            .listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

        tracing::info!(
            protocols = "HTTP/1.0, HTTP/1.1",
            scheme = self.protocol.scheme_name(),
            address = %local_addr.ip(),
            port = local_addr.port(),
            "starting the connector"
        );

        let acceptor = tokio::spawn(Self::accept_loop(
            self.listener,
            self.stream_queue.clone(),
            self.error_queue,
            self.server_limits.max_pending_connections,
            self.shutdown.subscribe(),
        ));

        RunningServer {
            local_addr,
            stream_queue: self.stream_queue,
            shutdown: self.shutdown,
            acceptor,
            workers: self.workers,
        }
    }

    /// Runs the server until the runtime shuts down.
    pub async fn launch(self) {
        let running = self.start();
        let _ = running.acceptor.await;
    }

    async fn accept_loop(
        listener: TcpListener,
        stream_queue: TcpQueue,
        error_queue: TcpQueue,
        max_pending: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                accepted = listener.accept() => accepted,
            };

            let value = match accepted {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!(error = %err, "accept failed");
                    continue;
                }
            };

            match stream_queue.len() < max_pending {
                true => stream_queue.push(value),
                false => {
                    tracing::debug!(peer = %value.1, "connection queue full");
                    error_queue.push(value)
                }
            }
        }

        // Dropping the listener closes the socket.
        drop(listener);
    }

    #[inline]
    async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = queue.pop() {
                return value;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

/// Handle to a started [`Server`].
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    stream_queue: TcpQueue,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl RunningServer {
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the server gracefully.
    ///
    /// Closes the listening socket, lets every in-flight request finish
    /// (its response goes out with `connection: close`) and waits for all
    /// workers to exit. No handler is invoked after this returns.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.acceptor.await {
            tracing::warn!(error = %err, "accept loop ended abnormally");
        }

        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "connection worker ended abnormally");
            }
        }

        let mut dropped = 0;
        while self.stream_queue.pop().is_some() {
            dropped += 1;
        }

        tracing::info!(
            port = self.local_addr.port(),
            unserved = dropped,
            "connector stopped"
        );
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// [`build`](Self::build) spawns the worker tasks, so it must run inside a
/// Tokio runtime.
pub struct ServerBuilder<H: Handler> {
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
    options: Option<ConnectorOptions>,
}

impl<H: Handler> ServerBuilder<H> {
    /// Binds a listening socket to `addr`.
    ///
    /// The socket reuses the address and listens with the
    /// [`backlog`](ServerLimits::backlog) of the server limits set so far.
    /// Either this or [`listener`](Self::listener) is required.
    ///
    /// # Errors
    ///
    /// Fails if `addr` does not resolve or the socket cannot be bound.
    pub fn bind(mut self, addr: impl ToSocketAddrs) -> io::Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address to bind"))?;
        let backlog = self
            .server_limits
            .as_ref()
            .map_or(ServerLimits::default().backlog, |limits| limits.backlog);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(IpProtocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog.min(i32::MAX as u32) as i32)?;

        self.listener = Some(TcpListener::from_std(socket.into())?);
        Ok(self)
    }

    /// Uses an already bound listener.
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Configures listener-level limits.
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures connection timeouts, persistence and inbound credit.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request framing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response buffering.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Sets protocol-adaptation switches such as trusting `X-Forwarded-For`.
    #[inline(always)]
    pub fn options(mut self, options: ConnectorOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Finalizes the builder and spawns the worker tasks.
    ///
    /// # Panics
    ///
    /// Error messages:
    /// - ``The `bind` or `listener` method must be called to create``
    /// - ``The `handler` method must be called to create``
    ///
    /// Also panics when called outside a Tokio runtime.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        let (listener, handler, limits) = self.get_all_parts();
        let protocol = match limits.4.secure {
            true => Protocol::Https,
            false => Protocol::Http,
        };

        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());
        let (shutdown, _) = watch::channel(false);

        let mut workers = Vec::with_capacity(limits.0.max_connections);
        for _ in 0..limits.0.max_connections {
            workers.push(Self::spawn_worker(
                &stream_queue,
                &limits,
                &handler,
                protocol,
                shutdown.subscribe(),
            ));
        }
        if limits.0.count_503_handlers != 0 {
            for _ in 0..limits.0.count_503_handlers {
                Self::spawn_alarmist(&error_queue, &limits, shutdown.subscribe());
            }
        } else {
            Self::spawn_quiet_alarmist(&error_queue, &limits, shutdown.subscribe());
        }

        Server {
            listener,
            stream_queue,
            error_queue,
            server_limits: limits.0,
            protocol,
            shutdown,
            workers,
        }
    }

    #[inline]
    fn spawn_worker(
        queue: &TcpQueue,
        limits: &AllLimits,
        handler: &Arc<H>,
        protocol: Protocol,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = queue.clone();
        let wait = limits.0.wait_strategy.clone();
        let use_forwarded_for = limits.4.use_forwarded_for_header;
        let mut conn = HttpConnection::new(handler.clone(), limits.clone());

        tokio::spawn(async move {
            loop {
                let (stream, remote) = tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => break,
                    value = Server::get_stream(&queue, &wait) => value,
                };

                let Ok(local) = stream.local_addr() else {
                    continue;
                };
                if let Err(err) = stream.set_nodelay(true) {
                    tracing::debug!(peer = %remote, error = %err, "unable to set TCP_NODELAY");
                }

                tracing::debug!(peer = %remote, "connection accepted");
                let info = Arc::new(ConnectionInfo::new(remote, local, protocol, use_forwarded_for));

                if let Err(err) = conn.run(stream, info, shutdown.clone()).await {
                    tracing::warn!(peer = %remote, error = %err, "connection failed");
                }
                tracing::debug!(peer = %remote, "connection closed");
            }
        })
    }

    #[inline]
    fn spawn_alarmist(queue: &TcpQueue, limits: &AllLimits, mut shutdown: watch::Receiver<bool>) {
        let queue = queue.clone();
        let (server_limits, conn_limits, ..) = limits.clone();

        tokio::spawn(async move {
            loop {
                let (mut stream, peer) = tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => break,
                    value = Server::get_stream(&queue, &server_limits.wait_strategy) => value,
                };

                let sent = writer::send_error(
                    &mut stream,
                    ErrorKind::ServiceUnavailable,
                    Version::Http11,
                    server_limits.json_errors,
                    conn_limits.socket_write_timeout,
                )
                .await;

                if let Err(err) = sent {
                    tracing::debug!(peer = %peer, error = %err, "unable to send 503");
                }
            }
        });
    }

    #[inline]
    fn spawn_quiet_alarmist(
        queue: &TcpQueue,
        limits: &AllLimits,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let queue = queue.clone();
        let (server_limits, ..) = limits.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => break,
                    value = Server::get_stream(&queue, &server_limits.wait_strategy) => value,
                };

                drop(stream);
            }
        });
    }

    #[inline]
    #[track_caller]
    fn get_all_parts(self) -> (TcpListener, Arc<H>, AllLimits) {
        (
            self.listener
                .expect("The `bind` or `listener` method must be called to create"),
            self.handler
                .expect("The `handler` method must be called to create"),
            (
                self.server_limits.unwrap_or_default(),
                self.connection_limits.unwrap_or_default(),
                self.request_limits.unwrap_or_default(),
                self.response_limits.unwrap_or_default(),
                self.options.unwrap_or_default(),
            ),
        )
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;
pub(crate) type AllLimits = (
    ServerLimits,
    ConnLimits,
    ReqLimits,
    RespLimits,
    ConnectorOptions,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, HandlerError, Request, Response, StatusCode};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counted(_: &mut Context, req: &mut Request) -> Result<Response, HandlerError> {
        CALLS.fetch_add(1, Ordering::SeqCst);
        let host = req.host_domain().unwrap_or("-").to_string();
        Ok(Response::new(StatusCode::Ok).body(format!("hello {host}")))
    }

    fn hello(_: &mut Context, _: &mut Request) -> Result<Response, HandlerError> {
        Ok(Response::new(StatusCode::Ok).body("hello"))
    }

    fn small() -> ServerLimits {
        ServerLimits {
            max_connections: 2,
            ..ServerLimits::default()
        }
    }

    async fn roundtrip(addr: SocketAddr, request: &[u8]) -> String {
        crate::tools::init_tracing();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();

        let mut wire = String::new();
        client.read_to_string(&mut wire).await.unwrap();
        wire
    }

    #[tokio::test]
    async fn serves_over_loopback_and_stops() {
        let running = Server::builder()
            .bind("127.0.0.1:0")
            .unwrap()
            .handler(counted)
            .server_limits(small())
            .build()
            .start();
        let addr = running.local_addr();

        let wire = roundtrip(
            addr,
            b"GET / HTTP/1.1\r\nhost: example.com\r\nconnection: close\r\n\r\n",
        )
        .await;

        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"), "{wire}");
        assert!(wire.contains("connection: close\r\n"));
        assert!(wire.ends_with("\r\n\r\nhello example.com"));

        running.stop().await;
        let calls = CALLS.load(Ordering::SeqCst);

        assert!(TcpStream::connect(addr).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(CALLS.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn overflow_is_answered_with_503() {
        let running = Server::builder()
            .bind("127.0.0.1:0")
            .unwrap()
            .handler(hello)
            .server_limits(ServerLimits {
                max_pending_connections: 0,
                ..small()
            })
            .build()
            .start();

        // Nothing is sent: the overflow path answers without reading.
        let wire = roundtrip(running.local_addr(), b"").await;

        assert!(wire.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{wire}");
        assert!(wire.ends_with(r#""code":"SERVICE_UNAVAILABLE"}"#));
        running.stop().await;
    }

    #[tokio::test]
    async fn secure_option_reports_https() {
        fn scheme(_: &mut Context, req: &mut Request) -> Result<Response, HandlerError> {
            Ok(Response::new(StatusCode::Ok).body(req.host_ref()))
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = Server::builder()
            .listener(listener)
            .handler(scheme)
            .server_limits(small())
            .options(ConnectorOptions {
                secure: true,
                ..ConnectorOptions::default()
            })
            .build()
            .start();

        let wire = roundtrip(
            running.local_addr(),
            b"GET / HTTP/1.1\r\nhost: example.com\r\nconnection: close\r\n\r\n",
        )
        .await;

        assert!(wire.ends_with("\r\n\r\nhttps://example.com"), "{wire}");
        running.stop().await;
    }

    #[test]
    #[should_panic(expected = "The `handler` method must be called to create")]
    fn build_requires_a_handler() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let _ = Server::builder::<fn(&mut Context, &mut Request) -> Result<Response, HandlerError>>()
                .listener(listener)
                .build();
        });
    }
}
