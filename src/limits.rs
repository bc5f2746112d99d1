//! Connector configuration: limits, timeouts and options
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion
//! - Slowloris-style stalls
//! - Header flooding
//!
//! # Memory Consumption
//!
//! Each active connection holds at most one request head
//! ([`ReqLimits::head_size`]), one request body ([`ReqLimits::body_size`]) per
//! in-flight message slot ([`ConnLimits::inbound_credit`]) and one response
//! buffer ([`RespLimits`]).
//!
//! # Examples
//!
//! ```no_run
//! use conduit_http::{Context, HandlerError, Request, Response, Server, StatusCode};
//! use conduit_http::limits::{ConnLimits, ConnectorOptions, ReqLimits, ServerLimits};
//! use std::time::Duration;
//!
//! fn hello(_: &mut Context, _: &mut Request) -> Result<Response, HandlerError> {
//!     Ok(Response::new(StatusCode::Ok))
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .bind("127.0.0.1:8080")
//!         .unwrap()
//!         .handler(hello)
//!         .server_limits(ServerLimits {
//!             max_connections: 500,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             body_size: 64 * 1024,
//!             ..ReqLimits::default()
//!         })
//!         .options(ConnectorOptions {
//!             use_forwarded_for_header: true,
//!             ..ConnectorOptions::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls listener-level concurrency, queueing and overload behavior.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== | Queue has room? | ====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \==================\\          //====================\
///                            V          V                    ||
/// [---------]   Yes   /--------------------------\   No   [------]
/// [ Pump    ] <====== | Is there a free worker?  | =====> [ Wait ]
/// [---------]         \--------------------------/        [------]
/// ```
///
/// Each worker is a long-lived task that takes one accepted connection at a
/// time from the queue and runs its connection pump to completion.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of connections pumped concurrently (default: `100`).
    ///
    /// Exactly this many worker tasks are spawned on start.
    pub max_connections: usize,

    /// Maximum number of accepted connections waiting for a worker (default: `250`).
    ///
    /// Once the queue is full, new connections receive an immediate `503`
    /// response and are closed.
    pub max_pending_connections: usize,

    /// How idle workers wait for the queue to fill (default: `Sleep(50µs)`).
    pub wait_strategy: WaitStrategy,

    /// Dedicated tasks that answer queue overflow with `503` (default: `1`).
    ///
    /// Set to 0 to silently close overflowing connections.
    pub count_503_handlers: usize,

    /// Format for framing error responses (default: `true`)
    ///
    /// If `true`, framing errors are answered with:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, the body is empty and `content-length: 0` is sent.
    pub json_errors: bool,

    /// Listen backlog passed to `listen(2)` by [`bind`](crate::ServerBuilder::bind)
    /// (default: `1024`).
    pub backlog: u32,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,
            json_errors: true,
            backlog: 1024,

            _priv: (),
        }
    }
}

/// Strategy for worker tasks when no connections are queued
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]
    ///
    /// # Note
    /// Keeps one core busy per idle worker. Only useful for latency benchmarks.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`]
    ///
    /// ```
    /// # #[tokio::main]
    /// async fn main() {
    /// # let mut queue = vec![1, 2, 3];
    /// # let time = std::time::Duration::from_micros(50);
    /// #
    /// let value = loop {
    ///     if let Some(value) = queue.pop() {
    ///         break value;
    ///     }
    ///
    ///     tokio::time::sleep(time).await;
    /// };
    /// # }
    /// ```
    Sleep(Duration),
}

/// Connection-level limits and timeouts
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum idle time while waiting for request bytes (default: `2 seconds`)
    ///
    /// Applies to each read. A timeout between messages closes the connection
    /// quietly; a timeout inside a message is a transport fault.
    pub socket_read_timeout: Duration,

    /// Maximum duration of a single write (default: `3 seconds`)
    pub socket_write_timeout: Duration,

    /// Maximum number of requests served on one connection (default: `100`)
    ///
    /// The response to the last allowed request carries `Connection: close`.
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of a connection (default: `2 minutes`)
    ///
    /// Checked between requests; an expired connection answers its current
    /// request with `Connection: close`.
    pub connection_lifetime: Duration,

    /// Messages the framing layer may read before the pump grants more credit (default: `1`)
    ///
    /// One credit is returned each time a response has been written. With the
    /// default of `1`, the socket is not read while a request is in flight;
    /// larger values let pipelined messages be framed ahead, though they are
    /// still handled one at a time.
    pub inbound_credit: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(2),
            socket_write_timeout: Duration::from_secs(3),
            connection_lifetime: Duration::from_secs(120),
            max_requests_per_connection: 100,
            inbound_credit: 1,

            _priv: (),
        }
    }
}

/// HTTP request framing limits
///
/// 🔧 **You MAY need to increase these if you see:**
/// - `413 Payload Too Large` for legitimate requests
/// - `431 Request Header Fields Too Large`
/// - `400 Bad Request` with `INVALID_URL` for long request targets
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum request-target length in bytes (default: `2 KB`)
    pub target_size: usize,

    /// Maximum number of header lines per request (default: `32`)
    pub header_count: usize,
    /// Maximum header name length in bytes (default: `64 B`)
    pub header_name_size: usize,
    /// Maximum header value length in bytes (default: `1 KB`)
    pub header_value_size: usize,

    /// Maximum request body size in bytes (default: `64 KB`)
    pub body_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            target_size: 2 * 1024,

            header_count: 32,
            header_name_size: 64,
            header_value_size: 1024,

            body_size: 64 * 1024,

            _priv: (),
        }
    }
}

impl ReqLimits {
    /// Upper bound for a request head, from the request line to the blank line.
    ///
    /// ```
    /// use conduit_http::limits::ReqLimits;
    ///
    /// let limits = ReqLimits::default();
    /// assert_eq!(limits.head_size(), 19 + 2048 + 32 * (64 + 1024 + 4) + 2);
    /// ```
    #[inline(always)]
    pub fn head_size(&self) -> usize {
        // CONNECT /target HTTP/1.1\r\n
        // |-----| |-----| |------|
        //  Method  Target  Version
        //
        // Method(7) + " " + Target + " " + Version(8) + "\r\n" = 19 + target_size
        let first_line = 19 + self.target_size;
        // Name + ": " + Value + "\r\n"
        let header_line = self.header_name_size + self.header_value_size + 4;

        first_line + self.header_count * header_line + 2
    }
}

/// Response buffering limits.
///
/// # Buffer Management
///
/// Each pump keeps one output buffer for the life of the connection:
/// ```rust
/// # use conduit_http::limits::RespLimits;
/// # let limits = RespLimits::default();
/// # let mut buffer: Vec<()> = Vec::with_capacity(limits.default_capacity);
/// #
/// if buffer.capacity() > limits.max_capacity {
///     buffer = Vec::with_capacity(limits.default_capacity);
/// } else {
///     buffer.clear();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity allocated for responses (default: `1024 B`)
    pub default_capacity: usize,
    /// Capacity above which the buffer is reallocated between responses (default: `8192 B`)
    pub max_capacity: usize,
    /// Largest chunk written at once for streamed bodies (default: `16 KB`)
    pub chunk_size: usize,
    /// Longest wait for the next chunk of a streamed body (default: `30s`)
    ///
    /// A producer that stays silent longer has its stream cut and the
    /// connection closed.
    pub stream_idle_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,
            chunk_size: 16 * 1024,
            stream_idle_timeout: Duration::from_secs(30),

            _priv: (),
        }
    }
}

/// Protocol-adaptation switches.
#[derive(Debug, Clone, Default)]
pub struct ConnectorOptions {
    /// Trust `X-Forwarded-For` when building the forwarded-address chain (default: `false`)
    ///
    /// The header is spoofable by any client, so only enable this behind a
    /// proxy that overwrites it.
    pub use_forwarded_for_header: bool,

    /// Report the protocol as HTTPS (default: `false`)
    ///
    /// For deployments where TLS terminates below the connector. Affects the
    /// scheme of host references and the default port.
    pub secure: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}
