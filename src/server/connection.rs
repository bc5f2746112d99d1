use crate::{
    errors::{Error, ErrorKind, HandlerError},
    http::{
        parser::{Frame, Parser},
        request::{ConnectionInfo, Request},
        response::Response,
        types::Version,
    },
    limits::{ConnLimits, ReqLimits},
    server::{
        server_impl::AllLimits,
        writer::{self, Exchange, Writer},
    },
};
use serde_json::Value;
use std::{
    collections::HashMap,
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf},
    sync::{mpsc, watch, Semaphore},
    task::JoinHandle,
};

/// Turns a request into a response.
///
/// Handlers are synchronous and may block: each call runs on the blocking
/// thread pool, and the connection waits for it before reading the next
/// request. Returning an error or panicking produces a `500` whose
/// [`cause`](Response::cause) keeps the fault.
///
/// Any `Fn(&mut Context, &mut Request) -> Result<Response, HandlerError>`
/// closure or function is a handler.
///
/// # Examples
///
/// ```
/// use conduit_http::{Context, Handler, HandlerError, Request, Response, StatusCode};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     fn handle(&self, _: &mut Context, req: &mut Request) -> Result<Response, HandlerError> {
///         match req.target() {
///             "/echo" => Ok(Response::new(StatusCode::Ok).body(req.take_body())),
///             _ => Ok(Response::new(StatusCode::NotFound)),
///         }
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, context: &mut Context, request: &mut Request)
        -> Result<Response, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&mut Context, &mut Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    #[inline]
    fn handle(&self, context: &mut Context, request: &mut Request) -> Result<Response, HandlerError> {
        self(context, request)
    }
}

/// State scoped to a single handler call.
///
/// A fresh context is built for every request and dropped as soon as its
/// response is written; nothing in it survives to the next request.
#[derive(Debug)]
pub struct Context {
    connection: Arc<ConnectionInfo>,
    request_index: usize,
    attributes: HashMap<String, Value>,
}

impl Context {
    pub(crate) fn new(connection: Arc<ConnectionInfo>, request_index: usize) -> Self {
        Self {
            connection,
            request_index,
            attributes: HashMap::new(),
        }
    }

    #[inline]
    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    /// Position of this request on its connection, starting at 0.
    #[inline]
    pub fn request_index(&self) -> usize {
        self.request_index
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }
}

//

type Inbound = Result<Frame, (ErrorKind, Version)>;

pub(crate) struct HttpConnection<H: Handler> {
    handler: Arc<H>,
    writer: Writer,

    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    json_errors: bool,
}

impl<H: Handler> HttpConnection<H> {
    pub(crate) fn new(handler: Arc<H>, limits: AllLimits) -> Self {
        let (server_limits, conn_limits, req_limits, resp_limits, _) = limits;

        Self {
            handler,
            writer: Writer::new(resp_limits, conn_limits.socket_write_timeout),
            conn_limits,
            req_limits,
            json_errors: server_limits.json_errors,
        }
    }

    /// Serves one connection until it closes, the limits expire, or
    /// `shutdown` flips to `true`.
    ///
    /// Requests are handled strictly one after another: the next message is
    /// only read once the previous response has been written and its
    /// completion callback has fired.
    pub(crate) async fn run<S>(
        &mut self,
        stream: S,
        info: Arc<ConnectionInfo>,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);

        let credit = Arc::new(Semaphore::new(self.conn_limits.inbound_credit.max(1)));
        let (tx, mut rx) = mpsc::channel(self.conn_limits.inbound_credit.max(1));
        let reader = self.spawn_reader(read_half, tx, credit.clone());

        let created = Instant::now();
        let mut served = 0;

        loop {
            let inbound = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                inbound = rx.recv() => inbound,
            };

            let frame = match inbound {
                Some(Ok(frame)) => frame,
                Some(Err((ErrorKind::Io(err), _))) => {
                    tracing::debug!(peer = %info.remote_addr(), error = %err.0, "transport fault");
                    break;
                }
                Some(Err((kind, version))) => {
                    tracing::debug!(peer = %info.remote_addr(), error = %kind, "rejecting malformed request");
                    let sent = writer::send_error(
                        &mut write_half,
                        kind,
                        version,
                        self.json_errors,
                        self.conn_limits.socket_write_timeout,
                    )
                    .await;

                    if let Err(err) = sent {
                        tracing::debug!(peer = %info.remote_addr(), error = %err, "unable to send error response");
                    }
                    break;
                }
                None => break,
            };

            served += 1;
            let exhausted = served >= self.conn_limits.max_requests_per_connection
                || created.elapsed() > self.conn_limits.connection_lifetime;

            let request = Request::new(frame, info.clone());
            let context = Context::new(info.clone(), served - 1);
            let (method, version) = (request.method(), request.version());

            let Some((mut request, context, result)) =
                dispatch(self.handler.clone(), request, context).await
            else {
                break;
            };

            let Some(response) = resolve(result).await else {
                break;
            };

            if info.is_aborted() {
                tracing::debug!(peer = %info.remote_addr(), "connection aborted by handler");
                break;
            }

            let connection = request.headers().get_values("connection");
            let exchange = Exchange {
                method,
                version,
                keep_alive: !exhausted
                    && !*shutdown.borrow()
                    && writer::client_keep_alive(version, connection.as_deref()),
            };

            let outcome = self
                .writer
                .send(&mut write_half, exchange, response, info.abort_signal())
                .await;

            drop((request, context));

            if !outcome.keep_alive || info.is_aborted() {
                break;
            }
            credit.add_permits(1);
        }

        credit.close();
        reader.abort();

        if let Err(err) = write_half.shutdown().await {
            tracing::debug!(peer = %info.remote_addr(), error = %err, "error while closing the connection");
        }
        Ok(())
    }

    fn spawn_reader<R>(
        &self,
        mut read_half: ReadHalf<R>,
        tx: mpsc::Sender<Inbound>,
        credit: Arc<Semaphore>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Send + 'static,
    {
        let mut parser = Parser::new(self.req_limits.clone());
        let idle = self.conn_limits.socket_read_timeout;

        tokio::spawn(async move {
            loop {
                // A closed semaphore means the pump is gone.
                let Ok(permit) = credit.acquire().await else {
                    break;
                };
                permit.forget();

                let inbound = match parser.next_frame(&mut read_half, idle).await {
                    Ok(Some(frame)) => Ok(frame),
                    Ok(None) => break,
                    Err(kind) => Err((kind, parser.version())),
                };
                let last = inbound.is_err();

                if tx.send(inbound).await.is_err() || last {
                    break;
                }
            }
        })
    }
}

/// Runs the handler on the blocking pool, containing errors and panics.
///
/// Returns `None` only if the runtime dropped the call.
async fn dispatch<H: Handler>(
    handler: Arc<H>,
    mut request: Request,
    mut context: Context,
) -> Option<(Request, Context, Result<Response, Error>)> {
    let joined = tokio::task::spawn_blocking(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.handle(&mut context, &mut request)
        }));

        let result = match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(Error::Dispatch(err)),
            Err(payload) => Err(Error::from_panic(payload)),
        };
        (request, context, result)
    })
    .await;

    match joined {
        Ok(parts) => Some(parts),
        Err(err) => {
            tracing::error!(error = %err, "request handler was cancelled");
            None
        }
    }
}

/// Maps faults to `500` and waits for deferred responses.
///
/// `None` means the request was abandoned and nothing can be written.
async fn resolve(result: Result<Response, Error>) -> Option<Response> {
    let mut response = match result {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "request handler failed");
            Response::internal_error(err)
        }
    };

    while let Some(pending) = response.take_deferred() {
        response = match pending.await {
            Ok(response) => response,
            Err(_) => {
                tracing::warn!(error = %Error::Abandoned, "closing the connection");
                return None;
            }
        };
    }

    Some(response)
}

/// Resolves once `shutdown` reads `true`; never resolves if its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::{
            request::test_connection,
            response::{Body, Entity},
        },
        limits::{ConnectorOptions, RespLimits, ServerLimits},
        StatusCode,
    };
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn limits(conn: ConnLimits) -> AllLimits {
        (
            ServerLimits::default(),
            conn,
            ReqLimits::default(),
            RespLimits::default(),
            ConnectorOptions::default(),
        )
    }

    /// Writes `input`, closes the client's write side and collects
    /// everything the server sends back.
    async fn exchange<H: Handler>(handler: H, conn: ConnLimits, input: &[u8]) -> String {
        crate::tools::init_tracing();
        let (mut client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let mut connection = HttpConnection::new(Arc::new(handler), limits(conn));
        let served = tokio::spawn(async move {
            connection
                .run(server, test_connection(false), stop_rx)
                .await
        });

        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let mut wire = String::new();
        client.read_to_string(&mut wire).await.unwrap();
        served.await.unwrap().unwrap();
        wire
    }

    fn statuses(wire: &str) -> Vec<&str> {
        wire.split("\r\n")
            .filter(|line| line.starts_with("HTTP/1."))
            .collect()
    }

    #[tokio::test]
    async fn pipelined_requests_are_sequential() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let handler = {
            let log = log.clone();
            move |_: &mut Context, req: &mut Request| -> Result<Response, HandlerError> {
                let target = req.target().to_string();
                log.lock().unwrap().push(format!("handle {target}"));

                let log = log.clone();
                Ok(Response::new(StatusCode::Ok)
                    .body(target.clone())
                    .on_sent(move |_| log.lock().unwrap().push(format!("sent {target}"))))
            }
        };

        let wire = exchange(
            handler,
            ConnLimits::default(),
            b"GET /a HTTP/1.1\r\nhost: x\r\n\r\nGET /b HTTP/1.1\r\nhost: x\r\n\r\n",
        )
        .await;

        assert_eq!(statuses(&wire), ["HTTP/1.1 200 OK", "HTTP/1.1 200 OK"]);
        assert!(wire.find("/a").unwrap() < wire.find("/b").unwrap());
        assert_eq!(
            *log.lock().unwrap(),
            ["handle /a", "sent /a", "handle /b", "sent /b"]
        );
    }

    #[tokio::test]
    async fn faults_become_a_single_500() {
        let handler = |_: &mut Context, req: &mut Request| -> Result<Response, HandlerError> {
            match req.target() {
                "/error" => Err("database is down".into()),
                "/panic" => panic!("handler bug"),
                _ => Ok(Response::new(StatusCode::Ok).body("fine")),
            }
        };

        let wire = exchange(
            handler,
            ConnLimits::default(),
            b"GET /error HTTP/1.1\r\n\r\nGET /panic HTTP/1.1\r\n\r\nGET /ok HTTP/1.1\r\n\r\n",
        )
        .await;

        assert_eq!(
            statuses(&wire),
            [
                "HTTP/1.1 500 Internal Server Error",
                "HTTP/1.1 500 Internal Server Error",
                "HTTP/1.1 200 OK",
            ]
        );
        assert!(!wire.contains("database is down"));
        assert!(!wire.contains("handler bug"));
    }

    #[tokio::test]
    async fn faults_are_kept_as_cause() {
        let response = resolve(Err(Error::Dispatch("nope".into()))).await.unwrap();

        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_eq!(
            response.cause().map(ToString::to_string).as_deref(),
            Some("request handler failed: nope")
        );
    }

    #[tokio::test]
    async fn abort_closes_without_a_response() {
        let handler = |_: &mut Context, req: &mut Request| -> Result<Response, HandlerError> {
            req.abort();
            Ok(Response::new(StatusCode::Ok).body("never sent"))
        };

        let wire = exchange(
            handler,
            ConnLimits::default(),
            b"GET / HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n",
        )
        .await;

        assert_eq!(wire, "");
    }

    #[tokio::test]
    async fn abort_mid_stream_ends_the_connection() {
        let handler = |_: &mut Context, req: &mut Request| -> Result<Response, HandlerError> {
            let (tx, body) = Body::channel(1);
            let connection = req.connection().clone();

            std::thread::spawn(move || {
                let _ = tx.blocking_send(b"first".to_vec());
                std::thread::sleep(std::time::Duration::from_millis(20));
                connection.abort();
                // Keeps the sender alive well past the abort.
                std::thread::sleep(std::time::Duration::from_secs(5));
                drop(tx);
            });
            Ok(Response::new(StatusCode::Ok).body(body))
        };

        let served = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            exchange(
                handler,
                ConnLimits::default(),
                b"GET /feed HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n",
            ),
        )
        .await;

        let wire = served.expect("connection hung after abort");
        assert_eq!(statuses(&wire), ["HTTP/1.1 200 OK"]);
        assert!(wire.ends_with("\r\n\r\n5\r\nfirst\r\n"), "{wire}");
    }

    #[tokio::test]
    async fn deferred_responses_are_awaited() {
        let handler = |ctx: &mut Context, _: &mut Request| -> Result<Response, HandlerError> {
            let (pending, commit) = Response::defer();
            let index = ctx.request_index();

            std::thread::spawn(move || {
                commit.commit(Response::new(StatusCode::Accepted).body(format!("#{index}")));
            });
            Ok(pending)
        };

        let wire = exchange(
            handler,
            ConnLimits::default(),
            b"POST /jobs HTTP/1.1\r\ncontent-length: 0\r\n\r\nPOST /jobs HTTP/1.1\r\n\r\n",
        )
        .await;

        assert_eq!(statuses(&wire), ["HTTP/1.1 202 Accepted", "HTTP/1.1 202 Accepted"]);
        assert!(wire.contains("\r\n\r\n#0") && wire.ends_with("\r\n\r\n#1"));
    }

    #[tokio::test]
    async fn abandoned_responses_close_the_connection() {
        let handler = |_: &mut Context, _: &mut Request| -> Result<Response, HandlerError> {
            let (pending, commit) = Response::defer();
            drop(commit);
            Ok(pending)
        };

        let wire = exchange(handler, ConnLimits::default(), b"GET / HTTP/1.1\r\n\r\n").await;
        assert_eq!(wire, "");
    }

    #[tokio::test]
    async fn framing_errors_get_canned_responses() {
        let handler = |_: &mut Context, _: &mut Request| -> Result<Response, HandlerError> {
            Ok(Response::new(StatusCode::Ok))
        };

        let wire = exchange(
            handler,
            ConnLimits::default(),
            b"GET / HTTP/1.1\r\n\r\nBREW /pot HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n",
        )
        .await;

        assert_eq!(statuses(&wire), ["HTTP/1.1 200 OK", "HTTP/1.1 400 Bad Request"]);
        assert!(wire.ends_with(r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#));
    }

    #[tokio::test]
    async fn failed_error_responses_still_close_cleanly() {
        let handler = |_: &mut Context, _: &mut Request| -> Result<Response, HandlerError> {
            Ok(Response::new(StatusCode::Ok))
        };
        let (mut client, server) = tokio::io::duplex(1024);
        let (_stop_tx, stop_rx) = watch::channel(false);

        client.write_all(b"BREW /pot HTTP/1.1\r\n\r\n").await.unwrap();
        drop(client);

        let mut connection = HttpConnection::new(Arc::new(handler), limits(ConnLimits::default()));
        let served = connection.run(server, test_connection(false), stop_rx).await;

        assert!(served.is_ok());
    }

    #[tokio::test]
    async fn request_limit_closes_after_last_response() {
        let handler = |_: &mut Context, _: &mut Request| -> Result<Response, HandlerError> {
            Ok(Response::new(StatusCode::Ok).body("x"))
        };
        let conn = ConnLimits {
            max_requests_per_connection: 2,
            ..ConnLimits::default()
        };

        let wire = exchange(
            handler,
            conn,
            b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n",
        )
        .await;

        assert_eq!(statuses(&wire).len(), 2);
        assert_eq!(wire.matches("connection: close").count(), 1);
    }

    #[tokio::test]
    async fn http10_closes_by_default() {
        let handler = |_: &mut Context, req: &mut Request| -> Result<Response, HandlerError> {
            let body = format!("served {}", req.version().as_str());
            Ok(Response::new(StatusCode::Ok).entity(Entity::new(body)))
        };

        let wire = exchange(
            handler,
            ConnLimits::default(),
            b"GET / HTTP/1.0\r\n\r\nGET / HTTP/1.0\r\n\r\n",
        )
        .await;

        assert_eq!(statuses(&wire), ["HTTP/1.0 200 OK"]);
        assert!(wire.contains("connection: close\r\n"));
        assert!(wire.ends_with("\r\n\r\nserved HTTP/1.0"));
    }

    #[tokio::test]
    async fn context_is_fresh_per_request() {
        let handler = |ctx: &mut Context, _: &mut Request| -> Result<Response, HandlerError> {
            let leaked = ctx.attribute("seen").is_some();
            ctx.set_attribute("seen", true);
            Ok(Response::new(StatusCode::Ok).body(if leaked { "leaked" } else { "clean" }))
        };

        let wire = exchange(
            handler,
            ConnLimits::default(),
            b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n",
        )
        .await;

        assert_eq!(wire.matches("clean").count(), 2);
    }
}
