//! Outbound response writer.
//!
//! Turns a committed [`Response`] into wire bytes: runs the entity/status
//! policy, owns the framing headers and decides whether the connection
//! persists.

use crate::{
    errors::{Error, ErrorKind},
    http::{
        header,
        response::{Body, Entity, Response, SendOutcome},
        types::{Method, StatusCode, Version},
    },
    limits::RespLimits,
    server::connection::stopped,
};
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    time::{Duration, SystemTime},
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::watch,
    time::timeout,
};

// POLICY

/// Which entity headers go on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntityHeaders {
    None,
    Full,
    /// Cache validators only, for `304 Not Modified`.
    NotModified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntityPolicy {
    pub(crate) headers: EntityHeaders,
    pub(crate) send_body: bool,
    pub(crate) warning: Option<&'static str>,
}

const NO_ENTITY_FOR_OK: &str =
    "a 200 response to GET should carry an entity; return one or use 204 (No Content)";
const ENTITY_ON_NO_CONTENT: &str = "ignoring the entity of a 204 (No Content) response";
const ENTITY_ON_RESET_CONTENT: &str = "ignoring the entity of a 205 (Reset Content) response";
const ENTITY_ON_INFORMATIONAL: &str = "ignoring the entity of an informational response";
const UNAVAILABLE_ENTITY: &str = "ignoring an unavailable and potentially non-empty entity";

/// Decides, from the method and final status, what may be said about the
/// entity and whether its content is sent. First matching rule wins.
pub(crate) fn entity_policy(
    method: Method,
    status: StatusCode,
    entity: Option<&Entity>,
) -> EntityPolicy {
    let present = entity.is_some();
    let available = entity.is_some_and(Entity::is_available);

    let (headers, send_body, warning) = if method == Method::Head {
        (EntityHeaders::Full, false, None)
    } else if method == Method::Get && status == StatusCode::Ok && !available {
        (EntityHeaders::Full, false, Some(NO_ENTITY_FOR_OK))
    } else if status == StatusCode::NoContent {
        (EntityHeaders::Full, false, present.then_some(ENTITY_ON_NO_CONTENT))
    } else if status == StatusCode::ResetContent {
        (EntityHeaders::None, false, present.then_some(ENTITY_ON_RESET_CONTENT))
    } else if status == StatusCode::NotModified {
        (EntityHeaders::NotModified, false, None)
    } else if status.is_informational() {
        (EntityHeaders::None, false, present.then_some(ENTITY_ON_INFORMATIONAL))
    } else {
        let lossy = entity.is_some_and(|e| !e.is_available() && e.size() != Some(0));
        (EntityHeaders::Full, available, lossy.then_some(UNAVAILABLE_ENTITY))
    };

    EntityPolicy {
        headers,
        send_body,
        warning,
    }
}

// PERSISTENCE

/// Whether the client asked to keep the connection open.
///
/// `HTTP/1.1` persists unless `close` is listed; `HTTP/1.0` only when
/// `keep-alive` is listed.
pub(crate) fn client_keep_alive(version: Version, connection: Option<&str>) -> bool {
    let has = |token: &str| {
        connection.is_some_and(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    };

    match version {
        Version::Http11 => !has("close"),
        Version::Http10 => has("keep-alive"),
    }
}

#[inline(always)]
fn connection_header(version: Version, keep_alive: bool) -> Option<&'static [u8]> {
    match (version, keep_alive) {
        (Version::Http11, true) => None,
        (Version::Http10, true) => Some(b"connection: keep-alive\r\n"),
        (_, false) => Some(b"connection: close\r\n"),
    }
}

// WRITER

/// Writes a canned framing error. The connection always closes after it.
pub(crate) async fn send_error<W: AsyncWrite + Unpin>(
    stream: &mut W,
    error: ErrorKind,
    version: Version,
    json: bool,
    write_timeout: Duration,
) -> io::Result<()> {
    timeout(write_timeout, stream.write_all(error.as_http(version, json))).await??;
    timeout(write_timeout, stream.flush()).await?
}

/// How the end of the body is signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// No body and no `content-length` (1xx, 204, 304).
    Bodiless,
    Length(u64),
    Chunked,
    /// Body ends when the connection closes.
    UntilClose,
}

/// Per-request facts the writer needs besides the response.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Exchange {
    pub(crate) method: Method,
    pub(crate) version: Version,
    /// Client and connection limits both allow another request.
    pub(crate) keep_alive: bool,
}

struct Prepared {
    status: StatusCode,
    framing: Framing,
    body: Option<Body>,
    keep_alive: bool,
}

/// Fires the completion callback exactly once, even when the write future
/// is dropped halfway.
struct SentGuard {
    callback: Option<Box<dyn FnOnce(&SendOutcome) + Send + 'static>>,
    outcome: SendOutcome,
}

impl Drop for SentGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            let outcome = &self.outcome;

            if panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
                tracing::error!(status = outcome.status.as_u16(), "response-sent callback panicked");
            }
        }
    }
}

pub(crate) struct Writer {
    buffer: Vec<u8>,
    limits: RespLimits,
    write_timeout: Duration,
}

impl Writer {
    pub(crate) fn new(limits: RespLimits, write_timeout: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(limits.default_capacity),
            limits,
            write_timeout,
        }
    }

    /// Writes `response` and reports what reached the wire.
    ///
    /// A streamed body is cut as soon as `abort` reads `true`, or when its
    /// producer stays silent past `stream_idle_timeout`; the connection must
    /// then be closed.
    pub(crate) async fn send<W>(
        &mut self,
        stream: &mut W,
        exchange: Exchange,
        mut response: Response,
        mut abort: watch::Receiver<bool>,
    ) -> SendOutcome
    where
        W: AsyncWrite + Unpin,
    {
        let mut guard = SentGuard {
            callback: response.take_on_sent(),
            outcome: SendOutcome {
                status: response.status(),
                written: 0,
                keep_alive: false,
                completed: false,
            },
        };

        let prepared = match self.prepare(exchange, &mut response) {
            Ok(prepared) => prepared,
            Err(err) => {
                tracing::error!(error = %err, "unable to compose the response, sending 500");
                self.prepare_fault(exchange)
            }
        };

        let Prepared {
            status,
            framing,
            body,
            keep_alive,
        } = prepared;
        guard.outcome.status = status;
        guard.outcome.keep_alive = keep_alive;

        match self.transmit(stream, framing, body, &mut abort).await {
            Ok(Transmitted { written, intact }) => {
                guard.outcome.written = written;
                guard.outcome.completed = intact;
                guard.outcome.keep_alive &= intact;
            }
            Err(err) => {
                tracing::debug!(error = %err, "response write failed");
                guard.outcome.keep_alive = false;
            }
        }

        self.reset();
        guard.outcome.clone()
    }

    fn reset(&mut self) {
        if self.buffer.capacity() > self.limits.max_capacity {
            self.buffer = Vec::with_capacity(self.limits.default_capacity);
        } else {
            self.buffer.clear();
        }
    }

    fn prepare(&mut self, exchange: Exchange, response: &mut Response) -> Result<Prepared, Error> {
        let status = response.status();
        let policy = entity_policy(exchange.method, status, response.entity_ref());

        if let Some(warning) = policy.warning {
            tracing::warn!(
                method = exchange.method.as_str(),
                status = status.as_u16(),
                "{warning}"
            );
        }

        let mut entity = response.take_entity();

        // Templates are rendered before the head so their size is known.
        if let Some(entity) = entity.as_mut().filter(|e| e.is_available()) {
            let needs_render = policy.send_body || exchange.method == Method::Head;

            if needs_render {
                if let Body::Template(template) = &entity.body {
                    let rendered = template.render()?;
                    entity.body = Body::Bytes(rendered.into_bytes());
                }
            }
        }

        let framing = match (status, policy.send_body, &entity) {
            (s, ..) if s.is_informational() => Framing::Bodiless,
            (StatusCode::NoContent | StatusCode::NotModified, ..) => Framing::Bodiless,
            (_, true, Some(entity)) => match entity.size() {
                Some(size) => Framing::Length(size),
                None if exchange.version == Version::Http11 => Framing::Chunked,
                None => Framing::UntilClose,
            },
            (_, false, Some(entity)) if exchange.method == Method::Head => {
                entity.size().map_or(Framing::Bodiless, Framing::Length)
            }
            _ => Framing::Length(0),
        };

        let keep_alive = exchange.keep_alive
            && !response.close
            && !client_closes(response)
            && framing != Framing::UntilClose;

        self.buffer.clear();
        self.buffer
            .extend_from_slice(status.into_first_line(exchange.version));

        let mut has_date = false;
        for line in response.headers() {
            if line.is("content-length") || line.is("transfer-encoding") || line.is("connection") {
                continue;
            }
            has_date |= line.is("date");
            push_header(&mut self.buffer, line.name(), line.value())?;
        }

        if let Some(entity) = &entity {
            entity_headers(&mut self.buffer, entity, policy.headers)?;
        }

        if !has_date {
            push_header(&mut self.buffer, "date", &header::write_date(SystemTime::now()))?;
        }

        match framing {
            Framing::Length(size) => {
                push_header(&mut self.buffer, "content-length", &size.to_string())?;
            }
            Framing::Chunked => self.buffer.extend_from_slice(b"transfer-encoding: chunked\r\n"),
            Framing::Bodiless | Framing::UntilClose => {}
        }

        if let Some(line) = connection_header(exchange.version, keep_alive) {
            self.buffer.extend_from_slice(line);
        }
        self.buffer.extend_from_slice(b"\r\n");

        let body = match (policy.send_body, entity) {
            (true, Some(entity)) => Some(entity.body),
            _ => None,
        };

        Ok(Prepared {
            status,
            framing,
            body,
            keep_alive,
        })
    }

    fn prepare_fault(&mut self, exchange: Exchange) -> Prepared {
        let status = StatusCode::InternalServerError;

        self.buffer.clear();
        self.buffer
            .extend_from_slice(status.into_first_line(exchange.version));
        self.buffer.extend_from_slice(b"date: ");
        self.buffer
            .extend_from_slice(header::write_date(SystemTime::now()).as_bytes());
        self.buffer.extend_from_slice(b"\r\ncontent-length: 0\r\n");
        if let Some(line) = connection_header(exchange.version, exchange.keep_alive) {
            self.buffer.extend_from_slice(line);
        }
        self.buffer.extend_from_slice(b"\r\n");

        Prepared {
            status,
            framing: Framing::Length(0),
            body: None,
            keep_alive: exchange.keep_alive,
        }
    }

    async fn transmit<W>(
        &mut self,
        stream: &mut W,
        framing: Framing,
        body: Option<Body>,
        abort: &mut watch::Receiver<bool>,
    ) -> io::Result<Transmitted>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0;
        let mut intact = true;

        match body {
            None | Some(Body::Empty) | Some(Body::Template(_)) => {
                self.write_all(stream, &self.buffer).await?;
            }
            Some(Body::Bytes(bytes)) => {
                if self.buffer.len() + bytes.len() <= self.limits.max_capacity {
                    self.buffer.extend_from_slice(&bytes);
                    self.write_all(stream, &self.buffer).await?;
                } else {
                    self.write_all(stream, &self.buffer).await?;
                    self.write_all(stream, &bytes).await?;
                }
                written = bytes.len() as u64;
            }
            Some(Body::Stream(mut rx)) => {
                self.write_all(stream, &self.buffer).await?;

                loop {
                    let chunk = tokio::select! {
                        biased;
                        _ = stopped(abort) => {
                            intact = false;
                            break;
                        }
                        next = timeout(self.limits.stream_idle_timeout, rx.recv()) => match next {
                            Ok(Some(chunk)) => chunk,
                            Ok(None) => break,
                            Err(_) => {
                                tracing::warn!("streamed body producer went idle, cutting the response");
                                intact = false;
                                break;
                            }
                        },
                    };

                    for part in chunk.chunks(self.limits.chunk_size.max(1)) {
                        self.write_part(stream, framing, part, &mut written)
                            .await?;
                    }
                }

                if intact && framing == Framing::Chunked {
                    self.write_all(stream, b"0\r\n\r\n").await?;
                }
                if let Framing::Length(size) = framing {
                    if written != size {
                        tracing::warn!(declared = size, written, "streamed body size mismatch");
                        intact = false;
                        written = written.min(size);
                    }
                }
            }
        }

        self.flush(stream).await?;
        Ok(Transmitted { written, intact })
    }

    async fn write_part<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut W,
        framing: Framing,
        part: &[u8],
        written: &mut u64,
    ) -> io::Result<()> {
        if part.is_empty() {
            return Ok(());
        }

        match framing {
            Framing::Chunked => {
                let size = format!("{:x}\r\n", part.len());
                self.write_all(stream, size.as_bytes()).await?;
                self.write_all(stream, part).await?;
                self.write_all(stream, b"\r\n").await?;
            }
            Framing::Length(size) => {
                let room = size.saturating_sub(*written) as usize;
                self.write_all(stream, &part[..part.len().min(room)]).await?;
                *written += part.len() as u64;
                return Ok(());
            }
            Framing::UntilClose => self.write_all(stream, part).await?,
            Framing::Bodiless => return Ok(()),
        }

        *written += part.len() as u64;
        Ok(())
    }

    #[inline]
    async fn write_all<W: AsyncWrite + Unpin>(&self, stream: &mut W, bytes: &[u8]) -> io::Result<()> {
        timeout(self.write_timeout, stream.write_all(bytes)).await?
    }

    #[inline]
    async fn flush<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> io::Result<()> {
        timeout(self.write_timeout, stream.flush()).await?
    }
}

struct Transmitted {
    written: u64,
    /// The body ended where its framing said it would.
    intact: bool,
}

/// Handler-supplied `connection: close` is honored, then dropped.
fn client_closes(response: &Response) -> bool {
    response
        .headers()
        .values("connection")
        .any(|value| value.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
}

fn entity_headers(buffer: &mut Vec<u8>, entity: &Entity, kind: EntityHeaders) -> Result<(), Error> {
    match kind {
        EntityHeaders::None => {}
        EntityHeaders::Full => {
            if let Some(media_type) = &entity.media_type {
                push_header(buffer, "content-type", media_type)?;
            }
            if !entity.encodings.is_empty() {
                push_header(buffer, "content-encoding", &entity.encodings.join(", "))?;
            }
            if !entity.languages.is_empty() {
                push_header(buffer, "content-language", &entity.languages.join(", "))?;
            }
            if let Some(tag) = &entity.tag {
                push_header(buffer, "etag", &tag.format())?;
            }
            if let Some(date) = entity.modification_date {
                push_header(buffer, "last-modified", &header::write_date(date))?;
            }
            if let Some(date) = entity.expiration_date {
                push_header(buffer, "expires", &header::write_date(date))?;
            }
            if let Some(location) = &entity.location {
                push_header(buffer, "content-location", location)?;
            }
            if let Some(disposition) = &entity.disposition {
                push_header(buffer, "content-disposition", disposition)?;
            }
        }
        EntityHeaders::NotModified => {
            if let Some(tag) = &entity.tag {
                push_header(buffer, "etag", &tag.format())?;
            }
            if let Some(date) = entity.expiration_date {
                push_header(buffer, "expires", &header::write_date(date))?;
            }
            if let Some(location) = &entity.location {
                push_header(buffer, "content-location", location)?;
            }
        }
    }

    Ok(())
}

fn push_header(buffer: &mut Vec<u8>, name: &str, value: &str) -> Result<(), Error> {
    let valid_name = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b));
    let valid_value = !value.bytes().any(|b| matches!(b, b'\r' | b'\n' | b'\0'));

    if !valid_name || !valid_value {
        return Err(Error::Write(format!("invalid header line `{name}`")));
    }

    buffer.extend_from_slice(name.as_bytes());
    buffer.extend_from_slice(b": ");
    buffer.extend_from_slice(value.as_bytes());
    buffer.extend_from_slice(b"\r\n");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{header::Tag, template::tests::Greeter, template::TemplateBody};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };
    use tokio::io::AsyncReadExt;

    #[test]
    #[rustfmt::skip]
    fn policy_table() {
        use EntityHeaders::{Full, None as NoHeaders, NotModified};
        use Method::*;
        use StatusCode as S;

        let available = Some(Entity::new("data"));
        let unavailable = Some(Entity::new("data").unavailable());
        let empty_unavailable = Some(Entity::new(Body::Empty).unavailable());
        let absent: Option<Entity> = None;

        let cases = [
            // method, status, entity,            headers,     body,  warning
            (Head,   S::Ok,              &available,         Full,        false, false),
            (Head,   S::NotFound,        &absent,            Full,        false, false),
            (Get,    S::Ok,              &absent,            Full,        false, true),
            (Get,    S::Ok,              &unavailable,       Full,        false, true),
            (Get,    S::Ok,              &available,         Full,        true,  false),
            (Post,   S::NoContent,       &available,         Full,        false, true),
            (Post,   S::NoContent,       &absent,            Full,        false, false),
            (Put,    S::ResetContent,    &available,         NoHeaders,   false, true),
            (Put,    S::ResetContent,    &absent,            NoHeaders,   false, false),
            (Get,    S::NotModified,     &available,         NotModified, false, false),
            (Get,    S::Continue,        &available,         NoHeaders,   false, true),
            (Get,    S::SwitchingProtocols, &absent,         NoHeaders,   false, false),
            (Post,   S::Ok,              &absent,            Full,        false, false),
            (Post,   S::Created,         &unavailable,       Full,        false, true),
            (Delete, S::Accepted,        &empty_unavailable, Full,        false, false),
            (Get,    S::NotFound,        &available,         Full,        true,  false),
        ];

        for (method, status, entity, headers, send_body, warning) in cases {
            let policy = entity_policy(method, status, entity.as_ref());
            assert_eq!(policy.headers, headers, "{method} {status}");
            assert_eq!(policy.send_body, send_body, "{method} {status}");
            assert_eq!(policy.warning.is_some(), warning, "{method} {status}");
        }
    }

    #[test]
    #[rustfmt::skip]
    fn keep_alive_negotiation() {
        let cases = [
            (Version::Http11, None,                          true),
            (Version::Http11, Some("close"),                 false),
            (Version::Http11, Some("Upgrade, Close"),        false),
            (Version::Http11, Some("keep-alive"),            true),
            (Version::Http10, None,                          false),
            (Version::Http10, Some("Keep-Alive"),            true),
            (Version::Http10, Some("close"),                 false),
        ];

        for (version, header, expected) in cases {
            assert_eq!(client_keep_alive(version, header), expected, "{version:?} {header:?}");
        }
    }

    fn exchange(method: Method, version: Version) -> Exchange {
        Exchange {
            method,
            version,
            keep_alive: true,
        }
    }

    /// Abort signal that never fires.
    fn never_aborted() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    async fn send_to_string(exchange: Exchange, response: Response) -> (String, SendOutcome) {
        send_with(RespLimits::default(), exchange, response, never_aborted()).await
    }

    async fn send_with(
        limits: RespLimits,
        exchange: Exchange,
        response: Response,
        abort: watch::Receiver<bool>,
    ) -> (String, SendOutcome) {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let mut writer = Writer::new(limits, Duration::from_secs(1));

        let sending = writer.send(&mut server, exchange, response, abort);
        let outcome = tokio::time::timeout(Duration::from_secs(5), sending)
            .await
            .expect("response write hung");
        drop(server);

        let mut wire = String::new();
        client.read_to_string(&mut wire).await.unwrap();
        (wire, outcome)
    }

    fn without_date(wire: &str) -> String {
        wire.split("\r\n")
            .filter(|line| !line.starts_with("date: "))
            .collect::<Vec<_>>()
            .join("\r\n")
    }

    #[tokio::test]
    async fn plain_entity() {
        let response = Response::new(StatusCode::Ok)
            .header("X-Trace", "abc")
            .header("Content-Length", "999")
            .header("Connection", "keep-alive")
            .entity(Entity::new("hello").media_type("text/plain"));

        let (wire, outcome) = send_to_string(exchange(Method::Get, Version::Http11), response).await;

        assert_eq!(
            without_date(&wire),
            "HTTP/1.1 200 OK\r\nX-Trace: abc\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n\r\nhello"
        );
        assert!(wire.contains("\r\ndate: "));
        assert_eq!(
            outcome,
            SendOutcome {
                status: StatusCode::Ok,
                written: 5,
                keep_alive: true,
                completed: true,
            }
        );
    }

    #[tokio::test]
    async fn head_sends_headers_only() {
        let response = Response::new(StatusCode::Ok)
            .entity(Entity::new("hello").media_type("text/plain").tag(Tag::strong("v1")));

        let (wire, outcome) = send_to_string(exchange(Method::Head, Version::Http11), response).await;

        assert_eq!(
            without_date(&wire),
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\netag: \"v1\"\r\ncontent-length: 5\r\n\r\n"
        );
        assert_eq!(outcome.written, 0);
    }

    #[tokio::test]
    async fn not_modified_keeps_validators_only() {
        let response = Response::new(StatusCode::NotModified).entity(
            Entity::new("hello")
                .media_type("text/plain")
                .tag(Tag::weak("v2"))
                .location("/doc"),
        );

        let (wire, _) = send_to_string(exchange(Method::Get, Version::Http11), response).await;

        assert_eq!(
            without_date(&wire),
            "HTTP/1.1 304 Not Modified\r\netag: W/\"v2\"\r\ncontent-location: /doc\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn reset_content_strips_entity() {
        let response = Response::new(StatusCode::ResetContent)
            .entity(Entity::new("gone").media_type("text/plain"));

        let (wire, outcome) = send_to_string(exchange(Method::Post, Version::Http11), response).await;

        assert_eq!(
            without_date(&wire),
            "HTTP/1.1 205 Reset Content\r\ncontent-length: 0\r\n\r\n"
        );
        assert_eq!(outcome.written, 0);
    }

    #[tokio::test]
    async fn http10_keep_alive_is_announced() {
        let response = Response::new(StatusCode::NotFound);
        let (wire, outcome) = send_to_string(exchange(Method::Get, Version::Http10), response).await;

        assert_eq!(
            without_date(&wire),
            "HTTP/1.0 404 Not Found\r\ncontent-length: 0\r\nconnection: keep-alive\r\n\r\n"
        );
        assert!(outcome.keep_alive);
    }

    #[tokio::test]
    async fn close_requested_by_handler() {
        let response = Response::new(StatusCode::Ok).body("x").close();
        let (wire, outcome) = send_to_string(exchange(Method::Get, Version::Http11), response).await;

        assert!(wire.contains("connection: close\r\n"));
        assert!(!outcome.keep_alive);
    }

    #[tokio::test]
    async fn streamed_bodies_are_chunked_on_http11() {
        let (tx, body) = Body::channel(4);
        tokio::spawn(async move {
            for part in ["Hello, ", "", "world"] {
                tx.send(part.as_bytes().to_vec()).await.unwrap();
            }
        });

        let response = Response::new(StatusCode::Ok).body(body);
        let (wire, outcome) = send_to_string(exchange(Method::Get, Version::Http11), response).await;

        assert_eq!(
            without_date(&wire),
            "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n7\r\nHello, \r\n5\r\nworld\r\n0\r\n\r\n"
        );
        assert_eq!(outcome.written, 12);
        assert!(outcome.keep_alive);
    }

    #[tokio::test]
    async fn streamed_bodies_close_on_http10() {
        let (tx, body) = Body::channel(1);
        tokio::spawn(async move {
            tx.send(b"raw".to_vec()).await.unwrap();
        });

        let response = Response::new(StatusCode::Ok).body(body);
        let (wire, outcome) = send_to_string(exchange(Method::Get, Version::Http10), response).await;

        assert_eq!(
            without_date(&wire),
            "HTTP/1.0 200 OK\r\nconnection: close\r\n\r\nraw"
        );
        assert!(!outcome.keep_alive);
        assert!(outcome.completed);
    }

    #[tokio::test]
    async fn templates_render_at_write_time() {
        let template = TemplateBody::new(Arc::new(Greeter), "hello").variable("who", "Ada");
        let response = Response::new(StatusCode::Ok)
            .entity(Entity::new(template).media_type("text/html"));

        let (wire, outcome) = send_to_string(exchange(Method::Get, Version::Http11), response).await;

        assert!(wire.ends_with("content-length: 16\r\n\r\n[en] Hello, Ada!"), "{wire}");
        assert_eq!(outcome.status, StatusCode::Ok);
    }

    #[tokio::test]
    async fn write_faults_force_500_and_fire_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));

        let response = Response::new(StatusCode::Ok)
            .entity(Entity::new(TemplateBody::new(Arc::new(Greeter), "missing")))
            .on_sent({
                let fired = fired.clone();
                let seen = seen.clone();
                move |outcome| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    *seen.lock().unwrap() = Some(outcome.status);
                }
            });

        let (wire, outcome) = send_to_string(exchange(Method::Get, Version::Http11), response).await;

        assert!(wire.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert_eq!(outcome.status, StatusCode::InternalServerError);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), Some(StatusCode::InternalServerError));
    }

    #[tokio::test]
    async fn invalid_header_values_are_write_faults() {
        let response = Response::new(StatusCode::Ok).header("x-bad", "a\r\nb").body("x");
        let (wire, _) = send_to_string(exchange(Method::Get, Version::Http11), response).await;

        assert!(wire.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!wire.contains("x-bad"));
    }

    #[tokio::test]
    async fn callback_fires_when_transport_is_gone() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);

        let response = Response::new(StatusCode::Ok).body("hello").on_sent({
            let fired = fired.clone();
            move |outcome| {
                assert!(!outcome.completed);
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut writer = Writer::new(RespLimits::default(), Duration::from_secs(1));
        let outcome = writer
            .send(&mut server, exchange(Method::Get, Version::Http11), response, never_aborted())
            .await;

        assert!(!outcome.completed);
        assert!(!outcome.keep_alive);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_memory_bodies_ignore_size_hints() {
        let cases = [
            (Entity::new("hello").size_hint(3), "content-length: 5\r\n\r\nhello"),
            (Entity::new("hi").size_hint(40), "content-length: 2\r\n\r\nhi"),
            (Entity::new(Body::Empty).size_hint(42), "content-length: 0\r\n\r\n"),
        ];

        for (entity, tail) in cases {
            let response = Response::new(StatusCode::Ok).entity(entity);
            let (wire, outcome) =
                send_to_string(exchange(Method::Get, Version::Http11), response).await;

            assert!(wire.ends_with(tail), "{wire}");
            assert!(outcome.completed && outcome.keep_alive);
        }
    }

    #[tokio::test]
    async fn short_streams_break_the_declared_length() {
        let (tx, body) = Body::channel(1);
        tokio::spawn(async move {
            tx.send(b"abc".to_vec()).await.unwrap();
        });

        let response = Response::new(StatusCode::Ok).entity(Entity::new(body).size_hint(10));
        let (wire, outcome) = send_to_string(exchange(Method::Get, Version::Http11), response).await;

        assert!(wire.ends_with("content-length: 10\r\n\r\nabc"), "{wire}");
        assert_eq!(outcome.written, 3);
        assert!(!outcome.completed);
        assert!(!outcome.keep_alive);
    }

    #[tokio::test]
    async fn abort_cuts_a_stalled_stream() {
        let (tx, body) = Body::channel(1);
        let (cut, abort) = watch::channel(false);

        // The producer sends one chunk, then goes quiet without dropping
        // its sender.
        let producer = tokio::spawn(async move {
            tx.send(b"part".to_vec()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            cut.send_replace(true);
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(tx);
        });

        let response = Response::new(StatusCode::Ok).body(body);
        let (wire, outcome) = send_with(
            RespLimits::default(),
            exchange(Method::Get, Version::Http11),
            response,
            abort,
        )
        .await;
        producer.abort();

        assert!(wire.ends_with("\r\n\r\n4\r\npart\r\n"), "{wire}");
        assert_eq!(outcome.written, 4);
        assert!(!outcome.completed);
        assert!(!outcome.keep_alive);
    }

    #[tokio::test]
    async fn idle_producers_are_cut() {
        let (_tx, body) = Body::channel(1);
        let limits = RespLimits {
            stream_idle_timeout: Duration::from_millis(30),
            ..RespLimits::default()
        };

        let response = Response::new(StatusCode::Ok).body(body);
        let (wire, outcome) = send_with(
            limits,
            exchange(Method::Get, Version::Http10),
            response,
            never_aborted(),
        )
        .await;

        assert!(wire.ends_with("connection: close\r\n\r\n"), "{wire}");
        assert!(!outcome.completed);
        assert!(!outcome.keep_alive);
    }
}
