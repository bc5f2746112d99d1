//! Outbound responses produced by a [`Handler`](crate::Handler).

use crate::{
    errors::Error,
    http::{
        header::Tag,
        template::TemplateBody,
        types::{HeaderSet, StatusCode},
    },
};
use std::{fmt, time::SystemTime};
use tokio::sync::{mpsc, oneshot};

/// HTTP response returned by a handler.
///
/// The connector strips anything the final status forbids (an entity on a
/// `205`, say) instead of rejecting the response. It also owns the framing
/// headers: `content-length`, `transfer-encoding` and `connection` set here
/// are dropped on the wire. Use [`close()`](Response::close) to end the
/// connection after this response.
///
/// # Examples
/// ```
/// use conduit_http::{Entity, Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("cache-control", "no-store")
///     .entity(Entity::new("<h1>Hello World</h1>").media_type("text/html"));
///
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.entity_ref().and_then(|e| e.size()), Some(20));
/// ```
pub struct Response {
    status: StatusCode,
    headers: HeaderSet,
    entity: Option<Entity>,
    pub(crate) close: bool,
    on_sent: Option<SentCallback>,
    cause: Option<Error>,
    deferred: Option<oneshot::Receiver<Response>>,
}

type SentCallback = Box<dyn FnOnce(&SendOutcome) + Send + 'static>;

/// What the connector did with a response, passed to the
/// [`on_sent`](Response::on_sent) callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// Status that actually went on the wire.
    pub status: StatusCode,
    /// Entity bytes written, excluding chunk framing.
    pub written: u64,
    /// Whether the connection stays open for another request.
    pub keep_alive: bool,
    /// `false` when the transport failed before the response was complete.
    pub completed: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderSet::new(),
            entity: None,
            close: false,
            on_sent: None,
            cause: None,
            deferred: None,
        }
    }

    /// `500` carrying the fault that produced it.
    ///
    /// The cause is kept for diagnostics and never written to the client.
    pub fn internal_error(cause: Error) -> Self {
        let mut response = Self::new(StatusCode::InternalServerError);
        response.cause = Some(cause);
        response
    }

    /// Response that will be committed later, from another thread.
    ///
    /// The connector holds the connection until [`Commit::commit`] is
    /// called. Dropping the [`Commit`] abandons the request and closes the
    /// connection, since nothing can be written in order any more.
    ///
    /// # Examples
    /// ```
    /// use conduit_http::{Response, StatusCode};
    ///
    /// let (pending, commit) = Response::defer();
    /// assert!(pending.is_deferred());
    ///
    /// std::thread::spawn(move || {
    ///     commit.commit(Response::new(StatusCode::Accepted));
    /// });
    /// ```
    pub fn defer() -> (Response, Commit) {
        let (tx, rx) = oneshot::channel();
        let mut response = Self::new(StatusCode::Ok);
        response.deferred = Some(rx);
        (response, Commit(tx))
    }

    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Appends a header. Duplicates are kept in order.
    #[inline]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    #[inline]
    pub fn headers(&self) -> &HeaderSet {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderSet {
        &mut self.headers
    }

    #[inline]
    pub fn entity(mut self, entity: Entity) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Shorthand for an entity with no describing metadata.
    #[inline]
    pub fn body(self, body: impl Into<Body>) -> Self {
        self.entity(Entity::new(body))
    }

    #[inline]
    pub fn set_entity(&mut self, entity: Option<Entity>) {
        self.entity = entity;
    }

    #[inline]
    pub fn entity_ref(&self) -> Option<&Entity> {
        self.entity.as_ref()
    }

    #[inline]
    pub fn take_entity(&mut self) -> Option<Entity> {
        self.entity.take()
    }

    /// Closes the connection once this response is written.
    #[inline]
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Registers a callback fired exactly once after the write attempt,
    /// whether or not it succeeded.
    pub fn on_sent<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&SendOutcome) + Send + 'static,
    {
        self.on_sent = Some(Box::new(callback));
        self
    }

    /// Fault that turned this into a `500`, if any.
    #[inline]
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_ref()
    }

    #[inline]
    pub fn is_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    #[inline]
    pub(crate) fn take_deferred(&mut self) -> Option<oneshot::Receiver<Response>> {
        self.deferred.take()
    }

    #[inline]
    pub(crate) fn take_on_sent(&mut self) -> Option<SentCallback> {
        self.on_sent.take()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("entity", &self.entity)
            .field("close", &self.close)
            .field("cause", &self.cause)
            .field("deferred", &self.deferred.is_some())
            .finish_non_exhaustive()
    }
}

/// Completes a [`Response::defer`]red response.
#[derive(Debug)]
pub struct Commit(oneshot::Sender<Response>);

impl Commit {
    pub fn commit(self, response: Response) {
        // The receiver is gone only when the connection already closed.
        let _ = self.0.send(response);
    }
}

//

/// Entity body plus the metadata that becomes entity headers.
#[derive(Debug)]
pub struct Entity {
    pub(crate) body: Body,
    pub(crate) media_type: Option<String>,
    pub(crate) encodings: Vec<String>,
    pub(crate) languages: Vec<String>,
    pub(crate) tag: Option<Tag>,
    pub(crate) modification_date: Option<SystemTime>,
    pub(crate) expiration_date: Option<SystemTime>,
    pub(crate) location: Option<String>,
    pub(crate) disposition: Option<String>,
    pub(crate) available: bool,
    declared_size: Option<u64>,
}

impl Entity {
    pub fn new(body: impl Into<Body>) -> Self {
        Self {
            body: body.into(),
            media_type: None,
            encodings: Vec::new(),
            languages: Vec::new(),
            tag: None,
            modification_date: None,
            expiration_date: None,
            location: None,
            disposition: None,
            available: true,
            declared_size: None,
        }
    }

    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encodings.push(encoding.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.languages.push(language.into());
        self
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn modified(mut self, date: SystemTime) -> Self {
        self.modification_date = Some(date);
        self
    }

    pub fn expires(mut self, date: SystemTime) -> Self {
        self.expiration_date = Some(date);
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn disposition(mut self, disposition: impl Into<String>) -> Self {
        self.disposition = Some(disposition.into());
        self
    }

    /// Marks the content as unreadable, e.g. a resource that only describes
    /// itself. The metadata still produces headers.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Declares the size of a body the connector cannot measure, so it can
    /// be sent with `content-length` instead of chunked. Ignored for
    /// [`Body::Empty`] and [`Body::Bytes`].
    pub fn size_hint(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Byte length, `None` when unknown until the body is produced.
    ///
    /// In-memory bodies are always measured; the declared size only applies
    /// to templates and streams.
    pub fn size(&self) -> Option<u64> {
        match &self.body {
            Body::Empty => Some(0),
            Body::Bytes(bytes) => Some(bytes.len() as u64),
            Body::Template(_) | Body::Stream(_) => self.declared_size,
        }
    }

    #[inline]
    pub fn body(&self) -> &Body {
        &self.body
    }
}

/// Content of an [`Entity`].
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    /// Rendered when the response is written.
    Template(TemplateBody),
    /// Chunks produced by another task or thread; the body ends when every
    /// sender is dropped.
    Stream(mpsc::Receiver<Vec<u8>>),
}

impl Body {
    /// Channel-backed body. `capacity` bounds the chunks buffered ahead of
    /// the socket.
    ///
    /// # Examples
    /// ```
    /// use conduit_http::{Body, Response, StatusCode};
    ///
    /// let (tx, body) = Body::channel(4);
    /// std::thread::spawn(move || {
    ///     for part in ["a", "b", "c"] {
    ///         if tx.blocking_send(part.as_bytes().to_vec()).is_err() {
    ///             break;
    ///         }
    ///     }
    /// });
    ///
    /// let response = Response::new(StatusCode::Ok).body(body);
    /// # drop(response);
    /// ```
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Body) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Body::Stream(rx))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Body::Template(template) => f.debug_tuple("Template").field(template).finish(),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Bytes(value.into_bytes())
    }
}

impl From<&[u8]> for Body {
    fn from(value: &[u8]) -> Self {
        Body::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Bytes(value)
    }
}

impl From<TemplateBody> for Body {
    fn from(value: TemplateBody) -> Self {
        Body::Template(value)
    }
}
