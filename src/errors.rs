use crate::Version;
use std::{error, fmt, io};

/// Boxed error returned by a [`Handler`](crate::Handler) when it cannot
/// produce a response.
pub type HandlerError = Box<dyn error::Error + Send + Sync + 'static>;

/// Faults surfaced by the connector outside of request framing.
///
/// None of these reach the handler: dispatch faults become a `500` response
/// whose [`cause`](crate::Response::cause) holds the error, write faults force
/// the status to `500`, and transport faults close the connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The handler returned an error instead of a response.
    #[error("request handler failed: {0}")]
    Dispatch(#[source] HandlerError),

    /// The handler panicked while processing the request.
    #[error("request handler panicked: {0}")]
    Panic(String),

    /// A deferred response was dropped without being committed.
    #[error("response was abandoned before being committed")]
    Abandoned,

    /// The response could not be composed for the wire.
    #[error("response could not be written: {0}")]
    Write(String),

    /// I/O-class fault, including template rendering failures.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wraps a template engine failure into an I/O-class fault.
    pub(crate) fn template(cause: impl fmt::Display) -> Self {
        Error::Io(io::Error::other(format!(
            "Template processing error. {cause}"
        )))
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(text) => *text,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(text) => (*text).to_string(),
                Err(_) => "non-string panic payload".to_string(),
            },
        };

        Error::Panic(message)
    }
}

/// Framing faults detected before a request object exists.
///
/// Each maps to a canned `connection: close` response, so the connection is
/// always dropped after one of these is written.
#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,
    InvalidUrl,

    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    TooManyHeaders,
    HeadersTooLarge,
    InvalidContentLength,
    InvalidEncoding,

    BodyTooLarge,
    UnsupportedTransferEncoding,

    ServiceUnavailable,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(
            &self,
            version: Version,
            json: bool,
        ) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: "400 Bad Request", "55"
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;
        InvalidUrl: "400 Bad Request", "55"
            => r#"{"error":"Invalid request target","code":"INVALID_URL"}"#;

        InvalidVersion: "400 Bad Request", "57"
            => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
        UnsupportedVersion: "505 HTTP Version Not Supported", "67"
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;

        InvalidHeader: "400 Bad Request", "57"
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        TooManyHeaders: "431 Request Header Fields Too Large", "54"
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        HeadersTooLarge: "431 Request Header Fields Too Large", "61"
            => r#"{"error":"Request head too large","code":"HEADERS_TOO_LARGE"}"#;
        InvalidContentLength: "400 Bad Request", "66"
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        InvalidEncoding: "400 Bad Request", "69"
            => r#"{"error":"Request head is not valid UTF-8","code":"INVALID_ENCODING"}"#;

        BodyTooLarge: "413 Payload Too Large", "58"
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
        UnsupportedTransferEncoding: "501 Not Implemented", "82"
            => r#"{"error":"Transfer-Encoding not supported","code":"UNSUPPORTED_TRANSFER_ENCODING"}"#;

        ServiceUnavailable: "503 Service Unavailable", "72"
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
        Io: "503 Service Unavailable", "48"
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_json_lengths_match_bodies() {
        let kinds = [
            ErrorKind::InvalidMethod,
            ErrorKind::InvalidUrl,
            ErrorKind::InvalidVersion,
            ErrorKind::UnsupportedVersion,
            ErrorKind::InvalidHeader,
            ErrorKind::TooManyHeaders,
            ErrorKind::HeadersTooLarge,
            ErrorKind::InvalidContentLength,
            ErrorKind::InvalidEncoding,
            ErrorKind::BodyTooLarge,
            ErrorKind::UnsupportedTransferEncoding,
            ErrorKind::ServiceUnavailable,
            ErrorKind::from(io::Error::from(io::ErrorKind::BrokenPipe)),
        ];

        for kind in kinds {
            for version in [Version::Http10, Version::Http11] {
                let text = std::str::from_utf8(kind.as_http(version, true)).unwrap();
                let (head, body) = text.split_once("\r\n\r\n").unwrap();
                let declared = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length: "))
                    .unwrap();

                assert_eq!(declared.parse::<usize>().unwrap(), body.len(), "{kind:?}");
                assert!(head.contains("connection: close"));
            }
        }
    }

    #[test]
    fn canned_plain_responses_are_empty() {
        let text = ErrorKind::TooManyHeaders.as_http(Version::Http11, false);
        assert_eq!(
            text,
            b"HTTP/1.1 431 Request Header Fields Too Large\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"
        );
    }

    #[test]
    fn template_faults_are_io_class() {
        let err = Error::template("missing variable `name`");

        match &err {
            Error::Io(io) => assert_eq!(io.kind(), io::ErrorKind::Other),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "Template processing error. missing variable `name`"
        );
    }

    #[test]
    fn panic_payloads_are_described() {
        let err = Error::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "request handler panicked: boom");

        let err = Error::from_panic(Box::new(String::from("owned boom")));
        assert_eq!(err.to_string(), "request handler panicked: owned boom");
    }
}
