//! Core HTTP protocol types

use crate::errors::ErrorKind;
use std::{fmt, str::FromStr};

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

// METHOD

/// HTTP request methods
///
/// # References
///
/// - [RFC 9110, Section 9](https://datatracker.ietf.org/doc/html/rfc9110#section-9)
/// - [RFC 5789](https://datatracker.ietf.org/doc/html/rfc5789) (PATCH method)
///
/// # Disabled methods
///
/// * `TRACE` - disabled for security reasons
/// * `CONNECT` - tunnels are not served by this connector
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET method - transfer a current representation of the target resource
    Get,
    /// PUT method - replace all current representations of the target resource
    Put,
    /// POST method - perform resource-specific processing on the request payload
    Post,
    /// HEAD method - same as GET but without response body
    Head,
    /// PATCH method - apply partial modifications to a resource
    Patch,
    /// DELETE method - remove all current representations of the target resource
    Delete,
    /// OPTIONS method - describe the communication options for the target resource
    Options,
}

impl Method {
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"GET" => Ok(Method::Get),
            b"PUT" => Ok(Method::Put),
            b"POST" => Ok(Method::Post),
            b"HEAD" => Ok(Method::Head),
            b"PATCH" => Ok(Method::Patch),
            b"DELETE" => Ok(Method::Delete),
            b"OPTIONS" => Ok(Method::Options),
            _ => Err(ErrorKind::InvalidMethod),
        }
    }

    /// Returns the method token as it appears on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::from_bytes(s.as_bytes()).map_err(|_| ())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0 - connections close after each response unless the client
    /// sends `Connection: keep-alive`
    ///
    /// [RFC 1945](https://tools.ietf.org/html/rfc1945)
    Http10,

    /// HTTP/1.1 - connections persist unless either side sends `Connection: close`
    ///
    /// [RFC 9112](https://datatracker.ietf.org/doc/html/rfc9112)
    Http11,
}

impl Version {
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            [b'H', b'T', b'T', b'P', b'/', major, b'.', minor]
                if major.is_ascii_digit() && minor.is_ascii_digit() =>
            {
                Err(ErrorKind::UnsupportedVersion)
            }
            _ => Err(ErrorKind::InvalidVersion),
        }
    }

    /// Returns the protocol token, e.g. `HTTP/1.1`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

// PROTOCOL

/// Transport protocol the connector reports for a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain HTTP
    Http,
    /// HTTP over TLS, terminated below the connector
    Https,
}

impl Protocol {
    /// Returns the URI scheme, e.g. `http`.
    pub const fn scheme_name(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    /// Returns the port implied when a host reference omits one.
    pub const fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $name:ident = $num:literal, $str:literal, $rfc:literal, $section:literal;
    )+) => {
        /// HTTP status codes
        ///
        /// Represents valid HTTP status codes as defined in
        /// [RFC 9110](https://datatracker.ietf.org/doc/html/rfc9110#section-15) and other standards.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(
                stringify!($num), " ", $str, "\n\n",
                "[[", $rfc, ", Section ", $section, "]",
                "(https://datatracker.ietf.org/doc/html/", $rfc, "#section-", $section, ")]"
            )]
            $name = $num,
        )+ }

        impl StatusCode {
            /// Returns the HTTP first line as bytes (e.g., `b"HTTP/1.1 200 OK\r\n"`).
            #[inline]
            pub(crate) const fn into_first_line(&self, version: Version) -> &'static [u8] {
                match (self, version) { $(
                    (StatusCode::$name, Version::Http11) => {
                        concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                    (StatusCode::$name, Version::Http10) => {
                        concat!("HTTP/1.0 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                )+ }
            }

            /// Returns the reason phrase written after the numeric code.
            pub const fn reason_phrase(&self) -> &'static str {
                match self { $(
                    StatusCode::$name => $str,
                )+ }
            }

            /// Looks a status up by its numeric code.
            pub const fn from_u16(code: u16) -> Option<Self> {
                match code { $(
                    $num => Some(StatusCode::$name),
                )+
                    _ => None,
                }
            }
        }
    }
}

set_status_codes! {
    Continue = 100, "Continue", "rfc9110", "15.2.1";
    SwitchingProtocols = 101, "Switching Protocols", "rfc9110", "15.2.2";
    Processing = 102, "Processing", "rfc2518", "10.1";
    EarlyHints = 103, "Early Hints", "rfc8297", "2";

    Ok = 200, "OK", "rfc9110", "15.3.1";
    Created = 201, "Created", "rfc9110", "15.3.2";
    Accepted = 202, "Accepted", "rfc9110", "15.3.3";
    NonAuthoritativeInformation = 203, "Non-Authoritative Information", "rfc9110", "15.3.4";
    NoContent = 204, "No Content", "rfc9110", "15.3.5";
    ResetContent = 205, "Reset Content", "rfc9110", "15.3.6";
    PartialContent = 206, "Partial Content", "rfc9110", "15.3.7";
    MultiStatus = 207, "Multi-Status", "rfc4918", "11.1";

    MultipleChoices = 300, "Multiple Choices", "rfc9110", "15.4.1";
    MovedPermanently = 301, "Moved Permanently", "rfc9110", "15.4.2";
    Found = 302, "Found", "rfc9110", "15.4.3";
    SeeOther = 303, "See Other", "rfc9110", "15.4.4";
    NotModified = 304, "Not Modified", "rfc9110", "15.4.5";
    UseProxy = 305, "Use Proxy", "rfc9110", "15.4.6";
    TemporaryRedirect = 307, "Temporary Redirect", "rfc9110", "15.4.8";
    PermanentRedirect = 308, "Permanent Redirect", "rfc9110", "15.4.9";

    BadRequest = 400, "Bad Request", "rfc9110", "15.5.1";
    Unauthorized = 401, "Unauthorized", "rfc9110", "15.5.2";
    PaymentRequired = 402, "Payment Required", "rfc9110", "15.5.3";
    Forbidden = 403, "Forbidden", "rfc9110", "15.5.4";
    NotFound = 404, "Not Found", "rfc9110", "15.5.5";
    MethodNotAllowed = 405, "Method Not Allowed", "rfc9110", "15.5.6";
    NotAcceptable = 406, "Not Acceptable", "rfc9110", "15.5.7";
    ProxyAuthenticationRequired = 407, "Proxy Authentication Required", "rfc9110", "15.5.8";
    RequestTimeout = 408, "Request Timeout", "rfc9110", "15.5.9";
    Conflict = 409, "Conflict", "rfc9110", "15.5.10";
    Gone = 410, "Gone", "rfc9110", "15.5.11";
    LengthRequired = 411, "Length Required", "rfc9110", "15.5.12";
    PreconditionFailed = 412, "Precondition Failed", "rfc9110", "15.5.13";
    PayloadTooLarge = 413, "Payload Too Large", "rfc9110", "15.5.14";
    UriTooLong = 414, "URI Too Long", "rfc9110", "15.5.15";
    UnsupportedMediaType = 415, "Unsupported Media Type", "rfc9110", "15.5.16";
    RangeNotSatisfiable = 416, "Range Not Satisfiable", "rfc9110", "15.5.17";
    ExpectationFailed = 417, "Expectation Failed", "rfc9110", "15.5.18";
    MisdirectedRequest = 421, "Misdirected Request", "rfc9110", "15.5.20";
    UnprocessableEntity = 422, "Unprocessable Entity", "rfc9110", "15.5.21";
    Locked = 423, "Locked", "rfc4918", "11.3";
    FailedDependency = 424, "Failed Dependency", "rfc4918", "11.4";
    UpgradeRequired = 426, "Upgrade Required", "rfc9110", "15.5.22";
    PreconditionRequired = 428, "Precondition Required", "rfc6585", "3";
    TooManyRequests = 429, "Too Many Requests", "rfc6585", "4";
    RequestHeaderFieldsTooLarge = 431, "Request Header Fields Too Large", "rfc6585", "5";
    UnavailableForLegalReasons = 451, "Unavailable For Legal Reasons", "rfc7725", "3";

    InternalServerError = 500, "Internal Server Error", "rfc9110", "15.6.1";
    NotImplemented = 501, "Not Implemented", "rfc9110", "15.6.2";
    BadGateway = 502, "Bad Gateway", "rfc9110", "15.6.3";
    ServiceUnavailable = 503, "Service Unavailable", "rfc9110", "15.6.4";
    GatewayTimeout = 504, "Gateway Timeout", "rfc9110", "15.6.5";
    HttpVersionNotSupported = 505, "HTTP Version Not Supported", "rfc9110", "15.6.6";
    InsufficientStorage = 507, "Insufficient Storage", "rfc4918", "11.5";
    NetworkAuthenticationRequired = 511, "Network Authentication Required", "rfc6585", "6";
}

impl StatusCode {
    /// Returns the numeric code, e.g. `404`.
    #[inline(always)]
    pub const fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// `true` for `1xx` codes.
    #[inline(always)]
    pub const fn is_informational(&self) -> bool {
        self.as_u16() < 200
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason_phrase())
    }
}

// HEADER

/// One header line. The name keeps its original case.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Header {
    pub(crate) name: String,
    pub(crate) value: String,
}

impl Header {
    /// Creates a header line from a name and a value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Header name, as written by the peer.
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Header value, with surrounding whitespace removed.
    #[inline(always)]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[inline(always)]
    pub(crate) fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

// HEADER SET

/// Ordered sequence of header lines.
///
/// Lookups ignore case; insertion order and duplicates are preserved, so
/// repeated headers such as `Set-Cookie` go out exactly as added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    headers: Vec<Header>,
}

impl HeaderSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            headers: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header line, keeping any existing ones with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header::new(name, value));
    }

    /// Replaces every line named `name` with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.add(name, value);
    }

    /// Returns the value of the first line named `name`.
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.is(name))
            .map(|h| h.value.as_str())
    }

    /// Iterates the values of every line named `name`, in order.
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.is(name))
            .map(|h| h.value.as_str())
    }

    /// Joins the values of every line named `name` with `", "`.
    ///
    /// Returns `None` when no such line exists.
    pub fn get_values(&self, name: &str) -> Option<String> {
        let mut values = self.values(name);
        let first = values.next()?;

        Some(values.fold(first.to_string(), |mut acc, value| {
            acc.push_str(", ");
            acc.push_str(value);
            acc
        }))
    }

    /// `true` if at least one line is named `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.is(name))
    }

    /// Removes every line named `name`, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|h| !h.is(name));
        before - self.headers.len()
    }

    /// Iterates all lines in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.headers.iter()
    }

    /// Number of header lines.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// `true` if the set has no lines.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl<'a> IntoIterator for &'a HeaderSet {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<Header> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = Header>>(iter: I) -> Self {
        Self {
            headers: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[rustfmt::skip]
    fn method_tokens() {
        let cases: &[(&[u8], Result<Method, ErrorKind>)] = &[
            (b"GET",     Ok(Method::Get)),
            (b"HEAD",    Ok(Method::Head)),
            (b"OPTIONS", Ok(Method::Options)),
            (b"get",     Err(ErrorKind::InvalidMethod)),
            (b"TRACE",   Err(ErrorKind::InvalidMethod)),
            (b"GETX",    Err(ErrorKind::InvalidMethod)),
            (b"",        Err(ErrorKind::InvalidMethod)),
        ];

        for (src, expected) in cases {
            assert_eq!(&Method::from_bytes(src), expected, "{:?}", String::from_utf8_lossy(src));
        }
    }

    #[test]
    #[rustfmt::skip]
    fn version_tokens() {
        let cases: &[(&[u8], Result<Version, ErrorKind>)] = &[
            (b"HTTP/1.1", Ok(Version::Http11)),
            (b"HTTP/1.0", Ok(Version::Http10)),
            (b"HTTP/2.0", Err(ErrorKind::UnsupportedVersion)),
            (b"HTTP/0.9", Err(ErrorKind::UnsupportedVersion)),
            (b"HTTP/1.x", Err(ErrorKind::InvalidVersion)),
            (b"http/1.1", Err(ErrorKind::InvalidVersion)),
        ];

        for (src, expected) in cases {
            assert_eq!(&Version::from_bytes(src), expected);
        }
    }

    #[test]
    fn status_lines_and_lookup() {
        assert_eq!(
            StatusCode::NotModified.into_first_line(Version::Http11),
            b"HTTP/1.1 304 Not Modified\r\n"
        );
        assert_eq!(
            StatusCode::Ok.into_first_line(Version::Http10),
            b"HTTP/1.0 200 OK\r\n"
        );
        assert_eq!(StatusCode::from_u16(205), Some(StatusCode::ResetContent));
        assert_eq!(StatusCode::from_u16(299), None);
        assert_eq!(StatusCode::NoContent.as_u16(), 204);
        assert!(StatusCode::Continue.is_informational());
        assert!(!StatusCode::Ok.is_informational());
        assert_eq!(StatusCode::NotFound.to_string(), "404 Not Found");
    }

    #[test]
    fn protocol_defaults() {
        assert_eq!(Protocol::Http.default_port(), 80);
        assert_eq!(Protocol::Https.default_port(), 443);
        assert_eq!(Protocol::Https.scheme_name(), "https");
    }

    #[test]
    fn header_set_keeps_order_and_case() {
        let mut headers = HeaderSet::new();
        headers.add("Set-Cookie", "a=1");
        headers.add("Content-Type", "text/plain");
        headers.add("set-cookie", "b=2");

        assert_eq!(headers.get_first("SET-COOKIE"), Some("a=1"));
        assert_eq!(headers.get_values("Set-Cookie").as_deref(), Some("a=1, b=2"));
        assert_eq!(headers.values("set-cookie").collect::<Vec<_>>(), ["a=1", "b=2"]);
        assert_eq!(
            headers.iter().map(Header::name).collect::<Vec<_>>(),
            ["Set-Cookie", "Content-Type", "set-cookie"]
        );

        assert_eq!(headers.remove("set-cookie"), 2);
        assert_eq!(headers.len(), 1);
        assert!(headers.get_values("Set-Cookie").is_none());

        headers.set("content-type", "text/html");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get_first("Content-Type"), Some("text/html"));
    }

    #[test]
    fn content_length_digits() {
        assert_eq!(slice_to_usize(b"0"), Some(0));
        assert_eq!(slice_to_usize(b"1024"), Some(1024));
        assert_eq!(slice_to_usize(b""), None);
        assert_eq!(slice_to_usize(b"-1"), None);
        assert_eq!(slice_to_usize(b"99999999999999999999999"), None);
    }
}
