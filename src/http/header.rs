//! Readers and writers for structured header values.
//!
//! Everything here is a pure function over `&str`. Callers decide what a
//! failure means; the request adapter logs it and degrades the facet.

use std::time::SystemTime;

/// Failure to read one structured header value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("empty header value")]
    Empty,
    #[error("invalid entity tag `{0}`")]
    InvalidTag(String),
    #[error("invalid quality value `{0}`")]
    InvalidQuality(String),
    #[error("invalid expectation `{0}`")]
    InvalidExpectation(String),
    #[error("invalid cookie `{0}`")]
    InvalidCookie(String),
    #[error("invalid range `{0}`")]
    InvalidRange(String),
    #[error("unsupported range unit `{0}`")]
    UnsupportedRangeUnit(String),
    #[error("invalid credentials `{0}`")]
    InvalidChallenge(String),
    #[error("invalid via entry `{0}`")]
    InvalidVia(String),
    #[error("invalid warning `{0}`")]
    InvalidWarning(String),
    #[error("invalid host `{0}`")]
    InvalidHost(String),
}

// LISTS

/// Splits a comma-separated header value into trimmed, non-empty elements.
///
/// Commas inside quoted strings or comments are not separators.
pub fn split_list(value: &str) -> Vec<&str> {
    split_outside_quotes(value, b',')
}

fn split_outside_quotes(value: &str, separator: u8) -> Vec<&str> {
    let bytes = value.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    let mut depth = 0usize;

    for (i, &byte) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }

        match byte {
            b'\\' if quoted => escaped = true,
            b'"' => quoted = !quoted,
            b'(' if !quoted => depth += 1,
            b')' if !quoted => depth = depth.saturating_sub(1),
            _ if byte == separator && !quoted && depth == 0 => {
                push_trimmed(&mut parts, &value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_trimmed(&mut parts, &value[start..]);

    parts
}

fn push_trimmed<'a>(parts: &mut Vec<&'a str>, part: &'a str) {
    let part = part.trim();
    if !part.is_empty() {
        parts.push(part);
    }
}

/// Removes surrounding double quotes and backslash escapes.
pub fn unquote(value: &str) -> String {
    let value = value.trim();
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => value.to_string(),
    }
}

/// Reads a list of tokens, e.g. `Access-Control-Request-Headers`.
pub fn read_tokens(value: &str) -> Vec<String> {
    split_list(value).into_iter().map(str::to_string).collect()
}

// DATES

/// Reads an HTTP date in any of the three formats RFC 9110 accepts.
///
/// Invalid dates read as `None`.
pub fn read_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value.trim()).ok()
}

/// Writes an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn write_date(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

// TAGS

/// Entity tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    opaque: String,
    weak: bool,
}

impl Tag {
    /// Creates a strong tag from its opaque value (without quotes).
    pub fn strong(opaque: impl Into<String>) -> Self {
        Tag {
            opaque: opaque.into(),
            weak: false,
        }
    }

    /// Creates a weak tag from its opaque value (without quotes).
    pub fn weak(opaque: impl Into<String>) -> Self {
        Tag {
            opaque: opaque.into(),
            weak: true,
        }
    }

    /// The `*` wildcard of `If-Match` / `If-None-Match`.
    pub fn all() -> Self {
        Tag::strong("*")
    }

    /// Reads `"x"`, `W/"x"` or `*`.
    pub fn parse(value: &str) -> Result<Self, HeaderError> {
        let value = value.trim();

        if value == "*" {
            return Ok(Tag::all());
        }

        let (weak, quoted) = match value.strip_prefix("W/") {
            Some(rest) => (true, rest),
            None => (false, value),
        };

        match quoted.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
            Some(opaque) if !opaque.contains('"') => Ok(Tag {
                opaque: opaque.to_string(),
                weak,
            }),
            _ => Err(HeaderError::InvalidTag(value.to_string())),
        }
    }

    pub fn opaque(&self) -> &str {
        &self.opaque
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    pub fn is_all(&self) -> bool {
        !self.weak && self.opaque == "*"
    }

    /// Wire form, e.g. `W/"v1"`.
    pub fn format(&self) -> String {
        match (self.is_all(), self.weak) {
            (true, _) => "*".to_string(),
            (false, true) => format!("W/\"{}\"", self.opaque),
            (false, false) => format!("\"{}\"", self.opaque),
        }
    }
}

// PREFERENCES

/// One element of an `Accept*` header, with its quality weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Preference {
    pub value: String,
    pub quality: f32,
    pub params: Vec<(String, String)>,
}

/// Reads `Accept`, `Accept-Charset`, `Accept-Encoding`, `Accept-Language` or
/// `Accept-Patch`.
///
/// Elements keep header order. A malformed `q` fails the whole header.
pub fn read_preferences(value: &str) -> Result<Vec<Preference>, HeaderError> {
    let mut preferences = Vec::new();

    for element in split_list(value) {
        let mut parts = split_outside_quotes(element, b';').into_iter();
        let Some(name) = parts.next() else { continue };

        let mut preference = Preference {
            value: name.to_string(),
            quality: 1.0,
            params: Vec::new(),
        };

        for param in parts {
            let (key, val) = param.split_once('=').unwrap_or((param, ""));
            let (key, val) = (key.trim(), val.trim());

            if key.eq_ignore_ascii_case("q") {
                preference.quality = read_quality(val)?;
            } else {
                preference.params.push((key.to_string(), unquote(val)));
            }
        }

        preferences.push(preference);
    }

    Ok(preferences)
}

fn read_quality(value: &str) -> Result<f32, HeaderError> {
    let invalid = || HeaderError::InvalidQuality(value.to_string());

    let valid_shape = match value.split_once('.') {
        Some((int, frac)) => {
            matches!(int, "0" | "1")
                && frac.len() <= 3
                && frac.bytes().all(|b| b.is_ascii_digit())
        }
        None => matches!(value, "0" | "1"),
    };
    if !valid_shape {
        return Err(invalid());
    }

    match value.parse::<f32>() {
        Ok(q) if (0.0..=1.0).contains(&q) => Ok(q),
        _ => Err(invalid()),
    }
}

// EXPECTATIONS

/// One element of an `Expect` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub name: String,
    pub value: Option<String>,
}

impl Expectation {
    pub fn is_continue(&self) -> bool {
        self.name.eq_ignore_ascii_case("100-continue")
    }
}

pub fn read_expectations(value: &str) -> Result<Vec<Expectation>, HeaderError> {
    split_list(value)
        .into_iter()
        .map(|element| {
            let (name, val) = match element.split_once('=') {
                Some((name, val)) => (name.trim(), Some(unquote(val))),
                None => (element, None),
            };

            if name.is_empty() || !name.bytes().all(is_token_byte) {
                return Err(HeaderError::InvalidExpectation(element.to_string()));
            }

            Ok(Expectation {
                name: name.to_string(),
                value: val,
            })
        })
        .collect()
}

// COOKIES

/// Request cookie, including the RFC 2109 `$Path`/`$Domain` attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cookie {
    pub version: u32,
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Cookie {
            name: name.into(),
            value: value.into(),
            ..Cookie::default()
        }
    }
}

/// Reads a `Cookie` header.
///
/// `$Version` applies to the cookies after it; `$Path` and `$Domain` apply
/// to the cookie before them.
pub fn read_cookies(value: &str) -> Result<Vec<Cookie>, HeaderError> {
    let mut cookies: Vec<Cookie> = Vec::new();
    let mut version = 0;

    for pair in split_outside_quotes(value, b';')
        .into_iter()
        .flat_map(|part| split_outside_quotes(part, b','))
    {
        let Some((name, val)) = pair.split_once('=') else {
            return Err(HeaderError::InvalidCookie(pair.to_string()));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(HeaderError::InvalidCookie(pair.to_string()));
        }
        let val = unquote(val);

        match name {
            "$Version" => {
                version = val
                    .parse()
                    .map_err(|_| HeaderError::InvalidCookie(pair.to_string()))?;
            }
            "$Path" => {
                if let Some(last) = cookies.last_mut() {
                    last.path = Some(val);
                }
            }
            "$Domain" => {
                if let Some(last) = cookies.last_mut() {
                    last.domain = Some(val);
                }
            }
            _ => cookies.push(Cookie {
                version,
                name: name.to_string(),
                value: val,
                path: None,
                domain: None,
            }),
        }
    }

    Ok(cookies)
}

// RANGES

/// Byte range as requested, before it is checked against an entity size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `start-end`, both inclusive
    FromTo { start: u64, end: u64 },
    /// `start-`
    From { start: u64 },
    /// `-length`, the last `length` bytes
    Suffix { length: u64 },
}

impl RangeSpec {
    /// Resolves to inclusive `(first, last)` offsets within an entity of `size`
    /// bytes, or `None` when the range cannot be satisfied.
    pub fn resolve(self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }
        let last = size - 1;

        match self {
            RangeSpec::FromTo { start, end } if start <= last => Some((start, end.min(last))),
            RangeSpec::From { start } if start <= last => Some((start, last)),
            RangeSpec::Suffix { length } if length > 0 => {
                Some((size.saturating_sub(length), last))
            }
            _ => None,
        }
    }
}

/// Reads a `Range` header such as `bytes=0-499, -100`.
pub fn read_ranges(value: &str) -> Result<Vec<RangeSpec>, HeaderError> {
    let value = value.trim();
    let invalid = || HeaderError::InvalidRange(value.to_string());

    let (unit, specs) = value.split_once('=').ok_or_else(invalid)?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(HeaderError::UnsupportedRangeUnit(unit.trim().to_string()));
    }

    let parse = |digits: &str| digits.trim().parse::<u64>().map_err(|_| invalid());
    let mut ranges = Vec::new();

    for spec in split_list(specs) {
        let (start, end) = spec.split_once('-').ok_or_else(invalid)?;
        let range = match (start.trim().is_empty(), end.trim().is_empty()) {
            (true, true) => return Err(invalid()),
            (true, false) => RangeSpec::Suffix { length: parse(end)? },
            (false, true) => RangeSpec::From { start: parse(start)? },
            (false, false) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(invalid());
                }
                RangeSpec::FromTo { start, end }
            }
        };
        ranges.push(range);
    }

    if ranges.is_empty() {
        return Err(invalid());
    }
    Ok(ranges)
}

// CHALLENGE RESPONSE

/// Credentials from `Authorization` or `Proxy-Authorization`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponse {
    /// Authentication scheme, e.g. `Basic`
    pub scheme: String,
    /// Everything after the scheme, untouched
    pub raw: String,
    /// `key=value` parameters, when the credentials are in that form
    pub params: Vec<(String, String)>,
}

pub fn read_challenge_response(value: &str) -> Result<ChallengeResponse, HeaderError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(HeaderError::Empty);
    }

    let (scheme, raw) = value.split_once(' ').unwrap_or((value, ""));
    if !scheme.bytes().all(is_token_byte) {
        return Err(HeaderError::InvalidChallenge(value.to_string()));
    }
    let raw = raw.trim();

    // token68 credentials (e.g. Basic) may end in '=' padding, so only treat
    // the value as parameters when every element is `key=value` with a token key.
    let mut params = Vec::new();
    let elements = split_list(raw);
    let is_param_list = !elements.is_empty()
        && elements.iter().all(|element| {
            element
                .split_once('=')
                .is_some_and(|(k, v)| {
                    let k = k.trim();
                    !k.is_empty()
                        && k.bytes().all(is_token_byte)
                        && !v.trim().is_empty()
                        && !v.starts_with('=')
                })
        });

    if is_param_list {
        for element in elements {
            if let Some((k, v)) = element.split_once('=') {
                params.push((k.trim().to_string(), unquote(v)));
            }
        }
    }

    Ok(ChallengeResponse {
        scheme: scheme.to_string(),
        raw: raw.to_string(),
        params,
    })
}

// VIA

/// One intermediary from a `Via` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientInfo {
    /// Received protocol, e.g. `HTTP/1.1` (a bare version implies HTTP)
    pub protocol: String,
    /// Host or pseudonym of the intermediary
    pub name: String,
    /// Comment, usually the intermediary's software
    pub comment: Option<String>,
}

pub fn read_via(value: &str) -> Result<Vec<RecipientInfo>, HeaderError> {
    split_list(value)
        .into_iter()
        .map(|element| {
            let invalid = || HeaderError::InvalidVia(element.to_string());

            let (protocol, rest) = element.split_once(char::is_whitespace).ok_or_else(invalid)?;
            let rest = rest.trim();
            let (name, comment) = match rest.find('(') {
                Some(i) => {
                    let comment = rest[i + 1..].trim_end().strip_suffix(')').ok_or_else(invalid)?;
                    (rest[..i].trim(), Some(comment.to_string()))
                }
                None => (rest, None),
            };
            if name.is_empty() {
                return Err(invalid());
            }

            let protocol = if protocol.contains('/') {
                protocol.to_string()
            } else {
                format!("HTTP/{protocol}")
            };

            Ok(RecipientInfo {
                protocol,
                name: name.to_string(),
                comment,
            })
        })
        .collect()
}

// WARNINGS

/// One element of a `Warning` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub code: u16,
    pub agent: String,
    pub text: String,
    pub date: Option<SystemTime>,
}

pub fn read_warnings(value: &str) -> Result<Vec<Warning>, HeaderError> {
    split_list(value)
        .into_iter()
        .map(|element| {
            let invalid = || HeaderError::InvalidWarning(element.to_string());

            let (code, rest) = element.split_once(' ').ok_or_else(invalid)?;
            let code = match code.parse::<u16>() {
                Ok(code) if (100..1000).contains(&code) => code,
                _ => return Err(invalid()),
            };
            let (agent, rest) = rest.trim_start().split_once(' ').ok_or_else(invalid)?;
            let quoted = split_quoted(rest.trim()).ok_or_else(invalid)?;

            let (text, date) = match quoted.as_slice() {
                [text] => (text.clone(), None),
                [text, date] => (text.clone(), read_date(date)),
                _ => return Err(invalid()),
            };

            Ok(Warning {
                code,
                agent: agent.to_string(),
                text,
                date,
            })
        })
        .collect()
}

fn split_quoted(value: &str) -> Option<Vec<String>> {
    let mut strings = Vec::new();
    let mut rest = value.trim();

    while !rest.is_empty() {
        let inner = rest.strip_prefix('"')?;
        let mut end = None;
        let mut escaped = false;
        for (i, c) in inner.char_indices() {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => {
                    end = Some(i);
                    break;
                }
                _ => {}
            }
        }
        let end = end?;
        strings.push(unquote(&rest[..end + 2]));
        rest = inner[end + 1..].trim_start();
    }

    Some(strings)
}

// CACHE-CONTROL

/// One `Cache-Control` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirective {
    pub name: String,
    pub value: Option<String>,
}

pub fn read_cache_directives(value: &str) -> Vec<CacheDirective> {
    split_list(value)
        .into_iter()
        .map(|element| match element.split_once('=') {
            Some((name, val)) => CacheDirective {
                name: name.trim().to_ascii_lowercase(),
                value: Some(unquote(val)),
            },
            None => CacheDirective {
                name: element.to_ascii_lowercase(),
                value: None,
            },
        })
        .collect()
}

// HOST

/// Splits a `Host` value into domain and optional port.
///
/// The port separator is searched only after the closing bracket of an IPv6
/// literal, so `[::1]:8080` reads as (`[::1]`, `8080`).
pub fn read_host(value: &str) -> Result<(String, Option<u16>), HeaderError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(HeaderError::Empty);
    }

    let search_from = value.find(']').unwrap_or(0);
    let (domain, port) = match value[search_from..].find(':') {
        Some(i) => {
            let colon = search_from + i;
            let port = value[colon + 1..]
                .parse::<u16>()
                .map_err(|_| HeaderError::InvalidHost(value.to_string()))?;
            (&value[..colon], Some(port))
        }
        None => (value, None),
    };

    match domain.is_empty() {
        true => Err(HeaderError::InvalidHost(value.to_string())),
        false => Ok((domain.to_string(), port)),
    }
}

#[inline(always)]
fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}
