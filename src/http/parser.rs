//! Message boundary detection for inbound byte streams.
//!
//! The framing layer only finds where a message starts and ends and enforces
//! [`ReqLimits`]. Header values are kept as raw text; turning them into
//! structured data is the request adapter's job.

use crate::{
    errors::ErrorKind,
    http::types::{self, Method, Version},
    limits::ReqLimits,
};
use memchr::memmem;
use std::{io, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::timeout,
};

/// One complete inbound message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) version: Version,
    /// Header lines, each terminated by CRLF, without the blank line
    pub(crate) head: String,
    pub(crate) body: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct Parser {
    buffer: Vec<u8>,
    limits: ReqLimits,
    head_size: usize,
    version: Version,
}

impl Parser {
    #[inline]
    pub(crate) fn new(limits: ReqLimits) -> Self {
        let head_size = limits.head_size();

        Parser {
            buffer: Vec::with_capacity(head_size.min(8 * 1024)),
            limits,
            head_size,
            version: Version::Http11,
        }
    }

    /// Version of the last request line seen, for answering framing errors.
    #[inline(always)]
    pub(crate) fn version(&self) -> Version {
        self.version
    }

    /// Reads the next complete message.
    ///
    /// Returns `Ok(None)` when the peer closes, or stays silent for `idle`,
    /// between messages.
    pub(crate) async fn next_frame<R>(
        &mut self,
        reader: &mut R,
        idle: Duration,
    ) -> Result<Option<Frame>, ErrorKind>
    where
        R: AsyncRead + Unpin,
    {
        self.version = Version::Http11;

        let head_end = loop {
            self.skip_leading_crlf();

            if let Some(pos) = memmem::find(&self.buffer, b"\r\n\r\n") {
                break pos + 4;
            }
            if self.buffer.len() > self.head_size {
                return Err(ErrorKind::HeadersTooLarge);
            }

            let between_messages = self.buffer.is_empty();
            match self.fill(reader, idle).await {
                Ok(0) if between_messages => return Ok(None),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(_) => {}
                Err(err) if between_messages && err.kind() == io::ErrorKind::TimedOut => {
                    return Ok(None)
                }
                Err(err) => return Err(err.into()),
            }
        };

        if head_end > self.head_size {
            return Err(ErrorKind::HeadersTooLarge);
        }

        let head = simdutf8::basic::from_utf8(&self.buffer[..head_end])
            .map_err(|_| ErrorKind::InvalidEncoding)?;

        // `head_end` counts the blank line, so a request line is always present
        let line_end = memmem::find(head.as_bytes(), b"\r\n").ok_or(ErrorKind::InvalidHeader)?;
        let (method, target, version) = self.parse_first_line(&head[..line_end])?;
        self.version = version;

        let fields = &head[line_end + 2..head_end - 2];
        let content_length = self.check_fields(fields)?;
        let fields = fields.to_string();
        let target = target.to_string();

        let frame_end = head_end + content_length;
        while self.buffer.len() < frame_end {
            match self.fill(reader, idle).await {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(_) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let body = self.buffer[head_end..frame_end].to_vec();
        self.buffer.drain(..frame_end);

        Ok(Some(Frame {
            method,
            target,
            version,
            head: fields,
            body,
        }))
    }

    #[inline]
    fn parse_first_line<'a>(
        &self,
        line: &'a str,
    ) -> Result<(Method, &'a str, Version), ErrorKind> {
        let mut parts = line.splitn(3, ' ');

        let method = Method::from_bytes(parts.next().unwrap_or_default().as_bytes())?;
        let target = parts
            .next()
            .filter(|target| {
                !target.is_empty()
                    && target.len() <= self.limits.target_size
                    && target.bytes().all(|b| b.is_ascii_graphic())
            })
            .ok_or(ErrorKind::InvalidUrl)?;
        let version = Version::from_bytes(parts.next().unwrap_or_default().as_bytes())?;

        Ok((method, target, version))
    }

    /// Validates header lines and returns the announced body length.
    fn check_fields(&self, fields: &str) -> Result<usize, ErrorKind> {
        if fields.is_empty() {
            return Ok(0);
        }

        let mut content_length = None;

        for (count, line) in fields.split("\r\n").enumerate() {
            if count >= self.limits.header_count {
                return Err(ErrorKind::TooManyHeaders);
            }

            // obs-fold continuation lines and bare CR/LF are rejected
            if line.starts_with([' ', '\t']) || line.contains(['\r', '\n']) {
                return Err(ErrorKind::InvalidHeader);
            }

            let colon = memchr::memchr(b':', line.as_bytes()).ok_or(ErrorKind::InvalidHeader)?;
            let name = &line[..colon];
            let value = line[colon + 1..].trim();

            if name.is_empty()
                || name.len() > self.limits.header_name_size
                || !name.bytes().all(is_token_byte)
                || value.len() > self.limits.header_value_size
            {
                return Err(ErrorKind::InvalidHeader);
            }

            if name.eq_ignore_ascii_case("transfer-encoding") {
                return Err(ErrorKind::UnsupportedTransferEncoding);
            }
            if name.eq_ignore_ascii_case("content-length") {
                let len = types::slice_to_usize(value.as_bytes())
                    .ok_or(ErrorKind::InvalidContentLength)?;

                match content_length {
                    Some(previous) if previous != len => {
                        return Err(ErrorKind::InvalidContentLength)
                    }
                    _ => content_length = Some(len),
                }
            }
        }

        match content_length {
            Some(len) if len > self.limits.body_size => Err(ErrorKind::BodyTooLarge),
            Some(len) => Ok(len),
            None => Ok(0),
        }
    }

    #[inline]
    fn skip_leading_crlf(&mut self) {
        let skip = self
            .buffer
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();

        if skip > 0 {
            self.buffer.drain(..skip);
        }
    }

    #[inline]
    async fn fill<R>(&mut self, reader: &mut R, idle: Duration) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        match timeout(idle, reader.read_buf(&mut self.buffer)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout")),
        }
    }
}

#[inline(always)]
fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}
