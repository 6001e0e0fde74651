//! HTTP/1.1 request head parsing and a length-limited body reader.

use embedded_io_async::{ErrorType, Read};

use super::HttpError;

/// Request line plus headers must fit in this many bytes.
pub const MAX_HEAD: usize = 1024;

const HEAD_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'b> {
    pub method: Method,
    /// Path without the query string.
    pub path: &'b str,
    pub content_length: Option<usize>,
    pub content_type: Option<&'b str>,
}

/// Read from `conn` until the blank line ending the head.
///
/// Returns `(head_len, filled)`: `buf[..head_len]` is the head including
/// its terminator, `buf[head_len..filled]` is body data that arrived with it.
pub async fn read_head<C: Read>(conn: &mut C, buf: &mut [u8]) -> Result<(usize, usize), HttpError> {
    let mut filled = 0;
    loop {
        if filled == buf.len() {
            return Err(HttpError::HeadTooLarge);
        }
        let n = conn.read(&mut buf[filled..]).await.map_err(HttpError::io)?;
        if n == 0 {
            return Err(if filled == 0 {
                HttpError::Closed
            } else {
                HttpError::BadRequest
            });
        }
        // The terminator may straddle two reads
        let from = filled.saturating_sub(HEAD_END.len() - 1);
        filled += n;
        if let Some(at) = find(&buf[from..filled], HEAD_END) {
            return Ok((from + at + HEAD_END.len(), filled));
        }
    }
}

pub fn parse_head(head: &[u8]) -> Result<Request<'_>, HttpError> {
    let head = core::str::from_utf8(head).map_err(|_| HttpError::BadRequest)?;
    let mut lines = head.split("\r\n");

    let mut parts = lines.next().unwrap_or("").split_ascii_whitespace();
    let method = match parts.next() {
        Some("GET") => Method::Get,
        Some("POST") => Method::Post,
        Some(_) => Method::Other,
        None => return Err(HttpError::BadRequest),
    };
    let target = parts.next().ok_or(HttpError::BadRequest)?;
    if !target.starts_with('/') || !parts.next().is_some_and(|v| v.starts_with("HTTP/1.")) {
        return Err(HttpError::BadRequest);
    }
    let path = target.split('?').next().unwrap_or(target);

    let mut request = Request {
        method,
        path,
        content_length: None,
        content_type: None,
    };
    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or(HttpError::BadRequest)?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            let len = value.parse().map_err(|_| HttpError::BadRequest)?;
            request.content_length = Some(len);
        } else if name.eq_ignore_ascii_case("content-type") {
            request.content_type = Some(value);
        }
    }
    Ok(request)
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Request body: bytes already buffered with the head, then the
/// connection, stopping after `Content-Length` bytes.
pub struct Body<'a, C> {
    prefix: &'a [u8],
    conn: &'a mut C,
    remaining: usize,
}

impl<'a, C: Read> Body<'a, C> {
    pub fn new(prefix: &'a [u8], conn: &'a mut C, content_length: usize) -> Self {
        Self {
            prefix,
            conn,
            remaining: content_length,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl<C: ErrorType> ErrorType for Body<'_, C> {
    type Error = C::Error;
}

impl<C: Read> Read for Body<'_, C> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let want = buf.len().min(self.remaining);
        if want == 0 {
            return Ok(0);
        }
        let n = if self.prefix.is_empty() {
            self.conn.read(&mut buf[..want]).await?
        } else {
            let n = want.min(self.prefix.len());
            buf[..n].copy_from_slice(&self.prefix[..n]);
            self.prefix = &self.prefix[n..];
            n
        };
        self.remaining -= n;
        Ok(n)
    }
}
