//! Streaming `multipart/form-data` reader.
//!
//! Parts are read through a fixed window, so an upload of any size passes
//! through without being buffered whole. A delimiter is `\r\n--boundary`;
//! the body is treated as if it began with `\r\n` so the first boundary
//! line matches the same pattern.

use embedded_io_async::Read;
use heapless::{String, Vec};

use super::request::find;
use super::HttpError;
use crate::cfg::fs_cfg::PATH_MAX;

/// Longest boundary RFC 2046 allows.
pub const MAX_BOUNDARY: usize = 70;
const WINDOW: usize = 512;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders {
    pub name: String<32>,
    /// As sent by the client, possibly with directories in front.
    pub filename: Option<String<PATH_MAX>>,
    pub content_type: Option<String<64>>,
}

/// Extract the boundary parameter from a `Content-Type` value.
pub fn boundary(content_type: &str) -> Option<&str> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"'))
        .filter(|b| !b.is_empty() && b.len() <= MAX_BOUNDARY)
}

pub struct Multipart<R> {
    src: R,
    delimiter: Vec<u8, { MAX_BOUNDARY + 4 }>,
    window: [u8; WINDOW],
    start: usize,
    end: usize,
    finished: bool,
}

impl<R: Read> Multipart<R> {
    pub fn new(src: R, boundary: &str) -> Result<Self, HttpError> {
        let mut delimiter = Vec::new();
        delimiter
            .extend_from_slice(b"\r\n--")
            .and_then(|_| delimiter.extend_from_slice(boundary.as_bytes()))
            .map_err(|_| HttpError::BadMultipart)?;
        let mut window = [0u8; WINDOW];
        window[..2].copy_from_slice(b"\r\n");
        Ok(Self {
            src,
            delimiter,
            window,
            start: 0,
            end: 2,
            finished: false,
        })
    }

    /// Skip whatever is left of the current part and return the headers of
    /// the next one, or `None` after the closing boundary.
    pub async fn next_part(&mut self) -> Result<Option<PartHeaders>, HttpError> {
        if self.finished {
            return Ok(None);
        }
        self.skip_past_delimiter().await?;

        self.ensure(2).await?;
        match &self.window[self.start..self.start + 2] {
            b"--" => {
                self.finished = true;
                return Ok(None);
            }
            b"\r\n" => self.start += 2,
            _ => return Err(HttpError::BadMultipart),
        }

        let mut headers = PartHeaders::default();
        loop {
            let line_end = loop {
                if let Some(at) = find(&self.window[self.start..self.end], b"\r\n") {
                    break at;
                }
                if !self.fill().await? {
                    return Err(HttpError::BadMultipart);
                }
            };
            let line = &self.window[self.start..self.start + line_end];
            self.start += line_end + 2;
            if line.is_empty() {
                break;
            }
            parse_header_line(line, &mut headers)?;
        }
        Ok(Some(headers))
    }

    /// Read data of the current part. Returns 0 at the end of the part.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, HttpError> {
        if self.finished || out.is_empty() {
            return Ok(0);
        }
        loop {
            let avail = &self.window[self.start..self.end];
            let (ready, at_delimiter) = match find(avail, &self.delimiter) {
                Some(at) => (at, true),
                // A delimiter prefix may be sitting at the tail
                None => (avail.len().saturating_sub(self.delimiter.len() - 1), false),
            };
            if ready > 0 {
                let n = ready.min(out.len());
                out[..n].copy_from_slice(&avail[..n]);
                self.start += n;
                return Ok(n);
            }
            if at_delimiter {
                return Ok(0);
            }
            if !self.fill().await? {
                return Err(HttpError::BadMultipart);
            }
        }
    }

    /// Read the rest of the current part into `buf`. Fails if it does not fit.
    pub async fn read_to_end<'b>(&mut self, buf: &'b mut [u8]) -> Result<&'b [u8], HttpError> {
        let mut len = 0;
        loop {
            if len == buf.len() {
                let mut peek = [0u8; 1];
                if self.read(&mut peek).await? != 0 {
                    return Err(HttpError::BadMultipart);
                }
                break;
            }
            let n = self.read(&mut buf[len..]).await?;
            if n == 0 {
                break;
            }
            len += n;
        }
        Ok(&buf[..len])
    }

    async fn skip_past_delimiter(&mut self) -> Result<(), HttpError> {
        let keep = self.delimiter.len() - 1;
        loop {
            if let Some(at) = find(&self.window[self.start..self.end], &self.delimiter) {
                self.start += at + self.delimiter.len();
                return Ok(());
            }
            if self.end - self.start > keep {
                self.start = self.end - keep;
            }
            if !self.fill().await? {
                return Err(HttpError::BadMultipart);
            }
        }
    }

    async fn ensure(&mut self, n: usize) -> Result<(), HttpError> {
        while self.end - self.start < n {
            if !self.fill().await? {
                return Err(HttpError::BadMultipart);
            }
        }
        Ok(())
    }

    /// Pull more bytes into the window. `false` at end of input.
    async fn fill(&mut self) -> Result<bool, HttpError> {
        if self.start > 0 {
            self.window.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == WINDOW {
            return Err(HttpError::HeadTooLarge);
        }
        let n = self
            .src
            .read(&mut self.window[self.end..])
            .await
            .map_err(HttpError::io)?;
        self.end += n;
        Ok(n > 0)
    }
}

fn parse_header_line(line: &[u8], headers: &mut PartHeaders) -> Result<(), HttpError> {
    let line = core::str::from_utf8(line).map_err(|_| HttpError::BadMultipart)?;
    let Some((name, value)) = line.split_once(':') else {
        return Err(HttpError::BadMultipart);
    };
    if name.trim().eq_ignore_ascii_case("content-type") {
        headers.content_type = Some(bounded(value.trim())?);
    } else if name.trim().eq_ignore_ascii_case("content-disposition") {
        for param in value.split(';').skip(1) {
            let Some((key, val)) = param.trim().split_once('=') else {
                continue;
            };
            let val = val.trim().trim_matches('"');
            match key.trim() {
                "name" => headers.name = bounded(val)?,
                "filename" => headers.filename = Some(bounded(val)?),
                _ => {}
            }
        }
    }
    Ok(())
}

fn bounded<const N: usize>(s: &str) -> Result<String<N>, HttpError> {
    let mut out = String::new();
    out.push_str(s).map_err(|_| HttpError::BadMultipart)?;
    Ok(out)
}
