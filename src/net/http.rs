//! File endpoint served over any `embedded_io_async` connection.
//!
//! One request per connection. The filesystem session is locked for as long
//! as a request touches it, so concurrent uploads and downloads queue up.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Write as _;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embedded_io_async::{Read, Write};
use heapless::String;
use littlefs2::driver::Storage;
use log::{debug, error, info, warn};
use serde::Serialize;

use super::multipart::{self, Multipart};
use super::request::{parse_head, read_head, Body, Method, Request, MAX_HEAD};
use super::HttpError;
use crate::cfg::fs_cfg::{INDEX_PATH, NAME_MAX, PATH_MAX, UPLOADS_DIR, WWW_DIR};
use crate::drivers::ds1307::DateTime;
use crate::mem::fs::{DirEntry, FileHandle, FileKind, FlashFs, FsError, OpenFlags, StorageError};
use crate::task::clock::TimeRequests;

const FALLBACK_PAGE: &str = "<h1>Hello, world!</h1>";
const TEXT: &str = "text/plain";
const CHUNK: usize = 512;
const MAX_TIME_BODY: usize = 64;
const MAX_LISTING: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
            Status::InternalError => 500,
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::InternalError => "Internal Server Error",
        }
    }
}

#[derive(Serialize)]
struct FileNode<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    children: Option<Vec<FileNode<'a>>>,
}

impl<'a> From<&'a DirEntry> for FileNode<'a> {
    fn from(entry: &'a DirEntry) -> Self {
        let (kind, children) = match entry.kind {
            FileKind::File => ("file", None),
            FileKind::Dir => ("dir", Some(Vec::new())),
        };
        Self {
            name: entry.name.as_str(),
            kind,
            size: entry.size,
            children,
        }
    }
}

pub struct HttpServer<'a, M: RawMutex, S: Storage> {
    fs: &'a Mutex<M, FlashFs<S>>,
    time: &'a TimeRequests,
}

impl<'a, M: RawMutex, S: Storage> HttpServer<'a, M, S> {
    pub fn new(fs: &'a Mutex<M, FlashFs<S>>, time: &'a TimeRequests) -> Self {
        Self { fs, time }
    }

    /// Handle one request on `conn` and return the status that was sent.
    pub async fn serve<C: Read + Write>(&self, conn: &mut C) -> Result<Status, HttpError> {
        let mut head = [0u8; MAX_HEAD];
        let (head_len, filled) = match read_head(conn, &mut head).await {
            Ok(split) => split,
            Err(HttpError::HeadTooLarge) => {
                warn!("[HTTP] Request head exceeds {MAX_HEAD} bytes");
                return reply(conn, Status::InternalError, TEXT, b"Request too large").await;
            }
            Err(HttpError::BadRequest) => {
                return reply(conn, Status::BadRequest, TEXT, b"Bad request").await;
            }
            Err(e) => return Err(e),
        };
        let request = match parse_head(&head[..head_len]) {
            Ok(request) => request,
            Err(_) => return reply(conn, Status::BadRequest, TEXT, b"Bad request").await,
        };
        debug!("[HTTP] {:?} {}", request.method, request.path);

        let status = self.route(conn, &request, &head[head_len..filled]).await?;
        conn.flush().await.map_err(HttpError::io)?;
        Ok(status)
    }

    async fn route<C: Read + Write>(
        &self,
        conn: &mut C,
        request: &Request<'_>,
        prefix: &[u8],
    ) -> Result<Status, HttpError> {
        let body_len = request.content_length.unwrap_or(0);
        match (request.method, request.path) {
            (Method::Get, "/") => self.index(conn).await,
            (Method::Get, "/files") => self.list_files(conn).await,
            (Method::Get, "/format") => self.format(conn).await,
            (Method::Get, "/sound") => {
                info!("[HTTP] Sound requested");
                reply(conn, Status::Ok, TEXT, b"OK").await
            }
            (Method::Get, path) => self.asset(conn, path).await,
            (Method::Post, "/file") => {
                let outcome = self
                    .upload(request.content_type, Body::new(prefix, conn, body_len))
                    .await;
                finish(conn, outcome).await
            }
            (Method::Post, "/time") => {
                let outcome = self.set_time(Body::new(prefix, conn, body_len)).await;
                finish(conn, outcome).await
            }
            (Method::Post, _) => reply(conn, Status::NotFound, TEXT, b"Not found").await,
            (Method::Other, _) => {
                reply(conn, Status::MethodNotAllowed, TEXT, b"Method not allowed").await
            }
        }
    }

    async fn index<C: Write>(&self, conn: &mut C) -> Result<Status, HttpError> {
        let mut fs = self.fs.lock().await;
        if fs.exists(INDEX_PATH) {
            return send_file(&mut *fs, conn, INDEX_PATH).await;
        }
        drop(fs);
        reply(conn, Status::Ok, "text/html", FALLBACK_PAGE.as_bytes()).await
    }

    async fn asset<C: Write>(&self, conn: &mut C, path: &str) -> Result<Status, HttpError> {
        let mut full: String<PATH_MAX> = String::new();
        if path.split('/').any(|part| part == "..") || write!(full, "{WWW_DIR}{path}").is_err() {
            return reply(conn, Status::NotFound, TEXT, b"Not found").await;
        }
        let mut fs = self.fs.lock().await;
        send_file(&mut *fs, conn, &full).await
    }

    async fn list_files<C: Write>(&self, conn: &mut C) -> Result<Status, HttpError> {
        let listing = {
            let mut fs = self.fs.lock().await;
            listing_json(&mut *fs)
        };
        match listing {
            Ok(json) => reply(conn, Status::Ok, "application/json", &json).await,
            Err(e) => {
                error!("[HTTP] File listing failed: {e}");
                reply(conn, Status::InternalError, TEXT, b"Listing failed").await
            }
        }
    }

    async fn format<C: Write>(&self, conn: &mut C) -> Result<Status, HttpError> {
        let result = self.fs.lock().await.format_and_mount();
        match result {
            Ok(()) => {
                info!("[HTTP] Filesystem formatted");
                reply(conn, Status::Ok, TEXT, b"Filesystem formatted").await
            }
            Err(e) => {
                error!("[HTTP] Format failed: {e}");
                reply(conn, Status::InternalError, TEXT, b"Format failed").await
            }
        }
    }

    /// Store the `file` part under the uploads directory, then move it to
    /// the web root if `overwrite_html` was `true`.
    async fn upload<R: Read>(
        &self,
        content_type: Option<&str>,
        body: R,
    ) -> Result<&'static str, HttpError> {
        let Some(boundary) = content_type.and_then(multipart::boundary) else {
            warn!("[HTTP] Upload without a multipart boundary");
            return Err(HttpError::BadMultipart);
        };
        let mut parts = Multipart::new(body, boundary)?;
        let mut fs = self.fs.lock().await;

        let mut stored: Option<String<NAME_MAX>> = None;
        let mut overwrite_html = false;
        while let Some(part) = parts.next_part().await? {
            match part.name.as_str() {
                "file" => {
                    let Some(name) = part.filename.as_deref().and_then(basename) else {
                        warn!("[HTTP] File part without a filename");
                        return Err(HttpError::BadMultipart);
                    };
                    let path = join(UPLOADS_DIR, name)?;
                    let written = store(&mut *fs, &path, &mut parts).await?;
                    info!("[HTTP] Stored {path} ({written} bytes)");
                    stored = Some(
                        String::try_from(name).map_err(|_| StorageError::Fs(FsError::NameTooLong))?,
                    );
                }
                "overwrite_html" => {
                    let mut value = [0u8; 8];
                    overwrite_html = parts.read_to_end(&mut value).await? == b"true";
                }
                other => debug!("[HTTP] Ignoring form field {other}"),
            }
        }

        let Some(name) = stored else {
            warn!("[HTTP] Upload without a file part");
            return Err(HttpError::BadMultipart);
        };
        if overwrite_html {
            let from = join(UPLOADS_DIR, &name)?;
            let to = join(WWW_DIR, &name)?;
            fs.rename(&from, &to)?;
            info!("[HTTP] Moved {from} to {to}");
        }
        Ok("File uploaded")
    }

    async fn set_time<R: Read>(&self, mut body: R) -> Result<&'static str, HttpError> {
        let mut buf = [0u8; MAX_TIME_BODY];
        let mut len = 0;
        loop {
            if len == buf.len() {
                return Err(HttpError::BadRequest);
            }
            let n = body.read(&mut buf[len..]).await.map_err(HttpError::io)?;
            if n == 0 {
                break;
            }
            len += n;
        }

        let (text, _) =
            serde_json_core::from_slice::<&str>(&buf[..len]).map_err(|_| HttpError::BadRequest)?;
        let Some(time) = DateTime::parse_iso8601(text) else {
            warn!("[HTTP] Unparseable time {text:?}");
            return Err(HttpError::BadRequest);
        };
        info!("[HTTP] Time update to {text}");
        self.time.signal(time);
        Ok("Time updated")
    }
}

/// Answer a handler outcome. Connection failures are passed up; everything
/// else becomes a 500.
async fn finish<C: Write>(
    conn: &mut C,
    outcome: Result<&'static str, HttpError>,
) -> Result<Status, HttpError> {
    match outcome {
        Ok(message) => reply(conn, Status::Ok, TEXT, message.as_bytes()).await,
        Err(e @ (HttpError::Io(_) | HttpError::Closed)) => Err(e),
        Err(e) => {
            error!("[HTTP] Request failed: {e}");
            reply(conn, Status::InternalError, TEXT, b"Request failed").await
        }
    }
}

async fn store<R: Read, S: Storage>(
    fs: &mut FlashFs<S>,
    path: &str,
    parts: &mut Multipart<R>,
) -> Result<usize, HttpError> {
    let file = fs.open(path, OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC)?;
    if file.after_reformat() {
        warn!("[HTTP] Volume was reformatted to open {path}");
    }
    let copied = copy_part(fs, &file, parts).await;
    let closed = fs.close(file);
    let written = copied?;
    closed?;
    Ok(written)
}

async fn copy_part<R: Read, S: Storage>(
    fs: &mut FlashFs<S>,
    file: &FileHandle,
    parts: &mut Multipart<R>,
) -> Result<usize, HttpError> {
    let mut chunk = [0u8; CHUNK];
    let mut total = 0;
    loop {
        let n = parts.read(&mut chunk).await?;
        if n == 0 {
            return Ok(total);
        }
        fs.write(file, &chunk[..n])?;
        total += n;
    }
}

async fn send_file<C: Write, S: Storage>(
    fs: &mut FlashFs<S>,
    conn: &mut C,
    path: &str,
) -> Result<Status, HttpError> {
    match fs.stat(path) {
        Ok(meta) if meta.kind == FileKind::File => {}
        Ok(_) | Err(StorageError::Fs(FsError::NoEntry | FsError::NotDir)) => {
            debug!("[HTTP] No such asset {path}");
            return reply(conn, Status::NotFound, TEXT, b"Not found").await;
        }
        Err(e) => {
            error!("[HTTP] Failed to stat {path}: {e}");
            return reply(conn, Status::InternalError, TEXT, b"Read failed").await;
        }
    }
    let file = match fs.open(path, OpenFlags::READ) {
        Ok(file) => file,
        Err(e) => {
            error!("[HTTP] Failed to open {path}: {e}");
            return reply(conn, Status::InternalError, TEXT, b"Read failed").await;
        }
    };
    let sent = stream_file(fs, &file, conn, content_type(path)).await;
    if let Err(e) = fs.close(file) {
        warn!("[HTTP] Failed to close {path}: {e}");
    }
    sent
}

async fn stream_file<C: Write, S: Storage>(
    fs: &mut FlashFs<S>,
    file: &FileHandle,
    conn: &mut C,
    content_type: &str,
) -> Result<Status, HttpError> {
    write_head(conn, Status::Ok, content_type, None).await?;
    let mut chunk = [0u8; CHUNK];
    loop {
        let n = fs.read(file, &mut chunk)?;
        if n == 0 {
            break;
        }
        write_chunk(conn, &chunk[..n]).await?;
    }
    conn.write_all(b"0\r\n\r\n").await.map_err(HttpError::io)?;
    Ok(Status::Ok)
}

fn listing_json<S: Storage>(fs: &mut FlashFs<S>) -> Result<Vec<u8>, HttpError> {
    let mut entries = Vec::new();
    fs.list_tree(|depth, entry| entries.push((depth, entry.clone())))?;

    let mut tree: Vec<FileNode<'_>> = Vec::new();
    for (depth, entry) in &entries {
        let node = FileNode::from(entry);
        if *depth == 0 {
            tree.push(node);
        } else if let Some(children) = tree.last_mut().and_then(|dir| dir.children.as_mut()) {
            children.push(node);
        }
    }

    let mut out = vec![0u8; 1024];
    loop {
        match serde_json_core::to_slice(&tree, &mut out) {
            Ok(len) => {
                out.truncate(len);
                return Ok(out);
            }
            Err(serde_json_core::ser::Error::BufferFull) if out.len() < MAX_LISTING => {
                out.resize(out.len() * 2, 0);
            }
            Err(_) => return Err(HttpError::ResponseTooLarge),
        }
    }
}

fn basename(name: &str) -> Option<&str> {
    let base = name.rsplit(|c| c == '/' || c == '\\').next()?;
    (!base.is_empty() && base != "." && base != "..").then_some(base)
}

fn join(dir: &str, name: &str) -> Result<String<PATH_MAX>, HttpError> {
    let mut path = String::new();
    write!(path, "{dir}/{name}").map_err(|_| StorageError::Fs(FsError::NameTooLong))?;
    Ok(path)
}

fn content_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map_or("", |(_, ext)| ext);
    match ext {
        "html" | "htm" => "text/html",
        "js" => "application/javascript",
        "css" => "text/css",
        "json" => "application/json",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

async fn write_head<C: Write>(
    conn: &mut C,
    status: Status,
    content_type: &str,
    length: Option<usize>,
) -> Result<(), HttpError> {
    let mut head: String<160> = String::new();
    let framed = match length {
        Some(len) => write!(
            head,
            "HTTP/1.1 {} {}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n",
            status.code(),
            status.reason()
        ),
        None => write!(
            head,
            "HTTP/1.1 {} {}\r\nContent-Type: {content_type}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            status.code(),
            status.reason()
        ),
    };
    framed.map_err(|_| HttpError::ResponseTooLarge)?;
    conn.write_all(head.as_bytes()).await.map_err(HttpError::io)
}

async fn write_chunk<C: Write>(conn: &mut C, data: &[u8]) -> Result<(), HttpError> {
    let mut size: String<12> = String::new();
    write!(size, "{:X}\r\n", data.len()).map_err(|_| HttpError::ResponseTooLarge)?;
    conn.write_all(size.as_bytes()).await.map_err(HttpError::io)?;
    conn.write_all(data).await.map_err(HttpError::io)?;
    conn.write_all(b"\r\n").await.map_err(HttpError::io)
}

async fn reply<C: Write>(
    conn: &mut C,
    status: Status,
    content_type: &str,
    body: &[u8],
) -> Result<Status, HttpError> {
    write_head(conn, status, content_type, Some(body.len())).await?;
    conn.write_all(body).await.map_err(HttpError::io)?;
    Ok(status)
}
