pub mod http;
pub mod multipart;
pub mod request;

use embedded_io_async::ErrorKind;

use crate::mem::fs::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("connection closed")]
    Closed,
    #[error("connection error: {0:?}")]
    Io(ErrorKind),
    #[error("request head too large")]
    HeadTooLarge,
    #[error("malformed request")]
    BadRequest,
    #[error("malformed multipart body")]
    BadMultipart,
    #[error("response too large")]
    ResponseTooLarge,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl HttpError {
    pub(crate) fn io<E: embedded_io_async::Error>(e: E) -> Self {
        HttpError::Io(e.kind())
    }
}
