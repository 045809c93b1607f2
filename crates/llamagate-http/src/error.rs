use thiserror::Error;

/// Failures while reading or writing raw HTTP/1.1 messages.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The peer closed the connection before a complete message arrived.
    #[error("connection closed after {received} bytes before the message was complete")]
    Incomplete { received: usize },

    /// The accumulated message exceeded the configured cap.
    #[error("message exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("malformed start line: {0}")]
    StartLine(String),

    #[error("malformed header: {0}")]
    Header(String),

    #[error("invalid Content-Length: {0}")]
    ContentLength(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HttpError {
    /// Whether the peer simply went away, as opposed to sending garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            HttpError::Incomplete { .. } => true,
            HttpError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, HttpError>;
